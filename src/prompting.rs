use minijinja::{context, Environment};

use crate::flow::ValidationFailure;
use crate::types::ExpectedResponse;

const VALIDATION_ERROR_TEMPLATE: &str = include_str!("prompts/validation_error.j2");

pub const RETRIES_EXHAUSTED_NOTICE: &str =
    "Too many invalid replies. This conversation has ended; send a new message to start again.";

pub struct ValidationPromptContext<'a> {
    pub failure: &'a ValidationFailure,
    pub expected: &'a ExpectedResponse,
    /// Replies still accepted before the conversation is abandoned.
    pub retries_left: Option<u32>,
}

fn choice_labels(expected: &ExpectedResponse) -> Vec<String> {
    expected
        .choices
        .iter()
        .map(|choice| {
            let label = choice.label.trim();
            if label.is_empty() || label.eq_ignore_ascii_case(choice.value.trim()) {
                choice.value.trim().to_string()
            } else {
                format!("{} ({})", choice.value.trim(), label)
            }
        })
        .collect()
}

/// Re-prompt sent after an invalid reply. A configured `errorMessage` wins.
pub fn render_validation_error(ctx: &ValidationPromptContext<'_>) -> String {
    if let Some(custom) = ctx
        .expected
        .error_message
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
    {
        return custom.to_string();
    }

    let mut env = Environment::new();
    if env
        .add_template("validation_error", VALIDATION_ERROR_TEMPLATE)
        .is_err()
    {
        return fallback_validation_error(ctx);
    }
    let Ok(template) = env.get_template("validation_error") else {
        return fallback_validation_error(ctx);
    };

    let (min_length, max_length) = match ctx.failure {
        ValidationFailure::TooShort { min } => (Some(*min), None),
        ValidationFailure::TooLong { max } => (None, Some(*max)),
        _ => (None, None),
    };
    template
        .render(context! {
            kind => ctx.failure.kind(),
            choices => choice_labels(ctx.expected),
            min_length => min_length,
            max_length => max_length,
            retries_left => ctx.retries_left,
        })
        .map(|text| text.trim().to_string())
        .unwrap_or_else(|_| fallback_validation_error(ctx))
}

fn fallback_validation_error(ctx: &ValidationPromptContext<'_>) -> String {
    let mut text = match ctx.failure {
        ValidationFailure::NotAChoice => format!(
            "Please reply with one of the options: {}.",
            choice_labels(ctx.expected).join(", ")
        ),
        ValidationFailure::Required => "A reply is required to continue.".to_string(),
        ValidationFailure::TooShort { min } => {
            format!("Your reply is too short. Please use at least {min} characters.")
        }
        ValidationFailure::TooLong { max } => {
            format!("Your reply is too long. Please keep it under {max} characters.")
        }
        ValidationFailure::PatternMismatch => {
            "That doesn't look right. Please check the format and try again.".to_string()
        }
        ValidationFailure::NotANumber => "Please reply with a number.".to_string(),
        ValidationFailure::NotAnEmail => {
            "Please reply with a valid email address (like name@example.com).".to_string()
        }
        ValidationFailure::NotAPhone => "Please reply with a valid phone number.".to_string(),
        ValidationFailure::MissingMedia => "Please send a file or photo.".to_string(),
    };
    if let Some(left) = ctx.retries_left {
        let noun = if left == 1 { "attempt" } else { "attempts" };
        text.push_str(&format!(" ({left} {noun} left)"));
    }
    text
}
