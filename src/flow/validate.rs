use regex::Regex;
use tracing::warn;

use crate::types::{ExpectedResponse, InboundMessage, ResponseChoice, ResponseType};

/// Why a reply was rejected. Drives the re-prompt text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    Required,
    TooShort { min: usize },
    TooLong { max: usize },
    PatternMismatch,
    NotAChoice,
    NotANumber,
    NotAnEmail,
    NotAPhone,
    MissingMedia,
}

impl ValidationFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationFailure::Required => "required",
            ValidationFailure::TooShort { .. } => "too_short",
            ValidationFailure::TooLong { .. } => "too_long",
            ValidationFailure::PatternMismatch => "pattern",
            ValidationFailure::NotAChoice => "choice",
            ValidationFailure::NotANumber => "number",
            ValidationFailure::NotAnEmail => "email",
            ValidationFailure::NotAPhone => "phone",
            ValidationFailure::MissingMedia => "media",
        }
    }
}

/// Choice whose value equals the reply, ignoring case and surrounding whitespace.
pub fn match_choice<'a>(reply: &str, choices: &'a [ResponseChoice]) -> Option<&'a ResponseChoice> {
    let reply = reply.trim().to_lowercase();
    choices
        .iter()
        .find(|choice| choice.value.trim().to_lowercase() == reply)
}

/// Checks a reply in order: required, length bounds, pattern, then the type format.
pub fn validate_response(
    message: &InboundMessage,
    expected: &ExpectedResponse,
) -> Result<(), ValidationFailure> {
    let text = message.body.trim();
    let rules = &expected.validation;

    if rules.required && text.is_empty() && !message.has_media() {
        return Err(ValidationFailure::Required);
    }

    let len = text.chars().count();
    if let Some(min) = rules.min_length {
        if len < min {
            return Err(ValidationFailure::TooShort { min });
        }
    }
    if let Some(max) = rules.max_length {
        if len > max {
            return Err(ValidationFailure::TooLong { max });
        }
    }

    if let Some(pattern) = rules.pattern.as_deref().filter(|p| !p.is_empty()) {
        match Regex::new(pattern) {
            Ok(re) if !re.is_match(text) => return Err(ValidationFailure::PatternMismatch),
            Ok(_) => {}
            Err(err) => warn!(pattern, error = %err, "invalid validation pattern; skipping check"),
        }
    }

    match expected.response_type {
        ResponseType::Any | ResponseType::Text => Ok(()),
        ResponseType::Choice => match_choice(text, &expected.choices)
            .map(|_| ())
            .ok_or(ValidationFailure::NotAChoice),
        ResponseType::Number => is_number(text)
            .then_some(())
            .ok_or(ValidationFailure::NotANumber),
        ResponseType::Email => is_email(text)
            .then_some(())
            .ok_or(ValidationFailure::NotAnEmail),
        ResponseType::Phone => is_phone(text)
            .then_some(())
            .ok_or(ValidationFailure::NotAPhone),
        ResponseType::Media => message
            .has_media()
            .then_some(())
            .ok_or(ValidationFailure::MissingMedia),
    }
}

fn is_number(text: &str) -> bool {
    text.parse::<f64>().map(f64::is_finite).unwrap_or(false)
}

/// `local@domain.tld` with no whitespace and a single `@`.
fn is_email(text: &str) -> bool {
    if text.chars().any(char::is_whitespace) {
        return false;
    }
    let mut parts = text.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    let Some((host, tld)) = domain.rsplit_once('.') else {
        return false;
    };
    !local.is_empty() && !host.is_empty() && !tld.is_empty()
}

/// Optional leading `+`, then 1 to 16 digits once spaces, dashes, dots and parentheses are removed.
fn is_phone(text: &str) -> bool {
    let stripped = text
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
        .collect::<String>();
    let digits = stripped.strip_prefix('+').unwrap_or(&stripped);
    (1..=16).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit())
}
