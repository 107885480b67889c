use regex::RegexBuilder;
use tracing::warn;

use crate::types::{Flow, FlowNode, InboundMessage, TriggerConfig};

/// First trigger node of `flow` (declaration order) that fires for `message`.
///
/// Pure: reads the flow and the message only.
pub fn match_trigger<'a>(flow: &'a Flow, message: &InboundMessage) -> Option<&'a FlowNode> {
    flow.trigger_nodes()
        .find(|(_, config)| trigger_matches(config, message))
        .map(|(node, _)| node)
}

pub fn trigger_matches(config: &TriggerConfig, message: &InboundMessage) -> bool {
    let body = message.body.trim().to_lowercase();
    match config {
        TriggerConfig::TextEquals { text } => body == text.trim().to_lowercase(),
        TriggerConfig::Contains { text } => {
            non_empty_needle(text).is_some_and(|needle| body.contains(&needle))
        }
        TriggerConfig::StartsWith { text } => {
            non_empty_needle(text).is_some_and(|needle| body.starts_with(&needle))
        }
        TriggerConfig::EndsWith { text } => {
            non_empty_needle(text).is_some_and(|needle| body.ends_with(&needle))
        }
        TriggerConfig::TextRegex { pattern, flags } => {
            regex_matches(pattern, flags.as_deref().unwrap_or("i"), &message.body)
        }
        TriggerConfig::AnyMessage {} => true,
        TriggerConfig::MediaReceived { media_type } => match &message.attachment {
            None => false,
            Some(attachment) => media_type
                .as_deref()
                .map(str::trim)
                .filter(|wanted| !wanted.is_empty())
                .map_or(true, |wanted| {
                    wanted.eq_ignore_ascii_case(attachment.media_type.trim())
                }),
        },
    }
}

fn non_empty_needle(text: &str) -> Option<String> {
    let needle = text.trim().to_lowercase();
    (!needle.is_empty()).then_some(needle)
}

/// Compiles `pattern` with JS-style flags. Unknown flags (`g`, `u`, `y`) are ignored.
fn regex_matches(pattern: &str, flags: &str, text: &str) -> bool {
    let mut builder = RegexBuilder::new(pattern);
    for flag in flags.chars() {
        match flag {
            'i' => {
                builder.case_insensitive(true);
            }
            'm' => {
                builder.multi_line(true);
            }
            's' => {
                builder.dot_matches_new_line(true);
            }
            _ => {}
        }
    }
    match builder.build() {
        Ok(re) => re.is_match(text),
        Err(err) => {
            warn!(pattern, error = %err, "invalid trigger regex; treating as non-match");
            false
        }
    }
}
