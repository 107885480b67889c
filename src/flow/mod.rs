//! Flow graph evaluation: trigger matching, reply validation and the node walker.

pub mod executor;
pub mod trigger;
pub mod validate;

use std::collections::HashMap;

pub use executor::{ExecutionContext, Executor};
pub use trigger::{match_trigger, trigger_matches};
pub use validate::{match_choice, validate_response, ValidationFailure};

/// Replaces every `{{key}}` with its variable value. Unknown keys stay as written.
pub fn interpolate(text: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);
        let key = after_open[..end].trim();
        match vars.get(key) {
            Some(value) => out.push_str(value),
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after_open[end + 2..];
    }
    out.push_str(rest);
    out
}
