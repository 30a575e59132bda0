//! `{{placeholder}}` expansion for agent instructions and introductions.

use std::collections::HashMap;
use tracing::debug;

/// Expand `{{name}}` placeholders from `vars`.
///
/// Whitespace inside the braces is ignored. Unknown placeholders expand to
/// nothing. An unterminated `{{` is copied through verbatim.
pub fn render(template: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let key = after[..end].trim();
        match vars.get(key) {
            Some(value) => out.push_str(value),
            None => debug!(placeholder = key, "unknown template placeholder"),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}
