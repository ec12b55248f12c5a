//! Shorthand-to-XPath compilation.
//!
//! Callers rarely want to write full XPath for the common lookups, so a
//! selector string is first normalized by [`compile`]:
//!
//! | shorthand        | matches                                                   |
//! |------------------|-----------------------------------------------------------|
//! | `/…`, `./…`      | passed through unchanged                                  |
//! | `@id`            | `resource-id` equal to `id`                               |
//! | `^re`            | `text`, `content-desc` or `resource-id` matching `^re`     |
//! | `%mid%`          | `text` or `content-desc` containing `mid`                 |
//! | `%end`           | `text` or `content-desc` ending with `end`                |
//! | `start%`         | `text` or `content-desc` starting with `start`            |
//! | anything else    | `text`, `content-desc` or `resource-id` equal to the input |

use tracing::debug;

/// Quotes `value` as an XPath string literal.
///
/// XPath 1.0 has no escape sequences, so a value containing both quote
/// characters is assembled with `concat()`.
pub fn quote_literal(value: &str) -> String {
    if !value.contains('\'') {
        format!("'{value}'")
    } else if !value.contains('"') {
        format!("\"{value}\"")
    } else {
        let parts: Vec<String> = value.split('\'').map(|p| format!("'{p}'")).collect();
        format!("concat({})", parts.join(", \"'\", "))
    }
}

/// Expands a shorthand selector into a full XPath expression.
///
/// Total and deterministic: every input yields an expression, and the same
/// input always yields the same expression. Inputs that are already XPath
/// (leading `/` or `./`) are returned as-is and only validated when
/// evaluated.
pub fn compile(shorthand: &str) -> String {
    let xpath = if shorthand.starts_with('/') || shorthand.starts_with("./") {
        shorthand.to_string()
    } else if let Some(id) = shorthand.strip_prefix('@') {
        format!("//*[@resource-id={}]", quote_literal(id))
    } else if shorthand.starts_with('^') {
        let pattern = quote_literal(shorthand);
        format!(
            "//*[re:match(@text, {pattern}) or re:match(@content-desc, {pattern}) or re:match(@resource-id, {pattern})]"
        )
    } else if shorthand.len() > 1 && shorthand.starts_with('%') && shorthand.ends_with('%') {
        let inner = quote_literal(&shorthand[1..shorthand.len() - 1]);
        format!("//*[contains(@text, {inner}) or contains(@content-desc, {inner})]")
    } else if let Some(suffix) = shorthand.strip_prefix('%') {
        let quoted = quote_literal(suffix);
        let n = suffix.chars().count();
        format!(
            "//*[{quoted} = substring(@text, string-length(@text) - {n} + 1) or {quoted} = substring(@content-desc, string-length(@content-desc) - {n} + 1)]"
        )
    } else if let Some(prefix) = shorthand.strip_suffix('%') {
        let quoted = quote_literal(prefix);
        format!("//*[starts-with(@text, {quoted}) or starts-with(@content-desc, {quoted})]")
    } else {
        let quoted = quote_literal(shorthand);
        format!("//*[@text={quoted} or @content-desc={quoted} or @resource-id={quoted}]")
    };
    debug!(shorthand, xpath = %xpath, "compiled xpath");
    xpath
}
