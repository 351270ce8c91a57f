//! Raw RFC 5322 header parsing.
//!
//! The structured `email_parser::Email` view covers the fields most
//! callers want (subject, from, body), but the rule engine in
//! [`crate::rules`] matches against arbitrary header names pulled
//! straight off the wire (`List-Unsubscribe`, `Precedence`, ...). This
//! module extracts a flat name/value map from a raw message so the
//! rule engine never depends on the structured parser knowing about a
//! given header.

use std::collections::HashMap;

/// Parse the header block of a raw RFC 5322 message into a
/// case-preserving name/value map. Folded (continuation) lines are
/// joined onto the previous header with a single space. Only the
/// first value for a repeated header name is kept, matching the
/// "most specific" convention used by `email.message_from_bytes` in
/// the reference implementation.
#[must_use]
pub fn parse_headers(raw: &[u8]) -> HashMap<String, String> {
    let text = String::from_utf8_lossy(raw);
    let header_block = match text.find("\r\n\r\n").or_else(|| text.find("\n\n")) {
        Some(idx) => &text[..idx],
        None => &text,
    };

    let mut headers = HashMap::new();
    let mut current: Option<(String, String)> = None;

    for line in header_block.lines() {
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = current.as_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }

        if let Some((name, value)) = current.take() {
            headers.entry(name).or_insert(value);
        }

        if let Some((name, value)) = line.split_once(':') {
            current = Some((name.trim().to_string(), value.trim().to_string()));
        }
    }
    if let Some((name, value)) = current {
        headers.entry(name).or_insert(value);
    }

    headers
}
