//! Lenient scanning over JSON that may still be arriving.

use std::str::Chars;

use serde_json::{Map, Value};

/// The span from the first `{` to the last `}`, if both exist in that order.
pub fn outermost_object_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Parse the outermost `{...}` span as a JSON object.
pub fn parse_outermost_object(text: &str) -> Option<Map<String, Value>> {
    let span = outermost_object_span(text)?;
    match serde_json::from_str::<Value>(span) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Value of the top-level string field `key`, decoded up to its closing
/// quote or, if the string is still streaming, up to the end of the text.
///
/// Keys of nested objects never match. Returns `None` until the opening
/// quote of the value has arrived.
pub fn partial_string_field(text: &str, key: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'{' | b'[' => depth += 1,
            b'}' | b']' => depth = depth.saturating_sub(1),
            b'"' => {
                let end = string_end(bytes, i + 1)?;
                let is_key = depth == 1 && &text[i + 1..end] == key;
                i = end + 1;
                if is_key && let Some(rest) = text[i..].trim_start().strip_prefix(':') {
                    return rest.trim_start().strip_prefix('"').map(decode_partial_string);
                }
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Index of the quote closing a string whose body starts at `start`.
fn string_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut i = start;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

/// Four hex digits of a `\u` escape. Malformed digits decode as U+FFFD.
fn hex_unit(chars: &mut Chars<'_>) -> Option<u32> {
    let hex: String = chars.by_ref().take(4).collect();
    if hex.chars().count() < 4 {
        return None;
    }
    Some(u32::from_str_radix(&hex, 16).unwrap_or(0xfffd))
}

/// Decode a JSON string body, stopping at the first unescaped quote.
/// Trailing incomplete escapes are dropped.
fn decode_partial_string(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => break,
            '\\' => match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some('b') => out.push('\u{8}'),
                Some('f') => out.push('\u{c}'),
                Some('u') => {
                    let Some(unit) = hex_unit(&mut chars) else {
                        break;
                    };
                    let decoded = if (0xd800..0xdc00).contains(&unit) {
                        // A high surrogate only means something with its low half.
                        let mut ahead = chars.clone();
                        match (ahead.next(), ahead.next()) {
                            (Some('\\'), Some('u')) => match hex_unit(&mut ahead) {
                                Some(low) if (0xdc00..0xe000).contains(&low) => {
                                    chars = ahead;
                                    char::from_u32(0x10000 + ((unit - 0xd800) << 10) + (low - 0xdc00))
                                }
                                Some(_) => None,
                                None => break,
                            },
                            (None, _) | (Some('\\'), None) => break,
                            _ => None,
                        }
                    } else {
                        char::from_u32(unit)
                    };
                    out.push(decoded.unwrap_or('\u{fffd}'));
                }
                Some(other) => out.push(other),
                None => break,
            },
            other => out.push(other),
        }
    }
    out
}
