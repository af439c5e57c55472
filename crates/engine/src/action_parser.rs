//! Parser for text-marker actions such as
//! `click(start_box='<point>892 351</point>')`.
//!
//! Models emitting this format are sloppy: closing quotes and parentheses go
//! missing, coordinates come in several notations. Parsing runs a cascade of
//! patterns from strict to permissive. Call sites that need certainty (the
//! streaming commit) only accept strict matches.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Start of an action line, optionally labelled `Action:`.
static MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(Action:[ \t]*)?([A-Za-z_][A-Za-z0-9_.]*)\(").expect("valid regex")
});

/// Call-level cascade: closed call, missing closing paren, bare name.
static CALL_CLOSED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*([A-Za-z_][A-Za-z0-9_.]*)\s*\((.*)\)\s*$").expect("valid regex")
});
static CALL_UNCLOSED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*([A-Za-z_][A-Za-z0-9_.]*)\s*\((.*)$").expect("valid regex")
});
static CALL_BARE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_.]*)\s*$").expect("valid regex"));

/// Param-level cascade.
static PARAM_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*=\s*").expect("valid regex")
});
static VALUE_SINGLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^'((?:[^'\\]|\\.)*)'").expect("valid regex"));
static VALUE_DOUBLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)^"((?:[^"\\]|\\.)*)""#).expect("valid regex"));
static VALUE_SINGLE_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^'(.*)$").expect("valid regex"));
static VALUE_DOUBLE_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)^"(.*)$"#).expect("valid regex"));
static VALUE_BARE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^,]*)").expect("valid regex"));

static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("valid regex"));

static REFLECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)Reflection:\s*(.*?)\s*(?:Action_Summary:|Thought:|Action:|$)").expect("valid regex")
});
static THOUGHT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)Thought:\s*(.*?)\s*(?:Action:|$)").expect("valid regex")
});

/// Divisors that map model-space coordinates into `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleFactors {
    pub width: f64,
    pub height: f64,
}

impl Default for ScaleFactors {
    fn default() -> Self {
        Self {
            width: 1000.0,
            height: 1000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    pub action_type: String,
    pub action_inputs: BTreeMap<String, String>,
}

/// An action marker located in a text buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerSpan {
    /// Line start; prose before this offset is user-visible.
    pub line_start: usize,
    /// Start of the action name.
    pub call_start: usize,
}

/// Which unlabelled `name(` lines count as actions. Labelled lines always do.
#[derive(Debug, Clone, Copy)]
pub enum BareCalls<'a> {
    /// Only calls to these tools.
    Known(&'a [String]),
    /// Any call once an `Action:` line has been seen.
    AfterLabel,
}

impl BareCalls<'_> {
    fn accepts(&self, name: &str, labelled_before: bool) -> bool {
        match self {
            Self::Known(names) => names.iter().any(|known| known == name),
            Self::AfterLabel => labelled_before,
        }
    }
}

pub fn find_markers(text: &str, bare: BareCalls<'_>) -> Vec<MarkerSpan> {
    let mut labelled_before = false;
    MARKER
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let name = caps.get(2)?;
            let labelled = caps.get(1).is_some();
            if !labelled && !bare.accepts(name.as_str(), labelled_before) {
                return None;
            }
            labelled_before |= labelled;
            Some(MarkerSpan {
                line_start: whole.start(),
                call_start: name.start(),
            })
        })
        .collect()
}

/// Parse one action call, tolerating a missing closing quote or paren.
pub fn parse_action(text: &str, factors: &ScaleFactors) -> Option<ParsedAction> {
    parse_call(text, factors).map(|(action, _)| action)
}

/// Parse one action call, accepting only well-formed syntax.
pub fn parse_action_strict(text: &str, factors: &ScaleFactors) -> Option<ParsedAction> {
    parse_call(text, factors).and_then(|(action, strict)| strict.then_some(action))
}

/// Parse a full prediction: optional `Reflection:` and `Thought:` sections
/// followed by one or more actions.
pub fn parse_prediction(text: &str, factors: &ScaleFactors) -> Vec<ParsedAction> {
    let reflection = REFLECTION
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|s| !s.is_empty());
    let thought = THOUGHT
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|s| !s.is_empty());

    action_segments(text, BareCalls::AfterLabel)
        .into_iter()
        .filter_map(|segment| parse_action(segment, factors))
        .map(|mut action| {
            action.reflection = reflection.clone();
            action.thought = thought.clone();
            action
        })
        .collect()
}

/// Text of each action call, from its name up to the next marker line.
pub fn action_segments<'t>(text: &'t str, bare: BareCalls<'_>) -> Vec<&'t str> {
    let markers = find_markers(text, bare);
    markers
        .iter()
        .enumerate()
        .map(|(i, marker)| {
            let end = markers.get(i + 1).map_or(text.len(), |next| next.line_start);
            text[marker.call_start..end].trim()
        })
        .collect()
}

/// Returns the action and whether every level matched its strict pattern.
fn parse_call(text: &str, factors: &ScaleFactors) -> Option<(ParsedAction, bool)> {
    let text = text.trim();
    let (name, args, mut strict) = if let Some(caps) = CALL_CLOSED.captures(text) {
        (caps.get(1)?.as_str(), caps.get(2)?.as_str(), true)
    } else if let Some(caps) = CALL_UNCLOSED.captures(text) {
        (caps.get(1)?.as_str(), caps.get(2)?.as_str(), false)
    } else if let Some(caps) = CALL_BARE.captures(text) {
        (caps.get(1)?.as_str(), "", false)
    } else {
        return None;
    };

    let (params, params_strict) = parse_params(args);
    strict &= params_strict;

    let mut action_inputs = BTreeMap::new();
    for (key, value) in params {
        let (key, value) = normalize_param(&key, value, factors);
        action_inputs.insert(key, value);
    }

    Some((
        ParsedAction {
            reflection: None,
            thought: None,
            action_type: name.to_string(),
            action_inputs,
        },
        strict,
    ))
}

fn parse_params(args: &str) -> (Vec<(String, String)>, bool) {
    let mut params = Vec::new();
    let mut strict = true;
    let mut rest = args.trim_start();

    while !rest.is_empty() {
        let Some(key_match) = PARAM_KEY.captures(rest) else {
            // Trailing junk that is not `key=value`.
            strict = false;
            break;
        };
        let (Some(whole), Some(key)) = (key_match.get(0), key_match.get(1)) else {
            break;
        };
        let key = key.as_str().to_string();
        rest = &rest[whole.end()..];

        let (value, consumed, value_strict) = parse_value(rest);
        strict &= value_strict;
        params.push((key, value));
        rest = rest[consumed..].trim_start();

        match rest.strip_prefix(',') {
            Some(after) => rest = after.trim_start(),
            None => {
                if !rest.is_empty() {
                    strict = false;
                }
                break;
            }
        }
    }

    (params, strict)
}

/// Returns the decoded value, the bytes consumed and whether it was well formed.
fn parse_value(text: &str) -> (String, usize, bool) {
    for (pattern, strict, quoted) in [
        (&*VALUE_SINGLE, true, true),
        (&*VALUE_DOUBLE, true, true),
        (&*VALUE_SINGLE_OPEN, false, true),
        (&*VALUE_DOUBLE_OPEN, false, true),
        (&*VALUE_BARE, true, false),
    ] {
        if let Some(caps) = pattern.captures(text) {
            let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let value = if quoted {
                decode_escapes(inner.as_str())
            } else {
                inner.as_str().trim().to_string()
            };
            return (value, whole.end(), strict);
        }
    }
    (String::new(), text.len(), false)
}

/// Decode the escapes models use inside quoted values.
pub fn decode_escapes(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Inverse of [`decode_escapes`] for single-quoted values.
pub fn encode_escapes(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

fn normalize_param(key: &str, value: String, factors: &ScaleFactors) -> (String, String) {
    let key = match key {
        "point" | "start_point" => "start_box",
        "end_point" => "end_box",
        other => other,
    };
    if matches!(key, "start_box" | "end_box")
        && let Some(normalized) = normalize_coordinates(&value, factors)
    {
        return (key.to_string(), normalized);
    }
    (key.to_string(), value)
}

/// Normalize `<point>x y</point>`, `<bbox>x1 y1 x2 y2</bbox>`, `(x,y)` or
/// `[x,y]` into `"[x/W,y/H]"` ratios. Returns `None` unless the value holds
/// exactly two or four numbers.
pub fn normalize_coordinates(value: &str, factors: &ScaleFactors) -> Option<String> {
    let numbers: Vec<f64> = NUMBER
        .find_iter(value)
        .filter_map(|m| m.as_str().parse::<f64>().ok())
        .collect();
    if numbers.len() != 2 && numbers.len() != 4 {
        return None;
    }
    let ratios: Vec<String> = numbers
        .iter()
        .enumerate()
        .map(|(i, n)| {
            let divisor = if i % 2 == 0 { factors.width } else { factors.height };
            let ratio = if divisor == 0.0 { *n } else { n / divisor };
            format_ratio(ratio)
        })
        .collect();
    Some(format!("[{}]", ratios.join(",")))
}

fn format_ratio(ratio: f64) -> String {
    let rounded = (ratio * 10_000.0).round() / 10_000.0;
    format!("{rounded}")
}
