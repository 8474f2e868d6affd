//! Defensive parsing of capability output
//!
//! Models wrap JSON in prose, markdown fences and trailing commas even when
//! asked not to. Everything here takes the raw reply, finds the first
//! bracketed array that is valid JSON once cleaned up, and reports anything
//! else as a [`CapabilityError::Parse`].

use crate::error::{Capability, CapabilityError};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Contents of the first fenced block, or the whole text when unfenced.
pub fn strip_code_fences(text: &str) -> &str {
    let Some(open) = text.find("```") else {
        return text.trim();
    };
    let after_open = &text[open + 3..];
    // Skip the info string (`json`, `text`, ...) up to the end of the line.
    let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(after_open.len());
    let body = &after_open[body_start..];
    match body.find("```") {
        Some(close) => body[..close].trim(),
        None => body.trim(),
    }
}

/// Removes commas directly followed (ignoring whitespace) by `]` or `}`,
/// leaving string literals untouched.
pub fn strip_trailing_commas(json: &str) -> String {
    let chars: Vec<char> = json.chars().collect();
    let mut out = String::with_capacity(json.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if !matches!(next, Some(']') | Some('}')) {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Byte length of the balanced `[...]` starting at the beginning of `text`.
fn balanced_array_len(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' => depth += 1,
            ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// The first bracketed region of `text` that parses as a JSON array.
pub fn first_json_array(text: &str) -> Option<Vec<Value>> {
    let body = strip_code_fences(text);
    for candidates in [body, text] {
        for (start, _) in candidates.match_indices('[') {
            let rest = &candidates[start..];
            let Some(len) = balanced_array_len(rest) else {
                continue;
            };
            let cleaned = strip_trailing_commas(&rest[..len]);
            if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(&cleaned) {
                return Some(items);
            }
        }
    }
    None
}

/// Strict: the first array must deserialize as a whole into `Vec<T>`.
pub fn parse_array<T: DeserializeOwned>(
    capability: Capability,
    text: &str,
) -> Result<Vec<T>, CapabilityError> {
    let items = first_json_array(text)
        .ok_or_else(|| CapabilityError::parse(capability, "no bracketed JSON array found"))?;
    serde_json::from_value(Value::Array(items))
        .map_err(|err| CapabilityError::parse(capability, err.to_string()))
}

/// Lenient: elements that do not deserialize into `T` are skipped.
pub fn parse_array_lenient<T: DeserializeOwned>(
    capability: Capability,
    text: &str,
) -> Result<Vec<T>, CapabilityError> {
    let items = first_json_array(text)
        .ok_or_else(|| CapabilityError::parse(capability, "no bracketed JSON array found"))?;
    let total = items.len();
    let parsed: Vec<T> = items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::debug!(%capability, error = %err, "skipping malformed array element");
                None
            }
        })
        .collect();
    if parsed.len() < total {
        tracing::debug!(%capability, kept = parsed.len(), total, "dropped malformed elements");
    }
    Ok(parsed)
}

/// Similarity score in `0..=100`.
///
/// A lone bracketed number (`[85]`) wins. Otherwise the last integer in the
/// reply is taken, skipping scale markers such as `0-100`, `/100` and
/// `out of 100`. Anything outside `0..=100` is unusable, never clamped.
pub fn parse_score(text: &str) -> Result<u8, CapabilityError> {
    let value = match bracketed_score(text) {
        Some(value) => value,
        None => last_score_token(strip_code_fences(text)).ok_or_else(|| {
            CapabilityError::parse(Capability::SimilarityScorer, "no score in reply")
        })?,
    };
    match u8::try_from(value) {
        Ok(score) if score <= 100 => Ok(score),
        _ => Err(CapabilityError::parse(
            Capability::SimilarityScorer,
            format!("score {value} outside 0..=100"),
        )),
    }
}

fn bracketed_score(text: &str) -> Option<i64> {
    match first_json_array(text)?.as_slice() {
        [Value::Number(n)] => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        _ => None,
    }
}

fn last_score_token(body: &str) -> Option<i64> {
    let bytes = body.as_bytes();
    let is_digit = |i: usize| bytes.get(i).is_some_and(u8::is_ascii_digit);
    let mut last = None;
    let mut i = 0;

    while i < bytes.len() {
        if !is_digit(i) {
            i += 1;
            continue;
        }
        let start = i;
        while is_digit(i) {
            i += 1;
        }
        let end = i;

        let before = body[..start].trim_end();
        let range_low = bytes.get(end) == Some(&b'-') && is_digit(end + 1);
        let range_high = before.ends_with('-') && start >= 2 && is_digit(start - 2);
        let denominator = before.ends_with('/') || before.to_ascii_lowercase().ends_with("out of");
        if range_low || range_high || denominator {
            continue;
        }

        // Overlong runs become out of range rather than wrapping.
        let magnitude = body[start..end].parse::<i64>().unwrap_or(i64::MAX);
        last = Some(if before.ends_with('-') { -magnitude } else { magnitude });
    }
    last
}
