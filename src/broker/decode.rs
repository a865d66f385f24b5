use serde_json::Value;
use tracing::debug;

use crate::error::AttemptError;

/// Turns a raw model reply into JSON, repairing the usual LLM damage
/// (code fences, chatter around the payload, unquoted keys and values, single quotes,
/// trailing commas, Python literals, truncated output) when strict parsing
/// fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuredDecoder;

impl StructuredDecoder {
    pub fn new() -> Self {
        Self
    }

    pub fn decode(&self, raw: &str) -> Result<Value, AttemptError> {
        let text = raw.trim();
        if text.is_empty() {
            return Err(AttemptError::Decode("empty reply".to_string()));
        }

        // 1. Well-formed JSON, any value
        if let Ok(value) = serde_json::from_str::<Value>(text) {
            return Ok(value);
        }

        // 2. Markdown code blocks
        let unfenced = strip_code_fences(text);
        if unfenced != text {
            debug!("Removed markdown code blocks, trying to parse: {}", unfenced);
            if let Ok(value) = serde_json::from_str::<Value>(&unfenced) {
                return Ok(value);
            }
        }

        // 3. Object or array embedded in surrounding text
        let candidate = extract_structure(&unfenced)
            .ok_or_else(|| AttemptError::Decode("no JSON object or array in reply".to_string()))?;
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            return Ok(value);
        }

        // 4. Lenient repair
        let repaired = repair(candidate);
        debug!("Repaired reply, trying to parse: {}", repaired);
        match serde_json::from_str::<Value>(&repaired) {
            Ok(value) if value.is_object() || value.is_array() => Ok(value),
            Ok(_) => Err(AttemptError::Decode("repaired reply is not an object or array".to_string())),
            Err(e) => Err(AttemptError::Decode(format!("unrepairable reply: {}", e))),
        }
    }
}

fn strip_code_fences(text: &str) -> String {
    let Some(start) = text.find("```") else {
        return text.to_string();
    };

    let after = &text[start + 3..];
    let body = match after.find('\n') {
        Some(newline) => &after[newline + 1..],
        None => after.trim_start_matches("json"),
    };
    let body = match body.find("```") {
        Some(end) => &body[..end],
        None => body,
    };
    body.trim().to_string()
}

/// Slice from the first `{`/`[` to its last possible closer, or to the end
/// when the reply was cut off.
fn extract_structure(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let closer = if text[start..].starts_with('{') { '}' } else { ']' };
    match text.rfind(closer) {
        Some(end) if end > start => Some(&text[start..=end]),
        _ => Some(&text[start..]),
    }
}

fn repair(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 16);
    let mut closers: Vec<char> = Vec::new();
    // Byte offset in `out` where the current member of each open container starts
    let mut members: Vec<usize> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' | '\'' => {
                i = copy_string(&chars, i, &mut out);
            }
            '{' | '[' => {
                closers.push(if c == '{' { '}' } else { ']' });
                out.push(c);
                members.push(out.len());
                i += 1;
            }
            '}' | ']' => {
                trim_trailing_comma(&mut out);
                if closers.last() == Some(&c) {
                    closers.pop();
                    members.pop();
                }
                out.push(c);
                i += 1;
            }
            ',' => {
                out.push(c);
                if let Some(member) = members.last_mut() {
                    *member = out.len();
                }
                i += 1;
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '$' | '-')) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();

                let mut next = i;
                while next < chars.len() && chars[next].is_whitespace() {
                    next += 1;
                }
                let is_key = next < chars.len() && chars[next] == ':' && closers.last() == Some(&'}');

                if is_key {
                    out.push('"');
                    out.push_str(&word);
                    out.push('"');
                } else if let Some(literal) = json_literal(&word) {
                    out.push_str(literal);
                } else if closers.is_empty() || out.ends_with(|ch: char| ch.is_ascii_digit() || ch == '.') {
                    // Outside any container, or an exponent like the `e5` in `1e5`
                    out.push_str(&word);
                } else {
                    // Unquoted string value runs to the next delimiter
                    let mut end = start;
                    while end < chars.len() && !matches!(chars[end], ',' | '}' | ']' | '\n') {
                        end += 1;
                    }
                    let phrase: String = chars[start..end].iter().collect();
                    out.push_str(&Value::String(phrase.trim().to_string()).to_string());
                    i = end;
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    trim_trailing_comma(&mut out);
    while let Some(closer) = closers.pop() {
        let member = members.pop();
        if closer == '}' {
            if let Some(start) = member {
                drop_dangling_key(&mut out, start);
            }
        }
        trim_trailing_comma(&mut out);
        out.push(closer);
    }
    out
}

fn json_literal(word: &str) -> Option<&'static str> {
    match word {
        "true" | "True" => Some("true"),
        "false" | "False" => Some("false"),
        "null" | "None" => Some("null"),
        _ => None,
    }
}

/// Remove an object member cut off after its key (`"key"` or `"key":`)
fn drop_dangling_key(out: &mut String, member_start: usize) {
    let tail = out[member_start..].trim();
    let key = tail.strip_suffix(':').unwrap_or(tail).trim_end();
    if !key.is_empty() && serde_json::from_str::<String>(key).is_ok() {
        out.truncate(member_start);
    }
}

/// Copy a single- or double-quoted string starting at `start` as a valid
/// JSON string; returns the index just past the closing quote.
fn copy_string(chars: &[char], start: usize, out: &mut String) -> usize {
    let quote = chars[start];
    let mut i = start + 1;
    out.push('"');

    while i < chars.len() {
        let c = chars[i];
        if c == '\\' && i + 1 < chars.len() {
            let escaped = chars[i + 1];
            if escaped == '\'' {
                out.push('\'');
            } else {
                out.push('\\');
                out.push(escaped);
            }
            i += 2;
            continue;
        }
        if c == quote {
            out.push('"');
            return i + 1;
        }
        match c {
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
        i += 1;
    }

    // Unterminated
    out.push('"');
    i
}

fn trim_trailing_comma(out: &mut String) {
    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    if out.ends_with(',') {
        out.pop();
    }
}
