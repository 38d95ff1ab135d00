use std::collections::HashMap;

use serde_json::Value;

/// Longest prompt text collected from a request body, in characters.
pub const PROMPT_CAPTURE_LIMIT: usize = 8192;

const MAX_DEPTH: usize = 8;
const PRIORITY_KEYS: [&str; 6] = ["prompt", "input", "inputs", "messages", "content", "data"];

/// Prompt text of a request body. JSON bodies contribute their string leaves, prompt-like
/// keys first, joined with newlines; anything else is taken as raw text.
pub fn extract_prompt_text(body: &[u8], content_type: Option<&str>) -> String {
    if body.is_empty() {
        return String::new();
    }
    let json_like = content_type.is_none_or(|value| {
        value
            .trim()
            .to_ascii_lowercase()
            .starts_with("application/json")
    });
    if json_like {
        if let Ok(payload) = serde_json::from_slice::<Value>(body) {
            let mut out = String::new();
            collect(&payload, &mut out, 0);
            return truncate_chars(out, PROMPT_CAPTURE_LIMIT);
        }
    }
    truncate_chars(
        String::from_utf8_lossy(body).into_owned(),
        PROMPT_CAPTURE_LIMIT,
    )
}

fn collect(node: &Value, out: &mut String, depth: usize) {
    if depth > MAX_DEPTH {
        return;
    }
    match node {
        Value::String(text) if !text.is_empty() => {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(text);
        }
        Value::Array(items) => {
            for item in items {
                collect(item, out, depth + 1);
            }
        }
        Value::Object(map) => {
            for key in PRIORITY_KEYS {
                if let Some(value) = map.get(key) {
                    collect(value, out, depth + 1);
                }
            }
            for (key, value) in map {
                if !PRIORITY_KEYS.contains(&key.as_str()) {
                    collect(value, out, depth + 1);
                }
            }
        }
        _ => {}
    }
}

fn truncate_chars(text: String, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text,
    }
}

/// Shannon entropy in bits per character.
pub fn shannon_entropy(text: &str) -> f64 {
    let (freq, total) = char_frequencies(text);
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    freq.values()
        .map(|count| {
            let p = *count as f64 / total;
            -p * p.log2()
        })
        .sum()
}

/// Share of the most frequent character.
pub fn max_char_ratio(text: &str) -> f64 {
    let (freq, total) = char_frequencies(text);
    match freq.values().max() {
        Some(max) if total > 0 => *max as f64 / total as f64,
        _ => 0.0,
    }
}

fn char_frequencies(text: &str) -> (HashMap<char, usize>, usize) {
    let mut freq = HashMap::new();
    let mut total = 0;
    for ch in text.chars() {
        *freq.entry(ch).or_insert(0) += 1;
        total += 1;
    }
    (freq, total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_messages_content_in_priority_order() {
        let body = br#"{"model":"gpt-4o","messages":[{"role":"user","content":"hello"}],"prompt":"first"}"#;
        let text = extract_prompt_text(body, Some("application/json"));
        assert_eq!(text, "first\nhello\nuser\ngpt-4o");
    }

    #[test]
    fn non_json_body_is_raw_text() {
        assert_eq!(extract_prompt_text(b"plain words", Some("text/plain")), "plain words");
        assert_eq!(extract_prompt_text(b"{broken", None), "{broken");
    }

    #[test]
    fn capture_is_capped() {
        let body = serde_json::json!({ "prompt": "é".repeat(10_000) }).to_string();
        let text = extract_prompt_text(body.as_bytes(), None);
        assert_eq!(text.chars().count(), PROMPT_CAPTURE_LIMIT);
    }

    #[test]
    fn entropy_and_repetition() {
        assert_eq!(shannon_entropy(""), 0.0);
        assert_eq!(shannon_entropy("aaaa"), 0.0);
        assert!((shannon_entropy("abab") - 1.0).abs() < 1e-9);
        assert!((max_char_ratio("aaab") - 0.75).abs() < 1e-9);
    }
}
