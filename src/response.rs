//! Lenient JSON extraction from model output.
//!
//! Both scoring backends are asked for JSON only, but models routinely wrap
//! it in a markdown fence or add a sentence of preamble. Everything goes
//! through [`parse_json_response`] so the two backends agree on what
//! counts as malformed.

use serde::de::DeserializeOwned;
use thiserror::Error;

/// Model output that could not be turned into the expected JSON shape.
#[derive(Debug, Error)]
#[error("malformed response: {reason}")]
pub struct MalformedResponseError {
    pub reason: String,
    /// First part of the offending text, for logs.
    pub excerpt: String,
}

impl MalformedResponseError {
    pub fn new(reason: impl Into<String>, text: &str) -> Self {
        Self {
            reason: reason.into(),
            excerpt: text.chars().take(200).collect(),
        }
    }
}

/// Removes a surrounding ```` ```json ```` / ```` ``` ```` fence if present.
pub fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json", "JSON", ...) up to the first newline.
    let body = match rest.find('\n') {
        Some(nl) => &rest[nl + 1..],
        None => rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()),
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

/// Parses model output as `T`, tolerating fences and surrounding prose.
///
/// If the fenced body does not parse, the outermost `{ ... }` span is tried
/// before giving up.
pub fn parse_json_response<T: DeserializeOwned>(text: &str) -> Result<T, MalformedResponseError> {
    let body = strip_fences(text);
    if body.is_empty() {
        return Err(MalformedResponseError::new("empty response", text));
    }

    match serde_json::from_str::<T>(body) {
        Ok(value) => Ok(value),
        Err(first) => {
            if let (Some(start), Some(end)) = (body.find('{'), body.rfind('}')) {
                if start < end {
                    if let Ok(value) = serde_json::from_str::<T>(&body[start..=end]) {
                        return Ok(value);
                    }
                }
            }
            Err(MalformedResponseError::new(first.to_string(), text))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_strip_fences_variants() {
        assert_eq!(strip_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_fences("```\n{\"a\":1}\n```\n"), "{\"a\":1}");
        assert_eq!(strip_fences("  {\"a\":1}  "), "{\"a\":1}");
        assert_eq!(strip_fences("```json{\"a\":1}```"), "{\"a\":1}");
    }

    #[test]
    fn test_parse_fenced_json() {
        let v: Value = parse_json_response("```json\n{\"overall_score\": 72}\n```").unwrap();
        assert_eq!(v["overall_score"], 72);
    }

    #[test]
    fn test_parse_json_with_preamble() {
        let v: Value =
            parse_json_response("Here is the analysis:\n{\"overall_score\": 40}\nThanks").unwrap();
        assert_eq!(v["overall_score"], 40);
    }

    #[test]
    fn test_unparseable_is_malformed() {
        let err = parse_json_response::<Value>("I cannot help with that.").unwrap_err();
        assert!(err.to_string().starts_with("malformed response"));
        assert_eq!(err.excerpt, "I cannot help with that.");

        assert!(parse_json_response::<Value>("```json\n```").is_err());
    }
}
