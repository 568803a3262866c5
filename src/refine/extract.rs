//! Pulls the refinement JSON object out of a chat reply.
//!
//! Models often wrap the object in a fenced block or add prose around it.
//! Strategies, in order:
//! 1. Direct JSON (reply starts with `{`)
//! 2. A ```` ```json ```` fenced block
//! 3. Any fenced block containing `{`
//! 4. The first balanced `{...}` anywhere in the reply

use regex::Regex;
use serde::Deserialize;

use crate::error::RefineError;
use crate::scheduler::task::RefinedPrompt;

/// Index of the `}` closing the object that starts at `s[0]`.
///
/// String literals and escapes are honoured so braces inside values do not
/// count.
fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

fn balanced_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let rest = &s[start..];
    find_matching_brace(rest).map(|end| &rest[..=end])
}

fn fenced_block<'a>(content: &'a str, pattern: &str) -> Option<&'a str> {
    let re = Regex::new(pattern).ok()?;
    let caps = re.captures(content)?;
    caps.get(1).map(|m| m.as_str().trim())
}

/// Returns the first JSON object found in `content`.
pub fn extract_json_object(content: &str) -> Option<String> {
    let trimmed = content.trim();

    if trimmed.starts_with('{') {
        if let Some(obj) = balanced_object(trimmed) {
            return Some(obj.to_string());
        }
    }

    for pattern in [r"```json\s*\n?([\s\S]*?)\n?```", r"```(?:\w+)?\s*\n?([\s\S]*?)\n?```"] {
        if let Some(obj) = fenced_block(trimmed, pattern).and_then(balanced_object) {
            return Some(obj.to_string());
        }
    }

    balanced_object(trimmed).map(str::to_string)
}

#[derive(Debug, Deserialize)]
struct RefinementReply {
    #[serde(default)]
    positive_prompt: String,
    #[serde(default)]
    negative_prompt: String,
    #[serde(default)]
    positive_prompt_zh: Option<String>,
    #[serde(default)]
    negative_prompt_zh: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parses a refinement reply into a prompt pair. Both the positive and the
/// negative prompt must be present and non-blank.
pub fn parse_refined(content: &str) -> Result<RefinedPrompt, RefineError> {
    let json = extract_json_object(content).ok_or_else(|| {
        let preview: String = content.trim().chars().take(80).collect();
        RefineError::Parse(format!("no JSON object in reply: '{}'", preview))
    })?;

    let reply: RefinementReply =
        serde_json::from_str(&json).map_err(|e| RefineError::Parse(e.to_string()))?;

    let positive = reply.positive_prompt.trim();
    let negative = reply.negative_prompt.trim();
    if positive.is_empty() {
        return Err(RefineError::EmptyPrompt("positive"));
    }
    if negative.is_empty() {
        return Err(RefineError::EmptyPrompt("negative"));
    }

    Ok(RefinedPrompt {
        positive: positive.to_string(),
        negative: negative.to_string(),
        positive_zh: non_blank(reply.positive_prompt_zh),
        negative_zh: non_blank(reply.negative_prompt_zh),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_object() {
        let json = extract_json_object(r#"{"positive_prompt": "a {curly} cat"} trailing"#).unwrap();
        assert_eq!(json, r#"{"positive_prompt": "a {curly} cat"}"#);
    }

    #[test]
    fn test_fenced_block() {
        let reply = "Sure!\n```json\n{\"positive_prompt\": \"p\", \"negative_prompt\": \"n\"}\n```\nEnjoy.";
        let refined = parse_refined(reply).unwrap();
        assert_eq!(refined.positive, "p");
        assert_eq!(refined.negative, "n");
        assert_eq!(refined.positive_zh, None);
    }

    #[test]
    fn test_object_embedded_in_prose() {
        let reply = r#"Here you go: {"positive_prompt":"p","negative_prompt":"n","positive_prompt_zh":"正向","negative_prompt_zh":" "} done"#;
        let refined = parse_refined(reply).unwrap();
        assert_eq!(refined.positive_zh.as_deref(), Some("正向"));
        assert_eq!(refined.negative_zh, None);
    }

    #[test]
    fn test_missing_fields_are_errors() {
        assert!(matches!(
            parse_refined(r#"{"positive_prompt":"p"}"#),
            Err(RefineError::EmptyPrompt("negative"))
        ));
        assert!(matches!(
            parse_refined("no json here"),
            Err(RefineError::Parse(_))
        ));
    }
}
