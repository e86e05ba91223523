//! Lenient JSON extraction from model output.

use serde_json::Value;

/// Parse `content` as JSON, falling back to a fenced block or the outermost
/// object/array span when the model wrapped its answer in prose.
pub fn extract_json(content: &str) -> Option<Value> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    if let Some(block) = fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str(block.trim()) {
            return Some(value);
        }
    }

    outer_span(trimmed).and_then(|span| serde_json::from_str(span).ok())
}

/// Body of the first ``` fence, skipping an optional language tag.
fn fenced_block(content: &str) -> Option<&str> {
    let start = content.find("```")?;
    let after = &content[start + 3..];
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(&body[..end])
}

/// From the first `{` or `[` to the last matching closer.
fn outer_span(content: &str) -> Option<&str> {
    let start = content.find(['{', '['])?;
    let closer = if content[start..].starts_with('{') {
        '}'
    } else {
        ']'
    };
    let end = content.rfind(closer)?;
    (end > start).then(|| &content[start..=end])
}
