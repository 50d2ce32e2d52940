use anyhow::ensure;

/// Strips a surrounding markdown fence and whitespace; an empty narrative is an error.
pub fn clean_narrative(text: &str) -> anyhow::Result<String> {
    let mut inner = text.trim();
    if inner.starts_with("```") {
        // Drop the opening fence line (```markdown, ```text, ...).
        inner = inner.split_once('\n').map(|(_, rest)| rest).unwrap_or("");
        if let Some(end) = inner.rfind("```") {
            inner = &inner[..end];
        }
    }

    let out = inner.trim().to_string();
    ensure!(!out.is_empty(), "LLM returned an empty narrative");
    Ok(out)
}
