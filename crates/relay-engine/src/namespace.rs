//! Namespaced tool names: `<upstream>.<sanitized-original>`.
//!
//! Upstream names may themselves contain dots, so splitting a namespaced
//! name back into (upstream, tool) matches the longest known upstream-name
//! prefix.

/// Sanitize an upstream tool name for namespacing: keep `[A-Za-z0-9_.-]`,
/// replace everything else with `_`, trim leading/trailing dots, and map an
/// empty result to `_`.
pub fn sanitize_tool_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = replaced.trim_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn namespaced_name(upstream: &str, tool: &str) -> String {
    format!("{upstream}.{}", sanitize_tool_name(tool))
}

/// Split a namespaced name into `(upstream, rest)` by the longest matching
/// upstream-name prefix.
pub fn split_namespaced<'a>(
    name: &str,
    upstream_names: impl Iterator<Item = &'a str>,
) -> Option<(String, String)> {
    let mut best: Option<&str> = None;
    for upstream in upstream_names {
        if name.len() > upstream.len() + 1
            && name.starts_with(upstream)
            && name.as_bytes()[upstream.len()] == b'.'
            && best.map(|b| upstream.len() > b.len()).unwrap_or(true)
        {
            best = Some(upstream);
        }
    }
    best.map(|upstream| {
        (
            upstream.to_string(),
            name[upstream.len() + 1..].to_string(),
        )
    })
}
