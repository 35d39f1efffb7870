//! Audit trail for tool dispatch, emitted as structured `tracing` events
//! under the `audit` target.
//!
//! Arguments are only recorded when configured, truncated to the configured
//! character limit. The token fingerprint is the only principal identifier
//! that ever reaches the log.

use relay_config::AuditConfig;
use relay_core::principal::Principal;

fn principal_label(principal: &Principal) -> &str {
    principal.fingerprint().unwrap_or("anonymous")
}

fn rendered_arguments(
    cfg: &AuditConfig,
    arguments: Option<&serde_json::Map<String, serde_json::Value>>,
) -> Option<String> {
    if !cfg.log_arguments {
        return None;
    }
    let rendered = match arguments {
        Some(map) => serde_json::Value::Object(map.clone()).to_string(),
        None => "{}".to_string(),
    };
    let mut rendered = rendered;
    if rendered.chars().count() > cfg.max_argument_chars {
        rendered = rendered.chars().take(cfg.max_argument_chars).collect();
    }
    Some(rendered)
}

pub fn tool_start(
    cfg: &AuditConfig,
    principal: &Principal,
    provider: &str,
    tool: &str,
    arguments: Option<&serde_json::Map<String, serde_json::Value>>,
) {
    if !cfg.enabled {
        return;
    }
    match rendered_arguments(cfg, arguments) {
        Some(arguments) => tracing::info!(
            target: "audit",
            event = "tool_start",
            principal = principal_label(principal),
            provider,
            tool,
            arguments,
        ),
        None => tracing::info!(
            target: "audit",
            event = "tool_start",
            principal = principal_label(principal),
            provider,
            tool,
        ),
    }
}

pub fn tool_end(
    cfg: &AuditConfig,
    principal: &Principal,
    provider: &str,
    tool: &str,
    ok: bool,
    duration_ms: u64,
    error: Option<&str>,
) {
    if !cfg.enabled {
        return;
    }
    match error {
        Some(error) => tracing::info!(
            target: "audit",
            event = "tool_end",
            principal = principal_label(principal),
            provider,
            tool,
            ok,
            duration_ms,
            error,
        ),
        None => tracing::info!(
            target: "audit",
            event = "tool_end",
            principal = principal_label(principal),
            provider,
            tool,
            ok,
            duration_ms,
        ),
    }
}
