//! The per-session router engine.
//!
//! One engine is constructed per session with the principal already bound.
//! It owns the session's tool cache and round-robin counters, resolves
//! selectors, and forwards calls through the shared manager, breaker, rate
//! limiter, and health registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use metrics::{counter, histogram};
use rmcp::model::{CallToolResult, Content, Tool};
use serde_json::{Value, json};

use relay_config::{ConfigHandle, NormalizedConfig, SelectorStrategy, ToolExposure};
use relay_core::error::RouterError;
use relay_core::principal::{Principal, assert_allowed_upstream};
use relay_routing::{BreakerDenied, BreakerSnapshot, CircuitBreaker, HealthRegistry, RateLimiter};
use relay_upstream::{ToolRecord, UpstreamManager};

use crate::audit;
use crate::cache::ToolCache;
use crate::namespace::{namespaced_name, split_namespaced};
use crate::selector::{Selector, candidates, parse_selector};

pub const TOOL_LIST_PROVIDERS: &str = "list_providers";
pub const TOOL_TOOLS_LIST: &str = "tools.list";
pub const TOOL_TOOLS_CALL: &str = "tools.call";
pub const TOOL_TOOLS_REFRESH: &str = "tools.refresh";

const METRIC_TOOL_CALLS: &str = "mcp_router_tool_calls_total";
const METRIC_TOOL_CALL_DURATION: &str = "mcp_router_tool_call_duration_seconds";

type JsonMap = serde_json::Map<String, Value>;
type RngFn = Box<dyn Fn() -> f64 + Send + Sync>;

pub struct RouterEngine {
    config: ConfigHandle,
    manager: Arc<UpstreamManager>,
    breaker: Arc<CircuitBreaker>,
    health: Arc<HealthRegistry>,
    limiter: Arc<RateLimiter>,
    principal: Principal,
    cache: Mutex<ToolCache>,
    rr_counters: Mutex<HashMap<String, usize>>,
    rng: RngFn,
}

impl RouterEngine {
    pub fn new(
        config: ConfigHandle,
        manager: Arc<UpstreamManager>,
        breaker: Arc<CircuitBreaker>,
        health: Arc<HealthRegistry>,
        limiter: Arc<RateLimiter>,
        principal: Principal,
    ) -> Self {
        Self::with_rng(
            config,
            manager,
            breaker,
            health,
            limiter,
            principal,
            Box::new(rand::random::<f64>),
        )
    }

    /// Constructor with an injectable RNG for the `random` strategy, so
    /// routing decisions are reproducible in tests.
    #[allow(clippy::too_many_arguments)]
    pub fn with_rng(
        config: ConfigHandle,
        manager: Arc<UpstreamManager>,
        breaker: Arc<CircuitBreaker>,
        health: Arc<HealthRegistry>,
        limiter: Arc<RateLimiter>,
        principal: Principal,
        rng: RngFn,
    ) -> Self {
        Self {
            config,
            manager,
            breaker,
            health,
            limiter,
            principal,
            cache: Mutex::new(ToolCache::default()),
            rr_counters: Mutex::new(HashMap::new()),
            rng,
        }
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// The tool list this session sees, per the configured exposure mode.
    ///
    /// Namespaced exposure aggregates every visible upstream in sequence;
    /// per-upstream failures are logged and that upstream's tools elided.
    pub async fn exposed_tools(&self) -> Result<Vec<Tool>, RouterError> {
        let cfg = self.config.snapshot();
        let mut tools = match cfg.tool_exposure {
            ToolExposure::Hierarchical | ToolExposure::Both => router_tools(),
            // list_providers stays visible for debuggability.
            ToolExposure::Namespaced => vec![list_providers_tool()],
        };
        if matches!(
            cfg.tool_exposure,
            ToolExposure::Namespaced | ToolExposure::Both
        ) {
            tools.extend(self.namespaced_tools(&cfg).await);
        }
        Ok(tools)
    }

    /// Dispatch one tool call: a router tool by name, anything else is
    /// treated as a namespaced upstream tool.
    pub async fn dispatch_tool(
        &self,
        name: &str,
        arguments: Option<JsonMap>,
    ) -> Result<CallToolResult, RouterError> {
        // One snapshot per operation: a reload mid-call never mixes configs.
        let cfg = self.config.snapshot();
        self.limiter.consume(&self.principal)?;

        match name {
            TOOL_LIST_PROVIDERS => self.list_providers(&cfg, arguments),
            TOOL_TOOLS_LIST => self.tools_list(&cfg, arguments).await,
            TOOL_TOOLS_CALL => self.tools_call(&cfg, arguments).await,
            TOOL_TOOLS_REFRESH => self.tools_refresh(arguments),
            namespaced => self.call_namespaced(&cfg, namespaced, arguments).await,
        }
    }

    /// Resolve a selector to exactly one upstream name.
    pub fn resolve(&self, cfg: &NormalizedConfig, raw: &str) -> Result<String, RouterError> {
        let selector = parse_selector(raw)?;
        if let Selector::Name(name) = selector {
            return Ok(name);
        }

        let matched = candidates(cfg, &self.principal, &selector);
        if matched.is_empty() {
            return Err(RouterError::NoProvidersMatch(raw.to_string()));
        }

        let available: Vec<String> = matched
            .into_iter()
            .filter(|name| {
                self.breaker
                    .can_attempt(name, &cfg.routing.circuit_breaker)
            })
            .collect();
        if available.is_empty() {
            return Err(RouterError::UpstreamUnavailable(format!(
                "all providers matching '{raw}' are unavailable"
            )));
        }

        let picked = match cfg.routing.selector_strategy {
            SelectorStrategy::RoundRobin => {
                let mut counters = self.rr_counters.lock().expect("counter lock poisoned");
                let counter = counters.entry(raw.to_string()).or_insert(0);
                let index = *counter % available.len();
                *counter += 1;
                available[index].clone()
            }
            SelectorStrategy::Random => {
                let index = ((self.rng)() * available.len() as f64).floor() as usize;
                available[index.min(available.len() - 1)].clone()
            }
        };
        Ok(picked)
    }

    async fn namespaced_tools(&self, cfg: &NormalizedConfig) -> Vec<Tool> {
        let visible: Vec<String> = cfg
            .enabled_upstreams()
            .filter(|(name, upstream)| self.principal.can_see_upstream(name, &upstream.tags))
            .map(|(name, _)| name.clone())
            .collect();

        let mut tools = Vec::new();
        for upstream in visible {
            match self.cached_tools(cfg, &upstream).await {
                Ok(records) => {
                    for record in records {
                        let wire_name = namespaced_name(&upstream, &record.name);
                        tools.push(record.to_wire(&wire_name));
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        server = %upstream,
                        error = %error,
                        "tool listing failed, eliding upstream from namespaced exposure"
                    );
                }
            }
        }
        tools
    }

    /// Tools for one upstream, served from the session cache inside its TTL.
    async fn cached_tools(
        &self,
        cfg: &NormalizedConfig,
        upstream: &str,
    ) -> Result<Vec<ToolRecord>, RouterError> {
        {
            let cache = self.cache.lock().expect("cache lock poisoned");
            if let Some(entry) = cache.get(upstream) {
                return Ok(entry.tools.clone());
            }
        }
        self.fetch_tools(cfg, upstream).await
    }

    /// Fetch one upstream's tools through the breaker and refill the cache.
    async fn fetch_tools(
        &self,
        cfg: &NormalizedConfig,
        upstream: &str,
    ) -> Result<Vec<ToolRecord>, RouterError> {
        let attempt = self
            .breaker
            .begin_attempt(upstream, &cfg.routing.circuit_breaker)
            .map_err(|denied| denied_error(upstream, denied))?;

        let client = match self.manager.get(upstream, cfg).await {
            Ok(client) => client,
            Err(error) => {
                attempt.end(true);
                return Err(error);
            }
        };

        let result = client.list_tools().await;
        attempt.end(breaker_verdict(&result));
        let mut records = result?;

        let mut original_by_namespaced = HashMap::new();
        for record in &mut records {
            let wire_name = namespaced_name(upstream, &record.name);
            record
                .metadata
                .insert("originalName".to_string(), Value::String(record.name.clone()));
            record
                .metadata
                .insert("provider".to_string(), Value::String(upstream.to_string()));
            original_by_namespaced.insert(wire_name, record.name.clone());
        }

        self.cache.lock().expect("cache lock poisoned").insert(
            upstream,
            records.clone(),
            original_by_namespaced,
        );
        Ok(records)
    }

    /// The forwarding pipeline shared by selector-driven and namespaced
    /// calls: authorize, lease a breaker attempt, dispatch with the
    /// upstream's deadline, classify, record metrics and audit entries.
    async fn forward(
        &self,
        cfg: &NormalizedConfig,
        upstream: &str,
        tool: &str,
        arguments: Option<JsonMap>,
    ) -> Result<CallToolResult, RouterError> {
        let upstream_cfg = cfg
            .upstream(upstream)
            .ok_or_else(|| RouterError::BadRequest(format!("unknown upstream '{upstream}'")))?;
        if !upstream_cfg.enabled {
            return Err(RouterError::UpstreamUnavailable(format!(
                "upstream '{upstream}' is disabled"
            )));
        }
        assert_allowed_upstream(&self.principal, upstream, &upstream_cfg.tags)?;

        let attempt = self
            .breaker
            .begin_attempt(upstream, &cfg.routing.circuit_breaker)
            .map_err(|denied| denied_error(upstream, denied))?;

        let client = match self.manager.get(upstream, cfg).await {
            Ok(client) => client,
            Err(error) => {
                // Never reached the upstream; no availability signal.
                attempt.end(true);
                return Err(error);
            }
        };

        audit::tool_start(&cfg.audit, &self.principal, upstream, tool, arguments.as_ref());
        let started = Instant::now();
        let result = client.call_tool(tool, arguments).await;
        attempt.end(breaker_verdict(&result));

        let elapsed = started.elapsed();
        let ok_label = if result.is_ok() { "true" } else { "false" };
        counter!(
            METRIC_TOOL_CALLS,
            "server" => upstream.to_string(),
            "tool" => tool.to_string(),
            "ok" => ok_label
        )
        .increment(1);
        histogram!(
            METRIC_TOOL_CALL_DURATION,
            "server" => upstream.to_string(),
            "tool" => tool.to_string(),
            "ok" => ok_label
        )
        .record(elapsed.as_secs_f64());

        audit::tool_end(
            &cfg.audit,
            &self.principal,
            upstream,
            tool,
            result.is_ok(),
            elapsed.as_millis() as u64,
            result.as_ref().err().map(|e| e.to_string()).as_deref(),
        );

        result
    }

    fn list_providers(
        &self,
        cfg: &NormalizedConfig,
        arguments: Option<JsonMap>,
    ) -> Result<CallToolResult, RouterError> {
        let tag_filter = str_arg(arguments.as_ref(), "tag");
        let version_filter = match str_arg(arguments.as_ref(), "version") {
            Some(raw) => match parse_selector(&format!("version:{raw}"))? {
                Selector::Version(range) => Some(range),
                _ => None,
            },
            None => None,
        };

        let mut providers = Vec::new();
        for (name, upstream) in cfg.enabled_upstreams() {
            if !self.principal.can_see_upstream(name, &upstream.tags) {
                continue;
            }
            if let Some(tag) = &tag_filter {
                if !upstream.tags.iter().any(|t| t == tag) {
                    continue;
                }
            }
            if let Some(range) = &version_filter {
                let satisfied = upstream
                    .version
                    .as_deref()
                    .and_then(|v| semver::Version::parse(v).ok())
                    .map(|v| range.matches(&v))
                    .unwrap_or(false);
                if !satisfied {
                    continue;
                }
            }

            let mut provider = serde_json::Map::new();
            provider.insert("name".into(), Value::String(name.clone()));
            if let Some(url) = &upstream.url {
                provider.insert("url".into(), Value::String(url.clone()));
            }
            provider.insert(
                "transport".into(),
                Value::String(upstream.transport.label().to_string()),
            );
            if !upstream.tags.is_empty() {
                provider.insert("tags".into(), json!(upstream.tags));
            }
            if let Some(version) = &upstream.version {
                provider.insert("version".into(), Value::String(version.clone()));
            }
            provider.insert(
                "circuitBreaker".into(),
                breaker_json(self.breaker.snapshot(name)),
            );
            provider.insert("health".into(), health_json(&self.health, name));
            providers.push(Value::Object(provider));
        }

        structured_result(json!({ "providers": providers }))
    }

    async fn tools_list(
        &self,
        cfg: &NormalizedConfig,
        arguments: Option<JsonMap>,
    ) -> Result<CallToolResult, RouterError> {
        let selector = require_str_arg(arguments.as_ref(), "provider")?;
        let upstream = self.resolve(cfg, &selector)?;

        let upstream_cfg = cfg
            .upstream(&upstream)
            .ok_or_else(|| RouterError::BadRequest(format!("unknown upstream '{upstream}'")))?;
        assert_allowed_upstream(&self.principal, &upstream, &upstream_cfg.tags)?;

        let tools = self.cached_tools(cfg, &upstream).await?;
        let tools: Vec<Value> = tools.iter().map(ToolRecord::to_json).collect();
        structured_result(json!({ "provider": upstream, "tools": tools }))
    }

    async fn tools_call(
        &self,
        cfg: &NormalizedConfig,
        arguments: Option<JsonMap>,
    ) -> Result<CallToolResult, RouterError> {
        let selector = require_str_arg(arguments.as_ref(), "provider")?;
        let tool = require_str_arg(arguments.as_ref(), "name")?;
        let call_args = obj_arg(arguments.as_ref(), "arguments");

        let upstream = self.resolve(cfg, &selector)?;
        let result = self.forward(cfg, &upstream, &tool, call_args).await?;

        let content_json = serde_json::to_value(&result.content)
            .map_err(|err| RouterError::Internal(err.to_string()))?;
        let structured = json!({
            "provider": upstream,
            "name": tool,
            "content": content_json,
            "structuredContent": result.structured_content,
        });
        let mut wrapped = result;
        wrapped.structured_content = Some(structured);
        Ok(wrapped)
    }

    fn tools_refresh(&self, arguments: Option<JsonMap>) -> Result<CallToolResult, RouterError> {
        let provider = str_arg(arguments.as_ref(), "provider");
        self.cache
            .lock()
            .expect("cache lock poisoned")
            .invalidate(provider.as_deref());
        structured_result(json!({ "ok": true }))
    }

    async fn call_namespaced(
        &self,
        cfg: &NormalizedConfig,
        name: &str,
        arguments: Option<JsonMap>,
    ) -> Result<CallToolResult, RouterError> {
        let upstream_names = cfg.upstreams.keys().map(String::as_str);
        let Some((upstream, rest)) = split_namespaced(name, upstream_names) else {
            return Err(RouterError::BadRequest(format!("unknown tool '{name}'")));
        };

        // The cache maps the namespaced name back to the original; a cold
        // cache falls back to the sanitized remainder.
        let original = {
            let cache = self.cache.lock().expect("cache lock poisoned");
            cache.original_name(&upstream, name).unwrap_or(rest)
        };

        self.forward(cfg, &upstream, &original, arguments).await
    }
}

fn breaker_verdict<T>(result: &Result<T, RouterError>) -> bool {
    match result {
        Ok(_) => true,
        Err(error) => !error.counts_as_upstream_failure(),
    }
}

fn denied_error(upstream: &str, denied: BreakerDenied) -> RouterError {
    match denied {
        BreakerDenied::Open { retry_in } => RouterError::UpstreamUnavailable(format!(
            "circuit for '{upstream}' is open; retry in {}s",
            retry_in.as_secs().max(1)
        )),
        BreakerDenied::HalfOpenBusy => RouterError::UpstreamUnavailable(format!(
            "circuit for '{upstream}' is testing recovery"
        )),
    }
}

fn breaker_json(snapshot: BreakerSnapshot) -> Value {
    let open_until = snapshot.open_remaining.and_then(|remaining| {
        chrono::Duration::from_std(remaining)
            .ok()
            .map(|delta| (Utc::now() + delta).to_rfc3339())
    });
    json!({
        "state": snapshot.state.label(),
        "failures": snapshot.consecutive_failures,
        "openUntil": open_until,
        "halfOpenInFlight": snapshot.half_open_in_flight,
    })
}

fn health_json(health: &HealthRegistry, upstream: &str) -> Value {
    let snapshot = health.snapshot(upstream);
    json!({
        "status": snapshot.status.label(),
        "lastOkAt": snapshot.last_ok_at.map(|t| t.to_rfc3339()),
        "lastErrorAt": snapshot.last_error_at.map(|t| t.to_rfc3339()),
        "lastError": snapshot.last_error,
    })
}

fn structured_result(payload: Value) -> Result<CallToolResult, RouterError> {
    let mut result = CallToolResult::success(vec![Content::text(payload.to_string())]);
    result.structured_content = Some(payload);
    Ok(result)
}

fn str_arg(arguments: Option<&JsonMap>, key: &str) -> Option<String> {
    arguments
        .and_then(|map| map.get(key))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn require_str_arg(arguments: Option<&JsonMap>, key: &str) -> Result<String, RouterError> {
    str_arg(arguments, key)
        .ok_or_else(|| RouterError::BadRequest(format!("missing required parameter '{key}'")))
}

fn obj_arg(arguments: Option<&JsonMap>, key: &str) -> Option<JsonMap> {
    arguments
        .and_then(|map| map.get(key))
        .and_then(Value::as_object)
        .cloned()
}

fn tool(name: &'static str, description: &'static str, schema: Value) -> Tool {
    let schema = schema.as_object().cloned().unwrap_or_default();
    Tool::new(name, description, std::sync::Arc::new(schema))
}

fn list_providers_tool() -> Tool {
    tool(
        TOOL_LIST_PROVIDERS,
        "List visible providers with circuit-breaker and health state",
        json!({
            "type": "object",
            "properties": {
                "tag": { "type": "string" },
                "version": { "type": "string" }
            },
            "additionalProperties": false
        }),
    )
}

/// The router's own tools; schemas are fixed and declarative.
pub fn router_tools() -> Vec<Tool> {
    vec![
        list_providers_tool(),
        tool(
            TOOL_TOOLS_LIST,
            "List the tools of one provider (accepts a provider selector)",
            json!({
                "type": "object",
                "properties": {
                    "provider": { "type": "string" }
                },
                "required": ["provider"],
                "additionalProperties": false
            }),
        ),
        tool(
            TOOL_TOOLS_CALL,
            "Invoke a tool on the provider a selector resolves to",
            json!({
                "type": "object",
                "properties": {
                    "provider": { "type": "string" },
                    "name": { "type": "string" },
                    "arguments": { "type": "object" }
                },
                "required": ["provider", "name"],
                "additionalProperties": false
            }),
        ),
        tool(
            TOOL_TOOLS_REFRESH,
            "Invalidate the session tool cache for one provider or all",
            json!({
                "type": "object",
                "properties": {
                    "provider": { "type": "string" }
                },
                "additionalProperties": false
            }),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_config::{config_channel, parse_config};

    fn engine_for(cfg_json: &str, rng: Option<RngFn>) -> RouterEngine {
        let cfg = parse_config(cfg_json).unwrap();
        let (_publisher, handle) = config_channel(cfg);
        let rng = rng.unwrap_or_else(|| Box::new(rand::random::<f64>));
        RouterEngine::with_rng(
            handle,
            UpstreamManager::new(),
            CircuitBreaker::new(),
            HealthRegistry::new(),
            Arc::new(RateLimiter::new()),
            Principal::Anonymous,
            rng,
        )
    }

    const TWO_TAGGED: &str = r#"{"mcpServers": {
        "a": {"transport": "http", "url": "https://a.example/mcp", "tags": ["demo"], "version": "1.0.0"},
        "b": {"transport": "http", "url": "https://b.example/mcp", "tags": ["demo"], "version": "1.1.0"}
    }}"#;

    #[test]
    fn explicit_name_resolves_verbatim() {
        let engine = engine_for(TWO_TAGGED, None);
        let cfg = engine.config.snapshot();
        assert_eq!(engine.resolve(&cfg, "a").unwrap(), "a");
        // Even unknown names pass through; the forwarding step rejects them.
        assert_eq!(engine.resolve(&cfg, "nope").unwrap(), "nope");
    }

    #[test]
    fn round_robin_walks_candidates_in_name_order() {
        let engine = engine_for(TWO_TAGGED, None);
        let cfg = engine.config.snapshot();
        let picks: Vec<String> = (0..4)
            .map(|_| engine.resolve(&cfg, "tag:demo").unwrap())
            .collect();
        assert_eq!(picks, ["a", "b", "a", "b"]);
    }

    #[test]
    fn round_robin_counters_are_per_selector() {
        let engine = engine_for(TWO_TAGGED, None);
        let cfg = engine.config.snapshot();
        assert_eq!(engine.resolve(&cfg, "tag:demo").unwrap(), "a");
        // A different selector string starts from its own counter.
        assert_eq!(engine.resolve(&cfg, "tag:demo@^1.0.0").unwrap(), "a");
        assert_eq!(engine.resolve(&cfg, "tag:demo").unwrap(), "b");
    }

    #[test]
    fn semver_selectors_narrow_the_candidate_set() {
        let engine = engine_for(TWO_TAGGED, None);
        let cfg = engine.config.snapshot();
        assert_eq!(engine.resolve(&cfg, "tag:demo@1.0.0").unwrap(), "a");
        assert_eq!(engine.resolve(&cfg, "version:1.1.0").unwrap(), "b");
    }

    #[test]
    fn random_strategy_uses_the_injected_rng() {
        let cfg_json = r#"{
            "routing": {"selectorStrategy": "random"},
            "mcpServers": {
                "a": {"transport": "http", "url": "https://a.example/mcp", "tags": ["demo"]},
                "b": {"transport": "http", "url": "https://b.example/mcp", "tags": ["demo"]}
            }
        }"#;
        let engine = engine_for(cfg_json, Some(Box::new(|| 0.99)));
        let cfg = engine.config.snapshot();
        assert_eq!(engine.resolve(&cfg, "tag:demo").unwrap(), "b");

        let engine = engine_for(cfg_json, Some(Box::new(|| 0.0)));
        let cfg = engine.config.snapshot();
        assert_eq!(engine.resolve(&cfg, "tag:demo").unwrap(), "a");
    }

    #[test]
    fn no_match_and_all_unavailable_are_distinct() {
        let engine = engine_for(TWO_TAGGED, None);
        let cfg = engine.config.snapshot();

        assert!(matches!(
            engine.resolve(&cfg, "tag:absent"),
            Err(RouterError::NoProvidersMatch(_))
        ));

        // Trip both breakers; the tag still matches but nothing is available.
        let breaker_cfg = relay_config::CircuitBreakerConfig {
            enabled: true,
            failure_threshold: 1,
            open_ms: 60_000,
        };
        for name in ["a", "b"] {
            engine
                .breaker
                .begin_attempt(name, &breaker_cfg)
                .unwrap()
                .end(false);
        }
        assert!(matches!(
            engine.resolve(&cfg, "tag:demo"),
            Err(RouterError::UpstreamUnavailable(_))
        ));
    }

    #[test]
    fn breaker_filter_skips_open_upstreams() {
        let engine = engine_for(TWO_TAGGED, None);
        let cfg = engine.config.snapshot();
        let breaker_cfg = relay_config::CircuitBreakerConfig {
            enabled: true,
            failure_threshold: 1,
            open_ms: 60_000,
        };
        engine
            .breaker
            .begin_attempt("a", &breaker_cfg)
            .unwrap()
            .end(false);

        // Only "b" remains; every resolution lands there.
        assert_eq!(engine.resolve(&cfg, "tag:demo").unwrap(), "b");
        assert_eq!(engine.resolve(&cfg, "tag:demo").unwrap(), "b");
    }

    #[tokio::test]
    async fn hierarchical_exposure_lists_the_router_tools() {
        let engine = engine_for(TWO_TAGGED, None);
        let tools = engine.exposed_tools().await.unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_ref()).collect();
        assert_eq!(
            names,
            [
                TOOL_LIST_PROVIDERS,
                TOOL_TOOLS_LIST,
                TOOL_TOOLS_CALL,
                TOOL_TOOLS_REFRESH
            ]
        );
    }

    #[tokio::test]
    async fn list_providers_reports_breaker_and_health_state() {
        let engine = engine_for(TWO_TAGGED, None);
        engine.health.record_ok("a");

        let result = engine.dispatch_tool(TOOL_LIST_PROVIDERS, None).await.unwrap();
        let payload = result.structured_content.unwrap();
        let providers = payload["providers"].as_array().unwrap();
        assert_eq!(providers.len(), 2);
        assert_eq!(providers[0]["name"], "a");
        assert_eq!(providers[0]["transport"], "http");
        assert_eq!(providers[0]["circuitBreaker"]["state"], "closed");
        assert_eq!(providers[0]["health"]["status"], "healthy");
        assert_eq!(providers[1]["health"]["status"], "unknown");
    }

    #[tokio::test]
    async fn list_providers_filters_by_tag_and_version() {
        let engine = engine_for(TWO_TAGGED, None);

        let args = json!({"version": "1.1.0"}).as_object().cloned();
        let result = engine.dispatch_tool(TOOL_LIST_PROVIDERS, args).await.unwrap();
        let payload = result.structured_content.unwrap();
        let providers = payload["providers"].as_array().unwrap();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0]["name"], "b");

        let args = json!({"tag": "absent"}).as_object().cloned();
        let result = engine.dispatch_tool(TOOL_LIST_PROVIDERS, args).await.unwrap();
        let payload = result.structured_content.unwrap();
        assert!(payload["providers"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn allowlisted_principal_sees_only_its_providers() {
        let cfg = parse_config(
            r#"{
                "projects": [{"id": "p", "allowedMcpServers": ["demo1"]}],
                "auth": {"tokens": [{"value": "t", "projectId": "p"}]},
                "mcpServers": {
                    "demo1": {"transport": "http", "url": "https://d1.example/mcp"},
                    "demo2": {"transport": "http", "url": "https://d2.example/mcp"}
                }
            }"#,
        )
        .unwrap();
        let principal = relay_config::auth_from_token(&cfg, Some("t")).unwrap();
        let (_publisher, handle) = config_channel(cfg);
        let engine = RouterEngine::new(
            handle,
            UpstreamManager::new(),
            CircuitBreaker::new(),
            HealthRegistry::new(),
            Arc::new(RateLimiter::new()),
            principal,
        );

        let result = engine.dispatch_tool(TOOL_LIST_PROVIDERS, None).await.unwrap();
        let payload = result.structured_content.unwrap();
        let providers = payload["providers"].as_array().unwrap();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0]["name"], "demo1");

        // Direct dispatch to the hidden provider is forbidden.
        let args = json!({"provider": "demo2", "name": "echo"}).as_object().cloned();
        let err = engine.dispatch_tool(TOOL_TOOLS_CALL, args).await.unwrap_err();
        assert!(matches!(err, RouterError::Forbidden(_)));
    }

    #[tokio::test]
    async fn rate_limited_principal_is_refused_on_the_second_call() {
        let cfg = parse_config(
            r#"{
                "auth": {"tokens": [{"value": "t", "rateLimit": {"requestsPerMinute": 1}}]},
                "mcpServers": {"a": {"transport": "http", "url": "https://a.example/mcp"}}
            }"#,
        )
        .unwrap();
        let principal = relay_config::auth_from_token(&cfg, Some("t")).unwrap();
        let (_publisher, handle) = config_channel(cfg);
        let engine = RouterEngine::new(
            handle,
            UpstreamManager::new(),
            CircuitBreaker::new(),
            HealthRegistry::new(),
            Arc::new(RateLimiter::new()),
            principal,
        );

        engine.dispatch_tool(TOOL_LIST_PROVIDERS, None).await.unwrap();
        let err = engine
            .dispatch_tool(TOOL_LIST_PROVIDERS, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn refresh_reports_ok() {
        let engine = engine_for(TWO_TAGGED, None);
        let result = engine.dispatch_tool(TOOL_TOOLS_REFRESH, None).await.unwrap();
        assert_eq!(result.structured_content.unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn unknown_namespaced_tool_is_a_bad_request() {
        let engine = engine_for(TWO_TAGGED, None);
        let err = engine
            .dispatch_tool("nosuch.echo", None)
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::BadRequest(_)));
    }

    #[tokio::test]
    async fn missing_required_parameter_is_a_bad_request() {
        let engine = engine_for(TWO_TAGGED, None);
        let err = engine.dispatch_tool(TOOL_TOOLS_LIST, None).await.unwrap_err();
        assert!(matches!(err, RouterError::BadRequest(_)));
        let err = engine
            .dispatch_tool(TOOL_TOOLS_CALL, json!({"provider": "a"}).as_object().cloned())
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::BadRequest(_)));
    }
}
