//! The configuration document and its normalized in-memory form.
//!
//! The file on disk is strict JSON: unknown keys are rejected, keys are
//! camelCase, and both the current `mcpServers` key and the historical
//! `upstreams` alias are accepted and merged into one upstream map.
//! Normalization fills defaults, checks per-transport required fields and
//! cross-references, and produces an immutable [`NormalizedConfig`] that is
//! only ever replaced wholesale, never mutated.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use relay_core::error::RouterError;
use relay_core::principal::{Allowlist, Principal, token_fingerprint};

const DEFAULT_HTTP_HOST: &str = "127.0.0.1";
const DEFAULT_HTTP_PORT: u16 = 8080;
const DEFAULT_MCP_PATH: &str = "/mcp";
const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_HEALTH_INTERVAL_MS: u64 = 30_000;
const DEFAULT_HEALTH_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
const DEFAULT_OPEN_MS: u64 = 30_000;
const DEFAULT_MAX_ARGUMENT_CHARS: usize = 2_048;
const DEFAULT_RESTART_MAX_RETRIES: u32 = 2;
const DEFAULT_RESTART_INITIAL_DELAY_MS: u64 = 100;
const DEFAULT_RESTART_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_RESTART_FACTOR: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Pipe,
    Http,
}

impl Transport {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pipe => "pipe",
            Self::Http => "http",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StderrMode {
    /// Forward child stderr lines into the relay's logger.
    #[default]
    Log,
    /// Discard child stderr.
    Ignore,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolExposure {
    #[default]
    Hierarchical,
    Namespaced,
    Both,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SelectorStrategy {
    #[default]
    RoundRobin,
    Random,
}

/// Retry policy for pipe-transport upstreams: delays follow
/// `min(max_delay_ms, initial_delay_ms * factor^attempt)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RestartPolicy {
    #[serde(default = "default_restart_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_restart_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_restart_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_restart_factor")]
    pub factor: f64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_RESTART_MAX_RETRIES,
            initial_delay_ms: DEFAULT_RESTART_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_RESTART_MAX_DELAY_MS,
            factor: DEFAULT_RESTART_FACTOR,
        }
    }
}

impl RestartPolicy {
    /// Backoff before retry number `attempt` (0-based).
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let delay = self.initial_delay_ms as f64 * self.factor.powi(attempt as i32);
        (delay as u64).min(self.max_delay_ms)
    }
}

/// One upstream tool server. Transport-specific fields are optional at parse
/// time; `validate` enforces `enabled => required fields present`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpstreamConfig {
    pub transport: Transport,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    // Http transport
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    // Pipe transport
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub stderr_mode: StderrMode,
    #[serde(default)]
    pub restart: RestartPolicy,
}

impl UpstreamConfig {
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms.unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_MS)
    }

    /// Stable fingerprint used by the reconciler to detect changes.
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    fn validate(&self, name: &str) -> Result<(), RouterError> {
        if !self.enabled {
            return Ok(());
        }
        match self.transport {
            Transport::Http if self.url.is_none() => Err(RouterError::ConfigInvalid(format!(
                "upstream '{name}': transport \"http\" requires 'url'"
            ))),
            Transport::Pipe if self.command.is_none() => Err(RouterError::ConfigInvalid(format!(
                "upstream '{name}': transport \"pipe\" requires 'command'"
            ))),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HttpListenConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub path: Option<String>,
}

impl HttpListenConfig {
    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_HTTP_HOST)
    }

    /// Effective port: explicit config wins; otherwise the `PORT` environment
    /// variable; otherwise the default.
    pub fn effective_port(&self) -> u16 {
        if let Some(port) = self.port {
            return port;
        }
        std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_HTTP_PORT)
    }

    pub fn path(&self) -> &str {
        self.path.as_deref().unwrap_or(DEFAULT_MCP_PATH)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ListenConfig {
    #[serde(default)]
    pub http: Option<HttpListenConfig>,
    #[serde(default)]
    pub stdio: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AdminConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub allow_unauthenticated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub include_stdio: bool,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: DEFAULT_HEALTH_INTERVAL_MS,
            timeout_ms: DEFAULT_HEALTH_TIMEOUT_MS,
            include_stdio: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_open_ms")]
    pub open_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            open_ms: DEFAULT_OPEN_MS,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RoutingConfig {
    #[serde(default)]
    pub selector_strategy: SelectorStrategy,
    #[serde(default)]
    pub health_checks: HealthCheckConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AuditConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub log_arguments: bool,
    #[serde(default = "default_max_argument_chars")]
    pub max_argument_chars: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_arguments: false,
            max_argument_chars: DEFAULT_MAX_ARGUMENT_CHARS,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProjectPolicy {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub allowed_mcp_servers: Option<Vec<String>>,
    #[serde(default)]
    pub allowed_tags: Option<Vec<String>>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TokenConfig {
    pub value: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub allowed_mcp_servers: Option<Vec<String>>,
    #[serde(default)]
    pub allowed_tags: Option<Vec<String>>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

impl AuthConfig {
    /// Authentication is enabled iff at least one token is configured.
    pub fn enabled(&self) -> bool {
        !self.tokens.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StdioSandboxConfig {
    #[serde(default)]
    pub allowed_commands: Option<Vec<String>>,
    #[serde(default)]
    pub allowed_cwd_roots: Option<Vec<String>>,
    #[serde(default)]
    pub allowed_env_keys: Option<Vec<String>>,
    #[serde(default)]
    pub inherit_env_keys: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SandboxConfig {
    #[serde(default)]
    pub stdio: StdioSandboxConfig,
}

/// The raw configuration document exactly as parsed from disk.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawConfig {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub tool_exposure: ToolExposure,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub projects: Vec<ProjectPolicy>,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub mcp_servers: BTreeMap<String, UpstreamConfig>,
    /// Historical alias for `mcpServers`.
    #[serde(default)]
    pub upstreams: BTreeMap<String, UpstreamConfig>,
}

/// Validated, defaulted configuration. Replaced wholesale on reload.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedConfig {
    pub listen: ListenConfig,
    pub admin: AdminConfig,
    pub tool_exposure: ToolExposure,
    pub routing: RoutingConfig,
    pub audit: AuditConfig,
    pub auth: AuthConfig,
    pub projects: BTreeMap<String, ProjectPolicy>,
    pub sandbox: SandboxConfig,
    pub upstreams: BTreeMap<String, UpstreamConfig>,
}

impl NormalizedConfig {
    pub fn upstream(&self, name: &str) -> Option<&UpstreamConfig> {
        self.upstreams.get(name)
    }

    /// Enabled upstreams in name order (the selector tie-break order).
    pub fn enabled_upstreams(&self) -> impl Iterator<Item = (&String, &UpstreamConfig)> {
        self.upstreams.iter().filter(|(_, cfg)| cfg.enabled)
    }
}

/// Parse and normalize a configuration document.
pub fn parse_config(raw_json: &str) -> Result<NormalizedConfig, RouterError> {
    let raw: RawConfig = serde_json::from_str(raw_json)
        .map_err(|err| RouterError::ConfigInvalid(err.to_string()))?;
    normalize(raw)
}

/// Load and normalize the configuration file at `path`.
pub fn load_config(path: &Path) -> Result<NormalizedConfig, RouterError> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        RouterError::ConfigInvalid(format!("failed to read {}: {err}", path.display()))
    })?;
    parse_config(&raw)
}

fn normalize(raw: RawConfig) -> Result<NormalizedConfig, RouterError> {
    let mut upstreams = raw.upstreams;
    for (name, cfg) in raw.mcp_servers {
        if upstreams.insert(name.clone(), cfg).is_some() {
            return Err(RouterError::ConfigInvalid(format!(
                "upstream '{name}' is defined under both 'mcpServers' and 'upstreams'"
            )));
        }
    }

    for (name, cfg) in &upstreams {
        if name.is_empty() {
            return Err(RouterError::ConfigInvalid(
                "upstream names must be non-empty".to_string(),
            ));
        }
        cfg.validate(name)?;
    }

    let mut projects = BTreeMap::new();
    for project in raw.projects {
        let id = project.id.clone();
        if projects.insert(id.clone(), project).is_some() {
            return Err(RouterError::ConfigInvalid(format!(
                "duplicate project id '{id}'"
            )));
        }
    }

    let mut seen_tokens = std::collections::BTreeSet::new();
    for token in &raw.auth.tokens {
        if token.value.is_empty() {
            return Err(RouterError::ConfigInvalid(
                "auth tokens must be non-empty".to_string(),
            ));
        }
        if !seen_tokens.insert(token.value.clone()) {
            return Err(RouterError::ConfigInvalid(
                "duplicate auth token value".to_string(),
            ));
        }
        if let Some(project_id) = &token.project_id {
            if !projects.contains_key(project_id) {
                return Err(RouterError::ConfigInvalid(format!(
                    "token references unknown project '{project_id}'"
                )));
            }
        }
    }

    Ok(NormalizedConfig {
        listen: raw.listen,
        admin: raw.admin,
        tool_exposure: raw.tool_exposure,
        routing: raw.routing,
        audit: raw.audit,
        auth: raw.auth,
        projects,
        sandbox: raw.sandbox,
        upstreams,
    })
}

/// Resolve a presented token into a [`Principal`].
///
/// With no configured tokens, authentication is disabled and every caller is
/// anonymous. Otherwise a missing or unknown token is rejected, and the
/// effective allowlists are the intersection of the token's and its
/// project's, with an absent list acting as "everything".
pub fn auth_from_token(
    cfg: &NormalizedConfig,
    token: Option<&str>,
) -> Result<Principal, RouterError> {
    if !cfg.auth.enabled() {
        return Ok(Principal::Anonymous);
    }

    let Some(token) = token else {
        return Err(RouterError::Unauthenticated("Missing token".to_string()));
    };
    let Some(entry) = cfg.auth.tokens.iter().find(|t| t.value == token) else {
        return Err(RouterError::Unauthenticated("Invalid token".to_string()));
    };

    let project = entry
        .project_id
        .as_ref()
        .and_then(|id| cfg.projects.get(id));

    let project_upstreams =
        Allowlist::from_names(project.and_then(|p| p.allowed_mcp_servers.as_deref()));
    let token_upstreams = Allowlist::from_names(entry.allowed_mcp_servers.as_deref());
    let project_tags = Allowlist::from_names(project.and_then(|p| p.allowed_tags.as_deref()));
    let token_tags = Allowlist::from_names(entry.allowed_tags.as_deref());

    let rate_limit_rpm = entry
        .rate_limit
        .as_ref()
        .and_then(|r| r.requests_per_minute)
        .or_else(|| {
            project
                .and_then(|p| p.rate_limit.as_ref())
                .and_then(|r| r.requests_per_minute)
        });

    Ok(Principal::Token {
        fingerprint: token_fingerprint(token),
        project_id: entry.project_id.clone(),
        allowed_upstreams: project_upstreams.intersect(&token_upstreams),
        allowed_tags: project_tags.intersect(&token_tags),
        rate_limit_rpm,
    })
}

fn default_true() -> bool {
    true
}

fn default_health_interval_ms() -> u64 {
    DEFAULT_HEALTH_INTERVAL_MS
}

fn default_health_timeout_ms() -> u64 {
    DEFAULT_HEALTH_TIMEOUT_MS
}

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

fn default_open_ms() -> u64 {
    DEFAULT_OPEN_MS
}

fn default_max_argument_chars() -> usize {
    DEFAULT_MAX_ARGUMENT_CHARS
}

fn default_restart_max_retries() -> u32 {
    DEFAULT_RESTART_MAX_RETRIES
}

fn default_restart_initial_delay_ms() -> u64 {
    DEFAULT_RESTART_INITIAL_DELAY_MS
}

fn default_restart_max_delay_ms() -> u64 {
    DEFAULT_RESTART_MAX_DELAY_MS
}

fn default_restart_factor() -> f64 {
    DEFAULT_RESTART_FACTOR
}
