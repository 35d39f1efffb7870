//! Configuration for the relay: strict-JSON model, validation and
//! normalization, a single-writer snapshot handle, and a debounced file
//! watcher for hot reload.

pub mod handle;
pub mod model;
pub mod watcher;

pub use handle::{ConfigHandle, ConfigPublisher, config_channel};
pub use model::{
    AuditConfig, AuthConfig, CircuitBreakerConfig, HealthCheckConfig, HttpListenConfig,
    ListenConfig, NormalizedConfig, ProjectPolicy, RestartPolicy, RoutingConfig, SandboxConfig,
    SelectorStrategy, StderrMode, StdioSandboxConfig, TokenConfig, ToolExposure, Transport,
    UpstreamConfig, auth_from_token, load_config, parse_config,
};
pub use watcher::spawn_config_watcher;
