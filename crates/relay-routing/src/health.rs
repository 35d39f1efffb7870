//! Periodic upstream health checking.
//!
//! The checker probes every enabled upstream (optionally skipping pipe
//! transports) by listing its tools through a circuit-breaker attempt, and
//! keeps a snapshot the router surfaces through `list_providers`. The loop
//! honors its stop signal between iterations without interrupting an
//! in-flight probe.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use tokio_util::sync::CancellationToken;

use relay_config::{ConfigHandle, Transport};
use relay_upstream::UpstreamManager;

use crate::breaker::CircuitBreaker;

const METRIC_UPSTREAM_HEALTH: &str = "mcp_router_upstream_health";
const METRIC_HEALTH_CHECKS: &str = "mcp_router_upstream_health_checks_total";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HealthEntry {
    pub status: HealthStatus,
    pub last_ok_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Default)]
pub struct HealthRegistry {
    entries: Mutex<HashMap<String, HealthEntry>>,
}

impl HealthRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_ok(&self, upstream: &str) {
        let mut entries = self.entries.lock().expect("health lock poisoned");
        let entry = entries.entry(upstream.to_string()).or_default();
        entry.status = HealthStatus::Healthy;
        entry.last_ok_at = Some(Utc::now());
        set_health_gauges(upstream, HealthStatus::Healthy);
    }

    pub fn record_error(&self, upstream: &str, message: impl Into<String>) {
        let mut entries = self.entries.lock().expect("health lock poisoned");
        let entry = entries.entry(upstream.to_string()).or_default();
        entry.status = HealthStatus::Unhealthy;
        entry.last_error_at = Some(Utc::now());
        entry.last_error = Some(message.into());
        set_health_gauges(upstream, HealthStatus::Unhealthy);
    }

    pub fn snapshot(&self, upstream: &str) -> HealthEntry {
        let entries = self.entries.lock().expect("health lock poisoned");
        entries.get(upstream).cloned().unwrap_or_default()
    }
}

fn set_health_gauges(upstream: &str, status: HealthStatus) {
    for candidate in [
        HealthStatus::Unknown,
        HealthStatus::Healthy,
        HealthStatus::Unhealthy,
    ] {
        let value = if candidate == status { 1.0 } else { 0.0 };
        gauge!(
            METRIC_UPSTREAM_HEALTH,
            "server" => upstream.to_string(),
            "status" => candidate.label()
        )
        .set(value);
    }
}

pub struct HealthChecker {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl HealthChecker {
    /// Start the probe loop. Each iteration reads a fresh config snapshot,
    /// so interval and timeout changes apply on reload.
    pub fn spawn(
        config: ConfigHandle,
        manager: Arc<UpstreamManager>,
        breaker: Arc<CircuitBreaker>,
        registry: Arc<HealthRegistry>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            loop {
                let cfg = config.snapshot();
                let checks = &cfg.routing.health_checks;
                let interval = Duration::from_millis(checks.interval_ms.max(1));

                if checks.enabled {
                    for (name, upstream) in cfg.enabled_upstreams() {
                        if upstream.transport == Transport::Pipe && !checks.include_stdio {
                            continue;
                        }
                        probe(&cfg, name, &manager, &breaker, &registry).await;
                    }
                }

                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });

        Self { cancel, task }
    }

    /// Stop the loop; exits any in-flight sleep promptly.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

async fn probe(
    cfg: &relay_config::NormalizedConfig,
    name: &str,
    manager: &UpstreamManager,
    breaker: &Arc<CircuitBreaker>,
    registry: &HealthRegistry,
) {
    let breaker_cfg = &cfg.routing.circuit_breaker;
    let Ok(attempt) = breaker.begin_attempt(name, breaker_cfg) else {
        // Circuit refuses probes too; the snapshot keeps its last verdict.
        return;
    };

    let client = match manager.get(name, cfg).await {
        Ok(client) => client,
        Err(error) => {
            attempt.end(false);
            registry.record_error(name, error.to_string());
            counter!(METRIC_HEALTH_CHECKS, "server" => name.to_string(), "ok" => "false")
                .increment(1);
            return;
        }
    };

    let timeout = Duration::from_millis(cfg.routing.health_checks.timeout_ms.max(1));
    match tokio::time::timeout(timeout, client.list_tools()).await {
        Ok(Ok(_)) => {
            attempt.end(true);
            registry.record_ok(name);
            counter!(METRIC_HEALTH_CHECKS, "server" => name.to_string(), "ok" => "true")
                .increment(1);
        }
        Ok(Err(error)) => {
            // Same classification as dispatch: protocol errors leave the
            // breaker alone but the probe still failed.
            attempt.end(!error.counts_as_upstream_failure());
            registry.record_error(name, error.to_string());
            counter!(METRIC_HEALTH_CHECKS, "server" => name.to_string(), "ok" => "false")
                .increment(1);
        }
        Err(_) => {
            attempt.end(false);
            registry.record_error(
                name,
                format!(
                    "health probe timed out after {}ms",
                    cfg.routing.health_checks.timeout_ms
                ),
            );
            counter!(METRIC_HEALTH_CHECKS, "server" => name.to_string(), "ok" => "false")
                .increment(1);
        }
    }
}
