//! Runtime orchestration: load config, install metrics, start front-ends,
//! drive reconciliation, and tear everything down in order on shutdown
//! (front-ends first, then upstreams, then the health checker).

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tokio_util::sync::CancellationToken;

use relay_config::{config_channel, load_config, spawn_config_watcher};
use relay_routing::HealthChecker;

use crate::http::HttpFrontend;
use crate::service::SharedState;
use crate::stdio::run_stdio;

/// Histogram buckets for tool-call duration, in seconds.
const DURATION_BUCKETS: &[f64] = &[0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0];

#[derive(Debug, Clone, Default)]
pub struct RuntimeOptions {
    pub config_path: PathBuf,
    pub http_host: Option<String>,
    pub http_port: Option<u16>,
    /// Serve a single session over this process's stdio.
    pub stdio: bool,
    /// Token binding the stdio session's principal.
    pub token: Option<String>,
    /// Watch the config file and hot-reload.
    pub watch: bool,
}

/// Install the Prometheus recorder with the relay's fixed buckets.
pub fn install_metrics_recorder() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("mcp_router_tool_call_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .context("invalid histogram buckets")?
        .install_recorder()
        .context("failed to install metrics recorder")
}

/// Run the relay until ctrl-c (or until the stdio downstream closes).
pub async fn run(options: RuntimeOptions, metrics: Option<PrometheusHandle>) -> Result<()> {
    // Structural config errors are fatal at startup; only reloads retain
    // the previous snapshot.
    let initial = load_config(&options.config_path)
        .with_context(|| format!("failed to load {}", options.config_path.display()))?;
    let http_enabled = initial.listen.http.is_some();
    let stdio_enabled = options.stdio || initial.listen.stdio;
    if !http_enabled && !stdio_enabled {
        bail!("nothing to serve: configure listen.http or enable the stdio front-end");
    }

    let upstream_count = initial.upstreams.len();
    let (publisher, config) = config_channel(initial);
    let shared = SharedState::new(config.clone());
    let cancel = CancellationToken::new();

    let watcher = if options.watch {
        Some(spawn_config_watcher(
            options.config_path.clone(),
            publisher,
            cancel.clone(),
        )?)
    } else {
        None
    };

    // Reconciler: on each published snapshot, diff the live upstream set.
    let reconciler = {
        let mut config = config.clone();
        let shared = shared.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = config.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = config.snapshot();
                        shared.manager.reconcile(&snapshot).await;
                    }
                }
            }
        })
    };

    let health_checker = HealthChecker::spawn(
        config.clone(),
        shared.manager.clone(),
        shared.breaker.clone(),
        shared.health.clone(),
    );

    let http = if http_enabled {
        Some(
            HttpFrontend::start(
                shared.clone(),
                options.http_host.clone(),
                options.http_port,
                metrics,
            )
            .await?,
        )
    } else {
        None
    };

    tracing::info!(upstreams = upstream_count, stdio = stdio_enabled, "relay started");

    if stdio_enabled {
        let shared_stdio = shared.clone();
        let token = options.token.clone();
        tokio::select! {
            result = run_stdio(shared_stdio, token) => {
                if let Err(error) = result {
                    tracing::warn!(error = %error, "stdio front-end failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {}
        }
    } else {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::info!("shutting down");

    // Ordered teardown: sessions, then upstreams, then the health loop.
    if let Some(http) = http {
        http.shutdown().await;
    }
    shared.manager.close_all().await;
    health_checker.stop().await;

    cancel.cancel();
    if let Some(watcher) = watcher {
        let _ = watcher.await;
    }
    let _ = reconciler.await;

    Ok(())
}
