//! The HTTP front-end.
//!
//! Serves the MCP path over streamable HTTP (sessions assigned at
//! initialize, enforced by session id on later requests, GET for the push
//! channel, DELETE to terminate), the deprecated `GET /sse` +
//! `POST /messages` pair for legacy clients, `/healthz`, and the Prometheus
//! `/metrics` exposition. Authentication guards the MCP endpoints only.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use rmcp::transport::streamable_http_server::{
    StreamableHttpServerConfig, StreamableHttpService, session::local::LocalSessionManager,
};
use rmcp::transport::{SseServer, sse_server::SseServerConfig};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::auth::require_auth;
use crate::service::{RelaySession, SharedState};

const SSE_PATH: &str = "/sse";
const SSE_POST_PATH: &str = "/messages";
const MAX_REQUEST_BODY_BYTES: usize = 10 * 1024 * 1024;
const SSE_KEEP_ALIVE: std::time::Duration = std::time::Duration::from_secs(15);

pub struct HttpFrontend {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    server_task: tokio::task::JoinHandle<()>,
}

impl HttpFrontend {
    /// Bind and start serving. A port conflict surfaces as a descriptive
    /// error; port 0 lets the OS pick.
    pub async fn start(
        shared: Arc<SharedState>,
        host_override: Option<String>,
        port_override: Option<u16>,
        metrics: Option<PrometheusHandle>,
    ) -> Result<Self> {
        let cfg = shared.config.snapshot();
        let http_cfg = cfg.listen.http.clone().unwrap_or_default();
        let host = host_override.unwrap_or_else(|| http_cfg.host().to_string());
        let port = port_override.unwrap_or_else(|| http_cfg.effective_port());
        let mcp_path = http_cfg.path().to_string();

        let bind_addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .with_context(|| format!("invalid HTTP listen address '{host}:{port}'"))?;
        let listener = tokio::net::TcpListener::bind(bind_addr).await.with_context(|| {
            format!(
                "failed to bind {bind_addr} (is another relay already listening on this port?)"
            )
        })?;
        let local_addr = listener
            .local_addr()
            .context("failed to resolve bound HTTP address")?;

        let shutdown = CancellationToken::new();

        let streamable = StreamableHttpService::new(
            {
                let shared = shared.clone();
                move || Ok(RelaySession::new_http(shared.clone()))
            },
            LocalSessionManager::default().into(),
            StreamableHttpServerConfig {
                stateful_mode: true,
                sse_keep_alive: Some(SSE_KEEP_ALIVE),
            },
        );

        // Deprecated dual-endpoint transport for legacy clients.
        let (sse_server, sse_router) = SseServer::new(SseServerConfig {
            bind: local_addr,
            sse_path: SSE_PATH.to_string(),
            post_path: SSE_POST_PATH.to_string(),
            ct: shutdown.clone(),
            sse_keep_alive: None,
        });
        let _sse_ct = sse_server.with_service_directly({
            let shared = shared.clone();
            move || RelaySession::new_http(shared.clone())
        });

        let protected = Router::new()
            .nest_service(&mcp_path, streamable)
            .merge(sse_router)
            .layer(axum::middleware::from_fn_with_state(
                shared.clone(),
                require_auth,
            ));

        let metrics_handle = metrics;
        let app = Router::new()
            .route("/healthz", get(healthz))
            .route(
                "/metrics",
                get(move || {
                    let handle = metrics_handle.clone();
                    async move {
                        handle
                            .map(|handle| handle.render())
                            .unwrap_or_default()
                    }
                }),
            )
            .merge(protected)
            .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES));

        let server_shutdown = shutdown.clone();
        let server_task = tokio::spawn(async move {
            if let Err(error) = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    server_shutdown.cancelled().await;
                })
                .await
            {
                tracing::warn!(error = %error, "HTTP front-end stopped with error");
            }
        });

        tracing::info!(
            addr = %local_addr,
            path = %mcp_path,
            "relay listening on http://{local_addr}{mcp_path}"
        );

        Ok(Self {
            addr: local_addr,
            shutdown,
            server_task,
        })
    }

    /// Close every session and stop the listener.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(error) = self.server_task.await {
            tracing::debug!(error = %error, "HTTP front-end join failed");
        }
    }
}

async fn healthz() -> axum::Json<serde_json::Value> {
    axum::Json(json!({
        "ok": true,
        "service": "mcp-relay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
