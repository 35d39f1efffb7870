//! Streaming-HTTP upstream: an rmcp client over the streamable HTTP
//! transport with the upstream's configured static headers.
//!
//! Connection is lazy; concurrent connectors coalesce on the write lock.
//! Every operation runs under the upstream's overall deadline.

use std::time::Duration;

use rmcp::RoleClient;
use rmcp::model::{CallToolRequestParam, CallToolResult};
use rmcp::service::{RunningService, ServiceExt};
use rmcp::transport::streamable_http_client::{
    StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
};
use tokio::sync::RwLock;
use tokio::time::timeout;

use relay_config::UpstreamConfig;
use relay_core::error::RouterError;

use crate::classify::{connect_error, map_service_error, timeout_error};
use crate::tool::ToolRecord;
use crate::UpstreamClient;

pub struct HttpUpstream {
    name: String,
    cfg: UpstreamConfig,
    state: RwLock<Option<RunningService<RoleClient, ()>>>,
}

impl HttpUpstream {
    pub fn new(name: String, cfg: UpstreamConfig) -> Self {
        Self {
            name,
            cfg,
            state: RwLock::new(None),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.cfg.timeout_ms())
    }

    async fn ensure_connected(&self) -> Result<(), RouterError> {
        {
            let guard = self.state.read().await;
            if guard.is_some() {
                return Ok(());
            }
        }
        let mut guard = self.state.write().await;
        if guard.is_some() {
            return Ok(());
        }
        *guard = Some(self.connect().await?);
        Ok(())
    }

    async fn connect(&self) -> Result<RunningService<RoleClient, ()>, RouterError> {
        let url = self
            .cfg
            .url
            .as_deref()
            .ok_or_else(|| connect_error(&self.name, "http transport without url"))?;

        let mut transport_config = StreamableHttpClientTransportConfig::with_uri(url.to_string());

        // The Authorization header rides the transport's auth slot; rmcp
        // re-adds the Bearer prefix itself.
        let mut default_headers = reqwest::header::HeaderMap::new();
        for (key, value) in &self.cfg.headers {
            if key.eq_ignore_ascii_case("authorization") {
                let token = value.strip_prefix("Bearer ").unwrap_or(value);
                transport_config = transport_config.auth_header(token);
                continue;
            }
            match (
                key.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                (Ok(header_name), Ok(header_value)) => {
                    default_headers.insert(header_name, header_value);
                }
                _ => {
                    tracing::warn!(
                        server = %self.name,
                        header = %key,
                        "skipping unparseable upstream header"
                    );
                }
            }
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .build()
            .map_err(|err| connect_error(&self.name, format!("http client build failed: {err}")))?;

        let transport = StreamableHttpClientTransport::with_client(client, transport_config);

        tracing::info!(server = %self.name, url = %url, "connecting to http upstream");
        let service = ().serve(transport).await.map_err(|err| {
            connect_error(&self.name, format!("MCP handshake failed at {url}: {err}"))
        })?;
        Ok(service)
    }

    async fn teardown(&self) {
        let service = self.state.write().await.take();
        if let Some(service) = service {
            tracing::debug!(server = %self.name, "http upstream disconnected");
            let _ = service.cancel().await;
        }
    }
}

#[async_trait::async_trait]
impl UpstreamClient for HttpUpstream {
    async fn list_tools(&self) -> Result<Vec<ToolRecord>, RouterError> {
        let result = timeout(self.timeout(), async {
            self.ensure_connected().await?;
            let guard = self.state.read().await;
            let Some(service) = guard.as_ref() else {
                return Err(connect_error(&self.name, "not connected"));
            };
            service
                .list_tools(None)
                .await
                .map_err(|err| map_service_error(&self.name, err))
        })
        .await;

        match result {
            Err(_) => Err(timeout_error(&self.name, self.cfg.timeout_ms())),
            Ok(Err(error)) => {
                if error.counts_as_upstream_failure() {
                    self.teardown().await;
                }
                Err(error)
            }
            Ok(Ok(response)) => Ok(response
                .tools
                .into_iter()
                .filter_map(ToolRecord::from_upstream)
                .collect()),
        }
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<CallToolResult, RouterError> {
        let mut request = CallToolRequestParam::new(name.to_string());
        if let Some(arguments) = arguments {
            request = request.with_arguments(arguments);
        }

        let result = timeout(self.timeout(), async {
            self.ensure_connected().await?;
            let guard = self.state.read().await;
            let Some(service) = guard.as_ref() else {
                return Err(connect_error(&self.name, "not connected"));
            };
            service
                .call_tool(request)
                .await
                .map_err(|err| map_service_error(&self.name, err))
        })
        .await;

        match result {
            Err(_) => Err(timeout_error(&self.name, self.cfg.timeout_ms())),
            Ok(Err(error)) => {
                if error.counts_as_upstream_failure() {
                    self.teardown().await;
                }
                Err(error)
            }
            Ok(Ok(response)) => Ok(response),
        }
    }

    async fn close(&self) {
        self.teardown().await;
    }
}
