//! The per-session MCP service.
//!
//! Each session gets one `RelaySession`. The principal binds on the first
//! authenticated request (normally the initialize), constructs the session's
//! router engine, and is immutable afterwards: any later request carrying a
//! different token is rejected. Errors cross the protocol boundary as
//! JSON-RPC error codes from the router taxonomy.

use std::sync::Arc;

use rmcp::model::{
    CallToolRequestParam, CallToolResult, ErrorCode, ErrorData, InitializeRequestParam,
    InitializeResult, ListToolsResult, PaginatedRequestParam, ServerCapabilities, ServerInfo,
};
use rmcp::service::RequestContext;
use rmcp::{RoleServer, ServerHandler};
use serde_json::json;

use relay_config::{ConfigHandle, auth_from_token};
use relay_core::error::RouterError;
use relay_core::principal::token_fingerprint;
use relay_engine::RouterEngine;
use relay_routing::{CircuitBreaker, HealthRegistry, RateLimiter};
use relay_upstream::UpstreamManager;

use crate::auth::bearer_or_api_key;

/// Control-plane state shared by every session on every front-end.
pub struct SharedState {
    pub config: ConfigHandle,
    pub manager: Arc<UpstreamManager>,
    pub breaker: Arc<CircuitBreaker>,
    pub health: Arc<HealthRegistry>,
    pub limiter: Arc<RateLimiter>,
}

impl SharedState {
    pub fn new(config: ConfigHandle) -> Arc<Self> {
        Arc::new(Self {
            config,
            manager: UpstreamManager::new(),
            breaker: CircuitBreaker::new(),
            health: HealthRegistry::new(),
            limiter: Arc::new(RateLimiter::new()),
        })
    }
}

/// Where a session's token comes from.
#[derive(Clone)]
enum TokenSource {
    /// Read the token from each HTTP request's headers.
    Http,
    /// A fixed token supplied at startup (stdio front-end).
    Fixed(Option<String>),
}

struct SessionBinding {
    /// Fingerprint of the bound token; `None` for a token-less binding.
    fingerprint: Option<String>,
    engine: Arc<RouterEngine>,
}

#[derive(Clone)]
pub struct RelaySession {
    shared: Arc<SharedState>,
    source: TokenSource,
    binding: Arc<tokio::sync::Mutex<Option<SessionBinding>>>,
}

impl RelaySession {
    /// A session whose token arrives with each HTTP request.
    pub fn new_http(shared: Arc<SharedState>) -> Self {
        Self {
            shared,
            source: TokenSource::Http,
            binding: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    /// A session with a fixed startup token (the stdio front-end).
    pub fn new_fixed(shared: Arc<SharedState>, token: Option<String>) -> Self {
        Self {
            shared,
            source: TokenSource::Fixed(token),
            binding: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    fn request_token(&self, context: &RequestContext<RoleServer>) -> Option<String> {
        match &self.source {
            TokenSource::Fixed(token) => token.clone(),
            TokenSource::Http => context
                .extensions
                .get::<axum::http::request::Parts>()
                .and_then(|parts| bearer_or_api_key(&parts.headers)),
        }
    }

    /// The session's engine, binding the principal on first use and
    /// enforcing token immutability on every later request.
    async fn session_engine(
        &self,
        context: &RequestContext<RoleServer>,
    ) -> Result<Arc<RouterEngine>, ErrorData> {
        let token = self.request_token(context);
        let fingerprint = token.as_deref().map(token_fingerprint);

        let mut binding = self.binding.lock().await;
        if let Some(bound) = binding.as_ref() {
            if bound.fingerprint != fingerprint {
                return Err(to_mcp_error(&RouterError::Unauthenticated(
                    "session is bound to a different token".to_string(),
                )));
            }
            return Ok(bound.engine.clone());
        }

        let cfg = self.shared.config.snapshot();
        let principal = auth_from_token(&cfg, token.as_deref()).map_err(|err| to_mcp_error(&err))?;
        let engine = Arc::new(RouterEngine::new(
            self.shared.config.clone(),
            self.shared.manager.clone(),
            self.shared.breaker.clone(),
            self.shared.health.clone(),
            self.shared.limiter.clone(),
            principal,
        ));
        *binding = Some(SessionBinding {
            fingerprint,
            engine: engine.clone(),
        });
        Ok(engine)
    }
}

impl ServerHandler for RelaySession {
    async fn initialize(
        &self,
        _request: InitializeRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, ErrorData> {
        self.session_engine(&context).await?;
        Ok(self.get_info())
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        let engine = self.session_engine(&context).await?;
        let tools = engine
            .exposed_tools()
            .await
            .map_err(|err| to_mcp_error(&err))?;
        Ok(ListToolsResult::with_all_items(tools))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        let engine = self.session_engine(&context).await?;
        engine
            .dispatch_tool(request.name.as_ref(), request.arguments)
            .await
            .map_err(|err| to_mcp_error(&err))
    }

    fn get_info(&self) -> ServerInfo {
        let mut info = ServerInfo::default();
        info.server_info.name = "mcp-relay".to_string();
        info.server_info.version = env!("CARGO_PKG_VERSION").to_string();
        info.capabilities = ServerCapabilities::builder().enable_tools().build();
        info
    }
}

/// Translate the router taxonomy into a JSON-RPC error.
pub fn to_mcp_error(error: &RouterError) -> ErrorData {
    let data = match error {
        RouterError::RateLimited { retry_after_secs } => {
            Some(json!({ "retryAfterSeconds": retry_after_secs }))
        }
        _ => None,
    };
    ErrorData::new(ErrorCode(error.code()), error.to_string(), data)
}
