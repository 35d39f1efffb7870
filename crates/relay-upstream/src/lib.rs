//! Upstream connection layer: one capability trait with pipe (child process)
//! and streaming-HTTP implementations, plus the keyed manager that owns all
//! live clients.

pub mod classify;
pub mod env;
pub mod http;
pub mod manager;
pub mod pipe;
pub mod tool;

use async_trait::async_trait;
use rmcp::model::CallToolResult;

use relay_core::error::RouterError;

pub use http::HttpUpstream;
pub use manager::UpstreamManager;
pub use pipe::PipeUpstream;
pub use tool::ToolRecord;

/// The capability every upstream exposes regardless of transport.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Fetch the upstream's tool list.
    async fn list_tools(&self) -> Result<Vec<ToolRecord>, RouterError>;

    /// Invoke one tool by its upstream-local name.
    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<CallToolResult, RouterError>;

    /// Release the connection (and child process, for pipe transports).
    async fn close(&self);
}
