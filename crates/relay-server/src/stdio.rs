//! The stdio front-end: one session over the process's own stdin/stdout,
//! with the principal derived from a startup token.

use std::sync::Arc;

use anyhow::{Context, Result};
use rmcp::service::ServiceExt;

use crate::service::{RelaySession, SharedState};

/// Serve a single session until the downstream closes the stream.
pub async fn run_stdio(shared: Arc<SharedState>, token: Option<String>) -> Result<()> {
    let session = RelaySession::new_fixed(shared, token);
    let service = session
        .serve((tokio::io::stdin(), tokio::io::stdout()))
        .await
        .context("failed to start stdio session")?;

    tracing::info!("stdio front-end serving");
    service
        .waiting()
        .await
        .context("stdio session ended with error")?;
    tracing::info!("stdio front-end closed by downstream");
    Ok(())
}
