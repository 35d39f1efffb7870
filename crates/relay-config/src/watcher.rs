//! Debounced config-file watcher driving hot reload.
//!
//! Reload failures are logged and the last good configuration is retained; a
//! partial or invalid file never reaches readers.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::RecursiveMode;
use notify_debouncer_full::{DebounceEventResult, new_debouncer};
use tokio_util::sync::CancellationToken;

use crate::handle::ConfigPublisher;
use crate::model::load_config;

const DEBOUNCE: Duration = Duration::from_millis(250);

/// Watch `path` and publish each successfully reloaded configuration.
///
/// Watches the parent directory (editors commonly replace the file rather
/// than writing it in place) and filters events down to the target path.
pub fn spawn_config_watcher(
    path: PathBuf,
    publisher: ConfigPublisher,
    cancel: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<DebounceEventResult>(16);

    let mut debouncer = new_debouncer(DEBOUNCE, None, move |result: DebounceEventResult| {
        let _ = tx.blocking_send(result);
    })
    .context("failed to create config watcher")?;

    let watch_root = path
        .parent()
        .map(|p| p.to_path_buf())
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from("."));
    debouncer
        .watch(&watch_root, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", watch_root.display()))?;

    let target_name = path.file_name().map(|name| name.to_os_string());

    let handle = tokio::spawn(async move {
        // Keep the debouncer alive for the lifetime of the task.
        let _debouncer = debouncer;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = rx.recv() => {
                    let Some(result) = result else { break };
                    match result {
                        Ok(events) => {
                            let relevant = events.iter().any(|event| {
                                event.paths.iter().any(|p| {
                                    p.file_name().map(|n| n.to_os_string()) == target_name
                                })
                            });
                            if !relevant {
                                continue;
                            }
                            match load_config(&path) {
                                Ok(config) => {
                                    tracing::info!(
                                        path = %path.display(),
                                        upstreams = config.upstreams.len(),
                                        "configuration reloaded"
                                    );
                                    publisher.publish(config);
                                }
                                Err(error) => {
                                    tracing::warn!(
                                        path = %path.display(),
                                        error = %error,
                                        "config reload failed, retaining last good config"
                                    );
                                }
                            }
                        }
                        Err(errors) => {
                            for error in errors {
                                tracing::debug!(error = %error, "config watch error");
                            }
                        }
                    }
                }
            }
        }
    });

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::config_channel;
    use crate::model::parse_config;

    #[tokio::test]
    async fn reload_publishes_new_snapshot_and_keeps_last_good() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        std::fs::write(&path, "{}").unwrap();

        let (publisher, handle) = config_channel(parse_config("{}").unwrap());
        let cancel = CancellationToken::new();
        let task = spawn_config_watcher(path.clone(), publisher, cancel.clone()).unwrap();

        let mut waiter = handle.clone();
        std::fs::write(
            &path,
            r#"{"mcpServers": {"a": {"transport": "http", "url": "https://a.example/mcp"}}}"#,
        )
        .unwrap();
        tokio::time::timeout(Duration::from_secs(5), waiter.changed())
            .await
            .expect("reload should publish")
            .unwrap();
        assert_eq!(handle.snapshot().upstreams.len(), 1);

        // A broken write is logged and the previous snapshot is retained.
        std::fs::write(&path, "{not json").unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(handle.snapshot().upstreams.len(), 1);

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
    }
}
