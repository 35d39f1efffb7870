//! Keyed pool of upstream clients.
//!
//! The manager owns every live client. `get` hands out the existing client
//! for a name or constructs one lazily from the current config snapshot;
//! reconciliation closes and evicts clients whose upstream disappeared, was
//! disabled, or whose configuration fingerprint changed. Mutations are
//! serialized under one lock.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use relay_config::{NormalizedConfig, Transport};
use relay_core::error::RouterError;

use crate::http::HttpUpstream;
use crate::pipe::PipeUpstream;
use crate::UpstreamClient;

struct Entry {
    fingerprint: String,
    client: Arc<dyn UpstreamClient>,
}

#[derive(Default)]
pub struct UpstreamManager {
    clients: Mutex<HashMap<String, Entry>>,
}

impl UpstreamManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The client for `name`, constructing it from the snapshot on first use.
    ///
    /// A client built from a stale fingerprint is replaced in place, so a
    /// caller holding an older snapshot keeps the configuration it started
    /// with while new calls pick up the reload.
    pub async fn get(
        &self,
        name: &str,
        cfg: &NormalizedConfig,
    ) -> Result<Arc<dyn UpstreamClient>, RouterError> {
        let upstream_cfg = cfg
            .upstream(name)
            .ok_or_else(|| RouterError::BadRequest(format!("unknown upstream '{name}'")))?;
        if !upstream_cfg.enabled {
            return Err(RouterError::UpstreamUnavailable(format!(
                "upstream '{name}' is disabled"
            )));
        }

        let fingerprint = upstream_cfg.fingerprint();
        let mut clients = self.clients.lock().await;

        if let Some(entry) = clients.get(name) {
            if entry.fingerprint == fingerprint {
                return Ok(entry.client.clone());
            }
        }

        let client: Arc<dyn UpstreamClient> = match upstream_cfg.transport {
            Transport::Pipe => Arc::new(PipeUpstream::new(
                name.to_string(),
                upstream_cfg.clone(),
                cfg.sandbox.stdio.clone(),
            )),
            Transport::Http => {
                Arc::new(HttpUpstream::new(name.to_string(), upstream_cfg.clone()))
            }
        };

        if let Some(stale) = clients.insert(
            name.to_string(),
            Entry {
                fingerprint,
                client: client.clone(),
            },
        ) {
            tracing::info!(server = %name, "upstream config changed, replacing client");
            let old = stale.client;
            tokio::spawn(async move { old.close().await });
        }

        Ok(client)
    }

    /// Diff the live set against a new snapshot: close and evict clients for
    /// upstreams that disappeared, were disabled, or changed. Additions stay
    /// lazy.
    pub async fn reconcile(&self, cfg: &NormalizedConfig) {
        let mut evicted = Vec::new();
        {
            let mut clients = self.clients.lock().await;
            clients.retain(|name, entry| {
                let keep = cfg
                    .upstream(name)
                    .filter(|upstream| upstream.enabled)
                    .map(|upstream| upstream.fingerprint() == entry.fingerprint)
                    .unwrap_or(false);
                if !keep {
                    tracing::info!(server = %name, "closing upstream after config change");
                    evicted.push(entry.client.clone());
                }
                keep
            });
        }

        for client in evicted {
            client.close().await;
        }
    }

    /// Drain every upstream concurrently and await completion.
    pub async fn close_all(&self) {
        let drained: Vec<_> = {
            let mut clients = self.clients.lock().await;
            clients.drain().map(|(_, entry)| entry.client).collect()
        };

        let mut set = tokio::task::JoinSet::new();
        for client in drained {
            set.spawn(async move { client.close().await });
        }
        while set.join_next().await.is_some() {}
    }

    /// Number of live clients (diagnostics).
    pub async fn live_count(&self) -> usize {
        self.clients.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_config::parse_config;

    fn config(json: &str) -> NormalizedConfig {
        parse_config(json).unwrap()
    }

    #[tokio::test]
    async fn get_returns_the_same_client_for_unchanged_config() {
        let manager = UpstreamManager::new();
        let cfg = config(
            r#"{"mcpServers": {"a": {"transport": "http", "url": "https://a.example/mcp"}}}"#,
        );

        let first = manager.get("a", &cfg).await.unwrap();
        let second = manager.get("a", &cfg).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.live_count().await, 1);
    }

    #[tokio::test]
    async fn unknown_upstream_is_a_bad_request() {
        let manager = UpstreamManager::new();
        let cfg = config("{}");
        let err = manager.get("nope", &cfg).await.unwrap_err();
        assert!(matches!(err, RouterError::BadRequest(_)));
    }

    #[tokio::test]
    async fn disabled_upstream_is_unavailable() {
        let manager = UpstreamManager::new();
        let cfg = config(r#"{"mcpServers": {"a": {"transport": "http", "enabled": false}}}"#);
        let err = manager.get("a", &cfg).await.unwrap_err();
        assert!(matches!(err, RouterError::UpstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn changed_fingerprint_replaces_the_client() {
        let manager = UpstreamManager::new();
        let before = config(
            r#"{"mcpServers": {"a": {"transport": "http", "url": "https://a.example/mcp"}}}"#,
        );
        let after = config(
            r#"{"mcpServers": {"a": {"transport": "http", "url": "https://a.example/mcp", "timeoutMs": 1000}}}"#,
        );

        let first = manager.get("a", &before).await.unwrap();
        let second = manager.get("a", &after).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(manager.live_count().await, 1);
    }

    #[tokio::test]
    async fn reconcile_evicts_removed_disabled_and_changed() {
        let manager = UpstreamManager::new();
        let initial = config(
            r#"{"mcpServers": {
                "gone": {"transport": "http", "url": "https://gone.example/mcp"},
                "off": {"transport": "http", "url": "https://off.example/mcp"},
                "changed": {"transport": "http", "url": "https://changed.example/mcp"},
                "kept": {"transport": "http", "url": "https://kept.example/mcp"}
            }}"#,
        );
        for name in ["gone", "off", "changed", "kept"] {
            manager.get(name, &initial).await.unwrap();
        }
        assert_eq!(manager.live_count().await, 4);

        let reloaded = config(
            r#"{"mcpServers": {
                "off": {"transport": "http", "url": "https://off.example/mcp", "enabled": false},
                "changed": {"transport": "http", "url": "https://changed.example/mcp", "timeoutMs": 1},
                "kept": {"transport": "http", "url": "https://kept.example/mcp"}
            }}"#,
        );
        manager.reconcile(&reloaded).await;
        assert_eq!(manager.live_count().await, 1);
    }

    #[tokio::test]
    async fn close_all_drains_every_client() {
        let manager = UpstreamManager::new();
        let cfg = config(
            r#"{"mcpServers": {
                "a": {"transport": "http", "url": "https://a.example/mcp"},
                "b": {"transport": "http", "url": "https://b.example/mcp"}
            }}"#,
        );
        manager.get("a", &cfg).await.unwrap();
        manager.get("b", &cfg).await.unwrap();
        manager.close_all().await;
        assert_eq!(manager.live_count().await, 0);
    }
}
