//! Pipe-transport upstream: a child process speaking MCP over its stdio.
//!
//! Guardrails run before any spawn, the child sees only the filtered
//! environment, and failures inside one operation are retried per the
//! upstream's restart policy with a reconnect before each retry. Closing is
//! two-phase: end stdin, give the child a grace period, SIGTERM, another
//! grace period, then SIGKILL. The child is never orphaned.

use std::process::Stdio;
use std::time::Duration;

use rmcp::RoleClient;
use rmcp::model::{CallToolRequestParam, CallToolResult};
use rmcp::service::{RunningService, ServiceExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::RwLock;
use tokio::time::timeout;

use relay_config::{StderrMode, StdioSandboxConfig, UpstreamConfig};
use relay_core::error::RouterError;

use crate::classify::{connect_error, map_service_error, timeout_error};
use crate::env::{build_child_env, check_sandbox};
use crate::tool::ToolRecord;
use crate::UpstreamClient;

/// Grace period for each phase of the close sequence.
const CLOSE_GRACE: Duration = Duration::from_secs(2);
/// Logged stderr lines are truncated to this many bytes.
const STDERR_LINE_CAP: usize = 4096;

pub struct PipeUpstream {
    name: String,
    cfg: UpstreamConfig,
    sandbox: StdioSandboxConfig,
    state: RwLock<Option<Connection>>,
}

struct Connection {
    service: RunningService<RoleClient, ()>,
    child: tokio::process::Child,
}

impl PipeUpstream {
    pub fn new(name: String, cfg: UpstreamConfig, sandbox: StdioSandboxConfig) -> Self {
        Self {
            name,
            cfg,
            sandbox,
            state: RwLock::new(None),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.cfg.timeout_ms())
    }

    /// Connect if disconnected. Concurrent connectors coalesce on the write
    /// lock: the first performs the spawn and handshake, the rest observe
    /// the established connection.
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

    async fn connect(&self) -> Result<Connection, RouterError> {
        check_sandbox(&self.name, &self.cfg, &self.sandbox)?;

        let command = self
            .cfg
            .command
            .as_deref()
            .ok_or_else(|| connect_error(&self.name, "pipe transport without command"))?;
        let env = build_child_env(&self.cfg.env, &self.sandbox, std::env::vars());

        let mut cmd = Command::new(command);
        cmd.args(&self.cfg.args);
        if let Some(cwd) = &self.cfg.cwd {
            cmd.current_dir(cwd);
        }
        cmd.env_clear();
        cmd.envs(&env);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(match self.cfg.stderr_mode {
            StderrMode::Log => Stdio::piped(),
            StderrMode::Ignore => Stdio::null(),
        });
        cmd.kill_on_drop(true);

        // Isolate the child in its own process group.
        // SAFETY: setsid() is async-signal-safe and runs before exec.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| connect_error(&self.name, format!("failed to spawn '{command}': {err}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| connect_error(&self.name, "failed to capture child stdout"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| connect_error(&self.name, "failed to capture child stdin"))?;
        if let Some(stderr) = child.stderr.take() {
            let server = self.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(mut line)) = lines.next_line().await {
                    if line.len() > STDERR_LINE_CAP {
                        line.truncate(STDERR_LINE_CAP);
                    }
                    tracing::debug!(server = %server, "{line}");
                }
            });
        }

        let service = ().serve((stdout, stdin)).await.map_err(|err| {
            connect_error(&self.name, format!("MCP handshake failed: {err}"))
        })?;

        tracing::debug!(server = %self.name, command, "pipe upstream connected");
        Ok(Connection { service, child })
    }

    /// Drop the connection and terminate the child.
    async fn teardown(&self) {
        let conn = self.state.write().await.take();
        if let Some(conn) = conn {
            tracing::debug!(server = %self.name, "pipe upstream disconnected");
            close_connection(conn).await;
        }
    }

    async fn list_tools_once(&self) -> Result<Vec<ToolRecord>, RouterError> {
        let guard = self.state.read().await;
        let Some(conn) = guard.as_ref() else {
            return Err(connect_error(&self.name, "not connected"));
        };
        match timeout(self.timeout(), conn.service.list_tools(None)).await {
            Err(_) => Err(timeout_error(&self.name, self.cfg.timeout_ms())),
            Ok(Err(error)) => Err(map_service_error(&self.name, error)),
            Ok(Ok(response)) => Ok(response
                .tools
                .into_iter()
                .filter_map(ToolRecord::from_upstream)
                .collect()),
        }
    }

    async fn call_tool_once(
        &self,
        request: CallToolRequestParam,
    ) -> Result<CallToolResult, RouterError> {
        let guard = self.state.read().await;
        let Some(conn) = guard.as_ref() else {
            return Err(connect_error(&self.name, "not connected"));
        };
        match timeout(self.timeout(), conn.service.call_tool(request)).await {
            Err(_) => Err(timeout_error(&self.name, self.cfg.timeout_ms())),
            Ok(Err(error)) => Err(map_service_error(&self.name, error)),
            Ok(Ok(response)) => Ok(response),
        }
    }
}

#[async_trait::async_trait]
impl UpstreamClient for PipeUpstream {
    async fn list_tools(&self) -> Result<Vec<ToolRecord>, RouterError> {
        let mut last_err: Option<RouterError> = None;

        for attempt in 0..=self.cfg.restart.max_retries {
            if attempt > 0 {
                let delay = self.cfg.restart.delay_ms(attempt - 1);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if let Err(error) = self.ensure_connected().await {
                tracing::warn!(server = %self.name, error = %error, "pipe connect failed");
                last_err = Some(error);
                continue;
            }
            match self.list_tools_once().await {
                Ok(tools) => return Ok(tools),
                Err(error @ RouterError::Protocol(_)) => return Err(error),
                Err(error) => {
                    tracing::warn!(
                        server = %self.name,
                        error = %error,
                        "list_tools failed, restarting upstream"
                    );
                    self.teardown().await;
                    last_err = Some(error);
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| connect_error(&self.name, "list_tools failed without error")))
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
        let mut last_err: Option<RouterError> = None;

        for attempt in 0..=self.cfg.restart.max_retries {
            if attempt > 0 {
                let delay = self.cfg.restart.delay_ms(attempt - 1);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if let Err(error) = self.ensure_connected().await {
                tracing::warn!(server = %self.name, error = %error, "pipe connect failed");
                last_err = Some(error);
                continue;
            }
            match self.call_tool_once(request.clone()).await {
                Ok(result) => return Ok(result),
                Err(error @ RouterError::Protocol(_)) => return Err(error),
                Err(error) => {
                    tracing::warn!(
                        server = %self.name,
                        error = %error,
                        "call_tool failed, restarting upstream"
                    );
                    self.teardown().await;
                    last_err = Some(error);
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| connect_error(&self.name, "call_tool failed without error")))
    }

    async fn close(&self) {
        self.teardown().await;
    }
}

/// Two-phase child shutdown: end stdin (cancelling the service closes the
/// pipes), wait, SIGTERM, wait, SIGKILL.
async fn close_connection(conn: Connection) {
    let Connection { service, mut child } = conn;
    let _ = service.cancel().await;

    if wait_with_grace(&mut child).await {
        return;
    }

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: kill with SIGTERM on a child we own.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }

    if wait_with_grace(&mut child).await {
        return;
    }

    let _ = child.kill().await;
    let _ = child.wait().await;
}

async fn wait_with_grace(child: &mut tokio::process::Child) -> bool {
    matches!(timeout(CLOSE_GRACE, child.wait()).await, Ok(Ok(_)))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    /// Minimal MCP server as a shell script: answers initialize, tools/list
    /// and tools/call over line-delimited JSON-RPC.
    fn write_mock_server(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("mock-mcp.sh");
        std::fs::write(
            &path,
            r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([0-9]*\).*/\1/p')
  case "$line" in
    *\"initialize\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"mock","version":"0.1.0"}}}\n' "$id"
      ;;
    *\"notifications/initialized\"*)
      ;;
    *\"tools/list\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"echo a message","inputSchema":{"type":"object","properties":{"message":{"type":"string"}}}}]}}\n' "$id"
      ;;
    *\"tools/call\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id"
      ;;
  esac
done
"#,
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn pipe_cfg(script: &std::path::Path) -> UpstreamConfig {
        serde_json::from_str(&format!(
            r#"{{
                "transport": "pipe",
                "command": "sh",
                "args": ["{}"],
                "timeoutMs": 5000,
                "restart": {{"maxRetries": 1, "initialDelayMs": 10, "maxDelayMs": 50, "factor": 2.0}}
            }}"#,
            script.display()
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn list_and_call_through_mock_child() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_mock_server(dir.path());
        let upstream = PipeUpstream::new(
            "mock".to_string(),
            pipe_cfg(&script),
            StdioSandboxConfig::default(),
        );

        let tools = upstream.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");

        let result = upstream
            .call_tool("echo", Some(serde_json::Map::new()))
            .await
            .unwrap();
        assert_eq!(
            result.content[0].as_text().map(|t| t.text.as_str()),
            Some("pong")
        );

        upstream.close().await;
    }

    #[tokio::test]
    async fn sandbox_violation_refuses_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_mock_server(dir.path());
        let sandbox = StdioSandboxConfig {
            allowed_commands: Some(vec!["node".to_string()]),
            ..Default::default()
        };
        let upstream = PipeUpstream::new("mock".to_string(), pipe_cfg(&script), sandbox);

        let err = upstream.list_tools().await.unwrap_err();
        assert!(err.to_string().contains("allowedCommands"), "{err}");
    }

    #[tokio::test]
    async fn missing_command_surfaces_as_unavailable() {
        let cfg: UpstreamConfig = serde_json::from_str(
            r#"{
                "transport": "pipe",
                "command": "/nonexistent/definitely-not-here",
                "timeoutMs": 1000,
                "restart": {"maxRetries": 0, "initialDelayMs": 10, "maxDelayMs": 10, "factor": 1.0}
            }"#,
        )
        .unwrap();
        let upstream =
            PipeUpstream::new("gone".to_string(), cfg, StdioSandboxConfig::default());
        let err = upstream.list_tools().await.unwrap_err();
        assert!(matches!(err, RouterError::UpstreamUnavailable(_)), "{err}");
    }

    #[tokio::test]
    async fn explicit_env_reaches_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env-echo.sh");
        // Replies to tools/call with the value of $PROBE_VALUE.
        std::fs::write(
            &path,
            r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([0-9]*\).*/\1/p')
  case "$line" in
    *\"initialize\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"env","version":"0.1.0"}}}\n' "$id"
      ;;
    *\"tools/call\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"%s"}]}}\n' "$id" "$PROBE_VALUE"
      ;;
  esac
done
"#,
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();

        let mut cfg = pipe_cfg(&path);
        cfg.env = BTreeMap::from([("PROBE_VALUE".to_string(), "sentinel".to_string())]);
        let upstream =
            PipeUpstream::new("env".to_string(), cfg, StdioSandboxConfig::default());

        let result = upstream.call_tool("probe", None).await.unwrap();
        assert_eq!(
            result.content[0].as_text().map(|t| t.text.as_str()),
            Some("sentinel")
        );
        upstream.close().await;
    }
}
