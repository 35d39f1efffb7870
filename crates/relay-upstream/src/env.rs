//! Child-process environment policy and sandbox guardrails for the pipe
//! transport.
//!
//! The child receives exactly: the OS default inherit set (plus any
//! configured extra keys), overlaid by the upstream's explicit `env` map.
//! Inherited values whose content begins with `()` are dropped — the
//! shellshock-style function-definition defense. Guardrails are checked
//! before any process is spawned.

use std::collections::BTreeMap;
use std::path::Path;

use relay_config::{StdioSandboxConfig, UpstreamConfig};
use relay_core::error::RouterError;

#[cfg(unix)]
const DEFAULT_INHERIT_KEYS: &[&str] = &["HOME", "LOGNAME", "PATH", "SHELL", "TERM", "USER"];

#[cfg(windows)]
const DEFAULT_INHERIT_KEYS: &[&str] = &[
    "ALLUSERSPROFILE",
    "APPDATA",
    "COMSPEC",
    "HOMEDRIVE",
    "HOMEPATH",
    "LOCALAPPDATA",
    "PATH",
    "PATHEXT",
    "PROGRAMDATA",
    "SYSTEMDRIVE",
    "SYSTEMROOT",
    "TEMP",
    "TMP",
    "USERNAME",
    "USERPROFILE",
    "WINDIR",
];

/// Build the exact environment a pipe-transport child receives.
pub fn build_child_env(
    explicit: &BTreeMap<String, String>,
    sandbox: &StdioSandboxConfig,
    host_env: impl Iterator<Item = (String, String)>,
) -> BTreeMap<String, String> {
    let extra = sandbox.inherit_env_keys.clone().unwrap_or_default();
    let inherit = |key: &str| {
        DEFAULT_INHERIT_KEYS.contains(&key) || extra.iter().any(|extra_key| extra_key == key)
    };

    let mut env = BTreeMap::new();
    for (key, value) in host_env {
        if !inherit(&key) {
            continue;
        }
        if value.starts_with("()") {
            continue;
        }
        env.insert(key, value);
    }
    for (key, value) in explicit {
        env.insert(key.clone(), value.clone());
    }
    env
}

/// Enforce the sandbox guardrails for one upstream before spawning.
pub fn check_sandbox(
    name: &str,
    cfg: &UpstreamConfig,
    sandbox: &StdioSandboxConfig,
) -> Result<(), RouterError> {
    let command = cfg.command.as_deref().unwrap_or_default();

    if let Some(allowed) = &sandbox.allowed_commands {
        if !allowed.iter().any(|c| c == command) {
            return Err(RouterError::UpstreamUnavailable(format!(
                "upstream '{name}': command '{command}' is not in sandbox.stdio.allowedCommands"
            )));
        }
    }

    if let (Some(cwd), Some(roots)) = (&cfg.cwd, &sandbox.allowed_cwd_roots) {
        let cwd = Path::new(cwd);
        let permitted = roots.iter().any(|root| cwd.starts_with(root));
        if !permitted {
            return Err(RouterError::UpstreamUnavailable(format!(
                "upstream '{name}': cwd '{}' is outside sandbox.stdio.allowedCwdRoots",
                cwd.display()
            )));
        }
    }

    if let Some(allowed_keys) = &sandbox.allowed_env_keys {
        for key in cfg.env.keys() {
            if !allowed_keys.iter().any(|k| k == key) {
                return Err(RouterError::UpstreamUnavailable(format!(
                    "upstream '{name}': env key '{key}' is not in sandbox.stdio.allowedEnvKeys"
                )));
            }
        }
    }

    Ok(())
}
