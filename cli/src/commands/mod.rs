// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! CLI command implementations

pub mod app;
pub mod daemon;
pub mod fleet;
pub mod keys;
pub mod secrets;

pub use app::AppCommand;
pub use daemon::DaemonCommand;
pub use fleet::FleetCommand;
pub use keys::KeysCommand;
pub use secrets::SecretsCommand;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use shipyard_core::domain::envelope::{EncryptedEnv, Response};
use shipyard_core::infrastructure::crypto::seal_env;
use shipyard_core::infrastructure::key_store::CliIdentity;

use crate::config::CliConfig;
use crate::daemon::DaemonClient;

/// Load the CLI configuration and identity, then build a signing daemon client.
pub(crate) fn daemon_client(config: &CliConfig) -> Result<DaemonClient> {
    let identity = CliIdentity::load_or_create(&config.identity_path, &config.identity_name())
        .with_context(|| format!("Failed to load CLI identity at {:?}", config.identity_path))?;
    DaemonClient::new(&config.daemon_url, identity)
}

/// Seal `secrets` to the pinned daemon key, or to the key the daemon currently advertises.
pub(crate) async fn seal_for_daemon(
    config: &CliConfig,
    client: &DaemonClient,
    secrets: &BTreeMap<String, String>,
) -> Result<EncryptedEnv> {
    let (key_id, public) = match config.daemon_key()? {
        Some(pinned) => pinned,
        None => {
            let identity = client.daemon_identity().await?;
            warn!(
                key_id = %identity.key_id.short(),
                fingerprint = %identity.ecdh_fingerprint,
                "No daemon key pinned in the CLI configuration, using the advertised key"
            );
            let public = crate::config::decode_public_key(&identity.ecdh_public)?;
            (identity.key_id, public)
        }
    };
    seal_env(secrets, &key_id, &public).context("Failed to encrypt secrets")
}

/// Collect `KEY=VALUE` pairs from the command line and an optional env file.
/// Command-line values win over the file.
pub(crate) fn collect_env(pairs: &[String], env_file: Option<&Path>) -> Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    if let Some(path) = env_file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read env file {:?}", path))?;
        for (number, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = parse_pair(line)
                .with_context(|| format!("{}:{}: expected KEY=VALUE", path.display(), number + 1))?;
            env.insert(key, unquote(value).to_string());
        }
    }
    for pair in pairs {
        let (key, value) = parse_pair(pair).with_context(|| format!("expected KEY=VALUE, got '{}'", pair))?;
        env.insert(key, value.to_string());
    }
    Ok(env)
}

fn parse_pair(pair: &str) -> Option<(String, &str)> {
    let (key, value) = pair.split_once('=')?;
    let key = key.trim();
    let valid = !key.is_empty()
        && !key.starts_with(|c: char| c.is_ascii_digit())
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    valid.then(|| (key.to_string(), value))
}

fn unquote(value: &str) -> &str {
    let value = value.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = value.strip_prefix(quote).and_then(|v| v.strip_suffix(quote)) {
            return inner;
        }
    }
    value
}

/// A token cancelled by the first Ctrl+C.
pub(crate) fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "Cancelling...".yellow());
            child.cancel();
        }
    });
    token
}

/// A remote command finished with a non-zero status. `main` turns it into the
/// process exit code after sessions are closed.
#[derive(Debug, thiserror::Error)]
#[error("{server}: remote command exited with status {status}")]
pub struct RemoteExit {
    pub server: String,
    pub status: i32,
}

impl RemoteExit {
    /// Statuses that do not fit a process exit code collapse to 1.
    pub fn exit_code(&self) -> u8 {
        u8::try_from(self.status).ok().filter(|code| *code != 0).unwrap_or(1)
    }
}

/// Exit code carried by a command error, if it wraps a [`RemoteExit`].
pub fn remote_exit_code(err: &anyhow::Error) -> Option<u8> {
    err.downcast_ref::<RemoteExit>().map(RemoteExit::exit_code)
}

/// Print the daemon's answer; a failed response becomes the command's error.
pub(crate) fn report(response: &Response) -> Result<()> {
    if response.success {
        println!("{} {}", "✓".green(), response.message);
        Ok(())
    } else {
        println!("{} {}", "✗".red(), response.message.red());
        anyhow::bail!("daemon rejected the request")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_env_merges_file_and_flags() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join(".env");
        std::fs::write(
            &file,
            "# database\nexport DB_PASS=\"from file\"\nDB_USER=app\n\nAPI_KEY='k=v'\n",
        )
        .unwrap();

        let env = collect_env(&["DB_PASS=override".to_string()], Some(&file)).unwrap();
        assert_eq!(env["DB_PASS"], "override");
        assert_eq!(env["DB_USER"], "app");
        assert_eq!(env["API_KEY"], "k=v");
        assert_eq!(env.len(), 3);
    }

    #[test]
    fn test_remote_exit_status_becomes_exit_code() {
        let exit = |status| -> anyhow::Error {
            RemoteExit {
                server: "web-1".to_string(),
                status,
            }
            .into()
        };
        assert_eq!(remote_exit_code(&exit(3)), Some(3));
        assert_eq!(remote_exit_code(&exit(-1)), Some(1));
        assert_eq!(remote_exit_code(&exit(300)), Some(1));
        assert_eq!(remote_exit_code(&exit(7).context("while running exec")), Some(7));
        assert_eq!(remote_exit_code(&anyhow::anyhow!("connection refused")), None);
    }

    #[test]
    fn test_collect_env_rejects_bad_keys() {
        assert!(collect_env(&["NOVALUE".to_string()], None).is_err());
        assert!(collect_env(&["1ABC=x".to_string()], None).is_err());
        assert!(collect_env(&["BAD-KEY=x".to_string()], None).is_err());
        assert_eq!(collect_env(&["EMPTY=".to_string()], None).unwrap()["EMPTY"], "");
    }
}
