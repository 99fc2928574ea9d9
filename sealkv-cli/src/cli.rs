//! Argument parsing and command dispatch.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use eyre::{eyre, Result};
use sealkv_core::config::DEFAULT_NAMESPACE;
use sealkv_core::platform::FileCredentialSubsystem;
use sealkv_core::{CredentialPolicy, EncryptedStorage, StorageError, StoreConfig};

const DATA_DIR_NAME: &str = "sealkv";
const KEY_DIR_NAME: &str = ".device";

#[derive(Debug, Parser)]
#[command(name = "sealkv", version, about = "Inspect and modify a SealKV encrypted store")]
pub struct Cli {
    /// Storage root [default: <data dir>/sealkv]
    #[arg(long, env = "SEALKV_ROOT", global = true)]
    pub root: Option<PathBuf>,

    /// Directory holding the development device key [default: <root>/.device]
    #[arg(long, env = "SEALKV_KEY_DIR", global = true)]
    pub key_dir: Option<PathBuf>,

    /// Store namespace under the root
    #[arg(long, env = "SEALKV_NAMESPACE", default_value = DEFAULT_NAMESPACE, global = true)]
    pub namespace: String,

    /// Refuse to unseal unless the device key is owner-only
    #[arg(long, env = "SEALKV_REQUIRE_CREDENTIAL", global = true)]
    pub require_credential: bool,

    /// Credential timeout in milliseconds
    #[arg(long, env = "SEALKV_TIMEOUT_MS", default_value_t = 30_000, global = true)]
    pub timeout_ms: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Store a value
    Set { key: String, value: String },
    /// Print a value; prints nothing when the key is absent
    Get { key: String },
    /// Remove a value
    Remove { key: String },
    /// Remove every value
    Clear,
    /// Report whether the device key is protected
    Protected,
    /// Replace the master key, re-encrypting every value
    Rotate,
}

impl Cli {
    fn root(&self) -> Result<PathBuf> {
        if let Some(root) = &self.root {
            return Ok(root.clone());
        }
        dirs::data_dir()
            .map(|dir| dir.join(DATA_DIR_NAME))
            .ok_or_else(|| eyre!("no platform data directory; pass --root"))
    }

    /// Device key directory; lives in the root but outside every namespace.
    pub fn key_dir(&self) -> Result<PathBuf> {
        match &self.key_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(self.root()?.join(KEY_DIR_NAME)),
        }
    }

    pub fn store_config(&self) -> Result<StoreConfig> {
        let policy = if self.require_credential {
            CredentialPolicy::RequireActiveCredential
        } else {
            CredentialPolicy::Advisory
        };
        let config = StoreConfig::new(self.root()?)
            .with_namespace(self.namespace.clone())
            .with_credential_policy(policy)
            .with_credential_timeout(Duration::from_millis(self.timeout_ms));
        config.validate().map_err(report)?;
        Ok(config)
    }
}

/// Runs `cli.command`, returning the text to print on success.
pub async fn run(cli: &Cli) -> Result<Option<String>> {
    let key_dir = cli.key_dir()?;
    let credential = FileCredentialSubsystem::open(&key_dir)
        .map_err(|err| eyre!("credential_unavailable: {err}"))?;
    let store = EncryptedStorage::open(cli.store_config()?, Arc::new(credential)).map_err(report)?;
    tracing::debug!(config = ?store.config(), key_dir = %key_dir.display(), "store opened");

    match &cli.command {
        Command::Set { key, value } => {
            store.set_item(key, value).await.map_err(report)?;
            Ok(None)
        }
        Command::Get { key } => store.get_item(key).await.map_err(report),
        Command::Remove { key } => {
            store.remove_item(key).await.map_err(report)?;
            Ok(None)
        }
        Command::Clear => {
            store.clear().await.map_err(report)?;
            Ok(None)
        }
        Command::Protected => {
            let protected = store.is_device_protected().await.map_err(report)?;
            Ok(Some(protected.to_string()))
        }
        Command::Rotate => {
            store.rotate_master_key().await.map_err(report)?;
            Ok(Some("master key rotated".to_string()))
        }
    }
}

fn report(err: StorageError) -> eyre::Report {
    eyre!("{}: {}", err.kind(), err.message())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("sealkv").chain(args.iter().copied()))
            .expect("parse args")
    }

    #[test]
    fn test_flags_map_to_config() {
        let cli = parse(&[
            "--root",
            "/tmp/sealkv-cli",
            "--namespace",
            "wallet",
            "--require-credential",
            "--timeout-ms",
            "250",
            "get",
            "token",
        ]);
        let config = cli.store_config().expect("config");
        assert_eq!(config.root, PathBuf::from("/tmp/sealkv-cli"));
        assert_eq!(config.namespace, "wallet");
        assert_eq!(config.credential_policy, CredentialPolicy::RequireActiveCredential);
        assert_eq!(config.credential_timeout(), Duration::from_millis(250));
        assert_eq!(
            cli.key_dir().expect("key dir"),
            PathBuf::from("/tmp/sealkv-cli/.device")
        );
        assert!(matches!(cli.command, Command::Get { ref key } if key == "token"));
    }

    #[test]
    fn test_invalid_namespace_is_reported() {
        let cli = parse(&["--root", "/tmp", "--namespace", "../x", "clear"]);
        let err = cli.store_config().expect_err("invalid namespace");
        assert!(err.to_string().starts_with("invalid_argument"));
    }

    #[tokio::test]
    async fn test_commands_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().to_str().expect("utf-8 path");

        let run_args = |args: &[&str]| {
            let mut full = vec!["--root", root];
            full.extend_from_slice(args);
            parse(&full)
        };

        assert_eq!(
            run(&run_args(&["set", "token", "abc123"])).await.expect("set"),
            None
        );
        assert_eq!(
            run(&run_args(&["get", "token"])).await.expect("get"),
            Some("abc123".to_string())
        );
        assert_eq!(
            run(&run_args(&["rotate"])).await.expect("rotate"),
            Some("master key rotated".to_string())
        );
        assert_eq!(
            run(&run_args(&["get", "token"])).await.expect("get"),
            Some("abc123".to_string())
        );
        assert_eq!(
            run(&run_args(&["protected"])).await.expect("protected"),
            Some("true".to_string())
        );
        run(&run_args(&["clear"])).await.expect("clear");
        assert_eq!(run(&run_args(&["get", "token"])).await.expect("get"), None);
        run(&run_args(&["remove", "token"])).await.expect("remove");
    }
}
