// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Key management commands
//!
//! `init`, `rotate`, `show`, `trust` and `revoke` act on the daemon's key directory and
//! run on the daemon host. `identity` manages this CLI's signing key.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::time::Duration;

use shipyard_core::domain::daemon_config::DaemonConfigManifest;
use shipyard_core::domain::keys::TrustStore;
use shipyard_core::infrastructure::key_store::{CliIdentity, FileKeyStore};

use crate::config::{decode_public_key, CliConfig};

#[derive(Args, Clone)]
pub struct KeyStoreArgs {
    /// Key directory (defaults to spec.keys.directory of the daemon configuration)
    #[arg(long, env = "SHIPYARD_KEY_DIR", value_name = "DIR")]
    key_dir: Option<PathBuf>,

    /// Daemon configuration file used to locate the key directory
    #[arg(long = "daemon-config", env = "SHIPYARD_CONFIG_PATH", value_name = "FILE")]
    daemon_config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum KeysCommand {
    /// Generate the daemon key pair if it does not exist yet
    Init {
        #[command(flatten)]
        store: KeyStoreArgs,
    },

    /// Replace the active daemon key; the old one decrypts until its grace period ends
    Rotate {
        #[command(flatten)]
        store: KeyStoreArgs,
    },

    /// Show the active key, retired keys and trusted peers
    Show {
        #[command(flatten)]
        store: KeyStoreArgs,
    },

    /// Trust a CLI signing key (hex Ed25519 public key from `shipyard keys identity`)
    Trust {
        name: String,
        public_key: String,
        #[command(flatten)]
        store: KeyStoreArgs,
    },

    /// Remove a trusted peer
    Revoke {
        name: String,
        #[command(flatten)]
        store: KeyStoreArgs,
    },

    /// Show (creating on first use) this CLI's signing identity
    Identity,
}

pub async fn handle_command(command: KeysCommand, config_path: Option<PathBuf>) -> Result<()> {
    match command {
        KeysCommand::Init { store } => init(store),
        KeysCommand::Rotate { store } => rotate(store),
        KeysCommand::Show { store } => show(store),
        KeysCommand::Trust {
            name,
            public_key,
            store,
        } => trust(store, &name, &public_key),
        KeysCommand::Revoke { name, store } => revoke(store, &name),
        KeysCommand::Identity => identity(config_path),
    }
}

fn locate(args: &KeyStoreArgs) -> Result<(PathBuf, Duration)> {
    let config = DaemonConfigManifest::load_or_default(args.daemon_config.clone())
        .context("Failed to load daemon configuration")?;
    let dir = args
        .key_dir
        .clone()
        .unwrap_or_else(|| config.spec.keys.directory.clone());
    Ok((dir, Duration::from_secs(config.spec.keys.rotation_grace_secs)))
}

fn open_existing(args: &KeyStoreArgs) -> Result<FileKeyStore> {
    let (dir, grace) = locate(args)?;
    if !FileKeyStore::is_initialized(&dir) {
        anyhow::bail!(
            "No daemon keys in {}. Run 'shipyard keys init' first.",
            dir.display()
        );
    }
    FileKeyStore::open_or_init(&dir, grace)
        .with_context(|| format!("Failed to open key store at {}", dir.display()))
}

fn init(args: KeyStoreArgs) -> Result<()> {
    let (dir, grace) = locate(&args)?;
    if FileKeyStore::is_initialized(&dir) {
        println!("{}", format!("✓ Daemon keys already exist in {}", dir.display()).green());
    } else {
        FileKeyStore::open_or_init(&dir, grace)
            .with_context(|| format!("Failed to initialize key store at {}", dir.display()))?;
        println!("{}", format!("✓ Generated daemon keys in {}", dir.display()).green());
    }
    show(args)
}

fn rotate(args: KeyStoreArgs) -> Result<()> {
    let store = open_existing(&args)?;
    let previous = store.active().key_id.clone();
    let next = store.rotate().context("Key rotation failed")?;
    println!(
        "{}",
        format!("✓ Rotated {} -> {}", previous.short(), next.key_id.short()).green()
    );
    println!(
        "{}",
        "  A running daemon adopts the new key within a minute. Update CLI configs:".yellow()
    );
    print_pin(next.key_id.as_str(), &hex::encode(next.ecdh_public));
    Ok(())
}

fn show(args: KeyStoreArgs) -> Result<()> {
    let store = open_existing(&args)?;
    let active = store.active();

    println!("{}", "Active key".bold());
    println!("  Key ID:           {}", active.key_id);
    println!("  Created:          {}", active.created_at.to_rfc3339());
    println!("  X25519 public:    {}", hex::encode(active.ecdh_public));
    println!("  X25519 print:     {}", active.ecdh_fingerprint());
    println!("  Ed25519 public:   {}", hex::encode(active.sign_public));
    println!("  Ed25519 print:    {}", active.sign_fingerprint());

    let retired = store.retired();
    if !retired.is_empty() {
        println!();
        println!("{}", "Retired keys".bold());
        for (key_id, retired_at) in retired {
            println!("  {}  retired {}", key_id.short(), retired_at.to_rfc3339());
        }
    }

    println!();
    println!("{}", "Trusted peers".bold());
    let peers = store.peers();
    if peers.is_empty() {
        println!("  {}", "(none)".dimmed());
    }
    for peer in peers {
        println!("  {:<20} {}  added {}", peer.name, peer.fingerprint(), peer.added_at.to_rfc3339());
    }

    println!();
    println!("CLI configuration for this daemon:");
    print_pin(active.key_id.as_str(), &hex::encode(active.ecdh_public));
    Ok(())
}

fn print_pin(key_id: &str, ecdh_public: &str) {
    println!("  daemon_key_id: {}", key_id);
    println!("  daemon_ecdh_public: {}", ecdh_public);
}

fn trust(args: KeyStoreArgs, name: &str, public_key: &str) -> Result<()> {
    let store = open_existing(&args)?;
    let public = decode_public_key(public_key)?;
    let peer = store.trust_peer(name, public).context("Failed to trust peer")?;
    println!(
        "{}",
        format!("✓ Trusted '{}' ({})", peer.name, peer.fingerprint()).green()
    );
    Ok(())
}

fn revoke(args: KeyStoreArgs, name: &str) -> Result<()> {
    let store = open_existing(&args)?;
    if store.revoke_peer(name).context("Failed to revoke peer")? {
        println!("{}", format!("✓ Revoked '{}'", name).green());
        Ok(())
    } else {
        println!("{}", format!("✗ No trusted peer named '{}'", name).red());
        anyhow::bail!("unknown peer: {}", name)
    }
}

fn identity(config_path: Option<PathBuf>) -> Result<()> {
    let config = CliConfig::load_or_default(config_path)?;
    let identity = CliIdentity::load_or_create(&config.identity_path, &config.identity_name())
        .with_context(|| format!("Failed to load CLI identity at {:?}", config.identity_path))?;
    let public = hex::encode(identity.sign_public);

    println!("{}", "CLI identity".bold());
    println!("  Name:        {}", identity.name);
    println!("  Path:        {}", config.identity_path.display());
    println!("  Public key:  {}", public);
    println!("  Fingerprint: {}", identity.fingerprint());
    println!();
    println!("Authorize it on the daemon host with:");
    println!("  shipyard keys trust {} {}", identity.name, public);
    Ok(())
}
