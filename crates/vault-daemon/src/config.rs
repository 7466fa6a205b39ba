//! Command-line and environment configuration.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const DEFAULT_GIST_API: &str = "https://api.github.com";
pub const DEFAULT_ENCRYPTION_URL: &str = "https://cloudflare-encryption.ai-context-vault.workers.dev";

/// Name of the data directory under the platform data dir.
const APP_DIR: &str = "ai-context-vault";

#[derive(Parser, Debug)]
#[command(name = "vault-daemon")]
#[command(about = "AI Context Vault note sync")]
pub struct Args {
    /// Directory holding the local store and attachment blobs
    #[arg(long, env = "VAULT_DATA_DIR")]
    pub data_dir: Option<String>,

    /// GitHub API base URL
    #[arg(long, env = "VAULT_GIST_API", default_value = DEFAULT_GIST_API)]
    pub gist_api: String,

    /// Token encryption endpoint
    #[arg(long, env = "VAULT_ENCRYPTION_URL", default_value = DEFAULT_ENCRYPTION_URL)]
    pub encryption_url: String,

    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Store the Gist and an encrypted access token
    Configure {
        /// Gist URL or id
        #[arg(long)]
        gist: String,
        /// GitHub personal access token with gist scope
        #[arg(long)]
        token: String,
    },
    /// Add a note to a conversation
    Add {
        domain: String,
        chat: String,
        text: String,
    },
    /// Delete a note and sync the deletion
    Delete {
        domain: String,
        chat: String,
        id: String,
    },
    /// Print the notes of a conversation
    List { domain: String, chat: String },
    /// Run one reconciliation cycle
    Sync {
        /// Adopt the remote copy instead of merging local changes into it
        #[arg(long)]
        remote_only: bool,
    },
    /// Drop the local activity log (the remote copy is kept)
    ClearLogs,
    /// Poll for remote changes and sync activity logs until interrupted
    Run {
        #[arg(long)]
        domain: Option<String>,
        #[arg(long)]
        chat: Option<String>,
    },
}

/// Resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub gist_api: String,
    pub encryption_url: String,
}

impl Config {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let data_dir = match &args.data_dir {
            Some(dir) => expand_tilde(dir),
            None => dirs::data_dir()
                .map(|dir| dir.join(APP_DIR))
                .ok_or(ConfigError::NoDataDir)?,
        };

        Ok(Self {
            data_dir,
            gist_api: validate_url("gist-api", &args.gist_api)?,
            encryption_url: validate_url("encryption-url", &args.encryption_url)?,
        })
    }

    /// The local key/value store document.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("store.json")
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }
}

fn validate_url(name: &'static str, value: &str) -> Result<String, ConfigError> {
    reqwest::Url::parse(value).map_err(|e| ConfigError::InvalidUrl {
        name,
        reason: e.to_string(),
    })?;
    Ok(value.trim_end_matches('/').to_string())
}

/// Expand ~ or ~/ prefix to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"))
    } else if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path))
    } else {
        PathBuf::from(path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no platform data directory; pass --data-dir or set VAULT_DATA_DIR")]
    NoDataDir,

    #[error("invalid --{name}: {reason}")]
    InvalidUrl { name: &'static str, reason: String },
}
