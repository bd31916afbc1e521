use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// CLI surface definition.
#[derive(Parser, Debug)]
#[command(
    name = "dbseal",
    about = "Transparent at-rest encryption for SQLite database files",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Use this config file instead of the platform default.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print version and exit.
    Version,
    /// Seal and unseal a probe database in a scratch directory.
    Health,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Work with encrypted database files.
    #[command(subcommand)]
    Db(DbCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum DbCommand {
    /// Report whether each file is absent, plaintext or sealed (no key needed).
    Status {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Seal legacy plaintext files in place.
    Seal {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Re-encrypt already sealed files too (picks up new KDF settings).
        #[arg(long)]
        force: bool,
    },
    /// Run SQL against a database through the encryption layer.
    Exec { path: PathBuf, sql: String },
    /// Re-encrypt databases under a new master key.
    Rotate {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Environment variable holding the new master passphrase.
        #[arg(long, default_value = "DBSEAL_NEW_MASTER_KEY")]
        new_key_env: String,
    },
}
