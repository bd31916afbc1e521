mod cli;
mod config;
mod db;
mod storage;

use std::path::Path;

use crate::cli::ConfigCommand;
use clap::Parser;
use color_eyre::Result;
use dbseal_storage::{
    file_state::FileStatus, key_provider::InMemoryKeyProvider, EncryptedStoreManager,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = match &cli.config {
        Some(path) => config::load_from_path(path)?,
        None => config::load()?,
    };
    match cli.command {
        cli::Command::Version => print_version(),
        cli::Command::Health => run_health_check(&config).await?,
        cli::Command::Config(ConfigCommand::Init) => init_config(&config, cli.config)?,
        cli::Command::Db(cmd) => db::handle(cmd, &config).await?,
    }

    Ok(())
}

fn init_tracing() {
    // Respect user-provided filters, default to info to avoid noisy stdout.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("dbseal {}", env!("CARGO_PKG_VERSION"));
}

/// Seal, inspect and reopen a probe database under the configured KDF
/// settings. Uses a throwaway key so the real key source is never touched.
async fn run_health_check(config: &config::Config) -> Result<()> {
    let provider = InMemoryKeyProvider::default();
    let manager = storage::manager_from_config(config, &provider).await?;
    tokio::task::spawn_blocking(move || -> Result<()> {
        let dir = tempfile::tempdir()?;
        run_store_health(&manager, &dir.path().join("probe.db"))
    })
    .await??;
    println!("Storage: ok");
    Ok(())
}

fn run_store_health(manager: &EncryptedStoreManager, probe: &Path) -> Result<()> {
    manager.with_database(probe, |db| -> Result<()> {
        db.execute_batch(
            "CREATE TABLE probe (value TEXT NOT NULL);
             INSERT INTO probe (value) VALUES ('ok');",
        )?;
        Ok(())
    })?;

    if !matches!(manager.inspect(probe)?, FileStatus::Sealed { .. }) {
        color_eyre::eyre::bail!("probe database was not sealed on close");
    }

    let value: String = manager.with_database(probe, |db| -> Result<String> {
        Ok(db.query_row("SELECT value FROM probe", [], |row| row.get(0))?)
    })?;
    if value != "ok" {
        color_eyre::eyre::bail!("storage round-trip failed");
    }
    if !manager.active_paths()?.is_empty() {
        color_eyre::eyre::bail!("probe database left a working copy behind");
    }
    Ok(())
}

fn init_config(config: &config::Config, target: Option<std::path::PathBuf>) -> Result<()> {
    let path = match target {
        Some(path) => path,
        None => config::default_path()?,
    };
    let path = config::write_if_missing(config, &path)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}
