use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use color_eyre::Result;
use dbseal_core::{ErrorKind, RotationOutcome, RotationReport, StoreError};
use dbseal_storage::{
    file_state::{self, FileStatus},
    key_provider::read_env_key,
    EncryptedStoreManager,
};
use rusqlite::{fallible_iterator::FallibleIterator, types::ValueRef, Batch};
use tracing::warn;

use crate::{cli::DbCommand, config::Config, storage};

/// Execute a database subcommand. Manager calls block, so they run on the
/// blocking pool.
pub async fn handle(cmd: DbCommand, config: &Config) -> Result<()> {
    match cmd {
        DbCommand::Status { paths, json } => {
            let statuses = status(config, &paths)?;
            if json {
                let by_path: BTreeMap<String, &FileStatus> = statuses
                    .iter()
                    .map(|(path, status)| (path.display().to_string(), status))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&by_path)?);
            } else {
                for (path, status) in &statuses {
                    println!("{}: {}", path.display(), describe(status));
                }
            }
        }
        DbCommand::Seal { paths, force } => {
            let provider = storage::key_provider(config);
            let manager = storage::manager_from_config(config, provider.as_ref()).await?;
            let paths = resolve_all(config, &paths);
            let results = blocking(move || Ok(seal_all(&manager, &paths, force))).await?;

            let mut failed = 0;
            for (path, result) in results {
                match result {
                    Ok(()) => println!("{}: sealed", path.display()),
                    Err(err) => {
                        failed += 1;
                        println!("{}: FAILED ({}) {err}", path.display(), err.kind());
                    }
                }
            }
            if failed > 0 {
                color_eyre::eyre::bail!("{failed} database(s) failed to seal");
            }
        }
        DbCommand::Exec { path, sql } => {
            let provider = storage::key_provider(config);
            let manager = storage::manager_from_config(config, provider.as_ref()).await?;
            let path = config.resolve(&path);
            let rows = blocking(move || exec(&manager, &path, &sql)).await?;
            for row in rows {
                println!("{row}");
            }
        }
        DbCommand::Rotate { paths, new_key_env } => {
            let new_key = read_env_key(&new_key_env)
                .map_err(|e| color_eyre::eyre::eyre!("new master key: {e}"))?;
            let provider = storage::key_provider(config);
            let manager = storage::manager_from_config(config, provider.as_ref()).await?;
            let paths = resolve_all(config, &paths);
            let rotation_key = new_key.clone();
            let report = blocking(move || Ok(manager.rotate_all(&paths, rotation_key))).await?;

            for (path, result) in &report {
                println!("{}: {}", path.display(), describe_rotation(result));
            }
            let failed = report.values().filter(|r| r.is_err()).count();
            let stranded = still_under_old_key(&report);
            if !stranded.is_empty() {
                warn!(
                    count = stranded.len(),
                    "keeping the previous master key; some databases still need it"
                );
                println!("Master key NOT replaced. Still sealed under the previous key:");
                for path in &stranded {
                    println!("  {}", path.display());
                }
                println!(
                    "Rotated files now need the key in {new_key_env}. Fix the failures and rerun the same command; files already under the new key are recognised."
                );
            } else if failed < report.len() {
                if let Err(err) = provider.replace(&new_key).await {
                    warn!(source = provider.name(), "new master key not persisted: {err}");
                    println!("New master key was not persisted ({err}); update the key source before the next run.");
                }
            }
            if failed > 0 {
                color_eyre::eyre::bail!("{failed} database(s) failed to rotate");
            }
        }
    }

    Ok(())
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

fn resolve_all(config: &Config, paths: &[PathBuf]) -> Vec<PathBuf> {
    paths.iter().map(|p| config.resolve(p)).collect()
}

/// Inspect files without touching key material.
fn status(config: &Config, paths: &[PathBuf]) -> Result<Vec<(PathBuf, FileStatus)>> {
    resolve_all(config, paths)
        .into_iter()
        .map(|path| {
            let status = file_state::inspect(&path)?;
            Ok((path, status))
        })
        .collect()
}

/// Open and close each path with sealing; `force` re-encrypts clean files.
fn seal_all(
    manager: &EncryptedStoreManager,
    paths: &[PathBuf],
    force: bool,
) -> Vec<(PathBuf, Result<(), StoreError>)> {
    paths
        .iter()
        .map(|path| {
            let result = manager.open(path).and_then(|mut handle| {
                if force {
                    handle.mark_dirty();
                }
                manager.close(handle, true)
            });
            (path.clone(), result)
        })
        .collect()
}

/// Run every statement in `sql` inside one open/close cycle. Rows from
/// statements that return columns are collected as tab-separated lines.
fn exec(manager: &EncryptedStoreManager, path: &Path, sql: &str) -> Result<Vec<String>> {
    manager.with_database(path, |db| -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut batch = Batch::new(db.connection(), sql);
        while let Some(mut stmt) = batch.next()? {
            let columns = stmt.column_count();
            if columns == 0 {
                stmt.execute([])?;
                continue;
            }
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let cells = (0..columns)
                    .map(|i| row.get_ref(i).map(render))
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                out.push(cells.join("\t"));
            }
        }
        Ok(out)
    })
}

/// Failed paths the previous key can still open. Integrity failures are
/// excluded: the previous key cannot open those either.
fn still_under_old_key(report: &RotationReport) -> Vec<&PathBuf> {
    report
        .iter()
        .filter(|(_, result)| matches!(result, Err(err) if err.kind() != ErrorKind::Integrity))
        .map(|(path, _)| path)
        .collect()
}

fn render(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => format!("<{} bytes>", b.len()),
    }
}

fn describe(status: &FileStatus) -> String {
    match status {
        FileStatus::Absent => "absent".to_string(),
        FileStatus::Plaintext { len } => format!("plaintext ({len} bytes, not sealed)"),
        FileStatus::Sealed { iterations, len } => {
            format!("sealed ({len} bytes, {iterations} kdf iterations)")
        }
        FileStatus::Corrupt { reason, .. } => format!("corrupt ({reason})"),
    }
}

fn describe_rotation(result: &Result<RotationOutcome, StoreError>) -> String {
    match result {
        Ok(RotationOutcome::Rotated) => "rotated".to_string(),
        Ok(RotationOutcome::Migrated) => "migrated (was plaintext)".to_string(),
        Ok(RotationOutcome::Absent) => "absent (nothing to rotate)".to_string(),
        Err(err) => format!("FAILED ({}) {err}", err.kind()),
    }
}
