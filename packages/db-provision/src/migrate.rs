//! Migration sources: fingerprinting the current migration definitions and
//! applying them to a target database.
//!
//! The fingerprint is a cache key only; the provisioner never interprets
//! its value. [`CliMigrations`] shells out to the golang-migrate `migrate`
//! binary; [`SqlMigrations`] runs an in-memory statement list and is handy
//! for tests and for provisioning blank databases.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sea_orm::{ConnectionTrait, Database};
use tracing::debug;

use crate::backend::sanitize_dsn;
use crate::error::ProvisionError;

/// Length of the hex fingerprint. Short enough that
/// `test_template_<fingerprint>` stays under Postgres' 63-byte identifier
/// limit, long enough that collisions are negligible.
const FINGERPRINT_LEN: usize = 32;

/// Produces a fingerprint of the current migration definitions and applies
/// them to a given connection target.
#[async_trait]
pub trait MigrationSource: Send + Sync {
    /// Deterministic, content-derived digest of the migration definitions.
    /// Identical content yields an identical value; any content change
    /// yields a different value.
    async fn fingerprint(&self) -> Result<String, ProvisionError>;

    /// Apply all migrations to the database at `dsn`, reaching the schema
    /// version the fingerprint describes. Fails fast on the first error.
    async fn apply(&self, dsn: &str) -> Result<(), ProvisionError>;
}

/// Migration source backed by the external `migrate` CLI
/// (<https://github.com/golang-migrate/migrate>), applied against a
/// directory of migration files.
#[derive(Debug)]
pub struct CliMigrations {
    dir: PathBuf,
}

impl CliMigrations {
    /// Create a CLI-backed source for the migration files under `dir`.
    /// Fails if the directory cannot be read.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ProvisionError> {
        let dir = dir.into();
        fs::read_dir(&dir).map_err(|e| ProvisionError::Config {
            message: format!("cannot read migrations directory {}: {e}", dir.display()),
        })?;
        Ok(Self { dir })
    }
}

#[async_trait]
impl MigrationSource for CliMigrations {
    async fn fingerprint(&self) -> Result<String, ProvisionError> {
        let mut hasher = blake3::Hasher::new();
        hash_dir(&mut hasher, &self.dir, &self.dir).map_err(|e| ProvisionError::Config {
            message: format!(
                "failed to fingerprint migrations in {}: {e}",
                self.dir.display()
            ),
        })?;
        Ok(truncate_hex(hasher.finalize()))
    }

    async fn apply(&self, dsn: &str) -> Result<(), ProvisionError> {
        debug!(dir = %self.dir.display(), "migrate=cli_apply");

        let output = tokio::process::Command::new("migrate")
            .arg("-database")
            .arg(dsn)
            .arg("-path")
            .arg(&self.dir)
            .arg("up")
            .output()
            .await
            .map_err(|e| ProvisionError::Migration {
                detail: format!("failed to invoke `migrate`: {e}"),
            })?;

        if !output.status.success() {
            return Err(ProvisionError::Migration {
                detail: format!(
                    "`migrate` exited with {} against {}: {}",
                    output
                        .status
                        .code()
                        .map_or_else(|| "signal".to_string(), |c| c.to_string()),
                    sanitize_dsn(dsn),
                    String::from_utf8_lossy(&output.stderr).trim(),
                ),
            });
        }

        Ok(())
    }
}

/// In-memory migration source: an ordered list of SQL statements executed
/// directly against the target. An empty list provisions a blank database
/// that still gets template caching.
pub struct SqlMigrations {
    statements: Vec<String>,
}

impl SqlMigrations {
    pub fn new<S: Into<String>>(statements: impl IntoIterator<Item = S>) -> Self {
        Self {
            statements: statements.into_iter().map(Into::into).collect(),
        }
    }

    /// A source with no migrations; provisions blank databases.
    pub fn empty() -> Self {
        Self { statements: Vec::new() }
    }
}

#[async_trait]
impl MigrationSource for SqlMigrations {
    async fn fingerprint(&self) -> Result<String, ProvisionError> {
        let mut hasher = blake3::Hasher::new();
        for stmt in &self.statements {
            hasher.update(stmt.as_bytes());
            hasher.update(&[0]);
        }
        Ok(truncate_hex(hasher.finalize()))
    }

    async fn apply(&self, dsn: &str) -> Result<(), ProvisionError> {
        let conn = Database::connect(dsn)
            .await
            .map_err(|e| ProvisionError::Connect {
                dsn: sanitize_dsn(dsn),
                source: e,
            })?;

        let mut result = Ok(());
        for stmt in &self.statements {
            if let Err(e) = conn.execute_unprepared(stmt).await {
                result = Err(ProvisionError::Migration {
                    detail: format!("statement {stmt:?} failed: {e}"),
                });
                break;
            }
        }

        // The target is a template about to be cloned; Postgres refuses
        // TEMPLATE clones while it has live sessions, so close synchronously
        // rather than letting the pool wind down in background.
        let closed = conn.close().await;
        result?;
        closed?;
        Ok(())
    }
}

/// Hash every file under `dir` (recursively) into `hasher`, in a stable
/// order: relative path then contents, per file, sorted by file name.
fn hash_dir(hasher: &mut blake3::Hasher, root: &Path, dir: &Path) -> io::Result<()> {
    let mut entries = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            hash_dir(hasher, root, &path)?;
        } else {
            let rel = path.strip_prefix(root).unwrap_or(&path);
            hasher.update(rel.to_string_lossy().as_bytes());
            hasher.update(&[0]);
            hasher.update(&fs::read(&path)?);
            hasher.update(&[0]);
        }
    }

    Ok(())
}

fn truncate_hex(hash: blake3::Hash) -> String {
    let hex = hash.to_hex();
    hex.as_str()[..FINGERPRINT_LEN].to_string()
}
