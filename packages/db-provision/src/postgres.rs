//! Postgres implementation of the backend capability set, plus the handle
//! type returned for provisioned instance databases.

use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, QueryResult,
    Statement, TryGetable, Value,
};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use url::Url;
use xxhash_rust::xxh3::xxh3_64;

use async_trait::async_trait;

use crate::backend::{ensure_safe_name, sanitize_dsn, Backend};
use crate::error::ProvisionError;
use crate::migrate::MigrationSource;
use crate::provision::provision;

/// Marker table created inside a template database once its migrations
/// have applied. A template without it is treated as half-built and
/// rebuilt from scratch.
const READY_TABLE: &str = "_template_ready";

/// Map a lock name onto Postgres' 64-bit advisory-lock keyspace.
pub fn pg_lock_id(key: &str) -> i64 {
    xxh3_64(key.as_bytes()) as i64
}

/// Provision an isolated, fully migrated Postgres database.
///
/// `root_dsn` must carry permission to create and drop databases. Returns
/// a [`PgTestDb`] bound to a brand-new database cloned from the cached
/// template for `source`'s current fingerprint.
pub async fn provision_postgres<M: MigrationSource>(
    root_dsn: &str,
    source: &M,
) -> Result<PgTestDb, ProvisionError> {
    provision(root_dsn, &PgBackend, source).await
}

/// Postgres backend: advisory locks for the named lock, `pg_database` for
/// existence, `CREATE DATABASE ... TEMPLATE` for cloning.
pub struct PgBackend;

#[async_trait]
impl Backend for PgBackend {
    type Conn = DatabaseConnection;
    type Db = PgTestDb;

    async fn connect(&self, dsn: &str) -> Result<Self::Conn, ProvisionError> {
        connect_plain(dsn).await
    }

    async fn lock(&self, conn: &Self::Conn, name: &str) -> Result<(), ProvisionError> {
        // Blocks server-side until the lock is granted; no timeout.
        let stmt = Statement::from_sql_and_values(
            DatabaseBackend::Postgres,
            "SELECT pg_advisory_lock($1)",
            vec![pg_lock_id(name).into()],
        );
        conn.execute(stmt).await?;
        Ok(())
    }

    async fn unlock(&self, conn: &Self::Conn, name: &str) -> Result<(), ProvisionError> {
        let stmt = Statement::from_sql_and_values(
            DatabaseBackend::Postgres,
            "SELECT pg_advisory_unlock($1) AS unlocked",
            vec![pg_lock_id(name).into()],
        );

        match conn.query_one(stmt).await? {
            Some(row) => {
                let unlocked: bool = row.try_get("", "unlocked")?;
                if !unlocked {
                    warn!(
                        code = "PG_UNLOCK_FALSE",
                        lock = %name,
                        "advisory unlock returned false"
                    );
                }
            }
            None => {
                warn!(lock = %name, "no result from advisory unlock query");
            }
        }
        Ok(())
    }

    async fn exists(&self, conn: &Self::Conn, name: &str) -> Result<bool, ProvisionError> {
        let stmt = Statement::from_sql_and_values(
            DatabaseBackend::Postgres,
            "SELECT true AS present FROM pg_database WHERE datname = $1",
            vec![name.into()],
        );

        match conn.query_one(stmt).await? {
            Some(row) => Ok(row.try_get("", "present")?),
            None => Ok(false),
        }
    }

    async fn create(&self, conn: &Self::Conn, name: &str) -> Result<(), ProvisionError> {
        let name = ensure_safe_name(name)?;
        conn.execute_unprepared(&format!("CREATE DATABASE \"{name}\""))
            .await?;
        Ok(())
    }

    async fn create_from_template(
        &self,
        conn: &Self::Conn,
        template: &str,
        name: &str,
    ) -> Result<(), ProvisionError> {
        let template = ensure_safe_name(template)?;
        let name = ensure_safe_name(name)?;
        // A session still winding down from the readiness check (or from
        // migration) blocks TEMPLATE clones with SQLSTATE 55006.
        terminate_sessions(conn, template).await?;
        conn.execute_unprepared(&format!(
            "CREATE DATABASE \"{name}\" TEMPLATE \"{template}\""
        ))
        .await
        .map_err(|e| ProvisionError::CloneTemplate {
            template: template.to_string(),
            name: name.to_string(),
            source: e,
        })?;
        Ok(())
    }

    async fn remove(&self, conn: &Self::Conn, name: &str) -> Result<(), ProvisionError> {
        terminate_and_drop(conn, name).await
    }

    fn derive_dsn(&self, base: &str, name: &str) -> Result<String, ProvisionError> {
        let name = ensure_safe_name(name)?;
        let mut url = Url::parse(base).map_err(|e| ProvisionError::InvalidDsn {
            dsn: sanitize_dsn(base),
            detail: e.to_string(),
        })?;
        url.set_path(name);
        Ok(url.to_string())
    }

    async fn template_ready(&self, dsn: &str) -> Result<bool, ProvisionError> {
        let conn = connect_plain(dsn).await?;
        let stmt = Statement::from_sql_and_values(
            DatabaseBackend::Postgres,
            "SELECT EXISTS ( \
               SELECT 1 FROM pg_catalog.pg_tables \
               WHERE schemaname = 'public' AND tablename = $1 \
             ) AS ready",
            vec![READY_TABLE.into()],
        );

        let result = conn.query_one(stmt).await;
        // The template must have no live sessions when it is cloned; close
        // synchronously instead of letting the pool wind down in background.
        let closed = conn.close().await;

        let ready = match result? {
            Some(row) => row.try_get("", "ready")?,
            None => false,
        };
        closed?;
        Ok(ready)
    }

    async fn mark_template_ready(&self, dsn: &str) -> Result<(), ProvisionError> {
        let conn = connect_plain(dsn).await?;
        let result = conn
            .execute_unprepared(&format!(
                "CREATE TABLE IF NOT EXISTS \"{READY_TABLE}\" ( \
                   ready_at timestamptz NOT NULL DEFAULT now() \
                 )"
            ))
            .await;
        // Same as template_ready: no session may outlive this call.
        let closed = conn.close().await;

        result?;
        closed?;
        Ok(())
    }

    async fn wrap(&self, root_dsn: &str, dsn: &str) -> Result<Self::Db, ProvisionError> {
        let url = Url::parse(dsn).map_err(|e| ProvisionError::InvalidDsn {
            dsn: sanitize_dsn(dsn),
            detail: e.to_string(),
        })?;
        let name = url.path().trim_start_matches('/').to_string();
        if name.is_empty() {
            return Err(ProvisionError::InvalidDsn {
                dsn: sanitize_dsn(dsn),
                detail: "no database name in connection string".to_string(),
            });
        }

        Ok(PgTestDb {
            name,
            dsn: dsn.to_string(),
            root_dsn: root_dsn.to_string(),
            conn: OnceCell::new(),
            dropped: false,
        })
    }
}

async fn connect_plain(dsn: &str) -> Result<DatabaseConnection, ProvisionError> {
    // INVARIANT: min=max=1 so every statement of a provisioning call runs
    // on the single physical session that holds the advisory lock. If this
    // changes, the locking strategy must be revisited.
    let mut opt = ConnectOptions::new(dsn);
    opt.min_connections(1)
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(2))
        .sqlx_logging(false);

    Database::connect(opt)
        .await
        .map_err(|e| ProvisionError::Connect {
            dsn: sanitize_dsn(dsn),
            source: e,
        })
}

/// Terminate every session of `name` other than our own. Postgres refuses
/// to clone or drop a database that has live sessions.
async fn terminate_sessions(
    conn: &DatabaseConnection,
    name: &str,
) -> Result<(), ProvisionError> {
    let name = ensure_safe_name(name)?;
    let stmt = Statement::from_sql_and_values(
        DatabaseBackend::Postgres,
        "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
         WHERE datname = $1 AND pid <> pg_backend_pid()",
        vec![name.into()],
    );
    conn.execute(stmt).await?;
    Ok(())
}

/// Terminate every other session of `name`, then drop it.
async fn terminate_and_drop(
    conn: &DatabaseConnection,
    name: &str,
) -> Result<(), ProvisionError> {
    let name = ensure_safe_name(name)?;
    terminate_sessions(conn, name).await?;
    conn.execute_unprepared(&format!("DROP DATABASE IF EXISTS \"{name}\""))
        .await?;
    Ok(())
}

/// One row payload for [`PgTestDb::insert`]: column name to value.
pub type Row = Vec<(String, Value)>;

/// Handle to one provisioned instance database.
///
/// Owns a lazily opened connection to its database and retains the root
/// DSN for teardown. Databases are disposable test artifacts: call
/// [`PgTestDb::drop_db`] at the end of the test scope; a handle dropped
/// without it logs the leaked database name.
#[derive(Debug)]
pub struct PgTestDb {
    name: String,
    dsn: String,
    root_dsn: String,
    conn: OnceCell<DatabaseConnection>,
    dropped: bool,
}

impl PgTestDb {
    /// Name of the instance database.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connection string for the instance database.
    pub fn dsn(&self) -> &str {
        &self.dsn
    }

    async fn conn(&self) -> Result<&DatabaseConnection, ProvisionError> {
        self.conn
            .get_or_try_init(|| connect_plain(&self.dsn))
            .await
    }

    /// Insert rows into `table`, one INSERT per row, no transaction across
    /// rows. Each row is a column-to-value mapping.
    pub async fn insert(&self, table: &str, rows: &[Row]) -> Result<(), ProvisionError> {
        let table = ensure_safe_name(table)?;
        let conn = self.conn().await?;

        for row in rows {
            let mut cols = Vec::with_capacity(row.len());
            let mut binds = Vec::with_capacity(row.len());
            let mut values = Vec::with_capacity(row.len());
            for (i, (col, val)) in row.iter().enumerate() {
                ensure_safe_name(col)?;
                cols.push(format!("\"{col}\""));
                binds.push(format!("${}", i + 1));
                values.push(val.clone());
            }

            let sql = if row.is_empty() {
                format!("INSERT INTO \"{table}\" DEFAULT VALUES")
            } else {
                format!(
                    "INSERT INTO \"{table}\" ({}) VALUES ({})",
                    cols.join(", "),
                    binds.join(", ")
                )
            };

            conn.execute(Statement::from_sql_and_values(
                DatabaseBackend::Postgres,
                sql,
                values,
            ))
            .await?;
        }

        Ok(())
    }

    /// Execute `sql` with bound values, returning the number of rows
    /// affected.
    pub async fn exec(&self, sql: &str, values: Vec<Value>) -> Result<u64, ProvisionError> {
        let conn = self.conn().await?;
        let result = conn
            .execute(Statement::from_sql_and_values(
                DatabaseBackend::Postgres,
                sql,
                values,
            ))
            .await?;
        Ok(result.rows_affected())
    }

    /// Run `sql` expecting exactly one row; returns it. Zero rows is the
    /// distinct [`ProvisionError::NoRows`].
    pub async fn query_row(
        &self,
        sql: &str,
        values: Vec<Value>,
    ) -> Result<QueryResult, ProvisionError> {
        let conn = self.conn().await?;
        conn.query_one(Statement::from_sql_and_values(
            DatabaseBackend::Postgres,
            sql,
            values,
        ))
        .await?
        .ok_or(ProvisionError::NoRows)
    }

    /// Run `sql` expecting exactly one row and read its first column.
    pub async fn query_value<T: TryGetable>(
        &self,
        sql: &str,
        values: Vec<Value>,
    ) -> Result<T, ProvisionError> {
        let row = self.query_row(sql, values).await?;
        Ok(row.try_get_by_index(0)?)
    }

    /// Tear the database down: close this handle's connection, terminate
    /// any remaining sessions and force-drop the database.
    pub async fn drop_db(mut self) -> Result<(), ProvisionError> {
        if let Some(conn) = self.conn.take() {
            let _ = conn.close().await;
        }

        let root = connect_plain(&self.root_dsn).await?;
        terminate_and_drop(&root, &self.name).await?;

        debug!(database = %self.name, "test database dropped");
        self.dropped = true;
        Ok(())
    }
}

impl Drop for PgTestDb {
    fn drop(&mut self) {
        if !self.dropped {
            warn!(
                database = %self.name,
                "handle dropped without drop_db; test database left behind"
            );
        }
    }
}
