use sea_orm::DbErr;
use thiserror::Error;

/// Errors surfaced by provisioning, the Postgres backend and the handle.
///
/// None of these are retried internally; every failure propagates to the
/// caller, which in a test context is expected to fail the test.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("failed to connect to {dsn}: {source}")]
    Connect {
        /// Sanitized DSN (password masked).
        dsn: String,
        #[source]
        source: DbErr,
    },

    #[error("{name:?} may be unsafe as a database identifier; letters, digits and _ only")]
    UnsafeName { name: String },

    #[error("invalid connection string {dsn:?}: {detail}")]
    InvalidDsn { dsn: String, detail: String },

    #[error("migration apply failed: {detail}")]
    Migration { detail: String },

    #[error("failed to clone template {template:?} into {name:?}: {source}")]
    CloneTemplate {
        template: String,
        name: String,
        #[source]
        source: DbErr,
    },

    /// A query that expected exactly one row returned none. Distinct from a
    /// generic database error so the failing expectation is obvious.
    #[error("query expected exactly one row but returned none")]
    NoRows,

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("database error: {0}")]
    Db(#[from] DbErr),
}
