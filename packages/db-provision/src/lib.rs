//! Isolated, fully migrated test databases with template caching.
//!
//! Each call to [`provision`] fingerprints the current migration set,
//! builds or reuses a server-side template database migrated to that
//! fingerprint, and clones a brand-new private database from it for the
//! caller. Migrations run at most once per fingerprint, no matter how many
//! tests (tasks or OS processes) provision concurrently against the same
//! server; a server-scoped named lock serializes the build-or-reuse
//! decision.
//!
//! Engine specifics live behind the [`Backend`] trait; migration
//! fingerprinting and application live behind [`MigrationSource`].
//! [`provision_postgres`] wires in the Postgres backend.

pub mod backend;
pub mod config;
pub mod error;
pub mod migrate;
pub mod postgres;
pub mod provision;

pub use backend::Backend;
pub use config::admin_dsn_from_env;
pub use error::ProvisionError;
pub use migrate::{CliMigrations, MigrationSource, SqlMigrations};
pub use postgres::{provision_postgres, PgBackend, PgTestDb, Row};
pub use provision::provision;
