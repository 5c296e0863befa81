//! Administrative DSN construction from environment variables.

use std::env;

use crate::error::ProvisionError;

/// Build the administrative Postgres DSN from the environment.
///
/// `TESTDB_ADMIN_DSN` takes precedence when set. Otherwise the DSN is
/// assembled from `POSTGRES_HOST` (default `localhost`), `POSTGRES_PORT`
/// (default `5432`), required `POSTGRES_USER` and `POSTGRES_PASSWORD`, and
/// `POSTGRES_DB` (default `postgres`). The resulting account must be able
/// to create and drop databases.
pub fn admin_dsn_from_env() -> Result<String, ProvisionError> {
    if let Ok(dsn) = env::var("TESTDB_ADMIN_DSN") {
        return Ok(dsn);
    }

    let host = env::var("POSTGRES_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT").unwrap_or_else(|_| "5432".to_string());
    let user = must_var("POSTGRES_USER")?;
    let password = must_var("POSTGRES_PASSWORD")?;
    let db = env::var("POSTGRES_DB").unwrap_or_else(|_| "postgres".to_string());

    Ok(format!("postgresql://{user}:{password}@{host}:{port}/{db}"))
}

fn must_var(name: &str) -> Result<String, ProvisionError> {
    env::var(name).map_err(|_| ProvisionError::Config {
        message: format!("required environment variable '{name}' is not set"),
    })
}
