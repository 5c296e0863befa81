//! The provisioning algorithm: fingerprint, lock, build-or-reuse the
//! cached template, clone a private instance, hand back a handle.
//!
//! All concurrency lives here. Callers on the same server contending for
//! one fingerprint are serialized by the backend's named lock; exactly one
//! of them builds the template, the rest observe it ready and go straight
//! to cloning.

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{ensure_safe_name, Backend};
use crate::error::ProvisionError;
use crate::migrate::MigrationSource;

/// Template databases are named `test_template_<fingerprint>`.
pub const TEMPLATE_PREFIX: &str = "test_template_";

/// Instance databases are named `test_db_<uuid>`.
pub const INSTANCE_PREFIX: &str = "test_db_";

/// Provision a fresh, isolated, fully migrated database.
///
/// Opens an administrative connection to `root_dsn`, builds (or reuses)
/// the template database for `source`'s current fingerprint under the
/// backend's named lock, clones it into a uniquely named instance and
/// wraps that into the backend's handle type.
///
/// Guarantees: for a fixed fingerprint, `source.apply` runs at most once
/// across any number of concurrent or sequential calls sharing the server;
/// every returned handle points at a database that has undergone exactly
/// the migrations current at fingerprint time. Any failure surfaces
/// immediately; there is no retry and no partial handle.
pub async fn provision<B, M>(
    root_dsn: &str,
    backend: &B,
    source: &M,
) -> Result<B::Db, ProvisionError>
where
    B: Backend,
    M: MigrationSource,
{
    let admin = backend.connect(root_dsn).await?;

    let fingerprint = source.fingerprint().await?;
    let template = format!("{TEMPLATE_PREFIX}{fingerprint}");
    ensure_safe_name(&template)?;
    debug!(fingerprint = %fingerprint, template = %template, "provision=start");

    // Blocks until acquired; the lock is the only suspension point where
    // we wait on another party.
    backend.lock(&admin, &template).await?;

    let outcome = build_and_clone(root_dsn, backend, &admin, &template, source).await;

    // Unlock even when the locked section failed. Releasing only after the
    // clone exists closes the window where a concurrent remover could drop
    // the template between the readiness check and the clone.
    let unlocked = backend.unlock(&admin, &template).await;
    let instance = outcome?;
    unlocked?;

    let instance_dsn = backend.derive_dsn(root_dsn, &instance)?;
    let db = backend.wrap(root_dsn, &instance_dsn).await?;
    info!(database = %instance, template = %template, "provision=done");
    Ok(db)
}

/// Everything that must happen under the named lock: decide whether the
/// template is usable, build it if not, then clone the instance.
async fn build_and_clone<B, M>(
    root_dsn: &str,
    backend: &B,
    admin: &B::Conn,
    template: &str,
    source: &M,
) -> Result<String, ProvisionError>
where
    B: Backend,
    M: MigrationSource,
{
    let template_dsn = backend.derive_dsn(root_dsn, template)?;

    let mut ready = false;
    if backend.exists(admin, template).await? {
        if backend.template_ready(&template_dsn).await? {
            ready = true;
        } else {
            // Present but never finished migrating: a previous run died
            // between create and apply. Rebuild from scratch.
            warn!(template = %template, "provision=stale_template rebuilding");
            backend.remove(admin, template).await?;
        }
    }

    if ready {
        debug!(template = %template, "provision=template_reused");
    } else {
        info!(template = %template, "provision=build_template");
        backend.create(admin, template).await?;

        if let Err(apply_err) = apply_and_mark(backend, &template_dsn, source).await {
            // A template cached under this fingerprint must never be
            // partially migrated. Remove it so the next run retries fresh.
            if let Err(remove_err) = backend.remove(admin, template).await {
                warn!(
                    template = %template,
                    error = %remove_err,
                    "provision=template_cleanup_failed"
                );
            }
            return Err(apply_err);
        }
    }

    let instance = format!("{INSTANCE_PREFIX}{}", Uuid::new_v4().simple());
    backend
        .create_from_template(admin, template, &instance)
        .await?;
    Ok(instance)
}

async fn apply_and_mark<B, M>(
    backend: &B,
    template_dsn: &str,
    source: &M,
) -> Result<(), ProvisionError>
where
    B: Backend,
    M: MigrationSource,
{
    source.apply(template_dsn).await?;
    backend.mark_template_ready(template_dsn).await
}
