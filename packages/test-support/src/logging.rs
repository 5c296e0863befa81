//! Unified test logging initialization.
//!
//! Shared by unit tests and integration test binaries so every suite gets
//! the same subscriber configuration.

use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

static INITIALIZED: OnceCell<()> = OnceCell::new();

/// Initialize structured logging for tests.
///
/// Idempotent and race-safe; may be called from every test binary. The log
/// level is read in order of precedence:
///
/// 1. `TEST_LOG` environment variable
/// 2. `RUST_LOG` environment variable
/// 3. `"warn"` (default, quiet)
///
/// The subscriber uses `with_test_writer()` so cargo/nextest capture output
/// per test, and `without_time()` for stable output.
pub fn init() {
    INITIALIZED.get_or_init(|| {
        let filter = std::env::var("TEST_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .map(EnvFilter::new)
            .unwrap_or_else(|_| EnvFilter::new("warn"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .without_time()
            .try_init()
            .ok();
    });
}
