//! Test support utilities shared by the provisioning test suites.
//!
//! Provides idempotent tracing initialization for test binaries and
//! ULID-based helpers for generating unique test data, so parallel test
//! runs never collide on names or values.

use ulid::Ulid;

pub mod logging;

/// Generate a unique string with the given prefix, in the format
/// `{prefix}_{ulid}` (lowercased so the result stays a safe SQL value).
///
/// # Examples
/// ```
/// use test_support::unique_str;
///
/// let a = unique_str("user");
/// let b = unique_str("user");
/// assert_ne!(a, b);
/// assert!(a.starts_with("user_"));
/// ```
pub fn unique_str(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new().to_string().to_lowercase())
}
