//! Small shared helpers: timestamps and identifier validation.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;
use std::time::Instant;

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = DateTime<Utc>;

/// Stage ids and stop scopes double as file names for durable markers.
#[allow(clippy::expect_used)]
static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9_.\-]{0,63}$").expect("identifier pattern is valid")
});

/// Returns the current UTC timestamp.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now()
}

/// Milliseconds elapsed since `start`, saturating at `u64::MAX`.
#[must_use]
pub fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Returns true if `value` is a valid stage id or stop scope.
///
/// Accepts lowercase ASCII letters, digits, `_`, `-` and `.`, starting with a
/// letter or digit, at most 64 characters.
#[must_use]
pub fn is_valid_identifier(value: &str) -> bool {
    IDENTIFIER.is_match(value)
}
