//! Small shared helpers: correlation identifiers and event timestamps.

use chrono::Utc;
use uuid::Uuid;

/// Generates a new correlation identifier.
#[must_use]
pub fn generate_correlation_id() -> Uuid {
    Uuid::new_v4()
}

/// Returns the current UTC time as an ISO 8601 formatted string.
///
/// Used to stamp observability event payloads.
#[must_use]
pub fn iso_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}
