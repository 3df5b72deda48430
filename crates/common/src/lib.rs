//! Shared types and small utilities used across all switchyard crates.

pub mod types;

pub use types::{
    ChatRequest, ErrorInfo, Message, QueuedRequest, ResponseEnvelope, ResponseStatus, Usage,
};

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng as _;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Seconds since the Unix epoch.
#[must_use]
pub fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Generate a request id of the form `req_{millis}_{hex}`.
///
/// The millisecond prefix keeps ids roughly sortable by submission time;
/// the random suffix disambiguates same-millisecond submissions.
#[must_use]
pub fn request_id() -> String {
    let suffix: u32 = rand::rng().random();
    format!("req_{}_{suffix:08x}", unix_ms())
}
