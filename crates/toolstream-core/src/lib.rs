pub mod errors;
pub mod events;
pub mod ids;
pub mod messages;
pub mod provider;
pub mod sse;
pub mod state;
pub mod tools;

/// Milliseconds since the Unix epoch, as carried by every protocol event.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
