use std::time::{SystemTime, UNIX_EPOCH};

/// Local wall clock in unix milliseconds. Used for last-seen stamps only;
/// liveness math always uses the store clock.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Strip the optional leading `/` from an administrative command.
pub fn command_body(message: &str) -> &str {
    message.strip_prefix('/').unwrap_or(message)
}
