use std::time::{SystemTime, UNIX_EPOCH};

/// Wall clock milliseconds since the UNIX epoch, as used for the `timestamp` field of all
///  outbound envelopes. A clock before the epoch is reported as 0 rather than failing a reply.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().try_into().unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Milliseconds of a duration, saturating
pub fn as_millis_u64(duration: std::time::Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}
