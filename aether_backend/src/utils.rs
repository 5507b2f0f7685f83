//! Shared helpers and constants.

use chrono::{DateTime, Utc};

pub const APP_NAME: &str = "aether_backend";

/// Version advertised to the update endpoint.
pub const APP_VERSION: u32 = 110;

/// Version carried in handshakes and hashed into post fingerprints.
pub const PROTOCOL_VERSION: i64 = 100;

/// Marker stored in `last_connected_ip` for this node's own row.
pub const LOCAL_IP_MARKER: &str = "LOCAL";

/// Current wall-clock time in whole Unix seconds.
pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}

pub fn days_to_secs(days: i64) -> i64 {
    days * 24 * 60 * 60
}

/// Renders a Unix timestamp the way post fingerprints expect it.
pub fn format_creation_date(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creation_date_uses_space_separated_seconds() {
        assert_eq!(format_creation_date(0), "1970-01-01 00:00:00");
        assert_eq!(format_creation_date(1_352_092_272), "2012-11-05 05:11:12");
    }
}
