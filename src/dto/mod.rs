use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::state::session::Timestamp;

/// Health check payload.
pub mod health;
/// Challenge and rematch payloads.
pub mod negotiation;
/// Session update and claim-void payloads.
pub mod session;
/// User state payload.
pub mod user;
/// Shared field validators.
pub mod validation;

/// Render epoch milliseconds as an RFC 3339 string.
fn format_timestamp(millis: Timestamp) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .ok()
        .and_then(|time| time.format(&Rfc3339).ok())
        .unwrap_or_else(|| "invalid-timestamp".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_epoch_milliseconds_as_rfc3339() {
        assert_eq!(format_timestamp(0), "1970-01-01T00:00:00Z");
        assert_eq!(format_timestamp(86_400_000), "1970-01-02T00:00:00Z");
    }
}
