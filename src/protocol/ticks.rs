//! .NET-style ticks: 100ns intervals since 0001-01-01 UTC

use std::time::{SystemTime, UNIX_EPOCH};

pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Ticks at 1970-01-01 UTC
pub const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

/// Current UTC time in ticks
pub fn now_ticks() -> i64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    UNIX_EPOCH_TICKS + (since_epoch.as_nanos() / 100) as i64
}

/// Ticks for a Unix timestamp in seconds
pub fn ticks_from_unix_secs(secs: i64) -> i64 {
    UNIX_EPOCH_TICKS + secs * TICKS_PER_SECOND
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ticks_is_past_epoch() {
        let now = now_ticks();
        assert!(now > UNIX_EPOCH_TICKS);
        // Sometime after 2020-01-01
        assert!(now > ticks_from_unix_secs(1_577_836_800));
        assert_eq!(ticks_from_unix_secs(1_577_836_800), 637_134_336_000_000_000);
    }
}
