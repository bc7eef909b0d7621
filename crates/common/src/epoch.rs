//! Epoch arithmetic.
//!
//! An epoch is `floor((now - epochOriginMs) / blockTimeMs)`. Every value a
//! petal hashes carries the timestamp *derived from the epoch*, never the
//! wall clock; two petals sampling the same adapters in the same epoch must
//! hash identical bytes.

use chrono::{DateTime, SecondsFormat};

/// Compute the epoch for a wall-clock instant.
pub fn epoch_at(now_ms: i64, origin_ms: i64, block_time_ms: i64) -> i64 {
    if block_time_ms <= 0 {
        return 0;
    }
    (now_ms - origin_ms).div_euclid(block_time_ms)
}

/// The instant (unix ms) at which `epoch` begins.
pub fn epoch_start_ms(origin_ms: i64, epoch: i64, block_time_ms: i64) -> i64 {
    origin_ms + epoch * block_time_ms
}

/// ISO-8601 timestamp (millisecond precision, `Z` suffix) for an epoch.
pub fn epoch_timestamp(origin_ms: i64, epoch: i64, block_time_ms: i64) -> String {
    let ms = epoch_start_ms(origin_ms, epoch, block_time_ms);
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| "1970-01-01T00:00:00.000Z".to_string())
}

/// Clamp a configured epoch origin so it never sits in the future.
pub fn clamp_origin(origin_ms: i64, now_ms: i64) -> i64 {
    origin_ms.min(now_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_progression() {
        let origin = 1_700_000_000_000;
        assert_eq!(epoch_at(origin, origin, 2000), 0);
        assert_eq!(epoch_at(origin + 1999, origin, 2000), 0);
        assert_eq!(epoch_at(origin + 2000, origin, 2000), 1);
        assert_eq!(epoch_at(origin + 10_500, origin, 2000), 5);
    }

    #[test]
    fn epoch_before_origin_is_negative() {
        let origin = 1_700_000_000_000;
        assert_eq!(epoch_at(origin - 1, origin, 2000), -1);
    }

    #[test]
    fn timestamp_is_derived_from_epoch_not_clock() {
        let origin = 1_700_000_000_000; // 2023-11-14T22:13:20.000Z
        let a = epoch_timestamp(origin, 3, 2000);
        let b = epoch_timestamp(origin, 3, 2000);
        assert_eq!(a, b);
        assert_eq!(a, "2023-11-14T22:13:26.000Z");
    }

    #[test]
    fn origin_clamped_to_now() {
        assert_eq!(clamp_origin(2000, 1000), 1000);
        assert_eq!(clamp_origin(500, 1000), 500);
    }
}
