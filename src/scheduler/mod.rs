//! Wall-clock scheduling primitives and the retention manager.
//!
//! Recurring work is armed for the next absolute boundary, not "now plus
//! interval". A tick that runs late still computes its next deadline from
//! the epoch-aligned grid, so lateness never accumulates into drift.

mod retention;

pub use retention::RetentionManager;

use chrono::{Local, TimeZone, Utc};
use std::time::Duration;
use tokio::sync::broadcast;

/// Next epoch-aligned deadline strictly after `now_ms`: the smallest
/// multiple of `interval_ms` greater than `now_ms`.
pub fn next_boundary_ms(now_ms: i64, interval_ms: i64) -> i64 {
    (now_ms.div_euclid(interval_ms) + 1) * interval_ms
}

/// Truncate a Unix timestamp to the start of its containing bucket.
pub fn truncate_to_bucket(ts: i64, bucket_secs: i64) -> i64 {
    ts - ts.rem_euclid(bucket_secs)
}

/// Sleep until the next epoch-aligned boundary of `interval`, unless a
/// stop arrives first. Returns `false` on stop.
pub async fn sleep_until_boundary(interval: Duration, stop: &mut broadcast::Receiver<()>) -> bool {
    let interval_ms = interval.as_millis() as i64;
    let now_ms = Utc::now().timestamp_millis();
    let deadline = next_boundary_ms(now_ms, interval_ms);
    let wait = Duration::from_millis((deadline - now_ms).max(0) as u64);
    tokio::select! {
        _ = stop.recv() => false,
        _ = tokio::time::sleep(wait) => true,
    }
}

/// Seconds until the next local occurrence of `hour`:00:00. If that time
/// has already passed today, the deadline is tomorrow.
pub fn secs_until_local_hour(hour: u32) -> i64 {
    let now = Local::now();
    let today = now.date_naive();
    let candidate = today
        .and_hms_opt(hour, 0, 0)
        .and_then(|naive| Local.from_local_datetime(&naive).single());
    let deadline = match candidate {
        Some(at) if at > now => at,
        // Past today's slot (or a DST-ambiguous time): take tomorrow's.
        _ => {
            let tomorrow = today + chrono::Duration::days(1);
            match tomorrow
                .and_hms_opt(hour, 0, 0)
                .and_then(|naive| Local.from_local_datetime(&naive).single())
            {
                Some(at) => at,
                None => now + chrono::Duration::days(1),
            }
        }
    };
    (deadline - now).num_seconds().max(1)
}

/// Sleep until the next local occurrence of `hour`:00:00, unless a stop
/// arrives first. Returns `false` on stop.
pub async fn sleep_until_local_hour(hour: u32, stop: &mut broadcast::Receiver<()>) -> bool {
    let wait = Duration::from_secs(secs_until_local_hour(hour) as u64);
    tokio::select! {
        _ = stop.recv() => false,
        _ = tokio::time::sleep(wait) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_boundary_strictly_future_and_aligned() {
        for interval in [1000i64, 60_000, 600_000, 43_200_000] {
            for now in [0i64, 1, 999, 59_999, 60_000, 1_700_000_123_456] {
                let next = next_boundary_ms(now, interval);
                assert!(next > now, "boundary {} not after {}", next, now);
                assert_eq!(next % interval, 0);
                // Smallest such boundary.
                assert!(next - now <= interval);
            }
        }
    }

    #[test]
    fn test_boundary_on_exact_tick_advances() {
        // Sitting exactly on a boundary must schedule the next one, not
        // fire immediately again.
        assert_eq!(next_boundary_ms(60_000, 60_000), 120_000);
    }

    #[test]
    fn test_truncate_to_bucket() {
        assert_eq!(truncate_to_bucket(1_700_000_123, 60), 1_700_000_100);
        assert_eq!(truncate_to_bucket(1_700_000_100, 60), 1_700_000_100);
        assert_eq!(truncate_to_bucket(7199, 3600), 3600);
    }

    #[test]
    fn test_secs_until_local_hour_bounds() {
        for hour in [0, 3, 12, 23] {
            let secs = secs_until_local_hour(hour);
            assert!(secs >= 1);
            assert!(secs <= 86_400 + 3_600); // DST slack
        }
    }
}
