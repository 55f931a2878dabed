//! Time-series cache and message counters.
//!
//! One precomputed response per retention window stays resident in
//! memory so viewer requests never touch the store. Refreshes run on
//! epoch-aligned boundaries; a failed refresh keeps the stale entry,
//! because slightly old data beats none.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::broadcast::{HubBroadcaster, HubEvent};
use crate::db::{CountBucket, CountRow, DbError, Store};
use crate::listener::DecoderType;
use crate::scheduler::{sleep_until_boundary, truncate_to_bucket};

/// Granularity of the raw count rows, and of the counter flusher.
pub const BASE_RESOLUTION_SECS: i64 = 60;

/// One supported retention window.
#[derive(Debug, Clone, Copy)]
pub struct WindowSpec {
    pub key: &'static str,
    pub span_secs: i64,
    pub bucket_secs: i64,
    pub refresh_secs: i64,
}

/// The supported windows, shortest to longest. Short windows read raw
/// minute rows; long ones read bucketed averages and refresh less often.
pub static WINDOWS: [WindowSpec; 8] = [
    WindowSpec { key: "1hour", span_secs: 3_600, bucket_secs: 60, refresh_secs: 60 },
    WindowSpec { key: "6hour", span_secs: 21_600, bucket_secs: 60, refresh_secs: 60 },
    WindowSpec { key: "12hour", span_secs: 43_200, bucket_secs: 60, refresh_secs: 60 },
    WindowSpec { key: "24hour", span_secs: 86_400, bucket_secs: 60, refresh_secs: 60 },
    WindowSpec { key: "1week", span_secs: 604_800, bucket_secs: 600, refresh_secs: 600 },
    WindowSpec { key: "30day", span_secs: 2_592_000, bucket_secs: 3_600, refresh_secs: 3_600 },
    WindowSpec { key: "6month", span_secs: 15_724_800, bucket_secs: 21_600, refresh_secs: 21_600 },
    WindowSpec { key: "1year", span_secs: 31_536_000, bucket_secs: 43_200, refresh_secs: 43_200 },
];

/// A gap-free series for one window, ready to chart.
#[derive(Debug, Clone, Serialize)]
pub struct TimeSeriesResponse {
    pub window: &'static str,
    pub bucket_secs: i64,
    pub start: i64,
    pub end: i64,
    pub buckets: Vec<CountRow>,
}

/// Fill the aligned bucket grid over `[start, end]` with step `step`,
/// taking stored rows where they exist and zero rows elsewhere. The
/// output always has `floor((end - start) / step) + 1` entries, each on
/// a multiple of `step`.
pub fn zero_fill_buckets(rows: &[CountRow], start: i64, end: i64, step: i64) -> Vec<CountRow> {
    let by_time: HashMap<i64, &CountRow> = rows.iter().map(|r| (r.time, r)).collect();
    let first = truncate_to_bucket(start, step);
    let count = (end - start) / step + 1;

    (0..count)
        .map(|i| {
            let time = first + i * step;
            by_time.get(&time).map(|r| (*r).clone()).unwrap_or(CountRow {
                time,
                ..Default::default()
            })
        })
        .collect()
}

/// Build one window's response from the store. The only function that
/// queries count rows on behalf of the cache.
pub fn build_time_series_response(
    store: &Store,
    spec: &WindowSpec,
) -> Result<TimeSeriesResponse, DbError> {
    let end = truncate_to_bucket(Utc::now().timestamp(), spec.bucket_secs);
    let start = end - (spec.span_secs - spec.bucket_secs);

    let rows = if spec.bucket_secs == BASE_RESOLUTION_SECS {
        store.get_count_range(BASE_RESOLUTION_SECS, start, end)?
    } else {
        store.get_count_downsampled(BASE_RESOLUTION_SECS, spec.bucket_secs, start, end)?
    };

    Ok(TimeSeriesResponse {
        window: spec.key,
        bucket_secs: spec.bucket_secs,
        start,
        end,
        buckets: zero_fill_buckets(&rows, start, end, spec.bucket_secs),
    })
}

/// In-memory cache of one response per window.
pub struct TimeSeriesCache {
    store: Arc<Store>,
    bus: HubBroadcaster,
    cache: RwLock<HashMap<&'static str, TimeSeriesResponse>>,
    running: AtomicBool,
    stop: Mutex<Option<broadcast::Sender<()>>>,
}

impl TimeSeriesCache {
    pub fn new(store: Arc<Store>, bus: HubBroadcaster) -> Self {
        Self {
            store,
            bus,
            cache: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
            stop: Mutex::new(None),
        }
    }

    /// Build every window synchronously. Called once at startup so the
    /// first client request is already served from memory.
    pub fn prime(&self) -> Result<(), DbError> {
        for spec in &WINDOWS {
            let response = build_time_series_response(&self.store, spec)?;
            self.cache.write().unwrap().insert(spec.key, response);
        }
        tracing::info!("TimeSeriesCache: primed {} windows", WINDOWS.len());
        Ok(())
    }

    pub fn get(&self, window: &str) -> Option<TimeSeriesResponse> {
        self.cache.read().unwrap().get(window).cloned()
    }

    /// Start one boundary-aligned refresh task per window.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, _) = broadcast::channel(1);
        *self.stop.lock().unwrap() = Some(tx.clone());

        for spec in &WINDOWS {
            let cache = self.clone();
            let mut rx = tx.subscribe();
            tokio::spawn(async move {
                let interval = Duration::from_secs(spec.refresh_secs as u64);
                loop {
                    if !sleep_until_boundary(interval, &mut rx).await {
                        break;
                    }
                    cache.refresh_window(spec);
                }
            });
        }
    }

    /// Stop all refresh tasks.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.stop.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }

    fn refresh_window(&self, spec: &WindowSpec) {
        match build_time_series_response(&self.store, spec) {
            Ok(response) => {
                self.cache.write().unwrap().insert(spec.key, response.clone());
                self.bus.publish(HubEvent::TimeSeriesRefreshed {
                    window: spec.key,
                    response,
                });
            }
            Err(e) => {
                // Keep the stale entry; never null out a good value.
                tracing::error!("TimeSeriesCache: refresh of {} failed: {}", spec.key, e);
            }
        }
    }
}

/// Per-decoder counters incremented by the ingestion pipeline and
/// drained once a minute into the store.
pub struct MessageCounters {
    acars: AtomicI64,
    vdlm2: AtomicI64,
    hfdl: AtomicI64,
    imsl: AtomicI64,
    irdm: AtomicI64,
    error: AtomicI64,
}

impl MessageCounters {
    pub fn new() -> Self {
        Self {
            acars: AtomicI64::new(0),
            vdlm2: AtomicI64::new(0),
            hfdl: AtomicI64::new(0),
            imsl: AtomicI64::new(0),
            irdm: AtomicI64::new(0),
            error: AtomicI64::new(0),
        }
    }

    pub fn record(&self, decoder: DecoderType, is_error: bool) {
        let counter = match decoder {
            DecoderType::Acars => &self.acars,
            DecoderType::Vdlm2 => &self.vdlm2,
            DecoderType::Hfdl => &self.hfdl,
            DecoderType::Imsl => &self.imsl,
            DecoderType::Irdm => &self.irdm,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if is_error {
            self.error.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Swap all counters to zero and return them as a bucket for `time`.
    pub fn drain_into_bucket(&self, time: i64) -> CountBucket {
        let acars = self.acars.swap(0, Ordering::Relaxed);
        let vdlm2 = self.vdlm2.swap(0, Ordering::Relaxed);
        let hfdl = self.hfdl.swap(0, Ordering::Relaxed);
        let imsl = self.imsl.swap(0, Ordering::Relaxed);
        let irdm = self.irdm.swap(0, Ordering::Relaxed);
        let error = self.error.swap(0, Ordering::Relaxed);
        CountBucket {
            time,
            resolution: BASE_RESOLUTION_SECS,
            acars,
            vdlm2,
            hfdl,
            imsl,
            irdm,
            total: acars + vdlm2 + hfdl + imsl + irdm,
            error,
        }
    }
}

impl Default for MessageCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Drains `MessageCounters` into the base-resolution bucket row once a
/// minute, on the minute.
pub struct CounterFlusher {
    store: Arc<Store>,
    counters: Arc<MessageCounters>,
    running: AtomicBool,
    stop: Mutex<Option<broadcast::Sender<()>>>,
}

impl CounterFlusher {
    pub fn new(store: Arc<Store>, counters: Arc<MessageCounters>) -> Self {
        Self {
            store,
            counters,
            running: AtomicBool::new(false),
            stop: Mutex::new(None),
        }
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, mut rx) = broadcast::channel(1);
        *self.stop.lock().unwrap() = Some(tx);

        let flusher = self.clone();
        tokio::spawn(async move {
            let interval = Duration::from_secs(BASE_RESOLUTION_SECS as u64);
            loop {
                if !sleep_until_boundary(interval, &mut rx).await {
                    break;
                }
                flusher.flush();
            }
        });
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.stop.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }

    /// Write the counts gathered over the minute that just ended.
    pub fn flush(&self) {
        let boundary = truncate_to_bucket(Utc::now().timestamp(), BASE_RESOLUTION_SECS);
        let bucket = self.counters.drain_into_bucket(boundary - BASE_RESOLUTION_SECS);
        if bucket.total == 0 && bucket.error == 0 {
            return;
        }
        if let Err(e) = self.store.increment_count_bucket(&bucket) {
            tracing::error!("CounterFlusher: failed to write bucket: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn store() -> (Arc<Store>, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        (Arc::new(Store::new(file.path()).unwrap()), file)
    }

    #[test]
    fn test_zero_fill_empty_input() {
        let buckets = zero_fill_buckets(&[], 0, 600, 60);
        assert_eq!(buckets.len(), 11); // floor(600/60) + 1
        for (i, bucket) in buckets.iter().enumerate() {
            assert_eq!(bucket.time, i as i64 * 60);
            assert_eq!(bucket.time % 60, 0);
            assert_eq!(bucket.total, 0.0);
        }
    }

    #[test]
    fn test_zero_fill_preserves_existing_rows() {
        let rows = vec![CountRow {
            time: 120,
            acars: 5.0,
            total: 5.0,
            ..Default::default()
        }];
        let buckets = zero_fill_buckets(&rows, 0, 240, 60);
        assert_eq!(buckets.len(), 5);
        assert_eq!(buckets[2].acars, 5.0);
        assert_eq!(buckets[1].acars, 0.0);
        assert_eq!(buckets[3].acars, 0.0);
    }

    #[test]
    fn test_zero_fill_ragged_range() {
        // floor((250-10)/60)+1 = 5 buckets, all step-aligned.
        let buckets = zero_fill_buckets(&[], 10, 250, 60);
        assert_eq!(buckets.len(), 5);
        for bucket in &buckets {
            assert_eq!(bucket.time % 60, 0);
        }
    }

    #[test]
    fn test_build_response_short_window() {
        let (store, _file) = store();
        let now = truncate_to_bucket(Utc::now().timestamp(), 60);
        store
            .increment_count_bucket(&CountBucket {
                time: now - 60,
                resolution: 60,
                acars: 3,
                total: 3,
                ..Default::default()
            })
            .unwrap();

        let spec = WINDOWS[0]; // 1hour
        let response = build_time_series_response(&store, &spec).unwrap();
        assert_eq!(response.window, "1hour");
        assert_eq!(response.buckets.len(), 60);
        assert_eq!(response.end - response.start, spec.span_secs - spec.bucket_secs);
        let hit = response.buckets.iter().find(|b| b.time == now - 60).unwrap();
        assert_eq!(hit.acars, 3.0);
    }

    #[test]
    fn test_build_response_long_window_averages() {
        let (store, _file) = store();
        let now = Utc::now().timestamp();
        let bucket_start = truncate_to_bucket(now - 3_600, 600);
        // Two minute rows inside one 600s bucket: average, not sum.
        for (offset, count) in [(0, 10), (60, 30)] {
            store
                .increment_count_bucket(&CountBucket {
                    time: bucket_start + offset,
                    resolution: 60,
                    vdlm2: count,
                    total: count,
                    ..Default::default()
                })
                .unwrap();
        }

        let spec = WINDOWS[4]; // 1week, 600s buckets
        let response = build_time_series_response(&store, &spec).unwrap();
        assert_eq!(response.buckets.len() as i64, spec.span_secs / spec.bucket_secs);
        let hit = response.buckets.iter().find(|b| b.time == bucket_start).unwrap();
        assert_eq!(hit.vdlm2, 20.0);
    }

    #[test]
    fn test_cache_prime_and_get() {
        let (store, _file) = store();
        let cache = TimeSeriesCache::new(store, HubBroadcaster::new(8));
        cache.prime().unwrap();
        for spec in &WINDOWS {
            let response = cache.get(spec.key).unwrap();
            assert_eq!(response.window, spec.key);
            assert!(!response.buckets.is_empty());
        }
        assert!(cache.get("2hour").is_none());
    }

    #[test]
    fn test_refresh_publishes_update() {
        let (store, _file) = store();
        let bus = HubBroadcaster::new(8);
        let mut rx = bus.subscribe();
        let cache = TimeSeriesCache::new(store, bus);

        cache.refresh_window(&WINDOWS[0]);
        match rx.try_recv().unwrap() {
            HubEvent::TimeSeriesRefreshed { window, response } => {
                assert_eq!(window, "1hour");
                assert_eq!(response.buckets.len(), 60);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_counters_drain_resets() {
        let counters = MessageCounters::new();
        counters.record(DecoderType::Acars, false);
        counters.record(DecoderType::Acars, true);
        counters.record(DecoderType::Hfdl, false);

        let bucket = counters.drain_into_bucket(1200);
        assert_eq!(bucket.time, 1200);
        assert_eq!(bucket.acars, 2);
        assert_eq!(bucket.hfdl, 1);
        assert_eq!(bucket.total, 3);
        assert_eq!(bucket.error, 1);

        let empty = counters.drain_into_bucket(1260);
        assert_eq!(empty.total, 0);
    }

    #[test]
    fn test_flusher_accumulates_same_minute() {
        let (store, _file) = store();
        let counters = Arc::new(MessageCounters::new());
        let flusher = CounterFlusher::new(store.clone(), counters.clone());

        counters.record(DecoderType::Irdm, false);
        flusher.flush();
        counters.record(DecoderType::Irdm, false);
        flusher.flush();

        let rows = store.get_count_range(60, 0, i64::MAX).unwrap();
        // Both flushes land in the same minute bucket within one test run.
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].irdm, 2.0);
        assert_eq!(rows[0].total, 2.0);
    }

    #[test]
    fn test_flusher_skips_empty_minute() {
        let (store, _file) = store();
        let flusher = CounterFlusher::new(store.clone(), Arc::new(MessageCounters::new()));
        flusher.flush();
        assert!(store.get_count_range(60, 0, i64::MAX).unwrap().is_empty());
    }
}
