//! Database model types.

use serde::{Deserialize, Serialize};

/// A message after normalization, as persisted to the store.
///
/// Every field the decoders emit is stored as a string so that
/// heterogeneous decoder output (numbers vs. strings for the same field)
/// never fails a write. `error` is the only numeric field; `msg_time` is
/// Unix seconds with fractional precision preserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub uid: String,
    pub message_type: String,
    pub msg_time: f64,
    pub station_id: String,
    pub toaddr: String,
    pub fromaddr: String,
    pub depa: String,
    pub dsta: String,
    pub eta: String,
    pub gtout: String,
    pub gtin: String,
    pub wloff: String,
    pub wlin: String,
    pub lat: String,
    pub lon: String,
    pub alt: String,
    pub text: String,
    pub tail: String,
    pub flight: String,
    pub icao: String,
    pub freq: String,
    pub ack: String,
    pub mode: String,
    pub label: String,
    pub block_id: String,
    pub msgno: String,
    pub is_response: String,
    pub is_onground: String,
    pub error: i64,
    pub libacars: String,
    pub level: String,
}

impl Default for NormalizedMessage {
    fn default() -> Self {
        Self {
            uid: String::new(),
            message_type: String::new(),
            msg_time: 0.0,
            station_id: String::new(),
            toaddr: String::new(),
            fromaddr: String::new(),
            depa: String::new(),
            dsta: String::new(),
            eta: String::new(),
            gtout: String::new(),
            gtin: String::new(),
            wloff: String::new(),
            wlin: String::new(),
            lat: String::new(),
            lon: String::new(),
            alt: String::new(),
            text: String::new(),
            tail: String::new(),
            flight: String::new(),
            icao: String::new(),
            freq: String::new(),
            ack: String::new(),
            mode: String::new(),
            label: String::new(),
            block_id: String::new(),
            msgno: String::new(),
            is_response: String::new(),
            is_onground: String::new(),
            error: 0,
            libacars: String::new(),
            level: String::new(),
        }
    }
}

/// One alert term that matched one field of one message.
#[derive(Debug, Clone, Serialize)]
pub struct AlertMatch {
    pub message_uid: String,
    pub term: String,
    pub type_of_match: String,
    pub matched_at: i64,
}

/// One raw time-series row: per-decoder message counts for a single
/// (timestamp, resolution) bucket. Timestamps are Unix seconds truncated
/// to the bucket boundary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CountBucket {
    pub time: i64,
    pub resolution: i64,
    pub acars: i64,
    pub vdlm2: i64,
    pub hfdl: i64,
    pub imsl: i64,
    pub irdm: i64,
    pub total: i64,
    pub error: i64,
}

/// A count row as read back for time-series queries. Counters are floats
/// because long-window reads return bucketed averages.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CountRow {
    pub time: i64,
    pub acars: f64,
    pub vdlm2: f64,
    pub hfdl: f64,
    pub imsl: f64,
    pub irdm: f64,
    pub total: f64,
    pub error: f64,
}

/// Store size statistics for operators.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub message_count: i64,
    pub size_bytes: i64,
    pub journal_mode: String,
}
