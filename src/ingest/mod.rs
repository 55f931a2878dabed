//! Ingestion pipeline: normalize, match, persist, fan out.
//!
//! Every inbound decoder object flows through `Pipeline::process`, which
//! is infallible at its surface. A malformed message or a failed store
//! write is logged with its decoder type and degrades to "this one
//! message wasn't saved"; it never takes down the listener that
//! produced it.

mod alerts;

pub use alerts::{AlertCache, TermMatches};

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::broadcast::{HubBroadcaster, HubEvent};
use crate::db::{AlertMatch, NormalizedMessage, Store};
use crate::listener::{DecoderType, ListenerEvent};
use crate::stats::MessageCounters;

/// Result of ingesting one message, handed to the broadcast sink.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AlertOutcome {
    pub uid: String,
    pub matched: bool,
    pub matches: TermMatches,
}

pub struct Pipeline {
    store: Arc<Store>,
    mirror: Option<Arc<Store>>,
    alerts: Arc<AlertCache>,
    counters: Arc<MessageCounters>,
    bus: HubBroadcaster,
}

impl Pipeline {
    pub fn new(
        store: Arc<Store>,
        mirror: Option<Arc<Store>>,
        alerts: Arc<AlertCache>,
        counters: Arc<MessageCounters>,
        bus: HubBroadcaster,
    ) -> Self {
        Self {
            store,
            mirror,
            alerts,
            counters,
            bus,
        }
    }

    /// Ingest one raw decoder object. Returns the alert outcome; on any
    /// internal failure the outcome is empty and unmatched.
    pub fn process(&self, decoder: DecoderType, raw: &Value) -> AlertOutcome {
        let mut msg = normalize(decoder, raw);
        msg.uid = Uuid::new_v4().to_string();

        self.counters.record(decoder, msg.error > 0);

        let matches = self.alerts.evaluate(&msg);

        if let Err(e) = self.store.add_message(&msg) {
            tracing::error!("Ingest: {} failed to persist {}: {}", decoder, msg.uid, e);
            return AlertOutcome::default();
        }
        if let Some(mirror) = &self.mirror {
            // Best-effort redundancy, not a two-phase commit.
            if let Err(e) = mirror.add_message(&msg) {
                tracing::warn!("Ingest: {} mirror write failed for {}: {}", decoder, msg.uid, e);
            }
        }

        if !matches.is_empty() {
            let matched_at = Utc::now().timestamp();
            let rows: Vec<AlertMatch> = matches
                .pairs()
                .into_iter()
                .map(|(term, field)| AlertMatch {
                    message_uid: msg.uid.clone(),
                    term: term.to_string(),
                    type_of_match: field.to_string(),
                    matched_at,
                })
                .collect();
            if let Err(e) = self.store.add_alert_matches(&rows) {
                tracing::error!("Ingest: {} failed to save alert matches for {}: {}", decoder, msg.uid, e);
            }
        }

        let outcome = AlertOutcome {
            uid: msg.uid,
            matched: !matches.is_empty(),
            matches,
        };
        self.bus.publish(HubEvent::MessageProcessed {
            decoder,
            outcome: outcome.clone(),
        });
        outcome
    }
}

/// Consume listener events until the channel closes. Connectivity events
/// are state changes, not application errors.
pub async fn run(mut events: mpsc::UnboundedReceiver<ListenerEvent>, pipeline: Arc<Pipeline>) {
    while let Some(event) = events.recv().await {
        match event {
            ListenerEvent::Connected(decoder) => {
                tracing::info!("Ingest: {} feed connected", decoder);
            }
            ListenerEvent::Disconnected(decoder) => {
                tracing::info!("Ingest: {} feed disconnected", decoder);
            }
            ListenerEvent::Error(decoder, e) => {
                tracing::warn!("Ingest: {} feed error: {}", decoder, e);
            }
            ListenerEvent::Message(decoder, raw) => {
                let outcome = pipeline.process(decoder, &raw);
                if outcome.matched {
                    tracing::debug!("Ingest: {} message {} matched alerts", decoder, outcome.uid);
                }
            }
        }
    }
    tracing::info!("Ingest: event channel closed, pipeline stopping");
}

/// Map a raw decoder object onto the fixed normalized shape.
///
/// Decoders disagree on types (numbers vs. strings) and field names, so
/// everything is coerced to strings. Unknown keys are logged and not
/// stored; `channel` and `end` are decoder-internal and skipped outright.
pub fn normalize(decoder: DecoderType, raw: &Value) -> NormalizedMessage {
    let mut msg = NormalizedMessage {
        message_type: decoder.as_str().to_string(),
        msg_time: Utc::now().timestamp() as f64,
        ..Default::default()
    };

    let Some(object) = raw.as_object() else {
        tracing::warn!("Ingest: {} non-object payload, storing empty record", decoder);
        return msg;
    };

    for (key, value) in object {
        match key.as_str() {
            "timestamp" | "time" => {
                if let Some(t) = as_f64(value) {
                    msg.msg_time = t;
                }
            }
            "station_id" => msg.station_id = coerce(value),
            "toaddr" => msg.toaddr = coerce(value),
            "fromaddr" => msg.fromaddr = coerce(value),
            "depa" => msg.depa = coerce(value),
            "dsta" => msg.dsta = coerce(value),
            "eta" => msg.eta = coerce(value),
            "gtout" => msg.gtout = coerce(value),
            "gtin" => msg.gtin = coerce(value),
            "wloff" => msg.wloff = coerce(value),
            "wlin" => msg.wlin = coerce(value),
            "lat" => msg.lat = coerce(value),
            "lon" => msg.lon = coerce(value),
            "alt" => msg.alt = coerce(value),
            // `data` is the legacy name some decoders use for `text`.
            "text" | "data" => msg.text = coerce(value),
            "tail" => msg.tail = coerce(value),
            "flight" => msg.flight = coerce(value),
            "icao" => msg.icao = coerce(value),
            "freq" => msg.freq = pad_freq(&coerce(value)),
            "ack" => msg.ack = coerce(value),
            "mode" => msg.mode = coerce(value),
            "label" => msg.label = coerce(value),
            "block_id" => msg.block_id = coerce(value),
            "msgno" => msg.msgno = coerce(value),
            "is_response" => msg.is_response = coerce(value),
            "is_onground" => msg.is_onground = coerce(value),
            "error" => msg.error = as_i64(value),
            "libacars" => {
                msg.libacars = serde_json::to_string(value).unwrap_or_default();
            }
            "level" => msg.level = coerce(value),
            "channel" | "end" => {}
            other => {
                tracing::debug!("Ingest: {} unknown field {:?} not stored", decoder, other);
            }
        }
    }

    msg
}

fn coerce(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn as_i64(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n.as_i64().unwrap_or(0),
        Value::String(s) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

/// Right-pad a frequency to a fixed width so `131.55` and `131.550`
/// compare equal across decoders.
fn pad_freq(freq: &str) -> String {
    if freq.is_empty() {
        return String::new();
    }
    format!("{:0<7}", freq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::NamedTempFile;

    fn pipeline() -> (Arc<Pipeline>, Arc<Store>, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(file.path()).unwrap());
        let alerts = Arc::new(AlertCache::new());
        let pipeline = Pipeline::new(
            store.clone(),
            None,
            alerts,
            Arc::new(MessageCounters::new()),
            HubBroadcaster::new(8),
        );
        (Arc::new(pipeline), store, file)
    }

    #[test]
    fn test_normalize_basic_fields() {
        let raw = json!({
            "timestamp": 1700000000.25,
            "tail": "N123AB",
            "flight": "UAL1",
            "icao": 11259375,
            "label": "H1",
            "error": 2,
            "text": "POSITION REPORT"
        });
        let msg = normalize(DecoderType::Acars, &raw);
        assert_eq!(msg.message_type, "ACARS");
        assert_eq!(msg.msg_time, 1700000000.25);
        assert_eq!(msg.tail, "N123AB");
        assert_eq!(msg.icao, "11259375");
        assert_eq!(msg.error, 2);
        assert_eq!(msg.text, "POSITION REPORT");
    }

    #[test]
    fn test_normalize_data_alias() {
        let raw = json!({"data": "legacy text field"});
        let msg = normalize(DecoderType::Vdlm2, &raw);
        assert_eq!(msg.text, "legacy text field");
    }

    #[test]
    fn test_normalize_freq_padding() {
        let msg = normalize(DecoderType::Acars, &json!({"freq": 131.55}));
        assert_eq!(msg.freq, "131.550");
        let msg = normalize(DecoderType::Acars, &json!({"freq": "136.975"}));
        assert_eq!(msg.freq, "136.975");
        let msg = normalize(DecoderType::Acars, &json!({}));
        assert_eq!(msg.freq, "");
    }

    #[test]
    fn test_normalize_libacars_serialized() {
        let raw = json!({"libacars": {"arinc622": {"msg_type": "adsc"}}});
        let msg = normalize(DecoderType::Hfdl, &raw);
        let back: Value = serde_json::from_str(&msg.libacars).unwrap();
        assert_eq!(back["arinc622"]["msg_type"], "adsc");
    }

    #[test]
    fn test_normalize_unknown_and_skipped_keys() {
        let raw = json!({
            "text": "hello",
            "channel": 3,
            "end": true,
            "some_new_decoder_field": {"a": 1}
        });
        let msg = normalize(DecoderType::Irdm, &raw);
        assert_eq!(msg.text, "hello");
        // Nothing else lands anywhere.
        assert_eq!(msg.station_id, "");
    }

    #[test]
    fn test_normalize_error_coercion() {
        assert_eq!(normalize(DecoderType::Acars, &json!({"error": "3"})).error, 3);
        assert_eq!(normalize(DecoderType::Acars, &json!({"error": "bad"})).error, 0);
        assert_eq!(normalize(DecoderType::Acars, &json!({})).error, 0);
    }

    #[test]
    fn test_process_persists_and_returns_uid() {
        let (pipeline, store, _file) = pipeline();
        let outcome = pipeline.process(DecoderType::Acars, &json!({"text": "hello", "tail": "N1"}));
        assert!(!outcome.uid.is_empty());
        assert!(!outcome.matched);

        let stored = store.get_message(&outcome.uid).unwrap();
        assert_eq!(stored.text, "hello");
        assert_eq!(stored.message_type, "ACARS");
    }

    #[test]
    fn test_process_records_alert_matches() {
        let file = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(file.path()).unwrap());
        store.set_alert_terms(&["MAYDAY".to_string()]).unwrap();
        let alerts = Arc::new(AlertCache::new());
        alerts.initialize(&store).unwrap();
        let pipeline = Pipeline::new(
            store.clone(),
            None,
            alerts,
            Arc::new(MessageCounters::new()),
            HubBroadcaster::new(8),
        );

        let outcome = pipeline.process(DecoderType::Vdlm2, &json!({"text": "MAYDAY MAYDAY"}));
        assert!(outcome.matched);
        assert_eq!(outcome.matches.text, vec!["MAYDAY".to_string()]);

        let rows = store.get_alert_matches(&outcome.uid).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].term, "MAYDAY");
        assert_eq!(rows[0].type_of_match, "text");
    }

    #[test]
    fn test_process_writes_mirror() {
        let file = NamedTempFile::new().unwrap();
        let mirror_file = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(file.path()).unwrap());
        let mirror = Arc::new(Store::new(mirror_file.path()).unwrap());
        let pipeline = Pipeline::new(
            store.clone(),
            Some(mirror.clone()),
            Arc::new(AlertCache::new()),
            Arc::new(MessageCounters::new()),
            HubBroadcaster::new(8),
        );

        let outcome = pipeline.process(DecoderType::Imsl, &json!({"text": "mirrored"}));
        assert_eq!(store.get_message(&outcome.uid).unwrap().text, "mirrored");
        assert_eq!(mirror.get_message(&outcome.uid).unwrap().text, "mirrored");
    }

    #[tokio::test]
    async fn test_run_consumes_message_events() {
        let (pipeline, store, _file) = pipeline();
        let (tx, rx) = mpsc::unbounded_channel();

        tx.send(ListenerEvent::Connected(DecoderType::Acars)).unwrap();
        tx.send(ListenerEvent::Message(DecoderType::Acars, json!({"text": "from loop"}))).unwrap();
        tx.send(ListenerEvent::Disconnected(DecoderType::Acars)).unwrap();
        drop(tx);

        run(rx, pipeline).await;

        let stats = store.stats().unwrap();
        assert_eq!(stats.message_count, 1);
    }
}
