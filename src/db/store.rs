//! SQLite store implementation.

use rusqlite::{params, Connection, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::models::*;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    uid TEXT PRIMARY KEY,
    message_type TEXT NOT NULL,
    msg_time REAL NOT NULL,
    station_id TEXT NOT NULL DEFAULT '',
    toaddr TEXT NOT NULL DEFAULT '',
    fromaddr TEXT NOT NULL DEFAULT '',
    depa TEXT NOT NULL DEFAULT '',
    dsta TEXT NOT NULL DEFAULT '',
    eta TEXT NOT NULL DEFAULT '',
    gtout TEXT NOT NULL DEFAULT '',
    gtin TEXT NOT NULL DEFAULT '',
    wloff TEXT NOT NULL DEFAULT '',
    wlin TEXT NOT NULL DEFAULT '',
    lat TEXT NOT NULL DEFAULT '',
    lon TEXT NOT NULL DEFAULT '',
    alt TEXT NOT NULL DEFAULT '',
    msg_text TEXT NOT NULL DEFAULT '',
    tail TEXT NOT NULL DEFAULT '',
    flight TEXT NOT NULL DEFAULT '',
    icao TEXT NOT NULL DEFAULT '',
    freq TEXT NOT NULL DEFAULT '',
    ack TEXT NOT NULL DEFAULT '',
    mode TEXT NOT NULL DEFAULT '',
    label TEXT NOT NULL DEFAULT '',
    block_id TEXT NOT NULL DEFAULT '',
    msgno TEXT NOT NULL DEFAULT '',
    is_response TEXT NOT NULL DEFAULT '',
    is_onground TEXT NOT NULL DEFAULT '',
    error INTEGER NOT NULL DEFAULT 0,
    libacars TEXT NOT NULL DEFAULT '',
    level TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_messages_time ON messages (msg_time);
CREATE INDEX IF NOT EXISTS idx_messages_text ON messages (msg_text);
CREATE INDEX IF NOT EXISTS idx_messages_tail ON messages (tail);
CREATE INDEX IF NOT EXISTS idx_messages_flight ON messages (flight);
CREATE INDEX IF NOT EXISTS idx_messages_icao ON messages (icao);
CREATE INDEX IF NOT EXISTS idx_messages_label ON messages (label);
CREATE INDEX IF NOT EXISTS idx_messages_freq ON messages (freq);

CREATE TABLE IF NOT EXISTS alert_matches (
    id INTEGER PRIMARY KEY,
    message_uid TEXT NOT NULL,
    term TEXT NOT NULL,
    type_of_match TEXT NOT NULL,
    matched_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_alert_matches_uid ON alert_matches (message_uid);

CREATE TABLE IF NOT EXISTS alert_terms (
    id INTEGER PRIMARY KEY,
    term TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS alert_ignore (
    id INTEGER PRIMARY KEY,
    term TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS message_counts (
    time INTEGER NOT NULL,
    resolution INTEGER NOT NULL,
    acars INTEGER NOT NULL DEFAULT 0,
    vdlm2 INTEGER NOT NULL DEFAULT 0,
    hfdl INTEGER NOT NULL DEFAULT 0,
    imsl INTEGER NOT NULL DEFAULT 0,
    irdm INTEGER NOT NULL DEFAULT 0,
    total INTEGER NOT NULL DEFAULT 0,
    error INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (time, resolution)
);
";

/// Run the (idempotent) schema migration against the database at `path`.
///
/// This is the body of the isolated migration worker: on a large existing
/// database the index builds can block for minutes, which is why it runs
/// in a separate process rather than inline at startup.
pub fn run_schema_migration<P: AsRef<Path>>(path: P) -> Result<(), DbError> {
    let conn = Connection::open(path)?;
    let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
    conn.execute_batch(SCHEMA)
        .map_err(|e| DbError::Migration(format!("schema migration failed: {}", e)))?;
    Ok(())
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the store at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| DbError::Migration(format!("schema init failed: {}", e)))?;
        Ok(())
    }

    /// Report the active journal mode so operators can detect a degraded
    /// durability mode (anything other than "wal").
    pub fn journal_mode(&self) -> Result<String, DbError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("PRAGMA journal_mode", [], |r| r.get(0))?)
    }

    // --- Messages ---

    /// Insert one normalized message. Messages are immutable once written.
    pub fn add_message(&self, msg: &NormalizedMessage) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO messages (uid, message_type, msg_time, station_id, toaddr, fromaddr,
                depa, dsta, eta, gtout, gtin, wloff, wlin, lat, lon, alt, msg_text, tail,
                flight, icao, freq, ack, mode, label, block_id, msgno, is_response,
                is_onground, error, libacars, level)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31)",
            params![
                msg.uid,
                msg.message_type,
                msg.msg_time,
                msg.station_id,
                msg.toaddr,
                msg.fromaddr,
                msg.depa,
                msg.dsta,
                msg.eta,
                msg.gtout,
                msg.gtin,
                msg.wloff,
                msg.wlin,
                msg.lat,
                msg.lon,
                msg.alt,
                msg.text,
                msg.tail,
                msg.flight,
                msg.icao,
                msg.freq,
                msg.ack,
                msg.mode,
                msg.label,
                msg.block_id,
                msg.msgno,
                msg.is_response,
                msg.is_onground,
                msg.error,
                msg.libacars,
                msg.level,
            ],
        )?;
        Ok(())
    }

    /// Fetch one message by uid.
    pub fn get_message(&self, uid: &str) -> Result<NormalizedMessage, DbError> {
        let conn = self.conn.lock().unwrap();
        let msg = conn
            .query_row(
                "SELECT uid, message_type, msg_time, station_id, toaddr, fromaddr, depa, dsta,
                    eta, gtout, gtin, wloff, wlin, lat, lon, alt, msg_text, tail, flight, icao,
                    freq, ack, mode, label, block_id, msgno, is_response, is_onground, error,
                    libacars, level
                 FROM messages WHERE uid = ?1",
                params![uid],
                |row| {
                    Ok(NormalizedMessage {
                        uid: row.get(0)?,
                        message_type: row.get(1)?,
                        msg_time: row.get(2)?,
                        station_id: row.get(3)?,
                        toaddr: row.get(4)?,
                        fromaddr: row.get(5)?,
                        depa: row.get(6)?,
                        dsta: row.get(7)?,
                        eta: row.get(8)?,
                        gtout: row.get(9)?,
                        gtin: row.get(10)?,
                        wloff: row.get(11)?,
                        wlin: row.get(12)?,
                        lat: row.get(13)?,
                        lon: row.get(14)?,
                        alt: row.get(15)?,
                        text: row.get(16)?,
                        tail: row.get(17)?,
                        flight: row.get(18)?,
                        icao: row.get(19)?,
                        freq: row.get(20)?,
                        ack: row.get(21)?,
                        mode: row.get(22)?,
                        label: row.get(23)?,
                        block_id: row.get(24)?,
                        msgno: row.get(25)?,
                        is_response: row.get(26)?,
                        is_onground: row.get(27)?,
                        error: row.get(28)?,
                        libacars: row.get(29)?,
                        level: row.get(30)?,
                    })
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => DbError::NotFound,
                other => DbError::Sqlite(other),
            })?;
        Ok(msg)
    }

    // --- Alert matches ---

    /// Insert alert match rows in one transaction.
    pub fn add_alert_matches(&self, matches: &[AlertMatch]) -> Result<(), DbError> {
        if matches.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO alert_matches (message_uid, term, type_of_match, matched_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;

            for m in matches {
                stmt.execute(params![m.message_uid, m.term, m.type_of_match, m.matched_at])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Get all alert matches for a message.
    pub fn get_alert_matches(&self, uid: &str) -> Result<Vec<AlertMatch>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT message_uid, term, type_of_match, matched_at
             FROM alert_matches WHERE message_uid = ?1 ORDER BY id ASC",
        )?;

        let matches = stmt
            .query_map(params![uid], |row| {
                Ok(AlertMatch {
                    message_uid: row.get(0)?,
                    term: row.get(1)?,
                    type_of_match: row.get(2)?,
                    matched_at: row.get(3)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(matches)
    }

    // --- Alert term sets ---

    /// Get all alert terms, in insertion order.
    pub fn get_alert_terms(&self) -> Result<Vec<String>, DbError> {
        self.get_terms("alert_terms")
    }

    /// Get all ignore terms, in insertion order.
    pub fn get_alert_ignore(&self) -> Result<Vec<String>, DbError> {
        self.get_terms("alert_ignore")
    }

    /// Replace the alert term set. Terms are upper-cased on write.
    pub fn set_alert_terms(&self, terms: &[String]) -> Result<(), DbError> {
        self.set_terms("alert_terms", terms)
    }

    /// Replace the ignore term set. Terms are upper-cased on write.
    pub fn set_alert_ignore(&self, terms: &[String]) -> Result<(), DbError> {
        self.set_terms("alert_ignore", terms)
    }

    fn get_terms(&self, table: &str) -> Result<Vec<String>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("SELECT term FROM {} ORDER BY id ASC", table))?;
        let terms = stmt
            .query_map([], |row| row.get(0))?
            .collect::<SqlResult<Vec<String>>>()?;
        Ok(terms)
    }

    fn set_terms(&self, table: &str, terms: &[String]) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        tx.execute(&format!("DELETE FROM {}", table), [])?;
        {
            let mut stmt = tx.prepare(&format!("INSERT INTO {} (term) VALUES (?1)", table))?;
            for t in terms {
                // A blank line in a bulk edit would substring-match every
                // message; never persist it.
                if t.trim().is_empty() {
                    continue;
                }
                stmt.execute(params![t.to_uppercase()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // --- Time-series buckets ---

    /// Add a bucket's counts, accumulating into the existing row for the
    /// same (time, resolution) if one is already there.
    pub fn increment_count_bucket(&self, bucket: &CountBucket) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO message_counts (time, resolution, acars, vdlm2, hfdl, imsl, irdm, total, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(time, resolution) DO UPDATE SET
                acars = acars + excluded.acars,
                vdlm2 = vdlm2 + excluded.vdlm2,
                hfdl = hfdl + excluded.hfdl,
                imsl = imsl + excluded.imsl,
                irdm = irdm + excluded.irdm,
                total = total + excluded.total,
                error = error + excluded.error",
            params![
                bucket.time,
                bucket.resolution,
                bucket.acars,
                bucket.vdlm2,
                bucket.hfdl,
                bucket.imsl,
                bucket.irdm,
                bucket.total,
                bucket.error,
            ],
        )?;
        Ok(())
    }

    /// Read raw count rows for a resolution within [start, end], inclusive.
    pub fn get_count_range(
        &self,
        resolution: i64,
        start: i64,
        end: i64,
    ) -> Result<Vec<CountRow>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT time, acars, vdlm2, hfdl, imsl, irdm, total, error
             FROM message_counts
             WHERE resolution = ?1 AND time >= ?2 AND time <= ?3
             ORDER BY time ASC",
        )?;

        let rows = stmt
            .query_map(params![resolution, start, end], |row| {
                Ok(CountRow {
                    time: row.get(0)?,
                    acars: row.get::<_, i64>(1)? as f64,
                    vdlm2: row.get::<_, i64>(2)? as f64,
                    hfdl: row.get::<_, i64>(3)? as f64,
                    imsl: row.get::<_, i64>(4)? as f64,
                    irdm: row.get::<_, i64>(5)? as f64,
                    total: row.get::<_, i64>(6)? as f64,
                    error: row.get::<_, i64>(7)? as f64,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(rows)
    }

    /// Read count rows averaged into `bucket_secs`-wide buckets. Bucket
    /// timestamps are `floor(time / bucket_secs) * bucket_secs`.
    pub fn get_count_downsampled(
        &self,
        resolution: i64,
        bucket_secs: i64,
        start: i64,
        end: i64,
    ) -> Result<Vec<CountRow>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT (time / ?1) * ?1 AS bucket_time,
                    AVG(acars), AVG(vdlm2), AVG(hfdl), AVG(imsl), AVG(irdm), AVG(total), AVG(error)
             FROM message_counts
             WHERE resolution = ?2 AND time >= ?3 AND time <= ?4
             GROUP BY bucket_time
             ORDER BY bucket_time ASC",
        )?;

        let rows = stmt
            .query_map(params![bucket_secs, resolution, start, end], |row| {
                Ok(CountRow {
                    time: row.get(0)?,
                    acars: row.get(1)?,
                    vdlm2: row.get(2)?,
                    hfdl: row.get(3)?,
                    imsl: row.get(4)?,
                    irdm: row.get(5)?,
                    total: row.get(6)?,
                    error: row.get(7)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(rows)
    }

    /// Delete count rows strictly older than the cutoff. Returns the
    /// number of rows deleted.
    pub fn delete_counts_before(&self, cutoff: i64) -> Result<usize, DbError> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM message_counts WHERE time < ?1", params![cutoff])?;
        Ok(deleted)
    }

    /// Reclaim free pages. Blocks the whole store for the duration.
    pub fn reclaim_storage(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("VACUUM")?;
        Ok(())
    }

    // --- Stats ---

    /// Message row count, file size and journal mode for the status surface.
    pub fn stats(&self) -> Result<StoreStats, DbError> {
        let conn = self.conn.lock().unwrap();
        let message_count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
        let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |r| r.get(0))?;
        Ok(StoreStats {
            message_count,
            size_bytes: page_count * page_size,
            journal_mode,
        })
    }
}
