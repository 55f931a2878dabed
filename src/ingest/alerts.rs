//! Alert term cache and matching.
//!
//! Two upper-cased term lists (alert, ignore) mirrored from the store.
//! The cache is rebuilt only by an explicit `initialize()` call. Writes
//! go through the store and take effect on the next reload, so a bulk
//! term edit lands atomically.

use std::sync::RwLock;

use serde::Serialize;

use crate::db::{DbError, NormalizedMessage, Store};

/// Matched alert terms, grouped by the field they matched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TermMatches {
    pub text: Vec<String>,
    pub tail: Vec<String>,
    pub flight: Vec<String>,
    pub icao: Vec<String>,
}

impl TermMatches {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.tail.is_empty() && self.flight.is_empty() && self.icao.is_empty()
    }

    /// All (term, field) pairs, in field order.
    pub fn pairs(&self) -> Vec<(&str, &'static str)> {
        let mut out = Vec::new();
        for term in &self.text {
            out.push((term.as_str(), "text"));
        }
        for term in &self.tail {
            out.push((term.as_str(), "tail"));
        }
        for term in &self.flight {
            out.push((term.as_str(), "flight"));
        }
        for term in &self.icao {
            out.push((term.as_str(), "icao"));
        }
        out
    }
}

/// In-memory mirror of the persisted alert term sets.
pub struct AlertCache {
    terms: RwLock<Vec<String>>,
    ignore: RwLock<Vec<String>>,
}

impl AlertCache {
    pub fn new() -> Self {
        Self {
            terms: RwLock::new(Vec::new()),
            ignore: RwLock::new(Vec::new()),
        }
    }

    /// Reload both term lists from the store. Called at startup and after
    /// any administrative change to the persisted sets.
    pub fn initialize(&self, store: &Store) -> Result<(), DbError> {
        let terms = store.get_alert_terms()?;
        let ignore = store.get_alert_ignore()?;
        tracing::info!(
            "AlertCache: loaded {} alert terms, {} ignore terms",
            terms.len(),
            ignore.len()
        );
        *self.terms.write().unwrap() = terms;
        *self.ignore.write().unwrap() = ignore;
        Ok(())
    }

    pub fn terms(&self) -> Vec<String> {
        self.terms.read().unwrap().clone()
    }

    pub fn ignore(&self) -> Vec<String> {
        self.ignore.read().unwrap().clone()
    }

    /// Match a normalized message against the cached term sets.
    ///
    /// Matching is case-insensitive substring over text, tail, flight and
    /// icao. An ignore term matching anywhere in the message suppresses
    /// the whole message, even when the hit is in a different field than
    /// the alert term.
    pub fn evaluate(&self, msg: &NormalizedMessage) -> TermMatches {
        let text = msg.text.to_uppercase();
        let tail = msg.tail.to_uppercase();
        let flight = msg.flight.to_uppercase();
        let icao = msg.icao.to_uppercase();
        let fields = [&text, &tail, &flight, &icao];

        {
            let ignore = self.ignore.read().unwrap();
            for term in ignore.iter() {
                if term.is_empty() {
                    continue;
                }
                if fields.iter().any(|f| !f.is_empty() && f.contains(term)) {
                    return TermMatches::default();
                }
            }
        }

        let mut out = TermMatches::default();
        let terms = self.terms.read().unwrap();
        for term in terms.iter() {
            if term.is_empty() {
                continue;
            }
            if !text.is_empty() && text.contains(term) {
                out.text.push(term.clone());
            }
            if !tail.is_empty() && tail.contains(term) {
                out.tail.push(term.clone());
            }
            if !flight.is_empty() && flight.contains(term) {
                out.flight.push(term.clone());
            }
            if !icao.is_empty() && icao.contains(term) {
                out.icao.push(term.clone());
            }
        }
        out
    }
}

impl Default for AlertCache {
    fn default() -> Self {
        Self::new()
    }
}
