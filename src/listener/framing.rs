//! Raw-byte-to-JSON framing for decoder feeds.
//!
//! Decoders delimit JSON objects with newlines, but some emit objects
//! back-to-back with no separator (`}{`), and a TCP read can end in the
//! middle of an object. This module turns arbitrary read chunks into a
//! sequence of parsed JSON objects, buffering at most one partial object
//! between reads.

use serde_json::Value;

use super::DecoderType;

/// Largest partial object we are willing to buffer between reads. A
/// fragment that grows past this without completing is garbage, not a
/// slow-arriving message.
const MAX_PARTIAL_BYTES: usize = 64 * 1024;

/// Reassembly buffer for one connection.
///
/// A partial is held across at most one read: if prefixing it to the next
/// read's first segment still doesn't produce valid JSON, both are
/// discarded. This bounds memory and keeps a stale fragment from being
/// glued onto unrelated data.
#[derive(Debug)]
pub struct FrameBuffer {
    decoder: DecoderType,
    partial: Option<String>,
}

impl FrameBuffer {
    pub fn new(decoder: DecoderType) -> Self {
        Self {
            decoder,
            partial: None,
        }
    }

    /// Drop any buffered partial. Called on connection reset so a
    /// fragment from a stale connection never merges with a fresh one.
    pub fn reset(&mut self) {
        if let Some(partial) = self.partial.take() {
            tracing::debug!(
                "Framing: {} discarding {} byte partial on reset",
                self.decoder,
                partial.len()
            );
        }
    }

    /// Feed one read's worth of data, returning the complete JSON objects
    /// it yields in arrival order.
    pub fn extract(&mut self, chunk: &str) -> Vec<Value> {
        let rewritten = chunk.replace("}{", "}\n{");
        let terminated = rewritten.ends_with('\n');
        let segments: Vec<&str> = rewritten.split('\n').collect();
        let last = segments.len() - 1;

        let mut out = Vec::new();
        let mut pending = self.partial.take();

        for (i, segment) in segments.iter().enumerate() {
            // An unterminated final segment may be a mid-object read.
            let is_tail = i == last && !terminated;

            if let Some(partial) = pending.take() {
                // One reassembly attempt: partial + first segment.
                let joined = format!("{}{}", partial, segment);
                match serde_json::from_str::<Value>(&joined) {
                    Ok(value) => out.push(value),
                    Err(_) if is_tail && joined.len() <= MAX_PARTIAL_BYTES => {
                        // Still mid-object; keep accumulating.
                        self.partial = Some(joined);
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Framing: {} dropping unreassemblable partial ({} bytes): {}",
                            self.decoder,
                            joined.len(),
                            e
                        );
                    }
                }
                continue;
            }

            if segment.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<Value>(segment) {
                Ok(value) => out.push(value),
                Err(_) if is_tail && segment.len() <= MAX_PARTIAL_BYTES => {
                    self.partial = Some((*segment).to_string());
                }
                Err(e) => {
                    tracing::warn!(
                        "Framing: {} dropping invalid JSON line ({} bytes): {}",
                        self.decoder,
                        segment.len(),
                        e
                    );
                }
            }
        }

        out
    }

    #[cfg(test)]
    pub fn has_partial(&self) -> bool {
        self.partial.is_some()
    }
}

/// Parse a single datagram. Datagrams are self-contained: a truncated
/// tail is dropped rather than buffered for the next datagram.
pub fn parse_datagram(decoder: DecoderType, chunk: &str) -> Vec<Value> {
    let mut buffer = FrameBuffer::new(decoder);
    let out = buffer.extract(chunk);
    if buffer.partial.is_some() {
        tracing::warn!("Framing: {} dropping truncated datagram tail", decoder);
    }
    out
}
