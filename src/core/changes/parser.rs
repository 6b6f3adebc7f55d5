//! Incremental parser for `_changes` response bodies.
//!
//! Bytes are fed in whatever pieces the transport delivers. In continuous
//! mode every complete line yields its change as soon as the newline arrives;
//! blank lines are heartbeats. In the other modes the body is one JSON object
//! that can only be parsed once it has fully arrived, in [`ChangeParser::finish`].
//!
//! A response that was not empty but yielded nothing parsable is an error,
//! so the tracker treats it like any other failed connection.
//!
//! # Examples
//!
//! ```
//! use couch_rs::changes::{ChangeParser, FeedMode};
//!
//! let mut parser = ChangeParser::new(FeedMode::Continuous);
//! assert!(parser.feed(br#"{"seq":5,"id":"a","chan"#).is_empty());
//! let changes = parser.feed(b"ges\":[{\"rev\":\"2-x\"}]}\n\n");
//! assert_eq!(changes[0].seq, 5);
//! assert_eq!(parser.last_seq(), Some(5));
//! ```

use super::FeedMode;
use crate::core::error::{CouchError, Result};
use crate::core::types::change::{parse_seq, seq_token};
use crate::core::types::{Change, ChangesBatch};
use bytes::{Buf, BytesMut};
use serde_json::Value;

#[derive(Debug)]
pub struct ChangeParser {
    mode: FeedMode,
    buffer: BytesMut,
    last_seq: Option<u64>,
    last_seq_token: Option<String>,
    parsed: usize,
    malformed: usize,
}

impl ChangeParser {
    pub fn new(mode: FeedMode) -> Self {
        ChangeParser {
            mode,
            buffer: BytesMut::with_capacity(4096),
            last_seq: None,
            last_seq_token: None,
            parsed: 0,
            malformed: 0,
        }
    }

    pub fn mode(&self) -> FeedMode {
        self.mode
    }

    /// Highest sequence number seen so far, from entries or `last_seq`.
    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    /// Sequence token of the latest entry or `last_seq`, if the server
    /// spelled it as something other than a plain number.
    pub fn last_seq_token(&self) -> Option<&str> {
        self.last_seq_token.as_deref()
    }

    /// Units parsed so far: changes, `last_seq` lines and whole bodies.
    pub fn parsed_units(&self) -> usize {
        self.parsed
    }

    /// Entries skipped because they could not be parsed.
    pub fn malformed(&self) -> usize {
        self.malformed
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Appends `chunk` and returns every change that is now complete.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Change> {
        self.buffer.extend_from_slice(chunk);
        let mut changes = Vec::new();
        if self.mode != FeedMode::Continuous {
            return changes;
        }

        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.split_to(newline);
            self.buffer.advance(1);
            self.parse_line(&line, &mut changes);
        }
        changes
    }

    /// Consumes whatever is left once the response has ended.
    ///
    /// In continuous mode a final line without a newline is still parsed, and
    /// a feed whose every line was malformed is an error. In the other modes
    /// the whole body is parsed here, and a body that is not a changes object
    /// at all is an error.
    pub fn finish(&mut self) -> Result<Vec<Change>> {
        let rest = self.buffer.split();
        if self.mode == FeedMode::Continuous {
            let mut changes = Vec::new();
            self.parse_line(&rest, &mut changes);
            if self.parsed == 0 && self.malformed > 0 {
                return Err(CouchError::BodyParse(format!(
                    "none of the {} lines of the change feed could be parsed",
                    self.malformed
                )));
            }
            return Ok(changes);
        }

        let batch = ChangesBatch::parse(&rest)?;
        self.parsed += 1;
        self.malformed += batch.skipped;
        self.record_seq(batch.last_seq, batch.last_seq_token);
        Ok(batch.results)
    }

    fn parse_line(&mut self, line: &[u8], out: &mut Vec<Change>) {
        let line = trim(line);
        if line.is_empty() {
            return;
        }

        let value: Value = match serde_json::from_slice(line) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(
                    "Skipping malformed change line {:?}: {}",
                    String::from_utf8_lossy(line),
                    e
                );
                self.malformed += 1;
                return;
            }
        };

        // A continuous feed that times out ends with `{"last_seq": N}`.
        if value.get("id").is_none() {
            if let Some(last_seq) = value.get("last_seq") {
                let token = seq_token(last_seq);
                if let Some(seq) = parse_seq(last_seq).or(token.as_ref().map(|_| 0)) {
                    self.parsed += 1;
                    self.record_seq(seq, token);
                    return;
                }
            }
        }

        match Change::from_value(value) {
            Ok(change) => {
                self.parsed += 1;
                self.record_seq(change.seq, change.seq_token.clone());
                out.push(change);
            }
            Err(e) => {
                tracing::warn!(
                    "Skipping malformed change line {:?}: {}",
                    String::from_utf8_lossy(line),
                    e
                );
                self.malformed += 1;
            }
        }
    }

    /// Entries arrive in server order, so the newest token always wins.
    fn record_seq(&mut self, seq: u64, token: Option<String>) {
        self.last_seq = Some(self.last_seq.map_or(seq, |last| last.max(seq)));
        self.last_seq_token = token;
    }
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}
