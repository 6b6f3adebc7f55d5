//! Entries of a database's `_changes` feed.
//!
//! A change entry on the wire looks like:
//!
//! ```text
//! {"seq": 5, "id": "doc1", "changes": [{"rev": "2-x"}], "deleted": true}
//! ```
//!
//! Servers differ in how they spell the sequence: a JSON number, a numeric
//! string, a clustered `"12-g1AAA…"` token, an opaque string, or a separate
//! `seq_num` field. [`Change::seq`] is the numeric position (the leading
//! integer, or 0 when the token has none). Any non-numeric spelling is also
//! kept in [`Change::seq_token`], because that exact text is what the server
//! expects back as `since`.

use crate::core::error::{CouchError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::convert::TryFrom;

/// One revision listed in a change entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRef {
    pub rev: String,
}

/// A single document change reported by the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawChange")]
pub struct Change {
    pub seq: u64,
    /// The sequence as sent, when it was not a plain number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq_token: Option<String>,
    pub id: String,
    pub changes: Vec<RevisionRef>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
    /// Any other members of the entry, kept verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Change {
    /// Revision ids in feed order.
    pub fn revisions(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().map(|r| r.rev.as_str())
    }

    /// Parses a change from a JSON value.
    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

#[derive(Deserialize)]
struct RawChange {
    #[serde(default)]
    seq: Option<Value>,
    #[serde(default)]
    seq_num: Option<Value>,
    id: String,
    #[serde(default)]
    changes: Vec<RevisionRef>,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    doc: Option<Value>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

impl TryFrom<RawChange> for Change {
    type Error = String;

    fn try_from(raw: RawChange) -> std::result::Result<Self, Self::Error> {
        let seq_token = raw.seq.as_ref().and_then(seq_token);
        let seq = raw
            .seq_num
            .as_ref()
            .and_then(parse_seq)
            .or_else(|| raw.seq.as_ref().and_then(parse_seq));
        let seq = match (seq, &seq_token) {
            (Some(seq), _) => seq,
            (None, Some(_)) => 0,
            (None, None) => return Err(format!("change for {:?} has no usable sequence", raw.id)),
        };
        Ok(Change {
            seq,
            seq_token,
            id: raw.id,
            changes: raw.changes,
            deleted: raw.deleted,
            doc: raw.doc,
            extra: raw.extra,
        })
    }
}

/// Numeric position of a sequence, if its spelling carries one.
pub(crate) fn parse_seq(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => {
            let digits: &str = s.split('-').next().unwrap_or("");
            digits.trim().parse().ok()
        }
        Value::Array(items) => items.first().and_then(parse_seq),
        _ => None,
    }
}

/// The text to send back as `since` for a non-numeric sequence.
///
/// Plain numbers and purely numeric strings need no token.
pub(crate) fn seq_token(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if s.trim().parse::<u64>().is_ok() => None,
        Value::String(s) => Some(s.clone()),
        Value::Array(_) => Some(value.to_string()),
        _ => None,
    }
}

/// A complete `feed=normal` or `feed=longpoll` response body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangesBatch {
    pub results: Vec<Change>,
    pub last_seq: u64,
    /// `last_seq` as sent, when it was not a plain number.
    pub last_seq_token: Option<String>,
    /// Number of entries that could not be parsed and were skipped.
    pub skipped: usize,
}

impl ChangesBatch {
    /// Parses a whole `{"results": [...], "last_seq": N}` body.
    ///
    /// Individual malformed entries are skipped; a body that is not such an
    /// object at all is an error.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| CouchError::BodyParse(format!("changes response is not JSON: {}", e)))?;
        let results = value
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| CouchError::BodyParse("changes response has no results array".into()))?;

        let mut batch = ChangesBatch::default();
        for entry in results {
            match Change::from_value(entry.clone()) {
                Ok(change) => batch.results.push(change),
                Err(e) => {
                    tracing::warn!("Skipping malformed change entry {}: {}", entry, e);
                    batch.skipped += 1;
                }
            }
        }

        let max_seen = batch.results.iter().map(|c| c.seq).max().unwrap_or(0);
        let last_seq = value.get("last_seq");
        batch.last_seq = last_seq
            .and_then(parse_seq)
            .unwrap_or(max_seen)
            .max(max_seen);
        batch.last_seq_token = match last_seq {
            Some(last_seq) => seq_token(last_seq),
            None => batch.results.last().and_then(|c| c.seq_token.clone()),
        };
        Ok(batch)
    }
}
