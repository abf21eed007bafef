//! Wire types for the `_changes` feed.

use crate::error::ProtocolResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single `{"rev": ...}` entry in a change's `changes` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRev {
    /// The revision ID the change introduced.
    pub rev: String,
}

/// One entry of the `results` array of a `_changes` response.
///
/// The `seq` field is an opaque, server-defined cursor; it may be a number,
/// a string, or any other JSON value depending on the remote implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ChangeEntry {
    /// Remote sequence token marking this change's position in the feed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<Value>,
    /// Document ID the change applies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Whether the winning revision is a deletion.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    /// Leaf revisions introduced by this change (all leaves with
    /// `style=all_docs`, otherwise just the winner).
    #[serde(default)]
    pub changes: Vec<ChangeRev>,
}

impl ChangeEntry {
    /// Builds an entry for a single revision; mostly useful in tests.
    pub fn new(seq: impl Into<Value>, id: impl Into<String>, rev: impl Into<String>) -> Self {
        Self {
            seq: Some(seq.into()),
            id: Some(id.into()),
            deleted: false,
            changes: vec![ChangeRev { rev: rev.into() }],
        }
    }

    /// The remote sequence as an opaque string token, or `None` if the entry
    /// carries no `seq` (which marks the whole poll response as invalid).
    pub fn sequence_token(&self) -> Option<String> {
        match self.seq.as_ref()? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            other => Some(other.to_string()),
        }
    }
}

/// A full long-poll or one-shot `_changes` response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ChangesFeed {
    /// The change entries, oldest first.
    #[serde(default)]
    pub results: Vec<ChangeEntry>,
    /// The sequence the feed was read up to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seq: Option<Value>,
}

impl ChangesFeed {
    /// Parses a response body.
    pub fn parse(body: &[u8]) -> ProtocolResult<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_feed() {
        let body = br#"{"results":[{"seq":5,"id":"doc1","changes":[{"rev":"1-abc"}]}],"last_seq":5}"#;
        let feed = ChangesFeed::parse(body).unwrap();
        assert_eq!(feed.results.len(), 1);

        let entry = &feed.results[0];
        assert_eq!(entry.sequence_token().as_deref(), Some("5"));
        assert_eq!(entry.id.as_deref(), Some("doc1"));
        assert!(!entry.deleted);
        assert_eq!(entry.changes[0].rev, "1-abc");
    }

    #[test]
    fn sequence_token_shapes() {
        let mut entry = ChangeEntry::new(5, "doc", "1-a");
        assert_eq!(entry.sequence_token().as_deref(), Some("5"));

        entry.seq = Some(json!("12-abcdef"));
        assert_eq!(entry.sequence_token().as_deref(), Some("12-abcdef"));

        entry.seq = Some(json!([3, "cluster"]));
        assert_eq!(entry.sequence_token().as_deref(), Some(r#"[3,"cluster"]"#));

        entry.seq = None;
        assert_eq!(entry.sequence_token(), None);

        entry.seq = Some(Value::Null);
        assert_eq!(entry.sequence_token(), None);
    }

    #[test]
    fn deleted_flag() {
        let body = br#"{"results":[{"seq":2,"id":"gone","deleted":true,"changes":[{"rev":"2-x"}]}]}"#;
        let feed = ChangesFeed::parse(body).unwrap();
        assert!(feed.results[0].deleted);
    }

    #[test]
    fn missing_results_is_empty() {
        let feed = ChangesFeed::parse(b"{}").unwrap();
        assert!(feed.results.is_empty());
    }
}
