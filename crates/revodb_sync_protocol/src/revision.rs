//! Revision identity, generation parsing, and history encoding.

use crate::error::{ProtocolError, ProtocolResult};
use serde_json::{json, Map, Value};

/// Returns true if `id` may be used as a document ID.
///
/// IDs starting with an underscore are reserved, except for design and local
/// documents.
pub fn is_valid_document_id(id: &str) -> bool {
    if id.is_empty() {
        return false;
    }
    if id.starts_with('_') {
        return id.starts_with("_design/") || id.starts_with("_local/");
    }
    true
}

/// Parses the generation number out of a revision ID (`"3-deadbeef"` → 3).
///
/// Returns 0 for malformed IDs.
pub fn generation(rev_id: &str) -> u64 {
    match rev_id.split_once('-') {
        Some((gen, suffix)) if !suffix.is_empty() => gen.parse().unwrap_or(0),
        _ => 0,
    }
}

/// The digest portion of a revision ID (`"3-deadbeef"` → `"deadbeef"`).
fn digest_suffix(rev_id: &str) -> &str {
    rev_id.split_once('-').map(|(_, s)| s).unwrap_or(rev_id)
}

/// Parses a document's `_revisions` ancestry into full revision IDs,
/// newest first. Returns an empty list when the property is absent or
/// malformed.
pub fn parse_revision_history(properties: &Map<String, Value>) -> Vec<String> {
    let Some(revisions) = properties.get("_revisions").and_then(Value::as_object) else {
        return Vec::new();
    };
    let Some(start) = revisions.get("start").and_then(Value::as_u64) else {
        return Vec::new();
    };
    let Some(ids) = revisions.get("ids").and_then(Value::as_array) else {
        return Vec::new();
    };
    if (ids.len() as u64) > start {
        return Vec::new();
    }
    ids.iter()
        .enumerate()
        .filter_map(|(i, id)| {
            let digest = id.as_str()?;
            Some(format!("{}-{}", start - i as u64, digest))
        })
        .collect()
}

/// Encodes a newest-first list of revision IDs as a `_revisions` value.
pub fn encode_revision_history(history: &[String]) -> Value {
    let start = history.first().map(|rev| generation(rev)).unwrap_or(0);
    let ids: Vec<&str> = history.iter().map(|rev| digest_suffix(rev)).collect();
    json!({ "start": start, "ids": ids })
}

/// A document revision moving through replication.
///
/// Identified by (document ID, revision ID); carries a deleted flag and,
/// once fetched or loaded, the full properties map.
#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    /// Document ID.
    pub doc_id: String,
    /// Revision ID (`<generation>-<digest>`).
    pub rev_id: String,
    /// Whether this revision is a deletion.
    pub deleted: bool,
    /// Full body, if loaded.
    pub properties: Option<Map<String, Value>>,
}

impl Revision {
    /// Creates a bodiless revision stub.
    pub fn new(doc_id: impl Into<String>, rev_id: impl Into<String>, deleted: bool) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev_id: rev_id.into(),
            deleted,
            properties: None,
        }
    }

    /// Builds a revision from a full properties map, reading `_id`, `_rev`,
    /// and `_deleted`.
    pub fn from_properties(properties: Map<String, Value>) -> ProtocolResult<Self> {
        let doc_id = properties
            .get("_id")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::invalid_structure("document is missing _id"))?
            .to_string();
        let rev_id = properties
            .get("_rev")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::invalid_structure("document is missing _rev"))?
            .to_string();
        let deleted = properties
            .get("_deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(Self {
            doc_id,
            rev_id,
            deleted,
            properties: Some(properties),
        })
    }

    /// The revision's generation number.
    pub fn generation(&self) -> u64 {
        generation(&self.rev_id)
    }

    /// The `_attachments` map, if the body carries one.
    pub fn attachments(&self) -> Option<&Map<String, Value>> {
        self.properties
            .as_ref()?
            .get("_attachments")
            .and_then(Value::as_object)
    }

    /// Revision ancestry parsed from the body's `_revisions`, newest first.
    pub fn history(&self) -> Vec<String> {
        self.properties
            .as_ref()
            .map(parse_revision_history)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_id_validation() {
        assert!(is_valid_document_id("doc1"));
        assert!(is_valid_document_id("_design/views"));
        assert!(is_valid_document_id("_local/checkpoint"));
        assert!(!is_valid_document_id(""));
        assert!(!is_valid_document_id("_hidden"));
        assert!(!is_valid_document_id("_replicator"));
    }

    #[test]
    fn generation_parsing() {
        assert_eq!(generation("1-abc"), 1);
        assert_eq!(generation("42-deadbeef"), 42);
        assert_eq!(generation("nonsense"), 0);
        assert_eq!(generation("x-abc"), 0);
        assert_eq!(generation("7-"), 0);
    }

    #[test]
    fn history_round_trip() {
        let history = vec!["3-ccc".to_string(), "2-bbb".to_string(), "1-aaa".to_string()];
        let encoded = encode_revision_history(&history);

        let mut properties = Map::new();
        properties.insert("_revisions".into(), encoded);
        assert_eq!(parse_revision_history(&properties), history);
    }

    #[test]
    fn history_absent_or_malformed() {
        let empty = Map::new();
        assert!(parse_revision_history(&empty).is_empty());

        let mut bad = Map::new();
        bad.insert("_revisions".into(), json!({"start": 1, "ids": ["a", "b"]}));
        assert!(parse_revision_history(&bad).is_empty());
    }

    #[test]
    fn revision_from_properties() {
        let mut properties = Map::new();
        properties.insert("_id".into(), json!("doc1"));
        properties.insert("_rev".into(), json!("2-def"));
        properties.insert("value".into(), json!(7));

        let rev = Revision::from_properties(properties).unwrap();
        assert_eq!(rev.doc_id, "doc1");
        assert_eq!(rev.rev_id, "2-def");
        assert!(!rev.deleted);
        assert_eq!(rev.generation(), 2);
    }

    #[test]
    fn revision_missing_id_rejected() {
        let mut properties = Map::new();
        properties.insert("_rev".into(), json!("1-a"));
        assert!(Revision::from_properties(properties).is_err());
    }

    proptest::proptest! {
        #[test]
        fn history_encoding_round_trips(
            digests in proptest::collection::vec("[0-9a-f]{8,32}", 1..8),
            extra_generations in 0u64..10,
        ) {
            let start = digests.len() as u64 + extra_generations;
            let history: Vec<String> = digests
                .iter()
                .enumerate()
                .map(|(i, digest)| format!("{}-{}", start - i as u64, digest))
                .collect();

            let mut properties = Map::new();
            properties.insert("_revisions".into(), encode_revision_history(&history));
            proptest::prop_assert_eq!(parse_revision_history(&properties), history);
        }
    }
}
