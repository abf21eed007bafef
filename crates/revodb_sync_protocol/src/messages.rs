//! `_revs_diff` and `_bulk_docs` message bodies.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Request body for `POST _revs_diff`: document ID → revision IDs to check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RevsDiffRequest {
    /// Revisions to check, grouped by document.
    #[serde(flatten)]
    pub docs: BTreeMap<String, Vec<String>>,
}

impl RevsDiffRequest {
    /// Creates an empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one revision to check.
    pub fn add(&mut self, doc_id: impl Into<String>, rev_id: impl Into<String>) {
        self.docs.entry(doc_id.into()).or_default().push(rev_id.into());
    }

    /// True if no revisions were added.
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

/// Per-document result of a `_revs_diff` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RevsDiffEntry {
    /// Revisions the remote does not have.
    #[serde(default)]
    pub missing: Vec<String>,
    /// Ancestors of the missing revisions the remote does have.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub possible_ancestors: Option<Vec<String>>,
}

/// Response body of `POST _revs_diff`. Documents with nothing missing are
/// simply absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RevsDiffResponse {
    /// Missing-revision info, keyed by document ID.
    #[serde(flatten)]
    pub docs: BTreeMap<String, RevsDiffEntry>,
}

impl RevsDiffResponse {
    /// The entry for a document, if the remote reported anything missing.
    pub fn entry(&self, doc_id: &str) -> Option<&RevsDiffEntry> {
        self.docs.get(doc_id)
    }

    /// Whether the remote reported this exact revision as missing.
    pub fn is_missing(&self, doc_id: &str, rev_id: &str) -> bool {
        self.entry(doc_id)
            .map(|entry| entry.missing.iter().any(|r| r == rev_id))
            .unwrap_or(false)
    }

    /// True if the remote already has every revision that was asked about.
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

/// Request body for `POST _bulk_docs`.
///
/// `new_edits: false` tells the remote to graft the given revision IDs into
/// its revision trees instead of assigning new ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkDocsRequest {
    /// Full document bodies, `_revisions` ancestry included.
    pub docs: Vec<Value>,
    /// Must be false for replication.
    pub new_edits: bool,
}

impl BulkDocsRequest {
    /// Builds a replication-style request (`new_edits: false`).
    pub fn new(docs: Vec<Value>) -> Self {
        Self {
            docs,
            new_edits: false,
        }
    }
}

/// One element of the `_bulk_docs` response array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkDocsResponseItem {
    /// Document ID the element refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Revision ID on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    /// Error name on failure (e.g. `"forbidden"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Human-readable failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Explicit status code, if the remote supplies one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl BulkDocsResponseItem {
    /// Maps this element to an HTTP-style status code.
    pub fn status(&self) -> u16 {
        match self.error.as_deref() {
            None => 201,
            Some("forbidden") => 403,
            Some("unauthorized") => 401,
            Some(_) => self.status.unwrap_or(500),
        }
    }

    /// True if the element reports a failure.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// True if the failure is a validation rejection, which the pusher
    /// treats as expected rather than a replication error.
    pub fn is_forbidden(&self) -> bool {
        self.status() == 403
    }
}
