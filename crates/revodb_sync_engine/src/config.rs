//! Replication session configuration.

use serde_json::{Map, Value};

/// Configuration for a replication session.
#[derive(Debug, Clone, Default)]
pub struct ReplicatorConfig {
    /// Keep the session alive and follow changes as they happen, instead of
    /// catching up once and stopping.
    pub continuous: bool,
    /// (Push only) create the remote database before replicating.
    pub create_target: bool,
    /// Named filter to apply to the change feed / local changes.
    pub filter_name: Option<String>,
    /// Parameters passed to the filter.
    pub filter_params: Map<String, Value>,
    /// Restrict replication to these document IDs.
    pub doc_ids: Vec<String>,
    /// Extra headers added to every request.
    pub request_headers: Vec<(String, String)>,
}

impl ReplicatorConfig {
    /// Creates a default (one-shot, unfiltered) configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets continuous mode.
    pub fn with_continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    /// Sets whether the pusher should create the remote database.
    pub fn with_create_target(mut self, create_target: bool) -> Self {
        self.create_target = create_target;
        self
    }

    /// Sets the filter name.
    pub fn with_filter(mut self, name: impl Into<String>) -> Self {
        self.filter_name = Some(name.into());
        self
    }

    /// Sets the filter parameters.
    pub fn with_filter_params(mut self, params: Map<String, Value>) -> Self {
        self.filter_params = params;
        self
    }

    /// Restricts replication to the given document IDs.
    pub fn with_doc_ids(mut self, doc_ids: Vec<String>) -> Self {
        self.doc_ids = doc_ids;
        self
    }

    /// Adds a request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_headers.push((name.into(), value.into()));
        self
    }
}
