//! Local storage collaborator contract.
//!
//! The engine talks to the revision-tree store through the
//! [`ReplicationStorage`] trait and never reaches into storage internals.
//! [`MemoryStorage`] is an in-memory implementation for tests.

use crate::error::{StorageError, StorageResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use md5::{Digest as _, Md5};
use parking_lot::Mutex;
use revodb_sync_protocol::Revision;
use serde_json::{Map, Value};
use sha1::Sha1;
use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use url::Url;

/// A committed local revision, as reported by [`ReplicationStorage::changes_since`]
/// or a change notification.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRevision {
    /// Local commit sequence number.
    pub sequence: u64,
    /// Document ID.
    pub doc_id: String,
    /// Revision ID.
    pub rev_id: String,
    /// Whether the revision is a deletion.
    pub deleted: bool,
    /// URL of the peer this revision was originally pulled from, if any.
    pub source_url: Option<Url>,
}

/// An immutable batch of committed local changes.
#[derive(Debug, Clone)]
pub struct ChangeNotification {
    /// The changes, in commit order.
    pub changes: Vec<LocalRevision>,
}

/// Predicate applied to local revisions before push.
pub type ReplicationFilter =
    dyn Fn(&LocalRevision, Option<&Map<String, Value>>) -> bool + Send + Sync;

/// Accumulates attachment bytes and exposes their digests.
///
/// Writers are created by storage, filled by the multipart reader, and
/// handed back for durable registration keyed by MD5 digest.
#[derive(Debug, Clone, Default)]
pub struct AttachmentWriter {
    data: Vec<u8>,
}

impl AttachmentWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends body bytes.
    pub fn append_data(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The accumulated bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the writer, returning the accumulated bytes.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// The `md5-<base64>` digest of the written bytes.
    pub fn md5_digest(&self) -> String {
        format!("md5-{}", BASE64.encode(Md5::digest(&self.data)))
    }

    /// The `sha1-<base64>` digest of the written bytes.
    pub fn sha1_digest(&self) -> String {
        format!("sha1-{}", BASE64.encode(Sha1::digest(&self.data)))
    }
}

/// Contract the replication engine requires from the local database.
///
/// Mirrors what the revision-tree store already offers; implementations must
/// be thread-safe, since the engine calls in from several worker threads.
pub trait ReplicationStorage: Send + Sync {
    /// Removes from `revs` every (document, revision) pair that is already
    /// stored locally, returning how many were removed. What remains is
    /// exactly the set that needs to be fetched.
    fn find_missing_revisions(&self, revs: &mut Vec<Revision>) -> StorageResult<usize>;

    /// Inserts a revision with its ancestry into the revision tree.
    ///
    /// `source` records the peer the revision was pulled from, so a later
    /// push back to the same peer can be suppressed.
    fn force_insert(
        &self,
        rev: &Revision,
        history: &[String],
        source: Option<&Url>,
    ) -> StorageResult<()>;

    /// Committed local revisions with sequence greater than `since`, oldest
    /// first, with `filter` applied when given.
    fn changes_since(
        &self,
        since: u64,
        filter: Option<&ReplicationFilter>,
    ) -> StorageResult<Vec<LocalRevision>>;

    /// Loads the full body of a revision, attachment metadata included.
    fn load_revision_body(&self, doc_id: &str, rev_id: &str) -> StorageResult<Map<String, Value>>;

    /// Revision IDs of a revision's ancestry, newest first (self included).
    fn revision_history(&self, doc_id: &str, rev_id: &str) -> StorageResult<Vec<String>>;

    /// Currently known leaf revision IDs of a document.
    fn known_current_rev_ids(&self, doc_id: &str) -> StorageResult<Vec<String>>;

    /// Begins a storage transaction.
    fn begin_transaction(&self) -> StorageResult<()>;

    /// Ends the current transaction, committing when `commit` is true.
    fn end_transaction(&self, commit: bool) -> StorageResult<()>;

    /// Creates a new attachment writer backed by the blob store.
    fn attachment_writer(&self) -> AttachmentWriter;

    /// Durably registers finished attachment writers, keyed by MD5 digest,
    /// so a following insert can resolve them.
    fn remember_attachment_writers(
        &self,
        writers: HashMap<String, AttachmentWriter>,
    ) -> StorageResult<()>;

    /// Reads a blob's contents by its digest string.
    fn blob_contents(&self, digest: &str) -> StorageResult<Option<Vec<u8>>>;

    /// A named push filter registered on the database.
    fn replication_filter(&self, name: &str) -> Option<Arc<ReplicationFilter>>;

    /// Subscribes to committed-change notifications. Batches arrive on the
    /// returned channel; dropping the receiver ends the subscription.
    fn subscribe_changes(&self) -> Receiver<ChangeNotification>;

    /// Last persisted replication checkpoint for `key`.
    fn last_checkpoint(&self, key: &str) -> StorageResult<Option<String>>;

    /// Persists a replication checkpoint.
    fn set_last_checkpoint(&self, key: &str, value: &str) -> StorageResult<()>;
}

#[derive(Debug, Clone)]
struct StoredRevision {
    properties: Map<String, Value>,
    deleted: bool,
    history: Vec<String>,
    sequence: u64,
    source: Option<Url>,
}

#[derive(Default)]
struct MemoryStorageInner {
    revisions: HashMap<String, HashMap<String, StoredRevision>>,
    next_sequence: u64,
    blobs: HashMap<String, Vec<u8>>,
    checkpoints: HashMap<String, String>,
    filters: HashMap<String, Arc<ReplicationFilter>>,
    subscribers: Vec<Sender<ChangeNotification>>,
    remembered_digests: Vec<String>,
    transaction_depth: u32,
}

/// An in-memory storage collaborator for tests.
///
/// Transactions are tracked but not rolled back; the engine only relies on
/// commit/abort bookkeeping, not on isolation.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<MemoryStorageInner>,
}

impl MemoryStorage {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a revision directly, assigning it the next local sequence,
    /// and notifies change subscribers. Returns the assigned sequence.
    pub fn put_revision(
        &self,
        doc_id: &str,
        rev_id: &str,
        deleted: bool,
        properties: Map<String, Value>,
        history: Vec<String>,
    ) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_sequence += 1;
        let sequence = inner.next_sequence;
        inner.revisions.entry(doc_id.to_string()).or_default().insert(
            rev_id.to_string(),
            StoredRevision {
                properties,
                deleted,
                history,
                sequence,
                source: None,
            },
        );
        let notification = ChangeNotification {
            changes: vec![LocalRevision {
                sequence,
                doc_id: doc_id.to_string(),
                rev_id: rev_id.to_string(),
                deleted,
                source_url: None,
            }],
        };
        inner.subscribers.retain(|s| s.send(notification.clone()).is_ok());
        sequence
    }

    /// Stores a blob, returning its `md5-<base64>` digest string.
    pub fn add_blob(&self, data: &[u8]) -> String {
        let mut writer = AttachmentWriter::new();
        writer.append_data(data);
        let digest = writer.md5_digest();
        self.inner.lock().blobs.insert(digest.clone(), data.to_vec());
        digest
    }

    /// Registers a named push filter.
    pub fn register_filter(&self, name: &str, filter: Arc<ReplicationFilter>) {
        self.inner.lock().filters.insert(name.to_string(), filter);
    }

    /// True if the revision is stored.
    pub fn contains_revision(&self, doc_id: &str, rev_id: &str) -> bool {
        self.inner
            .lock()
            .revisions
            .get(doc_id)
            .is_some_and(|revs| revs.contains_key(rev_id))
    }

    /// Properties of a stored revision.
    pub fn revision_properties(&self, doc_id: &str, rev_id: &str) -> Option<Map<String, Value>> {
        self.inner
            .lock()
            .revisions
            .get(doc_id)?
            .get(rev_id)
            .map(|rev| rev.properties.clone())
    }

    /// Source URL recorded for a stored revision.
    pub fn revision_source(&self, doc_id: &str, rev_id: &str) -> Option<Url> {
        self.inner
            .lock()
            .revisions
            .get(doc_id)?
            .get(rev_id)
            .and_then(|rev| rev.source.clone())
    }

    /// A stored blob's bytes.
    pub fn blob(&self, digest: &str) -> Option<Vec<u8>> {
        self.inner.lock().blobs.get(digest).cloned()
    }

    /// Digests handed over via `remember_attachment_writers`, in order.
    pub fn remembered_digests(&self) -> Vec<String> {
        self.inner.lock().remembered_digests.clone()
    }
}

impl ReplicationStorage for MemoryStorage {
    fn find_missing_revisions(&self, revs: &mut Vec<Revision>) -> StorageResult<usize> {
        let inner = self.inner.lock();
        let before = revs.len();
        revs.retain(|rev| {
            !inner
                .revisions
                .get(&rev.doc_id)
                .is_some_and(|known| known.contains_key(&rev.rev_id))
        });
        Ok(before - revs.len())
    }

    fn force_insert(
        &self,
        rev: &Revision,
        history: &[String],
        source: Option<&Url>,
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        inner.next_sequence += 1;
        let sequence = inner.next_sequence;
        let history = if history.is_empty() {
            vec![rev.rev_id.clone()]
        } else {
            history.to_vec()
        };
        inner.revisions.entry(rev.doc_id.clone()).or_default().insert(
            rev.rev_id.clone(),
            StoredRevision {
                properties: rev.properties.clone().unwrap_or_default(),
                deleted: rev.deleted,
                history,
                sequence,
                source: source.cloned(),
            },
        );
        Ok(())
    }

    fn changes_since(
        &self,
        since: u64,
        filter: Option<&ReplicationFilter>,
    ) -> StorageResult<Vec<LocalRevision>> {
        let inner = self.inner.lock();
        let mut changes: Vec<LocalRevision> = inner
            .revisions
            .iter()
            .flat_map(|(doc_id, revs)| {
                revs.iter().map(move |(rev_id, stored)| LocalRevision {
                    sequence: stored.sequence,
                    doc_id: doc_id.clone(),
                    rev_id: rev_id.clone(),
                    deleted: stored.deleted,
                    source_url: stored.source.clone(),
                })
            })
            .filter(|change| change.sequence > since)
            .collect();
        changes.sort_by_key(|change| change.sequence);
        if let Some(filter) = filter {
            changes.retain(|change| filter(change, None));
        }
        Ok(changes)
    }

    fn load_revision_body(&self, doc_id: &str, rev_id: &str) -> StorageResult<Map<String, Value>> {
        let inner = self.inner.lock();
        let stored = inner
            .revisions
            .get(doc_id)
            .and_then(|revs| revs.get(rev_id))
            .ok_or(StorageError::NotFound)?;
        let mut properties = stored.properties.clone();
        properties.insert("_id".into(), Value::String(doc_id.to_string()));
        properties.insert("_rev".into(), Value::String(rev_id.to_string()));
        if stored.deleted {
            properties.insert("_deleted".into(), Value::Bool(true));
        }
        Ok(properties)
    }

    fn revision_history(&self, doc_id: &str, rev_id: &str) -> StorageResult<Vec<String>> {
        let inner = self.inner.lock();
        inner
            .revisions
            .get(doc_id)
            .and_then(|revs| revs.get(rev_id))
            .map(|stored| stored.history.clone())
            .ok_or(StorageError::NotFound)
    }

    fn known_current_rev_ids(&self, doc_id: &str) -> StorageResult<Vec<String>> {
        let inner = self.inner.lock();
        Ok(inner
            .revisions
            .get(doc_id)
            .map(|revs| revs.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn begin_transaction(&self) -> StorageResult<()> {
        self.inner.lock().transaction_depth += 1;
        Ok(())
    }

    fn end_transaction(&self, _commit: bool) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if inner.transaction_depth == 0 {
            return Err(StorageError::internal("end_transaction without begin"));
        }
        inner.transaction_depth -= 1;
        Ok(())
    }

    fn attachment_writer(&self) -> AttachmentWriter {
        AttachmentWriter::new()
    }

    fn remember_attachment_writers(
        &self,
        writers: HashMap<String, AttachmentWriter>,
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        for (digest, writer) in writers {
            inner.remembered_digests.push(digest.clone());
            inner.blobs.insert(digest, writer.into_data());
        }
        Ok(())
    }

    fn blob_contents(&self, digest: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.inner.lock().blobs.get(digest).cloned())
    }

    fn replication_filter(&self, name: &str) -> Option<Arc<ReplicationFilter>> {
        self.inner.lock().filters.get(name).cloned()
    }

    fn subscribe_changes(&self) -> Receiver<ChangeNotification> {
        let (sender, receiver) = channel();
        self.inner.lock().subscribers.push(sender);
        receiver
    }

    fn last_checkpoint(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.inner.lock().checkpoints.get(key).cloned())
    }

    fn set_last_checkpoint(&self, key: &str, value: &str) -> StorageResult<()> {
        self.inner
            .lock()
            .checkpoints
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn attachment_writer_digests() {
        let writer = AttachmentWriter::new();
        // Well-known digests of the empty input.
        assert_eq!(writer.md5_digest(), "md5-1B2M2Y8AsgTpgAmY7PhCfg==");
        assert_eq!(writer.sha1_digest(), "sha1-2jmj7l5rSw0yVb/vlWAYkK/YBwk=");

        let mut a = AttachmentWriter::new();
        a.append_data(b"hello ");
        a.append_data(b"world");
        let mut b = AttachmentWriter::new();
        b.append_data(b"hello world");
        assert_eq!(a.md5_digest(), b.md5_digest());
        assert_eq!(a.sha1_digest(), b.sha1_digest());
        assert_eq!(a.len(), 11);

        let mut c = AttachmentWriter::new();
        c.append_data(b"other bytes");
        assert_ne!(a.md5_digest(), c.md5_digest());
    }

    #[test]
    fn find_missing_removes_known() {
        let storage = MemoryStorage::new();
        storage.put_revision("doc1", "1-a", false, Map::new(), vec!["1-a".into()]);

        let mut revs = vec![
            Revision::new("doc1", "1-a", false),
            Revision::new("doc1", "2-b", false),
            Revision::new("doc2", "1-c", false),
        ];
        let removed = storage.find_missing_revisions(&mut revs).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(revs.len(), 2);
        assert!(revs.iter().all(|r| !(r.doc_id == "doc1" && r.rev_id == "1-a")));
    }

    #[test]
    fn changes_since_orders_and_filters() {
        let storage = MemoryStorage::new();
        storage.put_revision("a", "1-a", false, Map::new(), vec![]);
        storage.put_revision("b", "1-b", false, Map::new(), vec![]);
        storage.put_revision("c", "1-c", true, Map::new(), vec![]);

        let all = storage.changes_since(0, None).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].sequence < w[1].sequence));

        let later = storage.changes_since(1, None).unwrap();
        assert_eq!(later.len(), 2);

        let not_deleted: Arc<ReplicationFilter> =
            Arc::new(|change: &LocalRevision, _params| !change.deleted);
        let filtered = storage.changes_since(0, Some(&*not_deleted)).unwrap();
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn force_insert_and_load_body() {
        let storage = MemoryStorage::new();
        let mut properties = Map::new();
        properties.insert("value".into(), json!(9));
        let mut rev = Revision::new("doc1", "2-b", false);
        rev.properties = Some(properties);

        let source = Url::parse("http://peer.example.com/db").unwrap();
        storage
            .force_insert(&rev, &["2-b".into(), "1-a".into()], Some(&source))
            .unwrap();

        assert!(storage.contains_revision("doc1", "2-b"));
        assert_eq!(storage.revision_source("doc1", "2-b"), Some(source));
        assert_eq!(
            storage.revision_history("doc1", "2-b").unwrap(),
            vec!["2-b".to_string(), "1-a".to_string()]
        );

        let body = storage.load_revision_body("doc1", "2-b").unwrap();
        assert_eq!(body["_id"], json!("doc1"));
        assert_eq!(body["_rev"], json!("2-b"));
        assert_eq!(body["value"], json!(9));
    }

    #[test]
    fn remembered_writers_become_blobs() {
        let storage = MemoryStorage::new();
        let mut writer = storage.attachment_writer();
        writer.append_data(b"attachment body");
        let digest = writer.md5_digest();

        let mut writers = HashMap::new();
        writers.insert(digest.clone(), writer);
        storage.remember_attachment_writers(writers).unwrap();

        assert_eq!(storage.remembered_digests(), vec![digest.clone()]);
        assert_eq!(
            storage.blob_contents(&digest).unwrap().as_deref(),
            Some(b"attachment body".as_slice())
        );
    }

    #[test]
    fn change_subscription_delivers_batches() {
        let storage = MemoryStorage::new();
        let receiver = storage.subscribe_changes();
        storage.put_revision("doc1", "1-a", false, Map::new(), vec![]);

        let notification = receiver.recv().unwrap();
        assert_eq!(notification.changes.len(), 1);
        assert_eq!(notification.changes[0].doc_id, "doc1");

        // Dropping the receiver ends the subscription without errors.
        drop(receiver);
        storage.put_revision("doc2", "1-b", false, Map::new(), vec![]);
    }

    #[test]
    fn checkpoints_round_trip() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.last_checkpoint("pull:db").unwrap(), None);
        storage.set_last_checkpoint("pull:db", "42").unwrap();
        assert_eq!(
            storage.last_checkpoint("pull:db").unwrap().as_deref(),
            Some("42")
        );
    }

    #[test]
    fn transaction_bookkeeping() {
        let storage = MemoryStorage::new();
        storage.begin_transaction().unwrap();
        storage.end_transaction(true).unwrap();
        assert!(storage.end_transaction(false).is_err());
    }
}
