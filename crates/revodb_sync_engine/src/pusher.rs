//! Push replication: local changes → remote diff → selective upload.

use crate::batcher::Batcher;
use crate::config::ReplicatorConfig;
use crate::error::{ReplicationError, ReplicationResult};
use crate::multipart::MultipartWriter;
use crate::session::{Session, SessionState, INBOX_CAPACITY, INBOX_DELAY};
use crate::storage::{LocalRevision, ReplicationFilter, ReplicationStorage};
use crate::transport::{HttpBody, HttpMethod, HttpTransport};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use revodb_sync_protocol::{
    encode_revision_history, Attachment, BulkDocsRequest, BulkDocsResponseItem, RevsDiffRequest,
    RevsDiffResponse,
};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

/// Local sequences awaiting remote acknowledgement. The checkpoint advances
/// only when the oldest pending sequence resolves.
#[derive(Debug, Default)]
struct PendingSequences {
    set: BTreeSet<u64>,
    max: u64,
}

impl PendingSequences {
    fn add(&mut self, sequence: u64) {
        self.set.insert(sequence);
        self.max = self.max.max(sequence);
    }

    /// Removes a sequence; returns the new checkpoint value when removing it
    /// uncovered a longer completed prefix.
    fn remove(&mut self, sequence: u64) -> Option<u64> {
        if self.set.is_empty() {
            warn!(sequence, "remove called with no pending sequences");
            return None;
        }
        let was_first = self.set.first() == Some(&sequence);
        if !self.set.remove(&sequence) {
            warn!(sequence, "sequence was not pending");
            return None;
        }
        if was_first {
            Some(self.set.first().map(|next| next - 1).unwrap_or(self.max))
        } else {
            None
        }
    }
}

/// Push-side replication session.
///
/// Computes local changes since the last checkpoint, asks the remote which
/// revisions it is missing via `_revs_diff`, and uploads those — batched
/// through `_bulk_docs`, or individually as `multipart/related` when a
/// revision carries attachment bodies.
pub struct Pusher {
    inner: Arc<PusherInner>,
}

struct PusherInner {
    session: Session,
    inbox: Mutex<Option<Arc<Batcher<LocalRevision>>>>,
    pending: Mutex<PendingSequences>,
    filter: Mutex<Option<Arc<ReplicationFilter>>>,
    /// Set once the remote rejects multipart (HTTP 415); later uploads fall
    /// back to inline JSON.
    dont_send_multipart: AtomicBool,
    active_jobs: AtomicUsize,
    observer: Mutex<Option<JoinHandle<()>>>,
}

impl Pusher {
    /// Creates a pusher for the given remote database.
    pub fn new(
        remote: Url,
        storage: Arc<dyn ReplicationStorage>,
        transport: Arc<dyn HttpTransport>,
        config: ReplicatorConfig,
    ) -> ReplicationResult<Self> {
        let session = Session::new(remote, storage, transport, config, "push")?;
        Ok(Self {
            inner: Arc::new(PusherInner {
                session,
                inbox: Mutex::new(None),
                pending: Mutex::new(PendingSequences::default()),
                filter: Mutex::new(None),
                dont_send_multipart: AtomicBool::new(false),
                active_jobs: AtomicUsize::new(0),
                observer: Mutex::new(None),
            }),
        })
    }

    /// Starts replicating, creating the remote database first if configured.
    pub fn start(&self) -> ReplicationResult<()> {
        if !self
            .inner
            .session
            .state
            .transition(SessionState::Idle, SessionState::Running)
        {
            return Err(ReplicationError::Configuration(
                "pusher already started".into(),
            ));
        }
        let outcome = if self.inner.session.config.create_target {
            self.inner.maybe_create_remote_db()
        } else {
            self.inner.begin_replicating()
        };
        if outcome.is_err() {
            self.inner.session.signal_stopped();
        }
        outcome
    }

    /// Stops the session: unsubscribes from local change notifications,
    /// drains batched work, and signals stopped exactly once. Idempotent.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.session.state.get()
    }

    /// Last checkpointed local sequence.
    pub fn last_sequence(&self) -> Option<String> {
        self.inner.session.last_sequence()
    }

    /// Message of the most recent error, if any.
    pub fn last_error_message(&self) -> Option<String> {
        self.inner.session.last_error_message()
    }

    /// Number of revisions selected for upload so far.
    pub fn changes_count(&self) -> u64 {
        self.inner.session.changes_count.load(Ordering::SeqCst)
    }

    /// Number of upload attempts completed so far.
    pub fn completed_changes_count(&self) -> u64 {
        self.inner
            .session
            .completed_changes_count
            .load(Ordering::SeqCst)
    }

    /// Number of revisions that failed permanently this session.
    pub fn failed_revisions_count(&self) -> u64 {
        self.inner.session.revisions_failed.load(Ordering::SeqCst)
    }

    /// Blocks until the session stops or the timeout elapses.
    pub fn wait_until_stopped(&self, timeout: Duration) -> bool {
        self.inner.session.wait_until_stopped(timeout)
    }
}

impl PusherInner {
    /// PUTs the remote database root. A 412 means it already exists, which
    /// is as good as created; any other failure is fatal for the session.
    fn maybe_create_remote_db(self: &Arc<Self>) -> ReplicationResult<()> {
        info!("remote db might not exist; creating it");
        let outcome = self.session.transport.execute(
            HttpMethod::Put,
            &self.session.remote,
            &self.session.default_headers(),
            None,
        );
        match outcome {
            Ok(response) if response.is_success() || response.status == 412 => {
                debug!("created remote db (or it already existed)");
                self.begin_replicating()
            }
            Ok(response) => {
                let error = ReplicationError::HttpStatus {
                    status: response.status,
                    url: self.session.remote.to_string(),
                };
                error!(status = response.status, "failed to create remote db");
                self.session.set_error(error);
                self.session.signal_stopped();
                Err(ReplicationError::HttpStatus {
                    status: response.status,
                    url: self.session.remote.to_string(),
                })
            }
            Err(error) => {
                error!(error = %error, "failed to create remote db");
                let message = error.to_string();
                self.session.set_error(error);
                self.session.signal_stopped();
                Err(ReplicationError::transport_fatal(message))
            }
        }
    }

    fn begin_replicating(self: &Arc<Self>) -> ReplicationResult<()> {
        let weak = Arc::downgrade(self);
        let inbox = Arc::new(Batcher::new(
            INBOX_CAPACITY,
            INBOX_DELAY,
            Box::new(move |batch| {
                if let Some(pusher) = weak.upgrade() {
                    pusher.process_inbox(batch);
                }
            }),
        ));
        *self.inbox.lock() = Some(Arc::clone(&inbox));

        // Resolve the named filter; a missing one is logged, not fatal.
        if let Some(name) = &self.session.config.filter_name {
            match self.session.storage.replication_filter(name) {
                Some(filter) => *self.filter.lock() = Some(filter),
                None => warn!(filter = %name, "no replication filter registered; ignoring"),
            }
        }

        let since = match self.session.last_sequence() {
            Some(value) => value.parse::<u64>().unwrap_or_else(|_| {
                warn!(value = %value, "could not parse last sequence; using 0");
                0
            }),
            None => 0,
        };
        self.pending.lock().max = since;

        // Process existing changes since the last push.
        let filter = self.filter.lock().clone();
        let changes = self
            .session
            .storage
            .changes_since(since, filter.as_deref())?;
        if !changes.is_empty() {
            inbox.queue_objects(changes);
            inbox.flush_all();
        }

        if self.session.config.continuous {
            // Now listen for future changes.
            self.start_observing();
        } else {
            self.finish_after_drain();
        }
        Ok(())
    }

    /// Consumes committed-change batches from storage on a dedicated thread
    /// until the session stops or the channel closes.
    fn start_observing(self: &Arc<Self>) {
        let receiver = self.session.storage.subscribe_changes();
        let pusher = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("push-observer".into())
            .spawn(move || loop {
                if pusher.session.state.get() != SessionState::Running {
                    return;
                }
                match receiver.recv_timeout(Duration::from_millis(250)) {
                    Ok(notification) => pusher.local_changes(notification.changes),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            })
            .ok();
        *self.observer.lock() = handle;
    }

    /// Filters a batch of local changes and queues survivors for push.
    fn local_changes(&self, changes: Vec<LocalRevision>) {
        let filter = self.filter.lock().clone();
        let params = &self.session.config.filter_params;
        for change in changes {
            // Skip revisions that originally came from the db I'm syncing to.
            if change
                .source_url
                .as_ref()
                .is_some_and(|source| *source == self.session.remote)
            {
                debug!(doc = %change.doc_id, "not pushing rev back to its source");
                continue;
            }
            if let Some(filter) = &filter {
                if !filter(&change, Some(params)) {
                    continue;
                }
            }
            let inbox = self.inbox.lock().clone();
            if let Some(inbox) = inbox {
                inbox.queue_object(change);
            }
        }
    }

    /// Diffs a batch of local revisions against the remote and uploads the
    /// ones it is missing.
    fn process_inbox(self: &Arc<Self>, changes: Vec<LocalRevision>) {
        if changes.is_empty() {
            return;
        }
        self.active_jobs.fetch_add(1, Ordering::SeqCst);
        if let Err(error) = self.process_inbox_guarded(&changes) {
            self.session.set_error(error);
        }
        self.active_jobs.fetch_sub(1, Ordering::SeqCst);
    }

    fn process_inbox_guarded(self: &Arc<Self>, changes: &[LocalRevision]) -> ReplicationResult<()> {
        // Generate a set of doc/rev IDs in the form _revs_diff wants.
        let mut diffs = RevsDiffRequest::new();
        {
            let mut pending = self.pending.lock();
            for change in changes {
                diffs.add(&change.doc_id, &change.rev_id);
                pending.add(change.sequence);
            }
        }

        debug!(docs = diffs.docs.len(), "posting to _revs_diff");
        let url = self.session.url_for("/_revs_diff")?;
        let response = self.session.transport.execute(
            HttpMethod::Post,
            &url,
            &self.session.default_headers(),
            Some(HttpBody::Json(serde_json::to_value(&diffs)?)),
        )?;
        if !response.is_success() {
            return Err(ReplicationError::HttpStatus {
                status: response.status,
                url: url.to_string(),
            });
        }
        let results: RevsDiffResponse = serde_json::from_slice(&response.body)
            .map_err(|e| ReplicationError::Protocol(format!("invalid _revs_diff response: {e}")))?;

        if results.is_empty() {
            // The remote already has everything; just advance the
            // checkpoint.
            for change in changes {
                self.remove_pending(change);
            }
            return Ok(());
        }

        let mut docs_to_send: Vec<Value> = Vec::new();
        let mut revs_to_send: Vec<LocalRevision> = Vec::new();
        for change in changes {
            if !results.is_missing(&change.doc_id, &change.rev_id) {
                self.remove_pending(change);
                continue;
            }

            // Get the revision's properties, attachments included.
            let mut properties = match self
                .session
                .storage
                .load_revision_body(&change.doc_id, &change.rev_id)
            {
                Ok(properties) => properties,
                Err(error) => {
                    warn!(
                        doc = %change.doc_id,
                        rev = %change.rev_id,
                        error = %error,
                        "couldn't get local contents of revision"
                    );
                    self.revision_failed();
                    continue;
                }
            };

            // Add the ancestry the remote needs to graft this revision.
            match self
                .session
                .storage
                .revision_history(&change.doc_id, &change.rev_id)
            {
                Ok(history) if !history.is_empty() => {
                    properties.insert("_revisions".into(), encode_revision_history(&history));
                }
                _ => {}
            }

            if has_follows_attachments(&properties)
                && !self.dont_send_multipart.load(Ordering::SeqCst)
            {
                self.upload_multipart_revision(change, properties);
                continue;
            }

            docs_to_send.push(Value::Object(properties));
            revs_to_send.push(change.clone());
        }

        self.upload_bulk_docs(docs_to_send, revs_to_send);
        Ok(())
    }

    /// POSTs plain revisions to `_bulk_docs` with `new_edits: false`.
    fn upload_bulk_docs(&self, docs: Vec<Value>, revs: Vec<LocalRevision>) {
        if docs.is_empty() {
            return;
        }
        let count = docs.len() as u64;
        debug!(count, "POSTing revisions to _bulk_docs");
        self.session.changes_count.fetch_add(count, Ordering::SeqCst);

        let outcome = self.session.url_for("/_bulk_docs").and_then(|url| {
            self.session.transport.execute(
                HttpMethod::Post,
                &url,
                &self.session.default_headers(),
                Some(HttpBody::Json(
                    serde_json::to_value(BulkDocsRequest::new(docs))
                        .unwrap_or_else(|_| Value::Null),
                )),
            )
        });

        match outcome {
            Ok(response) if response.is_success() => {
                let items: Vec<BulkDocsResponseItem> =
                    serde_json::from_slice(&response.body).unwrap_or_default();
                let mut failed_ids: HashSet<String> = HashSet::new();
                for item in &items {
                    if item.is_error() {
                        warn!(
                            doc = item.id.as_deref().unwrap_or(""),
                            error = item.error.as_deref().unwrap_or(""),
                            "_bulk_docs reported an error"
                        );
                        // Forbidden means validation failed; the revision
                        // was delivered, so it doesn't count as a failure.
                        if !item.is_forbidden() {
                            if let Some(id) = &item.id {
                                failed_ids.insert(id.clone());
                            }
                        }
                    }
                }
                for rev in &revs {
                    if !failed_ids.contains(&rev.doc_id) {
                        self.remove_pending(rev);
                    }
                }
            }
            Ok(response) => {
                self.session.set_error(ReplicationError::HttpStatus {
                    status: response.status,
                    url: "_bulk_docs".into(),
                });
                self.revision_failed();
            }
            Err(error) => {
                self.session.set_error(error);
                self.revision_failed();
            }
        }
        self.session
            .completed_changes_count
            .fetch_add(count, Ordering::SeqCst);
    }

    /// Uploads one revision as `multipart/related`: the JSON body plus one
    /// part per `follows` attachment.
    fn upload_multipart_revision(&self, change: &LocalRevision, properties: Map<String, Value>) {
        let mut writer = MultipartWriter::new();
        if let Err(error) = writer.add_json_part(&Value::Object(properties.clone())) {
            self.session.set_error(error);
            self.revision_failed();
            return;
        }

        if let Some(Value::Object(attachments)) = properties.get("_attachments") {
            for (name, value) in attachments {
                let Some(meta) = Attachment::from_value(value) else {
                    continue;
                };
                if !meta.follows() {
                    continue;
                }
                let blob = meta
                    .digest
                    .as_deref()
                    .and_then(|digest| self.session.storage.blob_contents(digest).ok().flatten());
                let Some(blob) = blob else {
                    // A missing blob would produce a corrupt revision;
                    // abort the whole upload instead.
                    warn!(
                        attachment = %name,
                        digest = meta.digest.as_deref().unwrap_or(""),
                        "unable to find blob; skipping upload of multipart revision"
                    );
                    self.revision_failed();
                    return;
                };
                writer.add_attachment_part(name, meta.content_type.as_deref(), &blob);
            }
        }

        let path = format!("/{}?new_edits=false", urlencoding::encode(&change.doc_id));
        debug!(doc = %change.doc_id, rev = %change.rev_id, "uploading multipart revision");
        self.session.changes_count.fetch_add(1, Ordering::SeqCst);

        let content_type = writer.content_type();
        let body = writer.finish();
        let outcome = self.session.url_for(&path).and_then(|url| {
            self.session.transport.execute(
                HttpMethod::Put,
                &url,
                &self.session.default_headers(),
                Some(HttpBody::Bytes {
                    content_type,
                    data: body,
                }),
            )
        });

        match outcome {
            Ok(response) if response.is_success() => {
                debug!(doc = %change.doc_id, "uploaded multipart revision");
                self.remove_pending(change);
            }
            Ok(response) if response.status == 415 => {
                // Server doesn't like multipart; fall back to JSON for this
                // and all later revisions.
                self.dont_send_multipart.store(true, Ordering::SeqCst);
                self.upload_json_revision(change, properties);
            }
            Ok(response) => {
                self.session.set_error(ReplicationError::HttpStatus {
                    status: response.status,
                    url: path,
                });
                self.revision_failed();
            }
            Err(error) => {
                self.session.set_error(error);
                self.revision_failed();
            }
        }
        self.session
            .completed_changes_count
            .fetch_add(1, Ordering::SeqCst);
    }

    /// Fallback for servers that reject multipart: inline every `follows`
    /// attachment as base64 `data` and PUT the revision as plain JSON.
    fn upload_json_revision(&self, change: &LocalRevision, mut properties: Map<String, Value>) {
        if !self.inline_following_attachments(&mut properties) {
            self.session.set_error(ReplicationError::Multipart(
                "attachment blob missing while inlining".into(),
            ));
            self.revision_failed();
            return;
        }

        let path = format!("/{}?new_edits=false", urlencoding::encode(&change.doc_id));
        let outcome = self.session.url_for(&path).and_then(|url| {
            self.session.transport.execute(
                HttpMethod::Put,
                &url,
                &self.session.default_headers(),
                Some(HttpBody::Json(Value::Object(properties))),
            )
        });
        match outcome {
            Ok(response) if response.is_success() => {
                debug!(doc = %change.doc_id, "sent revision as JSON");
                self.remove_pending(change);
            }
            Ok(response) => {
                self.session.set_error(ReplicationError::HttpStatus {
                    status: response.status,
                    url: path,
                });
                self.revision_failed();
            }
            Err(error) => {
                self.session.set_error(error);
                self.revision_failed();
            }
        }
    }

    /// Replaces `follows` markers with inline base64 bodies. Returns false
    /// if any referenced blob is missing.
    fn inline_following_attachments(&self, properties: &mut Map<String, Value>) -> bool {
        let Some(Value::Object(attachments)) = properties.get_mut("_attachments") else {
            return true;
        };
        for (_name, value) in attachments.iter_mut() {
            let Some(meta) = Attachment::from_value(value) else {
                continue;
            };
            if !meta.follows() {
                continue;
            }
            let blob = meta
                .digest
                .as_deref()
                .and_then(|digest| self.session.storage.blob_contents(digest).ok().flatten());
            let Some(blob) = blob else {
                return false;
            };
            if let Value::Object(entry) = value {
                entry.remove("follows");
                entry.insert("data".into(), Value::String(BASE64.encode(blob)));
            }
        }
        true
    }

    fn remove_pending(&self, change: &LocalRevision) {
        let advanced = self.pending.lock().remove(change.sequence);
        if let Some(value) = advanced {
            self.session.set_last_sequence(&value.to_string());
        }
    }

    fn revision_failed(&self) {
        self.session.revisions_failed.fetch_add(1, Ordering::SeqCst);
    }

    /// One-shot completion: stop once the inbox has fully drained.
    fn finish_after_drain(self: &Arc<Self>) {
        let pusher = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("push-drain".into())
            .spawn(move || {
                let mut confirmations = 0;
                loop {
                    if pusher.session.state.get() != SessionState::Running {
                        return;
                    }
                    let busy = pusher.active_jobs.load(Ordering::SeqCst) > 0
                        || pusher.inbox.lock().as_ref().is_some_and(|b| b.count() > 0);
                    if busy {
                        confirmations = 0;
                    } else {
                        confirmations += 1;
                        if confirmations >= 2 {
                            break;
                        }
                    }
                    thread::sleep(Duration::from_millis(50));
                }
                if pusher
                    .session
                    .state
                    .transition(SessionState::Running, SessionState::Stopping)
                {
                    pusher.finish_stopping();
                }
            });
        if spawned.is_err() {
            warn!("failed to spawn drain watcher");
        }
    }

    fn stop(self: &Arc<Self>) {
        let from_idle = self
            .session
            .state
            .transition(SessionState::Idle, SessionState::Stopping);
        if !from_idle
            && !self
                .session
                .state
                .transition(SessionState::Running, SessionState::Stopping)
        {
            return;
        }
        info!("stopping pusher");

        // The observer thread notices the state change and exits.
        if let Some(handle) = self.observer.lock().take() {
            let _ = handle.join();
        }
        // Push out whatever is still batched, then cut off stragglers.
        let inbox = self.inbox.lock().clone();
        if let Some(inbox) = inbox {
            inbox.flush_all();
        }
        self.finish_stopping();
    }

    fn finish_stopping(self: &Arc<Self>) {
        self.session.transport.cancel_all();
        info!(
            last_sequence = self.session.last_sequence().as_deref().unwrap_or(""),
            "pusher stopped"
        );
        self.session.signal_stopped();
    }
}

/// True if any `_attachments` entry declares `follows`.
fn has_follows_attachments(properties: &Map<String, Value>) -> bool {
    match properties.get("_attachments") {
        Some(Value::Object(attachments)) => attachments.values().any(|value| {
            Attachment::from_value(value)
                .map(|meta| meta.follows())
                .unwrap_or(false)
        }),
        _ => false,
    }
}
