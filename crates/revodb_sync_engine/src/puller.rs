//! Pull replication: change feed → bounded fetch → transactional insert.

use crate::batcher::Batcher;
use crate::change_tracker::{ChangeFeedMode, ChangeTracker, ChangeTrackerClient};
use crate::config::ReplicatorConfig;
use crate::error::{ReplicationError, ReplicationResult, StorageError};
use crate::multipart::MultipartDocumentReader;
use crate::sequence_map::SequenceMap;
use crate::session::{Session, SessionState, INBOX_CAPACITY, INBOX_DELAY};
use crate::storage::ReplicationStorage;
use crate::transport::{HttpMethod, HttpTransport};
use parking_lot::Mutex;
use revodb_sync_protocol::{is_valid_document_id, ChangeEntry, Revision};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use url::Url;

/// Cap on simultaneous revision-fetch requests.
const MAX_OPEN_HTTP_CONNECTIONS: usize = 16;
/// Fetch backlog above which the change feed thread is made to wait.
const MAX_PENDING_FETCHES: usize = 1000;
/// Insert batcher sizing.
const INSERT_BATCH_CAPACITY: usize = 200;
const INSERT_BATCH_DELAY: Duration = Duration::from_millis(1000);

/// A revision received from the change feed during a pull. Tracks the opaque
/// remote sequence token and the local sequence used for checkpointing.
#[derive(Debug, Clone)]
struct PulledRevision {
    rev: Revision,
    remote_sequence: String,
    local_sequence: u64,
}

/// RAII permit for one of the bounded fetch connections; releasing cannot be
/// forgotten on any exit path.
struct ConnectionGuard {
    count: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    fn acquire(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self {
            count: Arc::clone(count),
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Pull-side replication session.
///
/// Follows the remote change feed, asks local storage which reported
/// revisions are missing, fetches them over at most 16 concurrent
/// connections, and inserts them transactionally in batches. The persisted
/// checkpoint only advances over contiguously completed work.
pub struct Puller {
    inner: Arc<PullerInner>,
}

struct PullerInner {
    session: Session,
    inbox: Mutex<Option<Arc<Batcher<PulledRevision>>>>,
    downloads_to_insert: Mutex<Option<Arc<Batcher<PulledRevision>>>>,
    revs_to_pull: Mutex<VecDeque<PulledRevision>>,
    pending_sequences: Mutex<SequenceMap>,
    http_connection_count: Arc<AtomicUsize>,
    /// Batches currently being processed; used to detect a drained pipeline.
    active_jobs: AtomicUsize,
    change_tracker: Mutex<Option<ChangeTracker>>,
}

/// Bridges tracker callbacks to the puller without keeping it alive.
struct TrackerClient(Weak<PullerInner>);

impl ChangeTrackerClient for TrackerClient {
    fn change_tracker_received_change(&self, change: ChangeEntry) {
        if let Some(puller) = self.0.upgrade() {
            puller.change_tracker_received_change(change);
        }
    }

    fn change_tracker_stopped(&self) {
        if let Some(puller) = self.0.upgrade() {
            puller.change_tracker_stopped();
        }
    }
}

impl Puller {
    /// Creates a puller for the given remote database.
    pub fn new(
        remote: Url,
        storage: Arc<dyn ReplicationStorage>,
        transport: Arc<dyn HttpTransport>,
        config: ReplicatorConfig,
    ) -> ReplicationResult<Self> {
        let session = Session::new(remote, storage, transport, config, "pull")?;
        Ok(Self {
            inner: Arc::new(PullerInner {
                session,
                inbox: Mutex::new(None),
                downloads_to_insert: Mutex::new(None),
                revs_to_pull: Mutex::new(VecDeque::new()),
                pending_sequences: Mutex::new(SequenceMap::new()),
                http_connection_count: Arc::new(AtomicUsize::new(0)),
                active_jobs: AtomicUsize::new(0),
                change_tracker: Mutex::new(None),
            }),
        })
    }

    /// Starts replicating. One-shot sessions stop by themselves once caught
    /// up; continuous sessions run until [`stop`](Self::stop).
    pub fn start(&self) -> ReplicationResult<()> {
        if !self
            .inner
            .session
            .state
            .transition(SessionState::Idle, SessionState::Running)
        {
            return Err(ReplicationError::Configuration(
                "puller already started".into(),
            ));
        }
        let outcome = self.inner.begin_replicating();
        if outcome.is_err() {
            self.inner.session.signal_stopped();
        }
        outcome
    }

    /// Stops the session: stops the tracker, drains batched work, persists
    /// the checkpoint, and signals stopped exactly once. Idempotent.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.session.state.get()
    }

    /// Last checkpointed remote sequence.
    pub fn last_sequence(&self) -> Option<String> {
        self.inner.session.last_sequence()
    }

    /// Message of the most recent error, if any.
    pub fn last_error_message(&self) -> Option<String> {
        self.inner.session.last_error_message()
    }

    /// Number of changes reported by the feed so far.
    pub fn changes_count(&self) -> u64 {
        self.inner.session.changes_count.load(Ordering::SeqCst)
    }

    /// Number of changes fully processed so far.
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

impl PullerInner {
    fn begin_replicating(self: &Arc<Self>) -> ReplicationResult<()> {
        // Prime the sequence map so its checkpointed value reflects the last
        // known sequence.
        {
            let mut map = self.pending_sequences.lock();
            *map = SequenceMap::new();
            if let Some(last) = self.session.last_sequence() {
                let seq = map.add_value(last);
                map.remove_sequence(seq);
            }
        }

        let weak = Arc::downgrade(self);
        let downloads = Arc::new(Batcher::new(
            INSERT_BATCH_CAPACITY,
            INSERT_BATCH_DELAY,
            Box::new(move |batch| {
                if let Some(puller) = weak.upgrade() {
                    puller.insert_downloads(batch);
                }
            }),
        ));
        *self.downloads_to_insert.lock() = Some(downloads);

        let weak = Arc::downgrade(self);
        let inbox = Arc::new(Batcher::new(
            INBOX_CAPACITY,
            INBOX_DELAY,
            Box::new(move |batch| {
                if let Some(puller) = weak.upgrade() {
                    puller.process_inbox(batch);
                }
            }),
        ));
        *self.inbox.lock() = Some(inbox);

        let mode = if self.session.config.continuous {
            ChangeFeedMode::LongPoll
        } else {
            ChangeFeedMode::OneShot
        };
        info!(
            since = self.session.last_sequence().as_deref().unwrap_or(""),
            "starting change tracker"
        );
        let tracker = ChangeTracker::new(
            self.session.remote.clone(),
            mode,
            true,
            self.session.last_sequence(),
            Arc::clone(&self.session.transport),
            Arc::new(TrackerClient(Arc::downgrade(self))),
        );
        if let Some(name) = &self.session.config.filter_name {
            tracker.set_filter(name.clone(), self.session.config.filter_params.clone());
        }
        if !self.session.config.doc_ids.is_empty() {
            tracker.set_doc_ids(self.session.config.doc_ids.clone());
        }
        tracker.set_request_headers(self.session.default_headers());
        tracker.start()?;
        *self.change_tracker.lock() = Some(tracker);
        Ok(())
    }

    /// A `_changes` entry arrived; turn each listed leaf revision into a
    /// pulled revision and queue it. Runs on the tracker thread.
    fn change_tracker_received_change(self: &Arc<Self>, change: ChangeEntry) {
        let Some(remote_sequence) = change.sequence_token() else {
            return;
        };
        let Some(doc_id) = change.id.clone() else {
            return;
        };
        if !is_valid_document_id(&doc_id) {
            warn!(doc = %doc_id, "received invalid doc ID from _changes");
            return;
        }
        for item in &change.changes {
            let pulled = PulledRevision {
                rev: Revision::new(doc_id.clone(), item.rev.clone(), change.deleted),
                remote_sequence: remote_sequence.clone(),
                local_sequence: 0,
            };
            debug!(doc = %doc_id, rev = %item.rev, seq = %remote_sequence, "adding rev to inbox");
            self.session.changes_count.fetch_add(1, Ordering::SeqCst);
            let inbox = self.inbox.lock().clone();
            if let Some(inbox) = inbox {
                inbox.queue_object(pulled);
            }
        }

        // Backpressure: block the feed thread while the fetch backlog is
        // past its limit, instead of growing it without bound.
        while self.revs_to_pull.lock().len() > MAX_PENDING_FETCHES {
            if self.session.state.get() != SessionState::Running {
                break;
            }
            thread::sleep(Duration::from_millis(500));
        }
    }

    fn change_tracker_stopped(self: &Arc<Self>) {
        debug!("change tracker stopped");
        if let Some(tracker) = self.change_tracker.lock().as_ref() {
            if let Some(error) = tracker.take_last_error() {
                self.session.set_error(error);
            }
        }
        let inbox = self.inbox.lock().clone();
        if let Some(inbox) = inbox {
            inbox.flush_all();
        }
        if !self.session.config.continuous {
            // One-shot: once the pipeline drains, the session is done.
            self.finish_after_drain();
        }
    }

    /// Processes a batch of feed entries: figure out which revisions are
    /// actually missing and queue those for fetch.
    fn process_inbox(self: &Arc<Self>, inbox_batch: Vec<PulledRevision>) {
        let Some(last_inbox_sequence) = inbox_batch.last().map(|r| r.remote_sequence.clone())
        else {
            return;
        };
        self.active_jobs.fetch_add(1, Ordering::SeqCst);
        let result = self.process_inbox_guarded(inbox_batch, last_inbox_sequence);
        self.active_jobs.fetch_sub(1, Ordering::SeqCst);
        if let Err(error) = result {
            self.session.set_error(error);
        }
    }

    fn process_inbox_guarded(
        self: &Arc<Self>,
        inbox_batch: Vec<PulledRevision>,
        last_inbox_sequence: String,
    ) -> ReplicationResult<()> {
        // Ask storage which of the incoming revisions it doesn't know.
        let mut candidates: Vec<Revision> =
            inbox_batch.iter().map(|pulled| pulled.rev.clone()).collect();
        let removed = self
            .session
            .storage
            .find_missing_revisions(&mut candidates)
            .map_err(|e| {
                warn!(error = %e, "failed to look up local revs");
                ReplicationError::from(e)
            })?;
        if removed > 0 {
            // Known revisions no longer count toward progress.
            self.session
                .changes_count
                .fetch_sub(removed as u64, Ordering::SeqCst);
        }

        if candidates.is_empty() {
            // Nothing to fetch. Just bump the last sequence.
            debug!("no new remote revisions to fetch");
            let checkpoint = {
                let mut map = self.pending_sequences.lock();
                let seq = map.add_value(last_inbox_sequence);
                map.remove_sequence(seq);
                map.checkpointed_value()
            };
            if let Some(value) = checkpoint {
                self.session.set_last_sequence(&value);
            }
            return Ok(());
        }

        debug!(count = candidates.len(), "fetching remote revisions");
        let missing: HashSet<(String, String)> = candidates
            .into_iter()
            .map(|rev| (rev.doc_id, rev.rev_id))
            .collect();
        {
            let mut queue = self.revs_to_pull.lock();
            let mut map = self.pending_sequences.lock();
            for mut pulled in inbox_batch {
                let key = (pulled.rev.doc_id.clone(), pulled.rev.rev_id.clone());
                if !missing.contains(&key) {
                    continue;
                }
                pulled.local_sequence = map.add_value(pulled.remote_sequence.clone());
                queue.push_back(pulled);
            }
        }
        self.pull_remote_revisions();
        Ok(())
    }

    /// Starts fetches up to the connection limit. Only the queue handoff is
    /// done under the lock; network work happens on worker threads.
    fn pull_remote_revisions(self: &Arc<Self>) {
        if self.session.state.get() != SessionState::Running {
            return;
        }
        let mut work = Vec::new();
        {
            let mut queue = self.revs_to_pull.lock();
            while self.http_connection_count.load(Ordering::SeqCst) < MAX_OPEN_HTTP_CONNECTIONS {
                let Some(rev) = queue.pop_front() else {
                    break;
                };
                // Take the connection slot while still under the lock.
                work.push((rev, ConnectionGuard::acquire(&self.http_connection_count)));
            }
        }
        for (rev, guard) in work {
            let puller = Arc::clone(self);
            let spawned = thread::Builder::new()
                .name("pull-fetch".into())
                .spawn(move || puller.pull_remote_revision(rev, guard));
            if spawned.is_err() {
                warn!("failed to spawn fetch worker");
            }
        }
    }

    /// Fetches the contents of one revision, including its history and any
    /// attachment bodies not already known locally.
    fn pull_remote_revision(self: Arc<Self>, pulled: PulledRevision, guard: ConnectionGuard) {
        debug!(doc = %pulled.rev.doc_id, rev = %pulled.rev.rev_id, "pulling remote revision");
        match self.fetch_revision(&pulled) {
            Ok(downloaded) => {
                let downloads = self.downloads_to_insert.lock().clone();
                if let Some(downloads) = downloads {
                    downloads.queue_object(downloaded);
                }
            }
            Err(error) => {
                warn!(
                    doc = %pulled.rev.doc_id,
                    rev = %pulled.rev.rev_id,
                    error = %error,
                    "error pulling remote revision"
                );
                self.session.set_error(error);
                self.session.revisions_failed.fetch_add(1, Ordering::SeqCst);
                // Keep the progress accounting moving so the session can
                // still finish; the unresolved local sequence holds the
                // checkpoint back, and a later cycle retries.
                self.session
                    .completed_changes_count
                    .fetch_add(1, Ordering::SeqCst);
            }
        }
        // Release the slot, then keep the pipeline full.
        drop(guard);
        self.pull_remote_revisions();
    }

    fn fetch_revision(&self, pulled: &PulledRevision) -> ReplicationResult<PulledRevision> {
        // Ask for the full revision history, and the bodies of attachments
        // added since the revisions we already have.
        let known = self
            .session
            .storage
            .known_current_rev_ids(&pulled.rev.doc_id)?;
        let mut path = format!(
            "/{}?rev={}&revs=true&attachments=true",
            urlencoding::encode(&pulled.rev.doc_id),
            urlencoding::encode(&pulled.rev.rev_id),
        );
        if !known.is_empty() {
            let rendered = serde_json::to_string(&known)?;
            path.push_str(&format!("&atts_since={}", urlencoding::encode(&rendered)));
        }
        let url = self.session.url_for(&path)?;

        let response = self.session.transport.execute(
            HttpMethod::Get,
            &url,
            &self.session.default_headers(),
            None,
        )?;
        if !response.is_success() {
            return Err(ReplicationError::HttpStatus {
                status: response.status,
                url: url.to_string(),
            });
        }

        let mut reader = MultipartDocumentReader::new(Arc::clone(&self.session.storage));
        reader.set_content_type(response.content_type.as_deref())?;
        reader.append_data(&response.body)?;
        let properties = reader.finish()?;
        let rev = Revision::from_properties(properties)?;

        Ok(PulledRevision {
            rev,
            remote_sequence: pulled.remote_sequence.clone(),
            local_sequence: pulled.local_sequence,
        })
    }

    /// Inserts a batch of fetched revisions in one storage transaction.
    fn insert_downloads(self: &Arc<Self>, mut downloads: Vec<PulledRevision>) {
        self.active_jobs.fetch_add(1, Ordering::SeqCst);
        info!(count = downloads.len(), "inserting revisions");
        let started = Instant::now();

        // Ascending local sequence approximates ancestor-first insertion.
        downloads.sort_by_key(|download| download.local_sequence);

        let storage = &self.session.storage;
        if let Err(error) = storage.begin_transaction() {
            self.session.set_error(error.into());
            self.active_jobs.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        for download in &downloads {
            let history = download.rev.history();
            if history.is_empty() && download.rev.generation() > 1 {
                warn!(
                    doc = %download.rev.doc_id,
                    rev = %download.rev.rev_id,
                    "missing revision history in response"
                );
                self.session.set_error(ReplicationError::Protocol(
                    "missing revision history in pulled revision".into(),
                ));
            } else {
                match storage.force_insert(&download.rev, &history, Some(&self.session.remote)) {
                    Ok(()) => {}
                    Err(StorageError::Forbidden) => {
                        info!(
                            doc = %download.rev.doc_id,
                            rev = %download.rev.rev_id,
                            "remote rev failed validation"
                        );
                    }
                    Err(error) => {
                        warn!(
                            doc = %download.rev.doc_id,
                            rev = %download.rev.rev_id,
                            error = %error,
                            "failed to write revision"
                        );
                        self.session.set_error(error.into());
                    }
                }
            }
            // Always resolve this revision's local sequence, whatever the
            // outcome, so the checkpoint can advance.
            self.pending_sequences
                .lock()
                .remove_sequence(download.local_sequence);
        }
        if let Err(error) = storage.end_transaction(true) {
            self.session.set_error(error.into());
        }

        let checkpoint = self.pending_sequences.lock().checkpointed_value();
        if let Some(value) = checkpoint {
            self.session.set_last_sequence(&value);
        }
        self.session
            .completed_changes_count
            .fetch_add(downloads.len() as u64, Ordering::SeqCst);
        debug!(
            count = downloads.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "finished inserting revisions"
        );
        self.active_jobs.fetch_sub(1, Ordering::SeqCst);
    }

    /// One-shot completion: waits for the fetch/insert pipeline to empty,
    /// then stops the session.
    fn finish_after_drain(self: &Arc<Self>) {
        let puller = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("pull-drain".into())
            .spawn(move || {
                // Require the pipeline to look empty twice in a row, so a
                // batch in the hand-off between queue and processor isn't
                // mistaken for a drained pipeline.
                let mut confirmations = 0;
                loop {
                    if puller.session.state.get() != SessionState::Running {
                        // An explicit stop() takes over from here.
                        return;
                    }
                    if puller.pipeline_is_empty() {
                        confirmations += 1;
                        if confirmations >= 2 {
                            break;
                        }
                    } else {
                        confirmations = 0;
                    }
                    thread::sleep(Duration::from_millis(50));
                }
                if puller
                    .session
                    .state
                    .transition(SessionState::Running, SessionState::Stopping)
                {
                    puller.finish_stopping();
                }
            });
        if spawned.is_err() {
            warn!("failed to spawn drain watcher");
        }
    }

    fn pipeline_is_empty(&self) -> bool {
        if self.active_jobs.load(Ordering::SeqCst) > 0 {
            return false;
        }
        if self.http_connection_count.load(Ordering::SeqCst) > 0 {
            return false;
        }
        if !self.revs_to_pull.lock().is_empty() {
            return false;
        }
        if self.inbox.lock().as_ref().is_some_and(|b| b.count() > 0) {
            return false;
        }
        if self
            .downloads_to_insert
            .lock()
            .as_ref()
            .is_some_and(|b| b.count() > 0)
        {
            return false;
        }
        true
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
        info!("stopping puller");

        // Detach from the tracker before stopping it, so its stopped
        // callback doesn't re-enter us.
        let tracker = self.change_tracker.lock().take();
        if let Some(tracker) = tracker {
            tracker.set_client(None);
            tracker.stop();
        }
        self.revs_to_pull.lock().clear();

        let inbox = self.inbox.lock().clone();
        if let Some(inbox) = inbox {
            inbox.flush_all();
        }
        self.finish_stopping();
    }

    /// Common tail of explicit stop and one-shot completion. Runs with the
    /// state already at Stopping.
    fn finish_stopping(self: &Arc<Self>) {
        self.session.transport.cancel_all();

        // Give in-flight fetches a moment to drain.
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.http_connection_count.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                warn!("fetch connections still open while stopping");
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        let downloads = self.downloads_to_insert.lock().clone();
        if let Some(downloads) = downloads {
            downloads.flush_all();
        }
        let checkpoint = self.pending_sequences.lock().checkpointed_value();
        if let Some(value) = checkpoint {
            self.session.set_last_sequence(&value);
        }
        info!(
            last_sequence = self.session.last_sequence().as_deref().unwrap_or(""),
            "puller stopped"
        );
        self.session.signal_stopped();
    }
}
