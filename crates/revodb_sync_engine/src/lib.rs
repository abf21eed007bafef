//! # revodb Sync Engine
//!
//! The replication engine of revodb: keeps a local revision-tree store and a
//! remote HTTP-accessible peer convergent over an unreliable network.
//!
//! This crate provides:
//! - [`ChangeTracker`] — long-poll/one-shot `_changes` feed worker with
//!   polynomial backoff
//! - [`Batcher`] — generic delay/size-based work batching
//! - [`SequenceMap`] — out-of-order sequence checkpointing
//! - [`MultipartDocumentReader`] / [`MultipartWriter`] — MIME bodies for
//!   documents with attachments, digest-verified
//! - [`Puller`] and [`Pusher`] — the replication control loops
//!
//! ## Architecture
//!
//! Pull: change feed → inbox → revision diff against local storage →
//! bounded-concurrency fetch → batched transactional insert → checkpoint.
//! Push: local change notifications → inbox → `_revs_diff` → `_bulk_docs`
//! or multipart upload → checkpoint.
//!
//! Storage and HTTP are collaborators behind the [`ReplicationStorage`] and
//! [`HttpTransport`] traits; the engine performs no I/O of its own.
//!
//! ## Key invariants
//!
//! - The persisted checkpoint never advances past work that has not been
//!   durably applied, even though fetches complete out of order.
//! - Network I/O is never performed while holding an engine lock.
//! - `stop()` is idempotent and signals "stopped" exactly once.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backoff;
mod batcher;
mod change_tracker;
mod config;
mod error;
mod multipart;
mod puller;
mod pusher;
mod sequence_map;
mod session;
mod storage;
mod transport;

pub use backoff::ChangeTrackerBackoff;
pub use batcher::{BatchProcessor, Batcher};
pub use change_tracker::{ChangeFeedMode, ChangeTracker, ChangeTrackerClient};
pub use config::ReplicatorConfig;
pub use error::{
    is_transient_status, ReplicationError, ReplicationResult, StorageError, StorageResult,
};
pub use multipart::{MultipartDocumentReader, MultipartEvent, MultipartReader, MultipartWriter};
pub use puller::Puller;
pub use pusher::Pusher;
pub use sequence_map::SequenceMap;
pub use session::SessionState;
pub use storage::{
    AttachmentWriter, ChangeNotification, LocalRevision, MemoryStorage, ReplicationFilter,
    ReplicationStorage,
};
pub use transport::{
    HttpBody, HttpMethod, HttpResponse, HttpTransport, MockTransport, RecordedRequest,
};
