//! # revodb Sync Protocol
//!
//! Wire types for the revodb replication protocol.
//!
//! This crate provides:
//! - Change-feed entries and poll responses (`_changes`)
//! - Revision identity, generation parsing, and `_revisions` history encoding
//! - Attachment metadata (`_attachments` entries)
//! - `_revs_diff` and `_bulk_docs` message bodies
//!
//! All types are plain serde structs over the JSON wire format; the crate
//! performs no I/O.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod attachment;
mod changes;
mod error;
mod messages;
mod revision;

pub use attachment::Attachment;
pub use changes::{ChangeEntry, ChangeRev, ChangesFeed};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    BulkDocsRequest, BulkDocsResponseItem, RevsDiffEntry, RevsDiffRequest, RevsDiffResponse,
};
pub use revision::{
    encode_revision_history, generation, is_valid_document_id, parse_revision_history, Revision,
};
