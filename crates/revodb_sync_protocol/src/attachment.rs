//! Attachment metadata from a document's `_attachments` map.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata for one entry of a document's `_attachments` map.
///
/// An attachment body travels either inline (`data`, base64) or as a
/// separate MIME part announced by `follows: true`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// MIME content type of the attachment body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Digest string, `md5-<base64>` or `sha1-<base64>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// Byte length of the decoded body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    /// Byte length of the encoded body, when an encoding applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoded_length: Option<u64>,
    /// The body follows as a MIME part instead of being inlined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follows: Option<bool>,
    /// Inline base64 body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// The entry is a stub referencing an already-known body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stub: Option<bool>,
    /// Generation at which the attachment was added.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revpos: Option<u64>,
}

impl Attachment {
    /// Reads attachment metadata out of a JSON value, tolerating unknown
    /// fields. Returns `None` if the value is not an object.
    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_object()?;
        serde_json::from_value(value.clone()).ok()
    }

    /// Whether the body arrives as a separate MIME part.
    pub fn follows(&self) -> bool {
        self.follows == Some(true)
    }

    /// Declared body length; an `encoded_length` takes precedence.
    pub fn declared_length(&self) -> Option<u64> {
        self.encoded_length.or(self.length)
    }
}
