//! MIME multipart reading and writing for document + attachment bodies.
//!
//! A pulled revision with attachments arrives as `multipart/related`: one
//! JSON part with the document properties, then one binary part per
//! attachment. [`MultipartReader`] is the incremental wire parser,
//! [`MultipartDocumentReader`] reconstructs the document and verifies
//! attachment integrity, and [`MultipartWriter`] builds the equivalent
//! upload body for the pusher.

use crate::error::{ReplicationError, ReplicationResult};
use crate::storage::{AttachmentWriter, ReplicationStorage};
use bytes::BytesMut;
use revodb_sync_protocol::Attachment;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

const CRLF_CRLF: &[u8] = b"\r\n\r\n";
/// Inline attachments above this size get flagged as an anti-pattern.
const INLINE_ATTACHMENT_WARN_BYTES: u64 = 1000;

/// An event produced while feeding data to a [`MultipartReader`].
#[derive(Debug, Clone, PartialEq)]
pub enum MultipartEvent {
    /// A new part began, with its headers.
    PartBegan(HashMap<String, String>),
    /// Body bytes of the current part.
    PartData(Vec<u8>),
    /// The current part ended.
    PartEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    /// Before anything; the body may open with a boundary that has no
    /// leading CRLF.
    AtStart,
    /// Skipping a preamble before the first boundary.
    Prologue,
    /// Between a boundary and its part's body.
    Headers,
    /// Inside a part's body.
    Body,
    /// Saw the closing boundary.
    AtEnd,
}

/// Incremental MIME multipart parser.
///
/// Feed it body chunks as they arrive; it emits part events as soon as the
/// boundaries allow. Boundaries split across chunks are handled by keeping
/// one boundary's worth of unconsumed tail in the buffer.
pub struct MultipartReader {
    /// Full delimiter: `\r\n--<boundary>`.
    boundary: Vec<u8>,
    buffer: BytesMut,
    state: ReaderState,
}

impl MultipartReader {
    /// Creates a parser from a `multipart/*` content type; the `boundary`
    /// parameter is required.
    pub fn new(content_type: &str) -> ReplicationResult<Self> {
        let boundary = parse_boundary(content_type)?;
        Ok(Self {
            boundary: [b"\r\n--", boundary.as_bytes()].concat(),
            buffer: BytesMut::with_capacity(1024),
            state: ReaderState::AtStart,
        })
    }

    /// True once the closing boundary has been seen.
    pub fn finished(&self) -> bool {
        self.state == ReaderState::AtEnd
    }

    /// The boundary delimiter without its leading CRLF (`--<boundary>`).
    fn open_boundary(&self) -> &[u8] {
        &self.boundary[2..]
    }

    /// Appends body data, returning the part events it completes.
    pub fn append_data(&mut self, data: &[u8]) -> ReplicationResult<Vec<MultipartEvent>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        if self.state == ReaderState::AtEnd {
            // Trailing bytes after the closing delimiter (final CRLF,
            // transfer padding) carry no parts.
            return Ok(Vec::new());
        }

        self.buffer.extend_from_slice(data);
        let mut events = Vec::new();

        loop {
            let next_state = match self.state {
                ReaderState::AtStart => {
                    let open_len = self.open_boundary().len();
                    if self.buffer.len() < open_len {
                        None
                    } else if self.buffer[..open_len] == *self.open_boundary() {
                        let _ = self.buffer.split_to(open_len);
                        Some(ReaderState::Headers)
                    } else {
                        Some(ReaderState::Prologue)
                    }
                }

                ReaderState::Prologue | ReaderState::Body => {
                    if self.buffer.len() < self.boundary.len() {
                        None
                    } else {
                        // Search the new data plus enough of the old tail to
                        // catch a boundary split across chunks.
                        let start = self
                            .buffer
                            .len()
                            .saturating_sub(data.len() + self.boundary.len());
                        match find(&self.buffer, &self.boundary, start) {
                            Some(location) => {
                                if self.state == ReaderState::Body {
                                    if location > 0 {
                                        events.push(MultipartEvent::PartData(
                                            self.buffer[..location].to_vec(),
                                        ));
                                    }
                                    events.push(MultipartEvent::PartEnded);
                                }
                                let _ = self.buffer.split_to(location + self.boundary.len());
                                Some(ReaderState::Headers)
                            }
                            None => {
                                // No boundary yet; pass through everything
                                // except a possible partial boundary tail.
                                let keep = self.boundary.len();
                                if self.buffer.len() > keep {
                                    let passthrough =
                                        self.buffer.split_to(self.buffer.len() - keep);
                                    if self.state == ReaderState::Body {
                                        events.push(MultipartEvent::PartData(
                                            passthrough.to_vec(),
                                        ));
                                    }
                                }
                                None
                            }
                        }
                    }
                }

                ReaderState::Headers => {
                    // "--" right after a boundary closes the message.
                    if self.buffer.len() >= 2 && &self.buffer[..2] == b"--" {
                        self.state = ReaderState::AtEnd;
                        self.buffer.clear();
                        return Ok(events);
                    }
                    match find(&self.buffer, CRLF_CRLF, 0) {
                        Some(location) => {
                            let headers = parse_headers(&self.buffer[..location])?;
                            let _ = self.buffer.split_to(location + CRLF_CRLF.len());
                            events.push(MultipartEvent::PartBegan(headers));
                            Some(ReaderState::Body)
                        }
                        None => None,
                    }
                }

                ReaderState::AtEnd => None,
            };

            match next_state {
                Some(state) => self.state = state,
                None => break,
            }
            if self.buffer.is_empty() {
                break;
            }
        }

        Ok(events)
    }
}

/// Extracts the boundary parameter from a multipart content type.
fn parse_boundary(content_type: &str) -> ReplicationResult<String> {
    let mut parts = content_type.split(';');
    let mime = parts.next().unwrap_or_default().trim();
    if !mime.starts_with("multipart/") {
        return Err(ReplicationError::Configuration(format!(
            "{content_type} does not start with multipart/"
        )));
    }
    for param in parts {
        let param = param.trim();
        if let Some(mut boundary) = param.strip_prefix("boundary=") {
            if boundary.starts_with('"') {
                boundary = boundary
                    .strip_prefix('"')
                    .and_then(|b| b.strip_suffix('"'))
                    .ok_or_else(|| {
                        ReplicationError::Configuration(format!("{content_type} is not valid"))
                    })?;
            }
            if boundary.is_empty() {
                return Err(ReplicationError::Configuration(format!(
                    "{content_type} has zero-length boundary"
                )));
            }
            return Ok(boundary.to_string());
        }
    }
    Err(ReplicationError::Configuration(format!(
        "{content_type} has no boundary parameter"
    )))
}

fn parse_headers(block: &[u8]) -> ReplicationResult<HashMap<String, String>> {
    let text = String::from_utf8_lossy(block);
    let mut headers = HashMap::new();
    for line in text.split("\r\n") {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':').ok_or_else(|| {
            ReplicationError::Multipart(format!("missing ':' in header line: {line}"))
        })?;
        headers.insert(name.trim().to_string(), value.trim().to_string());
    }
    Ok(headers)
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() || from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|i| i + from)
}

struct CurrentPart {
    writer: AttachmentWriter,
    name: Option<String>,
}

struct ReceivedAttachment {
    name: Option<String>,
    md5: String,
    writer: AttachmentWriter,
}

/// Reconstructs a document plus its attachment blobs from a streamed HTTP
/// response body, which is either plain JSON or `multipart/related`.
///
/// The first MIME part is the document's JSON; every later part is an
/// attachment body, matched against the declared `_attachments` and
/// digest-verified on [`finish`](Self::finish).
pub struct MultipartDocumentReader {
    storage: Arc<dyn ReplicationStorage>,
    reader: Option<MultipartReader>,
    json_buffer: Vec<u8>,
    document: Option<Map<String, Value>>,
    current: Option<CurrentPart>,
    received: Vec<ReceivedAttachment>,
}

impl MultipartDocumentReader {
    /// Creates a reader that registers received attachments with `storage`.
    pub fn new(storage: Arc<dyn ReplicationStorage>) -> Self {
        Self {
            storage,
            reader: None,
            json_buffer: Vec::new(),
            document: None,
            current: None,
            received: Vec::new(),
        }
    }

    /// Configures the reader from the response's content type.
    ///
    /// `multipart/*` enables MIME parsing; JSON and `text/plain` (some
    /// servers send JSON with the wrong content type) select the raw JSON
    /// path; anything else fails fast.
    pub fn set_content_type(&mut self, content_type: Option<&str>) -> ReplicationResult<()> {
        match content_type {
            Some(value) if value.starts_with("multipart/") => {
                self.reader = Some(MultipartReader::new(value)?);
                Ok(())
            }
            None => Ok(()),
            Some(value)
                if value.starts_with("application/json") || value.starts_with("text/plain") =>
            {
                Ok(())
            }
            Some(other) => Err(ReplicationError::Configuration(format!(
                "unsupported response content type: {other}"
            ))),
        }
    }

    /// Feeds response body bytes.
    pub fn append_data(&mut self, data: &[u8]) -> ReplicationResult<()> {
        match &mut self.reader {
            Some(reader) => {
                let events = reader.append_data(data)?;
                for event in events {
                    match event {
                        MultipartEvent::PartBegan(headers) => self.started_part(&headers),
                        MultipartEvent::PartData(bytes) => self.append_to_part(&bytes),
                        MultipartEvent::PartEnded => self.finished_part()?,
                    }
                }
                Ok(())
            }
            None => {
                self.json_buffer.extend_from_slice(data);
                Ok(())
            }
        }
    }

    /// Completes parsing and returns the document properties.
    ///
    /// For multipart bodies the underlying parser must have seen the closing
    /// boundary, and every declared `follows` attachment is cross-checked
    /// against the MIME parts actually received.
    pub fn finish(&mut self) -> ReplicationResult<Map<String, Value>> {
        if let Some(reader) = &self.reader {
            if !reader.finished() {
                return Err(ReplicationError::Multipart(
                    "received incomplete MIME multipart response".into(),
                ));
            }
            self.register_attachments()?;
        } else {
            self.parse_json_buffer()?;
        }
        Ok(self.document.take().unwrap_or_default())
    }

    fn started_part(&mut self, headers: &HashMap<String, String>) {
        if self.document.is_none() {
            // First part: the document's JSON.
            self.json_buffer.clear();
        } else {
            let writer = self.storage.attachment_writer();
            let name = headers
                .get("Content-Disposition")
                .and_then(|value| attachment_filename(value));
            self.current = Some(CurrentPart { writer, name });
        }
    }

    fn append_to_part(&mut self, data: &[u8]) {
        if self.document.is_none() {
            self.json_buffer.extend_from_slice(data);
        } else if let Some(current) = &mut self.current {
            current.writer.append_data(data);
        }
    }

    fn finished_part(&mut self) -> ReplicationResult<()> {
        if self.document.is_none() {
            self.parse_json_buffer()
        } else {
            if let Some(current) = self.current.take() {
                let md5 = current.writer.md5_digest();
                self.received.push(ReceivedAttachment {
                    name: current.name,
                    md5,
                    writer: current.writer,
                });
            }
            Ok(())
        }
    }

    fn parse_json_buffer(&mut self) -> ReplicationResult<()> {
        let value: Value = serde_json::from_slice(&self.json_buffer)
            .map_err(|e| ReplicationError::Protocol(format!("failed to parse document: {e}")))?;
        let Value::Object(document) = value else {
            return Err(ReplicationError::Protocol(
                "document body is not a JSON object".into(),
            ));
        };
        self.json_buffer.clear();
        self.document = Some(document);
        Ok(())
    }

    /// Cross-checks declared attachments against received MIME parts and
    /// hands the resolved blobs over to storage.
    fn register_attachments(&mut self) -> ReplicationResult<()> {
        let Some(document) = self.document.as_mut() else {
            return Err(ReplicationError::Protocol(
                "multipart response is missing its document part".into(),
            ));
        };

        let mut followers = 0usize;
        if let Some(Value::Object(attachments)) = document.get_mut("_attachments") {
            let attachment_count = attachments.len();
            let names: Vec<String> = attachments.keys().cloned().collect();

            for name in names {
                let Some(value) = attachments.get(&name) else {
                    continue;
                };
                let meta = Attachment::from_value(value).ok_or_else(|| {
                    ReplicationError::Protocol(format!("invalid _attachments entry '{name}'"))
                })?;
                let declared_length = meta.declared_length().unwrap_or(0);

                if meta.follows() {
                    // Identify the MIME body: by the filename from its
                    // Content-Disposition header, else by declared digest,
                    // else the sole-attachment assumption.
                    let index = match self
                        .received
                        .iter()
                        .position(|part| part.name.as_deref() == Some(name.as_str()))
                    {
                        Some(index) => {
                            let actual = self.received[index].md5.clone();
                            if let Some(declared) = &meta.digest {
                                if *declared != actual
                                    && *declared != self.received[index].writer.sha1_digest()
                                {
                                    return Err(ReplicationError::Multipart(format!(
                                        "attachment '{name}' has incorrect digest ({declared}; should be {actual})"
                                    )));
                                }
                            }
                            set_attachment_digest(attachments, &name, &actual);
                            index
                        }
                        None => match &meta.digest {
                            Some(digest) => self
                                .received
                                .iter()
                                .position(|part| part.md5 == *digest)
                                .ok_or_else(|| {
                                    ReplicationError::Multipart(format!(
                                        "attachment '{name}' does not appear in MIME body"
                                    ))
                                })?,
                            None if attachment_count == 1 && self.received.len() == 1 => {
                                // Sole attachment and sole body: assume they
                                // match. No digest proof exists for this.
                                debug!(
                                    attachment = %name,
                                    "accepting sole MIME body without digest metadata"
                                );
                                let actual = self.received[0].md5.clone();
                                set_attachment_digest(attachments, &name, &actual);
                                0
                            }
                            None => {
                                return Err(ReplicationError::Multipart(format!(
                                    "attachment '{name}' has no digest metadata; cannot identify MIME body"
                                )));
                            }
                        },
                    };

                    let actual_length = self.received[index].writer.len() as u64;
                    if actual_length != declared_length {
                        return Err(ReplicationError::Multipart(format!(
                            "attachment '{name}' has incorrect length field {declared_length} (should be {actual_length})"
                        )));
                    }
                    followers += 1;
                } else if meta.data.is_some() && declared_length > INLINE_ATTACHMENT_WARN_BYTES {
                    warn!(
                        attachment = %name,
                        length = declared_length,
                        "attachment sent inline; large attachments should be sent as MIME parts"
                    );
                }
            }
        }

        if followers < self.received.len() {
            return Err(ReplicationError::Multipart(format!(
                "more MIME bodies ({}) than attachments ({followers})",
                self.received.len()
            )));
        }

        // Hand the (uninstalled) blobs over for storage to remember.
        let mut by_digest = HashMap::new();
        for part in self.received.drain(..) {
            by_digest.insert(part.md5, part.writer);
        }
        if !by_digest.is_empty() {
            self.storage.remember_attachment_writers(by_digest)?;
        }
        Ok(())
    }
}

fn set_attachment_digest(attachments: &mut Map<String, Value>, name: &str, digest: &str) {
    if let Some(Value::Object(entry)) = attachments.get_mut(name) {
        entry.insert("digest".into(), Value::String(digest.to_string()));
    }
}

/// Parses `attachment; filename=<name>` (quoted or not) out of a
/// Content-Disposition header.
fn attachment_filename(disposition: &str) -> Option<String> {
    let rest = disposition.strip_prefix("attachment; filename=")?;
    let name = rest.trim().trim_matches('"');
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Builds a `multipart/related` request body: one JSON part followed by one
/// part per attachment.
pub struct MultipartWriter {
    boundary: String,
    body: Vec<u8>,
}

impl MultipartWriter {
    /// Creates a writer with a fresh random boundary.
    pub fn new() -> Self {
        Self {
            boundary: Uuid::new_v4().simple().to_string(),
            body: Vec::new(),
        }
    }

    /// The `Content-Type` header value for the assembled body.
    pub fn content_type(&self) -> String {
        format!("multipart/related; boundary=\"{}\"", self.boundary)
    }

    /// Adds the document's JSON part. Must be added first.
    pub fn add_json_part(&mut self, value: &Value) -> ReplicationResult<()> {
        self.begin_part(&[("Content-Type", "application/json")]);
        let rendered = serde_json::to_vec(value)?;
        self.body.extend_from_slice(&rendered);
        Ok(())
    }

    /// Adds one attachment part, identified by filename.
    pub fn add_attachment_part(&mut self, name: &str, content_type: Option<&str>, data: &[u8]) {
        let disposition = format!("attachment; filename=\"{name}\"");
        match content_type {
            Some(ct) => self.begin_part(&[
                ("Content-Disposition", disposition.as_str()),
                ("Content-Type", ct),
            ]),
            None => self.begin_part(&[("Content-Disposition", disposition.as_str())]),
        }
        self.body.extend_from_slice(data);
    }

    /// Closes the body and returns its bytes.
    pub fn finish(mut self) -> Vec<u8> {
        self.body
            .extend_from_slice(format!("\r\n--{}--\r\n", self.boundary).as_bytes());
        self.body
    }

    fn begin_part(&mut self, headers: &[(&str, &str)]) {
        if self.body.is_empty() {
            self.body
                .extend_from_slice(format!("--{}\r\n", self.boundary).as_bytes());
        } else {
            self.body
                .extend_from_slice(format!("\r\n--{}\r\n", self.boundary).as_bytes());
        }
        for (name, value) in headers {
            self.body
                .extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        self.body.extend_from_slice(b"\r\n");
    }
}

impl Default for MultipartWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn sample_body() -> (String, Vec<u8>) {
        let boundary = "BOUND";
        let body = format!(
            "--{boundary}\r\nContent-Type: application/json\r\n\r\n{{\"a\":1}}\r\n--{boundary}\r\nContent-Disposition: attachment; filename=\"file.txt\"\r\n\r\nhello\r\n--{boundary}--\r\n"
        );
        (
            format!("multipart/related; boundary=\"{boundary}\""),
            body.into_bytes(),
        )
    }

    #[test]
    fn reader_parses_parts() {
        let (content_type, body) = sample_body();
        let mut reader = MultipartReader::new(&content_type).unwrap();
        let events = reader.append_data(&body).unwrap();

        let mut parts: Vec<Vec<u8>> = Vec::new();
        let mut headers_seen = Vec::new();
        for event in events {
            match event {
                MultipartEvent::PartBegan(headers) => {
                    headers_seen.push(headers);
                    parts.push(Vec::new());
                }
                MultipartEvent::PartData(data) => {
                    parts.last_mut().unwrap().extend_from_slice(&data)
                }
                MultipartEvent::PartEnded => {}
            }
        }

        assert!(reader.finished());
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], br#"{"a":1}"#);
        assert_eq!(parts[1], b"hello");
        assert_eq!(
            headers_seen[0].get("Content-Type").map(String::as_str),
            Some("application/json")
        );
        assert_eq!(
            headers_seen[1].get("Content-Disposition").map(String::as_str),
            Some("attachment; filename=\"file.txt\"")
        );
    }

    #[test]
    fn reader_handles_byte_by_byte_input() {
        let (content_type, body) = sample_body();
        let mut reader = MultipartReader::new(&content_type).unwrap();

        let mut parts: Vec<Vec<u8>> = Vec::new();
        for byte in body {
            for event in reader.append_data(&[byte]).unwrap() {
                match event {
                    MultipartEvent::PartBegan(_) => parts.push(Vec::new()),
                    MultipartEvent::PartData(data) => {
                        parts.last_mut().unwrap().extend_from_slice(&data)
                    }
                    MultipartEvent::PartEnded => {}
                }
            }
        }

        assert!(reader.finished());
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], br#"{"a":1}"#);
        assert_eq!(parts[1], b"hello");
    }

    #[test]
    fn reader_skips_prologue() {
        let boundary = "B";
        let content_type = format!("multipart/related; boundary={boundary}");
        let body =
            format!("this is a preamble\r\n--{boundary}\r\n\r\npayload\r\n--{boundary}--\r\n");
        let mut reader = MultipartReader::new(&content_type).unwrap();

        let events = reader.append_data(body.as_bytes()).unwrap();
        let data: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                MultipartEvent::PartData(d) => Some(d.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(data, b"payload");
        assert!(reader.finished());
    }

    #[test]
    fn data_after_end_is_ignored() {
        let (content_type, body) = sample_body();
        let mut reader = MultipartReader::new(&content_type).unwrap();
        reader.append_data(&body).unwrap();
        let events = reader.append_data(b"trailing").unwrap();
        assert!(events.is_empty());
        assert!(reader.finished());
    }

    #[test]
    fn boundary_parsing() {
        assert!(MultipartReader::new("application/json").is_err());
        assert!(MultipartReader::new("multipart/related").is_err());
        assert!(MultipartReader::new("multipart/related; boundary=").is_err());
        assert!(MultipartReader::new("multipart/related; boundary=\"unterminated").is_err());
        assert!(MultipartReader::new("multipart/related; boundary=ok").is_ok());
        assert!(MultipartReader::new("multipart/related; boundary=\"quoted\"").is_ok());
    }

    fn document_with_attachment(data: &[u8], digest: &str) -> Value {
        json!({
            "_id": "doc1",
            "_rev": "1-abc",
            "_attachments": {
                "file.txt": {
                    "content_type": "text/plain",
                    "follows": true,
                    "digest": digest,
                    "length": data.len(),
                }
            }
        })
    }

    fn digest_of(data: &[u8]) -> String {
        let mut writer = AttachmentWriter::new();
        writer.append_data(data);
        writer.md5_digest()
    }

    #[test]
    fn writer_reader_round_trip() {
        let data = b"attachment contents here";
        let digest = digest_of(data);
        let document = document_with_attachment(data, &digest);

        let mut writer = MultipartWriter::new();
        writer.add_json_part(&document).unwrap();
        writer.add_attachment_part("file.txt", Some("text/plain"), data);
        let content_type = writer.content_type();
        let body = writer.finish();

        let storage = Arc::new(MemoryStorage::new());
        let mut reader =
            MultipartDocumentReader::new(Arc::clone(&storage) as Arc<dyn ReplicationStorage>);
        reader.set_content_type(Some(&content_type)).unwrap();
        // Feed in small chunks to exercise the streaming path.
        for chunk in body.chunks(7) {
            reader.append_data(chunk).unwrap();
        }
        let properties = reader.finish().unwrap();

        assert_eq!(properties["_id"], json!("doc1"));
        assert_eq!(
            properties["_attachments"]["file.txt"]["digest"],
            json!(digest)
        );
        // The blob was handed to storage keyed by its MD5 digest.
        assert_eq!(storage.remembered_digests(), vec![digest.clone()]);
        assert_eq!(storage.blob(&digest).as_deref(), Some(data.as_slice()));
    }

    #[test]
    fn digest_mismatch_is_rejected() {
        let data = b"actual bytes";
        let wrong_digest = digest_of(b"different bytes");
        let document = document_with_attachment(data, &wrong_digest);

        let mut writer = MultipartWriter::new();
        writer.add_json_part(&document).unwrap();
        writer.add_attachment_part("file.txt", Some("text/plain"), data);
        let content_type = writer.content_type();
        let body = writer.finish();

        let storage = Arc::new(MemoryStorage::new()) as Arc<dyn ReplicationStorage>;
        let mut reader = MultipartDocumentReader::new(storage);
        reader.set_content_type(Some(&content_type)).unwrap();
        reader.append_data(&body).unwrap();
        assert!(matches!(
            reader.finish(),
            Err(ReplicationError::Multipart(_))
        ));
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let data = b"12345678";
        let digest = digest_of(data);
        let document = json!({
            "_id": "doc1",
            "_rev": "1-abc",
            "_attachments": {
                "file.txt": {"follows": true, "digest": digest, "length": 4}
            }
        });

        let mut writer = MultipartWriter::new();
        writer.add_json_part(&document).unwrap();
        writer.add_attachment_part("file.txt", None, data);
        let content_type = writer.content_type();
        let body = writer.finish();

        let storage = Arc::new(MemoryStorage::new()) as Arc<dyn ReplicationStorage>;
        let mut reader = MultipartDocumentReader::new(storage);
        reader.set_content_type(Some(&content_type)).unwrap();
        reader.append_data(&body).unwrap();
        assert!(matches!(
            reader.finish(),
            Err(ReplicationError::Multipart(_))
        ));
    }

    #[test]
    fn extra_mime_part_is_rejected() {
        let data = b"one";
        let digest = digest_of(data);
        let document = document_with_attachment(data, &digest);

        let mut writer = MultipartWriter::new();
        writer.add_json_part(&document).unwrap();
        writer.add_attachment_part("file.txt", None, data);
        writer.add_attachment_part("surprise.bin", None, b"unaccounted for");
        let content_type = writer.content_type();
        let body = writer.finish();

        let storage = Arc::new(MemoryStorage::new()) as Arc<dyn ReplicationStorage>;
        let mut reader = MultipartDocumentReader::new(storage);
        reader.set_content_type(Some(&content_type)).unwrap();
        reader.append_data(&body).unwrap();
        assert!(matches!(
            reader.finish(),
            Err(ReplicationError::Multipart(_))
        ));
    }

    #[test]
    fn sole_attachment_without_metadata_is_assumed_to_match() {
        let data = b"unlabeled";
        let document = json!({
            "_id": "doc1",
            "_rev": "1-abc",
            "_attachments": {
                "file.txt": {"follows": true, "length": data.len()}
            }
        });

        // No filename on the part and no declared digest.
        let boundary = "B";
        let body = format!(
            "--{boundary}\r\nContent-Type: application/json\r\n\r\n{document}\r\n--{boundary}\r\n\r\n{}\r\n--{boundary}--\r\n",
            String::from_utf8_lossy(data),
        );

        let storage = Arc::new(MemoryStorage::new());
        let mut reader =
            MultipartDocumentReader::new(Arc::clone(&storage) as Arc<dyn ReplicationStorage>);
        reader
            .set_content_type(Some(&format!("multipart/related; boundary={boundary}")))
            .unwrap();
        reader.append_data(body.as_bytes()).unwrap();
        let properties = reader.finish().unwrap();

        assert_eq!(
            properties["_attachments"]["file.txt"]["digest"],
            json!(digest_of(data))
        );
    }

    #[test]
    fn incomplete_body_is_rejected() {
        let (content_type, body) = sample_body();
        let storage = Arc::new(MemoryStorage::new()) as Arc<dyn ReplicationStorage>;
        let mut reader = MultipartDocumentReader::new(storage);
        reader.set_content_type(Some(&content_type)).unwrap();
        reader.append_data(&body[..body.len() / 2]).unwrap();
        assert!(matches!(
            reader.finish(),
            Err(ReplicationError::Multipart(_))
        ));
    }

    #[test]
    fn plain_json_path() {
        let storage = Arc::new(MemoryStorage::new()) as Arc<dyn ReplicationStorage>;
        let mut reader = MultipartDocumentReader::new(storage);
        reader.set_content_type(Some("application/json")).unwrap();
        reader.append_data(br#"{"_id":"doc1","_rev":"1-a","n":5}"#).unwrap();
        let properties = reader.finish().unwrap();
        assert_eq!(properties["n"], json!(5));
    }

    #[test]
    fn unsupported_content_type_fails_fast() {
        let storage = Arc::new(MemoryStorage::new()) as Arc<dyn ReplicationStorage>;
        let mut reader = MultipartDocumentReader::new(storage);
        assert!(matches!(
            reader.set_content_type(Some("application/octet-stream")),
            Err(ReplicationError::Configuration(_))
        ));
    }

    #[test]
    fn inline_attachment_is_accepted(){
        let storage = Arc::new(MemoryStorage::new()) as Arc<dyn ReplicationStorage>;
        let mut reader = MultipartDocumentReader::new(storage);
        let document = json!({
            "_id": "doc1",
            "_rev": "1-a",
            "_attachments": {"inline.txt": {"data": "aGVsbG8=", "length": 5}}
        });
        let boundary = "B";
        let body = format!(
            "--{boundary}\r\nContent-Type: application/json\r\n\r\n{document}\r\n--{boundary}--\r\n"
        );
        reader
            .set_content_type(Some(&format!("multipart/related; boundary={boundary}")))
            .unwrap();
        reader.append_data(body.as_bytes()).unwrap();
        let properties = reader.finish().unwrap();
        assert_eq!(properties["_attachments"]["inline.txt"]["data"], json!("aGVsbG8="));
    }

    #[test]
    fn attachment_filename_parsing() {
        assert_eq!(
            attachment_filename("attachment; filename=\"a.txt\"").as_deref(),
            Some("a.txt")
        );
        assert_eq!(
            attachment_filename("attachment; filename=a.txt").as_deref(),
            Some("a.txt")
        );
        assert_eq!(attachment_filename("inline; filename=a.txt"), None);
        assert_eq!(attachment_filename("attachment; filename="), None);
    }
}
