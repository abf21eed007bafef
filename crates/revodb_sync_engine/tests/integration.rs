//! End-to-end tests wiring the puller and pusher through in-memory
//! storage and a scripted transport.

use parking_lot::Mutex;
use revodb_sync_engine::{
    HttpBody, HttpMethod, HttpResponse, HttpTransport, MemoryStorage, MockTransport, Puller,
    Pusher, ReplicationStorage, ReplicatorConfig,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

fn remote() -> Url {
    init_tracing();
    Url::parse("http://peer.example.com/db").unwrap()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn attachment_properties(digest: &str, length: usize) -> Map<String, Value> {
    let mut properties = Map::new();
    properties.insert("title".into(), json!("attachment carrier"));
    properties.insert(
        "_attachments".into(),
        json!({
            "notes.txt": {
                "content_type": "text/plain",
                "digest": digest,
                "length": length,
                "follows": true,
                "revpos": 1,
            }
        }),
    );
    properties
}

/// A document with an attachment pushed via multipart upload and pulled back
/// through the multipart reader reproduces identical properties and
/// identical attachment bytes.
#[test]
fn push_then_pull_round_trip_preserves_attachments() {
    let blob: &[u8] = b"The quick brown fox jumps over the lazy dog";

    // Source replica: one revision carrying the attachment.
    let source = Arc::new(MemoryStorage::new());
    let digest = source.add_blob(blob);
    source.put_revision(
        "doc1",
        "1-abc",
        false,
        attachment_properties(&digest, blob.len()),
        vec!["1-abc".into()],
    );

    // Push and capture the multipart body that went over the wire.
    let captured: Arc<Mutex<Option<(String, Vec<u8>)>>> = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&captured);
    let push_transport = Arc::new(MockTransport::new(move |request| match request.path() {
        path if path.ends_with("/_revs_diff") => Ok(HttpResponse::json(
            200,
            json!({"doc1": {"missing": ["1-abc"]}}),
        )),
        path if path.ends_with("/doc1") && request.method == HttpMethod::Put => {
            let Some(HttpBody::Bytes { content_type, data }) = &request.body else {
                return Ok(HttpResponse::status(400));
            };
            *sink.lock() = Some((content_type.clone(), data.clone()));
            Ok(HttpResponse::status(201))
        }
        _ => Ok(HttpResponse::status(404)),
    }));

    let pusher = Pusher::new(
        remote(),
        Arc::clone(&source) as Arc<dyn ReplicationStorage>,
        push_transport as Arc<dyn HttpTransport>,
        ReplicatorConfig::new(),
    )
    .unwrap();
    pusher.start().unwrap();
    assert!(pusher.wait_until_stopped(Duration::from_secs(10)));
    assert!(pusher.last_error_message().is_none());

    let (content_type, body) = captured.lock().clone().expect("multipart upload captured");
    assert!(content_type.starts_with("multipart/related"));

    // Target replica: pull the same revision, serving the captured body.
    let target = Arc::new(MemoryStorage::new());
    let served = Arc::new((content_type, body));
    let feed = Arc::clone(&served);
    let pull_transport = Arc::new(MockTransport::new(move |request| match request.path() {
        path if path.ends_with("/_changes") => Ok(HttpResponse::json(
            200,
            json!({"results": [
                {"seq": 7, "id": "doc1", "changes": [{"rev": "1-abc"}]},
            ]}),
        )),
        path if path.ends_with("/doc1") => Ok(HttpResponse {
            status: 200,
            content_type: Some(feed.0.clone()),
            body: feed.1.clone(),
        }),
        _ => Ok(HttpResponse::status(404)),
    }));

    let puller = Puller::new(
        remote(),
        Arc::clone(&target) as Arc<dyn ReplicationStorage>,
        pull_transport as Arc<dyn HttpTransport>,
        ReplicatorConfig::new(),
    )
    .unwrap();
    puller.start().unwrap();
    assert!(puller.wait_until_stopped(Duration::from_secs(10)));
    assert!(puller.last_error_message().is_none(), "{:?}", puller.last_error_message());

    // The revision landed, with the attachment bytes intact and the digest
    // recomputed to the same value.
    assert!(target.contains_revision("doc1", "1-abc"));
    assert_eq!(target.blob(&digest).as_deref(), Some(blob));
    assert_eq!(target.remembered_digests(), vec![digest.clone()]);

    let stored = target.revision_properties("doc1", "1-abc").unwrap();
    assert_eq!(stored["title"], json!("attachment carrier"));
    assert_eq!(stored["_attachments"]["notes.txt"]["digest"], json!(digest));
    assert_eq!(
        stored["_attachments"]["notes.txt"]["length"],
        json!(blob.len())
    );
    assert_eq!(puller.last_sequence().as_deref(), Some("7"));
}

/// The change-feed scenario from the wire contract: one entry at seq 5 for
/// doc1/1-abc pulls that revision and checkpoints at 5.
#[test]
fn pull_fetches_and_checkpoints_plain_documents() {
    let storage = Arc::new(MemoryStorage::new());
    let transport = Arc::new(MockTransport::new(|request| match request.path() {
        path if path.ends_with("/_changes") => Ok(HttpResponse::json(
            200,
            json!({"results": [
                {"seq": 5, "id": "doc1", "changes": [{"rev": "1-abc"}]},
            ], "last_seq": 5}),
        )),
        path if path.ends_with("/doc1") => Ok(HttpResponse::json(
            200,
            json!({
                "_id": "doc1",
                "_rev": "1-abc",
                "color": "teal",
                "_revisions": {"start": 1, "ids": ["abc"]},
            }),
        )),
        _ => Ok(HttpResponse::status(404)),
    }));

    let puller = Puller::new(
        remote(),
        Arc::clone(&storage) as Arc<dyn ReplicationStorage>,
        Arc::clone(&transport) as Arc<dyn HttpTransport>,
        ReplicatorConfig::new(),
    )
    .unwrap();
    puller.start().unwrap();
    assert!(puller.wait_until_stopped(Duration::from_secs(10)));

    assert!(storage.contains_revision("doc1", "1-abc"));
    assert_eq!(
        storage.revision_properties("doc1", "1-abc").unwrap()["color"],
        json!("teal")
    );
    assert_eq!(puller.last_sequence().as_deref(), Some("5"));
}

/// A second pull session resumes its feed from the persisted checkpoint.
#[test]
fn checkpoint_resumes_across_sessions() {
    let storage = Arc::new(MemoryStorage::new());
    let transport = Arc::new(MockTransport::new(|request| match request.path() {
        path if path.ends_with("/_changes") => {
            let query = request.url.query().unwrap_or_default();
            if query.contains("since=3") {
                Ok(HttpResponse::json(200, json!({"results": []})))
            } else {
                Ok(HttpResponse::json(
                    200,
                    json!({"results": [
                        {"seq": 3, "id": "doc1", "changes": [{"rev": "1-abc"}]},
                    ]}),
                ))
            }
        }
        path if path.ends_with("/doc1") => Ok(HttpResponse::json(
            200,
            json!({
                "_id": "doc1",
                "_rev": "1-abc",
                "_revisions": {"start": 1, "ids": ["abc"]},
            }),
        )),
        _ => Ok(HttpResponse::status(404)),
    }));

    let first = Puller::new(
        remote(),
        Arc::clone(&storage) as Arc<dyn ReplicationStorage>,
        Arc::clone(&transport) as Arc<dyn HttpTransport>,
        ReplicatorConfig::new(),
    )
    .unwrap();
    first.start().unwrap();
    assert!(first.wait_until_stopped(Duration::from_secs(10)));
    assert_eq!(first.last_sequence().as_deref(), Some("3"));

    let second = Puller::new(
        remote(),
        Arc::clone(&storage) as Arc<dyn ReplicationStorage>,
        Arc::clone(&transport) as Arc<dyn HttpTransport>,
        ReplicatorConfig::new(),
    )
    .unwrap();
    second.start().unwrap();
    assert!(second.wait_until_stopped(Duration::from_secs(10)));

    // The second feed request carried since=3 and found nothing new.
    let feeds: Vec<_> = transport
        .requests()
        .into_iter()
        .filter(|r| r.path().ends_with("/_changes"))
        .collect();
    assert_eq!(feeds.len(), 2);
    assert!(feeds[1].url.query().unwrap().contains("since=3"));
    assert_eq!(second.last_sequence().as_deref(), Some("3"));
    // The revision was only fetched once.
    let fetches = transport
        .requests()
        .iter()
        .filter(|r| r.path().ends_with("/doc1"))
        .count();
    assert_eq!(fetches, 1);
}

/// Pushing into an empty remote and pulling from a populated one leaves the
/// two replicas convergent on both documents.
#[test]
fn bidirectional_sync_converges() {
    let local = Arc::new(MemoryStorage::new());
    let mut mine = Map::new();
    mine.insert("owner".into(), json!("local"));
    local.put_revision("local-doc", "1-aaa", false, mine, vec!["1-aaa".into()]);

    // Push phase: remote accepts the local doc.
    let push_transport = Arc::new(MockTransport::new(|request| match request.path() {
        path if path.ends_with("/_revs_diff") => Ok(HttpResponse::json(
            200,
            json!({"local-doc": {"missing": ["1-aaa"]}}),
        )),
        path if path.ends_with("/_bulk_docs") => Ok(HttpResponse::json(
            201,
            json!([{"id": "local-doc", "rev": "1-aaa"}]),
        )),
        _ => Ok(HttpResponse::status(404)),
    }));
    let pusher = Pusher::new(
        remote(),
        Arc::clone(&local) as Arc<dyn ReplicationStorage>,
        push_transport as Arc<dyn HttpTransport>,
        ReplicatorConfig::new(),
    )
    .unwrap();
    pusher.start().unwrap();
    assert!(pusher.wait_until_stopped(Duration::from_secs(10)));

    // Pull phase: the remote offers a doc of its own.
    let pull_transport = Arc::new(MockTransport::new(|request| match request.path() {
        path if path.ends_with("/_changes") => Ok(HttpResponse::json(
            200,
            json!({"results": [
                {"seq": 1, "id": "remote-doc", "changes": [{"rev": "1-bbb"}]},
            ]}),
        )),
        path if path.ends_with("/remote-doc") => Ok(HttpResponse::json(
            200,
            json!({
                "_id": "remote-doc",
                "_rev": "1-bbb",
                "owner": "remote",
                "_revisions": {"start": 1, "ids": ["bbb"]},
            }),
        )),
        _ => Ok(HttpResponse::status(404)),
    }));
    let puller = Puller::new(
        remote(),
        Arc::clone(&local) as Arc<dyn ReplicationStorage>,
        pull_transport as Arc<dyn HttpTransport>,
        ReplicatorConfig::new(),
    )
    .unwrap();
    puller.start().unwrap();
    assert!(puller.wait_until_stopped(Duration::from_secs(10)));

    assert!(local.contains_revision("local-doc", "1-aaa"));
    assert!(local.contains_revision("remote-doc", "1-bbb"));
    // The pulled revision remembers where it came from, so a future push to
    // the same peer skips it.
    assert_eq!(local.revision_source("remote-doc", "1-bbb"), Some(remote()));
    assert_eq!(pusher.last_sequence().as_deref(), Some("1"));
    assert_eq!(puller.last_sequence().as_deref(), Some("1"));
}
