use std::sync::Arc;

use axum::{
    body::{to_bytes, Body, Bytes},
    http::{header::CONTENT_TYPE, Method, Request, StatusCode},
    Router,
};
use callback_backends::{BlobStore, FsBlobStore, LocalQueue};
use callback_proto::{AnalysisJob, ContentKind, Sha256Digest};
use callback_server::{intake::IntakeSettings, router, unix_now, CallbackServer};
use callback_store::{ContentRecord, Store};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

const BOUNDARY: &str = "callback-test-boundary";
const NOP: &str = r#"{"Command":"NOP","Arguments":null}"#;
const SUCCESS: &str = r#"{"Command":"Success","Arguments":null}"#;
const NOTEPAD: &[u8] = b"MZ\x90\x00\x03\x00\x00\x00\x04\x00notepad";
const CALC: &[u8] = b"MZ\x90\x00\x03\x00\x00\x00\x04\x00calc";

struct Harness {
    dir: TempDir,
    app: Router,
    server: Arc<CallbackServer>,
    queue: Arc<LocalQueue>,
    blobs: FsBlobStore,
    tenant: Uuid,
}

#[derive(Clone)]
struct Agent {
    system_uuid: String,
    tenant_uuid: String,
}

impl Harness {
    async fn new() -> Self {
        Self::with_upload_limit(1024 * 1024).await
    }

    async fn with_upload_limit(max_bytes: u64) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("callback.db").display());
        let store = Store::open(&url, 4).await.expect("open store");
        let tenant = Uuid::new_v4();
        store
            .insert_tenant(tenant, "acme", unix_now())
            .await
            .expect("insert tenant");

        let queue = Arc::new(LocalQueue::new());
        let blobs = FsBlobStore::new(dir.path().join("blobs"));
        let server = Arc::new(CallbackServer::new(
            store,
            Arc::new(blobs.clone()),
            queue.clone(),
            IntakeSettings {
                scratch_dir: dir.path().join("scratch"),
                max_bytes,
            },
            dir.path().join("updates"),
        ));

        Self {
            dir,
            app: router(server.clone()),
            server,
            queue,
            blobs,
            tenant,
        }
    }

    fn store(&self) -> &Store {
        self.server.store()
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Bytes) {
        let response = self.app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, body)
    }

    async fn post_json(&self, path: &str, body: Value) -> (StatusCode, String) {
        let request = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request");
        let (status, body) = self.send(request).await;
        (status, String::from_utf8(body.to_vec()).expect("utf-8 body"))
    }

    async fn register(&self, tenant: Uuid) -> Agent {
        let (status, body) = self
            .post_json(
                "/register",
                json!({
                    "CustomerUUID": tenant.to_string(),
                    "AgentVersion": "1.0.0",
                    "MachineName": "WS-0042",
                    "OSHumanName": "Windows 11 Pro",
                }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let reply: Value = serde_json::from_str(&body).expect("json reply");
        assert_eq!(reply["Command"], "SetSystemUUID");
        Agent {
            system_uuid: reply["Arguments"]["SystemUUID"]
                .as_str()
                .expect("system uuid")
                .to_string(),
            tenant_uuid: tenant.to_string(),
        }
    }

    async fn heartbeat(&self, agent: &Agent) -> (StatusCode, String) {
        self.post_json(
            "/heartbeat",
            json!({
                "SystemUUID": agent.system_uuid,
                "CustomerUUID": agent.tenant_uuid,
                "CurrentClientTime": unix_now(),
            }),
        )
        .await
    }

    async fn process_event(&self, agent: &Agent, bytes: &[u8]) -> (StatusCode, String) {
        self.process_event_reporting(agent, bytes, bytes.len()).await
    }

    async fn process_event_reporting(
        &self,
        agent: &Agent,
        bytes: &[u8],
        size: usize,
    ) -> (StatusCode, String) {
        let now = unix_now();
        self.post_json(
            "/processEvent",
            json!({
                "SystemUUID": agent.system_uuid,
                "CustomerUUID": agent.tenant_uuid,
                "CurrentClientTime": now,
                "TimeOfEvent": now - 30,
                "PID": 4412,
                "PPID": 812,
                "Path": "C:\\Windows\\System32\\notepad.exe",
                "CommandLine": "notepad.exe C:\\notes.txt",
                "Md5": "",
                "Sha1": "",
                "Sha256": digest_of(bytes).to_hex(),
                "Size": size,
                "IsSigned": true,
            }),
        )
        .await
    }

    async fn upload(&self, agent: &Agent, name: &str, bytes: &[u8]) -> (StatusCode, String) {
        let body = multipart_body(&[
            upload_metadata(agent),
            Part::File(name.to_string(), bytes.to_vec()),
        ]);
        self.post_multipart("/uploadFile", body).await
    }

    async fn post_multipart(&self, path: &str, body: Vec<u8>) -> (StatusCode, String) {
        let request = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(
                CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .expect("request");
        let (status, body) = self.send(request).await;
        (status, String::from_utf8(body.to_vec()).expect("utf-8 body"))
    }

    async fn executable(&self, bytes: &[u8]) -> Option<ContentRecord> {
        self.store()
            .find_content(ContentKind::Executable, &digest_of(bytes))
            .await
            .expect("find content")
    }

    fn scratch_entries(&self) -> usize {
        std::fs::read_dir(self.dir.path().join("scratch"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

enum Part {
    Field(Vec<u8>),
    File(String, Vec<u8>),
}

fn upload_metadata(agent: &Agent) -> Part {
    let metadata = json!({
        "SystemUUID": agent.system_uuid,
        "CustomerUUID": agent.tenant_uuid,
        "FileType": "exe",
    });
    Part::Field(metadata.to_string().into_bytes())
}

fn multipart_body(parts: &[Part]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match part {
            Part::Field(value) => {
                body.extend_from_slice(b"Content-Disposition: form-data; name=\"metadata\"\r\n\r\n");
                body.extend_from_slice(value);
            }
            Part::File(name, bytes) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"file\"; filename=\"{name}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n"
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(bytes);
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn digest_of(bytes: &[u8]) -> Sha256Digest {
    Sha256Digest::from_bytes(Sha256::digest(bytes).into())
}

fn fetch_command(bytes: &[u8]) -> Value {
    json!({
        "Command": "GetFileByHash",
        "Arguments": { "Sha256": digest_of(bytes).to_hex() },
    })
}

#[tokio::test]
async fn new_binary_is_requested_on_the_next_idle_poll() {
    let h = Harness::new().await;
    let agent = h.register(h.tenant).await;

    let (status, body) = h.process_event(&agent, NOTEPAD).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, SUCCESS);

    let (status, body) = h.heartbeat(&agent).await;
    assert_eq!(status, StatusCode::OK);
    let reply: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(reply, fetch_command(NOTEPAD));

    let (status, body) = h.heartbeat(&agent).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, NOP);

    let record = h.executable(NOTEPAD).await.expect("content row");
    assert_eq!(record.size, NOTEPAD.len() as i64);
    assert_eq!(record.uploaded_at, None);
}

#[tokio::test]
async fn verified_upload_is_stored_once_and_queued_once() {
    let h = Harness::new().await;
    let agent = h.register(h.tenant).await;
    h.process_event(&agent, NOTEPAD).await;
    h.heartbeat(&agent).await;

    let name = digest_of(NOTEPAD).to_hex();
    let (status, body) = h.upload(&agent, &name, NOTEPAD).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, NOP);

    let first = h.executable(NOTEPAD).await.expect("content row");
    assert!(first.uploaded_at.is_some());
    assert!(first.queued_at.is_some());
    assert!(h
        .blobs
        .exists(ContentKind::Executable, &digest_of(NOTEPAD))
        .await
        .unwrap());

    let (status, _) = h.upload(&agent, &name, NOTEPAD).await;
    assert_eq!(status, StatusCode::OK);

    let second = h.executable(NOTEPAD).await.expect("content row");
    assert_eq!(second.id, first.id);
    assert_eq!(second.uploaded_at, first.uploaded_at);
    assert_eq!(
        h.queue.published().await,
        vec![AnalysisJob::new(ContentKind::Executable, first.id)]
    );
    assert_eq!(h.scratch_entries(), 0);
}

#[tokio::test]
async fn upload_whose_bytes_do_not_match_its_name_is_rejected() {
    let h = Harness::new().await;
    let agent = h.register(h.tenant).await;
    h.process_event(&agent, NOTEPAD).await;

    let (status, body) = h
        .upload(&agent, &digest_of(NOTEPAD).to_hex(), CALC)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.is_empty());

    let record = h.executable(NOTEPAD).await.expect("content row");
    assert_eq!(record.uploaded_at, None);
    assert!(!h
        .blobs
        .exists(ContentKind::Executable, &digest_of(NOTEPAD))
        .await
        .unwrap());
    assert!(h.queue.published().await.is_empty());
    // Kept for inspection.
    assert_eq!(h.scratch_entries(), 1);
}

#[tokio::test]
async fn upload_of_an_unreported_binary_changes_nothing() {
    let h = Harness::new().await;
    let agent = h.register(h.tenant).await;

    let (status, body) = h.upload(&agent, &digest_of(CALC).to_hex(), CALC).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.is_empty());
    assert!(h.executable(CALC).await.is_none());
    assert!(h.queue.published().await.is_empty());
}

#[tokio::test]
async fn upload_names_must_be_lowercase_digests() {
    let h = Harness::new().await;
    let agent = h.register(h.tenant).await;
    h.process_event(&agent, NOTEPAD).await;

    let upper = digest_of(NOTEPAD).to_hex().to_uppercase();
    let (status, _) = h.upload(&agent, &upper, NOTEPAD).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(h.scratch_entries(), 0);
}

#[tokio::test]
async fn file_part_before_metadata_is_rejected() {
    let h = Harness::new().await;
    let agent = h.register(h.tenant).await;
    h.process_event(&agent, NOTEPAD).await;

    let body = multipart_body(&[
        Part::File(digest_of(NOTEPAD).to_hex(), NOTEPAD.to_vec()),
        upload_metadata(&agent),
    ]);
    let (status, _) = h.post_multipart("/uploadFile", body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(h.executable(NOTEPAD).await.unwrap().uploaded_at, None);
}

#[tokio::test]
async fn upload_with_two_file_parts_is_rejected() {
    let h = Harness::new().await;
    let agent = h.register(h.tenant).await;
    h.process_event(&agent, NOTEPAD).await;

    let name = digest_of(NOTEPAD).to_hex();
    let body = multipart_body(&[
        upload_metadata(&agent),
        Part::File(name.clone(), NOTEPAD.to_vec()),
        Part::File(name, NOTEPAD.to_vec()),
    ]);
    let (status, body) = h.post_multipart("/uploadFile", body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.is_empty());
    assert_eq!(h.executable(NOTEPAD).await.unwrap().uploaded_at, None);
    assert!(h.queue.published().await.is_empty());
    assert_eq!(h.scratch_entries(), 0);
}

#[tokio::test]
async fn upload_without_a_file_part_is_rejected() {
    let h = Harness::new().await;
    let agent = h.register(h.tenant).await;
    h.process_event(&agent, NOTEPAD).await;

    let body = multipart_body(&[upload_metadata(&agent)]);
    let (status, body) = h.post_multipart("/uploadFile", body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.is_empty());
    assert_eq!(h.executable(NOTEPAD).await.unwrap().uploaded_at, None);
    assert_eq!(h.scratch_entries(), 0);
}

#[tokio::test]
async fn upload_over_the_size_cap_is_rejected_and_discarded() {
    let h = Harness::with_upload_limit(64).await;
    let agent = h.register(h.tenant).await;

    // Over the cap but inside the multipart headroom: cut off while streaming.
    let large = vec![0x4d; 100];
    h.process_event(&agent, &large).await;
    let (status, body) = h.upload(&agent, &digest_of(&large).to_hex(), &large).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.is_empty());
    assert_eq!(h.executable(&large).await.unwrap().uploaded_at, None);

    // Past the request body limit altogether.
    let huge = vec![0x5a; 256 * 1024];
    h.process_event(&agent, &huge).await;
    let (status, body) = h.upload(&agent, &digest_of(&huge).to_hex(), &huge).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.is_empty());
    assert_eq!(h.executable(&huge).await.unwrap().uploaded_at, None);

    assert!(h.queue.published().await.is_empty());
    assert_eq!(h.scratch_entries(), 0);
}

#[tokio::test]
async fn upload_whose_size_differs_from_the_report_is_rejected() {
    let h = Harness::new().await;
    let agent = h.register(h.tenant).await;
    h.process_event_reporting(&agent, NOTEPAD, NOTEPAD.len() + 1)
        .await;

    let (status, body) = h
        .upload(&agent, &digest_of(NOTEPAD).to_hex(), NOTEPAD)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.is_empty());

    let record = h.executable(NOTEPAD).await.expect("content row");
    assert_eq!(record.uploaded_at, None);
    assert_eq!(record.queued_at, None);
    assert!(!h
        .blobs
        .exists(ContentKind::Executable, &digest_of(NOTEPAD))
        .await
        .unwrap());
    assert_eq!(h.scratch_entries(), 1);
}

#[tokio::test]
async fn queue_outage_is_recovered_by_the_next_upload() {
    let h = Harness::new().await;
    let agent = h.register(h.tenant).await;
    h.process_event(&agent, NOTEPAD).await;
    h.heartbeat(&agent).await;
    let name = digest_of(NOTEPAD).to_hex();

    h.queue.set_unavailable(true).await;
    let (status, _) = h.upload(&agent, &name, NOTEPAD).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let record = h.executable(NOTEPAD).await.unwrap();
    assert!(record.uploaded_at.is_some());
    assert_eq!(record.queued_at, None);

    h.queue.set_unavailable(false).await;
    let (status, _) = h.upload(&agent, &name, NOTEPAD).await;
    assert_eq!(status, StatusCode::OK);
    let record = h.executable(NOTEPAD).await.unwrap();
    assert!(record.queued_at.is_some());
    assert_eq!(h.queue.published().await.len(), 1);
}

#[tokio::test]
async fn identity_must_match_the_claimed_tenant() {
    let h = Harness::new().await;
    let agent = h.register(h.tenant).await;

    let other_tenant = Uuid::new_v4();
    h.store()
        .insert_tenant(other_tenant, "globex", unix_now())
        .await
        .unwrap();
    let impostor = Agent {
        system_uuid: agent.system_uuid.clone(),
        tenant_uuid: other_tenant.to_string(),
    };

    let (status, body) = h.heartbeat(&impostor).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.is_empty());

    let (status, _) = h.process_event(&impostor, NOTEPAD).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(h.executable(NOTEPAD).await.is_none());

    let garbled = Agent {
        system_uuid: "not-a-uuid".to_string(),
        tenant_uuid: agent.tenant_uuid.clone(),
    };
    let (status, _) = h.heartbeat(&garbled).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = h.heartbeat(&agent).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn registration_for_an_unknown_tenant_is_rejected() {
    let h = Harness::new().await;
    let (status, body) = h
        .post_json(
            "/register",
            json!({ "CustomerUUID": Uuid::new_v4().to_string() }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.is_empty());
}

#[tokio::test]
async fn only_the_first_reporter_is_asked_for_the_bytes() {
    let h = Harness::new().await;
    let first = h.register(h.tenant).await;
    let second = h.register(h.tenant).await;
    assert_ne!(first.system_uuid, second.system_uuid);

    assert_eq!(h.process_event(&first, NOTEPAD).await.1, SUCCESS);
    assert_eq!(h.process_event(&second, NOTEPAD).await.1, SUCCESS);

    assert!(h.executable(NOTEPAD).await.is_some());
    assert_eq!(h.heartbeat(&second).await.1, NOP);
    let reply: Value = serde_json::from_str(&h.heartbeat(&first).await.1).unwrap();
    assert_eq!(reply, fetch_command(NOTEPAD));
}

#[tokio::test]
async fn catalog_events_request_catalog_uploads() {
    let h = Harness::new().await;
    let agent = h.register(h.tenant).await;
    let now = unix_now();
    let digest = digest_of(b"catalog bytes");

    let (status, body) = h
        .post_json(
            "/catalogFileEvent",
            json!({
                "SystemUUID": agent.system_uuid,
                "CustomerUUID": agent.tenant_uuid,
                "CurrentClientTime": now,
                "TimeOfEvent": now,
                "Path": "C:\\Windows\\System32\\CatRoot\\nt5.cat",
                "Sha256": digest.to_hex(),
                "Size": 13,
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, SUCCESS);

    let (_, body) = h.heartbeat(&agent).await;
    let reply: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(reply["Command"], "GetCatalogFileByHash");
    assert_eq!(reply["Arguments"]["Sha256"], digest.to_hex());
}

#[tokio::test]
async fn malformed_events_are_rejected_without_side_effects() {
    let h = Harness::new().await;
    let agent = h.register(h.tenant).await;

    let (status, body) = h
        .post_json(
            "/processEvent",
            json!({
                "SystemUUID": agent.system_uuid,
                "CustomerUUID": agent.tenant_uuid,
                "CurrentClientTime": unix_now(),
                "TimeOfEvent": unix_now(),
                "Sha256": "not hex",
                "Size": 4,
            }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.is_empty());
    assert_eq!(h.heartbeat(&agent).await.1, NOP);
}

#[tokio::test]
async fn update_is_served_as_raw_bytes() {
    let h = Harness::new().await;
    let agent = h.register(h.tenant).await;
    h.store().insert_update("1.0.0", "1.2.0").await.unwrap();
    h.store().insert_update("1.0.0", "1.1.0").await.unwrap();
    let updates = h.dir.path().join("updates");
    std::fs::create_dir_all(&updates).unwrap();
    std::fs::write(updates.join("update-1.0.0-1.1.0.exe"), b"installer-1.1.0").unwrap();

    let request = |version: &str| {
        json!({
            "SystemUUID": agent.system_uuid,
            "CustomerUUID": agent.tenant_uuid,
            "CurrentClientTime": unix_now(),
            "Version": version,
        })
    };

    let (status, body) = h.post_json("/getUpdate", request("1.0.0")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "installer-1.1.0");

    for version in ["1.1.0", "../1.0.0", ""] {
        let (status, body) = h.post_json("/getUpdate", request(version)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{version}");
        assert!(body.is_empty());
    }
}

#[tokio::test]
async fn legacy_paths_reach_the_same_handlers() {
    let h = Harness::new().await;
    let agent = h.register(h.tenant).await;

    let (status, body) = h
        .post_json(
            "/api/v1/Heartbeat",
            json!({
                "SystemUUID": agent.system_uuid,
                "CustomerUUID": agent.tenant_uuid,
                "CurrentClientTime": unix_now(),
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, NOP);
}

#[tokio::test]
async fn health_check_returns_the_banner() {
    let h = Harness::new().await;
    let request = Request::builder()
        .uri("/")
        .body(Body::empty())
        .expect("request");
    let (status, body) = h.send(request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8(body.to_vec())
        .unwrap()
        .starts_with("callback-server "));
}
