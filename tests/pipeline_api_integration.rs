//! Integration tests for the pipeline REST + WebSocket API.
//!
//! Each test spins up an Axum server on a random port backed by an
//! in-memory libSQL store and drives it through `RemotePipelineStore` and
//! tokio-tungstenite.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use pipeline_board::api::pipeline_routes;
use pipeline_board::error::StoreError;
use pipeline_board::pipeline::{PipelineRecord, Stage, StageTransition, TriggeredBy};
use pipeline_board::store::{LibSqlBackend, PipelineStore, RemotePipelineStore};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// libSQL store whose snapshot reads can be switched off.
struct FlakySnapshots {
    inner: LibSqlBackend,
    down: AtomicBool,
}

#[async_trait]
impl PipelineStore for FlakySnapshots {
    async fn get_all(&self) -> Result<Vec<PipelineRecord>, StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("snapshot read timed out".into()));
        }
        self.inner.get_all().await
    }

    async fn get_by_stage(&self, stage: Stage) -> Result<Vec<PipelineRecord>, StoreError> {
        self.inner.get_by_stage(stage).await
    }

    async fn get(&self, thread_id: &str) -> Result<Option<PipelineRecord>, StoreError> {
        self.inner.get(thread_id).await
    }

    async fn set_stage(
        &self,
        thread_id: &str,
        stage: Stage,
        triggered_by: TriggeredBy,
    ) -> Result<PipelineRecord, StoreError> {
        self.inner.set_stage(thread_id, stage, triggered_by).await
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<bool, StoreError> {
        self.inner.delete_thread(thread_id).await
    }

    async fn transitions(&self, thread_id: &str) -> Result<Vec<StageTransition>, StoreError> {
        self.inner.transitions(thread_id).await
    }
}

/// Start an Axum server on a random port, return (port, remote client).
async fn start_server() -> (u16, RemotePipelineStore) {
    let store: Arc<dyn PipelineStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    serve(store).await
}

async fn serve(store: Arc<dyn PipelineStore>) -> (u16, RemotePipelineStore) {
    let app = pipeline_routes(store);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (port, RemotePipelineStore::new(format!("http://127.0.0.1:{port}")))
}

/// Parse a WS text frame into a serde_json::Value.
fn parse_ws_json(msg: &Message) -> Value {
    match msg {
        Message::Text(txt) => serde_json::from_str(txt).expect("invalid JSON from server"),
        other => panic!("expected Text frame, got {:?}", other),
    }
}

// ── REST Tests ───────────────────────────────────────────────────────

#[tokio::test]
async fn set_stage_then_get_all_over_http() {
    timeout(TEST_TIMEOUT, async {
        let (_port, remote) = start_server().await;

        assert!(remote.get_all().await.unwrap().is_empty());

        let record = remote
            .set_stage("thread-1", Stage::Billing, TriggeredBy::QuickAction)
            .await
            .unwrap();
        assert_eq!(record.stage, Stage::Billing);

        remote
            .set_stage("thread-1", Stage::Done, TriggeredBy::User)
            .await
            .unwrap();

        let all = remote.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].stage, Stage::Done);
        assert_eq!(all[0].triggered_by, TriggeredBy::User);

        let log = remote.transitions("thread-1").await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].from_stage, None);
        assert_eq!(log[1].from_stage, Some(Stage::Billing));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn stage_filter_and_single_get() {
    timeout(TEST_TIMEOUT, async {
        let (_port, remote) = start_server().await;
        remote
            .set_stage("a", Stage::Scheduled, TriggeredBy::System)
            .await
            .unwrap();
        remote
            .set_stage("b", Stage::Done, TriggeredBy::User)
            .await
            .unwrap();

        let scheduled = remote.get_by_stage(Stage::Scheduled).await.unwrap();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].thread_id, "a");

        assert!(remote.get("b").await.unwrap().is_some());
        assert!(remote.get("missing").await.unwrap().is_none());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn delete_thread_over_http() {
    timeout(TEST_TIMEOUT, async {
        let (_port, remote) = start_server().await;
        remote
            .set_stage("gone", Stage::Billing, TriggeredBy::User)
            .await
            .unwrap();

        assert!(remote.delete_thread("gone").await.unwrap());
        assert!(!remote.delete_thread("gone").await.unwrap());
        assert!(remote.get_all().await.unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn invalid_thread_id_is_a_bad_request() {
    timeout(TEST_TIMEOUT, async {
        let (port, _remote) = start_server().await;

        let resp = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{port}/api/pipeline/stage"))
            .json(&serde_json::json!({"threadId": "", "stage": "done"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["retryable"], false);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unknown_stage_is_rejected() {
    timeout(TEST_TIMEOUT, async {
        let (port, remote) = start_server().await;

        let resp = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{port}/api/pipeline/stage"))
            .json(&serde_json::json!({"threadId": "t1", "stage": "archived"}))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
        assert!(remote.get_all().await.unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unreachable_server_is_retryable() {
    let remote = RemotePipelineStore::new("http://127.0.0.1:1");
    let err = remote
        .set_stage("t1", Stage::Done, TriggeredBy::User)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Unavailable(_)));
    assert!(err.is_retryable());
}

// ── WebSocket Tests ──────────────────────────────────────────────────

#[tokio::test]
async fn ws_connect_receives_snapshot() {
    timeout(TEST_TIMEOUT, async {
        let (port, remote) = start_server().await;
        remote
            .set_stage("t1", Stage::AwaitingReply, TriggeredBy::QuickAction)
            .await
            .unwrap();

        let (mut ws, _resp) = connect_async(format!("ws://127.0.0.1:{port}/ws"))
            .await
            .expect("WS connect failed");

        let msg = ws.next().await.unwrap().unwrap();
        let json = parse_ws_json(&msg);
        assert_eq!(json["type"], "records_sync");
        let records = json["records"].as_array().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["threadId"], "t1");
        assert_eq!(records[0]["stage"], "awaiting_reply");
        assert_eq!(records[0]["triggeredBy"], "quick_action");
        assert!(json["asOf"].is_string());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_streams_stage_set_and_delete() {
    timeout(TEST_TIMEOUT, async {
        let (port, remote) = start_server().await;

        let (mut ws, _resp) = connect_async(format!("ws://127.0.0.1:{port}/ws"))
            .await
            .expect("WS connect failed");
        let sync = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(sync["type"], "records_sync");

        remote
            .set_stage("t9", Stage::Scheduled, TriggeredBy::User)
            .await
            .unwrap();
        let set = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(set["type"], "stage_set");
        assert_eq!(set["record"]["threadId"], "t9");
        assert_eq!(set["record"]["stage"], "scheduled");

        remote.delete_thread("t9").await.unwrap();
        let deleted = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(deleted["type"], "thread_deleted");
        assert_eq!(deleted["threadId"], "t9");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_snapshot_failure_sends_no_records() {
    timeout(TEST_TIMEOUT, async {
        let store = Arc::new(FlakySnapshots {
            inner: LibSqlBackend::new_memory().await.unwrap(),
            down: AtomicBool::new(false),
        });
        let (port, remote) = serve(store.clone()).await;
        remote
            .set_stage("t1", Stage::Done, TriggeredBy::User)
            .await
            .unwrap();
        store.down.store(true, Ordering::SeqCst);

        let (mut ws, _resp) = connect_async(format!("ws://127.0.0.1:{port}/ws"))
            .await
            .expect("WS connect failed");
        let first = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(first["type"], "sync_failed");
        assert_eq!(first["retryable"], true);
        assert!(first.get("records").is_none());

        // Live events still flow after the failed snapshot.
        remote
            .set_stage("t2", Stage::Billing, TriggeredBy::User)
            .await
            .unwrap();
        let set = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(set["type"], "stage_set");
        assert_eq!(set["record"]["threadId"], "t2");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn missing_thread_maps_to_not_found_for_that_thread() {
    timeout(TEST_TIMEOUT, async {
        let (_port, remote) = start_server().await;
        assert!(remote.get("never-set").await.unwrap().is_none());
        assert!(!remote.delete_thread("never-set").await.unwrap());
    })
    .await
    .expect("test timed out");
}
