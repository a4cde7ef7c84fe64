use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tempfile::tempdir;
use tower::util::ServiceExt;

use eventsync_core::config::{EndpointConfig, SyncConfiguration};
use eventsync_core::errors::{Error, Result};
use eventsync_core::ledger::SyncLedgerTrait;
use eventsync_core::records::{
    EventFilter, ExternalEventClientTrait, ExternalRecord, ExternalRecordPatch, InternalRecord,
    InternalRecordClientTrait, InternalRecordFilter, InternalRecordPatch,
};
use eventsync_storage_sqlite::db::{spawn_writer, DbPool};
use eventsync_storage_sqlite::{create_pool, init, run_migrations, SqliteSyncLedger};

use super::app_router;
use crate::main_lib::AppState;

#[derive(Default)]
struct StaticSystemA {
    events: Vec<ExternalRecord>,
}

#[async_trait]
impl ExternalEventClientTrait for StaticSystemA {
    async fn list_events(&self, _filter: &EventFilter) -> Result<Vec<ExternalRecord>> {
        Ok(self.events.clone())
    }

    async fn get_event(&self, id: &str) -> Result<ExternalRecord> {
        self.events
            .iter()
            .find(|event| event.id == id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("Event {}", id)))
    }

    async fn update_event(&self, _id: &str, _patch: &ExternalRecordPatch) -> Result<()> {
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSystemB {
    created: Mutex<Vec<InternalRecordPatch>>,
}

#[async_trait]
impl InternalRecordClientTrait for RecordingSystemB {
    async fn list_records(&self, _filter: &InternalRecordFilter) -> Result<Vec<InternalRecord>> {
        Ok(Vec::new())
    }

    async fn create_record(&self, patch: &InternalRecordPatch) -> Result<String> {
        let mut created = self.created.lock().unwrap();
        created.push(patch.clone());
        Ok(format!("I{}", created.len()))
    }

    async fn update_record(&self, _id: &str, _patch: &InternalRecordPatch) -> Result<()> {
        Ok(())
    }

    async fn delete_record(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Err(Error::connection("operations API unreachable"))
    }
}

fn gala(id: &str) -> ExternalRecord {
    serde_json::from_value(json!({
        "id": id,
        "lastModified": "2025-05-01T10:00:00Z",
        "fields": { "event_name": "Gala", "event_date": "2025-06-01", "guest_count": 100 }
    }))
    .unwrap()
}

fn config() -> SyncConfiguration {
    SyncConfiguration::new(
        "org-1",
        EndpointConfig::new("https://crm.example.com"),
        EndpointConfig::new("https://ops.example.com"),
    )
    .with_max_retries(2)
    .with_retry_delays(1, 2)
}

struct TestApp {
    router: Router,
    system_b: Arc<RecordingSystemB>,
}

async fn test_app(events: Vec<ExternalRecord>) -> TestApp {
    let app_data = tempdir().unwrap().keep();
    let db_path = init(app_data.to_str().unwrap()).unwrap();
    run_migrations(&db_path).unwrap();
    let pool: Arc<DbPool> = create_pool(&db_path).unwrap();
    let writer = spawn_writer(pool.as_ref().clone());
    let ledger: Arc<dyn SyncLedgerTrait> = Arc::new(SqliteSyncLedger::new(pool, writer, "org-1"));

    let system_b = Arc::new(RecordingSystemB::default());
    let state = AppState::start(
        config(),
        Arc::new(StaticSystemA { events }),
        system_b.clone(),
        ledger,
    )
    .await
    .unwrap();

    TestApp {
        router: app_router(state),
        system_b,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn webhook(source: &str, record_id: &str) -> Value {
    json!({
        "event_id": "evt-1",
        "source_system": source,
        "event_type": "updated",
        "record_id": record_id,
        "timestamp": "2025-05-01T10:00:00Z"
    })
}

#[tokio::test]
async fn healthz_is_ok() {
    let app = test_app(Vec::new()).await;
    let (status, body) = send(&app.router, get("/healthz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn trigger_runs_a_batch_and_records_operations() {
    let app = test_app(vec![gala("E1")]).await;

    let (status, body) = send(&app.router, post_json("/v1/sync/trigger", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["counts"]["created"], 1);
    assert_eq!(app.system_b.created.lock().unwrap().len(), 1);

    let (status, body) = send(&app.router, get("/v1/operations?status=completed")).await;
    assert_eq!(status, StatusCode::OK);
    let operations = body.as_array().unwrap();
    assert_eq!(operations.len(), 1);
    assert_eq!(operations[0]["sourceId"], "E1");
}

#[tokio::test]
async fn status_reports_unreachable_collaborator() {
    let app = test_app(Vec::new()).await;

    let (status, body) = send(&app.router, get("/v1/sync/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["organizationId"], "org-1");
    assert_eq!(body["systemA"]["connected"], true);
    assert_eq!(body["systemB"]["connected"], false);
}

#[tokio::test]
async fn cancel_without_running_batch_is_a_no_op() {
    let app = test_app(Vec::new()).await;
    let (status, body) = send(&app.router, post_json("/v1/sync/cancel", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelRequested"], false);
}

#[tokio::test]
async fn webhook_source_must_match_path() {
    let app = test_app(vec![gala("E1")]).await;

    let (status, body) = send(
        &app.router,
        post_json("/v1/webhooks/system_b", webhook("system_a", "E1")),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "validation");

    let (status, _) = send(
        &app.router,
        post_json("/v1/webhooks/system_c", webhook("system_a", "E1")),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn inline_webhook_returns_outcome() {
    let app = test_app(vec![gala("E1")]).await;

    let (status, body) = send(
        &app.router,
        post_json("/v1/webhooks/system_a", webhook("system_a", "E1")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "created");

    let (status, body) = send(
        &app.router,
        post_json("/v1/webhooks/system_a", webhook("system_a", "E1")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "duplicate");
}

#[tokio::test]
async fn async_webhook_is_queued() {
    let app = test_app(vec![gala("E1")]).await;

    let (status, body) = send(
        &app.router,
        post_json("/v1/webhooks/system_a?mode=async", webhook("system_a", "E1")),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "queued");
    assert_eq!(body["eventId"], "evt-1");
}

#[tokio::test]
async fn conflicts_listing_and_unknown_resolution() {
    let app = test_app(Vec::new()).await;

    let (status, body) = send(&app.router, get("/v1/conflicts")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let (status, body) = send(
        &app.router,
        post_json("/v1/conflicts/missing/resolve", json!({ "policy": "source_wins" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn operations_query_is_validated() {
    let app = test_app(Vec::new()).await;

    let (status, _) = send(&app.router, get("/v1/operations?status=bogus")).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = send(&app.router, get("/v1/operations?limit=0")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn config_can_be_replaced_for_the_same_organization() {
    let app = test_app(Vec::new()).await;

    let mut updated = serde_json::to_value(config()).unwrap();
    updated["direction"] = json!("a_to_b");
    let request = Request::builder()
        .method("PUT")
        .uri("/v1/config")
        .header("content-type", "application/json")
        .body(Body::from(updated.to_string()))
        .unwrap();
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["direction"], "a_to_b");

    let (_, body) = send(&app.router, get("/v1/config")).await;
    assert_eq!(body["direction"], "a_to_b");

    let mut other_org = updated.clone();
    other_org["organizationId"] = json!("org-2");
    let request = Request::builder()
        .method("PUT")
        .uri("/v1/config")
        .header("content-type", "application/json")
        .body(Body::from(other_org.to_string()))
        .unwrap();
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "configuration");
}
