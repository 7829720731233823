//! Read and write fallbacks of the API proxy

use assert_matches::assert_matches;
use chrono::{Duration as ChronoDuration, Utc};
use pretty_assertions::assert_eq;
use reliefsync::client::{OfflineClient, ResponseSource};
use reliefsync::shared::model::{CachedResponse, HttpMethod, LocalEntity};
use reliefsync::shared::{SyncConfig, SyncError, SyncEvent};
use serde_json::json;

use crate::common::*;

#[tokio::test]
async fn test_successful_read_is_served_from_cache_when_offline() {
    let server = start_backend().await;
    mount_json(&server, "GET", "/tasks", 200, json!([{"id": "1", "status": "open"}])).await;

    let client = offline_client(&server.uri(), true).await;
    let online = client.proxy().get("/tasks").await.unwrap();
    assert_eq!(online.source, ResponseSource::Network);

    client.network().set_online(false);
    let offline = client.proxy().get("/tasks").await.unwrap();
    assert_eq!(offline.source, ResponseSource::Cache);
    assert_eq!(offline.body, online.body);
}

#[tokio::test]
async fn test_server_error_falls_back_to_cache() {
    let server = start_backend().await;
    mount_status(&server, "GET", "/budgets", 503).await;

    let client = offline_client(&server.uri(), true).await;
    client
        .outbox()
        .unwrap()
        .store()
        .put(&CachedResponse::new("/budgets", json!([{"id": "b1"}])))
        .await
        .unwrap();

    let response = client.proxy().get("/budgets").await.unwrap();
    assert_eq!(response.source, ResponseSource::Cache);
    assert_eq!(response.body[0]["id"], "b1");
}

#[tokio::test]
async fn test_stale_cache_is_a_miss() {
    let config = SyncConfig::builder()
        .server_url("http://127.0.0.1:9")
        .cache_ttl_secs(60)
        .build()
        .unwrap();
    let client = offline_client_with(config, false).await;
    let store = client.outbox().unwrap().store();

    let mut fresh = CachedResponse::new("/needs", json!(["fresh"]));
    fresh.fetched_at = Utc::now() - ChronoDuration::seconds(59);
    store.put(&fresh).await.unwrap();
    assert_eq!(client.proxy().get("/needs").await.unwrap().source, ResponseSource::Cache);

    let mut stale = CachedResponse::new("/needs", json!(["stale"]));
    stale.fetched_at = Utc::now() - ChronoDuration::seconds(61);
    store.put(&stale).await.unwrap();
    assert_matches!(
        client.proxy().get("/needs").await,
        Err(SyncError::UnavailableOffline { ref endpoint }) if endpoint == "/needs"
    );
}

#[tokio::test]
async fn test_member_read_falls_back_to_local_entity() {
    let client = offline_client("http://127.0.0.1:9", false).await;
    client.proxy().put("/tasks/5", json!({"title": "Deliver water", "status": "open"})).await.unwrap();

    let response = client.proxy().get("/tasks/5").await.unwrap();
    assert_eq!(response.source, ResponseSource::LocalData);
    assert_eq!(response.body["id"], "5");
    assert_eq!(response.body["is_local_only"], true);
    assert_eq!(response.body["title"], "Deliver water");
}

#[tokio::test]
async fn test_offline_patch_overlays_local_entity() {
    let client = offline_client("http://127.0.0.1:9", false).await;
    client
        .outbox()
        .unwrap()
        .store()
        .put(&LocalEntity::confirmed("tasks", "5", json!({"title": "Deliver water", "status": "open"})))
        .await
        .unwrap();

    let response = client.proxy().patch("/tasks/5", json!({"status": "done"})).await.unwrap();
    assert!(response.is_provisional());
    assert_eq!(response.body["title"], "Deliver water");
    assert_eq!(response.body["status"], "done");

    let pending = client.outbox().unwrap().list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].method, HttpMethod::Patch);
    assert_eq!(pending[0].payload, json!({"status": "done"}));
    assert_eq!(pending[0].entity_key, "tasks:5");
}

#[tokio::test]
async fn test_offline_delete_removes_entity_and_queues() {
    let client = offline_client("http://127.0.0.1:9", false).await;
    let store = client.outbox().unwrap().store();
    store
        .put(&LocalEntity::confirmed("volunteers", "v7", json!({"name": "Ana"})))
        .await
        .unwrap();

    let response = client.proxy().delete("/volunteers/v7").await.unwrap();
    assert!(response.is_provisional());
    assert_eq!(response.body, json!({"id": "v7", "is_local_only": true}));

    let remaining: Option<LocalEntity> = store.get("volunteers:v7").await.unwrap();
    assert!(remaining.is_none());
    let pending = client.outbox().unwrap().list_pending().await.unwrap();
    assert_eq!(pending[0].method, HttpMethod::Delete);
}

#[tokio::test]
async fn test_online_write_is_confirmed_directly() {
    let server = start_backend().await;
    mount_json(&server, "POST", "/needs", 201, json!({"id": "n-5", "title": "Medicine"})).await;

    let client = offline_client(&server.uri(), true).await;
    let response = client.proxy().post("/needs", json!({"title": "Medicine"})).await.unwrap();

    assert_eq!(response.source, ResponseSource::Network);
    assert_eq!(response.action_id, None);
    assert_eq!(client.outbox().unwrap().count_pending().await.unwrap(), 0);

    let entity: LocalEntity = client
        .outbox()
        .unwrap()
        .store()
        .get("needs:n-5")
        .await
        .unwrap()
        .expect("confirmed entity stored");
    assert!(!entity.is_local_only);
}

#[tokio::test]
async fn test_rejected_read_is_not_masked_by_cache() {
    let server = start_backend().await;
    mount_json(&server, "GET", "/reports/9", 404, json!({"error": "not found"})).await;

    let client = offline_client(&server.uri(), true).await;
    client
        .outbox()
        .unwrap()
        .store()
        .put(&CachedResponse::new("/reports/9", json!({"id": "9"})))
        .await
        .unwrap();

    assert_matches!(
        client.proxy().get("/reports/9").await,
        Err(SyncError::Rejected { status: 404, .. })
    );
}

#[tokio::test]
async fn test_unopenable_store_degrades_to_online_only() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"occupied").unwrap();

    let config = SyncConfig::builder()
        .server_url("http://127.0.0.1:9")
        .data_dir(&blocker)
        .build()
        .unwrap();
    let client = OfflineClient::open(config).await.unwrap();

    assert!(!client.is_offline_capable());
    assert!(client.orchestrator().is_none());
    assert!(client.mirror().is_none());
    assert!(client.store_unavailable_reason().is_some());

    // Reported to subscribers once the background loops start
    let mut events = client.events().subscribe();
    client.spawn_background();
    assert_matches!(events.recv().await, Ok(SyncEvent::StoreUnavailable { .. }));

    client.network().set_online(false);
    assert_matches!(
        client.proxy().post("/needs", json!({})).await,
        Err(SyncError::UnavailableOffline { .. })
    );
}
