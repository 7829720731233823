//! Outbox replay through the sync orchestrator

use pretty_assertions::assert_eq;
use reliefsync::client::local_store::LocalStore;
use reliefsync::client::sync::{SyncOutcome, SyncPhase};
use reliefsync::client::transport::IDEMPOTENCY_HEADER;
use reliefsync::client::{OfflineClient, ResponseSource};
use reliefsync::shared::event::SyncEvent;
use reliefsync::shared::model::{ActionKind, DropReason, HttpMethod, LocalEntity, SpeedClass};
use serde_json::{json, Value};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use crate::common::*;

fn store(client: &OfflineClient) -> &LocalStore {
    client.outbox().expect("offline capable").store()
}

async fn sync(client: &OfflineClient) -> reliefsync::client::sync::CycleReport {
    let outcome = crate::assert_ok!(client.orchestrator().expect("orchestrator").sync_now().await);
    match outcome {
        SyncOutcome::Completed(report) => report,
        other => panic!("expected a completed cycle, got {:?}", other),
    }
}

#[tokio::test]
async fn test_offline_create_then_drain_on_reconnect() {
    let server = start_backend().await;
    mount_json(&server, "POST", "/needs", 201, json!({"id": "n-1", "title": "Water"})).await;
    mount_json(&server, "GET", "/needs", 200, json!([{"id": "n-1", "title": "Water"}])).await;

    let client = offline_client(&server.uri(), false).await;

    // Offline write comes back provisional with one queued action
    let response = crate::assert_ok!(client.proxy().post("/needs", json!({"title": "Water"})).await);
    assert!(response.is_provisional());
    assert_eq!(response.body["is_local_only"], true);

    let pending = client.outbox().unwrap().list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].target, "/needs");
    assert_eq!(pending[0].method, HttpMethod::Post);
    assert!(received(&server).await.is_empty());

    // Reconnect and drain
    client.network().set_online(true);
    let report = sync(&client).await;
    assert_eq!(report.delivered, 1);
    assert_eq!(report.remaining, 0);
    assert_eq!(client.outbox().unwrap().count_pending().await.unwrap(), 0);

    // The provisional entity was swapped for the confirmed one
    let needs: Vec<LocalEntity> = store(&client)
        .get_by_index("entity_type", &json!("needs"))
        .await
        .unwrap();
    assert_eq!(needs.len(), 1);
    assert_eq!(needs[0].id, "n-1");
    assert!(!needs[0].is_local_only);

    let read = client.proxy().get("/needs").await.unwrap();
    assert_eq!(read.source, ResponseSource::Network);
    assert_eq!(read.body[0]["id"], "n-1");
    assert!(read.body[0].get("is_local_only").is_none());
}

#[tokio::test]
async fn test_replay_reuses_idempotency_key_of_direct_attempt() {
    let server = start_backend().await;
    Mock::given(method("POST"))
        .and(path("/reports"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_json(&server, "POST", "/reports", 201, json!({"id": "r-9"})).await;

    let client = offline_client(&server.uri(), true).await;

    let response = client.proxy().post("/reports", json!({"summary": "Bridge out"})).await.unwrap();
    assert!(response.is_provisional());

    let report = sync(&client).await;
    assert_eq!(report.delivered, 1);

    let requests = received_for(&server, "POST", "/reports").await;
    assert_eq!(requests.len(), 2);
    let direct = header(&requests[0], IDEMPOTENCY_HEADER).expect("direct attempt key");
    let replay = header(&requests[1], IDEMPOTENCY_HEADER).expect("replay key");
    assert_eq!(direct, replay);

    let first: Value = serde_json::from_slice(&requests[0].body).unwrap();
    let second: Value = serde_json::from_slice(&requests[1].body).unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_retry_exhaustion_drops_once() {
    let server = start_backend().await;
    mount_status(&server, "POST", "/needs", 500).await;

    let client = offline_client(&server.uri(), false).await;
    let mut events = client.events().subscribe();
    client.proxy().post("/needs", json!({"title": "Tents"})).await.unwrap();
    client.network().set_online(true);

    let first = sync(&client).await;
    let second = sync(&client).await;
    assert_eq!(first.failed, 1);
    assert_eq!(second.failed, 1);
    assert_eq!(client.outbox().unwrap().count_pending().await.unwrap(), 1);

    let third = sync(&client).await;
    assert_eq!(third.dropped, 1);
    assert_eq!(client.outbox().unwrap().count_pending().await.unwrap(), 0);

    // No further attempts once dropped
    sync(&client).await;
    assert_eq!(received_for(&server, "POST", "/needs").await.len(), 3);

    let letters = client.outbox().unwrap().list_dead_letters().await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].reason, DropReason::RetriesExhausted);
    assert_eq!(letters[0].action.retry_count, 3);
    assert!(letters[0].last_error.as_deref().unwrap_or_default().contains("500"));

    let seen = drain_events(&mut events);
    crate::assert_event_count!(seen, SyncEvent::ActionDropped { .. }, 1);

    let metrics = client.orchestrator().unwrap().metrics().await;
    assert_eq!(metrics.dropped_actions, 1);
    assert_eq!(client.orchestrator().unwrap().status().dead_letters, 1);
}

#[tokio::test]
async fn test_requeued_dead_letter_is_delivered() {
    let server = start_backend().await;
    mount_status(&server, "PUT", "/tasks/4", 500).await;

    let config = reliefsync::shared::SyncConfig::builder()
        .server_url(server.uri())
        .default_max_retries(1)
        .build()
        .unwrap();
    let client = offline_client_with(config, true).await;
    let outbox = client.outbox().unwrap();
    outbox
        .enqueue(ActionKind::Update, "/tasks/4", HttpMethod::Put, json!({"status": "done"}))
        .await
        .unwrap();

    assert_eq!(sync(&client).await.dropped, 1);
    let letter = outbox.list_dead_letters().await.unwrap().remove(0);

    server.reset().await;
    mount_json(&server, "PUT", "/tasks/4", 200, json!({"id": "4", "status": "done"})).await;

    let requeued = outbox.requeue_dead_letter(&letter.id).await.unwrap();
    assert_eq!(requeued.idempotency_key, letter.action.idempotency_key);
    assert_eq!(requeued.retry_count, 0);
    assert!(outbox.list_dead_letters().await.unwrap().is_empty());

    assert_eq!(sync(&client).await.delivered, 1);
    assert_eq!(outbox.count_pending().await.unwrap(), 0);
}

#[tokio::test]
async fn test_same_entity_replays_in_enqueue_order() {
    let server = start_backend().await;
    mount_json(&server, "PUT", "/tasks/1", 200, json!({"id": "1"})).await;

    let client = offline_client(&server.uri(), true).await;
    let outbox = client.outbox().unwrap();
    for status in ["assigned", "in_progress", "done"] {
        outbox
            .enqueue(ActionKind::Update, "/tasks/1", HttpMethod::Put, json!({"status": status}))
            .await
            .unwrap();
    }

    assert_eq!(sync(&client).await.delivered, 3);

    let statuses: Vec<String> = received_for(&server, "PUT", "/tasks/1")
        .await
        .iter()
        .map(|r| serde_json::from_slice::<Value>(&r.body).unwrap()["status"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(statuses, vec!["assigned", "in_progress", "done"]);
}

#[tokio::test]
async fn test_failed_action_blocks_later_actions_on_same_entity() {
    let server = start_backend().await;
    mount_status(&server, "PUT", "/tasks/2", 503).await;
    mount_json(&server, "PUT", "/tasks/3", 200, json!({"id": "3"})).await;

    let client = offline_client(&server.uri(), true).await;
    let outbox = client.outbox().unwrap();
    outbox.enqueue(ActionKind::Update, "/tasks/2", HttpMethod::Put, json!({"n": 1})).await.unwrap();
    outbox.enqueue(ActionKind::Update, "/tasks/2", HttpMethod::Put, json!({"n": 2})).await.unwrap();
    outbox.enqueue(ActionKind::Update, "/tasks/3", HttpMethod::Put, json!({"n": 3})).await.unwrap();

    let report = sync(&client).await;
    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.deferred, 1);
    assert_eq!(report.remaining, 2);

    // Only the head of the /tasks/2 queue was attempted
    assert_eq!(received_for(&server, "PUT", "/tasks/2").await.len(), 1);
}

#[tokio::test]
async fn test_request_during_cycle_is_coalesced() {
    let server = start_backend().await;
    Mock::given(method("POST"))
        .and(path("/needs"))
        .respond_with(ResponseTemplate::new(201).set_delay(Duration::from_millis(300)))
        .mount(&server)
        .await;
    mount_status(&server, "POST", "/tasks", 201).await;

    let client = offline_client(&server.uri(), true).await;
    let outbox = client.outbox().unwrap().clone();
    outbox.enqueue(ActionKind::Create, "/needs", HttpMethod::Post, json!({"t": 1})).await.unwrap();

    let orchestrator = client.orchestrator().unwrap().clone();
    let running = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.sync_now().await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(orchestrator.is_syncing());
    assert_eq!(orchestrator.status().phase, SyncPhase::Syncing);

    outbox.enqueue(ActionKind::Create, "/tasks", HttpMethod::Post, json!({"t": 2})).await.unwrap();
    assert_eq!(orchestrator.sync_now().await.unwrap(), SyncOutcome::Coalesced);

    let outcome = running.await.unwrap().unwrap();
    let SyncOutcome::Completed(report) = outcome else {
        panic!("expected the running cycle to complete");
    };
    assert_eq!(report.delivered, 2);
    assert_eq!(report.remaining, 0);
    assert_eq!(orchestrator.status().phase, SyncPhase::Idle);
}

#[tokio::test]
async fn test_cancel_reverts_optimistic_entity() {
    let client = offline_client("http://127.0.0.1:9", false).await;
    let response = client.proxy().post("/needs", json!({"title": "Blankets"})).await.unwrap();
    let action_id = response.action_id.unwrap();

    let cancelled = client.outbox().unwrap().cancel(action_id).await.unwrap();
    assert_eq!(cancelled.target, "/needs");
    assert_eq!(client.outbox().unwrap().count_pending().await.unwrap(), 0);

    let local: Vec<LocalEntity> = store(&client).get_all().await.unwrap();
    assert!(local.is_empty());
}

#[tokio::test]
async fn test_background_loop_syncs_on_reconnect() {
    let server = start_backend().await;
    mount_json(&server, "POST", "/needs", 201, json!({"id": "n-2"})).await;

    let client = offline_client(&server.uri(), false).await;
    let mut events = client.events().subscribe();
    let handles = client.spawn_background();

    client.proxy().post("/needs", json!({"title": "Fuel"})).await.unwrap();
    client.network().set_online(true);

    let complete = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(SyncEvent::SyncComplete { delivered, remaining }) if delivered > 0 => {
                    break (delivered, remaining)
                }
                Ok(_) => continue,
                Err(e) => panic!("event channel failed: {}", e),
            }
        }
    })
    .await
    .expect("sync should run after reconnect");

    assert_eq!(complete, (1, 0));
    for handle in handles {
        handle.abort();
    }
}

#[tokio::test]
async fn test_sync_status_and_metrics_after_clean_cycle() {
    let server = start_backend().await;
    mount_status(&server, "POST", "/inventory", 201).await;

    let client = offline_client(&server.uri(), true).await;
    client
        .outbox()
        .unwrap()
        .enqueue(ActionKind::Create, "/inventory", HttpMethod::Post, json!({"sku": "WTR-20"}))
        .await
        .unwrap();

    let mut status_rx = client.orchestrator().unwrap().subscribe_status();
    sync(&client).await;

    assert!(status_rx.has_changed().unwrap());
    let status = status_rx.borrow_and_update().clone();
    assert_eq!(status.phase, SyncPhase::Idle);
    assert_eq!(status.pending_actions, 0);
    assert!(status.last_sync.is_some());
    assert!(status.last_error.is_none());
    assert_eq!(status.backing_off, 0);
    assert_eq!(status.bandwidth_samples, 0);

    let metrics = client.orchestrator().unwrap().metrics().await;
    assert_eq!(metrics.total_cycles, 1);
    assert_eq!(metrics.successful_cycles, 1);
    assert_eq!(metrics.delivered_actions, 1);
    assert!(metrics.total_bytes_sent > 0);

    let last = store(&client).last_synced_by_type().await.unwrap();
    assert!(last.contains_key("inventory"));
}

#[tokio::test]
async fn test_small_requests_do_not_mark_the_link_slow() {
    let server = start_backend().await;
    mount_json(&server, "POST", "/needs", 201, json!({"id": "n-1", "title": "Water"})).await;
    mount_json(&server, "PUT", "/profiles/u1", 200, json!({"id": "u1"})).await;

    let client = offline_client(&server.uri(), true).await;
    client.proxy().post("/needs", json!({"title": "Water"})).await.unwrap();

    let bandwidth = client.backend().bandwidth();
    assert_eq!(bandwidth.sample_count().await, 0);
    assert_eq!(bandwidth.estimate().await.speed_class, SpeedClass::Fast);

    client.network().set_online(false);
    client.proxy().put("/profiles/u1", json!({"name": "Ada"})).await.unwrap();
    client.network().set_online(true);

    let report = sync(&client).await;
    assert_eq!(report.delivered, 1);
    assert_eq!(report.remaining, 0);
    assert_eq!(received_for(&server, "PUT", "/profiles/u1").await.len(), 1);
}

#[tokio::test]
async fn test_slow_link_defers_low_priority_types_without_starving_them() {
    let server = start_backend().await;
    Mock::given(method("GET"))
        .and(path("/reports"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([{"id": "r1", "text": "x".repeat(20_000)}]))
                .set_delay(Duration::from_millis(800)),
        )
        .mount(&server)
        .await;
    mount_json(&server, "POST", "/needs", 201, json!({"id": "n-2"})).await;
    mount_json(&server, "PUT", "/profiles/u1", 200, json!({"id": "u1"})).await;

    let mut config = test_config(&server.uri());
    config.request_timeout_ms = 5_000;
    let client = offline_client_with(config, true).await;

    // One large, slow transfer is a real sample
    client.proxy().get("/reports").await.unwrap();
    assert_eq!(client.backend().bandwidth().estimate().await.speed_class, SpeedClass::Slow);

    client.network().set_online(false);
    client.proxy().put("/profiles/u1", json!({"name": "Ada"})).await.unwrap();
    client.proxy().post("/needs", json!({"title": "Blankets"})).await.unwrap();
    client.network().set_online(true);

    let first = sync(&client).await;
    assert_eq!(first.delivered, 1);
    assert_eq!(first.deferred, 1);
    assert_eq!(first.remaining, 1);
    assert!(received_for(&server, "PUT", "/profiles/u1").await.is_empty());
    assert_eq!(client.orchestrator().unwrap().status().bandwidth_samples, 1);

    // Nothing above the floor is left, so the held-back type goes next
    let second = sync(&client).await;
    assert_eq!(second.delivered, 1);
    assert_eq!(second.remaining, 0);
    assert_eq!(received_for(&server, "PUT", "/profiles/u1").await.len(), 1);
}
