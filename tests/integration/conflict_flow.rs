//! Divergence detection on reads and on `409` replies

use pretty_assertions::assert_eq;
use reliefsync::client::sync::{Resolution, ResolutionStrategy, SyncOutcome};
use reliefsync::shared::event::SyncEvent;
use reliefsync::shared::model::{DropReason, HttpMethod, LocalEntity, ResolutionKind};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::common::*;

#[tokio::test]
async fn test_small_quantity_divergence_merges() {
    let server = start_backend().await;
    mount_json(&server, "GET", "/inventory/7", 200, json!({"id": "7", "quantity": 14})).await;

    let client = offline_client(&server.uri(), false).await;
    client.proxy().put("/inventory/7", json!({"quantity": 12})).await.unwrap();

    client.network().set_online(true);
    client.proxy().get("/inventory/7").await.unwrap();

    let conflicts = client.conflicts().unwrap().list_conflicts().await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].resolution, ResolutionKind::Merge);
    assert_eq!(conflicts[0].merged_payload.as_ref().unwrap()["quantity"], 14);

    // Pending write replaced by one PUT of the merged payload
    let pending = client.outbox().unwrap().list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].method, HttpMethod::Put);
    assert_eq!(pending[0].payload["quantity"], 14);

    let entity: LocalEntity = client.outbox().unwrap().store().get("inventory:7").await.unwrap().unwrap();
    assert!(entity.is_local_only);
    assert!(entity.merged_at.is_some());
}

#[tokio::test]
async fn test_large_quantity_divergence_takes_server_value() {
    let server = start_backend().await;
    mount_json(&server, "GET", "/inventory/7", 200, json!({"id": "7", "quantity": 25})).await;

    let client = offline_client(&server.uri(), false).await;
    client.proxy().put("/inventory/7", json!({"quantity": 12})).await.unwrap();

    client.network().set_online(true);
    client.proxy().get("/inventory/7").await.unwrap();

    let conflicts = client.conflicts().unwrap().list_conflicts().await.unwrap();
    assert_eq!(conflicts[0].resolution, ResolutionKind::Server);

    let outbox = client.outbox().unwrap();
    assert_eq!(outbox.count_pending().await.unwrap(), 0);
    let letters = outbox.list_dead_letters().await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].reason, DropReason::Superseded);

    let entity: LocalEntity = outbox.store().get("inventory:7").await.unwrap().unwrap();
    assert_eq!(entity.payload["quantity"], 25);
    assert!(!entity.is_local_only);
}

#[tokio::test]
async fn test_identical_server_value_is_not_a_conflict() {
    let server = start_backend().await;
    mount_json(&server, "GET", "/needs/3", 200, json!({"id": "3", "title": "Water"})).await;

    let client = offline_client(&server.uri(), false).await;
    client.proxy().put("/needs/3", json!({"id": "3", "title": "Water"})).await.unwrap();

    client.network().set_online(true);
    client.proxy().get("/needs/3").await.unwrap();

    assert!(client.conflicts().unwrap().list_conflicts().await.unwrap().is_empty());
    assert_eq!(client.outbox().unwrap().count_pending().await.unwrap(), 1);
}

#[tokio::test]
async fn test_unregistered_type_waits_for_manual_resolution() {
    let server = start_backend().await;
    mount_json(&server, "GET", "/shelters/1", 200, json!({"id": "1", "beds": 40})).await;

    let client = offline_client(&server.uri(), false).await;
    let mut events = client.events().subscribe();
    client.proxy().put("/shelters/1", json!({"beds": 35})).await.unwrap();

    client.network().set_online(true);
    client.proxy().get("/shelters/1").await.unwrap();

    let ledger = client.conflicts().unwrap();
    let pending = ledger.pending_conflicts().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].strategy, "manual");
    assert_eq!(client.outbox().unwrap().count_pending().await.unwrap(), 1);

    let resolved = ledger
        .resolve_conflict(&pending[0].id, ResolutionKind::Server, None)
        .await
        .unwrap();
    assert_eq!(resolved.resolution, ResolutionKind::Server);
    assert!(resolved.resolved_at.is_some());
    assert!(ledger.pending_conflicts().await.unwrap().is_empty());
    assert_eq!(client.outbox().unwrap().count_pending().await.unwrap(), 0);

    let seen = drain_events(&mut events);
    crate::assert_event_count!(seen, SyncEvent::ConflictDetected { resolution: ResolutionKind::Manual, .. }, 1);
    crate::assert_event_count!(seen, SyncEvent::ConflictResolved { resolution: ResolutionKind::Server, .. }, 1);
}

#[tokio::test]
async fn test_manual_merge_replaces_pending_writes() {
    let server = start_backend().await;
    mount_json(&server, "GET", "/shelters/2", 200, json!({"id": "2", "beds": 10, "open": true})).await;

    let client = offline_client(&server.uri(), false).await;
    client.proxy().put("/shelters/2", json!({"beds": 12})).await.unwrap();
    client.network().set_online(true);
    client.proxy().get("/shelters/2").await.unwrap();

    let ledger = client.conflicts().unwrap();
    let conflict = ledger.pending_conflicts().await.unwrap().remove(0);
    ledger
        .resolve_conflict(&conflict.id, ResolutionKind::Merge, Some(json!({"beds": 12, "open": true})))
        .await
        .unwrap();

    let pending = client.outbox().unwrap().list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].target, "/shelters/2");
    assert_eq!(pending[0].payload, json!({"beds": 12, "open": true}));
}

#[tokio::test]
async fn test_custom_strategy_is_used_for_replay_conflicts() {
    let server = start_backend().await;
    mount_json(&server, "PUT", "/budgets/b1", 409, json!({"current": {"amount": 900}})).await;

    let client = offline_client(&server.uri(), false).await;
    client
        .conflicts()
        .unwrap()
        .register_strategy(
            "budgets",
            ResolutionStrategy::Custom(Arc::new(|_id: &str, local: &Value, server: &Value| {
                let amount = local["amount"].as_i64().unwrap_or(0).min(server["amount"].as_i64().unwrap_or(0));
                Resolution::Merge(json!({"amount": amount}))
            })),
        )
        .await;

    client.proxy().put("/budgets/b1", json!({"amount": 1200})).await.unwrap();
    client.network().set_online(true);

    let outcome = client.orchestrator().unwrap().sync_now().await.unwrap();
    let SyncOutcome::Completed(report) = outcome else {
        panic!("expected a completed cycle");
    };
    assert_eq!(report.conflicts, 1);

    let pending = client.outbox().unwrap().list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].payload, json!({"amount": 900}));

    let conflicts = client.conflicts().unwrap().list_conflicts().await.unwrap();
    assert_eq!(conflicts[0].strategy, "custom");

    let metrics = client.conflicts().unwrap().metrics().await;
    assert_eq!(metrics.total_conflicts, 1);
    assert_eq!(metrics.auto_resolved, 1);
}

async fn sync(client: &reliefsync::client::OfflineClient) -> reliefsync::client::sync::CycleReport {
    match crate::assert_ok!(client.orchestrator().unwrap().sync_now().await) {
        SyncOutcome::Completed(report) => report,
        other => panic!("expected a completed cycle, got {:?}", other),
    }
}

#[tokio::test]
async fn test_manual_conflict_holds_writes_until_resolved() {
    let server = start_backend().await;
    mount_json(&server, "GET", "/shelters/1", 200, json!({"id": "1", "beds": 40})).await;
    mount_json(&server, "PUT", "/shelters/1", 200, json!({"id": "1", "beds": 35})).await;

    let client = offline_client(&server.uri(), false).await;
    client.proxy().put("/shelters/1", json!({"beds": 35})).await.unwrap();
    client.network().set_online(true);

    // Repeated reads refresh the one open record
    client.proxy().get("/shelters/1").await.unwrap();
    client.proxy().get("/shelters/1").await.unwrap();
    let ledger = client.conflicts().unwrap();
    let pending = ledger.pending_conflicts().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(ledger.list_conflicts().await.unwrap().len(), 1);

    let report = sync(&client).await;
    assert_eq!(report.delivered, 0);
    assert_eq!(report.deferred, 1);
    assert_eq!(report.remaining, 1);
    assert!(received_for(&server, "PUT", "/shelters/1").await.is_empty());

    ledger
        .resolve_conflict(&pending[0].id, ResolutionKind::Local, None)
        .await
        .unwrap();

    let report = sync(&client).await;
    assert_eq!(report.delivered, 1);
    assert_eq!(report.remaining, 0);
    assert_eq!(received_for(&server, "PUT", "/shelters/1").await.len(), 1);
}

#[tokio::test]
async fn test_manual_409_holds_action_without_spending_retries() {
    let server = start_backend().await;
    mount_json(&server, "PUT", "/shelters/5", 409, json!({"current": {"beds": 3}})).await;

    let client = offline_client(&server.uri(), false).await;
    client.proxy().put("/shelters/5", json!({"beds": 8})).await.unwrap();
    client.network().set_online(true);

    let first = sync(&client).await;
    assert_eq!(first.conflicts, 1);
    assert_eq!(first.failed, 0);

    // Later cycles leave the conflicted write alone
    for _ in 0..3 {
        let report = sync(&client).await;
        assert_eq!(report.deferred, 1);
        assert_eq!(report.dropped, 0);
    }
    assert_eq!(received_for(&server, "PUT", "/shelters/5").await.len(), 1);

    let outbox = client.outbox().unwrap();
    let pending = outbox.list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].retry_count, 0);
    assert!(outbox.list_dead_letters().await.unwrap().is_empty());

    let ledger = client.conflicts().unwrap();
    let conflicts = ledger.pending_conflicts().await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].server_payload, json!({"beds": 3}));
    assert_eq!(ledger.list_conflicts().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_409_local_ruling_is_recorded_once_and_bounded_by_retries() {
    let server = start_backend().await;
    mount_json(&server, "PUT", "/budgets/b2", 409, json!({"current": {"amount": 10}})).await;

    let client = offline_client(&server.uri(), false).await;
    client
        .conflicts()
        .unwrap()
        .register_strategy(
            "budgets",
            ResolutionStrategy::Custom(Arc::new(|_id: &str, _local: &Value, _server: &Value| Resolution::Local)),
        )
        .await;
    client.proxy().put("/budgets/b2", json!({"amount": 20})).await.unwrap();
    client.network().set_online(true);

    let first = sync(&client).await;
    assert_eq!(first.failed, 1);
    sync(&client).await;
    let third = sync(&client).await;
    assert_eq!(third.dropped, 1);

    let conflicts = client.conflicts().unwrap().list_conflicts().await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].resolution, ResolutionKind::Local);

    let letters = client.outbox().unwrap().list_dead_letters().await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].reason, DropReason::RetriesExhausted);
}
