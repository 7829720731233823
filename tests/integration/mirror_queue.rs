//! Mirror queue delivery path

use pretty_assertions::assert_eq;
use reliefsync::client::mirror::{InterceptOutcome, MirrorQueue, MirrorRequest};
use reliefsync::client::sync::{BandwidthMonitor, NetworkMonitor, NetworkStatus};
use reliefsync::client::transport::{HttpBackend, IDEMPOTENCY_HEADER};
use reliefsync::shared::event::{event_channel, SyncEvent};
use reliefsync::shared::model::HttpMethod;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use crate::common::*;

fn backend(server_url: &str) -> HttpBackend {
    HttpBackend::new(Arc::new(test_config(server_url)), Arc::new(BandwidthMonitor::new())).unwrap()
}

#[tokio::test]
async fn test_queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("mirror.db");
    let events = event_channel();

    {
        let queue = MirrorQueue::open(&db, backend("http://127.0.0.1:9"), events.clone()).await.unwrap();
        let outcome = queue
            .intercept(MirrorRequest::new(HttpMethod::Post, "/needs").with_body(r#"{"title":"Water"}"#))
            .await
            .unwrap();
        assert!(matches!(outcome, InterceptOutcome::Queued { .. }));
    }

    let reopened = MirrorQueue::open(&db, backend("http://127.0.0.1:9"), events).await.unwrap();
    let pending = reopened.pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].request.body.as_deref(), Some(r#"{"title":"Water"}"#));
}

#[tokio::test]
async fn test_replay_keeps_caller_idempotency_key() {
    let server = start_backend().await;
    Mock::given(method("PATCH"))
        .and(path("/tasks/8"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_status(&server, "PATCH", "/tasks/8", 204).await;

    let queue = MirrorQueue::open_in_memory(backend(&server.uri()), event_channel()).await.unwrap();
    queue
        .intercept(
            MirrorRequest::new(HttpMethod::Patch, "/tasks/8")
                .with_header(IDEMPOTENCY_HEADER, "caller-key-1")
                .with_body(r#"{"status":"done"}"#),
        )
        .await
        .unwrap();

    let summary = queue.replay().await.unwrap();
    assert_eq!(summary.replayed, 1);
    assert_eq!(queue.count().await.unwrap(), 0);

    let requests = received_for(&server, "PATCH", "/tasks/8").await;
    assert_eq!(requests.len(), 2);
    for request in &requests {
        assert_eq!(header(request, IDEMPOTENCY_HEADER).as_deref(), Some("caller-key-1"));
    }
}

#[tokio::test]
async fn test_background_loop_replays_on_reconnect() {
    let server = start_backend().await;
    Mock::given(method("DELETE"))
        .and(path("/volunteers/3"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_status(&server, "DELETE", "/volunteers/3", 204).await;

    let events = event_channel();
    let mut rx = events.subscribe();
    let queue = MirrorQueue::open_in_memory(backend(&server.uri()), events.clone()).await.unwrap();
    queue
        .intercept(MirrorRequest::new(HttpMethod::Delete, "/volunteers/3"))
        .await
        .unwrap();

    let network = NetworkMonitor::new(NetworkStatus::Offline, events);
    let handle = queue.clone().spawn(network.clone());
    network.set_online(true);

    let summary = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(SyncEvent::MirrorReplayComplete { replayed, remaining }) => break (replayed, remaining),
                Ok(_) => continue,
                Err(e) => panic!("event channel failed: {}", e),
            }
        }
    })
    .await
    .expect("mirror should replay after reconnect");

    assert_eq!(summary, (1, 0));
    assert_eq!(queue.count().await.unwrap(), 0);
    handle.abort();
}

#[tokio::test]
async fn test_mirror_does_not_share_the_outbox() {
    let client = offline_client("http://127.0.0.1:9", true).await;
    let queue = MirrorQueue::open_in_memory(client.backend().clone(), client.events().clone())
        .await
        .unwrap();
    let client = client.with_mirror(queue);

    client
        .mirror()
        .unwrap()
        .intercept(MirrorRequest::new(HttpMethod::Post, "/needs"))
        .await
        .unwrap();

    assert_eq!(client.mirror().unwrap().count().await.unwrap(), 1);
    assert_eq!(client.outbox().unwrap().count_pending().await.unwrap(), 0);
}
