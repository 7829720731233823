//! Common test utilities and helpers
//!
//! This module provides shared utilities for all tests including:
//! - Store fixtures (in-memory and on-disk)
//! - Fake REST backend helpers
//! - Custom assertion macros

pub mod assertions;
pub mod database;
pub mod mock_server;

// Re-export commonly used utilities
pub use database::*;
pub use mock_server::*;

use reliefsync::client::OfflineClient;
use reliefsync::shared::event::SyncEvent;
use reliefsync::shared::SyncConfig;
use std::time::Duration;
use tokio::sync::broadcast;

/// Config pointing at `server_url` with a short timeout
pub fn test_config(server_url: &str) -> SyncConfig {
    SyncConfig::builder()
        .server_url(server_url)
        .request_timeout(Duration::from_millis(500))
        .default_max_retries(3)
        .build()
        .expect("valid test config")
}

/// Client over an in-memory store, starting with the given connectivity
pub async fn offline_client(server_url: &str, online: bool) -> OfflineClient {
    offline_client_with(test_config(server_url), online).await
}

pub async fn offline_client_with(config: SyncConfig, online: bool) -> OfflineClient {
    let store = memory_store().await;
    let client = OfflineClient::open_with_store(config, Some(store)).expect("client");
    client.network().set_online(online);
    client
}

/// Drain every event currently buffered on `rx`
pub fn drain_events(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
