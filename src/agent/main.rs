/**
 * ReliefSync Agent Entry Point
 *
 * Hosts the sync orchestrator and mirror queue loops outside an application
 * process, probing the backend to drive connectivity transitions.
 */

#[cfg(feature = "agent")]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    use futures_util::StreamExt;
    use reliefsync::client::OfflineClient;
    use reliefsync::shared::event::{event_stream, SyncEvent};
    use reliefsync::shared::SyncConfig;
    use std::time::Duration;

    // Load environment variables from .env file if present
    dotenv::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&env_filter))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => SyncConfig::load(&path)?,
        None => {
            let mut config = SyncConfig::default();
            config.apply_env_overrides();
            config.validate()?;
            config
        }
    };

    tracing::info!("[Agent] Syncing against {}", config.server_url);

    let client = OfflineClient::open(config).await?;

    // Surface store failures, drops and conflicts in the agent log; subscribed
    // before the loops start so startup events are seen
    let logger = {
        let mut events = Box::pin(event_stream(client.events()));
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    SyncEvent::StoreUnavailable { reason } => {
                        tracing::error!("[Agent] Running online-only: {}", reason);
                    }
                    SyncEvent::ActionDropped { action_id, target, reason, .. } => {
                        tracing::warn!("[Agent] Action {} for {} dropped: {:?}", action_id, target, reason);
                    }
                    SyncEvent::ConflictDetected { conflict_id, entity_type, entity_id, resolution } => {
                        tracing::info!(
                            "[Agent] Conflict {} on {}:{} -> {}",
                            conflict_id,
                            entity_type,
                            entity_id,
                            resolution
                        );
                    }
                    _ => {}
                }
            }
        })
    };

    let mut handles = client.spawn_background();
    handles.push(logger);

    // Connectivity probe
    let probe_path = std::env::var("RELIEFSYNC_PROBE_PATH").unwrap_or_else(|_| "/health".to_string());
    let probe_secs = std::env::var("RELIEFSYNC_PROBE_INTERVAL_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(30);
    {
        let network = client.network().clone();
        let backend = client.backend().clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(probe_secs.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                network.probe(&backend, &probe_path).await;
            }
        }));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("[Agent] Shutting down");
    for handle in &handles {
        handle.abort();
    }
    futures_util::future::join_all(handles).await;

    Ok(())
}

#[cfg(not(feature = "agent"))]
fn main() {
    eprintln!("The agent requires the 'agent' feature to be enabled.");
    eprintln!("Run with: cargo run --bin reliefsync-agent --features agent");
    std::process::exit(1);
}
