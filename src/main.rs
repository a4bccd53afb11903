mod api;
mod broadcast;
mod config;
mod data;
mod error;
mod hub;
mod link;
mod relay;
mod upstream;
mod websocket;


use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::CorsLayer;

use crate::api::{create_api_router, ApiState};
use crate::broadcast::PriceBroadcaster;
use crate::config::{Config, STATS_INTERVAL_SECS};
use crate::data::snapshot::{CsvSnapshotStore, SnapshotStore};
use crate::hub::Hub;
use crate::relay::{CrossProcessRelay, RedisRelaySource};
use crate::upstream::{BrokerageConnector, UpstreamBridge};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env();

    env_logger::init_from_env(env_logger::Env::new().default_filter_or(&config.log_level));

    config.log_config();

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        return Err(e.into());
    }

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    let bridge = Arc::new(UpstreamBridge::new(config.backoff.clone()));
    let hub = Arc::new(Hub::new(bridge.clone(), config.hub_settings()));
    let store: Arc<dyn SnapshotStore> = Arc::new(CsvSnapshotStore::load(&config.data_dir));

    match &config.upstream_url {
        Some(url) => {
            let connector = BrokerageConnector::new(url, config.upstream_api_key.clone(), config.connect_timeout);
            tracker.spawn(bridge.clone().run(connector, cancel.clone()));
        }
        None => info!("No UPSTREAM_URL set, prices come from the snapshot store only"),
    }

    let relay = config.redis_url.as_ref().map(|url| {
        let relay = Arc::new(CrossProcessRelay::new(
            hub.clone(),
            config.relay_channels.clone(),
            config.backoff.clone(),
        ));
        let source = RedisRelaySource::new(url, config.connect_timeout);
        tracker.spawn(relay.clone().run(source, cancel.clone()));
        relay
    });
    if relay.is_none() {
        info!("REDIS_URL is empty, cross-process relay disabled");
    }

    let price_broadcaster = Arc::new(PriceBroadcaster::new(
        hub.clone(),
        store,
        config.price_interval,
        config.lookup_timeout,
    ));
    tracker.spawn(price_broadcaster.run(cancel.clone()));
    tracker.spawn(websocket::heartbeat::run(hub.registry(), cancel.clone()));
    tracker.spawn(log_stats(hub.clone(), cancel.clone()));

    // HTTP API
    let api_router = create_api_router(ApiState::new(hub.clone(), relay)).layer(CorsLayer::permissive());
    let api_listener = TcpListener::bind(&config.api_bind_address).await?;
    info!("🌐 HTTP API server running at http://{}/api", config.api_bind_address);

    let api_cancel = cancel.clone();
    let mut api_server = tokio::spawn(async move {
        axum::serve(api_listener, api_router)
            .with_graceful_shutdown(async move { api_cancel.cancelled().await })
            .await
    });

    // WebSocket
    let ws_listener = TcpListener::bind(&config.bind_address).await?;
    info!(
        "🚀 WebSocket server running at ws://{}{}",
        config.bind_address,
        websocket::server::WS_PATH
    );
    tracker.spawn(websocket::server::run(
        ws_listener,
        hub.clone(),
        tracker.clone(),
        cancel.clone(),
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
        result = &mut api_server => error!("API server stopped: {:?}", result),
    }

    shutdown(&hub, &cancel, &tracker, config.shutdown_grace).await;
    Ok(())
}

/// Stops every loop, closes all client connections, then waits a bounded time
/// for connection tasks to flush their queues.
async fn shutdown(hub: &Hub, cancel: &CancellationToken, tracker: &TaskTracker, grace: Duration) {
    cancel.cancel();

    let closed = hub.registry().close_all("server shutting down");
    info!("Closing {} client connections", closed);

    tracker.close();
    if tokio::time::timeout(grace, tracker.wait()).await.is_err() {
        warn!(
            "{} tasks still running after {:?} grace period, exiting anyway",
            tracker.len(),
            grace
        );
    } else {
        info!("Shutdown complete");
    }
}

async fn log_stats(hub: Arc<Hub>, cancel: CancellationToken) {
    let mut ticker = interval(Duration::from_secs(STATS_INTERVAL_SECS));
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let (topics, connections) = hub.table().stats();
                let registry = hub.registry();
                info!(
                    "📊 Stats: {} connections ({} in table, {} heartbeat-tracked), {} topics, {} upstream instruments, upstream {:?}",
                    registry.connection_count(),
                    connections,
                    registry.heartbeat().tracked(),
                    topics,
                    hub.bridge().demand().demanded().len(),
                    hub.bridge().link().state()
                );
            }
        }
    }
}
