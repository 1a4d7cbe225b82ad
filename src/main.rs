//! Server binary: wire configuration, storage, and the HTTP front end.

use std::net::SocketAddr;
use std::sync::Arc;

use codecollab_server::storage::{CollabStore, StoreConfig};
use codecollab_server::voice::LiveKitIssuer;
use codecollab_server::{CollabServer, Config, PROTOCOL_VERSION};

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.clone()),
    )
    .init();

    let store_config = StoreConfig {
        path: config.server.storage_path.clone(),
        ..StoreConfig::default()
    };
    let store = Arc::new(CollabStore::open(store_config).expect("failed to open storage"));
    log::info!("storage initialized at {}", store.path().display());

    let issuer = match config.livekit.clone() {
        Some(livekit) => {
            log::info!("voice credentials configured for {}", livekit.server_url);
            Arc::new(LiveKitIssuer::new(livekit))
        }
        None => {
            log::warn!("LIVEKIT_* not set; voice chat disabled");
            Arc::new(LiveKitIssuer::unconfigured())
        }
    };

    let server = CollabServer::new(config.server.clone(), store, issuer);
    let _maintenance = server.spawn_maintenance();

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let app = codecollab_server::http::router(server.clone());

    log::info!(
        "codecollab-server v{} listening on http://{addr} (protocol v{PROTOCOL_VERSION})",
        env!("CARGO_PKG_VERSION")
    );
    log::info!("websocket endpoint: ws://{addr}/ws/{{project_id}}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind listen address");

    axum::serve(listener, app)
        .with_graceful_shutdown({
            let server = server.clone();
            async move {
                let _ = tokio::signal::ctrl_c().await;
                log::info!("shutdown signal received");
                server.shutdown().await;
            }
        })
        .await
        .expect("server error");
}
