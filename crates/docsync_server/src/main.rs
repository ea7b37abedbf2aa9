use docsync_core::DocumentManager;
use docsync_core::cluster::{ClusterBridge, RelayChannel};
use docsync_core::storage::{DocStorage, MemoryStorage, SqliteStorage};
use docsync_server::{
    AppState, build_router,
    auth::TokenAuthenticator,
    config::Config,
    handlers::RelayHub,
    sync::ConnectionRegistry,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const RELAY_RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "docsync_server=debug,docsync_core=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting docsync server v{}", env!("CARGO_PKG_VERSION"));

    let storage: Arc<dyn DocStorage> = match &config.database_path {
        Some(path) => match SqliteStorage::open(path) {
            Ok(storage) => {
                info!("Database path: {:?}", path);
                Arc::new(storage)
            }
            Err(e) => {
                error!("Failed to open database: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            warn!("DATABASE_PATH not set, documents are kept in memory only");
            Arc::new(MemoryStorage::new())
        }
    };

    let manager = DocumentManager::new(storage, config.manager_options());
    let registry = ConnectionRegistry::new();
    manager.add_callback(registry.clone());

    // Join the cluster
    let bridge = match &config.cluster_relay_url {
        Some(url) => match RelayChannel::connect(url, RELAY_RECONNECT_DELAY) {
            Ok(channel) => {
                info!("Cluster relay: {}", url);
                let bridge = ClusterBridge::new(Arc::new(channel), config.cluster_options());
                manager.add_callback(bridge.clone());
                Some(bridge)
            }
            Err(e) => {
                error!("Failed to configure cluster relay: {}", e);
                std::process::exit(1);
            }
        },
        None => None,
    };

    let relay_hub = config.cluster_hub.then(|| {
        info!("Serving cluster relay hub on /cluster");
        Arc::new(RelayHub::new())
    });

    manager.start().await;

    let state = AppState {
        manager: manager.clone(),
        registry,
        authenticator: Arc::new(TokenAuthenticator::new(config.auth_token.clone())),
        relay_hub,
    };
    let app = build_router(state);

    // Create listener
    let addr = config.server_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("Server listening on http://{}", addr);

    // Run server with graceful shutdown
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
    }

    manager.shutdown().await;
    if let Some(bridge) = bridge {
        bridge.shutdown().await;
    }

    info!("Server shut down gracefully");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
