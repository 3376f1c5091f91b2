use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use courier::app::{self, ServerState};
use courier::config::{BrokerMode, Config};
use courier_db::{Database, Store};
use courier_gateway::broker::amqp::AmqpConnector;
use courier_gateway::broker::{BrokerBridge, BrokerConnector};
use courier_gateway::dispatcher::Dispatcher;
use courier_gateway::registry::ConnectionRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "courier=debug,courier_gateway=debug,courier_db=info,tower_http=debug".into()
            }),
        )
        .init();

    let config = Config::from_env()?;

    // Init database
    let db = Arc::new(
        Database::open(&config.db_path)
            .with_context(|| format!("opening database {}", config.db_path.display()))?,
    );

    // Broker bridge; an unreachable broker only degrades delivery
    let connector: Option<Arc<dyn BrokerConnector>> = match &config.broker {
        BrokerMode::Amqp { url } => Some(Arc::new(AmqpConnector::new(url.clone()))),
        BrokerMode::Disabled => None,
    };
    let dispatcher = Dispatcher::new(ConnectionRegistry::new());
    let bridge = BrokerBridge::new(
        config.instance_id.clone(),
        dispatcher,
        connector,
        config.broker_retry,
    );
    bridge.start().await;

    let store: Arc<dyn Store> = db.clone();
    let state = ServerState::new(store, bridge.clone());
    let app = app::router(state, config.static_dir.as_deref());

    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("binding {}", config.addr))?;
    info!(
        "Courier server listening on {} (instance {})",
        config.addr,
        config.instance_id
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    bridge.close().await;

    // Sessions still draining may hold store references
    match Arc::try_unwrap(db) {
        Ok(db) => {
            if let Err(e) = db.close() {
                warn!("Error closing database: {}", e);
            }
        }
        Err(_) => warn!("Database still in use, leaving it to close on exit"),
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
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
}
