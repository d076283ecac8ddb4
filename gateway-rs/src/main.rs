use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use common::{CircuitBreakerManager, Dispatcher, ServiceDiscovery, ServiceRegistry, UnavailableRegistry};
use gateway::{router, AppState};

/// Environment variable naming the optional TOML settings file
const CONFIG_PATH_VAR: &str = "CHAT_CONFIG";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::var(CONFIG_PATH_VAR).ok();
    let settings = common::init(config_path.as_deref())?;

    // No registry backend is compiled in; callers fall back to fixed endpoints.
    let registry: Arc<dyn ServiceRegistry> = Arc::new(UnavailableRegistry);

    let discovery = Arc::new(ServiceDiscovery::new(registry, settings.discovery.to_config()));
    let breakers = Arc::new(CircuitBreakerManager::new(
        settings.circuit_breaker.to_config(),
        settings.circuit_breaker.idle_timeout(),
    ));
    let dispatcher = Dispatcher::new(
        Arc::clone(&discovery),
        Arc::clone(&breakers),
        settings.retry.to_config(),
    );

    discovery.start_discovery();
    breakers.start_cleanup(settings.circuit_breaker.cleanup_interval());

    let state = Arc::new(AppState {
        service_name: settings.logging.service_name.clone(),
        discovery: Arc::clone(&discovery),
        breakers: Arc::clone(&breakers),
        dispatcher,
        started: Instant::now(),
    });

    let addr = settings.server.bind_address.clone();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(address = %addr, services = ?discovery.watched_services(), "Chat gateway listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    discovery.stop_discovery().await;
    breakers.stop_cleanup().await;
    info!("Chat gateway stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
