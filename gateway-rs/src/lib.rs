//! Chat gateway HTTP surface
//!
//! The gateway owns the single instances of the dispatch managers and exposes
//! their pull-based stats for external scrapers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;

use common::{
    CircuitBreakerManager, CircuitBreakerStats, CircuitState, Dispatcher, LoadBalanceStrategy,
    ServiceDiscovery, ServiceStats,
};

/// Shared state handed to every handler
pub struct AppState {
    pub service_name: String,
    pub discovery: Arc<ServiceDiscovery>,
    pub breakers: Arc<CircuitBreakerManager>,
    pub dispatcher: Dispatcher,
    pub started: Instant,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    healthy: bool,
    service_name: String,
    uptime_seconds: u64,
    status: String,
    open_circuits: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ServiceStatsResponse {
    service: String,
    strategy: LoadBalanceStrategy,
    #[serde(flatten)]
    stats: ServiceStats,
}

/// Builds the gateway router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats/circuit-breakers", get(circuit_breakers_handler))
        .route("/stats/services", get(services_handler))
        .route("/stats/services/:name", get(service_handler))
        .with_state(state)
}

/// GET /health - gateway liveness plus which circuits are currently open
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut open_circuits: Vec<String> = state
        .breakers
        .get_all_circuit_breaker_stats()
        .into_iter()
        .filter(|(_, stats)| stats.state != CircuitState::Closed)
        .map(|(name, _)| name)
        .collect();
    open_circuits.sort();

    let status = if open_circuits.is_empty() { "SERVING" } else { "DEGRADED" };

    Json(HealthResponse {
        healthy: true,
        service_name: state.service_name.clone(),
        uptime_seconds: state.started.elapsed().as_secs(),
        status: status.to_string(),
        open_circuits,
    })
}

/// GET /stats/circuit-breakers
async fn circuit_breakers_handler(
    State(state): State<Arc<AppState>>,
) -> Json<HashMap<String, CircuitBreakerStats>> {
    Json(state.breakers.get_all_circuit_breaker_stats())
}

/// GET /stats/services - every watched service
async fn services_handler(State(state): State<Arc<AppState>>) -> Json<Vec<ServiceStatsResponse>> {
    let stats = state
        .discovery
        .watched_services()
        .into_iter()
        .map(|service| service_stats(&state, service))
        .collect();
    Json(stats)
}

/// GET /stats/services/:name
async fn service_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Json<ServiceStatsResponse> {
    Json(service_stats(&state, name))
}

fn service_stats(state: &AppState, service: String) -> ServiceStatsResponse {
    ServiceStatsResponse {
        strategy: state.discovery.load_balance_strategy(&service),
        stats: state.discovery.get_service_stats(&service),
        service,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use common::{
        CircuitBreakerConfig, DiscoveryConfig, InMemoryRegistry, RetryConfig, ServiceInstance,
        ServiceRegistry,
    };
    use std::time::Duration;
    use tower::ServiceExt;

    async fn state() -> Arc<AppState> {
        let registry = InMemoryRegistry::new();
        registry
            .register(&ServiceInstance::new("user-1", "user-service", "10.0.0.1", 50051))
            .await
            .unwrap();

        let discovery = Arc::new(ServiceDiscovery::new(Arc::new(registry), DiscoveryConfig::default()));
        discovery.refresh_services().await;
        let breakers = Arc::new(CircuitBreakerManager::new(
            CircuitBreakerConfig::default(),
            Duration::from_secs(3600),
        ));

        Arc::new(AppState {
            service_name: "chat-gateway".to_string(),
            dispatcher: Dispatcher::new(Arc::clone(&discovery), Arc::clone(&breakers), RetryConfig::default()),
            discovery,
            breakers,
            started: Instant::now(),
        })
    }

    async fn get_json(state: Arc<AppState>, uri: &str) -> serde_json::Value {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_open_circuits() {
        let state = state().await;
        let body = get_json(Arc::clone(&state), "/health").await;
        assert_eq!(body["status"], "SERVING");

        let cfg = CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        };
        let _ = state
            .breakers
            .execute_guarded("message-service", || Err::<(), _>("down"), &cfg);

        let body = get_json(state, "/health").await;
        assert_eq!(body["status"], "DEGRADED");
        assert_eq!(body["open_circuits"][0], "message-service");
    }

    #[tokio::test]
    async fn test_circuit_breaker_stats() {
        let state = state().await;
        state
            .dispatcher
            .call("user-service", |_| Ok::<_, std::io::Error>(()))
            .unwrap();

        let body = get_json(state, "/stats/circuit-breakers").await;
        assert_eq!(body["user-service"]["state"], "CLOSED");
        assert_eq!(body["user-service"]["success_count"], 1);
    }

    #[tokio::test]
    async fn test_service_stats() {
        let state = state().await;

        let body = get_json(Arc::clone(&state), "/stats/services/user-service").await;
        assert_eq!(body["service"], "user-service");
        assert_eq!(body["strategy"], "round_robin");
        assert_eq!(body["healthy_instances"], 1);

        let body = get_json(state, "/stats/services").await;
        assert_eq!(body.as_array().map(|a| a.len()), Some(3));
    }
}
