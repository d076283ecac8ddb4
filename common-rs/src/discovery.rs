//! # Service Discovery
//!
//! Caches the instances of each logical service, tracks their health, and
//! picks one instance per call with a per-service load-balancing strategy.
//!
//! The cache is filled only by [`ServiceDiscovery::refresh_services`], which a
//! background task runs every `interval` once [`ServiceDiscovery::start_discovery`]
//! is called. Callers always receive copies of cached instances.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::registry::ServiceRegistry;

/// Logical services watched when nothing else is configured
pub const DEFAULT_SERVICES: [&str; 3] = ["user-service", "social-service", "message-service"];

const WEIGHT_META_KEY: &str = "weight";

/// One addressable instance of a logical service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Unique instance ID
    pub id: String,
    /// Logical service name
    pub name: String,
    /// Host or IP address
    pub address: String,
    /// Port number
    pub port: u16,
    /// Free-form tags, e.g. `protocol = grpc`
    #[serde(default)]
    pub tags: HashMap<String, String>,
    /// Free-form metadata; `weight` feeds weighted balancing
    #[serde(default)]
    pub meta: HashMap<String, String>,
    /// Whether the instance is passing health checks
    pub healthy: bool,
    /// Epoch milliseconds of the last health observation
    pub last_check_time: i64,
}

impl ServiceInstance {
    /// Create a new healthy service instance
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: address.into(),
            port,
            tags: HashMap::new(),
            meta: HashMap::new(),
            healthy: true,
            last_check_time: Utc::now().timestamp_millis(),
        }
    }

    /// Add a tag
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Add metadata
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// `address:port`, ready to dial
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Weight for weighted balancing; missing or invalid values count as 1
    pub fn weight(&self) -> u32 {
        self.meta
            .get(WEIGHT_META_KEY)
            .and_then(|w| w.parse::<u32>().ok())
            .filter(|w| *w > 0)
            .unwrap_or(1)
    }
}

/// Rule for choosing one instance among several healthy ones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    #[default]
    RoundRobin,
    Random,
    /// Fewest in-flight calls, counted through [`ConnectionGuard`]s
    LeastConn,
    /// Smooth weighted round-robin over the `weight` metadata
    Weighted,
}

impl fmt::Display for LoadBalanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadBalanceStrategy::RoundRobin => write!(f, "ROUND_ROBIN"),
            LoadBalanceStrategy::Random => write!(f, "RANDOM"),
            LoadBalanceStrategy::LeastConn => write!(f, "LEAST_CONN"),
            LoadBalanceStrategy::Weighted => write!(f, "WEIGHTED"),
        }
    }
}

/// Runtime discovery configuration
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryConfig {
    /// How often the background task refreshes the cache
    pub interval: Duration,
    /// Strategy for services without an explicit override
    pub default_strategy: LoadBalanceStrategy,
    /// Logical services refreshed from the registry
    pub services: Vec<String>,
    /// Per-service strategy overrides
    pub strategies: HashMap<String, LoadBalanceStrategy>,
    /// Fixed `host:port` per service, used when discovery yields nothing
    pub fallback_endpoints: HashMap<String, String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            default_strategy: LoadBalanceStrategy::RoundRobin,
            services: DEFAULT_SERVICES.iter().map(|s| s.to_string()).collect(),
            strategies: HashMap::new(),
            fallback_endpoints: HashMap::new(),
        }
    }
}

/// Instance counts for one logical service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStats {
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub unhealthy_instances: usize,
    /// Time of the last successful refresh, `None` if never refreshed
    pub last_update_time: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct CachedService {
    instances: Vec<ServiceInstance>,
    updated_at: DateTime<Utc>,
}

/// Tracks one in-flight call against an instance for least-connection balancing
///
/// The count is released when the guard is dropped, and an instance with no
/// calls left in flight is forgotten.
#[derive(Debug)]
pub struct ConnectionGuard {
    connections: Arc<Mutex<HashMap<String, usize>>>,
    instance_id: String,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let mut connections = lock(&self.connections);
        if let Some(count) = connections.get_mut(&self.instance_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                connections.remove(&self.instance_id);
            }
        }
    }
}

/// Instance cache and load balancer for every logical service
pub struct ServiceDiscovery {
    registry: Arc<dyn ServiceRegistry>,
    config: DiscoveryConfig,
    cache: Mutex<HashMap<String, CachedService>>,
    strategies: Mutex<HashMap<String, LoadBalanceStrategy>>,
    counters: Mutex<HashMap<String, Arc<AtomicUsize>>>,
    // In-flight calls keyed by instance id; only nonzero counts are kept.
    connections: Arc<Mutex<HashMap<String, usize>>>,
    // Smooth weighted round-robin scores, per service then per instance id.
    weight_scores: Mutex<HashMap<String, HashMap<String, i64>>>,
    watched: Mutex<Vec<String>>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl fmt::Debug for ServiceDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDiscovery")
            .field("config", &self.config)
            .field("registry_available", &self.registry.is_available())
            .finish_non_exhaustive()
    }
}

impl ServiceDiscovery {
    /// Creates an empty discovery cache backed by `registry`
    pub fn new(registry: Arc<dyn ServiceRegistry>, config: DiscoveryConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        let mut watched = Vec::new();
        for service in &config.services {
            if !watched.contains(service) {
                watched.push(service.clone());
            }
        }

        Self {
            registry,
            strategies: Mutex::new(config.strategies.clone()),
            config,
            cache: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            connections: Arc::new(Mutex::new(HashMap::new())),
            weight_scores: Mutex::new(HashMap::new()),
            watched: Mutex::new(watched),
            worker_handle: Mutex::new(None),
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Advertises an instance to the registry; the local cache is untouched
    pub async fn register_service(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        self.registry.register(instance).await?;

        info!(
            service = %instance.name,
            instance_id = %instance.id,
            endpoint = %instance.endpoint(),
            "Service instance registered"
        );
        Ok(())
    }

    /// Withdraws an instance from the registry; the local cache is untouched
    pub async fn deregister_service(&self, instance_id: &str) -> Result<(), RegistryError> {
        self.registry.deregister(instance_id).await?;

        info!(instance_id = %instance_id, "Service instance deregistered");
        Ok(())
    }

    /// Copies of the cached healthy instances of `service_name`, in cache order
    pub fn get_healthy_instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        lock(&self.cache)
            .get(service_name)
            .map(|cached| cached.instances.iter().filter(|i| i.healthy).cloned().collect())
            .unwrap_or_default()
    }

    /// Picks one healthy instance of `service_name` using `strategy`
    ///
    /// Returns `None` when no healthy instance is cached. A single healthy
    /// instance is returned without consulting the strategy.
    pub fn get_instance(&self, service_name: &str, strategy: LoadBalanceStrategy) -> Option<ServiceInstance> {
        let mut healthy = self.get_healthy_instances(service_name);

        let index = match healthy.len() {
            0 => {
                debug!(service = %service_name, "No healthy instances available");
                return None;
            }
            1 => 0,
            count => match strategy {
                LoadBalanceStrategy::RoundRobin => self.round_robin_index(service_name, count),
                LoadBalanceStrategy::Random => rand::thread_rng().gen_range(0..count),
                LoadBalanceStrategy::LeastConn => self.least_conn_index(&healthy),
                LoadBalanceStrategy::Weighted => self.weighted_index(service_name, &healthy),
            },
        };

        Some(healthy.swap_remove(index))
    }

    /// Picks an instance with the strategy configured for `service_name`
    pub fn next_instance(&self, service_name: &str) -> Option<ServiceInstance> {
        let strategy = self.load_balance_strategy(service_name);
        self.get_instance(service_name, strategy)
    }

    /// Sets the strategy `next_instance` uses for `service_name`
    pub fn set_load_balance_strategy(&self, service_name: &str, strategy: LoadBalanceStrategy) {
        lock(&self.strategies).insert(service_name.to_string(), strategy);
        info!(service = %service_name, strategy = %strategy, "Load balance strategy updated");
    }

    /// The strategy in effect for `service_name`
    pub fn load_balance_strategy(&self, service_name: &str) -> LoadBalanceStrategy {
        lock(&self.strategies)
            .get(service_name)
            .copied()
            .unwrap_or(self.config.default_strategy)
    }

    /// Counts one in-flight call against `instance` until the guard drops
    pub fn acquire_connection(&self, instance: &ServiceInstance) -> ConnectionGuard {
        *lock(&self.connections).entry(instance.id.clone()).or_insert(0) += 1;

        ConnectionGuard {
            connections: Arc::clone(&self.connections),
            instance_id: instance.id.clone(),
        }
    }

    /// In-flight calls currently counted against an instance
    pub fn active_connections(&self, instance_id: &str) -> usize {
        lock(&self.connections).get(instance_id).copied().unwrap_or(0)
    }

    /// Flips one cached instance's health flag; returns false if it is not cached
    pub fn update_service_health(&self, service_name: &str, instance_id: &str, healthy: bool) -> bool {
        let mut cache = lock(&self.cache);
        let Some(instance) = cache
            .get_mut(service_name)
            .and_then(|cached| cached.instances.iter_mut().find(|i| i.id == instance_id))
        else {
            debug!(service = %service_name, instance_id = %instance_id, "Health update for unknown instance");
            return false;
        };

        let changed = instance.healthy != healthy;
        instance.healthy = healthy;
        instance.last_check_time = Utc::now().timestamp_millis();
        drop(cache);

        if changed {
            info!(
                service = %service_name,
                instance_id = %instance_id,
                healthy = %healthy,
                "Instance health changed"
            );
        }
        true
    }

    /// Adds a logical service to the refresh set
    pub fn watch_service(&self, service_name: &str) {
        let mut watched = lock(&self.watched);
        if !watched.iter().any(|s| s == service_name) {
            watched.push(service_name.to_string());
        }
    }

    /// Logical services refreshed from the registry
    pub fn watched_services(&self) -> Vec<String> {
        lock(&self.watched).clone()
    }

    /// Rebuilds the cache of every watched service from the registry
    ///
    /// Each service's list is replaced wholesale. A service whose fetch fails
    /// keeps its previous entry. Returns how many services were refreshed.
    pub async fn refresh_services(&self) -> usize {
        if !self.registry.is_available() {
            debug!("Service registry unavailable, skipping refresh");
            return 0;
        }

        let services = self.watched_services();
        let mut refreshed = 0;

        for service in &services {
            match self.registry.fetch_instances(service).await {
                Ok(instances) => {
                    let count = instances.len();
                    lock(&self.cache).insert(
                        service.clone(),
                        CachedService {
                            instances,
                            updated_at: Utc::now(),
                        },
                    );
                    refreshed += 1;
                    debug!(service = %service, instances = %count, "Service cache refreshed");
                }
                Err(e) => {
                    warn!(service = %service, error = %e, "Failed to refresh service, keeping cached instances");
                }
            }
        }

        debug!(refreshed = %refreshed, watched = %services.len(), "Discovery refresh completed");
        refreshed
    }

    /// Asks the registry about every cached instance and applies the answers
    ///
    /// Returns how many instances were checked.
    pub async fn run_health_checks(&self) -> usize {
        if !self.registry.is_available() {
            return 0;
        }

        let targets: Vec<(String, String)> = lock(&self.cache)
            .iter()
            .flat_map(|(name, cached)| {
                cached
                    .instances
                    .iter()
                    .map(move |i| (name.clone(), i.id.clone()))
            })
            .collect();

        let mut checked = 0;
        for (service, instance_id) in targets {
            match self.registry.check_health(&instance_id).await {
                Ok(healthy) => {
                    if self.update_service_health(&service, &instance_id, healthy) {
                        checked += 1;
                    }
                }
                Err(e) => {
                    warn!(service = %service, instance_id = %instance_id, error = %e, "Health check failed");
                }
            }
        }
        checked
    }

    /// Instance counts for `service_name` from the current cache
    pub fn get_service_stats(&self, service_name: &str) -> ServiceStats {
        let cache = lock(&self.cache);
        match cache.get(service_name) {
            Some(cached) => {
                let healthy = cached.instances.iter().filter(|i| i.healthy).count();
                ServiceStats {
                    total_instances: cached.instances.len(),
                    healthy_instances: healthy,
                    unhealthy_instances: cached.instances.len() - healthy,
                    last_update_time: Some(cached.updated_at),
                }
            }
            None => ServiceStats {
                total_instances: 0,
                healthy_instances: 0,
                unhealthy_instances: 0,
                last_update_time: None,
            },
        }
    }

    /// Starts the background refresh loop; a no-op if it is already running
    ///
    /// The first refresh runs immediately. The loop holds only a weak
    /// reference and ends on its own once the discovery is dropped.
    pub fn start_discovery(self: &Arc<Self>) {
        let mut worker_handle = lock(&self.worker_handle);
        if worker_handle.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("Discovery loop already running");
            return;
        }

        let discovery: Weak<Self> = Arc::downgrade(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let period = self.config.interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Discovery loop shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        let Some(discovery) = discovery.upgrade() else {
                            break;
                        };
                        discovery.refresh_services().await;
                    }
                }
            }
        });

        *worker_handle = Some(handle);
        info!(interval_secs = %period.as_secs(), "Service discovery started");
    }

    /// Stops the background refresh loop and waits for it to finish
    pub async fn stop_discovery(&self) {
        let handle = lock(&self.worker_handle).take();
        let Some(handle) = handle else {
            return;
        };

        let _ = self.shutdown_tx.send(());
        if let Err(e) = handle.await {
            warn!(error = %e, "Discovery loop ended abnormally");
        }
        info!("Service discovery stopped");
    }

    fn round_robin_index(&self, service_name: &str, count: usize) -> usize {
        let counter = {
            let mut counters = lock(&self.counters);
            Arc::clone(counters.entry(service_name.to_string()).or_default())
        };
        counter.fetch_add(1, Ordering::Relaxed) % count
    }

    fn least_conn_index(&self, healthy: &[ServiceInstance]) -> usize {
        let connections = lock(&self.connections);
        healthy
            .iter()
            .enumerate()
            .min_by_key(|(_, i)| connections.get(&i.id).copied().unwrap_or(0))
            .map(|(index, _)| index)
            .unwrap_or(0)
    }

    fn weighted_index(&self, service_name: &str, healthy: &[ServiceInstance]) -> usize {
        let mut all_scores = lock(&self.weight_scores);
        let scores = all_scores.entry(service_name.to_string()).or_default();
        scores.retain(|id, _| healthy.iter().any(|i| &i.id == id));

        let mut total = 0i64;
        let mut best: Option<(usize, i64)> = None;
        for (index, instance) in healthy.iter().enumerate() {
            let weight = i64::from(instance.weight());
            total += weight;

            let score = scores.entry(instance.id.clone()).or_insert(0);
            *score += weight;

            if best.map_or(true, |(_, top)| *score > top) {
                best = Some((index, *score));
            }
        }

        let (index, _) = best.unwrap_or((0, 0));
        if let Some(score) = scores.get_mut(&healthy[index].id) {
            *score -= total;
        }
        index
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
