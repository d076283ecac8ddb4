//! External service registry boundary
//!
//! `ServiceDiscovery` never talks to Consul or etcd directly; it goes through
//! [`ServiceRegistry`]. Two implementations ship with the crate: an in-process
//! registry for development and tests, and a stand-in for deployments where no
//! registry is configured.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::discovery::ServiceInstance;
use crate::error::RegistryError;

/// Operations the discovery cache needs from a service registry
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Returns every instance registered under `service_name`, healthy or not
    async fn fetch_instances(&self, service_name: &str) -> Result<Vec<ServiceInstance>, RegistryError>;

    /// Advertises an instance
    async fn register(&self, instance: &ServiceInstance) -> Result<(), RegistryError>;

    /// Withdraws an instance by id
    async fn deregister(&self, instance_id: &str) -> Result<(), RegistryError>;

    /// Asks the registry whether an instance is currently passing its checks
    async fn check_health(&self, instance_id: &str) -> Result<bool, RegistryError>;

    /// Whether this registry is backed by anything at all
    fn is_available(&self) -> bool {
        true
    }
}

/// In-process registry (for development/testing)
///
/// Instances are returned in registration order.
#[derive(Clone, Default)]
pub struct InMemoryRegistry {
    instances: Arc<RwLock<Vec<ServiceInstance>>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks an instance healthy or unhealthy as a registry-side check would
    pub async fn set_health(&self, instance_id: &str, healthy: bool) -> Result<(), RegistryError> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .iter_mut()
            .find(|i| i.id == instance_id)
            .ok_or_else(|| RegistryError::ServiceNotFound(instance_id.to_string()))?;
        instance.healthy = healthy;
        Ok(())
    }

    /// Number of registered instances across all services
    pub async fn count(&self) -> usize {
        self.instances.read().await.len()
    }
}

#[async_trait]
impl ServiceRegistry for InMemoryRegistry {
    async fn fetch_instances(&self, service_name: &str) -> Result<Vec<ServiceInstance>, RegistryError> {
        let instances = self.instances.read().await;
        Ok(instances
            .iter()
            .filter(|i| i.name == service_name)
            .cloned()
            .collect())
    }

    async fn register(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        let mut instances = self.instances.write().await;
        match instances.iter_mut().find(|i| i.id == instance.id) {
            Some(existing) => *existing = instance.clone(),
            None => instances.push(instance.clone()),
        }
        Ok(())
    }

    async fn deregister(&self, instance_id: &str) -> Result<(), RegistryError> {
        let mut instances = self.instances.write().await;
        let before = instances.len();
        instances.retain(|i| i.id != instance_id);

        if instances.len() == before {
            return Err(RegistryError::ServiceNotFound(instance_id.to_string()));
        }
        Ok(())
    }

    async fn check_health(&self, instance_id: &str) -> Result<bool, RegistryError> {
        self.instances
            .read()
            .await
            .iter()
            .find(|i| i.id == instance_id)
            .map(|i| i.healthy)
            .ok_or_else(|| RegistryError::ServiceNotFound(instance_id.to_string()))
    }
}

/// Registry used when no registry backend is configured
///
/// Lookups come back empty and writes are logged and accepted, so callers fall
/// through to their fixed fallback endpoints instead of failing.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableRegistry;

#[async_trait]
impl ServiceRegistry for UnavailableRegistry {
    async fn fetch_instances(&self, service_name: &str) -> Result<Vec<ServiceInstance>, RegistryError> {
        debug!(service = %service_name, "No service registry configured, returning no instances");
        Ok(Vec::new())
    }

    async fn register(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        info!(
            service = %instance.name,
            instance_id = %instance.id,
            endpoint = %instance.endpoint(),
            "Service registry unavailable, skipping registration"
        );
        Ok(())
    }

    async fn deregister(&self, instance_id: &str) -> Result<(), RegistryError> {
        info!(instance_id = %instance_id, "Service registry unavailable, skipping deregistration");
        Ok(())
    }

    async fn check_health(&self, _instance_id: &str) -> Result<bool, RegistryError> {
        Err(RegistryError::Unavailable)
    }

    fn is_available(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_registry() {
        let registry = InMemoryRegistry::new();

        registry
            .register(&ServiceInstance::new("user-1", "user-service", "10.0.0.1", 50051))
            .await
            .unwrap();
        registry
            .register(&ServiceInstance::new("user-2", "user-service", "10.0.0.2", 50051))
            .await
            .unwrap();
        registry
            .register(&ServiceInstance::new("msg-1", "message-service", "10.0.0.3", 50053))
            .await
            .unwrap();
        assert_eq!(registry.count().await, 3);

        let users = registry.fetch_instances("user-service").await.unwrap();
        let ids: Vec<_> = users.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["user-1", "user-2"]);

        registry.set_health("user-2", false).await.unwrap();
        assert!(!registry.check_health("user-2").await.unwrap());

        registry.deregister("user-1").await.unwrap();
        assert_eq!(registry.fetch_instances("user-service").await.unwrap().len(), 1);
        let err = tokio_test::assert_err!(registry.deregister("user-1").await);
        assert_eq!(err, RegistryError::ServiceNotFound("user-1".to_string()));
    }

    #[tokio::test]
    async fn test_reregister_replaces_in_place() {
        let registry = InMemoryRegistry::new();
        registry
            .register(&ServiceInstance::new("user-1", "user-service", "10.0.0.1", 50051))
            .await
            .unwrap();
        registry
            .register(&ServiceInstance::new("user-1", "user-service", "10.0.0.9", 50052))
            .await
            .unwrap();

        let users = registry.fetch_instances("user-service").await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].endpoint(), "10.0.0.9:50052");
    }

    #[tokio::test]
    async fn test_unavailable_registry_degrades_quietly() {
        let registry = UnavailableRegistry;

        assert!(!registry.is_available());
        assert!(registry.fetch_instances("user-service").await.unwrap().is_empty());
        tokio_test::assert_ok!(
            registry
                .register(&ServiceInstance::new("user-1", "user-service", "10.0.0.1", 50051))
                .await
        );
        tokio_test::assert_ok!(registry.deregister("user-1").await);
        assert_eq!(registry.check_health("user-1").await, Err(RegistryError::Unavailable));
    }
}
