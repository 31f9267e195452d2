use std::sync::Arc;

use dashmap::{DashMap, Entry};

use crate::rpc::service::ServicePool;

/// Indicates that registering a service failed because the name is already taken.
#[derive(Debug, thiserror::Error)]
#[error("service '{service_name}' is already registered")]
pub struct ServiceAlreadyRegistered {
    pub service_name: String,
}

/// Indicates that a service is not (or no longer) registered.
#[derive(Debug, thiserror::Error)]
#[error("service '{service_name}' is unavailable")]
pub struct ServiceUnavailable {
    pub service_name: String,
}

/// Service pools registered on a messenger, keyed by their full service name.
#[derive(Debug)]
pub struct ServiceRegistry {
    services: DashMap<String, Arc<ServicePool>, ahash::RandomState>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        service_name: &str,
        pool: Arc<ServicePool>,
    ) -> Result<(), ServiceAlreadyRegistered> {
        match self.services.entry(service_name.to_string()) {
            Entry::Occupied(entry) => Err(ServiceAlreadyRegistered {
                service_name: entry.key().clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(pool);
                Ok(())
            }
        }
    }

    pub fn unregister(&self, service_name: &str) -> Result<Arc<ServicePool>, ServiceUnavailable> {
        self.services
            .remove(service_name)
            .map(|(_, pool)| pool)
            .ok_or_else(|| ServiceUnavailable {
                service_name: service_name.to_string(),
            })
    }

    /// Look up the pool serving `service_name`.
    pub fn get(&self, service_name: &str) -> Option<Arc<ServicePool>> {
        self.services
            .get(service_name)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub(crate) fn clear(&self) {
        self.services.clear();
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self {
            services: DashMap::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculator::GenericCalculatorService;

    fn pool() -> Arc<ServicePool> {
        ServicePool::new(4, 1, Arc::new(GenericCalculatorService::new().unwrap()))
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = ServiceRegistry::new();
        registry.register("svc", pool()).unwrap();

        assert!(registry.get("svc").is_some());
        assert!(registry.get("other").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_registration_error() {
        let registry = ServiceRegistry::new();
        registry.register("svc", pool()).unwrap();

        let result = registry.register("svc", pool());
        assert!(matches!(result, Err(ServiceAlreadyRegistered { .. })));
    }

    #[tokio::test]
    async fn test_second_unregister_is_unavailable() {
        let registry = ServiceRegistry::new();
        registry.register("svc", pool()).unwrap();

        assert!(registry.unregister("svc").is_ok());
        let result = registry.unregister("svc");
        assert!(matches!(result, Err(ServiceUnavailable { .. })));
        assert!(registry.is_empty());
    }
}
