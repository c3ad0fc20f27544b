//! Method registry.
//!
//! Holds the registered contracts, keyed by `(service, method)`.
//! Registration normally completes before the endpoint starts serving;
//! lookups afterward only take the read half of the lock, so dynamic
//! registration stays consistent if a caller does interleave it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::{MethodContract, RegistryError, ServiceContract};

/// Registry of service contracts, keyed by `(service, method)`.
#[derive(Default)]
pub struct MethodRegistry {
    inner: RwLock<HashMap<String, HashMap<String, Arc<MethodContract>>>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every method of a service contract.
    ///
    /// Fails without side effects on a duplicate service name or a
    /// duplicate `(service, method)` key.
    pub fn register_service(&self, contract: ServiceContract) -> Result<(), RegistryError> {
        let (service, methods) = contract.into_parts();
        let mut inner = self.inner.write();

        if inner.contains_key(&service) {
            return Err(RegistryError::DuplicateService(service));
        }

        let mut by_method: HashMap<String, Arc<MethodContract>> =
            HashMap::with_capacity(methods.len());
        for contract in methods {
            let method = contract.method().to_string();
            if by_method.insert(method.clone(), Arc::new(contract)).is_some() {
                return Err(RegistryError::DuplicateMethod { service, method });
            }
        }
        inner.insert(service, by_method);
        Ok(())
    }

    /// Resolve a method contract.
    pub fn lookup(&self, service: &str, method: &str) -> Option<Arc<MethodContract>> {
        self.inner.read().get(service)?.get(method).cloned()
    }

    /// Number of registered methods across all services.
    pub fn method_count(&self) -> usize {
        self.inner.read().values().map(HashMap::len).sum()
    }

    /// Drop every registered contract.
    pub fn clear(&self) {
        self.inner.write().clear();
    }
}
