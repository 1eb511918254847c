//! Provider seam: the services that actually execute signatures.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::context::Context;
use crate::error::DispatchError;
use crate::signature::Signature;

/// A service able to execute operations of one or more capabilities.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Instance name, matched against [`Signature::provider`].
    fn name(&self) -> &str;

    /// Execute `selector` against `context`.
    ///
    /// Providers write outputs with [`Context::set_value`]. The returned
    /// value, if any, is copied to the signature's return path.
    async fn invoke(&self, selector: &str, context: &mut Context) -> anyhow::Result<Option<Value>>;
}

/// Finds the provider that should execute a signature.
pub trait ProviderResolver: Send + Sync {
    fn resolve(&self, signature: &Signature) -> Result<Arc<dyn Provider>, DispatchError>;
}

#[derive(Default)]
struct CapabilityProviders {
    providers: Vec<Arc<dyn Provider>>,
    next: AtomicUsize,
}

/// In-process provider registry keyed by capability.
///
/// Unnamed signatures are spread round-robin over the providers registered
/// for their capability.
#[derive(Default)]
pub struct ProviderRegistry {
    by_capability: RwLock<HashMap<String, CapabilityProviders>>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.by_capability.read();
        let mut map = f.debug_map();
        for (capability, entry) in guard.iter() {
            let names: Vec<&str> = entry.providers.iter().map(|p| p.name()).collect();
            map.entry(capability, &names);
        }
        map.finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` as offering `capability`.
    pub fn register(&self, capability: impl Into<String>, provider: Arc<dyn Provider>) {
        let capability = capability.into();
        tracing::debug!(%capability, provider = provider.name(), "provider registered");
        self.by_capability
            .write()
            .entry(capability)
            .or_default()
            .providers
            .push(provider);
    }

    pub fn with(self, capability: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.register(capability, provider);
        self
    }

    /// Remove every provider named `name`. Returns how many were removed.
    pub fn deregister(&self, name: &str) -> usize {
        let mut guard = self.by_capability.write();
        let mut removed = 0;
        for entry in guard.values_mut() {
            let before = entry.providers.len();
            entry.providers.retain(|p| p.name() != name);
            removed += before - entry.providers.len();
        }
        guard.retain(|_, entry| !entry.providers.is_empty());
        removed
    }

    pub fn capabilities(&self) -> Vec<String> {
        self.by_capability.read().keys().cloned().collect()
    }
}

impl ProviderResolver for ProviderRegistry {
    fn resolve(&self, signature: &Signature) -> Result<Arc<dyn Provider>, DispatchError> {
        let not_found = || DispatchError::ProviderNotFound {
            signature: signature.to_string(),
        };
        let guard = self.by_capability.read();
        let entry = guard.get(&signature.capability).ok_or_else(not_found)?;
        match &signature.provider {
            Some(name) => entry
                .providers
                .iter()
                .find(|p| p.name() == name)
                .cloned()
                .ok_or_else(not_found),
            None => {
                if entry.providers.is_empty() {
                    return Err(not_found());
                }
                let slot = entry.next.fetch_add(1, Ordering::Relaxed) % entry.providers.len();
                Ok(Arc::clone(&entry.providers[slot]))
            }
        }
    }
}

impl<T: ProviderResolver + ?Sized> ProviderResolver for Arc<T> {
    fn resolve(&self, signature: &Signature) -> Result<Arc<dyn Provider>, DispatchError> {
        (**self).resolve(signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl Provider for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn invoke(&self, _selector: &str, _context: &mut Context) -> anyhow::Result<Option<Value>> {
            Ok(Some(Value::String(self.0.to_string())))
        }
    }

    #[test]
    fn test_resolve_by_name_and_round_robin() {
        let registry = ProviderRegistry::new()
            .with("Arithmetic", Arc::new(Named("a")))
            .with("Arithmetic", Arc::new(Named("b")));

        let named = Signature::new("Arithmetic", "add").with_provider("b");
        assert_eq!(registry.resolve(&named).unwrap().name(), "b");

        let any = Signature::new("Arithmetic", "add");
        let first = registry.resolve(&any).unwrap().name().to_string();
        let second = registry.resolve(&any).unwrap().name().to_string();
        assert_ne!(first, second);
    }

    #[test]
    fn test_missing_provider() {
        let registry = ProviderRegistry::new().with("Arithmetic", Arc::new(Named("a")));
        let err = registry
            .resolve(&Signature::new("Geometry", "area"))
            .err()
            .unwrap();
        assert_eq!(
            err,
            DispatchError::ProviderNotFound {
                signature: "Geometry#area".into()
            }
        );

        let err = registry
            .resolve(&Signature::new("Arithmetic", "add").with_provider("zzz"))
            .err()
            .unwrap();
        assert!(matches!(err, DispatchError::ProviderNotFound { .. }));
    }

    #[test]
    fn test_deregister() {
        let registry = ProviderRegistry::new().with("Arithmetic", Arc::new(Named("a")));
        assert_eq!(registry.deregister("a"), 1);
        assert!(registry.capabilities().is_empty());
    }
}
