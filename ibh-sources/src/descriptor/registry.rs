//! The process-wide table of known sources.
//!
//! The registry is read-mostly: every in-flight batch holds `Arc`s to the
//! descriptors it was created with, so edits never invalidate running work.
//! Writes (add/update/remove) serialize against readers through the `RwLock`.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use ibh_common::log::debug;

use super::{DescriptorError, SourceDescriptor, TransportPolicy, DEFAULT_SOURCES};

/// Mapping from site identifier to [`SourceDescriptor`].
#[derive(Debug, Default)]
pub struct SourceRegistry {
    inner: RwLock<HashMap<String, Arc<SourceDescriptor>>>,
}

impl SourceRegistry {
    /// An empty registry. Tests and embedders start here.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the built-in descriptor table.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        {
            let mut map = registry.inner.write().unwrap();
            for (name, descriptor) in DEFAULT_SOURCES.iter() {
                map.insert(name.clone(), Arc::new(descriptor.clone()));
            }
        }
        registry
    }

    /// Validates and inserts a descriptor, replacing any previous descriptor
    /// with the same name wholesale.
    pub fn register(&self, descriptor: SourceDescriptor) -> Result<(), DescriptorError> {
        descriptor.validate()?;
        debug!("Registering source '{}'", descriptor.name);
        let mut map = self.inner.write().unwrap();
        map.insert(descriptor.name.clone(), Arc::new(descriptor));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<SourceDescriptor>> {
        self.inner.read().unwrap().get(name).cloned()
    }

    /// All registered descriptors, sorted by name for stable listings.
    pub fn list(&self) -> Vec<Arc<SourceDescriptor>> {
        let map = self.inner.read().unwrap();
        let mut all: Vec<_> = map.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn remove(&self, name: &str) -> Option<Arc<SourceDescriptor>> {
        debug!("Removing source '{name}'");
        self.inner.write().unwrap().remove(name)
    }

    /// Whether a remote descriptor is newer than the registered one.
    /// Unknown names report `false`; there is nothing to update.
    pub fn update_available(&self, name: &str, remote: &SourceDescriptor) -> bool {
        self.get(name)
            .is_some_and(|current| remote.version > current.version)
    }

    /// Records the user's persistent answer to an HTTPS upgrade offer.
    /// The descriptor is replaced wholesale, like any other edit.
    pub fn set_transport_policy(
        &self,
        name: &str,
        policy: TransportPolicy,
    ) -> Result<(), DescriptorError> {
        let mut map = self.inner.write().unwrap();
        let current = map
            .get(name)
            .ok_or_else(|| DescriptorError::UnknownSource {
                name: name.to_string(),
            })?;
        let mut updated = (**current).clone();
        updated.transport = policy;
        map.insert(name.to_string(), Arc::new(updated));
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn register_rejects_invalid() {
        let registry = SourceRegistry::new();
        let mut descriptor = DEFAULT_SOURCES.get("danbooru").unwrap().clone();
        descriptor.endpoints.post_list = None;

        assert!(registry.register(descriptor).is_err());
        assert!(registry.get("danbooru").is_none());
    }

    #[test]
    fn register_replaces_wholesale() {
        let registry = SourceRegistry::with_defaults();
        let mut edited = DEFAULT_SOURCES.get("danbooru").unwrap().clone();
        edited.version = 7;
        registry.register(edited).unwrap();

        assert_eq!(registry.get("danbooru").unwrap().version, 7);
    }

    #[test]
    fn update_available_compares_versions() {
        let registry = SourceRegistry::with_defaults();
        let mut remote = DEFAULT_SOURCES.get("danbooru").unwrap().clone();

        remote.version = 2;
        assert!(registry.update_available("danbooru", &remote));

        remote.version = 1;
        assert!(!registry.update_available("danbooru", &remote));
        assert!(!registry.update_available("nonexistent", &remote));
    }

    #[test]
    fn transport_policy_persists() {
        let registry = SourceRegistry::with_defaults();
        registry
            .set_transport_policy("booru-feed", TransportPolicy::NeverForSite)
            .unwrap();
        assert_eq!(
            registry.get("booru-feed").unwrap().transport,
            TransportPolicy::NeverForSite
        );

        assert!(registry
            .set_transport_policy("nope", TransportPolicy::Never)
            .is_err());
    }

    #[test]
    fn list_is_sorted() {
        let registry = SourceRegistry::with_defaults();
        let names: Vec<String> = registry.list().iter().map(|d| d.name.clone()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }
}
