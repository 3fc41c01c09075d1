//! Scheme → backend instance mapping.
//!
//! The registry owns one active store per scheme (profile selection across
//! multiple saved profiles is the shell's concern) plus the per-profile
//! enabled flag. Lookups are cheap clone-outs under a plain mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{ErrorKind, StoreError};
use crate::uri::{ObjectUri, Scheme};
use crate::GenericObjectStore;

#[derive(Clone)]
pub struct RegistryEntry {
    pub scheme: Scheme,
    pub store: Arc<GenericObjectStore>,
    pub profile_id: String,
    pub enabled: bool,
}

#[derive(Default)]
pub struct StoreRegistry {
    entries: Mutex<HashMap<Scheme, RegistryEntry>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs (or replaces) the active store for a scheme.
    pub fn register(
        &self,
        scheme: Scheme,
        store: Arc<GenericObjectStore>,
        profile_id: impl Into<String>,
    ) {
        debug_assert_eq!(scheme, store.scheme());
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            scheme,
            RegistryEntry {
                scheme,
                store,
                profile_id: profile_id.into(),
                enabled: true,
            },
        );
    }

    pub fn set_enabled(&self, scheme: Scheme, enabled: bool) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&scheme) {
            Some(entry) => {
                entry.enabled = enabled;
                Ok(())
            }
            None => Err(StoreError::new(
                ErrorKind::UnsupportedScheme,
                format!("no provider configured for scheme '{scheme}'"),
            )),
        }
    }

    pub fn get(&self, scheme: Scheme) -> Result<Arc<GenericObjectStore>, StoreError> {
        let entries = self.entries.lock().unwrap();
        match entries.get(&scheme) {
            Some(entry) if entry.enabled => Ok(Arc::clone(&entry.store)),
            Some(_) => Err(StoreError::new(
                ErrorKind::UnsupportedScheme,
                format!("the provider for scheme '{scheme}' is disabled"),
            )),
            None => Err(StoreError::new(
                ErrorKind::UnsupportedScheme,
                format!("no provider configured for scheme '{scheme}'"),
            )),
        }
    }

    pub fn resolve(&self, uri: &ObjectUri) -> Result<Arc<GenericObjectStore>, StoreError> {
        self.get(uri.scheme())
            .map_err(|e| e.with_uri(uri))
    }

    /// Snapshot for the shells' provider list.
    pub fn entries(&self) -> Vec<RegistryEntry> {
        let entries = self.entries.lock().unwrap();
        let mut list: Vec<_> = entries.values().cloned().collect();
        list.sort_by_key(|e| e.scheme.as_str());
        list
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{FileConfig, LocalFs};

    fn local_store() -> Arc<GenericObjectStore> {
        Arc::new(GenericObjectStore::LocalFs(LocalFs::new(
            FileConfig::default(),
            Duration::from_secs(30),
        )))
    }

    #[test]
    fn lookup_honors_enabled_flag() {
        let registry = StoreRegistry::new();
        registry.register(Scheme::File, local_store(), "local-default");
        assert!(registry.get(Scheme::File).is_ok());

        registry.set_enabled(Scheme::File, false).unwrap();
        let err = registry.get(Scheme::File).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedScheme);

        registry.set_enabled(Scheme::File, true).unwrap();
        assert!(registry.get(Scheme::File).is_ok());
    }

    #[test]
    fn unknown_scheme_is_reported() {
        let registry = StoreRegistry::new();
        let err = registry.get(Scheme::S3).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedScheme);
    }

    #[test]
    fn resolve_goes_by_uri_scheme() {
        let registry = StoreRegistry::new();
        registry.register(Scheme::File, local_store(), "local-default");
        let uri = ObjectUri::parse("file:///tmp/x").unwrap();
        assert!(registry.resolve(&uri).is_ok());
        let s3 = ObjectUri::parse("s3://bucket/x").unwrap();
        assert!(registry.resolve(&s3).is_err());
    }
}
