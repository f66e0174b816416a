//! Backend adapters.
//!
//! Every storage backend (Supabase, Firestore, the Neon REST API and the
//! local SQLite store) implements [`BackendAdapter`] over the normalised
//! entity schema in [`crate::model`]. The [`BackendRegistry`] holds the
//! configured adapters and their sync flags.

pub mod firebase;
pub mod http;
pub mod neon;
pub mod rows;
pub mod supabase;

#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::info;

use crate::config::AppConfig;
use crate::error::StoreResult;
use crate::local_store::LocalStore;
use crate::model::{BackendKind, NewProduct, NewTransaction, Product, Transaction};

/// Storage operations every backend supports.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// One minimal read used by the connectivity probe.
    async fn health_check(&self) -> StoreResult<()>;

    async fn list_products(&self) -> StoreResult<Vec<Product>>;

    /// Persist a product; the returned record carries the backend-assigned id.
    async fn create_product(&self, input: &NewProduct) -> StoreResult<Product>;

    async fn list_transactions(&self) -> StoreResult<Vec<Transaction>>;

    async fn create_transaction(&self, input: &NewTransaction) -> StoreResult<Transaction>;
}

/// Configured adapters keyed by backend kind. The local store is always present.
pub struct BackendRegistry {
    adapters: HashMap<BackendKind, Arc<dyn BackendAdapter>>,
    sync_enabled: HashSet<BackendKind>,
}

impl BackendRegistry {
    pub fn new(local: Arc<LocalStore>) -> Self {
        let mut adapters: HashMap<BackendKind, Arc<dyn BackendAdapter>> = HashMap::new();
        adapters.insert(BackendKind::Local, local);
        Self {
            adapters,
            sync_enabled: HashSet::new(),
        }
    }

    /// Build the registry from configuration, skipping remote backends whose
    /// connection settings are missing.
    pub fn from_config(config: &AppConfig, local: Arc<LocalStore>) -> StoreResult<Self> {
        let mut registry = Self::new(local);
        if let Some(cfg) = &config.supabase {
            let adapter = supabase::SupabaseBackend::new(cfg)?;
            registry.register(Arc::new(adapter), config.is_sync_enabled(BackendKind::Supabase));
        }
        if let Some(cfg) = &config.firebase {
            let adapter = firebase::FirebaseBackend::new(cfg)?;
            registry.register(Arc::new(adapter), config.is_sync_enabled(BackendKind::Firebase));
        }
        if let Some(cfg) = &config.neon {
            let adapter = neon::NeonBackend::new(cfg)?;
            registry.register(Arc::new(adapter), config.is_sync_enabled(BackendKind::Neon));
        }
        info!(
            configured = ?registry.configured_remotes(),
            "Backend registry built"
        );
        Ok(registry)
    }

    /// Register (or replace) an adapter. Sync is never enabled for `local`.
    pub fn register(&mut self, adapter: Arc<dyn BackendAdapter>, sync_enabled: bool) {
        let kind = adapter.kind();
        if sync_enabled && kind.is_remote() {
            self.sync_enabled.insert(kind);
        } else {
            self.sync_enabled.remove(&kind);
        }
        self.adapters.insert(kind, adapter);
    }

    pub fn get(&self, kind: BackendKind) -> Option<Arc<dyn BackendAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    pub fn is_configured(&self, kind: BackendKind) -> bool {
        self.adapters.contains_key(&kind)
    }

    pub fn is_sync_enabled(&self, kind: BackendKind) -> bool {
        self.sync_enabled.contains(&kind)
    }

    pub fn configured_remotes(&self) -> Vec<BackendKind> {
        BackendKind::DEFAULT_PRIORITY
            .into_iter()
            .filter(|k| k.is_remote() && self.adapters.contains_key(k))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::fake::FakeBackend;
    use crate::db;

    fn local() -> Arc<LocalStore> {
        Arc::new(LocalStore::new(Arc::new(db::open_in_memory().unwrap())))
    }

    #[test]
    fn test_registry_always_has_local_and_never_syncs_it() {
        let mut registry = BackendRegistry::new(local());
        assert!(registry.is_configured(BackendKind::Local));
        assert!(registry.configured_remotes().is_empty());

        registry.register(local(), true);
        assert!(!registry.is_sync_enabled(BackendKind::Local));
    }

    #[test]
    fn test_register_tracks_sync_flag_per_backend() {
        let mut registry = BackendRegistry::new(local());
        registry.register(Arc::new(FakeBackend::new(BackendKind::Firebase)), true);
        registry.register(Arc::new(FakeBackend::new(BackendKind::Neon)), false);

        assert!(registry.is_sync_enabled(BackendKind::Firebase));
        assert!(!registry.is_sync_enabled(BackendKind::Neon));
        assert_eq!(
            registry.configured_remotes(),
            vec![BackendKind::Firebase, BackendKind::Neon]
        );
    }

    #[test]
    fn test_from_config_skips_unconfigured_backends() {
        let mut config = AppConfig::default();
        config.neon = Some(crate::config::NeonConfig {
            api_url: "http://127.0.0.1:9".into(),
            api_key: None,
        });
        let registry = BackendRegistry::from_config(&config, local()).unwrap();
        assert_eq!(registry.configured_remotes(), vec![BackendKind::Neon]);
        assert!(registry.is_sync_enabled(BackendKind::Neon));
    }
}
