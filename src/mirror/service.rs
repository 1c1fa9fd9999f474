//! Service Tag Mirror
//!
//! Caller-facing operations. The target cloud is always an explicit
//! argument; there is no per-request state.

use std::sync::Arc;
use tracing::{debug, info};

use super::artifacts::{self, Artifact};
use super::cloud::CloudRegistry;
use super::query::parse_address;
use super::store::DatasetStore;
use super::synchronizer::DatasetSynchronizer;
use super::types::{Dataset, MirrorError, ServiceEntry, SyncReport};
use crate::config::MirrorConfig;

pub struct ServiceTagMirror {
    registry: CloudRegistry,
    store: DatasetStore,
}

impl ServiceTagMirror {
    /// Mirror of the Azure environments under `config.data_dir`
    pub fn new(config: &MirrorConfig) -> Result<Self, MirrorError> {
        Self::with_registry(config, CloudRegistry::azure())
    }

    pub fn with_registry(config: &MirrorConfig, registry: CloudRegistry) -> Result<Self, MirrorError> {
        let synchronizer = DatasetSynchronizer::new(config)?;
        Ok(Self::from_parts(registry, DatasetStore::new(synchronizer)))
    }

    pub fn from_parts(registry: CloudRegistry, store: DatasetStore) -> Self {
        info!(
            clouds = ?registry.names(),
            data_dir = %store.synchronizer().data_dir().display(),
            "Service tag mirror initialized"
        );
        Self { registry, store }
    }

    pub fn registry(&self) -> &CloudRegistry {
        &self.registry
    }

    /// Full dataset for a cloud
    pub async fn list_services(&self, cloud: &str) -> Result<Arc<Dataset>, MirrorError> {
        let env = self.registry.resolve(cloud);
        self.store.get_dataset(env).await
    }

    /// Entries of a cloud matching a substring term
    pub async fn search_services(&self, cloud: &str, term: &str) -> Result<Vec<ServiceEntry>, MirrorError> {
        let env = self.registry.resolve(cloud);
        let index = self.store.get_index(env).await?;
        Ok(index.search(term).into_iter().cloned().collect())
    }

    /// Services whose prefixes contain `address`
    ///
    /// Clouds are loaded and scanned in registry order; scanning stops at the
    /// first cloud with a match, so later clouds are not fetched.
    pub async fn search_address(&self, address: &str) -> Result<Vec<(String, ServiceEntry)>, MirrorError> {
        let addr = parse_address(address)?;

        for env in self.registry.environments() {
            let index = self.store.get_index(env).await?;
            let matches = index.containing(addr);
            if !matches.is_empty() {
                debug!(address = %addr, cloud = %env.name, matches = matches.len(), "Address found");
                return Ok(matches
                    .into_iter()
                    .map(|entry| (env.name.clone(), entry.clone()))
                    .collect());
            }
        }

        debug!(address = %addr, "Address not found in any cloud");
        Ok(Vec::new())
    }

    /// Refresh one cloud (`Some(name)`) or every registered cloud (`None`)
    pub async fn update(&self, cloud: Option<&str>) -> Vec<SyncReport> {
        match cloud {
            Some(name) => {
                let env = self.registry.resolve(name);
                self.store.update_all(std::slice::from_ref(env)).await
            }
            None => self.store.update_all(self.registry.environments()).await,
        }
    }

    /// Address prefix export for the requested ids
    pub async fn export_prefixes<S: AsRef<str>>(&self, cloud: &str, ids: &[S]) -> Result<Artifact, MirrorError> {
        let env = self.registry.resolve(cloud);
        let index = self.store.get_index(env).await?;
        artifacts::prefix_export(&env.name, &index.find_by_id(ids))
    }

    /// Route table deployment template for the requested ids
    pub async fn export_route_template<S: AsRef<str>>(
        &self,
        cloud: &str,
        ids: &[S],
    ) -> Result<Artifact, MirrorError> {
        let env = self.registry.resolve(cloud);
        let index = self.store.get_index(env).await?;
        artifacts::route_template(&env.name, &index.find_by_id(ids))
    }

    /// Allowlist text for the requested ids
    ///
    /// `request_url` is echoed into the header to record where the list came from.
    pub async fn export_allowlist<S: AsRef<str>>(
        &self,
        cloud: &str,
        ids: &[S],
        request_url: &str,
    ) -> Result<Artifact, MirrorError> {
        let env = self.registry.resolve(cloud);
        let index = self.store.get_index(env).await?;
        Ok(artifacts::allowlist(
            &env.name,
            index.change_number(),
            request_url,
            &index.find_by_id(ids),
        ))
    }
}
