//! The per-domain configuration managers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::error;

use keeper_common::error::{KeeperError, Result};
use keeper_config::ConfManager;
use keeper_storage::KeeperStore;

#[derive(Default)]
pub struct DomainConfBook {
    confs: RwLock<HashMap<String, Arc<ConfManager>>>,
}

impl DomainConfBook {
    pub fn new() -> Arc<DomainConfBook> {
        Arc::new(DomainConfBook::default())
    }

    /// Load every known domain from the store. A domain that fails to load
    /// (undecodable data, type conflict) is fatal; the remaining domains
    /// are still attempted so the log shows every broken one.
    pub async fn init(&self, store: &KeeperStore) -> Result<Vec<String>> {
        let names = store.get_domain_names(false).await?;
        let mut first_error = None;
        for name in &names {
            if let Err(e) = self.load(store, name, false).await {
                error!("load domain {}: {}", name, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => Ok(self.domain_names()),
            Some(e) => Err(e),
        }
    }

    async fn load(&self, store: &KeeperStore, domain: &str, with_lock: bool) -> Result<()> {
        let data = store.get_domain(domain, with_lock).await?;
        let conf = ConfManager::from_domain_data(&data)?;
        self.confs
            .write()
            .insert(domain.to_string(), Arc::new(conf));
        Ok(())
    }

    /// Reload one domain from its current snapshot, under the domain lock.
    pub async fn reload(&self, store: &KeeperStore, domain: &str) -> Result<()> {
        self.load(store, domain, true).await
    }

    pub fn get(&self, domain: &str) -> Result<Arc<ConfManager>> {
        self.confs
            .read()
            .get(domain)
            .cloned()
            .ok_or_else(|| KeeperError::not_found("domain", domain))
    }

    pub fn insert(&self, domain: &str, conf: ConfManager) {
        self.confs
            .write()
            .insert(domain.to_string(), Arc::new(conf));
    }

    pub fn remove(&self, domain: &str) {
        self.confs.write().remove(domain);
    }

    pub fn domain_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.confs.read().keys().cloned().collect();
        names.sort();
        names
    }
}
