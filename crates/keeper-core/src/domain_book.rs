//! The process-wide map of domains and their registered nodes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use keeper_api::SyncEvent;
use keeper_common::error::{KeeperError, Result};
use keeper_config::ConfManager;

use crate::domain::{Domain, DomainInfo};

#[derive(Default)]
pub struct DomainBook {
    domains: RwLock<HashMap<String, Arc<Domain>>>,
}

impl DomainBook {
    pub fn new() -> Arc<DomainBook> {
        Arc::new(DomainBook::default())
    }

    pub fn add_domain(&self, name: &str) {
        self.domains
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Domain::new(name));
    }

    pub fn get_domain(&self, name: &str) -> Result<Arc<Domain>> {
        self.domains
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| KeeperError::not_found("domain", name))
    }

    pub fn delete_domain(&self, name: &str) {
        self.domains.write().remove(name);
    }

    pub fn domains(&self) -> Vec<Arc<Domain>> {
        self.domains.read().values().cloned().collect()
    }

    pub fn domain_infos(&self) -> Vec<DomainInfo> {
        let mut infos: Vec<DomainInfo> =
            self.domains.read().values().map(|d| d.info()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Swap in a new configuration for a domain: stamp the version,
    /// recompute every node's projection and notify each node through its
    /// mailbox. Per-node mailbox overflow is reported, never fatal.
    pub fn reload(&self, name: &str, version: i64, conf: &ConfManager) -> Result<()> {
        let domain = self.get_domain(name)?;
        domain.set_version(version);
        for node in domain.nodes() {
            let struct_datas = conf.subscribe(&node.subscription());
            node.set_struct_datas(struct_datas, version);
            if let Err(e) = node.add_event(SyncEvent::ConfChanged(node.struct_datas())) {
                warn!("reload {}: notify node {}: {}", name, node.id(), e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeper_api::{ConfData, Node, NodeInfo};
    use keeper_storage::DomainData;
    use std::time::Duration;

    fn conf_manager(listen: &str) -> ConfManager {
        let mut data = DomainData::new();
        data.entry("/g.conf".to_string())
            .or_default()
            .entry("DEFAULT".to_string())
            .or_default()
            .insert(
                "listen".to_string(),
                ConfData::new("listen", listen).unwrap().encode().unwrap(),
            );
        ConfManager::from_domain_data(&data).unwrap()
    }

    fn register_node(book: &DomainBook, cm: &ConfManager) -> Arc<Node> {
        let node = Node::new(NodeInfo::new(
            "10.0.0.2:80",
            "h",
            "k",
            "live",
            "session",
            vec!["/g.conf".to_string()],
            Default::default(),
        ));
        node.set_subscription(cm.parse_subscribe(&["/g.conf".to_string()]));
        book.get_domain("live").unwrap().register(Arc::clone(&node));
        node
    }

    #[tokio::test]
    async fn test_reload_updates_projection_and_notifies() {
        let book = DomainBook::new();
        book.add_domain("live");
        let cm = conf_manager(":80");
        let node = register_node(&book, &cm);

        let cm2 = conf_manager(":81");
        book.reload("live", 2, &cm2).unwrap();

        assert_eq!(book.get_domain("live").unwrap().version(), 2);
        let datas = node.struct_datas();
        assert_eq!(datas[0].version, 2);
        assert_eq!(datas[0].data["listen"].raw_value, ":81");

        match node.wait_event(Duration::from_millis(50)).await {
            Some(SyncEvent::ConfChanged(datas)) => {
                assert_eq!(datas[0].data["listen"].raw_value, ":81")
            }
            other => panic!("expected conf changed, got {other:?}"),
        }
    }

    #[test]
    fn test_reload_unknown_domain() {
        let book = DomainBook::new();
        assert!(book.reload("ghost", 1, &conf_manager(":80")).is_err());
    }

    #[test]
    fn test_domain_infos_sorted() {
        let book = DomainBook::new();
        book.add_domain("zeta");
        book.add_domain("alpha");
        let names: Vec<String> = book.domain_infos().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);
    }
}
