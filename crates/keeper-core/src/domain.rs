//! One domain: its logical version and the nodes registered here.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use keeper_api::Node;
use keeper_common::error::{KeeperError, Result};

#[derive(Clone, Debug, Serialize)]
pub struct DomainInfo {
    pub name: String,
    pub version: i64,
}

pub struct Domain {
    pub name: String,
    version: RwLock<i64>,
    nodes: RwLock<HashMap<String, Arc<Node>>>,
}

impl Domain {
    pub fn new(name: &str) -> Arc<Domain> {
        Arc::new(Domain {
            name: name.to_string(),
            version: RwLock::new(0),
            nodes: RwLock::new(HashMap::new()),
        })
    }

    pub fn version(&self) -> i64 {
        *self.version.read()
    }

    pub fn set_version(&self, version: i64) {
        *self.version.write() = version;
    }

    pub fn info(&self) -> DomainInfo {
        DomainInfo {
            name: self.name.clone(),
            version: self.version(),
        }
    }

    pub fn register(&self, node: Arc<Node>) {
        self.nodes.write().insert(node.id(), node);
    }

    pub fn get_node(&self, id: &str) -> Result<Arc<Node>> {
        self.nodes
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| KeeperError::not_found("node", id))
    }

    pub fn del_node(&self, id: &str) -> Option<Arc<Node>> {
        self.nodes.write().remove(id)
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeper_api::NodeInfo;

    #[test]
    fn test_register_and_lookup() {
        let domain = Domain::new("live");
        let node = Node::new(NodeInfo::new(
            "10.0.0.2:80",
            "h",
            "k",
            "live",
            "session",
            vec![],
            Default::default(),
        ));
        domain.register(Arc::clone(&node));
        assert!(domain.get_node("10.0.0.2:80").is_ok());
        assert_eq!(domain.nodes().len(), 1);
        assert!(domain.del_node("10.0.0.2:80").is_some());
        assert!(domain.get_node("10.0.0.2:80").is_err());
    }

    #[test]
    fn test_version() {
        let domain = Domain::new("live");
        assert_eq!(domain.version(), 0);
        domain.set_version(4);
        assert_eq!(domain.info().version, 4);
    }
}
