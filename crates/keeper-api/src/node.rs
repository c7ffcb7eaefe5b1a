//! Node identity and state.
//!
//! A node is one long-running client process subscribed to configuration.
//! The server-side object owns a bounded event mailbox which is the only
//! channel for server-originated notifications to that node's stream.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};

use keeper_common::error::{KeeperError, Result};

use crate::conf::StructData;
use crate::event::SyncEvent;

const MAILBOX_CAPACITY: usize = 10;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NodeStatus {
    Stopped,
    #[default]
    Running,
}

impl Serialize for NodeStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_i32(match self {
            NodeStatus::Stopped => 0,
            NodeStatus::Running => 1,
        })
    }
}

impl<'de> Deserialize<'de> for NodeStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match i32::deserialize(deserializer)? {
            0 => Ok(NodeStatus::Stopped),
            _ => Ok(NodeStatus::Running),
        }
    }
}

/// Identity and liveness state of a node.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeInfo {
    pub id: String,
    pub keeper_addr: String,
    pub domain: String,
    pub component: String,
    pub hostname: String,
    pub start_time: i64,
    pub update_time: i64,
    pub raw_subscription: Vec<String>,
    pub status: NodeStatus,
    pub version: i64,
    pub component_tags: BTreeMap<String, String>,
}

impl NodeInfo {
    pub fn new(
        id: &str,
        hostname: &str,
        keeper_addr: &str,
        domain: &str,
        component: &str,
        raw_subscription: Vec<String>,
        component_tags: BTreeMap<String, String>,
    ) -> NodeInfo {
        NodeInfo {
            id: id.to_string(),
            keeper_addr: keeper_addr.to_string(),
            domain: domain.to_string(),
            component: component.to_string(),
            hostname: hostname.to_string(),
            start_time: chrono::Utc::now().timestamp(),
            status: NodeStatus::Running,
            raw_subscription,
            component_tags,
            ..Default::default()
        }
    }
}

/// Process stats reported by the client; stored and returned opaquely.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcInfo {
    pub pid: String,
    pub ppid: String,
    pub command: String,
    pub state: String,
    pub start_time: String,
    pub cpu_usage: String,
    pub vm_size: i64,
    pub vm_rss: i64,
}

/// Serializable view of a node: identity plus resolved subscription and the
/// current projection. This is what `node/info` and the keeper-to-keeper
/// `GetNode` query return.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeSnapshot {
    #[serde(flatten)]
    pub info: NodeInfo,
    #[serde(default)]
    pub subscription: Vec<String>,
    #[serde(default)]
    pub struct_datas: Vec<StructData>,
    #[serde(default)]
    pub proc: Option<ProcInfo>,
}

struct NodeState {
    info: NodeInfo,
    subscription: Vec<String>,
    struct_datas: Vec<StructData>,
    proc: Option<ProcInfo>,
}

/// A registered node. Exclusively owned by the domain book entry for its
/// domain; handed out as `Arc<Node>`.
pub struct Node {
    state: RwLock<NodeState>,
    mailbox_tx: mpsc::Sender<SyncEvent>,
    mailbox_rx: Mutex<mpsc::Receiver<SyncEvent>>,
}

impl Node {
    pub fn new(info: NodeInfo) -> Arc<Node> {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        Arc::new(Node {
            state: RwLock::new(NodeState {
                info,
                subscription: Vec::new(),
                struct_datas: Vec::new(),
                proc: None,
            }),
            mailbox_tx: tx,
            mailbox_rx: Mutex::new(rx),
        })
    }

    pub fn id(&self) -> String {
        self.state.read().info.id.clone()
    }

    pub fn domain(&self) -> String {
        self.state.read().info.domain.clone()
    }

    pub fn component(&self) -> String {
        self.state.read().info.component.clone()
    }

    pub fn info(&self) -> NodeInfo {
        self.state.read().info.clone()
    }

    pub fn status(&self) -> NodeStatus {
        self.state.read().info.status
    }

    pub fn version(&self) -> i64 {
        self.state.read().info.version
    }

    pub fn update_time(&self) -> i64 {
        self.state.read().info.update_time
    }

    pub fn subscription(&self) -> Vec<String> {
        self.state.read().subscription.clone()
    }

    pub fn struct_datas(&self) -> Vec<StructData> {
        self.state.read().struct_datas.clone()
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let state = self.state.read();
        NodeSnapshot {
            info: state.info.clone(),
            subscription: state.subscription.clone(),
            struct_datas: state.struct_datas.clone(),
            proc: state.proc.clone(),
        }
    }

    pub fn set_status(&self, status: NodeStatus) {
        self.state.write().info.status = status;
    }

    pub fn set_version(&self, version: i64) {
        self.state.write().info.version = version;
    }

    pub fn set_update_time(&self, ts: i64) {
        self.state.write().info.update_time = ts;
    }

    pub fn touch(&self) {
        let mut state = self.state.write();
        state.info.update_time = chrono::Utc::now().timestamp();
        state.info.status = NodeStatus::Running;
    }

    pub fn set_subscription(&self, subscription: Vec<String>) {
        self.state.write().subscription = subscription;
    }

    /// Swap the projection, stamping every struct with the domain version.
    pub fn set_struct_datas(&self, mut struct_datas: Vec<StructData>, version: i64) {
        for sd in &mut struct_datas {
            sd.version = version;
        }
        self.state.write().struct_datas = struct_datas;
    }

    pub fn set_proc(&self, proc: Option<ProcInfo>) {
        self.state.write().proc = proc;
    }

    /// Non-blocking enqueue onto the mailbox. A full mailbox is an error;
    /// existing events are never evicted, preserving delivery order.
    pub fn add_event(&self, event: SyncEvent) -> Result<()> {
        {
            let state = self.state.read();
            if state.info.status == NodeStatus::Stopped {
                return Err(KeeperError::NodeStopped);
            }
        }
        self.mailbox_tx
            .try_send(event)
            .map_err(|_| KeeperError::MailboxFull(self.id()))
    }

    /// Wait for the next mailbox event, up to `timeout`. `None` on timeout.
    pub async fn wait_event(&self, timeout: Duration) -> Option<SyncEvent> {
        let mut rx = self.mailbox_rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Stop the node and drain its mailbox. Idempotent. A heartbeat still
    /// parked on the mailbox keeps its receiver slot; it will time out on
    /// its own and the stopped status blocks any further enqueue.
    pub fn exit(&self) {
        self.state.write().info.status = NodeStatus::Stopped;
        if let Ok(mut rx) = self.mailbox_rx.try_lock() {
            while rx.try_recv().is_ok() {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> Arc<Node> {
        Node::new(NodeInfo::new(
            "10.0.0.2:8080",
            "host-2",
            "10.0.0.1:7000",
            "live",
            "session",
            vec!["/session.conf".to_string()],
            BTreeMap::new(),
        ))
    }

    #[test]
    fn test_mailbox_full_error_preserves_order() {
        let n = node();
        for _ in 0..10 {
            n.add_event(SyncEvent::Register(None)).unwrap();
        }
        let err = n.add_event(SyncEvent::Register(None)).unwrap_err();
        assert!(matches!(err, KeeperError::MailboxFull(_)));
    }

    #[test]
    fn test_exit_is_idempotent_and_blocks_enqueue() {
        let n = node();
        n.add_event(SyncEvent::Register(None)).unwrap();
        n.exit();
        n.exit();
        assert_eq!(n.status(), NodeStatus::Stopped);
        assert!(matches!(
            n.add_event(SyncEvent::Register(None)),
            Err(KeeperError::NodeStopped)
        ));
    }

    #[tokio::test]
    async fn test_wait_event_dequeues_fifo() {
        let n = node();
        n.add_event(SyncEvent::Register(None)).unwrap();
        n.add_event(SyncEvent::ConfChanged(vec![])).unwrap();
        let first = n.wait_event(Duration::from_millis(100)).await.unwrap();
        assert!(matches!(first, SyncEvent::Register(None)));
        let second = n.wait_event(Duration::from_millis(100)).await.unwrap();
        assert!(matches!(second, SyncEvent::ConfChanged(_)));
    }

    #[tokio::test]
    async fn test_wait_event_times_out_empty() {
        let n = node();
        assert!(n.wait_event(Duration::from_millis(20)).await.is_none());
    }

    #[test]
    fn test_node_status_serde_as_int() {
        let info = NodeInfo::new("a", "h", "k", "d", "c", vec![], BTreeMap::new());
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["status"], 1);
        let back: NodeInfo = serde_json::from_value(json).unwrap();
        assert_eq!(back.status, NodeStatus::Running);
    }
}
