//! The engine ties the books, the store and the session surfaces together:
//! the sync event proxy, the storage watch consumer, admin operate
//! application and the liveness monitor.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use keeper_api::conf::raw_key;
use keeper_api::grpc::NodeQuery;
use keeper_api::grpc::sync_client::SyncClient;
use keeper_api::{ConfData, Node, NodeInfo, NodeSnapshot, Opcode, Operate, SyncEvent};
use keeper_common::error::{KeeperError, Result};
use keeper_common::utils::{agent_node_id, decode_keeper_addr, encode_keeper_addr};
use keeper_config::ConfManager;
use keeper_storage::{KeeperStore, StorageEvent, StorageEventKind};

use crate::domain_book::DomainBook;
use crate::domain_conf::DomainConfBook;
use crate::metrics::NodeMetrics;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Engine {
    pub store: Arc<KeeperStore>,
    pub domains: Arc<DomainBook>,
    pub confs: Arc<DomainConfBook>,
    pub metrics: Arc<dyn NodeMetrics>,
    /// This keeper's advertised sync address (node port).
    pub keeper_rpc_addr: String,
    /// This keeper's advertised admin address.
    pub keeper_admin_addr: String,
    /// Heartbeat park time; node expiry is twice this.
    pub event_interval: Duration,
}

impl Engine {
    pub fn new(
        store: Arc<KeeperStore>,
        metrics: Arc<dyn NodeMetrics>,
        keeper_rpc_addr: String,
        keeper_admin_addr: String,
        event_interval: Duration,
    ) -> Arc<Engine> {
        Arc::new(Engine {
            store,
            domains: DomainBook::new(),
            confs: DomainConfBook::new(),
            metrics,
            keeper_rpc_addr,
            keeper_admin_addr,
            event_interval,
        })
    }

    /// The address pair stored under `/keeper/addr/<domain>/<node>`.
    pub fn encoded_keeper_addr(&self) -> String {
        encode_keeper_addr(&self.keeper_admin_addr, &self.keeper_rpc_addr)
    }

    /// Load every domain's configuration and seed the domain book.
    pub async fn load_domains(&self) -> Result<Vec<String>> {
        let names = self.confs.init(&self.store).await?;
        for name in &names {
            self.domains.add_domain(name);
            if let Ok(version) = self.store.get_current_version(name, false).await {
                if let Ok(domain) = self.domains.get_domain(name) {
                    domain.set_version(version);
                }
            }
        }
        Ok(names)
    }

    // ------------------------------------------------------------------
    // sync event proxy
    // ------------------------------------------------------------------

    /// Dispatch one inbound sync event. Returns the reply event (if any)
    /// and the node it concerned, for metrics.
    pub async fn event_proxy(
        &self,
        event: SyncEvent,
    ) -> Result<(Option<SyncEvent>, Option<Arc<Node>>)> {
        match event {
            SyncEvent::Register(Some(info)) => self.on_register(info).await,
            SyncEvent::Proc(Some(snapshot)) => self.on_proc(*snapshot),
            SyncEvent::Heartbeat(Some(info)) => self.on_heartbeat(info).await,
            SyncEvent::Register(None) | SyncEvent::Proc(None) | SyncEvent::Heartbeat(None) => {
                Err(KeeperError::InvalidArgument("event data invalid".to_string()))
            }
            other => Err(KeeperError::EventUnsupported(other.tag())),
        }
    }

    async fn on_register(
        &self,
        info: NodeInfo,
    ) -> Result<(Option<SyncEvent>, Option<Arc<Node>>)> {
        let domain = self.domains.get_domain(&info.domain)?;
        if let Ok(stale) = domain.get_node(&info.id) {
            stale.exit();
        }

        let conf = self.confs.get(&info.domain)?;
        let node = Node::new(NodeInfo::new(
            &info.id,
            &info.hostname,
            &self.keeper_rpc_addr,
            &info.domain,
            &info.component,
            info.raw_subscription.clone(),
            info.component_tags.clone(),
        ));
        let subscription = conf.parse_subscribe(&info.raw_subscription);
        let struct_datas = conf.subscribe(&subscription);

        node.set_subscription(subscription);
        node.set_struct_datas(struct_datas, domain.version());
        node.touch();
        node.set_version(info.version);
        domain.register(Arc::clone(&node));
        self.store
            .set_keeper_addr(&info.domain, &info.id, &self.encoded_keeper_addr())
            .await?;

        info!("node {} registered in domain {}", info.id, info.domain);
        Ok((
            Some(SyncEvent::ConfChanged(node.struct_datas())),
            Some(node),
        ))
    }

    fn on_proc(
        &self,
        snapshot: NodeSnapshot,
    ) -> Result<(Option<SyncEvent>, Option<Arc<Node>>)> {
        let domain = self.domains.get_domain(&snapshot.info.domain)?;
        let Ok(node) = domain.get_node(&snapshot.info.id) else {
            return Ok((Some(SyncEvent::Register(None)), None));
        };
        node.touch();
        node.set_proc(snapshot.proc);
        Ok((None, Some(node)))
    }

    async fn on_heartbeat(
        &self,
        info: NodeInfo,
    ) -> Result<(Option<SyncEvent>, Option<Arc<Node>>)> {
        let domain = self.domains.get_domain(&info.domain)?;

        // where did this node register?
        let raw_addr = match self
            .store
            .get_keeper_addr(&info.domain, &info.id, false)
            .await
        {
            Ok(addr) => addr,
            Err(KeeperError::KeyNotExist) => {
                return Ok((Some(SyncEvent::Register(None)), None));
            }
            Err(e) => {
                warn!("heartbeat of {}: get keeper addr: {}", info.id, e);
                return Err(e);
            }
        };
        let (_, rpc_addr) = decode_keeper_addr(&raw_addr);
        if rpc_addr.is_empty() {
            warn!("heartbeat of {}: registered keeper addr is empty", info.id);
            return Ok((Some(SyncEvent::Register(None)), None));
        }

        // homed on another keeper: answer from there, or ask the client to
        // re-register when that keeper cannot be reached
        if rpc_addr != self.keeper_rpc_addr {
            return match self.remote_get_node(&rpc_addr, &info).await {
                Ok(snapshot) => Ok((Some(SyncEvent::RemoteNode(Box::new(snapshot))), None)),
                Err(e) => {
                    warn!("heartbeat of {}: remote get node {}: {}", info.id, rpc_addr, e);
                    Ok((Some(SyncEvent::Register(None)), None))
                }
            };
        }

        let Ok(node) = domain.get_node(&info.id) else {
            return Ok((Some(SyncEvent::Register(None)), None));
        };
        node.touch();

        if domain.version() != info.version && !node.struct_datas().is_empty() {
            return Ok((
                Some(SyncEvent::ConfChanged(node.struct_datas())),
                Some(node),
            ));
        }

        // park on the mailbox; an empty reply means nothing happened
        let event = node.wait_event(self.event_interval).await;
        Ok((event, Some(node)))
    }

    async fn remote_get_node(&self, rpc_addr: &str, info: &NodeInfo) -> Result<NodeSnapshot> {
        let endpoint = tonic::transport::Endpoint::from_shared(format!("http://{rpc_addr}"))
            .map_err(|e| KeeperError::Backend(e.to_string()))?
            .connect_timeout(DIAL_TIMEOUT)
            .timeout(DIAL_TIMEOUT);
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| KeeperError::Backend(e.to_string()))?;
        let mut client = SyncClient::new(channel);
        let resp = client
            .get_node(NodeQuery {
                domain: info.domain.clone(),
                node_id: info.id.clone(),
            })
            .await
            .map_err(|e| KeeperError::Backend(e.to_string()))?;
        Ok(serde_json::from_str(&resp.into_inner().data)?)
    }

    // ------------------------------------------------------------------
    // admin operates
    // ------------------------------------------------------------------

    pub async fn apply_operate_event(&self, event: SyncEvent) -> Result<()> {
        match event {
            SyncEvent::Operate(op) => self.update(vec![op]).await,
            SyncEvent::OperateBatch(ops) if !ops.is_empty() => self.update(ops).await,
            SyncEvent::OperateRollback(op) => {
                self.store.rollback(&op.domain, op.version, &op.note).await
            }
            other => Err(KeeperError::EventUnsupported(other.tag())),
        }
    }

    /// Validate all operates (typed parse, type conflict against the stored
    /// blob), then apply each. Later operates still run when an earlier one
    /// fails; the first failure is reported.
    async fn update(&self, mut operates: Vec<Operate>) -> Result<()> {
        let mut blobs: Vec<Option<String>> = Vec::with_capacity(operates.len());
        for op in &mut operates {
            op.format();
            if op.opcode == Opcode::Delete {
                blobs.push(None);
                continue;
            }
            if !matches!(op.opcode, Opcode::Add | Opcode::Update) {
                return Err(KeeperError::InvalidArgument(format!(
                    "operate invalid: {:?}",
                    op.opcode
                )));
            }
            let data = ConfData::new(&raw_key(&op.key, &op.type_name), &op.value)?;
            if let Ok(stored) = self
                .store
                .get_key(&op.domain, &op.file, &op.section, &data.key, true)
                .await
                && let Ok(existing) = ConfData::decode(&stored)
                && existing.type_name != data.type_name
            {
                return Err(KeeperError::TypeConflict {
                    key: data.key,
                    left: existing.type_name,
                    right: data.type_name,
                });
            }
            blobs.push(Some(data.encode()?));
        }

        let mut first_error = None;
        for (op, blob) in operates.iter().zip(blobs) {
            let result = match (op.opcode, blob) {
                (Opcode::Delete, _) => {
                    self.store
                        .del_key(&op.domain, &op.file, &op.section, &op.key, &op.note)
                        .await
                }
                (_, Some(blob)) => {
                    let key = ConfData::decode(&blob)
                        .map(|d| d.key)
                        .unwrap_or_else(|_| op.key.clone());
                    self.store
                        .set_key(&op.domain, &op.file, &op.section, &key, &blob, &op.note)
                        .await
                }
                (_, None) => Err(KeeperError::InvalidArgument("operate invalid".to_string())),
            };
            if let Err(e) = result {
                error!("apply operate on {}/{}: {}", op.domain, op.file, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Deliver a process command through the host agent's mailbox.
    pub fn command_node(
        &self,
        domain_name: &str,
        operate: &str,
        node_id: &str,
        component: &str,
    ) -> Result<()> {
        let domain = self.domains.get_domain(domain_name)?;
        let agent = domain.get_node(agent_node_id(node_id))?;
        let info = NodeInfo::new(
            node_id,
            "",
            &agent.info().keeper_addr,
            domain_name,
            component,
            Vec::new(),
            Default::default(),
        );
        let event = match operate {
            "start" => SyncEvent::CmdStart(info),
            "stop" => SyncEvent::CmdStop(info),
            "restart" => SyncEvent::CmdRestart(info),
            other => {
                return Err(KeeperError::InvalidArgument(format!(
                    "operate invalid: {other}"
                )));
            }
        };
        agent.add_event(event)
    }

    // ------------------------------------------------------------------
    // storage watch consumer
    // ------------------------------------------------------------------

    /// Drain storage events forever, patching the in-memory configuration
    /// and pushing the resulting projections to every affected node.
    pub async fn run_watch(&self, mut events: mpsc::Receiver<StorageEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.apply_storage_event(event).await {
                error!("apply storage event: {}", e);
            }
        }
    }

    async fn apply_storage_event(&self, event: StorageEvent) -> Result<()> {
        let domain = event.domain;
        let version = match event.kind {
            StorageEventKind::UpdateKey {
                file,
                section,
                value,
                ..
            } => {
                self.apply_update_key(&domain, &file, &section, &value)?;
                self.stamp_version(&domain).await
            }
            StorageEventKind::DeleteKey { file, section, key } => {
                self.confs.get(&domain)?.delete(&file, &section, &key)?;
                self.stamp_version(&domain).await
            }
            StorageEventKind::UpdateDomain { version } => {
                if let Ok(existing) = self.domains.get_domain(&domain)
                    && existing.version() == version
                {
                    return Ok(());
                }
                self.confs.reload(&self.store, &domain).await?;
                self.domains.add_domain(&domain);
                version
            }
        };

        let conf = self.confs.get(&domain)?;
        self.domains.reload(&domain, version, &conf)
    }

    /// The domain version to stamp on projections after a per-key event.
    /// The key write lands before its version record, so a fresh domain may
    /// not have one yet; the book's current version is the fallback.
    async fn stamp_version(&self, domain: &str) -> i64 {
        match self.store.get_current_version(domain, false).await {
            Ok(version) => version,
            Err(_) => self
                .domains
                .get_domain(domain)
                .map(|d| d.version())
                .unwrap_or(0),
        }
    }

    fn apply_update_key(
        &self,
        domain: &str,
        file: &str,
        section: &str,
        value: &str,
    ) -> Result<()> {
        match self.confs.get(domain) {
            Ok(conf) => {
                if conf.has_file(file) {
                    conf.update(file, section, value)
                } else {
                    conf.new_file(file, section, value)
                }
            }
            Err(_) => {
                // first key of a brand-new domain
                let conf = ConfManager::from_event(file, section, value)?;
                self.confs.insert(domain, conf);
                self.domains.add_domain(domain);
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // liveness monitor
    // ------------------------------------------------------------------

    /// Expire nodes whose heartbeats stopped and publish alive gauges for
    /// the rest. Runs forever.
    pub async fn run_monitor(&self) {
        let expire = 2 * self.event_interval.as_secs() as i64;
        loop {
            tokio::time::sleep(self.event_interval).await;
            let now = chrono::Utc::now().timestamp();
            for domain in self.domains.domains() {
                for node in domain.nodes() {
                    if node.update_time() + expire < now {
                        info!("node {} of {} expired", node.id(), domain.name);
                        node.exit();
                        if domain.del_node(&node.id()).is_some()
                            && let Err(e) = self
                                .store
                                .del_keeper_addr(
                                    &domain.name,
                                    &node.id(),
                                    &self.encoded_keeper_addr(),
                                )
                                .await
                        {
                            warn!("drop keeper addr of {}: {}", node.id(), e);
                        }
                    } else {
                        self.metrics
                            .node_alive(&node.id(), &domain.name, &node.info().hostname);
                    }
                }
            }
        }
    }
}
