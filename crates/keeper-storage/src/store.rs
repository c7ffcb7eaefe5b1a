//! The versioned per-domain configuration store.
//!
//! Every mutation runs under the domain's distributed mutex: apply the KV
//! change, observe the resulting revision R, then bump the logical version
//! record to `{version+1, package_version: R}` and append a history entry.
//! Reads resolve the current version first and read the domain at its
//! `package_version` snapshot, so readers never observe torn state. A
//! failure between the mutation and the version write is repaired by
//! [`KeeperStore::recover_domain`] immediately and by the periodic
//! reconciliation pass as a backstop.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use keeper_common::error::{KeeperError, Result};

use crate::etcd::client::{Compare, EtcdClient, RangeResponse, RequestOp};
use crate::etcd::lock::{self, LockGuard};
use crate::etcd::model::{DomainVersion, Recode, map_diff};
use crate::etcd::session::EtcdSession;
use crate::etcd::{CRON_LEASE_TTL, KEEPER_ADDR_LEASE_TTL, paths};
use crate::event::{EventMode, StorageEvent, StorageEventKind};

pub use crate::etcd::model::DomainData;

/// Capacity of the storage event channel.
pub const EVENT_CHAN_SIZE: usize = 10000;

pub struct KeeperStore {
    client: EtcdClient,
    session: Arc<EtcdSession>,
}

impl KeeperStore {
    pub async fn new(endpoints: &[String], username: &str, password: &str) -> Result<Arc<Self>> {
        let client = EtcdClient::connect(endpoints, username, password).await?;
        let session = EtcdSession::new(client.clone()).await?;
        Ok(Arc::new(KeeperStore { client, session }))
    }

    pub fn client(&self) -> &EtcdClient {
        &self.client
    }

    async fn lock(&self, path: &str) -> Result<LockGuard> {
        lock::acquire(&self.client, &self.session, path).await
    }

    // ------------------------------------------------------------------
    // version records
    // ------------------------------------------------------------------

    async fn current_version_aux(&self, domain: &str) -> Result<DomainVersion> {
        let resp = self
            .client
            .get(&paths::current_version_key_path(domain), None)
            .await?;
        match resp.kvs.first() {
            Some(kv) => DomainVersion::decode(&kv.value_str()?),
            None => Err(KeeperError::KeyNotExist),
        }
    }

    async fn domain_recode(&self, domain: &str, version: i64) -> Result<Recode> {
        let resp = self
            .client
            .get(&paths::version_key_path(domain, version), None)
            .await?;
        match resp.kvs.first() {
            Some(kv) => Recode::decode(&kv.value_str()?),
            None => Err(KeeperError::KeyNotExist),
        }
    }

    async fn incr_version(&self, domain: &str, etcd_version: i64, note: &str) -> Result<()> {
        let version = match self.current_version_aux(domain).await {
            Ok(dv) => dv.version,
            Err(KeeperError::KeyNotExist) => 0,
            Err(e) => return Err(e),
        } + 1;

        let dv = DomainVersion {
            version,
            package_version: etcd_version,
        };
        let recode = Recode {
            id: version,
            domain: domain.to_string(),
            version,
            package_version: etcd_version,
            note: note.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        };
        self.client
            .txn(vec![
                RequestOp::put(&paths::current_version_key_path(domain), &dv.encode()?),
                RequestOp::put(
                    &paths::version_key_path(domain, version),
                    &recode.encode()?,
                ),
            ])
            .await?;
        Ok(())
    }

    /// Re-point an existing version at a new package revision (janitor).
    async fn update_version(
        &self,
        domain: &str,
        version: i64,
        etcd_version: i64,
        mut recode: Recode,
    ) -> Result<()> {
        let dv = DomainVersion {
            version,
            package_version: etcd_version,
        };
        recode.package_version = etcd_version;
        self.client
            .txn(vec![
                RequestOp::put(&paths::current_version_key_path(domain), &dv.encode()?),
                RequestOp::put(
                    &paths::version_key_path(domain, version),
                    &recode.encode()?,
                ),
            ])
            .await?;
        Ok(())
    }

    pub async fn get_current_version(&self, domain: &str, with_lock: bool) -> Result<i64> {
        let guard = if with_lock {
            Some(self.lock(domain).await?)
        } else {
            None
        };
        let result = self.current_version_aux(domain).await;
        if let Some(guard) = guard {
            let _ = guard.unlock().await;
        }
        Ok(result?.version)
    }

    pub async fn get_history_versions(
        &self,
        domain: &str,
        num: i64,
        offset: i64,
        with_lock: bool,
    ) -> Result<Vec<Recode>> {
        let guard = if with_lock {
            Some(self.lock(domain).await?)
        } else {
            None
        };
        let result = self.history_versions_aux(domain, num, offset).await;
        if let Some(guard) = guard {
            let _ = guard.unlock().await;
        }
        result
    }

    async fn history_versions_aux(&self, domain: &str, num: i64, offset: i64) -> Result<Vec<Recode>> {
        let dv = self.current_version_aux(domain).await?;
        let end = dv.version - offset;
        if end < 0 {
            return Err(KeeperError::InvalidArgument(
                "have no more versions".to_string(),
            ));
        }
        let start = (end - num + 1).max(0);
        let ops = (start..=end)
            .rev()
            .map(|v| RequestOp::get(&paths::version_key_path(domain, v)))
            .collect();
        let resp = self.client.txn(ops).await?;
        let mut recodes = Vec::new();
        for op in resp.responses {
            if let Some(range) = op.response_range {
                for kv in range.kvs {
                    if let Ok(recode) = Recode::decode(&kv.value_str()?) {
                        recodes.push(recode);
                    }
                }
            }
        }
        Ok(recodes)
    }

    // ------------------------------------------------------------------
    // key / file / domain data
    // ------------------------------------------------------------------

    pub async fn set_key(
        &self,
        domain: &str,
        file: &str,
        section: &str,
        key: &str,
        value: &str,
        note: &str,
    ) -> Result<()> {
        let guard = self.lock(domain).await?;
        let result = async {
            let revision = self
                .client
                .put(&paths::conf_key_path(domain, file, section, key), value, None)
                .await?;
            self.incr_version(domain, revision, note).await
        }
        .await;
        let result = self.recover_on_error(domain, result).await;
        let _ = guard.unlock().await;
        result
    }

    pub async fn get_key(
        &self,
        domain: &str,
        file: &str,
        section: &str,
        key: &str,
        with_lock: bool,
    ) -> Result<String> {
        let guard = if with_lock {
            Some(self.lock(domain).await?)
        } else {
            None
        };
        let result = async {
            let dv = self.current_version_aux(domain).await?;
            let resp = self
                .client
                .get(
                    &paths::conf_key_path(domain, file, section, key),
                    Some(dv.package_version),
                )
                .await?;
            match resp.kvs.first() {
                Some(kv) => kv.value_str(),
                None => Err(KeeperError::KeyNotExist),
            }
        }
        .await;
        if let Some(guard) = guard {
            let _ = guard.unlock().await;
        }
        result
    }

    pub async fn del_key(
        &self,
        domain: &str,
        file: &str,
        section: &str,
        key: &str,
        note: &str,
    ) -> Result<()> {
        let guard = self.lock(domain).await?;
        let result = async {
            let (_, revision) = self
                .client
                .delete(&paths::conf_key_path(domain, file, section, key), false)
                .await?;
            self.incr_version(domain, revision, note).await
        }
        .await;
        let result = self.recover_on_error(domain, result).await;
        let _ = guard.unlock().await;
        result
    }

    /// Add a file, or revise it in place when it already exists. A no-op
    /// revision (identical content) does not bump the version.
    pub async fn add_file(
        &self,
        domain: &str,
        file: &str,
        data: BTreeMap<String, BTreeMap<String, String>>,
        note: &str,
    ) -> Result<()> {
        let guard = self.lock(domain).await?;
        let result = async {
            let origin = self.file_data_aux(domain, file, None).await?;
            let mut right = DomainData::new();
            right.insert(file.to_string(), data);
            let mut dirty = DomainData::new();
            dirty.insert(file.to_string(), origin);
            let revision = self.revise_data(domain, &right, &dirty).await?;
            if revision == 0 {
                return Ok(());
            }
            self.incr_version(domain, revision, note).await
        }
        .await;
        let result = self.recover_on_error(domain, result).await;
        let _ = guard.unlock().await;
        result
    }

    pub async fn del_file(&self, domain: &str, file: &str, note: &str) -> Result<()> {
        let guard = self.lock(domain).await?;
        let result = async {
            let (deleted, revision) = self
                .client
                .delete(&(paths::conf_file_path(domain, file) + "/"), true)
                .await?;
            if deleted == 0 {
                return Err(KeeperError::KeyNotExist);
            }
            self.incr_version(domain, revision, note).await
        }
        .await;
        let result = match result {
            Err(KeeperError::KeyNotExist) => Err(KeeperError::KeyNotExist),
            other => self.recover_on_error(domain, other).await,
        };
        let _ = guard.unlock().await;
        result
    }

    async fn file_data_aux(
        &self,
        domain: &str,
        file: &str,
        revision: Option<i64>,
    ) -> Result<BTreeMap<String, BTreeMap<String, String>>> {
        let resp = self
            .client
            .get_prefix(&(paths::conf_file_path(domain, file) + "/"), revision)
            .await?;
        let mut data: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for kv in collect_kvs(resp) {
            let path = kv.0;
            match paths::parse_conf_key_path(&path) {
                Ok((_, _, section, key)) => {
                    data.entry(section).or_default().insert(key, kv.1);
                }
                Err(e) => warn!("parse conf key path {}: {}", path, e),
            }
        }
        Ok(data)
    }

    pub async fn set_domain(&self, domain: &str, data: DomainData, note: &str) -> Result<()> {
        let guard = self.lock(domain).await?;
        let result = async {
            let mut ops = Vec::new();
            for (file, sections) in &data {
                for (section, keys) in sections {
                    for (key, value) in keys {
                        ops.push(RequestOp::put(
                            &paths::conf_key_path(domain, file, section, key),
                            value,
                        ));
                    }
                }
            }
            let resp = self.client.txn(ops).await?;
            self.incr_version(domain, resp.revision(), note).await
        }
        .await;
        let result = self.recover_on_error(domain, result).await;
        let _ = guard.unlock().await;
        result
    }

    pub async fn get_domain(&self, domain: &str, with_lock: bool) -> Result<DomainData> {
        let guard = if with_lock {
            Some(self.lock(domain).await?)
        } else {
            None
        };
        let result = async {
            let dv = self.current_version_aux(domain).await?;
            self.domain_data_aux(domain, Some(dv.package_version)).await
        }
        .await;
        if let Some(guard) = guard {
            let _ = guard.unlock().await;
        }
        result
    }

    async fn domain_data_aux(&self, domain: &str, revision: Option<i64>) -> Result<DomainData> {
        let resp = self
            .client
            .get_prefix(&paths::conf_domain_path(domain), revision)
            .await?;
        let mut data = DomainData::new();
        for (path, value) in collect_kvs(resp) {
            match paths::parse_conf_key_path(&path) {
                Ok((_, file, section, key)) => {
                    data.entry(file)
                        .or_default()
                        .entry(section)
                        .or_default()
                        .insert(key, value);
                }
                Err(e) => warn!("parse conf key path {}: {}", path, e),
            }
        }
        Ok(data)
    }

    pub async fn del_domain(&self, domain: &str, note: &str) -> Result<()> {
        let guard = self.lock(domain).await?;
        let result = async {
            let (deleted, revision) = self
                .client
                .delete(&paths::conf_domain_path(domain), true)
                .await?;
            if deleted == 0 {
                return Err(KeeperError::KeyNotExist);
            }
            self.incr_version(domain, revision, note).await
        }
        .await;
        let result = match result {
            Err(KeeperError::KeyNotExist) => Err(KeeperError::KeyNotExist),
            other => self.recover_on_error(domain, other).await,
        };
        let _ = guard.unlock().await;
        result
    }

    pub async fn get_domain_names(&self, with_lock: bool) -> Result<Vec<String>> {
        let guard = if with_lock {
            Some(self.lock(&paths::root_path()).await?)
        } else {
            None
        };
        let result = self.domain_names_aux().await;
        if let Some(guard) = guard {
            let _ = guard.unlock().await;
        }
        result
    }

    async fn domain_names_aux(&self) -> Result<Vec<String>> {
        let resp = self
            .client
            .get_prefix(&(paths::current_version_dir_path() + "/"), None)
            .await?;
        let mut names = Vec::new();
        for (path, _) in collect_kvs(resp) {
            if let Ok(name) = paths::parse_current_version_key_path(&path) {
                names.push(name);
            }
        }
        Ok(names)
    }

    // ------------------------------------------------------------------
    // rollback & reconciliation
    // ------------------------------------------------------------------

    pub async fn rollback(&self, domain: &str, version: i64, note: &str) -> Result<()> {
        let guard = self.lock(domain).await?;
        let result = async {
            let recode = self.domain_recode(domain, version).await?;
            let snapshot = self
                .domain_data_aux(domain, Some(recode.package_version))
                .await?;
            let latest = self.domain_data_aux(domain, None).await?;
            let mut revision = self.revise_data(domain, &snapshot, &latest).await?;
            if revision == 0 {
                revision = recode.package_version;
            }
            self.incr_version(domain, revision, note).await
        }
        .await;
        let result = self.recover_on_error(domain, result).await;
        let _ = guard.unlock().await;
        result
    }

    /// Apply the diff that turns `dirty` into `right` as one transaction.
    /// Returns the resulting revision, or 0 when there was nothing to do.
    async fn revise_data(
        &self,
        domain: &str,
        right: &DomainData,
        dirty: &DomainData,
    ) -> Result<i64> {
        let puts = map_diff(right, dirty, true);
        let deletes = map_diff(dirty, right, false);

        let mut ops = Vec::new();
        for (file, sections) in &puts {
            for (section, keys) in sections {
                for (key, value) in keys {
                    ops.push(RequestOp::put(
                        &paths::conf_key_path(domain, file, section, key),
                        value,
                    ));
                }
            }
        }
        for (file, sections) in &deletes {
            for (section, keys) in sections {
                for key in keys.keys() {
                    ops.push(RequestOp::delete(&paths::conf_key_path(
                        domain, file, section, key,
                    )));
                }
            }
        }
        if ops.is_empty() {
            return Ok(0);
        }
        let resp = self.client.txn(ops).await?;
        Ok(resp.revision())
    }

    async fn latest_revision(&self) -> Result<i64> {
        let resp = self.client.get(&paths::root_path(), None).await?;
        Ok(resp.header.and_then(|h| h.revision).unwrap_or(0))
    }

    /// Reconcile one domain: make the latest raw data equal the snapshot
    /// named by the current version, then advance `package_version`.
    async fn sync_domain(&self, domain: &str, latest_revision: i64) -> Result<()> {
        let dv = self.current_version_aux(domain).await?;
        let recode = self.domain_recode(domain, dv.version).await?;
        let current = self
            .domain_data_aux(domain, Some(dv.package_version))
            .await?;
        let latest = self.domain_data_aux(domain, None).await?;
        let mut revision = self.revise_data(domain, &current, &latest).await?;
        if revision == 0 {
            revision = latest_revision;
        }
        self.update_version(domain, dv.version, revision, recode)
            .await
    }

    /// Immediate repair after a failed write path: the KV mutation may have
    /// landed without its version record.
    pub async fn recover_domain(&self, domain: &str) -> Result<()> {
        let latest = self.latest_revision().await?;
        self.sync_domain(domain, latest).await
    }

    async fn recover_on_error(&self, domain: &str, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(re) = self.recover_domain(domain).await {
                    error!("recover domain {} failed: {}", domain, re);
                }
                Err(e)
            }
        }
    }

    /// One reconciliation pass across all domains. Exactly one keeper wins
    /// the `/keeper/cron` lease per cadence and runs the pass.
    pub async fn run_reconcile(&self) {
        let guard = match self.lock(&paths::root_path()).await {
            Ok(guard) => guard,
            Err(e) => {
                warn!("reconcile lock: {}", e);
                return;
            }
        };
        let run = async {
            // another keeper already won this round
            let resp = self.client.get(&paths::cron_path(), None).await?;
            if !resp.kvs.is_empty() {
                return Ok(());
            }
            let lease = self.client.lease_grant(CRON_LEASE_TTL).await?;
            self.client
                .put(&paths::cron_path(), "cron", Some(lease))
                .await?;

            let domains = self.domain_names_aux().await?;
            let latest = self.latest_revision().await?;
            for domain in domains {
                if let Err(e) = self.sync_domain(&domain, latest).await {
                    error!("reconcile domain {}: {}", domain, e);
                }
            }
            info!("reconcile pass finished");
            Ok::<(), KeeperError>(())
        }
        .await;
        if let Err(e) = run {
            error!("reconcile pass: {}", e);
        }
        let _ = guard.unlock().await;
    }

    // ------------------------------------------------------------------
    // keeper addressing & presence
    // ------------------------------------------------------------------

    pub async fn set_keeper_addr(&self, domain: &str, node_id: &str, addr: &str) -> Result<()> {
        let path = paths::addr_key_path(domain, node_id);
        let guard = self.lock(&path).await?;
        let result = self.client.put(&path, addr, None).await.map(|_| ());
        let _ = guard.unlock().await;
        result
    }

    pub async fn get_keeper_addr(
        &self,
        domain: &str,
        node_id: &str,
        with_lock: bool,
    ) -> Result<String> {
        let path = paths::addr_key_path(domain, node_id);
        let guard = if with_lock {
            Some(self.lock(&path).await?)
        } else {
            None
        };
        let result = async {
            let resp = self.client.get(&path, None).await?;
            match resp.kvs.first() {
                Some(kv) => kv.value_str(),
                None => Err(KeeperError::KeyNotExist),
            }
        }
        .await;
        if let Some(guard) = guard {
            let _ = guard.unlock().await;
        }
        result
    }

    /// Distinct keeper addresses serving a domain.
    pub async fn get_keeper_addrs(&self, domain: &str, with_lock: bool) -> Result<Vec<String>> {
        let path = paths::addr_dir_path(domain);
        let guard = if with_lock {
            Some(self.lock(&path).await?)
        } else {
            None
        };
        let result = async {
            let resp = self.client.get_prefix(&(path.clone() + "/"), None).await?;
            let mut addrs = Vec::new();
            for (_, addr) in collect_kvs(resp) {
                if !addrs.contains(&addr) {
                    addrs.push(addr);
                }
            }
            Ok(addrs)
        }
        .await;
        if let Some(guard) = guard {
            let _ = guard.unlock().await;
        }
        result
    }

    /// Delete a node's keeper address, guarded on the expected previous
    /// value so a keeper only removes its own registration.
    pub async fn del_keeper_addr(&self, domain: &str, node_id: &str, prev: &str) -> Result<()> {
        let guard = self.lock(domain).await?;
        let path = paths::addr_key_path(domain, node_id);
        let result = if prev.is_empty() {
            self.client.delete(&path, false).await.map(|_| ())
        } else {
            self.client
                .txn_compare(
                    vec![Compare::value_equals(&path, prev)],
                    vec![RequestOp::delete(&path)],
                )
                .await
                .map(|_| ())
        };
        let _ = guard.unlock().await;
        result
    }

    /// Hold this keeper's presence record under a lease, forever. Lost
    /// keepalives re-grant the lease and re-put the record.
    pub async fn keep_alive(&self, keeper_id: i64, addr: String) {
        let path = paths::node_lease_key_path(keeper_id);
        let ping = std::time::Duration::from_secs(KEEPER_ADDR_LEASE_TTL / 3);
        loop {
            let lease = match self.client.lease_grant(KEEPER_ADDR_LEASE_TTL).await {
                Ok(lease) => lease,
                Err(e) => {
                    error!("presence lease grant: {}", e);
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };
            if let Err(e) = self.client.put(&path, &addr, Some(lease)).await {
                error!("presence put: {}", e);
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            }
            loop {
                tokio::time::sleep(ping).await;
                if let Err(e) = self.client.lease_keepalive(lease).await {
                    error!("presence keepalive lost, re-granting: {}", e);
                    break;
                }
            }
        }
    }

    pub async fn get_alive_keeper_nodes(&self, with_lock: bool) -> Result<BTreeMap<i64, String>> {
        let path = paths::node_lease_dir_path();
        let guard = if with_lock {
            Some(self.lock(&path).await?)
        } else {
            None
        };
        let result = async {
            let resp = self.client.get_prefix(&(path.clone() + "/"), None).await?;
            let mut nodes = BTreeMap::new();
            for (key, addr) in collect_kvs(resp) {
                match paths::parse_node_lease_key_path(&key) {
                    Ok(id) => {
                        nodes.insert(id, addr);
                    }
                    Err(e) => warn!("parse node lease path {}: {}", key, e),
                }
            }
            Ok(nodes)
        }
        .await;
        if let Some(guard) = guard {
            let _ = guard.unlock().await;
        }
        result
    }

    // ------------------------------------------------------------------
    // watch
    // ------------------------------------------------------------------

    /// Follow the store forever, emitting events onto `tx`. On stream end
    /// or invalidation the watch restarts from latest; intermediate events
    /// may be lost but the next emitted state is current.
    pub async fn watch(&self, mode: EventMode, tx: mpsc::Sender<StorageEvent>) {
        let (prefix, is_conf) = match mode {
            EventMode::Conf => (paths::conf_dir_path() + "/", true),
            EventMode::Version => (paths::current_version_dir_path() + "/", false),
        };
        loop {
            let mut stream = match self.client.watch_stream(&prefix, true, None).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("storage watch open: {}", e);
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };
            while let Some(resp) = stream.next_response().await {
                let Some(result) = resp.result else { continue };
                for event in result.events {
                    let Some(storage_event) = parse_watch_event(is_conf, &event) else {
                        continue;
                    };
                    if tx.send(storage_event).await.is_err() {
                        return;
                    }
                }
            }
            warn!("storage watch stream ended, re-watching from latest");
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    }
}

fn parse_watch_event(
    is_conf: bool,
    event: &crate::etcd::client::WatchEvent,
) -> Option<StorageEvent> {
    let kv = event.kv.as_ref()?;
    let path = kv.key_str().ok()?;
    let event_type = event.event_type.as_deref().unwrap_or("PUT");

    if is_conf {
        let (domain, file, section, key) = match paths::parse_conf_key_path(&path) {
            Ok(parts) => parts,
            Err(e) => {
                warn!("watch conf path {}: {}", path, e);
                return None;
            }
        };
        let kind = match event_type {
            "PUT" => StorageEventKind::UpdateKey {
                file,
                section,
                key,
                value: kv.value_str().ok()?,
            },
            "DELETE" => StorageEventKind::DeleteKey { file, section, key },
            _ => return None,
        };
        Some(StorageEvent { domain, kind })
    } else {
        if event_type != "PUT" {
            return None;
        }
        let domain = match paths::parse_current_version_key_path(&path) {
            Ok(domain) => domain,
            Err(e) => {
                warn!("watch version path {}: {}", path, e);
                return None;
            }
        };
        let dv = DomainVersion::decode(&kv.value_str().ok()?).ok()?;
        Some(StorageEvent {
            domain,
            kind: StorageEventKind::UpdateDomain {
                version: dv.version,
            },
        })
    }
}

fn collect_kvs(resp: RangeResponse) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for kv in resp.kvs {
        match (kv.key_str(), kv.value_str()) {
            (Ok(key), Ok(value)) => out.push((key, value)),
            _ => warn!("undecodable kv in range response"),
        }
    }
    out
}
