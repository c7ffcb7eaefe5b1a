//! etcd-backed registry.
//!
//! Key layout: `/discovery/<service>/instance/<id>/` holds the instance
//! blob under its lease; `/discovery/<service>/property/backend/` holds the
//! administrative overlay. A service's version is the maximum ModRevision
//! across its keys.
//!
//! Lease ids ride inside the stored instance metadata so that any keeper
//! replica, including one that just restarted, can keep a foreign-granted
//! lease alive instead of re-granting on every keepalive.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{error, warn};

use keeper_common::error::{KeeperError, Result};
use keeper_storage::EtcdClient;

use crate::model::{Instance, Property, Service, encode_zone_weights, join_md};
use crate::model::{BACKEND_METADATA_ZONE_WEIGHT, MD};
use crate::registry::{Registry, RegistryWatchEvent, WatchData, WatchEventType};

const SERVICE_ROOT_PATH: &str = "/discovery";
const INFO_TYPE_INSTANCE: &str = "instance";
const INFO_TYPE_PROPERTY: &str = "property";

/// Lease id smuggled through instance metadata; stripped before instances
/// leave this module.
const ETCD_METADATA_LEASE_ID: &str = "etcd-metadata-lease_id";

const WATCH_CHAN_SIZE: usize = 10;

fn root_path() -> String {
    SERVICE_ROOT_PATH.to_string()
}

fn service_path(service: &str) -> String {
    format!("{SERVICE_ROOT_PATH}/{service}/")
}

fn instance_path(service: &str, id: &str) -> String {
    format!("{SERVICE_ROOT_PATH}/{service}/{INFO_TYPE_INSTANCE}/{id}/")
}

fn property_path(service: &str, kind: &str) -> String {
    format!("{SERVICE_ROOT_PATH}/{service}/{INFO_TYPE_PROPERTY}/{kind}/")
}

/// `(service, info_type, id)` of a registry key.
fn parse_raw_path(path: &str) -> Result<(String, String, String)> {
    let list: Vec<&str> = path.trim_matches('/').split('/').collect();
    if list.len() != 4 || list[0] != SERVICE_ROOT_PATH.trim_matches('/') {
        return Err(KeeperError::InvalidArgument(format!(
            "registry path is invalid: {path}"
        )));
    }
    Ok((
        list[1].to_string(),
        list[2].to_string(),
        list[3].to_string(),
    ))
}

pub struct EtcdRegistry {
    client: EtcdClient,
    /// serviceName -> administrative overlay, kept hot for watch events.
    /// Shared with the watch task.
    properties: Arc<RwLock<BTreeMap<String, Property>>>,
    /// instance id -> lease id. Shared with the watch task.
    lease_ids: Arc<RwLock<BTreeMap<String, i64>>>,
}

impl EtcdRegistry {
    pub async fn connect(endpoints: &[String], username: &str, password: &str) -> Result<Arc<Self>> {
        let client = EtcdClient::connect(endpoints, username, password).await?;
        Ok(Arc::new(EtcdRegistry {
            client,
            properties: Arc::new(RwLock::new(BTreeMap::new())),
            lease_ids: Arc::new(RwLock::new(BTreeMap::new())),
        }))
    }

    fn remember_lease(&self, instance: &Instance) {
        if let Some(raw) = instance.metadata.get(ETCD_METADATA_LEASE_ID)
            && let Ok(lease) = raw.parse::<i64>()
        {
            self.lease_ids.write().insert(instance.id.clone(), lease);
        }
    }

    fn forget_lease(&self, id: &str) {
        self.lease_ids.write().remove(id);
    }

    /// Assemble a service from the decoded kvs under its prefix, applying
    /// the property overlay and taking the max ModRevision as the version.
    fn service_from_kvs(&self, service_name: &str, kvs: Vec<(String, String, i64)>) -> Service {
        let mut max_revision = 0;
        let mut property: Option<Property> = None;
        let mut metadata = MD::new();
        let mut instances: BTreeMap<String, BTreeMap<String, Instance>> = BTreeMap::new();

        for (path, value, revision) in kvs {
            let (_, info_type, _) = match parse_raw_path(&path) {
                Ok(parts) => parts,
                Err(e) => {
                    warn!("registry path {}: {}", path, e);
                    continue;
                }
            };
            match info_type.as_str() {
                INFO_TYPE_INSTANCE => match serde_json::from_str::<Instance>(&value) {
                    Ok(instance) => {
                        self.remember_lease(&instance);
                        let mut instance = instance;
                        instance.metadata.remove(ETCD_METADATA_LEASE_ID);
                        instances
                            .entry(instance.zone.clone())
                            .or_default()
                            .insert(instance.id.clone(), instance);
                    }
                    Err(e) => warn!("decode instance {}: {}", path, e),
                },
                INFO_TYPE_PROPERTY => match serde_json::from_str::<Property>(&value) {
                    Ok(p) => {
                        self.properties
                            .write()
                            .insert(p.service_name.clone(), p.clone());
                        property = Some(p);
                    }
                    Err(e) => warn!("decode property {}: {}", path, e),
                },
                other => warn!("unknown registry info type {} at {}", other, path),
            }
            max_revision = max_revision.max(revision);
        }

        if let Some(property) = property {
            for group in instances.values_mut() {
                for instance in group.values_mut() {
                    if let Some(md) = property.attrs.get(&instance.id) {
                        join_md(&mut instance.metadata, md);
                    }
                }
            }
            match encode_zone_weights(&property.zone_weights) {
                Ok(encoded) => {
                    metadata.insert(BACKEND_METADATA_ZONE_WEIGHT.to_string(), encoded);
                }
                Err(e) => error!("encode zone weights of {}: {}", service_name, e),
            }
        }

        Service {
            service_name: service_name.to_string(),
            instances,
            metadata,
            update_time: 0,
            version: max_revision,
        }
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, String, i64)>> {
        let resp = self.client.get_prefix(prefix, None).await?;
        let mut out = Vec::new();
        for kv in resp.kvs {
            match (kv.key_str(), kv.value_str()) {
                (Ok(key), Ok(value)) => out.push((key, value, kv.mod_revision.unwrap_or(0))),
                _ => warn!("undecodable registry kv"),
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Registry for EtcdRegistry {
    async fn register(&self, instance: &Instance, ttl: Duration, refresh: bool) -> Result<()> {
        if !refresh {
            let remembered = self.lease_ids.read().get(&instance.id).copied();
            if let Some(lease) = remembered {
                match self.client.lease_keepalive(lease).await {
                    Ok(()) => return Ok(()),
                    Err(KeeperError::LeaseNotFound) => {
                        warn!(
                            "lease {} of instance {} not found, re-granting",
                            lease, instance.id
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let lease = self.client.lease_grant(ttl.as_secs().max(1)).await?;
        let mut record = instance.clone();
        record
            .metadata
            .insert(ETCD_METADATA_LEASE_ID.to_string(), lease.to_string());
        let blob = serde_json::to_string(&record)?;
        self.client
            .put(
                &instance_path(&instance.service_name, &instance.id),
                &blob,
                Some(lease),
            )
            .await?;
        self.lease_ids.write().insert(instance.id.clone(), lease);
        Ok(())
    }

    async fn deregister(&self, instance: &Instance) -> Result<()> {
        self.client
            .delete(&instance_path(&instance.service_name, &instance.id), false)
            .await?;
        self.forget_lease(&instance.id);
        Ok(())
    }

    async fn get_service(&self, service_name: &str) -> Result<Service> {
        let kvs = self.scan(&service_path(service_name)).await?;
        Ok(self.service_from_kvs(service_name, kvs))
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        let kvs = self.scan(&(root_path() + "/")).await?;
        let mut grouped: BTreeMap<String, Vec<(String, String, i64)>> = BTreeMap::new();
        for kv in kvs {
            match parse_raw_path(&kv.0) {
                Ok((service, _, _)) => grouped.entry(service).or_default().push(kv),
                Err(e) => warn!("registry path {}: {}", kv.0, e),
            }
        }
        Ok(grouped
            .into_iter()
            .map(|(name, kvs)| self.service_from_kvs(&name, kvs))
            .collect())
    }

    async fn watch(&self) -> Result<mpsc::Receiver<RegistryWatchEvent>> {
        let (tx, rx) = mpsc::channel(WATCH_CHAN_SIZE);
        tokio::spawn(watch_loop(
            self.client.clone(),
            tx,
            Arc::clone(&self.properties),
            Arc::clone(&self.lease_ids),
        ));
        Ok(rx)
    }

    async fn set_property(&self, property: &Property) -> Result<()> {
        let blob = serde_json::to_string(property)?;
        self.client
            .put(
                &property_path(&property.service_name, "backend"),
                &blob,
                None,
            )
            .await?;
        Ok(())
    }
}

async fn watch_loop(
    client: EtcdClient,
    tx: mpsc::Sender<RegistryWatchEvent>,
    properties: Arc<RwLock<BTreeMap<String, Property>>>,
    lease_ids: Arc<RwLock<BTreeMap<String, i64>>>,
) {
    loop {
        let mut stream = match client.watch_stream(&(root_path() + "/"), true, None).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("registry watch open: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        while let Some(resp) = stream.next_response().await {
            let Some(result) = resp.result else { continue };
            for raw in result.events {
                let Some(kv) = raw.kv.as_ref() else { continue };
                let Ok(path) = kv.key_str() else { continue };
                let (service_name, info_type, id) = match parse_raw_path(&path) {
                    Ok(parts) => parts,
                    Err(e) => {
                        warn!("registry watch path {}: {}", path, e);
                        continue;
                    }
                };
                let revision = kv.mod_revision.unwrap_or(0);
                let is_delete = raw.event_type.as_deref() == Some("DELETE");

                let event = match info_type.as_str() {
                    INFO_TYPE_INSTANCE => {
                        let instance = if is_delete {
                            lease_ids.write().remove(&id);
                            Instance {
                                id,
                                service_name: service_name.clone(),
                                ..Default::default()
                            }
                        } else {
                            let Ok(value) = kv.value_str() else { continue };
                            let mut instance: Instance = match serde_json::from_str(&value) {
                                Ok(instance) => instance,
                                Err(e) => {
                                    error!("registry watch decode instance {}: {}", path, e);
                                    continue;
                                }
                            };
                            if let Some(raw_lease) = instance.metadata.remove(ETCD_METADATA_LEASE_ID)
                                && let Ok(lease) = raw_lease.parse::<i64>()
                            {
                                lease_ids.write().insert(instance.id.clone(), lease);
                            }
                            if let Some(property) = properties.read().get(&service_name)
                                && let Some(md) = property.attrs.get(&instance.id)
                            {
                                join_md(&mut instance.metadata, md);
                            }
                            instance
                        };
                        let event_type = if is_delete {
                            WatchEventType::Delete
                        } else if kv.create_revision == kv.mod_revision {
                            WatchEventType::Create
                        } else {
                            WatchEventType::Modify
                        };
                        RegistryWatchEvent {
                            event_type,
                            data: WatchData::Instance(instance),
                            version: revision,
                        }
                    }
                    INFO_TYPE_PROPERTY => {
                        if is_delete {
                            continue;
                        }
                        let Ok(value) = kv.value_str() else { continue };
                        let property: Property = match serde_json::from_str(&value) {
                            Ok(property) => property,
                            Err(e) => {
                                error!("registry watch decode property {}: {}", path, e);
                                continue;
                            }
                        };
                        properties
                            .write()
                            .insert(property.service_name.clone(), property.clone());
                        RegistryWatchEvent {
                            event_type: WatchEventType::Modify,
                            data: WatchData::Property(property),
                            version: revision,
                        }
                    }
                    _ => continue,
                };

                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }
        warn!("registry watch stream ended, re-watching");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
