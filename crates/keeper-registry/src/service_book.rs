//! In-memory projection of all registered services.
//!
//! Fed exclusively by registry watch events: instances appear, change and
//! vanish only through the watch, so every replica converges on the same
//! view. Changes fan out to poll sessions through the [`SessionPush`] seam
//! (the book never holds the session book by type, which keeps the
//! dependency one-way).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{error, warn};

use keeper_common::error::{KeeperError, Result};

use crate::model::{
    BACKEND_METADATA_PREFIX, BACKEND_METADATA_ZONE_WEIGHT, Instance, MD, Property, Service,
    encode_zone_weights,
};
use crate::registry::{Registry, RegistryWatchEvent, WatchData, WatchEventType};

/// Fan-out seam towards poll sessions.
pub trait SessionPush: Send + Sync {
    fn push(&self, services: BTreeMap<String, Service>);
}

pub struct ServiceBook {
    services: RwLock<BTreeMap<String, Service>>,
    registry: Arc<dyn Registry>,
}

impl ServiceBook {
    pub fn new(registry: Arc<dyn Registry>) -> Arc<ServiceBook> {
        Arc::new(ServiceBook {
            services: RwLock::new(BTreeMap::new()),
            registry,
        })
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    /// Load the full service list once at startup.
    pub async fn load(&self) -> Result<()> {
        let services = self.registry.list_services().await?;
        let mut map = self.services.write();
        for service in services {
            map.insert(service.service_name.clone(), service);
        }
        Ok(())
    }

    pub fn service(&self, name: &str) -> Option<Service> {
        self.services.read().get(name).cloned()
    }

    /// Services newer than what the client already holds. On reconnect the
    /// full state of every requested service it knows is pushed.
    pub fn get_upgraded_services(
        &self,
        service_versions: &HashMap<String, i64>,
        reconnect: bool,
    ) -> BTreeMap<String, Service> {
        let services = self.services.read();
        let mut upgraded = BTreeMap::new();
        for (name, known_version) in service_versions {
            let Some(service) = services.get(name) else {
                continue;
            };
            if reconnect || service.version > *known_version {
                upgraded.insert(name.clone(), service.clone());
            }
        }
        upgraded
    }

    fn find_instance(
        services: &BTreeMap<String, Service>,
        service_name: &str,
        zone: &str,
        id: &str,
    ) -> Result<(String, String)> {
        let service = services
            .get(service_name)
            .ok_or_else(|| KeeperError::not_found("service", service_name))?;
        if zone.is_empty() {
            for (zone_name, group) in &service.instances {
                if group.contains_key(id) {
                    return Ok((zone_name.clone(), id.to_string()));
                }
            }
            return Err(KeeperError::not_found("instance", id));
        }
        let group = service
            .instances
            .get(zone)
            .ok_or_else(|| KeeperError::not_found("zone", zone))?;
        if !group.contains_key(id) {
            return Err(KeeperError::not_found("instance", id));
        }
        Ok((zone.to_string(), id.to_string()))
    }

    fn apply_instance_event(
        &self,
        event_type: WatchEventType,
        instance: Instance,
        version: i64,
    ) -> Result<()> {
        let mut services = self.services.write();
        let now = chrono::Utc::now().timestamp();
        match event_type {
            WatchEventType::Create => {
                let service = services
                    .entry(instance.service_name.clone())
                    .or_insert_with(|| Service::new(&instance.service_name));
                service
                    .instances
                    .entry(instance.zone.clone())
                    .or_default()
                    .insert(instance.id.clone(), instance);
                service.update_time = now;
                service.version = version;
                Ok(())
            }
            WatchEventType::Modify => {
                let (zone, id) = Self::find_instance(
                    &services,
                    &instance.service_name,
                    &instance.zone,
                    &instance.id,
                )?;
                let service = services
                    .get_mut(&instance.service_name)
                    .ok_or_else(|| KeeperError::not_found("service", &*instance.service_name))?;
                if let Some(saved) = service
                    .instances
                    .get_mut(&zone)
                    .and_then(|group| group.get_mut(&id))
                {
                    update_metadata(&mut saved.metadata, &instance.metadata, false);
                }
                service.update_time = now;
                service.version = version;
                Ok(())
            }
            WatchEventType::Delete => {
                let (zone, id) = Self::find_instance(
                    &services,
                    &instance.service_name,
                    &instance.zone,
                    &instance.id,
                )?;
                let service = services
                    .get_mut(&instance.service_name)
                    .ok_or_else(|| KeeperError::not_found("service", &*instance.service_name))?;
                if let Some(group) = service.instances.get_mut(&zone) {
                    group.remove(&id);
                }
                service.update_time = now;
                service.version = version;
                Ok(())
            }
        }
    }

    fn apply_property(&self, property: &Property, version: i64) -> Result<()> {
        let mut services = self.services.write();
        let service = services
            .get_mut(&property.service_name)
            .ok_or_else(|| KeeperError::not_found("service", &*property.service_name))?;

        service.metadata.insert(
            BACKEND_METADATA_ZONE_WEIGHT.to_string(),
            encode_zone_weights(&property.zone_weights)?,
        );
        service.version = version;

        for (id, md) in &property.attrs {
            let mut found = false;
            for group in service.instances.values_mut() {
                if let Some(instance) = group.get_mut(id) {
                    update_metadata(&mut instance.metadata, md, true);
                    found = true;
                    break;
                }
            }
            if !found {
                warn!(
                    "property overlay: instance {} of {} not found",
                    id, property.service_name
                );
            }
        }
        Ok(())
    }

    /// Pump registry watch events into the book and fan each change out to
    /// every session subscribed to the service.
    pub fn spawn_watch(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<RegistryWatchEvent>,
        sessions: Arc<dyn SessionPush>,
    ) {
        let book = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let service_name = match &event.data {
                    WatchData::Instance(instance) => instance.service_name.clone(),
                    WatchData::Property(property) => property.service_name.clone(),
                };
                let applied = match event.data {
                    WatchData::Instance(instance) => {
                        book.apply_instance_event(event.event_type, instance, event.version)
                    }
                    WatchData::Property(property) => {
                        book.apply_property(&property, event.version)
                    }
                };
                if let Err(e) = applied {
                    error!("registry watch apply for {}: {}", service_name, e);
                    continue;
                }
                if let Some(service) = book.service(&service_name) {
                    sessions.push(BTreeMap::from([(service_name, service)]));
                }
            }
        });
    }
}

/// Overlay metadata by origin: with `backend` only administrative keys
/// (prefixed) are written, otherwise only instance-owned keys. Overlays
/// never delete keys from the other origin.
fn update_metadata(metadata: &mut MD, fresh: &MD, backend: bool) {
    for (k, v) in fresh {
        let is_backend = k.starts_with(BACKEND_METADATA_PREFIX);
        if is_backend == backend {
            metadata.insert(k.clone(), v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BACKEND_METADATA_INSTANCE_ONLINE, ZoneWeight, ZoneWeights};
    use async_trait::async_trait;
    use std::time::Duration;

    struct NullRegistry;

    #[async_trait]
    impl Registry for NullRegistry {
        async fn register(&self, _: &Instance, _: Duration, _: bool) -> Result<()> {
            Ok(())
        }
        async fn deregister(&self, _: &Instance) -> Result<()> {
            Ok(())
        }
        async fn get_service(&self, name: &str) -> Result<Service> {
            Ok(Service::new(name))
        }
        async fn list_services(&self) -> Result<Vec<Service>> {
            Ok(Vec::new())
        }
        async fn watch(&self) -> Result<mpsc::Receiver<RegistryWatchEvent>> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
        async fn set_property(&self, _: &Property) -> Result<()> {
            Ok(())
        }
    }

    fn book() -> Arc<ServiceBook> {
        ServiceBook::new(Arc::new(NullRegistry))
    }

    fn instance(id: &str, zone: &str) -> Instance {
        Instance {
            id: id.to_string(),
            service_name: "live.session".to_string(),
            zone: zone.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_modify_delete_flow() {
        let book = book();
        book.apply_instance_event(WatchEventType::Create, instance("a", "bjcc"), 5)
            .unwrap();
        let service = book.service("live.session").unwrap();
        assert_eq!(service.version, 5);
        assert!(service.instances["bjcc"].contains_key("a"));

        let mut changed = instance("a", "bjcc");
        changed
            .metadata
            .insert("weight".to_string(), "5".to_string());
        book.apply_instance_event(WatchEventType::Modify, changed, 6)
            .unwrap();
        let service = book.service("live.session").unwrap();
        assert_eq!(service.version, 6);
        assert_eq!(service.instances["bjcc"]["a"].metadata["weight"], "5");

        // deletes resolve the zone when the event does not carry one
        book.apply_instance_event(WatchEventType::Delete, instance("a", ""), 7)
            .unwrap();
        let service = book.service("live.session").unwrap();
        assert!(service.instances["bjcc"].is_empty());
        assert_eq!(service.version, 7);
    }

    #[test]
    fn test_modify_unknown_instance_fails() {
        let book = book();
        assert!(
            book.apply_instance_event(WatchEventType::Modify, instance("ghost", ""), 1)
                .is_err()
        );
    }

    #[test]
    fn test_instance_events_never_touch_backend_metadata() {
        let book = book();
        let mut existing = instance("a", "bjcc");
        existing.metadata.insert(
            BACKEND_METADATA_INSTANCE_ONLINE.to_string(),
            "N".to_string(),
        );
        book.apply_instance_event(WatchEventType::Create, existing, 1)
            .unwrap();

        let mut fresh = instance("a", "bjcc");
        fresh.metadata.insert(
            BACKEND_METADATA_INSTANCE_ONLINE.to_string(),
            "Y".to_string(),
        );
        fresh.metadata.insert("weight".to_string(), "3".to_string());
        book.apply_instance_event(WatchEventType::Modify, fresh, 2)
            .unwrap();

        let service = book.service("live.session").unwrap();
        let md = &service.instances["bjcc"]["a"].metadata;
        assert_eq!(md[BACKEND_METADATA_INSTANCE_ONLINE], "N");
        assert_eq!(md["weight"], "3");
    }

    #[test]
    fn test_property_overlay_is_idempotent() {
        let book = book();
        book.apply_instance_event(WatchEventType::Create, instance("a", "bjcc"), 1)
            .unwrap();

        let property = Property {
            service_name: "live.session".to_string(),
            zone_weights: ZoneWeights::from([(
                "bjcc".to_string(),
                ZoneWeight {
                    src: "bjcc".to_string(),
                    dst: BTreeMap::from([("bjcc".to_string(), 100)]),
                },
            )]),
            attrs: BTreeMap::from([(
                "a".to_string(),
                MD::from([(
                    BACKEND_METADATA_INSTANCE_ONLINE.to_string(),
                    "N".to_string(),
                )]),
            )]),
        };
        book.apply_property(&property, 2).unwrap();
        let first = book.service("live.session").unwrap();
        book.apply_property(&property, 2).unwrap();
        let second = book.service("live.session").unwrap();
        assert_eq!(first, second);
        assert!(first.metadata.contains_key(BACKEND_METADATA_ZONE_WEIGHT));
        assert_eq!(
            first.instances["bjcc"]["a"].metadata[BACKEND_METADATA_INSTANCE_ONLINE],
            "N"
        );
    }

    #[test]
    fn test_get_upgraded_services_is_version_gated() {
        let book = book();
        book.apply_instance_event(WatchEventType::Create, instance("a", "bjcc"), 10)
            .unwrap();

        let versions = HashMap::from([("live.session".to_string(), 10_i64)]);
        assert!(book.get_upgraded_services(&versions, false).is_empty());
        assert_eq!(book.get_upgraded_services(&versions, true).len(), 1);

        let stale = HashMap::from([("live.session".to_string(), 3_i64)]);
        assert_eq!(book.get_upgraded_services(&stale, false).len(), 1);

        let unknown = HashMap::from([("ghost".to_string(), 0_i64)]);
        assert!(book.get_upgraded_services(&unknown, true).is_empty());
    }
}
