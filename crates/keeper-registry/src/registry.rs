//! The registry seam: lease-backed instance records behind a backend-
//! agnostic trait so the service book never sees storage details.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use keeper_common::error::Result;

use crate::model::{Instance, Property, Service};

pub const DEFAULT_REGISTRY_TTL: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEventType {
    Create,
    Modify,
    Delete,
}

#[derive(Clone, Debug)]
pub enum WatchData {
    Instance(Instance),
    Property(Property),
}

#[derive(Clone, Debug)]
pub struct RegistryWatchEvent {
    pub event_type: WatchEventType,
    pub data: WatchData,
    /// Backend revision of the change; becomes the service version.
    pub version: i64,
}

#[async_trait]
pub trait Registry: Send + Sync {
    /// Register an instance under a fresh or remembered lease. With
    /// `refresh` the record is rewritten unconditionally; otherwise a
    /// remembered lease gets one keepalive and only a lost lease falls
    /// back to a fresh grant.
    async fn register(&self, instance: &Instance, ttl: Duration, refresh: bool) -> Result<()>;

    /// Remove the instance record; its lease is left to expire.
    async fn deregister(&self, instance: &Instance) -> Result<()>;

    async fn get_service(&self, service_name: &str) -> Result<Service>;

    async fn list_services(&self) -> Result<Vec<Service>>;

    /// Follow all registry changes. The stream never ends; the sender side
    /// re-watches internally on invalidation.
    async fn watch(&self) -> Result<mpsc::Receiver<RegistryWatchEvent>>;

    async fn set_property(&self, property: &Property) -> Result<()>;
}
