//! etcd-backed storage for the keeper control plane.
//!
//! The [`etcd`] module is a narrow client over the etcd v3 gRPC-gateway:
//! multi-version reads, prefix scans, `Then`-only transactions, watches,
//! leases and a session-scoped distributed mutex. [`store::KeeperStore`]
//! layers the versioned per-domain configuration store on top of it.

pub mod etcd;
pub mod event;
pub mod store;

pub use etcd::client::EtcdClient;
pub use etcd::session::EtcdSession;
pub use event::{EventMode, StorageEvent, StorageEventKind};
pub use store::{DomainData, KeeperStore};
