//! Service registry with lease-based liveness and discovery poll sessions.

pub mod etcd;
pub mod grpc;
pub mod model;
pub mod registry;
pub mod service_book;
pub mod session_book;

pub use model::{Instance, Property, Service, ZoneWeight, ZoneWeights};
pub use registry::{Registry, RegistryWatchEvent, WatchData, WatchEventType};
pub use service_book::{ServiceBook, SessionPush};
pub use session_book::{Session, SessionBook};
