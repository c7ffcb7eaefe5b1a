//! The keeper core: in-memory node and domain books, the sync session
//! engine and the storage watch consumer.

pub mod domain;
pub mod domain_book;
pub mod domain_conf;
pub mod engine;
pub mod grpc;
pub mod metrics;

pub use domain::{Domain, DomainInfo};
pub use domain_book::DomainBook;
pub use domain_conf::DomainConfBook;
pub use engine::Engine;
pub use metrics::NodeMetrics;
