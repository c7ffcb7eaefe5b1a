//! Shared data model and wire types for the keeper control plane.

pub mod conf;
pub mod event;
pub mod grpc;
pub mod node;
pub mod operate;
pub mod parser;

pub use conf::{ConfData, StructData};
pub use event::SyncEvent;
pub use node::{Node, NodeInfo, NodeSnapshot, NodeStatus, ProcInfo};
pub use operate::{DEFAULT_SECTION, Opcode, Operate};
pub use parser::TypedValue;
