pub mod grpc;
pub mod logging;

pub use grpc::{spawn_node_server, spawn_stream_server};
pub use logging::init_logging;
