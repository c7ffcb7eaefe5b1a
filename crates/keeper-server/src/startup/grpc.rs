//! The two RPC listeners: the node port serves the unary sync surface and
//! keeper-to-keeper node queries; the stream port serves the duplex sync
//! stream together with the whole discovery service.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tonic::transport::Server;
use tracing::{error, info};

use keeper_api::grpc::discovery_server::DiscoveryServer;
use keeper_api::grpc::sync_server::SyncServer;
use keeper_core::Engine;
use keeper_core::grpc::SyncService;
use keeper_registry::grpc::DiscoveryService;

async fn shutdown_signal(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.changed().await;
}

pub fn spawn_node_server(
    addr: SocketAddr,
    engine: Arc<Engine>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("node rpc listening on {}", addr);
        let result = Server::builder()
            .add_service(SyncServer::new(SyncService::new(engine)))
            .serve_with_shutdown(addr, shutdown_signal(shutdown))
            .await;
        if let Err(e) = result {
            error!("node rpc server failed: {}", e);
        }
    })
}

pub fn spawn_stream_server(
    addr: SocketAddr,
    engine: Arc<Engine>,
    discovery: DiscoveryService,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("stream rpc listening on {}", addr);
        let result = Server::builder()
            .add_service(SyncServer::new(SyncService::new(engine)))
            .add_service(DiscoveryServer::new(discovery))
            .serve_with_shutdown(addr, shutdown_signal(shutdown))
            .await;
        if let Err(e) = result {
            error!("stream rpc server failed: {}", e);
        }
    })
}
