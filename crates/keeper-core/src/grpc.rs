//! gRPC surface of the sync engine.
//!
//! The bidi stream and the unary variant both funnel into the engine's
//! event proxy; one inbound frame yields at most one reply. The stream
//! never carries errors in payload — any failure closes it.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tonic::{Request, Response, Status, Streaming};
use tracing::{error, warn};

use keeper_api::event;
use keeper_api::grpc::sync_server::Sync;
use keeper_api::grpc::{ConfigEvent, NodeQuery};
use keeper_api::{Node, SyncEvent};

use crate::engine::Engine;

const STREAM_CHAN_SIZE: usize = 128;

pub struct SyncService {
    engine: Arc<Engine>,
}

impl SyncService {
    pub fn new(engine: Arc<Engine>) -> SyncService {
        SyncService { engine }
    }

    fn observe(engine: &Engine, kind: &str, event: &SyncEvent, node: Option<&Arc<Node>>) {
        match node {
            Some(node) => {
                let info = node.info();
                engine
                    .metrics
                    .node_event(kind, event.name(), &info.id, &info.domain, &info.hostname);
            }
            None => engine
                .metrics
                .node_event(kind, event.name(), "unknown", "unknown", "unknown"),
        }
    }
}

#[tonic::async_trait]
impl Sync for SyncService {
    type SyncStream = Pin<Box<dyn Stream<Item = Result<ConfigEvent, Status>> + Send + 'static>>;

    async fn sync(
        &self,
        request: Request<Streaming<ConfigEvent>>,
    ) -> Result<Response<Self::SyncStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(STREAM_CHAN_SIZE);
        let engine = Arc::clone(&self.engine);

        tokio::spawn(async move {
            while let Some(message) = inbound.next().await {
                let frame = match message {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("sync stream recv: {}", e);
                        break;
                    }
                };
                let event = match SyncEvent::decode(&frame) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("sync stream decode: {}", e);
                        break;
                    }
                };
                let (reply, node) = match engine.event_proxy(event).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("sync event proxy: {}", e);
                        break;
                    }
                };
                // the wire cannot carry an absent frame; substitute the
                // idle heartbeat
                let reply = reply.unwrap_or(SyncEvent::Heartbeat(None));
                Self::observe(&engine, "req", &reply, node.as_ref());
                let frame = match reply.encode() {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("sync stream encode: {}", e);
                        break;
                    }
                };
                if tx.send(Ok(frame)).await.is_err() {
                    break;
                }
            }
        });

        Ok(Response::new(
            Box::pin(ReceiverStream::new(rx)) as Self::SyncStream
        ))
    }

    async fn once(&self, request: Request<ConfigEvent>) -> Result<Response<ConfigEvent>, Status> {
        let event = SyncEvent::decode(request.get_ref())
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        let (reply, node) = self
            .engine
            .event_proxy(event)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        let frame = match reply {
            Some(reply) => {
                Self::observe(&self.engine, "req", &reply, node.as_ref());
                reply
                    .encode()
                    .map_err(|e| Status::internal(e.to_string()))?
            }
            None => ConfigEvent::default(),
        };
        Ok(Response::new(frame))
    }

    async fn get_node(
        &self,
        request: Request<NodeQuery>,
    ) -> Result<Response<ConfigEvent>, Status> {
        let query = request.get_ref();
        let domain = self
            .engine
            .domains
            .get_domain(&query.domain)
            .map_err(|e| Status::not_found(e.to_string()))?;
        let node = domain
            .get_node(&query.node_id)
            .map_err(|e| Status::not_found(e.to_string()))?;
        let data = serde_json::to_string(&node.snapshot())
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(ConfigEvent {
            event_type: event::EVENT_NONE,
            data,
        }))
    }
}
