//! gRPC surface of the registry: unary register/keepalive/deregister and
//! the `Polls` duplex stream.

use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::info;

use keeper_api::grpc::discovery_server::Discovery;
use keeper_api::grpc::{DeregisterReq, KeepAliveReq, PollsReq, PollsResp, RegisterReq, RegistryResp};
use keeper_common::error::KeeperError;

use crate::model::Instance;
use crate::registry::DEFAULT_REGISTRY_TTL;
use crate::service_book::ServiceBook;
use crate::session_book::{Session, SessionBook};

/// Poll requests are refused for a short window after start so clients
/// re-register before any result is computed against possibly-empty state.
const RESTART_POLLS_UNWORKING_DURATION: Duration = Duration::from_secs(5);

const RESP_CHAN_SIZE: usize = 10;

pub struct DiscoveryService {
    book: Arc<ServiceBook>,
    sessions: Arc<SessionBook>,
    started_at: Instant,
}

impl DiscoveryService {
    pub fn new(book: Arc<ServiceBook>, sessions: Arc<SessionBook>) -> DiscoveryService {
        DiscoveryService {
            book,
            sessions,
            started_at: Instant::now(),
        }
    }

    fn instance_of(instance: Option<&keeper_api::grpc::Instance>) -> Result<Instance, Status> {
        instance
            .map(Instance::from)
            .ok_or_else(|| Status::invalid_argument("instance is invalid"))
    }

    fn ttl_of(lease_second: i64) -> Duration {
        if lease_second <= 0 {
            DEFAULT_REGISTRY_TTL
        } else {
            Duration::from_secs(lease_second as u64)
        }
    }
}

#[tonic::async_trait]
impl Discovery for DiscoveryService {
    async fn register(
        &self,
        request: Request<RegisterReq>,
    ) -> Result<Response<RegistryResp>, Status> {
        let req = request.get_ref();
        let instance = Self::instance_of(req.instance.as_ref())?;
        self.book
            .registry()
            .register(&instance, Self::ttl_of(req.lease_second), true)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(RegistryResp {}))
    }

    async fn keep_alive(
        &self,
        request: Request<KeepAliveReq>,
    ) -> Result<Response<RegistryResp>, Status> {
        let req = request.get_ref();
        let instance = Self::instance_of(req.instance.as_ref())?;
        self.book
            .registry()
            .register(&instance, Self::ttl_of(req.lease_second), false)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(RegistryResp {}))
    }

    async fn deregister(
        &self,
        request: Request<DeregisterReq>,
    ) -> Result<Response<RegistryResp>, Status> {
        let req = request.get_ref();
        let instance = Self::instance_of(req.instance.as_ref())?;
        self.book
            .registry()
            .deregister(&instance)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(RegistryResp {}))
    }

    type PollsStream = Pin<Box<dyn Stream<Item = Result<PollsResp, Status>> + Send + 'static>>;

    async fn polls(
        &self,
        request: Request<Streaming<PollsReq>>,
    ) -> Result<Response<Self::PollsStream>, Status> {
        if self.started_at.elapsed() < RESTART_POLLS_UNWORKING_DURATION {
            return Err(Status::internal("server is restarting"));
        }

        let peer = request
            .remote_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        let mut inbound = request.into_inner();

        let first = match inbound.message().await {
            Ok(Some(req)) => req,
            Ok(None) => return Err(Status::internal("poll stream closed before first request")),
            Err(e) => return Err(e),
        };

        let service_names: Vec<String> = first.poll_services.keys().cloned().collect();
        let (resp_tx, resp_rx) = mpsc::channel(RESP_CHAN_SIZE);
        let (session, mut err_rx) = Session::spawn(
            &first.subscriber,
            &first.env,
            &peer,
            service_names,
            resp_tx,
        );

        // a first poll pushes the full state of every known subscribed service
        let upgraded = self.book.get_upgraded_services(&first.poll_services, true);
        if !upgraded.is_empty() {
            session.push(upgraded).await;
        }
        self.sessions.add(&session);
        info!(
            "poll session {} opened by {} for {:?}",
            session.id, session.subscriber, session.service_names
        );

        let book = Arc::clone(&self.book);
        let read_session = Arc::clone(&session);
        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(req)) => {
                        let upgraded = book.get_upgraded_services(&req.poll_services, false);
                        if !upgraded.is_empty() {
                            read_session.push(upgraded).await;
                        }
                    }
                    Ok(None) => {
                        read_session.fail(KeeperError::Stream("poll stream closed".to_string()));
                        return;
                    }
                    Err(e) => {
                        read_session.fail(KeeperError::Stream(e.to_string()));
                        return;
                    }
                }
            }
        });

        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            if let Some(err) = err_rx.recv().await {
                info!("poll session {} closed: {}", session.id, err);
            }
            sessions.delete(&session);
            session.close();
        });

        Ok(Response::new(
            Box::pin(ReceiverStream::new(resp_rx)) as Self::PollsStream
        ))
    }
}
