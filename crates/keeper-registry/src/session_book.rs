//! Discovery poll sessions.
//!
//! Each consumer stream gets a session with a bounded outbox. The write
//! loop drains the outbox or heartbeats; fan-out pushes are non-blocking
//! and simply overflow a full outbox — the client recovers the latest
//! state on its next poll, so the last writer always wins.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tonic::Status;
use tracing::debug;

use keeper_api::grpc::{DISCOVERY_EVENT_NONE, DISCOVERY_EVENT_UPDATE, PollsResp};
use keeper_common::error::KeeperError;

use crate::model::Service;
use crate::service_book::SessionPush;

/// Heartbeat cadence of an idle session.
pub const DEFAULT_POLLS_INTERVAL: Duration = Duration::from_secs(60);
const OUTBOX_CAPACITY: usize = 10;
const ERR_CHAN_CAPACITY: usize = 2;

pub struct Session {
    pub id: String,
    pub subscriber: String,
    pub env: String,
    pub service_names: Vec<String>,
    outbox: mpsc::Sender<BTreeMap<String, Service>>,
    err_tx: mpsc::Sender<KeeperError>,
    close_tx: watch::Sender<bool>,
}

impl Session {
    /// Create the session and start its write loop over `resp_tx`. The
    /// returned error receiver fires once on the first terminal error.
    pub fn spawn(
        subscriber: &str,
        env: &str,
        peer: &str,
        service_names: Vec<String>,
        resp_tx: mpsc::Sender<Result<PollsResp, Status>>,
    ) -> (Arc<Session>, mpsc::Receiver<KeeperError>) {
        let id = format!("{}:{:x}", peer, uuid::Uuid::new_v4().as_u128());
        let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(ERR_CHAN_CAPACITY);
        let (close_tx, close_rx) = watch::channel(false);

        let session = Arc::new(Session {
            id,
            subscriber: subscriber.to_string(),
            env: env.to_string(),
            service_names,
            outbox: outbox_tx,
            err_tx: err_tx.clone(),
            close_tx,
        });

        tokio::spawn(write_loop(outbox_rx, close_rx, resp_tx, err_tx));
        (session, err_rx)
    }

    /// Client-driven push: blocks on outbox space, keeping at most one
    /// response in flight per poll.
    pub async fn push(&self, services: BTreeMap<String, Service>) {
        let _ = self.outbox.send(services).await;
    }

    /// Fan-out push: never blocks, overflow is dropped.
    pub fn try_push(&self, services: BTreeMap<String, Service>) {
        if self.outbox.try_send(services).is_err() {
            debug!("session {} outbox full, dropping push", self.id);
        }
    }

    /// Report a terminal error; the dispatching handler tears the session
    /// down. Never blocks.
    pub fn fail(&self, err: KeeperError) {
        let _ = self.err_tx.try_send(err);
    }

    pub fn close(&self) {
        let _ = self.close_tx.send(true);
    }
}

async fn write_loop(
    mut outbox: mpsc::Receiver<BTreeMap<String, Service>>,
    mut close_rx: watch::Receiver<bool>,
    resp_tx: mpsc::Sender<Result<PollsResp, Status>>,
    err_tx: mpsc::Sender<KeeperError>,
) {
    let start = tokio::time::Instant::now() + DEFAULT_POLLS_INTERVAL;
    let mut ticker = tokio::time::interval_at(start, DEFAULT_POLLS_INTERVAL);
    loop {
        let (event_type, services) = tokio::select! {
            _ = close_rx.changed() => return,
            upgraded = outbox.recv() => match upgraded {
                Some(services) => (DISCOVERY_EVENT_UPDATE, services),
                None => return,
            },
            _ = ticker.tick() => (DISCOVERY_EVENT_NONE, BTreeMap::new()),
        };
        let resp = PollsResp {
            event_type,
            services: services
                .iter()
                .map(|(name, service)| (name.clone(), service.into()))
                .collect(),
        };
        if resp_tx.send(Ok(resp)).await.is_err() {
            let _ = err_tx.try_send(KeeperError::Stream("poll stream closed".to_string()));
            return;
        }
    }
}

/// Sessions grouped by subscribed service name.
#[derive(Default)]
pub struct SessionBook {
    sessions: DashMap<String, HashMap<String, Arc<Session>>>,
}

impl SessionBook {
    pub fn new() -> Arc<SessionBook> {
        Arc::new(SessionBook::default())
    }

    pub fn add(&self, session: &Arc<Session>) {
        for name in &session.service_names {
            self.sessions
                .entry(name.clone())
                .or_default()
                .insert(session.id.clone(), Arc::clone(session));
        }
    }

    pub fn delete(&self, session: &Session) {
        for name in &session.service_names {
            if let Some(mut group) = self.sessions.get_mut(name) {
                group.remove(&session.id);
            }
        }
    }

    pub fn session_count(&self, service_name: &str) -> usize {
        self.sessions
            .get(service_name)
            .map(|group| group.len())
            .unwrap_or(0)
    }
}

impl SessionPush for SessionBook {
    fn push(&self, services: BTreeMap<String, Service>) {
        for (name, service) in services {
            let Some(group) = self.sessions.get(&name) else {
                continue;
            };
            for session in group.values() {
                session.try_push(BTreeMap::from([(name.clone(), service.clone())]));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str, version: i64) -> Service {
        Service {
            service_name: name.to_string(),
            version,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_update_reaches_stream() {
        let (resp_tx, mut resp_rx) = mpsc::channel(10);
        let (session, _err_rx) = Session::spawn(
            "subscriber-1",
            "prod",
            "10.0.0.9:1234",
            vec!["live.session".to_string()],
            resp_tx,
        );
        session
            .push(BTreeMap::from([(
                "live.session".to_string(),
                service("live.session", 3),
            )]))
            .await;
        let resp = resp_rx.recv().await.unwrap().unwrap();
        assert_eq!(resp.event_type, DISCOVERY_EVENT_UPDATE);
        assert_eq!(resp.services["live.session"].version, 3);
        session.close();
    }

    #[tokio::test]
    async fn test_overflow_keeps_final_state_reachable() {
        let (resp_tx, mut resp_rx) = mpsc::channel(1);
        let (session, _err_rx) = Session::spawn(
            "subscriber-1",
            "prod",
            "10.0.0.9:1234",
            vec!["live.session".to_string()],
            resp_tx,
        );
        let book = SessionBook::new();
        book.add(&session);

        // a burst far beyond outbox capacity must not wedge the book
        for version in 0..20 {
            book.push(BTreeMap::from([(
                "live.session".to_string(),
                service("live.session", version),
            )]));
        }
        // the stream still yields data; a subsequent client poll would
        // fetch the final state from the service book
        let resp = resp_rx.recv().await.unwrap().unwrap();
        assert_eq!(resp.event_type, DISCOVERY_EVENT_UPDATE);
        session.close();
    }

    #[tokio::test]
    async fn test_book_add_delete() {
        let (resp_tx, _resp_rx) = mpsc::channel(1);
        let (session, _err_rx) = Session::spawn(
            "s",
            "prod",
            "peer",
            vec!["a".to_string(), "b".to_string()],
            resp_tx,
        );
        let book = SessionBook::new();
        book.add(&session);
        assert_eq!(book.session_count("a"), 1);
        assert_eq!(book.session_count("b"), 1);
        book.delete(&session);
        assert_eq!(book.session_count("a"), 0);
        session.close();
    }

    #[tokio::test]
    async fn test_fail_reports_once_without_blocking() {
        let (resp_tx, _resp_rx) = mpsc::channel(1);
        let (session, mut err_rx) =
            Session::spawn("s", "prod", "peer", vec!["a".to_string()], resp_tx);
        for _ in 0..5 {
            session.fail(KeeperError::Stream("boom".to_string()));
        }
        assert!(err_rx.recv().await.is_some());
        session.close();
    }
}
