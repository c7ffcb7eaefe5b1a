//! The adapter's long-lived backend session.
//!
//! One lease per process; distributed locks attach to it so a dead keeper
//! releases its locks when the lease expires. A monitor task keeps the
//! lease alive and transparently re-grants it under the write lock, so
//! in-flight lock holders fail fast while later calls recover.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info};

use keeper_common::error::Result;

use super::SESSION_LEASE_TTL;
use super::client::EtcdClient;

pub struct EtcdSession {
    client: EtcdClient,
    lease: RwLock<i64>,
}

impl EtcdSession {
    pub async fn new(client: EtcdClient) -> Result<Arc<EtcdSession>> {
        let lease = client.lease_grant(SESSION_LEASE_TTL).await?;
        let session = Arc::new(EtcdSession {
            client,
            lease: RwLock::new(lease),
        });
        session.spawn_monitor();
        Ok(session)
    }

    pub async fn lease_id(&self) -> i64 {
        *self.lease.read().await
    }

    fn spawn_monitor(self: &Arc<Self>) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let interval = std::time::Duration::from_secs(SESSION_LEASE_TTL / 3);
            loop {
                tokio::time::sleep(interval).await;
                let lease = session.lease_id().await;
                if session.client.lease_keepalive(lease).await.is_ok() {
                    continue;
                }
                error!("session lease {} lost, re-granting", lease);
                let mut guard = session.lease.write().await;
                match session.client.lease_grant(SESSION_LEASE_TTL).await {
                    Ok(new_lease) => {
                        info!("session lease re-granted: {}", new_lease);
                        *guard = new_lease;
                    }
                    Err(e) => error!("session lease re-grant failed: {}", e),
                }
            }
        });
    }
}
