//! Session-scoped distributed mutex.

use keeper_common::error::Result;

use super::LOCK_TIMEOUT;
use super::client::EtcdClient;
use super::paths::lock_path;
use super::session::EtcdSession;

/// A held lock. Call [`LockGuard::unlock`] when done; if the holder dies
/// the session lease expiry releases it.
pub struct LockGuard {
    client: EtcdClient,
    key: String,
}

impl LockGuard {
    pub async fn unlock(self) -> Result<()> {
        self.client.unlock(&self.key).await
    }
}

/// Acquire the mutex for `path`. Fails with a lock-busy error after 5 s
/// without acquiring anything.
pub async fn acquire(client: &EtcdClient, session: &EtcdSession, path: &str) -> Result<LockGuard> {
    let lease = session.lease_id().await;
    let key = client.lock(&lock_path(path), lease, LOCK_TIMEOUT).await?;
    Ok(LockGuard {
        client: client.clone(),
        key,
    })
}
