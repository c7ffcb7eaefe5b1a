pub mod client;
pub mod lock;
pub mod model;
pub mod paths;
pub mod session;

use std::time::Duration;

pub(crate) const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const READ_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const RETRY_COUNT: usize = 3;
pub(crate) const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// TTL of the adapter's session lease; locks attach to it.
pub(crate) const SESSION_LEASE_TTL: u64 = 60;
/// TTL of a keeper's presence lease.
pub(crate) const KEEPER_ADDR_LEASE_TTL: u64 = 3600;
/// TTL of the reconciliation leader token.
pub(crate) const CRON_LEASE_TTL: u64 = 3600;
