mod client;
mod manager;
#[cfg(test)]
pub(crate) mod memory;
mod router;

pub use client::{ClientError, ConnectionPool, LedgerEntry, PgClient, PoolStatus, TenantClient};
pub use manager::PoolManager;
pub use router::{ConnectionRouter, RoutedConnection, TenantDirectory};
