//! Tenant identity: who a unit of work is for and which schema holds their data.

mod context;
mod locks;
mod naming;

pub use context::TenantContext;
pub use locks::SchemaLocks;
pub use naming::{ActorId, SchemaName, SchemaNamingPolicy, TenantId, MAX_IDENTIFIER_LEN};
