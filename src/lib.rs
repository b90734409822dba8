//! KioscoDB Gateway Library
//!
//! Schema-per-tenant PostgreSQL plumbing: tenant-aware connection routing,
//! schema provisioning from a template, versioned migrations across every
//! tenant schema, and per-schema logical backups.

pub mod api;
pub mod backup;
pub mod config;
pub mod error;
pub mod pool;
pub mod schema;
pub mod security;
pub mod tenant;
