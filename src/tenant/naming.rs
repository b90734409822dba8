//! Tenant identifiers and the schema names derived from them.
//!
//! Schema names end up interpolated into DDL that cannot be parameterized
//! (`CREATE SCHEMA`, `SET search_path`, `DROP SCHEMA`), so [`SchemaName`] can
//! only be built through validation and every call site formats it through
//! [`SchemaName::quoted`].

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// PostgreSQL truncates identifiers longer than this (NAMEDATALEN - 1).
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Length of the hex suffix appended to the prefix (128 bits).
const SUFFIX_LEN: usize = 32;

const MAX_TENANT_ID_LEN: usize = 128;

/// Opaque tenant identifier, assigned once at registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty()
            || trimmed.len() > MAX_TENANT_ID_LEN
            || trimmed.chars().any(|c| c.is_control())
        {
            return Err(GatewayError::InvalidTenantId { tenant_id: id });
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Fresh random identifier for onboarding.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantId {
    type Error = GatewayError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(id: TenantId) -> Self {
        id.0
    }
}

/// Identity of whoever triggered the unit of work (user id, job name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorId(pub String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated PostgreSQL schema identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SchemaName(String);

impl SchemaName {
    pub fn parse(name: &str) -> Result<Self> {
        validate_identifier(name).map_err(|reason| GatewayError::InvalidSchemaName {
            name: name.to_string(),
            reason: reason.to_string(),
        })?;
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted form for DDL interpolation.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for SchemaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SchemaName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Maps tenant identifiers to schema names.
///
/// - UUID identifiers (any textual form) become `{prefix}{32 hex digits}`, i.e.
///   the full UUID in simple form, so distinct tenants never collide.
/// - Any other identifier becomes `{prefix}{first 128 bits of sha256(id)}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaNamingPolicy {
    prefix: String,
}

impl SchemaNamingPolicy {
    pub fn new(prefix: &str) -> Result<Self> {
        let invalid = |reason: &str| GatewayError::InvalidSchemaName {
            name: prefix.to_string(),
            reason: reason.to_string(),
        };

        validate_identifier(prefix).map_err(invalid)?;
        if prefix.len() + SUFFIX_LEN > MAX_IDENTIFIER_LEN {
            return Err(invalid("prefix leaves no room for the tenant suffix"));
        }

        Ok(Self {
            prefix: prefix.to_string(),
        })
    }

    pub fn schema_name(&self, tenant: &TenantId) -> SchemaName {
        SchemaName(format!("{}{}", self.prefix, tenant_suffix(tenant)))
    }

    /// Prefix match used when enumerating schemas from the catalog.
    pub fn is_tenant_schema(&self, name: &str) -> bool {
        name.len() > self.prefix.len()
            && name.starts_with(&self.prefix)
            && validate_identifier(name).is_ok()
    }

    /// Parses a schema name and checks it belongs to a tenant.
    pub fn tenant_schema(&self, name: &str) -> Result<SchemaName> {
        let schema = SchemaName::parse(name)?;
        if !self.is_tenant_schema(schema.as_str()) {
            return Err(GatewayError::InvalidSchemaName {
                name: name.to_string(),
                reason: format!("not a tenant schema (expected prefix '{}')", self.prefix),
            });
        }
        Ok(schema)
    }
}

impl Default for SchemaNamingPolicy {
    fn default() -> Self {
        Self {
            prefix: "tenant_".to_string(),
        }
    }
}

fn tenant_suffix(tenant: &TenantId) -> String {
    match Uuid::parse_str(tenant.as_str()) {
        Ok(uuid) => uuid.simple().to_string(),
        Err(_) => {
            let digest = Sha256::digest(tenant.as_str().as_bytes());
            hex::encode(&digest[..SUFFIX_LEN / 2])
        }
    }
}

fn validate_identifier(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        return Err("empty identifier");
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err("longer than 63 bytes");
    }

    let first_char = name.as_bytes()[0];
    if !first_char.is_ascii_lowercase() && first_char != b'_' {
        return Err("must start with a lowercase letter or underscore");
    }

    if !name
        .bytes()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == b'_')
    {
        return Err("only lowercase letters, digits and underscores are allowed");
    }

    // Reserved for system schemas
    if name.starts_with("pg_") {
        return Err("the pg_ prefix is reserved");
    }

    Ok(())
}
