//! Multi-tenant isolation strategy.
//!
//! Tenancy is transparent to schemas: the resource machine asks the
//! strategy to stamp a tenant column before save and to inject a tenant
//! predicate into every read. A resource may opt out per call
//! ([`TenancyMode::Bypass`]) for administrative cross-tenant reads, and
//! resource names on the exemption list (including the `*` wildcard) are
//! never scoped at all.

use std::collections::HashSet;

use serde_json::Value;

use crate::client::Client;
use crate::storage::{Clause, Predicate, StorageQuery};

/// Per-call tenancy behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenancyMode {
    /// Apply the tenant predicate/stamp.
    Enforced,
    /// Skip tenancy for this call only.
    Bypass,
}

/// Pluggable multi-tenancy strategy.
pub trait Tenancy: Send + Sync {
    /// Whether the named resource is globally exempt from tenancy.
    fn is_exempt(&self, resource: &str) -> bool;

    /// Stamp the tenant column onto a record before save.
    fn stamp(&self, client: &Client, fields: &mut serde_json::Map<String, Value>);

    /// Inject the tenant-equality predicate into a read query.
    fn scope_query(&self, client: &Client, query: &mut StorageQuery);
}

/// Column-based tenancy: one tenant column stamped from the principal.
pub struct ColumnTenancy {
    column: String,
    exempt: HashSet<String>,
}

impl ColumnTenancy {
    pub fn new(column: impl Into<String>) -> Self {
        ColumnTenancy {
            column: column.into(),
            exempt: HashSet::new(),
        }
    }

    /// Exempt a resource name from tenancy. `*` exempts everything.
    pub fn exempt(mut self, resource: impl Into<String>) -> Self {
        self.exempt.insert(resource.into());
        self
    }
}

impl Tenancy for ColumnTenancy {
    fn is_exempt(&self, resource: &str) -> bool {
        self.exempt.contains("*") || self.exempt.contains(resource)
    }

    fn stamp(&self, client: &Client, fields: &mut serde_json::Map<String, Value>) {
        if fields.contains_key(&self.column) {
            return;
        }
        if let Some(tenant) = client.principal.tenant_id {
            fields.insert(
                self.column.clone(),
                Value::String(tenant.to_string()),
            );
        }
    }

    fn scope_query(&self, client: &Client, query: &mut StorageQuery) {
        if let Some(tenant) = client.principal.tenant_id {
            query.clauses.push(Clause::one(Predicate::eq(
                self.column.clone(),
                Value::String(tenant.to_string()),
            )));
        }
    }
}

/// Disables tenancy entirely. Useful for single-tenant deployments and
/// tests that are not about isolation.
pub struct NoTenancy;

impl Tenancy for NoTenancy {
    fn is_exempt(&self, _resource: &str) -> bool {
        true
    }

    fn stamp(&self, _client: &Client, _fields: &mut serde_json::Map<String, Value>) {}

    fn scope_query(&self, _client: &Client, _query: &mut StorageQuery) {}
}
