//! Local resource machine: records live in the storage collaborator.
//!
//! Every read goes through a base query carrying the soft-delete exclusion
//! (`deleted_at IS NULL`) and, unless the resource is exempt or the call
//! bypasses it, the tenant predicate. Soft-deleted rows are therefore
//! invisible to the whole engine; only administrative storage access sees
//! them.
//!
//! Filter queries with link-chain parameters are executed innermost-first:
//! the linked resource is queried for matching records, their ids (or
//! foreign keys, for many-links) collapse into an `IN` predicate one level
//! up, until a single flat query remains on the base table.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::client::Client;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::machine::{Machine, MachineKind};
use crate::pagination::Pagination;
use crate::query::{self, Filter, FilterOp, ResolvedParam};
use crate::schema::{Cardinality, Record, Schema};
use crate::storage::{Clause, Cmp, Predicate, Storage, StorageError, StorageQuery};
use crate::tenancy::TenancyMode;

impl FilterOp {
    fn cmp(self) -> Cmp {
        match self {
            FilterOp::Like => Cmp::Like,
            FilterOp::Eq => Cmp::Eq,
            FilterOp::Gte => Cmp::Gte,
            FilterOp::Lte => Cmp::Lte,
            FilterOp::In => Cmp::In,
        }
    }
}

/// A machine persisting into local [`Storage`].
pub struct ResourceMachine {
    schema: Schema,
    storage: Arc<dyn Storage>,
}

impl ResourceMachine {
    pub fn new(schema: Schema, storage: Arc<dyn Storage>) -> Self {
        ResourceMachine { schema, storage }
    }

    /// Base read query: soft-delete exclusion plus tenant scoping.
    fn base_query(&self, engine: &Engine, client: &Client, tenancy: TenancyMode) -> StorageQuery {
        let mut q = StorageQuery::table(&self.schema.table)
            .and(Clause::one(Predicate::is_null("deleted_at")));
        if tenancy == TenancyMode::Enforced && !engine.tenancy().is_exempt(&self.schema.name) {
            engine.tenancy().scope_query(client, &mut q);
        }
        q
    }

    async fn run(
        &self,
        client: &Client,
        query: &StorageQuery,
    ) -> Result<Vec<Record>, EngineError> {
        self.storage
            .select(client.tx, query)
            .await
            .map_err(EngineError::from)
    }

    /// Collapse one resolved link-chain alternative into a predicate on the
    /// base table.
    async fn chain_predicate(
        &self,
        engine: &Engine,
        client: &Client,
        alt: &ResolvedParam,
        op: FilterOp,
        value: &Value,
    ) -> Result<Predicate, EngineError> {
        let innermost = alt.steps.last().expect("chain_predicate requires steps");
        let machine = engine.machine(&innermost.resource)?;
        let mut records = machine
            .read_matching(engine, client, &alt.column, op, value, TenancyMode::Enforced)
            .await?;

        for (level, step) in alt.steps.iter().enumerate().rev() {
            let (column, ids): (&str, Vec<Value>) = match step.cardinality {
                // The level above holds a foreign key to these records.
                Cardinality::Single => (
                    step.foreign_key.as_str(),
                    records
                        .iter()
                        .map(|r| Value::String(r.id.to_string()))
                        .collect(),
                ),
                // These records hold a foreign key back to the level above.
                Cardinality::Many => (
                    "id",
                    records
                        .iter()
                        .filter_map(|r| r.column(&step.foreign_key))
                        .collect(),
                ),
            };
            if level == 0 {
                return Ok(Predicate::new(column, Cmp::In, Value::Array(ids)));
            }
            let above = engine.machine(&alt.steps[level - 1].resource)?;
            records = above
                .read_in(engine, client, column, &ids, TenancyMode::Enforced)
                .await?;
        }
        unreachable!("loop returns at level 0")
    }
}

#[async_trait]
impl Machine for ResourceMachine {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn kind(&self) -> MachineKind {
        MachineKind::Resource
    }

    async fn read_one(
        &self,
        engine: &Engine,
        client: &Client,
        id: Uuid,
        tenancy: TenancyMode,
    ) -> Result<Record, EngineError> {
        let q = self
            .base_query(engine, client, tenancy)
            .and_eq("id", Value::String(id.to_string()));
        self.run(client, &q)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::NotFound {
                machine: self.schema.name.clone(),
            })
    }

    async fn read_all(
        &self,
        engine: &Engine,
        client: &Client,
        page: Option<&Pagination>,
        tenancy: TenancyMode,
    ) -> Result<Vec<Record>, EngineError> {
        let mut q = self.base_query(engine, client, tenancy);
        if let Some(page) = page {
            q = q.paged(page.clone().normalize());
        }
        self.run(client, &q).await
    }

    async fn read_group(
        &self,
        engine: &Engine,
        client: &Client,
        key: &str,
        value: &Value,
        tenancy: TenancyMode,
    ) -> Result<Vec<Record>, EngineError> {
        let q = self
            .base_query(engine, client, tenancy)
            .and_eq(key, value.clone());
        self.run(client, &q).await
    }

    async fn read_in(
        &self,
        engine: &Engine,
        client: &Client,
        column: &str,
        values: &[Value],
        tenancy: TenancyMode,
    ) -> Result<Vec<Record>, EngineError> {
        let q = self.base_query(engine, client, tenancy).and(Clause::one(
            Predicate::new(column, Cmp::In, Value::Array(values.to_vec())),
        ));
        self.run(client, &q).await
    }

    async fn read_matching(
        &self,
        engine: &Engine,
        client: &Client,
        column: &str,
        op: FilterOp,
        value: &Value,
        tenancy: TenancyMode,
    ) -> Result<Vec<Record>, EngineError> {
        let q = self.base_query(engine, client, tenancy).and(Clause::one(
            Predicate::new(column, op.cmp(), value.clone()),
        ));
        self.run(client, &q).await
    }

    async fn query(
        &self,
        engine: &Engine,
        client: &Client,
        filter: &Filter,
        page: Option<&Pagination>,
    ) -> Result<Vec<Record>, EngineError> {
        let resolved = query::resolve(engine, &self.schema.name, filter)?;

        let mut q = self.base_query(engine, client, TenancyMode::Enforced);
        for rule in &resolved {
            let mut predicates = Vec::with_capacity(rule.alternatives.len());
            for alt in &rule.alternatives {
                let predicate = if alt.steps.is_empty() {
                    Predicate::new(&alt.column, rule.op.cmp(), rule.value.clone())
                } else {
                    self.chain_predicate(engine, client, alt, rule.op, &rule.value)
                        .await?
                };
                predicates.push(predicate);
            }
            q = q.and(Clause::any_of(predicates));
        }
        if let Some(page) = page {
            q = q.paged(page.clone().normalize());
        }
        self.run(client, &q).await
    }

    async fn save(
        &self,
        engine: &Engine,
        client: &Client,
        record: &mut Record,
    ) -> Result<(), EngineError> {
        if !engine.tenancy().is_exempt(&self.schema.name) {
            engine.tenancy().stamp(client, &mut record.fields);
        }
        let saved = self
            .storage
            .save(client.tx, &self.schema.table, record)
            .await
            .map_err(|err| match err {
                StorageError::BadQuery(_) => EngineError::from(err),
                StorageError::Backend(e) => EngineError::SaveFailed {
                    machine: self.schema.name.clone(),
                    message: e.to_string(),
                },
            })?;
        *record = saved;
        Ok(())
    }

    async fn exists_where(
        &self,
        engine: &Engine,
        client: &Client,
        column: &str,
        value: &Value,
        exclude: Option<Uuid>,
    ) -> Result<bool, EngineError> {
        let q = self
            .base_query(engine, client, TenancyMode::Enforced)
            .and_eq(column, value.clone());
        let rows = self.run(client, &q).await?;
        Ok(rows.iter().any(|r| Some(r.id) != exclude))
    }
}
