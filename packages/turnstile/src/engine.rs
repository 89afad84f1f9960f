//! The machine registry and public operation surface.
//!
//! An [`Engine`] is built once at startup from a set of machines and a
//! tenancy strategy, then shared immutably across requests. Registration
//! validates every schema up front: a missing `create` transition, an
//! undeclared target state, or a graph link to an unregistered resource is
//! a startup error, not a request-time surprise.
//!
//! Per-request state (principal, transaction, action stack, cache) lives in
//! the [`Client`], which every operation takes explicitly.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::builder::{self, Entity};
use crate::client::Client;
use crate::error::EngineError;
use crate::executor;
use crate::machine::Machine;
use crate::pagination::Pagination;
use crate::query::Filter;
use crate::schema::{
    FromStates, InputSchema, InputType, OutputProp, OutputSchema, Record, Schema, Target,
    VOID_STATE,
};
use crate::tenancy::{NoTenancy, Tenancy, TenancyMode};

/// Immutable registry of machines plus the tenancy strategy.
pub struct Engine {
    machines: HashMap<String, Arc<dyn Machine>>,
    tenancy: Arc<dyn Tenancy>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("machines", &self.machines.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Look up a registered machine.
    pub fn machine(&self, resource: &str) -> Result<&Arc<dyn Machine>, EngineError> {
        self.machines
            .get(resource)
            .ok_or_else(|| EngineError::UnknownResource {
                resource: resource.to_string(),
            })
    }

    /// Look up a registered machine's schema.
    pub fn schema(&self, resource: &str) -> Result<&Schema, EngineError> {
        Ok(self.machine(resource)?.schema())
    }

    pub fn tenancy(&self) -> &dyn Tenancy {
        self.tenancy.as_ref()
    }

    /// Run a named transition against an existing record.
    pub async fn run_transition(
        &self,
        client: &Client,
        resource: &str,
        transition: &str,
        record: &mut Record,
        input: Value,
    ) -> Result<Entity, EngineError> {
        let machine = self.machine(resource)?;
        executor::run_transition(self, client, machine.as_ref(), transition, record, input).await
    }

    /// Create a record: a fresh void record through the `create` transition.
    pub async fn create(
        &self,
        client: &Client,
        resource: &str,
        input: Value,
    ) -> Result<Entity, EngineError> {
        let mut record = Record::new_void();
        self.run_transition(client, resource, "create", &mut record, input)
            .await
    }

    /// Edit by input: an `id` key selects the record to transition; absent
    /// `id` falls through to creation.
    ///
    /// When invoked from inside another transition, the target record must
    /// belong to the calling (parent) record: a record carrying a
    /// `<parent>_id` column pointing elsewhere is a sibling, and editing it
    /// through this path is rejected.
    pub async fn edit(
        &self,
        client: &Client,
        resource: &str,
        transition: &str,
        mut input: Value,
    ) -> Result<Entity, EngineError> {
        let id = input
            .get("id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok());
        if let Some(obj) = input.as_object_mut() {
            obj.remove("id");
        }

        let Some(id) = id else {
            return self.create(client, resource, input).await;
        };

        let machine = self.machine(resource)?;
        let mut record = machine
            .read_one(self, client, id, TenancyMode::Enforced)
            .await?;

        if let Some(parent) = client.top() {
            let fk = format!("{}_id", parent.machine);
            if let Some(owner) = record.column(&fk) {
                if owner != Value::String(parent.record.id.to_string()) {
                    return Err(EngineError::EditSiblingResource {
                        machine: resource.to_string(),
                    });
                }
            }
        }

        executor::run_transition(self, client, machine.as_ref(), transition, &mut record, input)
            .await
    }

    /// Soft-delete through the schema's `delete` transition.
    pub async fn delete(
        &self,
        client: &Client,
        resource: &str,
        id: Uuid,
    ) -> Result<Entity, EngineError> {
        let machine = self.machine(resource)?;
        let mut record = machine
            .read_one(self, client, id, TenancyMode::Enforced)
            .await?;
        executor::run_transition(
            self,
            client,
            machine.as_ref(),
            "delete",
            &mut record,
            Value::Object(Map::new()),
        )
        .await
    }

    /// Read one entity through the per-request cache.
    ///
    /// Repeated reads of the same `(resource, id)` within a request return
    /// the same `Arc`. The cache is keyed without the tenancy mode; a
    /// bypass read can satisfy a later enforced read within one request.
    pub async fn read_one(
        &self,
        client: &Client,
        resource: &str,
        id: Uuid,
        tenancy: TenancyMode,
    ) -> Result<Arc<Entity>, EngineError> {
        if let Some(hit) = client.cached(resource, id) {
            return Ok(hit);
        }
        let machine = self.machine(resource)?;
        let record = machine.read_one(self, client, id, tenancy).await?;
        let entity = Arc::new(builder::build_entity(self, client, machine.schema(), &record).await?);
        if entity.is_deep() {
            client.cache_entity(resource, id, entity.clone());
        }
        Ok(entity)
    }

    /// Read all entities, paginated.
    pub async fn read_all(
        &self,
        client: &Client,
        resource: &str,
        page: Option<&Pagination>,
        tenancy: TenancyMode,
    ) -> Result<Vec<Arc<Entity>>, EngineError> {
        let machine = self.machine(resource)?;
        let records = machine.read_all(self, client, page, tenancy).await?;
        self.build_and_cache(client, resource, machine.as_ref(), records)
            .await
    }

    /// Read the group of entities whose `key` column equals `value`.
    pub async fn read_group(
        &self,
        client: &Client,
        resource: &str,
        key: &str,
        value: &Value,
        tenancy: TenancyMode,
    ) -> Result<Vec<Arc<Entity>>, EngineError> {
        let machine = self.machine(resource)?;
        let records = machine.read_group(self, client, key, value, tenancy).await?;
        self.build_and_cache(client, resource, machine.as_ref(), records)
            .await
    }

    /// Run a filter query; results are injected into the per-request cache.
    pub async fn query(
        &self,
        client: &Client,
        resource: &str,
        filter: &Filter,
        page: Option<&Pagination>,
    ) -> Result<Vec<Arc<Entity>>, EngineError> {
        let machine = self.machine(resource)?;
        let records = machine.query(self, client, filter, page).await?;
        self.build_and_cache(client, resource, machine.as_ref(), records)
            .await
    }

    /// Build an entity for a record without going through a read.
    pub async fn build(
        &self,
        client: &Client,
        resource: &str,
        record: &Record,
    ) -> Result<Entity, EngineError> {
        let machine = self.machine(resource)?;
        builder::build_entity(self, client, machine.schema(), record).await
    }

    async fn build_and_cache(
        &self,
        client: &Client,
        resource: &str,
        machine: &dyn Machine,
        records: Vec<Record>,
    ) -> Result<Vec<Arc<Entity>>, EngineError> {
        let mut entities = Vec::with_capacity(records.len());
        for record in &records {
            let entity =
                Arc::new(builder::build_entity(self, client, machine.schema(), record).await?);
            if entity.is_deep() {
                client.cache_entity(resource, record.id, entity.clone());
            }
            entities.push(entity);
        }
        Ok(entities)
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Collects machines and validates every schema at `build` time.
pub struct EngineBuilder {
    machines: HashMap<String, Arc<dyn Machine>>,
    tenancy: Arc<dyn Tenancy>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        EngineBuilder {
            machines: HashMap::new(),
            tenancy: Arc::new(NoTenancy),
        }
    }

    pub fn with_machine(mut self, machine: impl Machine + 'static) -> Self {
        self.machines
            .insert(machine.schema().name.clone(), Arc::new(machine));
        self
    }

    pub fn with_tenancy(mut self, tenancy: impl Tenancy + 'static) -> Self {
        self.tenancy = Arc::new(tenancy);
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        for machine in self.machines.values() {
            self.validate_schema(machine.schema())?;
        }
        Ok(Engine {
            machines: self.machines,
            tenancy: self.tenancy,
        })
    }

    fn invalid(schema: &Schema, message: impl Into<String>) -> EngineError {
        EngineError::InvalidSchema {
            machine: schema.name.clone(),
            message: message.into(),
        }
    }

    fn validate_schema(&self, schema: &Schema) -> Result<(), EngineError> {
        let create = schema
            .transition("create")
            .ok_or_else(|| Self::invalid(schema, "missing 'create' transition"))?;
        if !create.from.allows(VOID_STATE) {
            return Err(Self::invalid(
                schema,
                "'create' must accept the void state",
            ));
        }

        for (name, transition) in &schema.transitions {
            if let Target::State(state) = &transition.to {
                if !schema.has_state(state) {
                    return Err(Self::invalid(
                        schema,
                        format!("transition '{name}' targets undeclared state '{state}'"),
                    ));
                }
            }
            let from_states: Vec<&String> = match &transition.from {
                FromStates::Any => Vec::new(),
                FromStates::One(state) => vec![state],
                FromStates::Many(states) => states.iter().collect(),
            };
            for state in from_states {
                if !schema.has_state(state) {
                    return Err(Self::invalid(
                        schema,
                        format!("transition '{name}' leaves undeclared state '{state}'"),
                    ));
                }
            }
            self.validate_input_links(schema, name, &transition.input)?;
        }

        self.validate_output_links(schema, &schema.output)
    }

    fn validate_input_links(
        &self,
        schema: &Schema,
        transition: &str,
        input: &InputSchema,
    ) -> Result<(), EngineError> {
        for (name, prop) in &input.props {
            match &prop.input_type {
                InputType::Link { resource } => {
                    if !self.machines.contains_key(resource) {
                        return Err(Self::invalid(
                            schema,
                            format!(
                                "transition '{transition}' input '{name}' links to \
                                 unregistered resource '{resource}'"
                            ),
                        ));
                    }
                }
                InputType::Object(members) => {
                    self.validate_input_links(schema, transition, members)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn validate_output_links(
        &self,
        schema: &Schema,
        output: &OutputSchema,
    ) -> Result<(), EngineError> {
        for (name, prop) in &output.props {
            match prop {
                OutputProp::Link(link) => {
                    if !self.machines.contains_key(&link.resource) {
                        return Err(Self::invalid(
                            schema,
                            format!(
                                "output '{name}' links to unregistered resource '{}'",
                                link.resource
                            ),
                        ));
                    }
                }
                OutputProp::Nested(sub) => {
                    self.validate_output_links(schema, sub)?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
