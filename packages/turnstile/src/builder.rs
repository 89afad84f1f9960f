//! Recursive output construction.
//!
//! The builder turns a raw [`Record`] into an [`Entity`]: the record's
//! output schema evaluated top to bottom. Two passes per level:
//!
//! 1. Leaves, graph links and nested maps. A `None`/null leaf is omitted
//!    rather than serialized as `null`. Single links resolve through the
//!    per-request cache; a dangling single link builds a tombstone
//!    (`{id, deleted: true}`) instead of failing the whole entity.
//! 2. Computed props, which see every sibling built in pass one.
//!
//! Mutual links (a record's many-link whose members link back to it) would
//! recurse forever; the client tracks records currently being built, and a
//! cyclic re-entry builds a shallow projection with leaves only.

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::client::Client;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::schema::{BuildView, Cardinality, GraphLink, OutputProp, OutputSchema, Record, Schema};
use crate::storage;

/// A fully built projection of one record: output values plus the actions
/// currently declared on its machine.
#[derive(Debug)]
pub struct Entity {
    pub id: Uuid,
    pub state: String,
    /// Machine the record belongs to.
    pub machine: String,
    values: Map<String, Value>,
    actions: Vec<String>,
    record: Record,
    /// False for the shallow projection built on a graph cycle.
    deep: bool,
}

impl Entity {
    /// A built output value by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Every transition declared on the machine except `create`.
    pub fn actions(&self) -> &[String] {
        &self.actions
    }

    /// The underlying record snapshot this entity was built from.
    pub fn record(&self) -> &Record {
        &self.record
    }

    /// Shallow projections must not enter the per-request cache.
    pub(crate) fn is_deep(&self) -> bool {
        self.deep
    }

    /// Serialize to the wire shape: lifecycle columns plus built values.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("id".into(), Value::String(self.id.to_string()));
        obj.insert("state".into(), Value::String(self.state.clone()));
        if let Some(t) = self.record.created_at {
            obj.insert("created_at".into(), Value::String(t.to_rfc3339()));
        }
        if let Some(t) = self.record.updated_at {
            obj.insert("updated_at".into(), Value::String(t.to_rfc3339()));
        }
        for (key, value) in &self.values {
            obj.insert(key.clone(), value.clone());
        }
        Value::Object(obj)
    }

    /// Invoke one of this entity's actions on a fresh copy of its record.
    ///
    /// `create` is not an action; it only exists for void records.
    pub async fn act(
        &self,
        engine: &Engine,
        client: &Client,
        transition: &str,
        input: Value,
    ) -> Result<Entity, EngineError> {
        if transition == "create" || !self.actions.iter().any(|a| a == transition) {
            return Err(EngineError::InvalidTransition {
                machine: self.machine.clone(),
                transition: transition.to_string(),
            });
        }
        let mut record = self.record.clone();
        engine
            .run_transition(client, &self.machine, transition, &mut record, input)
            .await
    }
}

/// Build the full entity for a record against its schema.
pub(crate) fn build_entity<'a>(
    engine: &'a Engine,
    client: &'a Client,
    schema: &'a Schema,
    record: &'a Record,
) -> BoxFuture<'a, Result<Entity, EngineError>> {
    Box::pin(async move {
        let deep = client.begin_build(&schema.name, record.id);
        let values = if deep {
            let result = build_level(engine, client, &schema.output, record, true).await;
            client.end_build(&schema.name, record.id);
            result?
        } else {
            build_level(engine, client, &schema.output, record, false).await?
        };
        let actions = schema
            .transitions
            .keys()
            .filter(|name| name.as_str() != "create")
            .cloned()
            .collect();
        Ok(Entity {
            id: record.id,
            state: record.state.clone(),
            machine: schema.name.clone(),
            values,
            actions,
            record: record.clone(),
            deep,
        })
    })
}

fn build_level<'a>(
    engine: &'a Engine,
    client: &'a Client,
    output: &'a OutputSchema,
    record: &'a Record,
    deep: bool,
) -> BoxFuture<'a, Result<Map<String, Value>, EngineError>> {
    Box::pin(async move {
        let mut entity = Map::new();

        for (key, prop) in &output.props {
            match prop {
                OutputProp::Leaf(read) => {
                    if let Some(value) = read(record) {
                        if !value.is_null() {
                            entity.insert(key.clone(), value);
                        }
                    }
                }
                OutputProp::Link(link) => {
                    if deep {
                        if let Some(value) = resolve_link(engine, client, link, record).await? {
                            entity.insert(key.clone(), value);
                        }
                    }
                }
                OutputProp::Nested(sub) => {
                    let nested = build_level(engine, client, sub, record, deep).await?;
                    entity.insert(key.clone(), Value::Object(nested));
                }
                OutputProp::Computed(_) => {}
            }
        }

        if deep {
            for (key, prop) in &output.props {
                if let OutputProp::Computed(compute) = prop {
                    let view = BuildView {
                        entity: &entity,
                        client,
                        engine,
                    };
                    let computed = compute(record, view).await?;
                    if let Some(value) = computed {
                        if !value.is_null() {
                            entity.insert(key.clone(), value);
                        }
                    }
                }
            }
        }

        Ok(entity)
    })
}

async fn resolve_link(
    engine: &Engine,
    client: &Client,
    link: &GraphLink,
    record: &Record,
) -> Result<Option<Value>, EngineError> {
    match link.cardinality {
        Cardinality::Single => {
            let Some(fk) = record.column(&link.foreign_key) else {
                return Ok(None);
            };
            if fk.is_null() {
                return Ok(None);
            }
            let Some(id) = fk.as_str().and_then(|s| Uuid::parse_str(s).ok()) else {
                return Ok(None);
            };
            match engine
                .read_one(client, &link.resource, id, link.tenancy)
                .await
            {
                Ok(entity) => Ok(Some(entity.to_value())),
                // The referent was deleted out from under us; emit a
                // tombstone so the graph stays walkable.
                Err(EngineError::NotFound { .. }) => {
                    Ok(Some(json!({ "id": fk, "deleted": true })))
                }
                Err(other) => Err(other),
            }
        }
        Cardinality::Many => {
            let machine = engine.machine(&link.resource)?;
            let mut records = machine
                .read_group(
                    engine,
                    client,
                    &link.foreign_key,
                    &Value::String(record.id.to_string()),
                    link.tenancy,
                )
                .await?;
            if let Some((column, direction)) = &link.sort {
                sort_records(&mut records, column, *direction);
            }
            let mut items = Vec::with_capacity(records.len());
            for linked in &records {
                let entity = build_entity(engine, client, machine.schema(), linked).await?;
                items.push(entity.to_value());
            }
            Ok(Some(Value::Array(items)))
        }
    }
}

fn sort_records(records: &mut [Record], column: &str, direction: crate::pagination::Direction) {
    records.sort_by(|a, b| {
        let left = a.column(column);
        let right = b.column(column);
        let ord = match (left, right) {
            (Some(l), Some(r)) => storage::compare(&l, &r)
                .map(|s| s.cmp(&0))
                .unwrap_or(std::cmp::Ordering::Equal),
            (Some(_), None) => std::cmp::Ordering::Greater,
            (None, Some(_)) => std::cmp::Ordering::Less,
            (None, None) => std::cmp::Ordering::Equal,
        };
        match direction {
            crate::pagination::Direction::Asc => ord,
            crate::pagination::Direction::Desc => ord.reverse(),
        }
    });
}
