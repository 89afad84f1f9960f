//! Recursive input sanitization and validation.
//!
//! Raw input goes through three phases before a transition body sees it:
//!
//! 1. **Sanitize** (sync): compute the caller's scope from the action stack,
//!    strip reserved-marker keys from public input, and drop every prop the
//!    caller's scope cannot set, recursively through nested objects.
//! 2. **Structural** (sync): presence per requiredness, declared types
//!    (element-wise for lists), then defaults for absent optional props.
//! 3. **Rules** (async): three ordered stages. `Runtime` rules are pure
//!    comparisons, `Database` rules hit local storage, `Service` rules hit
//!    remote services. All cheap failures surface before any IO happens.
//!
//! Link props resolve during the stage matching their target machine's kind.
//! A resolved link injects the referenced entity back into the input under a
//! reserved `__name__` key (`owner_id` injects `__owner__`), so transition
//! bodies read the full entity without a second lookup.

use chrono::{DateTime, NaiveDate};
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::client::Client;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::machine::{Machine, MachineKind};
use crate::schema::{
    Check, InputProp, InputSchema, InputType, Record, Required, RuleStage, Scope, Transition,
    RESERVED_MARKER,
};
use crate::tenancy::TenancyMode;

/// Validated input handed to transition bodies and guards.
pub struct Input {
    values: Map<String, Value>,
    scope: Scope,
}

impl Input {
    /// The scope the input was validated at.
    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(Value::as_str)
    }

    pub fn i64(&self, name: &str) -> Option<i64> {
        self.values.get(name).and_then(Value::as_i64)
    }

    pub fn f64(&self, name: &str) -> Option<f64> {
        self.values.get(name).and_then(Value::as_f64)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.values.get(name).and_then(Value::as_bool)
    }

    /// The entity a link prop resolved to: `linked("owner")` reads the
    /// injected `__owner__` key.
    pub fn linked(&self, name: &str) -> Option<&Value> {
        self.values
            .get(&format!("{RESERVED_MARKER}{name}{RESERVED_MARKER}"))
    }

    /// Top-level props cleared for logging.
    pub(crate) fn loggable_view(&self, schema: &InputSchema) -> Map<String, Value> {
        schema
            .props
            .iter()
            .filter(|(name, prop)| prop.loggable && self.values.contains_key(*name))
            .map(|(name, _)| (name.clone(), self.values[name].clone()))
            .collect()
    }
}

fn is_reserved(key: &str) -> bool {
    key.len() > 2 * RESERVED_MARKER.len()
        && key.starts_with(RESERVED_MARKER)
        && key.ends_with(RESERVED_MARKER)
}

/// The reserved key a link prop's resolved entity is injected under.
fn link_marker(name: &str) -> String {
    let base = name
        .strip_suffix("_ids")
        .or_else(|| name.strip_suffix("_id"))
        .unwrap_or(name);
    format!("{RESERVED_MARKER}{base}{RESERVED_MARKER}")
}

fn value_is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn is_empty(value: Option<&Value>) -> bool {
    value.map(value_is_empty).unwrap_or(true)
}

// =============================================================================
// Sanitize
// =============================================================================

/// Compute the caller's scope and strip everything it may not set.
pub(crate) fn sanitize(
    client: &Client,
    machine: &str,
    schema: &InputSchema,
    raw: Value,
) -> (Map<String, Value>, Scope) {
    // Scope is inferred before this transition's own frame is pushed.
    let scope = client.scope_for(machine);
    let mut values = match raw {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    strip(schema, &mut values, scope);
    (values, scope)
}

fn strip(schema: &InputSchema, values: &mut Map<String, Value>, scope: Scope) {
    values.retain(|key, _| {
        if is_reserved(key) {
            // Reserved keys only survive internal (nested) calls.
            return scope > Scope::Public;
        }
        match schema.get(key) {
            Some(prop) => scope.allows(prop.scope),
            None => false,
        }
    });
    for (key, value) in values.iter_mut() {
        if let Some(prop) = schema.get(key) {
            if let InputType::Object(members) = &prop.input_type {
                if prop.list {
                    if let Some(items) = value.as_array_mut() {
                        for item in items {
                            if let Some(obj) = item.as_object_mut() {
                                strip(members, obj, scope);
                            }
                        }
                    }
                } else if let Some(obj) = value.as_object_mut() {
                    strip(members, obj, scope);
                }
            }
        }
    }
}

// =============================================================================
// Structural pass
// =============================================================================

fn required_now(prop: &InputProp, scope: Scope, siblings: &Map<String, Value>) -> bool {
    match &prop.required {
        Required::No => false,
        Required::Yes => true,
        Required::WhenParam { param, value } => siblings.get(param) == Some(value),
        Required::WhenScope(s) => scope == *s,
    }
}

fn type_message(input_type: &InputType) -> String {
    match input_type {
        InputType::Bool => "must be a boolean".to_string(),
        InputType::Int => "must be an integer".to_string(),
        InputType::Float => "must be a number".to_string(),
        InputType::Text => "must be text".to_string(),
        InputType::Date => "must be a YYYY-MM-DD date".to_string(),
        InputType::DateTime => "must be an RFC 3339 timestamp".to_string(),
        InputType::Enum(options) => format!("must be one of: {}", options.join(", ")),
        InputType::Object(_) => "must be an object".to_string(),
        InputType::Link { .. } => "must be an id".to_string(),
        InputType::File => "must be an upload payload".to_string(),
    }
}

fn element_ok(input_type: &InputType, value: &Value) -> bool {
    match input_type {
        InputType::Bool => value.is_boolean(),
        InputType::Int => value.is_i64() || value.is_u64(),
        InputType::Float => value.is_number(),
        InputType::Text => value.is_string(),
        InputType::Date => value
            .as_str()
            .map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok())
            .unwrap_or(false),
        InputType::DateTime => value
            .as_str()
            .map(|s| DateTime::parse_from_rfc3339(s).is_ok())
            .unwrap_or(false),
        InputType::Enum(options) => value
            .as_str()
            .map(|s| options.iter().any(|o| o == s))
            .unwrap_or(false),
        InputType::Object(_) => value.is_object(),
        InputType::Link { .. } => value
            .as_str()
            .map(|s| Uuid::parse_str(s).is_ok())
            .unwrap_or(false),
        InputType::File => value.is_object() || value.is_string(),
    }
}

fn check_type(machine: &str, prop: &InputProp, value: &Value) -> Result<(), EngineError> {
    if prop.list {
        let Some(items) = value.as_array() else {
            return Err(EngineError::validation(
                machine,
                &prop.alias,
                "must be a list",
            ));
        };
        for item in items {
            if !element_ok(&prop.input_type, item) {
                return Err(EngineError::validation(
                    machine,
                    &prop.alias,
                    type_message(&prop.input_type),
                ));
            }
        }
        return Ok(());
    }
    if !element_ok(&prop.input_type, value) {
        return Err(EngineError::validation(
            machine,
            &prop.alias,
            type_message(&prop.input_type),
        ));
    }
    Ok(())
}

/// Presence, types, defaults; recursive through nested objects.
fn structural(
    machine: &str,
    schema: &InputSchema,
    values: &mut Map<String, Value>,
    scope: Scope,
) -> Result<(), EngineError> {
    for (name, prop) in &schema.props {
        if is_empty(values.get(name)) {
            if required_now(prop, scope, values) {
                return Err(EngineError::validation(machine, &prop.alias, "is required"));
            }
            continue;
        }
        check_type(machine, prop, &values[name])?;
    }

    for (name, prop) in &schema.props {
        if is_empty(values.get(name)) {
            if let Some(default) = &prop.default {
                values.insert(name.clone(), default.clone());
            }
        }
    }

    for (name, prop) in &schema.props {
        if let InputType::Object(members) = &prop.input_type {
            if let Some(value) = values.get_mut(name) {
                if prop.list {
                    if let Some(items) = value.as_array_mut() {
                        for item in items {
                            if let Some(obj) = item.as_object_mut() {
                                structural(machine, members, obj, scope)?;
                            }
                        }
                    }
                } else if let Some(obj) = value.as_object_mut() {
                    structural(machine, members, obj, scope)?;
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Rule stages
// =============================================================================

fn number(value: &Value) -> Option<f64> {
    value.as_f64()
}

#[allow(clippy::too_many_arguments)]
fn rules_pass<'a>(
    engine: &'a Engine,
    client: &'a Client,
    machine: &'a dyn Machine,
    schema: &'a InputSchema,
    values: &'a mut Map<String, Value>,
    record: &'a Record,
    stage: RuleStage,
) -> BoxFuture<'a, Result<(), EngineError>> {
    Box::pin(async move {
        let machine_name = machine.name().to_string();
        for (name, prop) in &schema.props {
            let Some(value) = values.get(name).cloned() else {
                continue;
            };
            if value_is_empty(&value) {
                continue;
            }

            for rule in &prop.rules {
                if rule.check.stage() != stage {
                    continue;
                }
                let ok = match &rule.check {
                    Check::GreaterThan(bound) => {
                        number(&value).map(|n| n > *bound).unwrap_or(false)
                    }
                    Check::LessThan(bound) => number(&value).map(|n| n < *bound).unwrap_or(false),
                    Check::Between(low, high) => number(&value)
                        .map(|n| n >= *low && n <= *high)
                        .unwrap_or(false),
                    Check::Unique => {
                        !machine
                            .exists_where(engine, client, name, &value, Some(record.id))
                            .await?
                    }
                    Check::Custom { run, .. } => run(&value, client, engine).await?,
                };
                if !ok {
                    return Err(EngineError::validation(
                        &machine_name,
                        &prop.alias,
                        &rule.message,
                    ));
                }
            }

            if let InputType::Link { resource } = &prop.input_type {
                let target = engine.machine(resource)?;
                let resolve_stage = match target.kind() {
                    MachineKind::Resource => RuleStage::Database,
                    MachineKind::Service => RuleStage::Service,
                };
                if resolve_stage == stage {
                    let resolved =
                        resolve_link(engine, client, &machine_name, prop, resource, &value).await?;
                    values.insert(link_marker(name), resolved);
                }
            }

            if let InputType::Object(members) = &prop.input_type {
                if let Some(value) = values.get_mut(name) {
                    if prop.list {
                        if let Some(items) = value.as_array_mut() {
                            for item in items {
                                if let Some(obj) = item.as_object_mut() {
                                    rules_pass(engine, client, machine, members, obj, record, stage)
                                        .await?;
                                }
                            }
                        }
                    } else if let Some(obj) = value.as_object_mut() {
                        rules_pass(engine, client, machine, members, obj, record, stage).await?;
                    }
                }
            }
        }
        Ok(())
    })
}

/// Resolve a link prop to the referenced entity (or entities), validating
/// every id points at a live record the caller can see.
async fn resolve_link(
    engine: &Engine,
    client: &Client,
    machine_name: &str,
    prop: &InputProp,
    resource: &str,
    value: &Value,
) -> Result<Value, EngineError> {
    let missing =
        || EngineError::validation(machine_name, &prop.alias, format!("refers to a missing {resource}"));

    if prop.list {
        let ids = value.as_array().cloned().unwrap_or_default();
        let mut entities = Vec::with_capacity(ids.len());
        for id_value in &ids {
            let Some(id) = id_value.as_str().and_then(|s| Uuid::parse_str(s).ok()) else {
                return Err(EngineError::validation(
                    machine_name,
                    &prop.alias,
                    "must be an id",
                ));
            };
            match engine
                .read_one(client, resource, id, TenancyMode::Enforced)
                .await
            {
                Ok(entity) => entities.push(entity.to_value()),
                Err(EngineError::NotFound { .. }) => {}
                Err(other) => return Err(other),
            }
        }
        // Every supplied id must have resolved.
        if entities.len() != ids.len() {
            return Err(missing());
        }
        Ok(Value::Array(entities))
    } else {
        let Some(id) = value.as_str().and_then(|s| Uuid::parse_str(s).ok()) else {
            return Err(EngineError::validation(
                machine_name,
                &prop.alias,
                "must be an id",
            ));
        };
        match engine
            .read_one(client, resource, id, TenancyMode::Enforced)
            .await
        {
            Ok(entity) => Ok(entity.to_value()),
            Err(EngineError::NotFound { .. }) => Err(missing()),
            Err(other) => Err(other),
        }
    }
}

// =============================================================================
// Entry point
// =============================================================================

/// Run the structural pass and all three rule stages over sanitized input.
pub(crate) async fn validate(
    engine: &Engine,
    client: &Client,
    machine: &dyn Machine,
    transition: &Transition,
    record: &Record,
    mut values: Map<String, Value>,
    scope: Scope,
) -> Result<Input, EngineError> {
    structural(machine.name(), &transition.input, &mut values, scope)?;
    for stage in [RuleStage::Runtime, RuleStage::Database, RuleStage::Service] {
        rules_pass(engine, client, machine, &transition.input, &mut values, record, stage)
            .await?;
    }
    Ok(Input { values, scope })
}
