//! Declarative resource schemas: states, transitions, guards, hooks, and the
//! input/output trees.
//!
//! A [`Schema`] is pure description. It owns no IO and holds no live
//! references to machines; the validator, builder and executor consume it as
//! an immutable view. User-supplied behavior (transition bodies, guards,
//! hooks, computed output props) is carried as boxed async closures.
//!
//! # Key Properties
//!
//! - **`void` is universal**: every record starts in the implicit `void`
//!   state, and every schema must declare a `create` transition out of it.
//! - **`deleted` is convention**: soft deletion is a state name plus stamped
//!   `deleted_at/by` columns, not a structural feature.
//! - **Closed variants**: output props are a tagged enum
//!   (`Leaf | Link | Nested | Computed`) matched exhaustively in the builder.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::client::Client;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::executor::TransitionArgs;
use crate::pagination::Direction;
use crate::remote::Verb;
use crate::tenancy::TenancyMode;
use crate::validator::Input;

/// The universal pre-creation state.
pub const VOID_STATE: &str = "void";

/// The conventional soft-delete state.
pub const DELETED_STATE: &str = "deleted";

/// Marker wrapped around internal-use input keys (`__owner__`).
///
/// Keys carrying this marker are stripped from public input before
/// validation and are used to inject resolved link entities.
pub const RESERVED_MARKER: &str = "__";

// =============================================================================
// Scope
// =============================================================================

/// Visibility tier of an input field.
///
/// Ordered: `Public < Protected < Private`. A caller operating at scope `s`
/// may set every field whose declared scope is `<= s`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Scope {
    /// External callers (empty action stack).
    Public,
    /// A transition invoked by a *different* machine.
    Protected,
    /// A machine invoking its own transition recursively.
    Private,
}

impl Scope {
    /// Whether a caller at this scope may set a field declared at `field`.
    pub fn allows(self, field: Scope) -> bool {
        field <= self
    }
}

// =============================================================================
// Record
// =============================================================================

/// The stored representation of a resource instance.
///
/// Lifecycle columns (`id`, `state`, `created_*`, `updated_*`, `deleted_*`)
/// are first-class; everything else lives in the dynamic `fields` map, which
/// mirrors whatever columns the storage collaborator declares.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    pub state: String,
    pub created_at: Option<DateTime<Utc>>,
    pub created_by: Option<Uuid>,
    pub updated_at: Option<DateTime<Utc>>,
    pub updated_by: Option<Uuid>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<Uuid>,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Record {
    /// A fresh record in the `void` state, ready for a `create` transition.
    pub fn new_void() -> Self {
        Record {
            id: Uuid::new_v4(),
            state: VOID_STATE.to_string(),
            created_at: None,
            created_by: None,
            updated_at: None,
            updated_by: None,
            deleted_at: None,
            deleted_by: None,
            fields: Map::new(),
        }
    }

    /// Read a dynamic field.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Write a dynamic field.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    /// Read any column by name, lifecycle columns included.
    ///
    /// Lifecycle timestamps render as RFC 3339 strings and ids as their
    /// canonical string form, so column values compare cleanly against
    /// filter operands.
    pub fn column(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::String(self.id.to_string())),
            "state" => Some(Value::String(self.state.clone())),
            "created_at" => self.created_at.map(|t| Value::String(t.to_rfc3339())),
            "created_by" => self.created_by.map(|u| Value::String(u.to_string())),
            "updated_at" => self.updated_at.map(|t| Value::String(t.to_rfc3339())),
            "updated_by" => self.updated_by.map(|u| Value::String(u.to_string())),
            "deleted_at" => self.deleted_at.map(|t| Value::String(t.to_rfc3339())),
            "deleted_by" => self.deleted_by.map(|u| Value::String(u.to_string())),
            _ => self.fields.get(name).cloned(),
        }
    }

    /// Typed accessor: string field.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Typed accessor: integer field.
    pub fn i64_field(&self, name: &str) -> Option<i64> {
        self.fields.get(name).and_then(Value::as_i64)
    }

    /// Typed accessor: boolean field.
    pub fn bool_field(&self, name: &str) -> Option<bool> {
        self.fields.get(name).and_then(Value::as_bool)
    }

    /// Reconstruct a record from a remote service response body.
    ///
    /// Lifecycle columns (`id`, `state`, the `*_at`/`*_by` stamps) are
    /// lifted out when present; everything else lands in `fields`. A
    /// missing or unparsable id gets a fresh one.
    pub fn from_value(value: &Value) -> Self {
        let mut record = Record::new_void();
        if let Some(obj) = value.as_object() {
            for (key, val) in obj {
                match key.as_str() {
                    "id" => {
                        if let Some(id) = val.as_str().and_then(|s| Uuid::parse_str(s).ok()) {
                            record.id = id;
                        }
                    }
                    "state" => {
                        if let Some(state) = val.as_str() {
                            record.state = state.to_string();
                        }
                    }
                    "created_at" => {
                        record.created_at = parse_timestamp(val);
                    }
                    "created_by" => {
                        record.created_by = parse_principal(val);
                    }
                    "updated_at" => {
                        record.updated_at = parse_timestamp(val);
                    }
                    "updated_by" => {
                        record.updated_by = parse_principal(val);
                    }
                    "deleted_at" => {
                        record.deleted_at = parse_timestamp(val);
                    }
                    "deleted_by" => {
                        record.deleted_by = parse_principal(val);
                    }
                    _ => {
                        record.fields.insert(key.clone(), val.clone());
                    }
                }
            }
        }
        record
    }

    /// Serialize the record to a flat JSON object, lifecycle columns inline.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("id".into(), Value::String(self.id.to_string()));
        obj.insert("state".into(), Value::String(self.state.clone()));
        if let Some(t) = self.created_at {
            obj.insert("created_at".into(), Value::String(t.to_rfc3339()));
        }
        if let Some(u) = self.created_by {
            obj.insert("created_by".into(), Value::String(u.to_string()));
        }
        if let Some(t) = self.updated_at {
            obj.insert("updated_at".into(), Value::String(t.to_rfc3339()));
        }
        if let Some(u) = self.updated_by {
            obj.insert("updated_by".into(), Value::String(u.to_string()));
        }
        if let Some(t) = self.deleted_at {
            obj.insert("deleted_at".into(), Value::String(t.to_rfc3339()));
        }
        if let Some(u) = self.deleted_by {
            obj.insert("deleted_by".into(), Value::String(u.to_string()));
        }
        for (key, val) in &self.fields {
            obj.insert(key.clone(), val.clone());
        }
        Value::Object(obj)
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn parse_principal(value: &Value) -> Option<Uuid> {
    value.as_str().and_then(|s| Uuid::parse_str(s).ok())
}

// =============================================================================
// Transitions
// =============================================================================

/// The set of states a transition accepts as its origin.
#[derive(Debug, Clone)]
pub enum FromStates {
    /// Wildcard: any state, `void` included.
    Any,
    One(String),
    Many(Vec<String>),
}

impl FromStates {
    pub fn allows(&self, state: &str) -> bool {
        match self {
            FromStates::Any => true,
            FromStates::One(s) => s == state,
            FromStates::Many(set) => set.iter().any(|s| s == state),
        }
    }
}

/// The state a transition lands in.
#[derive(Debug, Clone)]
pub enum Target {
    State(String),
    /// Self-loop: no state change. Used by nested/secondary actions.
    Current,
}

/// Async transition body. Receives mutable record access plus the execution
/// context; see [`TransitionArgs`].
pub type TransitionBody =
    Arc<dyn for<'a> Fn(TransitionArgs<'a>) -> BoxFuture<'a, Result<(), EngineError>> + Send + Sync>;

/// A named operation moving a record between declared states.
#[derive(Clone)]
pub struct Transition {
    /// Display name used in validation messages and logs.
    pub alias: String,
    pub from: FromStates,
    pub to: Target,
    pub input: InputSchema,
    pub guards: Vec<Guard>,
    /// Optional body, invoked after guards pass and before persistence.
    pub body: Option<TransitionBody>,
    /// Optional post-persist body; the record is saved again afterwards.
    pub after: Option<TransitionBody>,
    /// HTTP verb used by service machines for non-create transitions.
    pub verb: Option<Verb>,
}

impl Transition {
    pub fn new(alias: impl Into<String>) -> Self {
        Transition {
            alias: alias.into(),
            from: FromStates::One(VOID_STATE.to_string()),
            to: Target::Current,
            input: InputSchema::default(),
            guards: Vec::new(),
            body: None,
            after: None,
            verb: None,
        }
    }

    pub fn from(mut self, state: impl Into<String>) -> Self {
        self.from = FromStates::One(state.into());
        self
    }

    pub fn from_any_of(mut self, states: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.from = FromStates::Many(states.into_iter().map(Into::into).collect());
        self
    }

    pub fn from_wildcard(mut self) -> Self {
        self.from = FromStates::Any;
        self
    }

    pub fn to(mut self, state: impl Into<String>) -> Self {
        self.to = Target::State(state.into());
        self
    }

    pub fn to_current(mut self) -> Self {
        self.to = Target::Current;
        self
    }

    pub fn with_input(mut self, input: InputSchema) -> Self {
        self.input = input;
        self
    }

    pub fn guard(mut self, guard: Guard) -> Self {
        self.guards.push(guard);
        self
    }

    /// Attach a full async body. Write the closure as a fn item returning a
    /// [`BoxFuture`] when inference struggles with the higher-ranked bound.
    pub fn body(
        mut self,
        body: impl for<'a> Fn(TransitionArgs<'a>) -> BoxFuture<'a, Result<(), EngineError>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.body = Some(Arc::new(body));
        self
    }

    /// Attach a synchronous record mutation as the body.
    pub fn mutate(
        mut self,
        f: impl Fn(&mut Record, &Input, &Client) -> Result<(), EngineError> + Send + Sync + 'static,
    ) -> Self {
        let f = Arc::new(f);
        self.body = Some(Arc::new(move |args: TransitionArgs<'_>| {
            let f = f.clone();
            Box::pin(async move { f(args.record, args.input, args.client) })
        }));
        self
    }

    /// Attach a post-persist body.
    pub fn after(
        mut self,
        body: impl for<'a> Fn(TransitionArgs<'a>) -> BoxFuture<'a, Result<(), EngineError>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.after = Some(Arc::new(body));
        self
    }

    /// Attach a synchronous post-persist mutation.
    pub fn after_mutate(
        mut self,
        f: impl Fn(&mut Record, &Input, &Client) -> Result<(), EngineError> + Send + Sync + 'static,
    ) -> Self {
        let f = Arc::new(f);
        self.after = Some(Arc::new(move |args: TransitionArgs<'_>| {
            let f = f.clone();
            Box::pin(async move { f(args.record, args.input, args.client) })
        }));
        self
    }

    /// Declare the HTTP verb a service machine uses for this transition.
    pub fn verb(mut self, verb: Verb) -> Self {
        self.verb = Some(verb);
        self
    }

    /// Whether this transition stays in the current state.
    pub fn is_self_loop(&self) -> bool {
        matches!(self.to, Target::Current)
    }
}

// =============================================================================
// Guards
// =============================================================================

/// Async guard predicate.
pub type GuardFn = Arc<
    dyn for<'a> Fn(&'a Record, &'a Client, &'a Engine) -> BoxFuture<'a, Result<bool, EngineError>>
        + Send
        + Sync,
>;

/// Produces the failure message for a guard, given the record it rejected.
pub type GuardMsg = Arc<dyn Fn(&Record) -> String + Send + Sync>;

/// A precondition evaluated before a transition body runs.
///
/// Guards run in declaration order; the first failure aborts the transition
/// with the guard's message.
#[derive(Clone)]
pub struct Guard {
    pub check: GuardFn,
    pub message: GuardMsg,
}

impl Guard {
    /// Build a guard from an async predicate and a static message.
    pub fn new(
        check: impl for<'a> Fn(
                &'a Record,
                &'a Client,
                &'a Engine,
            ) -> BoxFuture<'a, Result<bool, EngineError>>
            + Send
            + Sync
            + 'static,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        Guard {
            check: Arc::new(check),
            message: Arc::new(move |_| message.clone()),
        }
    }

    /// Build a guard from a pure synchronous predicate.
    pub fn sync(
        pred: impl Fn(&Record, &Client) -> bool + Send + Sync + 'static,
        message: impl Into<String>,
    ) -> Self {
        let pred = Arc::new(pred);
        let message = message.into();
        Guard {
            check: Arc::new(move |record, client, _engine| {
                let ok = pred(record, client);
                Box::pin(std::future::ready(Ok(ok)))
            }),
            message: Arc::new(move |_| message.clone()),
        }
    }

    /// Override the message with one derived from the rejected record.
    pub fn message_fn(mut self, f: impl Fn(&Record) -> String + Send + Sync + 'static) -> Self {
        self.message = Arc::new(f);
        self
    }
}

// =============================================================================
// Hooks
// =============================================================================

/// When a hook fires relative to its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOn {
    Enter,
    Exit,
}

/// Async hook callback.
pub type HookFn = Arc<
    dyn for<'a> Fn(&'a Record, &'a Client, &'a Engine) -> BoxFuture<'a, Result<(), EngineError>>
        + Send
        + Sync,
>;

/// A cross-cutting callback fired when any transition enters or exits the
/// hook's state, independent of which transition caused it.
///
/// Hooks are suppressed for self-loop transitions nested inside another
/// action, to prevent duplicate firing on recursive internal calls.
#[derive(Clone)]
pub struct Hook {
    pub on: HookOn,
    pub state: String,
    pub run: HookFn,
}

impl Hook {
    pub fn new(
        on: HookOn,
        state: impl Into<String>,
        run: impl for<'a> Fn(
                &'a Record,
                &'a Client,
                &'a Engine,
            ) -> BoxFuture<'a, Result<(), EngineError>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Hook {
            on,
            state: state.into(),
            run: Arc::new(run),
        }
    }

    /// A synchronous observer hook (counters, notifications).
    pub fn observe(
        on: HookOn,
        state: impl Into<String>,
        f: impl Fn(&Record) + Send + Sync + 'static,
    ) -> Self {
        let f = Arc::new(f);
        Hook {
            on,
            state: state.into(),
            run: Arc::new(move |record, _client, _engine| {
                f(record);
                Box::pin(std::future::ready(Ok(())))
            }),
        }
    }
}

// =============================================================================
// Input schema
// =============================================================================

/// Requiredness of an input prop: plain, parameter-conditional, or
/// scope-conditional.
#[derive(Debug, Clone)]
pub enum Required {
    No,
    Yes,
    /// Required iff the sibling `param` equals `value` in the same input.
    WhenParam { param: String, value: Value },
    /// Required iff the caller's computed scope equals the given scope.
    WhenScope(Scope),
}

/// Evaluation stage of a validation rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleStage {
    /// Pure comparisons, no IO.
    Runtime,
    /// Requires a lookup against local storage.
    Database,
    /// Requires a lookup against a remote service.
    Service,
}

/// Custom rule predicate: receives the candidate value.
pub type CustomRule = Arc<
    dyn for<'a> Fn(&'a Value, &'a Client, &'a Engine) -> BoxFuture<'a, Result<bool, EngineError>>
        + Send
        + Sync,
>;

/// The closed set of rule checks.
#[derive(Clone)]
pub enum Check {
    GreaterThan(f64),
    LessThan(f64),
    Between(f64, f64),
    /// No other live record may hold the same value in this column.
    Unique,
    Custom { stage: RuleStage, run: CustomRule },
}

impl Check {
    pub fn stage(&self) -> RuleStage {
        match self {
            Check::GreaterThan(_) | Check::LessThan(_) | Check::Between(_, _) => RuleStage::Runtime,
            Check::Unique => RuleStage::Database,
            Check::Custom { stage, .. } => *stage,
        }
    }
}

/// A validation rule: a check plus its failure message.
#[derive(Clone)]
pub struct Rule {
    pub check: Check,
    pub message: String,
}

impl Rule {
    pub fn greater_than(bound: f64, message: impl Into<String>) -> Self {
        Rule {
            check: Check::GreaterThan(bound),
            message: message.into(),
        }
    }

    pub fn less_than(bound: f64, message: impl Into<String>) -> Self {
        Rule {
            check: Check::LessThan(bound),
            message: message.into(),
        }
    }

    pub fn between(low: f64, high: f64, message: impl Into<String>) -> Self {
        Rule {
            check: Check::Between(low, high),
            message: message.into(),
        }
    }

    pub fn unique(message: impl Into<String>) -> Self {
        Rule {
            check: Check::Unique,
            message: message.into(),
        }
    }

    pub fn custom(
        stage: RuleStage,
        run: impl for<'a> Fn(
                &'a Value,
                &'a Client,
                &'a Engine,
            ) -> BoxFuture<'a, Result<bool, EngineError>>
            + Send
            + Sync
            + 'static,
        message: impl Into<String>,
    ) -> Self {
        Rule {
            check: Check::Custom {
                stage,
                run: Arc::new(run),
            },
            message: message.into(),
        }
    }
}

/// Declared type of an input prop.
#[derive(Clone)]
pub enum InputType {
    Bool,
    Int,
    Float,
    Text,
    /// `YYYY-MM-DD`.
    Date,
    /// RFC 3339.
    DateTime,
    Enum(Vec<String>),
    /// Nested object with its own member schema.
    Object(InputSchema),
    /// Id reference to another registered resource. Resolution injects the
    /// referenced entity under a derived `__name__` key.
    Link { resource: String },
    /// Opaque upload payload; structure is the storage layer's concern.
    File,
}

/// A single node of the recursive input tree.
#[derive(Clone)]
pub struct InputProp {
    /// Display alias used in validation errors.
    pub alias: String,
    pub input_type: InputType,
    /// Array-typed: the declared type applies per element.
    pub list: bool,
    pub required: Required,
    pub default: Option<Value>,
    pub scope: Scope,
    pub rules: Vec<Rule>,
    /// Whether this prop may appear in the per-transition log entry.
    pub loggable: bool,
}

impl InputProp {
    pub fn new(alias: impl Into<String>, input_type: InputType) -> Self {
        InputProp {
            alias: alias.into(),
            input_type,
            list: false,
            required: Required::No,
            default: None,
            scope: Scope::Public,
            rules: Vec::new(),
            loggable: false,
        }
    }

    pub fn text(alias: impl Into<String>) -> Self {
        InputProp::new(alias, InputType::Text)
    }

    pub fn int(alias: impl Into<String>) -> Self {
        InputProp::new(alias, InputType::Int)
    }

    pub fn float(alias: impl Into<String>) -> Self {
        InputProp::new(alias, InputType::Float)
    }

    pub fn boolean(alias: impl Into<String>) -> Self {
        InputProp::new(alias, InputType::Bool)
    }

    pub fn link(alias: impl Into<String>, resource: impl Into<String>) -> Self {
        InputProp::new(
            alias,
            InputType::Link {
                resource: resource.into(),
            },
        )
    }

    pub fn object(alias: impl Into<String>, members: InputSchema) -> Self {
        InputProp::new(alias, InputType::Object(members))
    }

    pub fn list(mut self) -> Self {
        self.list = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = Required::Yes;
        self
    }

    pub fn required_when(mut self, param: impl Into<String>, value: Value) -> Self {
        self.required = Required::WhenParam {
            param: param.into(),
            value,
        };
        self
    }

    pub fn required_at(mut self, scope: Scope) -> Self {
        self.required = Required::WhenScope(scope);
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn loggable(mut self) -> Self {
        self.loggable = true;
        self
    }
}

/// Recursive input schema: prop name to prop node.
#[derive(Clone, Default)]
pub struct InputSchema {
    pub props: BTreeMap<String, InputProp>,
}

impl InputSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prop(mut self, name: impl Into<String>, prop: InputProp) -> Self {
        self.props.insert(name.into(), prop);
        self
    }

    pub fn get(&self, name: &str) -> Option<&InputProp> {
        self.props.get(name)
    }
}

// =============================================================================
// Output schema
// =============================================================================

/// Leaf accessor: reads a value off the record. `None` results are omitted
/// from the built entity.
pub type LeafFn = Arc<dyn Fn(&Record) -> Option<Value> + Send + Sync>;

/// View handed to computed props in the builder's second pass: sibling
/// values already built, plus the execution context.
pub struct BuildView<'a> {
    pub entity: &'a Map<String, Value>,
    pub client: &'a Client,
    pub engine: &'a Engine,
}

/// Computed prop: evaluated after all declared props, so it can read
/// sibling values through the [`BuildView`].
pub type ComputedFn = Arc<
    dyn for<'a> Fn(&'a Record, BuildView<'a>) -> BoxFuture<'a, Result<Option<Value>, EngineError>>
        + Send
        + Sync,
>;

/// Cardinality of a graph link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// This record holds a foreign key to one linked record.
    Single,
    /// Linked records hold a foreign key back to this record's id.
    Many,
}

/// A declared relation from this resource's output to another resource,
/// resolved at build time.
#[derive(Clone)]
pub struct GraphLink {
    pub resource: String,
    pub foreign_key: String,
    pub cardinality: Cardinality,
    pub tenancy: TenancyMode,
    /// Optional sort applied to `Many` results.
    pub sort: Option<(String, Direction)>,
}

/// The closed set of output node kinds.
#[derive(Clone)]
pub enum OutputProp {
    Leaf(LeafFn),
    Link(GraphLink),
    Nested(OutputSchema),
    Computed(ComputedFn),
}

impl OutputProp {
    /// A leaf that copies the named record field verbatim.
    pub fn field(name: impl Into<String>) -> Self {
        let name = name.into();
        OutputProp::Leaf(Arc::new(move |record: &Record| record.get(&name).cloned()))
    }

    /// A leaf with a custom accessor.
    pub fn leaf(f: impl Fn(&Record) -> Option<Value> + Send + Sync + 'static) -> Self {
        OutputProp::Leaf(Arc::new(f))
    }

    /// A single-cardinality link through this record's foreign key.
    pub fn link_one(resource: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        OutputProp::Link(GraphLink {
            resource: resource.into(),
            foreign_key: foreign_key.into(),
            cardinality: Cardinality::Single,
            tenancy: TenancyMode::Enforced,
            sort: None,
        })
    }

    /// A many-cardinality link through the target's foreign key back to us.
    pub fn link_many(resource: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        OutputProp::Link(GraphLink {
            resource: resource.into(),
            foreign_key: foreign_key.into(),
            cardinality: Cardinality::Many,
            tenancy: TenancyMode::Enforced,
            sort: None,
        })
    }

    /// A computed prop, evaluated in the builder's second pass.
    pub fn computed(
        f: impl for<'a> Fn(
                &'a Record,
                BuildView<'a>,
            ) -> BoxFuture<'a, Result<Option<Value>, EngineError>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        OutputProp::Computed(Arc::new(f))
    }
}

/// Recursive output schema: key to output node.
#[derive(Clone, Default)]
pub struct OutputSchema {
    pub props: BTreeMap<String, OutputProp>,
}

impl OutputSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prop(mut self, name: impl Into<String>, prop: OutputProp) -> Self {
        self.props.insert(name.into(), prop);
        self
    }

    pub fn get(&self, name: &str) -> Option<&OutputProp> {
        self.props.get(name)
    }
}

// =============================================================================
// Schema
// =============================================================================

/// The immutable definition of a resource.
#[derive(Clone)]
pub struct Schema {
    /// Machine name: cache keys, error codes and link targets use this.
    pub name: String,
    /// Display name.
    pub alias: String,
    /// Storage record type (table) this resource persists into.
    pub table: String,
    /// Declared states, name to label. `void` is implicit.
    pub states: BTreeMap<String, String>,
    pub transitions: BTreeMap<String, Transition>,
    pub hooks: Vec<Hook>,
    pub output: OutputSchema,
    /// Remote base path; service machines only.
    pub path: Option<String>,
}

impl Schema {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Schema {
            alias: name.clone(),
            table: format!("{name}s"),
            name,
            states: BTreeMap::new(),
            transitions: BTreeMap::new(),
            hooks: Vec::new(),
            output: OutputSchema::default(),
            path: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_state(mut self, name: impl Into<String>, label: impl Into<String>) -> Self {
        self.states.insert(name.into(), label.into());
        self
    }

    pub fn with_transition(mut self, name: impl Into<String>, transition: Transition) -> Self {
        self.transitions.insert(name.into(), transition);
        self
    }

    pub fn with_hook(mut self, hook: Hook) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_output(mut self, output: OutputSchema) -> Self {
        self.output = output;
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Look up a declared transition.
    pub fn transition(&self, name: &str) -> Option<&Transition> {
        self.transitions.get(name)
    }

    /// Whether `state` is declared (or one of the implicit conventions).
    pub fn has_state(&self, state: &str) -> bool {
        state == VOID_STATE || state == DELETED_STATE || self.states.contains_key(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_ordering() {
        assert!(Scope::Private.allows(Scope::Public));
        assert!(Scope::Private.allows(Scope::Private));
        assert!(Scope::Protected.allows(Scope::Public));
        assert!(!Scope::Protected.allows(Scope::Private));
        assert!(!Scope::Public.allows(Scope::Protected));
    }

    #[test]
    fn test_record_starts_void() {
        let record = Record::new_void();
        assert_eq!(record.state, VOID_STATE);
        assert!(record.created_at.is_none());
        assert!(record.deleted_at.is_none());
    }

    #[test]
    fn test_record_column_covers_lifecycle() {
        let mut record = Record::new_void();
        record.set("name", Value::String("A".into()));
        assert_eq!(
            record.column("id"),
            Some(Value::String(record.id.to_string()))
        );
        assert_eq!(record.column("state"), Some(Value::String("void".into())));
        assert_eq!(record.column("name"), Some(Value::String("A".into())));
        assert_eq!(record.column("created_at"), None);
        assert_eq!(record.column("missing"), None);
    }

    #[test]
    fn test_record_value_round_trip() {
        let mut record = Record::new_void();
        record.state = "created".into();
        record.set("name", Value::String("A".into()));
        let value = record.to_value();
        let back = Record::from_value(&value);
        assert_eq!(back.id, record.id);
        assert_eq!(back.state, "created");
        assert_eq!(back.str_field("name"), Some("A"));
    }

    #[test]
    fn test_from_states_matching() {
        assert!(FromStates::Any.allows("anything"));
        assert!(FromStates::One("created".into()).allows("created"));
        assert!(!FromStates::One("created".into()).allows("draft"));
        let many = FromStates::Many(vec!["a".into(), "b".into()]);
        assert!(many.allows("b"));
        assert!(!many.allows("c"));
    }

    #[test]
    fn test_rule_stages() {
        assert_eq!(Rule::greater_than(0.0, "m").check.stage(), RuleStage::Runtime);
        assert_eq!(Rule::between(1.0, 2.0, "m").check.stage(), RuleStage::Runtime);
        assert_eq!(Rule::unique("m").check.stage(), RuleStage::Database);
    }

    #[test]
    fn test_schema_builder() {
        let schema = Schema::new("order")
            .with_alias("Order")
            .with_state("created", "Created")
            .with_transition("create", Transition::new("Create").to("created"));
        assert_eq!(schema.table, "orders");
        assert!(schema.has_state("void"));
        assert!(schema.has_state("created"));
        assert!(schema.has_state("deleted"));
        assert!(!schema.has_state("archived"));
        assert!(schema.transition("create").is_some());
    }
}
