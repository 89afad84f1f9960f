//! # Turnstile
//!
//! A resource-lifecycle engine: resources are declarative state machines,
//! every mutation is a named transition, and one validated code path runs
//! them all.
//!
//! ## Core Concepts
//!
//! Turnstile separates **description** from **execution**:
//! - [`Schema`] = Description (states, transitions, guards, hooks, input and
//!   output trees)
//! - [`Machine`] = Persistence (local storage or a remote service)
//! - [`Engine`] = Execution (one transition algorithm for every machine)
//!
//! The key principle: **every record mutation is a transition**. Creation is
//! the `create` transition out of the universal `void` state; deletion is a
//! transition into the `deleted` state with stamped tombstone columns.
//!
//! ## Architecture
//!
//! ```text
//! Caller
//!     │
//!     ▼ create() / edit() / delete() / act()
//! Engine ──► Machine registry (validated at startup)
//!     │
//!     ▼ run_transition()
//! Executor
//!     ├─► sanitize + validate input   (scope from the action stack)
//!     ├─► push action frame           (RAII pop on every exit path)
//!     ├─► guards, in order
//!     ├─► body ─► stamp lifecycle ─► Machine.save()
//!     ├─► after ─► re-save
//!     ├─► enter/exit hooks            (suppressed for nested self-loops)
//!     └─► Builder ─► Entity
//! ```
//!
//! ## Key Invariants
//!
//! 1. **`void` is universal** - Every record starts there; every schema
//!    declares `create` out of it
//! 2. **Soft delete is convention** - The `deleted` state plus stamped
//!    `deleted_at/by`; reads exclude deleted rows everywhere
//! 3. **Scope comes from the stack** - Public, protected or private input
//!    visibility is inferred from who is calling, never passed in
//! 4. **Cheap failures first** - Runtime rules run before database rules,
//!    which run before remote service rules
//! 5. **The stack stays balanced** - Frames pop on success, error and panic
//! 6. **One read, one entity** - Repeated reads of a record in one request
//!    return the same cached `Arc<Entity>`
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use serde_json::json;
//! use turnstile::{
//!     Client, Engine, InputProp, InputSchema, MemoryStorage, OutputProp,
//!     OutputSchema, Principal, ResourceMachine, Schema, Transition,
//! };
//!
//! let schema = Schema::new("order")
//!     .with_state("open", "Open")
//!     .with_state("shipped", "Shipped")
//!     .with_transition(
//!         "create",
//!         Transition::new("Create")
//!             .to("open")
//!             .with_input(InputSchema::new().prop("name", InputProp::text("Name").required()))
//!             .mutate(|record, input, _| {
//!                 record.set("name", json!(input.str("name").unwrap_or_default()));
//!                 Ok(())
//!             }),
//!     )
//!     .with_transition("ship", Transition::new("Ship").from("open").to("shipped"))
//!     .with_transition("delete", Transition::new("Delete").from("open").to("deleted"))
//!     .with_output(OutputSchema::new().prop("name", OutputProp::field("name")));
//!
//! let storage = Arc::new(MemoryStorage::new().with_table("orders", ["name"]));
//! let engine = Engine::builder()
//!     .with_machine(ResourceMachine::new(schema, storage))
//!     .build()?;
//!
//! let client = Client::new(Principal::new(uuid::Uuid::new_v4()));
//! let order = engine.create(&client, "order", json!({ "name": "one" })).await?;
//! let shipped = order.act(&engine, &client, "ship", json!({})).await?;
//! ```
//!
//! ## What This Is Not
//!
//! Turnstile is **not**:
//! - An ORM or migration tool (storage is a collaborator behind a trait)
//! - An HTTP framework (it has no routes; an API layer calls the engine)
//! - A workflow scheduler (transitions run inline, in the caller's task)
//!
//! Turnstile **is**:
//! > A lifecycle engine where schemas describe, machines persist, and one
//! > transition algorithm executes.

// Core modules
mod builder;
mod client;
mod engine;
mod error;
mod executor;
mod machine;
mod pagination;
mod query;
mod remote;
mod resource;
mod schema;
mod service;
mod storage;
mod tenancy;
mod validator;

// End-to-end lifecycle tests (test-only)
#[cfg(test)]
mod lifecycle_tests;

// Re-export the schema vocabulary
pub use crate::schema::{
    BuildView, Cardinality, Check, FromStates, GraphLink, Guard, Hook, HookOn, InputProp,
    InputSchema, InputType, OutputProp, OutputSchema, Record, Required, Rule, RuleStage, Schema,
    Scope, Target, Transition, DELETED_STATE, RESERVED_MARKER, VOID_STATE,
};

// Re-export the execution surface
pub use crate::builder::Entity;
pub use crate::client::{Client, Frame, Principal, TxHandle};
pub use crate::engine::{Engine, EngineBuilder};
pub use crate::error::EngineError;
pub use crate::executor::TransitionArgs;
pub use crate::machine::{Machine, MachineKind};
pub use crate::validator::Input;

// Re-export the collaborator contracts and stock implementations
pub use crate::pagination::{Direction, Order, Pagination, DEFAULT_PER_PAGE, MAX_PER_PAGE};
pub use crate::query::{
    Filter, FilterOp, FilterRule, LinkStep, ResolvedParam, ResolvedRule, SORT_KEY,
};
pub use crate::remote::{HttpRemote, RemoteBackend, Verb};
pub use crate::resource::ResourceMachine;
pub use crate::service::ServiceMachine;
pub use crate::storage::{Clause, Cmp, Predicate, Storage, StorageError, StorageQuery};
pub use crate::tenancy::{ColumnTenancy, NoTenancy, Tenancy, TenancyMode};

#[cfg(any(test, feature = "testing"))]
pub use crate::storage::MemoryStorage;

// Re-export commonly paired externals
pub use async_trait::async_trait;
