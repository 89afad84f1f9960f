//! The transition algorithm.
//!
//! One code path runs every transition, local or remote:
//!
//! 1. Look up the transition and check the record's current state against
//!    its `from` set.
//! 2. Sanitize and validate the input (scope is inferred from the action
//!    stack *before* this transition's frame is pushed).
//! 3. Push the action frame. From here to the end an RAII guard keeps the
//!    stack balanced on every exit path.
//! 4. Run guards in declaration order. A recognized storage error re-raises
//!    verbatim; any other guard failure becomes a guard error carrying the
//!    guard's message.
//! 5. Run the body, move the record to the target state, stamp lifecycle
//!    columns, save, log.
//! 6. Run the `after` body (if any) and re-save.
//! 7. Fire enter/exit hooks, unless this is a self-loop nested inside
//!    another action.
//! 8. Build and return the output entity.

use chrono::Utc;
use serde_json::Value;

use crate::builder::{self, Entity};
use crate::client::{Client, Frame};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::machine::Machine;
use crate::schema::{HookOn, Record, Target, DELETED_STATE, VOID_STATE};
use crate::validator::{self, Input};

/// Everything a transition body (or `after` body) can touch.
pub struct TransitionArgs<'a> {
    pub record: &'a mut Record,
    pub input: &'a Input,
    pub client: &'a Client,
    pub engine: &'a Engine,
    /// Record of the enclosing transition, when this one was invoked from
    /// inside another body.
    pub parent: Option<&'a Record>,
}

pub(crate) async fn run_transition(
    engine: &Engine,
    client: &Client,
    machine: &dyn Machine,
    name: &str,
    record: &mut Record,
    raw_input: Value,
) -> Result<Entity, EngineError> {
    let schema = machine.schema();
    let transition = schema
        .transition(name)
        .ok_or_else(|| EngineError::InvalidTransition {
            machine: schema.name.clone(),
            transition: name.to_string(),
        })?;

    let from = record.state.clone();
    let to = match &transition.to {
        Target::State(state) => state.clone(),
        Target::Current => from.clone(),
    };
    if !transition.from.allows(&from) {
        return Err(EngineError::NoTransitionFromCurrentState {
            machine: schema.name.clone(),
            transition: name.to_string(),
            state: from,
        });
    }

    let (values, scope) = validator::sanitize(client, &schema.name, &transition.input, raw_input);
    let input = validator::validate(engine, client, machine, transition, record, values, scope)
        .await?;

    let origin = client
        .top()
        .map(|f| format!("{}.{}", f.machine, f.transition))
        .unwrap_or_default();
    let nested = client.depth() > 0;
    // The caller's frame (still on top here) becomes this body's parent.
    let parent = client.top().map(|f| f.record);

    let _frame = client.push(Frame {
        machine: schema.name.clone(),
        transition: name.to_string(),
        record: record.clone(),
    });

    for guard in &transition.guards {
        match (guard.check)(record, client, engine).await {
            Ok(true) => {}
            Ok(false) => {
                let message = (guard.message)(record);
                tracing::warn!(
                    machine = %schema.name,
                    transition = %name,
                    %message,
                    "guard rejected transition"
                );
                return Err(EngineError::TransitionGuardFailed {
                    machine: schema.name.clone(),
                    message,
                });
            }
            Err(err) if err.is_storage() => return Err(err),
            Err(err) => {
                let message = (guard.message)(record);
                tracing::warn!(
                    machine = %schema.name,
                    transition = %name,
                    error = %err,
                    "guard raised during transition"
                );
                return Err(EngineError::TransitionGuardFailed {
                    machine: schema.name.clone(),
                    message,
                });
            }
        }
    }

    if let Some(body) = &transition.body {
        body(TransitionArgs {
            record,
            input: &input,
            client,
            engine,
            parent: parent.as_ref(),
        })
        .await?;
    }

    let now = Utc::now();
    record.state = to.clone();
    if from == VOID_STATE {
        record.created_at = Some(now);
        record.created_by = Some(client.principal.id);
    }
    record.updated_at = Some(now);
    record.updated_by = Some(client.principal.id);
    if to == DELETED_STATE {
        record.deleted_at = Some(now);
        record.deleted_by = Some(client.principal.id);
    }

    if let Err(err) = machine.save(engine, client, record).await {
        tracing::warn!(
            machine = %schema.name,
            transition = %name,
            error = %err,
            "save failed"
        );
        return Err(err);
    }
    client.evict(&schema.name, record.id);

    let loggable = Value::Object(input.loggable_view(&transition.input));
    tracing::info!(
        machine = %schema.name,
        transition = %name,
        from = %from,
        to = %to,
        origin = %origin,
        input = %loggable,
        "transition executed"
    );

    if let Some(after) = &transition.after {
        after(TransitionArgs {
            record,
            input: &input,
            client,
            engine,
            parent: parent.as_ref(),
        })
        .await?;
        machine.save(engine, client, record).await?;
        client.evict(&schema.name, record.id);
    }

    // A nested self-loop is a secondary action on a record already moving
    // through its primary transition; its hooks would double-fire.
    let suppress_hooks = transition.is_self_loop() && nested;
    if !suppress_hooks {
        for hook in &schema.hooks {
            let fires = match hook.on {
                HookOn::Exit => hook.state == from,
                HookOn::Enter => hook.state == to,
            };
            if fires {
                (hook.run)(record, client, engine).await?;
            }
        }
    }

    builder::build_entity(engine, client, schema, record).await
}
