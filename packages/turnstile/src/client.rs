//! Per-request execution context.
//!
//! A [`Client`] is owned exclusively by one request: it carries the
//! authenticated principal, the active transaction handle, the nested action
//! stack, and the per-request read cache. It is threaded explicitly through
//! every engine call; there is no ambient global context.
//!
//! # Action Stack
//!
//! Each transition pushes one `{machine, record, transition}` frame for the
//! duration of its execution. The stack answers two questions for nested
//! calls:
//!
//! - **Who is calling me?** An empty stack means a public caller; a top
//!   frame from a different machine means a protected caller; a top frame
//!   from the same machine means the machine is calling itself (private).
//! - **What is my parent record?** The frame one below the top.
//!
//! Frames are popped by an RAII guard so the stack stays balanced on every
//! exit path, exceptions included. The stack is mutated synchronously around
//! each await; the lock is never held across a suspension point.

use std::collections::HashSet;
use std::sync::Mutex;

use dashmap::DashMap;
use smallvec::SmallVec;
use std::sync::Arc;
use uuid::Uuid;

use crate::builder::Entity;
use crate::schema::{Record, Scope};

/// The authenticated principal on whose behalf a request executes.
#[derive(Debug, Clone)]
pub struct Principal {
    pub id: Uuid,
    /// Tenant the principal belongs to; `None` for tenantless principals.
    pub tenant_id: Option<Uuid>,
}

impl Principal {
    pub fn new(id: Uuid) -> Self {
        Principal {
            id,
            tenant_id: None,
        }
    }

    pub fn with_tenant(mut self, tenant_id: Uuid) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }
}

/// Opaque transaction handle, passed down to every storage call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxHandle(Uuid);

impl TxHandle {
    pub fn new() -> Self {
        TxHandle(Uuid::new_v4())
    }

    pub fn id(&self) -> Uuid {
        self.0
    }
}

impl Default for TxHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// One in-flight transition invocation.
#[derive(Clone)]
pub struct Frame {
    pub machine: String,
    pub transition: String,
    /// Snapshot of the record as it was when the frame was pushed.
    pub record: Record,
}

/// Per-request ambient object: principal, transaction, action stack, cache.
pub struct Client {
    pub principal: Principal,
    pub tx: TxHandle,
    stack: Mutex<SmallVec<[Frame; 4]>>,
    cache: DashMap<(String, Uuid), Arc<Entity>>,
    building: Mutex<HashSet<(String, Uuid)>>,
}

impl Client {
    /// Create a client for one request, with a fresh transaction handle.
    pub fn new(principal: Principal) -> Self {
        Client {
            principal,
            tx: TxHandle::new(),
            stack: Mutex::new(SmallVec::new()),
            cache: DashMap::new(),
            building: Mutex::new(HashSet::new()),
        }
    }

    /// Create a client bound to an existing transaction.
    pub fn with_tx(principal: Principal, tx: TxHandle) -> Self {
        Client {
            principal,
            tx,
            stack: Mutex::new(SmallVec::new()),
            cache: DashMap::new(),
            building: Mutex::new(HashSet::new()),
        }
    }

    /// Current nesting depth of the action stack.
    pub fn depth(&self) -> usize {
        self.stack.lock().expect("action stack poisoned").len()
    }

    /// Snapshot of the topmost frame, if any.
    pub fn top(&self) -> Option<Frame> {
        self.stack
            .lock()
            .expect("action stack poisoned")
            .last()
            .cloned()
    }

    /// Snapshot of the frame one below the top: the parent of the
    /// currently-executing transition.
    pub fn parent_frame(&self) -> Option<Frame> {
        let stack = self.stack.lock().expect("action stack poisoned");
        if stack.len() < 2 {
            return None;
        }
        stack.get(stack.len() - 2).cloned()
    }

    /// Compute the input visibility scope for a call into `machine`.
    ///
    /// Evaluated *before* the new frame is pushed: an empty stack is a
    /// public caller; a different machine on top is a protected caller; the
    /// same machine on top means the machine is invoking itself.
    pub fn scope_for(&self, machine: &str) -> Scope {
        match self.top() {
            None => Scope::Public,
            Some(frame) if frame.machine == machine => Scope::Private,
            Some(_) => Scope::Protected,
        }
    }

    /// Push an action frame; the returned guard pops it on drop.
    pub(crate) fn push(&self, frame: Frame) -> FrameGuard<'_> {
        self.stack
            .lock()
            .expect("action stack poisoned")
            .push(frame);
        FrameGuard { client: self }
    }

    fn pop(&self) {
        self.stack.lock().expect("action stack poisoned").pop();
    }

    /// Look up a cached entity by `(resource, id)`.
    pub fn cached(&self, resource: &str, id: Uuid) -> Option<Arc<Entity>> {
        self.cache
            .get(&(resource.to_string(), id))
            .map(|e| e.value().clone())
    }

    /// Insert an entity into the per-request cache.
    pub fn cache_entity(&self, resource: &str, id: Uuid, entity: Arc<Entity>) {
        self.cache.insert((resource.to_string(), id), entity);
    }

    /// Mark a record as being built. Returns false when it is already in
    /// progress higher up the call chain, meaning the graph has a cycle.
    pub(crate) fn begin_build(&self, resource: &str, id: Uuid) -> bool {
        self.building
            .lock()
            .expect("build set poisoned")
            .insert((resource.to_string(), id))
    }

    pub(crate) fn end_build(&self, resource: &str, id: Uuid) {
        self.building
            .lock()
            .expect("build set poisoned")
            .remove(&(resource.to_string(), id));
    }

    /// Drop a cached entity, forcing the next read to hit storage.
    ///
    /// Called after a transition mutates a record so stale projections are
    /// not served for the rest of the request.
    pub fn evict(&self, resource: &str, id: Uuid) {
        self.cache.remove(&(resource.to_string(), id));
    }
}

/// RAII guard popping one action frame. Held across the whole transition so
/// the pop happens on success and on error paths alike.
pub(crate) struct FrameGuard<'a> {
    client: &'a Client,
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.client.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Client {
        Client::new(Principal::new(Uuid::new_v4()))
    }

    fn frame(machine: &str) -> Frame {
        Frame {
            machine: machine.into(),
            transition: "create".into(),
            record: Record::new_void(),
        }
    }

    #[test]
    fn test_scope_inference() {
        let client = client();
        assert_eq!(client.scope_for("order"), Scope::Public);

        let _outer = client.push(frame("cart"));
        assert_eq!(client.scope_for("order"), Scope::Protected);
        assert_eq!(client.scope_for("cart"), Scope::Private);
    }

    #[test]
    fn test_stack_balanced_on_drop() {
        let client = client();
        assert_eq!(client.depth(), 0);
        {
            let _a = client.push(frame("a"));
            assert_eq!(client.depth(), 1);
            {
                let _b = client.push(frame("b"));
                assert_eq!(client.depth(), 2);
            }
            assert_eq!(client.depth(), 1);
        }
        assert_eq!(client.depth(), 0);
    }

    #[test]
    fn test_stack_balanced_on_panic() {
        let client = client();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _g = client.push(frame("a"));
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(client.depth(), 0);
    }

    #[test]
    fn test_parent_frame() {
        let client = client();
        assert!(client.parent_frame().is_none());
        let _a = client.push(frame("a"));
        assert!(client.parent_frame().is_none());
        let _b = client.push(frame("b"));
        let parent = client.parent_frame().unwrap();
        assert_eq!(parent.machine, "a");
        let top = client.top().unwrap();
        assert_eq!(top.machine, "b");
    }
}
