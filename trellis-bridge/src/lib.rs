//! Host-side runtime bridge for a sandboxed surface engine.
//!
//! An engine compiled into an isolated linear-memory module computes
//! tree edits; this crate decodes them and applies them to a host-owned
//! object tree (the surface) without raw pointers ever crossing the
//! boundary. Host objects are addressed through a handle table, strings and
//! wide identifiers move through the marshaling layer, and engine-owned
//! callback state is invoked through the reference-counted closure bridge.
//!
//! All shared state lives in a [`Session`], created per engine instance and
//! passed explicitly to every operation. Nothing here is global.

pub mod closure;
pub mod error;
pub mod handle;
pub mod marshal;
pub mod runtime;
pub mod value;

pub use error::{BridgeError, ExceptionSlot, ProtocolFault, Result};
pub use handle::{Handle, HandleTable};
pub use marshal::NodeId;
pub use value::Value;

// The crates binding this bridge to a host environment log through the same
// facade.
pub use log;

use std::rc::Rc;

use closure::{BridgedClosure, ClosureKind, ClosureTable, SharedClosureTable, SharedHooks};
use runtime::registry::NodeRegistry;

/// Session-level knobs. The defaults match the boundary convention the
/// engine is compiled against; changing `transient_slots` requires the
/// engine side to agree.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Size of the transient (borrow) band at the bottom of the handle
    /// table.
    pub transient_slots: u32,
    /// Reject re-registration of a live node id instead of releasing the
    /// displaced handle. Useful in test builds to surface engine bugs.
    pub strict_remap: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transient_slots: 32,
            strict_remap: false,
        }
    }
}

/// All state shared between the engine and the host for one engine
/// instance: the value table, the closure table, the node registry and the
/// exception slot. Created at instantiation, torn down with the instance.
pub struct Session<N> {
    pub(crate) values: HandleTable<Value<N>>,
    pub(crate) closures: SharedClosureTable,
    pub(crate) registry: NodeRegistry,
    pub(crate) exception: ExceptionSlot,
    pub(crate) config: Config,
    hooks: SharedHooks,
}

impl<N: Clone> Session<N> {
    pub fn new(config: Config, hooks: SharedHooks) -> Self {
        let constants = vec![
            Value::Undefined,
            Value::Null,
            Value::Bool(true),
            Value::Bool(false),
        ];
        Self {
            values: HandleTable::with_layout(config.transient_slots, constants),
            closures: Rc::new(std::cell::RefCell::new(ClosureTable::default())),
            registry: NodeRegistry::new(),
            exception: ExceptionSlot::default(),
            config,
            hooks,
        }
    }

    // Well-known constant handles, fixed just above the transient band.
    pub fn undefined(&self) -> Handle {
        Handle(self.config.transient_slots)
    }
    pub fn null(&self) -> Handle {
        Handle(self.config.transient_slots + 1)
    }
    pub fn bool_handle(&self, value: bool) -> Handle {
        Handle(self.config.transient_slots + if value { 2 } else { 3 })
    }

    /// Register the host object backing the mount root. Must run before the
    /// first mutation batch; batches attach top-level content under it.
    pub fn mount(&mut self, root: N) -> Result<Handle> {
        let handle = self.values.allocate(Value::Node(root));
        if let Some(displaced) = self.registry.set(NodeId::ROOT, handle) {
            self.values.release(displaced)?;
        }
        Ok(handle)
    }

    /// Wrap engine-owned callback state into an invocable and store it in
    /// the value table.
    pub fn wrap_closure(
        &mut self,
        kind: ClosureKind,
        fn_id: u32,
        dtor_id: u32,
        ctx_a: u32,
        ctx_b: u32,
    ) -> Handle {
        let closure = BridgedClosure::wrap(
            &self.closures,
            Rc::clone(&self.hooks),
            kind,
            fn_id,
            dtor_id,
            ctx_a,
            ctx_b,
        );
        self.values.allocate(Value::Callable(closure))
    }

    /// Store an already-decoded string, returning a handle that later calls
    /// can pass instead of re-marshaling the bytes.
    pub fn intern_text(&mut self, text: &str) -> Handle {
        self.values.allocate(Value::Text(text.into()))
    }

    /// Duplicate the value behind `handle` into a fresh handle. Reserved
    /// handles are returned as-is; duplicating a callable bumps its
    /// reference count.
    pub fn clone_ref(&mut self, handle: Handle) -> Result<Handle> {
        if self.values.is_reserved(handle) {
            return Ok(handle);
        }
        let dup = match self.values.resolve(handle)? {
            Value::Undefined => Value::Undefined,
            Value::Null => Value::Null,
            Value::Bool(b) => Value::Bool(*b),
            Value::Text(text) => Value::Text(Rc::clone(text)),
            Value::Node(node) => Value::Node(node.clone()),
            Value::Callable(closure) => Value::Callable(closure.retain()?),
        };
        Ok(self.values.allocate(dup))
    }

    /// Release one handle. Dropping a callable releases its reference to
    /// the underlying closure state; the result reports whether that was
    /// the last reference and the destructor fired. The reserved band is
    /// untouchable and the call is a no-op there.
    pub fn drop_ref(&mut self, handle: Handle) -> Result<bool> {
        match self.detach_ref(handle)? {
            Some(closure) => closure.drop_ref(),
            None => Ok(false),
        }
    }

    /// Remove the value behind `handle` without running closure teardown.
    /// The returned callable still owns one reference; a destructor runs
    /// engine code that may reenter the host, so a caller sharing this
    /// session through a cell must release its borrow before dropping it.
    pub fn detach_ref(&mut self, handle: Handle) -> Result<Option<BridgedClosure>> {
        if self.values.is_reserved(handle) {
            return Ok(None);
        }
        if let Value::Callable(closure) = self.values.take(handle)? {
            return Ok(Some(closure));
        }
        Ok(None)
    }

    /// Run an engine-initiated outward call, capturing any error into the
    /// exception slot for the boundary to rethrow after the call returns.
    pub fn guarded<T>(&mut self, default: T, f: impl FnOnce(&mut Self) -> Result<T>) -> T {
        match f(self) {
            Ok(value) => value,
            Err(err) => {
                self.exception.store(err);
                default
            }
        }
    }

    pub fn take_exception(&mut self) -> Option<BridgeError> {
        self.exception.take()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn values(&self) -> &HandleTable<Value<N>> {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut HandleTable<Value<N>> {
        &mut self.values
    }

    /// Clone of the surface node registered under `id`.
    pub fn node(&self, id: NodeId) -> Result<N> {
        let handle = self.registry.get(id)?;
        Ok(self.values.resolve(handle)?.as_node(handle)?.clone())
    }

    /// Shallow duplicate of the callable behind `handle`, without touching
    /// its reference count.
    pub fn callable(&self, handle: Handle) -> Result<BridgedClosure> {
        Ok(self.values.resolve(handle)?.as_callable(handle)?.clone())
    }
}
