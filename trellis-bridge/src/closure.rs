//! Reference-counted bridge between host-invocable callables and
//! engine-owned closure state.
//!
//! The engine hands the host a `(ctx_a, ctx_b)` state pair, the index of an
//! invoke adapter in its callback table and the index of a destructor for the
//! pair. The host may store the resulting [`BridgedClosure`] in any number of
//! places (event listeners, scheduled callbacks) and invoke it repeatedly;
//! the destructor fires exactly once, at the reference count's zero
//! transition, and never while an invocation is still on the stack.

use slotmap::{DefaultKey, SlotMap};
use std::{cell::RefCell, rc::Rc};

use crate::error::{fault, BridgeError, ProtocolFault, Result};

/// Primitive word of the boundary call convention.
pub type RawWord = u32;

/// The engine's exported callback table. `invoke` runs the adapter at
/// `fn_id` against the closure's state pair; `destroy` runs the teardown
/// routine the engine registered for that pair.
///
/// Receivers are shared because engine code running under an invocation
/// calls back into the host, and that reentry may drop some other closure
/// to zero and fire its destructor through the same hooks. Implementations
/// keep any mutable bookkeeping behind interior mutability.
pub trait EngineHooks {
    fn invoke(&self, fn_id: u32, ctx_a: RawWord, ctx_b: RawWord, args: &[RawWord]) -> Result<()>;
    fn destroy(&self, dtor_id: u32, ctx_a: RawWord, ctx_b: RawWord) -> Result<()>;
}

pub type SharedHooks = Rc<dyn EngineHooks>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ClosureIdx(pub DefaultKey);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ClosureKind {
    /// State may be mutated by the call; the first context word is moved out
    /// for the duration, so reentering is a checked fault.
    Mutable,
    /// State is shared; the call may reenter freely.
    Immutable,
}

#[derive(Debug)]
pub struct ClosureState {
    fn_id: u32,
    dtor_id: u32,
    ctx_a: RawWord,
    ctx_b: RawWord,
    refcount: u32,
    kind: ClosureKind,
    borrowed: bool,
}

/// Destroyed closures are removed from the map, so a stale [`ClosureIdx`]
/// resolves to nothing and invocation fails with `ClosureReleased`.
pub type ClosureTable = SlotMap<DefaultKey, ClosureState>;
pub type SharedClosureTable = Rc<RefCell<ClosureTable>>;

#[derive(Clone)]
pub struct BridgedClosure {
    idx: ClosureIdx,
    table: SharedClosureTable,
    hooks: SharedHooks,
}

impl std::fmt::Debug for BridgedClosure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BridgedClosure({:?})", self.idx.0)
    }
}

impl BridgedClosure {
    /// Wrap an engine state pair into an invocable. The reference count
    /// starts at one, owned by whoever holds the returned value.
    pub fn wrap(
        table: &SharedClosureTable,
        hooks: SharedHooks,
        kind: ClosureKind,
        fn_id: u32,
        dtor_id: u32,
        ctx_a: RawWord,
        ctx_b: RawWord,
    ) -> Self {
        let key = table.borrow_mut().insert(ClosureState {
            fn_id,
            dtor_id,
            ctx_a,
            ctx_b,
            refcount: 1,
            kind,
            borrowed: false,
        });
        log::trace!("wrapped closure {key:?} (invoke {fn_id}, dtor {dtor_id})");
        Self {
            idx: ClosureIdx(key),
            table: Rc::clone(table),
            hooks,
        }
    }

    pub fn idx(&self) -> ClosureIdx {
        self.idx
    }

    pub fn is_alive(&self) -> bool {
        self.table.borrow().contains_key(self.idx.0)
    }

    /// Invoke the underlying engine callback. The count is incremented
    /// before the call and settled afterwards even when the call fails, so
    /// the engine cannot tear the state down under a live invocation.
    pub fn invoke(&self, args: &[RawWord]) -> Result<()> {
        let (fn_id, ctx_a, ctx_b) = {
            let mut table = self.table.borrow_mut();
            let state = table
                .get_mut(self.idx.0)
                .ok_or(BridgeError::ClosureReleased)?;
            if state.kind == ClosureKind::Mutable && state.borrowed {
                return Err(fault(ProtocolFault::ReentrantClosure));
            }
            state.refcount += 1;
            if state.kind == ClosureKind::Mutable {
                state.borrowed = true;
            }
            (state.fn_id, state.ctx_a, state.ctx_b)
        };
        let outcome = self.hooks.invoke(fn_id, ctx_a, ctx_b, args);
        let settled = self.settle(ctx_a, ctx_b);
        outcome.and(settled)
    }

    // The finally-equivalent of an invocation: undo the borrow, drop the
    // invocation's count, and fire the destructor on the zero transition.
    fn settle(&self, ctx_a: RawWord, ctx_b: RawWord) -> Result<()> {
        let dtor = {
            let mut table = self.table.borrow_mut();
            let state = match table.get_mut(self.idx.0) {
                Some(state) => state,
                None => return Ok(()),
            };
            state.borrowed = false;
            if state.refcount == 0 {
                return Err(fault(ProtocolFault::RefcountUnderflow));
            }
            state.refcount -= 1;
            if state.refcount == 0 {
                let dtor_id = state.dtor_id;
                table.remove(self.idx.0);
                Some(dtor_id)
            } else {
                None
            }
        };
        if let Some(dtor_id) = dtor {
            log::trace!("closure {:?} destroyed after final invocation", self.idx.0);
            self.hooks.destroy(dtor_id, ctx_a, ctx_b)?;
        }
        Ok(())
    }

    /// Duplicate this callable, incrementing the reference count. Used when
    /// the same closure is stored in more than one host location.
    pub fn retain(&self) -> Result<BridgedClosure> {
        let mut table = self.table.borrow_mut();
        let state = table
            .get_mut(self.idx.0)
            .ok_or(BridgeError::ClosureReleased)?;
        state.refcount += 1;
        Ok(self.clone())
    }

    /// Release one reference. Returns `true` when this was the sole referent
    /// and the destructor fired; otherwise the drop is advisory and returns
    /// `false` (an in-flight invocation or a retained duplicate still owns
    /// the state and will trigger teardown itself).
    pub fn drop_ref(&self) -> Result<bool> {
        let dtor = {
            let mut table = self.table.borrow_mut();
            let state = table
                .get_mut(self.idx.0)
                .ok_or(BridgeError::ClosureReleased)?;
            if state.refcount == 0 {
                return Err(fault(ProtocolFault::RefcountUnderflow));
            }
            state.refcount -= 1;
            if state.refcount == 0 {
                let ids = (state.dtor_id, state.ctx_a, state.ctx_b);
                table.remove(self.idx.0);
                Some(ids)
            } else {
                None
            }
        };
        match dtor {
            Some((dtor_id, ctx_a, ctx_b)) => {
                log::trace!("closure {:?} dropped by host", self.idx.0);
                self.hooks.destroy(dtor_id, ctx_a, ctx_b)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
