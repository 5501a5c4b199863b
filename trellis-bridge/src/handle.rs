//! Slot table mapping small integer handles to host-side values.
//!
//! The layout mirrors the boundary protocol: a fixed prefix of slots is the
//! transient (borrow) band, a handful of well-known constants sit right above
//! it, and dynamic allocation starts past both. Handles in the reserved
//! prefix are never recycled; the dynamic region reuses slots through an
//! intrusive LIFO free list.

use crate::error::{fault, BridgeError, ProtocolFault, Result};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub u32);

impl Handle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handle({})", self.0)
    }
}

// Link value for vacant slots that are not part of the free list
// (empty transient slots).
const NO_LINK: u32 = u32::MAX;

#[derive(Debug)]
enum Slot<T> {
    Occupied(T),
    Vacant { next: u32 },
}

#[derive(Debug)]
pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free_head: u32,
    // Grows downward into the transient band; empty when equal to the
    // band capacity.
    transient_top: u32,
    transient_capacity: u32,
    reserved_limit: u32,
}

impl<T> HandleTable<T> {
    /// Build a table with `transient_capacity` borrow slots followed by the
    /// given permanently-occupied constants.
    pub fn with_layout(transient_capacity: u32, constants: Vec<T>) -> Self {
        let mut slots: Vec<Slot<T>> = (0..transient_capacity)
            .map(|_| Slot::Vacant { next: NO_LINK })
            .collect();
        slots.extend(constants.into_iter().map(Slot::Occupied));
        let reserved_limit = slots.len() as u32;
        Self {
            slots,
            free_head: reserved_limit,
            transient_top: transient_capacity,
            transient_capacity,
            reserved_limit,
        }
    }

    pub fn reserved_limit(&self) -> u32 {
        self.reserved_limit
    }

    pub fn is_reserved(&self, handle: Handle) -> bool {
        handle.0 < self.reserved_limit
    }

    /// Insert a value, recycling the most recently released slot if any.
    pub fn allocate(&mut self, value: T) -> Handle {
        if self.free_head as usize == self.slots.len() {
            self.slots.push(Slot::Vacant {
                next: self.free_head + 1,
            });
        }
        let index = self.free_head;
        self.free_head = match self.slots[index as usize] {
            Slot::Vacant { next } => next,
            Slot::Occupied(_) => unreachable!("free list points at an occupied slot"),
        };
        self.slots[index as usize] = Slot::Occupied(value);
        Handle(index)
    }

    pub fn resolve(&self, handle: Handle) -> Result<&T> {
        match self.slots.get(handle.index()) {
            Some(Slot::Occupied(value)) => Ok(value),
            _ => Err(BridgeError::InvalidHandle(handle)),
        }
    }

    pub fn resolve_mut(&mut self, handle: Handle) -> Result<&mut T> {
        match self.slots.get_mut(handle.index()) {
            Some(Slot::Occupied(value)) => Ok(value),
            _ => Err(BridgeError::InvalidHandle(handle)),
        }
    }

    /// Return a dynamic slot to the free list. Releasing a reserved handle
    /// (constants and the transient band) is a deliberate no-op, matching the
    /// boundary protocol; releasing a vacant dynamic slot is a checked fault.
    pub fn release(&mut self, handle: Handle) -> Result<()> {
        if handle.0 < self.reserved_limit {
            return Ok(());
        }
        match self.slots.get(handle.index()) {
            None => Err(BridgeError::InvalidHandle(handle)),
            Some(Slot::Vacant { .. }) => Err(fault(ProtocolFault::DoubleRelease(handle))),
            Some(Slot::Occupied(_)) => {
                self.slots[handle.index()] = Slot::Vacant {
                    next: self.free_head,
                };
                self.free_head = handle.0;
                Ok(())
            }
        }
    }

    /// Resolve and release in one step. Fails on reserved handles because
    /// their values cannot be moved out.
    pub fn take(&mut self, handle: Handle) -> Result<T> {
        if handle.0 < self.reserved_limit {
            return Err(BridgeError::InvalidHandle(handle));
        }
        match self.slots.get_mut(handle.index()) {
            Some(slot @ Slot::Occupied(_)) => {
                let taken = std::mem::replace(
                    slot,
                    Slot::Vacant {
                        next: self.free_head,
                    },
                );
                self.free_head = handle.0;
                match taken {
                    Slot::Occupied(value) => Ok(value),
                    Slot::Vacant { .. } => unreachable!(),
                }
            }
            _ => Err(BridgeError::InvalidHandle(handle)),
        }
    }

    /// Push a value onto the transient borrow stack for the duration of a
    /// reentrant call. The bottom slot is kept unused so an exhausted stack
    /// is distinguishable from an empty one.
    pub fn push_transient(&mut self, value: T) -> Result<Handle> {
        if self.transient_top <= 1 {
            return Err(fault(ProtocolFault::TransientOverflow));
        }
        self.transient_top -= 1;
        self.slots[self.transient_top as usize] = Slot::Occupied(value);
        Ok(Handle(self.transient_top))
    }

    pub fn pop_transient(&mut self) -> Result<()> {
        if self.transient_top >= self.transient_capacity {
            return Err(fault(ProtocolFault::TransientUnderflow));
        }
        self.slots[self.transient_top as usize] = Slot::Vacant { next: NO_LINK };
        self.transient_top += 1;
        Ok(())
    }

    /// Run `f` with `value` visible through a transient handle, restoring the
    /// stack on every exit path.
    pub fn scoped_transient<R>(
        &mut self,
        value: T,
        f: impl FnOnce(&mut Self, Handle) -> Result<R>,
    ) -> Result<R> {
        let handle = self.push_transient(value)?;
        let outcome = f(self, handle);
        let restored = self.pop_transient();
        let value = outcome?;
        restored?;
        Ok(value)
    }

    /// Number of live dynamic slots, excluding the reserved band.
    pub fn live(&self) -> usize {
        self.slots[self.reserved_limit as usize..]
            .iter()
            .filter(|slot| matches!(slot, Slot::Occupied(_)))
            .count()
    }
}
