use thiserror::Error;

use crate::handle::Handle;
use crate::marshal::NodeId;

/// A broken protocol invariant between the engine and the interpreter,
/// such as free-list corruption or consuming more scratch entries than
/// were pushed. Surfaced as checked errors instead of silently corrupting
/// the shared tables, and logged at error level so they are never silent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolFault {
    #[error("scratch stack underflow: {requested} entries requested, {available} available")]
    StackUnderflow { requested: usize, available: usize },
    #[error("scratch stack holds {residue} leftover entries at end of batch")]
    StackResidue { residue: usize },
    #[error("transient handle stack overflow")]
    TransientOverflow,
    #[error("transient handle stack underflow")]
    TransientUnderflow,
    #[error("handle {0} released twice")]
    DoubleRelease(Handle),
    #[error("closure reference count decremented below zero")]
    RefcountUnderflow,
    #[error("mutable closure reentered while its state was borrowed")]
    ReentrantClosure,
    #[error("handle {handle} holds a {found} value where a {expected} was required")]
    ValueKindMismatch {
        handle: Handle,
        expected: &'static str,
        found: &'static str,
    },
    #[error("memory access at {ptr}..+{len} is outside the shared buffer (length {buffer_len})")]
    MemoryOutOfBounds { ptr: u32, len: u32, buffer_len: usize },
    #[error("node id {0} re-registered while strict remapping is enabled")]
    NodeRemapDenied(NodeId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("invalid handle {0}")]
    InvalidHandle(Handle),
    #[error("byte range {ptr}..+{len} is not valid utf-8")]
    InvalidEncoding { ptr: u32, len: u32 },
    #[error("unknown node id {0}")]
    UnknownNode(NodeId),
    #[error("closure invoked after its destructor has fired")]
    ClosureReleased,
    #[error("implementation error: {0}")]
    Implementation(#[from] ProtocolFault),
    #[error("host boundary rejected the call: {0}")]
    BoundaryRejection(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

pub(crate) fn fault(f: ProtocolFault) -> BridgeError {
    log::error!("protocol fault: {f}");
    BridgeError::Implementation(f)
}

/// Single cell holding the most recent error raised while an engine-initiated
/// outward call was executing. The boundary drains it right after the call
/// returns abnormally.
#[derive(Debug, Default)]
pub struct ExceptionSlot(Option<BridgeError>);

impl ExceptionSlot {
    pub fn store(&mut self, err: BridgeError) {
        if let Some(prev) = self.0.replace(err) {
            log::warn!("exception slot overwritten while holding: {prev}");
        }
    }
    pub fn take(&mut self) -> Option<BridgeError> {
        self.0.take()
    }
    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }
}
