//! Data movement across the shared linear memory.
//!
//! Strings cross the boundary as `(ptr, len)` pairs pointing into the
//! engine's memory, except when `ptr == 0`, in which case `len` names a
//! handle to an already-interned string. 64-bit identifiers cross as two
//! 32-bit words, low word first, matching a call convention that only has
//! 32-bit integer parameters.

use std::rc::Rc;

use crate::error::{BridgeError, Result};
use crate::handle::{Handle, HandleTable};
use crate::value::Value;

/// Identifier of a node in the host-side registry. `0` is reserved for the
/// mount root, which exists before any mutation batch runs.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct NodeId(pub u64);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    pub fn from_parts(low: u32, high: u32) -> Self {
        NodeId((high as u64) << 32 | low as u64)
    }

    pub fn to_parts(self) -> (u32, u32) {
        (self.0 as u32, (self.0 >> 32) as u32)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Byte-level view of the engine's exported memory. Implementations must
/// bounds-check and report overruns as `MemoryOutOfBounds` faults rather
/// than truncating.
pub trait LinearMemory {
    fn read(&self, ptr: u32, len: u32) -> Result<Vec<u8>>;
    fn write(&mut self, ptr: u32, bytes: &[u8]) -> Result<()>;
}

/// The engine's exported allocator, used when the host needs to place bytes
/// where the engine can see them.
pub trait GuestAllocator {
    fn alloc(&mut self, size: u32, align: u32) -> Result<u32>;
    fn realloc(&mut self, ptr: u32, old_size: u32, new_size: u32, align: u32) -> Result<u32>;
}

/// Decode a utf-8 string out of the shared memory. Malformed bytes are a
/// hard error; lossy replacement would let a corrupted length field go
/// unnoticed.
pub fn decode_string<M: LinearMemory + ?Sized>(memory: &M, ptr: u32, len: u32) -> Result<String> {
    let bytes = memory.read(ptr, len)?;
    String::from_utf8(bytes).map_err(|_| BridgeError::InvalidEncoding { ptr, len })
}

/// Copy a string into the shared memory, returning its `(ptr, len)`.
///
/// The reservation is one byte per scalar value, which is exact for ascii
/// text so the common case is a single allocation and one copy. Text with a
/// non-ascii tail writes the ascii prefix, reallocates to the exact utf-8
/// size and writes the rest.
pub fn encode_string<M, A>(memory: &mut M, alloc: &mut A, text: &str) -> Result<(u32, u32)>
where
    M: LinearMemory + ?Sized,
    A: GuestAllocator + ?Sized,
{
    let bytes = text.as_bytes();
    let reserve = text.chars().count() as u32;
    let ptr = alloc.alloc(reserve, 1)?;

    let ascii_len = bytes.iter().take_while(|b| b.is_ascii()).count();
    memory.write(ptr, &bytes[..ascii_len])?;
    if ascii_len == bytes.len() {
        return Ok((ptr, ascii_len as u32));
    }

    let exact = bytes.len() as u32;
    let ptr = alloc.realloc(ptr, reserve, exact, 1)?;
    memory.write(ptr + ascii_len as u32, &bytes[ascii_len..])?;
    Ok((ptr, exact))
}

/// A string argument as it arrives from the engine, before resolution.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TextArg {
    /// Bytes live in the shared memory at `ptr..ptr+len`.
    Inline { ptr: u32, len: u32 },
    /// The string was interned earlier and lives in the handle table.
    Interned(Handle),
}

impl TextArg {
    pub fn from_raw(ptr: u32, len: u32) -> Self {
        if ptr == 0 {
            TextArg::Interned(Handle(len))
        } else {
            TextArg::Inline { ptr, len }
        }
    }

    pub fn resolve<N, M: LinearMemory + ?Sized>(
        self,
        memory: &M,
        table: &HandleTable<Value<N>>,
    ) -> Result<Rc<str>> {
        match self {
            TextArg::Inline { ptr, len } => Ok(decode_string(memory, ptr, len)?.into()),
            TextArg::Interned(handle) => {
                Ok(Rc::clone(table.resolve(handle)?.as_text(handle)?))
            }
        }
    }
}
