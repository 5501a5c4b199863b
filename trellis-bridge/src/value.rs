//! Values addressable through the handle table.

use std::rc::Rc;

use crate::closure::BridgedClosure;
use crate::error::{fault, ProtocolFault, Result};
use crate::handle::Handle;

/// One host-side value owned by a handle table slot. `N` is the surface's
/// node type; everything else is boundary-primitive.
#[derive(Clone)]
pub enum Value<N> {
    Undefined,
    Null,
    Bool(bool),
    Text(Rc<str>),
    Node(N),
    Callable(BridgedClosure),
}

impl<N> Value<N> {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Text(_) => "text",
            Value::Node(_) => "node",
            Value::Callable(_) => "callable",
        }
    }

    pub fn as_node(&self, handle: Handle) -> Result<&N> {
        match self {
            Value::Node(node) => Ok(node),
            other => Err(fault(ProtocolFault::ValueKindMismatch {
                handle,
                expected: "node",
                found: other.kind(),
            })),
        }
    }

    pub fn as_callable(&self, handle: Handle) -> Result<&BridgedClosure> {
        match self {
            Value::Callable(callable) => Ok(callable),
            other => Err(fault(ProtocolFault::ValueKindMismatch {
                handle,
                expected: "callable",
                found: other.kind(),
            })),
        }
    }

    pub fn as_text(&self, handle: Handle) -> Result<&Rc<str>> {
        match self {
            Value::Text(text) => Ok(text),
            other => Err(fault(ProtocolFault::ValueKindMismatch {
                handle,
                expected: "text",
                found: other.kind(),
            })),
        }
    }
}

impl<N> std::fmt::Debug for Value<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Undefined => write!(f, "Undefined"),
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Text(t) => write!(f, "Text({t:?})"),
            Value::Node(_) => write!(f, "Node"),
            Value::Callable(c) => write!(f, "Callable({c:?})"),
        }
    }
}
