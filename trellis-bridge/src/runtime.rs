//! Batch execution against a live surface: node registry, mutation
//! interpreter and the deferral trait for host-scheduled callbacks.

pub mod interpreter;
pub mod registry;
pub mod scheduler;

pub use interpreter::{apply_batch, EditOp, Surface};
pub use registry::NodeRegistry;
pub use scheduler::{Scheduler, TaskFn};
