//! Deferred execution at the edges of the boundary.
//!
//! Mutation batches run to completion synchronously; the only suspension
//! points are host-scheduled callbacks. Cancellation works by retaining the
//! task handle and cancelling before the callback fires; there is no
//! cancellation mid-batch.

use crate::error::Result;

pub type TaskFn = Box<dyn FnOnce()>;

/// Host-environment deferral primitives. A refused or unsupported facility
/// surfaces as `BoundaryRejection`; nothing is retried.
pub trait Scheduler {
    type Task;

    fn schedule_timeout(&mut self, callback: TaskFn, delay_ms: u32) -> Result<Self::Task>;
    fn schedule_frame(&mut self, callback: TaskFn) -> Result<Self::Task>;
    fn schedule_idle(&mut self, callback: TaskFn) -> Result<Self::Task>;
    fn cancel(&mut self, task: Self::Task) -> Result<()>;
}
