//! Browser-backed [`Scheduler`].

use js_sys::Function;
use trellis_bridge::error::{BridgeError, Result};
use trellis_bridge::runtime::{Scheduler, TaskFn};
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::Window;

fn js_err(context: &str, err: JsValue) -> BridgeError {
    BridgeError::BoundaryRejection(format!("{context}: {err:?}"))
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WebTask {
    Timeout(i32),
    Frame(i32),
    Idle(u32),
}

pub struct WebScheduler {
    window: Window,
}

impl WebScheduler {
    pub fn new() -> Result<Self> {
        let window = web_sys::window()
            .ok_or_else(|| BridgeError::BoundaryRejection("no window available".into()))?;
        Ok(Self { window })
    }

    // One-shot callbacks are handed to the host and never reclaimed on the
    // Rust side, matching the conventional glue for forgotten closures.
    fn as_function(callback: TaskFn) -> Function {
        Closure::once_into_js(callback).unchecked_into()
    }
}

impl Scheduler for WebScheduler {
    type Task = WebTask;

    fn schedule_timeout(&mut self, callback: TaskFn, delay_ms: u32) -> Result<WebTask> {
        let id = self
            .window
            .set_timeout_with_callback_and_timeout_and_arguments_0(
                &Self::as_function(callback),
                delay_ms as i32,
            )
            .map_err(|e| js_err("setTimeout", e))?;
        Ok(WebTask::Timeout(id))
    }

    fn schedule_frame(&mut self, callback: TaskFn) -> Result<WebTask> {
        let id = self
            .window
            .request_animation_frame(&Self::as_function(callback))
            .map_err(|e| js_err("requestAnimationFrame", e))?;
        Ok(WebTask::Frame(id))
    }

    fn schedule_idle(&mut self, callback: TaskFn) -> Result<WebTask> {
        let id = self
            .window
            .request_idle_callback(&Self::as_function(callback))
            .map_err(|e| js_err("requestIdleCallback", e))?;
        Ok(WebTask::Idle(id))
    }

    fn cancel(&mut self, task: WebTask) -> Result<()> {
        match task {
            WebTask::Timeout(id) => {
                self.window.clear_timeout_with_handle(id);
            }
            WebTask::Frame(id) => self
                .window
                .cancel_animation_frame(id)
                .map_err(|e| js_err("cancelAnimationFrame", e))?,
            WebTask::Idle(id) => self.window.cancel_idle_callback(id),
        }
        Ok(())
    }
}
