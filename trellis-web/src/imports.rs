//! The host import table handed to the engine at instantiation.
//!
//! Wire conventions, all 32-bit: strings are `(ptr, len)` pairs into the
//! engine memory, with `ptr == 0` meaning "interned at handle `len`" and
//! `(0, u32::MAX)` meaning absent; wide node ids arrive as two words, low
//! first; namespaces arrive as an interned-text handle, `0` for none.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use js_sys::{Object, Reflect};
use trellis_bridge::closure::{BridgedClosure, ClosureKind};
use trellis_bridge::error::Result;
use trellis_bridge::log;
use trellis_bridge::marshal::{NodeId, TextArg};
use trellis_bridge::runtime::{apply_batch, EditOp, Scheduler};
use trellis_bridge::{Handle, Session};
use wasm_bindgen::prelude::*;
use web_sys::Node;

use crate::boundary::SharedExports;
use crate::dom::DomSurface;
use crate::schedule::{WebScheduler, WebTask};

const ABSENT: (u32, u32) = (0, u32::MAX);

/// Everything the import closures need, shared by reference. Edits are
/// buffered per batch and applied by the `edit_flush` import.
pub struct HostContext {
    pub session: RefCell<Session<Node>>,
    pub surface: RefCell<DomSurface>,
    pub scheduler: RefCell<WebScheduler>,
    pub exports: SharedExports,
    pending: RefCell<Vec<EditOp>>,
    tasks: RefCell<HashMap<u32, (WebTask, BridgedClosure)>>,
    next_task: Cell<u32>,
}

impl HostContext {
    pub fn new(
        session: Session<Node>,
        surface: DomSurface,
        scheduler: WebScheduler,
        exports: SharedExports,
    ) -> Rc<Self> {
        Rc::new(Self {
            session: RefCell::new(session),
            surface: RefCell::new(surface),
            scheduler: RefCell::new(scheduler),
            exports,
            pending: RefCell::new(Vec::new()),
            tasks: RefCell::new(HashMap::new()),
            next_task: Cell::new(1),
        })
    }

    fn read_text(&self, ptr: u32, len: u32) -> Result<Rc<str>> {
        let exports = self.exports.borrow();
        let session = self.session.borrow();
        TextArg::from_raw(ptr, len).resolve(&*exports, session.values())
    }

    fn read_opt_text(&self, ptr: u32, len: u32) -> Result<Option<Rc<str>>> {
        if (ptr, len) == ABSENT {
            return Ok(None);
        }
        self.read_text(ptr, len).map(Some)
    }

    fn namespace(&self, ns_handle: u32) -> Result<Option<Rc<str>>> {
        if ns_handle == 0 {
            return Ok(None);
        }
        let session = self.session.borrow();
        let handle = Handle(ns_handle);
        Ok(Some(Rc::clone(
            session.values().resolve(handle)?.as_text(handle)?,
        )))
    }

    // Failures while decoding an op land in the exception slot; the op is
    // dropped and the eventual flush proceeds with what decoded cleanly.
    fn enqueue(&self, op: Result<EditOp>) {
        match op {
            Ok(op) => self.pending.borrow_mut().push(op),
            Err(err) => self.session.borrow_mut().guarded((), |_| Err(err)),
        }
    }

    // A closure destructor runs engine code that reenters these imports to
    // drop handles held in its state, so every path that can fire one must
    // release the session and surface borrows first.
    pub fn flush(&self) {
        let ops = std::mem::take(&mut *self.pending.borrow_mut());
        let detached = {
            let mut session = self.session.borrow_mut();
            let mut surface = self.surface.borrow_mut();
            session.guarded(Vec::new(), |s| apply_batch(s, &mut *surface, &ops))
        };
        for closure in detached {
            if let Err(err) = closure.drop_ref() {
                self.session.borrow_mut().guarded((), |_| Err(err));
            }
        }
    }

    fn drop_handle(&self, handle: u32) -> bool {
        let detached = {
            let mut session = self.session.borrow_mut();
            session.guarded(None, |s| s.detach_ref(Handle(handle)))
        };
        let Some(closure) = detached else {
            return false;
        };
        match closure.drop_ref() {
            Ok(fired) => fired,
            Err(err) => {
                self.session.borrow_mut().guarded((), |_| Err(err));
                false
            }
        }
    }

    fn schedule(ctx: &Rc<Self>, cb_handle: u32, kind: ScheduleKind) -> Result<u32> {
        let closure = {
            let session = ctx.session.borrow();
            session.callable(Handle(cb_handle))?.retain()?
        };
        let id = ctx.next_task.get();
        ctx.next_task.set(id + 1);

        let fired = closure.clone();
        let registry = Rc::clone(ctx);
        let task_fn = Box::new(move || {
            registry.tasks.borrow_mut().remove(&id);
            if let Err(err) = fired.invoke(&[]) {
                log::error!("scheduled callback failed: {err}");
            }
            let _ = fired.drop_ref();
        });
        let task = {
            let mut scheduler = ctx.scheduler.borrow_mut();
            match kind {
                ScheduleKind::Timeout(ms) => scheduler.schedule_timeout(task_fn, ms)?,
                ScheduleKind::Frame => scheduler.schedule_frame(task_fn)?,
                ScheduleKind::Idle => scheduler.schedule_idle(task_fn)?,
            }
        };
        ctx.tasks.borrow_mut().insert(id, (task, closure));
        Ok(id)
    }

    fn cancel(&self, id: u32) -> Result<()> {
        let entry = self.tasks.borrow_mut().remove(&id);
        if let Some((task, closure)) = entry {
            self.scheduler.borrow_mut().cancel(task)?;
            // the callback will never run, so the reference it would have
            // released on firing is released here
            closure.drop_ref()?;
        }
        Ok(())
    }
}

enum ScheduleKind {
    Timeout(u32),
    Frame,
    Idle,
}

fn set(ns: &Object, name: &str, value: JsValue) {
    Reflect::set(ns, &JsValue::from_str(name), &value).unwrap_throw();
}

macro_rules! import {
    ($ns:expr, $ctx:expr, $name:literal, |$c:ident $(, $arg:ident : $ty:ty)*| $(-> $ret:ty)? $body:block) => {{
        let $c = Rc::clone($ctx);
        set(
            $ns,
            $name,
            Closure::<dyn FnMut($($ty),*) $(-> $ret)?>::new(move |$($arg: $ty),*| $body)
                .into_js_value(),
        );
    }};
}

/// Build the `host` import module around a shared context.
pub fn build_imports(ctx: &Rc<HostContext>) -> Object {
    let host = Object::new();

    // value intrinsics
    import!(&host, ctx, "string_intern", |c, ptr: u32, len: u32| -> u32 {
        let text = match c.read_text(ptr, len) {
            Ok(text) => text,
            Err(err) => return c.session.borrow_mut().guarded(0, |_| Err(err)),
        };
        c.session.borrow_mut().intern_text(&text).0
    });
    import!(&host, ctx, "handle_clone", |c, handle: u32| -> u32 {
        c.session
            .borrow_mut()
            .guarded(Handle(0), |s| s.clone_ref(Handle(handle)))
            .0
    });
    import!(&host, ctx, "handle_drop", |c, handle: u32| {
        c.drop_handle(handle);
    });
    import!(&host, ctx, "cb_drop", |c, handle: u32| -> u32 {
        c.drop_handle(handle) as u32
    });
    import!(&host, ctx, "error_take", |c| -> u32 {
        let mut session = c.session.borrow_mut();
        match session.take_exception() {
            Some(err) => session.intern_text(&err.to_string()).0,
            None => 0,
        }
    });
    import!(
        &host,
        ctx,
        "make_closure",
        |c, fn_id: u32, dtor_id: u32, ctx_a: u32, ctx_b: u32, mutable: u32| -> u32 {
            let kind = if mutable != 0 {
                ClosureKind::Mutable
            } else {
                ClosureKind::Immutable
            };
            c.session
                .borrow_mut()
                .wrap_closure(kind, fn_id, dtor_id, ctx_a, ctx_b)
                .0
        }
    );

    // scheduling
    import!(
        &host,
        ctx,
        "schedule_timeout",
        |c, cb: u32, delay_ms: u32| -> u32 {
            match HostContext::schedule(&c, cb, ScheduleKind::Timeout(delay_ms)) {
                Ok(id) => id,
                Err(err) => c.session.borrow_mut().guarded(0, |_| Err(err)),
            }
        }
    );
    import!(&host, ctx, "schedule_frame", |c, cb: u32| -> u32 {
        match HostContext::schedule(&c, cb, ScheduleKind::Frame) {
            Ok(id) => id,
            Err(err) => c.session.borrow_mut().guarded(0, |_| Err(err)),
        }
    });
    import!(&host, ctx, "schedule_idle", |c, cb: u32| -> u32 {
        match HostContext::schedule(&c, cb, ScheduleKind::Idle) {
            Ok(id) => id,
            Err(err) => c.session.borrow_mut().guarded(0, |_| Err(err)),
        }
    });
    import!(&host, ctx, "cancel_task", |c, id: u32| {
        if let Err(err) = c.cancel(id) {
            c.session.borrow_mut().guarded((), |_| Err(err));
        }
    });

    // tree edits, buffered until edit_flush
    import!(
        &host,
        ctx,
        "edit_create_element",
        |c, ptr: u32, len: u32, low: u32, high: u32| {
            let op = c.read_text(ptr, len).map(|tag| EditOp::CreateElement {
                tag,
                id: NodeId::from_parts(low, high),
            });
            c.enqueue(op);
        }
    );
    import!(
        &host,
        ctx,
        "edit_create_element_ns",
        |c, ptr: u32, len: u32, low: u32, high: u32, ns_ptr: u32, ns_len: u32| {
            let op = c.read_text(ptr, len).and_then(|tag| {
                Ok(EditOp::CreateElementNs {
                    tag,
                    id: NodeId::from_parts(low, high),
                    namespace: c.read_text(ns_ptr, ns_len)?,
                })
            });
            c.enqueue(op);
        }
    );
    import!(
        &host,
        ctx,
        "edit_create_text",
        |c, ptr: u32, len: u32, low: u32, high: u32| {
            let op = c.read_text(ptr, len).map(|text| EditOp::CreateTextNode {
                text,
                id: NodeId::from_parts(low, high),
            });
            c.enqueue(op);
        }
    );
    import!(
        &host,
        ctx,
        "edit_create_placeholder",
        |c, low: u32, high: u32| {
            c.enqueue(Ok(EditOp::CreatePlaceholder {
                id: NodeId::from_parts(low, high),
            }));
        }
    );
    import!(&host, ctx, "edit_push_root", |c, low: u32, high: u32| {
        c.enqueue(Ok(EditOp::PushRoot {
            id: NodeId::from_parts(low, high),
        }));
    });
    import!(&host, ctx, "edit_append_children", |c, count: u32| {
        c.enqueue(Ok(EditOp::AppendChildren { count }));
    });
    import!(
        &host,
        ctx,
        "edit_replace_with",
        |c, low: u32, high: u32, count: u32| {
            c.enqueue(Ok(EditOp::ReplaceWith {
                id: NodeId::from_parts(low, high),
                count,
            }));
        }
    );
    import!(
        &host,
        ctx,
        "edit_insert_after",
        |c, low: u32, high: u32, count: u32| {
            c.enqueue(Ok(EditOp::InsertAfter {
                id: NodeId::from_parts(low, high),
                count,
            }));
        }
    );
    import!(
        &host,
        ctx,
        "edit_insert_before",
        |c, low: u32, high: u32, count: u32| {
            c.enqueue(Ok(EditOp::InsertBefore {
                id: NodeId::from_parts(low, high),
                count,
            }));
        }
    );
    import!(&host, ctx, "edit_remove", |c, low: u32, high: u32| {
        c.enqueue(Ok(EditOp::Remove {
            id: NodeId::from_parts(low, high),
        }));
    });
    import!(
        &host,
        ctx,
        "edit_set_text",
        |c, low: u32, high: u32, ptr: u32, len: u32| {
            let op = c.read_text(ptr, len).map(|text| EditOp::SetText {
                id: NodeId::from_parts(low, high),
                text,
            });
            c.enqueue(op);
        }
    );
    import!(
        &host,
        ctx,
        "edit_set_attribute",
        |c, low: u32, high: u32, name_ptr: u32, name_len: u32, val_ptr: u32, val_len: u32, ns: u32| {
            let op = c.read_text(name_ptr, name_len).and_then(|name| {
                Ok(EditOp::SetAttribute {
                    id: NodeId::from_parts(low, high),
                    name,
                    value: c.read_opt_text(val_ptr, val_len)?,
                    namespace: c.namespace(ns)?,
                })
            });
            c.enqueue(op);
        }
    );
    import!(
        &host,
        ctx,
        "edit_remove_attribute",
        |c, low: u32, high: u32, name_ptr: u32, name_len: u32, ns: u32| {
            let op = c.read_text(name_ptr, name_len).and_then(|name| {
                Ok(EditOp::RemoveAttribute {
                    id: NodeId::from_parts(low, high),
                    name,
                    namespace: c.namespace(ns)?,
                })
            });
            c.enqueue(op);
        }
    );
    import!(
        &host,
        ctx,
        "edit_new_listener",
        |c, ptr: u32, len: u32, low: u32, high: u32, cb: u32| {
            let op = c.read_text(ptr, len).map(|event| EditOp::NewEventListener {
                event,
                id: NodeId::from_parts(low, high),
                callback: Handle(cb),
            });
            c.enqueue(op);
        }
    );
    import!(
        &host,
        ctx,
        "edit_remove_listener",
        |c, low: u32, high: u32, ptr: u32, len: u32| {
            let op = c.read_text(ptr, len).map(|event| EditOp::RemoveEventListener {
                id: NodeId::from_parts(low, high),
                event,
            });
            c.enqueue(op);
        }
    );
    import!(&host, ctx, "edit_flush", |c| {
        c.flush();
    });

    let imports = Object::new();
    set(&imports, "host", host.into());
    imports
}
