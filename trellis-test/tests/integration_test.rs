use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use trellis_bridge::closure::{ClosureKind, EngineHooks, RawWord, SharedHooks};
use trellis_bridge::marshal::{decode_string, encode_string, NodeId, TextArg};
use trellis_bridge::runtime::{apply_batch, EditOp, Scheduler};
use trellis_bridge::{BridgeError, Config, Handle, HandleTable, ProtocolFault, Session, Value};
use trellis_test::*;
use wasm_bindgen_test::*;

fn el(tag: &str, id: u64) -> EditOp {
    EditOp::CreateElement {
        tag: tag.into(),
        id: NodeId(id),
    }
}

fn txt(text: &str, id: u64) -> EditOp {
    EditOp::CreateTextNode {
        text: text.into(),
        id: NodeId(id),
    }
}

fn append(count: u32) -> EditOp {
    EditOp::AppendChildren { count }
}

#[wasm_bindgen_test(unsupported = test)]
fn handles_never_alias_and_reserved_band_is_excluded() {
    let mut table: HandleTable<Value<u64>> = HandleTable::with_layout(
        4,
        vec![Value::Undefined, Value::Null, Value::Bool(true), Value::Bool(false)],
    );
    let mut live: HashSet<Handle> = HashSet::new();
    let mut counter = 0u64;
    // interleave allocations and releases, including immediate reuse
    for round in 0..50 {
        for _ in 0..=(round % 4) {
            let handle = table.allocate(Value::Node(counter));
            counter += 1;
            assert!(!table.is_reserved(handle), "allocate returned {handle}");
            assert!(live.insert(handle), "handle {handle} aliased a live slot");
        }
        if round % 3 == 0 {
            let victim = live.iter().next().copied();
            if let Some(handle) = victim {
                live.remove(&handle);
                table.release(handle).unwrap();
            }
        }
    }
    for &handle in &live {
        assert!(table.resolve(handle).is_ok());
    }
}

#[wasm_bindgen_test(unsupported = test)]
fn wide_ids_round_trip_through_half_words() {
    for id in [0u64, 1, u32::MAX as u64, u32::MAX as u64 + 1, u64::MAX] {
        let (low, high) = NodeId(id).to_parts();
        assert_eq!(NodeId::from_parts(low, high), NodeId(id));
    }
}

#[wasm_bindgen_test(unsupported = test)]
fn strings_survive_the_boundary() {
    let (mut memory, mut alloc) = shared_memory(4096);
    for text in ["plain ascii", "caf\u{e9}", "\u{1f600}\u{1f680}", "e\u{301}\u{200d}x", ""] {
        let (ptr, len) = encode_string(&mut memory, &mut alloc, text).unwrap();
        assert_eq!(decode_string(&memory, ptr, len).unwrap(), text);
    }
}

#[wasm_bindgen_test(unsupported = test)]
fn truncated_multibyte_sequences_are_rejected() {
    let (mut memory, mut alloc) = shared_memory(256);
    let (ptr, len) = encode_string(&mut memory, &mut alloc, "\u{1f600}").unwrap();
    assert_eq!(len, 4);
    // cutting the emoji in half must fail loudly, not substitute characters
    assert_eq!(
        decode_string(&memory, ptr, len - 2),
        Err(BridgeError::InvalidEncoding { ptr, len: len - 2 })
    );
}

#[wasm_bindgen_test(unsupported = test)]
fn interned_strings_resolve_by_handle() {
    let (memory, _alloc) = shared_memory(8);
    let (mut session, _surface, _engine) = session();
    let handle = session.intern_text("stored once");
    let arg = TextArg::from_raw(0, handle.0);
    assert_eq!(
        &*arg.resolve(&memory, session.values()).unwrap(),
        "stored once"
    );
}

#[wasm_bindgen_test(unsupported = test)]
fn closure_destructor_fires_exactly_once() {
    let (mut session, _surface, engine) = session();
    let handle = session.wrap_closure(ClosureKind::Mutable, 5, 11, 1000, 2000);
    let closure = session.callable(handle).unwrap();
    for i in 0..4 {
        closure.invoke(&[i, i * 2]).unwrap();
    }
    assert_eq!(engine.invocations.borrow().len(), 4);
    assert!(engine.destroyed.borrow().is_empty());

    session.drop_ref(handle).unwrap();
    assert_eq!(engine.destroyed.borrow().as_slice(), &[(11, 1000, 2000)]);
    assert_eq!(closure.invoke(&[]), Err(BridgeError::ClosureReleased));
    assert_eq!(engine.destroyed.borrow().len(), 1);
}

#[wasm_bindgen_test(unsupported = test)]
fn a_div_containing_hi() {
    let (mut session, mut surface, _engine) = session();
    apply_batch(
        &mut session,
        &mut surface,
        &[el("div", 1), txt("hi", 2), append(1), append(1)],
    )
    .unwrap();
    assert_eq!(surface.render(), "<div>hi</div>");
}

#[wasm_bindgen_test(unsupported = test)]
fn namespaced_elements_and_placeholders() {
    let (mut session, mut surface, _engine) = session();
    apply_batch(
        &mut session,
        &mut surface,
        &[
            EditOp::CreateElementNs {
                tag: "svg".into(),
                id: NodeId(1),
                namespace: "http://www.w3.org/2000/svg".into(),
            },
            EditOp::CreatePlaceholder { id: NodeId(2) },
            append(1),
            append(1),
        ],
    )
    .unwrap();
    let svg = surface.children(MockSurface::ROOT)[0];
    assert_eq!(surface.namespace(svg), Some("http://www.w3.org/2000/svg"));
    assert_eq!(surface.render(), "<svg><!----></svg>");
}

#[wasm_bindgen_test(unsupported = test)]
fn attribute_removal_is_idempotent() {
    let (mut session, mut surface, _engine) = session();
    apply_batch(&mut session, &mut surface, &[el("div", 1), append(1)]).unwrap();
    apply_batch(
        &mut session,
        &mut surface,
        &[EditOp::SetAttribute {
            id: NodeId(1),
            name: "class".into(),
            value: Some("x".into()),
            namespace: None,
        }],
    )
    .unwrap();
    assert_eq!(surface.render(), "<div class=\"x\"></div>");

    let remove = EditOp::RemoveAttribute {
        id: NodeId(1),
        name: "class".into(),
        namespace: None,
    };
    apply_batch(&mut session, &mut surface, &[remove.clone()]).unwrap();
    apply_batch(&mut session, &mut surface, &[remove]).unwrap();
    assert_eq!(surface.render(), "<div></div>");
}

#[wasm_bindgen_test(unsupported = test)]
fn replace_with_two_pushed_roots() {
    let (mut session, mut surface, _engine) = session();
    apply_batch(&mut session, &mut surface, &[el("a", 1), append(1)]).unwrap();
    apply_batch(
        &mut session,
        &mut surface,
        &[
            el("b", 2),
            el("c", 3),
            EditOp::ReplaceWith {
                id: NodeId(1),
                count: 2,
            },
        ],
    )
    .unwrap();
    // first pushed ends up first sibling; a successful batch implies the
    // scratch stack drained back to its seed
    assert_eq!(surface.render(), "<b></b><c></c>");
}

#[wasm_bindgen_test(unsupported = test)]
fn overdraining_is_checked_and_mutates_nothing() {
    let (mut session, mut surface, _engine) = session();
    let registered_before = session.registry().len();
    let err = apply_batch(
        &mut session,
        &mut surface,
        &[EditOp::ReplaceWith {
            id: NodeId(1),
            count: 2,
        }],
    )
    .unwrap_err();
    assert_eq!(
        err,
        BridgeError::Implementation(ProtocolFault::StackUnderflow {
            requested: 2,
            available: 0,
        })
    );
    assert_eq!(session.registry().len(), registered_before);
    assert_eq!(surface.render(), "");
}

#[wasm_bindgen_test(unsupported = test)]
fn listeners_fire_into_the_engine() {
    let (mut session, mut surface, engine) = session();
    let handle = session.wrap_closure(ClosureKind::Mutable, 3, 9, 7, 8);
    apply_batch(
        &mut session,
        &mut surface,
        &[
            el("button", 1),
            append(1),
            EditOp::NewEventListener {
                event: "click".into(),
                id: NodeId(1),
                callback: handle,
            },
        ],
    )
    .unwrap();

    let button = surface.children(MockSurface::ROOT)[0];
    surface.listener(button, "click").unwrap().invoke(&[42]).unwrap();
    assert_eq!(engine.invocations.borrow().as_slice(), &[(3, 7, 8, vec![42])]);

    // detach hands the listener's reference back; dropping it is advisory
    // while the engine handle remains
    let detached = apply_batch(
        &mut session,
        &mut surface,
        &[EditOp::RemoveEventListener {
            id: NodeId(1),
            event: "click".into(),
        }],
    )
    .unwrap();
    for closure in detached {
        assert!(!closure.drop_ref().unwrap());
    }
    assert!(engine.destroyed.borrow().is_empty());
    session.drop_ref(handle).unwrap();
    assert_eq!(engine.destroyed.borrow().as_slice(), &[(9, 7, 8)]);
}

#[wasm_bindgen_test(unsupported = test)]
fn cloned_callables_share_the_underlying_state() {
    let (mut session, _surface, engine) = session();
    let handle = session.wrap_closure(ClosureKind::Immutable, 1, 2, 0, 0);
    let dup_handle = session.clone_ref(handle).unwrap();
    assert_ne!(handle, dup_handle);

    session.drop_ref(handle).unwrap();
    assert!(engine.destroyed.borrow().is_empty());
    session.callable(dup_handle).unwrap().invoke(&[]).unwrap();
    session.drop_ref(dup_handle).unwrap();
    assert_eq!(engine.destroyed.borrow().len(), 1);
}

#[wasm_bindgen_test(unsupported = test)]
fn scheduled_callbacks_fire_unless_cancelled() {
    let (mut session, _surface, engine) = session();
    let keep_handle = session.wrap_closure(ClosureKind::Mutable, 1, 2, 0, 0);
    let keep = session.callable(keep_handle).unwrap();
    let drop_handle = session.wrap_closure(ClosureKind::Mutable, 3, 4, 5, 0);
    let drop_early = session.callable(drop_handle).unwrap();

    // a pending task owns one reference; a fired task releases it after
    // invoking, a cancelled one releases it at cancel time
    let mut scheduler = TestScheduler::new();
    let kept = keep.retain().unwrap();
    let _task = scheduler
        .schedule_timeout(
            Box::new(move || {
                let _ = kept.invoke(&[1]);
                let _ = kept.drop_ref();
            }),
            16,
        )
        .unwrap();
    let cancelled_cb = drop_early.retain().unwrap();
    let cancelled = scheduler
        .schedule_frame(Box::new(move || {
            let _ = cancelled_cb.invoke(&[2]);
            let _ = cancelled_cb.drop_ref();
        }))
        .unwrap();

    scheduler.cancel(cancelled).unwrap();
    assert!(!drop_early.drop_ref().unwrap());
    assert_eq!(scheduler.pending(), 1);
    scheduler.run_all();

    let invocations: Vec<u32> = engine
        .invocations
        .borrow()
        .iter()
        .map(|(fn_id, ..)| *fn_id)
        .collect();
    assert_eq!(invocations, vec![1]);

    // with the task's reference released at cancel, the engine handle is
    // the last one standing
    assert!(engine.destroyed.borrow().is_empty());
    session.drop_ref(drop_handle).unwrap();
    assert_eq!(engine.destroyed.borrow().as_slice(), &[(4, 5, 0)]);
}

#[wasm_bindgen_test(unsupported = test)]
fn destructors_may_reenter_a_shared_session() {
    use std::cell::Cell;

    // Engine whose teardown calls back into the host to release a handle it
    // still holds, the way guest drop glue reenters the boundary imports.
    #[derive(Default)]
    struct ReenteringEngine {
        session: RefCell<Option<Rc<RefCell<Session<MockNodeRef>>>>>,
        held: Cell<Option<Handle>>,
        destroyed: RefCell<Vec<u32>>,
    }

    impl EngineHooks for ReenteringEngine {
        fn invoke(
            &self,
            _: u32,
            _: RawWord,
            _: RawWord,
            _: &[RawWord],
        ) -> trellis_bridge::Result<()> {
            Ok(())
        }
        fn destroy(&self, dtor_id: u32, _: RawWord, _: RawWord) -> trellis_bridge::Result<()> {
            self.destroyed.borrow_mut().push(dtor_id);
            if let Some(handle) = self.held.take() {
                let cell = self.session.borrow().clone().unwrap();
                let detached = cell.borrow_mut().detach_ref(handle)?;
                if let Some(closure) = detached {
                    closure.drop_ref()?;
                }
            }
            Ok(())
        }
    }

    let engine = Rc::new(ReenteringEngine::default());
    let hooks: SharedHooks = engine.clone();
    let session = Rc::new(RefCell::new(Session::new(Config::default(), hooks)));
    *engine.session.borrow_mut() = Some(Rc::clone(&session));

    let inner = session
        .borrow_mut()
        .wrap_closure(ClosureKind::Immutable, 0, 1, 0, 0);
    let outer = session
        .borrow_mut()
        .wrap_closure(ClosureKind::Immutable, 0, 2, 0, 0);
    engine.held.set(Some(inner));

    // release the outer handle the way a host import does: take the value
    // out under the borrow, run teardown only after releasing it
    let closure = session.borrow_mut().detach_ref(outer).unwrap().unwrap();
    assert!(closure.drop_ref().unwrap());

    // the outer destructor reentered the session and tore down the inner
    // closure without tripping the shared cell
    assert_eq!(engine.destroyed.borrow().as_slice(), &[2, 1]);
    assert!(matches!(
        session.borrow().values().resolve(inner),
        Err(BridgeError::InvalidHandle(_))
    ));
}

#[wasm_bindgen_test(unsupported = test)]
fn guarded_calls_capture_the_error() {
    let (mut session, _surface, _engine) = session();
    let fallback = session.undefined();
    let result = session.guarded(fallback, |s| {
        s.values_mut().resolve(Handle(9999)).map(|_| Handle(0))
    });
    assert_eq!(result, fallback);
    assert_eq!(
        session.take_exception(),
        Some(BridgeError::InvalidHandle(Handle(9999)))
    );
    assert_eq!(session.take_exception(), None);
}

#[wasm_bindgen_test(unsupported = test)]
fn transient_band_restored_after_a_failing_scope() {
    let (mut session, _surface, _engine) = session();
    let mut seen = Handle(0);
    let err = session
        .values_mut()
        .scoped_transient(Value::Text("ephemeral".into()), |table, handle| {
            seen = handle;
            table.resolve(handle)?;
            Err::<(), _>(BridgeError::BoundaryRejection("forced".into()))
        })
        .unwrap_err();
    assert_eq!(err, BridgeError::BoundaryRejection("forced".into()));
    // the slot was vacated despite the error, and the next scope reuses it
    assert!(matches!(
        session.values().resolve(seen),
        Err(BridgeError::InvalidHandle(handle)) if handle == seen
    ));
    session
        .values_mut()
        .scoped_transient(Value::Null, |_, handle| {
            assert_eq!(handle, seen);
            Ok(())
        })
        .unwrap();
}
