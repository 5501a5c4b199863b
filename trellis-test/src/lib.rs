//! Shared test doubles for the trellis workspace: an arena-backed mock
//! surface, a recording mock engine, an in-memory linear memory with its
//! allocator, and a manually pumped scheduler.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use itertools::Itertools;
use trellis_bridge::closure::{BridgedClosure, EngineHooks, RawWord, SharedHooks};
use trellis_bridge::error::{BridgeError, ProtocolFault, Result};
use trellis_bridge::marshal::{GuestAllocator, LinearMemory};
use trellis_bridge::runtime::{Scheduler, Surface, TaskFn};
use trellis_bridge::{Config, Session};

/// Engine stand-in that records every callback-table interaction. Records
/// sit behind interior mutability because the hooks are shared with every
/// callable the session hands out.
#[derive(Default)]
pub struct MockEngine {
    pub invocations: RefCell<Vec<(u32, RawWord, RawWord, Vec<RawWord>)>>,
    pub destroyed: RefCell<Vec<(u32, RawWord, RawWord)>>,
    pub fail_invoke: Cell<bool>,
}

impl EngineHooks for MockEngine {
    fn invoke(&self, fn_id: u32, ctx_a: RawWord, ctx_b: RawWord, args: &[RawWord]) -> Result<()> {
        self.invocations
            .borrow_mut()
            .push((fn_id, ctx_a, ctx_b, args.to_vec()));
        if self.fail_invoke.get() {
            Err(BridgeError::BoundaryRejection("mock failure".into()))
        } else {
            Ok(())
        }
    }
    fn destroy(&self, dtor_id: u32, ctx_a: RawWord, ctx_b: RawWord) -> Result<()> {
        self.destroyed.borrow_mut().push((dtor_id, ctx_a, ctx_b));
        Ok(())
    }
}

/// A session over the mock engine plus a fresh surface, mounted at the
/// surface's root node.
pub fn session() -> (Session<MockNodeRef>, MockSurface, Rc<MockEngine>) {
    let engine = Rc::new(MockEngine::default());
    let hooks: SharedHooks = engine.clone();
    let mut session = Session::new(Config::default(), hooks);
    let surface = MockSurface::new();
    session
        .mount(MockSurface::ROOT)
        .expect("mounting a fresh session cannot fail");
    (session, surface, engine)
}

/// Shared byte buffer exposed as two views, the way the real boundary
/// shares one exported memory between reads/writes and allocation. The
/// allocator is a bump allocator that never reuses space, so every realloc
/// moves.
pub fn shared_memory(size: usize) -> (VecMemory, VecAllocator) {
    let bytes = Rc::new(RefCell::new(vec![0u8; size]));
    (
        VecMemory {
            bytes: Rc::clone(&bytes),
        },
        VecAllocator {
            bytes,
            next: Cell::new(8),
        },
    )
}

pub struct VecMemory {
    bytes: Rc<RefCell<Vec<u8>>>,
}

impl LinearMemory for VecMemory {
    fn read(&self, ptr: u32, len: u32) -> Result<Vec<u8>> {
        let bytes = self.bytes.borrow();
        let start = ptr as usize;
        let end = start.saturating_add(len as usize);
        if end > bytes.len() {
            return Err(BridgeError::Implementation(
                ProtocolFault::MemoryOutOfBounds {
                    ptr,
                    len,
                    buffer_len: bytes.len(),
                },
            ));
        }
        Ok(bytes[start..end].to_vec())
    }
    fn write(&mut self, ptr: u32, data: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.borrow_mut();
        let start = ptr as usize;
        let end = start.saturating_add(data.len());
        if end > bytes.len() {
            return Err(BridgeError::Implementation(
                ProtocolFault::MemoryOutOfBounds {
                    ptr,
                    len: data.len() as u32,
                    buffer_len: bytes.len(),
                },
            ));
        }
        bytes[start..end].copy_from_slice(data);
        Ok(())
    }
}

pub struct VecAllocator {
    bytes: Rc<RefCell<Vec<u8>>>,
    next: Cell<u32>,
}

impl GuestAllocator for VecAllocator {
    fn alloc(&mut self, size: u32, _align: u32) -> Result<u32> {
        let ptr = self.next.get();
        self.next.set(ptr + size);
        Ok(ptr)
    }
    fn realloc(&mut self, ptr: u32, old_size: u32, new_size: u32, align: u32) -> Result<u32> {
        let fresh = self.alloc(new_size, align)?;
        let keep = old_size.min(new_size) as usize;
        let mut bytes = self.bytes.borrow_mut();
        let moved = bytes[ptr as usize..ptr as usize + keep].to_vec();
        bytes[fresh as usize..fresh as usize + keep].copy_from_slice(&moved);
        Ok(fresh)
    }
}

/// Arena index of a mock surface node.
pub type MockNodeRef = usize;

#[derive(Debug)]
enum MockKind {
    Root,
    Element {
        tag: String,
        namespace: Option<String>,
    },
    Text(String),
    Placeholder,
}

struct MockNode {
    kind: MockKind,
    parent: Option<MockNodeRef>,
    children: Vec<MockNodeRef>,
    attrs: BTreeMap<String, String>,
    listeners: HashMap<String, BridgedClosure>,
}

impl MockNode {
    fn new(kind: MockKind) -> Self {
        Self {
            kind,
            parent: None,
            children: Vec::new(),
            attrs: BTreeMap::new(),
            listeners: HashMap::new(),
        }
    }
}

/// In-memory tree with enough fidelity to assert on structure, attributes
/// and listeners. Rendering is a compact HTML-ish string for readable
/// assertions.
pub struct MockSurface {
    arena: Vec<MockNode>,
}

impl Default for MockSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSurface {
    pub const ROOT: MockNodeRef = 0;

    pub fn new() -> Self {
        Self {
            arena: vec![MockNode::new(MockKind::Root)],
        }
    }

    fn push(&mut self, kind: MockKind) -> MockNodeRef {
        self.arena.push(MockNode::new(kind));
        self.arena.len() - 1
    }

    fn unlink(&mut self, node: MockNodeRef) {
        if let Some(parent) = self.arena[node].parent.take() {
            self.arena[parent].children.retain(|&c| c != node);
        }
    }

    fn slot(&self, node: MockNodeRef) -> (MockNodeRef, usize) {
        let parent = self.arena[node]
            .parent
            .unwrap_or_else(|| panic!("node {node} has no parent"));
        let pos = self.arena[parent]
            .children
            .iter()
            .position(|&c| c == node)
            .unwrap_or_else(|| panic!("node {node} missing from its parent"));
        (parent, pos)
    }

    fn splice(&mut self, parent: MockNodeRef, pos: usize, nodes: &[MockNodeRef]) {
        for (offset, &node) in nodes.iter().enumerate() {
            self.unlink(node);
            self.arena[node].parent = Some(parent);
            self.arena[parent].children.insert(pos + offset, node);
        }
    }

    pub fn children(&self, node: MockNodeRef) -> &[MockNodeRef] {
        &self.arena[node].children
    }

    pub fn tag(&self, node: MockNodeRef) -> &str {
        match &self.arena[node].kind {
            MockKind::Element { tag, .. } => tag,
            other => panic!("node {node} is {other:?}, not an element"),
        }
    }

    pub fn namespace(&self, node: MockNodeRef) -> Option<&str> {
        match &self.arena[node].kind {
            MockKind::Element { namespace, .. } => namespace.as_deref(),
            other => panic!("node {node} is {other:?}, not an element"),
        }
    }

    pub fn text(&self, node: MockNodeRef) -> &str {
        match &self.arena[node].kind {
            MockKind::Text(text) => text,
            other => panic!("node {node} is {other:?}, not text"),
        }
    }

    pub fn attr(&self, node: MockNodeRef, name: &str) -> Option<&str> {
        self.arena[node].attrs.get(name).map(String::as_str)
    }

    pub fn listener(&self, node: MockNodeRef, event: &str) -> Option<&BridgedClosure> {
        self.arena[node].listeners.get(event)
    }

    /// Render the whole tree under the root.
    pub fn render(&self) -> String {
        self.render_node(Self::ROOT)
    }

    fn render_node(&self, node: MockNodeRef) -> String {
        let children = || {
            self.arena[node]
                .children
                .iter()
                .map(|&c| self.render_node(c))
                .join("")
        };
        match &self.arena[node].kind {
            MockKind::Root => children(),
            MockKind::Element { tag, .. } => {
                let attrs = self.arena[node]
                    .attrs
                    .iter()
                    .map(|(name, value)| format!(" {name}=\"{value}\""))
                    .join("");
                format!("<{tag}{attrs}>{}</{tag}>", children())
            }
            MockKind::Text(text) => text.clone(),
            MockKind::Placeholder => "<!---->".to_string(),
        }
    }
}

impl Surface for MockSurface {
    type Node = MockNodeRef;

    fn create_element(&mut self, tag: &str, namespace: Option<&str>) -> Result<MockNodeRef> {
        Ok(self.push(MockKind::Element {
            tag: tag.to_string(),
            namespace: namespace.map(str::to_string),
        }))
    }
    fn create_text(&mut self, text: &str) -> Result<MockNodeRef> {
        Ok(self.push(MockKind::Text(text.to_string())))
    }
    fn create_placeholder(&mut self) -> Result<MockNodeRef> {
        Ok(self.push(MockKind::Placeholder))
    }

    fn append_child(&mut self, parent: &MockNodeRef, child: &MockNodeRef) -> Result<()> {
        self.unlink(*child);
        self.arena[*child].parent = Some(*parent);
        self.arena[*parent].children.push(*child);
        Ok(())
    }
    fn insert_before(&mut self, anchor: &MockNodeRef, nodes: &[MockNodeRef]) -> Result<()> {
        let (parent, pos) = self.slot(*anchor);
        self.splice(parent, pos, nodes);
        Ok(())
    }
    fn insert_after(&mut self, anchor: &MockNodeRef, nodes: &[MockNodeRef]) -> Result<()> {
        let (parent, pos) = self.slot(*anchor);
        self.splice(parent, pos + 1, nodes);
        Ok(())
    }
    fn replace_with(&mut self, target: &MockNodeRef, nodes: &[MockNodeRef]) -> Result<()> {
        let (parent, pos) = self.slot(*target);
        self.unlink(*target);
        self.splice(parent, pos, nodes);
        Ok(())
    }
    fn detach(&mut self, node: &MockNodeRef) -> Result<()> {
        self.unlink(*node);
        Ok(())
    }

    fn set_text(&mut self, node: &MockNodeRef, text: &str) -> Result<()> {
        self.arena[*node].kind = MockKind::Text(text.to_string());
        Ok(())
    }
    fn set_attribute(
        &mut self,
        node: &MockNodeRef,
        name: &str,
        value: &str,
        namespace: Option<&str>,
    ) -> Result<()> {
        let key = match namespace {
            Some(ns) => format!("{ns}:{name}"),
            None => name.to_string(),
        };
        self.arena[*node].attrs.insert(key, value.to_string());
        Ok(())
    }
    fn remove_attribute(
        &mut self,
        node: &MockNodeRef,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<()> {
        let key = match namespace {
            Some(ns) => format!("{ns}:{name}"),
            None => name.to_string(),
        };
        self.arena[*node].attrs.remove(&key);
        Ok(())
    }

    fn add_listener(
        &mut self,
        node: &MockNodeRef,
        event: &str,
        callback: BridgedClosure,
    ) -> Result<()> {
        self.arena[*node].listeners.insert(event.to_string(), callback);
        Ok(())
    }
    fn remove_listener(
        &mut self,
        node: &MockNodeRef,
        event: &str,
    ) -> Result<Option<BridgedClosure>> {
        Ok(self.arena[*node].listeners.remove(event))
    }
}

/// Scheduler pumped by hand: nothing fires until [`TestScheduler::run_all`]
/// is called, and cancelled tasks never fire.
#[derive(Default)]
pub struct TestScheduler {
    queue: Vec<(u64, TaskFn)>,
    next: u64,
}

impl TestScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn run_all(&mut self) {
        for (_, callback) in self.queue.drain(..) {
            callback();
        }
    }

    fn enqueue(&mut self, callback: TaskFn) -> u64 {
        let id = self.next;
        self.next += 1;
        self.queue.push((id, callback));
        id
    }
}

impl Scheduler for TestScheduler {
    type Task = u64;

    fn schedule_timeout(&mut self, callback: TaskFn, _delay_ms: u32) -> Result<u64> {
        Ok(self.enqueue(callback))
    }
    fn schedule_frame(&mut self, callback: TaskFn) -> Result<u64> {
        Ok(self.enqueue(callback))
    }
    fn schedule_idle(&mut self, callback: TaskFn) -> Result<u64> {
        Ok(self.enqueue(callback))
    }
    fn cancel(&mut self, task: u64) -> Result<()> {
        self.queue.retain(|(id, _)| *id != task);
        Ok(())
    }
}
