//! The mutation interpreter. Decodes an ordered stream of tree-edit
//! operations and applies them to a [`Surface`] through the node registry.
//!
//! Batch discipline: the scratch root stack is seeded with the mount root at
//! the start of every batch, create operations push the id of the node they
//! made, and composition operations (`AppendChildren`, `ReplaceWith`, the
//! sibling inserts) drain pushed entries in push order. A batch must end
//! with only the seed remaining; anything else means the engine and the
//! interpreter disagree about what was pushed.

use std::rc::Rc;

use crate::closure::BridgedClosure;
use crate::error::{fault, ProtocolFault, Result};
use crate::handle::Handle;
use crate::marshal::NodeId;
use crate::{Session, Value};

/// Host-side object model, node-level operations only. Multi-node variants
/// take their replacements in sibling order, first element leftmost.
pub trait Surface {
    type Node: Clone;

    fn create_element(&mut self, tag: &str, namespace: Option<&str>) -> Result<Self::Node>;
    fn create_text(&mut self, text: &str) -> Result<Self::Node>;
    fn create_placeholder(&mut self) -> Result<Self::Node>;

    fn append_child(&mut self, parent: &Self::Node, child: &Self::Node) -> Result<()>;
    fn insert_before(&mut self, anchor: &Self::Node, nodes: &[Self::Node]) -> Result<()>;
    fn insert_after(&mut self, anchor: &Self::Node, nodes: &[Self::Node]) -> Result<()>;
    fn replace_with(&mut self, target: &Self::Node, nodes: &[Self::Node]) -> Result<()>;
    fn detach(&mut self, node: &Self::Node) -> Result<()>;

    fn set_text(&mut self, node: &Self::Node, text: &str) -> Result<()>;
    fn set_attribute(
        &mut self,
        node: &Self::Node,
        name: &str,
        value: &str,
        namespace: Option<&str>,
    ) -> Result<()>;
    fn remove_attribute(
        &mut self,
        node: &Self::Node,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<()>;

    fn add_listener(
        &mut self,
        node: &Self::Node,
        event: &str,
        callback: BridgedClosure,
    ) -> Result<()>;
    /// Detach the listener for `(node, event)` and hand its closure back so
    /// the caller can issue an advisory drop. `None` when nothing was
    /// attached.
    fn remove_listener(&mut self, node: &Self::Node, event: &str)
        -> Result<Option<BridgedClosure>>;
}

/// One decoded tree-edit operation.
#[derive(Clone, PartialEq, Debug)]
pub enum EditOp {
    CreateElement {
        tag: Rc<str>,
        id: NodeId,
    },
    CreateElementNs {
        tag: Rc<str>,
        id: NodeId,
        namespace: Rc<str>,
    },
    CreateTextNode {
        text: Rc<str>,
        id: NodeId,
    },
    CreatePlaceholder {
        id: NodeId,
    },
    PushRoot {
        id: NodeId,
    },
    AppendChildren {
        count: u32,
    },
    ReplaceWith {
        id: NodeId,
        count: u32,
    },
    InsertAfter {
        id: NodeId,
        count: u32,
    },
    InsertBefore {
        id: NodeId,
        count: u32,
    },
    Remove {
        id: NodeId,
    },
    SetText {
        id: NodeId,
        text: Rc<str>,
    },
    SetAttribute {
        id: NodeId,
        name: Rc<str>,
        /// `None` is the removal sentinel.
        value: Option<Rc<str>>,
        namespace: Option<Rc<str>>,
    },
    RemoveAttribute {
        id: NodeId,
        name: Rc<str>,
        namespace: Option<Rc<str>>,
    },
    NewEventListener {
        event: Rc<str>,
        id: NodeId,
        callback: Handle,
    },
    RemoveEventListener {
        id: NodeId,
        event: Rc<str>,
    },
}

/// Apply one batch in stream order. Any error aborts the batch; operations
/// already applied stay applied, the offending operation leaves the registry
/// and surface untouched.
///
/// Returns the closures detached by `RemoveEventListener` ops. Each still
/// owns the reference the listener held; the caller issues the advisory
/// drop once it holds no shared borrows, because a destructor runs engine
/// code that may reenter the host.
pub fn apply_batch<S: Surface>(
    session: &mut Session<S::Node>,
    surface: &mut S,
    ops: &[EditOp],
) -> Result<Vec<BridgedClosure>> {
    let mut batch = Batch {
        session,
        surface,
        stack: vec![NodeId::ROOT],
        detached: Vec::new(),
    };
    log::debug!("applying batch of {} ops", ops.len());
    for op in ops {
        batch.apply(op)?;
    }
    batch.finish()
}

struct Batch<'a, S: Surface> {
    session: &'a mut Session<S::Node>,
    surface: &'a mut S,
    stack: Vec<NodeId>,
    detached: Vec<BridgedClosure>,
}

impl<S: Surface> Batch<'_, S> {
    fn apply(&mut self, op: &EditOp) -> Result<()> {
        log::trace!("op {op:?}");
        match op {
            EditOp::CreateElement { tag, id } => {
                let node = self.surface.create_element(tag, None)?;
                self.created(*id, node)
            }
            EditOp::CreateElementNs { tag, id, namespace } => {
                let node = self.surface.create_element(tag, Some(namespace))?;
                self.created(*id, node)
            }
            EditOp::CreateTextNode { text, id } => {
                let node = self.surface.create_text(text)?;
                self.created(*id, node)
            }
            EditOp::CreatePlaceholder { id } => {
                let node = self.surface.create_placeholder()?;
                self.created(*id, node)
            }
            EditOp::PushRoot { id } => {
                // validate eagerly so a diverged id fails here, not at the
                // consuming op
                self.session.registry.get(*id)?;
                self.stack.push(*id);
                Ok(())
            }
            EditOp::AppendChildren { count } => {
                let children = self.drain(*count)?;
                let parent_id = *self
                    .stack
                    .last()
                    .ok_or_else(|| fault(ProtocolFault::StackUnderflow {
                        requested: 1,
                        available: 0,
                    }))?;
                let parent = self.node(parent_id)?;
                for child_id in children {
                    let child = self.node(child_id)?;
                    self.surface.append_child(&parent, &child)?;
                }
                Ok(())
            }
            EditOp::ReplaceWith { id, count } => {
                let nodes = self.drained_nodes(*count)?;
                let target = self.node(*id)?;
                self.surface.replace_with(&target, &nodes)
            }
            EditOp::InsertAfter { id, count } => {
                let nodes = self.drained_nodes(*count)?;
                let anchor = self.node(*id)?;
                self.surface.insert_after(&anchor, &nodes)
            }
            EditOp::InsertBefore { id, count } => {
                let nodes = self.drained_nodes(*count)?;
                let anchor = self.node(*id)?;
                self.surface.insert_before(&anchor, &nodes)
            }
            EditOp::Remove { id } => {
                let handle = self.session.registry.get(*id)?;
                let node = self.node(*id)?;
                self.surface.detach(&node)?;
                self.session.registry.remove(*id)?;
                self.session.values.release(handle)?;
                Ok(())
            }
            EditOp::SetText { id, text } => {
                let node = self.node(*id)?;
                self.surface.set_text(&node, text)
            }
            EditOp::SetAttribute {
                id,
                name,
                value,
                namespace,
            } => {
                let node = self.node(*id)?;
                match value {
                    Some(value) => {
                        self.surface
                            .set_attribute(&node, name, value, namespace.as_deref())
                    }
                    None => self
                        .surface
                        .remove_attribute(&node, name, namespace.as_deref()),
                }
            }
            EditOp::RemoveAttribute { id, name, namespace } => {
                let node = self.node(*id)?;
                self.surface.remove_attribute(&node, name, namespace.as_deref())
            }
            EditOp::NewEventListener {
                event,
                id,
                callback,
            } => {
                let node = self.node(*id)?;
                let closure = {
                    let value = self.session.values.resolve(*callback)?;
                    value.as_callable(*callback)?.retain()?
                };
                self.surface.add_listener(&node, event, closure)
            }
            EditOp::RemoveEventListener { id, event } => {
                let node = self.node(*id)?;
                if let Some(closure) = self.surface.remove_listener(&node, event)? {
                    self.detached.push(closure);
                }
                Ok(())
            }
        }
    }

    // A create op registers the node and pushes its id for later
    // composition ops in the same batch.
    fn created(&mut self, id: NodeId, node: S::Node) -> Result<()> {
        if self.session.config.strict_remap && self.session.registry.contains(id) {
            return Err(fault(ProtocolFault::NodeRemapDenied(id)));
        }
        let handle = self.session.values.allocate(Value::Node(node));
        if let Some(displaced) = self.session.registry.set(id, handle) {
            self.session.values.release(displaced)?;
        }
        self.stack.push(id);
        Ok(())
    }

    fn node(&self, id: NodeId) -> Result<S::Node> {
        let handle = self.session.registry.get(id)?;
        Ok(self.session.values.resolve(handle)?.as_node(handle)?.clone())
    }

    // Pop `count` pushed ids, returned in push order. The root seed is not
    // drainable; consuming it means the engine pushed fewer entries than the
    // op expects.
    fn drain(&mut self, count: u32) -> Result<Vec<NodeId>> {
        let count = count as usize;
        let pushed = self.stack.len() - 1;
        if count > pushed {
            return Err(fault(ProtocolFault::StackUnderflow {
                requested: count,
                available: pushed,
            }));
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }

    fn drained_nodes(&mut self, count: u32) -> Result<Vec<S::Node>> {
        self.drain(count)?
            .into_iter()
            .map(|id| self.node(id))
            .collect()
    }

    fn finish(self) -> Result<Vec<BridgedClosure>> {
        let residue = self.stack.len() - 1;
        if self.stack != [NodeId::ROOT] {
            return Err(fault(ProtocolFault::StackResidue { residue }));
        }
        Ok(self.detached)
    }
}
