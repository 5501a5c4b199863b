//! DOM-backed [`Surface`] implementation.

use trellis_bridge::closure::BridgedClosure;
use trellis_bridge::error::{BridgeError, Result};
use trellis_bridge::log;
use trellis_bridge::runtime::Surface;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::{Document, Element, Event, Node};

// Attributes whose presence alone is the signal; a "false" value means
// "remove" rather than "set to the string false".
const BOOL_ATTRS: &[&str] = &[
    "allowfullscreen",
    "allowpaymentrequest",
    "async",
    "autofocus",
    "autoplay",
    "checked",
    "controls",
    "default",
    "defer",
    "disabled",
    "formnovalidate",
    "hidden",
    "ismap",
    "itemscope",
    "loop",
    "multiple",
    "muted",
    "nomodule",
    "novalidate",
    "open",
    "playsinline",
    "readonly",
    "required",
    "reversed",
    "selected",
    "truespeed",
];

fn js_err(context: &str, err: JsValue) -> BridgeError {
    BridgeError::BoundaryRejection(format!("{context}: {err:?}"))
}

struct Listener {
    node: Node,
    event: String,
    js_callback: js_sys::Function,
    bridged: BridgedClosure,
}

/// Applies tree edits to the live document. Event payloads are not
/// marshaled; listeners invoke their closure with no arguments and the
/// engine reads whatever state it needs through its own exports.
pub struct DomSurface {
    document: Document,
    listeners: Vec<Listener>,
}

impl DomSurface {
    pub fn new(document: Document) -> Self {
        Self {
            document,
            listeners: Vec::new(),
        }
    }

    pub fn from_window() -> Result<Self> {
        let document = web_sys::window()
            .and_then(|w| w.document())
            .ok_or_else(|| BridgeError::BoundaryRejection("no document available".into()))?;
        Ok(Self::new(document))
    }

    pub fn body(&self) -> Result<Node> {
        self.document
            .body()
            .map(Into::into)
            .ok_or_else(|| BridgeError::BoundaryRejection("document has no body".into()))
    }

    fn element<'a>(&self, node: &'a Node) -> Result<&'a Element> {
        node.dyn_ref::<Element>().ok_or_else(|| {
            BridgeError::BoundaryRejection("attribute operation on a non-element node".into())
        })
    }
}

impl Surface for DomSurface {
    type Node = Node;

    fn create_element(&mut self, tag: &str, namespace: Option<&str>) -> Result<Node> {
        let element = match namespace {
            Some(ns) => self
                .document
                .create_element_ns(Some(ns), tag)
                .map_err(|e| js_err("createElementNS", e))?,
            None => self
                .document
                .create_element(tag)
                .map_err(|e| js_err("createElement", e))?,
        };
        Ok(element.into())
    }

    fn create_text(&mut self, text: &str) -> Result<Node> {
        Ok(self.document.create_text_node(text).into())
    }

    fn create_placeholder(&mut self) -> Result<Node> {
        let marker = self
            .document
            .create_element("pre")
            .map_err(|e| js_err("createElement", e))?;
        marker
            .set_attribute("hidden", "")
            .map_err(|e| js_err("setAttribute", e))?;
        Ok(marker.into())
    }

    fn append_child(&mut self, parent: &Node, child: &Node) -> Result<()> {
        parent
            .append_child(child)
            .map(|_| ())
            .map_err(|e| js_err("appendChild", e))
    }

    fn insert_before(&mut self, anchor: &Node, nodes: &[Node]) -> Result<()> {
        let parent = anchor
            .parent_node()
            .ok_or_else(|| BridgeError::BoundaryRejection("anchor has no parent".into()))?;
        for node in nodes {
            parent
                .insert_before(node, Some(anchor))
                .map_err(|e| js_err("insertBefore", e))?;
        }
        Ok(())
    }

    fn insert_after(&mut self, anchor: &Node, nodes: &[Node]) -> Result<()> {
        let parent = anchor
            .parent_node()
            .ok_or_else(|| BridgeError::BoundaryRejection("anchor has no parent".into()))?;
        let next = anchor.next_sibling();
        for node in nodes {
            parent
                .insert_before(node, next.as_ref())
                .map_err(|e| js_err("insertBefore", e))?;
        }
        Ok(())
    }

    fn replace_with(&mut self, target: &Node, nodes: &[Node]) -> Result<()> {
        self.insert_after(target, nodes)?;
        self.detach(target)
    }

    fn detach(&mut self, node: &Node) -> Result<()> {
        if let Some(parent) = node.parent_node() {
            parent
                .remove_child(node)
                .map_err(|e| js_err("removeChild", e))?;
        }
        Ok(())
    }

    fn set_text(&mut self, node: &Node, text: &str) -> Result<()> {
        node.set_text_content(Some(text));
        Ok(())
    }

    fn set_attribute(
        &mut self,
        node: &Node,
        name: &str,
        value: &str,
        namespace: Option<&str>,
    ) -> Result<()> {
        if namespace == Some("style") {
            let styled = node.dyn_ref::<web_sys::HtmlElement>().ok_or_else(|| {
                BridgeError::BoundaryRejection("style attribute on a non-html element".into())
            })?;
            return styled
                .style()
                .set_property(name, value)
                .map_err(|e| js_err("style.setProperty", e));
        }
        if let Some(ns) = namespace {
            return self
                .element(node)?
                .set_attribute_ns(Some(ns), name, value)
                .map_err(|e| js_err("setAttributeNS", e));
        }

        // properties the browser treats as live state, not attributes
        if let Some(input) = node.dyn_ref::<web_sys::HtmlInputElement>() {
            match name {
                "value" => {
                    input.set_value(value);
                    return Ok(());
                }
                "checked" => {
                    input.set_checked(value == "true");
                    return Ok(());
                }
                _ => {}
            }
        }
        let element = self.element(node)?;
        if value == "false" && BOOL_ATTRS.contains(&name) {
            element
                .remove_attribute(name)
                .map_err(|e| js_err("removeAttribute", e))
        } else {
            element
                .set_attribute(name, value)
                .map_err(|e| js_err("setAttribute", e))
        }
    }

    fn remove_attribute(&mut self, node: &Node, name: &str, namespace: Option<&str>) -> Result<()> {
        let element = self.element(node)?;
        match namespace {
            Some(ns) => element
                .remove_attribute_ns(Some(ns), name)
                .map_err(|e| js_err("removeAttributeNS", e)),
            None => element
                .remove_attribute(name)
                .map_err(|e| js_err("removeAttribute", e)),
        }
    }

    fn add_listener(&mut self, node: &Node, event: &str, callback: BridgedClosure) -> Result<()> {
        let bridged = callback.clone();
        let js_callback = Closure::<dyn FnMut(Event)>::new(move |_event: Event| {
            if let Err(err) = bridged.invoke(&[]) {
                log::error!("listener invocation failed: {err}");
            }
        })
        .into_js_value()
        .unchecked_into::<js_sys::Function>();
        node.add_event_listener_with_callback(event, &js_callback)
            .map_err(|e| js_err("addEventListener", e))?;
        self.listeners.push(Listener {
            node: node.clone(),
            event: event.to_string(),
            js_callback,
            bridged: callback,
        });
        Ok(())
    }

    fn remove_listener(&mut self, node: &Node, event: &str) -> Result<Option<BridgedClosure>> {
        let position = self
            .listeners
            .iter()
            .position(|l| l.event == event && l.node == *node);
        match position {
            Some(position) => {
                let listener = self.listeners.swap_remove(position);
                listener
                    .node
                    .remove_event_listener_with_callback(&listener.event, &listener.js_callback)
                    .map_err(|e| js_err("removeEventListener", e))?;
                Ok(Some(listener.bridged))
            }
            None => Ok(None),
        }
    }
}
