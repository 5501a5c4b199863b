//! Browser entry point: instantiates the engine module, wires the host
//! import table, and mounts the document body as the surface root.

use std::rc::Rc;

use trellis_bridge::log;
use trellis_bridge::{Config, Session};
use wasm_bindgen::prelude::*;

pub mod boundary;
pub mod dom;
pub mod imports;
pub mod schedule;

use boundary::{load, EngineExports, HooksProxy, SharedExports};
use dom::DomSurface;
use imports::{build_imports, HostContext};
use schedule::WebScheduler;

#[global_allocator]
static ALLOC: wee_alloc::WeeAlloc = wee_alloc::WeeAlloc::INIT;

// Engine artifact served next to the page when `init` gets no explicit
// input.
const DEFAULT_ARTIFACT: &str = "./trellis_engine_bg.wasm";

fn to_js_err(err: trellis_bridge::BridgeError) -> JsValue {
    JsValue::from_str(&err.to_string())
}

/// A running engine instance bound to the current document.
#[wasm_bindgen]
pub struct Runtime {
    ctx: Rc<HostContext>,
}

#[wasm_bindgen]
impl Runtime {
    /// Drain the most recent error captured while the engine was driving
    /// the host.
    #[wasm_bindgen]
    pub fn take_error(&self) -> Option<String> {
        self.ctx
            .session
            .borrow_mut()
            .take_exception()
            .map(|err| err.to_string())
    }
}

/// Instantiate the engine and mount it on the document body.
///
/// `input` may be a `Response`, a compiled `WebAssembly.Module`, or
/// undefined to fetch the default co-located artifact. Resolution fails on
/// malformed modules and on hosts without the required APIs; a wrong
/// `Content-Type` only costs the streaming fast path.
#[wasm_bindgen]
pub async fn init(input: JsValue) -> Result<Runtime, JsValue> {
    console_error_panic_hook::set_once();

    let input = if input.is_undefined() || input.is_null() {
        let window =
            web_sys::window().ok_or_else(|| JsValue::from_str("no window available"))?;
        wasm_bindgen_futures::JsFuture::from(window.fetch_with_str(DEFAULT_ARTIFACT)).await?
    } else {
        input
    };

    let exports: SharedExports = Rc::new(std::cell::RefCell::new(EngineExports::default()));
    let session = Session::new(Config::default(), Rc::new(HooksProxy(exports.clone())));
    let surface = DomSurface::from_window().map_err(to_js_err)?;
    let scheduler = WebScheduler::new().map_err(to_js_err)?;
    let ctx = HostContext::new(session, surface, scheduler, exports);

    let imports = build_imports(&ctx);
    let instance = load(input, &imports).await?;
    ctx.exports.borrow_mut().bind(&instance).map_err(to_js_err)?;

    {
        let mut session = ctx.session.borrow_mut();
        let body = ctx.surface.borrow().body().map_err(to_js_err)?;
        session.mount(body).map_err(to_js_err)?;
    }

    ctx.exports.borrow().run_start().map_err(to_js_err)?;
    // errors captured while the start export was driving the host fail
    // initialization instead of parking until someone polls
    if let Some(err) = ctx.session.borrow_mut().take_exception() {
        return Err(to_js_err(err));
    }
    log::debug!("engine instantiated and mounted");
    Ok(Runtime { ctx })
}
