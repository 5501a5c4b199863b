//! Instantiation of the engine module and the typed view over its exports.

use std::cell::RefCell;
use std::rc::Rc;

use js_sys::{Array, Function, Object, Promise, Reflect, Uint8Array, WebAssembly};
use trellis_bridge::closure::{EngineHooks, RawWord};
use trellis_bridge::error::{BridgeError, ProtocolFault, Result};
use trellis_bridge::log;
use trellis_bridge::marshal::{GuestAllocator, LinearMemory};
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;
use web_sys::Response;

fn js_err(context: &str, err: JsValue) -> BridgeError {
    BridgeError::BoundaryRejection(format!("{context}: {err:?}"))
}

/// Instantiate the engine module against an import object.
///
/// `Response` inputs go through streaming instantiation when the host
/// supports it; a wrong `Content-Type` falls back to buffered instantiation
/// with a warning, any other streaming failure propagates. Pre-compiled
/// modules instantiate directly.
pub async fn load(input: JsValue, imports: &Object) -> std::result::Result<WebAssembly::Instance, JsValue> {
    if input.is_instance_of::<Response>() {
        let response: Response = input.unchecked_into();
        if !streaming_supported() {
            log::debug!("WebAssembly.instantiateStreaming unavailable, instantiating buffered");
        } else {
            match instantiate_streaming(&response, imports).await {
                Ok(instance) => return Ok(instance),
                Err(err) => {
                    let content_type = response
                        .headers()
                        .get("Content-Type")
                        .ok()
                        .flatten()
                        .unwrap_or_default();
                    if content_type == "application/wasm" {
                        return Err(err);
                    }
                    log::warn!(
                        "streaming instantiation failed (Content-Type {content_type:?}), \
                         falling back to buffered instantiation"
                    );
                }
            }
        }
        let buffer = JsFuture::from(response.array_buffer()?).await?;
        let bytes = Uint8Array::new(&buffer).to_vec();
        let result = JsFuture::from(WebAssembly::instantiate_buffer(&bytes, imports)).await?;
        instance_of(&result)
    } else if input.is_instance_of::<WebAssembly::Module>() {
        let module: WebAssembly::Module = input.unchecked_into();
        let instance = JsFuture::from(WebAssembly::instantiate_module(&module, imports)).await?;
        Ok(instance.unchecked_into())
    } else {
        Err(JsValue::from_str(
            "expected a Response or a compiled WebAssembly.Module",
        ))
    }
}

// Older hosts ship WebAssembly without instantiateStreaming.
fn streaming_supported() -> bool {
    Reflect::get(&js_sys::global(), &JsValue::from_str("WebAssembly"))
        .and_then(|wasm| Reflect::get(&wasm, &JsValue::from_str("instantiateStreaming")))
        .map(|f| f.is_function())
        .unwrap_or(false)
}

async fn instantiate_streaming(
    response: &Response,
    imports: &Object,
) -> std::result::Result<WebAssembly::Instance, JsValue> {
    let source = Promise::resolve(&JsValue::from(response.clone()?));
    let result = JsFuture::from(WebAssembly::instantiate_streaming(&source, imports)).await?;
    instance_of(&result)
}

fn instance_of(result: &JsValue) -> std::result::Result<WebAssembly::Instance, JsValue> {
    Reflect::get(result, &JsValue::from_str("instance")).map(JsCast::unchecked_into)
}

struct Exports {
    memory: WebAssembly::Memory,
    malloc: Function,
    realloc: Function,
    table: WebAssembly::Table,
    start: Option<Function>,
}

/// Late-bound view over the instantiated engine. Created empty so the
/// import closures can capture it before the instance exists; `bind` fills
/// it in once instantiation completes. The memory view is refreshed on
/// every access because the engine may grow the buffer between calls.
#[derive(Default)]
pub struct EngineExports {
    inner: Option<Exports>,
}

pub type SharedExports = Rc<RefCell<EngineExports>>;

impl EngineExports {
    pub fn bind(&mut self, instance: &WebAssembly::Instance) -> Result<()> {
        let exports = instance.exports();
        let get = |name: &str| -> Result<JsValue> {
            Reflect::get(&exports, &JsValue::from_str(name))
                .map_err(|e| js_err("exports lookup", e))
        };
        self.inner = Some(Exports {
            memory: get("memory")?.unchecked_into(),
            malloc: get("__trellis_malloc")?.unchecked_into(),
            realloc: get("__trellis_realloc")?.unchecked_into(),
            table: get("__trellis_table")?.unchecked_into(),
            start: get("__trellis_start")
                .ok()
                .and_then(|v| v.dyn_into().ok()),
        });
        Ok(())
    }

    pub fn run_start(&self) -> Result<()> {
        let exports = self.bound()?;
        if let Some(start) = &exports.start {
            start
                .call0(&JsValue::NULL)
                .map_err(|e| js_err("start", e))?;
        }
        Ok(())
    }

    fn bound(&self) -> Result<&Exports> {
        self.inner
            .as_ref()
            .ok_or_else(|| BridgeError::BoundaryRejection("engine not instantiated".into()))
    }

    fn view(&self) -> Result<Uint8Array> {
        Ok(Uint8Array::new(&self.bound()?.memory.buffer()))
    }

    fn function_at(&self, index: u32) -> Result<Function> {
        self.bound()?
            .table
            .get(index)
            .map_err(|e| js_err("callback table", e))
    }

    fn call_alloc(&self, f: &Function, args: &[u32], context: &str) -> Result<u32> {
        let array = Array::new();
        for arg in args {
            array.push(&JsValue::from(*arg));
        }
        let result = f
            .apply(&JsValue::NULL, &array)
            .map_err(|e| js_err(context, e))?;
        result
            .as_f64()
            .map(|v| v as u32)
            .ok_or_else(|| js_err(context, result))
    }
}

impl LinearMemory for EngineExports {
    fn read(&self, ptr: u32, len: u32) -> Result<Vec<u8>> {
        let view = self.view()?;
        let end = ptr.checked_add(len).unwrap_or(u32::MAX);
        if end > view.length() {
            return Err(BridgeError::Implementation(
                ProtocolFault::MemoryOutOfBounds {
                    ptr,
                    len,
                    buffer_len: view.length() as usize,
                },
            ));
        }
        Ok(view.subarray(ptr, end).to_vec())
    }

    fn write(&mut self, ptr: u32, bytes: &[u8]) -> Result<()> {
        let view = self.view()?;
        let end = (ptr as u64).checked_add(bytes.len() as u64).unwrap_or(u64::MAX);
        if end > view.length() as u64 {
            return Err(BridgeError::Implementation(
                ProtocolFault::MemoryOutOfBounds {
                    ptr,
                    len: bytes.len() as u32,
                    buffer_len: view.length() as usize,
                },
            ));
        }
        view.set(&Uint8Array::from(bytes), ptr);
        Ok(())
    }
}

impl GuestAllocator for EngineExports {
    fn alloc(&mut self, size: u32, align: u32) -> Result<u32> {
        let exports = self.bound()?;
        self.call_alloc(&exports.malloc, &[size, align], "__trellis_malloc")
    }

    fn realloc(&mut self, ptr: u32, old_size: u32, new_size: u32, align: u32) -> Result<u32> {
        let exports = self.bound()?;
        self.call_alloc(
            &exports.realloc,
            &[ptr, old_size, new_size, align],
            "__trellis_realloc",
        )
    }
}

/// [`EngineHooks`] adapter over the shared exports cell.
///
/// The exports borrow is dropped before control enters the engine, because
/// engine code running under an invoked callback synchronously calls back
/// into the host imports, and those need the cell for memory reads.
pub struct HooksProxy(pub SharedExports);

impl EngineHooks for HooksProxy {
    fn invoke(
        &self,
        fn_id: u32,
        ctx_a: RawWord,
        ctx_b: RawWord,
        args: &[RawWord],
    ) -> Result<()> {
        let adapter = self.0.borrow().function_at(fn_id)?;
        let call_args = Array::new();
        call_args.push(&JsValue::from(ctx_a));
        call_args.push(&JsValue::from(ctx_b));
        for arg in args {
            call_args.push(&JsValue::from(*arg));
        }
        adapter
            .apply(&JsValue::NULL, &call_args)
            .map(|_| ())
            .map_err(|e| js_err("callback invoke", e))
    }

    fn destroy(&self, dtor_id: u32, ctx_a: RawWord, ctx_b: RawWord) -> Result<()> {
        let dtor = self.0.borrow().function_at(dtor_id)?;
        dtor.call2(&JsValue::NULL, &JsValue::from(ctx_a), &JsValue::from(ctx_b))
            .map(|_| ())
            .map_err(|e| js_err("callback destroy", e))
    }
}
