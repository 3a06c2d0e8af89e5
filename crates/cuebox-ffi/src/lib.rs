//! C FFI surface for cuebox.
//!
//! Pattern: opaque EngineHandle + C strings + JSON serialization.
//!
//! Any host with a C FFI (Dart, Swift, Kotlin, Python, Node.js) can open a
//! catalog, send keys or JSON commands and poll JSON snapshots.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::path::Path;
use std::ptr;
use std::sync::Arc;

use cuebox_core::{Command, Engine, Loaded, NoopBackend};
use serde::Serialize;

// ---------------------------------------------------------------------------
// Error handling (thread-local last error)
// ---------------------------------------------------------------------------

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

fn set_error(msg: String) {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = Some(msg));
}

fn clear_error() {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = None);
}

/// Returns the last error message (caller frees with `cuebox_string_free`).
#[no_mangle]
pub extern "C" fn cuebox_last_error() -> *mut c_char {
    LAST_ERROR.with(|cell| {
        cell.borrow_mut()
            .take()
            .and_then(|s| CString::new(s).ok())
            .map(|s| s.into_raw())
            .unwrap_or(ptr::null_mut())
    })
}

/// Frees a string returned from cuebox FFI.
///
/// # Safety
/// Must be a pointer returned from this FFI and not already freed.
#[no_mangle]
pub unsafe extern "C" fn cuebox_string_free(ptr: *mut c_char) {
    if !ptr.is_null() {
        let _ = CString::from_raw(ptr);
    }
}

// ---------------------------------------------------------------------------
// Opaque handle
// ---------------------------------------------------------------------------

#[repr(C)]
pub struct EngineHandle {
    _private: [u8; 0],
}

struct EngineHandleInner {
    engine: Engine,
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Load a catalog (JSON file or theme directory) and start playing it on
/// the default output device. Returns NULL on error.
///
/// # Safety
/// `catalog` must be a valid null-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn cuebox_open(catalog: *const c_char) -> *mut EngineHandle {
    clear_error();
    let Loaded { catalog, config } = match read_cstr(catalog).and_then(|p| load(&p)) {
        Ok(loaded) => loaded,
        Err(e) => return err_handle(e),
    };
    match Engine::new(catalog, config.apply_env()) {
        Ok(engine) => into_handle(engine),
        Err(e) => err_handle(e.to_string()),
    }
}

/// Like `cuebox_open` but without audio output: the schedule runs and
/// snapshots update, nothing sounds. A non-negative `seed` makes the run
/// reproducible.
///
/// # Safety
/// `catalog` must be a valid null-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn cuebox_open_headless(catalog: *const c_char, seed: i64) -> *mut EngineHandle {
    clear_error();
    let Loaded { catalog, mut config } = match read_cstr(catalog).and_then(|p| load(&p)) {
        Ok(loaded) => loaded,
        Err(e) => return err_handle(e),
    };
    if seed >= 0 {
        config = config.with_seed(seed as u64);
    }
    match Engine::with_backend(catalog, Arc::new(NoopBackend::new()), config) {
        Ok(engine) => into_handle(engine),
        Err(e) => err_handle(e.to_string()),
    }
}

/// Stops all sound and releases the engine.
#[no_mangle]
pub extern "C" fn cuebox_close(handle: *mut EngineHandle) {
    if !handle.is_null() {
        unsafe {
            let inner = Box::from_raw(handle as *mut EngineHandleInner);
            inner.engine.shutdown();
        }
    }
}

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

/// Press an assignable key (`key` is a Unicode scalar value).
/// Returns 1 if something is bound to it, 0 if not, -1 on error.
#[no_mangle]
pub extern "C" fn cuebox_key(handle: *mut EngineHandle, key: u32) -> i32 {
    clear_error();
    let engine = match engine_ref(handle) {
        Ok(e) => e,
        Err(e) => {
            set_error(e);
            return -1;
        }
    };
    let Some(key) = char::from_u32(key) else {
        set_error(format!("invalid key code {key}"));
        return -1;
    };
    match engine.key(key) {
        Ok(true) => 1,
        Ok(false) => 0,
        Err(e) => {
            set_error(e.to_string());
            -1
        }
    }
}

/// Send a control command, e.g. `{"action":"toggle_pause"}`.
/// Returns 1 on success, 0 on error.
#[no_mangle]
pub extern "C" fn cuebox_command(handle: *mut EngineHandle, json: *const c_char) -> i32 {
    clear_error();
    let engine = match engine_ref(handle) {
        Ok(e) => e,
        Err(e) => {
            set_error(e);
            return 0;
        }
    };
    let json_str = match read_cstr(json) {
        Ok(s) => s,
        Err(e) => {
            set_error(e);
            return 0;
        }
    };
    let cmd: Command = match serde_json::from_str(&json_str) {
        Ok(v) => v,
        Err(e) => {
            set_error(e.to_string());
            return 0;
        }
    };
    match engine.command(cmd) {
        Ok(_) => 1,
        Err(e) => {
            set_error(e.to_string());
            0
        }
    }
}

// ---------------------------------------------------------------------------
// Observability
// ---------------------------------------------------------------------------

/// Latest scheduler snapshot as JSON (caller frees).
#[no_mangle]
pub extern "C" fn cuebox_snapshot(handle: *mut EngineHandle) -> *mut c_char {
    clear_error();
    match engine_ref(handle) {
        Ok(engine) => json_to_cstr(&engine.snapshot()),
        Err(e) => err_null(e),
    }
}

#[derive(Serialize)]
struct KeyBinding<'a> {
    key: char,
    name: &'a str,
    kind: &'static str,
    default: bool,
}

/// Every assignable key of the loaded catalog as a JSON array (caller frees).
#[no_mangle]
pub extern "C" fn cuebox_keys(handle: *mut EngineHandle) -> *mut c_char {
    clear_error();
    let engine = match engine_ref(handle) {
        Ok(e) => e,
        Err(e) => return err_null(e),
    };
    let catalog = engine.catalog();
    let themes = catalog.themes().iter().map(|t| KeyBinding {
        key: t.key,
        name: &t.name,
        kind: "theme",
        default: t.default,
    });
    let globals = catalog.globals().iter().map(|g| KeyBinding {
        key: g.key,
        name: &g.name,
        kind: if g.interrupting { "interrupt" } else { "overlay" },
        default: false,
    });
    let bindings: Vec<KeyBinding> = themes.chain(globals).collect();
    json_to_cstr(&bindings)
}

// ---------------------------------------------------------------------------
// Version
// ---------------------------------------------------------------------------

/// Returns the FFI API version.
#[no_mangle]
pub extern "C" fn cuebox_version() -> u32 {
    1
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load(path: &str) -> Result<Loaded, String> {
    cuebox_core::load(Path::new(path)).map_err(|e| e.to_string())
}

fn into_handle(engine: Engine) -> *mut EngineHandle {
    engine.start();
    Box::into_raw(Box::new(EngineHandleInner { engine })) as *mut EngineHandle
}

fn engine_ref<'a>(handle: *mut EngineHandle) -> Result<&'a Engine, String> {
    if handle.is_null() {
        return Err("null engine handle".into());
    }
    let inner = unsafe { &*(handle as *mut EngineHandleInner) };
    Ok(&inner.engine)
}

fn read_cstr(ptr: *const c_char) -> Result<String, String> {
    if ptr.is_null() {
        return Err("null string pointer".into());
    }
    unsafe {
        CStr::from_ptr(ptr)
            .to_str()
            .map(String::from)
            .map_err(|_| "invalid utf-8".into())
    }
}

fn json_to_cstr<T: Serialize>(value: &T) -> *mut c_char {
    match serde_json::to_string(value) {
        Ok(json) => to_cstr(json),
        Err(e) => err_null(e.to_string()),
    }
}

fn to_cstr(s: String) -> *mut c_char {
    CString::new(s)
        .map(|c| c.into_raw())
        .unwrap_or(ptr::null_mut())
}

fn err_null(msg: String) -> *mut c_char {
    set_error(msg);
    ptr::null_mut()
}

fn err_handle(msg: String) -> *mut EngineHandle {
    set_error(msg);
    ptr::null_mut()
}

// ---------------------------------------------------------------------------
// FFI Integration Tests
// ---------------------------------------------------------------------------
