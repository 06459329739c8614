//! In-process fakes: a recording log sink, a fake library loader, and a few
//! producer/renderer tables implemented against the raw Lua API.

use std::collections::HashMap;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use barhost_abi::lua::{self as ffi, lua_State};
use barhost_abi::{
    taints, ProducerData, ProducerIface, ProducerRunFuncs, RendererData, RendererEventFuncs, RendererIface,
    BARHOST_ERR, BARHOST_NONFATAL_ERR, BARHOST_OK, PRODUCER_IFACE_SYMBOL, PRODUCER_VERSION_SYMBOL,
    RENDERER_IFACE_SYMBOL, RENDERER_VERSION_SYMBOL,
};

use crate::error::LoadError;
use crate::guard::{Library, ModuleGuard};
use crate::log::{Level, LogSink, Logger};
use crate::module::{read_string_list, ModuleKind, ModuleLoader, HOST_ABI_VERSION};

// =============================================================================
// Logging
// =============================================================================

#[derive(Default)]
pub(crate) struct RecordingSink {
    lines: Mutex<Vec<(Level, Option<String>, String)>>,
}

impl RecordingSink {
    pub(crate) fn lines(&self) -> Vec<(Level, Option<String>, String)> {
        self.lines.lock().unwrap().clone()
    }

    pub(crate) fn messages(&self) -> Vec<String> {
        self.lines().into_iter().map(|(_, _, m)| m).collect()
    }

    pub(crate) fn messages_at(&self, level: Level) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|(l, _, _)| *l == level)
            .map(|(_, _, m)| m)
            .collect()
    }
}

impl LogSink for Arc<RecordingSink> {
    fn log(&self, level: Level, who: Option<&str>, args: fmt::Arguments<'_>) {
        self.lines
            .lock()
            .unwrap()
            .push((level, who.map(str::to_string), args.to_string()));
    }
}

pub(crate) fn recording_logger() -> (Logger, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    (Logger::new(Arc::clone(&sink)), sink)
}

// =============================================================================
// Fake libraries
// =============================================================================

#[derive(Clone, Copy, Default)]
pub(crate) struct FakeModule {
    producer_marker: Option<c_int>,
    renderer_marker: Option<c_int>,
    producer: Option<&'static ProducerIface>,
    renderer: Option<&'static RendererIface>,
}

impl FakeModule {
    pub(crate) fn producer(iface: &'static ProducerIface) -> Self {
        Self {
            producer_marker: Some(HOST_ABI_VERSION),
            producer: Some(iface),
            ..Self::default()
        }
    }

    pub(crate) fn renderer(iface: &'static RendererIface) -> Self {
        Self {
            renderer_marker: Some(HOST_ABI_VERSION),
            renderer: Some(iface),
            ..Self::default()
        }
    }

    /// Both markers set to `version`, no tables.
    pub(crate) fn version_only(version: c_int) -> Self {
        Self {
            producer_marker: Some(version),
            renderer_marker: Some(version),
            ..Self::default()
        }
    }

    pub(crate) fn empty() -> Self {
        Self::default()
    }
}

struct FakeLibrary {
    module: FakeModule,
    producer_marker: Box<c_int>,
    renderer_marker: Box<c_int>,
    closed: Arc<AtomicUsize>,
}

impl Library for FakeLibrary {
    fn symbol(&self, name: &CStr) -> Result<NonNull<c_void>, String> {
        let m = &self.module;
        let ptr: Option<*const c_void> = if name == PRODUCER_VERSION_SYMBOL {
            m.producer_marker.map(|_| &*self.producer_marker as *const c_int as *const c_void)
        } else if name == RENDERER_VERSION_SYMBOL {
            m.renderer_marker.map(|_| &*self.renderer_marker as *const c_int as *const c_void)
        } else if name == PRODUCER_IFACE_SYMBOL {
            m.producer.map(|i| i as *const ProducerIface as *const c_void)
        } else if name == RENDERER_IFACE_SYMBOL {
            m.renderer.map(|i| i as *const RendererIface as *const c_void)
        } else {
            None
        };
        ptr.and_then(|p| NonNull::new(p as *mut c_void))
            .ok_or_else(|| format!("undefined symbol: {}", name.to_string_lossy()))
    }
}

impl Drop for FakeLibrary {
    fn drop(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct FakeLoader {
    modules: HashMap<PathBuf, FakeModule>,
    opened: Mutex<Vec<PathBuf>>,
    live: AtomicUsize,
    closed: Arc<AtomicUsize>,
}

impl FakeLoader {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with(mut self, path: impl Into<PathBuf>, module: FakeModule) -> Self {
        self.modules.insert(path.into(), module);
        self
    }

    /// Every path an open was attempted for, in order.
    pub(crate) fn opened(&self) -> Vec<PathBuf> {
        self.opened.lock().unwrap().clone()
    }

    /// Every successfully opened library has been closed again.
    pub(crate) fn all_closed(&self) -> bool {
        self.live.load(Ordering::SeqCst) == self.closed.load(Ordering::SeqCst)
    }
}

impl ModuleLoader for FakeLoader {
    fn open(&self, kind: ModuleKind, path: &Path) -> Result<ModuleGuard, LoadError> {
        self.opened.lock().unwrap().push(path.to_path_buf());
        let Some(module) = self.modules.get(path) else {
            return Err(LoadError::Open {
                kind,
                path: path.to_path_buf(),
                reason: format!("{}: cannot open shared object file: No such file or directory", path.display()),
            });
        };
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(ModuleGuard::new(FakeLibrary {
            module: *module,
            producer_marker: Box::new(module.producer_marker.unwrap_or(0)),
            renderer_marker: Box::new(module.renderer_marker.unwrap_or(0)),
            closed: Arc::clone(&self.closed),
        }))
    }
}

// =============================================================================
// Lua helpers
// =============================================================================

unsafe fn get_integer_field(l: *mut lua_State, field: &CStr) -> i64 {
    ffi::lua_getfield(l, -1, field.as_ptr());
    let n = ffi::lua_tointegerx(l, -1, std::ptr::null_mut());
    ffi::lua_settop(l, -2);
    n as i64
}

unsafe fn get_bool_field(l: *mut lua_State, field: &CStr) -> bool {
    ffi::lua_getfield(l, -1, field.as_ptr());
    let b = ffi::lua_toboolean(l, -1) != 0;
    ffi::lua_settop(l, -2);
    b
}

unsafe fn top_string(l: *mut lua_State) -> String {
    let mut len = 0usize;
    let p = ffi::lua_tolstring(l, -1, &mut len);
    String::from_utf8_lossy(std::slice::from_raw_parts(p as *const u8, len)).into_owned()
}

unsafe extern "C-unwind" fn push_module_name(l: *mut lua_State) -> c_int {
    ffi::lua_pushstring(l, c"fake".as_ptr());
    1
}

unsafe fn add_name_function(l: *mut lua_State) {
    ffi::lua_pushcfunction(l, push_module_name);
    ffi::lua_setfield(l, -2, c"name".as_ptr());
}

// =============================================================================
// Producers
// =============================================================================

/// What `init` saw in `widget.opts`, and how `run` behaves:
/// `count` values `1..=count` are produced; value `cancel_at` is pushed and
/// then cancelled; at `pop_at` the callback is popped and nothing is pushed;
/// with `reenter`, a second `call_begin` is attempted while
/// the first bracket is open.
pub(crate) struct EchoState {
    pub(crate) opts_keys: Vec<String>,
    count: i64,
    cancel_at: i64,
    pop_at: i64,
    reenter: bool,
    pub(crate) second_begin_refused: AtomicBool,
}

pub(crate) unsafe fn echo_state<'a>(pd: *mut ProducerData) -> &'a EchoState {
    &*((*pd).priv_data as *const EchoState)
}

unsafe extern "C" fn echo_init(pd: *mut ProducerData, l: *mut lua_State) -> c_int {
    if ffi::lua_type(l, -1) != ffi::LUA_TTABLE {
        return BARHOST_ERR;
    }
    let mut opts_keys = Vec::new();
    ffi::lua_pushnil(l);
    while ffi::lua_next(l, -2) != 0 {
        if ffi::lua_type(l, -2) == ffi::LUA_TSTRING {
            ffi::lua_pushvalue(l, -2);
            opts_keys.push(top_string(l));
            ffi::lua_settop(l, -2);
        }
        ffi::lua_settop(l, -2);
    }
    opts_keys.sort();
    let state = EchoState {
        opts_keys,
        count: get_integer_field(l, c"count"),
        cancel_at: get_integer_field(l, c"cancel_at"),
        pop_at: get_integer_field(l, c"pop_at"),
        reenter: get_bool_field(l, c"reenter"),
        second_begin_refused: AtomicBool::new(false),
    };
    (*pd).priv_data = Box::into_raw(Box::new(state)) as *mut c_void;
    BARHOST_OK
}

unsafe extern "C" fn echo_register_funcs(_pd: *mut ProducerData, l: *mut lua_State) {
    add_name_function(l);
}

unsafe extern "C" fn echo_run(pd: *mut ProducerData, funcs: ProducerRunFuncs) {
    let state = echo_state(pd);
    for i in 1..=state.count {
        if i == state.cancel_at {
            let l = (funcs.call_begin)(funcs.userdata);
            if !l.is_null() {
                ffi::lua_pushinteger(l, i as ffi::lua_Integer);
                (funcs.call_cancel)(funcs.userdata);
            }
        } else if i == state.pop_at {
            let l = (funcs.call_begin)(funcs.userdata);
            if !l.is_null() {
                ffi::lua_settop(l, -2);
                (funcs.call_end)(funcs.userdata);
            }
        } else {
            funcs.produce(|l| ffi::lua_pushinteger(l, i as ffi::lua_Integer));
        }
    }
    if state.reenter {
        let l = (funcs.call_begin)(funcs.userdata);
        if !l.is_null() {
            let again = (funcs.call_begin)(funcs.userdata);
            state.second_begin_refused.store(again.is_null(), Ordering::SeqCst);
            (funcs.call_cancel)(funcs.userdata);
        }
    }
}

unsafe extern "C" fn echo_destroy(pd: *mut ProducerData) {
    drop(Box::from_raw((*pd).priv_data as *mut EchoState));
}

pub(crate) static PRODUCER_ECHO: ProducerIface = ProducerIface {
    init: echo_init,
    register_funcs: Some(echo_register_funcs),
    run: echo_run,
    destroy: echo_destroy,
    taints: taints!["echo"],
};

pub(crate) static PRODUCER_FOO: ProducerIface = ProducerIface {
    init: echo_init,
    register_funcs: None,
    run: echo_run,
    destroy: echo_destroy,
    taints: taints!["libfoo"],
};

static PRODUCER_COUNTED_DESTROYED: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn counted_destroy(pd: *mut ProducerData) {
    echo_destroy(pd);
    PRODUCER_COUNTED_DESTROYED.fetch_add(1, Ordering::SeqCst);
}

/// Only for tests that count `destroy` calls.
pub(crate) static PRODUCER_COUNTED: ProducerIface = ProducerIface {
    init: echo_init,
    register_funcs: None,
    run: echo_run,
    destroy: counted_destroy,
    taints: taints![],
};

pub(crate) fn counted_producer_destroyed() -> usize {
    PRODUCER_COUNTED_DESTROYED.load(Ordering::SeqCst)
}

static PRODUCER_FAILING_DESTROYED: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn failing_init(_pd: *mut ProducerData, _l: *mut lua_State) -> c_int {
    BARHOST_ERR
}

unsafe extern "C" fn failing_destroy(_pd: *mut ProducerData) {
    PRODUCER_FAILING_DESTROYED.fetch_add(1, Ordering::SeqCst);
}

pub(crate) static PRODUCER_FAILING: ProducerIface = ProducerIface {
    init: failing_init,
    register_funcs: None,
    run: echo_run,
    destroy: failing_destroy,
    taints: taints![],
};

pub(crate) fn failing_producer_destroyed() -> usize {
    PRODUCER_FAILING_DESTROYED.load(Ordering::SeqCst)
}

// =============================================================================
// Renderers
// =============================================================================

/// Remembers the init arguments and every update per slot.
pub(crate) struct Recorder {
    options: Vec<String>,
    history: Mutex<Vec<Vec<String>>>,
}

impl Recorder {
    pub(crate) fn options(&self) -> Vec<String> {
        self.options.clone()
    }

    pub(crate) fn slot_count(&self) -> usize {
        self.history.lock().unwrap().len()
    }

    pub(crate) fn history(&self, slot: usize) -> Vec<String> {
        self.history.lock().unwrap()[slot].clone()
    }

    fn record(&self, slot: usize, entry: String) {
        self.history.lock().unwrap()[slot].push(entry);
    }
}

pub(crate) unsafe fn recorder<'a>(rd: *mut RendererData) -> &'a Recorder {
    &*((*rd).priv_data as *const Recorder)
}

unsafe extern "C" fn rec_init(rd: *mut RendererData, opts: *const *const c_char, nwidgets: usize) -> c_int {
    let recorder = Recorder {
        options: read_string_list(opts),
        history: Mutex::new(vec![Vec::new(); nwidgets]),
    };
    (*rd).priv_data = Box::into_raw(Box::new(recorder)) as *mut c_void;
    BARHOST_OK
}

/// Strings and numbers are recorded. `"FATAL"` fails hard; `"JUNK"` is
/// recorded but leaves an extra value behind; anything else is malformed
/// and leaves the stack dirty.
unsafe extern "C" fn rec_set(rd: *mut RendererData, l: *mut lua_State, slot: usize) -> c_int {
    let rec = recorder(rd);
    match ffi::lua_type(l, -1) {
        ffi::LUA_TSTRING | ffi::LUA_TNUMBER => {
            let value = top_string(l);
            match value.as_str() {
                "FATAL" => return BARHOST_ERR,
                "JUNK" => ffi::lua_pushnil(l),
                _ => {}
            }
            rec.record(slot, value);
            BARHOST_OK
        }
        _ => {
            ffi::lua_pushnil(l);
            ffi::lua_pushnil(l);
            BARHOST_NONFATAL_ERR
        }
    }
}

unsafe extern "C" fn rec_set_error(rd: *mut RendererData, slot: usize) -> c_int {
    recorder(rd).record(slot, "<error>".to_string());
    BARHOST_OK
}

unsafe extern "C" fn rec_register_funcs(_rd: *mut RendererData, l: *mut lua_State) {
    add_name_function(l);
}

unsafe extern "C" fn rec_destroy(rd: *mut RendererData) {
    drop(Box::from_raw((*rd).priv_data as *mut Recorder));
}

unsafe extern "C" fn failing_bar_init(_rd: *mut RendererData, _opts: *const *const c_char, _n: usize) -> c_int {
    BARHOST_ERR
}

/// Delivers `"click"` and then `"boom"` to slot 0, then stops.
unsafe extern "C" fn events_watcher(_rd: *mut RendererData, funcs: RendererEventFuncs) -> c_int {
    for event in [c"click", c"boom"] {
        if !funcs.deliver(0, |l| {
            ffi::lua_pushstring(l, event.as_ptr());
        }) {
            return BARHOST_ERR;
        }
    }
    BARHOST_NONFATAL_ERR
}

unsafe extern "C" fn bad_slot_watcher(_rd: *mut RendererData, funcs: RendererEventFuncs) -> c_int {
    let l = (funcs.call_begin)(funcs.userdata, 99);
    if l.is_null() {
        BARHOST_NONFATAL_ERR
    } else {
        (funcs.call_end)(funcs.userdata, 99);
        BARHOST_NONFATAL_ERR
    }
}

unsafe extern "C" fn fatal_watcher(_rd: *mut RendererData, _funcs: RendererEventFuncs) -> c_int {
    BARHOST_ERR
}

const RECORDER_BASE: RendererIface = RendererIface {
    init: rec_init,
    register_funcs: Some(rec_register_funcs),
    set: rec_set,
    set_error: rec_set_error,
    event_watcher: None,
    destroy: rec_destroy,
    taints: std::ptr::null(),
};

pub(crate) static RENDERER_RECORDER: RendererIface = RendererIface {
    taints: taints!["libfoo"],
    ..RECORDER_BASE
};

pub(crate) static RENDERER_FAILING: RendererIface = RendererIface {
    init: failing_bar_init,
    ..RECORDER_BASE
};

pub(crate) static RENDERER_EVENTS: RendererIface = RendererIface {
    event_watcher: Some(events_watcher),
    ..RECORDER_BASE
};

pub(crate) static RENDERER_BAD_SLOT: RendererIface = RendererIface {
    event_watcher: Some(bad_slot_watcher),
    ..RECORDER_BASE
};

pub(crate) static RENDERER_FATAL_WATCHER: RendererIface = RendererIface {
    event_watcher: Some(fatal_watcher),
    ..RECORDER_BASE
};

static RENDERER_COUNTED_DESTROYED: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn counted_bar_destroy(rd: *mut RendererData) {
    rec_destroy(rd);
    RENDERER_COUNTED_DESTROYED.fetch_add(1, Ordering::SeqCst);
}

/// Only for tests that count `destroy` calls.
pub(crate) static RENDERER_COUNTED: RendererIface = RendererIface {
    destroy: counted_bar_destroy,
    ..RECORDER_BASE
};

pub(crate) fn counted_renderer_destroyed() -> usize {
    RENDERER_COUNTED_DESTROYED.load(Ordering::SeqCst)
}

unsafe extern "C" fn refuse_begin(_ud: *mut c_void, _slot: usize) -> *mut lua_State {
    std::ptr::null_mut()
}

unsafe extern "C" fn ignore_end(_ud: *mut c_void, _slot: usize) {}

pub(crate) fn null_event_funcs() -> RendererEventFuncs {
    RendererEventFuncs {
        userdata: std::ptr::null_mut(),
        call_begin: refuse_begin,
        call_end: ignore_end,
    }
}
