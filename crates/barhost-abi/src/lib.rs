//! barhost module SDK.
//!
//! The host loads two kinds of native modules:
//!
//! - **plugins** (producers): run a blocking loop that hands values to the
//!   widget's Lua callback through [`ProducerRunFuncs`];
//! - **barlibs** (renderers): receive every produced value through
//!   [`RendererIface::set`] and may watch for user events.
//!
//! Each module exports two symbols: an integer ABI-version marker and a
//! `#[repr(C)]` function table. Use [`export_producer!`] or
//! [`export_renderer!`] to generate both:
//!
//! ```ignore
//! use barhost_abi::{export_producer, taints, ProducerData, ProducerIface, ProducerRunFuncs};
//!
//! unsafe extern "C" fn init(_pd: *mut ProducerData, _l: *mut barhost_abi::lua::lua_State) -> i32 {
//!     barhost_abi::BARHOST_OK
//! }
//! unsafe extern "C" fn run(_pd: *mut ProducerData, funcs: ProducerRunFuncs) {
//!     funcs.produce(|l| unsafe { barhost_abi::lua::lua_pushinteger(l, 42) });
//! }
//! unsafe extern "C" fn destroy(_pd: *mut ProducerData) {}
//!
//! export_producer!(ProducerIface {
//!     init,
//!     register_funcs: None,
//!     run,
//!     destroy,
//!     taints: taints!["xlib"],
//! });
//! ```
//!
//! Build modules as `cdylib`s with `default-features = false, features =
//! ["module"]` so the Lua API is resolved from the host process.

use std::ffi::{c_char, c_int, c_void, CStr, CString};

pub use mlua_sys as lua;

use lua::lua_State;

// =============================================================================
// Versioning and result codes
// =============================================================================

/// ABI version of this SDK. A module is only accepted by a host built
/// against the same Lua release (`LUA_VERSION_NUM` of Lua 5.4).
pub const ABI_VERSION: c_int = 504;

pub const PRODUCER_VERSION_SYMBOL: &CStr = c"BARHOST_PRODUCER_ABI_VERSION";
pub const PRODUCER_IFACE_SYMBOL: &CStr = c"barhost_producer_iface";
pub const RENDERER_VERSION_SYMBOL: &CStr = c"BARHOST_RENDERER_ABI_VERSION";
pub const RENDERER_IFACE_SYMBOL: &CStr = c"barhost_renderer_iface";

pub const BARHOST_OK: c_int = 0;
pub const BARHOST_ERR: c_int = 1;
/// Only meaningful as a result of `set` and `event_watcher`.
pub const BARHOST_NONFATAL_ERR: c_int = 2;

/// Log levels accepted by [`LogFn`].
pub mod level {
    use std::ffi::c_int;

    pub const FATAL: c_int = 0;
    pub const ERROR: c_int = 1;
    pub const WARNING: c_int = 2;
    pub const INFO: c_int = 3;
    pub const VERBOSE: c_int = 4;
    pub const DEBUG: c_int = 5;
    pub const TRACE: c_int = 6;
}

/// Host-provided logging callback. `userdata` is the value stored next to it
/// in the module's data struct.
pub type LogFn = unsafe extern "C" fn(userdata: *mut c_void, level: c_int, msg: *const c_char);

fn log_via(log: LogFn, userdata: *mut c_void, level: c_int, msg: &str) {
    let msg = CString::new(msg.replace('\0', "\\0")).unwrap_or_default();
    unsafe { log(userdata, level, msg.as_ptr()) };
}

// =============================================================================
// Producer (plugin) ABI
// =============================================================================

/// Per-widget data handed to every producer callback.
///
/// `priv_data` belongs to the module; the host never reads it.
#[repr(C)]
pub struct ProducerData {
    pub priv_data: *mut c_void,
    pub userdata: *mut c_void,
    pub log: LogFn,
}

impl ProducerData {
    /// Log a message attributed to this widget.
    pub fn log(&self, level: c_int, msg: &str) {
        log_via(self.log, self.userdata, level, msg);
    }
}

/// Callbacks passed to [`ProducerIface::run`].
///
/// Each produced value is handed over in one bracket: `call_begin` returns the
/// widget's Lua state (or null if the host refused the bracket), the module
/// pushes exactly one value, then calls `call_end`. `call_cancel` closes the
/// bracket without rendering anything.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ProducerRunFuncs {
    pub userdata: *mut c_void,
    pub call_begin: unsafe extern "C" fn(userdata: *mut c_void) -> *mut lua_State,
    pub call_end: unsafe extern "C" fn(userdata: *mut c_void),
    pub call_cancel: unsafe extern "C" fn(userdata: *mut c_void),
}

impl ProducerRunFuncs {
    /// Run one bracket, pushing the value with `push`.
    ///
    /// Returns `false` if the host refused to open the bracket.
    ///
    /// # Safety
    ///
    /// `push` must leave exactly one value on top of the stack it is given.
    pub unsafe fn produce(&self, push: impl FnOnce(*mut lua_State)) -> bool {
        let l = (self.call_begin)(self.userdata);
        if l.is_null() {
            return false;
        }
        push(l);
        (self.call_end)(self.userdata);
        true
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ProducerIface {
    /// Called with `widget.opts` (or an empty table) on top of the stack.
    pub init: unsafe extern "C" fn(pd: *mut ProducerData, l: *mut lua_State) -> c_int,
    /// Called with an empty table on top of the stack; the table becomes
    /// `barhost.plugin` in the widget's context.
    pub register_funcs: Option<unsafe extern "C" fn(pd: *mut ProducerData, l: *mut lua_State)>,
    pub run: unsafe extern "C" fn(pd: *mut ProducerData, funcs: ProducerRunFuncs),
    pub destroy: unsafe extern "C" fn(pd: *mut ProducerData),
    /// Null, or a null-terminated array of NUL-terminated taint ids.
    pub taints: *const *const c_char,
}

// Function tables are immutable statics.
unsafe impl Send for ProducerIface {}
unsafe impl Sync for ProducerIface {}

// =============================================================================
// Renderer (barlib) ABI
// =============================================================================

#[repr(C)]
pub struct RendererData {
    pub priv_data: *mut c_void,
    pub userdata: *mut c_void,
    pub log: LogFn,
}

impl RendererData {
    pub fn log(&self, level: c_int, msg: &str) {
        log_via(self.log, self.userdata, level, msg);
    }
}

/// Callbacks passed to [`RendererIface::event_watcher`].
///
/// `call_begin(slot)` returns the Lua state the event for widget `slot` is to
/// be pushed onto, with the widget's event handler already pushed; the
/// watcher pushes the event value and calls `call_end(slot)`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RendererEventFuncs {
    pub userdata: *mut c_void,
    pub call_begin: unsafe extern "C" fn(userdata: *mut c_void, slot: usize) -> *mut lua_State,
    pub call_end: unsafe extern "C" fn(userdata: *mut c_void, slot: usize),
}

impl RendererEventFuncs {
    /// Deliver one event to widget `slot`.
    ///
    /// # Safety
    ///
    /// `push` must leave exactly one value on top of the stack it is given.
    pub unsafe fn deliver(&self, slot: usize, push: impl FnOnce(*mut lua_State)) -> bool {
        let l = (self.call_begin)(self.userdata, slot);
        if l.is_null() {
            return false;
        }
        push(l);
        (self.call_end)(self.userdata, slot);
        true
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RendererIface {
    /// `opts` is a null-terminated array of the `-B` options.
    pub init: unsafe extern "C" fn(rd: *mut RendererData, opts: *const *const c_char, nwidgets: usize) -> c_int,
    pub register_funcs: Option<unsafe extern "C" fn(rd: *mut RendererData, l: *mut lua_State)>,
    /// Render the value on top of `l` into `slot`. Returns [`BARHOST_OK`],
    /// [`BARHOST_NONFATAL_ERR`] for a malformed value, or [`BARHOST_ERR`].
    pub set: unsafe extern "C" fn(rd: *mut RendererData, l: *mut lua_State, slot: usize) -> c_int,
    pub set_error: unsafe extern "C" fn(rd: *mut RendererData, slot: usize) -> c_int,
    /// Blocks for as long as there are events to deliver. Returns
    /// [`BARHOST_NONFATAL_ERR`] when there are no more events.
    pub event_watcher: Option<unsafe extern "C" fn(rd: *mut RendererData, funcs: RendererEventFuncs) -> c_int>,
    pub destroy: unsafe extern "C" fn(rd: *mut RendererData),
    pub taints: *const *const c_char,
}

unsafe impl Send for RendererIface {}
unsafe impl Sync for RendererIface {}

// =============================================================================
// Taint lists
// =============================================================================

/// Static storage behind [`taints!`].
#[repr(transparent)]
pub struct TaintList<const N: usize>(pub [*const c_char; N]);

unsafe impl<const N: usize> Sync for TaintList<N> {}

impl<const N: usize> TaintList<N> {
    pub const fn as_ptr(&'static self) -> *const *const c_char {
        self.0.as_ptr()
    }
}

/// Build a null-terminated taint list for an interface table.
///
/// `taints![]` yields a null pointer (no taints).
#[macro_export]
macro_rules! taints {
    () => {
        ::core::ptr::null()
    };
    ($($id:literal),+ $(,)?) => {{
        static TAINTS: $crate::TaintList<{ [$($crate::__one!($id)),+].len() + 1 }> =
            $crate::TaintList([
                $(::core::concat!($id, "\0").as_ptr() as *const ::core::ffi::c_char,)+
                ::core::ptr::null(),
            ]);
        TAINTS.as_ptr()
    }};
}

#[doc(hidden)]
#[macro_export]
macro_rules! __one {
    ($t:tt) => {
        ()
    };
}

// =============================================================================
// Export macros
// =============================================================================

/// Export a plugin: the version marker and the [`ProducerIface`] table.
#[macro_export]
macro_rules! export_producer {
    ($iface:expr $(,)?) => {
        #[no_mangle]
        pub static BARHOST_PRODUCER_ABI_VERSION: ::core::ffi::c_int = $crate::ABI_VERSION;

        #[no_mangle]
        #[allow(non_upper_case_globals)]
        pub static barhost_producer_iface: $crate::ProducerIface = $iface;
    };
}

/// Export a barlib: the version marker and the [`RendererIface`] table.
#[macro_export]
macro_rules! export_renderer {
    ($iface:expr $(,)?) => {
        #[no_mangle]
        pub static BARHOST_RENDERER_ABI_VERSION: ::core::ffi::c_int = $crate::ABI_VERSION;

        #[no_mangle]
        #[allow(non_upper_case_globals)]
        pub static barhost_renderer_iface: $crate::RendererIface = $iface;
    };
}
