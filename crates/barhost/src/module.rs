//! Native module loading.
//!
//! Both module kinds go through [`NativeModule::load`]:
//!
//! 1. take the process-wide load lock (`dlerror` state is global);
//! 2. open the library;
//! 3. read the ABI-version marker and compare it with the host's;
//! 4. copy the interface table by value.
//!
//! The version check runs before the table is touched, so a module built
//! against another ABI is rejected even if its table has a different shape.

use std::cell::UnsafeCell;
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use barhost_abi::{
    LogFn, ProducerData, ProducerIface, RendererData, RendererIface, ABI_VERSION,
    PRODUCER_IFACE_SYMBOL, PRODUCER_VERSION_SYMBOL, RENDERER_IFACE_SYMBOL,
    RENDERER_VERSION_SYMBOL,
};
use parking_lot::Mutex;

use crate::error::LoadError;
use crate::guard::{GuardedFn, Library, ModuleGuard};
use crate::log::{module_log, Logger};
use crate::log_at;

/// ABI version the host was compiled with.
pub const HOST_ABI_VERSION: c_int = ABI_VERSION;

static LOAD_LOCK: Mutex<()> = parking_lot::const_mutex(());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    Producer,
    Renderer,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModuleKind::Producer => "plugin",
            ModuleKind::Renderer => "barlib",
        })
    }
}

// =============================================================================
// Module kinds
// =============================================================================

/// Describes one kind of module: its symbols and its table type.
pub trait ModuleAbi: 'static {
    const KIND: ModuleKind;
    const VERSION_SYMBOL: &'static CStr;
    const IFACE_SYMBOL: &'static CStr;
    type Iface: Copy + Send + Sync + 'static;

    fn taints(iface: &Self::Iface) -> *const *const c_char;
}

pub enum ProducerAbi {}

impl ModuleAbi for ProducerAbi {
    const KIND: ModuleKind = ModuleKind::Producer;
    const VERSION_SYMBOL: &'static CStr = PRODUCER_VERSION_SYMBOL;
    const IFACE_SYMBOL: &'static CStr = PRODUCER_IFACE_SYMBOL;
    type Iface = ProducerIface;

    fn taints(iface: &ProducerIface) -> *const *const c_char {
        iface.taints
    }
}

pub enum RendererAbi {}

impl ModuleAbi for RendererAbi {
    const KIND: ModuleKind = ModuleKind::Renderer;
    const VERSION_SYMBOL: &'static CStr = RENDERER_VERSION_SYMBOL;
    const IFACE_SYMBOL: &'static CStr = RENDERER_IFACE_SYMBOL;
    type Iface = RendererIface;

    fn taints(iface: &RendererIface) -> *const *const c_char {
        iface.taints
    }
}

// =============================================================================
// Loaders
// =============================================================================

/// Opens module files. The default is [`DlOpen`].
pub trait ModuleLoader: Send + Sync {
    fn open(&self, kind: ModuleKind, path: &Path) -> Result<ModuleGuard, LoadError>;
}

/// Opens modules with `dlopen(RTLD_NOW)`.
#[derive(Debug, Clone, Default)]
pub struct DlOpen {
    logger: Logger,
}

impl DlOpen {
    pub fn new(logger: Logger) -> Self {
        Self { logger }
    }
}

impl ModuleLoader for DlOpen {
    fn open(&self, kind: ModuleKind, path: &Path) -> Result<ModuleGuard, LoadError> {
        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| LoadError::InvalidPath {
            kind,
            path: path.to_path_buf(),
        })?;
        let handle = unsafe {
            libc::dlerror();
            libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW)
        };
        let Some(handle) = NonNull::new(handle) else {
            return Err(LoadError::Open {
                kind,
                path: path.to_path_buf(),
                reason: unsafe { last_dl_error() },
            });
        };
        Ok(ModuleGuard::new(DlLibrary {
            handle,
            path: path.to_path_buf(),
            logger: self.logger.clone(),
        }))
    }
}

struct DlLibrary {
    handle: NonNull<c_void>,
    path: PathBuf,
    logger: Logger,
}

// dlopen handles are process-global, safe to share across threads.
unsafe impl Send for DlLibrary {}
unsafe impl Sync for DlLibrary {}

impl Library for DlLibrary {
    fn symbol(&self, name: &CStr) -> Result<NonNull<c_void>, String> {
        unsafe {
            libc::dlerror();
            let sym = libc::dlsym(self.handle.as_ptr(), name.as_ptr());
            NonNull::new(sym).ok_or_else(|| last_dl_error())
        }
    }
}

impl Drop for DlLibrary {
    fn drop(&mut self) {
        if unsafe { libc::dlclose(self.handle.as_ptr()) } != 0 {
            log_at!(
                self.logger,
                Warn,
                "dlclose: {}: {}",
                self.path.display(),
                unsafe { last_dl_error() }
            );
        }
    }
}

unsafe fn last_dl_error() -> String {
    let err = libc::dlerror();
    if err.is_null() {
        "unknown error".to_string()
    } else {
        CStr::from_ptr(err).to_string_lossy().into_owned()
    }
}

// =============================================================================
// NativeModule
// =============================================================================

/// An opened module with a validated ABI version and a copy of its table.
pub struct NativeModule<A: ModuleAbi> {
    iface: A::Iface,
    version: c_int,
    path: PathBuf,
    guard: ModuleGuard,
}

impl<A: ModuleAbi> NativeModule<A> {
    pub fn load(loader: &dyn ModuleLoader, path: &Path) -> Result<Self, LoadError> {
        let _serial = LOAD_LOCK.lock();
        let guard = loader.open(A::KIND, path)?;
        Self::from_guard(guard, path)
    }

    /// Validate and read an already opened library. On error the guard is
    /// dropped, closing the library unless other clones exist.
    pub fn from_guard(guard: ModuleGuard, path: &Path) -> Result<Self, LoadError> {
        let marker = guard
            .symbol(A::VERSION_SYMBOL)
            .map_err(|reason| LoadError::MissingMarker {
                kind: A::KIND,
                path: path.to_path_buf(),
                symbol: symbol_name(A::VERSION_SYMBOL),
                reason,
            })?;
        let version = unsafe { *(marker.as_ptr() as *const c_int) };
        check_version(A::KIND, path, version)?;

        let table = guard
            .symbol(A::IFACE_SYMBOL)
            .map_err(|reason| LoadError::MissingTable {
                kind: A::KIND,
                path: path.to_path_buf(),
                symbol: symbol_name(A::IFACE_SYMBOL),
                reason,
            })?;
        let iface = unsafe { *(table.as_ptr() as *const A::Iface) };

        Ok(Self {
            iface,
            version,
            path: path.to_path_buf(),
            guard,
        })
    }

    pub fn kind(&self) -> ModuleKind {
        A::KIND
    }

    pub fn iface(&self) -> &A::Iface {
        &self.iface
    }

    pub fn version(&self) -> c_int {
        self.version
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn guard(&self) -> &ModuleGuard {
        &self.guard
    }

    /// Tie a function pointer from this module's table to its lifetime.
    pub fn guarded<F: Copy>(&self, f: F) -> GuardedFn<F> {
        GuardedFn::new(f, self.guard.clone())
    }

    pub fn taints(&self) -> Vec<String> {
        unsafe { read_string_list(A::taints(&self.iface)) }
    }

    pub fn unload(self) {
        drop(self);
    }
}

impl<A: ModuleAbi> fmt::Debug for NativeModule<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeModule")
            .field("kind", &A::KIND)
            .field("path", &self.path)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

pub fn check_version(kind: ModuleKind, path: &Path, found: c_int) -> Result<(), LoadError> {
    if found == HOST_ABI_VERSION {
        Ok(())
    } else {
        Err(LoadError::VersionMismatch {
            kind,
            path: path.to_path_buf(),
            found,
            expected: HOST_ABI_VERSION,
        })
    }
}

fn symbol_name(symbol: &'static CStr) -> &'static str {
    symbol.to_str().unwrap_or("?")
}

/// Read a null-terminated array of C strings. A null array is empty.
///
/// # Safety
///
/// `list` must be null or point to a null-terminated array of valid C strings.
pub(crate) unsafe fn read_string_list(list: *const *const c_char) -> Vec<String> {
    let mut out = Vec::new();
    if list.is_null() {
        return out;
    }
    let mut cursor = list;
    while !(*cursor).is_null() {
        out.push(CStr::from_ptr(*cursor).to_string_lossy().into_owned());
        cursor = cursor.add(1);
    }
    out
}

// =============================================================================
// Instances: module data structs and their destroy
// =============================================================================

/// Data struct shape shared by both module kinds.
pub(crate) trait ModuleData: Sized {
    fn new(userdata: *mut c_void, log: LogFn) -> Self;
}

impl ModuleData for ProducerData {
    fn new(userdata: *mut c_void, log: LogFn) -> Self {
        ProducerData {
            priv_data: std::ptr::null_mut(),
            userdata,
            log,
        }
    }
}

impl ModuleData for RendererData {
    fn new(userdata: *mut c_void, log: LogFn) -> Self {
        RendererData {
            priv_data: std::ptr::null_mut(),
            userdata,
            log,
        }
    }
}

/// Data struct that has been handed to `init` but not accepted yet.
/// Dropping it does not call `destroy`.
pub(crate) struct PendingInstance<D> {
    data: Box<UnsafeCell<D>>,
    logger: Box<Logger>,
}

impl<D: ModuleData> PendingInstance<D> {
    pub(crate) fn new(logger: Logger) -> Self {
        let logger = Box::new(logger);
        let userdata = &*logger as *const Logger as *mut c_void;
        Self {
            data: Box::new(UnsafeCell::new(D::new(userdata, module_log))),
            logger,
        }
    }
}

impl<D> PendingInstance<D> {
    pub(crate) fn data_ptr(&self) -> *mut D {
        self.data.get()
    }

    /// `init` succeeded: from now on dropping the instance calls `destroy`.
    pub(crate) fn activate(self, destroy: GuardedFn<unsafe extern "C" fn(*mut D)>) -> Instance<D> {
        Instance {
            data: self.data,
            logger: self.logger,
            destroy,
        }
    }
}

/// An inited module instance; `destroy` runs on drop, before the guard
/// clone it carries is released.
pub(crate) struct Instance<D> {
    data: Box<UnsafeCell<D>>,
    logger: Box<Logger>,
    destroy: GuardedFn<unsafe extern "C" fn(*mut D)>,
}

// The host serializes every call that touches the data struct.
unsafe impl<D> Send for Instance<D> {}
unsafe impl<D> Sync for Instance<D> {}

impl<D> Instance<D> {
    pub(crate) fn data_ptr(&self) -> *mut D {
        self.data.get()
    }

    pub(crate) fn logger(&self) -> &Logger {
        &self.logger
    }
}

impl<D> Drop for Instance<D> {
    fn drop(&mut self) {
        unsafe { (self.destroy.get())(self.data.get()) };
    }
}
