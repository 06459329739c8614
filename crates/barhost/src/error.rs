//! Error taxonomy.
//!
//! Load and init failures are ordinary `Result`s: the immediate caller
//! unwinds whatever it acquired. Runtime failures raised from inside module
//! callbacks cannot be returned to anyone and end up either as a `set_error`
//! for the slot (non-fatal) or at the fatal handler ([`Fatal`]).

use std::ffi::c_int;
use std::path::PathBuf;

use thiserror::Error;

use crate::module::ModuleKind;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("{kind} path {} contains a NUL byte", path.display())]
    InvalidPath { kind: ModuleKind, path: PathBuf },

    #[error("dlopen: {reason}")]
    Open {
        kind: ModuleKind,
        path: PathBuf,
        reason: String,
    },

    #[error("dlsym: {symbol}: {reason}")]
    MissingMarker {
        kind: ModuleKind,
        path: PathBuf,
        symbol: &'static str,
        reason: String,
    },

    #[error("{kind} '{}' was compiled with ABI version {found}, but barhost with version {expected}", path.display())]
    VersionMismatch {
        kind: ModuleKind,
        path: PathBuf,
        found: c_int,
        expected: c_int,
    },

    #[error("dlsym: {symbol}: {reason}")]
    MissingTable {
        kind: ModuleKind,
        path: PathBuf,
        symbol: &'static str,
        reason: String,
    },
}

impl LoadError {
    pub fn path(&self) -> &std::path::Path {
        match self {
            LoadError::InvalidPath { path, .. }
            | LoadError::Open { path, .. }
            | LoadError::MissingMarker { path, .. }
            | LoadError::VersionMismatch { path, .. }
            | LoadError::MissingTable { path, .. } => path,
        }
    }
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("{0}'s init() failed")]
    Module(ModuleKind),

    #[error("widget.opts: expected table or nil, found {0}")]
    BadOptions(&'static str),

    #[error("widget: expected table, found {0}")]
    NotATable(&'static str),

    #[error("barlib option {0:?} contains a NUL byte")]
    BadOption(String),
}

#[derive(Debug, Clone, Error)]
pub enum LuaError {
    #[error("{0}")]
    Runtime(String),

    #[error("out of memory: {0}")]
    Memory(String),

    #[error("error while running error handler: {0}")]
    Handler(String),

    #[error("unknown Lua error code {code}, message is: {message}")]
    Unknown { code: c_int, message: String },

    #[error("can't allocate a Lua state")]
    StateAlloc,

    #[error("{0:?} contains a NUL byte")]
    Nul(String),
}

/// A widget script that does not follow the `widget` table contract, or whose
/// plugin cannot be loaded.
#[derive(Debug, Error)]
pub enum WidgetError {
    #[error("(lua) {0}")]
    Lua(#[from] LuaError),

    #[error("widget: expected table, found {0}")]
    NotATable(&'static str),

    #[error("widget.plugin: expected string, found {0}")]
    PluginName(&'static str),

    #[error("widget.cb: expected function, found {0}")]
    Callback(&'static str),

    #[error("widget.event: expected function, string or nil, found {0}")]
    Event(&'static str),

    #[error("can't load plugin '{name}': {source}")]
    Plugin {
        name: String,
        #[source]
        source: LoadError,
    },

    #[error(transparent)]
    Handoff(#[from] HandoffError),
}

/// Bracket protocol violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HandoffError {
    #[error("bracket re-entered by the thread that already holds it")]
    Reentrant,

    #[error("bracket closed by a thread that does not hold it")]
    NotHeld,
}

#[derive(Debug, Error)]
pub enum SetError {
    /// The renderer rejected the value; the context may be left dirty.
    #[error("barlib's set() rejected the value")]
    Malformed,

    #[error(transparent)]
    Fatal(#[from] Fatal),
}

/// Failures after which the process cannot continue.
#[derive(Debug, Clone, Error)]
pub enum Fatal {
    #[error("barlib's set() reported fatal error")]
    Set,

    #[error("barlib's set_error() reported fatal error")]
    SetError,

    #[error("barlib's event_watcher() reported fatal error")]
    EventWatcher,

    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Startup failures of the whole host.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("can't load barlib '{name}': {source}")]
    Barlib {
        name: String,
        #[source]
        source: LoadError,
    },

    #[error("entities that share the same taint have been found")]
    Taints,

    #[error("can't init the barlib: {0}")]
    BarInit(#[source] InitError),

    #[error(transparent)]
    Lua(#[from] LuaError),

    #[error(transparent)]
    Fatal(#[from] Fatal),

    #[error("can't spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}
