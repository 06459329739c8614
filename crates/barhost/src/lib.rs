//! barhost: host process for scripted status-bar widgets.
//!
//! Each widget is a Lua script naming a producer module ("plugin") and a
//! callback. Plugins run on their own threads and hand values to the
//! callback; whatever the callback returns goes to a single renderer module
//! ("barlib"). Modules are native shared objects loaded at runtime.
//!
//! Startup goes through [`runtime::Host::start`]; everything else is exposed
//! for tests and benchmarks.

pub mod bar;
pub mod config;
pub mod error;
pub mod guard;
pub mod handoff;
pub mod log;
pub mod lua;
pub mod module;
pub mod plugin;
pub mod runtime;
pub mod shared;
pub mod taints;
pub mod widget;

#[cfg(test)]
mod testing;

pub use config::{HostConfig, TaintPolicy};
pub use error::{Fatal, HostError};
pub use log::{Level, Logger};
pub use runtime::{Host, Running, Runtime};
