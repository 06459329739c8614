//! Renderer modules ("barlibs").
//!
//! A barlib goes through two states: [`LoadedBar`] (module open) and
//! [`BarAdapter`] (instance inited). Every `set`/`set_error` call goes
//! through [`BarAdapter::lock`], so the renderer sees one update at a time.

use std::ffi::{c_char, CString};
use std::path::Path;

use barhost_abi::{RendererData, RendererEventFuncs, RendererIface, BARHOST_NONFATAL_ERR, BARHOST_OK};
use parking_lot::{Mutex, MutexGuard};

use crate::config::HostConfig;
use crate::error::{Fatal, InitError, LoadError, SetError};
use crate::log::Logger;
use crate::log_at;
use crate::lua::{LuaState, MODULE_STACK_RESERVE};
use crate::module::{Instance, ModuleKind, ModuleLoader, NativeModule, PendingInstance, RendererAbi};

/// An opened barlib that has not been inited.
#[derive(Debug)]
pub struct LoadedBar {
    module: NativeModule<RendererAbi>,
}

impl LoadedBar {
    /// Resolve `name` against the barlib directory and load it.
    pub fn load_by_name(loader: &dyn ModuleLoader, config: &HostConfig, name: &str) -> Result<Self, LoadError> {
        Self::load(loader, &config.resolve(ModuleKind::Renderer, name))
    }

    pub fn load(loader: &dyn ModuleLoader, path: &Path) -> Result<Self, LoadError> {
        Ok(Self {
            module: NativeModule::load(loader, path)?,
        })
    }

    pub fn path(&self) -> &Path {
        self.module.path()
    }

    pub fn taints(&self) -> Vec<String> {
        self.module.taints()
    }

    /// Init the barlib for `slots` widgets. On failure the barlib is handed
    /// back so the caller decides when to unload it.
    pub fn init(self, logger: &Logger, options: &[String], slots: usize) -> Result<BarAdapter, (LoadedBar, InitError)> {
        let c_options = match options
            .iter()
            .map(|o| CString::new(o.as_str()).map_err(|_| InitError::BadOption(o.clone())))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(opts) => opts,
            Err(e) => return Err((self, e)),
        };
        let mut argv: Vec<*const c_char> = c_options.iter().map(|o| o.as_ptr()).collect();
        argv.push(std::ptr::null());

        let logger = logger.scoped("barlib");
        let iface = *self.module.iface();
        let pending = PendingInstance::<RendererData>::new(logger.clone());
        let rc = unsafe { (iface.init)(pending.data_ptr(), argv.as_ptr(), slots) };
        if rc != BARHOST_OK {
            return Err((self, InitError::Module(ModuleKind::Renderer)));
        }

        Ok(BarAdapter {
            instance: pending.activate(self.module.guarded(iface.destroy)),
            set_mtx: Mutex::new(()),
            iface,
            slots,
            logger,
            loaded: self,
        })
    }

    pub fn unload(self) {
        drop(self);
    }
}

/// An inited barlib.
pub struct BarAdapter {
    // Field order matters: `destroy` runs before the module can be closed.
    instance: Instance<RendererData>,
    set_mtx: Mutex<()>,
    iface: RendererIface,
    slots: usize,
    logger: Logger,
    loaded: LoadedBar,
}

impl BarAdapter {
    pub fn slot_count(&self) -> usize {
        self.slots
    }

    pub fn taints(&self) -> Vec<String> {
        self.loaded.taints()
    }

    /// Take the renderer lock for one or more updates.
    pub fn lock(&self) -> BarGuard<'_> {
        BarGuard {
            bar: self,
            _lock: self.set_mtx.lock(),
        }
    }

    pub fn set(&self, lua: &mut LuaState, slot: usize) -> Result<(), SetError> {
        self.lock().set(lua, slot)
    }

    pub fn set_error(&self, slot: usize) -> Result<(), Fatal> {
        self.lock().set_error(slot)
    }

    pub fn has_event_watcher(&self) -> bool {
        self.iface.event_watcher.is_some()
    }

    /// Run the event watcher until it returns. `None` if the barlib has none.
    ///
    /// The renderer lock is not held: handoffs started from the watcher take
    /// it themselves.
    pub fn run_event_watcher(&self, funcs: RendererEventFuncs) -> Option<Result<(), Fatal>> {
        let watcher = self.iface.event_watcher?;
        let rc = unsafe { watcher(self.instance.data_ptr(), funcs) };
        Some(if rc == BARHOST_NONFATAL_ERR {
            Ok(())
        } else {
            Err(Fatal::EventWatcher)
        })
    }

    /// Let the barlib fill a table with its script functions. The table is
    /// left on top of the stack; returns false (pushing nothing) if the
    /// barlib has no such hook.
    pub fn register_funcs(&self, lua: &mut LuaState) -> bool {
        let Some(register) = self.iface.register_funcs else {
            return false;
        };
        lua.new_table();
        let top = lua.top();
        lua.ensure_stack(MODULE_STACK_RESERVE);
        unsafe { register(self.instance.data_ptr(), lua.as_ptr()) };
        lua.set_top(top);
        true
    }

    /// Destroy the instance, keeping the module open.
    pub fn destroy(self) -> LoadedBar {
        let BarAdapter { instance, loaded, .. } = self;
        drop(instance);
        loaded
    }

    pub fn unload(self) {
        drop(self);
    }

    #[cfg(test)]
    pub(crate) fn data_ptr(&self) -> *mut RendererData {
        self.instance.data_ptr()
    }
}

impl std::fmt::Debug for BarAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarAdapter")
            .field("path", &self.loaded.path())
            .field("slots", &self.slots)
            .finish_non_exhaustive()
    }
}

/// Exclusive access to the renderer.
pub struct BarGuard<'a> {
    bar: &'a BarAdapter,
    _lock: MutexGuard<'a, ()>,
}

impl BarGuard<'_> {
    /// Render the value on top of `lua` into `slot`.
    ///
    /// On success the stack is left as it was before the call. After
    /// [`SetError::Malformed`] it may be dirty; the caller resets it.
    pub fn set(&mut self, lua: &mut LuaState, slot: usize) -> Result<(), SetError> {
        let top = lua.top();
        lua.ensure_stack(MODULE_STACK_RESERVE);
        let rc = unsafe { (self.bar.iface.set)(self.bar.instance.data_ptr(), lua.as_ptr(), slot) };
        match rc {
            BARHOST_OK => {
                if lua.top() != top {
                    log_at!(
                        self.bar.logger,
                        Warn,
                        "set() for slot {} left {} extra value(s) on the stack",
                        slot,
                        lua.top() - top
                    );
                    lua.set_top(top);
                }
                Ok(())
            }
            BARHOST_NONFATAL_ERR => Err(SetError::Malformed),
            _ => Err(SetError::Fatal(Fatal::Set)),
        }
    }

    pub fn set_error(&mut self, slot: usize) -> Result<(), Fatal> {
        let rc = unsafe { (self.bar.iface.set_error)(self.bar.instance.data_ptr(), slot) };
        if rc == BARHOST_OK {
            Ok(())
        } else {
            Err(Fatal::SetError)
        }
    }
}
