//! Widgets.
//!
//! A widget is a Lua script plus the plugin it asks for:
//!
//! ```lua
//! widget = {
//!     plugin = 'clock',
//!     opts = { format = '%H:%M' },
//!     cb = function(t) return t end,
//!     event = function(e) end,   -- optional
//! }
//! ```
//!
//! Each lifecycle stage is its own type:
//!
//! - [`DummyWidget`]: an empty context; stands in for widgets that failed
//!   to load or init, so slot indices stay dense;
//! - [`LoadedWidget`]: script ran, contract checked, plugin opened;
//! - [`InitedWidget`]: plugin instance created, ready to run.
//!
//! [`Slot`] holds whichever stage a widget reached.

use std::path::{Path, PathBuf};

use barhost_abi::{ProducerData, ProducerRunFuncs, BARHOST_OK};

use crate::bar::BarAdapter;
use crate::config::HostConfig;
use crate::error::{InitError, LuaError, WidgetError};
use crate::handoff::Exclusive;
use crate::log::Logger;
use crate::log_at;
use crate::lua::{LuaRef, LuaState, LuaType, MODULE_STACK_RESERVE};
use crate::module::{Instance, ModuleKind, ModuleLoader, PendingInstance};
use crate::plugin::Plugin;
use crate::shared::SharedRef;

/// Everything a widget needs to load its plugin.
#[derive(Clone, Copy)]
pub struct LoadEnv<'a> {
    pub config: &'a HostConfig,
    pub loader: &'a dyn ModuleLoader,
    pub logger: &'a Logger,
}

/// The widget's `event` handler.
#[derive(Debug)]
pub enum EventHandler {
    None,
    /// A function in the widget's own context.
    Own(LuaRef),
    /// Source compiled in the shared context.
    Shared(SharedRef),
}

// =============================================================================
// DUMMY
// =============================================================================

#[derive(Debug)]
pub struct DummyWidget {
    ctx: Exclusive<LuaState>,
}

impl DummyWidget {
    pub fn load() -> Result<Self, LuaError> {
        Ok(Self {
            ctx: Exclusive::new(LuaState::new()?),
        })
    }

    pub fn context(&self) -> &Exclusive<LuaState> {
        &self.ctx
    }

    pub fn unload(self) {
        drop(self);
    }
}

// =============================================================================
// LOADED
// =============================================================================

pub struct LoadedWidget {
    // Dropped top to bottom: the context goes before the plugin, so nothing
    // the plugin registered in it outlives the module.
    ctx: Exclusive<LuaState>,
    event: EventHandler,
    cb: LuaRef,
    path: PathBuf,
    plugin: Plugin,
}

impl LoadedWidget {
    pub fn load(env: &LoadEnv<'_>, path: &Path) -> Result<Self, WidgetError> {
        let mut lua = LuaState::with_stdlib()?;
        lua.exec_file(path)?;

        let (plugin_name, cb, event) = lua.restore_top(|lua| -> Result<_, WidgetError> {
            lua.push_globals();
            let t = lua.raw_get_field(-1, "widget");
            if t != LuaType::Table {
                return Err(WidgetError::NotATable(t.name()));
            }

            let t = lua.raw_get_field(-1, "plugin");
            let plugin_name = match lua.to_string_lossy(-1) {
                Some(name) => name,
                None => return Err(WidgetError::PluginName(t.name())),
            };
            lua.pop(1);

            let t = lua.raw_get_field(-1, "cb");
            if t != LuaType::Function {
                return Err(WidgetError::Callback(t.name()));
            }
            let cb = lua.make_ref();

            let event = match lua.raw_get_field(-1, "event") {
                LuaType::Nil => EventHandler::None,
                LuaType::Function => EventHandler::Own(lua.make_ref()),
                LuaType::String => {
                    let source = lua.to_string_lossy(-1).unwrap_or_default();
                    let chunk_name = format!("={}:event", path.display());
                    EventHandler::Shared(SharedRef::compile(&source, &chunk_name)?)
                }
                other => return Err(WidgetError::Event(other.name())),
            };
            Ok((plugin_name, cb, event))
        })?;

        let plugin = Plugin::load_by_name(env.loader, env.config, &plugin_name).map_err(|source| {
            WidgetError::Plugin {
                name: plugin_name.clone(),
                source,
            }
        })?;

        Ok(Self {
            ctx: Exclusive::new(lua),
            event,
            cb,
            path: path.to_path_buf(),
            plugin,
        })
    }

    /// Create the plugin instance from `widget.opts`.
    ///
    /// On failure the widget is handed back, still loaded.
    pub fn init(mut self, logger: &Logger) -> Result<InitedWidget, (LoadedWidget, InitError)> {
        let logger = logger.scoped(format!("{}@{}", self.plugin.name(), self.path.display()));
        let iface = *self.plugin.iface();
        let pending = PendingInstance::<ProducerData>::new(logger);

        let result = self.ctx.get_mut().restore_top(|lua| {
            lua.push_globals();
            let t = lua.raw_get_field(-1, "widget");
            if t != LuaType::Table {
                return Err(InitError::NotATable(t.name()));
            }
            match lua.raw_get_field(-1, "opts") {
                LuaType::Table => {}
                LuaType::Nil => {
                    lua.pop(1);
                    lua.new_table();
                }
                other => return Err(InitError::BadOptions(other.name())),
            }
            lua.ensure_stack(MODULE_STACK_RESERVE);
            match unsafe { (iface.init)(pending.data_ptr(), lua.as_ptr()) } {
                BARHOST_OK => Ok(()),
                _ => Err(InitError::Module(ModuleKind::Producer)),
            }
        });

        match result {
            Ok(()) => Ok(InitedWidget {
                instance: pending.activate(self.plugin.module().guarded(iface.destroy)),
                loaded: self,
            }),
            Err(e) => Err((self, e)),
        }
    }

    pub fn context(&self) -> &Exclusive<LuaState> {
        &self.ctx
    }

    pub fn plugin(&self) -> &Plugin {
        &self.plugin
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cb(&self) -> LuaRef {
        self.cb
    }

    pub fn event(&self) -> &EventHandler {
        &self.event
    }

    pub fn unload(self) {
        drop(self);
    }
}

impl std::fmt::Debug for LoadedWidget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedWidget")
            .field("path", &self.path)
            .field("plugin", &self.plugin.name())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// INITED
// =============================================================================

pub struct InitedWidget {
    // `destroy` runs before the loaded widget is dropped.
    instance: Instance<ProducerData>,
    loaded: LoadedWidget,
}

impl InitedWidget {
    /// Install `barhost.plugin` and `barhost.barlib` in the widget's context
    /// for the modules that provide script functions.
    pub fn register_funcs(&self, bar: &BarAdapter) -> Result<(), crate::error::HandoffError> {
        let register = self.loaded.plugin.iface().register_funcs;
        let data = self.instance.data_ptr();
        let logger = self.instance.logger();
        self.loaded.ctx.with(|lua| {
            lua.restore_top(|lua| {
                lua.push_globals();
                if lua.raw_get_field(-1, "barhost") != LuaType::Table {
                    log_at!(
                        logger,
                        Warn,
                        "'barhost' is not a table anymore, will not register plugin and barlib functions"
                    );
                    return;
                }
                if let Some(register) = register {
                    lua.new_table();
                    let top = lua.top();
                    lua.ensure_stack(MODULE_STACK_RESERVE);
                    unsafe { register(data, lua.as_ptr()) };
                    lua.set_top(top);
                    lua.raw_set_field(-2, "plugin");
                }
                if bar.register_funcs(lua) {
                    lua.raw_set_field(-2, "barlib");
                }
            })
        })
    }

    /// Run the plugin's production loop on the calling thread.
    ///
    /// # Safety
    ///
    /// `funcs` must implement the bracket protocol for this widget.
    pub(crate) unsafe fn run(&self, funcs: ProducerRunFuncs) {
        (self.loaded.plugin.iface().run)(self.instance.data_ptr(), funcs);
    }

    pub fn loaded(&self) -> &LoadedWidget {
        &self.loaded
    }

    pub fn context(&self) -> &Exclusive<LuaState> {
        self.loaded.context()
    }

    pub fn logger(&self) -> &Logger {
        self.instance.logger()
    }

    /// Destroy the plugin instance, keeping everything else.
    pub fn uninit(self) -> LoadedWidget {
        let InitedWidget { instance, loaded } = self;
        drop(instance);
        loaded
    }

    pub fn unload(self) {
        drop(self);
    }

    #[cfg(test)]
    pub(crate) fn data_ptr(&self) -> *mut ProducerData {
        self.instance.data_ptr()
    }
}

impl std::fmt::Debug for InitedWidget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitedWidget").field("loaded", &self.loaded).finish_non_exhaustive()
    }
}

// =============================================================================
// Slot
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WidgetState {
    Dummy,
    Loaded,
    Inited,
}

#[derive(Debug)]
pub enum Slot {
    Dummy(DummyWidget),
    Loaded(LoadedWidget),
    Inited(InitedWidget),
}

static NO_EVENT: EventHandler = EventHandler::None;

impl Slot {
    /// Load the widget at `path`, falling back to a dummy if it is broken.
    pub fn load_or_dummy(env: &LoadEnv<'_>, path: &Path) -> Result<Slot, LuaError> {
        match LoadedWidget::load(env, path) {
            Ok(w) => Ok(Slot::Loaded(w)),
            Err(e) => {
                log_at!(env.logger, Error, "can't load widget '{}': {}", path.display(), e);
                Ok(Slot::Dummy(DummyWidget::load()?))
            }
        }
    }

    /// Init a loaded widget and register its script functions. Widgets that
    /// fail to init are unloaded and replaced with a dummy.
    pub fn init_or_dummy(self, logger: &Logger, bar: &BarAdapter) -> Result<Slot, LuaError> {
        let loaded = match self {
            Slot::Loaded(w) => w,
            other => return Ok(other),
        };
        let path = loaded.path().to_path_buf();
        match loaded.init(logger) {
            Ok(inited) => {
                if let Err(e) = inited.register_funcs(bar) {
                    log_at!(logger, Error, "widget '{}': {}", path.display(), e);
                }
                Ok(Slot::Inited(inited))
            }
            Err((loaded, e)) => {
                log_at!(logger, Error, "can't init widget '{}': {}", path.display(), e);
                loaded.unload();
                Ok(Slot::Dummy(DummyWidget::load()?))
            }
        }
    }

    pub fn state(&self) -> WidgetState {
        match self {
            Slot::Dummy(_) => WidgetState::Dummy,
            Slot::Loaded(_) => WidgetState::Loaded,
            Slot::Inited(_) => WidgetState::Inited,
        }
    }

    pub fn context(&self) -> &Exclusive<LuaState> {
        match self {
            Slot::Dummy(w) => w.context(),
            Slot::Loaded(w) => w.context(),
            Slot::Inited(w) => w.context(),
        }
    }

    fn loaded(&self) -> Option<&LoadedWidget> {
        match self {
            Slot::Dummy(_) => None,
            Slot::Loaded(w) => Some(w),
            Slot::Inited(w) => Some(w.loaded()),
        }
    }

    pub fn plugin(&self) -> Option<&Plugin> {
        self.loaded().map(LoadedWidget::plugin)
    }

    pub fn path(&self) -> Option<&Path> {
        self.loaded().map(LoadedWidget::path)
    }

    pub fn event(&self) -> &EventHandler {
        self.loaded().map_or(&NO_EVENT, LoadedWidget::event)
    }

    pub fn unload(self) {
        drop(self);
    }
}
