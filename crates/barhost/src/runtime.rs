//! Startup and the production runtime.
//!
//! [`Host::start`] loads every widget, loads the barlib, checks taints, inits
//! the barlib and then every widget, and finally spawns one worker thread per
//! inited widget plus the event watcher thread if the barlib has one.
//!
//! Workers hand values to the barlib through the bracket protocol:
//!
//! - `call_begin`: open the widget's bracket, check the stack is empty, push
//!   `cb`, return the context;
//! - `call_end`: check exactly one value was pushed, call `cb(value)`, hand
//!   the result to the barlib under its lock, reset the stack, close;
//! - `call_cancel`: reset the stack and close without rendering.
//!
//! Lock order is always widget context, then barlib.

use std::ffi::c_void;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use barhost_abi::lua::lua_State;
use barhost_abi::{ProducerRunFuncs, RendererEventFuncs};

use crate::bar::{BarAdapter, LoadedBar};
use crate::config::{HostConfig, TaintPolicy};
use crate::error::{Fatal, HostError, SetError};
use crate::handoff::Exclusive;
use crate::log::Logger;
use crate::log_at;
use crate::lua::LuaState;
use crate::module::{DlOpen, ModuleLoader};
use crate::shared;
use crate::taints;
use crate::widget::{EventHandler, InitedWidget, LoadEnv, Slot};

/// Decides what a fatal runtime error means for the process.
pub type FatalHandler = Arc<dyn Fn(&Fatal) + Send + Sync>;

/// The default fatal handler: terminate the process.
///
/// Uses `_exit` so no atexit handlers run while other workers are still
/// inside module code.
pub fn exit_on_fatal(_fatal: &Fatal) {
    unsafe { libc::_exit(1) }
}

// =============================================================================
// Host: startup
// =============================================================================

pub struct Host {
    config: HostConfig,
    logger: Logger,
    loader: Arc<dyn ModuleLoader>,
    on_fatal: FatalHandler,
}

impl Host {
    pub fn new(config: HostConfig, logger: Logger) -> Self {
        Self {
            loader: Arc::new(DlOpen::new(logger.clone())),
            config,
            logger,
            on_fatal: Arc::new(exit_on_fatal),
        }
    }

    pub fn with_loader(mut self, loader: impl ModuleLoader + 'static) -> Self {
        self.loader = Arc::new(loader);
        self
    }

    pub fn with_fatal_handler(mut self, handler: impl Fn(&Fatal) + Send + Sync + 'static) -> Self {
        self.on_fatal = Arc::new(handler);
        self
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Bring everything up and start producing.
    pub fn start(&self, barlib: &str, options: &[String], widget_paths: &[PathBuf]) -> Result<Running, HostError> {
        let env = LoadEnv {
            config: &self.config,
            loader: &*self.loader,
            logger: &self.logger,
        };

        let mut slots = Vec::with_capacity(widget_paths.len());
        for path in widget_paths {
            slots.push(Slot::load_or_dummy(&env, path)?);
        }
        if slots.is_empty() {
            log_at!(self.logger, Warn, "no widgets specified");
        }

        let bar = LoadedBar::load_by_name(&*self.loader, &self.config, barlib).map_err(|source| HostError::Barlib {
            name: barlib.to_string(),
            source,
        })?;

        if !taints::check(&bar, &slots, &self.logger) {
            match self.config.taint_policy {
                TaintPolicy::Abort => return Err(HostError::Taints),
                TaintPolicy::Warn => {
                    log_at!(self.logger, Warn, "entities that share the same taint have been found; starting anyway")
                }
            }
        }

        let bar = bar.init(&self.logger, options, slots.len()).map_err(|(bar, e)| {
            bar.unload();
            HostError::BarInit(e)
        })?;

        let mut inited = Vec::with_capacity(slots.len());
        for slot in slots {
            inited.push(slot.init_or_dummy(&self.logger, &bar)?);
        }

        let runtime = Arc::new(Runtime {
            slots: inited,
            bar,
            logger: self.logger.clone(),
            on_fatal: Arc::clone(&self.on_fatal),
        });

        for (i, slot) in runtime.slots.iter().enumerate() {
            if matches!(slot, Slot::Dummy(_)) {
                if let Err(fatal) = runtime.bar.set_error(i) {
                    runtime.fatal(&fatal);
                    return Err(fatal.into());
                }
            }
        }

        let mut workers = Vec::new();
        for (i, slot) in runtime.slots.iter().enumerate() {
            if matches!(slot, Slot::Inited(_)) {
                workers.push(spawn_worker(&runtime, i)?);
            }
        }

        let watcher = if runtime.bar.has_event_watcher() {
            Some(spawn_event_watcher(&runtime)?)
        } else {
            None
        };

        Ok(Running {
            runtime,
            workers,
            watcher,
        })
    }
}

// =============================================================================
// Runtime
// =============================================================================

/// Everything the worker threads share.
pub struct Runtime {
    // Widgets are torn down before the barlib.
    slots: Vec<Slot>,
    bar: BarAdapter,
    logger: Logger,
    on_fatal: FatalHandler,
}

impl Runtime {
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn bar(&self) -> &BarAdapter {
        &self.bar
    }

    fn fatal(&self, fatal: &Fatal) {
        log_at!(self.logger, Fatal, "{}", fatal);
        (self.on_fatal)(fatal);
    }

    fn protocol_violation(&self, msg: String) {
        self.fatal(&Fatal::Protocol(msg));
    }

    fn set_error(&self, slot: usize) {
        if let Err(fatal) = self.bar.set_error(slot) {
            self.fatal(&fatal);
        }
    }

    fn inited(&self, slot: usize) -> Option<&InitedWidget> {
        match self.slots.get(slot) {
            Some(Slot::Inited(w)) => Some(w),
            _ => None,
        }
    }

    // ── producer brackets ──

    fn produce_begin(&self, slot: usize) -> *mut lua_State {
        let Some(w) = self.inited(slot) else {
            self.protocol_violation(format!("call_begin() for slot {} which has no running plugin", slot));
            return std::ptr::null_mut();
        };
        let lua = match unsafe { w.context().enter() } {
            Ok(lua) => unsafe { &mut *lua },
            Err(e) => {
                self.protocol_violation(format!("call_begin(): {}", e));
                return std::ptr::null_mut();
            }
        };
        if lua.top() != 0 {
            log_at!(w.logger(), Warn, "call_begin(): stack is not empty ({} values), resetting", lua.top());
            lua.set_top(0);
        }
        lua.push_ref(w.loaded().cb());
        lua.as_ptr()
    }

    fn produce_end(&self, slot: usize) {
        let Some(w) = self.inited(slot) else {
            self.protocol_violation(format!("call_end() for slot {} which has no running plugin", slot));
            return;
        };
        let Some(lua) = w.context().held() else {
            self.protocol_violation("call_end() without a matching call_begin()".to_string());
            return;
        };
        let lua = unsafe { &mut *lua };

        // cb plus the pushed value
        let depth = lua.top();
        if depth != 2 {
            log_at!(
                w.logger(),
                Error,
                "call_end(): expected exactly one value to be pushed, stack depth is {} (should be 2)",
                depth
            );
            self.set_error(slot);
        } else {
            match lua.pcall(1, 1) {
                Ok(()) => self.render(lua, slot, w.logger()),
                Err(e) => {
                    log_at!(w.logger(), Error, "(lua) {}", e);
                    self.set_error(slot);
                }
            }
        }
        lua.set_top(0);
        self.leave(w.context());
    }

    fn produce_cancel(&self, slot: usize) {
        let Some(w) = self.inited(slot) else {
            self.protocol_violation(format!("call_cancel() for slot {} which has no running plugin", slot));
            return;
        };
        let Some(lua) = w.context().held() else {
            self.protocol_violation("call_cancel() without a matching call_begin()".to_string());
            return;
        };
        unsafe { (*lua).set_top(0) };
        self.leave(w.context());
    }

    /// Hand the value on top of `lua` to the barlib; malformed values turn
    /// into an error for the slot.
    fn render(&self, lua: &mut LuaState, slot: usize, logger: &Logger) {
        let mut bar = self.bar.lock();
        match bar.set(lua, slot) {
            Ok(()) => {}
            Err(SetError::Malformed) => {
                log_at!(logger, Warn, "barlib rejected the value returned by cb");
                if let Err(fatal) = bar.set_error(slot) {
                    drop(bar);
                    self.fatal(&fatal);
                }
            }
            Err(SetError::Fatal(fatal)) => {
                drop(bar);
                self.fatal(&fatal);
            }
        }
    }

    fn leave(&self, ctx: &Exclusive<LuaState>) {
        if let Err(e) = unsafe { ctx.leave() } {
            self.protocol_violation(e.to_string());
        }
    }

    // ── event brackets ──

    fn event_target(&self, slot: usize) -> Result<(&Exclusive<LuaState>, &EventHandler), String> {
        let Some(w) = self.slots.get(slot) else {
            return Err(format!("event for slot {}, but there are only {} widgets", slot, self.slots.len()));
        };
        let ctx = match w.event() {
            EventHandler::Shared(_) => {
                shared::try_shared_context().ok_or_else(|| "shared context is gone".to_string())?
            }
            _ => w.context(),
        };
        Ok((ctx, w.event()))
    }

    fn event_begin(&self, slot: usize) -> *mut lua_State {
        let (ctx, handler) = match self.event_target(slot) {
            Ok(target) => target,
            Err(msg) => {
                self.protocol_violation(format!("event_watcher: {}", msg));
                return std::ptr::null_mut();
            }
        };
        let lua = match unsafe { ctx.enter() } {
            Ok(lua) => unsafe { &mut *lua },
            Err(e) => {
                self.protocol_violation(format!("event_watcher call_begin(): {}", e));
                return std::ptr::null_mut();
            }
        };
        if lua.top() != 0 {
            log_at!(self.logger, Warn, "event call_begin(): stack is not empty ({} values), resetting", lua.top());
            lua.set_top(0);
        }
        match handler {
            EventHandler::None => lua.push_nil(),
            EventHandler::Own(r) => lua.push_ref(*r),
            EventHandler::Shared(r) => lua.push_ref(r.key()),
        }
        lua.as_ptr()
    }

    fn event_end(&self, slot: usize) {
        let (ctx, handler) = match self.event_target(slot) {
            Ok(target) => target,
            Err(msg) => {
                self.protocol_violation(format!("event_watcher: {}", msg));
                return;
            }
        };
        let Some(lua) = ctx.held() else {
            self.protocol_violation("event_watcher call_end() without a matching call_begin()".to_string());
            return;
        };
        let lua = unsafe { &mut *lua };

        let depth = lua.top();
        if depth != 2 {
            log_at!(
                self.logger,
                Error,
                "event call_end(): expected exactly one value to be pushed, stack depth is {} (should be 2)",
                depth
            );
            self.set_error(slot);
        } else if !matches!(handler, EventHandler::None) {
            if let Err(e) = lua.pcall(1, 0) {
                log_at!(self.logger, Error, "(lua) event handler of widget #{}: {}", slot, e);
                self.set_error(slot);
            }
        }
        lua.set_top(0);
        self.leave(ctx);
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("slots", &self.slots.len())
            .field("bar", &self.bar)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// FFI trampolines
// =============================================================================

/// `userdata` of a worker's [`ProducerRunFuncs`].
struct WorkerLink {
    runtime: Arc<Runtime>,
    slot: usize,
}

unsafe extern "C" fn worker_call_begin(userdata: *mut c_void) -> *mut lua_State {
    let link = &*(userdata as *const WorkerLink);
    link.runtime.produce_begin(link.slot)
}

unsafe extern "C" fn worker_call_end(userdata: *mut c_void) {
    let link = &*(userdata as *const WorkerLink);
    link.runtime.produce_end(link.slot)
}

unsafe extern "C" fn worker_call_cancel(userdata: *mut c_void) {
    let link = &*(userdata as *const WorkerLink);
    link.runtime.produce_cancel(link.slot)
}

unsafe extern "C" fn watcher_call_begin(userdata: *mut c_void, slot: usize) -> *mut lua_State {
    let runtime = &*(userdata as *const Runtime);
    runtime.event_begin(slot)
}

unsafe extern "C" fn watcher_call_end(userdata: *mut c_void, slot: usize) {
    let runtime = &*(userdata as *const Runtime);
    runtime.event_end(slot)
}

fn spawn_worker(runtime: &Arc<Runtime>, slot: usize) -> std::io::Result<JoinHandle<()>> {
    let link = WorkerLink {
        runtime: Arc::clone(runtime),
        slot,
    };
    thread::Builder::new()
        .name(format!("widget-{}", slot))
        .spawn(move || {
            let Some(w) = link.runtime.inited(link.slot) else {
                return;
            };
            let funcs = ProducerRunFuncs {
                userdata: &link as *const WorkerLink as *mut c_void,
                call_begin: worker_call_begin,
                call_end: worker_call_end,
                call_cancel: worker_call_cancel,
            };
            unsafe { w.run(funcs) };
            log_at!(
                w.logger(),
                Warn,
                "plugin's run() for widget '{}' has returned",
                w.loaded().path().display()
            );
            link.runtime.set_error(link.slot);
        })
}

fn spawn_event_watcher(runtime: &Arc<Runtime>) -> std::io::Result<JoinHandle<()>> {
    let runtime = Arc::clone(runtime);
    thread::Builder::new()
        .name("event-watcher".to_string())
        .spawn(move || {
            let funcs = RendererEventFuncs {
                userdata: Arc::as_ptr(&runtime) as *mut c_void,
                call_begin: watcher_call_begin,
                call_end: watcher_call_end,
            };
            match runtime.bar.run_event_watcher(funcs) {
                Some(Ok(())) => log_at!(runtime.logger, Info, "barlib's event_watcher() has returned"),
                Some(Err(fatal)) => runtime.fatal(&fatal),
                None => {}
            }
        })
}

// =============================================================================
// Running
// =============================================================================

/// A started host.
#[derive(Debug)]
pub struct Running {
    runtime: Arc<Runtime>,
    workers: Vec<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
}

impl Running {
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Wait for every worker and the event watcher to return.
    ///
    /// Returns the runtime so the caller decides when to tear it down, or
    /// `None` if a thread could not be joined.
    pub fn wait(self) -> Option<Runtime> {
        let Running {
            runtime,
            workers,
            watcher,
        } = self;
        let mut clean = true;
        for handle in workers.into_iter().chain(watcher) {
            let name = handle.thread().name().unwrap_or("?").to_string();
            if handle.join().is_err() {
                log_at!(runtime.logger, Error, "thread '{}' panicked", name);
                clean = false;
            }
        }
        log_at!(runtime.logger, Info, "all plugins' run() and barlib's event_watcher() have returned");
        if !clean {
            return None;
        }
        Arc::try_unwrap(runtime).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{HandoffError, InitError};
    use crate::module::ModuleKind;
    use crate::lua::LuaType;
    use crate::testing::{
        echo_state, recorder, recording_logger, FakeLoader, FakeModule, RecordingSink, PRODUCER_ECHO, PRODUCER_FAILING,
        PRODUCER_FOO, RENDERER_BAD_SLOT, RENDERER_COUNTED, RENDERER_EVENTS, RENDERER_FAILING, RENDERER_FATAL_WATCHER,
        RENDERER_RECORDER,
    };
    use crate::widget::WidgetState;
    use serial_test::serial;
    use std::io::Write;
    use std::sync::Mutex;

    struct Harness {
        host: Host,
        sink: Arc<RecordingSink>,
        fatals: Arc<Mutex<Vec<String>>>,
        scripts: Vec<tempfile::NamedTempFile>,
    }

    impl Harness {
        fn new(loader: FakeLoader) -> Self {
            Self::with_config(loader, HostConfig::default())
        }

        fn with_config(loader: FakeLoader, config: HostConfig) -> Self {
            let (logger, sink) = recording_logger();
            let fatals = Arc::new(Mutex::new(Vec::new()));
            let recorded = Arc::clone(&fatals);
            let host = Host::new(config.with_plugins_dir("/plugins").with_barlibs_dir("/barlibs"), logger)
                .with_loader(loader)
                .with_fatal_handler(move |f| recorded.lock().unwrap().push(f.to_string()));
            Self {
                host,
                sink,
                fatals,
                scripts: Vec::new(),
            }
        }

        fn script(&mut self, source: &str) -> PathBuf {
            let mut file = tempfile::Builder::new().suffix(".lua").tempfile().unwrap();
            file.write_all(source.as_bytes()).unwrap();
            let path = file.path().to_path_buf();
            self.scripts.push(file);
            path
        }

        fn fatals(&self) -> Vec<String> {
            self.fatals.lock().unwrap().clone()
        }
    }

    fn loader() -> FakeLoader {
        FakeLoader::new()
            .with("/plugins/echo.so", FakeModule::producer(&PRODUCER_ECHO))
            .with("/plugins/foo.so", FakeModule::producer(&PRODUCER_FOO))
            .with("/plugins/failing.so", FakeModule::producer(&PRODUCER_FAILING))
            .with("/barlibs/rec.so", FakeModule::renderer(&RENDERER_RECORDER))
            .with("/barlibs/events.so", FakeModule::renderer(&RENDERER_EVENTS))
            .with("/barlibs/badslot.so", FakeModule::renderer(&RENDERER_BAD_SLOT))
            .with("/barlibs/fatalwatch.so", FakeModule::renderer(&RENDERER_FATAL_WATCHER))
            .with("/barlibs/counted.so", FakeModule::renderer(&RENDERER_COUNTED))
            .with("/barlibs/failing.so", FakeModule::renderer(&RENDERER_FAILING))
    }

    fn history(runtime: &Runtime, slot: usize) -> Vec<String> {
        unsafe { recorder(runtime.bar().data_ptr()) }.history(slot)
    }

    fn global_string(ctx: &Exclusive<LuaState>, name: &str) -> Option<String> {
        ctx.with(|lua| {
            lua.restore_top(|lua| {
                lua.push_globals();
                lua.raw_get_field(-1, name);
                lua.to_string_lossy(-1)
            })
        })
        .unwrap()
    }

    #[test]
    fn values_flow_through_cb_to_the_barlib() {
        let mut h = Harness::new(loader());
        let w = h.script("widget = { plugin = 'echo', opts = { count = 3 }, cb = function(n) return 'v' .. n end }");
        let running = h.host.start("rec", &[], &[w]).unwrap();
        assert_eq!(running.worker_count(), 1);
        let runtime = running.wait().unwrap();
        assert_eq!(history(&runtime, 0), vec!["v1", "v2", "v3", "<error>"]);
        assert!(h.fatals().is_empty());
    }

    #[test]
    fn returning_run_is_reported_once() {
        let mut h = Harness::new(loader());
        let w = h.script("widget = { plugin = 'echo', cb = function(n) return n end }");
        let runtime = h.host.start("rec", &[], &[w.clone()]).unwrap().wait().unwrap();
        assert_eq!(history(&runtime, 0), vec!["<error>"]);
        let expected = format!("plugin's run() for widget '{}' has returned", w.display());
        assert_eq!(h.sink.messages().iter().filter(|m| **m == expected).count(), 1);
    }

    #[test]
    fn cancelled_values_are_not_rendered() {
        let mut h = Harness::new(loader());
        let w = h.script(
            "widget = { plugin = 'echo', opts = { count = 3, cancel_at = 2 }, cb = function(n) return n end }",
        );
        let runtime = h.host.start("rec", &[], &[w]).unwrap().wait().unwrap();
        assert_eq!(history(&runtime, 0), vec!["1", "3", "<error>"]);
        let Slot::Inited(inited) = &runtime.slots()[0] else {
            panic!("widget should be inited");
        };
        assert_eq!(inited.context().with(|lua| lua.top()).unwrap(), 0);
    }

    #[test]
    fn failing_cb_sets_error() {
        let mut h = Harness::new(loader());
        let w = h.script(
            "widget = { plugin = 'echo', opts = { count = 2 }, cb = function(n) if n == 1 then error('nope') end return n end }",
        );
        let runtime = h.host.start("rec", &[], &[w]).unwrap().wait().unwrap();
        assert_eq!(history(&runtime, 0), vec!["<error>", "2", "<error>"]);
        assert!(h.sink.messages().iter().any(|m| m.contains("nope")));
    }

    #[test]
    fn malformed_value_sets_error() {
        let mut h = Harness::new(loader());
        let w = h.script("widget = { plugin = 'echo', opts = { count = 1 }, cb = function(n) return {} end }");
        let runtime = h.host.start("rec", &[], &[w]).unwrap().wait().unwrap();
        assert_eq!(history(&runtime, 0), vec!["<error>", "<error>"]);
        assert!(h.fatals().is_empty());
    }

    #[test]
    fn popped_callback_reports_stack_depth() {
        let mut h = Harness::new(loader());
        let w = h.script("widget = { plugin = 'echo', opts = { count = 2, pop_at = 1 }, cb = function(n) return n end }");
        let runtime = h.host.start("rec", &[], &[w]).unwrap().wait().unwrap();
        assert_eq!(history(&runtime, 0), vec!["<error>", "2", "<error>"]);
        let errors = h.sink.messages_at(crate::log::Level::Error);
        assert!(errors.iter().any(|m| m.contains("stack depth is 0 (should be 2)")), "{:?}", errors);
        assert!(h.fatals().is_empty());
    }

    #[test]
    fn default_fatal_handler_exits_with_status_1() {
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0);
        if pid == 0 {
            exit_on_fatal(&Fatal::Set);
        }
        let mut status = 0;
        assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 1);
    }

    #[test]
    fn fatal_set_goes_to_handler() {
        let mut h = Harness::new(loader());
        let w = h.script("widget = { plugin = 'echo', opts = { count = 1 }, cb = function(n) return 'FATAL' end }");
        h.host.start("rec", &[], &[w]).unwrap().wait().unwrap();
        assert_eq!(h.fatals(), vec![Fatal::Set.to_string()]);
        assert!(h.sink.messages_at(crate::log::Level::Fatal).contains(&Fatal::Set.to_string()));
    }

    #[test]
    fn reentrant_begin_is_refused() {
        let mut h = Harness::new(loader());
        let w = h.script("widget = { plugin = 'echo', opts = { reenter = true }, cb = function(n) return n end }");
        let runtime = h.host.start("rec", &[], &[w]).unwrap().wait().unwrap();
        let Slot::Inited(inited) = &runtime.slots()[0] else {
            panic!("widget should be inited");
        };
        let state = unsafe { echo_state(inited.data_ptr()) };
        assert!(state.second_begin_refused.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(h.fatals(), vec![format!("protocol violation: call_begin(): {}", HandoffError::Reentrant)]);
        // The first bracket was closed by call_cancel.
        assert!(!inited.context().is_held_by_current_thread());
        assert!(inited.context().begin().is_ok());
    }

    #[test]
    fn broken_widgets_become_dummies_with_error() {
        let mut h = Harness::new(loader());
        let good = h.script("widget = { plugin = 'echo', opts = { count = 1 }, cb = function(n) return n end }");
        let broken = h.script("widget = { plugin = 'echo' }");
        let failing = h.script("widget = { plugin = 'failing', cb = function(n) return n end }");
        let running = h.host.start("rec", &[], &[broken, good, failing]).unwrap();
        assert_eq!(running.worker_count(), 1);
        let runtime = running.wait().unwrap();
        let states: Vec<_> = runtime.slots().iter().map(Slot::state).collect();
        assert_eq!(states, vec![WidgetState::Dummy, WidgetState::Inited, WidgetState::Dummy]);
        assert_eq!(history(&runtime, 0), vec!["<error>"]);
        assert_eq!(history(&runtime, 1), vec!["1", "<error>"]);
        assert_eq!(history(&runtime, 2), vec!["<error>"]);
    }

    #[test]
    fn barlib_sees_options_and_slot_count() {
        let mut h = Harness::new(loader());
        let a = h.script("widget = { plugin = 'echo', cb = function(n) return n end }");
        let b = h.script("widget = {}");
        let opts = vec!["-x".to_string(), "font=mono".to_string()];
        let runtime = h.host.start("rec", &opts, &[a, b]).unwrap().wait().unwrap();
        let rec = unsafe { recorder(runtime.bar().data_ptr()) };
        assert_eq!(rec.options(), opts);
        assert_eq!(rec.slot_count(), 2);
    }

    #[test]
    fn no_widgets_is_only_a_warning() {
        let h = Harness::new(loader());
        let running = h.host.start("rec", &[], &[]).unwrap();
        assert_eq!(running.worker_count(), 0);
        running.wait().unwrap();
        assert!(h.sink.messages_at(crate::log::Level::Warn).contains(&"no widgets specified".to_string()));
    }

    #[test]
    fn missing_barlib() {
        let h = Harness::new(loader());
        let err = h.host.start("nope", &[], &[]).unwrap_err();
        assert!(matches!(err, HostError::Barlib { ref name, .. } if name == "nope"));
    }

    #[test]
    fn barlib_init_failure_stops_startup() {
        let mut h = Harness::new(loader());
        let w = h.script("widget = { plugin = 'echo', cb = function(n) return n end }");
        let err = h.host.start("failing", &[], &[w]).unwrap_err();
        assert!(matches!(err, HostError::BarInit(InitError::Module(ModuleKind::Renderer))));
        assert_eq!(err.to_string(), "can't init the barlib: barlib's init() failed");
    }

    #[test]
    fn taint_conflict_aborts_by_default() {
        let mut h = Harness::new(loader());
        let w = h.script("widget = { plugin = 'foo', cb = function(n) return n end }");
        let err = h.host.start("rec", &[], &[w]).unwrap_err();
        assert!(matches!(err, HostError::Taints));
        assert!(h.sink.messages().contains(&"the following entities share taint 'libfoo':".to_string()));
    }

    #[test]
    fn taint_conflict_can_be_tolerated() {
        let mut h = Harness::with_config(loader(), HostConfig::default().with_taint_policy(TaintPolicy::Warn));
        let w = h.script("widget = { plugin = 'foo', opts = { count = 1 }, cb = function(n) return n end }");
        let runtime = h.host.start("rec", &[], &[w]).unwrap().wait().unwrap();
        assert_eq!(history(&runtime, 0), vec!["1", "<error>"]);
    }

    #[test]
    fn events_reach_the_widget_handler() {
        let mut h = Harness::new(loader());
        let w = h.script(
            "widget = { plugin = 'echo', cb = function(n) return n end,\n\
             event = function(e) if e == 'boom' then error('bad event') end clicked = e end }",
        );
        let runtime = h.host.start("events", &[], &[w]).unwrap().wait().unwrap();
        assert_eq!(global_string(runtime.slots()[0].context(), "clicked").as_deref(), Some("click"));
        assert!(h.sink.messages().iter().any(|m| m.contains("bad event")));
        // One error from the failing handler, one from run() returning.
        assert_eq!(history(&runtime, 0).iter().filter(|e| *e == "<error>").count(), 2);
        assert!(h.fatals().is_empty());
    }

    #[test]
    fn string_event_handlers_run_in_shared_context() {
        let mut h = Harness::new(loader());
        let w = h.script(
            "widget = { plugin = 'echo', cb = function(n) return n end,\n\
             event = 'local e = ... ; if e == \"click\" then shared_clicked = e end' }",
        );
        let runtime = h.host.start("events", &[], &[w]).unwrap().wait().unwrap();
        let shared = shared::shared_context().unwrap();
        assert_eq!(global_string(shared, "shared_clicked").as_deref(), Some("click"));
        assert_eq!(global_string(runtime.slots()[0].context(), "shared_clicked"), None);
    }

    #[test]
    fn events_for_widgets_without_handler_are_dropped() {
        let mut h = Harness::new(loader());
        let w = h.script("widget = { plugin = 'echo', cb = function(n) return n end }");
        let runtime = h.host.start("events", &[], &[w]).unwrap().wait().unwrap();
        assert_eq!(history(&runtime, 0), vec!["<error>"]);
        assert!(h.fatals().is_empty());
    }

    #[test]
    fn event_for_unknown_slot_is_a_protocol_violation() {
        let mut h = Harness::new(loader());
        let w = h.script("widget = { plugin = 'echo', cb = function(n) return n end }");
        h.host.start("badslot", &[], &[w]).unwrap().wait().unwrap();
        assert_eq!(
            h.fatals(),
            vec!["protocol violation: event_watcher: event for slot 99, but there are only 1 widgets".to_string()]
        );
    }

    #[test]
    fn fatal_event_watcher_goes_to_handler() {
        let h = Harness::new(loader());
        h.host.start("fatalwatch", &[], &[]).unwrap().wait().unwrap();
        assert_eq!(h.fatals(), vec![Fatal::EventWatcher.to_string()]);
    }

    #[test]
    #[serial(renderer_destroy)]
    fn teardown_destroys_barlib_after_widgets() {
        let mut h = Harness::new(loader());
        let w = h.script("widget = { plugin = 'echo', cb = function(n) return n end }");
        let before = crate::testing::counted_renderer_destroyed();
        let runtime = h.host.start("counted", &[], &[w]).unwrap().wait().unwrap();
        assert_eq!(crate::testing::counted_renderer_destroyed(), before);
        drop(runtime);
        assert_eq!(crate::testing::counted_renderer_destroyed(), before + 1);
    }

    #[test]
    fn widget_context_is_clean_between_values() {
        let mut h = Harness::new(loader());
        let w = h.script(
            "widget = { plugin = 'echo', opts = { count = 5 }, cb = function(n) depth = select('#', n) return n end }",
        );
        let runtime = h.host.start("rec", &[], &[w]).unwrap().wait().unwrap();
        assert_eq!(global_string(runtime.slots()[0].context(), "depth").as_deref(), Some("1"));
        assert_eq!(runtime.slots()[0].context().with(|lua| lua.top()).unwrap(), 0);
        let t = runtime.slots()[0]
            .context()
            .with(|lua| lua.restore_top(|lua| {
                lua.push_globals();
                lua.raw_get_field(-1, "barhost")
            }))
            .unwrap();
        assert_eq!(t, LuaType::Table);
    }
}
