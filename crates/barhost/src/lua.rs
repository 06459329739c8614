//! Execution contexts.
//!
//! [`LuaState`] owns a raw Lua state and exposes the handful of stack
//! operations the host needs. Modules receive the raw pointer and use the
//! Lua C API themselves; everything the host does goes through this type.

use std::ffi::{c_char, c_int, CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::ptr::NonNull;

use mlua_sys as ffi;

use crate::error::LuaError;

/// Extra stack slots guaranteed to module callbacks.
pub const MODULE_STACK_RESERVE: c_int = 15;

/// Exit code reported for commands that could not be started.
const SPAWN_FAILED: c_int = 127;

const SHELL: &str = "/bin/sh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LuaType {
    None,
    Nil,
    Boolean,
    LightUserdata,
    Number,
    String,
    Table,
    Function,
    Userdata,
    Thread,
}

impl LuaType {
    fn from_raw(raw: c_int) -> LuaType {
        match raw {
            ffi::LUA_TNIL => LuaType::Nil,
            ffi::LUA_TBOOLEAN => LuaType::Boolean,
            ffi::LUA_TLIGHTUSERDATA => LuaType::LightUserdata,
            ffi::LUA_TNUMBER => LuaType::Number,
            ffi::LUA_TSTRING => LuaType::String,
            ffi::LUA_TTABLE => LuaType::Table,
            ffi::LUA_TFUNCTION => LuaType::Function,
            ffi::LUA_TUSERDATA => LuaType::Userdata,
            ffi::LUA_TTHREAD => LuaType::Thread,
            _ => LuaType::None,
        }
    }

    /// The name Lua's `type()` would print.
    pub fn name(self) -> &'static str {
        match self {
            LuaType::None => "no value",
            LuaType::Nil => "nil",
            LuaType::Boolean => "boolean",
            LuaType::LightUserdata | LuaType::Userdata => "userdata",
            LuaType::Number => "number",
            LuaType::String => "string",
            LuaType::Table => "table",
            LuaType::Function => "function",
            LuaType::Thread => "thread",
        }
    }
}

/// A value anchored in a state's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LuaRef(c_int);

impl LuaRef {
    /// Pushes `nil`.
    pub const NIL: LuaRef = LuaRef(ffi::LUA_REFNIL);

    pub fn is_nil(self) -> bool {
        self.0 == ffi::LUA_REFNIL
    }
}

pub struct LuaState {
    raw: NonNull<ffi::lua_State>,
}

// A state is only ever used by one thread at a time: either through `&mut`
// or inside a handoff bracket.
unsafe impl Send for LuaState {}

impl LuaState {
    /// A bare state without any library.
    pub fn new() -> Result<Self, LuaError> {
        let raw = unsafe { ffi::luaL_newstate() };
        NonNull::new(raw)
            .map(|raw| LuaState { raw })
            .ok_or(LuaError::StateAlloc)
    }

    /// A state with the standard libraries and the host's bindings.
    pub fn with_stdlib() -> Result<Self, LuaError> {
        let mut lua = Self::new()?;
        unsafe { ffi::luaL_openlibs(lua.as_ptr()) };
        lua.install_bindings();
        Ok(lua)
    }

    pub fn as_ptr(&self) -> *mut ffi::lua_State {
        self.raw.as_ptr()
    }

    // ── stack ──

    pub fn top(&self) -> c_int {
        unsafe { ffi::lua_gettop(self.as_ptr()) }
    }

    pub fn set_top(&mut self, idx: c_int) {
        unsafe { ffi::lua_settop(self.as_ptr(), idx) }
    }

    pub fn pop(&mut self, n: c_int) {
        unsafe { ffi::lua_settop(self.as_ptr(), -n - 1) }
    }

    pub fn ensure_stack(&mut self, extra: c_int) -> bool {
        unsafe { ffi::lua_checkstack(self.as_ptr(), extra) != 0 }
    }

    /// Run `f`, then truncate the stack back to where it was.
    pub fn restore_top<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let top = self.top();
        let result = f(self);
        self.set_top(top);
        result
    }

    pub fn type_of(&self, idx: c_int) -> LuaType {
        LuaType::from_raw(unsafe { ffi::lua_type(self.as_ptr(), idx) })
    }

    /// Strings and numbers, as Lua's `lua_isstring` sees them.
    pub fn is_string(&self, idx: c_int) -> bool {
        unsafe { ffi::lua_isstring(self.as_ptr(), idx) != 0 }
    }

    /// The string at `idx`. Numbers are converted in place, like
    /// `lua_tolstring` does; other types yield `None`.
    pub fn to_string_lossy(&mut self, idx: c_int) -> Option<String> {
        if !self.is_string(idx) {
            return None;
        }
        let mut len = 0usize;
        let ptr = unsafe { ffi::lua_tolstring(self.as_ptr(), idx, &mut len) };
        if ptr.is_null() {
            return None;
        }
        let bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, len) };
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn push_nil(&mut self) {
        unsafe { ffi::lua_pushnil(self.as_ptr()) }
    }

    pub fn push_str(&mut self, s: &str) {
        unsafe { push_bytes(self.as_ptr(), s.as_bytes()) }
    }

    pub fn push_integer(&mut self, n: i64) {
        unsafe { ffi::lua_pushinteger(self.as_ptr(), n as ffi::lua_Integer) }
    }

    pub fn new_table(&mut self) {
        unsafe { ffi::lua_createtable(self.as_ptr(), 0, 0) }
    }

    pub fn push_globals(&mut self) {
        unsafe {
            ffi::lua_rawgeti(self.as_ptr(), ffi::LUA_REGISTRYINDEX, ffi::LUA_RIDX_GLOBALS as ffi::lua_Integer);
        }
    }

    /// Push `t[key]` for the table at `idx`, without metamethods.
    pub fn raw_get_field(&mut self, idx: c_int, key: &str) -> LuaType {
        let l = self.as_ptr();
        unsafe {
            let t = ffi::lua_absindex(l, idx);
            push_bytes(l, key.as_bytes());
            LuaType::from_raw(ffi::lua_rawget(l, t))
        }
    }

    /// Pop a value and store it as `t[key]` for the table at `idx`, without
    /// metamethods.
    pub fn raw_set_field(&mut self, idx: c_int, key: &str) {
        let l = self.as_ptr();
        unsafe {
            let t = ffi::lua_absindex(l, idx);
            push_bytes(l, key.as_bytes());
            ffi::lua_rotate(l, -2, 1);
            ffi::lua_rawset(l, t);
        }
    }

    pub fn set_function(&mut self, idx: c_int, key: &str, f: ffi::lua_CFunction) {
        let t = unsafe { ffi::lua_absindex(self.as_ptr(), idx) };
        unsafe { ffi::lua_pushcfunction(self.as_ptr(), f) };
        self.raw_set_field(t, key);
    }

    // ── registry ──

    /// Pop the top value into the registry.
    pub fn make_ref(&mut self) -> LuaRef {
        LuaRef(unsafe { ffi::luaL_ref(self.as_ptr(), ffi::LUA_REGISTRYINDEX) })
    }

    pub fn push_ref(&mut self, r: LuaRef) {
        if r.is_nil() {
            self.push_nil();
        } else {
            unsafe {
                ffi::lua_rawgeti(self.as_ptr(), ffi::LUA_REGISTRYINDEX, r.0 as ffi::lua_Integer);
            }
        }
    }

    pub fn unref(&mut self, r: LuaRef) {
        unsafe { ffi::luaL_unref(self.as_ptr(), ffi::LUA_REGISTRYINDEX, r.0) }
    }

    // ── code ──

    /// Load and run a script file.
    pub fn exec_file(&mut self, path: &Path) -> Result<(), LuaError> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| LuaError::Nul(path.display().to_string()))?;
        let status = unsafe { ffi::luaL_loadfilex(self.as_ptr(), c_path.as_ptr(), std::ptr::null()) };
        self.check(status)?;
        self.pcall(0, 0)
    }

    /// Compile `source` and anchor the resulting function in the registry.
    pub fn load_chunk(&mut self, source: &str, chunk_name: &str) -> Result<LuaRef, LuaError> {
        let name = CString::new(chunk_name).map_err(|_| LuaError::Nul(chunk_name.to_string()))?;
        let status = unsafe {
            ffi::luaL_loadbufferx(
                self.as_ptr(),
                source.as_ptr() as *const c_char,
                source.len(),
                name.as_ptr(),
                std::ptr::null(),
            )
        };
        self.check(status)?;
        Ok(self.make_ref())
    }

    /// Call the function below `nargs` arguments. On error the message is
    /// popped and returned.
    pub fn pcall(&mut self, nargs: c_int, nresults: c_int) -> Result<(), LuaError> {
        let status = unsafe { ffi::lua_pcall(self.as_ptr(), nargs, nresults, 0) };
        self.check(status)
    }

    fn check(&mut self, status: c_int) -> Result<(), LuaError> {
        if status == ffi::LUA_OK {
            return Ok(());
        }
        let message = self
            .to_string_lossy(-1)
            .unwrap_or_else(|| format!("({})", self.type_of(-1).name()));
        self.pop(1);
        Err(match status {
            ffi::LUA_ERRRUN | ffi::LUA_ERRSYNTAX | ffi::LUA_ERRFILE => LuaError::Runtime(message),
            ffi::LUA_ERRMEM => LuaError::Memory(message),
            ffi::LUA_ERRERR => LuaError::Handler(message),
            code => LuaError::Unknown { code, message },
        })
    }

    // ── bindings ──

    /// Replace the thread-unsafe parts of `os` and add the `barhost` table.
    fn install_bindings(&mut self) {
        self.restore_top(|lua| {
            lua.push_globals();

            if lua.raw_get_field(-1, "os") == LuaType::Table {
                lua.set_function(-1, "execute", os_execute_unsafe);
                lua.set_function(-1, "exit", os_exit_unsafe);
                lua.set_function(-1, "setlocale", os_setlocale_unsafe);
                lua.set_function(-1, "getenv", os_getenv_locked);
            }
            lua.pop(1);

            lua.new_table();
            lua.set_function(-1, "rc", barhost_rc);
            lua.set_function(-1, "dollar", barhost_dollar);
            lua.set_function(-1, "spawn", barhost_spawn);
            lua.raw_set_field(-2, "barhost");
        });
    }
}

impl Drop for LuaState {
    fn drop(&mut self) {
        unsafe { ffi::lua_close(self.as_ptr()) }
    }
}

impl std::fmt::Debug for LuaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LuaState").field("raw", &self.raw).finish()
    }
}

unsafe fn push_bytes(l: *mut ffi::lua_State, bytes: &[u8]) {
    ffi::lua_pushlstring(l, bytes.as_ptr() as *const c_char, bytes.len());
}

// =============================================================================
// Script bindings
// =============================================================================
//
// `lua_error` does not return. Every owned value must be dropped before it is
// called, hence the split into a fallible Rust body and a thin raising shell.

unsafe fn raise(l: *mut ffi::lua_State, result: Result<c_int, String>) -> c_int {
    match result {
        Ok(n) => n,
        Err(msg) => {
            push_bytes(l, msg.as_bytes());
            drop(msg);
            ffi::lua_error(l)
        }
    }
}

unsafe extern "C-unwind" fn os_execute_unsafe(l: *mut ffi::lua_State) -> c_int {
    raise(
        l,
        Err("os.execute() is not thread-safe; use barhost.rc(), barhost.dollar() or barhost.spawn() instead".into()),
    )
}

unsafe extern "C-unwind" fn os_exit_unsafe(l: *mut ffi::lua_State) -> c_int {
    raise(l, Err("os.exit() is not thread-safe".into()))
}

unsafe extern "C-unwind" fn os_setlocale_unsafe(l: *mut ffi::lua_State) -> c_int {
    raise(l, Err("os.setlocale() is not thread-safe".into()))
}

/// `os.getenv` through the standard library's environment lock, so it
/// cannot race with `setenv` on another thread.
unsafe extern "C-unwind" fn os_getenv_locked(l: *mut ffi::lua_State) -> c_int {
    let result = read_string(l, 1).ok_or_else(|| "os.getenv: expected string".to_string()).map(|name| {
        match std::env::var_os(OsStr::from_bytes(&name)) {
            Some(value) => push_bytes(l, value.as_bytes()),
            None => ffi::lua_pushnil(l),
        }
        1
    });
    raise(l, result)
}

unsafe extern "C-unwind" fn barhost_rc(l: *mut ffi::lua_State) -> c_int {
    let result = read_argv(l, "barhost.rc").map(|argv| {
        let code = match command(&argv).stdout(Stdio::inherit()).status() {
            Ok(status) => exit_code(status),
            Err(_) => SPAWN_FAILED,
        };
        ffi::lua_pushinteger(l, code as ffi::lua_Integer);
        1
    });
    raise(l, result)
}

unsafe extern "C-unwind" fn barhost_dollar(l: *mut ffi::lua_State) -> c_int {
    let result = read_argv(l, "barhost.dollar").map(|argv| {
        let (output, code) = match command(&argv).stdout(Stdio::piped()).stderr(Stdio::inherit()).output() {
            Ok(out) => (out.stdout, exit_code(out.status)),
            Err(_) => (Vec::new(), SPAWN_FAILED),
        };
        let trimmed = trim_trailing_newlines(&output);
        push_bytes(l, trimmed);
        ffi::lua_pushinteger(l, code as ffi::lua_Integer);
        2
    });
    raise(l, result)
}

unsafe extern "C-unwind" fn barhost_spawn(l: *mut ffi::lua_State) -> c_int {
    // `sh` backgrounds the command and exits at once, so the child is
    // reparented instead of lingering as our zombie.
    let result = read_argv(l, "barhost.spawn").and_then(|argv| spawn_detached(Path::new(SHELL), &argv).map(|()| 0));
    raise(l, result)
}

fn spawn_detached(shell: &Path, argv: &[Vec<u8>]) -> Result<(), String> {
    Command::new(shell)
        .arg("-c")
        .arg("exec \"$@\" &")
        .arg("sh")
        .args(argv.iter().map(|a| OsStr::from_bytes(a)))
        .stdin(Stdio::null())
        .status()
        .map(|_| ())
        .map_err(|e| format!("barhost.spawn: can't spawn child process: {}", e))
}

/// Value at `idx` if it is a string or a number, converted to bytes.
unsafe fn read_string(l: *mut ffi::lua_State, idx: c_int) -> Option<Vec<u8>> {
    if ffi::lua_isstring(l, idx) == 0 {
        return None;
    }
    let mut len = 0usize;
    let ptr = ffi::lua_tolstring(l, idx, &mut len);
    Some(std::slice::from_raw_parts(ptr as *const u8, len).to_vec())
}

/// The single table-of-strings argument of the process helpers. Numbers are
/// accepted and converted.
unsafe fn read_argv(l: *mut ffi::lua_State, func: &str) -> Result<Vec<Vec<u8>>, String> {
    if ffi::lua_gettop(l) != 1 {
        return Err(format!("{}: expected exactly one argument", func));
    }
    if ffi::lua_type(l, 1) != ffi::LUA_TTABLE {
        return Err(format!("{}: expected table of strings", func));
    }
    let mut argv = Vec::new();
    for i in 1.. {
        let t = ffi::lua_rawgeti(l, 1, i as ffi::lua_Integer);
        if t == ffi::LUA_TNIL {
            ffi::lua_settop(l, -2);
            break;
        }
        let arg = read_string(l, -1);
        ffi::lua_settop(l, -2);
        match arg {
            Some(arg) => argv.push(arg),
            None => return Err(format!("{}: element {} is not a string", func, i)),
        }
    }
    if argv.is_empty() {
        return Err(format!("{}: empty command", func));
    }
    Ok(argv)
}

fn command(argv: &[Vec<u8>]) -> Command {
    let mut cmd = Command::new(OsStr::from_bytes(&argv[0]));
    cmd.args(argv[1..].iter().map(|a| OsStr::from_bytes(a)))
        .stdin(Stdio::null());
    cmd
}

fn exit_code(status: ExitStatus) -> c_int {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        (None, None) => SPAWN_FAILED,
    }
}

fn trim_trailing_newlines(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().rposition(|&b| b != b'\n').map_or(0, |i| i + 1);
    &bytes[..end]
}
