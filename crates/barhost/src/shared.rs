//! Process-wide shared execution context.
//!
//! Created on first use, never torn down. Widgets whose `event` handler is a
//! source string have it compiled and run here, under the context's bracket.

use std::sync::OnceLock;

use crate::error::LuaError;
use crate::handoff::Exclusive;
use crate::lua::{LuaRef, LuaState};

static SHARED: OnceLock<Exclusive<LuaState>> = OnceLock::new();

/// The shared context, creating it if needed.
///
/// Racing first calls may each build a state; only one is kept.
pub fn shared_context() -> Result<&'static Exclusive<LuaState>, LuaError> {
    if let Some(ctx) = SHARED.get() {
        return Ok(ctx);
    }
    let state = LuaState::with_stdlib()?;
    Ok(SHARED.get_or_init(|| Exclusive::new(state)))
}

/// The shared context, if anything has created it yet.
pub fn try_shared_context() -> Option<&'static Exclusive<LuaState>> {
    SHARED.get()
}

/// A value anchored in the shared context's registry; released on drop.
#[derive(Debug)]
pub struct SharedRef(LuaRef);

impl SharedRef {
    /// Compile `source` in the shared context.
    pub fn compile(source: &str, chunk_name: &str) -> Result<SharedRef, crate::error::WidgetError> {
        let ctx = shared_context()?;
        let r = ctx.with(|lua| lua.load_chunk(source, chunk_name))??;
        Ok(SharedRef(r))
    }

    pub fn key(&self) -> LuaRef {
        self.0
    }
}

impl Drop for SharedRef {
    fn drop(&mut self) {
        if let Some(ctx) = try_shared_context() {
            // Widgets are never dropped from inside a handoff.
            let _ = ctx.with(|lua| lua.unref(self.0));
        }
    }
}
