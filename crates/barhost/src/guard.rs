//! Module binary lifetime guard.
//!
//! `ModuleGuard` is an `Arc`-wrapped handle to an opened module. As long as
//! any clone exists, the library stays mapped and every function pointer
//! copied out of its interface table remains valid.
//!
//! Function pointers never travel alone: they are wrapped in [`GuardedFn`],
//! which carries a guard clone. Instance state holds the guarded `destroy`
//! pointer, so the library can only be closed after `destroy` has run.

use std::ffi::{c_void, CStr};
use std::ptr::NonNull;
use std::sync::Arc;

// =============================================================================
// Library: the symbol source behind a guard
// =============================================================================

/// An opened module. Closing happens when the value is dropped.
pub trait Library: Send + Sync {
    /// Resolve an exported symbol; the error is a human-readable reason.
    fn symbol(&self, name: &CStr) -> Result<NonNull<c_void>, String>;
}

// =============================================================================
// ModuleGuard: the clone-able reference
// =============================================================================

/// Ref-counted guard that keeps a module's shared library loaded.
#[derive(Clone)]
pub struct ModuleGuard {
    inner: Arc<dyn Library>,
}

impl ModuleGuard {
    pub fn new(library: impl Library + 'static) -> Self {
        Self {
            inner: Arc::new(library),
        }
    }

    pub fn symbol(&self, name: &CStr) -> Result<NonNull<c_void>, String> {
        self.inner.symbol(name)
    }

    /// Number of live references to the module binary.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl std::fmt::Debug for ModuleGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleGuard")
            .field("refs", &self.ref_count())
            .finish()
    }
}

// =============================================================================
// GuardedFn: a function pointer whose module binary is kept alive
// =============================================================================

/// A function pointer that keeps its module's binary loaded.
///
/// `F` is a concrete `unsafe extern "C" fn(..)` type, which is `Copy`.
pub struct GuardedFn<F: Copy> {
    f: F,
    guard: ModuleGuard,
}

impl<F: Copy> GuardedFn<F> {
    pub fn new(f: F, guard: ModuleGuard) -> Self {
        Self { f, guard }
    }

    /// Get the raw function pointer.
    ///
    /// The pointer is only valid while this `GuardedFn` (or a clone of its
    /// guard) is alive. Do not stash it.
    pub fn get(&self) -> F {
        self.f
    }

    pub fn guard(&self) -> &ModuleGuard {
        &self.guard
    }
}

impl<F: Copy> Clone for GuardedFn<F> {
    fn clone(&self) -> Self {
        Self {
            f: self.f,
            guard: self.guard.clone(),
        }
    }
}
