//! Host configuration: where modules live and what a taint conflict means.

use std::env;
use std::path::{Path, PathBuf};

use crate::module::ModuleKind;

/// Compiled-in plugin directory (`BARHOST_PREFIX/lib/barhost/plugins` unless
/// overridden at build time).
pub const DEFAULT_PLUGINS_DIR: &str = env!("BARHOST_DEFAULT_PLUGINS_DIR");
pub const DEFAULT_BARLIBS_DIR: &str = env!("BARHOST_DEFAULT_BARLIBS_DIR");
pub const DEFAULT_MODULE_SUFFIX: &str = env!("BARHOST_DEFAULT_MODULE_SUFFIX");

pub const PLUGINS_DIR_ENV: &str = "BARHOST_PLUGINS_DIR";
pub const BARLIBS_DIR_ENV: &str = "BARHOST_BARLIBS_DIR";

/// What to do when two modules declare the same taint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaintPolicy {
    /// Refuse to start.
    #[default]
    Abort,
    /// Log the conflict and start anyway.
    Warn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub plugins_dir: PathBuf,
    pub barlibs_dir: PathBuf,
    pub module_suffix: String,
    pub taint_policy: TaintPolicy,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            plugins_dir: PathBuf::from(DEFAULT_PLUGINS_DIR),
            barlibs_dir: PathBuf::from(DEFAULT_BARLIBS_DIR),
            module_suffix: DEFAULT_MODULE_SUFFIX.to_string(),
            taint_policy: TaintPolicy::default(),
        }
    }
}

impl HostConfig {
    /// Defaults, with directories overridden by `BARHOST_PLUGINS_DIR` and
    /// `BARHOST_BARLIBS_DIR` when set and non-empty.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var_os(key).map(PathBuf::from))
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<PathBuf>) -> Self {
        let mut config = Self::default();
        if let Some(dir) = lookup(PLUGINS_DIR_ENV).filter(|d| !d.as_os_str().is_empty()) {
            config.plugins_dir = dir;
        }
        if let Some(dir) = lookup(BARLIBS_DIR_ENV).filter(|d| !d.as_os_str().is_empty()) {
            config.barlibs_dir = dir;
        }
        config
    }

    pub fn with_plugins_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plugins_dir = dir.into();
        self
    }

    pub fn with_barlibs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.barlibs_dir = dir.into();
        self
    }

    pub fn with_module_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.module_suffix = suffix.into();
        self
    }

    pub fn with_taint_policy(mut self, policy: TaintPolicy) -> Self {
        self.taint_policy = policy;
        self
    }

    pub fn module_dir(&self, kind: ModuleKind) -> &Path {
        match kind {
            ModuleKind::Producer => &self.plugins_dir,
            ModuleKind::Renderer => &self.barlibs_dir,
        }
    }

    /// Resolve a module name to a path.
    ///
    /// A name containing `/` is taken as a path; anything else becomes
    /// `<dir>/<name><suffix>`.
    pub fn resolve(&self, kind: ModuleKind, name: &str) -> PathBuf {
        if name.contains('/') {
            PathBuf::from(name)
        } else {
            self.module_dir(kind)
                .join(format!("{}{}", name, self.module_suffix))
        }
    }
}
