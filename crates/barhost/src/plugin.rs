//! Producer modules ("plugins").

use std::path::Path;

use barhost_abi::ProducerIface;

use crate::config::HostConfig;
use crate::error::LoadError;
use crate::module::{ModuleKind, ModuleLoader, NativeModule, ProducerAbi};

/// A loaded producer module and the name it was requested by.
#[derive(Debug)]
pub struct Plugin {
    module: NativeModule<ProducerAbi>,
    name: String,
}

impl Plugin {
    /// Resolve `name` against the plugin directory and load it.
    pub fn load_by_name(loader: &dyn ModuleLoader, config: &HostConfig, name: &str) -> Result<Self, LoadError> {
        let path = config.resolve(ModuleKind::Producer, name);
        Self::load(loader, &path, name)
    }

    pub fn load(loader: &dyn ModuleLoader, path: &Path, name: &str) -> Result<Self, LoadError> {
        Ok(Self {
            module: NativeModule::load(loader, path)?,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &NativeModule<ProducerAbi> {
        &self.module
    }

    pub fn iface(&self) -> &ProducerIface {
        self.module.iface()
    }

    pub fn taints(&self) -> Vec<String> {
        self.module.taints()
    }

    pub fn unload(self) {
        drop(self);
    }
}
