use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::error::{VmError, VmResult};
use crate::ffi::{NativeCall, NativeReturn};
use crate::instance::Instance;
use crate::jit::JitConfig;
use crate::layout::InstanceLayout;
use crate::module::Module;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RuntimeConfig {
    /// Instruction RAM available for compiled code.
    pub iram_bytes: u32,
    pub frame_arena_bytes: u32,
    pub alloca_bytes: u32,
    pub heap_bytes: u32,
    pub native_stack_bytes: u32,
    pub max_call_depth: u32,
    /// Instructions one native entry may execute before it is aborted.
    /// Unbounded by default; self-jump traps are caught regardless.
    pub native_step_budget: Option<u64>,
    pub jit: JitConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            iram_bytes: 64 * 1024,
            frame_arena_bytes: 64 * 1024,
            alloca_bytes: 16 * 1024,
            heap_bytes: 64 * 1024,
            native_stack_bytes: 32 * 1024,
            max_call_depth: 256,
            native_step_budget: None,
            jit: JitConfig::default(),
        }
    }
}

/// A host routine callable from bytecode through an import.
pub trait HostFunction {
    fn call(&mut self, call: &mut NativeCall<'_>) -> VmResult<NativeReturn>;
}

pub type StaticHostFunction = fn(&mut NativeCall<'_>) -> VmResult<NativeReturn>;

type HostFactory = dyn Fn() -> Box<dyn HostFunction> + Send + Sync;

enum RegistryEntry {
    Factory(Box<HostFactory>),
    Static(StaticHostFunction),
}

/// A host function bound to one import of one instance.
pub(crate) enum BoundHost {
    Dynamic(Box<dyn HostFunction>),
    Static(StaticHostFunction),
}

/// Host symbols by name. Stateful functions are registered as factories so
/// every instance gets its own copy.
#[derive(Default)]
pub struct HostFunctionRegistry {
    entries: Vec<RegistryEntry>,
    by_name: HashMap<String, usize>,
}

impl HostFunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn HostFunction> + Send + Sync + 'static,
    {
        self.insert(name.into(), RegistryEntry::Factory(Box::new(factory)));
    }

    pub fn register_static(&mut self, name: impl Into<String>, function: StaticHostFunction) {
        self.insert(name.into(), RegistryEntry::Static(function));
    }

    fn insert(&mut self, name: String, entry: RegistryEntry) {
        if let Some(&slot) = self.by_name.get(&name)
            && let Some(existing) = self.entries.get_mut(slot)
        {
            *existing = entry;
            return;
        }
        self.by_name.insert(name, self.entries.len());
        self.entries.push(entry);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn bind(&self, name: &str) -> Option<BoundHost> {
        let slot = *self.by_name.get(name)?;
        match self.entries.get(slot)? {
            RegistryEntry::Factory(factory) => Some(BoundHost::Dynamic(factory())),
            RegistryEntry::Static(function) => Some(BoundHost::Static(*function)),
        }
    }
}

/// Owns the host symbol registry and the configuration every instance is
/// created with.
#[derive(Default)]
pub struct Runtime {
    config: RuntimeConfig,
    hosts: HostFunctionRegistry,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            hosts: HostFunctionRegistry::new(),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut RuntimeConfig {
        &mut self.config
    }

    pub fn hosts(&self) -> &HostFunctionRegistry {
        &self.hosts
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn HostFunction> + Send + Sync + 'static,
    {
        self.hosts.register(name, factory);
    }

    pub fn register_static(&mut self, name: impl Into<String>, function: StaticHostFunction) {
        self.hosts.register_static(name, function);
    }

    /// Links `module` against the registered host functions and lays out a
    /// fresh instance.
    pub fn instantiate(&self, module: Arc<Module>) -> VmResult<Instance> {
        let mut hosts = Vec::with_capacity(module.imports.len());
        for import in &module.imports {
            let bound = self
                .hosts
                .bind(&import.name)
                .ok_or_else(|| VmError::UnboundImport(import.name.clone()))?;
            hosts.push(Some(bound));
        }
        let layout = InstanceLayout::compute(&module, &self.config);
        debug!(
            functions = module.functions.len(),
            imports = module.imports.len(),
            dram_bytes = layout.dram_size,
            "instantiating module"
        );
        Instance::new(module, self.config.clone(), layout, hosts)
    }
}
