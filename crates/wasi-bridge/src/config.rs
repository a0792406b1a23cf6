//! Configuration of a bridge session.
//!
//! Everything except the hooks can be read from JSON:
//!
//! ```json
//! {
//!   "asyncWorkPoolSize": 2,
//!   "memory": { "initialPages": 17, "maximumPages": 16384 },
//!   "wasi": { "version": "preview1", "fs": { "/": null, "/data/in.txt": "hi" } }
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use wasmtime::Linker;

use crate::error::{Error, Result};
use crate::host::HostState;
use crate::loader::InitContext;
use crate::memory::MemoryConfig;
use crate::pool::{ThreadFactory, WorkerFactory};
use crate::vfs::{DEFAULT_MAX_FILE_SIZE, FileContent, VfsSnapshot};
use crate::wasi::StdioMode;
use crate::wasi::clock::{ClockSource, RandomSource};

pub const DEFAULT_POOL_SIZE: usize = 4;

/// 64 KiB, the default shadow stack size of wasm-ld.
pub const DEFAULT_WORKER_STACK_SIZE: u64 = 64 * 1024;

pub const WASI_PREVIEW1: &str = "preview1";

pub type OverwriteImports = dyn Fn(&mut Linker<HostState>) -> anyhow::Result<()> + Send + Sync;
pub type BeforeInit = dyn Fn(&mut InitContext<'_>) -> anyhow::Result<()> + Send + Sync;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WasiConfig {
    pub version: String,
    pub fs: VfsSnapshot,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub stdin: Option<FileContent>,
    pub stdio: StdioMode,
    pub clock: ClockSource,
    pub random: RandomSource,
    /// Largest size, in bytes, a file in the filesystem may grow to.
    pub max_file_size: u64,
}

impl Default for WasiConfig {
    fn default() -> Self {
        Self {
            version: WASI_PREVIEW1.to_string(),
            fs: VfsSnapshot::default(),
            args: Vec::new(),
            env: BTreeMap::new(),
            stdin: None,
            stdio: StdioMode::default(),
            clock: ClockSource::default(),
            random: RandomSource::default(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BridgeConfig {
    pub async_work_pool_size: usize,
    /// Bound on calls waiting for a worker; unbounded when `None`.
    pub queue_capacity: Option<usize>,
    pub memory: MemoryConfig,
    pub wasi: WasiConfig,
    /// Registration hooks to run, in this order, instead of the ones
    /// discovered in the export table.
    pub registration_hooks: Option<Vec<String>>,
    /// Shadow stack, in bytes, given to each worker of a module that
    /// exports `__stack_pointer`.
    pub worker_stack_size: u64,
    #[serde(skip)]
    pub(crate) overwrite_imports: Option<Arc<OverwriteImports>>,
    #[serde(skip)]
    pub(crate) before_init: Option<Arc<BeforeInit>>,
    #[serde(skip, default = "default_factory")]
    pub(crate) worker_factory: Arc<dyn WorkerFactory>,
}

fn default_factory() -> Arc<dyn WorkerFactory> {
    Arc::new(ThreadFactory::default())
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            async_work_pool_size: DEFAULT_POOL_SIZE,
            queue_capacity: None,
            memory: MemoryConfig::default(),
            wasi: WasiConfig::default(),
            registration_hooks: None,
            worker_stack_size: DEFAULT_WORKER_STACK_SIZE,
            overwrite_imports: None,
            before_init: None,
            worker_factory: default_factory(),
        }
    }
}

impl Debug for BridgeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("async_work_pool_size", &self.async_work_pool_size)
            .field("queue_capacity", &self.queue_capacity)
            .field("memory", &self.memory)
            .field("wasi", &self.wasi)
            .field("registration_hooks", &self.registration_hooks)
            .field("worker_stack_size", &self.worker_stack_size)
            .field("overwrite_imports", &self.overwrite_imports.is_some())
            .field("before_init", &self.before_init.is_some())
            .finish_non_exhaustive()
    }
}

impl BridgeConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.async_work_pool_size == 0 {
            return Err(Error::InvalidArgument(
                "asyncWorkPoolSize must be at least 1".into(),
            ));
        }
        if self.queue_capacity == Some(0) {
            return Err(Error::InvalidArgument(
                "queueCapacity must be at least 1".into(),
            ));
        }
        if self.wasi.version != WASI_PREVIEW1 {
            return Err(Error::InvalidArgument(format!(
                "unsupported wasi version {:?}, only {WASI_PREVIEW1:?} is available",
                self.wasi.version
            )));
        }
        if self.memory.initial_pages > self.memory.maximum_pages {
            return Err(Error::InvalidArgument(format!(
                "initialPages ({}) exceeds maximumPages ({})",
                self.memory.initial_pages, self.memory.maximum_pages
            )));
        }
        if self.worker_stack_size == 0 || self.worker_stack_size % 16 != 0 {
            return Err(Error::InvalidArgument(format!(
                "workerStackSize must be a non-zero multiple of 16, got {}",
                self.worker_stack_size
            )));
        }
        Ok(())
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.async_work_pool_size = size;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: impl Into<Option<usize>>) -> Self {
        self.queue_capacity = capacity.into();
        self
    }

    pub fn with_worker_stack_size(mut self, size: u64) -> Self {
        self.worker_stack_size = size;
        self
    }

    pub fn with_memory(mut self, memory: MemoryConfig) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_wasi(mut self, wasi: WasiConfig) -> Self {
        self.wasi = wasi;
        self
    }

    pub fn with_fs(mut self, fs: VfsSnapshot) -> Self {
        self.wasi.fs = fs;
        self
    }

    pub fn with_registration_hooks(
        mut self,
        hooks: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.registration_hooks = Some(hooks.into_iter().map(Into::into).collect());
        self
    }

    /// Patches the linker after the bridge defined its imports and before
    /// the module is instantiated. Definitions made here replace the bridge's.
    pub fn overwrite_imports(
        mut self,
        hook: impl Fn(&mut Linker<HostState>) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.overwrite_imports = Some(Arc::new(hook));
        self
    }

    /// Runs once the module is instantiated, before any binding is callable.
    /// Export registration runs afterwards unless the hook already triggered
    /// it through [`InitContext::register_exports`].
    pub fn before_init(
        mut self,
        hook: impl Fn(&mut InitContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.before_init = Some(Arc::new(hook));
        self
    }

    /// Replaces the factory that starts pool workers.
    pub fn on_create_worker(mut self, factory: impl WorkerFactory + 'static) -> Self {
        self.worker_factory = Arc::new(factory);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{DEFAULT_INITIAL_PAGES, DEFAULT_MAXIMUM_PAGES};

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.async_work_pool_size, 4);
        assert_eq!(config.queue_capacity, None);
        assert_eq!(config.memory.initial_pages, DEFAULT_INITIAL_PAGES);
        assert_eq!(config.memory.maximum_pages, DEFAULT_MAXIMUM_PAGES);
        assert_eq!(config.wasi.version, "preview1");
        assert_eq!(config.wasi.max_file_size, 1 << 30);
        assert_eq!(config.worker_stack_size, 64 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json() -> anyhow::Result<()> {
        let config = BridgeConfig::from_json(
            r#"{
                "asyncWorkPoolSize": 2,
                "queueCapacity": 8,
                "memory": { "initialPages": 1, "maximumPages": 16 },
                "wasi": {
                    "version": "preview1",
                    "fs": { "/": null, "/data/in.txt": "hi" },
                    "args": ["prog"],
                    "env": { "A": "1" },
                    "stdio": "capture",
                    "clock": { "kind": "fixed", "nanos": 3 },
                    "random": { "kind": "seeded", "seed": 9 },
                    "maxFileSize": 4096
                },
                "registrationHooks": ["__napi_register__Foo_struct_0"],
                "workerStackSize": 131072
            }"#,
        )?;
        assert_eq!(config.async_work_pool_size, 2);
        assert_eq!(config.queue_capacity, Some(8));
        assert_eq!(config.memory.maximum_pages, 16);
        assert_eq!(config.wasi.stdio, StdioMode::Capture);
        assert_eq!(config.wasi.clock, ClockSource::Fixed { nanos: 3 });
        assert_eq!(config.wasi.random, RandomSource::Seeded { seed: 9 });
        assert_eq!(config.wasi.max_file_size, 4096);
        assert_eq!(config.worker_stack_size, 128 * 1024);
        assert_eq!(config.wasi.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(
            config.registration_hooks.as_deref(),
            Some(&["__napi_register__Foo_struct_0".to_string()][..])
        );
        Ok(())
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            BridgeConfig::from_json(r#"{"asyncWorkPoolSize": 0}"#),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            BridgeConfig::from_json(r#"{"queueCapacity": 0}"#),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            BridgeConfig::from_json(r#"{"wasi": {"version": "preview2"}}"#),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            BridgeConfig::from_json(r#"{"memory": {"initialPages": 4, "maximumPages": 2}}"#),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            BridgeConfig::from_json(r#"{"workerStackSize": 0}"#),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            BridgeConfig::from_json(r#"{"workerStackSize": 100}"#),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            BridgeConfig::from_json(r#"{"asyncWorkPoolSize": "many"}"#),
            Err(Error::Json(_))
        ));
    }

    #[test]
    fn test_builder_hooks() {
        let config = BridgeConfig::default()
            .with_pool_size(1)
            .overwrite_imports(|_| Ok(()))
            .before_init(|_| Ok(()));
        assert!(config.overwrite_imports.is_some());
        assert!(config.before_init.is_some());
        let debug = format!("{config:?}");
        assert!(debug.contains("async_work_pool_size: 1"));
    }
}
