//! Helpers for tests that load a module and drive its session.

use std::io::Write;

use anyhow::Result;
use wasmtime::Val;
pub use wasi_bridge_test_modules as modules;

use crate::config::BridgeConfig;
use crate::loader::Loader;
use crate::memory::MemoryConfig;
use crate::session::Session;
use crate::source::ModuleSource;
use crate::vfs::VfsSnapshot;
use crate::wasi::StdioMode;

pub struct BridgeTestBuilder {
    config: BridgeConfig,
    source: ModuleSource,
    tempdir: Option<tempfile::TempDir>,
}

pub struct BridgeTest {
    session: Session,
    _tempdir: Option<tempfile::TempDir>,
}

impl BridgeTestBuilder {
    pub fn new() -> Self {
        // to see the logs run the tests with RUST_LOG=debug and --nocapture
        let _ = env_logger::try_init();

        log::info!("creating new bridge test");

        let mut config = BridgeConfig::default().with_memory(MemoryConfig {
            initial_pages: 17,
            maximum_pages: 16384,
        });
        config.wasi.stdio = StdioMode::Capture;

        Self {
            config,
            source: ModuleSource::Bytes(b"(module)".to_vec()),
            tempdir: None,
        }
    }

    pub fn with_module(mut self, module: impl AsRef<[u8]>) -> Self {
        log::info!("setting module [u8; {}]", module.as_ref().len());
        self.source = ModuleSource::Bytes(module.as_ref().to_vec());
        self
    }

    /// Loads the module from a file instead of from memory.
    pub fn with_module_file(mut self, module: impl AsRef<[u8]>) -> Result<Self> {
        let tempdir = tempfile::tempdir()?;
        let path = tempdir.path().join("module.wasm");
        std::fs::File::create(&path)?.write_all(module.as_ref())?;
        log::info!("setting module file {}", path.display());
        self.source = ModuleSource::Path(path);
        self.tempdir = Some(tempdir);
        Ok(self)
    }

    pub fn with_fs(mut self, json: &str) -> Result<Self> {
        self.config.wasi.fs = serde_json::from_str::<VfsSnapshot>(json)?;
        Ok(self)
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.config.async_work_pool_size = size;
        self
    }

    pub fn with_config(mut self, f: impl FnOnce(BridgeConfig) -> BridgeConfig) -> Self {
        self.config = f(self.config);
        self
    }

    pub fn build(self) -> crate::Result<BridgeTest> {
        let session = Loader::new(self.config)?.load(self.source)?;
        Ok(BridgeTest {
            session,
            _tempdir: self.tempdir,
        })
    }
}

impl Default for BridgeTestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeTest {
    pub fn builder() -> BridgeTestBuilder {
        BridgeTestBuilder::new()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Calls `Class.method` or a free function with `i32` arguments and
    /// returns its first result, `0` when it has none.
    pub fn call_i32(&self, path: &str, args: &[i32]) -> crate::Result<i32> {
        let binding = self.session.namespace().lookup(path)?;
        let args: Vec<_> = args.iter().copied().map(Val::I32).collect();
        let results = self.session.call(binding, &args)?;
        Ok(results.first().and_then(Val::i32).unwrap_or_default())
    }

    /// Copies `data` into the shared memory at `offset`.
    pub fn poke(&self, offset: usize, data: &[u8]) -> crate::Result<()> {
        match self.session.memory() {
            Some(memory) => memory.write(offset, data),
            None => Err(crate::Error::NotFound("shared memory".into())),
        }
    }

    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.session.stdout()).into_owned()
    }
}
