//! Load WASI preview1 modules that expect a JavaScript-style host: a shared
//! linear memory, worker threads for blocking work and an in-memory
//! filesystem, and expose their registered classes to Rust callers.
//!
//! ```ignore
//! let loader = Loader::new(BridgeConfig::default())?;
//! let session = loader.load(ModuleSource::Path("addon.wasm".into()))?;
//! session.construct("Counter", &[Val::I32(1)])?;
//! let value = session.call_method("Counter", "increment", &[])?;
//! ```

pub mod bindings;
pub mod config;
pub mod error;
pub mod host;
pub mod loader;
mod logging;
pub mod memory;
pub mod pool;
pub mod registry;
pub mod session;
pub mod source;
pub mod stack;
pub mod sync;
pub mod trace;
pub mod vfs;
pub mod wasi;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(test)]
mod tests;

pub use bindings::{BindingKind, CallMode, ClassBinding, ExportBinding, Namespace};
pub use config::{BridgeConfig, WasiConfig};
pub use error::{Error, Result};
pub use loader::{InitContext, Loader};
pub use memory::{MemoryConfig, SharedLinearMemory};
pub use session::Session;
pub use source::ModuleSource;
pub use sync::CallHandle;
pub use trace::AbortSignal;
pub use vfs::{FileContent, Vfs, VfsSnapshot};
