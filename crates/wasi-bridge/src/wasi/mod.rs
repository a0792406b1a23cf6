//! WASI preview1 over the in-memory filesystem.
//!
//! The context is shared by the calling thread and every worker of a session:
//! the descriptor table, the filesystem and the stdio buffers live behind one
//! lock, so a file opened on one thread can be read on another.

pub mod clock;
mod errno;
pub mod fd;
mod linker;
mod preview1;

use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

pub use errno::Errno;
pub use linker::add_to_linker;

use self::clock::{Clock, Random};
use self::fd::FdTable;
use crate::config::WasiConfig;
use crate::error::Result;
use crate::vfs::Vfs;

pub const WASI_MODULE: &str = "wasi_snapshot_preview1";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StdioMode {
    /// Forward to the host process' stdout/stderr.
    #[default]
    Inherit,
    /// Buffer the output so it can be read back from the session.
    Capture,
}

#[derive(Debug)]
struct Output {
    mode: StdioMode,
    target: Target,
    captured: Vec<u8>,
}

#[derive(Clone, Copy, Debug)]
enum Target {
    Stdout,
    Stderr,
}

impl Output {
    fn new(mode: StdioMode, target: Target) -> Self {
        Self {
            mode,
            target,
            captured: Vec::new(),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), Errno> {
        match (self.mode, self.target) {
            (StdioMode::Capture, _) => self.captured.extend_from_slice(data),
            (StdioMode::Inherit, Target::Stdout) => {
                let mut out = std::io::stdout().lock();
                out.write_all(data).and_then(|_| out.flush()).map_err(|_| Errno::Io)?
            }
            (StdioMode::Inherit, Target::Stderr) => {
                std::io::stderr().write_all(data).map_err(|_| Errno::Io)?
            }
        }
        Ok(())
    }
}

struct WasiState {
    vfs: Vfs,
    fds: FdTable,
    stdin: Vec<u8>,
    stdin_pos: usize,
    stdout: Output,
    stderr: Output,
}

/// Per-session WASI state. Cloning shares it.
#[derive(Clone)]
pub struct WasiCtx {
    state: Arc<Mutex<WasiState>>,
    args: Arc<[String]>,
    env: Arc<[String]>,
    clock: Arc<dyn Clock>,
    random: Random,
}

impl WasiCtx {
    pub fn new(config: &WasiConfig) -> Result<Self> {
        let clock = config.clock.build();
        let vfs = Vfs::from_snapshot(&config.fs, clock.clone())?
            .with_max_file_size(config.max_file_size);
        let stdin = config
            .stdin
            .as_ref()
            .map(|content| content.as_bytes().to_vec())
            .unwrap_or_default();
        let state = WasiState {
            vfs,
            fds: FdTable::default(),
            stdin,
            stdin_pos: 0,
            stdout: Output::new(config.stdio, Target::Stdout),
            stderr: Output::new(config.stdio, Target::Stderr),
        };
        let env = config
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            args: config.args.clone().into(),
            env,
            clock,
            random: Random::new(config.random),
        })
    }

    fn lock(&self) -> MutexGuard<'_, WasiState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` with exclusive access to the filesystem.
    pub fn with_vfs<R>(&self, f: impl FnOnce(&mut Vfs) -> R) -> R {
        f(&mut self.lock().vfs)
    }

    /// Everything written to stdout so far when stdio is captured.
    pub fn stdout(&self) -> Vec<u8> {
        self.lock().stdout.captured.clone()
    }

    pub fn stderr(&self) -> Vec<u8> {
        self.lock().stderr.captured.clone()
    }

    pub fn open_fds(&self) -> usize {
        self.lock().fds.len()
    }
}

/// Implemented by store data that carries a [`WasiCtx`].
pub trait WasiView {
    fn ctx(&self) -> &WasiCtx;
}

impl WasiView for WasiCtx {
    fn ctx(&self) -> &WasiCtx {
        self
    }
}
