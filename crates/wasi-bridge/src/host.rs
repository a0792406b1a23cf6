//! Store data shared by the main instance and every worker instance.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use wasmtime::{Caller, Linker};

use crate::error::{Error, Result};
use crate::memory::{MemoryView, SharedLinearMemory};
use crate::pool::Dispatcher;
use crate::registry::Registrar;
use crate::session::WorkerInstance;
use crate::wasi::{Errno, WasiCtx, WasiView};

pub const THREAD_SPAWN_MODULE: &str = "wasi";
pub const THREAD_SPAWN: &str = "thread-spawn";
pub const THREAD_START: &str = "wasi_thread_start";

pub struct HostState {
    wasi: WasiCtx,
    memory: Option<SharedLinearMemory>,
    registrar: Registrar,
    threads: Option<ThreadSpawner>,
    session_id: Arc<str>,
    worker: Option<usize>,
}

impl HostState {
    pub(crate) fn new(
        session_id: Arc<str>,
        wasi: WasiCtx,
        memory: Option<SharedLinearMemory>,
        registrar: Registrar,
    ) -> Self {
        Self {
            wasi,
            memory,
            registrar,
            threads: None,
            session_id,
            worker: None,
        }
    }

    /// State for pool worker `index`. Workers never register exports and
    /// get their spawner once their thread starts.
    pub(crate) fn for_worker(
        session_id: Arc<str>,
        wasi: WasiCtx,
        memory: Option<SharedLinearMemory>,
        index: usize,
    ) -> Self {
        Self {
            wasi,
            memory,
            registrar: Registrar::default(),
            threads: None,
            session_id,
            worker: Some(index),
        }
    }

    pub(crate) fn set_threads(&mut self, threads: ThreadSpawner) {
        self.threads = Some(threads);
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The pool index when this state belongs to a worker instance.
    pub fn worker(&self) -> Option<usize> {
        self.worker
    }

    pub fn wasi(&self) -> &WasiCtx {
        &self.wasi
    }

    pub(crate) fn registrar(&self) -> &Registrar {
        &self.registrar
    }

    pub fn threads(&self) -> Option<&ThreadSpawner> {
        self.threads.as_ref()
    }
}

impl WasiView for HostState {
    fn ctx(&self) -> &WasiCtx {
        &self.wasi
    }
}

impl MemoryView for HostState {
    fn shared_memory(&self) -> Option<&SharedLinearMemory> {
        self.memory.as_ref()
    }
}

/// Hands `wasi_thread_start` calls to the pool. Every instance of a session
/// shares one thread id counter, starting at 1.
#[derive(Clone)]
pub struct ThreadSpawner {
    dispatcher: Dispatcher<WorkerInstance>,
    next_tid: Arc<AtomicI32>,
}

impl ThreadSpawner {
    pub(crate) fn new(dispatcher: Dispatcher<WorkerInstance>, next_tid: Arc<AtomicI32>) -> Self {
        Self {
            dispatcher,
            next_tid,
        }
    }

    /// Queues `wasi_thread_start(tid, start_arg)` and returns the new thread id.
    pub fn spawn(&self, start_arg: i32) -> Result<i32> {
        let tid = self.next_tid.fetch_add(1, Ordering::SeqCst);
        if tid <= 0 {
            return Err(Error::WorkerDispatch("thread ids exhausted".into()));
        }
        // nobody waits for a spawned thread, its handle is dropped
        self.dispatcher
            .submit(move |worker: &mut WorkerInstance| worker.thread_start(tid, start_arg))?;
        Ok(tid)
    }
}

/// Defines `wasi.thread-spawn`. Without a pool the import still links and
/// every spawn fails.
pub(crate) fn add_to_linker(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    linker.func_wrap(
        THREAD_SPAWN_MODULE,
        THREAD_SPAWN,
        |caller: Caller<'_, HostState>, start_arg: i32| -> i32 {
            let host = caller.data();
            let Some(threads) = host.threads() else {
                crate::session_log!(warn, host, "thread-spawn without a worker pool");
                return -Errno::Nosys.raw();
            };
            match threads.spawn(start_arg) {
                Ok(tid) => {
                    crate::session_log!(debug, host, "spawned thread {tid}");
                    tid
                }
                Err(err) => {
                    crate::session_log!(warn, host, "thread-spawn failed: {err}");
                    -Errno::Again.raw()
                }
            }
        },
    )?;
    Ok(())
}
