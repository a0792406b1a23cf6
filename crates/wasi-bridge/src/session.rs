use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use wasmtime::{Instance, InstancePre, Module, Store, Val, ValType};

use crate::bindings::{CallMode, ClassBinding, ExportBinding, Namespace};
use crate::error::{Error, Result};
use crate::host::{HostState, THREAD_START, ThreadSpawner};
use crate::memory::{MemoryView, SharedLinearMemory};
use crate::pool::{WorkerHandle, WorkerPool};
use crate::stack::WorkerStack;
use crate::sync::CallHandle;
use crate::trace::AbortSignal;
use crate::vfs::Vfs;
use crate::wasi::WasiCtx;

fn abort(err: anyhow::Error) -> Error {
    AbortSignal::from_error(&err).into()
}

fn check_args(args: &[Val]) -> Result<()> {
    match args
        .iter()
        .find(|arg| !matches!(arg, Val::I32(_) | Val::I64(_) | Val::F32(_) | Val::F64(_)))
    {
        Some(arg) => Err(Error::InvalidArgument(format!(
            "only numeric arguments can be passed, got {arg:?}"
        ))),
        None => Ok(()),
    }
}

fn arg_matches(arg: &Val, ty: &ValType) -> bool {
    matches!(
        (arg, ty),
        (Val::I32(_), ValType::I32)
            | (Val::I64(_), ValType::I64)
            | (Val::F32(_), ValType::F32)
            | (Val::F64(_), ValType::F64)
    )
}

/// Calls `export` on `instance` with numeric arguments.
pub(crate) fn call_export(
    store: &mut Store<HostState>,
    instance: &Instance,
    export: &str,
    args: &[Val],
) -> Result<Vec<Val>> {
    check_args(args)?;
    let func = instance
        .get_func(&mut *store, export)
        .ok_or_else(|| Error::NotFound(format!("export {export}")))?;
    let ty = func.ty(&*store);
    if ty.params().len() != args.len() {
        return Err(Error::InvalidArgument(format!(
            "{export} takes {} arguments, {} given",
            ty.params().len(),
            args.len()
        )));
    }
    if let Some((index, _)) = args
        .iter()
        .zip(ty.params())
        .enumerate()
        .find(|(_, (arg, param))| !arg_matches(arg, param))
    {
        return Err(Error::InvalidArgument(format!(
            "argument {index} of {export} has the wrong type"
        )));
    }
    let mut results = vec![Val::I32(0); ty.results().len()];
    func.call(&mut *store, args, &mut results).map_err(abort)?;
    Ok(results)
}

/// The module instance a pool worker owns, over the session's shared memory.
pub struct WorkerInstance {
    store: Store<HostState>,
    instance: Instance,
    stack: Option<WorkerStack>,
}

impl WorkerInstance {
    pub(crate) fn new(pre: &InstancePre<HostState>, host: HostState) -> Result<Self> {
        let mut store = Store::new(pre.module().engine(), host);
        let instance = pre.instantiate(&mut store).map_err(|err| {
            Error::Link(format!("failed to instantiate worker: {err:#}"))
        })?;
        Ok(Self {
            store,
            instance,
            stack: None,
        })
    }

    /// Readies the instance on its worker thread: hands it the spawner and,
    /// with `stack_size`, a shadow stack of its own.
    pub(crate) fn start(&mut self, threads: ThreadSpawner, stack_size: Option<u64>) -> Result<()> {
        self.store.data_mut().set_threads(threads);
        let memory = self.store.data().shared_memory().cloned();
        if let (Some(size), Some(memory)) = (stack_size, memory) {
            let stack = WorkerStack::install(&mut self.store, &self.instance, &memory, size)?;
            let host = self.store.data();
            crate::worker_log!(
                debug,
                host.session_id(),
                host.worker().unwrap_or_default(),
                "stack top at {:#x}",
                stack.stack_pointer()
            );
            self.stack = Some(stack);
        }
        Ok(())
    }

    pub fn index(&self) -> Option<usize> {
        self.store.data().worker()
    }

    pub fn stack(&self) -> Option<&WorkerStack> {
        self.stack.as_ref()
    }

    pub fn call(&mut self, export: &str, args: &[Val]) -> Result<Vec<Val>> {
        if let Some(stack) = &self.stack {
            stack.enter(&mut self.store, &self.instance)?;
        }
        call_export(&mut self.store, &self.instance, export, args)
    }

    pub(crate) fn thread_start(&mut self, tid: i32, start_arg: i32) -> Result<()> {
        let start = self
            .instance
            .get_typed_func::<(i32, i32), ()>(&mut self.store, THREAD_START)
            .map_err(|err| Error::NotFound(format!("{THREAD_START}: {err}")))?;
        let result = start.call(&mut self.store, (tid, start_arg)).map_err(abort);
        if let Err(err) = &result {
            let host = self.store.data();
            let worker = host.worker().unwrap_or_default();
            crate::worker_log!(warn, host.session_id(), worker, "thread {tid} aborted: {err}");
        }
        result
    }
}

/// A loaded module with its bindings, worker pool and WASI state.
///
/// Sync bindings run on the calling thread against the session's own
/// instance, one call at a time. Async bindings run on the worker pool.
pub struct Session {
    id: Arc<str>,
    module: Module,
    store: Mutex<Store<HostState>>,
    instance: Instance,
    namespace: Namespace,
    pool: Option<WorkerPool<WorkerInstance>>,
    wasi: WasiCtx,
    memory: Option<SharedLinearMemory>,
    registered: Vec<String>,
}

pub(crate) struct SessionParts {
    pub id: Arc<str>,
    pub module: Module,
    pub store: Store<HostState>,
    pub instance: Instance,
    pub namespace: Namespace,
    pub pool: Option<WorkerPool<WorkerInstance>>,
    pub wasi: WasiCtx,
    pub memory: Option<SharedLinearMemory>,
    pub registered: Vec<String>,
}

impl Session {
    pub(crate) fn new(parts: SessionParts) -> Self {
        Self {
            id: parts.id,
            module: parts.module,
            store: Mutex::new(parts.store),
            instance: parts.instance,
            namespace: parts.namespace,
            pool: parts.pool,
            wasi: parts.wasi,
            memory: parts.memory,
            registered: parts.registered,
        }
    }

    fn lock_store(&self) -> MutexGuard<'_, Store<HostState>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session_id(&self) -> &str {
        &self.id
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn class(&self, name: &str) -> Result<&ClassBinding> {
        self.namespace.class(name)
    }

    /// Registration hooks that ran, in order.
    pub fn registered_hooks(&self) -> &[String] {
        &self.registered
    }

    /// Invokes `binding` and waits for its results.
    pub fn call(&self, binding: &ExportBinding, args: &[Val]) -> Result<Vec<Val>> {
        match binding.mode() {
            CallMode::Sync => self.call_sync(binding, args),
            CallMode::Async => self.call_async(binding, args)?.wait(),
        }
    }

    /// Invokes `binding` without waiting. Sync bindings have already run when
    /// the handle is returned.
    pub fn call_async(&self, binding: &ExportBinding, args: &[Val]) -> Result<CallHandle<Vec<Val>>> {
        let Some(pool) = self.pool.as_ref().filter(|_| binding.mode() == CallMode::Async) else {
            return Ok(CallHandle::ready(self.call_sync(binding, args)));
        };
        check_args(args)?;
        crate::session_log!(debug, self, "dispatching {} to the pool", binding.name());
        let export = binding.export().to_string();
        let args = args.to_vec();
        pool.submit(move |worker: &mut WorkerInstance| worker.call(&export, &args))
    }

    fn call_sync(&self, binding: &ExportBinding, args: &[Val]) -> Result<Vec<Val>> {
        crate::session_log!(debug, self, "calling {}", binding.name());
        let mut store = self.lock_store();
        call_export(&mut store, &self.instance, binding.export(), args)
    }

    pub fn construct(&self, class: &str, args: &[Val]) -> Result<Vec<Val>> {
        let constructor = self
            .class(class)?
            .constructor()
            .ok_or_else(|| Error::NotFound(format!("constructor of {class}")))?;
        self.call(constructor, args)
    }

    pub fn call_method(&self, class: &str, method: &str, args: &[Val]) -> Result<Vec<Val>> {
        self.call(self.class(class)?.method(method)?, args)
    }

    pub fn call_function(&self, name: &str, args: &[Val]) -> Result<Vec<Val>> {
        self.call(self.namespace.function(name)?, args)
    }

    /// Calls a raw export on the session's instance, registered or not.
    pub fn call_export(&self, export: &str, args: &[Val]) -> Result<Vec<Val>> {
        let mut store = self.lock_store();
        call_export(&mut store, &self.instance, export, args)
    }

    /// Runs `_start` and returns the exit code.
    pub fn run_start(&self) -> Result<i32> {
        match self.call_export("_start", &[]) {
            Ok(_) => Ok(0),
            Err(Error::Abort(signal)) => match signal.exit_code() {
                Some(code) => Ok(code),
                None => Err(Error::Abort(signal)),
            },
            Err(err) => Err(err),
        }
    }

    pub fn memory(&self) -> Option<&SharedLinearMemory> {
        self.memory.as_ref()
    }

    pub fn wasi(&self) -> &WasiCtx {
        &self.wasi
    }

    pub fn with_vfs<R>(&self, f: impl FnOnce(&mut Vfs) -> R) -> R {
        self.wasi.with_vfs(f)
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        Ok(self.with_vfs(|vfs| vfs.read_file(path))?)
    }

    pub fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        Ok(self.with_vfs(|vfs| vfs.write_file(path, data))?)
    }

    pub fn stdout(&self) -> Vec<u8> {
        self.wasi.stdout()
    }

    pub fn stderr(&self) -> Vec<u8> {
        self.wasi.stderr()
    }

    /// The pool workers started so far. Empty when the module has no shared
    /// memory and therefore no pool.
    pub fn workers(&self) -> Vec<WorkerHandle> {
        self.pool.as_ref().map(WorkerPool::workers).unwrap_or_default()
    }

    pub fn has_pool(&self) -> bool {
        self.pool.is_some()
    }

    /// Drops the session after every worker thread exited.
    pub fn shutdown(mut self) {
        if let Some(pool) = self.pool.take() {
            pool.shutdown();
        }
    }
}
