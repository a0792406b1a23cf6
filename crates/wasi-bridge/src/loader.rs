//! Turning module bytes into a [`Session`].

use std::sync::atomic::AtomicI32;
use std::sync::{Arc, Mutex, PoisonError};

use wasmtime::{Engine, ExternType, Instance, Linker, Module, Store, Trap};
use wasmtime_wasi::I32Exit;

use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::host::{self, HostState, ThreadSpawner};
use crate::memory::{MemoryView, SharedLinearMemory};
use crate::pool::{Dispatcher, WorkerPool};
use crate::registry::{self, HookDescriptor, Registrar, Registration};
use crate::session::{Session, SessionParts, WorkerInstance};
use crate::source::{ModuleSource, module_bytes};
use crate::stack::{STACK_POINTER, StackPointer};
use crate::trace::AbortSignal;
use crate::wasi::{self, WasiCtx};

/// What the `before_init` hook gets to see: the raw instance, before any
/// binding is callable.
pub struct InitContext<'a> {
    store: &'a mut Store<HostState>,
    instance: &'a Instance,
    registration: &'a mut Registration,
}

impl InitContext<'_> {
    pub fn instance(&self) -> &Instance {
        self.instance
    }

    pub fn store(&mut self) -> &mut Store<HostState> {
        &mut *self.store
    }

    pub fn session_id(&self) -> &str {
        self.store.data().session_id()
    }

    pub fn memory(&self) -> Option<&SharedLinearMemory> {
        self.store.data().shared_memory()
    }

    /// The registration hooks about to run, in order.
    pub fn hooks(&self) -> impl Iterator<Item = &HookDescriptor> {
        self.registration.hooks().map(|(hook, _)| hook)
    }

    /// Runs the registration hooks now instead of after the hook returns.
    /// Fails when called twice.
    pub fn register_exports(&mut self) -> Result<()> {
        self.registration.run(&mut *self.store)
    }
}

fn is_abort(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Trap>().is_some() || err.downcast_ref::<I32Exit>().is_some()
}

fn link_error(context: &str) -> impl FnOnce(anyhow::Error) -> Error + '_ {
    move |err| Error::Link(format!("{context}: {err:#}"))
}

pub struct Loader {
    config: BridgeConfig,
    engine: Engine,
}

impl Loader {
    pub fn new(config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        let mut wasm_config = wasmtime::Config::new();
        wasm_config.wasm_threads(true).wasm_backtrace(true);
        let engine = Engine::new(&wasm_config)?;
        Ok(Self { config, engine })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Allocates a memory shaped by the configuration that can be handed to
    /// [`Loader::load_with_memory`], possibly for more than one session.
    pub fn shared_memory(&self) -> Result<SharedLinearMemory> {
        SharedLinearMemory::new(&self.engine, self.config.memory)
    }

    pub fn load(&self, source: impl Into<ModuleSource>) -> Result<Session> {
        self.instantiate(source.into(), None)
    }

    /// Loads into a memory the caller already holds. Instantiating writes the
    /// module's active data segments into it, over whatever another session
    /// sharing the memory has stored there.
    pub fn load_with_memory(
        &self,
        source: impl Into<ModuleSource>,
        memory: SharedLinearMemory,
    ) -> Result<Session> {
        self.instantiate(source.into(), Some(memory))
    }

    fn instantiate(
        &self,
        source: ModuleSource,
        supplied: Option<SharedLinearMemory>,
    ) -> Result<Session> {
        let id: Arc<str> = format!("{:08x}", rand::random::<u32>()).into();
        log::info!(session = &*id; "loading {source}");

        let bytes = source.read()?;
        let bytes = module_bytes(&bytes)?;
        let module = Module::new(&self.engine, &bytes)
            .map_err(|err| Error::ModuleLoad(format!("{err:#}")))?;
        let stack = StackPointer::detect(&module, &bytes);

        let memory = self.link_memory(&module, supplied)?;
        let wasi = WasiCtx::new(&self.config.wasi)?;
        let registrar = Registrar::open();
        let host = HostState::new(
            id.clone(),
            wasi.clone(),
            memory.as_ref().map(|(_, memory)| memory.clone()),
            registrar.clone(),
        );
        let mut store = Store::new(&self.engine, host);

        let mut linker: Linker<HostState> = Linker::new(&self.engine);
        linker.allow_shadowing(true);
        wasi::add_to_linker(&mut linker).map_err(link_error("wasi"))?;
        registry::add_to_linker(&mut linker).map_err(link_error("bridge"))?;
        host::add_to_linker(&mut linker).map_err(link_error("thread-spawn"))?;
        if let Some(((module_name, name), memory)) = &memory {
            linker
                .define(&store, module_name, name, memory.as_extern())
                .map_err(link_error("memory"))?;
        }
        if let Some(overwrite) = &self.config.overwrite_imports {
            overwrite(&mut linker).map_err(link_error("overwrite_imports"))?;
        }
        let pre = linker
            .instantiate_pre(&module)
            .map_err(|err| Error::Link(format!("{err:#}")))?;

        let memory = memory.map(|(_, memory)| memory);
        let pool = match &memory {
            Some(memory) => {
                let next_tid = Arc::new(AtomicI32::new(1));
                // Instantiating applies the active data segments to the
                // shared memory, so every worker instance exists before the
                // main instance runs any code.
                let slots = (0..self.config.async_work_pool_size)
                    .map(|index| {
                        let host =
                            HostState::for_worker(id.clone(), wasi.clone(), Some(memory.clone()), index);
                        WorkerInstance::new(&pre, host).map(Some)
                    })
                    .collect::<Result<Vec<_>>>()?;
                let slots = Mutex::new(slots);
                let stack_size =
                    (stack == StackPointer::Exported).then_some(self.config.worker_stack_size);
                let init = {
                    let id = id.clone();
                    let next_tid = next_tid.clone();
                    move |index: usize, dispatcher: &Dispatcher<WorkerInstance>| {
                        let mut worker = slots
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .get_mut(index)
                            .and_then(Option::take)
                            .ok_or_else(|| {
                                Error::WorkerDispatch(format!("no instance left for worker {index}"))
                            })?;
                        let threads = ThreadSpawner::new(dispatcher.clone(), next_tid.clone());
                        worker.start(threads, stack_size)?;
                        crate::worker_log!(debug, &*id, index, "worker instance ready");
                        Ok(worker)
                    }
                };
                let pool = WorkerPool::new(
                    self.config.async_work_pool_size,
                    self.config.queue_capacity,
                    self.config.worker_factory.clone(),
                    init,
                )?;
                let spawner = ThreadSpawner::new(pool.dispatcher(), next_tid);
                store.data_mut().set_threads(spawner);
                Some(pool)
            }
            None => None,
        };

        let instance = pre.instantiate(&mut store).map_err(|err| {
            if is_abort(&err) {
                AbortSignal::from_error(&err).into()
            } else {
                Error::Link(format!("{err:#}"))
            }
        })?;

        if let Ok(initialize) = instance.get_typed_func::<(), ()>(&mut store, "_initialize") {
            initialize
                .call(&mut store, ())
                .map_err(|err| Error::from(AbortSignal::from_error(&err)))?;
        }

        let hooks = registry::discover(&module, self.config.registration_hooks.as_deref());
        let resolved = registry::resolve(&mut store, &instance, &hooks)?;
        let mut registration = Registration::new(hooks, resolved);

        if let Some(before_init) = &self.config.before_init {
            let mut ctx = InitContext {
                store: &mut store,
                instance: &instance,
                registration: &mut registration,
            };
            before_init(&mut ctx).map_err(|err| match err.downcast::<Error>() {
                Ok(err @ Error::Registration { .. }) => err,
                Ok(err) => Error::Registration {
                    hook: "beforeInit".into(),
                    reason: err.to_string(),
                },
                Err(err) => Error::Registration {
                    hook: "beforeInit".into(),
                    reason: format!("{err:#}"),
                },
            })?;
        }
        if !registration.has_run() {
            registration.run(&mut store)?;
        }
        let namespace = registrar.close();
        if stack == StackPointer::Internal && pool.is_some() && namespace.has_async() {
            return Err(Error::Link(format!(
                "the module keeps {STACK_POINTER} unexported, so async bindings would share \
                 the main stack; export it (e.g. -Wl,--export={STACK_POINTER})"
            )));
        }
        log::info!(
            session = &*id;
            "loaded {source}: {} classes, {} functions",
            namespace.classes().count(),
            namespace.functions().count()
        );

        Ok(Session::new(SessionParts {
            id,
            module,
            store,
            instance,
            namespace,
            pool,
            wasi,
            memory,
            registered: registration.invoked().to_vec(),
        }))
    }

    /// Finds the module's memory import and the shared memory to satisfy it.
    #[allow(clippy::type_complexity)]
    fn link_memory(
        &self,
        module: &Module,
        supplied: Option<SharedLinearMemory>,
    ) -> Result<Option<((String, String), SharedLinearMemory)>> {
        let import = module.imports().find_map(|import| match import.ty() {
            ExternType::Memory(ty) => Some((import.module().to_string(), import.name().to_string(), ty)),
            _ => None,
        });
        let Some((module_name, name, ty)) = import else {
            return Ok(None);
        };
        if !ty.is_shared() {
            return Err(Error::Link(format!(
                "memory import {module_name}.{name} is not shared"
            )));
        }
        let memory = match supplied {
            Some(memory) => memory,
            None => SharedLinearMemory::new(&self.engine, self.config.memory)?,
        };
        memory.check_import(&ty)?;
        Ok(Some(((module_name, name), memory)))
    }
}
