//! A fixed-size pool of lazily started worker threads.
//!
//! Every worker owns a context `C` built on its own thread by the pool's init
//! function (for a session, an instance of the module over the shared memory).
//! Work is taken from a single FIFO queue by whichever worker is idle first.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};

use crate::error::{Error, Result};
use crate::sync::{CallHandle, CompletionGuard, completion};

mod worker;

pub use worker::{WorkerHandle, WorkerState};

/// Starts the thread behind a worker.
pub trait WorkerFactory: Send + Sync {
    fn spawn(&self, name: &str, body: Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>>;
}

impl<F> WorkerFactory for F
where
    F: Fn(&str, Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>> + Send + Sync,
{
    fn spawn(&self, name: &str, body: Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>> {
        self(name, body)
    }
}

/// Plain named OS threads.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadFactory {
    pub stack_size: Option<usize>,
}

impl WorkerFactory for ThreadFactory {
    fn spawn(&self, name: &str, body: Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>> {
        let mut builder = thread::Builder::new().name(name.to_string());
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }
        builder.spawn(body)
    }
}

type InitFn<C> = dyn Fn(usize, &Dispatcher<C>) -> Result<C> + Send + Sync;

trait Fail: Send {
    fn fail(&self, err: Error) -> bool;
}

impl<T: Send> Fail for CompletionGuard<T> {
    fn fail(&self, err: Error) -> bool {
        CompletionGuard::fail(self, err)
    }
}

struct Job<C> {
    task: Box<dyn FnOnce(&mut C) + Send>,
    // resolves the handle if the job is dropped without running
    guard: Box<dyn Fail>,
}

struct Worker {
    handle: WorkerHandle,
    thread: Option<JoinHandle<()>>,
}

struct Shared<C> {
    jobs_tx: Sender<Job<C>>,
    jobs_rx: Receiver<Job<C>>,
    shutdown_rx: Receiver<()>,
    workers: Mutex<Vec<Worker>>,
    // idle or still starting
    idle: AtomicUsize,
    closed: AtomicBool,
    size: usize,
    capacity: Option<usize>,
    init: Box<InitFn<C>>,
    factory: Arc<dyn WorkerFactory>,
}

impl<C: 'static> Shared<C> {
    fn lock_workers(&self) -> MutexGuard<'_, Vec<Worker>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire_idle(&self) {
        self.idle.fetch_add(1, Ordering::SeqCst);
    }

    fn release_idle(&self) {
        self.idle.fetch_sub(1, Ordering::SeqCst);
    }

    fn exhausted(workers: &[Worker], size: usize) -> bool {
        workers.len() >= size
            && workers
                .iter()
                .all(|w| w.handle.state() == WorkerState::Terminated)
    }

    /// Queues `job`. Runs under the workers lock so that it cannot interleave
    /// with the drain in [`WorkerPool::close`].
    fn dispatch(self: &Arc<Self>, job: Job<C>) -> Result<()> {
        let mut workers = self.lock_workers();
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::WorkerDispatch("pool is shut down".into()));
        }
        if Self::exhausted(&workers, self.size) {
            return Err(Error::WorkerDispatch("all workers have terminated".into()));
        }
        match self.jobs_tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                return Err(Error::WorkerDispatch(format!(
                    "queue is full ({} pending)",
                    self.capacity.unwrap_or_default()
                )));
            }
            Err(TrySendError::Disconnected(_)) => {
                return Err(Error::WorkerDispatch("pool is shut down".into()));
            }
        }
        self.maybe_spawn(&mut workers);
        Ok(())
    }

    /// Starts one more worker while queued work outnumbers idle workers and a
    /// slot is left.
    fn maybe_spawn(self: &Arc<Self>, workers: &mut Vec<Worker>) {
        if workers.len() >= self.size || self.jobs_rx.len() <= self.idle.load(Ordering::SeqCst) {
            return;
        }
        let handle = WorkerHandle::new(workers.len());
        self.acquire_idle();
        let body = {
            let shared = self.clone();
            let handle = handle.clone();
            Box::new(move || worker::run(shared, handle))
        };
        match self.factory.spawn(handle.name(), body) {
            Ok(thread) => {
                log::debug!("spawned {}", handle.name());
                workers.push(Worker {
                    handle,
                    thread: Some(thread),
                });
            }
            Err(err) => {
                log::error!("failed to spawn {}: {err}", handle.name());
                self.release_idle();
                handle.set_state(WorkerState::Terminated);
                workers.push(Worker {
                    handle,
                    thread: None,
                });
            }
        }
    }

    /// Marks a worker dead. When no slot can ever run the queue again, the
    /// queued jobs fail.
    fn retire(self: &Arc<Self>, handle: &WorkerHandle) {
        let mut workers = self.lock_workers();
        handle.set_state(WorkerState::Terminated);
        if self.jobs_rx.is_empty() {
            return;
        }
        self.maybe_spawn(&mut workers);
        if Self::exhausted(&workers, self.size) {
            while let Ok(job) = self.jobs_rx.try_recv() {
                job.guard
                    .fail(Error::WorkerDispatch("all workers have terminated".into()));
            }
        }
    }
}

/// Submits work to a pool without owning it.
///
/// Held by the host state of every instance so that `thread-spawn` can
/// reach the pool. Once the pool is dropped submissions fail.
pub struct Dispatcher<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for Dispatcher<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C: 'static> Dispatcher<C> {
    /// Queues `f` to run on a worker with that worker's context.
    pub fn submit<T, F>(&self, f: F) -> Result<CallHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut C) -> Result<T> + Send + 'static,
    {
        let (completion, handle) = completion();
        let guard = completion.set_guard("pool shut down");
        let job = Job {
            task: Box::new(move |ctx: &mut C| {
                completion.set(f(ctx));
            }),
            guard: Box::new(guard),
        };
        self.shared.dispatch(job)?;
        Ok(handle)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

pub struct WorkerPool<C: 'static> {
    dispatcher: Dispatcher<C>,
    // dropping the sender wakes every idle worker
    shutdown_tx: Option<Sender<()>>,
}

impl<C: 'static> WorkerPool<C> {
    pub fn new(
        size: usize,
        capacity: Option<usize>,
        factory: Arc<dyn WorkerFactory>,
        init: impl Fn(usize, &Dispatcher<C>) -> Result<C> + Send + Sync + 'static,
    ) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgument("pool size must be at least 1".into()));
        }
        let (jobs_tx, jobs_rx) = match capacity {
            Some(0) => {
                return Err(Error::InvalidArgument(
                    "queue capacity must be at least 1".into(),
                ));
            }
            Some(cap) => channel::bounded(cap),
            None => channel::unbounded(),
        };
        let (shutdown_tx, shutdown_rx) = channel::bounded(0);
        let shared = Arc::new(Shared {
            jobs_tx,
            jobs_rx,
            shutdown_rx,
            workers: Mutex::new(Vec::with_capacity(size)),
            idle: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            size,
            capacity,
            init: Box::new(init),
            factory,
        });
        Ok(Self {
            dispatcher: Dispatcher { shared },
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn dispatcher(&self) -> Dispatcher<C> {
        self.dispatcher.clone()
    }

    pub fn submit<T, F>(&self, f: F) -> Result<CallHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut C) -> Result<T> + Send + 'static,
    {
        self.dispatcher.submit(f)
    }

    pub fn size(&self) -> usize {
        self.dispatcher.shared.size
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.dispatcher.shared.jobs_rx.len()
    }

    /// The workers started so far, in spawn order.
    pub fn workers(&self) -> Vec<WorkerHandle> {
        self.dispatcher
            .shared
            .lock_workers()
            .iter()
            .map(|w| w.handle.clone())
            .collect()
    }

    fn close(&mut self) {
        let shared = &self.dispatcher.shared;
        let dropped: Vec<_> = {
            let _workers = shared.lock_workers();
            if shared.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            drop(self.shutdown_tx.take());
            shared.jobs_rx.try_iter().collect()
        };
        // failing the handles happens outside the lock
        if !dropped.is_empty() {
            log::debug!("dropped {} queued jobs on shutdown", dropped.len());
        }
    }

    /// Stops the pool and waits for every worker thread to exit, including
    /// the ones still running a job.
    pub fn shutdown(mut self) {
        self.close();
        let threads: Vec<_> = self
            .dispatcher
            .shared
            .lock_workers()
            .iter_mut()
            .filter_map(|w| w.thread.take())
            .collect();
        let current = thread::current().id();
        for thread in threads {
            if thread.thread().id() == current {
                continue;
            }
            if thread.join().is_err() {
                log::warn!("worker thread panicked outside of a job");
            }
        }
    }
}

impl<C: 'static> Drop for WorkerPool<C> {
    fn drop(&mut self) {
        self.close();
    }
}
