use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crossbeam::channel::select;

use super::{Dispatcher, Job, Shared};
use crate::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Spawning = 0,
    Ready = 1,
    Busy = 2,
    Terminated = 3,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Spawning,
            1 => WorkerState::Ready,
            2 => WorkerState::Busy,
            _ => WorkerState::Terminated,
        }
    }
}

/// One pool slot. Clones observe the same state.
#[derive(Clone, Debug)]
pub struct WorkerHandle {
    index: usize,
    name: Arc<str>,
    state: Arc<AtomicU8>,
}

impl WorkerHandle {
    pub(super) fn new(index: usize) -> Self {
        Self {
            index,
            name: format!("wasi-bridge-worker-{index}").into(),
            state: Arc::new(AtomicU8::new(WorkerState::Spawning as u8)),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(super) fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}

/// Body of a worker thread: build the context, then take jobs until the pool
/// shuts down or a job panics.
pub(super) fn run<C: 'static>(shared: Arc<Shared<C>>, handle: WorkerHandle) {
    let dispatcher = Dispatcher {
        shared: shared.clone(),
    };
    let mut ctx = match (shared.init)(handle.index(), &dispatcher) {
        Ok(ctx) => ctx,
        Err(err) => {
            log::error!("{} failed to start: {err}", handle.name());
            shared.release_idle();
            shared.retire(&handle);
            return;
        }
    };
    drop(dispatcher);

    handle.set_state(WorkerState::Ready);
    log::debug!("{} ready", handle.name());

    loop {
        let job: Option<Job<C>> = select! {
            recv(shared.jobs_rx) -> job => job.ok(),
            recv(shared.shutdown_rx) -> _ => None,
        };
        let Some(Job { task, guard }) = job else {
            break;
        };

        shared.release_idle();
        handle.set_state(WorkerState::Busy);

        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| task(&mut ctx))) {
            let msg = panic_message(payload.as_ref());
            log::error!("{} panicked: {msg}", handle.name());
            guard.fail(Error::WorkerDispatch(format!("worker panicked: {msg}")));
            shared.retire(&handle);
            return;
        }
        drop(guard);

        handle.set_state(WorkerState::Ready);
        shared.acquire_idle();
    }

    shared.release_idle();
    handle.set_state(WorkerState::Terminated);
    log::debug!("{} stopped", handle.name());
}
