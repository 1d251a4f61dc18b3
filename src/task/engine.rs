use super::Task;
use crate::error::{DumpError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Handle for submitting tasks. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    /// Signalled when a task is queued or the engine stops
    work_ready: Condvar,
    /// Signalled when the engine stops
    stopped: Condvar,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Box<dyn Task>>,
    waiting: usize,
    running: usize,
    completed: u64,
    /// Set by `await_all` once top-level submission is over. Until then the
    /// counters may read zero between two submissions without meaning done.
    sealed: bool,
    stopped: bool,
    failure: Option<DumpError>,
}

impl Scheduler {
    fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                work_ready: Condvar::new(),
                stopped: Condvar::new(),
            }),
        }
    }

    /// Queue a task and wake one idle worker.
    ///
    /// Tasks submitted after the engine stopped are dropped.
    pub fn submit(&self, task: Box<dyn Task>) {
        let mut state = self.shared.state.lock();
        if state.stopped {
            tracing::debug!(task = %task.name(), "engine stopped, task dropped");
            return;
        }
        state.waiting += 1;
        state.queue.push_back(task);
        drop(state);
        self.shared.work_ready.notify_one();
    }

    /// Block until a task is available. Returns `None` once the engine has
    /// stopped.
    fn wait_for_next(&self) -> Option<Box<dyn Task>> {
        let mut state = self.shared.state.lock();
        loop {
            if state.stopped {
                return None;
            }
            if let Some(task) = state.queue.pop_front() {
                state.waiting -= 1;
                state.running += 1;
                return Some(task);
            }
            self.shared.work_ready.wait(&mut state);
        }
    }

    /// Record the end of a task. Stops the engine once no work remains, or
    /// on the first failure.
    fn mark_complete(&self, result: Result<()>) {
        let mut state = self.shared.state.lock();
        state.running -= 1;
        state.completed += 1;

        if let Err(e) = result {
            if state.failure.is_none() {
                state.failure = Some(e);
            }
            state.stopped = true;
            state.waiting = 0;
            state.queue.clear();
        }

        if state.sealed && state.running == 0 && state.waiting == 0 {
            state.stopped = true;
        }

        if state.stopped {
            drop(state);
            self.shared.work_ready.notify_all();
            self.shared.stopped.notify_all();
        }
    }

    /// Number of tasks that have finished, successfully or not.
    pub fn completed(&self) -> u64 {
        self.shared.state.lock().completed
    }
}

/// The context a task executes in.
pub struct Worker {
    id: usize,
    name: String,
    scheduler: Scheduler,
}

impl Worker {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Thread name, unique within the engine.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn submit(&self, task: Box<dyn Task>) {
        self.scheduler.submit(task);
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}

/// A running pool of worker threads.
pub struct TaskEngine {
    scheduler: Scheduler,
    handles: Vec<JoinHandle<()>>,
}

impl TaskEngine {
    /// Spawn `threads` workers named `<name_prefix>-<id>`.
    pub fn start(threads: usize, name_prefix: &str) -> Result<Self> {
        let scheduler = Scheduler::new();
        let mut handles = Vec::with_capacity(threads);

        for id in 0..threads {
            let name = format!("{}-{}", name_prefix, id);
            let worker = Worker {
                id,
                name: name.clone(),
                scheduler: scheduler.clone(),
            };
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || run_worker(worker))?;
            handles.push(handle);
        }

        Ok(Self { scheduler, handles })
    }

    pub fn scheduler(&self) -> Scheduler {
        self.scheduler.clone()
    }

    pub fn submit(&self, task: Box<dyn Task>) {
        self.scheduler.submit(task);
    }

    /// Block until every submitted task (and everything they submitted) has
    /// finished, then join the workers.
    ///
    /// Every top-level task must be submitted before calling this. Returns
    /// immediately if no work is outstanding, and returns the first task
    /// failure, if any.
    pub fn await_all(self) -> Result<()> {
        let shared = &self.scheduler.shared;
        {
            let mut state = shared.state.lock();
            state.sealed = true;
            if state.running == 0 && state.waiting == 0 {
                state.stopped = true;
                shared.work_ready.notify_all();
            }
            while !state.stopped {
                shared.stopped.wait(&mut state);
            }
        }

        for handle in self.handles {
            if handle.join().is_err() {
                return Err(DumpError::TaskPanicked("worker thread".to_string()));
            }
        }

        match shared.state.lock().failure.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn run_worker(worker: Worker) {
    while let Some(task) = worker.scheduler.wait_for_next() {
        let name = task.name();
        tracing::debug!(task = %name, "task started");

        let result = panic::catch_unwind(AssertUnwindSafe(|| task.execute(&worker)))
            .unwrap_or_else(|payload| Err(DumpError::TaskPanicked(panic_message(&*payload))));

        match &result {
            Ok(()) => tracing::debug!(task = %name, "task finished"),
            Err(e) => tracing::error!(task = %name, error = %e, "task failed"),
        }
        worker.scheduler.mark_complete(result);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
