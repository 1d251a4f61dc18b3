//! Task engine: a FIFO queue of boxed tasks drained by a fixed pool of
//! worker threads.
//!
//! A task is owned by the queue until a worker dequeues it, and by that
//! worker until it finishes. Tasks may submit further tasks. Once the
//! submitter calls `await_all`, the run ends when the queue is empty and no
//! task is running, or as soon as any task fails.

mod engine;

pub use engine::{Scheduler, TaskEngine, Worker};

use crate::error::Result;

/// A unit of work executed on a worker thread.
pub trait Task: Send + 'static {
    /// Short description for logs.
    fn name(&self) -> String;

    /// Run the task to completion. An error ends the whole run.
    fn execute(self: Box<Self>, worker: &Worker) -> Result<()>;
}
