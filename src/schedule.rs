use std::sync::Arc;

use task::Task;

/// The scheduler collaborator seam.
///
/// The I/O-wait core never owns tasks or a run-queue; it consumes these
/// four operations from the surrounding coroutine scheduler. All of them
/// must be callable from any worker thread.
pub trait Schedule: Send + Sync + 'static {
    /// The task executing on the calling thread's coroutine stack, if any.
    fn current_task(&self) -> Option<Arc<Task>>;

    /// Suspends the current task and returns control to the scheduler.
    ///
    /// `co_switch` calls this after staging the block; the scheduler is
    /// expected to invoke `IoWait::scheduler_switch` for the task once it
    /// is off its stack.
    fn co_yield(&self);

    /// Enqueues a resumed task on a run-queue.
    fn add_runnable(&self, task: Arc<Task>);

    /// Drains tasks whose last external reference has been retired.
    ///
    /// The wait loop drops these while it holds the pump exclusion, so no
    /// concurrently-drained kernel event can name a destroyed task.
    fn pop_delete_list(&self) -> Vec<Arc<Task>> {
        Vec::new()
    }
}

impl<S: Schedule> Schedule for Arc<S> {
    fn current_task(&self) -> Option<Arc<Task>> {
        (**self).current_task()
    }

    fn co_yield(&self) {
        (**self).co_yield()
    }

    fn add_runnable(&self, task: Arc<Task>) {
        (**self).add_runnable(task)
    }

    fn pop_delete_list(&self) -> Vec<Arc<Task>> {
        (**self).pop_delete_list()
    }
}

/// Tunables handed down from the scheduler options.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound, in milliseconds, for the adaptive blocking quantum of
    /// the read-side readiness drain.
    pub max_sleep_ms: i32,

    /// Capacity of the kernel event buffer used by each drain.
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            max_sleep_ms: 1000,
            event_capacity: 1024,
        }
    }
}
