use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize};
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;

use mio::Ready;
use parking_lot::Mutex;

use timer;

/// Scheduler-visible state tag of a task.
///
/// Only the transitions touching this crate are represented: `co_switch`
/// moves a running task to `IoBlock`, and the elected resumer moves it back
/// to `Runnable` before handing it to the run-queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Queued (or about to be queued) on a run-queue.
    Runnable,
    /// Executing on a worker thread.
    Running,
    /// Suspended in a blocking I/O call.
    IoBlock,
}

/// A coroutine task, as seen by the I/O-wait core.
///
/// The full task object (stack, context, entry point) lives with the
/// scheduler; this crate only needs an identity, a state tag, a debug label
/// and the embedded per-block I/O state. Tasks are shared as `Arc<Task>`:
/// the strong count is the task's reference count, and every live kernel
/// registration and every armed timeout owns one clone.
#[derive(Debug)]
pub struct Task {
    id: u64,
    label: String,
    state: AtomicUsize,
    pub(crate) io: IoWaitData,
}

/// Per-task I/O blocking state.
#[derive(Debug)]
pub(crate) struct IoWaitData {
    /// Generation number of the current block. Incremented at the start of
    /// every blocking call; stale readiness and timer events carry an older
    /// value and are dropped.
    pub(crate) block_id: AtomicU32,

    /// Number of readiness events that fired during the current block.
    pub(crate) wait_successful: AtomicU32,

    /// The interest list and timeout of the current block.
    ///
    /// The mutex serialises registration against teardown: a readiness
    /// wakeup on one thread must not observe a half-installed multi-fd set
    /// being built on another.
    pub(crate) block: Mutex<BlockState>,
}

#[derive(Debug)]
pub(crate) struct BlockState {
    pub(crate) fds: Vec<FdWait>,
    pub(crate) timeout_ms: i32,
    pub(crate) timer: Option<timer::Key>,
}

/// One entry of a block's fd-interest list.
#[derive(Debug, Clone)]
pub struct FdWait {
    pub(crate) fd: RawFd,
    pub(crate) interest: Ready,
    pub(crate) revents: Ready,

    /// Registration-table key while the entry is installed in the kernel.
    pub(crate) key: Option<usize>,
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

// ===== impl Task =====

impl Task {
    /// Creates a task shell with a fresh id and the given debug label.
    pub fn new<T: Into<String>>(label: T) -> Arc<Task> {
        Arc::new(Task {
            id: NEXT_TASK_ID.fetch_add(1, SeqCst),
            label: label.into(),
            state: AtomicUsize::new(TaskState::Runnable.as_usize()),
            io: IoWaitData {
                block_id: AtomicU32::new(0),
                wait_successful: AtomicU32::new(0),
                block: Mutex::new(BlockState {
                    fds: Vec::new(),
                    timeout_ms: -1,
                    timer: None,
                }),
            },
        })
    }

    /// The task's identity.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The debug label threaded through trace output.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current scheduler state tag.
    pub fn state(&self) -> TaskState {
        TaskState::from_usize(self.state.load(SeqCst))
    }

    /// Sets the scheduler state tag.
    pub fn set_state(&self, state: TaskState) {
        self.state.store(state.as_usize(), SeqCst);
    }

    /// Generation number of the task's most recent blocking call.
    ///
    /// An explicit canceller snapshots this before racing the readiness and
    /// timeout paths; `cancel` drops the request if the block has already
    /// been resumed and a new one started.
    pub fn block_id(&self) -> u32 {
        self.io.block_id.load(SeqCst)
    }

    /// Number of readiness events delivered to the current (or, after
    /// resumption, the just-finished) block.
    ///
    /// Zero after resumption means the block ended by timeout or explicit
    /// cancellation.
    pub fn wait_successful(&self) -> u32 {
        self.io.wait_successful.load(SeqCst)
    }

    /// Snapshot of the block's fd list, with per-fd result events.
    ///
    /// Intended for the poll/select adapter after the task has resumed.
    pub fn wait_fds(&self) -> Vec<FdWait> {
        self.io.block.lock().fds.clone()
    }
}

// ===== impl TaskState =====

impl TaskState {
    fn as_usize(self) -> usize {
        match self {
            TaskState::Runnable => 0,
            TaskState::Running => 1,
            TaskState::IoBlock => 2,
        }
    }

    fn from_usize(val: usize) -> TaskState {
        match val {
            0 => TaskState::Runnable,
            1 => TaskState::Running,
            2 => TaskState::IoBlock,
            _ => unreachable!("invalid task state tag"),
        }
    }
}

// ===== impl FdWait =====

impl FdWait {
    /// Declares interest in `interest` events on `fd` for one block.
    pub fn new(fd: RawFd, interest: Ready) -> FdWait {
        FdWait {
            fd,
            interest,
            revents: Ready::empty(),
            key: None,
        }
    }

    /// The watched descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The interest this entry was registered with.
    pub fn interest(&self) -> Ready {
        self.interest
    }

    /// Events the kernel reported for this entry during the block; empty if
    /// it never fired.
    pub fn readiness(&self) -> Ready {
        self.revents
    }
}
