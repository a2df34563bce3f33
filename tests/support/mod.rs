use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::{Arc, Mutex};

use coro_reactor::{Schedule, Task};
use libc;

/// Scheduler stub: records every `add_runnable`, hands out a settable
/// current task, and keeps a deferred-delete list.
pub struct MockSchedule {
    state: Mutex<State>,
    resumed: AtomicUsize,
}

struct State {
    current: Option<Arc<Task>>,
    runnable: Vec<Arc<Task>>,
    delete: Vec<Arc<Task>>,
}

impl MockSchedule {
    pub fn new() -> Arc<MockSchedule> {
        Arc::new(MockSchedule {
            state: Mutex::new(State {
                current: None,
                runnable: Vec::new(),
                delete: Vec::new(),
            }),
            resumed: AtomicUsize::new(0),
        })
    }

    pub fn set_current(&self, task: Option<Arc<Task>>) {
        self.state.lock().unwrap().current = task;
    }

    /// Total `add_runnable` calls observed.
    pub fn resumed(&self) -> usize {
        self.resumed.load(SeqCst)
    }

    pub fn take_runnable(&self) -> Vec<Arc<Task>> {
        mem::replace(&mut self.state.lock().unwrap().runnable, Vec::new())
    }

    pub fn defer_delete(&self, task: Arc<Task>) {
        self.state.lock().unwrap().delete.push(task);
    }
}

impl Schedule for MockSchedule {
    fn current_task(&self) -> Option<Arc<Task>> {
        self.state.lock().unwrap().current.clone()
    }

    fn co_yield(&self) {}

    fn add_runnable(&self, task: Arc<Task>) {
        self.resumed.fetch_add(1, SeqCst);
        self.state.lock().unwrap().runnable.push(task);
    }

    fn pop_delete_list(&self) -> Vec<Arc<Task>> {
        mem::replace(&mut self.state.lock().unwrap().delete, Vec::new())
    }
}

/// A real pipe; readiness on its ends drives the readiness instances.
pub struct Pipe {
    pub rd: RawFd,
    pub wr: RawFd,
}

impl Pipe {
    pub fn new() -> Pipe {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0, "pipe(2) failed");
        Pipe {
            rd: fds[0],
            wr: fds[1],
        }
    }

    /// Makes the read end readable by writing one byte.
    pub fn make_readable(&self) {
        let byte = [0u8; 1];
        let n = unsafe { libc::write(self.wr, byte.as_ptr() as *const libc::c_void, 1) };
        assert_eq!(n, 1);
    }

    /// Consumes one pending byte from the read end.
    pub fn drain(&self) {
        let mut byte = [0u8; 1];
        let n = unsafe { libc::read(self.rd, byte.as_mut_ptr() as *mut libc::c_void, 1) };
        assert_eq!(n, 1);
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.rd);
            libc::close(self.wr);
        }
    }
}
