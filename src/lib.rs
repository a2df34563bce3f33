#![doc(html_root_url = "https://docs.rs/coro-reactor/0.1.0")]
#![deny(missing_docs, missing_debug_implementations)]

//! Event loop that drives blocking I/O for stackful coroutines.
//!
//! A coroutine that performs a blocking syscall on one or more file
//! descriptors is suspended, its descriptors are installed one-shot in a
//! kernel readiness facility, an optional timeout is armed, and the task is
//! resumed exactly once, whether by readiness, by timeout, or by explicit
//! cancellation. This crate is that coupling and nothing else: the
//! context-switch primitive, the run-queues and task lifetimes belong to
//! the surrounding scheduler and are consumed through the [`Schedule`]
//! trait.
//!
//! The crate provides:
//!
//! * [`IoWait`] is the main type. It owns the readiness instance pair, the
//!   expiration queue and the wait-set, and implements the block/resume
//!   protocol and the wait-loop pump.
//!
//! * [`Task`] and [`FdWait`] are the shared task view and the per-fd
//!   interest entry the syscall hook layer builds.
//!
//! * [`Schedule`] is the seam to the scheduler: current task, yield,
//!   run-queue hand-off and deferred destruction.
//!
//! Worker threads drive everything through two entry points: a task calls
//! [`IoWait::co_switch`] on its own stack, and any thread pumps readiness
//! and timeouts through [`IoWait::wait_loop`]. Resumption is elected
//! through the wait-set: whichever actor wins the removal tears down the
//! remaining kernel registrations and re-queues the task, so a task is
//! never resumed twice for one block.
//!
//! [`IoWait`]: struct.IoWait.html
//! [`IoWait::co_switch`]: struct.IoWait.html#method.co_switch
//! [`IoWait::wait_loop`]: struct.IoWait.html#method.wait_loop
//! [`Task`]: struct.Task.html
//! [`FdWait`]: struct.FdWait.html
//! [`Schedule`]: trait.Schedule.html

extern crate libc;
#[macro_use]
extern crate log;
extern crate mio;
extern crate parking_lot;
extern crate slab;

mod mux;
mod schedule;
mod task;
mod timer;
mod wait_set;

pub use schedule::{Config, Schedule};
pub use task::{FdWait, Task, TaskState};

use mux::{AddResult, Direction, Multiplexer};
use wait_set::WaitSet;

use parking_lot::Mutex;

use std::collections::HashMap;
use std::io;
use std::mem;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;
use std::time::Duration;
use std::{cmp, fmt};

/// Expired timers are drained from the queue in batches of this size.
const TIMER_BATCH: usize = 128;

/// The I/O-wait core.
///
/// One instance serves the whole process. All methods take `&self` and are
/// callable from any worker thread; the pump itself is serialised through a
/// non-blocking process-wide lock, so concurrent [`wait_loop`] callers back
/// off instead of piling up on the kernel.
///
/// [`wait_loop`]: #method.wait_loop
pub struct IoWait<S> {
    sched: S,
    config: Config,

    /// The two readiness instances and their registration table.
    mux: Multiplexer,

    /// Deadlines armed for blocks with a timeout.
    timer: timer::TimerQueue<Timeout>,

    /// Blocked tasks; the erase winner is the resumer.
    wait_set: WaitSet,

    /// State owned by whichever thread currently pumps readiness.
    pump: Mutex<Pump>,

    /// Expired timeouts detached from the queue, awaiting their run.
    timeout_list: Mutex<Vec<Timeout>>,

    /// Adaptive quantum for the blocking read-side drain, in milliseconds.
    wait_quantum_ms: AtomicI32,
}

/// An armed block timeout. Dropping it releases the task reference the
/// timer held.
struct Timeout {
    task: Arc<Task>,
    generation: u32,
}

struct Pump {
    /// Reused kernel event buffer.
    events: mio::Events,

    /// Diagnostic pump iteration counter.
    loop_index: u64,

    /// Tasks woken by the current pump, buffered until both instances are
    /// drained so multi-fd blocks see their full ready count.
    woken: HashMap<u64, (Arc<Task>, u32)>,
}

impl<S: Schedule> IoWait<S> {
    /// Creates the core with default [`Config`] values.
    ///
    /// [`Config`]: struct.Config.html
    pub fn new(sched: S) -> IoWait<S> {
        IoWait::with_config(sched, Config::default())
    }

    /// Creates the core with explicit scheduler options.
    pub fn with_config(sched: S, config: Config) -> IoWait<S> {
        let events = mio::Events::with_capacity(config.event_capacity);

        IoWait {
            sched,
            config,
            mux: Multiplexer::new(),
            timer: timer::TimerQueue::new(),
            wait_set: WaitSet::new(),
            pump: Mutex::new(Pump {
                events,
                loop_index: 0,
                woken: HashMap::new(),
            }),
            timeout_list: Mutex::new(Vec::new()),
            wait_quantum_ms: AtomicI32::new(0),
        }
    }

    /// Ratchets the blocking quantum up by one millisecond, capped at the
    /// configured maximum. An idle detector calls this when work is scarce.
    pub fn delay_event_wait_time(&self) {
        let next = cmp::min(
            self.wait_quantum_ms.load(SeqCst) + 1,
            self.config.max_sleep_ms,
        );
        self.wait_quantum_ms.store(next, SeqCst);
    }

    /// Resets the blocking quantum to zero on renewed activity.
    pub fn reset_event_wait_time(&self) {
        self.wait_quantum_ms.store(0, SeqCst);
    }

    /// Suspends the current task on an fd-interest list.
    ///
    /// Called on the task's own stack by the syscall hook layer. Starts a
    /// new block generation, stages `fds` and the timeout on the task, then
    /// yields; the scheduler is expected to complete the registration with
    /// [`scheduler_switch`] once the task is off its stack.
    ///
    /// When the call returns the task has been resumed and all kernel and
    /// timer registrations of the block are gone; [`Task::wait_successful`]
    /// and the per-fd [`FdWait::readiness`] results tell the caller why.
    ///
    /// A no-op when the calling thread is not running a coroutine.
    ///
    /// [`scheduler_switch`]: #method.scheduler_switch
    /// [`Task::wait_successful`]: struct.Task.html#method.wait_successful
    /// [`FdWait::readiness`]: struct.FdWait.html#method.readiness
    pub fn co_switch(&self, fds: Vec<FdWait>, timeout_ms: i32) {
        let task = match self.sched.current_task() {
            Some(task) => task,
            None => return,
        };

        {
            let mut block = task.io.block.lock();

            let id = task.io.block_id.fetch_add(1, SeqCst).wrapping_add(1);
            task.set_state(TaskState::IoBlock);
            task.io.wait_successful.store(0, SeqCst);
            block.timeout_ms = timeout_ms;
            if block.timer.take().is_some() {
                // The previous block's timeout stays armed and fires stale;
                // the generation bump above makes that run a no-op.
                trace!("task({}) leaves a pending timeout behind", task.label());
            }
            block.fds = fds;

            trace!(
                "task({}) co_switch id={} nfds={} timeout={}",
                task.label(),
                id,
                block.fds.len(),
                timeout_ms
            );
        }

        self.sched.co_yield();
    }

    /// Completes a block staged by [`co_switch`]: installs the kernel
    /// registrations and arms the timeout.
    ///
    /// Called by the scheduler once the task has yielded. A duplicate fd in
    /// the interest list rolls back every registration made so far and
    /// resumes the task immediately; any other per-fd kernel error skips
    /// just that descriptor, the way `poll` reports an event-less slot. If
    /// nothing was installed the task is resumed runnable at once and the
    /// block reads like an instant timeout (`wait_successful == 0`).
    ///
    /// [`co_switch`]: #method.co_switch
    pub fn scheduler_switch(&self, task: &Arc<Task>) {
        let mut block = task.io.block.lock();

        // The generation must be read before any add: once one fd is
        // installed, a parallel pump can resume the task and let it re-enter
        // a syscall, advancing the id under us.
        let generation = task.io.block_id.load(SeqCst);

        self.wait_set.insert(task);

        let mut ok = false;
        let mut registered: Vec<usize> = Vec::new();

        for i in 0..block.fds.len() {
            let (fd, interest) = {
                let fdw = &block.fds[i];
                (fdw.fd, fdw.interest)
            };
            let dir = Direction::for_interest(interest);

            match self.mux.add(dir, fd, interest, task, generation, i) {
                AddResult::Registered(key) => {
                    trace!(
                        "task({}) add fd={} into {} instance success",
                        task.label(),
                        fd,
                        dir
                    );
                    block.fds[i].key = Some(key);
                    registered.push(i);
                    ok = true;
                }
                AddResult::AlreadyPresent => {
                    debug!(
                        "task({}) fd={} already present in {} instance, rolling back",
                        task.label(),
                        fd,
                        dir
                    );

                    for &j in &registered {
                        let (fd, interest) = {
                            let fdw = &block.fds[j];
                            (fdw.fd, fdw.interest)
                        };

                        if let Some(key) = block.fds[j].key.take() {
                            if self.mux.del(Direction::for_interest(interest), fd, key) {
                                trace!("task({}) rollback fd={}", task.label(), fd);
                            }
                        }
                    }

                    ok = false;
                    break;
                }
                AddResult::Failed(e) => {
                    // poll's contract: a descriptor the kernel refuses is
                    // reported event-less while the rest of the set proceeds.
                    debug!(
                        "task({}) add fd={} into {} instance error: {}",
                        task.label(),
                        fd,
                        dir,
                        e
                    );
                    continue;
                }
            }
        }

        let timeout_ms = block.timeout_ms;

        trace!(
            "task({}) scheduler_switch id={} nfds={} timeout={} ok={}",
            task.label(),
            generation,
            block.fds.len(),
            timeout_ms,
            ok
        );

        if !ok {
            drop(block);

            if self.wait_set.erase(task) {
                task.set_state(TaskState::Runnable);
                self.sched.add_runnable(task.clone());
            }
        } else if timeout_ms != -1 {
            let delay = Duration::from_millis(cmp::max(timeout_ms, 0) as u64);
            let key = self.timer.expire_in(
                delay,
                Timeout {
                    task: task.clone(),
                    generation,
                },
            );
            block.timer = Some(key);
        }
    }

    /// Resumes a blocked task, once.
    ///
    /// Safe to call from any thread and from any of the three exits of a
    /// block (fd readiness, timeout, explicit cancellation). A stale
    /// `generation` is silently dropped; losing the wait-set election means
    /// another actor already owns the wakeup. The winner detaches every
    /// remaining kernel registration and hands the task to the run-queue.
    pub fn cancel(&self, task: &Arc<Task>, generation: u32) {
        if task.io.block_id.load(SeqCst) != generation {
            trace!(
                "task({}) cancel id={} stale, current id={}",
                task.label(),
                generation,
                task.block_id()
            );
            return;
        }

        if !self.wait_set.erase(task) {
            // Readiness, timeout and explicit cancellation race here; the
            // erase winner owns the teardown.
            return;
        }

        trace!("task({}) io block wakeup id={}", task.label(), generation);

        let mut block = task.io.block.lock();

        for i in 0..block.fds.len() {
            let (fd, interest) = {
                let fdw = &block.fds[i];
                (fdw.fd, fdw.interest)
            };

            if let Some(key) = block.fds[i].key.take() {
                let dir = Direction::for_interest(interest);
                if self.mux.del(dir, fd, key) {
                    trace!(
                        "task({}) cleared fd={} from {} instance",
                        task.label(),
                        fd,
                        dir
                    );
                }
            }
        }

        drop(block);

        task.set_state(TaskState::Runnable);
        self.sched.add_runnable(task.clone());
    }

    /// Pumps readiness events, expired timeouts and deferred destruction
    /// once.
    ///
    /// Any worker thread may call this. Returns the amount of work done
    /// (readiness events plus expired timers), or `-1` when another thread
    /// already holds the pump and nothing had expired; the caller should
    /// back off.
    ///
    /// Only the read-side drain may block, for at most the adaptive
    /// quantum, and only when `block_allowed` is set and no timer already
    /// expired; the write side is always drained without blocking.
    pub fn wait_loop(&self, block_allowed: bool) -> i32 {
        let mut c: i32 = 0;

        loop {
            let mut expired = Vec::new();
            if self.timer.get_expired(&mut expired, TIMER_BATCH) == 0 {
                break;
            }
            c += expired.len() as i32;

            // Expired callbacks are held detached from the timer queue so a
            // concurrent cancel for a task that also has a pending timer
            // stays race-free; a stale generation makes the late run a
            // no-op.
            self.timeout_list.lock().append(&mut expired);
        }

        let mut pump = match self.pump.try_lock() {
            Some(pump) => pump,
            None => return if c != 0 { c } else { -1 },
        };

        pump.loop_index += 1;

        let instances = self.mux.ensure();
        let mut epoll_n: i32 = 0;

        for &dir in &[Direction::Read, Direction::Write] {
            let timeout_ms = if block_allowed && dir == Direction::Read && c == 0 {
                self.wait_quantum_ms.load(SeqCst)
            } else {
                0
            };

            let n = loop {
                match instances.wait(dir, &mut pump.events, timeout_ms) {
                    Ok(n) => break n,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("wait on {} instance failed: {}", dir, e);
                        break 0;
                    }
                }
            };

            epoll_n += n as i32;
            trace!(
                "drained {} instance, n={} loop_index={}",
                dir,
                n,
                pump.loop_index
            );

            let Pump {
                ref events,
                ref mut woken,
                ..
            } = *pump;

            for event in events.iter() {
                let (task, generation, index) = match self.mux.lookup(event.token()) {
                    Some(found) => found,
                    None => continue,
                };

                if task.io.block_id.load(SeqCst) != generation {
                    continue;
                }

                {
                    let mut block = task.io.block.lock();

                    // Re-checked under the lock: the winner of a racing
                    // teardown may have resumed the task in between.
                    if task.io.block_id.load(SeqCst) != generation {
                        continue;
                    }

                    if let Some(fdw) = block.fds.get_mut(index) {
                        fdw.revents = fdw.revents | event.readiness();
                    }
                }

                task.io.wait_successful.fetch_add(1, SeqCst);

                trace!(
                    "task({}) {} instance trigger id={} events={:?}",
                    task.label(),
                    dir,
                    generation,
                    event.readiness()
                );

                woken.entry(task.id()).or_insert((task, generation));
            }
        }

        // Resume only after both instances are drained, so a multi-fd block
        // whose descriptors fired on both sides reports the full count.
        let woken: Vec<(Arc<Task>, u32)> = pump.woken.drain().map(|(_, entry)| entry).collect();
        for (task, generation) in woken {
            self.cancel(&task, generation);
        }

        let timeout_list = mem::replace(&mut *self.timeout_list.lock(), Vec::new());
        for timeout in timeout_list {
            trace!(
                "task({}) blocking call timed out, id={}",
                timeout.task.id(),
                timeout.generation
            );
            self.cancel(&timeout.task, timeout.generation);
        }

        // Final destruction stays inside the pump exclusion: the kernel may
        // still hold cookies for registrations these tasks owned.
        for task in self.sched.pop_delete_list() {
            trace!("task({}) destroyed", task.label());
            drop(task);
        }

        epoll_n + c
    }
}

impl<S> fmt::Debug for IoWait<S> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("IoWait")
            .field("wait_quantum_ms", &self.wait_quantum_ms)
            .finish()
    }
}
