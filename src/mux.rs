use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::process;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering::{Acquire, Release};
use std::sync::Arc;
use std::time::Duration;

use libc;
use mio;
use mio::unix::EventedFd;
use mio::{PollOpt, Ready, Token};
use parking_lot::{Mutex, RwLock};
use slab::Slab;

use task::Task;

/// Which of the two readiness instances carries a registration.
///
/// Descriptors with readable interest go to the read instance, everything
/// else to the write instance. The split lets one thread block on the read
/// side while the write side is always drained without blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

impl Direction {
    pub fn for_interest(interest: Ready) -> Direction {
        if interest.is_readable() {
            Direction::Read
        } else {
            Direction::Write
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Direction::Read => fmt.write_str("read"),
            Direction::Write => fmt.write_str("write"),
        }
    }
}

const TOKEN_SHIFT: usize = 22;

// Leaves the token's upper bits to the generation stamp.
const MAX_REGISTRATIONS: usize = (1 << TOKEN_SHIFT) - 1;

/// Outcome of installing one descriptor.
pub(crate) enum AddResult {
    /// Installed; the key names the registration until it is deleted.
    Registered(usize),
    /// The descriptor is already present in that instance.
    AlreadyPresent,
    /// The kernel refused the registration for any other reason.
    Failed(io::Error),
}

/// A stable node backing one kernel registration.
///
/// The kernel cookie only carries `(generation, slab key)`; this node holds
/// the strong task reference for the registration's lifetime, so a stale
/// event can never name a destroyed task.
struct WaitNode {
    task: Arc<Task>,
    generation: u32,
    index: usize,
}

/// The readiness multiplexer pair plus its registration table.
pub(crate) struct Multiplexer {
    create_lock: Mutex<()>,
    owner_pid: AtomicI32,
    instances: RwLock<Option<Arc<Instances>>>,
    registrations: RwLock<Slab<WaitNode>>,
}

pub(crate) struct Instances {
    read: mio::Poll,
    write: mio::Poll,
}

impl Instances {
    fn create() -> Instances {
        Instances {
            read: create_poll(),
            write: create_poll(),
        }
    }

    fn get(&self, dir: Direction) -> &mio::Poll {
        match dir {
            Direction::Read => &self.read,
            Direction::Write => &self.write,
        }
    }

    /// Drains one instance into `events`, waiting at most `timeout_ms`.
    pub fn wait(
        &self,
        dir: Direction,
        events: &mut mio::Events,
        timeout_ms: i32,
    ) -> io::Result<usize> {
        let timeout = Duration::from_millis(timeout_ms.max(0) as u64);
        self.get(dir).poll(events, Some(timeout))
    }
}

fn create_poll() -> mio::Poll {
    match mio::Poll::new() {
        Ok(poll) => poll,
        Err(e) => {
            // The core cannot operate without the kernel facility.
            eprintln!(
                "coroutine scheduler init failed. readiness instance create error: {}",
                e
            );
            process::exit(1);
        }
    }
}

impl Multiplexer {
    pub fn new() -> Multiplexer {
        Multiplexer {
            create_lock: Mutex::new(()),
            owner_pid: AtomicI32::new(0),
            instances: RwLock::new(None),
            registrations: RwLock::new(Slab::new()),
        }
    }

    /// Returns the instance pair, (re)creating it when the observed process
    /// id differs from the recorded owner.
    ///
    /// A child process inherits the parent's instances across `fork`; the
    /// pid check replaces them on first use, and dropping the old pair
    /// closes the inherited kernel descriptors.
    pub fn ensure(&self) -> Arc<Instances> {
        let pid = unsafe { libc::getpid() };

        if self.owner_pid.load(Acquire) == pid {
            if let Some(ref instances) = *self.instances.read() {
                return instances.clone();
            }
        }

        let _create = self.create_lock.lock();

        if self.owner_pid.load(Acquire) == pid {
            if let Some(ref instances) = *self.instances.read() {
                return instances.clone();
            }
        }

        debug!("creating readiness instance pair, pid={}", pid);
        let fresh = Arc::new(Instances::create());
        *self.instances.write() = Some(fresh.clone());
        self.owner_pid.store(pid, Release);
        fresh
    }

    /// Installs a one-shot registration for `fd` in the instance chosen by
    /// its interest.
    ///
    /// The registration node (and with it the task reference it owns) is
    /// inserted before the kernel call, so a wakeup racing in from another
    /// thread can never observe a registered fd without a live node. On
    /// failure the node is removed again.
    pub fn add(
        &self,
        dir: Direction,
        fd: RawFd,
        interest: Ready,
        task: &Arc<Task>,
        generation: u32,
        index: usize,
    ) -> AddResult {
        let instances = self.ensure();

        let key = {
            let mut registrations = self.registrations.write();
            if registrations.len() >= MAX_REGISTRATIONS {
                return AddResult::Failed(io::Error::new(
                    io::ErrorKind::Other,
                    "at max registered descriptors",
                ));
            }

            registrations.insert(WaitNode {
                task: task.clone(),
                generation,
                index,
            })
        };

        let token = Token(((generation as usize) << TOKEN_SHIFT) | key);
        let opts = PollOpt::level() | PollOpt::oneshot();

        match instances.get(dir).register(&EventedFd(&fd), token, interest, opts) {
            Ok(()) => AddResult::Registered(key),
            Err(e) => {
                self.registrations.write().remove(key);

                if e.raw_os_error() == Some(libc::EEXIST) {
                    AddResult::AlreadyPresent
                } else {
                    AddResult::Failed(e)
                }
            }
        }
    }

    /// Removes `fd` from its instance.
    ///
    /// True iff the kernel acknowledged the removal; only then is the
    /// registration node dropped, releasing its task reference.
    pub fn del(&self, dir: Direction, fd: RawFd, key: usize) -> bool {
        let instances = self.ensure();

        match instances.get(dir).deregister(&EventedFd(&fd)) {
            Ok(()) => {
                self.registrations.write().remove(key);
                true
            }
            Err(e) => {
                trace!("deregister fd={} from {} instance failed: {}", fd, dir, e);
                false
            }
        }
    }

    /// Decodes a kernel cookie back into its registration.
    ///
    /// Validates the token's generation bits against the node before
    /// handing out anything; a mismatch means the registration was torn
    /// down and the key reused since the event was queued.
    pub fn lookup(&self, token: Token) -> Option<(Arc<Task>, u32, usize)> {
        let key = token.0 & MAX_REGISTRATIONS;

        let registrations = self.registrations.read();
        let node = match registrations.get(key) {
            Some(node) => node,
            None => return None,
        };

        if ((node.generation as usize) << TOKEN_SHIFT) | key != token.0 {
            return None;
        }

        Some((node.task.clone(), node.generation, node.index))
    }

    #[cfg(test)]
    pub fn registered(&self) -> usize {
        self.registrations.read().len()
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Multiplexer")
            .field("owner_pid", &self.owner_pid)
            .finish()
    }
}
