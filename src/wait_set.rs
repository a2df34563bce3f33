use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use task::Task;

/// The set of currently blocked tasks.
///
/// `erase` is the single synchronisation point that elects the resumer for
/// each block: of all actors racing to wake a task, exactly one observes
/// `true` per insertion, and that winner owns teardown and re-queueing.
pub(crate) struct WaitSet {
    tasks: Mutex<HashSet<u64>>,
}

impl WaitSet {
    pub fn new() -> WaitSet {
        WaitSet {
            tasks: Mutex::new(HashSet::new()),
        }
    }

    pub fn insert(&self, task: &Arc<Task>) {
        self.tasks.lock().insert(task.id());
    }

    /// Removes the task, returning whether this caller won the removal.
    pub fn erase(&self, task: &Arc<Task>) -> bool {
        self.tasks.lock().remove(&task.id())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::SeqCst;
    use std::thread;

    #[test]
    fn erase_elects_a_single_winner() {
        let set = Arc::new(WaitSet::new());
        let task = Task::new("contended");
        set.insert(&task);

        let wins = Arc::new(AtomicUsize::new(0));
        let mut threads = Vec::new();

        for _ in 0..8 {
            let set = set.clone();
            let task = task.clone();
            let wins = wins.clone();

            threads.push(thread::spawn(move || {
                if set.erase(&task) {
                    wins.fetch_add(1, SeqCst);
                }
            }));
        }

        for th in threads {
            th.join().unwrap();
        }

        assert_eq!(wins.load(SeqCst), 1);
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn reinsertion_allows_another_winner() {
        let set = WaitSet::new();
        let task = Task::new("repeat");

        set.insert(&task);
        assert!(set.erase(&task));
        assert!(!set.erase(&task));

        set.insert(&task);
        assert!(set.erase(&task));
    }
}
