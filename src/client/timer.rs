//! A single scheduler thread servicing a priority queue of request
//! deadlines, shared by all outstanding requests of a callback client

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashSet},
    sync::{Arc, Condvar, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    deadline: Instant,
    key: u64,
}

struct State {
    queue: BinaryHeap<Reverse<Entry>>,
    /// Keys still armed. Cancellation removes the key here, the heap entry
    /// is discarded lazily when it surfaces.
    armed: HashSet<u64>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

/// Fires a callback with each key whose deadline expires. Keys are supplied
/// by the caller and must be unique among armed timers.
pub(crate) struct TimerScheduler {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerScheduler {
    pub(crate) fn new(on_expire: impl Fn(u64) + Send + 'static) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: BinaryHeap::new(),
                armed: HashSet::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
        });
        let worker = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || run(&shared, on_expire))
        };
        Self {
            shared,
            thread: Mutex::new(Some(worker)),
        }
    }

    /// Arms a timer for `key`, firing `delay` from now
    pub(crate) fn schedule(&self, key: u64, delay: Duration) {
        let mut state = self.shared.state.lock().unwrap();
        state.queue.push(Reverse(Entry {
            deadline: Instant::now() + delay,
            key,
        }));
        state.armed.insert(key);
        self.shared.cond.notify_all();
    }

    /// Disarms the timer for `key`. A no-op when the timer already fired.
    pub(crate) fn cancel(&self, key: u64) {
        let mut state = self.shared.state.lock().unwrap();
        state.armed.remove(&key);
        self.shared.cond.notify_all();
    }

    /// Asks the worker to exit once, further timers will never fire
    pub(crate) fn shutdown(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.shutdown = true;
        self.shared.cond.notify_all();
    }

    /// Joins the worker thread, returning whether it finished in time
    pub(crate) fn join(&self, timeout: Option<Duration>) -> bool {
        let mut slot = self.thread.lock().unwrap();
        let handle = match slot.take() {
            Some(handle) => handle,
            None => return true,
        };
        match timeout {
            None => {
                let _ = handle.join();
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !handle.is_finished() && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(1));
                }
                if handle.is_finished() {
                    let _ = handle.join();
                    true
                } else {
                    *slot = Some(handle);
                    false
                }
            }
        }
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: &Shared, on_expire: impl Fn(u64)) {
    let mut state = shared.state.lock().unwrap();
    loop {
        if state.shutdown {
            return;
        }
        let next = state
            .queue
            .peek()
            .map(|Reverse(entry)| (entry.deadline, entry.key));
        match next {
            None => {
                state = shared.cond.wait(state).unwrap();
            }
            Some((deadline, key)) => {
                if !state.armed.contains(&key) {
                    // Cancelled, discard
                    state.queue.pop();
                    continue;
                }
                let now = Instant::now();
                if deadline <= now {
                    state.queue.pop();
                    state.armed.remove(&key);
                    // Fire without the lock so the callback may take it
                    drop(state);
                    on_expire(key);
                    state = shared.state.lock().unwrap();
                } else {
                    let (guard, _) = shared.cond.wait_timeout(state, deadline - now).unwrap();
                    state = guard;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let (tx, rx) = mpsc::channel();
        let timers = TimerScheduler::new(move |key| {
            let _ = tx.send(key);
        });
        timers.schedule(2, Duration::from_millis(60));
        timers.schedule(1, Duration::from_millis(20));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
        timers.shutdown();
        assert!(timers.join(Some(Duration::from_secs(5))));
    }

    #[test]
    fn cancelled_timers_stay_silent() {
        let (tx, rx) = mpsc::channel();
        let timers = TimerScheduler::new(move |key| {
            let _ = tx.send(key);
        });
        timers.schedule(1, Duration::from_millis(30));
        timers.schedule(2, Duration::from_millis(30));
        timers.cancel(1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        timers.shutdown();
        assert!(timers.join(Some(Duration::from_secs(5))));
    }
}
