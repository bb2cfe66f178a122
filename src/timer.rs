// src/timer.rs
//! Deadline thread used for await timeouts

use crate::InitError;
use ahash::HashMap;
use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::debug;

type Task = Box<dyn FnOnce() + Send>;

#[derive(Clone)]
pub(crate) struct Timer {
    shared: Arc<TimerShared>,
}

struct TimerShared {
    state: Mutex<TimerState>,
    wake: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct TimerState {
    queue: BinaryHeap<Reverse<(Instant, u64)>>,
    tasks: HashMap<u64, Task>,
    next_key: u64,
    running: bool,
}

/// Key of a scheduled task, used to cancel it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimerKey(u64);

impl Timer {
    pub(crate) fn start() -> Result<Self, InitError> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                queue: BinaryHeap::new(),
                tasks: HashMap::default(),
                next_key: 0,
                running: true,
            }),
            wake: Condvar::new(),
            thread: Mutex::new(None),
        });

        let worker = shared.clone();
        let handle = thread::Builder::new()
            .name("polycall-timer".to_string())
            .spawn(move || worker.run())
            .map_err(|e| InitError::Thread("timer", e.to_string()))?;
        *shared.thread.lock() = Some(handle);

        Ok(Self { shared })
    }

    /// Run `task` on the timer thread at `deadline`
    pub(crate) fn schedule(&self, deadline: Instant, task: impl FnOnce() + Send + 'static) -> TimerKey {
        let mut state = self.shared.state.lock();
        let key = state.next_key;
        state.next_key += 1;
        state.queue.push(Reverse((deadline, key)));
        state.tasks.insert(key, Box::new(task));
        self.shared.wake.notify_one();
        TimerKey(key)
    }

    /// Drop a task that has not fired yet. Returns whether it was still scheduled.
    pub(crate) fn cancel(&self, key: TimerKey) -> bool {
        // Taken out under the lock, dropped after it.
        let task = self.shared.state.lock().tasks.remove(&key.0);
        task.is_some()
    }

    /// Whether the caller is the timer thread, i.e. a timeout continuation
    pub(crate) fn is_timer_thread(&self) -> bool {
        self.shared
            .thread
            .lock()
            .as_ref()
            .is_some_and(|handle| handle.thread().id() == thread::current().id())
    }

    /// Stop the thread. Tasks that have not fired are dropped.
    pub(crate) fn shutdown(&self) {
        let dropped = {
            let mut state = self.shared.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            state.queue.clear();
            std::mem::take(&mut state.tasks)
        };
        self.shared.wake.notify_all();
        drop(dropped);

        let handle = self.shared.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl TimerShared {
    fn run(&self) {
        let mut state = self.state.lock();
        while state.running {
            let next = state.queue.peek().map(|Reverse(entry)| *entry);
            match next {
                Some((deadline, key)) if deadline <= Instant::now() => {
                    state.queue.pop();
                    if let Some(task) = state.tasks.remove(&key) {
                        drop(state);
                        task();
                        state = self.state.lock();
                    }
                }
                Some((deadline, _)) => {
                    self.wake.wait_until(&mut state, deadline);
                }
                None => self.wake.wait(&mut state),
            }
        }
        debug!("timer thread stopped");
    }
}
