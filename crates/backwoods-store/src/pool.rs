//! Fixed-size thread pool draining a shared FIFO queue.
//!
//! The first task error (or panic) stops the pool: queued items are dropped
//! and [`WorkerPool::join`] returns that error.
//!
//! Panics only surface as [`StoreError::WorkerPanicked`] when built with
//! `panic = "unwind"`. The workspace release profile aborts on panic, so there
//! a panicking task takes the whole process down instead.

use crate::error::{StoreError, StoreResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

type Task<T> = dyn Fn(T) -> StoreResult<()> + Send + Sync;

struct PoolState<T> {
    queue: VecDeque<T>,
    active: usize,
    closed: bool,
    error: Option<StoreError>,
}

impl<T> PoolState<T> {
    fn settled(&self) -> bool {
        self.error.is_some() || (self.queue.is_empty() && self.active == 0)
    }
}

struct Shared<T> {
    state: Mutex<PoolState<T>>,
    work_available: Condvar,
    idle: Condvar,
}

/// Runs one task per queued item on `workers` OS threads
pub struct WorkerPool<T: Send + 'static> {
    name: String,
    shared: Arc<Shared<T>>,
    handles: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Start `workers` threads (at least one) running `task` on each item.
    pub fn new<F>(name: &str, workers: usize, task: F) -> StoreResult<Self>
    where
        F: Fn(T) -> StoreResult<()> + Send + Sync + 'static,
    {
        let workers = workers.max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                active: 0,
                closed: false,
                error: None,
            }),
            work_available: Condvar::new(),
            idle: Condvar::new(),
        });
        let task: Arc<Task<T>> = Arc::new(task);

        let mut pool = Self {
            name: name.to_string(),
            shared,
            handles: Vec::with_capacity(workers),
        };
        for i in 0..workers {
            let shared = Arc::clone(&pool.shared);
            let task = Arc::clone(&task);
            let handle = std::thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || worker_loop(&shared, task.as_ref()))?;
            pool.handles.push(handle);
        }
        debug!(pool = %pool.name, workers, "worker pool started");
        Ok(pool)
    }

    /// Queue `items`. Never blocks on the tasks themselves.
    /// Items queued after a failure are dropped.
    pub fn process(&self, items: impl IntoIterator<Item = T>) {
        let mut state = self.shared.state.lock();
        if state.error.is_some() || state.closed {
            return;
        }
        let before = state.queue.len();
        state.queue.extend(items);
        let added = state.queue.len() - before;
        drop(state);
        match added {
            0 => {}
            1 => {
                self.shared.work_available.notify_one();
            }
            _ => {
                self.shared.work_available.notify_all();
            }
        }
    }

    /// Wait for the queue to drain and every worker to go idle, then stop the workers.
    /// Returns the first task error, if any.
    pub fn join(mut self) -> StoreResult<()> {
        let error = {
            let mut state = self.shared.state.lock();
            while !state.settled() {
                self.shared.idle.wait(&mut state);
            }
            state.closed = true;
            state.queue.clear();
            state.error.take()
        };
        self.shared.work_available.notify_all();

        let mut panicked = None;
        for handle in std::mem::take(&mut self.handles) {
            if let Err(payload) = handle.join() {
                panicked.get_or_insert_with(|| panic_message(payload.as_ref()));
            }
        }
        debug!(pool = %self.name, failed = error.is_some(), "worker pool joined");
        match (error, panicked) {
            (Some(e), _) => Err(e),
            (None, Some(msg)) => Err(StoreError::WorkerPanicked(msg)),
            (None, None) => Ok(()),
        }
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        {
            let mut state = self.shared.state.lock();
            state.closed = true;
            state.queue.clear();
        }
        self.shared.work_available.notify_all();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop<T>(shared: &Shared<T>, task: &Task<T>) {
    loop {
        let item = {
            let mut state = shared.state.lock();
            loop {
                if state.closed {
                    return;
                }
                if state.error.is_none() {
                    if let Some(item) = state.queue.pop_front() {
                        state.active += 1;
                        break item;
                    }
                }
                shared.work_available.wait(&mut state);
            }
        };

        // Under `panic = "abort"` a panic never returns here.
        let result = match panic::catch_unwind(AssertUnwindSafe(|| task(item))) {
            Ok(result) => result,
            Err(payload) => Err(StoreError::WorkerPanicked(panic_message(payload.as_ref()))),
        };

        let mut state = shared.state.lock();
        state.active -= 1;
        if let Err(e) = result {
            if state.error.is_none() {
                warn!(error = %e, abandoned = state.queue.len(), "worker task failed");
                state.error = Some(e);
            }
            state.queue.clear();
        }
        if state.settled() {
            shared.idle.notify_all();
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn processes_every_item() {
        let sum = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&sum);
        let pool = WorkerPool::new("test", 4, move |n: usize| {
            s.fetch_add(n, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        pool.process(1..=500);
        pool.process(501..=1000);
        pool.join().unwrap();
        assert_eq!(sum.load(Ordering::SeqCst), 500_500);
    }

    #[test]
    fn join_without_work() {
        let pool = WorkerPool::new("idle", 3, |_: ()| Ok(())).unwrap();
        pool.join().unwrap();
    }

    #[test]
    fn zero_workers_still_runs() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let pool = WorkerPool::new("one", 0, move |_: u8| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        pool.process([1, 2, 3]);
        pool.join().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn first_error_abandons_queue() {
        let attempted = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&attempted);
        let pool = WorkerPool::new("fail", 1, move |n: usize| {
            a.fetch_add(1, Ordering::SeqCst);
            if n == 5 {
                return Err(StoreError::Communicator(format!("item {n}")));
            }
            Ok(())
        })
        .unwrap();
        pool.process(0..100);
        let err = pool.join().unwrap_err();
        assert!(matches!(err, StoreError::Communicator(ref m) if m == "item 5"));
        assert_eq!(attempted.load(Ordering::SeqCst), 6);
    }

    #[test]
    #[cfg(panic = "unwind")]
    fn panic_is_reported() {
        let pool = WorkerPool::new("panic", 2, |n: u32| {
            if n == 3 {
                panic!("boom {n}");
            }
            Ok(())
        })
        .unwrap();
        pool.process(0..10);
        match pool.join() {
            Err(StoreError::WorkerPanicked(msg)) => assert_eq!(msg, "boom 3"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn dropping_unjoined_pool_stops_workers() {
        let pool = WorkerPool::new("drop", 2, |_: u8| Ok(())).unwrap();
        pool.process([1, 2]);
        drop(pool);
    }
}
