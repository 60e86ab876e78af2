//! Executor bridge
//!
//! The minimal contract the asynchronous operations need from the caller's
//! scheduler: deferred execution of a completion ([`Executor::post`]) and
//! an identity comparison. A completion is never run inline, even when its
//! result is known at the moment the operation is issued.

use async_channel::{Receiver, Sender, TryRecvError, unbounded};
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, Wake, Waker};
use std::thread::Thread;
use std::time::{Duration, Instant};
use tracing::warn;

/// Unit of work posted to an executor
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Scheduler completions are delivered on
pub trait Executor: Clone + Send + Sync + 'static {
    /// Queue `task` for later execution on this executor
    fn post(&self, task: Task);

    /// True when both values schedule onto the same executor
    fn same_executor(&self, other: &Self) -> bool;
}

/// Cooperative single-threaded executor
///
/// Posted tasks are queued and run by whichever thread drives the
/// executor through [`run_one`](QueueExecutor::run_one),
/// [`poll`](QueueExecutor::poll) or [`run_for`](QueueExecutor::run_for).
#[derive(Clone)]
pub struct QueueExecutor {
    tx: Sender<Task>,
    rx: Receiver<Task>,
}

impl QueueExecutor {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// Number of queued tasks
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Run every task that is ready, without blocking
    ///
    /// Returns the number of tasks run.
    pub fn poll(&self) -> usize {
        let mut ran = 0;
        loop {
            match self.rx.try_recv() {
                Ok(task) => {
                    task();
                    ran += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return ran,
            }
        }
    }

    /// Block up to `timeout` for one task and run it
    ///
    /// The thread parks until a post wakes it or the deadline passes.
    /// Returns false if nothing arrived in time.
    pub fn run_one(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let waker = Waker::from(Arc::new(ThreadWaker(std::thread::current())));
        let mut cx = Context::from_waker(&waker);
        let mut recv = pin!(self.rx.recv());

        loop {
            match recv.as_mut().poll(&mut cx) {
                Poll::Ready(Ok(task)) => {
                    task();
                    return true;
                }
                Poll::Ready(Err(_)) => return false,
                Poll::Pending => {}
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            std::thread::park_timeout(remaining);
        }
    }

    /// Keep running tasks until `duration` has elapsed
    pub fn run_for(&self, duration: Duration) -> usize {
        let deadline = Instant::now() + duration;
        let mut ran = 0;
        while Instant::now() < deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if self.run_one(remaining) {
                ran += 1;
            }
        }
        ran
    }
}

/// Unparks the thread blocked in `run_one`
struct ThreadWaker(Thread);

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

impl Default for QueueExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for QueueExecutor {
    fn post(&self, task: Task) {
        // Both ends live in self, so the channel cannot be closed here
        if self.tx.try_send(task).is_err() {
            warn!("Executor queue closed, dropping task");
        }
    }

    fn same_executor(&self, other: &Self) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

static NEXT_TOKIO_EXECUTOR: AtomicU64 = AtomicU64::new(1);

/// Executor posting onto a Tokio runtime
#[derive(Clone)]
pub struct TokioExecutor {
    handle: tokio::runtime::Handle,
    id: Arc<u64>,
}

impl TokioExecutor {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self {
            handle,
            id: Arc::new(NEXT_TOKIO_EXECUTOR.fetch_add(1, Ordering::Relaxed)),
        }
    }

    /// Executor for the runtime the caller is running on
    ///
    /// Panics outside a Tokio runtime, like `Handle::current`.
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }

    pub fn handle(&self) -> &tokio::runtime::Handle {
        &self.handle
    }
}

impl Executor for TokioExecutor {
    fn post(&self, task: Task) {
        self.handle.spawn(async move { task() });
    }

    fn same_executor(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_queue_executor_defers_tasks() {
        let executor = QueueExecutor::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        executor.post(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        // Nothing runs until the executor is driven
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(executor.pending(), 1);
        assert_eq!(executor.poll(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_queue_executor_runs_posts_from_other_threads() {
        let executor = QueueExecutor::new();
        let remote = executor.clone();
        let runner_thread = std::thread::current().id();
        let ran_on = Arc::new(std::sync::Mutex::new(None));

        let sink = Arc::clone(&ran_on);
        std::thread::spawn(move || {
            remote.post(Box::new(move || {
                *sink.lock().unwrap() = Some(std::thread::current().id());
            }));
        })
        .join()
        .unwrap();

        assert!(executor.run_one(Duration::from_secs(1)));
        assert_eq!(*ran_on.lock().unwrap(), Some(runner_thread));
    }

    #[test]
    fn test_run_one_times_out_when_idle() {
        let executor = QueueExecutor::new();
        assert!(!executor.run_one(Duration::from_millis(10)));
    }

    #[test]
    fn test_run_one_wakes_on_post() {
        let executor = QueueExecutor::new();
        let remote = executor.clone();

        let poster = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            remote.post(Box::new(|| {}));
        });

        let started = Instant::now();
        assert!(executor.run_one(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(5));
        poster.join().unwrap();
        assert_eq!(executor.pending(), 0);
    }

    #[test]
    fn test_executor_identity() {
        let a = QueueExecutor::new();
        let b = QueueExecutor::new();
        assert!(a.same_executor(&a.clone()));
        assert!(!a.same_executor(&b));
    }

    #[tokio::test]
    async fn test_tokio_executor_post() {
        let executor = TokioExecutor::current();
        let (tx, rx) = tokio::sync::oneshot::channel();
        executor.post(Box::new(move || {
            let _ = tx.send(42);
        }));
        assert_eq!(rx.await.unwrap(), 42);

        assert!(executor.same_executor(&executor.clone()));
        assert!(!executor.same_executor(&TokioExecutor::current()));
    }
}
