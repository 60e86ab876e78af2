//! Event pump
//!
//! Dedicated thread that repeatedly calls the backend's blocking
//! `handle_events`. It is the only context in which native transfer
//! callbacks run, and the only caller of `handle_events` for its backend.
//!
//! State and transitions:
//! - `active` (atomic) is what callers flip. `ensure_started` stores true
//!   and `stop` stores false, both with `Release`; the loop reads it with
//!   `Acquire` after every `handle_events` return.
//! - `in_flight` counts submitted transfers whose callback has not fired.
//!   The loop keeps running while it is non-zero, so a stopped pump still
//!   drains pending transfers (each bounded by its native timeout).
//! - `lifecycle` (mutex) guards the loop thread. The loop decides to exit
//!   only while holding it, and `ensure_started` inspects `running` only
//!   while holding it, so a start request either revives the live loop or
//!   spawns a new one after the old one has committed to exit. There is
//!   never more than one loop per pump.
//!
//! Happens-before: a submission increments `in_flight` before the native
//! submit and calls `ensure_started` after it; the loop that observes the
//! increment also observes the submitted transfer.

use crate::native::UsbBackend;
use common::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Default `handle_events` timeout, which is also the stop latency
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_millis(100);

/// Pause after a failing `handle_events` call
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Default)]
struct Lifecycle {
    running: bool,
    thread: Option<JoinHandle<()>>,
}

struct Shared {
    active: AtomicBool,
    in_flight: AtomicUsize,
    lifecycle: Mutex<Lifecycle>,
    #[cfg(test)]
    failed_spawns: AtomicUsize,
}

impl Shared {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn should_run(&self) -> bool {
        self.active.load(Ordering::Acquire) || self.in_flight.load(Ordering::Acquire) > 0
    }
}

/// Background loop driving native completions for one backend
pub struct EventPump<B: UsbBackend> {
    backend: Arc<B>,
    shared: Arc<Shared>,
    timeout: Duration,
}

impl<B: UsbBackend> EventPump<B> {
    pub fn new(backend: Arc<B>, timeout: Duration) -> Self {
        Self {
            backend,
            shared: Arc::new(Shared {
                active: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                lifecycle: Mutex::new(Lifecycle::default()),
                #[cfg(test)]
                failed_spawns: AtomicUsize::new(0),
            }),
            timeout,
        }
    }

    /// Start the loop unless it is already running
    ///
    /// Returns true if a new loop thread was spawned. A failed spawn leaves
    /// the pump stopped with its tracked transfers still counted, and the
    /// next call spawns again.
    pub fn ensure_started(&self) -> Result<bool, ErrorKind> {
        let mut lifecycle = self.shared.lifecycle();
        self.shared.active.store(true, Ordering::Release);

        if lifecycle.running {
            return Ok(false);
        }

        // The previous loop committed to exit under this lock; reap it
        if let Some(old) = lifecycle.thread.take() {
            if old.join().is_err() {
                warn!("Previous event pump thread panicked");
            }
        }

        let thread = self.spawn_loop().map_err(|e| {
            error!("Failed to spawn event pump thread: {}", e);
            self.shared.active.store(false, Ordering::Release);
            ErrorKind::NoMem
        })?;

        lifecycle.running = true;
        lifecycle.thread = Some(thread);
        info!("Event pump started");
        Ok(true)
    }

    fn spawn_loop(&self) -> std::io::Result<JoinHandle<()>> {
        #[cfg(test)]
        if self
            .shared
            .failed_spawns
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(std::io::Error::from(std::io::ErrorKind::OutOfMemory));
        }

        let backend = Arc::clone(&self.backend);
        let shared = Arc::clone(&self.shared);
        let timeout = self.timeout;
        std::thread::Builder::new()
            .name("usb-event-pump".to_string())
            .spawn(move || run(backend, shared, timeout))
    }

    /// Make the next `count` thread spawns fail
    #[cfg(test)]
    pub(crate) fn fail_spawns(&self, count: usize) {
        self.shared.failed_spawns.store(count, Ordering::Release);
    }

    /// Ask the loop to stop
    ///
    /// The loop exits after its current `handle_events` call returns and
    /// every tracked transfer has completed.
    pub fn stop(&self) {
        if self.shared.active.swap(false, Ordering::AcqRel) {
            debug!("Event pump stop requested");
        }
    }

    /// Stop and wait for the loop thread to exit
    pub fn shutdown(&self) {
        self.stop();
        let thread = self.shared.lifecycle().thread.take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                warn!("Event pump thread panicked");
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    /// True while a loop thread is alive
    pub fn is_running(&self) -> bool {
        self.shared.lifecycle().running
    }

    /// Transfers submitted but not yet completed
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Count one transfer as pending until the guard is dropped
    pub(crate) fn track(&self) -> InFlight {
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlight {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<B: UsbBackend> Drop for EventPump<B> {
    fn drop(&mut self) {
        // Don't join: the last handle may be dropped from a completion
        self.stop();
    }
}

/// Pending-transfer marker held by a transfer's completion
pub(crate) struct InFlight {
    shared: Arc<Shared>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

fn run<B: UsbBackend>(backend: Arc<B>, shared: Arc<Shared>, timeout: Duration) {
    debug!("Event pump loop running, timeout {:?}", timeout);

    loop {
        if !shared.should_run() {
            let mut lifecycle = shared.lifecycle();
            // Re-check under the lock; a concurrent start may have revived us
            if !shared.should_run() {
                lifecycle.running = false;
                break;
            }
        }

        match backend.handle_events(timeout) {
            Ok(()) => {}
            Err(ErrorKind::Interrupted) => {
                trace!("USB event handling interrupted");
            }
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                std::thread::sleep(ERROR_BACKOFF);
            }
        }
    }

    info!("Event pump stopped");
}
