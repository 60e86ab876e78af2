//! Accept operation
//!
//! Waits for a device with a given vendor/product id to appear and opens
//! it into a caller-supplied [`UsbDevice`]. Scanning runs on a dedicated
//! `usb-accept` thread:
//!
//! - Scanning: take a fresh device-list snapshot and look for a match. No
//!   match means sleep for the rescan interval and scan again; there is no
//!   retry limit.
//! - Found: assign the matching device into the target, which opens it and
//!   claims the configured interface.
//! - Failed: any enumeration error ends the accept with that error and
//!   leaves the target closed.
//!
//! The handler is posted to the acceptor's executor exactly once, after
//! the terminal state is reached.

use crate::config::TransportConfig;
use crate::device::UsbDevice;
use crate::executor::Executor;
use crate::native::UsbBackend;
use common::{DeviceIds, ErrorKind};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

/// Default pause between unmatched scan rounds
pub const DEFAULT_RESCAN_INTERVAL: Duration = Duration::from_millis(100);

/// Result delivered to an accept handler
pub type AcceptResult = Result<(), ErrorKind>;

/// Find the first device in a fresh snapshot matching `ids`
///
/// Devices other than the match are released when the snapshot is dropped.
/// A descriptor that cannot be read fails the whole scan.
pub(crate) fn find_device<B: UsbBackend>(
    backend: &B,
    ids: DeviceIds,
) -> Result<Option<B::Device>, ErrorKind> {
    let devices = backend.devices()?;
    trace!("Scanning {} devices for {}", devices.len(), ids);

    for device in devices {
        let found = backend.device_ids(&device)?;
        if ids.matches(&found) {
            return Ok(Some(device));
        }
    }
    Ok(None)
}

/// Issues accept operations and delivers their completions
pub struct Acceptor<E: Executor> {
    executor: E,
    rescan_interval: Duration,
    /// Bumped by every cancel; an accept started in an older generation
    /// stops at its next round
    generation: Arc<AtomicU64>,
}

impl<E: Executor> Acceptor<E> {
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            rescan_interval: DEFAULT_RESCAN_INTERVAL,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_config(executor: E, config: &TransportConfig) -> Self {
        Self::new(executor).with_rescan_interval(config.accept.rescan_interval())
    }

    pub fn with_rescan_interval(mut self, interval: Duration) -> Self {
        self.rescan_interval = interval;
        self
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn rescan_interval(&self) -> Duration {
        self.rescan_interval
    }

    /// Abort every accept issued so far
    ///
    /// Observed between scan rounds; a scan already in progress finishes
    /// first. Cancelled accepts complete with `Aborted`.
    pub fn cancel(&self) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("Accept cancelled (generation {})", generation);
    }

    /// Wait for a matching device and open it into `target`
    ///
    /// `handler` always runs through this acceptor's executor, never inside
    /// this call.
    pub fn async_accept<B, DE, F>(
        &self,
        target: &UsbDevice<B, DE>,
        vendor_id: u16,
        product_id: u16,
        handler: F,
    ) where
        B: UsbBackend,
        DE: Executor,
        F: FnOnce(AcceptResult) + Send + 'static,
    {
        let ids = DeviceIds::new(vendor_id, product_id);

        if target.is_open() {
            debug!("Accept for {} into an open device", ids);
            self.executor
                .post(Box::new(move || handler(Err(ErrorKind::AlreadyOpen))));
            return;
        }

        let op = AcceptOp {
            target: target.clone(),
            ids,
            rescan_interval: self.rescan_interval,
            generation: Arc::clone(&self.generation),
            started_in: self.generation.load(Ordering::Acquire),
        };
        let executor = self.executor.clone();

        // Shared with the thread so a failed spawn can still complete it
        let slot = Arc::new(Mutex::new(Some(handler)));
        let thread_slot = Arc::clone(&slot);
        let spawned = std::thread::Builder::new()
            .name("usb-accept".to_string())
            .spawn(move || {
                let result = op.run();
                if let Some(handler) = take_handler(&thread_slot) {
                    executor.post(Box::new(move || handler(result)));
                }
            });

        if let Err(e) = spawned {
            error!("Failed to spawn accept thread: {}", e);
            if let Some(handler) = take_handler(&slot) {
                self.executor
                    .post(Box::new(move || handler(Err(ErrorKind::NoMem))));
            }
        }
    }

    /// Future form of [`async_accept`](Acceptor::async_accept)
    pub async fn accept<B, DE>(
        &self,
        target: &UsbDevice<B, DE>,
        vendor_id: u16,
        product_id: u16,
    ) -> AcceptResult
    where
        B: UsbBackend,
        DE: Executor,
    {
        let (tx, rx) = oneshot::channel();
        self.async_accept(target, vendor_id, product_id, move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap_or(Err(ErrorKind::Aborted))
    }
}

fn take_handler<F>(slot: &Mutex<Option<F>>) -> Option<F> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

/// State owned by the scanning thread
struct AcceptOp<B: UsbBackend, E: Executor> {
    target: UsbDevice<B, E>,
    ids: DeviceIds,
    rescan_interval: Duration,
    generation: Arc<AtomicU64>,
    started_in: u64,
}

impl<B: UsbBackend, E: Executor> AcceptOp<B, E> {
    fn cancelled(&self) -> bool {
        self.generation.load(Ordering::Acquire) != self.started_in
    }

    fn run(self) -> AcceptResult {
        info!("Waiting for device {}", self.ids);
        let backend = Arc::clone(self.target.backend());
        let mut round = 0u64;

        loop {
            if self.cancelled() {
                info!("Accept for {} aborted after {} rounds", self.ids, round);
                return Err(ErrorKind::Aborted);
            }

            round += 1;
            match find_device(&*backend, self.ids) {
                Ok(Some(device)) => {
                    debug!("Found {} on round {}", self.ids, round);
                    // A failed assign drops the device reference
                    return self
                        .target
                        .assign(device)
                        .inspect(|_| info!("Accepted device {}", self.ids))
                        .inspect_err(|e| warn!("Failed to open {}: {}", self.ids, e));
                }
                Ok(None) => {
                    trace!("No {} on round {}", self.ids, round);
                    std::thread::sleep(self.rescan_interval);
                }
                Err(e) => {
                    warn!("Device enumeration failed on round {}: {}", round, e);
                    return Err(e);
                }
            }
        }
    }
}
