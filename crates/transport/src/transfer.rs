//! Asynchronous transfers
//!
//! A transfer operation moves through `Submitted -> Pending -> Completed`,
//! or ends in `SubmitFailed` straight after submission:
//!
//! - Submitted: the buffer and the completion are packed into a
//!   [`PendingTransfer`] and handed to the native layer.
//! - Pending: the native layer owns the transfer. The only way back is
//!   the native callback, which runs on the event pump thread.
//! - Completed / SubmitFailed: the handler is posted to the device's
//!   executor with the result and the buffer.
//!
//! Ownership of the buffer travels with the operation and comes back
//! through the handler, so it cannot be freed or moved while pending.

use crate::device::UsbDevice;
use crate::executor::Executor;
use crate::native::{PendingTransfer, UsbBackend};
use crate::pump::InFlight;
use common::ErrorKind;
use tokio::sync::oneshot;
use tracing::{debug, error, trace};

/// Result delivered to a transfer handler: bytes transferred or the error
pub type TransferResult = Result<usize, ErrorKind>;

/// Direction of a transfer relative to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

/// In-flight transfer operation
///
/// Consumed by [`complete`](TransferOp::complete), so its handler can only
/// be scheduled once.
struct TransferOp<E, F> {
    executor: E,
    handler: F,
    direction: Direction,
    in_flight: Option<InFlight>,
}

impl<E, F> TransferOp<E, F>
where
    E: Executor,
    F: FnOnce(TransferResult, Vec<u8>) + Send + 'static,
{
    fn complete(self, result: TransferResult, buffer: Vec<u8>) {
        // Take the handler out so the operation is gone before it runs
        let TransferOp {
            executor,
            handler,
            direction,
            in_flight,
        } = self;

        trace!("{:?} transfer finished: {:?}", direction, result);
        executor.post(Box::new(move || handler(result, buffer)));

        // Only now may a stopped pump exit
        drop(in_flight);
    }
}

impl<B: UsbBackend, E: Executor> UsbDevice<B, E> {
    /// Start an asynchronous write to the configured endpoint
    ///
    /// `handler` receives the byte count or error, and the buffer back. It
    /// always runs through the device's executor, never inside this call.
    ///
    /// If the event pump thread cannot be spawned, the transfer stays
    /// pending and its handler runs once a later transfer on this device
    /// starts the pump.
    pub fn async_send<F>(&self, buffer: Vec<u8>, handler: F)
    where
        F: FnOnce(TransferResult, Vec<u8>) + Send + 'static,
    {
        self.start_transfer(Direction::Out, buffer, handler);
    }

    /// Start an asynchronous read from the configured endpoint
    ///
    /// The received bytes are at the front of the returned buffer.
    pub fn async_receive<F>(&self, buffer: Vec<u8>, handler: F)
    where
        F: FnOnce(TransferResult, Vec<u8>) + Send + 'static,
    {
        self.start_transfer(Direction::In, buffer, handler);
    }

    /// Write `buffer` and wait for the completion
    pub async fn send_owned(&self, buffer: Vec<u8>) -> (TransferResult, Vec<u8>) {
        let (tx, rx) = oneshot::channel();
        self.async_send(buffer, move |result, buffer| {
            let _ = tx.send((result, buffer));
        });
        rx.await
            .unwrap_or_else(|_| (Err(ErrorKind::Aborted), Vec::new()))
    }

    /// Read into `buffer` and wait for the completion
    pub async fn receive_owned(&self, buffer: Vec<u8>) -> (TransferResult, Vec<u8>) {
        let (tx, rx) = oneshot::channel();
        self.async_receive(buffer, move |result, buffer| {
            let _ = tx.send((result, buffer));
        });
        rx.await
            .unwrap_or_else(|_| (Err(ErrorKind::Aborted), Vec::new()))
    }

    fn start_transfer<F>(&self, direction: Direction, buffer: Vec<u8>, handler: F)
    where
        F: FnOnce(TransferResult, Vec<u8>) + Send + 'static,
    {
        let op = TransferOp {
            executor: self.inner.executor.clone(),
            handler,
            direction,
            in_flight: None,
        };

        // Held across submit so close() cannot interleave with it
        let state = self.inner.state();
        let Some(session) = state.session.clone() else {
            debug!("{:?} transfer on closed device", direction);
            op.complete(Err(ErrorKind::BadDescriptor), buffer);
            return;
        };

        let endpoint = match direction {
            Direction::Out => state.options.endpoint_address.out_address(),
            Direction::In => state.options.endpoint_address.in_address(),
        };

        let op = TransferOp {
            in_flight: Some(self.inner.pump.track()),
            ..op
        };
        let transfer = PendingTransfer::new(
            endpoint,
            buffer,
            self.inner.settings.async_timeout,
            Box::new(move |result, buffer| op.complete(result, buffer)),
        );

        match self.inner.backend.submit(&session, transfer) {
            Ok(()) => {
                trace!("{:?} transfer pending on {:#04x}", direction, endpoint);
                // Still under the state lock, so a concurrent close() stops
                // the pump after this start and never before it
                if let Err(e) = self.inner.pump.ensure_started() {
                    error!("Transfer on {:#04x} pending without event pump: {}", endpoint, e);
                }
                drop(state);
            }
            Err((e, transfer)) => {
                drop(state);
                debug!("Submit on {:#04x} failed: {}", endpoint, e);
                transfer.fail(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::QueueExecutor;
    use crate::native::MockBackend;
    use crate::native::mock::{MockDevice, SubmitOutcome};
    use common::{DeviceIds, EndpointAddress};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const IDS: DeviceIds = DeviceIds::new(0xdead, 0xbeef);

    type Outcome = Arc<Mutex<Vec<(TransferResult, Vec<u8>)>>>;

    fn open_device(backend: &Arc<MockBackend>) -> UsbDevice<MockBackend, QueueExecutor> {
        let device = UsbDevice::new(Arc::clone(backend), QueueExecutor::new());
        device.assign(MockDevice::new(IDS)).unwrap();
        device
    }

    fn recorder() -> (Outcome, impl FnOnce(TransferResult, Vec<u8>) + Send + 'static) {
        let outcome: Outcome = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&outcome);
        (outcome, move |result, buffer| {
            sink.lock().unwrap().push((result, buffer));
        })
    }

    #[test]
    fn test_closed_device_completes_with_bad_descriptor() {
        let backend = Arc::new(MockBackend::new());
        let device = UsbDevice::new(Arc::clone(&backend), QueueExecutor::new());
        let (outcome, handler) = recorder();

        device.async_send(vec![1, 2], handler);
        assert!(outcome.lock().unwrap().is_empty());

        assert!(device.executor().run_one(Duration::from_secs(1)));
        let outcome = outcome.lock().unwrap();
        assert_eq!(outcome[0], (Err(ErrorKind::BadDescriptor), vec![1, 2]));
        assert!(!device.event_pump().is_running());
    }

    #[test]
    fn test_send_uses_out_endpoint() {
        let backend = Arc::new(MockBackend::new());
        let device = open_device(&backend);
        device.set_option(EndpointAddress(0x02)).unwrap();
        let (outcome, handler) = recorder();

        device.async_send(vec![9; 3], handler);
        assert!(device.executor().run_one(Duration::from_secs(5)));

        assert_eq!(outcome.lock().unwrap()[0].0, Ok(3));
        assert_eq!(backend.submitted_endpoints(), vec![0x02]);
    }

    #[test]
    fn test_receive_sets_direction_bit() {
        let backend = Arc::new(MockBackend::new());
        let device = open_device(&backend);
        device.set_option(EndpointAddress(0x02)).unwrap();
        backend.set_read_data(vec![1, 2, 3, 4]);
        backend.push_submit(SubmitOutcome::Complete {
            status: crate::native::TransferStatus::Completed,
            actual_length: Some(4),
        });
        let (outcome, handler) = recorder();

        device.async_receive(vec![0; 16], handler);
        assert!(device.executor().run_one(Duration::from_secs(5)));

        let outcome = outcome.lock().unwrap();
        assert_eq!(outcome[0].0, Ok(4));
        assert_eq!(&outcome[0].1[..4], &[1, 2, 3, 4]);
        assert_eq!(outcome[0].1.len(), 16);
        assert_eq!(backend.submitted_endpoints(), vec![0x82]);
    }

    #[test]
    fn test_transfer_pending_until_pump_spawns() {
        let backend = Arc::new(MockBackend::new());
        let device = open_device(&backend);
        device.event_pump().fail_spawns(1);
        let (first, handler) = recorder();

        device.async_send(vec![1], handler);
        assert!(!device.event_pump().is_running());
        assert_eq!(device.event_pump().in_flight(), 1);
        assert!(!device.executor().run_one(Duration::from_millis(30)));
        assert!(first.lock().unwrap().is_empty());

        let (second, handler) = recorder();
        device.async_send(vec![2, 2], handler);
        assert!(device.executor().run_one(Duration::from_secs(5)));
        assert!(device.executor().run_one(Duration::from_secs(5)));

        assert_eq!(first.lock().unwrap()[0], (Ok(1), vec![1]));
        assert_eq!(second.lock().unwrap()[0], (Ok(2), vec![2, 2]));
        assert_eq!(device.event_pump().in_flight(), 0);
    }

    #[test]
    fn test_in_flight_released_after_completion() {
        let backend = Arc::new(MockBackend::new());
        let device = open_device(&backend);
        let (_outcome, handler) = recorder();

        device.async_send(vec![0], handler);
        assert!(device.executor().run_one(Duration::from_secs(5)));
        assert_eq!(device.event_pump().in_flight(), 0);
    }
}
