//! Native USB subsystem
//!
//! The transport never talks to libusb directly. Everything it needs from
//! the native layer is expressed by [`UsbBackend`]: a blocking enumeration
//! scan, open/claim/release/close, blocking bulk transfers, a non-blocking
//! submit and the blocking "process pending events" call in which submit
//! completions are delivered.
//!
//! Two implementations are provided: [`LibusbBackend`] over `rusb`, and
//! [`MockBackend`], a scripted in-memory subsystem used by the tests.

pub mod libusb;
pub mod mock;

pub use libusb::LibusbBackend;
pub use mock::MockBackend;

use common::{DeviceIds, ErrorKind};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Final status of a native transfer, as reported to its callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

impl TransferStatus {
    /// Map a raw `libusb_transfer_status`
    pub fn from_raw(status: i32) -> Self {
        match status {
            0 => TransferStatus::Completed,
            2 => TransferStatus::TimedOut,
            3 => TransferStatus::Cancelled,
            4 => TransferStatus::Stall,
            5 => TransferStatus::NoDevice,
            6 => TransferStatus::Overflow,
            _ => TransferStatus::Error,
        }
    }

    /// Error carried by this status; `None` only for `Completed`
    pub fn error(&self) -> Option<ErrorKind> {
        match self {
            TransferStatus::Completed => None,
            TransferStatus::Error => Some(ErrorKind::Io),
            TransferStatus::TimedOut => Some(ErrorKind::Timeout),
            TransferStatus::Cancelled => Some(ErrorKind::Aborted),
            TransferStatus::Stall => Some(ErrorKind::Pipe),
            TransferStatus::NoDevice => Some(ErrorKind::NoDevice),
            TransferStatus::Overflow => Some(ErrorKind::Overflow),
        }
    }
}

/// Continuation invoked once with the translated result and the buffer
pub(crate) type CompletionFn = Box<dyn FnOnce(Result<usize, ErrorKind>, Vec<u8>) + Send>;

/// A transfer in native custody
///
/// Owns the buffer for as long as the transfer is pending, so the memory
/// handed to the native layer stays valid and unmoved. Completing consumes
/// the value; there is no way to complete it twice.
pub struct PendingTransfer {
    endpoint: u8,
    buffer: Vec<u8>,
    timeout: Duration,
    on_complete: CompletionFn,
}

impl PendingTransfer {
    pub(crate) fn new(
        endpoint: u8,
        buffer: Vec<u8>,
        timeout: Duration,
        on_complete: CompletionFn,
    ) -> Self {
        Self {
            endpoint,
            buffer,
            timeout,
            on_complete,
        }
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Deliver the native result
    ///
    /// Any status other than `Completed` becomes the translated error;
    /// `actual_length` is clamped to the buffer length.
    pub fn complete(self, status: TransferStatus, actual_length: usize) {
        let result = match status.error() {
            None => Ok(actual_length.min(self.buffer.len())),
            Some(error) => Err(error),
        };
        (self.on_complete)(result, self.buffer);
    }

    /// Complete without a native result, e.g. after a failed submit
    pub fn fail(self, error: ErrorKind) {
        (self.on_complete)(Err(error), self.buffer);
    }
}

impl fmt::Debug for PendingTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTransfer")
            .field("endpoint", &format_args!("{:#04x}", self.endpoint))
            .field("len", &self.buffer.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Result of a failed submit: the error and the transfer handed back
pub type SubmitError = (ErrorKind, PendingTransfer);

/// Capability the transport consumes from the native USB subsystem
///
/// One backend value is one native session. Every call except
/// [`submit`](UsbBackend::submit) may block.
pub trait UsbBackend: Send + Sync + 'static {
    /// Retained reference to an enumerated device
    type Device: Send + 'static;
    /// Open session on one device
    type Handle: Send + Sync + 'static;

    /// Take a fresh device-list snapshot
    ///
    /// Devices not kept by the caller are released when dropped.
    fn devices(&self) -> Result<Vec<Self::Device>, ErrorKind>;

    /// Read the vendor/product ids of a device
    fn device_ids(&self, device: &Self::Device) -> Result<DeviceIds, ErrorKind>;

    fn open(&self, device: &Self::Device) -> Result<Self::Handle, ErrorKind>;

    fn claim_interface(&self, handle: &Self::Handle, interface: u8) -> Result<(), ErrorKind>;

    fn release_interface(&self, handle: &Self::Handle, interface: u8) -> Result<(), ErrorKind>;

    /// Close a session; the native handle is released once no pending
    /// transfer references it any more
    fn close(&self, handle: Arc<Self::Handle>);

    /// Blocking host-to-device bulk transfer
    fn write_bulk(
        &self,
        handle: &Self::Handle,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, ErrorKind>;

    /// Blocking device-to-host bulk transfer
    fn read_bulk(
        &self,
        handle: &Self::Handle,
        endpoint: u8,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, ErrorKind>;

    /// Submit a transfer without waiting for it
    ///
    /// On success the transfer is completed later, from inside
    /// [`handle_events`](UsbBackend::handle_events). On failure it is
    /// handed back untouched.
    fn submit(&self, handle: &Arc<Self::Handle>, transfer: PendingTransfer)
    -> Result<(), SubmitError>;

    /// Block for up to `timeout` processing native events
    fn handle_events(&self, timeout: Duration) -> Result<(), ErrorKind>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_transfer_status_from_raw() {
        assert_eq!(TransferStatus::from_raw(0), TransferStatus::Completed);
        assert_eq!(TransferStatus::from_raw(1), TransferStatus::Error);
        assert_eq!(TransferStatus::from_raw(2), TransferStatus::TimedOut);
        assert_eq!(TransferStatus::from_raw(4), TransferStatus::Stall);
        assert_eq!(TransferStatus::from_raw(77), TransferStatus::Error);
    }

    #[test]
    fn test_only_completed_is_success() {
        assert_eq!(TransferStatus::Completed.error(), None);
        assert_eq!(TransferStatus::Error.error(), Some(ErrorKind::Io));
        assert_eq!(TransferStatus::TimedOut.error(), Some(ErrorKind::Timeout));
        assert_eq!(TransferStatus::Stall.error(), Some(ErrorKind::Pipe));
        assert_eq!(TransferStatus::NoDevice.error(), Some(ErrorKind::NoDevice));
        assert_eq!(TransferStatus::Overflow.error(), Some(ErrorKind::Overflow));
    }

    #[test]
    fn test_pending_transfer_clamps_actual_length() {
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let transfer = PendingTransfer::new(
            0x81,
            vec![0u8; 4],
            Duration::from_millis(10),
            Box::new(move |result, buf| {
                *sink.lock().unwrap() = Some((result, buf.len()));
            }),
        );

        assert_eq!(transfer.endpoint(), 0x81);
        assert_eq!(transfer.len(), 4);
        transfer.complete(TransferStatus::Completed, 64);

        assert_eq!(*seen.lock().unwrap(), Some((Ok(4), 4)));
    }

    #[test]
    fn test_pending_transfer_status_becomes_error() {
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let transfer = PendingTransfer::new(
            0x01,
            vec![0u8; 4],
            Duration::from_millis(10),
            Box::new(move |result, _buf| {
                *sink.lock().unwrap() = Some(result);
            }),
        );

        transfer.complete(TransferStatus::Stall, 2);
        assert_eq!(*seen.lock().unwrap(), Some(Err(ErrorKind::Pipe)));
    }
}
