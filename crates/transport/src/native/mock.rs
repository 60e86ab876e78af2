//! Scripted in-memory backend
//!
//! Provides a native subsystem with no hardware behind it, for tests and
//! for exercising the transport on machines without USB access.
//!
//! # Example
//!
//! ```
//! use common::DeviceIds;
//! use usb_transport::native::{MockBackend, UsbBackend};
//! use usb_transport::native::mock::MockDevice;
//!
//! let backend = MockBackend::new();
//! backend.push_scan(Ok(vec![]));
//! backend.set_devices(vec![MockDevice::new(DeviceIds::new(0xdead, 0xbeef))]);
//!
//! assert!(backend.devices().unwrap().is_empty());
//! assert_eq!(backend.devices().unwrap().len(), 1);
//! assert_eq!(backend.scan_count(), 2);
//! ```

use super::{PendingTransfer, SubmitError, TransferStatus, UsbBackend};
use common::usb_types::ENDPOINT_DIR_IN;
use common::{DeviceIds, ErrorKind};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;

/// Longest time an idle `handle_events` call sleeps
const IDLE_WAIT: Duration = Duration::from_millis(5);

/// Enumerated mock device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockDevice {
    pub ids: DeviceIds,
    /// Descriptor read fails with this error when set
    pub descriptor_error: Option<ErrorKind>,
}

impl MockDevice {
    pub fn new(ids: DeviceIds) -> Self {
        Self {
            ids,
            descriptor_error: None,
        }
    }

    pub fn with_descriptor_error(ids: DeviceIds, error: ErrorKind) -> Self {
        Self {
            ids,
            descriptor_error: Some(error),
        }
    }
}

/// Open mock session
#[derive(Debug)]
pub struct MockHandle {
    pub id: u64,
    pub ids: DeviceIds,
}

/// What the next submit does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Submit fails synchronously
    Fail(ErrorKind),
    /// Submit succeeds; the callback later reports `status` and
    /// `actual_length` bytes (`None` = the whole buffer)
    Complete {
        status: TransferStatus,
        actual_length: Option<usize>,
    },
}

impl SubmitOutcome {
    pub const fn completed() -> Self {
        SubmitOutcome::Complete {
            status: TransferStatus::Completed,
            actual_length: None,
        }
    }
}

/// Native call recorded by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Open(DeviceIds),
    Claim(u8),
    Release(u8),
    Close(u64),
    WriteBulk { endpoint: u8, len: usize },
    ReadBulk { endpoint: u8, len: usize },
    Submit { endpoint: u8, len: usize },
}

#[derive(Default)]
struct MockState {
    scans: VecDeque<Result<Vec<MockDevice>, ErrorKind>>,
    devices: Vec<MockDevice>,
    scan_count: usize,
    open_error: Option<ErrorKind>,
    claim_errors: HashMap<u8, ErrorKind>,
    release_errors: HashMap<u8, ErrorKind>,
    claimed: Vec<u8>,
    calls: Vec<MockCall>,
    submits: VecDeque<SubmitOutcome>,
    sync_results: VecDeque<Result<usize, ErrorKind>>,
    pending: VecDeque<(PendingTransfer, TransferStatus, Option<usize>)>,
    hold: bool,
    read_data: Vec<u8>,
    event_threads: HashSet<ThreadId>,
}

/// Scripted native subsystem
#[derive(Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
    next_handle: AtomicU64,
    in_handle_events: AtomicUsize,
    max_in_handle_events: AtomicUsize,
    event_calls: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------
    // Scripting
    // ------------------------------------------------------------------

    /// Queue the result of one future scan
    pub fn push_scan(&self, scan: Result<Vec<MockDevice>, ErrorKind>) {
        self.state().scans.push_back(scan);
    }

    /// Devices returned once the queued scans are used up
    pub fn set_devices(&self, devices: Vec<MockDevice>) {
        self.state().devices = devices;
    }

    pub fn fail_open(&self, error: Option<ErrorKind>) {
        self.state().open_error = error;
    }

    pub fn fail_claim(&self, interface: u8, error: ErrorKind) {
        self.state().claim_errors.insert(interface, error);
    }

    pub fn fail_release(&self, interface: u8, error: ErrorKind) {
        self.state().release_errors.insert(interface, error);
    }

    /// Queue the outcome of one future submit
    ///
    /// Submits with nothing queued complete successfully with the whole
    /// buffer.
    pub fn push_submit(&self, outcome: SubmitOutcome) {
        self.state().submits.push_back(outcome);
    }

    /// Queue the result of one future blocking transfer
    pub fn push_sync_result(&self, result: Result<usize, ErrorKind>) {
        self.state().sync_results.push_back(result);
    }

    /// Bytes copied into IN buffers on completion
    pub fn set_read_data(&self, data: Vec<u8>) {
        self.state().read_data = data;
    }

    /// While held, `handle_events` leaves submitted transfers pending
    pub fn hold_completions(&self, hold: bool) {
        self.state().hold = hold;
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn scan_count(&self) -> usize {
        self.state().scan_count
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    pub fn claimed_interfaces(&self) -> Vec<u8> {
        self.state().claimed.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    /// Endpoints of every submitted transfer, in order
    pub fn submitted_endpoints(&self) -> Vec<u8> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                MockCall::Submit { endpoint, .. } => Some(*endpoint),
                _ => None,
            })
            .collect()
    }

    pub fn event_calls(&self) -> usize {
        self.event_calls.load(Ordering::SeqCst)
    }

    /// Highest number of threads seen inside `handle_events` at once
    pub fn max_concurrent_event_handlers(&self) -> usize {
        self.max_in_handle_events.load(Ordering::SeqCst)
    }

    /// Distinct threads that have called `handle_events`
    pub fn event_thread_count(&self) -> usize {
        self.state().event_threads.len()
    }

    fn next_sync_result(&self, len: usize) -> Result<usize, ErrorKind> {
        self.state().sync_results.pop_front().unwrap_or(Ok(len))
    }
}

impl UsbBackend for MockBackend {
    type Device = MockDevice;
    type Handle = MockHandle;

    fn devices(&self) -> Result<Vec<Self::Device>, ErrorKind> {
        let mut state = self.state();
        state.scan_count += 1;
        match state.scans.pop_front() {
            Some(scan) => scan,
            None => Ok(state.devices.clone()),
        }
    }

    fn device_ids(&self, device: &Self::Device) -> Result<DeviceIds, ErrorKind> {
        match device.descriptor_error {
            Some(error) => Err(error),
            None => Ok(device.ids),
        }
    }

    fn open(&self, device: &Self::Device) -> Result<Self::Handle, ErrorKind> {
        let mut state = self.state();
        state.calls.push(MockCall::Open(device.ids));
        if let Some(error) = state.open_error {
            return Err(error);
        }
        Ok(MockHandle {
            id: self.next_handle.fetch_add(1, Ordering::SeqCst) + 1,
            ids: device.ids,
        })
    }

    fn claim_interface(&self, _handle: &Self::Handle, interface: u8) -> Result<(), ErrorKind> {
        let mut state = self.state();
        state.calls.push(MockCall::Claim(interface));
        if let Some(error) = state.claim_errors.get(&interface) {
            return Err(*error);
        }
        if state.claimed.contains(&interface) {
            return Err(ErrorKind::Busy);
        }
        state.claimed.push(interface);
        Ok(())
    }

    fn release_interface(&self, _handle: &Self::Handle, interface: u8) -> Result<(), ErrorKind> {
        let mut state = self.state();
        state.calls.push(MockCall::Release(interface));
        if let Some(error) = state.release_errors.get(&interface) {
            return Err(*error);
        }
        let before = state.claimed.len();
        state.claimed.retain(|claimed| *claimed != interface);
        if state.claimed.len() == before {
            return Err(ErrorKind::NotFound);
        }
        Ok(())
    }

    fn close(&self, handle: Arc<Self::Handle>) {
        self.state().calls.push(MockCall::Close(handle.id));
    }

    fn write_bulk(
        &self,
        _handle: &Self::Handle,
        endpoint: u8,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, ErrorKind> {
        self.state().calls.push(MockCall::WriteBulk {
            endpoint,
            len: data.len(),
        });
        self.next_sync_result(data.len())
    }

    fn read_bulk(
        &self,
        _handle: &Self::Handle,
        endpoint: u8,
        buffer: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, ErrorKind> {
        self.state().calls.push(MockCall::ReadBulk {
            endpoint,
            len: buffer.len(),
        });
        let n = self.next_sync_result(buffer.len())?.min(buffer.len());
        let state = self.state();
        let copy = n.min(state.read_data.len());
        buffer[..copy].copy_from_slice(&state.read_data[..copy]);
        Ok(n)
    }

    fn submit(
        &self,
        _handle: &Arc<Self::Handle>,
        transfer: PendingTransfer,
    ) -> Result<(), SubmitError> {
        let mut state = self.state();
        state.calls.push(MockCall::Submit {
            endpoint: transfer.endpoint(),
            len: transfer.len(),
        });
        match state
            .submits
            .pop_front()
            .unwrap_or(SubmitOutcome::completed())
        {
            SubmitOutcome::Fail(error) => Err((error, transfer)),
            SubmitOutcome::Complete {
                status,
                actual_length,
            } => {
                state.pending.push_back((transfer, status, actual_length));
                Ok(())
            }
        }
    }

    fn handle_events(&self, timeout: Duration) -> Result<(), ErrorKind> {
        let inside = self.in_handle_events.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_handle_events.fetch_max(inside, Ordering::SeqCst);
        self.event_calls.fetch_add(1, Ordering::SeqCst);

        let (ready, read_data) = {
            let mut state = self.state();
            state.event_threads.insert(thread::current().id());
            if state.hold {
                (Vec::new(), Vec::new())
            } else {
                (state.pending.drain(..).collect::<Vec<_>>(), state.read_data.clone())
            }
        };

        if ready.is_empty() {
            thread::sleep(timeout.min(IDLE_WAIT));
        }

        // Callbacks run outside the state lock, as libusb runs them
        for (mut transfer, status, actual_length) in ready {
            let n = actual_length.unwrap_or(transfer.len()).min(transfer.len());
            if transfer.endpoint() & ENDPOINT_DIR_IN != 0 {
                let copy = n.min(read_data.len());
                transfer.buffer_mut()[..copy].copy_from_slice(&read_data[..copy]);
            }
            transfer.complete(status, n);
        }

        self.in_handle_events.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDS: DeviceIds = DeviceIds::new(0xdead, 0xbeef);

    #[test]
    fn test_scripted_scans_then_steady_state() {
        let backend = MockBackend::new();
        backend.push_scan(Err(ErrorKind::NoMem));
        backend.set_devices(vec![MockDevice::new(IDS)]);

        assert_eq!(backend.devices(), Err(ErrorKind::NoMem));
        assert_eq!(backend.devices().unwrap(), vec![MockDevice::new(IDS)]);
        assert_eq!(backend.scan_count(), 2);
    }

    #[test]
    fn test_claim_release_tracking() {
        let backend = MockBackend::new();
        let handle = backend.open(&MockDevice::new(IDS)).unwrap();

        backend.claim_interface(&handle, 0).unwrap();
        assert_eq!(backend.claim_interface(&handle, 0), Err(ErrorKind::Busy));
        assert_eq!(backend.claimed_interfaces(), vec![0]);

        backend.release_interface(&handle, 0).unwrap();
        assert_eq!(
            backend.release_interface(&handle, 0),
            Err(ErrorKind::NotFound)
        );
    }

    #[test]
    fn test_handle_events_completes_pending() {
        let backend = MockBackend::new();
        let handle = Arc::new(backend.open(&MockDevice::new(IDS)).unwrap());
        backend.set_read_data(vec![7, 8, 9]);
        backend.push_submit(SubmitOutcome::Complete {
            status: TransferStatus::Completed,
            actual_length: Some(2),
        });

        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let transfer = PendingTransfer::new(
            0x81,
            vec![0u8; 8],
            Duration::from_millis(10),
            Box::new(move |result, buf| {
                *sink.lock().unwrap() = Some((result, buf));
            }),
        );
        backend.submit(&handle, transfer).unwrap();
        assert_eq!(backend.pending_count(), 1);

        backend.handle_events(Duration::from_millis(1)).unwrap();

        let (result, buf) = seen.lock().unwrap().take().unwrap();
        assert_eq!(result, Ok(2));
        assert_eq!(&buf[..2], &[7, 8]);
        assert_eq!(backend.max_concurrent_event_handlers(), 1);
    }

    #[test]
    fn test_failed_submit_returns_transfer() {
        let backend = MockBackend::new();
        let handle = Arc::new(backend.open(&MockDevice::new(IDS)).unwrap());
        backend.push_submit(SubmitOutcome::Fail(ErrorKind::Io));

        let transfer =
            PendingTransfer::new(0x01, vec![1], Duration::from_millis(10), Box::new(|_, _| {}));
        let (error, transfer) = backend.submit(&handle, transfer).unwrap_err();
        assert_eq!(error, ErrorKind::Io);
        assert_eq!(transfer.buffer(), &[1]);
        assert_eq!(backend.pending_count(), 0);
    }
}
