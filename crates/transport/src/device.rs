//! USB device handle
//!
//! [`UsbDevice`] owns the open/closed state of one native device: the open
//! session, the claimed interface and the endpoint used for transfers. It
//! is a cheap clonable handle; clones share the same device, which is how
//! an accept operation populates a handle the caller still holds.
//!
//! Each device owns its native session (one backend value) and the
//! [`EventPump`] that drives it.

use crate::accept::find_device;
use crate::config::TransportConfig;
use crate::executor::Executor;
use crate::native::UsbBackend;
use crate::pump::{DEFAULT_EVENT_TIMEOUT, EventPump};
use common::{DeviceIds, EndpointAddress, ErrorKind, InterfaceNumber};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for asynchronous transfers
pub const DEFAULT_ASYNC_TIMEOUT: Duration = Duration::from_secs(1);

/// Default timeout for blocking transfers
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// Current option values of a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceOptions {
    pub interface_number: InterfaceNumber,
    pub endpoint_address: EndpointAddress,
}

/// Per-device timing and initial options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSettings {
    /// `handle_events` timeout used by the event pump
    pub event_timeout: Duration,
    /// Native timeout of asynchronous transfers
    pub async_timeout: Duration,
    /// Timeout of blocking send/receive
    pub sync_timeout: Duration,
    pub options: DeviceOptions,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            event_timeout: DEFAULT_EVENT_TIMEOUT,
            async_timeout: DEFAULT_ASYNC_TIMEOUT,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            options: DeviceOptions::default(),
        }
    }
}

impl From<&TransportConfig> for DeviceSettings {
    fn from(config: &TransportConfig) -> Self {
        Self {
            event_timeout: config.pump.event_timeout(),
            async_timeout: config.transfer.async_timeout(),
            sync_timeout: config.transfer.sync_timeout(),
            options: DeviceOptions {
                interface_number: config.device.interface_number,
                endpoint_address: config.device.endpoint_address,
            },
        }
    }
}

pub(crate) struct DeviceState<B: UsbBackend> {
    pub(crate) session: Option<Arc<B::Handle>>,
    pub(crate) options: DeviceOptions,
}

pub(crate) struct DeviceInner<B: UsbBackend, E: Executor> {
    pub(crate) backend: Arc<B>,
    pub(crate) executor: E,
    pub(crate) pump: EventPump<B>,
    pub(crate) settings: DeviceSettings,
    state: Mutex<DeviceState<B>>,
}

impl<B: UsbBackend, E: Executor> DeviceInner<B, E> {
    pub(crate) fn state(&self) -> MutexGuard<'_, DeviceState<B>> {
        // No critical section panics, so a poisoned state is still coherent
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<B: UsbBackend, E: Executor> Drop for DeviceInner<B, E> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(session) = state.session.take() {
            let interface = state.options.interface_number.value();
            if let Err(e) = self.backend.release_interface(&session, interface) {
                debug!("Release of interface {} on drop failed: {}", interface, e);
            }
            self.backend.close(session);
            debug!("Closed device on drop");
        }
        self.pump.stop();
    }
}

/// Handle to one native USB device
pub struct UsbDevice<B: UsbBackend, E: Executor> {
    pub(crate) inner: Arc<DeviceInner<B, E>>,
}

impl<B: UsbBackend, E: Executor> Clone for UsbDevice<B, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: UsbBackend, E: Executor> UsbDevice<B, E> {
    /// Create a closed device whose completions are posted to `executor`
    pub fn new(backend: Arc<B>, executor: E) -> Self {
        Self::with_settings(backend, executor, DeviceSettings::default())
    }

    pub fn with_settings(backend: Arc<B>, executor: E, settings: DeviceSettings) -> Self {
        let pump = EventPump::new(Arc::clone(&backend), settings.event_timeout);
        Self {
            inner: Arc::new(DeviceInner {
                backend,
                executor,
                pump,
                settings,
                state: Mutex::new(DeviceState {
                    session: None,
                    options: settings.options,
                }),
            }),
        }
    }

    /// Open the first device in a fresh snapshot matching `ids`
    pub fn open(&self, ids: DeviceIds) -> Result<(), ErrorKind> {
        if self.is_open() {
            return Err(ErrorKind::AlreadyOpen);
        }

        match find_device(&*self.inner.backend, ids)? {
            Some(device) => self.assign(device),
            None => {
                debug!("No device matching {} in current snapshot", ids);
                Err(ErrorKind::NotFound)
            }
        }
    }

    /// Open an already enumerated native device
    ///
    /// Claims the configured interface. On failure the device reference is
    /// released and the handle stays closed.
    pub fn assign(&self, device: B::Device) -> Result<(), ErrorKind> {
        let mut state = self.inner.state();
        if state.session.is_some() {
            return Err(ErrorKind::AlreadyOpen);
        }

        let backend = &self.inner.backend;
        let handle = Arc::new(backend.open(&device)?);

        let interface = state.options.interface_number.value();
        if let Err(e) = backend.claim_interface(&handle, interface) {
            warn!("Failed to claim interface {}: {}", interface, e);
            backend.close(handle);
            return Err(e);
        }

        debug!("Claimed interface {}", interface);
        state.session = Some(handle);
        info!("Device opened");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.inner.state().session.is_some()
    }

    /// Close the device
    ///
    /// Releases the claimed interface, closes the native session and stops
    /// the event pump. Closing a closed device does nothing. Every step
    /// runs even if an earlier one fails; the first failure is returned.
    /// Transfers still pending complete normally through the pump.
    pub fn close(&self) -> Result<(), ErrorKind> {
        let mut state = self.inner.state();
        let Some(session) = state.session.take() else {
            return Ok(());
        };

        self.inner.pump.stop();

        let interface = state.options.interface_number.value();
        let result = match self.inner.backend.release_interface(&session, interface) {
            Ok(()) | Err(ErrorKind::NotFound) => Ok(()),
            Err(e) => {
                warn!("Failed to release interface {}: {}", interface, e);
                Err(e)
            }
        };

        self.inner.backend.close(session);
        info!("Device closed");
        result
    }

    /// Stop the event pump without closing the device
    ///
    /// Pending transfers are not aborted; they complete through the pump,
    /// which exits once they have. A later transfer restarts it.
    pub fn cancel(&self) {
        self.inner.pump.stop();
    }

    pub fn set_option<O: SettableOption>(&self, option: O) -> Result<(), ErrorKind> {
        option.apply(self)
    }

    pub fn get_option<O: GettableOption>(&self) -> O {
        O::from_options(&self.inner.state().options)
    }

    pub fn options(&self) -> DeviceOptions {
        self.inner.state().options
    }

    /// Blocking write to the configured endpoint
    pub fn send(&self, data: &[u8]) -> Result<usize, ErrorKind> {
        let (session, endpoint) = self.session_for_transfer()?;
        let endpoint = endpoint.out_address();
        self.inner
            .backend
            .write_bulk(&session, endpoint, data, self.inner.settings.sync_timeout)
            .inspect_err(|e| debug!("Send on {:#04x} failed: {}", endpoint, e))
    }

    /// Blocking read from the configured endpoint, direction bit set
    pub fn receive(&self, buffer: &mut [u8]) -> Result<usize, ErrorKind> {
        let (session, endpoint) = self.session_for_transfer()?;
        let endpoint = endpoint.in_address();
        self.inner
            .backend
            .read_bulk(&session, endpoint, buffer, self.inner.settings.sync_timeout)
            .inspect_err(|e| debug!("Receive on {:#04x} failed: {}", endpoint, e))
    }

    pub fn executor(&self) -> &E {
        &self.inner.executor
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.inner.backend
    }

    pub fn event_pump(&self) -> &EventPump<B> {
        &self.inner.pump
    }

    pub fn settings(&self) -> &DeviceSettings {
        &self.inner.settings
    }

    /// Native session of an open device
    ///
    /// For backend functionality this handle does not wrap. The session
    /// stays valid after `close`, but its interface is no longer claimed.
    pub fn native_handle(&self) -> Option<Arc<B::Handle>> {
        self.inner.state().session.clone()
    }

    /// Session and endpoint, without holding the state lock during I/O
    fn session_for_transfer(&self) -> Result<(Arc<B::Handle>, EndpointAddress), ErrorKind> {
        let state = self.inner.state();
        let session = state.session.clone().ok_or(ErrorKind::BadDescriptor)?;
        Ok((session, state.options.endpoint_address))
    }

    /// Switch the claimed interface: release the old claim, then claim the
    /// new one. If the new claim fails the old one is restored and the
    /// recorded number is left unchanged.
    fn set_interface(&self, interface: InterfaceNumber) -> Result<(), ErrorKind> {
        let mut state = self.inner.state();
        let Some(session) = state.session.clone() else {
            state.options.interface_number = interface;
            return Ok(());
        };

        let backend = &self.inner.backend;
        let old = state.options.interface_number.value();
        match backend.release_interface(&session, old) {
            Ok(()) | Err(ErrorKind::NotFound) => {}
            Err(e) => {
                warn!("Failed to release interface {}: {}", old, e);
                return Err(e);
            }
        }

        if let Err(e) = backend.claim_interface(&session, interface.value()) {
            warn!("Failed to claim interface {}: {}", interface.value(), e);
            if let Err(restore) = backend.claim_interface(&session, old) {
                warn!("Failed to reclaim interface {}: {}", old, restore);
            }
            return Err(e);
        }

        debug!("Switched interface {} -> {}", old, interface.value());
        state.options.interface_number = interface;
        Ok(())
    }

    fn set_endpoint(&self, endpoint: EndpointAddress) {
        self.inner.state().options.endpoint_address = endpoint;
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for common::InterfaceNumber {}
    impl Sealed for common::EndpointAddress {}
}

/// Option accepted by [`UsbDevice::set_option`]
pub trait SettableOption: sealed::Sealed + Copy {
    fn apply<B: UsbBackend, E: Executor>(self, device: &UsbDevice<B, E>) -> Result<(), ErrorKind>;
}

/// Option readable through [`UsbDevice::get_option`]
pub trait GettableOption: sealed::Sealed + Copy {
    fn from_options(options: &DeviceOptions) -> Self;
}

impl SettableOption for InterfaceNumber {
    fn apply<B: UsbBackend, E: Executor>(self, device: &UsbDevice<B, E>) -> Result<(), ErrorKind> {
        device.set_interface(self)
    }
}

impl GettableOption for InterfaceNumber {
    fn from_options(options: &DeviceOptions) -> Self {
        options.interface_number
    }
}

impl SettableOption for EndpointAddress {
    fn apply<B: UsbBackend, E: Executor>(self, device: &UsbDevice<B, E>) -> Result<(), ErrorKind> {
        device.set_endpoint(self);
        Ok(())
    }
}

impl GettableOption for EndpointAddress {
    fn from_options(options: &DeviceOptions) -> Self {
        options.endpoint_address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::QueueExecutor;
    use crate::native::MockBackend;
    use crate::native::mock::{MockCall, MockDevice};

    const IDS: DeviceIds = DeviceIds::new(0xdead, 0xbeef);

    fn device_with(backend: &Arc<MockBackend>) -> UsbDevice<MockBackend, QueueExecutor> {
        UsbDevice::new(Arc::clone(backend), QueueExecutor::new())
    }

    #[test]
    fn test_open_claims_default_interface() {
        let backend = Arc::new(MockBackend::new());
        backend.set_devices(vec![MockDevice::new(IDS)]);
        let device = device_with(&backend);

        device.open(IDS).unwrap();
        assert!(device.is_open());
        assert_eq!(backend.claimed_interfaces(), vec![0]);
        assert_eq!(device.get_option::<InterfaceNumber>(), InterfaceNumber(0));
    }

    #[test]
    fn test_open_twice_is_already_open() {
        let backend = Arc::new(MockBackend::new());
        backend.set_devices(vec![MockDevice::new(IDS)]);
        let device = device_with(&backend);

        device.open(IDS).unwrap();
        assert_eq!(device.open(IDS), Err(ErrorKind::AlreadyOpen));
        assert_eq!(
            device.assign(MockDevice::new(IDS)),
            Err(ErrorKind::AlreadyOpen)
        );
    }

    #[test]
    fn test_open_without_match_is_not_found() {
        let backend = Arc::new(MockBackend::new());
        backend.set_devices(vec![MockDevice::new(DeviceIds::new(0x1234, 0x5678))]);
        let device = device_with(&backend);

        assert_eq!(device.open(IDS), Err(ErrorKind::NotFound));
        assert!(!device.is_open());
    }

    #[test]
    fn test_failed_claim_leaves_device_closed() {
        let backend = Arc::new(MockBackend::new());
        backend.fail_claim(0, ErrorKind::Busy);
        let device = device_with(&backend);

        assert_eq!(device.assign(MockDevice::new(IDS)), Err(ErrorKind::Busy));
        assert!(!device.is_open());
        assert!(matches!(backend.calls().last(), Some(MockCall::Close(_))));
    }

    #[test]
    fn test_close_is_idempotent() {
        let backend = Arc::new(MockBackend::new());
        let device = device_with(&backend);

        device.assign(MockDevice::new(IDS)).unwrap();
        device.close().unwrap();
        device.close().unwrap();
        assert!(!device.is_open());

        let closes = backend
            .calls()
            .iter()
            .filter(|call| matches!(call, MockCall::Close(_)))
            .count();
        assert_eq!(closes, 1);
        assert!(backend.claimed_interfaces().is_empty());
    }

    #[test]
    fn test_native_handle_follows_session() {
        let backend = Arc::new(MockBackend::new());
        let device = device_with(&backend);
        assert!(device.native_handle().is_none());

        device.assign(MockDevice::new(IDS)).unwrap();
        let handle = device.native_handle().unwrap();
        assert_eq!(handle.ids, IDS);

        device.close().unwrap();
        assert!(device.native_handle().is_none());
        assert_eq!(backend.calls().last(), Some(&MockCall::Close(handle.id)));
    }

    #[test]
    fn test_close_tolerates_released_interface() {
        let backend = Arc::new(MockBackend::new());
        let device = device_with(&backend);
        device.assign(MockDevice::new(IDS)).unwrap();
        backend.fail_release(0, ErrorKind::NotFound);

        assert_eq!(device.close(), Ok(()));
    }

    #[test]
    fn test_close_reports_release_error_but_still_closes() {
        let backend = Arc::new(MockBackend::new());
        let device = device_with(&backend);
        device.assign(MockDevice::new(IDS)).unwrap();
        backend.fail_release(0, ErrorKind::NoDevice);

        assert_eq!(device.close(), Err(ErrorKind::NoDevice));
        assert!(!device.is_open());
        assert!(matches!(backend.calls().last(), Some(MockCall::Close(_))));
    }

    #[test]
    fn test_set_interface_while_closed_only_stores() {
        let backend = Arc::new(MockBackend::new());
        let device = device_with(&backend);

        device.set_option(InterfaceNumber(2)).unwrap();
        assert_eq!(device.get_option::<InterfaceNumber>(), InterfaceNumber(2));
        assert!(backend.calls().is_empty());

        device.assign(MockDevice::new(IDS)).unwrap();
        assert_eq!(backend.claimed_interfaces(), vec![2]);
    }

    #[test]
    fn test_endpoint_option_is_plain_storage() {
        let backend = Arc::new(MockBackend::new());
        let device = device_with(&backend);

        device.set_option(EndpointAddress(0x02)).unwrap();
        assert_eq!(device.get_option::<EndpointAddress>(), EndpointAddress(0x02));
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_sync_transfers_on_closed_device() {
        let backend = Arc::new(MockBackend::new());
        let device = device_with(&backend);

        assert_eq!(device.send(&[1, 2, 3]), Err(ErrorKind::BadDescriptor));
        let mut buf = [0u8; 4];
        assert_eq!(device.receive(&mut buf), Err(ErrorKind::BadDescriptor));
    }

    #[test]
    fn test_sync_transfer_endpoints() {
        let backend = Arc::new(MockBackend::new());
        let device = device_with(&backend);
        device.assign(MockDevice::new(IDS)).unwrap();
        device.set_option(EndpointAddress(0x01)).unwrap();
        backend.set_read_data(vec![0xaa, 0xbb]);

        assert_eq!(device.send(&[1, 2, 3]), Ok(3));
        let mut buf = [0u8; 2];
        assert_eq!(device.receive(&mut buf), Ok(2));
        assert_eq!(buf, [0xaa, 0xbb]);

        let calls = backend.calls();
        assert!(calls.contains(&MockCall::WriteBulk {
            endpoint: 0x01,
            len: 3
        }));
        assert!(calls.contains(&MockCall::ReadBulk {
            endpoint: 0x81,
            len: 2
        }));
    }

    #[test]
    fn test_sync_transfer_error_is_translated() {
        let backend = Arc::new(MockBackend::new());
        let device = device_with(&backend);
        device.assign(MockDevice::new(IDS)).unwrap();
        backend.push_sync_result(Err(ErrorKind::Timeout));

        assert_eq!(device.send(&[0]), Err(ErrorKind::Timeout));
    }

    #[test]
    fn test_drop_closes_session() {
        let backend = Arc::new(MockBackend::new());
        let device = device_with(&backend);
        device.assign(MockDevice::new(IDS)).unwrap();

        drop(device);
        assert!(matches!(backend.calls().last(), Some(MockCall::Close(_))));
        assert!(backend.claimed_interfaces().is_empty());
    }
}
