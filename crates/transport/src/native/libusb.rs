//! libusb backend
//!
//! Built on `rusb` for enumeration, claiming and blocking transfers. The
//! safe wrapper has no asynchronous transfer API, so submission goes
//! through the raw `rusb::ffi` bindings: the [`PendingTransfer`] is boxed
//! and leaked into the transfer's `user_data`, and reclaimed exactly once,
//! either in [`transfer_callback`] or right after a failed submit.

use super::{PendingTransfer, SubmitError, TransferStatus, UsbBackend};
use common::{DeviceIds, ErrorKind, translate};
use rusb::{Context, Device, DeviceHandle, UsbContext, ffi};
use std::os::raw::{c_int, c_uint, c_void};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Open libusb device session
///
/// Claim and release need exclusive access to the rusb handle; transfers
/// and submissions share it.
pub struct LibusbHandle {
    inner: RwLock<DeviceHandle<Context>>,
}

impl LibusbHandle {
    fn read(&self) -> Result<RwLockReadGuard<'_, DeviceHandle<Context>>, ErrorKind> {
        self.inner.read().map_err(|_| ErrorKind::Io)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, DeviceHandle<Context>>, ErrorKind> {
        self.inner.write().map_err(|_| ErrorKind::Io)
    }
}

/// Native session backed by its own libusb context
pub struct LibusbBackend {
    context: Context,
}

impl LibusbBackend {
    /// Create a backend with a fresh libusb context
    pub fn new() -> Result<Self, ErrorKind> {
        let context = Context::new()?;
        debug!("Created libusb context");
        Ok(Self { context })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
}

impl UsbBackend for LibusbBackend {
    type Device = Device<Context>;
    type Handle = LibusbHandle;

    fn devices(&self) -> Result<Vec<Self::Device>, ErrorKind> {
        let list = self.context.devices()?;
        Ok(list.iter().collect())
    }

    fn device_ids(&self, device: &Self::Device) -> Result<DeviceIds, ErrorKind> {
        let descriptor = device.device_descriptor()?;
        Ok(DeviceIds::new(descriptor.vendor_id(), descriptor.product_id()))
    }

    fn open(&self, device: &Self::Device) -> Result<Self::Handle, ErrorKind> {
        let mut handle = device.open().map_err(|e| {
            warn!(
                "Failed to open device at bus {} address {}: {}",
                device.bus_number(),
                device.address(),
                e
            );
            ErrorKind::from(e)
        })?;

        // Let libusb detach and reattach kernel drivers around our claims
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            debug!("Kernel driver auto-detach unavailable: {}", e);
        }

        debug!(
            "Opened device at bus {} address {}",
            device.bus_number(),
            device.address()
        );
        Ok(LibusbHandle {
            inner: RwLock::new(handle),
        })
    }

    fn claim_interface(&self, handle: &Self::Handle, interface: u8) -> Result<(), ErrorKind> {
        handle.write()?.claim_interface(interface)?;
        Ok(())
    }

    fn release_interface(&self, handle: &Self::Handle, interface: u8) -> Result<(), ErrorKind> {
        handle.write()?.release_interface(interface)?;
        Ok(())
    }

    fn close(&self, handle: Arc<Self::Handle>) {
        // libusb_close runs when the last reference drops; pending
        // transfers hold one each
        let pending = Arc::strong_count(&handle) - 1;
        if pending > 0 {
            debug!("Deferring native close until {} transfer(s) finish", pending);
        }
    }

    fn write_bulk(
        &self,
        handle: &Self::Handle,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, ErrorKind> {
        Ok(handle.read()?.write_bulk(endpoint, data, timeout)?)
    }

    fn read_bulk(
        &self,
        handle: &Self::Handle,
        endpoint: u8,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, ErrorKind> {
        Ok(handle.read()?.read_bulk(endpoint, buffer, timeout)?)
    }

    fn submit(
        &self,
        handle: &Arc<Self::Handle>,
        mut transfer: PendingTransfer,
    ) -> Result<(), SubmitError> {
        let length = match c_int::try_from(transfer.len()) {
            Ok(length) => length,
            Err(_) => return Err((ErrorKind::InvalidParam, transfer)),
        };
        let timeout_ms = c_uint::try_from(transfer.timeout().as_millis()).unwrap_or(c_uint::MAX);
        let endpoint = transfer.endpoint();

        let guard = match handle.read() {
            Ok(guard) => guard,
            Err(e) => return Err((e, transfer)),
        };
        let raw_handle = guard.as_raw();

        // SAFETY: plain allocation, checked for null below
        let raw = unsafe { ffi::libusb_alloc_transfer(0) };
        if raw.is_null() {
            return Err((ErrorKind::NoMem, transfer));
        }

        // The Vec's heap storage does not move when the slot is boxed
        let buffer = transfer.buffer_mut().as_mut_ptr();
        let slot = Box::new(TransferSlot {
            transfer,
            _handle: Arc::clone(handle),
        });
        let user_data = Box::into_raw(slot) as *mut c_void;

        // SAFETY: `raw` is a fresh transfer, `buffer` stays valid while the
        // slot is alive, and the slot is reclaimed exactly once: below on
        // failure, or in `transfer_callback` after a successful submit.
        let rc = unsafe {
            ffi::libusb_fill_bulk_transfer(
                raw,
                raw_handle,
                endpoint,
                buffer,
                length,
                transfer_callback,
                user_data,
                timeout_ms,
            );
            ffi::libusb_submit_transfer(raw)
        };
        drop(guard);

        if rc != 0 {
            // SAFETY: submit failed, so the callback will never run
            let slot = unsafe { Box::from_raw(user_data as *mut TransferSlot) };
            unsafe { ffi::libusb_free_transfer(raw) };
            let error = translate(rc);
            warn!("Submit on endpoint {:#04x} failed: {}", endpoint, error);
            return Err((error, slot.transfer));
        }

        trace!("Submitted {} byte transfer on {:#04x}", length, endpoint);
        Ok(())
    }

    fn handle_events(&self, timeout: Duration) -> Result<(), ErrorKind> {
        Ok(self.context.handle_events(Some(timeout))?)
    }
}

/// Native custody of one submitted transfer
struct TransferSlot {
    transfer: PendingTransfer,
    /// Keeps the device handle open until the transfer finishes
    _handle: Arc<LibusbHandle>,
}

extern "system" fn transfer_callback(raw: *mut ffi::libusb_transfer) {
    // SAFETY: libusb hands back the transfer we filled in `submit`, whose
    // user_data is the leaked slot; this is the only place it is reclaimed
    // after a successful submit, and libusb invokes the callback once.
    let (slot, status, actual_length) = unsafe {
        let slot = Box::from_raw((*raw).user_data as *mut TransferSlot);
        let status = TransferStatus::from_raw((*raw).status as i32);
        let actual_length = usize::try_from((*raw).actual_length).unwrap_or(0);
        ffi::libusb_free_transfer(raw);
        (slot, status, actual_length)
    };

    trace!(
        "Transfer on {:#04x} finished: {:?}, {} bytes",
        slot.transfer.endpoint(),
        status,
        actual_length
    );
    slot.transfer.complete(status, actual_length);
}
