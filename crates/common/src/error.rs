//! Common error types
//!
//! [`ErrorKind`] is the closed set of failure categories surfaced by every
//! transport operation. Native status codes are folded into it by
//! [`translate`]; nothing above the native layer ever sees a raw code
//! except through [`ErrorKind::Unknown`].

use thiserror::Error;

/// libusb return code for "other error"
pub const LIBUSB_ERROR_OTHER: i32 = -99;

/// Translated failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ErrorKind {
    /// The device handle is already open
    #[error("device already open")]
    AlreadyOpen,

    /// No matching device, or the interface to release is absent
    #[error("entity not found")]
    NotFound,

    /// Operation attempted on a closed handle
    #[error("bad descriptor")]
    BadDescriptor,

    #[error("input/output error")]
    Io,

    #[error("operation timed out")]
    Timeout,

    #[error("resource busy")]
    Busy,

    #[error("no such device (it may have been disconnected)")]
    NoDevice,

    #[error("pipe error")]
    Pipe,

    #[error("overflow")]
    Overflow,

    #[error("operation not supported")]
    NotSupported,

    #[error("access denied (insufficient permissions)")]
    Access,

    #[error("invalid parameter")]
    InvalidParam,

    #[error("system call interrupted")]
    Interrupted,

    #[error("insufficient memory")]
    NoMem,

    /// The operation was cancelled before it could complete
    #[error("operation aborted")]
    Aborted,

    /// Unmapped native code, raw value preserved
    #[error("unknown native error ({0})")]
    Unknown(i32),
}

impl ErrorKind {
    /// Raw native code this kind corresponds to, if any
    pub fn native_code(&self) -> Option<i32> {
        let code = match self {
            ErrorKind::Io => -1,
            ErrorKind::InvalidParam => -2,
            ErrorKind::Access => -3,
            ErrorKind::NoDevice => -4,
            ErrorKind::NotFound => -5,
            ErrorKind::Busy => -6,
            ErrorKind::Timeout => -7,
            ErrorKind::Overflow => -8,
            ErrorKind::Pipe => -9,
            ErrorKind::Interrupted => -10,
            ErrorKind::NoMem => -11,
            ErrorKind::NotSupported => -12,
            ErrorKind::Unknown(code) => *code,
            ErrorKind::AlreadyOpen | ErrorKind::BadDescriptor | ErrorKind::Aborted => {
                return None;
            }
        };
        Some(code)
    }
}

/// Translate a raw libusb return code
///
/// Non-negative codes are not errors; callers only pass failures, so they
/// land in `Unknown` along with anything else the table does not name.
pub fn translate(code: i32) -> ErrorKind {
    match code {
        -1 => ErrorKind::Io,
        -2 => ErrorKind::InvalidParam,
        -3 => ErrorKind::Access,
        -4 => ErrorKind::NoDevice,
        -5 => ErrorKind::NotFound,
        -6 => ErrorKind::Busy,
        -7 => ErrorKind::Timeout,
        -8 => ErrorKind::Overflow,
        -9 => ErrorKind::Pipe,
        -10 => ErrorKind::Interrupted,
        -11 => ErrorKind::NoMem,
        -12 => ErrorKind::NotSupported,
        other => ErrorKind::Unknown(other),
    }
}

impl From<rusb::Error> for ErrorKind {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Io => ErrorKind::Io,
            rusb::Error::InvalidParam => ErrorKind::InvalidParam,
            rusb::Error::Access => ErrorKind::Access,
            rusb::Error::NoDevice => ErrorKind::NoDevice,
            rusb::Error::NotFound => ErrorKind::NotFound,
            rusb::Error::Busy => ErrorKind::Busy,
            rusb::Error::Timeout => ErrorKind::Timeout,
            rusb::Error::Overflow => ErrorKind::Overflow,
            rusb::Error::Pipe => ErrorKind::Pipe,
            rusb::Error::Interrupted => ErrorKind::Interrupted,
            rusb::Error::NoMem => ErrorKind::NoMem,
            rusb::Error::NotSupported => ErrorKind::NotSupported,
            rusb::Error::BadDescriptor => ErrorKind::BadDescriptor,
            #[allow(unreachable_patterns)]
            _ => ErrorKind::Unknown(LIBUSB_ERROR_OTHER),
        }
    }
}

/// Workspace error for everything outside the transfer path
#[derive(Debug, Error)]
pub enum Error {
    #[error("USB error: {0}")]
    Usb(#[from] ErrorKind),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_known_codes() {
        assert_eq!(translate(-1), ErrorKind::Io);
        assert_eq!(translate(-4), ErrorKind::NoDevice);
        assert_eq!(translate(-5), ErrorKind::NotFound);
        assert_eq!(translate(-6), ErrorKind::Busy);
        assert_eq!(translate(-7), ErrorKind::Timeout);
        assert_eq!(translate(-8), ErrorKind::Overflow);
        assert_eq!(translate(-9), ErrorKind::Pipe);
        assert_eq!(translate(-12), ErrorKind::NotSupported);
    }

    #[test]
    fn test_translate_preserves_unknown_code() {
        assert_eq!(translate(-99), ErrorKind::Unknown(-99));
        assert_eq!(translate(-4242), ErrorKind::Unknown(-4242));
        assert_eq!(ErrorKind::Unknown(-4242).native_code(), Some(-4242));
    }

    #[test]
    fn test_native_code_round_trips_through_translate() {
        for code in -12..=-1 {
            assert_eq!(translate(code).native_code(), Some(code));
        }
    }

    #[test]
    fn test_library_kinds_have_no_native_code() {
        assert_eq!(ErrorKind::AlreadyOpen.native_code(), None);
        assert_eq!(ErrorKind::BadDescriptor.native_code(), None);
        assert_eq!(ErrorKind::Aborted.native_code(), None);
    }

    #[test]
    fn test_from_rusb_error() {
        assert_eq!(ErrorKind::from(rusb::Error::Timeout), ErrorKind::Timeout);
        assert_eq!(ErrorKind::from(rusb::Error::Pipe), ErrorKind::Pipe);
        assert_eq!(ErrorKind::from(rusb::Error::NoDevice), ErrorKind::NoDevice);
        assert_eq!(ErrorKind::from(rusb::Error::NotFound), ErrorKind::NotFound);
        assert_eq!(
            ErrorKind::from(rusb::Error::Other),
            ErrorKind::Unknown(LIBUSB_ERROR_OTHER)
        );
    }

    #[test]
    fn test_error_wraps_kind() {
        let err: Error = ErrorKind::Busy.into();
        assert_eq!(err.to_string(), "USB error: resource busy");
    }
}
