//! Common utilities for usb-transport
//!
//! This crate provides the types shared by every layer of the transport:
//! the translated error set, the typed device options and the logging
//! setup used by the binaries.

pub mod error;
pub mod logging;
pub mod usb_types;

pub use error::{Error, ErrorKind, Result, translate};
pub use logging::setup_logging;
pub use usb_types::{DeviceIds, EndpointAddress, InterfaceNumber};
