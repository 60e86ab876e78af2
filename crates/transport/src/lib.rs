//! Asynchronous USB transport
//!
//! Adapts a blocking, callback-driven native USB library to an
//! executor-based asynchronous model. Callers open a [`UsbDevice`], either
//! directly or through an [`Acceptor`] that waits for a device to appear,
//! and issue transfers whose handlers are always delivered through the
//! caller's [`Executor`].
//!
//! Two worker threads carry the blocking work: the accept scanner and the
//! per-device [`EventPump`], the only context in which native transfer
//! callbacks run.

pub mod accept;
pub mod config;
pub mod device;
pub mod executor;
pub mod native;
pub mod pump;
pub mod transfer;

pub use accept::{AcceptResult, Acceptor};
pub use config::TransportConfig;
pub use device::{DeviceOptions, DeviceSettings, GettableOption, SettableOption, UsbDevice};
pub use executor::{Executor, QueueExecutor, Task, TokioExecutor};
pub use native::{LibusbBackend, MockBackend, UsbBackend};
pub use pump::EventPump;
pub use transfer::{Direction, TransferResult};

pub use common::{DeviceIds, EndpointAddress, ErrorKind, InterfaceNumber};
