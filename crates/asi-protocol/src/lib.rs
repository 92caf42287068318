//! ASI Telemetry Protocol
//!
//! Device-side implementation of the ASI serial telemetry protocol, plus the
//! host-side pieces needed to talk to a device.
//!
//! # Protocol Overview
//!
//! - **Commands** (host → device): ASCII frames `<NAME,P1,...,P10>`. `P1`
//!   doubles as a short string field.
//! - **Telegrams** (device → host): binary frames starting with `#ASI:`,
//!   either a symbol list (kind `0xB0`, names and types) or data (kind
//!   `0xB1`, current values), ending with `ENDOFASI\r\n`.
//! - **Bus aggregation**: a controller polls subordinates on a shared bus and
//!   appends their signals to its own telegrams.
//! - **Periodic logging**: `LOGGING_ACTIVATE` makes the device emit data
//!   telegrams on a drift-free schedule.
//!
//! | Command                 | Effect                                 |
//! |-------------------------|----------------------------------------|
//! | `LOGGING_GETSIGNALLIST` | symbol-list telegram, id from P1..P4   |
//! | `LOGGING_GETDATA`       | data telegram, id from P1..P4          |
//! | `LOGGING_ACTIVATE`      | log every P1 seconds (max 32767)       |
//! | `LOGGING_DEACTIVATE`    | stop logging                           |
//!
//! Anything else is handed to the application's [`CommandHandler`].
//!
//! # Example
//!
//! ```rust,ignore
//! use asi_protocol::{AsiDevice, DeviceConfig};
//!
//! let mut device = AsiDevice::new(DeviceConfig::default(), serial);
//! device.register_float("temperature", move || sensor.read())?;
//!
//! loop {
//!     device.read();
//!     device.tick(0);
//! }
//! ```

pub mod constants;

mod bus;
mod command;
mod config;
mod device;
mod error;
mod registry;
mod scheduler;
mod telegram;
mod transport;
mod types;

pub use bus::*;
pub use command::*;
pub use config::*;
pub use device::*;
pub use error::*;
pub use registry::*;
pub use scheduler::*;
pub use telegram::*;
pub use transport::*;
pub use types::*;
