//! ASI Simulation Harness
//!
//! Runs ASI devices entirely in memory: a [`MemorySerial`] stands in for the
//! host's serial port, a [`SimBus`] carries subordinate devices, and a
//! [`ManualClock`] drives the logging scheduler. A [`Bench`] describes the
//! whole setup in YAML and builds a runnable [`BenchRig`].
//!
//! # Example
//!
//! ```rust,ignore
//! use asi_protocol::ProtocolCommand;
//! use asi_sim::Bench;
//!
//! let mut rig = Bench::load("bench.yaml")?.build()?;
//! rig.send_command(&ProtocolCommand::GetSignalList { message_id: 1 });
//! for telegram in rig.telegrams()? {
//!     println!("{}", serde_json::to_string(&telegram)?);
//! }
//! ```

mod bench;
mod bus;
mod clock;
mod error;
mod serial;

pub use bench::*;
pub use bus::*;
pub use clock::*;
pub use error::*;
pub use serial::*;
