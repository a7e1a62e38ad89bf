//! Device link
//!
//! Serial port abstractions and the multiplexing transport that runs on them.

pub mod serial;
pub mod transport;

pub use serial::{opener_for_port, DynSerial, SerialOpener, SerialPortIO, StdinOpener, TokioSerialOpener};
pub use transport::{
    CommandError, CommandReply, SerialTransport, TransportConfig, TransportHandle, TransportStats,
};
