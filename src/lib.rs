//! Command-protocol engine for an automated measurement turntable.
//!
//! The turntable is an embedded controller reachable only over a serial,
//! line-oriented text protocol with no framing beyond newlines and no
//! correlation identifiers. This crate provides the pieces that make that
//! protocol usable from async Rust:
//!
//! - [`transport`]: the line channel over the serial port, plus a loopback
//!   pair for hardware-free runs
//! - [`messaging`]: the publish/subscribe fan-out multiplexing the single
//!   incoming line stream to concurrent listeners
//! - [`sync`]: the single-flight command lock and cancellation signal
//! - [`protocol`]: the typed command/response grammar
//! - [`client`]: the table driver, including the cancellable streamed
//!   rotate operation
//! - [`emulator`]: a protocol-compatible virtual table

pub mod client;
pub mod config;
pub mod emulator;
pub mod error;
pub mod messaging;
pub mod protocol;
pub mod sync;
pub mod transport;

pub use client::{PositionStream, RotatingTable, TableClient};
pub use config::{Settings, TableClientSettings, TableEmulatorSettings};
pub use emulator::{MotionProfile, RotatingTableEmulator};
pub use error::{Result, TableError};
pub use sync::CancelSignal;
pub use transport::{LineTransport, LoopbackTransport};
