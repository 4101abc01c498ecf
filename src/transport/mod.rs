//! Line-oriented transport over the serial connection.
//!
//! [`LineTransport`] is the seam between the protocol engine and the
//! physical world: the driver and the emulator both talk to a transport,
//! never to a port directly. [`SerialTransport`] wraps a real serial port;
//! [`LoopbackTransport`] wires two endpoints back-to-back for tests and
//! hardware-free runs.

use async_trait::async_trait;
use thiserror::Error;

use crate::messaging::{BusError, Subscription};

mod loopback;
#[cfg(feature = "serial")]
mod serial;

pub use loopback::LoopbackTransport;
#[cfg(feature = "serial")]
pub use serial::SerialTransport;

/// Errors raised by the transport itself, as opposed to the protocol spoken
/// over it.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("serial port is not connected")]
    NotConnected,

    #[error("write to serial port timed out after {0:?}")]
    WriteTimeout(std::time::Duration),

    #[error("serial port I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open serial port {port}: {reason}")]
    OpenFailed { port: String, reason: String },

    #[error("reconnect failed after {attempts} attempts")]
    ReconnectFailed { attempts: u32 },

    #[error("line subscription faulted: {0}")]
    Faulted(String),
}

impl From<BusError> for TransportError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Faulted(fault) => Self::Faulted(fault),
        }
    }
}

/// One serial line: send a newline-terminated token, or listen to every
/// token decoded from the wire from this point forward.
#[async_trait]
pub trait LineTransport: Send + Sync {
    /// Write one line. Fails fast when the connection is closed.
    async fn send_line(&self, line: &str) -> Result<(), TransportError>;

    /// Obtain a fresh listener of incoming lines (no history is replayed).
    async fn subscribe(&self) -> Subscription<String>;

    /// Close any existing connection and reopen it, retrying a bounded
    /// number of times. In-flight listeners observe end-of-stream.
    async fn reinit(&self) -> Result<(), TransportError>;
}
