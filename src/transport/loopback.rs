//! Two line-transport endpoints wired back-to-back.
//!
//! What one endpoint sends, the other receives, with the same fan-out
//! semantics as the real serial channel. This is how the driver and the
//! emulator are tested against each other without hardware.

use std::sync::Arc;

use async_trait::async_trait;
use log::trace;

use crate::messaging::{EventBus, Subscription};

use super::{LineTransport, TransportError};

/// One end of an in-memory serial line.
pub struct LoopbackTransport {
    /// Lines this endpoint sends, read by the peer.
    outgoing: Arc<EventBus<String>>,
    /// Lines the peer sends, read by this endpoint.
    incoming: Arc<EventBus<String>>,
}

impl LoopbackTransport {
    /// Create both ends of the line.
    pub fn pair() -> (LoopbackTransport, LoopbackTransport) {
        let first = Arc::new(EventBus::new());
        let second = Arc::new(EventBus::new());
        (
            LoopbackTransport {
                outgoing: Arc::clone(&first),
                incoming: Arc::clone(&second),
            },
            LoopbackTransport {
                outgoing: second,
                incoming: first,
            },
        )
    }

    /// Simulate a transport fault (decode error, I/O failure) on this
    /// endpoint's incoming stream.
    pub fn fault(&self, reason: impl Into<String>) {
        self.incoming.complete(Some(reason.into()));
    }

    /// Simulate end-of-stream (EOF) on this endpoint's incoming stream.
    pub fn close(&self) {
        self.incoming.complete(None);
    }
}

#[async_trait]
impl LineTransport for LoopbackTransport {
    async fn send_line(&self, line: &str) -> Result<(), TransportError> {
        trace!("loopback sending: {line}");
        self.outgoing.publish(line.to_string());
        Ok(())
    }

    async fn subscribe(&self) -> Subscription<String> {
        self.incoming.subscribe()
    }

    async fn reinit(&self) -> Result<(), TransportError> {
        // Nothing to reopen; the in-memory line is always up.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::BusError;

    #[tokio::test]
    async fn test_lines_cross_between_endpoints() {
        let (client_end, device_end) = LoopbackTransport::pair();
        let mut on_device = device_end.subscribe().await;
        let mut on_client = client_end.subscribe().await;

        client_end.send_line("GET ACC").await.unwrap();
        device_end.send_line("5").await.unwrap();

        assert_eq!(on_device.recv().await.unwrap(), Some("GET ACC".to_string()));
        assert_eq!(on_client.recv().await.unwrap(), Some("5".to_string()));
    }

    #[tokio::test]
    async fn test_fault_reaches_listeners() {
        let (client_end, _device_end) = LoopbackTransport::pair();
        let mut sub = client_end.subscribe().await;

        client_end.fault("simulated EOF");
        assert_eq!(
            sub.recv().await,
            Err(BusError::Faulted("simulated EOF".to_string()))
        );
    }
}
