//! Client-side driver for the rotating table.
//!
//! Translates typed operations into protocol lines and correlates the
//! replies coming back through the line subscription. The protocol carries
//! no correlation identifiers, so every operation follows the same
//! discipline: take the single-flight command lock, subscribe, send the
//! command line, and wait for the initiation reply under a bounded timeout.
//!
//! Rotation is the long-running exception: once the table has acknowledged
//! `FM`, the lock is released and the open subscription is handed to a
//! background task that pumps `POS` tokens into a [`PositionStream`]. A
//! `stop` can therefore always get through while the table is turning.

use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};

use crate::config::TableClientSettings;
use crate::error::{Result, TableError};
use crate::messaging::Subscription;
use crate::protocol::{TableCommand, TableResponse, ANGLE_EPSILON};
use crate::sync::{CancelSignal, CommandLock};
use crate::transport::LineTransport;

/// Typed operations exposed to the HTTP layer and the measurement
/// orchestrator.
#[async_trait]
pub trait RotatingTable: Send + Sync {
    /// Query the table's acceleration setting.
    async fn get_acceleration(&self) -> Result<i32>;

    /// Set the table's acceleration (1-10).
    async fn set_acceleration(&self, acceleration: i32) -> Result<()>;

    /// Start rotating by `angle` degrees and stream intermediate positions.
    ///
    /// The returned stream is lazily consumed; the rotation itself proceeds
    /// on the device regardless of how fast the stream is drained.
    async fn start_rotating(&self, angle: f64) -> Result<PositionStream>;

    /// Rotate by `angle` degrees and wait for the motion to finish,
    /// returning the last observed position.
    ///
    /// Cancelling through `cancel` does not abandon the table mid-motion: a
    /// soft stop is issued and awaited, and the last position observed
    /// before the cancellation is returned.
    async fn rotate(&self, angle: f64, cancel: CancelSignal) -> Result<Option<f64>>;

    /// Halt an outstanding rotation (hard or soft). A no-op when nothing is
    /// rotating.
    async fn stop(&self, soft: bool) -> Result<()>;
}

/// Streamed sequence of `POS` angles for one rotation, terminated by `END`.
#[derive(Debug)]
pub struct PositionStream {
    inner: UnboundedReceiverStream<Result<f64>>,
}

impl PositionStream {
    fn new(rx: mpsc::UnboundedReceiver<Result<f64>>) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(rx),
        }
    }

    /// A stream that ends immediately, for rotations that never start.
    fn empty() -> Self {
        let (_tx, rx) = mpsc::unbounded_channel();
        Self::new(rx)
    }

    /// Next position; `None` once the motion has ended.
    pub async fn recv(&mut self) -> Option<Result<f64>> {
        self.inner.next().await
    }

    /// Drain the stream into a vector of positions.
    pub async fn collect_positions(mut self) -> Result<Vec<f64>> {
        let mut positions = Vec::new();
        while let Some(next) = self.recv().await {
            positions.push(next?);
        }
        Ok(positions)
    }
}

impl Stream for PositionStream {
    type Item = Result<f64>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// One rotation in flight: the background pump task plus its bookkeeping.
/// A fresh session is created per rotation; nothing is reused across
/// rotations.
struct RotationSession {
    cancel: CancelSignal,
    task: JoinHandle<()>,
    last_angle: Arc<StdMutex<Option<f64>>>,
}

impl RotationSession {
    fn last_angle(&self) -> Option<f64> {
        match self.last_angle.lock() {
            Ok(last) => *last,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    async fn join(self) {
        if let Err(e) = self.task.await {
            warn!("position pump task failed: {e}");
        }
    }
}

/// Driver for one table on one serial line.
pub struct TableClient {
    transport: Arc<dyn LineTransport>,
    settings: TableClientSettings,
    command_lock: CommandLock,
    session: AsyncMutex<Option<RotationSession>>,
}

impl TableClient {
    pub fn new(transport: Arc<dyn LineTransport>, settings: TableClientSettings) -> Self {
        Self {
            transport,
            settings,
            command_lock: CommandLock::new(),
            session: AsyncMutex::new(None),
        }
    }

    /// Last position observed by the current (or most recent) rotation.
    pub async fn last_position(&self) -> Option<f64> {
        self.session
            .lock()
            .await
            .as_ref()
            .and_then(RotationSession::last_angle)
    }

    /// Cancel and join any outstanding rotation session.
    pub async fn shutdown(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.cancel.cancel();
            session.join().await;
        }
    }

    /// Wait for the `OK`/`ERR` that initiates every command.
    async fn wait_for_command_init(&self, sub: &mut Subscription<String>) -> Result<()> {
        let window = self.settings.command_initiation_timeout;
        let wait = async {
            loop {
                match sub.recv().await {
                    Ok(Some(line)) => match TableResponse::parse(&line) {
                        Some(TableResponse::Ack) => {
                            info!("command started");
                            return Ok(());
                        }
                        Some(TableResponse::Err) => return Err(TableError::CommandRejected),
                        _ => {}
                    },
                    Ok(None) => return Err(TableError::CommandNotStarted { timeout: window }),
                    Err(e) => return Err(TableError::Transport(e.into())),
                }
            }
        };
        match timeout(window, wait).await {
            Ok(result) => result,
            Err(_) => Err(TableError::CommandNotStarted { timeout: window }),
        }
    }
}

#[async_trait]
impl RotatingTable for TableClient {
    async fn get_acceleration(&self) -> Result<i32> {
        let _guard = self.command_lock.try_acquire("get_acceleration")?;
        let mut sub = self.transport.subscribe().await;
        self.transport
            .send_line(&TableCommand::GetAcceleration.encode())
            .await?;

        let window = self.settings.command_initiation_timeout;
        let wait = async {
            loop {
                match sub.recv().await {
                    Ok(Some(line)) => {
                        if let Some(TableResponse::Value(value)) = TableResponse::parse(&line) {
                            return Ok(value);
                        }
                    }
                    Ok(None) => return Err(TableError::NoAccelerationValue),
                    Err(e) => return Err(TableError::Transport(e.into())),
                }
            }
        };
        match timeout(window, wait).await {
            Ok(result) => result,
            Err(_) => Err(TableError::NoAccelerationValue),
        }
    }

    async fn set_acceleration(&self, acceleration: i32) -> Result<()> {
        if !(1..=10).contains(&acceleration) {
            return Err(TableError::InvalidAcceleration(acceleration));
        }

        let _guard = self.command_lock.try_acquire("set_acceleration")?;
        let mut sub = self.transport.subscribe().await;
        self.transport
            .send_line(&TableCommand::SetAcceleration(acceleration).encode())
            .await?;
        self.wait_for_command_init(&mut sub).await
    }

    async fn start_rotating(&self, angle: f64) -> Result<PositionStream> {
        if angle.abs() < ANGLE_EPSILON {
            debug!("rotation by {angle} degrees is below the epsilon, nothing to do");
            return Ok(PositionStream::empty());
        }

        // The table cannot process overlapping motion commands; refuse here
        // rather than trip the device's own invariant.
        {
            let mut session = self.session.lock().await;
            match &*session {
                Some(active) if !active.task.is_finished() => {
                    return Err(TableError::RotationInProgress);
                }
                Some(_) => *session = None,
                None => {}
            }
        }

        let guard = self.command_lock.try_acquire("start_rotating")?;
        let mut sub = self.transport.subscribe().await;
        self.transport
            .send_line(&TableCommand::Rotate(angle).encode())
            .await?;
        if let Err(e) = self.wait_for_command_init(&mut sub).await {
            error!("failed to start rotating command: {e}");
            return Err(e);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancelSignal::new();
        let last_angle = Arc::new(StdMutex::new(None));
        let task = tokio::spawn(pump_positions(
            sub,
            tx,
            cancel.clone(),
            Arc::clone(&last_angle),
        ));
        *self.session.lock().await = Some(RotationSession {
            cancel,
            task,
            last_angle,
        });

        // The guard drops here: motion is long-running and must not hold
        // the command lock, or a stop could never get through.
        drop(guard);
        Ok(PositionStream::new(rx))
    }

    async fn rotate(&self, angle: f64, cancel: CancelSignal) -> Result<Option<f64>> {
        let mut stream = self.start_rotating(angle).await?;
        let mut last = None;
        loop {
            tokio::select! {
                // Check cancellation first so a position racing in at the
                // same instant is not counted as "observed before".
                biased;
                _ = cancel.cancelled() => {
                    info!("rotate cancelled, soft-stopping the table");
                    self.stop(true).await?;
                    return Ok(last);
                }
                next = stream.recv() => match next {
                    Some(Ok(position)) => last = Some(position),
                    Some(Err(e)) => return Err(e),
                    None => return Ok(last),
                }
            }
        }
    }

    async fn stop(&self, soft: bool) -> Result<()> {
        {
            let mut session = self.session.lock().await;
            match &*session {
                None => {
                    info!("stop requested but no rotation is in progress");
                    return Ok(());
                }
                Some(active) if active.task.is_finished() => {
                    *session = None;
                    info!("stop requested but the rotation has already finished");
                    return Ok(());
                }
                Some(_) => {}
            }
        }

        let command = if soft {
            TableCommand::SoftStop
        } else {
            TableCommand::Stop
        };
        {
            let _guard = self.command_lock.try_acquire("stop")?;
            let mut sub = self.transport.subscribe().await;
            self.transport.send_line(&command.encode()).await?;
            self.wait_for_command_init(&mut sub).await?;
        }

        // Only return once the table has actually stopped streaming: the
        // pump task ends when it observes END.
        if let Some(session) = self.session.lock().await.take() {
            session.join().await;
        }
        Ok(())
    }
}

/// Background task for one rotation: decodes `POS` tokens into the stream
/// and terminates on `END`.
async fn pump_positions(
    mut sub: Subscription<String>,
    positions: mpsc::UnboundedSender<Result<f64>>,
    cancel: CancelSignal,
    last_angle: Arc<StdMutex<Option<f64>>>,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("position pump cancelled");
                return;
            }
            next = sub.recv() => match next {
                Ok(Some(line)) => match TableResponse::parse(&line) {
                    Some(TableResponse::Position(angle)) => {
                        info!("table at position {angle}");
                        if let Ok(mut last) = last_angle.lock() {
                            *last = Some(angle);
                        }
                        let _ = positions.send(Ok(angle));
                    }
                    Some(TableResponse::End) => {
                        info!("table finished rotating");
                        return;
                    }
                    _ => {}
                },
                Ok(None) => {
                    warn!("line subscription ended before END was observed");
                    let _ = positions.send(Err(TableError::MissingEndToken));
                    return;
                }
                Err(e) => {
                    error!("line subscription faulted while rotating: {e}");
                    let _ = positions.send(Err(TableError::MissingEndToken));
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SerialPortSettings, TableClientSettings};
    use crate::transport::LoopbackTransport;
    use std::time::Duration;

    fn client_with_peer() -> (TableClient, Arc<LoopbackTransport>) {
        let (client_end, device_end) = LoopbackTransport::pair();
        let mut settings =
            TableClientSettings::new(SerialPortSettings::for_port("loopback"));
        settings.command_initiation_timeout = Duration::from_millis(200);
        (
            TableClient::new(Arc::new(client_end), settings),
            Arc::new(device_end),
        )
    }

    #[tokio::test]
    async fn test_set_acceleration_out_of_range_sends_nothing() {
        let (client, device_end) = client_with_peer();
        let mut wire = device_end.subscribe().await;

        for value in [0, 11, -3] {
            let err = client.set_acceleration(value).await.unwrap_err();
            assert!(matches!(err, TableError::InvalidAcceleration(v) if v == value));
        }

        device_end.close();
        assert_eq!(wire.recv().await.unwrap(), None, "no line should have crossed");
    }

    #[test]
    fn test_empty_stream_ends_immediately() {
        let mut stream = tokio_test::task::spawn(PositionStream::empty());
        match stream.poll_next() {
            std::task::Poll::Ready(None) => {}
            other => panic!("expected an immediately-ended stream, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rotate_below_epsilon_is_local_noop() {
        let (client, device_end) = client_with_peer();
        let mut wire = device_end.subscribe().await;

        let positions = client
            .start_rotating(0.0)
            .await
            .unwrap()
            .collect_positions()
            .await
            .unwrap();
        assert!(positions.is_empty());

        device_end.close();
        assert_eq!(wire.recv().await.unwrap(), None, "no line should have crossed");
    }

    #[tokio::test]
    async fn test_missing_ok_times_out_as_not_started() {
        let (client, _device_end) = client_with_peer();
        let err = client.set_acceleration(5).await.unwrap_err();
        assert!(matches!(err, TableError::CommandNotStarted { .. }));
    }

    #[tokio::test]
    async fn test_err_reply_is_rejected() {
        let (client, device_end) = client_with_peer();
        let mut wire = device_end.subscribe().await;

        let task = tokio::spawn(async move {
            // Answer whatever arrives with ERR.
            let _ = wire.recv().await;
            device_end.send_line("ERR").await.unwrap();
        });

        let err = client.set_acceleration(5).await.unwrap_err();
        assert!(matches!(err, TableError::CommandRejected));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_without_rotation_is_silent() {
        let (client, device_end) = client_with_peer();
        let mut wire = device_end.subscribe().await;

        client.stop(false).await.unwrap();
        client.stop(true).await.unwrap();

        device_end.close();
        assert_eq!(wire.recv().await.unwrap(), None, "no line should have crossed");
    }
}
