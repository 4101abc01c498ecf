//! Serial implementation of [`LineTransport`].
//!
//! Wraps the `serialport` crate: blocking port I/O runs on Tokio's blocking
//! executor, and a single decode loop assembles newline-terminated tokens
//! and publishes them to the channel's event bus. There is exactly one
//! decode loop per open port; reconnecting tears the loop down and installs
//! a fresh one together with a fresh bus, so no listener can ever see a
//! line twice across a reconnect.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use serialport::SerialPort;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::SerialPortSettings;
use crate::messaging::{EventBus, Subscription};

use super::{LineTransport, TransportError};

type SharedPort = Arc<AsyncMutex<Box<dyn SerialPort>>>;

struct ReaderHandle {
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

struct PortState {
    writer: Option<SharedPort>,
    bus: Arc<EventBus<String>>,
    reader: Option<ReaderHandle>,
}

/// Line channel over a physical or virtual serial port.
pub struct SerialTransport {
    settings: SerialPortSettings,
    state: AsyncMutex<PortState>,
}

impl SerialTransport {
    /// Create a closed channel; sends fail fast until [`reinit`] succeeds.
    ///
    /// [`reinit`]: LineTransport::reinit
    pub fn new(settings: SerialPortSettings) -> Self {
        Self {
            settings,
            state: AsyncMutex::new(PortState {
                writer: None,
                bus: Arc::new(EventBus::new()),
                reader: None,
            }),
        }
    }

    /// Create the channel and open the port right away.
    pub async fn connect(settings: SerialPortSettings) -> Result<Self, TransportError> {
        let transport = Self::new(settings);
        transport.reinit().await?;
        Ok(transport)
    }

    /// Close the port. In-flight listeners observe end-of-stream; sends fail
    /// fast until the next `reinit`.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        Self::teardown(&mut state).await;
        debug!("serial port '{}' closed", self.settings.port_name);
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.writer.is_some()
    }

    /// Stop the decode loop, drop the writer and complete the bus.
    async fn teardown(state: &mut PortState) {
        state.writer = None;
        if let Some(reader) = state.reader.take() {
            reader.stop.store(true, Ordering::Release);
            // The loop notices the flag at its next read poll.
            if timeout(std::time::Duration::from_secs(2), reader.task)
                .await
                .is_err()
            {
                warn!("decode loop did not stop in time, detaching it");
            }
        }
        state.bus.complete(None);
    }

    /// One blocking open attempt, returning the writer handle and a cloned
    /// reader handle with the read timeout applied.
    fn open_port(
        settings: &SerialPortSettings,
    ) -> Result<(Box<dyn SerialPort>, Box<dyn SerialPort>), TransportError> {
        let open_failed = |reason: String| TransportError::OpenFailed {
            port: settings.port_name.clone(),
            reason,
        };
        let mut writer = serialport::new(&settings.port_name, settings.baud_rate)
            .timeout(settings.read_timeout)
            .open()
            .map_err(|e| open_failed(e.to_string()))?;
        let reader = writer
            .try_clone()
            .map_err(|e| open_failed(format!("clone for decode loop failed: {e}")))?;
        writer
            .set_timeout(settings.write_timeout)
            .map_err(|e| open_failed(e.to_string()))?;
        Ok((writer, reader))
    }
}

#[async_trait::async_trait]
impl LineTransport for SerialTransport {
    async fn send_line(&self, line: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        let port = state.writer.clone().ok_or(TransportError::NotConnected)?;

        debug!("sending command: {line}");
        let payload = format!("{line}\n");
        let write = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut port = port.blocking_lock();
            port.write_all(payload.as_bytes())?;
            port.flush()?;
            Ok(())
        });

        let write_timeout = self.settings.write_timeout;
        match timeout(write_timeout, write).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => {
                // A failed write means the port is gone; fault everyone now
                // rather than letting readers hang until their own timeout.
                warn!("write failed, closing serial port: {e}");
                state.writer = None;
                if let Some(reader) = state.reader.take() {
                    reader.stop.store(true, Ordering::Release);
                }
                state.bus.complete(Some(format!("serial write failed: {e}")));
                Err(TransportError::Io(e))
            }
            Ok(Err(join_err)) => Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                join_err,
            ))),
            Err(_) => Err(TransportError::WriteTimeout(write_timeout)),
        }
    }

    async fn subscribe(&self) -> Subscription<String> {
        self.state.lock().await.bus.subscribe()
    }

    async fn reinit(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        Self::teardown(&mut state).await;

        let attempts = self.settings.reconnect_attempts.max(1);
        for attempt in 1..=attempts {
            let settings = self.settings.clone();
            let opened = tokio::task::spawn_blocking(move || Self::open_port(&settings))
                .await
                .map_err(|e| {
                    TransportError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
                })?;

            match opened {
                Ok((writer, reader)) => {
                    let bus = Arc::new(EventBus::new());
                    let stop = Arc::new(AtomicBool::new(false));
                    let task = tokio::task::spawn_blocking({
                        let bus = Arc::clone(&bus);
                        let stop = Arc::clone(&stop);
                        move || decode_loop(reader, &bus, &stop)
                    });
                    state.writer = Some(Arc::new(AsyncMutex::new(writer)));
                    state.bus = bus;
                    state.reader = Some(ReaderHandle { stop, task });
                    debug!(
                        "serial port '{}' opened at {} baud (attempt {attempt})",
                        self.settings.port_name, self.settings.baud_rate
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "failed to open serial port '{}' (attempt {attempt}/{attempts}): {e}",
                        self.settings.port_name
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.reconnect_delay).await;
                    }
                }
            }
        }
        Err(TransportError::ReconnectFailed { attempts })
    }
}

/// Blocking decode loop: bytes in, newline-terminated tokens out.
///
/// Runs until the stop flag is raised (deliberate close, bus completed by
/// the caller) or the port faults (bus completed here, with the fault).
fn decode_loop(mut port: Box<dyn SerialPort>, bus: &EventBus<String>, stop: &AtomicBool) {
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        if stop.load(Ordering::Acquire) {
            return;
        }
        match port.read(&mut buf) {
            Ok(0) => {
                bus.complete(Some("unexpected EOF from serial port".to_string()));
                return;
            }
            Ok(n) => {
                for &byte in &buf[..n] {
                    if byte != b'\n' {
                        pending.push(byte);
                        continue;
                    }
                    match String::from_utf8(std::mem::take(&mut pending)) {
                        Ok(line) => {
                            let line = line.trim_end_matches('\r');
                            if !line.is_empty() {
                                debug!("message: {line}");
                                bus.publish(line.to_string());
                            }
                        }
                        Err(e) => {
                            bus.complete(Some(format!("failed to decode line: {e}")));
                            return;
                        }
                    }
                }
            }
            // The port timeout is the poll granularity, not a fault.
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => {
                bus.complete(Some(format!("serial read error: {e}")));
                return;
            }
        }
    }
}
