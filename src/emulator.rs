//! Protocol-compatible virtual table.
//!
//! Parses the command lines a client sends, runs the Idle -> Rotating ->
//! Idle state machine and emits the same position/acknowledgement lines the
//! embedded controller would. Wired to a [`LoopbackTransport`] it stands in
//! for real hardware in tests and hardware-free runs.
//!
//! [`LoopbackTransport`]: crate::transport::LoopbackTransport

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{bail, Context as _};
use futures::future::BoxFuture;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;

use crate::config::TableEmulatorSettings;
use crate::protocol::{TableCommand, TableResponse};
use crate::sync::{CancelSignal, CommandLock};
use crate::transport::LineTransport;

/// Step function: desired angle in, step size in degrees out.
pub type StepFn = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

/// Inter-step pause, injectable so tests can gate the motion precisely.
pub type DelayFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// How the virtual table moves: step size per emitted position and the
/// pause between them.
#[derive(Clone)]
pub struct MotionProfile {
    step: StepFn,
    delay: DelayFn,
}

impl Default for MotionProfile {
    /// The controller's illustrative default: five steps per rotation,
    /// 300 ms apart.
    fn default() -> Self {
        Self {
            step: Arc::new(|angle| angle / 5.0),
            delay: delay_fn(Duration::from_millis(300)),
        }
    }
}

impl MotionProfile {
    pub fn from_settings(settings: &TableEmulatorSettings) -> Self {
        let divisor = settings.step_divisor;
        Self {
            step: Arc::new(move |angle| angle / divisor),
            delay: delay_fn(settings.step_interval),
        }
    }

    /// Replace the step function with a fixed step size.
    pub fn with_fixed_step(mut self, step: f64) -> Self {
        self.step = Arc::new(move |_| step);
        self
    }

    /// Replace the step function.
    pub fn with_step_fn(mut self, step: impl Fn(f64) -> f64 + Send + Sync + 'static) -> Self {
        self.step = Arc::new(step);
        self
    }

    /// Replace the inter-step pause with a plain sleep.
    pub fn with_step_interval(mut self, interval: Duration) -> Self {
        self.delay = delay_fn(interval);
        self
    }

    /// Replace the inter-step pause with an arbitrary future factory.
    pub fn with_delay_fn(
        mut self,
        delay: impl Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    ) -> Self {
        self.delay = Arc::new(delay);
        self
    }
}

fn delay_fn(interval: Duration) -> DelayFn {
    Arc::new(move || -> BoxFuture<'static, ()> { Box::pin(tokio::time::sleep(interval)) })
}

struct MotionHandle {
    cancel: CancelSignal,
    task: JoinHandle<()>,
}

struct EmulatorInner {
    transport: Arc<dyn LineTransport>,
    command_lock: CommandLock,
    acceleration: StdMutex<i32>,
    /// Set on the first `FM` and replaced on each subsequent one; never
    /// cleared, so a stop after a finished rotation still finds its flag.
    motion: StdMutex<Option<MotionHandle>>,
    profile: MotionProfile,
}

/// Virtual rotating table behind a [`LineTransport`].
pub struct RotatingTableEmulator {
    inner: Arc<EmulatorInner>,
    shutdown: CancelSignal,
    process: JoinHandle<()>,
}

impl RotatingTableEmulator {
    /// Start the emulator's command-processing loop on `transport`.
    pub async fn spawn(transport: Arc<dyn LineTransport>, profile: MotionProfile) -> Self {
        let inner = Arc::new(EmulatorInner {
            transport: Arc::clone(&transport),
            command_lock: CommandLock::new(),
            acceleration: StdMutex::new(1),
            motion: StdMutex::new(None),
            profile,
        });
        let shutdown = CancelSignal::new();
        // Subscribe before returning so no command sent right after spawn
        // can slip past the processing loop.
        let sub = transport.subscribe().await;
        let process = tokio::spawn(process_loop(Arc::clone(&inner), sub, shutdown.clone()));
        Self {
            inner,
            shutdown,
            process,
        }
    }

    /// Whether a motion task is currently running.
    pub fn is_rotating(&self) -> bool {
        self.inner
            .lock_motion()
            .as_ref()
            .is_some_and(|motion| !motion.task.is_finished())
    }

    /// Stop the processing loop and cancel any running motion.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Some(motion) = self.inner.lock_motion().take() {
            motion.cancel.cancel();
            let _ = motion.task.await;
        }
        let _ = self.process.await;
    }
}

async fn process_loop(
    inner: Arc<EmulatorInner>,
    mut sub: crate::messaging::Subscription<String>,
    shutdown: CancelSignal,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("emulator shutting down");
                return;
            }
            next = sub.recv() => match next {
                Ok(Some(line)) => {
                    if let Err(e) = inner.handle(&line).await {
                        // A protocol-invariant violation is fatal to the
                        // device, exactly like firmware hitting an assert.
                        error!("emulator failed handling {line:?}: {e:#}");
                        return;
                    }
                }
                Ok(None) => {
                    info!("table port closed, emulator loop ending");
                    return;
                }
                Err(e) => {
                    error!("emulator subscription faulted: {e}");
                    return;
                }
            }
        }
    }
}

impl EmulatorInner {
    async fn handle(&self, line: &str) -> anyhow::Result<()> {
        let Some(command) = TableCommand::parse(line) else {
            warn!("ignoring unrecognized token: {line:?}");
            return Ok(());
        };
        match command {
            TableCommand::GetAcceleration => {
                let _guard = self.lock_or_err("GET ACC").await?;
                let acceleration = *self.lock_acceleration();
                self.reply(TableResponse::Value(acceleration)).await
            }
            TableCommand::SetAcceleration(value) => {
                let _guard = self.lock_or_err("SET ACC").await?;
                *self.lock_acceleration() = value;
                self.reply(TableResponse::Ack).await
            }
            TableCommand::Rotate(angle) => {
                {
                    let _guard = self.lock_or_err("FM").await?;
                    self.reply(TableResponse::Ack).await?;
                }
                let mut motion = self.lock_motion();
                if let Some(previous) = &*motion {
                    if !previous.task.is_finished() {
                        bail!("FM received while a rotation is still running");
                    }
                }
                let cancel = CancelSignal::new();
                let task = tokio::spawn(run_motion(
                    Arc::clone(&self.transport),
                    self.profile.clone(),
                    angle,
                    cancel.clone(),
                ));
                *motion = Some(MotionHandle { cancel, task });
                info!("rotation by {angle} degrees started");
                Ok(())
            }
            TableCommand::Stop | TableCommand::SoftStop => {
                let _guard = self.lock_or_err("STOP").await?;
                {
                    let motion = self.lock_motion();
                    let Some(motion) = &*motion else {
                        bail!("stop received but no rotation was ever started");
                    };
                    motion.cancel.cancel();
                }
                self.reply(TableResponse::Ack).await
            }
        }
    }

    /// Take the command lock, replying `ERR` before surfacing a failure.
    async fn lock_or_err(
        &self,
        operation: &'static str,
    ) -> anyhow::Result<crate::sync::CommandGuard> {
        match self.command_lock.try_acquire(operation) {
            Ok(guard) => Ok(guard),
            Err(e) => {
                let _ = self.reply(TableResponse::Err).await;
                Err(e).with_context(|| format!("busy handling {operation}"))
            }
        }
    }

    async fn reply(&self, response: TableResponse) -> anyhow::Result<()> {
        self.transport
            .send_line(&response.encode())
            .await
            .context("failed to send reply")
    }

    fn lock_acceleration(&self) -> std::sync::MutexGuard<'_, i32> {
        match self.acceleration.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_motion(&self) -> std::sync::MutexGuard<'_, Option<MotionHandle>> {
        match self.motion.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// One motion: step from 0 toward `target`, emitting `POS` per step, always
/// finishing with a final `POS` and `END`.
async fn run_motion(
    transport: Arc<dyn LineTransport>,
    profile: MotionProfile,
    target: f64,
    cancel: CancelSignal,
) {
    let result: anyhow::Result<()> = async {
        let step = (profile.step)(target).abs();
        if !step.is_finite() || step <= 0.0 {
            bail!("step function produced an unusable step: {step}");
        }
        let mut current = 0.0_f64;
        loop {
            let remaining = target - current;
            if remaining.abs() <= MOTION_EPSILON {
                break;
            }
            // Cooperative cancellation, checked once per step.
            if cancel.is_cancelled() {
                break;
            }
            transport
                .send_line(&TableResponse::Position(current).encode())
                .await?;
            tokio::select! {
                _ = (profile.delay)() => {}
                _ = cancel.cancelled() => {}
            }
            let magnitude = remaining.abs().min(step);
            current += magnitude.copysign(remaining);
        }
        transport
            .send_line(&TableResponse::Position(current).encode())
            .await?;
        transport.send_line(&TableResponse::End.encode()).await?;
        Ok(())
    }
    .await;

    if let Err(e) = result {
        error!("rotation task failed: {e:#}");
        // Best effort END so a listening client does not hang.
        let _ = transport.send_line(&TableResponse::End.encode()).await;
    }
}

/// Below this the remaining distance counts as arrived; keeps the loop from
/// chasing floating-point dust after the last clamped step.
const MOTION_EPSILON: f64 = 1e-9;
