//! Per-axis execution context.

use super::Axis;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The calibration/run state machine of an axis.
///
/// Runs on the axis' own thread until `shutdown` is set.
pub trait AxisLoop: Send + Sync {
    /// Drive the axis until shutdown.
    fn run(&self, axis: &Axis, shutdown: &AtomicBool);
}

/// Minimal axis context: polls the encoder and keeps the heartbeat.
#[derive(Debug, Clone)]
pub struct IdleLoop {
    period: Duration,
}

impl IdleLoop {
    /// Loop with the given iteration period.
    pub fn new(period: Duration) -> Self {
        Self { period }
    }
}

impl Default for IdleLoop {
    fn default() -> Self {
        Self::new(Duration::from_millis(1))
    }
}

impl AxisLoop for IdleLoop {
    fn run(&self, axis: &Axis, shutdown: &AtomicBool) {
        let config = axis.config();
        if config.startup_motor_calibration || config.startup_closed_loop_control {
            debug!(
                "Axis {}: startup sequence requested, left to the control layer",
                axis.index()
            );
        }
        while !shutdown.load(Ordering::Acquire) {
            if let Err(e) = axis.encoder().issue_transfer() {
                debug!("Axis {} encoder read not issued: {}", axis.index(), e);
            }
            axis.status().beat();
            thread::sleep(self.period);
        }
    }
}

impl Axis {
    /// Start the axis context on its own thread.
    ///
    /// Fails if the context was already started.
    pub fn start_thread(
        self: &Arc<Self>,
        axis_loop: Arc<dyn AxisLoop>,
        shutdown: Arc<AtomicBool>,
    ) -> io::Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("axis {} context already running", self.index),
            ));
        }
        let axis = Arc::clone(self);
        self.status.set_running(true);
        let handle = thread::Builder::new()
            .name(format!("axis{}", self.index))
            .spawn(move || {
                axis_loop.run(&axis, &shutdown);
                axis.status.set_running(false);
            });
        match handle {
            Ok(handle) => {
                *worker = Some(handle);
                info!("Axis {} context started", self.index);
                Ok(())
            }
            Err(e) => {
                self.status.set_running(false);
                Err(e)
            }
        }
    }

    /// Wait for the axis context to return after shutdown was requested.
    pub fn join(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Axis {} context panicked", self.index);
            }
        }
    }
}
