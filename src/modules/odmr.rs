//! OdmrModule - pulsed-ODMR acquisition as a spawned task
//!
//! [`OdmrModule::spawn`] builds the coordinator, aggregator and acquisition loop
//! from an [`OdmrConfig`] and runs the loop on the current Tokio runtime. The
//! returned [`OdmrHandle`] is the observer side:
//!
//! - commands go through an `mpsc` channel and are answered on a `oneshot`
//! - the run status is a `watch` (latest value wins)
//! - the plot snapshot is a `watch` updated after every line
//! - parameter, state, fit and elapsed-time notifications are `broadcast`
//!
//! # Example
//!
//! ```rust,ignore
//! let bench = SimulatedBench::new();
//! let odmr = OdmrModule::spawn(&config, bench.instruments(), LaserEnable::new())?;
//! odmr.start().await?;
//! odmr.wait_for_state(RunState::Running, Duration::from_secs(5)).await?;
//! let plots = odmr.plots();
//! odmr.stop().await?;
//! odmr.shutdown().await?;
//! ```

use crate::config::OdmrConfig;
use crate::data::aggregator::{Aggregator, OdmrSnapshot};
use crate::data::fit::{FitRegistry, FitResult};
use crate::error::{OdmrError, OdmrResult};
use crate::experiment::coordinator::Coordinator;
use crate::experiment::messages::{
    OdmrCommand, OdmrEvent, ParametersUpdate, PulseSettings, SweepSettings,
};
use crate::experiment::run_engine::RunEngine;
use crate::experiment::state::{RunState, RunStatus};
use crate::hardware::{Instruments, LaserEnable};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{error, info, Instrument};

const COMMAND_QUEUE: usize = 32;

/// Spawns pulsed-ODMR acquisition tasks.
pub struct OdmrModule;

impl OdmrModule {
    /// Validates `config` and spawns the acquisition loop with the built-in fits.
    pub fn spawn(
        config: &OdmrConfig,
        instruments: Instruments,
        laser: LaserEnable,
    ) -> OdmrResult<OdmrHandle> {
        Self::spawn_with_fits(config, instruments, laser, FitRegistry::with_builtin())
    }

    /// Like [`OdmrModule::spawn`], with a caller-supplied fit registry.
    pub fn spawn_with_fits(
        config: &OdmrConfig,
        instruments: Instruments,
        laser: LaserEnable,
        fits: FitRegistry,
    ) -> OdmrResult<OdmrHandle> {
        config.validate()?;

        let coordinator = Coordinator::new(instruments, laser, config.coordinator_settings());
        let aggregator = Arc::new(Aggregator::new(
            config.acquisition.rolling_capacity,
            config.growth_policy(),
            config.acquisition.lines_to_average,
        ));
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (status_tx, status_rx) = watch::channel(RunStatus::default());

        let engine = RunEngine::new(
            coordinator,
            Arc::clone(&aggregator),
            command_rx,
            status_tx,
            config.engine_settings(),
        )
        .with_parameters(config.sweep, config.pulses)
        .with_fits(fits);

        let task = tokio::spawn(engine.run().in_current_span());
        info!(name = %config.application.name, "ODMR module spawned");

        Ok(OdmrHandle {
            commands: command_tx,
            status: status_rx,
            aggregator,
            task,
            shutdown_timeout: config.shutdown_timeout(),
            query_interval: Duration::from_millis(config.acquisition.query_interval_ms),
        })
    }
}

/// Observer-side control of one acquisition task.
pub struct OdmrHandle {
    commands: mpsc::Sender<OdmrCommand>,
    status: watch::Receiver<RunStatus>,
    aggregator: Arc<Aggregator>,
    task: JoinHandle<()>,
    shutdown_timeout: Duration,
    query_interval: Duration,
}

impl OdmrHandle {
    async fn request<T>(
        &self,
        (cmd, rx): (OdmrCommand, oneshot::Receiver<OdmrResult<T>>),
    ) -> OdmrResult<T> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| OdmrError::ChannelClosed)?;
        rx.await.map_err(|_| OdmrError::ChannelClosed)?
    }

    async fn query<T>(&self, (cmd, rx): (OdmrCommand, oneshot::Receiver<T>)) -> OdmrResult<T> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| OdmrError::ChannelClosed)?;
        rx.await.map_err(|_| OdmrError::ChannelClosed)
    }

    /// Plans and starts a run. Returns once the run is planned; arming happens
    /// in the background.
    pub async fn start(&self) -> OdmrResult<()> {
        self.request(OdmrCommand::start()).await
    }

    /// Requests a stop; teardown completes in the background.
    pub async fn stop(&self) -> OdmrResult<()> {
        self.request(OdmrCommand::stop()).await
    }

    /// Pauses at the next line boundary.
    pub async fn pause(&self) -> OdmrResult<()> {
        self.request(OdmrCommand::pause()).await
    }

    /// Continues a paused run.
    pub async fn resume(&self) -> OdmrResult<()> {
        self.request(OdmrCommand::resume()).await
    }

    /// Zeroes the rolling matrix and mean trace.
    pub async fn clear_matrix(&self) -> OdmrResult<()> {
        self.request(OdmrCommand::clear_matrix()).await
    }

    /// Returns from `error` to `idle`.
    pub async fn clear_error(&self) -> OdmrResult<()> {
        self.request(OdmrCommand::clear_error()).await
    }

    /// Saves the current snapshot; returns the path of the written record.
    pub async fn save(&self, tag: impl Into<String>) -> OdmrResult<PathBuf> {
        self.request(OdmrCommand::save(tag)).await
    }

    /// Returns the sweep as corrected to the device limits.
    pub async fn set_sweep(&self, sweep: SweepSettings) -> OdmrResult<SweepSettings> {
        self.request(OdmrCommand::set_sweep(sweep)).await
    }

    /// Recompiles the pulse pattern; refused while running.
    pub async fn set_pulses(&self, pulses: PulseSettings) -> OdmrResult<PulseSettings> {
        self.request(OdmrCommand::set_pulses(pulses)).await
    }

    /// Number of newest lines in the mean trace.
    pub async fn set_lines_to_average(&self, lines: usize) -> OdmrResult<()> {
        self.request(OdmrCommand::set_lines_to_average(lines)).await
    }

    /// Resizes the rolling matrix, keeping the newest rows.
    pub async fn set_rolling_capacity(&self, capacity: usize) -> OdmrResult<()> {
        self.request(OdmrCommand::set_rolling_capacity(capacity))
            .await
    }

    /// Fits `data`, or the current mean trace when `None`.
    pub async fn fit(
        &self,
        name: impl Into<String>,
        data: Option<(Vec<f64>, Vec<f64>)>,
    ) -> OdmrResult<FitResult> {
        self.request(OdmrCommand::fit(name, data)).await
    }

    /// Status as seen by the loop, after every queued command has been handled.
    pub async fn status(&self) -> OdmrResult<RunStatus> {
        self.query(OdmrCommand::get_status()).await
    }

    /// Current settings and the plan of the active run.
    pub async fn parameters(&self) -> OdmrResult<ParametersUpdate> {
        self.query(OdmrCommand::get_parameters()).await
    }

    /// Latest published status without a round trip.
    pub fn current_status(&self) -> RunStatus {
        self.status.borrow().clone()
    }

    /// Status watch.
    pub fn watch_status(&self) -> watch::Receiver<RunStatus> {
        self.status.clone()
    }

    /// Plot snapshot watch, updated after every line.
    pub fn plots(&self) -> watch::Receiver<Arc<OdmrSnapshot>> {
        self.aggregator.subscribe_plots()
    }

    /// Copy of the current plot data.
    pub fn snapshot(&self) -> OdmrSnapshot {
        self.aggregator.snapshot()
    }

    /// Parameter, state, fit and elapsed-time notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<OdmrEvent> {
        self.aggregator.subscribe_events()
    }

    /// Observer refresh interval from `acquisition.query_interval_ms`.
    pub fn query_interval(&self) -> Duration {
        self.query_interval
    }

    /// Waits until the loop publishes `state`.
    pub async fn wait_for_state(&self, state: RunState, timeout: Duration) -> OdmrResult<RunStatus> {
        let mut rx = self.status.clone();
        let status = tokio::time::timeout(timeout, rx.wait_for(|s| s.state == state))
            .await
            .map_err(|_| {
                OdmrError::Timeout(format!("state {state} not reached within {timeout:?}"))
            })?
            .map_err(|_| OdmrError::ChannelClosed)?
            .clone();
        Ok(status)
    }

    /// Stops any run, tears the instruments down and ends the task.
    ///
    /// If the task has not exited within `shutdown_timeout_ms` it is aborted and
    /// `Timeout` is returned.
    pub async fn shutdown(self) -> OdmrResult<()> {
        let (cmd, reply) = OdmrCommand::shutdown();
        let sent = self.commands.send(cmd).await.is_ok();
        drop(self.commands);

        let mut task = self.task;
        match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
            Ok(Ok(())) if sent => reply.await.unwrap_or(Ok(())),
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(OdmrError::Fatal(format!("acquisition task panicked: {e}"))),
            Err(_) => {
                error!(
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    "acquisition task did not shut down, aborting"
                );
                task.abort();
                Err(OdmrError::Timeout(format!(
                    "shutdown did not complete within {:?}",
                    self.shutdown_timeout
                )))
            }
        }
    }
}
