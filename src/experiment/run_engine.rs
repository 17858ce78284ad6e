//! Acquisition Loop.
//!
//! A single task owns the [`Coordinator`] and drives the [`RunState`] machine.
//! Observers talk to it only through [`OdmrCommand`]s; results flow out through
//! the [`Aggregator`] (latest plot snapshot, broadcast events) and a `watch` of the
//! current [`RunStatus`].
//!
//! # Per-line protocol
//!
//! ```text
//! begin_line ─> sleep(line duration) ─> poll counter ─> read ─> reduce ─> push row 0
//!    │               │                      │                              │
//!    │               └── commands handled, a stop ends the wait early      └─> time limit check
//! ```
//!
//! A failed counter call restarts the line once; a second failure is fatal.
//! Counter timeouts and short buffers end the run with a stop; any other failure
//! tears the instruments down and leaves the loop in `error` until cleared.

use crate::data::aggregator::Aggregator;
use crate::data::fit::FitRegistry;
use crate::data::storage::{RunContext, SavedOdmrRun, SnapshotStore};
use crate::error::{ErrorKind, OdmrError, OdmrResult};
use crate::experiment::coordinator::{ArmStep, Coordinator, RunSetup};
use crate::experiment::messages::{
    OdmrCommand, OdmrEvent, ParametersUpdate, PulseSettings, SweepSettings,
};
use crate::experiment::planner::Adjustment;
use crate::experiment::pulses::{effective_pi_pulse_length, PulseMode};
use crate::experiment::state::{RunEvent, RunState, RunStatus};
use chrono::{DateTime, Utc};
use ndarray::{Array3, Axis};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

const COUNTER_POLL: Duration = Duration::from_millis(10);

/// Reshapes raw bins into `(average_factor, n_frequencies, rep_per_freq)` and
/// averages over repetitions, then over averages.
///
/// # Errors
///
/// `ProtocolViolation` if the bin count does not match the shape or the result
/// contains non-finite or negative values.
pub fn reduce_line(
    raw: Vec<f64>,
    average_factor: usize,
    n_frequencies: usize,
    rep_per_freq: usize,
) -> OdmrResult<Vec<f64>> {
    let len = raw.len();
    let cube = Array3::from_shape_vec((average_factor, n_frequencies, rep_per_freq), raw)
        .map_err(|e| {
            OdmrError::ProtocolViolation(format!(
                "{len} bins do not form ({average_factor}, {n_frequencies}, {rep_per_freq}): {e}"
            ))
        })?;
    let line = cube
        .mean_axis(Axis(2))
        .and_then(|per_average| per_average.mean_axis(Axis(0)))
        .ok_or_else(|| OdmrError::ProtocolViolation("empty counter buffer".to_string()))?;
    if line.iter().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(OdmrError::ProtocolViolation(
            "line contains non-finite or negative values".to_string(),
        ));
    }
    Ok(line.to_vec())
}

/// Loop settings that are not instrument specific.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Added to the sweep duration before the counter is read
    pub line_overhead: Duration,
    /// `None` runs until stopped
    pub run_time_limit: Option<Duration>,
    pub store: SnapshotStore,
}

/// Elapsed run time excluding paused intervals.
#[derive(Debug, Clone, Copy)]
struct RunClock {
    started: Instant,
    paused_total: Duration,
    paused_at: Option<Instant>,
    stopped_at: Option<Instant>,
}

impl RunClock {
    fn start() -> Self {
        Self {
            started: Instant::now(),
            paused_total: Duration::ZERO,
            paused_at: None,
            stopped_at: None,
        }
    }

    fn pause(&mut self) {
        self.paused_at.get_or_insert_with(Instant::now);
    }

    fn resume(&mut self) {
        if let Some(at) = self.paused_at.take() {
            self.paused_total += at.elapsed();
        }
    }

    fn stop(&mut self) {
        self.resume();
        self.stopped_at.get_or_insert_with(Instant::now);
    }

    fn elapsed(&self) -> Duration {
        let end = self
            .stopped_at
            .or(self.paused_at)
            .unwrap_or_else(Instant::now);
        end.duration_since(self.started)
            .saturating_sub(self.paused_total)
    }
}

struct ActiveRun {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    sweep: SweepSettings,
    pulses: PulseSettings,
    setup: RunSetup,
    clock: RunClock,
    span: Span,
}

impl ActiveRun {
    fn context(&self, coordinator: &Coordinator) -> RunContext {
        RunContext {
            run_id: self.run_id,
            started_at: self.started_at,
            sweep: self.sweep,
            frequencies: self.setup.plan.frequencies().to_vec(),
            power: self.setup.plan.power(),
            pulses: self.pulses,
            effective_pi_pulse_length: self.setup.waveform.effective_pi_pulse_length(),
            average_factor: self.setup.average_factor,
            mw_trigger_polarity: self.setup.plan.polarity(),
            clock_frequency: self.setup.params.sample_rate,
            count_unit: coordinator.settings().count_unit,
        }
    }
}

/// The acquisition task. Consumed by [`RunEngine::run`].
pub struct RunEngine {
    coordinator: Coordinator,
    aggregator: Arc<Aggregator>,
    fits: Arc<FitRegistry>,
    commands: mpsc::Receiver<OdmrCommand>,
    status: watch::Sender<RunStatus>,
    settings: EngineSettings,
    sweep: SweepSettings,
    pulses: PulseSettings,
    adjustments: Vec<Adjustment>,
    run: Option<ActiveRun>,
    stop_reason: Option<String>,
    exit_requested: bool,
    shutdown_reply: Option<oneshot::Sender<OdmrResult<()>>>,
}

impl RunEngine {
    pub fn new(
        coordinator: Coordinator,
        aggregator: Arc<Aggregator>,
        commands: mpsc::Receiver<OdmrCommand>,
        status: watch::Sender<RunStatus>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            coordinator,
            aggregator,
            fits: Arc::new(FitRegistry::with_builtin()),
            commands,
            status,
            settings,
            sweep: SweepSettings::default(),
            pulses: PulseSettings::default(),
            adjustments: Vec::new(),
            run: None,
            stop_reason: None,
            exit_requested: false,
            shutdown_reply: None,
        }
    }

    /// Initial sweep and pulse settings, used until the observer changes them.
    pub fn with_parameters(mut self, sweep: SweepSettings, pulses: PulseSettings) -> Self {
        self.sweep = sweep;
        self.pulses = pulses;
        self
    }

    pub fn with_fits(mut self, fits: FitRegistry) -> Self {
        self.fits = Arc::new(fits);
        self
    }

    /// Runs until shut down or until every command sender is dropped.
    pub async fn run(mut self) {
        info!("acquisition loop started");
        loop {
            if self.exit_requested && !self.state().is_running() {
                break;
            }
            match self.state() {
                RunState::Idle | RunState::Error | RunState::Paused => self.wait_for_command().await,
                RunState::Arming => {
                    let span = self.run_span();
                    self.arm().instrument(span).await;
                }
                RunState::Running => {
                    let span = self.run_span();
                    self.acquire_line().instrument(span).await;
                }
                RunState::Stopping => {
                    let span = self.run_span();
                    self.finish_stop().instrument(span).await;
                }
            }
        }

        let status = self.status.borrow().clone();
        if let Some(reply) = self.shutdown_reply.take() {
            let result = match status.state {
                RunState::Error => Err(OdmrError::Fatal(
                    status.reason.unwrap_or_else(|| "run ended in error".to_string()),
                )),
                _ => Ok(()),
            };
            let _ = reply.send(result);
        }
        info!("acquisition loop exited");
    }

    fn state(&self) -> RunState {
        self.status.borrow().state
    }

    fn run_span(&self) -> Span {
        self.run
            .as_ref()
            .map(|run| run.span.clone())
            .unwrap_or_else(Span::none)
    }

    // -------------------------------------------------------------------------
    // State transitions
    // -------------------------------------------------------------------------

    fn transition(&mut self, event: RunEvent, reason: Option<String>) -> OdmrResult<RunState> {
        let next = self.state().apply(event)?;
        self.status.send_replace(RunStatus {
            state: next,
            reason: reason.clone(),
        });
        info!(state = %next, ?event, reason = reason.as_deref().unwrap_or(""), "run state changed");
        self.aggregator.notify(OdmrEvent::StateChanged {
            state: next,
            is_running: next.is_running(),
            reason,
        });
        Ok(next)
    }

    /// Transition taken by the loop itself; an illegal one is logged, not raised.
    fn advance(&mut self, event: RunEvent, reason: Option<String>) {
        if let Err(e) = self.transition(event, reason) {
            error!(error = %e, ?event, "internal state transition rejected");
        }
    }

    fn request_stop(&mut self, reason: Option<String>) -> OdmrResult<()> {
        match self.state() {
            RunState::Idle | RunState::Stopping | RunState::Error => Ok(()),
            _ => {
                self.transition(RunEvent::StopRequested, None)?;
                self.stop_reason = reason;
                Ok(())
            }
        }
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    async fn wait_for_command(&mut self) {
        match self.commands.recv().await {
            Some(cmd) => self.handle_command(cmd),
            None => self.on_commands_closed(),
        }
    }

    /// Handles every queued command without waiting.
    fn drain_commands(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(cmd) => self.handle_command(cmd),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.on_commands_closed();
                    break;
                }
            }
        }
    }

    fn on_commands_closed(&mut self) {
        if !self.exit_requested {
            info!("all command senders dropped, shutting down");
        }
        self.exit_requested = true;
        if let Err(e) = self.request_stop(Some("observer disconnected".to_string())) {
            debug!(error = %e, "no stop needed on disconnect");
        }
    }

    fn handle_command(&mut self, cmd: OdmrCommand) {
        match cmd {
            OdmrCommand::Start { response } => {
                let _ = response.send(self.start_run());
            }
            OdmrCommand::Stop { response } => {
                let _ = response.send(self.request_stop(None));
            }
            OdmrCommand::Pause { response } => {
                let result = self.transition(RunEvent::PauseRequested, None).map(|_| {
                    if let Some(run) = &mut self.run {
                        run.clock.pause();
                    }
                });
                let _ = response.send(result);
            }
            OdmrCommand::Continue { response } => {
                let result = self.transition(RunEvent::ContinueRequested, None).map(|_| {
                    if let Some(run) = &mut self.run {
                        run.clock.resume();
                    }
                });
                let _ = response.send(result);
            }
            OdmrCommand::ClearMatrix { response } => {
                if matches!(self.state(), RunState::Running | RunState::Arming) {
                    self.aggregator.request_clear();
                } else {
                    self.aggregator.clear_now();
                }
                let _ = response.send(Ok(()));
            }
            OdmrCommand::ClearError { response } => {
                let result = self.transition(RunEvent::ClearError, None).map(|_| ());
                let _ = response.send(result);
            }
            OdmrCommand::Save { tag, response } => self.save(tag, response),
            OdmrCommand::SetSweep { sweep, response } => {
                let _ = response.send(self.set_sweep(sweep));
            }
            OdmrCommand::SetPulses { pulses, response } => {
                let _ = response.send(self.set_pulses(pulses));
            }
            OdmrCommand::SetLinesToAverage { lines, response } => {
                self.aggregator.set_lines_to_average(lines);
                self.publish_parameters();
                let _ = response.send(Ok(()));
            }
            OdmrCommand::SetRollingCapacity { capacity, response } => {
                let result = self.aggregator.set_rolling_capacity(capacity);
                if result.is_ok() {
                    self.publish_parameters();
                }
                let _ = response.send(result);
            }
            OdmrCommand::Fit {
                name,
                data,
                response,
            } => self.spawn_fit(name, data, response),
            OdmrCommand::GetStatus { response } => {
                let _ = response.send(self.status.borrow().clone());
            }
            OdmrCommand::GetParameters { response } => {
                let _ = response.send(self.parameters());
            }
            OdmrCommand::Shutdown { response } => {
                self.exit_requested = true;
                if let Err(e) = self.request_stop(Some("shutdown".to_string())) {
                    debug!(error = %e, "no stop needed on shutdown");
                }
                self.shutdown_reply = Some(response);
            }
        }
    }

    fn start_run(&mut self) -> OdmrResult<()> {
        // Refuse before planning so a busy loop never replans.
        self.state().apply(RunEvent::StartRequested)?;
        let setup = self.coordinator.prepare(&self.sweep, &self.pulses)?;
        self.adjustments = setup.adjustments.clone();
        if !self.adjustments.is_empty() {
            info!(count = self.adjustments.len(), "sweep adjusted to device limits");
        }

        let run_id = Uuid::new_v4();
        let span = info_span!("odmr_run", run_id = %run_id);
        span.in_scope(|| {
            info!(
                points = setup.plan.len(),
                average_factor = setup.average_factor,
                mode = ?self.pulses.mode,
                "run planned"
            );
        });
        self.run = Some(ActiveRun {
            run_id,
            started_at: Utc::now(),
            sweep: self.sweep,
            pulses: self.pulses,
            setup,
            clock: RunClock::start(),
            span,
        });
        self.stop_reason = None;
        self.publish_parameters();
        self.transition(RunEvent::StartRequested, None)?;
        Ok(())
    }

    fn set_sweep(&mut self, sweep: SweepSettings) -> OdmrResult<SweepSettings> {
        let state = self.state();
        if !state.accepts_parameter_updates() {
            return Err(OdmrError::busy(state, "set sweep"));
        }
        if !sweep.single_sweep_time.is_finite() || sweep.single_sweep_time <= 0.0 {
            return Err(OdmrError::InvalidRequest(format!(
                "single_sweep_time must be positive, got {}",
                sweep.single_sweep_time
            )));
        }
        let planned = self.coordinator.plan_sweep(&sweep)?;
        let corrected = SweepSettings {
            start: planned.plan.start(),
            stop: planned.plan.stop(),
            step: planned.plan.step(),
            power: planned.plan.power(),
            single_sweep_time: sweep.single_sweep_time,
        };
        self.sweep = corrected;
        self.adjustments = planned.adjustments;
        self.publish_parameters();
        Ok(corrected)
    }

    fn set_pulses(&mut self, pulses: PulseSettings) -> OdmrResult<PulseSettings> {
        let state = self.state();
        if !state.accepts_parameter_updates() {
            return Err(OdmrError::busy(state, "set pulses"));
        }
        self.coordinator.compile(&pulses)?;
        self.pulses = pulses;
        self.publish_parameters();
        Ok(pulses)
    }

    fn parameters(&self) -> ParametersUpdate {
        let armed = self
            .run
            .as_ref()
            .filter(|_| !matches!(self.state(), RunState::Arming));
        ParametersUpdate {
            sweep: self.sweep,
            pulses: self.pulses,
            adjustments: self.adjustments.clone(),
            frequencies: armed.map(|run| run.setup.plan.frequencies().to_vec()),
            average_factor: self.run.as_ref().map(|run| run.setup.average_factor),
            effective_pi_pulse_length: match self.pulses.mode {
                PulseMode::Pulsed => Some(effective_pi_pulse_length(self.pulses.pi_pulse_length)),
                PulseMode::Cw => None,
            },
            lines_to_average: self.aggregator.lines_to_average(),
            rolling_capacity: self.aggregator.rolling_capacity(),
        }
    }

    fn publish_parameters(&self) {
        self.aggregator
            .notify(OdmrEvent::ParametersUpdated(Box::new(self.parameters())));
    }

    fn save(&self, tag: String, response: oneshot::Sender<OdmrResult<PathBuf>>) {
        let Some(run) = &self.run else {
            let _ = response.send(Err(OdmrError::InvalidRequest(
                "no run has been started, nothing to save".to_string(),
            )));
            return;
        };
        let (snapshot, fit) = self.aggregator.snapshot_with_fit();
        let record = SavedOdmrRun::new(&tag, run.context(&self.coordinator), snapshot, fit);
        let store = self.settings.store.clone();
        tokio::task::spawn_blocking(move || {
            let _ = response.send(store.save(&record));
        });
    }

    fn spawn_fit(
        &self,
        name: String,
        data: Option<(Vec<f64>, Vec<f64>)>,
        response: oneshot::Sender<OdmrResult<crate::data::fit::FitResult>>,
    ) {
        let (x, y) = data.unwrap_or_else(|| {
            let snapshot = self.aggregator.snapshot();
            (snapshot.frequencies, snapshot.mean)
        });
        let fits = Arc::clone(&self.fits);
        let aggregator = Arc::clone(&self.aggregator);
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || fits.fit(&name, &x, &y))
                .await
                .unwrap_or_else(|e| Err(OdmrError::Fatal(format!("fit task failed: {e}"))));
            if let Ok(fit) = &result {
                aggregator.set_fit(fit.clone());
            }
            let _ = response.send(result);
        });
    }

    // -------------------------------------------------------------------------
    // Run phases
    // -------------------------------------------------------------------------

    async fn arm(&mut self) {
        let Some(mut run) = self.run.take() else {
            self.advance(RunEvent::SetupFailed, Some("no run prepared".to_string()));
            return;
        };

        for step in ArmStep::SEQUENCE {
            self.drain_commands();
            if self.state() != RunState::Arming {
                info!(?step, "arming interrupted");
                self.run = Some(run);
                return;
            }
            if let Err(e) = self.coordinator.arm_step(step, &mut run.setup).await {
                error!(?step, error = %e, "arming failed, tearing down");
                let reason = match self.coordinator.teardown().await {
                    Ok(()) => e.to_string(),
                    Err(t) => format!("{e}; {t}"),
                };
                self.run = Some(run);
                self.advance(RunEvent::SetupFailed, Some(reason));
                return;
            }
        }

        self.aggregator
            .begin_run(run.setup.plan.frequencies().to_vec());
        run.clock = RunClock::start();
        self.run = Some(run);
        self.publish_parameters();
        self.advance(RunEvent::SetupSucceeded, None);
    }

    async fn acquire_line(&mut self) {
        let Some(duration) = self
            .run
            .as_ref()
            .map(|run| run.setup.line_duration(self.settings.line_overhead))
        else {
            self.advance(RunEvent::FatalFailure, Some("running without a run".to_string()));
            return;
        };

        if let Err(e) = self.coordinator.begin_line().await {
            return self.fail(e).await;
        }
        self.sleep_with_commands(duration).await;
        if self.state() == RunState::Stopping {
            return;
        }

        let line = match self.collect_line(duration).await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "line discarded, stopping run");
                if let Err(stop) = self.request_stop(Some(e.to_string())) {
                    error!(error = %stop, "could not stop after discarded line");
                }
                return;
            }
            Err(e) => return self.fail(e).await,
        };

        let elapsed = self.elapsed();
        match self.aggregator.push_line(&line, elapsed.as_secs_f64()) {
            Ok(outcome) => debug!(
                line = outcome.elapsed_lines,
                elapsed_s = elapsed.as_secs_f64(),
                cleared = outcome.cleared,
                "line acquired"
            ),
            Err(e) => {
                warn!(error = %e, "line rejected, stopping run");
                if let Err(stop) = self.request_stop(Some(e.to_string())) {
                    error!(error = %stop, "could not stop after rejected line");
                }
                return;
            }
        }

        if let Some(limit) = self.settings.run_time_limit {
            if elapsed >= limit && self.state() == RunState::Running {
                info!(limit_s = limit.as_secs_f64(), "run time limit reached");
                if let Err(e) = self.request_stop(Some("run time limit reached".to_string())) {
                    error!(error = %e, "could not stop at run time limit");
                }
            }
        }
    }

    /// Reads one line, restarting it once if a counter call fails.
    ///
    /// `Ok(None)` means a stop arrived while waiting.
    async fn collect_line(&mut self, line_duration: Duration) -> OdmrResult<Option<Vec<f64>>> {
        let mut restarted = false;
        loop {
            match self.read_line().await {
                Err(e) if e.kind() == ErrorKind::HardwareUnavailable => {
                    if restarted {
                        return Err(OdmrError::Fatal(e.to_string()));
                    }
                    warn!(error = %e, "counter read failed, restarting line once");
                    restarted = true;
                    self.coordinator.restart_line().await?;
                    self.sleep_with_commands(line_duration).await;
                    if self.state() == RunState::Stopping {
                        return Ok(None);
                    }
                }
                other => return other,
            }
        }
    }

    /// Polls the counter until it is full, handling commands between polls,
    /// then reads and reduces the buffer.
    async fn read_line(&mut self) -> OdmrResult<Option<Vec<f64>>> {
        let timeout = self.coordinator.settings().counter_timeout;
        let deadline = Instant::now() + timeout;
        while !self.coordinator.counter_ready().await? {
            if Instant::now() >= deadline {
                return Err(OdmrError::Timeout(format!(
                    "counter not ready after {} ms",
                    timeout.as_millis()
                )));
            }
            self.sleep_with_commands(COUNTER_POLL).await;
            if self.state() == RunState::Stopping {
                return Ok(None);
            }
        }

        let run = self
            .run
            .as_ref()
            .ok_or_else(|| OdmrError::Fatal("running without a run".to_string()))?;
        let setup = &run.setup;
        let raw = self.coordinator.fetch_counts(setup).await?;
        reduce_line(
            raw,
            setup.average_factor as usize,
            setup.plan.len(),
            setup.params.rep_per_freq,
        )
        .map(Some)
    }

    /// Sleeps until `duration` has passed, handling commands meanwhile. A stop
    /// ends the sleep immediately.
    async fn sleep_with_commands(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            if self.state() == RunState::Stopping {
                return;
            }
            tokio::select! {
                _ = sleep_until(deadline) => return,
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => self.on_commands_closed(),
                },
            }
        }
    }

    async fn finish_stop(&mut self) {
        let result = self.coordinator.teardown().await;
        let elapsed = {
            if let Some(run) = &mut self.run {
                run.clock.stop();
            }
            self.elapsed()
        };
        self.aggregator.set_elapsed_time(elapsed.as_secs_f64());
        self.aggregator.publish_plots();
        match result {
            Ok(()) => {
                let reason = self.stop_reason.take();
                self.advance(RunEvent::TeardownComplete, reason);
            }
            Err(e) => {
                error!(error = %e, "teardown failed");
                self.advance(RunEvent::FatalFailure, Some(e.to_string()));
            }
        }
    }

    async fn fail(&mut self, err: OdmrError) {
        error!(error = %err, "run failed, tearing down");
        let reason = match self.coordinator.teardown().await {
            Ok(()) => err.to_string(),
            Err(t) => format!("{err}; {t}"),
        };
        if let Some(run) = &mut self.run {
            run.clock.stop();
        }
        self.aggregator.publish_plots();
        self.advance(RunEvent::FatalFailure, Some(reason));
    }

    fn elapsed(&self) -> Duration {
        self.run
            .as_ref()
            .map(|run| run.clock.elapsed())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce_means_reps_then_averages() {
        // average 0: f0 reps [1, 3], f1 reps [5, 7]; average 1: f0 [3, 5], f1 [7, 9]
        let raw = vec![1.0, 3.0, 5.0, 7.0, 3.0, 5.0, 7.0, 9.0];
        assert_eq!(reduce_line(raw, 2, 2, 2).unwrap(), vec![3.0, 7.0]);
    }

    #[test]
    fn test_reduce_single_rep() {
        let raw = vec![2.0, 4.0, 6.0, 4.0, 6.0, 8.0];
        assert_eq!(reduce_line(raw, 2, 3, 1).unwrap(), vec![3.0, 5.0, 7.0]);
    }

    #[test]
    fn test_reduce_rejects_wrong_shape() {
        let err = reduce_line(vec![1.0; 7], 2, 2, 2).unwrap_err();
        assert!(matches!(err, OdmrError::ProtocolViolation(_)));
        let err = reduce_line(vec![f64::NAN; 4], 1, 2, 2).unwrap_err();
        assert!(matches!(err, OdmrError::ProtocolViolation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_excludes_pauses() {
        let mut clock = RunClock::start();
        tokio::time::advance(Duration::from_secs(2)).await;
        clock.pause();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(clock.elapsed(), Duration::from_secs(2));
        clock.resume();
        tokio::time::advance(Duration::from_secs(1)).await;
        clock.stop();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(clock.elapsed(), Duration::from_secs(3));
    }
}
