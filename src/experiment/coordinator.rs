//! Instrument Coordinator.
//!
//! Starts, drives and tears down the microwave source, waveform generator and
//! gated photon counter in a fixed order, and translates driver failures into
//! [`OdmrError`] kinds.
//!
//! # Arming order
//!
//! 1. Upload: write + load the compiled waveform, `set_loops(average_factor × F)`
//! 2. Load list: `set_list`, keeping the values the source accepted
//! 3. Arm microwave: `set_ext_trigger`, then `list_on` or `sweep_on` per [`StepMode`]
//! 4. Arm counter: `set_length(average_factor × F × rep)`, `start`
//! 5. Enable laser
//!
//! # Teardown order
//!
//! Microwave off → pulser off → counter stop + clear → laser release. Teardown
//! runs every step even if an earlier one fails. The laser is only released if
//! this coordinator acquired it.
//!
//! # Retry policy
//!
//! Every driver call while arming or beginning a line is retried once after
//! `pulser_off` and a short settle. A second failure is `Fatal`.
//!
//! Counter reads are not retried call by call: once the generator is off a
//! partial buffer never fills. [`Coordinator::counter_ready`] and
//! [`Coordinator::fetch_counts`] report failures as `HardwareUnavailable` and
//! the caller restarts the whole line once with [`Coordinator::restart_line`].

use crate::error::{OdmrError, OdmrResult};
use crate::experiment::messages::{PulseSettings, SweepSettings};
use crate::experiment::planner::{self, Adjustment, DeviceLimits, PlannedSweep, SweepPlan};
use crate::experiment::pulses::{CompiledWaveform, PulseBuilder, PulseParams, PulseTiming};
use crate::hardware::capabilities::{GeneratorStatus, StepMode, TriggerPolarity};
use crate::hardware::{Instruments, LaserEnable};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};

/// Unit of the values written into the rolling matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CountUnit {
    /// Raw photon counts per gate
    #[default]
    Counts,
    /// Counts per second of gate time
    Rate,
}

/// Device-dependent settings of the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorSettings {
    pub limits: DeviceLimits,
    /// Trigger edge that advances the source
    pub polarity: TriggerPolarity,
    pub step_mode: StepMode,
    pub timing: PulseTiming,
    /// Waveform generator sample clock, Hz
    pub sample_rate: f64,
    /// Minimum duration of one externally triggered sweep, seconds
    pub min_sweep_time: f64,
    /// How long a line may wait for the counter after its sleep
    pub counter_timeout: Duration,
    /// Pause between `pulser_off` and a retry
    pub retry_settle: Duration,
    pub count_unit: CountUnit,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            limits: DeviceLimits::default(),
            polarity: TriggerPolarity::Rising,
            step_mode: StepMode::List,
            timing: PulseTiming::default(),
            sample_rate: 1.25e9,
            min_sweep_time: 2e-3,
            counter_timeout: Duration::from_secs(5),
            retry_settle: Duration::from_millis(100),
            count_unit: CountUnit::Counts,
        }
    }
}

/// Everything derived for one run before any instrument is touched.
#[derive(Debug, Clone)]
pub struct RunSetup {
    /// Sweep plan; replaced by the accepted values once the list is loaded
    pub plan: SweepPlan,
    pub adjustments: Vec<Adjustment>,
    pub params: PulseParams,
    pub waveform: CompiledWaveform,
    /// Sweeps per line
    pub average_factor: u64,
    /// Requested seconds per line
    pub single_sweep_time: f64,
}

impl RunSetup {
    /// Waveform repetitions per line.
    pub fn loops(&self) -> u64 {
        self.average_factor.saturating_mul(self.plan.len() as u64)
    }

    /// Counter bins per line.
    pub fn counter_bins(&self) -> usize {
        usize::try_from(self.loops())
            .unwrap_or(usize::MAX)
            .saturating_mul(self.params.rep_per_freq)
    }

    /// Nominal play time of one line, seconds.
    pub fn sweep_play_time(&self) -> f64 {
        self.loops() as f64 * self.waveform.total_pulse_length_seconds()
    }

    /// Time to wait for one line before reading the counter.
    pub fn line_duration(&self, overhead: Duration) -> Duration {
        Duration::try_from_secs_f64(self.line_wait_seconds())
            .unwrap_or(Duration::MAX)
            .saturating_add(overhead)
    }

    fn line_wait_seconds(&self) -> f64 {
        self.single_sweep_time.max(self.sweep_play_time())
    }

    /// Bin count without saturation; `None` if it does not fit in `usize`.
    fn checked_counter_bins(&self) -> Option<usize> {
        self.average_factor
            .checked_mul(self.plan.len() as u64)
            .and_then(|loops| usize::try_from(loops).ok())
            .and_then(|loops| loops.checked_mul(self.params.rep_per_freq))
    }
}

/// `max(1, floor(single_sweep_time / (total_pulse_length × F)))`.
pub fn average_factor(single_sweep_time: f64, total_pulse_length: f64, n_frequencies: usize) -> u64 {
    let per_sweep = total_pulse_length * n_frequencies as f64;
    if per_sweep <= 0.0 || !single_sweep_time.is_finite() {
        return 1;
    }
    ((single_sweep_time / per_sweep).floor() as u64).max(1)
}

/// One step of the arming sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmStep {
    UploadWaveform,
    LoadList,
    ArmMicrowave,
    ArmCounter,
    EnableLaser,
}

impl ArmStep {
    /// Steps in the order they must run.
    pub const SEQUENCE: [ArmStep; 5] = [
        ArmStep::UploadWaveform,
        ArmStep::LoadList,
        ArmStep::ArmMicrowave,
        ArmStep::ArmCounter,
        ArmStep::EnableLaser,
    ];
}

/// Serialises every driver call of a run.
pub struct Coordinator {
    instruments: Instruments,
    laser: LaserEnable,
    settings: CoordinatorSettings,
    builder: PulseBuilder,
    /// Set while this run holds the laser
    laser_held: AtomicBool,
}

impl Coordinator {
    /// Coordinator over `instruments`; nothing is touched until [`Coordinator::arm`].
    pub fn new(instruments: Instruments, laser: LaserEnable, settings: CoordinatorSettings) -> Self {
        let builder = PulseBuilder::new(settings.timing);
        Self {
            instruments,
            laser,
            settings,
            builder,
            laser_held: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    pub fn instruments(&self) -> &Instruments {
        &self.instruments
    }

    pub fn laser(&self) -> &LaserEnable {
        &self.laser
    }

    /// Clamps `sweep` to the source limits.
    pub fn plan_sweep(&self, sweep: &SweepSettings) -> OdmrResult<PlannedSweep> {
        planner::plan(&sweep.request(), &self.settings.limits, self.settings.polarity)
    }

    /// Compiles `pulses` at the configured sample rate.
    pub fn compile(&self, pulses: &PulseSettings) -> OdmrResult<CompiledWaveform> {
        self.builder.compile(&pulses.params(self.settings.sample_rate))
    }

    /// Plans, compiles and sizes a run. Pure: no instrument is touched.
    pub fn prepare(&self, sweep: &SweepSettings, pulses: &PulseSettings) -> OdmrResult<RunSetup> {
        if !sweep.single_sweep_time.is_finite() || sweep.single_sweep_time <= 0.0 {
            return Err(OdmrError::InvalidRequest(format!(
                "single_sweep_time must be positive, got {}",
                sweep.single_sweep_time
            )));
        }
        let PlannedSweep { plan, adjustments } = self.plan_sweep(sweep)?;
        let waveform = self.compile(pulses)?;
        let average_factor = average_factor(
            sweep.single_sweep_time,
            waveform.total_pulse_length_seconds(),
            plan.len(),
        );
        let setup = RunSetup {
            plan,
            adjustments,
            params: pulses.params(self.settings.sample_rate),
            waveform,
            average_factor,
            single_sweep_time: sweep.single_sweep_time,
        };
        if setup.checked_counter_bins().is_none() {
            return Err(OdmrError::InvalidRequest(format!(
                "single_sweep_time of {} s needs more counter bins than can be addressed",
                sweep.single_sweep_time
            )));
        }
        let wait = setup.line_wait_seconds();
        if Duration::try_from_secs_f64(wait)
            .ok()
            .and_then(|d| Instant::now().checked_add(d))
            .is_none()
        {
            return Err(OdmrError::InvalidRequest(format!(
                "line duration of {wait} s is out of range"
            )));
        }
        if setup.sweep_play_time() < self.settings.min_sweep_time {
            return Err(OdmrError::InvalidRequest(format!(
                "one sweep plays for {:.3e} s, below the {:.3e} s settling minimum",
                setup.sweep_play_time(),
                self.settings.min_sweep_time
            )));
        }
        debug!(
            points = setup.plan.len(),
            average_factor = setup.average_factor,
            samples = setup.waveform.samples_per_sweep(),
            "run prepared"
        );
        Ok(setup)
    }

    /// Runs the whole arming sequence.
    pub async fn arm(&self, setup: &mut RunSetup) -> OdmrResult<()> {
        for step in ArmStep::SEQUENCE {
            self.arm_step(step, setup).await?;
        }
        Ok(())
    }

    /// Runs one arming step. `LoadList` replaces the plan with the accepted values.
    pub async fn arm_step(&self, step: ArmStep, setup: &mut RunSetup) -> OdmrResult<()> {
        let hw = &self.instruments;
        debug!(?step, "arming");
        match step {
            ArmStep::UploadWaveform => {
                let padded = setup.waveform.padded_to(hw.generator.memory_granularity());
                if padded.samples_per_sweep() > self.settings.timing.device_max_samples {
                    return Err(OdmrError::InvalidRequest(format!(
                        "aligned waveform needs {} samples, device memory holds {}",
                        padded.samples_per_sweep(),
                        self.settings.timing.device_max_samples
                    )));
                }
                let handle = self
                    .with_retry("awg.write_waveform", || hw.generator.write_waveform(&padded))
                    .await?;
                self.with_retry("awg.load_waveform", || hw.generator.load_waveform(&handle))
                    .await?;
                let loops = setup.loops();
                self.with_retry("awg.set_loops", || hw.generator.set_loops(loops))
                    .await?;
                info!(
                    handle = %handle.0,
                    samples = padded.samples_per_sweep(),
                    loops,
                    "waveform uploaded"
                );
            }
            ArmStep::LoadList => {
                let power = setup.plan.power();
                let (frequencies, accepted_power) = self
                    .with_retry("mw.set_list", || {
                        hw.microwave.set_list(setup.plan.frequencies(), power)
                    })
                    .await?;
                setup.plan = setup.plan.with_accepted(frequencies, accepted_power)?;
                info!(
                    points = setup.plan.len(),
                    power = accepted_power,
                    "frequency list loaded"
                );
            }
            ArmStep::ArmMicrowave => {
                let polarity = setup.plan.polarity();
                self.with_retry("mw.set_ext_trigger", || hw.microwave.set_ext_trigger(polarity))
                    .await?;
                match self.settings.step_mode {
                    StepMode::List => {
                        self.with_retry("mw.list_on", || hw.microwave.list_on())
                            .await?
                    }
                    StepMode::Sweep => {
                        self.with_retry("mw.sweep_on", || hw.microwave.sweep_on())
                            .await?
                    }
                }
            }
            ArmStep::ArmCounter => {
                let bins = setup.counter_bins();
                self.with_retry("counter.set_length", || hw.counter.set_length(bins))
                    .await?;
                self.with_retry("counter.start", || hw.counter.start())
                    .await?;
                info!(bins, "counter armed");
            }
            ArmStep::EnableLaser => {
                self.laser.acquire()?;
                self.laser_held.store(true, Ordering::Release);
            }
        }
        Ok(())
    }

    /// Rewinds the instruments and starts playing one line.
    pub async fn begin_line(&self) -> OdmrResult<()> {
        let hw = &self.instruments;
        self.with_retry("counter.clear", || hw.counter.clear()).await?;
        match self.settings.step_mode {
            StepMode::List => {
                self.with_retry("mw.reset_listpos", || hw.microwave.reset_listpos())
                    .await?
            }
            StepMode::Sweep => {
                self.with_retry("mw.reset_sweeppos", || hw.microwave.reset_sweeppos())
                    .await?
            }
        }
        self.with_retry("awg.pulser_on", || hw.generator.pulser_on())
            .await
    }

    /// Stops playback, waits `retry_settle` and begins the line again.
    pub async fn restart_line(&self) -> OdmrResult<()> {
        if let Err(e) = self.instruments.generator.pulser_off().await {
            warn!(error = %format!("{e:#}"), "pulser_off before line restart failed");
        }
        sleep(self.settings.retry_settle).await;
        self.begin_line().await
    }

    /// Polls the counter once.
    pub async fn counter_ready(&self) -> OdmrResult<bool> {
        self.instruments
            .counter
            .ready()
            .await
            .map_err(|e| OdmrError::hardware("counter.ready", &e))
    }

    /// Reads the filled counter buffer, one value per bin.
    ///
    /// # Errors
    ///
    /// `HardwareUnavailable` if a driver call fails, `ProtocolViolation` if the
    /// counter returns the wrong number of bins.
    pub async fn fetch_counts(&self, setup: &RunSetup) -> OdmrResult<Vec<f64>> {
        let hw = &self.instruments;
        let expected = setup.counter_bins();
        let raw = hw
            .counter
            .get_data()
            .await
            .map_err(|e| OdmrError::hardware("counter.get_data", &e))?;
        if raw.len() != expected {
            return Err(OdmrError::ProtocolViolation(format!(
                "counter returned {} bins, expected {expected}",
                raw.len()
            )));
        }

        match self.settings.count_unit {
            CountUnit::Counts => Ok(raw.into_iter().map(|c| c as f64).collect()),
            CountUnit::Rate => {
                let widths = hw
                    .counter
                    .get_bin_widths()
                    .await
                    .map_err(|e| OdmrError::hardware("counter.get_bin_widths", &e))?;
                if widths.len() != expected || widths.contains(&0) {
                    return Err(OdmrError::ProtocolViolation(
                        "counter bin widths missing or zero".to_string(),
                    ));
                }
                Ok(raw
                    .iter()
                    .zip(&widths)
                    .map(|(c, w)| *c as f64 / (*w as f64 * 1e-12))
                    .collect())
            }
        }
    }

    /// Turns every instrument off and releases the laser.
    ///
    /// Every step runs even if an earlier one fails; any failure, or an
    /// instrument still reporting activity afterwards, yields `Fatal`.
    pub async fn teardown(&self) -> OdmrResult<()> {
        let hw = &self.instruments;
        let mut failures = Vec::new();

        if let Err(e) = hw.microwave.off().await {
            failures.push(format!("mw.off: {e:#}"));
        }
        if let Err(e) = hw.generator.pulser_off().await {
            failures.push(format!("awg.pulser_off: {e:#}"));
        }
        if let Err(e) = hw.counter.stop().await {
            failures.push(format!("counter.stop: {e:#}"));
        }
        if let Err(e) = hw.counter.clear().await {
            failures.push(format!("counter.clear: {e:#}"));
        }
        if self.laser_held.swap(false, Ordering::AcqRel) {
            self.laser.release();
        }

        match hw.microwave.status().await {
            Ok(status) if status.is_running => failures.push("microwave still running".to_string()),
            Ok(_) => {}
            Err(e) => failures.push(format!("mw.status: {e:#}")),
        }
        match hw.generator.status().await {
            Ok(GeneratorStatus::Playing) => failures.push("generator still playing".to_string()),
            Ok(GeneratorStatus::Ready) => {}
            Err(e) => failures.push(format!("awg.status: {e:#}")),
        }
        match hw.counter.is_armed().await {
            Ok(true) => failures.push("counter still armed".to_string()),
            Ok(false) => {}
            Err(e) => debug!(error = %format!("{e:#}"), "counter armed state not available"),
        }

        if failures.is_empty() {
            info!("instruments torn down");
            Ok(())
        } else {
            Err(OdmrError::Fatal(format!(
                "teardown failed: {}",
                failures.join("; ")
            )))
        }
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut call: F) -> OdmrResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let first = match call().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        warn!(operation, error = %format!("{first:#}"), "hardware call failed, retrying once");
        if let Err(e) = self.instruments.generator.pulser_off().await {
            warn!(error = %format!("{e:#}"), "pulser_off before retry failed");
        }
        sleep(self.settings.retry_settle).await;
        call().await.map_err(|second| {
            OdmrError::Fatal(OdmrError::hardware(operation, &second).to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::pulses::PulseMode;
    use crate::hardware::capabilities::MicrowaveMode;
    use crate::hardware::mock::SimulatedBench;
    use tracing_test::traced_test;

    fn sweep() -> SweepSettings {
        SweepSettings {
            start: 2.80e9,
            stop: 2.90e9,
            step: 10e6,
            power: -10.0,
            single_sweep_time: 1.0,
        }
    }

    fn cw_pulses() -> PulseSettings {
        PulseSettings {
            laser_readout_length: 350e-9,
            delay_length: 1e-6,
            pi_pulse_length: 100e-9,
            rep_per_freq: 100,
            mode: PulseMode::Cw,
        }
    }

    fn coordinator(bench: &SimulatedBench) -> Coordinator {
        Coordinator::new(
            bench.instruments(),
            LaserEnable::new(),
            CoordinatorSettings {
                retry_settle: Duration::from_millis(1),
                ..CoordinatorSettings::default()
            },
        )
    }

    #[test]
    fn test_average_factor() {
        assert_eq!(average_factor(1.0, 38_090e-9, 11), 2386);
        assert_eq!(average_factor(1e-6, 38_090e-9, 11), 1);
        assert_eq!(average_factor(1.0, 0.0, 11), 1);
    }

    #[test]
    fn test_prepare_tiny_cw_sweep() {
        let bench = SimulatedBench::new();
        let setup = coordinator(&bench).prepare(&sweep(), &cw_pulses()).unwrap();
        assert_eq!(setup.plan.len(), 11);
        assert_eq!(setup.average_factor, 2386);
        assert_eq!(setup.counter_bins(), 2386 * 11 * 100);
        assert!(setup.adjustments.is_empty());
        assert!(bench.calls().is_empty());
    }

    #[test]
    fn test_prepare_rejects_unaddressable_line() {
        let bench = SimulatedBench::new();
        let coord = coordinator(&bench);
        for single_sweep_time in [1e13, 1e20, f64::MAX] {
            let mut huge = sweep();
            huge.single_sweep_time = single_sweep_time;
            let err = coord.prepare(&huge, &cw_pulses()).unwrap_err();
            assert!(matches!(err, OdmrError::InvalidRequest(_)), "{single_sweep_time}");
        }
    }

    #[tokio::test]
    async fn test_restart_line_replays_after_read_failure() {
        let bench = SimulatedBench::new();
        let coord = coordinator(&bench);
        let mut short = sweep();
        short.single_sweep_time = 0.01;
        let mut setup = coord.prepare(&short, &cw_pulses()).unwrap();
        coord.arm(&mut setup).await.unwrap();
        coord.begin_line().await.unwrap();
        while !coord.counter_ready().await.unwrap() {
            sleep(Duration::from_millis(2)).await;
        }

        bench.fail_next("counter.get_data", 1);
        let err = coord.fetch_counts(&setup).await.unwrap_err();
        assert!(matches!(err, OdmrError::HardwareUnavailable { .. }));

        coord.restart_line().await.unwrap();
        while !coord.counter_ready().await.unwrap() {
            sleep(Duration::from_millis(2)).await;
        }
        let counts = coord.fetch_counts(&setup).await.unwrap();
        assert_eq!(counts.len(), setup.counter_bins());

        let calls = bench.calls();
        let failed = calls.iter().position(|c| c == "counter.get_data").unwrap();
        assert_eq!(
            &calls[failed + 1..failed + 5],
            ["awg.pulser_off", "counter.clear", "mw.reset_listpos", "awg.pulser_on"]
        );
    }

    #[test]
    fn test_prepare_enforces_minimum_play_time() {
        let bench = SimulatedBench::new();
        let mut short = sweep();
        short.single_sweep_time = 1e-3;
        let err = coordinator(&bench).prepare(&short, &cw_pulses()).unwrap_err();
        assert!(matches!(err, OdmrError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_arm_order_and_accepted_values() {
        let bench = SimulatedBench::new();
        let coord = coordinator(&bench);
        let mut setup = coord.prepare(&sweep(), &cw_pulses()).unwrap();
        coord.arm(&mut setup).await.unwrap();
        assert_eq!(
            bench.calls(),
            vec![
                "awg.write_waveform",
                "awg.load_waveform",
                "awg.set_loops",
                "mw.set_list",
                "mw.set_ext_trigger",
                "mw.list_on",
                "counter.set_length",
                "counter.start",
            ]
        );
        assert_eq!(bench.loops(), 2386 * 11);
        assert_eq!(bench.counter_length(), 2386 * 11 * 100);
        assert!(coord.laser().is_enabled());

        coord.teardown().await.unwrap();
        assert!(!bench.microwave_running());
        assert!(!bench.generator_playing());
        assert!(!bench.counter_armed());
        assert!(!coord.laser().is_enabled());
    }

    #[tokio::test]
    async fn test_sweep_step_mode() {
        let bench = SimulatedBench::new();
        let coord = Coordinator::new(
            bench.instruments(),
            LaserEnable::new(),
            CoordinatorSettings {
                step_mode: StepMode::Sweep,
                ..CoordinatorSettings::default()
            },
        );
        let mut setup = coord.prepare(&sweep(), &cw_pulses()).unwrap();
        coord.arm(&mut setup).await.unwrap();
        coord.begin_line().await.unwrap();

        let calls = bench.calls();
        assert!(calls.contains(&"mw.sweep_on".to_string()));
        assert!(calls.contains(&"mw.reset_sweeppos".to_string()));
        assert!(!calls.iter().any(|c| c == "mw.list_on" || c == "mw.reset_listpos"));
        let status = coord.instruments().microwave.status().await.unwrap();
        assert_eq!(status.mode, MicrowaveMode::Sweep);
        coord.teardown().await.unwrap();
    }

    #[tokio::test]
    #[traced_test]
    async fn test_single_retry_recovers() {
        let bench = SimulatedBench::new();
        let coord = coordinator(&bench);
        let mut setup = coord.prepare(&sweep(), &cw_pulses()).unwrap();
        bench.fail_next("mw.list_on", 1);
        coord.arm(&mut setup).await.unwrap();
        let calls = bench.calls();
        let retry = calls.iter().position(|c| c == "mw.list_on").unwrap();
        assert_eq!(calls[retry + 1], "awg.pulser_off");
        assert_eq!(calls[retry + 2], "mw.list_on");
        assert!(logs_contain("retrying once"));
        assert!(logs_contain("mw.list_on"));
    }

    #[tokio::test]
    async fn test_second_failure_is_fatal() {
        let bench = SimulatedBench::new();
        let coord = coordinator(&bench);
        let mut setup = coord.prepare(&sweep(), &cw_pulses()).unwrap();
        bench.fail_next("counter.start", 2);
        let err = coord.arm(&mut setup).await.unwrap_err();
        assert!(matches!(err, OdmrError::Fatal(_)));
        assert!(err.to_string().contains("counter.start"));
        assert!(!coord.laser().is_enabled());
    }

    #[tokio::test]
    async fn test_teardown_reports_every_failure() {
        let bench = SimulatedBench::new();
        let coord = coordinator(&bench);
        let mut setup = coord.prepare(&sweep(), &cw_pulses()).unwrap();
        coord.arm(&mut setup).await.unwrap();
        bench.fail_next("mw.off", 1);
        let err = coord.teardown().await.unwrap_err();
        assert!(matches!(err, OdmrError::Fatal(_)));
        assert!(err.to_string().contains("microwave still running"));
        assert!(bench.calls().contains(&"counter.clear".to_string()));
        assert!(!coord.laser().is_enabled());
    }

    #[tokio::test]
    async fn test_teardown_detects_armed_counter() {
        let bench = SimulatedBench::new();
        let coord = coordinator(&bench);
        let mut setup = coord.prepare(&sweep(), &cw_pulses()).unwrap();
        coord.arm(&mut setup).await.unwrap();
        bench.fail_next("counter.stop", 1);
        let err = coord.teardown().await.unwrap_err();
        assert!(err.to_string().contains("counter still armed"));
    }

    #[tokio::test]
    async fn test_teardown_leaves_foreign_laser_alone() {
        let bench = SimulatedBench::new();
        let coord = coordinator(&bench);
        coord.laser().acquire().unwrap();
        let mut setup = coord.prepare(&sweep(), &cw_pulses()).unwrap();
        let err = coord.arm(&mut setup).await.unwrap_err();
        assert!(matches!(err, OdmrError::HardwareUnavailable { .. }));
        coord.teardown().await.unwrap();
        assert!(coord.laser().is_enabled());
    }
}
