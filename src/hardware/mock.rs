//! Simulated Pulsed-ODMR Bench
//!
//! Provides a microwave source, waveform generator and gated photon counter that
//! share one simulated optical table, so the counter only fills once the
//! generator has actually played the configured number of loops.
//! All timing uses `tokio::time`, never `std::thread::sleep`.
//!
//! # Signal Model
//!
//! Each waveform pass is one frequency step. Every readout gate inside a pass
//! produces one counter bin whose counts follow a Lorentzian dip centred at
//! 2.87 GHz with uniform noise.
//!
//! # Fault Injection
//!
//! - [`SimulatedBench::fail_next`] makes the next `n` calls of one operation fail
//! - [`SimulatedBench::set_counter_never_ready`] simulates a missing marker line
//! - [`SimulatedBench::set_short_buffer`] drops the last bin of every readout
//! - [`SimulatedBench::set_setup_delay`] slows down `set_list`
//!
//! # Example
//!
//! ```rust,ignore
//! let bench = SimulatedBench::new();
//! let instruments = bench.instruments();
//! bench.fail_next("mw.list_on", 1);
//! ```

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

use crate::experiment::pulses::{CompiledWaveform, DigitalChannel};
use crate::hardware::capabilities::{
    GatedPhotonCounter, GeneratorStatus, MicrowaveMode, MicrowaveSource, MicrowaveStatus,
    TriggerPolarity, WaveformGenerator, WaveformHandle,
};
use crate::hardware::Instruments;

/// Zero-field splitting of the NV centre.
pub const DIP_CENTER_HZ: f64 = 2.87e9;
const DIP_WIDTH_HZ: f64 = 8e6;
const DIP_CONTRAST: f64 = 0.3;
const BASE_COUNTS: f64 = 1000.0;

// =============================================================================
// Shared bench state
// =============================================================================

#[derive(Debug, Clone)]
struct StoredWaveform {
    handle: WaveformHandle,
    /// Pass duration in seconds
    duration: f64,
    gates_per_pass: usize,
    gate_width_ps: u64,
}

struct BenchState {
    // microwave
    list: Vec<f64>,
    power: f64,
    polarity: TriggerPolarity,
    mw_mode: MicrowaveMode,
    mw_running: bool,
    list_position: usize,
    // waveform generator
    stored: HashMap<String, StoredWaveform>,
    loaded: Option<StoredWaveform>,
    loops: u64,
    playing: bool,
    play_started: Option<Instant>,
    pass_offset: usize,
    next_handle: u64,
    granularity: usize,
    // counter
    n_bins: usize,
    armed: bool,
    /// Buffer completed by a finished playback, kept until cleared
    buffer_full: bool,
    // faults and bookkeeping
    failures: HashMap<String, u32>,
    counter_never_ready: bool,
    short_buffer: bool,
    setup_delay: Duration,
    calls: Vec<String>,
    rng: StdRng,
}

impl BenchState {
    fn new(seed: u64) -> Self {
        Self {
            list: Vec::new(),
            power: 0.0,
            polarity: TriggerPolarity::Rising,
            mw_mode: MicrowaveMode::Cw,
            mw_running: false,
            list_position: 0,
            stored: HashMap::new(),
            loaded: None,
            loops: 1,
            playing: false,
            play_started: None,
            pass_offset: 0,
            next_handle: 0,
            granularity: 32,
            n_bins: 0,
            armed: false,
            buffer_full: false,
            failures: HashMap::new(),
            counter_never_ready: false,
            short_buffer: false,
            setup_delay: Duration::ZERO,
            calls: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Records the call and consumes one injected failure, if any.
    fn enter(&mut self, op: &str) -> Result<()> {
        self.calls.push(op.to_string());
        if let Some(remaining) = self.failures.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(anyhow!("simulated failure in {op}"));
            }
        }
        Ok(())
    }

    fn play_duration(&self) -> Option<Duration> {
        let wf = self.loaded.as_ref()?;
        Some(Duration::from_secs_f64(wf.duration * self.loops as f64))
    }

    fn playback_complete(&self) -> bool {
        match (self.play_started, self.play_duration()) {
            (Some(started), Some(duration)) => started.elapsed() >= duration,
            _ => false,
        }
    }

    fn counter_full(&self) -> bool {
        self.armed
            && !self.counter_never_ready
            && (self.buffer_full || (self.playing && self.playback_complete()))
    }

    fn partially_filled(&self) -> bool {
        self.armed && self.playing && !self.playback_complete()
    }
}

/// Lorentzian fluorescence dip.
pub fn dip_profile(frequency: f64) -> f64 {
    let x = (frequency - DIP_CENTER_HZ) / (DIP_WIDTH_HZ / 2.0);
    1.0 - DIP_CONTRAST / (1.0 + x * x)
}

/// A microwave source, waveform generator and photon counter on one table.
#[derive(Clone)]
pub struct SimulatedBench {
    state: Arc<Mutex<BenchState>>,
}

impl SimulatedBench {
    pub fn new() -> Self {
        Self::with_seed(0x0D3A)
    }

    /// Bench with a fixed noise seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(BenchState::new(seed))),
        }
    }

    /// Trait-object handles to the three instruments.
    pub fn instruments(&self) -> Instruments {
        Instruments {
            microwave: Arc::new(MockMicrowave {
                state: Arc::clone(&self.state),
            }),
            generator: Arc::new(MockAwg {
                state: Arc::clone(&self.state),
            }),
            counter: Arc::new(MockCounter {
                state: Arc::clone(&self.state),
            }),
        }
    }

    /// Makes the next `times` calls of `op` fail (e.g. `"mw.list_on"`).
    pub fn fail_next(&self, op: &str, times: u32) {
        self.state.lock().failures.insert(op.to_string(), times);
    }

    pub fn set_counter_never_ready(&self, never: bool) {
        self.state.lock().counter_never_ready = never;
    }

    pub fn set_short_buffer(&self, short: bool) {
        self.state.lock().short_buffer = short;
    }

    pub fn set_setup_delay(&self, delay: Duration) {
        self.state.lock().setup_delay = delay;
    }

    pub fn set_memory_granularity(&self, granularity: usize) {
        self.state.lock().granularity = granularity.max(1);
    }

    /// Every instrument call made so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn microwave_running(&self) -> bool {
        self.state.lock().mw_running
    }

    /// Loaded list and power as accepted by the source.
    pub fn microwave_list(&self) -> (Vec<f64>, f64) {
        let s = self.state.lock();
        (s.list.clone(), s.power)
    }

    pub fn trigger_polarity(&self) -> TriggerPolarity {
        self.state.lock().polarity
    }

    pub fn generator_playing(&self) -> bool {
        self.state.lock().playing
    }

    pub fn counter_armed(&self) -> bool {
        self.state.lock().armed
    }

    pub fn loops(&self) -> u64 {
        self.state.lock().loops
    }

    pub fn counter_length(&self) -> usize {
        self.state.lock().n_bins
    }
}

impl Default for SimulatedBench {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// MockMicrowave - list/sweep source
// =============================================================================

/// Simulated source; accepted frequencies are quantised to 1 Hz and power to 0.01 dB.
pub struct MockMicrowave {
    state: Arc<Mutex<BenchState>>,
}

#[async_trait]
impl MicrowaveSource for MockMicrowave {
    async fn set_list(&self, frequencies: &[f64], power: f64) -> Result<(Vec<f64>, f64)> {
        let delay = {
            let mut s = self.state.lock();
            s.enter("mw.set_list")?;
            s.setup_delay
        };
        if !delay.is_zero() {
            sleep(delay).await;
        }
        if frequencies.is_empty() {
            anyhow::bail!("MockMicrowave: empty frequency list");
        }
        let accepted: Vec<f64> = frequencies.iter().map(|f| f.round()).collect();
        let power = (power * 100.0).round() / 100.0;
        let mut s = self.state.lock();
        s.list = accepted.clone();
        s.power = power;
        s.list_position = 0;
        debug!(points = accepted.len(), power, "MockMicrowave: list loaded");
        Ok((accepted, power))
    }

    async fn set_ext_trigger(&self, polarity: TriggerPolarity) -> Result<()> {
        let mut s = self.state.lock();
        s.enter("mw.set_ext_trigger")?;
        s.polarity = polarity;
        Ok(())
    }

    async fn list_on(&self) -> Result<()> {
        let mut s = self.state.lock();
        s.enter("mw.list_on")?;
        if s.list.is_empty() {
            anyhow::bail!("MockMicrowave: no list loaded");
        }
        s.mw_mode = MicrowaveMode::List;
        s.mw_running = true;
        Ok(())
    }

    async fn sweep_on(&self) -> Result<()> {
        let mut s = self.state.lock();
        s.enter("mw.sweep_on")?;
        if s.list.is_empty() {
            anyhow::bail!("MockMicrowave: no sweep points loaded");
        }
        s.mw_mode = MicrowaveMode::Sweep;
        s.mw_running = true;
        Ok(())
    }

    async fn reset_listpos(&self) -> Result<()> {
        let mut s = self.state.lock();
        s.enter("mw.reset_listpos")?;
        s.list_position = 0;
        Ok(())
    }

    async fn reset_sweeppos(&self) -> Result<()> {
        let mut s = self.state.lock();
        s.enter("mw.reset_sweeppos")?;
        s.list_position = 0;
        Ok(())
    }

    async fn off(&self) -> Result<()> {
        let mut s = self.state.lock();
        s.enter("mw.off")?;
        s.mw_running = false;
        s.mw_mode = MicrowaveMode::Cw;
        Ok(())
    }

    async fn status(&self) -> Result<MicrowaveStatus> {
        let s = self.state.lock();
        Ok(MicrowaveStatus {
            mode: s.mw_mode,
            is_running: s.mw_running,
        })
    }
}

// =============================================================================
// MockAwg - waveform generator
// =============================================================================

/// Simulated generator; playback of `loops` passes takes real (tokio) time.
pub struct MockAwg {
    state: Arc<Mutex<BenchState>>,
}

#[async_trait]
impl WaveformGenerator for MockAwg {
    async fn write_waveform(&self, waveform: &CompiledWaveform) -> Result<WaveformHandle> {
        let mut s = self.state.lock();
        s.enter("awg.write_waveform")?;
        let samples = waveform.samples_per_sweep();
        if samples % s.granularity != 0 {
            anyhow::bail!(
                "MockAwg: {samples} samples is not a multiple of {}",
                s.granularity
            );
        }
        let gates = waveform.high_intervals(DigitalChannel::ReadoutGate);
        let gate_width_ps = gates
            .first()
            .map(|g| (g.len() as f64 / waveform.sample_rate() * 1e12).round() as u64)
            .unwrap_or(0);
        s.next_handle += 1;
        let handle = WaveformHandle(format!("odmr_{}", s.next_handle));
        let stored = StoredWaveform {
            handle: handle.clone(),
            duration: samples as f64 / waveform.sample_rate(),
            gates_per_pass: gates.len(),
            gate_width_ps,
        };
        s.stored.insert(handle.0.clone(), stored);
        Ok(handle)
    }

    async fn load_waveform(&self, handle: &WaveformHandle) -> Result<()> {
        let mut s = self.state.lock();
        s.enter("awg.load_waveform")?;
        let wf = s
            .stored
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| anyhow!("MockAwg: unknown waveform {}", handle.0))?;
        debug!(handle = %wf.handle.0, "MockAwg: waveform loaded");
        s.loaded = Some(wf);
        Ok(())
    }

    async fn set_loops(&self, loops: u64) -> Result<()> {
        let mut s = self.state.lock();
        s.enter("awg.set_loops")?;
        if loops == 0 {
            anyhow::bail!("MockAwg: loop count must be positive");
        }
        s.loops = loops;
        Ok(())
    }

    async fn pulser_on(&self) -> Result<()> {
        let mut s = self.state.lock();
        s.enter("awg.pulser_on")?;
        if s.loaded.is_none() {
            anyhow::bail!("MockAwg: no waveform loaded");
        }
        s.buffer_full = false;
        let passes = s.list.len().max(1);
        s.pass_offset = s.list_position;
        s.list_position = (s.list_position + (s.loops as usize % passes)) % passes;
        s.playing = true;
        s.play_started = Some(Instant::now());
        Ok(())
    }

    async fn pulser_off(&self) -> Result<()> {
        let mut s = self.state.lock();
        s.enter("awg.pulser_off")?;
        s.buffer_full = s.counter_full();
        s.playing = false;
        s.play_started = None;
        Ok(())
    }

    async fn status(&self) -> Result<GeneratorStatus> {
        let s = self.state.lock();
        Ok(if s.playing {
            GeneratorStatus::Playing
        } else {
            GeneratorStatus::Ready
        })
    }

    fn memory_granularity(&self) -> usize {
        self.state.lock().granularity
    }
}

// =============================================================================
// MockCounter - gated photon counter
// =============================================================================

/// Simulated counter; fills once the generator has finished its loops.
pub struct MockCounter {
    state: Arc<Mutex<BenchState>>,
}

#[async_trait]
impl GatedPhotonCounter for MockCounter {
    async fn set_length(&self, n_bins: usize) -> Result<()> {
        let mut s = self.state.lock();
        s.enter("counter.set_length")?;
        s.n_bins = n_bins;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let mut s = self.state.lock();
        s.enter("counter.start")?;
        if s.n_bins == 0 {
            anyhow::bail!("MockCounter: length not configured");
        }
        s.armed = true;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut s = self.state.lock();
        s.enter("counter.stop")?;
        s.armed = false;
        s.buffer_full = false;
        Ok(())
    }

    async fn ready(&self) -> Result<bool> {
        let mut s = self.state.lock();
        s.enter("counter.ready")?;
        Ok(s.counter_full())
    }

    async fn get_data(&self) -> Result<Vec<u64>> {
        let mut s = self.state.lock();
        s.enter("counter.get_data")?;
        let gates = s
            .loaded
            .as_ref()
            .map(|wf| wf.gates_per_pass.max(1))
            .unwrap_or(1);
        let frequencies = s.list.clone();
        let offset = s.pass_offset;
        let mut len = if s.counter_full() { s.n_bins } else { 0 };
        if s.short_buffer {
            len = len.saturating_sub(1);
        }
        let data = (0..len)
            .map(|bin| {
                let pass = bin / gates;
                let profile = if frequencies.is_empty() {
                    1.0
                } else {
                    dip_profile(frequencies[(offset + pass) % frequencies.len()])
                };
                let noise: f64 = s.rng.gen_range(-1.0..1.0) * BASE_COUNTS.sqrt();
                (BASE_COUNTS * profile + noise).max(0.0).round() as u64
            })
            .collect();
        Ok(data)
    }

    async fn get_bin_widths(&self) -> Result<Vec<u64>> {
        let mut s = self.state.lock();
        s.enter("counter.get_bin_widths")?;
        let width = s.loaded.as_ref().map(|wf| wf.gate_width_ps).unwrap_or(0);
        Ok(vec![width; s.n_bins])
    }

    async fn clear(&self) -> Result<()> {
        let mut s = self.state.lock();
        s.enter("counter.clear")?;
        if s.partially_filled() {
            anyhow::bail!("MockCounter: cannot clear a partially filled acquisition");
        }
        s.buffer_full = false;
        Ok(())
    }

    async fn is_armed(&self) -> Result<bool> {
        Ok(self.state.lock().armed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::pulses::{PulseBuilder, PulseMode, PulseParams};

    fn waveform() -> CompiledWaveform {
        PulseBuilder::default()
            .compile(&PulseParams {
                laser_readout_length: 350e-9,
                delay_length: 1e-6,
                pi_pulse_length: 100e-9,
                rep_per_freq: 4,
                sample_rate: 1.25e9,
                mode: PulseMode::Cw,
            })
            .unwrap()
            .padded_to(32)
    }

    #[tokio::test]
    async fn test_counter_fills_after_playback() {
        let bench = SimulatedBench::new();
        let hw = bench.instruments();
        let freqs = [2.86e9, 2.87e9, 2.88e9];
        hw.microwave.set_list(&freqs, -10.0).await.unwrap();
        let handle = hw.generator.write_waveform(&waveform()).await.unwrap();
        hw.generator.load_waveform(&handle).await.unwrap();
        hw.generator.set_loops(3).await.unwrap();
        hw.counter.set_length(12).await.unwrap();
        hw.counter.start().await.unwrap();

        assert!(!hw.counter.ready().await.unwrap());
        hw.generator.pulser_on().await.unwrap();
        sleep(Duration::from_millis(5)).await;
        assert!(hw.counter.ready().await.unwrap());

        let data = hw.counter.get_data().await.unwrap();
        assert_eq!(data.len(), 12);
        let on_resonance: u64 = data[4..8].iter().sum();
        let off_resonance: u64 = data[0..4].iter().sum();
        assert!(on_resonance < off_resonance);

        let widths = hw.counter.get_bin_widths().await.unwrap();
        assert_eq!(widths, vec![349_600; 12]);
    }

    #[tokio::test]
    async fn test_filled_buffer_survives_pulser_off() {
        let bench = SimulatedBench::new();
        let hw = bench.instruments();
        hw.microwave.set_list(&[2.86e9, 2.87e9], -10.0).await.unwrap();
        let handle = hw.generator.write_waveform(&waveform()).await.unwrap();
        hw.generator.load_waveform(&handle).await.unwrap();
        hw.generator.set_loops(2).await.unwrap();
        hw.counter.set_length(8).await.unwrap();
        hw.counter.start().await.unwrap();
        hw.generator.pulser_on().await.unwrap();
        sleep(Duration::from_millis(5)).await;

        hw.generator.pulser_off().await.unwrap();
        assert!(hw.counter.ready().await.unwrap());
        assert_eq!(hw.counter.get_data().await.unwrap().len(), 8);

        hw.counter.clear().await.unwrap();
        assert!(!hw.counter.ready().await.unwrap());
        assert!(hw.counter.get_data().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ready_poll_is_logged_and_injectable() {
        let bench = SimulatedBench::new();
        let hw = bench.instruments();
        bench.fail_next("counter.ready", 1);
        assert!(hw.counter.ready().await.is_err());
        assert!(!hw.counter.ready().await.unwrap());
        assert_eq!(bench.calls(), vec!["counter.ready", "counter.ready"]);
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed() {
        let bench = SimulatedBench::new();
        let hw = bench.instruments();
        hw.microwave.set_list(&[2.87e9], 0.0).await.unwrap();
        bench.fail_next("mw.list_on", 1);
        assert!(hw.microwave.list_on().await.is_err());
        hw.microwave.list_on().await.unwrap();
        assert!(hw.microwave.status().await.unwrap().is_running);
        assert_eq!(
            bench.calls(),
            vec!["mw.set_list", "mw.list_on", "mw.list_on"]
        );
    }

    #[tokio::test]
    async fn test_unaligned_upload_rejected() {
        let bench = SimulatedBench::new();
        bench.set_memory_granularity(5);
        let hw = bench.instruments();
        assert!(hw.generator.write_waveform(&waveform()).await.is_err());
    }

    #[test]
    fn test_dip_profile() {
        assert!((dip_profile(DIP_CENTER_HZ) - 0.7).abs() < 1e-12);
        assert!(dip_profile(DIP_CENTER_HZ + 100e6) > 0.99);
    }
}
