//! Pulse-Pattern Builder.
//!
//! Compiles [`PulseParams`] into a [`CompiledWaveform`]: four synchronised digital
//! streams (laser, readout gate, microwave switch, microwave trigger) and one
//! analog baseline, all of identical length.
//!
//! # Layout
//!
//! ```text
//! prologue:   trigger(30 ns) null null
//! cw rep:     [laser+gate high: readout] null
//! pulsed rep: [laser+gate high: readout][dark ... ][switch: π][null]
//!              t0                        t0+delay  t0+delay+π
//! ```
//!
//! All lengths are converted to whole samples with `floor(seconds × rate)`. The
//! builder is pure: the same parameters always produce identical streams.

use crate::error::{OdmrError, OdmrResult};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Shortest π-pulse the microwave switch can produce.
pub const PI_PULSE_FLOOR: f64 = 50e-9;

const PS_PER_SECOND: f64 = 1e12;

/// Absorbs representation error in `seconds × rate` before flooring.
const SAMPLE_EPSILON: f64 = 1e-6;

/// Acquisition mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PulseMode {
    /// Continuous microwave, laser readout only
    Cw,
    /// π-pulse in the dark between readouts
    #[default]
    Pulsed,
}

/// Waveform generator sample clock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleRate {
    /// 0.3125 GS/s
    Low,
    /// 0.625 GS/s
    Medium,
    /// 1.25 GS/s
    High,
    /// Explicit rate in Hz
    Custom(f64),
}

impl SampleRate {
    pub fn hz(&self) -> f64 {
        match self {
            SampleRate::Low => 0.3125e9,
            SampleRate::Medium => 0.625e9,
            SampleRate::High => 1.25e9,
            SampleRate::Custom(hz) => *hz,
        }
    }
}

impl Default for SampleRate {
    fn default() -> Self {
        SampleRate::High
    }
}

/// Pulse parameters of one run. All times in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PulseParams {
    pub laser_readout_length: f64,
    pub delay_length: f64,
    pub pi_pulse_length: f64,
    pub rep_per_freq: usize,
    /// Sample clock in Hz
    pub sample_rate: f64,
    pub mode: PulseMode,
}

/// Device-fixed timing used by every compilation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PulseTiming {
    /// Leading pulse that advances the microwave list (s)
    pub mw_trigger_pulse_length: f64,
    /// Settling gap (s)
    pub null_pulse_length: f64,
    /// Waveform memory ceiling in samples
    pub device_max_samples: usize,
}

impl Default for PulseTiming {
    fn default() -> Self {
        Self {
            mw_trigger_pulse_length: 30e-9,
            null_pulse_length: 30e-9,
            device_max_samples: 64 * 1024 * 1024,
        }
    }
}

/// Digital output of the pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigitalChannel {
    Laser,
    ReadoutGate,
    MwSwitch,
    MwTrigger,
}

impl DigitalChannel {
    pub const ALL: [DigitalChannel; 4] = [
        DigitalChannel::Laser,
        DigitalChannel::ReadoutGate,
        DigitalChannel::MwSwitch,
        DigitalChannel::MwTrigger,
    ];

    fn index(self) -> usize {
        match self {
            DigitalChannel::Laser => 0,
            DigitalChannel::ReadoutGate => 1,
            DigitalChannel::MwSwitch => 2,
            DigitalChannel::MwTrigger => 3,
        }
    }
}

/// Sample streams ready for upload.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledWaveform {
    digital: [Vec<bool>; 4],
    analog: Vec<f32>,
    sample_rate: f64,
    total_pulse_length_seconds: f64,
    effective_pi_pulse_length: Option<f64>,
}

impl CompiledWaveform {
    /// Samples of one digital channel.
    pub fn channel(&self, channel: DigitalChannel) -> &[bool] {
        &self.digital[channel.index()]
    }

    pub fn analog(&self) -> &[f32] {
        &self.analog
    }

    /// Length of every stream.
    pub fn samples_per_sweep(&self) -> usize {
        self.analog.len()
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Nominal duration of one waveform pass, from the requested lengths.
    pub fn total_pulse_length_seconds(&self) -> f64 {
        self.total_pulse_length_seconds
    }

    /// π length after switch compensation; `None` in cw mode.
    pub fn effective_pi_pulse_length(&self) -> Option<f64> {
        self.effective_pi_pulse_length
    }

    /// Half-open sample ranges where `channel` is high.
    pub fn high_intervals(&self, channel: DigitalChannel) -> Vec<Range<usize>> {
        let stream = self.channel(channel);
        let mut intervals = Vec::new();
        let mut begin = None;
        for (i, &high) in stream.iter().enumerate() {
            match (high, begin) {
                (true, None) => begin = Some(i),
                (false, Some(b)) => {
                    intervals.push(b..i);
                    begin = None;
                }
                _ => {}
            }
        }
        if let Some(b) = begin {
            intervals.push(b..stream.len());
        }
        intervals
    }

    /// Copy extended with low samples to a multiple of `granularity`.
    pub fn padded_to(&self, granularity: usize) -> CompiledWaveform {
        let len = self.samples_per_sweep();
        let granularity = granularity.max(1);
        let target = len.div_ceil(granularity) * granularity;
        let mut padded = self.clone();
        for stream in padded.digital.iter_mut() {
            stream.resize(target, false);
        }
        padded.analog.resize(target, 0.0);
        padded
    }
}

/// Compiles pulse parameters against fixed device timing.
#[derive(Debug, Clone, Copy, Default)]
pub struct PulseBuilder {
    timing: PulseTiming,
}

impl PulseBuilder {
    pub fn new(timing: PulseTiming) -> Self {
        Self { timing }
    }

    pub fn timing(&self) -> &PulseTiming {
        &self.timing
    }

    /// Builds the waveform for `params`.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for non-physical lengths, a π-pulse below
    /// [`PI_PULSE_FLOOR`], a π-pulse overlapping the readout, or a waveform
    /// longer than the device memory.
    pub fn compile(&self, params: &PulseParams) -> OdmrResult<CompiledWaveform> {
        self.validate(params)?;

        let rate = params.sample_rate;
        let trigger_ps = to_ps(self.timing.mw_trigger_pulse_length);
        let null_ps = to_ps(self.timing.null_pulse_length);
        let readout_ps = to_ps(params.laser_readout_length);
        let delay_ps = to_ps(params.delay_length);

        let trigger = samples(trigger_ps, rate);
        let null = samples(null_ps, rate);
        let readout = samples(readout_ps, rate);
        let delay = samples(delay_ps, rate);

        let (pi_ps, block) = match params.mode {
            PulseMode::Cw => (None, readout),
            PulseMode::Pulsed => {
                let pi_ps = compensated_pi_ps(to_ps(params.pi_pulse_length));
                (Some(pi_ps), delay + samples(pi_ps, rate))
            }
        };
        let pi = pi_ps.map_or(0, |ps| samples(ps, rate));

        let rep = params.rep_per_freq;
        let prologue = trigger + 2 * null;
        let total = (block + null)
            .checked_mul(rep)
            .and_then(|body| body.checked_add(prologue))
            .ok_or_else(|| OdmrError::InvalidRequest("waveform length overflows".to_string()))?;
        if total > self.timing.device_max_samples {
            return Err(OdmrError::InvalidRequest(format!(
                "waveform needs {total} samples, device memory holds {}",
                self.timing.device_max_samples
            )));
        }

        let rep_ps = match pi_ps {
            None => readout_ps,
            Some(pi_ps) => delay_ps + pi_ps,
        };
        let total_ps = trigger_ps + 2 * null_ps + rep as i64 * (rep_ps + null_ps);

        let mut digital: [Vec<bool>; 4] = Default::default();
        for stream in digital.iter_mut() {
            *stream = vec![false; total];
        }
        digital[DigitalChannel::MwTrigger.index()][..trigger].fill(true);

        for r in 0..rep {
            let t0 = prologue + r * (block + null);
            digital[DigitalChannel::Laser.index()][t0..t0 + readout].fill(true);
            digital[DigitalChannel::ReadoutGate.index()][t0..t0 + readout].fill(true);
            if params.mode == PulseMode::Pulsed {
                let on = t0 + delay;
                digital[DigitalChannel::MwSwitch.index()][on..on + pi].fill(true);
            }
        }

        Ok(CompiledWaveform {
            digital,
            analog: vec![0.0; total],
            sample_rate: rate,
            total_pulse_length_seconds: total_ps as f64 / PS_PER_SECOND,
            effective_pi_pulse_length: pi_ps.map(|ps| ps as f64 / PS_PER_SECOND),
        })
    }

    fn validate(&self, params: &PulseParams) -> OdmrResult<()> {
        let positive = [
            ("laser_readout_length", params.laser_readout_length),
            ("sample_rate", params.sample_rate),
            ("mw_trigger_pulse_length", self.timing.mw_trigger_pulse_length),
            ("null_pulse_length", self.timing.null_pulse_length),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(OdmrError::InvalidRequest(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        if params.rep_per_freq == 0 {
            return Err(OdmrError::InvalidRequest(
                "rep_per_freq must be at least 1".to_string(),
            ));
        }
        if samples(to_ps(params.laser_readout_length), params.sample_rate) == 0 {
            return Err(OdmrError::InvalidRequest(format!(
                "readout of {} s is shorter than one sample",
                params.laser_readout_length
            )));
        }
        if params.mode == PulseMode::Pulsed {
            if !params.delay_length.is_finite() || !params.pi_pulse_length.is_finite() {
                return Err(OdmrError::InvalidRequest(
                    "delay and π lengths must be finite".to_string(),
                ));
            }
            if to_ps(params.pi_pulse_length) < to_ps(PI_PULSE_FLOOR) {
                return Err(OdmrError::InvalidRequest(format!(
                    "π-pulse of {} s is below the {} s hardware floor",
                    params.pi_pulse_length, PI_PULSE_FLOOR
                )));
            }
            if to_ps(params.delay_length) < to_ps(params.laser_readout_length) {
                return Err(OdmrError::InvalidRequest(format!(
                    "π-pulse at delay {} s would overlap the {} s readout",
                    params.delay_length, params.laser_readout_length
                )));
            }
        }
        Ok(())
    }
}

/// Switch rise/fall compensation, in picoseconds.
///
/// Pulses strictly between 50 ns and 60 ns lose 40 ns, all others 50 ns; a 50 ns
/// request therefore compiles to an empty switch window.
fn compensated_pi_ps(pi_ps: i64) -> i64 {
    if pi_ps > 50_000 && pi_ps < 60_000 {
        pi_ps - 40_000
    } else {
        pi_ps - 50_000
    }
}

/// π length the switch actually produces for a requested `pi_pulse_length`.
pub fn effective_pi_pulse_length(pi_pulse_length: f64) -> f64 {
    compensated_pi_ps(to_ps(pi_pulse_length)) as f64 / PS_PER_SECOND
}

fn to_ps(seconds: f64) -> i64 {
    (seconds * PS_PER_SECOND).round() as i64
}

fn samples(ps: i64, rate: f64) -> usize {
    (ps.max(0) as f64 * rate / PS_PER_SECOND + SAMPLE_EPSILON).floor() as usize
}
