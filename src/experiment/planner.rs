//! Frequency Planner.
//!
//! Turns a requested `(start, stop, step, power)` into a [`SweepPlan`] the microwave
//! source can execute. Every correction made on the way is reported as an
//! [`Adjustment`] so the presenter can refresh the user-facing values.
//!
//! Rules, applied in order:
//! 1. `stop <= start` raises stop to `start + step`.
//! 2. A span wider than `max_span` is cut to a whole number of steps.
//! 3. The step is rounded to the device step resolution.
//! 4. The step is enlarged until the list fits `max_points`.
//! 5. Start, stop and power are clamped into the device limits.
//! 6. Stop is aligned to a whole number of steps above start.
//!
//! Planning is pure and stable: re-planning a returned plan changes nothing.

use crate::error::{OdmrError, OdmrResult};
use crate::hardware::capabilities::TriggerPolarity;
use serde::{Deserialize, Serialize};

/// Relative tolerance when deciding whether a value actually changed.
const REL_TOLERANCE: f64 = 1e-12;

/// Microwave source limits the planner must respect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceLimits {
    /// Lowest output frequency (Hz)
    pub min_freq: f64,
    /// Highest output frequency (Hz)
    pub max_freq: f64,
    /// Lowest output power (dBm)
    pub min_power: f64,
    /// Highest output power (dBm)
    pub max_power: f64,
    /// Widest list span (Hz)
    pub max_span: f64,
    /// Longest frequency list
    pub max_points: usize,
    /// Step granularity (Hz)
    pub step_resolution: f64,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            min_freq: 9e3,
            max_freq: 6e9,
            min_power: -144.0,
            max_power: 10.0,
            max_span: 6e9,
            max_points: 2001,
            step_resolution: 1.0,
        }
    }
}

/// Sweep as requested by the user.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepRequest {
    /// First frequency (Hz)
    pub start: f64,
    /// Last frequency (Hz); may be moved onto the step grid
    pub stop: f64,
    /// Frequency increment (Hz)
    pub step: f64,
    /// Output power (dBm)
    pub power: f64,
}

/// Sweep parameter touched by an [`Adjustment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepField {
    Start,
    Stop,
    Step,
    Power,
}

/// One correction the planner applied to the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    pub field: SweepField,
    pub requested: f64,
    pub applied: f64,
    /// Which limit forced the change
    pub reason: String,
}

/// Validated, immutable frequency sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepPlan {
    frequencies: Vec<f64>,
    step: f64,
    power: f64,
    polarity: TriggerPolarity,
}

impl SweepPlan {
    /// Frequencies in Hz, strictly increasing.
    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    /// Number of frequencies.
    pub fn len(&self) -> usize {
        self.frequencies.len()
    }

    /// Always false for a planner-produced sweep.
    pub fn is_empty(&self) -> bool {
        self.frequencies.is_empty()
    }

    /// First frequency in Hz.
    pub fn start(&self) -> f64 {
        self.frequencies.first().copied().unwrap_or_default()
    }

    /// Last frequency in Hz.
    pub fn stop(&self) -> f64 {
        self.frequencies.last().copied().unwrap_or_default()
    }

    /// Spacing between frequencies in Hz.
    pub fn step(&self) -> f64 {
        self.step
    }

    /// Output power in dBm.
    pub fn power(&self) -> f64 {
        self.power
    }

    pub fn polarity(&self) -> TriggerPolarity {
        self.polarity
    }

    /// The request that reproduces this plan.
    pub fn request(&self) -> SweepRequest {
        SweepRequest {
            start: self.start(),
            stop: self.stop(),
            step: self.step,
            power: self.power,
        }
    }

    /// Replaces list and power with the values the source accepted.
    ///
    /// The source may round frequencies; the accepted list must still be a
    /// strictly increasing list of the same length.
    pub fn with_accepted(&self, frequencies: Vec<f64>, power: f64) -> OdmrResult<SweepPlan> {
        if frequencies.len() != self.frequencies.len() {
            return Err(OdmrError::ProtocolViolation(format!(
                "microwave source accepted {} of {} frequencies",
                frequencies.len(),
                self.frequencies.len()
            )));
        }
        if frequencies.windows(2).any(|w| w[1] <= w[0]) {
            return Err(OdmrError::ProtocolViolation(
                "microwave source returned a non-increasing frequency list".to_string(),
            ));
        }
        Ok(SweepPlan {
            frequencies,
            step: self.step,
            power,
            polarity: self.polarity,
        })
    }
}

/// Planner output: the plan plus every correction made.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedSweep {
    pub plan: SweepPlan,
    pub adjustments: Vec<Adjustment>,
}

/// Produces a device-compatible [`SweepPlan`] from `request`.
///
/// # Errors
///
/// `InvalidRequest` for non-finite inputs, a non-positive step, or a sweep that
/// collapses to a single frequency after clamping.
pub fn plan(
    request: &SweepRequest,
    limits: &DeviceLimits,
    polarity: TriggerPolarity,
) -> OdmrResult<PlannedSweep> {
    for (name, value) in [
        ("start", request.start),
        ("stop", request.stop),
        ("step", request.step),
        ("power", request.power),
    ] {
        if !value.is_finite() {
            return Err(OdmrError::InvalidRequest(format!(
                "sweep {name} must be finite, got {value}"
            )));
        }
    }
    if request.step <= 0.0 {
        return Err(OdmrError::InvalidRequest(format!(
            "sweep step must be positive, got {} Hz",
            request.step
        )));
    }
    if limits.max_points < 2 || limits.step_resolution <= 0.0 {
        return Err(OdmrError::InvalidRequest(
            "device limits do not allow any sweep".to_string(),
        ));
    }

    let mut adjustments = Vec::new();
    let mut note = |field, requested: f64, applied: f64, reason: &str| {
        if changed(requested, applied) {
            adjustments.push(Adjustment {
                field,
                requested,
                applied,
                reason: reason.to_string(),
            });
        }
    };

    let start = request.start;
    let mut stop = request.stop;
    let mut step = request.step;

    if stop <= start {
        let raised = start + step;
        note(SweepField::Stop, stop, raised, "stop must lie above start");
        stop = raised;
    }

    if stop - start > limits.max_span {
        let cut = start + (limits.max_span / step).floor() * step;
        note(SweepField::Stop, stop, cut, "span exceeds device maximum");
        stop = cut;
    }

    let rounded = (step / limits.step_resolution).round().max(1.0) * limits.step_resolution;
    note(SweepField::Step, step, rounded, "rounded to device step resolution");
    if changed(step, rounded) {
        step = rounded;
    }

    let span = stop - start;
    if point_count(span, step) > limits.max_points {
        let requested = step;
        let min_step = span / (limits.max_points - 1) as f64;
        step = (min_step / limits.step_resolution).ceil() * limits.step_resolution;
        while point_count(span, step) > limits.max_points {
            step += limits.step_resolution;
        }
        note(SweepField::Step, requested, step, "too many points for device list");
    }

    let clamped_start = start.clamp(limits.min_freq, limits.max_freq);
    note(SweepField::Start, start, clamped_start, "outside device frequency range");
    let clamped_stop = stop.clamp(limits.min_freq, limits.max_freq);
    note(SweepField::Stop, stop, clamped_stop, "outside device frequency range");
    let power = request.power.clamp(limits.min_power, limits.max_power);
    note(SweepField::Power, request.power, power, "outside device power range");

    let start = clamped_start;
    let span = clamped_stop - start;
    let mut steps = (span / step).round().max(0.0) as usize;
    while steps > 0
        && (start + steps as f64 * step > limits.max_freq + limits.step_resolution * 1e-3
            || steps as f64 * step > limits.max_span + limits.step_resolution * 1e-3
            || steps + 1 > limits.max_points)
    {
        steps -= 1;
    }
    if steps == 0 {
        return Err(OdmrError::InvalidRequest(format!(
            "empty sweep: start {start} Hz and stop {clamped_stop} Hz coincide after clamping"
        )));
    }

    let aligned_stop = start + steps as f64 * step;
    note(
        SweepField::Stop,
        clamped_stop,
        aligned_stop,
        "aligned to a whole number of steps",
    );

    let frequencies = (0..=steps).map(|i| start + i as f64 * step).collect();

    Ok(PlannedSweep {
        plan: SweepPlan {
            frequencies,
            step,
            power,
            polarity,
        },
        adjustments,
    })
}

fn point_count(span: f64, step: f64) -> usize {
    (span / step + 1e-9).floor() as usize + 1
}

fn changed(requested: f64, applied: f64) -> bool {
    (requested - applied).abs() > REL_TOLERANCE * requested.abs().max(1.0)
}
