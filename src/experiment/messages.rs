//! Message types between the observer and the acquisition loop.
//!
//! # Channel Types
//!
//! - **mpsc**: observer → loop, one [`OdmrCommand`] per request
//! - **oneshot**: loop → observer, the reply embedded in each command
//! - **watch**: loop → observer, latest [`RunStatus`] and plot snapshot only
//! - **broadcast**: loop → observers, [`OdmrEvent`] notifications
//!
//! Each command variant has a helper that creates the command together with the
//! receiver for its reply:
//!
//! ```rust
//! use pulsed_odmr::experiment::messages::OdmrCommand;
//!
//! let (cmd, rx) = OdmrCommand::start();
//! // commands.send(cmd).await?;
//! // let result = rx.await?;
//! ```

use crate::data::fit::FitResult;
use crate::error::OdmrResult;
use crate::experiment::planner::{Adjustment, SweepRequest};
use crate::experiment::pulses::{PulseMode, PulseParams};
use crate::experiment::state::{RunState, RunStatus};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::oneshot;

/// Requested frequency sweep, as entered by the user.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepSettings {
    /// Hz
    pub start: f64,
    /// Hz
    pub stop: f64,
    /// Hz
    pub step: f64,
    /// dBm
    pub power: f64,
    /// Target duration of one averaged line, in seconds
    pub single_sweep_time: f64,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            start: 2.82e9,
            stop: 2.92e9,
            step: 2e6,
            power: -20.0,
            single_sweep_time: 1.0,
        }
    }
}

impl SweepSettings {
    pub fn request(&self) -> SweepRequest {
        SweepRequest {
            start: self.start,
            stop: self.stop,
            step: self.step,
            power: self.power,
        }
    }
}

/// Requested pulse timing. All times in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseSettings {
    pub laser_readout_length: f64,
    pub delay_length: f64,
    pub pi_pulse_length: f64,
    pub rep_per_freq: usize,
    pub mode: PulseMode,
}

impl Default for PulseSettings {
    fn default() -> Self {
        Self {
            laser_readout_length: 350e-9,
            delay_length: 1e-6,
            pi_pulse_length: 100e-9,
            rep_per_freq: 100,
            mode: PulseMode::Pulsed,
        }
    }
}

impl PulseSettings {
    pub fn params(&self, sample_rate: f64) -> PulseParams {
        PulseParams {
            laser_readout_length: self.laser_readout_length,
            delay_length: self.delay_length,
            pi_pulse_length: self.pi_pulse_length,
            rep_per_freq: self.rep_per_freq,
            sample_rate,
            mode: self.mode,
        }
    }
}

/// Values published whenever parameters are set or corrected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParametersUpdate {
    pub sweep: SweepSettings,
    pub pulses: PulseSettings,
    /// Corrections made by the planner to the last sweep request
    pub adjustments: Vec<Adjustment>,
    /// Frequencies accepted by the microwave source, once a run is armed
    pub frequencies: Option<Vec<f64>>,
    pub average_factor: Option<u64>,
    pub effective_pi_pulse_length: Option<f64>,
    pub lines_to_average: usize,
    pub rolling_capacity: usize,
}

/// Notifications broadcast to every observer.
#[derive(Debug, Clone, PartialEq)]
pub enum OdmrEvent {
    ParametersUpdated(Box<ParametersUpdate>),
    StateChanged {
        state: RunState,
        is_running: bool,
        reason: Option<String>,
    },
    FitUpdated(FitResult),
    ElapsedTimeUpdated {
        seconds: f64,
        lines: u64,
    },
}

/// Requests handled by the acquisition loop.
#[derive(Debug)]
pub enum OdmrCommand {
    /// Plan, compile and arm a new run.
    ///
    /// Replies once the run is planned; arming failures surface as a
    /// transition to `error`.
    Start {
        response: oneshot::Sender<OdmrResult<()>>,
    },
    /// Request a cooperative stop. A stop while idle is a no-op.
    Stop {
        response: oneshot::Sender<OdmrResult<()>>,
    },
    Pause {
        response: oneshot::Sender<OdmrResult<()>>,
    },
    Continue {
        response: oneshot::Sender<OdmrResult<()>>,
    },
    /// Zero the rolling matrix before the next line is written.
    ClearMatrix {
        response: oneshot::Sender<OdmrResult<()>>,
    },
    ClearError {
        response: oneshot::Sender<OdmrResult<()>>,
    },
    /// Persist the current snapshot with its run context.
    Save {
        tag: String,
        response: oneshot::Sender<OdmrResult<PathBuf>>,
    },
    /// Replies with the corrected settings.
    SetSweep {
        sweep: SweepSettings,
        response: oneshot::Sender<OdmrResult<SweepSettings>>,
    },
    SetPulses {
        pulses: PulseSettings,
        response: oneshot::Sender<OdmrResult<PulseSettings>>,
    },
    SetLinesToAverage {
        lines: usize,
        response: oneshot::Sender<OdmrResult<()>>,
    },
    SetRollingCapacity {
        capacity: usize,
        response: oneshot::Sender<OdmrResult<()>>,
    },
    /// Fit the current mean trace, or explicit `(x, y)` data.
    Fit {
        name: String,
        data: Option<(Vec<f64>, Vec<f64>)>,
        response: oneshot::Sender<OdmrResult<FitResult>>,
    },
    GetStatus {
        response: oneshot::Sender<RunStatus>,
    },
    GetParameters {
        response: oneshot::Sender<ParametersUpdate>,
    },
    /// Stop any run, tear down and end the task.
    Shutdown {
        response: oneshot::Sender<OdmrResult<()>>,
    },
}

type Reply<T> = oneshot::Receiver<OdmrResult<T>>;

impl OdmrCommand {
    pub fn start() -> (Self, Reply<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Start { response: tx }, rx)
    }

    pub fn stop() -> (Self, Reply<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Stop { response: tx }, rx)
    }

    pub fn pause() -> (Self, Reply<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Pause { response: tx }, rx)
    }

    pub fn resume() -> (Self, Reply<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Continue { response: tx }, rx)
    }

    pub fn clear_matrix() -> (Self, Reply<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::ClearMatrix { response: tx }, rx)
    }

    pub fn clear_error() -> (Self, Reply<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::ClearError { response: tx }, rx)
    }

    pub fn save(tag: impl Into<String>) -> (Self, Reply<PathBuf>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Save {
                tag: tag.into(),
                response: tx,
            },
            rx,
        )
    }

    pub fn set_sweep(sweep: SweepSettings) -> (Self, Reply<SweepSettings>) {
        let (tx, rx) = oneshot::channel();
        (Self::SetSweep { sweep, response: tx }, rx)
    }

    pub fn set_pulses(pulses: PulseSettings) -> (Self, Reply<PulseSettings>) {
        let (tx, rx) = oneshot::channel();
        (Self::SetPulses { pulses, response: tx }, rx)
    }

    pub fn set_lines_to_average(lines: usize) -> (Self, Reply<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::SetLinesToAverage { lines, response: tx }, rx)
    }

    pub fn set_rolling_capacity(capacity: usize) -> (Self, Reply<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::SetRollingCapacity {
                capacity,
                response: tx,
            },
            rx,
        )
    }

    pub fn fit(name: impl Into<String>, data: Option<(Vec<f64>, Vec<f64>)>) -> (Self, Reply<FitResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Fit {
                name: name.into(),
                data,
                response: tx,
            },
            rx,
        )
    }

    pub fn get_status() -> (Self, oneshot::Receiver<RunStatus>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetStatus { response: tx }, rx)
    }

    pub fn get_parameters() -> (Self, oneshot::Receiver<ParametersUpdate>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetParameters { response: tx }, rx)
    }

    pub fn shutdown() -> (Self, Reply<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helpers_pair_command_with_receiver() {
        let (cmd, mut rx) = OdmrCommand::set_lines_to_average(5);
        match cmd {
            OdmrCommand::SetLinesToAverage { lines, response } => {
                assert_eq!(lines, 5);
                response.send(Ok(())).unwrap();
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_pulse_settings_carry_sample_rate() {
        let params = PulseSettings::default().params(1.25e9);
        assert_eq!(params.sample_rate, 1.25e9);
        assert_eq!(params.rep_per_freq, 100);
    }
}
