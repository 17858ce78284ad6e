//! Pulsed-ODMR experiment logic.
//!
//! Leaves first: [`planner`] and [`pulses`] are pure; [`coordinator`] drives the
//! instruments; [`run_engine`] is the acquisition loop built on top of it.

pub mod coordinator;
pub mod messages;
pub mod planner;
pub mod pulses;
pub mod run_engine;
pub mod state;

pub use coordinator::{Coordinator, CoordinatorSettings, CountUnit, RunSetup};
pub use messages::{OdmrCommand, OdmrEvent, ParametersUpdate, PulseSettings, SweepSettings};
pub use planner::{plan, DeviceLimits, SweepPlan, SweepRequest};
pub use pulses::{CompiledWaveform, PulseBuilder, PulseMode, PulseParams, SampleRate};
pub use run_engine::{EngineSettings, RunEngine};
pub use state::{RunEvent, RunState, RunStatus};
