//! Instrument abstractions.
//!
//! The acquisition core only sees the capability traits in [`capabilities`]. Real
//! drivers live outside this crate; [`mock`] provides a simulated bench.

pub mod capabilities;
pub mod laser;
pub mod mock;

pub use capabilities::{
    GatedPhotonCounter, GeneratorStatus, MicrowaveMode, MicrowaveSource, MicrowaveStatus,
    TriggerPolarity, WaveformGenerator, WaveformHandle,
};
pub use laser::LaserEnable;

use std::sync::Arc;

/// The three collaborators driven by one acquisition run.
#[derive(Clone)]
pub struct Instruments {
    pub microwave: Arc<dyn MicrowaveSource>,
    pub generator: Arc<dyn WaveformGenerator>,
    pub counter: Arc<dyn GatedPhotonCounter>,
}

impl std::fmt::Debug for Instruments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instruments").finish_non_exhaustive()
    }
}
