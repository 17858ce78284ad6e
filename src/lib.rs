//! # Pulsed ODMR Acquisition Core
//!
//! Headless acquisition core for pulsed optically detected magnetic resonance on
//! NV centres. A list-mode microwave source steps through frequencies on an
//! external trigger, a waveform generator plays the laser / gate / microwave
//! pattern, and a gated photon counter bins the fluorescence. Each completed
//! sweep becomes one line of a rolling matrix; the mean of the matrix is the
//! ODMR spectrum.
//!
//! ## Crate Structure
//!
//! - **`config`**: Figment-based configuration (`config/odmr.toml` + `ODMR_` env overrides).
//! - **`error`**: The `OdmrError` taxonomy and `OdmrResult` alias.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`hardware`**: Capability traits for the three instruments, the laser
//!   interlock and a simulated bench.
//! - **`experiment`**: Frequency planner, pulse-pattern builder, instrument
//!   coordinator, run state machine and the acquisition loop.
//! - **`data`**: Rolling matrix, aggregator, fits and the save sink.
//! - **`modules`**: `OdmrModule` spawns the loop and returns an `OdmrHandle`.

pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod logging;
pub mod modules;

pub use config::OdmrConfig;
pub use error::{OdmrError, OdmrResult};
pub use modules::{OdmrHandle, OdmrModule};
