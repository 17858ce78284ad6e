//! Experiment modules.
//!
//! A module wires instruments, configuration and the acquisition task together
//! and hands the caller a handle for control. Observers (GUI, scripts, CLI) only
//! ever see the handle.

pub mod odmr;

pub use odmr::{OdmrHandle, OdmrModule};
