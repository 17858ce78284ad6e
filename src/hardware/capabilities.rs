//! Instrument Capabilities
//!
//! This module defines the capability traits the pulsed-ODMR core needs from its
//! three collaborators. The core never talks to a vendor protocol directly; each
//! instrument is an abstract capability:
//!
//! - A microwave source implements [`MicrowaveSource`] (externally triggered list mode)
//! - An arbitrary waveform generator implements [`WaveformGenerator`]
//! - A time tagger implements [`GatedPhotonCounter`] (counts between markers)
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE instrument role
//!
//! Driver errors stay `anyhow` on this side of the boundary; the
//! [`Coordinator`](crate::experiment::coordinator::Coordinator) translates them into
//! [`OdmrError`](crate::error::OdmrError) kinds and owns the retry policy.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn arm_list<M: MicrowaveSource + ?Sized>(mw: &M, freqs: &[f64]) -> Result<()> {
//!     let (accepted, _power) = mw.set_list(freqs, -10.0).await?;
//!     assert_eq!(accepted.len(), freqs.len());
//!     mw.set_ext_trigger(TriggerPolarity::Rising).await?;
//!     mw.list_on().await
//! }
//! ```

use crate::experiment::pulses::CompiledWaveform;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Edge of the external trigger that advances the microwave list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerPolarity {
    #[default]
    Rising,
    Falling,
}

/// How the source is armed for externally triggered stepping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepMode {
    /// `list_on` / `reset_listpos`
    #[default]
    List,
    /// `sweep_on` / `reset_sweeppos`
    Sweep,
}

/// Output mode of a microwave source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MicrowaveMode {
    Cw,
    List,
    Sweep,
}

/// Snapshot of the microwave source state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MicrowaveStatus {
    pub mode: MicrowaveMode,
    pub is_running: bool,
}

/// Capability: Externally Triggered Microwave Source
///
/// # Contract
/// - `set_list` may alter the requested values; the caller must use the returned ones
/// - `list_on` / `sweep_on` arm the source; each trigger edge steps to the next frequency
/// - `reset_listpos` / `reset_sweeppos` return the internal pointer to the first frequency
/// - `off` returns only after the instrument confirms the output is stopped
#[async_trait]
pub trait MicrowaveSource: Send + Sync {
    /// Load a frequency list (Hz) at a single power (dBm).
    ///
    /// # Returns
    /// The frequencies and power actually accepted by the device.
    async fn set_list(&self, frequencies: &[f64], power: f64) -> Result<(Vec<f64>, f64)>;

    /// Select the trigger edge that advances the list.
    async fn set_ext_trigger(&self, polarity: TriggerPolarity) -> Result<()>;

    /// Arm list mode for externally triggered stepping.
    async fn list_on(&self) -> Result<()>;

    /// Arm sweep mode for externally triggered stepping.
    ///
    /// # Default Implementation
    /// Returns an error indicating sweep mode is not supported.
    async fn sweep_on(&self) -> Result<()> {
        anyhow::bail!("Sweep mode not supported by this source")
    }

    /// Move the list pointer back to the first frequency.
    async fn reset_listpos(&self) -> Result<()>;

    /// Move the sweep pointer back to the first frequency.
    ///
    /// # Default Implementation
    /// Returns an error indicating sweep mode is not supported.
    async fn reset_sweeppos(&self) -> Result<()> {
        anyhow::bail!("Sweep mode not supported by this source")
    }

    /// Switch the output off; blocks until the device reports it stopped.
    async fn off(&self) -> Result<()>;

    /// Current mode and output state.
    async fn status(&self) -> Result<MicrowaveStatus>;
}

/// Handle to a waveform stored in generator memory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WaveformHandle(pub String);

/// Playback state of a waveform generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorStatus {
    /// Idle with outputs off
    Ready,
    /// Playing the loaded waveform
    Playing,
}

/// Capability: Arbitrary Waveform Generator
///
/// # Contract
/// - `write_waveform` stores samples and returns a handle; it does not change playback
/// - `set_loops(n)` repeats the loaded waveform `n` times on every `pulser_on`
/// - `memory_granularity` is the sample multiple the device memory accepts
#[async_trait]
pub trait WaveformGenerator: Send + Sync {
    /// Store the waveform in device memory.
    async fn write_waveform(&self, waveform: &CompiledWaveform) -> Result<WaveformHandle>;

    /// Select a stored waveform for playback.
    async fn load_waveform(&self, handle: &WaveformHandle) -> Result<()>;

    /// Number of repetitions played per start.
    async fn set_loops(&self, loops: u64) -> Result<()>;

    /// Start playback.
    async fn pulser_on(&self) -> Result<()>;

    /// Stop playback and switch outputs off.
    async fn pulser_off(&self) -> Result<()>;

    /// Current playback state.
    async fn status(&self) -> Result<GeneratorStatus>;

    /// Sample multiple accepted by waveform memory.
    fn memory_granularity(&self) -> usize {
        1
    }
}

/// Capability: Gated Photon Counter
///
/// Counts photon clicks between successive rising edges on a marker channel.
///
/// # Contract
/// - `set_length(n)` configures `n` bins; `start` arms for `n` marker intervals
/// - `ready` turns true once all `n` bins have fired
/// - `get_bin_widths` returns the gate duration of every bin in picoseconds
/// - `clear` must not be called while an acquisition is partially filled
#[async_trait]
pub trait GatedPhotonCounter: Send + Sync {
    /// Configure the number of bins.
    async fn set_length(&self, n_bins: usize) -> Result<()>;

    /// Arm for `n_bins` triggered acquisitions.
    async fn start(&self) -> Result<()>;

    /// Disarm.
    async fn stop(&self) -> Result<()>;

    /// True once every bin has fired.
    async fn ready(&self) -> Result<bool>;

    /// Counts per bin.
    async fn get_data(&self) -> Result<Vec<u64>>;

    /// Bin widths in picoseconds.
    async fn get_bin_widths(&self) -> Result<Vec<u64>>;

    /// Reset the buffer.
    async fn clear(&self) -> Result<()>;

    /// Whether the counter is currently armed.
    ///
    /// # Default Implementation
    /// Returns an error indicating state query is not supported.
    async fn is_armed(&self) -> Result<bool> {
        anyhow::bail!("Armed state query not supported by this counter")
    }
}
