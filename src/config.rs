//! Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/odmr.toml` (base configuration)
//! 2. Environment variables prefixed with `ODMR_`, sections split by `__`
//!
//! Every section has defaults, so a partial file (or no file) is accepted.
//!
//! # Example
//! ```no_run
//! use pulsed_odmr::config::OdmrConfig;
//!
//! let config = OdmrConfig::load()?;
//! config.validate()?;
//! println!("Rolling capacity: {}", config.acquisition.rolling_capacity);
//! # Ok::<(), pulsed_odmr::error::OdmrError>(())
//! ```
//!
//! Override a single value: `ODMR_ACQUISITION__ROLLING_CAPACITY=100`.

use crate::data::rolling::GrowthPolicy;
use crate::data::storage::SnapshotStore;
use crate::error::{OdmrError, OdmrResult};
use crate::experiment::coordinator::{CoordinatorSettings, CountUnit};
use crate::experiment::messages::{PulseSettings, SweepSettings};
use crate::experiment::planner::DeviceLimits;
use crate::experiment::pulses::{PulseTiming, SampleRate};
use crate::experiment::run_engine::EngineSettings;
use crate::hardware::capabilities::{StepMode, TriggerPolarity};
use crate::logging::{LogFormat, LoggingConfig};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/odmr.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OdmrConfig {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub pulser: PulserConfig,
    #[serde(default)]
    pub microwave: MicrowaveConfig,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Initial sweep request
    #[serde(default)]
    pub sweep: SweepSettings,
    /// Initial pulse timing
    #[serde(default)]
    pub pulses: PulseSettings,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// Sample rate as a preset name or an explicit value in Hz.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleRateSetting {
    Preset(SampleRate),
    Hz(f64),
}

impl SampleRateSetting {
    pub fn hz(&self) -> f64 {
        match self {
            SampleRateSetting::Preset(rate) => rate.hz(),
            SampleRateSetting::Hz(hz) => *hz,
        }
    }
}

impl Default for SampleRateSetting {
    fn default() -> Self {
        SampleRateSetting::Preset(SampleRate::High)
    }
}

/// Waveform generator timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulserConfig {
    #[serde(default)]
    pub sample_rate: SampleRateSetting,
    /// Seconds
    #[serde(default = "default_short_pulse")]
    pub mw_trigger_pulse_length: f64,
    /// Seconds
    #[serde(default = "default_short_pulse")]
    pub null_pulse_length: f64,
    #[serde(default = "default_device_max_samples")]
    pub device_max_samples: usize,
    #[serde(default = "default_memory_granularity")]
    pub memory_granularity: usize,
    /// Minimum play time of one triggered sweep, seconds
    #[serde(default = "default_min_sweep_time")]
    pub min_sweep_time: f64,
}

impl Default for PulserConfig {
    fn default() -> Self {
        Self {
            sample_rate: SampleRateSetting::default(),
            mw_trigger_pulse_length: default_short_pulse(),
            null_pulse_length: default_short_pulse(),
            device_max_samples: default_device_max_samples(),
            memory_granularity: default_memory_granularity(),
            min_sweep_time: default_min_sweep_time(),
        }
    }
}

/// Microwave source limits and trigger edge
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MicrowaveConfig {
    #[serde(flatten)]
    pub limits: DeviceLimits,
    #[serde(default)]
    pub trigger_polarity: TriggerPolarity,
    /// Arm the source in list or sweep mode
    #[serde(default)]
    pub step_mode: StepMode,
}

/// Acquisition loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    #[serde(default = "default_rolling_capacity")]
    pub rolling_capacity: usize,
    /// Double the matrix instead of dropping old lines
    #[serde(default = "default_true")]
    pub grow_matrix: bool,
    /// 0 averages every filled line
    #[serde(default)]
    pub lines_to_average: usize,
    /// Observer refresh interval
    #[serde(default = "default_query_interval")]
    pub query_interval_ms: u64,
    /// 0 = unlimited
    #[serde(default)]
    pub run_time_limit_seconds: f64,
    #[serde(default = "default_line_overhead")]
    pub line_overhead_ms: u64,
    #[serde(default = "default_counter_timeout")]
    pub counter_timeout_ms: u64,
    #[serde(default = "default_retry_settle")]
    pub retry_settle_ms: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
    #[serde(default)]
    pub count_unit: CountUnit,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            rolling_capacity: default_rolling_capacity(),
            grow_matrix: true,
            lines_to_average: 0,
            query_interval_ms: default_query_interval(),
            run_time_limit_seconds: 0.0,
            line_overhead_ms: default_line_overhead(),
            counter_timeout_ms: default_counter_timeout(),
            retry_settle_ms: default_retry_settle(),
            shutdown_timeout_ms: default_shutdown_timeout(),
            count_unit: CountUnit::Counts,
        }
    }
}

/// Save sink settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_true")]
    pub write_csv: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            write_csv: true,
        }
    }
}

// Default value functions
fn default_name() -> String {
    "Pulsed ODMR".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_short_pulse() -> f64 {
    30e-9
}

fn default_device_max_samples() -> usize {
    64 * 1024 * 1024
}

fn default_memory_granularity() -> usize {
    32
}

fn default_min_sweep_time() -> f64 {
    2e-3
}

fn default_rolling_capacity() -> usize {
    50
}

fn default_true() -> bool {
    true
}

fn default_query_interval() -> u64 {
    200
}

fn default_line_overhead() -> u64 {
    50
}

fn default_counter_timeout() -> u64 {
    5000
}

fn default_retry_settle() -> u64 {
    100
}

fn default_shutdown_timeout() -> u64 {
    30_000
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

impl OdmrConfig {
    /// Load configuration from `config/odmr.toml` and environment variables
    pub fn load() -> OdmrResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> OdmrResult<Self> {
        Ok(Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("ODMR_").split("__"))
            .extract()?)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> OdmrResult<()> {
        let invalid = |msg: String| Err(OdmrError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let pulser = &self.pulser;
        let positive = [
            ("pulser.sample_rate", pulser.sample_rate.hz()),
            ("pulser.mw_trigger_pulse_length", pulser.mw_trigger_pulse_length),
            ("pulser.null_pulse_length", pulser.null_pulse_length),
            ("pulser.min_sweep_time", pulser.min_sweep_time),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return invalid(format!("{name} must be positive, got {value}"));
            }
        }
        if pulser.device_max_samples == 0 || pulser.memory_granularity == 0 {
            return invalid("pulser memory sizes must be non-zero".to_string());
        }

        let limits = &self.microwave.limits;
        if limits.min_freq >= limits.max_freq {
            return invalid(format!(
                "microwave.min_freq {} must be below max_freq {}",
                limits.min_freq, limits.max_freq
            ));
        }
        if limits.min_power > limits.max_power {
            return invalid(format!(
                "microwave.min_power {} must not exceed max_power {}",
                limits.min_power, limits.max_power
            ));
        }
        if limits.max_span <= 0.0 || limits.max_points < 2 || limits.step_resolution <= 0.0 {
            return invalid(
                "microwave.max_span, max_points and step_resolution must allow a sweep".to_string(),
            );
        }

        let acq = &self.acquisition;
        if acq.rolling_capacity == 0 {
            return invalid("acquisition.rolling_capacity must be at least 1".to_string());
        }
        if acq.query_interval_ms == 0 || acq.counter_timeout_ms == 0 {
            return invalid(
                "acquisition.query_interval_ms and counter_timeout_ms must be non-zero".to_string(),
            );
        }
        if !acq.run_time_limit_seconds.is_finite() || acq.run_time_limit_seconds < 0.0 {
            return invalid(format!(
                "acquisition.run_time_limit_seconds must be >= 0, got {}",
                acq.run_time_limit_seconds
            ));
        }

        Ok(())
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            limits: self.microwave.limits.clone(),
            polarity: self.microwave.trigger_polarity,
            step_mode: self.microwave.step_mode,
            timing: PulseTiming {
                mw_trigger_pulse_length: self.pulser.mw_trigger_pulse_length,
                null_pulse_length: self.pulser.null_pulse_length,
                device_max_samples: self.pulser.device_max_samples,
            },
            sample_rate: self.pulser.sample_rate.hz(),
            min_sweep_time: self.pulser.min_sweep_time,
            counter_timeout: Duration::from_millis(self.acquisition.counter_timeout_ms),
            retry_settle: Duration::from_millis(self.acquisition.retry_settle_ms),
            count_unit: self.acquisition.count_unit,
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        let limit = self.acquisition.run_time_limit_seconds;
        EngineSettings {
            line_overhead: Duration::from_millis(self.acquisition.line_overhead_ms),
            run_time_limit: Duration::try_from_secs_f64(limit)
                .ok()
                .filter(|_| limit > 0.0),
            store: SnapshotStore::new(&self.storage.output_dir, self.storage.write_csv),
        }
    }

    pub fn growth_policy(&self) -> GrowthPolicy {
        if self.acquisition.grow_matrix {
            GrowthPolicy::Double
        } else {
            GrowthPolicy::Fixed
        }
    }

    pub fn logging(&self) -> LoggingConfig {
        LoggingConfig {
            level: self.application.log_level.clone(),
            format: self.application.log_format,
            ..LoggingConfig::default()
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.acquisition.shutdown_timeout_ms)
    }
}
