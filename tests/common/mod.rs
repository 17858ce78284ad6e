//! Shared fixtures for the acquisition integration tests.
#![allow(dead_code)]

use pulsed_odmr::config::OdmrConfig;
use pulsed_odmr::experiment::pulses::PulseMode;
use pulsed_odmr::experiment::state::RunState;
use pulsed_odmr::hardware::mock::SimulatedBench;
use pulsed_odmr::hardware::LaserEnable;
use pulsed_odmr::{OdmrHandle, OdmrModule};
use std::path::Path;
use std::time::Duration;

pub const STATE_TIMEOUT: Duration = Duration::from_secs(5);

/// 11-point CW sweep around the dip with ~10 ms lines.
pub fn fast_config(output_dir: &Path) -> OdmrConfig {
    let mut config = OdmrConfig::default();
    config.acquisition.line_overhead_ms = 5;
    config.acquisition.counter_timeout_ms = 1000;
    config.acquisition.retry_settle_ms = 1;
    config.acquisition.shutdown_timeout_ms = 5000;
    config.acquisition.query_interval_ms = 20;
    config.sweep.start = 2.80e9;
    config.sweep.stop = 2.90e9;
    config.sweep.step = 10e6;
    config.sweep.power = -10.0;
    config.sweep.single_sweep_time = 0.01;
    config.pulses.mode = PulseMode::Cw;
    config.storage.output_dir = output_dir.to_path_buf();
    config.storage.write_csv = false;
    config
}

pub struct Rig {
    pub bench: SimulatedBench,
    pub laser: LaserEnable,
    pub odmr: OdmrHandle,
    pub dir: tempfile::TempDir,
}

pub fn spawn_with(configure: impl FnOnce(&mut OdmrConfig)) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config(dir.path());
    configure(&mut config);
    let bench = SimulatedBench::new();
    let laser = LaserEnable::new();
    let odmr = OdmrModule::spawn(&config, bench.instruments(), laser.clone()).unwrap();
    Rig {
        bench,
        laser,
        odmr,
        dir,
    }
}

pub fn spawn() -> Rig {
    spawn_with(|_| {})
}

impl Rig {
    /// Waits until at least `lines` lines have been pushed.
    pub async fn wait_for_lines(&self, lines: u64) {
        let mut plots = self.odmr.plots();
        tokio::time::timeout(STATE_TIMEOUT, plots.wait_for(|s| s.elapsed_lines >= lines))
            .await
            .expect("lines not acquired in time")
            .unwrap();
    }

    pub async fn start_running(&self) {
        self.odmr.start().await.unwrap();
        self.odmr
            .wait_for_state(RunState::Running, STATE_TIMEOUT)
            .await
            .unwrap();
    }

    pub fn instruments_off(&self) -> bool {
        !self.bench.microwave_running()
            && !self.bench.generator_playing()
            && !self.bench.counter_armed()
            && !self.laser.is_enabled()
    }
}
