//! Save sink for ODMR runs.
//!
//! A save writes one [`SavedOdmrRun`] as pretty JSON. The record is written to a
//! hidden temporary file in the target directory and renamed into place, so a
//! reader never sees a partial file. With the `storage_csv` feature the raw
//! matrix is also written as a CSV companion (frequencies header, one row per line).

use crate::data::aggregator::OdmrSnapshot;
use crate::data::fit::FitResult;
use crate::error::{OdmrError, OdmrResult};
use crate::experiment::coordinator::CountUnit;
use crate::experiment::messages::{PulseSettings, SweepSettings};
use crate::hardware::capabilities::TriggerPolarity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

/// Parameters of the run a snapshot belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub sweep: SweepSettings,
    /// Frequencies accepted by the source, in Hz
    pub frequencies: Vec<f64>,
    /// Power accepted by the source, in dBm
    pub power: f64,
    pub pulses: PulseSettings,
    pub effective_pi_pulse_length: Option<f64>,
    pub average_factor: u64,
    pub mw_trigger_polarity: TriggerPolarity,
    /// Waveform generator sample clock, Hz
    pub clock_frequency: f64,
    pub count_unit: CountUnit,
}

/// Everything needed to reconstruct a saved run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedOdmrRun {
    pub tag: String,
    pub saved_at: DateTime<Utc>,
    pub context: RunContext,
    pub elapsed_lines: u64,
    pub elapsed_time: f64,
    pub snapshot: OdmrSnapshot,
    pub fit: Option<FitResult>,
}

impl SavedOdmrRun {
    pub fn new(tag: &str, context: RunContext, snapshot: OdmrSnapshot, fit: FitResult) -> Self {
        Self {
            tag: tag.to_string(),
            saved_at: Utc::now(),
            elapsed_lines: snapshot.elapsed_lines,
            elapsed_time: snapshot.elapsed_time,
            context,
            snapshot,
            fit: (!fit.is_null()).then_some(fit),
        }
    }
}

/// Writes and reads saved runs in one directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    write_csv: bool,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>, write_csv: bool) -> Self {
        Self {
            dir: dir.into(),
            write_csv,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `record` and returns the path of the JSON file.
    pub fn save(&self, record: &SavedOdmrRun) -> OdmrResult<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let stem = self.unused_stem(record);
        let path = self.dir.join(format!("{stem}.json"));
        let tmp = self.dir.join(format!(".{stem}.json.tmp"));

        let json = serde_json::to_vec_pretty(record)?;
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;

        if self.write_csv {
            self.write_matrix_csv(&self.dir.join(format!("{stem}_matrix.csv")), &record.snapshot)?;
        }

        info!(path = %path.display(), lines = record.elapsed_lines, "ODMR run saved");
        Ok(path)
    }

    /// `<time>_<tag>_odmr`, with a counter after the tag if that name is taken.
    fn unused_stem(&self, record: &SavedOdmrRun) -> String {
        let prefix = format!(
            "{}_{}",
            record.saved_at.format("%Y%m%d-%H%M%S-%3f"),
            sanitize(&record.tag)
        );
        let mut stem = format!("{prefix}_odmr");
        let mut n = 1;
        while self.dir.join(format!("{stem}.json")).exists() {
            stem = format!("{prefix}-{n}_odmr");
            n += 1;
        }
        stem
    }

    /// Reads a record written by [`SnapshotStore::save`].
    pub fn load(path: &Path) -> OdmrResult<SavedOdmrRun> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    #[cfg(feature = "storage_csv")]
    fn write_matrix_csv(&self, path: &Path, snapshot: &OdmrSnapshot) -> OdmrResult<()> {
        let mut writer =
            csv::Writer::from_path(path).map_err(|e| OdmrError::Storage(e.to_string()))?;
        let header: Vec<String> = std::iter::once("line".to_string())
            .chain(snapshot.frequencies.iter().map(|f| f.to_string()))
            .collect();
        writer
            .write_record(&header)
            .map_err(|e| OdmrError::Storage(e.to_string()))?;
        for (i, row) in snapshot.matrix.outer_iter().enumerate() {
            let record: Vec<String> = std::iter::once(i.to_string())
                .chain(row.iter().map(|v| v.to_string()))
                .collect();
            writer
                .write_record(&record)
                .map_err(|e| OdmrError::Storage(e.to_string()))?;
        }
        writer.flush()?;
        Ok(())
    }

    #[cfg(not(feature = "storage_csv"))]
    fn write_matrix_csv(&self, _path: &Path, _snapshot: &OdmrSnapshot) -> OdmrResult<()> {
        Err(OdmrError::Storage(
            "CSV output requires the storage_csv feature".to_string(),
        ))
    }
}

fn sanitize(tag: &str) -> String {
    let cleaned: String = tag
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "untagged".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::pulses::PulseMode;
    use ndarray::array;

    fn record() -> SavedOdmrRun {
        let context = RunContext {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            sweep: SweepSettings::default(),
            frequencies: vec![2.86e9, 2.87e9],
            power: -20.0,
            pulses: PulseSettings {
                mode: PulseMode::Cw,
                ..PulseSettings::default()
            },
            effective_pi_pulse_length: None,
            average_factor: 3,
            mw_trigger_polarity: TriggerPolarity::Falling,
            clock_frequency: 1.25e9,
            count_unit: CountUnit::Counts,
        };
        let snapshot = OdmrSnapshot {
            frequencies: vec![2.86e9, 2.87e9],
            mean: vec![0.1 + 0.2, 1.0 / 3.0],
            matrix: array![[0.1 + 0.2, 1.0 / 3.0], [0.0, 0.0]],
            elapsed_time: 1.25,
            elapsed_lines: 1,
        };
        SavedOdmrRun::new("nv 1/a", context, snapshot, FitResult::null())
    }

    #[test]
    fn test_round_trip_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), false);
        let saved = record();
        let path = store.save(&saved).unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().contains("nv_1_a"));
        let loaded = SnapshotStore::load(&path).unwrap();
        assert_eq!(loaded, saved);
        assert!(loaded.fit.is_none());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_same_tag_saves_do_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), false);
        let first = record();
        let mut second = record();
        second.saved_at = first.saved_at;
        second.elapsed_lines = first.elapsed_lines + 1;

        let a = store.save(&first).unwrap();
        let b = store.save(&second).unwrap();
        assert_ne!(a, b);
        assert_eq!(SnapshotStore::load(&a).unwrap(), first);
        assert_eq!(SnapshotStore::load(&b).unwrap(), second);
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn test_csv_companion() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), true);
        let path = store.save(&record()).unwrap();
        let csv_path = path.with_file_name(
            path.file_stem()
                .unwrap()
                .to_string_lossy()
                .replace("_odmr", "_odmr_matrix.csv"),
        );
        let text = std::fs::read_to_string(csv_path).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.starts_with("line,2860000000,2870000000"));
    }
}
