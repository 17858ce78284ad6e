//! Aggregator & Presenter.
//!
//! Owns the [`RollingMatrix`], the displayed mean trace and the current fit. All
//! of it sits behind one mutex so a [`OdmrSnapshot`] is always consistent with the
//! last row write. Observers get the latest snapshot through a `watch` channel and
//! notifications through a `broadcast` channel; neither ever queues plot data.

use crate::data::fit::FitResult;
use crate::data::rolling::{GrowthPolicy, RollingMatrix};
use crate::error::{OdmrError, OdmrResult};
use crate::experiment::messages::OdmrEvent;
use ndarray::Array2;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::debug;

const EVENT_CAPACITY: usize = 64;

/// Consistent copy of the displayed data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OdmrSnapshot {
    pub frequencies: Vec<f64>,
    pub mean: Vec<f64>,
    /// Newest line in row 0
    pub matrix: Array2<f64>,
    pub elapsed_time: f64,
    pub elapsed_lines: u64,
}

impl OdmrSnapshot {
    fn empty(width: usize, capacity: usize) -> Self {
        Self {
            frequencies: vec![0.0; width],
            mean: vec![0.0; width],
            matrix: Array2::zeros((capacity.max(1), width)),
            elapsed_time: 0.0,
            elapsed_lines: 0,
        }
    }
}

/// Bookkeeping returned for each pushed line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineOutcome {
    pub elapsed_lines: u64,
    /// Matrix was zeroed before this line
    pub cleared: bool,
    /// Matrix capacity doubled before this line
    pub grew: bool,
}

struct AggregatorState {
    frequencies: Vec<f64>,
    matrix: RollingMatrix,
    mean: Vec<f64>,
    lines_to_average: usize,
    elapsed_lines: u64,
    elapsed_time: f64,
    clear_requested: bool,
    fit: FitResult,
}

impl AggregatorState {
    fn snapshot(&self) -> OdmrSnapshot {
        OdmrSnapshot {
            frequencies: self.frequencies.clone(),
            mean: self.mean.clone(),
            matrix: self.matrix.to_array(),
            elapsed_time: self.elapsed_time,
            elapsed_lines: self.elapsed_lines,
        }
    }
}

pub struct Aggregator {
    state: Mutex<AggregatorState>,
    plots: watch::Sender<Arc<OdmrSnapshot>>,
    events: broadcast::Sender<OdmrEvent>,
}

impl Aggregator {
    pub fn new(capacity: usize, policy: GrowthPolicy, lines_to_average: usize) -> Self {
        let (plots, _) = watch::channel(Arc::new(OdmrSnapshot::empty(0, capacity)));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(AggregatorState {
                frequencies: Vec::new(),
                matrix: RollingMatrix::new(capacity, 0, policy),
                mean: Vec::new(),
                lines_to_average,
                elapsed_lines: 0,
                elapsed_time: 0.0,
                clear_requested: false,
                fit: FitResult::null(),
            }),
            plots,
            events,
        }
    }

    pub fn subscribe_plots(&self) -> watch::Receiver<Arc<OdmrSnapshot>> {
        self.plots.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<OdmrEvent> {
        self.events.subscribe()
    }

    /// Sends a notification; having no subscribers is not an error.
    pub fn notify(&self, event: OdmrEvent) {
        let _ = self.events.send(event);
    }

    /// Resets the matrix for a new run over `frequencies`.
    pub fn begin_run(&self, frequencies: Vec<f64>) {
        let snapshot = {
            let mut s = self.state.lock();
            let capacity = s.matrix.capacity();
            let policy = s.matrix.policy();
            s.matrix = RollingMatrix::new(capacity, frequencies.len(), policy);
            s.mean = vec![0.0; frequencies.len()];
            s.frequencies = frequencies;
            s.elapsed_lines = 0;
            s.elapsed_time = 0.0;
            s.clear_requested = false;
            s.fit = FitResult::null();
            s.snapshot()
        };
        self.plots.send_replace(Arc::new(snapshot));
    }

    /// Flags the matrix for zeroing before the next line.
    pub fn request_clear(&self) {
        self.state.lock().clear_requested = true;
    }

    /// Zeroes the matrix immediately; used while no line is in flight.
    pub fn clear_now(&self) {
        let snapshot = {
            let mut s = self.state.lock();
            s.matrix.clear();
            s.mean = s.matrix.mean(s.lines_to_average);
            s.clear_requested = false;
            s.snapshot()
        };
        self.plots.send_replace(Arc::new(snapshot));
    }

    /// Applies a pending clear, grows the matrix if needed, writes `line` into
    /// row 0 and recomputes the mean, all under one lock.
    pub fn push_line(&self, line: &[f64], elapsed_time: f64) -> OdmrResult<LineOutcome> {
        let (outcome, snapshot) = {
            let mut s = self.state.lock();
            if line.len() != s.frequencies.len() {
                return Err(OdmrError::ProtocolViolation(format!(
                    "line has {} points for {} frequencies",
                    line.len(),
                    s.frequencies.len()
                )));
            }
            let cleared = std::mem::take(&mut s.clear_requested);
            if cleared {
                s.matrix.clear();
            }
            let grew = s.matrix.grow_if_needed();
            s.matrix.push(line)?;
            s.elapsed_lines += 1;
            s.elapsed_time = elapsed_time;
            s.mean = s.matrix.mean(s.lines_to_average);
            let outcome = LineOutcome {
                elapsed_lines: s.elapsed_lines,
                cleared,
                grew,
            };
            (outcome, s.snapshot())
        };
        if outcome.grew {
            debug!(
                capacity = snapshot.matrix.nrows(),
                "rolling matrix capacity doubled"
            );
        }
        self.plots.send_replace(Arc::new(snapshot));
        self.notify(OdmrEvent::ElapsedTimeUpdated {
            seconds: elapsed_time,
            lines: outcome.elapsed_lines,
        });
        Ok(outcome)
    }

    /// `k == 0` averages every filled row.
    pub fn set_lines_to_average(&self, k: usize) {
        let snapshot = {
            let mut s = self.state.lock();
            s.lines_to_average = k;
            s.mean = s.matrix.mean(k);
            s.snapshot()
        };
        self.plots.send_replace(Arc::new(snapshot));
    }

    pub fn lines_to_average(&self) -> usize {
        self.state.lock().lines_to_average
    }

    /// Resizes the matrix, keeping the most recent `min(old, n)` rows.
    pub fn set_rolling_capacity(&self, capacity: usize) -> OdmrResult<()> {
        if capacity == 0 {
            return Err(OdmrError::InvalidRequest(
                "rolling capacity must be at least 1".to_string(),
            ));
        }
        let snapshot = {
            let mut s = self.state.lock();
            s.matrix.resize(capacity);
            s.mean = s.matrix.mean(s.lines_to_average);
            s.snapshot()
        };
        self.plots.send_replace(Arc::new(snapshot));
        Ok(())
    }

    pub fn rolling_capacity(&self) -> usize {
        self.state.lock().matrix.capacity()
    }

    pub fn snapshot(&self) -> OdmrSnapshot {
        self.state.lock().snapshot()
    }

    /// Snapshot and current fit taken under the same lock.
    pub fn snapshot_with_fit(&self) -> (OdmrSnapshot, FitResult) {
        let s = self.state.lock();
        (s.snapshot(), s.fit.clone())
    }

    /// Re-sends the current snapshot, e.g. as the final update of a run.
    pub fn publish_plots(&self) {
        let snapshot = self.snapshot();
        self.plots.send_replace(Arc::new(snapshot));
    }

    pub fn set_elapsed_time(&self, seconds: f64) {
        let lines = {
            let mut s = self.state.lock();
            s.elapsed_time = seconds;
            s.elapsed_lines
        };
        self.notify(OdmrEvent::ElapsedTimeUpdated { seconds, lines });
    }

    pub fn set_fit(&self, fit: FitResult) {
        self.state.lock().fit = fit.clone();
        self.notify(OdmrEvent::FitUpdated(fit));
    }

    pub fn fit(&self) -> FitResult {
        self.state.lock().fit.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator() -> Aggregator {
        let agg = Aggregator::new(4, GrowthPolicy::Fixed, 0);
        agg.begin_run(vec![1.0, 2.0, 3.0]);
        agg
    }

    #[test]
    fn test_push_updates_snapshot_and_watch() {
        let agg = aggregator();
        let rx = agg.subscribe_plots();
        agg.push_line(&[1.0, 2.0, 3.0], 0.5).unwrap();
        agg.push_line(&[3.0, 4.0, 5.0], 1.0).unwrap();
        let latest = rx.borrow().clone();
        assert_eq!(latest.elapsed_lines, 2);
        assert_eq!(latest.mean, vec![2.0, 3.0, 4.0]);
        assert_eq!(latest.matrix.row(0).to_vec(), vec![3.0, 4.0, 5.0]);
        assert_eq!(*latest, agg.snapshot());
    }

    #[test]
    fn test_clear_applies_on_next_line() {
        let agg = aggregator();
        for _ in 0..3 {
            agg.push_line(&[1.0, 1.0, 1.0], 0.0).unwrap();
        }
        agg.request_clear();
        assert_eq!(agg.snapshot().matrix.row(2).to_vec(), vec![1.0, 1.0, 1.0]);
        let outcome = agg.push_line(&[7.0, 7.0, 7.0], 0.0).unwrap();
        assert!(outcome.cleared);
        assert_eq!(outcome.elapsed_lines, 4);
        let snap = agg.snapshot();
        assert_eq!(snap.matrix.row(0).to_vec(), vec![7.0, 7.0, 7.0]);
        assert!(snap.matrix.row(1).iter().all(|v| *v == 0.0));
        assert_eq!(snap.mean, vec![7.0, 7.0, 7.0]);
    }

    #[test]
    fn test_lines_to_average() {
        let agg = aggregator();
        agg.push_line(&[0.0, 0.0, 0.0], 0.0).unwrap();
        agg.push_line(&[4.0, 4.0, 4.0], 0.0).unwrap();
        agg.set_lines_to_average(1);
        assert_eq!(agg.snapshot().mean, vec![4.0, 4.0, 4.0]);
        agg.set_lines_to_average(0);
        assert_eq!(agg.snapshot().mean, vec![2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_wrong_width_rejected() {
        let agg = aggregator();
        let err = agg.push_line(&[1.0], 0.0).unwrap_err();
        assert!(matches!(err, OdmrError::ProtocolViolation(_)));
        assert_eq!(agg.snapshot().elapsed_lines, 0);
    }

    #[tokio::test]
    async fn test_fit_is_broadcast() {
        let agg = aggregator();
        let mut events = agg.subscribe_events();
        agg.set_fit(FitResult::null());
        match events.recv().await.unwrap() {
            OdmrEvent::FitUpdated(fit) => assert!(fit.is_null()),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_capacity_resize_validated() {
        let agg = aggregator();
        assert!(agg.set_rolling_capacity(0).is_err());
        agg.set_rolling_capacity(8).unwrap();
        assert_eq!(agg.rolling_capacity(), 8);
    }
}
