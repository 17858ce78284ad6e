//! Rolling matrix of the most recent lines.
//!
//! Row 0 is always the newest line and rows grow older downwards. Rows that have
//! not been written since creation or the last [`RollingMatrix::clear`] are zero.

use crate::error::{OdmrError, OdmrResult};
use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// What happens when the matrix is about to run out of rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrowthPolicy {
    /// Oldest rows fall off the bottom
    Fixed,
    /// Capacity doubles one line before the matrix is full
    #[default]
    Double,
}

/// Bounded 2-D ring of line results, shape `(capacity, width)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RollingMatrix {
    data: Array2<f64>,
    filled: usize,
    policy: GrowthPolicy,
}

impl RollingMatrix {
    pub fn new(capacity: usize, width: usize, policy: GrowthPolicy) -> Self {
        Self {
            data: Array2::zeros((capacity.max(1), width)),
            filled: 0,
            policy,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.nrows()
    }

    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    /// Rows written since creation or the last clear.
    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn policy(&self) -> GrowthPolicy {
        self.policy
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    pub fn to_array(&self) -> Array2<f64> {
        self.data.clone()
    }

    /// Doubles the capacity if the next line would fill the last row.
    ///
    /// Keyed on filled rows, so a matrix shrunk below the number of lines
    /// already acquired grows again instead of dropping rows.
    /// Returns `true` when the matrix grew.
    pub fn grow_if_needed(&mut self) -> bool {
        if self.policy != GrowthPolicy::Double || self.filled + 1 < self.capacity() {
            return false;
        }
        let capacity = self.capacity();
        self.resize(capacity * 2);
        true
    }

    /// Shifts every row down by one and writes `line` into row 0.
    pub fn push(&mut self, line: &[f64]) -> OdmrResult<()> {
        if line.len() != self.width() {
            return Err(OdmrError::ProtocolViolation(format!(
                "line has {} points, matrix expects {}",
                line.len(),
                self.width()
            )));
        }
        let rows = self.capacity();
        if rows > 1 {
            let older = self.data.slice(s![..rows - 1, ..]).to_owned();
            self.data.slice_mut(s![1.., ..]).assign(&older);
        }
        self.data.row_mut(0).assign(&Array1::from(line.to_vec()));
        self.filled = (self.filled + 1).min(rows);
        Ok(())
    }

    /// Zeroes every row.
    pub fn clear(&mut self) {
        self.data.fill(0.0);
        self.filled = 0;
    }

    /// Changes the capacity, keeping the most recent `min(old, new)` rows.
    pub fn resize(&mut self, capacity: usize) {
        let capacity = capacity.max(1);
        let keep = capacity.min(self.capacity());
        let mut data = Array2::zeros((capacity, self.width()));
        data.slice_mut(s![..keep, ..])
            .assign(&self.data.slice(s![..keep, ..]));
        self.data = data;
        self.filled = self.filled.min(capacity);
    }

    /// Mean of the newest `k` filled rows, or of all filled rows when `k == 0`.
    ///
    /// An empty matrix yields a zero trace.
    pub fn mean(&self, k: usize) -> Vec<f64> {
        let rows = if k == 0 {
            self.filled
        } else {
            k.min(self.filled)
        };
        if rows == 0 {
            return vec![0.0; self.width()];
        }
        self.data
            .slice(s![..rows, ..])
            .mean_axis(Axis(0))
            .map(|m| m.to_vec())
            .unwrap_or_else(|| vec![0.0; self.width()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newest_row_first() {
        let mut m = RollingMatrix::new(3, 2, GrowthPolicy::Fixed);
        m.push(&[1.0, 1.0]).unwrap();
        m.push(&[2.0, 2.0]).unwrap();
        assert_eq!(m.view().row(0).to_vec(), vec![2.0, 2.0]);
        assert_eq!(m.view().row(1).to_vec(), vec![1.0, 1.0]);
        assert_eq!(m.view().row(2).to_vec(), vec![0.0, 0.0]);
        assert_eq!(m.filled(), 2);
    }

    #[test]
    fn test_fixed_policy_drops_oldest() {
        let mut m = RollingMatrix::new(2, 1, GrowthPolicy::Fixed);
        for (i, v) in [1.0, 2.0, 3.0].iter().enumerate() {
            assert!(!m.grow_if_needed(), "line {i}");
            m.push(&[*v]).unwrap();
        }
        assert_eq!(m.to_array().column(0).to_vec(), vec![3.0, 2.0]);
    }

    #[test]
    fn test_doubling_keeps_every_line() {
        let mut m = RollingMatrix::new(4, 1, GrowthPolicy::Double);
        let mut grew_at = Vec::new();
        for line in 0..10u64 {
            if m.grow_if_needed() {
                grew_at.push(line);
            }
            m.push(&[line as f64]).unwrap();
        }
        assert_eq!(grew_at, vec![3, 7]);
        assert_eq!(m.capacity(), 16);
        assert_eq!(m.filled(), 10);
        assert_eq!(m.view()[[9, 0]], 0.0);
        assert_eq!(m.view()[[0, 0]], 9.0);
        assert_eq!(m.view()[[10, 0]], 0.0);
    }

    #[test]
    fn test_doubling_resumes_after_shrink() {
        let mut m = RollingMatrix::new(8, 1, GrowthPolicy::Double);
        for line in 0..6 {
            m.grow_if_needed();
            m.push(&[line as f64]).unwrap();
        }
        m.resize(3);
        assert_eq!(m.filled(), 3);

        assert!(m.grow_if_needed());
        assert_eq!(m.capacity(), 6);
        m.push(&[6.0]).unwrap();
        assert_eq!(m.to_array().column(0).to_vec(), vec![6.0, 5.0, 4.0, 3.0, 0.0, 0.0]);
    }

    #[test]
    fn test_resize_keeps_recent_rows() {
        let mut m = RollingMatrix::new(4, 1, GrowthPolicy::Fixed);
        for v in 1..=4 {
            m.push(&[v as f64]).unwrap();
        }
        m.resize(2);
        assert_eq!(m.to_array().column(0).to_vec(), vec![4.0, 3.0]);
        assert_eq!(m.filled(), 2);
        m.resize(3);
        assert_eq!(m.to_array().column(0).to_vec(), vec![4.0, 3.0, 0.0]);
    }

    #[test]
    fn test_mean_over_recent_rows() {
        let mut m = RollingMatrix::new(5, 2, GrowthPolicy::Fixed);
        m.push(&[1.0, 10.0]).unwrap();
        m.push(&[3.0, 30.0]).unwrap();
        m.push(&[5.0, 50.0]).unwrap();
        assert_eq!(m.mean(0), vec![3.0, 30.0]);
        assert_eq!(m.mean(2), vec![4.0, 40.0]);
        assert_eq!(m.mean(10), vec![3.0, 30.0]);
    }

    #[test]
    fn test_clear_zeroes_and_width_checked() {
        let mut m = RollingMatrix::new(2, 2, GrowthPolicy::Fixed);
        m.push(&[1.0, 2.0]).unwrap();
        m.clear();
        assert!(m.view().iter().all(|v| *v == 0.0));
        assert_eq!(m.mean(0), vec![0.0, 0.0]);
        assert!(m.push(&[1.0]).is_err());
    }
}
