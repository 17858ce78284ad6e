//! Fit registry.
//!
//! Fits are plain functions `(x, y) -> FitResult` looked up by name. The registry
//! ships with a `lorentzian` dip estimator; callers may register their own.

use crate::error::{OdmrError, OdmrResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Name reported when no fit is available.
pub const NO_FIT: &str = "No Fit";

/// Points of the evaluated model curve.
const CURVE_POINTS: usize = 256;

type FitFn = Arc<dyn Fn(&[f64], &[f64]) -> anyhow::Result<FitResult> + Send + Sync>;

/// Outcome of one fit: the evaluated model and its parameters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FitResult {
    pub fit_name: String,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub params: BTreeMap<String, f64>,
}

impl FitResult {
    /// Result of fitting with nothing registered.
    pub fn null() -> Self {
        Self {
            fit_name: NO_FIT.to_string(),
            ..Self::default()
        }
    }

    pub fn is_null(&self) -> bool {
        self.fit_name == NO_FIT
    }
}

#[derive(Clone, Default)]
pub struct FitRegistry {
    fits: HashMap<String, FitFn>,
}

impl std::fmt::Debug for FitRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FitRegistry")
            .field("fits", &self.names())
            .finish()
    }
}

impl FitRegistry {
    /// Empty registry; every fit yields [`FitResult::null`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `lorentzian` estimator.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("lorentzian", lorentzian_dip);
        registry
    }

    pub fn register<F>(&mut self, name: &str, fit: F)
    where
        F: Fn(&[f64], &[f64]) -> anyhow::Result<FitResult> + Send + Sync + 'static,
    {
        self.fits.insert(name.to_string(), Arc::new(fit));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.fits.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn fit(&self, name: &str, x: &[f64], y: &[f64]) -> OdmrResult<FitResult> {
        if self.fits.is_empty() {
            return Ok(FitResult::null());
        }
        let fit = self
            .fits
            .get(name)
            .ok_or_else(|| OdmrError::InvalidRequest(format!("unknown fit '{name}'")))?;
        let mut result = fit(x, y)
            .map_err(|e| OdmrError::InvalidRequest(format!("fit '{name}' failed: {e:#}")))?;
        result.fit_name = name.to_string();
        Ok(result)
    }
}

/// Moment-style estimate of a single Lorentzian dip on a flat baseline.
pub fn lorentzian_dip(x: &[f64], y: &[f64]) -> anyhow::Result<FitResult> {
    if x.len() != y.len() {
        anyhow::bail!("x has {} points, y has {}", x.len(), y.len());
    }
    if x.len() < 3 {
        anyhow::bail!("need at least 3 points, got {}", x.len());
    }
    if x.iter().chain(y).any(|v| !v.is_finite()) {
        anyhow::bail!("data contains non-finite values");
    }

    let n = x.len();
    let edge = (n / 10).max(1);
    let offset = (y[..edge].iter().sum::<f64>() + y[n - edge..].iter().sum::<f64>())
        / (2 * edge) as f64;
    let (i_min, y_min) = y
        .iter()
        .copied()
        .enumerate()
        .fold((0, f64::INFINITY), |best, (i, v)| if v < best.1 { (i, v) } else { best });
    let amplitude = offset - y_min;
    let center = x[i_min];

    let half = offset - amplitude / 2.0;
    let crossing = |range: &mut dyn Iterator<Item = usize>, step: isize| -> Option<f64> {
        for i in range {
            let j = (i as isize + step) as usize;
            if y[j] >= half {
                let t = (half - y[i]) / (y[j] - y[i]);
                return Some(x[i] + t * (x[j] - x[i]));
            }
        }
        None
    };
    let left = crossing(&mut (1..=i_min).rev(), -1);
    let right = crossing(&mut (i_min..n - 1), 1);
    let span = x[n - 1] - x[0];
    let fwhm = match (left, right) {
        (Some(l), Some(r)) => r - l,
        (Some(l), None) => 2.0 * (center - l),
        (None, Some(r)) => 2.0 * (r - center),
        (None, None) => span / 4.0,
    }
    .abs()
    .max(f64::EPSILON);

    let model = |f: f64| {
        let u = (f - center) / (fwhm / 2.0);
        offset - amplitude / (1.0 + u * u)
    };
    let curve_x: Vec<f64> = (0..CURVE_POINTS)
        .map(|i| x[0] + span * i as f64 / (CURVE_POINTS - 1) as f64)
        .collect();
    let curve_y = curve_x.iter().map(|f| model(*f)).collect();

    let mut params = BTreeMap::new();
    params.insert("offset".to_string(), offset);
    params.insert("amplitude".to_string(), amplitude);
    params.insert("center".to_string(), center);
    params.insert("fwhm".to_string(), fwhm);
    params.insert(
        "contrast".to_string(),
        if offset != 0.0 { amplitude / offset } else { 0.0 },
    );

    Ok(FitResult {
        fit_name: "lorentzian".to_string(),
        x: curve_x,
        y: curve_y,
        params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{dip_profile, DIP_CENTER_HZ};

    #[test]
    fn test_empty_registry_returns_null() {
        let result = FitRegistry::new().fit("lorentzian", &[], &[]).unwrap();
        assert!(result.is_null());
        assert!(result.params.is_empty());
    }

    #[test]
    fn test_lorentzian_recovers_dip() {
        let x: Vec<f64> = (0..=100).map(|i| 2.82e9 + i as f64 * 1e6).collect();
        let y: Vec<f64> = x.iter().map(|f| 1000.0 * dip_profile(*f)).collect();
        let result = FitRegistry::with_builtin()
            .fit("lorentzian", &x, &y)
            .unwrap();
        assert_eq!(result.fit_name, "lorentzian");
        assert!((result.params["center"] - DIP_CENTER_HZ).abs() <= 1e6);
        assert!((result.params["fwhm"] - 8e6).abs() < 1.5e6);
        assert!((result.params["contrast"] - 0.3).abs() < 0.05);
        assert_eq!(result.x.len(), CURVE_POINTS);
    }

    #[test]
    fn test_unknown_fit_and_bad_input() {
        let registry = FitRegistry::with_builtin();
        assert!(registry.fit("gaussian", &[1.0], &[1.0]).is_err());
        assert!(registry.fit("lorentzian", &[1.0, 2.0], &[1.0]).is_err());
        assert_eq!(registry.names(), vec!["lorentzian".to_string()]);
    }
}
