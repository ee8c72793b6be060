//! Aligning two clocks from the pulses both of them recorded.

use std::collections::HashMap;

use ndarray::{Array1, ArrayView1};

use crate::error::ExtractError;

/// Default bin width in seconds for the coarse offset search.
pub const DEFAULT_TBIN: f64 = 0.1;

/// Maps times on clock A to times on clock B.
#[derive(Debug, Clone)]
pub struct ClockMap {
    /// Matched pulse times, sorted by the clock A time.
    a: Vec<f64>,
    b: Vec<f64>,
    slope: f64,
    intercept: f64,
    /// Relative drift of clock B against clock A, in parts per million.
    pub drift_ppm: f64,
    linear: bool,
}

impl ClockMap {
    /// Number of pulses matched between the two clocks.
    pub fn matched(&self) -> usize {
        self.a.len()
    }

    /// Use the fitted line instead of piecewise interpolation.
    pub fn linear(mut self) -> Self {
        self.linear = true;
        self
    }

    pub fn apply(&self, t: f64) -> f64 {
        if self.linear {
            return t * (1.0 + self.slope) + self.intercept;
        }

        let n = self.a.len();
        // index of the segment to interpolate on, clamped so that the end
        // segments extrapolate
        let upper = self.a.partition_point(|&x| x <= t).clamp(1, n - 1);
        let (a0, a1) = (self.a[upper - 1], self.a[upper]);
        let (b0, b1) = (self.b[upper - 1], self.b[upper]);
        b0 + (t - a0) * (b1 - b0) / (a1 - a0)
    }

    pub fn apply_all(&self, times: ArrayView1<f64>) -> Array1<f64> {
        times.mapv(|t| self.apply(t))
    }
}

/// Least squares fit of `y = slope * x + intercept`.
fn polyfit(x: &[f64], y: &[f64]) -> (f64, f64) {
    let n = x.len() as f64;
    let mx = x.iter().sum::<f64>() / n;
    let my = y.iter().sum::<f64>() / n;
    let (mut sxy, mut sxx) = (0.0, 0.0);
    for (xi, yi) in x.iter().zip(y) {
        sxy += (xi - mx) * (yi - my);
        sxx += (xi - mx) * (xi - mx);
    }
    let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
    (slope, my - slope * mx)
}

/// Most common `a - b` difference.
///
/// Differences are histogrammed at `tbin` and scored over two adjacent bins,
/// so an offset sitting on a bin edge is not split. The result is the median
/// difference inside the winning window.
fn coarse_offset(tsa: &[f64], tsb: &[f64], tbin: f64) -> Option<f64> {
    let bin = |a: f64, b: f64| ((a - b) / tbin).floor() as i64;

    let mut counts: HashMap<i64, usize> = HashMap::new();
    for &a in tsa {
        for &b in tsb {
            *counts.entry(bin(a, b)).or_default() += 1;
        }
    }

    // ties go to the smallest offset
    let window = |lo: i64| {
        counts.get(&lo).copied().unwrap_or(0) + counts.get(&(lo + 1)).copied().unwrap_or(0)
    };
    let best = counts
        .keys()
        .flat_map(|&k| [k - 1, k])
        .map(|lo| (window(lo), lo))
        .max_by(|x, y| x.0.cmp(&y.0).then(y.1.cmp(&x.1)))?
        .1;

    let mut diffs: Vec<f64> = tsa
        .iter()
        .flat_map(|&a| tsb.iter().map(move |&b| a - b))
        .filter(|&d| (best..=best + 1).contains(&((d / tbin).floor() as i64)))
        .collect();
    diffs.sort_by(f64::total_cmp);
    diffs.get(diffs.len() / 2).copied()
}

/// Pair every `a` time with at most one `b` time within `threshold` of its
/// prediction. Closest pairs are assigned first.
fn assign(
    tsa: &[f64],
    tsb: &[f64],
    predict: impl Fn(f64) -> f64,
    threshold: f64,
) -> Vec<(usize, usize)> {
    let mut candidates = Vec::new();
    for (i, &a) in tsa.iter().enumerate() {
        let target = predict(a);
        let start = tsb.partition_point(|&b| b < target - threshold);
        for (j, &b) in tsb.iter().enumerate().skip(start) {
            let dt = (b - target).abs();
            if b > target + threshold {
                break;
            }
            if dt < threshold {
                candidates.push((dt, i, j));
            }
        }
    }
    candidates.sort_by(|x, y| x.0.total_cmp(&y.0));

    let mut used_a = vec![false; tsa.len()];
    let mut used_b = vec![false; tsb.len()];
    let mut pairs = Vec::new();
    for (_, i, j) in candidates {
        if !used_a[i] && !used_b[j] {
            used_a[i] = true;
            used_b[j] = true;
            pairs.push((i, j));
        }
    }
    pairs.sort_unstable();
    pairs
}

fn fit(tsa: &[f64], tsb: &[f64], pairs: &[(usize, usize)]) -> Result<ClockMap, ExtractError> {
    if pairs.len() < 2 {
        return Err(ExtractError::ClockAlignment(format!(
            "only {} pulses matched between clocks",
            pairs.len()
        )));
    }

    let a: Vec<f64> = pairs.iter().map(|&(i, _)| tsa[i]).collect();
    let b: Vec<f64> = pairs.iter().map(|&(_, j)| tsb[j]).collect();
    let diff: Vec<f64> = a.iter().zip(&b).map(|(a, b)| b - a).collect();
    let (slope, intercept) = polyfit(&a, &diff);

    Ok(ClockMap {
        a,
        b,
        slope,
        intercept,
        drift_ppm: slope * 1e6,
        linear: false,
    })
}

/// Build the map from clock A to clock B given the pulse times each of them
/// recorded, in seconds. Both series must be sorted; either may have missing
/// or extra pulses.
pub fn sync_timestamps(tsa: &[f64], tsb: &[f64], tbin: f64) -> Result<ClockMap, ExtractError> {
    if tsa.is_empty() || tsb.is_empty() {
        return Err(ExtractError::ClockAlignment("empty pulse train".into()));
    }
    let sorted = |ts: &[f64]| ts.windows(2).all(|w| w[0] <= w[1]);
    if !sorted(tsa) || !sorted(tsb) {
        return Err(ExtractError::ClockAlignment("pulse times are not sorted".into()));
    }

    let offset = coarse_offset(tsa, tsb, tbin)
        .ok_or_else(|| ExtractError::ClockAlignment("no pulse pairs".into()))?;
    tracing::debug!("coarse clock offset {:.3}s", offset);

    let first = assign(tsa, tsb, |a| a - offset, tbin);
    let rough = fit(tsa, tsb, &first)?.linear();

    let pairs = assign(tsa, tsb, |a| rough.apply(a), tbin / 2.0);
    fit(tsa, tsb, &pairs)
}
