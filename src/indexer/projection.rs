//! Periodicity scoring of one trial projection direction.
//!
//! Peaks are projected onto a trial unit vector and accumulated into a 1-D
//! bin array centered on the origin. If the binned curve repeats with a
//! well-defined period, the trial direction is (close to) a reciprocal
//! lattice direction and the period is the plane spacing along it.

use tracing::trace;

use crate::{ObservedPeak, Vector3};

/// Number of projection bins per maximum cell edge.
///
/// The bin width is `1 / (BINS_PER_CELL_EDGE * max_cell_edge)`, fine enough
/// that peaks from adjacent lattice planes never share a bin.
pub const BINS_PER_CELL_EDGE: f32 = 48.0;

/// Smallest populated bin span (max minus min nonzero index) that still
/// supports a periodicity estimate.
const MIN_BIN_SPAN: usize = 9;

/// Shortest acceptable period in bins. A best period below this triggers a
/// smoothing retry on the correlation curve.
const MIN_PERIOD_BINS: usize = 8;

/// Maximum number of sweep attempts over the (progressively smoothed)
/// correlation curve.
const MAX_SWEEP_ATTEMPTS: usize = 3;

/// Score for one trial direction that showed periodic structure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionScore {
    /// X component of the trial unit direction.
    pub x: f32,
    /// Y component of the trial unit direction; z is implied as
    /// `sqrt(1 - x^2 - y^2)` (upper hemisphere).
    pub y: f32,
    /// Estimated reciprocal-lattice spacing along the direction, in the same
    /// units as the peak q vectors.
    pub period: f32,
    /// Period expressed in projection bins.
    pub bins_per_period: usize,
    /// Normalized autocorrelation at the chosen period.
    pub correlation: f32,
    /// Fraction-of-intensity fit metric, in `[0, 2]`: twice the share of
    /// projected intensity lying within 20% of an integer multiple of the
    /// period.
    pub fit: f32,
}

impl DirectionScore {
    /// Combined ranking key used by the candidate list.
    pub fn rank_key(&self) -> f32 {
        self.fit + self.correlation
    }

    /// The trial direction as a unit vector.
    pub fn direction(&self) -> Vector3 {
        let z2 = 1.0 - self.x * self.x - self.y * self.y;
        Vector3::new(self.x, self.y, z2.max(0.0).sqrt())
    }

    /// The plane-normal vector: unit direction scaled by the period, i.e. a
    /// candidate reciprocal lattice vector.
    pub fn plane_normal(&self) -> Vector3 {
        self.direction() * self.period
    }

    /// Fit metric rescaled to `[0, 1]`.
    pub fn fit_fraction(&self) -> f32 {
        self.fit / 2.0
    }
}

/// Reusable, center-origin projection bin buffer.
///
/// Bin 0 of the projection axis is the logical center of the array
/// (`len / 2`); projections are accumulated at signed offsets from it.  The
/// buffer starts small and regrows (re-centered) whenever a projection lands
/// outside the current range, so one buffer can be reused across all trial
/// directions of a search.
#[derive(Debug, Clone)]
pub struct ProjectionBuffer {
    bins: Vec<f32>,
}

impl Default for ProjectionBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectionBuffer {
    pub fn new() -> Self {
        Self {
            bins: vec![0.0; 61],
        }
    }

    #[inline]
    fn center(&self) -> usize {
        self.bins.len() / 2
    }

    /// Accumulate `intensity` at signed bin `index`, growing the buffer if
    /// the index falls outside the current range.
    fn accumulate(&mut self, index: i64, intensity: f32) {
        let half = (self.bins.len() / 2) as i64;
        if index.abs() >= half {
            // Regrow so the new index fits with a little slack, keeping the
            // old contents centered.
            let new_len = 2 * index.unsigned_abs() as usize + 1 + 10;
            let mut grown = vec![0.0f32; new_len];
            let offset = (new_len - self.bins.len()) / 2;
            grown[offset..offset + self.bins.len()].copy_from_slice(&self.bins);
            self.bins = grown;
        }
        let center = self.center() as i64;
        self.bins[(center + index) as usize] += intensity;
    }

    /// Project every non-omitted peak onto the direction `(x, y, z)` and bin
    /// the projections weighted by observed intensity.
    ///
    /// `bin_width` is the projection-axis resolution; see
    /// [`BINS_PER_CELL_EDGE`].
    fn fill(&mut self, peaks: &[ObservedPeak], omit: Option<&[bool]>, x: f32, y: f32, bin_width: f32) {
        self.bins.fill(0.0);
        // A mask of the wrong length is ignored rather than trusted.
        let omit = omit.filter(|m| m.len() == peaks.len());
        let z2 = 1.0 - x * x - y * y;
        let dir = Vector3::new(x, y, z2.max(0.0).sqrt());
        for (i, pk) in peaks.iter().enumerate() {
            if omit.map_or(false, |m| m[i]) {
                continue;
            }
            let p = pk.q.dot(&dir);
            let index = (p / bin_width + 0.5).floor() as i64;
            self.accumulate(index, pk.ipk_obs as f32);
        }
    }

    /// Index of the first nonzero bin, if any.
    fn first_nonzero(&self) -> Option<usize> {
        self.bins.iter().position(|&v| v != 0.0)
    }

    /// Index of the last nonzero bin, if any.
    fn last_nonzero(&self) -> Option<usize> {
        self.bins.iter().rposition(|&v| v != 0.0)
    }
}

/// Score the trial direction `(x, y)` against the peak list.
///
/// Returns `None` when the projections carry too little signal for a
/// periodicity estimate: too few populated bins, no significant
/// autocorrelation maximum, or a best period too short to be meaningful.
pub fn score_direction(
    peaks: &[ObservedPeak],
    omit: Option<&[bool]>,
    x: f32,
    y: f32,
    max_cell_edge: f32,
    buffer: &mut ProjectionBuffer,
) -> Option<DirectionScore> {
    let bin_width = 1.0 / (BINS_PER_CELL_EDGE * max_cell_edge);
    buffer.fill(peaks, omit, x, y, bin_width);

    let min_index = buffer.first_nonzero()?;
    let max_index = buffer.last_nonzero()?;
    if max_index - min_index < MIN_BIN_SPAN {
        return None;
    }

    let correlation = autocorrelation_curve(&buffer.bins, min_index, max_index)?;
    let (period_bins, corr) = best_period(&correlation)?;

    let fit = fit_fraction(&buffer.bins, period_bins);
    trace!(
        x,
        y,
        period_bins,
        corr,
        fit,
        "scored trial direction"
    );
    Some(DirectionScore {
        x,
        y,
        period: period_bins as f32 * bin_width,
        bins_per_period: period_bins,
        correlation: corr,
        fit,
    })
}

/// Normalized autocorrelation of `bins[min_index..=max_index]` for every lag
/// from 2 up to a third of the populated span.
///
/// Element `i` of the result is the correlation at lag `i + 2`.  Returns
/// `None` if the data has no variance (all populated bins equal).
fn autocorrelation_curve(bins: &[f32], min_index: usize, max_index: usize) -> Option<Vec<f32>> {
    let span = max_index - min_index;
    let n = span + 1;
    let nspans = span / 3;
    if nspans < 3 {
        return None;
    }

    let data = &bins[min_index..=max_index];
    let mut total = 0.0f32;
    let mut sum_sq = 0.0f32;
    for &v in data {
        total += v;
        sum_sq += v * v;
    }
    let mu = total / n as f32;
    let var = (sum_sq - n as f32 * mu * mu) / span as f32;
    if !(var > 0.0) {
        return None;
    }

    let n_lags = nspans - 2;
    let mut curve = Vec::with_capacity(n_lags);
    for lag in 2..2 + n_lags {
        let m = n - lag;
        let mut sum = 0.0f32;
        for j in 0..m {
            sum += (data[j] - mu) * (data[j + lag] - mu);
        }
        curve.push(sum / (m as f32 * var));
    }
    Some(curve)
}

/// Find the dominant period from a correlation curve via a three-phase
/// sweep, retrying on a smoothed copy when the best period is too short.
///
/// The sweep tracks a dead band at a tenth of the running maximum: phase 0
/// waits for the curve to drop below the band (past the zero-lag peak),
/// phase 1 waits for it to rise back above, and phase 2 tracks the maximum
/// until the curve drops below the band again. A result is only meaningful
/// once phase 2 is reached.
fn best_period(correlation: &[f32]) -> Option<(usize, f32)> {
    let mut curve = correlation.to_vec();
    for attempt in 0..MAX_SWEEP_ATTEMPTS {
        if let Some((max_idx, corr)) = sweep(&curve) {
            let period = max_idx + 2;
            if period >= MIN_PERIOD_BINS {
                return Some((period, corr));
            }
        }
        if attempt + 1 < MAX_SWEEP_ATTEMPTS {
            // 2-point moving average; short-period noise in the curve can
            // hide the true maximum.
            for i in 0..curve.len() - 1 {
                curve[i] = (curve[i] + curve[i + 1]) / 2.0;
            }
        }
    }
    None
}

/// One pass of the three-phase maximum sweep. Returns the index of the
/// located maximum within the curve and its value.
fn sweep(curve: &[f32]) -> Option<(usize, f32)> {
    let mut phase = 0u8;
    let mut max_idx: Option<usize> = None;
    let mut running_max = 0.0f32;
    let mut band = 0.0f32;
    for (i, &c) in curve.iter().enumerate() {
        match phase {
            0 => {
                if c > running_max {
                    running_max = c;
                    band = running_max / 10.0;
                }
                if c < -band {
                    phase = 1;
                }
            }
            1 => {
                if c > band {
                    phase = 2;
                }
                max_idx = Some(i);
            }
            2 => {
                if c < -band {
                    phase = 3;
                } else if let Some(m) = max_idx {
                    if c > curve[m] {
                        max_idx = Some(i);
                    }
                }
            }
            _ => break,
        }
    }
    if phase >= 2 {
        max_idx.map(|m| (m, curve[m]))
    } else {
        None
    }
}

/// Share of projected intensity within 20% of an integer multiple of the
/// period, doubled.  Offsets are measured from the buffer's logical center
/// so that bin 0 of the projection axis counts as "on a plane".
fn fit_fraction(bins: &[f32], period_bins: usize) -> f32 {
    let center = bins.len() / 2;
    let mut total = 0.0f32;
    let mut on_plane = 0.0f32;
    for (i, &v) in bins.iter().enumerate() {
        if v > 0.0 {
            total += v;
            let x = (i as f32 - center as f32) / period_bins as f32;
            if (x - (x + 0.5).floor()).abs() < 0.2 {
                on_plane += v;
            }
        }
    }
    if total > 0.0 {
        2.0 * on_plane / total
    } else {
        0.0
    }
}
