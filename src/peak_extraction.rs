//! Locate Bragg peaks in a 3-D detector histogram.
//!
//! This module finds peaks in a `row x column x time-channel` count array by:
//! 1. Optionally smoothing each time slice with a border-compensated 3x3 sum
//! 2. Building an intensity histogram/CDF and deriving an acceptance threshold
//!    near the 99.9th percentile
//! 3. Walking the supra-threshold voxels from strongest to weakest, keeping
//!    only isolated local maxima
//! 4. Fitting each surviving candidate's centroid and extent from the five
//!    time slices around it, rejecting candidates whose body overlaps an
//!    already-accepted peak or whose centroid is undefined
//!
//! Every accept/reject decision is appended to a text log carried in the
//! result, so a run can be audited after the fact.
//!
//! # Example
//!
//! ```no_run
//! use autoindex::peak_extraction::{find_peaks, PeakSearchConfig};
//! use autoindex::VoxelHistogram;
//!
//! let hist = VoxelHistogram::from_raw(vec![0.0; 256 * 256 * 100], 256, 256, 100).unwrap();
//! let result = find_peaks(&hist, &PeakSearchConfig::default()).unwrap();
//! println!("Found {} peaks above {}", result.peaks.len(), result.threshold);
//! ```

use crate::histogram::VoxelHistogram;
use anyhow::{ensure, Result};
use tracing::debug;

/// Resolution of the intensity histogram used for threshold selection.
const NUM_BUCKETS: usize = 20_000;

/// Minimum fraction of voxels that must fall below the final threshold.
/// Data that cannot exclude at least this much has no usable contrast and
/// produces an empty (non-error) result.
const MIN_EXCLUDED_FRACTION: f64 = 0.10;

/// Half-width of the neighborhood a candidate must dominate to count as a
/// local maximum.
const LOCAL_MAX_SPAN: usize = 3;

/// A fitted centroid moving this many pixels or more from the seed voxel is
/// treated as unreliable; the seed position is kept instead.
const MAX_CENTROID_DRIFT: f32 = 5.0;

/// Mean/sigma refinement passes per time slice before the centroid pass.
const MEAN_ITERATIONS: usize = 6;

/// Configuration for the peak search.
#[derive(Debug, Clone)]
pub struct PeakSearchConfig {
    /// Smooth each time slice with the border-compensated 3x3 sum before
    /// searching. Raises weak peaks above counting noise.
    /// Default: true
    pub smooth: bool,

    /// Maximum number of peaks to return. The walk over sorted candidates
    /// stops as soon as this many have been accepted.
    /// Default: 50
    pub max_peaks: usize,

    /// Intensity threshold a voxel must exceed to become a candidate.
    /// `None` (or a value outside the data range) selects one automatically
    /// so that roughly the top 0.1% of voxels qualify. Either way the
    /// threshold is then adjusted so no more than 1% of voxels qualify, and
    /// floored at a few counts.
    /// Default: None
    pub threshold: Option<f32>,

    /// Rows to search, zero-based. Out-of-range entries are skipped.
    /// `None` searches every row.
    /// Default: None
    pub rows: Option<Vec<usize>>,

    /// Columns to search, zero-based. Out-of-range entries are skipped.
    /// `None` searches every column.
    /// Default: None
    pub cols: Option<Vec<usize>>,

    /// First time channel to search. `None` starts at channel 0.
    /// Default: None
    pub min_chan: Option<usize>,

    /// Last time channel to search (inclusive). `None` ends at the last
    /// channel.
    /// Default: None
    pub max_chan: Option<usize>,
}

impl Default for PeakSearchConfig {
    fn default() -> Self {
        Self {
            smooth: true,
            max_peaks: 50,
            threshold: None,
            rows: None,
            cols: None,
            min_chan: None,
            max_chan: None,
        }
    }
}

impl PeakSearchConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_peaks > 0, "max_peaks must be at least 1");
        if let Some(t) = self.threshold {
            ensure!(t.is_finite(), "threshold must be finite");
        }
        Ok(())
    }
}

/// One accepted peak: fitted center, extent, and the intensity at the seed
/// voxel.
///
/// Centers are fractional voxel coordinates (the center of voxel `i` is at
/// `i + 0.5`). Extents are always positive once a candidate is accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct PeakCandidate {
    /// Fitted row coordinate of the peak center.
    pub row: f32,
    /// Fitted column coordinate of the peak center.
    pub col: f32,
    /// Channel coordinate of the peak center (the seed channel; the time
    /// profile is too coarse to refine reliably).
    pub chan: f32,
    /// Extent in the row direction (two standard deviations of the center
    /// slice's intensity distribution).
    pub d_row: f32,
    /// Extent in the column direction.
    pub d_col: f32,
    /// Extent in the channel direction.
    pub d_chan: f32,
    /// Intensity at the seed voxel (of the smoothed data if smoothing was
    /// enabled).
    pub ipk: i32,
    /// Whether the peak passed at least one of the slice-profile quality
    /// tests. Weak-but-plausible peaks are still returned with this unset.
    pub valid: bool,
}

impl PeakCandidate {
    /// Whether the given voxel lies within this peak's exclusion zone
    /// (twice the extent plus one voxel, per axis).
    pub fn contains_point(&self, row: usize, col: usize, chan: usize) -> bool {
        (row as f32 + 0.5 - self.row).abs() <= 2.0 * self.d_row + 1.0
            && (col as f32 + 0.5 - self.col).abs() <= 2.0 * self.d_col + 1.0
            && (chan as f32 + 0.5 - self.chan).abs() <= 2.0 * self.d_chan + 1.0
    }

    /// Whether this peak's body overlaps another's: the center distance is
    /// within twice the sum of their extents plus one voxel, on every axis.
    pub fn overlaps(&self, other: &PeakCandidate) -> bool {
        (self.row - other.row).abs() <= 2.0 * (self.d_row + other.d_row) + 1.0
            && (self.col - other.col).abs() <= 2.0 * (self.d_col + other.d_col) + 1.0
            && (self.chan - other.chan).abs() <= 2.0 * (self.d_chan + other.d_chan) + 1.0
    }
}

/// Result of a peak search: the accepted peaks plus diagnostics.
#[derive(Debug, Clone)]
pub struct PeakSearchResult {
    /// Accepted peaks, strongest first.
    pub peaks: Vec<PeakCandidate>,
    /// The final intensity threshold after adjustment.
    pub threshold: f32,
    /// Number of voxels above the threshold in the searched sub-range.
    pub num_above_threshold: usize,
    /// Text log of every accept/reject decision and the chosen threshold.
    pub log: String,
}

/// Find peaks in a detector histogram.
///
/// The input histogram is not modified; smoothing (if enabled) works on a
/// copy. Returns an empty peak list, with the reason logged, when the data
/// has too little contrast for a meaningful threshold. Identical input and
/// configuration always produce an identical result, including the log.
pub fn find_peaks(hist: &VoxelHistogram, config: &PeakSearchConfig) -> Result<PeakSearchResult> {
    config.validate()?;

    let mut data = hist.clone();
    if config.smooth {
        data.smooth_3x3();
    }

    let n_rows = data.n_rows();
    let n_cols = data.n_cols();
    let n_chans = data.n_chans();
    let num_voxels = n_rows * n_cols * n_chans;

    let mut log = String::new();
    log.push_str(&format!("dimensions = {}x{}x{}\n", n_rows, n_cols, n_chans));

    // Normalize the channel sub-range the forgiving way: an out-of-order or
    // out-of-range request falls back to the full range.
    let mut min_chan = config.min_chan.unwrap_or(0);
    let mut max_chan = config.max_chan.unwrap_or(n_chans - 1).min(n_chans - 1);
    if min_chan > max_chan {
        min_chan = 0;
        max_chan = n_chans - 1;
    }
    log.push_str(&format!("channels searched = {}..={}\n", min_chan, max_chan));

    // ── Step 1: intensity histogram and CDF over the whole array ──
    let mut buckets = vec![0usize; NUM_BUCKETS];
    for r in 0..n_rows {
        for c in 0..n_cols {
            for ch in 0..n_chans {
                let b = (data.value(r, c, ch) as i64).clamp(0, NUM_BUCKETS as i64 - 1);
                buckets[b as usize] += 1;
            }
        }
    }
    // cdf[k] = number of voxels with truncated intensity <= k
    let mut cdf = buckets;
    for i in 1..NUM_BUCKETS {
        cdf[i] += cdf[i - 1];
    }

    // ── Step 2: threshold selection ──
    let mut threshold = match config.threshold {
        Some(t) if t > 0.0 && (t as usize) < NUM_BUCKETS => t as usize,
        _ => {
            // Pick the bucket boundary below which ~99.9% of voxels fall.
            let cutoff = (num_voxels as f64 * 0.999) as usize;
            let mut t = 0;
            while t < NUM_BUCKETS - 1 && cdf[t] < cutoff {
                t += 1;
            }
            log.push_str(&format!("computed threshold = {}\n", t));
            t
        }
    };

    // Wherever the threshold came from, never let more than 1% of the
    // voxels qualify as candidates.
    let cutoff = (num_voxels as f64 * 0.99) as usize;
    while threshold < NUM_BUCKETS - 1 && cdf[threshold] < cutoff {
        threshold += 1;
    }
    // For low-count data the cap may have pushed the threshold above every
    // voxel. Shift back down until something qualifies.
    while threshold > 0 && cdf[threshold] >= num_voxels {
        threshold -= 1;
    }
    // A peak still needs a handful of counts. The smoothed floor is higher
    // since smoothing sums a 3x3 neighborhood.
    let floor = if config.smooth { 5 } else { 3 };
    if threshold < floor {
        threshold = floor;
    }
    log.push_str(&format!("threshold = {}\n", threshold));

    // Contrast check: if almost nothing falls below the threshold, the data
    // is close to flat and any "peaks" would be noise. Not an error.
    let excluded = cdf[threshold];
    if (excluded as f64) < num_voxels as f64 * MIN_EXCLUDED_FRACTION {
        log.push_str(&format!(
            "insufficient contrast: threshold {} excludes only {} of {} voxels, no peak search\n",
            threshold, excluded, num_voxels
        ));
        debug!(threshold, excluded, num_voxels, "insufficient contrast, returning no peaks");
        return Ok(PeakSearchResult {
            peaks: Vec::new(),
            threshold: threshold as f32,
            num_above_threshold: 0,
            log,
        });
    }

    // ── Step 3: collect supra-threshold voxels in the searched sub-range ──
    let all_rows: Vec<usize>;
    let rows: &[usize] = match &config.rows {
        Some(list) => list,
        None => {
            all_rows = (0..n_rows).collect();
            &all_rows
        }
    };
    let all_cols: Vec<usize>;
    let cols: &[usize] = match &config.cols {
        Some(list) => list,
        None => {
            all_cols = (0..n_cols).collect();
            &all_cols
        }
    };

    // (value, row, col, chan) sorts by value first, with the coordinates as
    // a deterministic tie-break.
    let mut candidates: Vec<(i32, usize, usize, usize)> = Vec::new();
    let mut max_value = 0i32;
    for &row in rows {
        for &col in cols {
            if row >= n_rows || col >= n_cols {
                continue;
            }
            for chan in min_chan..=max_chan {
                let value = data.value(row, col, chan) as i32;
                max_value = max_value.max(value);
                if value > threshold as i32 {
                    candidates.push((value, row, col, chan));
                }
            }
        }
    }
    candidates.sort_unstable_by(|a, b| b.cmp(a));

    let num_above_threshold = candidates.len();
    log.push_str(&format!("max value in searched range = {}\n", max_value));
    log.push_str(&format!("{} voxels over {}\n", num_above_threshold, threshold));
    debug!(
        threshold,
        num_above_threshold, "intensity threshold selected"
    );

    // ── Step 4: walk candidates strongest-first ──
    let mut peaks: Vec<PeakCandidate> = Vec::new();
    for &(value, row, col, chan) in &candidates {
        if peaks.len() >= config.max_peaks {
            break;
        }

        // Inside an accepted peak's exclusion zone?
        if let Some(i) = peaks.iter().position(|p| p.contains_point(row, col, chan)) {
            log_discard(&mut log, "overlaps peak", row, col, chan, value, Some(i));
            continue;
        }

        if !is_local_max(&data, row, col, chan) {
            log_discard(&mut log, "not local max", row, col, chan, value, None);
            continue;
        }

        log.push_str(&format!(
            "\nchecking possible peak at ({}, {}, {}) value {}\n",
            row, col, chan, value
        ));
        let peak = match fit_extent(&data, row, col, chan, value, &mut log) {
            Some(p) => p,
            None => {
                log_discard(&mut log, "undefined centroid", row, col, chan, value, None);
                continue;
            }
        };

        // The grown body may reach a peak the seed voxel missed.
        if let Some(i) = peaks.iter().position(|p| p.overlaps(&peak)) {
            log_discard(&mut log, "body overlaps peak", row, col, chan, value, Some(i));
            continue;
        }

        log.push_str(&format!(
            "accepted peak {}: center ({:.2}, {:.2}, {:.2}) extent ({:.2}, {:.2}, {:.2})\n",
            peaks.len(),
            peak.row,
            peak.col,
            peak.chan,
            peak.d_row,
            peak.d_col,
            peak.d_chan
        ));
        peaks.push(peak);
    }

    log.push_str(&format!("\nnumber of peaks = {}\n", peaks.len()));
    debug!(n_peaks = peaks.len(), "peak search complete");

    Ok(PeakSearchResult {
        peaks,
        threshold: threshold as f32,
        num_above_threshold,
        log,
    })
}

// ─── Internal helpers ──────────────────────────────────────────────────────

fn log_discard(
    log: &mut String,
    reason: &str,
    row: usize,
    col: usize,
    chan: usize,
    value: i32,
    index: Option<usize>,
) {
    match index {
        Some(i) => log.push_str(&format!(
            "{:3} {:3} {:4} {:6} discarded: {} {}\n",
            row, col, chan, value, reason, i
        )),
        None => log.push_str(&format!(
            "{:3} {:3} {:4} {:6} discarded: {}\n",
            row, col, chan, value, reason
        )),
    }
}

/// Whether no voxel in the clipped `+-LOCAL_MAX_SPAN` neighborhood exceeds
/// the value at `(row, col, chan)`.
fn is_local_max(data: &VoxelHistogram, row: usize, col: usize, chan: usize) -> bool {
    let center = data.value(row, col, chan);
    let r_hi = (row + LOCAL_MAX_SPAN).min(data.n_rows() - 1);
    let c_hi = (col + LOCAL_MAX_SPAN).min(data.n_cols() - 1);
    let ch_hi = (chan + LOCAL_MAX_SPAN).min(data.n_chans() - 1);
    for r in row.saturating_sub(LOCAL_MAX_SPAN)..=r_hi {
        for c in col.saturating_sub(LOCAL_MAX_SPAN)..=c_hi {
            for ch in chan.saturating_sub(LOCAL_MAX_SPAN)..=ch_hi {
                if data.value(r, c, ch) > center {
                    return false;
                }
            }
        }
    }
    true
}

/// Fit a candidate's centroid and extent from the five time slices centered
/// on the seed channel.
///
/// Returns `None` when the full set of slices does not exist (seed too close
/// to the channel borders) or when the center slice's background-corrected
/// centroid is undefined, which happens when the background estimate
/// swallows the peak.
fn fit_extent(
    data: &VoxelHistogram,
    row: usize,
    col: usize,
    chan: usize,
    ipk: i32,
    log: &mut String,
) -> Option<PeakCandidate> {
    if chan < 2 || chan + 2 >= data.n_chans() {
        return None;
    }
    let seed_row = row as f32 + 0.5;
    let seed_col = col as f32 + 0.5;

    let mut slices = Vec::with_capacity(5);
    for ch in chan - 2..=chan + 2 {
        let slice = fit_slice(data, ch, seed_row, seed_col);
        log.push_str(&slice.summary_line());
        slices.push(slice);
    }
    let center = &slices[2];
    let (c_row, c_col) = center.centroid()?;

    // A centroid that wanders far from the seed voxel means the local
    // intensity distribution is not peak-like; fall back to the seed.
    let row_cent = if (c_row - seed_row).abs() >= MAX_CENTROID_DRIFT {
        log.push_str("row centroid moved 5 pixels or more, keeping seed row\n");
        seed_row
    } else {
        c_row
    };
    let col_cent = if (c_col - seed_col).abs() >= MAX_CENTROID_DRIFT {
        log.push_str("column centroid moved 5 pixels or more, keeping seed column\n");
        seed_col
    } else {
        c_col
    };

    // Quality tests on the slice profile. None of them gates acceptance;
    // the combination is reported through `valid` for downstream filtering.
    let sig_noise = center.signal_to_noise();
    let test_noise = sig_noise > 5.0;
    log.push_str(&format!(
        "{} signal to noise = {:.2}\n",
        pass_str(test_noise),
        sig_noise
    ));

    // The center slice should stand well above the slices two channels away.
    // If those are empty the count rate is very low; accept on raw intensity.
    let side_ipk = (slices[0].ipk + slices[4].ipk) / 2.0;
    let test_ipk = if side_ipk > 0.0 {
        center.ipk / side_ipk > 3.0
    } else {
        center.ipk > 9.0
    };
    log.push_str(&format!(
        "{} center/side ipk: {:.1} vs {:.1}\n",
        pass_str(test_ipk),
        center.ipk,
        side_ipk
    ));

    let back_ave = center.back_ave();
    let test_back = back_ave > 0.0 && center.peak_ave() / back_ave > 4.0;
    log.push_str(&format!(
        "{} peak/background average: {:.2} vs {:.2}\n",
        pass_str(test_back),
        center.peak_ave(),
        back_ave
    ));

    let side_signal = ((slices[0].signal() + slices[4].signal()) / 2.0).abs();
    let test_signal = if side_signal > 0.0 {
        center.signal() / side_signal > 12.0
    } else {
        center.signal() > 12.0
    };
    log.push_str(&format!(
        "{} center/side signal: {:.2} vs {:.2}\n",
        pass_str(test_signal),
        center.signal(),
        side_signal
    ));

    Some(PeakCandidate {
        row: row_cent,
        col: col_cent,
        chan: chan as f32 + 0.5,
        d_row: 2.0 * center.row_sigma,
        d_col: 2.0 * center.col_sigma,
        d_chan: 1.0,
        ipk,
        valid: test_ipk || test_back || test_signal,
    })
}

fn pass_str(passed: bool) -> &'static str {
    if passed {
        "pass"
    } else {
        "FAIL"
    }
}

/// Accumulated statistics for one time slice of a candidate peak.
#[derive(Debug, Clone)]
struct SliceStats {
    chan: usize,
    ipk: f32,
    total: f32,
    row_mean: f32,
    col_mean: f32,
    row_sigma: f32,
    col_sigma: f32,
    peak_num: usize,
    back_num: usize,
    peak_total: f32,
    back_total: f32,
    row_index_sum: f32,
    col_index_sum: f32,
    row_value_sum: f32,
    col_value_sum: f32,
}

/// Fit one slice: iterate the windowed weighted mean/sigma until it settles,
/// then split a larger window into a peak disk and a background annulus for
/// the background-corrected centroid sums.
fn fit_slice(data: &VoxelHistogram, chan: usize, row0: f32, col0: f32) -> SliceStats {
    let mut slice = SliceStats {
        chan,
        ipk: 0.0,
        total: 0.0,
        row_mean: row0,
        col_mean: col0,
        row_sigma: 1.0,
        col_sigma: 1.0,
        peak_num: 0,
        back_num: 0,
        peak_total: 0.0,
        back_total: 0.0,
        row_index_sum: 0.0,
        col_index_sum: 0.0,
        row_value_sum: 0.0,
        col_value_sum: 0.0,
    };
    // If the slice holds a real peak the mean and sigma settle within a few
    // passes; on pure noise the sigma keeps creeping up instead.
    for _ in 0..MEAN_ITERATIONS {
        slice.refine_mean(data);
    }
    slice.centroid_pass(data);
    slice
}

/// Clipped index window `[center - half, center + half]`, truncated like the
/// surrounding arithmetic.
fn window(center: f32, half: f32, len: usize) -> (usize, usize) {
    let lo = ((center - half) as i64).max(0) as usize;
    let hi = (((center + half) as i64).max(0) as usize).min(len - 1);
    (lo, hi)
}

impl SliceStats {
    /// One pass of the windowed weighted mean and standard deviation.
    fn refine_mean(&mut self, data: &VoxelHistogram) {
        let row_half = if self.row_sigma >= 1.0 {
            2.0 * self.row_sigma
        } else {
            2.0
        };
        let col_half = if self.col_sigma >= 1.0 {
            2.0 * self.col_sigma
        } else {
            2.0
        };
        let (row_0, row_1) = window(self.row_mean, row_half, data.n_rows());
        let (col_0, col_1) = window(self.col_mean, col_half, data.n_cols());

        let mut row_sum = 0.0f32;
        let mut col_sum = 0.0f32;
        let mut row_sum_2 = 0.0f32;
        let mut col_sum_2 = 0.0f32;
        let mut total = 0.0f32;
        let mut ipk = 0.0f32;
        for row in row_0..=row_1 {
            for col in col_0..=col_1 {
                let value = data.value(row, col, self.chan);
                total += value;
                ipk = ipk.max(value);

                let row_prod = (row as f32 + 0.5) * value;
                let col_prod = (col as f32 + 0.5) * value;
                row_sum += row_prod;
                col_sum += col_prod;
                row_sum_2 += row_prod * (row as f32 + 0.5);
                col_sum_2 += col_prod * (col as f32 + 0.5);
            }
        }

        self.total = total;
        self.ipk = ipk;
        if total == 0.0 {
            return;
        }
        self.row_mean = row_sum / total;
        self.col_mean = col_sum / total;

        // Rounding can push the variance slightly negative; treat that as 0.
        // The sigma never drops below 1 voxel.
        let row_var = row_sum_2 / total - self.row_mean * self.row_mean;
        if row_var >= 1.0 {
            self.row_sigma = row_var.sqrt();
        }
        let col_var = col_sum_2 / total - self.col_mean * self.col_mean;
        if col_var >= 1.0 {
            self.col_sigma = col_var.sqrt();
        }
    }

    /// Split a widened window into a peak disk (radius from the fitted
    /// sigmas) and a background annulus, accumulating the sums the
    /// background-corrected centroid needs.
    fn centroid_pass(&mut self, data: &VoxelHistogram) {
        let (row_0, row_1) = window(self.row_mean, 2.0 * self.row_sigma + 2.0, data.n_rows());
        let (col_0, col_1) = window(self.col_mean, 2.0 * self.col_sigma + 2.0, data.n_cols());
        let dy = 2.0 * self.row_sigma;
        let dx = 2.0 * self.col_sigma;
        let radius_sq = dx * dx + dy * dy;

        for row in row_0..=row_1 {
            for col in col_0..=col_1 {
                let value = data.value(row, col, self.chan);
                let row_dist = row as f32 + 0.5 - self.row_mean;
                let col_dist = col as f32 + 0.5 - self.col_mean;
                if row_dist * row_dist + col_dist * col_dist >= radius_sq {
                    self.back_total += value;
                    self.back_num += 1;
                } else {
                    self.peak_total += value;
                    self.peak_num += 1;
                    self.row_index_sum += row as f32 + 0.5;
                    self.col_index_sum += col as f32 + 0.5;
                    self.row_value_sum += (row as f32 + 0.5) * value;
                    self.col_value_sum += (col as f32 + 0.5) * value;
                }
            }
        }
    }

    /// Background-corrected centroid of this slice, or `None` when there is
    /// no background region or the net peak count is non-positive.
    fn centroid(&self) -> Option<(f32, f32)> {
        if self.back_num == 0 {
            return None;
        }
        let ave_back = self.back_total / self.back_num as f32;
        let net = self.peak_total - self.peak_num as f32 * ave_back;
        if net <= 0.0 {
            return None;
        }
        Some((
            (self.row_value_sum - self.row_index_sum * ave_back) / net,
            (self.col_value_sum - self.col_index_sum * ave_back) / net,
        ))
    }

    fn peak_ave(&self) -> f32 {
        if self.peak_num == 0 {
            0.0
        } else {
            self.peak_total / self.peak_num as f32
        }
    }

    fn back_ave(&self) -> f32 {
        if self.back_num == 0 {
            0.0
        } else {
            self.back_total / self.back_num as f32
        }
    }

    /// `(peak average - background average) / background average`, or 0 when
    /// there is no background.
    fn signal_to_noise(&self) -> f32 {
        let back_ave = self.back_ave();
        if back_ave > 0.0 {
            (self.peak_ave() - back_ave) / back_ave
        } else {
            0.0
        }
    }

    /// Average count above background in the peak region.
    fn signal(&self) -> f32 {
        self.peak_ave() - self.back_ave()
    }

    fn summary_line(&self) -> String {
        format!(
            "slice {:4}  mean ({:7.2}, {:7.2})  sigma ({:5.2}, {:5.2})  ipk {:6.0}  total {:8.0}  npk {:4}  nbk {:4}\n",
            self.chan,
            self.row_mean,
            self.col_mean,
            self.row_sigma,
            self.col_sigma,
            self.ipk,
            self.total,
            self.peak_num,
            self.back_num
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};

    fn raw_config() -> PeakSearchConfig {
        PeakSearchConfig {
            smooth: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_single_isolated_voxel() {
        let mut hist = VoxelHistogram::from_raw(vec![0.0; 20 * 20 * 12], 20, 20, 12).unwrap();
        hist.set_value(10, 9, 6, 100.0);

        let result = find_peaks(&hist, &raw_config()).unwrap();
        assert_eq!(result.peaks.len(), 1);
        let pk = &result.peaks[0];
        assert_relative_eq!(pk.row, 10.5, epsilon = 1e-4);
        assert_relative_eq!(pk.col, 9.5, epsilon = 1e-4);
        assert_relative_eq!(pk.chan, 6.5, epsilon = 1e-4);
        assert_eq!(pk.ipk, 100);
        assert!(pk.d_row > 0.0 && pk.d_col > 0.0 && pk.d_chan > 0.0);
        // Sharp isolated spike with zero background passes the intensity test.
        assert!(pk.valid);
    }

    #[test]
    fn test_stronger_of_overlapping_pair_survives() {
        let mut hist = VoxelHistogram::from_raw(vec![0.0; 20 * 20 * 12], 20, 20, 12).unwrap();
        hist.set_value(10, 10, 6, 100.0);
        hist.set_value(12, 10, 6, 80.0);

        let result = find_peaks(&hist, &raw_config()).unwrap();
        assert_eq!(result.peaks.len(), 1);
        assert_eq!(result.peaks[0].ipk, 100);
        assert!(result.log.contains("discarded"));
    }

    #[test]
    fn test_uniform_data_has_no_contrast() {
        let hist = VoxelHistogram::from_raw(vec![7.0; 10 * 10 * 10], 10, 10, 10).unwrap();
        let result = find_peaks(&hist, &raw_config()).unwrap();
        assert!(result.peaks.is_empty());
        assert_eq!(result.num_above_threshold, 0);
        assert!(result.log.contains("insufficient contrast"));
    }

    #[test]
    fn test_requested_count_caps_results() {
        let mut hist = VoxelHistogram::from_raw(vec![0.0; 40 * 20 * 12], 40, 20, 12).unwrap();
        hist.set_value(5, 10, 6, 100.0);
        hist.set_value(15, 10, 6, 90.0);
        hist.set_value(25, 10, 6, 80.0);
        hist.set_value(35, 10, 6, 70.0);

        let config = PeakSearchConfig {
            smooth: false,
            max_peaks: 2,
            ..Default::default()
        };
        let result = find_peaks(&hist, &config).unwrap();
        assert_eq!(result.peaks.len(), 2);
        // Strongest first.
        assert_eq!(result.peaks[0].ipk, 100);
        assert_eq!(result.peaks[1].ipk, 90);
    }

    #[test]
    fn test_smoothed_search_finds_point_peak() {
        let mut hist = VoxelHistogram::from_raw(vec![0.0; 20 * 20 * 12], 20, 20, 12).unwrap();
        hist.set_value(10, 10, 5, 90.0);

        let config = PeakSearchConfig {
            smooth: true,
            ..Default::default()
        };
        let result = find_peaks(&hist, &config).unwrap();
        // Smoothing spreads the spike over a 3x3 plateau; only one peak may
        // come out of it.
        assert_eq!(result.peaks.len(), 1);
        let pk = &result.peaks[0];
        assert_relative_eq!(pk.row, 10.5, epsilon = 1e-3);
        assert_relative_eq!(pk.col, 10.5, epsilon = 1e-3);
        assert_relative_eq!(pk.chan, 5.5, epsilon = 1e-3);
    }

    #[test]
    fn test_deterministic_over_reruns() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut data = vec![0.0f32; 30 * 30 * 10];
        for v in data.iter_mut() {
            *v = rng.gen_range(0.0..4.0);
        }
        let mut hist = VoxelHistogram::from_raw(data, 30, 30, 10).unwrap();
        hist.set_value(8, 8, 4, 120.0);
        hist.set_value(20, 22, 5, 95.0);

        let a = find_peaks(&hist, &raw_config()).unwrap();
        let b = find_peaks(&hist, &raw_config()).unwrap();
        assert_eq!(a.peaks, b.peaks);
        assert_eq!(a.log, b.log);
        assert_eq!(a.threshold, b.threshold);
    }

    #[test]
    fn test_candidate_near_channel_border_is_rejected() {
        let mut hist = VoxelHistogram::from_raw(vec![0.0; 20 * 20 * 12], 20, 20, 12).unwrap();
        // Channel 1 cannot supply the two slices below it.
        hist.set_value(10, 10, 1, 100.0);

        let result = find_peaks(&hist, &raw_config()).unwrap();
        assert!(result.peaks.is_empty());
        assert!(result.log.contains("undefined centroid"));
    }

    #[test]
    fn test_overlap_predicates() {
        let peak = PeakCandidate {
            row: 10.5,
            col: 10.5,
            chan: 6.5,
            d_row: 2.0,
            d_col: 2.0,
            d_chan: 1.0,
            ipk: 50,
            valid: true,
        };
        // Exclusion zone is 2*extent + 1 per axis.
        assert!(peak.contains_point(14, 10, 6));
        assert!(!peak.contains_point(16, 10, 6));
        assert!(!peak.contains_point(10, 10, 10));

        let near = PeakCandidate {
            row: 18.0,
            col: 10.5,
            chan: 6.5,
            d_row: 1.0,
            d_col: 1.0,
            d_chan: 1.0,
            ipk: 20,
            valid: false,
        };
        // Row distance 7.5 <= 2*(2+1)+1 = 7 fails, so no body overlap.
        assert!(!peak.overlaps(&near));
        let closer = PeakCandidate { row: 17.0, ..near };
        assert!(peak.overlaps(&closer));
    }

    #[test]
    fn test_explicit_row_col_lists_restrict_search() {
        let mut hist = VoxelHistogram::from_raw(vec![0.0; 20 * 20 * 12], 20, 20, 12).unwrap();
        hist.set_value(5, 5, 6, 100.0);
        hist.set_value(14, 14, 6, 90.0);

        let config = PeakSearchConfig {
            smooth: false,
            rows: Some((0..10).collect()),
            cols: Some((0..10).collect()),
            ..Default::default()
        };
        let result = find_peaks(&hist, &config).unwrap();
        assert_eq!(result.peaks.len(), 1);
        assert_eq!(result.peaks[0].ipk, 100);
    }

    #[test]
    fn test_rejects_zero_max_peaks() {
        let hist = VoxelHistogram::from_raw(vec![0.0; 8], 2, 2, 2).unwrap();
        let config = PeakSearchConfig {
            max_peaks: 0,
            ..Default::default()
        };
        assert!(find_peaks(&hist, &config).is_err());
    }
}
