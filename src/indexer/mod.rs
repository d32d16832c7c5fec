//! Orientation-matrix determination from reciprocal-space peak positions.
//!
//! The entry points are [`find_ub_matrix`] (the best single UB matrix, with
//! an omission feedback loop) and [`find_all_ub_matrices`] (every distinct
//! UB matrix buildable from well-scoring direction triples).  Both have
//! `_with` variants accepting an external [`LatticeReduction`] service that
//! converts the refined matrix to a conventional reduced cell.

pub mod projection;
pub mod search;
mod triples;
mod ub;

pub use projection::{score_direction, DirectionScore, ProjectionBuffer};
pub use search::{scan_directions, select_plane_normals, CandidateList};
pub use ub::{
    find_all_ub_matrices, find_all_ub_matrices_with, find_ub_matrix, find_ub_matrix_with,
    index_fraction, omit_unindexed,
};

use crate::Matrix3d;
use anyhow::{ensure, Result};

/// Configuration for the direction search and UB construction.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Maximum real-space unit-cell edge length in Angstroms. Bounds the
    /// projection bin width and therefore the longest detectable period.
    pub max_cell_edge: f32,
    /// Minimum acceptable d-spacing in Angstroms; plane families implying a
    /// finer spacing are rejected in the exhaustive search.
    pub min_d_spacing: f32,
    /// Starting angular grid spacing for the hemisphere scan.
    pub initial_grid: f32,
    /// Floor for grid refinement; reaching it ends the outer loop with the
    /// best directions found so far.
    pub min_grid: f32,
    /// Half-width of the (x, y) elimination box deciding whether two trial
    /// directions count as the same direction.
    pub duplicate_window: f32,
    /// Minimum number of scored candidates a scan must produce before its
    /// result is trusted; fewer triggers grid refinement.
    pub min_candidates: usize,
    /// Cap on distinct matrices returned by the exhaustive search.
    pub max_matrices: usize,
    /// Search hemisphere regions on the rayon pool (at most four tasks).
    /// Disable for strictly sequential, run-to-run identical scans.
    pub parallel: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_cell_edge: 20.0,
            min_d_spacing: 1.0,
            initial_grid: 0.02,
            min_grid: 0.005,
            duplicate_window: 0.2,
            min_candidates: 100,
            max_matrices: 200,
            parallel: true,
        }
    }
}

impl IndexConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_cell_edge.is_finite() && self.max_cell_edge > 0.0,
            "max_cell_edge must be finite and positive"
        );
        ensure!(
            self.min_d_spacing.is_finite() && self.min_d_spacing > 0.0,
            "min_d_spacing must be finite and positive"
        );
        ensure!(
            self.initial_grid.is_finite() && self.initial_grid > 0.0 && self.initial_grid < 1.0,
            "initial_grid must be in (0, 1)"
        );
        ensure!(
            self.min_grid > 0.0 && self.min_grid <= self.initial_grid,
            "min_grid must be positive and no larger than initial_grid"
        );
        ensure!(
            self.duplicate_window.is_finite() && self.duplicate_window > 0.0,
            "duplicate_window must be finite and positive"
        );
        Ok(())
    }
}

/// Cumulative indexing statistics across tolerance bands.
///
/// `bands[i]` is the percentage of peaks whose worst Miller-index offset
/// from an integer is below `0.1 * (i + 1)`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IndexStats {
    pub bands: [f32; 5],
}

impl IndexStats {
    /// Compute the band statistics of `ub` against the full peak list.
    pub fn from_ub(ub: &Matrix3d, peaks: &[crate::ObservedPeak]) -> Self {
        let mut stats = Self::default();
        let inv = match ub.try_inverse() {
            Some(inv) => inv,
            None => return stats,
        };
        if peaks.is_empty() {
            return stats;
        }
        let mut counts = [0usize; 5];
        for pk in peaks {
            let q = crate::Vector3d::new(pk.q.x as f64, pk.q.y as f64, pk.q.z as f64);
            let miller = inv * q;
            let worst = miller
                .iter()
                .map(|m| (m - m.round()).abs())
                .fold(0.0f64, f64::max);
            let band = (worst / 0.1) as usize;
            if band < counts.len() {
                counts[band] += 1;
            }
        }
        let mut running = 0usize;
        for (i, c) in counts.iter().enumerate() {
            running += c;
            stats.bands[i] = running as f32 * 100.0 / peaks.len() as f32;
        }
        stats
    }

    /// Percentage of peaks indexed within the given tolerance (rounded to
    /// the nearest 0.1 band).
    pub fn percent_at(&self, tolerance: f32) -> f32 {
        let band = ((tolerance / 0.1).round() as usize).clamp(1, self.bands.len());
        self.bands[band - 1]
    }
}

/// Unit-cell edge lengths, angles and volume derived from a UB matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatticeParams {
    /// Edge lengths in Angstroms.
    pub a: f64,
    pub b: f64,
    pub c: f64,
    /// Cell angles in degrees.
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    /// Cell volume in cubic Angstroms.
    pub volume: f64,
}

impl LatticeParams {
    /// Derive the real-space cell from a UB matrix mapping (h,k,l) to q.
    ///
    /// The rows of `ub^-1` are the real-space cell axes; returns `None` for
    /// a singular or non-finite matrix.
    pub fn from_ub(ub: &Matrix3d) -> Option<Self> {
        let inv = ub.try_inverse()?;
        let a_vec = inv.row(0).transpose();
        let b_vec = inv.row(1).transpose();
        let c_vec = inv.row(2).transpose();
        let (a, b, c) = (a_vec.norm(), b_vec.norm(), c_vec.norm());
        if !(a > 0.0 && b > 0.0 && c > 0.0) {
            return None;
        }
        let angle = |u: &crate::Vector3d, v: &crate::Vector3d, lu: f64, lv: f64| {
            (u.dot(v) / (lu * lv)).clamp(-1.0, 1.0).acos().to_degrees()
        };
        let params = Self {
            a,
            b,
            c,
            alpha: angle(&b_vec, &c_vec, b, c),
            beta: angle(&a_vec, &c_vec, a, c),
            gamma: angle(&a_vec, &b_vec, a, b),
            volume: inv.determinant().abs(),
        };
        if params.volume.is_finite() && params.volume > 0.0 {
            Some(params)
        } else {
            None
        }
    }
}

/// One accepted orientation matrix with its diagnostics.
#[derive(Debug, Clone)]
pub struct UbCandidate {
    /// The UB matrix, mapping integer (h,k,l) to reciprocal q vectors.
    pub ub: Matrix3d,
    /// Real-space cell parameters implied by `ub`.
    pub lattice: LatticeParams,
    /// Indexing percentages per tolerance band.
    pub stats: IndexStats,
}

/// External lattice-reduction ("blind indexing") service.
///
/// Implementations convert an arbitrary UB matrix into a conventional
/// reduced-cell form, returning `None` when reduction fails.  The search
/// itself treats the algorithm as opaque.
pub trait LatticeReduction {
    fn reduce(&self, ub: &Matrix3d) -> Option<Matrix3d>;
}
