//! Peak position in reciprocal space.

use crate::Vector3;

/// A measured Bragg peak, positioned in reciprocal space.
///
/// `q` is the scattering vector divided by 2π, so that for an indexed peak
/// `q = UB * (h, k, l)` with integer Miller indices. `ipk_obs` carries the
/// observed peak intensity count from extraction; projection scoring uses it
/// to weight each peak's contribution to the binned curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObservedPeak {
    /// Reciprocal-space position, Q/2π, in inverse Angstroms.
    pub q: Vector3,
    /// Observed intensity at the peak voxel.
    pub ipk_obs: i32,
}

impl ObservedPeak {
    pub fn new(q: Vector3, ipk_obs: i32) -> Self {
        Self { q, ipk_obs }
    }

    /// The d-spacing implied by this peak alone, `1/|q|`.
    ///
    /// Returns `None` for a peak at the origin.
    pub fn d_spacing(&self) -> Option<f32> {
        let norm = self.q.norm();
        if norm > 0.0 {
            Some(1.0 / norm)
        } else {
            None
        }
    }
}
