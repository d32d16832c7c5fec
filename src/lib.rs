//! # autoindex
//!
//! **Peak finding and orientation-matrix autoindexing** for single-crystal
//! diffraction data, written in Rust.
//!
//! Given a raw 3-D detector histogram (row, column, time channel), `autoindex`
//! locates Bragg peaks, and given peak positions mapped into reciprocal space
//! it determines the crystal orientation ("UB") matrix — no prior knowledge of
//! the unit cell required.
//!
//! ## Features
//!
//! - **Percentile thresholding** — peak candidates selected against a
//!   histogram-derived intensity cutoff that adapts to the data contrast
//! - **Centroid & extent fitting** — each candidate gets an iteratively
//!   refined centroid and extent from neighboring time slices; overlapping
//!   or ill-defined candidates are rejected with a logged reason
//! - **Hemisphere direction search** — trial projection directions scored by
//!   the autocorrelation periodicity of binned 1-D peak projections
//! - **Parallel** — the hemisphere is split into disjoint regions searched
//!   concurrently with [rayon](https://docs.rs/rayon), merged lock-free
//! - **Exhaustive variant** — enumerate combinations of well-scoring
//!   directions and return every distinct orientation matrix found
//!
//! ## Example
//!
//! ```no_run
//! use autoindex::indexer::{find_ub_matrix, IndexConfig};
//! use autoindex::ObservedPeak;
//!
//! // Peak positions as Q/2π vectors, e.g. from peak extraction plus the
//! // instrument geometry mapping.
//! let peaks: Vec<ObservedPeak> = load_peaks();
//!
//! let config = IndexConfig {
//!     max_cell_edge: 15.0,
//!     ..Default::default()
//! };
//!
//! let solution = find_ub_matrix(&peaks, &config).unwrap();
//! println!("UB = {}", solution.ub);
//! println!("indexed {:.1}% at 0.2 tolerance", solution.stats.percent_at(0.2));
//! # fn load_peaks() -> Vec<autoindex::ObservedPeak> { vec![] }
//! ```
//!
//! ## Algorithm overview
//!
//! 1. **Peak extraction** — smooth each time slice with a 3x3 kernel,
//!    threshold at (roughly) the 99.9th intensity percentile, then walk the
//!    surviving voxels in descending-intensity order keeping only isolated
//!    local maxima with a well-defined centroid
//! 2. **Direction scoring** — project all peaks onto a trial unit direction,
//!    bin the projections, and find the dominant period of the binned curve
//!    via normalized autocorrelation; the fraction of intensity landing near
//!    integer multiples of that period gives a fit metric
//! 3. **Direction selection** — scan a hemisphere of trial directions on a
//!    refining grid, keeping a ranked candidate list; pick the three best
//!    mutually independent directions
//! 4. **UB construction** — each selected direction times its period is a
//!    reciprocal lattice vector; the inverse of the matrix of those rows is a
//!    provisional UB, refined by an `f64` least-squares fit of integer
//!    indices to the observed peak positions
//!
//! The algorithms follow the peak-search and orientation-matrix tools long
//! used for time-of-flight single-crystal instruments (Rossi et al.,
//! "Rapid indexing of TOF Laue data", J. Appl. Cryst.).

pub mod histogram;
pub mod indexer;
mod peak;
pub mod peak_extraction;

pub use histogram::VoxelHistogram;
pub use indexer::{
    find_all_ub_matrices, find_ub_matrix, IndexConfig, IndexStats, LatticeParams,
    LatticeReduction, UbCandidate,
};
pub use peak::ObservedPeak;
pub use peak_extraction::{
    find_peaks, PeakCandidate, PeakSearchConfig, PeakSearchResult,
};

// Commonly used types
// Note: 32-bit floats are sufficient for projection scoring and peak
// extraction. We switch to 64-bit for the SVD-based least-squares fit that
// produces the final UB matrix, where 32-bit floats lose too much accuracy.
pub type Vector3 = nalgebra::Vector3<f32>;
pub type Matrix3 = nalgebra::Matrix3<f32>;
pub type Vector3d = nalgebra::Vector3<f64>;
pub type Matrix3d = nalgebra::Matrix3<f64>;
