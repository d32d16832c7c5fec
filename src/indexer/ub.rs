//! UB-matrix construction, refinement and the outer search loops.
//!
//! A triple of plane normals (direction unit vector times period) defines a
//! provisional UB matrix: the matrix with rows `normal_i / |normal_i|^2`
//! maps a q vector straight to (h,k,l), so its inverse maps indices to q.
//! The provisional matrix assigns integer indices to the observed peaks, and
//! an `f64` least-squares fit of those indices against the q vectors gives
//! the refined UB.

use anyhow::{bail, ensure, Result};
use nalgebra::DMatrix;
use tracing::{debug, info};

use super::projection::DirectionScore;
use super::search::{non_coplanar, scan_directions, select_plane_normals, CandidateList};
use super::triples::RankTriples;
use super::{IndexConfig, IndexStats, LatticeParams, LatticeReduction, UbCandidate};
use crate::{Matrix3d, ObservedPeak, Vector3, Vector3d};

/// Tolerance used to re-derive the omit mask before least-squares
/// refinement: peaks further than this from integer indices under the
/// provisional matrix are left out of the fit.
const REFINE_INDEX_TOLERANCE: f64 = 0.3;

/// Fraction of peaks the omission feedback loop may exclude before the
/// search treats its own tolerance as too aggressive and backs off.
const MAX_OMITTED_FRACTION: f32 = 0.59;

/// Per-entry relative difference below which two UB matrices count as the
/// same matrix.
const DUPLICATE_UB_EPS: f64 = 1e-2;

/// Safety bound on the number of direction triples examined by the
/// exhaustive search.
const MAX_TRIPLES: usize = 100_000;

/// Find the best UB matrix for the peak list.
///
/// See [`find_ub_matrix_with`]; this variant skips lattice reduction.
pub fn find_ub_matrix(peaks: &[ObservedPeak], config: &IndexConfig) -> Result<UbCandidate> {
    find_ub_matrix_with(peaks, config, None)
}

/// Find the best UB matrix for the peak list, with an omission feedback
/// loop over a refining direction-search grid.
///
/// Each iteration scans the hemisphere, selects up to three independent
/// plane normals, and omits peaks that fail to index against them; the scan
/// then repeats on the cleaned-up list.  The loop ends when all three
/// directions index the remaining peaks well, or the grid refines to its
/// floor.  Errors if no run of the search ever produced three usable
/// directions.
pub fn find_ub_matrix_with(
    peaks: &[ObservedPeak],
    config: &IndexConfig,
    reduction: Option<&dyn LatticeReduction>,
) -> Result<UbCandidate> {
    config.validate()?;
    ensure!(!peaks.is_empty(), "no peaks to index");

    let n = peaks.len();
    let mut omit = vec![false; n];
    let mut grid = config.initial_grid;
    let mut selection: Vec<DirectionScore> = Vec::new();
    let mut done = false;

    while !done {
        // Scan, refining the grid until the candidate pool is large enough
        // to trust the selection.
        loop {
            let list = scan_directions(
                peaks,
                Some(&omit),
                grid,
                config.max_cell_edge,
                config.parallel,
            );
            selection = select_plane_normals(&list, config.duplicate_window, grid);
            if (list.len() < config.min_candidates || selection.len() < 3)
                && grid / 2.0 > config.min_grid
            {
                grid /= 2.0;
                continue;
            }
            break;
        }

        // Omit peaks that sit between the lattice planes of a chosen
        // direction, with a tolerance derived from that direction's fit.
        let before = omitted_count(&omit);
        for dir in &selection {
            if dir.correlation > 0.0 && dir.fit > 0.0 {
                let level = (-(dir.fit_fraction() - 0.5) * 0.75 + 0.5).max(0.2);
                if level < 0.47 {
                    omit_unindexed(peaks, dir.plane_normal(), &mut omit, level);
                }
            }
        }
        let after = omitted_count(&omit);

        done = selection.len() == 3
            && (selection.iter().all(|d| d.fit_fraction() >= 0.75)
                || selection.iter().all(|d| d.correlation > 0.92));

        if after as f32 > MAX_OMITTED_FRACTION * n as f32 {
            // Omitting most of the data means the tolerances, not the
            // peaks, are wrong. Accept what we have.
            debug!(omitted = after, "omission ratio too high, backing off");
            omit.fill(false);
            done = true;
        } else if !done && after == before {
            // No progress at this grid: refine, or give up at the floor.
            grid /= 2.0;
            if grid < config.min_grid {
                done = true;
            } else {
                omit.fill(false);
            }
        }
        debug!(
            grid,
            directions = selection.len(),
            omitted = omitted_count(&omit),
            done,
            "outer iteration"
        );
    }

    ensure!(!selection.is_empty(), "no directions found");
    ensure!(
        selection.len() >= 3,
        "not enough directions to get UB matrix"
    );

    let normals = [
        selection[0].plane_normal(),
        selection[1].plane_normal(),
        selection[2].plane_normal(),
    ];
    let provisional = match provisional_ub(&normals) {
        Some(ub) => ub,
        None => bail!("not enough directions to get UB matrix"),
    };

    // Re-derive the omit mask from the provisional matrix, then refine.
    index_fraction(&provisional, peaks, REFINE_INDEX_TOLERANCE, Some(&mut omit));
    let mut ub = match refine_ub(peaks, &omit, &provisional) {
        Some(ub) => ub,
        None => bail!("not enough directions to get UB matrix"),
    };
    if let Some(service) = reduction {
        match service.reduce(&ub) {
            Some(reduced) => ub = reduced,
            None => bail!("lattice reduction failed"),
        }
    }

    let stats = IndexStats::from_ub(&ub, peaks);
    let lattice = match LatticeParams::from_ub(&ub) {
        Some(p) => p,
        None => bail!("refined UB matrix is singular"),
    };
    info!(
        indexed_pct = stats.percent_at(0.2),
        volume = lattice.volume,
        "UB matrix found"
    );
    Ok(UbCandidate { ub, lattice, stats })
}

/// Find every distinct UB matrix buildable from the candidate directions.
///
/// See [`find_all_ub_matrices_with`]; this variant skips lattice reduction.
pub fn find_all_ub_matrices(
    peaks: &[ObservedPeak],
    config: &IndexConfig,
) -> Result<Vec<UbCandidate>> {
    find_all_ub_matrices_with(peaks, config, None)
}

/// Exhaustive variant: scan once, collapse near-duplicate directions, then
/// walk direction triples in decreasing combined-score order, building a UB
/// matrix from every non-coplanar, sufficiently-resolved triple.
///
/// Returns the distinct matrices found (up to the configured cap), sorted
/// by the share of peaks they index at the 0.2 tolerance band.  A triple
/// whose matrix nearly equals an already-accepted one is skipped.
pub fn find_all_ub_matrices_with(
    peaks: &[ObservedPeak],
    config: &IndexConfig,
    reduction: Option<&dyn LatticeReduction>,
) -> Result<Vec<UbCandidate>> {
    config.validate()?;
    ensure!(!peaks.is_empty(), "no peaks to index");

    let mut grid = config.initial_grid;
    let list = loop {
        let list = scan_directions(peaks, None, grid, config.max_cell_edge, config.parallel);
        if list.len() < config.min_candidates && grid / 2.0 > config.min_grid {
            grid /= 2.0;
            continue;
        }
        break list;
    };
    ensure!(!list.is_empty(), "no directions found");

    let distinct = dedup_directions(&list, grid / 3.0, 0.5 / config.max_cell_edge);
    ensure!(
        distinct.len() >= 3,
        "not enough directions to get UB matrix"
    );
    debug!(
        candidates = list.len(),
        distinct = distinct.len(),
        "triple enumeration begins"
    );

    // Plane families with a period under one bin per cell edge, or with an
    // implied d-spacing below the caller's floor, cannot be real.
    let min_period = 1.0 / config.max_cell_edge;
    let max_period = 1.0 / config.min_d_spacing;

    let mut results: Vec<UbCandidate> = Vec::new();
    for ranks in RankTriples::new(distinct.len()).take(MAX_TRIPLES) {
        if results.len() >= config.max_matrices {
            break;
        }
        let triple = [&distinct[ranks[0]], &distinct[ranks[1]], &distinct[ranks[2]]];
        if triple
            .iter()
            .any(|d| d.period < min_period || d.period > max_period)
        {
            continue;
        }
        let normals = [
            triple[0].plane_normal(),
            triple[1].plane_normal(),
            triple[2].plane_normal(),
        ];
        if !non_coplanar(normals[0], normals[1], normals[2]) {
            continue;
        }
        let provisional = match provisional_ub(&normals) {
            Some(ub) => ub,
            None => continue,
        };
        let mut omit = vec![false; peaks.len()];
        index_fraction(&provisional, peaks, REFINE_INDEX_TOLERANCE, Some(&mut omit));
        let mut ub = match refine_ub(peaks, &omit, &provisional) {
            Some(ub) => ub,
            None => continue,
        };
        if let Some(service) = reduction {
            match service.reduce(&ub) {
                Some(reduced) => ub = reduced,
                None => continue,
            }
        }
        if !is_distinct(&ub, &results) {
            continue;
        }
        let lattice = match LatticeParams::from_ub(&ub) {
            Some(p) => p,
            None => continue,
        };
        let stats = IndexStats::from_ub(&ub, peaks);
        results.push(UbCandidate { ub, lattice, stats });
    }

    results.sort_by(|a, b| b.stats.percent_at(0.2).total_cmp(&a.stats.percent_at(0.2)));
    info!(matrices = results.len(), "exhaustive search complete");
    Ok(results)
}

/// Collapse candidates that describe the same direction: within `dup_xy` in
/// both x and y and `dup_period` in period.  Keeps the higher-ranked entry,
/// returns survivors best-first.
fn dedup_directions(
    list: &CandidateList,
    dup_xy: f32,
    dup_period: f32,
) -> Vec<DirectionScore> {
    let mut kept: Vec<DirectionScore> = Vec::new();
    for entry in list.iter_descending() {
        let duplicate = kept.iter().any(|k| {
            (entry.x - k.x).abs() <= dup_xy
                && (entry.y - k.y).abs() <= dup_xy
                && (entry.period - k.period).abs() <= dup_period
        });
        if !duplicate {
            kept.push(*entry);
        }
    }
    kept
}

/// Provisional UB matrix from three plane normals.
///
/// Returns `None` when a normal is degenerate or the row matrix is
/// numerically singular relative to its largest entry.
pub(crate) fn provisional_ub(normals: &[Vector3; 3]) -> Option<Matrix3d> {
    let mut rows = Matrix3d::zeros();
    for (i, normal) in normals.iter().enumerate() {
        let len_sq = normal.norm_squared() as f64;
        if !(len_sq > 0.0) || !len_sq.is_finite() {
            return None;
        }
        for j in 0..3 {
            rows[(i, j)] = normal[j] as f64 / len_sq;
        }
    }
    let max = rows.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    if rows.determinant().abs() < 1e-3 * max * max * max {
        return None;
    }
    rows.try_inverse()
}

/// Least-squares refinement of a provisional UB matrix.
///
/// Every non-omitted peak gets integer indices by rounding its provisional
/// Miller indices; the refined matrix minimizes the squared deviation
/// between `UB * hkl` and the observed q vectors over those peaks, solved
/// in `f64` via SVD.  Needs at least four usable peaks.
pub(crate) fn refine_ub(
    peaks: &[ObservedPeak],
    omit: &[bool],
    provisional: &Matrix3d,
) -> Option<Matrix3d> {
    let inv = provisional.try_inverse()?;
    let mut hkl_rows: Vec<Vector3d> = Vec::new();
    let mut q_rows: Vec<Vector3d> = Vec::new();
    for (i, pk) in peaks.iter().enumerate() {
        if omit.get(i).copied().unwrap_or(false) {
            continue;
        }
        let q = Vector3d::new(pk.q.x as f64, pk.q.y as f64, pk.q.z as f64);
        let miller = inv * q;
        if !miller.iter().all(|v| v.is_finite()) {
            continue;
        }
        hkl_rows.push(miller.map(f64::round));
        q_rows.push(q);
    }
    if hkl_rows.len() < 4 {
        return None;
    }

    let m = hkl_rows.len();
    let a = DMatrix::from_fn(m, 3, |r, c| hkl_rows[r][c]);
    let b = DMatrix::from_fn(m, 3, |r, c| q_rows[r][c]);
    // A * X = B with X = UB^T.
    let x = a.svd(true, true).solve(&b, 1e-12).ok()?;

    let mut ub = Matrix3d::zeros();
    for r in 0..3 {
        for c in 0..3 {
            ub[(r, c)] = x[(c, r)];
        }
    }
    if !ub.iter().all(|v| v.is_finite()) {
        return None;
    }
    let max = ub.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
    if ub.determinant().abs() < 1e-3 * max * max * max {
        return None;
    }
    Some(ub)
}

/// Fraction of peaks whose Miller indices under `ub` all lie within
/// `level` of an integer.
///
/// When `omit` is given, the mask is rewritten: `false` for indexed peaks,
/// `true` for the rest.
pub fn index_fraction(
    ub: &Matrix3d,
    peaks: &[ObservedPeak],
    level: f64,
    omit: Option<&mut [bool]>,
) -> f32 {
    if peaks.is_empty() || level <= 0.0 {
        return 0.0;
    }
    let inv = match ub.try_inverse() {
        Some(inv) => inv,
        None => return 0.0,
    };
    let mask = match omit {
        Some(m) if m.len() == peaks.len() => Some(m),
        _ => None,
    };
    let mut mask = mask;
    let mut indexed = 0usize;
    for (i, pk) in peaks.iter().enumerate() {
        let q = Vector3d::new(pk.q.x as f64, pk.q.y as f64, pk.q.z as f64);
        let miller = inv * q;
        let ok = miller.iter().all(|m| (m - m.round()).abs() < level);
        if ok {
            indexed += 1;
        }
        if let Some(mask) = mask.as_deref_mut() {
            mask[i] = !ok;
        }
    }
    indexed as f32 / peaks.len() as f32
}

/// Mark peaks whose projection onto `normal` misses an integer plane number
/// by more than `level`.  Already-omitted peaks are left alone.  Returns
/// the number newly omitted.
pub fn omit_unindexed(
    peaks: &[ObservedPeak],
    normal: Vector3,
    omit: &mut [bool],
    level: f32,
) -> usize {
    let len_sq = normal.norm_squared();
    if !(len_sq > 0.0) || omit.len() != peaks.len() {
        return 0;
    }
    let mut newly = 0usize;
    for (i, pk) in peaks.iter().enumerate() {
        if omit[i] {
            continue;
        }
        let x = pk.q.dot(&normal) / len_sq;
        if (x - (x + 0.5).floor()).abs() > level {
            omit[i] = true;
            newly += 1;
        }
    }
    newly
}

fn omitted_count(omit: &[bool]) -> usize {
    omit.iter().filter(|&&o| o).count()
}

/// True when `ub` differs from every accepted matrix by more than
/// [`DUPLICATE_UB_EPS`] relative to the entry scale.
fn is_distinct(ub: &Matrix3d, accepted: &[UbCandidate]) -> bool {
    for candidate in accepted {
        let scale = candidate
            .ub
            .iter()
            .fold(0.0f64, |m, v| m.max(v.abs()))
            .max(1e-12);
        let diff = (ub - candidate.ub)
            .iter()
            .fold(0.0f64, |m, v| m.max(v.abs()));
        if diff <= DUPLICATE_UB_EPS * scale {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn lattice_peaks(ub: &Matrix3d, range: i32) -> Vec<ObservedPeak> {
        let mut peaks = Vec::new();
        for h in -range..=range {
            for k in -range..=range {
                for l in -range..=range {
                    if h == 0 && k == 0 && l == 0 {
                        continue;
                    }
                    let q = ub * Vector3d::new(h as f64, k as f64, l as f64);
                    peaks.push(ObservedPeak::new(
                        Vector3::new(q.x as f32, q.y as f32, q.z as f32),
                        100,
                    ));
                }
            }
        }
        peaks
    }

    #[test]
    fn test_provisional_ub_orthorhombic() {
        // Plane normals along the axes with spacings 1/4, 1/5, 1/6.
        let normals = [
            Vector3::new(0.25, 0.0, 0.0),
            Vector3::new(0.0, 0.2, 0.0),
            Vector3::new(0.0, 0.0, 1.0 / 6.0),
        ];
        let ub = provisional_ub(&normals).unwrap();
        assert_relative_eq!(ub[(0, 0)], 0.25, epsilon = 1e-6);
        assert_relative_eq!(ub[(1, 1)], 0.2, epsilon = 1e-6);
        assert_relative_eq!(ub[(2, 2)], 1.0 / 6.0, epsilon = 1e-6);
    }

    #[test]
    fn test_provisional_ub_rejects_coplanar() {
        let normals = [
            Vector3::new(0.25, 0.0, 0.0),
            Vector3::new(0.0, 0.2, 0.0),
            Vector3::new(0.1, 0.1, 0.0),
        ];
        assert!(provisional_ub(&normals).is_none());
    }

    #[test]
    fn test_refine_recovers_exact_ub() {
        let ub_true = Matrix3d::from_diagonal(&Vector3d::new(0.25, 0.2, 1.0 / 6.0));
        let peaks = lattice_peaks(&ub_true, 2);
        // Perturb the provisional matrix a little; rounding still assigns
        // the right indices, so the fit lands back on the exact matrix.
        let mut provisional = ub_true;
        provisional[(0, 1)] += 0.002;
        provisional[(2, 0)] -= 0.001;
        let omit = vec![false; peaks.len()];
        let refined = refine_ub(&peaks, &omit, &provisional).unwrap();
        for r in 0..3 {
            for c in 0..3 {
                assert_relative_eq!(refined[(r, c)], ub_true[(r, c)], epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_index_fraction_and_mask() {
        let ub = Matrix3d::identity();
        let peaks = vec![
            ObservedPeak::new(Vector3::new(1.0, 0.0, 2.0), 10),
            ObservedPeak::new(Vector3::new(0.5, 0.0, 0.0), 10),
        ];
        let mut omit = vec![false; 2];
        let frac = index_fraction(&ub, &peaks, 0.2, Some(&mut omit));
        assert_relative_eq!(frac, 0.5);
        assert_eq!(omit, vec![false, true]);
    }

    #[test]
    fn test_omit_unindexed_counts_new_only() {
        let normal = Vector3::new(0.0, 0.0, 0.25);
        let peaks = vec![
            ObservedPeak::new(Vector3::new(0.3, 0.0, 0.25), 10), // plane 1
            ObservedPeak::new(Vector3::new(0.0, 0.1, 0.375), 10), // plane 1.5
            ObservedPeak::new(Vector3::new(0.0, 0.0, 0.875), 10), // plane 3.5
        ];
        let mut omit = vec![false, false, true];
        let newly = omit_unindexed(&peaks, normal, &mut omit, 0.2);
        assert_eq!(newly, 1);
        assert_eq!(omit, vec![false, true, true]);
    }

    #[test]
    fn test_is_distinct() {
        let ub = Matrix3d::from_diagonal(&Vector3d::new(0.25, 0.2, 1.0 / 6.0));
        let accepted = vec![UbCandidate {
            ub,
            lattice: LatticeParams::from_ub(&ub).unwrap(),
            stats: IndexStats::default(),
        }];
        assert!(!is_distinct(&ub, &accepted));
        let mut other = ub;
        other[(0, 0)] += 0.05;
        assert!(is_distinct(&other, &accepted));
    }

    #[test]
    fn test_dedup_directions_collapses_near_equal() {
        let mut list = CandidateList::new();
        let mk = |x: f32, y: f32, period: f32, fit: f32| DirectionScore {
            x,
            y,
            period,
            bins_per_period: 96,
            correlation: 0.9,
            fit,
        };
        list.insert(mk(0.50, 0.10, 0.25, 1.9));
        list.insert(mk(0.505, 0.102, 0.25, 1.8)); // same direction, weaker
        list.insert(mk(-0.30, 0.20, 0.20, 1.7));
        let distinct = dedup_directions(&list, 0.02, 0.01);
        assert_eq!(distinct.len(), 2);
        assert_eq!(distinct[0].x, 0.50);
        assert_eq!(distinct[1].x, -0.30);
    }
}
