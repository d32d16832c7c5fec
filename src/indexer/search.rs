//! Hemisphere direction search.
//!
//! Trial directions are sampled over the upper hemisphere, scored with
//! [`score_direction`](super::projection::score_direction), and collected in
//! a ranked [`CandidateList`].  The hemisphere is split into four disjoint
//! x-ranges searched in parallel; each worker accumulates into a local list
//! and the results are merged single-threaded after the join, so no locking
//! is needed and the outcome is independent of scheduling.

use rayon::prelude::*;
use tracing::debug;

use super::projection::{score_direction, DirectionScore, ProjectionBuffer};
use crate::{ObservedPeak, Vector3};

/// Number of parallel search regions (and the effective worker cap).
const N_REGIONS: usize = 4;

/// Ranked collection of scored trial directions.
///
/// Entries are kept sorted ascending by rank key (fit + correlation).  A
/// pruning floor at half the current best key bounds the list: new entries
/// below the floor are discarded, and raising the best prunes the tail.
#[derive(Debug, Clone, Default)]
pub struct CandidateList {
    entries: Vec<DirectionScore>,
}

impl CandidateList {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The highest-ranked entry.
    pub fn best(&self) -> Option<&DirectionScore> {
        self.entries.last()
    }

    /// Entries from best to worst.
    pub fn iter_descending(&self) -> impl Iterator<Item = &DirectionScore> {
        self.entries.iter().rev()
    }

    /// The `rank`-th entry counting from the best (0 = best).
    pub fn get_descending(&self, rank: usize) -> Option<&DirectionScore> {
        if rank < self.entries.len() {
            Some(&self.entries[self.entries.len() - 1 - rank])
        } else {
            None
        }
    }

    /// Insert a scored direction, keeping ascending rank order.
    ///
    /// Entries more than a factor of two below the current best are not
    /// worth keeping; they are either noise or will never be selected.
    pub fn insert(&mut self, score: DirectionScore) {
        let key = score.rank_key();
        if !key.is_finite() {
            return;
        }
        if let Some(best) = self.entries.last() {
            if key < best.rank_key() / 2.0 {
                return;
            }
        }
        // Equal keys rank above existing entries, so the newest of a tie
        // comes back first.
        let pos = self.entries.partition_point(|e| e.rank_key() <= key);
        let new_best = pos == self.entries.len();
        self.entries.insert(pos, score);
        if new_best {
            let floor = key / 2.0;
            let cut = self.entries.partition_point(|e| e.rank_key() < floor);
            if cut > 0 {
                self.entries.drain(..cut);
            }
        }
    }

    /// Fold another list into this one, preserving the pruning floor.
    pub fn merge(&mut self, other: CandidateList) {
        for entry in other.entries {
            self.insert(entry);
        }
    }
}

/// Scan the whole upper hemisphere at the given grid spacing and return the
/// ranked list of directions that showed periodic structure.
///
/// The three axis-aligned directions `(0,0)`, `(1,0)`, `(0,1)` are scored up
/// front; the rest of the hemisphere is covered by four disjoint x-range
/// regions.  With `parallel` set the regions run as rayon tasks (at most
/// four in flight); otherwise they run sequentially in the same order, which
/// produces the identical list.
///
/// Directions with a period below `1/max_cell_edge` are discarded: the
/// implied plane spacing would exceed the longest cell edge, and selecting
/// one builds a supercell rather than the lattice.
pub fn scan_directions(
    peaks: &[ObservedPeak],
    omit: Option<&[bool]>,
    grid: f32,
    max_cell_edge: f32,
    parallel: bool,
) -> CandidateList {
    let mut list = CandidateList::new();

    let min_period = 1.0 / max_cell_edge;
    let mut buffer = ProjectionBuffer::new();
    for (x, y) in [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0)] {
        if let Some(score) = score_direction(peaks, omit, x, y, max_cell_edge, &mut buffer) {
            if score.period >= min_period {
                list.insert(score);
            }
        }
    }

    // x = -1 + grid, -1 + 2*grid, ... while x < 1 - grid, split into four
    // contiguous index ranges.
    let n_cols = ((2.0 - grid) / grid).ceil() as usize;
    let n_cols = n_cols.saturating_sub(1).max(1);
    let per_region = n_cols.div_ceil(N_REGIONS);
    let regions: Vec<(usize, usize)> = (0..N_REGIONS)
        .map(|r| {
            let start = (r * per_region).min(n_cols);
            let end = ((r + 1) * per_region).min(n_cols);
            (start, end)
        })
        .collect();

    let region_lists: Vec<CandidateList> = if parallel {
        regions
            .par_iter()
            .map(|&(start, end)| scan_region(peaks, omit, grid, max_cell_edge, start, end))
            .collect()
    } else {
        regions
            .iter()
            .map(|&(start, end)| scan_region(peaks, omit, grid, max_cell_edge, start, end))
            .collect()
    };

    for region_list in region_lists {
        list.merge(region_list);
    }
    debug!(
        grid,
        candidates = list.len(),
        "hemisphere scan complete"
    );
    list
}

/// Scan the x-columns `[col_start, col_end)` of the hemisphere grid.
fn scan_region(
    peaks: &[ObservedPeak],
    omit: Option<&[bool]>,
    grid: f32,
    max_cell_edge: f32,
    col_start: usize,
    col_end: usize,
) -> CandidateList {
    let mut list = CandidateList::new();
    let min_period = 1.0 / max_cell_edge;
    let mut buffer = ProjectionBuffer::new();
    for k in col_start..col_end {
        let x = -1.0 + (k + 1) as f32 * grid;
        if x >= 1.0 - grid {
            break;
        }
        let y_max = (1.0 - x * x).sqrt();
        let mut j = 0usize;
        loop {
            let y = -y_max + j as f32 * grid;
            if y > y_max {
                break;
            }
            if 1.0 - x * x - y * y >= 0.0 {
                if let Some(score) = score_direction(peaks, omit, x, y, max_cell_edge, &mut buffer)
                {
                    if score.period >= min_period {
                        list.insert(score);
                    }
                }
            }
            j += 1;
        }
    }
    list
}

/// Select up to three mutually independent plane-normal directions from the
/// ranked list.
///
/// The best entry is always taken.  Subsequent picks come from
/// [`find_next_top`], which skips entries inside elimination boxes around
/// the already-chosen (and rejected) directions.  A third direction must be
/// non-coplanar with the first two and carry a fit of at least half the
/// maximum; coplanar picks are eliminated and the search continues.
pub fn select_plane_normals(
    list: &CandidateList,
    new_dir: f32,
    grid: f32,
) -> Vec<DirectionScore> {
    let mut chosen: Vec<DirectionScore> = Vec::with_capacity(3);
    let best = match list.best() {
        Some(b) => *b,
        None => return chosen,
    };
    let mut elim = vec![(best.x, best.y)];
    chosen.push(best);

    let second = match find_next_top(list, &elim, new_dir, grid) {
        Some(s) => s,
        None => return chosen,
    };
    elim.push((second.x, second.y));
    chosen.push(second);

    loop {
        let third = match find_next_top(list, &elim, new_dir, grid) {
            Some(t) => t,
            None => return chosen,
        };
        if third.fit < 0.5 {
            // The remaining candidates are too weak to trust as a third
            // lattice direction.
            return chosen;
        }
        if non_coplanar(
            chosen[0].plane_normal(),
            chosen[1].plane_normal(),
            third.plane_normal(),
        ) {
            chosen.push(third);
            return chosen;
        }
        elim.push((third.x, third.y));
    }
}

/// Highest-ranked entry outside every elimination box.
///
/// Boxes are squares of half-width `new_dir` in (x, y) around each
/// eliminated direction.  An entry that falls just outside a box, within one
/// grid step of its boundary, is ambiguous — the whole search restarts with
/// the boxes widened by two grid steps.
fn find_next_top(
    list: &CandidateList,
    elim: &[(f32, f32)],
    new_dir: f32,
    grid: f32,
) -> Option<DirectionScore> {
    let mut width = new_dir;
    'retry: loop {
        'entries: for entry in list.iter_descending() {
            for &(ex, ey) in elim {
                let dx = (entry.x - ex).abs();
                let dy = (entry.y - ey).abs();
                if dx <= width && dy <= width {
                    continue 'entries;
                }
                if dx <= width + grid && dy <= width + grid {
                    width += 2.0 * grid;
                    continue 'retry;
                }
            }
            return Some(*entry);
        }
        return None;
    }
}

/// True when the three vectors span a volume of meaningful size relative to
/// their largest component.
pub fn non_coplanar(q1: Vector3, q2: Vector3, q3: Vector3) -> bool {
    let max = q1
        .iter()
        .chain(q2.iter())
        .chain(q3.iter())
        .fold(0.0f32, |m, &v| m.max(v.abs()));
    if max == 0.0 {
        return false;
    }
    let det = nalgebra::Matrix3::from_rows(&[q1.transpose(), q2.transpose(), q3.transpose()])
        .determinant();
    det.abs() >= 1e-3 * max * max * max
}
