//! Rank-ordered direction-triple iterator.
//!
//! Yields triples of candidate-list ranks (0 = best candidate) ordered by
//! the sum of ranks, so triples built from highly-ranked directions come
//! first without sorting all O(n^3) triples up front.
//!
//! Implementation: min-heap keyed by rank sum, with a HashSet for dedup.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

/// Iterator over strictly-increasing `[usize; 3]` rank triples drawn from
/// `0..n`, in order of increasing rank sum.
pub struct RankTriples {
    n: u32,
    heap: BinaryHeap<Reverse<(u32, [u32; 3])>>,
    seen: HashSet<[u32; 3]>,
}

impl RankTriples {
    pub fn new(n: usize) -> Self {
        let n = n as u32;
        let mut iter = Self {
            n,
            heap: BinaryHeap::new(),
            seen: HashSet::new(),
        };
        if n >= 3 {
            let initial = [0, 1, 2];
            iter.seen.insert(initial);
            iter.heap.push(Reverse((3, initial)));
        }
        iter
    }
}

impl Iterator for RankTriples {
    type Item = [usize; 3];

    fn next(&mut self) -> Option<[usize; 3]> {
        let Reverse((_, triple)) = self.heap.pop()?;

        // Successors: advance one position at a time, keeping the triple
        // strictly increasing and in range.
        for i in 0..3 {
            let next_val = triple[i] + 1;
            let upper = if i + 1 < 3 { triple[i + 1] } else { self.n };
            if next_val < upper {
                let mut succ = triple;
                succ[i] = next_val;
                if self.seen.insert(succ) {
                    let sum = succ[0] + succ[1] + succ[2];
                    self.heap.push(Reverse((sum, succ)));
                }
            }
        }

        Some([triple[0] as usize, triple[1] as usize, triple[2] as usize])
    }
}
