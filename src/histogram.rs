//! 3-D detector histogram storage and smoothing.
//!
//! A [`VoxelHistogram`] holds counts for a single detector module as a dense
//! `row x column x channel` array. Peak extraction operates on this type,
//! optionally after the 3x3 per-slice smoothing pass provided here.

use anyhow::{ensure, Result};

/// Dense 3-D histogram of detector counts, indexed `(row, col, chan)`.
///
/// Storage is a flat `Vec<f32>` in row-major order with the channel index
/// varying fastest.
#[derive(Debug, Clone)]
pub struct VoxelHistogram {
    data: Vec<f32>,
    n_rows: usize,
    n_cols: usize,
    n_chans: usize,
}

impl VoxelHistogram {
    /// Create a histogram from a flat buffer.
    ///
    /// `data` must hold exactly `n_rows * n_cols * n_chans` values, laid out
    /// with the channel index varying fastest.
    pub fn from_raw(data: Vec<f32>, n_rows: usize, n_cols: usize, n_chans: usize) -> Result<Self> {
        ensure!(
            n_rows > 0 && n_cols > 0 && n_chans > 0,
            "histogram dimensions must be nonzero: {}x{}x{}",
            n_rows,
            n_cols,
            n_chans
        );
        ensure!(
            data.len() == n_rows * n_cols * n_chans,
            "data length {} does not match dimensions {}x{}x{}",
            data.len(),
            n_rows,
            n_cols,
            n_chans
        );
        Ok(Self {
            data,
            n_rows,
            n_cols,
            n_chans,
        })
    }

    /// Create a histogram from nested `[row][col][chan]` vectors.
    ///
    /// Fails if any row or spectrum has a mismatched length (ragged input).
    pub fn from_nested(raw: &[Vec<Vec<f32>>]) -> Result<Self> {
        ensure!(!raw.is_empty(), "histogram has no rows");
        let n_rows = raw.len();
        let n_cols = raw[0].len();
        ensure!(n_cols > 0, "histogram has no columns");
        let n_chans = raw[0][0].len();
        ensure!(n_chans > 0, "histogram has no channels");

        let mut data = Vec::with_capacity(n_rows * n_cols * n_chans);
        for (r, row) in raw.iter().enumerate() {
            ensure!(
                row.len() == n_cols,
                "row {} has {} columns, expected {}",
                r,
                row.len(),
                n_cols
            );
            for (c, spectrum) in row.iter().enumerate() {
                ensure!(
                    spectrum.len() == n_chans,
                    "pixel ({},{}) has {} channels, expected {}",
                    r,
                    c,
                    spectrum.len(),
                    n_chans
                );
                data.extend_from_slice(spectrum);
            }
        }
        Ok(Self {
            data,
            n_rows,
            n_cols,
            n_chans,
        })
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    pub fn n_chans(&self) -> usize {
        self.n_chans
    }

    #[inline]
    fn index(&self, row: usize, col: usize, chan: usize) -> usize {
        (row * self.n_cols + col) * self.n_chans + chan
    }

    /// Value at `(row, col, chan)`. Panics if out of range.
    #[inline]
    pub fn value(&self, row: usize, col: usize, chan: usize) -> f32 {
        self.data[self.index(row, col, chan)]
    }

    #[inline]
    pub fn set_value(&mut self, row: usize, col: usize, chan: usize, value: f32) {
        let i = self.index(row, col, chan);
        self.data[i] = value;
    }

    /// Minimum and maximum value over the whole histogram.
    pub fn value_range(&self) -> (f32, f32) {
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        for &v in &self.data {
            if v < min {
                min = v;
            }
            if v > max {
                max = v;
            }
        }
        (min, max)
    }

    /// Smooth every time slice in place with a 3x3 box sum.
    ///
    /// Each voxel is replaced by the sum of its same-channel 3x3 spatial
    /// neighborhood, scaled by `9 / n` where `n` is the number of in-bounds
    /// neighbors (so edges get `9/6` and corners `9/4`, keeping the response
    /// to a uniform field flat across the detector).  Negative input values
    /// are clamped to zero before summing.
    pub fn smooth_3x3(&mut self) {
        let mut smoothed = vec![0.0f32; self.data.len()];
        for row in 0..self.n_rows {
            let r_lo = row.saturating_sub(1);
            let r_hi = (row + 1).min(self.n_rows - 1);
            for col in 0..self.n_cols {
                let c_lo = col.saturating_sub(1);
                let c_hi = (col + 1).min(self.n_cols - 1);
                let n_pix = ((r_hi - r_lo + 1) * (c_hi - c_lo + 1)) as f32;
                let scale = 9.0 / n_pix;
                for chan in 0..self.n_chans {
                    let mut sum = 0.0f32;
                    for r in r_lo..=r_hi {
                        for c in c_lo..=c_hi {
                            sum += self.value(r, c, chan).max(0.0);
                        }
                    }
                    smoothed[self.index(row, col, chan)] = sum * scale;
                }
            }
        }
        self.data = smoothed;
    }
}
