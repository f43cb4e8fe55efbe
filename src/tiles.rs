use std::ops::Range;

use burn::tensor::{backend::Backend, Tensor};

use crate::error::{DiffusionError, Result};
use crate::options::{TileMode, TileOptions};
use crate::tensor::{from_vec, to_vec};

/// Overlapping spatial tiles of an NCHW tensor, row-major over `rows` x `cols`.
#[derive(Debug, Clone)]
pub struct ImageTiles<B: Backend> {
    pub height: usize,
    pub width: usize,
    pub rows: Vec<Range<usize>>,
    pub cols: Vec<Range<usize>>,
    pub tiles: Vec<Tensor<B, 4>>,
}

/// Output-over-input size ratio of a tile function along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AxisScale {
    output: usize,
    input: usize,
}

impl AxisScale {
    fn new(output: usize, input: usize) -> Self {
        Self {
            output,
            input: input.max(1),
        }
    }

    fn apply(&self, x: usize) -> usize {
        x * self.output / self.input
    }
}

/// Halves of `len` widened by `overlap` on the shared side, or the whole axis. Every boundary
/// lands on a multiple of `align`.
fn axis_ranges(len: usize, split: bool, overlap: usize, align: usize) -> Vec<Range<usize>> {
    let align = align.max(1);
    if !split || len < 2 * align {
        return vec![0..len];
    }

    let half = len / 2 / align * align;
    let overlap = overlap.min(half / 2) / align * align;
    vec![0..half + overlap, half - overlap..len]
}

/// Blend weight of tile `index` at output coordinate `x` along one axis. Weights of the
/// tiles covering a coordinate sum to one.
fn axis_weight(ranges: &[Range<usize>], index: usize, x: usize, scale: AxisScale) -> f32 {
    if ranges.len() < 2 {
        return 1.0;
    }

    let band_start = scale.apply(ranges[1].start);
    let band_end = scale.apply(ranges[0].end);
    let inside = x >= band_start && x < band_end;
    let band = (band_end - band_start).max(1) as f32;
    let t = (x.saturating_sub(band_start) as f32 + 0.5) / band;

    match (index, inside) {
        (0, true) => 1.0 - t,
        (_, true) => t,
        (0, false) => (x < band_start) as u8 as f32,
        (_, false) => (x >= band_end) as u8 as f32,
    }
}

impl<B: Backend> ImageTiles<B> {
    pub fn split(tensor: Tensor<B, 4>, mode: TileMode, overlap: usize) -> Self {
        Self::split_aligned(tensor, mode, overlap, 1)
    }

    /// Like `split`, with tile boundaries on multiples of `align` so a tile function that
    /// downsamples by `align` maps them to whole output pixels.
    pub fn split_aligned(tensor: Tensor<B, 4>, mode: TileMode, overlap: usize, align: usize) -> Self {
        let [n, c, height, width] = tensor.dims();
        let rows = axis_ranges(height, mode.splits_height(), overlap, align);
        let cols = axis_ranges(width, mode.splits_width(), overlap, align);

        let mut tiles = Vec::with_capacity(rows.len() * cols.len());
        for row in rows.iter() {
            for col in cols.iter() {
                tiles.push(tensor.clone().slice([0..n, 0..c, row.clone(), col.clone()]));
            }
        }

        Self {
            height,
            width,
            rows,
            cols,
            tiles,
        }
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Replaces every tile with `f(tile)`; the output may be spatially scaled up or down.
    pub fn map<F>(self, mut f: F) -> Result<Self>
    where
        F: FnMut(Tensor<B, 4>) -> Result<Tensor<B, 4>>,
    {
        let tiles = self.tiles.into_iter().map(&mut f).collect::<Result<Vec<_>>>()?;

        Ok(Self { tiles, ..self })
    }

    /// Stitches the tiles back together, blending linearly across each overlap band.
    pub fn join(self) -> Result<Tensor<B, 4>> {
        let first = self.tiles.first().ok_or(DiffusionError::MissingInput("tiles"))?;
        let [n, c, first_h, first_w] = first.dims();
        let device = first.device();

        let scale_h = AxisScale::new(first_h, self.rows[0].len());
        let scale_w = AxisScale::new(first_w, self.cols[0].len());
        let out_h = scale_h.apply(self.height);
        let out_w = scale_w.apply(self.width);

        let mut values = vec![0f32; n * c * out_h * out_w];
        let mut weights = vec![0f32; out_h * out_w];

        for (k, tile) in self.tiles.into_iter().enumerate() {
            let (i, j) = (k / self.cols.len(), k % self.cols.len());
            let (row, col) = (&self.rows[i], &self.cols[j]);
            let (top, left) = (scale_h.apply(row.start), scale_w.apply(col.start));
            let expected = [n, c, scale_h.apply(row.end) - top, scale_w.apply(col.end) - left];
            let found = tile.dims();
            if found != expected {
                return Err(DiffusionError::shape_mismatch("tile output", &expected, &found));
            }

            let [_, _, th, tw] = expected;
            let data = to_vec(tile);
            for y in 0..th {
                let oy = top + y;
                let wy = axis_weight(&self.rows, i, oy, scale_h);
                for x in 0..tw {
                    let ox = left + x;
                    let w = wy * axis_weight(&self.cols, j, ox, scale_w);
                    if w == 0.0 {
                        continue;
                    }

                    weights[oy * out_w + ox] += w;
                    for plane in 0..n * c {
                        values[(plane * out_h + oy) * out_w + ox] += w * data[(plane * th + y) * tw + x];
                    }
                }
            }
        }

        for plane in values.chunks_mut(out_h * out_w) {
            for (v, w) in plane.iter_mut().zip(&weights) {
                if *w > 0.0 && *w != 1.0 {
                    *v /= w;
                }
            }
        }

        Ok(from_vec(values, [n, c, out_h, out_w], &device))
    }
}

/// Applies `f` to `tensor`, splitting into overlapping tiles (recursively) while a split axis
/// exceeds `size + overlap`. Tile boundaries stay on multiples of `align`.
pub fn process_tiled<B, F>(tensor: Tensor<B, 4>, options: &TileOptions, align: usize, f: &mut F) -> Result<Tensor<B, 4>>
where
    B: Backend,
    F: FnMut(Tensor<B, 4>) -> Result<Tensor<B, 4>>,
{
    let [_, _, height, width] = tensor.dims();
    let threshold = options.size + options.overlap;
    let min_split = 2 * align.max(1);
    let split_height = options.mode.splits_height() && height > threshold && height >= min_split;
    let split_width = options.mode.splits_width() && width > threshold && width >= min_split;

    if !options.enabled || !(split_height || split_width) {
        return f(tensor);
    }

    let mode = match (split_height, split_width) {
        (true, true) => TileMode::Full,
        (true, false) => TileMode::Vertical,
        _ => TileMode::Horizontal,
    };

    ImageTiles::split_aligned(tensor, mode, options.overlap, align)
        .map(|tile| process_tiled(tile, options, align, f))?
        .join()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::resize_nearest;
    use crate::testing::{assert_approx_eq, TestBackend, DEVICE};

    fn ramp(n: usize, c: usize, h: usize, w: usize) -> Tensor<TestBackend, 4> {
        let values = (0..n * c * h * w).map(|i| (i as f32 * 0.37).sin()).collect();
        from_vec(values, [n, c, h, w], &DEVICE)
    }

    #[test]
    fn zero_overlap_round_trip_is_exact() {
        let x = ramp(2, 3, 8, 10);
        let tiles = ImageTiles::split(x.clone(), TileMode::Full, 0);

        assert_eq!(tiles.len(), 4);
        assert_eq!(to_vec(tiles.join().unwrap()), to_vec(x));
    }

    #[test]
    fn overlap_keeps_interior_and_blends_borders() {
        let x = from_vec::<TestBackend, 4>(vec![0.0; 16 * 16], [1, 1, 16, 16], &DEVICE);
        let mut index = 0.0;
        let tiles = ImageTiles::split(x, TileMode::Horizontal, 2)
            .map(|tile| {
                index += 1.0;
                Ok(tile + index * 10.0)
            })
            .unwrap();

        assert_eq!(tiles.cols, vec![0..10, 6..16]);
        let out = to_vec(tiles.join().unwrap());

        for y in 0..16 {
            let row = &out[y * 16..(y + 1) * 16];
            assert!(row[..6].iter().all(|&v| v == 10.0));
            assert!(row[10..].iter().all(|&v| v == 20.0));
            assert!(row[6..10].iter().all(|&v| v > 10.0 && v < 20.0));
            assert!(row[6..10].windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn scaled_outputs_join_at_the_scaled_size() {
        let x = ramp(1, 2, 8, 8);
        let tiles = ImageTiles::split(x.clone(), TileMode::Full, 2)
            .map(|tile| {
                let [_, _, h, w] = tile.dims();
                Ok(resize_nearest(tile, h * 2, w * 2))
            })
            .unwrap();

        let joined = tiles.join().unwrap();
        assert_eq!(joined.dims(), [1, 2, 16, 16]);
        assert_approx_eq(&to_vec(joined), &to_vec(resize_nearest(x, 16, 16)), 1e-5);
    }

    #[test]
    fn downsampled_outputs_join_at_the_reduced_size() {
        let x = ramp(1, 2, 32, 48);
        let tiles = ImageTiles::split_aligned(x.clone(), TileMode::Full, 4, 4);

        assert_eq!(tiles.rows, vec![0..20, 12..32]);
        assert_eq!(tiles.cols, vec![0..28, 20..48]);

        // block average, so every output pixel depends on one aligned 4 x 4 block
        let pooled = |t: Tensor<TestBackend, 4>| {
            let [n, c, h, w] = t.dims();
            let values = to_vec(t);
            let mut out = vec![0f32; n * c * (h / 4) * (w / 4)];
            for plane in 0..n * c {
                for y in 0..h {
                    for x in 0..w {
                        out[(plane * (h / 4) + y / 4) * (w / 4) + x / 4] += values[(plane * h + y) * w + x] / 16.0;
                    }
                }
            }
            from_vec::<TestBackend, 4>(out, [n, c, h / 4, w / 4], &DEVICE)
        };

        let joined = tiles.map(|tile| Ok(pooled(tile))).unwrap().join().unwrap();
        assert_eq!(joined.dims(), [1, 2, 8, 12]);
        assert_approx_eq(&to_vec(joined), &to_vec(pooled(x)), 1e-5);
    }

    #[test]
    fn aligned_ranges_stay_on_the_grid() {
        assert_eq!(axis_ranges(40, true, 6, 8), vec![0..16, 16..40]);
        assert_eq!(axis_ranges(48, true, 8, 8), vec![0..32, 16..48]);
        assert_eq!(axis_ranges(12, true, 8, 8), vec![0..12]);
        assert_eq!(axis_ranges(16, true, 3, 1), vec![0..11, 5..16]);
    }

    #[test]
    fn mismatched_tile_output_is_rejected() {
        let mut index = 0;
        let tiles = ImageTiles::split(ramp(1, 1, 8, 8), TileMode::Full, 0)
            .map(|tile| {
                index += 1;
                Ok(if index == 3 { tile.slice([0..1, 0..1, 0..2, 0..2]) } else { tile })
            })
            .unwrap();

        assert!(matches!(tiles.join(), Err(DiffusionError::ShapeMismatch { .. })));
    }

    #[test]
    fn recursion_splits_until_tiles_fit() {
        let options = TileOptions::new().with_enabled(true).with_size(8).with_overlap(2);
        let x = ramp(1, 1, 32, 32);
        let mut calls = 0;

        let out = process_tiled(x.clone(), &options, 1, &mut |tile: Tensor<TestBackend, 4>| {
            calls += 1;
            let [_, _, h, w] = tile.dims();
            assert!(h <= 10 && w <= 10);
            Ok(tile * 2.0 + 1.0)
        })
        .unwrap();

        assert_eq!(calls, 64);
        assert_approx_eq(&to_vec(out), &to_vec(x * 2.0 + 1.0), 1e-5);
    }

    #[test]
    fn horizontal_mode_only_splits_width() {
        let options = TileOptions::new()
            .with_enabled(true)
            .with_mode(TileMode::Horizontal)
            .with_size(8)
            .with_overlap(2);
        let mut heights = Vec::new();

        process_tiled(ramp(1, 1, 32, 32), &options, 1, &mut |tile: Tensor<TestBackend, 4>| {
            heights.push(tile.dims()[2]);
            Ok(tile)
        })
        .unwrap();

        assert_eq!(heights.len(), 8);
        assert!(heights.iter().all(|&h| h == 32));
    }

    #[test]
    fn disabled_tiling_is_a_single_call() {
        let mut calls = 0;
        process_tiled(ramp(1, 1, 64, 64), &TileOptions::new(), 1, &mut |tile: Tensor<TestBackend, 4>| {
            calls += 1;
            Ok(tile)
        })
        .unwrap();

        assert_eq!(calls, 1);
    }
}
