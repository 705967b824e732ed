//! Grid-based change detection between co-registered frames or patch-feature maps.
//!
//! Both inputs are cut into the same `grid_size x grid_size` lattice. Cell
//! sides come from integer division; when the extent does not divide evenly
//! the leftover strip becomes one more cell on that side, so the cells
//! always tile the source exactly. Every cell is an independent candidate region:
//! adjacent cells are never merged here.

use ndarray::{s, Array3};

use crate::frame::Frame;
use crate::similarity::{cosine_similarity, embedding_similarity};
use crate::types::{ChangeRegion, Embedding, GridCell, VisionError, VisionResult};

/// Split `extent` into `grid_size` spans of `extent / grid_size`, plus one
/// trailing span for the remainder. An extent smaller than the grid gets
/// one single-pixel span per pixel.
pub fn grid_spans(extent: u32, grid_size: u32) -> Vec<(u32, u32)> {
    if extent == 0 || grid_size == 0 {
        return Vec::new();
    }

    let step = extent / grid_size;
    if step == 0 {
        return (0..extent).map(|start| (start, 1)).collect();
    }

    let mut spans: Vec<(u32, u32)> = (0..grid_size).map(|i| (i * step, step)).collect();
    let covered = grid_size * step;
    if covered < extent {
        spans.push((covered, extent - covered));
    }
    spans
}

/// All grid cells for a `width x height` source, row-major.
pub fn grid_cells(width: u32, height: u32, grid_size: u32) -> Vec<GridCell> {
    let cols = grid_spans(width, grid_size);
    grid_spans(height, grid_size)
        .into_iter()
        .flat_map(|(y, h)| {
            cols.iter().map(move |&(x, w)| GridCell {
                x,
                y,
                width: w,
                height: h,
            })
        })
        .collect()
}

fn check_grid(grid_size: u32, threshold: f32) -> VisionResult<()> {
    if grid_size == 0 {
        return Err(VisionError::InvalidInput(
            "grid_size must be positive".to_string(),
        ));
    }
    if !(threshold > 0.0) {
        return Err(VisionError::InvalidInput(format!(
            "change threshold must be positive, got {threshold}"
        )));
    }
    Ok(())
}

fn significance(score: f32, threshold: f32) -> f32 {
    (score / threshold).clamp(0.0, 1.0)
}

/// Pixel mode: mean absolute per-channel difference (0-1 scale) per cell.
///
/// Regions come back in row-major position order.
pub fn detect_pixel_changes(
    a: &Frame,
    b: &Frame,
    grid_size: u32,
    threshold: f32,
) -> VisionResult<Vec<ChangeRegion>> {
    check_grid(grid_size, threshold)?;
    if a.dimensions() != b.dimensions() {
        let (wa, ha) = a.dimensions();
        let (wb, hb) = b.dimensions();
        return Err(VisionError::InvalidInput(format!(
            "Frame dimensions differ: {wa}x{ha} vs {wb}x{hb}"
        )));
    }

    let (w, h) = a.dimensions();
    let (pa, pb) = (a.pixels(), b.pixels());
    let mut regions = Vec::new();

    for cell in grid_cells(w, h, grid_size) {
        let mut total = 0u64;
        for y in cell.y..cell.y + cell.height {
            for x in cell.x..cell.x + cell.width {
                let ca = pa.get_pixel(x, y).0;
                let cb = pb.get_pixel(x, y).0;
                for c in 0..3 {
                    total += (ca[c] as i16 - cb[c] as i16).unsigned_abs() as u64;
                }
            }
        }

        let samples = cell.area() * 3;
        let score = (total as f64 / (samples as f64 * 255.0)) as f32;
        if score > threshold {
            regions.push(ChangeRegion::from_cell(cell, significance(score, threshold)));
        }
    }

    Ok(regions)
}

/// A grid of patch embeddings covering a source image.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMap {
    features: Array3<f32>,
    image_width: u32,
    image_height: u32,
}

impl FeatureMap {
    /// `features` is shaped `(rows, cols, dim)`.
    pub fn new(features: Array3<f32>, image_width: u32, image_height: u32) -> VisionResult<Self> {
        let (rows, cols, dim) = features.dim();
        if rows == 0 || cols == 0 || dim == 0 {
            return Err(VisionError::InvalidInput(format!(
                "Empty feature map: {rows}x{cols}x{dim}"
            )));
        }
        if image_width == 0 || image_height == 0 {
            return Err(VisionError::InvalidInput(
                "Feature map source has zero area".to_string(),
            ));
        }
        Ok(Self {
            features,
            image_width,
            image_height,
        })
    }

    pub fn rows(&self) -> usize {
        self.features.dim().0
    }

    pub fn cols(&self) -> usize {
        self.features.dim().1
    }

    pub fn dim(&self) -> usize {
        self.features.dim().2
    }

    pub fn image_dimensions(&self) -> (u32, u32) {
        (self.image_width, self.image_height)
    }

    /// Summed patch features over a block of the patch grid. Cosine is
    /// scale-invariant, so this ranks the same as mean pooling.
    fn pool(&self, rows: (u32, u32), cols: (u32, u32)) -> Vec<f32> {
        let (r0, rl) = (rows.0 as usize, rows.1 as usize);
        let (c0, cl) = (cols.0 as usize, cols.1 as usize);
        let block = self.features.slice(s![r0..r0 + rl, c0..c0 + cl, ..]);

        let mut pooled = vec![0.0f32; self.dim()];
        for row in block.outer_iter() {
            for patch in row.outer_iter() {
                for (acc, v) in pooled.iter_mut().zip(patch.iter()) {
                    *acc += *v;
                }
            }
        }
        pooled
    }

    /// Map a patch-grid span back onto source pixels.
    fn to_pixels(start: u32, len: u32, patches: usize, extent: u32) -> (u32, u32) {
        let scale = |p: u32| ((p as u64 * extent as u64) / patches as u64) as u32;
        let x0 = scale(start);
        let x1 = scale(start + len);
        (x0, x1 - x0)
    }
}

/// Feature mode: cosine dissimilarity between pooled patch features per cell.
pub fn detect_feature_changes(
    a: &FeatureMap,
    b: &FeatureMap,
    grid_size: u32,
    threshold: f32,
) -> VisionResult<Vec<ChangeRegion>> {
    check_grid(grid_size, threshold)?;
    if a.features.dim() != b.features.dim() {
        return Err(VisionError::InvalidInput(format!(
            "Feature maps differ in shape: {:?} vs {:?}",
            a.features.dim(),
            b.features.dim()
        )));
    }

    let (rows, cols) = (a.rows(), a.cols());
    // Sources of different sizes share the smaller of each side.
    let width = a.image_width.min(b.image_width);
    let height = a.image_height.min(b.image_height);
    let col_spans = grid_spans(cols as u32, grid_size);
    let mut regions = Vec::new();

    for row_span in grid_spans(rows as u32, grid_size) {
        let (y, h) = FeatureMap::to_pixels(row_span.0, row_span.1, rows, height);
        for &col_span in &col_spans {
            let (x, w) = FeatureMap::to_pixels(col_span.0, col_span.1, cols, width);
            if w == 0 || h == 0 {
                continue;
            }

            let pooled_a = a.pool(row_span, col_span);
            let pooled_b = b.pool(row_span, col_span);
            let score = 1.0 - cosine_similarity(&pooled_a, &pooled_b);
            if score > threshold {
                let cell = GridCell { x, y, width: w, height: h };
                regions.push(ChangeRegion::from_cell(cell, significance(score, threshold)));
            }
        }
    }

    Ok(regions)
}

/// Text-search variant: score every cell embedding against one text
/// embedding, highest first, keeping the top `top_k`. No threshold.
pub fn rank_cells(
    cells: Vec<(GridCell, Embedding)>,
    query: &Embedding,
    top_k: usize,
) -> VisionResult<Vec<(GridCell, f32)>> {
    let mut scored = cells
        .into_iter()
        .map(|(cell, emb)| Ok((cell, embedding_similarity(&emb, query)?)))
        .collect::<VisionResult<Vec<_>>>()?;

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(top_k);
    Ok(scored)
}
