use anyhow::{ensure, Result};
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::container::Container;
use crate::geometry::Point;
use crate::image_ex::{ColorSystem, ImageEx};
use crate::plane::{self, Color, Plane, ALPHA_THRESHOLD, BLACK, WHITE};
use crate::progress::Progress;

/// Per-pixel reduction applied when merging the aligned stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
    /// Coverage-weighted mean, the normal stacking output.
    #[default]
    Average,
    Median,
    Min,
    Max,
    /// Mean absolute deviation from the average, for inspecting misalignment.
    Difference,
}

/// Accumulates weighted pixel sums on a canvas that grows to fit every added
/// plane. Coordinates are global; the canvas origin follows the smallest
/// offset seen so far.
#[derive(Default)]
pub struct SumPlane {
    left: i32,
    top: i32,
    width: usize,
    height: usize,
    sum: Vec<f64>,
    amount: Vec<f64>,
}

impl SumPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Global position of the canvas' top-left corner.
    pub fn origin(&self) -> Point {
        Point::new(self.left as f64, self.top as f64)
    }

    pub fn size(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Grow the canvas so the rectangle `(x, y, width, height)` fits.
    pub fn ensure_fit(&mut self, x: i32, y: i32, width: usize, height: usize) {
        if self.is_empty() {
            self.left = x;
            self.top = y;
            self.width = width;
            self.height = height;
            self.sum = vec![0.0; width * height];
            self.amount = vec![0.0; width * height];
            return;
        }

        let left = self.left.min(x);
        let top = self.top.min(y);
        let right = (self.left + self.width as i32).max(x + width as i32);
        let bottom = (self.top + self.height as i32).max(y + height as i32);
        let new_width = (right - left) as usize;
        let new_height = (bottom - top) as usize;
        if left == self.left && top == self.top
            && new_width == self.width && new_height == self.height
        {
            return;
        }

        let mut sum = vec![0.0; new_width * new_height];
        let mut amount = vec![0.0; new_width * new_height];
        let shift_x = (self.left - left) as usize;
        let shift_y = (self.top - top) as usize;
        for iy in 0..self.height {
            let src = iy * self.width;
            let dst = (iy + shift_y) * new_width + shift_x;
            sum[dst..dst + self.width].copy_from_slice(&self.sum[src..src + self.width]);
            amount[dst..dst + self.width].copy_from_slice(&self.amount[src..src + self.width]);
        }
        self.left = left;
        self.top = top;
        self.width = new_width;
        self.height = new_height;
        self.sum = sum;
        self.amount = amount;
    }

    pub fn add_plane(&mut self, p: &Plane, x: i32, y: i32) {
        self.add_alpha_plane(p, None, x, y);
    }

    /// Add `p` at global position `(x, y)`, weighting each pixel by its alpha
    /// value. The alpha plane is rescaled when its size differs from `p`.
    pub fn add_alpha_plane(&mut self, p: &Plane, alpha: Option<&Plane>, x: i32, y: i32) {
        let rescaled;
        let alpha = match alpha {
            Some(a) if a.size() != p.size() => {
                rescaled = a.scale_cubic(p.width(), p.height());
                Some(&rescaled)
            }
            other => other,
        };

        self.ensure_fit(x, y, p.width(), p.height());
        let shift_x = (x - self.left) as usize;
        let shift_y = (y - self.top) as usize;
        for iy in 0..p.height() {
            let row = p.row(iy);
            let base = (iy + shift_y) * self.width + shift_x;
            match alpha {
                Some(a) => {
                    let a_row = a.row(iy);
                    for ix in 0..p.width() {
                        let weight = plane::as_double(a_row[ix]);
                        self.sum[base + ix] += row[ix] as f64 * weight;
                        self.amount[base + ix] += a_row[ix] as f64;
                    }
                }
                None => {
                    for ix in 0..p.width() {
                        self.sum[base + ix] += row[ix] as f64;
                        self.amount[base + ix] += WHITE as f64;
                    }
                }
            }
        }
    }

    /// Weighted mean of everything added so far; uncovered pixels are black.
    pub fn average(&self) -> Plane {
        let data = self
            .sum
            .iter()
            .zip(&self.amount)
            .map(|(&sum, &amount)| {
                if amount > 0.0 {
                    (sum / (amount / WHITE as f64)).round().min(WHITE as f64) as Color
                } else {
                    BLACK
                }
            })
            .collect();
        Plane::from_data(self.width, self.height, data)
    }

    /// Coverage mask: opaque wherever at least one plane contributed.
    pub fn alpha(&self) -> Plane {
        let data = self
            .amount
            .iter()
            .map(|&amount| if amount > 0.0 { WHITE } else { BLACK })
            .collect();
        Plane::from_data(self.width, self.height, data)
    }
}

/// A plane positioned on the output canvas, with an optional alpha mask.
struct PlacedPlane {
    plane: Plane,
    alpha: Option<Plane>,
    x: i32,
    y: i32,
}

impl PlacedPlane {
    /// Sample at canvas coordinates; `None` outside the plane or where the
    /// alpha mask says transparent.
    fn sample(&self, x: i32, y: i32) -> Option<Color> {
        let sx = x - self.x;
        let sy = y - self.y;
        if sx < 0 || sy < 0 || sx as usize >= self.plane.width() || sy as usize >= self.plane.height()
        {
            return None;
        }
        let (sx, sy) = (sx as usize, sy as usize);
        if let Some(ref alpha) = self.alpha {
            if alpha.pixel(sx, sy) < ALPHA_THRESHOLD {
                return None;
            }
        }
        Some(self.plane.pixel(sx, sy))
    }
}

/// Combines the aligned images of a container into a single output image.
#[derive(Debug, Clone, Copy)]
pub struct MergeRenderer {
    pub mode: MergeMode,
    /// Scale chroma planes up to luma resolution instead of rendering them
    /// at their native subsampled size.
    pub upscale_chroma: bool,
}

impl Default for MergeRenderer {
    fn default() -> Self {
        Self { mode: MergeMode::Average, upscale_chroma: true }
    }
}

impl MergeRenderer {
    pub fn new(mode: MergeMode) -> Self {
        Self { mode, ..Self::default() }
    }

    /// Render up to `max_count` images at their current positions. An empty
    /// container yields an empty image rather than an error.
    pub fn render(
        &self,
        container: &Container,
        max_count: Option<usize>,
        progress: &mut Progress,
    ) -> Result<ImageEx> {
        let count = max_count.unwrap_or(usize::MAX).min(container.count());
        if count == 0 {
            warn!("No images to render");
            return Ok(ImageEx::empty());
        }
        info!("Rendering {} images with {:?} merge", count, self.mode);

        let system = container.image(0).system();
        for i in 1..count {
            ensure!(
                container.image(i).system() == system,
                "cannot merge mixed color systems: image {} is {:?}, expected {:?}",
                i,
                container.image(i).system(),
                system
            );
        }

        let gray = system == ColorSystem::Gray;
        let planes_amount = if gray || self.mode == MergeMode::Difference { 1 } else { 3 };
        progress.set_total(planes_amount * count);

        let full = container.size();
        let min_point = container.min_point();

        let mut planes = Vec::with_capacity(planes_amount);
        let mut alpha_out = None;
        for c in 0..planes_amount {
            progress.check_cancelled()?;

            // Chroma planes may be subsampled relative to luma.
            let (scale_x, scale_y) = if self.upscale_chroma {
                (1.0, 1.0)
            } else {
                let luma = container.image(0).plane(0);
                let chroma = container.image(0).plane(c);
                (
                    chroma.width() as f64 / luma.width() as f64,
                    chroma.height() as f64 / luma.height() as f64,
                )
            };
            let local_width = (full.width * scale_x).round() as usize;
            let local_height = (full.height * scale_y).round() as usize;

            let mut placed = Vec::with_capacity(count);
            for j in 0..count {
                let pos = container.pos(j) - min_point;
                let luma = container.image(j).plane(0);
                let target_width = (luma.width() as f64 * scale_x).round() as usize;
                let target_height = (luma.height() as f64 * scale_y).round() as usize;
                let source = container.image(j).plane(c);
                let plane = if source.size() != (target_width, target_height) {
                    source.scale_cubic(target_width, target_height)
                } else {
                    source.clone()
                };
                let alpha = container.alpha(j).map(|a| {
                    if a.size() != plane.size() {
                        a.scale_cubic(plane.width(), plane.height())
                    } else {
                        a.clone()
                    }
                });
                placed.push(PlacedPlane {
                    plane,
                    alpha,
                    x: (pos.x * scale_x).round() as i32,
                    y: (pos.y * scale_y).round() as i32,
                });
                progress.add(1);
            }

            let merged = match self.mode {
                MergeMode::Average => {
                    let mut sum = SumPlane::new();
                    sum.ensure_fit(0, 0, local_width, local_height);
                    for p in &placed {
                        sum.add_alpha_plane(&p.plane, p.alpha.as_ref(), p.x, p.y);
                    }
                    if c == 0 {
                        alpha_out = Some(sum.alpha());
                    }
                    sum.average()
                }
                _ => {
                    let merged = merge_statistic(&placed, local_width, local_height, self.mode);
                    if c == 0 {
                        alpha_out = Some(coverage(&placed, local_width, local_height));
                    }
                    merged
                }
            };
            planes.push(merged);
            progress.report("Merged channel");
        }

        let mut result = if planes.len() == 1 {
            ImageEx::new_gray(planes.remove(0))
        } else {
            let b = planes.remove(2);
            let g = planes.remove(1);
            let r = planes.remove(0);
            ImageEx::new_rgb([r, g, b])
        };
        result.set_alpha(alpha_out);
        Ok(result)
    }
}

fn merge_statistic(placed: &[PlacedPlane], width: usize, height: usize, mode: MergeMode) -> Plane {
    let rows: Vec<Vec<Color>> = (0..height)
        .into_par_iter()
        .map(|y| {
            let mut row = vec![BLACK; width];
            let mut values = Vec::with_capacity(placed.len());
            for (x, out) in row.iter_mut().enumerate() {
                values.clear();
                for p in placed {
                    if let Some(value) = p.sample(x as i32, y as i32) {
                        values.push(value);
                    }
                }
                *out = reduce(&mut values, mode);
            }
            row
        })
        .collect();

    let mut data = Vec::with_capacity(width * height);
    for row in rows {
        data.extend(row);
    }
    Plane::from_data(width, height, data)
}

fn reduce(values: &mut Vec<Color>, mode: MergeMode) -> Color {
    match mode {
        MergeMode::Min => values.iter().copied().min().unwrap_or(WHITE),
        MergeMode::Max => values.iter().copied().max().unwrap_or(BLACK),
        MergeMode::Median => {
            if values.is_empty() {
                BLACK
            } else {
                let middle = values.len() / 2;
                *values.select_nth_unstable(middle).1
            }
        }
        MergeMode::Difference => {
            if values.is_empty() {
                BLACK
            } else {
                let mean = values.iter().map(|&v| v as u64).sum::<u64>() / values.len() as u64;
                let deviation = values
                    .iter()
                    .map(|&v| (v as i64 - mean as i64).unsigned_abs())
                    .sum::<u64>()
                    / values.len() as u64;
                deviation.min(WHITE as u64) as Color
            }
        }
        // Average goes through SumPlane instead
        MergeMode::Average => BLACK,
    }
}

fn coverage(placed: &[PlacedPlane], width: usize, height: usize) -> Plane {
    let rows: Vec<Vec<Color>> = (0..height)
        .into_par_iter()
        .map(|y| {
            (0..width)
                .map(|x| {
                    let covered = placed.iter().any(|p| p.sample(x as i32, y as i32).is_some());
                    if covered {
                        WHITE
                    } else {
                        BLACK
                    }
                })
                .collect()
        })
        .collect();

    let mut data = Vec::with_capacity(width * height);
    for row in rows {
        data.extend(row);
    }
    Plane::from_data(width, height, data)
}
