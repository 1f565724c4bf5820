use rayon::prelude::*;

use crate::plane::{Color, Plane, ALPHA_THRESHOLD, WHITE};

/// Sentinel returned when two planes share no usable overlap at an offset.
pub const MAX_ERROR: f64 = f64::MAX;

/// Knobs for the scalar difference metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiffSettings {
    /// Sample only every `stride`-th row and column. Must be at least 1.
    pub stride: usize,
    /// Use the squared (L2) distance instead of absolute (L1).
    pub use_l2: bool,
    /// Differences at or below this level count as zero (noise floor).
    pub epsilon: Color,
}

impl Default for DiffSettings {
    fn default() -> Self {
        Self { stride: 1, use_l2: false, epsilon: 0 }
    }
}

impl DiffSettings {
    /// Same settings but sampling at the given coarseness.
    pub fn with_stride(self, stride: usize) -> Self {
        Self { stride: stride.max(1), ..self }
    }
}

/// Difference without alpha masking.
pub fn simple(p1: &Plane, p2: &Plane, offset: (i32, i32), settings: DiffSettings) -> f64 {
    simple_alpha(p1, p2, None, None, offset, settings)
}

/// Mean per-pixel difference between `p1` and `p2` with `p2` displaced by
/// `offset`. Only the overlapping region contributes, and only pixels where
/// both alpha planes (when provided) are at least half opaque. Returns
/// `MAX_ERROR` when the sampled overlap is empty or covers less than 10% of
/// the comparable area.
///
/// Deterministic and side-effect free; every comparator builds on this.
pub fn simple_alpha(
    p1: &Plane,
    p2: &Plane,
    a1: Option<&Plane>,
    a2: Option<&Plane>,
    offset: (i32, i32),
    settings: DiffSettings,
) -> f64 {
    let (x, y) = offset;
    let stride = settings.stride.max(1);

    // Edges of the overlapping region on both planes
    let p1_top = y.max(0) as usize;
    let p2_top = (-y).max(0) as usize;
    let p1_left = x.max(0) as usize;
    let p2_left = (-x).max(0) as usize;

    if p1_left >= p1.width() || p2_left >= p2.width() || p1_top >= p1.height() || p2_top >= p2.height() {
        return MAX_ERROR;
    }
    let width = (p1.width() - p1_left).min(p2.width() - p2_left);
    let height = (p1.height() - p1_top).min(p2.height() - p2_top);
    if width == 0 || height == 0 {
        return MAX_ERROR;
    }

    let rows: Vec<usize> = (0..height).step_by(stride).collect();
    let (sum, count) = rows
        .par_iter()
        .map(|&iy| {
            let line1 = &p1.row(p1_top + iy)[p1_left..p1_left + width];
            let line2 = &p2.row(p2_top + iy)[p2_left..p2_left + width];
            let alpha1 = a1.map(|a| &a.row(p1_top + iy)[p1_left..p1_left + width]);
            let alpha2 = a2.map(|a| &a.row(p2_top + iy)[p2_left..p2_left + width]);
            diff_line(line1, line2, alpha1, alpha2, settings)
        })
        .reduce(|| (0.0, 0.0), |a, b| (a.0 + b.0, a.1 + b.1));

    // Sample positions the region would yield at full coverage
    let full_area = (rows.len() * width.div_ceil(stride)) as f64;
    if full_area * 0.1 > count {
        MAX_ERROR
    } else {
        sum / count
    }
}

/// Sum one row of differences. Returns (sum, counted samples).
fn diff_line(
    line1: &[Color],
    line2: &[Color],
    alpha1: Option<&[Color]>,
    alpha2: Option<&[Color]>,
    settings: DiffSettings,
) -> (f64, f64) {
    let stride = settings.stride.max(1);
    let mut sum = 0.0;
    let mut count = 0.0;
    for i in (0..line1.len()).step_by(stride) {
        if let Some(a) = alpha1 {
            if a[i] < ALPHA_THRESHOLD {
                continue;
            }
        }
        if let Some(a) = alpha2 {
            if a[i] < ALPHA_THRESHOLD {
                continue;
            }
        }
        let raw = (line1[i] as i32 - line2[i] as i32).unsigned_abs() as Color;
        let checked = raw.saturating_sub(settings.epsilon) as f64;
        sum += if settings.use_l2 {
            let v = checked / WHITE as f64;
            v * v * WHITE as f64
        } else {
            checked
        };
        count += 1.0;
    }
    (sum, count)
}

/// Convenience for tests and thresholds: the error level matching a uniform
/// difference of `fraction` of full white.
pub fn error_level(fraction: f64) -> f64 {
    fraction * WHITE as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_plane(width: usize, height: usize) -> Plane {
        let mut p = Plane::new(width, height);
        for y in 0..height {
            for x in 0..width {
                p.set_pixel(x, y, ((x * 131 + y * 313) % 997 * 60) as Color);
            }
        }
        p
    }

    #[test]
    fn test_identical_planes_zero_diff() {
        let p = gradient_plane(16, 16);
        assert_eq!(simple(&p, &p, (0, 0), DiffSettings::default()), 0.0);
    }

    #[test]
    fn test_shift_symmetry() {
        let a = gradient_plane(16, 16);
        let b = gradient_plane(16, 12);
        let s = DiffSettings::default();
        // Swapping the planes and negating the offset compares the same region
        assert_eq!(
            simple(&a, &b, (3, -2), s),
            simple(&b, &a, (-3, 2), s),
        );
    }

    #[test]
    fn test_no_overlap_is_sentinel() {
        let a = gradient_plane(8, 8);
        let b = gradient_plane(8, 8);
        assert_eq!(simple(&a, &b, (8, 0), DiffSettings::default()), MAX_ERROR);
        assert_eq!(simple(&a, &b, (0, -8), DiffSettings::default()), MAX_ERROR);
    }

    #[test]
    fn test_epsilon_floors_noise() {
        let mut a = Plane::new(4, 4);
        let mut b = Plane::new(4, 4);
        a.fill(1000);
        b.fill(1050);
        let noisy = simple(&a, &b, (0, 0), DiffSettings::default());
        assert_eq!(noisy, 50.0);
        let floored = simple(&a, &b, (0, 0), DiffSettings { epsilon: 100, ..Default::default() });
        assert_eq!(floored, 0.0);
    }

    #[test]
    fn test_l2_weighs_outliers_heavier() {
        let mut a = Plane::new(2, 1);
        let mut b = Plane::new(2, 1);
        // One large outlier vs. two medium differences of the same L1 total
        a.set_pixel(0, 0, 0);
        b.set_pixel(0, 0, 20000);
        let outlier = simple(&a, &b, (0, 0), DiffSettings { use_l2: true, ..Default::default() });

        a.set_pixel(0, 0, 0);
        a.set_pixel(1, 0, 0);
        b.set_pixel(0, 0, 10000);
        b.set_pixel(1, 0, 10000);
        let spread = simple(&a, &b, (0, 0), DiffSettings { use_l2: true, ..Default::default() });
        assert!(outlier > spread);
    }

    #[test]
    fn test_transparent_region_ignored() {
        let mut a = Plane::new(8, 1);
        let mut b = Plane::new(8, 1);
        a.fill(0);
        b.fill(WHITE);
        // Mask out the mismatching half of the comparison on one side
        let mut mask = Plane::new(8, 1);
        for x in 0..8 {
            mask.set_pixel(x, 0, if x < 4 { WHITE } else { 0 });
        }
        b = {
            let mut clone = b.clone();
            for x in 0..4 {
                clone.set_pixel(x, 0, 0);
            }
            clone
        };
        let masked = simple_alpha(&a, &b, Some(&mask), None, (0, 0), DiffSettings::default());
        assert_eq!(masked, 0.0);
    }

    #[test]
    fn test_stride_sampling_still_converges() {
        let a = gradient_plane(32, 32);
        let full = simple(&a, &a, (0, 0), DiffSettings::default());
        let sparse = simple(&a, &a, (0, 0), DiffSettings::default().with_stride(4));
        assert_eq!(full, 0.0);
        assert_eq!(sparse, 0.0);
    }
}
