use anyhow::{bail, Result};
use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::difference::{self, DiffSettings};
use crate::geometry::{Point, Rect};
use crate::gradient::{GradientSearch, SearchArea};
use crate::plane::Plane;

/// Result of matching two planes: `distance` places the second plane relative
/// to the first, `error` is the dissimilarity over the shared region, and
/// `overlap` is the shared fraction of the first plane's area. A negative
/// `error`/`overlap` marks an offset that has not been computed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageOffset {
    pub distance: Point,
    pub error: f64,
    pub overlap: f64,
}

impl Default for ImageOffset {
    fn default() -> Self {
        Self { distance: Point::new(0.0, 0.0), error: -1.0, overlap: -1.0 }
    }
}

impl ImageOffset {
    pub fn new(distance: Point, error: f64, overlap: f64) -> Self {
        Self { distance, error, overlap }
    }

    /// Like `new`, but derives the overlap from the plane geometry.
    pub fn with_planes(distance: Point, error: f64, p1: &Plane, p2: &Plane) -> Self {
        let overlap = Self::calculate_overlap(distance.round(), p1, p2);
        Self { distance, error, overlap }
    }

    /// Intersection of the two planes' bounding rectangles at `offset`,
    /// as a fraction of the first plane's area.
    pub fn calculate_overlap(offset: Point, p1: &Plane, p2: &Plane) -> f64 {
        let first = Rect::new(0.0, 0.0, p1.width() as f64, p1.height() as f64);
        let second = Rect::new(offset.x, offset.y, p2.width() as f64, p2.height() as f64);
        first.intersected(&second).area() / first.area()
    }

    pub fn is_valid(&self) -> bool {
        self.overlap >= 0.0
    }

    /// The same match seen from the other image's point of view.
    pub fn reverse(self) -> Self {
        Self { distance: -self.distance, ..self }
    }
}

/// Which axes an offset search is allowed to move along.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlignMethod {
    #[default]
    Both,
    Ver,
    Hor,
}

impl AlignMethod {
    /// Per-axis movement fractions, with the locked axis forced to zero.
    pub fn movement_scale(self, movement: f64) -> (f64, f64) {
        match self {
            AlignMethod::Both => (movement, movement),
            AlignMethod::Ver => (0.0, movement),
            AlignMethod::Hor => (movement, 0.0),
        }
    }
}

/// Configuration for the coarse-to-fine search.
#[derive(Debug, Clone, Copy)]
pub struct GradientSettings {
    pub method: AlignMethod,
    /// Search range as a fraction of the image size on each open axis.
    pub movement: f64,
    pub start_level: i32,
    pub max_level: i32,
    pub settings: DiffSettings,
    /// Errors above this make the search retry one level finer.
    pub max_difference: f64,
}

impl Default for GradientSettings {
    fn default() -> Self {
        Self {
            method: AlignMethod::Both,
            movement: 0.75,
            start_level: 1,
            max_level: 6,
            settings: DiffSettings::default(),
            max_difference: difference::error_level(0.10),
        }
    }
}

/// Strategy for finding the translation between two planes.
#[derive(Debug, Clone)]
pub enum Comparator {
    /// Every integer offset within the movement window. Only sensible for
    /// small windows.
    BruteForce { method: AlignMethod, movement: f64, settings: DiffSettings },
    /// Recursive grid refinement, the default.
    Gradient(GradientSettings),
    /// Estimate on 2x-downscaled planes, then disambiguate at full size.
    MultiScale { settings: DiffSettings },
    /// Rotation/scale aware matching. Not implemented.
    LogPolar,
}

impl Default for Comparator {
    fn default() -> Self {
        Comparator::Gradient(GradientSettings::default())
    }
}

impl Comparator {
    /// Find the offset placing `p2` relative to `p1`. `hint` seeds the search
    /// where the strategy supports it.
    pub fn find_offset(
        &self,
        p1: &Plane,
        p2: &Plane,
        a1: Option<&Plane>,
        a2: Option<&Plane>,
        hint: Point,
    ) -> Result<ImageOffset> {
        match self {
            Comparator::BruteForce { method, movement, settings } => {
                Ok(brute_force(p1, p2, a1, a2, *method, *movement, *settings))
            }
            Comparator::Gradient(conf) => gradient(p1, p2, a1, a2, hint, *conf),
            Comparator::MultiScale { settings } => Ok(multi_scale(p1, p2, a1, a2, *settings)),
            Comparator::LogPolar => bail!("log-polar comparator is not implemented"),
        }
    }

    /// Error at a specific translation, in this comparator's metric. Does not
    /// search.
    pub fn find_error(
        &self,
        p1: &Plane,
        p2: &Plane,
        a1: Option<&Plane>,
        a2: Option<&Plane>,
        x: f64,
        y: f64,
    ) -> Result<f64> {
        let settings = match self {
            Comparator::BruteForce { settings, .. } => *settings,
            Comparator::Gradient(conf) => conf.settings,
            Comparator::MultiScale { settings } => *settings,
            Comparator::LogPolar => bail!("log-polar comparator is not implemented"),
        };
        let offset = (x.round() as i32, y.round() as i32);
        Ok(difference::simple_alpha(p1, p2, a1, a2, offset, settings))
    }
}

fn brute_force(
    p1: &Plane,
    p2: &Plane,
    a1: Option<&Plane>,
    a2: Option<&Plane>,
    method: AlignMethod,
    movement: f64,
    settings: DiffSettings,
) -> ImageOffset {
    let (sx, sy) = method.movement_scale(movement);
    let max_x = (sx * p1.width() as f64) as i32;
    let max_y = (sy * p1.height() as f64) as i32;
    debug!("brute force window: ±{} x ±{}", max_x, max_y);

    let mut offsets = Vec::new();
    for x in -max_x..=max_x {
        for y in -max_y..=max_y {
            offsets.push((x, y));
        }
    }
    let errors: Vec<f64> = offsets
        .par_iter()
        .map(|&(x, y)| difference::simple_alpha(p1, p2, a1, a2, (x, y), settings))
        .collect();

    // First strict minimum in evaluation order wins; ties carry no intent.
    let mut result = ImageOffset { error: f64::MAX, ..ImageOffset::default() };
    for (&(x, y), &error) in offsets.iter().zip(&errors) {
        if error < result.error {
            result = ImageOffset::with_planes(Point::new(x as f64, y as f64), error, p1, p2);
        }
    }
    result
}

fn gradient(
    p1: &Plane,
    p2: &Plane,
    a1: Option<&Plane>,
    a2: Option<&Plane>,
    hint: Point,
    conf: GradientSettings,
) -> Result<ImageOffset> {
    let scale = conf.method.movement_scale(conf.movement);
    // One search instance per pair; its cache survives level escalation.
    let mut search = GradientSearch::new(p1, p2, a1, a2, conf.settings);
    let mut level = conf.start_level;
    let result = loop {
        let area = SearchArea::from_sizes(p1.size(), p2.size(), scale, hint, level);
        let result = search.find_minimum(area)?;
        if result.error <= conf.max_difference || level >= conf.max_level {
            break result;
        }
        level += 1;
        debug!("gradient search retrying at level {}", level);
    };
    Ok(ImageOffset::with_planes(result.distance, result.error, p1, p2))
}

fn multi_scale(
    p1: &Plane,
    p2: &Plane,
    a1: Option<&Plane>,
    a2: Option<&Plane>,
    settings: DiffSettings,
) -> ImageOffset {
    // Estimate on the halved pair first; a plane too small to halve ends the
    // recursion with a zero estimate.
    let below = match (p1.downscale_half(), p2.downscale_half()) {
        (Some(d1), Some(d2)) => {
            let da1 = a1.and_then(Plane::downscale_half);
            let da2 = a2.and_then(Plane::downscale_half);
            multi_scale(&d1, &d2, da1.as_ref(), da2.as_ref(), settings)
        }
        _ => ImageOffset::default(),
    };
    let base = below.distance.round() * 2.0;

    // Doubling loses one bit; check the four candidate remainders.
    let offsets = [(0, 0), (0, 1), (1, 0), (1, 1)];
    let mut errors = [0.0; 4];
    for (error, &(dx, dy)) in errors.iter_mut().zip(&offsets) {
        let at = (base.x as i32 + dx, base.y as i32 + dy);
        *error = difference::simple_alpha(p1, p2, a1, a2, at, settings);
        if !error.is_finite() {
            *error = f64::MAX;
        }
    }

    let mut best = 0;
    for i in 1..4 {
        if errors[i] < errors[best] {
            best = i;
        }
    }
    let distance = Point::new(
        base.x + offsets[best].0 as f64,
        base.y + offsets[best].1 as f64,
    );
    ImageOffset::with_planes(distance, errors[best], p1, p2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::difference::MAX_ERROR;

    /// Ramp plus a low-frequency wave: the ramp gives the metric a slope at
    /// every scale, the wave breaks the ramp's translation degeneracy.
    fn test_pattern(width: usize, height: usize, shift: (usize, usize)) -> Plane {
        let mut p = Plane::new(width, height);
        for y in 0..height {
            for x in 0..width {
                let sx = (x + shift.0) as f64;
                let sy = (y + shift.1) as f64;
                let v = 2000.0 + 500.0 * sx + 250.0 * sy
                    + 2000.0 * (sx * 0.35).sin() * (sy * 0.25).cos();
                p.set_pixel(x, y, v as u16);
            }
        }
        p
    }

    fn assert_distance(offset: &ImageOffset, x: f64, y: f64) {
        assert_eq!(offset.distance.x, x, "x of {:?}", offset);
        assert_eq!(offset.distance.y, y, "y of {:?}", offset);
    }

    #[test]
    fn test_brute_force_recovers_translation() {
        let p1 = test_pattern(32, 32, (0, 0));
        let p2 = test_pattern(32, 32, (3, 2));
        let comparator = Comparator::BruteForce {
            method: AlignMethod::Both,
            movement: 0.25,
            settings: DiffSettings::default(),
        };
        let offset = comparator
            .find_offset(&p1, &p2, None, None, Point::new(0.0, 0.0))
            .unwrap();
        assert_distance(&offset, 3.0, 2.0);
        assert_eq!(offset.error, 0.0);
    }

    #[test]
    fn test_gradient_recovers_translation() {
        let p1 = test_pattern(32, 32, (0, 0));
        let p2 = test_pattern(32, 32, (3, 2));
        let comparator = Comparator::default();
        let offset = comparator
            .find_offset(&p1, &p2, None, None, Point::new(0.0, 0.0))
            .unwrap();
        assert_distance(&offset, 3.0, 2.0);
        assert_eq!(offset.error, 0.0);
    }

    #[test]
    fn test_multi_scale_recovers_halvable_translation() {
        let p1 = test_pattern(64, 64, (0, 0));
        let p2 = test_pattern(64, 64, (16, 16));
        let comparator = Comparator::MultiScale { settings: DiffSettings::default() };
        let offset = comparator
            .find_offset(&p1, &p2, None, None, Point::new(0.0, 0.0))
            .unwrap();
        assert_distance(&offset, 16.0, 16.0);
        assert_eq!(offset.error, 0.0);
    }

    #[test]
    fn test_self_identity() {
        let p = test_pattern(32, 32, (0, 0));
        let comparator = Comparator::default();
        let offset = comparator
            .find_offset(&p, &p, None, None, Point::new(0.0, 0.0))
            .unwrap();
        assert_distance(&offset, 0.0, 0.0);
        assert_eq!(offset.error, 0.0);
        assert_eq!(offset.overlap, 1.0);
    }

    #[test]
    fn test_reversal_symmetry() {
        let p1 = test_pattern(32, 32, (0, 0));
        let p2 = test_pattern(32, 32, (2, 1));
        let comparator = Comparator::BruteForce {
            method: AlignMethod::Both,
            movement: 0.2,
            settings: DiffSettings::default(),
        };
        let forward = comparator
            .find_offset(&p1, &p2, None, None, Point::new(0.0, 0.0))
            .unwrap();
        let backward = comparator
            .find_offset(&p2, &p1, None, None, Point::new(0.0, 0.0))
            .unwrap();
        assert_eq!(forward.distance.x, -backward.distance.x);
        assert_eq!(forward.distance.y, -backward.distance.y);
        assert_eq!(forward.error, backward.error);
        assert_eq!(forward.overlap, backward.overlap);
        assert_eq!(forward.reverse(), backward);
    }

    #[test]
    fn test_align_method_restricts_axis() {
        let p1 = test_pattern(32, 32, (0, 0));
        let p2 = test_pattern(32, 32, (0, 3));
        let comparator = Comparator::BruteForce {
            method: AlignMethod::Ver,
            movement: 0.25,
            settings: DiffSettings::default(),
        };
        let offset = comparator
            .find_offset(&p1, &p2, None, None, Point::new(0.0, 0.0))
            .unwrap();
        assert_distance(&offset, 0.0, 3.0);
    }

    #[test]
    fn test_overlap_shrinks_with_distance() {
        let p1 = test_pattern(16, 16, (0, 0));
        let p2 = test_pattern(16, 16, (0, 0));
        let mut previous = 1.0;
        for step in 1..=8 {
            let offset = Point::new((step * 3) as f64, 0.0);
            let overlap = ImageOffset::calculate_overlap(offset, &p1, &p2);
            assert!(overlap < previous, "overlap not shrinking at {:?}", offset);
            previous = overlap;
        }
        assert_eq!(ImageOffset::calculate_overlap(Point::new(16.0, 0.0), &p1, &p2), 0.0);
        let error =
            difference::simple(&p1, &p2, (16, 0), DiffSettings::default());
        assert_eq!(error, MAX_ERROR);
    }

    #[test]
    fn test_log_polar_is_unimplemented() {
        let p = test_pattern(8, 8, (0, 0));
        assert!(Comparator::LogPolar
            .find_offset(&p, &p, None, None, Point::new(0.0, 0.0))
            .is_err());
    }

    #[test]
    fn test_find_error_matches_known_translation() {
        let p1 = test_pattern(32, 32, (0, 0));
        let p2 = test_pattern(32, 32, (3, 2));
        let comparator = Comparator::default();
        let error = comparator.find_error(&p1, &p2, None, None, 3.0, 2.0).unwrap();
        assert_eq!(error, 0.0);
        let wrong = comparator.find_error(&p1, &p2, None, None, 0.0, 0.0).unwrap();
        assert!(wrong > 0.0);
    }
}
