use anyhow::{bail, Result};
use rayon::prelude::*;

use crate::cache::DiffCache;
use crate::comparator::ImageOffset;
use crate::difference::{self, DiffSettings};
use crate::geometry::Point;
use crate::plane::Plane;

/// Rectangular range of candidate offsets plus the refinement level that
/// controls how fine a grid is laid over it.
#[derive(Debug, Clone, Copy)]
pub struct SearchArea {
    pub left: i32,
    pub right: i32,
    pub top: i32,
    pub bottom: i32,
    pub level: i32,
}

impl SearchArea {
    /// Full movement range for two planes: every offset keeping at least one
    /// pixel of overlap, shrunk by the per-axis movement fraction and biased
    /// towards `hint`.
    pub fn from_sizes(
        size1: (usize, usize),
        size2: (usize, usize),
        scale: (f64, f64),
        hint: Point,
        level: i32,
    ) -> Self {
        let limit_left = 1 - size2.0 as i32;
        let limit_top = 1 - size2.1 as i32;
        let limit_right = size1.0 as i32 - 1;
        let limit_bottom = size1.1 as i32 - 1;

        let left = (limit_left as f64).max(limit_left as f64 * scale.0 + hint.x) as i32;
        let top = (limit_top as f64).max(limit_top as f64 * scale.1 + hint.y) as i32;
        let right = (limit_right as f64).min(limit_right as f64 * scale.0 + hint.x) as i32;
        let bottom = (limit_bottom as f64).min(limit_bottom as f64 * scale.1 + hint.y) as i32;

        Self { left, right, top, bottom, level }
    }
}

/// One grid point under evaluation. `sub_area` is the smaller range to search
/// next should this candidate win the round; the terminal (exhaustive) round
/// leaves it unset.
struct Candidate {
    x: i32,
    y: i32,
    diff: Option<f64>,
    from_cache: bool,
    precision: f64,
    sub_area: Option<SearchArea>,
}

/// Coarse-to-fine offset search between two planes. Owns the per-comparison
/// `DiffCache`; one instance must never be shared between image pairs.
pub struct GradientSearch<'a> {
    p1: &'a Plane,
    p2: &'a Plane,
    a1: Option<&'a Plane>,
    a2: Option<&'a Plane>,
    settings: DiffSettings,
    cache: DiffCache,
}

impl<'a> GradientSearch<'a> {
    pub fn new(
        p1: &'a Plane,
        p2: &'a Plane,
        a1: Option<&'a Plane>,
        a2: Option<&'a Plane>,
        settings: DiffSettings,
    ) -> Self {
        Self { p1, p2, a1, a2, settings, cache: DiffCache::new() }
    }

    /// Metric at an integer offset, sampled coarser for coarser precision.
    fn difference(&self, x: i32, y: i32, precision: f64) -> f64 {
        let settings = self.settings.with_stride(precision.max(1.0) as usize);
        difference::simple_alpha(self.p1, self.p2, self.a1, self.a2, (x, y), settings)
    }

    /// Pixel count of the overlapping region at an offset.
    fn checked_area(&self, x: i32, y: i32) -> f64 {
        let p1_left = x.max(0) as usize;
        let p1_top = y.max(0) as usize;
        let p2_left = (-x).max(0) as usize;
        let p2_top = (-y).max(0) as usize;
        if p1_left >= self.p1.width()
            || p2_left >= self.p2.width()
            || p1_top >= self.p1.height()
            || p2_top >= self.p2.height()
        {
            return 0.0;
        }
        let width = (self.p1.width() - p1_left).min(self.p2.width() - p2_left);
        let height = (self.p1.height() - p1_top).min(self.p2.height() - p2_top);
        (width * height) as f64
    }

    /// Find the minimum-error offset inside `area` by recursive refinement.
    ///
    /// Lays an `(2*level+2)^2` grid over the area, evaluates every grid point
    /// in parallel at a precision proportional to the grid spacing, then
    /// recurses into a half-spacing rectangle around the winner. Once the
    /// spacing drops below one pixel in both axes every remaining integer
    /// offset is checked exhaustively. Ties resolve to the first minimum in
    /// row-major candidate order; this is deterministic but carries no intent.
    pub fn find_minimum(&mut self, area: SearchArea) -> Result<ImageOffset> {
        let amount = area.level * 2 + 2;
        let h_offset = (area.right - area.left) as f64 / amount as f64;
        let v_offset = (area.bottom - area.top) as f64 / amount as f64;
        let next_level = (area.level - 1).max(1);

        let mut candidates = Vec::new();
        if h_offset < 1.0 && v_offset < 1.0 {
            // Trivial step: check every remaining offset in the area
            for iy in area.top..=area.bottom {
                for ix in area.left..=area.right {
                    let diff = self.cache.get(ix, iy, 1.0);
                    candidates.push(Candidate {
                        x: ix,
                        y: iy,
                        from_cache: diff.is_some(),
                        diff,
                        precision: 1.0,
                        sub_area: None,
                    });
                }
            }
        } else {
            // Make sure we will not visit the same offset multiple times
            let h_add = h_offset.max(1.0);
            let v_add = v_offset.max(1.0);

            let prec_offset = if h_offset == 0.0 || v_offset == 0.0 {
                h_offset.max(v_offset)
            } else {
                h_offset.min(v_offset)
            };
            let precision = prec_offset.sqrt();

            let mut iy = area.top as f64 + v_offset;
            while iy <= area.bottom as f64 {
                let mut ix = area.left as f64 + h_offset;
                while ix <= area.right as f64 {
                    let x = ix.round() as i32;
                    let y = iy.round() as i32;

                    // Skip the right/bottom edge; the loop must still run at
                    // least once, so it cannot be folded into the condition.
                    let at_edge = (x == area.right && x != area.left)
                        || (y == area.bottom && y != area.top);
                    if !at_edge {
                        let sub_area = SearchArea {
                            left: (ix - h_offset).floor() as i32,
                            right: (ix + h_offset).ceil() as i32,
                            top: (iy - v_offset).floor() as i32,
                            bottom: (iy + v_offset).ceil() as i32,
                            level: next_level,
                        };
                        let diff = self.cache.get(x, y, precision);
                        candidates.push(Candidate {
                            x,
                            y,
                            from_cache: diff.is_some(),
                            diff,
                            precision,
                            sub_area: Some(sub_area),
                        });
                    }
                    ix += h_add;
                }
                iy += v_add;
            }
        }

        if candidates.is_empty() {
            bail!("empty search area, nothing to refine");
        }

        // Candidates with a smaller overlap get cheaper (coarser) sampling
        let max_checked = candidates
            .iter()
            .map(|c| self.checked_area(c.x, c.y))
            .fold(0.0, f64::max);
        if max_checked > 0.0 {
            for c in candidates.iter_mut() {
                let checked = self.checked_area(c.x, c.y);
                if checked > 0.0 {
                    c.precision = (c.precision / (max_checked / checked)).max(1.0);
                }
            }
        }

        // Evaluate every unknown candidate in parallel; results are written
        // back into the cache only after the whole round has finished.
        let searcher = &*self;
        candidates.par_iter_mut().for_each(|c| {
            if c.diff.is_none() {
                c.diff = Some(searcher.difference(c.x, c.y, c.precision));
            }
        });

        let mut best: Option<&Candidate> = None;
        let mut best_diff = f64::MAX;
        for c in candidates.iter() {
            let diff = c.diff.unwrap_or(f64::MAX);
            if diff < best_diff {
                best = Some(c);
                best_diff = diff;
            }
            if !c.from_cache {
                self.cache.add(c.x, c.y, diff, c.precision);
            }
        }

        let best = match best {
            Some(c) => c,
            None => bail!("no usable candidate in search area"),
        };
        match best.sub_area {
            Some(sub) => self.find_minimum(sub),
            // Overlap is a placeholder here; the driver recomputes it from
            // the full plane geometry.
            None => Ok(ImageOffset::new(
                Point::new(best.x as f64, best.y as f64),
                best_diff,
                1.0,
            )),
        }
    }

    #[cfg(test)]
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plane::Plane;

    /// Smooth low-frequency plane so the metric has a slope to descend.
    fn test_pattern(width: usize, height: usize, shift: (usize, usize)) -> Plane {
        let mut p = Plane::new(width, height);
        for y in 0..height {
            for x in 0..width {
                let sx = (x + shift.0) as f64;
                let sy = (y + shift.1) as f64;
                let v = 30000.0 + 15000.0 * (sx * 0.35).sin() * (sy * 0.25).cos();
                p.set_pixel(x, y, v as u16);
            }
        }
        p
    }

    #[test]
    fn test_finds_known_translation() {
        let base = test_pattern(48, 48, (0, 0));
        let moved = test_pattern(48, 48, (3, 2));
        // moved's origin shows the scene point (3, 2), so it matches base
        // when placed at (3, 2)
        let mut search = GradientSearch::new(&base, &moved, None, None, DiffSettings::default());
        let area = SearchArea::from_sizes((48, 48), (48, 48), (0.2, 0.2), Point::default(), 2);
        let result = search.find_minimum(area).unwrap();
        assert_eq!(result.distance, Point::new(3.0, 2.0));
        assert_eq!(result.error, 0.0);
    }

    #[test]
    fn test_cache_fills_during_search() {
        let base = test_pattern(32, 32, (0, 0));
        let mut search = GradientSearch::new(&base, &base, None, None, DiffSettings::default());
        let area = SearchArea::from_sizes((32, 32), (32, 32), (0.3, 0.3), Point::default(), 1);
        search.find_minimum(area).unwrap();
        assert!(search.cache_len() > 0);
    }

    #[test]
    fn test_hint_biases_search_window() {
        let area = SearchArea::from_sizes((100, 100), (100, 100), (0.1, 0.1), Point::new(5.0, -3.0), 1);
        assert!(area.left <= -4 && area.right >= 14);
        assert!(area.top <= -12 && area.bottom >= 6);
    }

    #[test]
    fn test_empty_area_is_error() {
        let base = test_pattern(16, 16, (0, 0));
        let mut search = GradientSearch::new(&base, &base, None, None, DiffSettings::default());
        let area = SearchArea { left: 5, right: 2, top: 0, bottom: 0, level: 1 };
        assert!(search.find_minimum(area).is_err());
    }
}
