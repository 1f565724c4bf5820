use std::collections::HashMap;

use anyhow::{bail, Result};
use log::warn;

use crate::comparator::{Comparator, ImageOffset};
use crate::geometry::{Point, Rect};
use crate::image_ex::ImageEx;
use crate::plane::Plane;

/// Owns the images under alignment, their working positions and frame ids,
/// the active comparator, and a cache of pairwise offsets. Aligners go
/// through this instead of touching pixel data directly.
///
/// Image indices are trusted: passing an index at or past `count()` panics,
/// as that is a caller bug rather than a runtime condition.
pub struct Container {
    images: Vec<ImageEx>,
    positions: Vec<Point>,
    frames: Vec<i32>,
    comparator: Comparator,
    offset_cache: HashMap<(usize, usize), ImageOffset>,
}

impl Container {
    pub fn new(comparator: Comparator) -> Self {
        Self {
            images: Vec::new(),
            positions: Vec::new(),
            frames: Vec::new(),
            comparator,
            offset_cache: HashMap::new(),
        }
    }

    pub fn add_image(&mut self, image: ImageEx) {
        self.images.push(image);
        self.positions.push(Point::new(0.0, 0.0));
        self.frames.push(-1);
    }

    pub fn count(&self) -> usize {
        self.images.len()
    }

    pub fn image(&self, index: usize) -> &ImageEx {
        &self.images[index]
    }

    /// Luma plane, the one alignment operates on.
    pub fn plane(&self, index: usize) -> &Plane {
        self.images[index].plane(0)
    }

    pub fn alpha(&self, index: usize) -> Option<&Plane> {
        self.images[index].alpha()
    }

    pub fn pos(&self, index: usize) -> Point {
        self.positions[index]
    }

    pub fn set_pos(&mut self, index: usize, pos: Point) {
        self.positions[index] = pos;
    }

    /// Frame group id, or -1 when ungrouped.
    pub fn frame(&self, index: usize) -> i32 {
        self.frames[index]
    }

    pub fn set_frame(&mut self, index: usize, frame: i32) {
        self.frames[index] = frame;
    }

    pub fn comparator(&self) -> &Comparator {
        &self.comparator
    }

    pub fn reset_position(&mut self) {
        for pos in &mut self.positions {
            *pos = Point::new(0.0, 0.0);
        }
    }

    pub fn offset_all(&mut self, dx: f64, dy: f64) {
        for pos in &mut self.positions {
            *pos = *pos + Point::new(dx, dy);
        }
    }

    pub fn min_point(&self) -> Point {
        let mut min = match self.positions.first() {
            Some(first) => *first,
            None => return Point::new(0.0, 0.0),
        };
        for pos in &self.positions {
            min = min.min(*pos);
        }
        min
    }

    /// Bounding rectangle of all images at their current positions, rounded
    /// outwards to whole pixels.
    pub fn size(&self) -> Rect {
        let mut total: Option<Rect> = None;
        for (index, pos) in self.positions.iter().enumerate() {
            let plane = self.plane(index);
            let rect = Rect::new(pos.x, pos.y, plane.width() as f64, plane.height() as f64);
            total = Some(match total {
                Some(t) => t.united(&rect),
                None => rect,
            });
        }
        let total = total.unwrap_or_default();
        let left = total.x.floor();
        let top = total.y.floor();
        Rect::new(left, top, total.right().ceil() - left, total.bottom().ceil() - top)
    }

    /// Distinct frame ids in first-seen order, or `[-1]` when no image has
    /// been assigned one.
    pub fn get_frames(&self) -> Vec<i32> {
        let mut frames = Vec::new();
        for &frame in &self.frames {
            if frame >= 0 && !frames.contains(&frame) {
                frames.push(frame);
            }
        }
        if frames.is_empty() {
            frames.push(-1);
        }
        frames
    }

    /// Offset between images `i` and `j`, searching with the comparator on a
    /// cache miss. Cached results are shared between both orderings of the
    /// pair. A fresh search is seeded with the neighboring pair's cached
    /// offset when one exists; no extra search is triggered for the hint.
    pub fn find_offset(&mut self, i: usize, j: usize) -> Result<ImageOffset> {
        assert!(i < self.count() && j < self.count(), "image index out of range");
        if i == j {
            warn!("offset of image {} against itself requested", i);
            return Ok(ImageOffset::new(Point::new(0.0, 0.0), 0.0, 1.0));
        }
        if let Some(cached) = self.cached_offset_opt(i, j) {
            return Ok(cached);
        }

        let neighbor = if i < j { j - 1 } else { j + 1 };
        let hint = if neighbor != i && neighbor < self.count() {
            self.cached_offset_opt(i, neighbor)
                .map(|offset| offset.distance)
                .unwrap_or(Point::new(0.0, 0.0))
        } else {
            Point::new(0.0, 0.0)
        };

        let offset = self.comparator.find_offset(
            self.plane(i),
            self.plane(j),
            self.alpha(i),
            self.alpha(j),
            hint,
        )?;
        self.set_cached_offset(i, j, offset);
        Ok(offset)
    }

    /// Metric error between `i` and `j` at the offset implied by their
    /// current positions. No search, no cache write.
    pub fn find_error(&mut self, i: usize, j: usize) -> Result<f64> {
        let delta = self.pos(j) - self.pos(i);
        self.comparator.find_error(
            self.plane(i),
            self.plane(j),
            self.alpha(i),
            self.alpha(j),
            delta.x,
            delta.y,
        )
    }

    pub fn has_cached_offset(&self, i: usize, j: usize) -> bool {
        self.offset_cache.contains_key(&Self::pair_key(i, j))
    }

    /// Previously stored offset for the pair. Asking for a pair that was
    /// never computed is a caller bug, reported as an error.
    pub fn cached_offset(&self, i: usize, j: usize) -> Result<ImageOffset> {
        match self.cached_offset_opt(i, j) {
            Some(offset) => Ok(offset),
            None => bail!("no cached offset for image pair ({}, {})", i, j),
        }
    }

    /// Stored oriented low-to-high index; reads reverse as needed.
    pub fn set_cached_offset(&mut self, i: usize, j: usize, offset: ImageOffset) {
        let stored = if i <= j { offset } else { offset.reverse() };
        self.offset_cache.insert(Self::pair_key(i, j), stored);
    }

    fn cached_offset_opt(&self, i: usize, j: usize) -> Option<ImageOffset> {
        self.offset_cache
            .get(&Self::pair_key(i, j))
            .map(|&stored| if i <= j { stored } else { stored.reverse() })
    }

    fn pair_key(i: usize, j: usize) -> (usize, usize) {
        (i.min(j), i.max(j))
    }
}
