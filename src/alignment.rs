use anyhow::{bail, ensure, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::comparator::AlignMethod;
use crate::container::Container;
use crate::geometry::Point;
use crate::plane::{Color, Plane};
use crate::progress::Progress;
use crate::stacking::{MergeRenderer, SumPlane};

/// Strategy for turning pairwise offsets into one position per image.
///
/// Every strategy either completes and writes a consistent position (or
/// frame id) for all images, or fails without touching the container.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Aligner {
    /// Chain alignment: each image is matched against the running average of
    /// everything placed so far, or against its predecessor when
    /// `use_average` is off.
    Average { use_average: bool },
    /// Divide and conquer: align halves independently, then align the two
    /// half-renders against each other.
    Recursive,
    /// Group near-identical images into frames by pairwise error.
    Cluster { min_groups: usize, max_groups: usize },
    /// Place each image against its lowest-error predecessor within a
    /// window of `range` neighbors.
    Independent { range: usize },
    /// Replace positions with a per-axis least-squares fit over the image
    /// index, smoothing constant-velocity pans.
    Linear { method: AlignMethod },
    /// Assign cyclic frame ids from the sequence index alone.
    FrameCalculator { offset: i64, amount: i64, repeats: i64 },
    /// Re-align every image against an upscaled render of the current stack.
    SuperRes { scale: f64, iterations: usize },
}

impl Aligner {
    pub fn align(&self, container: &mut Container, progress: &mut Progress) -> Result<()> {
        match *self {
            Aligner::Average { use_average } => align_average(container, use_average, progress),
            Aligner::Recursive => align_recursive(container, progress),
            Aligner::Cluster { min_groups, max_groups } => {
                align_cluster(container, min_groups, max_groups, progress)
            }
            Aligner::Independent { range } => align_independent(container, range, progress),
            Aligner::Linear { method } => align_linear(container, method),
            Aligner::FrameCalculator { offset, amount, repeats } => {
                align_frame_calculator(container, offset, amount, repeats)
            }
            Aligner::SuperRes { scale, iterations } => {
                align_super_res(container, scale, iterations, progress)
            }
        }
    }
}

fn align_average(container: &mut Container, use_average: bool, progress: &mut Progress) -> Result<()> {
    let count = container.count();
    if count <= 1 {
        return Ok(());
    }
    progress.set_total(count);

    let mut positions = vec![Point::new(0.0, 0.0); count];
    let mut render = SumPlane::new();
    render.add_alpha_plane(container.plane(0), container.alpha(0), 0, 0);

    for i in 1..count {
        progress.check_cancelled()?;
        progress.set_current(i);
        progress.report("Aligning image");

        let offset = if use_average {
            let base = render.average();
            let base_alpha = render.alpha();
            container.comparator().find_offset(
                &base,
                container.plane(i),
                Some(&base_alpha),
                container.alpha(i),
                Point::new(0.0, 0.0),
            )?
        } else {
            container.comparator().find_offset(
                container.plane(i - 1),
                container.plane(i),
                container.alpha(i - 1),
                container.alpha(i),
                Point::new(0.0, 0.0),
            )?
        };

        // The running render's origin is the reference frame of the match.
        positions[i] = if use_average {
            render.origin() + offset.distance
        } else {
            positions[i - 1] + offset.distance
        };
        debug!("image {} placed at ({:.1}, {:.1})", i, positions[i].x, positions[i].y);
        render.add_alpha_plane(
            container.plane(i),
            container.alpha(i),
            positions[i].x.round() as i32,
            positions[i].y.round() as i32,
        );
    }

    for (i, pos) in positions.into_iter().enumerate() {
        container.set_pos(i, pos);
    }
    Ok(())
}

/// An intermediate image during recursive alignment: either one of the
/// container's images, or a merged render owned by the recursion.
enum ImageSource {
    Index(usize),
    Owned { plane: Plane, alpha: Option<Plane> },
}

impl ImageSource {
    fn plane<'a>(&'a self, container: &'a Container) -> &'a Plane {
        match self {
            ImageSource::Index(i) => container.plane(*i),
            ImageSource::Owned { plane, .. } => plane,
        }
    }

    fn alpha<'a>(&'a self, container: &'a Container) -> Option<&'a Plane> {
        match self {
            ImageSource::Index(i) => container.alpha(*i),
            ImageSource::Owned { alpha, .. } => alpha.as_ref(),
        }
    }
}

fn align_recursive(container: &mut Container, progress: &mut Progress) -> Result<()> {
    let count = container.count();
    if count <= 1 {
        return Ok(());
    }
    progress.set_total(count);

    let mut positions = vec![Point::new(0.0, 0.0); count];
    align_range(container, &mut positions, progress, 0, count)?;

    for (i, pos) in positions.into_iter().enumerate() {
        container.set_pos(i, pos);
    }
    Ok(())
}

fn align_range(
    container: &Container,
    positions: &mut [Point],
    progress: &mut Progress,
    begin: usize,
    end: usize,
) -> Result<ImageSource> {
    match end - begin {
        0 => bail!("empty range in recursive alignment"),
        1 => {
            progress.add(1);
            progress.report("Aligning image");
            Ok(ImageSource::Index(begin))
        }
        2 => {
            let (merged, offset) =
                combine(container, &ImageSource::Index(begin), &ImageSource::Index(begin + 1), progress)?;
            positions[begin + 1] = positions[begin] + offset;
            progress.add(2);
            progress.report("Aligning image pair");
            Ok(merged)
        }
        amount => {
            let middle = begin + amount / 2;
            let first = align_range(container, positions, progress, begin, middle)?;
            let second = align_range(container, positions, progress, middle, end)?;
            let (merged, offset) = combine(container, &first, &second, progress)?;

            let corner1 = top_left(&positions[begin..middle]);
            let corner2 = top_left(&positions[middle..end]);
            for pos in &mut positions[middle..end] {
                *pos = *pos + corner1 + offset - corner2;
            }
            Ok(merged)
        }
    }
}

fn top_left(positions: &[Point]) -> Point {
    let mut corner = Point::new(f64::MAX, f64::MAX);
    for pos in positions {
        corner = corner.min(*pos);
    }
    corner
}

/// Align two intermediates and merge them into one. Alpha-free planes of
/// equal width that only moved vertically merge without a full render.
fn combine(
    container: &Container,
    first: &ImageSource,
    second: &ImageSource,
    progress: &Progress,
) -> Result<(ImageSource, Point)> {
    progress.check_cancelled()?;
    let p1 = first.plane(container);
    let p2 = second.plane(container);
    let a1 = first.alpha(container);
    let a2 = second.alpha(container);

    let offset = container
        .comparator()
        .find_offset(p1, p2, a1, a2, Point::new(0.0, 0.0))?
        .distance;

    if offset.x == 0.0 && a1.is_none() && a2.is_none() && p1.width() == p2.width() {
        let merged = merge_vertical(p1, p2, offset.y.round() as i32);
        Ok((ImageSource::Owned { plane: merged, alpha: None }, offset))
    } else {
        let mut sum = SumPlane::new();
        sum.add_alpha_plane(p1, a1, 0, 0);
        sum.add_alpha_plane(p2, a2, offset.x.round() as i32, offset.y.round() as i32);
        let merged = ImageSource::Owned { plane: sum.average(), alpha: Some(sum.alpha()) };
        Ok((merged, offset))
    }
}

/// Merge two equal-width planes that are only displaced vertically: copy the
/// exclusive parts, average the shared middle.
fn merge_vertical(p1: &Plane, p2: &Plane, offset: i32) -> Plane {
    let (top, bottom) = if offset < 0 { (p2, p1) } else { (p1, p2) };
    let offset = offset.unsigned_abs() as usize;
    let height = top.height().max(bottom.height() + offset);
    let width = p1.width();

    let mut out = Plane::new(width, height);
    for iy in 0..offset.min(top.height()) {
        out.row_mut(iy).copy_from_slice(top.row(iy));
    }

    let shared = top.height().saturating_sub(offset).min(bottom.height());
    for iy in 0..shared {
        let t = top.row(iy + offset);
        let b = bottom.row(iy);
        let o = out.row_mut(iy + offset);
        for ix in 0..width {
            o[ix] = ((t[ix] as u32 + b[ix] as u32) / 2) as Color;
        }
    }

    if top.height() > bottom.height() + offset {
        for iy in offset + shared..height {
            out.row_mut(iy).copy_from_slice(top.row(iy));
        }
    } else {
        for iy in shared..bottom.height() {
            out.row_mut(iy + offset).copy_from_slice(bottom.row(iy));
        }
    }
    out
}

/// Work table for greedy cluster assignment: `assignment[image]` is the
/// cluster id, -1 while undecided.
struct Clusters {
    assignment: Vec<i32>,
    amount: usize,
}

impl Clusters {
    fn new(count: usize, amount: usize) -> Self {
        Self { assignment: vec![-1; count], amount }
    }

    fn members(&self, cluster: i32) -> usize {
        self.assignment.iter().filter(|&&c| c == cluster).count()
    }

    /// Greedily grow clusters along the lowest-error pairwise edges until
    /// every image belongs somewhere.
    fn assign(&mut self, container: &Container) -> Result<()> {
        while self.members(-1) > 0 {
            // A cluster with no members yet claims the next free image.
            if let Some(empty) = (0..self.amount).find(|&id| self.members(id as i32) == 0) {
                if let Some(free) = self.assignment.iter().position(|&c| c == -1) {
                    self.assignment[free] = empty as i32;
                    continue;
                }
            }

            // Cheapest edge from inside a cluster to an image outside it.
            let mut best_error = f64::MAX;
            let mut best_cluster = -1;
            let mut best_image = 0;
            for from in 0..self.assignment.len() {
                let cluster = self.assignment[from];
                if cluster == -1 {
                    continue;
                }
                for to in 0..self.assignment.len() {
                    if self.assignment[to] == cluster {
                        continue;
                    }
                    let offset = container.cached_offset(from, to)?;
                    if offset.error < best_error {
                        best_error = offset.error;
                        best_cluster = cluster;
                        best_image = to;
                    }
                }
            }
            ensure!(best_cluster != -1, "no connecting edge found during clustering");

            if self.assignment[best_image] == -1 {
                self.assignment[best_image] = best_cluster;
            } else {
                // The edge joins two clusters; merge them.
                let into = self.assignment[best_image];
                for cluster in &mut self.assignment {
                    if *cluster == best_cluster {
                        *cluster = into;
                    }
                }
            }
        }
        Ok(())
    }

    /// Mean cached error between images sharing a cluster. Lower is tighter.
    fn score(&self, container: &Container) -> Result<f64> {
        let mut sum = 0.0;
        let mut edges = 0;
        for i in 0..self.assignment.len() {
            for j in i + 1..self.assignment.len() {
                if self.assignment[i] == self.assignment[j] {
                    sum += container.cached_offset(i, j)?.error;
                    edges += 1;
                }
            }
        }
        Ok(if edges > 0 { sum / edges as f64 } else { 0.0 })
    }

    /// Frame ids in order of first appearance, so the result is stable no
    /// matter how the cluster ids got shuffled while merging.
    fn frames(&self) -> Vec<i32> {
        let mut frame_ids = vec![-1; self.assignment.len().max(self.amount)];
        let mut found = 0;
        let mut frames = Vec::with_capacity(self.assignment.len());
        for &cluster in &self.assignment {
            let id = &mut frame_ids[cluster as usize];
            if *id == -1 {
                *id = found;
                found += 1;
            }
            frames.push(*id);
        }
        frames
    }
}

fn align_cluster(
    container: &mut Container,
    min_groups: usize,
    max_groups: usize,
    progress: &mut Progress,
) -> Result<()> {
    let count = container.count();
    if count == 0 {
        return Ok(());
    }
    ensure!(min_groups >= 1, "cluster count must be at least 1");
    ensure!(min_groups <= max_groups, "min_groups must not exceed max_groups");
    let min_groups = min_groups.min(count);
    let max_groups = max_groups.min(count);

    progress.set_total(count * count + max_groups - min_groups + 1);
    for i in 0..count {
        for j in 0..count {
            if i != j {
                container.find_offset(i, j)?;
            }
            progress.add(1);
        }
        progress.check_cancelled()?;
        progress.report("Computing pairwise offsets");
    }

    // Try every group count in range and keep the tightest clustering.
    let mut best: Option<(f64, Clusters)> = None;
    for groups in min_groups..=max_groups {
        progress.check_cancelled()?;
        let mut clusters = Clusters::new(count, groups);
        clusters.assign(container)?;
        let score = clusters.score(container)?;
        debug!("{} groups score {:.3}", groups, score);
        if best.as_ref().map(|(s, _)| score < *s).unwrap_or(true) {
            best = Some((score, clusters));
        }
        progress.add(1);
        progress.report("Evaluating group counts");
    }

    let (_, clusters) = match best {
        Some(best) => best,
        None => bail!("no clustering evaluated"),
    };
    for (i, frame) in clusters.frames().into_iter().enumerate() {
        container.set_frame(i, frame);
    }
    Ok(())
}

fn align_independent(container: &mut Container, range: usize, progress: &mut Progress) -> Result<()> {
    let count = container.count();
    if count <= 1 {
        return Ok(());
    }
    ensure!(range >= 1, "neighbor range must be at least 1");
    progress.set_total(count * range);

    for i in 0..count {
        for j in i + 1..=(i + range).min(count - 1) {
            container.find_offset(i, j)?;
            progress.add(1);
        }
        progress.check_cancelled()?;
        progress.report("Computing neighbor offsets");
    }

    // Place each image relative to its best-matching predecessor.
    let mut offsets = vec![Point::new(0.0, 0.0); count];
    for i in 0..count {
        let mut error = f64::MAX;
        let mut best = Point::new(0.0, 0.0);
        for j in 0..i {
            if container.has_cached_offset(i, j) {
                let offset = container.cached_offset(i, j)?;
                if offset.error < error {
                    error = offset.error;
                    // The cached offset places j relative to i.
                    best = offsets[j] - offset.distance;
                }
            }
        }
        offsets[i] = best;
    }

    for (i, offset) in offsets.into_iter().enumerate() {
        container.set_pos(i, offset.round());
    }
    Ok(())
}

/// Least-squares line through `(x, y)` samples.
#[derive(Default)]
struct LinearFunc {
    x1: f64,
    x2: f64,
    xy: f64,
    y1: f64,
    n: usize,
}

impl LinearFunc {
    fn add(&mut self, x: f64, y: f64) {
        self.x1 += x;
        self.x2 += x * x;
        self.xy += x * y;
        self.y1 += y;
        self.n += 1;
    }

    fn deviation(&self) -> f64 {
        self.n as f64 * self.x2 - self.x1 * self.x1
    }

    fn slope(&self) -> f64 {
        (self.n as f64 * self.xy - self.x1 * self.y1) / self.deviation()
    }

    fn intercept(&self) -> f64 {
        (self.x2 * self.y1 - self.x1 * self.xy) / self.deviation()
    }

    fn at(&self, x: f64) -> f64 {
        self.slope() * x + self.intercept()
    }
}

fn align_linear(container: &mut Container, method: AlignMethod) -> Result<()> {
    let count = container.count();
    if count < 2 {
        debug!("not enough images for a linear fit, positions unchanged");
        return Ok(());
    }

    let mut hor = LinearFunc::default();
    let mut ver = LinearFunc::default();
    for i in 0..count {
        let pos = container.pos(i);
        hor.add(i as f64, pos.x);
        ver.add(i as f64, pos.y);
    }

    for i in 0..count {
        let x = i as f64;
        let pos = match method {
            AlignMethod::Both => Point::new(hor.at(x), ver.at(x)),
            AlignMethod::Ver => Point::new(0.0, ver.at(x)),
            AlignMethod::Hor => Point::new(hor.at(x), 0.0),
        };
        container.set_pos(i, pos);
    }
    Ok(())
}

fn align_frame_calculator(
    container: &mut Container,
    offset: i64,
    amount: i64,
    repeats: i64,
) -> Result<()> {
    ensure!(amount >= 1 && repeats >= 1, "no frames would be generated");
    let frames_per_cycle = amount * repeats;
    ensure!(
        offset >= 0 && offset <= frames_per_cycle,
        "frame offset {} outside cycle of {} frames",
        offset,
        frames_per_cycle
    );

    for i in 0..container.count() {
        let frame = ((i as i64 + frames_per_cycle - offset) / repeats) % amount;
        container.set_frame(i, frame as i32);
    }
    Ok(())
}

fn align_super_res(
    container: &mut Container,
    scale: f64,
    iterations: usize,
    progress: &mut Progress,
) -> Result<()> {
    let count = container.count();
    if count <= 1 {
        return Ok(());
    }
    ensure!(scale >= 1.0, "super-resolution scale must be at least 1");
    progress.set_total(iterations * count);

    for iteration in 0..iterations {
        info!("super-resolution pass {}/{}", iteration + 1, iterations);
        let base = MergeRenderer::default()
            .render(container, None, &mut Progress::none())?
            .scaled(scale);
        let origin = container.min_point();

        let mut positions = Vec::with_capacity(count);
        for i in 0..count {
            progress.check_cancelled()?;
            let img = container.image(i).scaled(scale);
            let offset = container.comparator().find_offset(
                base.plane(0),
                img.plane(0),
                base.alpha(),
                img.alpha(),
                Point::new(0.0, 0.0),
            )?;
            positions.push(origin + offset.distance * (1.0 / scale));
            progress.add(1);
            progress.report("Refining against render");
        }

        for (i, pos) in positions.into_iter().enumerate() {
            container.set_pos(i, pos);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::Comparator;
    use crate::difference::DiffSettings;
    use crate::image_ex::ImageEx;

    fn test_image(shift: (usize, usize)) -> ImageEx {
        let mut p = Plane::new(24, 24);
        for y in 0..24 {
            for x in 0..24 {
                let sx = (x + shift.0) as f64;
                let sy = (y + shift.1) as f64;
                let v = 2000.0 + 800.0 * sx + 400.0 * sy
                    + 2000.0 * (sx * 0.4).sin() * (sy * 0.3).cos();
                p.set_pixel(x, y, v as u16);
            }
        }
        ImageEx::new_gray(p)
    }

    fn brute_force_container(shifts: &[(usize, usize)]) -> Container {
        let comparator = Comparator::BruteForce {
            method: AlignMethod::Both,
            movement: 0.3,
            settings: DiffSettings::default(),
        };
        let mut container = Container::new(comparator);
        for &shift in shifts {
            container.add_image(test_image(shift));
        }
        container
    }

    fn assert_pos(container: &Container, index: usize, x: f64, y: f64) {
        let pos = container.pos(index) - container.pos(0);
        assert_eq!(pos.x, x, "x of image {}", index);
        assert_eq!(pos.y, y, "y of image {}", index);
    }

    #[test]
    fn test_average_aligner_chains_offsets() {
        let mut container = brute_force_container(&[(0, 0), (2, 1), (4, 2)]);
        Aligner::Average { use_average: true }
            .align(&mut container, &mut Progress::none())
            .unwrap();
        assert_pos(&container, 1, 2.0, 1.0);
        assert_pos(&container, 2, 4.0, 2.0);
    }

    #[test]
    fn test_average_aligner_cheap_mode() {
        let mut container = brute_force_container(&[(0, 0), (2, 1), (4, 2)]);
        Aligner::Average { use_average: false }
            .align(&mut container, &mut Progress::none())
            .unwrap();
        assert_pos(&container, 1, 2.0, 1.0);
        assert_pos(&container, 2, 4.0, 2.0);
    }

    #[test]
    fn test_recursive_aligner_composes_halves() {
        let mut container = brute_force_container(&[(0, 0), (2, 1), (4, 2), (6, 3)]);
        Aligner::Recursive.align(&mut container, &mut Progress::none()).unwrap();
        assert_pos(&container, 1, 2.0, 1.0);
        assert_pos(&container, 2, 4.0, 2.0);
        assert_pos(&container, 3, 6.0, 3.0);
    }

    #[test]
    fn test_independent_aligner_uses_best_predecessor() {
        let mut container = brute_force_container(&[(0, 0), (2, 1), (4, 2)]);
        Aligner::Independent { range: 2 }
            .align(&mut container, &mut Progress::none())
            .unwrap();
        assert_pos(&container, 1, 2.0, 1.0);
        assert_pos(&container, 2, 4.0, 2.0);
    }

    #[test]
    fn test_merge_vertical_averages_shared_rows() {
        let mut p1 = Plane::new(2, 3);
        p1.fill(100);
        let mut p2 = Plane::new(2, 3);
        p2.fill(300);

        let merged = merge_vertical(&p1, &p2, 1);
        assert_eq!(merged.size(), (2, 4));
        assert_eq!(merged.pixel(0, 0), 100);
        assert_eq!(merged.pixel(0, 1), 200);
        assert_eq!(merged.pixel(0, 2), 200);
        assert_eq!(merged.pixel(0, 3), 300);
    }

    #[test]
    fn test_cluster_aligner_groups_by_similarity() {
        let inverted = |shift: (usize, usize)| {
            let base = test_image(shift);
            let mut p = Plane::new(24, 24);
            for y in 0..24 {
                for x in 0..24 {
                    p.set_pixel(x, y, u16::MAX - base.plane(0).pixel(x, y));
                }
            }
            ImageEx::new_gray(p)
        };

        let mut container = brute_force_container(&[(0, 0), (0, 0)]);
        container.add_image(inverted((0, 0)));
        container.add_image(inverted((0, 0)));

        Aligner::Cluster { min_groups: 2, max_groups: 2 }
            .align(&mut container, &mut Progress::none())
            .unwrap();
        assert_eq!(container.frame(0), container.frame(1));
        assert_eq!(container.frame(2), container.frame(3));
        assert_ne!(container.frame(0), container.frame(2));
        assert_eq!(container.get_frames().len(), 2);
    }

    #[test]
    fn test_linear_aligner_fits_drift() {
        let mut container = brute_force_container(&[(0, 0); 4]);
        let samples = [(0.0, 0.0), (1.0, 2.0), (2.0, 3.9), (3.0, 6.1)];
        for (i, &(x, y)) in samples.iter().enumerate() {
            container.set_pos(i, Point::new(x, y));
        }

        Aligner::Linear { method: AlignMethod::Both }
            .align(&mut container, &mut Progress::none())
            .unwrap();
        let mut previous = f64::MIN;
        for i in 0..4 {
            let pos = container.pos(i);
            assert!((pos.y - 2.0 * i as f64).abs() < 0.2, "fit off at {}: {}", i, pos.y);
            assert!(pos.y > previous);
            previous = pos.y;
        }
    }

    #[test]
    fn test_frame_calculator_cycles() {
        let mut container = brute_force_container(&[(0, 0); 8]);
        Aligner::FrameCalculator { offset: 0, amount: 3, repeats: 2 }
            .align(&mut container, &mut Progress::none())
            .unwrap();
        let frames: Vec<i32> = (0..8).map(|i| container.frame(i)).collect();
        assert_eq!(frames, vec![0, 0, 1, 1, 2, 2, 0, 0]);

        Aligner::FrameCalculator { offset: 1, amount: 3, repeats: 2 }
            .align(&mut container, &mut Progress::none())
            .unwrap();
        let shifted: Vec<i32> = (0..8).map(|i| container.frame(i)).collect();
        assert_eq!(shifted, vec![2, 0, 0, 1, 1, 2, 2, 0]);
    }

    #[test]
    fn test_frame_calculator_rejects_bad_arguments() {
        let mut container = brute_force_container(&[(0, 0); 2]);
        let mut progress = Progress::none();
        assert!(Aligner::FrameCalculator { offset: 0, amount: 0, repeats: 1 }
            .align(&mut container, &mut progress)
            .is_err());
        assert!(Aligner::FrameCalculator { offset: 0, amount: 3, repeats: -1 }
            .align(&mut container, &mut progress)
            .is_err());
        assert!(Aligner::FrameCalculator { offset: 7, amount: 3, repeats: 2 }
            .align(&mut container, &mut progress)
            .is_err());
        // Failed validation must leave frames untouched.
        assert_eq!(container.frame(0), -1);
    }

    #[test]
    fn test_super_res_keeps_aligned_stack_in_place() {
        let mut container = brute_force_container(&[(0, 0), (0, 0)]);
        Aligner::SuperRes { scale: 2.0, iterations: 1 }
            .align(&mut container, &mut Progress::none())
            .unwrap();
        assert_pos(&container, 1, 0.0, 0.0);
    }
}
