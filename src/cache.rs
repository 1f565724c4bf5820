/// Memoized metric evaluation at an integer offset. `precision` records the
/// sampling coarseness the value was computed at (1.0 = every pixel).
#[derive(Debug, Clone, Copy)]
struct Cached {
    x: i32,
    y: i32,
    diff: f64,
    precision: f64,
}

/// Per-comparison memo of difference evaluations, so refinement rounds do not
/// recompute offsets they already visited. Scoped to a single comparator
/// invocation and never shared across image pairs; growth is unbounded but
/// the candidate count per search is small, so a linear scan suffices.
#[derive(Debug, Default)]
pub struct DiffCache {
    cache: Vec<Cached>,
}

impl DiffCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cached value is only reusable when it was computed at least as
    /// finely as requested. `None` means the caller must compute it.
    pub fn get(&self, x: i32, y: i32, precision: f64) -> Option<f64> {
        self.cache
            .iter()
            .find(|c| c.x == x && c.y == y && c.precision <= precision)
            .map(|c| c.diff)
    }

    pub fn add(&mut self, x: i32, y: i32, diff: f64, precision: f64) {
        self.cache.push(Cached { x, y, diff, precision });
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
