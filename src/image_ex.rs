use crate::plane::Plane;

/// Color layout of an image's planes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorSystem {
    Gray,
    Rgb,
}

/// Multi-plane color image: 1 (gray) or 3 (RGB) pixel planes plus an optional
/// alpha plane. Chroma planes may be stored at a lower resolution than the
/// first plane; consumers rescale them relative to plane 0.
#[derive(Debug, Clone)]
pub struct ImageEx {
    system: ColorSystem,
    planes: Vec<Plane>,
    alpha: Option<Plane>,
}

impl ImageEx {
    pub fn new_gray(plane: Plane) -> Self {
        Self { system: ColorSystem::Gray, planes: vec![plane], alpha: None }
    }

    pub fn new_rgb(planes: [Plane; 3]) -> Self {
        Self { system: ColorSystem::Rgb, planes: planes.into(), alpha: None }
    }

    /// Sentinel for "nothing rendered" results.
    pub fn empty() -> Self {
        Self { system: ColorSystem::Gray, planes: Vec::new(), alpha: None }
    }

    pub fn with_alpha(mut self, alpha: Plane) -> Self {
        self.alpha = Some(alpha);
        self
    }

    pub fn set_alpha(&mut self, alpha: Option<Plane>) {
        self.alpha = alpha;
    }

    pub fn system(&self) -> ColorSystem {
        self.system
    }

    pub fn is_empty(&self) -> bool {
        self.planes.is_empty()
    }

    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    pub fn plane(&self, index: usize) -> &Plane {
        &self.planes[index]
    }

    pub fn plane_mut(&mut self, index: usize) -> &mut Plane {
        &mut self.planes[index]
    }

    pub fn alpha(&self) -> Option<&Plane> {
        self.alpha.as_ref()
    }

    /// Size of the reference plane (plane 0).
    pub fn size(&self) -> (usize, usize) {
        self.planes[0].size()
    }

    /// Cubic-rescale every plane (and alpha) by `factor`.
    pub fn scaled(&self, factor: f64) -> ImageEx {
        let scale = |p: &Plane| {
            p.scale_cubic(
                (p.width() as f64 * factor).round() as usize,
                (p.height() as f64 * factor).round() as usize,
            )
        };
        ImageEx {
            system: self.system,
            planes: self.planes.iter().map(scale).collect(),
            alpha: self.alpha.as_ref().map(scale),
        }
    }
}
