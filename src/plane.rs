use rayon::prelude::*;

/// Fixed-point color sample. The full u16 range maps to [0.0, 1.0].
pub type Color = u16;

pub const WHITE: Color = u16::MAX;
pub const BLACK: Color = 0;

/// Alpha values at or above this count as opaque for masking purposes.
pub const ALPHA_THRESHOLD: Color = WHITE / 2 + 1;

pub fn as_double(value: Color) -> f64 {
    value as f64 / WHITE as f64
}

pub fn from_double(value: f64) -> Color {
    (value.clamp(0.0, 1.0) * WHITE as f64).round() as Color
}

/// Single-channel 2-D pixel buffer with 16-bit fixed-point samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Plane {
    width: usize,
    height: usize,
    data: Vec<Color>,
}

impl Plane {
    /// New plane filled with black.
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height, data: vec![BLACK; width * height] }
    }

    /// Wrap existing sample data. The buffer length must be width * height.
    pub fn from_data(width: usize, height: usize, data: Vec<Color>) -> Self {
        assert_eq!(data.len(), width * height, "plane buffer size mismatch");
        Self { width, height, data }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn size(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn data(&self) -> &[Color] {
        &self.data
    }

    pub fn into_data(self) -> Vec<Color> {
        self.data
    }

    pub fn row(&self, y: usize) -> &[Color] {
        &self.data[y * self.width..(y + 1) * self.width]
    }

    pub fn row_mut(&mut self, y: usize) -> &mut [Color] {
        &mut self.data[y * self.width..(y + 1) * self.width]
    }

    pub fn pixel(&self, x: usize, y: usize) -> Color {
        self.data[y * self.width + x]
    }

    pub fn set_pixel(&mut self, x: usize, y: usize, value: Color) {
        self.data[y * self.width + x] = value;
    }

    pub fn fill(&mut self, value: Color) {
        self.data.fill(value);
    }

    /// Halve the resolution by averaging 2x2 blocks. Returns `None` when the
    /// plane is too small to halve.
    pub fn downscale_half(&self) -> Option<Plane> {
        if self.width < 2 || self.height < 2 {
            return None;
        }
        let (w, h) = (self.width / 2, self.height / 2);
        let mut out = Plane::new(w, h);
        for y in 0..h {
            let top = self.row(y * 2);
            let bottom = self.row(y * 2 + 1);
            let row = out.row_mut(y);
            for x in 0..w {
                let sum = top[x * 2] as u32
                    + top[x * 2 + 1] as u32
                    + bottom[x * 2] as u32
                    + bottom[x * 2 + 1] as u32;
                row[x] = (sum / 4) as Color;
            }
        }
        Some(out)
    }

    /// Resample to the requested size with a Catmull-Rom cubic filter.
    pub fn scale_cubic(&self, new_width: usize, new_height: usize) -> Plane {
        if new_width == self.width && new_height == self.height {
            return self.clone();
        }
        if new_width == 0 || new_height == 0 || self.is_empty() {
            return Plane::new(new_width, new_height);
        }

        let scale_x = self.width as f64 / new_width as f64;
        let scale_y = self.height as f64 / new_height as f64;

        let mut data = vec![BLACK; new_width * new_height];
        data.par_chunks_mut(new_width).enumerate().for_each(|(y, row)| {
            let sy = (y as f64 + 0.5) * scale_y - 0.5;
            let iy = sy.floor() as isize;
            let fy = sy - sy.floor();
            let wy = catmull_rom_weights(fy);
            for (x, out) in row.iter_mut().enumerate() {
                let sx = (x as f64 + 0.5) * scale_x - 0.5;
                let ix = sx.floor() as isize;
                let fx = sx - sx.floor();
                let wx = catmull_rom_weights(fx);

                let mut sum = 0.0;
                for (dy, weight_y) in wy.iter().enumerate() {
                    let src_y = clamp_index(iy + dy as isize - 1, self.height);
                    let line = self.row(src_y);
                    let mut line_sum = 0.0;
                    for (dx, weight_x) in wx.iter().enumerate() {
                        let src_x = clamp_index(ix + dx as isize - 1, self.width);
                        line_sum += line[src_x] as f64 * weight_x;
                    }
                    sum += line_sum * weight_y;
                }
                *out = sum.clamp(0.0, WHITE as f64).round() as Color;
            }
        });

        Plane { width: new_width, height: new_height, data }
    }
}

fn clamp_index(index: isize, len: usize) -> usize {
    index.clamp(0, len as isize - 1) as usize
}

/// Catmull-Rom weights for the 4 taps around a sample at fraction `t`.
fn catmull_rom_weights(t: f64) -> [f64; 4] {
    let t2 = t * t;
    let t3 = t2 * t;
    [
        0.5 * (-t3 + 2.0 * t2 - t),
        0.5 * (3.0 * t3 - 5.0 * t2 + 2.0),
        0.5 * (-3.0 * t3 + 4.0 * t2 + t),
        0.5 * (t3 - t2),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_invariant() {
        let p = Plane::new(7, 3);
        assert_eq!(p.row(2).len(), 7);
        assert_eq!(p.size(), (7, 3));
    }

    #[test]
    fn test_downscale_half_averages_blocks() {
        let p = Plane::from_data(2, 2, vec![0, 100, 200, 300]);
        let half = p.downscale_half().unwrap();
        assert_eq!(half.size(), (1, 1));
        assert_eq!(half.pixel(0, 0), 150);
    }

    #[test]
    fn test_downscale_half_too_small() {
        assert!(Plane::new(1, 5).downscale_half().is_none());
    }

    #[test]
    fn test_scale_cubic_preserves_flat_regions() {
        let mut p = Plane::new(8, 8);
        p.fill(20000);
        let scaled = p.scale_cubic(16, 16);
        assert_eq!(scaled.size(), (16, 16));
        for y in 0..16 {
            for x in 0..16 {
                assert_eq!(scaled.pixel(x, y), 20000);
            }
        }
    }

    #[test]
    fn test_scale_cubic_identity() {
        let p = Plane::from_data(2, 2, vec![1, 2, 3, 4]);
        assert_eq!(p.scale_cubic(2, 2), p);
    }
}
