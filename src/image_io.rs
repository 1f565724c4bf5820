use std::path::Path;

use anyhow::{bail, Context, Result};
use image::{DynamicImage, ImageBuffer, Luma, Rgb};

use crate::image_ex::ImageEx;
use crate::plane::{Color, Plane};

/// Load an image from disk into planar 16-bit form, with timing and logging.
pub fn load_image(path: &Path) -> Result<ImageEx> {
    let start = std::time::Instant::now();
    let filename = path.file_name().unwrap_or_default().to_string_lossy();
    log::info!("Loading image: {}", path.display());

    let decoded = image::open(path)
        .with_context(|| format!("failed to load image {}", path.display()))?;
    let (width, height) = (decoded.width() as usize, decoded.height() as usize);

    let result = match decoded {
        DynamicImage::ImageLuma8(_) | DynamicImage::ImageLuma16(_) => {
            let gray = decoded.into_luma16();
            let data = gray.into_raw();
            ImageEx::new_gray(Plane::from_data(width, height, data))
        }
        DynamicImage::ImageLumaA8(_) | DynamicImage::ImageLumaA16(_) => {
            let gray = decoded.into_luma_alpha16();
            let mut luma = Vec::with_capacity(width * height);
            let mut alpha = Vec::with_capacity(width * height);
            for pixel in gray.pixels() {
                luma.push(pixel.0[0]);
                alpha.push(pixel.0[1]);
            }
            ImageEx::new_gray(Plane::from_data(width, height, luma))
                .with_alpha(Plane::from_data(width, height, alpha))
        }
        other => {
            let has_alpha = other.color().has_alpha();
            let rgba = other.into_rgba16();
            let mut r = Vec::with_capacity(width * height);
            let mut g = Vec::with_capacity(width * height);
            let mut b = Vec::with_capacity(width * height);
            let mut a = Vec::with_capacity(width * height);
            for pixel in rgba.pixels() {
                r.push(pixel.0[0]);
                g.push(pixel.0[1]);
                b.push(pixel.0[2]);
                a.push(pixel.0[3]);
            }
            let image = ImageEx::new_rgb([
                Plane::from_data(width, height, r),
                Plane::from_data(width, height, g),
                Plane::from_data(width, height, b),
            ]);
            if has_alpha {
                image.with_alpha(Plane::from_data(width, height, a))
            } else {
                image
            }
        }
    };

    log::info!(
        "Loaded {} in {:?} - Size: {}x{}, Planes: {}",
        filename,
        start.elapsed(),
        width,
        height,
        result.plane_count()
    );
    Ok(result)
}

/// Save as 16-bit PNG. Chroma planes are scaled to luma size when they differ.
pub fn save_image(image: &ImageEx, path: &Path) -> Result<()> {
    if image.is_empty() {
        bail!("cannot save an empty image");
    }
    let start = std::time::Instant::now();
    let (width, height) = image.size();
    log::info!("Saving {}x{} image to {}", width, height, path.display());

    match image.plane_count() {
        1 => {
            let buffer: ImageBuffer<Luma<u16>, Vec<Color>> =
                ImageBuffer::from_raw(width as u32, height as u32, channel(image, 0).into_data())
                    .with_context(|| format!("plane data does not fill {}x{}", width, height))?;
            buffer
                .save(path)
                .with_context(|| format!("failed to save image {}", path.display()))?;
        }
        3 => {
            let r = channel(image, 0);
            let g = channel(image, 1);
            let b = channel(image, 2);
            let mut data = Vec::with_capacity(width * height * 3);
            for i in 0..width * height {
                data.push(r.data()[i]);
                data.push(g.data()[i]);
                data.push(b.data()[i]);
            }
            let buffer: ImageBuffer<Rgb<u16>, Vec<Color>> =
                ImageBuffer::from_raw(width as u32, height as u32, data)
                    .with_context(|| format!("plane data does not fill {}x{}", width, height))?;
            buffer
                .save(path)
                .with_context(|| format!("failed to save image {}", path.display()))?;
        }
        planes => bail!("cannot save image with {} planes", planes),
    }

    log::info!("Saved {} in {:?}", path.display(), start.elapsed());
    Ok(())
}

/// Plane `index`, scaled to luma size when subsampled.
fn channel(image: &ImageEx, index: usize) -> Plane {
    let (width, height) = image.size();
    let plane = image.plane(index);
    if plane.size() != (width, height) {
        plane.scale_cubic(width, height)
    } else {
        plane.clone()
    }
}
