//! Frame type and pixel conversion: YUYV, GREY, RGB3 and MJPG to RGB, and RGB to luma.

use image::{GrayImage, RgbImage};

/// A captured color camera frame.
#[derive(Clone)]
pub struct Frame {
    /// RGB pixel data.
    pub image: RgbImage,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u32) -> Self {
        Self {
            image,
            timestamp: std::time::Instant::now(),
            sequence,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Single-channel intensity copy for detection.
    pub fn to_grayscale(&self) -> GrayImage {
        rgb_to_gray(&self.image)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid {format} length: expected {expected}, got {actual}")]
    InvalidLength {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("MJPG decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

/// ITU-R BT.601 luma, 14-bit fixed point (0.299 R + 0.587 G + 0.114 B).
pub fn rgb_to_gray(rgb: &RgbImage) -> GrayImage {
    const R: u32 = 4899;
    const G: u32 = 9617;
    const B: u32 = 1868;
    const SHIFT: u32 = 14;

    let data = rgb
        .as_raw()
        .chunks_exact(3)
        .map(|p| {
            let y = p[0] as u32 * R + p[1] as u32 * G + p[2] as u32 * B + (1 << (SHIFT - 1));
            (y >> SHIFT) as u8
        })
        .collect();
    GrayImage::from_raw(rgb.width(), rgb.height(), data)
        .unwrap_or_else(|| GrayImage::new(rgb.width(), rgb.height()))
}

fn check_len(format: &'static str, buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            format,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// Convert packed YUYV (4:2:2, BT.601 studio range) to RGB.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U/V.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 2) as usize;
    check_len("YUYV", yuyv, expected)?;

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for quad in yuyv[..expected].chunks_exact(4) {
        let d = quad[1] as i32 - 128;
        let e = quad[3] as i32 - 128;
        for y in [quad[0], quad[2]] {
            let c = 298 * (y as i32 - 16);
            rgb.push(clamp_u8((c + 409 * e + 128) >> 8));
            rgb.push(clamp_u8((c - 100 * d - 208 * e + 128) >> 8));
            rgb.push(clamp_u8((c + 516 * d + 128) >> 8));
        }
    }
    Ok(RgbImage::from_raw(width, height, rgb).unwrap_or_else(|| RgbImage::new(width, height)))
}

/// Expand 8-bit grayscale to RGB by replicating the channel.
pub fn grey_to_rgb(grey: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len("GREY", grey, pixels)?;
    let rgb = grey[..pixels].iter().flat_map(|&g| [g, g, g]).collect();
    Ok(RgbImage::from_raw(width, height, rgb).unwrap_or_else(|| RgbImage::new(width, height)))
}

/// Copy a packed RGB24 buffer.
pub fn rgb24_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 3) as usize;
    check_len("RGB3", buf, expected)?;
    Ok(RgbImage::from_raw(width, height, buf[..expected].to_vec())
        .unwrap_or_else(|| RgbImage::new(width, height)))
}

/// Decode one Motion-JPEG frame.
pub fn mjpeg_to_rgb(buf: &[u8]) -> Result<RgbImage, FrameError> {
    let img = image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)?;
    Ok(img.to_rgb8())
}
