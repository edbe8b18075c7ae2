//! Multi-scale face detection over a Haar cascade.
//!
//! Scans an image pyramid with the cascade's fixed window, then merges
//! overlapping hits and keeps only groups confirmed by enough neighbors.

use crate::cascade::{Cascade, CascadeError, IntegralImage};
use crate::types::BoundingBox;
use image::GrayImage;
use std::path::Path;

// --- Named constants ---
pub const DEFAULT_SCALE_FACTOR: f64 = 1.3;
pub const DEFAULT_MIN_NEIGHBORS: u32 = 5;
/// Relative tolerance used when clustering raw hits.
const GROUP_EPS: f64 = 0.2;

/// Anything that can locate faces in a grayscale frame.
///
/// An empty result means "no face", never an error.
pub trait FaceDetector {
    fn detect(&self, gray: &GrayImage) -> Vec<BoundingBox>;
}

/// Tunables for [`CascadeDetector`].
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionParams {
    /// Geometric step between pyramid levels; must be > 1.0.
    pub scale_factor: f64,
    /// Raw hits a group needs beyond itself to be reported. 0 disables grouping.
    pub min_neighbors: u32,
    /// Smallest face (width, height) to report; clamped up to the cascade window.
    pub min_size: (u32, u32),
    /// Largest face to report; `None` means the frame size.
    pub max_size: Option<(u32, u32)>,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
            min_size: (0, 0),
            max_size: None,
        }
    }
}

impl DetectionParams {
    fn validate(&self) -> Result<(), CascadeError> {
        if !(self.scale_factor > 1.0) || !self.scale_factor.is_finite() {
            return Err(CascadeError::InvalidParams(format!(
                "scale_factor must be a finite value > 1.0, got {}",
                self.scale_factor
            )));
        }
        Ok(())
    }
}

/// Haar-cascade face detector.
pub struct CascadeDetector {
    cascade: Cascade,
    params: DetectionParams,
}

impl CascadeDetector {
    pub fn new(cascade: Cascade, params: DetectionParams) -> Result<Self, CascadeError> {
        params.validate()?;
        Ok(Self { cascade, params })
    }

    /// Load the cascade XML at `path` and wrap it with `params`.
    pub fn load(path: impl AsRef<Path>, params: DetectionParams) -> Result<Self, CascadeError> {
        let cascade = Cascade::load(path)?;
        Self::new(cascade, params)
    }

    pub fn params(&self) -> &DetectionParams {
        &self.params
    }

    /// Every window the cascade accepts, across all pyramid levels, before grouping.
    pub fn raw_hits(&self, gray: &GrayImage) -> Vec<BoundingBox> {
        let (img_w, img_h) = gray.dimensions();
        let (win_w, win_h) = self.cascade.window_size();
        let min_size = (
            self.params.min_size.0.max(win_w),
            self.params.min_size.1.max(win_h),
        );
        let max_size = self.params.max_size.unwrap_or((img_w, img_h));

        let mut hits = Vec::new();
        let mut factor = 1.0f64;

        loop {
            let scaled_win_w = (win_w as f64 * factor).round() as u32;
            let scaled_win_h = (win_h as f64 * factor).round() as u32;
            let scaled_w = (img_w as f64 / factor).round() as u32;
            let scaled_h = (img_h as f64 / factor).round() as u32;

            if scaled_w < win_w || scaled_h < win_h {
                break;
            }
            if scaled_win_w > max_size.0 || scaled_win_h > max_size.1 {
                break;
            }
            if scaled_win_w < min_size.0 || scaled_win_h < min_size.1 {
                factor *= self.params.scale_factor;
                continue;
            }

            let level = if scaled_w == img_w && scaled_h == img_h {
                IntegralImage::new(gray)
            } else {
                IntegralImage::new(&resize_bilinear(gray, scaled_w, scaled_h))
            };

            // Windows flush with the right and bottom edges are scanned too.
            let step = if factor >= 2.0 { 1 } else { 2 };
            let before = hits.len();
            for y in (0..=scaled_h - win_h).step_by(step) {
                for x in (0..=scaled_w - win_w).step_by(step) {
                    if self.cascade.passes(&level, x, y) {
                        hits.push(BoundingBox {
                            x: (x as f64 * factor).round() as i32,
                            y: (y as f64 * factor).round() as i32,
                            width: scaled_win_w as i32,
                            height: scaled_win_h as i32,
                        });
                    }
                }
            }
            tracing::trace!(
                factor,
                level_w = scaled_w,
                level_h = scaled_h,
                hits = hits.len() - before,
                "scanned pyramid level"
            );

            factor *= self.params.scale_factor;
        }

        hits
    }
}

impl FaceDetector for CascadeDetector {
    fn detect(&self, gray: &GrayImage) -> Vec<BoundingBox> {
        let hits = self.raw_hits(gray);
        let faces = group_rectangles(&hits, self.params.min_neighbors, GROUP_EPS);
        tracing::debug!(raw = hits.len(), faces = faces.len(), "cascade detection");
        faces
    }
}

/// Bilinear resize with pixel-center alignment.
fn resize_bilinear(src: &GrayImage, new_w: u32, new_h: u32) -> GrayImage {
    let (width, height) = (src.width() as usize, src.height() as usize);
    let (new_w, new_h) = (new_w as usize, new_h as usize);
    let frame = src.as_raw();
    let scale_x = width as f32 / new_w as f32;
    let scale_y = height as f32 / new_h as f32;

    let mut resized = vec![0u8; new_w * new_h];
    for y in 0..new_h {
        let src_y = (y as f32 + 0.5) * scale_y - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = (x as f32 + 0.5) * scale_x - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = frame[y0 * width + x0] as f32;
            let tr = frame[y0 * width + x1] as f32;
            let bl = frame[y1 * width + x0] as f32;
            let br = frame[y1 * width + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;

            resized[y * new_w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    GrayImage::from_raw(new_w as u32, new_h as u32, resized)
        .unwrap_or_else(|| GrayImage::new(new_w as u32, new_h as u32))
}

fn similar(a: &BoundingBox, b: &BoundingBox, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f64 * 0.5;
    ((a.x - b.x).abs() as f64) <= delta
        && ((a.y - b.y).abs() as f64) <= delta
        && ((a.x + a.width - b.x - b.width).abs() as f64) <= delta
        && ((a.y + a.height - b.y - b.height).abs() as f64) <= delta
}

/// Label each rect with its cluster id under the `similar` relation
/// (transitively closed). Ids are assigned in order of first appearance.
fn partition(rects: &[BoundingBox], eps: f64) -> (Vec<usize>, usize) {
    let mut parent: Vec<usize> = (0..rects.len()).collect();

    fn root(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..rects.len() {
        for j in (i + 1)..rects.len() {
            if similar(&rects[i], &rects[j], eps) {
                let (ri, rj) = (root(&mut parent, i), root(&mut parent, j));
                if ri != rj {
                    parent[rj] = ri;
                }
            }
        }
    }

    let mut ids = vec![usize::MAX; rects.len()];
    let mut labels = Vec::with_capacity(rects.len());
    let mut count = 0;
    for i in 0..rects.len() {
        let r = root(&mut parent, i);
        if ids[r] == usize::MAX {
            ids[r] = count;
            count += 1;
        }
        labels.push(ids[r]);
    }
    (labels, count)
}

/// Merge overlapping raw hits into averaged boxes.
///
/// Groups with `group_threshold` or fewer members are dropped, as are
/// groups nested inside a stronger group. A threshold of 0 returns the
/// input unchanged.
pub fn group_rectangles(rects: &[BoundingBox], group_threshold: u32, eps: f64) -> Vec<BoundingBox> {
    if group_threshold == 0 || rects.is_empty() {
        return rects.to_vec();
    }

    let (labels, classes) = partition(rects, eps);
    let mut sums = vec![[0i64; 4]; classes];
    let mut counts = vec![0u32; classes];
    for (r, &label) in rects.iter().zip(&labels) {
        let s = &mut sums[label];
        s[0] += r.x as i64;
        s[1] += r.y as i64;
        s[2] += r.width as i64;
        s[3] += r.height as i64;
        counts[label] += 1;
    }

    let averaged: Vec<BoundingBox> = sums
        .iter()
        .zip(&counts)
        .map(|(s, &n)| {
            let avg = |v: i64| (v as f64 / n as f64).round() as i32;
            BoundingBox::new(avg(s[0]), avg(s[1]), avg(s[2]), avg(s[3]))
        })
        .collect();

    let mut out = Vec::new();
    for (i, r1) in averaged.iter().enumerate() {
        let n1 = counts[i];
        if n1 <= group_threshold {
            continue;
        }
        let swallowed = averaged.iter().enumerate().any(|(j, r2)| {
            let n2 = counts[j];
            if j == i || n2 <= group_threshold {
                return false;
            }
            let dx = (r2.width as f64 * eps).round() as i32;
            let dy = (r2.height as f64 * eps).round() as i32;
            r1.is_inside(r2, dx, dy) && (n2 > n1.max(3) || n1 < 3)
        });
        if !swallowed {
            out.push(*r1);
        }
    }
    out
}
