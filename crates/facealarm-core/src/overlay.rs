//! What to draw on a frame: one rectangle per face, plus a banner when
//! a face is present.

use crate::types::{BoundingBox, Presence};
use image::{Rgb, RgbImage};

pub const BANNER_TEXT: &str = "FACE DETECTED";
pub const BANNER_ORIGIN: (i32, i32) = (50, 50);
pub const LINE_THICKNESS: i32 = 2;
pub const FONT_SCALE: f64 = 1.0;

/// RGB color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color(pub u8, pub u8, pub u8);

pub const RECT_COLOR: Color = Color(0, 0, 255);
pub const BANNER_COLOR: Color = Color(0, 255, 0);

/// Text anchored at its baseline-left corner.
#[derive(Debug, Clone, PartialEq)]
pub struct Banner {
    pub text: &'static str,
    pub origin: (i32, i32),
    pub color: Color,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Overlay {
    pub rects: Vec<BoundingBox>,
    pub banner: Option<Banner>,
    pub rect_color: Color,
}

impl Overlay {
    pub fn for_detections(boxes: &[BoundingBox]) -> Self {
        let banner = Presence::from_detections(boxes).is_present().then_some(Banner {
            text: BANNER_TEXT,
            origin: BANNER_ORIGIN,
            color: BANNER_COLOR,
        });
        Self {
            rects: boxes.to_vec(),
            banner,
            rect_color: RECT_COLOR,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty() && self.banner.is_none()
    }
}

/// Draw `overlay` onto `image`: banner first, then one outline per face.
///
/// A face outline runs through its corners `(x, y)` and `bottom_right()`
/// inclusive, with the line thickness growing inward. Anything outside the
/// image is clipped.
pub fn annotate(image: &mut RgbImage, overlay: &Overlay) {
    if let Some(banner) = &overlay.banner {
        draw_text(image, banner.text, banner.origin, banner.color, FONT_SCALE);
    }
    for b in &overlay.rects {
        draw_outline(image, b, overlay.rect_color, LINE_THICKNESS);
    }
}

fn put(image: &mut RgbImage, x: i32, y: i32, color: Color) {
    if x >= 0 && y >= 0 && (x as u32) < image.width() && (y as u32) < image.height() {
        image.put_pixel(x as u32, y as u32, Rgb([color.0, color.1, color.2]));
    }
}

fn draw_outline(image: &mut RgbImage, b: &BoundingBox, color: Color, thickness: i32) {
    let (x1, y1) = b.bottom_right();
    for d in 0..thickness.max(1) {
        let (left, top, right, bottom) = (b.x + d, b.y + d, x1 - d, y1 - d);
        if left > right || top > bottom {
            break;
        }
        for x in left..=right {
            put(image, x, top, color);
            put(image, x, bottom, color);
        }
        for y in top..=bottom {
            put(image, left, y, color);
            put(image, right, y, color);
        }
    }
}

const GLYPH_W: i32 = 5;
const GLYPH_H: i32 = 7;
/// Pixels per glyph cell at font scale 1.0 (cap height 21 px).
const CELL_PX: f64 = 3.0;

/// 5x7 bitmap capitals, one row per byte, MSB of the low five bits leftmost.
#[rustfmt::skip]
static FONT: [[u8; 7]; 26] = [
    [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001], // A
    [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110], // B
    [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110], // C
    [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110], // D
    [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111], // E
    [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000], // F
    [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111], // G
    [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001], // H
    [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110], // I
    [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100], // J
    [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001], // K
    [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111], // L
    [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001], // M
    [0b10001, 0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001], // N
    [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110], // O
    [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000], // P
    [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101], // Q
    [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001], // R
    [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110], // S
    [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100], // T
    [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110], // U
    [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100], // V
    [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010], // W
    [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001], // X
    [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100], // Y
    [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111], // Z
];

fn glyph(ch: char) -> Option<&'static [u8; 7]> {
    let upper = ch.to_ascii_uppercase();
    upper
        .is_ascii_uppercase()
        .then(|| &FONT[(upper as u8 - b'A') as usize])
}

/// `origin` is the left end of the baseline; glyphs sit above it.
fn draw_text(image: &mut RgbImage, text: &str, origin: (i32, i32), color: Color, scale: f64) {
    let cell = ((CELL_PX * scale).round() as i32).max(1);
    let top = origin.1 - GLYPH_H * cell;
    let mut pen_x = origin.0;
    for ch in text.chars() {
        if let Some(rows) = glyph(ch) {
            for (row, bits) in rows.iter().enumerate() {
                for col in 0..GLYPH_W {
                    if bits & (1 << (GLYPH_W - 1 - col)) == 0 {
                        continue;
                    }
                    let (cx, cy) = (pen_x + col * cell, top + row as i32 * cell);
                    for dy in 0..cell {
                        for dx in 0..cell {
                            put(image, cx + dx, cy + dy, color);
                        }
                    }
                }
            }
        }
        pen_x += (GLYPH_W + 1) * cell;
    }
}
