use serde::{Deserialize, Serialize};

/// Axis-aligned box locating one detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    /// Bottom-right corner (exclusive), as drawn by the overlay.
    pub fn bottom_right(&self) -> (i32, i32) {
        (self.x + self.width, self.y + self.height)
    }

    /// True when `self` lies within `outer` grown by `dx`/`dy` on every side.
    pub fn is_inside(&self, outer: &BoundingBox, dx: i32, dy: i32) -> bool {
        self.x >= outer.x - dx
            && self.y >= outer.y - dy
            && self.x + self.width <= outer.x + outer.width + dx
            && self.y + self.height <= outer.y + outer.height + dy
    }
}

/// Face presence for one frame, and its single-byte wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Presence {
    Present,
    Absent,
}

impl Presence {
    /// A frame is `Present` iff the detector returned at least one box.
    pub fn from_detections(boxes: &[BoundingBox]) -> Self {
        if boxes.is_empty() {
            Presence::Absent
        } else {
            Presence::Present
        }
    }

    /// ASCII `'1'` for present, `'0'` for absent.
    pub fn as_byte(self) -> u8 {
        match self {
            Presence::Present => b'1',
            Presence::Absent => b'0',
        }
    }

    /// Decode a presence byte. Anything other than `'0'`/`'1'` is not a
    /// presence update and yields `None`, matching how the receiver ignores it.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'1' => Some(Presence::Present),
            b'0' => Some(Presence::Absent),
            _ => None,
        }
    }

    pub fn is_present(self) -> bool {
        self == Presence::Present
    }
}

impl std::fmt::Display for Presence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Presence::Present => f.write_str("present"),
            Presence::Absent => f.write_str("absent"),
        }
    }
}
