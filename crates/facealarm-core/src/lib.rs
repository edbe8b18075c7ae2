//! facealarm-core — Face presence detection.
//!
//! Evaluates OpenCV Haar cascades over an image pyramid, decides face
//! presence per frame, and describes the overlay drawn for it.

pub mod cascade;
pub mod detector;
pub mod overlay;
pub mod types;

pub use cascade::{Cascade, CascadeError};
pub use detector::{CascadeDetector, DetectionParams, FaceDetector};
pub use overlay::{annotate, Overlay};
pub use types::{BoundingBox, Presence};
