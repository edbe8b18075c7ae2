//! facealarm-hw — Hardware abstraction for camera capture and the alarm link.
//!
//! Provides V4L2-based frame capture and the serial channel that carries
//! presence bytes to the alarm microcontroller.

pub mod camera;
pub mod frame;
pub mod serial;

pub use camera::{Camera, CameraError, FrameSource, PixelFormat};
pub use frame::Frame;
pub use serial::{ChannelError, SerialChannel, SignalChannel};
