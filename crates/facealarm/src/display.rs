//! Annotated frame output and quit-key polling.

use facealarm_core::Overlay;
use facealarm_hw::Frame;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("display backend error: {0}")]
    Backend(String),
}

/// Where annotated frames go, and where the quit key comes from.
pub trait Display {
    /// Render `frame` with `overlay` drawn on top.
    fn show(&mut self, frame: &Frame, overlay: &Overlay) -> Result<(), DisplayError>;

    /// Wait up to `wait` for a key press. This is the loop's only suspension point.
    fn poll_key(&mut self, wait: Duration) -> Result<Option<char>, DisplayError>;

    /// Tear down any windows. Called once at shutdown.
    fn close(&mut self);
}

/// No window: logs each overlay and turns Ctrl-C into the quit key.
pub struct HeadlessDisplay {
    interrupted: Arc<AtomicBool>,
    quit_key: char,
}

impl HeadlessDisplay {
    pub fn new(interrupted: Arc<AtomicBool>, quit_key: char) -> Self {
        Self {
            interrupted,
            quit_key,
        }
    }
}

impl Display for HeadlessDisplay {
    fn show(&mut self, frame: &Frame, overlay: &Overlay) -> Result<(), DisplayError> {
        tracing::debug!(
            seq = frame.sequence,
            faces = overlay.rects.len(),
            banner = overlay.banner.as_ref().map(|b| b.text),
            "frame"
        );
        Ok(())
    }

    fn poll_key(&mut self, wait: Duration) -> Result<Option<char>, DisplayError> {
        std::thread::sleep(wait);
        Ok(self
            .interrupted
            .load(Ordering::SeqCst)
            .then_some(self.quit_key))
    }

    fn close(&mut self) {
        tracing::debug!("headless display closed");
    }
}

#[cfg(feature = "highgui")]
pub use highgui::HighguiDisplay;

#[cfg(feature = "highgui")]
mod highgui {
    use super::{Display, DisplayError};
    use facealarm_core::overlay::{annotate, Overlay};
    use facealarm_hw::Frame;
    use image::RgbImage;
    use opencv::core::{Mat, Scalar, CV_8UC3};
    use opencv::highgui;
    use opencv::prelude::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    impl From<opencv::Error> for DisplayError {
        fn from(e: opencv::Error) -> Self {
            DisplayError::Backend(e.to_string())
        }
    }

    /// OpenCV highgui preview window.
    pub struct HighguiDisplay {
        window: String,
        interrupted: Arc<AtomicBool>,
        quit_key: char,
    }

    impl HighguiDisplay {
        pub fn open(title: &str, interrupted: Arc<AtomicBool>, quit_key: char) -> Result<Self, DisplayError> {
            highgui::named_window(title, highgui::WINDOW_AUTOSIZE)?;
            tracing::info!(window = title, "opened preview window");
            Ok(Self {
                window: title.to_string(),
                interrupted,
                quit_key,
            })
        }

        fn to_bgr_mat(image: &RgbImage) -> Result<Mat, DisplayError> {
            let mut mat = Mat::new_rows_cols_with_default(
                image.height() as i32,
                image.width() as i32,
                CV_8UC3,
                Scalar::all(0.0),
            )?;
            let dst = mat.data_bytes_mut()?;
            for (out, px) in dst.chunks_exact_mut(3).zip(image.pixels()) {
                out[0] = px.0[2];
                out[1] = px.0[1];
                out[2] = px.0[0];
            }
            Ok(mat)
        }
    }

    impl Display for HighguiDisplay {
        fn show(&mut self, frame: &Frame, overlay: &Overlay) -> Result<(), DisplayError> {
            let mut annotated = frame.image.clone();
            annotate(&mut annotated, overlay);
            let mat = Self::to_bgr_mat(&annotated)?;
            highgui::imshow(&self.window, &mat)?;
            Ok(())
        }

        fn poll_key(&mut self, wait: Duration) -> Result<Option<char>, DisplayError> {
            let delay = (wait.as_millis() as i32).max(1);
            let key = highgui::wait_key(delay)?;
            if self.interrupted.load(Ordering::SeqCst) {
                return Ok(Some(self.quit_key));
            }
            Ok((key >= 0).then(|| ((key & 0xFF) as u8) as char))
        }

        fn close(&mut self) {
            if let Err(e) = highgui::destroy_all_windows() {
                tracing::warn!(error = %e, "failed to destroy preview window");
            }
            tracing::info!(window = %self.window, "preview window closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facealarm_core::BoundingBox;
    use image::RgbImage;

    #[test]
    fn test_headless_quits_after_interrupt() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut display = HeadlessDisplay::new(flag.clone(), 'q');
        assert_eq!(display.poll_key(Duration::from_millis(1)).unwrap(), None);

        flag.store(true, Ordering::SeqCst);
        assert_eq!(display.poll_key(Duration::from_millis(1)).unwrap(), Some('q'));
    }

    #[test]
    fn test_headless_show_accepts_any_overlay() {
        let mut display = HeadlessDisplay::new(Arc::new(AtomicBool::new(false)), 'q');
        let frame = Frame::new(RgbImage::new(8, 8), 0);
        let overlay = Overlay::for_detections(&[BoundingBox::new(1, 1, 4, 4)]);
        display.show(&frame, &overlay).unwrap();
        display.close();
    }
}
