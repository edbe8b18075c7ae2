//! The presence loop: frame → detect → signal → overlay → display, until quit.

use crate::display::{Display, DisplayError};
use facealarm_core::{FaceDetector, Overlay, Presence};
use facealarm_hw::{CameraError, ChannelError, FrameSource, SignalChannel};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoopError {
    #[error("camera read failed: {0}")]
    DeviceRead(#[source] CameraError),
    #[error("presence write failed: {0}")]
    ChannelWrite(#[source] ChannelError),
    #[error("display error: {0}")]
    Display(#[from] DisplayError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    QuitKey,
    FrameLimit,
}

/// Loop behavior that is not owned by any device.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub quit_key: char,
    /// Bounded wait for the quit key; the loop's only throttle.
    pub poll_interval: Duration,
    /// Stop after this many frames, as if the quit key was pressed.
    pub max_frames: Option<u64>,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            quit_key: 'q',
            poll_interval: Duration::from_millis(1),
            max_frames: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct LoopStats {
    frames: u64,
    bytes_sent: u64,
    transitions: u64,
    last: Option<Presence>,
}

/// What a clean run did before it stopped.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub frames: u64,
    pub bytes_sent: u64,
    /// Present/absent flips between consecutive frames.
    pub transitions: u64,
    pub stop_reason: StopReason,
    pub elapsed: Duration,
    pub final_state: LoopState,
}

/// Owns the camera, detector, serial channel and display for its lifetime.
pub struct PresenceLoop<S, D, C, V> {
    source: S,
    detector: D,
    channel: C,
    display: V,
    settings: LoopSettings,
    state: LoopState,
    stats: LoopStats,
}

impl<S, D, C, V> PresenceLoop<S, D, C, V>
where
    S: FrameSource,
    D: FaceDetector,
    C: SignalChannel,
    V: Display,
{
    pub fn new(source: S, detector: D, channel: C, display: V, settings: LoopSettings) -> Self {
        Self {
            source,
            detector,
            channel,
            display,
            settings,
            state: LoopState::Running,
            stats: LoopStats::default(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Run until the quit key, the frame limit, or a fatal error.
    ///
    /// Consumes the loop: every device is released exactly once on every
    /// exit path, and nothing can be processed afterwards.
    pub fn run(mut self) -> Result<RunSummary, LoopError> {
        let started = Instant::now();
        tracing::info!(quit_key = %self.settings.quit_key, "presence loop running");

        let outcome = self.drive();
        self.set_state(LoopState::Stopping);

        let stats = self.stats.clone();
        let elapsed = started.elapsed();
        let final_state = self.release();

        match outcome {
            Ok(stop_reason) => {
                let fps = if elapsed.as_secs_f64() > 0.0 {
                    stats.frames as f64 / elapsed.as_secs_f64()
                } else {
                    0.0
                };
                tracing::info!(
                    frames = stats.frames,
                    bytes = stats.bytes_sent,
                    transitions = stats.transitions,
                    fps = (fps * 10.0).round() / 10.0,
                    reason = ?stop_reason,
                    "presence loop stopped"
                );
                Ok(RunSummary {
                    frames: stats.frames,
                    bytes_sent: stats.bytes_sent,
                    transitions: stats.transitions,
                    stop_reason,
                    elapsed,
                    final_state,
                })
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    frames = stats.frames,
                    bytes = stats.bytes_sent,
                    "presence loop stopped on fatal error"
                );
                Err(e)
            }
        }
    }

    fn drive(&mut self) -> Result<StopReason, LoopError> {
        loop {
            if let Some(max) = self.settings.max_frames {
                if self.stats.frames >= max {
                    return Ok(StopReason::FrameLimit);
                }
            }

            let presence = self.step()?;
            self.record(presence);

            if let Some(key) = self.display.poll_key(self.settings.poll_interval)? {
                if key == self.settings.quit_key {
                    tracing::info!("quit key pressed");
                    return Ok(StopReason::QuitKey);
                }
                tracing::trace!(%key, "ignoring key");
            }
        }
    }

    /// One detect-and-signal cycle. The byte goes out before anything is drawn.
    fn step(&mut self) -> Result<Presence, LoopError> {
        let frame = self.source.next_frame().map_err(LoopError::DeviceRead)?;
        let gray = frame.to_grayscale();
        let faces = self.detector.detect(&gray);
        let presence = Presence::from_detections(&faces);

        self.channel
            .send(presence)
            .map_err(LoopError::ChannelWrite)?;
        self.stats.bytes_sent += 1;

        let overlay = Overlay::for_detections(&faces);
        self.display.show(&frame, &overlay)?;

        tracing::trace!(seq = frame.sequence, faces = faces.len(), %presence, "frame processed");
        Ok(presence)
    }

    fn record(&mut self, presence: Presence) {
        self.stats.frames += 1;
        match self.stats.last {
            Some(prev) if prev != presence => {
                self.stats.transitions += 1;
                match presence {
                    Presence::Present => tracing::info!(frame = self.stats.frames, "face appeared"),
                    Presence::Absent => tracing::info!(frame = self.stats.frames, "face lost"),
                }
            }
            None => tracing::info!(%presence, "first frame"),
            _ => {}
        }
        self.stats.last = Some(presence);
    }

    fn set_state(&mut self, next: LoopState) {
        tracing::debug!(from = ?self.state, to = ?next, "loop state");
        self.state = next;
    }

    /// Stopping → Stopped: camera, then channel, then display.
    fn release(mut self) -> LoopState {
        self.set_state(LoopState::Stopped);
        let PresenceLoop {
            source,
            detector,
            channel,
            mut display,
            state,
            ..
        } = self;
        drop(source);
        drop(channel);
        display.close();
        drop(display);
        drop(detector);
        tracing::debug!("resources released");
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facealarm_core::overlay::{BANNER_COLOR, RECT_COLOR};
    use facealarm_core::{annotate, BoundingBox};
    use facealarm_hw::Frame;
    use image::{GrayImage, RgbImage};
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Detect,
        Send(u8),
        Show {
            rects: Vec<BoundingBox>,
            banner: Option<(i32, i32)>,
        },
        Poll,
    }

    type Log = Rc<RefCell<Vec<Event>>>;

    struct FakeSource {
        remaining: u32,
        seq: u32,
        drops: Rc<Cell<u32>>,
    }

    impl FrameSource for FakeSource {
        fn next_frame(&mut self) -> Result<Frame, CameraError> {
            if self.remaining == 0 {
                return Err(CameraError::CaptureFailed("camera unplugged".into()));
            }
            self.remaining -= 1;
            self.seq += 1;
            Ok(Frame::new(RgbImage::new(320, 240), self.seq))
        }
    }

    impl Drop for FakeSource {
        fn drop(&mut self) {
            self.drops.set(self.drops.get() + 1);
        }
    }

    struct ScriptedDetector {
        script: RefCell<VecDeque<Vec<BoundingBox>>>,
        log: Log,
    }

    impl FaceDetector for ScriptedDetector {
        fn detect(&self, _gray: &GrayImage) -> Vec<BoundingBox> {
            self.log.borrow_mut().push(Event::Detect);
            self.script.borrow_mut().pop_front().unwrap_or_default()
        }
    }

    struct FakeChannel {
        log: Log,
        fail_on_send: Option<usize>,
        sends: usize,
        drops: Rc<Cell<u32>>,
    }

    impl SignalChannel for FakeChannel {
        fn send(&mut self, presence: Presence) -> Result<(), ChannelError> {
            self.sends += 1;
            if self.fail_on_send == Some(self.sends) {
                return Err(ChannelError::Write(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "board unplugged",
                )));
            }
            self.log.borrow_mut().push(Event::Send(presence.as_byte()));
            Ok(())
        }
    }

    impl Drop for FakeChannel {
        fn drop(&mut self) {
            self.drops.set(self.drops.get() + 1);
        }
    }

    struct FakeDisplay {
        log: Log,
        keys: VecDeque<Option<char>>,
        closes: Rc<Cell<u32>>,
        shown: Rc<RefCell<Vec<RgbImage>>>,
    }

    impl Display for FakeDisplay {
        fn show(&mut self, frame: &Frame, overlay: &Overlay) -> Result<(), DisplayError> {
            self.log.borrow_mut().push(Event::Show {
                rects: overlay.rects.clone(),
                banner: overlay.banner.as_ref().map(|b| b.origin),
            });
            let mut annotated = frame.image.clone();
            annotate(&mut annotated, overlay);
            self.shown.borrow_mut().push(annotated);
            Ok(())
        }

        fn poll_key(&mut self, _wait: Duration) -> Result<Option<char>, DisplayError> {
            self.log.borrow_mut().push(Event::Poll);
            Ok(self.keys.pop_front().flatten())
        }

        fn close(&mut self) {
            self.closes.set(self.closes.get() + 1);
        }
    }

    struct Harness {
        log: Log,
        source_drops: Rc<Cell<u32>>,
        channel_drops: Rc<Cell<u32>>,
        display_closes: Rc<Cell<u32>>,
        shown: Rc<RefCell<Vec<RgbImage>>>,
    }

    impl Harness {
        fn sent(&self) -> Vec<u8> {
            self.log
                .borrow()
                .iter()
                .filter_map(|e| match e {
                    Event::Send(b) => Some(*b),
                    _ => None,
                })
                .collect()
        }

        fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
            self.log.borrow().iter().filter(|e| pred(e)).count()
        }

        fn assert_released_once(&self) {
            assert_eq!(self.source_drops.get(), 1, "camera released once");
            assert_eq!(self.channel_drops.get(), 1, "channel closed once");
            assert_eq!(self.display_closes.get(), 1, "display closed once");
        }
    }

    fn build(
        frames: u32,
        detections: Vec<Vec<BoundingBox>>,
        keys: Vec<Option<char>>,
        fail_on_send: Option<usize>,
        settings: LoopSettings,
    ) -> (
        PresenceLoop<FakeSource, ScriptedDetector, FakeChannel, FakeDisplay>,
        Harness,
    ) {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let harness = Harness {
            log: log.clone(),
            source_drops: Rc::new(Cell::new(0)),
            channel_drops: Rc::new(Cell::new(0)),
            display_closes: Rc::new(Cell::new(0)),
            shown: Rc::new(RefCell::new(Vec::new())),
        };
        let source = FakeSource {
            remaining: frames,
            seq: 0,
            drops: harness.source_drops.clone(),
        };
        let detector = ScriptedDetector {
            script: RefCell::new(detections.into()),
            log: log.clone(),
        };
        let channel = FakeChannel {
            log: log.clone(),
            fail_on_send,
            sends: 0,
            drops: harness.channel_drops.clone(),
        };
        let display = FakeDisplay {
            log,
            keys: keys.into(),
            closes: harness.display_closes.clone(),
            shown: harness.shown.clone(),
        };
        (
            PresenceLoop::new(source, detector, channel, display, settings),
            harness,
        )
    }

    fn face() -> BoundingBox {
        BoundingBox::new(50, 60, 80, 80)
    }

    #[test]
    fn test_new_loop_is_running() {
        let (presence_loop, _h) = build(0, vec![], vec![], None, LoopSettings::default());
        assert_eq!(presence_loop.state(), LoopState::Running);
    }

    #[test]
    fn test_no_face_sends_zero_and_draws_nothing() {
        let (presence_loop, h) = build(1, vec![vec![]], vec![Some('q')], None, LoopSettings::default());
        let summary = presence_loop.run().unwrap();

        assert_eq!(summary.stop_reason, StopReason::QuitKey);
        assert_eq!(summary.frames, 1);
        assert_eq!(
            *h.log.borrow(),
            vec![
                Event::Detect,
                Event::Send(b'0'),
                Event::Show {
                    rects: vec![],
                    banner: None
                },
                Event::Poll,
            ]
        );
        h.assert_released_once();
    }

    #[test]
    fn test_one_face_sends_one_and_draws_box_and_banner() {
        let (presence_loop, h) = build(1, vec![vec![face()]], vec![Some('q')], None, LoopSettings::default());
        presence_loop.run().unwrap();

        assert_eq!(h.sent(), b"1");
        let log = h.log.borrow();
        assert_eq!(
            log[2],
            Event::Show {
                rects: vec![BoundingBox::new(50, 60, 80, 80)],
                banner: Some((50, 50)),
            }
        );
    }

    #[test]
    fn test_displayed_frames_match_sent_bytes() {
        let detections = vec![vec![], vec![face()]];
        let keys = vec![None, Some('q')];
        let (presence_loop, h) = build(2, detections, keys, None, LoopSettings::default());
        presence_loop.run().unwrap();

        assert_eq!(h.sent(), b"01");
        let shown = h.shown.borrow();
        assert_eq!(shown.len(), 2);

        // '0': the frame goes out untouched.
        assert!(shown[0].pixels().all(|p| p.0 == [0, 0, 0]));

        // '1': outline through (50,60) and (130,140), banner above (50,50).
        let blue = [RECT_COLOR.0, RECT_COLOR.1, RECT_COLOR.2];
        let green = [BANNER_COLOR.0, BANNER_COLOR.1, BANNER_COLOR.2];
        assert_eq!(shown[1].get_pixel(50, 60).0, blue);
        assert_eq!(shown[1].get_pixel(130, 140).0, blue);
        assert_eq!(shown[1].get_pixel(131, 140).0, [0, 0, 0]);
        assert_eq!(shown[1].get_pixel(50, 29).0, green);
    }

    #[test]
    fn test_exactly_one_write_per_frame_after_detection() {
        let detections = vec![vec![], vec![face()], vec![face(), face()], vec![], vec![face()]];
        let keys = vec![None, Some('x'), None, None, Some('q')];
        let (presence_loop, h) = build(10, detections, keys, None, LoopSettings::default());
        let summary = presence_loop.run().unwrap();

        assert_eq!(summary.frames, 5);
        assert_eq!(summary.bytes_sent, 5);
        assert_eq!(h.sent(), b"01101");

        let log = h.log.borrow();
        for (i, event) in log.iter().enumerate() {
            if let Event::Send(_) = event {
                assert_eq!(log[i - 1], Event::Detect, "send at {i} must follow detection");
            }
        }
        assert_eq!(h.count(|e| *e == Event::Detect), 5);
    }

    #[test]
    fn test_banner_iff_presence_byte_is_one() {
        let detections = vec![vec![face()], vec![], vec![face()]];
        let keys = vec![None, None, Some('q')];
        let (presence_loop, h) = build(3, detections, keys, None, LoopSettings::default());
        presence_loop.run().unwrap();

        let log = h.log.borrow();
        let mut last_byte = None;
        for event in log.iter() {
            match event {
                Event::Send(b) => last_byte = Some(*b),
                Event::Show { rects, banner } => {
                    assert_eq!(banner.is_some(), last_byte == Some(b'1'));
                    assert_eq!(rects.is_empty(), last_byte == Some(b'0'));
                }
                _ => {}
            }
        }
    }

    #[test]
    fn test_camera_disconnect_stops_and_releases() {
        let (presence_loop, h) = build(3, vec![vec![face()]; 3], vec![], None, LoopSettings::default());
        let err = presence_loop.run().unwrap_err();

        assert!(matches!(err, LoopError::DeviceRead(CameraError::CaptureFailed(_))));
        assert_eq!(h.sent().len(), 3);
        assert_eq!(h.count(|e| *e == Event::Detect), 3);
        assert_eq!(h.log.borrow().last(), Some(&Event::Poll));
        h.assert_released_once();
    }

    #[test]
    fn test_write_failure_is_fatal() {
        let (presence_loop, h) = build(10, vec![], vec![], Some(2), LoopSettings::default());
        let err = presence_loop.run().unwrap_err();

        assert!(matches!(err, LoopError::ChannelWrite(ChannelError::Write(_))));
        assert_eq!(h.sent(), b"0");
        // The failed frame is never drawn.
        assert_eq!(h.count(|e| matches!(e, Event::Show { .. })), 1);
        assert_eq!(h.log.borrow().last(), Some(&Event::Detect));
        h.assert_released_once();
    }

    #[test]
    fn test_frame_limit_stops_cleanly() {
        let settings = LoopSettings {
            max_frames: Some(4),
            ..LoopSettings::default()
        };
        let (presence_loop, h) = build(100, vec![], vec![], None, settings);
        let summary = presence_loop.run().unwrap();

        assert_eq!(summary.stop_reason, StopReason::FrameLimit);
        assert_eq!(summary.frames, 4);
        assert_eq!(h.sent(), b"0000");
        // The last frame still gets its key poll.
        assert_eq!(h.count(|e| *e == Event::Poll), 4);
        h.assert_released_once();
    }

    #[test]
    fn test_zero_frame_limit_sends_nothing() {
        let settings = LoopSettings {
            max_frames: Some(0),
            ..LoopSettings::default()
        };
        let (presence_loop, h) = build(100, vec![], vec![], None, settings);
        let summary = presence_loop.run().unwrap();

        assert_eq!(summary.stop_reason, StopReason::FrameLimit);
        assert_eq!(summary.frames, 0);
        assert!(h.log.borrow().is_empty());
        h.assert_released_once();
    }

    #[test]
    fn test_quit_key_on_last_allowed_frame() {
        let settings = LoopSettings {
            max_frames: Some(2),
            ..LoopSettings::default()
        };
        let (presence_loop, _h) = build(10, vec![], vec![None, Some('q')], None, settings);
        let summary = presence_loop.run().unwrap();
        assert_eq!(summary.stop_reason, StopReason::QuitKey);
        assert_eq!(summary.frames, 2);
    }

    #[test]
    fn test_clean_run_ends_stopped() {
        let (presence_loop, _h) = build(1, vec![], vec![Some('q')], None, LoopSettings::default());
        let summary = presence_loop.run().unwrap();
        assert_eq!(summary.final_state, LoopState::Stopped);
    }

    #[test]
    fn test_release_moves_stopping_to_stopped() {
        let (mut presence_loop, h) = build(0, vec![], vec![], None, LoopSettings::default());
        presence_loop.set_state(LoopState::Stopping);
        assert_eq!(presence_loop.release(), LoopState::Stopped);
        h.assert_released_once();
    }

    #[test]
    fn test_custom_quit_key() {
        let settings = LoopSettings {
            quit_key: 'x',
            ..LoopSettings::default()
        };
        let (presence_loop, h) = build(10, vec![], vec![Some('q'), Some('x')], None, settings);
        let summary = presence_loop.run().unwrap();
        assert_eq!(summary.frames, 2);
        assert_eq!(h.sent().len(), 2);
    }

    #[test]
    fn test_transitions_counted() {
        let detections = vec![vec![], vec![face()], vec![face()], vec![], vec![]];
        let keys = vec![None, None, None, None, Some('q')];
        let (presence_loop, _h) = build(5, detections, keys, None, LoopSettings::default());
        let summary = presence_loop.run().unwrap();
        assert_eq!(summary.transitions, 2);
    }
}
