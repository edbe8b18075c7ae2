use facealarm_core::DetectionParams;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Alarm configuration: defaults, then an optional TOML file, then
/// `FACEALARM_*` environment variables. CLI flags are applied last by `main`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path or index (default: /dev/video0).
    pub camera_device: String,
    /// Requested capture width; the driver may pick another size.
    pub frame_width: u32,
    pub frame_height: u32,
    /// Frames to drop after the camera opens (auto-exposure settling).
    pub warmup_frames: usize,
    /// Serial device of the alarm board.
    pub serial_port: String,
    pub baud_rate: u32,
    /// Pause after opening the serial port while the board resets.
    pub settle_delay_ms: u64,
    /// Haar cascade XML.
    pub cascade_path: PathBuf,
    pub scale_factor: f64,
    pub min_neighbors: u32,
    /// Smallest face side in pixels; 0 means the cascade window.
    pub min_face_size: u32,
    pub quit_key: char,
    /// Quit-key polling wait per frame.
    pub poll_interval_ms: u64,
    pub window_title: String,
    /// Run without a preview window.
    pub headless: bool,
    /// Stop after this many frames (diagnostics).
    pub max_frames: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            frame_width: 640,
            frame_height: 480,
            warmup_frames: 0,
            serial_port: "/dev/ttyACM0".to_string(),
            baud_rate: facealarm_hw::serial::DEFAULT_BAUD_RATE,
            settle_delay_ms: facealarm_hw::serial::DEFAULT_SETTLE_DELAY.as_millis() as u64,
            cascade_path: PathBuf::from(
                "/usr/share/opencv4/haarcascades/haarcascade_frontalface_default.xml",
            ),
            scale_factor: facealarm_core::detector::DEFAULT_SCALE_FACTOR,
            min_neighbors: facealarm_core::detector::DEFAULT_MIN_NEIGHBORS,
            min_face_size: 0,
            quit_key: 'q',
            poll_interval_ms: 1,
            window_title: "Face Detection Alarm".to_string(),
            headless: false,
            max_frames: None,
        }
    }
}

impl Config {
    /// Load defaults, overlay `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p).map_err(|source| ConfigError::Io {
                    path: p.display().to_string(),
                    source,
                })?;
                tracing::debug!(path = %p.display(), "loaded config file");
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `FACEALARM_*` overrides; unparsable values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FACEALARM_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("FACEALARM_SERIAL_PORT") {
            self.serial_port = v;
        }
        if let Some(v) = lookup("FACEALARM_CASCADE_PATH") {
            self.cascade_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEALARM_WINDOW_TITLE") {
            self.window_title = v;
        }
        env_parse(&lookup, "FACEALARM_FRAME_WIDTH", &mut self.frame_width);
        env_parse(&lookup, "FACEALARM_FRAME_HEIGHT", &mut self.frame_height);
        env_parse(&lookup, "FACEALARM_WARMUP_FRAMES", &mut self.warmup_frames);
        env_parse(&lookup, "FACEALARM_BAUD_RATE", &mut self.baud_rate);
        env_parse(&lookup, "FACEALARM_SETTLE_DELAY_MS", &mut self.settle_delay_ms);
        env_parse(&lookup, "FACEALARM_SCALE_FACTOR", &mut self.scale_factor);
        env_parse(&lookup, "FACEALARM_MIN_NEIGHBORS", &mut self.min_neighbors);
        env_parse(&lookup, "FACEALARM_MIN_FACE_SIZE", &mut self.min_face_size);
        env_parse(&lookup, "FACEALARM_QUIT_KEY", &mut self.quit_key);
        env_parse(&lookup, "FACEALARM_POLL_INTERVAL_MS", &mut self.poll_interval_ms);
        if let Some(v) = lookup("FACEALARM_HEADLESS") {
            self.headless = v != "0";
        }
    }

    pub fn detection_params(&self) -> DetectionParams {
        DetectionParams {
            scale_factor: self.scale_factor,
            min_neighbors: self.min_neighbors,
            min_size: (self.min_face_size, self.min_face_size),
            max_size: None,
        }
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn env_parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable environment override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_alarm_wiring() {
        let c = Config::default();
        assert_eq!(c.baud_rate, 9600);
        assert_eq!(c.settle_delay(), Duration::from_secs(2));
        assert_eq!(c.scale_factor, 1.3);
        assert_eq!(c.min_neighbors, 5);
        assert_eq!(c.quit_key, 'q');
        assert_eq!(c.poll_interval(), Duration::from_millis(1));
        assert_eq!(c.window_title, "Face Detection Alarm");
        // No size floor beyond the cascade window, like detectMultiScale's default.
        assert_eq!(c.detection_params().min_size, (0, 0));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let c = Config::from_toml_str(
            r#"
            serial_port = "/dev/ttyUSB1"
            baud_rate = 115200
            min_neighbors = 3
            "#,
        )
        .unwrap();
        assert_eq!(c.serial_port, "/dev/ttyUSB1");
        assert_eq!(c.baud_rate, 115200);
        assert_eq!(c.min_neighbors, 3);
        assert_eq!(c.camera_device, "/dev/video0");
        assert_eq!(c.scale_factor, 1.3);
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(matches!(
            Config::from_toml_str("serial = \"/dev/ttyS0\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut c = Config::from_toml_str("camera_device = \"/dev/video1\"\nbaud_rate = 19200").unwrap();
        c.apply_env(env(&[
            ("FACEALARM_CAMERA_DEVICE", "2"),
            ("FACEALARM_SCALE_FACTOR", "1.1"),
            ("FACEALARM_HEADLESS", "1"),
        ]));
        assert_eq!(c.camera_device, "2");
        assert_eq!(c.scale_factor, 1.1);
        assert!(c.headless);
        assert_eq!(c.baud_rate, 19200);
    }

    #[test]
    fn test_bad_env_value_ignored() {
        let mut c = Config::default();
        c.apply_env(env(&[("FACEALARM_BAUD_RATE", "fast")]));
        assert_eq!(c.baud_rate, 9600);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facealarm.toml");
        std::fs::write(&path, "window_title = \"Door\"\nmax_frames = 10\n").unwrap();
        let c = Config::load(Some(&path)).unwrap();
        assert_eq!(c.max_frames, Some(10));
        // The process environment may override the title; the frame limit has no env key.
        assert!(!c.window_title.is_empty());
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Some(Path::new("/nonexistent/facealarm.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_detection_params_from_config() {
        let c = Config {
            min_face_size: 40,
            ..Config::default()
        };
        let p = c.detection_params();
        assert_eq!(p.min_size, (40, 40));
        assert_eq!(p.scale_factor, 1.3);
        assert_eq!(p.min_neighbors, 5);
    }
}
