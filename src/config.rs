//! Configuration management for QuadStretch

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::transform::{RectifyOptions, TargetRect};

/// One camera of the pair
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CameraConfig {
    pub device: String,
    pub width: u32,
    pub height: u32,
}

impl CameraConfig {
    fn with_device(device: &str) -> Self {
        Self {
            device: device.to_string(),
            width: 640,
            height: 480,
        }
    }
}

/// Capture timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptureConfig {
    /// Give up on a camera after this many milliseconds
    pub timeout_ms: u64,
    /// Frames discarded before the kept one
    pub warmup_frames: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            warmup_frames: 3,
        }
    }
}

impl CaptureConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Default corner placement when none are marked
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CornersConfig {
    /// Inset from each image edge, in pixels
    pub offset: f64,
}

impl Default for CornersConfig {
    fn default() -> Self {
        Self { offset: 50.0 }
    }
}

/// Where results are written
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    pub directory: PathBuf,
    /// Also write the captured frames with their corners marked
    pub save_captures: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("stretched"),
            save_captures: true,
        }
    }
}

fn default_cameras() -> [CameraConfig; 2] {
    [
        CameraConfig::with_device("/dev/video0"),
        CameraConfig::with_device("/dev/video1"),
    ]
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub target: TargetRect,

    #[serde(default)]
    pub rectify: RectifyOptions,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default = "default_cameras")]
    pub cameras: [CameraConfig; 2],

    #[serde(default)]
    pub corners: CornersConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: TargetRect::default(),
            rectify: RectifyOptions::default(),
            capture: CaptureConfig::default(),
            cameras: default_cameras(),
            corners: CornersConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a file, or create default if it doesn't exist
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config from {:?}", path))?;
            config.validate()
                .with_context(|| format!("Invalid configuration in {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!("Created default configuration at {:?}", path);
            Ok(config)
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.target.check()?;
        if self.capture.timeout_ms == 0 {
            bail!("capture.timeout_ms must be positive");
        }
        let offset = self.corners.offset;
        if !(offset.is_finite() && offset > 0.0) {
            bail!("corners.offset must be a positive number");
        }
        for camera in &self.cameras {
            if 2.0 * offset >= camera.width.min(camera.height) as f64 {
                bail!("corners.offset {} does not fit the {}x{} frames of {}",
                    offset, camera.width, camera.height, camera.device);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::Interpolation;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.target, TargetRect { width: 300, height: 400 });
        assert_eq!(config.rectify.interpolation, Interpolation::Bilinear);
        assert_eq!(config.cameras[1].device, "/dev/video1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_create_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("stretch.toml");

        let created = Config::load_or_create(&path).unwrap();
        assert!(path.exists());

        let loaded = Config::load_or_create(&path).unwrap();
        assert_eq!(created, loaded);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stretch.toml");
        std::fs::write(
            &path,
            "[target]\nwidth = 640\nheight = 200\n\n[rectify]\ninterpolation = \"nearest\"\n",
        )
        .unwrap();

        let config = Config::load_or_create(&path).unwrap();
        assert_eq!(config.target, TargetRect { width: 640, height: 200 });
        assert_eq!(config.rectify.interpolation, Interpolation::Nearest);
        assert_eq!(config.rectify.background, [0, 0, 0]);
        assert_eq!(config.capture, CaptureConfig::default());
    }

    #[test]
    fn test_corner_offset_bounds() {
        let mut config = Config::default();

        config.corners.offset = 0.0;
        assert!(config.validate().is_err());

        // 640x480 cameras: the inset must leave room below 240
        config.corners.offset = 240.0;
        assert!(config.validate().is_err());

        config.corners.offset = 239.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_target_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stretch.toml");
        std::fs::write(&path, "[target]\nwidth = 0\nheight = 400\n").unwrap();

        assert!(Config::load_or_create(&path).is_err());
    }
}
