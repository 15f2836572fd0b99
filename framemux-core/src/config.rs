//! Encoder session configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::EncoderError;
use crate::hw::HwAccel;
use crate::timebase::Rational;

/// Bytes per pixel of the packed BGR input frames.
pub const BGR_BYTES_PER_PIXEL: usize = 3;

/// Keyframe interval used when the config does not name one.
pub const DEFAULT_GOP_SIZE: u32 = 15;

/// Container used for network streaming.
pub const STREAM_FORMAT: &str = "flv";

/// Where the muxed output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Local file; the container is inferred from the path.
    #[default]
    File,
    /// Network URL (RTMP and friends), always muxed as FLV.
    Stream,
}

/// Free-form codec options applied when the codec is opened.
///
/// Kept ordered by key so options are applied deterministically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodecOptions(BTreeMap<String, String>);

impl CodecOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for CodecOptions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Everything needed to open one encode session.
///
/// Input frames are packed BGR, 3 bytes per pixel, row-major, no padding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub src_width: u32,
    pub src_height: u32,
    pub dst_width: u32,
    pub dst_height: u32,
    pub fps: f64,
    /// Target bitrate in bits per second. Zero leaves it to the codec.
    pub bitrate: u64,
    pub codec_name: String,
    /// File path or network URL.
    pub output: String,
    pub mode: OutputMode,
    pub gop_size: u32,
    pub codec_options: CodecOptions,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            src_width: 1280,
            src_height: 720,
            dst_width: 1280,
            dst_height: 720,
            fps: 30.0,
            bitrate: 2_000_000,
            codec_name: "libx264".into(),
            output: "out.mp4".into(),
            mode: OutputMode::File,
            gop_size: DEFAULT_GOP_SIZE,
            codec_options: CodecOptions::new(),
        }
    }
}

impl EncoderConfig {
    pub fn set_mode_file(&mut self) -> &mut Self {
        self.mode = OutputMode::File;
        self
    }

    pub fn set_mode_stream(&mut self) -> &mut Self {
        self.mode = OutputMode::Stream;
        self
    }

    /// Exact byte length of one input frame.
    pub fn frame_len(&self) -> usize {
        self.src_width as usize * self.src_height as usize * BGR_BYTES_PER_PIXEL
    }

    /// Forced container name, if the mode implies one.
    pub fn container_format(&self) -> Option<&'static str> {
        match self.mode {
            OutputMode::Stream => Some(STREAM_FORMAT),
            OutputMode::File => None,
        }
    }

    /// Hardware acceleration implied by the codec name.
    pub fn hardware(&self) -> Option<HwAccel> {
        HwAccel::from_codec_name(&self.codec_name)
    }

    /// Reject configs no backend could open.
    pub fn validate(&self) -> Result<(), EncoderError> {
        if self.src_width == 0 || self.src_height == 0 {
            return Err(EncoderError::InvalidConfig(format!(
                "source dimensions must be non-zero, got {}x{}",
                self.src_width, self.src_height
            )));
        }
        if self.dst_width == 0 || self.dst_height == 0 {
            return Err(EncoderError::InvalidConfig(format!(
                "destination dimensions must be non-zero, got {}x{}",
                self.dst_width, self.dst_height
            )));
        }
        if !self.fps.is_finite() || self.fps <= 0.0 {
            return Err(EncoderError::InvalidConfig(format!(
                "fps must be positive, got {}",
                self.fps
            )));
        }
        if Rational::from_fps(self.fps).num == 0 {
            return Err(EncoderError::InvalidConfig(format!(
                "fps {} is too low to express as a frame rate",
                self.fps
            )));
        }
        if self.codec_name.trim().is_empty() {
            return Err(EncoderError::InvalidConfig("codec name is empty".into()));
        }
        if self.output.trim().is_empty() {
            return Err(EncoderError::InvalidConfig("output is empty".into()));
        }
        if self.gop_size == 0 {
            return Err(EncoderError::InvalidConfig("gop size must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = EncoderConfig::default();
        config.validate().unwrap();
        assert_eq!(config.frame_len(), 1280 * 720 * 3);
        assert_eq!(config.gop_size, 15);
    }

    #[test]
    fn zero_dimensions_rejected() {
        let config = EncoderConfig {
            src_width: 0,
            ..EncoderConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EncoderError::InvalidConfig(_))
        ));

        let config = EncoderConfig {
            dst_height: 0,
            ..EncoderConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn non_positive_fps_rejected() {
        for fps in [0.0, -30.0, f64::NAN, f64::INFINITY] {
            let config = EncoderConfig {
                fps,
                ..EncoderConfig::default()
            };
            assert!(config.validate().is_err(), "fps {fps} accepted");
        }
    }

    #[test]
    fn fps_rounding_to_zero_rejected() {
        let config = EncoderConfig {
            fps: 0.0004,
            ..EncoderConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EncoderError::InvalidConfig(_))
        ));
        let config = EncoderConfig {
            fps: 0.01,
            ..EncoderConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn mode_setters_pick_container() {
        let mut config = EncoderConfig::default();
        assert_eq!(config.container_format(), None);
        config.set_mode_stream();
        assert_eq!(config.container_format(), Some("flv"));
        config.set_mode_file();
        assert_eq!(config.mode, OutputMode::File);
    }

    #[test]
    fn codec_options_are_key_ordered() {
        let mut options = CodecOptions::new();
        options.set("tune", "zerolatency").set("preset", "ultrafast");
        let keys: Vec<_> = options.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["preset", "tune"]);
        assert_eq!(options.get("tune"), Some("zerolatency"));
    }

    #[test]
    fn config_toml_roundtrip() {
        let mut config = EncoderConfig {
            codec_name: "h264_vaapi".into(),
            output: "rtmp://localhost/live/test".into(),
            mode: OutputMode::Stream,
            ..EncoderConfig::default()
        };
        config.codec_options.set("preset", "fast");
        let text = toml::to_string(&config).unwrap();
        assert!(text.contains("mode = \"stream\""));
        let back: EncoderConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, config);
        assert!(back.hardware().is_some());
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let config: EncoderConfig = toml::from_str("fps = 25.0\ncodec_name = \"mpeg4\"").unwrap();
        assert_eq!(config.fps, 25.0);
        assert_eq!(config.src_width, 1280);
        assert_eq!(config.gop_size, DEFAULT_GOP_SIZE);
    }
}
