//! Server and channel configuration.
//!
//! Loaded from a YAML file; the binary applies CLI overrides on top. Media
//! layout per channel follows the encoder pipeline contract:
//! `<media_dir>/<channel>/ready/<format>/` directories receive chunks via
//! atomic rename.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::constants::{DEFAULT_IDLE_TIMEOUT_S, DEFAULT_SEND_HIGH_WATERMARK, DEFAULT_SEND_MAX};
use crate::media::{AudioFormat, VideoFormat};

/// Error loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("channel {0} is listed but has no entry in channel_configs")]
    MissingChannelConfig(String),

    #[error("channel {channel}: {reason}")]
    InvalidChannel { channel: String, reason: String },
}

/// Top-level server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Root directory holding one subdirectory per channel.
    pub media_dir: PathBuf,

    /// Channels to serve, in presentation order.
    pub channels: Vec<String>,

    /// Per-channel media configuration, keyed by channel name.
    pub channel_configs: HashMap<String, ChannelConfig>,

    /// Base WebSocket port; the bound port is `ws_base_port + server_id`.
    pub ws_base_port: u16,

    /// ABR algorithm name (linear_bba, bola_basic_v1, bola_basic_v2, mpc,
    /// puffer_raw, puffer_ttp).
    #[serde(default = "default_abr")]
    pub abr: String,

    /// Free-form options passed to the ABR constructor.
    #[serde(default)]
    pub abr_config: serde_yaml::Mapping,

    /// Seconds without a client message before a graceful close.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_s: u64,

    /// Send-buffer backpressure threshold in bytes.
    #[serde(default = "default_send_high_watermark")]
    pub send_high_watermark: usize,

    /// Send-buffer hard limit in bytes; exceeding it sheds the connection.
    #[serde(default = "default_send_max")]
    pub send_max: usize,
}

fn default_abr() -> String {
    "linear_bba".to_string()
}

fn default_idle_timeout() -> u64 {
    DEFAULT_IDLE_TIMEOUT_S
}

fn default_send_high_watermark() -> usize {
    DEFAULT_SEND_HIGH_WATERMARK
}

fn default_send_max() -> usize {
    DEFAULT_SEND_MAX
}

/// Media configuration for a single channel.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    /// Output directory of the encoder pipeline for this channel.
    /// Defaults to `<media_dir>/<channel>`.
    #[serde(default)]
    pub output: Option<PathBuf>,

    /// Encoding ladder: resolution string ("1280x720") to CRF list.
    pub video: BTreeMap<String, Vec<u8>>,

    /// Audio bitrates, e.g. ["64k", "128k"].
    pub audio: Vec<String>,

    pub video_codec: String,
    pub audio_codec: String,

    /// Media ticks per second.
    pub timescale: u32,

    /// Ticks per video chunk.
    pub video_duration: u32,

    /// Ticks per audio chunk.
    pub audio_duration: u32,

    /// Fixed starting video timestamp; when absent the live ready frontier
    /// chooses the start point.
    #[serde(default)]
    pub init_vts: Option<u64>,

    /// Sliding retention window in ticks; data older than
    /// `latest - clean_time_window` is evicted.
    #[serde(default)]
    pub clean_time_window: Option<u64>,
}

impl ChannelConfig {
    /// Parses and sorts the video ladder, smallest format first.
    pub fn vformats(&self, channel: &str) -> Result<Vec<VideoFormat>, ConfigError> {
        let mut formats = Vec::new();
        for (resolution, crfs) in &self.video {
            for crf in crfs {
                let s = format!("{resolution}-{crf}");
                let vf = s.parse().map_err(|_| ConfigError::InvalidChannel {
                    channel: channel.to_string(),
                    reason: format!("bad video format {s}"),
                })?;
                formats.push(vf);
            }
        }
        if formats.is_empty() {
            return Err(ConfigError::InvalidChannel {
                channel: channel.to_string(),
                reason: "no video formats configured".to_string(),
            });
        }
        formats.sort();
        Ok(formats)
    }

    /// Parses and sorts the audio bitrates.
    pub fn aformats(&self, channel: &str) -> Result<Vec<AudioFormat>, ConfigError> {
        let mut formats = Vec::new();
        for s in &self.audio {
            let af = s.parse().map_err(|_| ConfigError::InvalidChannel {
                channel: channel.to_string(),
                reason: format!("bad audio format {s}"),
            })?;
            formats.push(af);
        }
        if formats.is_empty() {
            return Err(ConfigError::InvalidChannel {
                channel: channel.to_string(),
                reason: "no audio formats configured".to_string(),
            });
        }
        formats.sort();
        Ok(formats)
    }

    /// Resolves the channel's output directory.
    pub fn output_dir(&self, media_dir: &Path, channel: &str) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| media_dir.join(channel))
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file and validates channel wiring.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for channel in &self.channels {
            let cfg = self
                .channel_configs
                .get(channel)
                .ok_or_else(|| ConfigError::MissingChannelConfig(channel.clone()))?;

            cfg.vformats(channel)?;
            cfg.aformats(channel)?;

            if cfg.timescale == 0 || cfg.video_duration == 0 || cfg.audio_duration == 0 {
                return Err(ConfigError::InvalidChannel {
                    channel: channel.clone(),
                    reason: "timescale and durations must be nonzero".to_string(),
                });
            }

            if let Some(init_vts) = cfg.init_vts {
                if init_vts % u64::from(cfg.video_duration) != 0 {
                    return Err(ConfigError::InvalidChannel {
                        channel: channel.clone(),
                        reason: format!(
                            "init_vts {init_vts} is not a multiple of video_duration {}",
                            cfg.video_duration
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
media_dir: /srv/media
channels: [abc]
ws_base_port: 50000
channel_configs:
  abc:
    video:
      1280x720: [20, 26]
      854x480: [24]
    audio: [64k, 128k]
    video_codec: video/mp4; codecs="avc1.42E020"
    audio_codec: audio/webm; codecs="opus"
    timescale: 90000
    video_duration: 180180
    audio_duration: 432000
    clean_time_window: 5405400
"#;

    fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn loads_and_validates_sample() {
        let (_dir, path) = write_config(SAMPLE);
        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.channels, vec!["abc"]);
        assert_eq!(config.ws_base_port, 50000);
        assert_eq!(config.abr, "linear_bba");
        assert_eq!(config.idle_timeout_s, DEFAULT_IDLE_TIMEOUT_S);

        let cfg = &config.channel_configs["abc"];
        let vformats = cfg.vformats("abc").unwrap();
        assert_eq!(vformats.len(), 3);
        // sorted smallest resolution first
        assert_eq!(vformats[0], VideoFormat::new(854, 480, 24));
        assert_eq!(cfg.aformats("abc").unwrap().len(), 2);
        assert_eq!(
            cfg.output_dir(Path::new("/srv/media"), "abc"),
            PathBuf::from("/srv/media/abc")
        );
    }

    #[test]
    fn rejects_channel_without_config() {
        let (_dir, path) = write_config(
            "media_dir: /m\nchannels: [missing]\nws_base_port: 1\nchannel_configs: {}\n",
        );
        assert!(matches!(
            ServerConfig::load(&path),
            Err(ConfigError::MissingChannelConfig(_))
        ));
    }

    #[test]
    fn rejects_misaligned_init_vts() {
        let bad = SAMPLE.replace("clean_time_window: 5405400", "init_vts: 1000");
        let (_dir, path) = write_config(&bad);
        assert!(matches!(
            ServerConfig::load(&path),
            Err(ConfigError::InvalidChannel { .. })
        ));
    }

    #[test]
    fn rejects_unparsable_yaml() {
        let (_dir, path) = write_config("not yaml ][[");
        assert!(matches!(
            ServerConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
