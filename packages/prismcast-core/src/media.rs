//! Media format identifiers and wire-ready segment views.
//!
//! A [`VideoFormat`] is one rung of a channel's encoding ladder
//! (`1280x720-23`); an [`AudioFormat`] is an audio bitrate (`128k`).
//! [`MediaSegment`] presents an optional init segment concatenated with a
//! media chunk as a single byte range for transmission.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use memmap2::Mmap;
use thiserror::Error;

/// Error parsing a media format string.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid media format: {0}")]
pub struct FormatParseError(pub String);

/// One video encoding: resolution plus CRF, e.g. `1280x720-23`.
///
/// Ordered by (width, height, crf) so a channel's format ladder sorts
/// smallest to largest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VideoFormat {
    pub width: u16,
    pub height: u16,
    pub crf: u8,
}

impl VideoFormat {
    pub fn new(width: u16, height: u16, crf: u8) -> Self {
        Self { width, height, crf }
    }

    /// Resolution part only, e.g. `1280x720`.
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

impl fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}-{}", self.width, self.height, self.crf)
    }
}

impl FromStr for VideoFormat {
    type Err = FormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || FormatParseError(s.to_string());

        let (resolution, crf) = s.split_once('-').ok_or_else(err)?;
        let (width, height) = resolution.split_once('x').ok_or_else(err)?;

        Ok(Self {
            width: width.parse().map_err(|_| err())?,
            height: height.parse().map_err(|_| err())?,
            crf: crf.parse().map_err(|_| err())?,
        })
    }
}

/// One audio encoding: bitrate in kbps, e.g. `128k`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AudioFormat {
    pub bitrate: u32,
}

impl AudioFormat {
    pub fn new(bitrate: u32) -> Self {
        Self { bitrate }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}k", self.bitrate)
    }
}

impl FromStr for AudioFormat {
    type Err = FormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bitrate = s
            .strip_suffix('k')
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| FormatParseError(s.to_string()))?;
        Ok(Self { bitrate })
    }
}

/// A read-only, shared byte span backed by a memory-mapped file.
///
/// The mapping is owned by the chunk store; cloning the handle is an Arc
/// bump. Dispatch copies the bytes into outbound frames synchronously, so
/// the store may drop the mapping as soon as the entry is evicted.
#[derive(Clone)]
pub struct ChunkData {
    map: Arc<Mmap>,
}

impl ChunkData {
    pub fn new(map: Mmap) -> Self {
        Self { map: Arc::new(map) }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }
}

impl fmt::Debug for ChunkData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkData").field("len", &self.len()).finish()
    }
}

/// A media chunk viewed as init-segment bytes (when present) followed by
/// the chunk bytes, readable in bounded pieces for framing.
pub struct MediaSegment {
    init: Option<ChunkData>,
    data: ChunkData,
    offset: usize,
}

impl MediaSegment {
    pub fn new(data: ChunkData, init: Option<ChunkData>) -> Self {
        Self { init, data, offset: 0 }
    }

    /// Total bytes across init and media.
    pub fn total_len(&self) -> usize {
        self.data.len() + self.init.as_ref().map_or(0, ChunkData::len)
    }

    /// Current read offset into the concatenated view.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.total_len() - self.offset
    }

    /// Copies up to `n` bytes from the current offset into a fresh buffer,
    /// advancing the offset. Returns an empty vec once exhausted.
    pub fn read(&mut self, n: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n.min(self.remaining()));

        let init_len = self.init.as_ref().map_or(0, ChunkData::len);
        if self.offset < init_len {
            let init = self.init.as_ref().expect("offset within init implies init");
            let take = n.min(init_len - self.offset);
            out.extend_from_slice(&init.as_slice()[self.offset..self.offset + take]);
            self.offset += take;
            if out.len() >= n {
                return out;
            }
        }

        let data_offset = self.offset - init_len;
        let take = (n - out.len()).min(self.data.len() - data_offset);
        out.extend_from_slice(&self.data.as_slice()[data_offset..data_offset + take]);
        self.offset += take;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(bytes: &[u8]) -> ChunkData {
        let mut map = memmap2::MmapMut::map_anon(bytes.len()).unwrap();
        map.copy_from_slice(bytes);
        ChunkData::new(map.make_read_only().unwrap())
    }

    #[test]
    fn video_format_roundtrip() {
        let vf: VideoFormat = "1280x720-23".parse().unwrap();
        assert_eq!(vf, VideoFormat::new(1280, 720, 23));
        assert_eq!(vf.to_string(), "1280x720-23");
        assert_eq!(vf.resolution(), "1280x720");
    }

    #[test]
    fn video_format_rejects_garbage() {
        assert!("1280x720".parse::<VideoFormat>().is_err());
        assert!("1280-23".parse::<VideoFormat>().is_err());
        assert!("axb-c".parse::<VideoFormat>().is_err());
        assert!("".parse::<VideoFormat>().is_err());
    }

    #[test]
    fn video_format_orders_by_resolution_then_crf() {
        let mut ladder = vec![
            VideoFormat::new(1920, 1080, 23),
            VideoFormat::new(426, 240, 26),
            VideoFormat::new(1280, 720, 20),
            VideoFormat::new(1280, 720, 26),
        ];
        ladder.sort();
        assert_eq!(ladder[0], VideoFormat::new(426, 240, 26));
        assert_eq!(ladder[1], VideoFormat::new(1280, 720, 20));
        assert_eq!(ladder[2], VideoFormat::new(1280, 720, 26));
        assert_eq!(ladder[3], VideoFormat::new(1920, 1080, 23));
    }

    #[test]
    fn audio_format_roundtrip() {
        let af: AudioFormat = "128k".parse().unwrap();
        assert_eq!(af.bitrate, 128);
        assert_eq!(af.to_string(), "128k");
        assert!("128".parse::<AudioFormat>().is_err());
    }

    #[test]
    fn segment_reads_init_then_data() {
        let mut seg = MediaSegment::new(chunk(b"efgh"), Some(chunk(b"abcd")));
        assert_eq!(seg.total_len(), 8);

        assert_eq!(seg.read(3), b"abc");
        // A read spanning the init/data boundary yields bytes from both.
        assert_eq!(seg.read(3), b"def");
        assert_eq!(seg.read(16), b"gh");
        assert_eq!(seg.remaining(), 0);
    }

    #[test]
    fn segment_without_init() {
        let mut seg = MediaSegment::new(chunk(b"xyz"), None);
        assert_eq!(seg.total_len(), 3);
        assert_eq!(seg.read(3), b"xyz");
        assert_eq!(seg.remaining(), 0);
        assert!(seg.read(8).is_empty());
    }
}
