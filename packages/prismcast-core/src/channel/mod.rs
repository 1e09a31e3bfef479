//! Channel data plane: per-channel chunk stores fed by filesystem events.
//!
//! The encoder pipeline drops finished files into `ready/<format>/`
//! directories via atomic rename. Each [`Channel`] scans those directories
//! at startup and watches them for rename-in events, memory-mapping media
//! files and parsing SSIM sidecars into its [`ChunkStore`].

mod registry;
mod store;

pub use registry::ChannelRegistry;
pub use store::ChunkStore;

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use memmap2::Mmap;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use thiserror::Error;

use crate::config::ChannelConfig;
use crate::media::{AudioFormat, ChunkData, VideoFormat};

/// Error constructing a channel or its watches.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel {channel}: cannot read media directory {path}: {source}")]
    MediaDir {
        channel: String,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("channel {channel}: filesystem watch failed: {source}")]
    Watch {
        channel: String,
        source: notify::Error,
    },

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

/// What a watched directory contains, and for which format.
#[derive(Debug, Clone, Copy)]
enum IngestKind {
    VideoMedia(VideoFormat),
    VideoSsim(VideoFormat),
    AudioMedia(AudioFormat),
}

/// One live channel: immutable identity plus the locked chunk store and the
/// watcher keeping it fed.
pub struct Channel {
    name: String,
    vcodec: String,
    acodec: String,

    store: RwLock<ChunkStore>,

    /// Watched directory to its content classification.
    dirs: HashMap<PathBuf, IngestKind>,

    /// Held for its lifetime; dropping it cancels the watches.
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl Channel {
    /// Builds the channel: scans existing files under `ready/` and
    /// registers move-in watches on every format directory.
    pub fn new(
        name: &str,
        config: &ChannelConfig,
        media_dir: &Path,
    ) -> Result<Arc<Self>, ChannelError> {
        let vformats = config.vformats(name)?;
        let aformats = config.aformats(name)?;
        let ready_dir = config.output_dir(media_dir, name).join("ready");

        let mut dirs = HashMap::new();
        for &vf in &vformats {
            dirs.insert(ready_dir.join(vf.to_string()), IngestKind::VideoMedia(vf));
            dirs.insert(
                ready_dir.join(format!("{vf}-ssim")),
                IngestKind::VideoSsim(vf),
            );
        }
        for &af in &aformats {
            dirs.insert(ready_dir.join(af.to_string()), IngestKind::AudioMedia(af));
        }

        let store = ChunkStore::new(
            vformats,
            aformats,
            config.timescale,
            config.video_duration,
            config.audio_duration,
            config.init_vts,
            config.clean_time_window,
        );

        let channel = Arc::new(Self {
            name: name.to_string(),
            vcodec: config.video_codec.clone(),
            acodec: config.audio_codec.clone(),
            store: RwLock::new(store),
            dirs,
            watcher: Mutex::new(None),
        });

        // Watch before scanning: an ingest racing the scan is harmless
        // because ingest is idempotent per (ts, format), but a file landing
        // between scan and watch would be lost.
        let weak = Arc::downgrade(&channel);
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let Ok(event) = res else { return };
                if let Some(channel) = Weak::upgrade(&weak) {
                    channel.handle_event(&event);
                }
            },
            notify::Config::default(),
        )
        .map_err(|source| ChannelError::Watch {
            channel: name.to_string(),
            source,
        })?;

        for dir in channel.dirs.keys() {
            watcher
                .watch(dir, RecursiveMode::NonRecursive)
                .map_err(|source| ChannelError::Watch {
                    channel: name.to_string(),
                    source,
                })?;
        }
        *channel.watcher.lock() = Some(watcher);

        for (dir, &kind) in &channel.dirs {
            let entries = std::fs::read_dir(dir).map_err(|source| ChannelError::MediaDir {
                channel: name.to_string(),
                path: dir.clone(),
                source,
            })?;
            for entry in entries.flatten() {
                channel.ingest(&entry.path(), kind);
            }
        }

        log::info!(
            "[{}] channel up: {} video formats, {} audio formats, ready dir {}",
            channel.name,
            channel.read().vformats().len(),
            channel.read().aformats().len(),
            ready_dir.display()
        );

        Ok(channel)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vcodec(&self) -> &str {
        &self.vcodec
    }

    pub fn acodec(&self) -> &str {
        &self.acodec
    }

    /// Read access to the chunk store. Holding the guard pins a consistent
    /// snapshot: ingest and eviction wait until it is released.
    pub fn read(&self) -> RwLockReadGuard<'_, ChunkStore> {
        self.store.read()
    }

    fn handle_event(&self, event: &Event) {
        // Only files moved into a watched directory count as complete; the
        // encoder contract is atomic rename. Plain creates are accepted too
        // since ingest is idempotent and some filesystems report renames as
        // creates.
        let relevant = matches!(
            event.kind,
            EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Any))
                | EventKind::Create(_)
        );
        if !relevant {
            return;
        }

        for path in &event.paths {
            let Some(kind) = path.parent().and_then(|dir| self.dirs.get(dir)) else {
                continue;
            };
            if path.is_dir() {
                continue;
            }
            self.ingest(path, *kind);
        }
    }

    /// Loads one file into the store. Parsing or I/O failures are logged
    /// and skipped; the chunk simply stays not-ready.
    fn ingest(&self, path: &Path, kind: IngestKind) {
        let result = match kind {
            IngestKind::VideoMedia(vf) => self.ingest_video(path, vf),
            IngestKind::VideoSsim(vf) => self.ingest_ssim(path, vf),
            IngestKind::AudioMedia(af) => self.ingest_audio(path, af),
        };
        if let Err(reason) = result {
            log::warn!("[{}] skipping {}: {}", self.name, path.display(), reason);
        }
    }

    fn ingest_video(&self, path: &Path, vf: VideoFormat) -> Result<(), String> {
        if stem(path) == Some("init") {
            let data = map_file(path)?;
            log::info!("[{}] video init: {}", self.name, path.display());
            self.store.write().insert_vinit(vf, data);
            return Ok(());
        }

        if extension(path) != Some("m4s") {
            return Ok(());
        }
        let ts = parse_ts(path)?;
        let data = map_file(path)?;

        let mut store = self.store.write();
        if !store.is_valid_vts(ts) {
            return Err(format!("timestamp {ts} not aligned to video duration"));
        }
        log::debug!("[{}] video chunk: {}", self.name, path.display());
        store.insert_vdata(ts, vf, data);
        Ok(())
    }

    fn ingest_ssim(&self, path: &Path, vf: VideoFormat) -> Result<(), String> {
        if extension(path) != Some("ssim") {
            return Ok(());
        }
        let ts = parse_ts(path)?;
        let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        let ssim: f64 = content
            .trim()
            .parse()
            .map_err(|_| format!("bad ssim value {:?}", content.trim()))?;

        let mut store = self.store.write();
        if !store.is_valid_vts(ts) {
            return Err(format!("timestamp {ts} not aligned to video duration"));
        }
        log::debug!("[{}] ssim: {}", self.name, path.display());
        store.insert_vssim(ts, vf, ssim);
        Ok(())
    }

    fn ingest_audio(&self, path: &Path, af: AudioFormat) -> Result<(), String> {
        if stem(path) == Some("init") {
            let data = map_file(path)?;
            log::info!("[{}] audio init: {}", self.name, path.display());
            self.store.write().insert_ainit(af, data);
            return Ok(());
        }

        if extension(path) != Some("chk") {
            return Ok(());
        }
        let ts = parse_ts(path)?;
        let data = map_file(path)?;

        let mut store = self.store.write();
        if !store.is_valid_ats(ts) {
            return Err(format!("timestamp {ts} not aligned to audio duration"));
        }
        log::debug!("[{}] audio chunk: {}", self.name, path.display());
        store.insert_adata(ts, af, data);
        Ok(())
    }
}

fn stem(path: &Path) -> Option<&str> {
    path.file_stem().and_then(|s| s.to_str())
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|s| s.to_str())
}

fn parse_ts(path: &Path) -> Result<u64, String> {
    stem(path)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| "file stem is not a timestamp".to_string())
}

fn map_file(path: &Path) -> Result<ChunkData, String> {
    let file = File::open(path).map_err(|e| e.to_string())?;
    // Read-only shared mapping; the encoder never rewrites a published file.
    let map = unsafe { Mmap::map(&file) }.map_err(|e| e.to_string())?;
    Ok(ChunkData::new(map))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::path::Path;

    pub const TIMESCALE: u32 = 90000;
    pub const VDURATION: u32 = 180180;
    pub const ADURATION: u32 = 432000;

    pub fn channel_config() -> ChannelConfig {
        ChannelConfig {
            output: None,
            video: [
                ("854x480".to_string(), vec![24]),
                ("1280x720".to_string(), vec![23]),
            ]
            .into_iter()
            .collect(),
            audio: vec!["128k".to_string()],
            video_codec: "video/mp4; codecs=\"avc1.42E020\"".to_string(),
            audio_codec: "audio/webm; codecs=\"opus\"".to_string(),
            timescale: TIMESCALE,
            video_duration: VDURATION,
            audio_duration: ADURATION,
            init_vts: None,
            clean_time_window: None,
        }
    }

    /// Lays out the ready/ directory tree the encoder would produce.
    pub fn make_media_tree(root: &Path, channel: &str, config: &ChannelConfig) {
        let ready = root.join(channel).join("ready");
        for (res, crfs) in &config.video {
            for crf in crfs {
                std::fs::create_dir_all(ready.join(format!("{res}-{crf}"))).unwrap();
                std::fs::create_dir_all(ready.join(format!("{res}-{crf}-ssim"))).unwrap();
            }
        }
        for af in &config.audio {
            std::fs::create_dir_all(ready.join(af)).unwrap();
        }
    }

    /// Publishes a file the way the encoder does: write elsewhere, then
    /// rename into the watched directory.
    pub fn publish(dir: &Path, name: &str, contents: &[u8]) {
        let staging = dir.parent().unwrap().join(format!(".{name}.tmp"));
        std::fs::write(&staging, contents).unwrap();
        std::fs::rename(&staging, dir.join(name)).unwrap();
    }

    pub fn publish_video_ts(ready: &Path, config: &ChannelConfig, ts: u64) {
        for (res, crfs) in &config.video {
            for crf in crfs {
                publish(&ready.join(format!("{res}-{crf}")), &format!("{ts}.m4s"), b"media");
                publish(
                    &ready.join(format!("{res}-{crf}-ssim")),
                    &format!("{ts}.ssim"),
                    b"0.953",
                );
            }
        }
    }

    pub fn publish_inits(ready: &Path, config: &ChannelConfig) {
        for (res, crfs) in &config.video {
            for crf in crfs {
                publish(&ready.join(format!("{res}-{crf}")), "init.mp4", b"vinit");
            }
        }
        for af in &config.audio {
            publish(&ready.join(af), "init.webm", b"ainit");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use std::time::{Duration, Instant};

    fn wait_until(mut pred: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if pred() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn startup_scan_ingests_existing_files() {
        let config = channel_config();
        let dir = tempfile::tempdir().unwrap();
        make_media_tree(dir.path(), "abc", &config);
        let ready = dir.path().join("abc/ready");

        publish_inits(&ready, &config);
        publish_video_ts(&ready, &config, 0);
        publish_video_ts(&ready, &config, u64::from(VDURATION));
        publish(&ready.join("128k"), "0.chk", b"audio");

        let channel = Channel::new("abc", &config, dir.path()).unwrap();
        let store = channel.read();
        assert!(store.vready(0));
        assert!(store.vready(u64::from(VDURATION)));
        assert!(store.aready(0));
        assert_eq!(store.vready_frontier(0), Some(u64::from(VDURATION)));
        assert!((store.vssim(VideoFormat::new(854, 480, 24), 0).unwrap() - 0.953).abs() < 1e-9);
    }

    #[test]
    fn watcher_picks_up_renamed_in_files() {
        let config = channel_config();
        let dir = tempfile::tempdir().unwrap();
        make_media_tree(dir.path(), "abc", &config);
        let ready = dir.path().join("abc/ready");

        let channel = Channel::new("abc", &config, dir.path()).unwrap();
        assert!(!channel.read().vready(0));

        publish_inits(&ready, &config);
        publish_video_ts(&ready, &config, 0);

        assert!(
            wait_until(|| channel.read().vready(0)),
            "watcher never delivered the published chunk"
        );
    }

    #[test]
    fn corrupt_files_are_skipped_not_fatal() {
        let config = channel_config();
        let dir = tempfile::tempdir().unwrap();
        make_media_tree(dir.path(), "abc", &config);
        let ready = dir.path().join("abc/ready");

        publish_inits(&ready, &config);
        // garbage ssim value, misaligned timestamp, non-media extension
        publish(&ready.join("854x480-24-ssim"), "0.ssim", b"not-a-float");
        publish(&ready.join("854x480-24"), "12345.m4s", b"misaligned");
        publish(&ready.join("854x480-24"), "notes.txt", b"ignored");

        let channel = Channel::new("abc", &config, dir.path()).unwrap();
        let store = channel.read();
        assert!(store.vssim(VideoFormat::new(854, 480, 24), 0).is_none());
        assert!(store.vdata_at(12345).is_none());
    }

    #[test]
    fn missing_ready_directory_is_an_error() {
        let config = channel_config();
        let dir = tempfile::tempdir().unwrap();
        assert!(Channel::new("abc", &config, dir.path()).is_err());
    }
}
