//! Live chunk index for one channel.
//!
//! Maps media timestamps to per-format mapped byte spans plus SSIM values,
//! with init segments per format. Entries are born on ingest and aged out
//! by the sliding retention window.

use std::collections::BTreeMap;

use crate::media::{AudioFormat, ChunkData, VideoFormat};

/// In-memory index of a channel's encoded chunks.
///
/// All maps are ordered by timestamp so frontier scans iterate newest
/// first. Mutation (ingest, eviction) and reads are serialized by the
/// owning channel's lock, so a reader holding the guard observes one
/// consistent snapshot.
pub struct ChunkStore {
    vformats: Vec<VideoFormat>,
    aformats: Vec<AudioFormat>,

    timescale: u32,
    vduration: u32,
    aduration: u32,

    fixed_init_vts: Option<u64>,
    clean_time_window: Option<u64>,

    vinit: BTreeMap<VideoFormat, ChunkData>,
    ainit: BTreeMap<AudioFormat, ChunkData>,

    vdata: BTreeMap<u64, BTreeMap<VideoFormat, ChunkData>>,
    vssim: BTreeMap<u64, BTreeMap<VideoFormat, f64>>,
    adata: BTreeMap<u64, BTreeMap<AudioFormat, ChunkData>>,

    vclean_frontier: Option<u64>,
    aclean_frontier: Option<u64>,
}

impl ChunkStore {
    pub fn new(
        vformats: Vec<VideoFormat>,
        aformats: Vec<AudioFormat>,
        timescale: u32,
        vduration: u32,
        aduration: u32,
        fixed_init_vts: Option<u64>,
        clean_time_window: Option<u64>,
    ) -> Self {
        Self {
            vformats,
            aformats,
            timescale,
            vduration,
            aduration,
            fixed_init_vts,
            clean_time_window,
            vinit: BTreeMap::new(),
            ainit: BTreeMap::new(),
            vdata: BTreeMap::new(),
            vssim: BTreeMap::new(),
            adata: BTreeMap::new(),
            vclean_frontier: None,
            aclean_frontier: None,
        }
    }

    pub fn vformats(&self) -> &[VideoFormat] {
        &self.vformats
    }

    pub fn aformats(&self) -> &[AudioFormat] {
        &self.aformats
    }

    pub fn timescale(&self) -> u32 {
        self.timescale
    }

    pub fn vduration(&self) -> u32 {
        self.vduration
    }

    pub fn aduration(&self) -> u32 {
        self.aduration
    }

    pub fn is_valid_vts(&self, ts: u64) -> bool {
        ts % u64::from(self.vduration) == 0
    }

    pub fn is_valid_ats(&self, ts: u64) -> bool {
        ts % u64::from(self.aduration) == 0
    }

    /// Largest video timestamp evicted so far.
    pub fn vclean_frontier(&self) -> Option<u64> {
        self.vclean_frontier
    }

    /// Largest audio timestamp evicted so far.
    pub fn aclean_frontier(&self) -> Option<u64> {
        self.aclean_frontier
    }

    // ── readiness ───────────────────────────────────────────────────────

    /// A video timestamp is ready when every configured format has data and
    /// SSIM for it, and every format's init segment is present.
    pub fn vready(&self, ts: u64) -> bool {
        let data_complete = self
            .vdata
            .get(&ts)
            .is_some_and(|m| m.len() == self.vformats.len());
        let ssim_complete = self
            .vssim
            .get(&ts)
            .is_some_and(|m| m.len() == self.vformats.len());
        data_complete && ssim_complete && self.vinit.len() == self.vformats.len()
    }

    pub fn aready(&self, ts: u64) -> bool {
        let data_complete = self
            .adata
            .get(&ts)
            .is_some_and(|m| m.len() == self.aformats.len());
        data_complete && self.ainit.len() == self.aformats.len()
    }

    /// The `n`-th most recent ready video timestamp, scanning newest first.
    pub fn vready_frontier(&self, n: usize) -> Option<u64> {
        self.vdata
            .keys()
            .rev()
            .filter(|&&ts| self.vready(ts))
            .nth(n)
            .copied()
    }

    pub fn aready_frontier(&self, n: usize) -> Option<u64> {
        self.adata
            .keys()
            .rev()
            .filter(|&&ts| self.aready(ts))
            .nth(n)
            .copied()
    }

    /// Starting video timestamp for a new session: the configured fixed vts
    /// when present, otherwise a ready timestamp far enough behind the live
    /// edge to leave `max_playback_buf_s` of slack.
    pub fn init_vts(&self, max_playback_buf_s: f64) -> Option<u64> {
        if let Some(fixed) = self.fixed_init_vts {
            return Some(fixed);
        }
        let chunks =
            (max_playback_buf_s * f64::from(self.timescale) / f64::from(self.vduration)).ceil();
        self.vready_frontier(chunks as usize + 1)
    }

    /// Audio timestamp aligned at or below the given video timestamp.
    pub fn find_ats(&self, vts: u64) -> u64 {
        (vts / u64::from(self.aduration)) * u64::from(self.aduration)
    }

    // ── accessors ───────────────────────────────────────────────────────

    pub fn vinit(&self, format: VideoFormat) -> Option<&ChunkData> {
        self.vinit.get(&format)
    }

    pub fn ainit(&self, format: AudioFormat) -> Option<&ChunkData> {
        self.ainit.get(&format)
    }

    pub fn vdata_at(&self, ts: u64) -> Option<&BTreeMap<VideoFormat, ChunkData>> {
        self.vdata.get(&ts)
    }

    pub fn vdata(&self, format: VideoFormat, ts: u64) -> Option<&ChunkData> {
        self.vdata.get(&ts)?.get(&format)
    }

    pub fn vssim_at(&self, ts: u64) -> Option<&BTreeMap<VideoFormat, f64>> {
        self.vssim.get(&ts)
    }

    pub fn vssim(&self, format: VideoFormat, ts: u64) -> Option<f64> {
        self.vssim.get(&ts)?.get(&format).copied()
    }

    pub fn adata_at(&self, ts: u64) -> Option<&BTreeMap<AudioFormat, ChunkData>> {
        self.adata.get(&ts)
    }

    pub fn adata(&self, format: AudioFormat, ts: u64) -> Option<&ChunkData> {
        self.adata.get(&ts)?.get(&format)
    }

    pub fn vdata_timestamps(&self) -> impl Iterator<Item = u64> + '_ {
        self.vdata.keys().copied()
    }

    // ── ingest ──────────────────────────────────────────────────────────
    //
    // Idempotent for (ts, format): re-ingesting replaces the mapping, so a
    // startup scan racing the watcher never double-inserts.

    pub fn insert_vinit(&mut self, format: VideoFormat, data: ChunkData) {
        self.vinit.insert(format, data);
    }

    pub fn insert_ainit(&mut self, format: AudioFormat, data: ChunkData) {
        self.ainit.insert(format, data);
    }

    pub fn insert_vdata(&mut self, ts: u64, format: VideoFormat, data: ChunkData) {
        // never resurrect a timestamp behind the clean frontier; a late
        // arrival for an evicted chunk is stale by definition
        if self.vclean_frontier.is_some_and(|f| ts <= f) {
            return;
        }
        self.evict_video(ts);
        self.vdata.entry(ts).or_default().insert(format, data);
    }

    pub fn insert_vssim(&mut self, ts: u64, format: VideoFormat, ssim: f64) {
        if self.vclean_frontier.is_some_and(|f| ts <= f) {
            return;
        }
        self.vssim.entry(ts).or_default().insert(format, ssim);
    }

    pub fn insert_adata(&mut self, ts: u64, format: AudioFormat, data: ChunkData) {
        if self.aclean_frontier.is_some_and(|f| ts <= f) {
            return;
        }
        self.evict_audio(ts);
        self.adata.entry(ts).or_default().insert(format, data);
    }

    // ── eviction ────────────────────────────────────────────────────────

    /// Drops video data and SSIM entries that have aged past the retention
    /// window relative to `latest_ts`, advancing the clean frontier.
    pub fn evict_video(&mut self, latest_ts: u64) {
        let Some(window) = self.clean_time_window else {
            return;
        };
        if latest_ts < window {
            return;
        }
        let obsolete = latest_ts - window;

        // split_off keeps entries > obsolete; the rest unmap on drop
        self.vdata = self.vdata.split_off(&(obsolete + 1));
        self.vssim = self.vssim.split_off(&(obsolete + 1));

        if self.vclean_frontier.map_or(true, |f| f < obsolete) {
            self.vclean_frontier = Some(obsolete);
        }
    }

    pub fn evict_audio(&mut self, latest_ts: u64) {
        let Some(window) = self.clean_time_window else {
            return;
        };
        if latest_ts < window {
            return;
        }
        let obsolete = latest_ts - window;

        self.adata = self.adata.split_off(&(obsolete + 1));

        if self.aclean_frontier.map_or(true, |f| f < obsolete) {
            self.aclean_frontier = Some(obsolete);
        }
    }
}
