//! Adaptive-bitrate selection.
//!
//! Each algorithm implements [`Abr`]: given a snapshot of the session and
//! the channel's chunk store, pick the video format for the next chunk.
//! Acked chunks feed throughput history back via
//! [`Abr::video_chunk_acked`]. Audio uses the fixed buffer-based selector
//! in [`select_audio_format`]; it is not pluggable.

mod bola_basic;
mod linear_bba;
mod mpc;
mod puffer;
mod ttp;

pub use bola_basic::{BolaBasic, BolaVersion};
pub use linear_bba::LinearBba;
pub use mpc::Mpc;
pub use puffer::Puffer;
pub use ttp::TtpModel;

use std::collections::VecDeque;
use std::path::PathBuf;

use thiserror::Error;

use crate::channel::ChunkStore;
use crate::media::{AudioFormat, VideoFormat};
use crate::net::TcpInfo;

#[derive(Debug, Error)]
pub enum AbrError {
    #[error("unknown ABR algorithm {0:?}")]
    UnknownAlgorithm(String),

    #[error("ABR configuration: {0}")]
    Config(String),

    #[error("no ready chunk ahead")]
    NotReady,

    #[error("chunk metadata unavailable: {0}")]
    MissingData(String),

    #[error("TTP model: {0}")]
    Model(String),
}

/// Read-only snapshot of the session state an algorithm may consult.
#[derive(Debug, Clone, Copy)]
pub struct SessionView {
    /// Client-reported video playback buffer, seconds.
    pub video_playback_buf: f64,
    /// Cap on the client's playback buffer, seconds.
    pub max_buffer_s: f64,
    /// Timestamp of the chunk being selected.
    pub next_vts: u64,
    /// Format of the most recently sent video chunk.
    pub curr_vformat: Option<VideoFormat>,
    /// Transport snapshot sampled at the last send.
    pub tcp_info: Option<TcpInfo>,
}

/// One acknowledged video chunk, as fed to throughput estimators.
#[derive(Debug, Clone, Copy)]
pub struct AckedChunk {
    pub format: VideoFormat,
    pub ssim: f64,
    /// Transmitted bytes (init + media).
    pub size: usize,
    /// Wall time from send to final ack, milliseconds.
    pub trans_time_ms: u64,
    pub tcp_info: Option<TcpInfo>,
}

/// Number of acked chunks retained for throughput estimation.
pub const MAX_NUM_PAST_CHUNKS: usize = 10;

/// Pushes an acked chunk into a bounded history window.
pub(crate) fn push_history(history: &mut VecDeque<AckedChunk>, chunk: AckedChunk) {
    history.push_back(chunk);
    if history.len() > MAX_NUM_PAST_CHUNKS {
        history.pop_front();
    }
}

/// A video quality selector bound to one session.
pub trait Abr: Send {
    fn select_video_format(
        &mut self,
        view: &SessionView,
        store: &ChunkStore,
    ) -> Result<VideoFormat, AbrError>;

    fn video_chunk_acked(&mut self, _chunk: &AckedChunk) {}
}

/// Typed access to the free-form `abr_config` mapping.
#[derive(Debug, Clone, Default)]
pub struct AbrOptions(serde_yaml::Mapping);

impl AbrOptions {
    pub fn new(map: serde_yaml::Mapping) -> Self {
        Self(map)
    }

    fn get(&self, key: &str) -> Option<&serde_yaml::Value> {
        self.0.get(&serde_yaml::Value::String(key.to_string()))
    }

    pub fn f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(serde_yaml::Value::as_f64)
    }

    pub fn usize(&self, key: &str) -> Option<usize> {
        self.get(key)
            .and_then(serde_yaml::Value::as_u64)
            .map(|v| v as usize)
    }

    pub fn path(&self, key: &str) -> Option<PathBuf> {
        self.get(key)
            .and_then(serde_yaml::Value::as_str)
            .map(PathBuf::from)
    }
}

/// Instantiates an algorithm by its configured name.
pub fn create_abr(name: &str, options: &AbrOptions) -> Result<Box<dyn Abr>, AbrError> {
    match name {
        "linear_bba" => Ok(Box::new(LinearBba::new(options))),
        "bola_basic_v1" => Ok(Box::new(BolaBasic::new(BolaVersion::V1, options))),
        "bola_basic_v2" => Ok(Box::new(BolaBasic::new(BolaVersion::V2, options))),
        "mpc" => Ok(Box::new(Mpc::new(options))),
        "puffer_raw" => Ok(Box::new(Puffer::raw(options))),
        "puffer_ttp" => Ok(Box::new(Puffer::ttp(options)?)),
        other => Err(AbrError::UnknownAlgorithm(other.to_string())),
    }
}

/// Fixed audio selector: buffer-based over chunk sizes with 0.1/0.9
/// reservoirs, choosing the largest chunk that fits under the serve line.
/// Audio carries no SSIM, so size is the only quality signal.
pub fn select_audio_format(
    audio_playback_buf: f64,
    max_buffer_s: f64,
    store: &ChunkStore,
    next_ats: u64,
) -> Result<AudioFormat, AbrError> {
    const LOWER_RESERVOIR: f64 = 0.1;
    const UPPER_RESERVOIR: f64 = 0.9;

    let data = store
        .adata_at(next_ats)
        .ok_or_else(|| AbrError::MissingData(format!("audio ts {next_ats}")))?;

    let mut sized: Vec<(AudioFormat, usize)> = Vec::with_capacity(store.aformats().len());
    for &af in store.aformats() {
        let size = data
            .get(&af)
            .ok_or_else(|| AbrError::MissingData(format!("audio {af} at {next_ats}")))?
            .len();
        sized.push((af, size));
    }

    let (min_af, min_size) = *sized
        .iter()
        .min_by_key(|(_, size)| *size)
        .expect("aformats is nonempty");
    let (max_af, max_size) = *sized
        .iter()
        .max_by_key(|(_, size)| *size)
        .expect("aformats is nonempty");

    let buf = audio_playback_buf.clamp(0.0, max_buffer_s);
    if buf <= LOWER_RESERVOIR * max_buffer_s {
        return Ok(min_af);
    }
    if buf >= UPPER_RESERVOIR * max_buffer_s {
        return Ok(max_af);
    }

    let slope =
        (max_size - min_size) as f64 / ((UPPER_RESERVOIR - LOWER_RESERVOIR) * max_buffer_s);
    let max_serve = min_size as f64 + slope * (buf - LOWER_RESERVOIR * max_buffer_s);

    let choice = sized
        .iter()
        .filter(|(_, size)| (*size as f64) <= max_serve)
        .max_by_key(|(_, size)| *size)
        .map(|(af, _)| *af)
        .unwrap_or(min_af);
    Ok(choice)
}
