//! BOLA-BASIC with statically derived control parameters.
//!
//! V and gamma come from the closed form over the min/max buffer levels:
//! at the min buffer the objectives of the two smallest rungs intersect,
//! and at the max buffer the objective of the highest utility reaches
//! zero. Two variants differ only in the utility function: v1 scores SSIM
//! in decibels against the best rung of a static ladder, v2 uses the raw
//! SSIM index against the maximum possible utility.

use super::{Abr, AbrError, AbrOptions, SessionView};
use crate::channel::ChunkStore;
use crate::constants::{ssim_db, MAX_BUFFER_S};
use crate::media::VideoFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BolaVersion {
    V1,
    V2,
}

/// Static size/SSIM ladders (averages over past encodings), used only to
/// derive the control parameters. Nondecreasing; the smallest size is
/// strictly below the next.
const NFORMATS: usize = 10;

const SIZE_LADDER_BYTES: [f64; NFORMATS] = [
    44319.0, 93355.0, 115601.0, 142904.0, 196884.0, 263965.0, 353752.0, 494902.0, 632193.0,
    889893.0,
];

const SSIM_INDEX_LADDER: [f64; NFORMATS] = [
    0.91050748, 0.94062527, 0.94806355, 0.95498943, 0.96214503, 0.96717277, 0.97273958,
    0.97689813, 0.98004106, 0.98332605,
];

const MIN_BUF_S: f64 = 3.0;

/// V' and gamma', both already multiplied by the chunk duration p.
#[derive(Debug, Clone, Copy)]
struct Parameters {
    vp: f64,
    gp: f64,
}

struct Encoded {
    vf: VideoFormat,
    size: f64,
    utility: f64,
}

pub struct BolaBasic {
    version: BolaVersion,
    params: Parameters,
}

impl BolaBasic {
    pub fn new(version: BolaVersion, options: &AbrOptions) -> Self {
        let max_buf_s = options.f64("max_buffer_s").unwrap_or(MAX_BUFFER_S);
        Self {
            version,
            params: Self::calculate_params(version, max_buf_s),
        }
    }

    fn utility(version: BolaVersion, raw_ssim: f64) -> f64 {
        match version {
            BolaVersion::V1 => ssim_db(raw_ssim),
            BolaVersion::V2 => raw_ssim,
        }
    }

    /// Size and buffer units cancel out of gamma as long as they are
    /// consistent; utility units do not.
    fn calculate_params(version: BolaVersion, max_buf_s: f64) -> Parameters {
        let smallest = (SIZE_LADDER_BYTES[0], Self::utility(version, SSIM_INDEX_LADDER[0]));
        let second = (SIZE_LADDER_BYTES[1], Self::utility(version, SSIM_INDEX_LADDER[1]));
        let largest_utility = Self::utility(version, SSIM_INDEX_LADDER[NFORMATS - 1]);

        let size_delta = second.0 - smallest.0;

        // v1 uses the best utility in the static ladder; v2 the maximum
        // possible utility
        let utility_high = match version {
            BolaVersion::V1 => largest_utility,
            BolaVersion::V2 => Self::utility(version, 1.0),
        };

        let gp = (max_buf_s * (second.0 * smallest.1 - smallest.0 * second.1)
            - utility_high * MIN_BUF_S * size_delta)
            / ((MIN_BUF_S - max_buf_s) * size_delta);

        let vp = max_buf_s / (utility_high + gp);

        Parameters { vp, gp }
    }

    /// The paper's objective, evaluated with V rather than V'.
    fn objective(&self, encoded: &Encoded, client_buf_chunks: f64, chunk_duration_s: f64) -> f64 {
        let v = self.params.vp / chunk_duration_s;
        (v * (encoded.utility + self.params.gp) - client_buf_chunks) / encoded.size
    }
}

impl Abr for BolaBasic {
    fn select_video_format(
        &mut self,
        view: &SessionView,
        store: &ChunkStore,
    ) -> Result<VideoFormat, AbrError> {
        let chunk_duration_s = f64::from(store.vduration()) / f64::from(store.timescale());
        let client_buf_chunks = view.video_playback_buf.max(0.0) / chunk_duration_s;
        let next_vts = view.next_vts;

        let data = store
            .vdata_at(next_vts)
            .ok_or_else(|| AbrError::MissingData(format!("video ts {next_vts}")))?;
        let ssims = store
            .vssim_at(next_vts)
            .ok_or_else(|| AbrError::MissingData(format!("ssim ts {next_vts}")))?;

        let mut encoded_formats = Vec::with_capacity(store.vformats().len());
        for &vf in store.vformats() {
            let missing = || AbrError::MissingData(format!("{vf} at {next_vts}"));
            encoded_formats.push(Encoded {
                vf,
                size: data.get(&vf).ok_or_else(missing)?.len() as f64,
                utility: Self::utility(self.version, *ssims.get(&vf).ok_or_else(missing)?),
            });
        }
        if encoded_formats.is_empty() {
            return Err(AbrError::NotReady);
        }

        let max_obj = encoded_formats
            .iter()
            .max_by(|a, b| {
                self.objective(a, client_buf_chunks, chunk_duration_s)
                    .total_cmp(&self.objective(b, client_buf_chunks, chunk_duration_s))
            })
            .expect("nonempty formats");
        let max_obj_value = self.objective(max_obj, client_buf_chunks, chunk_duration_s);

        // v1 always takes the max objective; v2 falls back to the highest
        // scaled utility when even the best objective has gone negative
        if self.version == BolaVersion::V1 || max_obj_value >= 0.0 {
            Ok(max_obj.vf)
        } else {
            Ok(encoded_formats
                .iter()
                .max_by(|a, b| {
                    (a.utility + self.params.gp).total_cmp(&(b.utility + self.params.gp))
                })
                .expect("nonempty formats")
                .vf)
        }
    }
}
