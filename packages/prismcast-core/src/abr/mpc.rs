//! Model-predictive control over a discretized buffer.
//!
//! Looks ahead up to five chunks, predicting per-chunk sending time from a
//! running average of recent throughput, and maximizes cumulative SSIM
//! minus switching and rebuffer penalties via memoized dynamic
//! programming. Ties break toward the lower format index, which makes the
//! selection deterministic for a fixed snapshot.

use std::collections::VecDeque;

use super::{push_history, Abr, AbrError, AbrOptions, AckedChunk, SessionView};
use crate::channel::ChunkStore;
use crate::constants::MAX_BUFFER_S;
use crate::media::VideoFormat;

const MAX_LOOKAHEAD_HORIZON: usize = 5;
const MAX_DIS_BUF_LENGTH: usize = 100;
const MAX_NUM_FORMATS: usize = 20;
const REBUFFER_LENGTH_COEFF: f64 = 100.0;
const SSIM_DIFF_COEFF: f64 = 1.0;

/// Seconds per byte assumed before any throughput history exists.
const HIGH_SENDING_TIME: f64 = 10.0;

pub struct Mpc {
    max_lookahead_horizon: usize,
    dis_buf_length: usize,
    rebuffer_length_coeff: f64,
    ssim_diff_coeff: f64,
    unit_buf_length: f64,

    /// Discretized buffer index to seconds.
    real_buffer: Vec<f64>,

    past_chunks: VecDeque<AckedChunk>,

    // per-decision state
    lookahead_horizon: usize,
    num_formats: usize,
    chunk_length: f64,
    curr_buffer: usize,
    curr_format: usize,

    /// `ssims[i][j]`: SSIM of the chunk at slot i in format j; slot 0 is
    /// the chunk preceding `next_vts`.
    ssims: Vec<Vec<f64>>,
    /// `sending_time[i][j]` in seconds, filled for slots 1..=horizon.
    sending_time: Vec<Vec<f64>>,

    // memoized value function with lazy round invalidation
    v: Vec<f64>,
    flag: Vec<u64>,
    curr_round: u64,
}

impl Mpc {
    pub fn new(options: &AbrOptions) -> Self {
        let max_lookahead_horizon = options
            .usize("max_lookahead_horizon")
            .unwrap_or(MAX_LOOKAHEAD_HORIZON)
            .min(MAX_LOOKAHEAD_HORIZON);
        let dis_buf_length = options
            .usize("dis_buf_length")
            .unwrap_or(MAX_DIS_BUF_LENGTH)
            .min(MAX_DIS_BUF_LENGTH);
        let max_buffer_s = options.f64("max_buffer_s").unwrap_or(MAX_BUFFER_S);
        let unit_buf_length = max_buffer_s / dis_buf_length as f64;

        let states = (max_lookahead_horizon + 1) * (dis_buf_length + 1) * MAX_NUM_FORMATS;

        Self {
            max_lookahead_horizon,
            dis_buf_length,
            rebuffer_length_coeff: options
                .f64("rebuffer_length_coeff")
                .unwrap_or(REBUFFER_LENGTH_COEFF),
            ssim_diff_coeff: options.f64("ssim_diff_coeff").unwrap_or(SSIM_DIFF_COEFF),
            unit_buf_length,
            real_buffer: (0..=dis_buf_length)
                .map(|i| i as f64 * unit_buf_length)
                .collect(),
            past_chunks: VecDeque::new(),
            lookahead_horizon: 0,
            num_formats: 0,
            chunk_length: 0.0,
            curr_buffer: 0,
            curr_format: 0,
            ssims: vec![vec![0.0; MAX_NUM_FORMATS]; max_lookahead_horizon + 1],
            sending_time: vec![vec![0.0; MAX_NUM_FORMATS]; max_lookahead_horizon + 1],
            v: vec![0.0; states],
            flag: vec![0; states],
            curr_round: 0,
        }
    }

    fn state_index(&self, i: usize, buf: usize, format: usize) -> usize {
        (i * (self.dis_buf_length + 1) + buf) * MAX_NUM_FORMATS + format
    }

    fn discretize_buffer(&self, buf: f64) -> usize {
        let dis = ((buf + self.unit_buf_length * 0.5) / self.unit_buf_length) as usize;
        dis.min(self.dis_buf_length)
    }

    fn reinit(&mut self, view: &SessionView, store: &ChunkStore) -> Result<(), AbrError> {
        self.curr_round += 1;

        let vformats = store.vformats();
        let vduration = u64::from(store.vduration());
        let curr_ts = view.next_vts.saturating_sub(vduration);

        self.chunk_length = f64::from(store.vduration()) / f64::from(store.timescale());
        self.num_formats = vformats.len();
        if self.num_formats == 0 || self.num_formats > MAX_NUM_FORMATS {
            return Err(AbrError::Config(format!(
                "MPC supports 1..={MAX_NUM_FORMATS} formats, channel has {}",
                self.num_formats
            )));
        }

        let frontier = store.vready_frontier(0).ok_or(AbrError::NotReady)?;
        self.lookahead_horizon = self
            .max_lookahead_horizon
            .min((frontier.saturating_sub(curr_ts) / vduration) as usize);
        if self.lookahead_horizon == 0 {
            return Err(AbrError::NotReady);
        }

        self.curr_buffer = self.discretize_buffer(view.video_playback_buf.max(0.0));

        self.curr_format = view
            .curr_vformat
            .and_then(|curr| vformats.iter().position(|&vf| vf == curr))
            .unwrap_or(0);

        // slot 0 is the chunk the client is about to play; missing entries
        // (already evicted) contribute zero utility
        for i in 0..=self.lookahead_horizon {
            let ts = curr_ts + vduration * i as u64;
            for (j, &vf) in vformats.iter().enumerate() {
                self.ssims[i][j] = store.vssim(vf, ts).unwrap_or(0.0);
            }
        }

        // per-byte sending time: observed for past chunks, then a running
        // average extended chunk by chunk into the future
        let num_past = self.past_chunks.len();
        let mut unit_st = vec![0.0; num_past + self.lookahead_horizon + 1];
        for (i, chunk) in self.past_chunks.iter().enumerate() {
            unit_st[i + 1] = chunk.trans_time_ms as f64 / chunk.size as f64 / 1000.0;
        }

        for i in 1..=self.lookahead_horizon {
            unit_st[i + num_past] = if num_past != 0 {
                let window: f64 = (0..num_past).map(|j| unit_st[i + j]).sum();
                window / num_past as f64
            } else {
                HIGH_SENDING_TIME
            };

            let ts = curr_ts + vduration * i as u64;
            let data = store
                .vdata_at(ts)
                .ok_or_else(|| AbrError::MissingData(format!("video ts {ts}")))?;
            for (j, &vf) in vformats.iter().enumerate() {
                let size = data
                    .get(&vf)
                    .ok_or_else(|| AbrError::MissingData(format!("{vf} at {ts}")))?
                    .len();
                self.sending_time[i][j] = size as f64 * unit_st[i + num_past];
            }
        }

        Ok(())
    }

    /// Computes the value of a state and returns the best next format.
    fn update_value(&mut self, i: usize, curr_buffer: usize, curr_format: usize) -> usize {
        let idx = self.state_index(i, curr_buffer, curr_format);
        self.flag[idx] = self.curr_round;

        if i == self.lookahead_horizon {
            self.v[idx] = self.ssims[i][curr_format];
            return 0;
        }

        let mut best_next_format = self.num_formats;
        let mut max_qvalue = 0.0;
        for next_format in 0..self.num_formats {
            let qvalue = self.qvalue(i, curr_buffer, curr_format, next_format);
            // strict comparison keeps the lower index on ties
            if best_next_format == self.num_formats || qvalue > max_qvalue {
                max_qvalue = qvalue;
                best_next_format = next_format;
            }
        }
        let idx = self.state_index(i, curr_buffer, curr_format);
        self.v[idx] = max_qvalue;

        best_next_format
    }

    fn qvalue(
        &mut self,
        i: usize,
        curr_buffer: usize,
        curr_format: usize,
        next_format: usize,
    ) -> f64 {
        let real_rebuffer =
            self.sending_time[i + 1][next_format] - self.real_buffer[curr_buffer];
        let next_buffer =
            self.discretize_buffer((-real_rebuffer).max(0.0) + self.chunk_length);

        self.ssims[i][curr_format]
            - self.ssim_diff_coeff
                * (self.ssims[i][curr_format] - self.ssims[i + 1][next_format]).abs()
            - self.rebuffer_length_coeff * real_rebuffer.max(0.0)
            + self.value(i + 1, next_buffer, next_format)
    }

    fn value(&mut self, i: usize, curr_buffer: usize, curr_format: usize) -> f64 {
        let idx = self.state_index(i, curr_buffer, curr_format);
        if self.flag[idx] != self.curr_round {
            self.update_value(i, curr_buffer, curr_format);
        }
        self.v[self.state_index(i, curr_buffer, curr_format)]
    }
}

impl Abr for Mpc {
    fn select_video_format(
        &mut self,
        view: &SessionView,
        store: &ChunkStore,
    ) -> Result<VideoFormat, AbrError> {
        self.reinit(view, store)?;
        let best = self.update_value(0, self.curr_buffer, self.curr_format);
        Ok(store.vformats()[best])
    }

    fn video_chunk_acked(&mut self, chunk: &AckedChunk) {
        push_history(&mut self.past_chunks, *chunk);
    }
}
