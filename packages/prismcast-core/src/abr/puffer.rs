//! Stochastic lookahead control (the Puffer family).
//!
//! Shares the MPC value-function shape but integrates the rebuffer and
//! continuation terms over a predicted distribution of sending times per
//! (slot, format). The distribution comes from a pluggable estimator:
//! `Raw` centers a geometric spread on a throughput-history mean, `Ttp`
//! consults one learned transmission-time predictor per horizon.

use std::collections::VecDeque;

use super::ttp::{TtpModel, TTP_INPUT_DIM};
use super::{push_history, Abr, AbrError, AbrOptions, AckedChunk, SessionView};
use crate::channel::ChunkStore;
use crate::constants::MAX_BUFFER_S;
use crate::media::VideoFormat;

const MAX_LOOKAHEAD_HORIZON: usize = 5;
const MAX_DIS_BUF_LENGTH: usize = 100;
const MAX_NUM_FORMATS: usize = 20;
const REBUFFER_LENGTH_COEFF: f64 = 100.0;
const SSIM_DIFF_COEFF: f64 = 1.0;
const UNIT_BUF_LENGTH: f64 = 0.25;
const MAX_DIS_SENDING_TIME: usize = 40;
const ST_PROB_EPS: f64 = 1e-5;
const ST_VAR_COEFF: f64 = 0.7;

/// Seconds per byte assumed by the raw estimator before any history.
const RAW_HIGH_SENDING_TIME: f64 = 10000.0;

enum Estimator {
    Raw { st_var_coeff: f64 },
    Ttp { models: Vec<TtpModel> },
}

pub struct Puffer {
    max_lookahead_horizon: usize,
    dis_buf_length: usize,
    dis_sending_time: usize,
    unit_buf_length: f64,
    rebuffer_length_coeff: f64,
    ssim_diff_coeff: f64,
    st_prob_eps: f64,

    past_chunks: VecDeque<AckedChunk>,
    estimator: Estimator,

    // per-decision state
    lookahead_horizon: usize,
    num_formats: usize,
    dis_chunk_length: usize,
    curr_buffer: usize,

    /// `ssims[i][j]`; row 0 holds only the last acked SSIM at index 0.
    ssims: Vec<Vec<f64>>,
    /// `sending_time_prob[i][j][st]`, filled for slots 1..=horizon.
    sending_time_prob: Vec<Vec<Vec<f64>>>,
    /// Formats excluded at a slot because even their mean bucket saturates.
    is_ban: Vec<Vec<bool>>,

    v: Vec<f64>,
    flag: Vec<u64>,
    curr_round: u64,
}

impl Puffer {
    /// Geometric spread around the observed mean bucket.
    pub fn raw(options: &AbrOptions) -> Self {
        let st_var_coeff = options.f64("st_var_coeff").unwrap_or(ST_VAR_COEFF);
        Self::build(options, Estimator::Raw { st_var_coeff })
    }

    /// Learned per-horizon transmission-time predictors. `model_dir` is
    /// required; there is deliberately no default path.
    pub fn ttp(options: &AbrOptions) -> Result<Self, AbrError> {
        let model_dir = options
            .path("model_dir")
            .ok_or_else(|| AbrError::Config("puffer_ttp requires model_dir".to_string()))?;

        let max_lookahead_horizon = options
            .usize("max_lookahead_horizon")
            .unwrap_or(MAX_LOOKAHEAD_HORIZON)
            .min(MAX_LOOKAHEAD_HORIZON);

        let mut models = Vec::with_capacity(max_lookahead_horizon);
        for i in 0..max_lookahead_horizon {
            let model = TtpModel::load(
                &model_dir.join(format!("cpp-{i}.pt")),
                &model_dir.join(format!("cpp-meta-{i}.json")),
            )?;
            models.push(model);
        }

        Ok(Self::build(options, Estimator::Ttp { models }))
    }

    fn build(options: &AbrOptions, estimator: Estimator) -> Self {
        let max_lookahead_horizon = options
            .usize("max_lookahead_horizon")
            .unwrap_or(MAX_LOOKAHEAD_HORIZON)
            .min(MAX_LOOKAHEAD_HORIZON);
        let unit_buf_length = UNIT_BUF_LENGTH;
        let max_buffer_s = options.f64("max_buffer_s").unwrap_or(MAX_BUFFER_S);
        let dis_buf_length = MAX_DIS_BUF_LENGTH
            .min(discretize(max_buffer_s, unit_buf_length));
        let dis_sending_time = MAX_DIS_SENDING_TIME;

        let states = (max_lookahead_horizon + 1) * (dis_buf_length + 1) * MAX_NUM_FORMATS;

        Self {
            max_lookahead_horizon,
            dis_buf_length,
            dis_sending_time,
            unit_buf_length,
            rebuffer_length_coeff: options
                .f64("rebuffer_length_coeff")
                .unwrap_or(REBUFFER_LENGTH_COEFF),
            ssim_diff_coeff: options.f64("ssim_diff_coeff").unwrap_or(SSIM_DIFF_COEFF),
            st_prob_eps: ST_PROB_EPS,
            past_chunks: VecDeque::new(),
            estimator,
            lookahead_horizon: 0,
            num_formats: 0,
            dis_chunk_length: 0,
            curr_buffer: 0,
            ssims: vec![vec![0.0; MAX_NUM_FORMATS]; max_lookahead_horizon + 1],
            sending_time_prob: vec![
                vec![vec![0.0; dis_sending_time + 1]; MAX_NUM_FORMATS];
                max_lookahead_horizon + 1
            ],
            is_ban: vec![vec![false; MAX_NUM_FORMATS]; max_lookahead_horizon + 1],
            v: vec![0.0; states],
            flag: vec![0; states],
            curr_round: 0,
        }
    }

    fn state_index(&self, i: usize, buf: usize, format: usize) -> usize {
        (i * (self.dis_buf_length + 1) + buf) * MAX_NUM_FORMATS + format
    }

    fn discretize_buffer(&self, buf: f64) -> usize {
        discretize(buf, self.unit_buf_length)
    }

    fn reinit(&mut self, view: &SessionView, store: &ChunkStore) -> Result<(), AbrError> {
        self.curr_round += 1;

        let vformats = store.vformats();
        let vduration = u64::from(store.vduration());
        let next_ts = view.next_vts;

        self.dis_chunk_length = self
            .discretize_buffer(f64::from(store.vduration()) / f64::from(store.timescale()));
        self.num_formats = vformats.len();
        if self.num_formats == 0 || self.num_formats > MAX_NUM_FORMATS {
            return Err(AbrError::Config(format!(
                "puffer supports 1..={MAX_NUM_FORMATS} formats, channel has {}",
                self.num_formats
            )));
        }

        let frontier = store.vready_frontier(0).ok_or(AbrError::NotReady)?;
        if frontier < next_ts {
            return Err(AbrError::NotReady);
        }
        self.lookahead_horizon = self
            .max_lookahead_horizon
            .min(((frontier - next_ts) / vduration) as usize + 1);

        self.curr_buffer = self
            .dis_buf_length
            .min(self.discretize_buffer(view.video_playback_buf));

        self.ssims[0][0] = self.past_chunks.back().map_or(0.0, |c| c.ssim);
        for i in 1..=self.lookahead_horizon {
            let ts = next_ts + vduration * (i as u64 - 1);
            for (j, &vf) in vformats.iter().enumerate() {
                self.ssims[i][j] = store.vssim(vf, ts).unwrap_or(0.0);
            }
        }

        self.reinit_sending_time(view, store)
    }

    /// Chunk sizes in bytes for every slot/format; slots with missing data
    /// fall back to an effectively unsendable size.
    fn chunk_sizes(&self, view: &SessionView, store: &ChunkStore) -> Vec<Vec<Option<f64>>> {
        let vduration = u64::from(store.vduration());
        let mut sizes = vec![vec![None; self.num_formats]; self.lookahead_horizon + 1];
        for (i, row) in sizes.iter_mut().enumerate().skip(1) {
            let ts = view.next_vts + vduration * (i as u64 - 1);
            for (j, &vf) in store.vformats().iter().enumerate() {
                row[j] = store.vdata(vf, ts).map(|d| d.len() as f64);
            }
        }
        sizes
    }

    fn reinit_sending_time(
        &mut self,
        view: &SessionView,
        store: &ChunkStore,
    ) -> Result<(), AbrError> {
        match &self.estimator {
            Estimator::Raw { st_var_coeff } => {
                let coeff = *st_var_coeff;
                self.reinit_sending_time_raw(coeff, view, store);
                Ok(())
            }
            Estimator::Ttp { .. } => self.reinit_sending_time_ttp(view, store),
        }
    }

    fn reinit_sending_time_raw(&mut self, st_var_coeff: f64, view: &SessionView, store: &ChunkStore) {
        let sizes = self.chunk_sizes(view, store);
        let num_past = self.past_chunks.len();

        let mut unit_st = vec![0.0; num_past + self.lookahead_horizon + 1];
        for (i, chunk) in self.past_chunks.iter().enumerate() {
            unit_st[i + 1] = chunk.trans_time_ms as f64 / chunk.size as f64 / 1000.0;
        }

        for i in 1..=self.lookahead_horizon {
            unit_st[i + num_past] = if num_past != 0 {
                (0..num_past).map(|j| unit_st[i + j]).sum::<f64>() / num_past as f64
            } else {
                RAW_HIGH_SENDING_TIME
            };

            let send_time = |j: usize| {
                sizes[i][j].map_or(RAW_HIGH_SENDING_TIME, |s| s * unit_st[i + num_past])
            };

            let mut is_all_ban = true;
            for j in 0..self.num_formats {
                let dis_st = discretize(send_time(j), self.unit_buf_length)
                    .min(self.dis_sending_time);
                if dis_st == self.dis_sending_time {
                    self.is_ban[i][j] = true;
                    continue;
                }
                self.is_ban[i][j] = false;
                is_all_ban = false;

                let pmf = spread_geometric(
                    dis_st,
                    self.dis_sending_time,
                    st_var_coeff,
                    self.st_prob_eps,
                );
                self.sending_time_prob[i][j].copy_from_slice(&pmf);
            }

            // when every format saturates, keep the cheapest one available
            // with all its probability pinned to the last bucket
            if is_all_ban {
                let min_id = (0..self.num_formats)
                    .min_by(|&a, &b| send_time(a).total_cmp(&send_time(b)))
                    .expect("at least one format");
                self.is_ban[i][min_id] = false;
                let probs = &mut self.sending_time_prob[i][min_id];
                probs.fill(0.0);
                probs[self.dis_sending_time] = 1.0;
            }
        }
    }

    fn reinit_sending_time_ttp(
        &mut self,
        view: &SessionView,
        store: &ChunkStore,
    ) -> Result<(), AbrError> {
        let sizes = self.chunk_sizes(view, store);
        let history = self.history_features(view);

        let Estimator::Ttp { models } = &self.estimator else {
            unreachable!("ttp reinit with non-ttp estimator");
        };

        // predict first, then commit, so the estimator borrow ends before
        // the probability tables are written
        let mut pmfs: Vec<Vec<Option<Vec<f64>>>> =
            vec![vec![None; self.num_formats]; self.lookahead_horizon + 1];
        for i in 1..=self.lookahead_horizon {
            let model = &models[i - 1];
            if model.output_dim() != self.dis_sending_time + 1 {
                return Err(AbrError::Model(format!(
                    "horizon {i} model outputs {} buckets, expected {}",
                    model.output_dim(),
                    self.dis_sending_time + 1
                )));
            }
            for j in 0..self.num_formats {
                let Some(size) = sizes[i][j] else { continue };
                let mut input = history.clone();
                input.push(size / 1e6);
                debug_assert_eq!(input.len(), TTP_INPUT_DIM);
                pmfs[i][j] = Some(model.predict_pmf(&input)?);
            }
        }

        for i in 1..=self.lookahead_horizon {
            let mut is_all_ban = true;
            let mut expected_st = vec![f64::INFINITY; self.num_formats];

            for j in 0..self.num_formats {
                let Some(pmf) = &pmfs[i][j] else {
                    self.is_ban[i][j] = true;
                    continue;
                };
                let mean: f64 = pmf.iter().enumerate().map(|(st, &p)| st as f64 * p).sum();
                expected_st[j] = mean;

                if mean.round() as usize >= self.dis_sending_time {
                    self.is_ban[i][j] = true;
                    continue;
                }
                self.is_ban[i][j] = false;
                is_all_ban = false;
                self.sending_time_prob[i][j].copy_from_slice(pmf);
            }

            if is_all_ban {
                let min_id = (0..self.num_formats)
                    .min_by(|&a, &b| expected_st[a].total_cmp(&expected_st[b]))
                    .expect("at least one format");
                self.is_ban[i][min_id] = false;
                let probs = &mut self.sending_time_prob[i][min_id];
                probs.fill(0.0);
                probs[self.dis_sending_time] = 1.0;
            }
        }
        Ok(())
    }

    /// First 61 input features: 8 past chunks x (size, time, 5 TCP fields)
    /// followed by the current TCP snapshot. The caller appends the
    /// candidate chunk size to reach [`TTP_INPUT_DIM`].
    fn history_features(&self, view: &SessionView) -> Vec<f64> {
        const HISTORY_SLOTS: usize = 8;
        let mut x = Vec::with_capacity(TTP_INPUT_DIM);

        let start = self.past_chunks.len().saturating_sub(HISTORY_SLOTS);
        let recent: Vec<&AckedChunk> = self.past_chunks.iter().skip(start).collect();
        for slot in 0..HISTORY_SLOTS {
            let pad = HISTORY_SLOTS - recent.len();
            match slot.checked_sub(pad).and_then(|idx| recent.get(idx)) {
                Some(chunk) => {
                    let tcp = chunk.tcp_info.unwrap_or_default();
                    x.push(chunk.size as f64 / 1e6);
                    x.push(chunk.trans_time_ms as f64 / 1e3);
                    x.push(f64::from(tcp.cwnd));
                    x.push(f64::from(tcp.in_flight));
                    x.push(f64::from(tcp.min_rtt_us) / 1e6);
                    x.push(f64::from(tcp.rtt_us) / 1e6);
                    x.push(tcp.delivery_rate as f64 / 1e6);
                }
                None => x.extend([0.0; 7]),
            }
        }

        let tcp = view.tcp_info.unwrap_or_default();
        x.push(f64::from(tcp.cwnd));
        x.push(f64::from(tcp.in_flight));
        x.push(f64::from(tcp.min_rtt_us) / 1e6);
        x.push(f64::from(tcp.rtt_us) / 1e6);
        x.push(tcp.delivery_rate as f64 / 1e6);
        x
    }

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
            if self.is_ban[i + 1][next_format] {
                continue;
            }
            let qvalue = self.qvalue(i, curr_buffer, curr_format, next_format);
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
        let mut ans = self.ssims[i][curr_format]
            - self.ssim_diff_coeff
                * (self.ssims[i][curr_format] - self.ssims[i + 1][next_format]).abs();

        for st in 0..=self.dis_sending_time {
            let prob = self.sending_time_prob[i + 1][next_format][st];
            if prob < self.st_prob_eps {
                continue;
            }

            let rebuffer = st as i64 - curr_buffer as i64;
            let next_buffer = self
                .dis_buf_length
                .min((-rebuffer).max(0) as usize + self.dis_chunk_length);
            let mut real_rebuffer = rebuffer.max(0) as f64 * self.unit_buf_length;
            if curr_buffer == st {
                // exact drain: soften the penalty
                real_rebuffer *= 0.25;
            }

            ans += prob
                * (self.value(i + 1, next_buffer, next_format)
                    - self.rebuffer_length_coeff * real_rebuffer);
        }

        ans
    }

    fn value(&mut self, i: usize, curr_buffer: usize, curr_format: usize) -> f64 {
        let idx = self.state_index(i, curr_buffer, curr_format);
        if self.flag[idx] != self.curr_round {
            self.update_value(i, curr_buffer, curr_format);
        }
        self.v[self.state_index(i, curr_buffer, curr_format)]
    }
}

impl Abr for Puffer {
    fn select_video_format(
        &mut self,
        view: &SessionView,
        store: &ChunkStore,
    ) -> Result<VideoFormat, AbrError> {
        self.reinit(view, store)?;
        let best = self.update_value(0, self.curr_buffer, 0);
        Ok(store.vformats()[best])
    }

    fn video_chunk_acked(&mut self, chunk: &AckedChunk) {
        push_history(&mut self.past_chunks, *chunk);
    }
}

fn discretize(value: f64, unit: f64) -> usize {
    ((value + unit * 0.5) / unit) as usize
}

/// Probability 1 at the mean bucket, spread geometrically to both sides,
/// truncated below `eps` and renormalized.
fn spread_geometric(dis_st: usize, dis_sending_time: usize, coeff: f64, eps: f64) -> Vec<f64> {
    let mut prob = vec![0.0; dis_sending_time + 1];
    prob[dis_st] = 1.0;

    let mut total = 1.0;
    let mut k = 1;
    while dis_st + k <= dis_sending_time && dis_st >= k {
        prob[dis_st + k] = prob[dis_st + k - 1] * coeff;
        prob[dis_st - k] = prob[dis_st - k + 1] * coeff;

        if prob[dis_st + k] < eps {
            prob[dis_st + k] = 0.0;
        }
        if prob[dis_st - k] < eps {
            prob[dis_st - k] = 0.0;
        }

        total += prob[dis_st + k] + prob[dis_st - k];
        k += 1;
    }

    for p in &mut prob {
        *p /= total;
    }
    prob
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abr::test_support::*;
    use crate::abr::ttp::test_support::write_model_pair;

    const VDUR: u64 = VDURATION as u64;

    fn lookahead_store() -> ChunkStore {
        let per = vec![(100_000, 0.91), (400_000, 0.955), (900_000, 0.978)];
        let chunks: Vec<(u64, Vec<(usize, f64)>)> =
            (0..6).map(|i| (i * VDUR, per.clone())).collect();
        store_with_chunks(ladder3(), &chunks)
    }

    fn acked(size: usize, trans_time_ms: u64) -> AckedChunk {
        AckedChunk {
            format: ladder3()[1],
            ssim: 0.95,
            size,
            trans_time_ms,
            tcp_info: None,
        }
    }

    #[test]
    fn spread_sums_to_one_and_peaks_at_mean() {
        for dis_st in [0usize, 1, 5, 20, 39] {
            let pmf = spread_geometric(dis_st, MAX_DIS_SENDING_TIME, ST_VAR_COEFF, ST_PROB_EPS);
            let sum: f64 = pmf.iter().sum();
            assert!((sum - 1.0).abs() < 1e-9, "dis_st={dis_st}");
            let argmax = pmf
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .unwrap()
                .0;
            assert_eq!(argmax, dis_st);
        }
    }

    #[test]
    fn raw_without_history_falls_back_to_smallest() {
        // no throughput history saturates every bucket, so all formats ban
        // and the rescue keeps the cheapest pinned to the last bucket
        let store = lookahead_store();
        let mut abr = Puffer::raw(&AbrOptions::default());
        let vf = abr
            .select_video_format(&view(5.0, MAX_BUFFER_S, VDUR), &store)
            .unwrap();
        assert_eq!(vf, ladder3()[0]);
    }

    #[test]
    fn raw_with_fast_history_and_deep_buffer_goes_high() {
        let store = lookahead_store();
        let mut abr = Puffer::raw(&AbrOptions::default());
        for _ in 0..8 {
            abr.video_chunk_acked(&acked(900_000, 90));
        }
        let vf = abr
            .select_video_format(&view(14.0, MAX_BUFFER_S, VDUR), &store)
            .unwrap();
        assert_eq!(vf, ladder3()[2]);
    }

    #[test]
    fn raw_is_deterministic() {
        let store = lookahead_store();
        let mut abr = Puffer::raw(&AbrOptions::default());
        abr.video_chunk_acked(&acked(400_000, 900));
        let v = view(7.0, MAX_BUFFER_S, VDUR);
        assert_eq!(
            abr.select_video_format(&v, &store).unwrap(),
            abr.select_video_format(&v, &store).unwrap()
        );
    }

    #[test]
    fn fails_when_frontier_is_behind() {
        let per = vec![(100_000, 0.91), (400_000, 0.955), (900_000, 0.978)];
        let store = store_with_chunks(ladder3(), &[(0, per)]);
        let mut abr = Puffer::raw(&AbrOptions::default());
        // next_vts beyond the only ready chunk
        assert!(matches!(
            abr.select_video_format(&view(5.0, MAX_BUFFER_S, VDUR), &store),
            Err(AbrError::NotReady)
        ));
    }

    #[test]
    fn ttp_requires_model_dir() {
        assert!(matches!(
            Puffer::ttp(&AbrOptions::default()),
            Err(AbrError::Config(_))
        ));
    }

    #[test]
    fn ttp_selects_with_fast_models() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..MAX_LOOKAHEAD_HORIZON {
            // every model predicts a fast send (bucket 1)
            write_model_pair(dir.path(), i, MAX_DIS_SENDING_TIME + 1, 1);
        }
        let mut options = serde_yaml::Mapping::new();
        options.insert(
            "model_dir".into(),
            dir.path().to_str().unwrap().into(),
        );
        let mut abr = Puffer::ttp(&AbrOptions::new(options)).unwrap();

        let store = lookahead_store();
        let vf = abr
            .select_video_format(&view(14.0, MAX_BUFFER_S, VDUR), &store)
            .unwrap();
        // fast predictions plus a deep buffer favor the top rung
        assert_eq!(vf, ladder3()[2]);
    }

    #[test]
    fn ttp_rejects_models_with_wrong_bucket_count() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..MAX_LOOKAHEAD_HORIZON {
            write_model_pair(dir.path(), i, 10, 1);
        }
        let mut options = serde_yaml::Mapping::new();
        options.insert(
            "model_dir".into(),
            dir.path().to_str().unwrap().into(),
        );
        let mut abr = Puffer::ttp(&AbrOptions::new(options)).unwrap();

        let store = lookahead_store();
        assert!(matches!(
            abr.select_video_format(&view(5.0, MAX_BUFFER_S, VDUR), &store),
            Err(AbrError::Model(_))
        ));
    }
}
