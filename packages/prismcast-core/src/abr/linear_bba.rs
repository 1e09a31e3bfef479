//! Buffer-based selection with a linear serve line between two reservoirs.

use super::{Abr, AbrError, AbrOptions, SessionView};
use crate::channel::ChunkStore;
use crate::media::VideoFormat;

const LOWER_RESERVOIR: f64 = 0.2;
const UPPER_RESERVOIR: f64 = 0.8;

pub struct LinearBba {
    lower_reservoir: f64,
    upper_reservoir: f64,
}

impl LinearBba {
    pub fn new(options: &AbrOptions) -> Self {
        Self {
            lower_reservoir: options.f64("lower_reservoir").unwrap_or(LOWER_RESERVOIR),
            upper_reservoir: options.f64("upper_reservoir").unwrap_or(UPPER_RESERVOIR),
        }
    }
}

impl Abr for LinearBba {
    fn select_video_format(
        &mut self,
        view: &SessionView,
        store: &ChunkStore,
    ) -> Result<VideoFormat, AbrError> {
        let max_buffer_s = view.max_buffer_s;
        let buf = view.video_playback_buf.clamp(0.0, max_buffer_s);
        let next_vts = view.next_vts;

        let data = store
            .vdata_at(next_vts)
            .ok_or_else(|| AbrError::MissingData(format!("video ts {next_vts}")))?;
        let ssims = store
            .vssim_at(next_vts)
            .ok_or_else(|| AbrError::MissingData(format!("ssim ts {next_vts}")))?;

        let missing = |vf: VideoFormat| AbrError::MissingData(format!("{vf} at {next_vts}"));

        // min and max chunk size for the next video ts
        let mut min: Option<(VideoFormat, usize)> = None;
        let mut max: Option<(VideoFormat, usize)> = None;
        for &vf in store.vformats() {
            let size = data.get(&vf).ok_or_else(|| missing(vf))?.len();
            if min.map_or(true, |(_, s)| size < s) {
                min = Some((vf, size));
            }
            if max.map_or(true, |(_, s)| size > s) {
                max = Some((vf, size));
            }
        }
        let (min_vf, min_size) = min.ok_or(AbrError::NotReady)?;
        let (max_vf, max_size) = max.ok_or(AbrError::NotReady)?;

        if buf >= self.upper_reservoir * max_buffer_s {
            return Ok(max_vf);
        }
        if buf <= self.lower_reservoir * max_buffer_s {
            return Ok(min_vf);
        }

        // highest SSIM among formats under the serve line
        let slope = (max_size - min_size) as f64
            / ((self.upper_reservoir - self.lower_reservoir) * max_buffer_s);
        let max_serve_size =
            min_size as f64 + slope * (buf - self.lower_reservoir * max_buffer_s);

        let mut best: Option<(VideoFormat, f64)> = None;
        for &vf in store.vformats() {
            let size = data.get(&vf).ok_or_else(|| missing(vf))?.len();
            if size as f64 > max_serve_size {
                continue;
            }
            let ssim = *ssims.get(&vf).ok_or_else(|| missing(vf))?;
            if best.map_or(true, |(_, s)| ssim > s) {
                best = Some((vf, ssim));
            }
        }

        // min_size <= max_serve_size always, so a choice exists
        Ok(best.map(|(vf, _)| vf).unwrap_or(min_vf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abr::test_support::*;

    fn bba() -> LinearBba {
        LinearBba::new(&AbrOptions::default())
    }

    /// 100 kB / 500 kB / 1000 kB at SSIMs 0.9 / 0.95 / 0.97.
    fn store() -> ChunkStore {
        store_with_chunks(
            ladder3(),
            &[(0, vec![(100_000, 0.9), (500_000, 0.95), (1_000_000, 0.97)])],
        )
    }

    #[test]
    fn empty_buffer_selects_min_size() {
        let store = store();
        let vf = bba()
            .select_video_format(&view(0.0, 10.0, 0), &store)
            .unwrap();
        assert_eq!(vf, ladder3()[0]);
        // anywhere at or below the lower reservoir behaves the same
        let vf = bba()
            .select_video_format(&view(2.0, 10.0, 0), &store)
            .unwrap();
        assert_eq!(vf, ladder3()[0]);
    }

    #[test]
    fn full_buffer_selects_max_size() {
        let store = store();
        for buf in [8.0, 10.0, 25.0] {
            let vf = bba()
                .select_video_format(&view(buf, 10.0, 0), &store)
                .unwrap();
            assert_eq!(vf, ladder3()[2]);
        }
    }

    #[test]
    fn midrange_serves_highest_ssim_under_line() {
        // buf 5 of 10: max_serve = 100k + 900k * (5-2)/6 = 550 kB -> mid
        let store = store();
        let vf = bba()
            .select_video_format(&view(5.0, 10.0, 0), &store)
            .unwrap();
        assert_eq!(vf, ladder3()[1]);
    }

    #[test]
    fn reservoirs_are_overridable() {
        let mut options = serde_yaml::Mapping::new();
        options.insert("lower_reservoir".into(), 0.5.into());
        let mut abr = LinearBba::new(&AbrOptions::new(options));

        // buf 4 of 10 is now below the lower reservoir
        let store = store();
        let vf = abr.select_video_format(&view(4.0, 10.0, 0), &store).unwrap();
        assert_eq!(vf, ladder3()[0]);
    }

    #[test]
    fn missing_chunk_is_an_error() {
        let store = store();
        assert!(matches!(
            bba().select_video_format(&view(5.0, 10.0, 180180), &store),
            Err(AbrError::MissingData(_))
        ));
    }
}
