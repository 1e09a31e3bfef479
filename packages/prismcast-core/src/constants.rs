//! Protocol and dispatch constants.
//!
//! Values here are either fixed by the wire protocol (changing them breaks
//! deployed players) or are dispatch-loop defaults that the server config
//! can override.

/// Maximum playback buffer (seconds) the player accumulates. The server
/// treats it as a cap on dispatch: no new video chunk is sent while the
/// client reports a buffer at or above this level.
pub const MAX_BUFFER_S: f64 = 15.0;

/// Maximum number of video chunks in flight (sent but not yet acked as
/// about to play) before dispatch defers.
pub const MAX_VIDEO_IN_FLIGHT_CHUNKS: u64 = 5;

/// Upper bound on a single media Binary frame. Chunks larger than this are
/// split across frames with ascending byte offsets.
pub const MEDIA_FRAME_MAX_BYTES: usize = 1 << 20;

/// Send-buffer level above which dispatch stops enqueuing new chunks for a
/// connection until the socket drains.
pub const DEFAULT_SEND_HIGH_WATERMARK: usize = 2 << 20;

/// Send-buffer level that triggers buffer clear plus connection close.
pub const DEFAULT_SEND_MAX: usize = 16 << 20;

/// Dispatch tick period. Every tick each connected session is offered the
/// chance to send its next ready chunks.
pub const DISPATCH_INTERVAL_MS: u64 = 50;

/// Seconds without any client message before a graceful close is scheduled.
pub const DEFAULT_IDLE_TIMEOUT_S: u64 = 10;

/// Grace period for draining the send buffer after queueing a Close frame.
pub const CLOSE_GRACE_MS: u64 = 1000;

/// SSIM in dB is clamped to this range; `ssim_db(1.0)` would be infinite.
pub const MIN_SSIM_DB: f64 = 0.0;
pub const MAX_SSIM_DB: f64 = 60.0;

/// Converts a raw SSIM index to decibels, clamped to the representable
/// range.
pub fn ssim_db(ssim: f64) -> f64 {
    if ssim >= 1.0 {
        return MAX_SSIM_DB;
    }
    (-10.0 * (1.0 - ssim).log10()).clamp(MIN_SSIM_DB, MAX_SSIM_DB)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssim_db_clamps_both_ends() {
        assert_eq!(ssim_db(1.0), MAX_SSIM_DB);
        assert_eq!(ssim_db(0.0), MIN_SSIM_DB);
        // -10 * log10(1 - 0.99) = 20 dB
        assert!((ssim_db(0.99) - 20.0).abs() < 1e-9);
    }
}
