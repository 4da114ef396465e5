//! Rate control interface and a buffer-based implementation.

use crate::config::{EncoderConfig, RateControlMode};
use crate::error::ErrorReason;
use crate::picture::PicType;

/// Outcome of the post-encode update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PostEncode {
    /// Drop the coded picture and retire its buffers.
    pub skip: bool,
}

/// Statistics of a coded picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub pic_type: PicType,
    pub qp: u8,
    /// Bits written, headers included.
    pub bits: u64,
    /// The coded picture did not fit into the output buffer.
    pub overflowed: bool,
}

/// Frame-level rate control.
pub trait RateControl: Send {
    /// Decide whether to drop `pic_type` before coding it.
    fn pre_encode_skip(&mut self, pic_type: PicType) -> bool;

    /// QP for the next picture.
    fn frame_qp(&mut self, pic_type: PicType) -> u8;

    /// Update the model after coding a picture.
    fn post_encode_update(&mut self, stats: &FrameStats) -> Result<PostEncode, ErrorReason>;

    /// Pick up a new configuration.
    fn reconfigure(&mut self, config: &EncoderConfig);
}

/// Virtual-buffer rate control.
///
/// Every coded picture adds its bits to the buffer and one frame period of
/// target bits drains from it. The QP moves by at most two steps per picture
/// to steer fullness toward half the buffer.
#[derive(Debug, Clone)]
pub struct BufferedRateControl {
    mode: RateControlMode,
    frame_skip: bool,
    min_qp: u8,
    max_qp: u8,
    frame_rate: (u32, u32),
    buffer_size: u64,
    fullness: u64,
    last_qp: u8,
    frame_count: u64,
}

impl BufferedRateControl {
    pub fn new(config: &EncoderConfig) -> Self {
        let mut rc = Self {
            mode: config.rate_control,
            frame_skip: config.frame_skip,
            min_qp: config.min_qp,
            max_qp: config.max_qp,
            frame_rate: config.frame_rate,
            buffer_size: 0,
            fullness: 0,
            last_qp: 26,
            frame_count: 0,
        };
        rc.reconfigure(config);
        rc.fullness = rc.buffer_size / 2;
        rc
    }

    fn bitrate(&self) -> Option<u64> {
        match self.mode {
            RateControlMode::Cqp(_) => None,
            RateControlMode::Cbr(rate) => Some(rate as u64),
            RateControlMode::Vbr { target, .. } => Some(target as u64),
        }
    }

    /// Target bits per frame, if bitrate controlled.
    pub fn target_bits(&self) -> Option<u64> {
        let (num, den) = self.frame_rate;
        self.bitrate().map(|rate| rate * den as u64 / num.max(1) as u64)
    }

    /// Current buffer fullness in bits.
    pub fn fullness(&self) -> u64 {
        self.fullness
    }

    pub fn buffer_size(&self) -> u64 {
        self.buffer_size
    }

    fn drain_one_period(&mut self) {
        if let Some(target) = self.target_bits() {
            self.fullness = self.fullness.saturating_sub(target);
        }
    }
}

impl RateControl for BufferedRateControl {
    fn pre_encode_skip(&mut self, pic_type: PicType) -> bool {
        if !self.frame_skip || pic_type.is_intra() || self.bitrate().is_none() {
            return false;
        }
        // Skip when the buffer is too full to absorb another typical frame.
        let skip = self.fullness * 10 > self.buffer_size * 9;
        if skip {
            self.drain_one_period();
        }
        skip
    }

    fn frame_qp(&mut self, pic_type: PicType) -> u8 {
        let qp = match self.mode {
            RateControlMode::Cqp(qp) => qp as i32,
            _ if self.buffer_size == 0 => self.last_qp as i32,
            _ => {
                let half = self.buffer_size / 2;
                let step = if self.fullness > half + half / 4 {
                    2
                } else if self.fullness > half {
                    1
                } else if self.fullness < half / 2 {
                    -2
                } else if self.fullness < half {
                    -1
                } else {
                    0
                };
                self.last_qp as i32 + step
            }
        };
        let qp = match pic_type {
            PicType::B => qp + 2,
            _ => qp,
        };
        let qp = qp.clamp(self.min_qp as i32, self.max_qp as i32) as u8;
        if pic_type != PicType::B {
            self.last_qp = qp;
        }
        qp
    }

    fn post_encode_update(&mut self, stats: &FrameStats) -> Result<PostEncode, ErrorReason> {
        self.frame_count += 1;
        if stats.overflowed {
            return Err(ErrorReason::BitstreamBufferOverflow);
        }
        let Some(target) = self.target_bits() else {
            return Ok(PostEncode::default());
        };

        let filled = self.fullness + stats.bits;
        if filled > self.buffer_size && self.frame_skip && !stats.pic_type.is_intra() {
            // Drop the picture; only the drain is accounted.
            self.fullness = self.fullness.saturating_sub(target);
            return Ok(PostEncode { skip: true });
        }

        self.fullness = filled.saturating_sub(target);
        if let RateControlMode::Vbr { max, .. } = self.mode {
            let peak = max as u64 * self.frame_rate.1 as u64 / self.frame_rate.0.max(1) as u64;
            if stats.bits > peak * 4 {
                tracing::debug!(bits = stats.bits, peak, "Picture exceeds VBR peak");
            }
        }
        Ok(PostEncode::default())
    }

    fn reconfigure(&mut self, config: &EncoderConfig) {
        self.mode = config.rate_control;
        self.frame_skip = config.frame_skip;
        self.min_qp = config.min_qp;
        self.max_qp = config.max_qp;
        self.frame_rate = config.frame_rate;
        self.buffer_size = match config.rate_control {
            RateControlMode::Cqp(_) => 0,
            RateControlMode::Cbr(rate) => rate as u64,
            RateControlMode::Vbr { max, .. } => max as u64,
        };
        self.fullness = self.fullness.min(self.buffer_size);
        if let RateControlMode::Cqp(qp) = config.rate_control {
            self.last_qp = qp;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(pic_type: PicType, bits: u64) -> FrameStats {
        FrameStats {
            pic_type,
            qp: 26,
            bits,
            overflowed: false,
        }
    }

    #[test]
    fn test_constant_qp() {
        let config = EncoderConfig::new(64, 64).with_rate_control(RateControlMode::Cqp(30));
        let mut rc = BufferedRateControl::new(&config);
        assert_eq!(rc.frame_qp(PicType::Idr), 30);
        assert_eq!(rc.frame_qp(PicType::P), 30);
        assert_eq!(rc.frame_qp(PicType::B), 32);
        assert!(!rc.pre_encode_skip(PicType::P));
    }

    #[test]
    fn test_qp_rises_when_buffer_fills() {
        let config = EncoderConfig::new(64, 64)
            .with_rate_control(RateControlMode::Cbr(300_000))
            .with_frame_rate(30, 1);
        let mut rc = BufferedRateControl::new(&config);
        let start = rc.frame_qp(PicType::Idr);
        for _ in 0..10 {
            rc.post_encode_update(&stats(PicType::P, 40_000)).unwrap();
        }
        assert!(rc.frame_qp(PicType::P) > start);
    }

    #[test]
    fn test_qp_clamped_to_bounds() {
        let mut config = EncoderConfig::new(64, 64).with_rate_control(RateControlMode::Cqp(50));
        config.max_qp = 40;
        let mut rc = BufferedRateControl::new(&config);
        assert_eq!(rc.frame_qp(PicType::B), 40);
    }

    #[test]
    fn test_post_encode_skip_with_frame_skip() {
        let config = EncoderConfig::new(64, 64)
            .with_rate_control(RateControlMode::Cbr(100_000))
            .with_frame_skip(true);
        let mut rc = BufferedRateControl::new(&config);
        let result = rc.post_encode_update(&stats(PicType::P, 200_000)).unwrap();
        assert!(result.skip);
        // Intra pictures are never dropped.
        let result = rc.post_encode_update(&stats(PicType::Idr, 200_000)).unwrap();
        assert!(!result.skip);
    }

    #[test]
    fn test_pre_encode_skip_when_full() {
        let config = EncoderConfig::new(64, 64)
            .with_rate_control(RateControlMode::Cbr(100_000))
            .with_frame_skip(true);
        let mut rc = BufferedRateControl::new(&config);
        rc.post_encode_update(&stats(PicType::Idr, 60_000)).unwrap();
        assert!(rc.fullness() * 10 > rc.buffer_size() * 9);
        assert!(rc.pre_encode_skip(PicType::P));
        assert!(!rc.pre_encode_skip(PicType::I));
    }

    #[test]
    fn test_overflow_is_reported() {
        let config = EncoderConfig::new(64, 64);
        let mut rc = BufferedRateControl::new(&config);
        let mut s = stats(PicType::P, 0);
        s.overflowed = true;
        assert_eq!(rc.post_encode_update(&s), Err(ErrorReason::BitstreamBufferOverflow));
    }
}
