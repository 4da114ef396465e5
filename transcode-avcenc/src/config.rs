//! Encoder configuration and the pending-configuration ring.

use std::collections::VecDeque;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, EncodeError, ErrorReason, Result};
use crate::frame::{ColorFormat, Timestamp};
use crate::sei::SeiParams;

/// Maximum number of configuration records waiting to be applied.
pub const MAX_ACTIVE_CONFIG_PARAMS: usize = 32;

/// Maximum number of processing cores (caller thread included).
pub const MAX_NUM_CORES: usize = 16;

/// Maximum number of reference frames.
pub const MAX_REF_FRAMES: u32 = 16;

/// Maximum number of consecutive B frames.
pub const MAX_BFRAMES: u32 = 8;

/// Rate control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RateControlMode {
    /// Constant QP for every picture.
    Cqp(u8),
    /// Constant bitrate (bits per second).
    Cbr(u32),
    /// Variable bitrate with a peak.
    Vbr { target: u32, max: u32 },
}

impl Default for RateControlMode {
    fn default() -> Self {
        Self::Cqp(28)
    }
}

/// H.264 profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Profile {
    #[default]
    Baseline,
    Main,
    High,
}

impl Profile {
    /// `profile_idc` value.
    pub fn idc(&self) -> u8 {
        match self {
            Profile::Baseline => 66,
            Profile::Main => 77,
            Profile::High => 100,
        }
    }
}

bitflags! {
    /// Quality metrics computed on reconstructed pictures.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct QualityMetrics: u8 {
        const PSNR = 1 << 0;
    }
}

/// Encoder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Display width in pixels.
    pub width: u32,
    /// Display height in pixels.
    pub height: u32,
    /// Colour format of input pictures.
    pub input_format: ColorFormat,
    /// Colour format of reconstructed pictures.
    pub recon_format: ColorFormat,
    /// Frame rate as (numerator, denominator).
    pub frame_rate: (u32, u32),
    /// Target profile.
    pub profile: Profile,
    /// Target `level_idc`.
    pub level_idc: u8,
    /// Cores used for macroblock processing, the calling thread included.
    pub num_cores: usize,
    /// Keep worker threads alive across calls instead of spawning per frame.
    pub keep_threads_active: bool,
    /// Consecutive B frames between anchors.
    pub num_bframes: u32,
    /// Reference frames kept for inter prediction.
    pub max_ref_frames: u32,
    /// Distance between IDR pictures.
    pub idr_interval: u32,
    /// Distance between intra pictures inside a GOP (0 = IDR only).
    pub i_interval: u32,
    /// Rate control mode.
    pub rate_control: RateControlMode,
    /// Allow rate control to drop pictures.
    pub frame_skip: bool,
    /// Lowest QP rate control may pick.
    pub min_qp: u8,
    /// Highest QP rate control may pick.
    pub max_qp: u8,
    /// Return reconstructed pictures to the caller.
    pub enable_recon: bool,
    /// Keep one extra long-lived reference picture.
    pub enable_alt_ref: bool,
    /// Quality metrics to compute on reconstructed pictures.
    pub quality_metrics: QualityMetrics,
    /// SEI metadata.
    pub sei: SeiParams,
    /// Force the next picture to IDR.
    pub force_idr: bool,
}

impl EncoderConfig {
    /// Create a configuration for the given dimensions.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            input_format: ColorFormat::Yuv420p,
            recon_format: ColorFormat::Yuv420p,
            frame_rate: (30, 1),
            profile: Profile::default(),
            level_idc: 40,
            num_cores: 1,
            keep_threads_active: true,
            num_bframes: 0,
            max_ref_frames: 1,
            idr_interval: 300,
            i_interval: 0,
            rate_control: RateControlMode::default(),
            frame_skip: false,
            min_qp: 10,
            max_qp: 51,
            enable_recon: false,
            enable_alt_ref: false,
            quality_metrics: QualityMetrics::empty(),
            sei: SeiParams::default(),
            force_idr: false,
        }
    }

    /// Set the core count (0 = available parallelism).
    pub fn with_cores(mut self, num_cores: usize) -> Self {
        self.num_cores = if num_cores == 0 {
            std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(1)
                .min(MAX_NUM_CORES)
        } else {
            num_cores
        };
        self
    }

    /// Choose persistent worker threads or per-frame threads.
    pub fn with_persistent_threads(mut self, keep: bool) -> Self {
        self.keep_threads_active = keep;
        self
    }

    /// Set the input colour format.
    pub fn with_input_format(mut self, format: ColorFormat) -> Self {
        self.input_format = format;
        self
    }

    /// Set the number of B frames.
    pub fn with_bframes(mut self, count: u32) -> Self {
        self.num_bframes = count;
        self
    }

    /// Set the number of reference frames.
    pub fn with_ref_frames(mut self, count: u32) -> Self {
        self.max_ref_frames = count;
        self
    }

    /// Set the IDR and intra intervals.
    pub fn with_intervals(mut self, idr_interval: u32, i_interval: u32) -> Self {
        self.idr_interval = idr_interval;
        self.i_interval = i_interval;
        self
    }

    /// Set the rate control mode.
    pub fn with_rate_control(mut self, mode: RateControlMode) -> Self {
        self.rate_control = mode;
        self
    }

    /// Allow rate control to skip frames.
    pub fn with_frame_skip(mut self, enable: bool) -> Self {
        self.frame_skip = enable;
        self
    }

    /// Return reconstructed pictures in `format`.
    pub fn with_recon(mut self, format: ColorFormat) -> Self {
        self.enable_recon = true;
        self.recon_format = format;
        self
    }

    /// Enable PSNR computation.
    pub fn with_psnr(mut self) -> Self {
        self.quality_metrics |= QualityMetrics::PSNR;
        self
    }

    /// Set SEI metadata.
    pub fn with_sei(mut self, sei: SeiParams) -> Self {
        self.sei = sei;
        self
    }

    /// Set the frame rate.
    pub fn with_frame_rate(mut self, num: u32, den: u32) -> Self {
        self.frame_rate = (num, den);
        self
    }

    /// Width in macroblocks.
    pub fn mb_width(&self) -> usize {
        self.width.div_ceil(16) as usize
    }

    /// Height in macroblocks.
    pub fn mb_height(&self) -> usize {
        self.height.div_ceil(16) as usize
    }

    /// Reference frames actually kept; B frames need both anchors.
    pub fn effective_ref_frames(&self) -> usize {
        let min = if self.num_bframes > 0 { 2 } else { 1 };
        (self.max_ref_frames as usize).max(min) + self.enable_alt_ref as usize
    }

    /// Picture and motion-vector buffers to allocate.
    pub fn ref_buf_count(&self) -> usize {
        self.effective_ref_frames() + self.num_bframes as usize + crate::MAX_CTXT_SETS + 1
    }

    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.width == 0
            || self.height == 0
            || self.width % 2 != 0
            || self.height % 2 != 0
            || self.width > 4096
            || self.height > 4096
        {
            return Err(ConfigError::InvalidDimensions {
                width: self.width,
                height: self.height,
            });
        }
        if self.num_cores == 0 || self.num_cores > MAX_NUM_CORES {
            return Err(ConfigError::InvalidCores(self.num_cores));
        }
        if self.max_ref_frames == 0 || self.max_ref_frames > MAX_REF_FRAMES {
            return Err(ConfigError::InvalidRefFrames(self.max_ref_frames));
        }
        if self.num_bframes > MAX_BFRAMES {
            return Err(ConfigError::InvalidBFrames(self.num_bframes));
        }
        if self.min_qp > self.max_qp || self.max_qp > 51 {
            return Err(ConfigError::InvalidQpRange {
                min: self.min_qp,
                max: self.max_qp,
            });
        }
        if self.frame_rate.0 == 0 || self.frame_rate.1 == 0 {
            return Err(ConfigError::InvalidFrameRate(self.frame_rate.0, self.frame_rate.1));
        }
        if self.idr_interval == 0 {
            return Err(ConfigError::InvalidIdrInterval);
        }
        if !self.input_format.is_encodable() {
            return Err(ConfigError::UnsupportedFormat(self.input_format.name(), "input"));
        }
        if !self.recon_format.is_recon_format() {
            return Err(ConfigError::UnsupportedFormat(self.recon_format.name(), "recon"));
        }
        Ok(())
    }

    /// Check that `next` only changes fields that may change mid-stream.
    pub fn check_update(&self, next: &EncoderConfig) -> std::result::Result<(), ConfigError> {
        if (self.width, self.height) != (next.width, next.height) {
            return Err(ConfigError::Immutable("dimensions"));
        }
        if self.input_format != next.input_format {
            return Err(ConfigError::Immutable("input_format"));
        }
        if self.max_ref_frames != next.max_ref_frames || self.enable_alt_ref != next.enable_alt_ref {
            return Err(ConfigError::Immutable("max_ref_frames"));
        }
        if self.num_bframes != next.num_bframes {
            return Err(ConfigError::Immutable("num_bframes"));
        }
        if self.num_cores != next.num_cores {
            return Err(ConfigError::Immutable("num_cores"));
        }
        if self.keep_threads_active != next.keep_threads_active {
            return Err(ConfigError::Immutable("keep_threads_active"));
        }
        if self.profile != next.profile {
            return Err(ConfigError::Immutable("profile"));
        }
        next.validate()
    }
}

/// Configuration snapshot waiting for its timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigRecord {
    /// Call timestamp at which the record applies.
    pub timestamp: Timestamp,
    /// Full configuration to apply.
    pub config: EncoderConfig,
}

impl ConfigRecord {
    /// Apply at the call carrying `timestamp`.
    pub fn at(timestamp: Timestamp, config: EncoderConfig) -> Self {
        Self { timestamp, config }
    }

    /// Apply at the next call.
    pub fn immediate(config: EncoderConfig) -> Self {
        Self {
            timestamp: Timestamp::wildcard(),
            config,
        }
    }
}

/// Bounded set of pending configuration records, in submission order.
#[derive(Debug, Default)]
pub struct ConfigRing {
    records: VecDeque<ConfigRecord>,
}

impl ConfigRing {
    pub fn new() -> Self {
        Self {
            records: VecDeque::with_capacity(MAX_ACTIVE_CONFIG_PARAMS),
        }
    }

    /// Queue a record.
    pub fn push(&mut self, record: ConfigRecord) -> Result<()> {
        if self.records.len() >= MAX_ACTIVE_CONFIG_PARAMS {
            return Err(EncodeError::unsupported(ErrorReason::TooManyPendingConfigs));
        }
        self.records.push_back(record);
        Ok(())
    }

    /// Remove and return every record that applies at `timestamp`.
    pub fn take_matching(&mut self, timestamp: &Timestamp) -> Vec<ConfigRecord> {
        let mut matched = Vec::new();
        let mut kept = VecDeque::with_capacity(self.records.len());
        for record in self.records.drain(..) {
            if record.timestamp.matches(timestamp) {
                matched.push(record);
            } else {
                kept.push_back(record);
            }
        }
        self.records = kept;
        matched
    }

    /// Number of pending records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every pending record.
    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EncoderConfig::new(1280, 720);
        assert!(config.validate().is_ok());
        assert_eq!(config.mb_width(), 80);
        assert_eq!(config.mb_height(), 45);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(matches!(
            EncoderConfig::new(0, 720).validate(),
            Err(ConfigError::InvalidDimensions { .. })
        ));
        assert!(matches!(
            EncoderConfig::new(64, 64).with_cores(MAX_NUM_CORES + 1).validate(),
            Err(ConfigError::InvalidCores(_))
        ));
        let mut config = EncoderConfig::new(64, 64);
        config.min_qp = 40;
        config.max_qp = 30;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidQpRange { .. })));

        let config = EncoderConfig::new(64, 64).with_recon(ColorFormat::Yuv422ile);
        assert!(matches!(config.validate(), Err(ConfigError::UnsupportedFormat(_, "recon"))));
    }

    #[test]
    fn test_ref_buf_count() {
        let config = EncoderConfig::new(64, 64).with_ref_frames(1).with_bframes(2);
        // two anchors + two B frames + two context sets + one spare
        assert_eq!(config.ref_buf_count(), 7);
    }

    #[test]
    fn test_check_update_allows_rate_control_changes() {
        let config = EncoderConfig::new(64, 64);
        let next = config
            .clone()
            .with_rate_control(RateControlMode::Cbr(500_000))
            .with_intervals(30, 10);
        assert!(config.check_update(&next).is_ok());
    }

    #[test]
    fn test_check_update_rejects_immutable_changes() {
        let config = EncoderConfig::new(64, 64);
        assert_eq!(
            config.check_update(&EncoderConfig::new(128, 64)),
            Err(ConfigError::Immutable("dimensions"))
        );
        assert_eq!(
            config.check_update(&config.clone().with_persistent_threads(false)),
            Err(ConfigError::Immutable("keep_threads_active"))
        );
    }

    #[test]
    fn test_ring_matches_exact_and_wildcard() {
        let mut ring = ConfigRing::new();
        let config = EncoderConfig::new(64, 64);
        ring.push(ConfigRecord::at(Timestamp::new(0, 10), config.clone())).unwrap();
        ring.push(ConfigRecord::at(Timestamp::new(0, 20), config.clone())).unwrap();
        ring.push(ConfigRecord::immediate(config)).unwrap();

        let applied = ring.take_matching(&Timestamp::new(0, 5));
        assert_eq!(applied.len(), 1);
        assert!(applied[0].timestamp.is_wildcard());

        let applied = ring.take_matching(&Timestamp::new(0, 20));
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].timestamp, Timestamp::new(0, 20));
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn test_ring_capacity() {
        let mut ring = ConfigRing::new();
        let config = EncoderConfig::new(64, 64);
        for i in 0..MAX_ACTIVE_CONFIG_PARAMS {
            ring.push(ConfigRecord::at(Timestamp::new(0, i as u32), config.clone()))
                .unwrap();
        }
        let err = ring.push(ConfigRecord::immediate(config)).unwrap_err();
        assert_eq!(err.reason, ErrorReason::TooManyPendingConfigs);
        assert!(!err.is_fatal());
    }
}
