//! # Transcode AVC Encoder
//!
//! Frame-level orchestration for a multi-threaded H.264 encoder.
//!
//! The crate drives one picture per [`H264Encoder::encode`] call through
//! validation, configuration updates, reference management, parallel
//! macroblock coding, rate control and reconstruction output. The
//! macroblock kernels, header writer and rate controller plug in through
//! traits:
//!
//! - [`MacroblockKernels`] - Per-row analysis and entropy coding
//! - [`HeaderWriter`] - SPS, PPS, SEI and slice header generation
//! - [`RateControl`] - Frame QP and skip decisions
//!
//! ## Threading
//!
//! Pictures are split into macroblock-row jobs. With persistent threads a
//! [`ThreadPool`] of `num_cores - 1` workers is reused across frames;
//! otherwise helper threads are spawned for each frame. The calling thread
//! always works on the frame as well.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use transcode_avcenc::{
//!     BitstreamBuffer, ColorFormat, EncodeInput, EncodeOutput, EncoderConfig, H264Encoder,
//!     RawBuffer, Timestamp,
//! };
//!
//! let config = EncoderConfig::new(1280, 720).with_cores(4).with_bframes(2);
//! let mut encoder = H264Encoder::new(config)?;
//! let mut output = EncodeOutput::default();
//!
//! let raw = Arc::new(RawBuffer::alloc(ColorFormat::Yuv420p, 1280, 720));
//! let input = EncodeInput::picture(raw, Timestamp::new(0, 0), BitstreamBuffer::new(1 << 20));
//! encoder.encode(input, &mut output)?;
//! # Ok::<(), transcode_avcenc::EncodeError>(())
//! ```

pub mod bitstream;
pub mod buf_mgr;
pub mod config;
pub mod encoder;
pub mod error;
pub mod executor;
pub mod fmt_conv;
pub mod frame;
pub mod header;
pub mod input_queue;
pub mod job;
pub mod kernels;
pub mod picture;
pub mod process;
pub mod quality;
pub mod rate_control;
pub mod sei;
pub mod thread_pool;

/// Number of context sets calls alternate between.
pub const MAX_CTXT_SETS: usize = 2;

/// Smallest output buffer accepted by an encode call.
pub const MIN_STREAM_SIZE: usize = 0x800;

pub use config::{ConfigRecord, EncoderConfig, Profile, QualityMetrics, RateControlMode};
pub use encoder::{EncodeInput, EncodeOutput, EncodedFrameType, H264Encoder};
pub use error::{ConfigError, EncodeError, ErrorCategory, ErrorReason, Result};
pub use executor::{FrameExecutor, PersistentExecutor, TransientExecutor};
pub use frame::{BitstreamBuffer, ColorFormat, Plane, RawBuffer, Timestamp};
pub use header::{HeaderWriter, ParameterSetWriter, SliceInfo};
pub use kernels::{MacroblockKernels, PcmKernels};
pub use picture::PicType;
pub use quality::PlanePsnr;
pub use rate_control::{BufferedRateControl, FrameStats, PostEncode, RateControl};
pub use sei::{AmbientViewing, ContentLight, MasteringDisplay, SeiParams, ShutterInterval};
pub use thread_pool::ThreadPool;
