//! Error types for the encoder core.
//!
//! Every failure is reported as an [`EncodeError`]: a coarse [`ErrorCategory`]
//! telling the caller whether the stream can continue, and a specific
//! [`ErrorReason`]. Fatal errors are latched by the encoder and re-reported by
//! every later call until the encoder is re-initialized.

use std::fmt;

use thiserror::Error;

/// Result type for encoder operations.
pub type Result<T> = std::result::Result<T, EncodeError>;

/// Coarse error category reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The call failed for this input only; the stream may continue.
    UnsupportedParam,
    /// The encoder is unusable until re-initialized.
    Fatal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::UnsupportedParam => write!(f, "unsupported parameter"),
            ErrorCategory::Fatal => write!(f, "fatal"),
        }
    }
}

/// Specific reason behind an [`EncodeError`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorReason {
    /// Output bitstream buffer is below the minimum stream size.
    #[error("output buffer is smaller than the minimum stream size")]
    InsufficientOutputBuffer,

    /// Encode was called before initialization.
    #[error("encoder initialization not done")]
    InitNotDone,

    /// Input width does not match the configuration or plane layout.
    #[error("input width not supported")]
    WidthNotSupported,

    /// Input height does not match the configuration or plane layout.
    #[error("input height not supported")]
    HeightNotSupported,

    /// Input colour format cannot be encoded.
    #[error("input chroma format not supported")]
    InputChromaFormatNotSupported,

    /// Encoded data did not fit into the output buffer.
    #[error("bitstream buffer overflow")]
    BitstreamBufferOverflow,

    /// Too many configuration records are waiting to be applied.
    #[error("too many pending configuration records")]
    TooManyPendingConfigs,

    /// A configuration record could not be applied.
    #[error("configuration update failed")]
    ConfigUpdate,

    /// No free picture or motion-vector buffer was available.
    #[error("no free buffer available")]
    NoFreeBuffer,

    /// A hold was released that was not set.
    #[error("buffer released twice")]
    BufferRelease,

    /// A buffer id does not name a slot of its manager.
    #[error("invalid buffer id")]
    InvalidBufferId,

    /// Parameter set or SEI generation failed.
    #[error("header generation failed")]
    HeaderGeneration,

    /// Rate control rejected the frame.
    #[error("rate control failure")]
    RateControl,

    /// A worker panicked while processing a job.
    #[error("worker panicked")]
    WorkerPanicked,

    /// Unclassified failure.
    #[error("encode failed")]
    Fail,
}

/// Error returned by every encoder operation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[error("{category} error: {reason}")]
pub struct EncodeError {
    /// Coarse category.
    pub category: ErrorCategory,
    /// Specific reason.
    pub reason: ErrorReason,
}

impl EncodeError {
    /// Create a fatal error.
    pub const fn fatal(reason: ErrorReason) -> Self {
        Self {
            category: ErrorCategory::Fatal,
            reason,
        }
    }

    /// Create an unsupported-parameter error.
    pub const fn unsupported(reason: ErrorReason) -> Self {
        Self {
            category: ErrorCategory::UnsupportedParam,
            reason,
        }
    }

    /// Buffer overflow is recoverable; everything else is fatal.
    pub fn overflow_aware(reason: ErrorReason) -> Self {
        if reason == ErrorReason::BitstreamBufferOverflow {
            Self::unsupported(reason)
        } else {
            Self::fatal(reason)
        }
    }

    /// Check if this error leaves the encoder unusable.
    pub fn is_fatal(&self) -> bool {
        self.category == ErrorCategory::Fatal
    }
}

/// Errors accumulated by one or more workers during a frame.
///
/// Summaries fold with [`ErrorSummary::combine`]. The combined verdict is
/// `UnsupportedParam` only when every recorded reason is a buffer overflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorSummary {
    overflow: bool,
    other: Option<ErrorReason>,
}

impl ErrorSummary {
    /// Record one failure.
    pub fn record(&mut self, reason: ErrorReason) {
        if reason == ErrorReason::BitstreamBufferOverflow {
            self.overflow = true;
        } else if self.other.is_none() {
            self.other = Some(reason);
        }
    }

    /// Merge another summary into this one.
    pub fn merge(&mut self, other: &ErrorSummary) {
        self.overflow |= other.overflow;
        if self.other.is_none() {
            self.other = other.other;
        }
    }

    /// Fold summaries from several workers.
    pub fn combine<'a>(summaries: impl IntoIterator<Item = &'a ErrorSummary>) -> Self {
        summaries.into_iter().fold(Self::default(), |mut acc, s| {
            acc.merge(s);
            acc
        })
    }

    /// Check if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        !self.overflow && self.other.is_none()
    }

    /// Convert to the error reported to the caller.
    pub fn to_error(&self) -> Option<EncodeError> {
        match (self.other, self.overflow) {
            (Some(reason), _) => Some(EncodeError::fatal(reason)),
            (None, true) => Some(EncodeError::unsupported(ErrorReason::BitstreamBufferOverflow)),
            (None, false) => None,
        }
    }
}

/// Failure joining a worker thread.
#[derive(Error, Debug)]
pub enum PoolJoinError {
    /// A worker thread terminated with a panic.
    #[error("worker {index} panicked: {message}")]
    WorkerPanicked { index: usize, message: String },
}

/// Configuration validation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Picture dimensions are zero, odd or too large.
    #[error("invalid dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    /// Core count out of range.
    #[error("invalid core count {0}")]
    InvalidCores(usize),

    /// Reference count out of range.
    #[error("invalid reference frame count {0}")]
    InvalidRefFrames(u32),

    /// B-frame count out of range.
    #[error("invalid B-frame count {0}")]
    InvalidBFrames(u32),

    /// QP bounds are inverted or outside 0..=51.
    #[error("invalid QP range {min}..={max}")]
    InvalidQpRange { min: u8, max: u8 },

    /// Frame rate numerator or denominator is zero.
    #[error("invalid frame rate {0}/{1}")]
    InvalidFrameRate(u32, u32),

    /// IDR interval must be at least one.
    #[error("IDR interval must be non-zero")]
    InvalidIdrInterval,

    /// Colour format cannot be used in this role.
    #[error("colour format {0} not supported for {1}")]
    UnsupportedFormat(&'static str, &'static str),

    /// Field cannot change after the first encode call.
    #[error("{0} cannot change after encoding started")]
    Immutable(&'static str),
}

impl From<ConfigError> for EncodeError {
    fn from(_: ConfigError) -> Self {
        EncodeError::fatal(ErrorReason::ConfigUpdate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_alone_is_unsupported() {
        let mut a = ErrorSummary::default();
        a.record(ErrorReason::BitstreamBufferOverflow);
        let b = ErrorSummary::default();

        let err = ErrorSummary::combine([&a, &b]).to_error().unwrap();
        assert_eq!(err.category, ErrorCategory::UnsupportedParam);
        assert_eq!(err.reason, ErrorReason::BitstreamBufferOverflow);
    }

    #[test]
    fn test_mixed_errors_are_fatal() {
        let mut a = ErrorSummary::default();
        a.record(ErrorReason::BitstreamBufferOverflow);
        let mut b = ErrorSummary::default();
        b.record(ErrorReason::WorkerPanicked);

        let err = ErrorSummary::combine([&a, &b]).to_error().unwrap();
        assert!(err.is_fatal());
        assert_eq!(err.reason, ErrorReason::WorkerPanicked);
    }

    #[test]
    fn test_empty_summary() {
        let summaries = [ErrorSummary::default(); 4];
        let combined = ErrorSummary::combine(&summaries);
        assert!(combined.is_empty());
        assert!(combined.to_error().is_none());
    }

    #[test]
    fn test_overflow_aware() {
        assert!(!EncodeError::overflow_aware(ErrorReason::BitstreamBufferOverflow).is_fatal());
        assert!(EncodeError::overflow_aware(ErrorReason::RateControl).is_fatal());
    }

    #[test]
    fn test_display() {
        let err = EncodeError::unsupported(ErrorReason::InsufficientOutputBuffer);
        assert_eq!(
            err.to_string(),
            "unsupported parameter error: output buffer is smaller than the minimum stream size"
        );
    }
}
