//! Raw picture and bitstream buffer descriptors.

use serde::{Deserialize, Serialize};

use crate::error::{EncodeError, ErrorReason, Result};

/// Raw picture colour format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorFormat {
    /// Planar 4:2:0 (Y, U, V).
    Yuv420p,
    /// Semi-planar 4:2:0 with interleaved UV.
    Yuv420spUv,
    /// Semi-planar 4:2:0 with interleaved VU.
    Yuv420spVu,
    /// Interleaved 4:2:2 (Y0 U Y1 V).
    Yuv422ile,
    /// Planar 4:2:2.
    Yuv422p,
    /// Planar 4:4:4.
    Yuv444p,
}

impl ColorFormat {
    /// Number of memory planes for this format.
    pub fn num_planes(&self) -> usize {
        match self {
            ColorFormat::Yuv420p | ColorFormat::Yuv422p | ColorFormat::Yuv444p => 3,
            ColorFormat::Yuv420spUv | ColorFormat::Yuv420spVu => 2,
            ColorFormat::Yuv422ile => 1,
        }
    }

    /// Check if the encoder accepts this format as input.
    pub fn is_encodable(&self) -> bool {
        matches!(
            self,
            ColorFormat::Yuv420p
                | ColorFormat::Yuv420spUv
                | ColorFormat::Yuv420spVu
                | ColorFormat::Yuv422ile
        )
    }

    /// Check if reconstructed pictures can be produced in this format.
    pub fn is_recon_format(&self) -> bool {
        matches!(
            self,
            ColorFormat::Yuv420p | ColorFormat::Yuv420spUv | ColorFormat::Yuv420spVu
        )
    }

    /// Short name.
    pub fn name(&self) -> &'static str {
        match self {
            ColorFormat::Yuv420p => "yuv420p",
            ColorFormat::Yuv420spUv => "yuv420sp-uv",
            ColorFormat::Yuv420spVu => "yuv420sp-vu",
            ColorFormat::Yuv422ile => "yuv422ile",
            ColorFormat::Yuv422p => "yuv422p",
            ColorFormat::Yuv444p => "yuv444p",
        }
    }

    /// Plane dimensions in bytes for a picture of `width` x `height` pixels.
    pub fn plane_sizes(&self, width: u32, height: u32) -> Vec<(u32, u32)> {
        let (cw, ch) = (width.div_ceil(2), height.div_ceil(2));
        match self {
            ColorFormat::Yuv420p => vec![(width, height), (cw, ch), (cw, ch)],
            ColorFormat::Yuv420spUv | ColorFormat::Yuv420spVu => {
                vec![(width, height), (cw * 2, ch)]
            }
            ColorFormat::Yuv422ile => vec![(width * 2, height)],
            ColorFormat::Yuv422p => vec![(width, height), (cw, height), (cw, height)],
            ColorFormat::Yuv444p => vec![(width, height), (width, height), (width, height)],
        }
    }
}

/// A single memory plane.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Plane {
    /// Sample data, `stride * height` bytes.
    pub data: Vec<u8>,
    /// Width in bytes.
    pub width: u32,
    /// Height in rows.
    pub height: u32,
    /// Row pitch in bytes.
    pub stride: usize,
}

impl Plane {
    /// Allocate a zeroed plane.
    pub fn new(width: u32, height: u32) -> Self {
        let stride = width as usize;
        Self {
            data: vec![0; stride * height as usize],
            width,
            height,
            stride,
        }
    }

    /// A plane with no samples.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Borrow one row.
    #[inline]
    pub fn row(&self, y: usize) -> &[u8] {
        let start = y * self.stride;
        &self.data[start..start + self.width as usize]
    }

    /// Mutably borrow one row.
    #[inline]
    pub fn row_mut(&mut self, y: usize) -> &mut [u8] {
        let start = y * self.stride;
        let width = self.width as usize;
        &mut self.data[start..start + width]
    }
}

/// Raw picture buffer handed across the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBuffer {
    /// Colour format of the planes.
    pub format: ColorFormat,
    /// Memory planes, `format.num_planes()` of them.
    pub planes: Vec<Plane>,
}

impl RawBuffer {
    /// Allocate a zeroed picture of `width` x `height` pixels.
    pub fn alloc(format: ColorFormat, width: u32, height: u32) -> Self {
        let planes = format
            .plane_sizes(width, height)
            .into_iter()
            .map(|(w, h)| Plane::new(w, h))
            .collect();
        Self { format, planes }
    }

    /// A zero-sized picture, used to report a skipped recon.
    pub fn zero_sized(format: ColorFormat) -> Self {
        Self {
            format,
            planes: (0..format.num_planes()).map(|_| Plane::empty()).collect(),
        }
    }

    /// Luma width in pixels.
    pub fn width(&self) -> u32 {
        match self.format {
            ColorFormat::Yuv422ile => self.planes.first().map_or(0, |p| p.width / 2),
            _ => self.planes.first().map_or(0, |p| p.width),
        }
    }

    /// Luma height in pixels.
    pub fn height(&self) -> u32 {
        self.planes.first().map_or(0, |p| p.height)
    }

    /// Check if every plane is empty.
    pub fn is_zero_sized(&self) -> bool {
        self.planes.iter().all(|p| p.width == 0 && p.height == 0)
    }

    /// Sample luma at (x, y).
    #[inline]
    pub fn luma(&self, x: usize, y: usize) -> u8 {
        let p = &self.planes[0];
        match self.format {
            ColorFormat::Yuv422ile => p.data[y * p.stride + x * 2],
            _ => p.data[y * p.stride + x],
        }
    }

    /// Sample both chroma components at 4:2:0 position (cx, cy).
    #[inline]
    pub fn chroma(&self, cx: usize, cy: usize) -> (u8, u8) {
        match self.format {
            ColorFormat::Yuv420p => {
                let (u, v) = (&self.planes[1], &self.planes[2]);
                (u.data[cy * u.stride + cx], v.data[cy * v.stride + cx])
            }
            ColorFormat::Yuv420spUv | ColorFormat::Yuv420spVu => {
                let p = &self.planes[1];
                let base = cy * p.stride + cx * 2;
                let (a, b) = (p.data[base], p.data[base + 1]);
                if self.format == ColorFormat::Yuv420spUv {
                    (a, b)
                } else {
                    (b, a)
                }
            }
            ColorFormat::Yuv422ile => {
                let p = &self.planes[0];
                let base = cy * 2 * p.stride + cx * 4;
                (p.data[base + 1], p.data[base + 3])
            }
            ColorFormat::Yuv422p => {
                let (u, v) = (&self.planes[1], &self.planes[2]);
                let y = cy * 2;
                (u.data[y * u.stride + cx], v.data[y * v.stride + cx])
            }
            ColorFormat::Yuv444p => {
                let (u, v) = (&self.planes[1], &self.planes[2]);
                let (x, y) = (cx * 2, cy * 2);
                (u.data[y * u.stride + x], v.data[y * v.stride + x])
            }
        }
    }
}

/// Output bitstream buffer with a hard capacity.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BitstreamBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl BitstreamBuffer {
    /// Create an empty buffer able to hold `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if nothing was written.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Total capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes that can still be written.
    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    /// Written bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Append bytes, failing without writing anything if they do not fit.
    pub fn write(&mut self, bytes: &[u8]) -> std::result::Result<(), ErrorReason> {
        if bytes.len() > self.remaining() {
            return Err(ErrorReason::BitstreamBufferOverflow);
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Discard written bytes.
    pub fn clear(&mut self) {
        self.data.clear();
    }
}

/// 64-bit timestamp split into two halves.
///
/// A half equal to [`Timestamp::WILDCARD`] matches every timestamp when used
/// to tag a configuration record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp {
    pub high: u32,
    pub low: u32,
}

impl Timestamp {
    /// All-ones half value.
    pub const WILDCARD: u32 = u32::MAX;

    /// Create a timestamp.
    pub const fn new(high: u32, low: u32) -> Self {
        Self { high, low }
    }

    /// A timestamp that matches every call.
    pub const fn wildcard() -> Self {
        Self {
            high: Self::WILDCARD,
            low: Self::WILDCARD,
        }
    }

    /// Check if either half is the wildcard.
    pub fn is_wildcard(&self) -> bool {
        self.high == Self::WILDCARD || self.low == Self::WILDCARD
    }

    /// Check if a record tagged with `self` applies to a call at `other`.
    pub fn matches(&self, other: &Timestamp) -> bool {
        self.is_wildcard() || self == other
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self {
            high: (value >> 32) as u32,
            low: value as u32,
        }
    }
}

/// Check an input picture against its plane layout and the display size.
pub fn check_input_dimensions(raw: &RawBuffer, width: u32, height: u32) -> Result<()> {
    let unsupported = |reason| Err(EncodeError::unsupported(reason));
    let planes = &raw.planes;
    if planes.len() < raw.format.num_planes() {
        return unsupported(ErrorReason::InputChromaFormatNotSupported);
    }

    for plane in &planes[..raw.format.num_planes()] {
        if plane.stride < plane.width as usize {
            return unsupported(ErrorReason::WidthNotSupported);
        }
        let needed = plane.stride.checked_mul(plane.height as usize);
        if needed.map_or(true, |n| plane.data.len() < n) {
            return unsupported(ErrorReason::HeightNotSupported);
        }
    }

    let mut luma_width = planes[0].width;
    let luma_height = planes[0].height;
    match raw.format {
        ColorFormat::Yuv420p => {
            let (w0, w1, w2) = (planes[0].width, planes[1].width, planes[2].width);
            if w0 / 2 != w1 || w0 / 2 != w2 || w1 != w2 {
                return unsupported(ErrorReason::WidthNotSupported);
            }
            let (h0, h1, h2) = (planes[0].height, planes[1].height, planes[2].height);
            if h0 / 2 != h1 || h0 / 2 != h2 || h1 != h2 {
                return unsupported(ErrorReason::HeightNotSupported);
            }
        }
        ColorFormat::Yuv420spUv | ColorFormat::Yuv420spVu => {
            if planes[0].width != planes[1].width {
                return unsupported(ErrorReason::WidthNotSupported);
            }
            if planes[0].height / 2 != planes[1].height {
                return unsupported(ErrorReason::HeightNotSupported);
            }
        }
        ColorFormat::Yuv422ile => luma_width /= 2,
        ColorFormat::Yuv422p | ColorFormat::Yuv444p => {
            return unsupported(ErrorReason::InputChromaFormatNotSupported);
        }
    }

    if luma_width != width {
        return unsupported(ErrorReason::WidthNotSupported);
    }
    if luma_height != height {
        return unsupported(ErrorReason::HeightNotSupported);
    }
    Ok(())
}
