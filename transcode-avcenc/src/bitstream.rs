//! Bit-level writer and NAL unit framing.

/// Annex B start code.
pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// NAL unit types written by the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NalUnitType {
    /// Coded slice of a non-IDR picture.
    Slice = 1,
    /// Coded slice of an IDR picture.
    IdrSlice = 5,
    /// Supplemental enhancement information.
    Sei = 6,
    /// Sequence parameter set.
    Sps = 7,
    /// Picture parameter set.
    Pps = 8,
}

/// MSB-first bit writer over a growable byte vector.
#[derive(Debug, Default, Clone)]
pub struct BitWriter {
    data: Vec<u8>,
    bit_pos: u8,
}

impl BitWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a writer with preallocated space.
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            data: Vec::with_capacity(bytes),
            bit_pos: 0,
        }
    }

    /// Number of bits written.
    pub fn bit_len(&self) -> usize {
        if self.bit_pos == 0 {
            self.data.len() * 8
        } else {
            (self.data.len() - 1) * 8 + self.bit_pos as usize
        }
    }

    /// Check if the writer sits on a byte boundary.
    pub fn is_byte_aligned(&self) -> bool {
        self.bit_pos == 0
    }

    pub fn write_bit(&mut self, bit: bool) {
        if self.bit_pos == 0 {
            self.data.push(0);
        }
        if bit {
            if let Some(last) = self.data.last_mut() {
                *last |= 1 << (7 - self.bit_pos);
            }
        }
        self.bit_pos = (self.bit_pos + 1) % 8;
    }

    /// Write the low `n` bits of `value`, MSB first.
    pub fn write_bits(&mut self, value: u32, n: u8) {
        debug_assert!(n <= 32);
        for i in (0..n).rev() {
            self.write_bit((value >> i) & 1 != 0);
        }
    }

    /// Write an unsigned Exp-Golomb code.
    pub fn write_ue(&mut self, value: u32) {
        let code = value as u64 + 1;
        let len = 64 - code.leading_zeros() as u8;
        for _ in 1..len {
            self.write_bit(false);
        }
        for i in (0..len).rev() {
            self.write_bit((code >> i) & 1 != 0);
        }
    }

    /// Write a signed Exp-Golomb code.
    pub fn write_se(&mut self, value: i32) {
        let mapped = if value > 0 {
            (value as u32) * 2 - 1
        } else {
            value.unsigned_abs() * 2
        };
        self.write_ue(mapped);
    }

    /// Write a whole byte; the writer must be aligned.
    pub fn write_byte(&mut self, byte: u8) {
        if self.is_byte_aligned() {
            self.data.push(byte);
        } else {
            self.write_bits(byte as u32, 8);
        }
    }

    /// Append the stop bit and zero-pad to a byte boundary.
    pub fn write_rbsp_trailing_bits(&mut self) {
        self.write_bit(true);
        while !self.is_byte_aligned() {
            self.write_bit(false);
        }
    }

    /// Written bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consume the writer.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// Insert emulation prevention bytes into an RBSP.
pub fn add_emulation_prevention(rbsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rbsp.len() + rbsp.len() / 64);
    let mut zeros = 0usize;
    for &byte in rbsp {
        if zeros >= 2 && byte <= 3 {
            out.push(3);
            zeros = 0;
        }
        out.push(byte);
        zeros = if byte == 0 { zeros + 1 } else { 0 };
    }
    out
}

/// Frame an RBSP as an Annex B NAL unit and append it to `out`.
pub fn write_nal(out: &mut Vec<u8>, nal_ref_idc: u8, nal_type: NalUnitType, rbsp: &[u8]) {
    out.extend_from_slice(&START_CODE);
    out.push(((nal_ref_idc & 0x3) << 5) | nal_type as u8);
    out.extend(add_emulation_prevention(rbsp));
}
