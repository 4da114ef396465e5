//! Macroblock row kernels.
//!
//! [`MacroblockKernels`] is the seam between frame orchestration and the
//! per-macroblock coding tools. The orchestrator only relies on the contract:
//! `process_row` fills the reconstruction and motion vectors of one row, and
//! `entropy_row` returns that row's coded bytes.

use crate::bitstream::BitWriter;
use crate::error::ErrorReason;
use crate::fmt_conv;
use crate::picture::MotionVector;
use crate::process::{PicContext, ProcessContext};

/// Coding tools applied to one macroblock row at a time.
pub trait MacroblockKernels: Send + Sync {
    /// Predict, transform and reconstruct row `mb_row`.
    fn process_row(
        &self,
        pic: &PicContext,
        mb_row: usize,
        ctx: &mut ProcessContext,
    ) -> Result<(), ErrorReason>;

    /// Entropy code row `mb_row`, which has already been processed.
    fn entropy_row(
        &self,
        pic: &PicContext,
        mb_row: usize,
        ctx: &mut ProcessContext,
    ) -> Result<Vec<u8>, ErrorReason>;
}

/// Sample-domain kernels: every macroblock is coded as quantized samples.
///
/// The QP selects how many low bits are dropped, so bit cost and
/// reconstruction error both follow rate control decisions.
#[derive(Debug, Clone, Copy, Default)]
pub struct PcmKernels;

impl PcmKernels {
    /// Low bits dropped at `qp`.
    pub fn shift_for_qp(qp: u8) -> u8 {
        (qp / 8).min(6)
    }

    fn quantize(sample: u8, shift: u8) -> u8 {
        if shift == 0 {
            return sample;
        }
        let half = 1u16 << (shift - 1);
        let level = ((sample as u16 + half) >> shift).min(0xff >> shift);
        (level << shift) as u8
    }
}

impl MacroblockKernels for PcmKernels {
    fn process_row(
        &self,
        pic: &PicContext,
        mb_row: usize,
        ctx: &mut ProcessContext,
    ) -> Result<(), ErrorReason> {
        let shift = Self::shift_for_qp(pic.qp);
        {
            let mut recon = pic.recon.write();
            recon.poc = pic.poc;
            let frame = &mut recon.frame;
            fmt_conv::import_mb_row(&pic.source, frame, mb_row, pic.width, pic.height);

            let luma_rows = mb_row * 16..(mb_row * 16 + 16).min(frame.planes[0].height as usize);
            let chroma_rows = mb_row * 8..(mb_row * 8 + 8).min(frame.planes[1].height as usize);
            for (plane, rows) in [(0, luma_rows), (1, chroma_rows.clone()), (2, chroma_rows)] {
                for y in rows {
                    for s in frame.planes[plane].row_mut(y) {
                        *s = Self::quantize(*s, shift);
                    }
                }
            }
        }

        pic.mvs.write().row_mut(mb_row).fill(MotionVector::default());
        ctx.scratch.clear();
        Ok(())
    }

    fn entropy_row(
        &self,
        pic: &PicContext,
        mb_row: usize,
        ctx: &mut ProcessContext,
    ) -> Result<Vec<u8>, ErrorReason> {
        let shift = Self::shift_for_qp(pic.qp);
        let bits = 8 - shift;
        let recon = pic.recon.read();
        let frame = &recon.frame;

        let mut w = BitWriter::with_capacity(pic.mb_width * 384);
        w.write_ue(mb_row as u32);
        for mb_x in 0..pic.mb_width {
            // mb_type: one I_PCM-like macroblock
            w.write_ue(25);
            let (x0, y0) = (mb_x * 16, mb_row * 16);
            for y in y0..y0 + 16 {
                for &s in &frame.planes[0].row(y)[x0..x0 + 16] {
                    w.write_bits((s >> shift) as u32, bits);
                }
            }
            let (cx0, cy0) = (mb_x * 8, mb_row * 8);
            for plane in 1..3 {
                for y in cy0..cy0 + 8 {
                    for &s in &frame.planes[plane].row(y)[cx0..cx0 + 8] {
                        w.write_bits((s >> shift) as u32, bits);
                    }
                }
            }
        }
        while !w.is_byte_aligned() {
            w.write_bit(false);
        }

        ctx.scratch.clear();
        ctx.scratch.extend_from_slice(w.data());
        Ok(w.into_data())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::tests::test_pic;

    #[test]
    fn test_quantize() {
        assert_eq!(PcmKernels::quantize(100, 0), 100);
        assert_eq!(PcmKernels::quantize(100, 3), 104);
        assert_eq!(PcmKernels::quantize(255, 3), 248);
        assert_eq!(PcmKernels::quantize(0, 6), 0);
    }

    #[test]
    fn test_row_size_follows_qp() {
        let kernels = PcmKernels;
        let mut ctx = ProcessContext::new(0);

        let mut low = test_pic(32, 16, 1 << 20);
        low.qp = 0;
        kernels.process_row(&low, 0, &mut ctx).unwrap();
        let fine = kernels.entropy_row(&low, 0, &mut ctx).unwrap();

        let mut high = test_pic(32, 16, 1 << 20);
        high.qp = 40;
        kernels.process_row(&high, 0, &mut ctx).unwrap();
        let coarse = kernels.entropy_row(&high, 0, &mut ctx).unwrap();

        assert!(coarse.len() < fine.len());
        // Two lossless macroblocks carry 384 bytes of samples each.
        assert!(fine.len() > 768);
    }

    #[test]
    fn test_lossless_reconstruction_at_qp_zero() {
        let kernels = PcmKernels;
        let mut ctx = ProcessContext::new(0);
        let mut pic = test_pic(16, 16, 1 << 20);
        pic.qp = 0;
        kernels.process_row(&pic, 0, &mut ctx).unwrap();

        let recon = pic.recon.read();
        assert_eq!(recon.frame.planes[0].row(5), pic.source.planes[0].row(5));
        assert_eq!(recon.poc, pic.poc);
    }
}
