//! Reconstruction quality metrics.
//!
//! PSNR is computed per plane over the display area, comparing the
//! reconstructed picture against the source it was coded from. Rows are
//! reduced in parallel.

use rayon::prelude::*;

use crate::frame::RawBuffer;

/// PSNR of the three colour planes, in dB.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanePsnr {
    pub y: f64,
    pub u: f64,
    pub v: f64,
}

impl PlanePsnr {
    /// Luma-weighted average (4:1:1).
    pub fn weighted(&self) -> f64 {
        let finite = |v: f64| if v.is_finite() { v } else { MAX_PSNR };
        (4.0 * finite(self.y) + finite(self.u) + finite(self.v)) / 6.0
    }
}

/// PSNR reported for identical planes when a finite value is needed.
pub const MAX_PSNR: f64 = 100.0;

fn psnr_from_sse(sse: u64, samples: usize) -> f64 {
    if samples == 0 || sse == 0 {
        return f64::INFINITY;
    }
    let mse = sse as f64 / samples as f64;
    10.0 * (255.0 * 255.0 / mse).log10()
}

/// Compute plane PSNR of `recon` (planar 4:2:0) against `source`.
pub fn compute_psnr(source: &RawBuffer, recon: &RawBuffer, width: u32, height: u32) -> PlanePsnr {
    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = (w / 2, h / 2);

    let luma_sse: u64 = (0..h)
        .into_par_iter()
        .map(|y| {
            let rec = recon.planes[0].row(y);
            (0..w)
                .map(|x| {
                    let d = source.luma(x, y) as i64 - rec[x] as i64;
                    (d * d) as u64
                })
                .sum::<u64>()
        })
        .sum();

    let (u_sse, v_sse) = (0..ch)
        .into_par_iter()
        .map(|cy| {
            let (rec_u, rec_v) = (recon.planes[1].row(cy), recon.planes[2].row(cy));
            (0..cw).fold((0u64, 0u64), |(su, sv), cx| {
                let (u, v) = source.chroma(cx, cy);
                let du = u as i64 - rec_u[cx] as i64;
                let dv = v as i64 - rec_v[cx] as i64;
                (su + (du * du) as u64, sv + (dv * dv) as u64)
            })
        })
        .reduce(|| (0, 0), |a, b| (a.0 + b.0, a.1 + b.1));

    PlanePsnr {
        y: psnr_from_sse(luma_sse, w * h),
        u: psnr_from_sse(u_sse, cw * ch),
        v: psnr_from_sse(v_sse, cw * ch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ColorFormat;

    fn gradient(format: ColorFormat, w: u32, h: u32) -> RawBuffer {
        let mut buf = RawBuffer::alloc(format, w, h);
        for plane in &mut buf.planes {
            for (i, b) in plane.data.iter_mut().enumerate() {
                *b = (i % 251) as u8;
            }
        }
        buf
    }

    #[test]
    fn test_identical_is_infinite() {
        let src = gradient(ColorFormat::Yuv420p, 32, 32);
        let psnr = compute_psnr(&src, &src, 32, 32);
        assert!(psnr.y.is_infinite());
        assert!(psnr.u.is_infinite());
        assert_eq!(psnr.weighted(), MAX_PSNR);
    }

    #[test]
    fn test_uniform_error() {
        let src = RawBuffer::alloc(ColorFormat::Yuv420p, 16, 16);
        let mut rec = src.clone();
        for b in &mut rec.planes[0].data {
            *b = 10;
        }
        let psnr = compute_psnr(&src, &rec, 16, 16);
        // MSE = 100 -> 10*log10(65025/100)
        assert!((psnr.y - 28.1308).abs() < 0.001);
        assert!(psnr.v.is_infinite());
    }

    #[test]
    fn test_semi_planar_source() {
        let src = gradient(ColorFormat::Yuv420spUv, 16, 16);
        let mut rec = RawBuffer::alloc(ColorFormat::Yuv420p, 16, 16);
        rec.planes[0].data.copy_from_slice(&src.planes[0].data);
        for cy in 0..8 {
            for cx in 0..8 {
                let (u, v) = src.chroma(cx, cy);
                rec.planes[1].data[cy * 8 + cx] = u;
                rec.planes[2].data[cy * 8 + cx] = v;
            }
        }
        let psnr = compute_psnr(&src, &rec, 16, 16);
        assert!(psnr.y.is_infinite() && psnr.u.is_infinite() && psnr.v.is_infinite());
    }
}
