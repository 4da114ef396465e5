//! Colour format conversion between caller buffers and internal pictures.
//!
//! Internal pictures are planar 4:2:0 padded to whole macroblocks. Input rows
//! are converted into that layout one macroblock row at a time; padding
//! replicates the last column and row of the display area.

use crate::frame::{ColorFormat, RawBuffer};

/// Convert one macroblock row of `source` into the padded 4:2:0 picture `dst`.
pub fn import_mb_row(source: &RawBuffer, dst: &mut RawBuffer, mb_row: usize, width: u32, height: u32) {
    let (w, h) = (width as usize, height as usize);
    let padded_w = dst.planes[0].width as usize;
    let padded_h = dst.planes[0].height as usize;

    let y_start = mb_row * 16;
    for y in y_start..(y_start + 16).min(padded_h) {
        let sy = y.min(h - 1);
        let row = dst.planes[0].row_mut(y);
        for (x, sample) in row.iter_mut().enumerate().take(padded_w) {
            *sample = source.luma(x.min(w - 1), sy);
        }
    }

    let (cw, ch) = (w / 2, h / 2);
    let c_start = mb_row * 8;
    let c_end = (c_start + 8).min(dst.planes[1].height as usize);
    let padded_cw = dst.planes[1].width as usize;
    for cy in c_start..c_end {
        let sy = cy.min(ch - 1);
        for cx in 0..padded_cw {
            let (u, v) = source.chroma(cx.min(cw - 1), sy);
            let stride = dst.planes[1].stride;
            dst.planes[1].data[cy * stride + cx] = u;
            dst.planes[2].data[cy * stride + cx] = v;
        }
    }
}

/// Crop a padded 4:2:0 picture to the display area and convert it.
pub fn export_recon(pic: &RawBuffer, format: ColorFormat, width: u32, height: u32) -> RawBuffer {
    let mut out = RawBuffer::alloc(format, width, height);
    export_recon_into(pic, &mut out);
    out
}

/// Like [`export_recon`], writing into a caller buffer sized for its format.
pub fn export_recon_into(pic: &RawBuffer, out: &mut RawBuffer) {
    let (w, h) = (out.width() as usize, out.height() as usize);
    let format = out.format;

    for y in 0..h {
        out.planes[0].row_mut(y).copy_from_slice(&pic.planes[0].row(y)[..w]);
    }

    let (cw, ch) = (w / 2, h / 2);
    for cy in 0..ch {
        let (u, v) = (&pic.planes[1].row(cy)[..cw], &pic.planes[2].row(cy)[..cw]);
        match format {
            ColorFormat::Yuv420p => {
                out.planes[1].row_mut(cy).copy_from_slice(u);
                out.planes[2].row_mut(cy).copy_from_slice(v);
            }
            ColorFormat::Yuv420spUv | ColorFormat::Yuv420spVu => {
                let swap = format == ColorFormat::Yuv420spVu;
                let row = out.planes[1].row_mut(cy);
                for (cx, pair) in row.chunks_exact_mut(2).enumerate() {
                    let (a, b) = if swap { (v[cx], u[cx]) } else { (u[cx], v[cx]) };
                    pair[0] = a;
                    pair[1] = b;
                }
            }
            // Rejected by config validation.
            _ => {}
        }
    }
}
