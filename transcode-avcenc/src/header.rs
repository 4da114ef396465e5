//! Parameter set, SEI and slice header generation.

use crate::bitstream::{write_nal, BitWriter, NalUnitType};
use crate::config::EncoderConfig;
use crate::error::ErrorReason;
use crate::picture::PicType;
use crate::sei::{SeiParams, SeiPresent};

/// `log2_max_frame_num_minus4` written in the SPS.
pub const LOG2_MAX_FRAME_NUM_MINUS4: u32 = 4;
/// `log2_max_pic_order_cnt_lsb_minus4` written in the SPS.
pub const LOG2_MAX_POC_LSB_MINUS4: u32 = 4;

/// Fields of one slice header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceInfo {
    pub pic_type: PicType,
    pub frame_num: u32,
    pub poc: i32,
    pub idr_pic_id: u32,
    pub qp: u8,
}

/// Writes complete NAL units for headers and slices.
pub trait HeaderWriter: Send {
    fn write_sps(&mut self, config: &EncoderConfig, out: &mut Vec<u8>) -> Result<(), ErrorReason>;

    fn write_pps(&mut self, config: &EncoderConfig, out: &mut Vec<u8>) -> Result<(), ErrorReason>;

    /// Write one SEI NAL unit carrying every message in `present`.
    fn write_sei(
        &mut self,
        sei: &SeiParams,
        present: SeiPresent,
        out: &mut Vec<u8>,
    ) -> Result<(), ErrorReason>;

    /// Write a slice NAL unit with `payload` following the header.
    fn write_slice(
        &mut self,
        slice: &SliceInfo,
        payload: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<(), ErrorReason>;
}

/// Baseline-style SPS/PPS and slice header writer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParameterSetWriter;

impl ParameterSetWriter {
    fn sei_message(w: &mut BitWriter, payload_type: u32, payload: &[u8]) {
        for mut value in [payload_type, payload.len() as u32] {
            while value >= 255 {
                w.write_byte(0xff);
                value -= 255;
            }
            w.write_byte(value as u8);
        }
        for &b in payload {
            w.write_byte(b);
        }
    }
}

impl HeaderWriter for ParameterSetWriter {
    fn write_sps(&mut self, config: &EncoderConfig, out: &mut Vec<u8>) -> Result<(), ErrorReason> {
        let mut w = BitWriter::with_capacity(32);
        w.write_bits(config.profile.idc() as u32, 8);
        // constraint_set0_flag for baseline, others zero
        w.write_bits(if config.num_bframes == 0 { 0x80 } else { 0 }, 8);
        w.write_bits(config.level_idc as u32, 8);
        w.write_ue(0); // seq_parameter_set_id
        if config.profile == crate::config::Profile::High {
            w.write_ue(1); // chroma_format_idc
            w.write_ue(0); // bit_depth_luma_minus8
            w.write_ue(0); // bit_depth_chroma_minus8
            w.write_bit(false); // qpprime_y_zero_transform_bypass_flag
            w.write_bit(false); // seq_scaling_matrix_present_flag
        }
        w.write_ue(LOG2_MAX_FRAME_NUM_MINUS4);
        w.write_ue(0); // pic_order_cnt_type
        w.write_ue(LOG2_MAX_POC_LSB_MINUS4);
        w.write_ue(config.effective_ref_frames() as u32);
        w.write_bit(false); // gaps_in_frame_num_value_allowed_flag
        w.write_ue(config.mb_width() as u32 - 1);
        w.write_ue(config.mb_height() as u32 - 1);
        w.write_bit(true); // frame_mbs_only_flag
        w.write_bit(true); // direct_8x8_inference_flag

        let crop_right = (config.mb_width() as u32 * 16 - config.width) / 2;
        let crop_bottom = (config.mb_height() as u32 * 16 - config.height) / 2;
        let crop = crop_right > 0 || crop_bottom > 0;
        w.write_bit(crop);
        if crop {
            w.write_ue(0);
            w.write_ue(crop_right);
            w.write_ue(0);
            w.write_ue(crop_bottom);
        }

        // VUI with timing only
        w.write_bit(true);
        w.write_bit(false); // aspect_ratio_info_present_flag
        w.write_bit(false); // overscan_info_present_flag
        w.write_bit(false); // video_signal_type_present_flag
        w.write_bit(false); // chroma_loc_info_present_flag
        w.write_bit(true); // timing_info_present_flag
        w.write_bits(config.frame_rate.1, 32);
        w.write_bits(config.frame_rate.0.saturating_mul(2), 32);
        w.write_bit(true); // fixed_frame_rate_flag
        w.write_bit(false); // nal_hrd_parameters_present_flag
        w.write_bit(false); // vcl_hrd_parameters_present_flag
        w.write_bit(false); // pic_struct_present_flag
        w.write_bit(false); // bitstream_restriction_flag
        w.write_rbsp_trailing_bits();

        write_nal(out, 3, NalUnitType::Sps, w.data());
        Ok(())
    }

    fn write_pps(&mut self, config: &EncoderConfig, out: &mut Vec<u8>) -> Result<(), ErrorReason> {
        let mut w = BitWriter::with_capacity(8);
        w.write_ue(0); // pic_parameter_set_id
        w.write_ue(0); // seq_parameter_set_id
        w.write_bit(false); // entropy_coding_mode_flag
        w.write_bit(false); // bottom_field_pic_order_in_frame_present_flag
        w.write_ue(0); // num_slice_groups_minus1
        w.write_ue(0); // num_ref_idx_l0_default_active_minus1
        w.write_ue(0); // num_ref_idx_l1_default_active_minus1
        w.write_bit(false); // weighted_pred_flag
        w.write_bits(0, 2); // weighted_bipred_idc
        let init_qp = match config.rate_control {
            crate::config::RateControlMode::Cqp(qp) => qp as i32,
            _ => 26,
        };
        w.write_se(init_qp - 26); // pic_init_qp_minus26
        w.write_se(0); // pic_init_qs_minus26
        w.write_se(0); // chroma_qp_index_offset
        w.write_bit(true); // deblocking_filter_control_present_flag
        w.write_bit(false); // constrained_intra_pred_flag
        w.write_bit(false); // redundant_pic_cnt_present_flag
        w.write_rbsp_trailing_bits();

        write_nal(out, 3, NalUnitType::Pps, w.data());
        Ok(())
    }

    fn write_sei(
        &mut self,
        sei: &SeiParams,
        present: SeiPresent,
        out: &mut Vec<u8>,
    ) -> Result<(), ErrorReason> {
        if present.is_empty() {
            return Ok(());
        }
        let mut w = BitWriter::with_capacity(64);

        if present.contains(SeiPresent::MASTERING_DISPLAY) {
            let m = &sei.mastering_display;
            let mut p = Vec::with_capacity(24);
            for c in 0..3 {
                p.extend_from_slice(&m.display_primaries_x[c].to_be_bytes());
                p.extend_from_slice(&m.display_primaries_y[c].to_be_bytes());
            }
            p.extend_from_slice(&m.white_point_x.to_be_bytes());
            p.extend_from_slice(&m.white_point_y.to_be_bytes());
            p.extend_from_slice(&m.max_display_mastering_luminance.to_be_bytes());
            p.extend_from_slice(&m.min_display_mastering_luminance.to_be_bytes());
            Self::sei_message(&mut w, 137, &p);
        }
        if present.contains(SeiPresent::CONTENT_LIGHT) {
            let c = &sei.content_light;
            let mut p = Vec::with_capacity(4);
            p.extend_from_slice(&c.max_content_light_level.to_be_bytes());
            p.extend_from_slice(&c.max_pic_average_light_level.to_be_bytes());
            Self::sei_message(&mut w, 144, &p);
        }
        if present.contains(SeiPresent::AMBIENT_VIEWING) {
            let a = &sei.ambient_viewing;
            let mut p = Vec::with_capacity(8);
            p.extend_from_slice(&a.ambient_illuminance.to_be_bytes());
            p.extend_from_slice(&a.ambient_light_x.to_be_bytes());
            p.extend_from_slice(&a.ambient_light_y.to_be_bytes());
            Self::sei_message(&mut w, 148, &p);
        }
        if present.contains(SeiPresent::SHUTTER_INTERVAL) {
            let s = &sei.shutter_interval;
            let mut b = BitWriter::new();
            b.write_ue(s.sub_layer_idx);
            if s.sub_layer_idx == 0 {
                b.write_bit(s.info_present);
                if s.info_present {
                    b.write_bits(s.time_scale, 32);
                    b.write_bit(s.fixed_within_cvs);
                    if s.fixed_within_cvs {
                        b.write_bits(s.num_units_in_shutter_interval, 32);
                    } else {
                        b.write_bits(s.max_sub_layers_minus1 as u32, 3);
                        for units in &s.sub_layer_num_units[..s.active_sub_layers()] {
                            b.write_bits(*units, 32);
                        }
                    }
                }
            }
            if !b.is_byte_aligned() {
                b.write_rbsp_trailing_bits();
            }
            Self::sei_message(&mut w, 205, b.data());
        }

        w.write_rbsp_trailing_bits();
        write_nal(out, 0, NalUnitType::Sei, w.data());
        Ok(())
    }

    fn write_slice(
        &mut self,
        slice: &SliceInfo,
        payload: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<(), ErrorReason> {
        let is_idr = slice.pic_type == PicType::Idr;
        let mut w = BitWriter::with_capacity(payload.len() + 16);
        w.write_ue(0); // first_mb_in_slice
        let slice_type = match slice.pic_type {
            PicType::P => 0,
            PicType::B => 1,
            PicType::Idr | PicType::I => 2,
        };
        w.write_ue(slice_type + 5);
        w.write_ue(0); // pic_parameter_set_id
        let frame_num_bits = (LOG2_MAX_FRAME_NUM_MINUS4 + 4) as u8;
        w.write_bits(slice.frame_num & ((1 << frame_num_bits) - 1), frame_num_bits);
        if is_idr {
            w.write_ue(slice.idr_pic_id);
        }
        let poc_bits = (LOG2_MAX_POC_LSB_MINUS4 + 4) as u8;
        w.write_bits((slice.poc * 2) as u32 & ((1 << poc_bits) - 1), poc_bits);
        if slice.pic_type == PicType::B {
            w.write_bit(true); // direct_spatial_mv_pred_flag
        }
        if matches!(slice.pic_type, PicType::P | PicType::B) {
            w.write_bit(false); // num_ref_idx_active_override_flag
            w.write_bit(false); // ref_pic_list_modification_flag_l0
            if slice.pic_type == PicType::B {
                w.write_bit(false); // ref_pic_list_modification_flag_l1
            }
        }
        if slice.pic_type.is_reference() {
            if is_idr {
                w.write_bit(false); // no_output_of_prior_pics_flag
                w.write_bit(false); // long_term_reference_flag
            } else {
                w.write_bit(false); // adaptive_ref_pic_marking_mode_flag
            }
        }
        w.write_se(slice.qp as i32 - 26);
        w.write_ue(1); // disable_deblocking_filter_idc
        while !w.is_byte_aligned() {
            w.write_bit(true);
        }
        for &b in payload {
            w.write_byte(b);
        }
        w.write_rbsp_trailing_bits();

        let nal_ref_idc = if slice.pic_type.is_reference() { 2 } else { 0 };
        let nal_type = if is_idr {
            NalUnitType::IdrSlice
        } else {
            NalUnitType::Slice
        };
        write_nal(out, nal_ref_idc, nal_type, w.data());
        Ok(())
    }
}
