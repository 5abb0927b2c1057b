//! Device-facing encoder configuration template.

use crate::params::{gop_preset, CustomGop, EncoderParams, REPEAT_HEADERS_ALL_I_FRAMES};
use crate::CodecFormat;

/// Encoder configuration as sent to the device at session open.
///
/// Produced either from the hardware defaults ([`EncoderTemplate::default_for`])
/// or by merging user overrides on top of them ([`EncoderTemplate::from_params`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderTemplate {
    pub codec: CodecFormat,
    pub pic_width: i32,
    pub pic_height: i32,
    pub src_bit_depth: i32,
    /// Integer frame rate reported to the rate controller.
    pub frame_rate: i32,
    pub bitrate: i64,
    pub rc_enable: i32,
    /// VBV buffer size in milliseconds.
    pub vbv_buffer_size: i32,
    pub user_qp_max: i32,
    pub user_qp_min: i32,
    pub user_max_delta_qp: i32,
    pub user_min_delta_qp: i32,
    pub max_intra_size: i32,
    pub filler_enable: i32,
    pub enable_aud: i32,
    pub flush_gop: i32,

    pub profile: i32,
    pub level: i32,
    pub tier: i32,
    pub lossless_enable: i32,
    pub gop_preset_index: i32,
    pub decoding_refresh_type: i32,
    pub intra_qp: i32,
    pub intra_period: i32,
    /// IDR period for H.264; not shared with `intra_period`.
    pub avc_idr_period: i32,
    pub conf_win_top: i32,
    pub conf_win_bottom: i32,
    pub conf_win_left: i32,
    pub conf_win_right: i32,
    pub use_recommend_enc_params: i32,
    pub cu_size_mode: i32,
    pub max_num_merge: i32,
    pub tmvp_enable: i32,
    pub sao_enable: i32,
    pub lf_cross_slice_boundary_enable: i32,
    pub strong_intra_smooth_enable: i32,
    pub enable_cu_level_rate_control: i32,
    pub enable_hvs_qp: i32,
    pub hvs_qp_scale: i32,
    pub max_delta_qp: i32,
    pub custom_gop: CustomGop,
    pub roi_enable: i32,
    pub use_long_term: i32,
    pub num_units_in_tick: i32,
    pub time_scale: i32,
    pub initial_rc_qp: i32,
    pub min_qp_i: i32,
    pub max_qp_i: i32,
    pub min_qp_p: i32,
    pub max_qp_p: i32,
    pub min_qp_b: i32,
    pub max_qp_b: i32,
    pub enable_transform_8x8: i32,
    pub avc_slice_mode: i32,
    pub avc_slice_arg: i32,
    pub entropy_coding_mode: i32,
    pub intra_mb_refresh_mode: i32,
    pub intra_mb_refresh_arg: i32,
    pub enable_mb_level_rc: i32,
    pub forced_header_enable: i32,

    /// Picture type used when a key frame is forced.
    pub key_frame_type: i32,
    /// Set when every frame's type is chosen by the application.
    pub force_frame_type: bool,
    /// Distance between key frames in GOP units; filled in by validation.
    pub keyframe_factor: i32,
}

impl EncoderTemplate {
    /// Hardware default template for a codec at the given source bit depth.
    #[must_use]
    pub fn default_for(codec: CodecFormat, src_bit_depth: i32) -> Self {
        let h264 = codec == CodecFormat::H264;
        let ten_bit = src_bit_depth == 10;
        let profile = match (h264, ten_bit) {
            (true, false) => 4,
            (true, true) => 5,
            (false, false) => 1,
            (false, true) => 2,
        };
        let frame_rate = 30;

        Self {
            codec,
            pic_width: 720,
            pic_height: 480,
            src_bit_depth,
            frame_rate,
            bitrate: 0,
            rc_enable: 0,
            vbv_buffer_size: 3000,
            user_qp_max: 51,
            user_qp_min: if h264 { 8 } else { 0 },
            user_max_delta_qp: if h264 { 51 } else { 0 },
            user_min_delta_qp: if h264 { 51 } else { 0 },
            max_intra_size: if h264 { 8_000_000 } else { 0 },
            filler_enable: 0,
            enable_aud: 0,
            flush_gop: 0,

            profile,
            level: 0,
            tier: 0,
            lossless_enable: 0,
            gop_preset_index: gop_preset::IBBBP,
            decoding_refresh_type: 2,
            intra_qp: crate::params::DEFAULT_INTRA_QP,
            intra_period: 92,
            avc_idr_period: 92,
            conf_win_top: 0,
            conf_win_bottom: 0,
            conf_win_left: 0,
            conf_win_right: 0,
            use_recommend_enc_params: 0,
            cu_size_mode: 7,
            max_num_merge: 2,
            tmvp_enable: 1,
            sao_enable: 1,
            lf_cross_slice_boundary_enable: 1,
            strong_intra_smooth_enable: 1,
            enable_cu_level_rate_control: 1,
            enable_hvs_qp: 0,
            hvs_qp_scale: 2,
            max_delta_qp: crate::params::DEFAULT_MAX_DELTA_QP,
            custom_gop: CustomGop::default(),
            roi_enable: 0,
            use_long_term: 0,
            num_units_in_tick: 1000,
            time_scale: frame_rate * 1000 * if h264 { 2 } else { 1 },
            initial_rc_qp: 63,
            min_qp_i: 8,
            max_qp_i: 51,
            min_qp_p: 8,
            max_qp_p: 51,
            min_qp_b: 8,
            max_qp_b: 51,
            enable_transform_8x8: 1,
            avc_slice_mode: 0,
            avc_slice_arg: 0,
            entropy_coding_mode: 1,
            intra_mb_refresh_mode: 0,
            intra_mb_refresh_arg: 0,
            enable_mb_level_rc: 1,
            forced_header_enable: 0,

            key_frame_type: 2,
            force_frame_type: false,
            keyframe_factor: 1,
        }
    }

    /// Merge user overrides onto the hardware defaults.
    ///
    /// The result still has to pass [`crate::validate`] before it is sent.
    #[must_use]
    pub fn from_params(params: &EncoderParams, codec: CodecFormat, src_bit_depth: i32) -> Self {
        let mut t = Self::default_for(codec, src_bit_depth);
        let rc = &params.rc;

        t.pic_width = params.source_width;
        t.pic_height = params.source_height;
        t.gop_preset_index = params.gop_preset_index;
        t.use_recommend_enc_params = params.use_recommend_enc_params;
        t.rc_enable = rc.enable_rate_control;
        if params.bitrate != 0 {
            t.bitrate = params.bitrate;
        }
        t.enable_cu_level_rate_control = rc.enable_cu_level_rate_control;
        t.enable_hvs_qp = rc.enable_hvs_qp;
        t.hvs_qp_scale = rc.hvs_qp_scale;
        t.min_qp_i = rc.min_qp;
        t.min_qp_p = rc.min_qp;
        t.min_qp_b = rc.min_qp;
        t.max_qp_i = rc.max_qp;
        t.max_qp_p = rc.max_qp;
        t.max_qp_b = rc.max_qp;
        t.max_delta_qp = rc.max_delta_qp;
        t.vbv_buffer_size = rc.rc_init_delay;
        t.intra_period = params.intra_period;
        t.roi_enable = params.roi_enable;
        t.use_long_term = params.long_term_ref_enable;
        t.lossless_enable = params.lossless_enable;
        t.conf_win_top = params.conf_win_top;
        t.conf_win_bottom = params.conf_win_bottom;
        t.conf_win_left = params.conf_win_left;
        t.conf_win_right = params.conf_win_right;
        t.avc_idr_period = params.intra_period;

        if t.frame_rate != params.frame_rate {
            t.frame_rate = params.frame_rate;
            t.num_units_in_tick = 1000;
            if params.fps_den != 0 && params.fps_num % params.fps_den != 0 {
                t.num_units_in_tick += 1;
                t.frame_rate += 1;
            }
            t.time_scale = t.frame_rate * 1000;
            if codec == CodecFormat::H264 {
                t.time_scale *= 2;
            }
        }

        t.intra_qp = rc.intra_qp;

        // Only "all I frames" maps onto the device's forced header mode.
        if params.forced_header_enable == REPEAT_HEADERS_ALL_I_FRAMES {
            t.forced_header_enable = 2;
        }

        t.decoding_refresh_type = params.decoding_refresh_type;
        match codec {
            CodecFormat::H264 => match t.decoding_refresh_type {
                0 => t.avc_idr_period = 0,
                1 | 2 => t.intra_period = 0,
                _ => {}
            },
            CodecFormat::H265 => t.avc_idr_period = 0,
        }

        t.enable_transform_8x8 = params.enable_transform_8x8;
        t.avc_slice_mode = params.avc_slice_mode;
        t.avc_slice_arg = params.avc_slice_arg;
        t.entropy_coding_mode = params.entropy_coding_mode;
        t.intra_mb_refresh_mode = params.intra_mb_refresh_mode;
        t.intra_mb_refresh_arg = params.intra_mb_refresh_arg;
        t.enable_mb_level_rc = rc.enable_mb_level_rc;

        if params.profile != 0 {
            t.profile = params.profile;
        }
        t.level = params.level_idc;

        // 8-bit H.264 main, extended and baseline profiles lack these tools
        if codec == CodecFormat::H264 && src_bit_depth == 8 {
            match t.profile {
                2 => t.enable_transform_8x8 = 0,
                1 | 3 => {
                    t.entropy_coding_mode = 0;
                    t.enable_transform_8x8 = 0;
                }
                _ => {}
            }
        }

        if t.gop_preset_index == gop_preset::CUSTOM {
            t.custom_gop = params.custom_gop;
            let intra_qp = t.intra_qp;
            for pic in t.custom_gop.pictures.iter_mut().take(params.custom_gop.active().len()) {
                pic.pic_qp += intra_qp;
            }
        }

        t.key_frame_type = t.decoding_refresh_type;
        if params.force_frame_type == 1 {
            t.intra_period = 0;
            t.avc_idr_period = 0;
            t.gop_preset_index = gop_preset::RA_IB;
            t.force_frame_type = true;
        }

        t.enable_aud = params.enable_aud;
        t.flush_gop = params.flush_gop;

        if params.crf != 0 {
            t.rc_enable = 0;
            t.intra_qp = params.crf;
            t.enable_hvs_qp = 1;
            t.hvs_qp_scale = 2;
            t.max_delta_qp = 51;
        }
        if params.cbr != 0 && t.rc_enable != 0 {
            t.filler_enable = 1;
        }

        t
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(width: i32, height: i32) -> EncoderParams {
        EncoderParams::init_default(30, 1, 0, width, height).unwrap()
    }

    #[test]
    fn test_default_profiles() {
        assert_eq!(EncoderTemplate::default_for(CodecFormat::H264, 8).profile, 4);
        assert_eq!(EncoderTemplate::default_for(CodecFormat::H264, 10).profile, 5);
        assert_eq!(EncoderTemplate::default_for(CodecFormat::H265, 8).profile, 1);
        assert_eq!(EncoderTemplate::default_for(CodecFormat::H265, 10).profile, 2);
    }

    #[test]
    fn test_default_time_scale() {
        assert_eq!(EncoderTemplate::default_for(CodecFormat::H264, 8).time_scale, 60_000);
        assert_eq!(EncoderTemplate::default_for(CodecFormat::H265, 8).time_scale, 30_000);
    }

    #[test]
    fn test_merge_copies_overrides() {
        let mut p = params(1920, 1080);
        p.bitrate = 5_000_000;
        p.rc.enable_rate_control = 1;
        p.rc.min_qp = 10;
        p.rc.max_qp = 40;
        let t = EncoderTemplate::from_params(&p, CodecFormat::H265, 8);
        assert_eq!((t.pic_width, t.pic_height), (1920, 1080));
        assert_eq!(t.bitrate, 5_000_000);
        assert_eq!(t.rc_enable, 1);
        assert_eq!((t.min_qp_i, t.min_qp_p, t.min_qp_b), (10, 10, 10));
        assert_eq!((t.max_qp_i, t.max_qp_p, t.max_qp_b), (40, 40, 40));
        assert_eq!(t.forced_header_enable, 2);
        // HEVC never uses the IDR period
        assert_eq!(t.avc_idr_period, 0);
        assert_eq!(t.intra_period, 92);
    }

    #[test]
    fn test_fractional_frame_rate_ticks() {
        let p = EncoderParams::init_default(30000, 1001, 0, 1280, 720).unwrap();
        assert_eq!(p.frame_rate, 29);
        let t = EncoderTemplate::from_params(&p, CodecFormat::H264, 8);
        assert_eq!(t.num_units_in_tick, 1001);
        assert_eq!(t.frame_rate, 30);
        assert_eq!(t.time_scale, 60_000);
    }

    #[test]
    fn test_avc_refresh_type_rules() {
        let mut p = params(1280, 720);
        p.decoding_refresh_type = 0;
        let t = EncoderTemplate::from_params(&p, CodecFormat::H264, 8);
        assert_eq!((t.intra_period, t.avc_idr_period), (92, 0));

        p.decoding_refresh_type = 2;
        let t = EncoderTemplate::from_params(&p, CodecFormat::H264, 8);
        assert_eq!((t.intra_period, t.avc_idr_period), (0, 92));
    }

    #[test]
    fn test_baseline_profile_disables_cabac() {
        let mut p = params(1280, 720);
        p.profile = 1;
        let t = EncoderTemplate::from_params(&p, CodecFormat::H264, 8);
        assert_eq!(t.entropy_coding_mode, 0);
        assert_eq!(t.enable_transform_8x8, 0);

        p.profile = 2;
        let t = EncoderTemplate::from_params(&p, CodecFormat::H264, 8);
        assert_eq!(t.entropy_coding_mode, 1);
        assert_eq!(t.enable_transform_8x8, 0);
    }

    #[test]
    fn test_custom_gop_qp_is_relative() {
        let mut p = params(1280, 720);
        p.gop_preset_index = gop_preset::CUSTOM;
        p.custom_gop.size = 1;
        p.custom_gop.pictures[0].pic_type = 1;
        p.custom_gop.pictures[0].poc_offset = 1;
        p.custom_gop.pictures[0].pic_qp = 3;
        p.custom_gop.pictures[1].pic_qp = 5;
        let t = EncoderTemplate::from_params(&p, CodecFormat::H265, 8);
        assert_eq!(t.custom_gop.pictures[0].pic_qp, 25);
        // entries past the GOP size are copied untouched
        assert_eq!(t.custom_gop.pictures[1].pic_qp, 5);
    }

    #[test]
    fn test_force_frame_type() {
        let mut p = params(1280, 720);
        p.force_frame_type = 1;
        let t = EncoderTemplate::from_params(&p, CodecFormat::H265, 8);
        assert!(t.force_frame_type);
        assert_eq!(t.gop_preset_index, gop_preset::RA_IB);
        assert_eq!((t.intra_period, t.avc_idr_period), (0, 0));
    }

    #[test]
    fn test_crf_and_cbr() {
        let mut p = params(1280, 720);
        p.crf = 28;
        p.rc.enable_rate_control = 1;
        let t = EncoderTemplate::from_params(&p, CodecFormat::H265, 8);
        assert_eq!(t.rc_enable, 0);
        assert_eq!(t.intra_qp, 28);
        assert_eq!(t.max_delta_qp, 51);

        let mut p = params(1280, 720);
        p.cbr = 1;
        p.rc.enable_rate_control = 1;
        let t = EncoderTemplate::from_params(&p, CodecFormat::H265, 8);
        assert_eq!(t.filler_enable, 1);
    }
}
