//! Cross-field validation of a merged encoder template.

use tracing::{debug, warn};

use crate::params::{gop_preset, pic_type, EncoderParams, MAX_BITRATE, MAX_GOP_NUM, MAX_QP};
use crate::{CodecFormat, EncoderTemplate, ParamError, Result};

pub const MIN_ENC_PIC_WIDTH: i32 = 256;
pub const MAX_ENC_PIC_WIDTH: i32 = 8192;
pub const MIN_ENC_PIC_HEIGHT: i32 = 128;
pub const MAX_ENC_PIC_HEIGHT: i32 = 8192;

/// GOP length of each preset, indexed by preset number.
const PRESET_GOP_SIZE: [i32; 9] = [1, 1, 1, 1, 2, 4, 4, 4, 8];
/// Key frame spacing factor of each preset, indexed by preset number.
const PRESET_GOP_KEY_FRAME_FACTOR: [i32; 9] = [1, 1, 1, 1, 2, 4, 1, 1, 1];

fn preset_gop_size(index: i32) -> i32 {
    usize::try_from(index)
        .ok()
        .and_then(|i| PRESET_GOP_SIZE.get(i).copied())
        .unwrap_or(1)
}

fn preset_key_frame_factor(index: i32) -> i32 {
    usize::try_from(index)
        .ok()
        .and_then(|i| PRESET_GOP_KEY_FRAME_FACTOR.get(i).copied())
        .unwrap_or(1)
}

/// Validate a merged template against the parameters it was built from.
///
/// On success the template's `keyframe_factor` is filled in and, for H.264
/// with low-delay POC type requested, the GOP preset is remapped to its
/// POC-type-2 variant.
pub fn validate(t: &mut EncoderTemplate, params: &EncoderParams) -> Result<()> {
    let codec = t.codec;

    if t.frame_rate == 0 {
        return Err(ParamError::FrameRate("frame rate is zero".into()));
    }
    if t.bitrate <= i64::from(t.frame_rate) {
        return Err(ParamError::Bitrate(format!(
            "bitrate {} must exceed frame rate {}",
            t.bitrate, t.frame_rate
        )));
    }
    if t.bitrate > MAX_BITRATE || t.bitrate < 0 {
        return Err(ParamError::Bitrate(format!("bitrate {} out of range", t.bitrate)));
    }
    if !(MIN_ENC_PIC_WIDTH..=MAX_ENC_PIC_WIDTH).contains(&params.source_width) {
        return Err(ParamError::PicWidth(params.source_width.to_string()));
    }
    if !(MIN_ENC_PIC_HEIGHT..=MAX_ENC_PIC_HEIGHT).contains(&params.source_height) {
        return Err(ParamError::PicHeight(params.source_height.to_string()));
    }

    check_intra_refresh(t, params)?;
    check_profile(t)?;

    if params.force_frame_type != 0 && params.force_frame_type != 1 {
        return Err(ParamError::invalid(format!(
            "forceFrameType {} must be 0 or 1",
            params.force_frame_type
        )));
    }
    if !(0..=2).contains(&t.forced_header_enable) {
        return Err(ParamError::InvalidValue(format!(
            "forced header mode {}",
            t.forced_header_enable
        )));
    }
    if !(0..=2).contains(&t.decoding_refresh_type) {
        return Err(ParamError::DecodingRefreshType(t.decoding_refresh_type.to_string()));
    }
    if !(gop_preset::CUSTOM..=gop_preset::SP).contains(&t.gop_preset_index) {
        return Err(ParamError::GopPreset(format!(
            "preset {} out of range",
            t.gop_preset_index
        )));
    }
    if t.gop_preset_index == gop_preset::CUSTOM
        && !(1..=MAX_GOP_NUM as i32).contains(&t.custom_gop.size)
    {
        return Err(ParamError::CustomGop(format!("size {}", t.custom_gop.size)));
    }
    if !(0..=3).contains(&t.use_recommend_enc_params) {
        return Err(ParamError::UseRecommend(t.use_recommend_enc_params.to_string()));
    }
    // in fast mode (3) the firmware picks the merge candidates
    if t.use_recommend_enc_params != 3 && !(0..=3).contains(&t.max_num_merge) {
        return Err(ParamError::MaxNumMerge(t.max_num_merge.to_string()));
    }
    if !(0..=MAX_QP).contains(&t.intra_qp) {
        return Err(ParamError::IntraQp(t.intra_qp.to_string()));
    }
    if t.enable_mb_level_rc != 0 && t.enable_mb_level_rc != 1 {
        return Err(ParamError::RcEnable(format!(
            "mb level rc {}",
            t.enable_mb_level_rc
        )));
    }
    if t.enable_mb_level_rc == 1 {
        if !(0..=MAX_QP).contains(&t.min_qp_i) {
            return Err(ParamError::MinQp(t.min_qp_i.to_string()));
        }
        if !(0..=MAX_QP).contains(&t.max_qp_i) {
            return Err(ParamError::MaxQp(t.max_qp_i.to_string()));
        }
        if t.enable_cu_level_rate_control != 0 && t.enable_cu_level_rate_control != 1 {
            return Err(ParamError::CuLevelRc(t.enable_cu_level_rate_control.to_string()));
        }
        if t.enable_cu_level_rate_control == 1 {
            if t.enable_hvs_qp != 0 && t.enable_hvs_qp != 1 {
                return Err(ParamError::HvsQp(t.enable_hvs_qp.to_string()));
            }
            if t.enable_hvs_qp == 1 && !(0..=MAX_QP).contains(&t.max_delta_qp) {
                return Err(ParamError::MaxDeltaQp(t.max_delta_qp.to_string()));
            }
        }
        if !(10..=3000).contains(&t.vbv_buffer_size) {
            return Err(ParamError::RcInitDelay(t.vbv_buffer_size.to_string()));
        }
    }

    check_common_params(t, params)?;
    check_rate_control(t)?;

    if t.gop_preset_index != gop_preset::CUSTOM {
        t.keyframe_factor = preset_key_frame_factor(t.gop_preset_index);
    }

    if codec == CodecFormat::H264 && params.use_low_delay_poc_type != 0 {
        let remapped = match t.gop_preset_index {
            gop_preset::ALL_I => 17,
            gop_preset::IPP => 18,
            gop_preset::IBBB => 19,
            gop_preset::IPPPP => 20,
            gop_preset::IBBBB => 21,
            gop_preset::SP => 22,
            other => other,
        };
        if remapped != t.gop_preset_index {
            debug!("gop preset {} -> {} for poc type 2", t.gop_preset_index, remapped);
            t.gop_preset_index = remapped;
        }
    }

    Ok(())
}

fn check_intra_refresh(t: &EncoderTemplate, params: &EncoderParams) -> Result<()> {
    let block = t.codec.block_size();
    let rows = (params.source_height + block - 1) / block;
    let cols = (params.source_width + block - 1) / block;
    let mode = t.intra_mb_refresh_mode;
    let arg = t.intra_mb_refresh_arg;

    if mode == 4 && t.codec == CodecFormat::H264 {
        return Err(ParamError::invalid("intra refresh mode 4 is HEVC only"));
    }
    if mode != 0 && arg <= 0 {
        return Err(ParamError::invalid(format!(
            "intra refresh mode {mode} needs a positive argument"
        )));
    }
    let limit = match mode {
        1 => rows,
        2 => cols,
        3 | 4 => rows * cols,
        _ => i32::MAX,
    };
    if arg > limit {
        return Err(ParamError::invalid(format!(
            "intra refresh argument {arg} exceeds {limit} for mode {mode}"
        )));
    }
    if mode == 4 && t.lossless_enable != 0 {
        return Err(ParamError::invalid("intra refresh mode 4 conflicts with lossless"));
    }
    if mode == 4 && t.roi_enable != 0 {
        return Err(ParamError::invalid("intra refresh mode 4 conflicts with ROI"));
    }
    Ok(())
}

fn check_profile(t: &EncoderTemplate) -> Result<()> {
    match t.codec {
        CodecFormat::H264 => {
            if t.src_bit_depth == 10 {
                if t.profile != 5 {
                    return Err(ParamError::invalid("10-bit H.264 requires profile 5"));
                }
            } else {
                if !(1..=5).contains(&t.profile) {
                    return Err(ParamError::invalid(format!(
                        "H.264 profile {} out of range",
                        t.profile
                    )));
                }
                if t.profile == 1
                    && !matches!(
                        t.gop_preset_index,
                        gop_preset::CUSTOM | gop_preset::ALL_I | gop_preset::IPP | gop_preset::IPPPP
                    )
                {
                    return Err(ParamError::invalid("baseline profile requires a GOP without B frames"));
                }
                if t.profile == 1
                    && t.gop_preset_index == gop_preset::CUSTOM
                    && t.custom_gop.active().iter().any(|p| p.pic_type == pic_type::B)
                {
                    return Err(ParamError::invalid("baseline profile forbids B pictures"));
                }
            }
            if t.avc_slice_mode == 1 {
                let num_mbs = ((t.pic_width + 15) >> 4) * ((t.pic_height + 15) >> 4);
                if t.avc_slice_arg < 1 || t.avc_slice_arg > num_mbs {
                    return Err(ParamError::invalid(format!(
                        "avcSliceArg {} not in 1..={}",
                        t.avc_slice_arg, num_mbs
                    )));
                }
            }
        }
        CodecFormat::H265 => {
            if t.src_bit_depth == 10 {
                if t.profile != 2 {
                    return Err(ParamError::invalid("10-bit HEVC requires profile 2"));
                }
            } else if !(1..=2).contains(&t.profile) {
                return Err(ParamError::invalid(format!(
                    "HEVC profile {} out of range",
                    t.profile
                )));
            }
        }
    }
    Ok(())
}

fn check_common_params(t: &EncoderTemplate, params: &EncoderParams) -> Result<()> {
    let custom = t.gop_preset_index == gop_preset::CUSTOM;
    let gop = t.custom_gop.active();

    let low_delay = if custom {
        gop.len() == 1 || gop.windows(2).all(|w| w[0].poc_offset <= w[1].poc_offset)
    } else {
        matches!(
            t.gop_preset_index,
            gop_preset::ALL_I
                | gop_preset::IPP
                | gop_preset::IBBB
                | gop_preset::IPPPP
                | gop_preset::IBBBB
                | gop_preset::SP
        )
    };

    if params.low_delay_mode != 0 && !low_delay {
        return Err(ParamError::GopPreset(
            "low delay mode requires a low delay GOP".into(),
        ));
    }

    let step = if low_delay {
        1
    } else if custom {
        t.custom_gop.size
    } else {
        preset_gop_size(t.gop_preset_index)
    };

    let period = if t.intra_period != 0 {
        t.intra_period
    } else {
        t.avc_idr_period
    };
    if period != 0 && period < step + 1 {
        return Err(ParamError::IntraPeriod(format!(
            "intra period {period} shorter than GOP step {step}"
        )));
    }
    if !low_delay && period != 0 && step != 0 && period % step != 0 {
        return Err(ParamError::IntraPeriod(format!(
            "intra period {period} not a multiple of GOP step {step}"
        )));
    }

    if custom {
        let size = t.custom_gop.size;
        for (i, pic) in gop.iter().enumerate() {
            if pic.poc_offset > size {
                return Err(ParamError::CustomGop(format!(
                    "entry {i} poc offset {} exceeds size {size}",
                    pic.poc_offset
                )));
            }
            if !(0..=7).contains(&pic.temporal_id) {
                return Err(ParamError::CustomGop(format!(
                    "entry {i} temporal id {}",
                    pic.temporal_id
                )));
            }
        }
        // poc offsets must cover a contiguous run starting at the smallest one
        if let Some(min_poc) = gop.iter().map(|p| p.poc_offset).min() {
            for expected in min_poc..min_poc + gop.len() as i32 {
                if !gop.iter().any(|p| p.poc_offset == expected) {
                    return Err(ParamError::CustomGop(format!(
                        "poc offset {expected} missing"
                    )));
                }
            }
        }
    }

    if t.use_recommend_enc_params == 0 {
        let w = params.source_width;
        let h = params.source_height;
        let mode = t.cu_size_mode;
        if mode & 0x1 == 0 && (w % 8 != 0 || h % 8 != 0) {
            return Err(ParamError::CuSize8x8(format!("{w}x{h}")));
        }
        if mode & 0x3 == 0 && (w % 16 != 0 || h % 16 != 0) {
            return Err(ParamError::CuSize16x16(format!("{w}x{h}")));
        }
        if mode & 0x7 == 0 && (w % 32 != 0 || h % 32 != 0) {
            return Err(ParamError::CuSize32x32(format!("{w}x{h}")));
        }
    }

    let window = |v: i32| (0..=8192).contains(&v) && v % 2 == 0;
    if !window(t.conf_win_top) {
        return Err(ParamError::ConfWinTop(t.conf_win_top.to_string()));
    }
    if !window(t.conf_win_bottom) {
        return Err(ParamError::ConfWinBottom(t.conf_win_bottom.to_string()));
    }
    if !window(t.conf_win_left) {
        return Err(ParamError::ConfWinLeft(t.conf_win_left.to_string()));
    }
    if !window(t.conf_win_right) {
        return Err(ParamError::ConfWinRight(t.conf_win_right.to_string()));
    }

    Ok(())
}

fn check_rate_control(t: &EncoderTemplate) -> Result<()> {
    if t.roi_enable != 0 && t.roi_enable != 1 {
        return Err(ParamError::InvalidValue(format!("roiEnable {}", t.roi_enable)));
    }
    if t.rc_enable == 1 && (t.min_qp_p > t.max_qp_p || t.min_qp_b > t.max_qp_b) {
        warn!(
            "min qp above max qp: P {}/{} B {}/{}",
            t.min_qp_p, t.max_qp_p, t.min_qp_b, t.max_qp_b
        );
        return Err(ParamError::MaxQp("min qp exceeds max qp".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(width: i32, height: i32) -> EncoderParams {
        EncoderParams::init_default(30, 1, 4_000_000, width, height).unwrap()
    }

    fn check(p: &EncoderParams, codec: CodecFormat) -> Result<EncoderTemplate> {
        let mut t = EncoderTemplate::from_params(p, codec, 8);
        validate(&mut t, p)?;
        Ok(t)
    }

    #[test]
    fn test_defaults_validate() {
        let t = check(&params(1920, 1088), CodecFormat::H265).unwrap();
        assert_eq!(t.keyframe_factor, 4);
        let t = check(&params(1280, 720), CodecFormat::H264).unwrap();
        assert_eq!(t.gop_preset_index, gop_preset::IBBBP);
    }

    #[test]
    fn test_bitrate_must_exceed_frame_rate() {
        let p = EncoderParams::init_default(30, 1, 0, 1280, 720).unwrap();
        assert_eq!(check(&p, CodecFormat::H265).unwrap_err().code(), -10);
    }

    #[test]
    fn test_picture_size_limits() {
        assert_eq!(check(&params(200, 720), CodecFormat::H265).unwrap_err().code(), -37);
        assert_eq!(check(&params(1280, 100), CodecFormat::H265).unwrap_err().code(), -38);
    }

    #[test]
    fn test_intra_refresh_checks() {
        let mut p = params(1280, 720);
        p.intra_mb_refresh_mode = 4;
        p.intra_mb_refresh_arg = 1;
        assert_eq!(check(&p, CodecFormat::H264).unwrap_err().code(), -2);

        // 720 / 64 rounds up to 12 CTU rows
        p.intra_mb_refresh_mode = 1;
        p.intra_mb_refresh_arg = 12;
        assert!(check(&p, CodecFormat::H265).is_ok());
        p.intra_mb_refresh_arg = 13;
        assert!(check(&p, CodecFormat::H265).is_err());
        p.intra_mb_refresh_arg = 0;
        assert!(check(&p, CodecFormat::H265).is_err());
    }

    #[test]
    fn test_baseline_profile_gop() {
        let mut p = params(1280, 720);
        p.profile = 1;
        assert_eq!(check(&p, CodecFormat::H264).unwrap_err().code(), -2);
        p.gop_preset_index = gop_preset::IPPPP;
        p.intra_period = 32;
        assert!(check(&p, CodecFormat::H264).is_ok());
    }

    #[test]
    fn test_slice_arg_range() {
        let mut p = params(1280, 720);
        p.avc_slice_mode = 1;
        p.avc_slice_arg = 0;
        assert!(check(&p, CodecFormat::H264).is_err());
        p.avc_slice_arg = 80 * 45;
        assert!(check(&p, CodecFormat::H264).is_ok());
        p.avc_slice_arg = 80 * 45 + 1;
        assert!(check(&p, CodecFormat::H264).is_err());
    }

    #[test]
    fn test_low_delay_needs_low_delay_gop() {
        let mut p = params(1280, 720);
        p.low_delay_mode = 1;
        assert_eq!(check(&p, CodecFormat::H265).unwrap_err().code(), -15);
        p.gop_preset_index = gop_preset::IPP;
        assert!(check(&p, CodecFormat::H265).is_ok());
    }

    #[test]
    fn test_intra_period_multiple_of_gop() {
        let mut p = params(1280, 720);
        p.gop_preset_index = gop_preset::RA_IB;
        p.intra_period = 12;
        assert_eq!(check(&p, CodecFormat::H265).unwrap_err().code(), -13);
        p.intra_period = 4;
        assert_eq!(check(&p, CodecFormat::H265).unwrap_err().code(), -13);
        p.intra_period = 16;
        assert!(check(&p, CodecFormat::H265).is_ok());
    }

    #[test]
    fn test_custom_gop_structure() {
        let mut p = params(1280, 720);
        p.gop_preset_index = gop_preset::CUSTOM;
        p.intra_period = 8;
        p.custom_gop.size = 2;
        p.custom_gop.pictures[0].poc_offset = 2;
        p.custom_gop.pictures[0].pic_type = pic_type::P;
        p.custom_gop.pictures[1].poc_offset = 1;
        p.custom_gop.pictures[1].pic_type = pic_type::B;
        let t = check(&p, CodecFormat::H265).unwrap();
        // keyframe factor is left alone for custom GOPs
        assert_eq!(t.keyframe_factor, 1);

        p.custom_gop.pictures[1].poc_offset = 3;
        assert_eq!(check(&p, CodecFormat::H265).unwrap_err().code(), -36);

        p.custom_gop.pictures[1].poc_offset = 1;
        p.custom_gop.pictures[1].temporal_id = 9;
        assert_eq!(check(&p, CodecFormat::H265).unwrap_err().code(), -36);

        p.custom_gop.size = 0;
        assert_eq!(check(&p, CodecFormat::H265).unwrap_err().code(), -36);
    }

    #[test]
    fn test_cu_size_alignment() {
        let mut p = params(1282, 720);
        p.gop_preset_index = gop_preset::IPP;
        assert!(check(&p, CodecFormat::H265).is_ok());
        let mut t = EncoderTemplate::from_params(&p, CodecFormat::H265, 8);
        t.cu_size_mode = 0b110;
        assert_eq!(validate(&mut t, &p).unwrap_err().code(), -40);
        p.source_width = 1288;
        let mut t = EncoderTemplate::from_params(&p, CodecFormat::H265, 8);
        t.cu_size_mode = 0b100;
        assert_eq!(validate(&mut t, &p).unwrap_err().code(), -41);
    }

    #[test]
    fn test_conformance_window_must_be_even() {
        let mut p = params(1280, 720);
        p.conf_win_bottom = 3;
        assert_eq!(check(&p, CodecFormat::H265).unwrap_err().code(), -28);
    }

    #[test]
    fn test_rate_control_qp_order() {
        let p = params(1280, 720);
        let mut t = EncoderTemplate::from_params(&p, CodecFormat::H265, 8);
        t.rc_enable = 1;
        t.min_qp_b = 40;
        t.max_qp_b = 30;
        assert_eq!(validate(&mut t, &p).unwrap_err().code(), -25);
    }

    #[test]
    fn test_low_delay_poc_remap() {
        let mut p = params(1280, 720);
        p.gop_preset_index = gop_preset::IPPPP;
        p.intra_period = 32;
        p.use_low_delay_poc_type = 1;
        let t = check(&p, CodecFormat::H264).unwrap();
        assert_eq!(t.gop_preset_index, 20);
        let t = check(&p, CodecFormat::H265).unwrap();
        assert_eq!(t.gop_preset_index, gop_preset::IPPPP);
    }
}
