//! User-facing encoder parameters and the string-keyed setter.

use tracing::{debug, trace};

use crate::{ParamError, Result};

/// Bitstream format produced by an encoder session or consumed by a decoder session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecFormat {
    /// H.264/AVC.
    H264,
    /// H.265/HEVC.
    H265,
}

impl Default for CodecFormat {
    fn default() -> Self {
        Self::H264
    }
}

impl CodecFormat {
    /// Macroblock (H.264) or CTU (HEVC) edge length in pixels.
    #[must_use]
    pub fn block_size(&self) -> i32 {
        match self {
            Self::H264 => 16,
            Self::H265 => 64,
        }
    }
}

/// GOP preset indices understood by the encoder firmware.
pub mod gop_preset {
    pub const CUSTOM: i32 = 0;
    pub const ALL_I: i32 = 1;
    pub const IPP: i32 = 2;
    pub const IBBB: i32 = 3;
    pub const IBPBP: i32 = 4;
    pub const IBBBP: i32 = 5;
    pub const IPPPP: i32 = 6;
    pub const IBBBB: i32 = 7;
    pub const RA_IB: i32 = 8;
    pub const SP: i32 = 9;
}

/// Picture types used in custom GOP entries and per-frame type forcing.
pub mod pic_type {
    pub const I: i32 = 0;
    pub const P: i32 = 1;
    pub const B: i32 = 2;
    /// Only valid as a forced frame type.
    pub const IDR: i32 = 3;
}

/// Maximum number of entries in a custom GOP.
pub const MAX_GOP_NUM: usize = 8;

pub const MIN_BITRATE: i64 = 64_000;
pub const MAX_BITRATE: i64 = 700_000_000;
pub const MIN_WIDTH: i32 = 32;
pub const MAX_WIDTH: i32 = 8192;
pub const MIN_HEIGHT: i32 = 32;
pub const MAX_HEIGHT: i32 = 8192;
pub const MAX_RESOLUTION_AREA: i64 = 8192 * 5120;
pub const MAX_INTRA_PERIOD: i32 = 1024;
pub const MAX_QP: i32 = 51;
pub const DEFAULT_INTRA_QP: i32 = 22;
pub const DEFAULT_MIN_QP: i32 = 8;
pub const DEFAULT_MAX_QP: i32 = 51;
pub const DEFAULT_MAX_DELTA_QP: i32 = 10;

/// `repeatHeaders` value meaning "repeat headers on every I frame".
pub const REPEAT_HEADERS_ALL_I_FRAMES: i32 = 1;

/// One picture of a custom GOP.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GopPicture {
    pub pic_type: i32,
    pub poc_offset: i32,
    /// QP offset relative to the intra QP.
    pub pic_qp: i32,
    pub num_ref_pic_l0: i32,
    pub ref_poc_l0: i32,
    pub ref_poc_l1: i32,
    pub temporal_id: i32,
}

/// A user-defined GOP structure, used when the GOP preset is [`gop_preset::CUSTOM`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CustomGop {
    pub size: i32,
    pub pictures: [GopPicture; MAX_GOP_NUM],
}

impl CustomGop {
    /// The populated entries, clamped to the GOP array length.
    #[must_use]
    pub fn active(&self) -> &[GopPicture] {
        let n = self.size.clamp(0, MAX_GOP_NUM as i32) as usize;
        &self.pictures[..n]
    }
}

/// Rate control settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateControlParams {
    pub enable_rate_control: i32,
    pub enable_cu_level_rate_control: i32,
    pub enable_hvs_qp: i32,
    pub enable_hvs_qp_scale: i32,
    pub hvs_qp_scale: i32,
    pub min_qp: i32,
    pub max_qp: i32,
    pub max_delta_qp: i32,
    /// VBV buffer size in milliseconds.
    pub rc_init_delay: i32,
    pub intra_qp: i32,
    pub enable_mb_level_rc: i32,
    pub trans_rate: i64,
}

impl Default for RateControlParams {
    fn default() -> Self {
        Self {
            enable_rate_control: 0,
            enable_cu_level_rate_control: 1,
            enable_hvs_qp: 0,
            enable_hvs_qp_scale: 1,
            hvs_qp_scale: 2,
            min_qp: DEFAULT_MIN_QP,
            max_qp: DEFAULT_MAX_QP,
            max_delta_qp: DEFAULT_MAX_DELTA_QP,
            rc_init_delay: 3000,
            intra_qp: DEFAULT_INTRA_QP,
            enable_mb_level_rc: 1,
            trans_rate: 0,
        }
    }
}

/// Sparse encoder overrides supplied by the application.
///
/// Start from [`EncoderParams::init_default`], adjust fields directly or
/// through [`EncoderParams::set`], then merge onto the hardware template
/// with [`crate::EncoderTemplate::from_params`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderParams {
    pub source_width: i32,
    pub source_height: i32,
    pub fps_num: i32,
    pub fps_den: i32,
    /// Integer frame rate derived from `fps_num / fps_den`.
    pub frame_rate: i32,
    pub bitrate: i64,
    pub profile: i32,
    pub level_idc: i32,
    pub high_tier: i32,
    pub gop_preset_index: i32,
    pub use_recommend_enc_params: i32,
    pub rc: RateControlParams,
    pub roi_enable: i32,
    pub forced_header_enable: i32,
    pub long_term_ref_enable: i32,
    pub lossless_enable: i32,
    pub conf_win_top: i32,
    pub conf_win_bottom: i32,
    pub conf_win_left: i32,
    pub conf_win_right: i32,
    pub intra_period: i32,
    pub decoding_refresh_type: i32,
    pub enable_transform_8x8: i32,
    pub avc_slice_mode: i32,
    pub avc_slice_arg: i32,
    pub entropy_coding_mode: i32,
    pub intra_mb_refresh_mode: i32,
    pub intra_mb_refresh_arg: i32,
    pub custom_gop: CustomGop,
    pub force_frame_type: i32,
    pub crf: i32,
    pub cbr: i32,
    pub flush_gop: i32,
    pub low_delay_mode: i32,
    pub padding: i32,
    pub use_low_delay_poc_type: i32,
    pub strict_timeout_mode: i32,
    pub enable_aud: i32,
}

impl Default for EncoderParams {
    fn default() -> Self {
        Self {
            source_width: 0,
            source_height: 0,
            fps_num: 30,
            fps_den: 1,
            frame_rate: 30,
            bitrate: 0,
            profile: 0,
            level_idc: 0,
            high_tier: 0,
            gop_preset_index: gop_preset::IBBBP,
            use_recommend_enc_params: 0,
            rc: RateControlParams::default(),
            roi_enable: 0,
            forced_header_enable: REPEAT_HEADERS_ALL_I_FRAMES,
            long_term_ref_enable: 0,
            lossless_enable: 0,
            conf_win_top: 0,
            conf_win_bottom: 0,
            conf_win_left: 0,
            conf_win_right: 0,
            intra_period: 92,
            decoding_refresh_type: 2,
            enable_transform_8x8: 1,
            avc_slice_mode: 0,
            avc_slice_arg: 0,
            entropy_coding_mode: 1,
            intra_mb_refresh_mode: 0,
            intra_mb_refresh_arg: 0,
            custom_gop: CustomGop::default(),
            force_frame_type: 0,
            crf: 0,
            cbr: 0,
            flush_gop: 0,
            low_delay_mode: 0,
            padding: 1,
            use_low_delay_poc_type: 0,
            strict_timeout_mode: 0,
            enable_aud: 0,
        }
    }
}

impl EncoderParams {
    /// Build the default parameter set for a stream and check the picture size.
    ///
    /// A zero frame rate numerator or denominator falls back to 30 fps.
    pub fn init_default(
        fps_num: i32,
        fps_den: i32,
        bitrate: i64,
        width: i32,
        height: i32,
    ) -> Result<Self> {
        let frame_rate = if fps_num != 0 && fps_den != 0 {
            fps_num / fps_den
        } else {
            30
        };
        let params = Self {
            source_width: width,
            source_height: height,
            fps_num,
            fps_den,
            frame_rate,
            bitrate,
            ..Default::default()
        };

        if width > MAX_WIDTH {
            return Err(ParamError::WidthTooBig(width));
        }
        if width < MIN_WIDTH {
            return Err(ParamError::WidthTooSmall(width));
        }
        if height > MAX_HEIGHT {
            return Err(ParamError::HeightTooBig(height));
        }
        if height < MIN_HEIGHT {
            return Err(ParamError::HeightTooSmall(height));
        }
        if i64::from(width) * i64::from(height) > MAX_RESOLUTION_AREA {
            return Err(ParamError::AreaTooBig { width, height });
        }

        debug!("encoder params {}x{} @ {}fps", width, height, frame_rate);
        Ok(params)
    }

    /// Set a parameter by its library name, e.g. `set("gopPresetIdx", "2")`.
    ///
    /// Names are matched case-insensitively; a leading `--` is ignored and
    /// underscores are treated as dashes. A `no-` or `no` prefix negates a
    /// boolean value, and a missing value means `true`. Custom GOP entries
    /// (`customGopSize`, `g{N}picType`, ...) are accepted here as well.
    pub fn set(&mut self, name: &str, value: Option<&str>) -> Result<()> {
        let (name, value) = normalize(name, value)?;
        trace!("set encoder param {}={}", name, value);
        let lname = name.to_ascii_lowercase();

        if lname == "customgopsize" || gop_entry(&lname).is_some() {
            return self.set_gop(&lname, &value);
        }

        match lname.as_str() {
            "bitrate" => {
                let v = parse_i64(&name, &value)?;
                if v > MAX_BITRATE {
                    return Err(ParamError::TooBig(format!("bitrate={v}")));
                }
                if v < MIN_BITRATE {
                    return Err(ParamError::TooSmall(format!("bitrate={v}")));
                }
                self.bitrate = v;
            }
            "transrate" => {
                let v = parse_i64(&name, &value)?;
                if v > MAX_BITRATE {
                    return Err(ParamError::TooBig(format!("transRate={v}")));
                }
                if v < MIN_BITRATE {
                    return Err(ParamError::TooSmall(format!("transRate={v}")));
                }
                self.rc.trans_rate = v;
            }
            "lowdelay" => self.low_delay_mode = parse_i32(&name, &value)?,
            "padding" => self.padding = parse_i32(&name, &value)?,
            "uselowdelaypoctype" => self.use_low_delay_poc_type = parse_i32(&name, &value)?,
            "forceframetype" => self.force_frame_type = parse_i32(&name, &value)?,
            "profile" => self.profile = parse_i32(&name, &value)?,
            "level-idc" | "level" => self.level_idc = parse_level(&value)?,
            "high-tier" => self.high_tier = i32::from(parse_bool(&value)?),
            "goppresetidx" => {
                self.gop_preset_index = ranged(&name, &value, gop_preset::CUSTOM, gop_preset::SP)?
            }
            "userecommendencparam" => {
                self.use_recommend_enc_params = ranged(&name, &value, 0, 3)?
            }
            "rcenable" => self.rc.enable_rate_control = ranged(&name, &value, 0, 1)?,
            "culevelrcenable" => {
                self.rc.enable_cu_level_rate_control = ranged(&name, &value, 0, 1)?
            }
            "hvsqpenable" => self.rc.enable_hvs_qp = parse_i32(&name, &value)?,
            "hvsqpscaleenable" => self.rc.enable_hvs_qp_scale = parse_i32(&name, &value)?,
            "hvsqpscale" => self.rc.hvs_qp_scale = parse_i32(&name, &value)?,
            "minqp" => {
                let v = ranged(&name, &value, 0, MAX_QP)?;
                if v > self.rc.max_qp {
                    return Err(ParamError::out_of_range(&name, v));
                }
                self.rc.min_qp = v;
            }
            "maxqp" => {
                let v = ranged(&name, &value, 0, MAX_QP)?;
                if v < self.rc.min_qp {
                    return Err(ParamError::out_of_range(&name, v));
                }
                self.rc.max_qp = v;
            }
            "maxdeltaqp" => self.rc.max_delta_qp = ranged(&name, &value, 0, MAX_QP)?,
            "rcinitdelay" => self.rc.rc_init_delay = parse_i32(&name, &value)?,
            "repeatheaders" => self.forced_header_enable = parse_i32(&name, &value)?,
            "roienable" => self.roi_enable = parse_i32(&name, &value)?,
            "confwintop" => self.conf_win_top = parse_i32(&name, &value)?,
            "confwinbot" => self.conf_win_bottom = parse_i32(&name, &value)?,
            "confwinleft" => self.conf_win_left = parse_i32(&name, &value)?,
            "confwinright" => self.conf_win_right = parse_i32(&name, &value)?,
            "intraperiod" => {
                let v = ranged(&name, &value, 0, MAX_INTRA_PERIOD)?;
                check_gop_intra(self.gop_preset_index, v)?;
                self.intra_period = v;
            }
            "framerate" => {
                let v = parse_i32(&name, &value)?;
                if v <= 0 {
                    return Err(ParamError::Zero(format!("frameRate={v}")));
                }
                self.fps_num = v;
                self.fps_den = 1;
                self.frame_rate = v;
            }
            "frameratedenom" => {
                let v = parse_i32(&name, &value)?;
                if v <= 0 {
                    return Err(ParamError::Zero(format!("frameRateDenom={v}")));
                }
                self.fps_den = v;
                self.frame_rate = self.fps_num / v;
            }
            "intraqp" => self.rc.intra_qp = ranged(&name, &value, 0, MAX_QP)?,
            "decodingrefreshtype" => self.decoding_refresh_type = ranged(&name, &value, 0, 2)?,
            "transform8x8enable" => self.enable_transform_8x8 = parse_i32(&name, &value)?,
            "avcslicemode" => self.avc_slice_mode = ranged(&name, &value, 0, 1)?,
            "avcslicearg" => self.avc_slice_arg = parse_i32(&name, &value)?,
            "entropycodingmode" => self.entropy_coding_mode = parse_i32(&name, &value)?,
            "intrambrefreshmode" | "intrarefreshmode" => {
                self.intra_mb_refresh_mode = parse_i32(&name, &value)?
            }
            "intrambrefresharg" | "intrarefresharg" => {
                self.intra_mb_refresh_arg = parse_i32(&name, &value)?
            }
            "mblevelrcenable" => self.rc.enable_mb_level_rc = parse_i32(&name, &value)?,
            "enableaud" => self.enable_aud = ranged(&name, &value, 0, 1)?,
            "crf" => self.crf = ranged(&name, &value, 0, MAX_QP)?,
            "cbr" => self.cbr = ranged(&name, &value, 0, 1)?,
            "flushgop" => self.flush_gop = ranged(&name, &value, 0, 1)?,
            "longtermreferenceenable" => self.long_term_ref_enable = ranged(&name, &value, 0, 1)?,
            "stricttimeout" => self.strict_timeout_mode = parse_i32(&name, &value)?,
            "losslessenable" => self.lossless_enable = ranged(&name, &value, 0, 1)?,
            _ => return Err(ParamError::InvalidName(name)),
        }
        Ok(())
    }

    fn set_gop(&mut self, lname: &str, value: &str) -> Result<()> {
        if lname == "customgopsize" {
            let v = parse_i32(lname, value)?;
            if v > MAX_GOP_NUM as i32 {
                return Err(ParamError::TooBig(format!("customGopSize={v}")));
            }
            if v < 1 {
                return Err(ParamError::TooSmall(format!("customGopSize={v}")));
            }
            self.custom_gop.size = v;
            return Ok(());
        }

        let (index, field) = gop_entry(lname).ok_or_else(|| ParamError::InvalidName(lname.to_string()))?;
        let v = parse_i32(lname, value)?;
        let intra_qp = self.rc.intra_qp;
        let pic = &mut self.custom_gop.pictures[index];
        match field {
            "pictype" => pic.pic_type = v,
            "pocoffset" => pic.poc_offset = v,
            "picqp" => {
                if v > MAX_QP - intra_qp || v < -intra_qp {
                    return Err(ParamError::out_of_range(lname, v));
                }
                pic.pic_qp = v;
            }
            "numrefpicl0" => pic.num_ref_pic_l0 = v,
            "refpocl0" => pic.ref_poc_l0 = v,
            "refpocl1" => pic.ref_poc_l1 = v,
            "temporalid" => pic.temporal_id = v,
            _ => return Err(ParamError::InvalidName(lname.to_string())),
        }
        Ok(())
    }
}

/// Split `g{N}{field}` into the GOP entry index and the field name.
fn gop_entry(lname: &str) -> Option<(usize, &str)> {
    let rest = lname.strip_prefix('g')?;
    let digit = rest.chars().next()?.to_digit(10)? as usize;
    if digit >= MAX_GOP_NUM {
        return None;
    }
    let field = &rest[1..];
    matches!(
        field,
        "pictype" | "pocoffset" | "picqp" | "numrefpicl0" | "refpocl0" | "refpocl1" | "temporalid"
    )
    .then_some((digit, field))
}

fn normalize(name: &str, value: Option<&str>) -> Result<(String, String)> {
    let name = name.strip_prefix("--").unwrap_or(name).replace('_', "-");
    if name.is_empty() {
        return Err(ParamError::InvalidName(name));
    }

    let negated = name
        .strip_prefix("no-")
        .or_else(|| name.strip_prefix("no"))
        .map(str::to_string);
    if let Some(stripped) = negated {
        let truthy = match value {
            None => true,
            Some(v) => parse_bool(v)?,
        };
        let value = if truthy { "false" } else { "true" };
        return Ok((stripped, value.to_string()));
    }

    let value = match value {
        None => "true".to_string(),
        Some(v) => v.strip_prefix('=').unwrap_or(v).to_string(),
    };
    Ok((name, value))
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => Err(ParamError::InvalidValue(other.to_string())),
    }
}

fn parse_i32(name: &str, value: &str) -> Result<i32> {
    match value.trim() {
        "true" => Ok(1),
        "false" => Ok(0),
        v => v
            .parse::<i32>()
            .map_err(|_| ParamError::InvalidValue(format!("{name}={value}"))),
    }
}

fn parse_i64(name: &str, value: &str) -> Result<i64> {
    value
        .trim()
        .parse::<i64>()
        .map_err(|_| ParamError::InvalidValue(format!("{name}={value}")))
}

fn ranged(name: &str, value: &str, min: i32, max: i32) -> Result<i32> {
    let v = parse_i32(name, value)?;
    if v < min || v > max {
        return Err(ParamError::out_of_range(name, v));
    }
    Ok(v)
}

/// Levels may be given as `5.1` or `51`; both become 51.
fn parse_level(value: &str) -> Result<i32> {
    let f: f64 = value
        .trim()
        .parse()
        .map_err(|_| ParamError::InvalidValue(format!("level={value}")))?;
    if f < 10.0 {
        Ok((10.0 * f + 0.5) as i32)
    } else if f < 100.0 {
        Ok(f as i32)
    } else {
        Err(ParamError::InvalidValue(format!("level={value}")))
    }
}

/// Intra period must be a whole number of GOPs for the fixed presets.
fn check_gop_intra(gop_preset_index: i32, intra_period: i32) -> Result<()> {
    let multiple = match gop_preset_index {
        gop_preset::IBPBP => 2,
        gop_preset::IBBBP | gop_preset::IPPPP | gop_preset::IBBBB => 4,
        gop_preset::RA_IB => 8,
        _ => return Ok(()),
    };
    if intra_period % multiple != 0 {
        return Err(ParamError::GopIntraIncompatible {
            intra_period,
            gop_preset: gop_preset_index,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> EncoderParams {
        EncoderParams::init_default(30, 1, 0, 1280, 720).unwrap()
    }

    #[test]
    fn test_init_default_values() {
        let p = params();
        assert_eq!(p.gop_preset_index, gop_preset::IBBBP);
        assert_eq!(p.intra_period, 92);
        assert_eq!(p.rc.intra_qp, 22);
        assert_eq!(p.rc.min_qp, 8);
        assert_eq!(p.rc.max_qp, 51);
        assert_eq!(p.rc.rc_init_delay, 3000);
        assert_eq!(p.forced_header_enable, REPEAT_HEADERS_ALL_I_FRAMES);
        assert_eq!(p.padding, 1);
        assert_eq!(p.frame_rate, 30);
    }

    #[test]
    fn test_init_default_zero_denominator() {
        let p = EncoderParams::init_default(25, 0, 0, 640, 480).unwrap();
        assert_eq!(p.frame_rate, 30);
    }

    #[test]
    fn test_init_default_size_limits() {
        assert_eq!(
            EncoderParams::init_default(30, 1, 0, 16, 480).unwrap_err(),
            ParamError::WidthTooSmall(16)
        );
        assert_eq!(
            EncoderParams::init_default(30, 1, 0, 640, 9000).unwrap_err(),
            ParamError::HeightTooBig(9000)
        );
        assert!(matches!(
            EncoderParams::init_default(30, 1, 0, 8192, 8192).unwrap_err(),
            ParamError::AreaTooBig { .. }
        ));
    }

    #[test]
    fn test_set_is_case_insensitive_and_strips_dashes() {
        let mut p = params();
        p.set("--GOPPRESETIDX", Some("2")).unwrap();
        assert_eq!(p.gop_preset_index, 2);
        p.set("intra_qp", Some("=30")).unwrap_err();
        p.set("intraQP", Some("=30")).unwrap();
        assert_eq!(p.rc.intra_qp, 30);
    }

    #[test]
    fn test_set_bool_negation() {
        let mut p = params();
        p.set("RcEnable", None).unwrap();
        assert_eq!(p.rc.enable_rate_control, 1);
        p.set("no-RcEnable", None).unwrap();
        assert_eq!(p.rc.enable_rate_control, 0);
        p.set("nopadding", Some("0")).unwrap();
        assert_eq!(p.padding, 1);
    }

    #[test]
    fn test_set_unknown_name() {
        let mut p = params();
        assert_eq!(
            p.set("warpDrive", Some("1")).unwrap_err(),
            ParamError::InvalidName("warpDrive".into())
        );
    }

    #[test]
    fn test_set_unparsable_value() {
        let mut p = params();
        assert!(matches!(
            p.set("intraPeriod", Some("lots")).unwrap_err(),
            ParamError::InvalidValue(_)
        ));
    }

    #[test]
    fn test_set_qp_ordering() {
        let mut p = params();
        p.set("maxQp", Some("40")).unwrap();
        assert_eq!(p.set("minQp", Some("45")).unwrap_err().code(), -46);
        p.set("minQp", Some("20")).unwrap();
        assert_eq!(p.set("maxQp", Some("10")).unwrap_err().code(), -46);
    }

    #[test]
    fn test_set_intra_period_gop_compatibility() {
        let mut p = params();
        // IBBBP needs a multiple of 4
        assert_eq!(p.set("intraPeriod", Some("30")).unwrap_err().code(), -60);
        p.set("intraPeriod", Some("32")).unwrap();
        p.set("gopPresetIdx", Some("8")).unwrap();
        assert!(p.set("intraPeriod", Some("36")).is_err());
        p.set("gopPresetIdx", Some("1")).unwrap();
        p.set("intraPeriod", Some("7")).unwrap();
        assert_eq!(p.intra_period, 7);
    }

    #[test]
    fn test_set_frame_rate() {
        let mut p = params();
        assert_eq!(p.set("frameRate", Some("0")).unwrap_err().code(), -45);
        p.set("frameRate", Some("60")).unwrap();
        p.set("frameRateDenom", Some("2")).unwrap();
        assert_eq!((p.fps_num, p.fps_den, p.frame_rate), (60, 2, 30));
    }

    #[test]
    fn test_set_bitrate_bounds() {
        let mut p = params();
        assert_eq!(p.set("bitrate", Some("1000")).unwrap_err().code(), -44);
        assert_eq!(p.set("bitrate", Some("800000000")).unwrap_err().code(), -43);
        p.set("bitrate", Some("4000000")).unwrap();
        assert_eq!(p.bitrate, 4_000_000);
    }

    #[test]
    fn test_set_level_forms() {
        let mut p = params();
        p.set("level", Some("5.1")).unwrap();
        assert_eq!(p.level_idc, 51);
        p.set("level-idc", Some("41")).unwrap();
        assert_eq!(p.level_idc, 41);
        assert!(p.set("level", Some("400")).is_err());
    }

    #[test]
    fn test_set_custom_gop_entries() {
        let mut p = params();
        p.set("customGopSize", Some("2")).unwrap();
        p.set("g1pocOffset", Some("2")).unwrap();
        p.set("g1picType", Some("1")).unwrap();
        p.set("g1picQp", Some("3")).unwrap();
        assert_eq!(p.custom_gop.size, 2);
        assert_eq!(p.custom_gop.pictures[1].poc_offset, 2);
        assert_eq!(p.custom_gop.active().len(), 2);
        assert_eq!(p.set("customGopSize", Some("9")).unwrap_err().code(), -43);
        assert_eq!(p.set("g0picQp", Some("40")).unwrap_err().code(), -46);
        assert!(matches!(
            p.set("g8picType", Some("1")).unwrap_err(),
            ParamError::InvalidName(_)
        ));
    }
}
