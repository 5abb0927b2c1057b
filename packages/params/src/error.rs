//! Error types for encoder parameter handling.

use thiserror::Error;

/// Errors produced while setting, merging, or validating encoder parameters.
///
/// Every variant corresponds to one of the device library's parameter
/// return codes, available through [`ParamError::code`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamError {
    /// A generic invalid argument or cross-field conflict.
    #[error("invalid parameter: {0}")]
    Invalid(String),

    /// Unknown parameter name.
    #[error("unknown parameter name: {0}")]
    InvalidName(String),

    /// Unparsable or unacceptable parameter value.
    #[error("invalid parameter value: {0}")]
    InvalidValue(String),

    /// Frame rate is zero or otherwise unusable.
    #[error("invalid frame rate: {0}")]
    FrameRate(String),

    /// Bitrate outside the supported range.
    #[error("invalid bitrate: {0}")]
    Bitrate(String),

    #[error("invalid intra period: {0}")]
    IntraPeriod(String),

    #[error("invalid intra QP: {0}")]
    IntraQp(String),

    /// GOP preset out of range or incompatible with low-delay mode.
    #[error("invalid GOP preset: {0}")]
    GopPreset(String),

    #[error("invalid CU level rate control setting: {0}")]
    CuLevelRc(String),

    #[error("invalid HVS QP setting: {0}")]
    HvsQp(String),

    #[error("invalid minimum QP: {0}")]
    MinQp(String),

    #[error("invalid maximum QP: {0}")]
    MaxQp(String),

    #[error("invalid maximum delta QP: {0}")]
    MaxDeltaQp(String),

    /// Conformance window offsets.
    #[error("invalid conformance window top offset: {0}")]
    ConfWinTop(String),

    #[error("invalid conformance window bottom offset: {0}")]
    ConfWinBottom(String),

    #[error("invalid conformance window left offset: {0}")]
    ConfWinLeft(String),

    #[error("invalid conformance window right offset: {0}")]
    ConfWinRight(String),

    #[error("invalid recommended-parameter mode: {0}")]
    UseRecommend(String),

    /// VBV buffer size (rate control init delay) out of range.
    #[error("invalid rate control init delay: {0}")]
    RcInitDelay(String),

    #[error("invalid rate control enable: {0}")]
    RcEnable(String),

    #[error("invalid max merge candidates: {0}")]
    MaxNumMerge(String),

    /// Custom GOP structure is malformed.
    #[error("invalid custom GOP: {0}")]
    CustomGop(String),

    #[error("invalid picture width: {0}")]
    PicWidth(String),

    #[error("invalid picture height: {0}")]
    PicHeight(String),

    #[error("invalid decoding refresh type: {0}")]
    DecodingRefreshType(String),

    /// Picture size not aligned to the smallest enabled CU size.
    #[error("8x8 CU size required: {0}")]
    CuSize8x8(String),

    #[error("16x16 CU size required: {0}")]
    CuSize16x16(String),

    #[error("32x32 CU size required: {0}")]
    CuSize32x32(String),

    #[error("value too big: {0}")]
    TooBig(String),

    #[error("value too small: {0}")]
    TooSmall(String),

    #[error("value must be non-zero: {0}")]
    Zero(String),

    #[error("value out of range: {0}")]
    OutOfRange(String),

    #[error("width too big: {0}")]
    WidthTooBig(i32),

    #[error("width too small: {0}")]
    WidthTooSmall(i32),

    #[error("height too big: {0}")]
    HeightTooBig(i32),

    #[error("height too small: {0}")]
    HeightTooSmall(i32),

    /// Width x height exceeds the maximum resolution area.
    #[error("picture area too big: {width}x{height}")]
    AreaTooBig { width: i32, height: i32 },

    /// Intra period is not a multiple of the GOP preset size.
    #[error("intra period {intra_period} incompatible with GOP preset {gop_preset}")]
    GopIntraIncompatible { intra_period: i32, gop_preset: i32 },
}

impl ParamError {
    /// Numeric return code used by the device library for this error.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Invalid(_) => -2,
            Self::InvalidName(_) => -7,
            Self::InvalidValue(_) => -8,
            Self::FrameRate(_) => -9,
            Self::Bitrate(_) => -10,
            Self::IntraPeriod(_) => -13,
            Self::IntraQp(_) => -14,
            Self::GopPreset(_) => -15,
            Self::CuLevelRc(_) => -21,
            Self::HvsQp(_) => -22,
            Self::MinQp(_) => -24,
            Self::MaxQp(_) => -25,
            Self::MaxDeltaQp(_) => -26,
            Self::ConfWinTop(_) => -27,
            Self::ConfWinBottom(_) => -28,
            Self::ConfWinLeft(_) => -29,
            Self::ConfWinRight(_) => -30,
            Self::UseRecommend(_) => -31,
            Self::RcInitDelay(_) => -33,
            Self::RcEnable(_) => -34,
            Self::MaxNumMerge(_) => -35,
            Self::CustomGop(_) => -36,
            Self::PicWidth(_) => -37,
            Self::PicHeight(_) => -38,
            Self::DecodingRefreshType(_) => -39,
            Self::CuSize8x8(_) => -40,
            Self::CuSize16x16(_) => -41,
            Self::CuSize32x32(_) => -42,
            Self::TooBig(_) => -43,
            Self::TooSmall(_) => -44,
            Self::Zero(_) => -45,
            Self::OutOfRange(_) => -46,
            Self::WidthTooBig(_) => -47,
            Self::WidthTooSmall(_) => -48,
            Self::HeightTooBig(_) => -49,
            Self::HeightTooSmall(_) => -50,
            Self::AreaTooBig { .. } => -51,
            Self::GopIntraIncompatible { .. } => -60,
        }
    }

    /// Create an Invalid error with a message.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    /// Create an OutOfRange error naming the parameter and its value.
    pub fn out_of_range(name: &str, value: impl std::fmt::Display) -> Self {
        Self::OutOfRange(format!("{name}={value}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_match_library_values() {
        assert_eq!(ParamError::invalid("x").code(), -2);
        assert_eq!(ParamError::InvalidName("foo".into()).code(), -7);
        assert_eq!(ParamError::CustomGop(String::new()).code(), -36);
        assert_eq!(ParamError::out_of_range("minQp", 60).code(), -46);
        assert_eq!(
            ParamError::GopIntraIncompatible {
                intra_period: 3,
                gop_preset: 5
            }
            .code(),
            -60
        );
    }

    #[test]
    fn test_out_of_range_message() {
        let err = ParamError::out_of_range("intraQP", 99);
        assert_eq!(err.to_string(), "value out of range: intraQP=99");
    }
}
