//! Encoder parameter synthesis for xcoder encoder sessions.
//!
//! An application describes the stream it wants with [`EncoderParams`],
//! either by setting fields directly or through the string-keyed
//! [`EncoderParams::set`]. At session open the parameters are merged onto the
//! hardware default template ([`EncoderTemplate::from_params`]) and the result
//! is checked with [`validate`] before it is sent to the device.
//!
//! # Example
//!
//! ```ignore
//! use xcoder_params::{validate, CodecFormat, EncoderParams, EncoderTemplate};
//!
//! let mut params = EncoderParams::init_default(30, 1, 4_000_000, 1920, 1080)?;
//! params.set("gopPresetIdx", Some("2"))?;
//! params.set("RcEnable", Some("1"))?;
//!
//! let mut template = EncoderTemplate::from_params(&params, CodecFormat::H265, 8);
//! validate(&mut template, &params)?;
//! ```

mod error;
mod params;
mod template;
mod validate;

pub use error::ParamError;
pub use params::{
    gop_preset, pic_type, CodecFormat, CustomGop, EncoderParams, GopPicture, RateControlParams,
    MAX_GOP_NUM, REPEAT_HEADERS_ALL_I_FRAMES,
};
pub use template::EncoderTemplate;
pub use validate::validate;

/// Result type for parameter operations.
pub type Result<T> = std::result::Result<T, ParamError>;
