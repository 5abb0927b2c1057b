//! Session I/O for NVMe-attached video transcoders.
//!
//! This crate drives decoder and encoder sessions on a transcoder that is
//! reached through vendor NVMe commands. It owns the parts of the protocol
//! that decide whether data may move: status polling and failure escalation,
//! write-space backpressure, chunked transfers through per-session worker
//! threads, and the timestamp bookkeeping that matches output back to input.
//!
//! # Quick Start (Decoding)
//!
//! ```ignore
//! use std::sync::Arc;
//! use xcoder::{CodecFormat, Decoder, Packet, ReadOutcome, SessionBackend, SessionConfig};
//!
//! let config = SessionConfig::new(CodecFormat::H264, 1920, 1080).low_delay_ms(20);
//! let decoder = Decoder::new(device, config);
//! decoder.open()?;
//!
//! // Zero bytes written means the device had no room: send the packet again.
//! while decoder.write(&packet)? == 0 {}
//!
//! if let ReadOutcome::Data(frame) = decoder.read()? {
//!     // frame.planes() holds Y, U and V
//! }
//! ```
//!
//! # Quick Start (Encoding)
//!
//! ```ignore
//! use xcoder::{CodecFormat, Encoder, Frame, SessionBackend, SessionConfig};
//!
//! let encoder = Encoder::new(device, SessionConfig::new(CodecFormat::H265, 1280, 720))?;
//! encoder.open()?;
//! encoder.write(&Frame::new_yuv420(1280, 720, 8)?)?;
//! encoder.flush()?;
//! xcoder::drain(&encoder, std::time::Duration::from_millis(1), |packet| {
//!     // the first packet carries the parameter sets
//! })?;
//! ```
//!
//! # Feature Flags
//!
//! - `self-kill` - Terminate the process when a session keeps failing status
//!   checks, instead of returning [`XcoderError::PersistentFailure`]
//! - `cli` - Build the `fake-xcoder` demo binary
//!
//! # Architecture
//!
//! Both directions implement [`SessionBackend`] on top of a shared
//! [`Session`], which handles instance selection, open and close retries,
//! and the keep-alive thread. Hardware access goes through the [`Device`]
//! trait; [`sim::SimulatedDevice`] implements it in memory.

mod backend;
mod decoder;
mod encoder;
mod error;
mod frame;
mod pool;
mod session;
mod status;
mod timestamp;
mod transfer;
mod types;

pub mod device;
pub mod sim;

pub use backend::{drain, ReadOutcome, SessionBackend};
pub use decoder::Decoder;
pub use device::{Device, DeviceErrorCode};
pub use encoder::{Encoder, DEFAULT_BITRATE};
pub use error::{NvmeStatus, XcoderError};
pub use frame::{
    Crop, DecoderMetadata, DeviceSei, EncoderFrameMetadata, Frame, Packet, PacketMetadata,
    PlaneLayout, DECODER_METADATA_SIZE, ENCODER_FRAME_METADATA_SIZE, PACKET_METADATA_SIZE,
};
pub use pool::{FrameBuffer, FramePool};
pub use session::Session;
pub use status::{SessionStats, StatusInfo};
pub use timestamp::{OffsetFifo, PtsCorrection, TimestampQueue, NOPTS_VALUE};
pub use types::{
    align_to_page, CodecFormat, DeviceType, Opcode, RetryPolicy, SessionConfig,
    INVALID_SESSION_ID, MEM_PAGE_ALIGNMENT,
};

// Encoder parameter synthesis
pub use xcoder_params::{pic_type, EncoderParams, EncoderTemplate, ParamError};

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, XcoderError>;
