//! The command boundary between a session and the transcoder hardware.
//!
//! The real device speaks vendor NVMe admin and I/O commands. Sessions only
//! rely on the contract expressed by [`Device`]: a fixed maximum transfer size
//! per command, explicit session addressing, and a status query that reports
//! read and write buffer availability.

use xcoder_params::{CodecFormat, EncoderTemplate};

use crate::error::NvmeStatus;
use crate::types::DeviceType;

/// Result of a single device command. The error is the status the device
/// placed in the completion entry.
pub type CommandResult<T> = std::result::Result<T, NvmeStatus>;

/// Addresses one session on one hardware instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionAddress {
    pub device_type: DeviceType,
    pub hw_id: u32,
    pub session_id: u32,
}

/// Load reported for one hardware instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceLoad {
    pub hw_id: u32,
    /// Percentage of the instance currently in use.
    pub load: u32,
    /// Sum of the model loads of the sessions on the instance.
    pub model_load: u64,
    pub active_sessions: u32,
}

/// Parameters of an open-session command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub codec: CodecFormat,
    pub width: u32,
    pub height: u32,
    pub bit_depth: u8,
    pub model_load: u64,
    pub low_delay: bool,
}

/// Configuration commands accepted by an open session.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigCommand {
    StartOfStream,
    EndOfStream,
    /// Keep-alive timeout in microseconds.
    KeepAliveTimeout(u32),
    /// Validated encoder configuration.
    EncoderParams(Box<EncoderTemplate>),
}

/// Error class reported by the instance in a status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceErrorCode {
    #[default]
    Success,
    GeneralError,
    RequestPending,
    ResourceRecovery,
    ResourceInsufficient,
    /// Already an NVMe status value.
    Other(u32),
}

impl DeviceErrorCode {
    /// Map the instance code onto the NVMe status space. Success maps to 0.
    #[must_use]
    pub fn to_raw_status(self) -> u32 {
        match self {
            Self::Success => 0,
            Self::GeneralError => NvmeStatus::VpuGeneralError.raw(),
            Self::RequestPending => NvmeStatus::RequestInProgress.raw(),
            Self::ResourceRecovery => NvmeStatus::VpuRecovery.raw(),
            Self::ResourceInsufficient => NvmeStatus::VpuRsrcInsufficient.raw(),
            Self::Other(raw) => raw,
        }
    }
}

/// Session error number a status block carries until the device fills it in.
pub const SESSION_ERR_UNSET: u32 = 0x4E49;

/// Status block returned by a status query, before host-side interpretation.
///
/// The default block reports [`SESSION_ERR_UNSET`], so a device must clear
/// `sess_err_no` explicitly for the session to be considered healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawStatus {
    pub rd_buf_avail: u32,
    pub wr_buf_avail: u32,
    pub sess_err_no: u32,
    pub inst_err_no: DeviceErrorCode,
    /// Epoch of the session; changes when firmware recycles it.
    pub sess_timestamp: u64,
    pub frames_input: u32,
    pub frames_buffered: u32,
    pub frames_completed: u32,
    pub frames_output: u32,
    pub frames_dropped: u32,
    pub inst_errors: u32,
}

impl Default for RawStatus {
    fn default() -> Self {
        Self {
            rd_buf_avail: 0,
            wr_buf_avail: 0,
            sess_err_no: SESSION_ERR_UNSET,
            inst_err_no: DeviceErrorCode::Success,
            sess_timestamp: 0,
            frames_input: 0,
            frames_buffered: 0,
            frames_completed: 0,
            frames_output: 0,
            frames_dropped: 0,
            inst_errors: 0,
        }
    }
}

/// Output stream properties negotiated by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamInfo {
    pub picture_width: u32,
    pub picture_height: u32,
    pub transfer_frame_stride: u32,
    pub transfer_frame_height: u32,
    pub frame_rate: u32,
    pub is_flushed: bool,
}

/// Addressing of one chunk of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkCommand {
    /// Offset of the chunk in units of `FRAME_CHUNK_INDEX_SIZE`.
    pub chunk_index: u32,
    /// Meaningful bytes in the chunk.
    pub logical_len: usize,
    /// Meaningful bytes in the whole transfer.
    pub total_len: usize,
    /// Set on the final chunk of the transfer.
    pub last: bool,
}

/// A transcoder reachable through session commands.
///
/// Buffers passed to [`Device::write_chunk`] and [`Device::read_chunk`] are
/// already rounded up to the page alignment; only the first `logical_len`
/// bytes carry data.
pub trait Device: Send + Sync {
    /// Name of the device node, for logs.
    fn name(&self) -> &str;

    /// Largest transfer a single read or write command may carry.
    fn max_io_size(&self) -> usize;

    /// Load of every instance of the given type.
    fn instances(&self, device_type: DeviceType) -> CommandResult<Vec<InstanceLoad>>;

    /// Open a session; returns the device-assigned session id.
    fn open_session(
        &self,
        device_type: DeviceType,
        hw_id: u32,
        request: &OpenRequest,
    ) -> CommandResult<u32>;

    fn close_session(&self, addr: SessionAddress) -> CommandResult<()>;

    fn configure(&self, addr: SessionAddress, command: &ConfigCommand) -> CommandResult<()>;

    fn query_status(&self, addr: SessionAddress) -> CommandResult<RawStatus>;

    fn query_stream_info(&self, addr: SessionAddress) -> CommandResult<StreamInfo>;

    fn write_chunk(&self, addr: SessionAddress, chunk: &ChunkCommand, data: &[u8])
        -> CommandResult<()>;

    fn read_chunk(
        &self,
        addr: SessionAddress,
        chunk: &ChunkCommand,
        buf: &mut [u8],
    ) -> CommandResult<()>;

    fn keep_alive(&self, addr: SessionAddress) -> CommandResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_code_mapping() {
        assert_eq!(DeviceErrorCode::Success.to_raw_status(), 0);
        assert_eq!(DeviceErrorCode::GeneralError.to_raw_status(), 0x3FF);
        assert_eq!(DeviceErrorCode::RequestPending.to_raw_status(), 0x305);
        assert_eq!(DeviceErrorCode::ResourceRecovery.to_raw_status(), 0x3FD);
        assert_eq!(DeviceErrorCode::ResourceInsufficient.to_raw_status(), 0x3FE);
        assert_eq!(DeviceErrorCode::Other(0x200).to_raw_status(), 0x200);
    }

    #[test]
    fn test_raw_status_default_is_unhealthy() {
        let status = RawStatus::default();
        assert_eq!(status.sess_err_no, SESSION_ERR_UNSET);
        assert_eq!(status.inst_err_no, DeviceErrorCode::Success);
    }
}
