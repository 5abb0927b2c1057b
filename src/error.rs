//! Error types for xcoder session operations.

use std::fmt;

use thiserror::Error;
use xcoder_params::ParamError;

/// Status codes reported by the device for a failed or refused command.
///
/// These are the raw NVMe status values the firmware places in the instance
/// error field. Values the library does not know are kept as [`NvmeStatus::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NvmeStatus {
    /// The instance write buffer cannot take the payload right now.
    WriteBufferFull,
    ResourceUnavailable,
    ResourceIsEmpty,
    ResourceNotFound,
    RequestNotCompleted,
    RequestInProgress,
    InvalidParameter,
    /// The VPU is being reset by firmware; the session must be reopened.
    VpuRecovery,
    VpuRsrcInsufficient,
    VpuGeneralError,
    /// A status code outside the known set.
    Other(u32),
}

impl NvmeStatus {
    /// Convert a raw status value. Zero means success and has no status.
    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        let status = match raw {
            0 => return None,
            0x200 => Self::WriteBufferFull,
            0x301 => Self::ResourceUnavailable,
            0x302 => Self::ResourceIsEmpty,
            0x303 => Self::ResourceNotFound,
            0x304 => Self::RequestNotCompleted,
            0x305 => Self::RequestInProgress,
            0x306 => Self::InvalidParameter,
            0x3FD => Self::VpuRecovery,
            0x3FE => Self::VpuRsrcInsufficient,
            0x3FF => Self::VpuGeneralError,
            other => Self::Other(other),
        };
        Some(status)
    }

    /// Raw status value as carried on the wire.
    #[must_use]
    pub fn raw(&self) -> u32 {
        match self {
            Self::WriteBufferFull => 0x200,
            Self::ResourceUnavailable => 0x301,
            Self::ResourceIsEmpty => 0x302,
            Self::ResourceNotFound => 0x303,
            Self::RequestNotCompleted => 0x304,
            Self::RequestInProgress => 0x305,
            Self::InvalidParameter => 0x306,
            Self::VpuRecovery => 0x3FD,
            Self::VpuRsrcInsufficient => 0x3FE,
            Self::VpuGeneralError => 0x3FF,
            Self::Other(raw) => *raw,
        }
    }

    /// Statuses that mean "try the same command again later".
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::WriteBufferFull | Self::RequestInProgress | Self::ResourceUnavailable
        )
    }

    /// Statuses after which the session cannot continue.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ResourceIsEmpty
                | Self::ResourceNotFound
                | Self::VpuRsrcInsufficient
                | Self::VpuGeneralError
        )
    }

    /// Statuses in the device error band, which are always logged.
    #[must_use]
    pub fn is_device_error(&self) -> bool {
        (0x301..=0x3FF).contains(&self.raw())
    }
}

impl fmt::Display for NvmeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(raw) => write!(f, "status 0x{raw:x}"),
            known => write!(f, "{known:?} (0x{:x})", known.raw()),
        }
    }
}

/// Errors that can occur while driving a transcoder session.
#[derive(Debug, Error)]
pub enum XcoderError {
    /// Unclassified failure.
    #[error("xcoder failure: {0}")]
    Failure(String),

    /// Invalid argument passed to a public entry point.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// Buffer allocation failed.
    #[error("memory allocation failed: {0}")]
    MemAlloc(String),

    /// A command to the device did not complete.
    #[error("NVMe command failed: {0}")]
    NvmeCmdFailed(String),

    /// Operation on a session that is not open.
    #[error("invalid session: {0}")]
    InvalidSession(String),

    /// Device resource is temporarily unavailable; retrying may succeed.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// Firmware is recovering the VPU; the session must be reopened.
    #[error("VPU recovery in progress")]
    VpuRecovery,

    /// The device reported a status the session cannot continue from.
    #[error("device error {status} on session {session_id}")]
    Device { status: NvmeStatus, session_id: u32 },

    /// The device reported a session-level error number.
    #[error("session error 0x{sess_err_no:x} on session {session_id}")]
    Session { sess_err_no: u32, session_id: u32 },

    /// Too many consecutive failed status checks.
    #[error("persistent failures on session {session_id} ({count} consecutive)")]
    PersistentFailure { count: u32, session_id: u32 },

    /// Encoder parameter error.
    #[error(transparent)]
    Param(#[from] ParamError),
}

impl XcoderError {
    /// Numeric return code used by the device library for this error.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Failure(_)
            | Self::Device { .. }
            | Self::Session { .. }
            | Self::PersistentFailure { .. } => -1,
            Self::InvalidParam(_) => -2,
            Self::MemAlloc(_) => -3,
            Self::NvmeCmdFailed(_) => -4,
            Self::InvalidSession(_) => -5,
            Self::ResourceUnavailable(_) => -6,
            Self::VpuRecovery => -59,
            Self::Param(e) => e.code(),
        }
    }

    /// Whether the caller may reasonably retry the operation.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ResourceUnavailable(_) | Self::VpuRecovery)
    }

    /// Create an InvalidParam error with a message.
    pub fn invalid_param(msg: impl Into<String>) -> Self {
        Self::InvalidParam(msg.into())
    }

    /// Create an InvalidSession error with a message.
    pub fn invalid_session(msg: impl Into<String>) -> Self {
        Self::InvalidSession(msg.into())
    }

    /// Create a MemAlloc error with a message.
    pub fn mem_alloc(msg: impl Into<String>) -> Self {
        Self::MemAlloc(msg.into())
    }

    /// Create an NvmeCmdFailed error with a message.
    pub fn nvme(msg: impl Into<String>) -> Self {
        Self::NvmeCmdFailed(msg.into())
    }

    /// Create a Failure error with a message.
    pub fn failure(msg: impl Into<String>) -> Self {
        Self::Failure(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_raw_values() {
        assert_eq!(NvmeStatus::from_raw(0), None);
        assert_eq!(NvmeStatus::from_raw(0x200), Some(NvmeStatus::WriteBufferFull));
        assert_eq!(NvmeStatus::from_raw(0x3FD), Some(NvmeStatus::VpuRecovery));
        assert_eq!(NvmeStatus::from_raw(0x123), Some(NvmeStatus::Other(0x123)));
        for raw in [0x200, 0x301, 0x302, 0x303, 0x304, 0x305, 0x306, 0x3FD, 0x3FE, 0x3FF] {
            assert_eq!(NvmeStatus::from_raw(raw).map(|s| s.raw()), Some(raw));
        }
    }

    #[test]
    fn test_status_classification() {
        assert!(NvmeStatus::WriteBufferFull.is_retryable());
        assert!(NvmeStatus::RequestInProgress.is_retryable());
        assert!(!NvmeStatus::VpuGeneralError.is_retryable());

        assert!(NvmeStatus::VpuGeneralError.is_fatal());
        assert!(NvmeStatus::ResourceNotFound.is_fatal());
        assert!(!NvmeStatus::VpuRecovery.is_fatal());
        assert!(!NvmeStatus::RequestInProgress.is_fatal());

        assert!(NvmeStatus::VpuRecovery.is_device_error());
        assert!(!NvmeStatus::WriteBufferFull.is_device_error());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(XcoderError::invalid_param("x").code(), -2);
        assert_eq!(XcoderError::invalid_session("closed").code(), -5);
        assert_eq!(XcoderError::VpuRecovery.code(), -59);
        assert_eq!(
            XcoderError::PersistentFailure {
                count: 25,
                session_id: 1
            }
            .code(),
            -1
        );
        let param: XcoderError = ParamError::InvalidName("bogus".into()).into();
        assert_eq!(param.code(), -7);
    }

    #[test]
    fn test_display() {
        let err = XcoderError::Device {
            status: NvmeStatus::VpuGeneralError,
            session_id: 4,
        };
        assert_eq!(
            err.to_string(),
            "device error VpuGeneralError (0x3ff) on session 4"
        );
    }
}
