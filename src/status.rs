//! Buffer-status queries and consecutive-failure escalation.
//!
//! Every device interaction is followed by a status query. The raw block the
//! device returns is interpreted into a [`StatusInfo`], then a
//! [`FailureTracker`] decides whether the session may continue, should retry,
//! or has failed for good.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tracing::{debug, error, trace, warn};

use crate::device::{Device, DeviceErrorCode, RawStatus, SessionAddress};
use crate::error::{NvmeStatus, XcoderError};
use crate::types::{Opcode, INVALID_SESSION_ID};
use crate::Result;

/// Device-side counters of a session, as of the last status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStats {
    pub frames_input: u32,
    pub frames_buffered: u32,
    pub frames_completed: u32,
    pub frames_output: u32,
    pub frames_dropped: u32,
    pub inst_errors: u32,
}

/// Interpreted result of a status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusInfo {
    /// Bytes waiting to be read from the session.
    pub rd_buf_avail: u32,
    /// Bytes the session can accept.
    pub wr_buf_avail: u32,
    pub sess_err_no: u32,
    /// NVMe status of the instance; 0 when healthy.
    pub inst_err_no: u32,
    pub stats: SessionStats,
}

impl StatusInfo {
    /// The instance status, if any.
    #[must_use]
    pub fn inst_status(&self) -> Option<NvmeStatus> {
        NvmeStatus::from_raw(self.inst_err_no)
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.sess_err_no == 0 && self.inst_err_no == 0
    }
}

/// Turn a raw status block into a [`StatusInfo`].
///
/// `prior` is the failure of the command the query follows, if it failed.
/// `epoch` holds the session epoch recorded at open.
pub(crate) fn interpret(
    raw: &RawStatus,
    opcode: Opcode,
    prior: Option<NvmeStatus>,
    epoch: &AtomicU64,
) -> StatusInfo {
    let mut sess_err_no = raw.sess_err_no;
    if opcode == Opcode::Open {
        epoch.store(raw.sess_timestamp, Ordering::Release);
    } else {
        let recorded = epoch.load(Ordering::Acquire);
        if recorded != raw.sess_timestamp && raw.inst_err_no != DeviceErrorCode::ResourceRecovery {
            warn!(
                "session epoch changed {} -> {}",
                recorded, raw.sess_timestamp
            );
            sess_err_no = NvmeStatus::ResourceUnavailable.raw();
        }
    }

    let mut inst_err_no = raw.inst_err_no.to_raw_status();
    if let Some(failed) = prior {
        inst_err_no = if failed.is_retryable() {
            failed.raw()
        } else {
            NvmeStatus::VpuGeneralError.raw()
        };
    }

    StatusInfo {
        rd_buf_avail: raw.rd_buf_avail,
        wr_buf_avail: raw.wr_buf_avail,
        sess_err_no,
        inst_err_no,
        stats: SessionStats {
            frames_input: raw.frames_input,
            frames_buffered: raw.frames_buffered,
            frames_completed: raw.frames_completed,
            frames_output: raw.frames_output,
            frames_dropped: raw.frames_dropped,
            inst_errors: raw.inst_errors,
        },
    }
}

/// Query the buffer status of a session.
pub(crate) fn query_status_info(
    device: &dyn Device,
    addr: SessionAddress,
    opcode: Opcode,
    prior: Option<NvmeStatus>,
    epoch: &AtomicU64,
) -> Result<StatusInfo> {
    if addr.session_id == INVALID_SESSION_ID {
        return Err(XcoderError::invalid_session(format!(
            "status query on closed {} session",
            addr.device_type
        )));
    }
    let raw = device.query_status(addr).map_err(|status| {
        error!(
            "status query failed on {} session {}: {}",
            addr.device_type, addr.session_id, status
        );
        XcoderError::nvme(format!("status query: {status}"))
    })?;
    let info = interpret(&raw, opcode, prior, epoch);
    trace!(
        "session {} {:?}: rd {} wr {} sess_err 0x{:x} inst_err 0x{:x}",
        addr.session_id,
        opcode,
        info.rd_buf_avail,
        info.wr_buf_avail,
        info.sess_err_no,
        info.inst_err_no
    );
    Ok(info)
}

/// Log a device status and report whether the session can survive it.
pub(crate) fn check_error_code(status: NvmeStatus, addr: SessionAddress) -> bool {
    if status.is_device_error() {
        if status.is_fatal() {
            error!(
                "{} session {} on hw {}: {}",
                addr.device_type, addr.session_id, addr.hw_id, status
            );
        } else {
            warn!(
                "{} session {} on hw {}: {}",
                addr.device_type, addr.session_id, addr.hw_id, status
            );
        }
    }
    status.is_fatal()
}

#[cfg(feature = "self-kill")]
fn self_kill() {
    error!("persistent device failure, terminating process");
    // SAFETY: getpid and kill have no memory-safety preconditions.
    unsafe {
        libc::kill(libc::getpid(), libc::SIGTERM);
    }
}

/// Counts consecutive unhealthy status checks.
#[derive(Debug)]
pub(crate) struct FailureTracker {
    count: AtomicU32,
    ceiling: u32,
}

impl FailureTracker {
    pub(crate) fn new(ceiling: u32) -> Self {
        Self {
            count: AtomicU32::new(0),
            ceiling,
        }
    }

    pub(crate) fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    pub(crate) fn reset(&self) {
        self.count.store(0, Ordering::Release);
    }

    /// Decide whether the session may continue after a status query.
    ///
    /// `Ok` with a non-zero `inst_err_no` means "retry later".
    pub(crate) fn check(&self, info: &StatusInfo, opcode: Opcode, addr: SessionAddress) -> Result<()> {
        let count = if info.is_ok() {
            self.count.store(0, Ordering::Release);
            0
        } else {
            self.count.fetch_add(1, Ordering::AcqRel) + 1
        };

        let fatal = info
            .inst_status()
            .is_some_and(|status| check_error_code(status, addr));

        if info.sess_err_no != 0 {
            error!(
                "{:?} on {} session {}: sess_err_no 0x{:x} inst_err_no 0x{:x}",
                opcode, addr.device_type, addr.session_id, info.sess_err_no, info.inst_err_no
            );
            return Err(XcoderError::Session {
                sess_err_no: info.sess_err_no,
                session_id: addr.session_id,
            });
        }
        if count >= self.ceiling {
            error!(
                "{:?} on {} session {}: {} consecutive failures",
                opcode, addr.device_type, addr.session_id, count
            );
            #[cfg(feature = "self-kill")]
            self_kill();
            return Err(XcoderError::PersistentFailure {
                count,
                session_id: addr.session_id,
            });
        }
        if let Some(status) = info.inst_status() {
            if fatal {
                return Err(XcoderError::Device {
                    status,
                    session_id: addr.session_id,
                });
            }
            if status == NvmeStatus::VpuRecovery {
                debug!(
                    "{} session {} reports VPU recovery",
                    addr.device_type, addr.session_id
                );
                return Err(XcoderError::VpuRecovery);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceType;

    fn addr() -> SessionAddress {
        SessionAddress {
            device_type: DeviceType::Decoder,
            hw_id: 0,
            session_id: 3,
        }
    }

    fn healthy(epoch: u64) -> RawStatus {
        RawStatus {
            sess_err_no: 0,
            sess_timestamp: epoch,
            wr_buf_avail: 4096,
            ..Default::default()
        }
    }

    #[test]
    fn test_open_records_epoch() {
        let epoch = AtomicU64::new(0);
        let info = interpret(&healthy(77), Opcode::Open, None, &epoch);
        assert!(info.is_ok());
        assert_eq!(epoch.load(Ordering::Acquire), 77);

        let info = interpret(&healthy(77), Opcode::Write, None, &epoch);
        assert!(info.is_ok());
        assert_eq!(info.wr_buf_avail, 4096);
    }

    #[test]
    fn test_epoch_mismatch() {
        let epoch = AtomicU64::new(5);
        let info = interpret(&healthy(6), Opcode::Read, None, &epoch);
        assert_eq!(info.sess_err_no, 0x301);

        // Mismatch during resource recovery is expected.
        let mut raw = healthy(6);
        raw.inst_err_no = DeviceErrorCode::ResourceRecovery;
        let info = interpret(&raw, Opcode::Read, None, &epoch);
        assert_eq!(info.sess_err_no, 0);
        assert_eq!(info.inst_err_no, 0x3FD);
    }

    #[test]
    fn test_unfilled_status_is_session_error() {
        let epoch = AtomicU64::new(0);
        let raw = RawStatus::default();
        let info = interpret(&raw, Opcode::Query, None, &epoch);
        assert_eq!(info.sess_err_no, 0x4E49);
    }

    #[test]
    fn test_prior_failure() {
        let epoch = AtomicU64::new(1);
        let info = interpret(
            &healthy(1),
            Opcode::Write,
            Some(NvmeStatus::WriteBufferFull),
            &epoch,
        );
        assert_eq!(info.inst_status(), Some(NvmeStatus::WriteBufferFull));

        let info = interpret(
            &healthy(1),
            Opcode::Write,
            Some(NvmeStatus::InvalidParameter),
            &epoch,
        );
        assert_eq!(info.inst_status(), Some(NvmeStatus::VpuGeneralError));
    }

    #[test]
    fn test_tracker_counts_and_resets() {
        let tracker = FailureTracker::new(3);
        let pending = StatusInfo {
            inst_err_no: 0x305,
            ..Default::default()
        };
        assert!(tracker.check(&pending, Opcode::Query, addr()).is_ok());
        assert!(tracker.check(&pending, Opcode::Query, addr()).is_ok());
        assert_eq!(tracker.count(), 2);

        assert!(tracker
            .check(&StatusInfo::default(), Opcode::Query, addr())
            .is_ok());
        assert_eq!(tracker.count(), 0);

        tracker.check(&pending, Opcode::Query, addr()).unwrap();
        tracker.check(&pending, Opcode::Query, addr()).unwrap();
        let err = tracker.check(&pending, Opcode::Query, addr()).unwrap_err();
        assert!(matches!(
            err,
            XcoderError::PersistentFailure {
                count: 3,
                session_id: 3
            }
        ));
    }

    #[test]
    fn test_tracker_fatal_and_session_errors() {
        let tracker = FailureTracker::new(25);
        let fatal = StatusInfo {
            inst_err_no: 0x3FE,
            ..Default::default()
        };
        assert!(matches!(
            tracker.check(&fatal, Opcode::Read, addr()),
            Err(XcoderError::Device {
                status: NvmeStatus::VpuRsrcInsufficient,
                ..
            })
        ));

        let sess = StatusInfo {
            sess_err_no: 0x301,
            ..Default::default()
        };
        assert!(matches!(
            tracker.check(&sess, Opcode::Read, addr()),
            Err(XcoderError::Session {
                sess_err_no: 0x301,
                ..
            })
        ));

        let recovery = StatusInfo {
            inst_err_no: 0x3FD,
            ..Default::default()
        };
        assert!(matches!(
            tracker.check(&recovery, Opcode::Open, addr()),
            Err(XcoderError::VpuRecovery)
        ));
    }

    #[test]
    fn test_check_error_code_classification() {
        assert!(check_error_code(NvmeStatus::ResourceIsEmpty, addr()));
        assert!(!check_error_code(NvmeStatus::ResourceUnavailable, addr()));
        assert!(!check_error_code(NvmeStatus::WriteBufferFull, addr()));
    }
}
