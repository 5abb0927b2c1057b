//! Session lifecycle shared by decoders and encoders.
//!
//! A [`Session`] owns one device-side session: it picks a hardware instance,
//! opens the session (retrying while firmware recovers the VPU), keeps it
//! alive from a background thread, and closes it. Direction-specific state
//! lives in the decoder and encoder types built on top of it.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Sender};
use parking_lot::{const_mutex, Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::device::{ConfigCommand, Device, OpenRequest, SessionAddress, StreamInfo};
use crate::error::{NvmeStatus, XcoderError};
use crate::status::{query_status_info, FailureTracker, SessionStats, StatusInfo};
use crate::types::{DeviceType, Opcode, SessionConfig, INVALID_SESSION_ID};
use crate::Result;

/// Serializes instance selection and the open command that follows it, so
/// concurrent opens see each other's load.
static INSTANCE_SELECTION: Mutex<()> = const_mutex(());

/// Keep-alive period per second of device timeout, about a third of it.
const KEEP_ALIVE_INTERVAL_MS_PER_SECOND: u64 = 330;

struct KeepAlive {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: JoinHandle<()>,
}

impl KeepAlive {
    fn stop(self) {
        {
            let (lock, cond) = &*self.stop;
            *lock.lock() = true;
            cond.notify_all();
        }
        if self.handle.join().is_err() {
            error!("keep-alive thread panicked");
        }
    }
}

/// Arguments of the keep-alive loop.
struct KeepAliveTask {
    device: Arc<dyn Device>,
    addr: SessionAddress,
    epoch: Arc<AtomicU64>,
    lost: Arc<AtomicBool>,
    recovery: Arc<AtomicBool>,
    stop: Arc<(Mutex<bool>, Condvar)>,
    interval: Duration,
    failure_ceiling: u32,
}

impl KeepAliveTask {
    /// Ping and check the session. `false` ends the loop.
    fn ping(&self, tracker: &FailureTracker) -> bool {
        let addr = self.addr;
        let prior = self.device.keep_alive(addr).err();
        let checked = query_status_info(
            self.device.as_ref(),
            addr,
            Opcode::Config,
            prior,
            &self.epoch,
        )
        .and_then(|info| tracker.check(&info, Opcode::Config, addr).map(|()| info));
        match checked {
            Ok(info) if info.inst_err_no == 0 => {
                trace!("keep-alive ok for session {}", addr.session_id);
                true
            }
            Ok(info) => {
                error!(
                    "keep-alive for session {} failed: inst_err_no 0x{:x}",
                    addr.session_id, info.inst_err_no
                );
                false
            }
            // Recovery belongs to the read and write paths, which reopen.
            Err(XcoderError::VpuRecovery) => {
                warn!("keep-alive for session {} saw VPU recovery", addr.session_id);
                self.recovery.store(true, Ordering::Release);
                true
            }
            Err(e) => {
                error!("keep-alive for session {} failed: {}", addr.session_id, e);
                false
            }
        }
    }

    fn run(self, started: Sender<()>) {
        let tracker = FailureTracker::new(self.failure_ceiling);
        let addr = self.addr;
        debug!(
            "keep-alive for {} session {} every {:?}",
            addr.device_type, addr.session_id, self.interval
        );
        let mut deadline = Instant::now();
        let mut started = Some(started);
        loop {
            let alive = self.ping(&tracker);
            if !alive {
                self.lost.store(true, Ordering::Release);
            }
            if let Some(started) = started.take() {
                let _ = started.send(());
            }
            if !alive {
                break;
            }

            deadline += self.interval;
            let (lock, cond) = &*self.stop;
            let mut stopped = lock.lock();
            while !*stopped && !cond.wait_until(&mut stopped, deadline).timed_out() {}
            if *stopped {
                break;
            }
        }
        debug!("keep-alive for session {} stopped", addr.session_id);
    }
}

/// One device-side session and its lifecycle.
pub struct Session {
    device: Arc<dyn Device>,
    device_type: DeviceType,
    config: SessionConfig,
    session_id: AtomicU32,
    hw_id: AtomicU32,
    epoch: Arc<AtomicU64>,
    failures: FailureTracker,
    stats: Mutex<SessionStats>,
    keep_alive: Mutex<Option<KeepAlive>>,
    keep_alive_lost: Arc<AtomicBool>,
    /// VPU recovery seen by the keep-alive thread, not yet reported.
    recovery_pending: Arc<AtomicBool>,
}

impl Session {
    /// Create an unopened session context.
    pub fn new(device: Arc<dyn Device>, device_type: DeviceType, config: SessionConfig) -> Self {
        let failures = FailureTracker::new(config.retry.failure_ceiling);
        Self {
            device,
            device_type,
            config,
            session_id: AtomicU32::new(INVALID_SESSION_ID),
            hw_id: AtomicU32::new(0),
            epoch: Arc::new(AtomicU64::new(0)),
            failures,
            stats: Mutex::new(SessionStats::default()),
            keep_alive: Mutex::new(None),
            keep_alive_lost: Arc::new(AtomicBool::new(false)),
            recovery_pending: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Device-assigned id, or [`INVALID_SESSION_ID`] while closed.
    #[must_use]
    pub fn session_id(&self) -> u32 {
        self.session_id.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn hw_id(&self) -> u32 {
        self.hw_id.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.session_id() != INVALID_SESSION_ID
    }

    /// Largest single transfer the device accepts.
    #[must_use]
    pub fn max_io_size(&self) -> usize {
        self.device.max_io_size()
    }

    /// Consecutive unhealthy status checks so far.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.failures.count()
    }

    /// Counters from the most recent status query.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        *self.stats.lock()
    }

    pub(crate) fn addr(&self) -> SessionAddress {
        SessionAddress {
            device_type: self.device_type,
            hw_id: self.hw_id(),
            session_id: self.session_id(),
        }
    }

    /// Query the session status and decide whether it may continue.
    ///
    /// `prior` is the failure of the command this query follows. `Ok` with a
    /// non-zero `inst_err_no` asks the caller to retry.
    pub(crate) fn check_status(
        &self,
        opcode: Opcode,
        prior: Option<NvmeStatus>,
    ) -> Result<StatusInfo> {
        if self.keep_alive_lost.load(Ordering::Acquire) {
            return Err(XcoderError::invalid_session(format!(
                "keep-alive lost for session {}",
                self.session_id()
            )));
        }
        if self.recovery_pending.swap(false, Ordering::AcqRel) {
            debug!(
                "{} session {} reports VPU recovery seen by keep-alive",
                self.device_type,
                self.session_id()
            );
            return Err(XcoderError::VpuRecovery);
        }
        let addr = self.addr();
        let info = query_status_info(self.device.as_ref(), addr, opcode, prior, &self.epoch)?;
        *self.stats.lock() = info.stats;
        self.failures.check(&info, opcode, addr)?;
        Ok(info)
    }

    /// Send a configuration command and check the session afterwards.
    pub(crate) fn configure(&self, command: &ConfigCommand) -> Result<()> {
        let prior = self.device.configure(self.addr(), command).err();
        self.check_status(Opcode::Config, prior)?;
        match prior {
            Some(status) => Err(XcoderError::nvme(format!("config {command:?}: {status}"))),
            None => Ok(()),
        }
    }

    /// Output stream properties as the device currently sees them.
    pub(crate) fn query_stream_info(&self) -> Result<StreamInfo> {
        match self.device.query_stream_info(self.addr()) {
            Ok(info) => Ok(info),
            Err(status) => {
                self.check_status(Opcode::Query, Some(status))?;
                Err(XcoderError::nvme(format!("stream info: {status}")))
            }
        }
    }

    fn select_instance(&self) -> Result<u32> {
        if let Some(hw_id) = self.config.hw_id {
            return Ok(hw_id);
        }
        let loads = self
            .device
            .instances(self.device_type)
            .map_err(|status| XcoderError::nvme(format!("instance query: {status}")))?;
        loads
            .iter()
            .min_by_key(|l| (l.load, l.model_load, l.hw_id))
            .map(|l| l.hw_id)
            .ok_or_else(|| {
                XcoderError::ResourceUnavailable(format!("no {} instance", self.device_type))
            })
    }

    fn open_request(&self) -> OpenRequest {
        OpenRequest {
            codec: self.config.codec,
            width: self.config.width,
            height: self.config.height,
            bit_depth: self.config.bit_depth,
            model_load: self.config.model_load(),
            low_delay: self.config.low_delay || self.config.low_delay_ms > 0,
        }
    }

    /// Drop the device-side session without the keep-alive or retry dance.
    fn discard(&self) {
        let addr = self.addr();
        if addr.session_id == INVALID_SESSION_ID {
            return;
        }
        if let Err(status) = self.device.close_session(addr) {
            warn!("discarding session {}: {}", addr.session_id, status);
        }
        self.session_id.store(INVALID_SESSION_ID, Ordering::Release);
    }

    /// Open the session.
    ///
    /// `setup` runs once the session exists and its status checked out; an
    /// error from it closes the session again. VPU recovery reported at any
    /// point before `setup` returns restarts the open.
    pub(crate) fn open(&self, mut setup: impl FnMut(&Self) -> Result<()>) -> Result<()> {
        if self.is_open() {
            return Err(XcoderError::invalid_session(format!(
                "session {} already open",
                self.session_id()
            )));
        }
        let retry = &self.config.retry;
        let request = self.open_request();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let (hw_id, session_id) = {
                let _selection = INSTANCE_SELECTION.lock();
                let hw_id = self.select_instance()?;
                let session_id = self
                    .device
                    .open_session(self.device_type, hw_id, &request)
                    .map_err(|status| {
                        error!("open {} on hw {} failed: {}", self.device_type, hw_id, status);
                        XcoderError::nvme(format!("open session: {status}"))
                    })?;
                (hw_id, session_id)
            };
            self.hw_id.store(hw_id, Ordering::Release);
            self.session_id.store(session_id, Ordering::Release);
            self.failures.reset();
            self.keep_alive_lost.store(false, Ordering::Release);
            self.recovery_pending.store(false, Ordering::Release);

            let result = self
                .check_status(Opcode::Open, None)
                .and_then(|_| {
                    self.configure(&ConfigCommand::KeepAliveTimeout(
                        self.config.keep_alive_timeout_us(),
                    ))
                })
                .and_then(|()| setup(self));
            match result {
                Ok(()) => break,
                Err(XcoderError::VpuRecovery) if attempt < retry.session_open_retries => {
                    warn!(
                        "{} session {} hit VPU recovery during open, retry {}",
                        self.device_type, session_id, attempt
                    );
                    self.discard();
                    thread::sleep(retry.session_open_interval);
                }
                Err(e) => {
                    error!("{} session {} open failed: {}", self.device_type, session_id, e);
                    self.discard();
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.start_keep_alive() {
            error!("keep-alive start failed: {}", e);
            self.discard();
            return Err(e);
        }
        info!(
            "{} session {} open on {} hw {}",
            self.device_type,
            self.session_id(),
            self.device.name(),
            self.hw_id()
        );
        Ok(())
    }

    /// Start the keep-alive thread once its first ping is done.
    fn start_keep_alive(&self) -> Result<()> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let task = KeepAliveTask {
            device: self.device.clone(),
            addr: self.addr(),
            epoch: self.epoch.clone(),
            lost: self.keep_alive_lost.clone(),
            recovery: self.recovery_pending.clone(),
            stop: stop.clone(),
            interval: Duration::from_millis(
                u64::from(self.config.keep_alive_timeout) * KEEP_ALIVE_INTERVAL_MS_PER_SECOND,
            ),
            failure_ceiling: self.config.retry.failure_ceiling,
        };
        let (started_tx, started_rx) = bounded(1);
        let handle = thread::Builder::new()
            .name(format!("xcoder-keepalive-{}", self.session_id()))
            .spawn(move || task.run(started_tx))
            .map_err(|e| XcoderError::failure(format!("spawn keep-alive: {e}")))?;
        if started_rx.recv().is_err() {
            warn!("keep-alive for session {} exited before its first ping", self.session_id());
        }
        *self.keep_alive.lock() = Some(KeepAlive { stop, handle });
        Ok(())
    }

    /// Stop and join the keep-alive thread, if running.
    pub(crate) fn stop_keep_alive(&self) {
        let keep_alive = self.keep_alive.lock().take();
        if let Some(keep_alive) = keep_alive {
            keep_alive.stop();
        }
    }

    /// Whether the keep-alive thread gave up on the session.
    #[must_use]
    pub fn keep_alive_lost(&self) -> bool {
        self.keep_alive_lost.load(Ordering::Acquire)
    }

    /// Signal end of input. The session stays open for draining output.
    pub(crate) fn flush(&self) -> Result<()> {
        if !self.is_open() {
            return Err(XcoderError::invalid_session("flush on closed session"));
        }
        self.configure(&ConfigCommand::EndOfStream)?;
        debug!("{} session {} flushed", self.device_type, self.session_id());
        Ok(())
    }

    /// Close the device-side session. Closing a closed session succeeds.
    pub(crate) fn close(&self) -> Result<()> {
        self.stop_keep_alive();
        let addr = self.addr();
        if addr.session_id == INVALID_SESSION_ID {
            trace!("{} session already closed", self.device_type);
            return Ok(());
        }

        let retry = &self.config.retry;
        let mut result = Ok(());
        let mut attempt = 0;
        loop {
            match self.device.close_session(addr) {
                Ok(()) => break,
                Err(status) if attempt + 1 < retry.session_close_retries => {
                    attempt += 1;
                    debug!(
                        "close of session {} not done ({}), retry {}",
                        addr.session_id, status, attempt
                    );
                    thread::sleep(retry.session_close_interval);
                }
                Err(status) => {
                    error!("close of session {} failed: {}", addr.session_id, status);
                    result = Err(XcoderError::nvme(format!("close session: {status}")));
                    break;
                }
            }
        }
        self.session_id.store(INVALID_SESSION_ID, Ordering::Release);
        info!("{} session {} closed", self.device_type, addr.session_id);
        result
    }

    /// Refresh and return the device-side counters of the session.
    pub fn session_load(&self) -> Result<SessionStats> {
        self.check_status(Opcode::Query, None)?;
        Ok(self.stats())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("close on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceErrorCode;
    use crate::sim::SimulatedDevice;
    use crate::types::{CodecFormat, RetryPolicy};

    fn config() -> SessionConfig {
        SessionConfig::new(CodecFormat::H264, 64, 64).retry(RetryPolicy::fast())
    }

    fn session(sim: &Arc<SimulatedDevice>, config: SessionConfig) -> Session {
        Session::new(sim.clone(), DeviceType::Decoder, config)
    }

    #[test]
    fn test_open_and_close() {
        let sim = Arc::new(SimulatedDevice::new(4096));
        let s = session(&sim, config());
        assert!(!s.is_open());
        s.open(|_| Ok(())).unwrap();
        assert!(s.is_open());
        assert_eq!(sim.active_sessions(), 1);
        assert_eq!(
            sim.configs(s.session_id()),
            vec![ConfigCommand::KeepAliveTimeout(3_000_000)]
        );

        let id = s.session_id();
        s.close().unwrap();
        assert!(!s.is_open());
        assert_eq!(sim.closed_sessions(), vec![id]);
    }

    #[test]
    fn test_close_twice() {
        let sim = Arc::new(SimulatedDevice::new(4096));
        let s = session(&sim, config());
        s.open(|_| Ok(())).unwrap();
        s.close().unwrap();
        s.close().unwrap();
        assert_eq!(sim.closed_sessions().len(), 1);
    }

    #[test]
    fn test_open_twice_rejected() {
        let sim = Arc::new(SimulatedDevice::new(4096));
        let s = session(&sim, config());
        s.open(|_| Ok(())).unwrap();
        assert!(matches!(
            s.open(|_| Ok(())),
            Err(XcoderError::InvalidSession(_))
        ));
    }

    #[test]
    fn test_open_retries_vpu_recovery() {
        let sim = Arc::new(SimulatedDevice::new(4096));
        sim.recover_on_open(2);
        let s = session(&sim, config());
        s.open(|_| Ok(())).unwrap();
        assert_eq!(sim.open_commands(), 3);
        assert_eq!(sim.closed_sessions().len(), 2);
        assert_eq!(sim.active_sessions(), 1);
    }

    #[test]
    fn test_open_gives_up_on_recovery() {
        let sim = Arc::new(SimulatedDevice::new(4096));
        sim.recover_on_open(100);
        let mut retry = RetryPolicy::fast();
        retry.session_open_retries = 4;
        let s = session(&sim, config().retry(retry));
        assert!(matches!(s.open(|_| Ok(())), Err(XcoderError::VpuRecovery)));
        assert_eq!(sim.open_commands(), 4);
        assert_eq!(sim.active_sessions(), 0);
        assert!(!s.is_open());
    }

    #[test]
    fn test_setup_failure_closes() {
        let sim = Arc::new(SimulatedDevice::new(4096));
        let s = session(&sim, config());
        let err = s
            .open(|_| Err(XcoderError::invalid_param("bad setup")))
            .unwrap_err();
        assert!(matches!(err, XcoderError::InvalidParam(_)));
        assert_eq!(sim.active_sessions(), 0);
    }

    #[test]
    fn test_least_loaded_instance() {
        let sim = Arc::new(
            SimulatedDevice::new(4096).with_instances(DeviceType::Decoder, &[50, 10, 10]),
        );
        let s = session(&sim, config());
        s.open(|_| Ok(())).unwrap();
        assert_eq!(s.hw_id(), 1);

        // Equal load: the instance without sessions wins on model load.
        let s2 = session(&sim, config());
        s2.open(|_| Ok(())).unwrap();
        assert_eq!(s2.hw_id(), 2);

        let pinned = session(&sim, config().hw_id(0));
        pinned.open(|_| Ok(())).unwrap();
        assert_eq!(pinned.hw_id(), 0);
    }

    #[test]
    fn test_close_waits_for_device() {
        let sim = Arc::new(SimulatedDevice::new(4096));
        let s = session(&sim, config());
        s.open(|_| Ok(())).unwrap();
        sim.pending_closes(3);
        s.close().unwrap();
        assert_eq!(sim.active_sessions(), 0);
    }

    #[test]
    fn test_close_gives_up() {
        let sim = Arc::new(SimulatedDevice::new(4096));
        let s = session(&sim, config());
        s.open(|_| Ok(())).unwrap();
        sim.pending_closes(100);
        assert!(s.close().is_err());
        assert!(!s.is_open());
        assert!(s.close().is_ok());
    }

    #[test]
    fn test_epoch_recycle_detected() {
        let sim = Arc::new(SimulatedDevice::new(4096));
        let s = session(&sim, config());
        s.open(|_| Ok(())).unwrap();
        s.check_status(Opcode::Query, None).unwrap();
        sim.recycle_epochs();
        let err = s.check_status(Opcode::Query, None).unwrap_err();
        assert!(matches!(
            err,
            XcoderError::Session {
                sess_err_no: 0x301,
                ..
            }
        ));
    }

    #[test]
    fn test_keep_alive_pings() {
        let sim = Arc::new(SimulatedDevice::new(4096));
        let s = session(&sim, config().keep_alive_timeout(1));
        s.open(|_| Ok(())).unwrap();
        // The first ping is done before open returns.
        assert!(sim.keep_alives() >= 1);
        thread::sleep(Duration::from_millis(1200));
        assert!(sim.keep_alives() >= 3);
        assert!(!s.keep_alive_lost());
        s.close().unwrap();
    }

    #[test]
    fn test_keep_alive_loss_fails_session() {
        let sim = Arc::new(SimulatedDevice::new(4096));
        let s = session(&sim, config().keep_alive_timeout(1));
        s.open(|_| Ok(())).unwrap();
        sim.set_persistent_status_error(Some(DeviceErrorCode::GeneralError));
        thread::sleep(Duration::from_millis(800));
        assert!(s.keep_alive_lost());
        sim.set_persistent_status_error(None);
        assert!(matches!(
            s.check_status(Opcode::Read, None),
            Err(XcoderError::InvalidSession(_))
        ));
        s.close().unwrap();
    }

    #[test]
    fn test_keep_alive_survives_vpu_recovery() {
        let sim = Arc::new(SimulatedDevice::new(4096));
        let s = session(&sim, config().keep_alive_timeout(1));
        s.open(|_| Ok(())).unwrap();
        sim.inject_status_errors(DeviceErrorCode::ResourceRecovery, 1);
        thread::sleep(Duration::from_millis(800));
        assert!(!s.keep_alive_lost());

        // Reported once, to the next caller, which decides to reopen.
        assert!(matches!(
            s.check_status(Opcode::Read, None),
            Err(XcoderError::VpuRecovery)
        ));
        assert!(s.check_status(Opcode::Read, None).is_ok());

        let pings = sim.keep_alives();
        thread::sleep(Duration::from_millis(500));
        assert!(sim.keep_alives() > pings);
        s.close().unwrap();
    }

    #[test]
    fn test_session_load() {
        let sim = Arc::new(SimulatedDevice::new(4096));
        let s = session(&sim, config());
        assert!(s.session_load().is_err());
        s.open(|_| Ok(())).unwrap();
        let stats = s.session_load().unwrap();
        assert_eq!(stats.frames_input, 0);
    }

    #[test]
    fn test_flush_sends_eos() {
        let sim = Arc::new(SimulatedDevice::new(4096));
        let s = session(&sim, config());
        assert!(s.flush().is_err());
        s.open(|_| Ok(())).unwrap();
        s.flush().unwrap();
        assert_eq!(
            sim.configs(s.session_id()).last(),
            Some(&ConfigCommand::EndOfStream)
        );
    }
}
