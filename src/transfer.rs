//! Chunked transfers across the device's per-command size limit.
//!
//! A payload larger than [`Device::max_io_size`] is cut into chunks. The
//! final chunk is always transferred first, on the calling thread, and the
//! remaining chunks are only handed to the worker pool once it has been
//! acknowledged. Firmware relies on that order. A payload that fits in one
//! command never touches the pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

use crate::device::{ChunkCommand, CommandResult, Device, SessionAddress};
use crate::error::{NvmeStatus, XcoderError};
use crate::types::{align_to_page, RetryPolicy, FRAME_CHUNK_INDEX_SIZE};
use crate::Result;

/// Capacity of a worker request queue.
pub const WORKER_QUEUE_DEPTH: usize = 256;

/// One chunk of a planned transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    /// Byte offset of the chunk in the transfer.
    pub offset: usize,
    /// Bytes actually sent to or read from the device, page aligned.
    pub device_len: usize,
    pub command: ChunkCommand,
}

/// Split `total` bytes into chunks of at most `max_io` bytes.
#[must_use]
pub fn plan_chunks(total: usize, max_io: usize) -> Vec<ChunkPlan> {
    if total == 0 || max_io == 0 {
        return Vec::new();
    }
    let count = total.div_ceil(max_io);
    (0..count)
        .map(|i| {
            let offset = i * max_io;
            let logical_len = (total - offset).min(max_io);
            ChunkPlan {
                offset,
                device_len: align_to_page(logical_len),
                command: ChunkCommand {
                    chunk_index: (offset / FRAME_CHUNK_INDEX_SIZE) as u32,
                    logical_len,
                    total_len: total,
                    last: i + 1 == count,
                },
            }
        })
        .collect()
}

/// Chunk size usable on a device whose largest transfer is `max_io` bytes.
///
/// Chunks are addressed in [`FRAME_CHUNK_INDEX_SIZE`] units, so every chunk
/// but the last has to end on one of those boundaries.
pub(crate) fn usable_io_size(max_io: usize) -> Result<usize> {
    let usable = max_io / FRAME_CHUNK_INDEX_SIZE * FRAME_CHUNK_INDEX_SIZE;
    if usable == 0 {
        return Err(XcoderError::invalid_param(format!(
            "max I/O size {max_io} is below one {FRAME_CHUNK_INDEX_SIZE} byte chunk unit"
        )));
    }
    Ok(usable)
}

/// Resend limits for a single chunk.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChunkRetry {
    pub retries: u32,
    pub interval: Duration,
}

impl From<&RetryPolicy> for ChunkRetry {
    fn from(policy: &RetryPolicy) -> Self {
        Self {
            retries: policy.chunk_retries,
            interval: policy.chunk_retry_interval,
        }
    }
}

/// Issue a chunk command until it succeeds.
///
/// VPU recovery is handed back when `stop_on_recovery` is set. Any other
/// failure is retried; exhausting the retries means host and firmware no
/// longer agree on the transfer, and the process is aborted.
fn issue_with_retry(
    mut op: impl FnMut() -> CommandResult<()>,
    retry: ChunkRetry,
    addr: SessionAddress,
    command: &ChunkCommand,
    stop_on_recovery: bool,
) -> CommandResult<()> {
    let mut attempts = 0u32;
    loop {
        match op() {
            Ok(()) => return Ok(()),
            Err(NvmeStatus::VpuRecovery) if stop_on_recovery => {
                return Err(NvmeStatus::VpuRecovery)
            }
            Err(status) => {
                attempts += 1;
                trace!(
                    "session {} chunk {} failed ({}), retry {}",
                    addr.session_id,
                    command.chunk_index,
                    status,
                    attempts
                );
                if attempts >= retry.retries {
                    error!(
                        "{} session {} chunk {} failed {} times, aborting",
                        addr.device_type, addr.session_id, command.chunk_index, attempts
                    );
                    std::process::abort();
                }
                thread::sleep(retry.interval);
            }
        }
    }
}

#[derive(Default)]
struct CompletionState {
    processed: usize,
    reads: Vec<(usize, Vec<u8>)>,
}

/// Byte counter the issuing thread waits on until every chunk is done.
#[derive(Default)]
struct Completion {
    state: Mutex<CompletionState>,
    cond: Condvar,
}

impl Completion {
    fn add(&self, bytes: usize, read: Option<(usize, Vec<u8>)>) {
        let mut state = self.state.lock();
        state.processed += bytes;
        if let Some(read) = read {
            state.reads.push(read);
        }
        self.cond.notify_all();
    }

    fn wait_for(&self, total: usize) -> Vec<(usize, Vec<u8>)> {
        let mut state = self.state.lock();
        while state.processed < total {
            self.cond.wait(&mut state);
        }
        std::mem::take(&mut state.reads)
    }
}

enum Payload {
    Write(Bytes),
    Read,
}

struct ChunkJob {
    addr: SessionAddress,
    plan: ChunkPlan,
    payload: Payload,
    completion: Arc<Completion>,
}

enum Job {
    Chunk(ChunkJob),
    Shutdown,
}

fn run_job(device: &dyn Device, job: ChunkJob, retry: ChunkRetry) {
    let ChunkJob {
        addr,
        plan,
        payload,
        completion,
    } = job;
    let result = match payload {
        Payload::Write(data) => {
            issue_with_retry(
                || device.write_chunk(addr, &plan.command, &data),
                retry,
                addr,
                &plan.command,
                false,
            )
            .map(|()| None)
        }
        Payload::Read => {
            let mut buf = vec![0u8; plan.device_len];
            issue_with_retry(
                || device.read_chunk(addr, &plan.command, &mut buf),
                retry,
                addr,
                &plan.command,
                false,
            )
            .map(|()| Some((plan.offset, buf)))
        }
    };
    match result {
        Ok(read) => completion.add(plan.command.logical_len, read),
        Err(status) => {
            // Unreachable without stop_on_recovery; keep the waiter moving.
            error!("chunk {} failed: {}", plan.command.chunk_index, status);
            completion.add(plan.command.logical_len, None);
        }
    }
}

/// Fixed set of threads executing chunk jobs for one transfer direction.
pub(crate) struct WorkerPool {
    name: String,
    sender: Sender<Job>,
    handles: Vec<JoinHandle<()>>,
    dispatched: AtomicUsize,
}

impl WorkerPool {
    pub(crate) fn spawn(
        name: &str,
        threads: usize,
        device: Arc<dyn Device>,
        retry: ChunkRetry,
    ) -> Result<Self> {
        let (sender, receiver): (Sender<Job>, Receiver<Job>) = bounded(WORKER_QUEUE_DEPTH);
        let mut pool = Self {
            name: name.to_string(),
            sender,
            handles: Vec::with_capacity(threads),
            dispatched: AtomicUsize::new(0),
        };
        for i in 0..threads {
            let receiver = receiver.clone();
            let device = device.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        match job {
                            Job::Chunk(job) => run_job(device.as_ref(), job, retry),
                            Job::Shutdown => break,
                        }
                    }
                })
                .map_err(|e| XcoderError::failure(format!("spawn {name} worker: {e}")))?;
            pool.handles.push(handle);
        }
        debug!("{} pool started with {} workers", name, threads);
        Ok(pool)
    }

    fn enqueue(&self, mut job: Job) {
        loop {
            match self.sender.try_send(job) {
                Ok(()) => break,
                Err(TrySendError::Full(back)) => {
                    job = back;
                    thread::sleep(Duration::from_micros(100));
                }
                Err(TrySendError::Disconnected(_)) => {
                    error!("{} pool is gone, dropping job", self.name);
                    break;
                }
            }
        }
    }

    fn dispatch(&self, job: ChunkJob) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        self.enqueue(Job::Chunk(job));
    }

    /// Chunk jobs handed to the workers so far.
    pub(crate) fn dispatched(&self) -> usize {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Stop every worker and wait for it to exit.
    pub(crate) fn shutdown(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        for _ in 0..self.handles.len() {
            self.enqueue(Job::Shutdown);
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("{} worker panicked", self.name);
            }
        }
        debug!("{} pool stopped", self.name);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Moves whole payloads through a device, chunk by chunk.
pub(crate) struct TransferEngine {
    device: Arc<dyn Device>,
    pool: Option<WorkerPool>,
    retry: ChunkRetry,
    max_io: usize,
}

impl TransferEngine {
    /// Create an engine; `workers == 0` transfers every chunk on the caller.
    pub(crate) fn new(
        name: &str,
        device: Arc<dyn Device>,
        workers: usize,
        policy: &RetryPolicy,
    ) -> Result<Self> {
        let reported = device.max_io_size();
        let max_io = usable_io_size(reported)?;
        if max_io != reported {
            warn!(
                "{}: device max I/O {} rounded down to {} bytes",
                name, reported, max_io
            );
        }
        let retry = ChunkRetry::from(policy);
        let pool = if workers > 0 {
            Some(WorkerPool::spawn(name, workers, device.clone(), retry)?)
        } else {
            None
        };
        Ok(Self {
            device,
            pool,
            retry,
            max_io,
        })
    }

    /// Chunk jobs handed to worker threads so far.
    pub(crate) fn dispatched(&self) -> usize {
        self.pool.as_ref().map_or(0, WorkerPool::dispatched)
    }

    pub(crate) fn shutdown(&mut self) {
        if let Some(pool) = self.pool.as_mut() {
            pool.shutdown();
        }
        self.pool = None;
    }

    /// Device-facing bytes of one chunk, zero padded to its aligned length.
    pub(crate) fn chunk_bytes(data: &Bytes, plan: &ChunkPlan) -> Bytes {
        let end = plan.offset + plan.device_len;
        if data.len() >= end {
            return data.slice(plan.offset..end);
        }
        let mut padded = vec![0u8; plan.device_len];
        let available = data.len().saturating_sub(plan.offset).min(plan.device_len);
        padded[..available].copy_from_slice(&data[plan.offset..plan.offset + available]);
        Bytes::from(padded)
    }

    fn to_nvme_error(status: NvmeStatus, what: &str) -> XcoderError {
        match status {
            NvmeStatus::VpuRecovery => XcoderError::VpuRecovery,
            other => XcoderError::nvme(format!("{what}: {other}")),
        }
    }

    /// Write the first `total` bytes of `data`. Returns `total`.
    pub(crate) fn write(&self, addr: SessionAddress, data: &Bytes, total: usize) -> Result<usize> {
        let plans = plan_chunks(total, self.max_io);
        let Some((last, rest)) = plans.split_last() else {
            return Ok(0);
        };

        let last_data = Self::chunk_bytes(data, last);
        issue_with_retry(
            || self.device.write_chunk(addr, &last.command, &last_data),
            self.retry,
            addr,
            &last.command,
            true,
        )
        .map_err(|status| Self::to_nvme_error(status, "write last chunk"))?;

        if rest.is_empty() {
            return Ok(total);
        }
        match &self.pool {
            Some(pool) => {
                let completion = Arc::new(Completion::default());
                completion.add(last.command.logical_len, None);
                for plan in rest {
                    pool.dispatch(ChunkJob {
                        addr,
                        plan: *plan,
                        payload: Payload::Write(Self::chunk_bytes(data, plan)),
                        completion: completion.clone(),
                    });
                }
                completion.wait_for(total);
            }
            None => {
                for plan in rest {
                    let chunk = Self::chunk_bytes(data, plan);
                    issue_with_retry(
                        || self.device.write_chunk(addr, &plan.command, &chunk),
                        self.retry,
                        addr,
                        &plan.command,
                        false,
                    )
                    .map_err(|status| Self::to_nvme_error(status, "write chunk"))?;
                }
            }
        }
        trace!("session {} wrote {} bytes in {} chunks", addr.session_id, total, plans.len());
        Ok(total)
    }

    /// Read `total` bytes into `out`, which must hold `total` rounded up to
    /// the page alignment. Returns `total`.
    pub(crate) fn read(&self, addr: SessionAddress, out: &mut [u8], total: usize) -> Result<usize> {
        let plans = plan_chunks(total, self.max_io);
        let Some((last, rest)) = plans.split_last() else {
            return Ok(0);
        };
        let needed = last.offset + last.device_len;
        if out.len() < needed {
            return Err(XcoderError::invalid_param(format!(
                "read buffer of {} bytes, need {needed}",
                out.len()
            )));
        }

        let last_buf = &mut out[last.offset..needed];
        issue_with_retry(
            || self.device.read_chunk(addr, &last.command, last_buf),
            self.retry,
            addr,
            &last.command,
            true,
        )
        .map_err(|status| Self::to_nvme_error(status, "read last chunk"))?;

        if rest.is_empty() {
            return Ok(total);
        }
        match &self.pool {
            Some(pool) => {
                let completion = Arc::new(Completion::default());
                completion.add(last.command.logical_len, None);
                for plan in rest {
                    pool.dispatch(ChunkJob {
                        addr,
                        plan: *plan,
                        payload: Payload::Read,
                        completion: completion.clone(),
                    });
                }
                for (offset, buf) in completion.wait_for(total) {
                    let end = (offset + buf.len()).min(out.len());
                    out[offset..end].copy_from_slice(&buf[..end - offset]);
                }
            }
            None => {
                for plan in rest {
                    let buf = &mut out[plan.offset..plan.offset + plan.device_len];
                    issue_with_retry(
                        || self.device.read_chunk(addr, &plan.command, buf),
                        self.retry,
                        addr,
                        &plan.command,
                        false,
                    )
                    .map_err(|status| Self::to_nvme_error(status, "read chunk"))?;
                }
            }
        }
        trace!("session {} read {} bytes in {} chunks", addr.session_id, total, plans.len());
        Ok(total)
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::OpenRequest;
    use crate::sim::{ChunkDirection, SimulatedDevice};
    use crate::types::{CodecFormat, DeviceType};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const IO: usize = 8192;

    fn open(sim: &SimulatedDevice) -> SessionAddress {
        let request = OpenRequest {
            codec: CodecFormat::H264,
            width: 64,
            height: 64,
            bit_depth: 8,
            model_load: 0,
            low_delay: false,
        };
        let session_id = sim
            .open_session(DeviceType::Scaler, 0, &request)
            .unwrap();
        SessionAddress {
            device_type: DeviceType::Scaler,
            hw_id: 0,
            session_id,
        }
    }

    #[test]
    fn test_plan_chunks() {
        let plans = plan_chunks(IO * 2 + IO / 2, IO);
        assert_eq!(plans.len(), 3);
        assert_eq!(plans[0].command.chunk_index, 0);
        assert_eq!(plans[1].command.chunk_index, 2);
        assert_eq!(plans[2].command.logical_len, IO / 2);
        assert!(plans[2].command.last);
        assert!(!plans[0].command.last);

        let plans = plan_chunks(1000, IO);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].command.logical_len, 1000);
        assert_eq!(plans[0].device_len, 1024);

        assert!(plan_chunks(0, IO).is_empty());
    }

    #[test]
    fn test_plan_covers_every_byte() {
        let mut rng = StdRng::seed_from_u64(0x5EED);
        for _ in 0..200 {
            let total = rng.random_range(1..=IO * 5);
            let plans = plan_chunks(total, IO);
            assert_eq!(plans.len(), total.div_ceil(IO));
            let sum: usize = plans.iter().map(|p| p.command.logical_len).sum();
            assert_eq!(sum, total);
            let mut expected_offset = 0;
            for plan in &plans {
                assert_eq!(plan.offset, expected_offset);
                assert_eq!(plan.device_len % 512, 0);
                assert!(plan.device_len >= plan.command.logical_len);
                expected_offset += plan.command.logical_len;
            }
        }
    }

    #[test]
    fn test_write_round_trip_random_sizes() {
        let sim = Arc::new(SimulatedDevice::new(IO));
        let addr = open(&sim);
        let engine = TransferEngine::new("test-wr", sim.clone(), 3, &RetryPolicy::fast()).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let total = rng.random_range(1..=IO * 4);
            let data: Vec<u8> = (0..total).map(|_| rng.random()).collect();
            let written = engine.write(addr, &Bytes::from(data.clone()), total).unwrap();
            assert_eq!(written, total);
            assert_eq!(sim.take_written(addr.session_id), Some(data));
        }
    }

    #[test]
    fn test_one_chunk_skips_workers() {
        let sim = Arc::new(SimulatedDevice::new(IO));
        let addr = open(&sim);
        let engine = TransferEngine::new("test-one", sim.clone(), 2, &RetryPolicy::fast()).unwrap();
        for total in [1, 511, 512, IO - 1, IO] {
            engine
                .write(addr, &Bytes::from(vec![1u8; total]), total)
                .unwrap();
        }
        assert_eq!(engine.dispatched(), 0);
        assert_eq!(sim.chunk_log(ChunkDirection::Write).len(), 5);
    }

    #[test]
    fn test_last_chunk_goes_first() {
        let sim = Arc::new(SimulatedDevice::new(IO));
        let addr = open(&sim);
        let engine = TransferEngine::new("test-order", sim.clone(), 2, &RetryPolicy::fast()).unwrap();
        let total = IO * 2 + IO / 2;
        engine
            .write(addr, &Bytes::from(vec![3u8; total]), total)
            .unwrap();

        let log = sim.chunk_log(ChunkDirection::Write);
        assert_eq!(log.len(), 3);
        assert!(log[0].command.last);
        assert_eq!(log[0].command.logical_len, IO / 2);
        assert_eq!(log[0].device_len, IO / 2);
        assert_eq!(engine.dispatched(), 2);
    }

    #[test]
    fn test_direct_io_without_workers() {
        let sim = Arc::new(SimulatedDevice::new(IO));
        let addr = open(&sim);
        let engine = TransferEngine::new("test-direct", sim.clone(), 0, &RetryPolicy::fast()).unwrap();
        let total = IO * 3 + 100;
        let data: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
        engine.write(addr, &Bytes::from(data.clone()), total).unwrap();
        assert_eq!(sim.take_written(addr.session_id), Some(data));

        let log = sim.chunk_log(ChunkDirection::Write);
        assert!(log[0].command.last);
        assert_eq!(log[0].device_len, 512);
        assert_eq!(engine.dispatched(), 0);
    }

    #[test]
    fn test_refused_chunk_is_resent() {
        let sim = Arc::new(SimulatedDevice::new(IO));
        let addr = open(&sim);
        sim.refuse_write_chunks(3, NvmeStatus::RequestInProgress);
        let engine = TransferEngine::new("test-retry", sim.clone(), 0, &RetryPolicy::fast()).unwrap();
        let data = vec![9u8; 100];
        engine.write(addr, &Bytes::from(data.clone()), 100).unwrap();
        assert_eq!(sim.take_written(addr.session_id), Some(data));
    }

    #[test]
    fn test_recovery_on_last_chunk() {
        let sim = Arc::new(SimulatedDevice::new(IO));
        let addr = open(&sim);
        sim.refuse_write_chunks(1, NvmeStatus::VpuRecovery);
        let engine = TransferEngine::new("test-rec", sim.clone(), 0, &RetryPolicy::fast()).unwrap();
        let err = engine
            .write(addr, &Bytes::from(vec![0u8; 10]), 10)
            .unwrap_err();
        assert!(matches!(err, XcoderError::VpuRecovery));
    }

    #[test]
    fn test_read_round_trip() {
        let sim = Arc::new(SimulatedDevice::new(IO));
        let addr = open(&sim);
        let total = IO * 2 + 1000;
        let data: Vec<u8> = (0..total).map(|i| (i % 13) as u8).collect();
        sim.push_output(addr.session_id, data.clone());

        let engine = TransferEngine::new("test-rd", sim.clone(), 2, &RetryPolicy::fast()).unwrap();
        let mut out = vec![0u8; align_to_page(total)];
        assert_eq!(engine.read(addr, &mut out, total).unwrap(), total);
        assert_eq!(&out[..total], &data[..]);
        assert_eq!(engine.dispatched(), 2);

        let log = sim.chunk_log(ChunkDirection::Read);
        assert!(log[0].command.last);
    }

    #[test]
    fn test_read_rejects_small_buffer() {
        let sim = Arc::new(SimulatedDevice::new(IO));
        let addr = open(&sim);
        let engine = TransferEngine::new("test-small", sim, 0, &RetryPolicy::fast()).unwrap();
        let mut out = vec![0u8; 100];
        assert!(engine.read(addr, &mut out, 100).is_err());
    }

    /// Simulated device reporting a transfer limit off the chunk grid.
    struct OddIoDevice {
        inner: SimulatedDevice,
        max_io: usize,
    }

    impl Device for OddIoDevice {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn max_io_size(&self) -> usize {
            self.max_io
        }

        fn instances(&self, device_type: DeviceType) -> CommandResult<Vec<crate::device::InstanceLoad>> {
            self.inner.instances(device_type)
        }

        fn open_session(
            &self,
            device_type: DeviceType,
            hw_id: u32,
            request: &OpenRequest,
        ) -> CommandResult<u32> {
            self.inner.open_session(device_type, hw_id, request)
        }

        fn close_session(&self, addr: SessionAddress) -> CommandResult<()> {
            self.inner.close_session(addr)
        }

        fn configure(
            &self,
            addr: SessionAddress,
            command: &crate::device::ConfigCommand,
        ) -> CommandResult<()> {
            self.inner.configure(addr, command)
        }

        fn query_status(&self, addr: SessionAddress) -> CommandResult<crate::device::RawStatus> {
            self.inner.query_status(addr)
        }

        fn query_stream_info(
            &self,
            addr: SessionAddress,
        ) -> CommandResult<crate::device::StreamInfo> {
            self.inner.query_stream_info(addr)
        }

        fn write_chunk(
            &self,
            addr: SessionAddress,
            chunk: &ChunkCommand,
            data: &[u8],
        ) -> CommandResult<()> {
            self.inner.write_chunk(addr, chunk, data)
        }

        fn read_chunk(
            &self,
            addr: SessionAddress,
            chunk: &ChunkCommand,
            buf: &mut [u8],
        ) -> CommandResult<()> {
            self.inner.read_chunk(addr, chunk, buf)
        }

        fn keep_alive(&self, addr: SessionAddress) -> CommandResult<()> {
            self.inner.keep_alive(addr)
        }
    }

    fn odd_io(max_io: usize) -> Arc<OddIoDevice> {
        Arc::new(OddIoDevice {
            inner: SimulatedDevice::new(4 * IO),
            max_io,
        })
    }

    #[test]
    fn test_odd_max_io_rounded_to_chunk_units() {
        let device = odd_io(10_000);
        let addr = open(&device.inner);
        let engine = TransferEngine::new("test-odd", device.clone(), 2, &RetryPolicy::fast()).unwrap();
        let total = 25_000;
        let data: Vec<u8> = (0..total).map(|i| (i % 199) as u8).collect();
        engine.write(addr, &Bytes::from(data.clone()), total).unwrap();
        assert_eq!(device.inner.take_written(addr.session_id), Some(data.clone()));

        let log = device.inner.chunk_log(ChunkDirection::Write);
        assert_eq!(log.len(), 4);
        for record in log.iter().filter(|r| !r.command.last) {
            assert_eq!(record.command.logical_len, IO);
            assert_eq!(record.device_len, IO);
        }

        device.inner.push_output(addr.session_id, data.clone());
        let mut out = vec![0u8; align_to_page(total)];
        engine.read(addr, &mut out, total).unwrap();
        assert_eq!(&out[..total], &data[..]);
    }

    #[test]
    fn test_max_io_below_chunk_unit_rejected() {
        let device = odd_io(1000);
        assert!(matches!(
            TransferEngine::new("test-tiny", device, 0, &RetryPolicy::fast()),
            Err(XcoderError::InvalidParam(_))
        ));
        assert_eq!(usable_io_size(FRAME_CHUNK_INDEX_SIZE * 3 + 1).unwrap(), FRAME_CHUNK_INDEX_SIZE * 3);
    }

    #[test]
    fn test_shutdown_twice() {
        let sim = Arc::new(SimulatedDevice::new(IO));
        let mut engine = TransferEngine::new("test-stop", sim, 4, &RetryPolicy::fast()).unwrap();
        engine.shutdown();
        engine.shutdown();
        assert_eq!(engine.dispatched(), 0);
    }
}
