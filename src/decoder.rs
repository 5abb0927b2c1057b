//! Decoder sessions: compressed packets in, raw frames out.
//!
//! The write side sends each packet in sequential chunks, resuming a packet
//! the device stopped accepting halfway through. The read side waits for a
//! whole frame, sizes the frame pool from the stream resolution the device
//! negotiated, and matches every frame to the packet it came from through
//! the byte offset in its metadata.

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::backend::{ReadOutcome, SessionBackend};
use crate::device::{ConfigCommand, Device};
use crate::error::{NvmeStatus, XcoderError};
use crate::frame::{DecoderMetadata, Frame, Packet, PlaneLayout, DECODER_METADATA_SIZE};
use crate::pool::FramePool;
use crate::session::Session;
use crate::timestamp::{
    OffsetFifo, PtsCorrection, TimestampQueue, CLEANUP_INTERVAL, FRAME_OFFSET_DIFF_THRESHOLD,
    NOPTS_VALUE, STALE_ENTRY_AGE,
};
use crate::transfer::{plan_chunks, usable_io_size, TransferEngine};
use crate::types::{align_to_page, DeviceType, Opcode, SessionConfig};
use crate::Result;

/// State shared by the write and read directions.
struct Shared {
    /// Set when a write gave up waiting for space.
    write_buffer_full: bool,
    required_buf_size: usize,
    ready_to_close: bool,
    pkt_num: u64,
    frame_num: u64,
    low_delay: bool,
    fifo: OffsetFifo,
    dts_queue: TimestampQueue,
}

impl Shared {
    fn new(low_delay: bool) -> Self {
        Self {
            write_buffer_full: false,
            required_buf_size: 0,
            ready_to_close: false,
            pkt_num: 0,
            frame_num: 0,
            low_delay,
            fifo: OffsetFifo::new(),
            dts_queue: TimestampQueue::new(),
        }
    }
}

#[derive(Default)]
struct WriteState {
    /// Bytes of the current packet the device already holds.
    sent_size: usize,
}

struct ReadState {
    engine: Option<TransferEngine>,
    pool: Option<FramePool>,
    /// Transfer layout of the current sequence; `None` until the first frame.
    active: Option<PlaneLayout>,
    last_pts: i64,
    last_dts: i64,
    pts_correction: PtsCorrection,
    seq_change_count: u32,
    codec_total_ticks: u64,
    eos_delivered: bool,
}

impl Default for ReadState {
    fn default() -> Self {
        Self {
            engine: None,
            pool: None,
            active: None,
            last_pts: NOPTS_VALUE,
            last_dts: NOPTS_VALUE,
            pts_correction: PtsCorrection::new(),
            seq_change_count: 0,
            codec_total_ticks: 0,
            eos_delivered: false,
        }
    }
}

/// What one pass over the device produced.
enum Fetched {
    Frame(Frame),
    EndOfStream,
    NoData,
    /// The device switched sequences; the next frame has a new size.
    SequenceChange,
    /// Available data did not match the active layout.
    SizeMismatch,
}

/// A decoder session.
pub struct Decoder {
    session: Session,
    shared: Mutex<Shared>,
    writer: Mutex<WriteState>,
    reader: Mutex<ReadState>,
}

impl Decoder {
    #[must_use]
    pub fn new(device: Arc<dyn Device>, config: SessionConfig) -> Self {
        let low_delay = config.low_delay_ms > 0;
        Self {
            session: Session::new(device, DeviceType::Decoder, config),
            shared: Mutex::new(Shared::new(low_delay)),
            writer: Mutex::new(WriteState::default()),
            reader: Mutex::new(ReadState::default()),
        }
    }

    /// Frames returned so far.
    #[must_use]
    pub fn frame_num(&self) -> u64 {
        self.shared.lock().frame_num
    }

    /// Packets fully sent so far.
    #[must_use]
    pub fn pkt_num(&self) -> u64 {
        self.shared.lock().pkt_num
    }

    /// Whether the last write gave up waiting for device space.
    #[must_use]
    pub fn is_write_buffer_full(&self) -> bool {
        self.shared.lock().write_buffer_full
    }

    /// Whether low-delay mode is still in effect.
    #[must_use]
    pub fn low_delay(&self) -> bool {
        self.shared.lock().low_delay
    }

    /// Resolution changes seen so far.
    #[must_use]
    pub fn seq_change_count(&self) -> u32 {
        self.reader.lock().seq_change_count
    }

    /// Device cycles spent on the frames returned so far.
    #[must_use]
    pub fn codec_total_ticks(&self) -> u64 {
        self.reader.lock().codec_total_ticks
    }

    fn check_open(&self) -> Result<()> {
        if self.session.is_open() {
            Ok(())
        } else {
            Err(XcoderError::invalid_session("decoder session is not open"))
        }
    }

    fn backpressure(&self, size: usize) -> usize {
        let mut shared = self.shared.lock();
        shared.write_buffer_full = true;
        shared.required_buf_size = size;
        0
    }

    /// Wait until the device can take `size` bytes. `false` means it never did.
    fn wait_for_space(&self, size: usize) -> Result<bool> {
        let retry = &self.session.config().retry;
        let mut polls = 0;
        loop {
            let info = self.session.check_status(Opcode::Write, None)?;
            polls += 1;
            if info.inst_err_no == 0 && info.wr_buf_avail as usize >= size {
                trace!(
                    "decoder session {}: {} bytes free for {} after {} polls",
                    self.session.session_id(),
                    info.wr_buf_avail,
                    size,
                    polls
                );
                return Ok(true);
            }
            if polls >= retry.decoder_write_query_retries {
                return Ok(false);
            }
            thread::sleep(retry.poll_interval_short);
        }
    }

    /// Send the chunks of `packet` from `sent_size` on. Returns the offset
    /// to resume from if the device kept refusing a chunk.
    fn send_chunks(&self, packet: &Packet, sent_size: usize) -> Result<Option<usize>> {
        let retry = &self.session.config().retry;
        let device = self.session.device();
        let addr = self.session.addr();
        let plans = plan_chunks(packet.len(), usable_io_size(self.session.max_io_size())?);
        for plan in plans.iter().filter(|p| p.offset >= sent_size) {
            let chunk = TransferEngine::chunk_bytes(&packet.data, plan);
            let mut sends = 0;
            loop {
                match device.write_chunk(addr, &plan.command, &chunk) {
                    Ok(()) => break,
                    Err(NvmeStatus::VpuRecovery) => return Err(XcoderError::VpuRecovery),
                    Err(status) => {
                        self.session.check_status(Opcode::Write, Some(status))?;
                        sends += 1;
                        if sends >= retry.max_tx_retries {
                            warn!(
                                "decoder session {}: chunk at {} refused {} times ({})",
                                addr.session_id, plan.offset, sends, status
                            );
                            return Ok(Some(plan.offset));
                        }
                        thread::sleep(retry.poll_interval_short);
                    }
                }
            }
        }
        Ok(None)
    }

    fn write_packet(&self, packet: &Packet) -> Result<usize> {
        self.check_open()?;
        let mut ws = self.writer.lock();
        let size = packet.len();
        // A resumed packet only needs room for what the device lacks.
        let remaining = size.saturating_sub(ws.sent_size);

        if !self.wait_for_space(remaining)? {
            warn!(
                "decoder session {}: no room for {} of {} packet bytes",
                self.session.session_id(),
                remaining,
                size
            );
            return Ok(self.backpressure(remaining));
        }

        if packet.start_of_stream && ws.sent_size == 0 {
            self.session.configure(&ConfigCommand::StartOfStream)?;
        }

        if size > 0 {
            if let Some(resume_at) = self.send_chunks(packet, ws.sent_size)? {
                ws.sent_size = resume_at;
                return Ok(self.backpressure(size - resume_at));
            }
            ws.sent_size = 0;
        }

        {
            let mut shared = self.shared.lock();
            shared.write_buffer_full = false;
            shared.required_buf_size = 0;
            if size > 0 {
                shared
                    .fifo
                    .record(size, packet.pts, packet.custom_sei.clone(), packet.no_slice);
                shared.dts_queue.push(0, packet.dts);
                shared.pkt_num += 1;
            }
        }

        if packet.end_of_stream {
            self.session.configure(&ConfigCommand::EndOfStream)?;
            self.shared.lock().ready_to_close = true;
            info!(
                "decoder session {}: end of stream sent",
                self.session.session_id()
            );
        }
        Ok(size)
    }

    /// Make the active layout match the stream the device is producing.
    fn negotiate_layout(&self, rs: &mut ReadState) -> Result<PlaneLayout> {
        if let Some(layout) = rs.active {
            return Ok(layout);
        }
        let config = self.session.config();
        let stream = self.session.query_stream_info()?;
        let layout = PlaneLayout::decoder(
            config.codec,
            stream.transfer_frame_stride,
            stream.transfer_frame_height,
            config.bit_depth_factor(),
        );
        let buffer_size = layout.decoder_buffer_size();
        match &rs.pool {
            Some(pool) => pool.resize(buffer_size)?,
            None => rs.pool = Some(FramePool::new(buffer_size)?),
        }
        debug!(
            "decoder session {}: picture {}x{}, transfer {}x{}",
            self.session.session_id(),
            stream.picture_width,
            stream.picture_height,
            layout.width,
            layout.height
        );
        rs.active = Some(layout);
        Ok(layout)
    }

    fn read_metadata_only(&self, rs: &mut ReadState) -> Result<Fetched> {
        let engine = rs
            .engine
            .as_ref()
            .ok_or_else(|| XcoderError::invalid_session("decoder read engine is gone"))?;
        let mut buf = vec![0u8; align_to_page(DECODER_METADATA_SIZE)];
        engine.read(self.session.addr(), &mut buf, DECODER_METADATA_SIZE)?;
        let meta = DecoderMetadata::parse(&buf)?;
        rs.codec_total_ticks += u64::from(meta.frame_cycle);
        info!(
            "decoder session {}: sequence change to {}x{}",
            self.session.session_id(),
            meta.frame_width,
            meta.frame_height
        );
        Ok(Fetched::SequenceChange)
    }

    fn read_frame(&self, rs: &mut ReadState, rd_avail: usize) -> Result<Fetched> {
        let layout = self.negotiate_layout(rs)?;
        let plane_sum = layout.plane_sum();
        let total = plane_sum + DECODER_METADATA_SIZE;
        let (mut buffer, engine) = match (&rs.pool, &rs.engine) {
            (Some(pool), Some(engine)) => {
                if rd_avail < total || rd_avail > pool.buffer_size() {
                    warn!(
                        "decoder session {}: {} bytes available, frame needs {} (buffer {})",
                        self.session.session_id(),
                        rd_avail,
                        total,
                        pool.buffer_size()
                    );
                    return Ok(Fetched::SizeMismatch);
                }
                (pool.acquire()?, engine)
            }
            _ => return Err(XcoderError::invalid_session("decoder read state is gone")),
        };
        engine.read(self.session.addr(), &mut buffer, rd_avail)?;

        let meta = DecoderMetadata::parse(&buffer[plane_sum..])?;
        rs.codec_total_ticks += u64::from(meta.frame_cycle);

        let config = self.session.config();
        let frame_layout = PlaneLayout::decoder(
            config.codec,
            u32::from(meta.frame_width),
            u32::from(meta.frame_height),
            config.bit_depth_factor(),
        );
        let seen_frames = self.shared.lock().frame_num;
        if seen_frames > 0 && (frame_layout.width, frame_layout.height) != (layout.width, layout.height)
        {
            warn!(
                "decoder session {}: frame {}x{} does not fit active {}x{}",
                self.session.session_id(),
                frame_layout.width,
                frame_layout.height,
                layout.width,
                layout.height
            );
            return Ok(Fetched::SequenceChange);
        }

        let mut frame = Frame::from_buffer(buffer, layout.data_len());
        frame.width = u32::from(meta.frame_width);
        frame.height = u32::from(meta.frame_height);
        frame.bit_depth = match meta.bit_depth {
            0 => config.bit_depth,
            depth => depth as u8,
        };
        frame.crop = meta.crop;
        frame.pic_type = meta.frame_type;
        if meta.sei_size > 0 {
            frame.set_device_sei(
                meta.sei_header,
                meta.sei_number,
                total,
                usize::from(meta.sei_size),
            );
        }

        let mut shared = self.shared.lock();
        let dts = shared
            .dts_queue
            .pop_threshold(0, FRAME_OFFSET_DIFF_THRESHOLD)
            .unwrap_or(NOPTS_VALUE);
        let pts = match shared.fifo.lookup(meta.frame_offset) {
            Some(slot) => {
                frame.sei = shared.fifo.take_sei(slot);
                shared.fifo.pts(slot)
            }
            None if rs.last_pts != NOPTS_VALUE
                && rs.last_dts != NOPTS_VALUE
                && dts != NOPTS_VALUE =>
            {
                error!(
                    "decoder session {}: no packet covers offset {}, extrapolating",
                    self.session.session_id(),
                    meta.frame_offset
                );
                rs.last_pts + (dts - rs.last_dts)
            }
            None => {
                error!(
                    "decoder session {}: no packet covers offset {}",
                    self.session.session_id(),
                    meta.frame_offset
                );
                NOPTS_VALUE
            }
        };
        frame.pts = rs.pts_correction.guess(pts, dts, rs.last_pts);
        frame.dts = dts;
        rs.last_pts = frame.pts;
        rs.last_dts = dts;

        shared.frame_num += 1;
        if shared.frame_num % CLEANUP_INTERVAL == 0 {
            shared.dts_queue.remove_older_than(STALE_ENTRY_AGE);
        }
        trace!(
            "decoder session {}: frame {} offset {} pts {} dts {}",
            self.session.session_id(),
            shared.frame_num,
            meta.frame_offset,
            frame.pts,
            frame.dts
        );
        Ok(Fetched::Frame(frame))
    }

    fn fetch(&self, rs: &mut ReadState) -> Result<Fetched> {
        let config = self.session.config();
        let retry = &config.retry;
        let low_delay_polls = config.low_delay_ms * 1000 / 200 + 1;
        let mut polls = 0;
        loop {
            let info = self.session.check_status(Opcode::Read, None)?;
            polls += 1;
            if info.inst_err_no != 0 {
                if polls >= retry.decoder_read_query_retries {
                    return Ok(Fetched::NoData);
                }
                thread::sleep(retry.poll_interval_short);
                continue;
            }

            let rd_avail = info.rd_buf_avail as usize;
            if rd_avail == DECODER_METADATA_SIZE {
                return self.read_metadata_only(rs);
            }
            if rd_avail > 0 {
                rs.eos_delivered = false;
                return self.read_frame(rs, rd_avail);
            }

            let ready_to_close = self.shared.lock().ready_to_close;
            if ready_to_close {
                if rs.eos_delivered {
                    return Ok(Fetched::NoData);
                }
                let stream = self.session.query_stream_info()?;
                if stream.is_flushed || polls >= retry.decoder_eos_query_retries {
                    if !stream.is_flushed {
                        warn!(
                            "decoder session {}: end of stream assumed after {} polls",
                            self.session.session_id(),
                            polls
                        );
                    }
                    rs.eos_delivered = true;
                    return Ok(Fetched::EndOfStream);
                }
                thread::sleep(retry.poll_interval_long);
                continue;
            }

            let mut shared = self.shared.lock();
            let awaiting = shared.low_delay && shared.frame_num < shared.pkt_num;
            let max_polls = if shared.low_delay {
                low_delay_polls
            } else {
                retry.decoder_read_query_retries
            };
            if (shared.write_buffer_full || awaiting) && polls < max_polls {
                if shared.write_buffer_full && info.wr_buf_avail as usize > shared.required_buf_size
                {
                    debug!(
                        "decoder session {}: {} bytes free, write may resume",
                        self.session.session_id(),
                        info.wr_buf_avail
                    );
                    shared.write_buffer_full = false;
                    shared.required_buf_size = 0;
                    return Ok(Fetched::NoData);
                }
                drop(shared);
                thread::sleep(retry.poll_interval_long);
                continue;
            }
            if awaiting {
                warn!(
                    "decoder session {}: no frame within the low-delay window, leaving low-delay mode",
                    self.session.session_id()
                );
                shared.low_delay = false;
            }
            return Ok(Fetched::NoData);
        }
    }

    fn read_output(&self) -> Result<ReadOutcome<Frame>> {
        self.check_open()?;
        let mut rs = self.reader.lock();
        let mut renegotiated = false;
        loop {
            match self.fetch(&mut rs)? {
                Fetched::Frame(frame) => return Ok(ReadOutcome::Data(frame)),
                Fetched::EndOfStream => {
                    info!(
                        "decoder session {}: end of stream after {} frames",
                        self.session.session_id(),
                        self.shared.lock().frame_num
                    );
                    return Ok(ReadOutcome::EndOfStream);
                }
                Fetched::NoData => return Ok(ReadOutcome::NoData),
                Fetched::SequenceChange => {
                    rs.active = None;
                    rs.seq_change_count += 1;
                }
                Fetched::SizeMismatch if !renegotiated => {
                    rs.active = None;
                    renegotiated = true;
                }
                Fetched::SizeMismatch => {
                    return Err(XcoderError::failure(
                        "decoded frame size disagrees with the stream resolution",
                    ));
                }
            }
        }
    }

    fn shutdown(&self) -> Result<()> {
        self.session.stop_keep_alive();
        {
            let mut rs = self.reader.lock();
            if let Some(mut engine) = rs.engine.take() {
                engine.shutdown();
            }
            *rs = ReadState::default();
        }
        let result = self.session.close();
        *self.writer.lock() = WriteState::default();
        *self.shared.lock() = Shared::new(self.session.config().low_delay_ms > 0);
        result
    }
}

impl SessionBackend for Decoder {
    type Input = Packet;
    type Output = Frame;

    fn session(&self) -> &Session {
        &self.session
    }

    fn open(&self) -> Result<()> {
        let bit_depth = self.session.config().bit_depth;
        if bit_depth != 8 && bit_depth != 10 {
            return Err(XcoderError::invalid_param(format!("bit depth {bit_depth}")));
        }
        self.session.open(|session| {
            let engine = TransferEngine::new(
                &format!("xcoder-dec-rd-{}", session.session_id()),
                session.device().clone(),
                session.config().worker_threads,
                &session.config().retry,
            )?;
            self.reader.lock().engine = Some(engine);
            Ok(())
        })
    }

    fn close(&self) -> Result<()> {
        self.shutdown()
    }

    fn flush(&self) -> Result<()> {
        self.session.flush()?;
        self.shared.lock().ready_to_close = true;
        Ok(())
    }

    fn write(&self, packet: &Packet) -> Result<usize> {
        self.write_packet(packet)
    }

    fn read(&self) -> Result<ReadOutcome<Frame>> {
        self.read_output()
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("decoder close on drop: {}", e);
        }
    }
}
