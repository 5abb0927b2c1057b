//! Encoder sessions: raw frames in, compressed packets out.
//!
//! Parameters are merged onto the hardware template and validated before
//! the session is opened. Each frame goes out as one payload
//! `[planes | frame metadata | reconfig | ROI map | SEI]` through the write
//! worker pool. The device answers with a parameter-set header packet
//! followed by one packet per frame; packets may arrive in several parts.

use std::sync::Arc;
use std::thread;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};
use xcoder_params::{gop_preset, validate, EncoderParams, EncoderTemplate, ParamError};

use crate::backend::{ReadOutcome, SessionBackend};
use crate::device::{ConfigCommand, Device};
use crate::error::XcoderError;
use crate::frame::{EncoderFrameMetadata, Frame, Packet, PacketMetadata, PACKET_METADATA_SIZE};
use crate::session::Session;
use crate::timestamp::{
    TimestampQueue, CLEANUP_INTERVAL, FRAME_OFFSET_DIFF_THRESHOLD, NOPTS_VALUE, STALE_ENTRY_AGE,
};
use crate::transfer::TransferEngine;
use crate::types::{align_to_page, DeviceType, Opcode, SessionConfig};
use crate::Result;

/// Target bitrate used when the caller brings no parameters.
pub const DEFAULT_BITRATE: i64 = 4_000_000;

struct Shared {
    /// Set when a strict-timeout write gave up waiting for space.
    write_buffer_full: bool,
    ready_to_close: bool,
    frame_num: u64,
    /// Packets received, the header packet included.
    pkt_num: u64,
    low_delay: bool,
    dts_queue: TimestampQueue,
}

impl Shared {
    fn new(low_delay: bool) -> Self {
        Self {
            write_buffer_full: false,
            ready_to_close: false,
            frame_num: 0,
            pkt_num: 0,
            low_delay,
            dts_queue: TimestampQueue::new(),
        }
    }
}

#[derive(Default)]
struct WriteState {
    engine: Option<TransferEngine>,
}

#[derive(Default)]
struct ReadState {
    engine: Option<TransferEngine>,
    /// Header packet waiting to be prepended to the next data packet.
    header: Option<Bytes>,
    /// Parts of a packet the device has not finished yet.
    partial: BytesMut,
    codec_total_ticks: u64,
    eos_delivered: bool,
}

/// An encoder session.
pub struct Encoder {
    session: Session,
    params: EncoderParams,
    strict_timeout: bool,
    shared: Mutex<Shared>,
    writer: Mutex<WriteState>,
    reader: Mutex<ReadState>,
}

fn to_i32(value: u32, what: &str) -> Result<i32> {
    i32::try_from(value).map_err(|_| XcoderError::invalid_param(format!("{what} {value}")))
}

impl Encoder {
    /// Create an encoder with default parameters for the configured stream.
    pub fn new(device: Arc<dyn Device>, config: SessionConfig) -> Result<Self> {
        let (num, den) = config.framerate;
        let mut params = EncoderParams::init_default(
            to_i32(num, "framerate")?,
            to_i32(den, "framerate")?,
            DEFAULT_BITRATE,
            to_i32(config.width, "width")?,
            to_i32(config.height, "height")?,
        )?;
        if config.low_delay {
            params.low_delay_mode = 1;
            params.gop_preset_index = gop_preset::IPP;
        }
        params.strict_timeout_mode = i32::from(config.strict_timeout);
        Ok(Self::with_params(device, config, params))
    }

    /// Create an encoder with caller-built parameters. Low-delay and strict
    /// timeout are on when either the parameters or the config ask for them.
    #[must_use]
    pub fn with_params(device: Arc<dyn Device>, config: SessionConfig, params: EncoderParams) -> Self {
        let low_delay = config.low_delay || params.low_delay_mode != 0;
        let strict_timeout = config.strict_timeout || params.strict_timeout_mode != 0;
        Self {
            session: Session::new(device, DeviceType::Encoder, config),
            params,
            strict_timeout,
            shared: Mutex::new(Shared::new(low_delay)),
            writer: Mutex::new(WriteState::default()),
            reader: Mutex::new(ReadState::default()),
        }
    }

    #[must_use]
    pub fn params(&self) -> &EncoderParams {
        &self.params
    }

    /// Frames sent so far.
    #[must_use]
    pub fn frame_num(&self) -> u64 {
        self.shared.lock().frame_num
    }

    /// Packets received so far, the header packet included.
    #[must_use]
    pub fn pkt_num(&self) -> u64 {
        self.shared.lock().pkt_num
    }

    #[must_use]
    pub fn is_write_buffer_full(&self) -> bool {
        self.shared.lock().write_buffer_full
    }

    /// Device cycles spent on the packets received so far.
    #[must_use]
    pub fn codec_total_ticks(&self) -> u64 {
        self.reader.lock().codec_total_ticks
    }

    fn check_open(&self) -> Result<()> {
        if self.session.is_open() {
            Ok(())
        } else {
            Err(XcoderError::invalid_session("encoder session is not open"))
        }
    }

    /// Poll until the device takes input, right after the parameters went out.
    fn wait_until_ready(session: &Session) -> Result<()> {
        let retry = &session.config().retry;
        for _ in 0..retry.encoder_open_query_retries {
            let info = session.check_status(Opcode::Query, None)?;
            if info.inst_err_no == 0 && info.wr_buf_avail > 0 {
                return Ok(());
            }
            thread::sleep(retry.encoder_open_query_interval);
        }
        Err(XcoderError::ResourceUnavailable(format!(
            "encoder session {} never reported write space",
            session.session_id()
        )))
    }

    /// Picture size implied by the luma plane length.
    fn active_size(&self, frame: &Frame) -> Result<(u32, u32)> {
        let config = self.session.config();
        let factor = config.bit_depth_factor();
        let luma = frame.data_len()[0];
        let row = config.width as usize * factor;
        let column = config.height as usize * factor;
        if luma > 0 && row > 0 && luma % row == 0 {
            Ok((config.width, (luma / row) as u32))
        } else if luma > 0 && column > 0 && luma % column == 0 {
            Ok(((luma / column) as u32, config.height))
        } else {
            Err(ParamError::InvalidValue(format!(
                "luma plane of {} bytes fits neither width {} nor height {}",
                luma, config.width, config.height
            ))
            .into())
        }
    }

    fn frame_metadata(&self, frame: &Frame, width: u32, height: u32) -> EncoderFrameMetadata {
        let mut meta = EncoderFrameMetadata {
            crop: frame.crop,
            frame_tstamp: frame.pts as u64,
            frame_width: width as u16,
            frame_height: height as u16,
            frame_type: frame.pic_type,
            bit_depth: u16::from(frame.bit_depth),
            roi_avg_qp: frame.roi_avg_qp,
            roi_map_size: frame.roi_map.as_ref().map_or(0, |b| b.len() as u32),
            sei_data_size: frame.sei.as_ref().map_or(0, |b| b.len() as u32),
            reconfig_data_size: frame.reconfig.as_ref().map_or(0, |b| b.len() as u32),
            use_cur_src_as_long_term_pic: frame.use_cur_src_as_long_term_pic,
            use_long_term_ref: frame.use_long_term_ref,
            ..Default::default()
        };
        if (self.params.force_frame_type == 1 || frame.force_key_frame) && frame.pic_type != 0 {
            meta.force_type_enable = 1;
            meta.force_type = frame.pic_type;
        }
        if frame.force_pic_qp != 0 {
            meta.force_pic_qp_enable = 1;
            meta.force_pic_qp_i = frame.force_pic_qp;
            meta.force_pic_qp_p = frame.force_pic_qp;
            meta.force_pic_qp_b = frame.force_pic_qp;
        }
        meta
    }

    fn build_payload(&self, frame: &Frame, size: usize, width: u32, height: u32) -> Bytes {
        let mut buf = BytesMut::with_capacity(size);
        for plane in frame.planes() {
            buf.extend_from_slice(plane);
        }
        buf.extend_from_slice(&self.frame_metadata(frame, width, height).encode());
        for extra in [&frame.reconfig, &frame.roi_map, &frame.sei].into_iter().flatten() {
            buf.extend_from_slice(extra);
        }
        buf.freeze()
    }

    /// Wait until the device can take `size` bytes. `false` means it never did.
    fn wait_for_space(&self, size: usize) -> Result<bool> {
        let retry = &self.session.config().retry;
        let mut polls = 0;
        loop {
            let info = self.session.check_status(Opcode::Write, None)?;
            polls += 1;
            if info.inst_err_no == 0 && info.wr_buf_avail as usize >= size {
                return Ok(true);
            }
            if polls >= retry.encoder_write_query_retries {
                return Ok(false);
            }
            thread::sleep(retry.poll_interval_short);
        }
    }

    fn write_frame(&self, frame: &Frame) -> Result<usize> {
        self.check_open()?;
        let ws = self.writer.lock();
        let id = self.session.session_id();

        let eos_only = frame.end_of_stream && frame.plane_sum() == 0;
        let (width, height) = if eos_only {
            (0, 0)
        } else {
            self.active_size(frame)?
        };
        let size = if eos_only {
            0
        } else {
            frame.plane_sum() + frame.extra_data_len()
        };

        if !self.wait_for_space(size)? {
            warn!("encoder session {}: no room for {} byte frame", id, size);
            if self.strict_timeout {
                self.shared.lock().write_buffer_full = true;
            }
            return Ok(0);
        }

        if frame.end_of_stream {
            self.shared.lock().ready_to_close = true;
        }
        if frame.start_of_stream {
            self.session.configure(&ConfigCommand::StartOfStream)?;
        }
        if frame.end_of_stream {
            self.session.configure(&ConfigCommand::EndOfStream)?;
            info!("encoder session {}: end of stream sent", id);
            return Ok(0);
        }

        let payload = self.build_payload(frame, size, width, height);
        let dts = if frame.dts == NOPTS_VALUE {
            frame.pts
        } else {
            frame.dts
        };
        let engine = ws
            .engine
            .as_ref()
            .ok_or_else(|| XcoderError::invalid_session("encoder write engine is gone"))?;

        // The reader can see the packet before `write` returns.
        self.shared.lock().dts_queue.push(0, dts);
        if let Err(e) = engine.write(self.session.addr(), &payload, size) {
            self.shared.lock().dts_queue.pop_newest();
            return Err(e);
        }

        let mut shared = self.shared.lock();
        shared.frame_num += 1;
        trace!(
            "encoder session {}: frame {} {}x{} pts {} ({} bytes)",
            id,
            shared.frame_num,
            width,
            height,
            frame.pts,
            size
        );
        Ok(size)
    }

    fn read_packet(&self, rs: &mut ReadState) -> Result<ReadOutcome<Packet>> {
        let config = self.session.config();
        let retry = &config.retry;
        let id = self.session.session_id();
        let mut polls = 0;
        loop {
            let info = self.session.check_status(Opcode::Read, None)?;
            polls += 1;
            if info.inst_err_no != 0 {
                if polls >= retry.encoder_read_query_retries {
                    return Ok(ReadOutcome::NoData);
                }
                thread::sleep(retry.poll_interval_short);
                continue;
            }

            let rd_avail = info.rd_buf_avail as usize;
            if rd_avail == 0 {
                let shared = self.shared.lock();
                if shared.ready_to_close {
                    drop(shared);
                    if rs.eos_delivered {
                        return Ok(ReadOutcome::NoData);
                    }
                    let stream = self.session.query_stream_info()?;
                    if stream.is_flushed || polls >= retry.encoder_read_query_retries {
                        if !stream.is_flushed {
                            warn!(
                                "encoder session {}: end of stream assumed after {} polls",
                                id, polls
                            );
                        }
                        rs.eos_delivered = true;
                        return Ok(ReadOutcome::EndOfStream);
                    }
                    thread::sleep(retry.poll_interval_long);
                    continue;
                }
                if self.strict_timeout && polls > retry.encoder_read_query_retries {
                    return Err(XcoderError::ResourceUnavailable(format!(
                        "encoder session {id}: no packet after {polls} polls"
                    )));
                }
                let waiting = (shared.low_delay || shared.write_buffer_full || !rs.partial.is_empty())
                    && shared.frame_num >= shared.pkt_num;
                if waiting && (polls < retry.encoder_read_query_retries || self.strict_timeout) {
                    drop(shared);
                    thread::sleep(retry.poll_interval_long);
                    continue;
                }
                return Ok(ReadOutcome::NoData);
            }

            self.shared.lock().write_buffer_full = false;
            let engine = rs
                .engine
                .as_ref()
                .ok_or_else(|| XcoderError::invalid_session("encoder read engine is gone"))?;
            let mut buf = vec![0u8; align_to_page(rd_avail)];
            engine.read(self.session.addr(), &mut buf, rd_avail)?;
            let meta = PacketMetadata::parse(&buf)?;
            let end = (PACKET_METADATA_SIZE + meta.bs_frame_size as usize).min(rd_avail);
            let payload = buf.get(PACKET_METADATA_SIZE..end).unwrap_or(&[]);
            rs.codec_total_ticks += u64::from(meta.frame_cycle);

            if meta.end_of_packet == 0 {
                rs.partial.extend_from_slice(payload);
                trace!(
                    "encoder session {}: {} bytes of an unfinished packet",
                    id,
                    rs.partial.len()
                );
                continue;
            }

            let mut shared = self.shared.lock();
            let is_header = shared.pkt_num == 0
                && meta.frame_tstamp == 0
                && meta.avg_frame_qp == 0
                && rs.partial.is_empty();
            if is_header {
                shared.pkt_num = 1;
                let header = Bytes::copy_from_slice(payload);
                debug!("encoder session {}: {} byte header packet", id, header.len());
                if config.prepend_headers {
                    rs.header = Some(header);
                    continue;
                }
                return Ok(ReadOutcome::Data(Packet {
                    data: header,
                    pts: 0,
                    ..Default::default()
                }));
            }

            let dts = if shared.pkt_num >= 1 {
                shared
                    .dts_queue
                    .pop_threshold(0, FRAME_OFFSET_DIFF_THRESHOLD)
                    .unwrap_or(NOPTS_VALUE)
            } else {
                NOPTS_VALUE
            };
            shared.pkt_num += 1;
            if shared.pkt_num % CLEANUP_INTERVAL == 0 {
                shared.dts_queue.remove_older_than(STALE_ENTRY_AGE);
            }
            drop(shared);

            let header = rs.header.take().unwrap_or_default();
            let mut data = BytesMut::with_capacity(header.len() + rs.partial.len() + payload.len());
            data.extend_from_slice(&header);
            data.extend_from_slice(&rs.partial);
            data.extend_from_slice(payload);
            rs.partial.clear();

            let packet = Packet {
                data: data.freeze(),
                pts: meta.frame_tstamp as i64,
                dts,
                frame_type: meta.frame_type,
                avg_frame_qp: meta.avg_frame_qp,
                recycle_index: meta.recycle_index,
                ..Default::default()
            };
            trace!(
                "encoder session {}: packet {} bytes type {} pts {} dts {}",
                id,
                packet.len(),
                packet.frame_type,
                packet.pts,
                packet.dts
            );
            return Ok(ReadOutcome::Data(packet));
        }
    }

    fn read_output(&self) -> Result<ReadOutcome<Packet>> {
        self.check_open()?;
        let mut rs = self.reader.lock();
        let outcome = self.read_packet(&mut rs)?;
        if outcome.is_end_of_stream() {
            info!(
                "encoder session {}: end of stream after {} packets",
                self.session.session_id(),
                self.shared.lock().pkt_num
            );
        }
        Ok(outcome)
    }

    fn shutdown(&self) -> Result<()> {
        self.session.stop_keep_alive();
        {
            let mut ws = self.writer.lock();
            if let Some(mut engine) = ws.engine.take() {
                engine.shutdown();
            }
        }
        {
            let mut rs = self.reader.lock();
            if let Some(mut engine) = rs.engine.take() {
                engine.shutdown();
            }
            *rs = ReadState::default();
        }
        let result = self.session.close();
        let low_delay = self.session.config().low_delay || self.params.low_delay_mode != 0;
        *self.shared.lock() = Shared::new(low_delay);
        result
    }
}

impl SessionBackend for Encoder {
    type Input = Frame;
    type Output = Packet;

    fn session(&self) -> &Session {
        &self.session
    }

    fn open(&self) -> Result<()> {
        let config = self.session.config();
        if config.bit_depth != 8 && config.bit_depth != 10 {
            return Err(XcoderError::invalid_param(format!(
                "bit depth {}",
                config.bit_depth
            )));
        }
        let mut template =
            EncoderTemplate::from_params(&self.params, config.codec, i32::from(config.bit_depth));
        validate(&mut template, &self.params)?;

        self.session.open(|session| {
            session.configure(&ConfigCommand::EncoderParams(Box::new(template.clone())))?;
            Self::wait_until_ready(session)?;
            let id = session.session_id();
            let workers = session.config().worker_threads;
            let retry = &session.config().retry;
            let write = TransferEngine::new(
                &format!("xcoder-enc-wr-{id}"),
                session.device().clone(),
                workers,
                retry,
            )?;
            let read = TransferEngine::new(
                &format!("xcoder-enc-rd-{id}"),
                session.device().clone(),
                workers,
                retry,
            )?;
            self.writer.lock().engine = Some(write);
            self.reader.lock().engine = Some(read);
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

    fn write(&self, frame: &Frame) -> Result<usize> {
        self.write_frame(frame)
    }

    fn read(&self) -> Result<ReadOutcome<Packet>> {
        self.read_output()
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("encoder close on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceErrorCode;
    use crate::error::NvmeStatus;
    use crate::sim::{ChunkDirection, SimulatedDevice};
    use crate::types::{CodecFormat, RetryPolicy};
    use xcoder_params::pic_type;

    fn config(width: u32, height: u32) -> SessionConfig {
        SessionConfig::new(CodecFormat::H264, width, height)
            .keep_alive_timeout(100)
            .retry(RetryPolicy::fast())
    }

    fn open(sim: &Arc<SimulatedDevice>, config: SessionConfig) -> Encoder {
        let encoder = Encoder::new(sim.clone(), config).unwrap();
        encoder.open().unwrap();
        encoder
    }

    fn frame(pts: i64) -> Frame {
        let mut frame = Frame::new_yuv420(256, 128, 8).unwrap();
        for (i, plane) in frame.planes_mut().into_iter().enumerate() {
            plane.fill(0x10 * (i as u8 + 1));
        }
        frame.pts = pts;
        frame
    }

    fn expect_packet(encoder: &Encoder) -> Packet {
        match encoder.read().unwrap() {
            ReadOutcome::Data(packet) => packet,
            other => panic!("expected a packet, got {other:?}"),
        }
    }

    #[test]
    fn test_frame_split_into_chunks() {
        let sim = Arc::new(SimulatedDevice::new(20480));
        let encoder = open(&sim, config(256, 128));
        let id = encoder.session().session_id();
        let mut f = frame(42);
        f.sei = Some(Bytes::from(vec![0x5A; 1992]));

        assert_eq!(encoder.write(&f).unwrap(), 51200);
        let log = sim.chunk_log(ChunkDirection::Write);
        assert_eq!(log.len(), 3);
        assert!(log[0].command.last);
        assert_eq!(log[0].command.logical_len, 10240);
        assert_eq!(log[0].device_len, 10240);
        assert!(log[1..].iter().all(|r| !r.command.last && r.device_len == 20480));
        assert_eq!(encoder.writer.lock().engine.as_ref().unwrap().dispatched(), 2);

        let written = sim.take_written(id).unwrap();
        assert_eq!(written.len(), 51200);
        assert!(written[..32768].iter().all(|&b| b == 0x10));
        let meta = EncoderFrameMetadata::parse(&written[49152..]).unwrap();
        assert_eq!(meta.frame_tstamp, 42);
        assert_eq!((meta.frame_width, meta.frame_height), (256, 128));
        assert_eq!(meta.sei_data_size, 1992);
        assert!(written[49152 + 56..].iter().all(|&b| b == 0x5A));
        assert_eq!(encoder.frame_num(), 1);
    }

    #[test]
    fn test_failed_write_leaves_no_dts() {
        let sim = Arc::new(SimulatedDevice::new(65536));
        let encoder = open(&sim, config(256, 128));
        encoder.write(&frame(0)).unwrap();
        assert_eq!(encoder.shared.lock().dts_queue.len(), 1);

        sim.refuse_write_chunks(1, NvmeStatus::VpuRecovery);
        assert!(matches!(
            encoder.write(&frame(1)),
            Err(XcoderError::VpuRecovery)
        ));
        assert_eq!(encoder.shared.lock().dts_queue.len(), 1);
        assert_eq!(encoder.frame_num(), 1);
    }

    #[test]
    fn test_short_last_chunk_rounded() {
        let sim = Arc::new(SimulatedDevice::new(20480));
        let encoder = open(&sim, config(256, 128));
        let mut f = frame(0);
        f.sei = Some(Bytes::from(vec![1; 2092]));

        assert_eq!(encoder.write(&f).unwrap(), 51300);
        let last = sim.chunk_log(ChunkDirection::Write)[0];
        assert!(last.command.last);
        assert_eq!(last.command.logical_len, 10340);
        assert_eq!(last.device_len, 10752);
        assert_eq!(last.command.total_len, 51300);
    }

    #[test]
    fn test_header_prepended_to_first_packet() {
        let sim = Arc::new(SimulatedDevice::new(8192));
        let encoder = open(&sim, config(256, 128));
        for pts in [100, 200] {
            encoder.write(&frame(pts)).unwrap();
        }

        let first = expect_packet(&encoder);
        assert_eq!(first.len(), 80);
        assert_eq!(&first.data[..4], &[0, 0, 0, 1]);
        assert_eq!(first.pts, 100);
        assert_eq!(first.dts, 100);
        assert_eq!(first.frame_type, pic_type::I as u32);

        let second = expect_packet(&encoder);
        assert_eq!(second.len(), 65);
        assert_eq!(second.pts, 200);
        assert_eq!(second.frame_type, pic_type::P as u32);
        assert_eq!(encoder.pkt_num(), 3);
        assert_eq!(encoder.codec_total_ticks(), 4000);
    }

    #[test]
    fn test_header_as_own_packet() {
        let sim = Arc::new(SimulatedDevice::new(8192));
        let encoder = open(&sim, config(256, 128).prepend_headers(false));
        encoder.write(&frame(7)).unwrap();

        let header = expect_packet(&encoder);
        assert_eq!(header.len(), 16);
        assert_eq!(header.pts, 0);
        assert_eq!(encoder.pkt_num(), 1);

        let packet = expect_packet(&encoder);
        assert_eq!(packet.len(), 64);
        assert_eq!(packet.pts, 7);
        assert_eq!(packet.dts, 7);
    }

    #[test]
    fn test_split_packet_reassembled() {
        let sim = Arc::new(SimulatedDevice::new(8192));
        sim.split_packets(true);
        let encoder = open(&sim, config(256, 128));
        encoder.write(&frame(5)).unwrap();

        let packet = expect_packet(&encoder);
        assert_eq!(packet.len(), 80);
        assert_eq!(&packet.data[16..], &(0..64).map(|i| i as u8).collect::<Vec<_>>()[..]);
        assert_eq!(packet.pts, 5);
    }

    #[test]
    fn test_strict_timeout_read_fails() {
        let sim = Arc::new(SimulatedDevice::new(8192));
        let mut retry = RetryPolicy::fast();
        retry.encoder_read_query_retries = 5;
        let cfg = config(256, 128).retry(retry).low_delay(true);

        let strict = open(&sim, cfg.clone().strict_timeout(true));
        let before = sim.status_queries();
        assert!(matches!(
            strict.read(),
            Err(XcoderError::ResourceUnavailable(_))
        ));
        assert_eq!(sim.status_queries() - before, 6);

        let relaxed = open(&sim, cfg);
        let before = sim.status_queries();
        assert!(matches!(relaxed.read().unwrap(), ReadOutcome::NoData));
        assert_eq!(sim.status_queries() - before, 5);
    }

    #[test]
    fn test_strict_write_marks_buffer_full() {
        let sim = Arc::new(SimulatedDevice::new(8192));
        let mut retry = RetryPolicy::fast();
        retry.encoder_write_query_retries = 3;
        let cfg = config(256, 128).retry(retry);

        let relaxed = open(&sim, cfg.clone());
        sim.script_write_avail(relaxed.session().session_id(), [0, 0, 0]);
        assert_eq!(relaxed.write(&frame(0)).unwrap(), 0);
        assert!(!relaxed.is_write_buffer_full());

        let strict = open(&sim, cfg.strict_timeout(true));
        sim.script_write_avail(strict.session().session_id(), [0, 0, 0]);
        assert_eq!(strict.write(&frame(0)).unwrap(), 0);
        assert!(strict.is_write_buffer_full());
        assert_eq!(strict.frame_num(), 0);

        assert!(strict.write(&frame(0)).unwrap() > 0);
        expect_packet(&strict);
        assert!(!strict.is_write_buffer_full());
    }

    #[test]
    fn test_forced_type_and_qp() {
        let sim = Arc::new(SimulatedDevice::new(8192));
        let encoder = open(&sim, config(256, 128));

        encoder.write(&frame(0)).unwrap();
        let mut forced = frame(1);
        forced.pic_type = pic_type::B as u16;
        forced.force_key_frame = true;
        forced.force_pic_qp = 40;
        encoder.write(&forced).unwrap();
        let mut unforced = frame(2);
        unforced.pic_type = pic_type::B as u16;
        encoder.write(&unforced).unwrap();

        let packets: Vec<Packet> = (0..3).map(|_| expect_packet(&encoder)).collect();
        assert_eq!(packets[1].frame_type, pic_type::B as u32);
        assert_eq!(packets[1].avg_frame_qp, 40);
        assert_eq!(packets[2].frame_type, pic_type::P as u32);
        assert_eq!(packets[2].avg_frame_qp, 30);
    }

    #[test]
    fn test_end_of_stream_drain() {
        let sim = Arc::new(SimulatedDevice::new(8192));
        let encoder = open(&sim, config(256, 128));
        let id = encoder.session().session_id();
        let mut first = frame(0);
        first.start_of_stream = true;
        encoder.write(&first).unwrap();
        encoder.write(&frame(1)).unwrap();
        assert_eq!(encoder.write(&Frame::end_of_stream()).unwrap(), 0);

        let configs = sim.configs(id);
        assert!(matches!(configs[0], ConfigCommand::KeepAliveTimeout(_)));
        assert!(matches!(configs[1], ConfigCommand::EncoderParams(_)));
        assert!(configs.contains(&ConfigCommand::StartOfStream));
        assert_eq!(configs.last(), Some(&ConfigCommand::EndOfStream));

        assert_eq!(expect_packet(&encoder).pts, 0);
        assert_eq!(expect_packet(&encoder).pts, 1);
        assert!(encoder.read().unwrap().is_end_of_stream());
        assert!(matches!(encoder.read().unwrap(), ReadOutcome::NoData));
    }

    #[test]
    fn test_invalid_params_never_open() {
        let sim = Arc::new(SimulatedDevice::new(8192));
        let encoder = Encoder::new(sim.clone(), config(128, 128)).unwrap();
        let err = encoder.open().unwrap_err();
        assert!(matches!(err, XcoderError::Param(ParamError::PicWidth(_))));
        assert_eq!(sim.open_commands(), 0);
        assert!(!encoder.session().is_open());
    }

    #[test]
    fn test_open_waits_for_write_space() {
        let sim = Arc::new(SimulatedDevice::new(8192));
        sim.set_write_capacity(0);
        let mut retry = RetryPolicy::fast();
        retry.encoder_open_query_retries = 5;
        let encoder = Encoder::new(sim.clone(), config(256, 128).retry(retry)).unwrap();
        assert!(matches!(
            encoder.open(),
            Err(XcoderError::ResourceUnavailable(_))
        ));
        assert_eq!(sim.active_sessions(), 0);
    }

    #[test]
    fn test_persistent_status_errors_fail_read() {
        let sim = Arc::new(SimulatedDevice::new(8192));
        let encoder = open(&sim, config(256, 128));
        sim.set_persistent_status_error(Some(DeviceErrorCode::RequestPending));
        let before = sim.status_queries();
        match encoder.read() {
            Err(XcoderError::PersistentFailure { count, .. }) => assert_eq!(count, 25),
            other => panic!("expected persistent failure, got {other:?}"),
        }
        assert_eq!(sim.status_queries() - before, 25);
    }

    #[test]
    fn test_frame_size_must_match_config() {
        let sim = Arc::new(SimulatedDevice::new(8192));
        let encoder = open(&sim, config(256, 128));
        let odd = Frame::new_yuv420(100, 100, 8).unwrap();
        assert!(matches!(
            encoder.write(&odd),
            Err(XcoderError::Param(ParamError::InvalidValue(_)))
        ));
    }
}
