//! An in-memory transcoder implementing [`Device`].
//!
//! The simulated device reassembles chunked writes, turns every complete
//! decoder packet into one decoded frame and every complete encoder frame
//! into one packet, and serves them back through chunked reads. Tests use
//! its knobs to script buffer availability, inject errors, and inspect every
//! chunk command it receives.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use xcoder_params::pic_type;

use crate::device::{
    ChunkCommand, CommandResult, ConfigCommand, Device, DeviceErrorCode, InstanceLoad,
    OpenRequest, RawStatus, SessionAddress, StreamInfo,
};
use crate::error::NvmeStatus;
use crate::frame::{
    Crop, DecoderMetadata, EncoderFrameMetadata, PacketMetadata, PlaneLayout,
    ENCODER_FRAME_METADATA_SIZE,
};
use crate::types::{CodecFormat, DeviceType, FRAME_CHUNK_INDEX_SIZE};

/// Write space reported when nothing else is scripted.
pub const DEFAULT_WRITE_CAPACITY: u32 = 64 * 1024 * 1024;

/// Completed write units remembered per session for inspection.
const WRITTEN_HISTORY: usize = 64;

/// Header bytes carried by the first packet of every encoded stream.
const HEADER_PACKET: &[u8] = &[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1F, 0, 0, 0, 1, 0x68, 0xCE, 0x3C, 0x80];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkDirection {
    Read,
    Write,
}

/// One chunk command as the device received it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRecord {
    pub direction: ChunkDirection,
    pub session_id: u32,
    pub command: ChunkCommand,
    /// Length of the device-facing buffer.
    pub device_len: usize,
    /// Write space the session last reported before this command.
    pub wr_buf_avail: u32,
}

#[derive(Default)]
struct Assembly {
    buf: Vec<u8>,
    received: usize,
}

struct SimSession {
    device_type: DeviceType,
    hw_id: u32,
    request: OpenRequest,
    epoch: u64,
    recovering: bool,
    resolution: (u32, u32),
    assembly: Assembly,
    output: VecDeque<Vec<u8>>,
    read_progress: usize,
    written: VecDeque<Vec<u8>>,
    write_script: VecDeque<u32>,
    last_wr_avail: u32,
    input_offset: u64,
    frames_in: u32,
    frames_out: u32,
    header_sent: bool,
    eos: bool,
    configs: Vec<ConfigCommand>,
}

impl SimSession {
    fn output_visible(&self, delay: usize) -> bool {
        !self.output.is_empty() && (self.eos || self.output.len() > delay)
    }

    fn factor(&self) -> usize {
        if self.request.bit_depth > 8 {
            2
        } else {
            1
        }
    }
}

struct Knobs {
    write_capacity: u32,
    status_errors: VecDeque<DeviceErrorCode>,
    persistent_status_error: Option<DeviceErrorCode>,
    session_error: Option<u32>,
    failed_queries: u32,
    recover_opens: u32,
    pending_closes: u32,
    refused_writes: u32,
    accepted_before_refusal: u32,
    refusal: NvmeStatus,
    output_delay: usize,
    resolution_change: Option<(u32, u32, u32)>,
    split_packets: bool,
    decoder_sei: Option<Vec<u8>>,
}

impl Default for Knobs {
    fn default() -> Self {
        Self {
            write_capacity: DEFAULT_WRITE_CAPACITY,
            status_errors: VecDeque::new(),
            persistent_status_error: None,
            session_error: None,
            failed_queries: 0,
            recover_opens: 0,
            pending_closes: 0,
            refused_writes: 0,
            accepted_before_refusal: 0,
            refusal: NvmeStatus::WriteBufferFull,
            output_delay: 0,
            resolution_change: None,
            split_packets: false,
            decoder_sei: None,
        }
    }
}

#[derive(Default)]
struct Counters {
    status_queries: usize,
    keep_alives: usize,
    open_commands: usize,
    closed: Vec<u32>,
    chunk_log: Vec<ChunkRecord>,
}

struct SimState {
    sessions: HashMap<u32, SimSession>,
    loads: HashMap<DeviceType, Vec<u32>>,
    next_session_id: u32,
    next_epoch: u64,
    knobs: Knobs,
    counters: Counters,
}

/// Transcoder simulated entirely in memory.
pub struct SimulatedDevice {
    name: String,
    max_io_size: usize,
    state: Mutex<SimState>,
}

impl SimulatedDevice {
    /// Create a device with one instance of each type.
    ///
    /// `max_io_size` is rounded up to a whole number of chunk-index units.
    #[must_use]
    pub fn new(max_io_size: usize) -> Self {
        let max_io_size = max_io_size.max(1).div_ceil(FRAME_CHUNK_INDEX_SIZE) * FRAME_CHUNK_INDEX_SIZE;
        let loads = [
            DeviceType::Decoder,
            DeviceType::Encoder,
            DeviceType::Scaler,
            DeviceType::Ai,
        ]
        .into_iter()
        .map(|t| (t, vec![0]))
        .collect();
        Self {
            name: "/dev/nvme-sim".to_string(),
            max_io_size,
            state: Mutex::new(SimState {
                sessions: HashMap::new(),
                loads,
                next_session_id: 0,
                next_epoch: 0x5EED_0000,
                knobs: Knobs::default(),
                counters: Counters::default(),
            }),
        }
    }

    /// Replace the instances of a device type with ones at the given loads.
    #[must_use]
    pub fn with_instances(self, device_type: DeviceType, loads: &[u32]) -> Self {
        self.state.lock().loads.insert(device_type, loads.to_vec());
        self
    }

    /// Write space reported by the next status queries of a session, one
    /// value per query, before falling back to the device capacity.
    pub fn script_write_avail(&self, session_id: u32, values: impl IntoIterator<Item = u32>) {
        if let Some(session) = self.state.lock().sessions.get_mut(&session_id) {
            session.write_script.extend(values);
        }
    }

    /// Write space reported when no script is pending.
    pub fn set_write_capacity(&self, bytes: u32) {
        self.state.lock().knobs.write_capacity = bytes;
    }

    /// Report `code` as the instance error in the next `count` status queries.
    pub fn inject_status_errors(&self, code: DeviceErrorCode, count: usize) {
        let mut state = self.state.lock();
        state
            .knobs
            .status_errors
            .extend(std::iter::repeat(code).take(count));
    }

    /// Report `code` in every status query until cleared.
    pub fn set_persistent_status_error(&self, code: Option<DeviceErrorCode>) {
        self.state.lock().knobs.persistent_status_error = code;
    }

    /// Report a session error number in every status query until cleared.
    pub fn set_session_error(&self, sess_err_no: Option<u32>) {
        self.state.lock().knobs.session_error = sess_err_no;
    }

    /// Fail the next `count` status queries outright.
    pub fn fail_status_queries(&self, count: u32) {
        self.state.lock().knobs.failed_queries = count;
    }

    /// The next `count` opened sessions report VPU recovery on their first
    /// status query.
    pub fn recover_on_open(&self, count: u32) {
        self.state.lock().knobs.recover_opens = count;
    }

    /// Give every open session a new epoch, as firmware does when it
    /// recycles sessions.
    pub fn recycle_epochs(&self) {
        let mut state = self.state.lock();
        let SimState {
            sessions,
            next_epoch,
            ..
        } = &mut *state;
        for session in sessions.values_mut() {
            *next_epoch += 1;
            session.epoch = *next_epoch;
        }
    }

    /// Answer the next `count` close commands with "in progress".
    pub fn pending_closes(&self, count: u32) {
        self.state.lock().knobs.pending_closes = count;
    }

    /// Refuse the next `count` write chunks with `status`.
    pub fn refuse_write_chunks(&self, count: u32, status: NvmeStatus) {
        self.refuse_write_chunks_after(0, count, status);
    }

    /// Accept `accepted` write chunks, then refuse the next `count`.
    pub fn refuse_write_chunks_after(&self, accepted: u32, count: u32, status: NvmeStatus) {
        let mut state = self.state.lock();
        state.knobs.accepted_before_refusal = accepted;
        state.knobs.refused_writes = count;
        state.knobs.refusal = status;
    }

    /// Hold decoded output back until more than `frames` are pending.
    pub fn set_output_delay(&self, frames: usize) {
        self.state.lock().knobs.output_delay = frames;
    }

    /// Switch the decoded resolution once `after_frames` frames were decoded.
    pub fn change_resolution(&self, after_frames: u32, width: u32, height: u32) {
        self.state.lock().knobs.resolution_change = Some((after_frames, width, height));
    }

    /// Deliver every encoded packet in two reads.
    pub fn split_packets(&self, enabled: bool) {
        self.state.lock().knobs.split_packets = enabled;
    }

    /// SEI trailer appended to every decoded frame.
    pub fn set_decoder_sei(&self, sei: Option<Vec<u8>>) {
        self.state.lock().knobs.decoder_sei = sei;
    }

    /// Queue a raw output unit for a session.
    pub fn push_output(&self, session_id: u32, data: Vec<u8>) {
        if let Some(session) = self.state.lock().sessions.get_mut(&session_id) {
            session.output.push_back(data);
        }
    }

    /// Oldest completed write unit of a session.
    pub fn take_written(&self, session_id: u32) -> Option<Vec<u8>> {
        self.state
            .lock()
            .sessions
            .get_mut(&session_id)
            .and_then(|s| s.written.pop_front())
    }

    /// Chunk commands received in one direction, in arrival order.
    pub fn chunk_log(&self, direction: ChunkDirection) -> Vec<ChunkRecord> {
        self.state
            .lock()
            .counters
            .chunk_log
            .iter()
            .filter(|r| r.direction == direction)
            .copied()
            .collect()
    }

    pub fn clear_chunk_log(&self) {
        self.state.lock().counters.chunk_log.clear();
    }

    pub fn status_queries(&self) -> usize {
        self.state.lock().counters.status_queries
    }

    pub fn keep_alives(&self) -> usize {
        self.state.lock().counters.keep_alives
    }

    /// Open commands received, successful or not.
    pub fn open_commands(&self) -> usize {
        self.state.lock().counters.open_commands
    }

    pub fn active_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Ids of the sessions closed so far.
    pub fn closed_sessions(&self) -> Vec<u32> {
        self.state.lock().counters.closed.clone()
    }

    /// Configuration commands a session received.
    pub fn configs(&self, session_id: u32) -> Vec<ConfigCommand> {
        self.state
            .lock()
            .sessions
            .get(&session_id)
            .map(|s| s.configs.clone())
            .unwrap_or_default()
    }

    /// Frames (decoder) or packets (encoder) a session has produced.
    pub fn produced(&self, session_id: u32) -> u32 {
        self.state
            .lock()
            .sessions
            .get(&session_id)
            .map_or(0, |s| s.frames_in)
    }
}

fn transfer_height(codec: CodecFormat, height: u32) -> u32 {
    let align = match codec {
        CodecFormat::H264 => 16,
        CodecFormat::H265 => 8,
    };
    height.div_ceil(align) * align
}

fn decode_packet(session: &mut SimSession, packet: &[u8], knobs: &Knobs) {
    let offset = session.input_offset;
    session.input_offset += packet.len() as u64;

    if let Some((after, width, height)) = knobs.resolution_change {
        if session.frames_in == after && session.resolution != (width, height) {
            debug!(
                "sim: resolution {:?} -> {}x{}",
                session.resolution, width, height
            );
            session.resolution = (width, height);
            let marker = DecoderMetadata {
                frame_width: width as u16,
                frame_height: height as u16,
                bit_depth: u16::from(session.request.bit_depth),
                ..Default::default()
            };
            session.output.push_back(marker.encode());
        }
    }

    let (width, height) = session.resolution;
    let codec = session.request.codec;
    let layout = PlaneLayout::decoder(codec, width, height, session.factor());
    let mut blob = vec![(session.frames_in & 0xFF) as u8; layout.plane_sum()];
    let sei = knobs.decoder_sei.clone().unwrap_or_default();
    let meta = DecoderMetadata {
        crop: Crop {
            left: 0,
            right: (layout.width as u32 - width) as u16,
            top: 0,
            bottom: (layout.height as u32 - height) as u16,
        },
        frame_offset: offset,
        frame_width: width as u16,
        frame_height: height as u16,
        frame_type: if session.frames_in == 0 {
            pic_type::I as u16
        } else {
            pic_type::P as u16
        },
        bit_depth: u16::from(session.request.bit_depth),
        sei_header: u32::from(!sei.is_empty()),
        sei_number: u16::from(!sei.is_empty()),
        sei_size: sei.len() as u16,
        frame_cycle: 1000,
    };
    blob.extend_from_slice(&meta.encode());
    blob.extend_from_slice(&sei);
    session.output.push_back(blob);
    session.frames_in += 1;
    trace!("sim: decoded frame {} from offset {}", session.frames_in, offset);
}

fn push_packet(session: &mut SimSession, meta: PacketMetadata, payload: &[u8], split: bool) {
    if split && payload.len() > 1 {
        let (head, tail) = payload.split_at(payload.len() / 2);
        for (part, end) in [(head, 0u8), (tail, 1u8)] {
            let part_meta = PacketMetadata {
                bs_frame_size: part.len() as u32,
                end_of_packet: end,
                ..meta
            };
            let mut unit = part_meta.encode();
            unit.extend_from_slice(part);
            session.output.push_back(unit);
        }
        return;
    }
    let mut unit = PacketMetadata {
        bs_frame_size: payload.len() as u32,
        end_of_packet: 1,
        ..meta
    }
    .encode();
    unit.extend_from_slice(payload);
    session.output.push_back(unit);
}

fn encode_frame(session: &mut SimSession, frame: &[u8], knobs: &Knobs) {
    let layout = PlaneLayout::encoder(
        session.request.width,
        session.request.height,
        session.factor(),
    );
    let meta_at = layout.plane_sum();
    let Some(meta_bytes) = frame.get(meta_at..meta_at + ENCODER_FRAME_METADATA_SIZE) else {
        warn!("sim: encoder frame of {} bytes has no metadata", frame.len());
        return;
    };
    let Ok(meta) = EncoderFrameMetadata::parse(meta_bytes) else {
        return;
    };

    if !session.header_sent {
        session.header_sent = true;
        push_packet(session, PacketMetadata::default(), HEADER_PACKET, false);
    }

    let index = session.frames_in;
    let payload: Vec<u8> = (0..64 + (index as usize % 7))
        .map(|i| (index as usize + i) as u8)
        .collect();
    let frame_type = if meta.force_type_enable != 0 {
        u32::from(meta.force_type)
    } else if index == 0 {
        pic_type::I as u32
    } else {
        pic_type::P as u32
    };
    let avg_frame_qp = if meta.force_pic_qp_enable != 0 {
        u32::from(meta.force_pic_qp_i)
    } else {
        30
    };
    let packet_meta = PacketMetadata {
        frame_type,
        frame_tstamp: meta.frame_tstamp,
        recycle_index: index,
        frame_cycle: 2000,
        avg_frame_qp,
        ..Default::default()
    };
    push_packet(session, packet_meta, &payload, knobs.split_packets);
    session.frames_in += 1;
}

impl Device for SimulatedDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_io_size(&self) -> usize {
        self.max_io_size
    }

    fn instances(&self, device_type: DeviceType) -> CommandResult<Vec<InstanceLoad>> {
        let state = self.state.lock();
        let loads = state
            .loads
            .get(&device_type)
            .ok_or(NvmeStatus::ResourceNotFound)?;
        Ok(loads
            .iter()
            .enumerate()
            .map(|(hw_id, &load)| {
                let hw_id = hw_id as u32;
                let on_instance = state
                    .sessions
                    .values()
                    .filter(|s| s.device_type == device_type && s.hw_id == hw_id);
                let (count, model_load) = on_instance
                    .fold((0u32, 0u64), |(n, m), s| (n + 1, m + s.request.model_load));
                InstanceLoad {
                    hw_id,
                    load,
                    model_load,
                    active_sessions: count,
                }
            })
            .collect())
    }

    fn open_session(
        &self,
        device_type: DeviceType,
        hw_id: u32,
        request: &OpenRequest,
    ) -> CommandResult<u32> {
        let mut state = self.state.lock();
        state.counters.open_commands += 1;
        let exists = state
            .loads
            .get(&device_type)
            .is_some_and(|loads| (hw_id as usize) < loads.len());
        if !exists {
            return Err(NvmeStatus::ResourceNotFound);
        }
        let session_id = state.next_session_id;
        state.next_session_id += 1;
        state.next_epoch += 1;
        let recovering = state.knobs.recover_opens > 0;
        if recovering {
            state.knobs.recover_opens -= 1;
        }
        let session = SimSession {
            device_type,
            hw_id,
            request: request.clone(),
            epoch: state.next_epoch,
            recovering,
            resolution: (request.width, request.height),
            assembly: Assembly::default(),
            output: VecDeque::new(),
            read_progress: 0,
            written: VecDeque::new(),
            write_script: VecDeque::new(),
            last_wr_avail: 0,
            input_offset: 0,
            frames_in: 0,
            frames_out: 0,
            header_sent: false,
            eos: false,
            configs: Vec::new(),
        };
        state.sessions.insert(session_id, session);
        debug!("sim: opened {} session {} on hw {}", device_type, session_id, hw_id);
        Ok(session_id)
    }

    fn close_session(&self, addr: SessionAddress) -> CommandResult<()> {
        let mut state = self.state.lock();
        if state.knobs.pending_closes > 0 {
            state.knobs.pending_closes -= 1;
            return Err(NvmeStatus::RequestInProgress);
        }
        if state.sessions.remove(&addr.session_id).is_some() {
            state.counters.closed.push(addr.session_id);
            debug!("sim: closed session {}", addr.session_id);
        }
        Ok(())
    }

    fn configure(&self, addr: SessionAddress, command: &ConfigCommand) -> CommandResult<()> {
        let mut state = self.state.lock();
        let session = state
            .sessions
            .get_mut(&addr.session_id)
            .ok_or(NvmeStatus::ResourceNotFound)?;
        if *command == ConfigCommand::EndOfStream {
            session.eos = true;
        }
        session.configs.push(command.clone());
        Ok(())
    }

    fn query_status(&self, addr: SessionAddress) -> CommandResult<RawStatus> {
        let mut state = self.state.lock();
        let SimState {
            sessions,
            knobs,
            counters,
            ..
        } = &mut *state;
        counters.status_queries += 1;
        if knobs.failed_queries > 0 {
            knobs.failed_queries -= 1;
            return Err(NvmeStatus::VpuGeneralError);
        }
        let session = sessions
            .get_mut(&addr.session_id)
            .ok_or(NvmeStatus::ResourceNotFound)?;

        let wr_buf_avail = session
            .write_script
            .pop_front()
            .unwrap_or(knobs.write_capacity);
        session.last_wr_avail = wr_buf_avail;
        let rd_buf_avail = if session.output_visible(knobs.output_delay) {
            session.output.front().map_or(0, |unit| unit.len() as u32)
        } else {
            0
        };
        let inst_err_no = if session.recovering {
            session.recovering = false;
            DeviceErrorCode::ResourceRecovery
        } else if let Some(code) = knobs.status_errors.pop_front() {
            code
        } else {
            knobs.persistent_status_error.unwrap_or_default()
        };

        Ok(RawStatus {
            rd_buf_avail,
            wr_buf_avail,
            sess_err_no: knobs.session_error.unwrap_or(0),
            inst_err_no,
            sess_timestamp: session.epoch,
            frames_input: session.frames_in,
            frames_buffered: session.output.len() as u32,
            frames_completed: session.frames_in,
            frames_output: session.frames_out,
            frames_dropped: 0,
            inst_errors: 0,
        })
    }

    fn query_stream_info(&self, addr: SessionAddress) -> CommandResult<StreamInfo> {
        let state = self.state.lock();
        let session = state
            .sessions
            .get(&addr.session_id)
            .ok_or(NvmeStatus::ResourceNotFound)?;
        let (width, height) = session.resolution;
        Ok(StreamInfo {
            picture_width: width,
            picture_height: height,
            transfer_frame_stride: width.div_ceil(32) * 32,
            transfer_frame_height: transfer_height(session.request.codec, height),
            frame_rate: 30,
            is_flushed: session.eos && session.output.is_empty(),
        })
    }

    fn write_chunk(
        &self,
        addr: SessionAddress,
        chunk: &ChunkCommand,
        data: &[u8],
    ) -> CommandResult<()> {
        let mut state = self.state.lock();
        let SimState {
            sessions,
            knobs,
            counters,
            ..
        } = &mut *state;
        let session = sessions
            .get_mut(&addr.session_id)
            .ok_or(NvmeStatus::ResourceNotFound)?;
        counters.chunk_log.push(ChunkRecord {
            direction: ChunkDirection::Write,
            session_id: addr.session_id,
            command: *chunk,
            device_len: data.len(),
            wr_buf_avail: session.last_wr_avail,
        });
        if knobs.refused_writes > 0 {
            if knobs.accepted_before_refusal > 0 {
                knobs.accepted_before_refusal -= 1;
            } else {
                knobs.refused_writes -= 1;
                return Err(knobs.refusal);
            }
        }

        let offset = chunk.chunk_index as usize * FRAME_CHUNK_INDEX_SIZE;
        let len = chunk.logical_len.min(data.len());
        let assembly = &mut session.assembly;
        if assembly.buf.len() < offset + len {
            assembly.buf.resize(offset + len, 0);
        }
        assembly.buf[offset..offset + len].copy_from_slice(&data[..len]);
        assembly.received += len;
        if assembly.received < chunk.total_len {
            return Ok(());
        }

        let mut unit = std::mem::take(&mut assembly.buf);
        unit.truncate(chunk.total_len);
        assembly.received = 0;
        match session.device_type {
            DeviceType::Decoder => decode_packet(session, &unit, knobs),
            DeviceType::Encoder => encode_frame(session, &unit, knobs),
            DeviceType::Scaler | DeviceType::Ai => {}
        }
        if session.written.len() >= WRITTEN_HISTORY {
            session.written.pop_front();
        }
        session.written.push_back(unit);
        Ok(())
    }

    fn read_chunk(
        &self,
        addr: SessionAddress,
        chunk: &ChunkCommand,
        buf: &mut [u8],
    ) -> CommandResult<()> {
        let mut state = self.state.lock();
        let SimState {
            sessions,
            counters,
            ..
        } = &mut *state;
        let session = sessions
            .get_mut(&addr.session_id)
            .ok_or(NvmeStatus::ResourceNotFound)?;
        counters.chunk_log.push(ChunkRecord {
            direction: ChunkDirection::Read,
            session_id: addr.session_id,
            command: *chunk,
            device_len: buf.len(),
            wr_buf_avail: session.last_wr_avail,
        });

        buf.fill(0);
        let Some(unit) = session.output.front() else {
            return Err(NvmeStatus::ResourceIsEmpty);
        };
        let offset = chunk.chunk_index as usize * FRAME_CHUNK_INDEX_SIZE;
        if offset < unit.len() {
            let end = unit.len().min(offset + chunk.logical_len).min(offset + buf.len());
            buf[..end - offset].copy_from_slice(&unit[offset..end]);
        }
        session.read_progress += chunk.logical_len;
        if session.read_progress >= chunk.total_len {
            session.output.pop_front();
            session.read_progress = 0;
            session.frames_out += 1;
        }
        Ok(())
    }

    fn keep_alive(&self, addr: SessionAddress) -> CommandResult<()> {
        let mut state = self.state.lock();
        state.counters.keep_alives += 1;
        if state.sessions.contains_key(&addr.session_id) {
            Ok(())
        } else {
            Err(NvmeStatus::ResourceNotFound)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(codec: CodecFormat, width: u32, height: u32) -> OpenRequest {
        OpenRequest {
            codec,
            width,
            height,
            bit_depth: 8,
            model_load: 100,
            low_delay: false,
        }
    }

    fn addr(device_type: DeviceType, session_id: u32) -> SessionAddress {
        SessionAddress {
            device_type,
            hw_id: 0,
            session_id,
        }
    }

    fn write_all(sim: &SimulatedDevice, addr: SessionAddress, data: &[u8]) {
        let chunk = ChunkCommand {
            chunk_index: 0,
            logical_len: data.len(),
            total_len: data.len(),
            last: true,
        };
        sim.write_chunk(addr, &chunk, data).unwrap();
    }

    fn read_all(sim: &SimulatedDevice, addr: SessionAddress, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        let chunk = ChunkCommand {
            chunk_index: 0,
            logical_len: len,
            total_len: len,
            last: true,
        };
        sim.read_chunk(addr, &chunk, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_max_io_rounded() {
        assert_eq!(SimulatedDevice::new(1000).max_io_size(), 4096);
        assert_eq!(SimulatedDevice::new(8192).max_io_size(), 8192);
    }

    #[test]
    fn test_instances_report_sessions() {
        let sim = SimulatedDevice::new(4096).with_instances(DeviceType::Decoder, &[10, 20]);
        sim.open_session(DeviceType::Decoder, 1, &request(CodecFormat::H264, 64, 64))
            .unwrap();
        let loads = sim.instances(DeviceType::Decoder).unwrap();
        assert_eq!(loads.len(), 2);
        assert_eq!(loads[1].active_sessions, 1);
        assert_eq!(loads[1].model_load, 100);
        assert_eq!(loads[0].load, 10);
        assert!(sim
            .open_session(DeviceType::Decoder, 5, &request(CodecFormat::H264, 64, 64))
            .is_err());
    }

    #[test]
    fn test_decoder_produces_frame_per_packet() {
        let sim = SimulatedDevice::new(4096);
        let id = sim
            .open_session(DeviceType::Decoder, 0, &request(CodecFormat::H264, 64, 60))
            .unwrap();
        let a = addr(DeviceType::Decoder, id);
        write_all(&sim, a, &[1u8; 300]);
        write_all(&sim, a, &[2u8; 200]);

        let layout = PlaneLayout::decoder(CodecFormat::H264, 64, 60, 1);
        let status = sim.query_status(a).unwrap();
        assert_eq!(status.sess_err_no, 0);
        assert_eq!(status.rd_buf_avail as usize, layout.plane_sum() + 40);

        let first = read_all(&sim, a, status.rd_buf_avail as usize);
        let meta = DecoderMetadata::parse(&first[layout.plane_sum()..]).unwrap();
        assert_eq!(meta.frame_offset, 0);
        assert_eq!(meta.crop.bottom, 4);

        let second = read_all(&sim, a, status.rd_buf_avail as usize);
        let meta = DecoderMetadata::parse(&second[layout.plane_sum()..]).unwrap();
        assert_eq!(meta.frame_offset, 300);
        assert_eq!(sim.query_status(a).unwrap().rd_buf_avail, 0);
    }

    #[test]
    fn test_encoder_header_then_packets() {
        let sim = SimulatedDevice::new(4096);
        let id = sim
            .open_session(DeviceType::Encoder, 0, &request(CodecFormat::H265, 32, 32))
            .unwrap();
        let a = addr(DeviceType::Encoder, id);
        let mut frame = vec![0u8; 32 * 32 * 3 / 2];
        frame.extend_from_slice(
            &EncoderFrameMetadata {
                frame_tstamp: 99,
                ..Default::default()
            }
            .encode(),
        );
        write_all(&sim, a, &frame);

        let len = sim.query_status(a).unwrap().rd_buf_avail as usize;
        let header = read_all(&sim, a, len);
        let meta = PacketMetadata::parse(&header).unwrap();
        assert_eq!(meta.frame_tstamp, 0);
        assert_eq!(meta.avg_frame_qp, 0);
        assert_eq!(&header[32..], HEADER_PACKET);

        let len = sim.query_status(a).unwrap().rd_buf_avail as usize;
        let packet = read_all(&sim, a, len);
        let meta = PacketMetadata::parse(&packet).unwrap();
        assert_eq!(meta.frame_tstamp, 99);
        assert_eq!(meta.end_of_packet, 1);
    }

    #[test]
    fn test_write_script_and_errors() {
        let sim = SimulatedDevice::new(4096);
        let id = sim
            .open_session(DeviceType::Decoder, 0, &request(CodecFormat::H264, 64, 64))
            .unwrap();
        let a = addr(DeviceType::Decoder, id);
        sim.script_write_avail(id, [0, 10]);
        sim.inject_status_errors(DeviceErrorCode::RequestPending, 1);

        let s = sim.query_status(a).unwrap();
        assert_eq!((s.wr_buf_avail, s.inst_err_no), (0, DeviceErrorCode::RequestPending));
        let s = sim.query_status(a).unwrap();
        assert_eq!((s.wr_buf_avail, s.inst_err_no), (10, DeviceErrorCode::Success));
        assert_eq!(sim.query_status(a).unwrap().wr_buf_avail, DEFAULT_WRITE_CAPACITY);
        assert_eq!(sim.status_queries(), 3);

        sim.fail_status_queries(1);
        assert_eq!(sim.query_status(a), Err(NvmeStatus::VpuGeneralError));
    }

    #[test]
    fn test_pending_close() {
        let sim = SimulatedDevice::new(4096);
        let id = sim
            .open_session(DeviceType::Decoder, 0, &request(CodecFormat::H264, 64, 64))
            .unwrap();
        sim.pending_closes(1);
        let a = addr(DeviceType::Decoder, id);
        assert_eq!(sim.close_session(a), Err(NvmeStatus::RequestInProgress));
        assert_eq!(sim.close_session(a), Ok(()));
        assert_eq!(sim.closed_sessions(), vec![id]);
        assert_eq!(sim.active_sessions(), 0);
    }
}
