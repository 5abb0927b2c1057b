//! Frames, packets, and the fixed metadata blocks exchanged with the device.
//!
//! All metadata blocks are little-endian. A decoder read returns
//! `[Y | U | V | DecoderMetadata | SEI]`, an encoder write sends
//! `[Y | U | V | EncoderFrameMetadata | reconfig | ROI map | SEI]`, and an
//! encoder read returns `[PacketMetadata | bitstream]`.

use bytes::{Buf, BufMut, Bytes};

use crate::error::XcoderError;
use crate::pool::FrameBuffer;
use crate::timestamp::NOPTS_VALUE;
use crate::types::{align_to_page, CodecFormat, MEM_PAGE_ALIGNMENT};
use crate::Result;

/// Size of the metadata block trailing a decoded frame.
pub const DECODER_METADATA_SIZE: usize = 40;
/// Size of the metadata block trailing an encoder input frame.
pub const ENCODER_FRAME_METADATA_SIZE: usize = 56;
/// Size of the metadata block leading an encoded packet.
pub const PACKET_METADATA_SIZE: usize = 32;
/// Largest SEI trailer the device appends to a decoded frame.
pub const MAX_SEI_DATA: usize = 1280;

/// Largest supported picture dimension.
pub const MAX_RESOLUTION_WIDTH: u32 = 8192;
pub const MAX_RESOLUTION_HEIGHT: u32 = 8192;

/// Cropping window reported with each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Crop {
    pub left: u16,
    pub right: u16,
    pub top: u16,
    pub bottom: u16,
}

fn check_len(buf: &[u8], need: usize, what: &str) -> Result<()> {
    if buf.len() < need {
        return Err(XcoderError::invalid_param(format!(
            "{what} needs {need} bytes, got {}",
            buf.len()
        )));
    }
    Ok(())
}

fn get_crop(b: &mut &[u8]) -> Crop {
    Crop {
        left: b.get_u16_le(),
        right: b.get_u16_le(),
        top: b.get_u16_le(),
        bottom: b.get_u16_le(),
    }
}

fn put_crop(out: &mut Vec<u8>, crop: &Crop) {
    out.put_u16_le(crop.left);
    out.put_u16_le(crop.right);
    out.put_u16_le(crop.top);
    out.put_u16_le(crop.bottom);
}

/// Metadata the device appends after the planes of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecoderMetadata {
    pub crop: Crop,
    /// Byte offset in the input bitstream of the packet this frame came from.
    pub frame_offset: u64,
    pub frame_width: u16,
    pub frame_height: u16,
    pub frame_type: u16,
    pub bit_depth: u16,
    pub sei_header: u32,
    pub sei_number: u16,
    pub sei_size: u16,
    /// Device cycles spent on the frame.
    pub frame_cycle: u32,
}

impl DecoderMetadata {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        check_len(buf, DECODER_METADATA_SIZE, "decoder metadata")?;
        let mut b = &buf[..DECODER_METADATA_SIZE];
        Ok(Self {
            crop: get_crop(&mut b),
            frame_offset: b.get_u64_le(),
            frame_width: b.get_u16_le(),
            frame_height: b.get_u16_le(),
            frame_type: b.get_u16_le(),
            bit_depth: b.get_u16_le(),
            sei_header: b.get_u32_le(),
            sei_number: b.get_u16_le(),
            sei_size: b.get_u16_le(),
            frame_cycle: b.get_u32_le(),
        })
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(DECODER_METADATA_SIZE);
        put_crop(&mut out, &self.crop);
        out.put_u64_le(self.frame_offset);
        out.put_u16_le(self.frame_width);
        out.put_u16_le(self.frame_height);
        out.put_u16_le(self.frame_type);
        out.put_u16_le(self.bit_depth);
        out.put_u32_le(self.sei_header);
        out.put_u16_le(self.sei_number);
        out.put_u16_le(self.sei_size);
        out.put_u32_le(self.frame_cycle);
        out.put_u32_le(0);
        out
    }
}

/// Metadata the host appends after the planes of an encoder input frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncoderFrameMetadata {
    pub crop: Crop,
    /// Presentation timestamp echoed back in the packet metadata.
    pub frame_tstamp: u64,
    pub frame_width: u16,
    pub frame_height: u16,
    pub frame_type: u16,
    pub bit_depth: u16,
    pub roi_avg_qp: u32,
    pub roi_map_size: u32,
    pub sei_data_size: u32,
    pub reconfig_data_size: u32,
    pub force_type_enable: u16,
    pub force_type: u16,
    pub force_pic_qp_enable: u16,
    pub force_pic_qp_i: u16,
    pub force_pic_qp_p: u16,
    pub force_pic_qp_b: u16,
    pub force_headers: u16,
    pub use_cur_src_as_long_term_pic: u8,
    pub use_long_term_ref: u8,
}

impl EncoderFrameMetadata {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        check_len(buf, ENCODER_FRAME_METADATA_SIZE, "frame metadata")?;
        let mut b = &buf[..ENCODER_FRAME_METADATA_SIZE];
        Ok(Self {
            crop: get_crop(&mut b),
            frame_tstamp: b.get_u64_le(),
            frame_width: b.get_u16_le(),
            frame_height: b.get_u16_le(),
            frame_type: b.get_u16_le(),
            bit_depth: b.get_u16_le(),
            roi_avg_qp: b.get_u32_le(),
            roi_map_size: b.get_u32_le(),
            sei_data_size: b.get_u32_le(),
            reconfig_data_size: b.get_u32_le(),
            force_type_enable: b.get_u16_le(),
            force_type: b.get_u16_le(),
            force_pic_qp_enable: b.get_u16_le(),
            force_pic_qp_i: b.get_u16_le(),
            force_pic_qp_p: b.get_u16_le(),
            force_pic_qp_b: b.get_u16_le(),
            force_headers: b.get_u16_le(),
            use_cur_src_as_long_term_pic: b.get_u8(),
            use_long_term_ref: b.get_u8(),
        })
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENCODER_FRAME_METADATA_SIZE);
        put_crop(&mut out, &self.crop);
        out.put_u64_le(self.frame_tstamp);
        out.put_u16_le(self.frame_width);
        out.put_u16_le(self.frame_height);
        out.put_u16_le(self.frame_type);
        out.put_u16_le(self.bit_depth);
        out.put_u32_le(self.roi_avg_qp);
        out.put_u32_le(self.roi_map_size);
        out.put_u32_le(self.sei_data_size);
        out.put_u32_le(self.reconfig_data_size);
        out.put_u16_le(self.force_type_enable);
        out.put_u16_le(self.force_type);
        out.put_u16_le(self.force_pic_qp_enable);
        out.put_u16_le(self.force_pic_qp_i);
        out.put_u16_le(self.force_pic_qp_p);
        out.put_u16_le(self.force_pic_qp_b);
        out.put_u16_le(self.force_headers);
        out.put_u8(self.use_cur_src_as_long_term_pic);
        out.put_u8(self.use_long_term_ref);
        out
    }
}

/// Metadata leading every encoded packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketMetadata {
    /// Bitstream bytes following this block.
    pub bs_frame_size: u32,
    pub frame_type: u32,
    pub frame_tstamp: u64,
    pub recycle_index: u32,
    pub frame_cycle: u32,
    pub avg_frame_qp: u32,
    /// Zero when the packet continues in the next read.
    pub end_of_packet: u8,
}

impl PacketMetadata {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        check_len(buf, PACKET_METADATA_SIZE, "packet metadata")?;
        let mut b = &buf[..PACKET_METADATA_SIZE];
        Ok(Self {
            bs_frame_size: b.get_u32_le(),
            frame_type: b.get_u32_le(),
            frame_tstamp: b.get_u64_le(),
            recycle_index: b.get_u32_le(),
            frame_cycle: b.get_u32_le(),
            avg_frame_qp: b.get_u32_le(),
            end_of_packet: b.get_u8(),
        })
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PACKET_METADATA_SIZE);
        out.put_u32_le(self.bs_frame_size);
        out.put_u32_le(self.frame_type);
        out.put_u64_le(self.frame_tstamp);
        out.put_u32_le(self.recycle_index);
        out.put_u32_le(self.frame_cycle);
        out.put_u32_le(self.avg_frame_qp);
        out.put_u8(self.end_of_packet);
        out.put_bytes(0, 3);
        out
    }
}

/// Plane sizes of a YUV 4:2:0 picture as laid out in a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub width: usize,
    pub height: usize,
    pub luma: usize,
    pub chroma: usize,
}

impl PlaneLayout {
    /// Layout of a decoded frame. Width is padded to 32, height to 16 for
    /// H.264 and to 8 otherwise.
    #[must_use]
    pub fn decoder(codec: CodecFormat, width: u32, height: u32, factor: usize) -> Self {
        let width = (width as usize).div_ceil(32) * 32;
        let h_align = match codec {
            CodecFormat::H264 => 16,
            CodecFormat::H265 => 8,
        };
        let height = (height as usize).div_ceil(h_align) * h_align;
        Self::with_size(width, height, factor)
    }

    /// Layout of a tightly packed encoder input frame.
    #[must_use]
    pub fn encoder(width: u32, height: u32, factor: usize) -> Self {
        Self::with_size(width as usize, height as usize, factor)
    }

    fn with_size(width: usize, height: usize, factor: usize) -> Self {
        let luma = width * height * factor;
        Self {
            width,
            height,
            luma,
            chroma: luma / 4,
        }
    }

    /// Byte length of the Y, U, and V planes.
    #[must_use]
    pub fn data_len(&self) -> [usize; 3] {
        [self.luma, self.chroma, self.chroma]
    }

    #[must_use]
    pub fn plane_sum(&self) -> usize {
        self.luma + 2 * self.chroma
    }

    /// Buffer needed to receive a decoded frame with its metadata and SEI.
    #[must_use]
    pub fn decoder_buffer_size(&self) -> usize {
        align_to_page(self.plane_sum() + DECODER_METADATA_SIZE + MAX_SEI_DATA)
            + 3 * MEM_PAGE_ALIGNMENT
    }
}

/// SEI trailer the device attached to a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceSei {
    pub header: u32,
    pub number: u16,
    offset: usize,
    len: usize,
}

/// A raw YUV frame: decoder output or encoder input.
#[derive(Debug)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub bit_depth: u8,
    pub pts: i64,
    pub dts: i64,
    pub crop: Crop,
    /// Picture type: reported by the decoder, requested from the encoder.
    pub pic_type: u16,
    pub start_of_stream: bool,
    pub end_of_stream: bool,
    /// Ask the encoder to code this frame as `pic_type`.
    pub force_key_frame: bool,
    /// Force this QP for the frame when non-zero.
    pub force_pic_qp: u16,
    pub use_cur_src_as_long_term_pic: u8,
    pub use_long_term_ref: u8,
    /// User SEI: inserted by the encoder, or carried over from the input
    /// packet by the decoder.
    pub sei: Option<Bytes>,
    /// Encoder ROI map.
    pub roi_map: Option<Bytes>,
    pub roi_avg_qp: u32,
    /// Encoder reconfiguration block.
    pub reconfig: Option<Bytes>,
    pub device_sei: DeviceSei,
    data_len: [usize; 3],
    buffer: Option<FrameBuffer>,
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            bit_depth: 8,
            pts: NOPTS_VALUE,
            dts: NOPTS_VALUE,
            crop: Crop::default(),
            pic_type: 0,
            start_of_stream: false,
            end_of_stream: false,
            force_key_frame: false,
            force_pic_qp: 0,
            use_cur_src_as_long_term_pic: 0,
            use_long_term_ref: 0,
            sei: None,
            roi_map: None,
            roi_avg_qp: 0,
            reconfig: None,
            device_sei: DeviceSei::default(),
            data_len: [0; 3],
            buffer: None,
        }
    }
}

impl Frame {
    /// Create a zeroed 4:2:0 frame for encoder input.
    pub fn new_yuv420(width: u32, height: u32, bit_depth: u8) -> Result<Self> {
        if width == 0 || height == 0 || width > MAX_RESOLUTION_WIDTH || height > MAX_RESOLUTION_HEIGHT
        {
            return Err(XcoderError::invalid_param(format!(
                "frame size {width}x{height}"
            )));
        }
        let factor = if bit_depth > 8 { 2 } else { 1 };
        let layout = PlaneLayout::encoder(width, height, factor);
        let data = crate::pool::alloc_buffer(layout.plane_sum())?;
        Ok(Self {
            width,
            height,
            bit_depth,
            data_len: layout.data_len(),
            buffer: Some(FrameBuffer::detached(data)),
            ..Default::default()
        })
    }

    /// Marker frame carrying only the end-of-stream flag.
    #[must_use]
    pub fn end_of_stream() -> Self {
        Self {
            end_of_stream: true,
            ..Default::default()
        }
    }

    pub(crate) fn from_buffer(buffer: FrameBuffer, data_len: [usize; 3]) -> Self {
        Self {
            data_len,
            buffer: Some(buffer),
            ..Default::default()
        }
    }

    pub(crate) fn set_device_sei(&mut self, header: u32, number: u16, offset: usize, len: usize) {
        self.device_sei = DeviceSei {
            header,
            number,
            offset,
            len,
        };
    }

    /// Byte length of each plane.
    #[must_use]
    pub fn data_len(&self) -> [usize; 3] {
        self.data_len
    }

    /// Total bytes of picture data.
    #[must_use]
    pub fn plane_sum(&self) -> usize {
        self.data_len.iter().sum()
    }

    /// The Y, U, and V planes.
    #[must_use]
    pub fn planes(&self) -> [&[u8]; 3] {
        let Some(buf) = self.buffer.as_deref() else {
            return [&[], &[], &[]];
        };
        let [y, u, v] = self.data_len;
        let (y_plane, rest) = buf.split_at(y.min(buf.len()));
        let (u_plane, rest) = rest.split_at(u.min(rest.len()));
        let v_plane = &rest[..v.min(rest.len())];
        [y_plane, u_plane, v_plane]
    }

    /// Mutable access to the Y, U, and V planes.
    pub fn planes_mut(&mut self) -> [&mut [u8]; 3] {
        let Some(buf) = self.buffer.as_deref_mut() else {
            return [&mut [], &mut [], &mut []];
        };
        let [y, u, v] = self.data_len;
        let (y_plane, rest) = buf.split_at_mut(y.min(buf.len()));
        let rest_len = rest.len();
        let (u_plane, rest) = rest.split_at_mut(u.min(rest_len));
        let rest_len = rest.len();
        let v_plane = &mut rest[..v.min(rest_len)];
        [y_plane, u_plane, v_plane]
    }

    /// SEI bytes the device appended to a decoded frame.
    #[must_use]
    pub fn device_sei_data(&self) -> &[u8] {
        match self.buffer.as_deref() {
            Some(buf) if self.device_sei.len > 0 => buf
                .get(self.device_sei.offset..self.device_sei.offset + self.device_sei.len)
                .unwrap_or(&[]),
            _ => &[],
        }
    }

    /// Whether the frame still holds its pixel buffer.
    #[must_use]
    pub fn has_buffer(&self) -> bool {
        self.buffer.is_some()
    }

    /// Give the pixel buffer back to its pool ahead of dropping the frame.
    pub fn release_buffer(&mut self) {
        self.buffer = None;
        self.data_len = [0; 3];
    }

    /// Bytes of extra data sent after the planes by the encoder.
    pub(crate) fn extra_data_len(&self) -> usize {
        ENCODER_FRAME_METADATA_SIZE
            + self.reconfig.as_ref().map_or(0, Bytes::len)
            + self.roi_map.as_ref().map_or(0, Bytes::len)
            + self.sei.as_ref().map_or(0, Bytes::len)
    }
}

/// A compressed packet: decoder input or encoder output.
#[derive(Debug, Clone)]
pub struct Packet {
    pub data: Bytes,
    pub pts: i64,
    pub dts: i64,
    pub start_of_stream: bool,
    pub end_of_stream: bool,
    /// User SEI to carry through the decoder to the matching frame.
    pub custom_sei: Option<Bytes>,
    /// The packet carries SEI but no slice data.
    pub no_slice: bool,
    /// Encoder output: picture type of the coded frame.
    pub frame_type: u32,
    pub avg_frame_qp: u32,
    pub recycle_index: u32,
}

impl Default for Packet {
    fn default() -> Self {
        Self {
            data: Bytes::new(),
            pts: NOPTS_VALUE,
            dts: NOPTS_VALUE,
            start_of_stream: false,
            end_of_stream: false,
            custom_sei: None,
            no_slice: false,
            frame_type: 0,
            avg_frame_qp: 0,
            recycle_index: 0,
        }
    }
}

impl Packet {
    /// Packet carrying bitstream bytes with timestamps.
    #[must_use]
    pub fn new(data: impl Into<Bytes>, pts: i64, dts: i64) -> Self {
        Self {
            data: data.into(),
            pts,
            dts,
            ..Default::default()
        }
    }

    /// Marker packet carrying only the end-of-stream flag.
    #[must_use]
    pub fn end_of_stream() -> Self {
        Self {
            end_of_stream: true,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
