//! Core types shared by decoder and encoder sessions.

use std::fmt;
use std::time::Duration;

pub use xcoder_params::CodecFormat;

/// Session identifier value meaning "no session".
pub const INVALID_SESSION_ID: u32 = 0xFFFF_FFFF;

/// Alignment the device requires for every transfer length.
pub const MEM_PAGE_ALIGNMENT: usize = 512;

/// Unit of the chunk index carried by read and write commands.
pub const FRAME_CHUNK_INDEX_SIZE: usize = 4096;

/// Kind of hardware instance a session runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Decoder,
    Encoder,
    Scaler,
    Ai,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Decoder => "decoder",
            Self::Encoder => "encoder",
            Self::Scaler => "scaler",
            Self::Ai => "ai",
        };
        f.write_str(name)
    }
}

/// Command class a status check follows.
///
/// Only [`Opcode::Open`] changes behavior: it records the session epoch that
/// later checks compare against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Open,
    Close,
    Query,
    Config,
    Read,
    Write,
    KeepAlive,
}

/// Retry ceilings and sleep intervals for every polling loop in a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Open attempts while the device reports VPU recovery.
    pub session_open_retries: u32,
    pub session_open_interval: Duration,
    /// Polls for encoder write space right after open.
    pub encoder_open_query_retries: u32,
    pub encoder_open_query_interval: Duration,
    pub encoder_write_query_retries: u32,
    pub encoder_read_query_retries: u32,
    pub decoder_write_query_retries: u32,
    pub decoder_read_query_retries: u32,
    /// Polls for flush completion after end of stream was sent.
    pub decoder_eos_query_retries: u32,
    pub session_close_retries: u32,
    pub session_close_interval: Duration,
    pub poll_interval_short: Duration,
    pub poll_interval_long: Duration,
    /// Resends of a refused decoder write chunk before giving up for this call.
    pub max_tx_retries: u32,
    /// Resends of a chunk transfer before the process is aborted.
    pub chunk_retries: u32,
    pub chunk_retry_interval: Duration,
    /// Consecutive failed status checks treated as a dead device.
    pub failure_ceiling: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            session_open_retries: 20,
            session_open_interval: Duration::from_micros(200),
            encoder_open_query_retries: 3000,
            encoder_open_query_interval: Duration::from_micros(1000),
            encoder_write_query_retries: 2000,
            encoder_read_query_retries: 3000,
            decoder_write_query_retries: 100,
            decoder_read_query_retries: 3000,
            decoder_eos_query_retries: 15000,
            session_close_retries: 10,
            session_close_interval: Duration::from_millis(500),
            poll_interval_short: Duration::from_micros(100),
            poll_interval_long: Duration::from_micros(200),
            max_tx_retries: 1000,
            chunk_retries: 6000,
            chunk_retry_interval: Duration::from_micros(100),
            failure_ceiling: 25,
        }
    }
}

impl RetryPolicy {
    /// Same ceilings with every sleep shortened to a microsecond.
    ///
    /// Useful against the simulated device, where waiting buys nothing.
    #[must_use]
    pub fn fast() -> Self {
        let tick = Duration::from_micros(1);
        Self {
            session_open_interval: tick,
            encoder_open_query_interval: tick,
            session_close_interval: tick,
            poll_interval_short: tick,
            poll_interval_long: tick,
            chunk_retry_interval: tick,
            ..Self::default()
        }
    }
}

/// Keep-alive timeout bounds in seconds.
pub const MIN_KEEP_ALIVE_TIMEOUT: u32 = 1;
pub const MAX_KEEP_ALIVE_TIMEOUT: u32 = 100;
pub const DEFAULT_KEEP_ALIVE_TIMEOUT: u32 = 3;

/// Chunk worker threads per transfer direction.
pub const DEFAULT_WORKER_THREADS: usize = 4;

/// Configuration for opening a decoder or encoder session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bitstream codec.
    pub codec: CodecFormat,
    /// Picture width in pixels (encoder input, decoder hint).
    pub width: u32,
    /// Picture height in pixels.
    pub height: u32,
    /// Bits per sample, 8 or 10.
    pub bit_depth: u8,
    /// Framerate as (numerator, denominator).
    pub framerate: (u32, u32),
    /// Explicit hardware instance; `None` picks the least loaded one.
    pub hw_id: Option<u32>,
    /// Seconds the device waits for a keep-alive before dropping the session.
    pub keep_alive_timeout: u32,
    /// Chunk workers per direction; 0 transfers every chunk on the caller thread.
    pub worker_threads: usize,
    /// Decoder low-delay window in milliseconds; 0 disables low-delay mode.
    pub low_delay_ms: u32,
    /// Encoder low-delay mode: read waits for the packet of every written frame.
    pub low_delay: bool,
    /// Encoder strict-timeout mode.
    pub strict_timeout: bool,
    /// Hold the encoder header packet and prepend it to the first data packet.
    pub prepend_headers: bool,
    /// Polling ceilings and intervals.
    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            codec: CodecFormat::H264,
            width: 1920,
            height: 1080,
            bit_depth: 8,
            framerate: (30, 1),
            hw_id: None,
            keep_alive_timeout: DEFAULT_KEEP_ALIVE_TIMEOUT,
            worker_threads: DEFAULT_WORKER_THREADS,
            low_delay_ms: 0,
            low_delay: false,
            strict_timeout: false,
            prepend_headers: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl SessionConfig {
    /// Create a configuration for the given codec and picture size.
    #[must_use]
    pub fn new(codec: CodecFormat, width: u32, height: u32) -> Self {
        Self {
            codec,
            width,
            height,
            ..Default::default()
        }
    }

    /// Set the bit depth.
    #[must_use]
    pub fn bit_depth(mut self, bit_depth: u8) -> Self {
        self.bit_depth = bit_depth;
        self
    }

    /// Set the framerate.
    #[must_use]
    pub fn framerate(mut self, num: u32, den: u32) -> Self {
        self.framerate = (num, den);
        self
    }

    /// Pin the session to a hardware instance.
    #[must_use]
    pub fn hw_id(mut self, hw_id: u32) -> Self {
        self.hw_id = Some(hw_id);
        self
    }

    /// Set the keep-alive timeout, clamped to 1..=100 seconds.
    #[must_use]
    pub fn keep_alive_timeout(mut self, seconds: u32) -> Self {
        self.keep_alive_timeout = seconds.clamp(MIN_KEEP_ALIVE_TIMEOUT, MAX_KEEP_ALIVE_TIMEOUT);
        self
    }

    /// Set the number of chunk workers per direction.
    #[must_use]
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Enable decoder low-delay mode with the given window.
    #[must_use]
    pub fn low_delay_ms(mut self, ms: u32) -> Self {
        self.low_delay_ms = ms;
        self
    }

    /// Enable encoder low-delay mode.
    #[must_use]
    pub fn low_delay(mut self, enabled: bool) -> Self {
        self.low_delay = enabled;
        self
    }

    /// Enable encoder strict-timeout mode.
    #[must_use]
    pub fn strict_timeout(mut self, enabled: bool) -> Self {
        self.strict_timeout = enabled;
        self
    }

    /// Keep or drop the encoder header packet prepending.
    #[must_use]
    pub fn prepend_headers(mut self, enabled: bool) -> Self {
        self.prepend_headers = enabled;
        self
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Estimated device load of this stream: pixels per second.
    #[must_use]
    pub fn model_load(&self) -> u64 {
        let (num, den) = self.framerate;
        if den == 0 {
            return 0;
        }
        u64::from(self.width) * u64::from(self.height) * u64::from(num) / u64::from(den)
    }

    /// Keep-alive timeout in microseconds as the device expects it.
    #[must_use]
    pub fn keep_alive_timeout_us(&self) -> u32 {
        self.keep_alive_timeout
            .clamp(MIN_KEEP_ALIVE_TIMEOUT, MAX_KEEP_ALIVE_TIMEOUT)
            * 1_000_000
    }

    /// Multiplier applied to luma sample count: 2 bytes per sample above 8 bits.
    #[must_use]
    pub fn bit_depth_factor(&self) -> usize {
        if self.bit_depth > 8 {
            2
        } else {
            1
        }
    }
}

/// Round `len` up to the device page alignment.
#[must_use]
pub fn align_to_page(len: usize) -> usize {
    len.div_ceil(MEM_PAGE_ALIGNMENT) * MEM_PAGE_ALIGNMENT
}
