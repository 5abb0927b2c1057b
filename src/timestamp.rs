//! Timestamp bookkeeping between submitted input and returned output.
//!
//! The decoder never learns which packet a frame was decoded from. It only
//! reports the byte offset of that packet in the input stream, so every
//! written packet records the offset range it covered together with its PTS
//! in an [`OffsetFifo`]. DTS values travel through a [`TimestampQueue`] in
//! submission order, and [`PtsCorrection`] picks the more trustworthy of the
//! two streams when either one regresses.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{trace, warn};

/// Timestamp value meaning "unknown".
pub const NOPTS_VALUE: i64 = i64::MIN;

/// Slots in the packet offset FIFO.
pub const FIFO_SIZE: usize = 1024;

/// Largest frame-info distance accepted when popping a queue entry.
pub const FRAME_OFFSET_DIFF_THRESHOLD: u64 = 100;

/// Entries a timestamp queue holds before it starts dropping the oldest.
pub const MAX_QUEUE_ENTRIES: usize = 6000;

/// Frames between two sweeps for stale queue entries.
pub const CLEANUP_INTERVAL: u64 = 500;

/// Age after which an unclaimed queue entry is considered stale.
pub const STALE_ENTRY_AGE: Duration = Duration::from_secs(30);

const OFFSET_WRAP: u64 = 1 << 32;

#[derive(Debug, Clone, Copy)]
struct QueueEntry {
    frame_info: u64,
    value: i64,
    pushed_at: Instant,
}

/// Ordered queue of timestamps tagged with a frame-info key.
#[derive(Debug, Default)]
pub struct TimestampQueue {
    entries: VecDeque<QueueEntry>,
}

impl TimestampQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a timestamp, dropping the oldest entry once the queue is full.
    pub fn push(&mut self, frame_info: u64, value: i64) {
        if self.entries.len() >= MAX_QUEUE_ENTRIES {
            if let Some(dropped) = self.entries.pop_front() {
                warn!(
                    "timestamp queue full, dropping entry {} (info {})",
                    dropped.value, dropped.frame_info
                );
            }
        }
        self.entries.push_back(QueueEntry {
            frame_info,
            value,
            pushed_at: Instant::now(),
        });
    }

    /// Remove the oldest entry whose frame info lies within `threshold` of
    /// `frame_info`. A lone entry is returned regardless of its key.
    pub fn pop_threshold(&mut self, frame_info: u64, threshold: u64) -> Option<i64> {
        if self.entries.len() == 1 {
            return self.entries.pop_front().map(|e| e.value);
        }
        let pos = self
            .entries
            .iter()
            .position(|e| e.frame_info.abs_diff(frame_info) <= threshold)?;
        self.entries.remove(pos).map(|e| e.value)
    }

    /// Take back the most recently pushed entry.
    pub fn pop_newest(&mut self) -> Option<i64> {
        self.entries.pop_back().map(|e| e.value)
    }

    /// Drop entries that have waited longer than `max_age`. Returns how many
    /// were removed.
    pub fn remove_older_than(&mut self, max_age: Duration) -> usize {
        let before = self.entries.len();
        let now = Instant::now();
        self.entries
            .retain(|e| now.duration_since(e.pushed_at) <= max_age);
        let removed = before - self.entries.len();
        if removed > 0 {
            trace!("dropped {} stale timestamp entries", removed);
        }
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Ring of the input byte ranges covered by each written packet.
#[derive(Debug)]
pub struct OffsetFifo {
    pts: Vec<i64>,
    ranges: Vec<(u64, u64)>,
    sei: Vec<Option<Bytes>>,
    pkt_index: u64,
    last_pkt_sei: Option<Bytes>,
}

impl Default for OffsetFifo {
    fn default() -> Self {
        Self {
            pts: vec![NOPTS_VALUE; FIFO_SIZE],
            ranges: vec![(0, 0); FIFO_SIZE],
            sei: vec![None; FIFO_SIZE],
            pkt_index: 0,
            last_pkt_sei: None,
        }
    }
}

impl OffsetFifo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Packets recorded so far.
    #[must_use]
    pub fn packets(&self) -> u64 {
        self.pkt_index
    }

    /// Record a written packet of `size` bytes.
    ///
    /// Custom SEI goes into the packet's slot. SEI on a packet without slice
    /// data is also carried over to the next packet that has none of its own.
    pub fn record(&mut self, size: usize, pts: i64, custom_sei: Option<Bytes>, no_slice: bool) {
        let slot = (self.pkt_index % FIFO_SIZE as u64) as usize;
        let size = size as u64;
        let range = if self.pkt_index == 0 {
            (0, size.saturating_sub(1))
        } else {
            let prev = (self.pkt_index - 1) % FIFO_SIZE as u64;
            let prev_max = self.ranges[prev as usize].1;
            let mut min = prev_max;
            let mut max = prev_max + size;
            if min > u64::from(u32::MAX) {
                min -= OFFSET_WRAP;
                max = min + size;
            }
            (min, max)
        };
        self.ranges[slot] = range;
        self.pts[slot] = pts;
        self.sei[slot] = match custom_sei {
            Some(sei) => {
                self.last_pkt_sei = if no_slice { Some(sei.clone()) } else { None };
                Some(sei)
            }
            None => self.last_pkt_sei.take(),
        };
        trace!(
            "pkt {} slot {} range {}..{} pts {}",
            self.pkt_index,
            slot,
            range.0,
            range.1,
            pts
        );
        self.pkt_index += 1;
    }

    /// Slot of the packet a frame reported at `frame_offset` came from.
    ///
    /// Malformed SEI makes the device under-report offsets by the SEI size,
    /// so an offset closer to the end of a range than to its start belongs
    /// to the packet after it.
    #[must_use]
    pub fn lookup(&self, frame_offset: u64) -> Option<usize> {
        let filled = self.pkt_index.min(FIFO_SIZE as u64) as usize;
        let slot = self.ranges[..filled]
            .iter()
            .position(|&(min, max)| min <= frame_offset && frame_offset < max)?;
        let (min, max) = self.ranges[slot];
        let newest = ((self.pkt_index - 1) % FIFO_SIZE as u64) as usize;
        if frame_offset - min > max - frame_offset && slot != newest {
            let next = (slot + 1) % FIFO_SIZE;
            trace!(
                "offset {} near the end of slot {}, using slot {}",
                frame_offset,
                slot,
                next
            );
            return Some(next);
        }
        Some(slot)
    }

    #[must_use]
    pub fn pts(&self, slot: usize) -> i64 {
        self.pts.get(slot).copied().unwrap_or(NOPTS_VALUE)
    }

    /// Take the custom SEI stored for a slot.
    pub fn take_sei(&mut self, slot: usize) -> Option<Bytes> {
        self.sei.get_mut(slot).and_then(Option::take)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Chooses between PTS and DTS by counting regressions in each stream.
#[derive(Debug, Clone, Copy)]
pub struct PtsCorrection {
    last_pts: i64,
    last_dts: i64,
    faulty_pts: u32,
    faulty_dts: u32,
}

impl Default for PtsCorrection {
    fn default() -> Self {
        Self {
            last_pts: NOPTS_VALUE,
            last_dts: NOPTS_VALUE,
            faulty_pts: 0,
            faulty_dts: 0,
        }
    }
}

impl PtsCorrection {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Best presentation timestamp for a frame given its PTS and DTS.
    ///
    /// PTS wins ties and whenever DTS is missing. Otherwise DTS is used
    /// unless it would go back past `last_pts`, the previous frame's result.
    pub fn guess(&mut self, pts: i64, dts: i64, last_pts: i64) -> i64 {
        if dts != NOPTS_VALUE {
            if dts <= self.last_dts {
                self.faulty_dts += 1;
            }
            self.last_dts = dts;
        } else if pts != NOPTS_VALUE {
            self.last_dts = pts;
        }
        if pts != NOPTS_VALUE {
            if pts <= self.last_pts {
                self.faulty_pts += 1;
            }
            self.last_pts = pts;
        } else if dts != NOPTS_VALUE {
            self.last_pts = dts;
        }

        if (self.faulty_pts <= self.faulty_dts || dts == NOPTS_VALUE) && pts != NOPTS_VALUE {
            pts
        } else if last_pts == NOPTS_VALUE || dts >= last_pts {
            dts
        } else {
            pts
        }
    }

    #[must_use]
    pub fn faults(&self) -> (u32, u32) {
        (self.faulty_pts, self.faulty_dts)
    }
}
