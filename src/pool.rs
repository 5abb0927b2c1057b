//! Pool of decoder output buffers.
//!
//! Raw frame size depends on the output resolution, which a decoder only learns
//! from the device after the first data arrives, so the pool is created lazily
//! and resized when the stream resolution changes. Buffers handed out by the
//! pool find their way back when dropped.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::XcoderError;
use crate::Result;

/// Buffers allocated when the pool is created.
pub const POOL_SIZE_INIT: usize = 20;
/// Buffers added each time the pool runs dry.
pub const POOL_SIZE_EXPAND: usize = 20;

/// Allocate a zeroed buffer, reporting allocation failure instead of aborting.
pub(crate) fn alloc_buffer(size: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(size)
        .map_err(|e| XcoderError::mem_alloc(format!("{size} bytes: {e}")))?;
    buf.resize(size, 0);
    Ok(buf)
}

struct PoolState {
    buffer_size: usize,
    generation: u64,
    free: Vec<Vec<u8>>,
    allocated: usize,
}

struct PoolInner {
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn give_back(&self, data: Vec<u8>, generation: u64) {
        let mut state = self.state.lock();
        if state.generation == generation && data.len() == state.buffer_size {
            state.free.push(data);
        }
    }
}

/// Shared pool of equally sized frame buffers.
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

impl FramePool {
    /// Create a pool with [`POOL_SIZE_INIT`] buffers of `buffer_size` bytes.
    pub fn new(buffer_size: usize) -> Result<Self> {
        let pool = Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    buffer_size,
                    generation: 0,
                    free: Vec::new(),
                    allocated: 0,
                }),
            }),
        };
        pool.expand(POOL_SIZE_INIT)?;
        debug!("frame pool created: {} x {} bytes", POOL_SIZE_INIT, buffer_size);
        Ok(pool)
    }

    fn expand(&self, count: usize) -> Result<()> {
        let mut state = self.inner.state.lock();
        let size = state.buffer_size;
        for _ in 0..count {
            let buf = alloc_buffer(size)?;
            state.free.push(buf);
            state.allocated += 1;
        }
        Ok(())
    }

    /// Size of every buffer in the pool.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.inner.state.lock().buffer_size
    }

    /// Buffers currently waiting in the pool.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.state.lock().free.len()
    }

    /// Buffers allocated for the current size, in the pool or in use.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.inner.state.lock().allocated
    }

    /// Take a buffer, growing the pool by [`POOL_SIZE_EXPAND`] when empty.
    pub fn acquire(&self) -> Result<FrameBuffer> {
        let popped = {
            let mut state = self.inner.state.lock();
            let generation = state.generation;
            state.free.pop().map(|data| (data, generation))
        };
        let (data, generation) = match popped {
            Some(found) => found,
            None => {
                trace!("frame pool empty, expanding by {}", POOL_SIZE_EXPAND);
                self.expand(POOL_SIZE_EXPAND)?;
                let mut state = self.inner.state.lock();
                let data = state
                    .free
                    .pop()
                    .ok_or_else(|| XcoderError::mem_alloc("frame pool exhausted"))?;
                (data, state.generation)
            }
        };
        Ok(FrameBuffer {
            data,
            home: Some((Arc::downgrade(&self.inner), generation)),
        })
    }

    /// Switch the pool to a new buffer size.
    ///
    /// Free buffers of the old size are released; buffers still in use are
    /// released when they come back.
    pub fn resize(&self, buffer_size: usize) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.buffer_size == buffer_size {
                return Ok(());
            }
            debug!(
                "frame pool resize {} -> {} bytes",
                state.buffer_size, buffer_size
            );
            state.buffer_size = buffer_size;
            state.generation += 1;
            state.free.clear();
            state.allocated = 0;
        }
        self.expand(POOL_SIZE_INIT)
    }
}

/// A frame buffer, either borrowed from a [`FramePool`] or owned outright.
pub struct FrameBuffer {
    data: Vec<u8>,
    home: Option<(Weak<PoolInner>, u64)>,
}

impl FrameBuffer {
    /// Wrap memory that does not belong to any pool.
    #[must_use]
    pub fn detached(data: Vec<u8>) -> Self {
        Self { data, home: None }
    }

    /// Whether the buffer returns to a pool when dropped.
    #[must_use]
    pub fn is_pooled(&self) -> bool {
        self.home.is_some()
    }
}

impl Deref for FrameBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for FrameBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("len", &self.data.len())
            .field("pooled", &self.is_pooled())
            .finish()
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        if let Some((home, generation)) = self.home.take() {
            if let Some(inner) = home.upgrade() {
                inner.give_back(std::mem::take(&mut self.data), generation);
            }
        }
    }
}
