//! Bounded ring buffer used for execution output capture.
//!
//! Writes never fail and never block: when the buffer is full the oldest
//! bytes are discarded so the most recent output always survives.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

/// Fixed-capacity byte ring. Overflow discards from the front.
#[derive(Debug)]
pub struct RingBuffer {
    buf: VecDeque<u8>,
    capacity: usize,
    discarded: u64,
}

impl RingBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity: capacity.max(1),
            discarded: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Total bytes dropped to make room since the last `clear`.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.discarded = 0;
    }

    /// Append bytes, evicting the oldest content on overflow. If the chunk
    /// alone exceeds capacity only its tail is kept.
    pub fn push(&mut self, data: &[u8]) {
        let data = if data.len() > self.capacity {
            self.discarded += (data.len() - self.capacity) as u64;
            &data[data.len() - self.capacity..]
        } else {
            data
        };

        let overflow = (self.buf.len() + data.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.buf.drain(..overflow);
            self.discarded += overflow as u64;
        }
        self.buf.extend(data);
    }

    /// Copy of the current contents, oldest byte first.
    pub fn contents(&self) -> Vec<u8> {
        self.buf.iter().copied().collect()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl io::Write for RingBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.push(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Cloneable handle to a ring buffer shared between an execution and the
/// tasks copying subprocess/provider output into it.
#[derive(Debug, Clone)]
pub struct SharedBuffer {
    inner: Arc<Mutex<RingBuffer>>,
}

impl SharedBuffer {
    pub fn new(buffer: RingBuffer) -> Self {
        Self {
            inner: Arc::new(Mutex::new(buffer)),
        }
    }

    pub fn write(&self, data: &[u8]) {
        self.inner.lock().push(data);
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().contents()
    }

    pub fn to_string_lossy(&self) -> String {
        self.inner.lock().to_string_lossy()
    }

    /// Reclaim the underlying buffer if this is the last handle; used to
    /// return capture buffers to the pool after a run completes.
    pub fn try_take(self) -> Option<RingBuffer> {
        Arc::try_unwrap(self.inner).ok().map(|m| m.into_inner())
    }
}
