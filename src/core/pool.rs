use std::io::Write;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::util::lock_unpoisoned;

pub const DEFAULT_POOL_MAX_BYTES: usize = 4096;

/// Size-bucketed free list of byte buffers, reused for copying streamed
/// response bodies. Buffers are kept sorted by capacity ascending; the
/// oldest buffers are evicted first once the pooled total exceeds the cap.
///
/// A buffer is owned by exactly one caller between `get_buf` and
/// `return_buf`; the pool never hands the same buffer out twice.
pub struct ByteArrayPool {
    state: Mutex<PoolState>,
    max_size: usize,
}

struct PoolState {
    /// Sorted by buffer length ascending.
    buffers: Vec<PooledBuffer>,
    current_size: usize,
    tick: u64,
}

struct PooledBuffer {
    data: Vec<u8>,
    stamp: u64,
}

impl ByteArrayPool {
    pub fn new(max_size: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                buffers: Vec::new(),
                current_size: 0,
                tick: 0,
            }),
            max_size,
        }
    }

    /// Returns the smallest pooled buffer with length >= `len`, or a fresh
    /// zeroed allocation of exactly `len`. Pooled buffers come back with
    /// stale contents; callers treat them as scratch.
    pub fn get_buf(&self, len: usize) -> Vec<u8> {
        let mut state = lock_unpoisoned(&self.state);
        let index = state.buffers.partition_point(|entry| entry.data.len() < len);
        if index < state.buffers.len() {
            let entry = state.buffers.remove(index);
            state.current_size -= entry.data.len();
            return entry.data;
        }
        vec![0; len]
    }

    /// Re-inserts a buffer by length. Buffers larger than the pool cap are
    /// discarded; excess pooled bytes are evicted oldest-first.
    pub fn return_buf(&self, buf: Vec<u8>) {
        if buf.is_empty() || buf.len() > self.max_size {
            return;
        }
        let mut state = lock_unpoisoned(&self.state);
        state.tick += 1;
        let stamp = state.tick;
        let index = state
            .buffers
            .partition_point(|entry| entry.data.len() < buf.len());
        state.current_size += buf.len();
        state.buffers.insert(index, PooledBuffer { data: buf, stamp });
        self.trim(&mut state);
    }

    fn trim(&self, state: &mut PoolState) {
        while state.current_size > self.max_size {
            let Some(oldest) = state
                .buffers
                .iter()
                .enumerate()
                .min_by_key(|(_, entry)| entry.stamp)
                .map(|(index, _)| index)
            else {
                break;
            };
            let evicted = state.buffers.remove(oldest);
            state.current_size -= evicted.data.len();
        }
    }

    /// Total bytes currently held by the pool.
    pub fn pooled_bytes(&self) -> usize {
        lock_unpoisoned(&self.state).current_size
    }
}

/// Growable byte sink whose storage is rented from a [`ByteArrayPool`].
/// Growth rents the next power of two above the required size, copies, and
/// returns the old buffer; the live buffer goes back to the pool on drop.
pub struct PooledByteSink {
    pool: Arc<ByteArrayPool>,
    buffer: Vec<u8>,
    count: usize,
}

impl PooledByteSink {
    pub fn new(pool: Arc<ByteArrayPool>) -> Self {
        Self::with_size_hint(pool, 256)
    }

    pub fn with_size_hint(pool: Arc<ByteArrayPool>, size_hint: usize) -> Self {
        let buffer = pool.get_buf(size_hint.max(1));
        Self {
            pool,
            buffer,
            count: 0,
        }
    }

    fn ensure_capacity(&mut self, additional: usize) {
        let required = self.count + additional;
        if required <= self.buffer.len() {
            return;
        }
        let mut grown = self.pool.get_buf(required.next_power_of_two());
        grown[..self.count].copy_from_slice(&self.buffer[..self.count]);
        let previous = std::mem::replace(&mut self.buffer, grown);
        self.pool.return_buf(previous);
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Independent copy of the written bytes.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buffer[..self.count])
    }
}

impl Write for PooledByteSink {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.ensure_capacity(data.len());
        self.buffer[self.count..self.count + data.len()].copy_from_slice(data);
        self.count += data.len();
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for PooledByteSink {
    fn drop(&mut self) {
        self.pool.return_buf(std::mem::take(&mut self.buffer));
    }
}
