// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, Mutex};

use bytes::BytesMut;

/// Default size of a single relay buffer in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Fixed-size free list of relay buffers.
///
/// Every buffer a session or resolver touches comes from here, so the
/// steady-state memory of the proxy is capped at
/// `2 * max_sessions * buffer_size` regardless of load. `alloc` fails when
/// the list is empty; callers treat that as a hard error and tear the
/// session down.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    buffer_size: usize,
}

impl BufferPool {
    /// Pre-allocates `count` buffers of `buffer_size` bytes each.
    pub fn new(count: usize, buffer_size: usize) -> Arc<Self> {
        let free = (0..count).map(|_| BytesMut::zeroed(buffer_size)).collect();
        Arc::new(Self {
            free: Mutex::new(free),
            buffer_size,
        })
    }

    /// Takes a buffer from the free list, or `None` if the pool is
    /// exhausted. The returned guard gives the buffer back on drop.
    pub fn alloc(self: &Arc<Self>) -> Option<PooledBuffer> {
        let data = self.free.lock().ok()?.pop()?;
        Some(PooledBuffer {
            data: Some(data),
            offset: 0,
            length: 0,
            pool: Arc::clone(self),
        })
    }

    fn release(&self, data: BytesMut) {
        if let Ok(mut free) = self.free.lock() {
            free.push(data);
        }
    }

    /// Number of buffers currently sitting in the free list.
    pub fn available(&self) -> usize {
        self.free.lock().map(|f| f.len()).unwrap_or(0)
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

/// A pool buffer with the `offset`/`length` window the I/O loops drive.
///
/// `offset` is the next byte of interest inside `data`, `length` the number
/// of bytes still to transfer; `offset + length` never exceeds the buffer
/// capacity. The backing storage returns to its pool when the guard drops,
/// on every path.
#[derive(Debug)]
pub struct PooledBuffer {
    data: Option<BytesMut>,
    pub offset: usize,
    pub length: usize,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    pub fn capacity(&self) -> usize {
        self.buf().len()
    }

    /// Repositions the window. `offset + length` must stay within capacity.
    pub fn set_window(&mut self, offset: usize, length: usize) {
        debug_assert!(offset + length <= self.capacity());
        self.offset = offset;
        self.length = length;
    }

    /// Consumes `size` bytes from the front of the window.
    pub fn advance(&mut self, size: usize) {
        debug_assert!(size <= self.length);
        self.offset += size;
        self.length -= size;
    }

    /// The current window, `data[offset..offset + length]`.
    pub fn window(&self) -> &[u8] {
        let (offset, length) = (self.offset, self.length);
        &self.buf()[offset..offset + length]
    }

    pub fn window_mut(&mut self) -> &mut [u8] {
        let (offset, length) = (self.offset, self.length);
        &mut self.buf_mut()[offset..offset + length]
    }

    /// Everything accumulated so far, `data[..upto]`.
    pub fn filled(&self, upto: usize) -> &[u8] {
        &self.buf()[..upto]
    }

    /// The whole backing slice, window cursors ignored.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.buf_mut()
    }

    fn buf(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    fn buf_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.release(data);
        }
    }
}
