//! Bounded byte ring shared by the producer (writer) and consumer (reader).
//!
//! Cursors are absolute stream offsets, so the buffer doubles as a
//! seekable stream: while a mark is set, the reader may rewind anywhere
//! between the mark and the write cursor, and the writer blocks instead of
//! overwriting marked bytes. `close()` wakes every waiter; afterwards reads
//! drain what is left and then return 0, writes fail with
//! [`BufferError::Closed`].

use std::io::SeekFrom;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::error::BufferError;

pub struct RingBuffer {
    capacity: usize,
    inner: Mutex<Inner>,
    readable: Condvar,
    writable: Condvar,
}

struct Inner {
    data: Vec<u8>,
    /// Total bytes ever written
    write_pos: u64,
    /// Absolute offset of the next byte to read
    read_pos: u64,
    mark: Option<u64>,
    closed: bool,
}

impl Inner {
    /// Oldest byte that must not be overwritten.
    fn floor(&self) -> u64 {
        match self.mark {
            Some(mark) => mark.min(self.read_pos),
            None => self.read_pos,
        }
    }

    fn free(&self, capacity: usize) -> usize {
        capacity - (self.write_pos - self.floor()) as usize
    }

    fn readable(&self) -> usize {
        (self.write_pos - self.read_pos) as usize
    }
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be positive");
        Self {
            capacity,
            inner: Mutex::new(Inner {
                data: vec![0u8; capacity],
                write_pos: 0,
                read_pos: 0,
                mark: None,
                closed: false,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy all of `bytes` in, blocking while full.
    ///
    /// Fails with [`BufferError::Closed`] if the buffer is (or becomes)
    /// closed; bytes accepted before the close stay readable.
    pub fn write(&self, mut bytes: &[u8]) -> Result<(), BufferError> {
        let mut inner = self.inner.lock();
        while !bytes.is_empty() {
            if inner.closed {
                return Err(BufferError::Closed);
            }
            let free = inner.free(self.capacity);
            if free == 0 {
                trace!("ring buffer full, writer waiting");
                self.writable.wait(&mut inner);
                continue;
            }

            let n = free.min(bytes.len());
            let start = (inner.write_pos % self.capacity as u64) as usize;
            let first = n.min(self.capacity - start);
            inner.data[start..start + first].copy_from_slice(&bytes[..first]);
            inner.data[..n - first].copy_from_slice(&bytes[first..n]);
            inner.write_pos += n as u64;
            bytes = &bytes[n..];
            self.readable.notify_all();
        }
        Ok(())
    }

    /// Read at least one byte, blocking while empty. Returns 0 only once
    /// the buffer is closed and drained.
    pub fn read(&self, into: &mut [u8]) -> usize {
        if into.is_empty() {
            return 0;
        }
        let mut inner = self.inner.lock();
        loop {
            let available = inner.readable();
            if available > 0 {
                let n = available.min(into.len());
                let start = (inner.read_pos % self.capacity as u64) as usize;
                let first = n.min(self.capacity - start);
                into[..first].copy_from_slice(&inner.data[start..start + first]);
                into[first..n].copy_from_slice(&inner.data[..n - first]);
                inner.read_pos += n as u64;
                self.writable.notify_all();
                return n;
            }
            if inner.closed {
                return 0;
            }
            self.readable.wait(&mut inner);
        }
    }

    /// Move the read cursor inside `[mark or read cursor, write cursor]`.
    pub fn seek(&self, pos: SeekFrom) -> Result<u64, BufferError> {
        let mut inner = self.inner.lock();
        let requested: i128 = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => inner.read_pos as i128 + delta as i128,
            SeekFrom::End(delta) => inner.write_pos as i128 + delta as i128,
        };
        let low = inner.floor();
        let high = inner.write_pos;
        if requested < low as i128 || requested > high as i128 {
            return Err(BufferError::SeekOutOfRange {
                requested,
                low,
                high,
            });
        }
        inner.read_pos = requested as u64;
        // Seeking forward releases space when no mark pins it.
        self.writable.notify_all();
        Ok(inner.read_pos)
    }

    /// Pin the current read position; nothing from here on is overwritten
    /// until [`clear_mark`](Self::clear_mark).
    pub fn set_mark(&self) {
        let mut inner = self.inner.lock();
        inner.mark = Some(inner.read_pos);
        debug!(mark = inner.read_pos, "ring buffer mark set");
    }

    pub fn clear_mark(&self) {
        let mut inner = self.inner.lock();
        if inner.mark.take().is_some() {
            debug!(position = inner.read_pos, "ring buffer mark cleared");
        }
        self.writable.notify_all();
    }

    pub fn mark(&self) -> Option<u64> {
        self.inner.lock().mark
    }

    pub fn rewind_to_mark(&self) -> Result<u64, BufferError> {
        let mark = self.mark().ok_or(BufferError::NoMark)?;
        self.seek(SeekFrom::Start(mark))
    }

    /// Absolute offset of the read cursor.
    pub fn position(&self) -> u64 {
        self.inner.lock().read_pos
    }

    pub fn read_available(&self) -> usize {
        self.inner.lock().readable()
    }

    pub fn write_available(&self) -> usize {
        self.inner.lock().free(self.capacity)
    }

    /// Idempotent; wakes every blocked reader and writer.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if !inner.closed {
            inner.closed = true;
            debug!(
                readable = inner.readable(),
                written = inner.write_pos,
                "ring buffer closed"
            );
        }
        self.readable.notify_all();
        self.writable.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}
