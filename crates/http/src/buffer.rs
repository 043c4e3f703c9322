//! Reusable byte buffers owned by a single connection.
//!
//! [`GrowableBuffer`] behaves like a position/limit byte buffer: bytes are appended at the
//! end, consumed from the front and the logical capacity either doubles on demand (line
//! accumulation, TLS network and application buffers) or stays fixed (the body sink,
//! whose limit is set to exactly the request's content-length). The logical capacity is only
//! a bound: memory behind it is committed as bytes are written.
//!
//! Buffers are not shared between threads; the connection that owns them resets them
//! between requests instead of allocating new ones.

use bytes::{Bytes, BytesMut};
use std::io;
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    #[error("buffer capacity exceeded: {requested} bytes requested, {remaining} remaining")]
    CapacityExceeded { requested: usize, remaining: usize },

    #[error("buffer cannot grow to {requested} bytes, the maximum is {max_capacity}")]
    OutOfMemory { requested: usize, max_capacity: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Growth {
    Fixed,
    Doubling { max_capacity: usize },
}

/// A byte buffer with a logical capacity that is either fixed or grows by doubling.
#[derive(Debug)]
pub struct GrowableBuffer {
    buf: Vec<u8>,
    len: usize,
    limit: usize,
    initial_capacity: usize,
    growth: Growth,
}

impl GrowableBuffer {
    pub const DEFAULT_MAX_CAPACITY: usize = 64 * 1024 * 1024;

    /// Creates a buffer that doubles its capacity up to [`Self::DEFAULT_MAX_CAPACITY`].
    pub fn growable(initial_capacity: usize) -> Self {
        Self::growable_with_max(initial_capacity, Self::DEFAULT_MAX_CAPACITY)
    }

    /// Creates a buffer that doubles its capacity up to `max_capacity`.
    pub fn growable_with_max(initial_capacity: usize, max_capacity: usize) -> Self {
        Self::with_growth(initial_capacity, Growth::Doubling { max_capacity: max_capacity.max(initial_capacity) })
    }

    /// Creates a buffer whose capacity only changes through [`Self::set_limit`].
    pub fn fixed(capacity: usize) -> Self {
        Self::with_growth(capacity, Growth::Fixed)
    }

    fn with_growth(initial_capacity: usize, growth: Growth) -> Self {
        Self { buf: vec![0; initial_capacity], len: 0, limit: initial_capacity, initial_capacity, growth }
    }

    /// Appends `bytes`, growing a doubling buffer when needed.
    ///
    /// A fixed buffer that cannot hold all of `bytes` is left untouched and
    /// [`BufferError::CapacityExceeded`] is returned.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        let required = self.len.checked_add(bytes.len()).ok_or(BufferError::OutOfMemory {
            requested: usize::MAX,
            max_capacity: self.max_capacity(),
        })?;

        if required > self.limit {
            self.ensure_capacity(required, bytes.len())?;
        }

        self.commit(required);
        self.buf[self.len..required].copy_from_slice(bytes);
        self.len = required;
        Ok(())
    }

    /// Appends as many bytes as fit without growing and returns how many were written.
    pub fn write_partial(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.remaining());
        self.commit(self.len + n);
        self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
        n
    }

    fn ensure_capacity(&mut self, required: usize, requested: usize) -> Result<(), BufferError> {
        match self.growth {
            Growth::Fixed => Err(BufferError::CapacityExceeded { requested, remaining: self.remaining() }),
            Growth::Doubling { max_capacity } => {
                if required > max_capacity {
                    return Err(BufferError::OutOfMemory { requested: required, max_capacity });
                }

                let mut capacity = self.limit.max(1);
                while capacity < required {
                    capacity = capacity.saturating_mul(2);
                }
                self.resize(capacity.min(max_capacity));
                Ok(())
            }
        }
    }

    /// Grows the capacity to at least `capacity`; never shrinks.
    pub fn grow_to(&mut self, capacity: usize) -> Result<(), BufferError> {
        if capacity <= self.limit {
            return Ok(());
        }
        if let Growth::Doubling { max_capacity } = self.growth
            && capacity > max_capacity
        {
            return Err(BufferError::OutOfMemory { requested: capacity, max_capacity });
        }
        self.resize(capacity);
        Ok(())
    }

    /// Sets the capacity to exactly `limit`, keeping already written bytes that still fit.
    ///
    /// Nothing is allocated up front; the backing memory follows the written bytes.
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
        self.len = self.len.min(limit);
    }

    fn resize(&mut self, capacity: usize) {
        self.limit = capacity;
    }

    /// Makes the first `end` bytes addressable, at least doubling the allocation when it grows.
    fn commit(&mut self, end: usize) {
        if end > self.buf.len() {
            let target = end.max(self.buf.len().saturating_mul(2)).min(self.limit.max(end));
            self.buf.resize(target, 0);
        }
    }

    fn max_capacity(&self) -> usize {
        match self.growth {
            Growth::Fixed => self.limit,
            Growth::Doubling { max_capacity } => max_capacity,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.limit
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.limit - self.len
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len >= self.limit
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// The writable tail between the written bytes and the capacity.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        self.commit(self.limit);
        &mut self.buf[self.len..self.limit]
    }

    /// Marks `n` bytes of [`Self::spare_mut`] as written.
    pub fn advance(&mut self, n: usize) {
        self.len = (self.len + n).min(self.limit);
    }

    /// Drops the first `n` written bytes, moving the rest to the front.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.len);
        self.buf.copy_within(n..self.len, 0);
        self.len -= n;
    }

    /// Fills the spare capacity from `reader` with a single `read` call.
    pub fn read_from<R: io::Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<usize> {
        if self.remaining() == 0 {
            return Ok(0);
        }
        let n = reader.read(self.spare_mut())?;
        self.advance(n);
        Ok(n)
    }

    /// Returns exactly the written bytes.
    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_slice())
    }

    /// Returns the written bytes and empties the buffer, keeping its capacity.
    pub fn take(&mut self) -> Bytes {
        let bytes = self.snapshot();
        self.len = 0;
        bytes
    }

    /// Empties the buffer, keeping its capacity.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Empties the buffer and restores the initial capacity.
    ///
    /// The backing allocation is only replaced when it grew beyond the initial capacity.
    pub fn reset(&mut self) {
        self.len = 0;
        self.limit = self.initial_capacity;
        if self.buf.len() > self.initial_capacity {
            self.buf = vec![0; self.initial_capacity];
        }
    }
}

/// Reads once from `reader` into at most `chunk` bytes appended to `dst`.
pub(crate) fn read_into<R: io::Read + ?Sized>(reader: &mut R, dst: &mut BytesMut, chunk: usize) -> io::Result<usize> {
    let start = dst.len();
    dst.resize(start + chunk.max(1), 0);
    let result = reader.read(&mut dst[start..]);
    let read = result.as_ref().map_or(0, |n| *n);
    dst.truncate(start + read);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growable_buffer_doubles() {
        let mut buffer = GrowableBuffer::growable(4);
        buffer.write(b"hello world").unwrap();

        assert_eq!(buffer.capacity(), 16);
        assert_eq!(buffer.as_slice(), b"hello world");
        assert_eq!(buffer.snapshot(), Bytes::from_static(b"hello world"));
    }

    #[test]
    fn growable_buffer_respects_max() {
        let mut buffer = GrowableBuffer::growable_with_max(4, 8);
        buffer.write(b"1234").unwrap();

        let err = buffer.write(b"12345").unwrap_err();
        assert_eq!(err, BufferError::OutOfMemory { requested: 9, max_capacity: 8 });
        assert_eq!(buffer.as_slice(), b"1234");
    }

    #[test]
    fn fixed_buffer_rejects_overflow() {
        let mut buffer = GrowableBuffer::fixed(4);
        buffer.write(b"abc").unwrap();

        let err = buffer.write(b"de").unwrap_err();
        assert_eq!(err, BufferError::CapacityExceeded { requested: 2, remaining: 1 });
        assert_eq!(buffer.write_partial(b"de"), 1);
        assert!(buffer.is_full());
        assert_eq!(buffer.as_slice(), b"abcd");
    }

    #[test]
    fn reset_restores_initial_capacity() {
        let mut buffer = GrowableBuffer::growable(2);
        buffer.write(b"abcdefgh").unwrap();
        buffer.reset();

        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), 2);

        let mut sink = GrowableBuffer::fixed(8);
        sink.set_limit(3);
        sink.write(b"xyz").unwrap();
        sink.reset();
        assert_eq!(sink.capacity(), 8);
    }

    #[test]
    fn body_limit_commits_memory_as_bytes_arrive() {
        let mut sink = GrowableBuffer::fixed(16);
        sink.set_limit(10 * 1024 * 1024);

        assert_eq!(sink.capacity(), 10 * 1024 * 1024);
        assert_eq!(sink.buf.len(), 16);

        assert_eq!(sink.write_partial(&[7; 100]), 100);
        assert!(sink.buf.len() < 1024);
        assert_eq!(sink.as_slice(), &[7; 100][..]);
        assert!(!sink.is_full());
    }

    #[test]
    fn consume_compacts() {
        let mut buffer = GrowableBuffer::fixed(8);
        buffer.write(b"abcdef").unwrap();
        buffer.consume(4);

        assert_eq!(buffer.as_slice(), b"ef");
        assert_eq!(buffer.remaining(), 6);
    }

    #[test]
    fn read_from_fills_spare() {
        let mut buffer = GrowableBuffer::fixed(4);
        let mut reader: &[u8] = b"abcdef";

        assert_eq!(buffer.read_from(&mut reader).unwrap(), 4);
        assert_eq!(buffer.read_from(&mut reader).unwrap(), 0);
        assert_eq!(buffer.as_slice(), b"abcd");
    }
}
