use std::fmt;

use crate::{Error, ErrorKind, Result};

/// The role of a single binary segment inside a [`BufferDescriptor`].
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BufferKind {
    Empty = 0,
    Data = 1,
    Token = 2,
    Padding = 3,
    StreamHeader = 4,
    StreamTrailer = 5,
    Missing = 6,
    Extra = 7,
}

/// One typed binary segment. The byte storage is exclusively owned by the
/// buffer; mechanism code mutates it in place.
///
/// A `Missing` buffer holds no bytes. It states how many more transport bytes
/// are required before the failed operation can be retried.
#[derive(Clone)]
pub struct SecurityBuffer {
    kind: BufferKind,
    buffer: Vec<u8>,
    bytes_needed: usize,
}

impl SecurityBuffer {
    pub fn new(buffer: Vec<u8>, kind: BufferKind) -> Self {
        Self {
            kind,
            buffer,
            bytes_needed: 0,
        }
    }

    pub fn data(buffer: Vec<u8>) -> Self {
        Self::new(buffer, BufferKind::Data)
    }

    pub fn token(buffer: Vec<u8>) -> Self {
        Self::new(buffer, BufferKind::Token)
    }

    pub fn padding(buffer: Vec<u8>) -> Self {
        Self::new(buffer, BufferKind::Padding)
    }

    pub fn stream_header(buffer: Vec<u8>) -> Self {
        Self::new(buffer, BufferKind::StreamHeader)
    }

    pub fn stream_trailer(buffer: Vec<u8>) -> Self {
        Self::new(buffer, BufferKind::StreamTrailer)
    }

    pub fn missing(bytes_needed: usize) -> Self {
        Self {
            kind: BufferKind::Missing,
            buffer: Vec::new(),
            bytes_needed,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), BufferKind::Empty)
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// The buffer data. `Missing` and `Empty` buffers hold no data, so the
    /// empty slice is returned.
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    pub fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        &mut self.buffer
    }

    /// Moves the byte storage out, leaving an empty buffer of the same kind.
    pub fn take_data(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// Replaces the buffer contents, shrinking or growing the storage.
    pub fn write_data(&mut self, data: &[u8]) {
        self.buffer.clear();
        self.buffer.extend_from_slice(data);
    }

    /// The buffer length. For a `Missing` buffer this is the number of bytes
    /// still required.
    pub fn len(&self) -> usize {
        match self.kind {
            BufferKind::Missing => self.bytes_needed,
            _ => self.buffer.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for SecurityBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            BufferKind::Missing => write!(f, "Missing({})", self.bytes_needed),
            kind => {
                write!(f, "{:?}: 0x", kind)?;
                self.buffer.iter().try_for_each(|byte| write!(f, "{byte:02X}"))
            }
        }
    }
}

/// Ordered list of typed binary segments passed into and returned from every
/// mechanism operation.
///
/// Mechanism code may append new buffers (e.g. a trailer) and shrink or
/// retype existing ones, but caller-supplied `Data` buffers are never
/// reordered relative to each other.
#[derive(Debug, Clone, Default)]
pub struct BufferDescriptor {
    buffers: Vec<SecurityBuffer>,
}

impl BufferDescriptor {
    /// Wraps the provided buffers without copying their storage.
    pub fn describe(buffers: Vec<SecurityBuffer>) -> Self {
        Self { buffers }
    }

    pub fn empty() -> Self {
        Self { buffers: Vec::new() }
    }

    /// A descriptor holding a single `Token` buffer. The common shape for
    /// handshake input and output.
    pub fn token(bytes: Vec<u8>) -> Self {
        Self::describe(vec![SecurityBuffer::token(bytes)])
    }

    /// A descriptor holding a single `Data` buffer.
    pub fn data(bytes: Vec<u8>) -> Self {
        Self::describe(vec![SecurityBuffer::data(bytes)])
    }

    pub fn push(&mut self, buffer: SecurityBuffer) {
        self.buffers.push(buffer);
    }

    /// Removes and returns the first buffer of the requested kind.
    pub fn take(&mut self, kind: BufferKind) -> Option<SecurityBuffer> {
        let index = self.buffers.iter().position(|b| b.kind() == kind)?;
        Some(self.buffers.remove(index))
    }

    /// Returns the first buffer of the requested kind.
    pub fn find(&self, kind: BufferKind) -> Result<&SecurityBuffer> {
        self.buffers.iter().find(|b| b.kind() == kind).ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidParameter,
                format!("no buffer was provided with kind {:?}", kind),
            )
        })
    }

    /// Returns the first buffer of the requested kind, mutably.
    pub fn find_mut(&mut self, kind: BufferKind) -> Result<&mut SecurityBuffer> {
        self.buffers.iter_mut().find(|b| b.kind() == kind).ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidParameter,
                format!("no buffer was provided with kind {:?}", kind),
            )
        })
    }

    pub fn buffers_of_kind(&self, kind: BufferKind) -> impl Iterator<Item = &SecurityBuffer> {
        self.buffers.iter().filter(move |b| b.kind() == kind)
    }

    pub fn buffers_of_kind_mut(&mut self, kind: BufferKind) -> impl Iterator<Item = &mut SecurityBuffer> {
        self.buffers.iter_mut().filter(move |b| b.kind() == kind)
    }

    /// Total length over all buffers, counting a `Missing` buffer as the
    /// number of bytes it still requires.
    pub fn total_len(&self) -> usize {
        self.buffers.iter().map(|b| b.len()).sum()
    }

    /// The number of bytes still required, if a previous call reported a
    /// truncated token.
    pub fn bytes_needed(&self) -> Option<usize> {
        self.buffers
            .iter()
            .find(|b| b.kind() == BufferKind::Missing)
            .map(|b| b.len())
    }

    /// Replaces any `Missing` buffer with one stating exactly `bytes_needed`.
    pub fn set_missing(&mut self, bytes_needed: usize) {
        self.clear_missing();
        self.buffers.push(SecurityBuffer::missing(bytes_needed));
    }

    pub fn clear_missing(&mut self) {
        self.buffers.retain(|b| b.kind() != BufferKind::Missing);
    }

    pub fn iter(&self) -> impl Iterator<Item = &SecurityBuffer> {
        self.buffers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SecurityBuffer> {
        self.buffers.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

impl From<Vec<SecurityBuffer>> for BufferDescriptor {
    fn from(buffers: Vec<SecurityBuffer>) -> Self {
        Self::describe(buffers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_removes_first_of_kind() {
        let mut desc = BufferDescriptor::describe(vec![
            SecurityBuffer::data(vec![1, 2, 3]),
            SecurityBuffer::token(vec![4]),
            SecurityBuffer::token(vec![5, 6]),
        ]);

        let token = desc.take(BufferKind::Token).unwrap();
        assert_eq!(token.as_slice(), &[4]);
        assert_eq!(desc.len(), 2);
        assert!(desc.take(BufferKind::Padding).is_none());
    }

    #[test]
    fn total_len_counts_missing_bytes() {
        let mut desc = BufferDescriptor::data(vec![0; 10]);
        desc.set_missing(32);

        assert_eq!(desc.total_len(), 42);
        assert_eq!(desc.bytes_needed(), Some(32));
    }

    #[test]
    fn set_missing_replaces_previous_missing_buffer() {
        let mut desc = BufferDescriptor::token(vec![0; 4]);
        desc.set_missing(10);
        desc.set_missing(6);

        assert_eq!(desc.bytes_needed(), Some(6));
        assert_eq!(desc.buffers_of_kind(BufferKind::Missing).count(), 1);

        desc.clear_missing();
        assert_eq!(desc.bytes_needed(), None);
    }

    #[test]
    fn find_reports_invalid_parameter() {
        let desc = BufferDescriptor::empty();
        let err = desc.find(BufferKind::Data).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);
    }
}
