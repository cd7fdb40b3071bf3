/// Trait representing a producer of command bytes
///
/// Implemented by the interrupt-fed receive buffer as well as by in-memory sources. Bytes are
/// pulled one at a time so the channel can stop consuming the moment its queue fills up.
pub trait ByteSource {
    /// Take the next byte, if one is ready
    fn next_byte(&mut self) -> Option<u8>;
    /// Number of bytes ready to be taken without waiting
    fn available(&self) -> usize;
}

/// A sequential source that is replayed from storage
///
/// Replay sources are trusted: lines read from them are never sequence checked or checksummed.
pub trait ReplaySource: ByteSource {
    /// True once every byte of the source has been consumed
    fn is_eof(&self) -> bool;
}

/// A `ByteSource` implementation wrapping a slice
pub struct SliceSource<'a> {
    buffer: &'a [u8],
}

impl<'a> SliceSource<'a> {
    /// Create a new `SliceSource` backed by an input byte slice
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer }
    }

    /// The bytes not yet consumed
    pub fn remaining(&self) -> &'a [u8] {
        self.buffer
    }
}

impl<'a> ByteSource for SliceSource<'a> {
    fn next_byte(&mut self) -> Option<u8> {
        let (first, rest) = self.buffer.split_first()?;
        self.buffer = rest;
        Some(*first)
    }

    fn available(&self) -> usize {
        self.buffer.len()
    }
}

impl<'a> ReplaySource for SliceSource<'a> {
    fn is_eof(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(any(test, feature = "std"))]
impl ByteSource for std::collections::VecDeque<u8> {
    fn next_byte(&mut self) -> Option<u8> {
        self.pop_front()
    }

    fn available(&self) -> usize {
        self.len()
    }
}
