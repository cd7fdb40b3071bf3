use crate::byte_source::ByteSource;

/// Receive FIFO
///
/// Fixed size byte FIFO intended to sit between an interrupt-driven receiver and the command
/// channel. The interrupt side appends with [`FifoBuffer::extend`] or [`FifoBuffer::push`], the
/// foreground side drains it through its [`ByteSource`] implementation. When shared between the
/// two, wrap it in a `critical_section::Mutex<RefCell<_>>`.
pub struct FifoBuffer<const BUF_SIZE: usize> {
    buffer: [u8; BUF_SIZE],
    used: usize,
}

impl<const BUF_SIZE: usize> FifoBuffer<BUF_SIZE> {
    /// Creates a new buffer
    ///
    /// This is declared const, allowing it to be used even in `static const` contexts.
    pub const fn new() -> Self {
        FifoBuffer {
            buffer: [0u8; BUF_SIZE],
            used: 0,
        }
    }

    /// Checks for buffer emptiness
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Return length of currently stored buffer
    pub fn len(&self) -> usize {
        self.used
    }

    /// Remaining free space in bytes
    pub fn free(&self) -> usize {
        BUF_SIZE - self.used
    }

    /// Return mutable slice to the non-filled part of the buffer
    pub fn receive_buffer(&mut self) -> &mut [u8] {
        &mut self.buffer[self.used..]
    }

    /// Appends a single byte, returning `false` if the buffer is full
    pub fn push(&mut self, byte: u8) -> bool {
        if self.used == BUF_SIZE {
            return false;
        }
        self.buffer[self.used] = byte;
        self.used += 1;
        true
    }

    /// Append as much of `buf` as fits, returning the number of bytes taken
    ///
    /// A serial receiver that overruns loses the tail of the burst, the protocol's resend
    /// mechanism recovers the affected line.
    pub fn extend(&mut self, buf: &[u8]) -> usize {
        let into = self.receive_buffer();
        let n = buf.len().min(into.len());
        into[..n].copy_from_slice(&buf[..n]);
        self.used += n;
        n
    }

    /// Moves the used cursor forward
    ///
    /// This can be used after filling part of the non-filled buffer returned by `receive_buffer`.
    pub fn advance(&mut self, n: usize) {
        self.used = (self.used + n).clamp(0, self.buffer.len());
    }

    /// Returns the filled part of the buffer
    pub fn data(&self) -> &[u8] {
        &self.buffer[0..self.used]
    }

    /// Removes `n` bytes from the front of the buffer
    ///
    /// This operation moves the used part of the buffer down in memory. This is linear in the
    /// number of bytes currently stored.
    pub fn pop(&mut self, n: usize) {
        let n = n.clamp(0, self.used);
        let remain = n..self.used;
        let len = remain.len();
        self.buffer.copy_within(remain, 0);
        self.used = len;
    }

    /// Drops everything currently stored
    pub fn clear(&mut self) {
        self.used = 0;
    }
}

impl<const BUF_SIZE: usize> Default for FifoBuffer<BUF_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const BUF_SIZE: usize> ByteSource for FifoBuffer<BUF_SIZE> {
    fn next_byte(&mut self) -> Option<u8> {
        let b = *self.data().first()?;
        self.pop(1);
        Some(b)
    }

    fn available(&self) -> usize {
        self.used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_arrival_order() {
        let mut fifo = FifoBuffer::<8>::new();
        assert_eq!(fifo.extend(b"G28\n"), 4);
        assert!(fifo.push(b'M'));
        let mut out = Vec::new();
        while let Some(b) = fifo.next_byte() {
            out.push(b);
        }
        assert_eq!(out, b"G28\nM");
        assert!(fifo.is_empty());
    }

    #[test]
    fn overrun_keeps_head_of_burst() {
        let mut fifo = FifoBuffer::<4>::new();
        assert_eq!(fifo.extend(b"G1 X10"), 4);
        assert_eq!(fifo.data(), b"G1 X");
        assert!(!fifo.push(b'1'));
        assert_eq!(fifo.free(), 0);
    }
}
