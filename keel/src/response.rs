use core::fmt;

/// Trait representing the capability to emit protocol response lines
///
/// Each call to `output` produces exactly one line. The callback receives an empty
/// [`fmt::Write`] sink to fill with the line's text, without a terminator; the implementation
/// decides how the finished line is framed and transmitted.
pub trait ResponseOutput {
    /// The type of sink that will be provided to the caller
    type Output: fmt::Write;

    /// Request output of a response line
    fn output(&self, f: impl FnOnce(&mut Self::Output));
}

impl<T> ResponseOutput for &T
where
    T: ResponseOutput,
{
    type Output = T::Output;
    fn output(&self, f: impl FnOnce(&mut Self::Output)) {
        (*self).output(f)
    }
}

/// Emits one formatted response line on a [`ResponseOutput`]
///
/// ```ignore
/// respond!(output, "Resend:{}", next);
/// ```
#[macro_export]
macro_rules! respond {
    ($out:expr, $($arg:tt)*) => {
        $crate::ResponseOutput::output(&$out, |o| {
            let _ = ::core::fmt::Write::write_fmt(o, ::core::format_args!($($arg)*));
        })
    };
}

/// A scratch pad line buffer
///
/// Uses a statically sized inlined buffer. Text past `MAX_SIZE` bytes is truncated, the line is
/// still emitted.
pub struct ScratchOutput<const MAX_SIZE: usize = 96> {
    buffer: [u8; MAX_SIZE],
    idx: usize,
}

impl<const MAX_SIZE: usize> ScratchOutput<MAX_SIZE> {
    /// Retrieve the currently built line
    pub fn result(&self) -> &[u8] {
        &self.buffer[..self.idx]
    }

    /// Reset the buffer, clearing it
    pub fn reset(&mut self) {
        self.idx = 0;
    }

    /// Create a new buffer
    pub const fn new() -> Self {
        Self {
            buffer: [0u8; MAX_SIZE],
            idx: 0,
        }
    }
}

impl<const MAX_SIZE: usize> Default for ScratchOutput<MAX_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const MAX_SIZE: usize> fmt::Write for ScratchOutput<MAX_SIZE> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let area = &mut self.buffer[self.idx..];
        let len = s.len().min(area.len());
        area[..len].copy_from_slice(&s.as_bytes()[..len]);
        self.idx += len;
        Ok(())
    }
}

/// Collects response lines in memory
#[cfg(any(test, feature = "std"))]
impl ResponseOutput for core::cell::RefCell<std::vec::Vec<std::string::String>> {
    type Output = std::string::String;
    fn output(&self, f: impl FnOnce(&mut Self::Output)) {
        let mut line = std::string::String::new();
        f(&mut line);
        self.borrow_mut().push(line);
    }
}
