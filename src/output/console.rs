//! Shared console handle
//!
//! Reporters and the [`Writer`](super::Writer) print through a [`Console`]
//! instead of `std::io::stdout` directly, so output interceptors can swap the
//! sink and tests can capture it.

use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};

type Sink = Box<dyn Write + Send>;

/// Cloneable handle to a swappable output sink
#[derive(Clone)]
pub struct Console {
    sink: Arc<Mutex<Sink>>,
}

impl Console {
    pub fn new(sink: impl Write + Send + 'static) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Box::new(sink))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// A console writing into a buffer, plus the buffer for inspection
    pub fn capture() -> (Self, SharedBuffer) {
        let buffer = SharedBuffer::new();
        (Self::new(buffer.clone()), buffer)
    }

    /// Replace the sink, returning the previous one
    pub fn swap(&self, sink: Sink) -> Sink {
        std::mem::replace(&mut *self.lock(), sink)
    }

    pub fn write_bytes(&self, bytes: &[u8]) -> io::Result<()> {
        let mut sink = self.lock();
        sink.write_all(bytes)?;
        sink.flush()
    }

    pub fn print(&self, text: impl AsRef<str>) {
        // Console output is best effort; a closed stdout must not fail a run.
        let _ = self.write_bytes(text.as_ref().as_bytes());
    }

    pub fn println(&self, text: impl AsRef<str>) {
        let mut line = text.as_ref().to_string();
        line.push('\n');
        self.print(line);
    }

    fn lock(&self) -> MutexGuard<'_, Sink> {
        self.sink.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::stdout()
    }
}

impl fmt::Debug for Console {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Console")
    }
}

/// In-memory sink that can be shared between a writer and an observer
#[derive(Clone, Debug, Default)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.lock()).into_owned()
    }

    /// Return the contents and clear the buffer
    pub fn take(&self) -> String {
        let bytes = std::mem::take(&mut *self.lock());
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.bytes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture() {
        let (console, buffer) = Console::capture();
        console.println("hello");
        console.print("world");
        assert_eq!(buffer.contents(), "hello\nworld");
        assert_eq!(buffer.take(), "hello\nworld");
        assert_eq!(buffer.contents(), "");
    }

    #[test]
    fn test_swap_redirects_later_writes() {
        let (console, first) = Console::capture();
        let second = SharedBuffer::new();
        let previous = console.swap(Box::new(second.clone()));
        console.print("to second");
        console.swap(previous);
        console.print("to first");
        assert_eq!(first.contents(), "to first");
        assert_eq!(second.contents(), "to second");
    }
}
