//! Spec output writer
//!
//! Everything a spec writes through its [`Writer`] is buffered so it can be
//! attached to the spec's report. In stream-and-buffer mode (verbose, single
//! process) it is also echoed to the console immediately. Parallel processes
//! always buffer so their output does not interleave on the shared console.

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::Console;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriterMode {
    StreamAndBuffer,
    BufferOnly,
}

impl WriterMode {
    fn as_u8(self) -> u8 {
        match self {
            WriterMode::StreamAndBuffer => 0,
            WriterMode::BufferOnly => 1,
        }
    }

    fn from_u8(value: u8) -> Self {
        if value == 0 {
            WriterMode::StreamAndBuffer
        } else {
            WriterMode::BufferOnly
        }
    }
}

pub struct Writer {
    mode: AtomicU8,
    buffer: Mutex<Vec<u8>>,
    console: Console,
    tees: Mutex<Vec<Box<dyn Write + Send>>>,
}

impl Writer {
    pub fn new(console: Console) -> Self {
        Self {
            mode: AtomicU8::new(WriterMode::StreamAndBuffer.as_u8()),
            buffer: Mutex::new(Vec::new()),
            console,
            tees: Mutex::new(Vec::new()),
        }
    }

    pub fn set_mode(&self, mode: WriterMode) {
        self.mode.store(mode.as_u8(), Ordering::SeqCst);
    }

    pub fn mode(&self) -> WriterMode {
        WriterMode::from_u8(self.mode.load(Ordering::SeqCst))
    }

    pub fn write_bytes(&self, bytes: &[u8]) -> io::Result<()> {
        lock(&self.buffer).extend_from_slice(bytes);
        if self.mode() == WriterMode::StreamAndBuffer {
            self.console.write_bytes(bytes)?;
        }
        for tee in lock(&self.tees).iter_mut() {
            tee.write_all(bytes)?;
        }
        Ok(())
    }

    /// Lets `write!(ctx.writer(), ...)` work on a shared reference
    pub fn write_fmt(&self, args: fmt::Arguments<'_>) -> io::Result<()> {
        self.write_bytes(args.to_string().as_bytes())
    }

    pub fn print(&self, value: impl fmt::Display) {
        let _ = self.write_fmt(format_args!("{value}"));
    }

    pub fn println(&self, value: impl fmt::Display) {
        let _ = self.write_fmt(format_args!("{value}\n"));
    }

    /// Mirror every later write into `writer`
    pub fn tee_to(&self, writer: Box<dyn Write + Send>) {
        lock(&self.tees).push(writer);
    }

    pub fn clear_tee_writers(&self) {
        lock(&self.tees).clear();
    }

    pub fn truncate(&self) {
        lock(&self.buffer).clear();
    }

    pub fn bytes(&self) -> Vec<u8> {
        lock(&self.buffer).clone()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&lock(&self.buffer)).into_owned()
    }
}

impl Write for &Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for Writer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writer").field("mode", &self.mode()).finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
