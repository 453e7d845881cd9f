//! Output interception for parallel processes
//!
//! While a spec runs on a parallel process, console output is diverted into
//! a capture so it can be attached to the spec's report instead of
//! interleaving with other processes. None of these operations block for
//! longer than [`FLUSH_TIMEOUT`].

use std::io::{self, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::warn;

use super::{Console, SharedBuffer};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

pub trait OutputInterceptor: Send + Sync {
    fn start_intercepting(&self);
    fn stop_intercepting_and_return_output(&self) -> String;
    /// Temporarily let output through; a no-op when not intercepting
    fn pause_intercepting(&self);
    fn resume_intercepting(&self);
    fn shutdown(&self);
}

/// Selected by `SuiteConfig::output_interceptor_mode`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterceptorMode {
    /// Reassign the shared console sink to a buffer
    Swap,
    None,
    /// Forward console writes through a pipe drained by a background thread
    Redirect,
}

impl InterceptorMode {
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "swap" => InterceptorMode::Swap,
            "none" => InterceptorMode::None,
            _ => InterceptorMode::Redirect,
        }
    }

    pub fn build(self, console: &Console) -> Box<dyn OutputInterceptor> {
        match self {
            InterceptorMode::Swap => Box::new(SwapOutputInterceptor::new(console.clone())),
            InterceptorMode::None => Box::new(NoopOutputInterceptor),
            InterceptorMode::Redirect => Box::new(RedirectOutputInterceptor::new(console.clone())),
        }
    }
}

/// Used when running on a single process
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopOutputInterceptor;

impl OutputInterceptor for NoopOutputInterceptor {
    fn start_intercepting(&self) {}

    fn stop_intercepting_and_return_output(&self) -> String {
        String::new()
    }

    fn pause_intercepting(&self) {}

    fn resume_intercepting(&self) {}

    fn shutdown(&self) {}
}

type Sink = Box<dyn Write + Send>;

/// Bookkeeping shared by the interceptors that divert the console sink
#[derive(Default)]
struct Diversion {
    original: Option<Sink>,
    intercepting: bool,
    paused: bool,
}

impl Diversion {
    fn start(&mut self, console: &Console, capture: Sink) {
        if self.intercepting {
            return;
        }
        self.original = Some(console.swap(capture));
        self.intercepting = true;
        self.paused = false;
    }

    fn pause(&mut self, console: &Console) {
        if !self.intercepting || self.paused {
            return;
        }
        if let Some(original) = self.original.take() {
            drop(console.swap(original));
        }
        self.paused = true;
    }

    fn resume(&mut self, console: &Console, capture: Sink) {
        if !self.intercepting || !self.paused {
            return;
        }
        self.original = Some(console.swap(capture));
        self.paused = false;
    }

    fn stop(&mut self, console: &Console) {
        if let Some(original) = self.original.take() {
            drop(console.swap(original));
        }
        self.intercepting = false;
        self.paused = false;
    }
}

pub struct SwapOutputInterceptor {
    console: Console,
    captured: SharedBuffer,
    diversion: Mutex<Diversion>,
}

impl SwapOutputInterceptor {
    pub fn new(console: Console) -> Self {
        Self {
            console,
            captured: SharedBuffer::new(),
            diversion: Mutex::new(Diversion::default()),
        }
    }

    fn diversion(&self) -> MutexGuard<'_, Diversion> {
        self.diversion.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl OutputInterceptor for SwapOutputInterceptor {
    fn start_intercepting(&self) {
        self.captured.take();
        self.diversion()
            .start(&self.console, Box::new(self.captured.clone()));
    }

    fn stop_intercepting_and_return_output(&self) -> String {
        self.diversion().stop(&self.console);
        self.captured.take()
    }

    fn pause_intercepting(&self) {
        self.diversion().pause(&self.console);
    }

    fn resume_intercepting(&self) {
        self.diversion()
            .resume(&self.console, Box::new(self.captured.clone()));
    }

    fn shutdown(&self) {
        self.diversion().stop(&self.console);
        self.captured.take();
    }
}

enum PipeMessage {
    Data(Vec<u8>),
    Flush(Sender<()>),
}

struct PipeSink(Sender<PipeMessage>);

impl Write for PipeSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .send(PipeMessage::Data(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "interceptor pipe closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct RedirectOutputInterceptor {
    console: Console,
    captured: SharedBuffer,
    sender: Mutex<Option<Sender<PipeMessage>>>,
    diversion: Mutex<Diversion>,
}

impl RedirectOutputInterceptor {
    pub fn new(console: Console) -> Self {
        let (sender, receiver) = mpsc::channel();
        let captured = SharedBuffer::new();
        let drain_into = captured.clone();
        thread::Builder::new()
            .name("grove-output-drain".to_string())
            .spawn(move || drain(receiver, drain_into))
            .map_err(|e| warn!("could not start output drain thread: {}", e))
            .ok();

        Self {
            console,
            captured,
            sender: Mutex::new(Some(sender)),
            diversion: Mutex::new(Diversion::default()),
        }
    }

    fn pipe(&self) -> Option<Sink> {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|s| Box::new(PipeSink(s.clone())) as Sink)
    }

    /// Wait until everything written so far has reached the capture buffer
    fn flush_pipe(&self) {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let Some(sender) = sender else { return };
        let (ack, acked) = mpsc::channel();
        if sender.send(PipeMessage::Flush(ack)).is_ok()
            && acked.recv_timeout(FLUSH_TIMEOUT).is_err()
        {
            warn!("timed out waiting for intercepted output to drain");
        }
    }

    fn diversion(&self) -> MutexGuard<'_, Diversion> {
        self.diversion.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn drain(receiver: Receiver<PipeMessage>, mut captured: SharedBuffer) {
    for message in receiver {
        match message {
            PipeMessage::Data(bytes) => {
                let _ = captured.write_all(&bytes);
            }
            PipeMessage::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

impl OutputInterceptor for RedirectOutputInterceptor {
    fn start_intercepting(&self) {
        self.flush_pipe();
        self.captured.take();
        if let Some(pipe) = self.pipe() {
            self.diversion().start(&self.console, pipe);
        }
    }

    fn stop_intercepting_and_return_output(&self) -> String {
        self.diversion().stop(&self.console);
        self.flush_pipe();
        self.captured.take()
    }

    fn pause_intercepting(&self) {
        self.diversion().pause(&self.console);
    }

    fn resume_intercepting(&self) {
        if let Some(pipe) = self.pipe() {
            self.diversion().resume(&self.console, pipe);
        }
    }

    fn shutdown(&self) {
        self.diversion().stop(&self.console);
        // Dropping the last sender ends the drain thread.
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(mode: InterceptorMode) {
        let (console, out) = Console::capture();
        let interceptor = mode.build(&console);

        console.print("before ");
        interceptor.start_intercepting();
        console.print("captured");
        interceptor.pause_intercepting();
        console.print("paused ");
        interceptor.resume_intercepting();
        console.print(" again");
        let output = interceptor.stop_intercepting_and_return_output();
        console.print("after");
        interceptor.shutdown();

        assert_eq!(output, "captured again");
        assert_eq!(out.contents(), "before paused after");
    }

    #[test]
    fn test_swap_interceptor() {
        exercise(InterceptorMode::Swap);
    }

    #[test]
    fn test_redirect_interceptor() {
        exercise(InterceptorMode::Redirect);
    }

    #[test]
    fn test_noop_interceptor_passes_through() {
        let (console, out) = Console::capture();
        let interceptor = InterceptorMode::None.build(&console);
        interceptor.start_intercepting();
        interceptor.pause_intercepting();
        console.print("visible");
        assert_eq!(interceptor.stop_intercepting_and_return_output(), "");
        assert_eq!(out.contents(), "visible");
    }

    #[test]
    fn test_mode_selection() {
        assert_eq!(InterceptorMode::from_str("SWAP"), InterceptorMode::Swap);
        assert_eq!(InterceptorMode::from_str("none"), InterceptorMode::None);
        assert_eq!(InterceptorMode::from_str(""), InterceptorMode::Redirect);
        assert_eq!(InterceptorMode::from_str("dup"), InterceptorMode::Redirect);
        assert_eq!(InterceptorMode::from_str("tee"), InterceptorMode::Redirect);
    }
}
