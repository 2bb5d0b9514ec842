//! Dedicated data channels between host and runtime.
//!
//! Requests arrive on one descriptor and results leave on another, both kept
//! apart from stdio so that log text never interleaves with encoded data.

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    sync::Arc,
};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Descriptor the run loop reads requests from.
pub const INPUT_FD: i32 = 3;
/// Descriptor encoded results are written to.
pub const OUTPUT_FD: i32 = 4;

const READ_CHUNK: usize = 64 * 1024;

pub trait InputChannel: Send {
    /// Block until bytes are available.
    ///
    /// Returns `Ok(None)` once the channel reaches end of stream; an empty
    /// read is never reported as an error.
    ///
    /// # Errors
    /// Returns any I/O error raised by the underlying source.
    fn read(&mut self) -> io::Result<Option<Bytes>>;

    /// Stop listening. Reads after detaching report end of stream.
    fn detach(&mut self) {}
}

pub trait OutputChannel: Send {
    /// Write one encoded frame in a single call.
    ///
    /// # Errors
    /// Returns [`Error::PartialWrite`] when the sink accepts fewer bytes than
    /// the frame holds and [`Error::Io`] for other failures.
    fn write_frame(&mut self, frame: &[u8]) -> Result<()>;

    /// # Errors
    /// Returns any I/O error raised while flushing.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Output channel shared between the run loop and bootstrap capabilities.
pub type SharedOutput = Arc<Mutex<Box<dyn OutputChannel>>>;

pub fn shared_output(output: impl OutputChannel + 'static) -> SharedOutput {
    Arc::new(Mutex::new(Box::new(output)))
}

/// Input channel over any blocking reader.
pub struct ReadInput<R> {
    reader: Option<R>,
    buf: Box<[u8]>,
}

impl<R: Read> ReadInput<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: Some(reader),
            buf: vec![0; READ_CHUNK].into_boxed_slice(),
        }
    }

    #[must_use]
    pub const fn is_detached(&self) -> bool {
        self.reader.is_none()
    }
}

impl<R: Read + Send> InputChannel for ReadInput<R> {
    fn read(&mut self) -> io::Result<Option<Bytes>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        loop {
            match reader.read(&mut self.buf) {
                Ok(0) => return Ok(None),
                Ok(n) => return Ok(Some(Bytes::copy_from_slice(&self.buf[..n]))),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn detach(&mut self) {
        self.reader = None;
    }
}

/// Output channel over any writer. Each frame is handed to the writer in a
/// single `write` call; frames are assumed to be written atomically.
pub struct WriteOutput<W> {
    writer: W,
}

impl<W: Write> WriteOutput<W> {
    pub const fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> OutputChannel for WriteOutput<W> {
    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        if frame.is_empty() {
            return Ok(());
        }
        let written = loop {
            match self.writer.write(frame) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        };
        if written == frame.len() {
            Ok(())
        } else {
            Err(Error::PartialWrite {
                written,
                expected: frame.len(),
            })
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[cfg(unix)]
pub type FdInput = ReadInput<std::fs::File>;
#[cfg(unix)]
pub type FdOutput = WriteOutput<std::fs::File>;

/// Take ownership of an inherited input descriptor.
///
/// # Safety
/// `fd` must be an open descriptor that nothing else owns or closes.
#[cfg(unix)]
#[must_use]
pub unsafe fn fd_input(fd: i32) -> FdInput {
    use std::os::fd::FromRawFd;
    // SAFETY: the caller guarantees `fd` is open and exclusively owned.
    ReadInput::new(unsafe { std::fs::File::from_raw_fd(fd) })
}

/// Take ownership of an inherited output descriptor.
///
/// # Safety
/// `fd` must be an open descriptor that nothing else owns or closes.
#[cfg(unix)]
#[must_use]
pub unsafe fn fd_output(fd: i32) -> FdOutput {
    use std::os::fd::FromRawFd;
    // SAFETY: the caller guarantees `fd` is open and exclusively owned.
    WriteOutput::new(unsafe { std::fs::File::from_raw_fd(fd) })
}

/// In-memory input yielding pre-queued chunks, then end of stream.
#[derive(Default)]
pub struct MemoryInput {
    chunks: VecDeque<Bytes>,
    detached: bool,
}

impl MemoryInput {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_chunks<I>(chunks: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Bytes>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            detached: false,
        }
    }

    pub fn push(&mut self, chunk: impl Into<Bytes>) {
        self.chunks.push_back(chunk.into());
    }

    #[must_use]
    pub const fn is_detached(&self) -> bool {
        self.detached
    }
}

impl InputChannel for MemoryInput {
    fn read(&mut self) -> io::Result<Option<Bytes>> {
        if self.detached {
            return Ok(None);
        }
        Ok(self.chunks.pop_front())
    }

    fn detach(&mut self) {
        self.detached = true;
        self.chunks.clear();
    }
}

/// In-memory output with a fixed capacity. Clones share the same buffer.
///
/// A frame that does not fit is truncated to the remaining space and reported
/// as a partial write.
#[derive(Clone)]
pub struct MemoryOutput {
    capacity: usize,
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl MemoryOutput {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[must_use]
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    /// Take everything written so far.
    #[must_use]
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.buffer.lock())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OutputChannel for MemoryOutput {
    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let mut buf = self.buffer.lock();
        let room = self.capacity.saturating_sub(buf.len());
        let written = frame.len().min(room);
        buf.extend_from_slice(&frame[..written]);
        drop(buf);
        if written == frame.len() {
            Ok(())
        } else {
            Err(Error::PartialWrite {
                written,
                expected: frame.len(),
            })
        }
    }
}
