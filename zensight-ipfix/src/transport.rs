//! Message transports.
//!
//! A [`MessageBuffer`](crate::message::MessageBuffer) hands each finished
//! message to an [`Exporter`] and pulls whole messages from a [`Collector`].
//! Network transports live outside this crate; the in-memory and stream
//! implementations here cover files, pipes and tests.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;

use crate::transcoder::read_u16;

/// Length of the IPFIX message header.
const HEADER_LEN: usize = 16;

/// Sink for complete IPFIX messages.
pub trait Exporter: Send {
    /// Deliver one complete message.
    fn write_message(&mut self, message: &[u8]) -> io::Result<()>;
}

/// Source of complete IPFIX messages.
pub trait Collector: Send {
    /// Replace the contents of `buf` with the next message.
    ///
    /// Returns the message length, or `0` at the end of the stream.
    fn read_message(&mut self, buf: &mut Vec<u8>) -> io::Result<usize>;
}

/// Exporter that keeps every message in memory.
///
/// Clones share the same storage, so a test can keep one handle while the
/// buffer owns the other.
#[derive(Debug, Clone, Default)]
pub struct MemoryExporter {
    messages: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every message written so far.
    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.messages.lock().clone()
    }

    /// Remove and return every message written so far.
    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.messages.lock())
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }
}

impl Exporter for MemoryExporter {
    fn write_message(&mut self, message: &[u8]) -> io::Result<()> {
        self.messages.lock().push(message.to_vec());
        Ok(())
    }
}

/// Collector replaying a fixed list of messages.
#[derive(Debug, Clone, Default)]
pub struct MemoryCollector {
    messages: VecDeque<Vec<u8>>,
}

impl MemoryCollector {
    pub fn new(messages: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self {
            messages: messages.into_iter().collect(),
        }
    }

    pub fn push(&mut self, message: Vec<u8>) {
        self.messages.push_back(message);
    }
}

impl Collector for MemoryCollector {
    fn read_message(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        buf.clear();
        match self.messages.pop_front() {
            Some(message) => {
                buf.extend_from_slice(&message);
                Ok(buf.len())
            }
            None => Ok(0),
        }
    }
}

/// Exporter writing messages back to back into any [`Write`].
#[derive(Debug)]
pub struct StreamExporter<W> {
    writer: W,
}

impl<W: Write + Send> StreamExporter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> Exporter for StreamExporter<W> {
    fn write_message(&mut self, message: &[u8]) -> io::Result<()> {
        self.writer.write_all(message)?;
        self.writer.flush()
    }
}

/// Collector splitting a byte stream into messages using the header length.
#[derive(Debug)]
pub struct StreamCollector<R> {
    reader: R,
}

impl<R: Read + Send> StreamCollector<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: Read + Send> Collector for StreamCollector<R> {
    fn read_message(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        buf.clear();
        buf.resize(HEADER_LEN, 0);

        let mut filled = 0;
        while filled < HEADER_LEN {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => {
                    buf.clear();
                    return Ok(0);
                }
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream ended inside a message header",
                    ));
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        let len = usize::from(read_u16(buf, 2));
        if len < HEADER_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("message length {} is shorter than its header", len),
            ));
        }

        buf.resize(len, 0);
        self.reader.read_exact(&mut buf[HEADER_LEN..])?;
        Ok(len)
    }
}
