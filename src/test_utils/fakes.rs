//! In-memory stand-ins for the serial port and output files

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::output::SinkFactory;
use crate::source::{self, ByteSource, TransportError};

/// Growable buffer shared between a sink and its factory
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl SharedBuffer {
    /// Copy of the bytes written so far
    pub fn contents(&self) -> Vec<u8> {
        self.0.borrow().clone()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Sink factory that keeps every sink in memory
#[derive(Debug, Default)]
pub struct MemorySinkFactory {
    sinks: Vec<SharedBuffer>,
    /// Fail the open after this many successful ones
    fail_after: Option<usize>,
}

impl MemorySinkFactory {
    /// Factory whose opens start failing after `opens` successes
    pub fn failing_after(opens: usize) -> Self {
        Self {
            sinks: Vec::new(),
            fail_after: Some(opens),
        }
    }

    /// Contents of every sink opened so far, in order
    pub fn sinks(&self) -> Vec<Vec<u8>> {
        self.sinks.iter().map(SharedBuffer::contents).collect()
    }
}

impl SinkFactory for MemorySinkFactory {
    type Sink = SharedBuffer;

    fn open_sink(&mut self) -> io::Result<Self::Sink> {
        if self.fail_after.is_some_and(|n| self.sinks.len() >= n) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "sink refused"));
        }
        let sink = SharedBuffer::default();
        self.sinks.push(sink.clone());
        Ok(sink)
    }
}

/// Byte source replaying a fixed script
#[derive(Debug)]
pub struct ScriptedSource {
    bytes: Vec<u8>,
    position: usize,
    fail_at_end: bool,
    stop: Option<(usize, Arc<AtomicBool>)>,
}

impl ScriptedSource {
    /// Yield `bytes`, then report exhaustion
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            position: 0,
            fail_at_end: false,
            stop: None,
        }
    }

    /// Fail with a transport error instead of reporting exhaustion
    #[must_use]
    pub fn then_fail(mut self) -> Self {
        self.fail_at_end = true;
        self
    }

    /// Raise `flag` once `count` bytes have been yielded
    #[must_use]
    pub fn stop_after(mut self, count: usize, flag: Arc<AtomicBool>) -> Self {
        self.stop = Some((count, flag));
        self
    }

    /// Bytes yielded so far
    pub fn position(&self) -> usize {
        self.position
    }
}

impl ByteSource for ScriptedSource {
    fn read_byte(&mut self) -> source::Result<Option<u8>> {
        let Some(&byte) = self.bytes.get(self.position) else {
            if self.fail_at_end {
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "link lost",
                )));
            }
            return Ok(None);
        };

        self.position += 1;
        if let Some((count, flag)) = &self.stop {
            if self.position >= *count {
                flag.store(true, Ordering::Release);
            }
        }
        Ok(Some(byte))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sinks_are_shared() {
        let mut factory = MemorySinkFactory::default();
        factory.open_sink().unwrap().write_all(b"abc").unwrap();
        let mut second = factory.open_sink().unwrap();
        second.write_all(b"de").unwrap();
        second.write_all(b"f").unwrap();

        assert_eq!(factory.sinks(), vec![b"abc".to_vec(), b"def".to_vec()]);
    }

    #[test]
    fn test_failing_factory() {
        let mut factory = MemorySinkFactory::failing_after(1);
        assert!(factory.open_sink().is_ok());
        assert!(factory.open_sink().is_err());
    }

    #[test]
    fn test_scripted_source_fails_at_end() {
        let mut source = ScriptedSource::new(vec![0x01]).then_fail();
        assert_eq!(source.read_byte().unwrap(), Some(0x01));
        assert!(source.read_byte().is_err());
    }

    #[test]
    fn test_scripted_source_raises_stop() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut source = ScriptedSource::new(vec![1, 2, 3]).stop_after(2, Arc::clone(&flag));

        source.read_byte().unwrap();
        assert!(!flag.load(Ordering::Acquire));
        source.read_byte().unwrap();
        assert!(flag.load(Ordering::Acquire));
        assert_eq!(source.position(), 2);
    }
}
