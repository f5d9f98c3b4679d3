//! A listener buffering diagnostic trace output produced during one test
//! run, drained into that test's pass/fail message and never carried over to
//! the next test.

use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Clone, Default)]
pub struct TraceBuffer {
    inner: Arc<Mutex<String>>,
}

impl TraceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writer(&self) -> TraceWriter {
        TraceWriter {
            inner: self.inner.clone(),
        }
    }

    /// Takes the buffered output, clearing the buffer. Returns [None] when
    /// nothing was written.
    pub fn drain(&self) -> Option<String> {
        let mut buf = self.inner.lock();
        if buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut *buf))
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[derive(Clone)]
pub struct TraceWriter {
    inner: Arc<Mutex<String>>,
}

impl TraceWriter {
    pub fn write_line(&self, line: &str) {
        let mut buf = self.inner.lock();
        buf.push_str(line);
        buf.push('\n');
    }
}

impl std::io::Write for TraceWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.lock().push_str(&String::from_utf8_lossy(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::TraceBuffer;

    #[test]
    fn drain_empties_the_buffer() {
        let buffer = TraceBuffer::new();
        buffer.writer().write_line("first test output");

        assert_eq!(buffer.drain(), Some("first test output\n".to_string()));
        assert_eq!(buffer.drain(), None);
    }

    #[test]
    fn drain_of_untouched_buffer_is_none() {
        let buffer = TraceBuffer::new();
        assert_eq!(buffer.drain(), None);
    }

    #[test]
    fn writers_share_the_buffer() {
        let buffer = TraceBuffer::new();
        let w1 = buffer.writer();
        let w2 = buffer.writer();
        w1.write_line("a");
        w2.write_line("b");
        assert_eq!(buffer.drain(), Some("a\nb\n".to_string()));
    }
}
