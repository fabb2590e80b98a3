//! Bounded capture of child stdout/stderr.
//!
//! Both pipes must be drained continuously or the child blocks once a
//! pipe buffer fills. Only the most recent bytes are kept; that tail is
//! what failure messages surface for diagnostics.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

/// Bytes of output retained per stream.
pub const TAIL_CAPACITY: usize = 4 * 1024;

/// Ring buffer over the last [`TAIL_CAPACITY`] bytes of a stream.
#[derive(Clone, Default)]
pub struct OutputTail {
    inner: Arc<Mutex<VecDeque<u8>>>,
}

impl OutputTail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, chunk: &[u8]) {
        let mut buffer = self.inner.lock();
        for &byte in chunk {
            if buffer.len() == TAIL_CAPACITY {
                buffer.pop_front();
            }
            buffer.push_back(byte);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Lossy view of the captured tail, trimmed.
    pub fn contents(&self) -> String {
        let buffer = self.inner.lock();
        let bytes: Vec<u8> = buffer.iter().copied().collect();
        String::from_utf8_lossy(&bytes).trim().to_string()
    }
}

/// Drain a stream to its tail buffer until EOF.
pub fn drain_stream<R>(mut reader: R, tail: OutputTail) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => tail.push(&buf[..n]),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_only_recent_bytes() {
        let tail = OutputTail::new();
        tail.push(&vec![b'a'; TAIL_CAPACITY]);
        tail.push(b"end-marker");

        let contents = tail.contents();
        assert!(contents.len() <= TAIL_CAPACITY);
        assert!(contents.ends_with("end-marker"));
        assert!(contents.starts_with('a'));
    }

    #[test]
    fn empty_tail_renders_empty_string() {
        let tail = OutputTail::new();
        assert!(tail.is_empty());
        assert_eq!(tail.contents(), "");
    }

    #[tokio::test]
    async fn drain_reads_to_eof() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let tail = OutputTail::new();
        let handle = drain_stream(reader, tail.clone());

        use tokio::io::AsyncWriteExt;
        writer.write_all(b"line one\nline two\n").await.unwrap();
        drop(writer);

        handle.await.unwrap();
        assert_eq!(tail.contents(), "line one\nline two");
    }
}
