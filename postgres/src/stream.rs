//! Byte streams that link pipeline stages together.
//!
//! Every stage, whether it is a child process or an in-process transform,
//! talks to its neighbours through a bounded channel of chunks. A full channel
//! suspends the producer, an empty one suspends the consumer, so memory stays
//! bounded no matter how large the dump is. A stage that fails pushes an
//! `Err` item as its last chunk instead of silently ending the stream.

use bytes::Bytes;
use futures::Stream;
use std::error::Error;
use std::fmt;
use std::io::{self, Write};
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// A finite, non-restartable stream of bytes.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>;

pub(crate) type ChunkSender = mpsc::Sender<Result<Bytes, io::Error>>;

/// Chunk size used when reading from child processes and files.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Number of chunks buffered between two stages.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

pub(crate) fn channel(capacity: usize) -> (ChunkSender, ByteStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (tx, Box::pin(ReceiverStream::new(rx)))
}

/// Marks a write that failed because the next stage stopped reading.
#[derive(Debug)]
struct DownstreamClosed;

impl fmt::Display for DownstreamClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("downstream stage closed its input")
    }
}

impl Error for DownstreamClosed {}

pub(crate) fn downstream_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, DownstreamClosed)
}

pub(crate) fn is_downstream_closed(err: &io::Error) -> bool {
    err.get_ref()
        .is_some_and(|inner| inner.is::<DownstreamClosed>())
}

/// Error pushed downstream when a stage gives up; the stage reports the
/// real cause through its own outcome.
pub(crate) fn stage_failed(stage: &str) -> io::Error {
    io::Error::other(format!("{stage} stage failed"))
}

/// Blocking `Write` adapter over a chunk channel, for synchronous transforms
/// running on the blocking pool.
pub(crate) struct ChannelWriter {
    tx: ChunkSender,
}

impl ChannelWriter {
    pub(crate) fn new(tx: ChunkSender) -> Self {
        Self { tx }
    }

    /// Closes the stream with `err` as its final item.
    pub(crate) fn fail(&self, err: io::Error) {
        let _ = self.tx.blocking_send(Err(err));
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| downstream_closed())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reads a stream to the end, failing on the first error item.
pub async fn collect(mut stream: ByteStream) -> io::Result<Vec<u8>> {
    use futures::StreamExt;

    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

/// Wraps an in-memory buffer as a stream, mostly useful for callers that
/// already hold the SQL text.
pub fn from_bytes(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    Box::pin(futures::stream::iter(
        data.chunks(CHUNK_SIZE)
            .map(|chunk| Ok::<_, io::Error>(data.slice_ref(chunk)))
            .collect::<Vec<_>>(),
    ))
}
