use futures::StreamExt;
use log::{debug, info};
use std::fmt;
use std::path::PathBuf;
use tokio::fs::File;
use tokio_util::io::ReaderStream;

use crate::stream::{ByteStream, ChunkSender, CHUNK_SIZE};
use crate::PostgresError;

/// Where the archive to restore comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreSource {
    /// A ZIP file on the local filesystem.
    Local(PathBuf),
    /// An HTTP(S) URL, fetched as a stream.
    Remote(String),
}

impl fmt::Display for RestoreSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestoreSource::Local(path) => write!(f, "{}", path.display()),
            RestoreSource::Remote(url) => f.write_str(url),
        }
    }
}

impl RestoreSource {
    async fn open(&self, http: &reqwest::Client) -> Result<ByteStream, PostgresError> {
        match self {
            RestoreSource::Local(path) => {
                let file = File::open(path).await.map_err(|e| {
                    PostgresError::AcquisitionError(format!("cannot open {}: {e}", path.display()))
                })?;
                Ok(Box::pin(ReaderStream::with_capacity(file, CHUNK_SIZE)))
            }
            RestoreSource::Remote(url) => {
                let response = http.get(url).send().await.map_err(|e| {
                    PostgresError::AcquisitionError(format!("GET {url} failed: {e}"))
                })?;
                let status = response.status();
                if !status.is_success() {
                    return Err(PostgresError::AcquisitionError(format!(
                        "GET {url} returned {status}"
                    )));
                }
                Ok(Box::pin(
                    response.bytes_stream().map(|chunk| chunk.map_err(std::io::Error::other)),
                ))
            }
        }
    }
}

/// Copies the archive into the extraction stage. Returns `Ok` when the
/// extraction stage stops reading early, since that stage reports its own
/// outcome.
pub(crate) async fn acquire(
    source: &RestoreSource,
    http: &reqwest::Client,
    tx: &ChunkSender,
) -> Result<(), PostgresError> {
    let mut chunks = source.open(http).await?;
    info!("Reading archive from {source}");

    let mut total = 0u64;
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|e| {
            PostgresError::AcquisitionError(format!("reading {source} failed: {e}"))
        })?;
        total += chunk.len() as u64;
        if tx.send(Ok(chunk)).await.is_err() {
            debug!("Extraction stopped reading {source} after {total} bytes");
            return Ok(());
        }
    }

    debug!("Read {total} bytes from {source}");
    Ok(())
}
