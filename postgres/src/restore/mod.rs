//! Restore pipeline: archive source → `dump.sql` extraction → psql.
//!
//! The three stages run concurrently and are linked by bounded streams. The
//! restore is only reported once every stage has terminated, and an upstream
//! failure always wins over a psql run that looked successful because it
//! received no input.

mod source;

pub use source::RestoreSource;

use log::{debug, error, info, warn};
use std::io::{self, BufReader};
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::task::JoinError;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tokio_util::sync::CancellationToken;

use crate::archive::{self, DUMP_ENTRY};
use crate::stream::{self, ByteStream, ChannelWriter, ChunkSender, CHUNK_SIZE};
use crate::version::Toolset;
use crate::wrapper::Psql;
use crate::PostgresError;

/// Everything the restore pipeline needs besides its source.
pub(crate) struct RestorePipeline<'a> {
    pub toolset: &'a Toolset,
    pub conn_string: &'a str,
    pub http: &'a reqwest::Client,
    pub capacity: usize,
}

impl RestorePipeline<'_> {
    pub(crate) async fn run(
        &self,
        source: RestoreSource,
        cancel: CancellationToken,
    ) -> Result<(), PostgresError> {
        let version = self.toolset.label();
        info!("Restoring {source} with psql v{version}");

        // Both links exist before any stage starts.
        let (archive_tx, archive_stream) = stream::channel(self.capacity);
        let (sql_tx, sql_stream) = stream::channel(self.capacity);

        let mut psql = Psql::ingest(self.toolset, self.conn_string)?;
        let stdin = psql.stdin.take().ok_or_else(|| {
            PostgresError::Io(io::Error::other("psql stdin was not captured"))
        })?;

        let http = self.http.clone();
        let acquisition_cancel = cancel.clone();
        let acquisition = tokio::spawn(async move {
            let result = tokio::select! {
                result = source::acquire(&source, &http, &archive_tx) => result,
                _ = acquisition_cancel.cancelled() => Err(PostgresError::Cancelled),
            };
            if let Err(e) = &result {
                let item = match e {
                    PostgresError::Cancelled => PostgresError::Cancelled.into_io(),
                    _ => stream::stage_failed("acquisition"),
                };
                let _ = archive_tx.send(Err(item)).await;
            }
            result
        });
        let archive_reader = SyncIoBridge::new(StreamReader::new(archive_stream));
        let extraction = tokio::task::spawn_blocking(move || extract(archive_reader, sql_tx));
        let feeder = tokio::spawn(feed(sql_stream, stdin));

        let feeder_abort = feeder.abort_handle();

        let ingestion = async {
            let fed = settle("ingestion", feeder.await);
            if fed.is_err() {
                warn!("psql input failed, stopping psql");
                if let Err(e) = psql.start_kill() {
                    debug!("Failed to kill psql: {e}");
                }
            }
            (fed, psql.wait().await)
        };

        let ingested = tokio::select! {
            ingested = ingestion => Some(ingested),
            _ = cancel.cancelled() => None,
        };

        let Some((fed, status)) = ingested else {
            warn!("Restore of psql v{version} cancelled, stopping all stages");
            feeder_abort.abort();
            if let Err(e) = psql.kill().await {
                debug!("Failed to kill psql: {e}");
            }
            // Acquisition watches the token itself; both stages end once
            // their links are closed.
            let _ = settle("extraction", extraction.await);
            let _ = settle("acquisition", acquisition.await);
            return Err(PostgresError::Cancelled);
        };

        let outcomes = StageOutcomes {
            acquired: settle("acquisition", acquisition.await),
            extracted: settle("extraction", extraction.await),
            fed,
            status,
        };
        let result = outcomes.resolve(version);
        match &result {
            Ok(()) => info!("Restore with psql v{version} completed successfully"),
            Err(e) => error!("{e}"),
        }
        result
    }
}

struct StageOutcomes {
    acquired: Result<(), PostgresError>,
    extracted: Result<(), PostgresError>,
    fed: Result<(), PostgresError>,
    status: io::Result<std::process::ExitStatus>,
}

impl StageOutcomes {
    /// Reports the first stage, in chain order, that failed on its own.
    fn resolve(self, version: &str) -> Result<(), PostgresError> {
        self.acquired?;
        self.extracted.map_err(|e| match e {
            e @ (PostgresError::ExtractionError(_) | PostgresError::AcquisitionError(_)) => e,
            other => PostgresError::ExtractionError(other.to_string()),
        })?;
        self.fed.map_err(|e| PostgresError::RestoreFailed {
            version: version.to_string(),
            status: format!("feeding psql failed: {e}"),
        })?;

        match self.status {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(PostgresError::RestoreFailed {
                version: version.to_string(),
                status: format!("psql {status}"),
            }),
            Err(e) => Err(PostgresError::RestoreFailed {
                version: version.to_string(),
                status: format!("waiting for psql failed: {e}"),
            }),
        }
    }
}

fn settle(
    stage: &str,
    joined: Result<Result<(), PostgresError>, JoinError>,
) -> Result<(), PostgresError> {
    joined.unwrap_or_else(|e| {
        Err(PostgresError::Io(io::Error::other(format!(
            "{stage} stage did not finish: {e}"
        ))))
    })
}

/// Extraction stage, run on the blocking pool.
fn extract(archive: impl io::Read, sql_tx: ChunkSender) -> Result<(), PostgresError> {
    let mut writer = ChannelWriter::new(sql_tx);
    let source = BufReader::with_capacity(CHUNK_SIZE, archive);

    match archive::extract_entry(DUMP_ENTRY, source, &mut writer) {
        Ok(bytes) => {
            debug!("Extracted {bytes} bytes of SQL from {DUMP_ENTRY}");
            Ok(())
        }
        Err(PostgresError::Io(e)) if stream::is_downstream_closed(&e) => {
            debug!("psql stopped reading before {DUMP_ENTRY} was fully extracted");
            Ok(())
        }
        Err(PostgresError::Cancelled) => {
            writer.fail(PostgresError::Cancelled.into_io());
            Err(PostgresError::Cancelled)
        }
        Err(e) => {
            writer.fail(stream::stage_failed("extraction"));
            Err(e)
        }
    }
}

/// Ingestion link: copies the SQL stream into psql's stdin, then closes it
/// so psql sees end of input.
async fn feed(sql: ByteStream, mut stdin: ChildStdin) -> Result<(), PostgresError> {
    let mut reader = StreamReader::new(sql);
    match tokio::io::copy(&mut reader, &mut stdin).await {
        Ok(bytes) => {
            debug!("Fed {bytes} bytes of SQL to psql");
            if let Err(e) = stdin.shutdown().await {
                debug!("Closing psql stdin failed: {e}");
            }
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
            debug!("psql closed its input early");
            Ok(())
        }
        Err(e) => Err(PostgresError::from(e)),
    }
}
