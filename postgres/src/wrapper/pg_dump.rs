use futures::StreamExt;
use log::{debug, error, info, warn};
use std::process::{ExitStatus, Stdio};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use super::{redact, tool_unavailable, tool_version};
use crate::stream::{self, ByteStream, ChunkSender, CHUNK_SIZE};
use crate::version::Toolset;
use crate::PostgresError;

/// Flags passed to pg_dump. A flag that is `false` is simply left out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpOptions {
    /// `--data-only`: dump only the data, not the schema.
    pub data_only: bool,
    /// `--schema-only`: dump only the object definitions.
    pub schema_only: bool,
    /// `--clean`: emit DROP statements before the CREATE statements.
    pub clean: bool,
    /// `--if-exists`: use `DROP ... IF EXISTS`. Only valid together with `clean`.
    pub if_exists: bool,
    /// `--create`: start the script by creating and reconnecting to the database.
    pub create: bool,
    /// `--no-comments`: do not dump comments.
    pub no_comments: bool,
}

impl DumpOptions {
    /// Rejects combinations pg_dump would refuse, before any process starts.
    pub fn validate(&self) -> Result<(), PostgresError> {
        if self.if_exists && !self.clean {
            return Err(PostgresError::InvalidOptions(
                "--if-exists requires --clean".to_string(),
            ));
        }
        if self.data_only && self.schema_only {
            return Err(PostgresError::InvalidOptions(
                "--data-only and --schema-only cannot be used together".to_string(),
            ));
        }
        Ok(())
    }

    pub fn flags(&self) -> Vec<&'static str> {
        [
            (self.data_only, "--data-only"),
            (self.schema_only, "--schema-only"),
            (self.clean, "--clean"),
            (self.if_exists, "--if-exists"),
            (self.create, "--create"),
            (self.no_comments, "--no-comments"),
        ]
        .into_iter()
        .filter_map(|(enabled, flag)| enabled.then_some(flag))
        .collect()
    }
}

/// Wrapper for pg_dump command
pub struct PgDump;

enum Pump {
    Finished,
    ReadFailed(std::io::Error),
    ConsumerGone,
    Cancelled,
}

impl PgDump {
    /// Starts pg_dump and returns its stdout as a stream. The process keeps
    /// running while the stream is consumed; a non-zero exit ends the stream
    /// with `DumpFailed`.
    pub fn stream(
        toolset: &Toolset,
        conn_string: &str,
        options: &DumpOptions,
        capacity: usize,
        cancel: CancellationToken,
    ) -> Result<ByteStream, PostgresError> {
        options.validate()?;
        let flags = options.flags();

        let mut cmd = Command::new(&toolset.pg_dump);
        cmd.arg(conn_string)
            .args(&flags)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(
            "Running pg_dump command: {} {} {}",
            toolset.pg_dump.display(),
            redact(conn_string),
            flags.join(" ")
        );

        let mut child = cmd
            .spawn()
            .map_err(|e| tool_unavailable(&toolset.pg_dump, e))?;
        let stdout = child.stdout.take().ok_or_else(|| {
            PostgresError::Io(std::io::Error::other("pg_dump stdout was not captured"))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            PostgresError::Io(std::io::Error::other("pg_dump stderr was not captured"))
        })?;

        let (tx, output) = stream::channel(capacity);
        let version = toolset.label();
        info!("Started pg_dump v{version}");
        tokio::spawn(supervise(child, stdout, stderr, tx, version, cancel));

        Ok(output)
    }

    /// Returns the output of `pg_dump --version`.
    pub async fn version(toolset: &Toolset) -> Result<String, PostgresError> {
        tool_version(&toolset.pg_dump).await
    }
}

async fn supervise(
    mut child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    tx: ChunkSender,
    version: &'static str,
    cancel: CancellationToken,
) {
    let diagnostics = tokio::spawn(read_diagnostics(stderr));

    let pump = tokio::select! {
        biased;
        _ = cancel.cancelled() => Pump::Cancelled,
        pump = forward(stdout, &tx) => pump,
    };

    let failure = match pump {
        Pump::Finished => {
            let status = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                status = child.wait() => Some(status),
            };
            match status {
                Some(Ok(status)) if status.success() => {
                    info!("pg_dump v{version} completed successfully");
                    None
                }
                Some(Ok(status)) => {
                    let stderr = diagnostics.await.unwrap_or_default();
                    Some(PostgresError::DumpFailed {
                        version: version.to_string(),
                        stderr: describe_failure(stderr, status),
                    })
                }
                Some(Err(e)) => Some(PostgresError::DumpFailed {
                    version: version.to_string(),
                    stderr: format!("waiting for pg_dump failed: {e}"),
                }),
                None => {
                    reap(&mut child).await;
                    Some(PostgresError::Cancelled)
                }
            }
        }
        Pump::ReadFailed(e) => {
            reap(&mut child).await;
            Some(PostgresError::DumpFailed {
                version: version.to_string(),
                stderr: format!("reading pg_dump output failed: {e}"),
            })
        }
        Pump::ConsumerGone => {
            warn!("Dump stream dropped before pg_dump v{version} finished, stopping it");
            reap(&mut child).await;
            None
        }
        Pump::Cancelled => {
            warn!("pg_dump v{version} cancelled");
            reap(&mut child).await;
            Some(PostgresError::Cancelled)
        }
    };

    if let Some(err) = failure {
        error!("{err}");
        let _ = tx.send(Err(err.into_io())).await;
    }
}

async fn forward(stdout: ChildStdout, tx: &ChunkSender) -> Pump {
    let mut chunks = ReaderStream::with_capacity(stdout, CHUNK_SIZE);
    while let Some(chunk) = chunks.next().await {
        match chunk {
            Ok(bytes) => {
                if tx.send(Ok(bytes)).await.is_err() {
                    return Pump::ConsumerGone;
                }
            }
            Err(e) => return Pump::ReadFailed(e),
        }
    }
    Pump::Finished
}

async fn read_diagnostics(mut stderr: ChildStderr) -> String {
    let mut buf = Vec::new();
    if let Err(e) = stderr.read_to_end(&mut buf).await {
        debug!("Failed to read pg_dump stderr: {e}");
    }
    String::from_utf8_lossy(&buf).trim().to_string()
}

fn describe_failure(stderr: String, status: ExitStatus) -> String {
    if stderr.is_empty() {
        format!("pg_dump {status}")
    } else {
        stderr
    }
}

/// Kills the child and waits for it so no zombie is left behind.
async fn reap(child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!("Failed to kill pg_dump: {e}");
    }
}
