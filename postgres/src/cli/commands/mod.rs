use anyhow::{Context, Result};
use futures::StreamExt;
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::manager::PostgresManager;
use crate::restore::RestoreSource;
use crate::stream::ByteStream;
use crate::version::PgVersion;
use crate::wrapper::DumpOptions;
use crate::PostgresError;

/// Returns a token that is cancelled on the first Ctrl-C.
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("[CLI] Interrupted, cancelling");
            trigger.cancel();
        }
    });
    token
}

pub async fn test(manager: &PostgresManager, version: PgVersion, conn: &str) -> Result<()> {
    manager.test(version, conn).await?;
    info!("[CLI] Connection OK");
    Ok(())
}

pub async fn check_tools(manager: &PostgresManager, version: PgVersion) -> Result<()> {
    let toolset = manager.toolset(version);
    let versions = manager.check_tools(version).await?;
    println!("pg_dump: {} ({})", versions.pg_dump, toolset.pg_dump.display());
    println!("psql:    {} ({})", versions.psql, toolset.psql.display());
    Ok(())
}

pub async fn dump(
    manager: &PostgresManager,
    version: PgVersion,
    conn: &str,
    zip: bool,
    output: Option<PathBuf>,
    options: DumpOptions,
    cancel: CancellationToken,
) -> Result<()> {
    let stream = if zip {
        manager.dump_zip_with_cancel(version, conn, &options, cancel)?
    } else {
        manager.dump_with_cancel(version, conn, &options, cancel)?
    };

    match output {
        Some(path) => {
            let written = dump_to_file(stream, &path).await?;
            info!("[CLI] Wrote {written} bytes to {}", path.display());
        }
        None => {
            let mut stdout = tokio::io::stdout();
            drain(stream, &mut stdout).await?;
        }
    }
    Ok(())
}

async fn dump_to_file(stream: ByteStream, path: &Path) -> Result<u64> {
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("cannot create {}", path.display()))?;

    match drain(stream, &mut file).await {
        Ok(written) => {
            file.sync_all().await?;
            Ok(written)
        }
        Err(e) => {
            drop(file);
            if let Err(rm) = tokio::fs::remove_file(path).await {
                error!("[CLI] Failed to remove partial {}: {rm}", path.display());
            }
            Err(e.into())
        }
    }
}

async fn drain<W: AsyncWrite + Unpin>(
    mut stream: ByteStream,
    sink: &mut W,
) -> std::result::Result<u64, PostgresError> {
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        sink.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    sink.flush().await?;
    Ok(written)
}

pub async fn restore(
    manager: &PostgresManager,
    version: PgVersion,
    conn: &str,
    file: Option<PathBuf>,
    url: Option<String>,
    cancel: CancellationToken,
) -> Result<()> {
    let source = match (file, url) {
        (Some(path), None) => RestoreSource::Local(path),
        (None, Some(url)) => RestoreSource::Remote(url),
        _ => anyhow::bail!("exactly one of --file or --url is required"),
    };
    manager
        .restore_with_cancel(version, conn, source, cancel)
        .await?;
    info!("[CLI] Restore completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::from_bytes;

    #[tokio::test]
    async fn dump_to_file_writes_every_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.sql");
        let written = dump_to_file(from_bytes("CREATE TABLE t ();\n"), &path)
            .await
            .unwrap();
        assert_eq!(written, 19);
        assert_eq!(std::fs::read(&path).unwrap(), b"CREATE TABLE t ();\n");
    }

    #[tokio::test]
    async fn failed_dump_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.sql");
        let failing: ByteStream = Box::pin(futures::stream::iter(vec![
            Ok(bytes::Bytes::from_static(b"partial")),
            Err(PostgresError::DumpFailed {
                version: "16".into(),
                stderr: "boom".into(),
            }
            .into_io()),
        ]));

        let err = dump_to_file(failing, &path).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(!path.exists());
    }
}
