use log::info;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::archive;
use crate::restore::{RestorePipeline, RestoreSource};
use crate::stream::{ByteStream, DEFAULT_CHANNEL_CAPACITY};
use crate::version::{PgVersion, Toolset, DEFAULT_TOOLS_ROOT};
use crate::wrapper::{DumpOptions, PgDump, Psql};
use crate::PostgresError;

/// Versions reported by the client tools of one toolset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolVersions {
    pub pg_dump: String,
    pub psql: String,
}

/// Main entry point for connection tests, dumps and restores.
///
/// Each call owns its own processes and streams; a manager can be shared
/// between concurrent requests.
#[derive(Debug, Clone)]
pub struct PostgresManager {
    tools_root: PathBuf,
    channel_capacity: usize,
    http: reqwest::Client,
}

impl Default for PostgresManager {
    fn default() -> Self {
        Self::new(DEFAULT_TOOLS_ROOT)
    }
}

impl PostgresManager {
    pub fn new(tools_root: impl Into<PathBuf>) -> Self {
        Self {
            tools_root: tools_root.into(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            http: reqwest::Client::new(),
        }
    }

    /// Sets how many chunks may be buffered between two pipeline stages.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Sets the connect timeout used when fetching remote archives. There is
    /// no overall timeout since archives can be arbitrarily large.
    pub fn with_http_connect_timeout(mut self, timeout: Duration) -> Result<Self, PostgresError> {
        self.http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| {
                PostgresError::AcquisitionError(format!("cannot build HTTP client: {e}"))
            })?;
        Ok(self)
    }

    pub fn tools_root(&self) -> &Path {
        &self.tools_root
    }

    pub fn toolset(&self, version: PgVersion) -> Toolset {
        version.toolset(&self.tools_root)
    }

    /// Tests the connection to the PostgreSQL database
    pub async fn test(&self, version: PgVersion, conn_string: &str) -> Result<(), PostgresError> {
        info!("Testing connection with psql v{version}");
        Psql::probe(&self.toolset(version), conn_string).await
    }

    /// Checks that both client tools of `version` are installed and runnable.
    pub async fn check_tools(&self, version: PgVersion) -> Result<ToolVersions, PostgresError> {
        let toolset = self.toolset(version);
        Ok(ToolVersions {
            pg_dump: PgDump::version(&toolset).await?,
            psql: Psql::version(&toolset).await?,
        })
    }

    /// Runs pg_dump and returns the SQL dump as a stream.
    pub fn dump(
        &self,
        version: PgVersion,
        conn_string: &str,
        options: &DumpOptions,
    ) -> Result<ByteStream, PostgresError> {
        self.dump_with_cancel(version, conn_string, options, CancellationToken::new())
    }

    pub fn dump_with_cancel(
        &self,
        version: PgVersion,
        conn_string: &str,
        options: &DumpOptions,
        cancel: CancellationToken,
    ) -> Result<ByteStream, PostgresError> {
        PgDump::stream(
            &self.toolset(version),
            conn_string,
            options,
            self.channel_capacity,
            cancel,
        )
    }

    /// Runs pg_dump and returns the dump packaged as a ZIP with a single
    /// `dump.sql` entry.
    pub fn dump_zip(
        &self,
        version: PgVersion,
        conn_string: &str,
        options: &DumpOptions,
    ) -> Result<ByteStream, PostgresError> {
        self.dump_zip_with_cancel(version, conn_string, options, CancellationToken::new())
    }

    pub fn dump_zip_with_cancel(
        &self,
        version: PgVersion,
        conn_string: &str,
        options: &DumpOptions,
        cancel: CancellationToken,
    ) -> Result<ByteStream, PostgresError> {
        let dump = self.dump_with_cancel(version, conn_string, options, cancel)?;
        Ok(archive::package_with_capacity(dump, self.channel_capacity))
    }

    /// Fetches a ZIP produced by [`dump_zip`](Self::dump_zip), unpacks its
    /// `dump.sql` entry on the fly and pipes it into psql.
    pub async fn restore(
        &self,
        version: PgVersion,
        conn_string: &str,
        source: RestoreSource,
    ) -> Result<(), PostgresError> {
        self.restore_with_cancel(version, conn_string, source, CancellationToken::new())
            .await
    }

    pub async fn restore_with_cancel(
        &self,
        version: PgVersion,
        conn_string: &str,
        source: RestoreSource,
        cancel: CancellationToken,
    ) -> Result<(), PostgresError> {
        let toolset = self.toolset(version);
        RestorePipeline {
            toolset: &toolset,
            conn_string,
            http: &self.http,
            capacity: self.channel_capacity,
        }
        .run(source, cancel)
        .await
    }
}
