use log::{debug, info};
use std::process::Stdio;
use tokio::process::{Child, Command};

use super::{redact, tool_unavailable, tool_version};
use crate::version::Toolset;
use crate::PostgresError;

/// Wrapper for the psql interactive terminal
pub struct Psql;

impl Psql {
    /// Runs `SELECT 1;` against `conn_string` to check that the server is
    /// reachable and the credentials are accepted.
    pub async fn probe(toolset: &Toolset, conn_string: &str) -> Result<(), PostgresError> {
        debug!(
            "Running psql probe: {} {} -c 'SELECT 1;'",
            toolset.psql.display(),
            redact(conn_string)
        );

        let output = Command::new(&toolset.psql)
            .arg(conn_string)
            .args(["-c", "SELECT 1;"])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| tool_unavailable(&toolset.psql, e))?;

        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            let combined = combined.trim();
            return Err(PostgresError::ConnectionError {
                version: toolset.label().to_string(),
                output: if combined.is_empty() {
                    format!("psql {}", output.status)
                } else {
                    combined.to_string()
                },
            });
        }

        info!("psql v{} connection test succeeded", toolset.label());
        Ok(())
    }

    /// Starts psql reading SQL from a piped stdin. Its own output goes
    /// straight to the operator.
    pub fn ingest(toolset: &Toolset, conn_string: &str) -> Result<Child, PostgresError> {
        debug!(
            "Running psql restore: {} {}",
            toolset.psql.display(),
            redact(conn_string)
        );

        Command::new(&toolset.psql)
            .arg(conn_string)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| tool_unavailable(&toolset.psql, e))
    }

    /// Returns the output of `psql --version`.
    pub async fn version(toolset: &Toolset) -> Result<String, PostgresError> {
        tool_version(&toolset.psql).await
    }
}
