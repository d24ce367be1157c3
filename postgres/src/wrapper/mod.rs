pub mod pg_dump;
pub mod psql;

// Re-export for convenience
pub use pg_dump::{DumpOptions, PgDump};
pub use psql::Psql;

use crate::PostgresError;
use log::debug;
use regex::Regex;
use std::borrow::Cow;
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::process::Command;

/// Hides passwords in key/value and URI style connection strings so command
/// lines can be logged.
pub fn redact(conn_string: &str) -> Cow<'_, str> {
    static PATTERNS: OnceLock<(Regex, Regex)> = OnceLock::new();
    let (pair, uri) = PATTERNS.get_or_init(|| {
        (
            Regex::new(r"(?i)(password\s*=\s*)('(?:[^'\\]|\\.)*'|\S+)").expect("valid regex"),
            Regex::new(r"(://[^:/@\s]+:)[^@\s]+@").expect("valid regex"),
        )
    });

    match pair.replace_all(conn_string, "${1}***") {
        Cow::Borrowed(s) => uri.replace_all(s, "${1}***@"),
        Cow::Owned(s) => Cow::Owned(uri.replace_all(&s, "${1}***@").into_owned()),
    }
}

pub(crate) fn tool_unavailable(path: &Path, err: impl std::fmt::Display) -> PostgresError {
    PostgresError::ToolUnavailable {
        tool: path.display().to_string(),
        reason: err.to_string(),
    }
}

/// Runs `<tool> --version` and returns its trimmed output.
pub(crate) async fn tool_version(path: &Path) -> Result<String, PostgresError> {
    let output = Command::new(path)
        .arg("--version")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| tool_unavailable(path, e))?;

    if !output.status.success() {
        return Err(tool_unavailable(
            path,
            format!(
                "--version {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }

    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    debug!("{} version: {version}", path.display());
    Ok(version)
}
