//! Supported PostgreSQL versions and the client tools bound to each one.
//!
//! Only versions covered by the PostgreSQL versioning policy
//! (<https://www.postgresql.org/support/versioning/>) are listed here. Backing up
//! a database with an unsupported toolset is not allowed, so a new major
//! version needs an explicit variant before it can be used.

use crate::PostgresError;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Directory holding one `<major>/bin` tree per installed PostgreSQL version.
pub const DEFAULT_TOOLS_ROOT: &str = "/usr/lib/postgresql";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PgVersion {
    V13,
    V14,
    V15,
    V16,
    V17,
}

impl PgVersion {
    pub const ALL: [PgVersion; 5] = [
        PgVersion::V13,
        PgVersion::V14,
        PgVersion::V15,
        PgVersion::V16,
        PgVersion::V17,
    ];

    /// Resolve an untrusted version label into a supported version.
    pub fn resolve(label: &str) -> Result<Self, PostgresError> {
        match label {
            "13" => Ok(PgVersion::V13),
            "14" => Ok(PgVersion::V14),
            "15" => Ok(PgVersion::V15),
            "16" => Ok(PgVersion::V16),
            "17" => Ok(PgVersion::V17),
            other => Err(PostgresError::UnsupportedVersion(other.to_string())),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PgVersion::V13 => "13",
            PgVersion::V14 => "14",
            PgVersion::V15 => "15",
            PgVersion::V16 => "16",
            PgVersion::V17 => "17",
        }
    }

    /// Binds this version to the `pg_dump` and `psql` binaries below `root`.
    pub fn toolset(self, root: &Path) -> Toolset {
        let bin = root.join(self.label()).join("bin");
        Toolset {
            version: self,
            pg_dump: bin.join("pg_dump"),
            psql: bin.join("psql"),
        }
    }
}

impl FromStr for PgVersion {
    type Err = PostgresError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PgVersion::resolve(s)
    }
}

impl fmt::Display for PgVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The pair of client binaries used for one PostgreSQL version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolset {
    pub version: PgVersion,
    pub pg_dump: PathBuf,
    pub psql: PathBuf,
}

impl Toolset {
    pub fn label(&self) -> &'static str {
        self.version.label()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_every_supported_label() {
        for version in PgVersion::ALL {
            let resolved = PgVersion::resolve(version.label()).unwrap();
            assert_eq!(resolved, version);

            let toolset = resolved.toolset(Path::new(DEFAULT_TOOLS_ROOT));
            let bin = format!("/usr/lib/postgresql/{}/bin/", version.label());
            assert!(toolset.pg_dump.to_string_lossy().starts_with(&bin));
            assert!(toolset.psql.to_string_lossy().starts_with(&bin));
            assert!(toolset.pg_dump.ends_with("pg_dump"));
            assert!(toolset.psql.ends_with("psql"));
        }
    }

    #[test]
    fn rejects_labels_outside_the_supported_set() {
        for label in ["9", "12", "18", "", "latest", " 16", "16.2"] {
            match PgVersion::resolve(label) {
                Err(PostgresError::UnsupportedVersion(rejected)) => assert_eq!(rejected, label),
                other => panic!("label {label:?} resolved unexpectedly: {other:?}"),
            }
        }
    }

    #[test]
    fn toolsets_differ_per_version() {
        let root = Path::new("/opt/pg");
        let v15 = PgVersion::V15.toolset(root);
        let v16 = PgVersion::V16.toolset(root);
        assert_ne!(v15.pg_dump, v16.pg_dump);
        assert_ne!(v15.psql, v16.psql);
        assert_eq!(v16.psql, Path::new("/opt/pg/16/bin/psql"));
    }

    #[test]
    fn parses_and_displays_labels() {
        let version: PgVersion = "17".parse().unwrap();
        assert_eq!(version.to_string(), "17");
        assert!("latest".parse::<PgVersion>().is_err());
    }
}
