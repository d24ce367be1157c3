pub mod commands;

use std::path::PathBuf;

use crate::version::PgVersion;
use crate::wrapper::DumpOptions;

#[derive(clap::Subcommand, Debug)]
pub enum PostgresqlCommands {
    /// Check that a database accepts connections
    Test {
        /// PostgreSQL client version (13 to 17)
        #[clap(long = "pg-version", value_parser = PgVersion::resolve)]
        pg_version: PgVersion,

        /// Connection string passed to psql
        #[clap(long)]
        conn: String,
    },

    /// Check that pg_dump and psql are installed for a version
    CheckTools {
        /// PostgreSQL client version (13 to 17)
        #[clap(long = "pg-version", value_parser = PgVersion::resolve)]
        pg_version: PgVersion,
    },

    /// Dump a database as SQL, optionally packaged as a ZIP archive
    Dump {
        /// PostgreSQL client version (13 to 17)
        #[clap(long = "pg-version", value_parser = PgVersion::resolve)]
        pg_version: PgVersion,

        /// Connection string passed to pg_dump
        #[clap(long)]
        conn: String,

        /// Package the dump as a ZIP archive with a single dump.sql entry
        #[clap(long)]
        zip: bool,

        /// Write to this file instead of stdout
        #[clap(long, short)]
        output: Option<PathBuf>,

        #[clap(flatten)]
        flags: DumpFlags,
    },

    /// Restore a ZIP archive produced by `dump --zip`
    Restore {
        /// PostgreSQL client version (13 to 17)
        #[clap(long = "pg-version", value_parser = PgVersion::resolve)]
        pg_version: PgVersion,

        /// Connection string passed to psql
        #[clap(long)]
        conn: String,

        /// Local archive to restore
        #[clap(long, conflicts_with = "url", required_unless_present = "url")]
        file: Option<PathBuf>,

        /// HTTP(S) URL of the archive to restore
        #[clap(long)]
        url: Option<String>,
    },
}

#[derive(clap::Args, Debug, Clone, Copy, Default)]
pub struct DumpFlags {
    /// Dump only the data, not the schema
    #[clap(long)]
    pub data_only: bool,

    /// Dump only the object definitions, not the data
    #[clap(long)]
    pub schema_only: bool,

    /// Drop database objects before recreating them
    #[clap(long)]
    pub clean: bool,

    /// Use IF EXISTS when dropping objects (requires --clean)
    #[clap(long)]
    pub if_exists: bool,

    /// Include commands to create the database itself
    #[clap(long)]
    pub create: bool,

    /// Do not dump comments
    #[clap(long)]
    pub no_comments: bool,
}

impl From<DumpFlags> for DumpOptions {
    fn from(flags: DumpFlags) -> Self {
        DumpOptions {
            data_only: flags.data_only,
            schema_only: flags.schema_only,
            clean: flags.clean,
            if_exists: flags.if_exists,
            create: flags.create,
            no_comments: flags.no_comments,
        }
    }
}
