use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use common::config::{load_config, ShuttleConfig};
use postgres::cli::{commands, PostgresqlCommands};
use postgres::version::PgVersion;
use postgres::PostgresManager;

#[derive(Parser, Debug)]
#[clap(
    name = "pgshuttle",
    about = "Streams pg_dump output and restores it with psql",
    version
)]
struct Cli {
    /// Configuration file, applied on top of the default locations
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List supported PostgreSQL versions and their tool paths
    Versions,

    /// Print the effective configuration
    Config,

    /// PostgreSQL dump and restore commands
    #[clap(subcommand)]
    Postgresql(PostgresqlCommands),
}

fn build_manager(config: &ShuttleConfig) -> Result<PostgresManager> {
    Ok(PostgresManager::new(config.tools_root())
        .with_channel_capacity(config.pipeline.channel_capacity)
        .with_http_connect_timeout(Duration::from_secs(
            config.pipeline.http_connect_timeout_secs,
        ))?)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .format_timestamp(None)
        .format_level(true)
        .format_module_path(false)
        .format_indent(Some(4))
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .try_init()?;

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Versions => {
            let root = config.tools_root();
            for version in PgVersion::ALL {
                let toolset = version.toolset(&root);
                println!(
                    "{version}\t{}\t{}",
                    toolset.pg_dump.display(),
                    toolset.psql.display()
                );
            }
        }
        Commands::Config => {
            print!("{}", config.render()?);
        }
        Commands::Postgresql(postgres_command) => {
            let manager = build_manager(&config)?;
            match postgres_command {
                PostgresqlCommands::Test { pg_version, conn } => {
                    commands::test(&manager, pg_version, &conn).await?
                }
                PostgresqlCommands::CheckTools { pg_version } => {
                    commands::check_tools(&manager, pg_version).await?
                }
                PostgresqlCommands::Dump {
                    pg_version,
                    conn,
                    zip,
                    output,
                    flags,
                } => {
                    commands::dump(
                        &manager,
                        pg_version,
                        &conn,
                        zip,
                        output,
                        flags.into(),
                        commands::cancel_on_ctrl_c(),
                    )
                    .await?
                }
                PostgresqlCommands::Restore {
                    pg_version,
                    conn,
                    file,
                    url,
                } => {
                    commands::restore(
                        &manager,
                        pg_version,
                        &conn,
                        file,
                        url,
                        commands::cancel_on_ctrl_c(),
                    )
                    .await?
                }
            }
        }
    }

    Ok(())
}
