//! # cadastre-ingest CLI (`cadingest`)
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cadingest init` | Create the target schema and tables (DDL only) |
//! | `cadingest ingest <path> --date YYYY-MM` | Decode and load archives |
//! | `cadingest inspect <path>` | Decode archives and print a summary |
//!
//! Connection parameters come from `PGHOST`, `PGPORT`, `PGDATABASE`,
//! `PGUSER`, `PGPASSWORD` and `PGSSLMODE`; the `--host`/`--port`/… flags
//! override them. The exit code is non-zero when any archive fails.
//!
//! ```bash
//! # Load the 2025-04 millésime of one département into schema "cadastre"
//! cadingest ingest /data/edigeo/38 --date 2025-04 --dep fromFile
//!
//! # Buildings only, into Web Mercator, 8 workers
//! cadingest ingest /data/edigeo --date 2025-04 --config bati --srid 3857 --jobs 8
//!
//! # Spatial department resolution against a boundary file
//! cadingest ingest /data/edigeo --date 2025-04 --dep auto \
//!     --departments departements.geojson
//! ```

use std::path::PathBuf;

use cadastre_ingest::{db, ingest, inspect};

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// EDIGEO cadastral archives → PostGIS.
#[derive(Parser)]
#[command(
    name = "cadingest",
    version,
    about = "Decode French EDIGEO cadastral archives and load them into PostGIS"
)]
struct Cli {
    /// Increase verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// PostgreSQL connection overrides; unset values fall back to `PG*`
/// environment variables.
#[derive(Args, Debug)]
struct PgArgs {
    /// PostgreSQL host.
    #[arg(long)]
    host: Option<String>,

    /// PostgreSQL port.
    #[arg(long)]
    port: Option<u16>,

    /// Database name.
    #[arg(long)]
    database: Option<String>,

    /// Database user.
    #[arg(long)]
    user: Option<String>,

    /// Database password.
    #[arg(long)]
    password: Option<String>,

    /// SSL mode: disable, allow, prefer, require, verify-ca, verify-full.
    #[arg(long)]
    ssl: Option<String>,
}

impl PgArgs {
    fn into_config(self) -> db::DbConfig {
        let mut config = db::DbConfig::from_env();
        config.apply_overrides(
            self.host,
            self.port,
            self.database,
            self.user,
            self.password,
            self.ssl,
        );
        config
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create the target schema and tables without loading anything.
    ///
    /// Runs the same DDL as `ingest`: tables from the config, geometry
    /// columns typed with the target SRID, GiST indexes, the incremental
    /// journal. Idempotent unless a drop flag is set.
    Init {
        /// Target schema.
        #[arg(long, default_value = "cadastre")]
        schema: String,

        /// Config preset (full, light, bati) or path to a JSON config.
        #[arg(long, default_value = "full")]
        config: String,

        /// Output SRID for geometry columns.
        #[arg(long, default_value_t = 4326)]
        srid: u32,

        /// Drop the whole schema first.
        #[arg(long)]
        drop_schema: bool,

        /// Drop the configured tables first (schema kept).
        #[arg(long)]
        drop_table: bool,

        #[command(flatten)]
        pg: PgArgs,
    },

    /// Decode EDIGEO archives and load them into PostGIS.
    ///
    /// Walks the source recursively for `*.tar.bz2` archives (or takes a
    /// single archive), processes them across a worker pool, and skips
    /// archives whose content checksum is already journalled.
    Ingest {
        /// Directory tree or single `.tar.bz2` archive.
        path: PathBuf,

        /// Millésime of the release (YYYY-MM, e.g. 2025-04).
        #[arg(short, long)]
        date: String,

        /// Target schema.
        #[arg(long, default_value = "cadastre")]
        schema: String,

        /// Config preset (full, light, bati) or path to a JSON config.
        #[arg(long, default_value = "full")]
        config: String,

        /// Output SRID (4326 or 3857).
        #[arg(long, default_value_t = 4326)]
        srid: u32,

        /// Coordinate precision in decimals. Default: 7 for SRID 4326,
        /// 2 for metric SRIDs.
        #[arg(long)]
        precision: Option<u8>,

        /// Worker count; capped at the host CPU count.
        #[arg(long, alias = "threads")]
        jobs: Option<usize>,

        /// Department policy: `auto` (spatial lookup), `fromFile`
        /// (archive name), or a literal code such as `38` or `2A`.
        #[arg(long, default_value = "fromFile")]
        dep: String,

        /// Department boundary GeoJSON, required with `--dep auto`.
        #[arg(long)]
        departments: Option<PathBuf>,

        /// Drop the whole schema before loading.
        #[arg(long)]
        drop_schema: bool,

        /// Drop the configured tables before loading (schema kept).
        #[arg(long)]
        drop_table: bool,

        #[command(flatten)]
        pg: PgArgs,
    },

    /// Decode archives and print their content, no database required.
    Inspect {
        /// Directory tree or single `.tar.bz2` archive.
        path: PathBuf,
    },
}

fn init_tracing(verbosity: u8) {
    let default = match verbosity {
        0 => "cadastre_ingest=info",
        1 => "cadastre_ingest=info,cadastre_ingest::ingest=debug",
        _ => "cadastre_ingest=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Init {
            schema,
            config,
            srid,
            drop_schema,
            drop_table,
            pg,
        } => {
            let db_config = pg.into_config();
            ingest::run_init(&db_config, &schema, &config, srid, drop_schema, drop_table)
                .await?;
        }
        Commands::Ingest {
            path,
            date,
            schema,
            config,
            srid,
            precision,
            jobs,
            dep,
            departments,
            drop_schema,
            drop_table,
            pg,
        } => {
            let db_config = pg.into_config();
            let options = ingest::IngestOptions {
                source: path,
                date: date.clone(),
                schema,
                config_spec: config,
                target_epsg: srid,
                precision,
                jobs,
                dep,
                departments,
                drop_schema,
                drop_table,
                verbosity: cli.verbose,
            };
            let report = ingest::run_ingest(&options, &db_config).await?;
            report.print_summary(&date);
            if !report.is_success() {
                std::process::exit(1);
            }
        }
        Commands::Inspect { path } => {
            inspect::run_inspect(&path)?;
        }
    }

    Ok(())
}
