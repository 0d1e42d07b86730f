use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use underpass::{applier, areafilter::AreaFilter, changeset, config, error, info, pbf, replication, store::Store, tasker::Tasker, warn};

/// `DateTime<Utc>` has no blanket `FromStr`, only `DateTime<FixedOffset>`
/// does; parse as RFC3339 and normalise to UTC for the CLI layer.
fn parse_instant(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("invalid ISO-8601 timestamp {s:?}: {e}"))
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bootstrap a fresh store from a PBF snapshot.
    Bootstrap {
        #[arg(long, help = "Path to the .osm.pbf snapshot to ingest")]
        pbf: PathBuf,
        #[arg(long, help = "Database connection string")]
        database_url: Option<String>,
        #[arg(long, default_value = "ddl", help = "Directory holding tables.sql/indexes.sql")]
        ddl_dir: PathBuf,
        #[arg(long, help = "Worker pool size, defaults to available CPUs")]
        concurrency: Option<usize>,
        #[arg(long, default_value_t = config::DEFAULT_PAGE_SIZE, help = "Batching page size")]
        page_size: usize,
    },
    /// Apply the minutely/hourly/daily replication stream.
    Replicate {
        #[arg(long, help = "Database connection string")]
        database_url: Option<String>,
        #[arg(long, value_parser = parse_instant, help = "Starting wall-clock instant, ISO-8601")]
        start_time: DateTime<Utc>,
        #[arg(long, value_enum, default_value = "minute", help = "Replication frequency")]
        frequency: CliFrequency,
        #[arg(long, help = "Replication server base URL")]
        server: Option<String>,
        #[arg(long, help = "Stop once this sequence number is reached")]
        max_sequence: Option<u64>,
        #[arg(long, help = "Path to a .poly file describing the area of interest")]
        aoi: Option<PathBuf>,
        #[arg(long, help = "Directory to cache downloaded artefacts in")]
        cache_dir: Option<PathBuf>,
    },
    /// Apply the changeset metadata stream.
    Changesets {
        #[arg(long, help = "Database connection string")]
        database_url: Option<String>,
        #[arg(long, value_parser = parse_instant, help = "Starting wall-clock instant, ISO-8601")]
        start_time: DateTime<Utc>,
        #[arg(long, help = "Replication server base URL")]
        server: Option<String>,
        #[arg(long, help = "Stop once this sequence number is reached")]
        max_sequence: Option<u64>,
        #[arg(long, help = "Directory to cache downloaded artefacts in")]
        cache_dir: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum CliFrequency {
    Minute,
    Hour,
    Day,
}

impl From<CliFrequency> for replication::Frequency {
    fn from(value: CliFrequency) -> Self {
        match value {
            CliFrequency::Minute => replication::Frequency::Minutely,
            CliFrequency::Hour => replication::Frequency::Hourly,
            CliFrequency::Day => replication::Frequency::Daily,
        }
    }
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(args) {
        error!("{e}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> underpass::error::Result<()> {
    match args.command {
        Command::Bootstrap { pbf: pbf_path, database_url, ddl_dir, concurrency, page_size } => {
            run_bootstrap(&pbf_path, database_url.as_deref(), &ddl_dir, concurrency, page_size)
        }
        Command::Replicate { database_url, start_time, frequency, server, max_sequence, aoi, cache_dir } => {
            run_replicate(database_url.as_deref(), start_time, frequency.into(), server.as_deref(), max_sequence, aoi.as_deref(), cache_dir)
        }
        Command::Changesets { database_url, start_time, server, max_sequence, cache_dir } => {
            run_changesets(database_url.as_deref(), start_time, server.as_deref(), max_sequence, cache_dir)
        }
    }
}

fn resolve_database_url(flag: Option<&str>) -> underpass::error::Result<String> {
    config::database_url(flag).ok_or_else(|| {
        underpass::error::Error::Local(
            "no database URL given: pass --database-url or set UNDERPASS_DATABASE_URL".to_string(),
        )
    })
}

fn run_bootstrap(
    pbf_path: &std::path::Path,
    database_url: Option<&str>,
    ddl_dir: &std::path::Path,
    concurrency: Option<usize>,
    page_size: usize,
) -> underpass::error::Result<()> {
    let database_url = resolve_database_url(database_url)?;
    let store = Store::connect(&database_url)?;
    info!("initializing schema from {}", ddl_dir.display());
    store.initialize(ddl_dir)?;

    let concurrency = concurrency.unwrap_or_else(config::default_concurrency);
    let mut tasker = Tasker::new(&store, page_size, concurrency);
    pbf::bootstrap(pbf_path, &mut tasker)?;

    info!("creating indexes");
    store.create_indexes(ddl_dir)?;
    Ok(())
}

fn run_replicate(
    database_url: Option<&str>,
    start_time: chrono::DateTime<chrono::Utc>,
    frequency: replication::Frequency,
    server: Option<&str>,
    max_sequence: Option<u64>,
    aoi: Option<&std::path::Path>,
    cache_dir: Option<PathBuf>,
) -> underpass::error::Result<()> {
    let database_url = resolve_database_url(database_url)?;
    let store = Store::connect(&database_url)?;
    let area = match aoi {
        Some(path) => AreaFilter::from_poly_file(path)?,
        None => AreaFilter::default(),
    };
    let change_applier = applier::Applier::new(&store, &area);

    let server = config::planet_server(server);
    let client = replication::Client::new(cache_dir);
    let mut cursor = client.locate_sequence(&server, frequency, start_time)?;

    loop {
        if let Some(max) = max_sequence {
            if cursor.sequence() > max {
                info!("reached max sequence {max}, stopping");
                break;
            }
        }
        let state = match client.download(&cursor.state_url()) {
            Ok(body) => String::from_utf8_lossy(&body).into_owned(),
            Err(underpass::error::Error::RemoteNotFound(_)) => {
                info!("no further state file at sequence {}, caught up", cursor.sequence());
                break;
            }
            Err(e) => return Err(e),
        };
        let _state = replication::parse_state_file(&state)?;

        let body = client.download(&cursor.data_url())?;
        let xml = replication::Client::gunzip(&body)?;
        let entities = applier::parse_osmchange(&xml)?;
        change_applier.apply(entities)?;

        info!("applied sequence {}", cursor.sequence());
        cursor.increment();
    }
    Ok(())
}

fn run_changesets(
    database_url: Option<&str>,
    start_time: chrono::DateTime<chrono::Utc>,
    server: Option<&str>,
    max_sequence: Option<u64>,
    cache_dir: Option<PathBuf>,
) -> underpass::error::Result<()> {
    let database_url = resolve_database_url(database_url)?;
    let store = Store::connect(&database_url)?;

    let server = config::planet_server(server);
    let client = replication::Client::new(cache_dir);
    let mut cursor = client.locate_sequence(&server, replication::Frequency::Changeset, start_time)?;

    loop {
        if let Some(max) = max_sequence {
            if cursor.sequence() > max {
                info!("reached max sequence {max}, stopping");
                break;
            }
        }
        let body = match client.download(&cursor.data_url()) {
            Ok(body) => body,
            Err(underpass::error::Error::RemoteNotFound(_)) => {
                info!("no further changeset file at sequence {}, caught up", cursor.sequence());
                break;
            }
            Err(e) => return Err(e),
        };
        match changeset::parse(&body) {
            Ok(changesets) => {
                changeset::persist(&store, &changesets)?;
                info!("applied {} changesets at sequence {}", changesets.len(), cursor.sequence());
            }
            Err(e) => warn!("skipping malformed changeset file at sequence {}: {e}", cursor.sequence()),
        }
        cursor.increment();
    }
    Ok(())
}
