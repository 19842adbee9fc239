use anyhow::{Context, Result};
use cdb_core::{parse_db_time, SqlQualifiers, ValidityContext};
use cdb_storage::{
    Cascade, CascadeConfig, ConfigSet, L2Cache, QuerySettings, SeqNoScope, TableProxy,
};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cdb")]
#[command(about = "Conditions database cascade client", long_about = None)]
struct Cli {
    /// Cascade definition (TOML); falls back to CDB_CASCADE_URLS
    #[arg(long, env = "CDB_CONFIG")]
    config: Option<PathBuf>,
    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "warn")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the cascade status table
    Status,
    /// Resolve a table for one validity context
    Query {
        #[arg(long)]
        table: String,
        /// Query time as "YYYY-MM-DD HH:MM:SS" (UTC)
        #[arg(long)]
        time: String,
        #[arg(long)]
        detector: i32,
        #[arg(long)]
        sim: i32,
        #[arg(long, default_value_t = 0)]
        task: i32,
        /// Extra SQL applied to the validity query
        #[arg(long)]
        context: Option<String>,
        /// Extra SQL applied to the data query
        #[arg(long)]
        data: Option<String>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Allocate the next sequence number for a table
    Seqno {
        #[arg(long)]
        table: String,
        #[arg(long, default_value_t = 0)]
        db: usize,
        #[arg(long, conflicts_with = "local")]
        global: bool,
        #[arg(long)]
        local: bool,
    },
    /// Create the temporary tables listed in a SQL file
    TmpTables {
        #[arg(long)]
        file: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(path: Option<&Path>) -> Result<CascadeConfig> {
    match path {
        Some(path) => CascadeConfig::load(path)
            .with_context(|| format!("Failed to load cascade config {}", path.display())),
        None => CascadeConfig::from_env().context("No --config given and CDB_CASCADE_URLS unusable"),
    }
}

fn seq_no_scope(global: bool, local: bool) -> SeqNoScope {
    if global {
        SeqNoScope::Global
    } else if local {
        SeqNoScope::Local
    } else {
        SeqNoScope::Auto
    }
}

fn row_json(row: &ConfigSet) -> Value {
    let mut object = Map::new();
    for param in row.params() {
        object.insert(param.name.clone(), Value::String(param.value.clone()));
    }
    Value::Object(object)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);
    let config = load_config(cli.config.as_deref())?;
    let mut cascade = Cascade::open(&config).context("Failed to open cascade")?;

    match cli.command {
        Commands::Status => {
            print!("{cascade}");
        }
        Commands::Query {
            table,
            time,
            detector,
            sim,
            task,
            context,
            data,
            format,
        } => {
            let timestamp = parse_db_time(&time).context("Invalid --time")?;
            let validity_context = ValidityContext::new(detector, sim, timestamp);
            let qualifiers = SqlQualifiers::new(
                context.unwrap_or_default(),
                data.unwrap_or_default(),
                "",
            );

            let mut proxy = TableProxy::<ConfigSet>::new(&table, QuerySettings::from_config(&config));
            if let Some(dir) = &config.l2_cache_dir {
                proxy = proxy.with_l2_cache(L2Cache::new(dir));
            }
            let result = proxy
                .query(&mut cascade, &validity_context, task, &qualifiers)
                .with_context(|| format!("Query of {table} failed"))?;
            info!(event = "cli_query", table = %table, rows = result.num_rows());

            match format {
                OutputFormat::Text => {
                    println!("Validity: {}", result.validity());
                    println!("Rows: {}", result.num_rows());
                    for row in result.rows() {
                        println!("  {row}");
                    }
                }
                OutputFormat::Json => {
                    let rows: Vec<Value> = result.rows().map(row_json).collect();
                    let output = json!({
                        "table": result.table_name(),
                        "validity": result.validity(),
                        "aggregated": result.is_aggregate(),
                        "rows": rows,
                    });
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
            }
        }
        Commands::Seqno {
            table,
            db,
            global,
            local,
        } => {
            let seq_no = cascade
                .allocate_seq_no(&table, seq_no_scope(global, local), db)
                .with_context(|| format!("Failed to allocate a sequence number for {table}"))?;
            println!("{seq_no}");
        }
        Commands::TmpTables { file } => {
            let created = cascade
                .process_tmp_tbls_file(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            println!("Created {created} temporary table(s)");
            print!("{cascade}");
        }
    }

    Ok(())
}
