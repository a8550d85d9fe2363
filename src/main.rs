use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use recordgraph::config::{StoreBackend, StoreConfig};
use recordgraph::database::{establish_connection, get_database_url, migrate_database, MigrateDirection};
use recordgraph::store::{self, ScanFilter};

#[derive(Parser)]
#[clap(author, version, about)]
struct Cli {
    #[clap(short, long, global = true)]
    log_level: Option<String>,
    /// YAML store configuration
    #[clap(short, long, global = true)]
    config: Option<PathBuf>,
    /// SQLite database file, overrides the configured URL
    #[clap(short, long, global = true)]
    database: Option<String>,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Db {
        #[clap(subcommand)]
        command: DbCommands,
    },
    Sequence {
        #[clap(subcommand)]
        command: SequenceCommands,
    },
    Records {
        #[clap(subcommand)]
        command: RecordCommands,
    },
}

#[derive(Subcommand, Debug)]
enum DbCommands {
    Init,
    Migrate {
        #[clap(subcommand)]
        direction: MigrateDirection,
    },
}

#[derive(Subcommand, Debug)]
enum SequenceCommands {
    /// Draw the next value of a named sequence
    Next { name: String },
}

#[derive(Subcommand, Debug)]
enum RecordCommands {
    List {
        type_name: String,
        #[clap(short, long)]
        tenant: Option<Uuid>,
        #[clap(long)]
        include_deleted: bool,
    },
    Show {
        type_name: String,
        key: String,
    },
}

fn load_config(cli: &Cli) -> Result<StoreConfig> {
    let mut config = match &cli.config {
        Some(path) => StoreConfig::load(path)?,
        None => {
            let mut config = StoreConfig::default();
            config.apply_env();
            config
        }
    };
    if let Some(database) = &cli.database {
        config.backend = StoreBackend::Sqlite;
        config.database_url = get_database_url(Some(database));
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    setup_logging(&args.log_level);
    let config = load_config(&args)?;

    match args.command {
        Commands::Db { command } => {
            let db = establish_connection(&config)
                .await
                .with_context(|| format!("cannot connect to {}", config.database_url))?;
            match command {
                DbCommands::Init => {
                    info!("Initializing database: {}", config.database_url);
                    migrate_database(&db, MigrateDirection::Up).await?;
                }
                DbCommands::Migrate { direction } => {
                    info!("Running database migration: {:?}", direction);
                    migrate_database(&db, direction).await?;
                }
            }
        }
        Commands::Sequence { command } => match command {
            SequenceCommands::Next { name } => {
                let store = store::from_config(&config).await?;
                let value = store.as_reader().next_sequence_value(&name).await?;
                println!("{}", value);
            }
        },
        Commands::Records { command } => {
            let store = store::from_config(&config).await?;
            match command {
                RecordCommands::List {
                    type_name,
                    tenant,
                    include_deleted,
                } => {
                    let filter = ScanFilter::new(type_name)
                        .tenant(tenant)
                        .include_deleted(include_deleted);
                    let records = store.as_reader().scan(&filter).await?;
                    info!("Found {} records", records.len());
                    for record in records {
                        println!("{}\t{}\t{}", record.key, record.version, record.data);
                    }
                }
                RecordCommands::Show { type_name, key } => {
                    let record = store
                        .as_reader()
                        .load(&type_name, &key)
                        .await?
                        .with_context(|| format!("{} '{}' not found", type_name, key))?;
                    println!("{}", serde_json::to_string_pretty(&record.data)?);
                }
            }
        }
    }

    Ok(())
}

fn setup_logging(log_level: &Option<String>) {
    let log_level = match log_level
        .as_ref()
        .unwrap_or(&"info".to_string())
        .to_lowercase()
        .as_str()
    {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(format!("sqlx=warn,{}", log_level)))
        .without_time()
        .init();
}
