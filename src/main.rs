use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use errol_schema::config::AppConfig;
use errol_schema::initializer::{ConflictPolicy, InitOptions, SchemaInitializer};
use errol_schema::logging::init_logging;
use errol_schema::store::{DocumentStore, MongoStore, SqliteStore};
use errol_schema::SchemaCatalog;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file layered over config/default and config/local
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (overrides configuration, RUST_LOG wins over both)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Mongo,
    Sqlite,
}

#[derive(Subcommand)]
enum Commands {
    /// Create missing collections and indexes
    Init {
        /// Schema profile to apply (repeatable, defaults from configuration or catalog)
        #[arg(short, long = "profile")]
        profiles: Vec<String>,

        /// Storage backend
        #[arg(short, long, value_enum)]
        backend: Option<Backend>,

        /// Replace validators that differ instead of failing
        #[arg(long)]
        update_validators: bool,
    },
    /// Report differences between the database and the profiles
    Verify {
        /// Schema profile to check (repeatable)
        #[arg(short, long = "profile")]
        profiles: Vec<String>,

        /// Storage backend
        #[arg(short, long, value_enum)]
        backend: Option<Backend>,
    },
    /// List catalog profiles and their collections
    List,
    /// Print the validators of a profile as sent to the database
    Show {
        /// Schema profile
        #[arg(short, long)]
        profile: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(level) = &cli.log_level {
        config.override_log_level(level)?;
    }

    // Initialize logging
    let _guard = init_logging(
        Some(&config.get_log_level()),
        config.logging.file_path.as_deref().map(Path::new),
        config.logging.format == "json",
    )?;

    info!("Starting errol-schema");

    let catalog = match config.catalog_path() {
        Some(path) => SchemaCatalog::from_path(&path)
            .with_context(|| format!("Failed to load catalog {}", path.display()))?,
        None => SchemaCatalog::builtin().context("Failed to load built-in catalog")?,
    };

    match cli.command {
        Commands::Init {
            profiles,
            backend,
            update_validators,
        } => init(&config, &catalog, &profiles, backend, update_validators).await,
        Commands::Verify { profiles, backend } => verify(&config, &catalog, &profiles, backend).await,
        Commands::List => {
            list_profiles(&catalog);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Show { profile } => {
            show_profile(&catalog, &profile)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Apply the selected profiles
async fn init(
    config: &AppConfig, catalog: &SchemaCatalog, profiles: &[String], backend: Option<Backend>, update_validators: bool,
) -> Result<ExitCode> {
    let selected = catalog.select(effective_profiles(config, profiles).as_slice())?;
    let store = open_store(config, catalog, backend).await?;

    let on_conflict = if update_validators {
        ConflictPolicy::Update
    } else {
        config.schema.on_conflict.parse()?
    };
    let initializer = SchemaInitializer::new(store.as_ref(), InitOptions { on_conflict });

    let report = initializer.run(&selected).await?;
    for collection in &report.collections {
        println!("{:<16} {:?}", collection.collection, collection.outcome);
        for (field, outcome) in &collection.indexes {
            println!("{:<16}   unique index on {field}: {outcome:?}", "");
        }
    }

    if report.is_noop() {
        info!("Database already provisioned, nothing changed");
    }
    Ok(ExitCode::SUCCESS)
}

/// Check the database against the selected profiles
async fn verify(
    config: &AppConfig, catalog: &SchemaCatalog, profiles: &[String], backend: Option<Backend>,
) -> Result<ExitCode> {
    let selected = catalog.select(effective_profiles(config, profiles).as_slice())?;
    let store = open_store(config, catalog, backend).await?;
    let initializer = SchemaInitializer::new(store.as_ref(), InitOptions::default());

    let drifts = initializer.verify(&selected).await?;
    if drifts.is_empty() {
        println!("Database matches the selected profiles");
        return Ok(ExitCode::SUCCESS);
    }

    for drift in &drifts {
        println!("{drift}");
    }
    Ok(ExitCode::FAILURE)
}

fn list_profiles(catalog: &SchemaCatalog) {
    println!("database: {}", catalog.database);
    for profile in &catalog.profiles {
        let default = if catalog.default_profiles.contains(&profile.name) { " (default)" } else { "" };
        println!("{}{default}", profile.name);
        if let Some(description) = &profile.description {
            println!("    {description}");
        }
        for collection in &profile.collections {
            let indexes: Vec<_> = collection.indexes.iter().map(|i| i.field.as_str()).collect();
            println!(
                "    - {} required={:?} unique={:?}",
                collection.name, collection.validator.required, indexes
            );
        }
    }
}

fn show_profile(catalog: &SchemaCatalog, name: &str) -> Result<()> {
    let profile = catalog.profile(name)?;
    for collection in &profile.collections {
        let validator = collection.validator.to_validator()?;
        println!("// {}", collection.name);
        println!("{}", serde_json::to_string_pretty(&validator)?);
    }
    Ok(())
}

/// Command line profiles win over configured ones; both empty means catalog defaults
fn effective_profiles(config: &AppConfig, profiles: &[String]) -> Vec<String> {
    if profiles.is_empty() {
        config.schema.profiles.clone()
    } else {
        profiles.to_vec()
    }
}

async fn open_store(
    config: &AppConfig, catalog: &SchemaCatalog, backend: Option<Backend>,
) -> Result<Box<dyn DocumentStore>> {
    let backend = match backend {
        Some(backend) => backend,
        None if config.schema.backend == "sqlite" => Backend::Sqlite,
        None => Backend::Mongo,
    };

    if config.mongo.db != catalog.database {
        warn!(
            configured = %config.mongo.db,
            catalog = %catalog.database,
            "Configured database differs from the catalog database, using the configured one"
        );
    }

    match backend {
        Backend::Mongo => {
            let store = MongoStore::connect(&config.mongo)
                .await
                .context("Failed to connect to MongoDB")?;
            Ok(Box::new(store))
        }
        Backend::Sqlite => {
            let store = SqliteStore::open(
                Path::new(&config.sqlite.path),
                &config.mongo.db,
                config.sqlite.max_connections,
            )
            .context("Failed to open SQLite document store")?;
            Ok(Box::new(store))
        }
    }
}
