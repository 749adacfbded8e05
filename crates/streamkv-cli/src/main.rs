use clap::{ArgAction, Parser, Subcommand};
use futures::TryStreamExt;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::process::ExitCode;
use streamkv::{
    CursorDirection, CursorOptions, Database, DatabaseOptions, Key, KeyRange, ObjectStore, Row,
    SchemaVersion, TransactionMode, TransactionState, delete_database, list_databases, open_database,
};
use streamkv_memory::FsEngine;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "streamkv-cli")]
#[command(about = "Inspect and edit file-backed streamkv databases")]
struct Cli {
    /// Directory holding the engine state file.
    #[arg(long, env = "STREAMKV_ROOT", default_value = ".streamkv", global = true)]
    root: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create or upgrade a database from a JSON list of schema versions.
    Init(InitArgs),
    /// List databases and their versions.
    Databases,
    /// Delete a database and everything in it.
    Drop(DropArgs),
    /// List the object stores of a database.
    Stores(DbArgs),
    /// Print the record stored under a key (exit code 2 when absent).
    Get(KeyArgs),
    /// Insert or replace a record.
    Put(WriteArgs),
    /// Insert a record, failing if its key already exists.
    Add(WriteArgs),
    /// Delete the record stored under a key.
    Delete(KeyArgs),
    /// Count records in a store or index, optionally within a key range.
    Count(ScanArgs),
    /// Print records as JSON lines in key order.
    Scan(ScanArgs),
    /// Remove every record from a store.
    Clear(StoreArgs),
}

#[derive(clap::Args, Debug)]
struct InitArgs {
    #[arg(long)]
    db: String,
    #[arg(long)]
    schema: PathBuf,
}

#[derive(clap::Args, Debug)]
struct DropArgs {
    #[arg(long)]
    db: String,
}

#[derive(clap::Args, Debug)]
struct DbArgs {
    #[arg(long)]
    db: String,
}

#[derive(clap::Args, Debug)]
struct StoreArgs {
    #[arg(long)]
    db: String,
    #[arg(long)]
    store: String,
}

#[derive(clap::Args, Debug)]
struct KeyArgs {
    #[arg(long)]
    db: String,
    #[arg(long)]
    store: String,
    /// JSON key; anything that is not valid JSON is taken as a string key.
    #[arg(long)]
    key: String,
}

#[derive(clap::Args, Debug)]
struct WriteArgs {
    #[arg(long)]
    db: String,
    #[arg(long)]
    store: String,
    #[arg(long)]
    key: Option<String>,
    #[arg(long)]
    value: String,
}

#[derive(clap::Args, Debug)]
struct ScanArgs {
    #[arg(long)]
    db: String,
    #[arg(long)]
    store: String,
    #[arg(long)]
    index: Option<String>,
    #[arg(long)]
    lower: Option<String>,
    #[arg(long)]
    upper: Option<String>,
    #[arg(long, action = ArgAction::SetTrue)]
    reverse: bool,
    #[arg(long)]
    limit: Option<usize>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match FsEngine::new(&cli.root) {
        Ok(engine) => run_command(&engine, cli.command).await,
        Err(error) => Err(error.to_string()),
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

async fn run_command(engine: &FsEngine, command: Commands) -> Result<ExitCode, String> {
    match command {
        Commands::Init(args) => init_command(engine, args).await,
        Commands::Databases => databases_command(engine).await,
        Commands::Drop(args) => {
            delete_database(engine.factory(), &args.db)
                .await
                .map_err(|error| error.to_string())?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Stores(args) => {
            let db = open(engine, &args.db).await?;
            for name in db.object_store_names() {
                println!("{name}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Get(args) => get_command(engine, args).await,
        Commands::Put(args) => write_command(engine, args, true).await,
        Commands::Add(args) => write_command(engine, args, false).await,
        Commands::Delete(args) => delete_command(engine, args).await,
        Commands::Count(args) => count_command(engine, args).await,
        Commands::Scan(args) => scan_command(engine, args).await,
        Commands::Clear(args) => clear_command(engine, args).await,
    }
}

async fn init_command(engine: &FsEngine, args: InitArgs) -> Result<ExitCode, String> {
    let raw = std::fs::read_to_string(&args.schema)
        .map_err(|error| format!("read {} failed: {error}", args.schema.display()))?;
    let schema: Vec<SchemaVersion> = serde_json::from_str(&raw)
        .map_err(|error| format!("parse {} failed: {error}", args.schema.display()))?;
    let options = DatabaseOptions {
        name: args.db,
        schema,
    };
    let db = open_database(engine.factory(), options)
        .await
        .map_err(|error| error.to_string())?;
    println!("{}", json!({"name": db.name(), "version": db.version()}));
    Ok(ExitCode::SUCCESS)
}

async fn databases_command(engine: &FsEngine) -> Result<ExitCode, String> {
    let databases = list_databases(engine.factory())
        .await
        .map_err(|error| error.to_string())?;
    for info in databases {
        println!("{}", json!({"name": info.name, "version": info.version}));
    }
    Ok(ExitCode::SUCCESS)
}

async fn get_command(engine: &FsEngine, args: KeyArgs) -> Result<ExitCode, String> {
    let store = store(engine, &args.db, &args.store, TransactionMode::ReadOnly).await?;
    let value = store
        .get(parse_key(&args.key)?)
        .await
        .map_err(|error| error.to_string())?;
    match value {
        Some(value) => {
            println!("{value}");
            Ok(ExitCode::SUCCESS)
        }
        None => {
            eprintln!("no record for key {}", args.key);
            Ok(ExitCode::from(2))
        }
    }
}

async fn write_command(engine: &FsEngine, args: WriteArgs, overwrite: bool) -> Result<ExitCode, String> {
    let value: Value = serde_json::from_str(&args.value)
        .map_err(|error| format!("--value is not valid JSON: {error}"))?;
    let key = args.key.as_deref().map(parse_key).transpose()?;
    let store = store(engine, &args.db, &args.store, TransactionMode::ReadWrite).await?;
    let request = if overwrite {
        store.put(&value, key)
    } else {
        store.add(&value, key)
    };
    let key = request.await.map_err(|error| error.to_string())?;
    finish(&store).await?;
    println!("{}", key.to_value());
    Ok(ExitCode::SUCCESS)
}

async fn delete_command(engine: &FsEngine, args: KeyArgs) -> Result<ExitCode, String> {
    let store = store(engine, &args.db, &args.store, TransactionMode::ReadWrite).await?;
    store
        .delete(parse_key(&args.key)?)
        .await
        .map_err(|error| error.to_string())?;
    finish(&store).await?;
    Ok(ExitCode::SUCCESS)
}

async fn clear_command(engine: &FsEngine, args: StoreArgs) -> Result<ExitCode, String> {
    let store = store(engine, &args.db, &args.store, TransactionMode::ReadWrite).await?;
    store.clear().await.map_err(|error| error.to_string())?;
    finish(&store).await?;
    Ok(ExitCode::SUCCESS)
}

async fn count_command(engine: &FsEngine, args: ScanArgs) -> Result<ExitCode, String> {
    let store = store(engine, &args.db, &args.store, TransactionMode::ReadOnly).await?;
    let range = key_range(args.lower.as_deref(), args.upper.as_deref())?;
    let count = match &args.index {
        Some(index) => {
            let index = store.index(index).map_err(|error| error.to_string())?;
            index.count(range).await
        }
        None => store.count(range).await,
    }
    .map_err(|error| error.to_string())?;
    println!("{count}");
    Ok(ExitCode::SUCCESS)
}

async fn scan_command(engine: &FsEngine, args: ScanArgs) -> Result<ExitCode, String> {
    let store = store(engine, &args.db, &args.store, TransactionMode::ReadOnly).await?;
    let mut options = CursorOptions::new();
    if let Some(range) = key_range(args.lower.as_deref(), args.upper.as_deref())? {
        options = options.range(range);
    }
    if args.reverse {
        options = options.direction(CursorDirection::Prev);
    }
    let cursor = match &args.index {
        Some(index) => store
            .index(index)
            .map_err(|error| error.to_string())?
            .open_cursor(options),
        None => store.open_cursor(options),
    };

    let mut rows = cursor.subscribe();
    let mut printed = 0;
    while args.limit.is_none_or(|limit| printed < limit) {
        let Some(row) = rows.try_next().await.map_err(|error| error.to_string())? else {
            break;
        };
        print_row(&row);
        printed += 1;
    }
    Ok(ExitCode::SUCCESS)
}

fn print_row(row: &Row<Value>) {
    println!(
        "{}",
        json!({
            "key": row.key.to_value(),
            "primary_key": row.primary_key.to_value(),
            "value": row.value,
        })
    );
}

/// Opens an existing database at its stored version.
async fn open(engine: &FsEngine, name: &str) -> Result<Database, String> {
    let known = list_databases(engine.factory())
        .await
        .map_err(|error| error.to_string())?;
    if !known.iter().any(|info| info.name == name) {
        return Err(format!("no database named '{name}', run init first"));
    }
    open_database(engine.factory(), DatabaseOptions::new(name))
        .await
        .map_err(|error| error.to_string())
}

async fn store(
    engine: &FsEngine,
    db: &str,
    name: &str,
    mode: TransactionMode,
) -> Result<ObjectStore, String> {
    open(engine, db)
        .await?
        .object_store(name, mode)
        .map_err(|error| error.to_string())
}

/// Commits the store's transaction and waits until the snapshot is written.
async fn finish(store: &ObjectStore) -> Result<(), String> {
    let transaction = store.transaction();
    if transaction.state() == TransactionState::Active {
        transaction.commit().map_err(|error| error.to_string())?;
    }
    transaction
        .completion()
        .await
        .map_err(|error| error.to_string())
}

fn parse_key(raw: &str) -> Result<Key, String> {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => Key::from_value(&value).map_err(|error| error.to_string()),
        Err(_) => Ok(Key::from(raw)),
    }
}

fn key_range(lower: Option<&str>, upper: Option<&str>) -> Result<Option<KeyRange>, String> {
    let range = match (lower.map(parse_key).transpose()?, upper.map(parse_key).transpose()?) {
        (Some(lower), Some(upper)) => {
            KeyRange::bound(lower, upper, false, false).map_err(|error| error.to_string())?
        }
        (Some(lower), None) => KeyRange::lower_bound(lower, false),
        (None, Some(upper)) => KeyRange::upper_bound(upper, false),
        (None, None) => return Ok(None),
    };
    Ok(Some(range))
}
