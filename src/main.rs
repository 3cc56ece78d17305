use clap::Parser;
use miette::{IntoDiagnostic, Result};
use settlement_desk::application::engine::SettlementEngine;
use settlement_desk::application::relay::ChangeFeedRelay;
use settlement_desk::config::{DeskConfig, EngineConfig, RelayConfig};
use settlement_desk::domain::ports::{BalanceStoreRef, ChangeSourceRef, RequestStoreRef};
use settlement_desk::error::{DeskError, StoreError};
use settlement_desk::infrastructure::feed::ChangeFeed;
use settlement_desk::infrastructure::in_memory::{InMemoryBalanceStore, InMemoryRequestStore};
use settlement_desk::interfaces::api::{AdminDesk, OperatorSession};
use settlement_desk::interfaces::csv::action_reader::ActionReader;
use settlement_desk::interfaces::csv::report_writer::{BalanceWriter, RequestWriter};
use settlement_desk::interfaces::csv::seed_reader::{RequestReader, UserReader};
use settlement_desk::telemetry::{RecordingAlertSink, init_tracing};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settlement actions CSV file (`action, request`)
    actions: PathBuf,

    /// Users to seed (`user, username, email, balance`)
    #[arg(long)]
    users: Option<PathBuf>,

    /// Pending requests to seed (`request, kind, user, amount, ...`)
    #[arg(long)]
    requests: Option<PathBuf>,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Also write the final state of every request to this file.
    #[arg(long)]
    requests_report: Option<PathBuf>,

    /// Upper bound on each store call, in milliseconds.
    #[arg(long, env = "SETTLEMENT_DESK_STORE_TIMEOUT_MS", default_value_t = 5000)]
    store_timeout_ms: u64,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, env = "SETTLEMENT_DESK_LOG", default_value = "warn")]
    log_level: String,
}

impl Cli {
    fn config(&self) -> DeskConfig {
        let store_timeout = Duration::from_millis(self.store_timeout_ms);
        DeskConfig {
            engine: EngineConfig { store_timeout },
            relay: RelayConfig {
                store_timeout,
                ..RelayConfig::default()
            },
        }
    }
}

struct Stores {
    requests: RequestStoreRef,
    balances: BalanceStoreRef,
    changes: ChangeSourceRef,
}

fn in_memory_stores() -> Stores {
    let feed = ChangeFeed::default();
    Stores {
        requests: Arc::new(InMemoryRequestStore::with_feed(feed.clone())),
        balances: Arc::new(InMemoryBalanceStore::with_feed(feed.clone())),
        changes: Arc::new(feed),
    }
}

#[cfg(feature = "storage-rocksdb")]
fn open_stores(db_path: Option<&Path>) -> Result<Stores> {
    use settlement_desk::infrastructure::rocksdb::RocksDBStore;

    let Some(db_path) = db_path else {
        return Ok(in_memory_stores());
    };
    let store = RocksDBStore::open(db_path).into_diagnostic()?;
    Ok(Stores {
        requests: Arc::new(store.clone()),
        balances: Arc::new(store.clone()),
        changes: Arc::new(store),
    })
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_stores(db_path: Option<&Path>) -> Result<Stores> {
    if db_path.is_some() {
        eprintln!(
            "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
    }
    Ok(in_memory_stores())
}

/// Loads seed rows, skipping ones the store already holds.
async fn seed(stores: &Stores, cli: &Cli) -> Result<()> {
    if let Some(path) = &cli.users {
        let file = File::open(path).into_diagnostic()?;
        for user in UserReader::new(file).users() {
            match user {
                Ok(user) => insert_seed(stores.balances.insert_user(user).await)?,
                Err(e) => eprintln!("Error reading user: {e}"),
            }
        }
    }
    if let Some(path) = &cli.requests {
        let file = File::open(path).into_diagnostic()?;
        for request in RequestReader::new(file).requests() {
            match request {
                Ok(request) => insert_seed(stores.requests.insert(request).await)?,
                Err(e) => eprintln!("Error reading request: {e}"),
            }
        }
    }
    Ok(())
}

fn insert_seed(result: Result<(), StoreError>) -> Result<()> {
    match result {
        Err(StoreError::Duplicate(row)) => {
            tracing::debug!(%row, "Seed row already stored");
            Ok(())
        }
        other => other.into_diagnostic(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    let config = cli.config();

    let stores = open_stores(cli.db_path.as_deref())?;
    seed(&stores, &cli).await?;

    let alerts = RecordingAlertSink::new();
    let engine = SettlementEngine::new(stores.requests.clone(), stores.balances.clone())
        .with_config(config.engine)
        .with_alert_sink(Arc::new(alerts.clone()));
    let relay = ChangeFeedRelay::start(
        stores.changes.clone(),
        stores.requests.clone(),
        stores.balances.clone(),
        config.relay,
    )
    .await;
    let desk = AdminDesk::new(engine, relay);
    let operator = OperatorSession::admin("cli");

    let file = File::open(&cli.actions).into_diagnostic()?;
    for action in ActionReader::new(file).actions() {
        match action {
            Ok(action) => {
                if let Err(e) = desk.settle(&operator, action.request, action.target).await {
                    eprintln!("Error settling request {}: {}", action.request, e);
                }
            }
            Err(e) => eprintln!("Error reading action: {e}"),
        }
    }
    desk.shutdown().await;

    let users = stores.balances.all().await.into_diagnostic()?;
    let stdout = io::stdout();
    BalanceWriter::new(stdout.lock())
        .write_users(users)
        .into_diagnostic()?;

    if let Some(path) = &cli.requests_report {
        let requests = stores.requests.all().await.into_diagnostic()?;
        let file = File::create(path).map_err(DeskError::from).into_diagnostic()?;
        RequestWriter::new(file)
            .write_requests(requests)
            .into_diagnostic()?;
    }

    let raised = alerts.alerts();
    if !raised.is_empty() {
        eprintln!(
            "ALERT: {} settlement(s) need manual reconciliation",
            raised.len()
        );
    }

    Ok(())
}
