//! Grid worker binary
//!
//! Runs a worker process, or talks to the worker pool from the command line.
//!
//! ## Setup
//!
//! 1. Create a `config.toml` (every key is optional) or export overrides:
//!    ```
//!    APP_STORE__URL=redis://127.0.0.1:6379/
//!    APP_WORKER__NAME=worker-a
//!    APP_CATALOG__PATH=strategies.json
//!    ```
//!
//! 2. Run a worker, then control strategies from anywhere that reaches the store:
//!    ```bash
//!    cargo run --bin grid_worker -- worker
//!    cargo run --bin grid_worker -- start 1
//!    cargo run --bin grid_worker -- status 1
//!    cargo run --bin grid_worker -- stop 1
//!    ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use rust_decimal::Decimal;
use serde::Serialize;

use grid_worker::{
    config::Settings,
    coordinator::{Coordinator, StopOutcome, WorkerIdentity},
    engine::EngineConfig,
    exchange::{PaperExchangeFactory, RandomWalk},
    server::{self, ServerState},
    store::{self, StatusReader},
    worker::{select_worker, FileCatalog, StartOutcome, WorkerRuntime},
    Error, Result,
};

#[derive(Parser, Debug)]
#[command(name = "grid_worker", about = "Distributed grid strategy worker")]
struct Cli {
    /// Settings file, without extension
    #[arg(short, long, default_value = "config", env = "GRID_WORKER_CONFIG")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a worker process until Ctrl-C
    Worker {
        /// Worker name, overrides `worker.name`
        #[arg(long)]
        name: Option<String>,
        /// Control server port, overrides `server.port`
        #[arg(long)]
        port: Option<u16>,
        /// Starting price of paper markets
        #[arg(long, default_value = "100")]
        paper_price: Decimal,
    },
    /// Dispatch a strategy to a worker
    Start {
        strategy_id: u64,
        /// Preferred worker when it has a free slot
        #[arg(long)]
        worker: Option<String>,
    },
    /// Ask the owning worker to stop a strategy
    Stop { strategy_id: u64 },
    /// Print where and how a strategy is running
    Status { strategy_id: u64 },
    /// List live workers
    Workers,
}

#[tokio::main]
async fn main() {
    match dotenvy::dotenv() {
        Ok(path) => eprintln!("Loaded environment from: {}", path.display()),
        Err(_) => eprintln!("No .env file found, using system environment variables"),
    }

    let cli = Cli::parse();
    let settings = match Settings::new(&cli.config) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load settings: {}", e);
            std::process::exit(2);
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(settings.log.level.as_str())).init();

    if let Err(e) = settings.validate() {
        error!("Invalid settings: {}", e);
        std::process::exit(2);
    }

    let result = match cli.command {
        Command::Worker { name, port, paper_price } => run_worker(settings, name, port, paper_price).await,
        Command::Start { strategy_id, worker } => start(&settings, strategy_id, worker).await,
        Command::Stop { strategy_id } => stop(&settings, strategy_id).await,
        Command::Status { strategy_id } => status(&settings, strategy_id).await,
        Command::Workers => workers(&settings).await,
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run_worker(mut settings: Settings, name: Option<String>, port: Option<u16>, paper_price: Decimal) -> Result<()> {
    if let Some(port) = port {
        settings.server.port = port;
    }
    let identity = WorkerIdentity::detect(name.or(settings.worker.name.clone()));
    info!("Starting worker {} ({} / {})", identity.name, identity.hostname, identity.ip);

    let store = store::connect(&settings.store).await?;
    let coordinator = Coordinator::new(store.clone(), identity.clone(), &settings.coordination);
    let exchanges = PaperExchangeFactory::new(paper_price).with_random_walk(RandomWalk::new(
        Decimal::new(2, 1),
        paper_price / Decimal::TEN,
        paper_price * Decimal::TEN,
    ));

    let mut runtime = WorkerRuntime::new(
        coordinator.clone(),
        Arc::new(FileCatalog::new(&settings.catalog.path)),
        Arc::new(exchanges),
        EngineConfig::from_settings(&settings.engine, &settings.coordination),
    )
    .with_capacity(settings.worker.capacity)
    .with_heartbeat(Duration::from_secs(settings.coordination.worker_heartbeat_secs));
    if settings.server.enabled {
        runtime = runtime.with_control_addr(format!("{}:{}", identity.ip, settings.server.port));
    }

    let worker = runtime.handle();
    let runtime_task = tokio::spawn(runtime.run());

    let server_task = if settings.server.enabled {
        let state = ServerState {
            worker: worker.clone(),
            status: StatusReader::new(store.clone(), settings.coordination.freshness()),
            registry: coordinator.registry().clone(),
        };
        let addr = settings.server.addr();
        Some(tokio::spawn(async move {
            let shutdown = async {
                let _ = tokio::signal::ctrl_c().await;
            };
            if let Err(e) = server::serve(&addr, state, shutdown).await {
                error!("Control server failed: {}", e);
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, stopping strategies...");
    worker.shutdown().await?;
    if runtime_task.await.is_err() {
        warn!("Worker runtime ended abnormally");
    }
    if let Some(task) = server_task {
        let _ = task.await;
    }
    info!("Worker stopped");
    Ok(())
}

async fn start(settings: &Settings, strategy_id: u64, hint: Option<String>) -> Result<()> {
    let store = store::connect(&settings.store).await?;
    let coordinator = Coordinator::new(store, WorkerIdentity::detect(Some(cli_name())), &settings.coordination);
    let catalog = FileCatalog::new(&settings.catalog.path);

    let target = select_worker(coordinator.registry(), &catalog, strategy_id, hint.as_deref()).await?;
    let addr = target.control_addr.ok_or_else(|| {
        Error::InvalidConfig(format!("worker {} has no control server", target.identity.name))
    })?;
    info!("Dispatching strategy {} to {} at {}", strategy_id, target.identity.name, addr);

    let response = reqwest::Client::new()
        .post(format!("http://{}/api/strategies/{}/start", addr, strategy_id))
        .timeout(Duration::from_secs(10))
        .send()
        .await?;
    if !response.status().is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::InvalidConfig(format!("worker refused start: {}", body)));
    }
    let outcome: StartOutcome = response.json().await?;
    print_json(&outcome)
}

async fn stop(settings: &Settings, strategy_id: u64) -> Result<()> {
    let store = store::connect(&settings.store).await?;
    let coordinator = Coordinator::new(store, WorkerIdentity::detect(Some(cli_name())), &settings.coordination);
    match coordinator.request_stop(strategy_id, Utc::now()).await? {
        StopOutcome::Requested => info!("Stop requested for strategy {}", strategy_id),
        StopOutcome::NotRunning => info!("Strategy {} is not running", strategy_id),
    }
    Ok(())
}

async fn status(settings: &Settings, strategy_id: u64) -> Result<()> {
    let store = store::connect(&settings.store).await?;
    let reader = StatusReader::new(store, settings.coordination.freshness());
    let view = reader.query(strategy_id, Utc::now()).await?;
    print_json(&view)
}

async fn workers(settings: &Settings) -> Result<()> {
    let store = store::connect(&settings.store).await?;
    let coordinator = Coordinator::new(store, WorkerIdentity::detect(Some(cli_name())), &settings.coordination);
    print_json(&coordinator.registry().list_workers().await?)
}

fn cli_name() -> String {
    format!("cli-{}", std::process::id())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
