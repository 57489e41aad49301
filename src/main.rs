use std::sync::Arc;

use actix_web::{App, HttpServer, web};
use clap::{Parser, Subcommand};
use tokio::sync::Semaphore;
use tracing::info;
use tracing_subscriber::{
    Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

mod api;
mod collaborators;
mod config;
mod db;
mod domain;
mod engine;
mod mirror;
mod payout;
mod shutdown;
mod worker;

use crate::api::{
    health::health_config, job::job_config, onboarding::onboarding_config, payout::payout_config,
    validation,
};
use crate::collaborators::geo::NoopGeoLocator;
use crate::collaborators::notify::LogNotifier;
use crate::db::asset_repository::AssetRepository;
use crate::db::job_repository::JobRepository;
use crate::db::onboarding_repository::OnboardingRepository;
use crate::db::settlement_repository::SettlementRepository;
use crate::engine::{LifecycleEngine, OnboardingTracker};
use crate::mirror::LocalMirror;
use crate::shutdown::ShutdownCoordinator;
use crate::worker::SettlementWorker;

#[derive(Parser)]
#[command(name = "booking-engine", about = "Marketplace booking lifecycle service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server and settlement workers (default)
    Serve,
    /// Apply database migrations and exit
    Migrate,
}

/// File-based logging with daily rotation and level separation, plus an
/// ANSI console layer. Files land as logs/info.YYYY-MM-DD.log etc.
fn init_logging(log_dir: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());

    let info_file = tracing_appender::rolling::daily(log_dir, "info.log");
    let warn_file = tracing_appender::rolling::daily(log_dir, "warn.log");
    let error_file = tracing_appender::rolling::daily(log_dir, "error.log");

    let info_layer = tracing_subscriber::fmt::layer()
        .with_writer(info_file)
        .with_ansi(false)
        .with_filter(LevelFilter::INFO);

    let warn_layer = tracing_subscriber::fmt::layer()
        .with_writer(warn_file)
        .with_ansi(false)
        .with_filter(LevelFilter::WARN);

    let error_layer = tracing_subscriber::fmt::layer()
        .with_writer(error_file)
        .with_ansi(false)
        .with_filter(LevelFilter::ERROR);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(info_layer)
        .with(warn_layer)
        .with(error_layer)
        .init();
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let cli = Cli::parse();

    let cfg = config::Config::from_env().expect("Failed to load configuration");

    std::fs::create_dir_all(&cfg.log_dir).expect("Failed to create logs directory");
    init_logging(&cfg.log_dir);

    let pool = db::connection::get_connection(&cfg.database_url, cfg.max_db_connections)
        .await
        .expect("Failed to connect to database");
    info!("Database connection pool established");

    // Auto-migrate on startup; the migrate subcommand stops here.
    db::migrations::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");
    if let Some(Command::Migrate) = cli.command {
        info!("Migrations applied; exiting");
        return Ok(());
    }

    info!("Starting booking-engine");
    info!("Configuration loaded successfully:");
    info!("  - Bind address: {}", cfg.bind_addr);
    info!("  - Max payload size: {} bytes", cfg.max_payload_size);
    info!("  - Max database connections: {}", cfg.max_db_connections);
    info!("  - Settlement workers: {}", cfg.num_settlement_workers);
    info!("  - Default fee rate: {} bp", cfg.default_fee_rate_bp);
    info!(
        "  - Onboarding plan: {} steps (service_defined at {}, live at {})",
        cfg.onboarding_plan.total_steps,
        cfg.onboarding_plan.thresholds.service_defined,
        cfg.onboarding_plan.thresholds.live
    );

    // Wire the engine over its collaborators. Everything downstream of the
    // traits is swappable; these are the production implementations.
    let store = Arc::new(JobRepository::new(pool.clone()));
    let ledger = Arc::new(SettlementRepository::new(pool.clone()));
    let notifier = Arc::new(LogNotifier);
    let engine = Arc::new(LifecycleEngine::new(
        store.clone(),
        ledger.clone(),
        notifier.clone(),
        Arc::new(NoopGeoLocator),
        Arc::new(LocalMirror::new()),
        cfg.retry,
    ));
    let tracker = Arc::new(OnboardingTracker::new(
        Arc::new(OnboardingRepository::new(pool.clone())),
        Arc::new(AssetRepository::new(pool.clone())),
        cfg.onboarding_plan,
        cfg.retry,
    ));

    // Settlement retry workers with semaphore-bounded concurrency.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let semaphore = Arc::new(Semaphore::new(cfg.max_concurrent_settlements));
    let mut worker_handles = Vec::new();

    for worker_id in 1..=cfg.num_settlement_workers {
        let settlement_worker = SettlementWorker::new(
            store.clone(),
            ledger.clone(),
            notifier.clone(),
            cfg.settlement_poll_interval,
            cfg.settlement_batch_size,
        );
        let worker_semaphore = semaphore.clone();
        let worker_shutdown_rx = shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            settlement_worker
                .run(worker_id, worker_semaphore, worker_shutdown_rx)
                .await;
        });
        worker_handles.push(handle);
        info!("Spawned settlement worker {}", worker_id);
    }

    let server_pool = pool.clone();
    let server_cfg = cfg.clone();
    let engine_data = web::Data::from(engine);
    let tracker_data = web::Data::from(tracker);

    let server = HttpServer::new(move || {
        let payload_config = web::PayloadConfig::default().limit(server_cfg.max_payload_size);

        App::new()
            .app_data(web::Data::new(server_pool.clone())) // DB pool for health probes
            .app_data(engine_data.clone())
            .app_data(tracker_data.clone())
            .app_data(web::Data::new(server_cfg.clone()))
            .app_data(payload_config)
            .app_data(validation::json_config())
            .configure(health_config)
            .configure(job_config)
            .configure(onboarding_config)
            .configure(payout_config)
    });

    info!("Server starting on http://{}", cfg.bind_addr);

    let server = server.bind(cfg.bind_addr.as_str())?.run();
    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    let coordinator = ShutdownCoordinator::new(
        server_handle,
        server_task,
        worker_handles,
        shutdown_tx,
        pool,
    );
    coordinator.wait_for_shutdown().await
}
