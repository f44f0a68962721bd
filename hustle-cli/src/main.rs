//! HustleXP money core binary
//!
//! `hustle serve` runs the HTTP surface, the outbox worker pool, and the
//! recovery scheduler in one process. `hustle migrate` applies the storage
//! constitution. `hustle admin ...` exposes the privileged recovery surface.
//!
//! The whole service graph is built here and passed down by value — no
//! module-level singletons anywhere below `main`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use hustle_api::AppState;
use hustle_core::CoreConfig;
use hustle_engine::{
    admin::AdminService,
    alerting::AlertService,
    lock_manager::LockManager,
    metrics::CoreMetrics,
    ordering_gate::OrderingGate,
    outbox::OutboxClient,
    recovery::RecoveryService,
    safety::{Denylist, SafetyControls},
    saga::PaymentSaga,
    stripe::StripeClient,
    tasks::TaskService,
    trust::TrustService,
    worker::{arm_shutdown_watchdog, Shutdown, WorkerPool},
    xp::XpService,
};
use hustle_ledger::LedgerService;

#[derive(Parser)]
#[command(name = "hustle")]
#[command(about = "HustleXP money & trust core")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server, worker pool, and recovery scheduler
    Serve {
        /// Skip the boot-time schema migration
        #[arg(long)]
        skip_migrate: bool,
    },
    /// Apply the storage constitution and exit
    Migrate,
    /// Privileged recovery and safety operations
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },
}

#[derive(Subcommand)]
enum AdminCommands {
    /// Force a payout past the event guard
    ForcePayout {
        #[arg(long)]
        admin: Uuid,
        #[arg(long)]
        task: Uuid,
        #[arg(long)]
        reason: String,
    },
    /// Force a refund past the event guard
    ForceRefund {
        #[arg(long)]
        admin: Uuid,
        #[arg(long)]
        task: Uuid,
        #[arg(long)]
        reason: String,
    },
    /// Add a user to the admin denylist
    DenylistAdd {
        #[arg(long)]
        admin: Uuid,
        #[arg(long)]
        user: Uuid,
        #[arg(long)]
        reason: String,
        #[arg(long)]
        emergency: bool,
    },
    /// Remove a user from the admin denylist
    DenylistRemove {
        #[arg(long)]
        admin: Uuid,
        #[arg(long)]
        user: Uuid,
    },
    /// Engage or release the killswitch
    Killswitch {
        #[arg(long)]
        admin: Uuid,
        #[arg(long)]
        active: bool,
        #[arg(long, default_value = "manual")]
        reason: String,
    },
    /// Rebuild a task's ledger from provider truth
    Backfill {
        #[arg(long)]
        admin: Uuid,
        #[arg(long)]
        task: Uuid,
    },
}

/// Every long-lived service, wired once.
struct Engine {
    pool: PgPool,
    state: AppState,
    workers: WorkerPool,
    locks: LockManager,
    admin: AdminService,
    port: u16,
}

async fn build_engine(config: &CoreConfig) -> anyhow::Result<Engine> {
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await
        .context("database unreachable at boot")?;

    let metrics = Arc::new(CoreMetrics::new()?);
    let ledger = LedgerService::new();
    let outbox = OutboxClient::new();
    let xp = XpService::new();
    let trust = TrustService::new();
    let locks = LockManager::new();
    let stripe = Arc::new(StripeClient::new(config.stripe_secret_key.clone()));
    let safety = SafetyControls::new(pool.clone());
    let denylist = Denylist::new(
        pool.clone(),
        config.upstash_redis_rest_url.clone(),
        config.upstash_redis_rest_token.clone(),
    );
    let alerts = AlertService::new(
        config.pagerduty_routing_key.clone(),
        config.slack_webhook_url.clone(),
    );

    let saga = Arc::new(PaymentSaga::new(
        pool.clone(),
        ledger.clone(),
        outbox.clone(),
        xp,
        stripe.clone(),
        locks.clone(),
        safety.clone(),
        alerts.clone(),
        metrics.clone(),
        config.payouts_enabled,
    ));

    let tasks = Arc::new(TaskService::new(
        pool.clone(),
        saga.clone(),
        stripe.clone(),
        outbox.clone(),
        trust,
    ));

    let gate = Arc::new(OrderingGate::new(
        pool.clone(),
        saga.clone(),
        alerts.clone(),
        metrics.clone(),
        config.stripe_webhook_secret.clone(),
        config.is_production(),
    ));

    let recovery = Arc::new(RecoveryService::new(
        pool.clone(),
        saga.clone(),
        ledger,
        outbox.clone(),
        safety.clone(),
        alerts,
        metrics.clone(),
        config.recovery_stuck_timeout_minutes,
        config.negative_outcome_rate_threshold,
    ));

    let workers = WorkerPool::new(pool.clone(), outbox, metrics.clone(), recovery);
    let admin = AdminService::new(
        pool.clone(),
        saga.clone(),
        stripe,
        denylist,
        safety.clone(),
    );

    let state = AppState {
        pool: pool.clone(),
        gate,
        tasks,
        metrics,
        safety,
    };

    Ok(Engine {
        pool,
        state,
        workers,
        locks,
        admin,
        port: config.port,
    })
}

async fn serve(config: CoreConfig, skip_migrate: bool) -> anyhow::Result<()> {
    if !skip_migrate {
        hustle_ledger::constitution::migrate(
            &PgPoolOptions::new()
                .max_connections(2)
                .connect(&config.database_url)
                .await
                .context("database unreachable for migration")?,
        )
        .await
        .context("migration failed")?;
    }

    let engine = build_engine(&config).await?;
    let (shutdown_tx, shutdown) = Shutdown::new();

    let _lease_sweeper = engine.locks.spawn_sweeper(Duration::from_secs(15));
    let worker_handles = engine.workers.spawn(shutdown.clone());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", engine.port))
        .await
        .with_context(|| format!("cannot bind port {}", engine.port))?;
    info!(port = engine.port, "listening");

    let router = hustle_api::router(engine.state);
    let mut signal_shutdown = shutdown.clone();
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        signal_shutdown.wait().await;
    });

    let signals = tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _watchdog = arm_shutdown_watchdog();
        shutdown_tx.send(true).ok();
        // Keep the watchdog alive until process exit.
        std::future::pending::<()>().await;
    });

    server.await.context("server error")?;

    // Listener closed; drain workers, then the pools.
    for handle in worker_handles {
        handle.await.ok();
    }
    engine.pool.close().await;
    signals.abort();
    info!("shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

async fn run_admin(config: CoreConfig, command: AdminCommands) -> anyhow::Result<()> {
    let engine = build_engine(&config).await?;
    let admin = engine.admin;

    match command {
        AdminCommands::ForcePayout { admin: admin_id, task, reason } => {
            let outcome = admin.force_payout(admin_id, task, &reason).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        AdminCommands::ForceRefund { admin: admin_id, task, reason } => {
            let outcome = admin.force_refund(admin_id, task, &reason).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        AdminCommands::DenylistAdd { admin: admin_id, user, reason, emergency } => {
            admin.denylist_add(admin_id, user, &reason, emergency).await?;
            println!("denylisted {user}");
        }
        AdminCommands::DenylistRemove { admin: admin_id, user } => {
            admin.denylist_remove(admin_id, user).await?;
            println!("removed {user}");
        }
        AdminCommands::Killswitch { admin: admin_id, active, reason } => {
            admin.set_killswitch(admin_id, active, &reason).await?;
            println!("killswitch active={active}");
        }
        AdminCommands::Backfill { admin: admin_id, task } => {
            let report = admin.backfill(admin_id, task).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    engine.pool.close().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match CoreConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .json()
        .init();

    let result = match cli.command {
        Commands::Serve { skip_migrate } => serve(config, skip_migrate).await,
        Commands::Migrate => async {
            let pool = PgPoolOptions::new()
                .max_connections(2)
                .connect(&config.database_url)
                .await
                .context("database unreachable")?;
            hustle_ledger::constitution::migrate(&pool).await?;
            pool.close().await;
            Ok(())
        }
        .await,
        Commands::Admin { command } => run_admin(config, command).await,
    };

    if let Err(err) = result {
        error!(error = %err, "fatal");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
