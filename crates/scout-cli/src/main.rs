use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scout_storage::Database;
use scout_sync::{
    build_scheduler, sink_from_config, spawn_initial_run, RunSummary, RunTarget, ScoutApp, ScoutConfig,
};
use scout_web::{AppState, LogRing, DEFAULT_LOG_CAPACITY};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "scout")]
#[command(about = "Pokemon Scout: catalog reconciliation and price/stock alerts")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// HTTP API plus the scheduled ingestion job.
    Serve {
        #[arg(long, env = "SCOUT_WEB_PORT")]
        port: Option<u16>,
    },
    /// Run ingestion once and print the summary.
    Sync {
        /// Only this store slug.
        #[arg(long)]
        store: Option<String>,
    },
    /// Evaluate every active alert against the current catalog.
    Sweep,
    /// Upgrade the data file to the current schema.
    Migrate,
    #[command(subcommand)]
    User(UserCommand),
}

#[derive(Debug, Subcommand)]
enum UserCommand {
    Add {
        email: String,
        #[arg(long)]
        admin: bool,
    },
    MakeAdmin {
        email: String,
    },
}

fn init_tracing(logs: &LogRing) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("scout_cli=info,scout_sync=info,scout_storage=info,scout_adapters=info,scout_web=info"));
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json().with_target(false)))
        .with((!json_logs).then(|| tracing_subscriber::fmt::layer()))
        .with(logs.clone())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let logs = LogRing::new(DEFAULT_LOG_CAPACITY);
    init_tracing(&logs);

    let cli = Cli::parse();
    let config = ScoutConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { store: None }) {
        Commands::Serve { port } => serve(config, port, logs).await?,
        Commands::Sync { store } => {
            let app = bootstrap(config)?;
            let summary = app.ingestor.run(RunTarget::from_slug(store)).await;
            app.shutdown().await?;
            print_summary(&summary?);
        }
        Commands::Sweep => {
            let app = bootstrap(config)?;
            let sent = app.ingestor.sweep().await;
            app.shutdown().await?;
            println!("sweep complete: notifications={}", sent?.len());
        }
        Commands::Migrate => {
            let db = Database::open(&config.data_file, config.persist_debounce)
                .with_context(|| format!("opening {}", config.data_file.display()))?;
            match db.migration_report() {
                Some(report) => println!(
                    "migrated {} from v{}: alerts_rehomed={} users_created={} duplicates_merged={}",
                    config.data_file.display(),
                    report.from_version,
                    report.alerts_rehomed,
                    report.users_created,
                    report.duplicates_merged
                ),
                None => println!("{} is already current", config.data_file.display()),
            }
            db.close()?;
        }
        Commands::User(cmd) => {
            let (catalog, alerts) =
                scout_storage::open_stores(&config.data_file, config.persist_debounce, &config.base_currency)?;
            let user = match cmd {
                UserCommand::Add { email, admin } => alerts.create_user(&email, admin)?,
                UserCommand::MakeAdmin { email } => {
                    let user = alerts
                        .user_by_email(&email)
                        .with_context(|| format!("no user with e-mail {email}"))?;
                    alerts.set_admin(user.id, true)?
                }
            };
            catalog.database().close()?;
            println!("{}", serde_json::to_string_pretty(&user)?);
        }
    }

    Ok(())
}

fn bootstrap(config: ScoutConfig) -> Result<ScoutApp> {
    let sink = sink_from_config(&config).context("configuring alert e-mail")?;
    ScoutApp::bootstrap(config, sink)
}

async fn serve(config: ScoutConfig, port: Option<u16>, logs: LogRing) -> Result<()> {
    let port = port.unwrap_or(config.web_port);
    let app = bootstrap(config)?;

    let mut scheduler = if app.config.scheduler_enabled {
        let sched = build_scheduler(&app.config.scraper_cron, app.ingestor.clone()).await?;
        sched.start().await.context("starting scheduler")?;
        info!(cron = %app.config.scraper_cron, "scheduler started");
        spawn_initial_run(app.ingestor.clone());
        Some(sched)
    } else {
        info!("scheduler disabled");
        None
    };

    let state = AppState::from_app(&app, logs);
    let served = scout_web::serve(state, port, shutdown_signal()).await;

    if let Some(sched) = scheduler.as_mut() {
        if let Err(err) = sched.shutdown().await {
            warn!(error = %err, "scheduler shutdown failed");
        }
    }
    app.shutdown().await?;
    info!("shutdown complete");
    served
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

fn print_summary(summary: &RunSummary) {
    println!(
        "sync complete: run_id={} sources={} failed_sources={} notifications={}",
        summary.run_id,
        summary.sources.len(),
        summary.failed_sources(),
        summary.notifications_sent()
    );
    for source in &summary.sources {
        println!(
            "  {}: total={} created={} price_changes={} stock_changes={} failed_items={}{}",
            source.slug,
            source.total,
            source.created,
            source.price_changes,
            source.stock_changes,
            source.failed_items,
            source
                .error
                .as_ref()
                .map(|e| format!(" error={e}"))
                .unwrap_or_default()
        );
    }
}
