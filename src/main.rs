use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use decloud_orchestrator::api::{create_router, AppState};
use decloud_orchestrator::auth::{AuthService, InsecureDevVerifier};
use decloud_orchestrator::billing::settlement::{
    spawn_settlement_driver, AlwaysVerifiedAttestation, LoggingSettlementClient, SettlementDriver,
};
use decloud_orchestrator::billing::{
    spawn_metering_consumer, spawn_metering_producer, spawn_stop_listener, MeteringPipeline,
};
use decloud_orchestrator::commands::{spawn_stale_command_sweep, CommandSender};
use decloud_orchestrator::config::{default_config_path, OrchestratorConfig};
use decloud_orchestrator::events::{spawn_event_logger, EventBus};
use decloud_orchestrator::ingress::{IngressRegistry, LoggingProxyReloader, SystemDnsResolver};
use decloud_orchestrator::latency::{HttpIcmpTransport, LatencyTracker};
use decloud_orchestrator::lifecycle::LifecycleManager;
use decloud_orchestrator::registry::health::{spawn_health_scan, spawn_token_sweep};
use decloud_orchestrator::registry::NodeRegistry;
use decloud_orchestrator::scheduler::{spawn_scheduler_loop, Scheduler};
use decloud_orchestrator::store::{JsonFileStore, Store};
use decloud_orchestrator::sysvm::relay::HttpRelayAdmin;
use decloud_orchestrator::sysvm::{
    spawn_reconcile_loop, spawn_relay_health_loop, SysVmController,
};
use decloud_orchestrator::sysvm::mesh::WgTool;

#[derive(Parser)]
#[command(name = "decloudd", about = "DeCloud orchestrator control plane")]
struct Cli {
    /// Path to the orchestrator config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control plane
    Serve(ServeArgs),
    /// Validate the configuration file and exit
    CheckConfig,
}

#[derive(clap::Args)]
struct ServeArgs {
    /// Override the bind address
    #[arg(long)]
    bind_addr: Option<String>,

    /// Override the API port
    #[arg(long)]
    port: Option<u16>,

    /// Load environment variables from this file first
    #[arg(long)]
    env_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = match OrchestratorConfig::load_from(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {e}");
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Serve(args) => run_serve(config, args).await,
        Commands::CheckConfig => {
            info!("Configuration at {} is valid", config_path.display());
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("{e}");
        process::exit(1);
    }
}

async fn run_serve(mut config: OrchestratorConfig, args: ServeArgs) -> anyhow::Result<()> {
    if let Some(env_file) = &args.env_file {
        dotenvy::from_path(env_file)?;
    }
    if let Ok(secret) = std::env::var("DECLOUD_JWT_SECRET") {
        config.auth.jwt_secret = secret;
    }
    if let Some(bind_addr) = args.bind_addr {
        config.server.bind_addr = bind_addr;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    let config = Arc::new(config);

    // Core wiring: store, bus, then every component over them.
    let store = Store::new(Arc::new(JsonFileStore::new(config.server.data_dir.clone())));
    store.load_all().await?;

    let bus = EventBus::new();
    let ingress = IngressRegistry::new(
        store.clone(),
        config.ingress.clone(),
        Arc::new(LoggingProxyReloader),
        Arc::new(SystemDnsResolver),
    );
    let lifecycle = LifecycleManager::new(store.clone(), bus.clone(), ingress.clone());
    let commands = CommandSender::new(store.clone());
    let registry = NodeRegistry::new(
        store.clone(),
        bus.clone(),
        config.registry.clone(),
        config.scheduling.clone(),
        lifecycle.clone(),
    );
    let scheduler = Scheduler::new(
        store.clone(),
        config.scheduling.clone(),
        lifecycle.clone(),
        commands.clone(),
    );
    let auth = AuthService::new(
        store.clone(),
        bus.clone(),
        config.auth.clone(),
        Arc::new(InsecureDevVerifier),
    );

    let orchestrator_url = format!("http://{}:{}", config.server.bind_addr, config.server.port);
    let sysvm = SysVmController::new(
        store.clone(),
        bus.clone(),
        config.sysvm.clone(),
        lifecycle.clone(),
        commands.clone(),
        Arc::new(WgTool),
        Arc::new(HttpRelayAdmin::new()),
        orchestrator_url,
    );

    let settlement_client = Arc::new(LoggingSettlementClient);
    let (metering, billing_rx) = MeteringPipeline::new(
        store.clone(),
        bus.clone(),
        config.billing.clone(),
        settlement_client.clone(),
        Arc::new(AlwaysVerifiedAttestation),
    );
    let settlement_driver = SettlementDriver::new(
        store.clone(),
        bus.clone(),
        config.billing.clone(),
        settlement_client,
    );
    let latency = LatencyTracker::new(store.clone(), Arc::new(HttpIcmpTransport::new()));

    // One ambient shutdown signal threads through every loop.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = Vec::new();
    tasks.push(spawn_event_logger(
        &bus,
        config.server.data_dir.clone(),
        shutdown_rx.clone(),
    ));
    tasks.push(spawn_scheduler_loop(
        scheduler.clone(),
        config.scheduling.sweep_interval_secs,
        shutdown_rx.clone(),
    ));
    tasks.push(spawn_health_scan(
        registry.clone(),
        config.registry.health_scan_interval_secs,
        shutdown_rx.clone(),
    ));
    tasks.push(spawn_token_sweep(registry.clone(), shutdown_rx.clone()));
    tasks.push(spawn_reconcile_loop(sysvm.clone(), shutdown_rx.clone()));
    tasks.push(spawn_relay_health_loop(sysvm.clone(), shutdown_rx.clone()));
    tasks.push(spawn_metering_producer(metering.clone(), shutdown_rx.clone()));
    tasks.push(spawn_stop_listener(metering.clone(), shutdown_rx.clone()));
    tasks.push(spawn_metering_consumer(
        metering.clone(),
        billing_rx,
        shutdown_rx.clone(),
    ));
    tasks.push(spawn_settlement_driver(
        settlement_driver,
        config.billing.settlement_interval_secs,
        shutdown_rx.clone(),
    ));
    tasks.push(spawn_stale_command_sweep(
        store.clone(),
        config.registry.command_ttl_secs,
        60,
        shutdown_rx.clone(),
    ));

    let state = AppState {
        store,
        config: config.clone(),
        registry,
        scheduler,
        lifecycle,
        ingress,
        auth,
        sysvm,
        metering,
        latency,
        commands,
    };
    let app = create_router(state);

    let addr = format!("{}:{}", config.server.bind_addr, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("DeCloud orchestrator listening on {addr}");
    info!("Endpoints:");
    info!("  GET  /health                  - Health check");
    info!("  GET  /v1/status               - Cluster status");
    info!("  POST /nodes/register          - Node registration");
    info!("  POST /nodes/{{id}}/heartbeat    - Node heartbeat");
    info!("  POST /auth/login              - Wallet login");
    info!("  POST /v1/vms                  - Create VM");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    // Stop every background loop cooperatively.
    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    info!("orchestrator stopped");
    Ok(())
}
