//! `cabinetd` — wires the cabinet control plane together: serial
//! transport, device controller, wallet and session-store backends,
//! the state machine, recovery engine, session manager, and the
//! algorithm-device bridge (spec §6, §9).

use std::sync::Arc;
use std::time::Duration;

use cabinet_control::clock;
use cabinet_control::config::{AlgoConfig, CabinetConfig, ControllerConfig, SerialConfig, SessionConfig};
use cabinet_control::device::{Callbacks, DeviceController, StatsStore};
use cabinet_control::session::{RecoveryEngine, SessionManager, SessionStore, SqliteSessionStore, StateMachine};
use cabinet_control::slot::{FixedPayoutEngine, SlotEngine};
use cabinet_control::wallet::{SqliteWalletRepository, WalletRepository};
use cabinet_control::algo::AlgoClient;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Cabinet control plane daemon.
#[derive(Parser, Debug)]
#[command(name = "cabinetd", about = "Arcade cabinet control plane")]
struct Cli {
    /// Serial device path, or a name pattern to auto-discover.
    #[arg(long, env = "CABINET_SERIAL_PORT", default_value = "/dev/ttyS3")]
    serial_port: String,

    #[arg(long, env = "CABINET_SERIAL_BAUD", default_value_t = 115_200)]
    serial_baud: u32,

    /// Algorithm device port, or "auto" to pick the first enumerated port.
    #[arg(long, env = "CABINET_ALGO_PORT", default_value = "auto")]
    algo_port: String,

    #[arg(long, env = "CABINET_ALGO_BAUD", default_value_t = 115_200)]
    algo_baud: u32,

    #[arg(long, env = "CABINET_ALGO_TIMER_ENABLED")]
    algo_timer_enabled: bool,

    #[arg(long, env = "CABINET_ALGO_INTERVAL_SECS", default_value_t = 5)]
    algo_interval_secs: u64,

    #[arg(long, env = "CABINET_HEARTBEAT_INTERVAL_SECS", default_value_t = 30)]
    heartbeat_interval_secs: u64,

    #[arg(long, env = "CABINET_SESSION_TIMEOUT_SECS", default_value_t = 30 * 60)]
    session_timeout_secs: u64,

    #[arg(long, env = "CABINET_MAX_SESSIONS", default_value_t = 100)]
    max_sessions: usize,

    #[arg(long, env = "CABINET_IDLE_REAPER_INTERVAL_SECS", default_value_t = 5 * 60)]
    idle_reaper_interval_secs: u64,

    /// Path to the wallet SQLite database.
    #[arg(long, env = "CABINET_WALLET_DB_PATH", default_value = "cabinet_wallet.db")]
    wallet_db_path: String,

    /// Path to the session-snapshot SQLite database.
    #[arg(long, env = "CABINET_SESSION_DB_PATH", default_value = "cabinet_sessions.db")]
    session_db_path: String,

    /// Directory for day-partitioned device statistics files.
    #[arg(long, env = "CABINET_STATS_DIR", default_value = "cabinet_stats")]
    stats_dir: String,

    /// Run without opening a serial transport, for bring-up on a machine
    /// with no microcontroller attached.
    #[arg(long)]
    no_device: bool,
}

impl Cli {
    fn into_config(self) -> (CabinetConfig, PathsConfig) {
        let config = CabinetConfig {
            serial: SerialConfig {
                port: self.serial_port,
                baud: self.serial_baud,
                ..Default::default()
            },
            algo: AlgoConfig {
                port: self.algo_port,
                baud: self.algo_baud,
                timer_enabled: self.algo_timer_enabled,
                interval: Duration::from_secs(self.algo_interval_secs),
                ..Default::default()
            },
            controller: ControllerConfig {
                heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
                ..Default::default()
            },
            session: SessionConfig {
                session_timeout: Duration::from_secs(self.session_timeout_secs),
                max_sessions: self.max_sessions,
                idle_reaper_interval: Duration::from_secs(self.idle_reaper_interval_secs),
                ..Default::default()
            },
        };
        let paths = PathsConfig {
            wallet_db_path: self.wallet_db_path,
            session_db_path: self.session_db_path,
            stats_dir: self.stats_dir,
            no_device: self.no_device,
        };
        (config, paths)
    }
}

struct PathsConfig {
    wallet_db_path: String,
    session_db_path: String,
    stats_dir: String,
    no_device: bool,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cabinet_control=info,cabinetd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let (config, paths) = Cli::parse().into_config();

    info!("cabinet control plane starting");

    let clock = clock::system_clock();

    let wallet: Arc<dyn WalletRepository> = Arc::new(SqliteWalletRepository::new(&paths.wallet_db_path)?);
    let store: Arc<dyn SessionStore> = Arc::new(SqliteSessionStore::new(&paths.session_db_path)?);

    let device = if paths.no_device {
        info!("starting with --no-device; dispense on win is disabled");
        None
    } else {
        let stats_store = StatsStore::new(paths.stats_dir.clone());
        let callbacks = Callbacks {
            on_fault: Some(Arc::new(|code, level| {
                warn!(?code, ?level, "device fault reported");
            })),
            ..Default::default()
        };
        Some(DeviceController::open(
            config.serial.clone(),
            config.controller.clone(),
            stats_store,
            clock.clone(),
            callbacks,
        ))
    };

    let algo_client = Arc::new(AlgoClient::new(config.algo.clone()));
    let _algo_poller = algo_client.spawn_poller(|resp| {
        info!(win = resp.win, hp30 = resp.hp30, "algorithm device poll response");
    });

    let state_machine = StateMachine::new(store.clone(), clock.clone(), None);
    let recovery_state_machine = StateMachine::new(store.clone(), clock.clone(), None);
    let recovery = Arc::new(RecoveryEngine::new(
        store.clone(),
        wallet.clone(),
        recovery_state_machine,
        clock.clone(),
        config.session.session_timeout,
        config.session.ready_stale_limit,
    ));

    let slot_engine: Arc<dyn SlotEngine> = Arc::new(FixedPayoutEngine::always_lose());

    let manager = Arc::new(SessionManager::new(
        store.clone(),
        wallet.clone(),
        state_machine,
        recovery.clone(),
        slot_engine,
        device.clone(),
        clock.clone(),
        config.session.clone(),
    ));

    manager.clone().spawn_idle_reaper();
    spawn_recovery_sweep(recovery.clone(), config.session.idle_reaper_interval);

    info!("cabinet control plane ready");

    shutdown_signal().await;
    info!("shutdown signal received, stopping");

    // Shutdown ordering (spec §5): session manager first, then the
    // recovery sweep, then the device controller, then the store flush.
    // There is no explicit "stop accepting requests" step here because
    // the session manager has no network listener of its own in this
    // binary; callers of this process embed it as a library instead.
    if let Some(device) = &device {
        device.shutdown();
    }

    Ok(())
}

fn spawn_recovery_sweep(recovery: Arc<RecoveryEngine>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let results = recovery.sweep().await;
            if !results.is_empty() {
                info!(count = results.len(), "recovery sweep completed");
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
