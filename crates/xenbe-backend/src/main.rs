//! Xen device backend entry point.
//!
//! Loads the configuration, builds a [`DiscoveryEngine`] for one device class
//! and blocks until Ctrl+C or until the engine's watch loop fails.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load_config()               -- TOML file, defaults when absent
//!  └─ DiscoveryEngine::new()      -- opens the store
//!  └─ DiscoveryEngine::start()    -- watch loop thread
//!  └─ wait_for_finish()           -- on a blocking task
//!  └─ Ctrl+C                      -- DiscoveryEngine::stop()
//! ```
//!
//! This binary carries no native driver binding.  `--simulate` runs the engine
//! against the in-memory control plane with a scripted guest, which is useful
//! to watch the discovery flow in the logs.

mod simulation;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use xenbe_backend::application::discovery::{DiscoveryEngine, EngineConfig};
use xenbe_backend::infrastructure::deferred::DeferredCallQueue;
use xenbe_backend::infrastructure::storage::config::{load_config, BackendConfig, DEFAULT_CONFIG_PATH};
use xenbe_core::control::mock::MockControlPlane;
use xenbe_core::ControlPlane;

use simulation::{LoggingFactory, SimulatedGuest};

/// Interval between steps of the simulated guest.
const SIMULATION_TICK: Duration = Duration::from_secs(2);

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Xen paravirtualized device backend.
#[derive(Debug, Parser)]
#[command(
    name = "xenbe-backend",
    about = "Discovers Xen frontends of one device class and serves them",
    version
)]
struct Cli {
    /// Device class to serve, e.g. `vif`, `vbd`, `vkbd`.
    #[arg(env = "XENBE_DEVICE_CLASS")]
    device_class: String,

    /// Attach only to frontends that are in the Initializing state.
    #[arg(short, long)]
    wait: bool,

    /// Path of the TOML configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH, env = "XENBE_CONFIG")]
    config: PathBuf,

    /// Run against the in-memory control plane with a scripted guest.
    #[arg(long)]
    simulate: bool,
}

impl Cli {
    /// Applies the command line on top of the file configuration.
    fn apply(&self, config: &mut BackendConfig) {
        config.backend.device_class = self.device_class.clone();
        config.backend.wait_for_frontend |= self.wait;
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    cli.apply(&mut config);

    // `RUST_LOG` wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    if !cli.simulate {
        bail!("no native control-plane binding is built in; run with --simulate");
    }

    info!(
        "{} starting for device class {:?} (wait for frontend: {})",
        config.backend.name, config.backend.device_class, config.backend.wait_for_frontend
    );

    let plane = MockControlPlane::new();
    let shared_plane: Arc<dyn ControlPlane> = Arc::new(plane.clone());
    let queue = Arc::new(DeferredCallQueue::new()?);
    let factory = Arc::new(LoggingFactory::new(Arc::clone(&shared_plane), Arc::clone(&queue)));

    let engine = Arc::new(DiscoveryEngine::new(
        shared_plane.as_ref(),
        EngineConfig::from_config(&config),
        factory,
    )?);
    engine.start()?;

    let guest = SimulatedGuest::new(plane, config.backend.device_class.clone());
    guest.start(SIMULATION_TICK)?;

    // ── Ctrl-C handler ────────────────────────────────────────────────────────
    let shutdown = Arc::clone(&engine);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                if let Err(e) = tokio::task::spawn_blocking(move || shutdown.stop()).await {
                    error!("engine stop task failed: {e}");
                }
            }
            Err(e) => error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });

    // ── Block until finished ──────────────────────────────────────────────────
    let waiter = Arc::clone(&engine);
    let outcome = tokio::task::spawn_blocking(move || waiter.wait_for_finish())
        .await
        .context("engine wait task failed")?;

    guest.stop();
    engine.stop();
    queue.stop();

    outcome?;
    info!("{} stopped", config.backend.name);
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
