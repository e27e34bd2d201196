use std::sync::Arc;

use anyhow::{Context, Result};
use rollcall_core::{MatcherHandle, VerificationOrchestrator};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod oracle;
mod store;

use config::Config;
use dbus_interface::AttendanceService;
use oracle::{DbusLiveness, DbusMatcher};
use store::SqliteStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::from_env();
    let policy = Arc::new(config::policy_from_env().context("invalid threshold policy")?);

    let store = SqliteStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening database at {}", config.db_path.display()))?;

    let bus = if config.session_bus {
        zbus::Connection::session().await?
    } else {
        zbus::Connection::system().await?
    };

    let matcher = DbusMatcher::connect(
        &bus,
        &config.matcher_service,
        &config.matcher_path,
        config.oracle_timeout_secs,
    )
    .await
    .context("connecting to matcher oracle")?;
    let matcher = Arc::new(MatcherHandle::new(Arc::new(matcher)));

    let liveness = Arc::new(
        DbusLiveness::connect(
            &bus,
            &config.liveness_service,
            &config.liveness_path,
            config.oracle_timeout_secs,
        )
        .await
        .context("connecting to liveness oracle")?,
    );

    let orchestrator = Arc::new(VerificationOrchestrator::new(
        policy.clone(),
        matcher.clone(),
        liveness,
        Arc::new(store.clone()),
    ));

    let service = AttendanceService {
        config,
        policy,
        store,
        matcher,
        orchestrator,
        bus: bus.clone(),
    };

    bus.object_server()
        .at("/org/rollcall/Attendance1", service)
        .await?;
    bus.request_name("org.rollcall.Attendance1").await?;

    tracing::info!("rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
