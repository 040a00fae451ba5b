//! routekeeper daemon.
//!
//! Wires the providers together and runs the event dispatch loop until
//! interrupted.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use routekeeper_agent::config::{AgentConfig, LogFormat};
use routekeeper_agent::entities::{AddressManager, InterfaceManager, RouteManager};
use routekeeper_agent::iproute::IpRouteBinding;
use routekeeper_agent::kernel::KernelProvider;
use routekeeper_agent::netlink::{InterfaceIndex, KernelEventSource};
use routekeeper_agent::rpc::RpcProvider;
use routekeeper_agent::runtime::{Registration, Runtime};
use routekeeper_agent::store::ConfigProvider;

fn main() -> Result<()> {
    let config = AgentConfig::from_env()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into());
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    info!(
        config_dir = %config.config_dir.display(),
        ip_binary = %config.ip_binary,
        route_protocol = config.route_protocol,
        "Starting routekeeper agent"
    );

    // One thread drives every provider; the kernel monitor has its own.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config))
}

async fn run(config: AgentConfig) -> Result<()> {
    let index = InterfaceIndex::shared();
    let binding = Arc::new(IpRouteBinding::new(config.ip_binary.clone(), Arc::clone(&index)));
    let kernel = KernelProvider::new(binding.clone(), binding, index, config.route_protocol);

    let mut runtime = Runtime::new();
    runtime.register(Registration::new(move |_| Ok(kernel)))?;
    runtime.register(
        Registration::new(ConfigProvider::from_injector)
            .with_kwarg("config_dir", config.config_dir.display().to_string()),
    )?;
    runtime.register(
        Registration::new(KernelEventSource::from_injector)
            .depends_on::<KernelProvider>("kernel"),
    )?;
    runtime.register(
        Registration::new(InterfaceManager::from_injector)
            .depends_on::<KernelProvider>("kernel")
            .depends_on::<ConfigProvider>("config"),
    )?;
    runtime.register(
        Registration::new(AddressManager::from_injector)
            .depends_on::<KernelProvider>("kernel")
            .depends_on::<ConfigProvider>("config"),
    )?;
    runtime.register(
        Registration::new(RouteManager::from_injector)
            .depends_on::<KernelProvider>("kernel")
            .depends_on::<ConfigProvider>("config"),
    )?;
    runtime.register(
        Registration::new(RpcProvider::from_injector)
            .depends_on::<ConfigProvider>("config")
            .depends_on::<InterfaceManager>("interfaces")
            .depends_on::<AddressManager>("addresses")
            .depends_on::<RouteManager>("routes"),
    )?;

    runtime.load()?;
    info!(order = ?runtime.load_order(), "Providers loaded");
    runtime.start().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        let _ = shutdown_tx.send(true);
    });

    let result = runtime.run(shutdown_rx).await;
    runtime.stop().await?;
    result?;

    info!("routekeeper agent stopped");
    Ok(())
}
