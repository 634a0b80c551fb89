//! Process harness for the Fleet Command Runner core: loads configuration,
//! initializes logging, loads the vendor registry and an initial device
//! snapshot, and wires up a `Dispatcher` — the same shape as this
//! workspace's scheduler binary (config -> logging -> storage -> services),
//! generalized to this crate's domain. The RPC layer that would actually
//! drive this `Dispatcher` from the network is an external collaborator and
//! is not implemented here.

mod logging;

use fcr_config::FcrConfig;
use fcr_core::{
    DefaultTransportFactory, DeviceSnapshot, Dispatcher, DispatcherConfig, SessionRegistry,
    StaticInventory, VendorRegistry,
};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = FcrConfig::load().unwrap_or_else(|e| {
        eprintln!("failed to load configuration: {}, using defaults", e);
        FcrConfig::default()
    });

    logging::init_logging(&config.log_level)?;
    info!(port = config.port, lb_threshold = config.lb_threshold, "starting fcrd");

    let vendor_registry = Arc::new(VendorRegistry::load(config.vendor_config_path.as_deref())?);
    info!(vendors = vendor_registry.len(), "vendor registry loaded");

    // No real inventory backend is wired in this harness; an RPC harness
    // would substitute its own `DeviceInventory` implementation here.
    let inventory = Arc::new(StaticInventory::new(Vec::new()));
    let devices = Arc::new(DeviceSnapshot::new(inventory, config.device_name_filter.clone()));
    if let Err(e) = devices.refresh_once().await {
        error!(error = %e, "initial device snapshot refresh failed");
    }
    let _refresh_handle = devices.clone().spawn_refresh_loop(config.device_db_update_interval());

    let sessions = Arc::new(SessionRegistry::new());
    let _sweep_handle = sessions.clone().spawn_idle_sweeper(config.idle_timeout());

    let dispatcher = Dispatcher::new(
        vendor_registry,
        devices,
        sessions.clone(),
        Arc::new(DefaultTransportFactory),
        None,
        DispatcherConfig {
            lb_threshold: config.lb_threshold,
            remote_call_overhead: config.remote_call_overhead(),
            max_active_device_units: config.max_active_device_units,
            transient_idle_timeout: config.idle_timeout(),
        },
    );
    let _ = &dispatcher;

    info!("fcrd ready; waiting for shutdown signal");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining sessions");
    sessions.shutdown(config.exit_max_wait()).await;
    info!("fcrd exiting");

    Ok(())
}
