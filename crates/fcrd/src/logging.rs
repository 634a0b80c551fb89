//! Logging init for the harness, generalizing this workspace's scheduler
//! logging setup (registry + EnvFilter + fmt layer) to fcrd's single
//! `log_level` knob rather than the scheduler's file/json format matrix —
//! the process harness here has no log-file config knob to branch on.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn init_logging(log_level: &str) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            let filter_str = format!("{},ssh2=info,fcr_core=debug", log_level);
            tracing::debug!("logging filter configured: {}", filter_str);
            EnvFilter::try_new(&filter_str)
        })
        .unwrap_or_else(|_| EnvFilter::new("info,ssh2=info,fcr_core=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();

    tracing::info!(level = %log_level, "logging initialized");
    Ok(())
}
