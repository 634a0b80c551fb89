//! Device records and the inventory seam the core consumes them through.
//!
//! The inventory backend itself is the external collaborator the spec
//! describes as "a pluggable fetcher returning device records on demand and
//! on a refresh interval" — this module only defines the trait and the
//! refreshed, atomically-swapped snapshot the Resolver reads.

use crate::vendor::SessionKind;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// One device as known to the fleet inventory.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub hostname: String,
    pub username: String,
    pub password: String,
    /// Ordered list of preferred IP addresses, most preferred first.
    pub preferred_ips: Vec<String>,
    /// Explicit override; when set, bypasses inventory IP selection.
    pub ip_address: Option<String>,
    pub vendor: String,
    /// command text -> prompt regex, for commands that do not return to the
    /// normal prompt (e.g. `reboot`).
    pub command_prompts: HashMap<String, String>,
    pub session_kind_override: Option<SessionKind>,
    /// NETCONF subsystem name or exec-command string.
    pub session_data: Option<SessionData>,
    pub pre_setup_commands: Vec<String>,
    /// `None` = use the vendor default; `Some(empty)` = do not send one.
    pub clear_command_override: Option<String>,
    pub failover_to_backup_ips: bool,
    pub port: Option<u16>,
}

#[derive(Debug, Clone)]
pub enum SessionData {
    Subsystem(String),
    ExecCommand(String),
}

impl DeviceRecord {
    pub fn new(hostname: impl Into<String>, vendor: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            username: String::new(),
            password: String::new(),
            preferred_ips: Vec::new(),
            ip_address: None,
            vendor: vendor.into(),
            command_prompts: HashMap::new(),
            session_kind_override: None,
            session_data: None,
            pre_setup_commands: Vec::new(),
            clear_command_override: None,
            failover_to_backup_ips: false,
            port: None,
        }
    }
}

/// A pluggable fetcher returning device records on demand and on a refresh
/// interval. The real backend (an external collaborator) is out of scope;
/// this trait is the minimal shape needed to exercise the Resolver in tests.
#[async_trait]
pub trait DeviceInventory: Send + Sync {
    async fn fetch_all(&self) -> crate::error::Result<Vec<DeviceRecord>>;
}

/// An inventory populated from a fixed, in-memory list — used by tests and
/// by harnesses without a real fleet inventory backend.
pub struct StaticInventory {
    records: Vec<DeviceRecord>,
}

impl StaticInventory {
    pub fn new(records: Vec<DeviceRecord>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl DeviceInventory for StaticInventory {
    async fn fetch_all(&self) -> crate::error::Result<Vec<DeviceRecord>> {
        Ok(self.records.clone())
    }
}

/// Holds the current device snapshot behind a lock, refreshed on
/// `device_db_update_interval` by a background task. Replacement is an
/// atomic pointer swap — readers never observe a partially updated list.
pub struct DeviceSnapshot {
    current: RwLock<Arc<Vec<DeviceRecord>>>,
    inventory: Arc<dyn DeviceInventory>,
    name_filter: Option<String>,
}

impl DeviceSnapshot {
    pub fn new(inventory: Arc<dyn DeviceInventory>, name_filter: Option<String>) -> Self {
        Self {
            current: RwLock::new(Arc::new(Vec::new())),
            inventory,
            name_filter,
        }
    }

    /// Fetch the backend once and publish the result immediately, without
    /// waiting for the refresh loop. Useful at startup.
    #[instrument(skip(self))]
    pub async fn refresh_once(&self) -> crate::error::Result<()> {
        let mut records = self.inventory.fetch_all().await?;
        if let Some(filter) = &self.name_filter {
            records.retain(|r| r.hostname.contains(filter.as_str()));
        }
        let count = records.len();
        let new_snapshot = Arc::new(records);
        {
            let mut guard = self.current.write().unwrap();
            *guard = new_snapshot;
        }
        debug!(devices = count, "device snapshot refreshed");
        Ok(())
    }

    /// Current published snapshot; cheap `Arc` clone, never blocks on I/O.
    pub fn get(&self) -> Arc<Vec<DeviceRecord>> {
        self.current.read().unwrap().clone()
    }

    pub fn find(&self, hostname: &str) -> Option<DeviceRecord> {
        self.get().iter().find(|d| d.hostname == hostname).cloned()
    }

    /// Spawn the periodic refresh loop; intended to run for the lifetime of
    /// the process, driven by the harness.
    pub fn spawn_refresh_loop(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = self.refresh_once().await {
                    warn!(error = %err, "device snapshot refresh failed, keeping stale snapshot");
                } else {
                    info!("device snapshot refresh completed");
                }
            }
        })
    }
}
