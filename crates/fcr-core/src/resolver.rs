//! Device Resolver: turns a `DeviceRecord` plus the Vendor Registry into a
//! concrete connection target.

use crate::device::{DeviceRecord, SessionData};
use crate::error::{FcrError, Result};
use crate::vendor::{SessionKind, VendorProfile, VendorRegistry};
use std::collections::HashMap;

/// Everything a Session needs to open a transport: an ordered list of
/// addresses to try (failover order), credentials, the vendor profile, and
/// the session kind/data to use.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub addresses: Vec<String>,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vendor: VendorProfile,
    pub session_kind: SessionKind,
    pub session_data: Option<SessionData>,
    /// Per-command prompt overrides carried from the device record, for
    /// commands that do not return to the normal prompt (e.g. `reboot`).
    /// Sits between an explicit raw-session override and the vendor's
    /// default prompt set in precedence (§4.5).
    pub command_prompts: HashMap<String, String>,
    /// The clear-command bytes `Session::run_one` actually sends ahead of
    /// each sub-command: the device record's override if set (an empty
    /// string there means "do not send one"), else the vendor default.
    pub clear_command: Vec<u8>,
}

pub struct DeviceResolver<'a> {
    registry: &'a VendorRegistry,
}

impl<'a> DeviceResolver<'a> {
    pub fn new(registry: &'a VendorRegistry) -> Self {
        Self { registry }
    }

    /// Resolve a device record to a connection target.
    ///
    /// 1. `ip_address` wins verbatim if set.
    /// 2. Otherwise the record's preferred IP list is used.
    /// 3. `failover_to_backup_ips == false` truncates to the first address;
    ///    `true` keeps the full ordered list for the Session layer to retry.
    /// 4. Vendor must be resolvable in the registry or this fails with
    ///    `UNSUPPORTED_DEVICE`.
    pub fn resolve(&self, device: &DeviceRecord) -> Result<ResolvedTarget> {
        let vendor = self.registry.get(&device.vendor).ok_or_else(|| {
            FcrError::unsupported_device(format!("unknown vendor: {}", device.vendor))
        })?;

        let mut addresses = if let Some(ip) = &device.ip_address {
            vec![ip.clone()]
        } else {
            device.preferred_ips.clone()
        };

        if addresses.is_empty() {
            return Err(FcrError::unsupported_device(format!(
                "device {} has no resolvable address",
                device.hostname
            )));
        }

        if !device.failover_to_backup_ips {
            addresses.truncate(1);
        }

        let session_kind = device.session_kind_override.unwrap_or(vendor.session_kind);

        let clear_command = match &device.clear_command_override {
            Some(s) if s.is_empty() => Vec::new(),
            Some(s) => s.clone().into_bytes(),
            None => vendor.clear_command.clone(),
        };

        Ok(ResolvedTarget {
            addresses,
            port: device.port.unwrap_or(22),
            username: device.username.clone(),
            password: device.password.clone(),
            vendor: vendor.clone(),
            session_kind,
            session_data: device.session_data.clone(),
            command_prompts: device.command_prompts.clone(),
            clear_command,
        })
    }
}
