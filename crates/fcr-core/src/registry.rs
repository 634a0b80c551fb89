//! Session Registry: the keyed store of live `Session`s, with owner affinity
//! and an idle sweep, generalizing this workspace's `ConnectionPool` from a
//! reusable-connection cache to a registry of caller-owned, affinity-checked
//! handles.

use crate::counters;
use crate::error::{FcrError, Result};
use crate::session::{Owner, Session};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

/// Holds every live `Session`, keyed by its id. Owner affinity is checked at
/// `lookup`, not at storage time, so the same map serves both the
/// dispatcher's anonymous single-shot sessions (`owner = None`) and the
/// persistent-session API family's owner-bound handles.
pub struct SessionRegistry {
    sessions: DashMap<u64, Session>,
    shutting_down: AtomicBool,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Store an already-opened session. Refuses new registrations once
    /// `shutdown` has been called.
    pub fn register(&self, session: Session) -> Result<u64> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(FcrError::session(
                crate::error::FcrErrorCode::Runtime,
                "registry is shutting down, refusing new session",
            ));
        }
        let id = session.id;
        self.sessions.insert(id, session);
        counters::incr(counters::SESSIONS_OPENED);
        counters::set(counters::SESSIONS_ACTIVE, self.sessions.len() as i64);
        Ok(id)
    }

    /// Returns the session only if `owner` matches the owner recorded at
    /// registration time — the affinity guarantee `open_session`/
    /// `run_session`/`close_session` depend on (invariant 3).
    pub fn lookup(&self, id: u64, owner: Option<Owner>) -> Result<Session> {
        let entry = self
            .sessions
            .get(&id)
            .ok_or_else(|| FcrError::lookup("session not found"))?;
        if entry.owner != owner {
            return Err(FcrError::lookup("session not found"));
        }
        Ok(entry.clone())
    }

    /// Cancel any in-flight operation, close the session, and remove it.
    /// `force_close` runs first so a stuck `run()` releases its socket
    /// promptly even if `close()` then has to wait briefly on the guard it
    /// is (still, momentarily) holding.
    #[instrument(skip(self))]
    pub async fn evict(&self, id: u64) -> Result<()> {
        let Some((_, session)) = self.sessions.remove(&id) else {
            return Ok(());
        };
        session.force_close().await;
        if let Err(e) = session.close().await {
            warn!(session_id = id, error = %e, "close during eviction reported an error");
        }
        counters::incr(counters::SESSIONS_EVICTED);
        counters::set(counters::SESSIONS_ACTIVE, self.sessions.len() as i64);
        Ok(())
    }

    /// Evict every session whose `last_activity` is older than its own
    /// `idle_timeout`. A session currently RUNNING (guard held) is skipped
    /// this round rather than waited on — it is by definition not idle.
    #[instrument(skip(self))]
    pub async fn sweep_idle(&self) {
        let expired: Vec<u64> = self
            .sessions
            .iter()
            .filter_map(|entry| {
                let session = entry.value();
                let last_activity = session.try_last_activity()?;
                if last_activity.elapsed() > session.idle_timeout {
                    Some(*entry.key())
                } else {
                    None
                }
            })
            .collect();

        for id in expired {
            info!(session_id = id, "evicting idle session");
            let _ = self.evict(id).await;
        }
    }

    /// Spawn the periodic idle sweep; intended to run for the process
    /// lifetime, driven by the harness.
    pub fn spawn_idle_sweeper(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.sweep_idle().await;
            }
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Refuse new sessions, wait up to `exit_max_wait` for each remaining
    /// session's in-flight command to finish via its normal `close()`, then
    /// force-close whatever is left.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, exit_max_wait: Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + exit_max_wait;
        let ids: Vec<u64> = self.sessions.iter().map(|e| *e.key()).collect();
        info!(sessions = ids.len(), "registry shutting down");

        for id in ids {
            let Some(session) = self.sessions.get(&id).map(|e| e.value().clone()) else {
                continue;
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, session.close()).await.is_err() {
                warn!(session_id = id, "close did not finish within exit_max_wait, forcing");
                session.force_close().await;
            }
            self.sessions.remove(&id);
        }
        counters::set(counters::SESSIONS_ACTIVE, 0);
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceRecord;
    use crate::transport::testing::{ScriptedTransport, ScriptedTransportFactory};
    use crate::vendor::VendorRegistry;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc as StdArc;

    fn registry_with_device(address: &str) -> (VendorRegistry, ScriptedTransportFactory, DeviceRecord) {
        let vendor_registry = VendorRegistry::from_profiles(VendorRegistry::default_table().unwrap());
        let factory = ScriptedTransportFactory::new();
        // Default reply to anything unlisted (including the vendor's own
        // `cli_setup` commands) is a bare prompt, so `Session::open`'s setup
        // sequence reaches READY instead of timing out on silence.
        factory.register(
            address,
            StdArc::new(ScriptedTransport::new().with_default_response(b"r1#".to_vec())),
        );
        let mut device = DeviceRecord::new("r1", "cisco_ios");
        device.preferred_ips = vec![address.to_string()];
        (vendor_registry, factory, device)
    }

    fn owner(port: u16) -> Owner {
        Owner {
            client_ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            client_port: port,
        }
    }

    #[tokio::test]
    async fn lookup_enforces_owner_affinity() {
        let (vendors, factory, device) = registry_with_device("198.51.100.1");
        let session = Session::open(
            &vendors,
            &device,
            Duration::from_secs(2),
            Duration::from_secs(60),
            false,
            Some(owner(4000)),
            &factory,
        )
        .await
        .unwrap();

        let registry = SessionRegistry::new();
        let id = registry.register(session).unwrap();

        assert!(registry.lookup(id, Some(owner(4000))).is_ok());
        let err = registry.lookup(id, Some(owner(4001))).unwrap_err();
        assert_eq!(err.code(), crate::error::FcrErrorCode::Lookup);
    }

    #[tokio::test]
    async fn evict_removes_entry_and_is_idempotent() {
        let (vendors, factory, device) = registry_with_device("198.51.100.2");
        let session = Session::open(
            &vendors,
            &device,
            Duration::from_secs(2),
            Duration::from_secs(60),
            false,
            None,
            &factory,
        )
        .await
        .unwrap();

        let registry = SessionRegistry::new();
        let id = registry.register(session).unwrap();
        assert_eq!(registry.len(), 1);

        registry.evict(id).await.unwrap();
        assert!(registry.is_empty());
        assert!(registry.lookup(id, None).is_err());
        // second evict of an already-gone id is a no-op, not an error.
        registry.evict(id).await.unwrap();
    }

    #[tokio::test]
    async fn sweep_idle_evicts_sessions_past_their_timeout() {
        let (vendors, factory, device) = registry_with_device("198.51.100.3");
        let session = Session::open(
            &vendors,
            &device,
            Duration::from_secs(2),
            Duration::from_millis(10),
            false,
            None,
            &factory,
        )
        .await
        .unwrap();

        let registry = SessionRegistry::new();
        registry.register(session).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        registry.sweep_idle().await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn shutdown_closes_all_remaining_sessions_and_refuses_new_ones() {
        let (vendors, factory, device) = registry_with_device("198.51.100.4");
        let session = Session::open(
            &vendors,
            &device,
            Duration::from_secs(2),
            Duration::from_secs(60),
            false,
            None,
            &factory,
        )
        .await
        .unwrap();

        let registry = SessionRegistry::new();
        registry.register(session).unwrap();
        registry.shutdown(Duration::from_secs(1)).await;
        assert!(registry.is_empty());

        let (vendors2, factory2, device2) = registry_with_device("198.51.100.5");
        let late_session = Session::open(
            &vendors2,
            &device2,
            Duration::from_secs(2),
            Duration::from_secs(60),
            false,
            None,
            &factory2,
        )
        .await
        .unwrap();
        assert!(registry.register(late_session).is_err());
    }
}
