//! Dispatcher: the six externally visible RPC operations (plus their raw
//! variants), fanning single-shot and bulk requests out across devices and,
//! for oversized bulk requests, across peer instances — the async
//! counterpart of this workspace's `ConnectHandler`/`ConnectionManager`
//! dispatch, generalized from "one device, one blocking call" to "many
//! devices, one concurrent unit of work each, under a shared deadline".

use crate::device::{DeviceRecord, DeviceSnapshot};
use crate::error::{FcrError, Result};
use crate::registry::SessionRegistry;
use crate::session::{CommandResult, Owner, Session};
use crate::transport::TransportFactory;
use crate::vendor::VendorRegistry;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{instrument, warn};

/// How a Dispatcher reaches a peer instance to forward an oversized bulk
/// request. The real peer-selection and RPC-transport concerns are external
/// collaborators (§1); this is the minimal seam the Dispatcher needs to
/// exercise chunking and deadline propagation in tests.
#[async_trait]
pub trait PeerDispatcher: Send + Sync {
    /// Addresses of peer instances available for forwarding, in the order
    /// they should be tried round-robin.
    fn peers(&self) -> Vec<String>;

    async fn bulk_run_local(
        &self,
        peer: &str,
        commands: HashMap<String, Vec<String>>,
        timeout: Duration,
        open_timeout: Duration,
        uuid: &str,
    ) -> Result<HashMap<String, Vec<CommandResult>>>;
}

#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    pub lb_threshold: usize,
    pub remote_call_overhead: Duration,
    pub max_active_device_units: usize,
    /// idle_timeout used for the dispatcher's own anonymous/transient
    /// sessions; irrelevant to their correctness since those sessions are
    /// closed at the end of the call that opened them, but still required
    /// by `Session::open`'s signature.
    pub transient_idle_timeout: Duration,
}

/// Implements `run`/`bulk_run`/`bulk_run_local`/`open_session`/`run_session`/
/// `close_session` and their `_raw` counterparts. Cheap to clone: every field
/// is an `Arc` or `Copy`.
#[derive(Clone)]
pub struct Dispatcher {
    vendor_registry: Arc<VendorRegistry>,
    devices: Arc<DeviceSnapshot>,
    sessions: Arc<SessionRegistry>,
    connector: Arc<dyn TransportFactory>,
    peer: Option<Arc<dyn PeerDispatcher>>,
    units: Arc<Semaphore>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        vendor_registry: Arc<VendorRegistry>,
        devices: Arc<DeviceSnapshot>,
        sessions: Arc<SessionRegistry>,
        connector: Arc<dyn TransportFactory>,
        peer: Option<Arc<dyn PeerDispatcher>>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            vendor_registry,
            devices,
            sessions,
            connector,
            peer,
            units: Arc::new(Semaphore::new(config.max_active_device_units)),
            config,
        }
    }

    pub fn session_registry(&self) -> Arc<SessionRegistry> {
        self.sessions.clone()
    }

    /// `run`: a single-shot, anonymous session opened, used once, and closed.
    #[instrument(skip(self, device, uuid), fields(device = %device.hostname))]
    pub async fn run(
        &self,
        device: &DeviceRecord,
        command: &str,
        timeout: Duration,
        open_timeout: Duration,
        uuid: impl Into<String>,
    ) -> Result<CommandResult> {
        let session = Session::open(
            &self.vendor_registry,
            device,
            open_timeout,
            self.config.transient_idle_timeout,
            false,
            None,
            self.connector.as_ref(),
        )
        .await?;

        let result = session.run(command, timeout, None).await;
        let _ = session.close().await;
        result.map(|mut r| {
            r.uuid = uuid.into();
            r
        })
    }

    /// `bulk_run`: shards to peers when the request exceeds `lb_threshold`
    /// and at least one peer is available; otherwise runs locally.
    #[instrument(skip(self, commands, uuid))]
    pub async fn bulk_run(
        &self,
        commands: HashMap<String, Vec<String>>,
        timeout: Duration,
        open_timeout: Duration,
        uuid: impl Into<String>,
    ) -> Result<HashMap<String, Vec<CommandResult>>> {
        let uuid = uuid.into();
        let peers = self.peer.as_ref().map(|p| p.peers()).unwrap_or_default();

        if commands.len() <= self.config.lb_threshold || peers.is_empty() {
            return self.bulk_run_local(commands, timeout, open_timeout, uuid).await;
        }

        let peer_dispatcher = self.peer.as_ref().expect("peers() returned non-empty above");
        let forwarded_timeout = timeout
            .checked_sub(self.config.remote_call_overhead)
            .unwrap_or(Duration::ZERO);

        let mut out = HashMap::with_capacity(commands.len());
        for (i, chunk) in chunk_devices(commands, self.config.lb_threshold).into_iter().enumerate() {
            let peer = &peers[i % peers.len()];
            let partial = peer_dispatcher
                .bulk_run_local(peer, chunk, forwarded_timeout, open_timeout, &uuid)
                .await?;
            out.extend(partial);
        }
        Ok(out)
    }

    /// `bulk_run_local`: every device gets its own concurrent unit of work;
    /// a failing device never cancels the others. Refuses the whole call
    /// with `INSTANCE_OVERLOADED` if it would push the active-unit count
    /// past `max_active_device_units`.
    #[instrument(skip(self, commands, uuid))]
    pub async fn bulk_run_local(
        &self,
        commands: HashMap<String, Vec<String>>,
        timeout: Duration,
        open_timeout: Duration,
        uuid: impl Into<String>,
    ) -> Result<HashMap<String, Vec<CommandResult>>> {
        let uuid = uuid.into();
        let requested = commands.len() as u32;
        let permit = if requested == 0 {
            None
        } else {
            Some(self.units.clone().try_acquire_many_owned(requested).map_err(|_| {
                FcrError::instance_overloaded(format!(
                    "bulk_run_local for {} devices would exceed the active-unit ceiling",
                    requested
                ))
            })?)
        };

        let mut tasks = Vec::with_capacity(commands.len());
        for (hostname, cmds) in commands {
            let dispatcher = self.clone();
            let uuid = uuid.clone();
            tasks.push(tokio::spawn(async move {
                let results = dispatcher.run_device_sequence(&hostname, cmds, timeout, open_timeout, &uuid).await;
                (hostname, results)
            }));
        }

        let mut out = HashMap::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok((hostname, results)) => {
                    out.insert(hostname, results);
                }
                Err(e) => warn!(error = %e, "device unit task panicked"),
            }
        }
        drop(permit);
        Ok(out)
    }

    /// Opens one transient session for `hostname`, runs `commands` in order,
    /// stopping at the first failure, and closes the session. Always
    /// returns at least one entry if the device was known, satisfying
    /// invariant 4 (every requested hostname has an entry in the response).
    async fn run_device_sequence(
        &self,
        hostname: &str,
        commands: Vec<String>,
        timeout: Duration,
        open_timeout: Duration,
        uuid: &str,
    ) -> Vec<CommandResult> {
        let Some(device) = self.devices.find(hostname) else {
            return vec![CommandResult {
                output: String::new(),
                status: format!("unknown device: {}", hostname),
                command: commands.first().cloned().unwrap_or_default(),
                capabilities: None,
                uuid: uuid.to_string(),
            }];
        };

        let session = match Session::open(
            &self.vendor_registry,
            &device,
            open_timeout,
            self.config.transient_idle_timeout,
            false,
            None,
            self.connector.as_ref(),
        )
        .await
        {
            Ok(s) => s,
            Err(e) => {
                return vec![CommandResult {
                    output: String::new(),
                    status: e.status_message(),
                    command: commands.first().cloned().unwrap_or_default(),
                    capabilities: None,
                    uuid: uuid.to_string(),
                }]
            }
        };

        let mut results = Vec::with_capacity(commands.len());
        for command in &commands {
            match session.run(command, timeout, None).await {
                Ok(mut result) => {
                    result.uuid = uuid.to_string();
                    let failed = result.status != "success";
                    results.push(result);
                    if failed {
                        break;
                    }
                }
                Err(e) => {
                    results.push(CommandResult {
                        output: String::new(),
                        status: e.status_message(),
                        command: command.clone(),
                        capabilities: None,
                        uuid: uuid.to_string(),
                    });
                    break;
                }
            }
        }

        let _ = session.close().await;
        results
    }

    #[instrument(skip(self, device, owner))]
    pub async fn open_session(
        &self,
        device: &DeviceRecord,
        open_timeout: Duration,
        idle_timeout: Duration,
        owner: Owner,
    ) -> Result<u64> {
        self.open_session_inner(device, open_timeout, idle_timeout, owner, false).await
    }

    #[instrument(skip(self, device, owner))]
    pub async fn open_raw_session(
        &self,
        device: &DeviceRecord,
        open_timeout: Duration,
        idle_timeout: Duration,
        owner: Owner,
    ) -> Result<u64> {
        self.open_session_inner(device, open_timeout, idle_timeout, owner, true).await
    }

    async fn open_session_inner(
        &self,
        device: &DeviceRecord,
        open_timeout: Duration,
        idle_timeout: Duration,
        owner: Owner,
        raw: bool,
    ) -> Result<u64> {
        let session = Session::open(
            &self.vendor_registry,
            device,
            open_timeout,
            idle_timeout,
            raw,
            Some(owner),
            self.connector.as_ref(),
        )
        .await?;
        self.sessions.register(session)
    }

    pub async fn run_session(
        &self,
        id: u64,
        owner: Owner,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult> {
        self.run_session_inner(id, owner, command, timeout, None).await
    }

    pub async fn run_raw_session(
        &self,
        id: u64,
        owner: Owner,
        command: &str,
        timeout: Duration,
        prompt_regex: &str,
    ) -> Result<CommandResult> {
        self.run_session_inner(id, owner, command, timeout, Some(prompt_regex)).await
    }

    /// A failed command marks the session FAILED (inside `Session::run`);
    /// the Dispatcher evicts it immediately afterward rather than leaving a
    /// FAILED session occupying a registry slot until the idle sweep finds
    /// it, per §7's "cancellation, timeouts, and transport close are all
    /// fatal for the enclosing Session".
    async fn run_session_inner(
        &self,
        id: u64,
        owner: Owner,
        command: &str,
        timeout: Duration,
        prompt_override: Option<&str>,
    ) -> Result<CommandResult> {
        let session = self.sessions.lookup(id, Some(owner))?;
        let result = session.run(command, timeout, prompt_override).await;
        match &result {
            Ok(r) if r.status != "success" => {
                let _ = self.sessions.evict(id).await;
            }
            Err(_) => {
                let _ = self.sessions.evict(id).await;
            }
            _ => {}
        }
        result
    }

    pub async fn close_session(&self, id: u64, owner: Owner) -> Result<()> {
        self.sessions.lookup(id, Some(owner))?;
        self.sessions.evict(id).await
    }

    pub async fn close_raw_session(&self, id: u64, owner: Owner) -> Result<()> {
        self.close_session(id, owner).await
    }
}

/// Splits a hostname->commands map into chunks of at most `lb_threshold`
/// devices each, for forwarding to peers via `bulk_run_local`.
fn chunk_devices(
    commands: HashMap<String, Vec<String>>,
    lb_threshold: usize,
) -> Vec<HashMap<String, Vec<String>>> {
    let lb_threshold = lb_threshold.max(1);
    let mut chunks = Vec::new();
    let mut current = HashMap::new();
    for (hostname, cmds) in commands {
        current.insert(hostname, cmds);
        if current.len() >= lb_threshold {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::StaticInventory;
    use crate::transport::testing::{ScriptedTransport, ScriptedTransportFactory};
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc as StdArc;

    fn owner() -> Owner {
        Owner {
            client_ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            client_port: 5000,
        }
    }

    fn base_config() -> DispatcherConfig {
        DispatcherConfig {
            lb_threshold: 100,
            remote_call_overhead: Duration::from_millis(100),
            max_active_device_units: 16,
            transient_idle_timeout: Duration::from_secs(60),
        }
    }

    async fn dispatcher_with_devices(
        devices: Vec<(DeviceRecord, &str)>,
    ) -> (Dispatcher, StdArc<ScriptedTransportFactory>) {
        let vendor_registry = StdArc::new(VendorRegistry::from_profiles(VendorRegistry::default_table().unwrap()));
        let factory = StdArc::new(ScriptedTransportFactory::new());
        let mut records = Vec::new();
        for (mut device, address) in devices {
            device.preferred_ips = vec![address.to_string()];
            // Default reply to anything unlisted (including the vendor's own
            // `cli_setup` commands) is a bare prompt, so `Session::open`'s
            // setup sequence reaches READY instead of timing out on silence.
            factory.register(
                address,
                StdArc::new(ScriptedTransport::new().with_default_response(b"r1#".to_vec())),
            );
            records.push(device);
        }
        let snapshot = StdArc::new(DeviceSnapshot::new(StdArc::new(StaticInventory::new(records)), None));
        snapshot.refresh_once().await.unwrap();

        let dispatcher = Dispatcher::new(
            vendor_registry,
            snapshot,
            StdArc::new(SessionRegistry::new()),
            factory.clone(),
            None,
            base_config(),
        );
        (dispatcher, factory)
    }

    #[tokio::test]
    async fn run_opens_executes_and_closes_transient_session() {
        let (dispatcher, _factory) =
            dispatcher_with_devices(vec![(DeviceRecord::new("r1", "cisco_ios"), "203.0.113.1")]).await;
        let device = DeviceRecord {
            preferred_ips: vec!["203.0.113.1".to_string()],
            ..DeviceRecord::new("r1", "cisco_ios")
        };

        let result = dispatcher
            .run(&device, "show version", Duration::from_secs(2), Duration::from_secs(2), "req-1")
            .await
            .unwrap();
        assert_eq!(result.status, "success");
        assert_eq!(result.uuid, "req-1");
        assert!(dispatcher.session_registry().is_empty());
    }

    #[tokio::test]
    async fn bulk_run_local_reports_every_requested_hostname() {
        let (dispatcher, _factory) = dispatcher_with_devices(vec![
            (DeviceRecord::new("r1", "cisco_ios"), "203.0.113.2"),
        ])
        .await;

        let mut commands = HashMap::new();
        commands.insert("r1".to_string(), vec!["show version".to_string()]);
        commands.insert("unknown".to_string(), vec!["show version".to_string()]);

        let responses = dispatcher
            .bulk_run_local(commands, Duration::from_secs(2), Duration::from_secs(2), "req-2")
            .await
            .unwrap();

        assert_eq!(responses.len(), 2);
        assert_eq!(responses["r1"][0].status, "success");
        assert!(responses["unknown"][0].status.contains("unknown device"));
    }

    /// E4: a known-but-unreachable device gets a connection-error status
    /// alongside the other device's success, and the call itself never
    /// raises.
    #[tokio::test]
    async fn bulk_run_reports_connection_failure_without_raising() {
        let vendor_registry = StdArc::new(VendorRegistry::from_profiles(VendorRegistry::default_table().unwrap()));
        let factory = StdArc::new(ScriptedTransportFactory::new());
        factory.register(
            "203.0.113.10",
            StdArc::new(ScriptedTransport::new().with_default_response(b"r1#".to_vec())),
        );
        // d2 ("203.0.113.11") is deliberately left unregistered, so
        // `ScriptedTransportFactory::connect` fails with a connection error.

        let mut d1 = DeviceRecord::new("d1", "cisco_ios");
        d1.preferred_ips = vec!["203.0.113.10".to_string()];
        let mut d2 = DeviceRecord::new("d2", "cisco_ios");
        d2.preferred_ips = vec!["203.0.113.11".to_string()];

        let snapshot = StdArc::new(DeviceSnapshot::new(
            StdArc::new(StaticInventory::new(vec![d1, d2])),
            None,
        ));
        snapshot.refresh_once().await.unwrap();

        let dispatcher = Dispatcher::new(
            vendor_registry,
            snapshot,
            StdArc::new(SessionRegistry::new()),
            factory,
            None,
            base_config(),
        );

        let mut commands = HashMap::new();
        commands.insert("d1".to_string(), vec!["show version".to_string()]);
        commands.insert("d2".to_string(), vec!["show version".to_string()]);

        let responses = dispatcher
            .bulk_run(commands, Duration::from_secs(2), Duration::from_secs(2), "req-4")
            .await
            .unwrap();

        assert_eq!(responses.len(), 2);
        assert_eq!(responses["d1"][0].status, "success");
        assert_ne!(responses["d2"][0].status, "success");
    }

    #[tokio::test]
    async fn bulk_run_local_sheds_load_past_the_ceiling() {
        let small = Dispatcher::new(
            StdArc::new(VendorRegistry::from_profiles(VendorRegistry::default_table().unwrap())),
            StdArc::new(DeviceSnapshot::new(StdArc::new(StaticInventory::new(vec![])), None)),
            StdArc::new(SessionRegistry::new()),
            StdArc::new(ScriptedTransportFactory::new()),
            None,
            DispatcherConfig {
                max_active_device_units: 1,
                ..base_config()
            },
        );

        let mut commands = HashMap::new();
        commands.insert("r1".to_string(), vec!["x".to_string()]);
        commands.insert("r2".to_string(), vec!["x".to_string()]);

        let err = small
            .bulk_run_local(commands, Duration::from_secs(1), Duration::from_secs(1), "req-3")
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::FcrErrorCode::InstanceOverloaded);
    }

    /// A `PeerDispatcher` double recording every forwarded chunk, used to
    /// verify `bulk_run`'s sharding (E5): chunk sizes stay within
    /// `lb_threshold` and the forwarded deadline already has
    /// `remote_call_overhead` subtracted.
    struct RecordingPeer {
        calls: StdArc<std::sync::Mutex<Vec<(String, usize, Duration)>>>,
    }

    #[async_trait::async_trait]
    impl PeerDispatcher for RecordingPeer {
        fn peers(&self) -> Vec<String> {
            vec!["peer-a".to_string()]
        }

        async fn bulk_run_local(
            &self,
            peer: &str,
            commands: HashMap<String, Vec<String>>,
            timeout: Duration,
            _open_timeout: Duration,
            uuid: &str,
        ) -> Result<HashMap<String, Vec<CommandResult>>> {
            self.calls
                .lock()
                .unwrap()
                .push((peer.to_string(), commands.len(), timeout));
            Ok(commands
                .into_keys()
                .map(|hostname| {
                    (
                        hostname,
                        vec![CommandResult {
                            output: String::new(),
                            status: "success".to_string(),
                            command: "show version".to_string(),
                            capabilities: None,
                            uuid: uuid.to_string(),
                        }],
                    )
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn bulk_run_shards_oversized_requests_to_peers_with_overhead_subtracted() {
        let vendor_registry = StdArc::new(VendorRegistry::from_profiles(VendorRegistry::default_table().unwrap()));
        let snapshot = StdArc::new(DeviceSnapshot::new(StdArc::new(StaticInventory::new(vec![])), None));
        let calls = StdArc::new(std::sync::Mutex::new(Vec::new()));
        let peer = StdArc::new(RecordingPeer { calls: calls.clone() });

        let dispatcher = Dispatcher::new(
            vendor_registry,
            snapshot,
            StdArc::new(SessionRegistry::new()),
            StdArc::new(ScriptedTransportFactory::new()),
            Some(peer),
            DispatcherConfig {
                lb_threshold: 2,
                remote_call_overhead: Duration::from_secs(1),
                max_active_device_units: 16,
                transient_idle_timeout: Duration::from_secs(60),
            },
        );

        let mut commands = HashMap::new();
        for i in 0..5 {
            commands.insert(format!("r{}", i), vec!["show version".to_string()]);
        }

        let responses = dispatcher
            .bulk_run(commands, Duration::from_secs(5), Duration::from_secs(2), "req-5")
            .await
            .unwrap();

        assert_eq!(responses.len(), 5);
        let calls = calls.lock().unwrap();
        assert!(calls.len() >= 1, "at least one chunk forwarded to the peer");
        for (peer_addr, chunk_len, forwarded_timeout) in calls.iter() {
            assert_eq!(peer_addr, "peer-a");
            assert!(*chunk_len <= 2, "each chunk stays within lb_threshold");
            assert_eq!(*forwarded_timeout, Duration::from_secs(4));
        }
    }

    #[tokio::test]
    async fn open_run_close_session_enforce_owner_affinity() {
        let (dispatcher, _factory) = dispatcher_with_devices(vec![
            (DeviceRecord::new("r1", "cisco_ios"), "203.0.113.3"),
        ])
        .await;
        let device = DeviceRecord {
            preferred_ips: vec!["203.0.113.3".to_string()],
            ..DeviceRecord::new("r1", "cisco_ios")
        };

        let id = dispatcher
            .open_session(&device, Duration::from_secs(2), Duration::from_secs(60), owner())
            .await
            .unwrap();

        let other = Owner {
            client_ip: owner().client_ip,
            client_port: owner().client_port + 1,
        };
        let err = dispatcher
            .run_session(id, other, "show version", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::FcrErrorCode::Lookup);

        let result = dispatcher
            .run_session(id, owner(), "show version", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result.status, "success");

        dispatcher.close_session(id, owner()).await.unwrap();
        let err = dispatcher.close_session(id, owner()).await.unwrap_err();
        assert_eq!(err.code(), crate::error::FcrErrorCode::Lookup);
    }
}
