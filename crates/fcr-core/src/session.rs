//! Session: the state machine wrapping one `Transport` + `PromptMatcher`
//! pair — connect, run setup commands, then serialize `run`/`close` calls
//! behind a per-session async mutex, the way this crate's per-session guard
//! stands in for the single-threaded reactor's free FIFO ordering.

use crate::device::DeviceRecord;
use crate::error::{FcrError, FcrErrorCode, Result};
use crate::resolver::{DeviceResolver, ResolvedTarget};
use crate::transport::{Transport, TransportFactory};
use crate::vendor::{SessionKind, VendorRegistry};
use crate::prompt_matcher::{MatchOutcome, PromptMatcher, Terminator};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// The session lifecycle, mirroring the diagram this crate's Session module
/// is built against: CONNECTING -> SETUP -> READY <-> RUNNING -> FAILED/CLOSED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Setup,
    Ready,
    Running,
    Closing,
    Closed,
    Failed,
}

/// One command's result, returned from `run`/`run_raw` and wrapped per-device
/// in bulk responses.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub output: String,
    pub status: String,
    pub command: String,
    pub capabilities: Option<String>,
    pub uuid: String,
}

impl CommandResult {
    fn success(output: String, command: String, capabilities: Option<String>, uuid: String) -> Self {
        Self {
            output,
            status: "success".to_string(),
            command,
            capabilities,
            uuid,
        }
    }

    fn failure(output: String, command: String, message: String, uuid: String) -> Self {
        Self {
            output,
            status: message,
            command,
            capabilities: None,
            uuid,
        }
    }
}

/// Owner tuple used for the "persistent session" API family's connection
/// affinity guarantee; `None` identifies the dispatcher's own anonymous
/// single-shot sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Owner {
    pub client_ip: std::net::IpAddr,
    pub client_port: u16,
}

struct SessionInner {
    state: SessionState,
    transport: Arc<dyn Transport>,
    target: ResolvedTarget,
    device_name: String,
    hostname: String,
    last_activity: Instant,
    capabilities: Option<String>,
}

/// A live device session. Cheap to clone (`Arc` wrapper); every mutating
/// operation acquires `guard`, which serializes state transitions the way a
/// single-threaded reactor would for free. `transport` is a second handle to
/// the same connection held *outside* the guard, so a stuck in-flight
/// command can still be force-closed to reclaim the socket (see
/// `force_close`) without waiting on the guard it is stuck holding.
#[derive(Clone)]
pub struct Session {
    pub id: u64,
    pub device_name: String,
    pub hostname: String,
    pub uuid: String,
    pub owner: Option<Owner>,
    pub idle_timeout: Duration,
    pub raw: bool,
    guard: Arc<Mutex<SessionInner>>,
    transport: Arc<dyn Transport>,
}

impl Session {
    /// `open`: resolve the device, connect (trying backup addresses if
    /// `failover_to_backup_ips` is set), and for `raw == false` run the
    /// vendor's setup sequence to completion before returning READY.
    #[instrument(skip(registry, device, owner, connector), fields(device = %device.hostname))]
    pub async fn open(
        registry: &VendorRegistry,
        device: &DeviceRecord,
        open_timeout: Duration,
        idle_timeout: Duration,
        raw: bool,
        owner: Option<Owner>,
        connector: &dyn TransportFactory,
    ) -> Result<Self> {
        let target = DeviceResolver::new(registry).resolve(device)?;

        let connect_fut = connector.connect(&target);
        let transport: Arc<dyn Transport> = Arc::from(
            tokio_timeout(open_timeout, connect_fut)
                .await
                .map_err(|_| {
                    FcrError::session(
                        FcrErrorCode::ConnectionTimeoutError,
                        format!("connect to {} timed out after {:?}", device.hostname, open_timeout),
                    )
                })??,
        );

        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let uuid = Uuid::new_v4().to_string();

        let mut inner = SessionInner {
            state: SessionState::Connecting,
            transport: transport.clone(),
            target: target.clone(),
            device_name: device.hostname.clone(),
            hostname: device.hostname.clone(),
            last_activity: Instant::now(),
            capabilities: None,
        };

        // A NETCONF peer sends its hello banner unprompted as soon as the
        // subsystem/exec channel opens, framed by its own `]]>]]>` — it must
        // be drained and captured here, before any command is sent, or it
        // would be read as (and corrupt) the first command's own response.
        if target.session_kind == SessionKind::SshNetconf {
            drain_netconf_hello(&mut inner, open_timeout).await?;
        }

        if !raw {
            inner.state = SessionState::Setup;
            let mut commands: Vec<String> = device.pre_setup_commands.clone();
            commands.extend(target.vendor.cli_setup.iter().cloned());
            for command in commands {
                run_one(&mut inner, &command, None, open_timeout, &uuid).await.map_err(|e| {
                    FcrError::session(
                        e.code(),
                        format!("setup command '{}' failed: {}", command, e),
                    )
                })?;
            }
        }

        inner.state = SessionState::Ready;
        info!(session_id = id, device = %device.hostname, "session ready");

        Ok(Self {
            id,
            device_name: device.hostname.clone(),
            hostname: device.hostname.clone(),
            uuid,
            owner,
            idle_timeout,
            raw,
            guard: Arc::new(Mutex::new(inner)),
            transport,
        })
    }

    /// `run`: serialized by `guard`. Splits configlets on LF, sends each
    /// sub-command, and stops at the first sub-command failure.
    #[instrument(skip(self, prompt_override), fields(session_id = self.id))]
    pub async fn run(
        &self,
        command: &str,
        timeout: Duration,
        prompt_override: Option<&str>,
    ) -> Result<CommandResult> {
        let mut inner = self.guard.lock().await;

        if inner.state != SessionState::Ready {
            return Err(FcrError::session(
                FcrErrorCode::Runtime,
                format!("session {} is not ready (state = {:?})", self.id, inner.state),
            ));
        }

        inner.state = SessionState::Running;
        let lines: Vec<&str> = command.split('\n').filter(|l| !l.is_empty()).collect();
        let lines = if lines.is_empty() { vec![command] } else { lines };

        let mut combined_output = String::new();
        let mut failure: Option<FcrError> = None;

        for line in &lines {
            match run_one(&mut inner, line, prompt_override, timeout, &self.uuid).await {
                Ok(output) => {
                    if !combined_output.is_empty() {
                        combined_output.push('\n');
                    }
                    combined_output.push_str(&output);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        inner.last_activity = Instant::now();

        match failure {
            None => {
                inner.state = SessionState::Ready;
                crate::counters::incr(&crate::counters::vendor_counter(&inner.target.vendor.name));
                Ok(CommandResult::success(
                    combined_output,
                    command.to_string(),
                    inner.capabilities.clone(),
                    self.uuid.clone(),
                ))
            }
            Some(e) => {
                inner.state = SessionState::Failed;
                crate::counters::incr(&crate::counters::error_counter(e.code()));
                warn!(session_id = self.id, error = %e, "command failed, session marked FAILED");
                Ok(CommandResult::failure(
                    combined_output,
                    command.to_string(),
                    e.status_message(),
                    self.uuid.clone(),
                ))
            }
        }
    }

    pub async fn is_failed(&self) -> bool {
        self.guard.lock().await.state == SessionState::Failed
    }

    pub async fn last_activity(&self) -> Instant {
        self.guard.lock().await.last_activity
    }

    /// Non-blocking read of `last_activity`, for the Registry's idle sweep:
    /// if the guard is currently held (a command is RUNNING), the session is
    /// by definition not idle, so the sweep simply skips it this round
    /// rather than waiting on the guard.
    pub fn try_last_activity(&self) -> Option<Instant> {
        self.guard.try_lock().ok().map(|inner| inner.last_activity)
    }

    /// Idempotent: the first call sends a vendor disconnect and closes the
    /// transport; any later call force-closes without error.
    #[instrument(skip(self), fields(session_id = self.id))]
    pub async fn close(&self) -> Result<()> {
        let mut inner = self.guard.lock().await;
        if inner.state == SessionState::Closed {
            return Ok(());
        }
        inner.state = SessionState::Closing;

        if inner.target.session_kind == SessionKind::SshCli {
            let _ = inner.transport.send(b"exit\n".to_vec()).await;
        }
        let result = inner.transport.close().await;
        inner.state = SessionState::Closed;
        if let Err(e) = &result {
            warn!(session_id = self.id, error = %e, "transport close reported an error, session forced closed anyway");
        }
        Ok(())
    }

    /// Closes the underlying transport directly, bypassing the per-command
    /// guard. Used by the Dispatcher/Registry to reclaim a socket from a
    /// session whose `run`/`close` call is stuck past its deadline (see §5
    /// Cancellation) — the next `recv()` inside the stuck call then observes
    /// the closed channel and returns a `STREAM_READER` failure on its own.
    pub async fn force_close(&self) {
        let _ = self.transport.close().await;
    }
}

/// Send one sub-command (after an optional clear-command) and read until a
/// prompt matches or `timeout` elapses. Used both by setup and by `run`.
async fn run_one(
    inner: &mut SessionInner,
    command: &str,
    prompt_override: Option<&str>,
    timeout: Duration,
    uuid: &str,
) -> Result<String> {
    // The clear-command clears residual CLI input ahead of a command; a
    // NETCONF subsystem/exec channel has no such residual-input concept and
    // sending it would inject a stray byte into the RFC-4742 XML stream.
    if inner.target.session_kind != SessionKind::SshNetconf && !inner.target.clear_command.is_empty()
    {
        inner.transport.send(inner.target.clear_command.clone()).await?;
    }

    let mut payload = command.as_bytes().to_vec();
    payload.push(b'\n');
    inner.transport.send(payload).await?;

    let terminator = if inner.target.session_kind == SessionKind::SshNetconf {
        Terminator::NetconfEom
    } else if let Some(pattern) = prompt_override {
        Terminator::Patterns(vec![crate::vendor::PromptPattern::compile(pattern)?])
    } else if let Some(pattern) = inner.target.command_prompts.get(command) {
        Terminator::Patterns(vec![crate::vendor::PromptPattern::compile(pattern)?])
    } else {
        let mut patterns = inner.target.vendor.prompt_regex.clone();
        patterns.extend(inner.target.vendor.shell_prompts.iter().cloned());
        Terminator::Patterns(patterns)
    };

    let mut matcher = PromptMatcher::new(terminator, timeout);
    let deadline = Instant::now() + timeout;

    loop {
        if Instant::now() >= deadline {
            return Err(FcrError::session(
                FcrErrorCode::CommandExecutionTimeout,
                format!("command '{}' timed out after {:?}", command, timeout),
            ));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let chunk = match tokio_timeout(remaining, inner.transport.recv()).await {
            Ok(Ok(chunk)) => chunk,
            Ok(Err(e)) => return Err(FcrError::stream_reader(format!("read failed: {}", e))),
            Err(_) => {
                return Err(FcrError::session(
                    FcrErrorCode::CommandExecutionTimeout,
                    format!("command '{}' timed out after {:?}", command, timeout),
                ))
            }
        };

        if chunk.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
            continue;
        }

        if matcher.feed(&chunk) == MatchOutcome::Complete {
            let output = matcher.output();
            debug!(session_uuid = uuid, command, "command completed");
            return vendor_error_check(&inner.target.vendor, command, output);
        }
    }
}

/// Reads until the NETCONF hello's own `]]>]]>` framing completes, storing
/// the banner as the session's `capabilities` — run once at `open()`, before
/// any command is sent, so the hello is never mistaken for a command reply.
async fn drain_netconf_hello(inner: &mut SessionInner, timeout: Duration) -> Result<()> {
    let mut matcher = PromptMatcher::new(Terminator::NetconfEom, timeout);
    let deadline = Instant::now() + timeout;

    loop {
        if Instant::now() >= deadline {
            return Err(FcrError::connection_timeout(
                "NETCONF hello not received before open_timeout elapsed",
            ));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let chunk = match tokio_timeout(remaining, inner.transport.recv()).await {
            Ok(Ok(chunk)) => chunk,
            Ok(Err(e)) => {
                return Err(FcrError::stream_reader(format!(
                    "read failed while waiting for NETCONF hello: {}",
                    e
                )))
            }
            Err(_) => {
                return Err(FcrError::connection_timeout(
                    "NETCONF hello not received before open_timeout elapsed",
                ))
            }
        };

        if chunk.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
            continue;
        }

        if matcher.feed(&chunk) == MatchOutcome::Complete {
            inner.capabilities = inner
                .transport
                .capabilities()
                .await
                .or_else(|| Some(matcher.output()));
            return Ok(());
        }
    }
}

fn vendor_error_check(
    vendor: &crate::vendor::VendorProfile,
    command: &str,
    output: String,
) -> Result<String> {
    for pattern in &vendor.error_patterns {
        if pattern.is_match(&output) {
            return Err(FcrError::device_error(format!(
                "command '{}' reported a device error: {}",
                command, output
            )));
        }
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceRecord;
    use crate::transport::testing::ScriptedTransport;
    use crate::vendor::VendorRegistry;

    fn registry() -> VendorRegistry {
        VendorRegistry::from_profiles(VendorRegistry::default_table().unwrap())
    }

    fn ready_inner(vendor_name: &str) -> SessionInner {
        let registry = registry();
        let vendor = registry.get(vendor_name).unwrap().clone();
        let clear_command = vendor.clear_command.clone();
        let target = ResolvedTarget {
            addresses: vec!["192.0.2.1".to_string()],
            port: 22,
            username: "admin".to_string(),
            password: "secret".to_string(),
            vendor,
            session_kind: SessionKind::SshCli,
            session_data: None,
            command_prompts: std::collections::HashMap::new(),
            clear_command,
        };
        SessionInner {
            state: SessionState::Ready,
            transport: Arc::new(ScriptedTransport::new()),
            target,
            device_name: "r1".to_string(),
            hostname: "r1".to_string(),
            last_activity: Instant::now(),
            capabilities: None,
        }
    }

    fn session_from_inner(inner: SessionInner) -> Session {
        let transport = inner.transport.clone();
        Session {
            id: 1,
            device_name: inner.device_name.clone(),
            hostname: inner.hostname.clone(),
            uuid: Uuid::new_v4().to_string(),
            owner: None,
            idle_timeout: Duration::from_secs(60),
            raw: false,
            guard: Arc::new(Mutex::new(inner)),
            transport,
        }
    }

    #[tokio::test]
    async fn run_strips_echo_and_prompt_on_success() {
        let mut inner = ready_inner("cisco_ios");
        // A real device echoes the typed command back over the pty before
        // its own output, per E1.
        let transport = ScriptedTransport::new()
            .with_response("show version", b"show version\r\nCisco IOS Software, v1\r\nr1#".to_vec());
        inner.transport = Arc::new(transport);
        let session = session_from_inner(inner);

        let result = session
            .run("show version", Duration::from_secs(2), None)
            .await
            .unwrap();
        assert_eq!(result.status, "success");
        assert_eq!(result.output, "Cisco IOS Software, v1");
    }

    #[tokio::test]
    async fn run_times_out_on_silent_device() {
        let mut inner = ready_inner("cisco_ios");
        inner.transport = Arc::new(ScriptedTransport::new().with_delay(Duration::from_secs(10)));
        let session = session_from_inner(inner);

        let result = session
            .run("slow", Duration::from_millis(50), None)
            .await
            .unwrap();
        assert_ne!(result.status, "success");
        assert!(result.status.contains("timed out") || result.status.contains("Timeout"));
    }

    #[tokio::test]
    async fn run_rejects_when_not_ready() {
        let mut inner = ready_inner("cisco_ios");
        inner.state = SessionState::Running;
        let session = session_from_inner(inner);

        let err = session.run("x", Duration::from_secs(1), None).await.unwrap_err();
        assert_eq!(err.code(), FcrErrorCode::Runtime);
    }

    #[tokio::test]
    async fn vendor_error_pattern_marks_command_execution_as_failed() {
        let mut inner = ready_inner("cisco_ios");
        let transport = ScriptedTransport::new()
            .with_response("bogus", b"bogus\r\n% Invalid input detected\r\nr1#".to_vec());
        inner.transport = Arc::new(transport);
        let session = session_from_inner(inner);

        let result = session.run("bogus", Duration::from_secs(2), None).await.unwrap();
        assert_ne!(result.status, "success");
    }

    #[tokio::test]
    async fn command_prompt_override_takes_precedence_over_vendor_default() {
        let mut inner = ready_inner("cisco_ios");
        inner
            .target
            .command_prompts
            .insert("reload".to_string(), r"Proceed with reload\? \[confirm\]".to_string());
        let transport = ScriptedTransport::new().with_response(
            "reload",
            b"reload\r\nProceed with reload? [confirm]".to_vec(),
        );
        inner.transport = Arc::new(transport);
        let session = session_from_inner(inner);

        let result = session
            .run("reload", Duration::from_secs(2), None)
            .await
            .unwrap();
        assert_eq!(result.status, "success");
        assert_eq!(result.output, "");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let inner = ready_inner("cisco_ios");
        let session = session_from_inner(inner);
        session.close().await.unwrap();
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn open_fails_with_permission_error_on_auth_rejection() {
        use crate::transport::testing::ScriptedTransportFactory;

        let registry = registry();
        let mut device = DeviceRecord::new("r1", "cisco_ios");
        device.preferred_ips = vec!["203.0.113.50".to_string()];

        let factory = ScriptedTransportFactory::new();
        factory.register_fail_auth("203.0.113.50");

        let err = Session::open(
            &registry,
            &device,
            Duration::from_secs(2),
            Duration::from_secs(60),
            false,
            None,
            &factory,
        )
        .await
        .unwrap_err();

        assert_eq!(err.code(), FcrErrorCode::Permission);
    }

    #[tokio::test]
    async fn netconf_session_captures_hello_and_strips_eom_framing() {
        use crate::transport::testing::ScriptedTransportFactory;

        let mut table = std::collections::HashMap::new();
        table.insert(
            "junos_netconf".to_string(),
            crate::vendor::VendorProfile::builder("junos_netconf")
                .session_kind(SessionKind::SshNetconf)
                .prompt(r"unused>")
                .build()
                .unwrap(),
        );
        let registry = VendorRegistry::from_profiles(table);

        let mut device = DeviceRecord::new("nc1", "junos_netconf");
        device.preferred_ips = vec!["203.0.113.9".to_string()];

        let hello: &[u8] =
            b"<hello xmlns=\"urn:ietf:params:xml:ns:netconf:base:1.0\"><capabilities/></hello>]]>]]>";
        let reply: &[u8] = b"<rpc-reply><data>ok</data></rpc-reply>]]>]]>";

        let transport = ScriptedTransport::new().netconf();
        transport.push_raw(hello.to_vec());
        transport.push_raw(reply.to_vec());

        let factory = ScriptedTransportFactory::new();
        factory.register("203.0.113.9", Arc::new(transport));

        let session = Session::open(
            &registry,
            &device,
            Duration::from_secs(2),
            Duration::from_secs(60),
            false,
            None,
            &factory,
        )
        .await
        .unwrap();

        let result = session
            .run("get-config", Duration::from_secs(2), None)
            .await
            .unwrap();

        assert_eq!(result.status, "success");
        assert_eq!(result.output, "<rpc-reply><data>ok</data></rpc-reply>");
        assert_eq!(
            result.capabilities.as_deref(),
            Some(String::from_utf8_lossy(hello).as_ref())
        );
    }
}
