//! Transport: establishes an SSH connection, opens a shell or NETCONF
//! subsystem channel, and streams bytes.
//!
//! `ssh2` is blocking, like the rest of this workspace's SSH plumbing; the
//! cooperative-concurrency model is satisfied by pushing every blocking
//! `ssh2` call onto `tokio::task::spawn_blocking` and exposing `send`/
//! `recv`/`close` as thin async methods around those blocking calls, rather
//! than leaving the blocking call inside a bare `async {}` block the way an
//! earlier pass at this pattern in this codebase did.

use crate::device::SessionData;
use crate::error::{FcrError, Result};
use async_trait::async_trait;
use ssh2::Session as SshSession;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::task;
use tracing::{debug, instrument, warn};

/// A live byte-stream connection to one device. `send`/`recv`/`close` never
/// block the calling task's executor thread. `Sync` lets a Session keep a
/// second `Arc` handle outside its per-command guard so a stuck command can
/// still be force-closed to reclaim the socket (see `Session::force_close`).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, bytes: Vec<u8>) -> Result<()>;

    /// Read whatever is currently available; returns an empty vec if
    /// nothing has arrived within the transport's internal poll window.
    async fn recv(&self) -> Result<Vec<u8>>;

    async fn close(&self) -> Result<()>;

    /// The NETCONF hello banner captured from the first inbound chunk, if
    /// this transport is a NETCONF subsystem/exec channel that has received
    /// one. CLI transports never have capabilities; the default covers them.
    async fn capabilities(&self) -> Option<String> {
        None
    }
}

/// How a Session obtains its `Transport`. The default implementation opens a
/// real SSH connection; tests substitute `testing::ScriptedTransportFactory`
/// to exercise the Session/Registry/Dispatcher state machines without a
/// socket.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, target: &crate::resolver::ResolvedTarget) -> Result<Box<dyn Transport>>;
}

/// Opens a real `ssh2` connection, picking the CLI or NETCONF variant by the
/// resolved target's session kind.
pub struct DefaultTransportFactory;

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn connect(&self, target: &crate::resolver::ResolvedTarget) -> Result<Box<dyn Transport>> {
        match target.session_kind {
            crate::vendor::SessionKind::SshCli => {
                let transport = SshCliTransport::connect(
                    target.addresses.clone(),
                    target.port,
                    target.username.clone(),
                    target.password.clone(),
                    Duration::from_secs(target.vendor.default_timeout_secs),
                )
                .await?;
                Ok(Box::new(transport))
            }
            crate::vendor::SessionKind::SshNetconf => {
                let transport = SshNetconfTransport::connect(
                    target.addresses.clone(),
                    target.port,
                    target.username.clone(),
                    target.password.clone(),
                    Duration::from_secs(target.vendor.default_timeout_secs),
                    target.session_data.clone(),
                )
                .await?;
                Ok(Box::new(transport))
            }
        }
    }
}

struct SshState {
    channel: ssh2::Channel,
    #[allow(dead_code)] // kept alive for the lifetime of the channel
    session: SshSession,
}

// ssh2's types are safe to move across threads as long as access is
// serialized, which the Mutex below guarantees.
unsafe impl Send for SshState {}

/// ssh-cli: an interactive shell channel.
pub struct SshCliTransport {
    state: Arc<StdMutex<SshState>>,
}

/// ssh-netconf: an SSH subsystem or exec-command channel framed by the
/// RFC 4742 `]]>]]>` terminator. The first inbound chunk is captured as the
/// NETCONF hello and exposed via `capabilities()`.
pub struct SshNetconfTransport {
    state: Arc<StdMutex<SshState>>,
    capabilities: Arc<StdMutex<Option<String>>>,
}

fn open_session(
    address: &str,
    port: u16,
    username: &str,
    password: &str,
    connect_timeout: Duration,
) -> Result<SshSession> {
    let socket_addr = (address, port)
        .to_socket_addrs()
        .map_err(|e| FcrError::connection(format!("could not resolve {}:{}: {}", address, port, e)))?
        .next()
        .ok_or_else(|| FcrError::connection(format!("no addresses for {}:{}", address, port)))?;

    let tcp = TcpStream::connect_timeout(&socket_addr, connect_timeout).map_err(|e| {
        if e.kind() == std::io::ErrorKind::TimedOut {
            FcrError::connection_timeout(format!("tcp connect to {} timed out: {}", socket_addr, e))
        } else {
            FcrError::connection(format!("tcp connect to {} failed: {}", socket_addr, e))
        }
    })?;
    tcp.set_read_timeout(Some(Duration::from_millis(200))).ok();
    tcp.set_write_timeout(Some(connect_timeout)).ok();

    let mut session = SshSession::new().map_err(FcrError::from)?;
    session.set_tcp_stream(tcp);
    session.set_timeout(connect_timeout.as_millis() as u32);
    session
        .handshake()
        .map_err(|e| FcrError::connection_timeout(format!("ssh handshake failed: {}", e)))?;

    session
        .userauth_password(username, password)
        .map_err(|e| FcrError::permission(format!("authentication failed for {}: {}", username, e)))?;

    if !session.authenticated() {
        return Err(FcrError::permission("authentication rejected by device"));
    }

    // Blocking mode with a short per-call timeout: a read without data
    // returns a TimedOut/WouldBlock error rather than hanging the blocking
    // worker thread forever, which is how recv() implements "may be empty".
    session.set_blocking(true);
    session.set_timeout(200);

    Ok(session)
}

impl SshCliTransport {
    /// Try each address in order (failover), opening an interactive shell
    /// channel on the first one that accepts a connection and authenticates.
    #[instrument(skip(password))]
    pub async fn connect(
        addresses: Vec<String>,
        port: u16,
        username: String,
        password: String,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let state = task::spawn_blocking(move || -> Result<SshState> {
            let mut last_err = None;
            for address in &addresses {
                match (|| -> Result<SshState> {
                    let session = open_session(address, port, &username, &password, connect_timeout)?;
                    let mut channel = session
                        .channel_session()
                        .map_err(|e| FcrError::connection(format!("channel open failed: {}", e)))?;
                    channel.request_pty("vt100", None, None).ok();
                    channel
                        .shell()
                        .map_err(|e| FcrError::connection(format!("shell request failed: {}", e)))?;
                    Ok(SshState { channel, session })
                })() {
                    Ok(state) => return Ok(state),
                    Err(e) => {
                        warn!(address = %address, error = %e, "failed to connect, trying next address");
                        last_err = Some(e);
                    }
                }
            }
            Err(last_err.unwrap_or_else(|| FcrError::connection("no addresses to try")))
        })
        .await
        .map_err(|e| FcrError::connection(format!("connect task panicked: {}", e)))??;

        Ok(Self {
            state: Arc::new(StdMutex::new(state)),
        })
    }
}

#[async_trait]
impl Transport for SshCliTransport {
    async fn send(&self, bytes: Vec<u8>) -> Result<()> {
        let state = self.state.clone();
        task::spawn_blocking(move || {
            let mut guard = state.lock().unwrap();
            guard
                .channel
                .write_all(&bytes)
                .map_err(|e| FcrError::connection(format!("write failed: {}", e)))?;
            guard
                .channel
                .flush()
                .map_err(|e| FcrError::connection(format!("flush failed: {}", e)))
        })
        .await
        .map_err(|e| FcrError::connection(format!("send task panicked: {}", e)))?
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        let state = self.state.clone();
        task::spawn_blocking(move || {
            let mut guard = state.lock().unwrap();
            let mut buf = vec![0u8; 16384];
            match guard.channel.read(&mut buf) {
                Ok(0) if guard.channel.eof() => {
                    Err(FcrError::stream_reader("channel closed by remote device"))
                }
                Ok(n) => Ok(buf[..n].to_vec()),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    Ok(Vec::new())
                }
                Err(e) => Err(FcrError::stream_reader(format!("read failed: {}", e))),
            }
        })
        .await
        .map_err(|e| FcrError::connection(format!("recv task panicked: {}", e)))?
    }

    async fn close(&self) -> Result<()> {
        let state = self.state.clone();
        task::spawn_blocking(move || {
            let mut guard = state.lock().unwrap();
            let _ = guard.channel.send_eof();
            let _ = guard.channel.close();
            let _ = guard.channel.wait_close();
            Ok(())
        })
        .await
        .map_err(|e| FcrError::connection(format!("close task panicked: {}", e)))?
    }
}

impl SshNetconfTransport {
    #[instrument(skip(password))]
    pub async fn connect(
        addresses: Vec<String>,
        port: u16,
        username: String,
        password: String,
        connect_timeout: Duration,
        session_data: Option<SessionData>,
    ) -> Result<Self> {
        let state = task::spawn_blocking(move || -> Result<SshState> {
            let mut last_err = None;
            for address in &addresses {
                match (|| -> Result<SshState> {
                    let session = open_session(address, port, &username, &password, connect_timeout)?;
                    let mut channel = session
                        .channel_session()
                        .map_err(|e| FcrError::connection(format!("channel open failed: {}", e)))?;
                    match &session_data {
                        Some(SessionData::Subsystem(name)) => {
                            channel.subsystem(name).map_err(|e| {
                                FcrError::connection(format!("subsystem '{}' request failed: {}", name, e))
                            })?;
                        }
                        Some(SessionData::ExecCommand(cmd)) => {
                            channel.exec(cmd).map_err(|e| {
                                FcrError::connection(format!("exec '{}' failed: {}", cmd, e))
                            })?;
                        }
                        None => {
                            channel.subsystem("netconf").map_err(|e| {
                                FcrError::connection(format!("default netconf subsystem failed: {}", e))
                            })?;
                        }
                    }
                    Ok(SshState { channel, session })
                })() {
                    Ok(state) => return Ok(state),
                    Err(e) => last_err = Some(e),
                }
            }
            Err(last_err.unwrap_or_else(|| FcrError::connection("no addresses to try")))
        })
        .await
        .map_err(|e| FcrError::connection(format!("connect task panicked: {}", e)))??;

        Ok(Self {
            state: Arc::new(StdMutex::new(state)),
            capabilities: Arc::new(StdMutex::new(None)),
        })
    }

    pub fn capabilities(&self) -> Option<String> {
        self.capabilities.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for SshNetconfTransport {
    async fn send(&self, bytes: Vec<u8>) -> Result<()> {
        let state = self.state.clone();
        task::spawn_blocking(move || {
            let mut guard = state.lock().unwrap();
            guard
                .channel
                .write_all(&bytes)
                .map_err(|e| FcrError::connection(format!("write failed: {}", e)))?;
            guard
                .channel
                .flush()
                .map_err(|e| FcrError::connection(format!("flush failed: {}", e)))
        })
        .await
        .map_err(|e| FcrError::connection(format!("send task panicked: {}", e)))?
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        let state = self.state.clone();
        let chunk = task::spawn_blocking(move || -> Result<Vec<u8>> {
            let mut guard = state.lock().unwrap();
            let mut buf = vec![0u8; 16384];
            match guard.channel.read(&mut buf) {
                Ok(0) if guard.channel.eof() => {
                    Err(FcrError::stream_reader("channel closed by remote device"))
                }
                Ok(n) => Ok(buf[..n].to_vec()),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    Ok(Vec::new())
                }
                Err(e) => Err(FcrError::stream_reader(format!("read failed: {}", e))),
            }
        })
        .await
        .map_err(|e| FcrError::connection(format!("recv task panicked: {}", e)))??;

        let mut captured = self.capabilities.lock().unwrap();
        if captured.is_none() && !chunk.is_empty() {
            debug!("captured NETCONF hello as capabilities");
            *captured = Some(String::from_utf8_lossy(&chunk).to_string());
        }
        Ok(chunk)
    }

    async fn close(&self) -> Result<()> {
        let state = self.state.clone();
        task::spawn_blocking(move || {
            let mut guard = state.lock().unwrap();
            let _ = guard.channel.send_eof();
            let _ = guard.channel.close();
            let _ = guard.channel.wait_close();
            Ok(())
        })
        .await
        .map_err(|e| FcrError::connection(format!("close task panicked: {}", e)))?
    }

    async fn capabilities(&self) -> Option<String> {
        self.capabilities.lock().unwrap().clone()
    }
}

/// In-memory transport doubles for exercising the Session/Dispatcher state
/// machines without a real SSH endpoint, in the spirit of this workspace's
/// `MockNetworkDevice` test fixture but without opening a socket.
#[cfg(any(test, feature = "test-util"))]
pub mod testing {
    use super::*;
    use tokio::sync::Mutex as AsyncMutex;

    /// A scripted device: replies to each sent line by looking it up
    /// (trimmed) in `responses`, falling back to `default_response`. An
    /// optional artificial delay simulates a slow device for timeout tests.
    pub struct ScriptedTransport {
        inner: AsyncMutex<ScriptedState>,
    }

    struct ScriptedState {
        responses: std::collections::HashMap<String, Vec<u8>>,
        default_response: Vec<u8>,
        pending: std::collections::VecDeque<Vec<u8>>,
        delay: Option<Duration>,
        sent: Vec<String>,
        unreachable: bool,
        capture_hello: bool,
        hello: Option<String>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self {
                inner: AsyncMutex::new(ScriptedState {
                    responses: std::collections::HashMap::new(),
                    default_response: Vec::new(),
                    pending: std::collections::VecDeque::new(),
                    delay: None,
                    sent: Vec::new(),
                    unreachable: false,
                    capture_hello: false,
                    hello: None,
                }),
            }
        }

        /// Marks this scripted device as a NETCONF endpoint: the first
        /// non-empty chunk handed back by `recv()` is captured and exposed
        /// via `capabilities()`, mirroring `SshNetconfTransport` capturing
        /// the real hello banner.
        pub fn netconf(self) -> Self {
            self.inner.try_lock().unwrap().capture_hello = true;
            self
        }

        pub fn unreachable() -> Self {
            let t = Self::new();
            t.inner.try_lock().unwrap().unreachable = true;
            t
        }

        pub fn with_response(self, command: impl Into<String>, response: impl Into<Vec<u8>>) -> Self {
            self.inner
                .try_lock()
                .unwrap()
                .responses
                .insert(command.into(), response.into());
            self
        }

        /// Sets the reply sent back for any command with no entry in
        /// `responses` — including the vendor's own `cli_setup` commands, so
        /// a test that only cares about reaching READY can prime a single
        /// prompt (e.g. `r1#`) instead of listing every setup command.
        pub fn with_default_response(self, response: impl Into<Vec<u8>>) -> Self {
            self.inner.try_lock().unwrap().default_response = response.into();
            self
        }

        pub fn with_delay(self, delay: Duration) -> Self {
            self.inner.try_lock().unwrap().delay = Some(delay);
            self
        }

        /// Queue raw bytes to be handed back on the next `recv()` regardless
        /// of what was sent (used to prime setup-command banners or a
        /// NETCONF hello).
        pub fn push_raw(&self, bytes: impl Into<Vec<u8>>) {
            self.inner.try_lock().unwrap().pending.push_back(bytes.into());
        }

        pub async fn sent_commands(&self) -> Vec<String> {
            self.inner.lock().await.sent.clone()
        }
    }

    impl Default for ScriptedTransport {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, bytes: Vec<u8>) -> Result<()> {
            let mut state = self.inner.lock().await;
            if state.unreachable {
                return Err(FcrError::connection("device unreachable"));
            }
            let line = String::from_utf8_lossy(&bytes).trim().to_string();
            if !line.is_empty() {
                let response = state
                    .responses
                    .get(&line)
                    .cloned()
                    .unwrap_or_else(|| state.default_response.clone());
                state.sent.push(line);
                state.pending.push_back(response);
            }
            Ok(())
        }

        async fn recv(&self) -> Result<Vec<u8>> {
            let delay = {
                let state = self.inner.lock().await;
                if state.unreachable {
                    return Err(FcrError::connection("device unreachable"));
                }
                state.delay
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let mut state = self.inner.lock().await;
            let chunk = state.pending.pop_front().unwrap_or_default();
            if state.capture_hello && state.hello.is_none() && !chunk.is_empty() {
                state.hello = Some(String::from_utf8_lossy(&chunk).to_string());
            }
            Ok(chunk)
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }

        async fn capabilities(&self) -> Option<String> {
            self.inner.lock().await.hello.clone()
        }
    }

    /// Wraps a shared `Arc<dyn Transport>` so a `ScriptedTransportFactory` can
    /// hand the same in-memory device out to a Session while still letting
    /// the test hold its own reference (to prime responses or inspect
    /// `sent_commands`) after `connect()` returns.
    pub struct SharedTransport(pub Arc<dyn Transport>);

    #[async_trait]
    impl Transport for SharedTransport {
        async fn send(&self, bytes: Vec<u8>) -> Result<()> {
            self.0.send(bytes).await
        }

        async fn recv(&self) -> Result<Vec<u8>> {
            self.0.recv().await
        }

        async fn close(&self) -> Result<()> {
            self.0.close().await
        }

        async fn capabilities(&self) -> Option<String> {
            self.0.capabilities().await
        }
    }

    /// A `TransportFactory` backed by fake devices registered by address, in
    /// the spirit of this workspace's `MockDevice` test fixture but wired
    /// through the async `Transport`/`TransportFactory` seam instead of a
    /// blocking device trait.
    #[derive(Default)]
    pub struct ScriptedTransportFactory {
        devices: std::sync::Mutex<std::collections::HashMap<String, Arc<dyn Transport>>>,
        fail_auth: std::sync::Mutex<std::collections::HashSet<String>>,
    }

    impl ScriptedTransportFactory {
        pub fn new() -> Self {
            Self::default()
        }

        /// Register a fake device reachable at `address`. Every address in a
        /// resolved target's failover list is checked in order, so a test can
        /// register only the address that should ultimately succeed.
        pub fn register(&self, address: impl Into<String>, transport: Arc<dyn Transport>) {
            self.devices.lock().unwrap().insert(address.into(), transport);
        }

        /// Marks `address` as refusing credentials: `connect()` fails with
        /// `PERMISSION_ERROR` before any transport is handed out, simulating
        /// an SSH auth rejection.
        pub fn register_fail_auth(&self, address: impl Into<String>) {
            self.fail_auth.lock().unwrap().insert(address.into());
        }
    }

    #[async_trait]
    impl TransportFactory for ScriptedTransportFactory {
        async fn connect(&self, target: &crate::resolver::ResolvedTarget) -> Result<Box<dyn Transport>> {
            let fail_auth = self.fail_auth.lock().unwrap();
            for address in &target.addresses {
                if fail_auth.contains(address) {
                    return Err(FcrError::permission(format!(
                        "authentication refused by {}",
                        address
                    )));
                }
            }
            drop(fail_auth);
            let devices = self.devices.lock().unwrap();
            for address in &target.addresses {
                if let Some(transport) = devices.get(address) {
                    return Ok(Box::new(SharedTransport(transport.clone())));
                }
            }
            Err(FcrError::connection(format!(
                "no scripted device registered for addresses {:?}",
                target.addresses
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedTransport;
    use super::*;

    #[tokio::test]
    async fn scripted_transport_echoes_configured_response() {
        let transport =
            ScriptedTransport::new().with_response("show version", b"Version 1.0\nr1#".to_vec());
        transport.send(b"show version\n".to_vec()).await.unwrap();
        let chunk = transport.recv().await.unwrap();
        assert_eq!(chunk, b"Version 1.0\nr1#".to_vec());
    }

    #[tokio::test]
    async fn scripted_transport_delay_is_observed() {
        let transport = ScriptedTransport::new().with_delay(Duration::from_millis(50));
        let start = std::time::Instant::now();
        transport.recv().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn unreachable_transport_fails_every_call() {
        let transport = ScriptedTransport::unreachable();
        assert!(transport.send(b"x".to_vec()).await.is_err());
        assert!(transport.recv().await.is_err());
    }
}
