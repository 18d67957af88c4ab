//! In-memory fakes for the transport and orchestrator seams.
//!
//! [`FakeFleet`] plays both the SSH side (it is a [`Dialer`]) and the
//! orchestrator side of a set of agent hosts, so tests can flip reachability,
//! break sessions and inspect authorized keys without a network.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{LinkError, Result};
use crate::events::{EventLog, EventType};
use crate::orchestrator::{
    ExecOutput, InstanceAddress, Orchestrator, OrchestratorError, OrchestratorResult,
};
use crate::ssh::{CommandOutput, Identity};
use crate::state::{ConnectionState, ConnectionStateTracker};
use crate::transport::{Dialer, Session, TunnelStream};

type Routes = Arc<Mutex<HashMap<u16, SocketAddr>>>;
type ExecHook = Box<dyn Fn(&str) + Send + Sync>;

struct FakeHost {
    address: InstanceAddress,
    reachable: bool,
    check_keys: bool,
    fail_configure: bool,
    fail_exec: bool,
    host_key: String,
    authorized_keys: Vec<String>,
    routes: Routes,
}

#[derive(Default)]
pub struct FakeFleet {
    hosts: Mutex<HashMap<String, FakeHost>>,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
    dial_delay: Mutex<Duration>,
    dials: AtomicUsize,
    uploads: AtomicUsize,
    exec_hook: Mutex<Option<ExecHook>>,
}

impl FakeFleet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a reachable host that accepts any key.
    pub fn add_host(&self, instance_id: &str, host: &str, port: u16) {
        self.hosts.lock().insert(
            instance_id.to_string(),
            FakeHost {
                address: InstanceAddress::new(host, port),
                reachable: true,
                check_keys: false,
                fail_configure: false,
                fail_exec: false,
                host_key: format!("SHA256:{}-hostkey", instance_id),
                authorized_keys: Vec::new(),
                routes: Arc::new(Mutex::new(HashMap::new())),
            },
        );
    }

    fn with_host<T>(&self, instance_id: &str, f: impl FnOnce(&mut FakeHost) -> T) -> T {
        let mut hosts = self.hosts.lock();
        let host = hosts
            .get_mut(instance_id)
            .unwrap_or_else(|| panic!("unknown fake host {instance_id}"));
        f(host)
    }

    pub fn set_reachable(&self, instance_id: &str, reachable: bool) {
        self.with_host(instance_id, |h| h.reachable = reachable);
    }

    /// Only accept dials whose public key is in the host's authorized keys.
    pub fn enforce_keys(&self, instance_id: &str, authorized: &[&str]) {
        self.with_host(instance_id, |h| {
            h.check_keys = true;
            h.authorized_keys = authorized.iter().map(|k| k.trim().to_string()).collect();
        });
    }

    pub fn authorized_keys(&self, instance_id: &str) -> Vec<String> {
        self.with_host(instance_id, |h| h.authorized_keys.clone())
    }

    pub fn fail_configure(&self, instance_id: &str, fail: bool) {
        self.with_host(instance_id, |h| h.fail_configure = fail);
    }

    pub fn fail_exec(&self, instance_id: &str, fail: bool) {
        self.with_host(instance_id, |h| h.fail_exec = fail);
    }

    pub fn set_host_key(&self, instance_id: &str, fingerprint: &str) {
        self.with_host(instance_id, |h| h.host_key = fingerprint.to_string());
    }

    pub fn move_host(&self, instance_id: &str, host: &str, port: u16) {
        self.with_host(instance_id, |h| h.address = InstanceAddress::new(host, port));
    }

    /// Direct-tcpip channels to `remote_port` connect to `target`.
    pub fn route(&self, instance_id: &str, remote_port: u16, target: SocketAddr) {
        self.with_host(instance_id, |h| {
            h.routes.lock().insert(remote_port, target);
        });
    }

    /// Run `hook` with the instance id on every orchestrator exec.
    pub fn on_exec(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.exec_hook.lock() = Some(Box::new(hook));
    }

    pub fn set_dial_delay(&self, delay: Duration) {
        *self.dial_delay.lock() = delay;
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn sessions(&self, instance_id: &str) -> Vec<Arc<FakeSession>> {
        self.sessions
            .lock()
            .iter()
            .filter(|s| s.instance_id == instance_id)
            .cloned()
            .collect()
    }

    pub fn last_session(&self, instance_id: &str) -> Option<Arc<FakeSession>> {
        self.sessions(instance_id).pop()
    }

    fn instance_at(&self, host: &str, port: u16) -> Option<String> {
        self.hosts
            .lock()
            .iter()
            .find(|(_, h)| h.address.host == host && h.address.port == port)
            .map(|(id, _)| id.clone())
    }
}

#[async_trait]
impl Dialer for FakeFleet {
    async fn dial(&self, host: &str, port: u16, identity: &Identity) -> Result<Arc<dyn Session>> {
        self.dials.fetch_add(1, Ordering::SeqCst);

        let delay = *self.dial_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let instance_id = self
            .instance_at(host, port)
            .ok_or_else(|| LinkError::Ssh(format!("Connection to {}:{} refused", host, port)))?;

        let session = {
            let hosts = self.hosts.lock();
            let h = &hosts[&instance_id];
            if !h.reachable {
                return Err(LinkError::Ssh(format!("Connection to {}:{} refused", host, port)));
            }
            if h.check_keys && !h.authorized_keys.iter().any(|k| k == identity.public_key.trim()) {
                return Err(LinkError::Ssh(format!(
                    "Server {} rejected the key for user agent",
                    host
                )));
            }
            Arc::new(FakeSession {
                instance_id: instance_id.clone(),
                fingerprint: identity.fingerprint.clone(),
                host_key: h.host_key.clone(),
                routes: h.routes.clone(),
                closed: AtomicBool::new(false),
                fail_keepalive: AtomicBool::new(false),
                fail_exec: AtomicBool::new(false),
                execs: AtomicUsize::new(0),
            })
        };

        self.sessions.lock().push(session.clone());
        Ok(session)
    }
}

fn quoted_key(command: &str) -> Option<String> {
    let start = command.find("'ssh-")? + 1;
    let end = command[start..].find('\'')? + start;
    Some(command[start..end].to_string())
}

#[async_trait]
impl Orchestrator for FakeFleet {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn get_address(&self, instance_id: &str) -> OrchestratorResult<InstanceAddress> {
        self.hosts
            .lock()
            .get(instance_id)
            .map(|h| h.address.clone())
            .ok_or_else(|| OrchestratorError::not_found(instance_id))
    }

    async fn configure_access(
        &self,
        instance_id: &str,
        public_key: &str,
    ) -> OrchestratorResult<()> {
        let mut hosts = self.hosts.lock();
        let host = hosts
            .get_mut(instance_id)
            .ok_or_else(|| OrchestratorError::not_found(instance_id))?;
        if host.fail_configure {
            return Err(OrchestratorError::CommandFailed {
                id: instance_id.to_string(),
                exit_code: 1,
                stderr: "read-only file system".to_string(),
            });
        }
        let key = public_key.trim().to_string();
        if !host.authorized_keys.contains(&key) {
            host.authorized_keys.push(key);
        }
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn exec(&self, instance_id: &str, command: &str) -> OrchestratorResult<ExecOutput> {
        if let Some(hook) = self.exec_hook.lock().as_ref() {
            hook(instance_id);
        }
        let mut hosts = self.hosts.lock();
        let host = hosts
            .get_mut(instance_id)
            .ok_or_else(|| OrchestratorError::not_found(instance_id))?;
        if host.fail_exec {
            return Err(OrchestratorError::CommandFailed {
                id: instance_id.to_string(),
                exit_code: 1,
                stderr: "exec refused".to_string(),
            });
        }
        if command.contains("authorized_keys.tmp") {
            if let Some(key) = quoted_key(command) {
                host.authorized_keys = vec![key];
            }
        }
        Ok(ExecOutput::default())
    }
}

pub struct FakeSession {
    pub instance_id: String,
    /// Fingerprint of the client key that authenticated this session.
    pub fingerprint: String,
    host_key: String,
    routes: Routes,
    closed: AtomicBool,
    fail_keepalive: AtomicBool,
    fail_exec: AtomicBool,
    execs: AtomicUsize,
}

impl FakeSession {
    /// Simulate the remote end going away.
    pub fn kill(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn fail_keepalive(&self) {
        self.fail_keepalive.store(true, Ordering::SeqCst);
    }

    pub fn fail_exec(&self) {
        self.fail_exec.store(true, Ordering::SeqCst);
    }

    pub fn exec_count(&self) -> usize {
        self.execs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn keepalive(&self) -> Result<()> {
        if self.is_closed() || self.fail_keepalive.load(Ordering::SeqCst) {
            return Err(LinkError::Ssh("keepalive failed: broken pipe".to_string()));
        }
        Ok(())
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        self.execs.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() {
            return Err(LinkError::Ssh("Failed to open channel: closed".to_string()));
        }
        if self.fail_exec.load(Ordering::SeqCst) {
            return Ok(CommandOutput::new("", "sh: fork failed", 1));
        }
        match command.strip_prefix("echo ") {
            Some(rest) => Ok(CommandOutput::new(format!("{}\n", rest), "", 0)),
            None => Ok(CommandOutput::new("", "", 0)),
        }
    }

    async fn open_tunnel(&self, remote_port: u16) -> Result<TunnelStream> {
        if self.is_closed() {
            return Err(LinkError::Tunnel("Failed to open channel: closed".to_string()));
        }
        let target = self.routes.lock().get(&remote_port).copied().ok_or_else(|| {
            LinkError::Tunnel(format!("Failed to open channel: port {} refused", remote_port))
        })?;
        let stream = TcpStream::connect(target)
            .await
            .map_err(|e| LinkError::Tunnel(format!("Failed to open channel: {}", e)))?;
        Ok(Box::new(stream))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn host_key_fingerprint(&self) -> Option<String> {
        Some(self.host_key.clone())
    }
}

/// TCP echo server standing in for a remote service.
pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// Poll until `instance_id` reaches `target` (virtual time friendly).
pub async fn wait_for_state(
    states: &ConnectionStateTracker,
    instance_id: &str,
    target: ConnectionState,
) {
    let result = tokio::time::timeout(Duration::from_secs(600), async {
        while states.state(instance_id) != target {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(
        result.is_ok(),
        "{} never reached {:?}, stuck in {:?}",
        instance_id,
        target,
        states.state(instance_id)
    );
}

/// Poll until `instance_id` has recorded an event of `event_type`.
pub async fn wait_for_event(events: &EventLog, instance_id: &str, event_type: EventType) {
    let result = tokio::time::timeout(Duration::from_secs(600), async {
        while !events
            .events(instance_id)
            .iter()
            .any(|e| e.event_type == event_type)
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(
        result.is_ok(),
        "{} never recorded {:?}",
        instance_id,
        event_type
    );
}

/// Poll until `condition` holds, with a real-time bound.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "condition never became true");
}
