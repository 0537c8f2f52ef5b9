//! The UDP knock agent.
//!
//! One connection per remote authorization server, created lazily on the
//! first knock to an address. A single scheduler loop owns connection
//! creation and reaping; callers block on transaction completion channels,
//! never on sockets.

mod conn;
pub mod device;
mod target;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use latch_common::{KnockAck, KnockIdentity, Resource};
use latch_registry::RegistryReloaded;

use conn::{ClosedEvent, Connection};
use device::{DeviceError, KnockEnvelope, Peer, SealerDevice};

pub use conn::CloseReason;
pub use device::{ClearDevice, DeviceRole};
pub use target::KnockTarget;

/// Outbound jobs queued for the scheduler loop.
const SCHEDULER_QUEUE_DEPTH: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent stopped")]
    Stopped,

    #[error("knock timed out")]
    Timeout,

    #[error("transaction cancelled")]
    Cancelled,

    #[error("remote {0} is blocked")]
    Blocked(SocketAddr),

    #[error("cannot resolve server address {0}")]
    Resolve(String),

    #[error("no peer configured for {0}")]
    UnknownPeer(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("malformed acknowledgement: {0}")]
    AckParse(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Per-transaction deadline for one knock.
    pub knock_timeout: Duration,
    /// Connection idle timeout before teardown.
    pub idle_timeout: Duration,
    /// How long a blocked remote stays blacklisted.
    pub block_cooldown: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            knock_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            block_cooldown: Duration::from_secs(60),
        }
    }
}

enum Outbound {
    Knock {
        addr: SocketAddr,
        peer: Arc<Peer>,
        counter: u64,
        envelope: KnockEnvelope,
        reply: oneshot::Sender<Result<Vec<u8>, AgentError>>,
    },
    Forget {
        addr: SocketAddr,
        counter: u64,
    },
}

pub struct UdpAgent {
    device: Arc<dyn SealerDevice>,
    config: AgentConfig,
    identity: RwLock<KnockIdentity>,
    conns: Mutex<HashMap<SocketAddr, Arc<Connection>>>,
    blocked: Mutex<HashMap<SocketAddr, Instant>>,
    targets: Mutex<HashMap<String, Arc<KnockTarget>>>,
    epoch: AtomicU64,
    out_tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
}

impl UdpAgent {
    /// Start the agent and its scheduler loop. The agent stops when
    /// [`shutdown`](Self::shutdown) is called or `parent` is cancelled.
    pub fn start(
        device: Arc<dyn SealerDevice>,
        config: AgentConfig,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let (out_tx, out_rx) = mpsc::channel(SCHEDULER_QUEUE_DEPTH);
        let (reap_tx, reap_rx) = mpsc::unbounded_channel();

        device.start();

        let agent = Arc::new(Self {
            device,
            config,
            identity: RwLock::new(KnockIdentity::default()),
            conns: Mutex::new(HashMap::new()),
            blocked: Mutex::new(HashMap::new()),
            targets: Mutex::new(HashMap::new()),
            epoch: AtomicU64::new(0),
            out_tx,
            cancel: parent.child_token(),
        });

        tokio::spawn(scheduler_loop(Arc::clone(&agent), out_rx, reap_rx, reap_tx));
        agent
    }

    pub fn set_identity(&self, identity: KnockIdentity) {
        *self.identity.write().unwrap() = identity;
    }

    /// Bind a resource to its server peer, reusing an existing target.
    pub fn target_for(&self, resource: &Arc<Resource>) -> Result<Arc<KnockTarget>, AgentError> {
        let key = resource.id();
        if let Some(target) = self.targets.lock().unwrap().get(&key) {
            return Ok(Arc::clone(target));
        }
        let addr = resource.server_addr();
        let peer = self
            .device
            .find_peer(&addr)
            .ok_or(AgentError::UnknownPeer(addr))?;
        let mut targets = self.targets.lock().unwrap();
        let target = targets
            .entry(key)
            .or_insert_with(|| Arc::new(KnockTarget::new(Arc::clone(resource), peer)));
        Ok(Arc::clone(target))
    }

    /// Drop every knock target whenever the registry swaps its table.
    pub fn spawn_target_reset(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<RegistryReloaded>,
    ) {
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = agent.cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(reloaded) => {
                            agent.targets.lock().unwrap().clear();
                            tracing::debug!(
                                resources = reloaded.resource_count,
                                "knock targets reset after registry reload"
                            );
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            agent.targets.lock().unwrap().clear();
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    /// Perform one knock transaction against the target's server and return
    /// the acknowledgement, granted or not.
    pub async fn knock(&self, target: &KnockTarget) -> Result<KnockAck, AgentError> {
        let server = target.resource().server_addr();
        let addr = resolve_server(&server).await?;
        target.peer().observe(addr);

        let counter = self.device.next_counter();
        let envelope = self.envelope_for(target.resource());
        let (reply_tx, reply_rx) = oneshot::channel();

        self.out_tx
            .send(Outbound::Knock {
                addr,
                peer: Arc::clone(target.peer()),
                counter,
                envelope,
                reply: reply_tx,
            })
            .await
            .map_err(|_| AgentError::Stopped)?;

        let payload = match tokio::time::timeout(self.config.knock_timeout, reply_rx).await {
            Err(_) => {
                let _ = self.out_tx.try_send(Outbound::Forget { addr, counter });
                tracing::warn!(resource = %target.resource().id(), counter, "knock timed out");
                return Err(AgentError::Timeout);
            }
            Ok(Err(_)) => return Err(AgentError::Stopped),
            Ok(Ok(result)) => result?,
        };

        let ack: KnockAck = serde_json::from_slice(&payload)?;
        if ack.granted() {
            target.mark_success();
            tracing::info!(
                target: "audit",
                resource = %target.resource().id(),
                open_time = ack.open_time,
                "knock granted"
            );
        } else {
            tracing::warn!(
                resource = %target.resource().id(),
                err_code = %ack.err_code,
                err_msg = %ack.err_msg,
                "knock denied"
            );
        }
        Ok(ack)
    }

    /// Update one connection's idle timeout. Zero tears the connection
    /// down immediately. Returns false when no connection exists for the
    /// address.
    pub fn set_connection_idle_timeout(&self, addr: SocketAddr, timeout: Duration) -> bool {
        match self.conns.lock().unwrap().get(&addr) {
            Some(conn) => {
                conn.set_idle_timeout(timeout);
                true
            }
            None => false,
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn envelope_for(&self, resource: &Resource) -> KnockEnvelope {
        let identity = self.identity.read().unwrap();
        KnockEnvelope {
            user_id: identity.user_id.clone(),
            organization_id: identity.organization_id.clone(),
            device_id: identity.device_id.clone(),
            auth_service_id: resource.auth_service_id.clone(),
            resource_id: resource.resource_id.clone(),
            check_results: identity.check_results.clone(),
        }
    }

    fn blocked_until(&self, addr: SocketAddr) -> Option<Instant> {
        let mut blocked = self.blocked.lock().unwrap();
        match blocked.get(&addr) {
            Some(&until) if Instant::now() < until => Some(until),
            Some(_) => {
                blocked.remove(&addr);
                None
            }
            None => None,
        }
    }

    async fn dispatch_knock(
        &self,
        addr: SocketAddr,
        peer: Arc<Peer>,
        counter: u64,
        envelope: KnockEnvelope,
        reply: oneshot::Sender<Result<Vec<u8>, AgentError>>,
        reap_tx: &mpsc::UnboundedSender<ClosedEvent>,
    ) {
        if self.blocked_until(addr).is_some() {
            let _ = reply.send(Err(AgentError::Blocked(addr)));
            return;
        }

        let existing = self.conns.lock().unwrap().get(&addr).cloned();
        let conn = match existing {
            Some(conn) => conn,
            None => {
                let epoch = self.epoch.fetch_add(1, Ordering::Relaxed);
                match Connection::open(
                    addr,
                    epoch,
                    Arc::clone(&self.device),
                    self.config.idle_timeout,
                    &self.cancel,
                    reap_tx.clone(),
                )
                .await
                {
                    Ok(conn) => {
                        self.conns.lock().unwrap().insert(addr, Arc::clone(&conn));
                        conn
                    }
                    Err(e) => {
                        let _ = reply.send(Err(AgentError::Transport(format!(
                            "dial {addr}: {e}"
                        ))));
                        return;
                    }
                }
            }
        };

        let cookie = conn.cookie();
        let datagram = match self
            .device
            .seal(counter, &envelope, &peer, cookie.as_ref())
        {
            Ok(datagram) => datagram,
            Err(e) => {
                let _ = reply.send(Err(AgentError::Device(e)));
                return;
            }
        };

        conn.register(counter, envelope, peer, reply);
        if let Err(e) = conn.enqueue(datagram) {
            conn.fail(counter, e);
        }
    }

    fn handle_closed(&self, event: ClosedEvent) {
        {
            let mut conns = self.conns.lock().unwrap();
            if conns.get(&event.addr).map(|c| c.epoch()) == Some(event.epoch) {
                conns.remove(&event.addr);
            }
        }
        if event.reason == CloseReason::Blocked {
            let until = Instant::now() + self.config.block_cooldown;
            self.blocked.lock().unwrap().insert(event.addr, until);
            tracing::warn!(
                addr = %event.addr,
                cooldown_secs = self.config.block_cooldown.as_secs(),
                "remote blacklisted"
            );
        }
    }
}

async fn scheduler_loop(
    agent: Arc<UdpAgent>,
    mut out_rx: mpsc::Receiver<Outbound>,
    mut reap_rx: mpsc::UnboundedReceiver<ClosedEvent>,
    reap_tx: mpsc::UnboundedSender<ClosedEvent>,
) {
    loop {
        // biased: teardown events settle the connection map and blocklist
        // before the next knock is dispatched.
        tokio::select! {
            biased;
            _ = agent.cancel.cancelled() => break,
            event = reap_rx.recv() => {
                if let Some(event) = event {
                    agent.handle_closed(event);
                }
            }
            job = out_rx.recv() => match job {
                Some(Outbound::Knock { addr, peer, counter, envelope, reply }) => {
                    agent.dispatch_knock(addr, peer, counter, envelope, reply, &reap_tx).await;
                }
                Some(Outbound::Forget { addr, counter }) => {
                    if let Some(conn) = agent.conns.lock().unwrap().get(&addr) {
                        conn.forget(counter);
                    }
                }
                None => break,
            },
        }
    }

    let drained: Vec<Arc<Connection>> = {
        let mut conns = agent.conns.lock().unwrap();
        conns.drain().map(|(_, conn)| conn).collect()
    };
    for conn in drained {
        conn.close(CloseReason::Stopped);
    }
    agent.device.stop();
    tracing::debug!("agent scheduler stopped");
}

async fn resolve_server(addr: &str) -> Result<SocketAddr, AgentError> {
    if let Ok(parsed) = addr.parse::<SocketAddr>() {
        return Ok(parsed);
    }
    let mut hosts = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| AgentError::Resolve(format!("{addr}: {e}")))?;
    hosts
        .next()
        .ok_or_else(|| AgentError::Resolve(format!("{addr}: no addresses")))
}
