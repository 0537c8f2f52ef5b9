//! One UDP connection per remote authorization server.
//!
//! Each connection runs three tasks: a send loop that is the sole socket
//! writer, a receive loop that prechecks and dispatches inbound packets,
//! and an idle timer that re-reads a deadline the other two loops advance
//! on every I/O. Teardown is reported to the agent on a reap channel; the
//! connection never holds a reference back into the agent.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::device::{
    Cookie, DeviceError, HeaderKind, KnockEnvelope, Opened, Peer, SealerDevice,
};
use crate::AgentError;

/// Outbound packets queued per connection before the send loop drains them.
const SEND_QUEUE_DEPTH: usize = 64;

const RECV_BUF_LEN: usize = 65_535;

/// Why a connection went away. `IdleZero` is the immediate close caused by
/// a zero idle-timeout update, distinct from a normal `Idle` expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Idle,
    IdleZero,
    Blocked,
    Stopped,
}

/// Sent to the agent's scheduler when a connection tears down.
#[derive(Debug)]
pub(crate) struct ClosedEvent {
    pub addr: SocketAddr,
    pub epoch: u64,
    pub reason: CloseReason,
}

struct PendingKnock {
    envelope: KnockEnvelope,
    peer: Arc<Peer>,
    reply: oneshot::Sender<Result<Vec<u8>, AgentError>>,
}

pub(crate) struct Connection {
    remote: SocketAddr,
    local: SocketAddr,
    epoch: u64,
    device: Arc<dyn SealerDevice>,
    send_tx: mpsc::Sender<Vec<u8>>,
    pending: Mutex<HashMap<u64, PendingKnock>>,
    cookie: Mutex<Option<Cookie>>,
    idle_deadline: Mutex<Instant>,
    idle_timeout: watch::Sender<Duration>,
    cancel: CancellationToken,
    closed: Mutex<Option<CloseReason>>,
    reap_tx: mpsc::UnboundedSender<ClosedEvent>,
}

impl Connection {
    pub(crate) async fn open(
        remote: SocketAddr,
        epoch: u64,
        device: Arc<dyn SealerDevice>,
        idle_timeout: Duration,
        parent: &CancellationToken,
        reap_tx: mpsc::UnboundedSender<ClosedEvent>,
    ) -> std::io::Result<Arc<Self>> {
        let bind_addr: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(remote).await?;
        let local = socket.local_addr()?;
        let socket = Arc::new(socket);

        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let (idle_tx, idle_rx) = watch::channel(idle_timeout);

        let conn = Arc::new(Self {
            remote,
            local,
            epoch,
            device,
            send_tx,
            pending: Mutex::new(HashMap::new()),
            cookie: Mutex::new(None),
            idle_deadline: Mutex::new(Instant::now() + idle_timeout),
            idle_timeout: idle_tx,
            cancel: parent.child_token(),
            closed: Mutex::new(None),
            reap_tx,
        });

        tracing::info!(local = %local, remote = %remote, "udp connection opened");

        tokio::spawn(send_loop(Arc::clone(&conn), Arc::clone(&socket), send_rx));
        tokio::spawn(recv_loop(Arc::clone(&conn), socket));
        tokio::spawn(idle_loop(Arc::clone(&conn), idle_rx));

        Ok(conn)
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn cookie(&self) -> Option<Cookie> {
        *self.cookie.lock().unwrap()
    }

    pub(crate) fn register(
        &self,
        counter: u64,
        envelope: KnockEnvelope,
        peer: Arc<Peer>,
        reply: oneshot::Sender<Result<Vec<u8>, AgentError>>,
    ) {
        self.pending.lock().unwrap().insert(
            counter,
            PendingKnock {
                envelope,
                peer,
                reply,
            },
        );
    }

    pub(crate) fn forget(&self, counter: u64) {
        self.pending.lock().unwrap().remove(&counter);
    }

    /// Remove a pending transaction and fail its waiter.
    pub(crate) fn fail(&self, counter: u64, err: AgentError) {
        if let Some(p) = self.pending.lock().unwrap().remove(&counter) {
            let _ = p.reply.send(Err(err));
        }
    }

    pub(crate) fn enqueue(&self, datagram: Vec<u8>) -> Result<(), AgentError> {
        self.send_tx
            .try_send(datagram)
            .map_err(|_| AgentError::Transport("connection send queue unavailable".into()))
    }

    /// Update the idle timeout. Zero closes the connection immediately.
    pub(crate) fn set_idle_timeout(&self, timeout: Duration) {
        let _ = self.idle_timeout.send(timeout);
    }

    pub(crate) fn close(&self, reason: CloseReason) {
        {
            let mut closed = self.closed.lock().unwrap();
            if closed.is_some() {
                return;
            }
            *closed = Some(reason);
        }
        tracing::debug!(remote = %self.remote, ?reason, "connection closed");

        let drained: Vec<PendingKnock> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, p)| p).collect()
        };
        for p in drained {
            let err = match reason {
                CloseReason::Blocked => AgentError::Blocked(self.remote),
                _ => AgentError::Cancelled,
            };
            let _ = p.reply.send(Err(err));
        }

        self.cancel.cancel();
        let _ = self.reap_tx.send(ClosedEvent {
            addr: self.remote,
            epoch: self.epoch,
            reason,
        });
    }

    /// Advance the idle deadline. Called by both loops on every I/O.
    fn touch(&self) {
        let timeout = *self.idle_timeout.borrow();
        *self.idle_deadline.lock().unwrap() = Instant::now() + timeout;
    }

    /// Deliver a transaction response exactly once.
    fn complete(&self, counter: u64, payload: Vec<u8>) {
        let entry = self.pending.lock().unwrap().remove(&counter);
        match entry {
            Some(p) => {
                tracing::debug!(remote = %self.remote, counter, "transaction completed");
                let _ = p.reply.send(Ok(payload));
            }
            None => {
                tracing::debug!(remote = %self.remote, counter, "response without a matching transaction, dropped");
            }
        }
    }

    /// Stash the cookie and regenerate every pending request with it. The
    /// only legal case of a transaction being sent more than once.
    fn accept_cookie(&self, cookie: Cookie) {
        *self.cookie.lock().unwrap() = Some(cookie);
        tracing::debug!(remote = %self.remote, "cookie accepted, re-sending pending knocks");

        let resend: Vec<(u64, KnockEnvelope, Arc<Peer>)> = {
            let pending = self.pending.lock().unwrap();
            pending
                .iter()
                .map(|(c, p)| (*c, p.envelope.clone(), Arc::clone(&p.peer)))
                .collect()
        };
        for (counter, envelope, peer) in resend {
            match self.device.seal(counter, &envelope, &peer, Some(&cookie)) {
                Ok(datagram) => {
                    if let Err(e) = self.enqueue(datagram) {
                        tracing::warn!(remote = %self.remote, counter, error = %e, "cookie re-send failed");
                    }
                }
                Err(e) => {
                    tracing::warn!(remote = %self.remote, counter, error = %e, "re-seal with cookie failed");
                }
            }
        }
    }

    /// Drop pending entries whose waiter has already timed out.
    fn sweep_pending(&self) {
        self.pending
            .lock()
            .unwrap()
            .retain(|_, p| !p.reply.is_closed());
    }
}

async fn send_loop(
    conn: Arc<Connection>,
    socket: Arc<UdpSocket>,
    mut rx: mpsc::Receiver<Vec<u8>>,
) {
    loop {
        let datagram = tokio::select! {
            _ = conn.cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(datagram) => datagram,
                None => break,
            },
        };
        match socket.send(&datagram).await {
            Ok(n) => {
                conn.touch();
                tracing::trace!(local = %conn.local, remote = %conn.remote, bytes = n, "sent packet");
            }
            Err(e) => {
                tracing::warn!(remote = %conn.remote, error = %e, "udp send error");
            }
        }
    }
    tracing::trace!(remote = %conn.remote, "send loop stopped");
}

async fn recv_loop(conn: Arc<Connection>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; RECV_BUF_LEN];
    loop {
        let n = tokio::select! {
            _ = conn.cancel.cancelled() => break,
            result = socket.recv(&mut buf) => match result {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(remote = %conn.remote, error = %e, "udp recv error");
                    continue;
                }
            },
        };
        conn.touch();
        let datagram = &buf[..n];

        let meta = match conn.device.precheck(datagram) {
            Ok(meta) => meta,
            Err(DeviceError::Authentication(msg)) => {
                tracing::error!(remote = %conn.remote, %msg, "authentication failure, blocking remote");
                conn.close(CloseReason::Blocked);
                break;
            }
            Err(e) => {
                tracing::debug!(remote = %conn.remote, error = %e, "precheck rejected packet");
                continue;
            }
        };
        tracing::trace!(remote = %conn.remote, kind = ?meta.kind, counter = meta.counter, bytes = n, "received packet");

        if matches!(meta.kind, HeaderKind::Keepalive) {
            continue;
        }

        match conn.device.open(&meta, datagram) {
            Ok(Opened::CookieChallenge(cookie)) => conn.accept_cookie(cookie),
            Ok(Opened::KnockAck { counter, payload })
                if conn.device.is_transaction_response(meta.kind) =>
            {
                conn.complete(counter, payload);
            }
            Ok(Opened::KnockAck { counter, .. }) => {
                tracing::debug!(remote = %conn.remote, counter, "ack under a non-transaction header, dropped");
            }
            Ok(Opened::Discard) => {
                tracing::debug!(remote = %conn.remote, kind = ?meta.kind, "no local consumer for packet");
            }
            Err(DeviceError::Authentication(msg)) => {
                tracing::error!(remote = %conn.remote, %msg, "authentication failure, blocking remote");
                conn.close(CloseReason::Blocked);
                break;
            }
            Err(e) => {
                tracing::debug!(remote = %conn.remote, error = %e, "failed to open packet");
            }
        }
    }
    tracing::trace!(remote = %conn.remote, "receive loop stopped");
}

async fn idle_loop(conn: Arc<Connection>, mut timeout_rx: watch::Receiver<Duration>) {
    loop {
        let timeout = *timeout_rx.borrow_and_update();
        if timeout.is_zero() {
            conn.close(CloseReason::IdleZero);
            return;
        }
        let deadline = *conn.idle_deadline.lock().unwrap();
        tokio::select! {
            _ = conn.cancel.cancelled() => return,
            changed = timeout_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                conn.touch();
            }
            _ = tokio::time::sleep_until(deadline) => {
                conn.sweep_pending();
                if Instant::now() >= *conn.idle_deadline.lock().unwrap() {
                    conn.close(CloseReason::Idle);
                    return;
                }
            }
        }
    }
}
