//! The packet codec seam.
//!
//! Framing, encryption and peer key material belong to an external device;
//! the agent consumes it only through [`SealerDevice`]. Inbound datagrams
//! are classified by a cheap [`precheck`](SealerDevice::precheck) before the
//! expensive [`open`](SealerDevice::open), and decoded messages arrive as a
//! small sum of variants ([`Opened`]) instead of a raw header code.
//!
//! [`ClearDevice`] is the bundled codec: the same contract with length
//! framing and no encryption, for deployments where the path to the
//! authorization server is already protected.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

/// Fixed size of a session cookie.
pub const COOKIE_LEN: usize = 32;

pub type Cookie = [u8; COOKIE_LEN];

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("authentication failure: {0}")]
    Authentication(String),

    #[error("failed to seal packet: {0}")]
    Seal(String),
}

/// Which side of the knock protocol a device speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    Agent,
    Server,
}

/// Inbound packet classification, produced before decryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    /// Response to a locally originated transaction.
    KnockAck,
    /// Session-priming challenge, handled inline by the connection.
    Cookie,
    /// Liveness traffic, discarded silently.
    Keepalive,
    /// Anything else; goes to the generic receive path.
    Other(u8),
}

#[derive(Debug, Clone, Copy)]
pub struct PacketMeta {
    pub kind: HeaderKind,
    pub counter: u64,
}

/// A decoded inbound message.
#[derive(Debug)]
pub enum Opened {
    CookieChallenge(Cookie),
    KnockAck { counter: u64, payload: Vec<u8> },
    /// Decoded fine but nothing local consumes it.
    Discard,
}

/// Remote server identity. Owned by the device; knock targets hold
/// read-only references.
#[derive(Debug)]
pub struct Peer {
    fingerprint: String,
    host: String,
    last_addr: Mutex<Option<SocketAddr>>,
}

impl Peer {
    pub fn new(fingerprint: String, host: String) -> Self {
        Self {
            fingerprint,
            host,
            last_addr: Mutex::new(None),
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn observe(&self, addr: SocketAddr) {
        *self.last_addr.lock().unwrap() = Some(addr);
    }

    pub fn last_addr(&self) -> Option<SocketAddr> {
        *self.last_addr.lock().unwrap()
    }
}

/// The knock request body handed to the device for framing.
#[derive(Debug, Clone, Serialize)]
pub struct KnockEnvelope {
    #[serde(rename = "usrId")]
    pub user_id: String,
    #[serde(rename = "orgId")]
    pub organization_id: String,
    #[serde(rename = "devId")]
    pub device_id: String,
    #[serde(rename = "aspId")]
    pub auth_service_id: String,
    #[serde(rename = "resId")]
    pub resource_id: String,
    #[serde(rename = "checkResults", skip_serializing_if = "HashMap::is_empty")]
    pub check_results: HashMap<String, serde_json::Value>,
}

/// Contract the agent consumes from the packet codec / crypto device.
pub trait SealerDevice: Send + Sync + 'static {
    fn start(&self) {}
    fn stop(&self) {}

    /// A fresh 64-bit transaction counter.
    fn next_counter(&self) -> u64;

    /// Peer bound to a `host:port`, if the device knows one.
    fn find_peer(&self, host: &str) -> Option<Arc<Peer>>;

    /// Frame (and for sealed codecs, encrypt) one knock request.
    fn seal(
        &self,
        counter: u64,
        envelope: &KnockEnvelope,
        peer: &Peer,
        cookie: Option<&Cookie>,
    ) -> Result<Vec<u8>, DeviceError>;

    /// Classify an inbound datagram without decrypting it.
    fn precheck(&self, datagram: &[u8]) -> Result<PacketMeta, DeviceError>;

    /// Decode an inbound datagram previously accepted by `precheck`.
    fn open(&self, meta: &PacketMeta, datagram: &[u8]) -> Result<Opened, DeviceError>;

    fn is_transaction_response(&self, kind: HeaderKind) -> bool {
        matches!(kind, HeaderKind::KnockAck)
    }
}

// ── ClearDevice ─────────────────────────────────────────────────────

const MAGIC: &[u8; 4] = b"LTCH";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + 1 + 8;

const KIND_KNOCK: u8 = 0x01;
const KIND_ACK: u8 = 0x02;
const KIND_COOKIE: u8 = 0x03;
const KIND_KEEPALIVE: u8 = 0x04;

/// Cleartext codec implementing the device contract.
///
/// Frame layout: `magic(4) | version(1) | kind(1) | counter(8, BE) |
/// body`. Knock requests carry a cookie slot (all zeros until the remote
/// issues one) followed by the JSON envelope; acknowledgements carry the
/// JSON payload; cookie challenges carry the 32-byte cookie.
pub struct ClearDevice {
    role: DeviceRole,
    /// Held for parity with sealed codecs, which derive session keys from it.
    #[allow(dead_code)]
    private_key: Vec<u8>,
    counter: AtomicU64,
    peers: HashMap<String, Arc<Peer>>,
}

impl ClearDevice {
    pub fn new(role: DeviceRole, private_key: Vec<u8>, peers: Vec<Peer>) -> Self {
        let peers = peers
            .into_iter()
            .map(|p| (p.host.clone(), Arc::new(p)))
            .collect();
        Self {
            role,
            private_key,
            counter: AtomicU64::new(1),
            peers,
        }
    }

    pub fn role(&self) -> DeviceRole {
        self.role
    }

    fn frame(kind: u8, counter: u64, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.push(kind);
        out.extend_from_slice(&counter.to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    /// Frame an acknowledgement payload. Used by the server side of the
    /// codec and by test harnesses standing in for the remote.
    pub fn frame_ack(&self, counter: u64, payload: &[u8]) -> Vec<u8> {
        Self::frame(KIND_ACK, counter, payload)
    }

    /// Frame a cookie challenge answering transaction `counter`.
    pub fn frame_cookie(&self, counter: u64, cookie: &Cookie) -> Vec<u8> {
        Self::frame(KIND_COOKIE, counter, cookie)
    }

    pub fn frame_keepalive(&self) -> Vec<u8> {
        Self::frame(KIND_KEEPALIVE, 0, &[])
    }

    /// The cookie slot and envelope of a knock request frame. Server-side
    /// decode helper.
    pub fn open_knock(datagram: &[u8]) -> Result<(u64, Cookie, Vec<u8>), DeviceError> {
        let (meta, body) = split_frame(datagram)?;
        if !matches!(header_kind(datagram), Some(KIND_KNOCK)) {
            return Err(DeviceError::Malformed("not a knock request".into()));
        }
        if body.len() < COOKIE_LEN {
            return Err(DeviceError::Malformed("knock body too short".into()));
        }
        let mut cookie = [0u8; COOKIE_LEN];
        cookie.copy_from_slice(&body[..COOKIE_LEN]);
        Ok((meta.counter, cookie, body[COOKIE_LEN..].to_vec()))
    }
}

fn header_kind(datagram: &[u8]) -> Option<u8> {
    datagram.get(5).copied()
}

fn split_frame(datagram: &[u8]) -> Result<(PacketMeta, &[u8]), DeviceError> {
    if datagram.len() < HEADER_LEN {
        return Err(DeviceError::Malformed("datagram shorter than header".into()));
    }
    if &datagram[..4] != MAGIC {
        return Err(DeviceError::Malformed("bad magic".into()));
    }
    if datagram[4] != VERSION {
        return Err(DeviceError::Malformed(format!(
            "unsupported version {}",
            datagram[4]
        )));
    }
    let kind = match datagram[5] {
        KIND_ACK => HeaderKind::KnockAck,
        KIND_COOKIE => HeaderKind::Cookie,
        KIND_KEEPALIVE => HeaderKind::Keepalive,
        other => HeaderKind::Other(other),
    };
    let counter = u64::from_be_bytes(datagram[6..14].try_into().unwrap());
    Ok((PacketMeta { kind, counter }, &datagram[HEADER_LEN..]))
}

impl SealerDevice for ClearDevice {
    fn next_counter(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    fn find_peer(&self, host: &str) -> Option<Arc<Peer>> {
        self.peers.get(host).cloned()
    }

    fn seal(
        &self,
        counter: u64,
        envelope: &KnockEnvelope,
        _peer: &Peer,
        cookie: Option<&Cookie>,
    ) -> Result<Vec<u8>, DeviceError> {
        let json = serde_json::to_vec(envelope).map_err(|e| DeviceError::Seal(e.to_string()))?;
        let mut body = Vec::with_capacity(COOKIE_LEN + json.len());
        body.extend_from_slice(cookie.unwrap_or(&[0u8; COOKIE_LEN]));
        body.extend_from_slice(&json);
        Ok(Self::frame(KIND_KNOCK, counter, &body))
    }

    fn precheck(&self, datagram: &[u8]) -> Result<PacketMeta, DeviceError> {
        split_frame(datagram).map(|(meta, _)| meta)
    }

    fn open(&self, meta: &PacketMeta, datagram: &[u8]) -> Result<Opened, DeviceError> {
        let (_, body) = split_frame(datagram)?;
        match meta.kind {
            HeaderKind::Cookie => {
                if body.len() != COOKIE_LEN {
                    return Err(DeviceError::Malformed("cookie body length".into()));
                }
                let mut cookie = [0u8; COOKIE_LEN];
                cookie.copy_from_slice(body);
                Ok(Opened::CookieChallenge(cookie))
            }
            HeaderKind::KnockAck => Ok(Opened::KnockAck {
                counter: meta.counter,
                payload: body.to_vec(),
            }),
            HeaderKind::Keepalive | HeaderKind::Other(_) => Ok(Opened::Discard),
        }
    }
}
