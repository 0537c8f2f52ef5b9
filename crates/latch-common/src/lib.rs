//! Shared data model for the Latch DNS gate.
//!
//! Types in this crate cross crate boundaries: the resource table rows the
//! registry serves, the knock acknowledgement the authorization server
//! returns, and the identity attached to every knock request.

mod types;

pub use types::{KnockAck, KnockIdentity, Resource};

/// Loopback address the DNS front-end binds.
pub const DNS_LISTEN_IP: &str = "127.0.0.1";

/// Standard DNS port.
pub const DNS_UDP_PORT: u16 = 53;

/// Reserved pseudo-TLD suffix for gated names (with the leading dot).
pub const DEFAULT_GATE_SUFFIX: &str = ".latch";

/// Upstream resolver used when the system-DNS controller reports none.
pub const DEFAULT_UPSTREAM_DNS: &str = "8.8.8.8";

/// Sentinel file whose creation next to the executable requests shutdown.
pub const STOP_FILE_NAME: &str = ".latch-stop";
