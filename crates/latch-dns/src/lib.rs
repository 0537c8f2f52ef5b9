//! Latch DNS: the gating front-end and its knock cache.

mod cache;
mod server;
mod upstream;

pub use cache::{CacheError, KnockCache};
pub use server::{DnsConfig, DnsCore, DnsError, Knocker};
pub use upstream::{Upstream, UpstreamError, EXCHANGE_TIMEOUT};
