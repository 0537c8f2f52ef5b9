//! The DNS front-end: classifies each question, forwards ordinary names
//! and gates names under the reserved suffix behind a knock.
//!
//! Every failure on the gated path answers with an empty NOERROR so the
//! existence of gated resources never leaks; only the forward path may
//! surface SERVFAIL.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::CNAME;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use latch_agent::{AgentError, UdpAgent};
use latch_common::{KnockAck, Resource, DEFAULT_GATE_SUFFIX, DNS_LISTEN_IP, DNS_UDP_PORT};
use latch_registry::Registry;

use crate::cache::KnockCache;
use crate::upstream::Upstream;

/// Seconds shaved off every grant so the gate cannot close before
/// downstream DNS caches expire.
const GRANT_TTL_SHAVE: u64 = 5;

/// Record TTL stamped on AAAA answers. Deliberately fixed so clients do
/// not pin IPv6 addresses for the whole grant; the cache expiry still
/// follows the grant.
const AAAA_RECORD_TTL: u32 = 3_600;

const QUERY_BUF_LEN: usize = 4_096;

#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    #[error("failed to bind dns socket: {0}")]
    Bind(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Source of access grants for gated resources. The UDP agent is the
/// production implementation; tests script their own.
pub trait Knocker: Send + Sync + 'static {
    fn request_grant(
        &self,
        resource: Arc<Resource>,
    ) -> impl Future<Output = Result<KnockAck, AgentError>> + Send;
}

impl Knocker for UdpAgent {
    fn request_grant(
        &self,
        resource: Arc<Resource>,
    ) -> impl Future<Output = Result<KnockAck, AgentError>> + Send {
        async move {
            let target = self.target_for(&resource)?;
            self.knock(&target).await
        }
    }
}

/// DNS front-end configuration.
#[derive(Debug, Clone)]
pub struct DnsConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    /// Reserved pseudo-TLD, with the leading dot.
    pub gate_suffix: String,
    /// Upstream resolver; `None` disables the forward path.
    pub upstream: Option<SocketAddr>,
    /// Hard cap on cache entry lifetime, seconds.
    pub cache_cap_secs: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            bind_addr: DNS_LISTEN_IP.parse().unwrap(),
            port: DNS_UDP_PORT,
            gate_suffix: DEFAULT_GATE_SUFFIX.to_string(),
            upstream: None,
            cache_cap_secs: 3_600,
        }
    }
}

enum Route {
    Gated(String),
    Forward,
}

pub struct DnsCore<K: Knocker> {
    config: DnsConfig,
    registry: Arc<Registry>,
    knocker: Arc<K>,
    cache: KnockCache,
    upstream: Option<Upstream>,
}

impl<K: Knocker> DnsCore<K> {
    pub fn new(config: DnsConfig, registry: Arc<Registry>, knocker: Arc<K>) -> Self {
        let cache = KnockCache::new(std::time::Duration::from_secs(config.cache_cap_secs));
        let upstream = config.upstream.map(Upstream::new);
        Self {
            config,
            registry,
            knocker,
            cache,
            upstream,
        }
    }

    pub fn config(&self) -> &DnsConfig {
        &self.config
    }

    pub fn cache(&self) -> &KnockCache {
        &self.cache
    }

    /// Accept queries on the configured loopback address until cancelled.
    /// A bind failure is fatal to the daemon.
    pub async fn serve(self: &Arc<Self>, cancel: CancellationToken) -> Result<(), DnsError> {
        let addr = SocketAddr::new(self.config.bind_addr, self.config.port);
        let socket = Arc::new(
            UdpSocket::bind(addr)
                .await
                .map_err(|e| DnsError::Bind(format!("{addr}: {e}")))?,
        );
        tracing::info!(%addr, suffix = %self.config.gate_suffix, "dns front-end listening");

        self.cache.spawn_janitor(cancel.child_token());

        let mut buf = vec![0u8; QUERY_BUF_LEN];
        loop {
            let (n, client) = tokio::select! {
                _ = cancel.cancelled() => break,
                result = socket.recv_from(&mut buf) => match result {
                    Ok(received) => received,
                    Err(e) => {
                        tracing::warn!(error = %e, "dns recv error");
                        continue;
                    }
                },
            };

            let wire = buf[..n].to_vec();
            let core = Arc::clone(self);
            let socket = Arc::clone(&socket);
            tokio::spawn(async move {
                if let Some(response) = core.handle_datagram(&wire).await {
                    if let Err(e) = socket.send_to(&response, client).await {
                        tracing::debug!(client = %client, error = %e, "dns reply send failed");
                    }
                }
            });
        }
        tracing::info!("dns front-end stopped");
        Ok(())
    }

    /// Process one wire-format query. `None` means the datagram was not a
    /// decodable DNS message and is dropped.
    pub async fn handle_datagram(self: &Arc<Self>, wire: &[u8]) -> Option<Vec<u8>> {
        let query = match Message::from_vec(wire) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(error = %e, "undecodable datagram dropped");
                return None;
            }
        };
        let response = self.handle_query(&query, wire).await;
        match response.to_vec() {
            Ok(encoded) => Some(encoded),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode dns response");
                None
            }
        }
    }

    async fn handle_query(self: &Arc<Self>, query: &Message, wire: &[u8]) -> Message {
        // Only the first question is examined; extras are ignored.
        let Some(question) = query.queries().first().cloned() else {
            return no_answer(query);
        };
        let qname = normalize_name(question.name());
        let qtype = question.query_type();
        tracing::debug!(name = %qname, qtype = %qtype, "dns question");

        match self.classify(&qname) {
            Route::Gated(resource_id) => {
                if !matches!(qtype, RecordType::A | RecordType::AAAA) {
                    tracing::debug!(resource = %resource_id, qtype = %qtype, "gated question type not admitted");
                    return no_answer(query);
                }
                self.handle_gated(query, &question, &resource_id).await
            }
            Route::Forward => self.handle_forward(query, wire).await,
        }
    }

    fn classify(&self, qname: &str) -> Route {
        match qname.strip_suffix(self.config.gate_suffix.as_str()) {
            Some(resource_id) if !resource_id.is_empty() => Route::Gated(resource_id.to_string()),
            _ => Route::Forward,
        }
    }

    async fn handle_gated(
        self: &Arc<Self>,
        query: &Message,
        question: &Query,
        resource_id: &str,
    ) -> Message {
        let core = Arc::clone(self);
        let loader_question = question.clone();
        let loader_key = resource_id.to_string();
        let outcome = self
            .cache
            .get_or_compute(resource_id, move || async move {
                core.knock_and_synthesize(&loader_key, &loader_question).await
            })
            .await;

        match outcome {
            Ok(Some(mut message)) => {
                // Cached messages are immutable; stamp the copy.
                message.set_id(query.id());
                message
            }
            Ok(None) => no_answer(query),
            Err(e) => {
                tracing::warn!(resource = %resource_id, error = %e, "gated resolution failed");
                no_answer(query)
            }
        }
    }

    /// The gated-path loader: knock, then build the answer from the first
    /// usable resource host. `None` is never cached.
    async fn knock_and_synthesize(
        &self,
        resource_id: &str,
        question: &Query,
    ) -> Option<(Message, u32)> {
        let Some(resource) = self.registry.lookup(resource_id) else {
            tracing::warn!(resource = %resource_id, "unknown resource");
            return None;
        };

        let ack = match self.knocker.request_grant(resource).await {
            Ok(ack) => ack,
            Err(e) => {
                tracing::warn!(resource = %resource_id, error = %e, "knock failed");
                return None;
            }
        };
        if !ack.granted() {
            return None;
        }

        let ttl = ack.open_time.saturating_sub(GRANT_TTL_SHAVE) as u32;

        for host in &ack.resource_host {
            if let Some(message) = self.synthesize_host(question, host, ttl).await {
                return Some((message, ttl));
            }
        }
        tracing::warn!(resource = %resource_id, hosts = ack.resource_host.len(), "no usable resource host");
        None
    }

    async fn synthesize_host(&self, question: &Query, host: &str, ttl: u32) -> Option<Message> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return answer_literal(question, ip, ttl);
        }
        self.chase_hostname(question, host, ttl).await
    }

    /// CNAME to `host`, then the upstream's answers for the same question
    /// type appended behind it.
    async fn chase_hostname(&self, question: &Query, host: &str, ttl: u32) -> Option<Message> {
        let upstream = self.upstream.as_ref()?;
        let target = Name::from_ascii(format!("{host}.")).ok()?;

        let response = match upstream.query(&target, question.query_type()).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(host = %host, error = %e, "upstream chase failed");
                return None;
            }
        };
        if response.answers().is_empty() {
            tracing::debug!(host = %host, "upstream chase returned no answers");
            return None;
        }

        let mut message = reply_skeleton(question);
        message.add_answer(Record::from_rdata(
            question.name().clone(),
            ttl,
            RData::CNAME(CNAME(target)),
        ));
        for record in response.answers() {
            // Chased answers must not outlive the grant window; AAAA keeps
            // the fixed header TTL so clients do not pin IPv6 indefinitely.
            let mut record = record.clone();
            let capped = if record.record_type() == RecordType::AAAA {
                AAAA_RECORD_TTL
            } else {
                record.ttl().min(ttl)
            };
            record.set_ttl(capped);
            message.add_answer(record);
        }
        Some(message)
    }

    async fn handle_forward(&self, query: &Message, wire: &[u8]) -> Message {
        let Some(upstream) = self.upstream.as_ref() else {
            return servfail(query);
        };
        match upstream.exchange_raw(wire).await {
            Ok(mut response) => {
                response.set_id(query.id());
                response
            }
            Err(e) => {
                tracing::warn!(error = %e, "upstream forward failed");
                servfail(query)
            }
        }
    }
}

fn normalize_name(name: &Name) -> String {
    name.to_string()
        .to_lowercase()
        .trim_end_matches('.')
        .to_string()
}

fn answer_literal(question: &Query, ip: IpAddr, ttl: u32) -> Option<Message> {
    let rdata = match (question.query_type(), ip) {
        (RecordType::A, IpAddr::V4(v4)) => RData::A(v4.into()),
        (RecordType::AAAA, IpAddr::V6(v6)) => RData::AAAA(v6.into()),
        _ => {
            tracing::debug!(host = %ip, qtype = %question.query_type(), "address family mismatch");
            return None;
        }
    };
    let record_ttl = if question.query_type() == RecordType::AAAA {
        AAAA_RECORD_TTL
    } else {
        ttl
    };
    let mut message = reply_skeleton(question);
    message.add_answer(Record::from_rdata(
        question.name().clone(),
        record_ttl,
        rdata,
    ));
    Some(message)
}

fn reply_skeleton(question: &Query) -> Message {
    let mut message = Message::new();
    message.set_message_type(MessageType::Response);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.set_recursion_available(true);
    message.set_response_code(ResponseCode::NoError);
    message.add_query(question.clone());
    message
}

/// Empty NOERROR carrying the query's id and question.
pub(crate) fn no_answer(query: &Message) -> Message {
    let mut message = Message::new();
    message.set_id(query.id());
    message.set_message_type(MessageType::Response);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(query.recursion_desired());
    message.set_recursion_available(true);
    message.set_response_code(ResponseCode::NoError);
    if let Some(question) = query.queries().first() {
        message.add_query(question.clone());
    }
    message
}

pub(crate) fn servfail(query: &Message) -> Message {
    let mut message = no_answer(query);
    message.set_response_code(ResponseCode::ServFail);
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_dot_and_case() {
        let name = Name::from_ascii("Demo.LATCH.").unwrap();
        assert_eq!(normalize_name(&name), "demo.latch");
    }

    #[test]
    fn literal_answer_rejects_wrong_family() {
        let question = Query::query(Name::from_ascii("demo.latch.").unwrap(), RecordType::AAAA);
        assert!(answer_literal(&question, "10.0.0.1".parse().unwrap(), 25).is_none());

        let question = Query::query(Name::from_ascii("demo.latch.").unwrap(), RecordType::A);
        assert!(answer_literal(&question, "2001:db8::1".parse().unwrap(), 25).is_none());
    }

    #[test]
    fn aaaa_record_ttl_is_pinned() {
        let question = Query::query(Name::from_ascii("demo.latch.").unwrap(), RecordType::AAAA);
        let message = answer_literal(&question, "2001:db8::1".parse().unwrap(), 25).unwrap();
        assert_eq!(message.answers()[0].ttl(), AAAA_RECORD_TTL);

        let question = Query::query(Name::from_ascii("demo.latch.").unwrap(), RecordType::A);
        let message = answer_literal(&question, "10.0.0.1".parse().unwrap(), 25).unwrap();
        assert_eq!(message.answers()[0].ttl(), 25);
    }

    #[test]
    fn no_answer_echoes_id_and_question() {
        let mut query = Message::new();
        query.set_id(0x4242);
        query.add_query(Query::query(
            Name::from_ascii("ghost.latch.").unwrap(),
            RecordType::A,
        ));

        let response = no_answer(&query);
        assert_eq!(response.id(), 0x4242);
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.answers().is_empty());
        assert_eq!(response.queries().len(), 1);
    }
}
