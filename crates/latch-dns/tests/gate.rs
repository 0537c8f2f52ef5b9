//! End-to-end scenarios for the DNS front-end, driven through the wire
//! codec with a scripted knocker and a mock upstream resolver.

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::net::UdpSocket;

use latch_agent::AgentError;
use latch_common::{KnockAck, Resource};
use latch_dns::{DnsConfig, DnsCore, Knocker};
use latch_registry::Registry;

// ── Scripted knocker ────────────────────────────────────────────────

struct MockKnocker {
    ack: Mutex<Option<KnockAck>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl MockKnocker {
    fn granting(open_time: u64, hosts: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            ack: Mutex::new(Some(KnockAck {
                err_code: "0".into(),
                err_msg: String::new(),
                open_time,
                resource_host: hosts.iter().map(|h| h.to_string()).collect(),
            })),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    fn denying(err_code: &str, err_msg: &str) -> Arc<Self> {
        Arc::new(Self {
            ack: Mutex::new(Some(KnockAck {
                err_code: err_code.into(),
                err_msg: err_msg.into(),
                open_time: 0,
                resource_host: Vec::new(),
            })),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    fn with_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            ack: Mutex::new(self.ack.lock().unwrap().clone()),
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Knocker for MockKnocker {
    fn request_grant(
        &self,
        _resource: Arc<Resource>,
    ) -> impl Future<Output = Result<KnockAck, AgentError>> + Send {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let ack = self.ack.lock().unwrap().clone();
        let delay = self.delay;
        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            ack.ok_or(AgentError::Timeout)
        }
    }
}

// ── Mock upstream resolver ──────────────────────────────────────────

async fn spawn_upstream(records: Vec<(&str, RecordType, IpAddr)>) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let table: HashMap<(String, RecordType), IpAddr> = records
        .into_iter()
        .map(|(name, rtype, ip)| ((name.to_string(), rtype), ip))
        .collect();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 4_096];
        loop {
            let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(request) = Message::from_vec(&buf[..n]) else {
                continue;
            };
            let Some(question) = request.queries().first().cloned() else {
                continue;
            };
            let qname = question
                .name()
                .to_string()
                .to_lowercase()
                .trim_end_matches('.')
                .to_string();

            let mut response = Message::new();
            response.set_id(request.id());
            response.set_message_type(MessageType::Response);
            response.set_op_code(OpCode::Query);
            response.set_recursion_desired(true);
            response.set_recursion_available(true);
            response.add_query(question.clone());
            match table.get(&(qname, question.query_type())) {
                Some(ip) => {
                    response.add_answer(Record::from_rdata(
                        question.name().clone(),
                        300,
                        RData::from(*ip),
                    ));
                }
                None => {
                    response.set_response_code(ResponseCode::NXDomain);
                }
            }
            let _ = socket.send_to(&response.to_vec().unwrap(), from).await;
        }
    });
    addr
}

// ── Fixtures ────────────────────────────────────────────────────────

fn demo_registry(test: &str) -> Arc<Registry> {
    let dir = std::env::temp_dir().join(format!("latch-gate-{test}-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path: PathBuf = dir.join("resources.toml");
    std::fs::write(
        &path,
        r#"
        [[resources]]
        authServiceId = "ap1"
        resourceId = "demo"
        serverIp = "10.0.0.1"
        serverPort = 62206
        "#,
    )
    .unwrap();
    Registry::load(path)
}

fn core_with(
    test: &str,
    knocker: Arc<MockKnocker>,
    upstream: Option<SocketAddr>,
) -> Arc<DnsCore<MockKnocker>> {
    let config = DnsConfig {
        upstream,
        ..DnsConfig::default()
    };
    Arc::new(DnsCore::new(config, demo_registry(test), knocker))
}

fn query(id: u16, name: &str, record_type: RecordType) -> Vec<u8> {
    let mut message = Message::new();
    message.set_id(id);
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(
        Name::from_ascii(format!("{name}.")).unwrap(),
        record_type,
    ));
    message.to_vec().unwrap()
}

fn parse(wire: &[u8]) -> Message {
    Message::from_vec(wire).unwrap()
}

fn answer_ip(record: &Record) -> Option<IpAddr> {
    match record.data() {
        RData::A(a) => Some(IpAddr::V4(a.0)),
        RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
        _ => None,
    }
}

// ── Seed scenarios ──────────────────────────────────────────────────

#[tokio::test]
async fn plain_forward_proxies_upstream_answer() {
    let upstream = spawn_upstream(vec![(
        "www.example.com",
        RecordType::A,
        "93.184.216.34".parse().unwrap(),
    )])
    .await;
    let knocker = MockKnocker::granting(30, &["10.0.0.1"]);
    let core = core_with("forward", Arc::clone(&knocker), Some(upstream));

    let wire = query(0x1111, "www.example.com", RecordType::A);
    let response = parse(&core.handle_datagram(&wire).await.unwrap());

    assert_eq!(response.id(), 0x1111);
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert_eq!(response.answers().len(), 1);
    assert_eq!(
        answer_ip(&response.answers()[0]).unwrap(),
        "93.184.216.34".parse::<IpAddr>().unwrap()
    );
    assert_eq!(knocker.calls(), 0);
}

#[tokio::test]
async fn gated_ip_literal_answers_with_grant_ttl() {
    let knocker = MockKnocker::granting(30, &["10.0.0.1"]);
    let core = core_with("literal", Arc::clone(&knocker), None);

    let wire = query(7, "demo.latch", RecordType::A);
    let response = parse(&core.handle_datagram(&wire).await.unwrap());

    assert_eq!(response.id(), 7);
    assert_eq!(response.answers().len(), 1);
    let record = &response.answers()[0];
    assert_eq!(record.ttl(), 25);
    assert_eq!(
        answer_ip(record).unwrap(),
        "10.0.0.1".parse::<IpAddr>().unwrap()
    );
    assert_eq!(knocker.calls(), 1);
}

#[tokio::test]
async fn repeat_gated_query_is_served_from_cache() {
    let knocker = MockKnocker::granting(30, &["10.0.0.1"]);
    let core = core_with("cached", Arc::clone(&knocker), None);

    let first = parse(
        &core
            .handle_datagram(&query(7, "demo.latch", RecordType::A))
            .await
            .unwrap(),
    );
    let second = parse(
        &core
            .handle_datagram(&query(8, "demo.latch", RecordType::A))
            .await
            .unwrap(),
    );

    assert_eq!(knocker.calls(), 1);
    assert_eq!(first.id(), 7);
    assert_eq!(second.id(), 8);

    // Byte-equal modulo the transaction id.
    let mut a = first;
    let mut b = second;
    a.set_id(0);
    b.set_id(0);
    assert_eq!(a.to_vec().unwrap(), b.to_vec().unwrap());
}

#[tokio::test]
async fn gated_hostname_is_chased_through_upstream() {
    let upstream = spawn_upstream(vec![(
        "backend.example.com",
        RecordType::A,
        "203.0.113.5".parse().unwrap(),
    )])
    .await;
    let knocker = MockKnocker::granting(30, &["backend.example.com"]);
    let core = core_with("chase", Arc::clone(&knocker), Some(upstream));

    let wire = query(9, "demo.latch", RecordType::A);
    let response = parse(&core.handle_datagram(&wire).await.unwrap());

    assert_eq!(response.answers().len(), 2);
    let cname = &response.answers()[0];
    assert_eq!(cname.ttl(), 25);
    match cname.data() {
        RData::CNAME(target) => {
            assert_eq!(target.0.to_string().to_lowercase(), "backend.example.com.");
        }
        other => panic!("expected CNAME, got {other:?}"),
    }
    let chased = &response.answers()[1];
    assert_eq!(chased.ttl(), 25);
    assert_eq!(
        answer_ip(chased).unwrap(),
        "203.0.113.5".parse::<IpAddr>().unwrap()
    );
}

#[tokio::test]
async fn chased_aaaa_pins_record_ttl_but_caches_for_the_grant() {
    let upstream = spawn_upstream(vec![(
        "backend.example.com",
        RecordType::AAAA,
        "2001:db8::5".parse().unwrap(),
    )])
    .await;
    // openTime 6 leaves a 1-second grant window after the shave.
    let knocker = MockKnocker::granting(6, &["backend.example.com"]);
    let core = core_with("chase-aaaa", Arc::clone(&knocker), Some(upstream));

    let response = parse(
        &core
            .handle_datagram(&query(10, "demo.latch", RecordType::AAAA))
            .await
            .unwrap(),
    );
    assert_eq!(response.answers().len(), 2);
    let cname = &response.answers()[0];
    assert_eq!(cname.ttl(), 1);
    let chased = &response.answers()[1];
    assert_eq!(chased.record_type(), RecordType::AAAA);
    assert_eq!(chased.ttl(), 3600);
    assert_eq!(
        answer_ip(chased).unwrap(),
        "2001:db8::5".parse::<IpAddr>().unwrap()
    );

    // Within the grant window the answer is served from cache.
    let repeat = parse(
        &core
            .handle_datagram(&query(11, "demo.latch", RecordType::AAAA))
            .await
            .unwrap(),
    );
    assert_eq!(repeat.answers()[1].ttl(), 3600);
    assert_eq!(knocker.calls(), 1);

    // Past the grant window the entry has expired and the gate re-knocks.
    tokio::time::sleep(Duration::from_millis(1_300)).await;
    core.handle_datagram(&query(12, "demo.latch", RecordType::AAAA))
        .await
        .unwrap();
    assert_eq!(knocker.calls(), 2);
}

#[tokio::test]
async fn unknown_resource_gets_empty_noerror_without_knock() {
    let knocker = MockKnocker::granting(30, &["10.0.0.1"]);
    let core = core_with("unknown", Arc::clone(&knocker), None);

    let wire = query(3, "ghost.latch", RecordType::A);
    let response = parse(&core.handle_datagram(&wire).await.unwrap());

    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert!(response.answers().is_empty());
    assert_eq!(knocker.calls(), 0);
}

#[tokio::test]
async fn fifty_concurrent_queries_trigger_one_knock() {
    let knocker = MockKnocker::granting(30, &["10.0.0.1"]).with_delay(Duration::from_millis(100));
    let core = core_with("singleflight", Arc::clone(&knocker), None);

    let mut handles = Vec::new();
    for i in 0..50u16 {
        let core = Arc::clone(&core);
        handles.push(tokio::spawn(async move {
            core.handle_datagram(&query(i, "demo.latch", RecordType::A))
                .await
                .unwrap()
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        let response = parse(&handle.await.unwrap());
        assert_eq!(response.id(), i as u16);
        assert_eq!(response.answers().len(), 1, "query {i} must carry the answer");
    }
    assert_eq!(knocker.calls(), 1);
}

#[tokio::test]
async fn denied_grant_is_not_cached_and_retries() {
    let knocker = MockKnocker::denying("ERR_AUTH", "denied");
    let core = core_with("denied", Arc::clone(&knocker), None);

    for id in [4u16, 5] {
        let response = parse(
            &core
                .handle_datagram(&query(id, "demo.latch", RecordType::A))
                .await
                .unwrap(),
        );
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.answers().is_empty());
    }
    assert_eq!(knocker.calls(), 2);
}

// ── Boundary behaviors ──────────────────────────────────────────────

#[tokio::test]
async fn gated_txt_question_skips_the_knock() {
    let knocker = MockKnocker::granting(30, &["10.0.0.1"]);
    let core = core_with("txt", Arc::clone(&knocker), None);

    let wire = query(6, "demo.latch", RecordType::TXT);
    let response = parse(&core.handle_datagram(&wire).await.unwrap());

    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert!(response.answers().is_empty());
    assert_eq!(knocker.calls(), 0);
}

#[tokio::test]
async fn wrong_family_literal_yields_empty_answer() {
    let knocker = MockKnocker::granting(30, &["10.0.0.1"]);
    let core = core_with("family", Arc::clone(&knocker), None);

    let wire = query(6, "demo.latch", RecordType::AAAA);
    let response = parse(&core.handle_datagram(&wire).await.unwrap());

    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert!(response.answers().is_empty());
    assert_eq!(knocker.calls(), 1);
}

#[tokio::test]
async fn short_grant_answers_but_never_caches() {
    let knocker = MockKnocker::granting(5, &["10.0.0.1"]);
    let core = core_with("shortgrant", Arc::clone(&knocker), None);

    for id in [1u16, 2] {
        let response = parse(
            &core
                .handle_datagram(&query(id, "demo.latch", RecordType::A))
                .await
                .unwrap(),
        );
        assert_eq!(response.answers().len(), 1);
        assert_eq!(response.answers()[0].ttl(), 0);
    }
    assert_eq!(knocker.calls(), 2);
}

#[tokio::test]
async fn empty_host_list_yields_empty_answer() {
    let knocker = MockKnocker::granting(30, &[]);
    let core = core_with("nohosts", Arc::clone(&knocker), None);

    let response = parse(
        &core
            .handle_datagram(&query(1, "demo.latch", RecordType::A))
            .await
            .unwrap(),
    );
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert!(response.answers().is_empty());
}

#[tokio::test]
async fn second_host_is_tried_when_the_first_is_unusable() {
    let knocker = MockKnocker::granting(30, &["2001:db8::1", "10.0.0.7"]);
    let core = core_with("fallback", Arc::clone(&knocker), None);

    let response = parse(
        &core
            .handle_datagram(&query(1, "demo.latch", RecordType::A))
            .await
            .unwrap(),
    );
    assert_eq!(response.answers().len(), 1);
    assert_eq!(
        answer_ip(&response.answers()[0]).unwrap(),
        "10.0.0.7".parse::<IpAddr>().unwrap()
    );
}

#[tokio::test]
async fn forward_without_upstream_returns_servfail() {
    let knocker = MockKnocker::granting(30, &["10.0.0.1"]);
    let core = core_with("noupstream", knocker, None);

    let wire = query(2, "www.example.com", RecordType::A);
    let response = parse(&core.handle_datagram(&wire).await.unwrap());
    assert_eq!(response.response_code(), ResponseCode::ServFail);
    assert_eq!(response.id(), 2);
}
