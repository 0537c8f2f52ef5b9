//! One-shot UDP exchanges with the configured upstream resolver.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use tokio::net::UdpSocket;

/// Deadline for a whole upstream exchange, send through receive.
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

const RESPONSE_BUF_LEN: usize = 4_096;

static QUERY_ID: AtomicU16 = AtomicU16::new(1);

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upstream exchange timed out")]
    Timeout,

    #[error("dns codec error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),
}

/// The upstream resolver endpoint. Cheap to clone.
#[derive(Debug, Clone, Copy)]
pub struct Upstream {
    addr: SocketAddr,
}

impl Upstream {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Proxy an already-encoded query verbatim and decode the reply.
    pub async fn exchange_raw(&self, wire: &[u8]) -> Result<Message, UpstreamError> {
        let exchange = async {
            let bind_addr: SocketAddr = if self.addr.is_ipv4() {
                "0.0.0.0:0".parse().unwrap()
            } else {
                "[::]:0".parse().unwrap()
            };
            let socket = UdpSocket::bind(bind_addr).await?;
            socket.connect(self.addr).await?;
            socket.send(wire).await?;
            let mut buf = vec![0u8; RESPONSE_BUF_LEN];
            let n = socket.recv(&mut buf).await?;
            Ok::<_, UpstreamError>(Message::from_vec(&buf[..n])?)
        };
        tokio::time::timeout(EXCHANGE_TIMEOUT, exchange)
            .await
            .map_err(|_| UpstreamError::Timeout)?
    }

    /// Build and exchange a fresh recursive query for `name`.
    pub async fn query(
        &self,
        name: &Name,
        record_type: RecordType,
    ) -> Result<Message, UpstreamError> {
        let mut message = Message::new();
        message.set_id(QUERY_ID.fetch_add(1, Ordering::Relaxed));
        message.set_message_type(MessageType::Query);
        message.set_op_code(OpCode::Query);
        message.set_recursion_desired(true);
        message.add_query(Query::query(name.clone(), record_type));
        let wire = message.to_vec()?;
        self.exchange_raw(&wire).await
    }
}
