//! Authority relaying names outside every configured zone to an upstream resolver.

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{LowerName, Name, RecordType};
use hickory_server::authority::{
    Authority, LookupControlFlow, LookupError, LookupOptions, LookupRecords, MessageRequest,
    UpdateResult, ZoneType,
};
use hickory_server::server::RequestInfo;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::authority::record_sets;
use crate::error::DnsError;
use crate::metrics::{self, Branch, MetricsEmitter, QueryResult, Timer};

/// Largest UDP answer accepted from upstream.
const MAX_UDP_RESPONSE: usize = 4096;

/// Catch-all authority at the root that forwards queries upstream.
///
/// Without an upstream every query is refused.
pub struct ForwardAuthority {
    origin: LowerName,
    upstream: Option<SocketAddr>,
    timeout: Duration,
    metrics: MetricsEmitter,
    next_id: AtomicU16,
}

impl ForwardAuthority {
    /// Create a forwarder for `upstream`, bounding each exchange by `timeout`.
    pub fn new(upstream: Option<SocketAddr>, timeout: Duration, metrics: MetricsEmitter) -> Self {
        Self {
            origin: LowerName::from(Name::root()),
            upstream,
            timeout,
            metrics,
            next_id: AtomicU16::new(1),
        }
    }

    /// Configured upstream resolver.
    pub fn upstream(&self) -> Option<SocketAddr> {
        self.upstream
    }

    /// Send `query` upstream over UDP, retrying over TCP when the answer is truncated.
    pub async fn exchange(&self, upstream: SocketAddr, query: Query) -> Result<Message, DnsError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut request = Message::new();
        request
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(query);
        let wire = request.to_vec()?;

        let response = timeout(self.timeout, exchange_udp(upstream, &wire, id))
            .await
            .map_err(|_| DnsError::UpstreamTimeout(upstream))??;

        if response.truncated() {
            trace!(upstream = %upstream, "Response truncated, retrying with TCP");
            return timeout(self.timeout, exchange_tcp(upstream, &wire))
                .await
                .map_err(|_| DnsError::UpstreamTimeout(upstream))?;
        }

        Ok(response)
    }
}

async fn exchange_udp(upstream: SocketAddr, wire: &[u8], id: u16) -> Result<Message, DnsError> {
    let local: SocketAddr = if upstream.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(upstream).await?;
    socket.send(wire).await?;

    let mut buf = vec![0u8; MAX_UDP_RESPONSE];
    loop {
        let len = socket.recv(&mut buf).await?;
        let response = match Message::from_vec(&buf[..len]) {
            Ok(response) => response,
            Err(e) => {
                debug!(len, "ignoring malformed upstream answer: {}", e);
                continue;
            }
        };
        if response.id() == id {
            return Ok(response);
        }
        debug!(expected = id, got = response.id(), "ignoring stale upstream answer");
    }
}

async fn exchange_tcp(upstream: SocketAddr, wire: &[u8]) -> Result<Message, DnsError> {
    let len = u16::try_from(wire.len())
        .map_err(|_| DnsError::Io(io::Error::new(io::ErrorKind::InvalidInput, "query too large")))?;

    let mut stream = TcpStream::connect(upstream).await?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(wire).await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
    stream.read_exact(&mut buf).await?;

    Ok(Message::from_vec(&buf)?)
}

#[async_trait]
impl Authority for ForwardAuthority {
    type Lookup = LookupRecords;

    fn zone_type(&self) -> ZoneType {
        ZoneType::External
    }

    fn is_axfr_allowed(&self) -> bool {
        false
    }

    fn origin(&self) -> &LowerName {
        &self.origin
    }

    async fn lookup(
        &self,
        name: &LowerName,
        rtype: RecordType,
        lookup_options: LookupOptions,
    ) -> LookupControlFlow<Self::Lookup> {
        let timer = Timer::start();
        let rtype_str = rtype.to_string();

        let (result, outcome) = match self.upstream {
            None => {
                debug!(name = %name, "no upstream resolver, refusing");
                (
                    Err(LookupError::ResponseCode(ResponseCode::Refused)),
                    QueryResult::Refused,
                )
            }
            Some(upstream) => {
                trace!(name = %name, rtype = ?rtype, upstream = %upstream, "forwarding query");
                let query = Query::query(Name::from(name.clone()), rtype);

                match self.exchange(upstream, query).await {
                    Ok(mut response) => match response.response_code() {
                        ResponseCode::NoError => {
                            let answers = response.take_answers();
                            if answers.is_empty() {
                                (Ok(LookupRecords::Empty), QueryResult::NoData)
                            } else {
                                debug!(name = %name, count = answers.len(), "relaying upstream answers");
                                (
                                    Ok(LookupRecords::many(lookup_options, record_sets(answers))),
                                    QueryResult::Success,
                                )
                            }
                        }
                        ResponseCode::NXDomain => (
                            Err(LookupError::ResponseCode(ResponseCode::NXDomain)),
                            QueryResult::NxDomain,
                        ),
                        code => {
                            debug!(name = %name, rcode = ?code, "upstream returned an error");
                            (Err(LookupError::ResponseCode(code)), QueryResult::Error)
                        }
                    },
                    Err(e) => {
                        warn!(name = %name, upstream = %upstream, "forwarding failed: {}", e);
                        (
                            Err(LookupError::from(io::Error::other(e.to_string()))),
                            QueryResult::Error,
                        )
                    }
                }
            }
        };

        metrics::record_query(&self.metrics, Branch::Forward, &rtype_str, outcome, timer.elapsed());

        LookupControlFlow::Break(result)
    }

    async fn search(
        &self,
        request_info: RequestInfo<'_>,
        lookup_options: LookupOptions,
    ) -> LookupControlFlow<Self::Lookup> {
        self.lookup(
            request_info.query.name(),
            request_info.query.query_type(),
            lookup_options,
        )
        .await
    }

    async fn get_nsec_records(
        &self,
        _name: &LowerName,
        _lookup_options: LookupOptions,
    ) -> LookupControlFlow<Self::Lookup> {
        LookupControlFlow::Break(Err(LookupError::ResponseCode(ResponseCode::NoError)))
    }

    async fn update(&self, _update: &MessageRequest) -> UpdateResult<bool> {
        Err(ResponseCode::NotImp)
    }
}
