//! Shared test infrastructure for catalog and ingestion integration tests.

#![allow(dead_code)]

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{DNSClass, Name, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinDecoder, BinEncoder};
use hickory_server::authority::{Catalog, MessageRequest, MessageResponse};
use hickory_server::proto::rr::Record;
use hickory_server::proto::xfer::Protocol;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use stream_dns::config::DnsConfig;
use stream_dns::metrics::{self, Metric};
use stream_dns::record::StreamRecord;
use stream_dns::router::ZoneRouter;
use stream_dns::store::{RecordWriter, Store};

// --- Constants ---

pub const ZONE: &str = "example.com.";

/// Address every fake upstream answers with.
pub const UPSTREAM_IP: Ipv4Addr = Ipv4Addr::new(9, 9, 9, 9);

// --- TestResponseHandler ---

/// Captures the serialized DNS response for inspection in tests.
///
/// The response is serialized via `MessageResponse::destructive_emit()` and stored
/// as raw wire-format bytes, which can then be parsed with `Message::from_vec()`.
#[derive(Clone)]
pub struct TestResponseHandler {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl TestResponseHandler {
    pub fn new() -> Self {
        Self {
            buf: Arc::new(Mutex::new(Vec::with_capacity(512))),
        }
    }

    /// Parse the captured wire bytes into a `Message` for assertions.
    pub fn into_message(self) -> Message {
        let buf = self.buf.lock().unwrap();
        assert!(!buf.is_empty(), "no response was captured");
        Message::from_vec(&buf).expect("failed to parse captured DNS response")
    }
}

#[async_trait]
impl ResponseHandler for TestResponseHandler {
    async fn send_response<'a>(
        &mut self,
        response: MessageResponse<
            '_,
            'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
        >,
    ) -> io::Result<ResponseInfo> {
        let mut buf = self.buf.lock().unwrap();
        buf.clear();
        let mut encoder = BinEncoder::new(&mut *buf);
        encoder.set_max_size(u16::MAX);
        let info = response
            .destructive_emit(&mut encoder)
            .map_err(io::Error::other)?;
        Ok(info)
    }
}

// --- Fake upstream resolver ---

/// UDP resolver answering every query with one A record for [`UPSTREAM_IP`].
pub struct FakeUpstream {
    pub addr: SocketAddr,
    queries: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl FakeUpstream {
    pub async fn start() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let queries = Arc::new(AtomicUsize::new(0));

        let counter = queries.clone();
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            loop {
                let Ok((len, src)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);

                let Ok(request) = Message::from_vec(&buf[..len]) else {
                    continue;
                };
                let Some(query) = request.queries().first().cloned() else {
                    continue;
                };

                let mut response = Message::new();
                response
                    .set_id(request.id())
                    .set_message_type(MessageType::Response)
                    .set_op_code(OpCode::Query)
                    .set_recursion_desired(true)
                    .set_recursion_available(true)
                    .add_query(query.clone());
                if query.query_type() == RecordType::A {
                    response.add_answer(Record::from_rdata(
                        query.name().clone(),
                        60,
                        RData::A(A::from(UPSTREAM_IP)),
                    ));
                }
                let _ = socket.send_to(&response.to_vec().unwrap(), src).await;
            }
        });

        Self {
            addr,
            queries,
            handle,
        }
    }

    /// Number of queries received so far.
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl Drop for FakeUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// --- Config and store builders ---

pub fn test_dns_config(resolver_addr: Option<SocketAddr>) -> DnsConfig {
    DnsConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        udp: true,
        tcp: true,
        tcp_timeout_secs: 30,
        zones: vec![ZONE.to_string()],
        resolver_addr,
        resolver_timeout_ms: 1000,
    }
}

/// Store pre-filled with record payloads.
pub struct TestStoreBuilder {
    store: Store,
}

impl TestStoreBuilder {
    pub fn new() -> Self {
        Self {
            store: Store::in_memory().unwrap(),
        }
    }

    /// Store `records` under `key` as a JSON array.
    pub fn add(self, key: &str, records: &[StreamRecord]) -> Self {
        let value = serde_json::to_vec(records).unwrap();
        self.store.put(key.as_bytes(), &value).unwrap();
        self
    }

    /// Store one A record under its own name.
    pub fn add_a(self, name: &str, ip: &str) -> Self {
        self.add(name, &[StreamRecord::new(name, "A", ip, 300)])
    }

    pub fn build(self) -> Store {
        self.store
    }
}

/// Build a Catalog routing `ZONE` to `store` and everything else upstream.
pub fn build_catalog(config: &DnsConfig, store: Store) -> (Catalog, mpsc::Receiver<Metric>) {
    let (emitter, rx) = metrics::channel(1024);
    let router = ZoneRouter::new(config).expect("failed to build zone router");
    (router.catalog(store, emitter), rx)
}

// --- Query/Request construction ---

/// Build wire-format bytes for a DNS query.
pub fn build_query_bytes(name: &str, record_type: RecordType, id: u16) -> Vec<u8> {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    let mut query = Query::new();
    query.set_name(Name::from_ascii(name).unwrap());
    query.set_query_type(record_type);
    query.set_query_class(DNSClass::IN);
    msg.add_query(query);
    msg.to_vec().unwrap()
}

/// Build a full `Request` as if received over UDP.
pub fn build_request(name: &str, record_type: RecordType, id: u16) -> Request {
    let bytes = build_query_bytes(name, record_type, id);
    let mut decoder = BinDecoder::new(&bytes);
    let msg = MessageRequest::read(&mut decoder).expect("failed to parse MessageRequest");
    Request::new(msg, "10.0.0.1:12345".parse().unwrap(), Protocol::Udp)
}

/// Execute a query through the catalog and return the parsed response.
pub async fn execute_query(
    catalog: &Catalog,
    name: &str,
    record_type: RecordType,
    id: u16,
) -> Message {
    let request = build_request(name, record_type, id);
    let handler = TestResponseHandler::new();
    catalog.handle_request(&request, handler.clone()).await;
    handler.into_message()
}

// --- Response helpers ---

/// Extract A addresses from a response.
pub fn extract_a_ips(msg: &Message) -> Vec<Ipv4Addr> {
    msg.answers()
        .iter()
        .filter_map(|r| match r.data() {
            RData::A(a) => Some(Ipv4Addr::from(*a)),
            _ => None,
        })
        .collect()
}

/// Assert response code.
pub fn assert_response_code(msg: &Message, expected: ResponseCode) {
    assert_eq!(
        msg.response_code(),
        expected,
        "expected {:?}, got {:?}",
        expected,
        msg.response_code()
    );
}

/// Drain every metric emitted so far.
pub fn drain(rx: &mut mpsc::Receiver<Metric>) -> Vec<Metric> {
    let mut out = Vec::new();
    while let Ok(metric) = rx.try_recv() {
        out.push(metric);
    }
    out
}
