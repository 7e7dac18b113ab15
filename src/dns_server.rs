//! Resolver for the container zone.
//!
//! [`ZoneResolver`] answers from the committed record store and is served
//! over UDP and TCP by hickory-server's `ServerFuture`. Queries are
//! handled as follows:
//!
//! * **Names under the domain suffix** (`web1.vexinet.local`): looked up
//!   in the record store; a hit returns an A or AAAA record with the
//!   container's IP and is written to the query log, a known name without
//!   a record of the queried type is NODATA, a miss is NXDOMAIN.
//! * **Single-label names** (`web1`): qualified with the suffix first.
//! * **Anything else**: forwarded to the system resolvers with
//!   `hickory-resolver` when forwarding is enabled, NXDOMAIN otherwise.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::proto::op::{Header, MessageType, OpCode, ResponseCode};
use hickory_server::proto::rr::rdata::{A, AAAA};
use hickory_server::proto::rr::{Name, RData, Record, RecordType};
use hickory_server::server::{
    Request, RequestHandler, ResponseHandler, ResponseInfo, ServerFuture,
};
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::Duration;

use crate::query_log::QueryLog;
use crate::store::RecordStore;

/// Timeout for idle TCP connections.
const TCP_TIMEOUT: Duration = Duration::from_secs(10);

/// TTL for answers relayed from upstream.
const FORWARD_TTL: u32 = 60;

/// How a query for one name is answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    /// The name is published; `ip` matches the query type.
    Found(IpAddr),
    /// The name exists but has no record of the queried type.
    NoData,
    NxDomain,
    /// Outside the zone; relay upstream.
    Forward,
}

pub struct ZoneResolver {
    suffix: String,
    store: Arc<RecordStore>,
    query_log: Arc<QueryLog>,
    ttl: u32,
    log_unresolved: bool,
    forwarder: Option<TokioAsyncResolver>,
}

impl ZoneResolver {
    pub fn new(
        store: Arc<RecordStore>,
        query_log: Arc<QueryLog>,
        ttl: u32,
        log_unresolved: bool,
    ) -> Self {
        Self {
            suffix: store.suffix().to_string(),
            store,
            query_log,
            ttl,
            log_unresolved,
            forwarder: None,
        }
    }

    /// Relay names outside the zone to the system resolvers.
    pub fn with_forwarding(mut self) -> anyhow::Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| anyhow::anyhow!("Failed to load system resolv.conf: {}", e))?;
        self.forwarder = Some(resolver);
        Ok(self)
    }

    fn in_zone(&self, name: &str) -> bool {
        name == self.suffix
            || name
                .strip_suffix(self.suffix.as_str())
                .is_some_and(|label| label.ends_with('.'))
    }

    /// Normalise a query name: lowercase, no trailing dot, single labels
    /// qualified with the suffix.
    pub fn qualify(&self, qname: &str) -> String {
        let name = qname.trim_end_matches('.').to_ascii_lowercase();
        if !name.is_empty() && !name.contains('.') {
            format!("{}.{}", name, self.suffix)
        } else {
            name
        }
    }

    /// Decide the answer for a qualified name. Only answers carrying an
    /// address are logged.
    pub fn answer(&self, name: &str, qtype: RecordType, client: IpAddr) -> Answer {
        if !self.in_zone(name) {
            if self.forwarder.is_some() {
                return Answer::Forward;
            }
            self.log_miss(name, client);
            return Answer::NxDomain;
        }
        if name == self.suffix {
            return Answer::NoData;
        }

        let Some(ip) = self.store.lookup(name) else {
            self.log_miss(name, client);
            return Answer::NxDomain;
        };

        match (ip, qtype) {
            (IpAddr::V4(_), RecordType::A | RecordType::ANY)
            | (IpAddr::V6(_), RecordType::AAAA | RecordType::ANY) => {
                self.query_log.record(client.to_string(), name);
                Answer::Found(ip)
            }
            _ => Answer::NoData,
        }
    }

    fn log_miss(&self, name: &str, client: IpAddr) {
        debug!("No record for {} (from {})", name, client);
        if self.log_unresolved {
            self.query_log.record(client.to_string(), name);
        }
    }

    async fn forward(&self, name: &str, qtype: RecordType, owner: &Name) -> (ResponseCode, Vec<Record>) {
        let Some(resolver) = self.forwarder.as_ref() else {
            return (ResponseCode::NXDomain, Vec::new());
        };
        match resolver.lookup_ip(name).await {
            Ok(lookup) => {
                let records = lookup
                    .iter()
                    .filter_map(|addr| ip_record(owner, addr, qtype, FORWARD_TTL))
                    .collect();
                (ResponseCode::NoError, records)
            }
            Err(e) => {
                warn!("Resolver lookup failed for {}: {}", name, e);
                (ResponseCode::ServFail, Vec::new())
            }
        }
    }
}

fn ip_record(owner: &Name, ip: IpAddr, qtype: RecordType, ttl: u32) -> Option<Record> {
    let rdata = match (ip, qtype) {
        (IpAddr::V4(v4), RecordType::A | RecordType::ANY) => RData::A(A(v4)),
        (IpAddr::V6(v6), RecordType::AAAA | RecordType::ANY) => RData::AAAA(AAAA(v6)),
        _ => return None,
    };
    Some(Record::from_rdata(owner.clone(), ttl, rdata))
}

/// Start the DNS server.
pub async fn run_dns_server(bind_addr: SocketAddr, resolver: ZoneResolver) -> anyhow::Result<()> {
    info!("DNS server starting on {}", bind_addr);

    let mut server = ServerFuture::new(resolver);

    // Register UDP listener.
    let udp = UdpSocket::bind(bind_addr).await?;
    server.register_socket(udp);

    // Register TCP listener.
    let tcp = TcpListener::bind(bind_addr).await?;
    server.register_listener(tcp, TCP_TIMEOUT);

    // Run the server until future resolves.
    server.block_until_done().await?;
    Ok(())
}

#[async_trait]
impl RequestHandler for ZoneResolver {
    async fn handle_request<R>(&self, request: &Request, mut response_handle: R) -> ResponseInfo
    where
        R: ResponseHandler + Send,
    {
        // Build response header
        let mut header = Header::response_from_request(request.header());
        header.set_recursion_available(self.forwarder.is_some());

        if request.header().message_type() != MessageType::Query
            || request.header().op_code() != OpCode::Query
        {
            header.set_response_code(ResponseCode::NotImp);
            return send(request, &mut response_handle, header, &[]).await;
        }

        let query = request.query();
        let owner: Name = query.name().clone().into();
        let qtype = query.query_type();
        let name = self.qualify(&owner.to_string());
        let client = request.src().ip();

        let (code, records) = match self.answer(&name, qtype, client) {
            Answer::Found(ip) => {
                header.set_authoritative(true);
                let records = ip_record(&owner, ip, qtype, self.ttl).into_iter().collect();
                (ResponseCode::NoError, records)
            }
            Answer::NoData => {
                header.set_authoritative(true);
                (ResponseCode::NoError, Vec::new())
            }
            Answer::NxDomain => {
                header.set_authoritative(self.in_zone(&name));
                (ResponseCode::NXDomain, Vec::new())
            }
            Answer::Forward => self.forward(&name, qtype, &owner).await,
        };

        header.set_response_code(code);
        send(request, &mut response_handle, header, &records).await
    }
}

async fn send<R: ResponseHandler>(
    request: &Request,
    response_handle: &mut R,
    header: Header,
    records: &[Record],
) -> ResponseInfo {
    let builder = MessageResponseBuilder::from_message_request(request);
    let response = builder.build(
        header,
        records.iter(),
        std::iter::empty(),
        std::iter::empty(),
        std::iter::empty(),
    );
    match response_handle.send_response(response).await {
        Ok(info) => info,
        Err(e) => {
            error!("Failed to send DNS response to {}: {}", request.src(), e);
            let mut header = Header::new();
            header.set_response_code(ResponseCode::ServFail);
            header.into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::container;
    use hickory_server::proto::op::{Message, Query};
    use tokio::time::timeout;

    const CLIENT: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(192, 168, 1, 20));

    fn resolver(log_unresolved: bool) -> (ZoneResolver, Arc<QueryLog>) {
        let store = Arc::new(RecordStore::new("vexinet.local"));
        let mut db = container("d1", "db", Some("10.0.0.3"));
        db.dns_enabled = false;
        store.replace(vec![
            container("w1", "web1", Some("10.0.0.2")),
            container("v6", "cache", Some("fd00::5")),
            container("n1", "noip", None),
            db,
        ]);
        let log = Arc::new(QueryLog::new(16));
        (
            ZoneResolver::new(store, Arc::clone(&log), 5, log_unresolved),
            log,
        )
    }

    #[test]
    fn resolves_enabled_container_with_address() {
        let (zone, log) = resolver(false);
        assert_eq!(
            zone.answer("web1.vexinet.local", RecordType::A, CLIENT),
            Answer::Found("10.0.0.2".parse().unwrap())
        );
        let logged = log.recent(1);
        assert_eq!(logged[0].domain, "web1.vexinet.local");
        assert_eq!(logged[0].ip_address, "192.168.1.20");
    }

    #[test]
    fn disabled_unknown_and_addressless_names_are_nxdomain() {
        let (zone, log) = resolver(false);
        for name in ["db.vexinet.local", "nope.vexinet.local", "noip.vexinet.local"] {
            assert_eq!(zone.answer(name, RecordType::A, CLIENT), Answer::NxDomain, "{name}");
        }
        assert!(log.is_empty());
    }

    #[test]
    fn misses_are_logged_when_configured() {
        let (zone, log) = resolver(true);
        zone.answer("nope.vexinet.local", RecordType::A, CLIENT);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn mismatched_type_is_nodata() {
        let (zone, log) = resolver(false);
        assert_eq!(
            zone.answer("web1.vexinet.local", RecordType::AAAA, CLIENT),
            Answer::NoData
        );
        assert!(log.is_empty());
        assert_eq!(
            zone.answer("cache.vexinet.local", RecordType::AAAA, CLIENT),
            Answer::Found("fd00::5".parse().unwrap())
        );
        assert_eq!(zone.answer("vexinet.local", RecordType::A, CLIENT), Answer::NoData);
    }

    #[test]
    fn outside_zone_without_forwarding_is_nxdomain() {
        let (zone, _) = resolver(false);
        assert_eq!(zone.answer("example.com", RecordType::A, CLIENT), Answer::NxDomain);
        // Suffix must match on a label boundary
        assert_eq!(
            zone.answer("web1.notvexinet.local", RecordType::A, CLIENT),
            Answer::NxDomain
        );
    }

    #[test]
    fn qualifies_single_labels() {
        let (zone, _) = resolver(false);
        assert_eq!(zone.qualify("WEB1."), "web1.vexinet.local");
        assert_eq!(zone.qualify("web1.vexinet.local."), "web1.vexinet.local");
    }

    fn query_bytes(id: u16, name: &str, qtype: RecordType) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_ascii(name).unwrap(), qtype));
        msg.to_vec().unwrap()
    }

    async fn exchange(client: &UdpSocket, server: SocketAddr, bytes: &[u8]) -> Message {
        client.send_to(bytes, server).await.unwrap();
        let mut buf = [0u8; 512];
        let (len, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .expect("no DNS response")
            .unwrap();
        Message::from_vec(&buf[..len]).unwrap()
    }

    #[tokio::test]
    async fn serves_udp_and_survives_malformed_packets() {
        let (zone, log) = resolver(false);
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = udp.local_addr().unwrap();
        let mut server = ServerFuture::new(zone);
        server.register_socket(udp);
        let handle = tokio::spawn(async move { server.block_until_done().await });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&[0xde, 0xad, 0xbe], addr).await.unwrap();

        let resp = exchange(&client, addr, &query_bytes(7, "web1.vexinet.local.", RecordType::A)).await;
        assert_eq!(resp.id(), 7);
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        assert_eq!(resp.answers().len(), 1);
        match resp.answers()[0].data() {
            Some(RData::A(a)) => assert_eq!(a.0, std::net::Ipv4Addr::new(10, 0, 0, 2)),
            other => panic!("unexpected answer {:?}", other),
        }
        assert_eq!(log.recent(1)[0].ip_address, "127.0.0.1");

        let resp = exchange(&client, addr, &query_bytes(8, "db.vexinet.local.", RecordType::A)).await;
        assert_eq!(resp.response_code(), ResponseCode::NXDomain);
        assert!(resp.answers().is_empty());

        handle.abort();
    }

    #[tokio::test]
    async fn serves_tcp() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpStream;

        let (zone, _) = resolver(false);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut server = ServerFuture::new(zone);
        server.register_listener(listener, TCP_TIMEOUT);
        let handle = tokio::spawn(async move { server.block_until_done().await });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let query = query_bytes(9, "cache.vexinet.local.", RecordType::AAAA);
        let mut framed = (query.len() as u16).to_be_bytes().to_vec();
        framed.extend_from_slice(&query);
        stream.write_all(&framed).await.unwrap();

        let mut len = [0u8; 2];
        timeout(Duration::from_secs(2), stream.read_exact(&mut len))
            .await
            .expect("no DNS response")
            .unwrap();
        let mut body = vec![0u8; u16::from_be_bytes(len) as usize];
        stream.read_exact(&mut body).await.unwrap();
        let resp = Message::from_vec(&body).unwrap();

        assert_eq!(resp.id(), 9);
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        match resp.answers()[0].data() {
            Some(RData::AAAA(aaaa)) => assert_eq!(aaaa.0, "fd00::5".parse::<std::net::Ipv6Addr>().unwrap()),
            other => panic!("unexpected answer {:?}", other),
        }

        handle.abort();
    }
}
