use crate::{
    error::Error,
    packet::{
        IPV4_HEADER_LEN, TCP_HEADER_LEN, TcpFlags, TcpPacketInfo, ack_packet, data_packet, fin_ack_packet, flags_string,
        parse_tcp_packet, rst_packet, syn_ack_packet,
    },
    packet_processor::{DEFAULT_MTU, PacketSink, ProtocolHandler},
    router::ConnectionRouter,
    session::{SessionStore, TcpState},
    session_info::IpProtocol,
};
use std::{
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc::{self, error::TrySendError},
};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Client segments queued per flow before new ones are dropped unacknowledged.
pub const PROXY_QUEUE_SEGMENTS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHandlerConfig {
    /// Bound on dialing the proxy plus the SOCKS5 exchange.
    pub handshake_timeout: Duration,
    /// Largest payload put into one synthesized segment.
    pub max_segment_payload: usize,
}

impl Default for TcpHandlerConfig {
    fn default() -> Self {
        Self::with_mtu(DEFAULT_MTU)
    }
}

impl TcpHandlerConfig {
    pub fn with_mtu(mtu: u16) -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_segment_payload: (mtu as usize).saturating_sub(IPV4_HEADER_LEN + TCP_HEADER_LEN).max(1),
        }
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

/// Terminates client TCP flows locally and carries their bytes over proxy streams.
///
/// The client's SYN is answered at once while the proxy connection is set up
/// in the background. There is no retransmission and no half-close; only
/// in-order payload is accepted and acknowledged.
#[derive(Clone)]
pub struct TcpHandler {
    store: Arc<SessionStore>,
    router: Arc<ConnectionRouter>,
    sink: PacketSink,
    config: TcpHandlerConfig,
    shutdown: CancellationToken,
    isn_base: u32,
    clock: Instant,
}

enum Segment {
    Accepted(usize, Vec<u8>),
    Duplicate(Vec<u8>),
    OutOfOrder,
    QueueFull,
    WriterGone,
}

/// Removes its session when dropped, whichever way the owning task ends.
struct SessionGuard {
    store: Arc<SessionStore>,
    key: String,
    id: u64,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.store.remove_session_if(&self.key, self.id) {
            log::debug!("{} relay finished, session #{} removed", self.key, self.id);
        }
    }
}

impl TcpHandler {
    pub fn new(
        store: Arc<SessionStore>,
        router: Arc<ConnectionRouter>,
        sink: PacketSink,
        config: TcpHandlerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let isn_base = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.subsec_nanos()).unwrap_or_default();
        Self {
            store,
            router,
            sink,
            config,
            shutdown,
            isn_base,
            clock: Instant::now(),
        }
    }

    /// Initial sequence number ticking every 4 microseconds from a random-ish base.
    fn next_isn(&self) -> u32 {
        let ticks = (self.clock.elapsed().as_micros() / 4) as u32;
        self.isn_base.wrapping_add(ticks)
    }

    async fn handle_syn(&self, tcp: &TcpPacketInfo) {
        let isn = self.next_isn();
        let client_next = tcp.sequence_number.wrapping_add(1);
        let created = self.store.create_session(tcp.session_info(), self.shutdown.child_token(), |s| {
            s.local_sequence_number = isn;
            s.remote_sequence_number = isn.wrapping_add(1);
            s.client_sequence_number = client_next;
            s.last_ack_number = client_next;
        });
        let Some(session) = created else {
            log::trace!("{} duplicate SYN ignored", tcp.connection_key());
            return;
        };

        let syn_ack = syn_ack_packet(&session);
        self.store.update_session(&session.key, |s| {
            s.local_sequence_number = s.local_sequence_number.wrapping_add(1);
        });
        log::debug!("{} SYN, replying SYN+ACK as session #{}", session.key, session.id);
        self.sink.send(syn_ack).await;

        let handler = self.clone();
        let tcp = *tcp;
        tokio::spawn(async move {
            let cancel = session.cancellation_token();
            tokio::select! {
                _ = cancel.cancelled() => log::trace!("{} handshake cancelled", session.key),
                _ = handler.establish(tcp, session.id) => {}
            }
        });
    }

    async fn establish(&self, tcp: TcpPacketInfo, id: u64) {
        let key = tcp.connection_key();
        let host = tcp.dst.ip().to_string();
        let port = tcp.dst.port();

        if !self.router.should_proxy(&host, port) {
            log::debug!(
                "{key} routed {:?}, direct connections are not implemented",
                self.router.decide(&host, port)
            );
            return;
        }

        let connected = match self.router.get_proxy_for_connection(&host, port) {
            Some(proxy) => tokio::time::timeout(self.config.handshake_timeout, proxy.connect(&host, port))
                .await
                .map_err(Error::from)
                .and_then(|r| r.map_err(Error::from)),
            None => Err(Error::from("no healthy proxy")),
        };

        match connected {
            Ok(stream) => self.on_established(&key, id, stream),
            Err(err) => {
                log::warn!("{key} proxy handshake failed: {err}");
                self.store.record_error();
                if let Some(session) = self.store.get_session(&key).filter(|s| s.id == id) {
                    self.sink.send(rst_packet(&session)).await;
                    self.store.remove_session_if(&key, id);
                }
            }
        }
    }

    fn on_established(&self, key: &str, id: u64, stream: TcpStream) {
        stream.set_nodelay(true).ok();
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::channel(PROXY_QUEUE_SEGMENTS);
        let cancel = self
            .store
            .update_session(key, |s| {
                (s.id == id).then(|| {
                    s.state = TcpState::Established;
                    s.is_established = true;
                    s.proxy_tx = Some(tx);
                    s.cancellation_token()
                })
            })
            .flatten();
        let Some(cancel) = cancel else {
            log::debug!("{key} closed before the proxy connected");
            return;
        };
        log::debug!("{key} established through proxy");

        tokio::spawn(self.clone().proxy_writer(key.to_string(), id, writer, rx, cancel.clone()));
        tokio::spawn(self.clone().relay(key.to_string(), id, reader, cancel));
    }

    /// Forwards client payload to the proxy in arrival order.
    async fn proxy_writer(
        self,
        key: String,
        id: u64,
        mut writer: OwnedWriteHalf,
        mut rx: mpsc::Receiver<Vec<u8>>,
        cancel: CancellationToken,
    ) {
        loop {
            let payload = tokio::select! {
                _ = cancel.cancelled() => break,
                payload = rx.recv() => match payload {
                    Some(payload) => payload,
                    None => break,
                },
            };
            if let Err(err) = writer.write_all(&payload).await {
                log::debug!("{key} write to proxy failed: {err}");
                self.store.record_error();
                self.store.remove_session_if(&key, id);
                break;
            }
            self.store.record_bytes(payload.len());
        }
        let _ = writer.shutdown().await;
    }

    /// Wraps bytes read from the proxy into segments for the client.
    async fn relay(self, key: String, id: u64, mut reader: OwnedReadHalf, cancel: CancellationToken) {
        let _guard = SessionGuard {
            store: self.store.clone(),
            key: key.clone(),
            id,
        };
        let mut buf = vec![0u8; self.config.max_segment_payload];
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = reader.read(&mut buf) => read,
            };
            let n = match read {
                Ok(0) => {
                    let fin = self
                        .store
                        .update_session(&key, |s| {
                            (s.id == id).then(|| {
                                let fin = fin_ack_packet(s);
                                s.remote_sequence_number = s.remote_sequence_number.wrapping_add(1);
                                s.state = TcpState::FinWait;
                                fin
                            })
                        })
                        .flatten();
                    if let Some(fin) = fin {
                        log::debug!("{key} proxy closed, sending FIN+ACK");
                        self.sink.send(fin).await;
                    }
                    break;
                }
                Ok(n) => n,
                Err(err) => {
                    log::debug!("{key} read from proxy failed: {err}");
                    self.store.record_error();
                    break;
                }
            };
            let segment = self
                .store
                .update_session(&key, |s| {
                    (s.id == id).then(|| {
                        let segment = data_packet(s, &buf[..n]);
                        s.remote_sequence_number = s.remote_sequence_number.wrapping_add(n as u32);
                        segment
                    })
                })
                .flatten();
            let Some(segment) = segment else {
                break;
            };
            self.store.record_bytes(n);
            if !self.sink.send(segment).await {
                break;
            }
        }
    }

    async fn handle_ack(&self, tcp: &TcpPacketInfo, datagram: &[u8]) {
        let key = tcp.connection_key();
        let known = self
            .store
            .update_session(&key, |s| s.client_sequence_number = tcp.sequence_number)
            .is_some();
        if !known {
            log::trace!("{key} {} for unknown session ignored", flags_string(tcp.flags));
            return;
        }
        if tcp.has(TcpFlags::FIN) || tcp.has(TcpFlags::RST) {
            self.handle_close(tcp);
        } else if tcp.payload_len > 0 {
            self.handle_data(tcp, datagram).await;
        }
    }

    async fn handle_data(&self, tcp: &TcpPacketInfo, datagram: &[u8]) {
        let key = tcp.connection_key();
        let payload = tcp.payload(datagram);
        let outcome = self
            .store
            .update_session(&key, |s| {
                if !s.is_established || s.state != TcpState::Established {
                    return None;
                }
                let offset = s.last_ack_number.wrapping_sub(tcp.sequence_number) as i32;
                if offset < 0 {
                    return Some(Segment::OutOfOrder);
                }
                let Some(fresh) = payload.get(offset as usize..).filter(|p| !p.is_empty()) else {
                    return Some(Segment::Duplicate(ack_packet(s)));
                };
                let Some(tx) = s.proxy_tx.as_ref() else {
                    return Some(Segment::WriterGone);
                };
                match tx.try_send(fresh.to_vec()) {
                    Ok(()) => {
                        let next = s.last_ack_number.wrapping_add(fresh.len() as u32);
                        s.last_ack_number = next;
                        s.client_sequence_number = next;
                        Some(Segment::Accepted(fresh.len(), ack_packet(s)))
                    }
                    Err(TrySendError::Full(_)) => Some(Segment::QueueFull),
                    Err(TrySendError::Closed(_)) => Some(Segment::WriterGone),
                }
            })
            .flatten();
        match outcome {
            Some(Segment::Accepted(n, ack)) => {
                log::trace!("{key} forwarded {n} bytes");
                self.sink.send(ack).await;
            }
            Some(Segment::Duplicate(ack)) => {
                log::trace!("{key} duplicate segment seq={}, re-acknowledging", tcp.sequence_number);
                self.sink.send(ack).await;
            }
            Some(Segment::OutOfOrder) => log::trace!("{key} segment seq={} ahead of stream dropped", tcp.sequence_number),
            Some(Segment::QueueFull) => log::trace!("{key} proxy queue full, segment seq={} dropped", tcp.sequence_number),
            Some(Segment::WriterGone) => {
                log::debug!("{key} proxy writer gone, dropping session");
                self.store.record_error();
                self.store.remove_session(&key);
            }
            None => log::trace!("{key} data before establishment ignored ({} bytes)", payload.len()),
        }
    }

    fn handle_close(&self, tcp: &TcpPacketInfo) {
        let key = tcp.connection_key();
        if let Some(session) = self.store.remove_session(&key) {
            log::debug!("{key} {} closed session #{}", flags_string(tcp.flags), session.id);
        }
    }
}

#[async_trait::async_trait]
impl ProtocolHandler for TcpHandler {
    fn protocol(&self) -> u8 {
        IpProtocol::TCP
    }

    async fn handle_packet(&self, datagram: &[u8]) -> bool {
        let Some(tcp) = parse_tcp_packet(datagram) else {
            return false;
        };
        log::trace!(
            "{} {} seq={} ack={} len={}",
            tcp.connection_key(),
            flags_string(tcp.flags),
            tcp.sequence_number,
            tcp.ack_number,
            tcp.payload_len
        );
        if tcp.has(TcpFlags::SYN) {
            self.handle_syn(&tcp).await;
        } else if tcp.has(TcpFlags::ACK) {
            self.handle_ack(&tcp, datagram).await;
        } else if tcp.has(TcpFlags::FIN) || tcp.has(TcpFlags::RST) {
            self.handle_close(&tcp);
        } else if tcp.payload_len > 0 {
            self.handle_data(&tcp, datagram).await;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::build_tcp_packet;
    use crate::router::{RoutingAction, RoutingRule};
    use std::net::SocketAddrV4;

    const CLIENT: &str = "10.0.0.2:5000";
    const SERVER: &str = "93.184.216.34:443";

    fn addr(s: &str) -> SocketAddrV4 {
        s.parse().unwrap()
    }

    fn handler_without_proxy() -> (TcpHandler, Arc<SessionStore>, mpsc::Receiver<Vec<u8>>) {
        let store = Arc::new(SessionStore::default());
        // Everything direct, so no handshake is attempted.
        let router = ConnectionRouter::empty();
        router.add_rule(RoutingRule::new("all", "*:*", RoutingAction::Direct, 0));
        let (sink, rx) = PacketSink::channel();
        let handler = TcpHandler::new(store.clone(), Arc::new(router), sink, TcpHandlerConfig::default(), CancellationToken::new());
        (handler, store, rx)
    }

    #[tokio::test]
    async fn syn_creates_one_session_and_answers() {
        let (handler, store, mut rx) = handler_without_proxy();
        let syn = build_tcp_packet(addr(CLIENT), addr(SERVER), 1000, 0, TcpFlags::SYN, &[]);

        assert!(handler.handle_packet(&syn).await);
        let reply = parse_tcp_packet(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply.flags, TcpFlags::SYN_ACK);
        assert_eq!(reply.ack_number, 1001);
        assert_eq!(reply.src, addr(SERVER));
        assert_eq!(reply.dst, addr(CLIENT));

        let key = format!("{CLIENT}->{SERVER}");
        let session = store.get_session(&key).unwrap();
        assert_eq!(session.state, TcpState::SynSent);
        assert_eq!(session.last_ack_number, 1001);
        assert_eq!(session.local_sequence_number, reply.sequence_number.wrapping_add(1));

        assert!(handler.handle_packet(&syn).await);
        assert_eq!(store.len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn fin_and_rst_remove_session() {
        let (handler, store, _rx) = handler_without_proxy();
        let key = format!("{CLIENT}->{SERVER}");
        for flags in [TcpFlags::FIN, TcpFlags::RST, TcpFlags::FIN_ACK, TcpFlags::RST_ACK] {
            handler.handle_packet(&build_tcp_packet(addr(CLIENT), addr(SERVER), 1, 0, TcpFlags::SYN, &[])).await;
            assert!(store.contains(&key));
            handler.handle_packet(&build_tcp_packet(addr(CLIENT), addr(SERVER), 2, 0, flags, &[])).await;
            assert!(!store.contains(&key), "flags {}", flags_string(flags));
        }
    }

    #[tokio::test]
    async fn ack_records_client_sequence() {
        let (handler, store, _rx) = handler_without_proxy();
        let key = format!("{CLIENT}->{SERVER}");
        handler.handle_packet(&build_tcp_packet(addr(CLIENT), addr(SERVER), 1, 0, TcpFlags::SYN, &[])).await;
        handler.handle_packet(&build_tcp_packet(addr(CLIENT), addr(SERVER), 77, 5, TcpFlags::ACK, &[])).await;
        assert_eq!(store.get_session(&key).unwrap().client_sequence_number, 77);

        // Data before the proxy is up is not forwarded.
        handler.handle_packet(&build_tcp_packet(addr(CLIENT), addr(SERVER), 77, 5, TcpFlags::PSH_ACK, b"early")).await;
        assert_eq!(store.get_session(&key).unwrap().client_sequence_number, 77);
    }

    #[tokio::test]
    async fn stray_packets_are_ignored() {
        let (handler, store, mut rx) = handler_without_proxy();
        handler.handle_packet(&build_tcp_packet(addr(CLIENT), addr(SERVER), 5, 5, TcpFlags::ACK, b"late")).await;
        assert!(store.is_empty());
        assert!(rx.try_recv().is_err());
        assert!(!handler.handle_packet(&[0x60, 0, 0, 0]).await);
    }

    fn establish_with_queue(store: &SessionStore, key: &str) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(PROXY_QUEUE_SEGMENTS);
        store.update_session(key, |s| {
            s.state = TcpState::Established;
            s.is_established = true;
            s.proxy_tx = Some(tx);
        });
        rx
    }

    fn acks(rx: &mut mpsc::Receiver<Vec<u8>>) -> Vec<TcpPacketInfo> {
        std::iter::from_fn(|| rx.try_recv().ok()).map(|p| parse_tcp_packet(&p).unwrap()).collect()
    }

    #[tokio::test]
    async fn stalled_proxy_stops_acknowledging() {
        let (handler, store, mut rx) = handler_without_proxy();
        let key = format!("{CLIENT}->{SERVER}");
        handler.handle_packet(&build_tcp_packet(addr(CLIENT), addr(SERVER), 1, 0, TcpFlags::SYN, &[])).await;
        rx.recv().await.unwrap();
        let mut proxy_rx = establish_with_queue(&store, &key);

        let chunk = [7u8; 1000];
        let mut seq = 2u32;
        for _ in 0..PROXY_QUEUE_SEGMENTS + 10 {
            handler.handle_packet(&build_tcp_packet(addr(CLIENT), addr(SERVER), seq, 0, TcpFlags::PSH_ACK, &chunk)).await;
            seq += chunk.len() as u32;
        }
        let accepted_end = 2 + (PROXY_QUEUE_SEGMENTS * chunk.len()) as u32;
        let sent = acks(&mut rx);
        assert_eq!(sent.len(), PROXY_QUEUE_SEGMENTS);
        assert_eq!(sent.last().unwrap().ack_number, accepted_end);
        assert_eq!(store.get_session(&key).unwrap().last_ack_number, accepted_end);

        // Once the proxy drains a segment the client's resend is taken.
        proxy_rx.recv().await.unwrap();
        handler.handle_packet(&build_tcp_packet(addr(CLIENT), addr(SERVER), accepted_end, 0, TcpFlags::PSH_ACK, &chunk)).await;
        let sent = acks(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].ack_number, accepted_end + 1000);
    }

    #[tokio::test]
    async fn client_bytes_are_forwarded_once_in_order() {
        let (handler, store, mut rx) = handler_without_proxy();
        let key = format!("{CLIENT}->{SERVER}");
        handler.handle_packet(&build_tcp_packet(addr(CLIENT), addr(SERVER), 1, 0, TcpFlags::SYN, &[])).await;
        rx.recv().await.unwrap();
        let mut proxy_rx = establish_with_queue(&store, &key);

        let send = |seq: u32, payload: &'static [u8]| {
            let handler = handler.clone();
            async move {
                handler.handle_packet(&build_tcp_packet(addr(CLIENT), addr(SERVER), seq, 0, TcpFlags::PSH_ACK, payload)).await;
            }
        };
        send(2, b"hello").await;
        send(2, b"hello world").await;
        send(2, b"hello").await;
        send(40, b"gap").await;

        let sent = acks(&mut rx);
        let numbers: Vec<u32> = sent.iter().map(|a| a.ack_number).collect();
        assert_eq!(numbers, [7, 13, 13]);
        assert_eq!(proxy_rx.try_recv().unwrap(), b"hello");
        assert_eq!(proxy_rx.try_recv().unwrap(), b" world");
        assert!(proxy_rx.try_recv().is_err());
    }

    #[test]
    fn segment_size_follows_mtu() {
        assert_eq!(TcpHandlerConfig::with_mtu(1500).max_segment_payload, 1460);
        assert_eq!(TcpHandlerConfig::with_mtu(20).max_segment_payload, 1);
    }
}
