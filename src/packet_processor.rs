use crate::{
    error::Result,
    packet::{parse_ip_packet, split_datagrams},
    session::SessionStore,
    session_info::IpProtocol,
};
use std::{
    collections::HashMap,
    fmt::Write as _,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering::Relaxed},
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MTU: u16 = 1500;
const SINK_CAPACITY: usize = 1024;
const READ_BUFFER_SIZE: usize = u16::MAX as usize;
const READ_BACKOFF: Duration = Duration::from_millis(10);

/// Handle for queuing complete datagrams towards the virtual interface.
///
/// All writers share one channel drained by a single task, so datagrams
/// are never interleaved on the device.
#[derive(Debug, Clone)]
pub struct PacketSink {
    tx: mpsc::Sender<Vec<u8>>,
}

impl PacketSink {
    pub fn channel() -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(SINK_CAPACITY);
        (Self { tx }, rx)
    }

    /// Returns false once the writer task is gone.
    pub async fn send(&self, datagram: Vec<u8>) -> bool {
        self.tx.send(datagram).await.is_ok()
    }
}

#[async_trait::async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// IP protocol number served by this handler.
    fn protocol(&self) -> u8;

    /// Returns false when the datagram was not understood.
    async fn handle_packet(&self, datagram: &[u8]) -> bool;
}

#[derive(Debug, Default)]
struct Counters {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    packets_written: AtomicU64,
    dropped: AtomicU64,
}

/// Reads datagrams from the virtual interface and dispatches them by protocol.
pub struct PacketProcessor {
    handlers: HashMap<u8, Arc<dyn ProtocolHandler>>,
    store: Arc<SessionStore>,
    mtu: u16,
    running: AtomicBool,
    counters: Counters,
}

impl PacketProcessor {
    pub fn new(store: Arc<SessionStore>, mtu: u16) -> Self {
        Self {
            handlers: HashMap::new(),
            store,
            mtu,
            running: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn ProtocolHandler>) {
        log::debug!("Registered handler for {}", IpProtocol::from(handler.protocol()));
        self.handlers.insert(handler.protocol(), handler);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Relaxed)
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Dispatches one datagram. Anything unparseable or unhandled is dropped.
    pub async fn process_packet(&self, datagram: &[u8]) {
        self.store.record_packet();
        let Some(info) = parse_ip_packet(datagram) else {
            self.counters.dropped.fetch_add(1, Relaxed);
            return;
        };
        match self.handlers.get(&info.protocol.number()) {
            Some(handler) => {
                if !handler.handle_packet(datagram).await {
                    self.counters.dropped.fetch_add(1, Relaxed);
                }
            }
            None => {
                log::trace!("No handler for {} packet {}", info.protocol, info.connection_key());
                self.counters.dropped.fetch_add(1, Relaxed);
            }
        }
    }

    /// Pumps the device until `shutdown` fires or the device closes.
    ///
    /// `outbound` is the receiving end of the [`PacketSink`] handed to the
    /// protocol handlers; this call owns the only writer of `device`.
    pub async fn run<D>(self: Arc<Self>, device: D, outbound: mpsc::Receiver<Vec<u8>>, shutdown: CancellationToken) -> Result<()>
    where
        D: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, writer) = tokio::io::split(device);
        self.running.store(true, Relaxed);
        let writer_task = tokio::spawn(self.clone().write_loop(writer, outbound, shutdown.clone()));
        log::info!("Packet processor started, mtu {}", self.mtu);

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let read = tokio::select! {
                _ = shutdown.cancelled() => break,
                read = reader.read(&mut buf) => read,
            };
            match read {
                Ok(0) => {
                    log::info!("Virtual interface closed");
                    break;
                }
                Ok(n) => {
                    self.counters.bytes_read.fetch_add(n as u64, Relaxed);
                    for datagram in split_datagrams(&buf[..n]) {
                        self.process_packet(datagram).await;
                    }
                }
                Err(err) if is_fatal(&err) => {
                    log::error!("Virtual interface read failed: {err}");
                    break;
                }
                Err(err) => {
                    log::debug!("Virtual interface read error: {err}");
                    self.store.record_error();
                    tokio::time::sleep(READ_BACKOFF).await;
                }
            }
        }

        self.running.store(false, Relaxed);
        writer_task.abort();
        log::info!("Packet processor stopped");
        Ok(())
    }

    async fn write_loop<W>(self: Arc<Self>, mut writer: W, mut outbound: mpsc::Receiver<Vec<u8>>, shutdown: CancellationToken)
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            let datagram = tokio::select! {
                _ = shutdown.cancelled() => break,
                datagram = outbound.recv() => match datagram {
                    Some(datagram) => datagram,
                    None => break,
                },
            };
            if let Err(err) = writer.write_all(&datagram).await {
                self.store.record_error();
                if is_fatal(&err) {
                    log::error!("Virtual interface write failed: {err}");
                    break;
                }
                log::debug!("Virtual interface write error: {err}");
                continue;
            }
            if let Err(err) = writer.flush().await {
                log::debug!("Virtual interface flush error: {err}");
            }
            self.counters.bytes_written.fetch_add(datagram.len() as u64, Relaxed);
            self.counters.packets_written.fetch_add(1, Relaxed);
        }
        log::trace!("Virtual interface writer exited");
    }

    pub fn stats(&self) -> String {
        let mut protocols: Vec<String> = self.handlers.keys().map(|p| IpProtocol::from(*p).to_string()).collect();
        protocols.sort();
        let mut out = String::new();
        let _ = writeln!(out, "=== Packet Processor Stats ===");
        let _ = writeln!(out, "Running: {}", self.is_running());
        let _ = writeln!(out, "Handlers: {}", protocols.join(", "));
        let _ = writeln!(out, "Bytes read: {}", self.counters.bytes_read.load(Relaxed));
        let _ = writeln!(out, "Bytes written: {}", self.counters.bytes_written.load(Relaxed));
        let _ = writeln!(out, "Packets written: {}", self.counters.packets_written.load(Relaxed));
        let _ = writeln!(out, "Packets dropped: {}", self.counters.dropped.load(Relaxed));
        out
    }
}

fn is_fatal(err: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(err.kind(), BrokenPipe | NotConnected | UnexpectedEof | ConnectionAborted | ConnectionReset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{TcpFlags, build_tcp_packet};
    use std::sync::atomic::AtomicUsize;

    struct Counting(AtomicUsize);

    #[async_trait::async_trait]
    impl ProtocolHandler for Counting {
        fn protocol(&self) -> u8 {
            IpProtocol::TCP
        }

        async fn handle_packet(&self, _datagram: &[u8]) -> bool {
            self.0.fetch_add(1, Relaxed);
            true
        }
    }

    #[tokio::test]
    async fn dispatches_by_protocol() {
        let store = Arc::new(SessionStore::default());
        let handler = Arc::new(Counting(AtomicUsize::new(0)));
        let mut processor = PacketProcessor::new(store.clone(), DEFAULT_MTU);
        processor.register_handler(handler.clone());

        let tcp = build_tcp_packet("10.0.0.2:5000".parse().unwrap(), "1.1.1.1:80".parse().unwrap(), 1, 0, TcpFlags::SYN, &[]);
        let mut udp = tcp.clone();
        udp[9] = IpProtocol::UDP;
        let mut v6 = vec![0u8; 40];
        v6[0] = 0x60;

        processor.process_packet(&tcp).await;
        processor.process_packet(&udp).await;
        processor.process_packet(&v6).await;

        assert_eq!(handler.0.load(Relaxed), 1);
        assert_eq!(store.stats().packets_processed, 3);
        assert!(processor.stats().contains("Packets dropped: 2"));
    }
}
