use std::{
    fmt::Write as _,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

pub use {
    args::{ArgVerbosity, Args},
    error::{BoxError, Error, Result},
    general_api::general_run_async,
    network::{BoundInterface, SystemNetwork, UnderlyingNetwork},
    packet_processor::{PacketProcessor, PacketSink, ProtocolHandler},
    proxy_handler::{ProxyConnector, ProxyStats},
    router::{ConnectionRouter, RoutingAction, RoutingRule},
    session::{Session, SessionStats, SessionStore, TcpState},
    session_info::{IpProtocol, SessionInfo},
    socks::Socks5Upstream,
    socks5_server::Socks5Server,
    tcp_handler::{TcpHandler, TcpHandlerConfig},
};

mod args;
mod error;
mod general_api;
pub mod network;
pub mod packet;
pub mod packet_processor;
mod proxy_handler;
pub mod router;
pub mod session;
mod session_info;
pub mod socks;
pub mod socks5_server;
pub mod tcp_handler;

struct Running {
    token: CancellationToken,
    server: Arc<Socks5Server>,
    processor: Arc<PacketProcessor>,
    tasks: Vec<JoinHandle<()>>,
}

/// The assembled relay: session store, router, SOCKS5 server, TCP handler
/// and packet processor, started and stopped as one unit.
pub struct VpnCore {
    args: Args,
    store: Arc<SessionStore>,
    router: Arc<ConnectionRouter>,
    network: Arc<dyn UnderlyingNetwork>,
    running: Mutex<Option<Running>>,
}

impl VpnCore {
    pub fn new(args: Args) -> Self {
        let network: Arc<dyn UnderlyingNetwork> = match &args.outbound_interface {
            Some(name) => Arc::new(BoundInterface::new(name)),
            None => Arc::new(SystemNetwork),
        };
        Self::with_network(args, network)
    }

    pub fn with_network(args: Args, network: Arc<dyn UnderlyingNetwork>) -> Self {
        Self {
            store: Arc::new(SessionStore::new(args.session_timeout_duration())),
            router: Arc::new(ConnectionRouter::default()),
            network,
            args,
            running: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn router(&self) -> &Arc<ConnectionRouter> {
        &self.router
    }

    /// Bound address of the embedded SOCKS5 server while running.
    pub fn socks_addr(&self) -> Option<SocketAddr> {
        self.lock().as_ref().map(|r| r.server.local_addr())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts every component on `device`. Fails if the SOCKS5 listener
    /// cannot be bound or the core is already running.
    pub async fn start<D>(&self, device: D) -> Result<()>
    where
        D: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self.is_running() {
            return Err("already running".into());
        }
        let args = &self.args;
        let token = CancellationToken::new();

        let server = Socks5Server::bind(args.socks_listen, self.network.clone(), args.connect_timeout_duration()).await?;
        let mut tasks = vec![server.start(token.clone())?];
        self.router.register_proxy(server.proxy_type(), server.clone());
        self.router.set_default_proxy(server.clone());

        let (sink, outbound) = PacketSink::channel();
        let config = TcpHandlerConfig::with_mtu(args.mtu).handshake_timeout(args.handshake_timeout_duration());
        let handler = TcpHandler::new(self.store.clone(), self.router.clone(), sink, config, token.clone());
        let mut processor = PacketProcessor::new(self.store.clone(), args.mtu);
        processor.register_handler(Arc::new(handler));
        let processor = Arc::new(processor);

        let store = self.store.clone();
        let interval = args.cleanup_interval_duration();
        let cleanup_token = token.clone();
        tasks.push(tokio::spawn(async move { store.run_cleanup(interval, cleanup_token).await }));

        if let Some(interval) = args.status_interval_duration() {
            tasks.push(tokio::spawn(status_monitor(
                self.store.clone(),
                server.clone(),
                processor.clone(),
                interval,
                token.clone(),
            )));
        }

        let processor_token = token.clone();
        let pump = processor.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = pump.run(device, outbound, processor_token.clone()).await {
                log::error!("Packet processor failed: {err}");
            }
            // A closed device ends the whole relay.
            processor_token.cancel();
        }));

        let mut running = self.lock();
        if running.is_some() {
            token.cancel();
            server.stop();
            return Err("already running".into());
        }
        *running = Some(Running {
            token,
            server,
            processor,
            tasks,
        });
        log::info!("Relay started, SOCKS5 server on {}", args.socks_listen);
        Ok(())
    }

    /// Cancels every task and drops all sessions.
    pub fn stop(&self) {
        let Some(running) = self.lock().take() else {
            return;
        };
        running.token.cancel();
        running.server.stop();
        self.router.unregister_proxy(running.server.proxy_type());
        for task in &running.tasks {
            task.abort();
        }
        self.store.clear();
        log::info!("Relay stopped");
    }

    pub fn is_running(&self) -> bool {
        self.lock().as_ref().is_some_and(|r| !r.token.is_cancelled())
    }

    /// Resolves once the relay has stopped on its own, e.g. because the device closed.
    pub async fn stopped(&self) {
        let token = self.lock().as_ref().map(|r| r.token.clone());
        if let Some(token) = token {
            token.cancelled().await;
        }
    }

    pub fn system_status(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== Relay Status ===");
        let _ = writeln!(out, "Running: {}", self.is_running());
        if let Some(running) = self.lock().as_ref() {
            let server = &running.server;
            let _ = writeln!(
                out,
                "SOCKS5 server {}: healthy={}, {}",
                server.local_addr(),
                server.is_healthy(),
                server.stats()
            );
            out.push_str(&running.processor.stats());
        }
        out.push_str(&self.store.detailed_stats());
        out.push_str(&self.router.routing_info());
        out
    }
}

impl Drop for VpnCore {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn status_monitor(
    store: Arc<SessionStore>,
    server: Arc<Socks5Server>,
    processor: Arc<PacketProcessor>,
    interval: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                log::info!("Status: {}, proxy {}", store.stats(), server.stats());
                log::debug!("{}", processor.stats());
            }
        }
    }
}

/// Runs the relay on `device` until `shutdown_token` is cancelled or the device closes.
pub async fn run<D>(device: D, args: Args, shutdown_token: CancellationToken) -> Result<()>
where
    D: AsyncRead + AsyncWrite + Send + 'static,
{
    let core = VpnCore::new(args);
    core.start(device).await?;
    tokio::select! {
        _ = shutdown_token.cancelled() => log::info!("Shutdown requested"),
        _ = core.stopped() => log::info!("Relay ended"),
    }
    log::debug!("{}", core.system_status());
    core.stop();
    Ok(())
}
