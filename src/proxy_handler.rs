use std::{
    sync::atomic::{AtomicU64, Ordering::Relaxed},
    time::Duration,
};
use tokio::net::TcpStream;

/// An outbound path the router can hand a flow to.
#[async_trait::async_trait]
pub trait ProxyConnector: Send + Sync {
    /// Type tag used by routing rules, e.g. `"SOCKS5"`.
    fn proxy_type(&self) -> &str;
    fn is_healthy(&self) -> bool;
    fn stats(&self) -> ProxyStats;
    /// Opens a stream that carries bytes to and from `host:port`.
    async fn connect(&self, host: &str, port: u16) -> std::io::Result<TcpStream>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProxyStats {
    pub connection_count: u64,
    pub bytes_transferred: u64,
    pub error_count: u64,
    pub avg_response_time: Duration,
}

impl std::fmt::Display for ProxyStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} connections, {} bytes, {} errors, avg response {} ms",
            self.connection_count,
            self.bytes_transferred,
            self.error_count,
            self.avg_response_time.as_millis()
        )
    }
}

/// Lock-free counters behind [`ProxyStats`].
#[derive(Debug, Default)]
pub struct ProxyCounters {
    connections: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
    response_micros: AtomicU64,
}

impl ProxyCounters {
    pub fn record_connection(&self) {
        self.connections.fetch_add(1, Relaxed);
    }

    pub fn record_bytes(&self, bytes: usize) {
        self.bytes.fetch_add(bytes as u64, Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Relaxed);
    }

    pub fn record_response_time(&self, elapsed: Duration) {
        self.response_micros.fetch_add(elapsed.as_micros() as u64, Relaxed);
    }

    /// Average response time is the accumulated time divided by all connections.
    pub fn snapshot(&self) -> ProxyStats {
        let connection_count = self.connections.load(Relaxed);
        let total = self.response_micros.load(Relaxed);
        let avg = if connection_count > 0 { total / connection_count } else { 0 };
        ProxyStats {
            connection_count,
            bytes_transferred: self.bytes.load(Relaxed),
            error_count: self.errors.load(Relaxed),
            avg_response_time: Duration::from_micros(avg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_over_all_connections() {
        let counters = ProxyCounters::default();
        assert_eq!(counters.snapshot().avg_response_time, Duration::ZERO);
        counters.record_connection();
        counters.record_connection();
        counters.record_response_time(Duration::from_millis(30));
        counters.record_bytes(10);
        counters.record_error();
        let stats = counters.snapshot();
        assert_eq!(stats.connection_count, 2);
        assert_eq!(stats.avg_response_time, Duration::from_millis(15));
        assert_eq!(stats.bytes_transferred, 10);
        assert_eq!(stats.error_count, 1);
    }
}
