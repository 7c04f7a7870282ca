use crate::session_info::{IpProtocol, SessionInfo};
use dashmap::{DashMap, mapref::entry::Entry};
use std::{
    collections::BTreeMap,
    fmt::Write as _,
    sync::atomic::{AtomicU64, Ordering::Relaxed},
    time::{Duration, Instant},
};
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TcpState {
    #[default]
    SynSent,
    Established,
    FinWait,
    Closed,
}

impl std::fmt::Display for TcpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TcpState::SynSent => "SYN_SENT",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait => "FIN_WAIT",
            TcpState::Closed => "CLOSED",
        };
        write!(f, "{name}")
    }
}

/// One flow seen on the virtual interface.
///
/// The store owns every session; other components hold the connection key
/// and look the session up again after each suspension point.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: u64,
    pub key: String,
    pub info: SessionInfo,
    pub state: TcpState,
    /// Next sequence number we synthesize for the handshake.
    pub local_sequence_number: u32,
    /// Next sequence number for data flowing towards the client.
    pub remote_sequence_number: u32,
    /// Latest sequence number seen from the client.
    pub client_sequence_number: u32,
    /// Next in-order client byte, acknowledged in every segment we send.
    pub last_ack_number: u32,
    pub is_established: bool,
    pub created: Instant,
    pub created_at: chrono::DateTime<chrono::Local>,
    /// Feeds the task writing client payloads to the proxy socket.
    pub(crate) proxy_tx: Option<Sender<Vec<u8>>>,
    /// Cancelled when the session leaves the store, stopping its background tasks.
    pub(crate) cancel: CancellationToken,
}

impl Session {
    fn new(id: u64, info: SessionInfo, cancel: CancellationToken) -> Self {
        Self {
            id,
            key: info.connection_key(),
            info,
            state: TcpState::SynSent,
            local_sequence_number: 0,
            remote_sequence_number: 0,
            client_sequence_number: 0,
            last_ack_number: 0,
            is_established: false,
            created: Instant::now(),
            created_at: chrono::Local::now(),
            proxy_tx: None,
            cancel,
        }
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl std::fmt::Display for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} {} [{}]", self.id, self.info, self.state)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStats {
    pub total_sessions: u64,
    pub active_sessions: usize,
    pub bytes_transferred: u64,
    pub packets_processed: u64,
    pub errors: u64,
}

impl std::fmt::Display for SessionStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "sessions {} active / {} total, {} packets, {} bytes, {} errors",
            self.active_sessions, self.total_sessions, self.packets_processed, self.bytes_transferred, self.errors
        )
    }
}

/// Concurrent map from connection key to session.
///
/// Every mutation happens under the map's per-key lock, so an update is
/// never observed half applied. Guards are never held across an await.
#[derive(Debug)]
pub struct SessionStore {
    sessions: DashMap<String, Session>,
    timeout: Duration,
    next_id: AtomicU64,
    total_sessions: AtomicU64,
    bytes_transferred: AtomicU64,
    packets_processed: AtomicU64,
    errors: AtomicU64,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TIMEOUT)
    }
}

impl SessionStore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            timeout,
            next_id: AtomicU64::new(0),
            total_sessions: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(0),
            packets_processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Inserts a new session for `info` unless one already exists for its key.
    ///
    /// `init` runs on the fresh session before it becomes visible. Returns a
    /// snapshot of the inserted session, or `None` when the key was taken.
    pub fn create_session<F>(&self, info: SessionInfo, cancel: CancellationToken, init: F) -> Option<Session>
    where
        F: FnOnce(&mut Session),
    {
        match self.sessions.entry(info.connection_key()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, Relaxed) + 1;
                let mut session = Session::new(id, info, cancel);
                init(&mut session);
                self.total_sessions.fetch_add(1, Relaxed);
                log::debug!("Created session {session}");
                Some(entry.insert(session).value().clone())
            }
        }
    }

    pub fn get_session(&self, key: &str) -> Option<Session> {
        self.sessions.get(key).map(|s| s.value().clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.sessions.contains_key(key)
    }

    /// Applies `f` to the session under its lock and returns the result,
    /// or `None` when no session exists for `key`.
    pub fn update_session<R, F>(&self, key: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut Session) -> R,
    {
        self.sessions.get_mut(key).map(|mut s| f(s.value_mut()))
    }

    pub fn remove_session(&self, key: &str) -> Option<Session> {
        let (_, session) = self.sessions.remove(key)?;
        Some(Self::close(session))
    }

    /// Removes the session only if it is still the one with `id`, so a task
    /// that outlived its session cannot remove a newer flow reusing the key.
    pub fn remove_session_if(&self, key: &str, id: u64) -> bool {
        match self.sessions.remove_if(key, |_, s| s.id == id) {
            Some((_, session)) => {
                Self::close(session);
                true
            }
            None => false,
        }
    }

    fn close(mut session: Session) -> Session {
        session.cancel.cancel();
        session.proxy_tx = None;
        session.state = TcpState::Closed;
        log::debug!("Removed session {session}");
        session
    }

    pub fn all_sessions(&self) -> Vec<Session> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    pub fn sessions_by_protocol(&self, protocol: IpProtocol) -> Vec<Session> {
        self.sessions
            .iter()
            .filter(|s| s.info.protocol == protocol)
            .map(|s| s.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn record_packet(&self) {
        self.packets_processed.fetch_add(1, Relaxed);
    }

    pub fn record_bytes(&self, bytes: usize) {
        self.bytes_transferred.fetch_add(bytes as u64, Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Relaxed);
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            total_sessions: self.total_sessions.load(Relaxed),
            active_sessions: self.sessions.len(),
            bytes_transferred: self.bytes_transferred.load(Relaxed),
            packets_processed: self.packets_processed.load(Relaxed),
            errors: self.errors.load(Relaxed),
        }
    }

    pub fn detailed_stats(&self) -> String {
        let stats = self.stats();
        let mut breakdown = BTreeMap::<IpProtocol, usize>::new();
        for session in self.sessions.iter() {
            *breakdown.entry(session.info.protocol).or_default() += 1;
        }

        let mut out = String::new();
        let _ = writeln!(out, "=== Session Store Stats ===");
        let _ = writeln!(out, "Total sessions created: {}", stats.total_sessions);
        let _ = writeln!(out, "Active sessions: {}", stats.active_sessions);
        let _ = writeln!(out, "Bytes transferred: {}", stats.bytes_transferred);
        let _ = writeln!(out, "Packets processed: {}", stats.packets_processed);
        let _ = writeln!(out, "Errors: {}", stats.errors);
        let _ = writeln!(out, "Protocol breakdown:");
        for (protocol, count) in breakdown {
            let _ = writeln!(out, "  {protocol}: {count} sessions");
        }
        out
    }

    /// Removes every session whose age exceeds the timeout at `now`.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let expired: Vec<(String, u64)> = self
            .sessions
            .iter()
            .filter(|s| s.age(now) > self.timeout)
            .map(|s| (s.key().clone(), s.id))
            .collect();
        let removed = expired.iter().filter(|(key, id)| self.remove_session_if(key, *id)).count();
        if removed > 0 {
            log::debug!("Swept {removed} expired sessions");
        }
        removed
    }

    /// Periodically sweeps expired sessions until `shutdown` fires.
    pub async fn run_cleanup(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_expired(Instant::now());
                }
            }
        }
        log::trace!("Session cleanup task exited");
    }

    pub fn clear(&self) {
        let keys: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        for key in keys {
            self.remove_session(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(src_port: u16) -> SessionInfo {
        SessionInfo::new(
            format!("10.0.0.2:{src_port}").parse().unwrap(),
            "93.184.216.34:443".parse().unwrap(),
            IpProtocol::Tcp,
        )
    }

    #[test]
    fn one_session_per_key() {
        let store = SessionStore::default();
        let first = store.create_session(info(5000), CancellationToken::new(), |_| {}).unwrap();
        assert!(store.create_session(info(5000), CancellationToken::new(), |_| {}).is_none());
        let second = store.create_session(info(5001), CancellationToken::new(), |_| {}).unwrap();
        assert_eq!(store.len(), 2);
        assert!(second.id > first.id);
        assert_eq!(store.stats().total_sessions, 2);
    }

    #[test]
    fn update_is_visible_and_reports_absence() {
        let store = SessionStore::default();
        let key = store.create_session(info(5000), CancellationToken::new(), |s| s.last_ack_number = 7).unwrap().key;
        assert_eq!(store.get_session(&key).unwrap().last_ack_number, 7);
        let seq = store.update_session(&key, |s| {
            s.client_sequence_number = s.client_sequence_number.wrapping_add(100);
            s.client_sequence_number
        });
        assert_eq!(seq, Some(100));
        assert!(store.update_session("missing", |_| ()).is_none());
    }

    #[test]
    fn removal_cancels_background_work() {
        let store = SessionStore::default();
        let token = CancellationToken::new();
        let session = store.create_session(info(5000), token.clone(), |_| {}).unwrap();
        let removed = store.remove_session(&session.key).unwrap();
        assert_eq!(removed.state, TcpState::Closed);
        assert!(token.is_cancelled());
        assert!(store.remove_session(&session.key).is_none());
    }

    #[test]
    fn conditional_removal_spares_newer_session() {
        let store = SessionStore::default();
        let old = store.create_session(info(5000), CancellationToken::new(), |_| {}).unwrap();
        store.remove_session(&old.key);
        let new = store.create_session(info(5000), CancellationToken::new(), |_| {}).unwrap();
        assert!(!store.remove_session_if(&old.key, old.id));
        assert!(store.contains(&new.key));
        assert!(store.remove_session_if(&new.key, new.id));
    }

    #[test]
    fn sweep_removes_only_expired() {
        let store = SessionStore::new(Duration::from_secs(300));
        let old = store.create_session(info(5000), CancellationToken::new(), |_| {}).unwrap();
        let fresh = store.create_session(info(5001), CancellationToken::new(), |_| {}).unwrap();
        let later = old.created + Duration::from_secs(301);
        store.update_session(&fresh.key, |s| s.created = later);
        assert_eq!(store.sweep_expired(later), 1);
        assert!(!store.contains(&old.key));
        assert!(store.contains(&fresh.key));
    }

    #[tokio::test]
    async fn cleanup_task_sweeps_until_cancelled() {
        let store = std::sync::Arc::new(SessionStore::new(Duration::from_millis(50)));
        let shutdown = CancellationToken::new();
        let sweeper = tokio::spawn({
            let store = store.clone();
            let shutdown = shutdown.clone();
            async move { store.run_cleanup(Duration::from_millis(20), shutdown).await }
        });

        let token = CancellationToken::new();
        store.create_session(info(5000), token.clone(), |_| {}).unwrap();
        tokio::time::timeout(Duration::from_secs(5), token.cancelled()).await.unwrap();
        assert!(store.is_empty());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), sweeper).await.unwrap().unwrap();
    }

    #[test]
    fn detailed_stats_breakdown() {
        let store = SessionStore::default();
        store.create_session(info(5000), CancellationToken::new(), |_| {});
        store.record_packet();
        store.record_bytes(42);
        store.record_error();
        let text = store.detailed_stats();
        assert!(text.contains("Active sessions: 1"));
        assert!(text.contains("Bytes transferred: 42"));
        assert!(text.contains("  TCP: 1 sessions"));
        assert_eq!(store.sessions_by_protocol(IpProtocol::Udp).len(), 0);
        store.clear();
        assert!(store.is_empty());
    }
}
