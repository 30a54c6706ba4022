use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, SystemTime};

use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{YfpError, YfpResult};
use crate::protocol::envelope::ConnectData;
use crate::protocol::session_token::SessionToken;

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub ip: IpAddr,
    /// where DETECTIONS and PONG are sent
    pub control_addr: SocketAddr,
    pub token: SessionToken,
    pub connected_at: SystemTime,
    pub last_seen: Instant,
    /// frames whose DETECTIONS were sent to this session
    pub frames_received: u64,
    pub details: ConnectData,
}

/// The result of an upsert, telling the caller whether the peer is new
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub token: SessionToken,
    pub is_new: bool,
}

#[derive(Default)]
struct Sessions {
    by_addr: FxHashMap<SocketAddr, Session>,
    /// the control address that most recently sent CONNECT from each IP
    latest_by_ip: FxHashMap<IpAddr, SocketAddr>,
}

impl Sessions {
    /// Points an IP's entry in `latest_by_ip` at its most recently seen remaining session after
    ///  `removed` is gone
    fn on_removed(&mut self, removed: &Session) {
        if self.latest_by_ip.get(&removed.ip) != Some(&removed.control_addr) {
            return;
        }

        let successor = self.by_addr.values()
            .filter(|s| s.ip == removed.ip)
            .max_by_key(|s| s.last_seen)
            .map(|s| s.control_addr);
        match successor {
            Some(addr) => { self.latest_by_ip.insert(removed.ip, addr); }
            None => { self.latest_by_ip.remove(&removed.ip); }
        }
    }
}

/// Keeps one session per control channel address (`ip:port`).
///
/// A frame connection and the control datagrams of the same peer have nothing in common but the
///  peer's IP, so frames are correlated by IP unless they carry a [SessionToken]. Several peers
///  behind one NAT address share that IP; for them, IP correlation resolves to the most recent
///  CONNECT, while a token always names its own session.
///
/// All operations are safe to call concurrently from any number of tasks.
#[derive(Default)]
pub struct ClientRegistry {
    sessions: RwLock<Sessions>,
}

impl ClientRegistry {
    pub fn new() -> ClientRegistry {
        Default::default()
    }

    pub async fn upsert(&self, ip: IpAddr, control_addr: SocketAddr) -> UpsertOutcome {
        self.upsert_with_details(ip, control_addr, ConnectData::default()).await
    }

    /// Registers a session for `control_addr` or refreshes the existing one, keeping its token.
    ///  Either way, `control_addr` becomes the address that IP correlation resolves `ip` to.
    pub async fn upsert_with_details(&self, ip: IpAddr, control_addr: SocketAddr, details: ConnectData) -> UpsertOutcome {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;

        if let Some(previous) = sessions.latest_by_ip.insert(ip, control_addr) {
            if previous != control_addr {
                debug!("IP correlation for {} moves from {} to {}", ip, previous, control_addr);
            }
        }

        if let Some(session) = sessions.by_addr.get_mut(&control_addr) {
            session.last_seen = now;
            session.details = details;
            return UpsertOutcome { token: session.token, is_new: false };
        }

        let token = SessionToken::random();
        sessions.by_addr.insert(control_addr, Session {
            ip,
            control_addr,
            token,
            connected_at: SystemTime::now(),
            last_seen: now,
            frames_received: 0,
            details,
        });
        UpsertOutcome { token, is_new: true }
    }

    /// the control address of the most recent CONNECT from `ip`
    pub async fn lookup_by_ip(&self, ip: IpAddr) -> Option<SocketAddr> {
        self.sessions.read().await
            .latest_by_ip
            .get(&ip)
            .copied()
    }

    pub async fn lookup_by_token(&self, token: SessionToken) -> Option<SocketAddr> {
        self.sessions.read().await
            .by_addr
            .values()
            .find(|s| s.token == token)
            .map(|s| s.control_addr)
    }

    /// Resolves the reply address for a frame received from `peer_ip`, preferring the session
    ///  named by `token` and falling back to the peer's IP.
    pub async fn resolve_frame(&self, peer_ip: IpAddr, token: Option<SessionToken>) -> YfpResult<SocketAddr> {
        let sessions = self.sessions.read().await;

        token
            .and_then(|token| sessions.by_addr.values().find(|s| s.token == token))
            .map(|s| s.control_addr)
            .or_else(|| sessions.latest_by_ip.get(&peer_ip).copied())
            .ok_or(YfpError::CorrelationMiss(peer_ip))
    }

    /// Counts a frame whose results were delivered to `control_addr`, which also keeps the session
    ///  alive. Returns `false` if the session is gone.
    pub async fn record_frame_sent(&self, control_addr: SocketAddr) -> bool {
        match self.sessions.write().await.by_addr.get_mut(&control_addr) {
            Some(session) => {
                session.frames_received += 1;
                session.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Refreshes a session's liveness, returning `false` if there is no session for `control_addr`
    pub async fn touch(&self, control_addr: SocketAddr) -> bool {
        match self.sessions.write().await.by_addr.get_mut(&control_addr) {
            Some(session) => {
                session.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.by_addr.len()
    }

    pub async fn get(&self, control_addr: SocketAddr) -> Option<Session> {
        self.sessions.read().await
            .by_addr
            .get(&control_addr)
            .cloned()
    }

    pub async fn sessions(&self) -> Vec<Session> {
        self.sessions.read().await
            .by_addr
            .values()
            .cloned()
            .collect()
    }

    /// Removes and returns all sessions that were not seen for longer than `max_idle`
    pub async fn evict_stale(&self, max_idle: Duration) -> Vec<Session> {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;

        let stale = sessions.by_addr.iter()
            .filter(|(_, s)| now.duration_since(s.last_seen) > max_idle)
            .map(|(addr, _)| *addr)
            .collect::<Vec<_>>();

        let evicted = stale.into_iter()
            .flat_map(|addr| sessions.by_addr.remove(&addr))
            .collect::<Vec<_>>();
        for session in &evicted {
            sessions.on_removed(session);
        }
        evicted
    }

    pub async fn clear(&self) {
        let mut sessions = self.sessions.write().await;
        sessions.by_addr.clear();
        sessions.latest_by_ip.clear();
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    use tokio::time;

    use super::*;

    fn ip(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(1, 2, 3, n))
    }

    fn addr(n: u8, port: u16) -> SocketAddr {
        SocketAddr::new(ip(n), port)
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let registry = ClientRegistry::new();
        let first = registry.upsert(ip(4), addr(4, 5000)).await;
        let second = registry.upsert(ip(4), addr(4, 6000)).await;

        assert!(first.is_new);
        assert!(second.is_new);
        assert_ne!(first.token, second.token);

        assert_eq!(registry.lookup_by_ip(ip(4)).await, Some(addr(4, 6000)));
        assert_eq!(registry.resolve_frame(ip(4), None).await.unwrap(), addr(4, 6000));

        // a CONNECT from the first address makes it the most recent one again
        let again = registry.upsert(ip(4), addr(4, 5000)).await;
        assert_eq!(again, UpsertOutcome { token: first.token, is_new: false });
        assert_eq!(registry.lookup_by_ip(ip(4)).await, Some(addr(4, 5000)));
    }

    #[tokio::test]
    async fn test_peers_behind_one_address_keep_their_sessions() {
        let registry = ClientRegistry::new();
        let a = registry.upsert(ip(5), addr(5, 40001)).await;
        let b = registry.upsert(ip(5), addr(5, 40002)).await;

        assert_eq!(registry.count().await, 2);
        assert_eq!(registry.lookup_by_token(a.token).await, Some(addr(5, 40001)));
        assert_eq!(registry.lookup_by_token(b.token).await, Some(addr(5, 40002)));

        assert_eq!(registry.resolve_frame(ip(5), Some(a.token)).await.unwrap(), addr(5, 40001));
        assert_eq!(registry.resolve_frame(ip(5), Some(b.token)).await.unwrap(), addr(5, 40002));
        assert_eq!(registry.resolve_frame(ip(5), None).await.unwrap(), addr(5, 40002));
    }

    #[tokio::test]
    async fn test_reconnect_from_same_address_keeps_session() {
        let registry = ClientRegistry::new();
        let first = registry.upsert(ip(4), addr(4, 5000)).await;
        assert!(registry.record_frame_sent(addr(4, 5000)).await);

        let details = ConnectData {
            device_id: Some("pixel".to_string()),
            ..ConnectData::default()
        };
        let second = registry.upsert_with_details(ip(4), addr(4, 5000), details.clone()).await;
        assert_eq!(second, UpsertOutcome { token: first.token, is_new: false });

        let session = registry.get(addr(4, 5000)).await.unwrap();
        assert_eq!(session.frames_received, 1);
        assert_eq!(session.details, details);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_not_found() {
        let registry = ClientRegistry::new();
        registry.upsert(ip(1), addr(1, 5000)).await;

        assert_eq!(registry.lookup_by_ip(ip(2)).await, None);
        assert_eq!(registry.lookup_by_token(SessionToken(1)).await, None);
        assert!(matches!(registry.resolve_frame(ip(2), None).await, Err(YfpError::CorrelationMiss(i)) if i == ip(2)));
        assert!(!registry.touch(addr(2, 5000)).await);
        assert!(!registry.touch(addr(1, 5001)).await);
        assert!(!registry.record_frame_sent(addr(2, 5000)).await);
    }

    #[tokio::test]
    async fn test_resolve_by_token() {
        let registry = ClientRegistry::new();
        let a = registry.upsert(ip(1), addr(1, 5000)).await;
        registry.upsert(ip(2), addr(2, 5000)).await;

        // the token wins over the connection's IP
        assert_eq!(registry.resolve_frame(ip(2), Some(a.token)).await.unwrap(), addr(1, 5000));
        // an unknown token falls back to the IP
        assert_eq!(registry.resolve_frame(ip(2), Some(SessionToken(0))).await.unwrap(), addr(2, 5000));
        assert!(matches!(registry.resolve_frame(ip(3), Some(SessionToken(0))).await, Err(YfpError::CorrelationMiss(_))));

        // resolving alone does not count a frame
        assert_eq!(registry.get(addr(1, 5000)).await.unwrap().frames_received, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_stale() {
        let registry = ClientRegistry::new();
        registry.upsert(ip(1), addr(1, 5000)).await;
        registry.upsert(ip(2), addr(2, 5000)).await;

        time::advance(Duration::from_secs(40)).await;
        assert!(registry.touch(addr(2, 5000)).await);

        time::advance(Duration::from_secs(30)).await;
        let evicted = registry.evict_stale(Duration::from_secs(60)).await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].ip, ip(1));

        assert_eq!(registry.count().await, 1);
        assert_eq!(registry.lookup_by_ip(ip(1)).await, None);
        assert_eq!(registry.lookup_by_ip(ip(2)).await, Some(addr(2, 5000)));

        time::advance(Duration::from_secs(31)).await;
        assert_eq!(registry.evict_stale(Duration::from_secs(60)).await.len(), 1);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicting_latest_session_falls_back_to_remaining_one() {
        let registry = ClientRegistry::new();
        registry.upsert(ip(5), addr(5, 40001)).await;
        time::advance(Duration::from_secs(10)).await;
        registry.upsert(ip(5), addr(5, 40002)).await;

        // only the older session stays alive
        time::advance(Duration::from_secs(55)).await;
        assert!(registry.touch(addr(5, 40001)).await);
        time::advance(Duration::from_secs(10)).await;

        let evicted = registry.evict_stale(Duration::from_secs(60)).await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].control_addr, addr(5, 40002));
        assert_eq!(registry.lookup_by_ip(ip(5)).await, Some(addr(5, 40001)));
    }

    #[tokio::test]
    async fn test_clear() {
        let registry = ClientRegistry::new();
        registry.upsert(ip(1), addr(1, 5000)).await;
        registry.upsert(ip(2), addr(2, 5000)).await;
        registry.clear().await;
        assert_eq!(registry.count().await, 0);
        assert!(registry.sessions().await.is_empty());
        assert_eq!(registry.lookup_by_ip(ip(1)).await, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_access() {
        const N: u16 = 200;
        let registry = Arc::new(ClientRegistry::new());

        let peer = |i: u16| SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, (i >> 8) as u8, i as u8)), 1000 + i);

        let upserts = (0..N)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    let addr = peer(i);
                    registry.upsert(addr.ip(), addr).await;
                })
            })
            .collect::<Vec<_>>();
        for handle in upserts {
            handle.await.unwrap();
        }
        assert_eq!(registry.count().await, N as usize);

        let lookups = (0..N)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    let addr = peer(i);
                    assert_eq!(registry.lookup_by_ip(addr.ip()).await, Some(addr));
                    assert_eq!(registry.resolve_frame(addr.ip(), None).await.unwrap(), addr);
                    assert!(registry.record_frame_sent(addr).await);
                })
            })
            .collect::<Vec<_>>();
        for handle in lookups {
            handle.await.unwrap();
        }
    }
}
