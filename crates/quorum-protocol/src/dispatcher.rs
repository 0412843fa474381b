/// Peer Dispatcher.
///
/// Owns every live link, keyed by identity hash. Inbound frames are
/// decoded, deduplicated, and queued for a fixed pool of workers that run
/// the handler registered for the signal type. Outbound signals go straight
/// to their recipient when it is a registered peer, otherwise they are
/// flooded to every member link.
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use quorum_transport::PeerHash;

use crate::cache::ReplayCache;
use crate::config::MeshConfig;
use crate::event::MeshEvent;
use crate::signal::{Signal, SignalType};

/// How far a link is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trust {
    /// Not admitted: receives only signals addressed to it.
    Pending,
    /// Admitted: takes part in flood broadcast.
    Member,
}

/// A deduplicated signal and the link it arrived on.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub signal: Signal,
    pub via: PeerHash,
}

/// One step of the protocol, bound to a signal type at startup.
#[async_trait::async_trait]
pub trait SignalHandler: Send + Sync {
    async fn handle(&self, dispatcher: &Arc<Dispatcher>, inbound: Inbound);
}

/// Closed mapping from signal type to handler, built once.
pub type HandlerTable = HashMap<SignalType, Arc<dyn SignalHandler>>;

struct PeerEntry {
    member: AtomicBool,
    disconnected: AtomicBool,
    outbox: Mutex<Option<mpsc::Sender<Bytes>>>,
}

impl PeerEntry {
    fn trust(&self) -> Trust {
        if self.member.load(Ordering::Acquire) {
            Trust::Member
        } else {
            Trust::Pending
        }
    }
}

pub struct Dispatcher {
    local: PeerHash,
    cache: Arc<ReplayCache>,
    peers: Mutex<HashMap<PeerHash, Arc<PeerEntry>>>,
    subscribers: Mutex<HashMap<SignalType, Vec<mpsc::Sender<Signal>>>>,
    handlers: HandlerTable,
    inbox: mpsc::Sender<Inbound>,
    events: broadcast::Sender<MeshEvent>,
    outbound_queue: usize,
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// Build the dispatcher and spawn its worker pool.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        local: PeerHash,
        cache: Arc<ReplayCache>,
        handlers: HandlerTable,
        config: &MeshConfig,
    ) -> Arc<Self> {
        let (inbox, inbox_rx) = mpsc::channel(config.inbox_capacity.max(1));
        let (events, _) = broadcast::channel(256);

        let dispatcher = Arc::new(Self {
            local,
            cache,
            peers: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            handlers,
            inbox,
            events,
            outbound_queue: config.outbound_queue.max(1),
            shutdown: CancellationToken::new(),
        });

        let inbox_rx = Arc::new(tokio::sync::Mutex::new(inbox_rx));
        for _ in 0..config.workers.max(1) {
            tokio::spawn(dispatcher.clone().work(inbox_rx.clone()));
        }
        dispatcher
    }

    pub fn local(&self) -> PeerHash {
        self.local
    }

    pub fn cache(&self) -> &Arc<ReplayCache> {
        &self.cache
    }

    // ── Registry ────────────────────────────────────────────────────

    /// Install a peer and return the read side of its outbound queue.
    ///
    /// An existing entry under the same hash is replaced and torn down.
    pub fn register(&self, peer: PeerHash, trust: Trust) -> mpsc::Receiver<Bytes> {
        self.install(peer, trust).1
    }

    fn install(&self, peer: PeerHash, trust: Trust) -> (Arc<PeerEntry>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(self.outbound_queue);
        let entry = Arc::new(PeerEntry {
            member: AtomicBool::new(trust == Trust::Member),
            disconnected: AtomicBool::new(false),
            outbox: Mutex::new(Some(tx)),
        });

        let previous = self.peers.lock().insert(peer, entry.clone());
        if let Some(previous) = previous {
            tracing::debug!("Replacing existing link to {peer}");
            self.teardown(peer, &previous);
        }

        let _ = self.events.send(MeshEvent::PeerConnected { peer, trust });
        (entry, rx)
    }

    /// Register `peer` and start feeding its inbound frames into the mesh.
    ///
    /// Returns the outbound queue the link should drain to the wire. When
    /// `inbound` ends, the peer is disconnected.
    pub fn dispatch(
        self: &Arc<Self>,
        peer: PeerHash,
        trust: Trust,
        mut inbound: mpsc::Receiver<Bytes>,
    ) -> mpsc::Receiver<Bytes> {
        let (entry, outbound) = self.install(peer, trust);
        let dispatcher = self.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = dispatcher.shutdown.cancelled() => break,
                    frame = inbound.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                dispatcher.receive(peer, frame).await;
            }
            dispatcher.teardown(peer, &entry);
        });
        outbound
    }

    async fn receive(&self, via: PeerHash, frame: Bytes) {
        let signal = match Signal::decode(frame) {
            Ok(signal) => signal,
            Err(e) => {
                tracing::debug!("Dropping undecodable signal from {via}: {e}");
                return;
            }
        };
        // Checked before the replay cache so a dropped copy cannot shadow
        // the same signal arriving later over a member link.
        if self.is_pending(&via) && !pending_may_flood(&signal, via) {
            tracing::debug!("Dropping {} flooded by pending peer {via}", signal.kind());
            return;
        }
        if !self.cache.put_if_absent(signal.nonce()) {
            tracing::trace!("Duplicate {} from {via}", signal.kind());
            return;
        }
        let _ = self.inbox.send(Inbound { signal, via }).await;
    }

    /// Turn a pending link into a member link. Returns false when no such
    /// peer is registered.
    pub fn promote(&self, peer: PeerHash) -> bool {
        let entry = self.peers.lock().get(&peer).cloned();
        match entry {
            Some(entry) => {
                if !entry.member.swap(true, Ordering::AcqRel) {
                    tracing::debug!("Promoted {peer} to member");
                    let _ = self.events.send(MeshEvent::PeerPromoted(peer));
                }
                true
            }
            None => false,
        }
    }

    /// Tear down the link to `peer`. Safe to call any number of times.
    pub fn disconnect(&self, peer: PeerHash) -> bool {
        let entry = self.peers.lock().get(&peer).cloned();
        match entry {
            Some(entry) => self.teardown(peer, &entry),
            None => false,
        }
    }

    fn teardown(&self, peer: PeerHash, entry: &Arc<PeerEntry>) -> bool {
        if entry
            .disconnected
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        {
            let mut peers = self.peers.lock();
            if peers.get(&peer).is_some_and(|current| Arc::ptr_eq(current, entry)) {
                peers.remove(&peer);
            }
        }
        entry.outbox.lock().take();
        tracing::debug!("Disconnected {peer}");
        let _ = self.events.send(MeshEvent::PeerDisconnected(peer));
        true
    }

    pub fn trust_of(&self, peer: &PeerHash) -> Option<Trust> {
        self.peers.lock().get(peer).map(|entry| entry.trust())
    }

    pub fn is_member(&self, peer: &PeerHash) -> bool {
        self.trust_of(peer) == Some(Trust::Member)
    }

    pub fn is_pending(&self, peer: &PeerHash) -> bool {
        self.trust_of(peer) == Some(Trust::Pending)
    }

    pub fn members(&self) -> Vec<PeerHash> {
        self.peers
            .lock()
            .iter()
            .filter(|(_, entry)| entry.trust() == Trust::Member)
            .map(|(peer, _)| *peer)
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    // ── Routing ─────────────────────────────────────────────────────

    /// Deliver `signal` without blocking.
    ///
    /// Goes only to the recipient when it is a registered peer, otherwise
    /// to every member link. A peer whose queue is full is disconnected.
    pub fn send(&self, signal: &Signal) {
        self.cache.put_if_absent(signal.nonce());
        let frame = signal.encode();

        let direct = self.peers.lock().get(&signal.recipient()).cloned();
        if let Some(entry) = direct {
            self.enqueue(signal.recipient(), &entry, frame);
            return;
        }

        let members: Vec<(PeerHash, Arc<PeerEntry>)> = self
            .peers
            .lock()
            .iter()
            .filter(|(_, entry)| entry.trust() == Trust::Member)
            .map(|(peer, entry)| (*peer, entry.clone()))
            .collect();
        for (peer, entry) in members {
            self.enqueue(peer, &entry, frame.clone());
        }
    }

    fn enqueue(&self, peer: PeerHash, entry: &Arc<PeerEntry>, frame: Bytes) {
        let result = match entry.outbox.lock().as_ref() {
            Some(outbox) => outbox.try_send(frame),
            None => return,
        };
        match result {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Outbound queue to {peer} is full, disconnecting");
                self.teardown(peer, entry);
            }
            Err(TrySendError::Closed(_)) => {
                self.teardown(peer, entry);
            }
        }
    }

    // ── Subscriptions and events ────────────────────────────────────

    /// Stream every inbound signal of `kind` after dedup.
    ///
    /// A subscriber that falls behind misses signals; one that is dropped
    /// is pruned on the next delivery.
    pub fn subscribe(&self, kind: SignalType) -> mpsc::Receiver<Signal> {
        let (tx, rx) = mpsc::channel(self.outbound_queue);
        self.subscribers.lock().entry(kind).or_default().push(tx);
        rx
    }

    fn notify(&self, signal: &Signal) {
        let mut subscribers = self.subscribers.lock();
        if let Some(list) = subscribers.get_mut(&signal.kind()) {
            list.retain(|tx| !matches!(tx.try_send(signal.clone()), Err(TrySendError::Closed(_))));
        }
    }

    pub fn events(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: MeshEvent) {
        let _ = self.events.send(event);
    }

    // ── Workers ─────────────────────────────────────────────────────

    async fn work(self: Arc<Self>, inbox: Arc<tokio::sync::Mutex<mpsc::Receiver<Inbound>>>) {
        loop {
            let next = {
                let mut inbox = inbox.lock().await;
                tokio::select! {
                    _ = self.shutdown.cancelled() => None,
                    next = inbox.recv() => next,
                }
            };
            let Some(inbound) = next else { break };

            self.notify(&inbound.signal);
            if let Some(handler) = self.handlers.get(&inbound.signal.kind()) {
                handler.handle(&self, inbound).await;
            }
        }
    }

    /// Stop the workers and receive loops and drop every link.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let entries: Vec<(PeerHash, Arc<PeerEntry>)> = self
            .peers
            .lock()
            .iter()
            .map(|(peer, entry)| (*peer, entry.clone()))
            .collect();
        for (peer, entry) in entries {
            self.teardown(peer, &entry);
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// A pending peer may flood only its own admission requests and proofs.
fn pending_may_flood(signal: &Signal, via: PeerHash) -> bool {
    !signal.is_broadcast()
        || (signal.author() == via
            && matches!(
                signal.kind(),
                SignalType::NeedNewbieInvite | SignalType::ConnectionProof
            ))
}
