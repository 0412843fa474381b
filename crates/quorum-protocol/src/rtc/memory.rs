/// In-process WebRTC stand-in.
///
/// Every connection built from the same [`MemoryRtc`] lives on one shared
/// fabric keyed by a session id. Offers and answers carry those ids, so
/// when the offerer applies the answer the two connections are wired
/// together and both see [`ChannelEvent::Open`].
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

use super::{ChannelEvent, PeerConnection, PeerConnectionFactory, SdpType, SessionDescription};
use crate::QuorumProtocolError;

const OFFER_PREFIX: &str = "memory-offer ";
const ANSWER_PREFIX: &str = "memory-answer ";
const EVENT_BUFFER: usize = 256;

#[derive(Default)]
struct Fabric {
    connections: Mutex<HashMap<String, Weak<MemoryConnection>>>,
}

/// Factory for [`MemoryConnection`]s. Clones share one fabric.
#[derive(Clone)]
pub struct MemoryRtc {
    fabric: Arc<Fabric>,
    reachable: bool,
}

impl Default for MemoryRtc {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRtc {
    pub fn new() -> Self {
        Self {
            fabric: Arc::new(Fabric::default()),
            reachable: true,
        }
    }

    /// Negotiation succeeds but no data channel ever opens, as if ICE failed.
    pub fn unreachable() -> Self {
        Self {
            fabric: Arc::new(Fabric::default()),
            reachable: false,
        }
    }

    /// Connections created on this fabric that are still alive and not closed.
    pub fn live_connections(&self) -> usize {
        self.fabric
            .connections
            .lock()
            .values()
            .filter(|conn| conn.strong_count() > 0)
            .count()
    }
}

#[async_trait::async_trait]
impl PeerConnectionFactory for MemoryRtc {
    async fn create(&self) -> Result<Arc<dyn PeerConnection>, QuorumProtocolError> {
        let id = uuid::Uuid::new_v4().to_string();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let conn = Arc::new_cyclic(|me| MemoryConnection {
            id: id.clone(),
            me: me.clone(),
            fabric: self.fabric.clone(),
            reachable: self.reachable,
            state: Mutex::new(State::default()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        });
        self.fabric
            .connections
            .lock()
            .insert(id, Arc::downgrade(&conn));
        Ok(conn)
    }
}

#[derive(Default)]
struct State {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    peer: Option<Weak<MemoryConnection>>,
    open: bool,
    closed: bool,
}

pub struct MemoryConnection {
    id: String,
    me: Weak<MemoryConnection>,
    fabric: Arc<Fabric>,
    reachable: bool,
    state: Mutex<State>,
    events_tx: mpsc::Sender<ChannelEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ChannelEvent>>>,
}

impl MemoryConnection {
    fn lookup(&self, id: &str) -> Option<Arc<MemoryConnection>> {
        self.fabric.connections.lock().get(id).and_then(Weak::upgrade)
    }

    /// Wire the offerer (`self`) to the answerer named in `answer`.
    async fn connect(&self, answer: &SessionDescription) -> Result<(), QuorumProtocolError> {
        let answerer_id = answer
            .sdp
            .strip_prefix(ANSWER_PREFIX)
            .ok_or_else(|| QuorumProtocolError::WebRtc("not a memory answer".into()))?;
        let answerer = self
            .lookup(answerer_id)
            .ok_or_else(|| QuorumProtocolError::WebRtc("answering connection is gone".into()))?;

        let our_offer = self.state.lock().local.clone();
        let their_offer = answerer.state.lock().remote.clone();
        if our_offer.is_none() || our_offer != their_offer {
            return Err(QuorumProtocolError::WebRtc(
                "answer does not match our offer".into(),
            ));
        }

        if !(self.reachable && answerer.reachable) {
            tracing::debug!("Memory connection {} unreachable, channel stays closed", self.id);
            return Ok(());
        }

        {
            let mut ours = self.state.lock();
            let mut theirs = answerer.state.lock();
            if ours.closed || theirs.closed || ours.open || theirs.open {
                return Ok(());
            }
            ours.peer = Some(Arc::downgrade(&answerer));
            ours.open = true;
            theirs.peer = Some(self.me.clone());
            theirs.open = true;
        }

        let _ = self.events_tx.send(ChannelEvent::Open).await;
        let _ = answerer.events_tx.send(ChannelEvent::Open).await;
        Ok(())
    }

    fn open_peer(&self) -> Option<Arc<MemoryConnection>> {
        let state = self.state.lock();
        if !state.open || state.closed {
            return None;
        }
        state.peer.as_ref().and_then(Weak::upgrade)
    }
}

#[async_trait::async_trait]
impl PeerConnection for MemoryConnection {
    async fn create_offer(&self) -> Result<SessionDescription, QuorumProtocolError> {
        Ok(SessionDescription::offer(format!("{OFFER_PREFIX}{}", self.id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, QuorumProtocolError> {
        let state = self.state.lock();
        match &state.remote {
            Some(remote) if remote.sdp_type == SdpType::Offer => Ok(SessionDescription::answer(
                format!("{ANSWER_PREFIX}{}", self.id),
            )),
            _ => Err(QuorumProtocolError::WebRtc(
                "cannot answer without a remote offer".into(),
            )),
        }
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), QuorumProtocolError> {
        self.state.lock().local = Some(description);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), QuorumProtocolError> {
        match description.sdp_type {
            SdpType::Offer => {
                if !description.sdp.starts_with(OFFER_PREFIX) {
                    return Err(QuorumProtocolError::WebRtc("not a memory offer".into()));
                }
                self.state.lock().remote = Some(description);
                Ok(())
            }
            SdpType::Answer => {
                self.connect(&description).await?;
                self.state.lock().remote = Some(description);
                Ok(())
            }
        }
    }

    fn take_events(&self) -> Option<mpsc::Receiver<ChannelEvent>> {
        self.events_rx.lock().take()
    }

    async fn send(&self, data: Bytes) -> Result<(), QuorumProtocolError> {
        let peer = self
            .open_peer()
            .ok_or_else(|| QuorumProtocolError::WebRtc("data channel is not open".into()))?;
        peer.events_tx
            .send(ChannelEvent::Message(data))
            .await
            .map_err(|_| QuorumProtocolError::WebRtc("remote channel dropped".into()))
    }

    async fn close(&self) {
        let (was_open, peer) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let was_open = state.open;
            state.open = false;
            (was_open, state.peer.take().and_then(|peer| peer.upgrade()))
        };
        self.fabric.connections.lock().remove(&self.id);

        if was_open {
            let _ = self.events_tx.send(ChannelEvent::Close).await;
        }
        if let Some(peer) = peer {
            let notify = {
                let mut state = peer.state.lock();
                let notify = state.open && !state.closed;
                state.open = false;
                state.closed = true;
                state.peer = None;
                notify
            };
            peer.fabric.connections.lock().remove(&peer.id);
            if notify {
                let _ = peer.events_tx.send(ChannelEvent::Close).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn negotiate(
        rtc: &MemoryRtc,
    ) -> (Arc<dyn PeerConnection>, Arc<dyn PeerConnection>) {
        let offerer = rtc.create().await.unwrap();
        let answerer = rtc.create().await.unwrap();

        let offer = offerer.create_offer().await.unwrap();
        offerer.set_local_description(offer.clone()).await.unwrap();
        answerer.set_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        answerer.set_local_description(answer.clone()).await.unwrap();
        offerer.set_remote_description(answer).await.unwrap();
        (offerer, answerer)
    }

    #[tokio::test]
    async fn negotiated_pair_opens_and_carries_messages() {
        let rtc = MemoryRtc::new();
        let (offerer, answerer) = negotiate(&rtc).await;
        let mut offer_events = offerer.take_events().unwrap();
        let mut answer_events = answerer.take_events().unwrap();

        assert_eq!(offer_events.recv().await, Some(ChannelEvent::Open));
        assert_eq!(answer_events.recv().await, Some(ChannelEvent::Open));

        offerer.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(
            answer_events.recv().await,
            Some(ChannelEvent::Message(Bytes::from_static(b"ping")))
        );

        answerer.close().await;
        assert_eq!(answer_events.recv().await, Some(ChannelEvent::Close));
        assert_eq!(offer_events.recv().await, Some(ChannelEvent::Close));
        assert!(offerer.send(Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn events_can_be_taken_once() {
        let rtc = MemoryRtc::new();
        let conn = rtc.create().await.unwrap();
        assert!(conn.take_events().is_some());
        assert!(conn.take_events().is_none());
    }

    #[tokio::test]
    async fn answer_needs_remote_offer() {
        let rtc = MemoryRtc::new();
        let conn = rtc.create().await.unwrap();
        assert!(conn.create_answer().await.is_err());
    }

    #[tokio::test]
    async fn unreachable_fabric_never_opens() {
        let rtc = MemoryRtc::unreachable();
        let (offerer, answerer) = negotiate(&rtc).await;
        let mut events = offerer.take_events().unwrap();
        let _answer_events = answerer.take_events().unwrap();

        let waited = tokio::time::timeout(Duration::from_millis(50), events.recv()).await;
        assert!(waited.is_err());
        assert!(offerer.send(Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn closed_connections_leave_the_fabric() {
        let rtc = MemoryRtc::new();
        let (offerer, answerer) = negotiate(&rtc).await;
        assert_eq!(rtc.live_connections(), 2);
        offerer.close().await;
        assert_eq!(rtc.live_connections(), 0);
        drop(answerer);
    }
}
