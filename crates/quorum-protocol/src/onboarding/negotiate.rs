//! Proposing, answering, connecting: `WaitOffer`, `WaitAnswer`, `Answer`,
//! and the task that drives each data channel once it exists.

use std::sync::Arc;
use tokio::sync::mpsc;

use quorum_transport::PeerHash;

use super::{no_exchange, Onboarding, Proof, Role, Secret};
use crate::dispatcher::{Dispatcher, Inbound, Trust};
use crate::rtc::{ChannelEvent, PeerConnection, SdpType};
use crate::signal::{Signal, SignalType};
use crate::QuorumProtocolError;

/// Frames buffered between a data channel and the dispatcher.
const CHANNEL_INBOUND: usize = 256;

impl Onboarding {
    /// Connector: the responder sent its secret; build and send an offer.
    pub(super) async fn on_wait_offer(
        self: &Arc<Self>,
        dispatcher: &Arc<Dispatcher>,
        inbound: &Inbound,
    ) -> Result<(), QuorumProtocolError> {
        let signal = &inbound.signal;
        if self.relay_unless_mine(dispatcher, signal) {
            return Ok(());
        }
        let peer = signal.author();
        let candidate = self.initiators.get(&peer).ok_or_else(|| no_exchange(peer))?;
        let mut record = candidate.record.lock().await;
        if record.secret.is_some() {
            return Ok(());
        }

        let plain = self.open_signed(signal.payload(), &record.remote)?;
        let secret: Secret = plain
            .as_slice()
            .try_into()
            .map_err(|_| QuorumProtocolError::malformed("secret has the wrong length"))?;

        let connection = self.rtc.create().await?;
        let offer = connection.create_offer().await?;
        connection.set_local_description(offer.clone()).await?;
        let payload = self.seal_sdp(secret, offer, &record.remote)?;

        self.spawn_driver(dispatcher, connection.clone(), peer, Role::Initiator)?;
        record.secret = Some(secret);
        record.connection = Some(connection);
        drop(record);

        dispatcher.send(&Signal::new(
            SignalType::WaitAnswer,
            self.local(),
            peer,
            payload,
        ));
        Ok(())
    }

    /// Responder: the connector proved it read our secret; answer its offer.
    pub(super) async fn on_wait_answer(
        self: &Arc<Self>,
        dispatcher: &Arc<Dispatcher>,
        inbound: &Inbound,
    ) -> Result<(), QuorumProtocolError> {
        let signal = &inbound.signal;
        if self.relay_unless_mine(dispatcher, signal) {
            return Ok(());
        }
        let peer = signal.author();
        let candidate = self.responders.get(&peer).ok_or_else(|| no_exchange(peer))?;
        let mut record = candidate.record.lock().await;
        if record.connection.is_some() {
            return Ok(());
        }

        let envelope = self.open_sdp(signal.payload(), &record.remote)?;
        if envelope.secret != record.secret {
            return Err(QuorumProtocolError::Crypto(
                "echoed secret does not match".into(),
            ));
        }
        if envelope.description.sdp_type != SdpType::Offer {
            return Err(QuorumProtocolError::WebRtc("expected an offer".into()));
        }

        let connection = self.rtc.create().await?;
        connection
            .set_remote_description(envelope.description)
            .await?;
        let answer = connection.create_answer().await?;
        connection.set_local_description(answer.clone()).await?;
        let payload = self.seal_sdp(record.secret, answer, &record.remote)?;

        self.spawn_driver(dispatcher, connection.clone(), peer, Role::Responder)?;
        record.connection = Some(connection);
        drop(record);

        dispatcher.send(&Signal::new(
            SignalType::Answer,
            self.local(),
            peer,
            payload,
        ));
        Ok(())
    }

    /// Connector: apply the answer. The channel opens out of band.
    pub(super) async fn on_answer(
        self: &Arc<Self>,
        dispatcher: &Arc<Dispatcher>,
        inbound: &Inbound,
    ) -> Result<(), QuorumProtocolError> {
        let signal = &inbound.signal;
        if self.relay_unless_mine(dispatcher, signal) {
            return Ok(());
        }
        let peer = signal.author();
        let candidate = self.initiators.get(&peer).ok_or_else(|| no_exchange(peer))?;
        let mut record = candidate.record.lock().await;
        if record.answered {
            return Ok(());
        }
        let (Some(secret), Some(connection)) = (record.secret, record.connection.clone()) else {
            return Err(QuorumProtocolError::malformed("answer before offer"));
        };

        let envelope = self.open_sdp(signal.payload(), &record.remote)?;
        if envelope.secret != secret {
            return Err(QuorumProtocolError::Crypto(
                "echoed secret does not match".into(),
            ));
        }
        if envelope.description.sdp_type != SdpType::Answer {
            return Err(QuorumProtocolError::WebRtc("expected an answer".into()));
        }

        connection
            .set_remote_description(envelope.description)
            .await?;
        record.answered = true;
        tracing::debug!("Answer from {peer} applied, waiting for the channel");
        Ok(())
    }

    fn spawn_driver(
        self: &Arc<Self>,
        dispatcher: &Arc<Dispatcher>,
        connection: Arc<dyn PeerConnection>,
        peer: PeerHash,
        role: Role,
    ) -> Result<(), QuorumProtocolError> {
        let events = connection
            .take_events()
            .ok_or_else(|| QuorumProtocolError::WebRtc("channel events already taken".into()))?;
        tokio::spawn(
            self.clone()
                .drive_channel(dispatcher.clone(), connection, events, peer, role),
        );
        Ok(())
    }

    /// Wire one data channel into the dispatcher for as long as it lives.
    async fn drive_channel(
        self: Arc<Self>,
        dispatcher: Arc<Dispatcher>,
        connection: Arc<dyn PeerConnection>,
        mut events: mpsc::Receiver<ChannelEvent>,
        peer: PeerHash,
        role: Role,
    ) {
        let mut inbound: Option<mpsc::Sender<bytes::Bytes>> = None;
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Open => {
                    if inbound.is_some() {
                        continue;
                    }
                    let Some((trust, proof)) = self.channel_opened(peer, role).await else {
                        tracing::debug!("Channel to {peer} opened after its exchange ended");
                        connection.close().await;
                        break;
                    };

                    let (tx, rx) = mpsc::channel(CHANNEL_INBOUND);
                    let outbound = dispatcher.dispatch(peer, trust, rx);
                    tokio::spawn(write_channel(connection.clone(), outbound));
                    inbound = Some(tx);
                    tracing::debug!(?trust, "Data channel to {peer} open");

                    // Admission may have landed between the trust decision
                    // and registration.
                    if role == Role::Responder && trust == Trust::Pending && self.is_admitted() {
                        if let Some(candidate) = self.responders.get(&peer) {
                            self.responders.remove_if(&peer, &candidate);
                        }
                        dispatcher.promote(peer);
                    }

                    if let Some(proof) = proof {
                        dispatcher.send(&Signal::new(
                            SignalType::ConnectionSecret,
                            self.local(),
                            peer,
                            proof.to_vec(),
                        ));
                    }
                }
                ChannelEvent::Message(frame) => {
                    let Some(tx) = &inbound else { continue };
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
                ChannelEvent::Close => break,
            }
        }
        tracing::debug!("Data channel to {peer} closed");
    }

    /// Mark the record's channel open and decide how far to trust it.
    ///
    /// Top-up channels join as members and finish their exchange here.
    /// Newbie channels stay pending until `Trusted`. Returns the proof to
    /// send when we are the connector.
    async fn channel_opened(&self, peer: PeerHash, role: Role) -> Option<(Trust, Option<Proof>)> {
        match role {
            Role::Initiator => {
                let candidate = self.initiators.get(&peer)?;
                let proof = {
                    let mut record = candidate.record.lock().await;
                    record.channel_open = true;
                    record.proof
                };
                match proof {
                    Some(proof) => Some((Trust::Pending, Some(proof))),
                    None => {
                        if self.initiators.remove_if(&peer, &candidate) {
                            self.slots.release();
                        }
                        Some((Trust::Member, None))
                    }
                }
            }
            Role::Responder => {
                let candidate = self.responders.get(&peer)?;
                candidate.record.lock().await.channel_open = true;
                if self.is_admitted() {
                    self.responders.remove_if(&peer, &candidate);
                    Some((Trust::Member, None))
                } else {
                    Some((Trust::Pending, None))
                }
            }
        }
    }
}

/// Drain the dispatcher's queue into the channel; close it when either ends.
async fn write_channel(connection: Arc<dyn PeerConnection>, mut outbound: mpsc::Receiver<bytes::Bytes>) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = connection.send(frame).await {
            tracing::debug!("Data channel write failed: {e}");
            break;
        }
    }
    connection.close().await;
}
