//! Seeking, sponsoring and offering: `NeedNewbieInvite`, `NeedInvite`,
//! `ReadyToInviteNewbie`, `ReadyToInvite`.

use bytes::{BufMut, BytesMut};
use std::sync::Arc;

use quorum_transport::{crypto, PublicIdentity};

use super::{handshake_of, InitiatorRecord, Onboarding, Proof, ResponderRecord, Secret, PROOF_LEN};
use crate::dispatcher::{Dispatcher, Inbound};
use crate::signal::{Signal, SignalType};
use crate::QuorumProtocolError;

impl Onboarding {
    pub(super) async fn on_need_newbie_invite(
        self: &Arc<Self>,
        dispatcher: &Arc<Dispatcher>,
        inbound: &Inbound,
    ) -> Result<(), QuorumProtocolError> {
        let signal = &inbound.signal;
        let newbie = handshake_of(signal)?;
        let peer = newbie.hash();
        if peer == self.local() {
            return Ok(());
        }

        if self.is_admitted() {
            if inbound.via == peer && dispatcher.is_pending(&peer) {
                self.open_newbie(dispatcher, newbie);
            } else if dispatcher.trust_of(&peer).is_none() && !self.initiators.contains(&peer) {
                self.sponsor(dispatcher, newbie);
            }
        }

        // More than one connector has to hear the call.
        dispatcher.send(signal);
        Ok(())
    }

    /// Gateway: start counting proofs for a newbie on one of our pending links.
    fn open_newbie(self: &Arc<Self>, dispatcher: &Arc<Dispatcher>, newbie: PublicIdentity) {
        let peer = newbie.hash();
        if self.newbies.contains(&peer) {
            return;
        }
        if !self.slots.try_reserve() {
            tracing::debug!("No admission slot for newbie {peer}, passing through");
            return;
        }
        if self.insert_newbie(dispatcher, newbie) {
            tracing::info!("Gateway for newbie {peer}");
        } else {
            self.slots.release();
        }
    }

    /// Connector: generate a proof and invite the newbie.
    fn sponsor(self: &Arc<Self>, dispatcher: &Arc<Dispatcher>, newbie: PublicIdentity) {
        let peer = newbie.hash();
        if !self.slots.try_reserve() {
            tracing::debug!("No admission slot to sponsor {peer}, passing through");
            return;
        }

        let proof: Proof = crypto::random_bytes();
        let record = InitiatorRecord {
            remote: newbie,
            proof: Some(proof),
            secret: None,
            connection: None,
            answered: false,
            channel_open: false,
        };
        if !self.insert_initiator(dispatcher, record) {
            self.slots.release();
            return;
        }

        let nested = Signal::new(
            SignalType::ReadyToInvite,
            self.local(),
            peer,
            self.identity.public().to_handshake().to_vec(),
        );
        let mut payload = BytesMut::with_capacity(PROOF_LEN + nested.encoded_len());
        payload.put_slice(&proof);
        payload.put_slice(&nested.encode());

        tracing::debug!("Sponsoring newbie {peer}");
        dispatcher.send(&Signal::new(
            SignalType::ReadyToInviteNewbie,
            self.local(),
            peer,
            payload.freeze(),
        ));
    }

    /// A member asks for more direct links.
    pub(super) async fn on_need_invite(
        self: &Arc<Self>,
        dispatcher: &Arc<Dispatcher>,
        inbound: &Inbound,
    ) -> Result<(), QuorumProtocolError> {
        if dispatcher.is_pending(&inbound.via) {
            return Err(QuorumProtocolError::malformed(
                "link request over a pending link",
            ));
        }
        let signal = &inbound.signal;
        let requester = handshake_of(signal)?;
        let peer = requester.hash();
        if peer == self.local() {
            return Ok(());
        }

        let unlinked = dispatcher.trust_of(&peer).is_none()
            && !self.initiators.contains(&peer)
            && !self.responders.contains(&peer);
        if self.is_admitted() && unlinked && self.slots.try_reserve() {
            let record = InitiatorRecord {
                remote: requester,
                proof: None,
                secret: None,
                connection: None,
                answered: false,
                channel_open: false,
            };
            if self.insert_initiator(dispatcher, record) {
                tracing::debug!("Offering a link to {peer}");
                dispatcher.send(&Signal::new(
                    SignalType::ReadyToInvite,
                    self.local(),
                    peer,
                    self.identity.public().to_handshake().to_vec(),
                ));
            } else {
                self.slots.release();
            }
        }

        dispatcher.send(signal);
        Ok(())
    }

    pub(super) async fn on_ready_to_invite_newbie(
        self: &Arc<Self>,
        dispatcher: &Arc<Dispatcher>,
        inbound: &Inbound,
    ) -> Result<(), QuorumProtocolError> {
        let signal = &inbound.signal;
        let payload = signal.payload();
        if payload.len() < PROOF_LEN {
            return Err(QuorumProtocolError::malformed("missing connection proof"));
        }
        let mut proof: Proof = [0u8; PROOF_LEN];
        proof.copy_from_slice(&payload[..PROOF_LEN]);
        let nested = Signal::decode(payload.slice(PROOF_LEN..))?;
        if nested.kind() != SignalType::ReadyToInvite
            || nested.author() != signal.author()
            || nested.recipient() != signal.recipient()
        {
            return Err(QuorumProtocolError::malformed(
                "nested invite does not match its envelope",
            ));
        }

        let newbie = signal.recipient();
        if newbie == self.local() {
            let unwrapped = Inbound {
                signal: nested,
                via: inbound.via,
            };
            return self.on_ready_to_invite(dispatcher, &unwrapped).await;
        }

        if let Some(candidate) = self.newbies.get(&newbie) {
            let connector = signal.author();
            {
                let mut record = candidate.record.lock().await;
                if !record.proofs.contains_key(&connector)
                    && record.proofs.len() >= self.max_connectors
                {
                    tracing::debug!("Newbie {newbie} already has enough connectors");
                    return Ok(());
                }
                record.proofs.insert(connector, proof);
            }
            // The proof stays here; only the invite goes down to the newbie.
            dispatcher.send(&nested);
            return Ok(());
        }

        dispatcher.send(signal);
        Ok(())
    }

    pub(super) async fn on_ready_to_invite(
        self: &Arc<Self>,
        dispatcher: &Arc<Dispatcher>,
        inbound: &Inbound,
    ) -> Result<(), QuorumProtocolError> {
        let signal = &inbound.signal;
        if self.relay_unless_mine(dispatcher, signal) {
            return Ok(());
        }
        let connector = handshake_of(signal)?;
        let peer = connector.hash();
        if self.responders.contains(&peer) || dispatcher.trust_of(&peer).is_some() {
            return Ok(());
        }
        if self.responders.len() >= self.max_connectors {
            tracing::debug!("Ignoring invite from {peer}, enough connectors in flight");
            return Ok(());
        }

        let secret: Secret = crypto::random_bytes();
        let payload = self.seal_signed(&secret, &connector)?;
        let record = ResponderRecord {
            remote: connector,
            secret,
            connection: None,
            proof: None,
            channel_open: false,
        };
        if !self.insert_responder(dispatcher, record) {
            return Ok(());
        }

        dispatcher.send(&Signal::new(
            SignalType::WaitOffer,
            self.local(),
            peer,
            payload,
        ));
        Ok(())
    }
}
