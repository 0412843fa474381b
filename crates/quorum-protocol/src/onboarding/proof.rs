//! Reporting, counting, promoting: `ConnectionSecret`, `ConnectionProof`,
//! `Trusted`.

use bytes::{BufMut, BytesMut};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use quorum_transport::PeerHash;

use super::{no_exchange, Onboarding, Proof, PROOF_LEN};
use crate::dispatcher::{Dispatcher, Inbound};
use crate::event::MeshEvent;
use crate::signal::{Signal, SignalType};
use crate::QuorumProtocolError;

const HASH_LEN: usize = PeerHash::LEN;

impl Onboarding {
    /// Newbie: a connector handed us its proof over the new channel.
    pub(super) async fn on_connection_secret(
        self: &Arc<Self>,
        dispatcher: &Arc<Dispatcher>,
        inbound: &Inbound,
    ) -> Result<(), QuorumProtocolError> {
        let signal = &inbound.signal;
        if signal.recipient() != self.local() {
            return Err(QuorumProtocolError::malformed(
                "connection secret addressed to someone else",
            ));
        }
        // Only the channel itself may carry the proof.
        let connector = signal.author();
        if inbound.via != connector {
            return Err(QuorumProtocolError::malformed(
                "connection secret relayed instead of sent direct",
            ));
        }
        let proof = Proof::try_from(&signal.payload()[..])
            .map_err(|_| QuorumProtocolError::malformed("connection proof has the wrong length"))?;

        let candidate = self
            .responders
            .get(&connector)
            .ok_or_else(|| no_exchange(connector))?;
        {
            let mut record = candidate.record.lock().await;
            if record.proof.is_some() {
                return Ok(());
            }
            record.proof = Some(proof);
            record.channel_open = true;
        }

        let mut payload = BytesMut::with_capacity(PROOF_LEN + HASH_LEN);
        payload.put_slice(&proof);
        payload.put_slice(connector.as_bytes());
        tracing::debug!("Reporting proof from connector {connector}");
        dispatcher.send(&Signal::broadcast(
            SignalType::ConnectionProof,
            self.local(),
            payload.freeze(),
        ));
        Ok(())
    }

    /// Gateway: count a reported proof; admit the newbie on quorum.
    pub(super) async fn on_connection_proof(
        self: &Arc<Self>,
        dispatcher: &Arc<Dispatcher>,
        inbound: &Inbound,
    ) -> Result<(), QuorumProtocolError> {
        let signal = &inbound.signal;
        let payload = signal.payload();
        if payload.len() != PROOF_LEN + HASH_LEN {
            return Err(QuorumProtocolError::malformed(
                "connection proof report has the wrong length",
            ));
        }

        let newbie = signal.author();
        let Some(candidate) = self.newbies.get(&newbie) else {
            dispatcher.send(signal);
            return Ok(());
        };

        let connector = PeerHash::from_slice(&payload[PROOF_LEN..])
            .ok_or_else(|| QuorumProtocolError::malformed("missing connector hash"))?;

        let (confirmed, public) = {
            let mut record = candidate.record.lock().await;
            match record.proofs.get(&connector) {
                Some(expected) if expected[..] == payload[..PROOF_LEN] => {}
                _ => {
                    return Err(QuorumProtocolError::Crypto(format!(
                        "proof for connector {connector} does not match"
                    )))
                }
            }
            record.confirmed.insert(connector);
            (record.confirmed.len(), record.public.hash())
        };
        tracing::debug!(
            "Newbie {newbie} confirmed {confirmed}/{} connections",
            self.required
        );
        if confirmed < self.required {
            return Ok(());
        }

        // Only the call that removes the record admits the newbie.
        if !self.newbies.remove_if(&newbie, &candidate) {
            return Ok(());
        }
        self.slots.release();
        dispatcher.promote(public);
        dispatcher.send(&Signal::broadcast(
            SignalType::Trusted,
            self.local(),
            public.as_bytes().to_vec(),
        ));
        dispatcher.emit(MeshEvent::Admitted(public));
        tracing::info!("Admitted {public} with {confirmed} connections");
        Ok(())
    }

    /// Everyone: a newbie made it in. Re-flooded unless it came over a
    /// pending link.
    pub(super) async fn on_trusted(
        self: &Arc<Self>,
        dispatcher: &Arc<Dispatcher>,
        inbound: &Inbound,
    ) -> Result<(), QuorumProtocolError> {
        let signal = &inbound.signal;
        if dispatcher.is_pending(&inbound.via) {
            return Err(QuorumProtocolError::malformed(
                "trusted relayed by a pending peer",
            ));
        }
        if signal.payload().len() != HASH_LEN {
            return Err(QuorumProtocolError::malformed("trusted hash has the wrong length"));
        }
        let trusted = PeerHash::from_slice(signal.payload())
            .ok_or_else(|| QuorumProtocolError::malformed("trusted hash has the wrong length"))?;
        if inbound.via == trusted {
            return Err(QuorumProtocolError::malformed("peer vouched for itself"));
        }

        if trusted == self.local() {
            self.admit_self(dispatcher).await;
        } else if let Some(candidate) = self.initiators.get(&trusted) {
            let open = candidate.record.lock().await.channel_open;
            if open && self.initiators.remove_if(&trusted, &candidate) {
                self.slots.release();
                dispatcher.promote(trusted);
                tracing::debug!("Sponsored newbie {trusted} admitted");
            }
        }

        dispatcher.send(signal);
        Ok(())
    }

    async fn admit_self(&self, dispatcher: &Dispatcher) {
        if self.admitted.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Admitted to the mesh as {}", self.local());
        dispatcher.emit(MeshEvent::SelfAdmitted);

        for peer in self.responders.peers() {
            let Some(candidate) = self.responders.get(&peer) else {
                continue;
            };
            let open = candidate.record.lock().await.channel_open;
            if open && self.responders.remove_if(&peer, &candidate) {
                dispatcher.promote(peer);
            }
        }
    }
}
