/// Mesh onboarding state machine.
///
/// Three roles take part in admitting a newbie:
///
/// - the **gateway** holds the newbie's transport link as `Pending`, keeps
///   the `newbie` record, counts connection proofs and emits `Trusted`;
/// - each **connector** answers the newbie's call with a fresh connection
///   proof and negotiates a direct data channel (`initiator` record);
/// - the **newbie** answers every connector (`responder` record) and
///   reports each proof it receives over a channel.
///
/// The same negotiation, minus proofs and quorum, tops up links between
/// members that are already admitted.
mod candidate;
mod invite;
mod negotiate;
mod proof;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quorum_transport::{crypto, Identity, PeerHash, PublicIdentity, SIGNATURE_LEN};

use crate::config::MeshConfig;
use crate::dispatcher::{Dispatcher, HandlerTable, Inbound, SignalHandler};
use crate::event::MeshEvent;
use crate::rtc::{PeerConnection, PeerConnectionFactory, SessionDescription};
use crate::signal::{Signal, SignalType};
use crate::QuorumProtocolError;

use candidate::{AdmissionSlots, CandidateTable};

/// Width of a connection proof.
pub const PROOF_LEN: usize = 26;
/// Width of the secret a responder hands its connector.
pub const SECRET_LEN: usize = 32;

pub(crate) type Proof = [u8; PROOF_LEN];
pub(crate) type Secret = [u8; SECRET_LEN];

/// Gateway-side state for one newbie.
pub(crate) struct NewbieRecord {
    public: PublicIdentity,
    /// Proof each connector generated, learned from `ReadyToInviteNewbie`.
    proofs: HashMap<PeerHash, Proof>,
    /// Connectors whose proof came back from the newbie.
    confirmed: HashSet<PeerHash>,
}

/// Connector-side state.
pub(crate) struct InitiatorRecord {
    remote: PublicIdentity,
    /// `None` for a member top-up.
    proof: Option<Proof>,
    secret: Option<Secret>,
    connection: Option<Arc<dyn PeerConnection>>,
    answered: bool,
    channel_open: bool,
}

/// State on the side being connected to.
pub(crate) struct ResponderRecord {
    remote: PublicIdentity,
    secret: Secret,
    connection: Option<Arc<dyn PeerConnection>>,
    proof: Option<Proof>,
    channel_open: bool,
}

/// Secret plus SDP, sealed inside `WaitAnswer` and `Answer`.
#[derive(Serialize, Deserialize)]
struct SdpEnvelope {
    secret: Secret,
    description: SessionDescription,
}

/// Which end of a data channel we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Initiator,
    Responder,
}

pub struct Onboarding {
    identity: Arc<Identity>,
    rtc: Arc<dyn PeerConnectionFactory>,
    required: usize,
    max_connectors: usize,
    timeout: Duration,
    slots: AdmissionSlots,
    newbies: CandidateTable<NewbieRecord>,
    initiators: CandidateTable<InitiatorRecord>,
    responders: CandidateTable<ResponderRecord>,
    admitted: AtomicBool,
}

impl Onboarding {
    /// Signal types this machine owns.
    pub const HANDLED: [SignalType; 10] = [
        SignalType::NeedInvite,
        SignalType::NeedNewbieInvite,
        SignalType::ReadyToInviteNewbie,
        SignalType::ReadyToInvite,
        SignalType::WaitOffer,
        SignalType::WaitAnswer,
        SignalType::Answer,
        SignalType::ConnectionSecret,
        SignalType::ConnectionProof,
        SignalType::Trusted,
    ];

    pub fn new(
        identity: Arc<Identity>,
        rtc: Arc<dyn PeerConnectionFactory>,
        config: &MeshConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            rtc,
            required: config.required_connections,
            max_connectors: config.max_connectors,
            timeout: config.admission_timeout,
            slots: AdmissionSlots::new(config.admission_slots),
            newbies: CandidateTable::new(),
            initiators: CandidateTable::new(),
            responders: CandidateTable::new(),
            admitted: AtomicBool::new(config.founder),
        })
    }

    /// Bind every onboarding signal type to this machine.
    pub fn register(self: &Arc<Self>, table: &mut HandlerTable) {
        let handler: Arc<dyn SignalHandler> = Arc::new(OnboardingHandler(self.clone()));
        for kind in Self::HANDLED {
            table.insert(kind, handler.clone());
        }
    }

    fn local(&self) -> PeerHash {
        self.identity.hash()
    }

    pub fn is_admitted(&self) -> bool {
        self.admitted.load(Ordering::Acquire)
    }

    /// Newbies this node is gateway for.
    pub fn pending_admissions(&self) -> usize {
        self.newbies.len()
    }

    pub fn free_slots(&self) -> usize {
        self.slots.available()
    }

    /// `NeedNewbieInvite` carrying our handshake.
    pub fn seek_signal(&self) -> Signal {
        Signal::broadcast(
            SignalType::NeedNewbieInvite,
            self.local(),
            self.identity.public().to_handshake().to_vec(),
        )
    }

    /// `NeedInvite` carrying our handshake.
    pub fn top_up_signal(&self) -> Signal {
        Signal::broadcast(
            SignalType::NeedInvite,
            self.local(),
            self.identity.public().to_handshake().to_vec(),
        )
    }

    /// Drop every record and close the connections they own.
    pub async fn shutdown(&self) {
        self.newbies.clear();
        for candidate in self.initiators.clear() {
            if let Some(connection) = candidate.record.lock().await.connection.take() {
                connection.close().await;
            }
        }
        for candidate in self.responders.clear() {
            if let Some(connection) = candidate.record.lock().await.connection.take() {
                connection.close().await;
            }
        }
    }

    // ── Shared helpers ──────────────────────────────────────────────

    /// Pass on a signal addressed to someone else. Returns true if it did.
    fn relay_unless_mine(&self, dispatcher: &Dispatcher, signal: &Signal) -> bool {
        if signal.recipient() == self.local() {
            return false;
        }
        dispatcher.send(signal);
        true
    }

    /// Encrypt to `to`, then append our signature over the ciphertext.
    fn seal_signed(
        &self,
        plaintext: &[u8],
        to: &PublicIdentity,
    ) -> Result<Bytes, QuorumProtocolError> {
        let ciphertext = crypto::encrypt(plaintext, &self.identity, to)
            .map_err(|e| QuorumProtocolError::Crypto(e.to_string()))?;
        let signature = self.identity.sign(&ciphertext);

        let mut out = BytesMut::with_capacity(ciphertext.len() + SIGNATURE_LEN);
        out.put_slice(&ciphertext);
        out.put_slice(&signature);
        Ok(out.freeze())
    }

    /// Verify the trailing signature against `from`, then decrypt.
    fn open_signed(
        &self,
        payload: &[u8],
        from: &PublicIdentity,
    ) -> Result<Vec<u8>, QuorumProtocolError> {
        if payload.len() < SIGNATURE_LEN {
            return Err(QuorumProtocolError::malformed("payload shorter than a signature"));
        }
        let (ciphertext, signature) = payload.split_at(payload.len() - SIGNATURE_LEN);
        from.verify(ciphertext, signature)
            .map_err(|_| QuorumProtocolError::InvalidSignature)?;
        crypto::decrypt(ciphertext, &self.identity, from)
            .map_err(|e| QuorumProtocolError::Crypto(e.to_string()))
    }

    fn seal_sdp(
        &self,
        secret: Secret,
        description: SessionDescription,
        to: &PublicIdentity,
    ) -> Result<Bytes, QuorumProtocolError> {
        let body = rmp_serde::to_vec(&SdpEnvelope {
            secret,
            description,
        })?;
        self.seal_signed(&body, to)
    }

    fn open_sdp(
        &self,
        payload: &[u8],
        from: &PublicIdentity,
    ) -> Result<SdpEnvelope, QuorumProtocolError> {
        let body = self.open_signed(payload, from)?;
        Ok(rmp_serde::from_slice(&body)?)
    }

    // ── Record lifecycle ────────────────────────────────────────────

    fn insert_initiator(
        self: &Arc<Self>,
        dispatcher: &Arc<Dispatcher>,
        record: InitiatorRecord,
    ) -> bool {
        let peer = record.remote.hash();
        let machine = self.clone();
        let dispatcher = dispatcher.clone();
        self.initiators
            .insert(peer, record, self.timeout, move |expired| async move {
                machine.slots.release();
                if let Some(connection) = expired.record.lock().await.connection.take() {
                    connection.close().await;
                }
                if dispatcher.is_pending(&peer) {
                    dispatcher.disconnect(peer);
                }
                tracing::debug!("Connector exchange with {peer} expired");
            })
            .is_some()
    }

    fn insert_responder(
        self: &Arc<Self>,
        dispatcher: &Arc<Dispatcher>,
        record: ResponderRecord,
    ) -> bool {
        let peer = record.remote.hash();
        let dispatcher = dispatcher.clone();
        self.responders
            .insert(peer, record, self.timeout, move |expired| async move {
                if let Some(connection) = expired.record.lock().await.connection.take() {
                    connection.close().await;
                }
                if dispatcher.is_pending(&peer) {
                    dispatcher.disconnect(peer);
                }
                tracing::debug!("Responder exchange with {peer} expired");
            })
            .is_some()
    }

    fn insert_newbie(self: &Arc<Self>, dispatcher: &Arc<Dispatcher>, public: PublicIdentity) -> bool {
        let peer = public.hash();
        let record = NewbieRecord {
            public,
            proofs: HashMap::new(),
            confirmed: HashSet::new(),
        };
        let machine = self.clone();
        let dispatcher = dispatcher.clone();
        self.newbies
            .insert(peer, record, self.timeout, move |expired| async move {
                machine.slots.release();
                let confirmed = expired.record.lock().await.confirmed.len();
                tracing::info!(
                    "Admission of {peer} expired with {confirmed}/{} proofs",
                    machine.required
                );
                dispatcher.emit(MeshEvent::AdmissionExpired(peer));
            })
            .is_some()
    }
}

/// Routes onboarding signals to the step that owns them.
struct OnboardingHandler(Arc<Onboarding>);

#[async_trait::async_trait]
impl SignalHandler for OnboardingHandler {
    async fn handle(&self, dispatcher: &Arc<Dispatcher>, inbound: Inbound) {
        let machine = &self.0;
        let kind = inbound.signal.kind();
        let result = match kind {
            SignalType::NeedInvite => machine.on_need_invite(dispatcher, &inbound).await,
            SignalType::NeedNewbieInvite => {
                machine.on_need_newbie_invite(dispatcher, &inbound).await
            }
            SignalType::ReadyToInviteNewbie => {
                machine.on_ready_to_invite_newbie(dispatcher, &inbound).await
            }
            SignalType::ReadyToInvite => machine.on_ready_to_invite(dispatcher, &inbound).await,
            SignalType::WaitOffer => machine.on_wait_offer(dispatcher, &inbound).await,
            SignalType::WaitAnswer => machine.on_wait_answer(dispatcher, &inbound).await,
            SignalType::Answer => machine.on_answer(dispatcher, &inbound).await,
            SignalType::ConnectionSecret => {
                machine.on_connection_secret(dispatcher, &inbound).await
            }
            SignalType::ConnectionProof => {
                machine.on_connection_proof(dispatcher, &inbound).await
            }
            SignalType::Trusted => machine.on_trusted(dispatcher, &inbound).await,
            SignalType::Message => Ok(()),
        };
        if let Err(e) = result {
            tracing::debug!(
                "Dropping {kind} from {} via {}: {e}",
                inbound.signal.author(),
                inbound.via
            );
        }
    }
}

/// Parse a handshake payload and check it belongs to the signal's author.
fn handshake_of(signal: &Signal) -> Result<PublicIdentity, QuorumProtocolError> {
    let public = PublicIdentity::from_handshake(signal.payload())?;
    if public.hash() != signal.author() {
        return Err(QuorumProtocolError::malformed(
            "handshake key does not hash to the author",
        ));
    }
    Ok(public)
}

fn no_exchange(peer: PeerHash) -> QuorumProtocolError {
    QuorumProtocolError::malformed(format!("no exchange in flight with {peer}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ReplayCache;
    use crate::dispatcher::Trust;
    use crate::rtc::memory::MemoryRtc;
    use tokio::sync::mpsc;

    fn machine(config: &MeshConfig) -> Arc<Onboarding> {
        Onboarding::new(
            Arc::new(Identity::generate()),
            Arc::new(MemoryRtc::new()),
            config,
        )
    }

    #[test]
    fn sealed_payload_opens_only_for_its_recipient() {
        let alice = machine(&MeshConfig::new());
        let bob = machine(&MeshConfig::new());
        let eve = machine(&MeshConfig::new());

        let sealed = alice
            .seal_signed(b"secret", bob.identity.public())
            .unwrap();
        let opened = bob.open_signed(&sealed, alice.identity.public()).unwrap();
        assert_eq!(opened, b"secret");

        assert!(eve.open_signed(&sealed, alice.identity.public()).is_err());
        // Claiming the wrong author fails the signature check.
        assert!(matches!(
            bob.open_signed(&sealed, eve.identity.public()),
            Err(QuorumProtocolError::InvalidSignature)
        ));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let alice = machine(&MeshConfig::new());
        let bob = machine(&MeshConfig::new());
        let mut sealed = alice
            .seal_signed(b"secret", bob.identity.public())
            .unwrap()
            .to_vec();
        sealed[0] ^= 1;
        assert!(bob.open_signed(&sealed, alice.identity.public()).is_err());
        assert!(bob.open_signed(&sealed[..10], alice.identity.public()).is_err());
    }

    #[test]
    fn sdp_envelope_carries_secret_and_description() {
        let alice = machine(&MeshConfig::new());
        let bob = machine(&MeshConfig::new());
        let secret = [9u8; SECRET_LEN];
        let sealed = alice
            .seal_sdp(secret, SessionDescription::offer("v=0"), bob.identity.public())
            .unwrap();
        let envelope = bob.open_sdp(&sealed, alice.identity.public()).unwrap();
        assert_eq!(envelope.secret, secret);
        assert_eq!(envelope.description, SessionDescription::offer("v=0"));
    }

    #[test]
    fn handshake_must_hash_to_author() {
        let alice = machine(&MeshConfig::new());
        let bob = machine(&MeshConfig::new());

        let seek = alice.seek_signal();
        assert_eq!(seek.kind(), SignalType::NeedNewbieInvite);
        assert!(seek.is_broadcast());
        assert_eq!(handshake_of(&seek).unwrap().hash(), alice.local());

        let forged = Signal::broadcast(
            SignalType::NeedNewbieInvite,
            bob.local(),
            alice.identity.public().to_handshake().to_vec(),
        );
        assert!(handshake_of(&forged).is_err());
    }

    #[test]
    fn every_onboarding_type_is_registered() {
        let m = machine(&MeshConfig::new());
        let mut table = HandlerTable::new();
        m.register(&mut table);
        assert_eq!(table.len(), Onboarding::HANDLED.len());
        assert!(!table.contains_key(&SignalType::Message));
    }

    fn wire(m: &Arc<Onboarding>, config: &MeshConfig) -> Arc<Dispatcher> {
        let mut table = HandlerTable::new();
        m.register(&mut table);
        Dispatcher::start(m.local(), Arc::new(ReplayCache::new(4, 64)), table, config)
    }

    async fn next_signal(rx: &mut mpsc::Receiver<Bytes>) -> Signal {
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        Signal::decode(frame).unwrap()
    }

    fn seek_from(newbie: &Identity) -> Signal {
        Signal::broadcast(
            SignalType::NeedNewbieInvite,
            newbie.hash(),
            newbie.public().to_handshake().to_vec(),
        )
    }

    /// `ReadyToInviteNewbie` as a connector would build it.
    fn sponsorship(connector: &Identity, newbie: PeerHash) -> (Signal, Signal) {
        let nested = Signal::new(
            SignalType::ReadyToInvite,
            connector.hash(),
            newbie,
            connector.public().to_handshake().to_vec(),
        );
        let mut payload = BytesMut::new();
        payload.put_slice(&[7u8; PROOF_LEN]);
        payload.put_slice(&nested.encode());
        let outer = Signal::new(
            SignalType::ReadyToInviteNewbie,
            connector.hash(),
            newbie,
            payload.freeze(),
        );
        (outer, nested)
    }

    #[tokio::test]
    async fn exhausted_slots_pass_newbie_requests_on() {
        let config = MeshConfig::new().founder(true).admission_slots(0);
        let m = machine(&config);
        let d = wire(&m, &config);

        let gateway = PeerHash::from_bytes([1u8; 32]);
        let (gateway_tx, gateway_rx) = mpsc::channel(8);
        let _gateway_out = d.dispatch(gateway, Trust::Member, gateway_rx);
        let mut next_hop = d.register(PeerHash::from_bytes([2u8; 32]), Trust::Member);

        let newbie = Identity::generate();
        let seek = seek_from(&newbie);
        gateway_tx.send(seek.encode()).await.unwrap();

        assert_eq!(next_signal(&mut next_hop).await, seek);
        assert_eq!(m.initiators.len(), 0);
        assert_eq!(m.free_slots(), 0);
    }

    #[tokio::test]
    async fn gateway_forwards_at_most_max_connectors_invites() {
        let config = MeshConfig::new()
            .founder(true)
            .required_connections(1)
            .max_connectors(1);
        let m = machine(&config);
        let d = wire(&m, &config);

        let newbie = Identity::generate();
        let (newbie_tx, newbie_rx) = mpsc::channel(8);
        let mut to_newbie = d.dispatch(newbie.hash(), Trust::Pending, newbie_rx);
        newbie_tx.send(seek_from(&newbie).encode()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while m.pending_admissions() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let (hub_tx, hub_rx) = mpsc::channel(8);
        let _hub_out = d.dispatch(PeerHash::from_bytes([3u8; 32]), Trust::Member, hub_rx);
        let first = Identity::generate();
        let second = Identity::generate();
        let (first_outer, first_nested) = sponsorship(&first, newbie.hash());
        let (second_outer, second_nested) = sponsorship(&second, newbie.hash());
        hub_tx.send(first_outer.encode()).await.unwrap();
        hub_tx.send(second_outer.encode()).await.unwrap();

        let invite = next_signal(&mut to_newbie).await;
        assert!(invite == first_nested || invite == second_nested);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(to_newbie.try_recv().is_err());
    }

    #[test]
    fn founders_start_admitted() {
        assert!(machine(&MeshConfig::new().founder(true)).is_admitted());
        let newbie = machine(&MeshConfig::new().admission_slots(3));
        assert!(!newbie.is_admitted());
        assert_eq!(newbie.free_slots(), 3);
        assert_eq!(newbie.pending_admissions(), 0);
    }
}
