#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use quorum_protocol::{MemoryRtc, MeshConfig, MeshEvent, MeshNode};
use quorum_transport::{Direction, Identity};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
}

/// Same seed, same keys, same hash in every run.
pub fn identity(seed: u64) -> Arc<Identity> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut ecdh = [0u8; 32];
    let mut signing = [0u8; 32];
    rng.fill_bytes(&mut ecdh);
    rng.fill_bytes(&mut signing);
    Arc::new(Identity::from_secret_bytes(ecdh, signing))
}

pub fn config() -> MeshConfig {
    MeshConfig::new()
        .required_connections(2)
        .admission_timeout(Duration::from_secs(5))
        .workers(2)
}

pub fn node(seed: u64, config: MeshConfig, rtc: &MemoryRtc) -> MeshNode {
    MeshNode::start_with_identity(identity(seed), config, Arc::new(rtc.clone())).unwrap()
}

pub fn founder(seed: u64, rtc: &MemoryRtc) -> MeshNode {
    node(seed, config().founder(true), rtc)
}

/// Link `dialer` to `listener` over an in-memory stream.
///
/// With `vouched`, the listener treats the dialer as a member.
pub async fn link(dialer: &MeshNode, listener: &MeshNode, vouched: bool) {
    if vouched {
        listener.trust(dialer.id());
    }
    let (a, b) = tokio::io::duplex(256 * 1024);
    let (dialed, accepted) = tokio::join!(
        dialer.connect_stream(a, Direction::Outbound),
        listener.connect_stream(b, Direction::Inbound),
    );
    assert_eq!(dialed.unwrap(), listener.id());
    assert_eq!(accepted.unwrap(), dialer.id());
}

/// Wait for the first event matching `want`.
pub async fn wait_for(
    events: &mut broadcast::Receiver<MeshEvent>,
    within: Duration,
    want: impl Fn(&MeshEvent) -> bool,
) -> MeshEvent {
    tokio::time::timeout(within, async {
        loop {
            match events.recv().await {
                Ok(event) if want(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll `check` until it holds.
pub async fn eventually(within: Duration, check: impl Fn() -> bool) {
    tokio::time::timeout(within, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}
