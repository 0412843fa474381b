/// Candidate tables and admission slots.
///
/// A table maps a remote identity to one in-flight exchange. Each record
/// sits behind its own async lock and owns a reaper task that removes it
/// when the admission timeout fires. Removing a record any other way
/// aborts its reaper.
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;

use quorum_transport::PeerHash;

pub(crate) struct Candidate<R> {
    id: u64,
    pub(crate) record: tokio::sync::Mutex<R>,
    reaper: Mutex<Option<AbortHandle>>,
}

impl<R> Candidate<R> {
    fn abort_reaper(&self) {
        if let Some(reaper) = self.reaper.lock().take() {
            reaper.abort();
        }
    }
}

pub(crate) struct CandidateTable<R> {
    records: Arc<Mutex<HashMap<PeerHash, Arc<Candidate<R>>>>>,
    next_id: AtomicU64,
}

impl<R: Send + 'static> CandidateTable<R> {
    pub(crate) fn new() -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    pub(crate) fn get(&self, peer: &PeerHash) -> Option<Arc<Candidate<R>>> {
        self.records.lock().get(peer).cloned()
    }

    pub(crate) fn contains(&self, peer: &PeerHash) -> bool {
        self.records.lock().contains_key(peer)
    }

    pub(crate) fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub(crate) fn peers(&self) -> Vec<PeerHash> {
        self.records.lock().keys().copied().collect()
    }

    /// Insert `record` unless `peer` already has one.
    ///
    /// After `timeout` the record is removed and handed to `on_expire`,
    /// unless it was removed first.
    pub(crate) fn insert<F, Fut>(
        &self,
        peer: PeerHash,
        record: R,
        timeout: Duration,
        on_expire: F,
    ) -> Option<Arc<Candidate<R>>>
    where
        F: FnOnce(Arc<Candidate<R>>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let candidate = {
            let mut records = self.records.lock();
            if records.contains_key(&peer) {
                return None;
            }
            let candidate = Arc::new(Candidate {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                record: tokio::sync::Mutex::new(record),
                reaper: Mutex::new(None),
            });
            records.insert(peer, candidate.clone());
            candidate
        };

        let records = self.records.clone();
        let id = candidate.id;
        let reaper = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = {
                let mut records = records.lock();
                match records.get(&peer) {
                    Some(current) if current.id == id => records.remove(&peer),
                    _ => None,
                }
            };
            if let Some(expired) = expired {
                on_expire(expired).await;
            }
        });
        *candidate.reaper.lock() = Some(reaper.abort_handle());
        Some(candidate)
    }

    /// Remove `peer`'s record only if it is still `candidate`.
    pub(crate) fn remove_if(&self, peer: &PeerHash, candidate: &Arc<Candidate<R>>) -> bool {
        let removed = {
            let mut records = self.records.lock();
            match records.get(peer) {
                Some(current) if Arc::ptr_eq(current, candidate) => records.remove(peer),
                _ => None,
            }
        };
        match removed {
            Some(candidate) => {
                candidate.abort_reaper();
                true
            }
            None => false,
        }
    }

    /// Drop every record and abort every reaper.
    pub(crate) fn clear(&self) -> Vec<Arc<Candidate<R>>> {
        let drained: Vec<_> = self.records.lock().drain().map(|(_, c)| c).collect();
        for candidate in &drained {
            candidate.abort_reaper();
        }
        drained
    }
}

/// Bounded count of exchanges this node will take part in at once.
pub(crate) struct AdmissionSlots {
    free: AtomicUsize,
    capacity: usize,
}

impl AdmissionSlots {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            free: AtomicUsize::new(capacity),
            capacity,
        }
    }

    pub(crate) fn try_reserve(&self) -> bool {
        self.free
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |free| free.checked_sub(1))
            .is_ok()
    }

    pub(crate) fn release(&self) {
        let capacity = self.capacity;
        let _ = self
            .free
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |free| {
                (free < capacity).then_some(free + 1)
            });
    }

    pub(crate) fn available(&self) -> usize {
        self.free.load(Ordering::Acquire)
    }
}
