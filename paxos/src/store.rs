//! Durable node state.
//!
//! Everything an acceptor promised or accepted, every committed slot and the
//! proposer's round counter must survive a restart. Each write completes
//! before the reply that depends on it is sent.

use std::collections::BTreeMap;
use std::future::{Future, ready};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use error_stack::Report;
use synod_core::{NodeId, Slot, StoreError};

use crate::core::SlotState;

/// Everything loaded at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistedState<V> {
    /// Identity recorded by the last flush, if any.
    pub node_id: Option<NodeId>,
    pub slots: BTreeMap<Slot, SlotState<V>>,
    pub log: BTreeMap<Slot, V>,
    pub next_round: u64,
}

impl<V> Default for PersistedState<V> {
    fn default() -> Self {
        Self {
            node_id: None,
            slots: BTreeMap::new(),
            log: BTreeMap::new(),
            next_round: 0,
        }
    }
}

impl<V> PersistedState<V> {
    /// Nothing was ever written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.node_id.is_none()
            && self.slots.is_empty()
            && self.log.is_empty()
            && self.next_round == 0
    }
}

/// Storage for acceptor slots, the committed log and the proposer round.
pub trait StateStore<V>: Clone + Send + Sync + 'static
where
    V: Send + Sync + 'static,
{
    fn load(&self) -> impl Future<Output = Result<PersistedState<V>, Report<StoreError>>> + Send;

    fn save_slot(
        &self,
        slot: Slot,
        state: &SlotState<V>,
    ) -> impl Future<Output = Result<(), Report<StoreError>>> + Send;

    fn save_commit(
        &self,
        slot: Slot,
        value: &V,
    ) -> impl Future<Output = Result<(), Report<StoreError>>> + Send;

    fn save_round(
        &self,
        next_round: u64,
    ) -> impl Future<Output = Result<(), Report<StoreError>>> + Send;

    /// Record the node identity and make every write durable.
    fn flush(&self, node_id: NodeId)
    -> impl Future<Output = Result<(), Report<StoreError>>> + Send;
}

/// In-memory store.
///
/// Clones share the same state, so a node rebuilt from a clone after a
/// simulated crash sees everything the previous incarnation wrote.
#[derive(Debug)]
pub struct MemoryStore<V> {
    state: Arc<Mutex<PersistedState<V>>>,
    failing: Arc<AtomicBool>,
}

impl<V> Clone for MemoryStore<V> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            failing: Arc::clone(&self.failing),
        }
    }
}

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(PersistedState::default())),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl<V: Clone> MemoryStore<V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Copy of everything written so far.
    pub fn snapshot(&self) -> Result<PersistedState<V>, Report<StoreError>> {
        Ok(self.lock()?.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, PersistedState<V>>, Report<StoreError>> {
        self.state
            .lock()
            .map_err(|_| Report::new(StoreError).attach("memory store lock poisoned"))
    }

    fn write(
        &self,
        f: impl FnOnce(&mut PersistedState<V>),
    ) -> Result<(), Report<StoreError>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Report::new(StoreError).attach("writes disabled"));
        }
        f(&mut *self.lock()?);
        Ok(())
    }
}

impl<V> StateStore<V> for MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn load(&self) -> impl Future<Output = Result<PersistedState<V>, Report<StoreError>>> + Send {
        ready(self.snapshot())
    }

    fn save_slot(
        &self,
        slot: Slot,
        state: &SlotState<V>,
    ) -> impl Future<Output = Result<(), Report<StoreError>>> + Send {
        ready(self.write(|s| {
            s.slots.insert(slot, state.clone());
        }))
    }

    fn save_commit(
        &self,
        slot: Slot,
        value: &V,
    ) -> impl Future<Output = Result<(), Report<StoreError>>> + Send {
        ready(self.write(|s| {
            s.log.entry(slot).or_insert_with(|| value.clone());
        }))
    }

    fn save_round(
        &self,
        next_round: u64,
    ) -> impl Future<Output = Result<(), Report<StoreError>>> + Send {
        ready(self.write(|s| s.next_round = s.next_round.max(next_round)))
    }

    fn flush(
        &self,
        node_id: NodeId,
    ) -> impl Future<Output = Result<(), Report<StoreError>>> + Send {
        ready(self.write(|s| s.node_id = Some(node_id)))
    }
}

#[cfg(test)]
mod tests {
    use synod_core::{Accepted, ProposalNumber};

    use super::*;

    #[tokio::test]
    async fn clones_share_state() {
        let store = MemoryStore::<String>::new();
        let restarted = store.clone();
        store
            .save_slot(
                Slot(1),
                &SlotState {
                    max_prepare: Some(ProposalNumber(4)),
                    accepted: Some(Accepted {
                        number: ProposalNumber(4),
                        value: "v".into(),
                    }),
                },
            )
            .await
            .unwrap();
        store.save_commit(Slot(0), &"a".into()).await.unwrap();
        store.save_round(3).await.unwrap();
        store.flush(NodeId(2)).await.unwrap();

        let loaded = restarted.load().await.unwrap();
        assert_eq!(loaded.node_id, Some(NodeId(2)));
        assert_eq!(loaded.next_round, 3);
        assert_eq!(loaded.log.get(&Slot(0)).map(String::as_str), Some("a"));
        assert_eq!(loaded.slots[&Slot(1)].max_prepare, Some(ProposalNumber(4)));
        assert!(!loaded.is_empty());
    }

    #[tokio::test]
    async fn round_counter_never_goes_back() {
        let store = MemoryStore::<u8>::new();
        store.save_round(9).await.unwrap();
        store.save_round(4).await.unwrap();
        assert_eq!(store.load().await.unwrap().next_round, 9);
    }

    #[tokio::test]
    async fn failing_store_rejects_writes() {
        let store = MemoryStore::<u8>::new();
        store.set_failing(true);
        assert!(store.save_round(1).await.is_err());
        assert!(store.load().await.unwrap().is_empty());
    }
}
