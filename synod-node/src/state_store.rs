//! Persistent node state using fjall.
//!
//! Three keyspaces: `acceptor` (slot -> `SlotState`), `log` (slot -> committed
//! value) and `meta` (round counter, node identity). Slot keys are big-endian
//! so iteration order is slot order. Every write is synced before it returns,
//! on the blocking pool so the runtime threads keep serving other units.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use error_stack::{Report, ResultExt};
use fjall::{Database, Keyspace, KeyspaceCreateOptions, PersistMode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use synod_core::{NodeId, Slot, SlotContext, StoreError};
use synod_paxos::core::SlotState;
use synod_paxos::{PersistedState, StateStore};

const NEXT_ROUND_KEY: &[u8] = b"next_round";
const NODE_ID_KEY: &[u8] = b"node_id";

struct FjallState {
    db: Database,
    acceptor: Keyspace,
    log: Keyspace,
    meta: Keyspace,
}

impl FjallState {
    fn open_sync(path: &Path) -> Result<Self, fjall::Error> {
        let db = Database::builder(path).open()?;

        let acceptor = db.keyspace("acceptor", KeyspaceCreateOptions::default)?;
        let log = db.keyspace("log", KeyspaceCreateOptions::default)?;
        let meta = db.keyspace("meta", KeyspaceCreateOptions::default)?;

        Ok(Self {
            db,
            acceptor,
            log,
            meta,
        })
    }

    fn parse_slot(key: &[u8]) -> Result<Slot, Report<StoreError>> {
        let bytes: [u8; 8] = key
            .try_into()
            .map_err(|_| Report::new(StoreError).attach(format!("bad slot key of {} bytes", key.len())))?;
        Ok(Slot::from_be_bytes(bytes))
    }

    fn load_sync<V: DeserializeOwned>(&self) -> Result<PersistedState<V>, Report<StoreError>> {
        let mut slots = BTreeMap::new();
        for guard in self.acceptor.iter() {
            let (key, value) = guard.into_inner().change_context(StoreError)?;
            let slot = Self::parse_slot(&key)?;
            let state: SlotState<V> = postcard::from_bytes(&value)
                .change_context(StoreError)
                .attach(SlotContext::new(slot))
                .attach("corrupt acceptor record")?;
            slots.insert(slot, state);
        }

        let mut log = BTreeMap::new();
        for guard in self.log.iter() {
            let (key, value) = guard.into_inner().change_context(StoreError)?;
            let slot = Self::parse_slot(&key)?;
            let value: V = postcard::from_bytes(&value)
                .change_context(StoreError)
                .attach(SlotContext::new(slot))
                .attach("corrupt log entry")?;
            log.insert(slot, value);
        }

        let next_round = self
            .read_meta::<8>(NEXT_ROUND_KEY)?
            .map_or(0, u64::from_be_bytes);
        let node_id = self
            .read_meta::<4>(NODE_ID_KEY)?
            .map(|bytes| NodeId(u32::from_be_bytes(bytes)));

        Ok(PersistedState {
            node_id,
            slots,
            log,
            next_round,
        })
    }

    fn read_meta<const N: usize>(&self, key: &[u8]) -> Result<Option<[u8; N]>, Report<StoreError>> {
        let Some(bytes) = self.meta.get(key).change_context(StoreError)? else {
            return Ok(None);
        };
        let bytes: [u8; N] = bytes.as_ref().try_into().map_err(|_| {
            Report::new(StoreError).attach(format!(
                "corrupt meta record {:?}",
                String::from_utf8_lossy(key)
            ))
        })?;
        Ok(Some(bytes))
    }

    fn persist(&self) -> Result<(), Report<StoreError>> {
        self.db.persist(PersistMode::SyncAll).change_context(StoreError)
    }

    fn save_slot_sync(&self, slot: Slot, bytes: &[u8]) -> Result<(), Report<StoreError>> {
        self.acceptor
            .insert(slot.to_be_bytes(), bytes)
            .change_context(StoreError)
            .attach(SlotContext::new(slot))?;
        self.persist()
    }

    fn save_commit_sync(&self, slot: Slot, bytes: &[u8]) -> Result<(), Report<StoreError>> {
        let key = slot.to_be_bytes();
        // Committed slots are immutable.
        if self.log.get(key).change_context(StoreError)?.is_some() {
            return Ok(());
        }
        self.log
            .insert(key, bytes)
            .change_context(StoreError)
            .attach(SlotContext::new(slot))?;
        self.persist()
    }

    fn save_round_sync(&self, next_round: u64) -> Result<(), Report<StoreError>> {
        let current = self
            .read_meta::<8>(NEXT_ROUND_KEY)?
            .map_or(0, u64::from_be_bytes);
        if next_round <= current {
            return Ok(());
        }
        self.meta
            .insert(NEXT_ROUND_KEY, next_round.to_be_bytes())
            .change_context(StoreError)?;
        self.persist()
    }

    fn flush_sync(&self, node_id: NodeId) -> Result<(), Report<StoreError>> {
        self.meta
            .insert(NODE_ID_KEY, node_id.0.to_be_bytes())
            .change_context(StoreError)?;
        self.persist()
    }
}

/// Cloneable handle to a fjall-backed [`StateStore`].
#[derive(Clone)]
pub struct FjallStore {
    inner: Arc<FjallState>,
}

impl FjallStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Report<StoreError>> {
        let path = path.as_ref().to_owned();
        let state = tokio::task::spawn_blocking({
            let path = path.clone();
            move || FjallState::open_sync(&path)
        })
        .await
        .change_context(StoreError)?
        .change_context(StoreError)
        .attach(format!("opening {}", path.display()))?;
        Ok(Self {
            inner: Arc::new(state),
        })
    }

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Report<StoreError>> {
        postcard::to_allocvec(value).change_context(StoreError)
    }

    /// Run `op` against the database on the blocking pool.
    async fn blocking<R, F>(&self, op: F) -> Result<R, Report<StoreError>>
    where
        R: Send + 'static,
        F: FnOnce(&FjallState) -> Result<R, Report<StoreError>> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .change_context(StoreError)?
    }
}

impl<V> StateStore<V> for FjallStore
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn load(&self) -> Result<PersistedState<V>, Report<StoreError>> {
        self.blocking(|state| state.load_sync()).await
    }

    async fn save_slot(&self, slot: Slot, state: &SlotState<V>) -> Result<(), Report<StoreError>> {
        let bytes = Self::encode(state).attach(SlotContext::new(slot))?;
        self.blocking(move |state| state.save_slot_sync(slot, &bytes))
            .await
    }

    async fn save_commit(&self, slot: Slot, value: &V) -> Result<(), Report<StoreError>> {
        let bytes = Self::encode(value).attach(SlotContext::new(slot))?;
        self.blocking(move |state| state.save_commit_sync(slot, &bytes))
            .await
    }

    async fn save_round(&self, next_round: u64) -> Result<(), Report<StoreError>> {
        self.blocking(move |state| state.save_round_sync(next_round))
            .await
    }

    async fn flush(&self, node_id: NodeId) -> Result<(), Report<StoreError>> {
        self.blocking(move |state| state.flush_sync(node_id)).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use synod_core::{Accepted, ProposalNumber};

    use super::*;

    type Calendar = BTreeSet<String>;

    fn calendar(items: &[&str]) -> Calendar {
        items.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn fresh_store_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FjallStore::open(dir.path()).await.unwrap();

        let state: PersistedState<Calendar> = store.load().await.unwrap();
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let slot_state = SlotState {
            max_prepare: Some(ProposalNumber(7)),
            accepted: Some(Accepted {
                number: ProposalNumber(4),
                value: calendar(&["standup"]),
            }),
        };

        {
            let store = FjallStore::open(dir.path()).await.unwrap();
            store.save_slot(Slot(2), &slot_state).await.unwrap();
            store.save_commit(Slot(0), &calendar(&["standup"])).await.unwrap();
            store
                .save_commit(Slot(1), &calendar(&["standup", "retro"]))
                .await
                .unwrap();
            StateStore::<Calendar>::save_round(&store, 5).await.unwrap();
            StateStore::<Calendar>::flush(&store, NodeId(3)).await.unwrap();
        }

        let store = FjallStore::open(dir.path()).await.unwrap();
        let state: PersistedState<Calendar> = store.load().await.unwrap();
        assert_eq!(state.node_id, Some(NodeId(3)));
        assert_eq!(state.next_round, 5);
        assert_eq!(state.slots.get(&Slot(2)), Some(&slot_state));
        assert_eq!(
            state.log.keys().copied().collect::<Vec<_>>(),
            vec![Slot(0), Slot(1)]
        );
        assert_eq!(state.log[&Slot(1)], calendar(&["standup", "retro"]));
    }

    #[tokio::test]
    async fn commits_are_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = FjallStore::open(dir.path()).await.unwrap();

        store.save_commit(Slot(0), &calendar(&["a"])).await.unwrap();
        store.save_commit(Slot(0), &calendar(&["b"])).await.unwrap();

        let state: PersistedState<Calendar> = store.load().await.unwrap();
        assert_eq!(state.log[&Slot(0)], calendar(&["a"]));
    }

    #[tokio::test]
    async fn round_counter_only_moves_forward() {
        let dir = tempfile::tempdir().unwrap();
        let store = FjallStore::open(dir.path()).await.unwrap();

        StateStore::<Calendar>::save_round(&store, 9).await.unwrap();
        StateStore::<Calendar>::save_round(&store, 4).await.unwrap();

        let state: PersistedState<Calendar> = store.load().await.unwrap();
        assert_eq!(state.next_round, 9);
    }

    #[tokio::test]
    async fn writes_leave_the_runtime_free() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let dir = tempfile::tempdir().unwrap();
        let store = FjallStore::open(dir.path()).await.unwrap();

        // Single-threaded runtime: the spinner only runs while the writer
        // is parked on the blocking pool.
        let spins = Arc::new(AtomicUsize::new(0));
        let spinner = tokio::spawn({
            let spins = spins.clone();
            async move {
                loop {
                    spins.fetch_add(1, Ordering::Relaxed);
                    tokio::task::yield_now().await;
                }
            }
        });

        for round in 1..=10 {
            StateStore::<Calendar>::save_round(&store, round).await.unwrap();
        }
        spinner.abort();

        assert!(spins.load(Ordering::Relaxed) > 0);
        let state: PersistedState<Calendar> = store.load().await.unwrap();
        assert_eq!(state.next_round, 10);
    }

    #[tokio::test]
    async fn corrupt_record_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FjallStore::open(dir.path()).await.unwrap();
        store
            .inner
            .log
            .insert(Slot(0).to_be_bytes(), [0xff, 0xff, 0xff])
            .unwrap();

        let result: Result<PersistedState<Calendar>, _> = store.load().await;
        assert!(result.is_err());
    }
}
