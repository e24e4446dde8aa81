//! Scope manager: local and remote registries of long-lived,
//! peer-addressable resources, keyed by id and an optional string key.
//! Insertion is id-first-then-key with rollback on keyed collision; removal
//! is id-then-key with a value-matching compare-and-remove on the keyed
//! path so a concurrent replace can't be raced.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::RwLock;

use crate::error::ProcessorError;
use crate::message::ScopeId;

/// Any resource a scope can own. Disposal is exactly Rust's own `Drop`: the
/// scope manager either drops the boxed value (the `dispose_*` policies say
/// yes) or `mem::forget`s it (the policies say the caller retains ownership
/// elsewhere) — there is no separate async dispose step to model.
pub type ScopeValue = Box<dyn Any + Send + Sync>;

/// A single scope record, local or remote.
pub struct ScopeRecord {
    pub id: ScopeId,
    pub key: Option<String>,
    value: AsyncMutex<Option<ScopeValue>>,
    pub dispose_value_on_drop: bool,
    pub dispose_value_on_error: bool,
    pub inform_peer_on_dispose: bool,
    is_error: AtomicBool,
    done: AtomicBool,
    last_exception: AsyncMutex<Option<String>>,
    /// Listeners for inbound `ScopeEvent` payloads addressed to this scope.
    /// One-to-many fan-out, mirroring how the stdio client lets several
    /// callers subscribe to the same notification stream.
    event_sinks: AsyncMutex<Vec<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl ScopeRecord {
    pub fn is_error(&self) -> bool {
        self.is_error.load(Ordering::SeqCst)
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub async fn mark_error(&self, message: impl Into<String>) {
        self.is_error.store(true, Ordering::SeqCst);
        *self.last_exception.lock().await = Some(message.into());
    }

    pub async fn last_exception(&self) -> Option<String> {
        self.last_exception.lock().await.clone()
    }

    /// Subscribes to `ScopeEvent` payloads addressed to this scope.
    pub async fn subscribe_events(&self) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.event_sinks.lock().await.push(tx);
        rx
    }

    /// Fans an inbound `ScopeEvent` out to every current subscriber, dropping
    /// senders whose receiver has gone away.
    pub async fn deliver_event(&self, bytes: Vec<u8>) {
        let mut sinks = self.event_sinks.lock().await;
        sinks.retain(|tx| tx.send(bytes.clone()).is_ok());
    }

    /// Runs `f` against the live value if present and of type `T`, without
    /// exposing the lock guard itself.
    pub async fn with_value<T, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R>
    where
        T: 'static,
    {
        let guard = self.value.lock().await;
        guard.as_ref()?.downcast_ref::<T>().map(f)
    }

    /// Terminal transition: idempotent, single-shot.
    async fn take_for_disposal(&self) -> Option<ScopeValue> {
        if self.done.swap(true, Ordering::SeqCst) {
            return None;
        }
        self.value.lock().await.take()
    }
}

/// Options governing how a scope behaves on insertion and disposal.
#[derive(Clone, Debug, Default)]
pub struct ScopeOptions {
    pub key: Option<String>,
    pub dispose_value_on_drop: bool,
    pub dispose_value_on_error: bool,
    pub inform_peer_on_dispose: bool,
    pub replace_existing: bool,
}

/// Outcome of disposing a scope: whether the manager wants the caller to
/// notify the peer (`ScopeDiscarded`), and the value the caller may still
/// want to dispose of explicitly (e.g. an async resource with real cleanup
/// work, as opposed to plain `Drop`).
pub struct ScopeDisposal {
    pub scope_id: ScopeId,
    pub inform_peer: bool,
    pub value: Option<ScopeValue>,
}

struct Table {
    by_id: HashMap<ScopeId, Arc<ScopeRecord>>,
    by_key: HashMap<String, ScopeId>,
}

impl Table {
    fn new() -> Self {
        Self {
            by_id: HashMap::new(),
            by_key: HashMap::new(),
        }
    }

    fn remove_by_id(&mut self, id: ScopeId) -> Option<Arc<ScopeRecord>> {
        let record = self.by_id.remove(&id)?;
        if let Some(key) = &record.key {
            if self.by_key.get(key) == Some(&id) {
                self.by_key.remove(key);
            }
        }
        Some(record)
    }

    fn get(&self, id: ScopeId) -> Option<Arc<ScopeRecord>> {
        self.by_id.get(&id).cloned()
    }

    fn get_by_key(&self, key: &str) -> Option<Arc<ScopeRecord>> {
        self.by_key.get(key).and_then(|id| self.by_id.get(id)).cloned()
    }
}

/// Owns the local and remote scope registries for one processor.
pub struct ScopeManager {
    next_id: AtomicU64,
    local: RwLock<Table>,
    remote: RwLock<Table>,
}

impl Default for ScopeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeManager {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            local: RwLock::new(Table::new()),
            remote: RwLock::new(Table::new()),
        }
    }

    /// Creates a new locally-owned scope and registers it. `id` is minted
    /// here; the caller never picks one.
    pub async fn create_local(
        &self,
        value: ScopeValue,
        options: ScopeOptions,
    ) -> Result<Arc<ScopeRecord>, ProcessorError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.insert(&self.local, id, value, options).await
    }

    /// Registers a scope the peer owns, referenced locally by `id` (minted
    /// by the peer, not by us).
    pub async fn insert_remote(
        &self,
        id: ScopeId,
        value: ScopeValue,
        options: ScopeOptions,
    ) -> Result<Arc<ScopeRecord>, ProcessorError> {
        self.insert(&self.remote, id, value, options).await
    }

    async fn insert(
        &self,
        table: &RwLock<Table>,
        id: ScopeId,
        value: ScopeValue,
        options: ScopeOptions,
    ) -> Result<Arc<ScopeRecord>, ProcessorError> {
        let record = Arc::new(ScopeRecord {
            id,
            key: options.key.clone(),
            value: AsyncMutex::new(Some(value)),
            dispose_value_on_drop: options.dispose_value_on_drop,
            dispose_value_on_error: options.dispose_value_on_error,
            inform_peer_on_dispose: options.inform_peer_on_dispose,
            is_error: AtomicBool::new(false),
            done: AtomicBool::new(false),
            last_exception: AsyncMutex::new(None),
            event_sinks: AsyncMutex::new(Vec::new()),
        });

        let mut guard = table.write().await;
        if guard.by_id.contains_key(&id) {
            return Err(ProcessorError::DuplicateId(id));
        }
        if let Some(key) = &options.key {
            if let Some(&existing_id) = guard.by_key.get(key) {
                if !options.replace_existing {
                    return Err(ProcessorError::Protocol(format!(
                        "scope key `{key}` already in use"
                    )));
                }
                if let Some(existing) = guard.by_id.remove(&existing_id) {
                    tokio::spawn(async move {
                        let _ = existing.take_for_disposal().await;
                    });
                }
            }
            guard.by_key.insert(key.clone(), id);
        }
        guard.by_id.insert(id, record.clone());
        Ok(record)
    }

    pub async fn get_local(&self, id: ScopeId) -> Option<Arc<ScopeRecord>> {
        self.local.read().await.get(id)
    }

    pub async fn get_remote(&self, id: ScopeId) -> Option<Arc<ScopeRecord>> {
        self.remote.read().await.get(id)
    }

    pub async fn get_local_by_key(&self, key: &str) -> Option<Arc<ScopeRecord>> {
        self.local.read().await.get_by_key(key)
    }

    pub async fn get_remote_by_key(&self, key: &str) -> Option<Arc<ScopeRecord>> {
        self.remote.read().await.get_by_key(key)
    }

    pub async fn dispose_local(&self, id: ScopeId) -> Option<ScopeDisposal> {
        self.dispose(&self.local, id).await
    }

    pub async fn dispose_remote(&self, id: ScopeId) -> Option<ScopeDisposal> {
        self.dispose(&self.remote, id).await
    }

    /// Disposes a scope known only by key. Uses a value-matching
    /// compare-and-remove (look up the id behind the key, then remove only
    /// if that id's current record is still the one we looked up) so a
    /// concurrent `replace_existing` insert can't be raced into disposing
    /// the replacement instead of the original.
    pub async fn dispose_local_by_key(&self, key: &str) -> Option<ScopeDisposal> {
        self.dispose_by_key(&self.local, key).await
    }

    pub async fn dispose_remote_by_key(&self, key: &str) -> Option<ScopeDisposal> {
        self.dispose_by_key(&self.remote, key).await
    }

    async fn dispose_by_key(&self, table: &RwLock<Table>, key: &str) -> Option<ScopeDisposal> {
        let record = {
            let mut guard = table.write().await;
            let expected = guard.get_by_key(key)?;
            let current_by_id = guard.by_id.get(&expected.id).cloned()?;
            if !Arc::ptr_eq(&current_by_id, &expected) {
                // Raced with a replace between the lookup and the write lock.
                return None;
            }
            guard.remove_by_id(expected.id)
        }?;
        Some(self.finish_disposal(record).await)
    }

    async fn dispose(&self, table: &RwLock<Table>, id: ScopeId) -> Option<ScopeDisposal> {
        let record = {
            let mut guard = table.write().await;
            guard.remove_by_id(id)?
        };
        Some(self.finish_disposal(record).await)
    }

    async fn finish_disposal(&self, record: Arc<ScopeRecord>) -> ScopeDisposal {
        let id = record.id;
        let inform_peer = record.inform_peer_on_dispose;
        let value = if record.dispose_value_on_drop {
            record.take_for_disposal().await
        } else {
            if let Some(v) = record.take_for_disposal().await {
                std::mem::forget(v);
            }
            None
        };
        ScopeDisposal {
            scope_id: id,
            inform_peer,
            value,
        }
    }

    /// Routes an inbound `ScopeEvent`: the peer always addresses a scope we
    /// own, so this only ever looks at the local registry.
    pub async fn deliver_event(&self, id: ScopeId, bytes: Vec<u8>) {
        if let Some(record) = self.get_local(id).await {
            record.deliver_event(bytes).await;
        }
    }

    /// Removes every scope from both registries (session teardown). Returns
    /// the ids that were disposed so the caller can best-effort notify.
    pub async fn dispose_all(&self) -> Vec<ScopeId> {
        let mut disposed = Vec::new();
        for table in [&self.local, &self.remote] {
            let records: Vec<_> = {
                let mut guard = table.write().await;
                let all: Vec<_> = guard.by_id.drain().map(|(_, v)| v).collect();
                guard.by_key.clear();
                all
            };
            for record in records {
                disposed.push(record.id);
                if record.dispose_value_on_drop {
                    let _ = record.take_for_disposal().await;
                } else if let Some(v) = record.take_for_disposal().await {
                    std::mem::forget(v);
                }
            }
        }
        disposed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keyed_replace_swaps_atomically_and_disposes_old() {
        let mgr = ScopeManager::new();
        let first = mgr
            .create_local(
                Box::new(1u32),
                ScopeOptions {
                    key: Some("k".into()),
                    replace_existing: true,
                    dispose_value_on_drop: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let second = mgr
            .create_local(
                Box::new(2u32),
                ScopeOptions {
                    key: Some("k".into()),
                    replace_existing: true,
                    dispose_value_on_drop: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let looked_up = mgr.get_local_by_key("k").await.unwrap();
        assert_eq!(looked_up.id, second.id);
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn keyed_collision_without_replace_fails_and_keeps_original() {
        let mgr = ScopeManager::new();
        let first = mgr
            .create_local(
                Box::new(1u32),
                ScopeOptions {
                    key: Some("k".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = mgr
            .create_local(
                Box::new(2u32),
                ScopeOptions {
                    key: Some("k".into()),
                    replace_existing: false,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessorError::Protocol(_)));

        let looked_up = mgr.get_local_by_key("k").await.unwrap();
        assert_eq!(looked_up.id, first.id);
    }

    #[tokio::test]
    async fn remove_by_key_is_a_compare_and_remove() {
        let mgr = ScopeManager::new();
        let record = mgr
            .create_local(
                Box::new(1u32),
                ScopeOptions {
                    key: Some("k".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let disposal = mgr.dispose_local(record.id).await.unwrap();
        assert_eq!(disposal.scope_id, record.id);
        assert!(mgr.get_local(record.id).await.is_none());
        assert!(mgr.get_local_by_key("k").await.is_none());
    }

    #[tokio::test]
    async fn scope_event_fans_out_to_every_subscriber() {
        let mgr = ScopeManager::new();
        let record = mgr
            .create_local(Box::new(0u32), ScopeOptions::default())
            .await
            .unwrap();

        let mut a = record.subscribe_events().await;
        let mut b = record.subscribe_events().await;
        mgr.deliver_event(record.id, vec![1, 2, 3]).await;

        assert_eq!(a.recv().await, Some(vec![1, 2, 3]));
        assert_eq!(b.recv().await, Some(vec![1, 2, 3]));
    }
}
