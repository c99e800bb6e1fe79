use super::{PendingTask, RequestState, RequestStore};
use async_trait::async_trait;
use crackhash_core::{
    Result,
    types::{RequestId, RequestStatus},
};
use parking_lot::RwLock;
use std::{collections::HashMap, time::SystemTime};

/// Process-local store. Every operation runs under a single lock, which makes
/// each merge atomic per id.
#[derive(Debug, Default)]
pub struct MemoryStore {
    requests: RwLock<HashMap<RequestId, RequestState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn set(&self, id: RequestId, state: RequestState) -> Result<()> {
        self.requests.write().insert(id, state);
        Ok(())
    }

    async fn get(&self, id: RequestId) -> Result<Option<RequestState>> {
        Ok(self.requests.read().get(&id).cloned())
    }

    async fn update(&self, id: RequestId, state: RequestState) -> Result<RequestState> {
        let mut requests = self.requests.write();
        let merged = match requests.get_mut(&id) {
            Some(stored) => {
                stored.merge(&state);
                stored.clone()
            }
            None => {
                let mut fresh = state;
                if fresh.status.is_terminal() {
                    fresh.pending = false;
                }
                requests.insert(id, fresh.clone());
                fresh
            }
        };
        Ok(merged)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self
            .requests
            .read()
            .values()
            .filter(|s| s.status == RequestStatus::InProgress)
            .count())
    }

    async fn mark_pending(&self, id: RequestId, pending: bool) -> Result<bool> {
        let mut requests = self.requests.write();
        match requests.get_mut(&id) {
            Some(state) if !pending || state.status == RequestStatus::InProgress => {
                state.pending = pending;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_pending(&self) -> Result<Vec<PendingTask>> {
        Ok(self
            .requests
            .read()
            .iter()
            .filter(|(_, s)| s.pending && s.status == RequestStatus::InProgress)
            .map(|(id, s)| PendingTask::from_state(*id, s))
            .collect())
    }

    async fn expire(&self, now: SystemTime) -> Result<u64> {
        let mut expired = 0;
        for state in self.requests.write().values_mut() {
            if state.is_overdue(now) {
                state.status = RequestStatus::Error;
                state.pending = false;
                expired += 1;
            }
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use std::sync::Arc;

    const HASH: &str = "0cc175b9c0f1b6a831c399e269772661";

    fn fresh(started_at: SystemTime) -> RequestState {
        RequestState::new(HASH, 4, started_at, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn set_then_get_preserves_every_field() {
        let store = MemoryStore::new();
        let id = RequestId::new();
        let state = fresh(SystemTime::now());
        store.set(id, state.clone()).await.unwrap();
        assert_eq!(store.get(id).await.unwrap(), Some(state));
        assert_eq!(store.get(RequestId::new()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn pending_requests_keep_hash_and_max_length() {
        let store = MemoryStore::new();
        let id = RequestId::new();
        store.set(id, fresh(SystemTime::now())).await.unwrap();
        assert!(store.mark_pending(id, true).await.unwrap());

        let pending = store.get_pending().await.unwrap();
        assert_eq!(
            pending,
            vec![PendingTask {
                id,
                hash: HASH.into(),
                max_length: 4,
                status: RequestStatus::InProgress,
            }]
        );

        store.mark_pending(id, false).await.unwrap();
        assert!(store.get_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn terminal_requests_cannot_become_pending() {
        let store = MemoryStore::new();
        let id = RequestId::new();
        let mut state = fresh(SystemTime::now());
        state.status = RequestStatus::Ready;
        store.set(id, state).await.unwrap();

        assert!(!store.mark_pending(id, true).await.unwrap());
        assert!(store.get_pending().await.unwrap().is_empty());
        assert!(!store.mark_pending(RequestId::new(), true).await.unwrap());
    }

    #[tokio::test]
    async fn expire_only_fails_overdue_in_progress_requests() {
        let store = MemoryStore::new();
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let (overdue, done, young) = (RequestId::new(), RequestId::new(), RequestId::new());

        let mut state = fresh(start);
        state.pending = true;
        store.set(overdue, state).await.unwrap();

        let mut state = fresh(start);
        state.status = RequestStatus::Ready;
        store.set(done, state).await.unwrap();

        store
            .set(young, fresh(start + Duration::from_secs(60)))
            .await
            .unwrap();

        let now = start + Duration::from_secs(30);
        assert_eq!(store.expire(now).await.unwrap(), 1);
        assert_eq!(store.expire(now).await.unwrap(), 0);

        let failed = store.get(overdue).await.unwrap().unwrap();
        assert_eq!(failed.status, RequestStatus::Error);
        assert!(!failed.pending);
        assert_eq!(
            store.get(done).await.unwrap().unwrap().status,
            RequestStatus::Ready
        );
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_updates_lose_no_words() {
        let store = Arc::new(MemoryStore::new());
        let id = RequestId::new();
        store.set(id, fresh(SystemTime::now())).await.unwrap();

        let writers: Vec<_> = (0..16)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let mut state = fresh(SystemTime::now());
                    state.found_words = vec![format!("w{i}")];
                    state.status = RequestStatus::Ready;
                    store.update(id, state).await.unwrap();
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let state = store.get(id).await.unwrap().unwrap();
        assert_eq!(state.found_words.len(), 16);
        assert_eq!(state.status, RequestStatus::Ready);
    }
}
