//! Request lifecycle storage.
//!
//! [`RequestStore`] is the single source of truth for every accepted
//! request. It is shared by the HTTP handlers, the ingestion loop, the retry
//! loop and the expiry sweeper, so every mutating operation is a per-id
//! atomic merge rather than a read-modify-write from the caller's side:
//!
//! - `status` only moves forward ([`RequestStatus::advance`]), so a timeout
//!   racing a successful response can never resurrect `InProgress`.
//! - `found_words` only grows, with set semantics.
//! - `pending` is changed through [`RequestStore::mark_pending`] alone, and
//!   is forced to `false` whenever the request is terminal.
//!
//! Two realizations: [`memory::MemoryStore`] for single-instance deployments
//! and [`mongo::MongoStore`] for replicated ones.

pub mod memory;
pub mod mongo;

use async_trait::async_trait;
use core::time::Duration;
use crackhash_core::{
    Result,
    types::{RequestId, RequestStatus},
};
use std::time::SystemTime;

/// Mutable lifecycle state of one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestState {
    pub status: RequestStatus,
    pub found_words: Vec<String>,
    pub started_at: SystemTime,
    pub timeout: Duration,
    /// `started_at + timeout`; the sweeper fails the request past this point.
    pub deadline: SystemTime,
    /// The request's tasks are not (all) with the broker yet.
    pub pending: bool,
    pub hash: String,
    pub max_length: u32,
}

impl RequestState {
    pub fn new(hash: impl Into<String>, max_length: u32, started_at: SystemTime, timeout: Duration) -> Self {
        Self {
            status: RequestStatus::InProgress,
            found_words: Vec::new(),
            started_at,
            timeout,
            deadline: started_at + timeout,
            pending: false,
            hash: hash.into(),
            max_length,
        }
    }

    pub fn elapsed(&self, now: SystemTime) -> Duration {
        now.duration_since(self.started_at).unwrap_or_default()
    }

    pub fn is_overdue(&self, now: SystemTime) -> bool {
        self.status == RequestStatus::InProgress && self.deadline <= now
    }

    /// Appends `words` that are not already present.
    pub fn add_words<'a>(&mut self, words: impl IntoIterator<Item = &'a String>) {
        for word in words {
            if !self.found_words.contains(word) {
                self.found_words.push(word.clone());
            }
        }
    }

    /// Folds the mutable fields of `incoming` into `self`.
    ///
    /// Immutable fields (`hash`, `max_length`, timing) and `pending` keep
    /// their stored values.
    pub fn merge(&mut self, incoming: &Self) {
        self.status = self.status.advance(incoming.status);
        self.add_words(&incoming.found_words);
        if self.status.is_terminal() {
            self.pending = false;
        }
    }
}

/// A request whose tasks still have to be handed to the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingTask {
    pub id: RequestId,
    pub hash: String,
    pub max_length: u32,
    pub status: RequestStatus,
}

impl PendingTask {
    pub fn from_state(id: RequestId, state: &RequestState) -> Self {
        Self {
            id,
            hash: state.hash.clone(),
            max_length: state.max_length,
            status: state.status,
        }
    }
}

#[async_trait]
pub trait RequestStore: Send + Sync + 'static {
    /// Inserts or fully replaces the state of `id`.
    async fn set(&self, id: RequestId, state: RequestState) -> Result<()>;

    async fn get(&self, id: RequestId) -> Result<Option<RequestState>>;

    /// Upserts `state`, merging into an existing entry per
    /// [`RequestState::merge`]. Returns the state after the merge.
    async fn update(&self, id: RequestId, state: RequestState) -> Result<RequestState>;

    /// Number of requests still in progress. Used for admission control.
    async fn count(&self) -> Result<usize>;

    /// Sets the pending flag. Raising it only succeeds while the request is
    /// in progress; returns whether a request was changed.
    async fn mark_pending(&self, id: RequestId, pending: bool) -> Result<bool>;

    /// Every in-progress request with the pending flag raised.
    async fn get_pending(&self) -> Result<Vec<PendingTask>>;

    /// Fails every in-progress request whose deadline is at or before
    /// `now`, clearing its pending flag. Returns how many were failed.
    async fn expire(&self, now: SystemTime) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> RequestState {
        RequestState::new(
            "0cc175b9c0f1b6a831c399e269772661",
            3,
            SystemTime::UNIX_EPOCH,
            Duration::from_secs(10),
        )
    }

    #[test]
    fn deadline_is_start_plus_timeout() {
        let state = state();
        assert_eq!(state.deadline, SystemTime::UNIX_EPOCH + Duration::from_secs(10));
        assert!(!state.is_overdue(SystemTime::UNIX_EPOCH + Duration::from_secs(9)));
        assert!(state.is_overdue(SystemTime::UNIX_EPOCH + Duration::from_secs(10)));
    }

    #[test]
    fn merge_never_moves_status_backwards() {
        let mut stored = state();
        stored.status = RequestStatus::Error;

        let mut incoming = state();
        incoming.status = RequestStatus::Ready;
        incoming.found_words = vec!["a".into()];

        stored.merge(&incoming);
        assert_eq!(stored.status, RequestStatus::Error);
        assert_eq!(stored.found_words, vec!["a".to_owned()]);
    }

    #[test]
    fn merge_unions_words_and_clears_pending_on_completion() {
        let mut stored = state();
        stored.pending = true;
        stored.found_words = vec!["a".into()];

        let mut incoming = state();
        incoming.status = RequestStatus::Ready;
        incoming.found_words = vec!["a".into(), "b".into()];
        incoming.hash = String::new();

        stored.merge(&incoming);
        assert_eq!(stored.status, RequestStatus::Ready);
        assert_eq!(stored.found_words, vec!["a".to_owned(), "b".to_owned()]);
        assert!(!stored.pending);
        assert_eq!(stored.hash, "0cc175b9c0f1b6a831c399e269772661");
    }
}
