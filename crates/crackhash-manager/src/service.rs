//! Request orchestration.
//!
//! [`ManagerService`] owns the request lifecycle:
//!
//! - **Creation**: validate, admission-check against the store, persist the
//!   request, then dispatch its tasks in the background. The caller gets the
//!   id back without waiting for the broker.
//! - **Retry**: requests whose dispatch failed are flagged pending and
//!   republished on a fixed interval while the broker is connected.
//! - **Ingestion**: worker responses are merged into the store; the broker
//!   message is acknowledged only once the merge is persisted.
//! - **Expiry**: one sweeper fails every in-progress request past its
//!   deadline.
//!
//! All three background loops share the store, which makes each per-id
//! mutation atomic, so they never coordinate with each other directly.

use crate::{
    config::ServiceConfig,
    queue::TaskQueue,
    store::{RequestState, RequestStore},
};
use core::time::Duration;
use crackhash_core::{
    Error, Result,
    keyspace::Keyspace,
    telemetry::{
        increment_publish_failures, increment_requests_created, increment_requests_expired,
        increment_requests_rejected, increment_responses_ingested, increment_tasks_published,
    },
    types::{
        Alphabet, RequestId, RequestStatus, StatusResponse, Task, WorkerResponse,
        normalize_digest,
    },
};
use parking_lot::Mutex;
use std::{sync::Arc, time::SystemTime};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Pause before requeueing a response whose merge could not be persisted.
const INGEST_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ManagerService {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServiceConfig,
    store: Arc<dyn RequestStore>,
    queue: Arc<dyn TaskQueue>,
    /// Serializes the count-then-insert of admission control.
    admission: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl ManagerService {
    pub fn new(
        config: ServiceConfig,
        store: Arc<dyn RequestStore>,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                queue,
                admission: tokio::sync::Mutex::new(()),
                shutdown: CancellationToken::new(),
                loops: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn RequestStore> {
        &self.inner.store
    }

    /// Spawns the retry, expiry and ingestion loops.
    pub fn start(&self) {
        let mut loops = self.inner.loops.lock();
        loops.push(tokio::spawn(self.clone().retry_loop()));
        loops.push(tokio::spawn(self.clone().sweep_loop()));
        loops.push(tokio::spawn(self.clone().ingest_loop()));
    }

    /// Accepts a request and starts dispatching it.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] for a malformed hash or an out-of-range
    ///   `max_length`.
    /// - [`Error::QueueFull`] when the in-progress ceiling is reached. No
    ///   state is created in that case.
    /// - [`Error::Store`] if the request could not be persisted.
    ///
    /// Broker failures are never returned: they leave the request pending
    /// for the retry loop.
    #[tracing::instrument(skip(self, hash), fields(hash = %hash))]
    pub async fn create_task(&self, hash: &str, max_length: u32) -> Result<RequestId> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::ServiceShutdown);
        }
        let hash = self.validate(hash, max_length).inspect_err(|_| {
            increment_requests_rejected();
        })?;

        let id = {
            let _admission = self.inner.admission.lock().await;
            let limit = self.inner.config.max_queue_size;
            if self.inner.store.count().await? >= limit {
                increment_requests_rejected();
                tracing::warn!(limit, "Queue full, rejecting request");
                return Err(Error::QueueFull { limit });
            }

            let id = RequestId::new();
            let state = RequestState::new(
                hash.clone(),
                max_length,
                SystemTime::now(),
                self.inner.config.response_timeout,
            );
            self.inner.store.set(id, state).await?;
            id
        };

        increment_requests_created();
        tracing::info!(request_id = %id, "Request accepted");

        let service = self.clone();
        tokio::spawn(async move {
            service.dispatch(id, &hash, max_length).await;
        });

        Ok(id)
    }

    fn validate(&self, hash: &str, max_length: u32) -> Result<String> {
        let hash = normalize_digest(hash)?;
        let limit = self.inner.config.max_allowed_length;
        if max_length == 0 || max_length > limit {
            return Err(Error::InvalidRequest {
                reason: format!("maxLength must be between 1 and {limit}, got {max_length}"),
            });
        }
        Keyspace::new(&Alphabet::default(), max_length)?;
        Ok(hash)
    }

    /// Publishes every partition of a request, flagging it pending on
    /// failure. Returns whether all parts reached the broker.
    async fn dispatch(&self, id: RequestId, hash: &str, max_length: u32) -> bool {
        match self.publish_parts(id, hash, max_length).await {
            Ok(()) => {
                tracing::debug!(request_id = %id, "Request dispatched");
                true
            }
            Err(e) => {
                increment_publish_failures();
                tracing::warn!(request_id = %id, error = %e, "Dispatch deferred, marking pending");
                if let Err(e) = self.inner.store.mark_pending(id, true).await {
                    tracing::error!(request_id = %id, error = %e, "Failed to mark request pending");
                }
                false
            }
        }
    }

    async fn publish_parts(&self, id: RequestId, hash: &str, max_length: u32) -> Result<()> {
        if !self.inner.queue.is_connected() {
            return Err(Error::Disconnected);
        }
        let tasks = Task::fan_out(id, hash, max_length, self.inner.config.part_count);
        self.inner.queue.publish_tasks(&tasks).await?;
        increment_tasks_published(tasks.len() as u64);
        Ok(())
    }

    /// Republishes every pending, in-progress request. Does nothing while
    /// the broker is disconnected and stops at the first publish failure.
    /// Returns how many requests went out.
    #[tracing::instrument(skip(self))]
    pub async fn retry_pending_tasks(&self) -> Result<usize> {
        if !self.inner.queue.is_connected() {
            return Ok(0);
        }

        let mut republished = 0;
        for pending in self.inner.store.get_pending().await? {
            if pending.status.is_terminal() {
                continue;
            }
            if let Err(e) = self
                .publish_parts(pending.id, &pending.hash, pending.max_length)
                .await
            {
                increment_publish_failures();
                tracing::warn!(request_id = %pending.id, error = %e, "Retry failed");
                break;
            }
            self.inner.store.mark_pending(pending.id, false).await?;
            republished += 1;
            tracing::info!(request_id = %pending.id, "Pending request republished");
        }
        Ok(republished)
    }

    /// Merges a worker response into its request. Returns the resulting
    /// status, or `None` if the request is unknown.
    #[tracing::instrument(
        skip(self, response),
        fields(request_id = %response.request_id, part_number = response.part_number)
    )]
    pub async fn ingest(&self, response: &WorkerResponse) -> Result<Option<RequestStatus>> {
        let Some(mut state) = self.inner.store.get(response.request_id).await? else {
            tracing::warn!("Response for unknown request, dropping");
            return Ok(None);
        };

        state.add_words(response.words());
        if !state.found_words.is_empty() {
            state.status = state.status.advance(RequestStatus::Ready);
        }

        let merged = self.inner.store.update(response.request_id, state).await?;
        increment_responses_ingested();
        tracing::info!(
            status = %merged.status,
            found = merged.found_words.len(),
            "Response ingested"
        );
        Ok(Some(merged.status))
    }

    pub async fn status(&self, id: RequestId) -> Result<StatusResponse> {
        let state = self
            .inner
            .store
            .get(id)
            .await?
            .ok_or(Error::NotFound { id })?;
        Ok(StatusResponse {
            status: state.status,
            progress: progress(&state, SystemTime::now()),
            data: state.found_words,
        })
    }

    /// Fails every in-progress request whose deadline passed by `now`.
    pub async fn expire_overdue(&self, now: SystemTime) -> Result<u64> {
        let expired = self.inner.store.expire(now).await?;
        if expired > 0 {
            increment_requests_expired(expired);
            tracing::info!(expired, "Requests timed out");
        }
        Ok(expired)
    }

    /// Stops the background loops, then closes the broker connection.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let loops = core::mem::take(&mut *self.inner.loops.lock());
        for handle in loops {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Background loop panicked");
            }
        }
        self.inner.queue.shutdown().await;
        tracing::info!("Manager service stopped");
    }

    async fn retry_loop(self) {
        let mut ticker = tokio::time::interval(self.inner.config.retry_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.inner.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.inner.queue.is_connected() {
                continue;
            }
            if let Err(e) = self.retry_pending_tasks().await {
                tracing::warn!(error = %e, "Pending scan failed");
            }
        }
        tracing::debug!("Retry loop stopped");
    }

    async fn sweep_loop(self) {
        let mut ticker = tokio::time::interval(self.inner.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.inner.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.expire_overdue(SystemTime::now()).await {
                tracing::warn!(error = %e, "Expiry sweep failed");
            }
        }
        tracing::debug!("Expiry sweeper stopped");
    }

    async fn ingest_loop(self) {
        let Some(responses) = self.inner.queue.start_consume_responses().await else {
            tracing::debug!("Responses arrive over HTTP only, ingestion loop idle");
            return;
        };
        loop {
            let inbound = tokio::select! {
                () = self.inner.shutdown.cancelled() => break,
                inbound = responses.next() => match inbound {
                    Some(inbound) => inbound,
                    None => break,
                },
            };

            match self.ingest(&inbound.message).await {
                Ok(_) => {
                    if let Err(e) = self.inner.queue.ack_message(&inbound.handle).await {
                        tracing::warn!(error = %e, "Failed to acknowledge response");
                    }
                }
                Err(e) => {
                    tracing::error!(
                        request_id = %inbound.message.request_id,
                        error = %e,
                        "Failed to persist response, requeueing"
                    );
                    // Unsettled deliveries return to the queue once the
                    // transport closes.
                    tokio::select! {
                        () = tokio::time::sleep(INGEST_RETRY_BACKOFF) => {}
                        () = self.inner.shutdown.cancelled() => break,
                    }
                    if let Err(e) = inbound.handle.reject(true).await {
                        tracing::warn!(error = %e, "Failed to requeue response");
                    }
                }
            }
        }
        tracing::debug!("Ingestion loop stopped");
    }
}

/// Progress estimate in percent.
///
/// Terminal requests report 100. In-progress requests report the elapsed
/// share of their timeout, at least 1 once any time has passed and at most
/// 100.
pub fn progress(state: &RequestState, now: SystemTime) -> u8 {
    if state.status.is_terminal() {
        return 100;
    }
    let elapsed = state.elapsed(now);
    if elapsed.is_zero() {
        return 0;
    }
    if state.timeout.is_zero() {
        return 100;
    }
    let percent = elapsed.as_secs_f64() * 100.0 / state.timeout.as_secs_f64();
    percent.floor().clamp(1.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{queue::BrokerTaskQueue, store::memory::MemoryStore};
    use crackhash_core::{
        broker::{ConnectionState, Topology, Transport, memory::MemoryBroker},
        types::{Answers, WireMessage},
    };

    const WAIT: Duration = Duration::from_secs(5);
    const MD5_OF_AB: &str = "187ef4436122d1cc2f40dc2b92f0eba0";

    struct Harness {
        service: ManagerService,
        broker: MemoryBroker,
        store: Arc<MemoryStore>,
        transport: Transport<MemoryBroker>,
    }

    async fn harness(config: ServiceConfig) -> Harness {
        let broker = MemoryBroker::new();
        let transport = Transport::spawn(
            broker.clone(),
            Topology::default(),
            Duration::from_millis(10),
        );
        assert!(transport.wait_connected(WAIT).await);
        let store = Arc::new(MemoryStore::new());
        let service = ManagerService::new(
            config,
            store.clone(),
            Arc::new(BrokerTaskQueue::new(transport.clone())),
        );
        Harness {
            service,
            broker,
            store,
            transport,
        }
    }

    async fn eventually(mut check: impl AsyncFnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !check().await {
            assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn response(id: RequestId, words: &[&str]) -> WorkerResponse {
        WorkerResponse {
            request_id: id,
            part_number: 0,
            answers: Answers {
                words: words.iter().map(|w| (*w).to_owned()).collect(),
            },
        }
    }

    fn state_at(status: RequestStatus, timeout: Duration) -> RequestState {
        let mut state = RequestState::new(MD5_OF_AB, 2, SystemTime::UNIX_EPOCH, timeout);
        state.status = status;
        state
    }

    #[test]
    fn progress_follows_elapsed_share_of_timeout() {
        let timeout = Duration::from_secs(100);
        let running = state_at(RequestStatus::InProgress, timeout);
        let at = |ms| SystemTime::UNIX_EPOCH + Duration::from_millis(ms);

        assert_eq!(progress(&running, at(0)), 0);
        assert_eq!(
            progress(&running, SystemTime::UNIX_EPOCH + Duration::from_micros(300)),
            1
        );
        assert_eq!(progress(&running, at(5)), 1);
        assert_eq!(progress(&running, at(2_999)), 2);
        assert_eq!(progress(&running, at(50_000)), 50);
        assert_eq!(progress(&running, at(500_000)), 100);
        assert_eq!(progress(&state_at(RequestStatus::Ready, timeout), at(0)), 100);
        assert_eq!(progress(&state_at(RequestStatus::Error, timeout), at(1)), 100);
    }

    #[tokio::test]
    async fn create_task_fans_out_every_part() {
        let h = harness(ServiceConfig {
            part_count: 3,
            ..Default::default()
        })
        .await;

        let id = h.service.create_task(MD5_OF_AB, 2).await.unwrap();
        eventually(async || h.broker.ready_len("task_queue") == 3).await;

        let state = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(state.status, RequestStatus::InProgress);
        assert!(!state.pending);
        assert_eq!(state.hash, MD5_OF_AB);
        h.transport.shutdown().await;
    }

    #[tokio::test]
    async fn same_request_twice_gets_two_ids() {
        let h = harness(ServiceConfig::default()).await;
        let first = h.service.create_task(MD5_OF_AB, 2).await.unwrap();
        let second = h.service.create_task(MD5_OF_AB, 2).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(h.store.count().await.unwrap(), 2);
        h.transport.shutdown().await;
    }

    #[tokio::test]
    async fn rejects_invalid_requests() {
        let h = harness(ServiceConfig::default()).await;
        for (hash, max_length) in [("xyz", 2), (MD5_OF_AB, 0), (MD5_OF_AB, 9)] {
            assert!(matches!(
                h.service.create_task(hash, max_length).await,
                Err(Error::InvalidRequest { .. })
            ));
        }
        assert_eq!(h.store.count().await.unwrap(), 0);
        h.transport.shutdown().await;
    }

    #[tokio::test]
    async fn admission_control_refuses_past_the_ceiling() {
        let h = harness(ServiceConfig {
            max_queue_size: 2,
            ..Default::default()
        })
        .await;
        h.service.create_task(MD5_OF_AB, 1).await.unwrap();
        h.service.create_task(MD5_OF_AB, 1).await.unwrap();

        assert!(matches!(
            h.service.create_task(MD5_OF_AB, 1).await,
            Err(Error::QueueFull { limit: 2 })
        ));
        assert_eq!(h.store.count().await.unwrap(), 2);
        h.transport.shutdown().await;
    }

    #[tokio::test]
    async fn disconnected_dispatch_marks_pending_and_retry_clears_it() {
        let h = harness(ServiceConfig::default()).await;
        h.broker.set_online(false);
        let mut state = h.transport.watch_state();
        state
            .wait_for(|s| *s != ConnectionState::Connected)
            .await
            .unwrap();

        let id = h.service.create_task(MD5_OF_AB, 2).await.unwrap();
        eventually(async || h.store.get(id).await.unwrap().is_some_and(|s| s.pending)).await;
        assert_eq!(h.service.retry_pending_tasks().await.unwrap(), 0);

        h.broker.set_online(true);
        assert!(h.transport.wait_connected(WAIT).await);
        assert_eq!(h.service.retry_pending_tasks().await.unwrap(), 1);

        let state = h.store.get(id).await.unwrap().unwrap();
        assert!(!state.pending);
        assert_eq!(h.broker.ready_len("task_queue"), 1);
        h.transport.shutdown().await;
    }

    #[tokio::test]
    async fn ingest_marks_ready_and_keeps_words_a_set() {
        let h = harness(ServiceConfig::default()).await;
        let id = h.service.create_task(MD5_OF_AB, 2).await.unwrap();

        let empty = h.service.ingest(&response(id, &[])).await.unwrap();
        assert_eq!(empty, Some(RequestStatus::InProgress));

        let found = h.service.ingest(&response(id, &["ab"])).await.unwrap();
        assert_eq!(found, Some(RequestStatus::Ready));
        h.service.ingest(&response(id, &["ab"])).await.unwrap();

        let status = h.service.status(id).await.unwrap();
        assert_eq!(status.status, RequestStatus::Ready);
        assert_eq!(status.data, vec!["ab".to_owned()]);
        assert_eq!(status.progress, 100);

        assert_eq!(
            h.service.ingest(&response(RequestId::new(), &["ab"])).await.unwrap(),
            None
        );
        h.transport.shutdown().await;
    }

    #[tokio::test]
    async fn late_words_do_not_revive_an_expired_request() {
        let h = harness(ServiceConfig {
            response_timeout: Duration::from_millis(1),
            ..Default::default()
        })
        .await;
        let id = h.service.create_task(MD5_OF_AB, 2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(h.service.expire_overdue(SystemTime::now()).await.unwrap(), 1);

        let status = h.service.ingest(&response(id, &["ab"])).await.unwrap();
        assert_eq!(status, Some(RequestStatus::Error));
        let state = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(state.found_words, vec!["ab".to_owned()]);
        assert!(!state.pending);
        h.transport.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_status_is_not_found() {
        let h = harness(ServiceConfig::default()).await;
        assert!(matches!(
            h.service.status(RequestId::new()).await,
            Err(Error::NotFound { .. })
        ));
        h.transport.shutdown().await;
    }

    #[tokio::test]
    async fn ingestion_loop_acks_after_persisting() {
        let h = harness(ServiceConfig::default()).await;
        h.service.start();
        let id = h.service.create_task(MD5_OF_AB, 2).await.unwrap();

        let responses = &h.transport.topology().responses;
        h.transport
            .publish(responses, &response(id, &["ab"]).encode().unwrap())
            .await
            .unwrap();

        eventually(async || {
            h.store
                .get(id)
                .await
                .unwrap()
                .is_some_and(|s| s.status == RequestStatus::Ready)
        })
        .await;
        eventually(async || h.broker.unacked_len("worker_responses") == 0).await;
        assert_eq!(h.broker.ready_len("worker_responses"), 0);
        h.service.shutdown().await;
    }

    /// Store whose merges always fail, counting the attempts.
    #[derive(Default)]
    struct UpdatesFail {
        inner: MemoryStore,
        updates: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl RequestStore for UpdatesFail {
        async fn set(&self, id: RequestId, state: RequestState) -> Result<()> {
            self.inner.set(id, state).await
        }

        async fn get(&self, id: RequestId) -> Result<Option<RequestState>> {
            self.inner.get(id).await
        }

        async fn update(&self, _id: RequestId, _state: RequestState) -> Result<RequestState> {
            self.updates.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(Error::Store {
                context: "write refused".into(),
            })
        }

        async fn count(&self) -> Result<usize> {
            self.inner.count().await
        }

        async fn mark_pending(&self, id: RequestId, pending: bool) -> Result<bool> {
            self.inner.mark_pending(id, pending).await
        }

        async fn get_pending(&self) -> Result<Vec<crate::store::PendingTask>> {
            self.inner.get_pending().await
        }

        async fn expire(&self, now: SystemTime) -> Result<u64> {
            self.inner.expire(now).await
        }
    }

    #[tokio::test]
    async fn shutdown_interrupts_the_ingest_backoff() {
        let h = harness(ServiceConfig::default()).await;
        let store = Arc::new(UpdatesFail::default());
        let service = ManagerService::new(
            ServiceConfig::default(),
            store.clone(),
            Arc::new(BrokerTaskQueue::new(h.transport.clone())),
        );
        service.start();
        let id = service.create_task(MD5_OF_AB, 2).await.unwrap();

        let responses = &h.transport.topology().responses;
        h.transport
            .publish(responses, &response(id, &["ab"]).encode().unwrap())
            .await
            .unwrap();
        eventually(async || store.updates.load(std::sync::atomic::Ordering::SeqCst) == 1).await;

        tokio::time::timeout(INGEST_RETRY_BACKOFF / 2, service.shutdown())
            .await
            .expect("shutdown waited out the ingest backoff");

        // The failed response was neither acked nor dropped.
        assert_eq!(h.broker.ready_len("worker_responses"), 1);
        assert!(h.broker.dead_letters("worker_responses").is_empty());
    }
}
