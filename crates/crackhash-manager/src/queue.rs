//! How tasks leave the manager.
//!
//! - [`BrokerTaskQueue`]: publish tasks to the broker and consume worker
//!   responses from it.
//! - [`HttpTaskQueue`]: POST each task straight to a worker. Workers PATCH
//!   their results back to the manager's ingest endpoint, so this backend
//!   has no response stream.

use async_trait::async_trait;
use core::time::Duration;
use crackhash_core::{
    Error, Result,
    broker::{Connector, DeliveryHandle, InboundStream, Transport},
    types::{Task, WireMessage, WorkerResponse},
};
use reqwest::header::CONTENT_TYPE;

#[async_trait]
pub trait TaskQueue: Send + Sync + 'static {
    fn is_connected(&self) -> bool;

    /// Durably enqueues `task`. Fails with `Disconnected` when the broker is
    /// unreachable.
    async fn publish_task(&self, task: &Task) -> Result<()>;

    /// Hands off every partition of one request, stopping at the first
    /// failure.
    async fn publish_tasks(&self, tasks: &[Task]) -> Result<()> {
        for task in tasks {
            self.publish_task(task).await?;
        }
        Ok(())
    }

    /// The response stream, or `None` if responses do not arrive through
    /// this queue. Repeated calls return the same live stream, which keeps
    /// flowing across reconnects.
    async fn start_consume_responses(&self) -> Option<InboundStream<WorkerResponse>>;

    /// Acknowledges a processed response. A no-op while disconnected: the
    /// broker redelivers the message after the reconnect anyway.
    async fn ack_message(&self, handle: &DeliveryHandle) -> Result<()>;

    async fn shutdown(&self);
}

/// [`TaskQueue`] over a supervised broker connection.
#[derive(Clone)]
pub struct BrokerTaskQueue<C: Connector> {
    transport: Transport<C>,
}

impl<C: Connector> BrokerTaskQueue<C> {
    pub fn new(transport: Transport<C>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Transport<C> {
        &self.transport
    }
}

#[async_trait]
impl<C: Connector> TaskQueue for BrokerTaskQueue<C> {
    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    async fn publish_task(&self, task: &Task) -> Result<()> {
        self.transport
            .publish_message(&self.transport.topology().tasks, task)
            .await
    }

    async fn start_consume_responses(&self) -> Option<InboundStream<WorkerResponse>> {
        let stream = self
            .transport
            .subscribe_to(&self.transport.topology().responses.queue)
            .await;
        Some(stream)
    }

    async fn ack_message(&self, handle: &DeliveryHandle) -> Result<()> {
        if !self.transport.is_connected() {
            tracing::debug!("Skipping ack while disconnected");
            return Ok(());
        }
        handle.ack().await
    }

    async fn shutdown(&self) {
        self.transport.shutdown().await;
    }
}

/// [`TaskQueue`] that sends part `i` of a request to `worker_urls[i % n]`.
///
/// A worker answers only after it scanned its partition and reported the
/// result, so a dispatch lasts as long as the slowest partition. Parts go
/// out concurrently, and the request counts as dispatched if any worker
/// accepted its part.
#[derive(Clone, Debug)]
pub struct HttpTaskQueue {
    http: reqwest::Client,
    worker_urls: Vec<String>,
}

impl HttpTaskQueue {
    /// `timeout` bounds a single worker call, scan included.
    pub fn new(worker_urls: Vec<String>, timeout: Duration) -> Result<Self> {
        if worker_urls.is_empty() {
            return Err(Error::InvalidRequest {
                reason: "at least one worker URL is required".into(),
            });
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Publish {
                context: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { http, worker_urls })
    }

    pub fn worker_urls(&self) -> &[String] {
        &self.worker_urls
    }

    fn url_for(&self, task: &Task) -> &str {
        &self.worker_urls[task.part_number as usize % self.worker_urls.len()]
    }
}

#[async_trait]
impl TaskQueue for HttpTaskQueue {
    fn is_connected(&self) -> bool {
        true
    }

    async fn publish_task(&self, task: &Task) -> Result<()> {
        let url = self.url_for(task);
        let reply = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(task.encode()?)
            .send()
            .await
            .map_err(|e| Error::Publish {
                context: format!("{url}: {e}"),
            })?;

        let status = reply.status();
        if !status.is_success() {
            return Err(Error::Publish {
                context: format!("{url} answered {status}"),
            });
        }
        tracing::debug!(request_id = %task.request_id, part_number = task.part_number, %url, "Task handed to worker");
        Ok(())
    }

    async fn publish_tasks(&self, tasks: &[Task]) -> Result<()> {
        let results =
            futures::future::join_all(tasks.iter().map(|task| self.publish_task(task))).await;

        let mut delivered = 0;
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => errors.push(e.to_string()),
            }
        }
        if delivered == 0 && !errors.is_empty() {
            return Err(Error::Publish {
                context: errors.join("; "),
            });
        }
        if !errors.is_empty() {
            tracing::warn!(delivered, failed = errors.len(), errors = %errors.join("; "), "Some workers refused their part");
        }
        Ok(())
    }

    async fn start_consume_responses(&self) -> Option<InboundStream<WorkerResponse>> {
        None
    }

    async fn ack_message(&self, _handle: &DeliveryHandle) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) {}
}
