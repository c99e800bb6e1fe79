//! Broker side of the worker.
//!
//! [`TaskConsumer`] pulls tasks from the task queue, runs them through the
//! [`WorkerService`] and publishes each response to the response queue. A
//! task is acknowledged only after its response was published:
//!
//! - publish failure: reject with requeue, so the task is retried;
//! - malformed or unprocessable task: reject without requeue.

use crate::service::WorkerService;
use core::time::Duration;
use crackhash_core::broker::{Connector, Inbound, Transport};
use crackhash_core::types::Task;
use tokio_util::sync::CancellationToken;

/// Pause before requeueing a task whose response could not be published.
const REQUEUE_BACKOFF: Duration = Duration::from_millis(500);

pub struct TaskConsumer<C: Connector> {
    transport: Transport<C>,
    service: WorkerService,
    shutdown: CancellationToken,
}

impl<C: Connector> TaskConsumer<C> {
    pub fn new(transport: Transport<C>, service: WorkerService) -> Self {
        Self {
            transport,
            service,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops [`run`](Self::run) once cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Processes tasks one at a time until shutdown. The subscription
    /// survives broker reconnects.
    pub async fn run(&self) {
        let tasks = self
            .transport
            .subscribe_to::<Task>(&self.transport.topology().tasks.queue)
            .await;
        tracing::info!(queue = %self.transport.topology().tasks.queue, "Consuming tasks");

        loop {
            let inbound = tokio::select! {
                () = self.shutdown.cancelled() => break,
                inbound = tasks.next() => match inbound {
                    Some(inbound) => inbound,
                    None => break,
                },
            };
            self.handle(inbound).await;
        }
        tracing::info!("Task consumer stopped");
    }

    async fn handle(&self, inbound: Inbound<Task>) {
        let Inbound {
            message: task,
            redelivered,
            handle,
        } = inbound;
        let (request_id, part_number) = (task.request_id, task.part_number);
        tracing::debug!(%request_id, part_number, redelivered, "Task received");

        let response = match self.service.process_task(task).await {
            Ok(response) => response,
            Err(e) => {
                let requeue = !e.is_permanent();
                tracing::warn!(%request_id, part_number, error = %e, requeue, "Task failed");
                if let Err(e) = handle.reject(requeue).await {
                    tracing::warn!(%request_id, error = %e, "Failed to reject task");
                }
                return;
            }
        };

        let responses = &self.transport.topology().responses;
        match self.transport.publish_message(responses, &response).await {
            Ok(()) => {
                if let Err(e) = handle.ack().await {
                    tracing::warn!(%request_id, error = %e, "Failed to acknowledge task");
                }
            }
            Err(e) => {
                tracing::warn!(%request_id, part_number, error = %e, "Response publish failed, requeueing task");
                tokio::time::sleep(REQUEUE_BACKOFF).await;
                if let Err(e) = handle.reject(true).await {
                    tracing::debug!(%request_id, error = %e, "Requeue failed, the broker redelivers on reconnect");
                }
            }
        }
    }
}
