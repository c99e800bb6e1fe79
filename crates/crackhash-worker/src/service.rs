//! Worker orchestration: run a task through the compute engine off the
//! async runtime and build the response to hand back.

use crate::engine::ComputeEngine;
use crackhash_core::{
    Error, Result,
    telemetry::{increment_tasks_processed, record_task_duration},
    types::{Task, WorkerResponse},
};
use std::{sync::Arc, time::Instant};

/// Cheap to clone; clones share the engine.
#[derive(Clone, Debug)]
pub struct WorkerService {
    engine: Arc<ComputeEngine>,
}

impl WorkerService {
    pub fn new(engine: ComputeEngine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }

    pub fn engine(&self) -> &ComputeEngine {
        &self.engine
    }

    /// Scans the task's partition and returns the matches as a response
    /// addressed to the task's request.
    #[tracing::instrument(
        skip(self, task),
        fields(request_id = %task.request_id, part_number = task.part_number)
    )]
    pub async fn process_task(&self, task: Task) -> Result<WorkerResponse> {
        let engine = Arc::clone(&self.engine);
        let started = Instant::now();

        let (task, words) = tokio::task::spawn_blocking(move || {
            let words = engine.process(&task);
            (task, words)
        })
        .await
        .map_err(|e| Error::ChannelError {
            context: format!("compute task failed: {e}"),
        })?;
        let words = words?;

        let elapsed = started.elapsed();
        increment_tasks_processed();
        record_task_duration(elapsed.as_secs_f64() * 1_000.0);
        tracing::info!(found = words.len(), ?elapsed, "Partition scanned");

        Ok(WorkerResponse::for_task(&task, words))
    }
}
