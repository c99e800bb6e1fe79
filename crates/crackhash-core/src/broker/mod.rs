//! Durable publish/subscribe transport between the manager and the workers.
//!
//! This module abstracts a message broker behind two traits and supervises
//! the connection on top of them.
//!
//! ## Structure
//!
//! - [`Connector`] / [`Session`] - what a broker must provide: connect and
//!   declare topology, publish, consume with manual acknowledgements, and
//!   report connection loss.
//! - [`Transport`] - the connection supervisor. It owns the reconnect loop,
//!   serializes reconnects against publishes, and re-arms every active
//!   subscription after a reconnect so existing streams keep flowing.
//! - [`amqp`] - RabbitMQ realization backed by `lapin`.
//! - [`memory`] - in-process broker with the same delivery semantics, used
//!   for single-process runs and tests.
//!
//! ## Topology
//!
//! Two logical channels, each a durable direct exchange bound to a durable
//! queue under the queue's own name:
//!
//! - tasks: manager -> workers
//! - responses: workers -> manager

pub mod amqp;
pub mod memory;
mod transport;

pub use transport::{DeliveryStream, Inbound, InboundStream, Transport};

use crate::Result;
use async_trait::async_trait;
use core::fmt;
use futures::stream::BoxStream;
use std::sync::Arc;

/// An exchange and the queue bound to it. The queue name doubles as the
/// routing key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub exchange: String,
    pub queue: String,
}

impl Route {
    pub fn new(exchange: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.queue
    }
}

/// Exchanges and queues declared on every (re)connect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    pub tasks: Route,
    pub responses: Route,
}

impl Topology {
    pub fn routes(&self) -> [&Route; 2] {
        [&self.tasks, &self.responses]
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            tasks: Route::new("tasks_direct", "task_queue"),
            responses: Route::new("responses_direct", "worker_responses"),
        }
    }
}

/// Connection state tracked by the [`Transport`] supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// The connection was lost (or never established) and no attempt is in
    /// flight yet.
    Disconnected,
    /// At least one reconnect attempt failed; retrying on a fixed interval.
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Establishes sessions with a broker.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Session: Session;

    /// Opens a connection and declares `topology` on it.
    async fn connect(&self, topology: &Topology) -> Result<Self::Session>;
}

/// One live broker connection.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Durably enqueues `payload` on `route`.
    async fn publish(&self, route: &Route, payload: &[u8]) -> Result<()>;

    /// Starts a manually-acknowledged consumer on `queue`. The stream ends
    /// when the session is lost.
    async fn consume(&self, queue: &str) -> Result<BoxStream<'static, Result<Delivery>>>;

    /// Resolves once the connection is lost or closed.
    async fn closed(&self);

    /// Closes the connection. Unacknowledged deliveries return to their
    /// queues.
    async fn close(&self);
}

/// Settles a single delivery with the broker that produced it.
#[async_trait]
pub trait Acknowledger: Send + Sync + 'static {
    async fn ack(&self) -> Result<()>;

    /// Rejects the delivery. With `requeue` it is redelivered later,
    /// otherwise the broker drops it.
    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// Opaque, cloneable handle used to settle a delivery after processing.
#[derive(Clone)]
pub struct DeliveryHandle {
    acker: Arc<dyn Acknowledger>,
}

impl DeliveryHandle {
    pub fn new(acker: impl Acknowledger) -> Self {
        Self {
            acker: Arc::new(acker),
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for DeliveryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryHandle").finish_non_exhaustive()
    }
}

/// A raw message received from a queue.
#[derive(Debug)]
pub struct Delivery {
    pub payload: Vec<u8>,
    pub redelivered: bool,
    pub handle: DeliveryHandle,
}
