//! In-process broker.
//!
//! Mirrors the delivery semantics the services rely on from RabbitMQ:
//! direct exchanges routed by queue name, competing consumers, manual
//! acknowledgements, redelivery of unacknowledged messages when a session
//! ends, and dead-lettering of messages rejected without requeue.
//!
//! [`MemoryBroker::set_online`] simulates an outage: every session is
//! severed at once and connecting fails until the broker comes back.
//! [`MemoryBroker::cancel_consumers`] ends the consumers of one queue while
//! their sessions stay up, the way a broker-side consumer cancel does.

use super::{Acknowledger, Connector, Delivery, DeliveryHandle, Route, Session, Topology};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    /// Woken whenever a queue gains ready messages or sessions are severed.
    notify: Notify,
}

struct State {
    online: bool,
    /// `(exchange, routing key) -> queue`
    bindings: HashMap<(String, String), String>,
    queues: HashMap<String, Queue>,
    sessions: HashMap<u64, CancellationToken>,
    /// `(queue, consumer)`; each consumer token is a child of its session's.
    consumers: Vec<(String, CancellationToken)>,
    next_session: u64,
    next_tag: u64,
}

impl Default for State {
    fn default() -> Self {
        Self {
            online: true,
            bindings: HashMap::new(),
            queues: HashMap::new(),
            sessions: HashMap::new(),
            consumers: Vec::new(),
            next_session: 0,
            next_tag: 0,
        }
    }
}

#[derive(Default)]
struct Queue {
    ready: VecDeque<Message>,
    /// `tag -> (session, message)`
    unacked: HashMap<u64, (u64, Message)>,
    dead: Vec<Vec<u8>>,
    requeued: usize,
}

struct Message {
    payload: Vec<u8>,
    redelivered: bool,
}

impl Queue {
    /// Moves unacknowledged messages matching `owned` back to the head of the
    /// queue, oldest first.
    fn requeue_where(&mut self, owned: impl Fn(u64) -> bool) -> usize {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, (session, _))| owned(*session))
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in &tags {
            if let Some((_, message)) = self.unacked.remove(tag) {
                self.requeue(message);
            }
        }
        tags.len()
    }

    fn requeue(&mut self, mut message: Message) {
        message.redelivered = true;
        self.requeued += 1;
        self.ready.push_front(message);
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_online(&self) -> bool {
        self.inner.state.lock().online
    }

    /// Takes the broker down or brings it back up.
    ///
    /// Going offline severs every open session and returns their
    /// unacknowledged messages to the head of their queues.
    pub fn set_online(&self, online: bool) {
        let mut state = self.inner.state.lock();
        if state.online == online {
            return;
        }
        state.online = online;
        if !online {
            for (_, token) in state.sessions.drain() {
                token.cancel();
            }
            let mut requeued = 0;
            for queue in state.queues.values_mut() {
                requeued += queue.requeue_where(|_| true);
            }
            tracing::debug!(requeued, "memory broker went offline");
        }
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Ends every consumer of `queue` without closing its session. Returns
    /// how many were cancelled.
    pub fn cancel_consumers(&self, queue: &str) -> usize {
        let mut state = self.inner.state.lock();
        let mut cancelled = 0;
        state.consumers.retain(|(q, token)| {
            if q == queue && !token.is_cancelled() {
                token.cancel();
                cancelled += 1;
                return false;
            }
            !token.is_cancelled()
        });
        cancelled
    }

    /// Messages waiting for a consumer.
    pub fn ready_len(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages delivered but not yet settled.
    pub fn unacked_len(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    /// How many times a message of `queue` went back to the head of the
    /// queue, by explicit requeue or a severed session.
    pub fn requeued(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.requeued)
    }

    /// Removes the binding of `route`, so publishes to it fail while
    /// sessions stay up. The next connect declares it again.
    pub fn unbind(&self, route: &Route) {
        self.inner
            .state
            .lock()
            .bindings
            .remove(&(route.exchange.clone(), route.routing_key().to_owned()));
    }

    /// Binds `route` again after [`MemoryBroker::unbind`].
    pub fn bind(&self, route: &Route) {
        let mut state = self.inner.state.lock();
        state.queues.entry(route.queue.clone()).or_default();
        state.bindings.insert(
            (route.exchange.clone(), route.routing_key().to_owned()),
            route.queue.clone(),
        );
    }

    /// Payloads rejected without requeue.
    pub fn dead_letters(&self, queue: &str) -> Vec<Vec<u8>> {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.dead.clone())
            .unwrap_or_default()
    }

    fn take(&self, queue: &str, session: u64) -> Option<Delivery> {
        let mut state = self.inner.state.lock();
        let tag = state.next_tag;
        let q = state.queues.get_mut(queue)?;
        let message = q.ready.pop_front()?;
        let delivery = Delivery {
            payload: message.payload.clone(),
            redelivered: message.redelivered,
            handle: DeliveryHandle::new(MemoryAcker {
                broker: self.clone(),
                queue: queue.to_owned(),
                tag,
            }),
        };
        q.unacked.insert(tag, (session, message));
        state.next_tag += 1;
        Some(delivery)
    }

    fn settle(&self, queue: &str, tag: u64, outcome: Settle) -> Result<()> {
        let mut state = self.inner.state.lock();
        let q = state.queues.get_mut(queue).ok_or_else(|| Error::ChannelError {
            context: format!("queue `{queue}` does not exist"),
        })?;
        let (_, message) = q.unacked.remove(&tag).ok_or_else(|| Error::ChannelError {
            context: format!("delivery {tag} is already settled or its session closed"),
        })?;
        match outcome {
            Settle::Ack => {}
            Settle::Requeue => {
                q.requeue(message);
                drop(state);
                self.inner.notify.notify_waiters();
            }
            Settle::Drop => q.dead.push(message.payload),
        }
        Ok(())
    }
}

enum Settle {
    Ack,
    Requeue,
    Drop,
}

#[async_trait]
impl Connector for MemoryBroker {
    type Session = MemorySession;

    async fn connect(&self, topology: &Topology) -> Result<MemorySession> {
        let mut state = self.inner.state.lock();
        if !state.online {
            return Err(Error::Disconnected);
        }
        for route in topology.routes() {
            state.queues.entry(route.queue.clone()).or_default();
            state.bindings.insert(
                (route.exchange.clone(), route.routing_key().to_owned()),
                route.queue.clone(),
            );
        }
        state.next_session += 1;
        let id = state.next_session;
        let closed = CancellationToken::new();
        state.sessions.insert(id, closed.clone());

        Ok(MemorySession {
            broker: self.clone(),
            id,
            closed,
        })
    }
}

pub struct MemorySession {
    broker: MemoryBroker,
    id: u64,
    closed: CancellationToken,
}

struct ConsumerState {
    broker: MemoryBroker,
    session: u64,
    queue: String,
    closed: CancellationToken,
}

#[async_trait]
impl Session for MemorySession {
    async fn publish(&self, route: &Route, payload: &[u8]) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::Disconnected);
        }
        {
            let mut state = self.broker.inner.state.lock();
            let key = (route.exchange.clone(), route.routing_key().to_owned());
            let queue = state.bindings.get(&key).cloned().ok_or_else(|| Error::Publish {
                context: format!(
                    "no queue bound to `{}` with key `{}`",
                    route.exchange,
                    route.routing_key()
                ),
            })?;
            state.queues.entry(queue).or_default().ready.push_back(Message {
                payload: payload.to_vec(),
                redelivered: false,
            });
        }
        self.broker.inner.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<BoxStream<'static, Result<Delivery>>> {
        if self.closed.is_cancelled() {
            return Err(Error::Disconnected);
        }
        let closed = {
            let mut state = self.broker.inner.state.lock();
            if !state.queues.contains_key(queue) {
                return Err(Error::ChannelError {
                    context: format!("queue `{queue}` is not declared"),
                });
            }
            state.consumers.retain(|(_, token)| !token.is_cancelled());
            let token = self.closed.child_token();
            state.consumers.push((queue.to_owned(), token.clone()));
            token
        };

        let consumer = ConsumerState {
            broker: self.broker.clone(),
            session: self.id,
            queue: queue.to_owned(),
            closed,
        };

        let stream = futures::stream::unfold(consumer, |consumer| async move {
            let inner = Arc::clone(&consumer.broker.inner);
            loop {
                let notified = inner.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if consumer.closed.is_cancelled() {
                    return None;
                }
                if let Some(delivery) = consumer.broker.take(&consumer.queue, consumer.session) {
                    return Some((Ok(delivery), consumer));
                }

                tokio::select! {
                    () = &mut notified => {}
                    () = consumer.closed.cancelled() => return None,
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }

    async fn close(&self) {
        {
            let mut state = self.broker.inner.state.lock();
            state.sessions.remove(&self.id);
            let id = self.id;
            for queue in state.queues.values_mut() {
                queue.requeue_where(|session| session == id);
            }
        }
        self.closed.cancel();
        self.broker.inner.notify.notify_waiters();
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
    tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.broker.settle(&self.queue, self.tag, Settle::Ack)
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        let outcome = if requeue { Settle::Requeue } else { Settle::Drop };
        self.broker.settle(&self.queue, self.tag, outcome)
    }
}
