//! Connection supervision on top of a [`Connector`].
//!
//! [`Transport`] runs one supervisor task per broker connection. The
//! supervisor drives a small state machine:
//!
//! ```text
//!              connect ok
//!  Disconnected ---------> Connected
//!      |   ^                  |
//!      |   |  session closed  |
//!      |   +------------------+
//!      | connect failed
//!      v
//!  Reconnecting --(every reconnect_interval)--> retry connect
//! ```
//!
//! On every transition into `Connected` the topology is declared again (by
//! the connector) and each active subscription is re-armed on the new
//! session, so a stream handed out before a disconnect keeps receiving
//! messages without being re-requested.
//!
//! A consumer that cannot start, fails, or ends while its subscriber is still
//! listening counts as a lost session too: the supervisor tears the session
//! down and reconnects, which re-arms every subscription.
//!
//! The live session sits behind an async `RwLock`: publishes hold a read
//! guard, while the supervisor takes the write guard to install or tear down
//! a session. A publish therefore never races a reconnect.

use super::{ConnectionState, Connector, Delivery, DeliveryHandle, Route, Session, Topology};
use crate::{Error, Result, telemetry, types::WireMessage};
use core::{fmt, marker::PhantomData, time::Duration};
use futures::StreamExt;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{RwLock, mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// Deliveries buffered between a broker consumer and its subscriber. Kept at
/// one so prefetching stays under the broker's control.
const SUBSCRIPTION_BUFFER: usize = 1;

/// A self-healing connection to a broker.
///
/// Cheap to clone; all clones share the same connection and subscriptions.
pub struct Transport<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for Transport<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared<C: Connector> {
    connector: C,
    topology: Topology,
    reconnect_interval: Duration,
    state: watch::Sender<ConnectionState>,
    session: RwLock<Option<Live<C::Session>>>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    shutdown: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// The installed session plus the signal its consumers raise when they die.
struct Live<S> {
    session: Arc<S>,
    lost: CancellationToken,
}

struct Subscription {
    tx: mpsc::Sender<Delivery>,
    stream: DeliveryStream,
}

impl<C: Connector> Transport<C> {
    /// Starts supervising a connection. The first connect attempt happens in
    /// the background; use [`Transport::wait_connected`] to block on it.
    pub fn spawn(connector: C, topology: Topology, reconnect_interval: Duration) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            connector,
            topology,
            reconnect_interval,
            state,
            session: RwLock::new(None),
            subscriptions: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            supervisor: Mutex::new(None),
        });

        let handle = tokio::spawn(supervise(Arc::clone(&shared)));
        *shared.supervisor.lock() = Some(handle);

        Self { shared }
    }

    pub fn topology(&self) -> &Topology {
        &self.shared.topology
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Waits up to `timeout` for the connection to come up.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut state = self.watch_state();
        matches!(
            tokio::time::timeout(
                timeout,
                state.wait_for(|s| *s == ConnectionState::Connected)
            )
            .await,
            Ok(Ok(_))
        )
    }

    /// Publishes raw bytes on `route`.
    ///
    /// # Errors
    ///
    /// - [`Error::Disconnected`] if there is no live session.
    /// - [`Error::ServiceShutdown`] once [`Transport::shutdown`] was called.
    /// - [`Error::Publish`] if the broker did not accept the message.
    pub async fn publish(&self, route: &Route, payload: &[u8]) -> Result<()> {
        if self.shared.shutdown.is_cancelled() {
            return Err(Error::ServiceShutdown);
        }
        let guard = self.shared.session.read().await;
        let Some(live) = guard.as_ref() else {
            return Err(Error::Disconnected);
        };
        live.session.publish(route, payload).await
    }

    pub async fn publish_message<M: WireMessage>(&self, route: &Route, message: &M) -> Result<()> {
        let payload = message.encode()?;
        self.publish(route, &payload).await
    }

    /// Returns the delivery stream of `queue`, subscribing on first use.
    ///
    /// Subscribing is idempotent: every call for the same queue returns a
    /// handle to the same live stream. The subscription survives reconnects
    /// and may be requested while disconnected; it is armed as soon as a
    /// session exists.
    pub async fn subscribe(&self, queue: &str) -> DeliveryStream {
        // Holding the read guard while registering means the supervisor
        // either sees this subscription when it installs the next session, or
        // we see the installed session here. Never both, never neither.
        let guard = self.shared.session.read().await;

        let (tx, stream) = {
            let mut subscriptions = self.shared.subscriptions.lock();
            if let Some(existing) = subscriptions.get(queue) {
                return existing.stream.clone();
            }
            let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
            let stream = DeliveryStream::new(rx);
            subscriptions.insert(
                queue.to_owned(),
                Subscription {
                    tx: tx.clone(),
                    stream: stream.clone(),
                },
            );
            (tx, stream)
        };

        if let Some(live) = guard.as_ref() {
            arm(
                Arc::clone(&live.session),
                queue.to_owned(),
                tx,
                live.lost.clone(),
            );
        }
        stream
    }

    /// Typed view of [`Transport::subscribe`]. Payloads that fail to decode
    /// are rejected without requeue.
    pub async fn subscribe_to<M: WireMessage>(&self, queue: &str) -> InboundStream<M> {
        InboundStream::new(self.subscribe(queue).await)
    }

    /// Stops the supervisor, closes the session and ends all subscription
    /// streams.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let handle = self.shared.supervisor.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "broker supervisor panicked");
            }
        }
        self.shared.subscriptions.lock().clear();
    }
}

impl<C: Connector> fmt::Debug for Transport<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("topology", &self.shared.topology)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<C: Connector> Shared<C> {
    async fn install(&self, session: Arc<C::Session>, lost: CancellationToken) {
        let mut guard = self.session.write().await;
        *guard = Some(Live {
            session: Arc::clone(&session),
            lost: lost.clone(),
        });

        let armed: Vec<_> = self
            .subscriptions
            .lock()
            .iter()
            .map(|(queue, sub)| (queue.clone(), sub.tx.clone()))
            .collect();
        for (queue, tx) in armed {
            tracing::debug!(%queue, "re-arming subscription");
            arm(Arc::clone(&session), queue, tx, lost.clone());
        }

        self.state.send_replace(ConnectionState::Connected);
    }

    async fn uninstall(&self) {
        let mut guard = self.session.write().await;
        self.state.send_replace(ConnectionState::Disconnected);
        guard.take();
    }
}

async fn supervise<C: Connector>(shared: Arc<Shared<C>>) {
    let mut failures: u64 = 0;

    loop {
        let connected = tokio::select! {
            res = shared.connector.connect(&shared.topology) => res,
            () = shared.shutdown.cancelled() => break,
        };

        match connected {
            Ok(session) => {
                failures = 0;
                let session = Arc::new(session);
                let lost = CancellationToken::new();
                shared.install(Arc::clone(&session), lost.clone()).await;
                tracing::info!("Broker connection established");

                let consumer_lost = tokio::select! {
                    () = session.closed() => {
                        tracing::warn!("Broker connection lost, reconnecting");
                        false
                    }
                    () = lost.cancelled() => {
                        tracing::warn!("Broker consumer lost, resetting connection");
                        true
                    }
                    () = shared.shutdown.cancelled() => {
                        shared.uninstall().await;
                        session.close().await;
                        break;
                    }
                };
                shared.uninstall().await;
                session.close().await;
                telemetry::increment_reconnects();

                // The broker is still reachable, so pace resets that keep
                // failing the same way.
                if consumer_lost {
                    tokio::select! {
                        () = tokio::time::sleep(shared.reconnect_interval) => {}
                        () = shared.shutdown.cancelled() => break,
                    }
                }
            }
            Err(e) => {
                failures += 1;
                shared.state.send_replace(ConnectionState::Reconnecting);
                tracing::warn!(
                    failures,
                    error = %e,
                    "Broker unreachable, retrying in {:?}",
                    shared.reconnect_interval
                );
                tokio::select! {
                    () = tokio::time::sleep(shared.reconnect_interval) => {}
                    () = shared.shutdown.cancelled() => break,
                }
            }
        }
    }

    shared.state.send_replace(ConnectionState::Disconnected);
    tracing::debug!("Broker supervisor stopped");
}

/// Pumps deliveries of `queue` from `session` into a subscription until the
/// session ends or the subscriber goes away. Any other way out cancels
/// `lost`.
fn arm<S: Session>(
    session: Arc<S>,
    queue: String,
    tx: mpsc::Sender<Delivery>,
    lost: CancellationToken,
) {
    tokio::spawn(async move {
        let mut deliveries = match session.consume(&queue).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                tracing::error!(%queue, error = %e, "Failed to start consumer");
                lost.cancel();
                return;
            }
        };

        while let Some(delivery) = deliveries.next().await {
            match delivery {
                Ok(delivery) => {
                    if tx.send(delivery).await.is_err() {
                        tracing::debug!(%queue, "Subscriber dropped, stopping consumer");
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(%queue, error = %e, "Consumer failed");
                    break;
                }
            }
        }

        tracing::debug!(%queue, "Consumer stopped");
        lost.cancel();
    });
}

/// A shared handle to the deliveries of one queue.
///
/// Clones read from the same underlying stream; each delivery is handed to
/// exactly one reader.
#[derive(Clone)]
pub struct DeliveryStream {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Delivery>>>,
}

impl DeliveryStream {
    fn new(rx: mpsc::Receiver<Delivery>) -> Self {
        Self {
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }

    /// Next delivery, or `None` once the transport shut down.
    pub async fn next(&self) -> Option<Delivery> {
        self.rx.lock().await.recv().await
    }

    pub fn same_stream(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.rx, &other.rx)
    }
}

impl fmt::Debug for DeliveryStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryStream").finish_non_exhaustive()
    }
}

/// A decoded message together with the handle needed to settle it.
#[derive(Debug)]
pub struct Inbound<M> {
    pub message: M,
    pub redelivered: bool,
    pub handle: DeliveryHandle,
}

/// Typed delivery stream. Malformed payloads are rejected at this boundary
/// without requeue, since no retry can make them parse.
pub struct InboundStream<M> {
    raw: DeliveryStream,
    _message: PhantomData<fn() -> M>,
}

impl<M> Clone for InboundStream<M> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _message: PhantomData,
        }
    }
}

impl<M: WireMessage> InboundStream<M> {
    pub fn new(raw: DeliveryStream) -> Self {
        Self {
            raw,
            _message: PhantomData,
        }
    }

    pub fn same_stream(&self, other: &Self) -> bool {
        self.raw.same_stream(&other.raw)
    }

    /// Next well-formed message, or `None` once the transport shut down.
    pub async fn next(&self) -> Option<Inbound<M>> {
        loop {
            let delivery = self.raw.next().await?;
            match M::decode(&delivery.payload) {
                Ok(message) => {
                    return Some(Inbound {
                        message,
                        redelivered: delivery.redelivered,
                        handle: delivery.handle,
                    });
                }
                Err(e) => {
                    telemetry::increment_malformed_payloads();
                    tracing::warn!(error = %e, "Dropping malformed payload");
                    if let Err(e) = delivery.handle.reject(false).await {
                        tracing::warn!(error = %e, "Failed to reject malformed payload");
                    }
                }
            }
        }
    }
}

impl<M> fmt::Debug for InboundStream<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundStream").finish_non_exhaustive()
    }
}
