//! RabbitMQ realization of the broker traits, backed by `lapin`.
//!
//! Each session owns one connection and one channel in publisher-confirm
//! mode. Messages are published persistent (delivery mode 2), and consumers
//! use manual acknowledgements with a per-channel prefetch limit.
//!
//! The session reports itself closed when the connection errors or when an
//! operation fails on a channel the broker has closed.

use super::{Acknowledger, Connector, Delivery, DeliveryHandle, Route, Session, Topology};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
};
use tokio_util::sync::CancellationToken;

/// Persistent delivery mode.
const PERSISTENT: u8 = 2;

#[derive(Clone, Debug)]
pub struct AmqpConnector {
    uri: String,
    prefetch: u16,
}

impl AmqpConnector {
    pub fn new(uri: impl Into<String>, prefetch: u16) -> Self {
        Self {
            uri: uri.into(),
            prefetch,
        }
    }
}

fn channel_error(what: &str, e: lapin::Error) -> Error {
    Error::ChannelError {
        context: format!("{what}: {e}"),
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    type Session = AmqpSession;

    async fn connect(&self, topology: &Topology) -> Result<AmqpSession> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|e| channel_error("connect", e))?;

        let closed = CancellationToken::new();
        let token = closed.clone();
        connection.on_error(move |e| {
            tracing::warn!(error = %e, "AMQP connection error");
            token.cancel();
        });

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| channel_error("open channel", e))?;

        for route in topology.routes() {
            declare(&channel, route).await?;
        }

        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| channel_error("set prefetch", e))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| channel_error("enable publisher confirms", e))?;

        tracing::debug!(prefetch = self.prefetch, "AMQP topology declared");

        Ok(AmqpSession {
            connection,
            channel,
            closed,
        })
    }
}

async fn declare(channel: &Channel, route: &Route) -> Result<()> {
    channel
        .exchange_declare(
            &route.exchange,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| channel_error("declare exchange", e))?;
    channel
        .queue_declare(
            &route.queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| channel_error("declare queue", e))?;
    channel
        .queue_bind(
            &route.queue,
            &route.exchange,
            route.routing_key(),
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| channel_error("bind queue", e))
}

pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
    closed: CancellationToken,
}

impl AmqpSession {
    /// Marks the session lost if the channel behind a failed operation is
    /// gone; the error itself is passed through.
    fn check_channel(&self, e: Error) -> Error {
        if !self.channel.status().connected() {
            tracing::warn!(error = %e, "AMQP channel closed");
            self.closed.cancel();
        }
        e
    }
}

#[async_trait]
impl Session for AmqpSession {
    async fn publish(&self, route: &Route, payload: &[u8]) -> Result<()> {
        let publish_error = |e: lapin::Error| {
            self.check_channel(Error::Publish {
                context: e.to_string(),
            })
        };
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type("application/json".into());

        let confirmation = self
            .channel
            .basic_publish(
                &route.exchange,
                route.routing_key(),
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(publish_error)?
            .await
            .map_err(publish_error)?;

        match confirmation {
            Confirmation::Nack(_) => Err(Error::Publish {
                context: format!("broker refused message for `{}`", route.queue),
            }),
            _ => Ok(()),
        }
    }

    async fn consume(&self, queue: &str) -> Result<BoxStream<'static, Result<Delivery>>> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.check_channel(channel_error("start consumer", e)))?;

        let stream = consumer.map(|delivery| {
            delivery
                .map(|d| Delivery {
                    payload: d.data,
                    redelivered: d.redelivered,
                    handle: DeliveryHandle::new(AmqpAcker(d.acker)),
                })
                .map_err(|e| channel_error("consume", e))
        });
        Ok(stream.boxed())
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }

    async fn close(&self) {
        self.closed.cancel();
        if self.connection.status().connected() {
            if let Err(e) = self.connection.close(200, "shutdown").await {
                tracing::debug!(error = %e, "AMQP connection close failed");
            }
        }
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| channel_error("ack", e))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| channel_error("reject", e))
    }
}
