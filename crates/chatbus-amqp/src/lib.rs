//! RabbitMQ adapter (lapin).
//!
//! This crate implements the `chatbus-core` broker ports over AMQP 0-9-1.
//! Publisher confirms are enabled on every channel; requeue and dead-letter
//! republish the message so the delivery count survives in a header.

pub mod delivery;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicCancelOptions, BasicConsumeOptions, BasicQosOptions,
        ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use chatbus_core::{
    bus::port::{
        BrokerChannel, BrokerConnection, BrokerConnector, DeadLetterRoute, DeliveryStream,
        ExchangeKind, OutboundMessage, QueueSpec,
    },
    config::BrokerConfig,
    errors::Error,
    Result,
};

use delivery::{inbound_delivery, publish_confirmed};

pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
pub const DEAD_LETTER_ROUTING_KEY_ARG: &str = "x-dead-letter-routing-key";

const REPLY_SUCCESS: u16 = 200;

pub(crate) fn map_err(e: lapin::Error) -> Error {
    Error::Broker(format!("amqp error: {e}"))
}

type RouteTable = Arc<Mutex<HashMap<String, DeadLetterRoute>>>;

/// Opens RabbitMQ connections for the connection manager.
#[derive(Clone)]
pub struct AmqpConnector {
    uri: String,
    // Dead-letter routes of declared queues, needed to dead-letter with a
    // reason.
    routes: RouteTable,
}

impl AmqpConnector {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            routes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_config(broker: &BrokerConfig) -> Self {
        Self::new(broker.amqp_uri())
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(map_err)?;

        let (lost_tx, lost_rx) = watch::channel(false);
        connection.on_error(move |e| {
            warn!(error = %e, "amqp connection error");
            lost_tx.send_replace(true);
        });
        info!("amqp connection established");

        Ok(Arc::new(AmqpConnection {
            connection,
            lost: lost_rx,
            routes: self.routes.clone(),
        }))
    }
}

struct AmqpConnection {
    connection: Connection,
    lost: watch::Receiver<bool>,
    routes: RouteTable,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        let channel = self.connection.create_channel().await.map_err(map_err)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(map_err)?;
        Ok(Box::new(AmqpChannel {
            channel,
            routes: self.routes.clone(),
        }))
    }

    fn is_open(&self) -> bool {
        !*self.lost.borrow() && self.connection.status().connected()
    }

    async fn closed(&self) {
        let mut lost = self.lost.clone();
        let _ = lost.wait_for(|l| *l).await;
    }

    async fn close(&self) -> Result<()> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(map_err)
    }
}

struct AmqpChannel {
    channel: Channel,
    routes: RouteTable,
}

/// `x-dead-letter-*` arguments for a queue declaration.
pub fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(route) = &spec.dead_letter {
        args.insert(
            DEAD_LETTER_EXCHANGE_ARG.into(),
            AMQPValue::LongString(route.exchange.as_str().into()),
        );
        args.insert(
            DEAD_LETTER_ROUTING_KEY_ARG.into(),
            AMQPValue::LongString(route.routing_key.as_str().into()),
        );
    }
    args
}

/// AMQP properties mirroring the envelope metadata.
pub fn outbound_properties(message: &OutboundMessage) -> BasicProperties {
    let mut props = BasicProperties::default()
        .with_content_type(message.content_type.into())
        .with_delivery_mode(if message.persistent { 2 } else { 1 });
    if let Some(id) = &message.message_id {
        props = props.with_message_id(id.as_str().into());
    }
    if let Some(id) = &message.correlation_id {
        props = props.with_correlation_id(id.as_str().into());
    }
    if let Some(app) = &message.app_id {
        props = props.with_app_id(app.as_str().into());
    }
    props
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        let kind = match kind {
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        };
        self.channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_err)
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        self.channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    ..QueueDeclareOptions::default()
                },
                queue_arguments(spec),
            )
            .await
            .map_err(map_err)?;
        if let Some(route) = &spec.dead_letter {
            self.routes
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(spec.name.clone(), route.clone());
        }
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_err)
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(map_err)
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<()> {
        publish_confirmed(
            &self.channel,
            &message.exchange,
            &message.routing_key,
            &message.payload,
            outbound_properties(message),
        )
        .await
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_err)?;
        debug!(queue, consumer_tag, "amqp consumer started");

        let channel = self.channel.clone();
        let queue = queue.to_string();
        let route = self
            .routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&queue)
            .cloned();
        Ok(consumer
            .map(move |item| {
                item.map(|d| inbound_delivery(d, channel.clone(), queue.clone(), route.clone()))
                    .map_err(map_err)
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(map_err)
    }

    async fn close(&self) -> Result<()> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(map_err)
    }
}
