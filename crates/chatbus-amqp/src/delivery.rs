//! Settlement of AMQP deliveries.
//!
//! RabbitMQ does not count redeliveries of classic queues, so requeue
//! republishes the message to its own queue (default exchange) with an
//! incremented `x-redelivery-count` header and acks the original.

use async_trait::async_trait;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicPublishOptions, BasicRejectOptions},
    types::{AMQPValue, ShortString},
    BasicProperties, Channel,
};
use tracing::debug;

use chatbus_core::{
    bus::port::{DeadLetterRoute, DeliveryAcker, InboundDelivery},
    errors::Error,
    Result,
};

use crate::map_err;

pub const REDELIVERY_COUNT_HEADER: &str = "x-redelivery-count";
pub const DEAD_LETTER_REASON_HEADER: &str = "x-dead-letter-reason";

pub(crate) async fn publish_confirmed(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    payload: &[u8],
    properties: BasicProperties,
) -> Result<()> {
    let confirm = channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions::default(),
            payload,
            properties,
        )
        .await
        .map_err(map_err)?;
    let confirmation = confirm.await.map_err(map_err)?;
    if confirmation.is_nack() {
        return Err(Error::Broker(format!(
            "broker nacked publish to `{exchange}` with key `{routing_key}`"
        )));
    }
    Ok(())
}

/// Delivery count carried in the headers; 1 when absent.
pub fn delivery_count(properties: &BasicProperties) -> u32 {
    properties
        .headers()
        .as_ref()
        .and_then(|h| h.inner().get(&ShortString::from(REDELIVERY_COUNT_HEADER)))
        .and_then(header_u32)
        .unwrap_or(1)
        .max(1)
}

fn header_u32(value: &AMQPValue) -> Option<u32> {
    match value {
        AMQPValue::ShortShortUInt(n) => Some(u32::from(*n)),
        AMQPValue::ShortUInt(n) => Some(u32::from(*n)),
        AMQPValue::LongUInt(n) => Some(*n),
        AMQPValue::ShortShortInt(n) => u32::try_from(*n).ok(),
        AMQPValue::ShortInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
        _ => None,
    }
}

pub fn with_header(properties: BasicProperties, key: &str, value: AMQPValue) -> BasicProperties {
    let mut headers = properties.headers().clone().unwrap_or_default();
    headers.insert(key.into(), value);
    properties.with_headers(headers)
}

pub(crate) fn inbound_delivery(
    delivery: Delivery,
    channel: Channel,
    queue: String,
    route: Option<DeadLetterRoute>,
) -> InboundDelivery {
    let count = delivery_count(&delivery.properties);
    InboundDelivery {
        routing_key: delivery.routing_key.as_str().to_string(),
        payload: delivery.data.clone(),
        delivery_count: count,
        acker: Box::new(AmqpAcker {
            channel,
            queue,
            route,
            count,
            delivery,
        }),
    }
}

struct AmqpAcker {
    channel: Channel,
    queue: String,
    route: Option<DeadLetterRoute>,
    count: u32,
    delivery: Delivery,
}

impl AmqpAcker {
    async fn ack_original(&self) -> Result<()> {
        self.delivery
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(map_err)
    }
}

#[async_trait]
impl DeliveryAcker for AmqpAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.ack_original().await
    }

    async fn requeue(self: Box<Self>) -> Result<()> {
        let next = self.count.saturating_add(1);
        let properties = with_header(
            self.delivery.properties.clone(),
            REDELIVERY_COUNT_HEADER,
            AMQPValue::LongUInt(next),
        );
        publish_confirmed(&self.channel, "", &self.queue, &self.delivery.data, properties).await?;
        debug!(queue = %self.queue, delivery_count = next, "requeued");
        self.ack_original().await
    }

    async fn reject(self: Box<Self>) -> Result<()> {
        self.delivery
            .acker
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map_err(map_err)
    }

    async fn dead_letter(self: Box<Self>, reason: &str) -> Result<()> {
        let Some(route) = self.route.clone() else {
            // Broker-side dead-lettering still applies, only the reason is lost.
            return self.reject().await;
        };
        let properties = with_header(
            with_header(
                self.delivery.properties.clone(),
                REDELIVERY_COUNT_HEADER,
                AMQPValue::LongUInt(self.count),
            ),
            DEAD_LETTER_REASON_HEADER,
            AMQPValue::LongString(reason.into()),
        );
        publish_confirmed(
            &self.channel,
            &route.exchange,
            &route.routing_key,
            &self.delivery.data,
            properties,
        )
        .await?;
        self.ack_original().await
    }
}
