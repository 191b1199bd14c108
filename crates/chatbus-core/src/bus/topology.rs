use tracing::debug;

use crate::{
    bus::port::{BrokerChannel, DeadLetterRoute, ExchangeKind, QueueSpec},
    Result,
};

pub const DEAD_LETTER_SUFFIX: &str = ".dlq";

/// `<queue>.dlq`: the per-queue dead-letter queue, also its routing key on the
/// dead-letter exchange.
pub fn dead_letter_queue_name(queue: &str) -> String {
    format!("{queue}{DEAD_LETTER_SUFFIX}")
}

/// A consumer group's queue and the routing keys bound to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueTopology {
    pub queue: String,
    pub routing_keys: Vec<String>,
}

impl QueueTopology {
    pub fn new<I, S>(queue: impl Into<String>, routing_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queue: queue.into(),
            routing_keys: routing_keys.into_iter().map(Into::into).collect(),
        }
    }

    pub fn dead_letter_queue(&self) -> String {
        dead_letter_queue_name(&self.queue)
    }

    pub fn primary_spec(&self, dead_letter_exchange: &str) -> QueueSpec {
        QueueSpec {
            name: self.queue.clone(),
            durable: true,
            dead_letter: Some(DeadLetterRoute {
                exchange: dead_letter_exchange.to_string(),
                routing_key: self.dead_letter_queue(),
            }),
        }
    }

    pub fn dead_letter_spec(&self) -> QueueSpec {
        QueueSpec {
            name: self.dead_letter_queue(),
            durable: true,
            dead_letter: None,
        }
    }
}

/// Topic-exchange matching: words are dot-separated, `*` matches exactly one
/// word, `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let p: Vec<&str> = pattern.split('.').collect();
    let k: Vec<&str> = routing_key.split('.').collect();
    match_words(&p, &k)
}

fn match_words(p: &[&str], k: &[&str]) -> bool {
    match p.split_first() {
        None => k.is_empty(),
        Some((&"#", rest)) => (0..=k.len()).any(|i| match_words(rest, &k[i..])),
        Some((&"*", rest)) => !k.is_empty() && match_words(rest, &k[1..]),
        Some((word, rest)) => k.first() == Some(word) && match_words(rest, &k[1..]),
    }
}

/// Declare the topic exchange and the dead-letter exchange (idempotent).
pub async fn declare_exchanges(
    channel: &dyn BrokerChannel,
    exchange: &str,
    dead_letter_exchange: &str,
) -> Result<()> {
    channel.declare_exchange(exchange, ExchangeKind::Topic).await?;
    channel
        .declare_exchange(dead_letter_exchange, ExchangeKind::Direct)
        .await?;
    Ok(())
}

/// Declare a queue, its dead-letter queue, and all bindings (idempotent).
pub async fn declare_queue(
    channel: &dyn BrokerChannel,
    exchange: &str,
    dead_letter_exchange: &str,
    topology: &QueueTopology,
) -> Result<()> {
    let dlq = topology.dead_letter_spec();
    channel.declare_queue(&dlq).await?;
    channel
        .bind_queue(&dlq.name, dead_letter_exchange, &dlq.name)
        .await?;

    channel
        .declare_queue(&topology.primary_spec(dead_letter_exchange))
        .await?;
    for key in &topology.routing_keys {
        channel.bind_queue(&topology.queue, exchange, key).await?;
    }

    debug!(
        queue = %topology.queue,
        routing_keys = ?topology.routing_keys,
        "queue declared"
    );
    Ok(())
}
