//! Durable [`MessageBus`] implementation over an AMQP 0.9.1 broker.
//!
//! Topology (all durable):
//!
//! ```text
//! agent.messages        direct exchange, routing key = recipient ID
//! agent.messages.dlx    dead-letter direct exchange
//! agent.<id>            per-agent queue, TTL 300 000 ms,
//!                       dead-letters to agent.messages.dlx / <id>.dlq
//! agent.<id>.dlq        per-agent dead-letter queue
//! ```
//!
//! Envelopes travel as JSON with `content_type application/json`, headers
//! `fromAgentId` / `messageType`, per-message `expiration`, and the envelope
//! and correlation IDs mirrored into the AMQP properties. Consumption uses
//! manual acknowledgment: a payload that fails to deserialize is NACKed
//! without requeue so the broker dead-letters it, and the consumer loop keeps
//! going.
//!
//! One connection and one channel are scoped to the process; producers share
//! the channel (the client serializes frames) and the consumer-tag registry
//! is lock-guarded. Unlike the in-memory bus, repeated subscribes for the
//! same participant are accepted across reconnects and issue fresh consumer
//! tags.

use crate::agentmesh::envelope::Message;
use crate::agentmesh::message_bus::{BusError, MessageBus, SUBSCRIBER_CHANNEL_CAPACITY};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::sync::Mutex;

/// Main direct exchange all agent traffic is published to.
pub const MAIN_EXCHANGE: &str = "agent.messages";

/// Dead-letter exchange expired and rejected envelopes are routed to.
pub const DEAD_LETTER_EXCHANGE: &str = "agent.messages.dlx";

/// Name of the durable queue for a participant.
pub fn agent_queue_name(agent_id: &str) -> String {
    format!("agent.{}", agent_id)
}

/// Name of the participant's dead-letter queue.
pub fn dead_letter_queue_name(agent_id: &str) -> String {
    format!("agent.{}.dlq", agent_id)
}

/// Dead-letter routing key for a participant.
pub fn dead_letter_routing_key(agent_id: &str) -> String {
    format!("{}.dlq", agent_id)
}

/// Decision taken for one broker delivery.
#[derive(Debug, PartialEq)]
pub(crate) enum DeliveryDisposition {
    /// Payload parsed; hand off to the subscriber and ACK.
    Deliver(Box<Message>),
    /// Poison payload; NACK without requeue so it dead-letters.
    DeadLetter(String),
}

/// Classify a raw delivery body. Pulled out of the consumer loop so the
/// ack/nack decision is testable without a broker.
pub(crate) fn classify_delivery(body: &[u8]) -> DeliveryDisposition {
    match serde_json::from_slice::<Message>(body) {
        Ok(msg) => DeliveryDisposition::Deliver(Box::new(msg)),
        Err(e) => DeliveryDisposition::DeadLetter(e.to_string()),
    }
}

fn nanotime() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

/// [`MessageBus`] backed by an AMQP broker.
pub struct AmqpMessageBus {
    connection: Connection,
    channel: Channel,
    /// Active consumer tags keyed by participant ID, so `unsubscribe` can
    /// cancel the right consumer.
    consumer_tags: Mutex<HashMap<String, String>>,
}

impl AmqpMessageBus {
    /// Connect to the broker and declare the two exchanges.
    ///
    /// Connect failures fail fast; nothing is retried here.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;

        let durable = ExchangeDeclareOptions {
            durable: true,
            ..ExchangeDeclareOptions::default()
        };
        channel
            .exchange_declare(
                MAIN_EXCHANGE,
                ExchangeKind::Direct,
                durable,
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Topology(e.to_string()))?;
        channel
            .exchange_declare(
                DEAD_LETTER_EXCHANGE,
                ExchangeKind::Direct,
                durable,
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Topology(e.to_string()))?;

        log::info!("connected to message broker at {}", url);
        Ok(Self {
            connection,
            channel,
            consumer_tags: Mutex::new(HashMap::new()),
        })
    }

    async fn declare_queue_topology(&self, agent_id: &str) -> Result<String, BusError> {
        let queue = agent_queue_name(agent_id);
        let durable = QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        };

        let mut args = FieldTable::default();
        args.insert(
            "x-message-ttl".into(),
            AMQPValue::LongLongInt(crate::agentmesh::message_bus::MESSAGE_TTL_MS as i64),
        );
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(DEAD_LETTER_EXCHANGE.into()),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(dead_letter_routing_key(agent_id).into()),
        );

        // Declarations are idempotent on the broker side.
        self.channel
            .queue_declare(&queue, durable, args)
            .await
            .map_err(|e| BusError::Topology(e.to_string()))?;
        self.channel
            .queue_bind(
                &queue,
                MAIN_EXCHANGE,
                agent_id,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Topology(e.to_string()))?;

        let dlq = dead_letter_queue_name(agent_id);
        self.channel
            .queue_declare(&dlq, durable, FieldTable::default())
            .await
            .map_err(|e| BusError::Topology(e.to_string()))?;
        self.channel
            .queue_bind(
                &dlq,
                DEAD_LETTER_EXCHANGE,
                &dead_letter_routing_key(agent_id),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Topology(e.to_string()))?;

        Ok(queue)
    }
}

#[async_trait]
impl MessageBus for AmqpMessageBus {
    async fn send_message(&self, msg: Message) -> Result<(), BusError> {
        let payload =
            serde_json::to_vec(&msg).map_err(|e| BusError::Serialization(e.to_string()))?;

        let mut headers = FieldTable::default();
        headers.insert(
            "fromAgentId".into(),
            AMQPValue::LongString(msg.from_id.clone().into()),
        );
        headers.insert(
            "messageType".into(),
            AMQPValue::LongString(msg.message_type.as_str().into()),
        );

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_message_id(msg.id.clone().into())
            .with_correlation_id(msg.correlation_id.clone().into())
            .with_expiration(crate::agentmesh::message_bus::MESSAGE_TTL_MS.to_string().into())
            .with_headers(headers);

        let confirm = self
            .channel
            .basic_publish(
                MAIN_EXCHANGE,
                &msg.to_id,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        confirm
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;

        log::debug!(
            "published envelope {} to '{}' ({} bytes, correlation {})",
            msg.id,
            msg.to_id,
            payload.len(),
            msg.correlation_id
        );
        Ok(())
    }

    async fn publish_message(&self, msg: &Message, recipients: &[String]) -> Result<(), BusError> {
        for recipient in recipients {
            self.send_message(msg.rekeyed_for(recipient.clone())).await?;
        }
        Ok(())
    }

    async fn subscribe(&self, participant_id: &str) -> Result<mpsc::Receiver<Message>, BusError> {
        let queue = self.declare_queue_topology(participant_id).await?;

        // Fresh tag per subscribe so reconnecting participants never collide.
        let tag = format!("{}-{}", participant_id, nanotime());
        let mut consumer = self
            .channel
            .basic_consume(
                &queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;

        self.consumer_tags
            .lock()
            .await
            .insert(participant_id.to_string(), tag.clone());

        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let participant = participant_id.to_string();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(d) => d,
                    Err(e) => {
                        log::warn!("consumer '{}' stream error: {}", tag, e);
                        break;
                    }
                };

                match classify_delivery(&delivery.data) {
                    DeliveryDisposition::Deliver(msg) => {
                        if tx.send(*msg).await.is_err() {
                            // Subscriber dropped the stream; requeue the last
                            // delivery and stop consuming.
                            let _ = delivery
                                .nack(BasicNackOptions {
                                    requeue: true,
                                    ..BasicNackOptions::default()
                                })
                                .await;
                            break;
                        }
                        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                            log::warn!("ack failed on '{}': {}", participant, e);
                        }
                    }
                    DeliveryDisposition::DeadLetter(reason) => {
                        log::warn!(
                            "poison payload on '{}', dead-lettering: {}",
                            participant,
                            reason
                        );
                        let _ = delivery
                            .nack(BasicNackOptions {
                                requeue: false,
                                ..BasicNackOptions::default()
                            })
                            .await;
                    }
                }
            }
            log::debug!("consumer loop for '{}' ended", participant);
        });

        Ok(rx)
    }

    async fn unsubscribe(&self, participant_id: &str) -> Result<(), BusError> {
        let tag = self
            .consumer_tags
            .lock()
            .await
            .remove(participant_id)
            .ok_or_else(|| BusError::NotSubscribed(participant_id.to_string()))?;
        self.channel
            .basic_cancel(&tag, BasicCancelOptions::default())
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn prepare_agent_queue(&self, agent_id: &str) -> Result<(), BusError> {
        self.declare_queue_topology(agent_id).await.map(|_| ())
    }

    async fn get_conversation_history(
        &self,
        _correlation_id: &str,
    ) -> Result<Vec<Message>, BusError> {
        // The broker is transport, not storage.
        Ok(Vec::new())
    }

    async fn health_check(&self) -> Result<(), BusError> {
        if self.connection.status().connected() {
            Ok(())
        } else {
            Err(BusError::NotConnected)
        }
    }

    async fn close(&self) -> Result<(), BusError> {
        self.connection
            .close(200, "shutdown")
            .await
            .map_err(|e| BusError::Connect(e.to_string()))
    }
}
