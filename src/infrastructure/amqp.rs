//! AMQP 0-9-1 backend built on `lapin`.

use crate::config::BrokerConfig;
use crate::domain::delivery::{Acknowledger, Delivery};
use crate::domain::ports::{
    BrokerChannel, BrokerConnection, ChannelBox, DeliveryStream, QueueHandle, QueueOptions,
};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Arc;

const REPLY_SUCCESS: u16 = 200;
const PERSISTENT: u8 = 2;
/// Header maintained by quorum queues with the number of earlier deliveries.
const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";
const QUEUE_TYPE_ARGUMENT: &str = "x-queue-type";

pub struct AmqpConnection {
    connection: Connection,
}

impl AmqpConnection {
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(|e| {
                PipelineError::Connection(format!("{}: {e}", config.redacted_url()))
            })?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<ChannelBox> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| PipelineError::Channel(e.to_string()))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| PipelineError::Channel(e.to_string()))?;
        Ok(Box::new(AmqpChannel { channel }))
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(|e| PipelineError::Connection(e.to_string()))
    }
}

pub struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<QueueHandle> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    ..Default::default()
                },
                declare_arguments(options),
            )
            .await
            .map_err(|e| PipelineError::declaration(name, e))?;
        Ok(QueueHandle {
            name: queue.name().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT);
        let confirmation = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| PipelineError::publish(queue, e))?
            .await
            .map_err(|e| PipelineError::publish(queue, e))?;
        confirmed(queue, &confirmation)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| PipelineError::Channel(e.to_string()))?;
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| PipelineError::Channel(e.to_string()))?;

        let stream = consumer.map(|delivery| -> Result<Delivery> {
            let delivery = delivery.map_err(|e| PipelineError::Channel(e.to_string()))?;
            let delivery_count =
                delivery_count(delivery.properties.headers().as_ref(), delivery.redelivered);
            let acker: Arc<dyn Acknowledger> = Arc::new(AmqpAcker(delivery.acker));
            Ok(Delivery::new(
                delivery.data,
                delivery.delivery_tag,
                delivery_count,
                acker,
            ))
        });
        Ok(stream.boxed())
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(|e| PipelineError::Channel(e.to_string()))
    }
}

/// Durable queues are declared as quorum queues so that the broker counts
/// redeliveries; a classic queue of the same name fails the declaration.
fn declare_arguments(options: QueueOptions) -> FieldTable {
    let mut arguments = FieldTable::default();
    if options.durable {
        arguments.insert(
            QUEUE_TYPE_ARGUMENT.into(),
            AMQPValue::LongString("quorum".into()),
        );
    }
    arguments
}

fn confirmed(queue: &str, confirmation: &Confirmation) -> Result<()> {
    if confirmation.is_nack() {
        return Err(PipelineError::publish(queue, "publish nacked by broker"));
    }
    Ok(())
}

/// Quorum queues report earlier deliveries in a header. Without it only the
/// redelivered flag is known, which counts as a second delivery.
fn delivery_count(headers: Option<&FieldTable>, redelivered: bool) -> u32 {
    let previous = headers
        .and_then(|headers| {
            headers
                .inner()
                .iter()
                .find(|(name, _)| name.as_str() == DELIVERY_COUNT_HEADER)
        })
        .and_then(|(_, value)| match value {
            AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
            AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
            AMQPValue::LongUInt(n) => Some(*n),
            AMQPValue::ShortInt(n) => u32::try_from(*n).ok(),
            AMQPValue::ShortUInt(n) => Some(u32::from(*n)),
            _ => None,
        });
    match previous {
        Some(previous) => previous.saturating_add(1),
        None if redelivered => 2,
        None => 1,
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self, _delivery_tag: u64) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| PipelineError::Acknowledgement(e.to_string()))
    }

    async fn reject(&self, _delivery_tag: u64, requeue: bool) -> Result<()> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| PipelineError::Acknowledgement(e.to_string()))
    }
}
