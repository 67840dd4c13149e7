use super::delivery::Delivery;
use super::order::OrderId;
use super::payment::{PaymentOutcome, PaymentRecord};
use crate::error::{PaymentResult, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self { durable: true }
    }
}

/// Broker's view of a queue right after it was declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHandle {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// A long-lived connection to the message broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<ChannelBox>;
    fn is_connected(&self) -> bool;
    async fn close(&self) -> Result<()>;
}

/// A channel multiplexed over a [`BrokerConnection`].
///
/// Payloads are published as persistent `application/json` messages through
/// the default exchange, routed by queue name.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares a queue. Redeclaring with the same options is a no-op;
    /// redeclaring with different options fails.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<QueueHandle>;
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<()>;
    /// Subscribes with manual acknowledgement.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream>;
    fn is_open(&self) -> bool;
    async fn close(&self) -> Result<()>;
}

pub type ConnectionRef = Arc<dyn BrokerConnection>;
pub type ChannelBox = Box<dyn BrokerChannel>;

/// Settles a payment for an order. Implemented outside the pipeline.
#[async_trait]
pub trait PaymentUseCase: Send + Sync {
    async fn execute(&self, payment: &PaymentRecord) -> PaymentResult<PaymentOutcome>;
}

#[async_trait]
pub trait PaymentRepository: Send + Sync {
    /// Stores the payment unless one already exists for the same order.
    /// Returns whether the record was written.
    async fn insert_if_absent(&self, payment: PaymentRecord) -> PaymentResult<bool>;
    async fn get(&self, order_id: OrderId) -> PaymentResult<Option<PaymentRecord>>;
    async fn all_payments(&self) -> PaymentResult<Vec<PaymentRecord>>;
}

pub type PaymentUseCaseRef = Arc<dyn PaymentUseCase>;
pub type PaymentRepositoryBox = Box<dyn PaymentRepository>;
