use crate::error::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Settles deliveries on the channel that received them.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<()>;
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()>;
}

/// A message handed to this consumer by the broker.
///
/// Settling methods take `self`, so a delivery can be acknowledged or
/// rejected at most once. A delivery dropped without being settled stays
/// unacknowledged and is requeued when its channel closes.
pub struct Delivery {
    body: Vec<u8>,
    delivery_tag: u64,
    delivery_count: u32,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        body: Vec<u8>,
        delivery_tag: u64,
        delivery_count: u32,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            body,
            delivery_tag,
            delivery_count,
            acker,
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// How many times the broker has delivered this message, starting at 1.
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack(self.delivery_tag).await
    }

    pub async fn reject(self, requeue: bool) -> Result<()> {
        self.acker.reject(self.delivery_tag, requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("delivery_count", &self.delivery_count)
            .field("body_len", &self.body.len())
            .finish()
    }
}
