use super::pool::ChannelPool;
use crate::error::{PipelineError, Result};
use std::sync::Arc;
use tracing::trace;

/// Publishes payloads to a single durable queue.
///
/// Each call checks a channel out of the shared pool for the duration of the
/// publish only; publishers for different destinations share the pool.
#[derive(Clone)]
pub struct QueuePublisher {
    pool: Arc<ChannelPool>,
    queue: String,
}

impl QueuePublisher {
    pub fn new(pool: Arc<ChannelPool>, queue: impl Into<String>) -> Self {
        Self {
            pool,
            queue: queue.into(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub async fn publish(&self, payload: &[u8]) -> Result<()> {
        let channel = self
            .pool
            .acquire()
            .await
            .map_err(|e| PipelineError::publish(&self.queue, e))?;
        channel.publish(&self.queue, payload).await?;
        trace!(queue = %self.queue, bytes = payload.len(), "published");
        Ok(())
    }
}
