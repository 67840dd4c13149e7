use crate::domain::ports::{BrokerChannel, ChannelBox, ConnectionRef};
use crate::error::{PipelineError, Result};
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A bounded pool of broker channels sharing one connection.
///
/// At most `max_channels` channels are checked out at once; further
/// checkouts wait. Channels are opened lazily, returned to the pool when the
/// [`PooledChannel`] guard drops, and discarded if they were closed while in
/// use.
pub struct ChannelPool {
    connection: ConnectionRef,
    idle: Mutex<Vec<ChannelBox>>,
    permits: Arc<Semaphore>,
    max_channels: usize,
}

impl ChannelPool {
    pub fn new(connection: ConnectionRef, max_channels: usize) -> Arc<Self> {
        Arc::new(Self {
            connection,
            idle: Mutex::new(Vec::with_capacity(max_channels)),
            permits: Arc::new(Semaphore::new(max_channels)),
            max_channels,
        })
    }

    pub async fn acquire(self: &Arc<Self>) -> Result<PooledChannel> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::Channel("channel pool is closed".to_string()))?;

        let channel = match self.take_idle() {
            Some(channel) => channel,
            None => {
                debug!(max_channels = self.max_channels, "opening pooled channel");
                self.connection.open_channel().await?
            }
        };

        Ok(PooledChannel {
            channel: Some(channel),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    fn take_idle(&self) -> Option<ChannelBox> {
        let mut idle = lock(&self.idle);
        while let Some(channel) = idle.pop() {
            if channel.is_open() {
                return Some(channel);
            }
        }
        None
    }

    fn release(&self, channel: ChannelBox) {
        if self.permits.is_closed() {
            return;
        }
        if channel.is_open() {
            lock(&self.idle).push(channel);
        } else {
            warn!("discarding closed channel returned to pool");
        }
    }

    pub fn idle_count(&self) -> usize {
        lock(&self.idle).len()
    }

    pub fn max_channels(&self) -> usize {
        self.max_channels
    }

    /// Stops handing out channels and closes the idle ones. Channels still
    /// checked out are dropped when their guards are.
    pub async fn close(&self) {
        self.permits.close();
        let idle: Vec<_> = lock(&self.idle).drain(..).collect();
        for channel in idle {
            if let Err(e) = channel.close().await {
                warn!(error = %e, "failed to close pooled channel");
            }
        }
    }
}

/// A channel checked out of a [`ChannelPool`]; goes back on drop.
pub struct PooledChannel {
    channel: Option<ChannelBox>,
    pool: Arc<ChannelPool>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledChannel {
    type Target = dyn BrokerChannel;

    fn deref(&self) -> &Self::Target {
        // Only `Drop` takes the channel out.
        match &self.channel {
            Some(channel) => channel.as_ref(),
            None => unreachable!("pooled channel used after release"),
        }
    }
}

impl Drop for PooledChannel {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            self.pool.release(channel);
        }
    }
}
