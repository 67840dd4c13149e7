use crate::config::BrokerConfig;
use crate::domain::delivery::{Acknowledger, Delivery};
use crate::domain::order::OrderId;
use crate::domain::payment::PaymentRecord;
use crate::domain::ports::{
    BrokerChannel, BrokerConnection, ChannelBox, DeliveryStream, PaymentRepository, QueueHandle,
    QueueOptions,
};
use crate::error::{PaymentResult, PipelineError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An in-process message broker with AMQP-like semantics: durable-flag
/// checked declarations, manual acknowledgement, requeue on reject, and
/// requeue of unacknowledged deliveries when their channel closes.
///
/// Cloning shares the same broker. Used for local runs and tests.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    queues: Mutex<HashMap<String, Arc<Queue>>>,
    credentials: Option<(String, String)>,
    unreachable: AtomicBool,
    failing_publishes: Mutex<HashSet<String>>,
    connections_opened: AtomicUsize,
    channels_opened: AtomicUsize,
    next_tag: AtomicU64,
}

struct Queue {
    options: QueueOptions,
    ready: Mutex<VecDeque<StoredMessage>>,
    notify: Notify,
    consumers: AtomicU32,
    unacked: AtomicUsize,
}

#[derive(Clone)]
struct StoredMessage {
    body: Vec<u8>,
    delivery_count: u32,
}

impl Queue {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            ready: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            consumers: AtomicU32::new(0),
            unacked: AtomicUsize::new(0),
        }
    }

    fn push_back(&self, message: StoredMessage) {
        lock(&self.ready).push_back(message);
        self.notify.notify_one();
    }

    fn push_front(&self, message: StoredMessage) {
        lock(&self.ready).push_front(message);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<StoredMessage> {
        lock(&self.ready).pop_front()
    }

    fn handle(&self, name: &str) -> QueueHandle {
        QueueHandle {
            name: name.to_string(),
            message_count: lock(&self.ready).len() as u32,
            consumer_count: self.consumers.load(Ordering::SeqCst),
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker that only accepts connections with these credentials.
    pub fn with_credentials(user: &str, password: &str) -> Self {
        Self {
            state: Arc::new(BrokerState {
                credentials: Some((user.to_string(), password.to_string())),
                ..Default::default()
            }),
        }
    }

    pub async fn connect(&self, config: &BrokerConfig) -> Result<InMemoryConnection> {
        if self.state.unreachable.load(Ordering::SeqCst) {
            return Err(PipelineError::Connection(format!(
                "broker at {} is unreachable",
                config.redacted_url()
            )));
        }
        if let Some((user, password)) = &self.state.credentials
            && config.credentials() != Some((user.as_str(), password.as_str()))
        {
            return Err(PipelineError::Connection(
                "authentication failed: ACCESS_REFUSED".to_string(),
            ));
        }
        self.state.connections_opened.fetch_add(1, Ordering::SeqCst);
        Ok(InMemoryConnection {
            state: Arc::clone(&self.state),
            open: Arc::new(AtomicBool::new(true)),
            channels: Mutex::new(Vec::new()),
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Makes every publish to `queue` fail until switched back.
    pub fn fail_publishes_to(&self, queue: &str, failing: bool) {
        let mut failing_publishes = lock(&self.state.failing_publishes);
        if failing {
            failing_publishes.insert(queue.to_string());
        } else {
            failing_publishes.remove(queue);
        }
    }

    /// Enqueues a message as an external producer would, declaring the queue
    /// as durable if it does not exist yet.
    pub fn publish(&self, queue: &str, body: impl Into<Vec<u8>>) {
        self.state
            .queue_or_declare(queue, QueueOptions::default())
            .push_back(StoredMessage {
                body: body.into(),
                delivery_count: 0,
            });
    }

    /// Bodies of the messages waiting on `queue`, oldest first.
    pub fn messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state
            .queue(queue)
            .map(|q| lock(&q.ready).iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state
            .queue(queue)
            .map_or(0, |q| q.unacked.load(Ordering::SeqCst))
    }

    pub fn queue_options(&self, queue: &str) -> Option<QueueOptions> {
        self.state.queue(queue).map(|q| q.options)
    }

    pub fn connections_opened(&self) -> usize {
        self.state.connections_opened.load(Ordering::SeqCst)
    }

    pub fn channels_opened(&self) -> usize {
        self.state.channels_opened.load(Ordering::SeqCst)
    }
}

impl BrokerState {
    fn queue(&self, name: &str) -> Option<Arc<Queue>> {
        lock(&self.queues).get(name).cloned()
    }

    fn queue_or_declare(&self, name: &str, options: QueueOptions) -> Arc<Queue> {
        Arc::clone(
            lock(&self.queues)
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Queue::new(options))),
        )
    }
}

pub struct InMemoryConnection {
    state: Arc<BrokerState>,
    open: Arc<AtomicBool>,
    channels: Mutex<Vec<Weak<ChannelInner>>>,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn open_channel(&self) -> Result<ChannelBox> {
        if !self.is_connected() {
            return Err(PipelineError::Channel("connection is closed".to_string()));
        }
        self.state.channels_opened.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::new(ChannelInner {
            connection_open: Arc::clone(&self.open),
            closed: CancellationToken::new(),
            unacked: Mutex::new(HashMap::new()),
        });
        let mut channels = lock(&self.channels);
        channels.retain(|channel| channel.strong_count() > 0);
        channels.push(Arc::downgrade(&inner));
        Ok(Box::new(InMemoryChannel {
            state: Arc::clone(&self.state),
            inner,
        }))
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        let channels: Vec<_> = lock(&self.channels).drain(..).collect();
        for channel in channels.iter().filter_map(Weak::upgrade) {
            channel.shutdown();
        }
        Ok(())
    }
}

pub struct InMemoryChannel {
    state: Arc<BrokerState>,
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    connection_open: Arc<AtomicBool>,
    closed: CancellationToken,
    unacked: Mutex<HashMap<u64, (Arc<Queue>, StoredMessage)>>,
}

impl ChannelInner {
    fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && self.connection_open.load(Ordering::SeqCst)
    }

    /// Closes the channel and hands every unacknowledged delivery back to
    /// its queue.
    fn shutdown(&self) {
        self.closed.cancel();
        let pending: Vec<_> = lock(&self.unacked).drain().collect();
        for (_, (queue, message)) in pending {
            queue.unacked.fetch_sub(1, Ordering::SeqCst);
            queue.push_front(message);
        }
    }

    fn take_unacked(&self, delivery_tag: u64) -> Result<(Arc<Queue>, StoredMessage)> {
        if !self.is_open() {
            return Err(PipelineError::Acknowledgement(
                "channel is closed".to_string(),
            ));
        }
        let (queue, message) = lock(&self.unacked).remove(&delivery_tag).ok_or_else(|| {
            PipelineError::Acknowledgement(format!("unknown delivery tag {delivery_tag}"))
        })?;
        queue.unacked.fetch_sub(1, Ordering::SeqCst);
        Ok((queue, message))
    }
}

#[async_trait]
impl Acknowledger for ChannelInner {
    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.take_unacked(delivery_tag).map(|_| ())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let (queue, message) = self.take_unacked(delivery_tag)?;
        if requeue {
            queue.push_front(message);
        }
        Ok(())
    }
}

impl InMemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.inner.is_open() {
            Ok(())
        } else {
            Err(PipelineError::Channel("channel is closed".to_string()))
        }
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<QueueHandle> {
        self.ensure_open()?;
        let queue = self.state.queue_or_declare(name, options);
        if queue.options != options {
            return Err(PipelineError::declaration(
                name,
                format!(
                    "PRECONDITION_FAILED - inequivalent arg 'durable': existing {}, requested {}",
                    queue.options.durable, options.durable
                ),
            ));
        }
        Ok(queue.handle(name))
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<()> {
        if !self.inner.is_open() {
            return Err(PipelineError::publish(queue, "channel is closed"));
        }
        if lock(&self.state.failing_publishes).contains(queue) {
            return Err(PipelineError::publish(queue, "publish nacked by broker"));
        }
        let target = self
            .state
            .queue(queue)
            .ok_or_else(|| PipelineError::publish(queue, "no such queue"))?;
        target.push_back(StoredMessage {
            body: payload.to_vec(),
            delivery_count: 0,
        });
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        _prefetch: u16,
    ) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let target = self.state.queue(queue).ok_or_else(|| {
            PipelineError::Channel(format!("NOT_FOUND - no queue '{queue}'"))
        })?;
        target.consumers.fetch_add(1, Ordering::SeqCst);
        debug!(queue, consumer_tag, "in-memory consumer registered");

        let subscription = Subscription {
            queue: target,
            channel: Arc::clone(&self.inner),
            state: Arc::clone(&self.state),
        };
        let stream = futures::stream::unfold(subscription, |subscription| async move {
            let delivery = subscription.next_delivery().await?;
            Some((Ok::<_, PipelineError>(delivery), subscription))
        });
        Ok(stream.boxed())
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    async fn close(&self) -> Result<()> {
        self.inner.shutdown();
        Ok(())
    }
}

impl Drop for InMemoryChannel {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

struct Subscription {
    queue: Arc<Queue>,
    channel: Arc<ChannelInner>,
    state: Arc<BrokerState>,
}

impl Subscription {
    async fn next_delivery(&self) -> Option<Delivery> {
        loop {
            if !self.channel.is_open() {
                return None;
            }
            let notified = self.queue.notify.notified();
            if let Some(mut message) = self.queue.pop() {
                message.delivery_count += 1;
                let tag = self.state.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
                self.queue.unacked.fetch_add(1, Ordering::SeqCst);
                lock(&self.channel.unacked)
                    .insert(tag, (Arc::clone(&self.queue), message.clone()));
                let acker: Arc<dyn Acknowledger> = self.channel.clone();
                return Some(Delivery::new(
                    message.body,
                    tag,
                    message.delivery_count,
                    acker,
                ));
            }
            tokio::select! {
                _ = notified => {}
                _ = self.channel.closed.cancelled() => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.consumers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A thread-safe in-memory store for payment records.
///
/// Uses `Arc<RwLock<HashMap<OrderId, PaymentRecord>>>` to allow shared
/// concurrent access. Suitable for local runs and tests.
#[derive(Default, Clone)]
pub struct InMemoryPaymentRepository {
    payments: Arc<RwLock<HashMap<OrderId, PaymentRecord>>>,
}

impl InMemoryPaymentRepository {
    /// Creates a new, empty in-memory payment repository.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentRepository for InMemoryPaymentRepository {
    async fn insert_if_absent(&self, payment: PaymentRecord) -> PaymentResult<bool> {
        let mut payments = self.payments.write().await;
        if payments.contains_key(&payment.order_id) {
            return Ok(false);
        }
        payments.insert(payment.order_id, payment);
        Ok(true)
    }

    async fn get(&self, order_id: OrderId) -> PaymentResult<Option<PaymentRecord>> {
        let payments = self.payments.read().await;
        Ok(payments.get(&order_id).cloned())
    }

    async fn all_payments(&self) -> PaymentResult<Vec<PaymentRecord>> {
        let payments = self.payments.read().await;
        let mut all: Vec<_> = payments.values().cloned().collect();
        all.sort_by_key(|payment| payment.order_id);
        Ok(all)
    }
}
