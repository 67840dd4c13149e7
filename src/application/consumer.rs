use super::pipeline::{Disposition, MessageReport, OrderPipeline};
use crate::config::ConsumerConfig;
use crate::domain::delivery::Delivery;
use crate::domain::order::OrderEvent;
use crate::domain::ports::{ConnectionRef, DeliveryStream, QueueOptions};
use crate::error::{PipelineError, Result};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Deliveries buffered per partition ahead of its worker.
const PARTITION_BUFFER: usize = 1;

/// Counters for one consumer run, aggregated by the subscription task from
/// the reports its workers hand back.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsumerSummary {
    pub received: u64,
    pub processed: u64,
    pub duplicates: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub unsettled: u64,
    /// Messages whose notification or history publish failed.
    pub degraded: u64,
    pub panicked: u64,
}

impl ConsumerSummary {
    fn record(&mut self, report: &MessageReport) {
        match report.disposition {
            Disposition::Acked if report.duplicate => self.duplicates += 1,
            Disposition::Acked => self.processed += 1,
            Disposition::Requeued => self.requeued += 1,
            Disposition::DeadLettered => self.dead_lettered += 1,
            Disposition::Unsettled => self.unsettled += 1,
        }
        if !report.degraded.is_empty() {
            self.degraded += 1;
        }
    }

    fn record_joined(&mut self, joined: std::result::Result<MessageReport, JoinError>) {
        match joined {
            Ok(report) => self.record(&report),
            Err(e) => {
                error!(error = %e, "message task failed");
                self.panicked += 1;
            }
        }
    }

    pub fn merge(&mut self, other: &ConsumerSummary) {
        self.received += other.received;
        self.processed += other.processed;
        self.duplicates += other.duplicates;
        self.requeued += other.requeued;
        self.dead_lettered += other.dead_lettered;
        self.unsettled += other.unsettled;
        self.degraded += other.degraded;
        self.panicked += other.panicked;
    }
}

/// Subscribes to the order queue and feeds deliveries to the pipeline.
///
/// One task owns the subscription. By default messages run concurrently on
/// a bounded pool of `concurrency` workers: a worker slot is taken before
/// the next delivery is pulled, so the broker and the payment use-case see
/// at most that many messages in flight. With `partition_by_order` each
/// order id is pinned to one of `concurrency` sequential workers instead,
/// which keeps messages for the same order in arrival order.
pub struct OrderConsumer {
    connection: ConnectionRef,
    pipeline: Arc<OrderPipeline>,
    config: ConsumerConfig,
    shutdown: CancellationToken,
}

impl OrderConsumer {
    pub fn new(
        connection: ConnectionRef,
        pipeline: Arc<OrderPipeline>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            connection,
            pipeline,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops pulling new deliveries. Messages already being processed run to
    /// completion before `start` returns.
    pub fn stop(&self) {
        info!("stopping order consumer");
        self.shutdown.cancel();
    }

    /// Consumes `queue` until stopped or until the broker ends the
    /// subscription. Broker-layer failures are returned; message failures
    /// are not.
    pub async fn start(&self, queue: &str) -> Result<ConsumerSummary> {
        let channel = self.connection.open_channel().await?;
        channel.declare_queue(queue, QueueOptions::default()).await?;
        let deliveries = channel
            .consume(queue, &self.config.consumer_tag, self.config.prefetch)
            .await?;
        info!(
            queue,
            concurrency = self.config.concurrency,
            partitioned = self.config.partition_by_order,
            "waiting for orders"
        );

        let outcome = if self.config.partition_by_order {
            self.run_partitioned(deliveries).await
        } else {
            self.run_pooled(deliveries).await
        };

        // Anything still unacknowledged goes back to the queue.
        if let Err(e) = channel.close().await {
            warn!(error = %e, "failed to close consumer channel");
        }
        if let Ok(summary) = &outcome {
            info!(?summary, "order consumer stopped");
        }
        outcome
    }

    async fn run_pooled(&self, mut deliveries: DeliveryStream) -> Result<ConsumerSummary> {
        let workers = Arc::new(Semaphore::new(self.config.concurrency));
        let mut tasks: JoinSet<MessageReport> = JoinSet::new();
        let mut summary = ConsumerSummary::default();

        let outcome = loop {
            let permit = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break Ok(()),
                Some(joined) = tasks.join_next() => {
                    summary.record_joined(joined);
                    continue;
                }
                permit = Arc::clone(&workers).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Ok(()),
                },
            };
            let delivery = match self.next_delivery(&mut deliveries).await {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            };
            summary.received += 1;

            let pipeline = Arc::clone(&self.pipeline);
            tasks.spawn(async move {
                let _permit = permit;
                pipeline.handle(delivery).await
            });
        };

        debug!(in_flight = tasks.len(), "draining in-flight messages");
        while let Some(joined) = tasks.join_next().await {
            summary.record_joined(joined);
        }
        outcome.map(|()| summary)
    }

    async fn run_partitioned(&self, mut deliveries: DeliveryStream) -> Result<ConsumerSummary> {
        let partitions = self.config.concurrency;
        let mut senders = Vec::with_capacity(partitions);
        let mut workers: JoinSet<ConsumerSummary> = JoinSet::new();
        for partition in 0..partitions {
            let (sender, mut receiver) = mpsc::channel::<Delivery>(PARTITION_BUFFER);
            let pipeline = Arc::clone(&self.pipeline);
            workers.spawn(async move {
                let mut summary = ConsumerSummary::default();
                while let Some(delivery) = receiver.recv().await {
                    summary.record(&pipeline.handle(delivery).await);
                }
                debug!(partition, "partition worker stopped");
                summary
            });
            senders.push(sender);
        }

        let mut received = 0;
        let outcome = loop {
            let delivery = match self.next_delivery(&mut deliveries).await {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            };
            received += 1;

            let partition = partition_for(delivery.body(), partitions);
            let sent = tokio::select! {
                biased;
                // The unsettled delivery is requeued when the channel closes.
                _ = self.shutdown.cancelled() => break Ok(()),
                sent = senders[partition].send(delivery) => sent,
            };
            if sent.is_err() {
                break Err(PipelineError::Channel(format!(
                    "partition {partition} worker is gone"
                )));
            }
        };

        drop(senders);
        let mut summary = ConsumerSummary {
            received,
            ..Default::default()
        };
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(partition_summary) => summary.merge(&partition_summary),
                Err(e) => {
                    error!(error = %e, "partition worker failed");
                    summary.panicked += 1;
                }
            }
        }
        outcome.map(|()| summary)
    }

    /// `None` when stopped or when the broker ended the subscription.
    async fn next_delivery(&self, deliveries: &mut DeliveryStream) -> Option<Result<Delivery>> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            next = deliveries.next() => {
                if next.is_none() {
                    info!("delivery stream ended");
                }
                next
            }
        }
    }
}

/// Partition for a raw message body. Bodies without a valid order id all go
/// to partition 0, where they are dead-lettered.
pub fn partition_for(body: &[u8], partitions: usize) -> usize {
    if partitions <= 1 {
        return 0;
    }
    OrderEvent::decode(body)
        .and_then(|order| order.validate())
        .map_or(0, |order| (order.id % partitions as u64) as usize)
}
