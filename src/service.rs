//! Wiring of the settlement service and its restart supervisor.

use crate::application::consumer::{ConsumerSummary, OrderConsumer};
use crate::application::pipeline::{Destinations, OrderPipeline};
use crate::config::{BrokerConfig, SettlementConfig};
use crate::domain::ports::{ConnectionRef, PaymentUseCaseRef, QueueOptions};
use crate::error::{PipelineError, Result};
use crate::infrastructure::{self, pool::ChannelPool, publisher::QueuePublisher};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// One broker connection, its channel pool, and the order consumer.
pub struct SettlementService {
    config: SettlementConfig,
    connection: ConnectionRef,
    pool: Arc<ChannelPool>,
    consumer: OrderConsumer,
}

impl SettlementService {
    /// Validates `config`, connects to the broker it names, and declares the
    /// queues.
    pub async fn connect(config: SettlementConfig, payments: PaymentUseCaseRef) -> Result<Self> {
        config.validate()?;
        let connection = infrastructure::connect(&config.broker).await?;
        Self::with_connection(config, connection, payments).await
    }

    pub async fn with_connection(
        config: SettlementConfig,
        connection: ConnectionRef,
        payments: PaymentUseCaseRef,
    ) -> Result<Self> {
        let pool = ChannelPool::new(Arc::clone(&connection), config.pool.max_channels);
        if let Err(e) = declare_queues(&pool, &config).await {
            pool.close().await;
            if let Err(close_error) = connection.close().await {
                warn!(error = %close_error, "failed to close broker connection");
            }
            return Err(e);
        }

        let destinations = Destinations {
            notifications: QueuePublisher::new(Arc::clone(&pool), &config.queues.notifications),
            history: QueuePublisher::new(Arc::clone(&pool), &config.queues.history),
            dead_letters: QueuePublisher::new(Arc::clone(&pool), &config.queues.dead_letters),
        };
        let pipeline = Arc::new(OrderPipeline::new(
            &config.queues.orders,
            payments,
            destinations,
            config.consumer.max_deliveries,
            config.consumer.park_retry,
        ));
        let consumer = OrderConsumer::new(
            Arc::clone(&connection),
            pipeline,
            config.consumer.clone(),
        );

        Ok(Self {
            config,
            connection,
            pool,
            consumer,
        })
    }

    pub fn with_shutdown(self, shutdown: CancellationToken) -> Self {
        Self {
            consumer: self.consumer.with_shutdown(shutdown),
            ..self
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.consumer.shutdown_token()
    }

    pub fn config(&self) -> &SettlementConfig {
        &self.config
    }

    /// Consumes orders until shut down or until the broker drops the
    /// subscription, then releases the connection.
    pub async fn run(self) -> Result<ConsumerSummary> {
        let outcome = self.consumer.start(&self.config.queues.orders).await;
        self.close().await;
        outcome
    }

    pub async fn close(&self) {
        self.pool.close().await;
        if let Err(e) = self.connection.close().await {
            warn!(error = %e, "failed to close broker connection");
        }
    }
}

async fn declare_queues(pool: &Arc<ChannelPool>, config: &SettlementConfig) -> Result<()> {
    let channel = pool.acquire().await?;
    for queue in config.queues.all() {
        let handle = channel.declare_queue(queue, QueueOptions::default()).await?;
        info!(
            queue = %handle.name,
            messages = handle.message_count,
            consumers = handle.consumer_count,
            "queue declared"
        );
    }
    Ok(())
}

/// Runs the service, reconnecting with backoff after broker failures, until
/// `shutdown` is cancelled.
///
/// Configuration errors are returned straight away. Broker failures are
/// retried per `config.restart`; once it gives up the last failure is
/// returned.
pub async fn supervise(
    config: SettlementConfig,
    payments: PaymentUseCaseRef,
    shutdown: CancellationToken,
) -> Result<ConsumerSummary> {
    supervise_with(config, payments, shutdown, |broker| async move {
        infrastructure::connect(&broker).await
    })
    .await
}

/// [`supervise`] with a custom way of opening broker connections.
pub async fn supervise_with<F, Fut>(
    config: SettlementConfig,
    payments: PaymentUseCaseRef,
    shutdown: CancellationToken,
    connect: F,
) -> Result<ConsumerSummary>
where
    F: Fn(BrokerConfig) -> Fut,
    Fut: Future<Output = Result<ConnectionRef>>,
{
    config.validate()?;
    let mut total = ConsumerSummary::default();
    let mut attempt = 0;

    loop {
        let outcome = match connect(config.broker.clone()).await {
            Ok(connection) => {
                match SettlementService::with_connection(
                    config.clone(),
                    connection,
                    Arc::clone(&payments),
                )
                .await
                {
                    Ok(service) => {
                        attempt = 0;
                        service.with_shutdown(shutdown.clone()).run().await
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };

        let failure = match outcome {
            Ok(summary) => {
                total.merge(&summary);
                if shutdown.is_cancelled() {
                    info!(?total, "settlement service stopped");
                    return Ok(total);
                }
                PipelineError::Connection("broker ended the order subscription".to_string())
            }
            Err(e) if !e.is_broker_fatal() => return Err(e),
            Err(e) => e,
        };

        if shutdown.is_cancelled() {
            return Ok(total);
        }
        if !config.restart.allows(attempt) {
            error!(error = %failure, restarts = attempt, "giving up on broker");
            return Err(failure);
        }
        let delay = config.restart.delay_for(attempt);
        attempt += 1;
        warn!(error = %failure, attempt, ?delay, "restarting after broker failure");

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(total),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
