use crate::config::Backoff;
use crate::domain::dead_letter::DeadLetter;
use crate::domain::delivery::Delivery;
use crate::domain::notification::NotificationMessage;
use crate::domain::order::{OrderEvent, OrderId};
use crate::domain::payment::{PaymentOutcome, PaymentRecord};
use crate::domain::ports::PaymentUseCaseRef;
use crate::error::{PipelineError, Result, Stage};
use crate::infrastructure::publisher::QueuePublisher;
use tracing::{Span, debug, error, info, instrument, warn};

/// Where a message got to before its pipeline run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Received,
    Decoded,
    Validated,
    Processed,
    Notified,
    Archived,
    Failed(Stage),
}

/// How the originating delivery was settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    Requeued,
    DeadLettered,
    /// The ack or reject itself failed; the broker will redeliver.
    Unsettled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageReport {
    pub order_id: Option<OrderId>,
    pub delivery_count: u32,
    pub state: MessageState,
    pub disposition: Disposition,
    /// The order had already been paid; fan-out was skipped.
    pub duplicate: bool,
    /// Best-effort stages whose publish failed.
    pub degraded: Vec<Stage>,
}

impl MessageReport {
    fn received(delivery_count: u32) -> Self {
        Self {
            order_id: None,
            delivery_count,
            state: MessageState::Received,
            disposition: Disposition::Unsettled,
            duplicate: false,
            degraded: Vec::new(),
        }
    }
}

/// Publishers for the queues the pipeline writes to.
#[derive(Clone)]
pub struct Destinations {
    pub notifications: QueuePublisher,
    pub history: QueuePublisher,
    pub dead_letters: QueuePublisher,
}

/// Runs one delivery through decode, validation, payment, and fan-out.
///
/// Failures never escape `handle`: each one ends the message's run, is
/// logged, and decides how the delivery is settled.
///
/// - decode and validation failures are dead-lettered, then acknowledged;
/// - payment failures are requeued until the delivery limit, then
///   dead-lettered;
/// - a message the dead-letter queue refuses is held with a growing delay,
///   then requeued;
/// - the delivery is acknowledged as soon as the payment is recorded, and
///   notification or history publish failures do not change that.
pub struct OrderPipeline {
    source_queue: String,
    payments: PaymentUseCaseRef,
    destinations: Destinations,
    max_deliveries: u32,
    park_retry: Backoff,
}

impl OrderPipeline {
    pub fn new(
        source_queue: impl Into<String>,
        payments: PaymentUseCaseRef,
        destinations: Destinations,
        max_deliveries: u32,
        park_retry: Backoff,
    ) -> Self {
        Self {
            source_queue: source_queue.into(),
            payments,
            destinations,
            max_deliveries,
            park_retry,
        }
    }

    #[instrument(
        name = "order",
        skip_all,
        fields(
            delivery_tag = delivery.delivery_tag(),
            delivery_count = delivery.delivery_count(),
            order_id = tracing::field::Empty,
        )
    )]
    pub async fn handle(&self, delivery: Delivery) -> MessageReport {
        let mut report = MessageReport::received(delivery.delivery_count());

        let order = match OrderEvent::decode(delivery.body()) {
            Ok(order) => order,
            Err(e) => return self.dead_letter(delivery, Stage::Decode, e, report).await,
        };
        report.state = MessageState::Decoded;

        let validated = match order.validate() {
            Ok(validated) => validated,
            Err(e) => return self.dead_letter(delivery, Stage::Validate, e, report).await,
        };
        Span::current().record("order_id", validated.id);
        report.order_id = Some(validated.id);
        report.state = MessageState::Validated;
        debug!(total = %validated.total, fields = order.fields().len(), "order received");

        let payment = PaymentRecord::for_order(&validated);
        match self.payments.execute(&payment).await {
            Ok(PaymentOutcome::Created) => {
                info!(amount = %payment.amount, method = ?payment.method, "payment processed");
            }
            Ok(PaymentOutcome::AlreadyProcessed) => {
                info!("order already paid, skipping fan-out");
                report.duplicate = true;
                report.state = MessageState::Processed;
                report.disposition = ack(delivery, Disposition::Acked).await;
                return report;
            }
            Err(e) => return self.retry_or_dead_letter(delivery, e.into(), report).await,
        }
        report.state = MessageState::Processed;
        report.disposition = ack(delivery, Disposition::Acked).await;

        let notification = NotificationMessage::payment_completed(&payment);
        match publish(&self.destinations.notifications, notification.encode()).await {
            Ok(()) => report.state = MessageState::Notified,
            Err(e) => {
                warn!(stage = %Stage::Notify, error = %e, "notification not published");
                report.degraded.push(Stage::Notify);
            }
        }

        let history = order.into_history();
        match publish(&self.destinations.history, history.encode()).await {
            Ok(()) => {
                report.state = MessageState::Archived;
                debug!("order archived");
            }
            Err(e) => {
                warn!(stage = %Stage::Archive, error = %e, "history entry not published");
                report.degraded.push(Stage::Archive);
            }
        }

        report
    }

    async fn retry_or_dead_letter(
        &self,
        delivery: Delivery,
        error: PipelineError,
        mut report: MessageReport,
    ) -> MessageReport {
        if delivery.delivery_count() >= self.max_deliveries {
            return self.dead_letter(delivery, Stage::Process, error, report).await;
        }
        warn!(
            stage = %Stage::Process,
            error = %error,
            max_deliveries = self.max_deliveries,
            "payment failed, requeueing"
        );
        report.state = MessageState::Failed(Stage::Process);
        report.disposition = requeue(delivery).await;
        report
    }

    async fn dead_letter(
        &self,
        delivery: Delivery,
        stage: Stage,
        error: PipelineError,
        mut report: MessageReport,
    ) -> MessageReport {
        warn!(stage = %stage, error = %error, "message dead-lettered");
        report.state = MessageState::Failed(stage);

        let dead_letter = DeadLetter::new(
            &self.source_queue,
            stage,
            &error,
            delivery.delivery_count(),
            delivery.body(),
        );
        let parked = publish(&self.destinations.dead_letters, dead_letter.encode()).await;
        report.disposition = match parked {
            Ok(()) => ack(delivery, Disposition::DeadLettered).await,
            Err(e) => {
                // Never drop a message we could not park. It goes back only
                // after a delay that grows with its delivery count.
                let delay = self
                    .park_retry
                    .delay_for(delivery.delivery_count().saturating_sub(1));
                error!(error = %e, ?delay, "dead-letter publish failed, requeueing");
                tokio::time::sleep(delay).await;
                requeue(delivery).await
            }
        };
        report
    }
}

async fn publish(publisher: &QueuePublisher, payload: Result<Vec<u8>>) -> Result<()> {
    publisher.publish(&payload?).await
}

async fn ack(delivery: Delivery, settled: Disposition) -> Disposition {
    match delivery.ack().await {
        Ok(()) => settled,
        Err(e) => {
            error!(error = %e, "acknowledgement failed");
            Disposition::Unsettled
        }
    }
}

async fn requeue(delivery: Delivery) -> Disposition {
    match delivery.reject(true).await {
        Ok(()) => Disposition::Requeued,
        Err(e) => {
            error!(error = %e, "reject failed");
            Disposition::Unsettled
        }
    }
}
