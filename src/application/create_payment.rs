use crate::domain::payment::{PaymentOutcome, PaymentRecord};
use crate::domain::ports::{PaymentRepositoryBox, PaymentUseCase};
use crate::error::PaymentResult;
use async_trait::async_trait;
use tracing::debug;

/// Records a payment for an order, once.
///
/// A second payment for the same order is not written again; the caller is
/// told the order was already processed so it can skip side effects.
pub struct CreatePaymentUseCase {
    repository: PaymentRepositoryBox,
}

impl CreatePaymentUseCase {
    pub fn new(repository: PaymentRepositoryBox) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl PaymentUseCase for CreatePaymentUseCase {
    async fn execute(&self, payment: &PaymentRecord) -> PaymentResult<PaymentOutcome> {
        if self.repository.insert_if_absent(payment.clone()).await? {
            Ok(PaymentOutcome::Created)
        } else {
            debug!(order_id = payment.order_id, "payment already recorded");
            Ok(PaymentOutcome::AlreadyProcessed)
        }
    }
}
