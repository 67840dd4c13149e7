use super::order::OrderId;
use super::payment::PaymentRecord;
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// User-facing notice that an order's payment went through.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMessage {
    pub order_id: OrderId,
    pub message: String,
}

impl NotificationMessage {
    pub fn payment_completed(payment: &PaymentRecord) -> Self {
        Self {
            order_id: payment.order_id,
            message: format!("Payment completed for order {}", payment.order_id),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
