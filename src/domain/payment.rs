use super::order::{OrderId, ValidatedOrder};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Default)]
pub enum PaymentMethod {
    #[default]
    Card,
    Cash,
    Transfer,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Default)]
pub enum PaymentStatus {
    #[default]
    Processed,
    Pending,
    Failed,
}

/// A payment settled (or attempted) against one order.
///
/// `order_id` and `amount` always come straight from the triggering order;
/// `method` and `status` are the pipeline defaults.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub order_id: OrderId,
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
}

impl PaymentRecord {
    pub fn for_order(order: &ValidatedOrder) -> Self {
        Self {
            order_id: order.id,
            amount: order.total,
            method: PaymentMethod::default(),
            status: PaymentStatus::default(),
        }
    }
}

/// What the payment use-case did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    Created,
    /// A payment for this order was already recorded; nothing was written.
    AlreadyProcessed,
}
