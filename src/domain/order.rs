use crate::error::{PipelineError, Result};
use rust_decimal::Decimal;
use serde_json::{Map, Number, Value};
use std::str::FromStr;

pub type OrderId = u64;

/// Value written to the `status` field of archived orders.
pub const HISTORY_STATUS: &str = "completed";

/// An order-created event as it arrived on the order queue.
///
/// The event is kept as the original JSON object so that fields this
/// pipeline does not know about survive untouched into the history entry.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderEvent {
    fields: Map<String, Value>,
}

/// The two fields the pipeline needs from an order, checked and typed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedOrder {
    pub id: OrderId,
    pub total: Decimal,
}

impl OrderEvent {
    /// Parses a message body. Anything other than a JSON object is a
    /// malformed envelope.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let value: Value =
            serde_json::from_slice(body).map_err(|e| PipelineError::Decode(e.to_string()))?;
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(PipelineError::Decode(format!(
                "expected a JSON object, found {}",
                json_kind(&other)
            ))),
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Extracts `id` and `total`. A missing or non-numeric field is a
    /// malformed payload, reported separately from decode failures.
    pub fn validate(&self) -> Result<ValidatedOrder> {
        let id = order_id(self.fields.get("id"))?;
        let total = order_total(self.fields.get("total"))?;
        Ok(ValidatedOrder { id, total })
    }

    /// Consumes the event and produces its archived form.
    pub fn into_history(mut self) -> HistoryEntry {
        self.fields
            .insert("status".to_string(), Value::String(HISTORY_STATUS.to_string()));
        HistoryEntry {
            fields: self.fields,
        }
    }
}

impl From<Map<String, Value>> for OrderEvent {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

/// An order as it is appended to the history queue: every original field,
/// with `status` set to `"completed"`.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    fields: Map<String, Value>,
}

impl HistoryEntry {
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn status(&self) -> Option<&str> {
        self.fields.get("status").and_then(Value::as_str)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.fields)?)
    }
}

fn order_id(value: Option<&Value>) -> Result<OrderId> {
    let number = numeric_field("id", value)?;
    if let Some(id) = number.as_u64() {
        return Ok(id);
    }
    // Producers that only speak floating point send ids like 42.0.
    match number.as_f64() {
        // `u64::MAX as f64` rounds up to 2^64, which no u64 can hold.
        Some(id) if id >= 0.0 && id.fract() == 0.0 && id < u64::MAX as f64 => Ok(id as u64),
        _ => Err(PipelineError::Validation(format!(
            "field 'id' must be a non-negative integer, got {number}"
        ))),
    }
}

fn order_total(value: Option<&Value>) -> Result<Decimal> {
    let number = numeric_field("total", value)?;
    let text = number.to_string();
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|e| {
            PipelineError::Validation(format!("field 'total' is not a decimal ({text}): {e}"))
        })
}

fn numeric_field<'a>(name: &str, value: Option<&'a Value>) -> Result<&'a Number> {
    match value {
        Some(Value::Number(number)) => Ok(number),
        Some(other) => Err(PipelineError::Validation(format!(
            "field '{name}' must be numeric, found {}",
            json_kind(other)
        ))),
        None => Err(PipelineError::Validation(format!("missing field '{name}'"))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
