//! Application layer: the per-message pipeline, the consumer that drives it,
//! and the payment use-case it calls.
//!
//! The consumer owns the broker subscription and hands each delivery to
//! [`pipeline::OrderPipeline`], which settles it with the broker on its own.

pub mod consumer;
pub mod create_payment;
pub mod pipeline;
