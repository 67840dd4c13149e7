//! Domain types for the settlement pipeline and the ports it talks through.

pub mod dead_letter;
pub mod delivery;
pub mod notification;
pub mod order;
pub mod payment;
pub mod ports;
