//! Broker backends, the channel pool, and publishers.

#[cfg(feature = "broker-amqp")]
pub mod amqp;
pub mod in_memory;
pub mod pool;
pub mod publisher;

use crate::config::BrokerConfig;
use crate::domain::ports::ConnectionRef;
use crate::error::{PipelineError, Result};
use in_memory::InMemoryBroker;
use std::sync::Arc;
use tracing::info;

/// Opens a broker connection for the URL scheme in `config`.
///
/// `memory://` starts a private in-process broker; `amqp://` and `amqps://`
/// need the `broker-amqp` feature.
pub async fn connect(config: &BrokerConfig) -> Result<ConnectionRef> {
    let connection = match config.scheme() {
        "memory" => {
            let connection = InMemoryBroker::new().connect(config).await?;
            Arc::new(connection) as ConnectionRef
        }
        "amqp" | "amqps" => connect_amqp(config).await?,
        other => {
            return Err(PipelineError::Configuration(format!(
                "unsupported broker scheme '{other}'"
            )));
        }
    };
    info!(broker = %config.redacted_url(), "connected to broker");
    Ok(connection)
}

#[cfg(feature = "broker-amqp")]
async fn connect_amqp(config: &BrokerConfig) -> Result<ConnectionRef> {
    Ok(Arc::new(amqp::AmqpConnection::connect(config).await?))
}

#[cfg(not(feature = "broker-amqp"))]
async fn connect_amqp(_config: &BrokerConfig) -> Result<ConnectionRef> {
    Err(PipelineError::Configuration(
        "AMQP broker requested via --broker-url, but the 'broker-amqp' feature is not enabled"
            .to_string(),
    ))
}
