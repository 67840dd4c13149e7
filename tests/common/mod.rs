#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use settlement::application::consumer::ConsumerSummary;
use settlement::application::create_payment::CreatePaymentUseCase;
use settlement::config::{BrokerConfig, SettlementConfig};
use settlement::domain::payment::{PaymentOutcome, PaymentRecord};
use settlement::domain::ports::{PaymentUseCase, PaymentUseCaseRef};
use settlement::error::{PaymentError, PaymentResult, Result};
use settlement::infrastructure::in_memory::{InMemoryBroker, InMemoryPaymentRepository};
use settlement::service::SettlementService;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const ORDERS: &str = "pedidos";
pub const NOTIFICATIONS: &str = "notificaciones";
pub const HISTORY: &str = "historial";
pub const DEAD_LETTERS: &str = "pedidos.dead-letter";

/// A shared in-memory broker plus the payment store the service writes to.
pub struct Harness {
    pub broker: InMemoryBroker,
    pub repository: InMemoryPaymentRepository,
    pub config: SettlementConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            broker: InMemoryBroker::new(),
            repository: InMemoryPaymentRepository::new(),
            config: SettlementConfig::default(),
        }
    }

    pub fn payments(&self) -> PaymentUseCaseRef {
        Arc::new(CreatePaymentUseCase::new(Box::new(self.repository.clone())))
    }

    pub fn publish_order(&self, body: &str) {
        self.broker.publish(ORDERS, body.as_bytes().to_vec());
    }

    pub async fn service(&self, payments: PaymentUseCaseRef) -> SettlementService {
        let connection = self
            .broker
            .connect(&BrokerConfig::default())
            .await
            .expect("connect to in-memory broker");
        SettlementService::with_connection(self.config.clone(), Arc::new(connection), payments)
            .await
            .expect("start settlement service")
    }

    /// Starts the service on a background task.
    pub async fn spawn(&self, payments: PaymentUseCaseRef) -> Running {
        let service = self.service(payments).await;
        let shutdown = service.shutdown_token();
        Running {
            shutdown,
            handle: tokio::spawn(service.run()),
        }
    }

    pub fn json_messages(&self, queue: &str) -> Vec<Value> {
        self.broker
            .messages(queue)
            .iter()
            .map(|body| serde_json::from_slice(body).expect("queue holds JSON"))
            .collect()
    }

    /// True once nothing is waiting on or being processed from the order queue.
    pub fn orders_settled(&self) -> bool {
        self.broker.messages(ORDERS).is_empty() && self.broker.unacked_count(ORDERS) == 0
    }
}

pub struct Running {
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<Result<ConsumerSummary>>,
}

impl Running {
    pub async fn stop(self) -> ConsumerSummary {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("service stops in time")
            .expect("service task")
            .expect("service run")
    }
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not met within 5s");
}

pub fn order(id: u64, total: &str) -> String {
    format!(r#"{{"id": {id}, "total": {total}}}"#)
}

/// Fails every payment.
pub struct FailingPayments {
    pub attempts: AtomicU32,
}

impl FailingPayments {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            attempts: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl PaymentUseCase for FailingPayments {
    async fn execute(&self, _payment: &PaymentRecord) -> PaymentResult<PaymentOutcome> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(PaymentError::RepositoryError("database unavailable".to_string()))
    }
}

/// Fails the first `failures` payments, then delegates.
pub struct FlakyPayments {
    failures: AtomicU32,
    inner: PaymentUseCaseRef,
}

impl FlakyPayments {
    pub fn new(failures: u32, inner: PaymentUseCaseRef) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicU32::new(failures),
            inner,
        })
    }
}

#[async_trait]
impl PaymentUseCase for FlakyPayments {
    async fn execute(&self, payment: &PaymentRecord) -> PaymentResult<PaymentOutcome> {
        let remaining = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if remaining.is_ok() {
            return Err(PaymentError::Rejected("gateway timeout".to_string()));
        }
        self.inner.execute(payment).await
    }
}

/// Delegates after a pause, recording how many payments overlap and the
/// order ids in the order they started.
pub struct SlowPayments {
    delay: Duration,
    inner: PaymentUseCaseRef,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub started: std::sync::Mutex<Vec<(u64, String)>>,
}

impl SlowPayments {
    pub fn new(delay: Duration, inner: PaymentUseCaseRef) -> Arc<Self> {
        Arc::new(Self {
            delay,
            inner,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            started: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn started(&self) -> Vec<(u64, String)> {
        self.started.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentUseCase for SlowPayments {
    async fn execute(&self, payment: &PaymentRecord) -> PaymentResult<PaymentOutcome> {
        self.started
            .lock()
            .unwrap()
            .push((payment.order_id, payment.amount.to_string()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.inner.execute(payment).await
    }
}
