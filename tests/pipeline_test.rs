mod common;

use common::*;
use rust_decimal_macros::dec;
use serde_json::json;
use settlement::domain::dead_letter::{BodyEncoding, DeadLetter};
use settlement::domain::payment::{PaymentMethod, PaymentStatus};
use settlement::domain::ports::PaymentRepository;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn dead_letters(harness: &Harness) -> Vec<DeadLetter> {
    harness
        .broker
        .messages(DEAD_LETTERS)
        .iter()
        .map(|body| serde_json::from_slice(body).unwrap())
        .collect()
}

#[tokio::test]
async fn test_valid_order_is_paid_notified_and_archived() {
    let harness = Harness::new();
    harness.publish_order(r#"{"id": 42, "total": 19.99}"#);
    let running = harness.spawn(harness.payments()).await;

    wait_until(|| harness.broker.messages(HISTORY).len() == 1).await;
    let summary = running.stop().await;

    let payment = harness.repository.get(42).await.unwrap().unwrap();
    assert_eq!(payment.order_id, 42);
    assert_eq!(payment.amount, dec!(19.99));
    assert_eq!(payment.method, PaymentMethod::Card);
    assert_eq!(payment.status, PaymentStatus::Processed);

    assert_eq!(
        harness.json_messages(NOTIFICATIONS),
        vec![json!({"orderId": 42, "message": "Payment completed for order 42"})]
    );
    assert_eq!(
        harness.json_messages(HISTORY),
        vec![json!({"id": 42, "total": 19.99, "status": "completed"})]
    );
    assert!(harness.orders_settled());
    assert!(harness.broker.messages(DEAD_LETTERS).is_empty());
    assert_eq!(summary.received, 1);
    assert_eq!(summary.processed, 1);
}

#[tokio::test]
async fn test_history_keeps_every_original_field() {
    let harness = Harness::new();
    harness.publish_order(
        r#"{"id": 5, "customer": "ana", "total": 10.5, "status": "new", "items": [1, 2]}"#,
    );
    let running = harness.spawn(harness.payments()).await;

    wait_until(|| harness.broker.messages(HISTORY).len() == 1).await;
    running.stop().await;

    let history = harness.json_messages(HISTORY).remove(0);
    let keys: Vec<_> = history.as_object().unwrap().keys().cloned().collect();
    assert_eq!(keys, ["id", "customer", "total", "status", "items"]);
    assert_eq!(
        history,
        json!({"id": 5, "customer": "ana", "total": 10.5, "status": "completed", "items": [1, 2]})
    );
}

#[tokio::test]
async fn test_non_numeric_id_is_dead_lettered() {
    let harness = Harness::new();
    harness.publish_order(r#"{"id": "abc", "total": 5.0}"#);
    let running = harness.spawn(harness.payments()).await;

    wait_until(|| harness.broker.messages(DEAD_LETTERS).len() == 1).await;
    wait_until(|| harness.orders_settled()).await;
    let summary = running.stop().await;

    let parked = dead_letters(&harness);
    assert_eq!(parked[0].stage, "validate");
    assert_eq!(parked[0].source_queue, ORDERS);
    assert_eq!(parked[0].body, r#"{"id": "abc", "total": 5.0}"#);
    assert!(parked[0].reason.contains("Validation error"));

    assert!(harness.repository.all_payments().await.unwrap().is_empty());
    assert!(harness.broker.messages(NOTIFICATIONS).is_empty());
    assert!(harness.broker.messages(HISTORY).is_empty());
    assert_eq!(summary.dead_lettered, 1);
}

#[tokio::test]
async fn test_missing_fields_are_dead_lettered() {
    let harness = Harness::new();
    harness.publish_order(r#"{"id": 7}"#);
    harness.publish_order(r#"{"total": 3.5}"#);
    harness.publish_order(r#"{"id": -1, "total": 3.5}"#);
    let running = harness.spawn(harness.payments()).await;

    wait_until(|| harness.broker.messages(DEAD_LETTERS).len() == 3).await;
    running.stop().await;

    assert!(dead_letters(&harness).iter().all(|d| d.stage == "validate"));
    assert!(harness.repository.all_payments().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_envelope_is_dead_lettered() {
    let harness = Harness::new();
    harness.broker.publish(ORDERS, b"not json".to_vec());
    harness.broker.publish(ORDERS, b"[1, 2, 3]".to_vec());
    let running = harness.spawn(harness.payments()).await;

    wait_until(|| harness.broker.messages(DEAD_LETTERS).len() == 2).await;
    wait_until(|| harness.orders_settled()).await;
    running.stop().await;

    let parked = dead_letters(&harness);
    assert!(parked.iter().all(|d| d.stage == "decode"));
    assert!(parked.iter().any(|d| d.body == "not json"));
}

#[tokio::test]
async fn test_binary_envelope_can_be_replayed_from_dead_letter_queue() {
    let harness = Harness::new();
    let raw = vec![0xde, 0xad, 0xbe, 0xef];
    harness.broker.publish(ORDERS, raw.clone());
    let running = harness.spawn(harness.payments()).await;

    wait_until(|| harness.broker.messages(DEAD_LETTERS).len() == 1).await;
    running.stop().await;

    let parked = dead_letters(&harness).remove(0);
    assert_eq!(parked.body_encoding, BodyEncoding::Base64);
    assert_eq!(parked.original_body().unwrap(), raw);
}

#[tokio::test]
async fn test_failing_payment_is_retried_then_dead_lettered() {
    let mut harness = Harness::new();
    harness.config.consumer.max_deliveries = 3;
    let payments = FailingPayments::new();
    harness.publish_order(&order(9, "12.00"));
    let running = harness.spawn(payments.clone()).await;

    wait_until(|| harness.broker.messages(DEAD_LETTERS).len() == 1).await;
    wait_until(|| harness.orders_settled()).await;
    let summary = running.stop().await;

    assert_eq!(payments.attempts.load(Ordering::SeqCst), 3);
    let parked = dead_letters(&harness);
    assert_eq!(parked[0].stage, "process");
    assert_eq!(parked[0].delivery_count, 3);
    assert!(parked[0].reason.contains("database unavailable"));

    assert!(harness.broker.messages(NOTIFICATIONS).is_empty());
    assert!(harness.broker.messages(HISTORY).is_empty());
    assert_eq!(summary.requeued, 2);
    assert_eq!(summary.dead_lettered, 1);
}

#[tokio::test]
async fn test_transient_payment_failure_recovers_on_redelivery() {
    let harness = Harness::new();
    let payments = FlakyPayments::new(2, harness.payments());
    harness.publish_order(&order(11, "8.25"));
    let running = harness.spawn(payments).await;

    wait_until(|| harness.broker.messages(HISTORY).len() == 1).await;
    let summary = running.stop().await;

    assert_eq!(
        harness.repository.get(11).await.unwrap().unwrap().amount,
        dec!(8.25)
    );
    assert_eq!(harness.broker.messages(NOTIFICATIONS).len(), 1);
    assert!(harness.broker.messages(DEAD_LETTERS).is_empty());
    assert_eq!(summary.requeued, 2);
    assert_eq!(summary.processed, 1);
}

#[tokio::test]
async fn test_notification_failure_still_archives_and_acks() {
    let harness = Harness::new();
    harness.broker.fail_publishes_to(NOTIFICATIONS, true);
    harness.publish_order(&order(42, "19.99"));
    let running = harness.spawn(harness.payments()).await;

    wait_until(|| harness.broker.messages(HISTORY).len() == 1).await;
    let summary = running.stop().await;

    assert!(harness.repository.get(42).await.unwrap().is_some());
    assert!(harness.broker.messages(NOTIFICATIONS).is_empty());
    assert!(harness.orders_settled());
    assert!(harness.broker.messages(DEAD_LETTERS).is_empty());
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.degraded, 1);
}

#[tokio::test]
async fn test_fan_out_failures_do_not_redeliver() {
    let harness = Harness::new();
    harness.broker.fail_publishes_to(NOTIFICATIONS, true);
    harness.broker.fail_publishes_to(HISTORY, true);
    harness.publish_order(&order(3, "1.00"));
    let running = harness.spawn(harness.payments()).await;

    wait_until(|| harness.orders_settled()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let summary = running.stop().await;

    assert_eq!(summary.received, 1);
    assert_eq!(summary.processed, 1);
    assert_eq!(harness.repository.all_payments().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_redelivered_paid_order_skips_fan_out() {
    let harness = Harness::new();
    let running = harness.spawn(harness.payments()).await;

    harness.publish_order(&order(8, "30.00"));
    wait_until(|| harness.broker.messages(HISTORY).len() == 1).await;
    harness.publish_order(&order(8, "30.00"));
    wait_until(|| harness.orders_settled()).await;
    let summary = running.stop().await;

    assert_eq!(harness.broker.messages(NOTIFICATIONS).len(), 1);
    assert_eq!(harness.broker.messages(HISTORY).len(), 1);
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.duplicates, 1);
}

#[tokio::test]
async fn test_message_is_kept_while_dead_letter_queue_is_down() {
    let harness = Harness::new();
    harness.broker.fail_publishes_to(DEAD_LETTERS, true);
    harness.publish_order("{oops");
    let running = harness.spawn(harness.payments()).await;

    // The refused message is held before each requeue instead of cycling
    // straight back through the consumer.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.broker.messages(DEAD_LETTERS).is_empty());
    harness.broker.fail_publishes_to(DEAD_LETTERS, false);

    wait_until(|| harness.broker.messages(DEAD_LETTERS).len() == 1).await;
    wait_until(|| harness.orders_settled()).await;
    let summary = running.stop().await;

    let parked = dead_letters(&harness);
    assert_eq!(parked[0].body, "{oops");
    assert!(parked[0].delivery_count <= 3, "redelivered {} times", parked[0].delivery_count);
    assert!(summary.received <= 3);
    assert_eq!(summary.dead_lettered, 1);
}
