//! Polled-worker strategy tests.

mod common;

use std::{sync::Arc, time::Duration};

use common::{eventually, fast_config, orders, Harness, RecordingSink};
use sluice_core::{properties, PropertyValue};
use sluice_delivery::{
    polled::PolledWorkerDelivery, ActivationConfig, DeliveryMode, DeliveryStrategy,
};

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn pollers_share_the_queue_and_exit_on_deactivate() {
    let harness = Harness::local();
    let sink = Arc::new(RecordingSink::default());
    let config = ActivationConfig { endpoint_pool_max_size: 3, ..fast_config(DeliveryMode::MultiReceiver) };
    let delivery = PolledWorkerDelivery::new(harness.context(config, harness.collaborators(), sink.clone()));

    delivery.start().await.unwrap();
    assert_eq!(delivery.running_pollers(), 3);

    for n in 0..10 {
        harness.broker.publish(&orders(), format!("message {n}"));
    }
    harness.container.wait_for_invocations(10).await;
    eventually(WAIT, || harness.broker.commits() >= 10).await;

    tokio::time::timeout(Duration::from_secs(5), delivery.deactivate())
        .await
        .expect("pollers exit promptly");

    assert_eq!(delivery.running_pollers(), 0);
    assert_eq!(harness.broker.open_connections(), 0);
    assert_eq!(harness.broker.queue_depth(&orders()), 0);
    assert_eq!(harness.container.endpoints_created(), harness.container.endpoints_released());
    assert_eq!(sink.distress_count(), 0);
}

#[tokio::test]
async fn serial_mode_fills_batches_and_sends_end_of_batch_marker() {
    let harness = Harness::local();
    for body in ["a", "b", "c"] {
        harness.broker.publish(&orders(), body);
    }
    let sink = Arc::new(RecordingSink::default());
    let config = ActivationConfig { batch_size: 3, ..fast_config(DeliveryMode::Serial) };
    let delivery = PolledWorkerDelivery::new(harness.context(config, harness.collaborators(), sink));

    delivery.start().await.unwrap();
    assert_eq!(delivery.running_pollers(), 1);
    harness.container.wait_for_invocations(3).await;
    eventually(WAIT, || harness.container.markers() == 1).await;

    let indexes: Vec<_> = harness
        .container
        .invocations()
        .iter()
        .map(|call| call.properties.get(properties::BATCH_INDEX).cloned())
        .collect();
    assert_eq!(
        indexes,
        vec![Some(PropertyValue::Int(0)), Some(PropertyValue::Int(1)), Some(PropertyValue::Int(2))]
    );
    eventually(WAIT, || harness.broker.commits() == 1).await;

    delivery.deactivate().await;
}

#[tokio::test]
async fn failed_before_delivery_discards_endpoint_and_rolls_back() {
    let harness = Harness::two_phase();
    harness.container.fail_before_delivery(true);
    let sink = Arc::new(RecordingSink::default());
    let config = ActivationConfig { endpoint_pool_max_size: 1, ..fast_config(DeliveryMode::SyncPoll) };
    let delivery = PolledWorkerDelivery::new(harness.context(config, harness.collaborators(), sink.clone()));
    delivery.start().await.unwrap();

    harness.broker.publish(&orders(), "payload");
    eventually(WAIT, || harness.broker.rollbacks() >= 1).await;
    assert_eq!(harness.container.invocation_count(), 0);
    eventually(WAIT, || harness.container.endpoints_released() >= 1).await;

    harness.container.fail_before_delivery(false);
    harness.container.wait_for_invocations(1).await;
    eventually(WAIT, || harness.container.transaction_counts().committed == 1).await;

    assert!(harness.container.endpoints_created() >= 2);
    assert!(harness.container.invocations()[0].redelivered);

    delivery.deactivate().await;
    assert_eq!(sink.distress_count(), 0);
}

#[tokio::test]
async fn endpoint_unavailability_is_retried() {
    let harness = Harness::local();
    harness.container.unavailable_for(3);
    let sink = Arc::new(RecordingSink::default());
    let config = ActivationConfig { endpoint_pool_max_size: 1, ..fast_config(DeliveryMode::SyncPoll) };
    let delivery = PolledWorkerDelivery::new(harness.context(config, harness.collaborators(), sink.clone()));
    delivery.start().await.unwrap();

    harness.broker.publish(&orders(), "payload");
    harness.container.wait_for_invocations(1).await;

    assert_eq!(harness.container.create_attempts(), 4);
    assert_eq!(sink.distress_count(), 0);
    delivery.deactivate().await;
}

#[tokio::test]
async fn endpoint_creation_timeout_reports_distress() {
    let harness = Harness::local();
    harness.container.unavailable_for(usize::MAX);
    let sink = Arc::new(RecordingSink::default());
    let config = ActivationConfig {
        endpoint_pool_max_size: 1,
        endpoint_creation_timeout_ms: 100,
        ..fast_config(DeliveryMode::SyncPoll)
    };
    let delivery = PolledWorkerDelivery::new(harness.context(config, harness.collaborators(), sink.clone()));
    delivery.start().await.unwrap();

    eventually(WAIT, || sink.distress_count() == 1).await;
    eventually(WAIT, || delivery.running_pollers() == 0).await;

    delivery.deactivate().await;
    assert_eq!(harness.broker.open_connections(), 0);
}

#[tokio::test]
async fn receive_failure_mid_batch_returns_partial_batch_to_the_broker() {
    let harness = Harness::local();
    let first = harness.broker.publish(&orders(), "a");
    harness.broker.publish(&orders(), "b");
    harness.broker.fail_receive_after(1);
    let sink = Arc::new(RecordingSink::default());
    let config = ActivationConfig { batch_size: 2, ..fast_config(DeliveryMode::Serial) };
    let delivery = PolledWorkerDelivery::new(harness.context(config, harness.collaborators(), sink.clone()));

    delivery.start().await.unwrap();
    eventually(WAIT, || delivery.running_pollers() == 0).await;

    // Rolled back before the poller exited, not when its session closes.
    assert_eq!(harness.broker.queue_depth(&orders()), 2);
    assert_eq!(harness.broker.rollbacks(), 1);
    let waiting = harness.broker.messages(&orders());
    assert_eq!(waiting[0].id, first);
    assert!(waiting[0].redelivered);
    assert_eq!(harness.container.invocation_count(), 0);
    assert_eq!(sink.distress_count(), 1);

    delivery.deactivate().await;
    assert_eq!(harness.broker.open_connections(), 0);
}
