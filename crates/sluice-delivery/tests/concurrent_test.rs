//! Concurrent-pull strategy tests.

mod common;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use common::{eventually, fast_config, orders, Harness, RecordingSink};
use sluice_core::{properties, CoreError, Message, PropertyValue};
use sluice_delivery::{
    concurrent::ConcurrentPullDelivery, ActivationConfig, DeliveryError, DeliveryMode,
    DeliveryStrategy,
};
use sluice_testing::RejectingScheduler;

const WAIT: Duration = Duration::from_secs(10);

fn concurrent_config() -> ActivationConfig {
    fast_config(DeliveryMode::ConcurrentPull)
}

#[tokio::test]
async fn pool_grows_to_max_then_waits_for_a_returned_unit() {
    let harness = Harness::local();
    let sink = Arc::new(RecordingSink::default());
    let context = harness.context(concurrent_config(), harness.collaborators(), sink.clone());
    let delivery = ConcurrentPullDelivery::new(context);
    delivery.connect().await.unwrap();
    let pool = delivery.session_pool();

    let first = pool.server_session().await.unwrap();
    let second = pool.server_session().await.unwrap();
    assert_eq!(delivery.pool_size(), 2);
    assert_eq!(delivery.idle_count(), 0);

    let waiting_pool = pool.clone();
    let third = tokio::spawn(async move { waiting_pool.server_session().await });
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(!third.is_finished());

    first.start(Vec::new()).unwrap();
    let third = tokio::time::timeout(WAIT, third)
        .await
        .expect("third request is served")
        .unwrap()
        .unwrap();
    assert_eq!(delivery.pool_size(), 2);

    drop(second);
    drop(third);
    eventually(WAIT, || delivery.idle_count() == 2).await;

    delivery.deactivate().await;
    assert_eq!(delivery.pool_size(), 0);
    assert_eq!(harness.container.endpoints_created(), 2);
    assert_eq!(harness.container.endpoints_released(), 2);
    assert_eq!(sink.distress_count(), 0);
}

#[tokio::test]
async fn rejected_work_returns_unit_and_reports_distress() {
    let harness = Harness::local();
    let sink = Arc::new(RecordingSink::default());
    let collaborators = harness.collaborators_with(Arc::new(RejectingScheduler));
    let context = harness.context(concurrent_config(), collaborators, sink.clone());
    let delivery = ConcurrentPullDelivery::new(context);
    delivery.connect().await.unwrap();

    let session = delivery.session_pool().server_session().await.unwrap();
    let result = session.start(Vec::new());

    assert!(matches!(result, Err(CoreError::Scheduling { .. })));
    assert_eq!(sink.distress_count(), 1);
    assert!(matches!(sink.distress.lock()[0], DeliveryError::Scheduling { .. }));
    assert_eq!(delivery.idle_count(), 1);

    delivery.deactivate().await;
    assert_eq!(harness.container.endpoints_released(), 1);
}

#[tokio::test]
async fn session_pool_refuses_after_deactivation() {
    let harness = Harness::local();
    let sink = Arc::new(RecordingSink::default());
    let context = harness.context(concurrent_config(), harness.collaborators(), sink.clone());
    let delivery = ConcurrentPullDelivery::new(context);
    delivery.connect().await.unwrap();
    let pool = delivery.session_pool();

    delivery.deactivate().await;

    let result = tokio::time::timeout(WAIT, pool.server_session()).await.unwrap();
    assert!(matches!(result, Err(CoreError::ShuttingDown)));
    assert_eq!(sink.distress_count(), 0);
}

#[tokio::test]
async fn two_phase_batches_commit_through_container() {
    let harness = Harness::two_phase();
    for body in ["a", "b", "c", "d"] {
        harness.broker.publish(&orders(), body);
    }
    let sink = Arc::new(RecordingSink::default());
    let config = ActivationConfig { batch_size: 2, ..concurrent_config() };
    let delivery = ConcurrentPullDelivery::new(harness.context(config, harness.collaborators(), sink.clone()));

    delivery.start().await.unwrap();
    harness.container.wait_for_invocations(4).await;
    eventually(WAIT, || harness.container.transaction_counts().committed == 2).await;

    let invocations = harness.container.invocations();
    assert_eq!(harness.container.markers(), 2);
    assert!(invocations
        .iter()
        .all(|call| call.properties.get(properties::BATCH_SIZE) == Some(&PropertyValue::Int(2))));
    assert_eq!(harness.broker.queue_depth(&orders()), 0);

    delivery.deactivate().await;
    assert_eq!(harness.container.open_transactions(), 0);
    assert_eq!(harness.broker.open_connections(), 0);
    assert_eq!(sink.distress_count(), 0);
}

#[tokio::test]
async fn failed_callback_rolls_back_container_transaction_and_redelivers() {
    let harness = Harness::two_phase();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    harness.container.set_handler(move |_message: &mut Message| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(CoreError::endpoint("first attempt fails"));
        }
        Ok(())
    });
    let sink = Arc::new(RecordingSink::default());
    let delivery =
        ConcurrentPullDelivery::new(harness.context(concurrent_config(), harness.collaborators(), sink));
    delivery.start().await.unwrap();

    let id = harness.broker.publish(&orders(), "payload");
    harness.container.wait_for_invocations(2).await;
    eventually(WAIT, || harness.container.transaction_counts().committed == 1).await;

    let invocations = harness.container.invocations();
    assert_eq!(invocations[0].message_id, id);
    assert!(!invocations[0].redelivered);
    assert_eq!(invocations[1].message_id, id);
    assert!(invocations[1].redelivered);
    assert_eq!(
        invocations[1].properties.get(properties::REDELIVERY_COUNT),
        Some(&PropertyValue::Int(1))
    );
    assert_eq!(harness.container.transaction_counts().rolled_back, 1);

    delivery.deactivate().await;
}

#[tokio::test]
async fn hold_until_ack_suspends_transaction_until_acknowledged() {
    let harness = Harness::two_phase();
    let sink = Arc::new(RecordingSink::default());
    let config = ActivationConfig { hold_until_ack: true, ..concurrent_config() };
    let delivery = ConcurrentPullDelivery::new(harness.context(config, harness.collaborators(), sink));
    delivery.start().await.unwrap();

    harness.broker.publish(&orders(), "acked");
    harness.container.wait_for_invocations(1).await;
    eventually(WAIT, || harness.container.transaction_counts().committed == 1).await;

    let counts = harness.container.transaction_counts();
    assert_eq!(counts.suspended, 1);
    assert_eq!(counts.resumed, 1);

    delivery.deactivate().await;
}

#[tokio::test]
async fn deactivation_rolls_back_unacknowledged_batch() {
    let harness = Harness::local();
    harness.container.set_handler(|_message: &mut Message| Ok(()));
    let sink = Arc::new(RecordingSink::default());
    let config = ActivationConfig { hold_until_ack: true, ..concurrent_config() };
    let delivery = ConcurrentPullDelivery::new(harness.context(config, harness.collaborators(), sink));
    delivery.start().await.unwrap();

    let id = harness.broker.publish(&orders(), "never acked");
    harness.container.wait_for_invocations(1).await;
    assert_eq!(harness.broker.queue_depth(&orders()), 0);

    tokio::time::timeout(Duration::from_secs(5), delivery.deactivate())
        .await
        .expect("deactivation does not wait for the acknowledgement");

    let requeued = harness.broker.messages(&orders());
    assert_eq!(requeued.len(), 1);
    assert_eq!(requeued[0].id, id);
    assert!(requeued[0].redelivered);
    assert_eq!(harness.broker.commits(), 0);
}
