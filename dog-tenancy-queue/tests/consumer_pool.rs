mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{directory, interceptor, message, Behavior, RecordingHandler};
use dog_tenancy_queue::{
    ConsumeOutcome, ConsumerConfig, ConsumerPool, Delivery, Disposition, HandlerFailure,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_consumes_every_delivery() {
    let directory = directory();
    let interceptor = Arc::new(interceptor(&directory));
    let handler = Arc::new(RecordingHandler::new(Behavior::Succeed));
    let consumer = ConsumerPool::start(
        interceptor.clone(),
        handler.clone(),
        ConsumerConfig {
            max_in_flight: 8,
            channel_capacity: 16,
        },
    );

    let mut outcomes = Vec::new();
    for i in 0..200 {
        let tenant = if i % 2 == 0 { "a" } else { "b" };
        outcomes.push(consumer.submit(message(tenant)).await.unwrap());
    }
    for outcome in outcomes {
        assert_eq!(outcome.await.unwrap().disposition(), Disposition::Ack);
    }

    consumer.drain().await.unwrap();
    assert_eq!(handler.calls(), 200);
    assert_eq!(handler.mismatches(), 0);
    assert_eq!(interceptor.tenancy().handles().stats().in_use, 0);
}

#[tokio::test]
async fn rejected_and_handled_messages_share_a_pool() {
    let directory = directory();
    let interceptor = Arc::new(interceptor(&directory));
    let handler = Arc::new(RecordingHandler::new(Behavior::Succeed));
    let consumer = ConsumerPool::start(interceptor, handler.clone(), ConsumerConfig::default());

    let ok = consumer.submit(message("a")).await.unwrap();
    let beta = consumer.submit(message("beta")).await.unwrap();
    assert_eq!(ok.await.unwrap().disposition(), Disposition::Ack);
    assert_eq!(beta.await.unwrap().disposition(), Disposition::Reject);

    consumer.drain().await.unwrap();
    assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn shutdown_cancels_in_flight_units_which_still_tear_down() {
    let directory = directory();
    let interceptor = Arc::new(interceptor(&directory));
    let handler = Arc::new(RecordingHandler::new(Behavior::Hang));
    let consumer = ConsumerPool::start(interceptor.clone(), handler.clone(), ConsumerConfig::default());

    let stuck = consumer.submit(message("a")).await.unwrap();
    while handler.calls() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let sender = consumer.sender();
    consumer.shutdown().await.unwrap();

    assert!(matches!(
        stuck.await.unwrap(),
        ConsumeOutcome::HandlerFailed { failure: HandlerFailure::Cancelled, .. }
    ));
    assert!(handler.scopes.lock()[0].is_torn_down());
    let stats = interceptor.tenancy().handles().stats();
    assert_eq!((stats.opened, stats.released, stats.in_use), (1, 1, 0));

    // the pool no longer takes deliveries
    let (delivery, _outcome) = Delivery::new(message("a"));
    assert!(sender.send(delivery).await.is_err());
}
