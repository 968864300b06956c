use std::sync::Arc;
use std::time::Duration;

use docpipe::broker::{Broker, BrokerSettings, BrokerStats, MemoryBroker};
use docpipe::error::BrokerError;
use docpipe::job::JobId;

fn broker_with_visibility(visibility: Duration) -> MemoryBroker {
    MemoryBroker::new(BrokerSettings {
        visibility_timeout: visibility,
    })
}

#[tokio::test]
async fn deliveries_are_fifo_and_acked_by_message() {
    let broker = MemoryBroker::default();
    let first = JobId::new();
    let second = JobId::new();
    broker.enqueue(first).await.unwrap();
    broker.enqueue(second).await.unwrap();

    let a = broker.dequeue().await.unwrap().unwrap();
    let b = broker.dequeue().await.unwrap().unwrap();
    assert_eq!(a.job_id, first);
    assert_eq!(b.job_id, second);
    assert_eq!(a.attempt, 1);
    assert_eq!(
        broker.stats(),
        BrokerStats {
            ready: 0,
            in_flight: 2
        }
    );

    broker.ack(&a).await.unwrap();
    assert!(matches!(
        broker.ack(&a).await,
        Err(BrokerError::UnknownDelivery(_))
    ));
    broker.ack(&b).await.unwrap();
    assert_eq!(broker.stats(), BrokerStats::default());
}

#[tokio::test]
async fn unacked_message_is_redelivered_after_visibility_timeout() {
    let broker = broker_with_visibility(Duration::from_millis(30));
    let job = JobId::new();
    let message_id = broker.enqueue(job).await.unwrap();

    let first = broker.dequeue().await.unwrap().unwrap();
    let second = tokio::time::timeout(Duration::from_secs(2), broker.dequeue())
        .await
        .expect("redelivered")
        .unwrap()
        .unwrap();

    assert_eq!(first.message_id, message_id);
    assert_eq!(second.message_id, message_id);
    assert_eq!(second.job_id, job);
    assert_eq!(second.attempt, 2);
    assert_ne!(first.owner_token(), second.owner_token());
    assert!(second.supersedes(&first.owner_token()));
    assert!(!first.supersedes(&second.owner_token()));

    // The superseded hand-out can no longer settle the message.
    assert!(matches!(
        broker.ack(&first).await,
        Err(BrokerError::UnknownDelivery(_))
    ));
    assert_eq!(broker.stats().in_flight, 1);
    broker.ack(&second).await.unwrap();
    assert_eq!(broker.stats(), BrokerStats::default());
}

#[tokio::test]
async fn expired_delivery_can_settle_before_redelivery() {
    let broker = broker_with_visibility(Duration::from_millis(20));
    broker.enqueue(JobId::new()).await.unwrap();
    let delivery = broker.dequeue().await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;

    // The lease ran out, but no later hand-out exists, so the ack still settles it.
    broker.ack(&delivery).await.unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(50), broker.dequeue())
            .await
            .is_err()
    );
    assert_eq!(broker.stats(), BrokerStats::default());
}

#[tokio::test]
async fn extend_keeps_a_live_delivery_invisible() {
    let broker = broker_with_visibility(Duration::from_millis(80));
    broker.enqueue(JobId::new()).await.unwrap();
    let delivery = broker.dequeue().await.unwrap().unwrap();

    for _ in 0..5 {
        assert!(
            tokio::time::timeout(Duration::from_millis(30), broker.dequeue())
                .await
                .is_err(),
            "renewed delivery must not be handed out again"
        );
        broker.extend(&delivery).await.unwrap();
    }

    let redelivered = tokio::time::timeout(Duration::from_secs(2), broker.dequeue())
        .await
        .expect("redelivered once renewals stop")
        .unwrap()
        .unwrap();
    assert_eq!(redelivered.attempt, 2);
    assert!(matches!(
        broker.extend(&delivery).await,
        Err(BrokerError::UnknownDelivery(_))
    ));
    broker.extend(&redelivered).await.unwrap();
}

#[tokio::test]
async fn nack_delays_redelivery() {
    let broker = MemoryBroker::default();
    broker.enqueue(JobId::new()).await.unwrap();
    let delivery = broker.dequeue().await.unwrap().unwrap();
    broker
        .nack(&delivery, Duration::from_millis(50))
        .await
        .unwrap();

    assert!(
        tokio::time::timeout(Duration::from_millis(10), broker.dequeue())
            .await
            .is_err(),
        "nacked message should not be visible yet"
    );
    let again = tokio::time::timeout(Duration::from_secs(2), broker.dequeue())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(again.message_id, delivery.message_id);
    assert_eq!(again.attempt, 2);
}

#[tokio::test]
async fn dequeue_wakes_on_enqueue() {
    let broker = Arc::new(MemoryBroker::default());
    let waiter = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.dequeue().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let job = JobId::new();
    broker.enqueue(job).await.unwrap();

    let delivery = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(delivery.job_id, job);
}

#[tokio::test]
async fn close_releases_waiters_and_rejects_enqueue() {
    let broker = Arc::new(MemoryBroker::default());
    let waiter = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.dequeue().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    broker.close();

    let result = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(result.is_none());
    assert!(matches!(
        broker.enqueue(JobId::new()).await,
        Err(BrokerError::Closed)
    ));
}
