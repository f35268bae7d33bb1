mod common;

use common::{build_broker, get_test_config, OrderCreatedEvent};
use resilient_kafka::kafka::headers::{EVENT_OCCURRED, MESSAGE_ID, MESSAGE_TYPE, TRACE_CONTEXT};
use resilient_kafka::kafka::{JsonSerializer, MessageHeaders};
use resilient_kafka::outbox::{InMemoryOutbox, OutboxRecord, OutboxStore};
use resilient_kafka::{Envelope, Error};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const TOPIC: &str = "test_order_created";

fn stage(outbox: &InMemoryOutbox, count: u64) -> Vec<OutboxRecord> {
    (0..count)
        .map(|order_id| {
            let envelope = Envelope::new(OrderCreatedEvent { order_id }).with_trace_context("0000000000000001");
            outbox.add(TOPIC, &envelope).unwrap()
        })
        .collect()
}

#[tokio::test]
async fn test_batch_is_published_in_order_then_deleted() {
    let test = build_broker(get_test_config());
    let outbox = Arc::new(InMemoryOutbox::new());
    let staged = stage(&outbox, 3);
    let dispatcher = test.broker.outbox_dispatcher(Arc::clone(&outbox) as Arc<dyn OutboxStore>);

    let published = dispatcher.dispatch_batch().await.unwrap();

    assert_eq!(published, 3);
    assert!(outbox.is_empty());

    let records = test.publishers.records_for(TOPIC);
    assert_eq!(records.len(), 3);
    for (sent, record) in records.iter().zip(&staged) {
        assert_eq!(sent.payload, record.message.as_bytes());
        assert_ne!(sent.key, record.id.as_bytes().to_vec());
        assert_eq!(sent.headers.get(MESSAGE_ID), Some(&record.id.as_bytes()[..]));
        assert_eq!(sent.headers.get_str(MESSAGE_TYPE), Some("OrderCreatedEvent"));
        assert_eq!(sent.headers.get_str(TRACE_CONTEXT), Some("0000000000000001"));

        let envelope: Envelope<OrderCreatedEvent> = JsonSerializer::deserialize(&sent.payload).unwrap();
        assert_eq!(envelope.id, record.id);
    }
}

#[tokio::test]
async fn test_relayed_message_keeps_envelope_occurrence_time() {
    let test = build_broker(get_test_config());
    let outbox = Arc::new(InMemoryOutbox::new());
    let mut envelope = Envelope::new(OrderCreatedEvent { order_id: 42 });
    envelope.occurred_at = envelope.occurred_at - chrono::Duration::hours(1);
    let staged = outbox.add(TOPIC, &envelope).unwrap();
    assert!(staged.created_at > envelope.occurred_at);

    let dispatcher = test.broker.outbox_dispatcher(Arc::clone(&outbox) as Arc<dyn OutboxStore>);
    dispatcher.dispatch_batch().await.unwrap();

    let sent = &test.publishers.records_for(TOPIC)[0];
    let direct = MessageHeaders::for_envelope(&envelope);
    assert_eq!(sent.headers.get_str(EVENT_OCCURRED), direct.get_str(EVENT_OCCURRED));
    assert_eq!(sent.headers, direct);
}

#[tokio::test]
async fn test_empty_outbox_publishes_nothing() {
    let test = build_broker(get_test_config());
    let outbox = Arc::new(InMemoryOutbox::new());
    let dispatcher = test.broker.outbox_dispatcher(outbox);

    assert_eq!(dispatcher.dispatch_batch().await.unwrap(), 0);
    assert!(test.publishers.records().is_empty());
}

#[tokio::test]
async fn test_failed_publish_keeps_whole_batch_for_next_cycle() {
    let test = build_broker(get_test_config());
    let outbox = Arc::new(InMemoryOutbox::new());
    let staged = stage(&outbox, 5);
    let dispatcher = test.broker.outbox_dispatcher(Arc::clone(&outbox) as Arc<dyn OutboxStore>);

    test.publishers.fail_nth_send(3);
    let err = dispatcher.dispatch_batch().await.unwrap_err();

    assert!(matches!(err, Error::Delivery { .. }));
    assert_eq!(outbox.len(), 5);
    assert_eq!(test.publishers.records().len(), 2);

    test.publishers.clear();
    assert_eq!(dispatcher.dispatch_batch().await.unwrap(), 5);
    assert!(outbox.is_empty());

    let ids: Vec<_> = test
        .publishers
        .records()
        .iter()
        .map(|sent| sent.headers.get(MESSAGE_ID).unwrap().to_vec())
        .collect();
    let expected: Vec<_> = staged.iter().map(|record| record.id.as_bytes().to_vec()).collect();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn test_batches_are_bounded_by_page_size() {
    let test = build_broker(get_test_config());
    let outbox = Arc::new(InMemoryOutbox::new());
    stage(&outbox, 15);
    let dispatcher = test.broker.outbox_dispatcher(Arc::clone(&outbox) as Arc<dyn OutboxStore>);

    assert_eq!(dispatcher.dispatch_batch().await.unwrap(), 10);
    assert_eq!(outbox.len(), 5);
    assert_eq!(dispatcher.dispatch_batch().await.unwrap(), 5);
    assert!(outbox.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_run_recovers_after_failed_cycle() {
    let test = build_broker(get_test_config());
    let outbox = Arc::new(InMemoryOutbox::new());
    stage(&outbox, 3);
    test.publishers.fail_nth_send(1);

    let cancel = CancellationToken::new();
    let task = test
        .broker
        .outbox_dispatcher(Arc::clone(&outbox) as Arc<dyn OutboxStore>)
        .spawn(cancel.clone());

    test.publishers.wait_for_records(3).await;
    tokio::time::timeout(Duration::from_secs(10), async {
        while !outbox.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("outbox was not drained");

    cancel.cancel();
    task.await.unwrap().unwrap();
    assert_eq!(test.publishers.records().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_run_stops_on_cancel() {
    let test = build_broker(get_test_config());
    let cancel = CancellationToken::new();
    let task = test
        .broker
        .outbox_dispatcher(Arc::new(InMemoryOutbox::new()))
        .spawn(cancel.clone());

    tokio::time::sleep(Duration::from_millis(350)).await;
    cancel.cancel();

    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("dispatcher did not stop")
        .unwrap()
        .unwrap();
}
