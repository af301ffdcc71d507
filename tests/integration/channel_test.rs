use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::time::Duration;

use lapin::options::{
    ExchangeBindOptions, ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions,
    QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::FieldTable;
use lapin::ExchangeKind;
use sync_rabbitmq::rabbitmq::{
    CloseState, ManagedChannel, ManagedConnection, QueueDeclareOk, RabbitMQError, Result,
    SyncOptions,
};

use crate::fake_broker::{FakeBroker, FakeConnection, PARAMS};

fn open(
    broker: &FakeBroker,
    options: SyncOptions,
) -> (ManagedConnection<FakeConnection>, ManagedChannel<FakeConnection>) {
    let connection = ManagedConnection::connect(broker.connector(), options).unwrap();
    let channel = connection.open_channel().unwrap();
    (connection, channel)
}

fn durable() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    }
}

#[test]
fn test_connect_open_declare_poll_counts() {
    let broker = FakeBroker::new();

    let connection = ManagedConnection::connect(broker.connector(), SyncOptions::default()).unwrap();
    assert_eq!(broker.polls(), 1);

    let channel = connection.open_channel().unwrap();
    assert_eq!(broker.polls(), 2);

    let declared = channel
        .queue_declare("q1", durable(), FieldTable::default())
        .unwrap();
    assert_eq!(broker.polls(), 3);
    assert_eq!(
        declared,
        QueueDeclareOk {
            queue: "q1".to_string(),
            message_count: 0,
            consumer_count: 0,
        }
    );
    assert!(broker.requests().contains(&"queue.declare q1 durable=true".to_string()));
}

fn assert_waits_for_reply(broker: &FakeBroker, operation: &str, step: impl FnOnce() -> Result<()>) {
    let before = broker.polls();
    step().unwrap();

    assert_eq!(broker.polls(), before + 3, "{operation} returned early or late");
    assert_eq!(broker.completed().last().map(String::as_str), Some(operation));
}

#[test]
fn test_each_operation_returns_only_after_its_reply() {
    let broker = FakeBroker::new();
    let (_connection, channel) = open(&broker, SyncOptions::default());
    broker.set_latency(2);

    assert_waits_for_reply(&broker, "exchange.declare", || {
        channel.exchange_declare(
            "ex",
            ExchangeKind::Topic,
            ExchangeDeclareOptions::default(),
            FieldTable::default(),
        )
    });
    assert_waits_for_reply(&broker, "queue.declare", || {
        channel
            .queue_declare("q1", durable(), FieldTable::default())
            .map(|_| ())
    });
    assert_waits_for_reply(&broker, "queue.bind", || {
        channel.queue_bind(
            "q1",
            "ex",
            "orders.*",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
    });
    assert_waits_for_reply(&broker, "exchange.bind", || {
        channel.exchange_bind(
            "ex-copy",
            "ex",
            "#",
            ExchangeBindOptions::default(),
            FieldTable::default(),
        )
    });
    assert_waits_for_reply(&broker, "queue.delete", || {
        channel
            .queue_delete("q1", QueueDeleteOptions::default())
            .map(|_| ())
    });
    assert_waits_for_reply(&broker, "exchange.delete", || {
        channel.exchange_delete("ex", ExchangeDeleteOptions::default())
    });
}

#[test]
fn test_arguments_pass_through() {
    let broker = FakeBroker::new();
    let (_connection, channel) = open(&broker, SyncOptions::default());

    channel
        .exchange_declare(
            "ex",
            ExchangeKind::Fanout,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .unwrap();
    channel
        .queue_bind("q1", "ex", "rk", QueueBindOptions::default(), FieldTable::default())
        .unwrap();
    channel
        .exchange_bind("dst", "src", "rk", ExchangeBindOptions::default(), FieldTable::default())
        .unwrap();
    channel
        .queue_delete(
            "q1",
            QueueDeleteOptions {
                if_empty: true,
                ..QueueDeleteOptions::default()
            },
        )
        .unwrap();

    let requests = broker.requests();
    for expected in [
        "exchange.declare ex Fanout durable=true",
        "queue.bind q1 ex rk",
        "exchange.bind dst src rk",
        "queue.delete q1 if_empty=true",
    ] {
        assert!(requests.contains(&expected.to_string()), "missing {expected}");
    }
}

#[test]
fn test_declare_and_delete_report_broker_counts() {
    let broker = FakeBroker::new();
    let (_connection, channel) = open(&broker, SyncOptions::default());
    broker.stage_queue("jobs", 12, 3);

    let declared = channel
        .queue_declare("jobs", QueueDeclareOptions::default(), FieldTable::default())
        .unwrap();
    assert_eq!(declared.message_count, 12);
    assert_eq!(declared.consumer_count, 3);

    let removed = channel
        .queue_delete("jobs", QueueDeleteOptions::default())
        .unwrap();
    assert_eq!(removed, 12);
}

#[test]
fn test_connection_forced_during_declare() {
    let broker = FakeBroker::new();
    let (_connection, channel) = open(&broker, SyncOptions::default());
    broker.hold_replies(true);
    broker.schedule_connection_close(320, "CONNECTION_FORCED");
    let before = broker.polls();

    let err = channel
        .queue_declare("q1", durable(), FieldTable::default())
        .unwrap_err();

    let message = err.to_string();
    assert!(message.contains("320"), "{message}");
    assert!(message.contains("CONNECTION_FORCED"), "{message}");
    assert!(matches!(err, RabbitMQError::ConnectionClosed { .. }));
    assert_eq!(broker.polls(), before + 1);
}

#[test]
fn test_channel_close_during_declare_names_channel() {
    let broker = FakeBroker::new();
    let (connection, channel) = open(&broker, SyncOptions::default());
    broker.hold_replies(true);
    broker.schedule_channel_close(1, 406, "PRECONDITION_FAILED");

    let err = channel
        .exchange_declare(
            "ex",
            ExchangeKind::Direct,
            ExchangeDeclareOptions::default(),
            FieldTable::default(),
        )
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        format!("Channel 1 belongs to connection {PARAMS} closed (406) PRECONDITION_FAILED")
    );
    assert!(connection.is_open());
    assert!(matches!(channel.state(), CloseState::ClosedUnexpectedly(_)));

    // A dead channel refuses further work without touching the loop.
    let polls = broker.polls();
    assert!(channel
        .queue_declare("q1", durable(), FieldTable::default())
        .is_err());
    assert_eq!(broker.polls(), polls);
}

#[test]
fn test_sibling_channel_close_aborts_blocked_call() {
    let broker = FakeBroker::new();
    let (connection, first) = open(&broker, SyncOptions::default());
    let second = connection.open_channel().unwrap();
    broker.hold_replies(true);
    broker.schedule_channel_close(2, 406, "PRECONDITION_FAILED");
    let before = broker.polls();

    let err = first
        .queue_declare("q1", durable(), FieldTable::default())
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        format!("Channel 2 belongs to connection {PARAMS} closed (406) PRECONDITION_FAILED")
    );
    assert_eq!(broker.polls(), before + 1);
    assert!(first.is_open());
    assert!(matches!(second.state(), CloseState::ClosedUnexpectedly(_)));

    // The surviving channel keeps working once the broker answers again.
    broker.hold_replies(false);
    broker.release_held();
    let declared = first
        .queue_declare("q2", durable(), FieldTable::default())
        .unwrap();
    assert_eq!(declared.queue, "q2");
}

#[test]
fn test_normal_close_does_not_wake_pending_call() {
    let broker = FakeBroker::new();
    let limit = Duration::from_millis(40);
    let (connection, channel) = open(&broker, SyncOptions::with_timeout(limit));
    broker.hold_replies(true);
    broker.schedule_connection_close(0, "");

    let result = channel.queue_declare("q1", durable(), FieldTable::default());

    assert!(matches!(result, Err(RabbitMQError::Timeout(d)) if d == limit));
    assert_eq!(connection.state(), CloseState::ClosedNormally);
}

#[test]
fn test_late_reply_after_timeout_is_discarded() {
    let broker = FakeBroker::new();
    let (_connection, channel) = open(&broker, SyncOptions::with_timeout(Duration::from_millis(20)));
    broker.hold_replies(true);

    assert!(channel
        .queue_declare("slow", durable(), FieldTable::default())
        .is_err());

    broker.hold_replies(false);
    broker.release_held();
    let declared = channel
        .queue_declare("fast", durable(), FieldTable::default())
        .unwrap();
    assert_eq!(declared.queue, "fast");
}

#[test]
fn test_stop_consuming_cancels_tracked_tags() {
    let broker = FakeBroker::new();
    let (_connection, channel) = open(&broker, SyncOptions::default());

    assert!(channel.track_consumer("ctag-a"));
    assert!(channel.track_consumer("ctag-b"));
    assert!(channel.track_consumer("ctag-c"));
    assert!(channel.forget_consumer("ctag-b"));

    let issued = channel.stop_consuming();

    let cancelled: HashSet<String> = broker.cancelled().into_iter().collect();
    let expected: HashSet<String> = ["ctag-a", "ctag-c"].iter().map(|s| s.to_string()).collect();
    assert_eq!(issued, 2);
    assert_eq!(cancelled, expected);
    assert!(channel.consumer_tags().is_empty());

    assert_eq!(channel.stop_consuming(), 0);
    assert_eq!(broker.cancelled().len(), 2);
}

#[test]
fn test_reentrant_call_is_rejected() {
    let broker = FakeBroker::new();
    let (_connection, channel) = open(&broker, SyncOptions::default());
    let channel = Rc::new(channel);

    let nested = Rc::new(RefCell::new(None));
    let inner = Rc::clone(&channel);
    let slot = Rc::clone(&nested);
    broker.push_event(move || {
        let result = inner.queue_declare("nested", durable(), FieldTable::default());
        *slot.borrow_mut() = Some(result);
    });

    channel
        .exchange_declare(
            "ex",
            ExchangeKind::Direct,
            ExchangeDeclareOptions::default(),
            FieldTable::default(),
        )
        .unwrap();

    let nested = nested.borrow_mut().take().expect("nested call ran");
    assert!(matches!(nested, Err(RabbitMQError::OperationInFlight)));
}

#[test]
fn test_channel_outliving_connection() {
    let broker = FakeBroker::new();
    let (connection, channel) = open(&broker, SyncOptions::default());
    drop(connection);

    let result = channel.queue_declare("q1", durable(), FieldTable::default());
    assert!(matches!(result, Err(RabbitMQError::ConnectionDropped)));
}

#[test]
fn test_channel_close_then_reuse() {
    let broker = FakeBroker::new();
    let (connection, channel) = open(&broker, SyncOptions::default());
    channel.track_consumer("ctag-left-over");

    channel.close().unwrap();

    assert_eq!(channel.state(), CloseState::ClosedNormally);
    assert!(channel.consumer_tags().is_empty());
    assert!(broker
        .requests()
        .contains(&"channel.close 1 200 Normal shutdown".to_string()));
    assert!(matches!(
        channel.exchange_delete("ex", ExchangeDeleteOptions::default()),
        Err(RabbitMQError::AlreadyClosed(_))
    ));
    assert!(connection.is_open());
}
