mod common;

use common::{Order, STREAM, collect_errors, connected, connection, within};

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use nix::sys::signal::{Signal, raise};
use parking_lot::Mutex;
use proven_pubsub::handler::from_fn;
use proven_pubsub::shutdown::DEFAULT_FAULT_EXIT_CODE;
use proven_pubsub::{ConsumerOptions, ConsumerState, Liveness, MessageEnvelope};
use proven_pubsub_memory::MemoryBroker;
use serial_test::serial;

#[tokio::test]
#[serial]
async fn test_exit_closes_connection_and_cancels_consumers() {
    let broker = MemoryBroker::new();
    let connection = connected(&broker).await;
    let consumer = connection
        .create_consumer::<Order>(STREAM, ConsumerOptions::default())
        .expect("Failed to create consumer");
    consumer.subscribe(None).expect("Failed to subscribe");

    let hooks = connection
        .register_shutdown_hooks(None)
        .expect("Failed to register hooks");

    assert_eq!(within(hooks.exit()).await, 0);
    within(consumer.stopped()).await;

    assert_eq!(connection.liveness(), Liveness::Closed);
    assert!(connection.cancellation_token().is_cancelled());
    assert_eq!(consumer.state(), ConsumerState::Stopped);
}

#[tokio::test]
#[serial]
async fn test_user_signal_triggers_shutdown() {
    let broker = MemoryBroker::new();
    let connection = connected(&broker).await;
    let hooks = connection
        .register_shutdown_hooks(None)
        .expect("Failed to register hooks");

    raise(Signal::SIGUSR1).expect("Failed to raise signal");

    assert_eq!(within(hooks.wait()).await, 0);
    assert!(!connection.is_enabled());
    assert!(connection.cancellation_token().is_cancelled());
}

#[tokio::test]
#[serial]
async fn test_uncaught_panic_records_exit_code() {
    let broker = MemoryBroker::new();
    let connection = connected(&broker).await;
    let hooks = connection
        .register_shutdown_hooks(Some(7))
        .expect("Failed to register hooks");

    let result: Result<(), _> = tokio::spawn(async { panic!("unrecoverable") }).await;
    assert!(result.is_err());

    assert_eq!(within(hooks.wait()).await, 7);
    assert!(!connection.is_enabled());
}

#[tokio::test]
#[serial]
async fn test_uncaught_panic_uses_default_exit_code() {
    let broker = MemoryBroker::new();
    let connection = connected(&broker).await;
    let hooks = connection
        .register_shutdown_hooks(None)
        .expect("Failed to register hooks");

    let result: Result<(), _> = tokio::spawn(async { panic!("unrecoverable") }).await;
    assert!(result.is_err());

    assert_eq!(within(hooks.wait()).await, DEFAULT_FAULT_EXIT_CODE);
}

#[tokio::test]
#[serial]
async fn test_observer_panic_is_not_an_uncaught_fault() {
    let broker = MemoryBroker::new();
    let connection = connected(&broker).await;
    broker.publish_raw(STREAM, r#"{"bar":1}"#);
    broker.publish_raw(STREAM, r#"{"bar":2}"#);

    let hooks = connection
        .register_shutdown_hooks(None)
        .expect("Failed to register hooks");

    let consumer = connection
        .create_consumer::<Order>(STREAM, ConsumerOptions::default())
        .expect("Failed to create consumer");
    let errors = collect_errors(&consumer);
    let handled = Arc::new(Mutex::new(Vec::new()));
    let sink = handled.clone();
    consumer.on_message(from_fn(move |envelope: MessageEnvelope<Order>| {
        assert_ne!(envelope.data().bar, 1, "first order is poisoned");
        sink.lock().push(envelope.data().bar);
        Ok(())
    }));

    consumer.subscribe(None).expect("Failed to subscribe");
    broker.terminate_stream(STREAM);
    within(consumer.stopped()).await;

    assert_eq!(*handled.lock(), vec![2]);
    assert_eq!(errors.lock().len(), 1);
    assert!(connection.is_enabled());
    assert!(!connection.cancellation_token().is_cancelled());
    assert_eq!(hooks.exit_code(), 0);

    assert_eq!(within(hooks.exit()).await, 0);
}

#[tokio::test]
#[serial]
async fn test_hooks_after_reconnect_keep_process_running() {
    let broker = MemoryBroker::new();
    let connection = connected(&broker).await;

    broker.close_connections();
    within(async {
        while connection.is_enabled() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    connection.connect().await.expect("Failed to reconnect");

    let hooks = connection
        .register_shutdown_hooks(None)
        .expect("Failed to register hooks");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(connection.is_enabled());
    assert!(!connection.cancellation_token().is_cancelled());

    assert_eq!(within(hooks.exit()).await, 0);
    assert_eq!(connection.liveness(), Liveness::Closed);
}

#[tokio::test]
#[serial]
async fn test_exit_restores_previous_panic_hook() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    std::panic::set_hook(Box::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let broker = MemoryBroker::new();
    let connection = connected(&broker).await;
    let hooks = connection
        .register_shutdown_hooks(Some(7))
        .expect("Failed to register hooks");
    assert_eq!(within(hooks.exit()).await, 0);

    let result: Result<(), _> = tokio::spawn(async { panic!("after shutdown") }).await;
    assert!(result.is_err());

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let _ = std::panic::take_hook();
}

#[test]
#[serial]
#[should_panic]
fn test_register_outside_runtime_panics() {
    let broker = MemoryBroker::new();
    let connection = connection(&broker, true);

    let _ = connection.register_shutdown_hooks(None);
}
