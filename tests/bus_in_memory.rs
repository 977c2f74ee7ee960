//! End-to-end bus tests over the in-memory transport.
//!
//! Exercises the full pipeline - receive, decode, handler fan-out,
//! ack/nack, backoff, redelivery - without external infrastructure.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use herald::{
    Bus, FixedBackoff, HandlerError, HandlerRegistry, InMemoryQueue, ListenerConfig, Monitor,
    QueueTransport, RecordingMonitor, SerializationRegister,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderAccepted {
    order_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderCancelled {
    order_id: String,
    reason: String,
}

fn serialization() -> SerializationRegister {
    let mut register = SerializationRegister::new();
    register.register::<OrderAccepted>("OrderAccepted");
    register.register::<OrderCancelled>("OrderCancelled");
    register
}

fn fast_listener() -> ListenerConfig {
    ListenerConfig::default().with_wait_time(Duration::from_millis(20))
}

async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn successful_messages_are_deleted_exactly_once() {
    let handled = Arc::new(AtomicUsize::new(0));
    let mut handlers = HandlerRegistry::new();
    {
        let handled = Arc::clone(&handled);
        handlers.add_fn::<OrderAccepted, _, _>(move |_order| {
            let handled = Arc::clone(&handled);
            async move {
                handled.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
        });
    }

    let queue = Arc::new(InMemoryQueue::new("orders"));
    let monitor = Arc::new(RecordingMonitor::new());
    let bus = Bus::builder()
        .serialization(serialization())
        .handlers(handlers)
        .monitor(Arc::clone(&monitor) as Arc<dyn Monitor>)
        .listener_config(fast_listener())
        .subscribe(Arc::clone(&queue) as Arc<dyn QueueTransport>)
        .build();

    bus.start().await.unwrap();
    for i in 0..3 {
        queue
            .send("OrderAccepted", format!(r#"{{"order_id":"o-{}"}}"#, i))
            .await;
    }

    assert!(
        wait_until(
            || handled.load(Ordering::SeqCst) == 3,
            Duration::from_secs(2)
        )
        .await
    );
    bus.stop().await;

    assert_eq!(queue.deleted_count().await, 3);
    assert_eq!(queue.visibility_change_count().await, 0);
    assert_eq!(monitor.handled_count(), 3);
    assert_eq!(monitor.failed_count(), 0);
}

#[tokio::test]
async fn failed_messages_are_nacked_with_the_configured_backoff() {
    let mut handlers = HandlerRegistry::new();
    handlers.add_fn::<OrderAccepted, _, _>(|_order| async {
        Err(HandlerError::failed("boom"))
    });

    let errors = Arc::new(Mutex::new(Vec::new()));
    let queue = Arc::new(InMemoryQueue::new("orders"));
    let monitor = Arc::new(RecordingMonitor::new());
    let bus = {
        let errors = Arc::clone(&errors);
        Bus::builder()
            .serialization(serialization())
            .handlers(handlers)
            .backoff(FixedBackoff(Duration::from_secs(240)))
            .monitor(Arc::clone(&monitor) as Arc<dyn Monitor>)
            .on_error(move |cause, raw| {
                errors
                    .lock()
                    .unwrap()
                    .push((cause.is_some(), raw.message_id.clone()));
            })
            .listener_config(fast_listener())
            .subscribe(Arc::clone(&queue) as Arc<dyn QueueTransport>)
            .build()
    };

    bus.start().await.unwrap();
    let message_id = queue.send("OrderAccepted", r#"{"order_id":"o-1"}"#).await;

    {
        let errors = Arc::clone(&errors);
        assert!(
            wait_until(
                move || !errors.lock().unwrap().is_empty(),
                Duration::from_secs(2)
            )
            .await
        );
    }
    bus.stop().await;

    assert_eq!(queue.deleted_count().await, 0);
    let changes = queue.visibility_changes().await;
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].1, Duration::from_secs(240));
    assert_eq!(*errors.lock().unwrap(), vec![(true, message_id)]);
    assert_eq!(monitor.failed_count(), 1);
}

#[tokio::test]
async fn nacked_messages_redeliver_and_eventually_succeed() {
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let mut handlers = HandlerRegistry::new();
    {
        let attempts = Arc::clone(&attempts);
        handlers.add_fn::<OrderAccepted, _, _>(move |_order| {
            let attempts = Arc::clone(&attempts);
            async move {
                let context = herald::context::current()
                    .ok_or_else(|| HandlerError::failed("no ambient context"))?;
                let attempt = context.message.receive_count;
                attempts.lock().unwrap().push(attempt);
                Ok(attempt >= 3)
            }
        });
    }

    let queue = Arc::new(InMemoryQueue::new("orders"));
    let monitor = Arc::new(RecordingMonitor::new());
    let bus = Bus::builder()
        .serialization(serialization())
        .handlers(handlers)
        .backoff(FixedBackoff(Duration::from_millis(30)))
        .monitor(Arc::clone(&monitor) as Arc<dyn Monitor>)
        .listener_config(fast_listener())
        .subscribe(Arc::clone(&queue) as Arc<dyn QueueTransport>)
        .build();

    bus.start().await.unwrap();
    queue.send("OrderAccepted", r#"{"order_id":"o-1"}"#).await;

    {
        let queue = Arc::clone(&queue);
        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.deleted_count().await < 1 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
    bus.stop().await;

    assert_eq!(*attempts.lock().unwrap(), vec![1, 2, 3]);
    assert_eq!(queue.deleted_count().await, 1);
    assert_eq!(monitor.failed_count(), 2);
    assert_eq!(monitor.handled_count(), 1);
}

#[tokio::test]
async fn undecodable_messages_do_not_stop_the_listener() {
    let handled = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicUsize::new(0));
    let mut handlers = HandlerRegistry::new();
    {
        let handled = Arc::clone(&handled);
        handlers.add_fn::<OrderAccepted, _, _>(move |_order| {
            let handled = Arc::clone(&handled);
            async move {
                handled.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
        });
    }

    let queue = Arc::new(InMemoryQueue::new("orders"));
    let bus = {
        let errors = Arc::clone(&errors);
        Bus::builder()
            .serialization(serialization())
            .handlers(handlers)
            .on_error(move |cause, _raw| {
                assert!(cause.is_some());
                errors.fetch_add(1, Ordering::SeqCst);
            })
            .listener_config(fast_listener())
            .subscribe(Arc::clone(&queue) as Arc<dyn QueueTransport>)
            .build()
    };

    bus.start().await.unwrap();
    // A subject nobody registered, then a healthy message behind it.
    queue.send("NeverRegistered", "{}").await;
    queue.send("OrderAccepted", r#"{"order_id":"o-2"}"#).await;

    assert!(
        wait_until(
            || handled.load(Ordering::SeqCst) == 1 && errors.load(Ordering::SeqCst) == 1,
            Duration::from_secs(2)
        )
        .await
    );
    bus.stop().await;

    assert_eq!(queue.deleted_count().await, 1);
    assert_eq!(queue.visibility_change_count().await, 1);
}

#[tokio::test]
async fn concurrent_dispatches_observe_their_own_context() {
    let mismatches = Arc::new(AtomicUsize::new(0));
    let processed = Arc::new(AtomicUsize::new(0));
    let mut handlers = HandlerRegistry::new();
    {
        let mismatches = Arc::clone(&mismatches);
        let processed = Arc::clone(&processed);
        handlers.add_fn::<OrderAccepted, _, _>(move |_order| {
            let mismatches = Arc::clone(&mismatches);
            let processed = Arc::clone(&processed);
            async move {
                let context = herald::context::current()
                    .ok_or_else(|| HandlerError::failed("no ambient context"))?;
                tokio::time::sleep(Duration::from_millis(20)).await;
                if context.message.subject.as_deref() != Some("OrderAccepted") {
                    mismatches.fetch_add(1, Ordering::SeqCst);
                }
                processed.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
        });
    }
    {
        let mismatches = Arc::clone(&mismatches);
        let processed = Arc::clone(&processed);
        handlers.add_fn::<OrderCancelled, _, _>(move |_order| {
            let mismatches = Arc::clone(&mismatches);
            let processed = Arc::clone(&processed);
            async move {
                let context = herald::context::current()
                    .ok_or_else(|| HandlerError::failed("no ambient context"))?;
                tokio::time::sleep(Duration::from_millis(20)).await;
                if context.message.subject.as_deref() != Some("OrderCancelled") {
                    mismatches.fetch_add(1, Ordering::SeqCst);
                }
                processed.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
        });
    }

    let queue = Arc::new(InMemoryQueue::new("orders"));
    let bus = Bus::builder()
        .serialization(serialization())
        .handlers(handlers)
        .listener_config(fast_listener())
        .subscribe(Arc::clone(&queue) as Arc<dyn QueueTransport>)
        .build();

    bus.start().await.unwrap();
    for i in 0..4 {
        queue
            .send("OrderAccepted", format!(r#"{{"order_id":"o-{}"}}"#, i))
            .await;
        queue
            .send(
                "OrderCancelled",
                format!(r#"{{"order_id":"o-{}","reason":"test"}}"#, i),
            )
            .await;
    }

    assert!(
        wait_until(
            || processed.load(Ordering::SeqCst) == 8,
            Duration::from_secs(2)
        )
        .await
    );
    bus.stop().await;

    assert_eq!(mismatches.load(Ordering::SeqCst), 0);
    assert_eq!(queue.deleted_count().await, 8);
}

#[tokio::test]
async fn stop_drains_before_returning() {
    let started_handling = Arc::new(AtomicUsize::new(0));
    let mut handlers = HandlerRegistry::new();
    {
        let started_handling = Arc::clone(&started_handling);
        handlers.add_fn::<OrderAccepted, _, _>(move |_order| {
            let started_handling = Arc::clone(&started_handling);
            async move {
                started_handling.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(true)
            }
        });
    }

    let queue = Arc::new(InMemoryQueue::new("orders"));
    let bus = Bus::builder()
        .serialization(serialization())
        .handlers(handlers)
        .listener_config(fast_listener())
        .subscribe(Arc::clone(&queue) as Arc<dyn QueueTransport>)
        .build();

    bus.start().await.unwrap();
    queue.send("OrderAccepted", r#"{"order_id":"o-1"}"#).await;

    assert!(
        wait_until(
            || started_handling.load(Ordering::SeqCst) == 1,
            Duration::from_secs(2)
        )
        .await
    );

    // stop() cancels the dispatch cooperatively and still returns cleanly;
    // the un-acked message stays in flight for natural redelivery.
    bus.stop().await;

    assert_eq!(queue.deleted_count().await + queue.in_flight_len().await, 1);
}
