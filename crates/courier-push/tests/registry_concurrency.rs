use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::SystemTime;

use courier_push::{Dispatcher, Envelope, EventKind, Listener, Registry};
use serde_json::Value;

fn envelope(topic: &str) -> Envelope {
    Envelope {
        topic: topic.to_string(),
        kind: EventKind::DashboardUpdate,
        message: String::new(),
        payload: Value::Null,
        timestamp: SystemTime::now(),
    }
}

#[test]
fn dispatch_races_with_subscribe_and_unsubscribe() {
    let registry = Arc::new(Registry::new());
    let dispatcher = Dispatcher::new(registry.clone());
    let stable_hits = Arc::new(AtomicUsize::new(0));
    {
        let hits = stable_hits.clone();
        registry.insert(
            "/topic/dashboard-updates",
            Arc::new(move |_: &Envelope| {
                hits.fetch_add(1, Ordering::SeqCst);
            }),
        );
    }

    let churners: Vec<_> = (0..4)
        .map(|_| {
            let registry = registry.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    let listener: Listener = Arc::new(|_: &Envelope| {});
                    let registration = registry.insert("/topic/dashboard-updates", listener);
                    registry.remove(&registration.handle);
                }
            })
        })
        .collect();

    let deliveries = 2_000;
    let delivering = {
        let dispatcher = dispatcher.clone();
        thread::spawn(move || {
            for _ in 0..deliveries {
                assert!(dispatcher.deliver(&envelope("/topic/dashboard-updates")) >= 1);
            }
        })
    };

    for churner in churners {
        churner.join().expect("churner");
    }
    delivering.join().expect("dispatcher");

    assert_eq!(stable_hits.load(Ordering::SeqCst), deliveries);
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.topics(), vec!["/topic/dashboard-updates"]);
}

#[test]
fn listener_can_unsubscribe_itself_during_dispatch() {
    let registry = Arc::new(Registry::new());
    let dispatcher = Dispatcher::new(registry.clone());
    let calls = Arc::new(AtomicUsize::new(0));

    let handle_slot: Arc<parking_lot::Mutex<Option<courier_push::SubscriptionHandle>>> =
        Arc::default();
    let listener: Listener = {
        let registry = registry.clone();
        let slot = handle_slot.clone();
        let calls = calls.clone();
        Arc::new(move |_: &Envelope| {
            calls.fetch_add(1, Ordering::SeqCst);
            if let Some(handle) = slot.lock().take() {
                registry.remove(&handle);
            }
        })
    };
    let registration = registry.insert("/topic/messages", listener);
    *handle_slot.lock() = Some(registration.handle);

    assert_eq!(dispatcher.deliver(&envelope("/topic/messages")), 1);
    assert_eq!(dispatcher.deliver(&envelope("/topic/messages")), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(registry.is_empty());
}
