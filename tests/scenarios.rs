use sse_notify::config::Config;
use sse_notify::events;
use sse_notify::manager::{EventManager, ManagerState};
use sse_notify::models::Priority;
use sse_notify::registry::EventRegistry;
use sse_notify::store::memory::MemoryEventStore;
use std::sync::Arc;

fn registry() -> Arc<EventRegistry> {
    let registry = EventRegistry::new();
    events::register_builtin_types(&registry);
    registry.freeze();
    Arc::new(registry)
}

async fn manager(config: Config) -> Arc<EventManager> {
    EventManager::new(config, Arc::new(MemoryEventStore::new()), registry()).await
}

fn notification(title: &str) -> serde_json::Value {
    serde_json::json!({"title": title, "message": "there"})
}

// Scenario A: online single-connection delivery.
#[tokio::test]
async fn online_single_connection_delivery() {
    let manager = manager(Config::default()).await;
    let (_stream_id, mailbox) = manager
        .register_user_stream(42, events::SYSTEM_NOTIFICATION)
        .await
        .unwrap()
        .unwrap();

    let created = manager
        .create_event(
            events::SYSTEM_NOTIFICATION,
            42,
            Priority::Normal,
            Some(60),
            notification("hi"),
        )
        .await
        .unwrap()
        .expect("event should be returned, not dropped");

    assert!(manager.distribute_one().await);

    let delivered = mailbox.try_pop().await.expect("event delivered to mailbox");
    let wire = delivered.to_wire();
    assert_eq!(wire.id, created.id.unwrap());
    assert_eq!(wire.event_type, events::SYSTEM_NOTIFICATION);
    assert_eq!(wire.priority, "NORMAL");
    assert!(!wire.is_recovered);
    assert_eq!(wire.payload["title"], "hi");
    assert_eq!(wire.payload["message"], "there");
}

// Scenario B: offline-then-recover delivers in priority desc / created asc
// order, each marked recovered.
#[tokio::test]
async fn offline_then_recover_orders_by_priority_then_age() {
    let manager = manager(Config::default()).await;

    for (title, priority) in [
        ("a", Priority::Low),
        ("b", Priority::High),
        ("c", Priority::Normal),
    ] {
        manager
            .create_event(events::SYSTEM_NOTIFICATION, 42, priority, None, notification(title))
            .await
            .unwrap();
    }

    let (_stream_id, mailbox) = manager
        .register_user_stream(42, events::SYSTEM_NOTIFICATION)
        .await
        .unwrap()
        .unwrap();

    let contents = mailbox.snapshot().await;
    let titles: Vec<&str> = contents.iter().map(|e| e.payload["title"].as_str().unwrap()).collect();
    assert_eq!(titles, vec!["b", "c", "a"]);
    assert!(contents.iter().all(|e| e.is_recovered));
}

// Scenario C: per-user connection cap eviction keeps the two most recent.
#[test]
fn per_user_cap_eviction_keeps_most_recent() {
    use sse_notify::connection::ConnectionManager;
    use std::collections::HashSet;
    use uuid::Uuid;

    let cm = ConnectionManager::new(2, 100);
    let (s1, _) = cm.add_connection(7, events::SYSTEM_NOTIFICATION);
    std::thread::sleep(std::time::Duration::from_millis(2));
    let (s2, _) = cm.add_connection(7, events::SYSTEM_NOTIFICATION);
    std::thread::sleep(std::time::Duration::from_millis(2));
    let (s3, _) = cm.add_connection(7, events::SYSTEM_NOTIFICATION);

    let streams = cm.get_user_streams(7);
    assert_eq!(streams.len(), 2);
    let ids: HashSet<Uuid> = streams.iter().map(|m| m.stream_id).collect();
    assert!(ids.contains(&s2));
    assert!(ids.contains(&s3));
    assert!(!ids.contains(&s1));
}

// Scenario D: mailbox overflow keeps only the last N writes, in order.
#[tokio::test]
async fn mailbox_overflow_drops_oldest() {
    use sse_notify::connection::Mailbox;
    use sse_notify::models::Event;
    use uuid::Uuid;

    let mailbox = Mailbox::new(Uuid::new_v4(), 3);
    for i in 1..=5 {
        mailbox
            .push(Event::new(
                events::SYSTEM_NOTIFICATION,
                serde_json::json!({"i": i}),
                1,
                Priority::Normal,
                None,
            ))
            .await;
    }

    let contents = mailbox.snapshot().await;
    let values: Vec<i64> = contents.iter().map(|e| e.payload["i"].as_i64().unwrap()).collect();
    assert_eq!(values, vec![3, 4, 5]);
}

// Scenario E: central queue full — distributor never stepped, first two
// creates succeed, the third is dropped from distribution but every row
// still lands in the store.
#[tokio::test]
async fn central_queue_full_drops_only_the_overflow_event() {
    let mut config = Config::default();
    config.max_event_queue_size = 2;
    let manager = manager(config).await;

    manager
        .register_user_stream(9, events::SYSTEM_NOTIFICATION)
        .await
        .unwrap();

    let mut results = Vec::new();
    for i in 0..3 {
        results.push(
            manager
                .create_event(
                    events::SYSTEM_NOTIFICATION,
                    9,
                    Priority::Normal,
                    None,
                    notification(&format!("t{i}")),
                )
                .await
                .unwrap(),
        );
    }

    assert!(results[0].is_some());
    assert!(results[1].is_some());
    assert!(results[2].is_none());
}

// Scenario F: shutdown persists every enqueued row even when the
// distributor was never stepped, and rejects further creation afterward.
#[tokio::test]
async fn shutdown_persists_undelivered_events_and_stops_intake() {
    let manager = manager(Config::default()).await;
    manager
        .register_user_stream(3, events::SYSTEM_NOTIFICATION)
        .await
        .unwrap();

    for i in 0..5 {
        manager
            .create_event(
                events::SYSTEM_NOTIFICATION,
                3,
                Priority::Normal,
                None,
                notification(&format!("t{i}")),
            )
            .await
            .unwrap();
    }

    manager.shutdown().await;
    assert_eq!(manager.state(), ManagerState::Stopped);

    let result = manager
        .create_event(events::SYSTEM_NOTIFICATION, 3, Priority::Normal, None, notification("late"))
        .await;
    assert!(result.is_err());
}

// Invariant 6: recovering the same user repeatedly re-materialises the
// same unread set without duplicating store rows.
#[tokio::test]
async fn recovery_is_idempotent_across_reconnects() {
    let manager = manager(Config::default()).await;
    manager
        .create_event(events::SYSTEM_NOTIFICATION, 11, Priority::Normal, None, notification("x"))
        .await
        .unwrap();

    let (s1, mailbox1) = manager
        .register_user_stream(11, events::SYSTEM_NOTIFICATION)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mailbox1.snapshot().await.len(), 1);
    manager.unregister_user_stream(11, s1);

    let (s2, mailbox2) = manager
        .register_user_stream(11, events::SYSTEM_NOTIFICATION)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mailbox2.snapshot().await.len(), 1);
    manager.unregister_user_stream(11, s2);

    assert_eq!(manager.fetch_unread(11).await.unwrap().len(), 1);
}

// Invariant 7: concurrent double-shutdown is safe and equivalent to one call.
#[tokio::test]
async fn concurrent_double_shutdown_is_safe() {
    let manager = manager(Config::default()).await;
    let a = manager.clone();
    let b = manager.clone();

    let (r1, r2) = tokio::join!(
        tokio::spawn(async move { a.shutdown().await }),
        tokio::spawn(async move { b.shutdown().await }),
    );
    r1.unwrap();
    r2.unwrap();

    assert_eq!(manager.state(), ManagerState::Stopped);
}
