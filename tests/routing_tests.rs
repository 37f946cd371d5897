use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use event_routing::adapters::{InMemoryBroker, InMemoryEntityStore};
use event_routing::domain::services::{event_queue_name, queue_name};
use event_routing::{
    CallbackManager, ConsumerMetrics, DispatchError, DispatchResult, EntityStore, EventBus,
    EventBusOptions, EventContext, FnCallback, HandlerRegistry, ModelRegistry, PublishOptions,
    QueueMode, RetryPolicy, RoutingKey, RoutingTable, SubscriptionInitializer,
};

const SERVICE: &str = "catalog-service";
const EXCHANGE: &str = "mu.events";

struct Harness {
    broker: Arc<InMemoryBroker>,
    bus: Arc<EventBus>,
    store: Arc<InMemoryEntityStore>,
    initializer: SubscriptionInitializer,
}

fn harness(routing: &str, registry: HandlerRegistry, strict: bool, queue_mode: QueueMode) -> Harness {
    harness_with(routing, registry, strict, queue_mode, EventBusOptions::default())
}

fn harness_with(
    routing: &str,
    registry: HandlerRegistry,
    strict: bool,
    queue_mode: QueueMode,
    options: EventBusOptions,
) -> Harness {
    let broker = Arc::new(InMemoryBroker::new());
    let store = Arc::new(InMemoryEntityStore::new("Service"));

    let mut models = ModelRegistry::new();
    models.register("Service", store.clone());
    let manager = Arc::new(
        CallbackManager::new(models, registry, RetryPolicy::immediate(3)).with_strict_callbacks(strict),
    );

    let bus = Arc::new(EventBus::new(
        broker.clone(),
        options,
        Arc::new(ConsumerMetrics::new()),
    ));
    let table = Arc::new(RoutingTable::from_json_str(routing).unwrap());
    let initializer =
        SubscriptionInitializer::new(bus.clone(), manager, table, SERVICE).with_queue_mode(queue_mode);

    Harness {
        broker,
        bus,
        store,
        initializer,
    }
}

fn counting(name: &str, calls: Arc<AtomicU32>) -> Arc<FnCallback> {
    Arc::new(FnCallback::new(name, move |_| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, DispatchError>(DispatchResult::skipped("special handler ran"))
        }
    }))
}

/// Tracks how many handlers run at once, per `serviceID` and overall
#[derive(Default)]
struct Overlap {
    running: Mutex<HashMap<String, u32>>,
    peaks: Mutex<HashMap<String, u32>>,
    total: AtomicU32,
    peak_total: AtomicU32,
}

impl Overlap {
    fn peak(&self, id: &str) -> u32 {
        self.peaks.lock().get(id).copied().unwrap_or(0)
    }
}

fn slow(name: &str, overlap: Arc<Overlap>) -> Arc<FnCallback> {
    Arc::new(FnCallback::new(name, move |event| {
        let overlap = overlap.clone();
        async move {
            let id = event
                .data
                .get("serviceID")
                .and_then(|id| id.as_str())
                .unwrap_or_default()
                .to_owned();
            {
                let mut running = overlap.running.lock();
                let now = running.entry(id.clone()).or_default();
                *now += 1;
                let mut peaks = overlap.peaks.lock();
                let peak = peaks.entry(id.clone()).or_default();
                *peak = (*peak).max(*now);
            }
            let total = overlap.total.fetch_add(1, Ordering::SeqCst) + 1;
            overlap.peak_total.fetch_max(total, Ordering::SeqCst);

            tokio::time::sleep(Duration::from_millis(50)).await;

            overlap.total.fetch_sub(1, Ordering::SeqCst);
            if let Some(now) = overlap.running.lock().get_mut(&id) {
                *now -= 1;
            }
            Ok::<_, DispatchError>(DispatchResult::skipped("slow handler ran"))
        }
    }))
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

async fn publish(bus: &EventBus, key: &str, payload: serde_json::Value) {
    bus.publish(
        &RoutingKey::parse(key).unwrap(),
        &payload,
        EventContext::default().with_request_id("req-1"),
        PublishOptions::default(),
    )
    .await
    .unwrap();
}

#[test_log::test(tokio::test)]
async fn created_event_is_applied_once() {
    let h = harness(
        r#"{"catalog": {"service": {"created": "saveServiceToDatabase"}}}"#,
        HandlerRegistry::new(),
        false,
        QueueMode::Shared,
    );
    let handles = h.initializer.start_all_consumers().await.unwrap();
    assert_eq!(handles.len(), 1);
    assert_eq!(handles[0].queue(), queue_name(SERVICE));

    let body = br#"{"data": "{\"serviceID\":\"abc\",\"uniqRef\":\"r1\",\"title\":\"X\"}"}"#;
    h.broker.publish_raw(EXCHANGE, "service.created", body.to_vec());
    h.broker.publish_raw(EXCHANGE, "service.created", body.to_vec());

    wait_until(|| h.broker.ack_count() == 2).await;
    assert_eq!(h.store.len(), 1);
    let stored = h.store.find_by_ref("r1").unwrap();
    assert_eq!(stored["serviceID"], "abc");
    assert_eq!(stored["title"], "X");
    assert_eq!(h.broker.nack_count(), 0);

    h.bus.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn update_of_missing_record_is_acknowledged() {
    let h = harness(
        r#"{"catalog": {"service": {"updated": "default"}}}"#,
        HandlerRegistry::new(),
        false,
        QueueMode::Shared,
    );
    h.initializer.start_all_consumers().await.unwrap();

    publish(&h.bus, "service.updated", json!({"serviceID": "missing", "title": "Y"})).await;

    wait_until(|| h.broker.ack_count() == 1).await;
    assert_eq!(h.broker.nack_count(), 0);
    assert_eq!(h.broker.queue_depth(&queue_name(SERVICE)), 0);
    assert_eq!(h.bus.metrics().snapshot().dropped, 1);
    assert!(h.store.is_empty());

    h.bus.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn malformed_message_does_not_stop_the_loop() {
    let h = harness(
        r#"{"catalog": {"service": {"created": "default"}}}"#,
        HandlerRegistry::new(),
        false,
        QueueMode::Shared,
    );
    h.initializer.start_all_consumers().await.unwrap();

    h.broker.publish_raw(EXCHANGE, "service.created", b"{not json".to_vec());
    publish(&h.bus, "service.created", json!({"serviceID": "s1", "uniqRef": "r1"})).await;

    wait_until(|| h.broker.ack_count() == 2).await;
    assert_eq!(h.store.len(), 1);
    assert_eq!(h.bus.metrics().snapshot().decode_failures, 1);

    h.bus.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn override_replaces_default_for_its_operation_only() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = HandlerRegistry::new();
    registry.register_override("service", "created", counting("serviceCreatedSpecial", calls.clone()));

    let h = harness(
        r#"{"catalog": {"service": {"created": "default", "updated": "default"}}}"#,
        registry,
        false,
        QueueMode::Shared,
    );
    h.initializer.start_all_consumers().await.unwrap();

    h.store
        .create(json!({"serviceID": "s1", "uniqRef": "r1", "title": "Old"}).as_object().unwrap().clone())
        .await
        .unwrap();

    publish(&h.bus, "service.created", json!({"serviceID": "s2", "uniqRef": "r2"})).await;
    publish(&h.bus, "service.updated", json!({"serviceID": "s1", "title": "New"})).await;

    wait_until(|| h.broker.ack_count() == 2).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(h.store.find_by_ref("r2").is_none());
    assert_eq!(h.store.get("s1").unwrap()["title"], "New");

    h.bus.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn transient_store_failure_is_requeued_then_applied() {
    let h = harness(
        r#"{"catalog": {"service": {"created": "default"}}}"#,
        HandlerRegistry::new(),
        false,
        QueueMode::Shared,
    );
    h.initializer.start_all_consumers().await.unwrap();

    // exhausts the three lookup attempts of the first delivery
    h.store.fail_next_calls(3);
    publish(&h.bus, "service.created", json!({"serviceID": "s1", "uniqRef": "r1"})).await;

    wait_until(|| h.broker.ack_count() == 1).await;
    assert_eq!(h.broker.nack_count(), 1);
    assert_eq!(h.store.len(), 1);
    assert_eq!(h.bus.metrics().snapshot().requeued, 1);

    h.bus.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn delete_of_unknown_record_soft_fails() {
    let h = harness(
        r#"{"catalog": {"service": {"deleted": "deleteServiceFromDatabase"}}}"#,
        HandlerRegistry::new(),
        false,
        QueueMode::Shared,
    );
    h.initializer.start_all_consumers().await.unwrap();

    publish(&h.bus, "service.deleted", json!({"serviceID": "ghost"})).await;

    wait_until(|| h.broker.ack_count() == 1).await;
    assert_eq!(h.broker.nack_count(), 0);
    assert_eq!(h.bus.metrics().snapshot().dropped, 1);

    h.bus.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn per_event_queues_follow_the_naming_convention() {
    let audits = Arc::new(AtomicU32::new(0));
    let mut registry = HandlerRegistry::new();
    registry.register(counting("audit", audits.clone()));

    let h = harness(
        r#"{"catalog": {"service": {"created": "default", "updated": "default"}, "stars": "audit"}}"#,
        registry,
        false,
        QueueMode::PerEvent,
    );
    let handles = h.initializer.start_all_consumers().await.unwrap();
    assert_eq!(handles.len(), 3);

    let created = event_queue_name("Service", "created", SERVICE);
    assert_eq!(created, "Service-created-catalog-service-queue");
    assert_eq!(h.broker.bindings_for(&created), vec!["service.created".to_owned()]);
    assert!(h.broker.has_queue("Service-updated-catalog-service-queue"));
    assert_eq!(
        h.broker.bindings_for(&event_queue_name("catalog", "stars", SERVICE)),
        vec!["catalog.*".to_owned()]
    );

    publish(&h.bus, "service.created", json!({"serviceID": "s1", "uniqRef": "r1"})).await;
    publish(&h.bus, "catalog.reindexed", json!({"reason": "nightly"})).await;

    wait_until(|| h.broker.ack_count() == 2).await;
    assert_eq!(h.store.len(), 1);
    assert_eq!(audits.load(Ordering::SeqCst), 1);

    h.bus.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn unresolved_callbacks_drop_or_fail_fast() {
    let routing = r#"{"catalog": {"service": {"created": "notRegistered"}}}"#;

    let strict = harness(routing, HandlerRegistry::new(), true, QueueMode::Shared);
    let err = strict.initializer.start_all_consumers().await.unwrap_err();
    assert!(matches!(err, DispatchError::Configuration(_)));
    assert!(strict.broker.bindings_for(&queue_name(SERVICE)).is_empty());

    let lenient = harness(routing, HandlerRegistry::new(), false, QueueMode::Shared);
    lenient.initializer.start_all_consumers().await.unwrap();
    publish(&lenient.bus, "service.created", json!({"uniqRef": "r1"})).await;

    wait_until(|| lenient.broker.ack_count() == 1).await;
    assert!(lenient.store.is_empty());
    lenient.bus.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn entity_without_model_degrades_alone() {
    let h = harness(
        r#"{"booking": {"booking": {"created": "default"}, "service": {"created": "default"}}}"#,
        HandlerRegistry::new(),
        false,
        QueueMode::Shared,
    );
    h.initializer.start_all_consumers().await.unwrap();

    publish(&h.bus, "booking.created", json!({"bookingID": "b1", "uniqRef": "b1"})).await;
    publish(&h.bus, "service.created", json!({"serviceID": "s1", "uniqRef": "r1"})).await;

    wait_until(|| h.broker.ack_count() == 2).await;
    assert_eq!(h.store.len(), 1);

    h.bus.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn service_without_interest_starts_nothing() {
    let h = harness("{}", HandlerRegistry::new(), false, QueueMode::Shared);
    let handles = h.initializer.start_all_consumers().await.unwrap();

    assert!(handles.is_empty());
    assert!(!h.bus.is_connected().await);
}

#[test_log::test(tokio::test)]
async fn connection_loss_leaves_consumers_inactive() {
    let h = harness(
        r#"{"catalog": {"service": {"created": "default"}}}"#,
        HandlerRegistry::new(),
        false,
        QueueMode::Shared,
    );
    let handles = h.initializer.start_all_consumers().await.unwrap();

    h.broker.disconnect();
    wait_until(|| handles.iter().all(|handle| !handle.is_active())).await;

    // an explicit connect and start cycle resumes consumption
    let handles = h.initializer.start_all_consumers().await.unwrap();
    assert!(handles[0].is_active());
    publish(&h.bus, "service.created", json!({"serviceID": "s1", "uniqRef": "r1"})).await;
    wait_until(|| h.store.len() == 1).await;

    h.bus.close().await.unwrap();
    assert!(handles.iter().all(|handle| !handle.is_active()));
}

#[test_log::test(tokio::test)]
async fn same_entity_events_never_overlap_across_per_event_queues() {
    let overlap = Arc::new(Overlap::default());
    let mut registry = HandlerRegistry::new();
    registry.register_override("service", "created", slow("slowCreate", overlap.clone()));
    registry.register_override("service", "updated", slow("slowUpdate", overlap.clone()));

    let h = harness(
        r#"{"catalog": {"service": {"created": "default", "updated": "default"}}}"#,
        registry,
        false,
        QueueMode::PerEvent,
    );
    let handles = h.initializer.start_all_consumers().await.unwrap();
    assert_eq!(handles.len(), 2);

    publish(&h.bus, "service.created", json!({"serviceID": "abc", "uniqRef": "r1"})).await;
    publish(&h.bus, "service.updated", json!({"serviceID": "abc", "title": "New"})).await;

    wait_until(|| h.broker.ack_count() == 2).await;
    assert_eq!(overlap.peak("abc"), 1);

    h.bus.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn prefetch_window_serializes_per_entity_only() {
    let overlap = Arc::new(Overlap::default());
    let mut registry = HandlerRegistry::new();
    registry.register_override("service", "created", slow("slowCreate", overlap.clone()));
    registry.register_override("service", "updated", slow("slowUpdate", overlap.clone()));

    let h = harness_with(
        r#"{"catalog": {"service": {"created": "default", "updated": "default"}}}"#,
        registry,
        false,
        QueueMode::Shared,
        EventBusOptions::default().with_prefetch(4),
    );
    h.initializer.start_all_consumers().await.unwrap();

    publish(&h.bus, "service.created", json!({"serviceID": "abc", "uniqRef": "r1"})).await;
    publish(&h.bus, "service.updated", json!({"serviceID": "abc", "title": "New"})).await;
    publish(&h.bus, "service.created", json!({"serviceID": "zzz", "uniqRef": "r2"})).await;

    wait_until(|| h.broker.ack_count() == 3).await;
    assert_eq!(overlap.peak("abc"), 1);
    assert_eq!(overlap.peak("zzz"), 1);
    // zzz ran alongside one of the abc events
    assert_eq!(overlap.peak_total.load(Ordering::SeqCst), 2);

    h.bus.close().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn stars_run_once_when_domain_and_entity_share_a_name() {
    let audits = Arc::new(AtomicU32::new(0));
    let mut registry = HandlerRegistry::new();
    registry.register(counting("audit", audits.clone()));

    let h = harness(
        r#"{"booking": {"booking": {"created": "default"}, "stars": "audit"}}"#,
        registry,
        false,
        QueueMode::PerEvent,
    );
    h.initializer.start_all_consumers().await.unwrap();

    publish(&h.bus, "booking.created", json!({"bookingID": "b1", "uniqRef": "b1"})).await;

    // one delivery on the event queue and one on the stars queue
    wait_until(|| h.broker.ack_count() == 2).await;
    assert_eq!(audits.load(Ordering::SeqCst), 1);

    h.bus.close().await.unwrap();
}
