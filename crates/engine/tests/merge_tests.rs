//! Merge Policy Integration Tests
//!
//! Exercises each merge policy end to end through sessions and units of
//! work: distributed cache updates between cooperating sessions, clone
//! merges of detached graphs, refreshes and cache expiry.

use coherence_cache::CacheInvalidationPolicy;
use coherence_core::{
    Attributes, CacheKey, CoherenceError, EntityObject, ObjectGraph, PrimaryKey, Row,
    ValidationKind, Value, WriteLockValue,
};
use coherence_engine::testing::{RecordedEvent, RecordingListener, StaticDataSource};
use coherence_engine::{
    CacheSynchronizationType, EntityDescriptor, MergePolicy, ReferenceMapping, Session,
    UnitOfWorkChangeSet,
};
use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

fn employee_descriptor() -> EntityDescriptor {
    EntityDescriptor::builder("Employee")
        .primary_key(["id"])
        .direct("id")
        .direct("name")
        .direct("salary")
        .version_locking("version")
        .build()
        .unwrap()
}

fn employee_row(id: i64, salary: i64, version: i64) -> Row {
    let mut state = Attributes::new();
    state.insert("id".into(), Value::Int(id));
    state.insert("name".into(), Value::from(format!("employee-{}", id)));
    state.insert("salary".into(), Value::Int(salary));
    state.insert("version".into(), Value::Int(version));
    Row::new(state)
}

fn employee_key(id: i64) -> CacheKey {
    CacheKey::new("Employee", PrimaryKey::int(id))
}

fn shared_rows() -> Arc<StaticDataSource> {
    let rows = Arc::new(StaticDataSource::new());
    rows.insert("Employee", PrimaryKey::int(1), employee_row(1, 100, 1));
    rows.insert("Employee", PrimaryKey::int(2), employee_row(2, 200, 1));
    rows
}

fn node(rows: &Arc<StaticDataSource>) -> Session {
    init_tracing();
    Session::builder()
        .descriptor(employee_descriptor())
        .data_source(Arc::clone(rows) as Arc<_>)
        .build()
        .unwrap()
}

fn synced_node(rows: &Arc<StaticDataSource>, sync: CacheSynchronizationType) -> Session {
    init_tracing();
    let descriptor = EntityDescriptor::builder("Employee")
        .primary_key(["id"])
        .direct("id")
        .direct("name")
        .direct("salary")
        .version_locking("version")
        .sync_type(sync)
        .build()
        .unwrap();
    Session::builder()
        .descriptor(descriptor)
        .data_source(Arc::clone(rows) as Arc<_>)
        .build()
        .unwrap()
}

/// Commit a salary change on `session` and return the change set to ship
fn raise_salary(session: &Session, id: i64, salary: i64) -> UnitOfWorkChangeSet {
    let mut uow = session.acquire_unit_of_work();
    let clone = uow.read_object(&employee_key(id)).unwrap().unwrap();
    uow.set_attribute(clone.id(), "salary", salary).unwrap();
    uow.commit().unwrap();
    uow.change_set().for_distribution()
}

// ============================================================================
// Distributed Cache Updates
// ============================================================================

#[test]
fn test_distributed_change_applies_to_peer() {
    let rows = shared_rows();
    let node_a = node(&rows);
    let node_b = node(&rows);
    node_b.read_original(&employee_key(1)).unwrap();

    let shipped = raise_salary(&node_a, 1, 150);
    let bytes = shipped.to_bytes().unwrap();
    let summary = node_b.apply_distributed_bytes(&bytes).unwrap();

    assert_eq!(summary.merged, 1);
    let entry = node_b.cache().lookup_entry(&employee_key(1)).unwrap();
    let object = entry.object().unwrap();
    assert_eq!(object.get("salary"), Some(Value::Int(150)));
    assert_eq!(object.get("version"), Some(Value::Int(2)));
    assert_eq!(entry.write_lock_value(), Some(WriteLockValue::Version(2)));
    assert_eq!(node_b.metrics().distributed_merges, 1);
}

#[test]
fn test_distributed_change_applied_twice_is_skipped() {
    let rows = shared_rows();
    let node_a = node(&rows);
    let node_b = node(&rows);
    node_b.read_original(&employee_key(1)).unwrap();

    let shipped = raise_salary(&node_a, 1, 150);
    node_b.apply_distributed_change_set(&shipped).unwrap();
    let again = node_b.apply_distributed_change_set(&shipped).unwrap();

    assert_eq!(again.merged, 0);
    assert_eq!(again.skipped, 1);
    assert_eq!(again.invalidated, 0);
}

#[test]
fn test_own_change_set_is_ignored() {
    let rows = shared_rows();
    let node_a = node(&rows);

    let shipped = raise_salary(&node_a, 1, 150);
    let summary = node_a.apply_distributed_change_set(&shipped).unwrap();
    assert_eq!(summary.merged + summary.skipped + summary.invalidated, 0);
    assert_eq!(node_a.metrics().distributed_merges, 0);
}

#[test]
fn test_missed_intermediate_change_invalidates() {
    let rows = shared_rows();
    let node_a = node(&rows);
    let node_b = node(&rows);
    node_b.read_original(&employee_key(1)).unwrap();

    // node_b never sees the first change, so the second one does not apply.
    let _first = raise_salary(&node_a, 1, 150);
    let second = raise_salary(&node_a, 1, 175);
    let summary = node_b.apply_distributed_change_set(&second).unwrap();

    assert_eq!(summary.merged, 0);
    assert_eq!(summary.invalidated, 1);
    assert!(node_b.cache().lookup_valid(&employee_key(1)).is_none());
    assert_eq!(
        node_b.cache().lookup(&employee_key(1)).unwrap().get("salary"),
        Some(Value::Int(100))
    );
}

#[test]
fn test_local_entry_ahead_invalidates() {
    let rows = shared_rows();
    let node_a = node(&rows);
    let node_b = node(&rows);
    node_a.read_original(&employee_key(1)).unwrap();

    let stale = raise_salary(&node_b, 1, 120);
    let _newer = raise_salary(&node_a, 1, 130);
    let _newest = raise_salary(&node_a, 1, 140);

    let summary = node_a.apply_distributed_change_set(&stale).unwrap();
    assert_eq!(summary.invalidated, 1);
    assert!(node_a.cache().lookup_valid(&employee_key(1)).is_none());
}

#[test]
fn test_uncached_peer_entry_is_left_for_next_read() {
    let rows = shared_rows();
    let node_a = node(&rows);
    let node_b = node(&rows);

    let shipped = raise_salary(&node_a, 1, 150);
    let summary = node_b.apply_distributed_change_set(&shipped).unwrap();
    assert_eq!(summary.merged, 0);
    assert_eq!(summary.skipped, 1);
    assert!(node_b.cache().lookup_valid(&employee_key(1)).is_none());
}

#[test]
fn test_distributed_delete_removes_peer_entry() {
    let rows = shared_rows();
    let node_a = node(&rows);
    let node_b = node(&rows);
    node_b.read_original(&employee_key(2)).unwrap();

    let mut uow = node_a.acquire_unit_of_work();
    let clone = uow.read_object(&employee_key(2)).unwrap().unwrap();
    uow.delete_object(clone.id()).unwrap();
    uow.commit().unwrap();

    let summary = node_b
        .apply_distributed_change_set(&uow.change_set().for_distribution())
        .unwrap();
    assert_eq!(summary.removed, 1);
    assert!(node_b.cache().lookup(&employee_key(2)).is_none());
}

#[test]
fn test_invalidate_sync_type_ships_markers_only() {
    let rows = shared_rows();
    let node_a = synced_node(&rows, CacheSynchronizationType::InvalidateChangedObjects);
    let node_b = synced_node(&rows, CacheSynchronizationType::InvalidateChangedObjects);
    node_b.read_original(&employee_key(1)).unwrap();

    let shipped = raise_salary(&node_a, 1, 150);
    assert!(shipped.iter().all(|object| object.changes.is_empty()));

    let summary = node_b.apply_distributed_change_set(&shipped).unwrap();
    assert_eq!(summary.invalidated, 1);
    assert!(node_b.cache().lookup_valid(&employee_key(1)).is_none());
}

#[test]
fn test_new_objects_ship_when_configured() {
    let rows = Arc::new(StaticDataSource::new());
    let node_a = synced_node(&rows, CacheSynchronizationType::SendNewObjectsWithChanges);
    let node_b = synced_node(&rows, CacheSynchronizationType::SendNewObjectsWithChanges);

    let mut uow = node_a.acquire_unit_of_work();
    let mut state = Attributes::new();
    state.insert("id".into(), Value::Int(30));
    state.insert("salary".into(), Value::Int(300));
    uow.register_new_object(EntityObject::new("Employee", state))
        .unwrap();
    uow.commit().unwrap();

    let summary = node_b
        .apply_distributed_change_set(&uow.change_set().for_distribution())
        .unwrap();
    assert_eq!(summary.merged, 1);
    let entry = node_b.cache().lookup_entry(&employee_key(30)).unwrap();
    assert_eq!(entry.object().unwrap().get("salary"), Some(Value::Int(300)));
    assert_eq!(entry.write_lock_value(), Some(WriteLockValue::Version(1)));
}

#[test]
fn test_distributed_listener_sees_every_phase() {
    let rows = shared_rows();
    let node_a = node(&rows);
    let listener = Arc::new(RecordingListener::new());
    let node_b = Session::builder()
        .descriptor(employee_descriptor())
        .data_source(Arc::clone(&rows) as Arc<_>)
        .listener(Arc::clone(&listener) as Arc<_>)
        .build()
        .unwrap();
    node_b.read_original(&employee_key(1)).unwrap();

    let shipped = raise_salary(&node_a, 1, 150);
    node_b.apply_distributed_change_set(&shipped).unwrap();

    let events = listener.events();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0], RecordedEvent::PreDistributed { objects: 1 });
    assert_eq!(
        events[1],
        RecordedEvent::PostMerge {
            policy: MergePolicy::DistributedCacheUpdate,
            key: employee_key(1),
        }
    );
    assert!(matches!(&events[2], RecordedEvent::PostDistributed(s) if s.merged == 1));
}

#[test]
fn test_corrupt_bytes_are_rejected() {
    let rows = shared_rows();
    let node_b = node(&rows);
    let err = node_b.apply_distributed_bytes(&[0xc1, 0x00, 0x17]).unwrap_err();
    assert!(matches!(err, CoherenceError::Serialization { .. }));
}

// ============================================================================
// Clone Merges
// ============================================================================

fn order_session(rows: Arc<StaticDataSource>) -> Session {
    Session::builder()
        .descriptor(
            EntityDescriptor::builder("Order")
                .primary_key(["id"])
                .direct("id")
                .direct("status")
                .mapping(Arc::new(ReferenceMapping::new("invoice").private_owned()))
                .reference("customer")
                .version_locking("version")
                .build()
                .unwrap(),
        )
        .descriptor(
            EntityDescriptor::builder("Invoice")
                .primary_key(["id"])
                .direct("id")
                .direct("amount")
                .build()
                .unwrap(),
        )
        .descriptor(
            EntityDescriptor::builder("Customer")
                .primary_key(["id"])
                .direct("id")
                .direct("name")
                .build()
                .unwrap(),
        )
        .data_source(rows)
        .build()
        .unwrap()
}

fn order_rows() -> Arc<StaticDataSource> {
    let rows = Arc::new(StaticDataSource::new());
    let mut invoice = Attributes::new();
    invoice.insert("id".into(), Value::Int(5));
    invoice.insert("amount".into(), Value::Int(40));
    rows.insert("Invoice", PrimaryKey::int(5), Row::new(invoice));

    let mut customer = Attributes::new();
    customer.insert("id".into(), Value::Int(9));
    customer.insert("name".into(), Value::from("Acme"));
    rows.insert("Customer", PrimaryKey::int(9), Row::new(customer));

    let mut order = Attributes::new();
    order.insert("id".into(), Value::Int(1));
    order.insert("status".into(), Value::from("open"));
    order.insert("version".into(), Value::Int(1));
    rows.insert(
        "Order",
        PrimaryKey::int(1),
        Row::new(order)
            .with_reference("invoice", CacheKey::new("Invoice", PrimaryKey::int(5)))
            .with_reference("customer", CacheKey::new("Customer", PrimaryKey::int(9))),
    );
    rows
}

fn order_key() -> CacheKey {
    CacheKey::new("Order", PrimaryKey::int(1))
}

/// Detached copy of order 1 with its invoice and customer
fn detach_order(session: &Session) -> (ObjectGraph, coherence_core::ObjectId) {
    let mut uow = session.acquire_unit_of_work();
    let order = uow.read_object(&order_key()).unwrap().unwrap();
    let detached = uow.detach(order.id()).unwrap();
    uow.release();
    detached
}

fn referenced(graph: &ObjectGraph, root: coherence_core::ObjectId, attr: &str) -> Arc<EntityObject> {
    let id = graph.get(root).unwrap().get(attr).unwrap().as_ref_id().unwrap();
    Arc::clone(graph.get(id).unwrap())
}

#[test]
fn test_detached_graph_references_its_own_copies() {
    let session = order_session(order_rows());
    let (graph, root) = detach_order(&session);

    assert_eq!(graph.len(), 3);
    let invoice = referenced(&graph, root, "invoice");
    assert_eq!(invoice.get("amount"), Some(Value::Int(40)));
    assert!(!session.cache().is_original(invoice.id()));
}

#[test]
fn test_clone_merge_cascades_private_parts_only() {
    let session = order_session(order_rows());
    let (graph, root) = detach_order(&session);
    graph.get(root).unwrap().set("status", "shipped");
    referenced(&graph, root, "invoice").set("amount", 45i64);
    referenced(&graph, root, "customer").set("name", "Renamed");

    let mut uow = session.acquire_unit_of_work();
    let order = uow.merge_clone(&graph, root).unwrap().unwrap();
    assert_eq!(order.get("status"), Some(Value::from("shipped")));

    let invoice_id = order.get("invoice").unwrap().as_ref_id().unwrap();
    let customer_id = order.get("customer").unwrap().as_ref_id().unwrap();
    let invoice = uow.working_copy(invoice_id).unwrap();
    let customer = uow.working_copy(customer_id).unwrap();
    assert_eq!(invoice.get("amount"), Some(Value::Int(45)));
    assert_eq!(customer.get("name"), Some(Value::from("Acme")));

    uow.commit().unwrap();
    let cached = session
        .cache()
        .lookup(&CacheKey::new("Invoice", PrimaryKey::int(5)))
        .unwrap();
    assert_eq!(cached.get("amount"), Some(Value::Int(45)));
}

#[test]
fn test_clone_merge_with_references_cascades_everything() {
    let session = order_session(order_rows());
    let (graph, root) = detach_order(&session);
    referenced(&graph, root, "customer").set("name", "Renamed");

    let mut uow = session.acquire_unit_of_work();
    let order = uow
        .merge_clone_with_references(&graph, root)
        .unwrap()
        .unwrap();
    let customer_id = order.get("customer").unwrap().as_ref_id().unwrap();
    assert_eq!(
        uow.working_copy(customer_id).unwrap().get("name"),
        Some(Value::from("Renamed"))
    );
}

#[test]
fn test_clone_merge_of_deleted_object_rejected() {
    let session = order_session(order_rows());
    let (graph, root) = detach_order(&session);

    let mut uow = session.acquire_unit_of_work();
    let order = uow.read_object(&order_key()).unwrap().unwrap();
    uow.delete_object(order.id()).unwrap();

    let err = uow.merge_clone(&graph, root).unwrap_err();
    assert!(matches!(err, CoherenceError::RemovedEntityMerge { .. }));
}

#[test]
fn test_new_detached_object_with_version_rejected() {
    let session = order_session(order_rows());
    let mut graph = ObjectGraph::new();
    let mut state = Attributes::new();
    state.insert("id".into(), Value::Int(77));
    state.insert("status".into(), Value::from("draft"));
    state.insert("version".into(), Value::Int(4));
    let root = graph.insert(EntityObject::new("Order", state));

    let mut uow = session.acquire_unit_of_work();
    let err = uow.merge_clone(&graph, root).unwrap_err();
    assert!(matches!(err, CoherenceError::ObjectChangedSinceLastMerge { .. }));
    assert!(err.is_optimistic_lock());
}

#[test]
fn test_nested_original_reference_suppressed_on_request() {
    let session = order_session(order_rows());
    let invoice = session
        .read_original(&CacheKey::new("Invoice", PrimaryKey::int(5)))
        .unwrap()
        .unwrap();

    let mut graph = ObjectGraph::new();
    let mut state = Attributes::new();
    state.insert("id".into(), Value::Int(2));
    state.insert("status".into(), Value::from("open"));
    state.insert("invoice".into(), Value::Ref(invoice.id()));
    let root = graph.insert(EntityObject::new("Order", state));

    let mut strict = session.acquire_unit_of_work();
    let err = strict.merge_clone(&graph, root).unwrap_err();
    assert_eq!(
        err.validation_kind(),
        Some(ValidationKind::BackupCloneIsOriginalFromParent)
    );

    let mut lenient = session.acquire_unit_of_work();
    lenient.set_suppress_validation(true);
    let order = lenient.merge_clone(&graph, root).unwrap().unwrap();
    assert_eq!(order.get("invoice"), Some(Value::Null));
    assert_eq!(session.metrics().suppressed_validation_errors, 1);
}

fn country_session() -> Session {
    init_tracing();
    let rows = Arc::new(StaticDataSource::new());
    let mut france = Attributes::new();
    france.insert("id".into(), Value::Int(1));
    france.insert("name".into(), Value::from("France"));
    rows.insert("Country", PrimaryKey::int(1), Row::new(france));
    Session::builder()
        .descriptor(
            EntityDescriptor::builder("Country")
                .primary_key(["id"])
                .direct("id")
                .direct("name")
                .read_only()
                .build()
                .unwrap(),
        )
        .data_source(rows as Arc<_>)
        .build()
        .unwrap()
}

#[test]
fn test_clone_merge_leaves_read_only_types_unchanged() {
    let session = country_session();
    let key = CacheKey::new("Country", PrimaryKey::int(1));
    let mut graph = ObjectGraph::new();
    let mut state = Attributes::new();
    state.insert("id".into(), Value::Int(1));
    state.insert("name".into(), Value::from("Renamed"));
    let root = graph.insert(EntityObject::new("Country", state));

    // Nothing cached yet: the detached object comes back as is.
    let mut uow = session.acquire_unit_of_work();
    let country = uow.merge_clone(&graph, root).unwrap().unwrap();
    assert_eq!(country.id(), root);
    assert!(uow.working_copy(root).is_none());
    assert!(uow.calculate_changes().unwrap().is_empty());
    uow.release();

    // Cached: the shared original is returned untouched.
    let original = session.read_original(&key).unwrap().unwrap();
    let mut uow = session.acquire_unit_of_work();
    let country = uow.merge_clone_with_references(&graph, root).unwrap().unwrap();
    assert_eq!(country.id(), original.id());
    assert_eq!(country.get("name"), Some(Value::from("France")));
    uow.commit().unwrap();

    let cached = session.cache().lookup(&key).unwrap();
    assert_eq!(cached.get("name"), Some(Value::from("France")));
}

// ============================================================================
// Refresh
// ============================================================================

#[test]
fn test_refresh_object_reloads_from_data_source() {
    let rows = shared_rows();
    let session = node(&rows);
    let mut uow = session.acquire_unit_of_work();
    let clone = uow.read_object(&employee_key(1)).unwrap().unwrap();
    uow.set_attribute(clone.id(), "salary", 999i64).unwrap();

    rows.insert("Employee", PrimaryKey::int(1), employee_row(1, 110, 4));
    let refreshed = uow.refresh_object(clone.id()).unwrap().unwrap();

    assert_eq!(refreshed.id(), clone.id());
    assert_eq!(clone.get("salary"), Some(Value::Int(110)));
    assert_eq!(clone.get("version"), Some(Value::Int(4)));
    assert_eq!(
        session.cache().lookup_entry(&employee_key(1)).unwrap().write_lock_value(),
        Some(WriteLockValue::Version(4))
    );
    assert!(uow.calculate_changes().unwrap().is_empty());
}

#[test]
fn test_refresh_of_vanished_row_returns_none() {
    let rows = shared_rows();
    let session = node(&rows);
    let mut uow = session.acquire_unit_of_work();
    let clone = uow.read_object(&employee_key(2)).unwrap().unwrap();

    rows.remove("Employee", PrimaryKey::int(2));
    assert!(uow.refresh_object(clone.id()).unwrap().is_none());
}

// ============================================================================
// Expiry
// ============================================================================

#[test]
fn test_expired_entries_reload_and_sweep() {
    let rows = shared_rows();
    let session = Session::builder()
        .descriptor(
            EntityDescriptor::builder("Employee")
                .primary_key(["id"])
                .direct("id")
                .direct("name")
                .direct("salary")
                .version_locking("version")
                .invalidation(CacheInvalidationPolicy::TimeToLive(Duration::from_millis(5)))
                .build()
                .unwrap(),
        )
        .data_source(Arc::clone(&rows) as Arc<_>)
        .build()
        .unwrap();

    session.read_original(&employee_key(1)).unwrap();
    session.read_original(&employee_key(2)).unwrap();
    assert_eq!(rows.reads(), 2);
    thread::sleep(Duration::from_millis(20));

    assert!(session.cache().lookup_valid(&employee_key(1)).is_none());
    session.read_original(&employee_key(1)).unwrap().unwrap();
    assert_eq!(rows.reads(), 3);

    assert_eq!(session.sweep_expired(), 1);
    assert!(session.cache().lookup(&employee_key(2)).is_none());
    assert!(session.cache().lookup(&employee_key(1)).is_some());
}

// ============================================================================
// Deferred Locks
// ============================================================================

#[test]
fn test_contended_key_is_deferred_until_released() {
    let rows = shared_rows();
    let session = node(&rows);
    let mut uow = session.acquire_unit_of_work();
    let first = uow.read_object(&employee_key(1)).unwrap().unwrap();
    let second = uow.read_object(&employee_key(2)).unwrap().unwrap();
    uow.set_attribute(first.id(), "salary", 110i64).unwrap();
    uow.set_attribute(second.id(), "salary", 210i64).unwrap();
    let change_set = uow.flush().unwrap();

    let coordinator = Arc::clone(session.coordinator());
    let holder = coordinator.begin();
    coordinator.acquire(holder.token(), &employee_key(2)).unwrap();

    // Release once the merge has switched to deferred locks.
    let releaser = thread::spawn(move || {
        for _ in 0..500 {
            if coordinator.deferred_transitions() > 0 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        drop(holder);
    });

    let summary = session.merge_change_set(&change_set, None).unwrap();
    releaser.join().unwrap();

    assert!(summary.transitioned_to_deferred_locks);
    assert_eq!(summary.deferred, 1);
    assert_eq!(summary.merged, 2);
    assert_eq!(session.coordinator().active_merges(), 0);
    assert_eq!(session.metrics().deferred_transitions, 1);

    let cached = session.cache().lookup(&employee_key(2)).unwrap();
    assert_eq!(cached.get("salary"), Some(Value::Int(210)));
}
