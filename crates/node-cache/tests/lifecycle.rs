use chrono::Duration;
use node_cache::{compose, CacheConfig, NodeCache, NodeError, NodeEvent, NodeState, NodeTransitions, TIMEOUT_ERROR};
use node_state::{lookup_attributes, InMemoryNodeStore, InProcessLockProvider, LockProvider, NodeStore,
                 StaticInventory};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

struct Fixture {
  cache: NodeCache,
  store: Arc<InMemoryNodeStore>,
  locks: Arc<InProcessLockProvider>,
}

fn fixture() -> Fixture {
  let _ = env_logger::builder().is_test(true).try_init();
  let store = Arc::new(InMemoryNodeStore::new());
  let locks = Arc::new(InProcessLockProvider::new());
  let cache = NodeCache::new(store.clone(), locks.clone(), CacheConfig::default()).expect("cache");
  Fixture { cache, store, locks }
}

#[test]
fn start_introspection_creates_fresh_record() {
  let f = fixture();
  let uuid = Uuid::new_v4();
  let attrs = lookup_attributes([("mac", vec!["aa:bb"]), ("bmc_address", vec![])]);
  let mut node = f.cache.start_introspection(uuid, true, &attrs).expect("start");

  assert_eq!(node.state().unwrap(), NodeState::Starting);
  assert!(node.manage_boot());
  assert!(node.finished_at().is_none());
  assert!(!node.is_locked());
  // empty attributes are not stored
  let stored = f.store.get_attributes(&uuid).unwrap();
  assert_eq!(stored.len(), 1);
  assert_eq!(stored["mac"], vec!["aa:bb".to_string()]);
  assert_eq!(node.attributes().unwrap(), &stored);
}

#[test]
fn restart_discards_previous_record() {
  let f = fixture();
  let uuid = Uuid::new_v4();
  let mut first = f.cache.start_introspection(uuid, true, &lookup_attributes([("mac", vec!["m1"])])).unwrap();
  first.set_option("debug", json!(true)).unwrap();
  first.fsm_event(NodeEvent::Wait, true).unwrap();
  first.fsm_event(NodeEvent::Process, true).unwrap();
  first.finished(NodeEvent::Finish, None).unwrap();
  assert_eq!(first.state().unwrap(), NodeState::Finished);

  let mut second = f.cache.start_introspection(uuid, false, &lookup_attributes([("mac", vec!["m2"])])).unwrap();
  assert_eq!(second.state().unwrap(), NodeState::Starting);
  assert_ne!(second.version_id(), first.version_id());
  assert!(second.finished_at().is_none());
  assert!(second.options().unwrap().is_empty());
  assert_eq!(second.attributes().unwrap()["mac"], vec!["m2".to_string()]);
  assert_eq!(f.store.attribute_row_count().unwrap(), 1);
}

#[test]
fn start_is_rejected_while_processing() {
  let f = fixture();
  let uuid = Uuid::new_v4();
  f.cache.add_node(uuid, NodeState::Processing, true, &Default::default()).unwrap();

  let res = f.cache.start_introspection(uuid, true, &Default::default());
  assert!(matches!(res, Err(NodeError::InvalidEvent { .. })), "got {:?}", res.map(|n| n.uuid()));
  let row = f.store.get_node(&uuid).unwrap().unwrap();
  assert_eq!(row.state, NodeState::Processing);
  assert!(row.error.is_none());
}

#[test]
fn stale_aggregate_loses_the_race() {
  let f = fixture();
  let uuid = Uuid::new_v4();
  f.cache.add_node(uuid, NodeState::Waiting, true, &Default::default()).unwrap();
  let mut a = f.cache.get_node(uuid, false).unwrap();
  let mut b = f.cache.get_node(uuid, false).unwrap();

  a.fsm_event(NodeEvent::Process, false).expect("first writer wins");
  let res = b.fsm_event(NodeEvent::Process, false);
  assert!(matches!(res, Err(NodeError::RaceCondition(_))));
  assert_eq!(f.store.get_node(&uuid).unwrap().unwrap().version_id, a.version_id());

  // a fresh read sees the committed state
  b.invalidate_cache();
  assert_eq!(b.state().unwrap(), NodeState::Processing);
}

#[test]
fn find_node_prefers_highest_score() {
  let f = fixture();
  let a = Uuid::new_v4();
  let b = Uuid::new_v4();
  f.cache.add_node(a, NodeState::Waiting, true, &lookup_attributes([("mac", vec!["m1", "m2"])])).unwrap();
  f.cache.add_node(b, NodeState::Waiting, true, &lookup_attributes([("mac", vec!["m2"])])).unwrap();

  let mut found = f.cache.find_node(&lookup_attributes([("mac", vec!["m1", "m2"])])).expect("unique winner");
  assert_eq!(found.uuid(), a);
  assert!(found.is_locked());
  assert!(f.locks.is_held(&a.to_string()));
  found.release_lock().unwrap();

  match f.cache.find_node(&lookup_attributes([("mac", vec!["m2"])])) {
    Err(NodeError::AmbiguousMatch { candidates, .. }) => {
      let mut got = candidates.clone();
      got.sort();
      let mut want = vec![a.to_string(), b.to_string()];
      want.sort();
      assert_eq!(got, want);
    }
    other => panic!("expected ambiguous match, got {:?}", other.map(|n| n.uuid())),
  }
  assert!(!f.locks.is_held(&a.to_string()));
  assert!(!f.locks.is_held(&b.to_string()));
}

#[test]
fn second_attribute_breaks_ties() {
  let f = fixture();
  let a = Uuid::new_v4();
  let b = Uuid::new_v4();
  f.cache.add_node(a, NodeState::Waiting, true, &lookup_attributes([("mac", vec!["m1"]), ("bmc_address", vec!["10.0.0.1"])]))
   .unwrap();
  f.cache.add_node(b, NodeState::Waiting, true, &lookup_attributes([("mac", vec!["m1"])])).unwrap();

  let mut found =
    f.cache.find_node(&lookup_attributes([("mac", vec!["m1"]), ("bmc_address", vec!["10.0.0.1"])])).unwrap();
  assert_eq!(found.uuid(), a);
  found.release_lock().unwrap();
}

#[test]
fn find_node_without_matches() {
  let f = fixture();
  f.cache.add_node(Uuid::new_v4(), NodeState::Waiting, true, &lookup_attributes([("mac", vec!["m1"])])).unwrap();
  let res = f.cache.find_node(&lookup_attributes([("mac", vec!["zz"])]));
  assert!(matches!(res, Err(NodeError::NotFoundInCache(_))));
  let res = f.cache.find_node(&lookup_attributes([("mac", Vec::<String>::new())]));
  assert!(matches!(res, Err(NodeError::NotFoundInCache(_))));
}

#[test]
fn finished_node_lookup_releases_lock() {
  let f = fixture();
  let uuid = Uuid::new_v4();
  f.cache.add_node(uuid, NodeState::Processing, true, &lookup_attributes([("mac", vec!["m1"])])).unwrap();
  // finished via another path but lookup rows still present
  let row = f.store.get_node(&uuid).unwrap().unwrap();
  f.store
   .compare_and_swap(&uuid,
                     &row.version_id,
                     "v-finished",
                     &node_state::NodeUpdate::new().state(NodeState::Finished).finished_at(Some(chrono::Utc::now())))
   .unwrap();

  match f.cache.find_node(&lookup_attributes([("mac", vec!["m1"])])) {
    Err(NodeError::Error { code, message }) => {
      assert_eq!(code, 400);
      assert!(message.contains("already finished"));
    }
    other => panic!("expected error, got {:?}", other.map(|n| n.uuid())),
  }
  assert!(!f.locks.is_held(&uuid.to_string()));
}

#[test]
fn finished_clears_lookup_data_but_keeps_blobs() {
  let f = fixture();
  let uuid = Uuid::new_v4();
  f.cache.add_node(uuid, NodeState::Waiting, true, &lookup_attributes([("mac", vec!["m1"])])).unwrap();
  let mut node = f.cache.find_node(&lookup_attributes([("mac", vec!["m1"])])).unwrap();
  node.set_option("new_ipmi_credentials", json!(["admin", "secret"])).unwrap();
  node.add_attribute("bmc_address", vec!["10.0.0.9".into()]).unwrap();
  f.cache.store_introspection_data(uuid, false, b"raw").unwrap();

  node.fsm_event(NodeEvent::Process, true).unwrap();
  node.finished(NodeEvent::Finish, None).unwrap();

  assert!(!node.is_locked());
  assert!(!f.locks.is_held(&uuid.to_string()));
  let row = f.store.get_node(&uuid).unwrap().unwrap();
  assert_eq!(row.state, NodeState::Finished);
  assert!(row.finished_at.is_some());
  assert!(row.error.is_none());
  assert!(f.store.get_attributes(&uuid).unwrap().is_empty());
  assert!(f.store.get_options(&uuid).unwrap().is_empty());
  assert!(node.attributes().unwrap().is_empty());
  assert_eq!(f.cache.get_introspection_data(uuid, false).unwrap(), Some(b"raw".to_vec()));
}

#[test]
fn finished_with_illegal_event_forces_error() {
  let f = fixture();
  let uuid = Uuid::new_v4();
  let mut node = f.cache.add_node(uuid, NodeState::Starting, true, &Default::default()).unwrap();

  let res = node.finished(NodeEvent::Finish, None);
  assert!(matches!(res, Err(NodeError::InvalidEvent { .. })));
  let row = f.store.get_node(&uuid).unwrap().unwrap();
  assert_eq!(row.state, NodeState::Error);
  assert!(row.finished_at.is_some());
  assert!(row.error.unwrap().contains("finish"));
}

#[test]
fn finished_with_error_message() {
  let f = fixture();
  let uuid = Uuid::new_v4();
  let mut node = f.cache.add_node(uuid, NodeState::Processing, true, &Default::default()).unwrap();
  node.finished(NodeEvent::Error, Some("ramdisk crashed".into())).unwrap();
  assert_eq!(node.error(), Some("ramdisk crashed"));
  let reloaded = f.cache.get_node(uuid, false).unwrap();
  assert_eq!(reloaded.error(), Some("ramdisk crashed"));
  assert_eq!(reloaded.finished_at(), node.finished_at());
}

#[test]
fn timeout_reaps_only_expired_nodes() {
  let f = fixture();
  let uuid = Uuid::new_v4();
  let node = f.cache.add_node(uuid, NodeState::Waiting, true, &lookup_attributes([("mac", vec!["m1"])])).unwrap();
  let started = node.started_at();
  let timeout = Duration::seconds(60);

  let early = f.cache.clean_up_at(timeout, started + timeout - Duration::seconds(1)).unwrap();
  assert!(early.is_empty());
  assert!(f.store.get_node(&uuid).unwrap().unwrap().finished_at.is_none());

  let late = f.cache.clean_up_at(timeout, started + timeout + Duration::seconds(1)).unwrap();
  assert_eq!(late, vec![uuid]);
  let row = f.store.get_node(&uuid).unwrap().unwrap();
  assert_eq!(row.state, NodeState::Error);
  assert_eq!(row.error.as_deref(), Some(TIMEOUT_ERROR));
  assert!(row.finished_at.is_some());
  assert!(f.cache.active_macs().unwrap().is_empty());
  assert!(!f.locks.is_held(&uuid.to_string()));
}

#[test]
fn timeout_tolerates_unexpected_state() {
  let f = fixture();
  let uuid = Uuid::new_v4();
  let node = f.cache.add_node(uuid, NodeState::Processing, true, &Default::default()).unwrap();
  let reaped = f.cache.clean_up_at(Duration::seconds(10), node.started_at() + Duration::seconds(11)).unwrap();
  assert_eq!(reaped, vec![uuid]);
  let row = f.store.get_node(&uuid).unwrap().unwrap();
  assert_eq!(row.state, NodeState::Error);
  assert_eq!(row.error.as_deref(), Some(TIMEOUT_ERROR));
}

#[test]
fn timeout_commits_terminal_fields_together() {
  let f = fixture();
  let uuid = Uuid::new_v4();
  let node = f.cache.add_node(uuid, NodeState::Waiting, true, &lookup_attributes([("mac", vec!["m1"])])).unwrap();
  let reaped = f.cache.clean_up_at(Duration::seconds(10), node.started_at() + Duration::seconds(11)).unwrap();
  assert_eq!(reaped, vec![uuid]);
  let row = f.store.get_node(&uuid).unwrap().unwrap();
  assert_eq!(row.state, NodeState::Error);
  assert!(row.finished_at.is_some());
  assert_ne!(row.version_id, node.version_id());
  assert!(f.store.get_attributes(&uuid).unwrap().is_empty());
  assert!(!f.locks.is_held(&uuid.to_string()));
}

#[test]
fn sweep_closes_active_row_left_in_terminal_state() {
  let f = fixture();
  let uuid = Uuid::new_v4();
  // `finished` has no error edge, so the close is forced
  let node = f.cache.add_node(uuid, NodeState::Finished, true, &Default::default()).unwrap();
  let reaped = f.cache.clean_up_at(Duration::seconds(10), node.started_at() + Duration::seconds(11)).unwrap();
  assert_eq!(reaped, vec![uuid]);
  let row = f.store.get_node(&uuid).unwrap().unwrap();
  assert_eq!(row.state, NodeState::Error);
  assert_eq!(row.error.as_deref(), Some(TIMEOUT_ERROR));
  assert!(row.finished_at.is_some());
  assert!(!f.locks.is_held(&uuid.to_string()));
}

#[test]
fn sweep_uses_error_event_when_timeout_is_not_declared() {
  let mut spec = NodeTransitions::introspection().to_spec();
  spec.transitions.retain(|t| !(t.from == NodeState::Waiting && t.event == NodeEvent::Timeout));
  let table = NodeTransitions::from_spec(spec).unwrap();
  let f = fixture();
  let cache = f.cache.clone().with_transitions(table);
  assert!(cache.transitions().apply(NodeState::Waiting, NodeEvent::Timeout).is_err());

  let uuid = Uuid::new_v4();
  let node = cache.add_node(uuid, NodeState::Waiting, true, &Default::default()).unwrap();
  let reaped = cache.clean_up_at(Duration::seconds(10), node.started_at() + Duration::seconds(11)).unwrap();
  assert_eq!(reaped, vec![uuid]);
  let row = f.store.get_node(&uuid).unwrap().unwrap();
  assert_eq!(row.state, NodeState::Error);
  assert_eq!(row.error.as_deref(), Some(TIMEOUT_ERROR));
}

// abort: arista asumida waiting -> error
#[test]
fn aborted_node_leaves_the_active_set() {
  let f = fixture();
  let uuid = Uuid::new_v4();
  let attrs = lookup_attributes([("mac", vec!["m1"])]);
  f.cache.add_node(uuid, NodeState::Waiting, true, &attrs).unwrap();
  let mut node = f.cache.get_node(uuid, true).unwrap();

  assert!(compose(&mut node, NodeEvent::Abort, false, |_| Ok(true)).unwrap());
  node.release_lock().unwrap();

  let row = f.store.get_node(&uuid).unwrap().unwrap();
  assert_eq!(row.state, NodeState::Error);
  assert!(row.finished_at.is_some());
  assert!(row.error.is_some());
  assert!(matches!(f.cache.find_node(&attrs), Err(NodeError::NotFoundInCache(_))));
  assert!(f.cache.active_macs().unwrap().is_empty());
  assert!(!f.cache.introspection_active().unwrap());
  assert!(f.cache.clean_up_at(Duration::seconds(1), row.started_at + Duration::hours(1)).unwrap().is_empty());
}

#[test]
fn sweep_skips_locked_nodes_and_disabled_timeout() {
  let f = fixture();
  let uuid = Uuid::new_v4();
  let node = f.cache.add_node(uuid, NodeState::Waiting, true, &lookup_attributes([("mac", vec!["m1"])])).unwrap();
  let later = node.started_at() + Duration::hours(2);

  assert!(f.cache.clean_up_at(Duration::zero(), later).unwrap().is_empty());
  assert!(f.cache.clean_up_at(Duration::seconds(-5), later).unwrap().is_empty());

  let mut held = f.cache.find_node(&lookup_attributes([("mac", vec!["m1"])])).unwrap();
  assert!(f.cache.clean_up_at(Duration::seconds(60), later).unwrap().is_empty());
  assert!(f.store.get_node(&uuid).unwrap().unwrap().finished_at.is_none());
  held.release_lock().unwrap();

  assert_eq!(f.cache.clean_up_at(Duration::seconds(60), later).unwrap(), vec![uuid]);
}

#[test]
fn remote_snapshot_is_fetched_once() {
  let f = fixture();
  let uuid = Uuid::new_v4();
  let inventory = Arc::new(StaticInventory::new());
  inventory.insert(uuid, json!({"uuid": uuid.to_string(), "driver": "ipmi"}), vec![json!({"address": "m1"})]);
  let cache = f.cache.clone().with_inventory(inventory.clone());

  let mut node = cache.add_node(uuid, NodeState::Waiting, true, &Default::default()).unwrap();
  assert_eq!(node.remote_snapshot().unwrap().node["driver"], json!("ipmi"));
  assert_eq!(node.ports().unwrap().len(), 1);
  assert_eq!(inventory.calls(), 2);

  node.invalidate_cache();
  node.ports().unwrap();
  assert_eq!(inventory.calls(), 4);

  let mut orphan = f.cache.add_node(Uuid::new_v4(), NodeState::Waiting, true, &Default::default()).unwrap();
  assert!(matches!(orphan.remote_snapshot(), Err(NodeError::Inventory(_))));
}

#[test]
fn administrative_queries() {
  let f = fixture();
  let keep = Uuid::new_v4();
  let gone = Uuid::new_v4();
  f.cache.add_node(keep, NodeState::Waiting, true, &lookup_attributes([("mac", vec!["m1", "m2"])])).unwrap();
  f.cache.add_node(gone, NodeState::Waiting, true, &lookup_attributes([("mac", vec!["m3"])])).unwrap();
  assert!(f.cache.introspection_active().unwrap());
  assert_eq!(f.cache.active_macs().unwrap().into_iter().collect::<Vec<_>>(), vec!["m1", "m2", "m3"]);

  let removed = f.cache.delete_nodes_not_in(&[keep]).unwrap();
  assert_eq!(removed, vec![gone]);
  assert!(f.store.get_node(&gone).unwrap().is_none());
  assert_eq!(f.cache.list_nodes(None, None).unwrap().len(), 1);
  assert!(matches!(f.cache.get_node(gone, true), Err(NodeError::NotFoundInCache(_))));
  assert!(!f.locks.is_held(&gone.to_string()));

  f.cache.delete_node(keep).unwrap();
  assert!(!f.cache.introspection_active().unwrap());
}

#[test]
fn dropping_a_locked_aggregate_keeps_the_lock() {
  let f = fixture();
  let uuid = Uuid::new_v4();
  f.cache.add_node(uuid, NodeState::Waiting, true, &Default::default()).unwrap();
  let node = f.cache.get_node(uuid, true).unwrap();
  assert!(node.is_locked());
  drop(node);
  // release is always explicit
  assert!(f.locks.is_held(&uuid.to_string()));
}
