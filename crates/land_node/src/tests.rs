use super::*;
use land_proto::{DocumentFields, DocumentStore};
use land_store::InMemoryDocumentStore;
use std::time::Instant;

struct FixedOracle(Action);

impl DecisionOracle for FixedOracle {
    fn predict(&self, _grid: &SensoryGrid) -> Result<Decision, OracleError> {
        Ok(self.0.decision())
    }
}

fn fast_config() -> LandConfig {
    LandConfig {
        tick_ms: 10,
        sweep_interval_ms: 20,
        watch_poll_ms: 5,
        ..LandConfig::default()
    }
}

fn runtime(store: &InMemoryDocumentStore, action: Action) -> LandRuntime {
    LandRuntime::new(
        fast_config(),
        Arc::new(store.clone()),
        Arc::new(FixedOracle(action)),
    )
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn fields(value: serde_json::Value) -> DocumentFields {
    match value {
        serde_json::Value::Object(map) => map,
        _ => DocumentFields::new(),
    }
}

#[test]
fn start_and_stop_lifecycle() {
    let store = InMemoryDocumentStore::new();
    let mut runtime = runtime(&store, Action::None);

    runtime.start().expect("start");
    assert!(matches!(runtime.start(), Err(LandError::AlreadyRunning)));
    assert!(runtime.snapshot().running);
    assert!(runtime.snapshot().agents.contains_key(control::DEFAULT_AGENT_ID));
    assert!(wait_until(Duration::from_secs(2), || runtime.snapshot().control_ticks > 0));

    runtime.stop().expect("stop");
    assert!(!runtime.snapshot().running);
    assert!(matches!(runtime.stop(), Err(LandError::NotRunning)));
    assert!(runtime.take_fatal_error().is_none());

    runtime.start().expect("restart");
    runtime.stop().expect("stop again");
}

#[test]
fn fresh_player_drives_the_monster_end_to_end() {
    let store = InMemoryDocumentStore::new();
    let config = fast_config();
    store
        .upsert(
            &config.collections.players,
            "player-1",
            fields(serde_json::json!({"x": 900.0, "y": 1000.0, "angle": 90.0, "isMove": true, "speed": 4.0})),
        )
        .expect("seed player");

    let mut runtime = runtime(&store, Action::Left);
    runtime.start().expect("start");

    let monsters = config.collections.monsters.clone();
    assert!(wait_until(Duration::from_secs(2), || store.write_count(&monsters) > 0));
    runtime.stop().expect("stop");

    let snapshot = runtime.snapshot();
    assert_eq!(snapshot.cached_players, 1);
    assert_eq!(snapshot.active_players, 1);
    let agent = &snapshot.agents[control::DEFAULT_AGENT_ID];
    let steps = store.write_count(&monsters) as f64;
    assert_eq!(agent.x, 950.0 - 4.0 * steps);
    assert!(agent.is_moving);
    assert_eq!(agent.angle, 270.0);

    let users = store
        .get(&config.collections.users, "player-1")
        .expect("get")
        .expect("activity written");
    assert_eq!(users.fields["active"], serde_json::json!(true));
}

#[test]
fn player_feed_failure_is_fatal() {
    let store = InMemoryDocumentStore::new();
    let mut runtime = runtime(&store, Action::None);
    runtime.start().expect("start");

    let players = runtime.config().collections.players.clone();
    store.fail_watchers(&players, "transport reset");

    let err = runtime
        .wait_fatal_error(Duration::from_secs(2))
        .expect("fatal error");
    assert!(matches!(err, LandError::Stream { ref collection, .. } if *collection == players));
    assert!(runtime
        .snapshot()
        .last_error
        .expect("last error")
        .contains("transport reset"));

    // the remaining units still stop cleanly
    runtime.stop().expect("stop");
}

#[test]
fn malformed_field_tile_is_fatal_and_good_tiles_load() {
    let store = InMemoryDocumentStore::new();
    let mut runtime = runtime(&store, Action::None);
    let field = runtime.config().collections.field.clone();
    runtime.start().expect("start");
    let handle = runtime.status_handle();

    store
        .upsert(&field, "row-001-col-002", fields(serde_json::json!({"chip": 9, "hitPoint": 1.0})))
        .expect("tile");
    assert!(wait_until(Duration::from_secs(2), || {
        matches!(handle.field_tile(1, 2), Ok(Some(_)))
    }));
    assert_eq!(handle.snapshot().loaded_tiles, 1);

    store
        .upsert(&field, "not-a-tile", fields(serde_json::json!({"chip": 1})))
        .expect("bad tile");
    let err = runtime
        .wait_fatal_error(Duration::from_secs(2))
        .expect("fatal error");
    assert!(matches!(err, LandError::Stream { .. }));
    runtime.stop().expect("stop");
}

#[test]
fn sweep_demotes_players_restored_from_store() {
    let store = InMemoryDocumentStore::new();
    let config = fast_config();
    store
        .upsert(
            &config.collections.users,
            "sleeper",
            fields(serde_json::json!({"active": true, "updatedAt": 0, "name": "bob"})),
        )
        .expect("seed user");

    let mut runtime = runtime(&store, Action::None);
    runtime.start().expect("start");
    assert!(wait_until(Duration::from_secs(2), || {
        runtime
            .activity()
            .activity("sleeper")
            .map(|activity| !activity.active)
            .unwrap_or(false)
    }));
    runtime.stop().expect("stop");

    let document = store
        .get(&config.collections.users, "sleeper")
        .expect("get")
        .expect("user");
    assert_eq!(document.fields["active"], serde_json::json!(false));
    assert_eq!(document.fields["name"], serde_json::json!("bob"));
    assert!(runtime.snapshot().sweep_runs > 0);
}

#[test]
fn custom_agents_replace_the_default_seed() {
    let store = InMemoryDocumentStore::new();
    let mut runtime = runtime(&store, Action::None)
        .with_agents(vec![Position::new("m-1", 10.0, 20.0).with_speed(2.0)]);
    runtime.start().expect("start");
    let agents = runtime.snapshot().agents;
    runtime.stop().expect("stop");
    assert_eq!(agents.keys().collect::<Vec<_>>(), vec!["m-1"]);
}
