//! Unit tests for lifecycle state persistence.

use super::*;
use crate::files;
use camino::Utf8Path;
use rstest::{fixture, rstest};
use serde_json::json;
use tempfile::TempDir;

#[fixture]
fn store() -> (TempDir, StateStore) {
    let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8Path::from_path(dir.path())
        .unwrap_or_else(|| panic!("non-UTF-8 tempdir"))
        .join("output");
    let store = StateStore::open(&root);
    (dir, store)
}

fn site(index: usize) -> SiteRecord {
    SiteRecord {
        index,
        kind: String::from("static"),
        label: format!("site{index}"),
        machines: vec![Machine::new(format!("m{index}"), "static", format!("site{index}"))],
        agent_keys: Vec::new(),
        state_dir: None,
        backend: Value::Null,
    }
}

#[rstest]
fn missing_file_loads_fresh_state(store: (TempDir, StateStore)) {
    let (_guard, store) = store;
    let state = store
        .load()
        .unwrap_or_else(|err| panic!("load failed: {err}"));
    assert_eq!(state.stage, LifecycleState::Unchecked);
    assert!(state.sites.is_empty());
}

#[rstest]
fn saved_state_round_trips(store: (TempDir, StateStore)) {
    let (_guard, store) = store;
    let mut state = State::new();
    state.upsert_site(site(0));
    state.environment.apply(EnvironmentPatch::new().with("docker", json!({"version": "27"})));
    state.advance(LifecycleState::Provisioned);
    store
        .save(&state)
        .unwrap_or_else(|err| panic!("save failed: {err}"));

    let loaded = store
        .load()
        .unwrap_or_else(|err| panic!("load failed: {err}"));
    assert_eq!(loaded, state);
}

#[rstest]
fn save_refuses_another_generation(store: (TempDir, StateStore)) {
    let (_guard, store) = store;
    let current = State::new();
    store
        .save(&current)
        .unwrap_or_else(|err| panic!("save failed: {err}"));

    let stale = State::new();
    let err = store.save(&stale).err();
    assert_eq!(
        err,
        Some(StateError::StaleGeneration {
            path: store.path().to_path_buf(),
            on_disk: current.generation,
            ours: stale.generation,
        })
    );
}

#[rstest]
fn discard_allows_a_new_generation(store: (TempDir, StateStore)) {
    let (_guard, store) = store;
    store
        .save(&State::new())
        .unwrap_or_else(|err| panic!("save failed: {err}"));
    store
        .discard()
        .unwrap_or_else(|err| panic!("discard failed: {err}"));
    assert!(store.save(&State::new()).is_ok());
}

#[rstest]
fn corrupt_file_is_reported(store: (TempDir, StateStore)) {
    let (_guard, store) = store;
    files::write(store.path(), "{not json")
        .unwrap_or_else(|err| panic!("write failed: {err}"));
    assert!(matches!(store.load(), Err(StateError::Corrupt { .. })));
}

#[rstest]
fn unsupported_version_is_reported(store: (TempDir, StateStore)) {
    let (_guard, store) = store;
    let contents = json!({
        "version": 99,
        "generation": "6f1c8a1e-2b9b-4c1e-8f5e-0a4d2f9c7b11",
        "stage": "checked"
    });
    files::write(store.path(), &contents.to_string())
        .unwrap_or_else(|err| panic!("write failed: {err}"));
    assert!(matches!(
        store.load(),
        Err(StateError::UnsupportedVersion { version: 99, .. })
    ));
}

#[rstest]
#[case(LifecycleState::Deployed, LifecycleState::Provisioned, true)]
#[case(LifecycleState::Provisioned, LifecycleState::Provisioned, true)]
#[case(LifecycleState::Checked, LifecycleState::Provisioned, false)]
#[case(LifecycleState::Failed, LifecycleState::Checked, false)]
fn stage_ordering(#[case] stage: LifecycleState, #[case] floor: LifecycleState, #[case] expected: bool) {
    assert_eq!(stage.is_at_least(floor), expected);
}

#[rstest]
fn advance_never_lowers_the_stage() {
    let mut state = State::new();
    state.advance(LifecycleState::Deployed);
    state.record_failure(LifecycleState::Provisioned, "boom");
    state.advance(LifecycleState::Provisioned);
    assert_eq!(state.stage, LifecycleState::Deployed);
    assert_eq!(state.failure, None);
}

#[rstest]
fn sites_stay_in_index_order() {
    let mut state = State::new();
    state.upsert_site(site(2));
    state.upsert_site(site(0));
    state.upsert_site(site(2));
    let indices: Vec<usize> = state.sites.iter().map(|s| s.index).collect();
    assert_eq!(indices, [0, 2]);
    state.remove_site(0);
    assert_eq!(state.machines().len(), 1);
}

#[rstest]
fn experiment_record_resets_when_the_entry_changes() {
    let mut state = State::new();
    state.experiment_mut(0, "warmup").completed.insert(1);
    assert!(state.experiment_mut(0, "warmup").completed.contains(&1));
    assert!(state.experiment_mut(0, "scaling").completed.is_empty());
}
