//! End-to-end lifecycle scenarios driven through scripted providers and
//! remotes.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use rstest::{fixture, rstest};
use serde_json::{Value, json};
use tempfile::TempDir;

use kiso::bootstrap::bootstrap_command;
use kiso::experiment::ExperimentSpec;
use kiso::hostmap::HOSTS_FILE_KEY;
use kiso::orchestrator::{
    CheckedExperiment, LifecycleError, Orchestrator, RunOptions, UpOutcome, check,
};
use kiso::provision::ProvisionerRegistry;
use kiso::registry::{PluginCategory, PluginRegistry};
use kiso::settings::LifecycleOptions;
use kiso::state::{LifecycleState, StateStore};
use kiso::test_support::{
    CallLog, FakeProvisioner, RecordingRemote, fake_experiment, fake_installer,
};

struct Testbed {
    _dir: TempDir,
    output: Utf8PathBuf,
    log: CallLog,
    remote: RecordingRemote,
    registry: PluginRegistry,
    provisioners: ProvisionerRegistry,
}

impl Testbed {
    fn orchestrator(&self) -> Orchestrator {
        let provisioners = ProvisionerRegistry::new()
            .with(FakeProvisioner::new("fake", &self.log));
        Orchestrator::new(
            provisioners,
            Arc::new(self.remote.clone()),
            LifecycleOptions::default(),
        )
    }

    fn store(&self) -> StateStore {
        StateStore::open(&self.output)
    }

    fn checked(&self, document: Value) -> Result<CheckedExperiment, LifecycleError> {
        let spec = ExperimentSpec::from_value(document, Utf8PathBuf::from("/srv/experiment"))?;
        check(spec, &self.registry, &self.provisioners)
    }

    fn must_check(&self, document: Value) -> CheckedExperiment {
        self.checked(document)
            .unwrap_or_else(|err| panic!("check failed: {err}"))
    }
}

#[fixture]
fn testbed() -> Testbed {
    let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let output = Utf8Path::from_path(dir.path())
        .unwrap_or_else(|| panic!("non-UTF-8 tempdir"))
        .join("output");
    let log = CallLog::new();
    let registry = PluginRegistry::builder()
        .software(fake_installer("docker", &log))
        .software(fake_installer("apptainer", &log))
        .software(fake_installer("spack", &log))
        .deployment(fake_installer("condor", &log))
        .experiment(fake_experiment("bench", &log))
        .build()
        .unwrap_or_else(|err| panic!("registry: {err}"));
    Testbed {
        _dir: dir,
        output,
        provisioners: ProvisionerRegistry::new().with(FakeProvisioner::new("fake", &log)),
        log,
        remote: RecordingRemote::new(),
        registry,
    }
}

fn sites_a_and_b() -> Value {
    json!([
        {"kind": "fake", "name": "A", "resources": {"machines": [
            {"roles": ["server"], "number": 1},
            {"roles": ["compute"], "number": 1}
        ]}},
        {"kind": "fake", "name": "B", "resources": {"machines": [
            {"roles": ["compute"], "number": 1}
        ]}}
    ])
}

#[rstest]
#[tokio::test]
async fn two_sites_share_one_host_map(testbed: Testbed) {
    let checked = testbed.must_check(json!({
        "name": "mesh",
        "sites": sites_a_and_b(),
        "software": {"docker": {"roles": ["compute"]}},
        "deployment": {"condor": {"roles": ["server", "compute"]}},
        "experiments": [{"kind": "bench", "name": "ping", "roles": ["compute"]}]
    }));

    let outcome = testbed
        .orchestrator()
        .up(&checked, &testbed.store(), false)
        .await
        .unwrap_or_else(|err| panic!("up: {err}"));

    assert_eq!(outcome, UpOutcome::Completed);
    assert_eq!(
        testbed.log.matching("provision:"),
        vec!["provision:A", "provision:B"]
    );
    let ids = ["fake-a-1-1", "fake-a-2-1", "fake-b-1-1"];
    let prepare = bootstrap_command();
    let (bootstraps, host_maps): (Vec<_>, Vec<_>) = testbed
        .remote
        .exec_commands()
        .into_iter()
        .partition(|(_, command)| *command == prepare);
    assert_eq!(bootstraps.len(), ids.len());
    assert_eq!(host_maps.len(), ids.len());
    for (machine, command) in &host_maps {
        assert!(ids.contains(&machine.as_str()), "unexpected machine {machine}");
        for id in ids {
            assert!(command.contains(id), "{machine} lacks {id}");
        }
    }
    assert_eq!(
        testbed.log.matching("install:"),
        vec!["install:docker:2", "install:condor:3"]
    );
    let state = testbed
        .store()
        .load()
        .unwrap_or_else(|err| panic!("load: {err}"));
    assert_eq!(state.stage, LifecycleState::Deployed);
    assert!(state.environment.get(HOSTS_FILE_KEY).is_some());
}

#[rstest]
#[tokio::test]
async fn second_of_three_installs_failing_stops_the_stage(testbed: Testbed) {
    let checked = testbed.must_check(json!({
        "name": "stack",
        "sites": sites_a_and_b(),
        "software": {
            "docker": {},
            "apptainer": {"fail": true},
            "spack": {}
        },
        "experiments": [{"kind": "bench", "name": "ping"}]
    }));

    let err = testbed
        .orchestrator()
        .up(&checked, &testbed.store(), false)
        .await
        .err()
        .unwrap_or_else(|| panic!("up should fail"));

    assert!(
        matches!(
            &err,
            LifecycleError::Install { category: PluginCategory::Software, kind, .. }
                if kind == "apptainer"
        ),
        "unexpected error: {err}"
    );
    assert!(err.to_string().contains("apptainer failed on purpose"));
    assert_eq!(
        testbed.log.matching("install:"),
        vec!["install:docker:0", "install:apptainer:0"]
    );
    let state = testbed
        .store()
        .load()
        .unwrap_or_else(|load| panic!("load: {load}"));
    assert!(state.installed.software.contains("docker"));
    assert!(!state.installed.software.contains("apptainer"));
    assert_eq!(state.stage, LifecycleState::Provisioned);
    assert!(state.failure.is_some());
}

#[rstest]
#[tokio::test]
async fn counted_experiment_runs_three_times(testbed: Testbed) {
    let checked = testbed.must_check(json!({
        "name": "repeat",
        "sites": sites_a_and_b(),
        "experiments": [{
            "kind": "bench",
            "name": "latency",
            "count": 3,
            "roles": ["compute"],
            "outputs": [{"roles": ["compute"], "src": "latency.csv", "dst": "csv"}]
        }]
    }));
    let orchestrator = testbed.orchestrator();
    orchestrator
        .up(&checked, &testbed.store(), false)
        .await
        .unwrap_or_else(|err| panic!("up: {err}"));

    let summary = orchestrator
        .run(&checked, &testbed.store(), RunOptions::default())
        .await
        .unwrap_or_else(|err| panic!("run: {err}"));

    assert_eq!(summary.completed.len(), 3);
    assert_eq!(
        testbed.log.matching("run:"),
        vec!["run:latency:1", "run:latency:2", "run:latency:3"]
    );
    assert_eq!(testbed.remote.pulls().len(), 6);
    for iteration in ["1", "2", "3"] {
        let dir = testbed.output.join("results/latency").join(iteration);
        assert!(dir.join("iteration.txt").is_file());
        assert!(dir.join("csv/fake-b-1-1").is_dir());
    }
}

#[rstest]
#[tokio::test]
async fn repeated_up_never_reprovisions(testbed: Testbed) {
    let checked = testbed.must_check(json!({
        "name": "again",
        "sites": sites_a_and_b(),
        "experiments": [{"kind": "bench", "name": "ping"}]
    }));
    let orchestrator = testbed.orchestrator();

    for _ in 0..3 {
        orchestrator
            .up(&checked, &testbed.store(), false)
            .await
            .unwrap_or_else(|err| panic!("up: {err}"));
    }

    assert_eq!(testbed.log.matching("provision:").len(), 2);
}

#[rstest]
#[tokio::test]
async fn provisioning_failure_prevents_every_install(testbed: Testbed) {
    let provisioner = FakeProvisioner::new("fake", &testbed.log);
    provisioner.fail_provision("A");
    let orchestrator = Orchestrator::new(
        ProvisionerRegistry::new().with(provisioner),
        Arc::new(testbed.remote.clone()),
        LifecycleOptions::default(),
    );
    let checked = testbed.must_check(json!({
        "name": "broken",
        "sites": sites_a_and_b(),
        "software": {"docker": {}},
        "experiments": [{"kind": "bench", "name": "ping"}]
    }));

    let result = orchestrator.up(&checked, &testbed.store(), false).await;

    assert!(matches!(result, Err(LifecycleError::Provisioning { .. })));
    assert_eq!(testbed.log.entries(), vec!["provision:A"]);
    assert!(testbed.remote.exec_commands().is_empty());
}

#[rstest]
fn check_never_reaches_providers_or_machines(testbed: Testbed) {
    let result = testbed.checked(json!({
        "name": "dry",
        "sites": sites_a_and_b(),
        "software": {"docker": {"roles": ["gpu"]}},
        "experiments": [{"kind": "bench", "name": "ping"}]
    }));

    let Err(LifecycleError::Config(err)) = result else {
        panic!("undefined role should fail the check");
    };
    assert!(err.to_string().contains("gpu"));
    assert!(testbed.log.entries().is_empty());
    assert!(testbed.remote.exec_commands().is_empty());
    assert!(!testbed.output.exists());
}

#[rstest]
#[tokio::test]
async fn down_after_up_clears_everything(testbed: Testbed) {
    let checked = testbed.must_check(json!({
        "name": "cycle",
        "sites": sites_a_and_b(),
        "experiments": [{"kind": "bench", "name": "ping"}]
    }));
    let orchestrator = testbed.orchestrator();
    orchestrator
        .up(&checked, &testbed.store(), false)
        .await
        .unwrap_or_else(|err| panic!("up: {err}"));

    orchestrator
        .down(&testbed.store())
        .await
        .unwrap_or_else(|err| panic!("down: {err}"));

    assert_eq!(
        testbed.log.matching("teardown:"),
        vec!["teardown:B", "teardown:A"]
    );
    assert!(!testbed.store().path().exists());
    let reprovisioned = orchestrator
        .up(&checked, &testbed.store(), false)
        .await
        .unwrap_or_else(|err| panic!("second up: {err}"));
    assert_eq!(reprovisioned, UpOutcome::Completed);
    assert_eq!(testbed.log.matching("provision:").len(), 4);
}
