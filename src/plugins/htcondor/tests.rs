use std::collections::BTreeSet;
use std::net::IpAddr;

use camino::Utf8Path;
use rstest::rstest;
use serde_json::json;

use super::*;
use crate::hostmap::HostMap;
use crate::registry::InstallContext;
use crate::settings::LifecycleOptions;
use crate::state::{Environment, EnvironmentPatch};
use crate::test_support::RecordingRemote;

fn ip(text: &str) -> IpAddr {
    text.parse()
        .unwrap_or_else(|err| panic!("bad address {text}: {err}"))
}

fn machine(id: &str, role: &str, address: &str) -> Machine {
    Machine::new(id, "static", "lab")
        .with_role(role)
        .with_address(ip(address))
}

fn pool(section: serde_json::Value) -> Htcondor {
    let config: HtcondorConfig =
        serde_json::from_value(section).unwrap_or_else(|err| panic!("decode: {err}"));
    Htcondor::new(config)
}

fn machines() -> RoleMap {
    RoleMap::resolve(&[
        machine("cm", "manager", "10.0.0.1"),
        machine("w1", "workers", "10.0.0.2"),
        machine("w2", "workers", "10.0.0.3"),
    ])
}

#[rstest]
#[case("central-manager", Some(DaemonKind::CentralManager))]
#[case("execute", Some(DaemonKind::Execute))]
#[case("execute-12", Some(DaemonKind::Execute))]
#[case("submit-1", Some(DaemonKind::Submit))]
#[case("personal", Some(DaemonKind::Personal))]
#[case("execute-", None)]
#[case("execute-x", None)]
#[case("collector", None)]
fn daemon_keys(#[case] key: &str, #[case] expected: Option<DaemonKind>) {
    assert_eq!(DaemonKind::from_key(key), expected);
}

#[rstest]
fn execute_config_uses_the_connection_broker() {
    let daemons = BTreeSet::from([DaemonKind::Execute]);
    let lines = render_config(&daemons, Some(ip("10.0.0.1")), ip("10.0.0.2"));
    assert_eq!(
        lines,
        vec![
            "CONDOR_HOST = 10.0.0.1",
            "TRUST_DOMAIN = kiso.scitech.isi.edu",
            "use ROLE: Execute",
            "USE_CCB = True",
            "CCB_ADDRESS = $(CONDOR_HOST)",
            "NETWORK_INTERFACE = 10.0.0.2",
        ]
    );
}

#[rstest]
fn personal_pool_runs_every_role_locally() {
    let daemons = BTreeSet::from([DaemonKind::Personal]);
    let lines = render_config(&daemons, None, ip("10.0.0.9"));
    assert_eq!(
        lines,
        vec![
            "CONDOR_HOST = $(IP_ADDRESS)",
            "use ROLE: CentralManager",
            "use ROLE: Submit",
            "use ROLE: Execute",
            "NETWORK_INTERFACE = 10.0.0.9",
        ]
    );
}

#[rstest]
fn manager_and_submit_share_one_fragment() {
    let daemons = BTreeSet::from([DaemonKind::Submit, DaemonKind::CentralManager]);
    let lines = render_config(&daemons, Some(ip("10.0.0.1")), ip("10.0.0.1"));
    assert_eq!(
        lines.get(2..4),
        Some(
            [
                String::from("use ROLE: CentralManager"),
                String::from("use ROLE: Submit")
            ]
            .as_slice()
        )
    );
}

#[rstest]
fn consistent_pool_passes_checks() {
    let plugin = pool(json!({
        "central-manager": {"roles": ["manager"]},
        "submit": {"roles": ["manager"]},
        "execute": {"roles": ["workers"]}
    }));
    assert!(plugin.check(&machines()).is_empty());
    assert_eq!(plugin.roles(), vec!["manager", "workers"]);
}

#[rstest]
#[case::two_managers(
    json!({"central-manager": {"roles": ["workers"]}}),
    "central-manager must resolve to exactly one machine, found 2"
)]
#[case::overlapping_execute(
    json!({
        "central-manager": {"roles": ["manager"]},
        "execute-1": {"roles": ["workers"]},
        "execute-2": {"roles": ["kiso.workers.2"]}
    }),
    "execute groups `execute-1` and `execute-2` overlap on w2"
)]
#[case::overlapping_submit(
    json!({
        "central-manager": {"roles": ["manager"]},
        "submit-1": {"roles": ["manager"]},
        "submit-2": {"roles": ["static"]}
    }),
    "submit groups `submit-1` and `submit-2` overlap on cm"
)]
#[case::execute_without_manager(
    json!({"execute": {"roles": ["workers"]}}),
    "execute requires a central-manager"
)]
#[case::undefined_role(
    json!({"central-manager": {"roles": ["manager"]}, "submit": {"roles": ["ghost"]}}),
    "submit references undefined role `ghost`"
)]
fn inconsistent_pools_are_reported(#[case] section: serde_json::Value, #[case] expected: &str) {
    let problems = pool(section).check(&machines());
    assert!(
        problems.iter().any(|problem| problem == expected),
        "expected {expected:?} in {problems:?}"
    );
}

#[rstest]
#[tokio::test]
async fn central_manager_is_configured_before_the_workers() {
    let plugin = pool(json!({
        "central-manager": {"roles": ["manager"]},
        "submit": {"roles": ["manager"]},
        "execute": {"roles": ["workers"]}
    }));
    let roles = machines();
    let host_map = HostMap::generate(&roles).unwrap_or_else(|err| panic!("host map: {err}"));
    let remote = RecordingRemote::new();
    let environment = Environment::default();
    let options = LifecycleOptions::default();
    let ctx = InstallContext {
        roles: &roles,
        environment: &environment,
        remote: &remote,
        host_map: &host_map,
        options: &options,
        working_dir: Utf8Path::new("/experiments/demo"),
    };

    let patch = plugin
        .install(&ctx)
        .await
        .unwrap_or_else(|err| panic!("install: {err}"));

    let commands = remote.exec_commands();
    let manager_done = commands
        .iter()
        .rposition(|(id, command)| id == "cm" && command.contains("systemctl restart condor"))
        .unwrap_or_else(|| panic!("manager never restarted: {commands:?}"));
    let first_worker = commands
        .iter()
        .position(|(id, _)| id != "cm")
        .unwrap_or_else(|| panic!("workers never configured: {commands:?}"));
    assert!(manager_done < first_worker, "{commands:?}");

    let worker_fragment = commands
        .iter()
        .find(|(id, command)| id == "w1" && command.contains(KISO_CONFIG_FILE))
        .map(|(_, command)| command.clone())
        .unwrap_or_else(|| panic!("no fragment for w1: {commands:?}"));
    assert!(worker_fragment.contains("CONDOR_HOST = 10.0.0.1"));
    assert!(worker_fragment.contains("USE_CCB = True"));
    assert!(worker_fragment.contains("NETWORK_INTERFACE = 10.0.0.2"));

    let tokens: Vec<&String> = commands
        .iter()
        .filter(|(_, command)| command.contains("condor_token_create"))
        .map(|(id, _)| id)
        .collect();
    assert_eq!(tokens.len(), 3);
    assert!(!patch.is_empty());
}

#[rstest]
#[tokio::test]
async fn user_fragments_are_staged_and_installed() {
    let plugin = pool(json!({
        "personal": {"roles": ["manager"], "config-file": "condor/extra.conf"}
    }));
    let roles = machines();
    let host_map = HostMap::generate(&roles).unwrap_or_else(|err| panic!("host map: {err}"));
    let remote = RecordingRemote::new();
    let environment = Environment::default();
    let options = LifecycleOptions::default();
    let ctx = InstallContext {
        roles: &roles,
        environment: &environment,
        remote: &remote,
        host_map: &host_map,
        options: &options,
        working_dir: Utf8Path::new("/experiments/demo"),
    };

    plugin
        .install(&ctx)
        .await
        .unwrap_or_else(|err| panic!("install: {err}"));

    assert_eq!(
        remote.pushes(),
        vec![(
            String::from("cm"),
            String::from("/experiments/demo/condor/extra.conf"),
            String::from("kiso/kiso-personal-config-file"),
        )]
    );
    assert!(
        remote
            .exec_commands()
            .iter()
            .any(|(_, command)| command.contains("/etc/condor/config.d/kiso-personal-config-file"))
    );
}

#[rstest]
#[tokio::test]
async fn failed_install_stops_the_pool() {
    let plugin = pool(json!({
        "central-manager": {"roles": ["manager"]},
        "execute": {"roles": ["workers"]}
    }));
    let roles = machines();
    let host_map = HostMap::generate(&roles).unwrap_or_else(|err| panic!("host map: {err}"));
    let remote = RecordingRemote::new();
    remote.fail_when("systemctl restart condor");
    let environment = Environment::default();
    let options = LifecycleOptions {
        retry: crate::remote::RetryPolicy::once(),
        ..LifecycleOptions::default()
    };
    let ctx = InstallContext {
        roles: &roles,
        environment: &environment,
        remote: &remote,
        host_map: &host_map,
        options: &options,
        working_dir: Utf8Path::new("/experiments/demo"),
    };

    let result = plugin.install(&ctx).await;

    assert!(matches!(result, Err(PluginError::Remote(_))), "{result:?}");
    assert!(remote.exec_commands().iter().all(|(id, _)| id == "cm"));
}

#[rstest]
#[tokio::test]
async fn reinstall_keeps_the_recorded_pool_password() {
    let plugin = pool(json!({
        "central-manager": {"roles": ["manager"]},
        "execute": {"roles": ["workers"]}
    }));
    let roles = machines();
    let host_map = HostMap::generate(&roles).unwrap_or_else(|err| panic!("host map: {err}"));
    let remote = RecordingRemote::new();
    let mut environment = Environment::default();
    environment.apply(EnvironmentPatch::new().with(KIND, json!({PASSWORD_KEY: "kept-secret"})));
    let options = LifecycleOptions::default();
    let ctx = InstallContext {
        roles: &roles,
        environment: &environment,
        remote: &remote,
        host_map: &host_map,
        options: &options,
        working_dir: Utf8Path::new("/experiments/demo"),
    };

    let patch = plugin
        .install(&ctx)
        .await
        .unwrap_or_else(|err| panic!("install: {err}"));

    let secured: Vec<String> = remote
        .exec_commands()
        .into_iter()
        .filter(|(_, command)| command.contains("condor_token_create"))
        .map(|(_, command)| command)
        .collect();
    assert!(!secured.is_empty());
    assert!(secured.iter().all(|command| command.contains("kept-secret")));

    let mut recorded = Environment::default();
    recorded.apply(patch);
    assert_eq!(
        recorded
            .get(KIND)
            .and_then(|pool| pool.get(PASSWORD_KEY)),
        Some(&json!("kept-secret"))
    );
}

#[rstest]
fn fresh_pools_get_a_generated_password() {
    let password = pool_password(&Environment::default());
    assert_eq!(password.len(), 32);
    assert!(password.chars().all(|c| c.is_ascii_hexdigit()));
}
