use std::net::IpAddr;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use serde_json::{Value, json};
use tempfile::TempDir;

use super::*;
use crate::experiment::ExperimentSpec;
use crate::test_support::{ScriptedRunner, settings};

const SSH_CONFIG: &str = "\
Host vagrant-lab-1-1
  HostName 127.0.0.1
  User vagrant
  Port 2222
  IdentityFile \"/work/.vagrant/machines/vagrant-lab-1-1/virtualbox/private_key\"

Host vagrant-lab-1-2
  HostName 127.0.0.1
  User vagrant
  Port 2200
  IdentityFile /work/.vagrant/machines/vagrant-lab-1-2/virtualbox/private_key
";

fn ip(text: &str) -> IpAddr {
    text.parse()
        .unwrap_or_else(|err| panic!("bad address {text}: {err}"))
}

fn sites(raw: Value) -> Vec<SiteSpec> {
    let document = json!({
        "name": "demo",
        "sites": [raw],
        "experiments": [{"kind": "shell", "name": "noop"}]
    });
    ExperimentSpec::from_value(document, Utf8PathBuf::from("/work"))
        .unwrap_or_else(|err| panic!("document: {err}"))
        .sites
}

#[fixture]
fn sandbox() -> (TempDir, Utf8PathBuf) {
    let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non-UTF-8 path {}", path.display()));
    (dir, path)
}

fn request<'a>(site: &'a SiteSpec, index: usize, state_dir: Utf8PathBuf) -> ProvisionRequest<'a> {
    ProvisionRequest {
        index,
        site,
        label: site.label(index),
        state_dir,
        force: false,
    }
}

#[rstest]
#[case("lab", &[1], "static-lab-1")]
#[case("Site A", &[2, 3], "static-site-a-2-3")]
fn machine_ids_are_hostname_safe(#[case] label: &str, #[case] ordinals: &[usize], #[case] expected: &str) {
    assert_eq!(machine_id("static", label, ordinals), expected);
}

#[rstest]
#[tokio::test]
async fn static_hosts_keep_their_connection_details() {
    let declared = sites(json!({
        "kind": "static",
        "name": "lab",
        "resources": {"machines": [
            {"roles": ["server"], "name": "db", "address": "10.0.0.5", "user": "cc", "port": 2222,
             "proxy-command": "ssh -W %h:%p bastion", "options": {"ServerAliveInterval": "30"}},
            {"roles": ["client"], "addresses": ["2001:470::5", "10.0.0.6"], "preferred-address": "10.0.0.6"}
        ]}
    }));
    let [site] = declared.as_slice() else {
        panic!("expected one site");
    };

    let provisioned = StaticProvisioner
        .provision(&request(site, 0, Utf8PathBuf::from("/unused")))
        .await
        .unwrap_or_else(|err| panic!("provision: {err}"));

    let [db, client] = provisioned.machines.as_slice() else {
        panic!("expected two machines: {provisioned:?}");
    };
    assert_eq!(db.id, "db");
    assert_eq!(db.addresses, vec![ip("10.0.0.5")]);
    assert_eq!(db.ssh.user.as_deref(), Some("cc"));
    assert_eq!(db.ssh.port, Some(2222));
    assert_eq!(db.ssh.proxy_command.as_deref(), Some("ssh -W %h:%p bastion"));
    assert_eq!(client.id, "static-lab-2");
    assert_eq!(client.addresses, vec![ip("2001:470::5"), ip("10.0.0.6")]);
    assert_eq!(client.preferred_address, Some(ip("10.0.0.6")));
    assert!(provisioned.state_dir.is_none());
}

#[rstest]
fn site_bodies_are_checked_against_their_provider() {
    let registry = ProvisionerRegistry::builtin(&settings());
    let declared = sites(json!({
        "kind": "static",
        "resources": {"machines": [{"roles": ["server"], "number": 2}]}
    }));

    let violations = registry
        .violations(&declared)
        .unwrap_or_else(|err| panic!("kind: {err}"));

    assert!(!violations.is_empty());
    assert!(violations.iter().all(|violation| violation.context == "sites.0"));
}

#[rstest]
fn unknown_site_kinds_list_the_providers() {
    let registry = ProvisionerRegistry::builtin(&settings());
    let declared = sites(json!({"kind": "chameleon", "resources": {"machines": [{"roles": ["x"]}]}}));

    let err = registry
        .violations(&declared)
        .err()
        .unwrap_or_else(|| panic!("expected an unknown kind"));

    assert_eq!(err.category, "site");
    assert_eq!(err.available, vec!["static", "vagrant"]);
}

#[rstest]
fn ssh_config_is_parsed_per_host() {
    let entries = parse_ssh_config(SSH_CONFIG);
    let Some(first) = entries.get("vagrant-lab-1-1") else {
        panic!("missing host: {entries:?}");
    };
    assert_eq!(first.host_name.as_deref(), Some("127.0.0.1"));
    assert_eq!(first.port, Some(2222));
    assert_eq!(
        first.identity_file.as_deref(),
        Some("/work/.vagrant/machines/vagrant-lab-1-1/virtualbox/private_key")
    );
    assert_eq!(entries.len(), 2);
}

#[rstest]
fn vagrantfile_declares_every_machine() {
    let machines = [VagrantMachine {
        id: String::from("vagrant-lab-1-1"),
        roles: vec![String::from("nodes")],
        image: String::from("generic/debian12"),
        cpus: 2,
        memory: 2048,
        address: "192.168.57.10"
            .parse()
            .unwrap_or_else(|err| panic!("address: {err}")),
    }];
    let rendered = render_vagrantfile(&machines);
    assert!(rendered.starts_with("Vagrant.configure(\"2\") do |config|\n"));
    assert!(rendered.contains("  config.vm.define \"vagrant-lab-1-1\" do |node|\n"));
    assert!(rendered.contains("    node.vm.network \"private_network\", ip: \"192.168.57.10\"\n"));
    assert!(rendered.contains("      vb.memory = 2048\n"));
    assert!(rendered.ends_with("  end\nend\n"));
}

#[rstest]
#[tokio::test]
async fn vagrant_sites_boot_and_register_keys(sandbox: (TempDir, Utf8PathBuf)) {
    let (_guard, root) = sandbox;
    let declared = sites(json!({
        "kind": "vagrant",
        "name": "lab",
        "resources": {"machines": [{"roles": ["nodes"], "number": 2, "flavour": "medium"}]}
    }));
    let [site] = declared.as_slice() else {
        panic!("expected one site");
    };
    let runner = ScriptedRunner::new();
    runner.push_success();
    runner.push_output(Some(0), SSH_CONFIG, "");
    runner.push_success();
    runner.push_success();
    let provisioner = VagrantProvisioner::new(settings(), runner.clone()).with_agent(true);
    let state_dir = site_state_dir(&root, 1, "vagrant");

    let provisioned = provisioner
        .provision(&request(site, 1, state_dir.clone()))
        .await
        .unwrap_or_else(|err| panic!("provision: {err}"));

    let commands: Vec<String> = runner
        .invocations()
        .iter()
        .map(CommandRequest::command_string)
        .collect();
    assert_eq!(commands.first().map(String::as_str), Some("vagrant up"));
    assert_eq!(commands.get(1).map(String::as_str), Some("vagrant ssh-config"));
    assert_eq!(commands.len(), 4);
    assert!(
        runner
            .invocations()
            .iter()
            .take(2)
            .all(|request| request.current_dir.as_ref() == Some(&state_dir))
    );

    let [first, second] = provisioned.machines.as_slice() else {
        panic!("expected two machines: {provisioned:?}");
    };
    assert_eq!(first.addresses, vec![ip("127.0.0.1"), ip("192.168.57.10")]);
    assert_eq!(first.preferred_address, Some(ip("192.168.57.10")));
    assert_eq!(first.ssh.port, Some(2222));
    assert_eq!(second.id, "vagrant-lab-1-2");
    assert_eq!(second.preferred_address, Some(ip("192.168.57.11")));
    assert_eq!(provisioned.agent_keys.len(), 2);
    assert_eq!(provisioned.state_dir, Some(state_dir.clone()));

    let vagrantfile = std::fs::read_to_string(state_dir.join("Vagrantfile"))
        .unwrap_or_else(|err| panic!("read Vagrantfile: {err}"));
    assert!(vagrantfile.contains("vb.cpus = 2"));
}

#[rstest]
#[tokio::test]
async fn failed_boot_names_the_site(sandbox: (TempDir, Utf8PathBuf)) {
    let (_guard, root) = sandbox;
    let declared = sites(json!({
        "kind": "vagrant",
        "name": "lab",
        "resources": {"machines": [{"roles": ["nodes"]}]}
    }));
    let [site] = declared.as_slice() else {
        panic!("expected one site");
    };
    let runner = ScriptedRunner::new();
    runner.push_failure(1);
    let provisioner = VagrantProvisioner::new(settings(), runner).with_agent(false);

    let result = provisioner
        .provision(&request(site, 0, site_state_dir(&root, 0, "vagrant")))
        .await;

    let Err(ProvisionError::Command { site: label, .. }) = &result else {
        panic!("expected a command failure, got {result:?}");
    };
    assert_eq!(label, "lab");
}

#[rstest]
#[tokio::test]
async fn vagrant_teardown_releases_keys_then_destroys(sandbox: (TempDir, Utf8PathBuf)) {
    let (_guard, root) = sandbox;
    let state_dir = site_state_dir(&root, 0, "vagrant");
    files::write(&state_dir.join("Vagrantfile"), "Vagrant.configure(\"2\") do |config|\nend\n")
        .unwrap_or_else(|err| panic!("write: {err}"));
    let record = SiteRecord {
        index: 0,
        kind: String::from("vagrant"),
        label: String::from("lab"),
        machines: Vec::new(),
        agent_keys: vec![Utf8PathBuf::from("/keys/one")],
        state_dir: Some(state_dir.clone()),
        backend: Value::Null,
    };
    let runner = ScriptedRunner::new();
    runner.push_failure(1);
    runner.push_success();
    let provisioner = VagrantProvisioner::new(settings(), runner.clone());

    provisioner
        .release_credentials(&record)
        .await
        .unwrap_or_else(|err| panic!("release: {err}"));
    provisioner
        .teardown(&record)
        .await
        .unwrap_or_else(|err| panic!("teardown: {err}"));
    provisioner
        .remove_local_state(&record)
        .await
        .unwrap_or_else(|err| panic!("remove: {err}"));

    let commands: Vec<String> = runner
        .invocations()
        .iter()
        .map(CommandRequest::command_string)
        .collect();
    assert_eq!(commands, vec!["ssh-add -d /keys/one", "vagrant destroy -f"]);
    assert!(!state_dir.exists());
}
