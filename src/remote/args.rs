//! Argument builders for `ssh`, `rsync`, and `scp`.

use std::ffi::OsString;
use std::net::IpAddr;

use camino::Utf8Path;

use crate::inventory::Machine;
use crate::settings::KisoSettings;
use crate::transport::DEFAULT_SSH_PORT;

use super::util::{expand_tilde, quote};

/// Flag used to pass the port: `ssh` takes `-p`, `scp` takes `-P`.
#[derive(Clone, Copy, Debug)]
pub(crate) enum PortFlag {
    Ssh,
    Scp,
}

impl PortFlag {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Ssh => "-p",
            Self::Scp => "-P",
        }
    }
}

fn user<'a>(settings: &'a KisoSettings, machine: &'a Machine) -> &'a str {
    machine.ssh.user.as_deref().unwrap_or(&settings.ssh_user)
}

/// Host component of a remote path, bracketing IPv6 addresses.
fn remote_host(address: IpAddr) -> String {
    match address {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    }
}

pub(crate) fn remote_spec(
    settings: &KisoSettings,
    machine: &Machine,
    address: IpAddr,
    path: &str,
) -> String {
    format!(
        "{}@{}:{path}",
        user(settings, machine),
        remote_host(address)
    )
}

pub(crate) fn common_ssh_options(
    settings: &KisoSettings,
    machine: &Machine,
    port_flag: PortFlag,
) -> Vec<OsString> {
    let port = machine.ssh.port.unwrap_or(DEFAULT_SSH_PORT);
    let mut args = vec![
        OsString::from(port_flag.as_str()),
        OsString::from(port.to_string()),
    ];

    let identity = machine
        .ssh
        .identity_file
        .as_deref()
        .or(settings.ssh_identity_file.as_deref());
    if let Some(identity_file) = identity {
        args.push(OsString::from("-i"));
        args.push(OsString::from(expand_tilde(identity_file)));
    }

    if settings.ssh_batch_mode {
        args.push(OsString::from("-o"));
        args.push(OsString::from("BatchMode=yes"));
    }

    if !settings.ssh_strict_host_key_checking {
        args.push(OsString::from("-o"));
        args.push(OsString::from("StrictHostKeyChecking=no"));
    }

    if !settings.ssh_known_hosts_file.trim().is_empty() {
        args.push(OsString::from("-o"));
        args.push(OsString::from(format!(
            "UserKnownHostsFile={}",
            settings.ssh_known_hosts_file
        )));
    }

    if let Some(proxy) = &machine.ssh.proxy_command {
        args.push(OsString::from("-o"));
        args.push(OsString::from(format!("ProxyCommand={proxy}")));
    }

    for (key, value) in &machine.ssh.options {
        args.push(OsString::from("-o"));
        args.push(OsString::from(format!("{key}={value}")));
    }

    args
}

pub(crate) fn ssh_args(
    settings: &KisoSettings,
    machine: &Machine,
    address: IpAddr,
    command: &str,
) -> Vec<OsString> {
    let mut args = common_ssh_options(settings, machine, PortFlag::Ssh);
    args.push(OsString::from(format!(
        "{}@{address}",
        user(settings, machine)
    )));
    args.push(OsString::from(command));
    args
}

/// `--rsh` value carrying the machine's SSH options, each shell-quoted so
/// proxy commands with spaces survive rsync's word splitting.
fn remote_shell(settings: &KisoSettings, machine: &Machine) -> String {
    let mut parts = vec![quote(&settings.ssh_bin)];
    parts.extend(
        common_ssh_options(settings, machine, PortFlag::Ssh)
            .into_iter()
            .map(|arg| quote(&arg.to_string_lossy())),
    );
    parts.join(" ")
}

pub(crate) fn rsync_push_args(
    settings: &KisoSettings,
    machine: &Machine,
    address: IpAddr,
    source: &Utf8Path,
    destination: &str,
) -> Vec<OsString> {
    vec![
        OsString::from("-az"),
        OsString::from("--rsh"),
        OsString::from(remote_shell(settings, machine)),
        OsString::from(source.as_str()),
        OsString::from(remote_spec(settings, machine, address, destination)),
    ]
}

pub(crate) fn rsync_pull_args(
    settings: &KisoSettings,
    machine: &Machine,
    address: IpAddr,
    source: &str,
    destination: &Utf8Path,
) -> Vec<OsString> {
    vec![
        OsString::from("-az"),
        OsString::from("--rsh"),
        OsString::from(remote_shell(settings, machine)),
        OsString::from(remote_spec(settings, machine, address, source)),
        OsString::from(format!("{destination}/")),
    ]
}

/// `scp -r dir/ host:existing` lands in `existing/dir`. Pushing `dir/.`
/// copies the contents instead, as rsync does for a trailing slash.
fn scp_source(source: &Utf8Path) -> String {
    let raw = source.as_str();
    if raw.ends_with('/') {
        format!("{raw}.")
    } else {
        raw.to_owned()
    }
}

pub(crate) fn scp_push_args(
    settings: &KisoSettings,
    machine: &Machine,
    address: IpAddr,
    source: &Utf8Path,
    destination: &str,
) -> Vec<OsString> {
    let mut args = common_ssh_options(settings, machine, PortFlag::Scp);
    args.push(OsString::from("-r"));
    args.push(OsString::from(scp_source(source)));
    args.push(OsString::from(remote_spec(settings, machine, address, destination)));
    args
}

pub(crate) fn scp_pull_args(
    settings: &KisoSettings,
    machine: &Machine,
    address: IpAddr,
    source: &str,
    destination: &Utf8Path,
) -> Vec<OsString> {
    let mut args = common_ssh_options(settings, machine, PortFlag::Scp);
    args.push(OsString::from("-r"));
    args.push(OsString::from(remote_spec(settings, machine, address, source)));
    args.push(OsString::from(destination.as_str()));
    args
}
