//! Common machine preparation that runs before any plugin is installed.
//!
//! Every machine gets the same baseline: SELinux and the host firewall are
//! disabled, `sudo` and `curl` are present, and a `kiso` user with
//! passwordless sudo shares the login user's SSH keys. Installers rely on
//! that baseline.

use tracing::info;

use crate::inventory::Machine;
use crate::remote::{
    CommandTimeout, RemoteError, RemoteRunner, RetryPolicy, as_root, exec_with_retry,
    for_each_machine,
};

/// Account created on every machine.
pub const KISO_USER: &str = "kiso";

/// Packages every machine must provide.
pub const BASE_PACKAGES: &[&str] = &["sudo", "curl", "ca-certificates"];

const DISABLE_GUARDS: &str = "if command -v setenforce >/dev/null 2>&1; then setenforce 0 || true; fi\n\
     if [ -f /etc/selinux/config ]; then \
     sed -i 's/^SELINUX=.*/SELINUX=disabled/' /etc/selinux/config; fi\n\
     for unit in firewalld ufw; do \
     systemctl disable --now \"$unit\" >/dev/null 2>&1 || true; done\n";

fn install_packages() -> String {
    let packages = BASE_PACKAGES.join(" ");
    format!(
        "if command -v apt-get >/dev/null 2>&1; then \
         export DEBIAN_FRONTEND=noninteractive; \
         apt-get update -qq && apt-get install -y -qq {packages}; \
         elif command -v dnf >/dev/null 2>&1; then dnf install -y -q {packages}; \
         elif command -v yum >/dev/null 2>&1; then yum install -y -q {packages}; \
         elif command -v apk >/dev/null 2>&1; then apk add --no-cache {packages}; \
         fi\n"
    )
}

fn create_user() -> String {
    format!(
        "getent group {KISO_USER} >/dev/null || groupadd {KISO_USER}\n\
         id -u {KISO_USER} >/dev/null 2>&1 || useradd -m -g {KISO_USER} -s /bin/bash {KISO_USER}\n\
         printf '%s\\n' '{KISO_USER} ALL=(ALL) NOPASSWD:ALL' > /etc/sudoers.d/{KISO_USER}\n\
         chmod 0440 /etc/sudoers.d/{KISO_USER}\n"
    )
}

fn share_ssh_keys() -> String {
    format!(
        "owner=\"${{SUDO_USER:-$(id -un)}}\"\n\
         from=\"$(getent passwd \"$owner\" | cut -d: -f6)/.ssh\"\n\
         to=\"$(getent passwd {KISO_USER} | cut -d: -f6)/.ssh\"\n\
         if [ -d \"$from\" ] && [ \"$from\" != \"$to\" ]; then \
         mkdir -p \"$to\" && cp -a \"$from/.\" \"$to/\" && \
         chown -R {KISO_USER}:{KISO_USER} \"$to\" && chmod 0700 \"$to\"; fi\n"
    )
}

/// Shell command preparing one machine. Running it twice is harmless.
#[must_use]
pub fn bootstrap_command() -> String {
    let script = format!(
        "set -e\n{DISABLE_GUARDS}{}{}{}",
        install_packages(),
        create_user(),
        share_ssh_keys()
    );
    as_root(&script)
}

/// Prepares every machine with at most `max_workers` in flight, retrying
/// package-manager failures per `retry`.
///
/// # Errors
///
/// Returns the failure of the first machine, in input order, that could not
/// be prepared.
pub async fn bootstrap(
    remote: &dyn RemoteRunner,
    machines: &[&Machine],
    max_workers: usize,
    retry: RetryPolicy,
) -> Result<(), RemoteError> {
    let command = bootstrap_command();
    let script = command.as_str();
    for_each_machine(machines, max_workers, |machine| async move {
        exec_with_retry(remote, machine, script, CommandTimeout::Unbounded, retry).await
    })
    .await?;
    info!(machines = machines.len(), "machines bootstrapped");
    Ok(())
}
