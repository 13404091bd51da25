//! Daemon roles and the `01-kiso` configuration rendered for each machine.

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

/// Trust domain shared by every pool this tool builds.
pub const TRUST_DOMAIN: &str = "kiso.scitech.isi.edu";

/// Directory HTCondor reads configuration fragments from.
pub const CONFIG_DIR: &str = "/etc/condor/config.d";

/// Name of the generated fragment.
pub const KISO_CONFIG_FILE: &str = "01-kiso";

/// HTCondor daemon role, ordered by installation rank.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum DaemonKind {
    /// Collector and negotiator of the pool.
    CentralManager,
    /// A single-machine pool running every daemon.
    Personal,
    /// Runs jobs.
    Execute,
    /// Queues jobs.
    Submit,
}

impl DaemonKind {
    /// Kind named by a section key such as `execute-2`.
    #[must_use]
    pub fn from_key(key: &str) -> Option<Self> {
        if key == "central-manager" {
            return Some(Self::CentralManager);
        }
        let (base, suffix) = key.split_once('-').unwrap_or((key, "1"));
        if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        match base {
            "personal" => Some(Self::Personal),
            "execute" => Some(Self::Execute),
            "submit" => Some(Self::Submit),
            _ => None,
        }
    }

    /// Installation rank; lower ranks are configured first.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::CentralManager => 0,
            Self::Personal => 1,
            Self::Execute => 2,
            Self::Submit => 3,
        }
    }

    /// Name used in `use ROLE:` lines.
    #[must_use]
    pub const fn role_name(self) -> &'static str {
        match self {
            Self::CentralManager => "CentralManager",
            Self::Personal => "Personal",
            Self::Execute => "Execute",
            Self::Submit => "Submit",
        }
    }
}

impl fmt::Display for DaemonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CentralManager => "central-manager",
            Self::Personal => "personal",
            Self::Execute => "execute",
            Self::Submit => "submit",
        })
    }
}

/// Remote file name of the user fragment supplied by section `group`.
#[must_use]
pub fn user_config_name(group: &str) -> String {
    format!("kiso-{group}-config-file")
}

/// Lines of the `01-kiso` fragment for a machine running `daemons`.
///
/// `central_manager` is the pool's collector address; `interface` is the
/// machine's own preferred address.
#[must_use]
pub fn render_config(
    daemons: &BTreeSet<DaemonKind>,
    central_manager: Option<IpAddr>,
    interface: IpAddr,
) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(address) = central_manager {
        lines.push(format!("CONDOR_HOST = {address}"));
    }
    lines.push(format!("TRUST_DOMAIN = {TRUST_DOMAIN}"));
    for daemon in daemons {
        if *daemon == DaemonKind::Personal {
            lines = vec![
                String::from("CONDOR_HOST = $(IP_ADDRESS)"),
                String::from("use ROLE: CentralManager"),
                String::from("use ROLE: Submit"),
                String::from("use ROLE: Execute"),
            ];
            continue;
        }
        lines.push(format!("use ROLE: {}", daemon.role_name()));
        if *daemon == DaemonKind::Execute {
            lines.push(String::from("USE_CCB = True"));
            lines.push(String::from("CCB_ADDRESS = $(CONDOR_HOST)"));
        }
    }
    lines.push(format!("NETWORK_INTERFACE = {interface}"));
    lines
}
