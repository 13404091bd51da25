//! Per-machine choice of file-synchronisation primitive.
//!
//! A machine reachable over IPv4 is synchronised with `rsync`, which supports
//! incremental transfer and honours per-machine SSH overrides through
//! `--rsh`. Machines that are only reachable over IPv6 use `scp`, whose
//! proxy-command handling works with bracketed IPv6 hosts.

use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

use crate::inventory::Machine;

/// Default SSH port probed when a machine does not declare one.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Synchronisation primitive used for a machine.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TransportKind {
    /// Incremental transfer with `rsync` over SSH.
    Rsync,
    /// Recursive copy with `scp`.
    Scp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rsync => f.write_str("rsync"),
            Self::Scp => f.write_str("scp"),
        }
    }
}

/// Selected primitive and the address it connects to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Transport {
    /// Primitive to use.
    pub kind: TransportKind,
    /// Address the transfer connects to.
    pub address: IpAddr,
}

/// Errors raised while selecting a transport.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportError {
    /// Raised when a machine has no addresses at all.
    #[error("machine {machine} has no addresses")]
    NoAddresses {
        /// Machine identifier.
        machine: String,
    },
    /// Raised when none of a machine's addresses accepts connections.
    #[error("machine {machine} is unreachable on {}", render_addresses(.addresses))]
    Unreachable {
        /// Machine identifier.
        machine: String,
        /// Addresses that were probed.
        addresses: Vec<IpAddr>,
    },
}

fn render_addresses(addresses: &[IpAddr]) -> String {
    addresses
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Future returned by reachability probes.
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Answers whether a machine accepts connections on an address.
pub trait Reachability: Send + Sync {
    /// Probes `address` of `machine`.
    fn is_reachable<'a>(&'a self, machine: &'a Machine, address: IpAddr) -> ProbeFuture<'a>;
}

/// Probes the SSH port with a TCP connect.
///
/// Machines reached through a proxy command are trusted without probing,
/// because the proxy decides how the address is reached.
#[derive(Clone, Copy, Debug)]
pub struct TcpReachability {
    timeout: Duration,
}

impl TcpReachability {
    /// Creates a prober with the given connect timeout.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Reachability for TcpReachability {
    fn is_reachable<'a>(&'a self, machine: &'a Machine, address: IpAddr) -> ProbeFuture<'a> {
        Box::pin(async move {
            if machine.ssh.proxy_command.is_some() {
                return true;
            }
            let port = machine.ssh.port.unwrap_or(DEFAULT_SSH_PORT);
            let target = SocketAddr::new(address, port);
            let reachable = matches!(
                tokio::time::timeout(self.timeout, TcpStream::connect(target)).await,
                Ok(Ok(_))
            );
            debug!(machine = %machine.id, %target, reachable, "probed address");
            reachable
        })
    }
}

/// Reachability decided by a closure, for tests and offline planning.
#[derive(Clone, Copy, Debug)]
pub struct PredicateReachability<F> {
    predicate: F,
}

impl<F> PredicateReachability<F>
where
    F: Fn(&Machine, IpAddr) -> bool + Send + Sync,
{
    /// Wraps `predicate`.
    pub const fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> Reachability for PredicateReachability<F>
where
    F: Fn(&Machine, IpAddr) -> bool + Send + Sync,
{
    fn is_reachable<'a>(&'a self, machine: &'a Machine, address: IpAddr) -> ProbeFuture<'a> {
        let reachable = (self.predicate)(machine, address);
        Box::pin(async move { reachable })
    }
}

/// Chooses the transport for `machine`.
///
/// The first reachable IPv4 address selects `rsync`; failing that, the first
/// reachable IPv6 address selects `scp`. Addresses are probed in the order
/// the provider reported them.
///
/// # Errors
///
/// Returns [`TransportError::NoAddresses`] for a machine without addresses,
/// or [`TransportError::Unreachable`] when no address answers.
pub async fn select_transport(
    machine: &Machine,
    reachability: &dyn Reachability,
) -> Result<Transport, TransportError> {
    if machine.addresses.is_empty() {
        return Err(TransportError::NoAddresses {
            machine: machine.id.clone(),
        });
    }

    for address in machine.addresses.iter().filter(|address| address.is_ipv4()) {
        if reachability.is_reachable(machine, *address).await {
            return Ok(Transport {
                kind: TransportKind::Rsync,
                address: *address,
            });
        }
    }

    for address in machine.addresses.iter().filter(|address| address.is_ipv6()) {
        if reachability.is_reachable(machine, *address).await {
            return Ok(Transport {
                kind: TransportKind::Scp,
                address: *address,
            });
        }
    }

    Err(TransportError::Unreachable {
        machine: machine.id.clone(),
        addresses: machine.addresses.clone(),
    })
}
