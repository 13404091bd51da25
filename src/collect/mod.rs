//! Result collection: pulling experiment outputs back from machines.
//!
//! Every output lands in `<result_dir>/<dst>/<machine-id>/`. Failures never
//! abort collection; they come back as [`CollectionWarning`]s.

use std::convert::Infallible;
use std::fmt;

use camino::Utf8Path;
use tracing::{debug, warn};

use crate::experiment::Transfer;
use crate::files;
use crate::inventory::{Machine, RoleMap};
use crate::remote::{RemoteRunner, for_each_machine, remote_path};

/// An output that could not be collected from one machine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CollectionWarning {
    /// Position of the output in the experiment entry.
    pub output: usize,
    /// Machine identifier.
    pub machine: String,
    /// What went wrong.
    pub message: String,
}

impl fmt::Display for CollectionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "output {} from {}: {}",
            self.output, self.machine, self.message
        )
    }
}

/// Where results are fetched from and stored.
#[derive(Clone, Copy, Debug)]
pub struct Collection<'a> {
    /// Remote working directory relative sources resolve against.
    pub remote_working_dir: &'a str,
    /// Local directory of the iteration.
    pub result_dir: &'a Utf8Path,
    /// Upper bound on concurrent pulls.
    pub max_workers: usize,
}

async fn pull_one(
    remote: &dyn RemoteRunner,
    machine: &Machine,
    index: usize,
    output: &Transfer,
    target: Collection<'_>,
) -> Option<CollectionWarning> {
    let warning = |message: String| CollectionWarning {
        output: index,
        machine: machine.id.clone(),
        message,
    };
    let destination = target.result_dir.join(&output.dst).join(&machine.id);
    if let Err(err) = files::ensure_dir(&destination) {
        return Some(warning(err.to_string()));
    }
    let source = remote_path(target.remote_working_dir, &output.src);
    match remote.pull(machine, &source, &destination).await {
        Ok(transport) => {
            debug!(machine = %machine.id, %source, transport = %transport.kind, "collected output");
            None
        }
        Err(err) => Some(warning(err.to_string())),
    }
}

/// Pulls every output from every machine its roles select.
///
/// Outputs whose roles select nothing are skipped.
pub async fn collect_outputs(
    remote: &dyn RemoteRunner,
    roles: &RoleMap,
    outputs: &[Transfer],
    target: Collection<'_>,
) -> Vec<CollectionWarning> {
    let mut warnings = Vec::new();
    for (index, output) in outputs.iter().enumerate() {
        let machines = roles.select(output.roles.as_slice());
        if machines.is_empty() {
            debug!(output = index, "no machine holds the output roles; skipping");
            continue;
        }
        let results = for_each_machine(&machines, target.max_workers, |machine| async move {
            Ok::<_, Infallible>(pull_one(remote, machine, index, output, target).await)
        })
        .await;
        let Ok(found) = results;
        warnings.extend(found.into_iter().flatten());
    }
    for warning in &warnings {
        warn!(%warning, "result collection incomplete");
    }
    warnings
}
