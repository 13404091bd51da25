//! Machines, role labels, and their resolution into concrete machine sets.

mod machine;
mod plan;
mod roles;

pub use machine::{Machine, SshParams};
pub use plan::plan;
pub use roles::{RESERVED_ROLE_PREFIX, RoleMap, UnresolvedRoleError, site_label};
