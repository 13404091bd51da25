//! Path helpers for remote commands.

use shell_escape::unix::escape;

/// Expands a leading `~/` prefix to the local user's home directory.
///
/// The input is returned unchanged when `HOME` is unset.
///
/// # Examples
///
/// ```
/// # use kiso::remote::expand_tilde;
/// assert_eq!(expand_tilde("/absolute/key"), "/absolute/key");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

/// Resolves `path` against the remote working directory unless it is
/// absolute or home-relative.
#[must_use]
pub fn remote_path(working_dir: &str, path: &str) -> String {
    if path.starts_with('/') || path.starts_with('~') {
        return path.to_owned();
    }
    let trimmed = path.strip_prefix("./").unwrap_or(path);
    format!("{}/{trimmed}", working_dir.trim_end_matches('/'))
}

/// Shell-quotes `value` for a POSIX shell.
#[must_use]
pub fn quote(value: &str) -> String {
    escape(value.into()).into_owned()
}

/// Wraps `script` so it runs as root, through `sudo` unless the SSH user
/// already is root.
#[must_use]
pub fn as_root(script: &str) -> String {
    let quoted = quote(script);
    format!("if [ \"$(id -u)\" -eq 0 ]; then sh -c {quoted}; else sudo sh -c {quoted}; fi")
}
