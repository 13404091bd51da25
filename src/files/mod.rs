//! Capability-scoped helpers for the local files Kiso reads and writes.
//!
//! Experiment documents, the state file, generated host maps, and collected
//! results all go through these helpers so every path is opened relative to
//! an ambient directory handle from `cap-std`.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

/// Errors raised while touching local files.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("failed to access {path}: {message}")]
pub struct FileError {
    /// Path that could not be accessed.
    pub path: Utf8PathBuf,
    /// Human-readable error message.
    pub message: String,
}

impl FileError {
    fn new(path: &Utf8Path, err: &io::Error) -> Self {
        Self {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

fn split(path: &Utf8Path) -> Result<(&Utf8Path, &str), FileError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    let file_name = path.file_name().ok_or_else(|| FileError {
        path: path.to_path_buf(),
        message: String::from("path is missing a file name"),
    })?;
    Ok((parent, file_name))
}

fn open_dir(path: &Utf8Path) -> Result<Dir, FileError> {
    Dir::open_ambient_dir(path, ambient_authority()).map_err(|err| FileError::new(path, &err))
}

/// Creates `path` and any missing parents.
///
/// # Errors
///
/// Returns [`FileError`] when a directory cannot be created.
pub fn ensure_dir(path: &Utf8Path) -> Result<(), FileError> {
    Dir::create_ambient_dir_all(path, ambient_authority()).map_err(|err| FileError::new(path, &err))
}

/// Returns whether `path` exists.
///
/// # Errors
///
/// Returns [`FileError`] when the parent directory exists but cannot be read.
pub fn exists(path: &Utf8Path) -> Result<bool, FileError> {
    let (parent, file_name) = split(path)?;
    match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir
            .try_exists(file_name)
            .map_err(|err| FileError::new(path, &err)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(FileError::new(parent, &err)),
    }
}

/// Reads `path` into a string.
///
/// # Errors
///
/// Returns [`FileError`] when the file cannot be opened or is not UTF-8.
pub fn read_to_string(path: &Utf8Path) -> Result<String, FileError> {
    let (parent, file_name) = split(path)?;
    open_dir(parent)?
        .read_to_string(file_name)
        .map_err(|err| FileError::new(path, &err))
}

/// Writes `contents` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`FileError`] when the parent cannot be created or the write
/// fails.
pub fn write(path: &Utf8Path, contents: &str) -> Result<(), FileError> {
    let (parent, file_name) = split(path)?;
    ensure_dir(parent)?;
    open_dir(parent)?
        .write(file_name, contents)
        .map_err(|err| FileError::new(path, &err))
}

/// Writes `contents` next to `path` and renames the temporary file into
/// place so readers never observe a partial write.
///
/// # Errors
///
/// Returns [`FileError`] when writing or renaming fails.
pub fn write_atomic(path: &Utf8Path, contents: &str) -> Result<(), FileError> {
    let (parent, file_name) = split(path)?;
    ensure_dir(parent)?;
    let dir = open_dir(parent)?;
    let temporary = format!(".{file_name}.tmp");
    dir.write(&temporary, contents)
        .map_err(|err| FileError::new(&parent.join(&temporary), &err))?;
    dir.rename(&temporary, &dir, file_name)
        .map_err(|err| FileError::new(path, &err))
}

/// Removes the file at `path`. Missing files are ignored.
///
/// # Errors
///
/// Returns [`FileError`] when removal fails for any other reason.
pub fn remove_file(path: &Utf8Path) -> Result<(), FileError> {
    let (parent, file_name) = split(path)?;
    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(FileError::new(parent, &err)),
    };
    match dir.remove_file(file_name) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(FileError::new(path, &err)),
    }
}

/// Recursively removes the directory at `path`. Missing directories are
/// ignored.
///
/// # Errors
///
/// Returns [`FileError`] when removal fails for any other reason.
pub fn remove_dir_all(path: &Utf8Path) -> Result<(), FileError> {
    let (parent, dir_name) = split(path)?;
    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(FileError::new(parent, &err)),
    };
    match dir.remove_dir_all(dir_name) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(FileError::new(path, &err)),
    }
}
