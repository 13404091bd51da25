//! Loading and saving `kiso-state.json`.

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::files::{self, FileError};

use super::{STATE_VERSION, State};

/// Name of the state file inside an output directory.
pub const STATE_FILE_NAME: &str = "kiso-state.json";

/// Errors raised by [`StateStore`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StateError {
    /// Raised when the file cannot be read or written.
    #[error(transparent)]
    Files(#[from] FileError),
    /// Raised when the file is not valid state JSON.
    #[error("state file {path} is corrupt: {message}")]
    Corrupt {
        /// State file path.
        path: Utf8PathBuf,
        /// Decoder message.
        message: String,
    },
    /// Raised when the file was written by an incompatible version.
    #[error("state file {path} has unsupported version {version}")]
    UnsupportedVersion {
        /// State file path.
        path: Utf8PathBuf,
        /// Version found in the file.
        version: u32,
    },
    /// Raised when the file on disk belongs to another generation.
    #[error(
        "state file {path} belongs to generation {on_disk}, not {ours}; \
         it was replaced by another `up`"
    )]
    StaleGeneration {
        /// State file path.
        path: Utf8PathBuf,
        /// Generation found on disk.
        on_disk: Uuid,
        /// Generation being saved.
        ours: Uuid,
    },
}

#[derive(Deserialize)]
struct Header {
    version: u32,
    generation: Uuid,
}

/// Reads and writes the state of one output directory.
#[derive(Clone, Debug)]
pub struct StateStore {
    output_dir: Utf8PathBuf,
    path: Utf8PathBuf,
}

impl StateStore {
    /// Targets `output_dir`; nothing is touched until the first load or save.
    #[must_use]
    pub fn open(output_dir: &Utf8Path) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            path: output_dir.join(STATE_FILE_NAME),
        }
    }

    /// Output directory holding the state file and results.
    #[must_use]
    pub fn output_dir(&self) -> &Utf8Path {
        &self.output_dir
    }

    /// Path of the state file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Loads the persisted state, or a fresh one when none exists.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] when the file exists but cannot be read or
    /// decoded.
    pub fn load(&self) -> Result<State, StateError> {
        if !files::exists(&self.path)? {
            debug!(path = %self.path, "no state file; starting fresh");
            return Ok(State::new());
        }
        let contents = files::read_to_string(&self.path)?;
        let header = self.header(&contents)?;
        if header.version != STATE_VERSION {
            return Err(StateError::UnsupportedVersion {
                path: self.path.clone(),
                version: header.version,
            });
        }
        serde_json::from_str(&contents).map_err(|err| self.corrupt(&err))
    }

    /// Persists `state` atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::StaleGeneration`] when the file on disk belongs
    /// to another generation, or [`StateError::Files`] when writing fails.
    pub fn save(&self, state: &State) -> Result<(), StateError> {
        if files::exists(&self.path)? {
            let contents = files::read_to_string(&self.path)?;
            let on_disk = self.header(&contents)?.generation;
            if on_disk != state.generation {
                return Err(StateError::StaleGeneration {
                    path: self.path.clone(),
                    on_disk,
                    ours: state.generation,
                });
            }
        }
        let rendered = serde_json::to_string_pretty(state).map_err(|err| self.corrupt(&err))?;
        files::write_atomic(&self.path, &rendered)?;
        debug!(path = %self.path, stage = %state.stage, "saved state");
        Ok(())
    }

    /// Removes the state file, invalidating its generation.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Files`] when removal fails.
    pub fn discard(&self) -> Result<(), StateError> {
        files::remove_file(&self.path)?;
        Ok(())
    }

    fn header(&self, contents: &str) -> Result<Header, StateError> {
        serde_json::from_str(contents).map_err(|err| self.corrupt(&err))
    }

    fn corrupt(&self, err: &serde_json::Error) -> StateError {
        StateError::Corrupt {
            path: self.path.clone(),
            message: err.to_string(),
        }
    }
}
