//! Experiment documents: loading, validation, and the typed model.
//!
//! A document is read as YAML, converted to JSON, validated against
//! [`root_schema`], and only then decoded. Invalid documents are rejected
//! wholesale with every schema violation listed.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::files::{self, FileError};
use crate::schema::{self, SchemaViolation, render_violations};

mod checks;
mod document_schema;

pub use document_schema::{COMMON_EXPERIMENT_KEYS, roles_schema, root_schema, script_schema};

/// Interpreter used for scripts that do not name one.
pub const DEFAULT_EXECUTABLE: &str = "/bin/bash";

/// Errors raised while loading or checking an experiment document.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Raised when the document cannot be read.
    #[error(transparent)]
    Io(#[from] FileError),
    /// Raised when the document is not valid YAML.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Document path.
        path: Utf8PathBuf,
        /// Parser message.
        message: String,
    },
    /// Raised when the document violates a schema.
    #[error("experiment document is invalid:\n{}", render_violations(.violations))]
    Schema {
        /// Every violation found.
        violations: Vec<SchemaViolation>,
    },
    /// Raised when a schema-valid document is inconsistent.
    #[error("experiment document failed checks:\n{}", render_problems(.problems))]
    Invalid {
        /// Every problem found.
        problems: Vec<String>,
    },
    /// Raised when a validated section does not decode into its type.
    #[error("failed to decode {context}: {message}")]
    Decode {
        /// Section being decoded.
        context: String,
        /// Decoder message.
        message: String,
    },
}

fn render_problems(problems: &[String]) -> String {
    problems
        .iter()
        .map(|problem| format!("  - {problem}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// A machine request inside a site.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct MachineRequest {
    /// Roles assigned to every machine of the request.
    pub roles: Vec<String>,
    /// How many machines the request yields.
    #[serde(default = "one")]
    pub number: u32,
}

/// Resources declared by a site.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct SiteResources {
    /// Machine requests, in document order.
    pub machines: Vec<MachineRequest>,
}

/// One provisioning request targeting a single provider.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SiteSpec {
    /// Provider key, for example `static` or `vagrant`.
    pub kind: String,
    /// Optional human-readable site name.
    #[serde(default)]
    pub name: Option<String>,
    /// Declared resources.
    pub resources: SiteResources,
    /// The complete site body handed to the provisioner.
    #[serde(skip)]
    pub raw: Value,
}

impl SiteSpec {
    /// Label identifying the site: its name, or its position in the document.
    #[must_use]
    pub fn label(&self, index: usize) -> String {
        self.name.clone().unwrap_or_else(|| index.to_string())
    }
}

/// A file transfer bound to roles.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Transfer {
    /// Roles whose machines take part.
    pub roles: Vec<String>,
    /// Source path: local for inputs, remote for outputs.
    pub src: String,
    /// Destination path: remote for inputs, local for outputs.
    pub dst: String,
}

/// An inline script bound to roles.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Script {
    /// Roles whose machines run the script.
    pub roles: Vec<String>,
    /// Script body.
    pub script: String,
    /// Interpreter invoked with `-c`.
    #[serde(default = "default_executable")]
    pub executable: String,
}

/// A named section of the `software` or `deployment` mapping.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PluginSection {
    /// Plugin kind.
    pub kind: String,
    /// Section body.
    pub config: Value,
}

/// One experiment to execute.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ExperimentEntry {
    /// Experiment plugin kind.
    pub kind: String,
    /// Unique experiment name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Number of iterations.
    #[serde(default = "one")]
    pub count: u32,
    /// Variables exported to scripts, overriding document variables.
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    /// Files pushed before the experiment.
    #[serde(default)]
    pub inputs: Vec<Transfer>,
    /// Scripts run before the experiment.
    #[serde(default)]
    pub setup: Vec<Script>,
    /// Scripts run after the experiment.
    #[serde(default)]
    pub post_scripts: Vec<Script>,
    /// Files pulled after the experiment.
    #[serde(default)]
    pub outputs: Vec<Transfer>,
    /// The complete entry as written.
    #[serde(skip)]
    pub raw: Value,
}

impl ExperimentEntry {
    /// Kind-specific keys handed to the plugin.
    #[must_use]
    pub fn plugin_config(&self) -> Value {
        let mut config = match &self.raw {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        for key in COMMON_EXPERIMENT_KEYS {
            config.remove(key);
        }
        Value::Object(config)
    }

    /// Variables visible to the experiment's scripts.
    #[must_use]
    pub fn variables_over(&self, document: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
        let mut merged = document.clone();
        merged.extend(
            self.variables
                .iter()
                .map(|(name, value)| (name.clone(), value.clone())),
        );
        merged
    }

    /// Every role the common sections reference, tagged with the section.
    #[must_use]
    pub fn referenced_roles(&self) -> Vec<(String, &str)> {
        let mut referenced = Vec::new();
        let transfers = [("inputs", &self.inputs), ("outputs", &self.outputs)];
        for (section, items) in transfers {
            for (index, item) in items.iter().enumerate() {
                referenced.extend(
                    item.roles
                        .iter()
                        .map(|role| (format!("{section}[{index}]"), role.as_str())),
                );
            }
        }
        let scripts = [("setup", &self.setup), ("post-scripts", &self.post_scripts)];
        for (section, items) in scripts {
            for (index, item) in items.iter().enumerate() {
                referenced.extend(
                    item.roles
                        .iter()
                        .map(|role| (format!("{section}[{index}]"), role.as_str())),
                );
            }
        }
        referenced
    }
}

#[derive(Deserialize)]
struct Document {
    name: String,
    #[serde(default)]
    variables: BTreeMap<String, Value>,
    sites: Vec<Value>,
    #[serde(default)]
    software: Map<String, Value>,
    #[serde(default)]
    deployment: Map<String, Value>,
    experiments: Vec<Value>,
}

/// A validated experiment document.
#[derive(Clone, Debug, PartialEq)]
pub struct ExperimentSpec {
    /// Experiment name.
    pub name: String,
    /// Document-wide variables.
    pub variables: BTreeMap<String, Value>,
    /// Sites, in document order.
    pub sites: Vec<SiteSpec>,
    /// Software sections, in document order.
    pub software: Vec<PluginSection>,
    /// Deployment sections, in document order.
    pub deployment: Vec<PluginSection>,
    /// Experiments, in document order.
    pub experiments: Vec<ExperimentEntry>,
    /// Directory holding the document; relative paths resolve against it.
    pub working_dir: Utf8PathBuf,
}

impl ExperimentSpec {
    /// Loads and validates the document at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed, or
    /// when it violates the root schema.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let contents = files::read_to_string(path)?;
        let document: Value =
            serde_yaml::from_str(&contents).map_err(|err| ConfigError::Parse {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
        Self::from_value(document, working_dir_of(path)?)
    }

    /// Validates and decodes an already parsed document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Schema`] with every violation, or
    /// [`ConfigError::Decode`] when a section cannot be decoded.
    pub fn from_value(document: Value, working_dir: Utf8PathBuf) -> Result<Self, ConfigError> {
        schema::validate(&root_schema(), &document, "experiment")
            .map_err(|violations| ConfigError::Schema { violations })?;
        let parsed: Document = decode(document, "experiment")?;

        let sites = parsed
            .sites
            .into_iter()
            .enumerate()
            .map(|(index, raw)| {
                let mut site: SiteSpec = decode(raw.clone(), &format!("sites[{index}]"))?;
                site.raw = raw;
                Ok(site)
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        let experiments = parsed
            .experiments
            .into_iter()
            .enumerate()
            .map(|(index, raw)| {
                let mut entry: ExperimentEntry =
                    decode(raw.clone(), &format!("experiments[{index}]"))?;
                entry.raw = raw;
                Ok(entry)
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(Self {
            name: parsed.name,
            variables: parsed.variables,
            sites,
            software: sections(parsed.software),
            deployment: sections(parsed.deployment),
            experiments,
            working_dir,
        })
    }
}

fn sections(map: Map<String, Value>) -> Vec<PluginSection> {
    map.into_iter()
        .map(|(kind, config)| PluginSection { kind, config })
        .collect()
}

fn decode<T: serde::de::DeserializeOwned>(value: Value, context: &str) -> Result<T, ConfigError> {
    serde_json::from_value(value).map_err(|err| ConfigError::Decode {
        context: context.to_owned(),
        message: err.to_string(),
    })
}

fn working_dir_of(path: &Utf8Path) -> Result<Utf8PathBuf, ConfigError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    parent.canonicalize_utf8().map_err(|err| {
        ConfigError::Io(FileError {
            path: parent.to_path_buf(),
            message: err.to_string(),
        })
    })
}

const fn one() -> u32 {
    1
}

fn default_executable() -> String {
    DEFAULT_EXECUTABLE.to_owned()
}
