//! Declarative configuration: servers, and per-driver lists of metrics bound to data sources.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::formatting::sanitize_label_key;
use crate::projector::IDENTITY_LABELS;

/// The only metric type currently supported.
pub const TYPE_GAUGE: &str = "gauge";

/// Errors that make a configuration unusable.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path of the file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid YAML, or does not have the expected shape.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A server was declared without a name.
    #[error("name property is required for server with uri {uri:?}")]
    MissingServerName {
        /// URI of the nameless server.
        uri: String,
    },

    /// Two servers share a name.
    #[error("duplicate server {0}")]
    DuplicateServer(String),

    /// A data source references a server that was never declared.
    #[error("metric {metric} references unknown server {server}")]
    UnknownServer {
        /// Metric owning the data source.
        metric: String,
        /// Server name that failed to resolve.
        server: String,
    },

    /// Neither the data source nor its server provide a URI.
    #[error("metric {metric} has no uri for data source of server {server}")]
    MissingUri {
        /// Metric owning the data source.
        metric: String,
        /// Server name of the data source.
        server: String,
    },

    /// A metric declares a type other than `gauge`.
    #[error("unsupported type {kind} for metric {metric}")]
    UnsupportedType {
        /// Metric name.
        metric: String,
        /// Declared type.
        kind: String,
    },

    /// A metric does not say which field carries its value.
    #[error("variableValue field must be specified for metric {0}")]
    MissingValueField(String),

    /// Two labels of a metric end up with the same name once sanitized.
    ///
    /// Variable labels, the `name`, `database` and `table` labels of the data source, and constant
    /// labels all share one namespace.
    #[error("metric {metric} declares label {label} more than once")]
    DuplicateLabel {
        /// Metric name.
        metric: String,
        /// Sanitized label name.
        label: String,
    },

    /// Two metrics with the same name under one driver declare different label schemas.
    #[error("metric {metric} of driver {driver} is declared with conflicting labels")]
    ConflictingDescriptor {
        /// Driver kind.
        driver: String,
        /// Metric name.
        metric: String,
    },
}

/// A named endpoint that data sources point at.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Server {
    /// Unique name of the server.
    #[serde(default)]
    pub name: String,
    /// Connection URI handed to the driver.
    #[serde(default)]
    pub uri: String,
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A concrete query target: a server plus the database and table the query is about.
///
/// `uri` may be omitted, in which case the URI of the server with the same `name` is used.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct DataSource {
    /// Name of the server this data source belongs to.
    pub name: String,
    /// Connection URI; inherited from the server when empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uri: String,
    /// Database, attached to every sample as the `database` label.
    #[serde(default)]
    pub database: String,
    /// Table or collection, attached to every sample as the `table` label.
    #[serde(default)]
    pub table: String,
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Describes how to turn query results into a metric.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricDesc {
    /// Metric name, prefixed with the namespace and driver kind on exposition.
    pub name: String,
    /// Help text.
    #[serde(default)]
    pub help: String,
    /// Metric type. Only `gauge` is supported, and an empty type defaults to it.
    #[serde(default, rename = "type")]
    pub kind: String,
    /// Field of each result holding the sample value.
    #[serde(default)]
    pub variable_value: String,
    /// Query template.
    #[serde(default)]
    pub query: String,
    /// Fields of each result turned into labels.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variable_labels: Vec<String>,
    /// Labels with fixed values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub const_labels: BTreeMap<String, String>,
    /// Log and skip failures instead of failing the scrape.
    #[serde(default, skip_serializing_if = "is_false")]
    pub continue_if_error: bool,
    /// Report `0` for empty results instead of failing.
    #[serde(default, skip_serializing_if = "is_false")]
    pub allow_empty_value: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl MetricDesc {
    /// Checks the descriptor, defaulting an empty type to `gauge`.
    ///
    /// # Errors
    ///
    /// Fails if the type is not supported, no value field is set, or two labels share a name.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        match self.kind.as_str() {
            "" => self.kind = TYPE_GAUGE.to_owned(),
            TYPE_GAUGE => {}
            other => {
                return Err(ConfigError::UnsupportedType {
                    metric: self.name.clone(),
                    kind: other.to_owned(),
                })
            }
        }

        if self.variable_value.is_empty() {
            return Err(ConfigError::MissingValueField(self.name.clone()));
        }

        let mut seen = HashSet::new();
        let labels = self
            .variable_label_names()
            .chain(IDENTITY_LABELS.iter().map(|label| (*label).to_owned()))
            .chain(self.const_labels.keys().cloned());
        for label in labels {
            let label = sanitize_label_key(&label);
            if !seen.insert(label.clone()) {
                return Err(ConfigError::DuplicateLabel { metric: self.name.clone(), label });
            }
        }
        Ok(())
    }

    /// Label names of the dynamic labels, with dots replaced so they form valid label names.
    pub fn variable_label_names(&self) -> impl Iterator<Item = String> + '_ {
        self.variable_labels.iter().map(|label| label.replace('.', "_"))
    }
}

impl fmt::Display for MetricDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A metric descriptor together with the data sources it is evaluated against.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Metric {
    /// The descriptor.
    #[serde(flatten)]
    pub desc: MetricDesc,
    /// Data sources queried on every scrape.
    #[serde(default)]
    pub datasources: Vec<DataSource>,
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Config {
    /// Declared servers.
    #[serde(default)]
    pub servers: Vec<Server>,
    /// Metrics grouped by driver kind.
    #[serde(default)]
    pub aggregations: IndexMap<String, Vec<Metric>>,
}

impl Config {
    /// Parses and validates a YAML document.
    ///
    /// # Errors
    ///
    /// Fails if the document cannot be parsed or does not validate.
    pub fn from_yaml_str(document: &str) -> Result<Config, ConfigError> {
        let mut config: Config = serde_yaml::from_str(document)?;
        config.validate_and_set_defaults()?;
        Ok(config)
    }

    /// Reads, optionally expands environment variables in, parses and validates a file.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read, parsed, or does not validate.
    pub fn read_from_file<P: AsRef<Path>>(path: P, expand_env: bool) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;

        if expand_env {
            Config::from_yaml_str(&expand_vars(&raw, |name| std::env::var(name).ok()))
        } else {
            Config::from_yaml_str(&raw)
        }
    }

    /// Serializes the configuration back to YAML.
    ///
    /// # Errors
    ///
    /// Fails if serialization fails, which only happens for values YAML cannot represent.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validates the configuration, filling in data source URIs from their servers.
    ///
    /// # Errors
    ///
    /// Fails on nameless or duplicate servers, data sources referencing unknown servers or
    /// lacking a URI, invalid metric descriptors, and metrics sharing a name under one driver
    /// with different label schemas.
    pub fn validate_and_set_defaults(&mut self) -> Result<(), ConfigError> {
        let mut servers = HashMap::with_capacity(self.servers.len());
        for server in &self.servers {
            if server.name.is_empty() {
                return Err(ConfigError::MissingServerName { uri: server.uri.clone() });
            }
            if servers.insert(server.name.as_str(), server.uri.as_str()).is_some() {
                return Err(ConfigError::DuplicateServer(server.name.clone()));
            }
        }

        for (driver, metrics) in self.aggregations.iter_mut() {
            let mut schemas: HashMap<String, LabelSchema> = HashMap::new();

            for metric in metrics.iter_mut() {
                for source in metric.datasources.iter_mut() {
                    let uri = servers.get(source.name.as_str()).ok_or_else(|| {
                        ConfigError::UnknownServer {
                            metric: metric.desc.name.clone(),
                            server: source.name.clone(),
                        }
                    })?;
                    if source.uri.is_empty() {
                        source.uri = (*uri).to_owned();
                    }
                    if source.uri.is_empty() {
                        return Err(ConfigError::MissingUri {
                            metric: metric.desc.name.clone(),
                            server: source.name.clone(),
                        });
                    }
                }

                metric.desc.validate()?;

                let schema = LabelSchema::of(&metric.desc);
                match schemas.get(&metric.desc.name) {
                    Some(existing) if *existing != schema => {
                        return Err(ConfigError::ConflictingDescriptor {
                            driver: driver.clone(),
                            metric: metric.desc.name.clone(),
                        })
                    }
                    Some(_) => {}
                    None => {
                        schemas.insert(metric.desc.name.clone(), schema);
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(PartialEq)]
struct LabelSchema {
    variable: Vec<String>,
    constant: Vec<String>,
}

impl LabelSchema {
    fn of(desc: &MetricDesc) -> Self {
        Self {
            variable: desc.variable_label_names().collect(),
            constant: desc.const_labels.keys().cloned().collect(),
        }
    }
}

/// Replaces `$NAME` and `${NAME}` with the value returned by `lookup`.
///
/// Unknown variables expand to an empty string and `$$` produces a literal `$`. A `$` that is not
/// followed by a variable name is kept as-is.
pub fn expand_vars<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        output.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(stripped) = after.strip_prefix('$') {
            output.push('$');
            rest = stripped;
        } else if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => {
                    output.push_str(&lookup(&braced[..end]).unwrap_or_default());
                    rest = &braced[end + 1..];
                }
                None => {
                    output.push('$');
                    rest = after;
                }
            }
        } else {
            let len = after
                .char_indices()
                .find(|(i, c)| !(c.is_ascii_alphanumeric() || *c == '_') || (*i == 0 && c.is_ascii_digit()))
                .map_or(after.len(), |(i, _)| i);
            if len == 0 {
                output.push('$');
            } else {
                output.push_str(&lookup(&after[..len]).unwrap_or_default());
            }
            rest = &after[len..];
        }
    }

    output.push_str(rest);
    output
}
