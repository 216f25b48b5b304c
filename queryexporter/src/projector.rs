//! Turns query records into samples.
use std::sync::Arc;

use metrics_util::MetricKind;
use thiserror::Error;

use crate::config::{DataSource, MetricDesc};
use crate::desc::{build_fq_name, Desc, DescCache, DescriptorConflict};
use crate::record::Record;

/// Labels identifying the data source, appended after the dynamic labels of every sample.
pub const IDENTITY_LABELS: [&str; 3] = ["name", "database", "table"];

/// Errors from projecting a record onto a metric.
#[derive(Debug, Error, PartialEq)]
pub enum ProjectionError {
    /// The value field was not present in the record.
    #[error("value field {field} not found in result of metric {metric}")]
    MissingValueField {
        /// Metric name.
        metric: String,
        /// Configured value field.
        field: String,
    },

    /// The value field held something that cannot be turned into a number.
    #[error("value field {field} of metric {metric} holds unsupported {kind} value")]
    UnsupportedValueType {
        /// Metric name.
        metric: String,
        /// Configured value field.
        field: String,
        /// Kind of the value found.
        kind: &'static str,
    },

    /// The metric's descriptor conflicts with an existing one.
    #[error(transparent)]
    DescriptorConflict(#[from] DescriptorConflict),
}

/// A single observation: a value plus the values of its descriptor's labels.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    desc: Arc<Desc>,
    value: f64,
    label_values: Vec<String>,
}

impl Sample {
    /// Creates a sample.
    ///
    /// `label_values` must line up with [`Desc::label_names`].
    pub fn new(desc: Arc<Desc>, value: f64, label_values: Vec<String>) -> Self {
        debug_assert_eq!(desc.label_names().len(), label_values.len());
        Sample { desc, value, label_values }
    }

    /// Descriptor of the metric family.
    pub fn desc(&self) -> &Arc<Desc> {
        &self.desc
    }

    /// The observed value.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Values of the descriptor's variable labels, in order.
    pub fn label_values(&self) -> &[String] {
        &self.label_values
    }

    /// Gets the value of the label with the given name, including constant labels.
    pub fn label(&self, name: &str) -> Option<&str> {
        self.desc
            .label_names()
            .iter()
            .zip(&self.label_values)
            .chain(self.desc.const_labels().iter().map(|(k, v)| (k, v)))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Projects records onto metric samples, caching descriptors across scrapes.
#[derive(Clone)]
pub struct Projector {
    namespace: String,
    descs: DescCache,
}

impl Projector {
    /// Creates a projector for metrics prefixed with `namespace`.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), descs: DescCache::new() }
    }

    /// Namespace prefixed to every metric name.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Gets or builds the descriptor of a metric reported by a driver kind.
    ///
    /// # Errors
    ///
    /// Fails if a descriptor with the same name was already built with a different label schema.
    pub fn desc_for(&self, driver: &str, metric: &MetricDesc) -> Result<Arc<Desc>, DescriptorConflict> {
        let label_names = || metric.variable_label_names().chain(IDENTITY_LABELS.iter().map(|l| (*l).to_owned()));

        self.descs.get_or_build(
            (self.namespace.as_str(), driver, metric.name.as_str()),
            label_names(),
            &metric.const_labels,
            || {
                Desc::new(
                    &build_fq_name(self.namespace.as_str(), driver, metric.name.as_str()),
                    metric.help.clone(),
                    label_names(),
                    &metric.const_labels,
                    MetricKind::Gauge,
                )
            },
        )
    }

    /// Projects one record of a query result onto a sample.
    ///
    /// An empty record yields `0` when the metric allows empty values. Otherwise the value field is
    /// resolved and coerced to a float, while each label field is resolved and stringified, with
    /// missing labels left empty. The data source's server name, database and table are attached
    /// as the final labels.
    ///
    /// # Errors
    ///
    /// Fails if the value field is missing or not numeric, or if the descriptor conflicts.
    pub fn project(
        &self,
        driver: &str,
        source: &DataSource,
        metric: &MetricDesc,
        record: &Record,
    ) -> Result<Sample, ProjectionError> {
        let value = if record.is_empty() && metric.allow_empty_value {
            0.0
        } else {
            let found = record.lookup(&metric.variable_value).ok_or_else(|| {
                ProjectionError::MissingValueField {
                    metric: metric.name.clone(),
                    field: metric.variable_value.clone(),
                }
            })?;
            found.as_f64().ok_or_else(|| ProjectionError::UnsupportedValueType {
                metric: metric.name.clone(),
                field: metric.variable_value.clone(),
                kind: found.kind(),
            })?
        };

        let desc = self.desc_for(driver, metric)?;

        let mut label_values = Vec::with_capacity(metric.variable_labels.len() + IDENTITY_LABELS.len());
        label_values.extend(metric.variable_labels.iter().map(|label| record.label_value(label)));
        label_values.push(source.name.clone());
        label_values.push(source.database.clone());
        label_values.push(source.table.clone());

        Ok(Sample::new(desc, value, label_values))
    }
}
