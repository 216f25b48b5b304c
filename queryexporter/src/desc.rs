//! Metric descriptors and their process-wide cache.
use std::collections::BTreeMap;
use std::sync::Arc;

use metrics_util::MetricKind;
use scc::HashMap;

use crate::formatting::{sanitize_label_key, sanitize_metric_name};

/// Immutable description of a metric family: its name, help text and label schema.
#[derive(Debug, PartialEq)]
pub struct Desc {
    fq_name: String,
    help: String,
    label_names: Vec<String>,
    const_labels: Vec<(String, String)>,
    kind: MetricKind,
}

impl Desc {
    /// Creates a descriptor, sanitizing the name and label keys.
    ///
    /// `label_names` are the labels whose values vary per sample, in the order samples supply
    /// their values.
    pub fn new<I>(
        fq_name: &str,
        help: impl Into<String>,
        label_names: I,
        const_labels: &BTreeMap<String, String>,
        kind: MetricKind,
    ) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        Desc {
            fq_name: sanitize_metric_name(fq_name),
            help: help.into(),
            label_names: label_names.into_iter().map(|name| sanitize_label_key(name.as_ref())).collect(),
            const_labels: const_labels
                .iter()
                .map(|(k, v)| (sanitize_label_key(k), v.clone()))
                .collect(),
            kind,
        }
    }

    /// Fully qualified metric name.
    pub fn fq_name(&self) -> &str {
        &self.fq_name
    }

    /// Help text.
    pub fn help(&self) -> &str {
        &self.help
    }

    /// Names of the labels each sample provides values for.
    pub fn label_names(&self) -> &[String] {
        &self.label_names
    }

    /// Labels with fixed values, sorted by name.
    pub fn const_labels(&self) -> &[(String, String)] {
        &self.const_labels
    }

    /// Metric type.
    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Whether this descriptor was built from the given variable labels and constant labels.
    pub fn has_schema<I>(&self, label_names: I, const_labels: &BTreeMap<String, String>) -> bool
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut names = label_names.into_iter();
        let variable_match = self
            .label_names
            .iter()
            .all(|own| names.next().is_some_and(|name| sanitize_label_key(name.as_ref()) == *own))
            && names.next().is_none();

        variable_match
            && self.const_labels.len() == const_labels.len()
            && self
                .const_labels
                .iter()
                .zip(const_labels)
                .all(|((own_key, own_value), (key, value))| sanitize_label_key(key) == *own_key && own_value == value)
    }
}

/// Joins the non-empty parts of a metric name with underscores.
pub fn build_fq_name(namespace: &str, subsystem: &str, name: &str) -> String {
    [namespace, subsystem, name].iter().filter(|part| !part.is_empty()).copied().collect::<Vec<_>>().join("_")
}

/// A descriptor was requested with a label schema differing from the cached one.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("descriptor {fq_name} already exists with a different label schema")]
pub struct DescriptorConflict {
    /// Name of the conflicting metric family.
    pub fq_name: String,
}

type DescKey = (String, String, String, Vec<(String, String)>);

/// Process-wide cache of descriptors keyed by `(namespace, subsystem, name)` and constant labels.
///
/// Metrics sharing a name but carrying different constant label values get one descriptor each,
/// and are rendered as a single family.
#[derive(Clone, Default)]
pub struct DescCache {
    descs: Arc<HashMap<DescKey, Arc<Desc>>>,
}

impl DescCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached descriptor for the key, building it with `build` if it is missing.
    ///
    /// Construction happens while the entry is locked, so at most one descriptor is ever built
    /// per key and every caller observes the same `Arc`. If the cached descriptor was built from a
    /// different label schema than the one given, an error is returned instead.
    pub fn get_or_build<I, F>(
        &self,
        (namespace, subsystem, name): (&str, &str, &str),
        label_names: I,
        const_labels: &BTreeMap<String, String>,
        build: F,
    ) -> Result<Arc<Desc>, DescriptorConflict>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        F: FnOnce() -> Desc,
    {
        let consts = const_labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let key = (namespace.to_owned(), subsystem.to_owned(), name.to_owned(), consts);
        let desc = match self.descs.read(&key, |_, desc| desc.clone()) {
            Some(desc) => desc,
            None => self.descs.entry(key).or_insert_with(|| Arc::new(build())).get().clone(),
        };

        if desc.has_schema(label_names, const_labels) {
            Ok(desc)
        } else {
            Err(DescriptorConflict { fq_name: desc.fq_name.clone() })
        }
    }

    /// Number of cached descriptors.
    pub fn len(&self) -> usize {
        self.descs.len()
    }

    /// Whether no descriptor was built yet.
    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }
}
