//! Self-instrumentation of scrapes.
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use metrics::{Key, Label};
use metrics_util::registry::{AtomicStorage, Registry};
use metrics_util::MetricKind;

use crate::desc::{build_fq_name, Desc};
use crate::projector::Sample;

const COUNTER_LABELS: [&str; 3] = ["driver", "metric", "success"];
const DURATION_LABELS: [&str; 2] = ["driver", "metric"];

/// Keeps the `total_scrapes` counters across scrapes and builds `scrape_duration` samples.
///
/// Counters live in a [`Registry`] keyed by [`Key`], one per `(driver, metric, success)`
/// combination seen so far.
pub struct ScrapeRecorder {
    registry: Registry<Key, AtomicStorage>,
    total_scrapes: Arc<Desc>,
    scrape_duration: Arc<Desc>,
}

impl ScrapeRecorder {
    /// Creates a recorder whose metrics are prefixed with `namespace`.
    pub fn new(namespace: &str) -> Self {
        let no_labels = BTreeMap::new();
        ScrapeRecorder {
            registry: Registry::atomic(),
            total_scrapes: Arc::new(Desc::new(
                &build_fq_name(namespace, "", "total_scrapes"),
                "Current total scrapes.",
                COUNTER_LABELS,
                &no_labels,
                MetricKind::Counter,
            )),
            scrape_duration: Arc::new(Desc::new(
                &build_fq_name(namespace, "", "scrape_duration"),
                "Durations of scrapes",
                DURATION_LABELS,
                &no_labels,
                MetricKind::Gauge,
            )),
        }
    }

    /// Counts one finished scrape of `metric` through `driver`.
    pub fn increment(&self, driver: &str, metric: &str, success: bool) {
        let key = self.key(driver, metric, success);
        self.registry.get_or_create_counter(&key, |counter| counter.fetch_add(1, Ordering::Release));
    }

    /// Current value of a counter, `0` if it was never incremented.
    pub fn total(&self, driver: &str, metric: &str, success: bool) -> u64 {
        let key = self.key(driver, metric, success);
        let mut total = 0;
        self.registry.visit_counters(|k, counter| {
            if *k == key {
                total = counter.load(Ordering::Acquire);
            }
        });
        total
    }

    /// Builds the duration sample of one scrape of `metric` through `driver`.
    pub fn duration_sample(&self, driver: &str, metric: &str, elapsed: Duration) -> Sample {
        Sample::new(
            self.scrape_duration.clone(),
            elapsed.as_secs_f64(),
            vec![driver.to_owned(), metric.to_owned()],
        )
    }

    /// Snapshots every counter as a sample.
    pub fn samples(&self) -> Vec<Sample> {
        let mut samples = Vec::new();
        self.registry.visit_counters(|key, counter| {
            let label_values = COUNTER_LABELS
                .iter()
                .map(|name| {
                    key.labels()
                        .find(|label| label.key() == *name)
                        .map(|label| label.value().to_owned())
                        .unwrap_or_default()
                })
                .collect();
            samples.push(Sample::new(
                self.total_scrapes.clone(),
                counter.load(Ordering::Acquire) as f64,
                label_values,
            ));
        });
        samples
    }

    fn key(&self, driver: &str, metric: &str, success: bool) -> Key {
        let labels = vec![
            Label::new("driver", driver.to_owned()),
            Label::new("metric", metric.to_owned()),
            Label::new("success", success.to_string()),
        ];
        Key::from_parts(self.total_scrapes.fq_name().to_owned(), labels)
    }
}
