//! Runs scrapes.
//!
//! A scrape evaluates every configured metric against each of its data sources. Each
//! `(driver, metric)` pair forms a group, and every data source of the group is handled by its
//! own task, called a unit:
//!
//! 1. render the query template
//! 2. look up the driver
//! 3. run the query
//! 4. project every returned record and send the resulting sample
//!
//! Query and projection failures of metrics with `continueIfError` are logged and skipped. Any
//! other failure aborts the remaining units of the group and becomes the scrape's error, while
//! samples already sent stay valid. After a group finished, its duration is emitted as a sample
//! and its `total_scrapes` counter is incremented.
use std::sync::Arc;

use quanta::Clock;
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info_span, warn, Instrument};

use crate::config::{Config, DataSource, MetricDesc};
use crate::driver::DriverError;
use crate::projector::{ProjectionError, Projector, Sample};
use crate::recorder::ScrapeRecorder;
use crate::registry::DriverRegistry;
use crate::template::{TemplateError, TemplateRenderer};

/// Failure of a single unit.
#[derive(Debug, Error)]
pub enum UnitError {
    /// No driver is registered for the group's driver kind.
    #[error("querier {0} not implemented yet")]
    DriverNotRegistered(String),

    /// The query template could not be rendered.
    #[error("failed to render query: {0}")]
    Template(#[from] TemplateError),

    /// The driver failed to run the query.
    #[error("failed to query {datasource} with {query:?}: {source}")]
    Query {
        /// The data source queried.
        datasource: String,
        /// The rendered query.
        query: String,
        /// What the driver reported.
        #[source]
        source: DriverError,
    },

    /// A record could not be turned into a sample.
    #[error("failed to create metric: {0}")]
    Projection(#[from] ProjectionError),

    /// The unit's task panicked.
    #[error("unit panicked: {0}")]
    Panicked(String),
}

/// A scrape failed because one of its groups failed.
#[derive(Debug, Error)]
#[error("failed to scrape metric {metric} with driver {driver}: {source}")]
pub struct ScrapeError {
    /// Driver kind of the failed group.
    pub driver: String,
    /// Metric name of the failed group.
    pub metric: String,
    /// The first hard failure of the group.
    #[source]
    pub source: UnitError,
}

/// How a unit finished without failing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitStatus {
    /// Every record turned into a sample.
    Complete,
    /// Some failure was skipped because the metric continues on errors.
    Degraded,
}

/// Everything one scrape produced.
#[derive(Debug)]
pub struct Scrape {
    /// Samples of every group, the duration samples and a snapshot of the scrape counters.
    pub samples: Vec<Sample>,
    /// The first failure of the scrape, if any.
    pub result: Result<(), ScrapeError>,
}

struct MetricJob {
    driver: String,
    metric: MetricDesc,
    datasources: Vec<DataSource>,
}

struct Inner {
    jobs: Vec<Arc<MetricJob>>,
    registry: DriverRegistry,
    renderer: TemplateRenderer,
    projector: Projector,
    recorder: ScrapeRecorder,
    clock: Clock,
    lock: Mutex<()>,
}

/// Scrapes the configured metrics.
///
/// Cheap to clone. Concurrent calls to [`Collector::collect`] are serialized.
#[derive(Clone)]
pub struct Collector {
    inner: Arc<Inner>,
}

impl Collector {
    /// Creates a collector for a validated configuration.
    pub fn new(namespace: &str, config: &Config, registry: DriverRegistry) -> Self {
        Self::with_clock(namespace, config, registry, Clock::new())
    }

    /// Creates a collector timing scrapes with the given clock.
    pub fn with_clock(namespace: &str, config: &Config, registry: DriverRegistry, clock: Clock) -> Self {
        let jobs = config
            .aggregations
            .iter()
            .flat_map(|(driver, metrics)| {
                metrics.iter().map(move |metric| {
                    Arc::new(MetricJob {
                        driver: driver.clone(),
                        metric: metric.desc.clone(),
                        datasources: metric.datasources.clone(),
                    })
                })
            })
            .collect();

        Collector {
            inner: Arc::new(Inner {
                jobs,
                registry,
                renderer: TemplateRenderer::new(),
                projector: Projector::new(namespace),
                recorder: ScrapeRecorder::new(namespace),
                clock,
                lock: Mutex::new(()),
            }),
        }
    }

    /// Driver kinds used by the configuration that have no registered driver.
    pub fn missing_drivers(&self) -> Vec<&str> {
        let mut missing = self
            .inner
            .jobs
            .iter()
            .map(|job| job.driver.as_str())
            .filter(|driver| !self.inner.registry.contains(driver))
            .collect::<Vec<_>>();
        missing.sort_unstable();
        missing.dedup();
        missing
    }

    /// The scrape counters.
    pub fn recorder(&self) -> &ScrapeRecorder {
        &self.inner.recorder
    }

    /// Runs one scrape, sending every sample to `tx`.
    ///
    /// Returns once every group finished.
    ///
    /// # Errors
    ///
    /// Returns the first hard failure among all groups. Every other group still runs to the end.
    pub async fn collect(&self, tx: UnboundedSender<Sample>) -> Result<(), ScrapeError> {
        let _guard = self.inner.lock.lock().await;

        let mut groups = JoinSet::new();
        for job in &self.inner.jobs {
            groups.spawn(run_group(self.inner.clone(), job.clone(), tx.clone()));
        }
        drop(tx);

        let mut result = Ok(());
        while let Some(joined) = groups.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
                Err(e) => error!(error = %e, "scrape group task failed"),
            }
        }
        result
    }

    /// Runs one scrape and gathers its samples, followed by the current scrape counters.
    pub async fn scrape(&self) -> Scrape {
        let (tx, mut rx) = unbounded_channel();
        let result = self.collect(tx).await;

        let mut samples = Vec::new();
        while let Ok(sample) = rx.try_recv() {
            samples.push(sample);
        }
        samples.extend(self.inner.recorder.samples());

        Scrape { samples, result }
    }
}

async fn run_group(
    inner: Arc<Inner>,
    job: Arc<MetricJob>,
    tx: UnboundedSender<Sample>,
) -> Result<(), ScrapeError> {
    let start = inner.clock.now();

    let mut units = JoinSet::new();
    for index in 0..job.datasources.len() {
        let span = info_span!(
            "unit",
            driver = %job.driver,
            metric = %job.metric,
            datasource = %job.datasources[index]
        );
        units.spawn(run_unit(inner.clone(), job.clone(), index, tx.clone()).instrument(span));
    }

    let mut degraded = false;
    let mut failure = None;
    while let Some(joined) = units.join_next().await {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => continue,
            Err(e) => Err(UnitError::Panicked(e.to_string())),
        };
        match outcome {
            Ok(UnitStatus::Complete) => {}
            Ok(UnitStatus::Degraded) => degraded = true,
            Err(e) if failure.is_none() => {
                units.abort_all();
                failure = Some(e);
            }
            Err(e) => debug!(error = %e, "dropping further failure of aborted group"),
        }
    }

    let elapsed = inner.clock.now().duration_since(start);
    let _ = tx.send(inner.recorder.duration_sample(&job.driver, &job.metric.name, elapsed));
    inner.recorder.increment(&job.driver, &job.metric.name, failure.is_none() && !degraded);

    match failure {
        None => Ok(()),
        Some(source) => {
            error!(driver = %job.driver, metric = %job.metric, error = %source, "failed to process");
            Err(ScrapeError { driver: job.driver.clone(), metric: job.metric.name.clone(), source })
        }
    }
}

async fn run_unit(
    inner: Arc<Inner>,
    job: Arc<MetricJob>,
    index: usize,
    tx: UnboundedSender<Sample>,
) -> Result<UnitStatus, UnitError> {
    let source = &job.datasources[index];
    let metric = &job.metric;

    let driver =
        inner.registry.get(&job.driver).ok_or_else(|| UnitError::DriverNotRegistered(job.driver.clone()))?;
    let query = inner.renderer.render(&metric.query)?;

    let records = match driver.query(source, &query).await {
        Ok(records) => records,
        Err(e) if metric.continue_if_error => {
            warn!(error = %e, "failed to query");
            return Ok(UnitStatus::Degraded);
        }
        Err(e) => {
            return Err(UnitError::Query { datasource: source.to_string(), query, source: e });
        }
    };
    debug!(records = records.len(), "query finished");

    let mut status = UnitStatus::Complete;
    for record in &records {
        match inner.projector.project(&job.driver, source, metric, record) {
            Ok(sample) => {
                let _ = tx.send(sample);
            }
            Err(e) if metric.continue_if_error => {
                warn!(error = %e, "failed to create metric");
                status = UnitStatus::Degraded;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::{Collector, UnitError};
    use crate::config::{Config, DataSource};
    use crate::driver::{Driver, DriverError, QueryFuture};
    use crate::formatting::render;
    use crate::record::{Record, Value};
    use crate::registry::DriverRegistry;
    use quanta::Clock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const CONFIG: &str = r#"
servers:
  - name: good
    uri: fake://good
  - name: bad
    uri: fake://bad
aggregations:
  fake:
    - name: users
      help: Number of users.
      query: "count {{ upper \"users\" }}"
      variableValue: value
      variableLabels: [status]
      continueIfError: true
      datasources:
        - name: good
          database: app
          table: users
        - name: bad
          database: app
          table: users
"#;

    fn fake(source: &DataSource, query: &str) -> Result<Vec<Record>, DriverError> {
        if source.name == "bad" {
            return Err(DriverError::NoResult(query.to_owned()));
        }
        assert_eq!(query, "count USERS");
        Ok(vec![
            [("value", Value::Int(3)), ("status", Value::from("active"))].into_iter().collect(),
            [("value", Value::Int(1)), ("status", Value::from("banned"))].into_iter().collect(),
        ])
    }

    fn registry() -> DriverRegistry {
        let mut registry = DriverRegistry::new();
        registry.register("fake", fake);
        registry
    }

    #[tokio::test]
    async fn test_continue_if_error_keeps_other_sources() {
        let config = Config::from_yaml_str(CONFIG).unwrap();
        let collector = Collector::new("qe", &config, registry());

        let scrape = collector.scrape().await;
        assert!(scrape.result.is_ok());

        let users = scrape.samples.iter().filter(|s| s.desc().fq_name() == "qe_fake_users").collect::<Vec<_>>();
        assert_eq!(users.len(), 2);
        assert!(users.iter().all(|s| s.label("name") == Some("good")));
        assert_eq!(users[0].label("status"), Some("active"));
        assert_eq!(users[0].value(), 3.0);

        assert_eq!(collector.recorder().total("fake", "users", false), 1);
        assert_eq!(collector.recorder().total("fake", "users", true), 0);

        let output = render(&scrape.samples);
        assert!(output.contains("qe_scrape_duration{driver=\"fake\",metric=\"users\"}"));
        assert!(output.contains("qe_total_scrapes{driver=\"fake\",metric=\"users\",success=\"false\"} 1\n"));
    }

    #[tokio::test]
    async fn test_same_metric_with_distinct_const_labels() {
        let doc = r#"
servers:
  - {name: a, uri: "fake://a"}
  - {name: b, uri: "fake://b"}
aggregations:
  fake:
    - name: users
      variableValue: value
      constLabels: {team: core}
      datasources: [{name: a}]
    - name: users
      variableValue: value
      constLabels: {team: ops}
      datasources: [{name: b}]
"#;
        let config = Config::from_yaml_str(doc).unwrap();
        let mut registry = DriverRegistry::new();
        registry.register("fake", |_: &DataSource, _: &str| -> Result<Vec<Record>, DriverError> {
            Ok(vec![[("value", Value::Int(1))].into_iter().collect()])
        });
        let collector = Collector::new("qe", &config, registry);

        let scrape = collector.scrape().await;
        assert!(scrape.result.is_ok());

        let output = render(&scrape.samples);
        assert!(output.contains("qe_fake_users{name=\"a\",database=\"\",table=\"\",team=\"core\"} 1\n"), "{output}");
        assert!(output.contains("qe_fake_users{name=\"b\",database=\"\",table=\"\",team=\"ops\"} 1\n"), "{output}");
        assert_eq!(output.matches("# TYPE qe_fake_users gauge").count(), 1);
    }

    #[tokio::test]
    async fn test_counters_accumulate_across_scrapes() {
        let config = Config::from_yaml_str(&CONFIG.replace("        - name: bad\n          database: app\n          table: users\n", ""))
            .unwrap();
        let collector = Collector::new("qe", &config, registry());

        for _ in 0..3 {
            assert!(collector.scrape().await.result.is_ok());
        }
        assert_eq!(collector.recorder().total("fake", "users", true), 3);
    }

    #[tokio::test]
    async fn test_projection_errors_are_skipped_with_continue_if_error() {
        let config = Config::from_yaml_str(CONFIG).unwrap();
        let mut registry = DriverRegistry::new();
        registry.register("fake", |_: &DataSource, _: &str| -> Result<Vec<Record>, DriverError> {
            Ok(vec![
                [("value", "n/a")].into_iter().collect(),
                [("value", "7")].into_iter().collect(),
            ])
        });
        let collector = Collector::new("qe", &config, registry);

        let scrape = collector.scrape().await;
        assert!(scrape.result.is_ok());
        let values = scrape
            .samples
            .iter()
            .filter(|s| s.desc().fq_name() == "qe_fake_users")
            .map(|s| s.value())
            .collect::<Vec<_>>();
        assert_eq!(values, vec![7.0, 7.0]);
        assert_eq!(collector.recorder().total("fake", "users", false), 1);
    }

    struct Slow {
        started: Arc<AtomicUsize>,
        finished: Arc<AtomicUsize>,
    }

    impl Driver for Slow {
        fn query<'a>(&'a self, source: &'a DataSource, _query: &'a str) -> QueryFuture<'a> {
            Box::pin(async move {
                self.started.fetch_add(1, Ordering::SeqCst);
                if source.name == "bad" {
                    return Err(DriverError::Decode("broken".to_owned()));
                }
                tokio::time::sleep(Duration::from_secs(3600)).await;
                self.finished.fetch_add(1, Ordering::SeqCst);
                Ok(Vec::new())
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_failure_cancels_siblings() {
        let config = Config::from_yaml_str(&CONFIG.replace("continueIfError: true", "continueIfError: false")).unwrap();
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let mut registry = DriverRegistry::new();
        registry.register("fake", Slow { started: started.clone(), finished: finished.clone() });
        let collector = Collector::new("qe", &config, registry);

        let scrape = collector.scrape().await;
        let err = scrape.result.unwrap_err();
        assert_eq!(err.driver, "fake");
        assert_eq!(err.metric, "users");
        assert!(matches!(err.source, UnitError::Query { source: DriverError::Decode(_), .. }));
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        assert_eq!(collector.recorder().total("fake", "users", false), 1);
    }

    #[tokio::test]
    async fn test_unknown_driver() {
        let config = Config::from_yaml_str(CONFIG).unwrap();
        let collector = Collector::new("qe", &config, DriverRegistry::new());
        assert_eq!(collector.missing_drivers(), vec!["fake"]);

        let err = collector.scrape().await.result.unwrap_err();
        assert!(matches!(err.source, UnitError::DriverNotRegistered(ref kind) if kind == "fake"));
    }

    #[tokio::test]
    async fn test_template_error_is_hard() {
        let config = Config::from_yaml_str(&CONFIG.replace("upper \\\"users\\\"", "nosuchfunc")).unwrap();
        let collector = Collector::new("qe", &config, registry());

        let err = collector.scrape().await.result.unwrap_err();
        assert!(matches!(err.source, UnitError::Template(_)));
    }

    #[tokio::test]
    async fn test_duration_uses_clock() {
        let config = Config::from_yaml_str(&CONFIG.replace("        - name: bad\n          database: app\n          table: users\n", ""))
            .unwrap();
        let (clock, mock) = Clock::mock();
        let mut registry = DriverRegistry::new();
        registry.register("fake", move |source: &DataSource, query: &str| {
            mock.increment(Duration::from_millis(1500));
            fake(source, query)
        });
        let collector = Collector::with_clock("qe", &config, registry, clock);

        let scrape = collector.scrape().await;
        let duration = scrape.samples.iter().find(|s| s.desc().fq_name() == "qe_scrape_duration").unwrap();
        assert_eq!(duration.value(), 1.5);
    }
}
