//! Exposes the results of user-defined queries as Prometheus gauges.
//!
//! A [`Config`] declares servers, and per driver kind a list of metrics: a query template, which
//! field of each result holds the value, which fields become labels, and which data sources to
//! query. On every scrape, the [`Collector`] renders each query, runs it through the
//! [`Driver`](driver::Driver) registered for its kind, and projects every returned [`Record`] onto
//! a [`Sample`].
//!
//! ```no_run
//! # #[cfg(feature = "http-listener")]
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use queryexporter::{Config, ExporterBuilder};
//!
//! let config = Config::read_from_file("config.yaml", true)?;
//! let (_handle, exporter) = ExporterBuilder::new(config)
//!     .with_http_listener(([127, 0, 0, 1], 9696))
//!     .build()?;
//! exporter.await?;
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod common;
pub use self::common::{parse_duration, BuildError, InvalidDuration};

pub mod collector;
pub use self::collector::{Collector, Scrape, ScrapeError, UnitError, UnitStatus};

pub mod config;
pub use self::config::{Config, ConfigError, DataSource, Metric, MetricDesc, Server};

pub mod desc;
pub use self::desc::{Desc, DescCache, DescriptorConflict};

pub mod driver;
pub use self::driver::{Driver, DriverError};

mod exporter;
pub use self::exporter::builder::{ExporterBuilder, DEFAULT_NAMESPACE, DEFAULT_TELEMETRY_PATH};
#[cfg(feature = "http-listener")]
pub use self::exporter::ExporterFuture;
pub use self::exporter::{ExporterError, ExporterHandle};

pub mod formatting;

mod projector;
pub use self::projector::{ProjectionError, Projector, Sample, IDENTITY_LABELS};

mod record;
pub use self::record::{Record, Value};

mod recorder;
pub use self::recorder::ScrapeRecorder;

mod registry;
pub use self::registry::{DriverRegistry, DuplicateDriver};

pub mod template;
