#[cfg(feature = "http-listener")]
use std::future::Future;
#[cfg(feature = "http-listener")]
use std::pin::Pin;

use thiserror::Error;
use tracing::error;

use crate::collector::{Collector, Scrape};
use crate::formatting::render;

/// Error types possible from an exporter
#[derive(Debug, Error)]
pub enum ExporterError {
    /// The listening socket could not be set up or failed.
    #[error("http listener failed: {0}")]
    HttpListener(#[from] std::io::Error),
}

/// Convenience type for Future implementing an exporter.
#[cfg(feature = "http-listener")]
pub type ExporterFuture = Pin<Box<dyn Future<Output = Result<(), ExporterError>> + Send + 'static>>;

/// Handle for running scrapes and rendering their results.
#[derive(Clone)]
pub struct ExporterHandle {
    collector: Collector,
}

impl ExporterHandle {
    pub(crate) fn new(collector: Collector) -> Self {
        Self { collector }
    }

    /// The underlying collector.
    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    /// Runs a scrape.
    pub async fn scrape(&self) -> Scrape {
        self.collector.scrape().await
    }

    /// Runs a scrape and renders it in the Prometheus text exposition format.
    ///
    /// A failed scrape is logged and still rendered: samples gathered before the failure remain
    /// valid, and the failure shows up in the `total_scrapes` counter.
    pub async fn render(&self) -> String {
        let Scrape { samples, result } = self.scrape().await;
        if let Err(e) = result {
            error!(error = %e, "scrape failed");
        }
        render(&samples)
    }
}

#[cfg(feature = "http-listener")]
mod http_listener;

pub(crate) mod builder;
