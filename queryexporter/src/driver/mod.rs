//! Backends that execute rendered queries.
//!
//! A [`Driver`] takes a data source and a rendered query and returns the result as a list of
//! [`Record`]s. Drivers are expected to cache their connections per data source URI, and must be
//! safe to call concurrently.
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;

use crate::config::DataSource;
use crate::record::Record;

#[cfg(feature = "http-driver")]
mod http;
#[cfg(feature = "http-driver")]
pub use self::http::HttpDriver;

#[cfg(feature = "mongo-driver")]
mod mongo;
#[cfg(feature = "mongo-driver")]
pub use self::mongo::MongoDriver;

#[cfg(feature = "redis-driver")]
mod redis;
#[cfg(feature = "redis-driver")]
pub use self::redis::RedisDriver;

#[cfg(feature = "sql-driver")]
mod sql;
#[cfg(feature = "sql-driver")]
pub use self::sql::SqlDriver;

/// Errors returned by drivers.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The query could not be understood by the driver.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The data source URI could not be used.
    #[error("invalid uri {uri:?}: {reason}")]
    InvalidUri {
        /// The offending URI.
        uri: String,
        /// Details about the failure.
        reason: String,
    },

    /// The backend answered, but with an error status.
    #[error("unexpected status {status}: {body}")]
    Status {
        /// Status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    /// The backend response could not be decoded into records.
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// The query produced no value.
    #[error("no result for {0}")]
    NoResult(String),

    /// The query did not finish in time.
    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    /// Any error raised by the backend client itself.
    #[error("{backend} error: {source}")]
    Backend {
        /// Name of the backend.
        backend: &'static str,
        /// Underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl DriverError {
    /// Wraps an error of a backend client.
    pub fn backend<E>(backend: &'static str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        DriverError::Backend { backend, source: Box::new(source) }
    }
}

/// Future returned by [`Driver::query`].
pub type QueryFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<Record>, DriverError>> + Send + 'a>>;

/// A backend capable of running queries.
pub trait Driver: Send + Sync {
    /// Runs `query` against `source`.
    fn query<'a>(&'a self, source: &'a DataSource, query: &'a str) -> QueryFuture<'a>;
}

/// Any thread-safe function with the right signature is a driver, which comes in handy for
/// backends that answer synchronously.
impl<F> Driver for F
where
    F: Fn(&DataSource, &str) -> Result<Vec<Record>, DriverError> + Send + Sync,
{
    fn query<'a>(&'a self, source: &'a DataSource, query: &'a str) -> QueryFuture<'a> {
        let result = self(source, query);
        Box::pin(async move { result })
    }
}
