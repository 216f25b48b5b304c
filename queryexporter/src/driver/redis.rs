//! Redis `get`, `hget` and `hgetall` lookups.
use std::collections::HashMap as StdHashMap;

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use scc::HashMap;
use tracing::debug;

use super::{Driver, DriverError, QueryFuture};
use crate::config::DataSource;
use crate::record::Record;

const BACKEND: &str = "redis";

/// Field holding the reply of `get` and `hget` queries.
pub const VALUE_FIELD: &str = "value";

/// Queries Redis.
///
/// Supported queries are `get KEY` and `hget KEY FIELD`, which produce a single record whose
/// `value` field holds the reply, and `hgetall KEY`, which produces a single record holding the
/// whole hash. One multiplexed connection is kept per data source URI.
#[derive(Default)]
pub struct RedisDriver {
    connections: HashMap<String, MultiplexedConnection>,
}

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Get(&'a str),
    HGet(&'a str, &'a str),
    HGetAll(&'a str),
}

impl<'a> Command<'a> {
    fn parse(query: &'a str) -> Result<Self, DriverError> {
        let parts = query.split_whitespace().collect::<Vec<_>>();
        let unsupported = || DriverError::InvalidQuery(format!("unsupported redis query {query:?}"));

        let (name, args) = parts.split_first().ok_or_else(unsupported)?;
        match (name.to_ascii_lowercase().as_str(), args) {
            ("get", [key, ..]) => Ok(Command::Get(*key)),
            ("hget", [key, field]) => Ok(Command::HGet(*key, *field)),
            ("hget", _) => Err(DriverError::InvalidQuery(format!("hget expects a key and a field: {query:?}"))),
            ("hgetall", [key, ..]) => Ok(Command::HGetAll(*key)),
            _ => Err(unsupported()),
        }
    }
}

impl RedisDriver {
    /// Creates a driver without any connection.
    pub fn new() -> Self {
        Self::default()
    }

    async fn connection(&self, uri: &str) -> Result<MultiplexedConnection, DriverError> {
        if let Some(connection) = self.connections.read_async(uri, |_, c| c.clone()).await {
            return Ok(connection);
        }

        let client = redis::Client::open(uri)
            .map_err(|e| DriverError::InvalidUri { uri: uri.to_owned(), reason: e.to_string() })?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| DriverError::backend(BACKEND, e))?;
        debug!(%uri, "opened redis connection");

        Ok(self.connections.entry_async(uri.to_owned()).await.or_insert(connection).get().clone())
    }
}

impl Driver for RedisDriver {
    fn query<'a>(&'a self, source: &'a DataSource, query: &'a str) -> QueryFuture<'a> {
        Box::pin(async move {
            let command = Command::parse(query)?;
            let mut connection = self.connection(&source.uri).await?;

            let mut record = Record::new();
            match command {
                Command::Get(key) => {
                    let value: Option<String> =
                        connection.get(key).await.map_err(|e| DriverError::backend(BACKEND, e))?;
                    record.insert(VALUE_FIELD, value.ok_or_else(|| DriverError::NoResult(query.to_owned()))?);
                }
                Command::HGet(key, field) => {
                    let value: Option<String> =
                        connection.hget(key, field).await.map_err(|e| DriverError::backend(BACKEND, e))?;
                    record.insert(VALUE_FIELD, value.ok_or_else(|| DriverError::NoResult(query.to_owned()))?);
                }
                Command::HGetAll(key) => {
                    let hash: StdHashMap<String, String> =
                        connection.hgetall(key).await.map_err(|e| DriverError::backend(BACKEND, e))?;
                    let mut fields = hash.into_iter().collect::<Vec<_>>();
                    fields.sort();
                    record = fields.into_iter().collect();
                }
            }
            Ok(vec![record])
        })
    }
}
