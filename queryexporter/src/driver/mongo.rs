//! MongoDB aggregation pipelines.
use indexmap::IndexMap;
use mongodb::bson::{Bson, Document};
use mongodb::Client;
use scc::HashMap;
use tracing::debug;

use super::{Driver, DriverError, QueryFuture};
use crate::config::DataSource;
use crate::record::{Record, Value};

const BACKEND: &str = "mongo";

/// Runs aggregation pipelines against MongoDB.
///
/// The query is a JSON array of pipeline stages, in [extended JSON] so that types such as dates
/// can be expressed, for example:
///
/// ```json
/// [{"$match": {"status": "active"}}, {"$group": {"_id": "$plan", "value": {"$sum": 1}}}]
/// ```
///
/// The pipeline runs on the data source's `table` collection of its `database`, and every
/// resulting document becomes a record. Object ids are turned into their hex form, dates into
/// milliseconds since the epoch. One client is kept per data source URI.
///
/// [extended JSON]: https://www.mongodb.com/docs/manual/reference/mongodb-extended-json/
#[derive(Default)]
pub struct MongoDriver {
    clients: HashMap<String, Client>,
}

impl MongoDriver {
    /// Creates a driver without any client.
    pub fn new() -> Self {
        Self::default()
    }

    async fn client(&self, uri: &str) -> Result<Client, DriverError> {
        if let Some(client) = self.clients.read_async(uri, |_, c| c.clone()).await {
            return Ok(client);
        }

        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| DriverError::InvalidUri { uri: uri.to_owned(), reason: e.to_string() })?;
        debug!("created mongo client");

        Ok(self.clients.entry_async(uri.to_owned()).await.or_insert(client).get().clone())
    }
}

fn parse_pipeline(query: &str) -> Result<Vec<Document>, DriverError> {
    let stages: Vec<serde_json::Value> = serde_json::from_str(query)
        .map_err(|e| DriverError::InvalidQuery(format!("pipeline must be a JSON array of stages: {e}")))?;

    stages
        .into_iter()
        .map(|stage| match Bson::try_from(stage) {
            Ok(Bson::Document(stage)) => Ok(stage),
            Ok(other) => Err(DriverError::InvalidQuery(format!("pipeline stage must be a document, got {other}"))),
            Err(e) => Err(DriverError::InvalidQuery(format!("invalid extended JSON in pipeline: {e}"))),
        })
        .collect()
}

fn decode_document(document: Document) -> IndexMap<String, Value> {
    document.into_iter().map(|(key, value)| (key, decode(value))).collect()
}

fn decode(value: Bson) -> Value {
    match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(b),
        Bson::Int32(i) => Value::Int(i64::from(i)),
        Bson::Int64(i) => Value::Int(i),
        Bson::Double(f) => Value::Float(f),
        Bson::String(s) | Bson::Symbol(s) | Bson::JavaScriptCode(s) => Value::String(s),
        Bson::Document(document) => Value::Map(decode_document(document)),
        Bson::Array(items) => Value::Array(items.into_iter().map(decode).collect()),
        Bson::ObjectId(id) => Value::String(id.to_hex()),
        Bson::DateTime(at) => Value::Int(at.timestamp_millis()),
        Bson::Timestamp(ts) => Value::Int(i64::from(ts.time)),
        Bson::Binary(binary) => Value::Bytes(binary.bytes),
        other => Value::String(other.to_string()),
    }
}

impl Driver for MongoDriver {
    fn query<'a>(&'a self, source: &'a DataSource, query: &'a str) -> QueryFuture<'a> {
        Box::pin(async move {
            let pipeline = parse_pipeline(query)?;
            debug!(stages = pipeline.len(), "parsed pipeline");

            let client = self.client(&source.uri).await?;
            let mut cursor = client
                .database(&source.database)
                .collection::<Document>(&source.table)
                .aggregate(pipeline)
                .await
                .map_err(|e| DriverError::backend(BACKEND, e))?;

            let mut records = Vec::new();
            while cursor.advance().await.map_err(|e| DriverError::backend(BACKEND, e))? {
                let document = cursor.deserialize_current().map_err(|e| DriverError::Decode(e.to_string()))?;
                records.push(Record::from(decode_document(document)));
            }
            Ok(records)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{decode_document, parse_pipeline, MongoDriver};
    use crate::config::DataSource;
    use crate::driver::{Driver, DriverError};
    use crate::record::{Record, Value};
    use mongodb::bson::{doc, oid::ObjectId, DateTime};

    #[test]
    fn test_parse_pipeline() {
        let pipeline = parse_pipeline(
            r#"[{"$match": {"since": {"$gte": {"$date": {"$numberLong": "1700000000000"}}}}}, {"$count": "value"}]"#,
        )
        .unwrap();

        assert_eq!(pipeline.len(), 2);
        let since = pipeline[0].get_document("$match").unwrap().get_document("since").unwrap();
        assert_eq!(since.get_datetime("$gte").unwrap(), &DateTime::from_millis(1_700_000_000_000));
        assert_eq!(pipeline[1].get_str("$count").unwrap(), "value");
    }

    #[test]
    fn test_parse_invalid_pipelines() {
        for query in ["", "{\"$count\": \"value\"}", "[1, 2]", "[{\"$count\": \"value\"}", "get key"] {
            assert!(matches!(parse_pipeline(query), Err(DriverError::InvalidQuery(_))), "query: {query:?}");
        }
        assert!(parse_pipeline("[]").unwrap().is_empty());
    }

    #[test]
    fn test_decode_document() {
        let id = ObjectId::new();
        let record = Record::from(decode_document(doc! {
            "_id": id,
            "value": 42_i32,
            "ratio": 0.5,
            "plan": {"name": "pro", "seats": 10_i64},
            "tags": ["a", "b"],
            "deleted": null,
            "at": DateTime::from_millis(1_000),
        }));

        assert_eq!(record.label_value("_id"), id.to_hex());
        assert_eq!(record.lookup("value").as_deref(), Some(&Value::Int(42)));
        assert_eq!(record.lookup("ratio").as_deref(), Some(&Value::Float(0.5)));
        assert_eq!(record.label_value("plan.name"), "pro");
        assert_eq!(record.lookup("plan.seats").as_deref(), Some(&Value::Int(10)));
        assert_eq!(record.lookup("tags").as_deref(), Some(&Value::Array(vec![Value::from("a"), Value::from("b")])));
        assert_eq!(record.lookup("deleted").as_deref(), Some(&Value::Null));
        assert_eq!(record.lookup("at").as_deref(), Some(&Value::Int(1_000)));
    }

    #[tokio::test]
    async fn test_invalid_uri() {
        let driver = MongoDriver::new();
        let source = DataSource { name: "docs".into(), uri: "redis://localhost".into(), ..Default::default() };

        let err = driver.query(&source, "[]").await.unwrap_err();
        assert!(matches!(err, DriverError::InvalidUri { .. }), "got {err}");
        assert!(driver.clients.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_query_skips_connecting() {
        let driver = MongoDriver::new();
        let source = DataSource { name: "docs".into(), uri: "mongodb://127.0.0.1:1".into(), ..Default::default() };

        let err = driver.query(&source, "db.users.count()").await.unwrap_err();
        assert!(matches!(err, DriverError::InvalidQuery(_)));
        assert!(driver.clients.is_empty());
    }
}
