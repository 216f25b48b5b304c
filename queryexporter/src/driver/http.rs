//! JSON APIs queried over HTTP or HTTPS.
use std::time::Duration;

use http_body_util::{BodyExt, Collected, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue, AUTHORIZATION};
use hyper::{Method, Request, Uri};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use indexmap::IndexMap;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::debug;

use super::{Driver, DriverError, QueryFuture};
use crate::common::parse_duration;
use crate::config::DataSource;
use crate::record::Record;

const BACKEND: &str = "http";
const MAX_ERROR_BODY: usize = 512;

type HttpsClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Queries HTTP APIs returning JSON.
///
/// The query is a YAML (or JSON) document describing the request:
///
/// ```yaml
/// method: GET            # defaults to GET
/// uri: /api/v1/stats     # joined onto the data source URI unless absolute
/// token: Bearer abc      # sent as the Authorization header
/// body: ""
/// headers:
///   Accept: application/json
/// timeout: 5s            # a duration string, or nanoseconds
/// ```
///
/// The response must be a JSON array of objects, each of which becomes a record. A single JSON
/// object is accepted as a one-record result.
#[derive(Default)]
pub struct HttpDriver {
    client: OnceCell<HttpsClient>,
}

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
struct HttpRequest {
    method: String,
    uri: String,
    token: String,
    body: String,
    headers: IndexMap<String, HeaderValues>,
    timeout: Option<Timeout>,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(untagged)]
enum HeaderValues {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(untagged)]
enum Timeout {
    Nanos(u64),
    Text(String),
}

impl HttpRequest {
    fn parse(query: &str) -> Result<Self, DriverError> {
        serde_yaml::from_str(query).map_err(|e| DriverError::InvalidQuery(e.to_string()))
    }

    fn timeout(&self) -> Result<Option<Duration>, DriverError> {
        let timeout = match &self.timeout {
            None => return Ok(None),
            Some(Timeout::Nanos(nanos)) => Duration::from_nanos(*nanos),
            Some(Timeout::Text(text)) => parse_duration(text)
                .ok()
                .and_then(|delta| delta.to_std().ok())
                .ok_or_else(|| DriverError::InvalidQuery(format!("invalid timeout {text:?}")))?,
        };
        Ok((!timeout.is_zero()).then_some(timeout))
    }

    fn build(&self, base: &str) -> Result<Request<Full<Bytes>>, DriverError> {
        let method = if self.method.is_empty() {
            Method::GET
        } else {
            Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
                .map_err(|e| DriverError::InvalidQuery(e.to_string()))?
        };
        let uri = resolve_uri(base, &self.uri)?;

        let mut builder = Request::builder().method(method).uri(uri);
        for (name, values) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| DriverError::InvalidQuery(format!("invalid header {name:?}: {e}")))?;
            let values = match values {
                HeaderValues::One(value) => std::slice::from_ref(value),
                HeaderValues::Many(values) => values.as_slice(),
            };
            for value in values {
                builder = builder.header(&name, value.as_str());
            }
        }

        let mut request = builder
            .body(Full::from(self.body.clone()))
            .map_err(|e| DriverError::InvalidQuery(e.to_string()))?;
        if !self.token.is_empty() {
            let mut token = HeaderValue::from_str(&self.token)
                .map_err(|e| DriverError::InvalidQuery(format!("invalid token: {e}")))?;
            token.set_sensitive(true);
            request.headers_mut().insert(AUTHORIZATION, token);
        }
        Ok(request)
    }
}

/// Joins a request URI onto the data source URI, unless it is already absolute.
fn resolve_uri(base: &str, target: &str) -> Result<Uri, DriverError> {
    let invalid = |uri: &str, reason: String| DriverError::InvalidUri { uri: uri.to_owned(), reason };

    if target.starts_with("http://") || target.starts_with("https://") || base.is_empty() {
        return target.parse().map_err(|e: hyper::http::uri::InvalidUri| invalid(target, e.to_string()));
    }

    let base_uri: Uri = base.parse().map_err(|e: hyper::http::uri::InvalidUri| invalid(base, e.to_string()))?;
    let (target_path, target_query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    };

    let base_path = base_uri.path().trim_end_matches('/');
    let target_path = target_path.trim_start_matches('/');
    let mut path_and_query = match (base_path.is_empty(), target_path.is_empty()) {
        (_, true) if base_path.is_empty() => "/".to_owned(),
        (_, true) => base_path.to_owned(),
        (true, false) => format!("/{target_path}"),
        (false, false) => format!("{base_path}/{target_path}"),
    };
    if let Some(query) = target_query.or_else(|| base_uri.query()) {
        path_and_query.push('?');
        path_and_query.push_str(query);
    }

    let mut parts = base_uri.into_parts();
    parts.path_and_query = Some(
        path_and_query.parse().map_err(|e: hyper::http::uri::InvalidUri| invalid(target, e.to_string()))?,
    );
    Uri::from_parts(parts).map_err(|e| invalid(target, e.to_string()))
}

/// Decodes a JSON response body into records.
fn decode_records(body: &[u8]) -> Result<Vec<Record>, DriverError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| DriverError::Decode(e.to_string()))?;
    let items = match value {
        serde_json::Value::Array(items) => items,
        object @ serde_json::Value::Object(_) => vec![object],
        other => return Err(DriverError::Decode(format!("expected an array of objects, got {other}"))),
    };

    items
        .into_iter()
        .map(|item| {
            Record::try_from(item)
                .map_err(|other| DriverError::Decode(format!("expected an object, got {other}")))
        })
        .collect()
}

impl HttpDriver {
    /// Creates a driver. The underlying client is created on first use.
    pub fn new() -> Self {
        Self::default()
    }

    async fn client(&self) -> Result<&HttpsClient, DriverError> {
        self.client
            .get_or_try_init(|| async {
                let https = hyper_rustls::HttpsConnectorBuilder::new()
                    .with_native_roots()
                    .map_err(|e| DriverError::backend(BACKEND, e))?
                    .https_or_http()
                    .enable_http1()
                    .build();
                let client: HttpsClient = Client::builder(TokioExecutor::new())
                    .pool_idle_timeout(Duration::from_secs(30))
                    .build(https);
                Ok::<_, DriverError>(client)
            })
            .await
    }

    async fn execute(&self, request: Request<Full<Bytes>>) -> Result<Vec<Record>, DriverError> {
        let client = self.client().await?;
        let response = client.request(request).await.map_err(|e| DriverError::backend(BACKEND, e))?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map(Collected::to_bytes)
            .map_err(|e| DriverError::backend(BACKEND, e))?;

        if !status.is_success() {
            let mut body = String::from_utf8_lossy(&body).into_owned();
            if body.len() > MAX_ERROR_BODY {
                let mut end = MAX_ERROR_BODY;
                while !body.is_char_boundary(end) {
                    end -= 1;
                }
                body.truncate(end);
            }
            return Err(DriverError::Status { status: status.as_u16(), body });
        }
        decode_records(&body)
    }
}

impl Driver for HttpDriver {
    fn query<'a>(&'a self, source: &'a DataSource, query: &'a str) -> QueryFuture<'a> {
        Box::pin(async move {
            let request = HttpRequest::parse(query)?;
            let timeout = request.timeout()?;
            let request = request.build(&source.uri)?;
            debug!(method = %request.method(), uri = %request.uri(), "sending http query");

            match timeout {
                Some(timeout) => tokio::time::timeout(timeout, self.execute(request))
                    .await
                    .map_err(|_| DriverError::Timeout(timeout))?,
                None => self.execute(request).await,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use hyper::header::{ACCEPT, AUTHORIZATION};
    use hyper::Method;

    use super::{decode_records, resolve_uri, HeaderValues, HttpRequest, Timeout};
    use crate::driver::DriverError;

    #[test]
    fn test_parse_request() {
        let request = HttpRequest::parse(
            r#"
method: post
uri: /stats?verbose=1
token: Bearer abc
body: '{"x": 1}'
headers:
  Accept: application/json
  X-Multi: [a, b]
timeout: 1500ms
"#,
        )
        .unwrap();

        assert_eq!(request.method, "post");
        assert_eq!(request.headers["X-Multi"], HeaderValues::Many(vec!["a".into(), "b".into()]));
        assert_eq!(request.timeout, Some(Timeout::Text("1500ms".into())));
        assert_eq!(request.timeout().unwrap(), Some(Duration::from_millis(1500)));

        let built = request.build("http://api.local:8080/v1/").unwrap();
        assert_eq!(built.method(), Method::POST);
        assert_eq!(built.uri(), "http://api.local:8080/v1/stats?verbose=1");
        assert_eq!(built.headers()[ACCEPT], "application/json");
        assert_eq!(built.headers().get_all("x-multi").iter().count(), 2);
        assert_eq!(built.headers()[AUTHORIZATION], "Bearer abc");
        assert!(built.headers()[AUTHORIZATION].is_sensitive());
    }

    #[test]
    fn test_request_defaults() {
        let request = HttpRequest::parse(r#"{"uri": "https://example.com/x", "timeout": 2000000000}"#).unwrap();
        assert_eq!(request.timeout().unwrap(), Some(Duration::from_secs(2)));

        let built = request.build("http://ignored").unwrap();
        assert_eq!(built.method(), Method::GET);
        assert_eq!(built.uri(), "https://example.com/x");

        assert_eq!(HttpRequest::parse("uri: /x\ntimeout: 0").unwrap().timeout().unwrap(), None);
        assert!(HttpRequest::parse("uri: /x\ntimeout: soon").unwrap().timeout().is_err());
        assert!(matches!(HttpRequest::parse("- not a mapping"), Err(DriverError::InvalidQuery(_))));
    }

    #[test]
    fn test_token_overrides_authorization_header() {
        let request = HttpRequest::parse("uri: /x\ntoken: secret\nheaders:\n  Authorization: other\n").unwrap();
        let built = request.build("http://api.local").unwrap();
        assert_eq!(built.headers().get_all(AUTHORIZATION).iter().count(), 1);
        assert_eq!(built.headers()[AUTHORIZATION], "secret");
    }

    #[test]
    fn test_resolve_uri() {
        let cases = [
            ("http://h/api", "v1/x", "http://h/api/v1/x"),
            ("http://h/api/", "/v1/x", "http://h/api/v1/x"),
            ("http://h", "x", "http://h/x"),
            ("http://h/api?key=1", "x", "http://h/api/x?key=1"),
            ("http://h/api?key=1", "x?other=2", "http://h/api/x?other=2"),
            ("http://h/api", "", "http://h/api"),
            ("", "http://other/x", "http://other/x"),
        ];

        for (base, target, expected) in cases {
            assert_eq!(resolve_uri(base, target).unwrap(), expected, "base: {base}, target: {target}");
        }

        assert!(matches!(resolve_uri("", "relative/path"), Err(DriverError::InvalidUri { .. })));
    }

    #[test]
    fn test_decode_records() {
        let records = decode_records(br#"[{"value": 1}, {"value": "2", "tags": {"env": "prod"}}]"#).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].label_value("tags.env"), "prod");

        let single = decode_records(br#"{"value": 3}"#).unwrap();
        assert_eq!(single.len(), 1);

        assert!(decode_records(b"[]").unwrap().is_empty());
        assert!(matches!(decode_records(b"[1, 2]"), Err(DriverError::Decode(_))));
        assert!(matches!(decode_records(b"42"), Err(DriverError::Decode(_))));
        assert!(matches!(decode_records(b"not json"), Err(DriverError::Decode(_))));
    }

    #[cfg(feature = "http-listener")]
    #[tokio::test]
    async fn test_query_local_server() {
        use http_body_util::Full;
        use hyper::body::{Bytes, Incoming};
        use hyper::server::conn::http1::Builder;
        use hyper::service::service_fn;
        use hyper::{Request, Response, StatusCode};
        use hyper_util::rt::TokioIo;
        use tokio::net::TcpListener;

        use super::HttpDriver;
        use crate::config::DataSource;
        use crate::driver::Driver;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let service = service_fn(|req: Request<Incoming>| async move {
                    let authorized = req.headers().get("authorization").is_some_and(|v| v == "t0k3n");
                    let response = match (req.uri().path(), authorized) {
                        ("/api/stats", true) => Response::new(Full::new(Bytes::from_static(
                            br#"[{"value": 5, "region": "eu"}, {"value": 7, "region": "us"}]"#,
                        ))),
                        (_, false) => Response::builder()
                            .status(StatusCode::UNAUTHORIZED)
                            .body(Full::new(Bytes::from_static(b"denied")))
                            .unwrap(),
                        _ => Response::builder()
                            .status(StatusCode::NOT_FOUND)
                            .body(Full::new(Bytes::new()))
                            .unwrap(),
                    };
                    Ok::<_, hyper::Error>(response)
                });
                tokio::spawn(Builder::new().serve_connection(TokioIo::new(stream), service));
            }
        });

        let driver = HttpDriver::new();
        let source = DataSource { name: "api".into(), uri: format!("http://{addr}/api"), ..Default::default() };

        let records = driver.query(&source, "uri: stats\ntoken: t0k3n\ntimeout: 5s").await.unwrap();
        let regions = records.iter().map(|r| r.label_value("region")).collect::<Vec<_>>();
        assert_eq!(regions, ["eu", "us"]);

        let err = driver.query(&source, "uri: stats").await.unwrap_err();
        assert!(matches!(err, DriverError::Status { status: 401, ref body } if body == "denied"));
    }
}
