use std::sync::Arc;

use http_body_util::Full;
use hyper::{
    body::{self, Bytes},
    header::{HeaderValue, CONTENT_TYPE},
    server::conn::http1::Builder as HyperHttpBuilder,
    service::service_fn,
    Method, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use super::{ExporterError, ExporterFuture, ExporterHandle};
use crate::common::BuildError;

const HEALTH_PATH: &str = "/-/healthy";
const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

struct HttpListeningExporter {
    inner: Arc<Inner>,
}

struct Inner {
    handle: ExporterHandle,
    telemetry_path: String,
    landing_page: String,
}

impl HttpListeningExporter {
    async fn serve(&self, listener: std::net::TcpListener) -> Result<(), ExporterError> {
        let listener = TcpListener::from_std(listener)?;

        loop {
            let stream = match listener.accept().await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!(error = ?e, "Error accepting connection. Ignoring request.");
                    continue;
                }
            };

            self.process_stream(stream);
        }
    }

    fn process_stream(&self, stream: TcpStream) {
        let inner = self.inner.clone();
        let service = service_fn(move |req: Request<body::Incoming>| {
            let inner = inner.clone();
            let method = req.method().clone();
            let path = req.uri().path().to_owned();
            async move { Ok::<_, hyper::Error>(Self::handle_http_request(&inner, &method, &path).await) }
        });

        tokio::task::spawn(async move {
            if let Err(err) =
                HyperHttpBuilder::new().serve_connection(TokioIo::new(stream), service).await
            {
                warn!(error = ?err, "Error serving connection.");
            };
        });
    }

    async fn handle_http_request(inner: &Inner, method: &Method, path: &str) -> Response<Full<Bytes>> {
        debug!(%method, path, "handling request");

        if method != Method::GET && method != Method::HEAD {
            return Self::new_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed", None);
        }

        if path == inner.telemetry_path {
            let body = inner.handle.render().await;
            Self::new_response(StatusCode::OK, body, Some(TEXT_FORMAT))
        } else if path == HEALTH_PATH {
            Self::new_response(StatusCode::OK, "Healthy", None)
        } else if path == "/" {
            Self::new_response(StatusCode::OK, inner.landing_page.clone(), Some("text/html; charset=utf-8"))
        } else {
            Self::new_response(StatusCode::NOT_FOUND, "Not Found", None)
        }
    }

    fn new_response(
        status: StatusCode,
        body: impl Into<Bytes>,
        content_type: Option<&'static str>,
    ) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(body.into()));
        *response.status_mut() = status;
        if let Some(content_type) = content_type {
            response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
        response
    }
}

fn landing_page(telemetry_path: &str) -> String {
    format!(
        concat!(
            "<html>\n<head><title>queryexporter</title></head>\n<body>\n",
            "<h1>queryexporter</h1>\n<p>exporter for many database sources</p>\n<ul>\n",
            "<li><a href=\"{metrics}\">Metrics</a></li>\n",
            "<li><a href=\"{health}\">Healthz</a></li>\n",
            "</ul>\n</body>\n</html>\n"
        ),
        metrics = telemetry_path,
        health = HEALTH_PATH,
    )
}

/// Creates an `ExporterFuture` implementing a http listener that serves scrape results.
///
/// # Errors
/// Will return Err if it cannot bind to the listen address
pub(crate) fn new_http_listener(
    handle: ExporterHandle,
    listen_address: std::net::SocketAddr,
    telemetry_path: String,
) -> Result<ExporterFuture, BuildError> {
    let listener = std::net::TcpListener::bind(listen_address)
        .and_then(|listener| {
            listener.set_nonblocking(true)?;
            Ok(listener)
        })
        .map_err(|e| BuildError::FailedToCreateHTTPListener(e.to_string()))?;

    let exporter = HttpListeningExporter {
        inner: Arc::new(Inner { handle, landing_page: landing_page(&telemetry_path), telemetry_path }),
    };

    Ok(Box::pin(async move { exporter.serve(listener).await }))
}
