#[cfg(feature = "http-listener")]
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tracing::info;

use crate::collector::Collector;
use crate::common::BuildError;
use crate::config::Config;
use crate::registry::DriverRegistry;

#[cfg(feature = "http-listener")]
use super::ExporterFuture;
use super::ExporterHandle;

/// Default namespace prefixed to every metric name.
pub const DEFAULT_NAMESPACE: &str = "queryexporter";

/// Default path scrapes are served under.
pub const DEFAULT_TELEMETRY_PATH: &str = "/metrics";

/// Builder for creating a query exporter.
pub struct ExporterBuilder {
    config: Config,
    namespace: String,
    registry: Option<DriverRegistry>,
    #[cfg(feature = "http-listener")]
    listen_address: SocketAddr,
    #[cfg(feature = "http-listener")]
    telemetry_path: String,
}

impl ExporterBuilder {
    /// Creates a new [`ExporterBuilder`] for the given configuration.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            namespace: DEFAULT_NAMESPACE.to_owned(),
            registry: None,
            #[cfg(feature = "http-listener")]
            listen_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 9696),
            #[cfg(feature = "http-listener")]
            telemetry_path: DEFAULT_TELEMETRY_PATH.to_owned(),
        }
    }

    /// Sets the namespace prefixed to every metric name.
    ///
    /// Defaults to `queryexporter`.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the drivers queries are dispatched to.
    ///
    /// Defaults to [`DriverRegistry::with_default_drivers`].
    #[must_use]
    pub fn with_driver_registry(mut self, registry: DriverRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Configures the exporter to expose an HTTP listener that serves scrapes.
    ///
    /// Defaults to listening at `0.0.0.0:9696`.
    #[cfg(feature = "http-listener")]
    #[cfg_attr(docsrs, doc(cfg(feature = "http-listener")))]
    #[must_use]
    pub fn with_http_listener(mut self, addr: impl Into<SocketAddr>) -> Self {
        self.listen_address = addr.into();
        self
    }

    /// Sets the path scrapes are served under.
    ///
    /// Defaults to `/metrics`.
    #[cfg(feature = "http-listener")]
    #[cfg_attr(docsrs, doc(cfg(feature = "http-listener")))]
    #[must_use]
    pub fn with_telemetry_path(mut self, path: impl Into<String>) -> Self {
        self.telemetry_path = path.into();
        self
    }

    /// Builds a handle for running scrapes, without any listener.
    ///
    /// ## Errors
    ///
    /// If the configuration does not validate, or references a driver kind no driver is
    /// registered for, an error variant will be returned describing the error.
    pub fn build_handle(self) -> Result<ExporterHandle, BuildError> {
        let ExporterBuilder { mut config, namespace, registry, .. } = self;
        config.validate_and_set_defaults()?;

        let registry = registry.unwrap_or_else(DriverRegistry::with_default_drivers);
        let collector = Collector::new(&namespace, &config, registry);
        if let Some(missing) = collector.missing_drivers().first() {
            return Err(BuildError::UnknownDriver((*missing).to_owned()));
        }

        info!(namespace = %namespace, metrics = config.aggregations.values().map(Vec::len).sum::<usize>(), "collector ready");
        Ok(ExporterHandle::new(collector))
    }

    /// Builds the handle and the HTTP listener serving it.
    ///
    /// The listener is bound immediately, while the returned future accepts connections until it
    /// is dropped. It must be polled from within a Tokio runtime.
    ///
    /// ## Errors
    ///
    /// In addition to the errors of [`build_handle`][ExporterBuilder::build_handle], fails if the
    /// telemetry path does not start with `/` or the listen address cannot be bound.
    #[cfg(feature = "http-listener")]
    #[cfg_attr(docsrs, doc(cfg(feature = "http-listener")))]
    pub fn build(self) -> Result<(ExporterHandle, ExporterFuture), BuildError> {
        if !self.telemetry_path.starts_with('/') {
            return Err(BuildError::InvalidTelemetryPath(self.telemetry_path));
        }
        let listen_address = self.listen_address;
        let telemetry_path = self.telemetry_path.clone();

        let handle = self.build_handle()?;
        let exporter = super::http_listener::new_http_listener(handle.clone(), listen_address, telemetry_path)?;
        info!(%listen_address, "listening");

        Ok((handle, exporter))
    }
}

#[cfg(test)]
mod tests {
    use super::ExporterBuilder;
    use crate::common::BuildError;
    use crate::config::{Config, DataSource, ConfigError};
    use crate::driver::DriverError;
    use crate::record::{Record, Value};
    use crate::registry::DriverRegistry;

    const CONFIG: &str = r#"
servers:
  - name: local
    uri: fake://local
aggregations:
  fake:
    - name: answer
      help: The answer.
      query: answer
      variableValue: value
      constLabels:
        team: core
      datasources:
        - name: local
"#;

    fn registry() -> DriverRegistry {
        let mut registry = DriverRegistry::new();
        registry.register("fake", |_: &DataSource, _: &str| -> Result<Vec<Record>, DriverError> {
            Ok(vec![[("value", Value::Float(4.2))].into_iter().collect()])
        });
        registry
    }

    #[tokio::test]
    async fn test_render() {
        let handle = ExporterBuilder::new(Config::from_yaml_str(CONFIG).unwrap())
            .with_namespace("qe")
            .with_driver_registry(registry())
            .build_handle()
            .unwrap();

        let rendered = handle.render().await;
        let expected = concat!(
            "# HELP qe_fake_answer The answer.\n",
            "# TYPE qe_fake_answer gauge\n",
            "qe_fake_answer{name=\"local\",database=\"\",table=\"\",team=\"core\"} 4.2\n",
        );
        assert!(rendered.starts_with(expected), "{rendered}");
        assert!(rendered.contains("qe_total_scrapes{driver=\"fake\",metric=\"answer\",success=\"true\"} 1\n"));

        let rendered = handle.render().await;
        assert!(rendered.contains("qe_total_scrapes{driver=\"fake\",metric=\"answer\",success=\"true\"} 2\n"));
    }

    #[test]
    fn test_unknown_driver() {
        let result = ExporterBuilder::new(Config::from_yaml_str(CONFIG).unwrap())
            .with_driver_registry(DriverRegistry::new())
            .build_handle();
        assert!(matches!(result, Err(BuildError::UnknownDriver(kind)) if kind == "fake"));
    }

    #[test]
    fn test_invalid_config() {
        let mut config = Config::from_yaml_str(CONFIG).unwrap();
        config.servers.push(config.servers[0].clone());

        let result = ExporterBuilder::new(config).with_driver_registry(registry()).build_handle();
        assert!(matches!(result, Err(BuildError::InvalidConfig(ConfigError::DuplicateServer(_)))));
    }

    #[cfg(feature = "http-listener")]
    #[tokio::test]
    async fn test_invalid_telemetry_path() {
        let result = ExporterBuilder::new(Config::from_yaml_str(CONFIG).unwrap())
            .with_driver_registry(registry())
            .with_telemetry_path("metrics")
            .build();
        assert!(matches!(result, Err(BuildError::InvalidTelemetryPath(path)) if path == "metrics"));
    }

    #[cfg(feature = "http-listener")]
    #[tokio::test]
    async fn test_address_in_use() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let result = ExporterBuilder::new(Config::from_yaml_str(CONFIG).unwrap())
            .with_driver_registry(registry())
            .with_http_listener(taken.local_addr().unwrap())
            .build();
        assert!(matches!(result, Err(BuildError::FailedToCreateHTTPListener(_))));
    }
}
