//! Lookup of drivers by the kind used in the configuration.
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::driver::Driver;

/// A driver was registered twice under the same kind.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("driver {0} duplicated")]
pub struct DuplicateDriver(pub String);

/// Maps driver kinds, as used in the configuration's `aggregations`, to drivers.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding every driver compiled into this crate.
    ///
    /// | kind       | driver                                   | feature        |
    /// |------------|------------------------------------------|----------------|
    /// | `http`     | [`HttpDriver`](crate::driver::HttpDriver)   | `http-driver`  |
    /// | `mongo`    | [`MongoDriver`](crate::driver::MongoDriver) | `mongo-driver` |
    /// | `redis`    | [`RedisDriver`](crate::driver::RedisDriver) | `redis-driver` |
    /// | `mysql`    | [`SqlDriver`](crate::driver::SqlDriver)     | `sql-driver`   |
    /// | `postgres` | [`SqlDriver`](crate::driver::SqlDriver)     | `sql-driver`   |
    pub fn with_default_drivers() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "http-driver")]
        registry.register("http", crate::driver::HttpDriver::new());
        #[cfg(feature = "mongo-driver")]
        registry.register("mongo", crate::driver::MongoDriver::new());
        #[cfg(feature = "redis-driver")]
        registry.register("redis", crate::driver::RedisDriver::new());
        #[cfg(feature = "sql-driver")]
        {
            registry.register("mysql", crate::driver::SqlDriver::mysql());
            registry.register("postgres", crate::driver::SqlDriver::postgres());
        }
        registry
    }

    /// Registers a driver under `kind`.
    ///
    /// # Errors
    ///
    /// Fails if a driver is already registered under `kind`, leaving the registry unchanged.
    pub fn try_register<D>(&mut self, kind: impl Into<String>, driver: D) -> Result<(), DuplicateDriver>
    where
        D: Driver + 'static,
    {
        self.try_register_arc(kind, Arc::new(driver))
    }

    /// Registers an already shared driver under `kind`.
    ///
    /// # Errors
    ///
    /// Fails if a driver is already registered under `kind`, leaving the registry unchanged.
    pub fn try_register_arc(
        &mut self,
        kind: impl Into<String>,
        driver: Arc<dyn Driver>,
    ) -> Result<(), DuplicateDriver> {
        let kind = kind.into();
        if self.drivers.contains_key(&kind) {
            return Err(DuplicateDriver(kind));
        }
        self.drivers.insert(kind, driver);
        Ok(())
    }

    /// Registers a driver under `kind`.
    ///
    /// # Panics
    ///
    /// Panics if a driver is already registered under `kind`, since that is a programming error
    /// that must be caught at startup.
    pub fn register<D>(&mut self, kind: impl Into<String>, driver: D)
    where
        D: Driver + 'static,
    {
        if let Err(e) = self.try_register(kind, driver) {
            panic!("{e}");
        }
    }

    /// Looks up the driver registered under `kind`.
    pub fn get(&self, kind: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.get(kind).cloned()
    }

    /// Whether a driver is registered under `kind`.
    pub fn contains(&self, kind: &str) -> bool {
        self.drivers.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds = self.drivers.keys().map(String::as_str).collect::<Vec<_>>();
        kinds.sort_unstable();
        kinds
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry").field("kinds", &self.kinds()).finish()
    }
}
