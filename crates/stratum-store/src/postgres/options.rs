//! Configuration for the PostgreSQL datastore.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stratum_types::{StoreError, StoreResult};

/// Supplies fresh credentials for new database connections, e.g. from an
/// IAM-style token service. Consulted before **every** new physical
/// connection, so rotated credentials take effect without a restart.
#[async_trait]
pub trait CredentialsProvider: Send + Sync + fmt::Debug {
    /// Returns `(username, password)` for a connection to `address`,
    /// given the username configured in the connection string.
    async fn credentials(
        &self,
        address: &str,
        configured_username: &str,
    ) -> StoreResult<(String, String)>;
}

/// A provider that always returns the same credentials. Useful for tests and
/// for deployments that rotate by swapping the provider.
#[derive(Clone)]
pub struct StaticCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The password never appears in debug output.
        f.debug_struct("StaticCredentials").field("username", &self.username).finish_non_exhaustive()
    }
}

#[async_trait]
impl CredentialsProvider for StaticCredentials {
    async fn credentials(
        &self,
        _address: &str,
        _configured_username: &str,
    ) -> StoreResult<(String, String)> {
        Ok((self.username.clone(), self.password.clone()))
    }
}

/// Sizing and lifecycle options for one connection pool.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub max_connections: u32,
    /// Connections opened eagerly at startup and kept around when idle.
    pub min_connections: u32,
    /// How long `acquire` waits for a slot before failing.
    pub acquire_timeout: Duration,
    /// Idle connections older than this are discarded instead of reused.
    pub idle_timeout: Option<Duration>,
    /// Connections older than this are discarded instead of reused.
    pub max_lifetime: Option<Duration>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 0,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(30 * 60)),
            max_lifetime: Some(Duration::from_secs(60 * 60)),
        }
    }
}

/// The on-disk table names. Renameable; the semantics of each table are
/// fixed.
#[derive(Debug, Clone)]
pub struct TableNames {
    pub transaction: String,
    pub tuple: String,
    pub namespace: String,
    pub caveat: String,
    pub relationship_counter: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            transaction: "transaction".to_string(),
            tuple: "tuple".to_string(),
            namespace: "namespace".to_string(),
            caveat: "caveat".to_string(),
            relationship_counter: "relationship_counter".to_string(),
        }
    }
}

/// All configuration for [`PgDatastore`](crate::PgDatastore), with builder
/// methods for the options callers commonly override.
#[derive(Debug, Clone)]
pub struct PgDatastoreOptions {
    /// Width of the optimized-revision window.
    pub revision_quantization: Duration,
    /// Fraction (0–1) of the window by which a cached revision may age past
    /// its quantum before invalidation.
    pub max_revision_staleness_percent: f64,
    /// Age after which deleted rows may be reclaimed.
    pub gc_window: Duration,
    pub gc_interval: Duration,
    pub gc_max_operation_time: Duration,
    pub gc_enabled: bool,
    pub watch_buffer_length: u16,
    pub watch_buffer_write_timeout: Duration,
    /// How often the watch task polls for newly committed transactions.
    pub watch_poll_interval: Duration,
    pub max_retries: u8,
    pub read_pool: PoolOptions,
    pub write_pool: PoolOptions,
    pub credentials_provider: Option<Arc<dyn CredentialsProvider>>,
    pub enable_prometheus_stats: bool,
    /// Run `ANALYZE` on the tuple table before reading planner statistics.
    pub analyze_before_statistics: bool,
    pub tables: TableNames,
}

impl Default for PgDatastoreOptions {
    fn default() -> Self {
        Self {
            revision_quantization: Duration::from_secs(5),
            max_revision_staleness_percent: 0.1,
            gc_window: Duration::from_secs(24 * 60 * 60),
            gc_interval: Duration::from_secs(3 * 60),
            gc_max_operation_time: Duration::from_secs(60),
            gc_enabled: true,
            watch_buffer_length: 128,
            watch_buffer_write_timeout: Duration::from_secs(1),
            watch_poll_interval: Duration::from_millis(100),
            max_retries: 10,
            read_pool: PoolOptions::default(),
            write_pool: PoolOptions::default(),
            credentials_provider: None,
            enable_prometheus_stats: false,
            analyze_before_statistics: false,
            tables: TableNames::default(),
        }
    }
}

impl PgDatastoreOptions {
    pub fn with_revision_quantization(mut self, quantization: Duration) -> Self {
        self.revision_quantization = quantization;
        self
    }

    pub fn with_max_revision_staleness_percent(mut self, percent: f64) -> Self {
        self.max_revision_staleness_percent = percent;
        self
    }

    pub fn with_gc_window(mut self, window: Duration) -> Self {
        self.gc_window = window;
        self
    }

    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    pub fn with_gc_enabled(mut self, enabled: bool) -> Self {
        self.gc_enabled = enabled;
        self
    }

    pub fn with_watch_buffer_length(mut self, length: u16) -> Self {
        self.watch_buffer_length = length;
        self
    }

    pub fn with_watch_buffer_write_timeout(mut self, timeout: Duration) -> Self {
        self.watch_buffer_write_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_credentials_provider(mut self, provider: Arc<dyn CredentialsProvider>) -> Self {
        self.credentials_provider = Some(provider);
        self
    }

    pub fn with_prometheus_stats(mut self, enabled: bool) -> Self {
        self.enable_prometheus_stats = enabled;
        self
    }

    /// Rejects configurations the datastore cannot run with.
    pub fn validate(&self) -> StoreResult<()> {
        if self.revision_quantization.is_zero() {
            return Err(StoreError::InvalidArgument {
                message: "revision_quantization must be positive".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.max_revision_staleness_percent) {
            return Err(StoreError::InvalidArgument {
                message: "max_revision_staleness_percent must be within [0, 1]".to_string(),
            });
        }
        if self.gc_enabled && self.gc_window < self.gc_interval {
            return Err(StoreError::InvalidArgument {
                message: "gc_window must be at least as long as gc_interval".to_string(),
            });
        }
        if self.read_pool.max_connections == 0 || self.write_pool.max_connections == 0 {
            return Err(StoreError::InvalidArgument {
                message: "pools require max_connections >= 1".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(PgDatastoreOptions::default().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_staleness() {
        let options = PgDatastoreOptions::default().with_max_revision_staleness_percent(1.5);
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_quantization() {
        let options = PgDatastoreOptions::default().with_revision_quantization(Duration::ZERO);
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_inverted_gc_windows() {
        let options = PgDatastoreOptions::default()
            .with_gc_window(Duration::from_secs(1))
            .with_gc_interval(Duration::from_secs(60));
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_static_credentials_debug_redacts_password() {
        let creds = StaticCredentials {
            username: "svc".to_string(),
            password: "hunter2".to_string(),
        };
        let debug = format!("{creds:?}");
        assert!(debug.contains("svc"));
        assert!(!debug.contains("hunter2"));
    }
}
