use crate::blob::{BlobStore, LocalBlobStore};
use crate::error::{ReadError, Result};
use crate::fd_limiter::FdLimiter;
use crate::pool::BufferPools;
use crate::telemetry::{noop_event_listener, ReaderEventListener};
use crate::time_reader::build_decode_pool;

use ::config::{Config, Environment, File};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Tunables for the read path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderConfig {
    /// Process-wide budget of open segment files.
    pub max_open_fds: usize,
    pub fd_acquire_retries: u32,
    /// Base backoff between budget acquisition attempts; grows linearly per attempt.
    pub fd_acquire_backoff: Duration,
    /// Column open failures recorded per reader set before further ones are only counted.
    pub max_column_errors: usize,
    /// Worker threads for bulk timestamp decoding.
    pub bulk_parallelism: usize,
    /// Buffers kept per pool.
    pub pool_max_retained: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_open_fds: 4096,
            fd_acquire_retries: 10,
            fd_acquire_backoff: Duration::from_millis(20),
            max_column_errors: 10,
            bulk_parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            pool_max_retained: 64,
        }
    }
}

/// Reader settings as read from file + env. Every field optional for layering.
#[derive(Debug, Default, serde::Deserialize)]
pub struct ReaderFileConfig {
    pub max_open_fds: Option<usize>,
    pub fd_acquire_retries: Option<u32>,
    pub fd_acquire_backoff_ms: Option<u64>,
    pub max_column_errors: Option<usize>,
    pub bulk_parallelism: Option<usize>,
    pub pool_max_retained: Option<usize>,
}

impl ReaderConfig {
    /// Defaults, then the optional TOML file, then `SEGREAD_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            if !path.exists() {
                return Err(ReadError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(
            Environment::with_prefix("SEGREAD")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .ignore_empty(true),
        );
        let merged = builder
            .build()
            .map_err(|e| ReadError::Config(e.to_string()))?;
        let partial: ReaderFileConfig = merged
            .try_deserialize()
            .map_err(|e| ReadError::Config(e.to_string()))?;

        let mut cfg = ReaderConfig::default();
        cfg.merge(&partial);
        cfg.validate()?;
        Ok(cfg)
    }

    /// Overwrites the fields that are `Some` in `partial`.
    pub fn merge(&mut self, partial: &ReaderFileConfig) {
        if let Some(n) = partial.max_open_fds {
            self.max_open_fds = n;
        }
        if let Some(n) = partial.fd_acquire_retries {
            self.fd_acquire_retries = n;
        }
        if let Some(ms) = partial.fd_acquire_backoff_ms {
            self.fd_acquire_backoff = Duration::from_millis(ms);
        }
        if let Some(n) = partial.max_column_errors {
            self.max_column_errors = n;
        }
        if let Some(n) = partial.bulk_parallelism {
            self.bulk_parallelism = n;
        }
        if let Some(n) = partial.pool_max_retained {
            self.pool_max_retained = n;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_open_fds == 0 {
            return Err(ReadError::Config("max_open_fds must be > 0".to_string()));
        }
        if self.bulk_parallelism == 0 {
            return Err(ReadError::Config("bulk_parallelism must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Shared state handed to every reader: pools, descriptor budget, decode workers,
/// collaborators and settings.
#[derive(Debug, Clone)]
pub struct ReaderContext {
    pub config: ReaderConfig,
    pub pools: Arc<BufferPools>,
    pub fd_limiter: Arc<FdLimiter>,
    pub blob_store: Arc<dyn BlobStore>,
    pub event_listener: Arc<dyn ReaderEventListener>,
    /// Workers for bulk timestamp decoding, sized by `bulk_parallelism`.
    pub decode_pool: Arc<rayon::ThreadPool>,
}

impl ReaderContext {
    pub fn new(config: ReaderConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            pools: Arc::new(BufferPools::new(config.pool_max_retained)),
            fd_limiter: Arc::new(FdLimiter::new(config.max_open_fds)),
            blob_store: Arc::new(LocalBlobStore),
            event_listener: noop_event_listener(),
            decode_pool: Arc::new(build_decode_pool(config.bulk_parallelism)?),
            config,
        })
    }

    pub fn with_blob_store(mut self, blob_store: Arc<dyn BlobStore>) -> Self {
        self.blob_store = blob_store;
        self
    }

    pub fn with_event_listener(mut self, listener: Arc<dyn ReaderEventListener>) -> Self {
        self.event_listener = listener;
        self
    }

    /// Shares an existing descriptor budget, e.g. one per process.
    pub fn with_fd_limiter(mut self, limiter: Arc<FdLimiter>) -> Self {
        self.fd_limiter = limiter;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = ReaderConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.max_open_fds, 4096);
        assert!(cfg.bulk_parallelism >= 1);
    }

    #[test]
    fn validate_rejects_zero_budget() {
        let cfg = ReaderConfig {
            max_open_fds: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ReadError::Config(_))));
        assert!(ReaderContext::new(cfg).is_err());
    }

    // File and environment layering share process env, so both run in one test.
    #[test]
    fn load_layers_file_then_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segread.toml");
        std::fs::write(&path, "max_open_fds = 128\nfd_acquire_backoff_ms = 5\n").unwrap();

        let cfg = ReaderConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.max_open_fds, 128);
        assert_eq!(cfg.fd_acquire_backoff, Duration::from_millis(5));
        assert_eq!(cfg.max_column_errors, 10);

        std::env::set_var("SEGREAD_MAX_COLUMN_ERRORS", "3");
        let cfg = ReaderConfig::load(Some(&path));
        std::env::remove_var("SEGREAD_MAX_COLUMN_ERRORS");
        let cfg = cfg.unwrap();
        assert_eq!(cfg.max_column_errors, 3);
        assert_eq!(cfg.max_open_fds, 128);

        assert!(ReaderConfig::load(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
