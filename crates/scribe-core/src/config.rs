//! Service configuration
//!
//! Configuration is layered: TOML file first (if present), then the
//! recognized environment variables override individual fields. Every knob
//! has a default so a bare `Config::default()` is runnable against a local
//! Redis.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::EngineConfig;

/// Main configuration structure for scribe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub cache: ResultCacheConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub janitor: JanitorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            backend: BackendConfig::default(),
            cache: ResultCacheConfig::default(),
            registry: RegistryConfig::default(),
            queue: QueueConfig::default(),
            rate_limits: RateLimitConfig::default(),
            worker: WorkerConfig::default(),
            engine: EngineConfig::default(),
            janitor: JanitorConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| crate::Error::Config(format!("failed to read config file: {}", e)))?;

        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env();
        config.validate()?;

        Ok(config)
    }

    /// Build configuration from defaults plus environment overrides
    pub fn from_env() -> crate::Result<Self> {
        if let Ok(path) = std::env::var("SCRIBE_CONFIG") {
            return Self::load(path);
        }

        let mut config = Self::default();
        config.apply_env();
        config.validate()?;

        Ok(config)
    }

    /// Apply the recognized environment variables over the current values
    pub fn apply_env(&mut self) {
        fn parse<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }

        if let Some(v) = parse::<u64>("MAX_FILE_SIZE_MB") {
            self.storage.max_file_size_mb = v;
        }
        if let Ok(v) = std::env::var("UPLOAD_DIR") {
            self.storage.upload_dir = PathBuf::from(v);
        }
        if let Some(v) = parse::<u64>("CACHE_TTL_SECONDS") {
            self.cache.ttl_secs = v;
        }
        if let Some(v) = parse::<u64>("JOB_RETENTION_SECONDS") {
            self.registry.retention_secs = v;
        }
        if let Ok(v) = std::env::var("QUEUE_BACKEND_URL") {
            self.backend.url = v;
        }
        if let Some(v) = parse::<usize>("WORKER_CONCURRENCY") {
            self.worker.concurrency = v;
        }
        if let Some(v) = parse::<u64>("WORKER_JOBS_BEFORE_RESTART") {
            self.worker.jobs_before_restart = v;
        }
        if let Some(v) = parse::<u64>("TRANSCRIBE_TIMEOUT_SECONDS") {
            self.worker.transcribe_timeout_secs = v;
        }
        if let Some(v) = parse::<u64>("SUBMIT_RATE_PER_MIN") {
            self.rate_limits.submit_per_min = v;
        }
        if let Some(v) = parse::<u64>("POLL_RATE_PER_MIN") {
            self.rate_limits.poll_per_min = v;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.server.port == 0 {
            return Err(crate::Error::Config("server port must be non-zero".to_string()));
        }
        if self.storage.max_file_size_mb == 0 {
            return Err(crate::Error::Config("max file size must be > 0".to_string()));
        }
        if self.worker.concurrency == 0 {
            return Err(crate::Error::Config("worker concurrency must be > 0".to_string()));
        }
        if self.worker.max_attempts == 0 {
            return Err(crate::Error::Config("worker max attempts must be > 0".to_string()));
        }
        if self.rate_limits.submit_per_min == 0 || self.rate_limits.poll_per_min == 0 {
            return Err(crate::Error::Config("rate-limit refill rates must be > 0".to_string()));
        }
        if self.queue.lease_secs <= self.worker.transcribe_timeout_secs {
            return Err(crate::Error::Config(
                "queue lease must outlast the transcription ceiling".to_string(),
            ));
        }
        Ok(())
    }

    /// Development preset: local Redis, small limits, fast janitor cadences
    pub fn development() -> Self {
        let mut config = Self::default();
        config.storage.upload_dir = PathBuf::from("./data/uploads");
        config.worker.concurrency = 1;
        config.janitor.blob_sweep_secs = 60;
        config.janitor.reaper_secs = 60;
        config
    }
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Server-side deadline for status/result/cancel requests
    #[serde(default = "default_poll_deadline")]
    pub poll_deadline_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            poll_deadline_secs: default_poll_deadline(),
        }
    }
}

impl ServerConfig {
    /// Polling deadline as Duration
    pub fn poll_deadline(&self) -> Duration {
        Duration::from_secs(self.poll_deadline_secs)
    }
}

/// Blob store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Blob store root; one file per job, no subdirectories
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,

    /// Submission cap in megabytes
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,

    /// Deadline for reading a submission body
    #[serde(default = "default_body_read_timeout")]
    pub body_read_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
            max_file_size_mb: default_max_file_size_mb(),
            body_read_timeout_secs: default_body_read_timeout(),
        }
    }
}

impl StorageConfig {
    /// Size cap in bytes
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }

    /// Body-read deadline as Duration
    pub fn body_read_timeout(&self) -> Duration {
        Duration::from_secs(self.body_read_timeout_secs)
    }
}

/// Redis backing for the registry, the work queue, and the result cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Connection string (redis://host:port/db)
    #[serde(default = "default_backend_url")]
    pub url: String,

    /// Key prefix to avoid collisions
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Initial connection timeout
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Max initial connection attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between connection attempts in ms
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            key_prefix: default_key_prefix(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl BackendConfig {
    /// Connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Retry delay as Duration
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultCacheConfig {
    /// Transcript entry lifetime in seconds
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

impl Default for ResultCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
        }
    }
}

impl ResultCacheConfig {
    /// TTL as Duration
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Job registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Retention past `finished_at` before the reaper purges a record
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention(),
        }
    }
}

impl RegistryConfig {
    /// Retention as Duration
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Work queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Poll interval while a `reserve` call waits for work
    #[serde(default = "default_reserve_poll_ms")]
    pub reserve_poll_ms: u64,

    /// Delivery lease; entries unacked past this are redelivered
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            reserve_poll_ms: default_reserve_poll_ms(),
            lease_secs: default_lease_secs(),
        }
    }
}

impl QueueConfig {
    /// Reserve poll interval as Duration
    pub fn reserve_poll(&self) -> Duration {
        Duration::from_millis(self.reserve_poll_ms)
    }

    /// Lease as Duration
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

/// Token-bucket rate limiting, two buckets per caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Submission bucket refill rate (tokens per minute)
    #[serde(default = "default_submit_rate")]
    pub submit_per_min: u64,

    /// Submission bucket capacity (burst)
    #[serde(default = "default_submit_rate")]
    pub submit_burst: u64,

    /// Polling bucket refill rate (tokens per minute)
    #[serde(default = "default_poll_rate")]
    pub poll_per_min: u64,

    /// Polling bucket capacity (burst)
    #[serde(default = "default_poll_rate")]
    pub poll_burst: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            submit_per_min: default_submit_rate(),
            submit_burst: default_submit_rate(),
            poll_per_min: default_poll_rate(),
            poll_burst: default_poll_rate(),
        }
    }
}

/// Worker runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Execution slots per worker process
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Self-recycle threshold (jobs per slot before clean exit)
    #[serde(default = "default_jobs_before_restart")]
    pub jobs_before_restart: u64,

    /// Hard ceiling per transcription
    #[serde(default = "default_transcribe_timeout")]
    pub transcribe_timeout_secs: u64,

    /// `reserve` timeout per loop iteration
    #[serde(default = "default_reserve_timeout")]
    pub reserve_timeout_secs: u64,

    /// Cadence of cancellation checks while the engine runs
    #[serde(default = "default_cancel_poll")]
    pub cancel_poll_secs: u64,

    /// Retry cap per job
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Heartbeat refresh cadence
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            jobs_before_restart: default_jobs_before_restart(),
            transcribe_timeout_secs: default_transcribe_timeout(),
            reserve_timeout_secs: default_reserve_timeout(),
            cancel_poll_secs: default_cancel_poll(),
            max_attempts: default_max_attempts(),
            heartbeat_secs: default_heartbeat(),
        }
    }
}

impl WorkerConfig {
    /// Transcription ceiling as Duration
    pub fn transcribe_timeout(&self) -> Duration {
        Duration::from_secs(self.transcribe_timeout_secs)
    }

    /// Reserve timeout as Duration
    pub fn reserve_timeout(&self) -> Duration {
        Duration::from_secs(self.reserve_timeout_secs)
    }

    /// Cancellation poll cadence as Duration
    pub fn cancel_poll(&self) -> Duration {
        Duration::from_secs(self.cancel_poll_secs)
    }
}

/// Janitor cadences and caps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JanitorConfig {
    /// Expired-blob sweep interval
    #[serde(default = "default_blob_sweep")]
    pub blob_sweep_secs: u64,

    /// Finished-job reaper interval
    #[serde(default = "default_reaper")]
    pub reaper_secs: u64,

    /// Queue-depth sampling interval (also drives lease reclaim)
    #[serde(default = "default_depth_sample")]
    pub depth_sample_secs: u64,

    /// Blobs older than this are deleted regardless of job state
    #[serde(default = "default_blob_hard_cap")]
    pub blob_hard_cap_secs: u64,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            blob_sweep_secs: default_blob_sweep(),
            reaper_secs: default_reaper(),
            depth_sample_secs: default_depth_sample(),
            blob_hard_cap_secs: default_blob_hard_cap(),
        }
    }
}

impl JanitorConfig {
    /// Blob sweep interval as Duration
    pub fn blob_sweep(&self) -> Duration {
        Duration::from_secs(self.blob_sweep_secs)
    }

    /// Reaper interval as Duration
    pub fn reaper(&self) -> Duration {
        Duration::from_secs(self.reaper_secs)
    }

    /// Depth sample interval as Duration
    pub fn depth_sample(&self) -> Duration {
        Duration::from_secs(self.depth_sample_secs)
    }

    /// Blob hard cap as Duration
    pub fn blob_hard_cap(&self) -> Duration {
        Duration::from_secs(self.blob_hard_cap_secs)
    }
}

// Default value helper functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_poll_deadline() -> u64 {
    2
}
fn default_upload_dir() -> PathBuf {
    PathBuf::from("./uploads")
}
fn default_max_file_size_mb() -> u64 {
    100
}
fn default_body_read_timeout() -> u64 {
    300
}
fn default_backend_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}
fn default_key_prefix() -> String {
    "scribe".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_cache_ttl() -> u64 {
    3600
}
fn default_retention() -> u64 {
    86400
}
fn default_reserve_poll_ms() -> u64 {
    250
}
fn default_lease_secs() -> u64 {
    660
}
fn default_submit_rate() -> u64 {
    10
}
fn default_poll_rate() -> u64 {
    60
}
fn default_concurrency() -> usize {
    2
}
fn default_jobs_before_restart() -> u64 {
    50
}
fn default_transcribe_timeout() -> u64 {
    600
}
fn default_reserve_timeout() -> u64 {
    5
}
fn default_cancel_poll() -> u64 {
    2
}
fn default_max_attempts() -> u32 {
    3
}
fn default_heartbeat() -> u64 {
    10
}
fn default_blob_sweep() -> u64 {
    600
}
fn default_reaper() -> u64 {
    900
}
fn default_depth_sample() -> u64 {
    30
}
fn default_blob_hard_cap() -> u64 {
    86400
}
