//! Builder configuration
//!
//! Defines all configurable parameters for the builder including storage and
//! registry locations, build resource limits, concurrency and timeouts.
//! Everything is read from the environment; there is no CLI surface.

use std::path::PathBuf;
use std::time::Duration;

/// Where parser sources are read from and artifacts written to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// S3-compatible HTTP endpoint, path-style addressing
    Http {
        endpoint: String,
        region: String,
        bucket: String,
        token: Option<String>,
    },
    /// Local directory, one file per object
    Fs { root: PathBuf },
}

/// Resources requested for every build job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu_limit: String,
    pub memory_limit: String,
    pub memory_request: String,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_limit: "1".to_string(),
            memory_limit: "2g".to_string(),
            memory_request: "512m".to_string(),
        }
    }
}

/// Builder configuration
///
/// All timeouts and limits are configurable to allow tuning for different
/// deployment scenarios (small dev box vs shared build cluster).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP ingress listens on
    pub bind_addr: String,

    /// PostgreSQL URL for durable job records; in-memory when unset
    pub database_url: Option<String>,

    /// Base directory for ephemeral build workspaces
    pub workspace_base: PathBuf,

    /// Object storage for sources and artifacts
    pub storage: StorageBackend,

    /// Attempts per object-store operation before giving up
    pub storage_attempts: u32,

    /// Registry and path prefix images are pushed under
    pub registry: String,

    /// Bearer token for registry lookups
    pub registry_token: Option<String>,

    /// Talk plain HTTP to the registry (local registries)
    pub registry_insecure: bool,

    /// Directory holding a docker `config.json` with push credentials
    pub registry_auth_dir: Option<PathBuf>,

    /// Base image of the produced lambda container
    pub base_image: String,

    /// Rootless builder image run for every job
    pub builder_image: String,

    /// Job manifest template; the embedded Kaniko template when unset
    pub job_template_path: Option<PathBuf>,

    /// Resources requested for each build job
    pub resources: ResourceLimits,

    /// Global ceiling on simultaneously running build jobs
    pub max_concurrent_builds: usize,

    /// Pipeline workers draining the dispatch queue
    pub worker_count: usize,

    /// Builds that may wait for a worker before events are shed
    pub queue_capacity: usize,

    /// Maximum time a build job can run before it is deleted
    pub build_timeout: Duration,

    /// Maximum time a whole pipeline run can take
    pub run_timeout: Duration,

    /// Cap on any single storage, registry or runtime call
    pub io_timeout: Duration,

    /// How long finished job resources are kept for inspection
    pub job_ttl: Duration,

    /// How long terminal build records are kept
    pub job_retention: Duration,

    /// How long an unfinished build survives without its owner renewing
    /// the lease before another instance fails it
    pub lease_timeout: Duration,

    /// Largest accepted parser source
    pub max_source_bytes: u64,

    /// Downstream controller receiving status events; log-only when unset
    pub status_webhook_url: Option<String>,

    /// `source` attribute of outbound events
    pub event_source: String,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(storage: StorageBackend, registry: String) -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            database_url: None,
            workspace_base: std::env::temp_dir().join("lambda-builder"),
            storage,
            storage_attempts: 3,
            registry,
            registry_token: None,
            registry_insecure: false,
            registry_auth_dir: None,
            base_image: "public.ecr.aws/lambda/nodejs:20".to_string(),
            builder_image: "gcr.io/kaniko-project/executor:v1.23.2".to_string(),
            job_template_path: None,
            resources: ResourceLimits::default(),
            max_concurrent_builds: 4,
            worker_count: 8,
            queue_capacity: 64,
            build_timeout: Duration::from_secs(600), // 10 minutes
            run_timeout: Duration::from_secs(900),
            io_timeout: Duration::from_secs(30),
            job_ttl: Duration::from_secs(300),
            job_retention: Duration::from_secs(86_400),
            lease_timeout: Duration::from_secs(180),
            max_source_bytes: 5 * 1024 * 1024,
            status_webhook_url: None,
            event_source: "lambda-builder".to_string(),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - REGISTRY (required)
    /// - STORAGE_BACKEND (optional, `http` or `fs`, default: http)
    /// - STORAGE_BUCKET (required for http), STORAGE_REGION, STORAGE_ENDPOINT, STORAGE_TOKEN
    /// - STORAGE_ROOT (required for fs)
    /// - BUILD_TIMEOUT, RUN_TIMEOUT, IO_TIMEOUT, JOB_TTL, JOB_RETENTION, LEASE_TIMEOUT
    ///   (optional, seconds)
    /// - MAX_CONCURRENT_BUILDS, WORKER_COUNT, QUEUE_CAPACITY (optional)
    /// - see DESIGN.md for the complete list
    pub fn from_env() -> anyhow::Result<Self> {
        let registry = std::env::var("REGISTRY")
            .map_err(|_| anyhow::anyhow!("REGISTRY environment variable not set"))?;

        let storage = match env_string("STORAGE_BACKEND").as_deref() {
            None | Some("http") => {
                let region =
                    env_string("STORAGE_REGION").unwrap_or_else(|| "us-east-1".to_string());
                let endpoint = env_string("STORAGE_ENDPOINT")
                    .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", region));
                let bucket = std::env::var("STORAGE_BUCKET")
                    .map_err(|_| anyhow::anyhow!("STORAGE_BUCKET environment variable not set"))?;
                StorageBackend::Http {
                    endpoint,
                    region,
                    bucket,
                    token: env_string("STORAGE_TOKEN"),
                }
            }
            Some("fs") => {
                let root = std::env::var("STORAGE_ROOT")
                    .map_err(|_| anyhow::anyhow!("STORAGE_ROOT environment variable not set"))?;
                StorageBackend::Fs {
                    root: PathBuf::from(root),
                }
            }
            Some(other) => anyhow::bail!("unknown STORAGE_BACKEND '{}'", other),
        };

        let mut config = Self::new(storage, registry);
        let defaults = config.clone();

        config.bind_addr = env_string("BIND_ADDR").unwrap_or(defaults.bind_addr);
        config.database_url = env_string("DATABASE_URL");
        config.workspace_base = env_string("WORKSPACE_BASE")
            .map(PathBuf::from)
            .unwrap_or(defaults.workspace_base);
        config.storage_attempts = env_parse("STORAGE_MAX_ATTEMPTS", defaults.storage_attempts);
        config.registry_token = env_string("REGISTRY_TOKEN");
        config.registry_insecure = env_parse("REGISTRY_INSECURE", false);
        config.registry_auth_dir = env_string("REGISTRY_AUTH_DIR").map(PathBuf::from);
        config.base_image = env_string("BASE_IMAGE").unwrap_or(defaults.base_image);
        config.builder_image = env_string("BUILDER_IMAGE").unwrap_or(defaults.builder_image);
        config.job_template_path = env_string("JOB_TEMPLATE_PATH").map(PathBuf::from);
        config.resources = ResourceLimits {
            cpu_limit: env_string("CPU_LIMIT").unwrap_or(defaults.resources.cpu_limit),
            memory_limit: env_string("MEMORY_LIMIT").unwrap_or(defaults.resources.memory_limit),
            memory_request: env_string("MEMORY_REQUEST")
                .unwrap_or(defaults.resources.memory_request),
        };
        config.max_concurrent_builds =
            env_parse("MAX_CONCURRENT_BUILDS", defaults.max_concurrent_builds);
        config.worker_count = env_parse("WORKER_COUNT", defaults.worker_count);
        config.queue_capacity = env_parse("QUEUE_CAPACITY", defaults.queue_capacity);
        config.build_timeout = env_secs("BUILD_TIMEOUT", defaults.build_timeout);
        config.run_timeout = env_secs("RUN_TIMEOUT", defaults.run_timeout);
        config.io_timeout = env_secs("IO_TIMEOUT", defaults.io_timeout);
        config.job_ttl = env_secs("JOB_TTL", defaults.job_ttl);
        config.job_retention = env_secs("JOB_RETENTION", defaults.job_retention);
        config.lease_timeout = env_secs("LEASE_TIMEOUT", defaults.lease_timeout);
        config.max_source_bytes = env_parse("MAX_SOURCE_BYTES", defaults.max_source_bytes);
        config.status_webhook_url = env_string("STATUS_WEBHOOK_URL");
        config.event_source = env_string("EVENT_SOURCE").unwrap_or(defaults.event_source);

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.registry.trim().is_empty() {
            anyhow::bail!("registry cannot be empty");
        }

        if self.registry.contains("://") {
            anyhow::bail!("registry must be a host and path without a scheme");
        }

        match &self.storage {
            StorageBackend::Http {
                endpoint, bucket, ..
            } => {
                if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                    anyhow::bail!("storage endpoint must start with http:// or https://");
                }
                if bucket.is_empty() {
                    anyhow::bail!("storage bucket cannot be empty");
                }
            }
            StorageBackend::Fs { root } => {
                if root.as_os_str().is_empty() {
                    anyhow::bail!("storage root cannot be empty");
                }
            }
        }

        if let Some(url) = &self.status_webhook_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("status webhook url must start with http:// or https://");
            }
        }

        if self.storage_attempts == 0 {
            anyhow::bail!("storage_attempts must be greater than 0");
        }

        if self.max_concurrent_builds == 0 {
            anyhow::bail!("max_concurrent_builds must be greater than 0");
        }

        if self.worker_count == 0 {
            anyhow::bail!("worker_count must be greater than 0");
        }

        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be greater than 0");
        }

        if self.build_timeout.is_zero() || self.io_timeout.is_zero() {
            anyhow::bail!("build_timeout and io_timeout must be greater than 0");
        }

        if self.run_timeout < self.build_timeout {
            anyhow::bail!("run_timeout must not be shorter than build_timeout");
        }

        // Leases are renewed three times per timeout
        if self.lease_timeout < Duration::from_secs(3) {
            anyhow::bail!("lease_timeout must be at least 3 seconds");
        }

        if self.max_source_bytes == 0 {
            anyhow::bail!("max_source_bytes must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            StorageBackend::Fs {
                root: std::env::temp_dir().join("lambda-builder-objects"),
            },
            "localhost:5000/lambdas".to_string(),
        )
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env_string(name)
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_secs(name: &str, default: Duration) -> Duration {
    env_string(name)
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
