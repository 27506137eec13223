//! Lambda Builder
//!
//! Event-driven service that builds tenant parser sources into Lambda
//! container images.
//!
//! Architecture:
//! - Configuration: everything from the environment
//! - Repositories: build records in memory or PostgreSQL
//! - Adapters: object store, rootless podman job runtime, OCI registry
//! - Services: receiver, assembler, orchestrator, publisher, status emitter
//! - API: axum ingress for events and build lookups
//!
//! Accepted events are queued to a fixed worker pool; the HTTP layer never
//! waits for a build.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lambda_builder::config::{Config, StorageBackend};
use lambda_builder::registry::HttpRegistry;
use lambda_builder::repository::{InMemoryJobStore, JobStore, PgJobStore};
use lambda_builder::retry::Backoff;
use lambda_builder::runtime::{JobTemplate, PodmanRuntime};
use lambda_builder::service::dispatch::spawn_workers;
use lambda_builder::service::pipeline::spawn_lease_keeper;
use lambda_builder::service::tracker::spawn_janitor;
use lambda_builder::service::{
    ArtifactPublisher, BuildContextAssembler, BuildPipeline, Cancellations, Dispatcher,
    EventReceiver, HttpStatusSink, JobOrchestrator, JobTracker, LogStatusSink, StatusEmitter,
    StatusSink,
};
use lambda_builder::storage::{FsObjectStore, HttpObjectStore, ObjectStore, ObjectStoreClient};
use lambda_builder::{api, db};

/// How often finished builds past their retention are purged
const JANITOR_PERIOD: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lambda_builder=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Lambda Builder");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    info!(
        "Loaded configuration: registry={}, max_concurrent_builds={}, workers={}",
        config.registry, config.max_concurrent_builds, config.worker_count
    );

    // Job store
    let store: Arc<dyn JobStore> = match &config.database_url {
        Some(url) => {
            info!("Connecting to database...");
            let pool = db::create_pool(url)
                .await
                .context("Failed to create database pool")?;
            db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            Arc::new(PgJobStore::new(pool))
        }
        None => {
            warn!("DATABASE_URL not set, build records are kept in memory");
            Arc::new(InMemoryJobStore::new())
        }
    };

    // Adapters
    let objects: Arc<dyn ObjectStore> = match &config.storage {
        StorageBackend::Http {
            endpoint,
            region,
            bucket,
            token,
        } => {
            info!("Using object store {}/{}", endpoint, bucket);
            Arc::new(HttpObjectStore::new(
                endpoint.clone(),
                region.clone(),
                bucket.clone(),
                token.clone(),
            ))
        }
        StorageBackend::Fs { root } => {
            info!("Using local object store at {}", root.display());
            Arc::new(FsObjectStore::new(root.clone()))
        }
    };
    let backoff = Backoff::with_attempts(config.storage_attempts);
    let objects = ObjectStoreClient::new(objects, backoff, config.io_timeout);

    let runtime = PodmanRuntime::default();
    runtime
        .check_available()
        .await
        .context("Job runtime is not available")?;

    let template = JobTemplate::load(config.job_template_path.as_deref())
        .context("Failed to load job template")?;
    let registry = Arc::new(HttpRegistry::new(
        config.registry_token.clone(),
        config.registry_insecure,
    ));

    let sink: Arc<dyn StatusSink> = match &config.status_webhook_url {
        Some(url) => Arc::new(HttpStatusSink::new(url.clone())),
        None => {
            info!("STATUS_WEBHOOK_URL not set, status events are logged only");
            Arc::new(LogStatusSink)
        }
    };

    // Services
    let cancellations = Arc::new(Cancellations::new());
    let tracker = Arc::new(JobTracker::new(store.clone()));
    let orchestrator = Arc::new(JobOrchestrator::new(
        &config,
        Arc::new(runtime),
        registry.clone(),
        template,
        cancellations.clone(),
    ));
    let pipeline = Arc::new(BuildPipeline::new(
        tracker.clone(),
        BuildContextAssembler::new(
            objects.clone(),
            config.workspace_base.clone(),
            config.base_image.clone(),
            config.max_source_bytes,
        ),
        orchestrator.clone(),
        ArtifactPublisher::new(objects, registry, config.io_timeout),
        StatusEmitter::new(sink, backoff, config.io_timeout, config.event_source.clone()),
        cancellations.clone(),
        backoff,
        config.run_timeout,
    ));

    let recovered = pipeline
        .recover_orphaned(config.lease_timeout)
        .await
        .context("Failed to recover abandoned builds")?;
    if recovered > 0 {
        warn!("Failed {} build(s) abandoned by a stopped instance", recovered);
    }
    let lease_keeper = spawn_lease_keeper(pipeline.clone(), config.lease_timeout);

    // Workers
    let (dispatcher, rx) = Dispatcher::new(config.queue_capacity);
    let workers = spawn_workers(config.worker_count, rx, dispatcher.queue(), pipeline);
    let janitor = spawn_janitor(store, config.job_retention, JANITOR_PERIOD);

    let receiver = Arc::new(EventReceiver::new(
        tracker,
        dispatcher,
        cancellations,
        orchestrator,
    ));

    // Serve
    let app = api::create_router(receiver);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;
    info!("Listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // The router, and with it the last dispatcher, is gone: workers drain
    // the queue and stop
    info!("Waiting for {} worker(s) to finish", workers.len());
    janitor.abort();
    for worker in workers {
        if let Err(e) = worker.await {
            warn!("Worker ended abnormally: {}", e);
        }
    }
    lease_keeper.abort();

    info!("Lambda Builder stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
