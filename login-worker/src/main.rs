//! Move login events from an SQS queue to the `user_logins` table.
use std::sync::Arc;
use std::time;

use axum::routing::get;
use envconfig::Envconfig;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use login_common::dead_letter::PgDeadLetterSink;
use login_common::health::HealthRegistry;
use login_common::metrics::{serve, setup_metrics_router};
use login_common::queue::QueueConsumer;
use login_common::sqs::SqsSource;
use login_common::store::{PersistenceWriter, PgLoginStore};
use login_worker::config::Config;
use login_worker::error::WorkerError;
use login_worker::worker::{LoginWorker, WorkerLimits};

/// Upper bound for any single call to SQS, on top of the long poll wait.
const SQS_CALL_TIMEOUT: time::Duration = time::Duration::from_secs(10);

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    setup_tracing();

    let config = Config::init_from_env()?;

    let store = PgLoginStore::new(
        &config.database_url,
        config.max_pg_connections,
        config.write_timeout.0,
    )
    .await?;
    let dead_letters = PgDeadLetterSink::new(store.pool().clone());

    let source = SqsSource::from_env(
        config.queue_url.as_str(),
        &config.aws_region,
        config.aws_endpoint_url.as_ref().map(|url| url.as_str()),
        config.visibility_timeout.0,
    )
    .await;
    source.check().await?;

    let consumer = QueueConsumer::new(
        Arc::new(source),
        config.wait_time.0,
        SQS_CALL_TIMEOUT,
        config.retry_policy.source_policy(),
    );
    let writer = PersistenceWriter::new(
        Arc::new(store),
        config.retry_policy.write_policy(),
        config.write_timeout.0,
    );

    // A batch can take a full long poll plus a full visibility timeout, leave some slack on top.
    let liveness_deadline = config.wait_time.0 + config.visibility_timeout.0 + SQS_CALL_TIMEOUT;
    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness.register(
        "worker",
        chrono::Duration::from_std(liveness_deadline).unwrap_or(chrono::Duration::minutes(5)),
    );

    let worker = LoginWorker::new(
        &config.worker_name,
        consumer,
        writer,
        Arc::new(dead_letters),
        WorkerLimits {
            batch_size: config.batch_size,
            max_concurrent_messages: config.max_concurrent_messages,
            max_receive_count: config.max_receive_count,
            dead_letter_timeout: config.write_timeout.0,
            poll_backoff: config.retry_policy.maximum_interval.0,
        },
        worker_liveness,
    );

    let router = setup_metrics_router()?.route(
        "/_liveness",
        get(move || std::future::ready(liveness.get_status())),
    );
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(error) = serve(router, &bind).await {
            error!(error = %error, bind = %bind, "failed to serve metrics");
        }
    });

    let cancel = CancellationToken::new();
    let mut term = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let shutdown = cancel.clone();
    tokio::task::spawn(async move {
        tokio::select! {
            _ = term.recv() => {},
            _ = interrupt.recv() => {},
        };
        info!("shutting down gracefully, finishing the current batch");
        shutdown.cancel();
    });

    worker.run(cancel).await;

    Ok(())
}
