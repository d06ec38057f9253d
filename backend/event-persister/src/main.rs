use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use event_persister::clients::HttpExperimentClient;
use event_persister::config::Config;
use event_persister::health::{self, AppState};
use event_persister::models::{EvaluationEventRow, GoalEventRow};
use event_persister::storage::{ClickHouseWriter, RedisEvaluationStore};
use event_persister::{Collaborators, Persister, PrometheusMetrics};
use prometheus::Registry;
use pubsub::RedisStreamPuller;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SERVICE_NAME: &str = "event-persister";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env().context("Failed to load configuration")?;
    init_tracing(config.json_logs());

    info!(
        port = config.port,
        topic = %config.pubsub_topic,
        subscription = %config.pubsub_subscription,
        "Starting {}",
        SERVICE_NAME
    );

    let registry = Registry::new();
    let metrics = Arc::new(
        PrometheusMetrics::new(&registry, SERVICE_NAME).context("Failed to create metrics")?,
    );

    let redis_client =
        redis::Client::open(config.redis_url.as_str()).context("Invalid REDIS_URL")?;
    let puller = RedisStreamPuller::connect(redis_client.clone(), config.stream_config())
        .await
        .context("Failed to subscribe to the event stream")?;
    let evaluation_store = RedisEvaluationStore::connect(redis_client)
        .await
        .context("Failed to connect the evaluation store")?;

    let experiment_client = HttpExperimentClient::new(
        &config.experiment_service_url,
        config.experiment_service_token.clone(),
        config.experiment_request_timeout(),
    )
    .context("Failed to build experiment service client")?;

    let clickhouse = clickhouse::Client::default()
        .with_url(&config.clickhouse_url)
        .with_database(&config.clickhouse_database)
        .with_user(&config.clickhouse_user)
        .with_password(&config.clickhouse_password);

    let persister = Arc::new(
        Persister::new(
            Collaborators {
                puller: Arc::new(puller),
                experiment_client: Arc::new(experiment_client),
                evaluation_store: Arc::new(evaluation_store),
                evaluation_writer: Arc::new(ClickHouseWriter::<EvaluationEventRow>::new(
                    clickhouse.clone(),
                    config.evaluation_event_table.clone(),
                )),
                goal_writer: Arc::new(ClickHouseWriter::<GoalEventRow>::new(
                    clickhouse,
                    config.goal_event_table.clone(),
                )),
            },
            config.persister_options().with_metrics(metrics),
        )
        .context("Invalid persister options")?,
    );

    let mut run_handle = tokio::spawn({
        let persister = Arc::clone(&persister);
        async move { persister.run().await }
    });

    let state = web::Data::new(AppState {
        health: persister.clone(),
        registry,
    });
    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(health::configure)
    })
    .bind(("0.0.0.0", config.port))
    .with_context(|| format!("Failed to bind HTTP port {}", config.port))?
    .disable_signals()
    .run();
    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    info!("HTTP server listening on 0.0.0.0:{}", config.port);

    let finished_early = tokio::select! {
        _ = shutdown_signal() => None,
        joined = &mut run_handle => Some(joined),
    };

    let joined = match finished_early {
        Some(joined) => {
            error!("Event persister stopped on its own, reporting unhealthy until shutdown");
            shutdown_signal().await;
            joined
        }
        None => {
            info!("Shutdown signal received, stopping persister");
            if tokio::time::timeout(config.shutdown_timeout(), persister.stop())
                .await
                .is_err()
            {
                warn!(
                    timeout_secs = config.shutdown_timeout_secs,
                    "Persister did not stop in time"
                );
                run_handle.abort();
            }
            run_handle.await
        }
    };

    server_handle.stop(true).await;
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("HTTP server error: {}", e),
        Err(e) => error!("HTTP server task failed: {}", e),
    }

    match joined {
        Ok(result) => result.context("Event persister failed")?,
        Err(e) if e.is_cancelled() => {}
        Err(e) => return Err(e).context("Event persister task panicked"),
    }

    info!("{} stopped", SERVICE_NAME);
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,event_persister=debug,pubsub=debug".into());

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
