use std::process;
use std::sync::Arc;

use staffetta::{
    application::{
        entities::{EntityCommandHandler, EntityReadService},
        error::AppError,
        ingress::{CommandIngress, IngressConfig},
        relay::{OutboxRelay, RelayConfig},
        repos::CommandStore,
        shutdown::ShutdownController,
        updater::{CacheUpdater, UpdaterConfig},
        validation::CommandValidator,
        worker::{CommandProcessor, CommandWorkerPool, RetryScheduler, WorkerPoolConfig},
    },
    cache::CacheEngine,
    config,
    domain::{TOPIC_COMMANDS, TOPIC_EVENTS},
    infra::{
        breaker::{BreakerConfig, CircuitBreaker},
        db::PostgresRepositories,
        error::InfraError,
        eventlog::{EventLog, StreamConsumer, StreamEventLog},
        http::{self, AppState, DatabaseCheck, EventLogCheck, HealthRegistry, SubstrateCheck},
        substrate::{RedisSubstrate, Substrate},
        telemetry,
    },
    realtime::{AllowAllRooms, Hub},
};
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::fmt as tracing_fmt;
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if tracing::dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(tracing::Level::ERROR).finish();
    let dispatch = tracing::Dispatch::new(subscriber);
    tracing::dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Migrate(_) => run_migrate(settings).await,
    }
}

async fn run_migrate(settings: config::Settings) -> Result<(), AppError> {
    let repositories = init_repositories(&settings).await?;
    drop(repositories);
    info!("Migrations applied");
    Ok(())
}

async fn init_repositories(
    settings: &config::Settings,
) -> Result<Arc<PostgresRepositories>, AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))
        .map_err(AppError::from)?;

    let pool = PostgresRepositories::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    Ok(Arc::new(PostgresRepositories::new(pool)))
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let metrics_handle = telemetry::init_metrics().map_err(AppError::from)?;

    let repositories = init_repositories(&settings).await?;

    let substrate: Arc<dyn Substrate> = Arc::new(
        RedisSubstrate::connect(&settings.substrate.url)
            .await
            .map_err(|err| AppError::from(InfraError::substrate(err.to_string())))?,
    );
    let event_log: Arc<dyn EventLog> = Arc::new(
        StreamEventLog::connect(&settings.substrate.url)
            .await
            .map_err(|err| AppError::from(InfraError::event_log(err.to_string())))?,
    );

    let cache = Arc::new(CacheEngine::new(substrate.clone(), settings.cache.clone()));
    let validator = Arc::new(CommandValidator::with_entity_rules());

    let ingress = Arc::new(CommandIngress::new(
        repositories.clone(),
        validator,
        cache.clone(),
        IngressConfig {
            idempotency_ttl: settings.worker.idempotency_ttl,
            ..IngressConfig::default()
        },
    ));
    let breaker_config = BreakerConfig {
        max_failures: settings.breaker.max_failures,
        window: settings.breaker.window,
        reset_time: settings.breaker.reset_time,
    };

    let reads = Arc::new(EntityReadService::with_breaker(
        cache.clone(),
        repositories.clone(),
        Arc::new(CircuitBreaker::new("read-model", breaker_config.clone())),
    ));

    let hub = Arc::new(
        Hub::new(
            substrate.clone(),
            settings.realtime.clone(),
            Arc::new(AllowAllRooms),
        )
        .with_breaker(Arc::new(CircuitBreaker::new("pubsub", breaker_config.clone()))),
    );

    let shutdown = Arc::new(ShutdownController::new());
    let mut background = JoinSet::new();

    // Hub bridge: substrate subscription → local rooms.
    {
        let hub = hub.clone();
        let token = shutdown.subscribe();
        background.spawn(async move {
            if let Err(err) = hub.run(token).await {
                error!(error = %err, "Realtime hub stopped with error");
            }
        });
    }

    // Outbox relay plus its cleanup loop.
    if settings.roles.relay {
        let breaker = Arc::new(CircuitBreaker::new("event-log", breaker_config.clone()));
        let relay = Arc::new(OutboxRelay::new(
            repositories.clone(),
            event_log.clone(),
            breaker,
            RelayConfig {
                batch_size: settings.relay.batch_size,
                poll_interval: settings.relay.poll_interval,
                retry_delay: settings.relay.retry_delay,
                max_retries: settings.relay.max_retries,
                lease: settings.relay.lease,
                cleanup_interval: settings.relay.cleanup_interval,
                retention: settings.relay.retention,
                partition_index: settings.relay.partition_index,
                partition_count: settings.relay.partition_count,
            },
        ));

        let run_token = shutdown.subscribe();
        let relay_run = relay.clone();
        background.spawn(async move { relay_run.run(run_token).await });

        let cleanup_token = shutdown.subscribe();
        background.spawn(async move { relay.run_cleanup(cleanup_token).await });
    }

    // In-process command execution off the command topic.
    if settings.roles.processor {
        let consumer = Arc::new(
            StreamConsumer::join(
                &settings.substrate.url,
                vec![TOPIC_COMMANDS.to_string()],
                format!("{}-commands", settings.substrate.consumer_group),
                format!("processor-{}", Uuid::new_v4()),
            )
            .await
            .map_err(|err| AppError::from(InfraError::event_log(err.to_string())))?,
        );

        let pool_config = WorkerPoolConfig {
            max_workers: settings.worker.max_workers.get() as usize,
            default_timeout: settings.worker.default_timeout,
            ..WorkerPoolConfig::default()
        };
        let entity_handler = Arc::new(EntityCommandHandler::new(repositories.clone()));
        let pool = Arc::new(
            CommandWorkerPool::new(repositories.clone(), pool_config.clone())
                .register("entity.create", entity_handler.clone())
                .register("entity.update", entity_handler.clone())
                .register("entity.delete", entity_handler),
        );

        let processor = CommandProcessor::new(pool.clone(), repositories.clone(), consumer);
        let processor_token = shutdown.subscribe();
        background.spawn(async move { processor.run(processor_token).await });

        let scheduler = RetryScheduler::new(pool, repositories.clone(), pool_config);
        let scheduler_token = shutdown.subscribe();
        background.spawn(async move { scheduler.run(scheduler_token).await });
    }

    // Expired idempotency mappings are swept on the cleanup cadence.
    {
        let store = repositories.clone();
        let mut token = shutdown.subscribe();
        let interval = settings.relay.cleanup_interval;
        background.spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = token.recv() => break,
                    _ = tick.tick() => {
                        match CommandStore::expire_idempotency_keys(store.as_ref()).await {
                            Ok(0) => {}
                            Ok(removed) => info!(removed, "Expired idempotency keys"),
                            Err(err) => error!(error = %err, "Idempotency sweep failed"),
                        }
                    }
                }
            }
        });
    }

    // Cache updater off the events topic.
    if settings.roles.updater {
        let consumer = Arc::new(
            StreamConsumer::join(
                &settings.substrate.url,
                vec![TOPIC_EVENTS.to_string()],
                format!("{}-cache", settings.substrate.consumer_group),
                format!("updater-{}", Uuid::new_v4()),
            )
            .await
            .map_err(|err| AppError::from(InfraError::event_log(err.to_string())))?,
        );
        let updater = CacheUpdater::new(
            consumer,
            cache.clone(),
            hub.clone(),
            UpdaterConfig::default(),
        );
        let updater_token = shutdown.subscribe();
        background.spawn(async move { updater.run(updater_token).await });
    }

    let health = Arc::new(
        HealthRegistry::new()
            .register(Arc::new(DatabaseCheck(repositories.clone())))
            .register(Arc::new(SubstrateCheck(substrate.clone())))
            .register(Arc::new(EventLogCheck(event_log.clone()))),
    );

    let state = AppState {
        reads,
        ingress,
        hub: hub.clone(),
        authenticator: http::from_token_map(settings.auth_tokens.clone()),
        health,
        metrics: Some(metrics_handle),
    };
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(addr = %settings.server.addr, "Staffetta listening");

    // Ctrl-C flips the shared shutdown signal; the server and every
    // background loop observe the same token.
    {
        let controller = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                controller.signal();
            }
        });
    }

    let mut shutdown_signal = shutdown.subscribe();
    let serve_result = axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown_signal.recv().await })
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")));

    // Stop background loops; each finishes its current batch first.
    shutdown.signal();
    let drain = async {
        while background.join_next().await.is_some() {}
    };
    if tokio::time::timeout(settings.server.graceful_shutdown, drain)
        .await
        .is_err()
    {
        error!("Background tasks did not stop in time; aborting");
        background.abort_all();
    }
    hub.close_all();

    serve_result
}
