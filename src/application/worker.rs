//! Bounded command worker pool and retry scheduler.
//!
//! Handlers execute under a semaphore-bounded pool with a per-command
//! timeout. Submission awaits a permit, which is the backpressure seam:
//! a full pool slows the consumer down instead of queueing unboundedly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, histogram};
use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn};

use crate::domain::{Command, CommandEnvelope, CommandStatus, ErrorDetail};
use crate::infra::eventlog::EventLogConsumer;

use super::error::AppError;
use super::repos::{CommandStore, RepoError};
use super::shutdown::Shutdown;

const METRIC_COMMANDS_COMPLETED: &str = "staffetta_commands_completed_total";
const METRIC_COMMANDS_FAILED: &str = "staffetta_commands_failed_total";
const METRIC_COMMANDS_RETRIED: &str = "staffetta_commands_retried_total";
const METRIC_COMMAND_SECONDS: &str = "staffetta_command_handle_seconds";

pub const ERROR_CODE_TIMEOUT: &str = "TIMEOUT";
pub const ERROR_CODE_NO_HANDLER: &str = "NO_HANDLER";
pub const ERROR_CODE_HANDLER: &str = "HANDLER_ERROR";

/// One command type's executor.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: &Command) -> Result<(), AppError>;
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub max_workers: usize,
    /// Fallback when a command carries no timeout of its own.
    pub default_timeout: Duration,
    /// Retry scheduler tick.
    pub retry_poll_interval: Duration,
    pub retry_batch: u32,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            default_timeout: Duration::from_secs(30),
            retry_poll_interval: Duration::from_secs(1),
            retry_batch: 50,
        }
    }
}

/// Bounded pool executing accepted commands in-process.
///
/// The type-to-handler mapping is fixed at construction; unknown types were
/// already rejected at validation, so hitting one here marks the command
/// failed rather than panicking.
pub struct CommandWorkerPool {
    store: Arc<dyn CommandStore>,
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
    permits: Arc<Semaphore>,
    config: WorkerPoolConfig,
}

impl CommandWorkerPool {
    pub fn new(store: Arc<dyn CommandStore>, config: WorkerPoolConfig) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
            permits: Arc::new(Semaphore::new(config.max_workers.max(1))),
            config,
        }
    }

    /// Register a handler for a command type. Call before the pool starts.
    pub fn register(mut self, command_type: impl Into<String>, handler: Arc<dyn CommandHandler>) -> Self {
        self.handlers.insert(command_type.into(), handler);
        self
    }

    /// Execute one command to completion, updating its row.
    ///
    /// Awaits a pool permit first; that await is the cooperative
    /// backpressure the consumer leans on.
    #[instrument(skip(self, command), fields(command_id = %command.id, command_type = %command.command_type))]
    pub async fn execute(&self, command: Command) {
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return, // semaphore closed during shutdown
        };

        let started_at = std::time::Instant::now();
        let result = self.run_handler(&command).await;
        histogram!(METRIC_COMMAND_SECONDS, "type" => command.command_type.clone())
            .record(started_at.elapsed().as_secs_f64());
        drop(permit);

        self.settle(&command, result).await;
    }

    async fn run_handler(&self, command: &Command) -> Result<(), ErrorDetail> {
        if let Err(err) = self.store.mark_processing(command.id).await {
            // Another worker already claimed this delivery; duplicate
            // deliveries are expected under at-least-once consumption.
            match err {
                RepoError::Conflict { .. } => return Ok(()),
                other => {
                    return Err(ErrorDetail::new(ERROR_CODE_HANDLER, other.to_string()));
                }
            }
        }

        let Some(handler) = self.handlers.get(&command.command_type) else {
            return Err(ErrorDetail::new(
                ERROR_CODE_NO_HANDLER,
                format!("no handler for `{}`", command.command_type),
            ));
        };

        let timeout = if command.timeout.is_zero() {
            self.config.default_timeout
        } else {
            command.timeout
        };

        match tokio::time::timeout(timeout, handler.handle(command)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(ErrorDetail::new(ERROR_CODE_HANDLER, err.to_string())),
            Err(_) => Err(ErrorDetail::new(
                ERROR_CODE_TIMEOUT,
                format!("handler exceeded {timeout:?}"),
            )),
        }
    }

    async fn settle(&self, command: &Command, result: Result<(), ErrorDetail>) {
        match result {
            Ok(()) => {
                if let Err(err) = self.store.complete_command(command.id).await {
                    error!(command_id = %command.id, error = %err, "Completion update failed");
                    return;
                }
                counter!(METRIC_COMMANDS_COMPLETED).increment(1);
            }
            Err(detail) => {
                let reschedule_at = command.is_retryable().then(|| command.next_retry_at());
                let terminal = reschedule_at.is_none();
                if let Err(err) = self
                    .store
                    .fail_command(command.id, &detail, reschedule_at)
                    .await
                {
                    error!(command_id = %command.id, error = %err, "Failure update failed");
                    return;
                }
                if terminal {
                    counter!(METRIC_COMMANDS_FAILED).increment(1);
                    warn!(
                        command_id = %command.id,
                        code = %detail.code,
                        error = %detail.message,
                        "Command failed terminally"
                    );
                } else {
                    counter!(METRIC_COMMANDS_RETRIED).increment(1);
                    info!(
                        command_id = %command.id,
                        retry = command.retry_count + 1,
                        "Command scheduled for retry"
                    );
                }
            }
        }
    }
}

/// Consumes the command topic and feeds the pool.
pub struct CommandProcessor {
    pool: Arc<CommandWorkerPool>,
    store: Arc<dyn CommandStore>,
    consumer: Arc<dyn EventLogConsumer>,
    poll_batch: usize,
    poll_block_ms: u64,
}

impl CommandProcessor {
    pub fn new(
        pool: Arc<CommandWorkerPool>,
        store: Arc<dyn CommandStore>,
        consumer: Arc<dyn EventLogConsumer>,
    ) -> Self {
        Self {
            pool,
            store,
            consumer,
            poll_batch: 64,
            poll_block_ms: 1000,
        }
    }

    /// Run until shutdown: poll the topic, execute, acknowledge.
    pub async fn run(&self, mut shutdown: Shutdown) {
        info!("Command processor started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                polled = self.consumer.poll(self.poll_batch, self.poll_block_ms) => {
                    let records = match polled {
                        Ok(records) => records,
                        Err(err) => {
                            warn!(error = %err, "Command topic poll failed");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                    };
                    self.execute_batch(records).await;
                }
            }
        }

        info!("Command processor stopped");
    }

    /// Execute one polled batch. Commands run concurrently, bounded by the
    /// pool's permits; acknowledgement happens after the whole batch has
    /// settled so a crash mid-batch replays it (the mark_processing claim
    /// absorbs the duplicates).
    async fn execute_batch(&self, records: Vec<crate::infra::eventlog::LogRecord>) {
        let mut executions = tokio::task::JoinSet::new();
        for record in &records {
            match self.load_runnable(record).await {
                Ok(Some(command)) => {
                    let pool = self.pool.clone();
                    executions.spawn(async move { pool.execute(command).await });
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(entry = %record.entry_id, error = %err, "Command record skipped");
                }
            }
        }
        while executions.join_next().await.is_some() {}

        for record in &records {
            if let Err(err) = self.consumer.ack(record).await {
                warn!(entry = %record.entry_id, error = %err, "Ack failed");
            }
        }
    }

    async fn load_runnable(
        &self,
        record: &crate::infra::eventlog::LogRecord,
    ) -> Result<Option<Command>, AppError> {
        let envelope: CommandEnvelope = serde_json::from_slice(&record.payload)
            .map_err(|err| AppError::unexpected(format!("bad command envelope: {err}")))?;

        let Some(command) = self.store.find_command(envelope.command_id).await? else {
            // Command row purged or never committed locally; nothing to do.
            return Ok(None);
        };

        // Only runnable statuses enter the pool; completed/failed rows mean
        // this is a duplicate delivery.
        if !matches!(
            command.status,
            CommandStatus::Pending | CommandStatus::Retrying
        ) {
            return Ok(None);
        }
        Ok(Some(command))
    }
}

/// Dispatches retrying commands whose schedule has come due.
pub struct RetryScheduler {
    pool: Arc<CommandWorkerPool>,
    store: Arc<dyn CommandStore>,
    config: WorkerPoolConfig,
}

impl RetryScheduler {
    pub fn new(
        pool: Arc<CommandWorkerPool>,
        store: Arc<dyn CommandStore>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            pool,
            store,
            config,
        }
    }

    pub async fn run(&self, mut shutdown: Shutdown) {
        let mut tick = tokio::time::interval(self.config.retry_poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!("Retry scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tick.tick() => {
                    match self.store.due_retries(self.config.retry_batch).await {
                        Ok(due) => {
                            for command in due {
                                self.pool.execute(command).await;
                            }
                        }
                        Err(err) => warn!(error = %err, "Retry sweep failed"),
                    }
                }
            }
        }
        info!("Retry scheduler stopped");
    }
}
