//! Service lifecycle
//!
//! Builds every component from the configuration, starts them in dependency
//! order and tears them down in reverse: scheduler, pollers, relay timers,
//! history cleanup, then the connection pool.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use errors::FieldResult;
use field_modbus::{ConnectionPool, Connector};
use field_rules::{ActionExecutor, AutomationScheduler, RelayTimers, RunLoggerManager};
use field_store::{EventPublisher, Store};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::core::config::ServiceConfig;
use crate::core::polling::PollingService;

/// External collaborators the runtime is wired to
pub struct RuntimeDeps {
    pub store: Arc<dyn Store>,
    pub connector: Arc<dyn Connector>,
    pub publisher: Arc<dyn EventPublisher>,
    /// Root of the per-automation run logs; `None` disables them
    pub run_log_root: Option<PathBuf>,
}

/// Running field controller
pub struct FieldRuntime {
    pool: ConnectionPool,
    timers: Arc<RelayTimers>,
    executor: Arc<ActionExecutor>,
    polling: PollingService,
    scheduler: Option<(Arc<AutomationScheduler>, JoinHandle<()>)>,
    cleanup: (JoinHandle<()>, CancellationToken),
}

impl FieldRuntime {
    /// Build and start every component. Must be called inside a tokio runtime.
    pub async fn start(config: &ServiceConfig, deps: RuntimeDeps) -> FieldResult<Self> {
        config.validate()?;

        let pool = ConnectionPool::new(deps.connector, config.pool_config());
        let timers = Arc::new(RelayTimers::new());

        let mut executor = ActionExecutor::new(
            Arc::clone(&deps.store),
            pool.clone(),
            Arc::clone(&timers),
            Arc::clone(&deps.publisher),
        );
        if let Some(root) = deps.run_log_root {
            executor = executor.with_run_logger(Arc::new(RunLoggerManager::new(root)));
        }
        let executor = Arc::new(executor);

        let polling = PollingService::new(
            Arc::clone(&deps.store),
            pool.clone(),
            Arc::clone(&deps.publisher),
            config.polling_config(),
        );
        if let Err(e) = polling.start().await {
            pool.shutdown_all().await;
            return Err(e);
        }

        let scheduler = if config.automation.enabled {
            let scheduler = Arc::new(AutomationScheduler::new(
                Arc::clone(&deps.store),
                Arc::clone(&executor),
                config.evaluator(),
                config.tick_interval(),
            ));
            let runner = Arc::clone(&scheduler);
            let task = tokio::spawn(async move { runner.start().await });
            Some((scheduler, task))
        } else {
            info!("Automation scheduler disabled by configuration");
            None
        };

        let cleanup = start_cleanup_task(
            Arc::clone(&deps.store),
            config.history_retention(),
            config.history_cleanup_interval(),
        );

        info!(
            "Field runtime started: {} devices polled, automation {}",
            polling.len(),
            if scheduler.is_some() { "on" } else { "off" }
        );
        Ok(Self {
            pool,
            timers,
            executor,
            polling,
            scheduler,
            cleanup,
        })
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn polling(&self) -> &PollingService {
        &self.polling
    }

    pub fn scheduler(&self) -> Option<&Arc<AutomationScheduler>> {
        self.scheduler.as_ref().map(|(scheduler, _)| scheduler)
    }

    pub fn executor(&self) -> &Arc<ActionExecutor> {
        &self.executor
    }

    pub fn timers(&self) -> &Arc<RelayTimers> {
        &self.timers
    }

    /// Stop everything and wait for background tasks to finish
    pub async fn stop(self) {
        info!("Shutting down field runtime...");

        if let Some((scheduler, task)) = self.scheduler {
            scheduler.stop();
            if let Err(e) = task.await {
                error!("Scheduler task err: {}", e);
            }
        }

        self.polling.stop().await;
        self.timers.shutdown().await;

        let (cleanup_task, cleanup_token) = self.cleanup;
        cleanup_token.cancel();
        if let Err(e) = cleanup_task.await {
            error!("Cleanup task err: {}", e);
        }

        self.pool.shutdown_all().await;
        info!("Field runtime stopped");
    }
}

/// Periodically delete reading history older than `retention`.
///
/// The first pass runs immediately. Returns the task handle and the token
/// that stops it.
pub fn start_cleanup_task(
    store: Arc<dyn Store>,
    retention: chrono::Duration,
    every: Duration,
) -> (JoinHandle<()>, CancellationToken) {
    let token = CancellationToken::new();
    let task_token = token.clone();

    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let cutoff = Utc::now() - retention;
                    match store.prune_readings(cutoff).await {
                        Ok(0) => debug!("History cleanup: nothing older than {}", cutoff),
                        Ok(removed) => info!("History cleanup: {} readings removed", removed),
                        Err(e) => error!("History cleanup err: {}", e),
                    }
                }
                () = task_token.cancelled() => {
                    debug!("History cleanup task received cancellation signal");
                    break;
                }
            }
        }

        info!("History cleanup task terminated");
    });

    (handle, token)
}
