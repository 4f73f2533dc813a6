//! Automation scheduler
//!
//! One periodic tick (30 s by default). Every tick reloads the enabled
//! automations, evaluates their triggers in priority order and runs the due
//! ones through the [`ActionExecutor`]. A tick that overruns makes the next
//! one be skipped, never queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use errors::{FieldError, FieldResult};
use field_model::{AutomationRunLog, RunSource, ScheduleTrigger, TriggerConfig};
use field_store::Store;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::evaluator::{EvalTime, TriggerEvaluator};
use crate::executor::ActionExecutor;

/// Default scheduler tick interval
pub const DEFAULT_TICK_SECS: u64 = 30;

/// Scheduler status information
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub tick_interval_ms: u64,
    pub last_tick: Option<DateTime<Utc>>,
    pub ticks: u64,
    pub skipped_ticks: u64,
    /// Automations evaluated over all ticks
    pub evaluated: u64,
    /// Automations fired over all ticks
    pub fired: u64,
}

/// Result of one tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub evaluated: usize,
    /// Ids of the automations that ran, in execution order
    pub fired: Vec<i64>,
    pub skipped: bool,
}

/// Clears the tick flag when a tick ends or is dropped mid-way
struct TickGuard<'a>(&'a AtomicBool);

impl<'a> TickGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct AutomationScheduler {
    store: Arc<dyn Store>,
    executor: Arc<ActionExecutor>,
    evaluator: TriggerEvaluator,
    tick_interval: Duration,
    /// Re-entrancy guard for ticks
    in_tick: AtomicBool,
    running: AtomicBool,
    shutdown: CancellationToken,
    status: Mutex<SchedulerStatus>,
}

impl AutomationScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        executor: Arc<ActionExecutor>,
        evaluator: TriggerEvaluator,
        tick_interval: Duration,
    ) -> Self {
        Self {
            store,
            executor,
            evaluator,
            tick_interval,
            in_tick: AtomicBool::new(false),
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            status: Mutex::new(SchedulerStatus {
                tick_interval_ms: tick_interval.as_millis() as u64,
                ..SchedulerStatus::default()
            }),
        }
    }

    pub fn executor(&self) -> &Arc<ActionExecutor> {
        &self.executor
    }

    /// Run the tick loop until [`stop`](Self::stop) is called.
    ///
    /// Each tick runs on its own task so the loop keeps its cadence; a tick
    /// arriving while the previous one is still running is counted as
    /// skipped. Stopping interrupts the running tick.
    pub async fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Scheduler already running");
            return;
        }
        self.status.lock().running = true;
        info!("Automation scheduler started ({:?} tick)", self.tick_interval);

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut inflight: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Scheduler received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    if inflight.as_ref().is_some_and(|task| !task.is_finished()) {
                        self.record_skipped_tick();
                        continue;
                    }
                    let scheduler = Arc::clone(&self);
                    inflight = Some(tokio::spawn(async move {
                        tokio::select! {
                            biased;
                            _ = scheduler.shutdown.cancelled() => {
                                debug!("Scheduler tick interrupted by shutdown");
                            }
                            report = scheduler.tick_once(EvalTime::at(Utc::now())) => {
                                if !report.fired.is_empty() {
                                    debug!("Tick fired automations {:?}", report.fired);
                                }
                            }
                        }
                    }));
                }
            }
        }

        if let Some(task) = inflight {
            if let Err(e) = task.await {
                error!("Scheduler tick task err: {}", e);
            }
        }
        self.running.store(false, Ordering::SeqCst);
        self.status.lock().running = false;
        info!("Automation scheduler stopped");
    }

    pub fn stop(&self) {
        info!("Stopping automation scheduler...");
        self.shutdown.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SchedulerStatus {
        self.status.lock().clone()
    }

    /// Evaluate every enabled automation once as of `at`.
    ///
    /// Returns immediately with `skipped` set when another tick is still
    /// in progress.
    pub async fn tick_once(&self, at: EvalTime) -> TickReport {
        let Some(_guard) = TickGuard::acquire(&self.in_tick) else {
            self.record_skipped_tick();
            return TickReport {
                skipped: true,
                ..TickReport::default()
            };
        };

        let report = self.evaluate_all(&at).await;

        let mut status = self.status.lock();
        status.ticks += 1;
        status.last_tick = Some(at.now);
        status.evaluated += report.evaluated as u64;
        status.fired += report.fired.len() as u64;
        report
    }

    fn record_skipped_tick(&self) {
        warn!("Previous scheduler tick still running, skipping");
        self.status.lock().skipped_ticks += 1;
    }

    async fn evaluate_all(&self, at: &EvalTime) -> TickReport {
        let mut report = TickReport::default();
        let automations = match self.store.list_enabled_automations().await {
            Ok(list) => list,
            Err(e) => {
                error!("Load automations err: {}", e);
                return report;
            },
        };

        for automation in &automations {
            report.evaluated += 1;
            let source = match self.evaluator.evaluate(automation, at, &*self.store).await {
                Ok(Some(source)) => source,
                Ok(None) => continue,
                Err(e) => {
                    // One bad trigger must not stop the rest
                    warn!("Automation {} trigger err: {}", automation.id, e);
                    continue;
                },
            };

            match self.executor.run_at(automation, source, at.now).await {
                Ok(_) => report.fired.push(automation.id),
                Err(e) => {
                    error!("Automation {} run err: {}", automation.id, e);
                    continue;
                },
            }

            if matches!(
                automation.parse_trigger(),
                Ok(TriggerConfig::Schedule(ScheduleTrigger::Once { .. }))
            ) {
                match self.store.set_automation_enabled(automation.id, false).await {
                    Ok(()) => info!("One-shot automation {} disabled", automation.id),
                    Err(e) => error!("Disable automation {} err: {}", automation.id, e),
                }
            }
        }
        report
    }

    /// Run an automation now regardless of its trigger or enabled flag
    pub async fn run_now(&self, automation_id: i64) -> FieldResult<AutomationRunLog> {
        let automation = self
            .store
            .get_automation(automation_id)
            .await?
            .ok_or_else(|| FieldError::not_found(format!("automation {}", automation_id)))?;
        info!("Manual run of automation {}", automation_id);
        self.executor.run(&automation, RunSource::Manual).await
    }
}
