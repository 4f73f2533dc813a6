//! Action executor
//!
//! Runs an automation's actions in order and records the run:
//! - `alert`: inserts an alert record
//! - `log`: writes to the service log only
//! - `control`: relay coil writes (single channel or every relay channel of
//!   the device, optionally staggered), delayed starts and auto-off through
//!   [`RelayTimers`], or a single holding-register write
//!
//! A failing action never stops the ones after it. Every run increments the
//! automation's run counter, stores a run log and publishes a summary event.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use errors::{validation_error, FieldError, FieldResult};
use field_modbus::{ConnectionKey, ConnectionPool, Request};
use field_model::{
    ActionConfig, ActionOutcome, ActionStatus, Alert, AlertSeverity, Automation,
    AutomationRunLog, ChannelOutcome, ControlAction, Device, EventPayload, FieldEvent,
    RelayChangeCause, RunSource, RunStatus,
};
use field_store::{EventPublisher, Store};
use tracing::{debug, error, info, warn};

use crate::logger::RunLoggerManager;
use crate::timers::{RelayTimers, TimerKey, TimerPurpose};

/// One relay channel resolved to its coil
#[derive(Debug, Clone)]
struct RelayTarget {
    device_id: i64,
    key: ConnectionKey,
    write_only: bool,
    channel: u16,
    coil_address: u16,
}

impl RelayTarget {
    fn new(device: &Device, channel: u16, coil_address: u16) -> Self {
        Self {
            device_id: device.id,
            key: device_key(device),
            write_only: device.write_only,
            channel,
            coil_address,
        }
    }
}

fn device_key(device: &Device) -> ConnectionKey {
    ConnectionKey::new(device.host.clone(), device.port, device.unit_id)
}

/// Writes a relay coil and records the new state.
///
/// Cloned into timer tasks, so it only holds shared handles.
#[derive(Clone)]
struct RelaySwitch {
    store: Arc<dyn Store>,
    pool: ConnectionPool,
    publisher: Arc<dyn EventPublisher>,
    timers: Arc<RelayTimers>,
}

impl RelaySwitch {
    async fn write_and_record(
        &self,
        target: &RelayTarget,
        state: bool,
        cause: RelayChangeCause,
    ) -> FieldResult<()> {
        let request = Request::WriteSingleCoil {
            address: target.coil_address,
            value: state,
        };
        if target.write_only {
            self.pool.write_fire_and_forget(&target.key, request)?;
        } else {
            self.pool.execute(&target.key, request).await?;
        }

        if let Err(e) = self
            .store
            .set_relay_state(target.device_id, target.channel, state)
            .await
        {
            warn!("Relay cache err dev{} ch{}: {}", target.device_id, target.channel, e);
        }

        self.publisher.publish(FieldEvent::new(EventPayload::RelayState {
            device_id: target.device_id,
            channel: target.channel,
            coil_address: target.coil_address,
            state,
            cause,
        }));
        info!(
            "Relay dev{} ch{} (coil {}) -> {} [{:?}]",
            target.device_id,
            target.channel,
            target.coil_address,
            if state { "on" } else { "off" },
            cause
        );
        Ok(())
    }

    /// Write, then arm the auto-off timer when the channel was switched on
    async fn apply(
        &self,
        target: RelayTarget,
        state: bool,
        cause: RelayChangeCause,
        duration_seconds: u64,
    ) -> FieldResult<()> {
        self.write_and_record(&target, state, cause).await?;

        if !state {
            // An explicit off supersedes a pending auto-off
            self.timers.cancel(&TimerKey::new(
                TimerPurpose::Off,
                target.device_id,
                target.channel,
            ));
        } else if duration_seconds > 0 {
            let switch = self.clone();
            let device_id = target.device_id;
            let channel = target.channel;
            self.timers.schedule_off(
                device_id,
                channel,
                Duration::from_secs(duration_seconds),
                async move {
                    if let Err(e) = switch
                        .write_and_record(&target, false, RelayChangeCause::AutoOff)
                        .await
                    {
                        error!("Auto-off dev{} ch{} failed: {}", target.device_id, target.channel, e);
                    }
                },
            );
        }
        Ok(())
    }
}

/// Executes automation actions against devices and persistence
pub struct ActionExecutor {
    store: Arc<dyn Store>,
    switch: RelaySwitch,
    run_logger: Option<Arc<RunLoggerManager>>,
}

impl ActionExecutor {
    pub fn new(
        store: Arc<dyn Store>,
        pool: ConnectionPool,
        timers: Arc<RelayTimers>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            store: Arc::clone(&store),
            switch: RelaySwitch {
                store,
                pool,
                publisher,
                timers,
            },
            run_logger: None,
        }
    }

    /// Also append every run to the per-automation log files
    pub fn with_run_logger(mut self, run_logger: Arc<RunLoggerManager>) -> Self {
        self.run_logger = Some(run_logger);
        self
    }

    pub fn timers(&self) -> &Arc<RelayTimers> {
        &self.switch.timers
    }

    pub async fn run(&self, automation: &Automation, source: RunSource) -> FieldResult<AutomationRunLog> {
        self.run_at(automation, source, Utc::now()).await
    }

    /// Run every action, then record the run as of `at`
    pub async fn run_at(
        &self,
        automation: &Automation,
        source: RunSource,
        at: DateTime<Utc>,
    ) -> FieldResult<AutomationRunLog> {
        let clock = Instant::now();
        info!(
            "Automation {} '{}' triggered by {} ({} actions)",
            automation.id,
            automation.name,
            source,
            automation.actions.len()
        );

        let mut outcomes = Vec::with_capacity(automation.actions.len());
        for (index, action) in automation.actions.iter().enumerate() {
            let outcome = self.execute_action(automation, index, action).await;
            if !outcome.is_ok() {
                warn!(
                    "Automation {} action #{} ({}) failed: {}",
                    automation.id,
                    index,
                    outcome.action_type,
                    outcome.detail.as_deref().unwrap_or("unknown")
                );
            }
            outcomes.push(outcome);
        }

        let status = run_status(&outcomes);
        let error = outcomes
            .iter()
            .find(|o| !o.is_ok())
            .and_then(|o| o.detail.clone());
        let run = AutomationRunLog {
            automation_id: automation.id,
            source,
            status,
            actions: outcomes,
            error,
            started_at: at,
            duration_ms: clock.elapsed().as_millis() as u64,
        };

        // Bookkeeping failures never hide a run whose actions already happened
        if let Err(e) = self.store.record_automation_run(automation.id, at).await {
            warn!("Automation {} run count update err: {}", automation.id, e);
        }
        if let Err(e) = self.store.insert_run_log(&run).await {
            warn!("Automation {} run log insert err: {}", automation.id, e);
        }
        if let Some(run_logger) = &self.run_logger {
            run_logger.log_run(&run);
        }

        let actions_executed = run.actions.iter().filter(|a| a.is_ok()).count();
        self.switch
            .publisher
            .publish(FieldEvent::new(EventPayload::AutomationExecuted {
                automation_id: automation.id,
                name: automation.name.clone(),
                source,
                status,
                actions_executed,
            }));
        info!(
            "Automation {} done: {} ({}/{} actions, {}ms)",
            automation.id,
            status.as_str(),
            actions_executed,
            run.actions.len(),
            run.duration_ms
        );
        Ok(run)
    }

    async fn execute_action(
        &self,
        automation: &Automation,
        index: usize,
        action: &ActionConfig,
    ) -> ActionOutcome {
        let mut outcome = ActionOutcome {
            index,
            action_type: action.kind().to_string(),
            status: ActionStatus::Executed,
            detail: None,
            channels: Vec::new(),
        };

        match action {
            ActionConfig::Alert { severity, message } => {
                let alert = Alert {
                    automation_id: Some(automation.id),
                    severity: *severity,
                    message: message.clone(),
                    created_at: Utc::now(),
                };
                match severity {
                    AlertSeverity::Critical => error!("Alert [{}] {}", automation.name, message),
                    AlertSeverity::Warning => warn!("Alert [{}] {}", automation.name, message),
                    AlertSeverity::Info => info!("Alert [{}] {}", automation.name, message),
                }
                if let Err(e) = self.store.insert_alert(&alert).await {
                    outcome.status = ActionStatus::Failed;
                    outcome.detail = Some(e.to_string());
                }
            },
            ActionConfig::Log { message } => {
                info!(
                    "Automation {} log: {}",
                    automation.id,
                    message.as_deref().unwrap_or(&automation.name)
                );
            },
            ActionConfig::Control(control) => {
                self.execute_control(control, &mut outcome).await;
            },
        }
        outcome
    }

    async fn execute_control(&self, control: &ControlAction, outcome: &mut ActionOutcome) {
        let device = match self.load_device(control.device_id).await {
            Ok(device) => device,
            Err(e) => {
                outcome.status = ActionStatus::Failed;
                outcome.detail = Some(e.to_string());
                return;
            },
        };

        if let Some(register) = control.register {
            if let Err(e) = self.write_register(&device, register, control.value).await {
                outcome.status = ActionStatus::Failed;
                outcome.detail = Some(e.to_string());
            }
            return;
        }

        match control.channel {
            Some(channel) => {
                let result = self.control_channel(&device, channel, control).await;
                outcome.status = result.status;
                outcome.detail = result.error.clone();
                outcome.channels.push(result);
            },
            None => self.control_all_channels(&device, control, outcome).await,
        }
    }

    async fn load_device(&self, device_id: i64) -> FieldResult<Device> {
        let device = self
            .store
            .get_device(device_id)
            .await?
            .ok_or_else(|| FieldError::not_found(format!("device {}", device_id)))?;
        if !device.enabled {
            return Err(validation_error!("device {} is disabled", device_id));
        }
        Ok(device)
    }

    async fn write_register(&self, device: &Device, register: u16, value: Option<u16>) -> FieldResult<()> {
        let value = value.ok_or_else(|| {
            validation_error!("register control on device {} needs a value", device.id)
        })?;
        let key = device_key(device);
        let request = Request::WriteSingleRegister {
            address: register,
            value,
        };
        if device.write_only {
            self.switch.pool.write_fire_and_forget(&key, request)?;
        } else {
            self.switch.pool.execute(&key, request).await?;
        }
        info!("Register dev{} {} <- {}", device.id, register, value);
        Ok(())
    }

    /// Every relay channel in mapping order, `stagger_delay_seconds` apart
    async fn control_all_channels(
        &self,
        device: &Device,
        control: &ControlAction,
        outcome: &mut ActionOutcome,
    ) {
        let channel_count = device.relay_mappings().count();
        if channel_count == 0 {
            outcome.status = ActionStatus::Failed;
            outcome.detail = Some(format!("device {} has no relay channels", device.id));
            return;
        }

        let stagger = Duration::from_secs(control.stagger_delay_seconds);
        for channel in 1..=channel_count as u16 {
            if channel > 1 && !stagger.is_zero() {
                debug!("Stagger {:?} before dev{} ch{}", stagger, device.id, channel);
                tokio::time::sleep(stagger).await;
            }
            let result = self.control_channel(device, channel, control).await;
            outcome.channels.push(result);
        }

        let failed = outcome
            .channels
            .iter()
            .filter(|c| c.status == ActionStatus::Failed)
            .count();
        if failed == channel_count {
            outcome.status = ActionStatus::Failed;
        } else if outcome
            .channels
            .iter()
            .all(|c| c.status == ActionStatus::Scheduled)
        {
            outcome.status = ActionStatus::Scheduled;
        }
        if failed > 0 {
            outcome.detail = Some(format!("{} of {} channels failed", failed, channel_count));
        }
    }

    async fn control_channel(&self, device: &Device, channel: u16, control: &ControlAction) -> ChannelOutcome {
        let state = control
            .state
            .resolve(device.last_reading.relays.get(&channel).copied());
        let mut result = ChannelOutcome {
            channel,
            coil_address: 0,
            state,
            status: ActionStatus::Executed,
            error: None,
        };

        let coil_address = match device.coil_for_channel(channel) {
            Ok(address) => address,
            Err(e) => {
                result.status = ActionStatus::Failed;
                result.error = Some(e.to_string());
                return result;
            },
        };
        result.coil_address = coil_address;
        let target = RelayTarget::new(device, channel, coil_address);

        if control.delay_seconds > 0 {
            let switch = self.switch.clone();
            let duration = control.duration_seconds;
            self.switch.timers.schedule_delayed_start(
                device.id,
                channel,
                Duration::from_secs(control.delay_seconds),
                async move {
                    let device_id = target.device_id;
                    if let Err(e) = switch
                        .apply(target, state, RelayChangeCause::DelayedStart, duration)
                        .await
                    {
                        error!("Delayed start dev{} ch{} failed: {}", device_id, channel, e);
                    }
                },
            );
            result.status = ActionStatus::Scheduled;
            return result;
        }

        if let Err(e) = self
            .switch
            .apply(target, state, RelayChangeCause::Control, control.duration_seconds)
            .await
        {
            result.status = ActionStatus::Failed;
            result.error = Some(e.to_string());
        }
        result
    }
}

fn run_status(outcomes: &[ActionOutcome]) -> RunStatus {
    let failed = outcomes.iter().filter(|o| !o.is_ok()).count();
    if failed == 0 {
        RunStatus::Success
    } else if failed == outcomes.len() {
        RunStatus::Failure
    } else {
        RunStatus::Partial
    }
}
