//! Device polling engine
//!
//! Every enabled device gets its own task. A tick reads the device's polled
//! mappings one after another through the [`ConnectionPool`], decodes them and
//! writes the snapshot, history and status back to the store. Devices without
//! mappings only get a one-register connectivity probe.
//!
//! After a failed tick the next one is delayed by
//! `max(configured interval, backoff(consecutive errors))`. A separate refresh
//! loop reconciles the running pollers with the device list.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use errors::{FieldError, FieldResult};
use field_model::{
    Device, DeviceStatus, EventPayload, FieldEvent, FunctionCode, LastReading, Reading,
    RegisterMapping, MAX_POLL_INTERVAL_MS, MIN_POLL_INTERVAL_MS,
};
use field_modbus::codec::{decode_mapping, decode_mapping_bits};
use field_modbus::{BackoffPolicy, ConnectionKey, ConnectionPool, Request, RequestOptions};
use field_store::{DeviceErrorRecord, EventPublisher, Store};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Polling engine settings
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Interval for devices stored without one
    pub default_interval_ms: u64,
    pub backoff: BackoffPolicy,
    pub refresh_interval: Duration,
    pub probe_address: u16,
    /// Timeout and retry budget of every poll read
    pub request: RequestOptions,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            default_interval_ms: 1000,
            backoff: BackoffPolicy::from_millis(1000, 60_000),
            refresh_interval: Duration::from_secs(30),
            probe_address: 0,
            request: RequestOptions::default(),
        }
    }
}

impl PollingConfig {
    /// Device interval clamped to 100..=60000 ms
    pub fn configured_interval(&self, device: &Device) -> Duration {
        let ms = if device.poll_interval_ms == 0 {
            self.default_interval_ms
        } else {
            device.poll_interval_ms
        };
        Duration::from_millis(ms.clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS))
    }

    /// Delay before the next tick after `consecutive_errors` failures
    pub fn effective_interval(&self, device: &Device, consecutive_errors: u32) -> Duration {
        self.configured_interval(device)
            .max(self.backoff.delay_for(consecutive_errors))
    }
}

/// Result of one poll tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// At least one mapping was read
    Online { readings: usize, failed_mappings: usize },
    /// Connectivity probe of a device without mappings succeeded
    Reachable,
    Failed {
        consecutive_errors: u32,
        status: DeviceStatus,
    },
    /// A poll of this device was already in flight
    Skipped,
}

/// Per-device polling state as exposed for introspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStateInfo {
    pub device_id: i64,
    pub name: String,
    pub interval_ms: u64,
    pub consecutive_errors: u32,
    pub backoff_ms: u64,
    pub effective_interval_ms: u64,
    pub last_poll: Option<DateTime<Utc>>,
    pub status: DeviceStatus,
    pub busy: bool,
}

/// Changes applied by one device-list refresh
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub added: Vec<i64>,
    pub removed: Vec<i64>,
    pub reconfigured: Vec<i64>,
}

impl RefreshReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.reconfigured.is_empty()
    }
}

struct DeviceState {
    device: Device,
    consecutive_errors: u32,
    backoff: Duration,
    last_poll: Option<DateTime<Utc>>,
    status: DeviceStatus,
}

struct DevicePoller {
    state: Mutex<DeviceState>,
    busy: AtomicBool,
    /// Restarts the wait for the next tick after a forced poll
    rearm: Notify,
}

impl DevicePoller {
    fn new(device: Device, consecutive_errors: u32, backoff: Duration) -> Self {
        let status = device.status;
        Self {
            state: Mutex::new(DeviceState {
                device,
                consecutive_errors,
                backoff,
                last_poll: None,
                status,
            }),
            busy: AtomicBool::new(false),
            rearm: Notify::new(),
        }
    }

    fn device(&self) -> Device {
        self.state.lock().device.clone()
    }

    fn next_delay(&self, config: &PollingConfig) -> Duration {
        let state = self.state.lock();
        config.configured_interval(&state.device).max(state.backoff)
    }

    fn info(&self, config: &PollingConfig) -> DeviceStateInfo {
        let state = self.state.lock();
        let interval = config.configured_interval(&state.device);
        DeviceStateInfo {
            device_id: state.device.id,
            name: state.device.name.clone(),
            interval_ms: interval.as_millis() as u64,
            consecutive_errors: state.consecutive_errors,
            backoff_ms: state.backoff.as_millis() as u64,
            effective_interval_ms: interval.max(state.backoff).as_millis() as u64,
            last_poll: state.last_poll,
            status: state.status,
            busy: self.busy.load(Ordering::SeqCst),
        }
    }
}

/// Clears the busy flag when a poll ends or is cancelled
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct PollerHandle {
    poller: Arc<DevicePoller>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Collaborators shared by every device task
struct PollContext {
    store: Arc<dyn Store>,
    pool: ConnectionPool,
    publisher: Arc<dyn EventPublisher>,
    config: PollingConfig,
}

struct PollingInner {
    ctx: Arc<PollContext>,
    pollers: DashMap<i64, PollerHandle>,
    running: AtomicBool,
    shutdown: CancellationToken,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

/// Polls every enabled device on its own schedule.
///
/// Cloning is cheap; clones drive the same pollers.
#[derive(Clone)]
pub struct PollingService {
    inner: Arc<PollingInner>,
}

impl PollingService {
    pub fn new(
        store: Arc<dyn Store>,
        pool: ConnectionPool,
        publisher: Arc<dyn EventPublisher>,
        config: PollingConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PollingInner {
                ctx: Arc::new(PollContext {
                    store,
                    pool,
                    publisher,
                    config,
                }),
                pollers: DashMap::new(),
                running: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                refresh_task: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &PollingConfig {
        &self.inner.ctx.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Start a poller per enabled device and the periodic refresh loop
    pub async fn start(&self) -> FieldResult<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("Polling service already running");
            return Ok(());
        }

        let report = match self.refresh().await {
            Ok(report) => report,
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(e);
            },
        };
        info!("Polling service started: {} devices", report.added.len());

        let task = spawn_refresh_loop(
            Arc::downgrade(&self.inner),
            self.inner.shutdown.clone(),
            self.inner.ctx.config.refresh_interval,
        );
        *self.inner.refresh_task.lock() = Some(task);
        Ok(())
    }

    /// Cancel every poller and the refresh loop and wait for them to end
    pub async fn stop(&self) {
        info!("Stopping polling service...");
        self.inner.shutdown.cancel();

        let refresh = self.inner.refresh_task.lock().take();
        if let Some(task) = refresh {
            let _ = task.await;
        }

        let ids: Vec<i64> = self.inner.pollers.iter().map(|e| *e.key()).collect();
        let handles: Vec<PollerHandle> = ids
            .iter()
            .filter_map(|id| self.inner.pollers.remove(id).map(|(_, h)| h))
            .collect();
        let count = handles.len();
        join_all(handles.into_iter().map(|h| {
            h.cancel.cancel();
            h.task
        }))
        .await;

        self.inner.running.store(false, Ordering::SeqCst);
        info!("Polling service stopped ({} pollers)", count);
    }

    /// Reconcile pollers with the stored device list.
    ///
    /// Added devices start polling, removed or disabled ones stop, every
    /// disabled device is stored as `Disabled`, and a
    /// device whose address, interval or mappings changed gets a new poller
    /// that keeps its error count.
    pub async fn refresh(&self) -> FieldResult<RefreshReport> {
        let devices = self.inner.ctx.store.list_devices().await?;
        let mut report = RefreshReport::default();

        let mut wanted: HashMap<i64, Device> = HashMap::new();
        let mut disabled = Vec::new();
        for device in devices {
            if !device.enabled {
                disabled.push((device.id, device.status));
                continue;
            }
            if let Err(e) = device.validate() {
                warn!("Device {} skipped, invalid config: {}", device.id, e);
                continue;
            }
            wanted.insert(device.id, device);
        }

        let running: Vec<i64> = self.inner.pollers.iter().map(|e| *e.key()).collect();
        for id in running {
            if wanted.contains_key(&id) {
                continue;
            }
            if self.stop_poller(id).await.is_some() {
                report.removed.push(id);
                if disabled.iter().any(|(d, _)| *d == id) {
                    info!("Device {} disabled, polling stopped", id);
                } else {
                    info!("Device {} removed, polling stopped", id);
                }
            }
        }

        // Stored status follows the enabled flag, even for devices never polled
        for (id, status) in disabled {
            if status == DeviceStatus::Disabled {
                continue;
            }
            if let Err(e) = self
                .inner
                .ctx
                .store
                .update_device_status(id, DeviceStatus::Disabled)
                .await
            {
                warn!("Status update err dev{}: {}", id, e);
            }
        }

        let mut ids: Vec<i64> = wanted.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let Some(device) = wanted.remove(&id) else {
                continue;
            };
            let existing = self.inner.pollers.get(&id).map(|h| Arc::clone(&h.poller));
            match existing {
                None => {
                    self.start_poller(device, 0, Duration::ZERO);
                    report.added.push(id);
                },
                Some(poller) => {
                    let current = poller.device();
                    if current.same_polling_config(&device) {
                        poller.state.lock().device = device;
                        continue;
                    }
                    let (errors, backoff) = {
                        let state = poller.state.lock();
                        (state.consecutive_errors, state.backoff)
                    };
                    self.stop_poller(id).await;
                    info!("Device {} reconfigured, restarting poller", id);
                    self.start_poller(device, errors, backoff);
                    report.reconfigured.push(id);
                },
            }
        }

        if !report.is_empty() {
            debug!(
                "Device refresh: +{} -{} ~{}",
                report.added.len(),
                report.removed.len(),
                report.reconfigured.len()
            );
        }
        Ok(report)
    }

    /// Reset the device's backoff and poll it now
    pub async fn force_poll(&self, device_id: i64) -> FieldResult<PollOutcome> {
        let poller = self
            .inner
            .pollers
            .get(&device_id)
            .map(|h| Arc::clone(&h.poller))
            .ok_or_else(|| FieldError::not_found(format!("polled device {}", device_id)))?;

        poller.state.lock().backoff = Duration::ZERO;
        info!("Force poll of device {}", device_id);
        match poll_device(&self.inner.ctx, &poller).await {
            PollOutcome::Skipped => Err(FieldError::ResourceBusy(format!(
                "device {} poll already in progress",
                device_id
            ))),
            outcome => {
                poller.rearm.notify_one();
                Ok(outcome)
            },
        }
    }

    /// Polling state of every active device, ordered by id
    pub fn device_states(&self) -> Vec<DeviceStateInfo> {
        let config = &self.inner.ctx.config;
        let mut states: Vec<DeviceStateInfo> = self
            .inner
            .pollers
            .iter()
            .map(|entry| entry.value().poller.info(config))
            .collect();
        states.sort_by_key(|s| s.device_id);
        states
    }

    pub fn device_state(&self, device_id: i64) -> Option<DeviceStateInfo> {
        self.inner
            .pollers
            .get(&device_id)
            .map(|h| h.poller.info(&self.inner.ctx.config))
    }

    pub fn len(&self) -> usize {
        self.inner.pollers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.pollers.is_empty()
    }

    fn start_poller(&self, device: Device, consecutive_errors: u32, backoff: Duration) {
        let id = device.id;
        debug!(
            "Starting poller for device {} ({}, {:?})",
            id,
            device.endpoint(),
            self.inner.ctx.config.configured_interval(&device)
        );
        let poller = Arc::new(DevicePoller::new(device, consecutive_errors, backoff));
        let cancel = self.inner.shutdown.child_token();
        let task = tokio::spawn(run_device(
            Arc::clone(&self.inner.ctx),
            Arc::clone(&poller),
            cancel.clone(),
        ));
        self.inner.pollers.insert(
            id,
            PollerHandle {
                poller,
                cancel,
                task,
            },
        );
    }

    async fn stop_poller(&self, device_id: i64) -> Option<Arc<DevicePoller>> {
        let (_, handle) = self.inner.pollers.remove(&device_id)?;
        handle.cancel.cancel();
        let _ = handle.task.await;
        Some(handle.poller)
    }
}

fn spawn_refresh_loop(
    service: Weak<PollingInner>,
    shutdown: CancellationToken,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(inner) = service.upgrade() else { break };
                    let service = PollingService { inner };
                    if let Err(e) = service.refresh().await {
                        error!("Device refresh err: {}", e);
                    }
                }
            }
        }
        debug!("Device refresh loop stopped");
    })
}

async fn run_device(ctx: Arc<PollContext>, poller: Arc<DevicePoller>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = poll_device(&ctx, &poller) => {},
        }

        // A forced poll restarts the wait with the state it left behind
        loop {
            let delay = poller.next_delay(&ctx.config);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = poller.rearm.notified() => continue,
                _ = tokio::time::sleep(delay) => break,
            }
        }
    }
}

fn device_key(device: &Device) -> ConnectionKey {
    ConnectionKey::new(device.host.clone(), device.port, device.unit_id)
}

async fn poll_device(ctx: &PollContext, poller: &DevicePoller) -> PollOutcome {
    let Some(_busy) = BusyGuard::acquire(&poller.busy) else {
        debug!("Poll still in flight, tick skipped");
        return PollOutcome::Skipped;
    };

    let device = poller.device();
    let key = device_key(&device);
    let started = Utc::now();

    let polled: Vec<&RegisterMapping> = device.mappings.iter().filter(|m| m.is_polled()).collect();
    if polled.is_empty() {
        return match probe(ctx, &key).await {
            Ok(()) => {
                mark_online(ctx, poller, &device, started).await;
                ctx.publisher.publish(FieldEvent::new(EventPayload::DeviceStatus {
                    device_id: device.id,
                    status: DeviceStatus::Online,
                }));
                PollOutcome::Reachable
            },
            Err(e) => record_failure(ctx, poller, &device, e, started).await,
        };
    }

    let mut readings = Vec::with_capacity(polled.len());
    let mut relays = BTreeMap::new();
    let mut failed = 0;
    let mut last_error = None;
    for mapping in polled {
        match read_mapping(ctx, &key, &device, mapping).await {
            Ok(reading) => {
                if mapping.is_relay_channel() {
                    if let Some(channel) = relay_channel_of(&device, mapping) {
                        relays.insert(channel, reading.value.as_f64() != 0.0);
                    }
                }
                readings.push(reading);
            },
            Err(e) => {
                warn!("Device {} mapping '{}' read err: {}", device.id, mapping.name, e);
                failed += 1;
                last_error = Some(e);
            },
        }
    }

    if readings.is_empty() {
        let error = last_error
            .unwrap_or_else(|| FieldError::Internal("no mapping was read".to_string()));
        return record_failure(ctx, poller, &device, error, started).await;
    }

    let snapshot = LastReading {
        updated_at: Some(started),
        ..LastReading::from_readings(&readings, relays)
    };
    if let Err(e) = ctx.store.save_last_reading(device.id, &snapshot).await {
        warn!("Save reading err dev{}: {}", device.id, e);
    }
    if let Err(e) = ctx.store.append_readings(device.id, &readings, started).await {
        warn!("History append err dev{}: {}", device.id, e);
    }
    mark_online(ctx, poller, &device, started).await;

    debug!("Device {} polled: {} values", device.id, readings.len());
    let count = readings.len();
    ctx.publisher.publish(FieldEvent::new(EventPayload::DeviceReading {
        device_id: device.id,
        status: DeviceStatus::Online,
        readings,
    }));
    PollOutcome::Online {
        readings: count,
        failed_mappings: failed,
    }
}

/// 1-based relay channel of a coil mapping
fn relay_channel_of(device: &Device, mapping: &RegisterMapping) -> Option<u16> {
    device
        .relay_mappings()
        .position(|m| m.name == mapping.name && m.address == mapping.address)
        .map(|index| index as u16 + 1)
}

async fn probe(ctx: &PollContext, key: &ConnectionKey) -> FieldResult<()> {
    let request = Request::read(FunctionCode::ReadHoldingRegisters, ctx.config.probe_address, 1)?;
    ctx.pool.execute_with(key, request, ctx.config.request).await?;
    Ok(())
}

async fn read_mapping(
    ctx: &PollContext,
    key: &ConnectionKey,
    device: &Device,
    mapping: &RegisterMapping,
) -> FieldResult<Reading> {
    let function_code = mapping.function_code.read_counterpart();
    let request = Request::read(function_code, mapping.address, mapping.effective_quantity())?;
    let response = ctx.pool.execute_with(key, request, ctx.config.request).await?;

    let value = if function_code.is_bit() {
        decode_mapping_bits(&response.into_bits()?, mapping, device)?
    } else {
        decode_mapping(&response.into_words()?, mapping, device)?
    };
    Ok(Reading {
        name: mapping.name.clone(),
        value,
        unit: mapping.unit.clone(),
    })
}

async fn mark_online(ctx: &PollContext, poller: &DevicePoller, device: &Device, at: DateTime<Utc>) {
    let previous = {
        let mut state = poller.state.lock();
        let previous = (state.status, state.consecutive_errors);
        state.consecutive_errors = 0;
        state.backoff = Duration::ZERO;
        state.last_poll = Some(at);
        state.status = DeviceStatus::Online;
        previous
    };
    if previous.0 != DeviceStatus::Online {
        if previous.1 > 0 {
            info!("Device {} back online after {} errors", device.id, previous.1);
        } else {
            info!("Device {} online ({})", device.id, device.endpoint());
        }
    }
    if let Err(e) = ctx
        .store
        .update_device_status(device.id, DeviceStatus::Online)
        .await
    {
        warn!("Status update err dev{}: {}", device.id, e);
    }
}

async fn record_failure(
    ctx: &PollContext,
    poller: &DevicePoller,
    device: &Device,
    error: FieldError,
    at: DateTime<Utc>,
) -> PollOutcome {
    let (consecutive_errors, status, backoff) = {
        let mut state = poller.state.lock();
        state.consecutive_errors = state.consecutive_errors.saturating_add(1);
        state.backoff = ctx.config.backoff.delay_for(state.consecutive_errors);
        state.status = DeviceStatus::for_error_count(state.consecutive_errors);
        state.last_poll = Some(at);
        (state.consecutive_errors, state.status, state.backoff)
    };
    warn!(
        "Device {} poll failed ({} in a row, next in {:?}): {}",
        device.id,
        consecutive_errors,
        ctx.config.configured_interval(device).max(backoff),
        error
    );

    if let Err(e) = ctx.store.update_device_status(device.id, status).await {
        warn!("Status update err dev{}: {}", device.id, e);
    }
    let record = DeviceErrorRecord {
        device_id: device.id,
        error_code: error.error_code().to_string(),
        message: error.to_string(),
        consecutive_errors,
        occurred_at: at,
    };
    if let Err(e) = ctx.store.log_device_error(&record).await {
        warn!("Error log err dev{}: {}", device.id, e);
    }

    ctx.publisher.publish(FieldEvent::new(EventPayload::DeviceError {
        device_id: device.id,
        status,
        consecutive_errors,
        error: error.to_string(),
    }));
    PollOutcome::Failed {
        consecutive_errors,
        status,
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use field_model::DataType;

    fn device(interval_ms: u64) -> Device {
        Device {
            poll_interval_ms: interval_ms,
            ..Device::new(1, "meter", "10.0.0.5", 502, 1)
        }
    }

    #[test]
    fn test_configured_interval_is_clamped() {
        let config = PollingConfig::default();
        assert_eq!(config.configured_interval(&device(20)), Duration::from_millis(100));
        assert_eq!(config.configured_interval(&device(90_000)), Duration::from_secs(60));
        assert_eq!(config.configured_interval(&device(0)), Duration::from_millis(1000));
        assert_eq!(config.configured_interval(&device(2500)), Duration::from_millis(2500));
    }

    #[test]
    fn test_effective_interval_follows_backoff() {
        let config = PollingConfig::default();
        let dev = device(5000);

        assert_eq!(config.effective_interval(&dev, 0), Duration::from_millis(5000));
        for n in 1..=12u32 {
            let backoff = Duration::from_millis((1000u64 << (n - 1)).min(60_000));
            assert_eq!(
                config.effective_interval(&dev, n),
                Duration::from_millis(5000).max(backoff),
                "errors = {}",
                n
            );
        }
    }

    #[test]
    fn test_busy_guard_is_exclusive() {
        let flag = AtomicBool::new(false);
        let guard = BusyGuard::acquire(&flag).unwrap();
        assert!(BusyGuard::acquire(&flag).is_none());
        drop(guard);
        assert!(!flag.load(Ordering::SeqCst));
        assert!(BusyGuard::acquire(&flag).is_some());
    }

    #[test]
    fn test_relay_channel_numbering() {
        let dev = Device::new(2, "board", "h", 502, 1).with_mappings(vec![
            RegisterMapping::new("temp", 0, FunctionCode::ReadInputRegisters, DataType::Int16),
            RegisterMapping::new("pump", 8, FunctionCode::ReadCoils, DataType::Boolean),
            RegisterMapping::new("fan", 9, FunctionCode::ReadCoils, DataType::Boolean),
        ]);
        assert_eq!(relay_channel_of(&dev, &dev.mappings[1]), Some(1));
        assert_eq!(relay_channel_of(&dev, &dev.mappings[2]), Some(2));
        assert_eq!(relay_channel_of(&dev, &dev.mappings[0]), None);
    }
}
