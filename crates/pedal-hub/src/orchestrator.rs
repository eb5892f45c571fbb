//! # Orchestrator
//!
//! Top-level state machine. Owns every engine component and is the only
//! thing that mutates them.
//!
//! ## Modes
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │            ┌──────┐  no credentials   ┌───────────────┐                 │
//! │            │ Boot │──────────────────►│ Configuration │◄──────────┐     │
//! │            └──┬───┘                   └───────┬───────┘           │     │
//! │               │ credentials                   │ complete_         │     │
//! │               ▼                               │ configuration     │     │
//! │          ┌─────────┐◄───────────────────────────┘                 │     │
//! │          │ Serving │                                    fallback  │     │
//! │          └┬───▲──┬─┘                               (SyncMonitor)  │     │
//! │   trigger │   │  │ idle                                           │     │
//! │           ▼   │  ▼                                                │     │
//! │   ┌───────────┴┐ ┌──────────┐                                     │     │
//! │   │ CloudSync  │ │ Shutdown │ (low-power cycle, timer or wake)    │     │
//! │   └─────┬──────┘ └──────────┘                                     │     │
//! │         └─────────────────────────────────────────────────────────┘     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Sync Cycle
//! ```text
//!   probe (connect) ─► time sync ─► GET registry ─► GET configs
//!     ─► PATCH buffer (confirm | rollback) ─► PUT heartbeat ─► PUT registry
//! ```
//! Every step runs under `tokio::time::timeout`. The first failure ends the
//! cycle and counts once against the [`SyncMonitor`].
//!
//! ## Hub Log Entries
//! Failed cycles, fallbacks and refused units are queued in the offline
//! buffer as `log` entries. A heartbeat the cloud did not take is queued as
//! a `heartbeat` entry. Both go up with the next buffer upload.
//!
//! ## Control
//! The main loop selects over wireless events, [`HubCommand`]s from
//! [`HubHandle`]s and a periodic tick. [`HubStatus`] is published through a
//! `watch` channel after every step.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use pedal_core::{EntryKind, Timestamp};
use pedal_db::repository::state::KEY_LAST_SUCCESSFUL_SYNC;
use pedal_db::{Database, HubStateRepository};

use crate::cloud::{CloudApi, HubHeartbeat};
use crate::config::{ConfigurationUpdate, HubConfig};
use crate::config_store::ConfigStore;
use crate::error::{HubError, HubResult};
use crate::multiplexer::{ServingContext, SessionMultiplexer};
use crate::offline_buffer::{EventHistory, OfflineBuffer};
use crate::registry::Registry;
use crate::sync_monitor::{SyncMonitor, SyncTrigger};
use crate::time_base::TimeBase;
use crate::wireless::{WirelessEvent, WirelessLink};

/// Capacity of the command channel behind a [`HubHandle`].
const COMMAND_CHANNEL_CAPACITY: usize = 16;

// =============================================================================
// Modes, Status, Commands
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HubMode {
    Boot,
    Configuration,
    Serving,
    CloudSync,
    Shutdown,
}

impl std::fmt::Display for HubMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HubMode::Boot => "boot",
            HubMode::Configuration => "configuration",
            HubMode::Serving => "serving",
            HubMode::CloudSync => "cloud_sync",
            HubMode::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Snapshot published after every loop step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HubStatus {
    pub mode: HubMode,
    pub active_unit: Option<String>,
    pub queue_len: usize,
    pub connected_count: usize,
    pub known_units: usize,
    pub buffer_len: usize,
    pub buffer_occupancy: f64,
    pub sync_failures: u32,
    pub time_synced: bool,
    pub last_sync_ok: Option<bool>,
    /// Hub clock at the end of the last fully successful cycle.
    pub last_sync_at: Option<Timestamp>,
    pub last_trigger: Option<SyncTrigger>,
}

impl HubStatus {
    fn initial() -> Self {
        HubStatus {
            mode: HubMode::Boot,
            active_unit: None,
            queue_len: 0,
            connected_count: 0,
            known_units: 0,
            buffer_len: 0,
            buffer_occupancy: 0.0,
            sync_failures: 0,
            time_synced: false,
            last_sync_ok: None,
            last_sync_at: None,
            last_trigger: None,
        }
    }
}

/// Requests sent to a running orchestrator.
#[derive(Debug)]
pub enum HubCommand {
    /// Submission from the local configuration surface.
    CompleteConfiguration {
        update: ConfigurationUpdate,
        reply: oneshot::Sender<HubResult<()>>,
    },
    ForceSync,
    /// External wake signal (button press).
    Wake,
    Shutdown,
}

/// Cloneable control handle for a running [`Orchestrator`].
#[derive(Debug, Clone)]
pub struct HubHandle {
    cmd_tx: mpsc::Sender<HubCommand>,
    status_rx: watch::Receiver<HubStatus>,
}

impl HubHandle {
    /// Applies new credentials and returns to serving mode.
    pub async fn complete_configuration(&self, update: ConfigurationUpdate) -> HubResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::CompleteConfiguration { update, reply })
            .await?;
        rx.await
            .map_err(|_| HubError::ChannelError("Hub stopped before replying".into()))?
    }

    pub async fn force_sync(&self) -> HubResult<()> {
        self.send(HubCommand::ForceSync).await
    }

    pub async fn wake(&self) -> HubResult<()> {
        self.send(HubCommand::Wake).await
    }

    pub async fn shutdown(&self) -> HubResult<()> {
        self.send(HubCommand::Shutdown).await
    }

    pub fn status(&self) -> HubStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<HubStatus> {
        self.status_rx.clone()
    }

    async fn send(&self, command: HubCommand) -> HubResult<()> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| HubError::ChannelError("Hub command channel closed".into()))
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct Orchestrator {
    config: HubConfig,
    config_path: Option<PathBuf>,
    mode: HubMode,

    time: TimeBase,
    registry: Registry,
    configs: ConfigStore,
    buffer: OfflineBuffer,
    history: EventHistory,
    monitor: SyncMonitor,
    mux: SessionMultiplexer,

    cloud: Box<dyn CloudApi>,
    link: Arc<dyn WirelessLink>,
    state: HubStateRepository,

    status_tx: watch::Sender<HubStatus>,
    pending_trigger: Option<SyncTrigger>,
    last_trigger: Option<SyncTrigger>,
    last_failure_at: Option<Instant>,
    last_activity: Instant,
    last_sync_ok: Option<bool>,
    last_sync_at: Option<Timestamp>,
}

impl Orchestrator {
    /// Loads durable state and picks the first mode.
    pub async fn boot(
        config: HubConfig,
        config_path: Option<PathBuf>,
        db: &Database,
        cloud: Box<dyn CloudApi>,
        link: Arc<dyn WirelessLink>,
    ) -> HubResult<Self> {
        config.validate()?;
        info!(hub_id = %config.hub_id(), name = %config.hub.name, "Hub booting");

        let registry = Registry::load(db.registry()).await?;
        let configs = ConfigStore::load(db.configs(), config.config_validity()).await?;
        let buffer = OfflineBuffer::load(&config.buffer, db.buffer()).await?;
        let state = db.state();

        let last_sync_at = match state.get_timestamp(KEY_LAST_SUCCESSFUL_SYNC).await {
            Ok(at) => at,
            Err(e) => {
                warn!(error = %e, "Could not read last sync time");
                None
            }
        };

        let (status_tx, _) = watch::channel(HubStatus::initial());

        let mut orchestrator = Orchestrator {
            time: TimeBase::new(config.time.plausibility_floor),
            history: EventHistory::new(config.buffer.history_capacity),
            monitor: SyncMonitor::new(config.sync.max_failures, config.fallback_timeout()),
            mux: SessionMultiplexer::new(config.active_timeout()),
            mode: HubMode::Boot,
            registry,
            configs,
            buffer,
            cloud,
            link,
            state,
            status_tx,
            config_path,
            pending_trigger: None,
            last_trigger: None,
            last_failure_at: None,
            last_activity: Instant::now(),
            last_sync_ok: None,
            last_sync_at,
            config,
        };

        if orchestrator.config.has_credentials() {
            orchestrator.enter_serving();
        } else {
            info!("No wide-area credentials configured");
            orchestrator.enter_configuration("missing credentials");
        }
        orchestrator.publish_status();

        Ok(orchestrator)
    }

    /// Creates a control handle and the command receiver for [`Self::run`].
    pub fn handle(&self) -> (HubHandle, mpsc::Receiver<HubCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let handle = HubHandle {
            cmd_tx,
            status_rx: self.status_tx.subscribe(),
        };
        (handle, cmd_rx)
    }

    // =========================================================================
    // Main Loop
    // =========================================================================

    /// Runs until a shutdown command arrives or the command channel closes.
    pub async fn run(
        &mut self,
        mut events: mpsc::Receiver<WirelessEvent>,
        mut commands: mpsc::Receiver<HubCommand>,
    ) {
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(mode = %self.mode, "Hub main loop started");

        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    self.handle_event(event).await;
                }
                command = commands.recv() => {
                    let Some(command) = command else {
                        info!("Command channel closed");
                        break;
                    };
                    if self.handle_command(command).await {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.tick().await;

                    if self.should_sleep(Instant::now()) {
                        let sleep = self.config.sleep_duration();
                        match self.enter_low_power(sleep, commands.recv()).await {
                            Some(Some(command)) => {
                                if self.handle_command(command).await {
                                    break;
                                }
                            }
                            Some(None) => break,
                            None => {}
                        }
                    }
                }
            }
        }

        self.shutdown().await;
        info!("Hub main loop stopped");
    }

    /// Returns true when the loop should stop.
    async fn handle_command(&mut self, command: HubCommand) -> bool {
        match command {
            HubCommand::CompleteConfiguration { update, reply } => {
                let result = self.complete_configuration(update).await;
                if let Err(e) = &result {
                    if e.is_config_error() {
                        warn!(error = %e, "Configuration submission rejected");
                    } else {
                        debug!(error = %e, "Configuration submission not applied");
                    }
                }
                if reply.send(result).is_err() {
                    debug!("Configuration requester went away");
                }
            }
            HubCommand::ForceSync => {
                if self.mode == HubMode::Serving {
                    self.run_sync_cycle(SyncTrigger::Forced).await;
                } else {
                    info!(mode = %self.mode, "Forced sync ignored");
                }
            }
            HubCommand::Wake => debug!("Wake signal while awake"),
            HubCommand::Shutdown => {
                info!("Shutdown requested");
                return true;
            }
        }
        false
    }

    // =========================================================================
    // Wireless Events
    // =========================================================================

    pub async fn handle_event(&mut self, event: WirelessEvent) {
        if self.mode != HubMode::Serving {
            debug!(mode = %self.mode, handle = event.handle(), "Wireless event ignored");
            return;
        }
        self.last_activity = Instant::now();

        let (mux, mut ctx) = self.split();
        match event {
            WirelessEvent::Connected { handle } => mux.on_connect(handle),
            WirelessEvent::Disconnected { handle } => mux.on_disconnect(handle, &mut ctx),
            WirelessEvent::Write {
                handle,
                channel,
                payload,
            } => {
                let outcome = mux.on_write(handle, channel, &payload, &mut ctx).await;
                debug!(handle, %channel, ?outcome, "Write processed");
            }
        }

        if let Some(trigger) = self.mux.take_sync_request() {
            self.pending_trigger.get_or_insert(trigger);
        }
        self.publish_status();
    }

    fn split(&mut self) -> (&mut SessionMultiplexer, ServingContext<'_>) {
        (
            &mut self.mux,
            ServingContext {
                registry: &mut self.registry,
                configs: &mut self.configs,
                buffer: &mut self.buffer,
                history: &mut self.history,
                time: &self.time,
                link: self.link.as_ref(),
            },
        )
    }

    // =========================================================================
    // Periodic Work
    // =========================================================================

    /// Session timeout, fallback check and sync scheduling.
    pub async fn tick(&mut self) {
        let now = Instant::now();
        self.mux.tick(now, self.link.as_ref());

        if self.mode != HubMode::Configuration && self.monitor.should_fallback(now) {
            self.fall_back().await;
            self.publish_status();
            return;
        }

        if self.mode == HubMode::Serving {
            if let Some(trigger) = self.poll_sync(now) {
                self.run_sync_cycle(trigger).await;
            }
        }
        self.publish_status();
    }

    /// Decides whether a sync cycle is due. Triggers are held back for
    /// `retry_interval` after a failed cycle.
    pub fn poll_sync(&mut self, now: Instant) -> Option<SyncTrigger> {
        if let Some(failed_at) = self.last_failure_at {
            if now.saturating_duration_since(failed_at) < self.config.retry_interval() {
                return None;
            }
        }

        if let Some(trigger) = self.pending_trigger.take() {
            return Some(trigger);
        }
        if self.buffer.is_critically_full() {
            return Some(SyncTrigger::BufferFull);
        }
        if self.buffer.needs_sync(now) {
            return Some(SyncTrigger::BufferThreshold);
        }
        if self.configs.needs_refresh(now) {
            return Some(SyncTrigger::ConfigExpired);
        }
        None
    }

    fn should_sleep(&self, now: Instant) -> bool {
        self.config.power.low_power_enabled
            && self.mode == HubMode::Serving
            && self.mux.session_count() == 0
            && now.saturating_duration_since(self.last_activity) > self.config.idle_threshold()
    }

    // =========================================================================
    // Cloud Sync
    // =========================================================================

    /// Runs one sync cycle. Returns true when every step succeeded.
    pub async fn run_sync_cycle(&mut self, trigger: SyncTrigger) -> bool {
        if self.mode != HubMode::Serving {
            debug!(mode = %self.mode, %trigger, "Sync cycle skipped");
            return false;
        }

        info!(%trigger, buffered = self.buffer.len(), "Starting sync cycle");
        self.last_trigger = Some(trigger);
        self.set_mode(HubMode::CloudSync);
        self.publish_status();

        let result = self.sync_steps().await;
        let now = Instant::now();

        let ok = match result {
            Ok(()) => {
                self.monitor.record_success();
                self.last_failure_at = None;
                let at = self.time.now();
                self.last_sync_at = Some(at);
                if let Err(e) = self.state.set_timestamp(KEY_LAST_SUCCESSFUL_SYNC, at).await {
                    warn!(error = %e, "Failed to store last sync time");
                }
                info!(remaining = self.buffer.len(), "Sync cycle complete");
                true
            }
            Err(e) => {
                warn!(error = %e, retryable = e.is_retryable(), "Sync cycle aborted");
                self.monitor.record_failure(now);
                self.last_failure_at = Some(now);
                let detail = json!({
                    "trigger": trigger,
                    "error": e.to_string(),
                    "retryable": e.is_retryable(),
                    "failures": self.monitor.window().count,
                });
                self.buffer_log("sync_failed", detail).await;
                false
            }
        };
        self.last_sync_ok = Some(ok);

        self.set_mode(HubMode::Serving);
        if self.monitor.should_fallback(now) {
            self.fall_back().await;
        }
        self.publish_status();
        ok
    }

    async fn sync_steps(&mut self) -> HubResult<()> {
        let connect_limit = self.config.cloud.connect_timeout();
        let step_limit = self.config.cloud.request_timeout();

        if let Some(epoch) = bounded(connect_limit, self.cloud.probe()).await? {
            self.time.sync(epoch);
        }

        let registry = bounded(step_limit, self.cloud.fetch_registry()).await?;
        let now = self.time.now();
        self.registry.merge_from_cloud(registry, now).await;

        let configs = bounded(step_limit, self.cloud.fetch_configs()).await?;
        let changed = self.configs.ingest_cloud_configs(configs, now).await;
        if changed > 0 {
            info!(changed, "Config updates pending delivery");
        }

        let batch = self.buffer.drain_for_upload();
        if batch.is_empty() {
            self.buffer.confirm(&batch).await;
        } else {
            match bounded(step_limit, self.cloud.upload_buffer(&batch)).await {
                Ok(()) => self.buffer.confirm(&batch).await,
                Err(e) => {
                    self.buffer.rollback(&batch);
                    return Err(e);
                }
            }
        }

        let heartbeat = HubHeartbeat {
            hub_id: self.config.hub_id().to_string(),
            timestamp: self.time.now(),
            connected_count: self.mux.connected_units().len(),
            free_memory: self.buffer.free_slots(),
            uptime: self.time.uptime().as_secs(),
        };
        if let Err(e) = bounded(step_limit, self.cloud.upload_heartbeat(&heartbeat)).await {
            self.buffer_heartbeat(&heartbeat).await;
            return Err(e);
        }

        let dirty = self.registry.dirty_records();
        if !dirty.is_empty() {
            bounded(step_limit, self.cloud.upload_registry(&dirty)).await?;
            self.registry.clear_dirty(dirty.iter().map(|r| &r.id));
            debug!(records = dirty.len(), "Registry changes uploaded");
        }

        Ok(())
    }

    async fn buffer_heartbeat(&mut self, heartbeat: &HubHeartbeat) {
        let payload = match serde_json::to_string(heartbeat) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode heartbeat");
                return;
            }
        };
        let origin = self.config.hub_id().to_string();
        if self
            .buffer
            .enqueue(EntryKind::Heartbeat, &origin, payload, heartbeat.timestamp)
            .await
        {
            debug!("Heartbeat queued for the next upload");
        }
    }

    /// Queues a hub log event for upload.
    async fn buffer_log(&mut self, event: &str, detail: Value) {
        let at = self.time.now();
        let mut document = json!({
            "event": event,
            "hub_id": self.config.hub_id(),
            "timestamp": at,
        });
        if let (Some(doc), Value::Object(extra)) = (document.as_object_mut(), detail) {
            doc.extend(extra);
        }

        let origin = self.config.hub_id().to_string();
        self.buffer
            .enqueue(EntryKind::Log, &origin, document.to_string(), at)
            .await;
    }

    // =========================================================================
    // Mode Transitions
    // =========================================================================

    fn set_mode(&mut self, mode: HubMode) {
        if self.mode != mode {
            debug!(from = %self.mode, to = %mode, "Mode change");
            self.mode = mode;
        }
    }

    fn enter_serving(&mut self) {
        self.set_mode(HubMode::Serving);
        self.last_activity = Instant::now();
        if let Err(e) = self.link.set_advertising(true) {
            warn!(error = %e, "Failed to start advertising");
        }
        info!("Serving field units");
    }

    async fn fall_back(&mut self) {
        let failures = self.monitor.window().count;
        self.buffer_log(
            "fallback",
            json!({ "reason": "sync failure limit reached", "failures": failures }),
        )
        .await;
        self.enter_configuration("sync failure limit reached");
    }

    fn enter_configuration(&mut self, reason: &str) {
        warn!(reason, "Entering configuration mode");
        self.mux.reset();
        if let Err(e) = self.link.set_advertising(false) {
            warn!(error = %e, "Failed to stop advertising");
        }
        self.set_mode(HubMode::Configuration);
    }

    /// Applies a configuration-surface submission.
    ///
    /// ## Errors
    /// - [`HubError::InvalidState`] outside configuration mode
    /// - validation and credential errors from [`HubConfig::with_update`]
    pub async fn complete_configuration(&mut self, update: ConfigurationUpdate) -> HubResult<()> {
        if self.mode != HubMode::Configuration {
            return Err(HubError::InvalidState(format!(
                "configuration can only be completed in configuration mode (now {})",
                self.mode
            )));
        }

        let next = self.config.with_update(&update)?;
        self.cloud.configure(&next.cloud)?;
        if let Err(e) = next.save(self.config_path.clone()) {
            warn!(error = %e, "Failed to save hub config, continuing with it in memory");
        }
        self.config = next;

        self.monitor.reset();
        self.last_failure_at = None;
        self.enter_serving();
        self.publish_status();
        Ok(())
    }

    /// Sleeps with the radio off until `duration` elapses or `wake`
    /// completes, then resumes serving. Returns the wake output if it
    /// fired first.
    pub async fn enter_low_power<F>(&mut self, duration: Duration, wake: F) -> Option<F::Output>
    where
        F: Future,
    {
        if self.mode != HubMode::Serving {
            return None;
        }

        info!(secs = duration.as_secs(), "Entering low-power cycle");
        self.buffer.persist().await;
        self.mux.reset();
        if let Err(e) = self.link.set_advertising(false) {
            warn!(error = %e, "Failed to stop advertising");
        }
        self.set_mode(HubMode::Shutdown);
        self.publish_status();

        let woke = tokio::select! {
            _ = tokio::time::sleep(duration) => None,
            output = wake => Some(output),
        };

        info!(early = woke.is_some(), "Low-power cycle ended");
        self.enter_serving();
        self.publish_status();
        woke
    }

    /// Stops serving and writes the buffer snapshot.
    pub async fn shutdown(&mut self) {
        self.mux.reset();
        if let Err(e) = self.link.set_advertising(false) {
            warn!(error = %e, "Failed to stop advertising");
        }
        if !self.buffer.persist().await {
            warn!(entries = self.buffer.len(), "Buffer not persisted at shutdown");
        }
        self.set_mode(HubMode::Shutdown);
        self.publish_status();
        info!("Hub shut down");
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    fn publish_status(&self) {
        self.status_tx.send_replace(self.status());
    }

    pub fn status(&self) -> HubStatus {
        HubStatus {
            mode: self.mode,
            active_unit: self.mux.active().map(|slot| slot.unit.to_string()),
            queue_len: self.mux.queue().len(),
            connected_count: self.mux.connected_units().len(),
            known_units: self.registry.len(),
            buffer_len: self.buffer.len(),
            buffer_occupancy: self.buffer.occupancy(),
            sync_failures: self.monitor.window().count,
            time_synced: self.time.is_synced(),
            last_sync_ok: self.last_sync_ok,
            last_sync_at: self.last_sync_at,
            last_trigger: self.last_trigger,
        }
    }

    pub fn mode(&self) -> HubMode {
        self.mode
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn configs(&self) -> &ConfigStore {
        &self.configs
    }

    pub fn buffer(&self) -> &OfflineBuffer {
        &self.buffer
    }

    pub fn history(&self) -> &EventHistory {
        &self.history
    }
}

async fn bounded<T, F>(limit: Duration, step: F) -> HubResult<T>
where
    F: Future<Output = HubResult<T>>,
{
    tokio::time::timeout(limit, step)
        .await
        .map_err(|_| HubError::Timeout(limit.as_secs()))?
}
