//! # Session Multiplexer
//!
//! Many units may be connected at once, but only one is serviced at a time.
//!
//! ## Active Slot Discipline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   telemetry from X                                                      │
//! │        │                                                                │
//! │        ├── no active unit ────► X becomes active, process              │
//! │        ├── active == X ───────► process                                │
//! │        └── active == Y ───────► X appended to queue (once), dropped    │
//! │                                                                         │
//! │   active older than timeout, or active disconnects                     │
//! │        │                                                                │
//! │        ▼                                                                │
//! │   finish_current()                                                      │
//! │        active = None                                                    │
//! │        pop queue until a connected unit is found                        │
//! │        └──► activate it, send {"type":"data_request"} on its own       │
//! │             connection                                                  │
//! │                                                                         │
//! │   Invariants: at most one active unit, the active unit is never        │
//! │   queued, the queue holds no duplicates.                                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Attribution
//! A new connection is anonymous until its first valid message. That
//! message's `bike_id` is checked with [`Registry::can_connect`]; refused
//! units are disconnected. A pending config update is pushed right after
//! attribution. Later messages claiming a different identity are dropped.
//! A unit owns at most one session: attributing it on a new handle drops
//! any older session still bound to it, so the newest link wins.
//!
//! ## Alerts
//! Alerts are the one data message outside the active slot. An alert from
//! an allowed unit is buffered and raises a critical sync request whether
//! or not that unit holds the slot, and it does not queue the unit.

use std::collections::{HashMap, VecDeque};

use serde_json::json;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use pedal_core::validation::validate_battery_pct;
use pedal_core::{EntryKind, FieldUnitId, UnitStatus};

use crate::config_store::ConfigStore;
use crate::error::HubError;
use crate::offline_buffer::{EventHistory, HistoryKind, OfflineBuffer};
use crate::protocol::{Alert, Channel, HubMessage, Telemetry, UnitMessage};
use crate::registry::Registry;
use crate::sync_monitor::SyncTrigger;
use crate::time_base::TimeBase;
use crate::wireless::{ConnHandle, WirelessLink};

/// Components a wireless write may touch, borrowed from the orchestrator
/// for the duration of one event.
pub struct ServingContext<'a> {
    pub registry: &'a mut Registry,
    pub configs: &'a mut ConfigStore,
    pub buffer: &'a mut OfflineBuffer,
    pub history: &'a mut EventHistory,
    pub time: &'a TimeBase,
    pub link: &'a dyn WirelessLink,
}

/// The unit currently being serviced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSlot {
    pub unit: FieldUnitId,
    pub since: Instant,
}

/// What happened to one inbound write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Buffered.
    Accepted,
    /// Another unit holds the slot; the writer was queued.
    Deferred,
    /// Unit not yet allowed; counted as a visit.
    PendingUnit,
    /// Control message processed.
    Handled,
    /// Dropped without side effects.
    Ignored,
    /// Admission refused, connection closed.
    Rejected,
    /// Buffer had no room.
    BufferFull,
}

#[derive(Debug)]
pub struct SessionMultiplexer {
    sessions: HashMap<ConnHandle, Option<FieldUnitId>>,
    active: Option<ActiveSlot>,
    queue: VecDeque<FieldUnitId>,
    timeout: Duration,
    sync_request: Option<SyncTrigger>,
}

impl SessionMultiplexer {
    pub fn new(timeout: Duration) -> Self {
        SessionMultiplexer {
            sessions: HashMap::new(),
            active: None,
            queue: VecDeque::new(),
            timeout,
            sync_request: None,
        }
    }

    // =========================================================================
    // Connection Events
    // =========================================================================

    pub fn on_connect(&mut self, handle: ConnHandle) {
        if let Some(Some(previous)) = self.sessions.insert(handle, None) {
            debug!(handle, unit_id = %previous, "Connection handle reused");
        }
        debug!(handle, sessions = self.sessions.len(), "Unit connected");
    }

    pub fn on_disconnect(&mut self, handle: ConnHandle, ctx: &mut ServingContext<'_>) {
        let Some(session) = self.sessions.remove(&handle) else {
            debug!(handle, "Disconnect for unknown handle");
            return;
        };
        let Some(unit) = session else {
            return;
        };

        ctx.history
            .record(ctx.time.now(), Some(&unit), HistoryKind::Disconnected);

        if self.handle_of(&unit).is_some() {
            return;
        }

        self.queue.retain(|queued| queued != &unit);
        if self.active.as_ref().is_some_and(|slot| slot.unit == unit) {
            info!(unit_id = %unit, "Active unit disconnected");
            self.finish_current(ctx.link);
        }
    }

    pub async fn on_write(
        &mut self,
        handle: ConnHandle,
        channel: Channel,
        payload: &str,
        ctx: &mut ServingContext<'_>,
    ) -> WriteOutcome {
        let message = match UnitMessage::parse(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(handle, %channel, error = %e, "Dropping unparseable message");
                return WriteOutcome::Ignored;
            }
        };

        let unit = match self.sessions.get(&handle).cloned() {
            Some(Some(owner)) => {
                if owner.as_str() != message.bike_id() {
                    let e = HubError::IdentityMismatch {
                        expected: owner.to_string(),
                        actual: message.bike_id().to_string(),
                    };
                    warn!(handle, error = %e, "Dropping message");
                    return WriteOutcome::Ignored;
                }
                owner
            }
            session => {
                if session.is_none() {
                    debug!(handle, "Write on unannounced handle, opening session");
                }
                match self.attribute(handle, message.bike_id(), ctx).await {
                    Some(unit) => unit,
                    None => return WriteOutcome::Rejected,
                }
            }
        };

        debug!(handle, unit_id = %unit, kind = message.kind(), "Message received");

        match message {
            UnitMessage::Registration(registration) => {
                info!(
                    unit_id = %unit,
                    firmware = registration.version.as_deref().unwrap_or("unknown"),
                    "Unit registered"
                );
                WriteOutcome::Handled
            }
            UnitMessage::ConfigRequest(_) => {
                self.push_config(handle, &unit, ctx).await;
                WriteOutcome::Handled
            }
            UnitMessage::ConfigReceived(received) => {
                ctx.configs
                    .record_confirmation(&unit, &received.status, received.version);
                WriteOutcome::Handled
            }
            UnitMessage::Alert(alert) => self.handle_alert(&unit, alert, ctx).await,
            UnitMessage::Telemetry(telemetry) => {
                if channel != Channel::Data {
                    warn!(unit_id = %unit, %channel, "Telemetry on wrong channel dropped");
                    return WriteOutcome::Ignored;
                }
                self.handle_telemetry(unit, telemetry, ctx).await
            }
        }
    }

    /// Releases the active slot once it has been held longer than the
    /// session timeout.
    pub fn tick(&mut self, now: Instant, link: &dyn WirelessLink) {
        let expired = self
            .active
            .as_ref()
            .is_some_and(|slot| now.saturating_duration_since(slot.since) > self.timeout);
        if expired {
            self.finish_current(link);
        }
    }

    /// Ends the active session and hands the slot to the next connected
    /// unit in the queue.
    pub fn finish_current(&mut self, link: &dyn WirelessLink) {
        if let Some(slot) = self.active.take() {
            debug!(
                unit_id = %slot.unit,
                held_ms = slot.since.elapsed().as_millis() as u64,
                "Active session finished"
            );
        }

        while let Some(next) = self.queue.pop_front() {
            let Some(handle) = self.handle_of(&next) else {
                debug!(unit_id = %next, "Skipping queued unit that is gone");
                continue;
            };

            info!(unit_id = %next, waiting = self.queue.len(), "Activating queued unit");
            self.active = Some(ActiveSlot {
                unit: next.clone(),
                since: Instant::now(),
            });

            let request = HubMessage::DataRequest { bike_id: next };
            if let Err(e) = link.send(handle, request.channel(), &request) {
                warn!(handle, error = %e, "Failed to send data request");
            }
            return;
        }
    }

    /// Drops every session. Used on shutdown, fallback and sleep.
    pub fn reset(&mut self) {
        if !self.sessions.is_empty() || self.active.is_some() {
            info!(
                sessions = self.sessions.len(),
                queued = self.queue.len(),
                "Multiplexer reset"
            );
        }
        self.sessions.clear();
        self.active = None;
        self.queue.clear();
    }

    /// Sync trigger raised by the last writes, if any.
    pub fn take_sync_request(&mut self) -> Option<SyncTrigger> {
        self.sync_request.take()
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn active(&self) -> Option<&ActiveSlot> {
        self.active.as_ref()
    }

    pub fn queue(&self) -> &VecDeque<FieldUnitId> {
        &self.queue
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Distinct attributed units currently connected.
    pub fn connected_units(&self) -> Vec<FieldUnitId> {
        let mut units: Vec<FieldUnitId> = self.sessions.values().flatten().cloned().collect();
        units.sort();
        units.dedup();
        units
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn handle_of(&self, unit: &FieldUnitId) -> Option<ConnHandle> {
        self.sessions
            .iter()
            .filter(|(_, owner)| owner.as_ref() == Some(unit))
            .map(|(handle, _)| *handle)
            .min()
    }

    async fn attribute(
        &mut self,
        handle: ConnHandle,
        bike_id: &str,
        ctx: &mut ServingContext<'_>,
    ) -> Option<FieldUnitId> {
        let now = ctx.time.now();

        let admitted = ctx.registry.can_connect(bike_id, now).await;
        let unit = match FieldUnitId::parse(bike_id) {
            Ok(unit) if admitted => unit,
            Ok(unit) => {
                let status = ctx
                    .registry
                    .get(unit.as_str())
                    .map_or(UnitStatus::Blocked, |record| record.status);
                let reason = HubError::Refused {
                    unit_id: unit.to_string(),
                    status,
                };
                self.refuse(handle, bike_id, Some(&unit), reason, ctx).await;
                return None;
            }
            Err(e) => {
                self.refuse(handle, bike_id, None, HubError::from(e), ctx).await;
                return None;
            }
        };

        let before = self.sessions.len();
        self.sessions
            .retain(|other, owner| *other == handle || owner.as_ref() != Some(&unit));
        if self.sessions.len() < before {
            debug!(
                handle,
                unit_id = %unit,
                evicted = before - self.sessions.len(),
                "Dropped stale sessions of reconnecting unit"
            );
        }

        info!(handle, unit_id = %unit, "Session attributed");
        self.sessions.insert(handle, Some(unit.clone()));
        ctx.history.record(now, Some(&unit), HistoryKind::Connected);

        if ctx.configs.has_update(&unit) {
            self.push_config(handle, &unit, ctx).await;
        }
        Some(unit)
    }

    /// Closes a connection that failed admission and queues a hub log entry
    /// for the cloud.
    async fn refuse(
        &mut self,
        handle: ConnHandle,
        bike_id: &str,
        unit: Option<&FieldUnitId>,
        reason: HubError,
        ctx: &mut ServingContext<'_>,
    ) {
        let now = ctx.time.now();
        warn!(handle, unit_id = %bike_id, error = %reason, "Unit refused, disconnecting");
        ctx.history.record(now, unit, HistoryKind::Rejected);
        self.sessions.remove(&handle);
        if let Err(e) = ctx.link.disconnect(handle) {
            warn!(handle, error = %e, "Failed to disconnect refused unit");
        }

        let document = json!({
            "event": "unit_refused",
            "bike_id": bike_id,
            "reason": reason.to_string(),
            "timestamp": now,
        });
        ctx.buffer
            .enqueue(EntryKind::Log, bike_id, document.to_string(), now)
            .await;
    }

    async fn push_config(
        &mut self,
        handle: ConnHandle,
        unit: &FieldUnitId,
        ctx: &mut ServingContext<'_>,
    ) {
        let version = ctx.configs.get(unit).map_or(0, |r| r.version);
        let push = HubMessage::ConfigPush {
            target_bike: unit.clone(),
            timestamp: ctx.time.now(),
            config: ctx.configs.get_config(unit),
        };

        match ctx.link.send(handle, push.channel(), &push) {
            Ok(()) => info!(unit_id = %unit, version, "Config pushed"),
            Err(e) => warn!(unit_id = %unit, version, error = %e, "Config push failed"),
        }

        ctx.configs.mark_sent(unit).await;
        ctx.history
            .record(ctx.time.now(), Some(unit), HistoryKind::ConfigPushed { version });
    }

    async fn handle_telemetry(
        &mut self,
        unit: FieldUnitId,
        telemetry: Telemetry,
        ctx: &mut ServingContext<'_>,
    ) -> WriteOutcome {
        match &self.active {
            None => {
                debug!(unit_id = %unit, "Unit takes the active slot");
                self.active = Some(ActiveSlot {
                    unit: unit.clone(),
                    since: Instant::now(),
                });
            }
            Some(slot) if slot.unit == unit => {}
            Some(slot) => {
                if !self.queue.contains(&unit) {
                    info!(unit_id = %unit, active = %slot.unit, "Unit queued");
                    self.queue.push_back(unit);
                }
                return WriteOutcome::Deferred;
            }
        }

        let now = ctx.time.now();
        if !ctx.registry.is_allowed(unit.as_str()) {
            debug!(unit_id = %unit, "Dropping data from pending unit");
            ctx.registry.record_pending_visit(unit.as_str(), now).await;
            ctx.history.record(now, Some(&unit), HistoryKind::PendingVisit);
            self.finish_current(ctx.link);
            return WriteOutcome::PendingUnit;
        }

        let stamp = ctx.time.correct(telemetry.timestamp());

        match (telemetry.battery(), telemetry.fields.get("battery")) {
            (Some(raw), _) => match validate_battery_pct(raw) {
                Ok(pct) => {
                    ctx.registry
                        .update_heartbeat(
                            unit.as_str(),
                            pct,
                            telemetry.heap().unwrap_or(0),
                            stamp.value,
                        )
                        .await;
                    ctx.history
                        .record(now, Some(&unit), HistoryKind::Battery { pct });
                }
                Err(e) => warn!(unit_id = %unit, error = %e, "Ignoring battery reading"),
            },
            (None, Some(raw)) => warn!(unit_id = %unit, %raw, "Unusable battery reading"),
            (None, None) => {}
        }

        let document = telemetry.to_buffer_payload(stamp.value, stamp.corrected);
        self.buffer_entry(EntryKind::Telemetry, &unit, document.to_string(), stamp.value, ctx)
            .await
    }

    async fn handle_alert(
        &mut self,
        unit: &FieldUnitId,
        alert: Alert,
        ctx: &mut ServingContext<'_>,
    ) -> WriteOutcome {
        let now = ctx.time.now();
        if !ctx.registry.is_allowed(unit.as_str()) {
            warn!(unit_id = %unit, kind = %alert.kind, "Alert from pending unit dropped");
            ctx.registry.record_pending_visit(unit.as_str(), now).await;
            return WriteOutcome::PendingUnit;
        }

        warn!(unit_id = %unit, kind = %alert.kind, "Unit raised an alert");
        let stamp = ctx.time.correct(alert.timestamp);
        let document = json!({
            "bike_id": unit.as_str(),
            "kind": alert.kind,
            "timestamp": stamp.value,
            "timestamp_corrected": stamp.corrected,
            "detail": alert.detail,
        });

        ctx.history
            .record(now, Some(unit), HistoryKind::Alert { kind: alert.kind });
        self.sync_request = Some(SyncTrigger::Critical);
        self.buffer_entry(EntryKind::Alert, unit, document.to_string(), stamp.value, ctx)
            .await
    }

    async fn buffer_entry(
        &mut self,
        kind: EntryKind,
        unit: &FieldUnitId,
        payload: String,
        created_at: i64,
        ctx: &mut ServingContext<'_>,
    ) -> WriteOutcome {
        if ctx
            .buffer
            .enqueue(kind, unit.as_str(), payload, created_at)
            .await
        {
            return WriteOutcome::Accepted;
        }

        if ctx.buffer.is_critically_full() {
            self.sync_request = Some(SyncTrigger::BufferFull);
            WriteOutcome::BufferFull
        } else {
            WriteOutcome::Ignored
        }
    }
}
