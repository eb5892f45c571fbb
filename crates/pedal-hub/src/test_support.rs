//! Fakes shared by the engine tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use pedal_core::{Timestamp, UnitRecord};

use crate::cloud::{CloudApi, CloudConfigEntry, CloudUnitEntry, HubHeartbeat};
use crate::error::{HubError, HubResult};
use crate::offline_buffer::UploadBatch;
use crate::protocol::{Channel, HubMessage};
use crate::wireless::{ConnHandle, WirelessLink};

// =============================================================================
// Recording Link
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum LinkCall {
    Send {
        handle: ConnHandle,
        channel: Channel,
        message: HubMessage,
    },
    Disconnect(ConnHandle),
    Advertising(bool),
}

/// [`WirelessLink`] that records every call.
#[derive(Debug, Clone, Default)]
pub struct RecordingLink {
    calls: Arc<Mutex<Vec<LinkCall>>>,
}

impl RecordingLink {
    pub fn calls(&self) -> Vec<LinkCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<(ConnHandle, Channel, HubMessage)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                LinkCall::Send {
                    handle,
                    channel,
                    message,
                } => Some((handle, channel, message)),
                _ => None,
            })
            .collect()
    }

    pub fn advertising(&self) -> Option<bool> {
        self.calls().into_iter().rev().find_map(|call| match call {
            LinkCall::Advertising(on) => Some(on),
            _ => None,
        })
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

impl WirelessLink for RecordingLink {
    fn send(&self, handle: ConnHandle, channel: Channel, message: &HubMessage) -> HubResult<()> {
        self.calls.lock().unwrap().push(LinkCall::Send {
            handle,
            channel,
            message: message.clone(),
        });
        Ok(())
    }

    fn disconnect(&self, handle: ConnHandle) -> HubResult<()> {
        self.calls.lock().unwrap().push(LinkCall::Disconnect(handle));
        Ok(())
    }

    fn set_advertising(&self, enabled: bool) -> HubResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(LinkCall::Advertising(enabled));
        Ok(())
    }
}

// =============================================================================
// Fake Cloud
// =============================================================================

#[derive(Debug, Default)]
pub struct FakeCloudState {
    pub online: bool,
    pub server_time: Option<Timestamp>,
    pub registry: HashMap<String, CloudUnitEntry>,
    pub configs: HashMap<String, CloudConfigEntry>,
    pub reject_buffer: bool,
    pub reject_heartbeat: bool,
    pub probes: usize,
    pub uploaded: Vec<Vec<u64>>,
    pub heartbeats: Vec<HubHeartbeat>,
    pub registry_uploads: Vec<Vec<UnitRecord>>,
}

/// In-process [`CloudApi`]. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct FakeCloud {
    state: Arc<Mutex<FakeCloudState>>,
}

impl FakeCloud {
    pub fn online() -> Self {
        let cloud = FakeCloud::default();
        cloud.state().online = true;
        cloud
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, FakeCloudState> {
        self.state.lock().unwrap()
    }

    fn check_online(&self) -> HubResult<()> {
        if self.state().online {
            Ok(())
        } else {
            Err(HubError::ConnectionFailed("network unreachable".into()))
        }
    }
}

#[async_trait]
impl CloudApi for FakeCloud {
    async fn probe(&self) -> HubResult<Option<Timestamp>> {
        self.state().probes += 1;
        self.check_online()?;
        Ok(self.state().server_time)
    }

    async fn fetch_registry(&self) -> HubResult<HashMap<String, CloudUnitEntry>> {
        self.check_online()?;
        Ok(self.state().registry.clone())
    }

    async fn fetch_configs(&self) -> HubResult<HashMap<String, CloudConfigEntry>> {
        self.check_online()?;
        Ok(self.state().configs.clone())
    }

    async fn upload_buffer(&self, batch: &UploadBatch) -> HubResult<()> {
        self.check_online()?;
        let mut state = self.state();
        if state.reject_buffer {
            return Err(HubError::CloudStatus {
                status: 503,
                path: "buffer".into(),
            });
        }
        state.uploaded.push(batch.seqs().collect());
        Ok(())
    }

    async fn upload_heartbeat(&self, heartbeat: &HubHeartbeat) -> HubResult<()> {
        self.check_online()?;
        let mut state = self.state();
        if state.reject_heartbeat {
            return Err(HubError::CloudStatus {
                status: 502,
                path: "heartbeat".into(),
            });
        }
        state.heartbeats.push(heartbeat.clone());
        Ok(())
    }

    async fn upload_registry(&self, records: &[UnitRecord]) -> HubResult<()> {
        self.check_online()?;
        self.state().registry_uploads.push(records.to_vec());
        Ok(())
    }
}
