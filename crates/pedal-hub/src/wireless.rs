//! # Wireless Seam
//!
//! Boundary between the radio stack and the engine.
//!
//! ## Handoff
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   radio callback context                 orchestrator loop              │
//! │   ──────────────────────                 ─────────────────              │
//! │                                                                         │
//! │   on_connect(h)    ─┐                                                   │
//! │   on_disconnect(h) ─┼─► EventBridge ──mpsc──► handle_event(event)       │
//! │   on_write(h,c,b)  ─┘   (try_send,             │                        │
//! │                          never blocks;         ▼                        │
//! │                          disconnects wait                               │
//! │                          in a task)                                     │
//! │                                         SessionMultiplexer             │
//! │                                                │                        │
//! │   WirelessLink::send / disconnect  ◄───────────┘                        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Callbacks never see engine state. The mpsc channel is the only thing
//! shared between the two contexts.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::HubResult;
use crate::protocol::{Channel, HubMessage};

/// Radio connection handle.
pub type ConnHandle = u16;

/// Event raised by the radio stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WirelessEvent {
    Connected {
        handle: ConnHandle,
    },
    Disconnected {
        handle: ConnHandle,
    },
    Write {
        handle: ConnHandle,
        channel: Channel,
        payload: String,
    },
}

impl WirelessEvent {
    pub fn handle(&self) -> ConnHandle {
        match self {
            WirelessEvent::Connected { handle }
            | WirelessEvent::Disconnected { handle }
            | WirelessEvent::Write { handle, .. } => *handle,
        }
    }
}

/// Callback surface the radio stack drives.
pub trait WirelessCallbacks {
    fn on_connect(&self, handle: ConnHandle);
    fn on_disconnect(&self, handle: ConnHandle);
    fn on_write(&self, handle: ConnHandle, channel: Channel, bytes: &[u8]);
}

/// Outbound operations on the radio.
pub trait WirelessLink: Send + Sync {
    /// Notifies one connection on one channel.
    fn send(&self, handle: ConnHandle, channel: Channel, message: &HubMessage) -> HubResult<()>;

    fn disconnect(&self, handle: ConnHandle) -> HubResult<()>;

    fn set_advertising(&self, enabled: bool) -> HubResult<()>;
}

/// [`WirelessCallbacks`] that forwards into the orchestrator's event channel.
#[derive(Debug, Clone)]
pub struct EventBridge {
    tx: mpsc::Sender<WirelessEvent>,
}

impl EventBridge {
    pub fn new(tx: mpsc::Sender<WirelessEvent>) -> Self {
        EventBridge { tx }
    }

    /// Creates a bridge and the receiver the orchestrator drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<WirelessEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (EventBridge { tx }, rx)
    }

    /// Forwards an event. Returns false when it had to be dropped.
    ///
    /// A disconnect that meets a full channel is handed to a task that waits
    /// for room, so a session is never left behind for a link that is gone.
    pub fn forward(&self, event: WirelessEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event @ WirelessEvent::Disconnected { .. })) => {
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    warn!(handle = event.handle(), "No runtime to deliver disconnect, dropping event");
                    return false;
                };
                debug!(handle = event.handle(), "Wireless event channel full, deferring disconnect");
                let tx = self.tx.clone();
                runtime.spawn(async move {
                    if let Err(e) = tx.send(event).await {
                        trace!(handle = e.0.handle(), "Wireless event channel closed");
                    }
                });
                true
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(handle = event.handle(), "Wireless event channel full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                trace!(handle = event.handle(), "Wireless event channel closed");
                false
            }
        }
    }
}

impl WirelessCallbacks for EventBridge {
    fn on_connect(&self, handle: ConnHandle) {
        self.forward(WirelessEvent::Connected { handle });
    }

    fn on_disconnect(&self, handle: ConnHandle) {
        self.forward(WirelessEvent::Disconnected { handle });
    }

    fn on_write(&self, handle: ConnHandle, channel: Channel, bytes: &[u8]) {
        self.forward(WirelessEvent::Write {
            handle,
            channel,
            payload: String::from_utf8_lossy(bytes).into_owned(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bridge_forwards_callbacks_in_order() {
        let (bridge, mut rx) = EventBridge::channel(8);

        bridge.on_connect(1);
        bridge.on_write(1, Channel::Data, br#"{"bike_id":"u-AAA"}"#);
        bridge.on_disconnect(1);

        assert_eq!(rx.recv().await, Some(WirelessEvent::Connected { handle: 1 }));
        assert_eq!(
            rx.recv().await,
            Some(WirelessEvent::Write {
                handle: 1,
                channel: Channel::Data,
                payload: r#"{"bike_id":"u-AAA"}"#.into(),
            })
        );
        assert_eq!(rx.recv().await, Some(WirelessEvent::Disconnected { handle: 1 }));
    }

    #[test]
    fn test_full_channel_drops_without_blocking() {
        let (bridge, _rx) = EventBridge::channel(1);
        assert!(bridge.forward(WirelessEvent::Connected { handle: 1 }));
        assert!(!bridge.forward(WirelessEvent::Connected { handle: 2 }));
    }

    #[tokio::test]
    async fn test_disconnect_survives_full_channel() {
        let (bridge, mut rx) = EventBridge::channel(1);
        assert!(bridge.forward(WirelessEvent::Connected { handle: 1 }));
        assert!(bridge.forward(WirelessEvent::Disconnected { handle: 1 }));
        assert!(!bridge.forward(WirelessEvent::Connected { handle: 2 }));

        assert_eq!(rx.recv().await, Some(WirelessEvent::Connected { handle: 1 }));
        assert_eq!(rx.recv().await, Some(WirelessEvent::Disconnected { handle: 1 }));
    }

    #[test]
    fn test_event_wire_format() {
        let event: WirelessEvent = serde_json::from_str(
            r#"{"event":"write","handle":3,"channel":"config","payload":"{}"}"#,
        )
        .unwrap();
        assert_eq!(event.handle(), 3);
        assert!(matches!(
            event,
            WirelessEvent::Write {
                channel: Channel::Config,
                ..
            }
        ));
    }
}
