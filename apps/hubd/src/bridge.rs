//! # Stdio Radio Bridge
//!
//! The radio helper process reports connections and writes as JSON lines
//! on our stdin and receives notifications as JSON lines on our stdout.
//!
//! ## Line Formats
//! ```text
//! in:  {"kind":"connected","handle":3}
//!      {"kind":"disconnected","handle":3}
//!      {"kind":"write","handle":3,"channel":"data","payload":"{...}"}
//!      {"kind":"configure","ssid":"..","passphrase":"..","base_url":"..","api_key":".."}
//!      {"kind":"wake"} | {"kind":"force_sync"} | {"kind":"shutdown"}
//!
//! out: {"kind":"send","handle":3,"channel":"config","message":{...}}
//!      {"kind":"disconnect","handle":3}
//!      {"kind":"advertising","enabled":true}
//!      {"kind":"configured","ok":false,"error":"..."}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use pedal_hub::{
    Channel, ConfigurationUpdate, ConnHandle, EventBridge, HubError, HubHandle, HubMessage,
    HubResult, WirelessCallbacks, WirelessLink,
};

/// Line read from the radio helper.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeInput {
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
    Configure {
        ssid: String,
        #[serde(default)]
        passphrase: String,
        base_url: String,
        api_key: String,
    },
    Wake,
    ForceSync,
    Shutdown,
}

/// Line written to the radio helper.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeOutput {
    Send {
        handle: ConnHandle,
        channel: Channel,
        message: Value,
    },
    Disconnect {
        handle: ConnHandle,
    },
    Advertising {
        enabled: bool,
    },
    Configured {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

// =============================================================================
// Outbound
// =============================================================================

/// [`WirelessLink`] that queues [`BridgeOutput`] lines for the stdout writer.
#[derive(Debug, Clone)]
pub struct StdioLink {
    tx: mpsc::UnboundedSender<BridgeOutput>,
}

impl StdioLink {
    pub fn new(tx: mpsc::UnboundedSender<BridgeOutput>) -> Self {
        StdioLink { tx }
    }

    fn emit(&self, line: BridgeOutput) -> HubResult<()> {
        self.tx
            .send(line)
            .map_err(|_| HubError::LinkError("stdout writer stopped".into()))
    }
}

impl WirelessLink for StdioLink {
    fn send(&self, handle: ConnHandle, channel: Channel, message: &HubMessage) -> HubResult<()> {
        self.emit(BridgeOutput::Send {
            handle,
            channel,
            message: message.to_json(),
        })
    }

    fn disconnect(&self, handle: ConnHandle) -> HubResult<()> {
        self.emit(BridgeOutput::Disconnect { handle })
    }

    fn set_advertising(&self, enabled: bool) -> HubResult<()> {
        self.emit(BridgeOutput::Advertising { enabled })
    }
}

/// Writes queued lines to stdout until every sender is gone.
pub async fn write_stdout(mut rx: mpsc::UnboundedReceiver<BridgeOutput>) {
    let mut stdout = tokio::io::stdout();

    while let Some(line) = rx.recv().await {
        let mut encoded = match serde_json::to_string(&line) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!(error = %e, "Failed to encode bridge output");
                continue;
            }
        };
        encoded.push('\n');

        if let Err(e) = stdout.write_all(encoded.as_bytes()).await {
            error!(error = %e, "Radio helper stdout closed");
            break;
        }
        if let Err(e) = stdout.flush().await {
            warn!(error = %e, "Failed to flush stdout");
        }
    }
    debug!("Stdout writer stopped");
}

// =============================================================================
// Inbound
// =============================================================================

/// Reads stdin lines until EOF, then asks the hub to shut down.
pub async fn read_stdin(
    events: EventBridge,
    hub: HubHandle,
    replies: mpsc::UnboundedSender<BridgeOutput>,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Radio helper closed stdin");
                break;
            }
            Err(e) => {
                error!(error = %e, "Failed to read stdin");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<BridgeInput>(&line) {
            Ok(input) => {
                if !dispatch(input, &events, &hub, &replies).await {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "Ignoring malformed bridge line"),
        }
    }

    if let Err(e) = hub.shutdown().await {
        debug!(error = %e, "Hub already stopped");
    }
}

/// Routes one input line. Returns false once the hub is gone.
async fn dispatch(
    input: BridgeInput,
    events: &EventBridge,
    hub: &HubHandle,
    replies: &mpsc::UnboundedSender<BridgeOutput>,
) -> bool {
    let result = match input {
        BridgeInput::Connected { handle } => {
            events.on_connect(handle);
            Ok(())
        }
        BridgeInput::Disconnected { handle } => {
            events.on_disconnect(handle);
            Ok(())
        }
        BridgeInput::Write {
            handle,
            channel,
            payload,
        } => {
            events.on_write(handle, channel, payload.as_bytes());
            Ok(())
        }
        BridgeInput::Configure {
            ssid,
            passphrase,
            base_url,
            api_key,
        } => {
            let update = ConfigurationUpdate {
                ssid,
                passphrase,
                base_url,
                api_key,
            };
            let outcome = hub.complete_configuration(update).await;
            if let Err(HubError::ChannelError(_)) = &outcome {
                return false;
            }
            let reply = BridgeOutput::Configured {
                ok: outcome.is_ok(),
                error: outcome.err().map(|e| e.to_string()),
            };
            if replies.send(reply).is_err() {
                warn!("Configuration reply dropped");
            }
            Ok(())
        }
        BridgeInput::Wake => hub.wake().await,
        BridgeInput::ForceSync => hub.force_sync().await,
        BridgeInput::Shutdown => hub.shutdown().await,
    };

    match result {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, "Hub stopped accepting commands");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_input_lines() {
        let write: BridgeInput = serde_json::from_str(
            r#"{"kind":"write","handle":3,"channel":"data","payload":"{\"bike_id\":\"u-1\"}"}"#,
        )
        .unwrap();
        assert_eq!(
            write,
            BridgeInput::Write {
                handle: 3,
                channel: Channel::Data,
                payload: r#"{"bike_id":"u-1"}"#.into(),
            }
        );

        let configure: BridgeInput = serde_json::from_str(
            r#"{"kind":"configure","ssid":"barn","base_url":"https://c.example","api_key":"k"}"#,
        )
        .unwrap();
        assert!(matches!(configure, BridgeInput::Configure { passphrase, .. } if passphrase.is_empty()));

        let sync: BridgeInput = serde_json::from_str(r#"{"kind":"force_sync"}"#).unwrap();
        assert_eq!(sync, BridgeInput::ForceSync);

        assert!(serde_json::from_str::<BridgeInput>(r#"{"kind":"reboot"}"#).is_err());
    }

    #[test]
    fn test_link_emits_output_lines() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = StdioLink::new(tx);

        link.set_advertising(true).unwrap();
        link.disconnect(7).unwrap();

        assert_eq!(
            serde_json::to_value(rx.try_recv().unwrap()).unwrap(),
            json!({"kind": "advertising", "enabled": true})
        );
        assert_eq!(
            serde_json::to_value(rx.try_recv().unwrap()).unwrap(),
            json!({"kind": "disconnect", "handle": 7})
        );

        drop(rx);
        assert!(matches!(
            link.set_advertising(false),
            Err(HubError::LinkError(_))
        ));
    }

    #[test]
    fn test_configured_reply_omits_empty_error() {
        let ok = BridgeOutput::Configured { ok: true, error: None };
        assert_eq!(
            serde_json::to_value(ok).unwrap(),
            json!({"kind": "configured", "ok": true})
        );
    }
}
