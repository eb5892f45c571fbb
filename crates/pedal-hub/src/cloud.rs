//! # Cloud Client
//!
//! REST client for the cloud store, behind the [`CloudApi`] trait so the
//! orchestrator can be driven by a fake in tests.
//!
//! ## Endpoints
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Method  Path         Body / Response                                   │
//! │  ──────  ───────────  ─────────────────────────────────────────────     │
//! │  GET     health       probe; HTTP Date header → TimeBase                │
//! │  GET     registry     {unit_id: {status, ...}}  (authoritative)         │
//! │  GET     configs      {unit_id: {version, config}}                      │
//! │  PATCH   buffer       {hub_id, entries: [...]}  (2xx = durable)         │
//! │  PUT     heartbeat    {timestamp, connected_count, free_memory, uptime} │
//! │  PUT     registry     [UnitRecord, ...]  (only changed identities)      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Paths are resolved relative to `cloud.base_url`. Every request carries
//! `Authorization: Bearer <api_key>`.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};
use url::Url;

use pedal_core::{Heartbeat, Timestamp, UnitRecord, UnitStatus};

use crate::config::CloudSettings;
use crate::error::{HubError, HubResult};
use crate::offline_buffer::UploadBatch;

// =============================================================================
// Wire Types
// =============================================================================

/// One identity in the downloaded registry.
///
/// Only `status` is required; missing visit and heartbeat data is filled
/// from the local record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudUnitEntry {
    pub status: UnitStatus,
    #[serde(default)]
    pub first_seen: Option<Timestamp>,
    #[serde(default)]
    pub last_visit: Option<Timestamp>,
    #[serde(default)]
    pub visit_count: Option<u32>,
    #[serde(default)]
    pub last_heartbeat: Option<Heartbeat>,
}

/// One identity in the downloaded config map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudConfigEntry {
    pub version: u32,
    #[serde(alias = "payload")]
    pub config: Value,
}

/// Hub heartbeat body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubHeartbeat {
    pub hub_id: String,
    pub timestamp: Timestamp,
    pub connected_count: usize,
    /// Free offline-buffer slots.
    pub free_memory: usize,
    /// Seconds since boot.
    pub uptime: u64,
}

// =============================================================================
// CloudApi Trait
// =============================================================================

/// Wide-area operations used by a sync cycle.
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Connect check. Returns the server's epoch time when it reports one.
    async fn probe(&self) -> HubResult<Option<Timestamp>>;

    async fn fetch_registry(&self) -> HubResult<HashMap<String, CloudUnitEntry>>;

    async fn fetch_configs(&self) -> HubResult<HashMap<String, CloudConfigEntry>>;

    /// Succeeds only once the cloud has durably accepted the batch.
    async fn upload_buffer(&self, batch: &UploadBatch) -> HubResult<()>;

    async fn upload_heartbeat(&self, heartbeat: &HubHeartbeat) -> HubResult<()>;

    /// Partial registry upload.
    async fn upload_registry(&self, records: &[UnitRecord]) -> HubResult<()>;

    /// Applies new endpoint settings after reconfiguration.
    fn configure(&mut self, _settings: &CloudSettings) -> HubResult<()> {
        Ok(())
    }
}

// =============================================================================
// HTTP Implementation
// =============================================================================

#[derive(Debug, Clone)]
struct Endpoint {
    base: Url,
    api_key: String,
}

/// [`CloudApi`] over HTTPS with reqwest.
#[derive(Debug, Clone)]
pub struct HttpCloudClient {
    client: Client,
    hub_id: String,
    endpoint: Option<Endpoint>,
}

impl HttpCloudClient {
    /// Creates a client. Missing credentials are allowed; every call then
    /// fails with [`HubError::MissingCredentials`] until [`CloudApi::configure`].
    pub fn new(settings: &CloudSettings, hub_id: impl Into<String>) -> HubResult<Self> {
        let client = Client::builder()
            .timeout(settings.request_timeout())
            .connect_timeout(settings.connect_timeout())
            .user_agent(concat!("pedal-hub/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HubError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(HttpCloudClient {
            client,
            hub_id: hub_id.into(),
            endpoint: Self::endpoint_from(settings),
        })
    }

    fn endpoint_from(settings: &CloudSettings) -> Option<Endpoint> {
        let base = settings.parsed_base_url().ok()?;
        if settings.api_key.trim().is_empty() {
            return None;
        }
        Some(Endpoint {
            base,
            api_key: settings.api_key.trim().to_string(),
        })
    }

    fn request(&self, method: Method, path: &str) -> HubResult<RequestBuilder> {
        let endpoint = self.endpoint.as_ref().ok_or(HubError::MissingCredentials)?;
        let url = endpoint.base.join(path)?;
        debug!(%method, %url, "Cloud request");
        Ok(self
            .client
            .request(method, url)
            .bearer_auth(&endpoint.api_key))
    }

    async fn send(&self, builder: RequestBuilder, path: &str) -> HubResult<Response> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(HubError::CloudStatus {
                status: status.as_u16(),
                path: path.to_string(),
            });
        }
        Ok(response)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> HubResult<T> {
        let response = self.send(self.request(Method::GET, path)?, path).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| HubError::CloudPayload(format!("{}: {}", path, e)))
    }
}

/// Parses an HTTP `Date` header value into epoch seconds.
pub fn parse_http_date(value: &str) -> Option<Timestamp> {
    chrono::DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.timestamp())
}

#[async_trait]
impl CloudApi for HttpCloudClient {
    async fn probe(&self) -> HubResult<Option<Timestamp>> {
        let response = self
            .send(self.request(Method::GET, "health")?, "health")
            .await?;

        Ok(response
            .headers()
            .get(reqwest::header::DATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date))
    }

    async fn fetch_registry(&self) -> HubResult<HashMap<String, CloudUnitEntry>> {
        self.get_json("registry").await
    }

    async fn fetch_configs(&self) -> HubResult<HashMap<String, CloudConfigEntry>> {
        self.get_json("configs").await
    }

    async fn upload_buffer(&self, batch: &UploadBatch) -> HubResult<()> {
        let body = json!({
            "hub_id": self.hub_id,
            "entries": batch.entries(),
        });
        self.send(self.request(Method::PATCH, "buffer")?.json(&body), "buffer")
            .await?;
        info!(entries = batch.len(), "Buffer batch accepted by cloud");
        Ok(())
    }

    async fn upload_heartbeat(&self, heartbeat: &HubHeartbeat) -> HubResult<()> {
        self.send(
            self.request(Method::PUT, "heartbeat")?.json(heartbeat),
            "heartbeat",
        )
        .await?;
        Ok(())
    }

    async fn upload_registry(&self, records: &[UnitRecord]) -> HubResult<()> {
        self.send(
            self.request(Method::PUT, "registry")?.json(records),
            "registry",
        )
        .await?;
        Ok(())
    }

    fn configure(&mut self, settings: &CloudSettings) -> HubResult<()> {
        let endpoint = Self::endpoint_from(settings).ok_or(HubError::MissingCredentials)?;
        info!(base_url = %endpoint.base, "Cloud endpoint updated");
        self.endpoint = Some(endpoint);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(base_url: &str, api_key: &str) -> CloudSettings {
        CloudSettings {
            base_url: base_url.into(),
            api_key: api_key.into(),
            ..CloudSettings::default()
        }
    }

    #[test]
    fn test_parse_http_date() {
        assert_eq!(
            parse_http_date("Tue, 14 Nov 2023 22:13:20 GMT"),
            Some(1_700_000_000)
        );
        assert_eq!(parse_http_date("yesterday"), None);
    }

    #[test]
    fn test_cloud_entries_deserialize() {
        let registry: HashMap<String, CloudUnitEntry> =
            serde_json::from_str(r#"{"u-000001":{"status":"allowed"}}"#).unwrap();
        assert_eq!(registry["u-000001"].status, UnitStatus::Allowed);
        assert_eq!(registry["u-000001"].last_heartbeat, None);

        let configs: HashMap<String, CloudConfigEntry> =
            serde_json::from_str(r#"{"u-AAA":{"version":4,"payload":{"report_interval_s":60}}}"#)
                .unwrap();
        assert_eq!(configs["u-AAA"].version, 4);
        assert_eq!(configs["u-AAA"].config["report_interval_s"], 60);
    }

    #[tokio::test]
    async fn test_unconfigured_client_reports_missing_credentials() {
        let client = HttpCloudClient::new(&CloudSettings::default(), "hub-1").unwrap();
        assert!(matches!(
            client.probe().await,
            Err(HubError::MissingCredentials)
        ));
    }

    #[test]
    fn test_configure_requires_credentials() {
        let mut client = HttpCloudClient::new(&CloudSettings::default(), "hub-1").unwrap();
        assert!(client.configure(&settings("https://cloud.example", "")).is_err());
        assert!(client
            .configure(&settings("https://cloud.example", "k-1"))
            .is_ok());
        assert!(client.request(Method::GET, "registry").is_ok());
    }
}
