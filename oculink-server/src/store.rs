//! Port implementations over the EMR backend's internal REST API.
//!
//! The document store (devices, patients, measurements, clinical records)
//! belongs to the main EMR service; this client is the only place the
//! integration server talks to it. Every call carries the service token in
//! `X-Service-Token`.

use async_trait::async_trait;
use oculink_core::error::{IntegrationError, Result};
use oculink_core::ports::{
    DeviceStore, IntegrationLogStore, MeasurementSink, PatientDirectory, UnmatchedFolderStore,
};
use oculink_core::records::{GranularUpdate, RecordPatchStore};
use oculink_model::{
    Device, DeviceId, DeviceImage, DeviceMeasurement, DeviceType, IntegrationLogEntry,
    IntegrationState, PatientCandidate, PatientId, UnmatchedFolderTicket, UserId,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// REST client for the EMR's internal service API.
#[derive(Debug, Clone)]
pub struct EmrApiClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct CreatedResponse {
    id: String,
}

impl EmrApiClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn check(response: reqwest::Response, context: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(IntegrationError::NotFound(context.to_string()));
        }
        if !status.is_success() {
            return Err(IntegrationError::Transport(format!(
                "{context}: EMR API returned {status}"
            )));
        }
        Ok(response)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        debug!(path, "emr api GET");
        let response = self
            .client
            .get(self.url(path))
            .header("X-Service-Token", &self.token)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response, path).await?;
        Ok(Some(response.json().await?))
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
    ) -> Result<T> {
        debug!(path, "emr api POST");
        let response = self
            .client
            .post(self.url(path))
            .header("X-Service-Token", &self.token)
            .json(body)
            .send()
            .await?;
        let response = Self::check(response, path).await?;
        Ok(response.json().await?)
    }

    async fn patch_json(&self, path: &str, body: &Value) -> Result<()> {
        debug!(path, "emr api PATCH");
        let response = self
            .client
            .patch(self.url(path))
            .header("X-Service-Token", &self.token)
            .json(body)
            .send()
            .await?;
        Self::check(response, path).await?;
        Ok(())
    }
}

#[async_trait]
impl DeviceStore for EmrApiClient {
    async fn get(&self, id: &DeviceId) -> Result<Option<Device>> {
        self.get_json(&format!("/internal/devices/{id}")).await
    }

    async fn list_active(&self) -> Result<Vec<Device>> {
        Ok(self
            .get_json("/internal/devices?active=true")
            .await?
            .unwrap_or_default())
    }

    async fn update_integration(&self, id: &DeviceId, state: &IntegrationState) -> Result<()> {
        self.patch_json(
            &format!("/internal/devices/{id}/integration"),
            &serde_json::to_value(state)?,
        )
        .await
    }
}

#[async_trait]
impl MeasurementSink for EmrApiClient {
    async fn save_measurement(&self, measurement: &DeviceMeasurement) -> Result<String> {
        let created: CreatedResponse = self
            .post_json(
                "/internal/device-measurements",
                &serde_json::to_value(measurement)?,
            )
            .await?;
        Ok(created.id)
    }

    async fn save_image(&self, image: &DeviceImage) -> Result<String> {
        let created: CreatedResponse = self
            .post_json("/internal/device-images", &serde_json::to_value(image)?)
            .await?;
        Ok(created.id)
    }
}

#[async_trait]
impl IntegrationLogStore for EmrApiClient {
    async fn append(&self, entry: &IntegrationLogEntry) -> Result<String> {
        let created: CreatedResponse = self
            .post_json("/internal/integration-logs", &serde_json::to_value(entry)?)
            .await?;
        Ok(created.id)
    }
}

#[async_trait]
impl PatientDirectory for EmrApiClient {
    async fn find_by_legacy_id(&self, legacy_id: &str) -> Result<Option<PatientCandidate>> {
        self.get_json(&format!(
            "/internal/patients/by-legacy-id/{}",
            urlencode(legacy_id)
        ))
        .await
    }

    async fn search_by_name(
        &self,
        last_name: &str,
        first_name: Option<&str>,
    ) -> Result<Vec<PatientCandidate>> {
        let mut path = format!("/internal/patients/search?lastName={}", urlencode(last_name));
        if let Some(first_name) = first_name {
            path.push_str(&format!("&firstName={}", urlencode(first_name)));
        }
        Ok(self.get_json(&path).await?.unwrap_or_default())
    }

    async fn folder_mapping(&self, folder_name: &str) -> Result<Option<PatientId>> {
        #[derive(Deserialize)]
        struct Mapping {
            patient: PatientId,
        }
        let mapping: Option<Mapping> = self
            .get_json(&format!(
                "/internal/folder-mappings/{}",
                urlencode(folder_name)
            ))
            .await?;
        Ok(mapping.map(|m| m.patient))
    }

    async fn save_folder_mapping(
        &self,
        folder_name: &str,
        patient: &PatientId,
        device_type: DeviceType,
        linked_by: Option<&UserId>,
    ) -> Result<()> {
        let _: Value = self
            .post_json(
                "/internal/folder-mappings",
                &json!({
                    "folderName": folder_name,
                    "patient": patient,
                    "deviceType": device_type,
                    "linkedBy": linked_by,
                }),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl UnmatchedFolderStore for EmrApiClient {
    async fn stage(&self, ticket: &UnmatchedFolderTicket) -> Result<()> {
        let _: Value = self
            .post_json("/internal/unmatched-folders", &serde_json::to_value(ticket)?)
            .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<UnmatchedFolderTicket>> {
        Ok(self
            .get_json("/internal/unmatched-folders")
            .await?
            .unwrap_or_default())
    }
}

#[async_trait]
impl RecordPatchStore for EmrApiClient {
    async fn apply(&self, update: &GranularUpdate) -> Result<Value> {
        self.post_json(
            &format!("/internal/clinical-records/{}/patch", update.record),
            &json!({
                "set": update.set,
                "addToSet": update.add_to_set,
            }),
        )
        .await
    }
}

/// Minimal percent-encoding for path/query fragments.
fn urlencode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            other => encoded.push_str(&format!("%{other:02X}")),
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencode_escapes_reserved_bytes() {
        assert_eq!(urlencode("DUPONT Jean"), "DUPONT%20Jean");
        assert_eq!(urlencode("a/b?c"), "a%2Fb%3Fc");
        assert_eq!(urlencode("A12345"), "A12345");
    }
}
