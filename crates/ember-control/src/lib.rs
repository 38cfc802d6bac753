//! HTTP client for the panel control plane. The daemon fetches desired state
//! and writes observed state back through this; every method is a single
//! bearer-authenticated request against the panel API.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use ember_common::{
    ActionId, BackupArtifact, ControlPlane, ControlPlaneError, HandleUpdate, PendingAction,
    ServerId, ServerRecord, ServerStatus, StatsSnapshot, SystemStats,
};

pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpControlPlane {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ControlPlaneError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ControlPlaneError::Status {
                code: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, ControlPlaneError> {
        let resp = self
            .client
            .get(self.url(path))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| ControlPlaneError::Http(e.to_string()))?;
        Self::check(resp)
            .await?
            .json()
            .await
            .map_err(|e| ControlPlaneError::Decode(e.to_string()))
    }

    async fn send_json(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &Value,
    ) -> Result<(), ControlPlaneError> {
        let resp = self
            .client
            .request(method, self.url(path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| ControlPlaneError::Http(e.to_string()))?;
        Self::check(resp).await?;
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn fetch_servers(&self) -> Result<Vec<ServerRecord>, ControlPlaneError> {
        self.get_json("/api/servers").await
    }

    async fn fetch_pending_actions(&self) -> Result<Vec<PendingAction>, ControlPlaneError> {
        self.get_json("/api/actions/pending").await
    }

    async fn report_status(
        &self,
        server_id: ServerId,
        status: ServerStatus,
        handle: HandleUpdate,
    ) -> Result<(), ControlPlaneError> {
        let mut body = serde_json::Map::new();
        body.insert("status".to_string(), json!(status));
        match handle {
            HandleUpdate::Unchanged => {}
            HandleUpdate::Set(h) => {
                body.insert("container_id".to_string(), json!(h));
            }
            HandleUpdate::Clear => {
                body.insert("container_id".to_string(), Value::Null);
            }
        }
        debug!(server_id, %status, "reporting status");
        self.send_json(
            reqwest::Method::PUT,
            &format!("/api/servers/{server_id}/status"),
            &Value::Object(body),
        )
        .await
    }

    async fn report_stats(
        &self,
        server_id: ServerId,
        stats: &StatsSnapshot,
    ) -> Result<(), ControlPlaneError> {
        self.send_json(
            reqwest::Method::POST,
            &format!("/api/servers/{server_id}/stats"),
            &json!(stats),
        )
        .await
    }

    async fn report_system_stats(&self, stats: &SystemStats) -> Result<(), ControlPlaneError> {
        self.send_json(reqwest::Method::POST, "/api/system/stats", &json!(stats))
            .await
    }

    async fn register_backup(
        &self,
        server_id: ServerId,
        artifact: &BackupArtifact,
    ) -> Result<(), ControlPlaneError> {
        self.send_json(
            reqwest::Method::POST,
            &format!("/api/servers/{server_id}/backups"),
            &json!(artifact),
        )
        .await
    }

    async fn complete_action(&self, action_id: ActionId) -> Result<(), ControlPlaneError> {
        self.send_json(
            reqwest::Method::PUT,
            &format!("/api/actions/{action_id}/complete"),
            &Value::Object(serde_json::Map::new()),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let cp = HttpControlPlane::new("http://panel:8000/".to_string(), "key".to_string());
        assert_eq!(cp.url("/api/servers"), "http://panel:8000/api/servers");
    }
}
