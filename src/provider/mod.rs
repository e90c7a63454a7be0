//! WhatsApp Cloud API client.
//!
//! One instance per (tenant, request): credentials come from the tenant
//! record, the underlying `reqwest::Client` pool is shared process-wide.
//! Every call targets `https://graph.facebook.com/{api_version}`.

pub mod envelope;

use crate::config::AppConfig;
use crate::shared::errors::{AppError, AppResult};
use crate::shared::models::Organization;
use envelope::Outbound;
use log::{debug, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct SendResponse {
    messages: Option<Vec<MessageRef>>,
    error: Option<ProviderError>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ProviderError {
    message: String,
    #[allow(dead_code)]
    code: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaInfo {
    pub url: String,
    pub mime_type: Option<String>,
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateRecord {
    pub id: Option<String>,
    pub name: String,
    pub status: Option<String>,
    pub language: Option<String>,
    pub category: Option<String>,
}

pub struct CloudApiClient {
    http: reqwest::Client,
    base_url: String,
    phone_number_id: String,
    business_account_id: String,
    access_token: String,
}

impl CloudApiClient {
    pub fn for_org(http: reqwest::Client, config: &AppConfig, org: &Organization) -> Self {
        Self {
            http,
            base_url: config.graph_base(),
            phone_number_id: org.phone_number_id.clone(),
            business_account_id: org.business_account_id.clone(),
            access_token: org.access_token.clone(),
        }
    }

    /// Test-only constructor pointing at a mock server.
    pub fn with_base_url(
        http: reqwest::Client,
        base_url: &str,
        phone_number_id: &str,
        business_account_id: &str,
        access_token: &str,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            phone_number_id: phone_number_id.to_string(),
            business_account_id: business_account_id.to_string(),
            access_token: access_token.to_string(),
        }
    }

    fn messages_url(&self) -> String {
        format!("{}/{}/messages", self.base_url, self.phone_number_id)
    }

    fn templates_url(&self) -> String {
        format!("{}/{}/message_templates", self.base_url, self.business_account_id)
    }

    /// Sends one outbound envelope. Returns the provider message id.
    pub async fn send(&self, to: &str, outbound: &Outbound) -> AppResult<String> {
        let payload = outbound.to_payload(to);
        debug!("provider send to={} type={:?}", to, outbound.kind());

        let resp = self
            .http
            .post(self.messages_url())
            .bearer_auth(&self.access_token)
            .json(&payload)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let parsed: SendResponse = serde_json::from_str(&body).unwrap_or(SendResponse {
            messages: None,
            error: None,
        });

        if let Some(err) = parsed.error {
            return Err(AppError::Provider(err.message));
        }
        if !status.is_success() {
            return Err(AppError::Provider(format!("HTTP {}: {}", status, body)));
        }

        parsed
            .messages
            .and_then(|m| m.into_iter().next())
            .map(|m| m.id)
            .ok_or_else(|| AppError::Provider("send response carried no message id".to_string()))
    }

    /// Marks an inbound message read at the provider (blue ticks).
    pub async fn mark_read(&self, provider_message_id: &str) -> AppResult<()> {
        let payload = json!({
            "messaging_product": "whatsapp",
            "status": "read",
            "message_id": provider_message_id,
        });
        let resp = self
            .http
            .post(self.messages_url())
            .bearer_auth(&self.access_token)
            .json(&payload)
            .send()
            .await?;
        if !resp.status().is_success() {
            // Read receipts are best-effort; the caller never fails on them.
            warn!(
                "mark_read failed for {}: HTTP {}",
                provider_message_id,
                resp.status()
            );
        }
        Ok(())
    }

    /// Resolves a media id to its short-lived download URL and metadata.
    pub async fn media_info(&self, media_id: &str) -> AppResult<MediaInfo> {
        let url = format!("{}/{}", self.base_url, media_id);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AppError::Provider(format!("media lookup failed: {}", body)));
        }
        Ok(resp.json::<MediaInfo>().await?)
    }

    /// Downloads media bytes from a URL returned by [`media_info`]. The URL
    /// is pre-signed but still requires the bearer token.
    pub async fn download_media(&self, url: &str) -> AppResult<Vec<u8>> {
        let resp = self
            .http
            .get(url)
            .bearer_auth(&self.access_token)
            .timeout(UPLOAD_TIMEOUT)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(AppError::Provider(format!(
                "media download failed: HTTP {}",
                resp.status()
            )));
        }
        Ok(resp.bytes().await?.to_vec())
    }

    /// Uploads media for use as an outbound message attachment.
    pub async fn upload_media(&self, bytes: Vec<u8>, mime: &str) -> AppResult<String> {
        let url = format!("{}/{}/media", self.base_url, self.phone_number_id);
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name("upload")
            .mime_str(mime)
            .map_err(|e| AppError::Validation(format!("bad mime type: {}", e)))?;
        let form = reqwest::multipart::Form::new()
            .text("messaging_product", "whatsapp")
            .part("file", part);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.access_token)
            .multipart(form)
            .timeout(UPLOAD_TIMEOUT)
            .send()
            .await?;
        let body: Value = resp.json().await?;
        body.get("id")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| AppError::Provider(format!("media upload failed: {}", body)))
    }

    /// Two-step resumable upload for template header media. Returns the
    /// opaque header handle templates reference at creation time.
    pub async fn upload_header_media(
        &self,
        app_id: &str,
        bytes: Vec<u8>,
        mime: &str,
    ) -> AppResult<String> {
        let session_url = format!(
            "{}/{}/uploads?file_length={}&file_type={}",
            self.base_url,
            app_id,
            bytes.len(),
            urlencoding::encode(mime)
        );
        let resp = self
            .http
            .post(&session_url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        let body: Value = resp.json().await?;
        let session_id = body
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::Provider(format!("upload session failed: {}", body)))?
            .to_string();

        let upload_url = format!("{}/{}", self.base_url, session_id);
        let resp = self
            .http
            .post(&upload_url)
            .header("Authorization", format!("OAuth {}", self.access_token))
            .header("file_offset", "0")
            .body(bytes)
            .timeout(UPLOAD_TIMEOUT)
            .send()
            .await?;
        let body: Value = resp.json().await?;
        body.get("h")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| AppError::Provider(format!("upload finalize failed: {}", body)))
    }

    pub async fn create_template(&self, definition: &Value) -> AppResult<Value> {
        let resp = self
            .http
            .post(self.templates_url())
            .bearer_auth(&self.access_token)
            .json(definition)
            .send()
            .await?;
        let status = resp.status();
        let body: Value = resp.json().await?;
        if !status.is_success() {
            let msg = body
                .pointer("/error/message")
                .and_then(|v| v.as_str())
                .unwrap_or("template creation failed");
            return Err(AppError::Provider(msg.to_string()));
        }
        Ok(body)
    }

    pub async fn list_templates(&self) -> AppResult<Vec<TemplateRecord>> {
        let url = format!("{}?limit=200", self.templates_url());
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        let body: Value = resp.json().await?;
        let records = body
            .get("data")
            .and_then(|d| d.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| serde_json::from_value(i.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        Ok(records)
    }

    pub async fn delete_template(&self, name: &str) -> AppResult<()> {
        let url = format!(
            "{}?name={}",
            self.templates_url(),
            urlencoding::encode(name)
        );
        let resp = self
            .http
            .delete(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AppError::Provider(format!("template delete failed: {}", body)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> CloudApiClient {
        CloudApiClient::with_base_url(
            reqwest::Client::new(),
            "https://graph.test/v18.0/",
            "1150001",
            "2250001",
            "token",
        )
    }

    #[test]
    fn url_construction() {
        let c = client();
        assert_eq!(c.messages_url(), "https://graph.test/v18.0/1150001/messages");
        assert_eq!(
            c.templates_url(),
            "https://graph.test/v18.0/2250001/message_templates"
        );
    }

    #[test]
    fn send_response_parses_id() {
        let parsed: SendResponse =
            serde_json::from_str(r#"{"messages": [{"id": "wamid.X1"}]}"#).unwrap();
        assert_eq!(parsed.messages.unwrap()[0].id, "wamid.X1");
    }

    #[test]
    fn send_response_parses_error() {
        let parsed: SendResponse = serde_json::from_str(
            r#"{"error": {"message": "(#131030) Recipient not in allowed list", "code": 131030}}"#,
        )
        .unwrap();
        let err = parsed.error.unwrap();
        assert!(err.message.contains("131030"));
        assert!(parsed.messages.is_none());
    }
}
