//! Webhook ingestion pipeline.
//!
//! The provider POSTs event envelopes here. The contract is strict: answer
//! 200 immediately, do the work in a background task, and stay idempotent,
//! since the provider retries anything it thinks failed. Each envelope is routed
//! to one tenant, signature-checked against that tenant's access token, and
//! fanned out to the inbox, realtime, external forwarder, broadcast
//! reconciler, and flow interpreter.

pub mod payload;

use crate::broadcast;
use crate::flow::FlowEngine;
use crate::inbox;
use crate::provider::CloudApiClient;
use crate::realtime::{conv_room, events};
use crate::shared::errors::AppResult;
use crate::shared::models::schema::organizations;
use crate::shared::models::{MessageStatus, NewMessage, Organization};
use crate::shared::state::AppState;
use crate::shared::utils::{constant_time_eq, same_phone};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use diesel::prelude::*;
use hmac::{Hmac, Mac};
use log::{debug, error, info, warn};
use payload::{ChangeValue, IncomingMessage, StatusUpdate, WebhookEnvelope};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhook", get(verify_legacy).post(receive_legacy))
        .route("/webhook/:slug", get(verify_tenant).post(receive_tenant))
}

#[derive(Debug, Deserialize)]
pub struct VerifyParams {
    #[serde(rename = "hub.mode")]
    pub hub_mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub hub_verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub hub_challenge: Option<String>,
}

async fn verify_legacy(
    State(state): State<Arc<AppState>>,
    Query(params): Query<VerifyParams>,
) -> Result<String, StatusCode> {
    verify_handshake(&params, &state.config.provider.default_verify_token)
}

async fn verify_tenant(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    Query(params): Query<VerifyParams>,
) -> Result<String, StatusCode> {
    let org = org_by_slug(&state, &slug).ok_or(StatusCode::FORBIDDEN)?;
    verify_handshake(&params, &org.verify_token)
}

fn verify_handshake(params: &VerifyParams, expected_token: &str) -> Result<String, StatusCode> {
    if let (Some(mode), Some(token), Some(challenge)) = (
        &params.hub_mode,
        &params.hub_verify_token,
        &params.hub_challenge,
    ) {
        if mode == "subscribe" && constant_time_eq(token, expected_token) {
            info!("webhook verification handshake accepted");
            return Ok(challenge.clone());
        }
    }
    warn!("webhook verification handshake rejected");
    Err(StatusCode::FORBIDDEN)
}

async fn receive_legacy(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    accept(state, None, headers, body)
}

async fn receive_tenant(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    accept(state, Some(slug), headers, body)
}

/// Acknowledge now, process later. The provider's delivery deadline is
/// short and a non-200 triggers redelivery.
fn accept(state: Arc<AppState>, slug: Option<String>, headers: HeaderMap, body: Bytes) -> StatusCode {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    tokio::spawn(async move {
        if let Err(e) = process_body(state, slug, signature, body).await {
            error!("webhook processing failed: {}", e);
        }
    });
    StatusCode::OK
}

async fn process_body(
    state: Arc<AppState>,
    slug: Option<String>,
    signature: Option<String>,
    body: Bytes,
) -> AppResult<()> {
    let envelope: WebhookEnvelope = match serde_json::from_slice(&body) {
        Ok(env) => env,
        Err(e) => {
            warn!("undecodable webhook body: {}", e);
            return Ok(());
        }
    };

    let metadata_phone_id = envelope
        .entry
        .first()
        .and_then(|e| e.changes.first())
        .map(|c| c.value.metadata.phone_number_id.clone());

    let Some(org) = resolve_org(&state, slug.as_deref(), metadata_phone_id.as_deref()) else {
        debug!(
            "webhook dropped: no active tenant for phone_number_id {:?}",
            metadata_phone_id
        );
        return Ok(());
    };

    if !org.subscription().is_active() {
        info!("webhook dropped: tenant {} subscription inactive", org.id);
        return Ok(());
    }

    if !state.config.dev_mode && !signature_matches(&body, signature.as_deref(), &org.access_token)
    {
        warn!("webhook signature rejected for tenant {}", org.id);
        return Ok(());
    }

    for entry in &envelope.entry {
        for change in &entry.changes {
            if change.field != "messages" {
                continue;
            }
            process_change(&state, &org, &change.value).await;
        }
    }
    Ok(())
}

async fn process_change(state: &Arc<AppState>, org: &Organization, value: &ChangeValue) {
    for message in &value.messages {
        if same_phone(&message.from, &org.display_phone_number) {
            debug!("self-message dropped for tenant {} (loop prevention)", org.id);
            continue;
        }
        if let Err(e) = handle_incoming(state, org, value, message).await {
            error!(
                "inbound handling failed tenant={} wamid={}: {}",
                org.id, message.id, e
            );
        }
    }
    for status in &value.statuses {
        if let Err(e) = handle_status(state, org, status).await {
            error!(
                "status handling failed tenant={} wamid={}: {}",
                org.id, status.id, e
            );
        }
    }
}

async fn handle_incoming(
    state: &Arc<AppState>,
    org: &Organization,
    value: &ChangeValue,
    message: &IncomingMessage,
) -> AppResult<()> {
    let profile_name = value
        .contacts
        .iter()
        .find(|c| c.wa_id == message.from)
        .map(|c| c.profile.name.as_str());

    // Media URLs are short-lived at the provider; resolve before persisting
    // so the inbox record is immediately renderable.
    let mut media_url = None;
    let mut media_mime = None;
    let mut media_size = None;
    if let Some(media) = message.media() {
        let client = CloudApiClient::for_org(state.http.clone(), &state.config, org);
        match client.media_info(&media.id).await {
            Ok(info) => {
                media_url = Some(info.url);
                media_mime = info.mime_type.or_else(|| media.mime_type.clone());
                media_size = info.file_size;
            }
            Err(e) => {
                warn!("media lookup failed for {}: {}", media.id, e);
                media_mime = media.mime_type.clone();
            }
        }
    }

    let mut conn = state.conn.get()?;

    let contact = inbox::upsert_contact(&mut conn, org.id, &message.from, &message.from, profile_name)?;
    let (conversation, created) = inbox::open_conversation(&mut conn, org.id, contact.id)?;

    let mut chatbot_enabled = true;
    if conversation.broadcast_id.is_none() {
        if let Some((broadcast_id, enabled)) =
            inbox::recent_broadcast_for_phone(&mut conn, org.id, &message.from)?
        {
            inbox::attribute_conversation(&mut conn, conversation.id, broadcast_id, true)?;
            chatbot_enabled = enabled;
        }
    } else if let Some(broadcast_id) = conversation.broadcast_id {
        chatbot_enabled = broadcast::chatbot_enabled(&mut conn, broadcast_id)?;
    }

    let body_text = message.display_text();
    let record = NewMessage {
        id: Uuid::new_v4(),
        org_id: org.id,
        conversation_id: conversation.id,
        direction: "in".to_string(),
        kind: message.kind().as_str().to_string(),
        body: body_text.clone(),
        caption: message.media().and_then(|m| m.caption.clone()),
        media_url,
        media_id: message.media().map(|m| m.id.clone()),
        media_mime,
        media_size,
        file_name: message.media().and_then(|m| m.filename.clone()),
        status: MessageStatus::Delivered.as_str().to_string(),
        provider_message_id: Some(message.id.clone()),
        created_at: Utc::now(),
    };

    let Some(stored) = inbox::insert_message_idempotent(&mut conn, &record)? else {
        // Redelivery of an envelope already fanned out.
        return Ok(());
    };

    inbox::touch_conversation_incoming(&mut conn, conversation.id, &body_text)?;
    drop(conn);

    if created {
        state
            .realtime
            .emit_org(
                org.id,
                events::NEW_CONVERSATION,
                json!({ "conversation": conversation, "contact": contact }),
            )
            .await;
    }
    let message_json = serde_json::to_value(&stored).unwrap_or_default();
    state
        .realtime
        .emit_org(org.id, events::NEW_MESSAGE, message_json.clone())
        .await;
    state
        .realtime
        .emit(&conv_room(conversation.id), events::NEW_MESSAGE, message_json)
        .await;

    forward_external(state, org, "message", &stored, Some(&contact)).await;

    if chatbot_enabled {
        let engine = FlowEngine::new(Arc::clone(state));
        if let Err(e) = engine
            .handle_inbound(org, &contact, &conversation, message, &stored)
            .await
        {
            error!(
                "interpreter failed tenant={} contact={}: {}",
                org.id, contact.id, e
            );
        }
    }

    Ok(())
}

async fn handle_status(
    state: &Arc<AppState>,
    org: &Organization,
    status: &StatusUpdate,
) -> AppResult<()> {
    let Some(new_status) = MessageStatus::parse(&status.status) else {
        debug!("unknown provider status '{}' ignored", status.status);
        return Ok(());
    };

    let mut conn = state.conn.get()?;
    let updated = inbox::advance_message_status(&mut conn, org.id, &status.id, new_status)?;
    let reconciled =
        broadcast::reconcile_recipient_status(&mut conn, org.id, &status.id, new_status)?;
    drop(conn);

    if let Some(broadcast_id) = reconciled {
        state
            .realtime
            .emit_org(
                org.id,
                events::BROADCAST_STATUS,
                json!({
                    "broadcast_id": broadcast_id,
                    "provider_message_id": status.id,
                    "status": new_status,
                }),
            )
            .await;
    }

    if let Some(message) = updated {
        let data = json!({
            "message_id": message.id,
            "conversation_id": message.conversation_id,
            "provider_message_id": status.id,
            "status": new_status,
        });
        state
            .realtime
            .emit_org(org.id, events::MESSAGE_STATUS, data.clone())
            .await;
        state
            .realtime
            .emit(&conv_room(message.conversation_id), events::MESSAGE_STATUS, data)
            .await;
        forward_external(state, org, "status", &message, None).await;
    }
    Ok(())
}

/// Relays an event to the tenant's own webhook endpoint, signed with the
/// tenant's external secret. Failures are logged, never retried here.
async fn forward_external<T: serde::Serialize>(
    state: &Arc<AppState>,
    org: &Organization,
    event_type: &str,
    data: &T,
    contact: Option<&crate::shared::models::Contact>,
) {
    let Some(url) = org.external_webhook_url.as_deref().filter(|u| !u.is_empty()) else {
        return;
    };
    let mut payload = json!({ "type": event_type, "data": data });
    if let Some(c) = contact {
        payload["contact"] = serde_json::to_value(c).unwrap_or_default();
    }
    let body = payload.to_string();
    let secret = org.external_webhook_secret.clone().unwrap_or_default();
    let signature = sign_sha256(&secret, body.as_bytes());

    let result = state
        .http
        .post(url)
        .header("Content-Type", "application/json")
        .header("X-Hub-Signature-256", signature)
        .body(body)
        .timeout(FORWARD_TIMEOUT)
        .send()
        .await;
    match result {
        Ok(resp) if !resp.status().is_success() => {
            warn!(
                "external forward to {} answered HTTP {} (tenant {})",
                url,
                resp.status(),
                org.id
            );
        }
        Err(e) => warn!("external forward to {} failed: {} (tenant {})", url, e, org.id),
        _ => {}
    }
}

// ---- tenant resolution -----------------------------------------------------

fn resolve_org(
    state: &Arc<AppState>,
    slug: Option<&str>,
    phone_number_id: Option<&str>,
) -> Option<Organization> {
    if let Some(slug) = slug {
        return org_by_slug(state, slug);
    }
    let phone_number_id = phone_number_id?;
    let mut conn = state.conn.get().ok()?;
    organizations::table
        .filter(organizations::phone_number_id.eq(phone_number_id))
        .filter(organizations::subscription_status.eq("active"))
        .select(Organization::as_select())
        .first(&mut conn)
        .optional()
        .ok()?
}

fn org_by_slug(state: &Arc<AppState>, slug: &str) -> Option<Organization> {
    let mut conn = state.conn.get().ok()?;
    organizations::table
        .filter(organizations::slug.eq(slug))
        .select(Organization::as_select())
        .first(&mut conn)
        .optional()
        .ok()?
}

// ---- signatures ------------------------------------------------------------

/// `sha256=<hex hmac>` over the raw body, the provider's convention.
pub fn sign_sha256(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

pub fn signature_matches(body: &[u8], header: Option<&str>, secret: &str) -> bool {
    let Some(header) = header else {
        return false;
    };
    constant_time_eq(header, &sign_sha256(secret, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trips() {
        let body = br#"{"object":"whatsapp_business_account"}"#;
        let sig = sign_sha256("token-secret", body);
        assert!(sig.starts_with("sha256="));
        assert!(signature_matches(body, Some(&sig), "token-secret"));
    }

    #[test]
    fn one_byte_difference_rejects() {
        let body = b"payload-bytes";
        let sig = sign_sha256("s3cret", body);
        let mut tampered = sig.clone().into_bytes();
        let last = tampered.len() - 1;
        tampered[last] = if tampered[last] == b'0' { b'1' } else { b'0' };
        let tampered = String::from_utf8(tampered).unwrap();
        assert!(!signature_matches(body, Some(&tampered), "s3cret"));
        assert!(!signature_matches(b"payload-byteZ", Some(&sig), "s3cret"));
    }

    #[test]
    fn missing_header_rejects() {
        assert!(!signature_matches(b"x", None, "s"));
    }

    #[test]
    fn handshake_requires_matching_token() {
        let params = VerifyParams {
            hub_mode: Some("subscribe".into()),
            hub_verify_token: Some("expected".into()),
            hub_challenge: Some("12345".into()),
        };
        assert_eq!(verify_handshake(&params, "expected").unwrap(), "12345");
        assert!(verify_handshake(&params, "other").is_err());

        let incomplete = VerifyParams {
            hub_mode: Some("subscribe".into()),
            hub_verify_token: None,
            hub_challenge: Some("12345".into()),
        };
        assert!(verify_handshake(&incomplete, "expected").is_err());
    }
}
