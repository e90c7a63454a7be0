//! Internal HTTP surface consumed by the operator UI collaborator and the
//! API-key-authenticated external send endpoints.

use crate::broadcast::{self, BroadcastDispatcher};
use crate::inbox;
use crate::provider::envelope::{build_template_components, MediaKind, Outbound};
use crate::provider::CloudApiClient;
use crate::realtime::{conv_room, events};
use crate::shared::errors::{AppError, AppResult};
use crate::shared::models::schema::{messages, organizations};
use crate::shared::models::{MessageStatus, NewMessage, Organization};
use crate::shared::state::AppState;
use crate::shared::utils::digits_only;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use diesel::prelude::*;
use log::info;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/integrations/send", post(send_text))
        .route("/integrations/send-template", post(send_template))
        .route("/broadcasts/:id/start", post(start_broadcast))
        .route("/broadcasts/:id/cancel", post(cancel_broadcast))
        .route("/conversations/:id/read", post(mark_conversation_read))
}

async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let db_ok = state.conn.get().is_ok();
    let status = if db_ok { "healthy" } else { "degraded" };
    let code = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(json!({
            "status": status,
            "service": "waserver",
            "version": env!("CARGO_PKG_VERSION"),
            "database": db_ok,
        })),
    )
}

/// Resolves the calling tenant from `X-API-Key` (or a bearer token carrying
/// the key). JWT-authenticated operator traffic terminates in the auth
/// collaborator before it reaches these handlers.
fn authenticate(state: &AppState, headers: &HeaderMap) -> AppResult<Organization> {
    let key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(String::from)
        })
        .ok_or_else(|| AppError::Auth("missing API key".to_string()))?;

    let mut conn = state.conn.get()?;
    let org = organizations::table
        .filter(organizations::api_key.eq(&key))
        .select(Organization::as_select())
        .first(&mut conn)
        .optional()?
        .ok_or_else(|| AppError::Auth("unknown API key".to_string()))?;

    if !org.subscription().is_active() {
        return Err(AppError::TenantClosed(format!(
            "subscription is {}",
            org.subscription_status
        )));
    }
    Ok(org)
}

#[derive(Debug, Deserialize)]
struct SendTextRequest {
    to: String,
    message: String,
}

async fn send_text(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SendTextRequest>,
) -> AppResult<Json<Value>> {
    let org = authenticate(&state, &headers)?;
    let to = digits_only(&req.to);
    if to.is_empty() || req.message.trim().is_empty() {
        return Err(AppError::Validation("to and message are required".to_string()));
    }

    let outbound = Outbound::Text {
        body: req.message.clone(),
    };
    let client = CloudApiClient::for_org(state.http.clone(), &state.config, &org);
    let provider_id = client.send(&to, &outbound).await?;

    record_outgoing(&state, &org, &to, &outbound, &provider_id).await?;
    Ok(Json(json!({ "message_id": provider_id })))
}

#[derive(Debug, Deserialize)]
struct SendTemplateRequest {
    to: String,
    template_name: String,
    #[serde(default = "default_language")]
    language: String,
    #[serde(default)]
    params: serde_json::Map<String, Value>,
    #[serde(default)]
    header_media_id: Option<String>,
    #[serde(default)]
    header_media_type: Option<String>,
}

fn default_language() -> String {
    "en".to_string()
}

async fn send_template(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SendTemplateRequest>,
) -> AppResult<Json<Value>> {
    let org = authenticate(&state, &headers)?;
    let to = digits_only(&req.to);
    if to.is_empty() || req.template_name.trim().is_empty() {
        return Err(AppError::Validation(
            "to and template_name are required".to_string(),
        ));
    }

    let header_kind = req
        .header_media_type
        .as_deref()
        .and_then(MediaKind::parse);
    let header = match (&req.header_media_id, header_kind) {
        (Some(id), Some(kind)) if !id.is_empty() => Some((kind, id.as_str())),
        _ => None,
    };
    let components =
        build_template_components(header.as_ref().map(|(kind, id)| (kind, *id)), &req.params);

    let outbound = Outbound::Template {
        name: req.template_name.clone(),
        language: req.language.clone(),
        components,
    };
    let client = CloudApiClient::for_org(state.http.clone(), &state.config, &org);
    let provider_id = client.send(&to, &outbound).await?;

    record_outgoing(&state, &org, &to, &outbound, &provider_id).await?;
    Ok(Json(json!({ "message_id": provider_id })))
}

/// Mirrors an API-initiated send into the inbox when the recipient is a
/// known contact, and notifies operator sockets.
async fn record_outgoing(
    state: &Arc<AppState>,
    org: &Organization,
    to: &str,
    outbound: &Outbound,
    provider_id: &str,
) -> AppResult<()> {
    use crate::shared::models::schema::contacts;
    let mut conn = state.conn.get()?;
    let contact_id: Option<Uuid> = contacts::table
        .filter(contacts::org_id.eq(org.id))
        .filter(contacts::phone.eq(to))
        .select(contacts::id)
        .first(&mut conn)
        .optional()?;
    let Some(contact_id) = contact_id else {
        return Ok(());
    };

    let (conversation, _) = inbox::open_conversation(&mut conn, org.id, contact_id)?;
    let body = outbound.preview_body();
    let record = NewMessage {
        id: Uuid::new_v4(),
        org_id: org.id,
        conversation_id: conversation.id,
        direction: "out".to_string(),
        kind: outbound.kind().as_str().to_string(),
        body: body.clone(),
        caption: None,
        media_url: None,
        media_id: None,
        media_mime: None,
        media_size: None,
        file_name: None,
        status: MessageStatus::Sent.as_str().to_string(),
        provider_message_id: Some(provider_id.to_string()),
        created_at: Utc::now(),
    };
    let stored = inbox::insert_message_idempotent(&mut conn, &record)?;
    inbox::touch_conversation_outgoing(&mut conn, conversation.id, &body)?;
    drop(conn);

    if let Some(message) = stored {
        let message_json = serde_json::to_value(&message).unwrap_or_default();
        state
            .realtime
            .emit_org(org.id, events::NEW_MESSAGE, message_json.clone())
            .await;
        state
            .realtime
            .emit(&conv_room(conversation.id), events::NEW_MESSAGE, message_json)
            .await;
    }
    Ok(())
}

async fn start_broadcast(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Value>> {
    let org = authenticate(&state, &headers)?;
    // Tenant scope check before handing off to the dispatcher.
    {
        use crate::shared::models::schema::broadcasts;
        let mut conn = state.conn.get()?;
        let owned: i64 = broadcasts::table
            .filter(broadcasts::id.eq(id))
            .filter(broadcasts::org_id.eq(org.id))
            .count()
            .get_result(&mut conn)?;
        if owned == 0 {
            return Err(AppError::NotFound("broadcast not found".to_string()));
        }
    }

    info!("broadcast {} start requested by tenant {}", id, org.id);
    let dispatcher = BroadcastDispatcher::new(Arc::clone(&state));
    tokio::spawn(async move {
        if let Err(e) = dispatcher.start(id).await {
            log::error!("broadcast {} failed: {}", id, e);
        }
    });
    Ok(Json(json!({ "status": "started" })))
}

async fn cancel_broadcast(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Value>> {
    let org = authenticate(&state, &headers)?;
    let mut conn = state.conn.get()?;
    let cancelled = broadcast::cancel(&mut conn, org.id, id)?;
    if !cancelled {
        return Err(AppError::Conflict(
            "broadcast is not cancellable in its current state".to_string(),
        ));
    }
    Ok(Json(json!({ "status": "cancelled" })))
}

#[derive(Debug, Deserialize)]
struct MarkReadRequest {
    #[serde(default)]
    message_ids: Vec<Uuid>,
}

async fn mark_conversation_read(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<MarkReadRequest>,
) -> AppResult<Json<Value>> {
    let org = authenticate(&state, &headers)?;
    let mut conn = state.conn.get()?;
    let marked = inbox::mark_read(&mut conn, org.id, id, &req.message_ids)?;

    // Blue ticks at the provider, best effort.
    let provider_ids: Vec<String> = messages::table
        .filter(messages::org_id.eq(org.id))
        .filter(messages::id.eq_any(&req.message_ids))
        .filter(messages::direction.eq("in"))
        .select(messages::provider_message_id)
        .load::<Option<String>>(&mut conn)?
        .into_iter()
        .flatten()
        .collect();
    drop(conn);

    let client = CloudApiClient::for_org(state.http.clone(), &state.config, &org);
    for provider_id in provider_ids {
        let _ = client.mark_read(&provider_id).await;
    }

    state
        .realtime
        .emit(
            &conv_room(id),
            events::MESSAGE_STATUS,
            json!({ "conversation_id": id, "status": "read", "count": marked }),
        )
        .await;
    Ok(Json(json!({ "marked": marked })))
}
