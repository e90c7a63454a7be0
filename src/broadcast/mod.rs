//! Broadcast dispatcher: batched, rate-shaped template sends with
//! per-recipient outcomes and webhook-driven status reconciliation.
//!
//! `start` is idempotent: the pending to processing transition is a guarded
//! UPDATE, so a double start (operator click + scheduler tick) runs once.
//! Counters move only through atomic SQL increments, here and in the
//! reconciler.

use crate::inbox;
use crate::provider::envelope::{build_template_components, MediaKind, Outbound};
use crate::provider::CloudApiClient;
use crate::realtime::events;
use crate::shared::errors::{AppError, AppResult};
use crate::shared::models::schema::{broadcast_recipients, broadcasts, contacts, organizations};
use crate::shared::models::{
    Broadcast, BroadcastRecipient, Contact, MessageStatus, NewMessage, Organization,
};
use crate::shared::state::AppState;
use crate::shared::utils::digits_only;
use chrono::Utc;
use diesel::prelude::*;
use futures_util::future::join_all;
use log::{error, info, warn};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const BATCH_SIZE: usize = 50;
const BATCH_PAUSE: Duration = Duration::from_secs(5);

pub struct BroadcastDispatcher {
    state: Arc<AppState>,
}

impl BroadcastDispatcher {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Runs one broadcast to completion. A no-op unless the broadcast is
    /// pending or scheduled.
    pub async fn start(&self, broadcast_id: Uuid) -> AppResult<()> {
        let (broadcast, org) = {
            let mut conn = self.state.conn.get()?;

            // Guarded transition: whoever flips pending/scheduled to
            // processing owns the run.
            let claimed = diesel::update(
                broadcasts::table
                    .filter(broadcasts::id.eq(broadcast_id))
                    .filter(broadcasts::status.eq_any(["pending", "scheduled"])),
            )
            .set((
                broadcasts::status.eq("processing"),
                broadcasts::started_at.eq(Utc::now()),
            ))
            .execute(&mut conn)?;
            if claimed == 0 {
                info!("broadcast {} not startable, skipping", broadcast_id);
                return Ok(());
            }

            let broadcast = broadcasts::table
                .filter(broadcasts::id.eq(broadcast_id))
                .select(Broadcast::as_select())
                .first(&mut conn)?;
            let org = organizations::table
                .filter(organizations::id.eq(broadcast.org_id))
                .select(Organization::as_select())
                .first(&mut conn)?;
            (broadcast, org)
        };

        if !org.subscription().is_active() {
            let mut conn = self.state.conn.get()?;
            diesel::update(broadcasts::table.filter(broadcasts::id.eq(broadcast_id)))
                .set(broadcasts::status.eq("failed"))
                .execute(&mut conn)?;
            return Err(AppError::TenantClosed(format!(
                "tenant {} subscription inactive",
                org.id
            )));
        }

        self.state
            .realtime
            .emit_org(
                org.id,
                events::BROADCAST_STATUS,
                json!({ "broadcast_id": broadcast_id, "status": "processing" }),
            )
            .await;

        let recipients: Vec<BroadcastRecipient> = {
            let mut conn = self.state.conn.get()?;
            broadcast_recipients::table
                .filter(broadcast_recipients::broadcast_id.eq(broadcast_id))
                .filter(broadcast_recipients::status.eq("pending"))
                .order(broadcast_recipients::updated_at.asc())
                .select(BroadcastRecipient::as_select())
                .load(&mut conn)?
        };
        info!(
            "broadcast {} dispatching to {} recipients",
            broadcast_id,
            recipients.len()
        );

        for (batch_index, batch) in recipients.chunks(BATCH_SIZE).enumerate() {
            if batch_index > 0 {
                tokio::time::sleep(BATCH_PAUSE).await;
            }
            // Cancellation between batches: the in-flight batch completed,
            // the job stops here.
            if self.current_status(broadcast_id)? == "cancelled" {
                info!("broadcast {} cancelled, stopping after batch", broadcast_id);
                return Ok(());
            }

            let sends = batch
                .iter()
                .map(|recipient| self.send_recipient(&org, &broadcast, recipient));
            join_all(sends).await;
        }

        {
            let mut conn = self.state.conn.get()?;
            diesel::update(
                broadcasts::table
                    .filter(broadcasts::id.eq(broadcast_id))
                    .filter(broadcasts::status.eq("processing")),
            )
            .set((
                broadcasts::status.eq("completed"),
                broadcasts::completed_at.eq(Utc::now()),
            ))
            .execute(&mut conn)?;
        }
        self.state
            .realtime
            .emit_org(
                org.id,
                events::BROADCAST_STATUS,
                json!({ "broadcast_id": broadcast_id, "status": "completed" }),
            )
            .await;
        Ok(())
    }

    fn current_status(&self, broadcast_id: Uuid) -> AppResult<String> {
        let mut conn = self.state.conn.get()?;
        Ok(broadcasts::table
            .filter(broadcasts::id.eq(broadcast_id))
            .select(broadcasts::status)
            .first(&mut conn)?)
    }

    /// One recipient, one outcome. Failures are recorded and never abort
    /// the campaign.
    async fn send_recipient(
        &self,
        org: &Organization,
        broadcast: &Broadcast,
        recipient: &BroadcastRecipient,
    ) {
        match self.try_send(org, broadcast, recipient).await {
            Ok(provider_id) => {
                if let Err(e) = self.record_sent(broadcast, recipient, &provider_id) {
                    error!(
                        "broadcast {} recipient {} sent but not recorded: {}",
                        broadcast.id, recipient.id, e
                    );
                }
            }
            Err(e) => {
                warn!(
                    "broadcast {} recipient {} failed: {}",
                    broadcast.id, recipient.phone, e
                );
                if let Err(db_err) = self.record_failed(broadcast, recipient, &e.to_string()) {
                    error!(
                        "broadcast {} recipient {} failure not recorded: {}",
                        broadcast.id, recipient.id, db_err
                    );
                }
            }
        }
    }

    async fn try_send(
        &self,
        org: &Organization,
        broadcast: &Broadcast,
        recipient: &BroadcastRecipient,
    ) -> AppResult<String> {
        let header_kind = broadcast
            .header_media_kind
            .as_deref()
            .and_then(MediaKind::parse);
        let header = match (&broadcast.header_media_id, header_kind) {
            (Some(media_id), Some(kind)) if !media_id.is_empty() => Some((kind, media_id.as_str())),
            _ => None,
        };
        let empty = serde_json::Map::new();
        let params = recipient.variables.as_object().unwrap_or(&empty);
        let components =
            build_template_components(header.as_ref().map(|(kind, id)| (kind, *id)), params);

        let outbound = Outbound::Template {
            name: broadcast.template_name.clone(),
            language: broadcast.template_language.clone(),
            components,
        };
        let client = CloudApiClient::for_org(self.state.http.clone(), &self.state.config, org);
        client.send(&digits_only(&recipient.phone), &outbound).await
    }

    fn record_sent(
        &self,
        broadcast: &Broadcast,
        recipient: &BroadcastRecipient,
        provider_id: &str,
    ) -> AppResult<()> {
        let mut conn = self.state.conn.get()?;
        diesel::update(
            broadcast_recipients::table.filter(broadcast_recipients::id.eq(recipient.id)),
        )
        .set((
            broadcast_recipients::status.eq("sent"),
            broadcast_recipients::provider_message_id.eq(provider_id),
            broadcast_recipients::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)?;
        diesel::update(broadcasts::table.filter(broadcasts::id.eq(broadcast.id)))
            .set(broadcasts::sent_count.eq(broadcasts::sent_count + 1))
            .execute(&mut conn)?;

        // Stamp the campaign on the recipient's conversation and mirror the
        // send into the inbox, when the contact already exists.
        if let Some(contact) = contact_by_phone(&mut conn, broadcast.org_id, &recipient.phone)? {
            let (conversation, _) = inbox::open_conversation(&mut conn, broadcast.org_id, contact.id)?;
            inbox::attribute_conversation(&mut conn, conversation.id, broadcast.id, false)?;
            let body = format!("[template: {}]", broadcast.template_name);
            let record = NewMessage {
                id: Uuid::new_v4(),
                org_id: broadcast.org_id,
                conversation_id: conversation.id,
                direction: "out".to_string(),
                kind: "template".to_string(),
                body: body.clone(),
                caption: None,
                media_url: None,
                media_id: broadcast.header_media_id.clone(),
                media_mime: None,
                media_size: None,
                file_name: None,
                status: MessageStatus::Sent.as_str().to_string(),
                provider_message_id: Some(provider_id.to_string()),
                created_at: Utc::now(),
            };
            inbox::insert_message_idempotent(&mut conn, &record)?;
            inbox::touch_conversation_outgoing(&mut conn, conversation.id, &body)?;
        }
        Ok(())
    }

    fn record_failed(
        &self,
        broadcast: &Broadcast,
        recipient: &BroadcastRecipient,
        reason: &str,
    ) -> AppResult<()> {
        let mut conn = self.state.conn.get()?;
        diesel::update(
            broadcast_recipients::table.filter(broadcast_recipients::id.eq(recipient.id)),
        )
        .set((
            broadcast_recipients::status.eq("failed"),
            broadcast_recipients::error.eq(reason),
            broadcast_recipients::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)?;
        diesel::update(broadcasts::table.filter(broadcasts::id.eq(broadcast.id)))
            .set(broadcasts::failed_count.eq(broadcasts::failed_count + 1))
            .execute(&mut conn)?;
        Ok(())
    }
}

/// Marks a broadcast cancelled. Enough before processing starts; a running
/// dispatcher notices between batches.
pub fn cancel(conn: &mut PgConnection, org_id: Uuid, broadcast_id: Uuid) -> AppResult<bool> {
    let updated = diesel::update(
        broadcasts::table
            .filter(broadcasts::id.eq(broadcast_id))
            .filter(broadcasts::org_id.eq(org_id))
            .filter(broadcasts::status.eq_any(["pending", "scheduled", "processing"])),
    )
    .set(broadcasts::status.eq("cancelled"))
    .execute(conn)?;
    Ok(updated > 0)
}

pub fn chatbot_enabled(conn: &mut PgConnection, broadcast_id: Uuid) -> AppResult<bool> {
    Ok(broadcasts::table
        .filter(broadcasts::id.eq(broadcast_id))
        .select(broadcasts::chatbot_enabled)
        .first(conn)
        .optional()?
        .unwrap_or(true))
}

/// Applies a provider status event to the matching recipient, moving the
/// aggregate counters across each threshold exactly once. Returns the
/// broadcast id when something changed.
pub fn reconcile_recipient_status(
    conn: &mut PgConnection,
    org_id: Uuid,
    provider_message_id: &str,
    new_status: MessageStatus,
) -> AppResult<Option<Uuid>> {
    let recipient = broadcast_recipients::table
        .filter(broadcast_recipients::org_id.eq(org_id))
        .filter(broadcast_recipients::provider_message_id.eq(provider_message_id))
        .select(BroadcastRecipient::as_select())
        .first(conn)
        .optional()?;
    let Some(recipient) = recipient else {
        return Ok(None);
    };

    let old = MessageStatus::parse(&recipient.status).unwrap_or(MessageStatus::Pending);
    if !new_status.advances_over(&old) {
        return Ok(None);
    }

    diesel::update(broadcast_recipients::table.filter(broadcast_recipients::id.eq(recipient.id)))
        .set((
            broadcast_recipients::status.eq(new_status.as_str()),
            broadcast_recipients::updated_at.eq(Utc::now()),
        ))
        .execute(conn)?;

    if new_status == MessageStatus::Failed {
        diesel::update(broadcasts::table.filter(broadcasts::id.eq(recipient.broadcast_id)))
            .set(broadcasts::failed_count.eq(broadcasts::failed_count + 1))
            .execute(conn)?;
    } else {
        // A read that arrives before its delivered crosses both thresholds
        // at once; each counter still moves exactly once per recipient.
        if old.rank() < MessageStatus::Delivered.rank()
            && new_status.rank() >= MessageStatus::Delivered.rank()
        {
            diesel::update(broadcasts::table.filter(broadcasts::id.eq(recipient.broadcast_id)))
                .set(broadcasts::delivered_count.eq(broadcasts::delivered_count + 1))
                .execute(conn)?;
        }
        if old.rank() < MessageStatus::Read.rank()
            && new_status.rank() >= MessageStatus::Read.rank()
        {
            diesel::update(broadcasts::table.filter(broadcasts::id.eq(recipient.broadcast_id)))
                .set(broadcasts::read_count.eq(broadcasts::read_count + 1))
                .execute(conn)?;
        }
    }

    Ok(Some(recipient.broadcast_id))
}

fn contact_by_phone(
    conn: &mut PgConnection,
    org_id: Uuid,
    phone: &str,
) -> AppResult<Option<Contact>> {
    Ok(contacts::table
        .filter(contacts::org_id.eq(org_id))
        .filter(contacts::phone.eq(digits_only(phone)))
        .select(Contact::as_select())
        .first(conn)
        .optional()?)
}
