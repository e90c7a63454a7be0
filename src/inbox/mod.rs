//! Inbox store: contacts, conversations, messages.
//!
//! All functions take an open connection so callers can compose them inside
//! one transaction. Every query is tenant-scoped; counters change through
//! SQL-level increments so concurrent webhook workers cannot lose updates.

use crate::shared::errors::{AppError, AppResult};
use crate::shared::models::schema::{
    broadcast_recipients, broadcasts, contacts, conversations, messages,
};
use crate::shared::models::{
    Contact, Conversation, Message, MessageStatus, NewContact, NewConversation, NewMessage,
};
use crate::shared::utils::{digits_only, preview_of};
use chrono::{Duration, Utc};
use diesel::prelude::*;
use log::debug;
use uuid::Uuid;

/// Window inside which a reply is attributed to a broadcast.
const ATTRIBUTION_WINDOW_HOURS: i64 = 72;

/// Creates the contact on first sight, refreshing the profile name on
/// later messages. (tenant, wa_id) is unique.
pub fn upsert_contact(
    conn: &mut PgConnection,
    org_id: Uuid,
    wa_id: &str,
    phone: &str,
    profile_name: Option<&str>,
) -> AppResult<Contact> {
    let now = Utc::now();
    let record = NewContact {
        id: Uuid::new_v4(),
        org_id,
        wa_id: wa_id.to_string(),
        phone: digits_only(phone),
        profile_name: profile_name.map(String::from),
        labels: Vec::new(),
        created_at: now,
        updated_at: now,
    };

    diesel::insert_into(contacts::table)
        .values(&record)
        .on_conflict((contacts::org_id, contacts::wa_id))
        .do_nothing()
        .execute(conn)?;

    if let Some(name) = profile_name {
        diesel::update(
            contacts::table
                .filter(contacts::org_id.eq(org_id))
                .filter(contacts::wa_id.eq(wa_id))
                .filter(contacts::profile_name.is_null()),
        )
        .set((
            contacts::profile_name.eq(name),
            contacts::updated_at.eq(now),
        ))
        .execute(conn)?;
    }

    Ok(contacts::table
        .filter(contacts::org_id.eq(org_id))
        .filter(contacts::wa_id.eq(wa_id))
        .select(Contact::as_select())
        .first(conn)?)
}

/// Returns the contact's open conversation, creating one when none exists.
/// The bool is true when a new conversation was opened.
pub fn open_conversation(
    conn: &mut PgConnection,
    org_id: Uuid,
    contact_id: Uuid,
) -> AppResult<(Conversation, bool)> {
    let existing = conversations::table
        .filter(conversations::org_id.eq(org_id))
        .filter(conversations::contact_id.eq(contact_id))
        .filter(conversations::status.eq_any(["open", "pending"]))
        .order(conversations::created_at.desc())
        .select(Conversation::as_select())
        .first(conn)
        .optional()?;

    if let Some(conversation) = existing {
        return Ok((conversation, false));
    }

    let now = Utc::now();
    let record = NewConversation {
        id: Uuid::new_v4(),
        org_id,
        contact_id,
        status: "open".to_string(),
        unread_count: 0,
        last_message_at: now,
        created_at: now,
        updated_at: now,
    };
    diesel::insert_into(conversations::table)
        .values(&record)
        .execute(conn)?;

    let conversation = conversations::table
        .filter(conversations::id.eq(record.id))
        .select(Conversation::as_select())
        .first(conn)?;
    Ok((conversation, true))
}

/// Persists a message keyed by provider message id. Returns None when the
/// id was already seen (webhook replay); callers must then skip all
/// follow-up effects for the event.
pub fn insert_message_idempotent(
    conn: &mut PgConnection,
    record: &NewMessage,
) -> AppResult<Option<Message>> {
    let inserted = if record.provider_message_id.is_some() {
        diesel::insert_into(messages::table)
            .values(record)
            .on_conflict(messages::provider_message_id)
            .do_nothing()
            .execute(conn)?
    } else {
        diesel::insert_into(messages::table)
            .values(record)
            .execute(conn)?
    };

    if inserted == 0 {
        debug!(
            "duplicate provider message id {:?}, skipping",
            record.provider_message_id
        );
        return Ok(None);
    }

    Ok(Some(
        messages::table
            .filter(messages::id.eq(record.id))
            .select(Message::as_select())
            .first(conn)?,
    ))
}

/// Updates the conversation list-view fields for an incoming message.
/// The unread counter is an atomic SQL increment.
pub fn touch_conversation_incoming(
    conn: &mut PgConnection,
    conversation_id: Uuid,
    body: &str,
) -> AppResult<()> {
    let now = Utc::now();
    diesel::update(conversations::table.filter(conversations::id.eq(conversation_id)))
        .set((
            conversations::last_preview.eq(preview_of(body)),
            conversations::last_message_at.eq(now),
            conversations::unread_count.eq(conversations::unread_count + 1),
            conversations::updated_at.eq(now),
        ))
        .execute(conn)?;
    Ok(())
}

/// Same as above for outgoing messages: preview moves, unread does not.
pub fn touch_conversation_outgoing(
    conn: &mut PgConnection,
    conversation_id: Uuid,
    body: &str,
) -> AppResult<()> {
    let now = Utc::now();
    diesel::update(conversations::table.filter(conversations::id.eq(conversation_id)))
        .set((
            conversations::last_preview.eq(preview_of(body)),
            conversations::last_message_at.eq(now),
            conversations::updated_at.eq(now),
        ))
        .execute(conn)?;
    Ok(())
}

/// Monotone status advance by provider message id. Returns the updated
/// message, or None when the update was a downgrade or the id is unknown.
pub fn advance_message_status(
    conn: &mut PgConnection,
    org_id: Uuid,
    provider_message_id: &str,
    new_status: MessageStatus,
) -> AppResult<Option<Message>> {
    let current = messages::table
        .filter(messages::org_id.eq(org_id))
        .filter(messages::provider_message_id.eq(provider_message_id))
        .select(Message::as_select())
        .first(conn)
        .optional()?;

    let Some(message) = current else {
        return Ok(None);
    };

    if !new_status.advances_over(&message.message_status()) {
        return Ok(None);
    }

    diesel::update(messages::table.filter(messages::id.eq(message.id)))
        .set(messages::status.eq(new_status.as_str()))
        .execute(conn)?;

    Ok(Some(Message {
        status: new_status.as_str().to_string(),
        ..message
    }))
}

/// Zeroes the unread counter and marks exactly the listed inbound messages
/// read. Outbound ids in the list are ignored.
pub fn mark_read(
    conn: &mut PgConnection,
    org_id: Uuid,
    conversation_id: Uuid,
    message_ids: &[Uuid],
) -> AppResult<usize> {
    let updated_conversations =
        diesel::update(
            conversations::table
                .filter(conversations::id.eq(conversation_id))
                .filter(conversations::org_id.eq(org_id)),
        )
        .set((
            conversations::unread_count.eq(0),
            conversations::updated_at.eq(Utc::now()),
        ))
        .execute(conn)?;
    if updated_conversations == 0 {
        return Err(AppError::NotFound("conversation not found".to_string()));
    }

    let marked = diesel::update(
        messages::table
            .filter(messages::org_id.eq(org_id))
            .filter(messages::conversation_id.eq(conversation_id))
            .filter(messages::id.eq_any(message_ids))
            .filter(messages::direction.eq("in")),
    )
    .set(messages::status.eq(MessageStatus::Read.as_str()))
    .execute(conn)?;

    Ok(marked)
}

/// The most recent broadcast that targeted this phone inside the
/// attribution window. Returns (broadcast id, chatbot enabled).
pub fn recent_broadcast_for_phone(
    conn: &mut PgConnection,
    org_id: Uuid,
    phone: &str,
) -> AppResult<Option<(Uuid, bool)>> {
    let cutoff = Utc::now() - Duration::hours(ATTRIBUTION_WINDOW_HOURS);
    let row = broadcast_recipients::table
        .inner_join(broadcasts::table.on(broadcasts::id.eq(broadcast_recipients::broadcast_id)))
        .filter(broadcast_recipients::org_id.eq(org_id))
        .filter(broadcast_recipients::phone.eq(digits_only(phone)))
        .filter(broadcast_recipients::updated_at.gt(cutoff))
        .filter(broadcast_recipients::provider_message_id.is_not_null())
        .order(broadcast_recipients::updated_at.desc())
        .select((broadcasts::id, broadcasts::chatbot_enabled))
        .first::<(Uuid, bool)>(conn)
        .optional()?;
    Ok(row)
}

/// Stamps the broadcast on the conversation, once. `count_reply` is set on
/// the first inbound reply path so the campaign's reply counter moves; the
/// dispatcher's send-time attribution passes false.
pub fn attribute_conversation(
    conn: &mut PgConnection,
    conversation_id: Uuid,
    broadcast_id: Uuid,
    count_reply: bool,
) -> AppResult<bool> {
    let stamped = diesel::update(
        conversations::table
            .filter(conversations::id.eq(conversation_id))
            .filter(conversations::broadcast_id.is_null()),
    )
    .set(conversations::broadcast_id.eq(broadcast_id))
    .execute(conn)?;

    if stamped > 0 && count_reply {
        diesel::update(broadcasts::table.filter(broadcasts::id.eq(broadcast_id)))
            .set(broadcasts::replied_count.eq(broadcasts::replied_count + 1))
            .execute(conn)?;
    }
    Ok(stamped > 0)
}

pub fn set_conversation_status(
    conn: &mut PgConnection,
    org_id: Uuid,
    conversation_id: Uuid,
    status: &str,
) -> AppResult<()> {
    let updated = diesel::update(
        conversations::table
            .filter(conversations::id.eq(conversation_id))
            .filter(conversations::org_id.eq(org_id)),
    )
    .set((
        conversations::status.eq(status),
        conversations::updated_at.eq(Utc::now()),
    ))
    .execute(conn)?;
    if updated == 0 {
        return Err(AppError::NotFound("conversation not found".to_string()));
    }
    Ok(())
}

/// Contact mutations from the `update_contact` flow node.
pub fn update_contact_fields(
    conn: &mut PgConnection,
    org_id: Uuid,
    contact_id: Uuid,
    display_name: Option<&str>,
    email: Option<&str>,
    add_labels: &[String],
) -> AppResult<()> {
    let now = Utc::now();
    if let Some(name) = display_name {
        diesel::update(
            contacts::table
                .filter(contacts::id.eq(contact_id))
                .filter(contacts::org_id.eq(org_id)),
        )
        .set((contacts::display_name.eq(name), contacts::updated_at.eq(now)))
        .execute(conn)?;
    }
    if let Some(email) = email {
        diesel::update(
            contacts::table
                .filter(contacts::id.eq(contact_id))
                .filter(contacts::org_id.eq(org_id)),
        )
        .set((contacts::email.eq(email), contacts::updated_at.eq(now)))
        .execute(conn)?;
    }
    if !add_labels.is_empty() {
        let contact = contacts::table
            .filter(contacts::id.eq(contact_id))
            .filter(contacts::org_id.eq(org_id))
            .select(Contact::as_select())
            .first(conn)?;
        let mut labels: Vec<Option<String>> = contact.labels;
        for label in add_labels {
            if !labels.iter().flatten().any(|l| l == label) {
                labels.push(Some(label.clone()));
            }
        }
        diesel::update(contacts::table.filter(contacts::id.eq(contact_id)))
            .set((contacts::labels.eq(labels), contacts::updated_at.eq(now)))
            .execute(conn)?;
    }
    Ok(())
}

pub fn conversation_by_id(
    conn: &mut PgConnection,
    org_id: Uuid,
    conversation_id: Uuid,
) -> AppResult<Conversation> {
    Ok(conversations::table
        .filter(conversations::id.eq(conversation_id))
        .filter(conversations::org_id.eq(org_id))
        .select(Conversation::as_select())
        .first(conn)?)
}
