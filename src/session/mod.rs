//! Flow session store: one live execution per (tenant, contact).
//!
//! The (org_id, contact_id) unique index is the arbiter for concurrent
//! creation; the loser of the race adopts the stored winner.

use crate::shared::errors::AppResult;
use crate::shared::models::schema::flow_sessions;
use crate::shared::models::{FlowSession, NewFlowSession};
use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use serde_json::Value;
use uuid::Uuid;

pub fn find_session(
    conn: &mut PgConnection,
    org_id: Uuid,
    contact_id: Uuid,
) -> AppResult<Option<FlowSession>> {
    Ok(flow_sessions::table
        .filter(flow_sessions::org_id.eq(org_id))
        .filter(flow_sessions::contact_id.eq(contact_id))
        .select(FlowSession::as_select())
        .first(conn)
        .optional()?)
}

/// Creates a session, or adopts the one a concurrent worker just created.
pub fn create_session(
    conn: &mut PgConnection,
    org_id: Uuid,
    contact_id: Uuid,
    flow_id: Uuid,
    current_node: Option<&str>,
    variables: Value,
) -> AppResult<FlowSession> {
    let now = Utc::now();
    let record = NewFlowSession {
        id: Uuid::new_v4(),
        org_id,
        contact_id,
        flow_id,
        current_node: current_node.map(String::from),
        variables,
        last_interaction: now,
        created_at: now,
    };
    diesel::insert_into(flow_sessions::table)
        .values(&record)
        .on_conflict((flow_sessions::org_id, flow_sessions::contact_id))
        .do_nothing()
        .execute(conn)?;

    Ok(flow_sessions::table
        .filter(flow_sessions::org_id.eq(org_id))
        .filter(flow_sessions::contact_id.eq(contact_id))
        .select(FlowSession::as_select())
        .first(conn)?)
}

/// Persists the node boundary: current node, variables, interaction time.
pub fn save_session(
    conn: &mut PgConnection,
    session_id: Uuid,
    current_node: Option<&str>,
    variables: &Value,
) -> AppResult<()> {
    diesel::update(flow_sessions::table.filter(flow_sessions::id.eq(session_id)))
        .set((
            flow_sessions::current_node.eq(current_node),
            flow_sessions::variables.eq(variables),
            flow_sessions::last_interaction.eq(Utc::now()),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn delete_session(conn: &mut PgConnection, session_id: Uuid) -> AppResult<()> {
    diesel::delete(flow_sessions::table.filter(flow_sessions::id.eq(session_id)))
        .execute(conn)?;
    Ok(())
}

/// Rebinds an existing session to another flow, clearing its variables.
/// Used when a different flow's trigger keyword arrives mid-session.
pub fn reset_session(
    conn: &mut PgConnection,
    session_id: Uuid,
    flow_id: Uuid,
    current_node: Option<&str>,
    variables: Value,
) -> AppResult<()> {
    diesel::update(flow_sessions::table.filter(flow_sessions::id.eq(session_id)))
        .set((
            flow_sessions::flow_id.eq(flow_id),
            flow_sessions::current_node.eq(current_node),
            flow_sessions::variables.eq(variables),
            flow_sessions::last_interaction.eq(Utc::now()),
        ))
        .execute(conn)?;
    Ok(())
}

/// A session older than its flow's timeout is dead weight: the next inbound
/// event discards it instead of resuming.
pub fn is_stale(last_interaction: DateTime<Utc>, timeout_secs: i32, now: DateTime<Utc>) -> bool {
    if timeout_secs <= 0 {
        return false;
    }
    now - last_interaction > Duration::seconds(timeout_secs as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staleness_respects_timeout() {
        let now = Utc::now();
        let t0 = now - Duration::seconds(15);
        assert!(is_stale(t0, 10, now));
        assert!(!is_stale(t0, 20, now));
    }

    #[test]
    fn zero_timeout_never_expires() {
        let now = Utc::now();
        let old = now - Duration::days(30);
        assert!(!is_stale(old, 0, now));
    }
}
