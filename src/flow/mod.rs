//! Chatbot flow interpreter.
//!
//! A flow is a directed graph of typed nodes (see [`nodes`]). One engine
//! invocation handles one inbound event for one (tenant, contact): it either
//! starts a new session at the flow's entry or resumes a suspended one,
//! walks nodes until the graph ends or an input-awaiting node suspends, and
//! persists the session at every boundary. The walk is capped per
//! invocation so a miswired graph cannot spin.

pub mod exec;
pub mod nodes;
pub mod services;
pub mod vars;

use crate::session;
use crate::shared::errors::{AppError, AppResult};
use crate::shared::models::schema::flows;
use crate::shared::models::{Contact, Conversation, Flow, FlowSession, Message, Organization};
use crate::shared::state::AppState;
use crate::webhook::payload::IncomingMessage;
use chrono::Utc;
use chrono_tz::Tz;
use diesel::prelude::*;
use log::{debug, info, warn};
use nodes::{FlowGraph, FlowNode, NodeKind};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;
use vars::VariableBag;

/// Per-invocation node budget.
const STEP_CAP: usize = 30;

// Reserved bag keys (never rendered to the contact).
pub(crate) const PENDING_BUTTONS: &str = "_pendingButtons";
pub(crate) const LIST_ROWS: &str = "_listRows";
pub(crate) const LIST_PAGE: &str = "_listPage";
pub(crate) const WAITING_FLOW: &str = "_waitingFlow";

/// What a node execution decided.
pub enum StepOutcome {
    /// Proceed along the edge selected by this handle (None = default).
    Continue(Option<String>),
    /// Session persisted at the current node; stop until the next event.
    Suspend,
    /// Invocation over, session deleted (hand-off or graph end).
    Terminate,
}

pub struct ExecCtx {
    pub org: Organization,
    pub contact: Contact,
    pub conversation: Conversation,
    pub flow: Flow,
    pub graph: FlowGraph,
    pub session_id: Uuid,
    pub bag: VariableBag,
}

pub struct FlowEngine {
    state: Arc<AppState>,
}

impl FlowEngine {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub(crate) fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Single entry point: one inbound event, one invocation.
    pub async fn handle_inbound(
        &self,
        org: &Organization,
        contact: &Contact,
        conversation: &Conversation,
        inbound: &IncomingMessage,
        stored: &Message,
    ) -> AppResult<()> {
        let text = inbound.display_text();
        let mut conn = self.state.conn.get()?;

        let all_flows: Vec<Flow> = flows::table
            .filter(flows::org_id.eq(org.id))
            .filter(flows::is_active.eq(true))
            .select(Flow::as_select())
            .load(&mut conn)?;
        if all_flows.is_empty() {
            return Ok(());
        }

        let existing = session::find_session(&mut conn, org.id, contact.id)?;

        // Exact trigger keyword beats everything, including a live session
        // on another flow: the contact asked for a fresh start.
        if let Some(flow) = match_trigger_keyword(&all_flows, &text) {
            if !within_working_hours(flow) {
                debug!("flow '{}' outside working hours, no session", flow.name);
                return Ok(());
            }
            let flow = flow.clone();
            drop(conn);
            return self
                .start_session(org, contact, conversation, flow, existing, inbound, stored)
                .await;
        }

        if let Some(sess) = existing {
            let flow = all_flows.iter().find(|f| f.id == sess.flow_id).cloned();
            // A session_config node can override the flow-level timeout.
            let timeout_override = sess
                .variables
                .get("_sessionTimeout")
                .and_then(|v| v.as_i64())
                .map(|v| v as i32);
            match flow {
                Some(flow)
                    if !session::is_stale(
                        sess.last_interaction,
                        timeout_override.unwrap_or(flow.session_timeout_secs),
                        Utc::now(),
                    ) =>
                {
                    drop(conn);
                    return self
                        .resume_session(org, contact, conversation, flow, sess, inbound, stored)
                        .await;
                }
                _ => {
                    // Stale or orphaned: discard and fall through to entry
                    // resolution so a fallback flow can take over.
                    info!(
                        "discarding stale session {} for contact {}",
                        sess.id, contact.id
                    );
                    session::delete_session(&mut conn, sess.id)?;
                }
            }
        }

        let Some(flow) = resolve_entry_flow(&all_flows, &text) else {
            return Ok(());
        };
        if !within_working_hours(flow) {
            debug!("flow '{}' outside working hours, no session", flow.name);
            return Ok(());
        }
        let flow = flow.clone();
        drop(conn);
        self.start_session(org, contact, conversation, flow, None, inbound, stored)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn start_session(
        &self,
        org: &Organization,
        contact: &Contact,
        conversation: &Conversation,
        flow: Flow,
        existing: Option<FlowSession>,
        inbound: &IncomingMessage,
        stored: &Message,
    ) -> AppResult<()> {
        let graph = FlowGraph::parse(&flow.definition)
            .map_err(|e| AppError::Internal(format!("flow '{}' unparseable: {}", flow.name, e)))?;
        let Some(entry) = graph.entry_node() else {
            warn!("flow '{}' has no entry node", flow.name);
            return Ok(());
        };
        let entry_id = entry.id.clone();

        let mut conn = self.state.conn.get()?;
        let session_id = match existing {
            Some(sess) => {
                session::reset_session(
                    &mut conn,
                    sess.id,
                    flow.id,
                    Some(&entry_id),
                    Value::Object(Default::default()),
                )?;
                sess.id
            }
            None => {
                session::create_session(
                    &mut conn,
                    org.id,
                    contact.id,
                    flow.id,
                    Some(&entry_id),
                    Value::Object(Default::default()),
                )?
                .id
            }
        };
        drop(conn);

        let mut ctx = ExecCtx {
            org: org.clone(),
            contact: contact.clone(),
            conversation: conversation.clone(),
            flow,
            graph,
            session_id,
            bag: VariableBag::new(),
        };
        inject_system_vars(&mut ctx.bag, contact, inbound, stored);

        self.run_from(&mut ctx, entry_id).await
    }

    async fn resume_session(
        &self,
        org: &Organization,
        contact: &Contact,
        conversation: &Conversation,
        flow: Flow,
        sess: FlowSession,
        inbound: &IncomingMessage,
        stored: &Message,
    ) -> AppResult<()> {
        let graph = FlowGraph::parse(&flow.definition)
            .map_err(|e| AppError::Internal(format!("flow '{}' unparseable: {}", flow.name, e)))?;

        let Some(current_id) = sess.current_node.clone() else {
            let mut conn = self.state.conn.get()?;
            session::delete_session(&mut conn, sess.id)?;
            return Ok(());
        };
        let Some(node) = graph.node(&current_id).cloned() else {
            warn!("session {} points at missing node '{}'", sess.id, current_id);
            let mut conn = self.state.conn.get()?;
            session::delete_session(&mut conn, sess.id)?;
            return Ok(());
        };

        let mut ctx = ExecCtx {
            org: org.clone(),
            contact: contact.clone(),
            conversation: conversation.clone(),
            flow,
            graph,
            session_id: sess.id,
            bag: VariableBag::from_json(sess.variables),
        };
        inject_system_vars(&mut ctx.bag, contact, inbound, stored);

        let outcome = self.resume_node(&mut ctx, &node, inbound).await;
        self.continue_after(&mut ctx, &node, outcome).await
    }

    /// Applies a step outcome and keeps walking.
    async fn continue_after(
        &self,
        ctx: &mut ExecCtx,
        node: &FlowNode,
        outcome: AppResult<StepOutcome>,
    ) -> AppResult<()> {
        match self.settle(ctx, node, outcome).await? {
            Some(next_id) => self.run_from(ctx, next_id).await,
            None => Ok(()),
        }
    }

    /// The cooperative walk. Executes nodes until suspension, termination,
    /// a dead end, or the step cap.
    async fn run_from(&self, ctx: &mut ExecCtx, start_id: String) -> AppResult<()> {
        let mut current = Some(start_id);
        let mut steps = 0usize;

        while let Some(node_id) = current {
            steps += 1;
            if steps > STEP_CAP {
                warn!(
                    "flow '{}' hit the {}-node step cap, suspending session {}",
                    ctx.flow.name, STEP_CAP, ctx.session_id
                );
                self.persist(ctx, Some(&node_id)).await?;
                return Ok(());
            }

            let Some(node) = ctx.graph.node(&node_id).cloned() else {
                debug!("edge points at unknown node '{}', terminating", node_id);
                self.terminate(ctx).await?;
                return Ok(());
            };

            let outcome = self.execute_node(ctx, &node).await;
            match self.settle(ctx, &node, outcome).await? {
                Some(next_id) => current = Some(next_id),
                None => return Ok(()),
            }
        }

        self.terminate(ctx).await
    }

    /// Translates a step outcome into the next node id. `None` means the
    /// invocation is over (suspended, terminated, or failed safely).
    async fn settle(
        &self,
        ctx: &mut ExecCtx,
        node: &FlowNode,
        outcome: AppResult<StepOutcome>,
    ) -> AppResult<Option<String>> {
        match outcome {
            Ok(StepOutcome::Continue(handle)) => {
                let next = ctx
                    .graph
                    .next_node_id(&node.id, handle.as_deref())
                    .map(String::from);
                match next {
                    Some(next_id) => Ok(Some(next_id)),
                    None => {
                        // No edge for the selected handle: the graph ends.
                        self.terminate(ctx).await?;
                        Ok(None)
                    }
                }
            }
            Ok(StepOutcome::Suspend) => {
                self.persist(ctx, Some(&node.id)).await?;
                Ok(None)
            }
            Ok(StepOutcome::Terminate) => {
                self.terminate(ctx).await?;
                Ok(None)
            }
            Err(e) => {
                warn!(
                    "node '{}' failed in flow '{}' (tenant {}): {}",
                    node.id, ctx.flow.name, ctx.org.id, e
                );
                if let Some(fail_id) = ctx.graph.fail_next(&node.id).map(String::from) {
                    Ok(Some(fail_id))
                } else {
                    // Preserve the session for a later retry; end this
                    // invocation.
                    self.persist(ctx, Some(&node.id)).await?;
                    Ok(None)
                }
            }
        }
    }

    pub(crate) async fn persist(&self, ctx: &ExecCtx, node_id: Option<&str>) -> AppResult<()> {
        let mut conn = self.state.conn.get()?;
        session::save_session(&mut conn, ctx.session_id, node_id, &ctx.bag.to_json())
    }

    pub(crate) async fn terminate(&self, ctx: &ExecCtx) -> AppResult<()> {
        let mut conn = self.state.conn.get()?;
        session::delete_session(&mut conn, ctx.session_id)?;
        debug!(
            "session {} terminated (flow '{}')",
            ctx.session_id, ctx.flow.name
        );
        Ok(())
    }
}

// ---- entry resolution ------------------------------------------------------

fn normalized_trigger(text: &str) -> String {
    text.trim().to_uppercase()
}

/// Exact trigger-keyword match, upper-cased and trimmed.
pub fn match_trigger_keyword<'a>(all_flows: &'a [Flow], text: &str) -> Option<&'a Flow> {
    let needle = normalized_trigger(text);
    if needle.is_empty() {
        return None;
    }
    all_flows.iter().find(|f| {
        f.trigger_keyword
            .as_deref()
            .map(|kw| kw != "*" && normalized_trigger(kw) == needle)
            .unwrap_or(false)
    })
}

/// Fallback order once no exact trigger and no live session matched:
/// catch-all `*` trigger, then a flow whose `start_trigger` node accepts
/// the text, then the tenant default.
pub fn resolve_entry_flow<'a>(all_flows: &'a [Flow], text: &str) -> Option<&'a Flow> {
    if let Some(flow) = all_flows
        .iter()
        .find(|f| f.trigger_keyword.as_deref() == Some("*"))
    {
        return Some(flow);
    }

    for flow in all_flows {
        let Ok(graph) = FlowGraph::parse(&flow.definition) else {
            continue;
        };
        if let Some(node) = graph.start_trigger() {
            if let NodeKind::StartTrigger(cfg) = &node.kind {
                if cfg.accepts_any() || cfg.match_keyword(text).is_some() {
                    return Some(flow);
                }
            }
        }
    }

    all_flows.iter().find(|f| f.is_default)
}

/// Working hours gate, evaluated at entry only.
pub fn within_working_hours(flow: &Flow) -> bool {
    let Some(raw) = &flow.working_hours else {
        return true;
    };
    let Ok(cfg) = serde_json::from_value::<nodes::BusinessHoursConfig>(raw.clone()) else {
        return true;
    };
    if cfg.days.is_empty() {
        return true;
    }
    let tz: Tz = match cfg.timezone.parse() {
        Ok(tz) => tz,
        Err(_) => return true,
    };
    let now = Utc::now().with_timezone(&tz);
    let weekday = now.format("%a").to_string().to_lowercase();
    cfg.is_open_at(&weekday, now.time())
}

/// System variables injected at the start of every invocation; node effects
/// override them within the step.
pub fn inject_system_vars(
    bag: &mut VariableBag,
    contact: &Contact,
    inbound: &IncomingMessage,
    stored: &Message,
) {
    let text = inbound.display_text();
    bag.set_str("sender_mobile", contact.phone.clone());
    bag.set_str("sender_name", contact.known_name());
    bag.set_str("last_input", text.clone());
    bag.set_str("last_response", text);
    bag.set_str("last_message_type", inbound.message_type.clone());
    if let Some(media) = inbound.media() {
        bag.set_str("last_media_id", media.id.clone());
        if let Some(url) = &stored.media_url {
            bag.set_str("last_media_url", url.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flow(
        name: &str,
        trigger: Option<&str>,
        is_default: bool,
        definition: Value,
    ) -> Flow {
        Flow {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            name: name.to_string(),
            definition,
            trigger_keyword: trigger.map(String::from),
            is_default,
            working_hours: None,
            session_timeout_secs: 3600,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn trigger_def(keywords: Vec<&str>, trigger_on: &str) -> Value {
        json!({
            "nodes": [
                {"id": "t", "type": "start_trigger",
                 "data": {"keywords": keywords, "triggerOn": trigger_on}},
                {"id": "m", "type": "message", "data": {"text": "hello"}},
            ],
            "edges": [{"source": "t", "target": "m"}]
        })
    }

    #[test]
    fn trigger_keyword_matches_case_insensitively() {
        let fs = vec![
            flow("greet", Some("HI"), false, trigger_def(vec![], "any")),
            flow("order", Some("ORDER"), false, trigger_def(vec![], "any")),
        ];
        assert_eq!(match_trigger_keyword(&fs, " hi ").unwrap().name, "greet");
        assert_eq!(match_trigger_keyword(&fs, "order").unwrap().name, "order");
        assert!(match_trigger_keyword(&fs, "hi there").is_none());
    }

    #[test]
    fn catch_all_wins_entry_resolution() {
        let fs = vec![
            flow("default", None, true, trigger_def(vec![], "keyword")),
            flow("catch", Some("*"), false, trigger_def(vec![], "keyword")),
        ];
        assert_eq!(resolve_entry_flow(&fs, "anything").unwrap().name, "catch");
    }

    #[test]
    fn start_trigger_keywords_beat_default() {
        let fs = vec![
            flow("fallback", None, true, trigger_def(vec![], "keyword")),
            flow(
                "menu",
                None,
                false,
                trigger_def(vec!["menu", "help"], "keyword"),
            ),
        ];
        assert_eq!(resolve_entry_flow(&fs, "MENU").unwrap().name, "menu");
        assert_eq!(resolve_entry_flow(&fs, "whatever").unwrap().name, "fallback");
    }

    #[test]
    fn start_trigger_any_accepts_everything() {
        let fs = vec![
            flow("fallback", None, true, trigger_def(vec![], "keyword")),
            flow("any", None, false, trigger_def(vec![], "any")),
        ];
        assert_eq!(resolve_entry_flow(&fs, "xyzzy").unwrap().name, "any");
    }

    #[test]
    fn no_match_and_no_default_yields_none() {
        let fs = vec![flow(
            "menu",
            None,
            false,
            trigger_def(vec!["menu"], "keyword"),
        )];
        assert!(resolve_entry_flow(&fs, "bye").is_none());
    }

    #[test]
    fn missing_working_hours_is_always_open() {
        let f = flow("x", None, false, trigger_def(vec![], "any"));
        assert!(within_working_hours(&f));
    }

    #[test]
    fn closed_day_blocks_entry() {
        let mut f = flow("x", None, false, trigger_def(vec![], "any"));
        // Every weekday disabled: always closed.
        f.working_hours = Some(json!({
            "timezone": "UTC",
            "days": {
                "mon": {"enabled": false, "open": "09:00", "close": "18:00"},
                "tue": {"enabled": false, "open": "09:00", "close": "18:00"},
                "wed": {"enabled": false, "open": "09:00", "close": "18:00"},
                "thu": {"enabled": false, "open": "09:00", "close": "18:00"},
                "fri": {"enabled": false, "open": "09:00", "close": "18:00"},
                "sat": {"enabled": false, "open": "09:00", "close": "18:00"},
                "sun": {"enabled": false, "open": "09:00", "close": "18:00"},
            }
        }));
        assert!(!within_working_hours(&f));
    }

    #[test]
    fn all_day_window_allows_entry() {
        let mut f = flow("x", None, false, trigger_def(vec![], "any"));
        let day = json!({"enabled": true, "open": "00:00", "close": "23:59"});
        let days: serde_json::Map<String, Value> = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"]
            .iter()
            .map(|d| (d.to_string(), day.clone()))
            .collect();
        f.working_hours = Some(json!({ "timezone": "UTC", "days": days }));
        assert!(within_working_hours(&f));
    }
}
