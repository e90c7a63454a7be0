//! Node execution and resume interpretation.
//!
//! `execute_node` runs a node's effect when the walk reaches it;
//! `resume_node` interprets the inbound event for the node a session was
//! suspended on. Both return a [`StepOutcome`] the engine turns into edge
//! selection.

use super::nodes::*;
use super::vars::VariableBag;
use super::{ExecCtx, FlowEngine, StepOutcome, LIST_PAGE, LIST_ROWS, PENDING_BUTTONS, WAITING_FLOW};
use super::services::OrderProvider;
use crate::inbox;
use crate::provider::envelope::{MediaKind, MediaSource, Outbound};
use crate::provider::CloudApiClient;
use crate::realtime::{conv_room, events};
use crate::shared::errors::{AppError, AppResult};
use crate::shared::models::{MessageStatus, NewMessage};
use crate::shared::utils::{digits_only, normalize_drive_url};
use crate::webhook::payload::IncomingMessage;
use chrono::Utc;
use chrono_tz::Tz;
use log::{debug, warn};
use regex::Regex;
use serde_json::{json, Value};
use std::time::Duration;
use uuid::Uuid;

/// Upper bound for `delay` nodes so one session cannot pin a worker.
const MAX_DELAY_SECS: u64 = 300;

impl FlowEngine {
    pub(crate) async fn execute_node(
        &self,
        ctx: &mut ExecCtx,
        node: &FlowNode,
    ) -> AppResult<StepOutcome> {
        match &node.kind {
            NodeKind::StartTrigger(cfg) => self.exec_start_trigger(ctx, node, cfg),
            NodeKind::Message(cfg) => {
                let text = ctx.bag.render(&cfg.text);
                self.send_to_contact(ctx, &Outbound::Text { body: text }).await?;
                Ok(StepOutcome::Continue(None))
            }
            NodeKind::Image(cfg) => self.exec_media(ctx, cfg, MediaKind::Image).await,
            NodeKind::Video(cfg) => self.exec_media(ctx, cfg, MediaKind::Video).await,
            NodeKind::Document(cfg) => self.exec_media(ctx, cfg, MediaKind::Document).await,
            NodeKind::Button(cfg) => self.exec_button_prompt(ctx, cfg).await,
            NodeKind::List(cfg) => self.exec_list_prompt(ctx, cfg).await,
            NodeKind::Flow(cfg) => {
                let outbound = Outbound::FlowCta {
                    body: ctx.bag.render(&cfg.text),
                    cta: cfg.cta.clone(),
                    flow_id: cfg.flow_id.clone(),
                    flow_token: cfg.flow_token.clone(),
                    screen: cfg.screen.clone(),
                };
                self.send_to_contact(ctx, &outbound).await?;
                ctx.bag.set(WAITING_FLOW, json!(true));
                Ok(StepOutcome::Suspend)
            }
            NodeKind::Wait(_) => Ok(StepOutcome::Suspend),
            NodeKind::Delay(cfg) => {
                let secs = cfg.seconds.min(MAX_DELAY_SECS);
                tokio::time::sleep(Duration::from_secs(secs)).await;
                Ok(StepOutcome::Continue(None))
            }
            NodeKind::Variable(cfg) => {
                let value = self.render_with_rescue(ctx, &cfg.value);
                ctx.bag.set_str(&cfg.name, value);
                Ok(StepOutcome::Continue(None))
            }
            NodeKind::ListVariable(cfg) => {
                let raw = ctx.bag.render(&cfg.source);
                let items: Vec<Value> = raw
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(|l| Value::String(l.to_string()))
                    .collect();
                ctx.bag.set(&cfg.name, Value::Array(items));
                Ok(StepOutcome::Continue(None))
            }
            NodeKind::UpdateContact(cfg) => {
                let name = non_empty(ctx.bag.render(&cfg.name));
                let email = non_empty(ctx.bag.render(&cfg.email));
                let labels: Vec<String> = cfg
                    .add_labels
                    .iter()
                    .map(|l| ctx.bag.render(l))
                    .filter(|l| !l.is_empty())
                    .collect();
                let mut conn = self.state().conn.get()?;
                inbox::update_contact_fields(
                    &mut conn,
                    ctx.org.id,
                    ctx.contact.id,
                    name.as_deref(),
                    email.as_deref(),
                    &labels,
                )?;
                Ok(StepOutcome::Continue(None))
            }
            NodeKind::Map(cfg) => {
                let rendered = self.render_map(ctx, cfg);
                if !cfg.store_variable.is_empty() {
                    ctx.bag.set_str(&cfg.store_variable, rendered);
                }
                Ok(StepOutcome::Continue(None))
            }
            NodeKind::Condition(cfg) => {
                let left = ctx.bag.render(&cfg.left);
                let right = ctx.bag.render(&cfg.right);
                let truthy = match cfg.operator.as_str() {
                    "contains" => left.contains(&right),
                    "not_equals" => left != right,
                    "exists" => !left.trim().is_empty() && left != cfg.left,
                    _ => left == right,
                };
                Ok(StepOutcome::Continue(Some(
                    if truthy { "true" } else { "false" }.to_string(),
                )))
            }
            NodeKind::Router(cfg) => {
                let value = ctx
                    .bag
                    .get_str(&cfg.variable)
                    .unwrap_or_else(|| ctx.bag.render(&cfg.variable));
                let handle = cfg
                    .cases
                    .iter()
                    .find(|case| router_case_matches(&value, &case.operator, &case.value))
                    .map(|case| case.id.clone())
                    .unwrap_or_else(|| "default".to_string());
                Ok(StepOutcome::Continue(Some(handle)))
            }
            NodeKind::KeywordMatch(cfg) => {
                let value = ctx.bag.get_str(&cfg.variable).unwrap_or_default();
                let haystack = if cfg.case_sensitive {
                    value
                } else {
                    value.to_lowercase()
                };
                let handle = cfg
                    .keywords
                    .iter()
                    .find(|case| {
                        let needle = if cfg.case_sensitive {
                            case.keyword.clone()
                        } else {
                            case.keyword.to_lowercase()
                        };
                        !needle.is_empty() && haystack.contains(&needle)
                    })
                    .map(|case| case.id.clone())
                    .unwrap_or_else(|| "default".to_string());
                Ok(StepOutcome::Continue(Some(handle)))
            }
            NodeKind::Validator(cfg) => {
                let valid = self.exec_validator(ctx, cfg);
                Ok(StepOutcome::Continue(Some(
                    if valid { "valid" } else { "invalid" }.to_string(),
                )))
            }
            NodeKind::PhoneParser(cfg) => {
                let number = digits_only(&ctx.bag.get_str(&cfg.variable).unwrap_or_default());
                let handle = cfg
                    .prefixes
                    .iter()
                    .find(|p| !p.prefix.is_empty() && number.starts_with(&digits_only(&p.prefix)))
                    .map(|p| select_handle(&ctx.graph, &node.id, &format!("country_{}", p.code)))
                    .unwrap_or_else(|| "default".to_string());
                Ok(StepOutcome::Continue(Some(handle)))
            }
            NodeKind::BusinessHours(cfg) => {
                let open = business_hours_open(cfg);
                Ok(StepOutcome::Continue(Some(
                    if open { "open" } else { "closed" }.to_string(),
                )))
            }
            NodeKind::Api(cfg) => self.exec_api(ctx, &node.id, cfg).await,
            NodeKind::Sql(cfg) => self.exec_sql(ctx, cfg).await,
            NodeKind::GoogleSheet(cfg) => self.exec_sheet_push(ctx, cfg).await,
            NodeKind::GoogleSheetQuery(cfg) => self.exec_sheet_query(ctx, cfg).await,
            NodeKind::DriveImageLookup(cfg) => self.exec_drive_lookup(ctx, cfg).await,
            NodeKind::MediaForward(cfg) => self.exec_media_forward(ctx, cfg).await,
            NodeKind::Payment(cfg) => self.exec_payment(ctx, cfg).await,
            NodeKind::Shopify(cfg) => self.exec_order_lookup(ctx, cfg, OrderProvider::Shopify).await,
            NodeKind::Woocommerce(cfg) => {
                self.exec_order_lookup(ctx, cfg, OrderProvider::Woocommerce).await
            }
            NodeKind::SendExternal(cfg) => self.exec_send_external(ctx, cfg).await,
            NodeKind::Catalogue(cfg) => {
                let outbound = Outbound::Catalog {
                    body: ctx.bag.render(&cfg.text),
                    catalog_id: cfg.catalog_id.clone(),
                    section_title: cfg.section_title.clone(),
                    product_ids: cfg.products.iter().map(|p| p.retailer_id.clone()).collect(),
                };
                self.send_to_contact(ctx, &outbound).await?;
                Ok(StepOutcome::Continue(None))
            }
            NodeKind::GroupImages(cfg) => self.exec_group_images(ctx, cfg).await,
            NodeKind::Loop(cfg) => self.exec_loop(ctx, node, cfg),
            NodeKind::Agent(cfg) => self.exec_agent_handoff(ctx, cfg).await,
            NodeKind::SessionConfig(cfg) => {
                ctx.bag.set("_sessionTimeout", json!(cfg.timeout_secs));
                Ok(StepOutcome::Continue(None))
            }
        }
    }

    fn exec_start_trigger(
        &self,
        ctx: &mut ExecCtx,
        node: &FlowNode,
        cfg: &StartTriggerConfig,
    ) -> AppResult<StepOutcome> {
        let text = ctx.bag.get_str("last_input").unwrap_or_default();
        let handle = match cfg.match_keyword(&text) {
            Some(i) => {
                ctx.bag
                    .set_str("matched_keyword", cfg.keywords[i].clone());
                select_handle_any(
                    &ctx.graph,
                    &node.id,
                    &[format!("kw_{}", i), format!("kw{}", i)],
                )
            }
            None => "default".to_string(),
        };
        Ok(StepOutcome::Continue(Some(handle)))
    }

    async fn exec_media(
        &self,
        ctx: &mut ExecCtx,
        cfg: &MediaConfig,
        kind: MediaKind,
    ) -> AppResult<StepOutcome> {
        let source = if !cfg.media_id.is_empty() {
            MediaSource::ProviderId(ctx.bag.render(&cfg.media_id))
        } else {
            let url = normalize_drive_url(&ctx.bag.render(&cfg.url));
            if url.is_empty() {
                return Err(AppError::Validation("media node without source".to_string()));
            }
            MediaSource::Link(url)
        };
        let outbound = Outbound::Media {
            kind,
            source,
            caption: non_empty(ctx.bag.render(&cfg.caption)),
            file_name: non_empty(cfg.file_name.clone()),
        };
        self.send_to_contact(ctx, &outbound).await?;
        Ok(StepOutcome::Continue(None))
    }

    async fn exec_button_prompt(
        &self,
        ctx: &mut ExecCtx,
        cfg: &ButtonConfig,
    ) -> AppResult<StepOutcome> {
        let buttons: Vec<(String, String)> = cfg
            .buttons
            .iter()
            .take(3)
            .map(|b| (b.id.clone(), ctx.bag.render(&b.title)))
            .collect();
        if buttons.is_empty() {
            return Err(AppError::Validation("button node without buttons".to_string()));
        }
        let outbound = Outbound::Buttons {
            body: ctx.bag.render(&cfg.text),
            buttons: buttons.clone(),
        };
        self.send_to_contact(ctx, &outbound).await?;
        let pending: Vec<Value> = buttons
            .into_iter()
            .map(|(id, title)| json!({ "id": id, "title": title }))
            .collect();
        ctx.bag.set(PENDING_BUTTONS, Value::Array(pending));
        Ok(StepOutcome::Suspend)
    }

    async fn exec_list_prompt(&self, ctx: &mut ExecCtx, cfg: &ListConfig) -> AppResult<StepOutcome> {
        let rows = self.collect_list_rows(ctx, cfg).await?;
        if rows.is_empty() {
            return Err(AppError::Validation("list node resolved zero rows".to_string()));
        }
        let stored: Vec<Value> = rows
            .iter()
            .map(|r| json!({ "id": r.id, "title": r.title, "description": r.description }))
            .collect();
        ctx.bag.set(LIST_ROWS, Value::Array(stored));
        ctx.bag.set(LIST_PAGE, json!(0));
        self.send_list_page(ctx, cfg, &rows, 0).await?;
        Ok(StepOutcome::Suspend)
    }

    pub(crate) async fn send_list_page(
        &self,
        ctx: &ExecCtx,
        cfg: &ListConfig,
        rows: &[ListRow],
        page: usize,
    ) -> AppResult<()> {
        let visible = paginate_rows(rows, page);
        let section_rows: Vec<(String, String, String)> = visible
            .iter()
            .map(|r| (r.id.clone(), r.title.clone(), r.description.clone()))
            .collect();
        let outbound = Outbound::List {
            body: ctx.bag.render(&cfg.text),
            button_label: if cfg.button_label.is_empty() {
                "Choose".to_string()
            } else {
                cfg.button_label.clone()
            },
            sections: vec![("Options".to_string(), section_rows)],
        };
        self.send_to_contact(ctx, &outbound).await?;
        Ok(())
    }

    /// Rows come from an array variable, a Google Sheet, or the inline
    /// sections, in that priority order.
    async fn collect_list_rows(&self, ctx: &ExecCtx, cfg: &ListConfig) -> AppResult<Vec<ListRow>> {
        if !cfg.source_variable.is_empty() {
            if let Some(items) = ctx.bag.get_array(&cfg.source_variable) {
                return Ok(items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| ListRow {
                        id: format!("row_{}", i),
                        title: super::vars::render_value(item),
                        description: String::new(),
                    })
                    .collect());
            }
            return Ok(Vec::new());
        }
        if !cfg.sheet_url.is_empty() {
            return self.fetch_sheet_rows(ctx, cfg).await;
        }
        Ok(cfg
            .sections
            .iter()
            .flat_map(|s| s.rows.iter())
            .map(|r| ListRow {
                id: r.id.clone(),
                title: ctx.bag.render(&r.title),
                description: ctx.bag.render(&r.description),
            })
            .collect())
    }

    async fn exec_send_external(
        &self,
        ctx: &mut ExecCtx,
        cfg: &SendExternalConfig,
    ) -> AppResult<StepOutcome> {
        let phone = digits_only(&ctx.bag.render(&cfg.phone));
        if phone.is_empty() {
            return Err(AppError::Validation("send_external without phone".to_string()));
        }
        let client = CloudApiClient::for_org(self.state().http.clone(), &self.state().config, &ctx.org);
        let body = ctx.bag.render(&cfg.text);
        client.send(&phone, &Outbound::Text { body }).await?;
        Ok(StepOutcome::Continue(None))
    }

    async fn exec_group_images(
        &self,
        ctx: &mut ExecCtx,
        cfg: &GroupImagesConfig,
    ) -> AppResult<StepOutcome> {
        let urls: Vec<String> = ctx
            .bag
            .get_array(&cfg.source_variable)
            .map(|items| items.iter().map(super::vars::render_value).collect())
            .unwrap_or_default();
        let count = urls.len();
        for (i, url) in urls.into_iter().enumerate() {
            let caption = if i + 1 == count {
                non_empty(ctx.bag.render(&cfg.final_caption))
            } else {
                None
            };
            let outbound = Outbound::Media {
                kind: MediaKind::Image,
                source: MediaSource::Link(normalize_drive_url(&url)),
                caption,
                file_name: None,
            };
            self.send_to_contact(ctx, &outbound).await?;
            if i + 1 < count && cfg.delay_secs > 0 {
                tokio::time::sleep(Duration::from_secs(cfg.delay_secs.min(MAX_DELAY_SECS))).await;
            }
        }
        Ok(StepOutcome::Continue(None))
    }

    fn exec_loop(
        &self,
        ctx: &mut ExecCtx,
        node: &FlowNode,
        cfg: &LoopConfig,
    ) -> AppResult<StepOutcome> {
        let index_key = format!("_loop_{}", node.id);
        let index = ctx
            .bag
            .get(&index_key)
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;
        let items = ctx.bag.get_array(&cfg.source_variable).cloned().unwrap_or_default();

        if index < items.len() {
            let item_var = if cfg.item_variable.is_empty() {
                "item"
            } else {
                cfg.item_variable.as_str()
            };
            ctx.bag.set(item_var, items[index].clone());
            ctx.bag.set(&index_key, json!(index + 1));
            Ok(StepOutcome::Continue(Some("loop".to_string())))
        } else {
            ctx.bag.remove(&index_key);
            Ok(StepOutcome::Continue(Some("done".to_string())))
        }
    }

    async fn exec_agent_handoff(
        &self,
        ctx: &mut ExecCtx,
        cfg: &AgentConfig,
    ) -> AppResult<StepOutcome> {
        if !cfg.message.is_empty() {
            let body = ctx.bag.render(&cfg.message);
            self.send_to_contact(ctx, &Outbound::Text { body }).await?;
        }
        let mut conn = self.state().conn.get()?;
        inbox::set_conversation_status(&mut conn, ctx.org.id, ctx.conversation.id, "open")?;
        drop(conn);
        self.state()
            .realtime
            .emit_org(
                ctx.org.id,
                events::CONVERSATION_STATUS,
                json!({ "conversation_id": ctx.conversation.id, "status": "open", "handoff": true }),
            )
            .await;
        Ok(StepOutcome::Terminate)
    }

    fn exec_validator(&self, ctx: &ExecCtx, cfg: &ValidatorConfig) -> bool {
        let value = ctx.bag.get_str(&cfg.variable).unwrap_or_default();
        match cfg.kind.as_str() {
            "email" => regex_matches(r"^[\w.+-]+@[\w-]+\.[\w.-]+$", &value),
            "phone" => {
                let digits = digits_only(&value);
                digits.len() >= 10 && digits.len() <= 15
            }
            "pan" => regex_matches(r"^[A-Z]{5}[0-9]{4}[A-Z]$", &value.to_uppercase()),
            "aadhar" => regex_matches(r"^[0-9]{12}$", &digits_only(&value)),
            "gst" => regex_matches(
                r"^[0-9]{2}[A-Z]{5}[0-9]{4}[A-Z][1-9A-Z]Z[0-9A-Z]$",
                &value.to_uppercase(),
            ),
            "pincode" => regex_matches(r"^[1-9][0-9]{5}$", &digits_only(&value)),
            "image" => {
                ctx.bag.get_str("last_message_type").as_deref() == Some("image")
            }
            "pdf" => ctx
                .bag
                .get_str("last_media_url")
                .map(|u| u.to_lowercase().contains("pdf"))
                .unwrap_or(false)
                || ctx.bag.get_str("last_message_type").as_deref() == Some("document"),
            _ => false,
        }
    }

    /// The rescue rule: a `variable` node whose template came out empty but
    /// referenced the last input falls back to the most recent interactive
    /// selection.
    fn render_with_rescue(&self, ctx: &ExecCtx, template: &str) -> String {
        let rendered = ctx.bag.render(template);
        if !rendered.trim().is_empty() {
            return rendered;
        }
        let names = VariableBag::referenced_names(template);
        let touches_input = names
            .iter()
            .any(|n| n == "last_input" || n == "last_response");
        if touches_input {
            if let Some(selection) = ctx
                .bag
                .get_str("selected_button")
                .or_else(|| ctx.bag.get_str("selected_list_title"))
            {
                return selection;
            }
        }
        rendered
    }

    fn render_map(&self, ctx: &ExecCtx, cfg: &MapConfig) -> String {
        let items = ctx.bag.get_array(&cfg.source_variable).cloned().unwrap_or_default();
        let separator = if cfg.separator.is_empty() {
            "\n"
        } else {
            &cfg.separator
        };
        let mut scratch = ctx.bag.clone();
        items
            .iter()
            .map(|item| {
                scratch.set("item", item.clone());
                scratch.render(&cfg.template)
            })
            .collect::<Vec<_>>()
            .join(separator)
    }

    // ---- resume ------------------------------------------------------------

    pub(crate) async fn resume_node(
        &self,
        ctx: &mut ExecCtx,
        node: &FlowNode,
        inbound: &IncomingMessage,
    ) -> AppResult<StepOutcome> {
        match &node.kind {
            NodeKind::Button(cfg) => self.resume_button(ctx, node, cfg, inbound).await,
            NodeKind::List(cfg) => self.resume_list(ctx, node, cfg, inbound).await,
            NodeKind::Wait(cfg) => self.resume_wait(ctx, cfg, inbound).await,
            NodeKind::Flow(_) => self.resume_flow_form(ctx, inbound),
            // A session persisted at a non-awaiting node (step cap) just
            // executes it on the next event.
            _ => self.execute_node(ctx, node).await,
        }
    }

    async fn resume_button(
        &self,
        ctx: &mut ExecCtx,
        node: &FlowNode,
        cfg: &ButtonConfig,
        inbound: &IncomingMessage,
    ) -> AppResult<StepOutcome> {
        let pending: Vec<(String, String)> = ctx
            .bag
            .get_array(PENDING_BUTTONS)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|b| {
                        Some((
                            b.get("id")?.as_str()?.to_string(),
                            b.get("title")?.as_str()?.to_string(),
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let text = inbound.display_text();
        let matched = inbound
            .reply_id()
            .and_then(|id| pending.iter().position(|(bid, _)| bid == id))
            .or_else(|| {
                pending
                    .iter()
                    .position(|(_, title)| title.eq_ignore_ascii_case(text.trim()))
            });

        match matched {
            Some(i) => {
                ctx.bag.set_str("selected_button", pending[i].1.clone());
                ctx.bag.remove(PENDING_BUTTONS);
                let handle = select_handle_any(
                    &ctx.graph,
                    &node.id,
                    &[format!("btn_{}", i), format!("btn{}", i)],
                );
                Ok(StepOutcome::Continue(Some(handle)))
            }
            None if cfg.retry_on_invalid => {
                let retry = if cfg.retry_message.is_empty() {
                    "Please pick one of the options.".to_string()
                } else {
                    ctx.bag.render(&cfg.retry_message)
                };
                self.send_to_contact(ctx, &Outbound::Text { body: retry }).await?;
                Ok(StepOutcome::Suspend)
            }
            None => {
                ctx.bag.remove(PENDING_BUTTONS);
                Ok(StepOutcome::Continue(Some("default".to_string())))
            }
        }
    }

    async fn resume_list(
        &self,
        ctx: &mut ExecCtx,
        node: &FlowNode,
        cfg: &ListConfig,
        inbound: &IncomingMessage,
    ) -> AppResult<StepOutcome> {
        let rows: Vec<ListRow> = ctx
            .bag
            .get_array(LIST_ROWS)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|r| {
                        Some(ListRow {
                            id: r.get("id")?.as_str()?.to_string(),
                            title: r.get("title")?.as_str()?.to_string(),
                            description: r
                                .get("description")
                                .and_then(|d| d.as_str())
                                .unwrap_or("")
                                .to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        let page = ctx
            .bag
            .get(LIST_PAGE)
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;

        // Metadata reply id first, title text second.
        let text = inbound.display_text();
        let selected_id = inbound
            .list_reply()
            .map(|r| r.id.clone())
            .or_else(|| {
                rows.iter()
                    .find(|r| r.title.eq_ignore_ascii_case(text.trim()))
                    .map(|r| r.id.clone())
            });

        match selected_id.as_deref() {
            Some(LIST_NEXT_ID) => {
                let next_page = page + 1;
                ctx.bag.set(LIST_PAGE, json!(next_page));
                self.send_list_page(ctx, cfg, &rows, next_page).await?;
                Ok(StepOutcome::Suspend)
            }
            Some(LIST_PREV_ID) => {
                let prev_page = page.saturating_sub(1);
                ctx.bag.set(LIST_PAGE, json!(prev_page));
                self.send_list_page(ctx, cfg, &rows, prev_page).await?;
                Ok(StepOutcome::Suspend)
            }
            Some(id) => {
                let title = rows
                    .iter()
                    .find(|r| r.id == id)
                    .map(|r| r.title.clone())
                    .unwrap_or_else(|| text.clone());
                ctx.bag.set_str("selected_list_id", id.to_string());
                ctx.bag.set_str("selected_list_title", title.clone());
                if !cfg.store_variable.is_empty() {
                    ctx.bag.set_str(&cfg.store_variable, title);
                }
                let id = id.to_string();
                ctx.bag.remove(LIST_ROWS);
                ctx.bag.remove(LIST_PAGE);
                let handle = select_handle(&ctx.graph, &node.id, &id);
                Ok(StepOutcome::Continue(Some(handle)))
            }
            None => {
                ctx.bag.remove(LIST_ROWS);
                ctx.bag.remove(LIST_PAGE);
                Ok(StepOutcome::Continue(Some("default".to_string())))
            }
        }
    }

    async fn resume_wait(
        &self,
        ctx: &mut ExecCtx,
        cfg: &WaitConfig,
        inbound: &IncomingMessage,
    ) -> AppResult<StepOutcome> {
        let expected = if cfg.expected_type.is_empty() {
            "any"
        } else {
            &cfg.expected_type
        };
        let actual = inbound.message_type.as_str();
        let matches = match expected {
            "any" => true,
            "file" => actual == "document",
            other => other == actual,
        };

        if !matches && cfg.retry_on_invalid {
            let retry = if cfg.retry_message.is_empty() {
                format!("Please send a {}.", expected)
            } else {
                ctx.bag.render(&cfg.retry_message)
            };
            self.send_to_contact(ctx, &Outbound::Text { body: retry }).await?;
            return Ok(StepOutcome::Suspend);
        }

        if !cfg.store_variable.is_empty() {
            let captured = if inbound.media().is_some() {
                ctx.bag
                    .get_str("last_media_url")
                    .or_else(|| ctx.bag.get_str("last_media_id"))
                    .unwrap_or_else(|| inbound.display_text())
            } else {
                inbound.display_text()
            };
            ctx.bag.set_str(&cfg.store_variable, captured);
        }
        Ok(StepOutcome::Continue(None))
    }

    fn resume_flow_form(
        &self,
        ctx: &mut ExecCtx,
        inbound: &IncomingMessage,
    ) -> AppResult<StepOutcome> {
        let Some(nfm) = inbound.nfm_reply() else {
            // Not the form submission; keep waiting.
            return Ok(StepOutcome::Suspend);
        };
        if let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(&nfm.response_json) {
            for (k, v) in fields {
                if k != "flow_token" {
                    ctx.bag.set(&k, v);
                }
            }
        } else {
            warn!("nfm_reply carried undecodable response_json");
        }
        ctx.bag.remove(WAITING_FLOW);
        Ok(StepOutcome::Continue(None))
    }

    // ---- outbound plumbing -------------------------------------------------

    /// Sends to the session contact, records the outgoing message, updates
    /// the conversation preview, and notifies operator sockets.
    pub(crate) async fn send_to_contact(
        &self,
        ctx: &ExecCtx,
        outbound: &Outbound,
    ) -> AppResult<String> {
        let client = CloudApiClient::for_org(self.state().http.clone(), &self.state().config, &ctx.org);
        let provider_id = client.send(&ctx.contact.wa_id, outbound).await?;

        let body = outbound.preview_body();
        let record = NewMessage {
            id: Uuid::new_v4(),
            org_id: ctx.org.id,
            conversation_id: ctx.conversation.id,
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
            provider_message_id: Some(provider_id.clone()),
            created_at: Utc::now(),
        };
        let mut conn = self.state().conn.get()?;
        let stored = inbox::insert_message_idempotent(&mut conn, &record)?;
        inbox::touch_conversation_outgoing(&mut conn, ctx.conversation.id, &body)?;
        drop(conn);

        if let Some(message) = stored {
            let message_json = serde_json::to_value(&message).unwrap_or_default();
            self.state()
                .realtime
                .emit_org(ctx.org.id, events::NEW_MESSAGE, message_json.clone())
                .await;
            self.state()
                .realtime
                .emit(&conv_room(ctx.conversation.id), events::NEW_MESSAGE, message_json)
                .await;
        }
        debug!(
            "flow sent {} to {} (conversation {})",
            provider_id, ctx.contact.wa_id, ctx.conversation.id
        );
        Ok(provider_id)
    }
}

// ---- free helpers ----------------------------------------------------------

/// `desired` when the graph wires that handle, else `default`.
pub(crate) fn select_handle(graph: &FlowGraph, node_id: &str, desired: &str) -> String {
    if graph.next_node_id(node_id, Some(desired)).is_some() {
        desired.to_string()
    } else {
        "default".to_string()
    }
}

/// First wired candidate, else `default`. Flow builders have emitted both
/// `btn_0` and `btn0` spellings over time.
pub(crate) fn select_handle_any(graph: &FlowGraph, node_id: &str, candidates: &[String]) -> String {
    candidates
        .iter()
        .find(|c| graph.next_node_id(node_id, Some(c)).is_some())
        .cloned()
        .unwrap_or_else(|| "default".to_string())
}

fn router_case_matches(value: &str, operator: &str, target: &str) -> bool {
    match operator {
        "<" => match (value.parse::<f64>(), target.parse::<f64>()) {
            (Ok(a), Ok(b)) => a < b,
            _ => false,
        },
        ">" => match (value.parse::<f64>(), target.parse::<f64>()) {
            (Ok(a), Ok(b)) => a > b,
            _ => false,
        },
        _ => value == target,
    }
}

fn business_hours_open(cfg: &BusinessHoursConfig) -> bool {
    let tz: Tz = match cfg.timezone.parse() {
        Ok(tz) => tz,
        Err(_) => return false,
    };
    let now = Utc::now().with_timezone(&tz);
    let weekday = now.format("%a").to_string().to_lowercase();
    cfg.is_open_at(&weekday, now.time())
}

fn regex_matches(pattern: &str, value: &str) -> bool {
    Regex::new(pattern)
        .map(|re| re.is_match(value.trim()))
        .unwrap_or(false)
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_operators() {
        assert!(router_case_matches("5", "<", "10"));
        assert!(!router_case_matches("15", "<", "10"));
        assert!(router_case_matches("15", ">", "10"));
        assert!(router_case_matches("yes", "==", "yes"));
        assert!(!router_case_matches("abc", "<", "10"));
    }

    #[test]
    fn validator_patterns() {
        assert!(regex_matches(r"^[\w.+-]+@[\w-]+\.[\w.-]+$", "a.b@example.co.in"));
        assert!(!regex_matches(r"^[\w.+-]+@[\w-]+\.[\w.-]+$", "not-an-email"));
        assert!(regex_matches(r"^[A-Z]{5}[0-9]{4}[A-Z]$", "ABCDE1234F"));
        assert!(!regex_matches(r"^[A-Z]{5}[0-9]{4}[A-Z]$", "AB1234567Z"));
        assert!(regex_matches(r"^[1-9][0-9]{5}$", "560001"));
        assert!(!regex_matches(r"^[1-9][0-9]{5}$", "060001"));
    }

    #[test]
    fn non_empty_trims() {
        assert_eq!(non_empty("  x ".to_string()), Some("x".to_string()));
        assert_eq!(non_empty("   ".to_string()), None);
    }
}
