//! External-service nodes: HTTP APIs, tenant SQL lookups, Google Sheets and
//! Drive, media relay, payment links, and storefront order lookups.
//!
//! Every function returns a [`StepOutcome`]; hard failures bubble up as
//! errors so the engine can take the node's `fail` edge when one is wired.

use super::nodes::*;
use super::vars::{json_path, parse_path, render_value};
use super::{ExecCtx, FlowEngine, StepOutcome};
use crate::provider::envelope::{MediaKind, MediaSource, Outbound};
use crate::provider::CloudApiClient;
use crate::shared::errors::{AppError, AppResult};
use diesel::prelude::*;
use diesel::sql_types::{Jsonb, Text};
use log::{debug, warn};
use serde_json::{json, Value};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderProvider {
    Shopify,
    Woocommerce,
}

/// Most integrations answer fast or not at all.
const SERVICE_TIMEOUT: Duration = Duration::from_secs(10);

impl FlowEngine {
    pub(crate) async fn exec_api(
        &self,
        ctx: &mut ExecCtx,
        node_id: &str,
        cfg: &ApiConfig,
    ) -> AppResult<StepOutcome> {
        let url = ctx.bag.render(&cfg.url);
        if url.is_empty() {
            return Err(AppError::Validation("api node without URL".to_string()));
        }
        let method = cfg.method.to_uppercase();
        let mut request = match method.as_str() {
            "POST" => self.state().http.post(&url),
            "PUT" => self.state().http.put(&url),
            "DELETE" => self.state().http.delete(&url),
            "PATCH" => self.state().http.patch(&url),
            _ => self.state().http.get(&url),
        };
        for (name, template) in &cfg.headers {
            request = request.header(name.as_str(), ctx.bag.render(template));
        }
        if !cfg.body.is_empty() && method != "GET" {
            let rendered = ctx.bag.render(&cfg.body);
            request = match serde_json::from_str::<Value>(&rendered) {
                Ok(body_json) => request.json(&body_json),
                Err(_) => request.body(rendered),
            };
        }

        let resp = request.timeout(SERVICE_TIMEOUT).send().await?;
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(AppError::Provider(format!(
                "api node HTTP {}: {}",
                status, body
            )));
        }

        map_response(&mut ctx.bag, &body, &cfg.response_mappings);

        // Custom routing on a mapped value, if configured.
        if !cfg.route_on.is_empty() {
            let value = ctx.bag.get_str(&cfg.route_on).unwrap_or_default();
            if let Some(route) = cfg
                .routes
                .iter()
                .find(|r| api_route_matches(&value, &r.operator, &r.value))
            {
                let handle = super::exec::select_handle(&ctx.graph, node_id, &route.id);
                return Ok(StepOutcome::Continue(Some(handle)));
            }
        }
        Ok(StepOutcome::Continue(Some(
            super::exec::select_handle(&ctx.graph, node_id, "success"),
        )))
    }

    /// Tenant-scoped parameterized lookup. The query is wrapped so each row
    /// comes back as JSON and can be path-mapped into the bag.
    pub(crate) async fn exec_sql(&self, ctx: &mut ExecCtx, cfg: &SqlConfig) -> AppResult<StepOutcome> {
        #[derive(QueryableByName)]
        struct JsonRow {
            #[diesel(sql_type = Jsonb)]
            row: Value,
        }

        let query = cfg.query.trim().trim_end_matches(';');
        if query.is_empty() {
            return Err(AppError::Validation("sql node without query".to_string()));
        }
        let wrapped = format!("SELECT to_jsonb(q.*) AS row FROM ({}) AS q LIMIT 50", query);
        let params: Vec<String> = cfg.params.iter().map(|p| ctx.bag.render(p)).collect();

        let mut conn = self.state().conn.get()?;
        let rows: Vec<JsonRow> = match params.len() {
            0 => diesel::sql_query(&wrapped).load(&mut conn)?,
            1 => diesel::sql_query(&wrapped)
                .bind::<Text, _>(&params[0])
                .load(&mut conn)?,
            2 => diesel::sql_query(&wrapped)
                .bind::<Text, _>(&params[0])
                .bind::<Text, _>(&params[1])
                .load(&mut conn)?,
            3 => diesel::sql_query(&wrapped)
                .bind::<Text, _>(&params[0])
                .bind::<Text, _>(&params[1])
                .bind::<Text, _>(&params[2])
                .load(&mut conn)?,
            4 => diesel::sql_query(&wrapped)
                .bind::<Text, _>(&params[0])
                .bind::<Text, _>(&params[1])
                .bind::<Text, _>(&params[2])
                .bind::<Text, _>(&params[3])
                .load(&mut conn)?,
            n => {
                return Err(AppError::Validation(format!(
                    "sql node supports at most 4 parameters, got {}",
                    n
                )))
            }
        };
        drop(conn);

        if rows.is_empty() {
            return Ok(StepOutcome::Continue(Some("fail".to_string())));
        }
        let result: Value = if rows.len() == 1 {
            rows[0].row.clone()
        } else {
            Value::Array(rows.iter().map(|r| r.row.clone()).collect())
        };
        map_response(&mut ctx.bag, &result, &cfg.mappings);
        Ok(StepOutcome::Continue(Some("success".to_string())))
    }

    pub(crate) async fn exec_sheet_push(
        &self,
        ctx: &mut ExecCtx,
        cfg: &SheetPushConfig,
    ) -> AppResult<StepOutcome> {
        if cfg.script_url.is_empty() {
            return Err(AppError::Validation("google_sheet node without URL".to_string()));
        }
        let mut row = serde_json::Map::new();
        for (column, template) in &cfg.columns {
            row.insert(column.clone(), Value::String(ctx.bag.render(template)));
        }
        let resp = self
            .state()
            .http
            .post(&cfg.script_url)
            .json(&Value::Object(row))
            .timeout(SERVICE_TIMEOUT)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(AppError::Provider(format!(
                "sheet push answered HTTP {}",
                resp.status()
            )));
        }
        Ok(StepOutcome::Continue(None))
    }

    pub(crate) async fn exec_sheet_query(
        &self,
        ctx: &mut ExecCtx,
        cfg: &SheetQueryConfig,
    ) -> AppResult<StepOutcome> {
        if cfg.script_url.is_empty() {
            return Err(AppError::Validation(
                "google_sheet_query node without URL".to_string(),
            ));
        }
        let mut url = cfg.script_url.clone();
        let mut sep = if url.contains('?') { '&' } else { '?' };
        for (column, template) in &cfg.conditions {
            let value = ctx.bag.render(template);
            url.push(sep);
            url.push_str(&format!(
                "{}={}",
                urlencoding::encode(column),
                urlencoding::encode(&value)
            ));
            sep = '&';
        }

        let resp = self
            .state()
            .http
            .get(&url)
            .timeout(SERVICE_TIMEOUT)
            .send()
            .await?;
        let body: Value = resp.json().await.unwrap_or(Value::Null);

        // Apps Script responses are either a bare object, `{data: [...]}`,
        // or an array. Take the first row.
        let row = match &body {
            Value::Array(items) => items.first().cloned(),
            Value::Object(_) => {
                if let Some(Value::Array(items)) = body.get("data") {
                    items.first().cloned()
                } else if body.get("found") == Some(&Value::Bool(false)) {
                    None
                } else {
                    Some(body.clone())
                }
            }
            _ => None,
        };

        match row {
            Some(row) => {
                for (column, variable) in &cfg.store {
                    if let Some(value) = row.get(column.as_str()) {
                        ctx.bag.set(variable, value.clone());
                    }
                }
                Ok(StepOutcome::Continue(Some("success".to_string())))
            }
            None => Ok(StepOutcome::Continue(Some("fail".to_string()))),
        }
    }

    /// Sheet-backed list rows: one row per record of the script response,
    /// titled by the configured column.
    pub(crate) async fn fetch_sheet_rows(
        &self,
        ctx: &ExecCtx,
        cfg: &ListConfig,
    ) -> AppResult<Vec<ListRow>> {
        let resp = self
            .state()
            .http
            .get(&cfg.sheet_url)
            .timeout(SERVICE_TIMEOUT)
            .send()
            .await?;
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        let items = match &body {
            Value::Array(items) => items.clone(),
            Value::Object(_) => body
                .get("data")
                .and_then(|d| d.as_array())
                .cloned()
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        let column = if cfg.sheet_column.is_empty() {
            "name"
        } else {
            cfg.sheet_column.as_str()
        };
        Ok(items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| {
                let title = match item {
                    Value::String(s) => s.clone(),
                    other => render_value(other.get(column)?),
                };
                if title.is_empty() {
                    return None;
                }
                Some(ListRow {
                    id: format!("row_{}", i),
                    title,
                    description: String::new(),
                })
            })
            .collect())
    }

    pub(crate) async fn exec_drive_lookup(
        &self,
        ctx: &mut ExecCtx,
        cfg: &DriveLookupConfig,
    ) -> AppResult<StepOutcome> {
        let file_name = ctx.bag.render(&cfg.file_name);
        let urls: Vec<String> = if cfg.mode == "script" {
            let mut url = format!(
                "{}{}folder={}",
                cfg.script_url,
                if cfg.script_url.contains('?') { '&' } else { '?' },
                urlencoding::encode(&cfg.folder_id)
            );
            if !file_name.is_empty() {
                url.push_str(&format!("&name={}", urlencoding::encode(&file_name)));
            }
            let resp = self
                .state()
                .http
                .get(&url)
                .timeout(SERVICE_TIMEOUT)
                .send()
                .await?;
            let body: Value = resp.json().await.unwrap_or(Value::Null);
            extract_drive_urls(&body)
        } else {
            let mut query = format!("'{}' in parents", cfg.folder_id);
            if !file_name.is_empty() {
                query = format!("{} and name contains '{}'", query, file_name.replace('\'', ""));
            }
            let url = format!(
                "https://www.googleapis.com/drive/v3/files?q={}&key={}&fields=files(id,name)",
                urlencoding::encode(&query),
                urlencoding::encode(&cfg.api_key)
            );
            let resp = self
                .state()
                .http
                .get(&url)
                .timeout(SERVICE_TIMEOUT)
                .send()
                .await?;
            let body: Value = resp.json().await.unwrap_or(Value::Null);
            body.get("files")
                .and_then(|f| f.as_array())
                .map(|files| {
                    files
                        .iter()
                        .filter_map(|f| f.get("id").and_then(|id| id.as_str()))
                        .map(|id| {
                            format!("https://drive.google.com/uc?export=download&id={}", id)
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        if urls.is_empty() {
            return Ok(StepOutcome::Continue(Some("not_found".to_string())));
        }

        if !cfg.store_variable.is_empty() {
            ctx.bag.set(
                &cfg.store_variable,
                Value::Array(urls.iter().map(|u| Value::String(u.clone())).collect()),
            );
        }

        if cfg.auto_send {
            for (i, url) in urls.iter().enumerate() {
                let outbound = Outbound::Media {
                    kind: MediaKind::Image,
                    source: MediaSource::Link(url.clone()),
                    caption: None,
                    file_name: None,
                };
                self.send_to_contact(ctx, &outbound).await?;
                if i + 1 < urls.len() && cfg.send_delay_secs > 0 {
                    tokio::time::sleep(Duration::from_secs(cfg.send_delay_secs.min(60))).await;
                }
            }
        }
        Ok(StepOutcome::Continue(Some("found".to_string())))
    }

    /// Downloads the last inbound media and either republishes it under the
    /// public media directory or relays it as multipart to an endpoint.
    pub(crate) async fn exec_media_forward(
        &self,
        ctx: &mut ExecCtx,
        cfg: &MediaForwardConfig,
    ) -> AppResult<StepOutcome> {
        let Some(media_id) = ctx.bag.get_str("last_media_id") else {
            return Err(AppError::Validation(
                "media_forward without an inbound media".to_string(),
            ));
        };
        let client = CloudApiClient::for_org(self.state().http.clone(), &self.state().config, &ctx.org);
        let info = client.media_info(&media_id).await?;
        let bytes = client.download_media(&info.url).await?;
        let mime = info.mime_type.unwrap_or_else(|| "application/octet-stream".to_string());

        if cfg.mode == "post" {
            let field = if cfg.field_name.is_empty() {
                "file"
            } else {
                cfg.field_name.as_str()
            };
            let part = reqwest::multipart::Part::bytes(bytes)
                .file_name(media_id.clone())
                .mime_str(&mime)
                .map_err(|e| AppError::Internal(e.to_string()))?;
            let form = reqwest::multipart::Form::new().part(field.to_string(), part);
            let resp = self
                .state()
                .http
                .post(&cfg.endpoint)
                .multipart(form)
                .timeout(Duration::from_secs(60))
                .send()
                .await?;
            let status = resp.status();
            let body: Value = resp.json().await.unwrap_or(Value::Null);
            if !status.is_success() {
                return Err(AppError::Provider(format!(
                    "media relay answered HTTP {}: {}",
                    status, body
                )));
            }
            map_response(&mut ctx.bag, &body, &cfg.response_mappings);
        } else {
            let extension = mime.rsplit('/').next().unwrap_or("bin");
            let file_name = format!("{}.{}", uuid::Uuid::new_v4(), extension);
            let dir = std::path::Path::new("./media");
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| AppError::Internal(format!("media dir: {}", e)))?;
            tokio::fs::write(dir.join(&file_name), &bytes)
                .await
                .map_err(|e| AppError::Internal(format!("media write: {}", e)))?;
            let public_url = format!(
                "{}/media/{}",
                self.state().config.public_url.trim_end_matches('/'),
                file_name
            );
            debug!("saved inbound media {} as {}", media_id, public_url);
            if !cfg.store_variable.is_empty() {
                ctx.bag.set_str(&cfg.store_variable, public_url);
            }
        }
        Ok(StepOutcome::Continue(Some("success".to_string())))
    }

    pub(crate) async fn exec_payment(
        &self,
        ctx: &mut ExecCtx,
        cfg: &PaymentConfig,
    ) -> AppResult<StepOutcome> {
        let amount_raw = ctx
            .bag
            .get_str(&cfg.amount_variable)
            .unwrap_or_else(|| ctx.bag.render(&cfg.amount_variable));
        let amount: f64 = amount_raw
            .trim()
            .parse()
            .map_err(|_| AppError::Validation(format!("bad payment amount '{}'", amount_raw)))?;
        let currency = if cfg.currency.is_empty() {
            "INR"
        } else {
            cfg.currency.as_str()
        };
        let description = ctx.bag.render(&cfg.description);

        let link = match cfg.provider.as_str() {
            "stripe" => {
                let params = [
                    ("mode", "payment".to_string()),
                    ("line_items[0][price_data][currency]", currency.to_lowercase()),
                    (
                        "line_items[0][price_data][unit_amount]",
                        ((amount * 100.0).round() as i64).to_string(),
                    ),
                    (
                        "line_items[0][price_data][product_data][name]",
                        if description.is_empty() {
                            "Order".to_string()
                        } else {
                            description.clone()
                        },
                    ),
                    ("line_items[0][quantity]", "1".to_string()),
                ];
                let resp = self
                    .state()
                    .http
                    .post("https://api.stripe.com/v1/checkout/sessions")
                    .basic_auth(&cfg.key_secret, None::<&str>)
                    .form(&params)
                    .timeout(SERVICE_TIMEOUT)
                    .send()
                    .await?;
                let body: Value = resp.json().await?;
                body.get("url")
                    .and_then(|u| u.as_str())
                    .map(String::from)
                    .ok_or_else(|| AppError::Provider(format!("stripe link failed: {}", body)))?
            }
            _ => {
                let payload = json!({
                    "amount": (amount * 100.0).round() as i64,
                    "currency": currency,
                    "description": description,
                });
                let resp = self
                    .state()
                    .http
                    .post("https://api.razorpay.com/v1/payment_links")
                    .basic_auth(&cfg.key_id, Some(&cfg.key_secret))
                    .json(&payload)
                    .timeout(SERVICE_TIMEOUT)
                    .send()
                    .await?;
                let body: Value = resp.json().await?;
                body.get("short_url")
                    .and_then(|u| u.as_str())
                    .map(String::from)
                    .ok_or_else(|| AppError::Provider(format!("razorpay link failed: {}", body)))?
            }
        };

        if !cfg.store_variable.is_empty() {
            ctx.bag.set_str(&cfg.store_variable, link.clone());
        }
        ctx.bag.set_str("payment_link", link);

        let template = if cfg.message_template.is_empty() {
            "Pay here: {{payment_link}}".to_string()
        } else {
            cfg.message_template.clone()
        };
        let body = ctx.bag.render(&template);
        self.send_to_contact(ctx, &Outbound::Text { body }).await?;
        Ok(StepOutcome::Continue(Some("success".to_string())))
    }

    pub(crate) async fn exec_order_lookup(
        &self,
        ctx: &mut ExecCtx,
        cfg: &OrderLookupConfig,
        provider: OrderProvider,
    ) -> AppResult<StepOutcome> {
        let order_number = ctx
            .bag
            .get_str(&cfg.order_variable)
            .unwrap_or_else(|| ctx.bag.render(&cfg.order_variable));
        if order_number.trim().is_empty() {
            return Err(AppError::Validation("order lookup without order number".to_string()));
        }
        let base = cfg.store_url.trim_end_matches('/');

        let order: Option<Value> = match provider {
            OrderProvider::Shopify => {
                let url = format!(
                    "{}/admin/api/2024-01/orders.json?name={}&status=any",
                    base,
                    urlencoding::encode(&format!("#{}", order_number.trim_start_matches('#')))
                );
                let resp = self
                    .state()
                    .http
                    .get(&url)
                    .header("X-Shopify-Access-Token", &cfg.api_key)
                    .timeout(SERVICE_TIMEOUT)
                    .send()
                    .await?;
                let body: Value = resp.json().await.unwrap_or(Value::Null);
                body.get("orders")
                    .and_then(|o| o.as_array())
                    .and_then(|o| o.first())
                    .cloned()
            }
            OrderProvider::Woocommerce => {
                let url = format!(
                    "{}/wp-json/wc/v3/orders?search={}",
                    base,
                    urlencoding::encode(order_number.trim())
                );
                let resp = self
                    .state()
                    .http
                    .get(&url)
                    .basic_auth(&cfg.api_key, Some(&cfg.api_secret))
                    .timeout(SERVICE_TIMEOUT)
                    .send()
                    .await?;
                let body: Value = resp.json().await.unwrap_or(Value::Null);
                body.as_array().and_then(|o| o.first()).cloned()
            }
        };

        match order {
            Some(order) => {
                for (field, variable) in &cfg.store {
                    if let Some(tokens) = parse_path(field) {
                        if let Some(value) = json_path(&order, &tokens) {
                            ctx.bag.set(variable, value.clone());
                        }
                    }
                }
                Ok(StepOutcome::Continue(Some("success".to_string())))
            }
            None => {
                warn!("order '{}' not found at {}", order_number, base);
                Ok(StepOutcome::Continue(Some("fail".to_string())))
            }
        }
    }
}

/// Maps JSON response paths into bag variables; silently skips paths the
/// response does not contain.
fn map_response(
    bag: &mut super::vars::VariableBag,
    body: &Value,
    mappings: &std::collections::HashMap<String, String>,
) {
    for (path, variable) in mappings {
        let Some(tokens) = parse_path(path) else {
            continue;
        };
        if let Some(value) = json_path(body, &tokens) {
            bag.set(variable, value.clone());
        }
    }
}

fn api_route_matches(value: &str, operator: &str, target: &str) -> bool {
    match operator {
        "!=" => value != target,
        "contains" => value.contains(target),
        "<" => matches!(
            (value.parse::<f64>(), target.parse::<f64>()),
            (Ok(a), Ok(b)) if a < b
        ),
        ">" => matches!(
            (value.parse::<f64>(), target.parse::<f64>()),
            (Ok(a), Ok(b)) if a > b
        ),
        _ => value == target,
    }
}

fn extract_drive_urls(body: &Value) -> Vec<String> {
    let items = match body {
        Value::Array(items) => items.clone(),
        Value::Object(_) => body
            .get("files")
            .or_else(|| body.get("urls"))
            .and_then(|f| f.as_array())
            .cloned()
            .unwrap_or_default(),
        _ => Vec::new(),
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(url) => Some(url.clone()),
            Value::Object(_) => item
                .get("url")
                .or_else(|| item.get("link"))
                .and_then(|u| u.as_str())
                .map(String::from),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::vars::VariableBag;
    use std::collections::HashMap;

    #[test]
    fn response_mapping_follows_paths() {
        let mut bag = VariableBag::new();
        let body = serde_json::json!({
            "order": {"status": "shipped", "items": [{"sku": "A-1"}]},
            "count": 2
        });
        let mut mappings = HashMap::new();
        mappings.insert("order.status".to_string(), "order_status".to_string());
        mappings.insert("order.items[0].sku".to_string(), "first_sku".to_string());
        mappings.insert("missing.path".to_string(), "nope".to_string());

        map_response(&mut bag, &body, &mappings);
        assert_eq!(bag.get_str("order_status").unwrap(), "shipped");
        assert_eq!(bag.get_str("first_sku").unwrap(), "A-1");
        assert!(bag.get("nope").is_none());
    }

    #[test]
    fn api_route_operators() {
        assert!(api_route_matches("shipped", "==", "shipped"));
        assert!(api_route_matches("shipped", "contains", "ship"));
        assert!(api_route_matches("pending", "!=", "shipped"));
        assert!(api_route_matches("3", "<", "10"));
        assert!(!api_route_matches("30", "<", "10"));
    }

    #[test]
    fn drive_url_extraction_accepts_both_shapes() {
        let flat = serde_json::json!(["https://a/1.png", "https://a/2.png"]);
        assert_eq!(extract_drive_urls(&flat).len(), 2);

        let nested = serde_json::json!({"files": [{"url": "https://a/3.png"}, {"link": "https://a/4.png"}]});
        let urls = extract_drive_urls(&nested);
        assert_eq!(urls, vec!["https://a/3.png", "https://a/4.png"]);

        assert!(extract_drive_urls(&serde_json::json!(null)).is_empty());
    }
}
