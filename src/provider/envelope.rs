//! Outbound message envelopes and Cloud API payload construction.
//!
//! Every outbound variant renders to exactly one `/messages` payload, so a
//! send either fully happens or fully fails. The template-component
//! sanitizer here is normative: broadcast and flow sends both go through it.

use crate::shared::models::MessageKind;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Document => "document",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            "document" => Some(Self::Document),
            _ => None,
        }
    }
}

/// Media source: exactly one of an external URL or a provider media id.
#[derive(Debug, Clone)]
pub enum MediaSource {
    Link(String),
    ProviderId(String),
}

#[derive(Debug, Clone)]
pub enum Outbound {
    Text {
        body: String,
    },
    Media {
        kind: MediaKind,
        source: MediaSource,
        caption: Option<String>,
        file_name: Option<String>,
    },
    Template {
        name: String,
        language: String,
        components: Vec<Value>,
    },
    Buttons {
        body: String,
        buttons: Vec<(String, String)>,
    },
    List {
        body: String,
        button_label: String,
        sections: Vec<(String, Vec<(String, String, String)>)>,
    },
    FlowCta {
        body: String,
        cta: String,
        flow_id: String,
        flow_token: String,
        screen: String,
    },
    Catalog {
        body: String,
        catalog_id: String,
        section_title: String,
        product_ids: Vec<String>,
    },
}

impl Outbound {
    /// Message kind recorded in the inbox for this envelope.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text { .. } => MessageKind::Text,
            Self::Media { kind, .. } => match kind {
                MediaKind::Image => MessageKind::Image,
                MediaKind::Video => MessageKind::Video,
                MediaKind::Audio => MessageKind::Audio,
                MediaKind::Document => MessageKind::Document,
            },
            Self::Template { .. } => MessageKind::Template,
            Self::Buttons { .. } | Self::List { .. } | Self::FlowCta { .. } => {
                MessageKind::Interactive
            }
            Self::Catalog { .. } => MessageKind::Catalog,
        }
    }

    /// Body text recorded in the inbox and used for conversation previews.
    pub fn preview_body(&self) -> String {
        match self {
            Self::Text { body } => body.clone(),
            Self::Media { caption, kind, .. } => caption
                .clone()
                .unwrap_or_else(|| format!("[{}]", kind.as_str())),
            Self::Template { name, .. } => format!("[template: {}]", name),
            Self::Buttons { body, .. } | Self::List { body, .. } | Self::FlowCta { body, .. } => {
                body.clone()
            }
            Self::Catalog { body, .. } => body.clone(),
        }
    }

    /// Builds the Cloud API `/messages` payload for this envelope.
    pub fn to_payload(&self, to: &str) -> Value {
        match self {
            Self::Text { body } => json!({
                "messaging_product": "whatsapp",
                "recipient_type": "individual",
                "to": to,
                "type": "text",
                "text": { "body": body, "preview_url": true }
            }),
            Self::Media {
                kind,
                source,
                caption,
                file_name,
            } => {
                let mut media = Map::new();
                match source {
                    MediaSource::Link(url) => {
                        media.insert("link".to_string(), json!(url));
                    }
                    MediaSource::ProviderId(id) => {
                        media.insert("id".to_string(), json!(id));
                    }
                }
                // Audio payloads accept no caption.
                if *kind != MediaKind::Audio {
                    if let Some(c) = caption {
                        if !c.is_empty() {
                            media.insert("caption".to_string(), json!(c));
                        }
                    }
                }
                if *kind == MediaKind::Document {
                    if let Some(f) = file_name {
                        if !f.is_empty() {
                            media.insert("filename".to_string(), json!(f));
                        }
                    }
                }
                let mut payload = Map::new();
                payload.insert("messaging_product".to_string(), json!("whatsapp"));
                payload.insert("recipient_type".to_string(), json!("individual"));
                payload.insert("to".to_string(), json!(to));
                payload.insert("type".to_string(), json!(kind.as_str()));
                payload.insert(kind.as_str().to_string(), Value::Object(media));
                Value::Object(payload)
            }
            Self::Template {
                name,
                language,
                components,
            } => json!({
                "messaging_product": "whatsapp",
                "to": to,
                "type": "template",
                "template": {
                    "name": name,
                    "language": { "code": language },
                    "components": sanitize_template_components(components),
                }
            }),
            Self::Buttons { body, buttons } => {
                let rendered: Vec<Value> = buttons
                    .iter()
                    .take(3)
                    .map(|(id, title)| {
                        json!({
                            "type": "reply",
                            "reply": { "id": id, "title": title }
                        })
                    })
                    .collect();
                json!({
                    "messaging_product": "whatsapp",
                    "recipient_type": "individual",
                    "to": to,
                    "type": "interactive",
                    "interactive": {
                        "type": "button",
                        "body": { "text": body },
                        "action": { "buttons": rendered }
                    }
                })
            }
            Self::List {
                body,
                button_label,
                sections,
            } => {
                let rendered: Vec<Value> = sections
                    .iter()
                    .map(|(title, rows)| {
                        let rows: Vec<Value> = rows
                            .iter()
                            .map(|(id, row_title, description)| {
                                let mut row = Map::new();
                                row.insert("id".to_string(), json!(id));
                                row.insert("title".to_string(), json!(truncate(row_title, 24)));
                                if !description.is_empty() {
                                    row.insert(
                                        "description".to_string(),
                                        json!(truncate(description, 72)),
                                    );
                                }
                                Value::Object(row)
                            })
                            .collect();
                        json!({ "title": truncate(title, 24), "rows": rows })
                    })
                    .collect();
                json!({
                    "messaging_product": "whatsapp",
                    "recipient_type": "individual",
                    "to": to,
                    "type": "interactive",
                    "interactive": {
                        "type": "list",
                        "body": { "text": body },
                        "action": {
                            "button": truncate(button_label, 20),
                            "sections": rendered
                        }
                    }
                })
            }
            Self::FlowCta {
                body,
                cta,
                flow_id,
                flow_token,
                screen,
            } => json!({
                "messaging_product": "whatsapp",
                "recipient_type": "individual",
                "to": to,
                "type": "interactive",
                "interactive": {
                    "type": "flow",
                    "body": { "text": body },
                    "action": {
                        "name": "flow",
                        "parameters": {
                            "flow_message_version": "3",
                            "flow_id": flow_id,
                            "flow_token": flow_token,
                            "flow_cta": cta,
                            "flow_action": "navigate",
                            "flow_action_payload": { "screen": screen }
                        }
                    }
                }
            }),
            Self::Catalog {
                body,
                catalog_id,
                section_title,
                product_ids,
            } => {
                let items: Vec<Value> = product_ids
                    .iter()
                    .map(|id| json!({ "product_retailer_id": id }))
                    .collect();
                json!({
                    "messaging_product": "whatsapp",
                    "recipient_type": "individual",
                    "to": to,
                    "type": "interactive",
                    "interactive": {
                        "type": "product_list",
                        "body": { "text": body },
                        "action": {
                            "catalog_id": catalog_id,
                            "sections": [{ "title": section_title, "product_items": items }]
                        }
                    }
                })
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

const HEADER_PARAM_TYPES: [&str; 4] = ["image", "video", "document", "text"];

/// Drops malformed template components instead of letting the provider
/// reject the whole send:
/// - components without parameters are removed entirely;
/// - header components keep only a first parameter typed image/video/
///   document/text;
/// - body components keep only typed text parameters;
/// - button components require `sub_type` and `index`.
pub fn sanitize_template_components(components: &[Value]) -> Vec<Value> {
    let mut out = Vec::new();
    for component in components {
        let Some(kind) = component.get("type").and_then(|t| t.as_str()) else {
            continue;
        };
        let params: Vec<Value> = component
            .get("parameters")
            .and_then(|p| p.as_array())
            .cloned()
            .unwrap_or_default();
        match kind {
            "header" => {
                let valid = params
                    .first()
                    .and_then(|p| p.get("type"))
                    .and_then(|t| t.as_str())
                    .map(|t| HEADER_PARAM_TYPES.contains(&t))
                    .unwrap_or(false);
                if valid {
                    out.push(json!({ "type": "header", "parameters": [params[0].clone()] }));
                }
            }
            "body" => {
                let texts: Vec<Value> = params
                    .into_iter()
                    .filter(|p| {
                        p.get("type").and_then(|t| t.as_str()) == Some("text")
                            && p.get("text").is_some()
                    })
                    .collect();
                if !texts.is_empty() {
                    out.push(json!({ "type": "body", "parameters": texts }));
                }
            }
            "button" => {
                if component.get("sub_type").is_some()
                    && component.get("index").is_some()
                    && !params.is_empty()
                {
                    out.push(component.clone());
                }
            }
            _ => {
                if !params.is_empty() {
                    out.push(component.clone());
                }
            }
        }
    }
    out
}

/// Builds the component list for a broadcast recipient: header media first
/// when attached, then body parameters sorted numerically by index with
/// empty values coerced to `-` so the parameter count stays stable.
pub fn build_template_components(
    header: Option<(&MediaKind, &str)>,
    body_params: &Map<String, Value>,
) -> Vec<Value> {
    let mut components = Vec::new();

    if let Some((kind, media_id)) = header {
        components.push(json!({
            "type": "header",
            "parameters": [{
                "type": kind.as_str(),
                kind.as_str(): { "id": media_id }
            }]
        }));
    }

    let mut keys: Vec<&String> = body_params.keys().collect();
    keys.sort_by_key(|k| k.parse::<u32>().unwrap_or(u32::MAX));
    let params: Vec<Value> = keys
        .iter()
        .map(|k| {
            let raw = body_params
                .get(*k)
                .map(crate::flow::vars::render_value)
                .unwrap_or_default();
            let text = if raw.trim().is_empty() {
                "-".to_string()
            } else {
                raw
            };
            json!({ "type": "text", "text": text })
        })
        .collect();
    if !params.is_empty() {
        components.push(json!({ "type": "body", "parameters": params }));
    }

    components
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_payload_shape() {
        let p = Outbound::Text {
            body: "Hello".into(),
        }
        .to_payload("911234500001");
        assert_eq!(p["messaging_product"], "whatsapp");
        assert_eq!(p["to"], "911234500001");
        assert_eq!(p["type"], "text");
        assert_eq!(p["text"]["body"], "Hello");
    }

    #[test]
    fn media_payload_uses_exactly_one_source() {
        let linked = Outbound::Media {
            kind: MediaKind::Image,
            source: MediaSource::Link("https://example.com/a.png".into()),
            caption: Some("cap".into()),
            file_name: None,
        }
        .to_payload("1");
        assert_eq!(linked["image"]["link"], "https://example.com/a.png");
        assert!(linked["image"].get("id").is_none());

        let by_id = Outbound::Media {
            kind: MediaKind::Document,
            source: MediaSource::ProviderId("mid.123".into()),
            caption: None,
            file_name: Some("invoice.pdf".into()),
        }
        .to_payload("1");
        assert_eq!(by_id["document"]["id"], "mid.123");
        assert_eq!(by_id["document"]["filename"], "invoice.pdf");
        assert!(by_id["document"].get("link").is_none());
    }

    #[test]
    fn audio_drops_caption() {
        let p = Outbound::Media {
            kind: MediaKind::Audio,
            source: MediaSource::ProviderId("mid.9".into()),
            caption: Some("ignored".into()),
            file_name: None,
        }
        .to_payload("1");
        assert!(p["audio"].get("caption").is_none());
    }

    #[test]
    fn buttons_cap_at_three() {
        let p = Outbound::Buttons {
            body: "Pick".into(),
            buttons: (0..5)
                .map(|i| (format!("b{}", i), format!("B{}", i)))
                .collect(),
        }
        .to_payload("1");
        assert_eq!(
            p["interactive"]["action"]["buttons"].as_array().unwrap().len(),
            3
        );
    }

    #[test]
    fn sanitizer_drops_parameterless_components() {
        let sanitized = sanitize_template_components(&[
            json!({"type": "body", "parameters": []}),
            json!({"type": "body"}),
        ]);
        assert!(sanitized.is_empty());
    }

    #[test]
    fn sanitizer_keeps_valid_header_and_typed_body() {
        let sanitized = sanitize_template_components(&[
            json!({"type": "header", "parameters": [{"type": "image", "image": {"id": "m1"}}]}),
            json!({"type": "body", "parameters": [
                {"type": "text", "text": "a"},
                {"type": "currency", "currency": {}},
            ]}),
        ]);
        assert_eq!(sanitized.len(), 2);
        assert_eq!(sanitized[0]["type"], "header");
        let body_params = sanitized[1]["parameters"].as_array().unwrap();
        assert_eq!(body_params.len(), 1);
        assert_eq!(body_params[0]["text"], "a");
    }

    #[test]
    fn sanitizer_rejects_header_with_bad_param_type() {
        let sanitized = sanitize_template_components(&[
            json!({"type": "header", "parameters": [{"type": "payload", "payload": "x"}]}),
        ]);
        assert!(sanitized.is_empty());
    }

    #[test]
    fn sanitizer_requires_button_subtype_and_index() {
        let kept = sanitize_template_components(&[json!({
            "type": "button", "sub_type": "url", "index": "0",
            "parameters": [{"type": "text", "text": "go"}]
        })]);
        assert_eq!(kept.len(), 1);

        let dropped = sanitize_template_components(&[json!({
            "type": "button",
            "parameters": [{"type": "text", "text": "go"}]
        })]);
        assert!(dropped.is_empty());
    }

    #[test]
    fn component_builder_orders_numerically_and_coerces_empty() {
        let mut params = Map::new();
        params.insert("10".to_string(), json!("ten"));
        params.insert("2".to_string(), json!(""));
        params.insert("1".to_string(), json!("one"));

        let components = build_template_components(None, &params);
        assert_eq!(components.len(), 1);
        let body = components[0]["parameters"].as_array().unwrap();
        assert_eq!(body[0]["text"], "one");
        assert_eq!(body[1]["text"], "-");
        assert_eq!(body[2]["text"], "ten");
    }

    #[test]
    fn header_only_template_omits_body() {
        let components =
            build_template_components(Some((&MediaKind::Video, "mid.7")), &Map::new());
        assert_eq!(components.len(), 1);
        assert_eq!(components[0]["type"], "header");
        assert_eq!(components[0]["parameters"][0]["video"]["id"], "mid.7");
    }
}
