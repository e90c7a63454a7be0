//! Inbound webhook envelope types (Cloud API `whatsapp_business_account`
//! object) and the accessors the fan-out path needs.

use crate::shared::models::MessageKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Deserialize, Serialize)]
pub struct WebhookEnvelope {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct WebhookEntry {
    pub id: String,
    #[serde(default)]
    pub changes: Vec<WebhookChange>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct WebhookChange {
    pub value: ChangeValue,
    pub field: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ChangeValue {
    #[serde(default)]
    pub messaging_product: String,
    pub metadata: Metadata,
    #[serde(default)]
    pub contacts: Vec<WebhookContact>,
    #[serde(default)]
    pub messages: Vec<IncomingMessage>,
    #[serde(default)]
    pub statuses: Vec<StatusUpdate>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Metadata {
    pub display_phone_number: String,
    pub phone_number_id: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct WebhookContact {
    pub profile: ContactProfile,
    pub wa_id: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ContactProfile {
    pub name: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct IncomingMessage {
    pub from: String,
    pub id: String,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub text: Option<TextContent>,
    #[serde(default)]
    pub image: Option<MediaContent>,
    #[serde(default)]
    pub video: Option<MediaContent>,
    #[serde(default)]
    pub audio: Option<MediaContent>,
    #[serde(default)]
    pub document: Option<MediaContent>,
    #[serde(default)]
    pub sticker: Option<MediaContent>,
    #[serde(default)]
    pub location: Option<LocationContent>,
    #[serde(default)]
    pub interactive: Option<InteractiveContent>,
    #[serde(default)]
    pub button: Option<ButtonContent>,
    #[serde(default)]
    pub reaction: Option<ReactionContent>,
    #[serde(default)]
    pub order: Option<Value>,
    #[serde(default)]
    pub contacts: Option<Value>,
    #[serde(default)]
    pub context: Option<MessageContext>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct TextContent {
    pub body: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct MediaContent {
    pub id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LocationContent {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct InteractiveContent {
    #[serde(rename = "type")]
    pub interactive_type: String,
    #[serde(default)]
    pub button_reply: Option<ReplyContent>,
    #[serde(default)]
    pub list_reply: Option<ReplyContent>,
    #[serde(default)]
    pub nfm_reply: Option<NfmReply>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ReplyContent {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Meta Flow form submission.
#[derive(Debug, Deserialize, Serialize)]
pub struct NfmReply {
    #[serde(default)]
    pub response_json: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Quick-reply button on a template message.
#[derive(Debug, Deserialize, Serialize)]
pub struct ButtonContent {
    #[serde(default)]
    pub payload: Option<String>,
    pub text: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ReactionContent {
    pub message_id: String,
    #[serde(default)]
    pub emoji: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct MessageContext {
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct StatusUpdate {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub recipient_id: String,
    #[serde(default)]
    pub errors: Vec<StatusError>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct StatusError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: Option<String>,
}

impl IncomingMessage {
    pub fn kind(&self) -> MessageKind {
        MessageKind::parse(&self.message_type)
    }

    /// Text rendered into the inbox and handed to the interpreter:
    /// body for text, selection title for interactive, button text for
    /// template quick-replies, caption (or a placeholder) for media.
    pub fn display_text(&self) -> String {
        if let Some(t) = &self.text {
            return t.body.clone();
        }
        if let Some(i) = &self.interactive {
            if let Some(r) = &i.button_reply {
                return r.title.clone();
            }
            if let Some(r) = &i.list_reply {
                return r.title.clone();
            }
            if i.nfm_reply.is_some() {
                return "[form response]".to_string();
            }
        }
        if let Some(b) = &self.button {
            return b.text.clone();
        }
        if let Some(l) = &self.location {
            return format!("[location: {}, {}]", l.latitude, l.longitude);
        }
        if let Some(r) = &self.reaction {
            return r.emoji.clone().unwrap_or_else(|| "[reaction]".to_string());
        }
        if let Some(media) = self.media() {
            return media
                .caption
                .clone()
                .unwrap_or_else(|| format!("[{}]", self.message_type));
        }
        format!("[{}]", self.message_type)
    }

    pub fn media(&self) -> Option<&MediaContent> {
        self.image
            .as_ref()
            .or(self.video.as_ref())
            .or(self.audio.as_ref())
            .or(self.document.as_ref())
            .or(self.sticker.as_ref())
    }

    /// Id of an interactive selection (button or list row).
    pub fn reply_id(&self) -> Option<&str> {
        let i = self.interactive.as_ref()?;
        i.button_reply
            .as_ref()
            .or(i.list_reply.as_ref())
            .map(|r| r.id.as_str())
    }

    pub fn list_reply(&self) -> Option<&ReplyContent> {
        self.interactive.as_ref()?.list_reply.as_ref()
    }

    pub fn nfm_reply(&self) -> Option<&NfmReply> {
        self.interactive.as_ref()?.nfm_reply.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(value: Value) -> WebhookEnvelope {
        serde_json::from_value(value).expect("parse envelope")
    }

    fn text_envelope() -> Value {
        json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "225001",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "messaging_product": "whatsapp",
                        "metadata": {
                            "display_phone_number": "15550001111",
                            "phone_number_id": "1150001"
                        },
                        "contacts": [{"profile": {"name": "Asha"}, "wa_id": "911234500001"}],
                        "messages": [{
                            "from": "911234500001",
                            "id": "wamid.X1",
                            "timestamp": "1717000000",
                            "type": "text",
                            "text": {"body": "HI"}
                        }]
                    }
                }]
            }]
        })
    }

    #[test]
    fn parses_text_message_envelope() {
        let env = envelope(text_envelope());
        let value = &env.entry[0].changes[0].value;
        assert_eq!(value.metadata.phone_number_id, "1150001");
        let msg = &value.messages[0];
        assert_eq!(msg.display_text(), "HI");
        assert_eq!(msg.kind(), MessageKind::Text);
        assert!(msg.media().is_none());
    }

    #[test]
    fn parses_status_envelope() {
        let env = envelope(json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "225001",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "messaging_product": "whatsapp",
                        "metadata": {
                            "display_phone_number": "15550001111",
                            "phone_number_id": "1150001"
                        },
                        "statuses": [{
                            "id": "wamid.OUT1",
                            "status": "delivered",
                            "timestamp": "1717000001",
                            "recipient_id": "911234500001"
                        }]
                    }
                }]
            }]
        }));
        let value = &env.entry[0].changes[0].value;
        assert!(value.messages.is_empty());
        assert_eq!(value.statuses[0].status, "delivered");
    }

    #[test]
    fn interactive_reply_accessors() {
        let env = envelope(json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "225001",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "messaging_product": "whatsapp",
                        "metadata": {"display_phone_number": "1", "phone_number_id": "2"},
                        "messages": [{
                            "from": "911234500001",
                            "id": "wamid.X2",
                            "timestamp": "1717000000",
                            "type": "interactive",
                            "interactive": {
                                "type": "list_reply",
                                "list_reply": {"id": "row_10", "title": "Item 10"}
                            }
                        }]
                    }
                }]
            }]
        }));
        let msg = &env.entry[0].changes[0].value.messages[0];
        assert_eq!(msg.reply_id(), Some("row_10"));
        assert_eq!(msg.display_text(), "Item 10");
        assert!(msg.list_reply().is_some());
    }

    #[test]
    fn media_caption_feeds_display_text() {
        let env = envelope(json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "1",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "messaging_product": "whatsapp",
                        "metadata": {"display_phone_number": "1", "phone_number_id": "2"},
                        "messages": [{
                            "from": "911234500001",
                            "id": "wamid.X3",
                            "timestamp": "1717000000",
                            "type": "image",
                            "image": {"id": "mid.1", "mime_type": "image/jpeg", "caption": "receipt"}
                        }]
                    }
                }]
            }]
        }));
        let msg = &env.entry[0].changes[0].value.messages[0];
        assert_eq!(msg.display_text(), "receipt");
        assert_eq!(msg.media().unwrap().id, "mid.1");
    }
}
