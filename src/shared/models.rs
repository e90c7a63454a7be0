use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---- status enums ----------------------------------------------------------
//
// Statuses are stored as text columns. Each enum round-trips through
// Display/FromStr; unknown strings map to a conservative default on read.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Closed,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "expired" => Self::Expired,
            _ => Self::Closed,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Open,
    Pending,
    Resolved,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "resolved" => Self::Resolved,
            "closed" => Self::Closed,
            _ => Self::Open,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Position in the monotone chain. `failed` is terminal and outranks
    /// everything, so a failure is never overwritten by a late `delivered`.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Read => 3,
            Self::Failed => 4,
        }
    }

    pub fn advances_over(&self, current: &MessageStatus) -> bool {
        self.rank() > current.rank()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "out" {
            Self::Out
        } else {
            Self::In
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Location,
    Contacts,
    Sticker,
    Interactive,
    Button,
    List,
    Template,
    Reaction,
    Order,
    Catalog,
    Flow,
    System,
    Unknown,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Document => "document",
            Self::Location => "location",
            Self::Contacts => "contacts",
            Self::Sticker => "sticker",
            Self::Interactive => "interactive",
            Self::Button => "button",
            Self::List => "list",
            Self::Template => "template",
            Self::Reaction => "reaction",
            Self::Order => "order",
            Self::Catalog => "catalog",
            Self::Flow => "flow",
            Self::System => "system",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "text" => Self::Text,
            "image" => Self::Image,
            "video" => Self::Video,
            "audio" => Self::Audio,
            "document" => Self::Document,
            "location" => Self::Location,
            "contacts" => Self::Contacts,
            "sticker" => Self::Sticker,
            "interactive" => Self::Interactive,
            "button" => Self::Button,
            "list" => Self::List,
            "template" => Self::Template,
            "reaction" => Self::Reaction,
            "order" => Self::Order,
            "catalog" => Self::Catalog,
            "flow" => Self::Flow,
            "system" => Self::System,
            _ => Self::Unknown,
        }
    }

    pub fn has_media(&self) -> bool {
        matches!(
            self,
            Self::Image | Self::Video | Self::Audio | Self::Document | Self::Sticker
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastStatus {
    Pending,
    Scheduled,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl BroadcastStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "scheduled" => Self::Scheduled,
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => Self::Pending,
        }
    }

    pub fn startable(&self) -> bool {
        matches!(self, Self::Pending | Self::Scheduled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
    Cancelled,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

// ---- entities --------------------------------------------------------------

/// A tenant. Carries its own Cloud API credentials; every other entity in
/// the system hangs off one organization.
#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = organizations)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub phone_number_id: String,
    pub display_phone_number: String,
    pub business_account_id: String,
    pub access_token: String,
    pub verify_token: String,
    pub api_key: Option<String>,
    pub external_webhook_url: Option<String>,
    pub external_webhook_secret: Option<String>,
    pub subscription_status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Organization {
    pub fn subscription(&self) -> SubscriptionStatus {
        SubscriptionStatus::parse(&self.subscription_status)
    }
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = contacts)]
pub struct Contact {
    pub id: Uuid,
    pub org_id: Uuid,
    pub wa_id: String,
    pub phone: String,
    pub display_name: Option<String>,
    pub profile_name: Option<String>,
    pub email: Option<String>,
    pub labels: Vec<Option<String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    /// Best display string for templating and previews.
    pub fn known_name(&self) -> String {
        self.display_name
            .clone()
            .or_else(|| self.profile_name.clone())
            .unwrap_or_else(|| "Customer".to_string())
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = contacts)]
pub struct NewContact {
    pub id: Uuid,
    pub org_id: Uuid,
    pub wa_id: String,
    pub phone: String,
    pub profile_name: Option<String>,
    pub labels: Vec<Option<String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = conversations)]
pub struct Conversation {
    pub id: Uuid,
    pub org_id: Uuid,
    pub contact_id: Uuid,
    pub status: String,
    pub assigned_agent: Option<Uuid>,
    pub unread_count: i32,
    pub last_message_at: DateTime<Utc>,
    pub last_preview: Option<String>,
    pub broadcast_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = conversations)]
pub struct NewConversation {
    pub id: Uuid,
    pub org_id: Uuid,
    pub contact_id: Uuid,
    pub status: String,
    pub unread_count: i32,
    pub last_message_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = messages)]
pub struct Message {
    pub id: Uuid,
    pub org_id: Uuid,
    pub conversation_id: Uuid,
    pub direction: String,
    pub kind: String,
    pub body: String,
    pub caption: Option<String>,
    pub media_url: Option<String>,
    pub media_id: Option<String>,
    pub media_mime: Option<String>,
    pub media_size: Option<i64>,
    pub file_name: Option<String>,
    pub status: String,
    pub provider_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn message_status(&self) -> MessageStatus {
        MessageStatus::parse(&self.status).unwrap_or(MessageStatus::Pending)
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = messages)]
pub struct NewMessage {
    pub id: Uuid,
    pub org_id: Uuid,
    pub conversation_id: Uuid,
    pub direction: String,
    pub kind: String,
    pub body: String,
    pub caption: Option<String>,
    pub media_url: Option<String>,
    pub media_id: Option<String>,
    pub media_mime: Option<String>,
    pub media_size: Option<i64>,
    pub file_name: Option<String>,
    pub status: String,
    pub provider_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A user-authored automation: node list + edge list stored as JSON and
/// parsed into the typed graph on load.
#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = flows)]
pub struct Flow {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub definition: serde_json::Value,
    pub trigger_keyword: Option<String>,
    pub is_default: bool,
    pub working_hours: Option<serde_json::Value>,
    pub session_timeout_secs: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = flow_sessions)]
pub struct FlowSession {
    pub id: Uuid,
    pub org_id: Uuid,
    pub contact_id: Uuid,
    pub flow_id: Uuid,
    pub current_node: Option<String>,
    pub variables: serde_json::Value,
    pub last_interaction: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = flow_sessions)]
pub struct NewFlowSession {
    pub id: Uuid,
    pub org_id: Uuid,
    pub contact_id: Uuid,
    pub flow_id: Uuid,
    pub current_node: Option<String>,
    pub variables: serde_json::Value,
    pub last_interaction: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = broadcasts)]
pub struct Broadcast {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub template_name: String,
    pub template_language: String,
    pub header_media_id: Option<String>,
    pub header_media_kind: Option<String>,
    pub status: String,
    pub total_recipients: i32,
    pub sent_count: i32,
    pub delivered_count: i32,
    pub read_count: i32,
    pub failed_count: i32,
    pub replied_count: i32,
    pub chatbot_enabled: bool,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Broadcast {
    pub fn broadcast_status(&self) -> BroadcastStatus {
        BroadcastStatus::parse(&self.status)
    }
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = broadcast_recipients)]
pub struct BroadcastRecipient {
    pub id: Uuid,
    pub org_id: Uuid,
    pub broadcast_id: Uuid,
    pub phone: String,
    pub variables: serde_json::Value,
    pub status: String,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = scheduled_notifications)]
pub struct ScheduledNotification {
    pub id: Uuid,
    pub org_id: Uuid,
    pub external_id: String,
    pub template_name: String,
    pub phone: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub scheduled_at: DateTime<Utc>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = quick_replies)]
pub struct QuickReply {
    pub id: Uuid,
    pub org_id: Uuid,
    pub shortcut: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = conversation_notes)]
pub struct ConversationNote {
    pub id: Uuid,
    pub org_id: Uuid,
    pub conversation_id: Uuid,
    pub author_id: Uuid,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = agents)]
pub struct Agent {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub email: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

// ---- schema ----------------------------------------------------------------

pub mod schema {
    diesel::table! {
        organizations (id) {
            id -> Uuid,
            name -> Text,
            slug -> Text,
            phone_number_id -> Text,
            display_phone_number -> Text,
            business_account_id -> Text,
            access_token -> Text,
            verify_token -> Text,
            api_key -> Nullable<Text>,
            external_webhook_url -> Nullable<Text>,
            external_webhook_secret -> Nullable<Text>,
            subscription_status -> Text,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }

    diesel::table! {
        contacts (id) {
            id -> Uuid,
            org_id -> Uuid,
            wa_id -> Text,
            phone -> Text,
            display_name -> Nullable<Text>,
            profile_name -> Nullable<Text>,
            email -> Nullable<Text>,
            labels -> Array<Nullable<Text>>,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }

    diesel::table! {
        conversations (id) {
            id -> Uuid,
            org_id -> Uuid,
            contact_id -> Uuid,
            status -> Text,
            assigned_agent -> Nullable<Uuid>,
            unread_count -> Int4,
            last_message_at -> Timestamptz,
            last_preview -> Nullable<Text>,
            broadcast_id -> Nullable<Uuid>,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }

    diesel::table! {
        messages (id) {
            id -> Uuid,
            org_id -> Uuid,
            conversation_id -> Uuid,
            direction -> Text,
            kind -> Text,
            body -> Text,
            caption -> Nullable<Text>,
            media_url -> Nullable<Text>,
            media_id -> Nullable<Text>,
            media_mime -> Nullable<Text>,
            media_size -> Nullable<Int8>,
            file_name -> Nullable<Text>,
            status -> Text,
            provider_message_id -> Nullable<Text>,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        flows (id) {
            id -> Uuid,
            org_id -> Uuid,
            name -> Text,
            definition -> Jsonb,
            trigger_keyword -> Nullable<Text>,
            is_default -> Bool,
            working_hours -> Nullable<Jsonb>,
            session_timeout_secs -> Int4,
            is_active -> Bool,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }

    diesel::table! {
        flow_sessions (id) {
            id -> Uuid,
            org_id -> Uuid,
            contact_id -> Uuid,
            flow_id -> Uuid,
            current_node -> Nullable<Text>,
            variables -> Jsonb,
            last_interaction -> Timestamptz,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        broadcasts (id) {
            id -> Uuid,
            org_id -> Uuid,
            name -> Text,
            template_name -> Text,
            template_language -> Text,
            header_media_id -> Nullable<Text>,
            header_media_kind -> Nullable<Text>,
            status -> Text,
            total_recipients -> Int4,
            sent_count -> Int4,
            delivered_count -> Int4,
            read_count -> Int4,
            failed_count -> Int4,
            replied_count -> Int4,
            chatbot_enabled -> Bool,
            scheduled_at -> Nullable<Timestamptz>,
            started_at -> Nullable<Timestamptz>,
            completed_at -> Nullable<Timestamptz>,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        broadcast_recipients (id) {
            id -> Uuid,
            org_id -> Uuid,
            broadcast_id -> Uuid,
            phone -> Text,
            variables -> Jsonb,
            status -> Text,
            provider_message_id -> Nullable<Text>,
            error -> Nullable<Text>,
            updated_at -> Timestamptz,
        }
    }

    diesel::table! {
        scheduled_notifications (id) {
            id -> Uuid,
            org_id -> Uuid,
            external_id -> Text,
            template_name -> Text,
            phone -> Text,
            payload -> Jsonb,
            status -> Text,
            scheduled_at -> Timestamptz,
            error -> Nullable<Text>,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        quick_replies (id) {
            id -> Uuid,
            org_id -> Uuid,
            shortcut -> Text,
            body -> Text,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        conversation_notes (id) {
            id -> Uuid,
            org_id -> Uuid,
            conversation_id -> Uuid,
            author_id -> Uuid,
            body -> Text,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        agents (id) {
            id -> Uuid,
            org_id -> Uuid,
            name -> Text,
            email -> Text,
            is_active -> Bool,
            created_at -> Timestamptz,
        }
    }

    diesel::allow_tables_to_appear_in_same_query!(
        organizations,
        contacts,
        conversations,
        messages,
        flows,
        flow_sessions,
        broadcasts,
        broadcast_recipients,
        scheduled_notifications,
        quick_replies,
        conversation_notes,
        agents,
    );
}

pub use schema::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_status_is_monotone() {
        use MessageStatus::*;
        assert!(Delivered.advances_over(&Sent));
        assert!(Read.advances_over(&Delivered));
        assert!(!Delivered.advances_over(&Read));
        assert!(!Sent.advances_over(&Sent));
        assert!(Failed.advances_over(&Read));
    }

    #[test]
    fn status_round_trips() {
        for s in ["pending", "sent", "delivered", "read", "failed"] {
            assert_eq!(MessageStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(MessageStatus::parse("bogus").is_none());
    }

    #[test]
    fn broadcast_startable_states() {
        assert!(BroadcastStatus::Pending.startable());
        assert!(BroadcastStatus::Scheduled.startable());
        assert!(!BroadcastStatus::Processing.startable());
        assert!(!BroadcastStatus::Cancelled.startable());
        assert!(!BroadcastStatus::Completed.startable());
    }

    #[test]
    fn message_kind_parse_defaults_to_unknown() {
        assert_eq!(MessageKind::parse("text"), MessageKind::Text);
        assert_eq!(MessageKind::parse("nacho"), MessageKind::Unknown);
        assert!(MessageKind::Image.has_media());
        assert!(!MessageKind::Text.has_media());
    }

    #[test]
    fn subscription_parse_defaults_closed() {
        assert!(SubscriptionStatus::parse("active").is_active());
        assert!(!SubscriptionStatus::parse("whatever").is_active());
    }
}
