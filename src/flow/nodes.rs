//! Typed flow graph: node and edge definitions plus the pure graph logic
//! (entry resolution, edge selection, list pagination, keyword matching).
//!
//! Flow definitions are authored in a visual builder and stored as JSON
//! `{nodes: [...], edges: [...]}`. Each node is `{id, type, data}`; the
//! `type` string maps onto [`NodeKind`] so the interpreter can match
//! exhaustively instead of switching on strings.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub const VIRTUAL_START: &str = "start";
/// Rows shown per list page; WhatsApp caps a list at 10 rows and one is
/// reserved for the paging row.
pub const LIST_PAGE_SIZE: usize = 9;
pub const LIST_NEXT_ID: &str = "__next";
pub const LIST_PREV_ID: &str = "__prev";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEdge {
    pub source: String,
    pub target: String,
    #[serde(default, rename = "sourceHandle")]
    pub source_handle: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum NodeKind {
    StartTrigger(StartTriggerConfig),
    #[serde(alias = "text")]
    Message(MessageConfig),
    Image(MediaConfig),
    Video(MediaConfig),
    Document(MediaConfig),
    Button(ButtonConfig),
    List(ListConfig),
    Flow(FlowFormConfig),
    Wait(WaitConfig),
    Delay(DelayConfig),
    Variable(VariableConfig),
    ListVariable(ListVariableConfig),
    UpdateContact(UpdateContactConfig),
    Map(MapConfig),
    Condition(ConditionConfig),
    Router(RouterConfig),
    KeywordMatch(KeywordMatchConfig),
    Validator(ValidatorConfig),
    PhoneParser(PhoneParserConfig),
    BusinessHours(BusinessHoursConfig),
    Api(ApiConfig),
    Sql(SqlConfig),
    GoogleSheet(SheetPushConfig),
    GoogleSheetQuery(SheetQueryConfig),
    DriveImageLookup(DriveLookupConfig),
    MediaForward(MediaForwardConfig),
    Payment(PaymentConfig),
    Shopify(OrderLookupConfig),
    Woocommerce(OrderLookupConfig),
    SendExternal(SendExternalConfig),
    Catalogue(CatalogueConfig),
    GroupImages(GroupImagesConfig),
    Loop(LoopConfig),
    Agent(AgentConfig),
    SessionConfig(SessionTimeoutConfig),
}

impl NodeKind {
    /// Nodes that persist the session and wait for the next inbound event.
    pub fn awaits_input(&self) -> bool {
        matches!(
            self,
            Self::Button(_) | Self::List(_) | Self::Wait(_) | Self::Flow(_)
        )
    }
}

// ---- node configurations ---------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StartTriggerConfig {
    pub keywords: Vec<String>,
    /// "keyword" or "any".
    pub trigger_on: String,
    pub case_sensitive: bool,
    pub partial_match: bool,
}

impl StartTriggerConfig {
    pub fn accepts_any(&self) -> bool {
        self.trigger_on == "any" || self.keywords.is_empty()
    }

    /// Index of the matching keyword, if any.
    pub fn match_keyword(&self, text: &str) -> Option<usize> {
        let haystack = if self.case_sensitive {
            text.trim().to_string()
        } else {
            text.trim().to_lowercase()
        };
        self.keywords.iter().position(|kw| {
            let needle = if self.case_sensitive {
                kw.trim().to_string()
            } else {
                kw.trim().to_lowercase()
            };
            if self.partial_match {
                haystack.contains(&needle)
            } else {
                haystack == needle
            }
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageConfig {
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MediaConfig {
    pub url: String,
    pub media_id: String,
    pub caption: String,
    pub file_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ButtonOption {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ButtonConfig {
    pub text: String,
    pub buttons: Vec<ButtonOption>,
    pub retry_on_invalid: bool,
    pub retry_message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListRow {
    pub id: String,
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListSection {
    pub title: String,
    pub rows: Vec<ListRow>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListConfig {
    pub text: String,
    pub button_label: String,
    pub sections: Vec<ListSection>,
    /// Array variable feeding dynamic rows; overrides `sections` when set.
    pub source_variable: String,
    /// Google Apps Script URL feeding dynamic rows.
    pub sheet_url: String,
    pub sheet_column: String,
    pub store_variable: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlowFormConfig {
    pub flow_id: String,
    pub flow_token: String,
    pub cta: String,
    pub text: String,
    pub screen: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WaitConfig {
    /// any | text | image | video | audio | document | file
    pub expected_type: String,
    pub store_variable: String,
    pub retry_on_invalid: bool,
    pub retry_message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DelayConfig {
    pub seconds: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VariableConfig {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListVariableConfig {
    pub name: String,
    pub source: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateContactConfig {
    pub name: String,
    pub email: String,
    pub add_labels: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MapConfig {
    pub source_variable: String,
    pub template: String,
    pub separator: String,
    pub store_variable: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConditionConfig {
    pub left: String,
    /// equals | contains | not_equals | exists
    pub operator: String,
    pub right: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterCase {
    pub id: String,
    /// == | < | >
    pub operator: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterConfig {
    pub variable: String,
    pub cases: Vec<RouterCase>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeywordCase {
    pub id: String,
    pub keyword: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeywordMatchConfig {
    pub variable: String,
    pub keywords: Vec<KeywordCase>,
    pub case_sensitive: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidatorConfig {
    /// email | phone | pan | aadhar | gst | pincode | image | pdf
    pub kind: String,
    pub variable: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PhonePrefix {
    pub code: String,
    pub prefix: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PhoneParserConfig {
    pub variable: String,
    pub prefixes: Vec<PhonePrefix>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DayWindow {
    pub enabled: bool,
    pub open: String,
    pub close: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BusinessHoursConfig {
    /// IANA zone name, e.g. "Asia/Kolkata".
    pub timezone: String,
    /// Keyed by lowercase three-letter weekday: mon..sun.
    pub days: HashMap<String, DayWindow>,
}

impl BusinessHoursConfig {
    /// Whether `now` falls inside the configured window for its weekday.
    pub fn is_open_at(&self, weekday: &str, time: NaiveTime) -> bool {
        match self.days.get(weekday) {
            Some(w) if w.enabled => {
                let open = NaiveTime::parse_from_str(&w.open, "%H:%M");
                let close = NaiveTime::parse_from_str(&w.close, "%H:%M");
                match (open, close) {
                    (Ok(open), Ok(close)) => time >= open && time < close,
                    _ => false,
                }
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiRoute {
    pub id: String,
    /// == | != | < | > | contains
    pub operator: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiConfig {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: String,
    /// response JSON path -> variable name
    pub response_mappings: HashMap<String, String>,
    /// variable whose mapped value drives custom routes
    pub route_on: String,
    pub routes: Vec<ApiRoute>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SqlConfig {
    pub query: String,
    pub params: Vec<String>,
    /// row JSON path -> variable name
    pub mappings: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SheetPushConfig {
    pub script_url: String,
    /// column -> template
    pub columns: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SheetQueryConfig {
    pub script_url: String,
    /// column -> template for the lookup conditions
    pub conditions: HashMap<String, String>,
    /// returned column -> variable name
    pub store: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DriveLookupConfig {
    /// "api" (native Drive API key) or "script".
    pub mode: String,
    pub api_key: String,
    pub script_url: String,
    pub folder_id: String,
    pub file_name: String,
    pub store_variable: String,
    pub auto_send: bool,
    pub send_delay_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MediaForwardConfig {
    /// "local" saves under the public media dir; "post" relays multipart.
    pub mode: String,
    pub endpoint: String,
    pub field_name: String,
    /// response JSON path -> variable name (post mode)
    pub response_mappings: HashMap<String, String>,
    pub store_variable: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PaymentConfig {
    /// "razorpay" or "stripe".
    pub provider: String,
    pub key_id: String,
    pub key_secret: String,
    pub amount_variable: String,
    pub currency: String,
    pub description: String,
    pub message_template: String,
    pub store_variable: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrderLookupConfig {
    pub store_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub order_variable: String,
    /// order field -> variable name
    pub store: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SendExternalConfig {
    pub phone: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CatalogueProduct {
    pub retailer_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CatalogueConfig {
    pub text: String,
    pub catalog_id: String,
    pub section_title: String,
    pub products: Vec<CatalogueProduct>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupImagesConfig {
    pub source_variable: String,
    pub delay_secs: u64,
    pub final_caption: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoopConfig {
    pub source_variable: String,
    pub item_variable: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionTimeoutConfig {
    pub timeout_secs: i64,
}

// ---- graph -----------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowGraph {
    #[serde(default)]
    pub nodes: Vec<FlowNode>,
    #[serde(default)]
    pub edges: Vec<FlowEdge>,
}

impl FlowGraph {
    pub fn parse(definition: &Value) -> anyhow::Result<Self> {
        Ok(serde_json::from_value(definition.clone())?)
    }

    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn start_trigger(&self) -> Option<&FlowNode> {
        self.nodes
            .iter()
            .find(|n| matches!(n.kind, NodeKind::StartTrigger(_)))
    }

    /// Entry node: a `start_trigger` node, else the target of an edge from
    /// the virtual `start` id, else any node without inbound edges.
    pub fn entry_node(&self) -> Option<&FlowNode> {
        if let Some(n) = self.start_trigger() {
            return Some(n);
        }
        if let Some(edge) = self.edges.iter().find(|e| e.source == VIRTUAL_START) {
            if let Some(n) = self.node(&edge.target) {
                return Some(n);
            }
        }
        self.nodes.iter().find(|n| {
            n.id != VIRTUAL_START && !self.edges.iter().any(|e| e.target == n.id)
        })
    }

    /// Selects the outgoing edge for `handle`. Exact handle match wins;
    /// a handle-less edge doubles as the `default` output.
    pub fn next_node_id(&self, from: &str, handle: Option<&str>) -> Option<&str> {
        let outgoing: Vec<&FlowEdge> = self.edges.iter().filter(|e| e.source == from).collect();
        if let Some(h) = handle {
            if let Some(edge) = outgoing
                .iter()
                .find(|e| e.source_handle.as_deref() == Some(h))
            {
                return Some(edge.target.as_str());
            }
            if h == "default" {
                if let Some(edge) = outgoing.iter().find(|e| e.source_handle.is_none()) {
                    return Some(edge.target.as_str());
                }
            }
            return None;
        }
        outgoing
            .iter()
            .find(|e| e.source_handle.is_none() || e.source_handle.as_deref() == Some("default"))
            .or_else(|| outgoing.first())
            .map(|e| e.target.as_str())
    }

    /// Default successor: the handle-less edge, falling back to `default`.
    pub fn default_next(&self, from: &str) -> Option<&str> {
        self.next_node_id(from, None)
    }

    /// Fail successor for external-service nodes.
    pub fn fail_next(&self, from: &str) -> Option<&str> {
        self.edges
            .iter()
            .find(|e| e.source == from && e.source_handle.as_deref() == Some("fail"))
            .map(|e| e.target.as_str())
    }
}

/// One page of list rows. Pages beyond the first get a Back row; pages with
/// more items behind them get a Next row. Original row ids survive paging.
pub fn paginate_rows(rows: &[ListRow], page: usize) -> Vec<ListRow> {
    let start = page * LIST_PAGE_SIZE;
    let end = (start + LIST_PAGE_SIZE).min(rows.len());
    if start >= rows.len() {
        return Vec::new();
    }
    let mut out: Vec<ListRow> = rows[start..end].to_vec();
    if page > 0 {
        out.push(ListRow {
            id: LIST_PREV_ID.to_string(),
            title: "« Back".to_string(),
            description: String::new(),
        });
    }
    if end < rows.len() {
        out.push(ListRow {
            id: LIST_NEXT_ID.to_string(),
            title: "Next »".to_string(),
            description: String::new(),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn graph(def: Value) -> FlowGraph {
        FlowGraph::parse(&def).expect("parse graph")
    }

    #[test]
    fn parses_typed_nodes_from_builder_json() {
        let g = graph(json!({
            "nodes": [
                {"id": "trig", "type": "start_trigger",
                 "data": {"keywords": ["HI", "HELLO"], "triggerOn": "keyword"}},
                {"id": "greet", "type": "message", "data": {"text": "Hi {{sender_name}}"}},
            ],
            "edges": [
                {"source": "trig", "target": "greet", "sourceHandle": "default"},
            ]
        }));
        assert_eq!(g.nodes.len(), 2);
        match &g.node("trig").unwrap().kind {
            NodeKind::StartTrigger(cfg) => assert_eq!(cfg.keywords, vec!["HI", "HELLO"]),
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn text_is_an_alias_for_message() {
        let g = graph(json!({
            "nodes": [{"id": "a", "type": "text", "data": {"text": "hello"}}],
            "edges": []
        }));
        assert!(matches!(g.node("a").unwrap().kind, NodeKind::Message(_)));
    }

    #[test]
    fn entry_prefers_start_trigger() {
        let g = graph(json!({
            "nodes": [
                {"id": "m", "type": "message", "data": {"text": "x"}},
                {"id": "t", "type": "start_trigger", "data": {}},
            ],
            "edges": [{"source": "t", "target": "m"}]
        }));
        assert_eq!(g.entry_node().unwrap().id, "t");
    }

    #[test]
    fn entry_falls_back_to_virtual_start_edge() {
        let g = graph(json!({
            "nodes": [
                {"id": "a", "type": "message", "data": {"text": "x"}},
                {"id": "b", "type": "message", "data": {"text": "y"}},
            ],
            "edges": [
                {"source": "start", "target": "b"},
                {"source": "b", "target": "a"},
            ]
        }));
        assert_eq!(g.entry_node().unwrap().id, "b");
    }

    #[test]
    fn entry_falls_back_to_unreferenced_node() {
        let g = graph(json!({
            "nodes": [
                {"id": "a", "type": "message", "data": {"text": "x"}},
                {"id": "b", "type": "message", "data": {"text": "y"}},
            ],
            "edges": [{"source": "a", "target": "b"}]
        }));
        assert_eq!(g.entry_node().unwrap().id, "a");
    }

    #[test]
    fn edge_selection_by_handle_with_default_fallback() {
        let g = graph(json!({
            "nodes": [
                {"id": "btn", "type": "button", "data": {}},
                {"id": "yes", "type": "message", "data": {"text": "y"}},
                {"id": "no", "type": "message", "data": {"text": "n"}},
            ],
            "edges": [
                {"source": "btn", "target": "yes", "sourceHandle": "btn0"},
                {"source": "btn", "target": "no"},
            ]
        }));
        assert_eq!(g.next_node_id("btn", Some("btn0")), Some("yes"));
        assert_eq!(g.next_node_id("btn", Some("default")), Some("no"));
        assert_eq!(g.next_node_id("btn", Some("btn7")), None);
        assert_eq!(g.default_next("btn"), Some("no"));
    }

    #[test]
    fn keyword_match_respects_case_and_partial_flags() {
        let exact = StartTriggerConfig {
            keywords: vec!["HI".into(), "HELLO".into()],
            trigger_on: "keyword".into(),
            case_sensitive: false,
            partial_match: false,
        };
        assert_eq!(exact.match_keyword("hi"), Some(0));
        assert_eq!(exact.match_keyword(" hello "), Some(1));
        assert_eq!(exact.match_keyword("hi there"), None);

        let partial = StartTriggerConfig {
            partial_match: true,
            ..exact.clone()
        };
        assert_eq!(partial.match_keyword("oh hi there"), Some(0));

        let cased = StartTriggerConfig {
            case_sensitive: true,
            ..exact
        };
        assert_eq!(cased.match_keyword("hi"), None);
        assert_eq!(cased.match_keyword("HI"), Some(0));
    }

    #[test]
    fn pagination_caps_at_nine_rows_and_pages() {
        let rows: Vec<ListRow> = (0..14)
            .map(|i| ListRow {
                id: format!("row_{}", i),
                title: format!("Item {}", i),
                description: String::new(),
            })
            .collect();

        let page0 = paginate_rows(&rows, 0);
        assert_eq!(page0.len(), 10);
        assert_eq!(page0[0].id, "row_0");
        assert_eq!(page0[8].id, "row_8");
        assert_eq!(page0[9].id, LIST_NEXT_ID);

        let page1 = paginate_rows(&rows, 1);
        assert_eq!(page1[0].id, "row_9");
        assert_eq!(page1.last().unwrap().id, LIST_PREV_ID);
        assert!(page1.iter().any(|r| r.id == "row_10"));
        assert!(!page1.iter().any(|r| r.id == LIST_NEXT_ID));

        assert!(paginate_rows(&rows, 5).is_empty());
    }

    #[test]
    fn business_hours_window() {
        let mut days = HashMap::new();
        days.insert(
            "mon".to_string(),
            DayWindow {
                enabled: true,
                open: "09:00".into(),
                close: "18:00".into(),
            },
        );
        let cfg = BusinessHoursConfig {
            timezone: "Asia/Kolkata".into(),
            days,
        };
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
        assert!(cfg.is_open_at("mon", t(9, 0)));
        assert!(cfg.is_open_at("mon", t(17, 59)));
        assert!(!cfg.is_open_at("mon", t(18, 0)));
        assert!(!cfg.is_open_at("tue", t(10, 0)));
    }

    #[test]
    fn awaits_input_only_for_suspending_nodes() {
        assert!(NodeKind::Wait(WaitConfig::default()).awaits_input());
        assert!(NodeKind::Button(ButtonConfig::default()).awaits_input());
        assert!(NodeKind::List(ListConfig::default()).awaits_input());
        assert!(NodeKind::Flow(FlowFormConfig::default()).awaits_input());
        assert!(!NodeKind::Message(MessageConfig::default()).awaits_input());
        assert!(!NodeKind::Delay(DelayConfig::default()).awaits_input());
    }
}
