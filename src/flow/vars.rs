//! Session variable bag and template interpolation.
//!
//! The bag is a JSON object persisted on the flow session. Keys starting
//! with `_` are reserved for interpreter bookkeeping (pending buttons, list
//! pages, loop indexes) and are never rendered to the contact.

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum PathToken {
    Key(String),
    Index(usize),
}

/// Parses `a.b[0].c` into path tokens. Returns None for an empty or
/// malformed path (unclosed bracket, non-numeric index).
pub fn parse_path(path: &str) -> Option<Vec<PathToken>> {
    let mut tokens = Vec::new();
    for segment in path.split('.') {
        if segment.is_empty() {
            return None;
        }
        let mut rest = segment;
        if let Some(bracket) = rest.find('[') {
            let key = &rest[..bracket];
            if !key.is_empty() {
                tokens.push(PathToken::Key(key.to_string()));
            }
            rest = &rest[bracket..];
            while let Some(stripped) = rest.strip_prefix('[') {
                let close = stripped.find(']')?;
                let idx: usize = stripped[..close].parse().ok()?;
                tokens.push(PathToken::Index(idx));
                rest = &stripped[close + 1..];
            }
            if !rest.is_empty() {
                return None;
            }
        } else {
            tokens.push(PathToken::Key(rest.to_string()));
        }
    }
    if tokens.is_empty() {
        None
    } else {
        Some(tokens)
    }
}

/// Walks a JSON value along parsed path tokens.
pub fn json_path<'a>(value: &'a Value, tokens: &[PathToken]) -> Option<&'a Value> {
    let mut current = value;
    for token in tokens {
        current = match token {
            PathToken::Key(k) => current.get(k.as_str())?,
            PathToken::Index(i) => current.get(*i)?,
        };
    }
    Some(current)
}

/// Renders a JSON value the way it should appear in a message body.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else {
                n.to_string()
            }
        }
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct VariableBag {
    values: Map<String, Value>,
}

impl VariableBag {
    pub fn new() -> Self {
        Self { values: Map::new() }
    }

    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(values) => Self { values },
            _ => Self::new(),
        }
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.values.clone())
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.values.insert(name.to_string(), value);
    }

    pub fn set_str(&mut self, name: &str, value: impl Into<String>) {
        self.values.insert(name.to_string(), Value::String(value.into()));
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.values.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<String> {
        self.values.get(name).map(render_value).filter(|s| !s.is_empty())
    }

    pub fn get_array(&self, name: &str) -> Option<&Vec<Value>> {
        self.values.get(name).and_then(|v| v.as_array())
    }

    /// Resolves a dotted/bracketed path against the bag.
    pub fn resolve_path(&self, path: &str) -> Option<&Value> {
        let tokens = parse_path(path)?;
        let first = match tokens.first()? {
            PathToken::Key(k) => self.values.get(k.as_str())?,
            PathToken::Index(_) => return None,
        };
        json_path(first, &tokens[1..])
    }

    /// Interpolates `{{name}}` / `{{a.b[0].c}}` tokens. A token whose path
    /// does not resolve is left verbatim so broken templates stay visible.
    pub fn render(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find("{{") {
            out.push_str(&rest[..open]);
            let after = &rest[open + 2..];
            match after.find("}}") {
                Some(close) => {
                    let raw = &after[..close];
                    let path = raw.trim();
                    match self.resolve_path(path) {
                        Some(value) => out.push_str(&render_value(value)),
                        None => {
                            out.push_str("{{");
                            out.push_str(raw);
                            out.push_str("}}");
                        }
                    }
                    rest = &after[close + 2..];
                }
                None => {
                    out.push_str("{{");
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }

    /// Variable names referenced by `{{...}}` tokens in a template (first
    /// path segment only). Drives the rescue rule for `variable` nodes.
    pub fn referenced_names(template: &str) -> Vec<String> {
        let mut names = Vec::new();
        let mut rest = template;
        while let Some(open) = rest.find("{{") {
            let after = &rest[open + 2..];
            let Some(close) = after.find("}}") else { break };
            let path = after[..close].trim();
            let first = path
                .split('.')
                .next()
                .unwrap_or(path)
                .split('[')
                .next()
                .unwrap_or(path);
            if !first.is_empty() {
                names.push(first.to_string());
            }
            rest = &after[close + 2..];
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bag() -> VariableBag {
        let mut b = VariableBag::new();
        b.set_str("sender_name", "Asha");
        b.set("order", json!({"items": [{"sku": "A-1"}, {"sku": "B-2"}], "total": 250}));
        b.set("count", json!(3));
        b.set("ok", json!(true));
        b
    }

    #[test]
    fn parse_path_handles_dots_and_brackets() {
        let tokens = parse_path("a.b[0].c").unwrap();
        assert_eq!(
            tokens,
            vec![
                PathToken::Key("a".into()),
                PathToken::Key("b".into()),
                PathToken::Index(0),
                PathToken::Key("c".into()),
            ]
        );
        assert!(parse_path("").is_none());
        assert!(parse_path("a[x]").is_none());
        assert!(parse_path("a[1").is_none());
    }

    #[test]
    fn render_simple_variable() {
        assert_eq!(bag().render("Hi {{sender_name}}!"), "Hi Asha!");
    }

    #[test]
    fn render_nested_path() {
        assert_eq!(
            bag().render("sku: {{order.items[1].sku}}, total {{order.total}}"),
            "sku: B-2, total 250"
        );
    }

    #[test]
    fn missing_key_stays_verbatim() {
        assert_eq!(bag().render("Hi {{nope}}"), "Hi {{nope}}");
        assert_eq!(bag().render("Hi {{order.items[9].sku}}"), "Hi {{order.items[9].sku}}");
    }

    #[test]
    fn numbers_and_bools_render_plain() {
        assert_eq!(bag().render("{{count}} {{ok}}"), "3 true");
    }

    #[test]
    fn whitespace_inside_token_is_tolerated() {
        assert_eq!(bag().render("Hi {{ sender_name }}"), "Hi Asha");
    }

    #[test]
    fn unclosed_token_passes_through() {
        assert_eq!(bag().render("Hi {{sender_name"), "Hi {{sender_name");
    }

    #[test]
    fn referenced_names_returns_first_segments() {
        let names = VariableBag::referenced_names("{{last_input}} and {{order.items[0].sku}}");
        assert_eq!(names, vec!["last_input", "order"]);
    }

    #[test]
    fn bag_round_trips_through_json() {
        let b = bag();
        let restored = VariableBag::from_json(b.to_json());
        assert_eq!(restored.get_str("sender_name").unwrap(), "Asha");
    }
}
