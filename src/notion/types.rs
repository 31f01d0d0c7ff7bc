use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// A page as returned by query and page-fetch calls.
///
/// Properties are kept as raw JSON. Any of them may be missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub id: String,
    #[serde(default)]
    pub created_time: String,
    #[serde(default)]
    pub last_edited_time: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub icon: Option<Value>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

/// One page of a database query.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueryPage {
    #[serde(default)]
    pub results: Vec<Page>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Title of a `child_page` or `child_database` block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChildTitle {
    #[serde(default)]
    pub title: String,
}

/// A child block of a page. Only the block kinds the dashboard walk needs
/// carry a payload here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_page: Option<ChildTitle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_database: Option<ChildTitle>,
}

impl Block {
    pub fn is_child_page(&self) -> bool {
        self.kind == "child_page"
    }

    /// Title of a child database block, `None` for anything else.
    pub fn database_title(&self) -> Option<&str> {
        match (self.kind.as_str(), &self.child_database) {
            ("child_database", Some(c)) => Some(c.title.as_str()),
            _ => None,
        }
    }
}

/// One page of `GET /blocks/{id}/children`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BlockPage {
    #[serde(default)]
    pub results: Vec<Block>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Page icon attached on create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Icon {
    Emoji(String),
    External(String),
}

impl Icon {
    pub fn to_json(&self) -> Value {
        match self {
            Icon::Emoji(e) => json!({"type": "emoji", "emoji": e}),
            Icon::External(url) => json!({"type": "external", "external": {"url": url}}),
        }
    }
}

/// A single property value in a create or update payload.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Title(String),
    RichText(String),
    Number(f64),
    Checkbox(bool),
    Select(String),
    Status(String),
    Relation(Vec<String>),
    People(Vec<String>),
    Date { start: String, end: Option<String> },
}

fn text_runs(content: &str) -> Value {
    json!([{"type": "text", "text": {"content": content}}])
}

impl PropertyValue {
    pub fn to_json(&self) -> Value {
        match self {
            PropertyValue::Title(s) => json!({ "title": text_runs(s) }),
            PropertyValue::RichText(s) => json!({ "rich_text": text_runs(s) }),
            PropertyValue::Number(n) => json!({ "number": n }),
            PropertyValue::Checkbox(b) => json!({ "checkbox": b }),
            PropertyValue::Select(name) => json!({ "select": {"name": name} }),
            PropertyValue::Status(name) => json!({ "status": {"name": name} }),
            PropertyValue::Relation(ids) => {
                let rel: Vec<Value> = ids.iter().map(|id| json!({ "id": id })).collect();
                json!({ "relation": rel })
            }
            PropertyValue::People(ids) => {
                let people: Vec<Value> = ids
                    .iter()
                    .map(|id| json!({ "object": "user", "id": id }))
                    .collect();
                json!({ "people": people })
            }
            PropertyValue::Date { start, end } => {
                json!({ "date": { "start": start, "end": end } })
            }
        }
    }
}

/// Ordered set of named property values for a write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties(BTreeMap<String, PropertyValue>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: PropertyValue) -> &mut Self {
        self.0.insert(name.to_string(), value);
        self
    }

    pub fn with(mut self, name: &str, value: PropertyValue) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .0
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        Value::Object(map)
    }
}
