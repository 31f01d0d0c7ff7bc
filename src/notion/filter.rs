use serde_json::{json, Map, Value};

/// Which page timestamp a filter or sort applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimestampKind {
    CreatedTime,
    LastEditedTime,
}

impl TimestampKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimestampKind::CreatedTime => "created_time",
            TimestampKind::LastEditedTime => "last_edited_time",
        }
    }
}

/// Structured database query predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `after` (exclusive) or `on_or_after` (inclusive) on a page timestamp.
    Timestamp {
        kind: TimestampKind,
        value: String,
        inclusive: bool,
    },
    RelationContains { property: String, id: String },
    /// Rollup over a relation, matching if any related page is `id`.
    RollupContains { property: String, id: String },
    RichTextContains { property: String, value: String },
    PeopleContains { property: String, id: String },
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn after(kind: TimestampKind, value: impl Into<String>) -> Self {
        Filter::Timestamp {
            kind,
            value: value.into(),
            inclusive: false,
        }
    }

    pub fn on_or_after(kind: TimestampKind, value: impl Into<String>) -> Self {
        Filter::Timestamp {
            kind,
            value: value.into(),
            inclusive: true,
        }
    }

    pub fn relation_contains(property: &str, id: &str) -> Self {
        Filter::RelationContains {
            property: property.to_string(),
            id: id.to_string(),
        }
    }

    pub fn rollup_contains(property: &str, id: &str) -> Self {
        Filter::RollupContains {
            property: property.to_string(),
            id: id.to_string(),
        }
    }

    pub fn rich_text_contains(property: &str, value: &str) -> Self {
        Filter::RichTextContains {
            property: property.to_string(),
            value: value.to_string(),
        }
    }

    pub fn people_contains(property: &str, id: &str) -> Self {
        Filter::PeopleContains {
            property: property.to_string(),
            id: id.to_string(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Filter::Timestamp {
                kind,
                value,
                inclusive,
            } => {
                let op = if *inclusive { "on_or_after" } else { "after" };
                let mut inner = Map::new();
                inner.insert(op.to_string(), Value::String(value.clone()));
                let mut outer = Map::new();
                outer.insert("timestamp".into(), Value::String(kind.as_str().into()));
                outer.insert(kind.as_str().into(), Value::Object(inner));
                Value::Object(outer)
            }
            Filter::RelationContains { property, id } => {
                json!({ "property": property, "relation": { "contains": id } })
            }
            Filter::RollupContains { property, id } => json!({
                "property": property,
                "rollup": { "any": { "relation": { "contains": id } } }
            }),
            Filter::RichTextContains { property, value } => {
                json!({ "property": property, "rich_text": { "contains": value } })
            }
            Filter::PeopleContains { property, id } => {
                json!({ "property": property, "people": { "contains": id } })
            }
            Filter::And(filters) => {
                json!({ "and": filters.iter().map(Filter::to_json).collect::<Vec<_>>() })
            }
            Filter::Or(filters) => {
                json!({ "or": filters.iter().map(Filter::to_json).collect::<Vec<_>>() })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sort {
    pub kind: TimestampKind,
    pub direction: Direction,
}

impl Sort {
    pub fn ascending(kind: TimestampKind) -> Self {
        Self {
            kind,
            direction: Direction::Ascending,
        }
    }

    pub fn to_json(&self) -> Value {
        let dir = match self.direction {
            Direction::Ascending => "ascending",
            Direction::Descending => "descending",
        };
        json!({ "timestamp": self.kind.as_str(), "direction": dir })
    }
}

/// Body of a `POST /databases/{id}/query` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRequest {
    pub filter: Option<Filter>,
    pub sorts: Vec<Sort>,
    pub start_cursor: Option<String>,
    pub page_size: Option<u32>,
}

impl QueryRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn sort(mut self, sort: Sort) -> Self {
        self.sorts.push(sort);
        self
    }

    pub fn page_size(mut self, size: u32) -> Self {
        self.page_size = Some(size);
        self
    }

    /// Same request continued at `cursor`.
    pub fn with_cursor(&self, cursor: Option<String>) -> Self {
        Self {
            start_cursor: cursor,
            ..self.clone()
        }
    }

    pub fn to_json(&self) -> Value {
        let mut body = Map::new();
        if let Some(ref f) = self.filter {
            body.insert("filter".into(), f.to_json());
        }
        if !self.sorts.is_empty() {
            body.insert(
                "sorts".into(),
                Value::Array(self.sorts.iter().map(Sort::to_json).collect()),
            );
        }
        if let Some(ref c) = self.start_cursor {
            body.insert("start_cursor".into(), Value::String(c.clone()));
        }
        if let Some(n) = self.page_size {
            body.insert("page_size".into(), json!(n));
        }
        Value::Object(body)
    }
}
