//! Concrete record for upstream tools.
//!
//! Upstream responses are validated into this shape at ingress; nothing
//! downstream works on loosely-typed JSON.

use std::collections::BTreeMap;

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct ToolRecord {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: serde_json::Map<String, Value>,
    pub metadata: BTreeMap<String, Value>,
}

impl ToolRecord {
    /// Validate one tool from an upstream listing. Tools without a name are
    /// rejected at ingress.
    pub fn from_upstream(tool: rmcp::model::Tool) -> Option<Self> {
        let name = tool.name.to_string();
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name,
            description: tool.description.as_ref().map(|d| d.to_string()),
            input_schema: (*tool.input_schema).clone(),
            metadata: BTreeMap::new(),
        })
    }

    /// Render back into the wire shape under a (possibly rewritten) name.
    pub fn to_wire(&self, name: &str) -> rmcp::model::Tool {
        let mut tool = rmcp::model::Tool::new(
            name.to_string(),
            self.description.clone().unwrap_or_default(),
            std::sync::Arc::new(self.input_schema.clone()),
        );
        if self.description.is_none() {
            tool.description = None;
        }
        tool
    }

    /// JSON form used by the router's own `tools.list` result.
    pub fn to_json(&self) -> Value {
        let mut object = serde_json::Map::new();
        object.insert("name".into(), Value::String(self.name.clone()));
        if let Some(description) = &self.description {
            object.insert("description".into(), Value::String(description.clone()));
        }
        object.insert(
            "inputSchema".into(),
            Value::Object(self.input_schema.clone()),
        );
        if !self.metadata.is_empty() {
            object.insert(
                "metadata".into(),
                Value::Object(self.metadata.clone().into_iter().collect()),
            );
        }
        Value::Object(object)
    }
}
