//! Tool Calls
//!
//! Tool catalog advertised by the MCP agent and the structured calls the
//! intent synthesizer produces against it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ChatError, Result};

/// Structured tool invocation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Tool identifier
    pub tool: String,

    /// Arguments as key-value pairs
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl ToolCall {
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            args: Map::new(),
        }
    }

    pub fn arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }
}

/// Tool definition as listed by the agent
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSchema {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// JSON Schema of the arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

impl ToolSchema {
    /// Names listed under the schema's `required` array
    pub fn required_args(&self) -> Vec<&str> {
        self.input_schema
            .as_ref()
            .and_then(|s| s.get("required"))
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

/// Tools available to the intent synthesizer
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCatalog {
    pub tools: Vec<ToolSchema>,
}

impl ToolCatalog {
    pub fn new(tools: Vec<ToolSchema>) -> Self {
        Self { tools }
    }

    /// Parse a `/api/mcp/tools` body, either `{tools: [...]}` or a bare array
    pub fn from_body(body: Value) -> Result<Self> {
        match body {
            Value::Array(_) => Ok(Self {
                tools: serde_json::from_value(body)?,
            }),
            Value::Object(_) => Ok(serde_json::from_value(body)?),
            other => Err(ChatError::InvalidResponse {
                endpoint: "/api/mcp/tools".into(),
                message: format!("expected tool list, got {}", other),
            }),
        }
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<&ToolSchema> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    /// Check a call against the catalog before it is sent.
    ///
    /// Unknown tools and missing required arguments are rejected. An empty
    /// catalog accepts anything, since the schema is unknown.
    pub fn validate(&self, call: &ToolCall) -> Result<()> {
        if self.tools.is_empty() {
            return Ok(());
        }

        let schema = self
            .get(&call.tool)
            .ok_or_else(|| ChatError::IntentUnavailable(format!("unknown tool '{}'", call.tool)))?;

        for name in schema.required_args() {
            if !call.args.contains_key(name) {
                return Err(ChatError::IntentUnavailable(format!(
                    "missing required argument '{}' for '{}'",
                    name, call.tool
                )));
            }
        }

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
