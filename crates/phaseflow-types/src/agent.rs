//! Agent and prompt definitions, plus the dispatch protocol spoken with the
//! external task executor.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An agent persona loaded from a markdown file with YAML frontmatter.
///
/// The markdown body is the agent's system prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Tools the agent may use. Empty means the executor's default set.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub system_prompt: String,
}

/// A prompt template loaded from a markdown file with YAML frontmatter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Template body with `{{ path }}` placeholders.
    pub body: String,
}

/// One request to the external task executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    /// Rendered user prompt.
    pub prompt: String,
    pub options: DispatchOptions,
}

/// Options accompanying a [`DispatchRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOptions {
    pub system_prompt: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub setting_sources: Vec<String>,
}

/// A message streamed back by the task executor.
///
/// Only the final `result` message carries structured output. Every other
/// message is informational, except `tool_use` messages that touch files,
/// which feed changed-file tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    System {
        subtype: String,
        #[serde(default)]
        data: Value,
    },
    Assistant {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    Result {
        #[serde(default, rename = "structuredOutput", alias = "structured_output")]
        structured_output: Option<Value>,
    },
}

/// Tools whose use marks a file as changed.
pub const FILE_WRITING_TOOLS: &[&str] = &["Write", "Edit", "MultiEdit", "NotebookEdit"];

impl AgentMessage {
    /// The file path touched by a file-writing tool call, if this is one.
    pub fn changed_file(&self) -> Option<&str> {
        match self {
            AgentMessage::ToolUse { name, input } if FILE_WRITING_TOOLS.contains(&name.as_str()) => {
                input
                    .get("file_path")
                    .or_else(|| input.get("notebook_path"))
                    .and_then(Value::as_str)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_agent_message_wire_format() {
        let msg: AgentMessage =
            serde_json::from_value(json!({ "type": "result", "structuredOutput": { "ok": true } }))
                .unwrap();
        assert_eq!(
            msg,
            AgentMessage::Result {
                structured_output: Some(json!({ "ok": true }))
            }
        );

        let msg: AgentMessage = serde_json::from_value(json!({ "type": "result" })).unwrap();
        assert_eq!(msg, AgentMessage::Result { structured_output: None });

        let msg: AgentMessage =
            serde_json::from_value(json!({ "type": "system", "subtype": "init" })).unwrap();
        assert!(matches!(msg, AgentMessage::System { .. }));
    }

    #[test]
    fn test_changed_file_only_for_writing_tools() {
        let write = AgentMessage::ToolUse {
            name: "Edit".to_string(),
            input: json!({ "file_path": "src/lib.rs" }),
        };
        assert_eq!(write.changed_file(), Some("src/lib.rs"));

        let notebook = AgentMessage::ToolUse {
            name: "NotebookEdit".to_string(),
            input: json!({ "notebook_path": "a.ipynb" }),
        };
        assert_eq!(notebook.changed_file(), Some("a.ipynb"));

        let read = AgentMessage::ToolUse {
            name: "Read".to_string(),
            input: json!({ "file_path": "src/lib.rs" }),
        };
        assert_eq!(read.changed_file(), None);
    }
}
