use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ─── Content part types ───────────────────────────────────────────────────────

/// A single content part in a multi-part message.
///
/// Media payloads are data URLs (`data:<mime>;base64,<b64>`) or plain URLs
/// when the provider accepts remote references.  `Reasoning` carries
/// extended-thinking text returned by reasoning models; it is preserved in
/// transcripts but providers decide whether it is replayed on later turns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image {
        image: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Audio {
        audio: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<String>,
    },
    Video {
        video: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<String>,
    },
    Reasoning { reasoning: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(image: impl Into<String>) -> Self {
        Self::Image { image: image.into(), detail: None }
    }
}

/// Message content – either a plain string or an ordered list of typed parts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for Content {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl Content {
    /// Concatenated text of all text parts (reasoning excluded).
    pub fn text(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(t) => t.is_empty(),
            Self::Parts(p) => p.is_empty(),
        }
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

// ─── Tool calls ───────────────────────────────────────────────────────────────

/// A tool invocation requested by the model in an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Opaque identifier assigned by the model; tool-role messages answer it
    /// by carrying the same id.  Never dereferenced, only matched.
    pub id: String,
    /// Name of the function being called.
    pub function: String,
    /// Parsed JSON argument object.
    pub arguments: serde_json::Value,
    /// Set when the raw arguments did not parse as JSON; the call is still
    /// recorded so the dispatcher can report the failure back to the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        function: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self { id: id.into(), function: function.into(), arguments, parse_error: None }
    }
}

/// Error kinds a tool-role message may carry back to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallErrorKind {
    Timeout,
    Permission,
    UnicodeDecode,
    OutputLimit,
    Tool,
    Parsing,
    Approval,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallError {
    pub kind: ToolCallErrorKind,
    pub message: String,
}

// ─── Chat messages ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One message in a conversation, tagged by role.
///
/// The variants carry different fields (assistant messages have tool calls,
/// tool messages answer one), so the message is an enum rather than a struct
/// with an optional grab-bag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    System {
        content: Content,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    User {
        content: Content,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    Assistant {
        content: Content,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        content: Content,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        /// Id of the assistant tool call this message answers.
        tool_call_id: String,
        /// Function name, duplicated from the call for provider wire formats
        /// that require it.
        function: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ToolCallError>,
    },
}

impl ChatMessage {
    pub fn system(text: impl Into<Content>) -> Self {
        Self::System { content: text.into(), source: None }
    }

    pub fn user(text: impl Into<Content>) -> Self {
        Self::User { content: text.into(), source: None }
    }

    pub fn assistant(text: impl Into<Content>) -> Self {
        Self::Assistant { content: text.into(), source: None, tool_calls: Vec::new() }
    }

    pub fn assistant_with_calls(text: impl Into<Content>, tool_calls: Vec<ToolCall>) -> Self {
        Self::Assistant { content: text.into(), source: None, tool_calls }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        function: impl Into<String>,
        content: impl Into<Content>,
    ) -> Self {
        Self::Tool {
            content: content.into(),
            source: None,
            tool_call_id: tool_call_id.into(),
            function: function.into(),
            error: None,
        }
    }

    pub fn tool_error(
        tool_call_id: impl Into<String>,
        function: impl Into<String>,
        error: ToolCallError,
    ) -> Self {
        Self::Tool {
            content: Content::Text(error.message.clone()),
            source: None,
            tool_call_id: tool_call_id.into(),
            function: function.into(),
            error: Some(error),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Self::System { .. } => Role::System,
            Self::User { .. } => Role::User,
            Self::Assistant { .. } => Role::Assistant,
            Self::Tool { .. } => Role::Tool,
        }
    }

    pub fn content(&self) -> &Content {
        match self {
            Self::System { content, .. }
            | Self::User { content, .. }
            | Self::Assistant { content, .. }
            | Self::Tool { content, .. } => content,
        }
    }

    /// Concatenated plain text of this message's content.
    pub fn text(&self) -> String {
        self.content().text()
    }

    /// Tool calls carried by an assistant message (empty for other roles).
    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Self::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    /// Approximate token count used for limit pre-checks.  4-chars-per-token
    /// heuristic for text; media parts use a flat conservative estimate.
    pub fn approx_tokens(&self) -> usize {
        let chars = match self.content() {
            Content::Text(t) => t.len(),
            Content::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.len(),
                    ContentPart::Reasoning { reasoning } => reasoning.len(),
                    _ => 765 * 4,
                })
                .sum(),
        };
        let call_chars: usize = self
            .tool_calls()
            .iter()
            .map(|c| c.function.len() + c.arguments.to_string().len())
            .sum();
        ((chars + call_chars) / 4).max(1)
    }
}

// ─── Tool schemas given to the model ──────────────────────────────────────────

/// One declared parameter of a tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolParam {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

/// Parameter schema of a tool.  `BTreeMap` keeps property order canonical,
/// which the cache fingerprint relies on.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolParams {
    #[serde(default)]
    pub properties: BTreeMap<String, ToolParam>,
    #[serde(default)]
    pub required: Vec<String>,
}

impl ToolParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(
        mut self,
        name: impl Into<String>,
        kind: impl Into<String>,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        let name = name.into();
        self.properties.insert(
            name.clone(),
            ToolParam { kind: kind.into(), description: description.into(), default: None },
        );
        if required {
            self.required.push(name);
            self.required.sort();
        }
        self
    }

    /// Canonical JSON-schema object form sent to providers and fingerprinted
    /// by the generate cache.
    pub fn to_json_schema(&self) -> serde_json::Value {
        let mut props = serde_json::Map::new();
        for (name, p) in &self.properties {
            let mut obj = serde_json::Map::new();
            obj.insert("type".into(), serde_json::Value::String(p.kind.clone()));
            if !p.description.is_empty() {
                obj.insert(
                    "description".into(),
                    serde_json::Value::String(p.description.clone()),
                );
            }
            if let Some(d) = &p.default {
                obj.insert("default".into(), d.clone());
            }
            props.insert(name.clone(), serde_json::Value::Object(obj));
        }
        serde_json::json!({
            "type": "object",
            "properties": serde_json::Value::Object(props),
            "required": self.required,
            "additionalProperties": false,
        })
    }
}

/// Description of one tool as advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub parameters: ToolParams,
}

/// Constraint on how the model may use the advertised tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    /// The model decides whether to call a tool.
    #[default]
    Auto,
    /// Tool calls are disabled for this turn.
    None,
    /// The model must call some tool.
    Any,
    /// The model must call the named tool.
    Function(String),
}

/// Per-call generation parameters.  Part of the cache fingerprint, so the
/// fields are plain serde-stable scalars.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GenerateConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Total call timeout in seconds, retries included.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
}

impl GenerateConfig {
    pub fn from_model_config(cfg: &prova_config::ModelConfig) -> Self {
        Self {
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
            top_p: cfg.top_p,
            timeout: cfg.timeout().map(|d| d.as_secs_f64()),
        }
    }

    pub fn timeout(&self) -> Option<std::time::Duration> {
        self.timeout.map(std::time::Duration::from_secs_f64)
    }
}

// ─── Model output ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Stop,
    MaxTokens,
    /// The request exceeded the model's context window.
    ModelLength,
    ToolCalls,
    ContentFilter,
    #[default]
    Unknown,
}

impl StopReason {
    /// Terminal stop reasons end the agent loop even when tool calls are
    /// present.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stop | Self::ContentFilter)
    }
}

/// Token usage for one generation (or an aggregate of several).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_write_tokens: Option<u64>,
}

impl ModelUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            ..Self::default()
        }
    }

    pub fn add(&mut self, other: &ModelUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
        self.reasoning_tokens = add_opt(self.reasoning_tokens, other.reasoning_tokens);
        self.cache_read_tokens = add_opt(self.cache_read_tokens, other.cache_read_tokens);
        self.cache_write_tokens = add_opt(self.cache_write_tokens, other.cache_write_tokens);
    }
}

fn add_opt(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (None, None) => None,
        (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
    }
}

/// One completion alternative returned by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatChoice {
    pub message: ChatMessage,
    #[serde(default)]
    pub stop_reason: StopReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<serde_json::Value>,
}

/// The result of a single model generation call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelOutput {
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: ModelUsage,
    /// Total wall-clock seconds for the call, retries included.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    /// Seconds excluding retry and queue waits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ModelOutput {
    /// Output with a single assistant text choice — the common mock shape.
    pub fn from_content(model: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            choices: vec![ChatChoice {
                message: ChatMessage::assistant(text.into()),
                stop_reason: StopReason::Stop,
                logprobs: None,
            }],
            ..Self::default()
        }
    }

    /// Output whose single choice carries the given message and stop reason.
    pub fn from_message(
        model: impl Into<String>,
        message: ChatMessage,
        stop_reason: StopReason,
    ) -> Self {
        Self {
            model: model.into(),
            choices: vec![ChatChoice { message, stop_reason, logprobs: None }],
            ..Self::default()
        }
    }

    /// The first (loop-driving) choice's message, if any.
    pub fn message(&self) -> Option<&ChatMessage> {
        self.choices.first().map(|c| &c.message)
    }

    pub fn stop_reason(&self) -> StopReason {
        self.choices.first().map(|c| c.stop_reason).unwrap_or_default()
    }

    /// Tool calls requested by the first choice.
    pub fn tool_calls(&self) -> &[ToolCall] {
        self.message().map(|m| m.tool_calls()).unwrap_or(&[])
    }

    /// Plain text of the first choice.
    pub fn completion(&self) -> String {
        self.message().map(|m| m.text()).unwrap_or_default()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
