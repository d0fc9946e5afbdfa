//! Request, principal and response types shared by every pipeline stage.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Service tier of a principal. Drives quota limits and policy rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Premium,
    Enterprise,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Premium => "premium",
            Tier::Enterprise => "enterprise",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Some(Tier::Free),
            "premium" => Some(Tier::Premium),
            "enterprise" => Some(Tier::Enterprise),
            _ => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The authenticated identity making a request. Resolved once per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub tenant_id: String,
    pub roles: BTreeSet<String>,
    pub tier: Tier,
}

impl Principal {
    pub fn new(id: impl Into<String>, tenant_id: impl Into<String>, tier: Tier) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            roles: BTreeSet::new(),
            tier,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

/// Quota dimension tracked per principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaDimension {
    Requests,
    Tokens,
    Cost,
}

impl QuotaDimension {
    pub const ALL: [QuotaDimension; 3] = [
        QuotaDimension::Requests,
        QuotaDimension::Tokens,
        QuotaDimension::Cost,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaDimension::Requests => "requests",
            QuotaDimension::Tokens => "tokens",
            QuotaDimension::Cost => "cost",
        }
    }
}

impl fmt::Display for QuotaDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chat message as sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }
}

/// What arrives at the gateway before anything is validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundRequest {
    /// Raw bearer credential, if the client sent one.
    pub credential: Option<String>,
    pub target_model: String,
    pub messages: Vec<ChatMessage>,
    pub max_output_tokens: u32,
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Requested action, `chat` unless stated otherwise.
    #[serde(default = "default_action")]
    pub action: String,
    /// Free-form metadata; `task` is used for capability routing.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Caller-supplied correlation id (e.g. `x-request-id`). Stored
    /// alongside the audit record; the request id itself is always
    /// generated by the gateway.
    #[serde(default)]
    pub correlation_id: Option<String>,
}

fn default_action() -> String {
    "chat".to_string()
}

impl InboundRequest {
    pub fn chat(
        credential: impl Into<String>,
        target_model: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            credential: Some(credential.into()),
            target_model: target_model.into(),
            messages: vec![ChatMessage::user(prompt)],
            max_output_tokens: 256,
            temperature: None,
            action: default_action(),
            metadata: BTreeMap::new(),
            correlation_id: None,
        }
    }

    pub fn with_max_output_tokens(mut self, max: u32) -> Self {
        self.max_output_tokens = max;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Message contents joined the way they are scanned.
    pub fn payload_text(&self) -> String {
        join_contents(&self.messages)
    }
}

pub fn join_contents(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// An authenticated request flowing through the pipeline.
///
/// Never mutated in place: stages derive copies (see [`GatewayRequest::with_messages`])
/// so the original stays available to the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayRequest {
    pub id: String,
    pub principal: Principal,
    pub target_model: String,
    pub action: String,
    pub messages: Vec<ChatMessage>,
    /// Message contents joined; what the scanner and safety filter read.
    pub payload_text: String,
    pub max_output_tokens: u32,
    pub temperature: Option<f32>,
    pub task_type: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl GatewayRequest {
    pub fn new(id: String, principal: Principal, inbound: &InboundRequest) -> Self {
        Self {
            id,
            principal,
            target_model: inbound.target_model.clone(),
            action: inbound.action.clone(),
            messages: inbound.messages.clone(),
            payload_text: inbound.payload_text(),
            max_output_tokens: inbound.max_output_tokens,
            temperature: inbound.temperature,
            task_type: inbound.metadata.get("task").cloned(),
            timestamp: Utc::now(),
        }
    }

    /// Derived copy with replaced messages (e.g. after redaction).
    pub fn with_messages(&self, messages: Vec<ChatMessage>) -> Self {
        Self {
            payload_text: join_contents(&messages),
            messages,
            ..self.clone()
        }
    }

    /// Rough prompt token estimate: one token per four characters.
    pub fn estimated_prompt_tokens(&self) -> u64 {
        estimate_tokens(&self.payload_text)
    }

    pub fn estimated_total_tokens(&self) -> u64 {
        self.estimated_prompt_tokens() + u64::from(self.max_output_tokens)
    }
}

pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

pub fn new_request_id() -> String {
    format!("req_{}", Uuid::new_v4().simple())
}

/// Token usage and cost of one provider call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Security summary attached to every successful response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvents {
    pub pii_redacted: bool,
    pub entities: Vec<String>,
    #[serde(default)]
    pub flagged_for_review: bool,
}

/// What the gateway returns to the caller on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub request_id: String,
    pub model: String,
    /// Result text with any redaction markers intact.
    pub content: String,
    pub usage: Usage,
    pub security_events: SecurityEvents,
}
