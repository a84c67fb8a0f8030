//! Wire types for the Cloud Code `v1internal` protocol.
//!
//! The upstream encodes every content part as one flat object with optional
//! keys (`text`, `thought`, `functionCall`, ...). Internally a [`Part`] is a
//! tagged enum; [`RawPart`] is the flat shape and serde converts between them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Signature the upstream accepts in place of a real thought signature.
pub const SKIP_SIGNATURE: &str = "skip_thought_signature_validator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// One turn of the canonical conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(parts: Vec<Part>) -> Self {
        Self {
            role: Role::User,
            parts,
        }
    }

    pub fn model(parts: Vec<Part>) -> Self {
        Self {
            role: Role::Model,
            parts,
        }
    }

    /// A user turn carrying tool results.
    pub fn is_tool_result(&self) -> bool {
        self.role == Role::User
            && self
                .parts
                .iter()
                .any(|p| matches!(p, Part::FunctionResponse(_)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    Thought {
        text: String,
        signature: Option<String>,
    },
    InlineData {
        mime_type: String,
        data: String,
    },
    FunctionCall {
        call: FunctionCall,
        signature: Option<String>,
    },
    FunctionResponse(FunctionResponse),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn thought(text: impl Into<String>, signature: Option<String>) -> Self {
        Self::Thought {
            text: text.into(),
            signature,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub name: String,
    pub response: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub thought: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponse>,
}

impl From<RawPart> for Part {
    fn from(raw: RawPart) -> Self {
        if let Some(call) = raw.function_call {
            return Part::FunctionCall {
                call,
                signature: raw.thought_signature,
            };
        }
        if let Some(response) = raw.function_response {
            return Part::FunctionResponse(response);
        }
        if let Some(inline) = raw.inline_data {
            return Part::InlineData {
                mime_type: inline.mime_type,
                data: inline.data,
            };
        }
        let text = raw.text.unwrap_or_default();
        if raw.thought {
            Part::Thought {
                text,
                signature: raw.thought_signature,
            }
        } else {
            Part::Text(text)
        }
    }
}

impl From<Part> for RawPart {
    fn from(part: Part) -> Self {
        match part {
            Part::Text(text) => RawPart {
                text: Some(text),
                ..Default::default()
            },
            Part::Thought { text, signature } => RawPart {
                text: Some(text),
                thought: true,
                thought_signature: signature,
                ..Default::default()
            },
            Part::InlineData { mime_type, data } => RawPart {
                inline_data: Some(InlineData { mime_type, data }),
                ..Default::default()
            },
            Part::FunctionCall { call, signature } => RawPart {
                function_call: Some(call),
                thought_signature: signature,
                ..Default::default()
            },
            Part::FunctionResponse(response) => RawPart {
                function_response: Some(response),
                ..Default::default()
            },
        }
    }
}

impl Serialize for Part {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        RawPart::from(self.clone()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Part {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        RawPart::deserialize(deserializer).map(Part::from)
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInstruction {
    pub parts: Vec<Part>,
}

impl SystemInstruction {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![Part::Text(text.into())],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<ThinkingLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_thoughts: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_config: Option<ThinkingConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDeclaration {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<SystemInstruction>,
    pub generation_config: GenerationConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDeclaration>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// The body actually POSTed upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamRequest {
    pub project: String,
    pub model: String,
    pub user_agent: String,
    pub request_id: String,
    pub request: GenerateContentRequest,
}

impl UpstreamRequest {
    pub fn new(project: impl Into<String>, model: impl Into<String>, mut request: GenerateContentRequest) -> Self {
        request.session_id = Some(uuid::Uuid::new_v4().to_string());
        Self {
            project: project.into(),
            model: model.into(),
            user_agent: "antigravity".to_string(),
            request_id: uuid::Uuid::new_v4().to_string(),
            request,
        }
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<CandidateContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_token_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidates_token_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_token_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_content_token_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thoughts_token_count: Option<u64>,
}

impl GenerateContentResponse {
    /// Parts of the first candidate, in emission order.
    pub fn parts(&self) -> &[Part] {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| c.parts.as_slice())
            .unwrap_or(&[])
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.candidates
            .first()
            .and_then(|c| c.finish_reason.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_part_shapes() {
        let thought: Part =
            serde_json::from_value(json!({"text": "hmm", "thought": true, "thoughtSignature": "sig"}))
                .unwrap();
        assert_eq!(thought, Part::thought("hmm", Some("sig".to_string())));

        let call: Part = serde_json::from_value(json!({
            "functionCall": {"name": "lookup", "args": {"q": 1}},
            "thoughtSignature": "abc"
        }))
        .unwrap();
        match call {
            Part::FunctionCall { call, signature } => {
                assert_eq!(call.name, "lookup");
                assert_eq!(call.args["q"], 1);
                assert_eq!(signature.as_deref(), Some("abc"));
            }
            other => panic!("expected function call, got {other:?}"),
        }

        let inline: Part = serde_json::from_value(json!({
            "inlineData": {"mimeType": "image/png", "data": "AAAA"}
        }))
        .unwrap();
        assert!(matches!(inline, Part::InlineData { ref mime_type, .. } if mime_type == "image/png"));
    }

    #[test]
    fn test_part_serializes_flat() {
        let value = serde_json::to_value(Part::text("hi")).unwrap();
        assert_eq!(value, json!({"text": "hi"}));

        let value = serde_json::to_value(Part::thought("", Some("s".to_string()))).unwrap();
        assert_eq!(value, json!({"text": "", "thought": true, "thoughtSignature": "s"}));

        let value = serde_json::to_value(Part::FunctionResponse(FunctionResponse {
            name: "f".to_string(),
            response: json!({"result": "ok"}),
            id: Some("call_1".to_string()),
        }))
        .unwrap();
        assert_eq!(
            value,
            json!({"functionResponse": {"name": "f", "response": {"result": "ok"}, "id": "call_1"}})
        );
    }

    #[test]
    fn test_upstream_request_envelope() {
        let req = UpstreamRequest::new(
            "proj-1",
            "gemini-2.5-flash",
            GenerateContentRequest {
                contents: vec![Content::user(vec![Part::text("hello")])],
                ..Default::default()
            },
        );
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["project"], "proj-1");
        assert_eq!(value["userAgent"], "antigravity");
        assert!(value["requestId"].is_string());
        assert!(value["request"]["sessionId"].is_string());
        assert_eq!(value["request"]["contents"][0]["role"], "user");
        assert_eq!(value["request"]["generationConfig"], json!({}));
    }

    #[test]
    fn test_tool_result_turn_detection() {
        let turn = Content::user(vec![Part::FunctionResponse(FunctionResponse {
            name: "f".to_string(),
            response: json!({}),
            id: None,
        })]);
        assert!(turn.is_tool_result());
        assert!(!Content::user(vec![Part::text("x")]).is_tool_result());
        assert!(!Content::user(vec![]).is_tool_result());
    }
}
