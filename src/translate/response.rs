//! Translate upstream responses into OpenAI and Anthropic response bodies.
//!
//! A buffered upstream reply and a fully collected stream look the same once
//! their parts are pushed through a [`ResponseAccumulator`], so both paths
//! share the conversion below.

use futures::StreamExt;

use super::anthropic_types::{MessagesResponse, ResponseContentBlock, Usage};
use super::openai_types::{
    ChatCompletionResponse, ChatToolCall, ChatToolCallFunction, ChatUsage, Choice, ChoiceMessage,
    CompletionTokensDetails, PromptTokensDetails,
};
use super::request::{InternalRequest, ToolNames};
use crate::error::Result;
use crate::upstream::sse::ChunkStream;
use crate::upstream::types::{
    Candidate, CandidateContent, GenerateContentResponse, Part, UsageMetadata,
};

/// `prefix` followed by 24 hex characters.
pub fn mint_id(prefix: &str) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}{}", &hex[..24])
}

pub fn openai_finish_reason(raw: Option<&str>, has_tool_calls: bool) -> &'static str {
    if has_tool_calls {
        return "tool_calls";
    }
    match raw {
        Some("MAX_TOKENS") => "length",
        Some("SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII") => {
            "content_filter"
        }
        _ => "stop",
    }
}

pub fn anthropic_stop_reason(raw: Option<&str>, has_tool_calls: bool) -> &'static str {
    if has_tool_calls {
        return "tool_use";
    }
    match raw {
        Some("MAX_TOKENS") => "max_tokens",
        _ => "end_turn",
    }
}

pub fn openai_usage(usage: &UsageMetadata) -> ChatUsage {
    ChatUsage {
        prompt_tokens: usage.prompt_token_count.unwrap_or(0),
        completion_tokens: usage.candidates_token_count.unwrap_or(0),
        total_tokens: usage.total_token_count.unwrap_or(0),
        prompt_tokens_details: usage
            .cached_content_token_count
            .filter(|n| *n > 0)
            .map(|cached_tokens| PromptTokensDetails { cached_tokens }),
        completion_tokens_details: usage
            .thoughts_token_count
            .filter(|n| *n > 0)
            .map(|reasoning_tokens| CompletionTokensDetails { reasoning_tokens }),
    }
}

pub fn anthropic_usage(usage: Option<&UsageMetadata>) -> Usage {
    usage.map_or_else(Usage::default, |u| Usage {
        input_tokens: u.prompt_token_count.unwrap_or(0),
        output_tokens: u.candidates_token_count.unwrap_or(0),
        cache_read_input_tokens: u.cached_content_token_count.filter(|n| *n > 0),
    })
}

/// Parts, finish reason and usage of one upstream reply, in emission order.
#[derive(Debug, Clone, Default)]
pub struct ResponseAccumulator {
    parts: Vec<Part>,
    finish_reason: Option<String>,
    usage: Option<UsageMetadata>,
}

impl ResponseAccumulator {
    pub fn from_response(response: GenerateContentResponse) -> Self {
        let mut acc = Self::default();
        acc.push(response);
        acc
    }

    /// Drain an upstream stream. Transport errors abort the collection.
    pub async fn collect(mut stream: ChunkStream) -> Result<Self> {
        let mut acc = Self::default();
        while let Some(chunk) = stream.next().await {
            acc.push(chunk?);
        }
        Ok(acc)
    }

    pub fn push(&mut self, response: GenerateContentResponse) {
        if let Some(usage) = response.usage_metadata {
            self.usage = Some(usage);
        }
        let Some(candidate) = response.candidates.into_iter().next() else {
            return;
        };
        if candidate.finish_reason.is_some() {
            self.finish_reason = candidate.finish_reason;
        }
        if let Some(content) = candidate.content {
            self.parts.extend(content.parts);
        }
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    pub fn usage(&self) -> Option<&UsageMetadata> {
        self.usage.as_ref()
    }

    pub fn has_tool_calls(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, Part::FunctionCall { .. }))
    }

    /// Re-emit the collected reply as a chunk sequence: one chunk per part,
    /// then a closing chunk with the finish reason and usage.
    pub fn replay(self) -> Vec<GenerateContentResponse> {
        let mut chunks: Vec<GenerateContentResponse> = self
            .parts
            .into_iter()
            .map(|part| GenerateContentResponse {
                candidates: vec![Candidate {
                    content: Some(CandidateContent {
                        role: Some("model".to_string()),
                        parts: vec![part],
                    }),
                    finish_reason: None,
                }],
                usage_metadata: None,
            })
            .collect();
        chunks.push(GenerateContentResponse {
            candidates: vec![Candidate {
                content: None,
                finish_reason: self.finish_reason,
            }],
            usage_metadata: self.usage,
        });
        chunks
    }

    pub fn into_openai(self, req: &InternalRequest) -> ChatCompletionResponse {
        let finish_reason = openai_finish_reason(self.finish_reason(), self.has_tool_calls());
        let mut content = String::new();
        let mut reasoning = String::new();
        let mut tool_calls = Vec::new();

        for part in self.parts {
            match part {
                Part::Text(text) => content.push_str(&text),
                Part::Thought { text, .. } => reasoning.push_str(&text),
                Part::FunctionCall { call, signature } => tool_calls.push(ChatToolCall {
                    id: mint_id("call_"),
                    call_type: "function".to_string(),
                    function: ChatToolCallFunction {
                        name: req.tool_names.decode(&call.name),
                        arguments: call.args.to_string(),
                    },
                    thought_signature: signature,
                }),
                Part::InlineData { .. } | Part::FunctionResponse(_) => {}
            }
        }

        ChatCompletionResponse {
            id: mint_id("chatcmpl-"),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: req.requested_model.clone(),
            choices: vec![Choice {
                index: 0,
                message: ChoiceMessage {
                    role: "assistant".to_string(),
                    content: (!content.is_empty()).then_some(content),
                    reasoning_content: (req.include_thoughts && !reasoning.is_empty())
                        .then_some(reasoning),
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                },
                finish_reason: Some(finish_reason.to_string()),
            }],
            usage: self.usage.as_ref().map(openai_usage),
        }
    }

    pub fn into_anthropic(self, req: &InternalRequest) -> MessagesResponse {
        let stop_reason = anthropic_stop_reason(self.finish_reason(), self.has_tool_calls());
        let usage = anthropic_usage(self.usage.as_ref());
        let mut content = anthropic_blocks(self.parts, &req.tool_names, req.include_thoughts);

        // Clients expect at least one block.
        if content.is_empty() {
            content.push(ResponseContentBlock::Text {
                text: String::new(),
            });
        }

        MessagesResponse {
            id: mint_id("msg_"),
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            content,
            model: req.requested_model.clone(),
            stop_reason: Some(stop_reason.to_string()),
            stop_sequence: None,
            usage,
        }
    }
}

/// Adjacent thought parts merge into one thinking block and adjacent text
/// parts into one text block; every function call is its own block.
fn anthropic_blocks(
    parts: Vec<Part>,
    tool_names: &ToolNames,
    include_thoughts: bool,
) -> Vec<ResponseContentBlock> {
    let mut blocks: Vec<ResponseContentBlock> = Vec::new();
    for part in parts {
        match part {
            Part::Thought { text, signature } => {
                if !include_thoughts {
                    continue;
                }
                if let Some(ResponseContentBlock::Thinking {
                    thinking,
                    signature: existing,
                }) = blocks.last_mut()
                {
                    thinking.push_str(&text);
                    if let Some(sig) = signature {
                        *existing = sig;
                    }
                } else {
                    blocks.push(ResponseContentBlock::Thinking {
                        thinking: text,
                        signature: signature.unwrap_or_default(),
                    });
                }
            }
            Part::Text(text) => {
                if let Some(ResponseContentBlock::Text { text: existing }) = blocks.last_mut() {
                    existing.push_str(&text);
                } else {
                    blocks.push(ResponseContentBlock::Text { text });
                }
            }
            Part::FunctionCall { call, .. } => blocks.push(ResponseContentBlock::ToolUse {
                id: mint_id("toolu_"),
                name: tool_names.decode(&call.name),
                input: call.args,
            }),
            Part::InlineData { .. } | Part::FunctionResponse(_) => {}
        }
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelResolver;
    use crate::translate::anthropic_types::MessagesRequest;
    use crate::translate::openai_types::ChatCompletionRequest;
    use crate::translate::request::{anthropic_to_internal, openai_to_internal};
    use crate::upstream::types::{FunctionCall, Role};
    use serde_json::json;

    fn internal(include_thoughts: bool) -> InternalRequest {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gemini-2.5-flash",
            "messages": [{"role": "user", "content": "hi"}],
            "include_thoughts": include_thoughts,
            "reasoning_effort": "low"
        }))
        .unwrap();
        openai_to_internal(&req, &ModelResolver::default()).unwrap()
    }

    fn upstream(value: serde_json::Value) -> GenerateContentResponse {
        serde_json::from_value(value).unwrap()
    }

    fn call_part(name: &str) -> Part {
        Part::FunctionCall {
            call: FunctionCall {
                name: name.to_string(),
                args: json!({"q": "x"}),
                id: None,
            },
            signature: Some("sig".to_string()),
        }
    }

    #[test]
    fn test_openai_text_and_reasoning() {
        let acc = ResponseAccumulator::from_response(upstream(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "think ", "thought": true},
                    {"text": "more", "thought": true},
                    {"text": "Hello "},
                    {"text": "world"}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 7, "totalTokenCount": 12, "thoughtsTokenCount": 3}
        })));
        let resp = acc.into_openai(&internal(true));

        assert!(resp.id.starts_with("chatcmpl-"));
        assert_eq!(resp.id.len(), "chatcmpl-".len() + 24);
        assert_eq!(resp.model, "gemini-2.5-flash");
        let msg = &resp.choices[0].message;
        assert_eq!(msg.content.as_deref(), Some("Hello world"));
        assert_eq!(msg.reasoning_content.as_deref(), Some("think more"));
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("stop"));

        let usage = resp.usage.unwrap();
        assert_eq!(usage.total_tokens, 12);
        assert_eq!(usage.completion_tokens_details.unwrap().reasoning_tokens, 3);
        assert!(usage.prompt_tokens_details.is_none());
    }

    #[test]
    fn test_reasoning_hidden_unless_requested() {
        let acc = ResponseAccumulator::from_response(upstream(json!({
            "candidates": [{"content": {"parts": [
                {"text": "secret", "thought": true},
                {"text": "answer"}
            ]}}]
        })));
        let resp = acc.into_openai(&internal(false));
        assert!(resp.choices[0].message.reasoning_content.is_none());
        assert!(resp.usage.is_none());
    }

    #[test]
    fn test_tool_calls_force_finish_reason() {
        let mut acc = ResponseAccumulator::default();
        acc.push(GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(CandidateContent {
                    role: None,
                    parts: vec![call_part("lookup")],
                }),
                finish_reason: Some("STOP".to_string()),
            }],
            usage_metadata: None,
        });
        let req = internal(false);
        let resp = acc.clone().into_openai(&req);
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("tool_calls"));
        let calls = resp.choices[0].message.tool_calls.as_ref().unwrap();
        assert!(calls[0].id.starts_with("call_"));
        assert_eq!(calls[0].function.arguments, r#"{"q":"x"}"#);
        assert_eq!(calls[0].thought_signature.as_deref(), Some("sig"));
        assert!(resp.choices[0].message.content.is_none());

        let msg = acc.into_anthropic(&req);
        assert_eq!(msg.stop_reason.as_deref(), Some("tool_use"));
        match &msg.content[0] {
            ResponseContentBlock::ToolUse { id, name, input } => {
                assert!(id.starts_with("toolu_"));
                assert_eq!(name, "lookup");
                assert_eq!(input["q"], "x");
            }
            other => panic!("expected tool_use, got {other:?}"),
        }
    }

    fn two_call_reply() -> ResponseAccumulator {
        ResponseAccumulator::from_response(upstream(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "Checking both."},
                    {"functionCall": {"name": "t_2fa_check", "args": {"user": "bob"}}, "thoughtSignature": "sig"},
                    {"functionCall": {"name": "lookup", "args": {"q": "x"}}}
                ]},
                "finishReason": "STOP"
            }]
        })))
    }

    /// Name, args and id of every function call in the turn.
    fn calls(parts: &[Part]) -> Vec<(String, serde_json::Value, Option<String>)> {
        parts
            .iter()
            .filter_map(|p| match p {
                Part::FunctionCall { call, .. } => {
                    Some((call.name.clone(), call.args.clone(), call.id.clone()))
                }
                _ => None,
            })
            .collect()
    }

    fn result_ids(parts: &[Part]) -> Vec<(String, Option<String>)> {
        parts
            .iter()
            .filter_map(|p| match p {
                Part::FunctionResponse(r) => Some((r.name.clone(), r.id.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_openai_reply_replays_as_same_turns() {
        let tools = json!([
            {"type": "function", "function": {"name": "2fa_check", "parameters": {"type": "object"}}},
            {"type": "function", "function": {"name": "lookup", "parameters": {"type": "object"}}}
        ]);
        let first: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gemini-2.5-flash",
            "messages": [{"role": "user", "content": "check both"}],
            "tools": tools
        }))
        .unwrap();
        let req = openai_to_internal(&first, &ModelResolver::default()).unwrap();

        let reply = two_call_reply().into_openai(&req);
        let message = &reply.choices[0].message;
        let ids: Vec<String> = message
            .tool_calls
            .iter()
            .flatten()
            .map(|tc| tc.id.clone())
            .collect();
        assert_eq!(ids.len(), 2);

        let second: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gemini-2.5-flash",
            "messages": [
                {"role": "user", "content": "check both"},
                serde_json::to_value(message).unwrap(),
                {"role": "tool", "tool_call_id": ids[0], "content": "ok"},
                {"role": "tool", "tool_call_id": ids[1], "content": "found"}
            ],
            "tools": tools
        }))
        .unwrap();
        let again = openai_to_internal(&second, &ModelResolver::default()).unwrap();
        let contents = &again.request.contents;

        assert_eq!(
            contents.iter().map(|c| c.role).collect::<Vec<_>>(),
            vec![Role::User, Role::Model, Role::User]
        );
        assert_eq!(contents[1].parts[0], Part::text("Checking both."));
        assert_eq!(
            calls(&contents[1].parts),
            vec![
                ("t_2fa_check".to_string(), json!({"user": "bob"}), Some(ids[0].clone())),
                ("lookup".to_string(), json!({"q": "x"}), Some(ids[1].clone())),
            ]
        );
        match &contents[1].parts[1] {
            Part::FunctionCall { signature, .. } => assert_eq!(signature.as_deref(), Some("sig")),
            other => panic!("expected function call, got {other:?}"),
        }
        assert_eq!(
            result_ids(&contents[2].parts),
            vec![
                ("t_2fa_check".to_string(), Some(ids[0].clone())),
                ("lookup".to_string(), Some(ids[1].clone())),
            ]
        );
    }

    #[test]
    fn test_anthropic_reply_replays_as_same_turns() {
        let tools = json!([
            {"name": "2fa_check", "input_schema": {"type": "object"}},
            {"name": "lookup", "input_schema": {"type": "object"}}
        ]);
        let first: MessagesRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 1024,
            "messages": [{"role": "user", "content": "check both"}],
            "tools": tools
        }))
        .unwrap();
        let req = anthropic_to_internal(&first, &ModelResolver::default()).unwrap();

        let reply = two_call_reply().into_anthropic(&req);
        let ids: Vec<String> = reply
            .content
            .iter()
            .filter_map(|b| match b {
                ResponseContentBlock::ToolUse { id, .. } => Some(id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(ids.len(), 2);

        let second: MessagesRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 1024,
            "messages": [
                {"role": "user", "content": "check both"},
                {"role": "assistant", "content": serde_json::to_value(&reply.content).unwrap()},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": ids[0], "content": "ok"},
                    {"type": "tool_result", "tool_use_id": ids[1], "content": "found"}
                ]}
            ],
            "tools": tools
        }))
        .unwrap();
        let again = anthropic_to_internal(&second, &ModelResolver::default()).unwrap();
        let contents = &again.request.contents;

        assert_eq!(
            contents.iter().map(|c| c.role).collect::<Vec<_>>(),
            vec![Role::User, Role::Model, Role::User]
        );
        assert_eq!(contents[1].parts[0], Part::text("Checking both."));
        assert_eq!(
            calls(&contents[1].parts),
            vec![
                ("t_2fa_check".to_string(), json!({"user": "bob"}), Some(ids[0].clone())),
                ("lookup".to_string(), json!({"q": "x"}), Some(ids[1].clone())),
            ]
        );
        assert_eq!(
            result_ids(&contents[2].parts),
            vec![
                ("t_2fa_check".to_string(), Some(ids[0].clone())),
                ("lookup".to_string(), Some(ids[1].clone())),
            ]
        );
    }

    #[test]
    fn test_finish_reason_tables() {
        assert_eq!(openai_finish_reason(Some("MAX_TOKENS"), false), "length");
        assert_eq!(openai_finish_reason(Some("SAFETY"), false), "content_filter");
        assert_eq!(openai_finish_reason(Some("RECITATION"), false), "content_filter");
        assert_eq!(openai_finish_reason(Some("BLOCKLIST"), false), "content_filter");
        assert_eq!(
            openai_finish_reason(Some("PROHIBITED_CONTENT"), false),
            "content_filter"
        );
        assert_eq!(openai_finish_reason(Some("SPII"), false), "content_filter");
        assert_eq!(openai_finish_reason(Some("OTHER"), false), "stop");
        assert_eq!(openai_finish_reason(None, false), "stop");
        assert_eq!(anthropic_stop_reason(Some("MAX_TOKENS"), false), "max_tokens");
        assert_eq!(anthropic_stop_reason(Some("SAFETY"), false), "end_turn");
        assert_eq!(anthropic_stop_reason(Some("STOP"), true), "tool_use");
    }

    #[test]
    fn test_anthropic_blocks_merge_in_order() {
        let mut acc = ResponseAccumulator::default();
        for part in [
            Part::thought("a", None),
            Part::thought("b", Some("sig-b".to_string())),
            Part::text("x"),
            Part::text("y"),
            call_part("f"),
            Part::text("z"),
        ] {
            acc.push(GenerateContentResponse {
                candidates: vec![Candidate {
                    content: Some(CandidateContent {
                        role: None,
                        parts: vec![part],
                    }),
                    finish_reason: None,
                }],
                usage_metadata: Some(UsageMetadata {
                    prompt_token_count: Some(10),
                    candidates_token_count: Some(4),
                    ..Default::default()
                }),
            });
        }
        let msg = acc.into_anthropic(&internal(true));
        assert_eq!(
            msg.content[0],
            ResponseContentBlock::Thinking {
                thinking: "ab".to_string(),
                signature: "sig-b".to_string()
            }
        );
        assert_eq!(msg.content[1], ResponseContentBlock::Text { text: "xy".to_string() });
        assert!(matches!(msg.content[2], ResponseContentBlock::ToolUse { .. }));
        assert_eq!(msg.content[3], ResponseContentBlock::Text { text: "z".to_string() });
        assert_eq!(msg.usage.input_tokens, 10);
        assert_eq!(msg.usage.output_tokens, 4);
        assert!(msg.id.starts_with("msg_"));
    }

    #[test]
    fn test_empty_anthropic_reply_has_one_block() {
        let msg = ResponseAccumulator::default().into_anthropic(&internal(false));
        assert_eq!(msg.content, vec![ResponseContentBlock::Text { text: String::new() }]);
        assert_eq!(msg.stop_reason.as_deref(), Some("end_turn"));
    }

    #[test]
    fn test_replay_keeps_part_order() {
        let acc = ResponseAccumulator::from_response(upstream(json!({
            "candidates": [{"content": {"parts": [{"text": "a"}, {"text": "b"}]}, "finishReason": "MAX_TOKENS"}],
            "usageMetadata": {"candidatesTokenCount": 2}
        })));
        let chunks = acc.replay();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].parts(), &[Part::text("a")]);
        assert_eq!(chunks[1].parts(), &[Part::text("b")]);
        assert_eq!(chunks[2].finish_reason(), Some("MAX_TOKENS"));
        assert_eq!(chunks[2].usage_metadata.unwrap().candidates_token_count, Some(2));
    }

    #[test]
    fn test_collect_stream() {
        let chunks: Vec<Result<GenerateContentResponse>> = vec![
            Ok(upstream(json!({"candidates": [{"content": {"parts": [{"text": "he"}]}}]}))),
            Ok(upstream(json!({"candidates": [{"content": {"parts": [{"text": "llo"}]}, "finishReason": "STOP"}]}))),
        ];
        let stream: ChunkStream = Box::pin(futures::stream::iter(chunks));
        let acc = tokio_test::block_on(ResponseAccumulator::collect(stream)).unwrap();
        assert_eq!(acc.parts(), &[Part::text("he"), Part::text("llo")]);
        assert_eq!(acc.finish_reason(), Some("STOP"));
    }
}
