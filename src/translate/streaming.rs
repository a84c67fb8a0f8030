//! State machines that re-frame upstream stream chunks for each caller format.
//!
//! The upstream emits a flat sequence of parts. Anthropic clients expect
//! content blocks with explicit open/delta/close framing, OpenAI clients
//! expect completion-chunk deltas. Each translator is fed chunks one at a
//! time through `process` and closed with `finish`.

use serde_json::json;

use super::anthropic_types::{
    Delta, DeltaUsage, MessageDeltaBody, MessageStartBody, ResponseContentBlock, StreamEvent,
    Usage,
};
use super::openai_types::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta, ChunkToolCall, ChunkToolCallFunction,
};
use super::request::{InternalRequest, ToolNames};
use super::response::{anthropic_stop_reason, mint_id, openai_finish_reason, openai_usage};
use crate::upstream::types::{GenerateContentResponse, Part, UsageMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Thinking,
    Text,
}

/// Translates upstream chunks into Anthropic SSE events.
///
/// Usage:
///   let mut translator = AnthropicStreamTranslator::new(&internal);
///   for chunk in upstream_chunks {
///       let events = translator.process(&chunk);
///       // send each event as SSE
///   }
///   let final_events = translator.finish();
#[derive(Debug)]
pub struct AnthropicStreamTranslator {
    model: String,
    msg_id: String,
    include_thoughts: bool,
    tool_names: ToolNames,
    started: bool,
    finished: bool,
    index: usize,
    open: Option<BlockKind>,
    saw_tool_call: bool,
    finish_reason: Option<String>,
    usage: Option<UsageMetadata>,
}

impl AnthropicStreamTranslator {
    pub fn new(req: &InternalRequest) -> Self {
        Self {
            model: req.requested_model.clone(),
            msg_id: mint_id("msg_"),
            include_thoughts: req.include_thoughts,
            tool_names: req.tool_names.clone(),
            started: false,
            finished: false,
            index: 0,
            open: None,
            saw_tool_call: false,
            finish_reason: None,
            usage: None,
        }
    }

    /// Process one upstream chunk, returning zero or more events.
    pub fn process(&mut self, chunk: &GenerateContentResponse) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }

        if let Some(usage) = chunk.usage_metadata {
            self.usage = Some(usage);
        }
        if let Some(reason) = chunk.finish_reason() {
            self.finish_reason = Some(reason.to_string());
        }

        let mut events = Vec::new();
        if !self.started {
            events.push(self.message_start());
            self.started = true;
        }

        for part in chunk.parts() {
            match part {
                Part::Thought { text, signature } => {
                    if !self.include_thoughts {
                        continue;
                    }
                    self.open_block(BlockKind::Thinking, &mut events);
                    if !text.is_empty() {
                        events.push(StreamEvent::ContentBlockDelta {
                            index: self.index,
                            delta: Delta::ThinkingDelta {
                                thinking: text.clone(),
                            },
                        });
                    }
                    if let Some(signature) = signature.as_ref().filter(|s| !s.is_empty()) {
                        events.push(StreamEvent::ContentBlockDelta {
                            index: self.index,
                            delta: Delta::SignatureDelta {
                                signature: signature.clone(),
                            },
                        });
                    }
                }
                Part::Text(text) => {
                    if text.is_empty() {
                        continue;
                    }
                    self.open_block(BlockKind::Text, &mut events);
                    events.push(StreamEvent::ContentBlockDelta {
                        index: self.index,
                        delta: Delta::TextDelta { text: text.clone() },
                    });
                }
                Part::FunctionCall { call, .. } => {
                    self.close_block(&mut events);
                    self.saw_tool_call = true;
                    // One start/delta/stop triple per call keeps the JSON whole.
                    events.push(StreamEvent::ContentBlockStart {
                        index: self.index,
                        content_block: ResponseContentBlock::ToolUse {
                            id: mint_id("toolu_"),
                            name: self.tool_names.decode(&call.name),
                            input: json!({}),
                        },
                    });
                    events.push(StreamEvent::ContentBlockDelta {
                        index: self.index,
                        delta: Delta::InputJsonDelta {
                            partial_json: call.args.to_string(),
                        },
                    });
                    events.push(StreamEvent::ContentBlockStop { index: self.index });
                    self.index += 1;
                }
                Part::InlineData { .. } | Part::FunctionResponse(_) => {}
            }
        }

        events
    }

    /// Call when the upstream stream ends to close blocks and the message.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut events = Vec::new();
        if !self.started {
            events.push(self.message_start());
            self.started = true;
        }
        self.close_block(&mut events);

        let stop_reason = anthropic_stop_reason(self.finish_reason.as_deref(), self.saw_tool_call);
        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(stop_reason.to_string()),
                stop_sequence: None,
            },
            usage: DeltaUsage {
                output_tokens: self
                    .usage
                    .and_then(|u| u.candidates_token_count)
                    .unwrap_or(0),
            },
        });
        events.push(StreamEvent::MessageStop);
        events
    }

    fn open_block(&mut self, kind: BlockKind, events: &mut Vec<StreamEvent>) {
        if self.open == Some(kind) {
            return;
        }
        self.close_block(events);
        let content_block = match kind {
            BlockKind::Thinking => ResponseContentBlock::Thinking {
                thinking: String::new(),
                signature: String::new(),
            },
            BlockKind::Text => ResponseContentBlock::Text {
                text: String::new(),
            },
        };
        events.push(StreamEvent::ContentBlockStart {
            index: self.index,
            content_block,
        });
        self.open = Some(kind);
    }

    fn close_block(&mut self, events: &mut Vec<StreamEvent>) {
        if self.open.take().is_some() {
            events.push(StreamEvent::ContentBlockStop { index: self.index });
            self.index += 1;
        }
    }

    fn message_start(&self) -> StreamEvent {
        StreamEvent::MessageStart {
            message: MessageStartBody {
                id: self.msg_id.clone(),
                response_type: "message".to_string(),
                role: "assistant".to_string(),
                content: Vec::new(),
                model: self.model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage: Usage {
                    input_tokens: self
                        .usage
                        .and_then(|u| u.prompt_token_count)
                        .unwrap_or(0),
                    output_tokens: 0,
                    cache_read_input_tokens: None,
                },
            },
        }
    }
}

/// Translates upstream chunks into OpenAI completion chunks.
#[derive(Debug)]
pub struct OpenAiStreamTranslator {
    id: String,
    created: i64,
    model: String,
    include_thoughts: bool,
    tool_names: ToolNames,
    role_sent: bool,
    tool_calls: u64,
    finished: bool,
    finish_reason: Option<String>,
    usage: Option<UsageMetadata>,
}

impl OpenAiStreamTranslator {
    pub fn new(req: &InternalRequest) -> Self {
        Self {
            id: mint_id("chatcmpl-"),
            created: chrono::Utc::now().timestamp(),
            model: req.requested_model.clone(),
            include_thoughts: req.include_thoughts,
            tool_names: req.tool_names.clone(),
            role_sent: false,
            tool_calls: 0,
            finished: false,
            finish_reason: None,
            usage: None,
        }
    }

    pub fn process(&mut self, chunk: &GenerateContentResponse) -> Vec<ChatCompletionChunk> {
        if self.finished {
            return Vec::new();
        }

        if let Some(usage) = chunk.usage_metadata {
            self.usage = Some(usage);
        }
        if let Some(reason) = chunk.finish_reason() {
            self.finish_reason = Some(reason.to_string());
        }

        let mut out = Vec::new();
        for part in chunk.parts() {
            let delta = match part {
                Part::Text(text) if !text.is_empty() => ChunkDelta {
                    content: Some(text.clone()),
                    ..Default::default()
                },
                Part::Thought { text, .. } if self.include_thoughts && !text.is_empty() => {
                    ChunkDelta {
                        reasoning_content: Some(text.clone()),
                        ..Default::default()
                    }
                }
                Part::FunctionCall { call, signature } => {
                    let index = self.tool_calls;
                    self.tool_calls += 1;
                    ChunkDelta {
                        tool_calls: Some(vec![ChunkToolCall {
                            index,
                            id: Some(mint_id("call_")),
                            call_type: Some("function".to_string()),
                            function: Some(ChunkToolCallFunction {
                                name: Some(self.tool_names.decode(&call.name)),
                                arguments: Some(call.args.to_string()),
                            }),
                            thought_signature: signature.clone(),
                        }]),
                        ..Default::default()
                    }
                }
                _ => continue,
            };
            out.push(self.chunk(delta, None));
        }
        out
    }

    /// The closing chunk carrying the finish reason and usage.
    pub fn finish(&mut self) -> Vec<ChatCompletionChunk> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let reason = openai_finish_reason(self.finish_reason.as_deref(), self.tool_calls > 0);
        let mut last = self.chunk(ChunkDelta::default(), Some(reason));
        last.usage = self.usage.as_ref().map(openai_usage);
        vec![last]
    }

    fn chunk(&mut self, mut delta: ChunkDelta, finish_reason: Option<&str>) -> ChatCompletionChunk {
        if !self.role_sent && finish_reason.is_none() {
            delta.role = Some("assistant".to_string());
            self.role_sent = true;
        }
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish_reason.map(str::to_string),
            }],
            usage: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelResolver;
    use crate::translate::anthropic_types::MessagesRequest;
    use crate::translate::openai_types::ChatCompletionRequest;
    use crate::translate::request::{anthropic_to_internal, openai_to_internal};
    use crate::upstream::types::{Candidate, CandidateContent, FunctionCall};

    fn anthropic_request(thinking: bool) -> InternalRequest {
        let mut body = json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 4096,
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}]
        });
        if thinking {
            body["thinking"] = json!({"type": "enabled", "budget_tokens": 1024});
        }
        let req: MessagesRequest = serde_json::from_value(body).unwrap();
        anthropic_to_internal(&req, &ModelResolver::default()).unwrap()
    }

    fn openai_request() -> InternalRequest {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gemini-2.5-flash",
            "stream": true,
            "include_thoughts": true,
            "reasoning_effort": "low",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();
        openai_to_internal(&req, &ModelResolver::default()).unwrap()
    }

    fn chunk(parts: Vec<Part>, finish: Option<&str>) -> GenerateContentResponse {
        GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(CandidateContent { role: None, parts }),
                finish_reason: finish.map(str::to_string),
            }],
            usage_metadata: None,
        }
    }

    fn call(name: &str) -> Part {
        Part::FunctionCall {
            call: FunctionCall {
                name: name.to_string(),
                args: json!({"path": "/"}),
                id: None,
            },
            signature: None,
        }
    }

    #[test]
    fn test_thinking_then_text_framing() {
        let mut t = AnthropicStreamTranslator::new(&anthropic_request(true));
        let mut events = Vec::new();
        events.extend(t.process(&chunk(vec![Part::thought("x", None)], None)));
        events.extend(t.process(&chunk(vec![Part::thought("y", None)], None)));
        events.extend(t.process(&chunk(vec![Part::text("hello")], Some("STOP"))));
        events.extend(t.finish());

        assert!(matches!(events[0], StreamEvent::MessageStart { .. }));
        let rest = &events[1..];
        assert_eq!(
            rest,
            &[
                StreamEvent::ContentBlockStart {
                    index: 0,
                    content_block: ResponseContentBlock::Thinking {
                        thinking: String::new(),
                        signature: String::new(),
                    },
                },
                StreamEvent::ContentBlockDelta {
                    index: 0,
                    delta: Delta::ThinkingDelta { thinking: "x".to_string() },
                },
                StreamEvent::ContentBlockDelta {
                    index: 0,
                    delta: Delta::ThinkingDelta { thinking: "y".to_string() },
                },
                StreamEvent::ContentBlockStop { index: 0 },
                StreamEvent::ContentBlockStart {
                    index: 1,
                    content_block: ResponseContentBlock::Text { text: String::new() },
                },
                StreamEvent::ContentBlockDelta {
                    index: 1,
                    delta: Delta::TextDelta { text: "hello".to_string() },
                },
                StreamEvent::ContentBlockStop { index: 1 },
                StreamEvent::MessageDelta {
                    delta: MessageDeltaBody {
                        stop_reason: Some("end_turn".to_string()),
                        stop_sequence: None,
                    },
                    usage: DeltaUsage { output_tokens: 0 },
                },
                StreamEvent::MessageStop,
            ][..]
        );
    }

    #[test]
    fn test_thoughts_dropped_without_thinking() {
        let mut t = AnthropicStreamTranslator::new(&anthropic_request(false));
        let events = t.process(&chunk(vec![Part::thought("hidden", None), Part::text("ok")], None));
        assert_eq!(events.len(), 3); // message_start, text start, text delta
        assert!(matches!(
            events[1],
            StreamEvent::ContentBlockStart {
                content_block: ResponseContentBlock::Text { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_signature_delta_emitted() {
        let mut t = AnthropicStreamTranslator::new(&anthropic_request(true));
        let events = t.process(&chunk(
            vec![Part::thought("", Some("sig-1".to_string()))],
            None,
        ));
        assert_eq!(
            events.last(),
            Some(&StreamEvent::ContentBlockDelta {
                index: 0,
                delta: Delta::SignatureDelta {
                    signature: "sig-1".to_string()
                },
            })
        );
    }

    #[test]
    fn test_tool_call_is_one_triple_and_forces_tool_use() {
        let mut t = AnthropicStreamTranslator::new(&anthropic_request(false));
        let mut events = t.process(&chunk(vec![Part::text("Looking."), call("ls")], Some("STOP")));
        events.extend(t.finish());

        let names: Vec<&str> = events.iter().map(StreamEvent::event_name).collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert!(matches!(
            &events[5],
            StreamEvent::ContentBlockDelta { index: 1, delta: Delta::InputJsonDelta { partial_json } }
                if partial_json == r#"{"path":"/"}"#
        ));
        assert!(matches!(
            &events[7],
            StreamEvent::MessageDelta { delta, .. } if delta.stop_reason.as_deref() == Some("tool_use")
        ));
    }

    #[test]
    fn test_finish_without_chunks() {
        let mut t = AnthropicStreamTranslator::new(&anthropic_request(false));
        let events = t.finish();
        let names: Vec<&str> = events.iter().map(StreamEvent::event_name).collect();
        assert_eq!(names, vec!["message_start", "message_delta", "message_stop"]);
        assert!(t.finish().is_empty());
    }

    #[test]
    fn test_usage_reported_in_message_delta() {
        let mut t = AnthropicStreamTranslator::new(&anthropic_request(false));
        let mut last = chunk(vec![Part::text("a")], Some("MAX_TOKENS"));
        last.usage_metadata = Some(UsageMetadata {
            prompt_token_count: Some(3),
            candidates_token_count: Some(9),
            ..Default::default()
        });
        t.process(&last);
        let events = t.finish();
        assert!(matches!(
            &events[1],
            StreamEvent::MessageDelta { delta, usage }
                if delta.stop_reason.as_deref() == Some("max_tokens") && usage.output_tokens == 9
        ));
    }

    #[test]
    fn test_openai_chunks() {
        let mut t = OpenAiStreamTranslator::new(&openai_request());
        let mut chunks = t.process(&chunk(vec![Part::thought("plan", None)], None));
        chunks.extend(t.process(&chunk(vec![Part::text("Hi"), call("ls"), call("cat")], Some("STOP"))));
        chunks.extend(t.finish());

        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks[0].choices[0].delta.role.as_deref(), Some("assistant"));
        assert_eq!(chunks[0].choices[0].delta.reasoning_content.as_deref(), Some("plan"));
        assert!(chunks[1].choices[0].delta.role.is_none());
        assert_eq!(chunks[1].choices[0].delta.content.as_deref(), Some("Hi"));

        let second_call = &chunks[3].choices[0].delta.tool_calls.as_ref().unwrap()[0];
        assert_eq!(second_call.index, 1);
        assert_eq!(
            second_call.function.as_ref().unwrap().name.as_deref(),
            Some("cat")
        );

        let last = &chunks[4];
        assert_eq!(last.choices[0].finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(last.choices[0].delta, ChunkDelta::default());
        assert!(chunks.iter().all(|c| c.id == chunks[0].id));
        assert_eq!(last.model, "gemini-2.5-flash");
    }
}
