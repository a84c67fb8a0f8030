//! Translate OpenAI Chat Completions and Anthropic Messages requests into the
//! upstream `generateContent` request.
//!
//! Both formats go through a [`ConversationBuilder`], which owns the two
//! invariants of the canonical conversation: tool results learn their function
//! name from the call that produced them, and a run of tool results is sent
//! as a single user turn.

use std::collections::HashMap;

use serde_json::{json, Value};

use super::anthropic_types::{ContentBlock, ImageSource, MessagesRequest, Role as AnthropicRole};
use super::openai_types::{ChatCompletionRequest, ChatContent, ChatMessage, ContentPart};
use super::schema::sanitize_tool_schema;
use super::thinking::{self, ThinkingRequest};
use crate::error::{ProxyError, Result};
use crate::models::{is_claude_thinking, ModelFamily, ModelResolver};
use crate::upstream::types::{
    Content, FunctionCall, FunctionDeclaration, FunctionResponse, GenerateContentRequest,
    GenerationConfig, Part, Role, SystemInstruction, ToolDeclaration, SKIP_SIGNATURE,
};

const UNKNOWN_FUNCTION: &str = "unknown_function";
const TOOL_NAME_PREFIX: &str = "t_";

/// A caller request in canonical form, plus what the response side needs to
/// know about it.
#[derive(Debug, Clone)]
pub struct InternalRequest {
    /// Name the caller sent; echoed back in responses.
    pub requested_model: String,
    /// Upstream model id.
    pub model: String,
    pub request: GenerateContentRequest,
    pub tool_names: ToolNames,
    pub include_thoughts: bool,
    pub stream: bool,
    /// Serve a buffered call by collecting the streaming endpoint.
    pub collect_via_stream: bool,
}

impl InternalRequest {
    pub fn family(&self) -> ModelFamily {
        ModelFamily::of(&self.model)
    }

    /// The model only returns whole turns, so streams are buffered and replayed.
    pub fn buffers_stream(&self) -> bool {
        is_claude_thinking(&self.model)
    }
}

/// Tool names the upstream rejects get a prefix; the mapping is kept so
/// function calls can be reported under the caller's original name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolNames {
    renamed: HashMap<String, String>,
}

impl ToolNames {
    pub fn encode(&mut self, name: &str) -> String {
        if name.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
            return name.to_string();
        }
        let encoded = format!("{TOOL_NAME_PREFIX}{name}");
        self.renamed.insert(encoded.clone(), name.to_string());
        encoded
    }

    pub fn decode(&self, name: &str) -> String {
        self.renamed
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }
}

/// Accumulates canonical turns.
#[derive(Debug, Default)]
struct ConversationBuilder {
    contents: Vec<Content>,
    pending_results: Vec<Part>,
    call_names: HashMap<String, String>,
}

impl ConversationBuilder {
    fn record_call(&mut self, id: &str, name: &str) {
        self.call_names.insert(id.to_string(), name.to_string());
    }

    fn call_name(&self, id: &str) -> Option<&str> {
        self.call_names.get(id).map(String::as_str)
    }

    fn has_pending_results(&self) -> bool {
        !self.pending_results.is_empty()
    }

    /// Push a turn, flushing pending tool results ahead of it.
    fn push_turn(&mut self, role: Role, parts: Vec<Part>) {
        self.flush_results();
        if !parts.is_empty() {
            self.contents.push(Content { role, parts });
        }
    }

    fn push_result(&mut self, part: Part) {
        self.pending_results.push(part);
    }

    fn flush_results(&mut self) {
        if !self.pending_results.is_empty() {
            let parts = std::mem::take(&mut self.pending_results);
            self.contents.push(Content::user(parts));
        }
    }

    fn finish(mut self) -> Vec<Content> {
        self.flush_results();
        self.contents
    }
}

/// `{"result": ...}` with JSON content parsed when possible.
fn result_payload(content: &str) -> Value {
    let result = serde_json::from_str::<Value>(content).unwrap_or_else(|_| json!(content));
    json!({ "result": result })
}

/// Parse `data:<mime>;base64,<payload>`.
fn parse_data_uri(url: &str) -> Option<Part> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let mime_type = meta.strip_suffix(";base64")?;
    if mime_type.is_empty() {
        return None;
    }
    Some(Part::InlineData {
        mime_type: mime_type.to_string(),
        data: data.to_string(),
    })
}

fn tool_declarations(
    tools: impl Iterator<Item = (String, Option<String>, Option<Value>)>,
    names: &mut ToolNames,
) -> Option<Vec<ToolDeclaration>> {
    let function_declarations: Vec<FunctionDeclaration> = tools
        .map(|(name, description, parameters)| FunctionDeclaration {
            name: names.encode(&name),
            description,
            parameters: Some(sanitize_tool_schema(parameters.as_ref())),
        })
        .collect();
    (!function_declarations.is_empty()).then(|| {
        vec![ToolDeclaration {
            function_declarations,
        }]
    })
}

/// Drop the thinking directive mid tool loop and report whether thoughts survive.
///
/// Runs before the token margin so a suppressed budget never raises the limit.
fn finalize_thinking(request: &mut GenerateContentRequest, include_thoughts: bool) -> bool {
    if thinking::suppress_mid_loop(request) {
        return false;
    }
    include_thoughts
}

// ---------------------------------------------------------------------------
// OpenAI
// ---------------------------------------------------------------------------

/// Translate an OpenAI Chat Completions request.
pub fn openai_to_internal(
    req: &ChatCompletionRequest,
    resolver: &ModelResolver,
) -> Result<InternalRequest> {
    let model = resolver
        .openai(&req.model)
        .ok_or_else(|| ProxyError::ModelNotFound {
            model: req.model.clone(),
        })?;

    let thinking_config = thinking::resolve_openai(
        &req.model,
        &model,
        ThinkingRequest {
            effort: req.reasoning_effort,
            budget: req.thinking_budget,
            include_thoughts: req.include_thoughts,
        },
    );
    let thinking_enabled = thinking_config.is_some();
    let include_thoughts = req
        .include_thoughts
        .or(thinking_config.as_ref().and_then(|t| t.include_thoughts))
        .unwrap_or(false);

    let mut tool_names = ToolNames::default();
    let mut system = Vec::new();
    let mut builder = ConversationBuilder::default();

    for msg in &req.messages {
        match msg.role.as_str() {
            "system" | "developer" => {
                if let Some(text) = msg.content.as_ref().map(ChatContent::text) {
                    if !text.is_empty() {
                        system.push(text);
                    }
                }
            }
            "assistant" => {
                let parts = openai_assistant_parts(msg, &mut builder, &mut tool_names, thinking_enabled);
                builder.push_turn(Role::Model, parts);
            }
            "tool" => {
                let id = msg.tool_call_id.clone().unwrap_or_default();
                let name = builder
                    .call_name(&id)
                    .map(str::to_string)
                    .or_else(|| msg.name.clone())
                    .unwrap_or_else(|| UNKNOWN_FUNCTION.to_string());
                let content = msg.content.as_ref().map(ChatContent::text).unwrap_or_default();
                builder.push_result(Part::FunctionResponse(FunctionResponse {
                    name: tool_names.encode(&name),
                    response: result_payload(&content),
                    id: (!id.is_empty()).then_some(id),
                }));
            }
            other => {
                if other != "user" {
                    tracing::debug!(role = other, "Treating unknown message role as user");
                }
                builder.push_turn(Role::User, openai_user_parts(msg));
            }
        }
    }

    let tools = req.tools.as_ref().and_then(|tools| {
        tool_declarations(
            tools.iter().map(|t| {
                (
                    t.function.name.clone(),
                    t.function.description.clone(),
                    t.function.parameters.clone(),
                )
            }),
            &mut tool_names,
        )
    });

    let generation_config = GenerationConfig {
        temperature: req.temperature,
        top_p: req.top_p,
        max_output_tokens: req.max_output_tokens(),
        stop_sequences: req.stop.clone().map(|s| s.into_vec()),
        thinking_config,
        ..Default::default()
    };

    let mut request = GenerateContentRequest {
        contents: builder.finish(),
        system_instruction: (!system.is_empty()).then(|| SystemInstruction::text(system.join("\n\n"))),
        generation_config,
        tools,
        session_id: None,
    };
    let include_thoughts = finalize_thinking(&mut request, include_thoughts);
    if is_claude_thinking(&model) {
        thinking::apply_token_margin(&mut request.generation_config);
    }

    Ok(InternalRequest {
        requested_model: req.model.clone(),
        collect_via_stream: is_claude_thinking(&model) && include_thoughts,
        model,
        request,
        tool_names,
        include_thoughts,
        stream: req.stream.unwrap_or(false),
    })
}

fn openai_user_parts(msg: &ChatMessage) -> Vec<Part> {
    match &msg.content {
        Some(ChatContent::Text(text)) if !text.is_empty() => vec![Part::text(text.as_str())],
        Some(ChatContent::Parts(parts)) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } if !text.is_empty() => Some(Part::text(text.as_str())),
                ContentPart::Text { .. } => None,
                ContentPart::ImageUrl { image_url } => Some(
                    parse_data_uri(&image_url.url)
                        .unwrap_or_else(|| Part::text(format!("[Image: {}]", image_url.url))),
                ),
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn openai_assistant_parts(
    msg: &ChatMessage,
    builder: &mut ConversationBuilder,
    tool_names: &mut ToolNames,
    thinking_enabled: bool,
) -> Vec<Part> {
    let mut parts = Vec::new();
    if let Some(text) = msg.content.as_ref().map(ChatContent::text) {
        if !text.is_empty() {
            parts.push(Part::Text(text));
        }
    }

    for tc in msg.tool_calls.iter().flatten() {
        builder.record_call(&tc.id, &tc.function.name);
        let args = serde_json::from_str(&tc.function.arguments).unwrap_or_else(|e| {
            tracing::debug!(tool = %tc.function.name, error = %e, "Unparseable tool arguments");
            json!({})
        });
        let signature = tc
            .thought_signature
            .clone()
            .or_else(|| thinking_enabled.then(|| SKIP_SIGNATURE.to_string()));
        parts.push(Part::FunctionCall {
            call: FunctionCall {
                name: tool_names.encode(&tc.function.name),
                args,
                id: Some(tc.id.clone()),
            },
            signature,
        });
    }
    parts
}

// ---------------------------------------------------------------------------
// Anthropic
// ---------------------------------------------------------------------------

/// Translate an Anthropic Messages request.
pub fn anthropic_to_internal(
    req: &MessagesRequest,
    resolver: &ModelResolver,
) -> Result<InternalRequest> {
    let model = resolver
        .anthropic(&req.model)
        .ok_or_else(|| ProxyError::ModelNotFound {
            model: req.model.clone(),
        })?;

    let thinking_config = req
        .thinking
        .as_ref()
        .and_then(|t| thinking::resolve_anthropic(t.is_enabled(), t.budget_tokens));
    let thinking_enabled = thinking_config.is_some();

    let mut tool_names = ToolNames::default();
    let mut builder = ConversationBuilder::default();

    // Results may reference calls from any earlier message.
    for msg in &req.messages {
        for block in msg.content.blocks() {
            if let ContentBlock::ToolUse { id, name, .. } = block {
                builder.record_call(&id, &name);
            }
        }
    }

    for msg in &req.messages {
        let role = match msg.role {
            AnthropicRole::User => Role::User,
            AnthropicRole::Assistant => Role::Model,
        };
        let mut parts = Vec::new();

        for block in msg.content.blocks() {
            if let ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } = block
            {
                if !parts.is_empty() {
                    builder.push_turn(role, std::mem::take(&mut parts));
                }
                let name = builder
                    .call_name(&tool_use_id)
                    .unwrap_or(UNKNOWN_FUNCTION)
                    .to_string();
                let response = match content {
                    Some(Value::String(text)) => result_payload(&text),
                    Some(other) => json!({ "result": other }),
                    None => json!({ "result": "" }),
                };
                builder.push_result(Part::FunctionResponse(FunctionResponse {
                    name: tool_names.encode(&name),
                    response,
                    id: Some(tool_use_id),
                }));
                continue;
            }

            if builder.has_pending_results() {
                builder.flush_results();
            }
            match block {
                ContentBlock::Text { text } => {
                    if !text.is_empty() {
                        parts.push(Part::Text(text));
                    }
                }
                ContentBlock::Image { source } => parts.extend(image_part(&source)),
                ContentBlock::ToolUse { id, name, input } => parts.push(Part::FunctionCall {
                    call: FunctionCall {
                        name: tool_names.encode(&name),
                        args: input,
                        id: Some(id),
                    },
                    signature: thinking_enabled.then(|| SKIP_SIGNATURE.to_string()),
                }),
                ContentBlock::Thinking {
                    thinking,
                    signature,
                } => parts.push(Part::Thought {
                    text: thinking,
                    signature,
                }),
                ContentBlock::RedactedThinking { data } => parts.push(Part::Thought {
                    text: String::new(),
                    signature: Some(data),
                }),
                ContentBlock::ToolResult { .. } => {}
                ContentBlock::Unsupported => {
                    tracing::debug!("Dropping unsupported content block");
                }
            }
        }
        builder.push_turn(role, parts);
    }

    let tools = req.tools.as_ref().and_then(|tools| {
        tool_declarations(
            tools.iter().map(|t| {
                (
                    t.name.clone(),
                    t.description.clone(),
                    Some(t.input_schema.clone()),
                )
            }),
            &mut tool_names,
        )
    });

    let generation_config = GenerationConfig {
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: req.top_k,
        max_output_tokens: Some(req.max_tokens),
        stop_sequences: req.stop_sequences.clone().filter(|s| !s.is_empty()),
        thinking_config,
    };

    let system = req
        .system
        .as_ref()
        .map(|s| s.as_text())
        .filter(|s| !s.is_empty());
    let mut request = GenerateContentRequest {
        contents: builder.finish(),
        system_instruction: system.map(SystemInstruction::text),
        generation_config,
        tools,
        session_id: None,
    };
    let include_thoughts = finalize_thinking(&mut request, thinking_enabled);
    thinking::apply_token_margin(&mut request.generation_config);

    Ok(InternalRequest {
        requested_model: req.model.clone(),
        model,
        request,
        tool_names,
        include_thoughts,
        stream: req.stream.unwrap_or(false),
        collect_via_stream: include_thoughts,
    })
}

fn image_part(source: &ImageSource) -> Option<Part> {
    match (source.source_type.as_str(), &source.media_type, &source.data, &source.url) {
        ("base64", Some(mime_type), Some(data), _) => Some(Part::InlineData {
            mime_type: mime_type.clone(),
            data: data.clone(),
        }),
        ("url", _, _, Some(url)) => Some(Part::text(format!("[Image: {url}]"))),
        _ => {
            tracing::debug!(source = %source.source_type, "Dropping image without usable source");
            None
        }
    }
}
