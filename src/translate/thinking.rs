//! Thinking directive resolution.
//!
//! Callers ask for reasoning in different ways: OpenAI clients send
//! `reasoning_effort`, `thinking_budget` or `include_thoughts`, Anthropic
//! clients send `thinking: {type, budget_tokens}`. Both are reduced to one
//! [`ThinkingDirective`] and then to the upstream [`ThinkingConfig`].

use crate::models::{is_claude_thinking, is_gemini25, is_gemini3};
use crate::upstream::types::{
    Content, GenerateContentRequest, GenerationConfig, Part, Role, ThinkingConfig, ThinkingLevel,
    SKIP_SIGNATURE,
};

use serde::{Deserialize, Serialize};

/// `max_output_tokens` must exceed the thinking budget by this much.
pub const THINKING_TOKEN_MARGIN: u32 = 4096;

/// Output cap assumed when the caller did not set one.
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    None,
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn budget(self) -> Option<u32> {
        match self {
            Self::None => None,
            Self::Low => Some(4096),
            Self::Medium => Some(8192),
            Self::High => Some(16384),
        }
    }

    pub fn level(self) -> Option<ThinkingLevel> {
        match self {
            Self::None => None,
            Self::Low => Some(ThinkingLevel::Low),
            Self::Medium => Some(ThinkingLevel::Medium),
            Self::High => Some(ThinkingLevel::High),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingDirective {
    Disabled,
    Budget(u32),
    Level(ThinkingLevel),
}

/// What an OpenAI-shape caller asked for.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThinkingRequest {
    pub effort: Option<ReasoningEffort>,
    pub budget: Option<u32>,
    pub include_thoughts: Option<bool>,
}

/// Thinking defaults for the public model names that imply a setting.
fn model_default(requested: &str) -> Option<ThinkingDirective> {
    let directive = match requested {
        "gemini-3-pro-high" => ThinkingDirective::Level(ThinkingLevel::High),
        "gemini-3-pro-medium" => ThinkingDirective::Level(ThinkingLevel::Medium),
        "gemini-3-pro-low" => ThinkingDirective::Level(ThinkingLevel::Low),
        "gemini-claude-sonnet-4-5-thinking" | "gemini-claude-opus-4-5-thinking" => {
            ThinkingDirective::Budget(16000)
        }
        "gemini-claude-sonnet-4-5-thinking-high" | "gemini-claude-opus-4-5-thinking-high" => {
            ThinkingDirective::Budget(32000)
        }
        "gemini-claude-sonnet-4-5-thinking-medium" | "gemini-claude-opus-4-5-thinking-medium" => {
            ThinkingDirective::Budget(16000)
        }
        "gemini-claude-sonnet-4-5-thinking-low" | "gemini-claude-opus-4-5-thinking-low" => {
            ThinkingDirective::Budget(4000)
        }
        _ => return None,
    };
    Some(directive)
}

/// Resolve an OpenAI-shape thinking request.
///
/// `requested` is the name the caller sent (defaults are keyed by it),
/// `upstream` the resolved id (which decides between budgets and levels).
pub fn resolve_openai(
    requested: &str,
    upstream: &str,
    request: ThinkingRequest,
) -> Option<ThinkingConfig> {
    let defaults = model_default(requested);
    if request.effort == Some(ReasoningEffort::None) && request.budget.is_none() && defaults.is_none()
    {
        return None;
    }

    let effort = request.effort.filter(|e| *e != ReasoningEffort::None);
    let directive = if is_gemini3(upstream) {
        match (request.budget, effort, defaults) {
            (Some(budget), _, _) => ThinkingDirective::Budget(budget),
            (None, Some(effort), _) => effort
                .level()
                .map_or(ThinkingDirective::Disabled, ThinkingDirective::Level),
            (None, None, Some(level @ ThinkingDirective::Level(_))) => level,
            _ => ThinkingDirective::Disabled,
        }
    } else if is_gemini25(upstream) || is_claude_thinking(upstream) {
        match (request.budget, effort, defaults) {
            (Some(budget), _, _) => ThinkingDirective::Budget(budget),
            (None, Some(effort), _) => effort
                .budget()
                .map_or(ThinkingDirective::Disabled, ThinkingDirective::Budget),
            (None, None, Some(budget @ ThinkingDirective::Budget(_))) => budget,
            _ => ThinkingDirective::Disabled,
        }
    } else {
        ThinkingDirective::Disabled
    };

    let include = request
        .include_thoughts
        .or_else(|| defaults.is_some().then_some(true));
    to_config(directive, include)
}

/// Resolve an Anthropic `thinking` object.
pub fn resolve_anthropic(enabled: bool, budget_tokens: Option<u32>) -> Option<ThinkingConfig> {
    if !enabled {
        return None;
    }
    let directive = budget_tokens.map_or(ThinkingDirective::Disabled, ThinkingDirective::Budget);
    to_config(directive, Some(true))
}

fn to_config(directive: ThinkingDirective, include_thoughts: Option<bool>) -> Option<ThinkingConfig> {
    let mut config = ThinkingConfig {
        include_thoughts,
        ..Default::default()
    };
    match directive {
        ThinkingDirective::Disabled => {}
        ThinkingDirective::Budget(n) => config.thinking_budget = Some(n),
        ThinkingDirective::Level(level) => config.thinking_level = Some(level),
    }
    (config != ThinkingConfig::default()).then_some(config)
}

/// Raise `max_output_tokens` so it clears the thinking budget.
pub fn apply_token_margin(generation: &mut GenerationConfig) {
    let Some(budget) = generation
        .thinking_config
        .as_ref()
        .and_then(|t| t.thinking_budget)
    else {
        return;
    };
    let max = generation
        .max_output_tokens
        .unwrap_or(DEFAULT_MAX_OUTPUT_TOKENS);
    if max <= budget {
        generation.max_output_tokens = Some(budget.saturating_add(THINKING_TOKEN_MARGIN));
    }
}

/// The conversation ends with a user turn carrying tool results.
pub fn in_tool_loop(contents: &[Content]) -> bool {
    contents.last().is_some_and(Content::is_tool_result)
}

/// The model's reply to the last real user message opened with a thought.
pub fn has_turn_start_thought(contents: &[Content]) -> bool {
    let Some(start) = contents
        .iter()
        .rposition(|c| c.role == Role::User && !c.is_tool_result())
    else {
        return false;
    };
    contents[start + 1..]
        .iter()
        .find(|c| c.role == Role::Model)
        .is_some_and(|c| c.parts.iter().any(|p| matches!(p, Part::Thought { .. })))
}

/// The last model turn made a function call carrying a genuine signature.
pub fn has_valid_signature(contents: &[Content]) -> bool {
    contents
        .iter()
        .rev()
        .find(|c| c.role == Role::Model)
        .is_some_and(|c| {
            c.parts.iter().any(|p| match p {
                Part::FunctionCall {
                    signature: Some(sig),
                    ..
                } => !sig.is_empty() && sig != SKIP_SIGNATURE,
                _ => false,
            })
        })
}

/// Thinking is only valid at the start of a turn. Resuming a tool loop with
/// no thought history for the current step cannot carry a directive.
pub fn should_suppress(contents: &[Content]) -> bool {
    in_tool_loop(contents) && !has_turn_start_thought(contents) && !has_valid_signature(contents)
}

/// Drop the thinking directive when [`should_suppress`] says so.
/// Returns whether anything was removed.
pub fn suppress_mid_loop(request: &mut GenerateContentRequest) -> bool {
    if request.generation_config.thinking_config.is_none() || !should_suppress(&request.contents) {
        return false;
    }
    tracing::debug!("Suppressing thinking directive while resuming a tool loop");
    request.generation_config.thinking_config = None;
    for part in request.contents.iter_mut().flat_map(|c| c.parts.iter_mut()) {
        if let Part::FunctionCall { signature, .. } = part {
            if signature.as_deref() == Some(SKIP_SIGNATURE) {
                *signature = None;
            }
        }
    }
    true
}
