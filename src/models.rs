//! Model catalog, alias resolution and rate-limit family classification.
//!
//! Public callers use marketing names (`claude-opus-4-5`, `gemini-3-pro-preview`);
//! the upstream wants its own ids (`claude-opus-4-5-thinking`, `gemini-3-pro-high`).
//! Everything that maps one onto the other lives here.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;

/// Rate-limit bucket. Cool-downs are tracked per family, so an account that
/// is exhausted for Claude models can still serve Gemini ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    Claude,
    Gemini,
}

impl ModelFamily {
    /// `gpt-oss` shares the Claude quota upstream.
    pub fn of(model: &str) -> Self {
        if model.contains("claude") || model.contains("gpt-oss") {
            Self::Claude
        } else {
            Self::Gemini
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Gemini => "gemini",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CatalogModel {
    pub id: &'static str,
    pub display_name: &'static str,
    pub owned_by: &'static str,
    pub created_at: &'static str,
}

const CATALOG_CREATED: i64 = 1_700_000_000;

pub const OPENAI_CATALOG: &[CatalogModel] = &[
    CatalogModel {
        id: "gemini-3-pro-preview",
        display_name: "Gemini 3 Pro Preview",
        owned_by: "google",
        created_at: "2023-11-14T22:13:20Z",
    },
    CatalogModel {
        id: "gemini-2.5-flash",
        display_name: "Gemini 2.5 Flash",
        owned_by: "google",
        created_at: "2023-11-14T22:13:20Z",
    },
    CatalogModel {
        id: "gemini-2.5-flash-lite",
        display_name: "Gemini 2.5 Flash Lite",
        owned_by: "google",
        created_at: "2023-11-14T22:13:20Z",
    },
    CatalogModel {
        id: "claude-sonnet-4-5",
        display_name: "Claude Sonnet 4.5",
        owned_by: "anthropic",
        created_at: "2023-11-14T22:13:20Z",
    },
    CatalogModel {
        id: "claude-opus-4-5",
        display_name: "Claude Opus 4.5",
        owned_by: "anthropic",
        created_at: "2023-11-14T22:13:20Z",
    },
];

pub const ANTHROPIC_CATALOG: &[CatalogModel] = &[
    CatalogModel {
        id: "claude-sonnet-4-5",
        display_name: "Claude Sonnet 4.5",
        owned_by: "anthropic",
        created_at: "2025-09-29T00:00:00Z",
    },
    CatalogModel {
        id: "claude-opus-4-5",
        display_name: "Claude Opus 4.5",
        owned_by: "anthropic",
        created_at: "2025-11-01T00:00:00Z",
    },
];

/// Ids the upstream accepts as-is.
const UPSTREAM_MODELS: &[&str] = &[
    "claude-sonnet-4-5",
    "claude-sonnet-4-5-thinking",
    "claude-opus-4-5-thinking",
    "gpt-oss-120b-medium",
    "gemini-3-pro-high",
    "gemini-3-pro-low",
    "gemini-3-pro-image",
    "gemini-2.5-flash",
    "gemini-2.5-flash-thinking",
    "gemini-2.5-flash-lite",
];

const OPENAI_ALIASES: &[(&str, &str)] = &[
    ("gemini-2.5-computer-use-preview-10-2025", "rev19-uic3-1p"),
    ("gemini-3-pro-image-preview", "gemini-3-pro-image"),
    ("gemini-3-pro-preview", "gemini-3-pro-high"),
    ("gemini-claude-sonnet-4-5", "claude-sonnet-4-5"),
    ("gemini-claude-sonnet-4-5-thinking", "claude-sonnet-4-5-thinking"),
    ("gemini-claude-sonnet-4-5-thinking-high", "claude-sonnet-4-5-thinking"),
    ("gemini-claude-sonnet-4-5-thinking-medium", "claude-sonnet-4-5-thinking"),
    ("gemini-claude-sonnet-4-5-thinking-low", "claude-sonnet-4-5-thinking"),
    ("gemini-claude-opus-4-5-thinking", "claude-opus-4-5-thinking"),
    ("gemini-claude-opus-4-5-thinking-high", "claude-opus-4-5-thinking"),
    ("gemini-claude-opus-4-5-thinking-medium", "claude-opus-4-5-thinking"),
    ("gemini-claude-opus-4-5-thinking-low", "claude-opus-4-5-thinking"),
    ("claude-opus-4-5", "claude-opus-4-5-thinking"),
];

const ANTHROPIC_ALIASES: &[(&str, &str)] = &[
    ("claude-sonnet-4-5-20250929", "claude-sonnet-4-5"),
    ("claude-4-sonnet", "claude-sonnet-4-5"),
    ("claude-opus-4-5-20251101", "claude-opus-4-5"),
    ("claude-4-opus", "claude-opus-4-5"),
];

/// Opus is only served upstream in its thinking variant.
const ANTHROPIC_UPSTREAM: &[(&str, &str)] = &[("claude-opus-4-5", "claude-opus-4-5-thinking")];

fn lookup(table: &[(&'static str, &'static str)], key: &str) -> Option<&'static str> {
    table
        .iter()
        .find(|(from, _)| *from == key)
        .map(|(_, to)| *to)
}

/// Maps caller-facing model names onto upstream ids.
#[derive(Debug, Clone, Default)]
pub struct ModelResolver {
    overrides: HashMap<String, String>,
}

impl ModelResolver {
    pub fn new(overrides: HashMap<String, String>) -> Self {
        Self { overrides }
    }

    /// Upstream id for an OpenAI-shape request, or `None` for an unknown model.
    pub fn openai(&self, requested: &str) -> Option<String> {
        if let Some(target) = self.overrides.get(requested) {
            return Some(target.clone());
        }
        if let Some(target) = lookup(OPENAI_ALIASES, requested) {
            return Some(target.to_string());
        }
        let known = OPENAI_CATALOG.iter().any(|m| m.id == requested)
            || UPSTREAM_MODELS.contains(&requested);
        known.then(|| requested.to_string())
    }

    /// Upstream id for an Anthropic-shape request, or `None` for an unknown model.
    pub fn anthropic(&self, requested: &str) -> Option<String> {
        if let Some(target) = self.overrides.get(requested) {
            return Some(target.clone());
        }
        let resolved = lookup(ANTHROPIC_ALIASES, requested).unwrap_or(requested);
        if ANTHROPIC_CATALOG.iter().any(|m| m.id == resolved) {
            let upstream = lookup(ANTHROPIC_UPSTREAM, resolved).unwrap_or(resolved);
            return Some(upstream.to_string());
        }
        UPSTREAM_MODELS
            .contains(&resolved)
            .then(|| resolved.to_string())
    }
}

pub fn is_gemini3(model: &str) -> bool {
    model.contains("gemini-3")
}

pub fn is_gemini25(model: &str) -> bool {
    model.contains("gemini-2")
}

/// Claude thinking models only return whole turns, even from the streaming endpoint.
pub fn is_claude_thinking(model: &str) -> bool {
    model.contains("claude") && model.contains("thinking")
}

pub fn openai_model_list() -> Value {
    let data: Vec<Value> = OPENAI_CATALOG.iter().map(openai_model_object).collect();
    json!({ "object": "list", "data": data })
}

pub fn openai_model(id: &str) -> Option<Value> {
    OPENAI_CATALOG
        .iter()
        .find(|m| m.id == id)
        .map(openai_model_object)
}

fn openai_model_object(m: &CatalogModel) -> Value {
    json!({
        "id": m.id,
        "object": "model",
        "created": CATALOG_CREATED,
        "owned_by": m.owned_by,
    })
}

pub fn anthropic_model_list() -> Value {
    let data: Vec<Value> = ANTHROPIC_CATALOG
        .iter()
        .map(anthropic_model_object)
        .collect();
    json!({
        "data": data,
        "has_more": false,
        "first_id": ANTHROPIC_CATALOG.first().map(|m| m.id),
        "last_id": ANTHROPIC_CATALOG.last().map(|m| m.id),
    })
}

pub fn anthropic_model(id: &str) -> Option<Value> {
    let resolved = lookup(ANTHROPIC_ALIASES, id).unwrap_or(id);
    ANTHROPIC_CATALOG
        .iter()
        .find(|m| m.id == resolved)
        .map(anthropic_model_object)
}

fn anthropic_model_object(m: &CatalogModel) -> Value {
    json!({
        "id": m.id,
        "type": "model",
        "display_name": m.display_name,
        "created_at": m.created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_classification() {
        assert_eq!(ModelFamily::of("claude-sonnet-4-5"), ModelFamily::Claude);
        assert_eq!(
            ModelFamily::of("gemini-claude-opus-4-5-thinking"),
            ModelFamily::Claude
        );
        assert_eq!(ModelFamily::of("gpt-oss-120b-medium"), ModelFamily::Claude);
        assert_eq!(ModelFamily::of("gemini-2.5-flash"), ModelFamily::Gemini);
        assert_eq!(ModelFamily::of("something-else"), ModelFamily::Gemini);
    }

    #[test]
    fn test_openai_aliases() {
        let resolver = ModelResolver::default();
        assert_eq!(
            resolver.openai("gemini-3-pro-preview").as_deref(),
            Some("gemini-3-pro-high")
        );
        assert_eq!(
            resolver.openai("gemini-claude-sonnet-4-5-thinking-low").as_deref(),
            Some("claude-sonnet-4-5-thinking")
        );
        assert_eq!(
            resolver.openai("gemini-2.5-flash").as_deref(),
            Some("gemini-2.5-flash")
        );
        assert_eq!(resolver.openai("gpt-4o"), None);
    }

    #[test]
    fn test_anthropic_aliases() {
        let resolver = ModelResolver::default();
        assert_eq!(
            resolver.anthropic("claude-sonnet-4-5-20250929").as_deref(),
            Some("claude-sonnet-4-5")
        );
        assert_eq!(
            resolver.anthropic("claude-4-opus").as_deref(),
            Some("claude-opus-4-5-thinking")
        );
        assert_eq!(resolver.anthropic("claude-3-haiku"), None);
    }

    #[test]
    fn test_overrides_win() {
        let mut overrides = HashMap::new();
        overrides.insert("claude-sonnet-4-5".to_string(), "gemini-2.5-flash".to_string());
        let resolver = ModelResolver::new(overrides);
        assert_eq!(
            resolver.anthropic("claude-sonnet-4-5").as_deref(),
            Some("gemini-2.5-flash")
        );
        assert_eq!(
            resolver.openai("claude-sonnet-4-5").as_deref(),
            Some("gemini-2.5-flash")
        );
    }

    #[test]
    fn test_listings() {
        let list = openai_model_list();
        assert_eq!(list["object"], "list");
        assert_eq!(list["data"].as_array().unwrap().len(), OPENAI_CATALOG.len());
        assert_eq!(list["data"][0]["created"], 1_700_000_000);

        let list = anthropic_model_list();
        assert_eq!(list["has_more"], false);
        assert_eq!(list["first_id"], "claude-sonnet-4-5");
        assert_eq!(list["last_id"], "claude-opus-4-5");

        assert!(anthropic_model("claude-4-sonnet").is_some());
        assert!(openai_model("nope").is_none());
    }
}
