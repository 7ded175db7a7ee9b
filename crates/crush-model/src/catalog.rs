// SPDX-License-Identifier: Apache-2.0
//! Static metadata for known models: context window and output token limits.
//!
//! The core depends on a model provider only through the [`crate::ModelProvider`]
//! trait boundary (§1 of the runtime spec treats concrete provider wire formats
//! as external); this catalog exists so the agent loop's compaction logic
//! (`crush_core::compact`) can size a session's usable input budget without
//! a live round-trip to the provider.

use serde::{Deserialize, Serialize};

/// Metadata for a single model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelCatalogEntry {
    /// Provider-scoped model identifier (e.g. "claude-opus-4-5", "gpt-4o")
    pub id: String,
    /// Human-readable display name
    pub name: String,
    /// Provider identifier: "anthropic" | "openai" | "mock"
    pub provider: String,
    /// Total context window in tokens (input + output)
    pub context_window: u32,
    /// Maximum output tokens per completion
    pub max_output_tokens: u32,
}

/// Return all entries from the bundled static catalog.
pub fn static_catalog() -> Vec<ModelCatalogEntry> {
    vec![
        ModelCatalogEntry {
            id: "claude-opus-4-5".into(),
            name: "Claude Opus 4.5".into(),
            provider: "anthropic".into(),
            context_window: 200_000,
            max_output_tokens: 8_192,
        },
        ModelCatalogEntry {
            id: "claude-sonnet-4-5".into(),
            name: "Claude Sonnet 4.5".into(),
            provider: "anthropic".into(),
            context_window: 200_000,
            max_output_tokens: 8_192,
        },
        ModelCatalogEntry {
            id: "gpt-4o".into(),
            name: "GPT-4o".into(),
            provider: "openai".into(),
            context_window: 128_000,
            max_output_tokens: 16_384,
        },
        ModelCatalogEntry {
            id: "mock".into(),
            name: "Mock".into(),
            provider: "mock".into(),
            context_window: 32_000,
            max_output_tokens: 4_096,
        },
    ]
}

/// Look up a single model by provider and id (or name).
pub fn lookup(provider: &str, model_id: &str) -> Option<ModelCatalogEntry> {
    static_catalog()
        .into_iter()
        .find(|e| e.provider == provider && (e.id == model_id || e.name == model_id))
}

/// Look up the context window for a model, falling back to `default`.
pub fn context_window(provider: &str, model_id: &str, default: u32) -> u32 {
    lookup(provider, model_id)
        .map(|e| e.context_window)
        .unwrap_or(default)
}

/// Look up the max output tokens for a model, falling back to `default`.
pub fn max_output_tokens(provider: &str, model_id: &str, default: u32) -> u32 {
    lookup(provider, model_id)
        .map(|e| e.max_output_tokens)
        .unwrap_or(default)
}

// ── Unit tests ────────────────────────────────────────────────────────────────
