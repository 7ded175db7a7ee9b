// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::{catalog::ModelCatalogEntry, CompletionRequest, ResponseEvent};

pub type ResponseStream = Pin<Box<dyn Stream<Item = anyhow::Result<ResponseEvent>> + Send>>;

/// The boundary the agent loop (C7) drives: a provider turns a flattened
/// message history plus tool schemas into a stream of `ResponseEvent`s.
/// Concrete production providers (Anthropic, OpenAI, ...) are external to
/// this crate; only the trait and a deterministic [`crate::mock::MockProvider`]
/// live here.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Human-readable provider name for status display.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Send a completion request and return a streaming response.
    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream>;

    /// Maximum output tokens for this provider/model combination.
    fn catalog_max_output_tokens(&self) -> Option<u32> {
        crate::catalog::lookup(self.name(), self.model_name()).map(|e| e.max_output_tokens)
    }

    /// Context window size for this provider/model combination.
    fn catalog_context_window(&self) -> Option<u32> {
        crate::catalog::lookup(self.name(), self.model_name()).map(|e| e.context_window)
    }

    /// List all models available from this provider.
    ///
    /// Default implementation returns only the static catalog entries for
    /// this provider; a live provider would override this to query an API.
    async fn list_models(&self) -> anyhow::Result<Vec<ModelCatalogEntry>> {
        let provider = self.name();
        Ok(crate::catalog::static_catalog()
            .into_iter()
            .filter(|e| e.provider == provider)
            .collect())
    }
}
