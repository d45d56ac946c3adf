//! Seam to the AI model provider.
//!
//! The core never talks to a concrete model API: it is handed an
//! [`AIProvider`] trait object and treats it as an opaque
//! `(system prompt, user prompt) -> text` function. Conversation state lives
//! in the prompts the engine builds, not in the provider.

use async_trait::async_trait;
use std::error::Error;

/// Opaque AI completion provider.
///
/// Implementations wrap a concrete model client. Errors surface to whoever
/// initiated the call; the core never retries provider failures.
#[async_trait]
pub trait AIProvider: Send + Sync {
    /// Produce a completion for the given prompts.
    async fn call_ai(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, Box<dyn Error + Send + Sync>>;
}
