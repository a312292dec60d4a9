//! LLM integration for traceforge.
//!
//! The agent policy and the answer grader both talk to an OpenAI-compatible
//! chat-completions endpoint through the [`LlmProvider`] trait.
//!
//! ```ignore
//! use traceforge::llm::{GenerationRequest, LiteLlmClient, LlmProvider, Message};
//!
//! let client = LiteLlmClient::from_key_env(
//!     "https://openrouter.ai/api/v1",
//!     "OPENROUTER_API_KEY",
//!     "openai/gpt-4.1-mini",
//!     Duration::from_secs(120),
//! )?;
//! let response = client
//!     .generate(GenerationRequest::new("", vec![Message::user("Hello")]))
//!     .await?;
//! ```

pub mod litellm;

pub use litellm::{
    GenerationRequest, GenerationResponse, LiteLlmClient, LlmProvider, Message, Role, Usage,
};
