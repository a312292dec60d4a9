//! Agent scaffold: the policy, its prompts and the tools it can call.
//!
//! The scaffold provides the collaborators the episode executor drives:
//! 1. An [`AgentPolicy`] that picks the next tool call or a final answer
//! 2. A [`ToolRegistry`] of remote tools, resolved by name at startup
//! 3. A [`ToolInvoker`] that routes every call through the tool cache
//!
//! # Example
//!
//! ```ignore
//! use traceforge::scaffold::{AgentConfig, LlmAgent, ToolInvoker, ToolRegistry};
//!
//! let agent = LlmAgent::new(llm_client, AgentConfig::default(), &registry);
//! let invoker = ToolInvoker::new(Arc::new(registry), cache);
//! ```

pub mod agent_loop;
pub mod prompts;
pub mod tools;

pub use agent_loop::{
    extract_answer, AgentAction, AgentConfig, AgentContext, AgentError, AgentPolicy, AgentTurn,
    JsonResponseParser, LlmAgent, ResponseParser, ToolCall,
};
pub use prompts::{build_system_prompt, build_tool_prompt, AGENT_SYSTEM_PROMPT};
pub use tools::{HttpTool, Tool, ToolError, ToolInvocation, ToolInvoker, ToolRegistry};
