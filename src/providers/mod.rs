pub mod base;
pub mod openai;

pub use base::{LLMProvider, LLMResponse, ToolCallRequest};
pub use openai::OpenAIProvider;
