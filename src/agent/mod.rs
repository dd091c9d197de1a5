pub mod context;
#[path = "loop.rs"]
pub mod agent_loop;
pub mod subagent;
pub mod summarizer;

pub use agent_loop::AgentLoop;
pub use context::ContextManager;
pub use subagent::SubagentManager;
pub use summarizer::Summarizer;
