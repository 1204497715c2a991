pub mod channel;
pub mod llm;
pub mod progress;
pub mod prompts;
pub mod registry;
pub mod scheduler;
