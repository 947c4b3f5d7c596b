pub mod agent;
pub mod communication;
pub mod mindfill;
pub mod mode;
pub mod plan;
pub mod prompts;
pub mod reformat;
pub mod retrieval;

pub use agent::{Agent, AgentDeps, AgentVariant, MemoryState};
pub use communication::{
    AgentBuilder, Communication, CommunicationSettings, MessageSink,
};
pub use mindfill::FactRegistry;
pub use mode::Mode;
pub use plan::{PlanState, PlanStatus};
pub use prompts::{fill, PromptSet, SystemPrompts, ToolPrompts};
pub use reformat::JsonReformatter;
pub use retrieval::{keyword_set, RetrievalMemo, Stopwords};
