//! Orchestration layer: planning, code generation, attempt execution and
//! the scheduling loop that ties them together.

pub mod backend;
pub mod executor;
pub mod planner;
pub mod pool;
pub mod scheduler;

pub use backend::{
    render_prompt, ChatMessage, CodeGenerator, FrozenInterface, GenerationRequest,
    OpenAiCompatible,
};
pub use executor::{AttemptExecutor, AttemptInput, ExecutorSettings};
pub use planner::{build_plan, render_plan};
pub use pool::{WorkerEvent, WorkerPool};
pub use scheduler::{Orchestrator, SchedulerEvent};
