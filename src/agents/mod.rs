pub mod model;
pub mod registry;
pub mod suggest;

pub use model::{Agent, AgentStatus, StaleAssignment};
pub use registry::{AgentRegistry, SyncOutcome};
pub use suggest::{ScoreBreakdown, SuggestedAgent};
